//! 테스트 공용 도우미 - 결정적 임베더, 가짜 refiner, 임시 스토어

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tempfile::TempDir;

use crate::embedding::{normalize_vector, EmbeddingProvider};
use crate::refine::TextRefiner;

use super::normalize::normalize_arabic;
use super::store::{KnowledgeRecord, KnowledgeStore, StoreSnapshot};

pub const FAKE_DIMENSION: usize = 64;

/// 단어 주머니(bag-of-words) 해싱 임베더 + 호출 횟수 spy
pub struct FakeEmbedder {
    calls: AtomicUsize,
    output_len: usize,
}

impl FakeEmbedder {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            output_len: FAKE_DIMENSION,
        }
    }

    /// `dimension()`과 다른 길이의 벡터를 돌려주는 고장난 임베더
    pub fn with_dimension_override(output_len: usize) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            output_len,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

/// 토큰 버킷: 문자 코드 합 mod 차원
pub fn bucket(token: &str) -> usize {
    token.chars().map(|c| c as usize).sum::<usize>() % FAKE_DIMENSION
}

#[async_trait]
impl EmbeddingProvider for FakeEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let mut vector = vec![0.0f32; self.output_len];
        for token in normalize_arabic(text).split_whitespace() {
            vector[bucket(token) % self.output_len] += 1.0;
        }
        Ok(normalize_vector(vector))
    }

    fn dimension(&self) -> usize {
        FAKE_DIMENSION
    }

    fn name(&self) -> &str {
        "fake-bow"
    }
}

/// 질문은 그대로, 답변은 "✅ " 접두어를 붙여 돌려줌
pub struct EchoRefiner {
    pub refine_calls: AtomicUsize,
    pub compose_calls: AtomicUsize,
}

impl EchoRefiner {
    pub fn new() -> Self {
        Self {
            refine_calls: AtomicUsize::new(0),
            compose_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl TextRefiner for EchoRefiner {
    async fn refine(&self, question: &str) -> Result<String> {
        self.refine_calls.fetch_add(1, Ordering::SeqCst);
        Ok(question.to_string())
    }

    async fn compose(&self, _question: &str, context: &str) -> Result<String> {
        self.compose_calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("✅ {}", context))
    }

    fn name(&self) -> &str {
        "echo"
    }
}

/// 고정된 재작성 결과를 돌려주는 refiner
pub struct RewritingRefiner(pub String);

#[async_trait]
impl TextRefiner for RewritingRefiner {
    async fn refine(&self, _question: &str) -> Result<String> {
        Ok(self.0.clone())
    }

    async fn compose(&self, _question: &str, context: &str) -> Result<String> {
        Ok(context.to_string())
    }

    fn name(&self) -> &str {
        "rewriting"
    }
}

/// 항상 실패하는 refiner
pub struct FailingRefiner;

#[async_trait]
impl TextRefiner for FailingRefiner {
    async fn refine(&self, _question: &str) -> Result<String> {
        anyhow::bail!("refiner unavailable")
    }

    async fn compose(&self, _question: &str, _context: &str) -> Result<String> {
        anyhow::bail!("refiner unavailable")
    }

    fn name(&self) -> &str {
        "failing"
    }
}

/// 응답하지 않는 refiner (타임아웃 검증용)
pub struct HangingRefiner;

#[async_trait]
impl TextRefiner for HangingRefiner {
    async fn refine(&self, question: &str) -> Result<String> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(format!("late {}", question))
    }

    async fn compose(&self, _question: &str, context: &str) -> Result<String> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(format!("late {}", context))
    }

    fn name(&self) -> &str {
        "hanging"
    }
}

pub fn record(id: i64, content: &str) -> KnowledgeRecord {
    KnowledgeRecord {
        id,
        content: content.to_string(),
        media_ref: None,
    }
}

pub fn snapshot_of(revision: u64, contents: &[&str]) -> StoreSnapshot {
    StoreSnapshot {
        revision,
        records: contents
            .iter()
            .enumerate()
            .map(|(i, c)| record(i as i64 + 1, c))
            .collect(),
    }
}

/// 임시 파일 스토어를 만들고 내용을 채움
pub fn open_store(contents: &[&str]) -> (TempDir, Arc<KnowledgeStore>) {
    let dir = TempDir::new().unwrap();
    let store = KnowledgeStore::open(&dir.path().join("knowledge.json")).unwrap();
    for content in contents {
        store.add(content, None).unwrap();
    }
    (dir, Arc::new(store))
}
