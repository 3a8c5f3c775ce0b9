//! RAG Retriever - 학생 질문 하나를 최종 답변 문자열로
//!
//! 요청마다 아래 순서로 진행하며, 답이 나오면 즉시 끝납니다:
//!
//! 1. 대화 의도 (인사/감사 등) → 고정 응답
//! 2. 질문 재작성 (실패/타임아웃 시 원문 사용)
//! 3. 직접 매칭 (정규화된 부분 문자열, 이미지 참조 포함)
//! 4. 벡터 검색 (백그라운드 인덱스 검사 트리거)
//! 5. 임계값 미만 → "질문을 명확히 해 주세요"
//! 6. 이미지 레코드 → `<img>` 지시문, 아니면 답변 다듬기 (실패 시 원문)
//!
//! 호출자에게 에러를 던지지 않습니다. 모든 실패는 고정 문구로 바뀝니다.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::config::Config;
use crate::embedding::{create_embedder, EmbeddingProvider};
use crate::refine::{OpenAiRefiner, PassthroughRefiner, TextRefiner};

use super::intent::{classify, IntentKind};
use super::normalize::normalize_arabic;
use super::store::{KnowledgeRecord, KnowledgeStore};
use super::sync::{IndexSynchronizer, RebuildOutcome};
use super::vector::{HnswConfig, VectorIndex};

/// 임계값 미만일 때의 응답
pub const CLARIFY_RESPONSE: &str = "❗ لم أجد إجابة مباشرة، هل يمكنك توضيح سؤالك أكثر؟";

/// 임베딩/인덱스 실패 시의 응답
pub const APOLOGY_RESPONSE: &str = "⚠️ حدث خطأ أثناء الإجابة، يرجى المحاولة مرة أخرى.";

/// 다른 재빌드가 끝나기를 기다리는 최대 횟수 (50ms 간격)
const MUTATION_REBUILD_RETRIES: usize = 100;

// ============================================================================
// Types
// ============================================================================

/// 답변이 만들어진 경로
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AnswerRoute {
    Intent(IntentKind),
    DirectMatch { id: i64 },
    Vector { position: usize, score: f32 },
    Clarify,
    Failed,
}

/// 답변 + 경로
#[derive(Debug, Clone)]
pub struct Answer {
    pub text: String,
    pub route: AnswerRoute,
}

impl Answer {
    fn new(text: impl Into<String>, route: AnswerRoute) -> Self {
        Self {
            text: text.into(),
            route,
        }
    }
}

/// 검색 동작 옵션
#[derive(Debug, Clone, Copy)]
pub struct RetrieverOptions {
    pub top_k: usize,
    pub similarity_threshold: f32,
    pub refine_timeout: Duration,
}

impl Default for RetrieverOptions {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for RetrieverOptions {
    fn from(config: &Config) -> Self {
        Self {
            top_k: config.top_k,
            similarity_threshold: config.similarity_threshold,
            refine_timeout: config.refine_timeout,
        }
    }
}

// ============================================================================
// RagRetriever
// ============================================================================

/// 질문 응답 오케스트레이터
pub struct RagRetriever {
    sync: Arc<IndexSynchronizer>,
    refiner: Arc<dyn TextRefiner>,
    options: RetrieverOptions,
}

impl RagRetriever {
    /// 설정에서 생성
    ///
    /// 임베딩 API 키가 없으면 설정 에러로 실패합니다.
    /// OpenAI 키가 없으면 다듬기 없이(passthrough) 동작합니다.
    pub async fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;

        let store = KnowledgeStore::open(&config.data_file)
            .context("Failed to open knowledge store")?;

        let embedder = create_embedder(config.embedding_dimension)
            .context("Embedding provider is not configured")?;

        let refiner: Arc<dyn TextRefiner> =
            match OpenAiRefiner::from_env(&config.chat_model, config.refine_timeout)? {
                Some(refiner) => {
                    tracing::info!("Using chat model {} for refinement", config.chat_model);
                    Arc::new(refiner)
                }
                None => {
                    tracing::warn!("OPENAI_API_KEY not set, answers will not be refined");
                    Arc::new(PassthroughRefiner)
                }
            };

        let index = VectorIndex::new(Arc::new(embedder), config.hnsw);
        let sync = IndexSynchronizer::bootstrap(Arc::new(store), index).await?;

        Ok(Self::with_synchronizer(sync, refiner, RetrieverOptions::from(config)))
    }

    /// 구성 요소로 생성 (첫 인덱스를 빌드함)
    pub async fn new(
        store: Arc<KnowledgeStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        refiner: Arc<dyn TextRefiner>,
        options: RetrieverOptions,
    ) -> Result<Self> {
        let index = VectorIndex::new(embedder, HnswConfig::default());
        let sync = IndexSynchronizer::bootstrap(store, index).await?;
        Ok(Self::with_synchronizer(sync, refiner, options))
    }

    /// 이미 준비된 동기화기로 생성
    pub fn with_synchronizer(
        sync: Arc<IndexSynchronizer>,
        refiner: Arc<dyn TextRefiner>,
        options: RetrieverOptions,
    ) -> Self {
        Self {
            sync,
            refiner,
            options,
        }
    }

    pub fn store(&self) -> &Arc<KnowledgeStore> {
        self.sync.store()
    }

    pub fn synchronizer(&self) -> &Arc<IndexSynchronizer> {
        &self.sync
    }

    pub fn refiner_name(&self) -> &str {
        self.refiner.name()
    }

    /// 질문에 대한 답변 (텍스트 또는 `<img>` 지시문)
    pub async fn answer(&self, question: &str) -> String {
        self.answer_detailed(question).await.text
    }

    /// 답변 + 경로
    pub async fn answer_detailed(&self, question: &str) -> Answer {
        let question = question.trim();
        if question.is_empty() {
            return Answer::new(CLARIFY_RESPONSE, AnswerRoute::Clarify);
        }

        // 1. 대화 의도
        if let Some(kind) = classify(question) {
            tracing::debug!("Intent shortcut: {}", kind.as_str());
            return Answer::new(kind.canned_response(), AnswerRoute::Intent(kind));
        }

        // 2. 질문 재작성
        let refined = self.refine_question(question).await;

        // 3. 직접 매칭 (다른 프로세스의 파일 수정도 반영)
        if let Err(e) = self.store().sync_from_disk() {
            tracing::warn!("Knowledge file resync before direct match failed: {:#}", e);
        }
        if let Some(record) = self.direct_match(&refined, question) {
            tracing::debug!("Direct match: record id={}", record.id);
            let text = match &record.media_ref {
                Some(media) => image_directive(media),
                None => record.content.clone(),
            };
            return Answer::new(text, AnswerRoute::DirectMatch { id: record.id });
        }

        // 4. 벡터 검색
        self.sync.spawn_refresh();
        let snapshot = self.sync.current();
        let search_text = vector_query_text(&refined, question);

        let hits = match self
            .sync
            .index()
            .query(&snapshot, &search_text, self.options.top_k)
            .await
        {
            Ok(hits) => hits,
            Err(e) => {
                tracing::error!("Vector search failed: {:#}", e);
                return Answer::new(APOLOGY_RESPONSE, AnswerRoute::Failed);
            }
        };

        // 5. 임계값
        let Some(best) = hits.first().copied() else {
            tracing::debug!("No vector hits (index size {})", snapshot.len());
            return Answer::new(CLARIFY_RESPONSE, AnswerRoute::Clarify);
        };
        if best.score < self.options.similarity_threshold {
            tracing::debug!(
                "Best score {:.3} below threshold {:.3}",
                best.score,
                self.options.similarity_threshold
            );
            return Answer::new(CLARIFY_RESPONSE, AnswerRoute::Clarify);
        }

        let Some(record) = snapshot.record(best.position) else {
            tracing::error!(
                "Hit position {} outside snapshot of {} records",
                best.position,
                snapshot.len()
            );
            return Answer::new(APOLOGY_RESPONSE, AnswerRoute::Failed);
        };
        let route = AnswerRoute::Vector {
            position: best.position,
            score: best.score,
        };
        tracing::debug!("Vector match: record id={} score={:.3}", record.id, best.score);

        // 6. 답변 구성
        if let Some(media) = &record.media_ref {
            return Answer::new(image_directive(media), route);
        }

        let composed = self
            .with_timeout("compose", self.refiner.compose(question, &record.content))
            .await;

        Answer::new(composed.unwrap_or_else(|| record.content.clone()), route)
    }

    /// 레코드 추가 후 인덱스 재빌드
    pub async fn add_record(&self, content: &str, media_ref: Option<String>) -> Result<KnowledgeRecord> {
        let record = self.store().add(content, media_ref)?;
        self.refresh_after_mutation().await;
        Ok(record)
    }

    /// 레코드 수정 후 인덱스 재빌드
    pub async fn update_record(&self, id: i64, content: &str) -> Result<bool> {
        let updated = self.store().update(id, content)?;
        if updated {
            self.refresh_after_mutation().await;
        }
        Ok(updated)
    }

    /// 레코드 삭제 후 인덱스 재빌드
    pub async fn delete_record(&self, id: i64) -> Result<bool> {
        let deleted = self.store().delete(id)?;
        if deleted {
            self.refresh_after_mutation().await;
        }
        Ok(deleted)
    }

    /// 명시적인 동기 인덱스 검사
    pub async fn refresh_index(&self) -> Result<RebuildOutcome> {
        self.sync.maybe_rebuild().await
    }

    async fn refresh_after_mutation(&self) {
        for _ in 0..MUTATION_REBUILD_RETRIES {
            match self.sync.maybe_rebuild().await {
                Ok(RebuildOutcome::InProgress) => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Ok(outcome) => {
                    tracing::debug!("Post-mutation index check: {:?}", outcome);
                    return;
                }
                Err(e) => {
                    tracing::warn!("Index rebuild after mutation failed: {:#}", e);
                    return;
                }
            }
        }
        tracing::debug!("Index rebuild still running, next request will pick up the change");
    }

    async fn refine_question(&self, question: &str) -> String {
        self.with_timeout("refine", self.refiner.refine(question))
            .await
            .unwrap_or_else(|| question.to_string())
    }

    /// 정규화된 재작성 질문 또는 원문 질문이 내용에 포함되면 매칭
    fn direct_match(&self, refined: &str, raw: &str) -> Option<KnowledgeRecord> {
        let mut queries: Vec<String> = Vec::with_capacity(2);
        for q in [normalize_arabic(refined), normalize_arabic(raw)] {
            if !q.is_empty() && !queries.contains(&q) {
                queries.push(q);
            }
        }
        if queries.is_empty() {
            return None;
        }
        // 이미지 경로는 구두점이 의미 있으므로 원문 질문도 함께 비교
        let mut lowered: Vec<String> = queries.iter().map(|q| q.to_lowercase()).collect();
        lowered.push(raw.trim().to_lowercase());

        let snapshot = self.store().snapshot();
        snapshot
            .records
            .iter()
            .find(|record| {
                let content = normalize_arabic(&record.content);
                if queries.iter().any(|q| content.contains(q.as_str())) {
                    return true;
                }
                record.media_ref.as_ref().is_some_and(|media| {
                    let media = media.to_lowercase();
                    lowered.iter().any(|q| media.contains(q.as_str()))
                })
            })
            .cloned()
    }

    /// 협력자 호출에 타임아웃 적용 (실패, 타임아웃, 빈 응답은 `None`)
    async fn with_timeout<F>(&self, op: &str, fut: F) -> Option<String>
    where
        F: Future<Output = Result<String>>,
    {
        match tokio::time::timeout(self.options.refine_timeout, fut).await {
            Ok(Ok(text)) if !text.trim().is_empty() => Some(text.trim().to_string()),
            Ok(Ok(_)) => {
                tracing::warn!("{} via {} returned empty text, using fallback", op, self.refiner.name());
                None
            }
            Ok(Err(e)) => {
                tracing::warn!("{} via {} failed, using fallback: {:#}", op, self.refiner.name(), e);
                None
            }
            Err(_) => {
                tracing::warn!(
                    "{} via {} timed out after {:?}, using fallback",
                    op,
                    self.refiner.name(),
                    self.options.refine_timeout
                );
                None
            }
        }
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// 벡터 검색용 질의 (재작성 결과와 원문을 이어 붙여 정규화)
fn vector_query_text(refined: &str, raw: &str) -> String {
    let raw_norm = normalize_arabic(raw);
    if normalize_arabic(refined) == raw_norm {
        raw_norm
    } else {
        normalize_arabic(&format!("{} {}", refined, raw))
    }
}

/// 이미지 표시 지시문
pub fn image_directive(media_ref: &str) -> String {
    format!("<img src='{}' style='max-width:300px;'>", escape_attr(media_ref))
}

fn escape_attr(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('\'', "&#39;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

// ============================================================================
// Tests
// ============================================================================
