//! Vector Index - 지식 레코드 위의 HNSW 근사 최근접 이웃 검색
//!
//! `IndexSnapshot`은 불변입니다. 스토어가 바뀌면 통째로 다시 만들고,
//! 동기화기가 새 스냅샷으로 교체합니다.
//!
//! 위치 대응: 스냅샷의 `i`번째 벡터는 빌드 당시 스토어의 `i`번째 레코드입니다.
//! 스냅샷이 그 레코드들을 함께 들고 있으므로 검색 결과 위치는 항상
//! 같은 스냅샷 안에서 해석됩니다.
//!
//! ref: https://arxiv.org/abs/1603.09320

use std::sync::Arc;

use anyhow::Result;
use hnsw_rs::prelude::*;
use thiserror::Error;

use crate::embedding::EmbeddingProvider;

use super::store::{KnowledgeRecord, StoreSnapshot};

// ============================================================================
// Errors & Config
// ============================================================================

/// 인덱스 에러
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("embedding contains non-finite values")]
    NonFinite,

    #[error("embedding batch size mismatch: {texts} texts, {vectors} vectors")]
    BatchMismatch { texts: usize, vectors: usize },
}

/// HNSW 파라미터
#[derive(Debug, Clone, Copy)]
pub struct HnswConfig {
    /// 노드당 최대 연결 수 (M)
    pub max_connections: usize,
    /// 빌드 시 후보 리스트 크기
    pub ef_construction: usize,
    /// 검색 시 후보 리스트 크기
    pub ef_search: usize,
    /// 최대 레이어 수
    pub max_layer: usize,
}

impl Default for HnswConfig {
    fn default() -> Self {
        Self {
            max_connections: 32,
            ef_construction: 40,
            ef_search: 64,
            max_layer: 16,
        }
    }
}

/// 검색 결과 한 건
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchHit {
    /// 스냅샷 내 위치
    pub position: usize,
    /// 유사도 (1 - 코사인 거리, 높을수록 좋음)
    pub score: f32,
}

// ============================================================================
// IndexSnapshot
// ============================================================================

/// 한 시점의 벡터 인덱스 (불변)
pub struct IndexSnapshot {
    /// 빌드 당시 스토어 revision
    built_at: u64,
    /// 빌드에 사용한 레코드 (벡터와 같은 순서)
    records: Arc<Vec<KnowledgeRecord>>,
    /// 레코드가 없으면 `None`
    graph: Option<Hnsw<'static, f32, DistCosine>>,
    ef_search: usize,
}

impl std::fmt::Debug for IndexSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexSnapshot")
            .field("built_at", &self.built_at)
            .field("records", &self.records.len())
            .field("has_graph", &self.graph.is_some())
            .finish()
    }
}

impl IndexSnapshot {
    /// 빈 인덱스
    pub fn empty(built_at: u64) -> Self {
        Self {
            built_at,
            records: Arc::new(Vec::new()),
            graph: None,
            ef_search: HnswConfig::default().ef_search,
        }
    }

    /// 이미 계산된 벡터로 스냅샷 구성
    ///
    /// 노름이 0인 벡터(빈 텍스트)는 위치만 차지하고 그래프에는 넣지 않습니다.
    /// 벡터는 그래프에 복사되므로 스냅샷이 따로 보관하지 않습니다.
    pub fn from_vectors(
        built_at: u64,
        records: Vec<KnowledgeRecord>,
        vectors: Vec<Vec<f32>>,
        config: &HnswConfig,
    ) -> std::result::Result<Self, IndexError> {
        if records.len() != vectors.len() {
            return Err(IndexError::BatchMismatch {
                texts: records.len(),
                vectors: vectors.len(),
            });
        }

        if records.is_empty() {
            return Ok(Self::empty(built_at));
        }

        let graph = Hnsw::<f32, DistCosine>::new(
            config.max_connections,
            vectors.len(),
            config.max_layer,
            config.ef_construction,
            DistCosine {},
        );

        let mut inserted = 0usize;
        for (position, vector) in vectors.iter().enumerate() {
            if l2_norm(vector) > f32::EPSILON {
                graph.insert_slice((vector.as_slice(), position));
                inserted += 1;
            }
        }

        tracing::debug!(
            "Built HNSW snapshot: revision={}, records={}, inserted={}",
            built_at,
            records.len(),
            inserted
        );

        Ok(Self {
            built_at,
            records: Arc::new(records),
            graph: (inserted > 0).then_some(graph),
            ef_search: config.ef_search,
        })
    }

    /// 빌드 당시 스토어 revision
    pub fn built_at(&self) -> u64 {
        self.built_at
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// 위치의 레코드
    pub fn record(&self, position: usize) -> Option<&KnowledgeRecord> {
        self.records.get(position)
    }


    /// k-NN 검색 (유사도 내림차순)
    ///
    /// 동점은 그래프가 돌려준 순서를 따릅니다 (보장은 아님).
    pub fn search(&self, query: &[f32], k: usize) -> Vec<SearchHit> {
        let Some(graph) = &self.graph else {
            return Vec::new();
        };
        if k == 0 || l2_norm(query) <= f32::EPSILON {
            return Vec::new();
        }

        let k = k.min(self.records.len());
        let ef = self.ef_search.max(k);

        let mut hits: Vec<SearchHit> = graph
            .search(query, k, ef)
            .into_iter()
            // 스냅샷 밖 위치는 "매칭 없음" 표식으로 취급
            .filter(|n| n.d_id < self.records.len())
            .map(|n| SearchHit {
                position: n.d_id,
                score: (1.0 - n.distance).clamp(-1.0, 1.0),
            })
            .filter(|hit| hit.score.is_finite())
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits
    }
}

// ============================================================================
// VectorIndex
// ============================================================================

/// 임베딩 프로바이더 + HNSW 설정으로 스냅샷을 만들고 질의하는 빌더
#[derive(Clone)]
pub struct VectorIndex {
    embedder: Arc<dyn EmbeddingProvider>,
    config: HnswConfig,
}

impl VectorIndex {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>, config: HnswConfig) -> Self {
        Self { embedder, config }
    }

    /// 스토어 스냅샷 전체를 임베딩해 새 인덱스 생성
    ///
    /// 레코드가 없으면 빈 인덱스를 돌려줍니다 (에러 아님).
    pub async fn build(&self, store: &StoreSnapshot) -> Result<IndexSnapshot> {
        if store.is_empty() {
            return Ok(IndexSnapshot::empty(store.revision));
        }

        let texts: Vec<String> = store.records.iter().map(|r| r.content.clone()).collect();
        let vectors = self.embedder.embed_batch(&texts).await?;

        if vectors.len() != texts.len() {
            return Err(IndexError::BatchMismatch {
                texts: texts.len(),
                vectors: vectors.len(),
            }
            .into());
        }
        for vector in &vectors {
            self.validate(vector)?;
        }

        let snapshot =
            IndexSnapshot::from_vectors(store.revision, store.records.clone(), vectors, &self.config)?;
        Ok(snapshot)
    }

    /// 질문을 임베딩해 스냅샷에서 top-k 검색
    pub async fn query(&self, snapshot: &IndexSnapshot, text: &str, k: usize) -> Result<Vec<SearchHit>> {
        if snapshot.is_empty() {
            return Ok(Vec::new());
        }

        let query = self.embedder.embed_query(text).await?;
        self.validate(&query)?;

        Ok(snapshot.search(&query, k))
    }

    fn validate(&self, vector: &[f32]) -> std::result::Result<(), IndexError> {
        let expected = self.embedder.dimension();
        if vector.len() != expected {
            return Err(IndexError::DimensionMismatch {
                expected,
                actual: vector.len(),
            });
        }
        if vector.iter().any(|x| !x.is_finite()) {
            return Err(IndexError::NonFinite);
        }
        Ok(())
    }
}

// ============================================================================
// Utility Functions
// ============================================================================

fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// 코사인 유사도 계산
///
/// 결과는 -1.0 ~ 1.0 범위입니다.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a = l2_norm(a);
    let norm_b = l2_norm(b);

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::test_support::{record, snapshot_of, FakeEmbedder, FAKE_DIMENSION};

    fn axis(i: usize) -> Vec<f32> {
        let mut v = vec![0.0; FAKE_DIMENSION];
        v[i] = 1.0;
        v
    }

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 0.0001);
        assert!(cosine_similarity(&a, &[0.0, 1.0, 0.0]).abs() < 0.0001);
        assert!((cosine_similarity(&a, &[-1.0, 0.0, 0.0]) + 1.0).abs() < 0.0001);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn test_empty_snapshot_returns_nothing() {
        let snapshot = IndexSnapshot::empty(3);
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.built_at(), 3);
        assert!(snapshot.search(&axis(0), 5).is_empty());
    }

    #[test]
    fn test_search_orders_by_score() {
        let records = vec![record(1, "a"), record(2, "b"), record(3, "c")];
        let mut close = axis(1);
        close[0] = 0.3;
        let vectors = vec![axis(0), crate::embedding::normalize_vector(close), axis(2)];

        let snapshot =
            IndexSnapshot::from_vectors(7, records, vectors, &HnswConfig::default()).unwrap();

        let hits = snapshot.search(&axis(1), 5);
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].position, 1);
        assert!(hits[0].score > 0.9);
        assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
        assert_eq!(snapshot.record(hits[0].position).unwrap().content, "b");
    }

    #[test]
    fn test_k_larger_than_index() {
        let records = vec![record(1, "a"), record(2, "b")];
        let snapshot = IndexSnapshot::from_vectors(
            1,
            records,
            vec![axis(0), axis(1)],
            &HnswConfig::default(),
        )
        .unwrap();

        let hits = snapshot.search(&axis(0), 50);
        assert!(hits.len() <= 2);
        assert!(hits.iter().all(|h| h.position < 2));
    }

    #[test]
    fn test_zero_vectors_are_not_matched() {
        let records = vec![record(1, ""), record(2, "b")];
        let snapshot = IndexSnapshot::from_vectors(
            1,
            records,
            vec![vec![0.0; FAKE_DIMENSION], axis(3)],
            &HnswConfig::default(),
        )
        .unwrap();

        let hits = snapshot.search(&axis(3), 5);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].position, 1);

        // 0 벡터 질의는 결과 없음
        assert!(snapshot.search(&vec![0.0; FAKE_DIMENSION], 5).is_empty());
    }

    #[test]
    fn test_batch_mismatch_is_error() {
        let result = IndexSnapshot::from_vectors(
            1,
            vec![record(1, "a")],
            Vec::new(),
            &HnswConfig::default(),
        );
        assert!(matches!(result, Err(IndexError::BatchMismatch { .. })));
    }

    #[tokio::test]
    async fn test_build_and_query_with_embedder() {
        let embedder = Arc::new(FakeEmbedder::new());
        let index = VectorIndex::new(embedder.clone(), HnswConfig::default());

        let store = snapshot_of(
            4,
            &["الخلية وحدة الحياة", "البركان جبل ينفجر", "الماء يغلي"],
        );
        let snapshot = index.build(&store).await.unwrap();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot.built_at(), 4);
        assert_eq!(embedder.calls(), 3);

        let hits = index.query(&snapshot, "وحدة الخلية", 5).await.unwrap();
        assert_eq!(hits[0].position, 0);
        assert!(hits[0].score > 0.8);
    }

    #[tokio::test]
    async fn test_build_empty_store() {
        let embedder = Arc::new(FakeEmbedder::new());
        let index = VectorIndex::new(embedder.clone(), HnswConfig::default());

        let snapshot = index.build(&snapshot_of(9, &[])).await.unwrap();
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.built_at(), 9);
        assert_eq!(embedder.calls(), 0);

        let hits = index.query(&snapshot, "أي شيء", 5).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_embedding_is_error() {
        let embedder = Arc::new(FakeEmbedder::with_dimension_override(3));
        let index = VectorIndex::new(embedder, HnswConfig::default());

        let result = index.build(&snapshot_of(1, &["نص"])).await;
        assert!(result.is_err());
    }
}
