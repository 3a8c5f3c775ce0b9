//! Knowledge 모듈 - 아랍어 질문 응답 지식 저장소 + 검색
//!
//! - Store: JSON 파일 기반 레코드 저장 (copy-on-write 스냅샷)
//! - Normalize / Intent: 아랍어 정규화, 대화 의도 분류
//! - Vector: HNSW 인덱스 스냅샷
//! - Sync: 스토어 변경 시 인덱스 재빌드
//! - Retriever: 질문 → 답변 파이프라인

mod store;
mod normalize;
mod intent;
mod vector;
mod sync;
mod retriever;

#[cfg(test)]
pub(crate) mod test_support;

// Re-exports
pub use store::{
    KnowledgeStore, KnowledgeRecord, StoreSnapshot, StoreStats, SearchBy,
    get_data_dir, parse_document, render_document, renumber,
};
pub use normalize::normalize_arabic;
pub use intent::{classify, IntentKind};
pub use vector::{
    IndexSnapshot, VectorIndex, HnswConfig, SearchHit, IndexError,
    cosine_similarity,
};
pub use sync::{SnapshotHandle, IndexSynchronizer, RebuildOutcome};
pub use retriever::{
    RagRetriever, Answer, AnswerRoute, RetrieverOptions,
    image_directive, APOLOGY_RESPONSE, CLARIFY_RESPONSE,
};
