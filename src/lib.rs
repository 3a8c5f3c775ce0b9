//! qalam-rag - 아랍어 학습 질문 응답 RAG 시스템
//!
//! JSON 지식 파일 + HNSW 벡터 검색 위에서 학생 질문에
//! 의도 응답 → 직접 매칭 → 벡터 검색 순으로 답합니다.

pub mod cli;
pub mod config;
pub mod embedding;
pub mod knowledge;
pub mod refine;

// Re-exports
pub use config::Config;
pub use embedding::{EmbeddingProvider, GeminiEmbedding, create_embedder, get_api_key, has_api_key};
pub use knowledge::{
    Answer, AnswerRoute, IndexSnapshot, IndexSynchronizer, IntentKind, KnowledgeRecord,
    KnowledgeStore, RagRetriever, RebuildOutcome, RetrieverOptions, SearchBy, StoreStats,
    VectorIndex, classify, get_data_dir, normalize_arabic,
};
pub use refine::{OpenAiRefiner, PassthroughRefiner, TextRefiner};
