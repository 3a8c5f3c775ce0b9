//! 설정 모듈 - 환경변수 기반 런타임 설정
//!
//! 모든 값은 기본값을 가지며 `QALAM_*` 환경변수로 덮어쓸 수 있습니다.
//! 잘못된 값은 설정 에러이며 시작 단계에서 즉시 실패합니다.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::knowledge::{get_data_dir, HnswConfig};

/// 기본 top-K (벡터 검색 후보 수)
pub const DEFAULT_TOP_K: usize = 5;

/// 기본 유사도 임계값
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.55;

/// 기본 다듬기(refinement) 호출 타임아웃
pub const DEFAULT_REFINE_TIMEOUT: Duration = Duration::from_secs(15);

/// 기본 채팅 모델
pub const DEFAULT_CHAT_MODEL: &str = "gpt-4o-mini";

/// 런타임 설정
#[derive(Debug, Clone)]
pub struct Config {
    /// 지식 저장소 JSON 파일 경로
    pub data_file: PathBuf,
    /// 벡터 검색 후보 수
    pub top_k: usize,
    /// 이 점수 미만이면 "질문을 명확히 해 주세요" 응답
    pub similarity_threshold: f32,
    /// refine / compose 호출 타임아웃
    pub refine_timeout: Duration,
    /// OpenAI 호환 채팅 모델 이름
    pub chat_model: String,
    /// 임베딩 차원 (768, 1536, 3072)
    pub embedding_dimension: usize,
    /// HNSW 파라미터
    pub hnsw: HnswConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_file: get_data_dir().join("knowledge.json"),
            top_k: DEFAULT_TOP_K,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            refine_timeout: DEFAULT_REFINE_TIMEOUT,
            chat_model: DEFAULT_CHAT_MODEL.to_string(),
            embedding_dimension: crate::embedding::DEFAULT_DIMENSION,
            hnsw: HnswConfig::default(),
        }
    }
}

impl Config {
    /// 환경변수에서 설정 로드
    ///
    /// 설정되지 않은 항목은 기본값을 사용합니다.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// 임의의 키 조회 함수로 설정 로드 (테스트용 주입 지점)
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(path) = get("QALAM_DATA_FILE") {
            config.data_file = PathBuf::from(path);
        }

        if let Some(raw) = get("QALAM_TOP_K") {
            config.top_k = raw
                .trim()
                .parse()
                .with_context(|| format!("QALAM_TOP_K is not an integer: {}", raw))?;
        }

        if let Some(raw) = get("QALAM_SIMILARITY_THRESHOLD") {
            config.similarity_threshold = raw
                .trim()
                .parse()
                .with_context(|| format!("QALAM_SIMILARITY_THRESHOLD is not a number: {}", raw))?;
        }

        if let Some(raw) = get("QALAM_REFINE_TIMEOUT_SECS") {
            let secs: u64 = raw
                .trim()
                .parse()
                .with_context(|| format!("QALAM_REFINE_TIMEOUT_SECS is not an integer: {}", raw))?;
            config.refine_timeout = Duration::from_secs(secs);
        }

        if let Some(model) = get("QALAM_CHAT_MODEL") {
            config.chat_model = model.trim().to_string();
        }

        if let Some(raw) = get("QALAM_EMBEDDING_DIMENSION") {
            config.embedding_dimension = raw
                .trim()
                .parse()
                .with_context(|| format!("QALAM_EMBEDDING_DIMENSION is not an integer: {}", raw))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// 값 범위 검증
    pub fn validate(&self) -> Result<()> {
        if self.top_k == 0 {
            bail!("top_k must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            bail!(
                "similarity threshold must be within [0, 1], got {}",
                self.similarity_threshold
            );
        }
        if self.refine_timeout.is_zero() {
            bail!("refine timeout must be greater than zero");
        }
        if ![768, 1536, 3072].contains(&self.embedding_dimension) {
            bail!(
                "Invalid embedding dimension: {}. Must be 768, 1536, or 3072",
                self.embedding_dimension
            );
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(|_| None).unwrap();
        assert_eq!(config.top_k, 5);
        assert!((config.similarity_threshold - 0.55).abs() < f32::EPSILON);
        assert_eq!(config.chat_model, "gpt-4o-mini");
        assert!(config.data_file.ends_with("knowledge.json"));
    }

    #[test]
    fn test_env_overrides() {
        let config = Config::from_lookup(lookup_from(&[
            ("QALAM_TOP_K", "8"),
            ("QALAM_SIMILARITY_THRESHOLD", "0.7"),
            ("QALAM_REFINE_TIMEOUT_SECS", "3"),
            ("QALAM_DATA_FILE", "/tmp/kb.json"),
        ]))
        .unwrap();

        assert_eq!(config.top_k, 8);
        assert!((config.similarity_threshold - 0.7).abs() < 1e-6);
        assert_eq!(config.refine_timeout, Duration::from_secs(3));
        assert_eq!(config.data_file, PathBuf::from("/tmp/kb.json"));
    }

    #[test]
    fn test_blank_values_use_defaults() {
        let config = Config::from_lookup(lookup_from(&[("QALAM_TOP_K", "  ")])).unwrap();
        assert_eq!(config.top_k, DEFAULT_TOP_K);
    }

    #[test]
    fn test_invalid_values_are_errors() {
        assert!(Config::from_lookup(lookup_from(&[("QALAM_TOP_K", "many")])).is_err());
        assert!(Config::from_lookup(lookup_from(&[("QALAM_TOP_K", "0")])).is_err());
        assert!(
            Config::from_lookup(lookup_from(&[("QALAM_SIMILARITY_THRESHOLD", "1.5")])).is_err()
        );
        assert!(
            Config::from_lookup(lookup_from(&[("QALAM_EMBEDDING_DIMENSION", "999")])).is_err()
        );
    }
}
