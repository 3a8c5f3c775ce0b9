//! 답변 다듬기(refinement) 모듈 - OpenAI 호환 채팅 API
//!
//! 두 가지 작업만 합니다:
//! - `refine`: 학생 질문을 검색하기 좋은 형태로 다시 쓰기
//! - `compose`: 찾은 지식 스니펫을 바탕으로 명확한 답변 작성
//!
//! 실패하거나 시간이 초과되어도 요청 전체가 실패하지 않도록
//! 호출하는 쪽(RagRetriever)이 타임아웃과 폴백을 적용합니다.
//!
//! ref: https://platform.openai.com/docs/api-reference/chat

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// ============================================================================
// TextRefiner Trait
// ============================================================================

/// 텍스트 다듬기 협력자 트레이트
#[async_trait]
pub trait TextRefiner: Send + Sync {
    /// 질문을 더 명확하게 다시 쓰기 (의미는 유지)
    async fn refine(&self, question: &str) -> Result<String>;

    /// 질문 + 근거 텍스트로 답변 작성
    async fn compose(&self, question: &str, context: &str) -> Result<String>;

    /// 협력자 이름
    fn name(&self) -> &str;
}

/// 질문 재작성 시스템 프롬프트
const REFINE_PROMPT: &str =
    "أعد صياغة السؤال بشكل أوضح لغرض البحث داخل قاعدة بيانات نصية. لا تغيّر المعنى.";

/// 답변 작성 시스템 프롬프트
const COMPOSE_PROMPT: &str = "قدّم جواباً واضحاً ومباشراً بناءً على النص المعطى.";

/// 기본 엔드포인트
const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

// ============================================================================
// OpenAI-compatible Refiner
// ============================================================================

/// OpenAI 호환 채팅 API 구현체
#[derive(Debug)]
pub struct OpenAiRefiner {
    api_key: String,
    base_url: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiRefiner {
    /// 새 인스턴스 생성
    ///
    /// # Arguments
    /// * `api_key` - OpenAI API 키
    /// * `model` - 채팅 모델 (예: gpt-4o-mini)
    /// * `timeout` - HTTP 요청 타임아웃
    pub fn new(api_key: String, model: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = std::env::var("OPENAI_BASE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(|v| v.trim_end_matches('/').to_string())
            .unwrap_or_else(|| OPENAI_BASE_URL.to_string());

        Ok(Self {
            api_key,
            base_url,
            model,
            client,
        })
    }

    /// 환경변수 `OPENAI_API_KEY`로 생성 (없으면 `None`)
    pub fn from_env(model: &str, timeout: Duration) -> Result<Option<Self>> {
        match std::env::var("OPENAI_API_KEY") {
            Ok(key) if !key.trim().is_empty() => {
                Ok(Some(Self::new(key, model.to_string(), timeout)?))
            }
            _ => Ok(None),
        }
    }

    async fn chat(&self, system: &str, user: &str) -> Result<String> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .context("Failed to send chat request")?;

        let status = response.status();
        let body = response
            .text()
            .await
            .context("Failed to read response body")?;

        if !status.is_success() {
            anyhow::bail!("Chat API error ({}): {}", status, body);
        }

        let parsed: ChatResponse =
            serde_json::from_str(&body).context("Failed to parse chat response")?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .unwrap_or_default();

        if text.is_empty() {
            anyhow::bail!("Chat API returned an empty message");
        }
        Ok(text)
    }
}

#[async_trait]
impl TextRefiner for OpenAiRefiner {
    async fn refine(&self, question: &str) -> Result<String> {
        self.chat(REFINE_PROMPT, question).await
    }

    async fn compose(&self, question: &str, context: &str) -> Result<String> {
        let user = compose_message(question, context);
        self.chat(COMPOSE_PROMPT, &user).await
    }

    fn name(&self) -> &str {
        &self.model
    }
}

/// compose 요청의 사용자 메시지
fn compose_message(question: &str, context: &str) -> String {
    format!("السؤال: {}\n\nالنص:\n{}", question, context)
}

// ============================================================================
// Passthrough Refiner
// ============================================================================

/// 외부 호출 없이 입력을 그대로 돌려주는 구현체
///
/// API 키가 없을 때 사용합니다.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughRefiner;

#[async_trait]
impl TextRefiner for PassthroughRefiner {
    async fn refine(&self, question: &str) -> Result<String> {
        Ok(question.to_string())
    }

    async fn compose(&self, _question: &str, context: &str) -> Result<String> {
        Ok(context.to_string())
    }

    fn name(&self) -> &str {
        "passthrough"
    }
}

// ============================================================================
// Tests
// ============================================================================
