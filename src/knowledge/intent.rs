//! 대화 의도(인사, 작별, 감사 등) 감지
//!
//! 검색 파이프라인보다 먼저 실행되며, 일치하면 고정 응답으로 바로 끝납니다.
//! 임베딩이나 외부 LLM을 호출하지 않습니다.

/// 대화 의도 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntentKind {
    Greeting,
    Farewell,
    Thanks,
    Love,
    Praise,
    OfferQuestion,
}

/// 키워드 테이블 (검사 순서 = 우선순위)
const INTENT_KEYWORDS: &[(IntentKind, &[&str])] = &[
    (
        IntentKind::Greeting,
        &["مرحبا", "هلا", "أهلا", "السلام عليكم", "هاي", "hello", "hi"],
    ),
    (
        IntentKind::Farewell,
        &["مع السلامة", "باي", "وداعا", "goodbye", "bye", "إلى اللقاء"],
    ),
    (IntentKind::Thanks, &["شكرا", "مشكور", "thanks", "thx"]),
    (IntentKind::Love, &["بحبك", "احبك", "i love you", "love you"]),
    (IntentKind::Praise, &["رائع", "ممتاز", "جميل", "ذكي", "عبقري"]),
    (
        IntentKind::OfferQuestion,
        &["ممكن سؤال", "ممكن أسأل", "هل يمكنني أن أسأل"],
    ),
];

impl IntentKind {
    /// 의도별 고정 응답
    pub fn canned_response(self) -> &'static str {
        match self {
            IntentKind::Greeting => "👋 أهلاً بك! كيف أستطيع مساعدتك اليوم؟",
            IntentKind::Farewell => "👋 مع السلامة! بالتوفيق.",
            IntentKind::Thanks => "🤗 على الرحب والسعة!",
            IntentKind::Love => "😊 شكراً! لكني مساعد أكاديمي فقط ❤️.",
            IntentKind::Praise => "🙏 شكراً على كلماتك الجميلة!",
            IntentKind::OfferQuestion => "أكيد تفضل، اسأل سؤالك الآن 😊",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            IntentKind::Greeting => "greeting",
            IntentKind::Farewell => "farewell",
            IntentKind::Thanks => "thanks",
            IntentKind::Love => "love",
            IntentKind::Praise => "praise",
            IntentKind::OfferQuestion => "offer_question",
        }
    }
}

/// 대화 의도 분류
///
/// 대소문자 무시 부분 문자열 매칭, 첫 번째 일치가 우선합니다.
pub fn classify(text: &str) -> Option<IntentKind> {
    let lowered = text.trim().to_lowercase();
    if lowered.is_empty() {
        return None;
    }

    INTENT_KEYWORDS
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| lowered.contains(k)))
        .map(|(kind, _)| *kind)
}

// ============================================================================
// Tests
// ============================================================================
