//! 아랍어 텍스트 정규화
//!
//! 비교용 표준형으로 줄입니다:
//! 1. 하라카트(모음 부호)와 타트윌 제거
//! 2. 함자 붙은 알리프 등 변이 글자를 기본형으로 통일
//! 3. 단어 문자 / 공백 / 아랍어 블록 이외의 문자는 공백으로
//! 4. 연속 공백을 하나로 줄이고 양끝 trim
//!
//! 순수 함수이며 멱등입니다: `normalize(normalize(x)) == normalize(x)`.

/// 제거할 부호: 탄윈(ً ٌ ٍ), 파트하/담마/카스라(َ ُ ِ), 샷다(ّ), 수쿤(ْ), 타트윌(ـ)
const DIACRITICS: [char; 9] = [
    '\u{064B}', '\u{064C}', '\u{064D}', '\u{064E}', '\u{064F}', '\u{0650}', '\u{0651}',
    '\u{0652}', '\u{0640}',
];

/// 글자 통일 테이블
const LETTER_FOLDS: [(char, char); 6] = [
    ('آ', 'ا'),
    ('أ', 'ا'),
    ('إ', 'ا'),
    ('ى', 'ي'),
    ('ؤ', 'و'),
    ('ئ', 'ي'),
];

fn is_arabic_block(c: char) -> bool {
    ('\u{0600}'..='\u{06FF}').contains(&c)
}

fn fold_letter(c: char) -> char {
    LETTER_FOLDS
        .iter()
        .find(|(from, _)| *from == c)
        .map(|(_, to)| *to)
        .unwrap_or(c)
}

/// 아랍어 텍스트 정규화
pub fn normalize_arabic(text: &str) -> String {
    let cleaned: String = text
        .chars()
        .filter(|c| !DIACRITICS.contains(c))
        .map(fold_letter)
        .map(|c| {
            if c.is_alphanumeric() || c == '_' || c.is_whitespace() || is_arabic_block(c) {
                c
            } else {
                ' '
            }
        })
        .collect();

    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tanween_is_stripped() {
        assert_eq!(normalize_arabic("مرحباً"), normalize_arabic("مرحبا"));
        assert_eq!(normalize_arabic("مرحباً"), "مرحبا");
    }

    #[test]
    fn test_harakat_and_tatweel() {
        assert_eq!(normalize_arabic("كَتَبَ"), "كتب");
        assert_eq!(normalize_arabic("مـــدرســة"), "مدرسة");
        assert_eq!(normalize_arabic("مُدَرِّسٌ"), "مدرس");
    }

    #[test]
    fn test_letter_folding() {
        assert_eq!(normalize_arabic("أحمد إلى آخر"), "احمد الي اخر");
        assert_eq!(normalize_arabic("مؤمن قائد"), "مومن قايد");
    }

    #[test]
    fn test_punctuation_and_whitespace() {
        assert_eq!(normalize_arabic("  ما هي   الخلية؟! "), "ما هي الخلية؟");
        assert_eq!(normalize_arabic("hello, world!"), "hello world");
        assert_eq!(normalize_arabic("a\t\nb"), "a b");
    }

    #[test]
    fn test_empty_and_symbols_only() {
        assert_eq!(normalize_arabic(""), "");
        assert_eq!(normalize_arabic("!!! ... ???"), "");
    }

    #[test]
    fn test_idempotent() {
        let samples = [
            "مرحباً بكم في الصّف الأوّل!",
            "  إنَّ الماءَ — يغلي عند ١٠٠ درجة ",
            "Newton's 2nd law: F = m·a",
            "ـــ آ ى ؤ ئ ـــ",
            "🙂 شكراً 🙏",
            "",
        ];
        for sample in samples {
            let once = normalize_arabic(sample);
            assert_eq!(normalize_arabic(&once), once, "not idempotent for {:?}", sample);
        }
    }
}
