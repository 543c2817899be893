//! Heuristic token estimation, multi-script.

const WORDS_PER_TOKEN: f32 = 0.75;

fn is_cjk(ch: char) -> bool {
    matches!(ch,
        '\u{3000}'..='\u{30FF}'       // CJK punctuation, hiragana, katakana
            | '\u{3400}'..='\u{4DBF}' // CJK extension A
            | '\u{4E00}'..='\u{9FFF}' // CJK unified ideographs
            | '\u{AC00}'..='\u{D7AF}' // hangul syllables
            | '\u{F900}'..='\u{FAFF}' // CJK compatibility ideographs
            | '\u{FF00}'..='\u{FFEF}' // fullwidth and halfwidth forms
    )
}

/// Running token tally over a char stream.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct TokenTally {
    cjk: usize,
    words: usize,
    in_word: bool,
}

impl TokenTally {
    pub(crate) fn push(&mut self, ch: char) {
        if is_cjk(ch) {
            self.cjk += 1;
            self.in_word = false;
        } else if ch.is_whitespace() {
            self.in_word = false;
        } else if !self.in_word {
            self.words += 1;
            self.in_word = true;
        }
    }

    pub(crate) fn estimate(&self) -> usize {
        self.cjk + (self.words as f32 / WORDS_PER_TOKEN) as usize
    }
}

/// Estimates the token count of `text`: CJK chars count one token apiece,
/// the rest contributes its whitespace word count at ~0.75 words per token.
///
/// The estimate is not additive under concatenation; callers that join
/// pieces of text must re-estimate the joined result.
pub fn estimate_tokens(text: &str) -> usize {
    let mut tally = TokenTally::default();
    for ch in text.chars() {
        tally.push(ch);
    }
    tally.estimate()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_has_no_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("   \n\t"), 0);
    }

    #[test]
    fn word_count_scales_up() {
        assert_eq!(estimate_tokens("hello"), 1);
        assert_eq!(estimate_tokens("alpha beta gamma delta"), 5);
    }

    #[test]
    fn cjk_chars_count_one_each() {
        assert_eq!(estimate_tokens("日本語"), 3);
        assert_eq!(estimate_tokens("今日は晴れです。"), 8);
    }

    #[test]
    fn estimate_is_not_additive_under_joins() {
        let left = "aa bb";
        let right = "cc dd";
        let joined = "aa bb cc dd";
        assert!(estimate_tokens(joined) > estimate_tokens(left) + estimate_tokens(right));
    }
}
