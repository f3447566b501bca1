//! Banned-word filter
//!
//! Replaces every configured banned substring with a fixed mask.
//! Plain sequential substring replacement in configuration order.

/// Default replacement for banned words
pub const DEFAULT_MASK: &str = "**";

/// Stateless text filter shared by all sessions
#[derive(Debug, Clone)]
pub struct SensitiveFilter {
    words: Vec<String>,
    mask: String,
}

impl SensitiveFilter {
    /// Build a filter from the configured word list
    ///
    /// Empty entries are skipped, since replacing "" would insert the
    /// mask between every character.
    pub fn new(words: impl IntoIterator<Item = String>, mask: impl Into<String>) -> Self {
        Self {
            words: words.into_iter().filter(|w| !w.is_empty()).collect(),
            mask: mask.into(),
        }
    }

    /// Replace banned words in `text`
    ///
    /// Filtering twice gives the same result as filtering once, provided
    /// the mask is non-empty and no word shares a character with it.
    pub fn filter(&self, text: &str) -> String {
        let mut content = text.to_string();
        for word in &self.words {
            if content.contains(word.as_str()) {
                content = content.replace(word.as_str(), &self.mask);
            }
        }
        content
    }

    /// Number of configured words
    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

impl Default for SensitiveFilter {
    fn default() -> Self {
        Self::new(Vec::new(), DEFAULT_MASK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(words: &[&str]) -> SensitiveFilter {
        SensitiveFilter::new(words.iter().map(|w| w.to_string()), DEFAULT_MASK)
    }

    #[test]
    fn test_replaces_every_occurrence() {
        let f = filter(&["bad"]);
        assert_eq!(f.filter("bad apple, bad pear"), "** apple, ** pear");
    }

    #[test]
    fn test_applies_words_in_order() {
        // "badword" goes first, so "bad" never sees it
        let f = filter(&["badword", "bad"]);
        assert_eq!(f.filter("a badword and bad"), "a ** and **");
    }

    #[test]
    fn test_untouched_without_matches() {
        let f = filter(&["bad"]);
        assert_eq!(f.filter("all good"), "all good");
        assert_eq!(SensitiveFilter::default().filter("bad"), "bad");
    }

    #[test]
    fn test_empty_words_are_ignored() {
        let f = filter(&["", "x"]);
        assert_eq!(f.len(), 1);
        assert_eq!(f.filter("axb"), "a**b");
    }

    #[test]
    fn test_filter_is_idempotent() {
        let f = filter(&["spam", "scam", "egg"]);
        for input in ["spam and eggs", "scamspam", "nothing", "egg egg spam"] {
            let once = f.filter(input);
            assert_eq!(f.filter(&once), once);
        }
    }

    #[test]
    fn test_multibyte_words() {
        let f = filter(&["坏蛋"]);
        assert_eq!(f.filter("你是坏蛋吗"), "你是**吗");
    }
}
