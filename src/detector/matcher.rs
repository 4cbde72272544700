use crate::config::DetectorConfig;

/// Decides whether a finalized utterance closes the conversation.
pub trait PhraseMatcher: Send + Sync {
    fn matches(&self, utterance: &str) -> bool;
}

/// Lowercase, turn punctuation into spaces and collapse whitespace.
pub fn normalize(text: &str) -> String {
    let spaced: String = text
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .flat_map(char::to_lowercase)
        .collect();
    spaced.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Matches a closing phrase on its own, or followed by a short tail.
///
/// With `max_tail_words = 1`, "au revoir" and "au revoir Camille" match,
/// "au revoir, comment vas-tu" does not.
#[derive(Debug, Clone)]
pub struct ClosingPhraseMatcher {
    phrases: Vec<String>,
    max_tail_words: usize,
}

impl ClosingPhraseMatcher {
    pub fn new<I, S>(phrases: I, max_tail_words: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let phrases = phrases
            .into_iter()
            .map(|p| normalize(p.as_ref()))
            .filter(|p| !p.is_empty())
            .collect();
        Self {
            phrases,
            max_tail_words,
        }
    }

    pub fn from_config(config: &DetectorConfig) -> Self {
        Self::new(&config.phrases, config.max_tail_words)
    }

    pub fn phrases(&self) -> &[String] {
        &self.phrases
    }
}

impl PhraseMatcher for ClosingPhraseMatcher {
    fn matches(&self, utterance: &str) -> bool {
        let utterance = normalize(utterance);
        self.phrases.iter().any(|phrase| {
            if utterance == *phrase {
                return true;
            }
            match utterance
                .strip_prefix(phrase.as_str())
                .and_then(|rest| rest.strip_prefix(' '))
            {
                Some(tail) => tail.split(' ').count() <= self.max_tail_words,
                None => false,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher() -> ClosingPhraseMatcher {
        ClosingPhraseMatcher::new(["Au revoir"], 1)
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("  Au   Revoir !! "), "au revoir");
        assert_eq!(normalize("au revoir, comment vas-tu"), "au revoir comment vas tu");
        assert_eq!(normalize("À BIENTÔT."), "à bientôt");
        assert_eq!(normalize("...!"), "");
    }

    #[test]
    fn test_exact_phrase_with_punctuation() {
        let matcher = matcher();
        assert!(matcher.matches("au revoir"));
        assert!(matcher.matches("au revoir."));
        assert!(matcher.matches("Au revoir !"));
    }

    #[test]
    fn test_short_tail_matches() {
        assert!(matcher().matches("au revoir Camille"));
    }

    #[test]
    fn test_long_tail_does_not_match() {
        assert!(!matcher().matches("au revoir, comment vas-tu"));
        assert!(!matcher().matches("au revoir et merci beaucoup"));
    }

    #[test]
    fn test_phrase_must_be_prefix_on_word_boundary() {
        let matcher = matcher();
        assert!(!matcher.matches("je dis au revoir"));
        assert!(!matcher.matches("au revoirs"));
        assert!(!matcher.matches(""));
    }

    #[test]
    fn test_zero_tail_means_exact_only() {
        let matcher = ClosingPhraseMatcher::new(["bye"], 0);
        assert!(matcher.matches("Bye!"));
        assert!(!matcher.matches("bye now"));
    }

    #[test]
    fn test_multiple_phrases_and_blank_entries() {
        let matcher = ClosingPhraseMatcher::new(["au revoir", "  ", "à bientôt"], 1);
        assert_eq!(matcher.phrases().len(), 2);
        assert!(matcher.matches("À bientôt !"));
    }
}
