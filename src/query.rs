//! Query clean-up before retrieval.
//!
//! [`QueryOptimizer::optimize`] strips noise punctuation, expands a small
//! table of acronyms, and optionally drops stop words. The rewritten text
//! is only used to search; answers are generated for the question as asked.

use crate::config::QueryConfig;

/// Words that carry no retrieval signal on their own.
pub const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "in", "is", "it", "of", "on",
    "that", "the", "this", "these", "those", "to", "was", "will", "with",
];

const ACRONYMS: &[(&str, &str)] = &[
    ("AI", "artificial intelligence"),
    ("ML", "machine learning"),
    ("API", "application programming interface"),
    ("REST", "representational state transfer"),
    ("HTTP", "hypertext transfer protocol"),
    ("JSON", "javascript object notation"),
    ("SQL", "structured query language"),
    ("NoSQL", "not only structured query language"),
];

const NOISE: &str = "!@#$%^&*()+=[]{}|;':\"<>?";

pub fn is_stop_word(word: &str) -> bool {
    STOP_WORDS.contains(&word.to_lowercase().as_str())
}

#[derive(Debug, Clone, Default)]
pub struct QueryOptimizer {
    settings: QueryConfig,
}

impl QueryOptimizer {
    pub fn new(settings: QueryConfig) -> Self {
        Self { settings }
    }

    /// Rewrite `query` for retrieval.
    ///
    /// Returns the trimmed input unchanged when optimization is disabled or
    /// when the rewrite would be shorter than `min_length` characters.
    pub fn optimize(&self, query: &str) -> String {
        let original = query.trim();
        if !self.settings.optimize {
            return original.to_string();
        }

        let mut optimized = strip_noise(original);
        if self.settings.expand_acronyms {
            optimized = expand_acronyms(&optimized);
        }
        if self.settings.remove_stopwords {
            optimized = remove_stop_words(&optimized);
        }
        let optimized = collapse_whitespace(&optimized);

        if optimized.chars().count() < self.settings.min_length {
            return original.to_string();
        }
        if optimized != original {
            tracing::debug!(original, optimized = %optimized, "query optimized");
        }
        optimized
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn strip_noise(text: &str) -> String {
    let replaced: String = text
        .chars()
        .map(|c| if NOISE.contains(c) { ' ' } else { c })
        .collect();
    collapse_whitespace(&replaced)
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Whole-word, case-sensitive: `AI` becomes `artificial intelligence (AI)`,
/// but `ai` and `AIR` are left alone.
fn expand_acronyms(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut word = String::new();
    let flush = |word: &mut String, out: &mut String| {
        match ACRONYMS.iter().find(|(acronym, _)| *acronym == word.as_str()) {
            Some((acronym, expansion)) => {
                out.push_str(expansion);
                out.push_str(" (");
                out.push_str(acronym);
                out.push(')');
            }
            None => out.push_str(word),
        }
        word.clear();
    };
    for c in text.chars() {
        if is_word_char(c) {
            word.push(c);
        } else {
            flush(&mut word, &mut out);
            out.push(c);
        }
    }
    flush(&mut word, &mut out);
    out
}

fn remove_stop_words(text: &str) -> String {
    text.split_whitespace()
        .filter(|w| !is_stop_word(w))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Distinct, sorted, lowercase content words of `text`: alphabetic, longer
/// than two letters, and not stop words.
pub fn extract_key_terms(text: &str) -> Vec<String> {
    let mut terms: Vec<String> = text
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .filter(|w| w.chars().count() > 2)
        .filter(|w| w.chars().all(|c| c.is_alphabetic()))
        .filter(|w| !is_stop_word(w))
        .collect();
    terms.sort();
    terms.dedup();
    terms
}

#[cfg(test)]
mod tests {
    use super::*;

    fn optimizer(remove_stopwords: bool) -> QueryOptimizer {
        QueryOptimizer::new(QueryConfig {
            remove_stopwords,
            ..QueryConfig::default()
        })
    }

    #[test]
    fn test_noise_is_stripped_and_whitespace_collapsed() {
        assert_eq!(
            optimizer(false).optimize("  what is   the refund (policy)?? "),
            "what is the refund policy"
        );
    }

    #[test]
    fn test_acronyms_expand_as_whole_words() {
        let opt = optimizer(false);
        assert_eq!(
            opt.optimize("How does the API work"),
            "How does the application programming interface (API) work"
        );
        assert_eq!(opt.optimize("AIR quality"), "AIR quality");
        assert_eq!(opt.optimize("ai ethics"), "ai ethics");
        assert_eq!(
            opt.optimize("NoSQL vs SQL"),
            "not only structured query language (NoSQL) vs structured query language (SQL)"
        );
    }

    #[test]
    fn test_stop_words_removed_when_enabled() {
        assert_eq!(
            optimizer(true).optimize("what is the refund window for returns"),
            "what refund window returns"
        );
        assert_eq!(
            optimizer(false).optimize("what is the refund window"),
            "what is the refund window"
        );
    }

    #[test]
    fn test_too_short_rewrite_keeps_original() {
        assert_eq!(optimizer(true).optimize("is it?"), "is it?");
    }

    #[test]
    fn test_disabled_optimizer_only_trims() {
        let opt = QueryOptimizer::new(QueryConfig {
            optimize: false,
            ..QueryConfig::default()
        });
        assert_eq!(opt.optimize("  the API?  "), "the API?");
    }

    #[test]
    fn test_key_terms() {
        assert_eq!(
            extract_key_terms("What is the Refund policy, and the refund window? 30 days"),
            vec!["days", "policy", "refund", "what", "window"]
        );
        assert!(extract_key_terms("is it on").is_empty());
    }
}
