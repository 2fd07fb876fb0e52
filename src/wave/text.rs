use std::{collections::BTreeSet, sync::LazyLock};

use regex::Regex;

static SENTENCE_BREAK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[.!?]+|\n[ \t]*\n").expect("Invalid sentence regex"));

static WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\p{L}\p{N}][\p{L}\p{N}'’-]*").expect("Invalid word regex"));

const STOPWORDS: &[&str] = &[
    "a", "about", "after", "again", "all", "also", "am", "an", "and", "any", "are", "as", "at",
    "be", "because", "been", "before", "being", "but", "by", "can", "could", "did", "do", "does",
    "doing", "for", "from", "had", "has", "have", "having", "he", "her", "here", "hers", "him",
    "his", "how", "i", "if", "in", "into", "is", "it", "its", "itself", "just", "me", "more",
    "most", "my", "no", "nor", "not", "of", "off", "on", "once", "only", "or", "other", "our",
    "ours", "out", "over", "own", "same", "she", "should", "so", "some", "such", "than", "that",
    "the", "their", "theirs", "them", "then", "there", "these", "they", "this", "those",
    "through", "to", "too", "under", "until", "up", "very", "was", "we", "were", "what", "when",
    "where", "which", "while", "who", "whom", "why", "will", "with", "would", "you", "your",
    "yours",
];

fn is_stopword(word: &str) -> bool {
    STOPWORDS.binary_search(&word).is_ok()
}

/// A sentence reduced to its normalized keywords, in order of appearance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentence {
    pub keywords: Vec<String>,
}

impl Sentence {
    /// Unigrams plus adjacent bigrams of the keywords.
    pub fn terms(&self) -> BTreeSet<String> {
        let mut terms: BTreeSet<String> = self.keywords.iter().cloned().collect();
        for pair in self.keywords.windows(2) {
            terms.insert(format!("{} {}", pair[0], pair[1]));
        }
        terms
    }

    pub fn keyword_set(&self) -> BTreeSet<&str> {
        self.keywords.iter().map(String::as_str).collect()
    }
}

/// Splits text into sentences of normalized keywords. Stopwords are dropped
/// unless a sentence has nothing else; sentences without words are skipped.
pub fn segment(text: &str) -> Vec<Sentence> {
    SENTENCE_BREAK
        .split(text)
        .filter_map(|raw| {
            let words: Vec<String> = WORD
                .find_iter(raw)
                .map(|word| word.as_str().to_lowercase())
                .collect();
            if words.is_empty() {
                return None;
            }
            let content: Vec<String> = words
                .iter()
                .filter(|word| !is_stopword(word))
                .cloned()
                .collect();
            let keywords = if content.is_empty() { words } else { content };
            Some(Sentence { keywords })
        })
        .collect()
}

pub fn jaccard<T: Ord>(left: &BTreeSet<T>, right: &BTreeSet<T>) -> f64 {
    let union = left.union(right).count();
    if union == 0 {
        return 0.0;
    }
    left.intersection(right).count() as f64 / union as f64
}
