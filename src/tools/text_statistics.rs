//! MCP `text_statistics` tool: prose metrics for a passage of text.

use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::LazyLock;

/// Average silent reading speed used for the reading-time estimate.
const WORDS_PER_MINUTE: f64 = 238.0;

static WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\p{L}\p{N}]+(?:['’][\p{L}]+)*").expect("word pattern must compile"));
static SENTENCE_END: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[.!?]+["')\]’”]*(?:\s+|$)"#).expect("sentence pattern must compile"));
static PARAGRAPH_BREAK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n\s*\n").expect("paragraph pattern must compile"));

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "from", "had", "has", "have",
    "he", "her", "him", "his", "i", "in", "is", "it", "its", "me", "my", "not", "of", "on", "or",
    "she", "so", "that", "the", "their", "them", "there", "they", "this", "to", "was", "we",
    "were", "what", "when", "which", "with", "you", "your",
];

/// Parameters for the `text_statistics` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct TextStatisticsParams {
    /// The passage to analyze.
    #[schemars(description = "The passage of prose to analyze")]
    pub text: String,

    /// How many of the most frequent words to return (1 to 50). Defaults to 10.
    #[schemars(description = "Number of most frequent non-stopwords to return (1-50). Defaults to 10.")]
    pub top_words: Option<usize>,
}

/// Payload sent through the `analysis` service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextStatisticsInput {
    pub text: String,
    pub top_words: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordCount {
    pub word: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextStatistics {
    pub characters: usize,
    pub words: usize,
    pub sentences: usize,
    pub paragraphs: usize,
    pub avg_sentence_length: f64,
    pub reading_time_minutes: f64,
    pub top_words: Vec<WordCount>,
}

pub fn compute_statistics(text: &str, top_words: usize) -> TextStatistics {
    let trimmed = text.trim();
    let words: Vec<String> = WORD
        .find_iter(trimmed)
        .map(|m| m.as_str().to_lowercase())
        .collect();

    let sentences = if words.is_empty() {
        0
    } else {
        let ends = SENTENCE_END.find_iter(trimmed).count();
        // Trailing text without terminal punctuation is still a sentence.
        let unterminated = SENTENCE_END
            .find_iter(trimmed)
            .last()
            .map_or(true, |m| m.end() < trimmed.len());
        ends + usize::from(unterminated)
    };

    let paragraphs = PARAGRAPH_BREAK
        .split(trimmed)
        .filter(|p| !p.trim().is_empty())
        .count();

    let mut counts: HashMap<&str, usize> = HashMap::new();
    for word in &words {
        if !STOPWORDS.contains(&word.as_str()) {
            *counts.entry(word.as_str()).or_default() += 1;
        }
    }
    let mut ranked: Vec<WordCount> = counts
        .into_iter()
        .map(|(word, count)| WordCount {
            word: word.to_string(),
            count,
        })
        .collect();
    ranked.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.word.cmp(&b.word)));
    ranked.truncate(top_words);

    TextStatistics {
        characters: trimmed.chars().count(),
        words: words.len(),
        sentences,
        paragraphs,
        avg_sentence_length: if sentences == 0 {
            0.0
        } else {
            words.len() as f64 / sentences as f64
        },
        reading_time_minutes: words.len() as f64 / WORDS_PER_MINUTE,
        top_words: ranked,
    }
}
