//! Repetition detection over worker turn outputs
//!
//! Keeps a sliding window of recent outputs and flags when the worker keeps saying the
//! same thing, either verbatim (after normalization) or nearly so.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};

#[derive(Debug, Clone)]
pub struct RepetitionConfig {
    pub window_size: usize,
    /// Identical outputs needed to call it a loop.
    pub exact_threshold: u32,
    /// Similar outputs (including the latest) needed to call it a loop.
    pub similar_threshold: u32,
    pub similarity_cutoff: f64,
    /// Identical failing outputs needed to escalate.
    pub failure_threshold: u32,
}

impl Default for RepetitionConfig {
    fn default() -> Self {
        Self {
            window_size: 10,
            exact_threshold: 3,
            similar_threshold: 4,
            similarity_cutoff: 0.85,
            failure_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RepetitionPattern {
    /// The same failing output came back `count` times.
    RepeatedFailure { count: u32 },
    ExactRepeat { count: u32 },
    SimilarRepeat { count: u32, similarity: f64 },
    None,
}

impl RepetitionPattern {
    pub fn is_loop(&self) -> bool {
        !matches!(self, RepetitionPattern::None)
    }
}

#[derive(Debug, Clone)]
struct OutputRecord {
    signature: u64,
    words: HashSet<String>,
    failed: bool,
}

#[derive(Debug)]
pub struct RepetitionDetector {
    config: RepetitionConfig,
    history: VecDeque<OutputRecord>,
    exact_counts: HashMap<u64, u32>,
}

impl RepetitionDetector {
    pub fn new(config: RepetitionConfig) -> Self {
        Self {
            config,
            history: VecDeque::new(),
            exact_counts: HashMap::new(),
        }
    }

    /// Record one turn output and report the strongest pattern it completes.
    pub fn record(&mut self, output: &str, failed: bool) -> RepetitionPattern {
        let normalized = normalize(output);
        let record = OutputRecord {
            signature: signature(&normalized),
            words: words(&normalized),
            failed,
        };

        self.history.push_back(record.clone());
        if self.history.len() > self.config.window_size {
            if let Some(removed) = self.history.pop_front() {
                if let Some(count) = self.exact_counts.get_mut(&removed.signature) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        self.exact_counts.remove(&removed.signature);
                    }
                }
            }
        }
        *self.exact_counts.entry(record.signature).or_insert(0) += 1;

        if record.failed {
            let failures = self
                .history
                .iter()
                .filter(|r| r.failed && r.signature == record.signature)
                .count() as u32;
            if failures >= self.config.failure_threshold {
                return RepetitionPattern::RepeatedFailure { count: failures };
            }
        }

        let exact = self.exact_counts.get(&record.signature).copied().unwrap_or(0);
        if exact >= self.config.exact_threshold {
            return RepetitionPattern::ExactRepeat { count: exact };
        }

        let similar: Vec<f64> = self
            .history
            .iter()
            .rev()
            .skip(1)
            .map(|r| jaccard(&r.words, &record.words))
            .filter(|s| *s >= self.config.similarity_cutoff)
            .collect();
        let count = similar.len() as u32 + 1;
        if count >= self.config.similar_threshold {
            let similarity = similar.iter().sum::<f64>() / similar.len() as f64;
            return RepetitionPattern::SimilarRepeat { count, similarity };
        }

        RepetitionPattern::None
    }

    pub fn reset(&mut self) {
        self.history.clear();
        self.exact_counts.clear();
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }
}

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

fn signature(normalized: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    normalized.hash(&mut hasher);
    hasher.finish()
}

fn words(normalized: &str) -> HashSet<String> {
    normalized
        .split(' ')
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

/// Word-set overlap between two outputs, 0.0 to 1.0.
pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let common = a.intersection(b).count();
    let total = a.union(b).count();
    if total == 0 {
        return 1.0;
    }
    common as f64 / total as f64
}
