//! Heuristic output analysis
//!
//! Classifies a worker turn's final text into an intent with a confidence score, and
//! spots showstoppers that must always reach a human.

use super::Intent;
use crate::errors::RelayError;
use regex::Regex;

const ASKING_PERMISSION: &[&str] = &[
    r"(?i)\b(should|shall|can|may) i\b[^.?!]*\?",
    r"(?i)\b(do you want|would you like) me to\b",
    r"(?i)\b(let me know|please confirm|confirm that)\b",
    r"(?i)\bproceed\?",
];

const REPORTING_DONE: &[&str] = &[
    r"(?i)\ball (\d+ )?tests? (now )?pass(ed|ing)?\b",
    r"(?i)\bsuccessfully (completed|implemented|created|fixed|updated)\b",
    r"(?i)\b(task|work|implementation) is (now )?(complete|done|finished)\b",
    r"(?i)\bi('ve| have) (finished|completed)\b",
    r"(?i)\beverything (is|looks) (done|working|good)\b",
];

const CRITICAL_ERROR: &[&str] = &[
    r"(?i)\b(fatal|unrecoverable) error\b",
    r"(?i)\bpanicked at\b",
    r"(?i)\bpermission denied\b",
    r"(?i)\bout of memory\b",
    r"(?i)\bsegmentation fault\b",
    r"(?i)\b(cannot|can't|unable to) continue\b",
    r"(?i)\bauthentication failed\b",
];

const IN_PROGRESS: &[&str] = &[
    r"(?i)\b(next|now),? i('ll| will)\b",
    r"(?i)\blet me (now )?(run|check|fix|update|look|try|add|write)\b",
    r"(?i)\bi('m| am) (going to|now)\b",
    r"(?i)\b(continuing|working on|moving on)\b",
    r"(?i)\bstep \d+\b",
];

const STUCK_IN_LOOP: &[&str] = &[
    r"(?i)\bsame error (again|as before)\b",
    r"(?i)\bstill (failing|not working|broken)\b",
    r"(?i)\b(already )?tried (that|this) (already|before)\b",
];

const DESTRUCTIVE: &[&str] = &[
    r"(?i)\brm\s+-(rf|fr)\b",
    r"(?i)\bdrop\s+(table|database|schema)\b",
    r"(?i)\btruncate\s+table\b",
    r"(?i)\bgit\s+(push\s+(-f|--force)|reset\s+--hard|clean\s+-fd)\b",
    r"(?i)\bforce[- ]push\b",
    r"(?i)\bdelete (all|everything|the entire)\b",
    r"(?i)\b(irreversible|cannot be undone)\b",
];

#[derive(Debug)]
struct IntentRule {
    intent: Intent,
    patterns: Vec<Regex>,
}

/// Regex heuristics, compiled once per agent.
#[derive(Debug)]
pub struct Heuristics {
    rules: Vec<IntentRule>,
    destructive: Vec<Regex>,
}

fn compile(patterns: &[&str]) -> Result<Vec<Regex>, RelayError> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(p)
                .map_err(|e| RelayError::ConfigError(format!("Invalid heuristic '{}': {}", p, e)))
        })
        .collect()
}

impl Heuristics {
    pub fn new(extra_destructive: &[String]) -> Result<Self, RelayError> {
        // Order is the tie-break when two intents score the same.
        let rules = vec![
            IntentRule {
                intent: Intent::CriticalError,
                patterns: compile(CRITICAL_ERROR)?,
            },
            IntentRule {
                intent: Intent::StuckInLoop,
                patterns: compile(STUCK_IN_LOOP)?,
            },
            IntentRule {
                intent: Intent::AskingPermission,
                patterns: compile(ASKING_PERMISSION)?,
            },
            IntentRule {
                intent: Intent::ReportingDone,
                patterns: compile(REPORTING_DONE)?,
            },
            IntentRule {
                intent: Intent::InProgress,
                patterns: compile(IN_PROGRESS)?,
            },
        ];

        let mut destructive = compile(DESTRUCTIVE)?;
        for pattern in extra_destructive {
            destructive.push(Regex::new(pattern).map_err(|e| {
                RelayError::ConfigError(format!("Invalid destructive pattern '{}': {}", pattern, e))
            })?);
        }

        Ok(Self { rules, destructive })
    }

    /// A destructive action the worker wants confirmed.
    pub fn destructive_confirmation(&self, output: &str) -> Option<String> {
        let hit = self.destructive.iter().find_map(|re| re.find(output))?;
        let asks = output.contains('?') || self.matches(Intent::AskingPermission, output) > 0;
        asks.then(|| hit.as_str().to_string())
    }

    fn matches(&self, intent: Intent, output: &str) -> usize {
        self.rules
            .iter()
            .filter(|r| r.intent == intent)
            .flat_map(|r| r.patterns.iter())
            .filter(|re| re.is_match(output))
            .count()
    }

    /// Best intent and its confidence. Competing intents lower the confidence.
    pub fn classify(&self, output: &str) -> (Intent, f64) {
        let scores: Vec<(Intent, usize)> = self
            .rules
            .iter()
            .map(|r| (r.intent, r.patterns.iter().filter(|re| re.is_match(output)).count()))
            .collect();

        let mut best = (Intent::Unknown, 0usize);
        for (intent, hits) in &scores {
            if *hits > best.1 {
                best = (*intent, *hits);
            }
        }
        if best.1 == 0 {
            // A bare question still reads as a request for input.
            if output.trim_end().ends_with('?') {
                return (Intent::AskingPermission, 0.6);
            }
            return (Intent::Unknown, 0.3);
        }

        let competing = scores
            .iter()
            .filter(|(intent, hits)| *intent != best.0 && *hits > 0)
            .count();
        let confidence = (0.5 + 0.2 * best.1 as f64 - 0.15 * competing as f64).clamp(0.1, 0.95);
        (best.0, confidence)
    }
}
