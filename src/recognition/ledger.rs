use crate::utils::round_to;
use anyhow::Result;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

/// Tally of one ground truth string. Serialized as
/// `[seen, correct, [wrong predictions...]]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(into = "(usize, usize, Vec<String>)")]
pub struct LedgerEntry {
    pub seen: usize,
    pub correct: usize,
    pub mistakes: Vec<String>,
}

impl From<LedgerEntry> for (usize, usize, Vec<String>) {
    fn from(entry: LedgerEntry) -> Self {
        (entry.seen, entry.correct, entry.mistakes)
    }
}

/// Per ground truth accounting of one validation pass. Every occurrence of a
/// ground truth counts, so accuracies are per occurrence rates.
#[derive(Debug, Default)]
pub struct ValidationLedger {
    entries: BTreeMap<String, LedgerEntry>,
    total: usize,
    exact: usize,
    case_insensitive: usize,
}

impl ValidationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one prediction and returns whether it matched exactly.
    pub fn observe(&mut self, ground_truth: &str, prediction: &str) -> bool {
        let exact = ground_truth == prediction;
        let entry = self.entries.entry(ground_truth.to_string()).or_default();
        entry.seen += 1;
        if exact {
            entry.correct += 1;
            self.exact += 1;
        } else {
            entry.mistakes.push(prediction.to_string());
        }
        if exact || ground_truth.to_lowercase() == prediction.to_lowercase() {
            self.case_insensitive += 1;
        }
        self.total += 1;
        exact
    }

    pub fn snapshot(&self) -> BTreeMap<String, LedgerEntry> {
        self.entries.clone()
    }

    pub fn entry(&self, ground_truth: &str) -> Option<&LedgerEntry> {
        self.entries.get(ground_truth)
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// Exact match rate in percent, rounded to 5 decimals.
    pub fn case_sensitive_accuracy(&self) -> f64 {
        self.percent(self.exact)
    }

    pub fn case_insensitive_accuracy(&self) -> f64 {
        self.percent(self.case_insensitive)
    }

    fn percent(&self, hits: usize) -> f64 {
        if self.total == 0 {
            return 0.;
        }
        round_to(hits as f64 * 100. / self.total as f64, 5)
    }

    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer(writer, &self.snapshot())?;
        Ok(())
    }
}
