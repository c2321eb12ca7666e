//! Bounded, persisted log of construction iterations.

use guideforge_common::{IterationFeedback, IterationRecord};
use std::collections::VecDeque;
use std::path::PathBuf;
use tracing::{debug, warn};

use crate::config::write_atomic;
use crate::errors::OrchestratorError;
use crate::orchestrator::MAX_HISTORY_RECORDS;

#[derive(Debug, Clone)]
pub struct IterationHistoryStore {
    path: PathBuf,
    max_records: usize,
    records: VecDeque<IterationRecord>,
}

impl IterationHistoryStore {
    /// Load the history at `path`. A missing file is an empty history; an
    /// unreadable one is logged and replaced on the next append.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, OrchestratorError> {
        let path = path.into();
        let records = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<Vec<IterationRecord>>(&content) {
                Ok(records) => records.into(),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Discarding unreadable iteration history");
                    VecDeque::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => VecDeque::new(),
            Err(source) => return Err(OrchestratorError::ArtifactIo { path, source }),
        };
        let mut store = Self {
            path,
            max_records: MAX_HISTORY_RECORDS,
            records,
        };
        store.evict();
        Ok(store)
    }

    pub fn with_max_records(mut self, max_records: usize) -> Self {
        self.max_records = max_records.max(1);
        self.evict();
        self
    }

    pub fn records(&self) -> impl Iterator<Item = &IterationRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn last_iteration(&self) -> Option<u32> {
        self.records.back().map(|r| r.iteration)
    }

    /// Append `record`, drop the oldest entries past the cap, and persist.
    pub fn append(&mut self, record: IterationRecord) -> Result<(), OrchestratorError> {
        debug!(
            iteration = record.iteration,
            pass_count = record.pass_count,
            "Recording iteration"
        );
        self.records.push_back(record);
        self.evict();
        self.persist()
    }

    fn evict(&mut self) {
        while self.records.len() > self.max_records {
            self.records.pop_front();
        }
    }

    fn persist(&self) -> Result<(), OrchestratorError> {
        let json = serde_json::to_vec_pretty(&self.records)
            .map_err(|e| anyhow::anyhow!("Failed to serialize iteration history: {}", e))?;
        write_atomic(&self.path, &json).map_err(|source| OrchestratorError::ArtifactIo {
            path: self.path.clone(),
            source,
        })
    }

    /// Feedback between the two most recent records at or before
    /// `target_iteration`.
    pub fn compute_feedback<'a, I>(records: I, target_iteration: u32) -> Option<IterationFeedback>
    where
        I: IntoIterator<Item = &'a IterationRecord>,
    {
        let eligible: Vec<&IterationRecord> = records
            .into_iter()
            .filter(|r| r.iteration <= target_iteration)
            .collect();
        match eligible.as_slice() {
            [.., previous, current] => Some(IterationFeedback::between(previous, current)),
            _ => None,
        }
    }

    /// Up to `n` most recent consecutive-pair feedbacks, oldest first.
    pub fn get_recent_feedback(&self, n: usize) -> Vec<IterationFeedback> {
        let pairs = self.records.len().saturating_sub(1);
        let skip = pairs.saturating_sub(n);
        self.records
            .iter()
            .zip(self.records.iter().skip(1))
            .skip(skip)
            .map(|(previous, current)| IterationFeedback::between(previous, current))
            .collect()
    }
}
