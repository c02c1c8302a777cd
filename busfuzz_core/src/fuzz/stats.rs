use crate::error::CanFuzzResult;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Counters collected over one run. Saved as the run manifest next to the
/// session log; together with the log itself this is everything needed to
/// reproduce or resume a session.
#[derive(Default, Clone, Debug, Serialize, Deserialize)]
pub struct Stats {
    /// The mode that produced this run, e.g. `fuzzer random`.
    pub title: String,

    /// The seed all random draws of the run derived from, when the mode was
    /// seeded.
    pub seed: Option<u64>,

    /// Wall clock time the run started, seconds since the epoch.
    pub started: f64,

    /// Frames transmitted.
    pub frames_sent: u64,

    /// Frames picked up from the bus during the run.
    pub frames_received: u64,

    /// Distinct responses seen (deduplicated by ID and payload digest).
    pub unique_responses: u64,
}

impl Stats {
    /// Fresh counters for a run of the given mode.
    #[must_use]
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_owned(),
            started: crate::frame::now_epoch(),
            ..Self::default()
        }
    }

    /// Writes the manifest as JSON.
    /// # Errors
    pub fn save(&self, path: &Path) -> CanFuzzResult<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
