/// contains the fuzzing engine with the five fuzz modes
pub mod engine;

/// Contains the statistical data collected during a run, persisted next to
/// the session log so a run can be reproduced from its recorded seed.
pub mod stats;
