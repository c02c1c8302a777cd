use tracing::level_filters::LevelFilter;

/// Initializes the global `tracing_subscriber`. All per-frame feedback of the
/// engine is emitted through `tracing`, so this should be called once before
/// any module runs. `verbose` raises the filter from INFO to DEBUG.
pub fn init(verbose: bool) {
    let mut level_filter = LevelFilter::INFO;
    if verbose {
        level_filter = LevelFilter::DEBUG;
    }

    tracing_subscriber::fmt()
        .with_max_level(level_filter)
        .with_target(false)
        .init();
}
