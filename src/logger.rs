use simplelog::{ConfigBuilder, LevelFilter, SimpleLogger};

/// Level for the command pipeline: recovery details are debug output.
pub fn level(verbose: bool) -> LevelFilter {
    if verbose { LevelFilter::Debug } else { LevelFilter::Warn }
}

pub fn init(verbose: bool) {
    let config = ConfigBuilder::new()
        .set_target_level(LevelFilter::Error)
        .set_time_level(LevelFilter::Off)
        .build();
    let _ = SimpleLogger::init(level(verbose), config);
}
