// Logging initialization
//
// Wires the CLI verbosity flag to a global `log` filter and installs
// `env_logger` as the sink. Every subsystem below logs at a fixed
// `target:` string matching its own module name; callers should log at
// the boundary of every externally visible operation, not inside hot
// inner loops.

use log::LevelFilter;

/// Verbosity levels accepted by `-v`, lowest to highest.
pub fn level_from_verbosity(v: u8) -> LevelFilter {
    match v {
        0 => LevelFilter::Error,
        1 => LevelFilter::Warn,
        2 => LevelFilter::Info,
        3 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

pub fn init(verbosity: u8) {
    let level = level_from_verbosity(verbosity);
    let _ = env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp_millis()
        .try_init();
}
