use colored::{ColoredString, Colorize};
use env_logger::{Builder, Env};
use log::warn;
use std::io::Write;

/// Default filter: our own crate at `info`, the HTTP stack only when it has
/// something to complain about.
const DEFAULT_FILTER: &str = "info,reqwest=warn,hyper=warn,hyper_util=warn";

/// Module path of a record, relative to this crate when it comes from here.
fn short_target(target: &str) -> &str {
    target
        .strip_prefix(concat!(env!("CARGO_CRATE_NAME"), "::"))
        .unwrap_or(target)
}

/// Logger whose lines read `<time> <level> <name> <module>: <message>`.
fn builder(name: ColoredString) -> Builder {
    let mut builder = Builder::from_env(Env::default().default_filter_or(DEFAULT_FILTER));
    builder.format(move |buf, record| {
        let level_style = buf.default_level_style(record.level());
        writeln!(
            buf,
            "{} {level_style}{:<5}{level_style:#} {name} {}: {}",
            chrono::Utc::now().format("%H:%M:%S%.3f"),
            record.level(),
            short_target(record.target()).dimmed(),
            record.args()
        )
    });
    builder
}

/// Initializes the logger for a test harness.
///
/// `name` is usually the test id, so that interleaved output of parallel
/// tests stays readable. The filter defaults to [`DEFAULT_FILTER`] and can be
/// overridden with `RUST_LOG`.
pub fn init_logging(name: ColoredString) {
    if builder(name).try_init().is_err() {
        warn!("Unable to initialize logging -- has it already been initialized?")
    }
}

/// Logger for unit and integration tests. Output goes through the test
/// harness so it is only shown for failing tests. Only the first call in a
/// test binary has an effect.
pub fn init_test_logging(test_id: &str) {
    let _ = builder(format!("[{test_id}]").cyan())
        .is_test(true)
        .try_init();
}
