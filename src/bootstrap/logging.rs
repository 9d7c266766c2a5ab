//! Setup for logging (tracing).
//!
//! The level comes from the configuration (`info` by default). Output goes
//! to stderr, or to the file given with `--log` so the progress output on
//! stdout stays clean.
use std::sync::Mutex;
use std::sync::Once;

use torrust_downloader_configuration::Configuration;
use tracing::info;
use tracing::level_filters::LevelFilter;

static INIT: Once = Once::new();

/// It initializes tracing from the configuration.
///
/// # Panics
///
/// Will panic if the configured log level is malformed or the log file
/// cannot be created.
pub fn setup(config: &Configuration) {
    let level: LevelFilter = config
        .log_level
        .as_deref()
        .unwrap_or("info")
        .parse()
        .expect("it should provide a valid log level");

    if level == LevelFilter::OFF {
        return;
    }

    INIT.call_once(|| {
        let builder = tracing_subscriber::fmt().compact().with_max_level(level);

        if let Some(log_file) = &config.log_file {
            let file = std::fs::File::create(log_file).expect("it should be able to create the log file");
            builder.with_writer(Mutex::new(file)).with_ansi(false).init();
        } else {
            builder.with_writer(std::io::stderr).init();
        }

        info!("logging initialized.");
    });
}
