//! Logger setup
//! Desktop builds log through env_logger; wasm32 builds forward records to
//! the browser console.

use std::str::FromStr;

use log::LevelFilter;

/// Parses a level name, falling back to `Info` for anything unrecognized.
pub fn parse_level(level: &str) -> LevelFilter {
    LevelFilter::from_str(level.trim()).unwrap_or(LevelFilter::Info)
}

/// `<timestamp> [<LEVEL>] <target>: <message>`
#[cfg(any(target_arch = "wasm32", test))]
fn console_line(record: &log::Record, timestamp: &str) -> String {
    format!(
        "{} [{}] {}: {}",
        timestamp,
        record.level(),
        record.target(),
        record.args()
    )
}

/// Installs the global logger. `RUST_LOG` takes precedence over `level`.
/// Calling it twice is harmless.
#[cfg(not(target_arch = "wasm32"))]
pub fn init(level: &str) {
    let result = env_logger::Builder::new()
        .filter_level(parse_level(level))
        .parse_default_env()
        .try_init();
    if result.is_ok() {
        log::info!("Logging initialized");
    }
}

#[cfg(target_arch = "wasm32")]
pub use console::{ConsoleLogger, init};

#[cfg(target_arch = "wasm32")]
mod console {
    use chrono::Utc;
    use log::{Level, Log, Metadata, Record};
    use wasm_bindgen::JsValue;

    use super::{console_line, parse_level};

    /// Writes records to the browser devtools console
    pub struct ConsoleLogger;

    static LOGGER: ConsoleLogger = ConsoleLogger;

    impl Log for ConsoleLogger {
        fn enabled(&self, metadata: &Metadata) -> bool {
            metadata.level() <= log::max_level()
        }

        fn log(&self, record: &Record) {
            if !self.enabled(record.metadata()) {
                return;
            }
            let line = JsValue::from_str(&console_line(record, &Utc::now().to_rfc3339()));
            match record.level() {
                Level::Error => web_sys::console::error_1(&line),
                Level::Warn => web_sys::console::warn_1(&line),
                Level::Info => web_sys::console::info_1(&line),
                Level::Debug | Level::Trace => web_sys::console::debug_1(&line),
            }
        }

        fn flush(&self) {}
    }

    pub fn init(level: &str) {
        if log::set_logger(&LOGGER).is_ok() {
            log::set_max_level(parse_level(level));
            log::info!("Logging initialized");
        }
    }
}
