//! Log forwarding to the host
//!
//! The host hands a C callback to `solvertray_init`; every `log` record at or
//! above the configured level is formatted as one line and passed to it.

use std::env;
use std::ffi::CString;
use std::os::raw::c_char;
use std::str::FromStr;
use std::sync::{Once, RwLock};

use log::{Level, LevelFilter, Log, Metadata, Record};

/// Environment variable holding the maximum forwarded level
pub const LOG_ENV: &str = "SOLVERTRAY_LOG";

/// Host sink for one NUL-terminated log line.
pub type LogCallback = unsafe extern "C" fn(message: *const c_char);

static CALLBACK: RwLock<Option<LogCallback>> = RwLock::new(None);
static REGISTER: Once = Once::new();
static FORWARDER: LogForwarder = LogForwarder;

/// `log::Log` implementation that calls the registered host callback.
pub struct LogForwarder;

impl Log for LogForwarder {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let callback = *CALLBACK.read().unwrap_or_else(|e| e.into_inner());
        if let Some(callback) = callback {
            let line = to_c_string(format_record(record));
            // SAFETY: the host registered this callback for exactly this use;
            // the string outlives the call.
            unsafe { callback(line.as_ptr()) };
        }
    }

    fn flush(&self) {}
}

/// Register the forwarder (once per process) and set the host callback.
///
/// Later calls only replace the callback; `None` silences forwarding.
pub fn install(callback: Option<LogCallback>) {
    *CALLBACK.write().unwrap_or_else(|e| e.into_inner()) = callback;

    REGISTER.call_once(|| match log::set_logger(&FORWARDER) {
        Ok(()) => log::set_max_level(parse_level(env::var(LOG_ENV).ok().as_deref())),
        Err(_) => log::warn!("A logger is already installed; host log callback will not receive records"),
    });
}

/// Level from a `SOLVERTRAY_LOG` value, `info` when unset or invalid.
pub fn parse_level(value: Option<&str>) -> LevelFilter {
    value
        .and_then(|v| LevelFilter::from_str(v.trim()).ok())
        .unwrap_or(LevelFilter::Info)
}

fn level_letter(level: Level) -> char {
    match level {
        Level::Error => 'E',
        Level::Warn => 'W',
        Level::Info => 'I',
        Level::Debug => 'D',
        Level::Trace => 'T',
    }
}

/// `<L> <target>:<line>] <message>`
pub fn format_record(record: &Record<'_>) -> String {
    format!(
        "{} {}:{}] {}",
        level_letter(record.level()),
        record.target(),
        record.line().unwrap_or(0),
        record.args()
    )
}

fn to_c_string(line: String) -> CString {
    let mut bytes = line.into_bytes();
    bytes.retain(|&b| b != 0);
    CString::new(bytes).unwrap_or_default()
}
