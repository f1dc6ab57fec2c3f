//! `--logto`/`--loglevel` initialization (spec §6.1).
//!
//! The teacher keeps small, explicit adapters for sinks that don't have a
//! tracing-native integration in this dependency set (see `jsonformatter.rs`)
//! rather than pulling in a full logging framework; this follows the same
//! pattern for syslog, built directly on `libc::syslog`.

use std::ffi::CString;
use std::fs::OpenOptions;
use std::sync::Mutex;

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::prelude::*;

#[derive(Debug, Clone)]
pub enum LogTarget {
    Stdout,
    Syslog,
    File(String),
}

pub fn parse_logto(value: &str) -> LogTarget {
    match value {
        "stdout" => LogTarget::Stdout,
        "syslog" => LogTarget::Syslog,
        path => LogTarget::File(path.to_string()),
    }
}

pub fn parse_loglevel(value: &str) -> Result<LevelFilter, String> {
    match value {
        "error" => Ok(LevelFilter::ERROR),
        "warn" => Ok(LevelFilter::WARN),
        "info" => Ok(LevelFilter::INFO),
        "debug" => Ok(LevelFilter::DEBUG),
        "trace" => Ok(LevelFilter::TRACE),
        other => Err(format!("unrecognized log level {other:?}")),
    }
}

pub fn init(target: &LogTarget, level: LevelFilter) -> std::io::Result<()> {
    match target {
        LogTarget::Stdout => {
            tracing_subscriber::fmt().with_max_level(level).with_target(true).init();
        }
        LogTarget::File(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            tracing_subscriber::fmt()
                .with_max_level(level)
                .with_target(true)
                .with_writer(Mutex::new(file))
                .init();
        }
        LogTarget::Syslog => {
            tracing_subscriber::registry().with(level).with(SyslogLayer::new()).init();
        }
    }
    Ok(())
}

/// Formats one event's fields into a single line, mirroring the plain
/// `Display` rendering `tracing_subscriber::fmt` would otherwise produce.
#[derive(Default)]
struct MessageVisitor {
    message: String,
    extra: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.extra.push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}

struct SyslogLayer;

impl SyslogLayer {
    fn new() -> Self {
        let ident = CString::new("meshnode").unwrap();
        // `openlog` borrows `ident` for the life of the process, so it is
        // deliberately leaked rather than dropped.
        unsafe {
            libc::openlog(Box::leak(ident.into_boxed_c_str()).as_ptr(), libc::LOG_PID | libc::LOG_CONS, libc::LOG_DAEMON);
        }
        SyslogLayer
    }
}

fn priority_for(level: &Level) -> libc::c_int {
    match *level {
        Level::ERROR => libc::LOG_ERR,
        Level::WARN => libc::LOG_WARNING,
        Level::INFO => libc::LOG_INFO,
        Level::DEBUG | Level::TRACE => libc::LOG_DEBUG,
    }
}

impl<S: Subscriber> Layer<S> for SyslogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let line = format!("{}{}", visitor.message, visitor.extra);
        let Ok(cline) = CString::new(line) else { return };
        let priority = priority_for(event.metadata().level());
        unsafe {
            libc::syslog(priority, b"%s\0".as_ptr() as *const libc::c_char, cline.as_ptr());
        }
    }
}
