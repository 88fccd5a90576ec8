//! Structured logging (SPEC_FULL B.2): a `slog`-based async drain for
//! the process's own diagnostic logging, plus a `LogFormat`-driven
//! access logger that feeds [`crate::format::interpolate`] with a
//! per-transaction [`crate::format::FormatContext`].
//!
//! Two distinct logs, matching the teacher's own split between its
//! `slog` process logger and a separate access log: the process logger
//! is for operational diagnostics (startup, shutdown, service errors),
//! the access logger is one line per ICAP transaction in an
//! operator-configured format.

use slog::{o, Drain};
use std::io::Write as _;
use std::sync::Mutex;

use crate::format::{interpolate, FormatContext};

/// Builds the process-wide `slog::Logger`: async `slog-term` full
/// format over stdout, same shape as the teacher's daemon logger
/// minus its config-registry plumbing.
///
/// Lower-level diagnostics elsewhere in the crate go through the
/// `log` facade instead (`log::debug!`/`log::warn!` in
/// [`crate::server::connection`] and [`crate::wire`]); binaries that
/// want those on stdout install `env_logger` themselves (it is a
/// dev-dependency here, used by the demo binaries under `demos/`, not
/// linked into the library).
pub fn build_process_logger() -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    slog::Logger::root(drain, o!("component" => "icap-core"))
}

/// One named `LogFormat` entry (spec §6 "LogFormat directives"): a
/// format name paired with its directive string.
#[derive(Debug, Clone)]
pub struct LogFormat {
    pub name: String,
    pub pattern: String,
}

/// Where rendered access-log lines are written.
pub trait AccessLogSink: Send + Sync {
    fn write_line(&self, line: &str);
}

/// Default sink: a single locked writer, matching the teacher's
/// line-buffered access log file handle.
pub struct WriterSink<W: std::io::Write + Send> {
    inner: Mutex<W>,
}

impl<W: std::io::Write + Send> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        WriterSink { inner: Mutex::new(writer) }
    }
}

impl<W: std::io::Write + Send> AccessLogSink for WriterSink<W> {
    fn write_line(&self, line: &str) {
        let mut w = self.inner.lock().unwrap_or_else(|poison| poison.into_inner());
        let _ = writeln!(w, "{line}");
    }
}

/// Access logger: holds the named formats plus the sink lines are
/// written to, and renders one line per call to [`AccessLogger::log`].
pub struct AccessLogger {
    formats: Vec<LogFormat>,
    sink: Box<dyn AccessLogSink>,
}

/// Apache-style default, mirroring the original's built-in default
/// format string when no `LogFormat`/`access_log` directive overrides
/// it.
pub const DEFAULT_FORMAT: &str = "%a %la %lp - [%tl] \"%im icap://%la/%I\" %is %O";

impl AccessLogger {
    pub fn new(sink: Box<dyn AccessLogSink>) -> Self {
        AccessLogger { formats: Vec::new(), sink }
    }

    pub fn register(&mut self, name: impl Into<String>, pattern: impl Into<String>) {
        self.formats.push(LogFormat { name: name.into(), pattern: pattern.into() });
    }

    fn pattern_for(&self, name: Option<&str>) -> &str {
        match name {
            Some(n) => self.formats.iter().find(|f| f.name == n).map(|f| f.pattern.as_str()).unwrap_or(DEFAULT_FORMAT),
            None => self.formats.first().map(|f| f.pattern.as_str()).unwrap_or(DEFAULT_FORMAT),
        }
    }

    /// Renders `ctx` through the named format (or the first registered
    /// format, or [`DEFAULT_FORMAT`]) and writes the line to the sink.
    /// `format_override` is `IcapRequest::log_format_override`: a
    /// per-request choice a service can make (spec §4.9).
    pub fn log(&self, ctx: &FormatContext, format_override: Option<&str>) {
        let pattern = self.pattern_for(format_override);
        let line = interpolate(pattern, ctx);
        self.sink.write_line(&line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct CollectingSink {
        lines: Mutex<Vec<String>>,
    }

    impl AccessLogSink for CollectingSink {
        fn write_line(&self, line: &str) {
            self.lines.lock().unwrap().push(line.to_string());
        }
    }

    #[test]
    fn logs_with_default_format_when_none_registered() {
        let sink = Arc::new(CollectingSink { lines: Mutex::new(Vec::new()) });
        struct ArcSink(Arc<CollectingSink>);
        impl AccessLogSink for ArcSink {
            fn write_line(&self, line: &str) {
                self.0.write_line(line);
            }
        }
        let logger = AccessLogger::new(Box::new(ArcSink(sink.clone())));
        let ctx = FormatContext { icap_status: Some(204), ..Default::default() };
        logger.log(&ctx, None);
        let lines = sink.lines.lock().unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("204"));
    }

    #[test]
    fn falls_back_to_default_for_unknown_named_format() {
        let sink = Arc::new(CollectingSink { lines: Mutex::new(Vec::new()) });
        struct ArcSink(Arc<CollectingSink>);
        impl AccessLogSink for ArcSink {
            fn write_line(&self, line: &str) {
                self.0.write_line(line);
            }
        }
        let mut logger = AccessLogger::new(Box::new(ArcSink(sink.clone())));
        logger.register("combined", "%im %is");
        let ctx = FormatContext { icap_method: Some(crate::protocol::common::IcapMethod::Options), icap_status: Some(200), ..Default::default() };
        logger.log(&ctx, Some("missing"));
        let lines = sink.lines.lock().unwrap();
        assert!(lines[0].contains("OPTIONS"));
    }

    #[test]
    fn named_format_is_selected_over_first_registered() {
        let sink = Arc::new(CollectingSink { lines: Mutex::new(Vec::new()) });
        struct ArcSink(Arc<CollectingSink>);
        impl AccessLogSink for ArcSink {
            fn write_line(&self, line: &str) {
                self.0.write_line(line);
            }
        }
        let mut logger = AccessLogger::new(Box::new(ArcSink(sink.clone())));
        logger.register("terse", "%is");
        logger.register("verbose", "status=%is method=%im");
        let ctx = FormatContext { icap_method: Some(crate::protocol::common::IcapMethod::Respmod), icap_status: Some(200), ..Default::default() };
        logger.log(&ctx, Some("verbose"));
        let lines = sink.lines.lock().unwrap();
        assert_eq!(lines[0], "status=200 method=RESPMOD");
    }
}
