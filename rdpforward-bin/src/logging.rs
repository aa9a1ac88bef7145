//! Record-oriented logging on top of `tracing`.
//!
//! Events anywhere in the server render as
//! `[YYYY-MM-DD HH:MM:SS] [LEVEL] [连接#N,ADDR] message`: a connection-tag
//! layer captures the `id`/`peer` fields of per-connection spans, a custom
//! event format renders the record, and a per-record writer copies each
//! record to stdout and, when configured, appends it to the log file. The
//! file is opened per write so no exclusive handle is held between records;
//! open failures are swallowed because console output is authoritative.

use chrono::Local;
use rdpforward_config::Config;
use std::borrow::Cow;
use std::fmt;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields, MakeWriter};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;

/// Installs the global subscriber. DEBUG records are suppressed unless the
/// configuration enables debug mode. Safe to call more than once; only the
/// first installation wins.
pub fn init(config: &Config) {
    let level = if config.debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .event_format(RecordFormat)
        .with_writer(RecordWriter::new(config.log_file.clone()));

    let _ = tracing_subscriber::registry()
        .with(ConnTagLayer)
        .with(fmt_layer.with_filter(level))
        .try_init();
}

/// Connection tag attached to per-connection spans.
#[derive(Debug, Clone)]
struct ConnTag {
    id: u64,
    peer: Option<String>,
}

impl fmt::Display for ConnTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.peer {
            Some(peer) => write!(f, "[连接#{},{}]", self.id, peer),
            None => write!(f, "[连接#{}]", self.id),
        }
    }
}

/// Captures `id` and `peer` fields when a span is created and stores the
/// resulting tag in the span's extensions for the event formatter.
struct ConnTagLayer;

impl<S> Layer<S> for ConnTagLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let mut visitor = ConnTagVisitor::default();
        attrs.record(&mut visitor);
        if let Some(conn_id) = visitor.id
            && let Some(span) = ctx.span(id)
        {
            span.extensions_mut().insert(ConnTag {
                id: conn_id,
                peer: visitor.peer,
            });
        }
    }
}

#[derive(Default)]
struct ConnTagVisitor {
    id: Option<u64>,
    peer: Option<String>,
}

impl Visit for ConnTagVisitor {
    fn record_u64(&mut self, field: &Field, value: u64) {
        if field.name() == "id" {
            self.id = Some(value);
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        if field.name() == "id" && value >= 0 {
            self.id = Some(value as u64);
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "peer" {
            self.peer = Some(value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "peer" {
            self.peer = Some(format!("{:?}", value));
        }
    }
}

/// Renders one record: timestamp, level, innermost connection tag, message.
struct RecordFormat;

impl<S, N> FormatEvent<S, N> for RecordFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
        write!(
            writer,
            "[{}] [{}] ",
            timestamp,
            level_label(event.metadata().level())
        )?;

        if let Some(scope) = ctx.event_scope() {
            let mut tag = None;
            for span in scope.from_root() {
                let extensions = span.extensions();
                if let Some(conn_tag) = extensions.get::<ConnTag>() {
                    tag = Some(conn_tag.to_string());
                }
            }
            if let Some(tag) = tag {
                write!(writer, "{} ", tag)?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

fn level_label(level: &Level) -> &'static str {
    if *level == Level::ERROR {
        "ERROR"
    } else if *level == Level::WARN {
        "WARN"
    } else if *level == Level::INFO {
        "INFO"
    } else {
        "DEBUG"
    }
}

/// Hands out one buffering sink per record.
struct RecordWriter {
    log_file: Option<PathBuf>,
}

impl RecordWriter {
    fn new(log_file: Option<PathBuf>) -> Self {
        Self { log_file }
    }
}

impl<'a> MakeWriter<'a> for RecordWriter {
    type Writer = RecordSink;

    fn make_writer(&'a self) -> RecordSink {
        RecordSink {
            buf: Vec::new(),
            log_file: self.log_file.clone(),
        }
    }
}

/// Buffers a single formatted record and emits it whole on drop, which keeps
/// concurrent writers atomic at record granularity.
struct RecordSink {
    buf: Vec<u8>,
    log_file: Option<PathBuf>,
}

impl Write for RecordSink {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(bytes);
        Ok(bytes.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for RecordSink {
    fn drop(&mut self) {
        if self.buf.is_empty() {
            return;
        }
        let mut stdout = io::stdout().lock();
        let _ = stdout.write_all(&self.buf);
        let _ = stdout.flush();
        if let Some(path) = &self.log_file {
            append_record(path, &self.buf);
        }
    }
}

fn append_record(path: &Path, record: &[u8]) {
    let mut options = OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o644);
    }
    if let Ok(mut file) = options.open(path) {
        let _ = file.write_all(&file_record(record));
    }
}

/// The file copy of a record uses CRLF line endings on Windows.
fn file_record(record: &[u8]) -> Cow<'_, [u8]> {
    if cfg!(windows) && record.ends_with(b"\n") && !record.ends_with(b"\r\n") {
        let mut converted = record[..record.len() - 1].to_vec();
        converted.extend_from_slice(b"\r\n");
        Cow::Owned(converted)
    } else {
        Cow::Borrowed(record)
    }
}
