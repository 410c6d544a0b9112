//! Tracing subscriber: coloured console output plus a plain-text run log.
use std::fmt::Write as _;
use std::fs;
use std::io::Write as _;
use std::path::Path;
use std::sync::Mutex;

use chrono::{SecondsFormat, Utc};
use tracing::Level;
use tracing::field::{Field, Visit};

use super::files::{keep_previous, log_file_path};

const STAGE_TARGET: &str = "snapstate::stage";
const DRY_RUN_TARGET: &str = "snapstate::dry_run";

/// Message text plus any structured fields, rendered `key=value`.
#[derive(Default)]
struct EventText {
    message: String,
    extra: String,
}

impl EventText {
    fn of(event: &tracing::Event<'_>) -> Self {
        let mut text = Self::default();
        event.record(&mut text);
        text
    }

    fn line(&self) -> String {
        if self.extra.is_empty() {
            self.message.clone()
        } else {
            format!("{}{}", self.message, self.extra)
        }
    }
}

impl Visit for EventText {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            write!(self.extra, " {}={value:?}", field.name()).ok();
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            write!(self.extra, " {}={value}", field.name()).ok();
        }
    }
}

/// Drop terminal escape sequences (CSI and OSC) and stray control
/// characters, keeping tabs and newlines.
fn plain_text(s: &str) -> String {
    enum State {
        Text,
        Escape,
        Csi,
        Osc,
    }
    let mut out = String::with_capacity(s.len());
    let mut state = State::Text;
    for c in s.chars() {
        state = match state {
            State::Text if c == '\x1b' => State::Escape,
            State::Text => {
                if !c.is_control() || c == '\t' || c == '\n' {
                    out.push(c);
                }
                State::Text
            }
            State::Escape if c == '[' => State::Csi,
            State::Escape if c == ']' => State::Osc,
            State::Escape => State::Text,
            State::Csi if ('@'..='~').contains(&c) => State::Text,
            State::Csi => State::Csi,
            State::Osc if c == '\x07' || c == '\\' => State::Text,
            State::Osc => State::Osc,
        };
    }
    out
}

/// One run-log line: RFC 3339 timestamp, level, tag, text.
fn file_line(stamp: &str, level: Level, target: &str, text: &str) -> String {
    let tag = match (level, target) {
        (Level::INFO, STAGE_TARGET) => "==>",
        (Level::INFO, DRY_RUN_TARGET) => "dry-run",
        (Level::ERROR, _) => "error",
        (Level::WARN, _) => "warn",
        (Level::DEBUG | Level::TRACE, _) => "debug",
        _ => "info",
    };
    format!("{stamp} {tag:<7} {}", plain_text(text))
}

/// One console line with ANSI styling.
fn console_line(level: Level, target: &str, text: &str) -> String {
    match (level, target) {
        (Level::ERROR, _) => format!("\x1b[31merror:\x1b[0m {text}"),
        (Level::WARN, _) => format!("\x1b[33mwarning:\x1b[0m {text}"),
        (Level::INFO, STAGE_TARGET) => format!("\x1b[1;36m::\x1b[0m \x1b[1m{text}\x1b[0m"),
        (Level::INFO, DRY_RUN_TARGET) => format!("   \x1b[35m(dry run)\x1b[0m {text}"),
        (Level::INFO, _) => format!("   {text}"),
        _ => format!("   \x1b[2m{text}\x1b[0m"),
    }
}

/// Appends every event to the run log of one command.
#[derive(Debug)]
pub(super) struct FileLayer {
    file: Mutex<fs::File>,
}

impl FileLayer {
    /// Open the run log of `command`, keeping the previous run's log.
    pub(super) fn new(command: &str) -> Option<Self> {
        let path = log_file_path(command)?;
        keep_previous(&path);
        Self::at(&path, command)
    }

    /// Start a fresh log at `path` with a header naming `command`.
    pub(super) fn at(path: &Path, command: &str) -> Option<Self> {
        let version = option_env!("SNAPSTATE_VERSION").unwrap_or(env!("CARGO_PKG_VERSION"));
        let header = format!(
            "# snapstate {version} {command} pid={} started {}\n",
            std::process::id(),
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
        );
        fs::write(path, header).ok()?;
        let file = fs::OpenOptions::new().append(true).open(path).ok()?;
        Some(Self {
            file: Mutex::new(file),
        })
    }
}

impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for FileLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        let meta = event.metadata();
        let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let line = file_line(&stamp, *meta.level(), meta.target(), &EventText::of(event).line());
        if let Ok(mut file) = self.file.lock() {
            writeln!(file, "{line}").ok();
        }
    }
}

struct ConsoleFormatter;

impl<S, N> tracing_subscriber::fmt::FormatEvent<S, N> for ConsoleFormatter
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    N: for<'a> tracing_subscriber::fmt::FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &tracing_subscriber::fmt::FmtContext<'_, S, N>,
        mut writer: tracing_subscriber::fmt::format::Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let meta = event.metadata();
        let line = console_line(*meta.level(), meta.target(), &EventText::of(event).line());
        writeln!(writer, "{line}")
    }
}

/// Install the global subscriber for `command`.
///
/// Warnings and errors go to stderr, the rest to stdout; `verbose` (or
/// `RUST_LOG`) lets debug events through to the console. The run log under
/// the log directory receives every event at debug and above. Call once,
/// before anything logs.
pub fn init_subscriber(verbose: bool, command: &str) {
    use tracing_subscriber::fmt::writer::MakeWriterExt as _;
    use tracing_subscriber::{
        EnvFilter, Layer as _, filter::LevelFilter, fmt, layer::SubscriberExt as _,
        util::SubscriberInitExt as _,
    };

    let console_filter = EnvFilter::builder()
        .with_default_directive(
            if verbose {
                LevelFilter::DEBUG
            } else {
                LevelFilter::INFO
            }
            .into(),
        )
        .from_env_lossy();
    let console = fmt::layer()
        .event_format(ConsoleFormatter)
        .with_writer(
            std::io::stderr
                .with_max_level(Level::WARN)
                .or_else(std::io::stdout),
        )
        .with_filter(console_filter);
    let run_log = FileLayer::new(command).map(|layer| layer.with_filter(LevelFilter::DEBUG));

    tracing_subscriber::registry()
        .with(console)
        .with(run_log)
        .init();
}
