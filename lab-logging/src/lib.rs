//! Tracing setup shared by the lab binaries.
//!
//! Configured from the environment:
//!
//! | Variable        | Values                          | Default             |
//! |-----------------|---------------------------------|---------------------|
//! | `LOG_LEVEL`     | any `EnvFilter` directive       | `info`              |
//! | `LOG_OUTPUT`    | `console`, `file`, `both`, `none` | `console`         |
//! | `LOG_FORMAT`    | `human`, `json`                 | `human`             |
//! | `LOG_TAGS`      | `key:value,...` span filters    | empty               |
//! | `LOG_FILE_PATH` | file path, rotated daily        | `/tmp/lab-api.log`  |
//!
//! `RUST_LOG`, when set, wins over `LOG_LEVEL`.

use std::{
    collections::HashMap,
    env,
    io::{self, Write},
    path::{Path, PathBuf},
};
use tracing::{field::Visit, span, Metadata, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::MakeWriter,
    layer::{Context, Layer},
    prelude::*,
    registry::LookupSpan,
    EnvFilter,
};

const DEFAULT_LOG_FILE: &str = "/tmp/lab-api.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput {
    Console,
    File,
    Both,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Human,
    Json,
}

/// Only events inside a span carrying `key` (containing `value`, or any
/// value for `*`) are kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub level: String,
    pub output: LogOutput,
    pub format: LogFormat,
    pub tags: Vec<Tag>,
    pub file_path: PathBuf,
}

impl LogSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build settings from any variable source. Unknown values fall back to
    /// the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let output = match get("LOG_OUTPUT").as_deref() {
            Some("file") => LogOutput::File,
            Some("both") => LogOutput::Both,
            Some("none") => LogOutput::None,
            _ => LogOutput::Console,
        };
        let format = match get("LOG_FORMAT").as_deref() {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Human,
        };

        Self {
            level: get("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            output,
            format,
            tags: get("LOG_TAGS").map(|t| parse_tags(&t)).unwrap_or_default(),
            file_path: get("LOG_FILE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_FILE)),
        }
    }

    fn log_dir(&self) -> &Path {
        match self.file_path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("/tmp"),
        }
    }

    fn log_file_name(&self) -> &Path {
        self.file_path
            .file_name()
            .map(Path::new)
            .unwrap_or_else(|| Path::new("lab-api.log"))
    }
}

pub fn parse_tags(raw: &str) -> Vec<Tag> {
    raw.split(',')
        .filter_map(|pair| {
            let (key, value) = pair.split_once(':')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some(Tag {
                key: key.to_string(),
                value: value.trim().to_string(),
            })
        })
        .collect()
}

/// Install the global subscriber from the environment.
///
/// Keep the returned guard alive for the life of the process when logging
/// to a file, or buffered lines are lost on exit.
pub fn init_subscriber() -> Option<WorkerGuard> {
    init_with(&LogSettings::from_env())
}

pub fn init_with(settings: &LogSettings) -> Option<WorkerGuard> {
    match settings.output {
        LogOutput::Console => {
            install(settings, io::stdout);
            None
        }
        LogOutput::File => {
            let (writer, guard) = file_writer(settings);
            install(settings, writer);
            Some(guard)
        }
        LogOutput::Both => {
            let (writer, guard) = file_writer(settings);
            install(
                settings,
                MakeFanout {
                    first: io::stdout,
                    second: writer,
                },
            );
            Some(guard)
        }
        LogOutput::None => {
            let _ = tracing_subscriber::registry().with(env_filter(settings)).try_init();
            None
        }
    }
}

fn file_writer(settings: &LogSettings) -> (tracing_appender::non_blocking::NonBlocking, WorkerGuard) {
    let appender = tracing_appender::rolling::daily(settings.log_dir(), settings.log_file_name());
    tracing_appender::non_blocking(appender)
}

fn env_filter(settings: &LogSettings) -> EnvFilter {
    let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.level));
    for noisy in ["tokio=warn", "hyper=warn", "sqlx=warn", "reqwest=warn"] {
        if let Ok(directive) = noisy.parse() {
            filter = filter.add_directive(directive);
        }
    }
    filter
}

fn install<W>(settings: &LogSettings, writer: W)
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    let subscriber = tracing_subscriber::registry()
        .with(env_filter(settings))
        .with(SpanTagFilter {
            tags: settings.tags.clone(),
        });
    let layer = tracing_subscriber::fmt::layer().with_writer(writer);

    // A second initialisation (tests, embedded use) keeps the first subscriber.
    let _ = match settings.format {
        LogFormat::Json => subscriber.with(layer.json()).try_init(),
        LogFormat::Human => subscriber.with(layer.pretty()).try_init(),
    };
}

/// Writes every line to two writers.
struct Fanout<A, B> {
    first: A,
    second: B,
}

impl<A: Write, B: Write> Write for Fanout<A, B> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let first = self.first.write_all(buf);
        let second = self.second.write_all(buf);
        first.or(second).map(|_| buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.first.flush()?;
        self.second.flush()
    }
}

#[derive(Clone)]
struct MakeFanout<A, B> {
    first: A,
    second: B,
}

impl<'a, A, B> MakeWriter<'a> for MakeFanout<A, B>
where
    A: MakeWriter<'a>,
    B: MakeWriter<'a>,
{
    type Writer = Fanout<A::Writer, B::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        Fanout {
            first: self.first.make_writer(),
            second: self.second.make_writer(),
        }
    }
}

type SpanFields = HashMap<String, String>;

struct SpanTagFilter {
    tags: Vec<Tag>,
}

impl SpanTagFilter {
    fn matches(&self, fields: &SpanFields) -> bool {
        self.tags.iter().all(|tag| {
            fields
                .get(&tag.key)
                .is_some_and(|value| tag.value == "*" || value.contains(&tag.value))
        })
    }
}

impl<S> Layer<S> for SpanTagFilter
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        if self.tags.is_empty() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            let mut fields = SpanFields::new();
            attrs.record(&mut FieldCollector(&mut fields));
            span.extensions_mut().insert(fields);
        }
    }

    fn enabled(&self, _meta: &Metadata<'_>, ctx: Context<'_, S>) -> bool {
        if self.tags.is_empty() {
            return true;
        }

        // Events outside any span never match a tag.
        let Some(scope) = ctx.current_span().id().and_then(|id| ctx.span_scope(id)) else {
            return false;
        };

        let mut fields = SpanFields::new();
        for span in scope {
            if let Some(own) = span.extensions().get::<SpanFields>() {
                for (key, value) in own {
                    fields.entry(key.clone()).or_insert_with(|| value.clone());
                }
            }
        }
        self.matches(&fields)
    }
}

struct FieldCollector<'a>(&'a mut SpanFields);

impl Visit for FieldCollector<'_> {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.0.insert(field.name().to_string(), value.to_string());
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.0.insert(field.name().to_string(), format!("{value:?}"));
    }
}
