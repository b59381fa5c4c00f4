//! Execution trace: span and event records streamed as JSON lines.
//!
//! The host installs [`TraceLayer`] in its subscriber stack once. The layer
//! is inert until a trace session starts; from then on every span open,
//! enter, exit and close, and every event, is written straight into the
//! session's sink as one JSON object per line.
//!
//! ```ignore
//! use tracing_subscriber::prelude::*;
//!
//! tracing_subscriber::registry()
//!     .with(tracing_subscriber::fmt::layer())
//!     .with(oya_pprof::TraceLayer::new())
//!     .init();
//! ```

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id, Record};
use tracing::{Event, Subscriber, debug};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::registry::LookupSpan;

use super::Capture;
use crate::error::{ProfilerError, Result};
use crate::sink::OutputSink;

/// Version of the line format written by the trace stream.
pub const TRACE_FORMAT_VERSION: u32 = 1;

static RECORDING: AtomicBool = AtomicBool::new(false);
static ACTIVE: Mutex<Option<TraceStream>> = Mutex::new(None);

fn active() -> MutexGuard<'static, Option<TraceStream>> {
    ACTIVE.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Whether a trace session is currently recording.
#[must_use]
pub fn is_recording() -> bool {
    RECORDING.load(Ordering::Acquire)
}

#[derive(Serialize)]
struct Header<'a> {
    format: &'a str,
    version: u32,
    started_at: String,
    pid: u32,
}

#[derive(Serialize)]
struct Footer {
    kind: &'static str,
    records: u64,
    duration_ns: u64,
}

#[derive(Serialize)]
struct TraceRecord<'a> {
    ts_ns: u64,
    kind: &'static str,
    name: &'a str,
    target: &'a str,
    level: &'a str,
    thread: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    span: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent: Option<u64>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    fields: Map<String, Value>,
}

struct TraceStream {
    sink: OutputSink,
    started: Instant,
    records: u64,
    error: Option<String>,
}

impl TraceStream {
    fn write_line<T: Serialize>(&mut self, line: &T) {
        if self.error.is_some() {
            return;
        }
        let written = serde_json::to_writer(&mut self.sink, line)
            .map_err(|e| e.to_string())
            .and_then(|()| self.sink.write_all(b"\n").map_err(|e| e.to_string()));
        match written {
            Ok(()) => self.records = self.records.saturating_add(1),
            Err(e) => self.error = Some(e),
        }
    }

    fn elapsed_ns(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}

fn thread_label() -> String {
    let current = thread::current();
    match current.name() {
        Some(name) => name.to_owned(),
        None => format!("{:?}", current.id()),
    }
}

fn emit(build: impl FnOnce(u64) -> TraceRecord<'static>) {
    if !is_recording() {
        return;
    }
    let mut guard = active();
    if let Some(stream) = guard.as_mut() {
        let record = build(stream.elapsed_ns());
        stream.write_line(&record);
    }
}

/// Running trace capture. The stream itself lives in process-wide state so
/// that [`TraceLayer`] can reach it from any thread.
#[derive(Debug)]
pub struct TraceCapture {
    _private: (),
}

impl TraceCapture {
    /// Start streaming trace records into `sink`.
    ///
    /// # Errors
    ///
    /// Returns [`ProfilerError::AlreadyActive`] if a trace is already being
    /// recorded and [`ProfilerError::Instrumentation`] if the header cannot be
    /// written.
    pub fn start(sink: OutputSink) -> Result<Self> {
        {
            let mut guard = active();
            if guard.is_some() {
                return Err(ProfilerError::already_active("trace"));
            }

            let mut stream = TraceStream {
                sink,
                started: Instant::now(),
                records: 0,
                error: None,
            };
            stream.write_line(&Header {
                format: "oya-trace",
                version: TRACE_FORMAT_VERSION,
                started_at: Utc::now().to_rfc3339(),
                pid: std::process::id(),
            });
            if let Some(reason) = stream.error.take() {
                return Err(ProfilerError::instrumentation("trace", reason));
            }

            *guard = Some(stream);
            RECORDING.store(true, Ordering::Release);
        }

        debug!("trace stream started");
        Ok(Self { _private: () })
    }
}

impl Capture for TraceCapture {
    fn finish(self: Box<Self>) -> Result<OutputSink> {
        let stream = {
            let mut guard = active();
            RECORDING.store(false, Ordering::Release);
            guard.take()
        };
        let mut stream =
            stream.ok_or_else(|| ProfilerError::flush("trace", "trace stream is not active"))?;

        let footer = Footer {
            kind: "end",
            records: stream.records,
            duration_ns: stream.elapsed_ns(),
        };
        stream.write_line(&footer);

        if let Some(reason) = stream.error {
            return Err(ProfilerError::flush("trace", reason));
        }

        let mut sink = stream.sink;
        sink.flush()
            .map_err(|e| ProfilerError::flush("trace", e.to_string()))?;

        debug!(records = footer.records, "trace stream finished");
        Ok(sink)
    }
}

/// Collects event and span fields into a JSON object.
#[derive(Default)]
struct JsonFields(Map<String, Value>);

impl Visit for JsonFields {
    fn record_f64(&mut self, field: &Field, value: f64) {
        self.0.insert(field.name().to_owned(), Value::from(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.0.insert(field.name().to_owned(), Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.0.insert(field.name().to_owned(), Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.0.insert(field.name().to_owned(), Value::from(value));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.0.insert(field.name().to_owned(), Value::from(value));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.0
            .insert(field.name().to_owned(), Value::from(format!("{value:?}")));
    }
}

/// `tracing` layer feeding the trace stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct TraceLayer {
    _private: (),
}

impl TraceLayer {
    /// Create the layer
    #[must_use]
    pub const fn new() -> Self {
        Self { _private: () }
    }
}

impl<S> Layer<S> for TraceLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        if !is_recording() {
            return;
        }
        let mut fields = JsonFields::default();
        attrs.record(&mut fields);
        let metadata = attrs.metadata();
        let parent = attrs
            .parent()
            .cloned()
            .or_else(|| {
                if attrs.is_contextual() {
                    ctx.current_span().id().cloned()
                } else {
                    None
                }
            })
            .map(|p| p.into_u64());

        emit(|ts_ns| TraceRecord {
            ts_ns,
            kind: "span_open",
            name: metadata.name(),
            target: metadata.target(),
            level: metadata.level().as_str(),
            thread: thread_label(),
            span: Some(id.into_u64()),
            parent,
            fields: fields.0,
        });
    }

    fn on_record(&self, id: &Id, values: &Record<'_>, ctx: Context<'_, S>) {
        if !is_recording() {
            return;
        }
        let Some(metadata) = ctx.metadata(id) else {
            return;
        };
        let mut fields = JsonFields::default();
        values.record(&mut fields);

        emit(|ts_ns| TraceRecord {
            ts_ns,
            kind: "span_record",
            name: metadata.name(),
            target: metadata.target(),
            level: metadata.level().as_str(),
            thread: thread_label(),
            span: Some(id.into_u64()),
            parent: None,
            fields: fields.0,
        });
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        if !is_recording() {
            return;
        }
        let mut fields = JsonFields::default();
        event.record(&mut fields);
        let metadata = event.metadata();
        let span = ctx.lookup_current().map(|s| s.id().into_u64());

        emit(|ts_ns| TraceRecord {
            ts_ns,
            kind: "event",
            name: metadata.name(),
            target: metadata.target(),
            level: metadata.level().as_str(),
            thread: thread_label(),
            span,
            parent: None,
            fields: fields.0,
        });
    }

    fn on_enter(&self, id: &Id, ctx: Context<'_, S>) {
        span_transition("span_enter", id, &ctx);
    }

    fn on_exit(&self, id: &Id, ctx: Context<'_, S>) {
        span_transition("span_exit", id, &ctx);
    }

    fn on_close(&self, id: Id, ctx: Context<'_, S>) {
        span_transition("span_close", &id, &ctx);
    }
}

fn span_transition<S>(kind: &'static str, id: &Id, ctx: &Context<'_, S>)
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    if !is_recording() {
        return;
    }
    let Some(metadata) = ctx.metadata(id) else {
        return;
    };

    emit(|ts_ns| TraceRecord {
        ts_ns,
        kind,
        name: metadata.name(),
        target: metadata.target(),
        level: metadata.level().as_str(),
        thread: thread_label(),
        span: Some(id.into_u64()),
        parent: None,
        fields: Map::new(),
    });
}
