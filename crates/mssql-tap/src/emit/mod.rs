//! Record emission.
//!
//! Every message is one JSON object on its own line. Streams are emitted
//! one at a time: `SCHEMA`, then records and activate-version markers,
//! with `STATE` messages at checkpoints.

use std::io::Write;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::catalog::{ReplicationMethod, Stream};
use crate::core::Record;
use crate::error::{Result, TapError};
use crate::state::State;
use crate::typemap::format_utc;

/// Line-delimited protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    Schema {
        stream: String,
        tap_stream_id: String,
        schema: Value,
        key_properties: Vec<String>,
        #[serde(default)]
        bookmark_properties: Vec<String>,
    },
    Record {
        stream: String,
        record: Record,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<i64>,
        time_extracted: String,
        sequence: u64,
    },
    ActivateVersion {
        stream: String,
        version: i64,
    },
    State {
        value: State,
    },
}

/// Destination of protocol messages.
pub trait MessageSink: Send {
    /// Write one message.
    fn write(&mut self, message: &Message) -> Result<()>;

    /// Acknowledge everything written so far. Precedes every checkpoint.
    fn flush(&mut self) -> Result<()>;
}

/// Writes messages as JSON lines (usually to stdout).
pub struct JsonLinesSink<W: Write + Send> {
    out: W,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl JsonLinesSink<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> MessageSink for JsonLinesSink<W> {
    fn write(&mut self, message: &Message) -> Result<()> {
        serde_json::to_writer(&mut self.out, message)?;
        self.out.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

/// Collects messages in memory. The buffer is shared so callers can
/// inspect it while the emitter still owns the sink.
#[derive(Clone, Default)]
pub struct MemorySink {
    messages: Arc<Mutex<Vec<Message>>>,
    flushed: Arc<Mutex<usize>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All messages written so far.
    pub fn messages(&self) -> Vec<Message> {
        self.messages.lock().map(|m| m.clone()).unwrap_or_default()
    }

    /// Number of messages acknowledged by the last flush.
    pub fn flushed(&self) -> usize {
        self.flushed.lock().map(|f| *f).unwrap_or_default()
    }
}

impl MessageSink for MemorySink {
    fn write(&mut self, message: &Message) -> Result<()> {
        self.messages
            .lock()
            .map_err(|_| TapError::Io(std::io::Error::other("message buffer poisoned")))?
            .push(message.clone());
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let len = self.messages.lock().map(|m| m.len()).unwrap_or_default();
        if let Ok(mut flushed) = self.flushed.lock() {
            *flushed = len;
        }
        Ok(())
    }
}

/// Turns rows and markers into protocol messages.
pub struct RecordEmitter {
    sink: Box<dyn MessageSink>,
    sequence: u64,
    records: u64,
}

impl RecordEmitter {
    pub fn new(sink: Box<dyn MessageSink>) -> Self {
        Self {
            sink,
            sequence: 0,
            records: 0,
        }
    }

    /// Number of RECORD messages emitted by this emitter.
    pub fn records_emitted(&self) -> u64 {
        self.records
    }

    pub fn schema(&mut self, stream: &Stream) -> Result<()> {
        let bookmark_properties = match (&stream.method, &stream.replication_key) {
            (ReplicationMethod::Incremental, Some(key)) => vec![key.clone()],
            _ => Vec::new(),
        };
        self.sink.write(&Message::Schema {
            stream: stream.stream_name.clone(),
            tap_stream_id: stream.tap_stream_id.clone(),
            schema: stream.schema.clone(),
            key_properties: stream.key_properties.clone(),
            bookmark_properties,
        })
    }

    pub fn record(&mut self, stream: &Stream, record: Record, version: Option<i64>) -> Result<()> {
        self.sequence += 1;
        self.records += 1;
        self.sink.write(&Message::Record {
            stream: stream.stream_name.clone(),
            record,
            version,
            time_extracted: format_utc(&Utc::now()),
            sequence: self.sequence,
        })
    }

    pub fn activate_version(&mut self, stream: &Stream, version: i64) -> Result<()> {
        self.sink.write(&Message::ActivateVersion {
            stream: stream.stream_name.clone(),
            version,
        })
    }

    pub fn state(&mut self, state: &State) -> Result<()> {
        self.sink.write(&Message::State {
            value: state.clone(),
        })
    }

    pub fn flush(&mut self) -> Result<()> {
        self.sink.flush()
    }
}
