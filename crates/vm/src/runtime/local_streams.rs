//! Node-local output and error streams.
//!
//! `out` and `err` write through these; they render each pushed value and
//! hand the line to an [`OutputSink`], so hosts (and tests) decide where
//! program output actually lands.

use std::sync::Arc;

use parking_lot::Mutex;

use svi_core::references::Reference;
use svi_core::types::Type;

use crate::error::{VmError, VmResult};
use crate::runtime::Stream;

/// Where rendered program output goes.
pub trait OutputSink: Send + Sync {
    fn out(&self, line: &str);
    fn err(&self, line: &str);
}

/// Writes to the process stdout/stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdSink;

impl OutputSink for StdSink {
    fn out(&self, line: &str) {
        println!("{line}");
    }

    fn err(&self, line: &str) {
        eprintln!("error {line}");
    }
}

/// Captures output in memory; used by tests and the embedding API.
#[derive(Debug, Default)]
pub struct BufferSink {
    out: Mutex<Vec<String>>,
    err: Mutex<Vec<String>>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn out_lines(&self) -> Vec<String> {
        self.out.lock().clone()
    }

    pub fn err_lines(&self) -> Vec<String> {
        self.err.lock().clone()
    }
}

impl OutputSink for BufferSink {
    fn out(&self, line: &str) {
        self.out.lock().push(line.to_string());
    }

    fn err(&self, line: &str) {
        self.err.lock().push(line.to_string());
    }
}

/// A write-only stream rendering values into a sink channel.
pub struct LocalOutputStream {
    id: String,
    sink: Arc<dyn OutputSink>,
    error_channel: bool,
}

impl LocalOutputStream {
    pub fn output(sink: Arc<dyn OutputSink>) -> Self {
        Self {
            id: "local::out".to_string(),
            sink,
            error_channel: false,
        }
    }

    pub fn error(sink: Arc<dyn OutputSink>) -> Self {
        Self {
            id: "local::err".to_string(),
            sink,
            error_channel: true,
        }
    }
}

impl Stream for LocalOutputStream {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn inner_type(&self) -> Type {
        Type::String
    }

    fn open(&self) {}

    fn close(&self) {}

    fn is_open(&self) -> bool {
        true
    }

    fn push(&self, value: Reference) -> VmResult<()> {
        let line = value.to_string();
        if self.error_channel {
            self.sink.err(&line);
        } else {
            self.sink.out(&line);
        }
        Ok(())
    }

    fn pop(&self) -> VmResult<Reference> {
        Err(VmError::stream_empty(&self.id))
    }

    fn is_empty(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_sink_captures_channels() {
        let sink = Arc::new(BufferSink::new());
        let out = LocalOutputStream::output(sink.clone());
        let err = LocalOutputStream::error(sink.clone());

        out.push(Reference::Number(5.0)).unwrap();
        err.push(Reference::StringVal("boom".into())).unwrap();

        assert_eq!(sink.out_lines(), vec!["5"]);
        assert_eq!(sink.err_lines(), vec!["boom"]);
    }

    #[test]
    fn output_streams_cannot_be_popped() {
        let sink = Arc::new(BufferSink::new());
        let out = LocalOutputStream::output(sink);
        assert!(matches!(out.pop(), Err(VmError::StreamEmpty { .. })));
    }
}
