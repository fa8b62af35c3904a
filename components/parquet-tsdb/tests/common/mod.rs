#![allow(dead_code)]

use parquet_tsdb::memlimit::{LimitProvider, LimitSink, MemLimitConfigurator, MemLimitError};
use std::io;
use std::sync::{Arc, Mutex};
use tracing_subscriber::fmt::MakeWriter;

/// Captures every JSON record the logger writes.
#[derive(Clone, Default)]
pub struct LogBuffer(Arc<Mutex<Vec<u8>>>);

pub struct LogWriter(Arc<Mutex<Vec<u8>>>);

impl<'a> MakeWriter<'a> for LogBuffer {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter(Arc::clone(&self.0))
    }
}

impl io::Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl LogBuffer {
    pub fn records(&self) -> Vec<serde_json::Value> {
        let bytes = self.0.lock().unwrap().clone();
        String::from_utf8(bytes)
            .unwrap()
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().unwrap().is_empty()
    }

    pub fn messages(&self) -> Vec<String> {
        self.records()
            .iter()
            .filter_map(|r| r["fields"]["message"].as_str().map(str::to_string))
            .collect()
    }

    /// First record whose message is `message`.
    pub fn find(&self, message: &str) -> Option<serde_json::Value> {
        self.records()
            .into_iter()
            .find(|r| r["fields"]["message"] == message)
    }

    pub fn levels(&self) -> Vec<String> {
        self.records()
            .iter()
            .filter_map(|r| r["level"].as_str().map(str::to_string))
            .collect()
    }
}

/// Reports a fixed limit, or none.
#[derive(Debug, Clone, Copy)]
pub struct FixedProvider(pub Option<u64>);

impl LimitProvider for FixedProvider {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn limit(&self) -> Result<Option<u64>, MemLimitError> {
        Ok(self.0)
    }
}

/// Remembers every ceiling applied to it.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink(pub Arc<Mutex<Vec<u64>>>);

impl RecordingSink {
    pub fn applied(&self) -> Vec<u64> {
        self.0.lock().unwrap().clone()
    }
}

impl LimitSink for RecordingSink {
    fn apply(&self, ceiling: u64) -> Result<Option<u64>, MemLimitError> {
        let mut applied = self.0.lock().unwrap();
        let previous = applied.last().copied();
        applied.push(ceiling);
        Ok(previous)
    }
}

/// Memory limit configuration isolated from the host and the process limit.
pub fn memlimit(
    limit: Option<u64>,
    sink: RecordingSink,
) -> impl Fn(f64) -> MemLimitConfigurator + Send + Sync + 'static {
    move |ratio| {
        MemLimitConfigurator::new(ratio)
            .with_env_override(None)
            .with_provider(FixedProvider(limit))
            .with_sink(sink.clone())
    }
}
