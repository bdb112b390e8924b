//! Telemetry Sink Adapters
//!
//! File-backed and fan-out implementations of the `TelemetrySink` port.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::domain::ports::TelemetrySink;
use crate::error::{Error, Result};
use crate::telemetry::NormalizedTelemetry;

/// Appends one JSON document per line to a file.
#[derive(Debug)]
pub struct JsonlTelemetrySink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlTelemetrySink {
    /// Open (or create) `path` for appending.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        debug!("Appending telemetry to {}", path.display());
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl TelemetrySink for JsonlTelemetrySink {
    async fn append(&self, record: NormalizedTelemetry) -> Result<()> {
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        let persistence = |e: std::io::Error| {
            Error::Persistence(format!("{}: {}", self.path.display(), e))
        };

        let mut file = self.file.lock().await;
        file.write_all(&line).await.map_err(persistence)?;
        file.flush().await.map_err(persistence)
    }
}

/// Sink that forwards every record to several sinks.
#[derive(Default)]
pub struct CompositeTelemetrySink {
    sinks: Vec<Arc<dyn TelemetrySink>>,
}

impl CompositeTelemetrySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink to the composite.
    pub fn with_sink(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl std::fmt::Debug for CompositeTelemetrySink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeTelemetrySink")
            .field("sink_count", &self.sinks.len())
            .finish()
    }
}

#[async_trait]
impl TelemetrySink for CompositeTelemetrySink {
    async fn append(&self, record: NormalizedTelemetry) -> Result<()> {
        for sink in &self.sinks {
            sink.append(record.clone()).await?;
        }
        Ok(())
    }
}
