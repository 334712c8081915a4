//! # Span Exporters
//!
//! Sinks that receive every finished span.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};

use super::span::{Span, SpanStatus};

/// Receives finished spans
pub trait SpanExporter: Send + Sync {
    fn name(&self) -> &str;

    fn export(&self, span: &Span) -> Result<()>;
}

/// Keeps finished spans in memory
#[derive(Default)]
pub struct InMemoryExporter {
    spans: Mutex<Vec<Span>>,
}

impl InMemoryExporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spans(&self) -> Vec<Span> {
        self.spans
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut spans) = self.spans.lock() {
            spans.clear();
        }
    }
}

impl SpanExporter for InMemoryExporter {
    fn name(&self) -> &str {
        "memory"
    }

    fn export(&self, span: &Span) -> Result<()> {
        let mut spans = self
            .spans
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;
        spans.push(span.clone());
        Ok(())
    }
}

/// Appends one JSON object per span to a file
pub struct JsonLinesExporter {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonLinesExporter {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open span log {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SpanExporter for JsonLinesExporter {
    fn name(&self) -> &str {
        "jsonl"
    }

    fn export(&self, span: &Span) -> Result<()> {
        let line = serde_json::to_string(span)?;
        let mut file = self
            .file
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;
        writeln!(file, "{}", line)?;
        Ok(())
    }
}

/// Writes finished spans to the `tracing` log
pub struct LogExporter;

impl SpanExporter for LogExporter {
    fn name(&self) -> &str {
        "log"
    }

    fn export(&self, span: &Span) -> Result<()> {
        let duration_ms = span.duration_ms.unwrap_or_default();
        match span.status {
            SpanStatus::Error => tracing::warn!(
                trace_id = %span.context.trace_id,
                span = %span.name,
                duration_ms,
                error = span.status_message.as_deref().unwrap_or(""),
                "Span failed"
            ),
            _ => tracing::debug!(
                trace_id = %span.context.trace_id,
                span = %span.name,
                duration_ms,
                "Span finished"
            ),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracer::span::SpanContext;

    #[test]
    fn test_json_lines_appends() {
        let dir = std::env::temp_dir().join(format!("waypoint-spans-{}", uuid::Uuid::new_v4()));
        let path = dir.join("spans.jsonl");
        let exporter = JsonLinesExporter::open(&path).unwrap();

        let mut span = Span::new("a", SpanContext::root());
        span.finish();
        exporter.export(&span).unwrap();
        exporter.export(&span).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
        let parsed: Span = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
        assert_eq!(parsed.name, "a");

        std::fs::remove_dir_all(dir).ok();
    }
}
