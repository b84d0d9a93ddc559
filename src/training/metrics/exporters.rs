//! Result log and scalar telemetry sinks
//!
//! Both sinks are append-only. The result log holds full-line textual
//! reports keyed by run id; telemetry holds `(name, step, value)` series.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Result;

/// Append-only text log of a run
#[derive(Debug, Clone)]
pub struct ResultLog {
    path: PathBuf,
}

impl ResultLog {
    /// Open (creating parent directories) the log at `path`
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Self { path })
    }

    /// Log file location
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `text` as a full line and mirror it to the tracing output
    pub fn write(&self, text: &str) -> Result<()> {
        info!("{}", text.trim_end());
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{text}")?;
        Ok(())
    }

    /// Full contents written so far
    pub fn read_to_string(&self) -> Result<String> {
        Ok(fs::read_to_string(&self.path)?)
    }
}

/// Sink for scalar time series
pub trait TelemetrySink: Send {
    /// Record `value` of series `name` at `step`
    fn scalar(&mut self, name: &str, value: f64, step: usize) -> Result<()>;

    /// Flush buffered records
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Discards every record
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTelemetry;

impl TelemetrySink for NullTelemetry {
    fn scalar(&mut self, _name: &str, _value: f64, _step: usize) -> Result<()> {
        Ok(())
    }
}

/// One telemetry line
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScalarRecord {
    /// Series name
    pub name: String,
    /// Step or epoch
    pub step: usize,
    /// Value
    pub value: f64,
    /// Wall-clock time of the write
    pub wall_time: DateTime<Utc>,
}

/// Writes one JSON object per line
pub struct JsonlTelemetry {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlTelemetry {
    /// Open (appending) the telemetry file at `path`
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    /// Telemetry file location
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every record of a telemetry file
    pub fn read_records(path: impl AsRef<Path>) -> Result<Vec<ScalarRecord>> {
        let content = fs::read_to_string(path)?;
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| Ok(serde_json::from_str(line)?))
            .collect()
    }
}

impl TelemetrySink for JsonlTelemetry {
    fn scalar(&mut self, name: &str, value: f64, step: usize) -> Result<()> {
        let record = ScalarRecord {
            name: name.to_string(),
            step,
            value,
            wall_time: Utc::now(),
        };
        serde_json::to_writer(&mut self.writer, &record)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

impl Drop for JsonlTelemetry {
    fn drop(&mut self) {
        let _ = self.writer.flush();
    }
}
