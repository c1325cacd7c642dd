//! Data files on disk
//!
//! Loads JSON, YAML, CSV and plain text into a [`serde_json::Value`] and
//! writes JSON, YAML, text or raw bytes back. The format is always an
//! explicit [`DataFormat`]; it is detected from the file extension when
//! loading.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use serde_json::{Map, Value};

/// CSV files use semicolons as separators
const CSV_DELIMITER: u8 = b';';

/// Supported on-disk formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFormat {
    Json,
    Yaml,
    Csv,
    RawText,
    Binary,
}

impl DataFormat {
    /// Detect the format from a file extension (`json`, `yaml`/`yml`, `csv`,
    /// `txt`/`html`). Binary is never detected, only requested.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "json" => Some(DataFormat::Json),
            "yaml" | "yml" => Some(DataFormat::Yaml),
            "csv" => Some(DataFormat::Csv),
            "txt" | "html" => Some(DataFormat::RawText),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            DataFormat::Json => "json",
            DataFormat::Yaml => "yaml",
            DataFormat::Csv => "csv",
            DataFormat::RawText => "txt",
            DataFormat::Binary => "bin",
        }
    }
}

/// Content handed to [`write_data`]
#[derive(Debug, Clone, Copy)]
pub enum Payload<'a> {
    Structured(&'a Value),
    Text(&'a str),
    Bytes(&'a [u8]),
}

/// Load a file, detecting its format from the extension
pub fn load_data(path: &Path) -> Result<Value> {
    let format = DataFormat::from_path(path)
        .with_context(|| format!("Unsupported file format: {:?}", path))?;
    load_data_as(path, format)
}

/// Load a file in the given format
pub fn load_data_as(path: &Path, format: DataFormat) -> Result<Value> {
    let value = match format {
        DataFormat::Json => {
            let contents = read_text(path)?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse JSON from {:?}", path))?
        }
        DataFormat::Yaml => {
            let contents = read_text(path)?;
            serde_yaml::from_str(&contents)
                .with_context(|| format!("Failed to parse YAML from {:?}", path))?
        }
        DataFormat::Csv => load_csv(path)?,
        DataFormat::RawText => Value::String(read_text(path)?),
        DataFormat::Binary => bail!("Binary file {:?} cannot be loaded as structured data", path),
    };

    tracing::debug!("Loaded {:?} as {:?}", path, format);
    Ok(value)
}

fn read_text(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))
}

/// Rows as objects keyed by the header row
fn load_csv(path: &Path) -> Result<Value> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(CSV_DELIMITER)
        .from_path(path)
        .with_context(|| format!("Failed to open CSV {:?}", path))?;

    let headers = reader
        .headers()
        .with_context(|| format!("Failed to read CSV header from {:?}", path))?
        .clone();

    let mut rows = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let record = record
            .with_context(|| format!("Failed to read CSV row {} from {:?}", index + 1, path))?;
        let row: Map<String, Value> = headers
            .iter()
            .zip(record.iter())
            .map(|(name, cell)| (name.to_string(), Value::String(cell.to_string())))
            .collect();
        rows.push(Value::Object(row));
    }

    Ok(Value::Array(rows))
}

/// Write `payload` to `path` in `format`
pub fn write_data(path: &Path, format: DataFormat, payload: Payload<'_>) -> Result<()> {
    let bytes = match (format, payload) {
        (DataFormat::Json, Payload::Structured(value)) => {
            let mut buffer = Vec::new();
            let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
            let mut serializer = serde_json::Serializer::with_formatter(&mut buffer, formatter);
            value
                .serialize(&mut serializer)
                .context("Failed to serialize JSON")?;
            buffer.push(b'\n');
            buffer
        }
        (DataFormat::Yaml, Payload::Structured(value)) => serde_yaml::to_string(value)
            .context("Failed to serialize YAML")?
            .into_bytes(),
        (DataFormat::RawText, Payload::Text(text)) => text.as_bytes().to_vec(),
        (DataFormat::Binary, Payload::Bytes(data)) => data.to_vec(),
        (format, payload) => bail!(
            "Cannot write {} payload as {:?}",
            payload_kind(&payload),
            format
        ),
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {:?}", parent))?;
    }
    fs::write(path, bytes).with_context(|| format!("Failed to write {:?}", path))?;

    tracing::debug!("Wrote {:?} as {:?}", path, format);
    Ok(())
}

fn payload_kind(payload: &Payload<'_>) -> &'static str {
    match payload {
        Payload::Structured(_) => "structured",
        Payload::Text(_) => "text",
        Payload::Bytes(_) => "binary",
    }
}
