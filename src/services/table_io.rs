// Table I/O
// Row source and result sink backed by JSON / JSON Lines files

use crate::models::{ResultTable, RowTable};
use crate::services::config_store::PersistenceError;
use serde_json::{Map, Value};
use std::fs;
use std::path::Path;
use tracing::info;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TableFormat {
    /// A single JSON array of objects.
    Json,
    /// One JSON object per line.
    JsonLines,
}

impl TableFormat {
    pub fn from_path(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref()
        {
            Some("jsonl") | Some("ndjson") => TableFormat::JsonLines,
            _ => TableFormat::Json,
        }
    }
}

fn into_record(value: Value, position: usize) -> Result<Map<String, Value>, String> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(format!(
            "row {} is not an object (found {})",
            position,
            match other {
                Value::Array(_) => "array",
                Value::String(_) => "string",
                Value::Number(_) => "number",
                Value::Bool(_) => "bool",
                _ => "null",
            }
        )),
    }
}

pub fn parse_rows(content: &str, format: TableFormat) -> Result<RowTable, String> {
    let records = match format {
        TableFormat::Json => {
            let value: Value = serde_json::from_str(content).map_err(|e| e.to_string())?;
            let items = match value {
                Value::Array(items) => items,
                _ => return Err("expected a JSON array of row objects".to_string()),
            };
            items
                .into_iter()
                .enumerate()
                .map(|(i, v)| into_record(v, i + 1))
                .collect::<Result<Vec<_>, _>>()?
        }
        TableFormat::JsonLines => content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(i, line)| {
                let value: Value =
                    serde_json::from_str(line).map_err(|e| format!("line {}: {}", i + 1, e))?;
                into_record(value, i + 1)
            })
            .collect::<Result<Vec<_>, _>>()?,
    };
    Ok(RowTable::from_records(records))
}

/// Read the input table. Rows keep file order; columns keep first-seen order.
pub fn read_rows(path: &Path) -> Result<RowTable, PersistenceError> {
    let content =
        fs::read_to_string(path).map_err(|e| PersistenceError::io("read rows", path, e))?;
    let table = parse_rows(&content, TableFormat::from_path(path)).map_err(|message| {
        PersistenceError::Parse {
            path: path.to_path_buf(),
            message,
        }
    })?;
    info!(
        "[TABLE] loaded {} rows, {} columns from {}",
        table.len(),
        table.columns.len(),
        path.display()
    );
    Ok(table)
}

pub fn render_results(table: &ResultTable, format: TableFormat) -> Result<String, PersistenceError> {
    let records = table.to_records();
    match format {
        TableFormat::Json => serde_json::to_string_pretty(&records)
            .map_err(|e| PersistenceError::Serialize(e.to_string())),
        TableFormat::JsonLines => {
            let mut out = String::new();
            for record in &records {
                let line = serde_json::to_string(record)
                    .map_err(|e| PersistenceError::Serialize(e.to_string()))?;
                out.push_str(&line);
                out.push('\n');
            }
            Ok(out)
        }
    }
}

/// Persist the result table. Only called on explicit request.
pub fn write_results(path: &Path, table: &ResultTable) -> Result<(), PersistenceError> {
    let content = render_results(table, TableFormat::from_path(path))?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| PersistenceError::io("create output dir", parent, e))?;
    }
    fs::write(path, content).map_err(|e| PersistenceError::io("write results", path, e))?;
    info!("[TABLE] wrote {} rows to {}", table.rows.len(), path.display());
    Ok(())
}
