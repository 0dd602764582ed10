//! Quality-metrics CSV output.

use std::io::Write;
use std::path::Path;

use crate::engine::MetricsTable;
use crate::error::PipelineError;

/// Writes `table` to `path` as CSV with a leading `unit_id` column.
///
/// The file is written under a temporary name in the same directory and
/// renamed into place, so `path` is either absent or complete.
pub fn write_metrics_csv(path: &Path, table: &MetricsTable) -> Result<(), PipelineError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|e| PipelineError::io(parent, e))?;

    tmp.write_all(render(table).as_bytes())
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| PipelineError::io(tmp.path(), e))?;
    tmp.persist(path).map_err(|e| PipelineError::io(path, e.error))?;
    Ok(())
}

fn render(table: &MetricsTable) -> String {
    let mut out = String::new();
    let header = std::iter::once("unit_id").chain(table.columns.iter().map(String::as_str));
    push_record(&mut out, header.map(escape));

    for row in &table.rows {
        let cells = std::iter::once(&row.unit_id).chain(row.values.iter());
        push_record(&mut out, cells.map(|v| escape(&cell(v))));
    }
    out
}

fn push_record(out: &mut String, cells: impl Iterator<Item = String>) {
    out.push_str(&cells.collect::<Vec<_>>().join(","));
    out.push('\n');
}

fn cell(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn escape(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
