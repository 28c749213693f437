use super::summary::StatsSummary;
use super::UsageTracker;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{error, info};

/// On-disk layout of an export.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExportFormat {
    /// One pretty-printed document.
    #[default]
    Json,
    /// One record per line: the export metadata, then one line per section.
    JsonLines,
}

impl ExportFormat {
    /// File extension used for exports in this format.
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::JsonLines => "jsonl",
        }
    }
}

#[derive(Debug, Serialize)]
struct ExportMetadata<'a> {
    export_timestamp: DateTime<Utc>,
    app_name: &'a str,
    days_included: u32,
    total_calls: u64,
}

impl UsageTracker {
    /// Write a point-in-time export under `<storage>/exports/` and return its
    /// path. Failures are logged and yield `None`.
    pub fn export_data(&self, format: ExportFormat, days_back: u32) -> Option<PathBuf> {
        let now = self.inner.clock.now_utc();
        let summary = self.stats_summary(days_back);
        let (api_types, custom_metrics, total_calls) = {
            let state = self.lock();
            (
                serde_json::to_value(&state.api_types),
                serde_json::to_value(&state.custom_metrics),
                state.metadata.total_calls_ever,
            )
        };
        let metadata = ExportMetadata {
            export_timestamp: now,
            app_name: &self.inner.app_name,
            days_included: days_back,
            total_calls,
        };

        let file_name =
            format!("api_monitoring_export_{}.{}", now.format("%Y%m%d_%H%M%S"), format.extension());
        let path = self.inner.exports_dir.join(file_name);

        let sections = match export_sections(&metadata, &summary, api_types, custom_metrics) {
            Ok(sections) => sections,
            Err(e) => {
                error!(error = %e, "export serialization failed");
                return None;
            }
        };

        match write_export(&path, format, sections) {
            Ok(()) => {
                info!(path = %path.display(), days_back, "data exported");
                Some(path)
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "export failed");
                None
            }
        }
    }
}

fn export_sections(
    metadata: &ExportMetadata<'_>,
    summary: &StatsSummary,
    api_types: serde_json::Result<Value>,
    custom_metrics: serde_json::Result<Value>,
) -> serde_json::Result<Vec<(&'static str, Value)>> {
    Ok(vec![
        ("metadata", serde_json::to_value(metadata)?),
        ("summary", serde_json::to_value(summary)?),
        ("api_types", api_types?),
        ("custom_metrics", custom_metrics?),
    ])
}

fn write_export(path: &Path, format: ExportFormat, sections: Vec<(&'static str, Value)>) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = io::BufWriter::new(fs::File::create(path)?);
    match format {
        ExportFormat::Json => {
            let doc: serde_json::Map<String, Value> =
                sections.into_iter().map(|(k, v)| (k.to_string(), v)).collect();
            serde_json::to_writer_pretty(&mut file, &doc)?;
        }
        ExportFormat::JsonLines => {
            for (section, data) in sections {
                let line = serde_json::json!({ "section": section, "data": data });
                serde_json::to_writer(&mut file, &line)?;
                file.write_all(b"\n")?;
            }
        }
    }
    file.flush()
}
