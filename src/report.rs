use crate::models::{keys, Feature, Source};
use anyhow::{Context, Result};
use csv::Writer;
use parking_lot::Mutex;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use tracing::{info, warn};

const OSM_BASE_URL: &str = "https://www.openstreetmap.org";
const MISSING_OSM_NOTE: &str = "missing OSM point";

/// One merge decision: `from` was absorbed into `to`.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeDecision {
    pub from_id: String,
    pub from_link: String,
    pub to_id: String,
    pub to_link: String,
    /// Neither side came from OSM, so the place is probably missing there
    pub missing_primary: bool,
}

impl MergeDecision {
    pub fn new(from: &Feature, to: &Feature) -> Self {
        Self {
            from_id: from.id.clone(),
            from_link: website_url(from),
            to_id: to.id.clone(),
            to_link: website_url(to),
            missing_primary: from.source != Source::Osm && to.source != Source::Osm,
        }
    }
}

/// Link an auditor can follow to inspect a feature at its origin.
pub fn website_url(feature: &Feature) -> String {
    if let Some(site) = feature.attribute_str(keys::WEBSITE) {
        return site.to_string();
    }
    if feature.source == Source::Osm {
        if let Some((kind, number)) = feature.id.split_once('_') {
            if !kind.is_empty() && !number.is_empty() && !number.contains('_') {
                return format!("{OSM_BASE_URL}/{kind}/{number}");
            }
        }
    }
    let wikipedia_prefix = format!("{}:", keys::WIKIPEDIA);
    for (key, value) in &feature.attributes {
        let (Some(language), Some(title)) = (key.strip_prefix(&wikipedia_prefix), value.as_str())
        else {
            continue;
        };
        if !title.trim().is_empty() {
            return format!(
                "https://{language}.wikipedia.org/wiki/{}",
                title.trim().replace(' ', "_")
            );
        }
    }
    String::new()
}

/// Receives merge decisions. Implementations must not block or fail the merge.
pub trait ReportSink: Send + Sync {
    fn record(&self, decision: &MergeDecision);

    /// Free-form progress note, e.g. pass start and finish.
    fn note(&self, _message: &str) {}
}

/// Writes decisions to the `merge_report` tracing target.
#[derive(Debug, Default)]
pub struct TracingReportSink;

impl ReportSink for TracingReportSink {
    fn record(&self, decision: &MergeDecision) {
        if decision.missing_primary {
            info!(target: "merge_report", to = %decision.to_id, "There's probably a need to add an OSM point here");
        }
        info!(
            target: "merge_report",
            from = %decision.from_id,
            from_link = %decision.from_link,
            to = %decision.to_id,
            to_link = %decision.to_link,
            "Merged"
        );
    }

    fn note(&self, message: &str) {
        info!(target: "merge_report", "{message}");
    }
}

/// Keeps decisions in memory.
#[derive(Debug, Default)]
pub struct MemoryReportSink {
    decisions: Mutex<Vec<MergeDecision>>,
    notes: Mutex<Vec<String>>,
}

impl MemoryReportSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decisions(&self) -> Vec<MergeDecision> {
        self.decisions.lock().clone()
    }

    pub fn notes(&self) -> Vec<String> {
        self.notes.lock().clone()
    }
}

impl ReportSink for MemoryReportSink {
    fn record(&self, decision: &MergeDecision) {
        self.decisions.lock().push(decision.clone());
    }

    fn note(&self, message: &str) {
        self.notes.lock().push(message.to_string());
    }
}

/// Audit file with one row per decision.
pub struct CsvReportSink {
    writer: Mutex<Writer<BufWriter<File>>>,
}

impl CsvReportSink {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("Failed to create report file: {:?}", path))?;
        let mut writer = Writer::from_writer(BufWriter::new(file));
        writer
            .write_record(["from_id", "from_link", "to_id", "to_link", "note"])
            .context("Failed to write report header")?;
        Ok(Self {
            writer: Mutex::new(writer),
        })
    }

    pub fn flush(&self) -> Result<()> {
        self.writer.lock().flush().context("Failed to flush report")
    }
}

impl ReportSink for CsvReportSink {
    fn record(&self, decision: &MergeDecision) {
        let note = if decision.missing_primary {
            MISSING_OSM_NOTE
        } else {
            ""
        };
        let result = self.writer.lock().write_record([
            decision.from_id.as_str(),
            decision.from_link.as_str(),
            decision.to_id.as_str(),
            decision.to_link.as_str(),
            note,
        ]);
        if let Err(e) = result {
            warn!(error = %e, from = %decision.from_id, "Failed to write report row");
        }
    }
}
