//! Receiver configuration: who gets reports, in what shape, and when.

use relay_document::Document;
use relay_schema::ConditionExpr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

/// Delivery file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportFormat {
    Hl7,
    Hl7Batch,
    Csv,
    FhirNdjson,
}

impl ReportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Hl7 | Self::Hl7Batch => "hl7",
            Self::Csv => "csv",
            Self::FhirNdjson => "ndjson",
        }
    }

    /// A format whose unit is one message; batch splits documents into
    /// per-item candidates before grouping.
    pub fn is_single_item(self) -> bool {
        matches!(self, Self::Hl7)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hl7 => "HL7",
            Self::Hl7Batch => "HL7_BATCH",
            Self::Csv => "CSV",
            Self::FhirNdjson => "FHIR_NDJSON",
        }
    }
}

/// How a batch tick groups ready reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchOperation {
    Merge,
    None,
}

/// What to do on a tick with no ready reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EmptyAction {
    Send,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhenEmpty {
    #[serde(default = "default_empty_action")]
    pub action: EmptyAction,
    #[serde(default)]
    pub only_once: bool,
}

fn default_empty_action() -> EmptyAction {
    EmptyAction::None
}

impl Default for WhenEmpty {
    fn default() -> Self {
        Self {
            action: EmptyAction::None,
            only_once: false,
        }
    }
}

/// Batch cadence for a receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timing {
    /// Scheduled ticks per day.
    pub number_per_day: u32,
    /// Item cap per delivery file; absent means unbounded.
    #[serde(default)]
    pub max_report_count: Option<usize>,
    #[serde(default)]
    pub when_empty: WhenEmpty,
}

/// Delivery endpoint configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportConfig {
    /// Drop files into a destination directory.
    File { path: String },
}

/// One downstream receiver.
#[derive(Debug, Clone)]
pub struct Receiver {
    pub organization: String,
    pub name: String,
    pub format: ReportFormat,
    pub batch: BatchOperation,
    pub timing: Timing,
    pub jurisdictional_filter: Vec<ConditionExpr>,
    pub transport: TransportConfig,
    /// Template schema name used by the translate stage.
    pub translation: String,
}

impl Receiver {
    /// A document is routed to this receiver when every filter matches.
    pub fn matches(&self, document: &Document) -> bool {
        self.jurisdictional_filter
            .iter()
            .all(|filter| filter.eval(&document.root))
    }

    /// Deterministic delivery filename for one output report.
    pub fn delivery_filename(&self, report_id: Uuid) -> String {
        format!(
            "{}-{}-{}.{}",
            self.organization,
            self.name,
            report_id,
            self.format.extension()
        )
    }
}

/// Raw serde form before filter expressions are parsed.
#[derive(Debug, Deserialize)]
struct ReceiverFile {
    organization: String,
    name: String,
    format: ReportFormat,
    #[serde(default = "default_batch_operation")]
    batch: BatchOperation,
    timing: Timing,
    #[serde(default)]
    jurisdictional_filter: Vec<String>,
    transport: TransportConfig,
    translation: String,
}

fn default_batch_operation() -> BatchOperation {
    BatchOperation::None
}

impl ReceiverFile {
    fn into_receiver(self) -> Result<Receiver> {
        let mut filters = Vec::with_capacity(self.jurisdictional_filter.len());
        for raw in &self.jurisdictional_filter {
            let expr = ConditionExpr::parse(raw).map_err(|err| {
                Error::config(format!(
                    "receiver '{}.{}' has an invalid filter '{raw}': {err}",
                    self.organization, self.name
                ))
            })?;
            filters.push(expr);
        }
        if self.timing.number_per_day == 0 {
            return Err(Error::config(format!(
                "receiver '{}.{}' must have number_per_day > 0",
                self.organization, self.name
            )));
        }
        Ok(Receiver {
            organization: self.organization,
            name: self.name,
            format: self.format,
            batch: self.batch,
            timing: self.timing,
            jurisdictional_filter: filters,
            transport: self.transport,
            translation: self.translation,
        })
    }
}

/// Load a receiver list from YAML.
///
/// # Errors
///
/// Fails on malformed YAML, unparseable filter expressions, or a zero
/// batch cadence.
pub fn receivers_from_yaml(yaml: &str) -> Result<Vec<Receiver>> {
    let files: Vec<ReceiverFile> = serde_yaml::from_str(yaml)?;
    files.into_iter().map(ReceiverFile::into_receiver).collect()
}
