//! # hx-core - The Record of HALLUX
//!
//! Defines the one entity the data-access layer stores: an [`AnalysisResult`]
//! produced by the hallucination analyzer, and its snake-case persistence
//! mirror [`DatabaseAnalysisResult`].
//!
//! The two shapes convert into each other losslessly. Optional fields that are
//! absent on one side are `None` on the other; no empty-string or zero
//! sentinels are ever introduced by the conversion.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Backend table holding analysis rows.
pub const TABLE: &str = "analysis_results";

/// Column names of the [`TABLE`] rows.
pub mod columns {
    pub const ID: &str = "id";
    pub const USER_ID: &str = "user_id";
    pub const CONTENT: &str = "content";
    pub const FULL_CONTENT: &str = "full_content";
    pub const CREATED_AT: &str = "created_at";
    pub const ACCURACY: &str = "accuracy";
    pub const RISK_LEVEL: &str = "risk_level";
    pub const HALLUCINATIONS: &str = "hallucinations";
    pub const VERIFICATION_SOURCES: &str = "verification_sources";
    pub const PROCESSING_TIME: &str = "processing_time";
    pub const ANALYSIS_TYPE: &str = "analysis_type";
    pub const BATCH_ID: &str = "batch_id";
    pub const SCAN_ID: &str = "scan_id";
    pub const FILENAME: &str = "filename";
}

/// A JSON object as stored by the tabular backend.
pub type Row = serde_json::Map<String, serde_json::Value>;

// =============================================================================
// Enumerations
// =============================================================================

/// Error returned when a textual enum value is not recognised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {} '{}'", self.kind, self.value)
    }
}

impl std::error::Error for UnknownVariant {}

/// Overall risk classification of an analysed document.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub const ALL: [RiskLevel; 4] = [Self::Low, Self::Medium, Self::High, Self::Critical];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskLevel {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            _ => Err(UnknownVariant {
                kind: "risk level",
                value: s.to_string(),
            }),
        }
    }
}

/// How an analysis was triggered.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisType {
    #[default]
    Single,
    Batch,
    Scheduled,
}

impl AnalysisType {
    pub const ALL: [AnalysisType; 3] = [Self::Single, Self::Batch, Self::Scheduled];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Batch => "batch",
            Self::Scheduled => "scheduled",
        }
    }
}

impl fmt::Display for AnalysisType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnalysisType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "single" => Ok(Self::Single),
            "batch" => Ok(Self::Batch),
            "scheduled" => Ok(Self::Scheduled),
            _ => Err(UnknownVariant {
                kind: "analysis type",
                value: s.to_string(),
            }),
        }
    }
}

// =============================================================================
// Entity
// =============================================================================

/// One suspected hallucination inside an analysed text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HallucinationFinding {
    /// The offending text span.
    pub text: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// Detector confidence in `[0, 1]`.
    pub confidence: f64,
    pub explanation: String,
}

/// The domain view of an analysis, as handed to API callers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub id: String,
    pub user_id: String,
    /// Short snippet of the analysed content.
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_content: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Accuracy score, 0 to 100.
    pub accuracy: f64,
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub hallucinations: Vec<HallucinationFinding>,
    #[serde(default)]
    pub verification_sources: u32,
    #[serde(default)]
    pub processing_time_ms: u64,
    #[serde(default)]
    pub analysis_type: AnalysisType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

impl AnalysisResult {
    /// Check the value ranges the store relies on.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("analysis id must not be empty".into());
        }
        if self.user_id.trim().is_empty() {
            return Err(format!("analysis '{}' has no owning user", self.id));
        }
        if !(0.0..=100.0).contains(&self.accuracy) {
            return Err(format!(
                "analysis '{}' accuracy {} outside 0..=100",
                self.id, self.accuracy
            ));
        }
        Ok(())
    }

    pub fn to_database(&self) -> DatabaseAnalysisResult {
        DatabaseAnalysisResult::from(self.clone())
    }

    pub fn from_database(record: DatabaseAnalysisResult) -> Self {
        Self::from(record)
    }
}

/// Snake-case persistence mirror of [`AnalysisResult`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatabaseAnalysisResult {
    pub id: String,
    pub user_id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_content: Option<String>,
    pub created_at: DateTime<Utc>,
    pub accuracy: f64,
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub hallucinations: Vec<HallucinationFinding>,
    #[serde(default)]
    pub verification_sources: u32,
    #[serde(default)]
    pub processing_time: u64,
    /// Rows written before analysis types existed decode as `single`.
    #[serde(default)]
    pub analysis_type: AnalysisType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

impl DatabaseAnalysisResult {
    /// Encode as a backend row.
    pub fn into_row(self) -> Result<Row, serde_json::Error> {
        match serde_json::to_value(self)? {
            serde_json::Value::Object(map) => Ok(map),
            // A struct always serializes to an object.
            other => Err(serde::ser::Error::custom(format!(
                "expected object, got {}",
                other
            ))),
        }
    }

    /// Decode a backend row. Missing optional columns become `None`.
    pub fn from_row(row: Row) -> Result<Self, serde_json::Error> {
        serde_json::from_value(serde_json::Value::Object(row))
    }
}

impl From<AnalysisResult> for DatabaseAnalysisResult {
    fn from(r: AnalysisResult) -> Self {
        Self {
            id: r.id,
            user_id: r.user_id,
            content: r.content,
            full_content: r.full_content,
            created_at: r.timestamp,
            accuracy: r.accuracy,
            risk_level: r.risk_level,
            hallucinations: r.hallucinations,
            verification_sources: r.verification_sources,
            processing_time: r.processing_time_ms,
            analysis_type: r.analysis_type,
            batch_id: r.batch_id,
            scan_id: r.scan_id,
            filename: r.filename,
        }
    }
}

impl From<DatabaseAnalysisResult> for AnalysisResult {
    fn from(r: DatabaseAnalysisResult) -> Self {
        Self {
            id: r.id,
            user_id: r.user_id,
            content: r.content,
            full_content: r.full_content,
            timestamp: r.created_at,
            accuracy: r.accuracy,
            risk_level: r.risk_level,
            hallucinations: r.hallucinations,
            verification_sources: r.verification_sources,
            processing_time_ms: r.processing_time,
            analysis_type: r.analysis_type,
            batch_id: r.batch_id,
            scan_id: r.scan_id,
            filename: r.filename,
        }
    }
}
