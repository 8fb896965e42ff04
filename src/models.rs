//! Shared domain types: status enums, canonical units, money helpers.

use serde::{Deserialize, Serialize};

/// Canonical unit-of-measure codes. Everything a customer writes on an order
/// line is mapped into this closed set or rejected as unknown.
pub const CANONICAL_UOMS: [&str; 11] = [
    "ST", "M", "CM", "MM", "KG", "G", "L", "ML", "KAR", "PAL", "SET",
];

/// Map a raw unit string (any language, any casing) to a canonical UoM code.
/// Returns `None` when the unit is not recognized.
pub fn canonical_uom(raw: &str) -> Option<&'static str> {
    let norm = raw.trim().trim_end_matches('.').to_uppercase();
    match norm.as_str() {
        "ST" | "STK" | "STUECK" | "STÜCK" | "PC" | "PCS" | "PIECE" | "PIECES" | "EA" | "EACH"
        | "UNIT" | "X" => Some("ST"),
        "M" | "MTR" | "METER" | "METRE" | "LFM" => Some("M"),
        "CM" => Some("CM"),
        "MM" => Some("MM"),
        "KG" | "KILO" | "KILOGRAM" | "KILOGRAMM" => Some("KG"),
        "G" | "GR" | "GRAM" | "GRAMM" => Some("G"),
        "L" | "LT" | "LTR" | "LITER" | "LITRE" => Some("L"),
        "ML" => Some("ML"),
        "KAR" | "KARTON" | "CARTON" | "BOX" | "CTN" => Some("KAR"),
        "PAL" | "PALETTE" | "PALLET" | "PLT" => Some("PAL"),
        "SET" | "KIT" => Some("SET"),
        _ => None,
    }
}

/// Normalize a customer SKU for mapping lookups and trigram search:
/// uppercase, separators stripped.
pub fn normalize_sku(raw: &str) -> String {
    raw.trim()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_uppercase()
}

/// Convert a decimal amount to integer micros (half-up rounding).
pub fn micros_from_f64(amount: f64) -> i64 {
    (amount * 1_000_000.0).round() as i64
}

pub fn micros_to_f64(micros: i64) -> f64 {
    micros as f64 / 1_000_000.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentStatus {
    Uploaded,
    Stored,
    Processing,
    Extracted,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Uploaded => "UPLOADED",
            DocumentStatus::Stored => "STORED",
            DocumentStatus::Processing => "PROCESSING",
            DocumentStatus::Extracted => "EXTRACTED",
            DocumentStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "UPLOADED" => Some(DocumentStatus::Uploaded),
            "STORED" => Some(DocumentStatus::Stored),
            "PROCESSING" => Some(DocumentStatus::Processing),
            "EXTRACTED" => Some(DocumentStatus::Extracted),
            "FAILED" => Some(DocumentStatus::Failed),
            _ => None,
        }
    }

    /// UPLOADED → STORED → PROCESSING → (EXTRACTED | FAILED), with
    /// FAILED → PROCESSING as the only retry edge.
    pub fn can_transition(from: DocumentStatus, to: DocumentStatus) -> bool {
        use DocumentStatus::*;
        matches!(
            (from, to),
            (Uploaded, Stored)
                | (Uploaded, Failed)
                | (Stored, Processing)
                | (Stored, Failed)
                | (Processing, Extracted)
                | (Processing, Failed)
                | (Failed, Processing)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DraftStatus {
    New,
    Extracted,
    Matched,
    Ready,
    Approved,
    Pushed,
    Acked,
    Failed,
}

impl DraftStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DraftStatus::New => "NEW",
            DraftStatus::Extracted => "EXTRACTED",
            DraftStatus::Matched => "MATCHED",
            DraftStatus::Ready => "READY",
            DraftStatus::Approved => "APPROVED",
            DraftStatus::Pushed => "PUSHED",
            DraftStatus::Acked => "ACKED",
            DraftStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NEW" => Some(DraftStatus::New),
            "EXTRACTED" => Some(DraftStatus::Extracted),
            "MATCHED" => Some(DraftStatus::Matched),
            "READY" => Some(DraftStatus::Ready),
            "APPROVED" => Some(DraftStatus::Approved),
            "PUSHED" => Some(DraftStatus::Pushed),
            "ACKED" => Some(DraftStatus::Acked),
            "FAILED" => Some(DraftStatus::Failed),
            _ => None,
        }
    }

    pub fn can_transition(from: DraftStatus, to: DraftStatus) -> bool {
        use DraftStatus::*;
        matches!(
            (from, to),
            (New, Extracted)
                | (Extracted, Matched)
                | (Matched, Ready)
                | (Ready, Matched)
                | (Ready, Approved)
                | (Approved, Pushed)
                | (Pushed, Acked)
                | (Pushed, Failed)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExportStatus {
    Pending,
    Sent,
    Acked,
    Failed,
}

impl ExportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportStatus::Pending => "PENDING",
            ExportStatus::Sent => "SENT",
            ExportStatus::Acked => "ACKED",
            ExportStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(ExportStatus::Pending),
            "SENT" => Some(ExportStatus::Sent),
            "ACKED" => Some(ExportStatus::Acked),
            "FAILED" => Some(ExportStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ExportStatus::Acked | ExportStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MappingStatus {
    Suggested,
    Confirmed,
    Rejected,
    Deprecated,
}

impl MappingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MappingStatus::Suggested => "SUGGESTED",
            MappingStatus::Confirmed => "CONFIRMED",
            MappingStatus::Rejected => "REJECTED",
            MappingStatus::Deprecated => "DEPRECATED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SUGGESTED" => Some(MappingStatus::Suggested),
            "CONFIRMED" => Some(MappingStatus::Confirmed),
            "REJECTED" => Some(MappingStatus::Rejected),
            "DEPRECATED" => Some(MappingStatus::Deprecated),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueSeverity {
    Info,
    Warning,
    Error,
}

impl IssueSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueSeverity::Info => "INFO",
            IssueSeverity::Warning => "WARNING",
            IssueSeverity::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "INFO" => Some(IssueSeverity::Info),
            "WARNING" => Some(IssueSeverity::Warning),
            "ERROR" => Some(IssueSeverity::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueStatus {
    Open,
    Acknowledged,
    Resolved,
    Overridden,
}

impl IssueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueStatus::Open => "OPEN",
            IssueStatus::Acknowledged => "ACKNOWLEDGED",
            IssueStatus::Resolved => "RESOLVED",
            IssueStatus::Overridden => "OVERRIDDEN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OPEN" => Some(IssueStatus::Open),
            "ACKNOWLEDGED" => Some(IssueStatus::Acknowledged),
            "RESOLVED" => Some(IssueStatus::Resolved),
            "OVERRIDDEN" => Some(IssueStatus::Overridden),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    Rule,
    LlmText,
    LlmVision,
}

impl ExtractionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionMethod::Rule => "rule",
            ExtractionMethod::LlmText => "llm_text",
            ExtractionMethod::LlmVision => "llm_vision",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchStatus {
    Matched,
    Suggested,
    Unmatched,
}

impl MatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchStatus::Matched => "MATCHED",
            MatchStatus::Suggested => "SUGGESTED",
            MatchStatus::Unmatched => "UNMATCHED",
        }
    }
}
