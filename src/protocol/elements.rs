//! Interactive elements attached to assistant messages

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Typed list of interactive elements carried by one assistant message
pub type InteractiveContent = Vec<InteractiveElement>;

/// One structured, non-prose payload the agent can emit.
///
/// The set is closed at compile time: adding a variant forces every
/// `match` (notably the renderer) to handle it. Tags the client does not
/// know decode to [`InteractiveElement::Unknown`] and are never shown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InteractiveElement {
    Buttons(ButtonsElement),
    Confirmation(ConfirmationElement),
    FileAnalysis(FileAnalysisElement),
    ColumnMapping(ColumnMappingElement),
    PreviewTable(PreviewTableElement),
    ImportResult(ImportResultElement),
    /// Forward-compatible sink for tags added after this build
    #[serde(other)]
    Unknown,
}

impl InteractiveElement {
    pub fn is_unknown(&self) -> bool {
        matches!(self, InteractiveElement::Unknown)
    }
}

// ============================================================================
// Buttons
// ============================================================================

/// Visual intent of a selectable option
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ButtonVariant {
    #[default]
    Default,
    Primary,
    Secondary,
    Destructive,
    Outline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ButtonOption {
    pub value: String,
    pub label: String,
    #[serde(default)]
    pub variant: ButtonVariant,
}

/// A question plus an ordered set of options; display-only once answered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ButtonsElement {
    pub question: String,
    pub options: Vec<ButtonOption>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected: Option<String>,
}

/// Errors answering a buttons element
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Question already answered with '{0}'")]
    AlreadyAnswered(String),
    #[error("Unknown option: {0}")]
    UnknownOption(String),
    #[error("Element {0} is not a buttons element")]
    NotButtons(usize),
    #[error("Message has no element at index {0}")]
    NoSuchElement(usize),
}

impl ButtonsElement {
    /// Record the chosen option. The set is immutable after the first answer.
    pub fn select(&mut self, value: &str) -> Result<&ButtonOption, ProtocolError> {
        if let Some(previous) = &self.selected {
            return Err(ProtocolError::AlreadyAnswered(previous.clone()));
        }
        let option = self
            .options
            .iter()
            .find(|o| o.value == value)
            .ok_or_else(|| ProtocolError::UnknownOption(value.to_string()))?;
        self.selected = Some(option.value.clone());
        Ok(option)
    }
}

// ============================================================================
// Confirmation
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailRow {
    pub label: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationElement {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub details: Vec<DetailRow>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirm_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_label: Option<String>,
}

// ============================================================================
// File import flow
// ============================================================================

/// Per-column detection result of an uploaded spreadsheet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnAnalysis {
    pub name: String,
    pub detected_type: String,
    pub confidence: f64,
    #[serde(default)]
    pub samples: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileAnalysisElement {
    pub filename: String,
    pub row_count: u64,
    pub column_count: u64,
    #[serde(default)]
    pub columns: Vec<ColumnAnalysis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_category: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub source_column: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_field: Option<String>,
    pub confidence: f64,
    #[serde(default)]
    pub samples: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMappingElement {
    pub mappings: Vec<ColumnMapping>,
    #[serde(default)]
    pub missing_required: Vec<String>,
}

impl ColumnMappingElement {
    /// Whether every required target field has a source column
    pub fn is_complete(&self) -> bool {
        self.missing_required.is_empty()
    }
}

/// Candidate record of an import preview
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviewRow {
    pub data: Map<String, Value>,
    pub valid: bool,
    #[serde(default)]
    pub errors: Vec<String>,
}

/// Bounded sample of candidate records plus aggregates over the whole file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviewTableElement {
    pub rows: Vec<PreviewRow>,
    pub total_rows: u64,
    pub valid_rows: u64,
    pub invalid_rows: u64,
    #[serde(default)]
    pub total_amount: f64,
}

impl PreviewTableElement {
    /// Rows beyond the sample that the table does not show
    pub fn hidden_rows(&self) -> u64 {
        self.total_rows.saturating_sub(self.rows.len() as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportErrorItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row: Option<u64>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportResultElement {
    pub imported: u64,
    pub failed: u64,
    pub skipped: u64,
    pub total_value: f64,
    #[serde(default)]
    pub errors: Vec<ImportErrorItem>,
}

// ============================================================================
// Lenient decoding
// ============================================================================

/// Decode raw element values one by one.
///
/// Unknown tags are dropped silently; malformed known elements are dropped
/// with a warning so one bad element never discards its siblings.
pub fn parse_elements(values: Vec<Value>) -> InteractiveContent {
    values
        .into_iter()
        .filter_map(|value| match serde_json::from_value::<InteractiveElement>(value) {
            Ok(element) if element.is_unknown() => None,
            Ok(element) => Some(element),
            Err(e) => {
                tracing::warn!(error = %e, "Dropping malformed interactive element");
                None
            }
        })
        .collect()
}

/// `deserialize_with` adapter for element lists on the wire
pub fn deserialize_elements<'de, D>(deserializer: D) -> Result<InteractiveContent, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Vec<Value>>::deserialize(deserializer)?;
    Ok(parse_elements(raw.unwrap_or_default()))
}
