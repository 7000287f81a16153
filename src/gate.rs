//! Interrupts that suspend a conversation pending user input
//!
//! A turn may end by asking the user either to approve a mutating action
//! ([`PendingAction`]) or to fill in structured fields ([`DataRequest`]).
//! Which of the two is open is a property of the conversation state; see
//! [`Gate`].

use crate::protocol::{ConfirmationElement, DetailRow};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Prefix of the synthetic user message carrying submitted field values
pub const SUBMISSION_PREFIX: &str = "Dados fornecidos: ";

/// Acknowledgement appended when the user dismisses a data request
pub const DATA_CANCELLED_MESSAGE: &str =
    "Tudo bem, cancelei a solicitação. Posso ajudar com mais alguma coisa?";

const CONFIRM_LABEL: &str = "Confirmar";
const IRREVERSIBLE_NOTICE: &str = "Esta ação não pode ser desfeita.";
const CANCEL_LABEL: &str = "Cancelar";

// ============================================================================
// Pending Action
// ============================================================================

/// Kind of mutation the agent wants to perform.
///
/// Open to extension: unrecognised kinds are kept verbatim in `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ActionType {
    CreateTransaction,
    UpdateTransaction,
    DeleteTransaction,
    CreateGoal,
    CreateBudget,
    Other(String),
}

impl ActionType {
    pub fn as_str(&self) -> &str {
        match self {
            ActionType::CreateTransaction => "create_transaction",
            ActionType::UpdateTransaction => "update_transaction",
            ActionType::DeleteTransaction => "delete_transaction",
            ActionType::CreateGoal => "create_goal",
            ActionType::CreateBudget => "create_budget",
            ActionType::Other(s) => s,
        }
    }

    /// Title shown on the confirmation card
    pub fn title(&self) -> String {
        match self {
            ActionType::CreateTransaction => "Criar transação".to_string(),
            ActionType::UpdateTransaction => "Atualizar transação".to_string(),
            ActionType::DeleteTransaction => "Excluir transação".to_string(),
            ActionType::CreateGoal => "Criar meta".to_string(),
            ActionType::CreateBudget => "Criar orçamento".to_string(),
            ActionType::Other(s) => format!("Confirmar ação: {s}"),
        }
    }

    pub fn is_destructive(&self) -> bool {
        matches!(self, ActionType::DeleteTransaction)
    }
}

impl From<String> for ActionType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "create_transaction" => ActionType::CreateTransaction,
            "update_transaction" => ActionType::UpdateTransaction,
            "delete_transaction" => ActionType::DeleteTransaction,
            "create_goal" => ActionType::CreateGoal,
            "create_budget" => ActionType::CreateBudget,
            _ => ActionType::Other(s),
        }
    }
}

impl From<ActionType> for String {
    fn from(a: ActionType) -> Self {
        a.as_str().to_string()
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A proposed mutation awaiting consent. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingAction {
    /// Single-use correlation token echoed back on resumption
    pub id: String,
    pub action_type: ActionType,
    #[serde(default)]
    pub action_data: Map<String, Value>,
}

impl PendingAction {
    /// Payload resuming the suspended call with the user's answer
    pub fn resolve(&self, confirmed: bool) -> ConfirmationPayload {
        ConfirmationPayload {
            confirmation_token: self.id.clone(),
            confirmed,
        }
    }

    /// Card presented to the user while the gate is open
    pub fn to_confirmation_element(&self) -> ConfirmationElement {
        let details = self
            .action_data
            .iter()
            .map(|(key, value)| DetailRow {
                label: key.clone(),
                value: display_value(value),
            })
            .collect();

        ConfirmationElement {
            title: self.action_type.title(),
            description: if self.action_type.is_destructive() {
                IRREVERSIBLE_NOTICE.to_string()
            } else {
                String::new()
            },
            details,
            confirm_label: Some(CONFIRM_LABEL.to_string()),
            cancel_label: Some(CANCEL_LABEL.to_string()),
        }
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "-".to_string(),
        other => other.to_string(),
    }
}

/// Sent in place of a message list to resume a suspended call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationPayload {
    pub confirmation_token: String,
    pub confirmed: bool,
}

// ============================================================================
// Data Request
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Number,
    Currency,
    Date,
    Select,
}

/// One input of a data request form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub name: String,
    pub label: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Allowed values for `select` fields
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

/// Submitted values keyed by field name
pub type FieldValues = BTreeMap<String, Value>;

/// Validation messages keyed by field name
pub type FieldErrors = BTreeMap<String, String>;

/// A form the user must fill before the agent can proceed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRequest {
    /// Why the agent needs the data
    #[serde(default)]
    pub context: String,
    pub fields: Vec<FieldDefinition>,
}

impl DataRequest {
    /// Values the form starts with: every field that declares a default
    pub fn initial_values(&self) -> FieldValues {
        self.fields
            .iter()
            .filter_map(|f| f.default.clone().map(|d| (f.name.clone(), d)))
            .collect()
    }

    /// Check `values` against the field definitions.
    ///
    /// Required fields must be present and non-blank. Present values must
    /// match the field type. Values for names the request does not define
    /// are passed through untouched.
    pub fn validate(&self, values: &FieldValues) -> Result<(), FieldErrors> {
        let mut errors = FieldErrors::new();

        for field in &self.fields {
            match values.get(&field.name).filter(|v| !is_blank(v)) {
                None if field.required => {
                    errors.insert(
                        field.name.clone(),
                        format!("{} é obrigatório", field.label),
                    );
                }
                None => {}
                Some(value) => {
                    if let Err(message) = check_type(field, value) {
                        errors.insert(field.name.clone(), message);
                    }
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

fn check_type(field: &FieldDefinition, value: &Value) -> Result<(), String> {
    match field.field_type {
        FieldType::Text => Ok(()),
        FieldType::Number | FieldType::Currency => {
            if parse_number(value).is_some() {
                Ok(())
            } else {
                Err(format!("{} deve ser um número", field.label))
            }
        }
        FieldType::Date => {
            let valid = value
                .as_str()
                .is_some_and(|s| chrono::NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").is_ok());
            if valid {
                Ok(())
            } else {
                Err(format!("{} deve ser uma data (AAAA-MM-DD)", field.label))
            }
        }
        FieldType::Select => {
            let chosen = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            if field.options.is_empty() || field.options.contains(&chosen) {
                Ok(())
            } else {
                Err(format!("{} deve ser uma das opções disponíveis", field.label))
            }
        }
    }
}

/// Numbers arrive either as JSON numbers or as text, possibly with a
/// decimal comma
fn parse_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().replace(',', ".").parse::<f64>().ok(),
        _ => None,
    }
}

/// Body of the synthetic user message carrying submitted values
pub fn format_submission(values: &FieldValues) -> String {
    let json = serde_json::to_string(values).unwrap_or_else(|_| "{}".to_string());
    format!("{SUBMISSION_PREFIX}{json}")
}

// ============================================================================
// Gate view
// ============================================================================

/// Which interrupt, if any, currently holds the conversation.
///
/// Derived from the conversation state, so both gates can never be open at
/// once.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Gate<'a> {
    Idle,
    AwaitingConfirmation(&'a PendingAction),
    AwaitingData(&'a DataRequest),
}

impl Gate<'_> {
    pub fn is_open(&self) -> bool {
        !matches!(self, Gate::Idle)
    }
}

/// Serializable form of an open gate for observers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GateView {
    Confirmation {
        pending_action: PendingAction,
        element: ConfirmationElement,
    },
    Data {
        request: DataRequest,
        initial_values: FieldValues,
    },
}

impl GateView {
    pub fn from_gate(gate: Gate<'_>) -> Option<Self> {
        match gate {
            Gate::Idle => None,
            Gate::AwaitingConfirmation(action) => Some(GateView::Confirmation {
                element: action.to_confirmation_element(),
                pending_action: action.clone(),
            }),
            Gate::AwaitingData(request) => Some(GateView::Data {
                initial_values: request.initial_values(),
                request: request.clone(),
            }),
        }
    }
}
