//! Error types for the formula engine.
//!
//! Every failure path returns exactly one [`Error`] variant, and every variant
//! classifies into one [`ErrorKind`] so callers can render a precise message.

use thiserror::Error;

use crate::formula::ValueKind;

/// Engine operation error.
#[derive(Debug, Error)]
pub enum Error {
    /// Formula key unknown, or known but without any version.
    #[error("formula not found: {key}")]
    FormulaNotFound { key: String },

    /// The exact `(key, sequence)` pair was never published.
    #[error("formula {key} has no version {sequence}")]
    VersionNotFound { key: String, sequence: u32 },

    #[error("line item not found: {id}")]
    LineItemNotFound { id: String },

    #[error("estimate not found: {id}")]
    EstimateNotFound { id: String },

    /// Formula-driven line item that has never been computed.
    #[error("line item {line_item_id} has no usage snapshot")]
    SnapshotNotFound { line_item_id: String },

    /// Rejected at publish time (syntax or declaration problem).
    #[error("invalid formula {key}: {reason}")]
    InvalidFormula { key: String, reason: String },

    #[error("missing input(s): {}", names.join(", "))]
    MissingInput { names: Vec<String> },

    /// Declared input supplied with the wrong kind of value.
    #[error("input {name} must be {expected}, got {found}")]
    InputTypeMismatch {
        name: String,
        expected: ValueKind,
        found: ValueKind,
    },

    /// Operand of the wrong kind while evaluating `binding`.
    #[error("{binding}: expected {expected} operand for {operation}, got {found}")]
    TypeMismatch {
        binding: String,
        operation: &'static str,
        expected: ValueKind,
        found: ValueKind,
    },

    #[error("{binding}: unknown variable {name}")]
    UnknownVariable { binding: String, name: String },

    #[error("{binding}: forward reference to {name}")]
    ForwardReference { binding: String, name: String },

    #[error("{binding}: division by zero")]
    DivisionByZero { binding: String },

    #[error("{binding}: arithmetic overflow")]
    ArithmeticOverflow { binding: String },

    #[error("{binding}: invalid argument to {function}: {reason}")]
    InvalidArgument {
        binding: String,
        function: &'static str,
        reason: String,
    },

    #[error("cyclic reference: {}", cycle.join(" -> "))]
    CyclicReference { cycle: Vec<String> },

    #[error("formula did not produce output(s): {}", missing.join(", "))]
    IncompleteOutput { missing: Vec<String> },

    /// Not a pipeline failure: the line item carries a manual value.
    #[error("line item {line_item_id} has no formula assigned")]
    NoFormulaAssigned { line_item_id: String },

    /// Snapshot references a formula the registry cannot resolve.
    #[error("snapshot references formula {key} v{sequence} which the registry cannot resolve")]
    OrphanedFormula { key: String, sequence: u32 },

    #[error("line item {line_item_id}: invalid line total {output}: {reason}")]
    InvalidLineTotal {
        line_item_id: String,
        output: String,
        reason: String,
    },

    /// A line item stays with the estimate it was first saved under.
    #[error("line item {id} belongs to estimate {from}, not {to}")]
    LineItemMoved { id: String, from: String, to: String },

    /// Two publishers raced past the per-key guard.
    #[error("concurrent publish detected for {key} (expected next sequence {expected})")]
    PublishConflict { key: String, expected: u32 },

    #[error("storage operation failed")]
    Storage(#[from] rusqlite::Error),

    #[error("failed to encode or decode stored data")]
    Serialization(#[from] serde_json::Error),

    /// Stored row that no longer satisfies its own invariants.
    #[error("corrupt record in {table}: {reason}")]
    Corrupt { table: &'static str, reason: String },
}

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    InvalidFormula,
    MissingInput,
    TypeMismatch,
    DivisionByZero,
    CyclicReference,
    IncompleteOutput,
    Evaluation,
    NoFormulaAssigned,
    OrphanedFormula,
    InvalidLineTotal,
    Conflict,
    Storage,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidFormula => "invalid_formula",
            ErrorKind::MissingInput => "missing_input",
            ErrorKind::TypeMismatch => "type_mismatch",
            ErrorKind::DivisionByZero => "division_by_zero",
            ErrorKind::CyclicReference => "cyclic_reference",
            ErrorKind::IncompleteOutput => "incomplete_output",
            ErrorKind::Evaluation => "evaluation",
            ErrorKind::NoFormulaAssigned => "no_formula_assigned",
            ErrorKind::OrphanedFormula => "orphaned_formula",
            ErrorKind::InvalidLineTotal => "invalid_line_total",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Storage => "storage",
        }
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::FormulaNotFound { .. }
            | Self::VersionNotFound { .. }
            | Self::LineItemNotFound { .. }
            | Self::EstimateNotFound { .. }
            | Self::SnapshotNotFound { .. } => ErrorKind::NotFound,
            Self::InvalidFormula { .. } => ErrorKind::InvalidFormula,
            Self::MissingInput { .. } => ErrorKind::MissingInput,
            Self::InputTypeMismatch { .. } | Self::TypeMismatch { .. } => ErrorKind::TypeMismatch,
            Self::DivisionByZero { .. } => ErrorKind::DivisionByZero,
            Self::CyclicReference { .. } => ErrorKind::CyclicReference,
            Self::IncompleteOutput { .. } => ErrorKind::IncompleteOutput,
            Self::UnknownVariable { .. }
            | Self::ForwardReference { .. }
            | Self::ArithmeticOverflow { .. }
            | Self::InvalidArgument { .. } => ErrorKind::Evaluation,
            Self::NoFormulaAssigned { .. } => ErrorKind::NoFormulaAssigned,
            Self::OrphanedFormula { .. } => ErrorKind::OrphanedFormula,
            Self::InvalidLineTotal { .. } => ErrorKind::InvalidLineTotal,
            Self::LineItemMoved { .. } => ErrorKind::Conflict,
            Self::PublishConflict { .. }
            | Self::Storage(_)
            | Self::Serialization(_)
            | Self::Corrupt { .. } => ErrorKind::Storage,
        }
    }

    /// True for failures caused by the formula or its input data, as opposed
    /// to lookups or storage. These are never retried.
    pub fn is_evaluation_failure(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::MissingInput
                | ErrorKind::TypeMismatch
                | ErrorKind::DivisionByZero
                | ErrorKind::CyclicReference
                | ErrorKind::IncompleteOutput
                | ErrorKind::Evaluation
                | ErrorKind::InvalidLineTotal
        )
    }

    /// Get a user-friendly message for this error.
    pub fn user_message(&self) -> String {
        match self {
            Self::FormulaNotFound { key } => format!("No published formula named '{}'.", key),
            Self::VersionNotFound { key, sequence } => {
                format!("Formula '{}' has no version {}.", key, sequence)
            }
            Self::LineItemNotFound { id } => format!("Line item '{}' does not exist.", id),
            Self::EstimateNotFound { id } => format!("Estimate '{}' does not exist.", id),
            Self::SnapshotNotFound { line_item_id } => format!(
                "Line item '{}' has not been computed yet.",
                line_item_id
            ),
            Self::InvalidFormula { key, reason } => {
                format!("Formula '{}' could not be published: {}", key, reason)
            }
            Self::MissingInput { names } => {
                format!("Please provide a value for: {}.", names.join(", "))
            }
            Self::InputTypeMismatch {
                name,
                expected,
                found,
            } => format!("Input '{}' should be a {}, not a {}.", name, expected, found),
            Self::NoFormulaAssigned { .. } => {
                "This line item uses a manual value; there is nothing to compute.".to_string()
            }
            Self::LineItemMoved { id, from, .. } => format!(
                "Line item '{}' belongs to estimate '{}' and cannot be moved.",
                id, from
            ),
            Self::OrphanedFormula { key, sequence } => format!(
                "Data integrity warning: formula '{}' version {} can no longer be found.",
                key, sequence
            ),
            Self::Storage(_) | Self::Serialization(_) | Self::Corrupt { .. } => {
                "The estimate data could not be read or saved. Please try again.".to_string()
            }
            other => format!("The formula could not be evaluated: {}.", other),
        }
    }
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
