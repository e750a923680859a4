use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Message fragments that mark an invalid-regular-expression error as a pattern
/// engine fault rather than ordinary rejection of a malformed pattern.
const PATTERN_FAULT_MARKERS: [&str; 6] = [
    "matching failed",
    "out of memory",
    "cannot happen",
    "too complex",
    "too many distinct states",
    "operation cancelled",
];

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SqlStateError {
    #[error("SQLSTATE must be exactly 5 characters, got {0}")]
    InvalidLength(usize),
    #[error("SQLSTATE may only contain digits and upper-case letters: {0:?}")]
    InvalidCharacter(String),
}

/// A five-character engine error code. The first two characters are its class.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SqlState([u8; 5]);

impl SqlState {
    pub const SYNTAX_ERROR: SqlState = SqlState(*b"42601");
    pub const UNDEFINED_PARAMETER: SqlState = SqlState(*b"42P02");
    pub const CHARACTER_NOT_IN_REPERTOIRE: SqlState = SqlState(*b"22021");
    pub const INVALID_REGULAR_EXPRESSION: SqlState = SqlState(*b"2201B");
    pub const INSUFFICIENT_RESOURCES: SqlState = SqlState(*b"53000");
    pub const OUT_OF_MEMORY: SqlState = SqlState(*b"53200");
    pub const STATEMENT_TOO_COMPLEX: SqlState = SqlState(*b"54001");
    pub const QUERY_CANCELED: SqlState = SqlState(*b"57014");
    pub const ADMIN_SHUTDOWN: SqlState = SqlState(*b"57P01");
    pub const INTERNAL_ERROR: SqlState = SqlState(*b"XX000");

    pub fn new(code: &str) -> Result<Self, SqlStateError> {
        let bytes = code.as_bytes();
        if bytes.len() != 5 {
            return Err(SqlStateError::InvalidLength(bytes.len()));
        }
        if !bytes
            .iter()
            .all(|b| b.is_ascii_digit() || b.is_ascii_uppercase())
        {
            return Err(SqlStateError::InvalidCharacter(code.to_string()));
        }
        let mut raw = [0u8; 5];
        raw.copy_from_slice(bytes);
        Ok(SqlState(raw))
    }

    pub fn as_str(&self) -> &str {
        // Only ASCII alphanumerics are ever stored.
        std::str::from_utf8(&self.0).unwrap_or("?????")
    }

    /// The two-character class, e.g. `54` for program-limit errors.
    pub fn class(&self) -> &str {
        &self.as_str()[..2]
    }
}

impl fmt::Display for SqlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for SqlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SqlState({})", self.as_str())
    }
}

impl Serialize for SqlState {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Outcome category of a raised engine error, in classification priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Category {
    /// Program-complexity or recursion limits (class `54`).
    ResourceLimitExceeded,
    /// Generic out-of-resource errors (class `53`).
    InsufficientResources,
    /// Administrative cancellation, including statement timeouts (class `57`).
    OperatorIntervention,
    /// The engine detected a violation of its own invariants (class `XX`).
    InternalError,
    /// Invalid-regular-expression errors whose message points at the matcher itself.
    PatternEngineFault,
    /// Ordinary rejection of user input. Never surfaced to the fuzz engine.
    Benign,
}

impl Category {
    pub fn is_benign(&self) -> bool {
        matches!(self, Category::Benign)
    }
}

/// Maps an engine error onto a [`Category`].
pub fn classify(code: SqlState, message: &str) -> Category {
    match code.class() {
        "54" => Category::ResourceLimitExceeded,
        "53" => Category::InsufficientResources,
        "57" => Category::OperatorIntervention,
        "XX" => Category::InternalError,
        _ if code == SqlState::INVALID_REGULAR_EXPRESSION
            && PATTERN_FAULT_MARKERS
                .iter()
                .any(|marker| message.contains(marker)) =>
        {
            Category::PatternEngineFault
        }
        _ => Category::Benign,
    }
}

/// A classified engine error, alive for the duration of one trial's failure handling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorRecord {
    pub code: SqlState,
    pub category: Category,
    pub message: String,
    /// Stable name reported to the fuzz engine, `error-<code>`.
    pub name: String,
}

impl ErrorRecord {
    pub fn new(code: SqlState, message: impl Into<String>) -> Self {
        let message = message.into();
        ErrorRecord {
            code,
            category: classify(code, &message),
            name: error_name(code),
            message,
        }
    }
}

pub fn error_name(code: SqlState) -> String {
    format!("error-{code}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlstate_rejects_malformed_codes() {
        assert_eq!(SqlState::new("2201"), Err(SqlStateError::InvalidLength(4)));
        assert!(matches!(
            SqlState::new("2201b"),
            Err(SqlStateError::InvalidCharacter(_))
        ));
        let code = SqlState::new("2201B").unwrap();
        assert_eq!(code, SqlState::INVALID_REGULAR_EXPRESSION);
        assert_eq!(code.class(), "22");
        assert_eq!(code.to_string(), "2201B");
    }

    #[test]
    fn class_based_categories_take_priority() {
        assert_eq!(
            classify(SqlState::STATEMENT_TOO_COMPLEX, "stack depth limit exceeded"),
            Category::ResourceLimitExceeded
        );
        assert_eq!(
            classify(SqlState::OUT_OF_MEMORY, "out of memory"),
            Category::InsufficientResources
        );
        assert_eq!(
            classify(
                SqlState::QUERY_CANCELED,
                "canceling statement due to statement timeout"
            ),
            Category::OperatorIntervention
        );
        assert_eq!(
            classify(SqlState::INTERNAL_ERROR, "unexpected state"),
            Category::InternalError
        );
    }

    #[test]
    fn regex_errors_need_a_fault_marker() {
        let code = SqlState::INVALID_REGULAR_EXPRESSION;
        assert_eq!(
            classify(code, "invalid regular expression: operation cancelled"),
            Category::PatternEngineFault
        );
        assert_eq!(
            classify(code, "invalid regular expression: regular expression is too complex"),
            Category::PatternEngineFault
        );
        assert_eq!(
            classify(code, "invalid regular expression: parentheses () not balanced"),
            Category::Benign
        );
    }

    #[test]
    fn marker_on_other_codes_is_benign() {
        assert_eq!(
            classify(SqlState::SYNTAX_ERROR, "operation cancelled"),
            Category::Benign
        );
    }

    #[test]
    fn error_record_derives_name_from_code() {
        let record = ErrorRecord::new(SqlState::QUERY_CANCELED, "canceling statement");
        assert_eq!(record.name, "error-57014");
        assert_eq!(record.category, Category::OperatorIntervention);
    }
}
