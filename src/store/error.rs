use ulid::Ulid;

/// Every failure a store may report. Backend-specific causes are folded into
/// `Other` at the point where they occur.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// (date, lab_id, time_slot, student_id) already present.
    UniqueViolation,
    /// No reservation with this id.
    Missing(Ulid),
    Other(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::UniqueViolation => write!(f, "unique constraint violated"),
            StoreError::Missing(id) => write!(f, "no reservation {id}"),
            StoreError::Other(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for StoreError {}
