use chrono::NaiveDate;

use crate::store::StoreError;

/// Input field named in validation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    StudentId,
    StudentName,
    AuthNumber,
    Station,
}

impl std::fmt::Display for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Field::StudentId => write!(f, "student id"),
            Field::StudentName => write!(f, "name"),
            Field::AuthNumber => write!(f, "authentication number"),
            Field::Station => write!(f, "station"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    Missing(Field),
    Malformed { field: Field, expected: &'static str },
    TooLong { field: Field, max: usize },
    UnknownStation(String),
    UnknownDate(NaiveDate),
    UnknownTimeSlot(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Missing(field) => write!(f, "{field} is required"),
            ValidationError::Malformed { field, expected } => {
                write!(f, "{field} must be {expected}")
            }
            ValidationError::TooLong { field, max } => {
                write!(f, "{field} is longer than {max} bytes")
            }
            ValidationError::UnknownStation(s) => write!(f, "unknown station: {s}"),
            ValidationError::UnknownDate(d) => write!(f, "{d} is not an event day"),
            ValidationError::UnknownTimeSlot(t) => write!(f, "unknown time slot: {t}"),
        }
    }
}

/// Outcome of a rejected or failed create/cancel. Scoped to the single attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReservationError {
    Validation(ValidationError),
    QuotaExceeded { limit: u32 },
    SlotFull { capacity: u32 },
    DuplicateBooking,
    NotFound,
    AuthMismatch,
    Store(String),
}

impl ReservationError {
    /// Translate an insert failure. The only place store codes are interpreted for creates.
    pub fn from_insert(e: StoreError) -> Self {
        match e {
            StoreError::UniqueViolation => ReservationError::DuplicateBooking,
            StoreError::Missing(_) | StoreError::Other(_) => ReservationError::Store(e.to_string()),
        }
    }

    /// Translate a delete failure. A row already gone means someone else cancelled it.
    pub fn from_delete(e: StoreError) -> Self {
        match e {
            StoreError::Missing(_) => ReservationError::NotFound,
            StoreError::UniqueViolation | StoreError::Other(_) => {
                ReservationError::Store(e.to_string())
            }
        }
    }

    /// Infrastructure failures may succeed on a plain retry; rule rejections need new input.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ReservationError::Store(_))
    }

    /// Short stable label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ReservationError::Validation(_) => "validation",
            ReservationError::QuotaExceeded { .. } => "quota_exceeded",
            ReservationError::SlotFull { .. } => "slot_full",
            ReservationError::DuplicateBooking => "duplicate_booking",
            ReservationError::NotFound => "not_found",
            ReservationError::AuthMismatch => "auth_mismatch",
            ReservationError::Store(_) => "store",
        }
    }
}

impl From<ValidationError> for ReservationError {
    fn from(e: ValidationError) -> Self {
        ReservationError::Validation(e)
    }
}

impl std::fmt::Display for ReservationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReservationError::Validation(e) => write!(f, "invalid input: {e}"),
            ReservationError::QuotaExceeded { limit } => {
                write!(f, "reservation limit reached: at most {limit} per student")
            }
            ReservationError::SlotFull { capacity } => {
                write!(f, "slot is full ({capacity} of {capacity} booked)")
            }
            ReservationError::DuplicateBooking => write!(f, "you already booked this slot"),
            ReservationError::NotFound => write!(f, "no matching reservation"),
            ReservationError::AuthMismatch => write!(f, "authentication number does not match"),
            ReservationError::Store(msg) => write!(f, "store error: {msg}"),
        }
    }
}

impl std::error::Error for ReservationError {}
