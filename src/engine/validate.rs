use crate::catalog;
use crate::config::EventConfig;
use crate::limits::*;

use super::error::{Field, ValidationError};
use super::{BookingRequest, CancelRequest};

pub(crate) fn validate_booking(config: &EventConfig, req: &BookingRequest) -> Result<(), ValidationError> {
    validate_student_id(config, &req.student_id)?;
    match req.student_name.as_deref().map(str::trim) {
        None | Some("") if config.require_name => {
            return Err(ValidationError::Missing(Field::StudentName));
        }
        Some(name) if name.len() > MAX_NAME_LEN => {
            return Err(ValidationError::TooLong {
                field: Field::StudentName,
                max: MAX_NAME_LEN,
            });
        }
        _ => {}
    }
    validate_auth_number(&req.auth_number)?;

    let slot = &req.slot;
    if config.day_of(slot.date).is_none() {
        return Err(ValidationError::UnknownDate(slot.date));
    }
    if !config.has_station(&slot.lab_id) {
        return Err(ValidationError::UnknownStation(slot.lab_id.clone()));
    }
    if !catalog::is_time_slot(&slot.time_slot) {
        return Err(ValidationError::UnknownTimeSlot(slot.time_slot.clone()));
    }
    Ok(())
}

/// Cancellation only needs something to match on; the code may be the master code.
pub(crate) fn validate_cancel(req: &CancelRequest) -> Result<(), ValidationError> {
    if req.student_id.trim().is_empty() {
        return Err(ValidationError::Missing(Field::StudentId));
    }
    if req.auth_number.trim().is_empty() {
        return Err(ValidationError::Missing(Field::AuthNumber));
    }
    Ok(())
}

fn validate_student_id(config: &EventConfig, id: &str) -> Result<(), ValidationError> {
    if id.trim().is_empty() {
        return Err(ValidationError::Missing(Field::StudentId));
    }
    if config.strict_student_id {
        if !is_digits(id, STRICT_STUDENT_ID_DIGITS) {
            return Err(ValidationError::Malformed {
                field: Field::StudentId,
                expected: "exactly 9 digits",
            });
        }
    } else if id.len() > MAX_STUDENT_ID_LEN {
        return Err(ValidationError::TooLong {
            field: Field::StudentId,
            max: MAX_STUDENT_ID_LEN,
        });
    } else if id.chars().any(char::is_control) {
        return Err(ValidationError::Malformed {
            field: Field::StudentId,
            expected: "printable text",
        });
    }
    Ok(())
}

fn validate_auth_number(code: &str) -> Result<(), ValidationError> {
    if code.is_empty() {
        return Err(ValidationError::Missing(Field::AuthNumber));
    }
    if !is_digits(code, AUTH_CODE_DIGITS) {
        return Err(ValidationError::Malformed {
            field: Field::AuthNumber,
            expected: "exactly 4 digits",
        });
    }
    Ok(())
}

fn is_digits(s: &str, n: usize) -> bool {
    s.len() == n && s.bytes().all(|b| b.is_ascii_digit())
}
