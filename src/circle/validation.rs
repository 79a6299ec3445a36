//! Input checks shared by the circle operations

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};

use crate::error::{CircleError, Result};
use crate::models::{MAX_NAME_LEN, MAX_NICKNAME_LEN, TOTAL_UNITS};

/// Longest allowed lifetime for a circle
pub const MAX_LIFETIME_DAYS: i64 = 365;

/// Trims `value` and checks it is non-empty and at most `max` characters.
fn bounded_text(value: &str, field: &str, max: usize) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(CircleError::validation(format!("{} cannot be empty", field)));
    }
    if trimmed.chars().count() > max {
        return Err(CircleError::validation(format!(
            "{} must be at most {} characters",
            field, max
        )));
    }
    Ok(trimmed.to_string())
}

pub fn circle_name(value: &str) -> Result<String> {
    bounded_text(value, "Circle name", MAX_NAME_LEN)
}

pub fn nickname(value: &str) -> Result<String> {
    bounded_text(value, "Nickname", MAX_NICKNAME_LEN)
}

/// Start of the next UTC day
pub fn start_of_tomorrow(now: DateTime<Utc>) -> DateTime<Utc> {
    let tomorrow = now.date_naive() + Duration::days(1);
    Utc.from_utc_datetime(&tomorrow.and_time(NaiveTime::MIN))
}

/// Expiry must fall between tomorrow 00:00 and one year from now
pub fn expiry(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> Result<()> {
    if expires_at < start_of_tomorrow(now) {
        return Err(CircleError::validation(
            "Expiration date must be tomorrow or later",
        ));
    }
    if expires_at > now + Duration::days(MAX_LIFETIME_DAYS) {
        return Err(CircleError::validation(
            "Expiration date cannot be more than one year away",
        ));
    }
    Ok(())
}

/// Upper-cases and trims a user-entered code
pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

/// `AAAA-BBBB` with upper-case ASCII letters and digits
pub fn is_code_format(code: &str) -> bool {
    let bytes = code.as_bytes();
    bytes.len() == 9
        && bytes.iter().enumerate().all(|(i, b)| {
            if i == 4 {
                *b == b'-'
            } else {
                b.is_ascii_uppercase() || b.is_ascii_digit()
            }
        })
}

/// Normalizes `code` and rejects anything not shaped like an invite code
pub fn code(code: &str) -> Result<String> {
    let normalized = normalize_code(code);
    if !is_code_format(&normalized) {
        return Err(CircleError::validation(
            "Invalid code format. Expected XXXX-XXXX",
        ));
    }
    Ok(normalized)
}

pub fn unit_number(unit: u8) -> Result<u8> {
    if unit == 0 || unit > TOTAL_UNITS {
        return Err(CircleError::validation(format!(
            "Unit number must be between 1 and {}",
            TOTAL_UNITS
        )));
    }
    Ok(unit)
}
