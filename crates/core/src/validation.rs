//! Input validation utilities.
//!
//! Identifiers supplied by the authentication collaborator are opaque to the core, but they are
//! written into file names, commit trailers and audit lines, so they are restricted to a
//! conservative character set before use.

use crate::{RecordError, RecordResult};
use chrono::{DateTime, Duration, Utc};

/// Validates that an actor identifier is safe to persist and render in a trailer line.
///
/// - Rejects empty or whitespace-only strings
/// - Bounds the length
/// - Restricts characters to ASCII alphanumerics and `.`, `-`, `_`, `@`, `:`
pub fn validate_actor_id(actor_id: &str) -> RecordResult<()> {
    const MAX_ACTOR_ID_LEN: usize = 128;

    if actor_id.trim().is_empty() {
        return Err(RecordError::InvalidInput(
            "actor id cannot be empty".into(),
        ));
    }

    if actor_id.len() > MAX_ACTOR_ID_LEN {
        return Err(RecordError::InvalidInput(format!(
            "actor id exceeds maximum length of {} characters",
            MAX_ACTOR_ID_LEN
        )));
    }

    let ok = actor_id.bytes().all(|b| {
        matches!(b, b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z' | b'.' | b'-' | b'_' | b'@' | b':')
    });

    if !ok {
        return Err(RecordError::InvalidInput(
            "actor id contains invalid characters (only alphanumeric, '.', '-', '_', '@', ':' allowed)"
                .into(),
        ));
    }

    Ok(())
}

/// Validates an optional grant expiry against `now` and the configured maximum.
pub fn validate_grant_expiry(
    expires_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    max_duration: Duration,
) -> RecordResult<()> {
    let Some(expires_at) = expires_at else {
        return Ok(());
    };

    if expires_at <= now {
        return Err(RecordError::InvalidInput(
            "grant expiry must be in the future".into(),
        ));
    }

    if expires_at - now > max_duration {
        return Err(RecordError::InvalidInput(format!(
            "grant expiry exceeds maximum of {} days",
            max_duration.num_days()
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn accepts_typical_actor_ids() {
        validate_actor_id("dr.house@ppth").unwrap();
        validate_actor_id("patient-000123").unwrap();
        validate_actor_id("urn:staff:42").unwrap();
    }

    #[test]
    fn rejects_unsafe_actor_ids() {
        assert!(validate_actor_id("").is_err());
        assert!(validate_actor_id("two words").is_err());
        assert!(validate_actor_id("line\nbreak").is_err());
        assert!(validate_actor_id("../etc").is_err());
        assert!(validate_actor_id(&"a".repeat(129)).is_err());
    }

    #[test]
    fn grant_expiry_must_be_future_and_bounded() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        let max = Duration::days(365);

        validate_grant_expiry(None, now, max).unwrap();
        validate_grant_expiry(Some(now + Duration::hours(1)), now, max).unwrap();
        assert!(validate_grant_expiry(Some(now), now, max).is_err());
        assert!(validate_grant_expiry(Some(now - Duration::hours(1)), now, max).is_err());
        assert!(validate_grant_expiry(Some(now + Duration::days(366)), now, max).is_err());
    }
}
