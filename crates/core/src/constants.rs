//! Constants used throughout the medrec core crate.
//!
//! Path and filename constants live here so the file-backed store and its tests agree on the
//! on-disk layout.

/// Directory name for clinical record storage under the data directory.
pub const RECORDS_DIR_NAME: &str = "records";

/// Directory name for consumed emergency token markers.
pub const EMERGENCY_TOKENS_DIR_NAME: &str = "emergency_tokens";

/// Default directory for record data when no explicit directory is configured.
pub const DEFAULT_RECORD_DATA_DIR: &str = "record_data";

/// Filename for the live record state.
pub const RECORD_JSON_FILENAME: &str = "record.json";

/// Directory holding one file per superseded version.
pub const HISTORY_DIR_NAME: &str = "history";

/// Filename for the per-record access grants.
pub const GRANTS_JSON_FILENAME: &str = "grants.json";

/// Filename for the per-record audit trail (one JSON entry per line).
pub const AUDIT_LOG_FILENAME: &str = "audit.jsonl";

/// Default care location rendered into ledger commits.
pub const DEFAULT_CARE_LOCATION: &str = "unspecified";

/// Upper bound on records included in an emergency profile.
pub const MAX_EMERGENCY_RECORDS: usize = 5;

/// Default validity of a sealed emergency token.
pub const DEFAULT_EMERGENCY_TOKEN_TTL_HOURS: i64 = 24;

/// Default upper bound on how far in the future a grant may expire.
pub const DEFAULT_MAX_GRANT_DAYS: i64 = 365;

/// Default number of attempts for an update that loses a version race.
pub const DEFAULT_MAX_CONFLICT_RETRIES: u32 = 3;

/// Purpose recorded on grants created without one.
pub const DEFAULT_GRANT_PURPOSE: &str = "unspecified";

/// History snapshot filename for a version number.
pub fn history_filename(version: u32) -> String {
    format!("v{version:06}.json")
}
