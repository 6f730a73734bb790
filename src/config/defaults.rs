//! Default constants for reconciliation configuration.

// =============================================================================
// Dimension Defaults
// =============================================================================

/// Name of the built-in player rating dimension
pub const DEFAULT_DIMENSION_NAME: &str = "dim_player_rating";

/// Separator between key field values in a business key
/// (`alice` + `chess.com` -> `alice_chess.com`).
pub const DEFAULT_KEY_SEPARATOR: &str = "_";

// =============================================================================
// Engine Defaults
// =============================================================================

/// Run the validator after every applied changeset
pub const DEFAULT_VALIDATE_AFTER_MERGE: bool = true;

// =============================================================================
// Storage Defaults (RocksDB)
// =============================================================================

/// Sync the write-ahead log on every changeset write
pub const DEFAULT_SYNC_WRITES: bool = true;

/// Run RocksDB repair before opening
pub const DEFAULT_REPAIR: bool = false;

// =============================================================================
// Loading
// =============================================================================

/// Prefix of environment variables read by [`super::Scd2Config::load`]
pub const ENV_PREFIX: &str = "SCD2_";

/// Separator between nested keys in environment variable names
/// (`SCD2_ENGINE__MALFORMED_POLICY` -> `engine.malformed_policy`).
pub const ENV_NESTING_SEPARATOR: &str = "__";
