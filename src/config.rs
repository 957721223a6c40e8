//! Configuration for pg_bulk.
//!
//! Settings are plain data loaded once and shared through
//! [`BulkContext`](crate::executor::BulkContext). They can be read from a
//! TOML file, from the file named by `PG_BULK_CONFIG`, or built in code.
//! Per-call [`BulkOptions`](crate::request::BulkOptions) override the
//! batch size, timeout and merge strategy.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::BulkError;
use crate::request::MergeStrategy;

/// Environment variable naming a TOML configuration file.
pub const CONFIG_ENV: &str = "PG_BULK_CONFIG";

/// Default prefix for staging relation names.
pub const DEFAULT_STAGING_PREFIX: &str = "__bulk";

/// Default name of the OrderToken column.
pub const DEFAULT_ORDER_COLUMN: &str = "__bulk_order";

/// Staged row count from which the staging relation is analyzed before
/// reconciliation.
pub const DEFAULT_ANALYZE_THRESHOLD: u64 = 10_000;

/// PostgreSQL truncates identifiers longer than this.
const MAX_IDENTIFIER_LEN: usize = 63;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BulkConfig {
    /// Prefix of every staging relation name.
    pub staging_prefix: String,

    /// Name of the synthetic ordering column in staging relations.
    pub order_column: String,

    /// Schema that receives physical (non-temporary) staging relations.
    pub physical_staging_schema: String,

    /// Create physical staging relations as `UNLOGGED`.
    pub physical_staging_unlogged: bool,

    /// Rows per COPY command. `None` streams everything in one command.
    pub batch_size: Option<usize>,

    /// Statement timeout applied to each phase, in milliseconds.
    pub command_timeout_ms: Option<u64>,

    /// Analyze the staging relation when at least this many rows were staged.
    /// Zero disables.
    pub analyze_threshold: u64,

    /// Merge strategy used when the call does not choose one.
    pub merge_strategy: MergeStrategy,

    /// Reuse compiled command text across calls.
    pub cache_commands: bool,

    /// Reuse destination schema snapshots across calls.
    pub cache_schemas: bool,
}

impl Default for BulkConfig {
    fn default() -> Self {
        BulkConfig {
            staging_prefix: DEFAULT_STAGING_PREFIX.to_string(),
            order_column: DEFAULT_ORDER_COLUMN.to_string(),
            physical_staging_schema: "public".to_string(),
            physical_staging_unlogged: true,
            batch_size: None,
            command_timeout_ms: None,
            analyze_threshold: DEFAULT_ANALYZE_THRESHOLD,
            merge_strategy: MergeStrategy::ConflictClause,
            cache_commands: true,
            cache_schemas: true,
        }
    }
}

impl BulkConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(input: &str) -> Result<Self, BulkError> {
        let config: BulkConfig =
            toml::from_str(input).map_err(|e| BulkError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, BulkError> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path)
            .map_err(|e| BulkError::InvalidConfig(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&input)
    }

    /// Load from the file named by [`CONFIG_ENV`], or fall back to defaults.
    pub fn load() -> Result<Self, BulkError> {
        match std::env::var(CONFIG_ENV) {
            Ok(path) if !path.is_empty() => Self::from_file(path),
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), BulkError> {
        for (key, value) in [
            ("staging_prefix", &self.staging_prefix),
            ("order_column", &self.order_column),
            ("physical_staging_schema", &self.physical_staging_schema),
        ] {
            if value.trim().is_empty() {
                return Err(BulkError::InvalidConfig(format!("{key} must not be empty")));
            }
            if value.len() > MAX_IDENTIFIER_LEN {
                return Err(BulkError::InvalidConfig(format!(
                    "{key} exceeds {MAX_IDENTIFIER_LEN} bytes"
                )));
            }
        }
        if self.batch_size == Some(0) {
            return Err(BulkError::InvalidConfig(
                "batch_size must be greater than zero".into(),
            ));
        }
        if self.command_timeout_ms == Some(0) {
            return Err(BulkError::InvalidConfig(
                "command_timeout_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_ms.map(Duration::from_millis)
    }
}
