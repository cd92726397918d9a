//! redb table definitions for the measurement store.
//!
//! Keys are `{workload}:{canonical_params}`; values are JSON-serialized
//! `MeasurementRecord`s.

use redb::TableDefinition;

/// Measured complexities keyed by `{workload}:{canonical_params}`.
pub const MEASUREMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("measurements");
