// SPDX-License-Identifier: MIT OR Apache-2.0

#![forbid(unsafe_code)]

use crate::EnnError;

/// Schema version written by this release for config and checkpoint payloads.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Highest schema version this release reads; newer fields are preserved as unknown.
pub const MAX_FORWARD_COMPAT_SCHEMA_VERSION: u32 = 2;

/// Where operators are pointed when a payload is too new to read.
pub const MIGRATION_GUIDANCE_PATH: &str = "docs/schema-migrations.md";

/// Rejects schema versions outside `1..=MAX_FORWARD_COMPAT_SCHEMA_VERSION`.
pub fn validate_schema_version(version: u32, kind: &str) -> Result<(), EnnError> {
    if version == 0 {
        return Err(EnnError::invalid_input(format!(
            "{kind} schema_version must be >= 1; got 0"
        )));
    }
    if version > MAX_FORWARD_COMPAT_SCHEMA_VERSION {
        return Err(EnnError::not_supported(format!(
            "{kind} schema_version={version} is newer than supported max={MAX_FORWARD_COMPAT_SCHEMA_VERSION}; see {MIGRATION_GUIDANCE_PATH}"
        )));
    }
    Ok(())
}
