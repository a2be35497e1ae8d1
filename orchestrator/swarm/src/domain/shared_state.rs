// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Session Shared State
//!
//! Optimistic-concurrency key/value store owned by a coordination session.
//! Writes are compare-and-swap on the stored version; a stale writer gets
//! [`ConflictError::VersionConflict`] and must re-read.
//!
//! Version `0` means "absent": writing with `expected_version == 0` creates
//! the key. Stored versions start at `1`.

use std::collections::BTreeMap;

use aegis_mesh_core::domain::error::{ConflictError, MeshError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedValue {
    pub value: Value,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SharedState {
    entries: BTreeMap<String, VersionedValue>,
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self, key: &str) -> Option<&VersionedValue> {
        self.entries.get(key)
    }

    /// Current version of `key`, `0` when absent.
    pub fn version(&self, key: &str) -> u64 {
        self.entries.get(key).map_or(0, |entry| entry.version)
    }

    /// Compare-and-swap write. Returns the new version.
    pub fn write(
        &mut self,
        key: &str,
        value: Value,
        expected_version: u64,
        now: DateTime<Utc>,
    ) -> Result<u64, MeshError> {
        if key.trim().is_empty() {
            return Err(MeshError::Validation("shared-state key must not be blank".to_string()));
        }

        let actual = self.version(key);
        if actual != expected_version {
            return Err(ConflictError::VersionConflict {
                key: key.to_string(),
                expected: expected_version,
                actual,
            }
            .into());
        }

        let version = actual + 1;
        self.entries.insert(
            key.to_string(),
            VersionedValue {
                value,
                version,
                updated_at: now,
            },
        );
        Ok(version)
    }

    pub fn entries(&self) -> &BTreeMap<String, VersionedValue> {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
