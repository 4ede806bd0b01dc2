// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Stable credential identity.
//!
//! Usage state is keyed by a stable ID that survives accessor changes: OAuth
//! credential files are identified by the email inside them (so renames and
//! moves keep their history), raw API keys by a truncated content hash (so
//! the key bytes never appear in state files or logs).

use std::collections::BTreeMap;
use std::path::Path;

use dashmap::DashMap;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::classify::mask_credential;

/// Hex characters kept from the SHA-256 digest
const STABLE_ID_HASH_LEN: usize = 12;

/// Identity and metadata for one registered credential
#[derive(Debug, Clone)]
pub struct CredentialInfo {
    /// Current outside-world handle
    pub accessor: String,
    /// Stable identity
    pub stable_id: String,
    /// Owning provider
    pub provider: String,
    /// Tier label, if known
    pub tier: Option<String>,
    /// Priority; lower numbers are higher tiers
    pub priority: Option<i32>,
    /// Human-readable name
    pub display_name: Option<String>,
}

/// Process-wide bidirectional map between credential accessors and stable
/// IDs.
///
/// Each accessor maps to exactly one stable ID for its lifetime. A stable ID
/// may be rebound to a new accessor (file rename) but never split.
#[derive(Debug, Default)]
pub struct CredentialRegistry {
    by_accessor: DashMap<String, CredentialInfo>,
    by_stable_id: DashMap<String, String>,
}

impl CredentialRegistry {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stable ID for an accessor, computed and cached on first call.
    ///
    /// Repeated calls return the same value, across process restarts too as
    /// long as the underlying file or key is unchanged.
    pub fn stable_id(&self, accessor: &str, provider: &str) -> String {
        if let Some(info) = self.by_accessor.get(accessor) {
            return info.stable_id.clone();
        }

        let stable_id = if is_oauth_accessor(accessor) {
            oauth_stable_id(accessor)
        } else {
            hash_content(accessor)
        };

        self.by_accessor.insert(
            accessor.to_string(),
            CredentialInfo {
                accessor: accessor.to_string(),
                stable_id: stable_id.clone(),
                provider: provider.to_string(),
                tier: None,
                priority: None,
                display_name: None,
            },
        );
        self.by_stable_id
            .insert(stable_id.clone(), accessor.to_string());
        stable_id
    }

    /// Complete info for an accessor, registering it if needed
    pub fn info(&self, accessor: &str, provider: &str) -> CredentialInfo {
        self.stable_id(accessor, provider);
        self.by_accessor
            .get(accessor)
            .map(|entry| entry.clone())
            .unwrap_or_else(|| CredentialInfo {
                accessor: accessor.to_string(),
                stable_id: hash_content(accessor),
                provider: provider.to_string(),
                tier: None,
                priority: None,
                display_name: None,
            })
    }

    /// Current accessor for a stable ID
    #[must_use]
    pub fn accessor_for(&self, stable_id: &str) -> Option<String> {
        self.by_stable_id.get(stable_id).map(|a| a.clone())
    }

    /// Rebind a stable ID to a new accessor (file moved or renamed)
    pub fn rebind(&self, stable_id: &str, new_accessor: &str) {
        if let Some(old_accessor) = self
            .by_stable_id
            .insert(stable_id.to_string(), new_accessor.to_string())
        {
            if let Some((_, mut info)) = self.by_accessor.remove(&old_accessor) {
                debug!(
                    credential = %mask_credential(&old_accessor),
                    new = %mask_credential(new_accessor),
                    "rebinding credential accessor"
                );
                info.accessor = new_accessor.to_string();
                self.by_accessor.insert(new_accessor.to_string(), info);
            }
        }
    }

    /// Update tier/priority/display metadata for an accessor
    pub fn update_metadata(
        &self,
        accessor: &str,
        provider: &str,
        tier: Option<String>,
        priority: Option<i32>,
        display_name: Option<String>,
    ) {
        self.stable_id(accessor, provider);
        if let Some(mut info) = self.by_accessor.get_mut(accessor) {
            if tier.is_some() {
                info.tier = tier;
            }
            if priority.is_some() {
                info.priority = priority;
            }
            if display_name.is_some() {
                info.display_name = display_name;
            }
        }
    }

    /// All registered stable IDs
    #[must_use]
    pub fn all_stable_ids(&self) -> Vec<String> {
        self.by_stable_id
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Accessor -> stable ID snapshot, for persistence
    #[must_use]
    pub fn accessor_index(&self) -> BTreeMap<String, String> {
        self.by_accessor
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().stable_id.clone()))
            .collect()
    }

    /// Restore the accessor index from a persisted snapshot. Entries already
    /// registered keep their live binding.
    pub fn restore_accessor_index(&self, index: &BTreeMap<String, String>, provider: &str) {
        for (accessor, stable_id) in index {
            if self.by_accessor.contains_key(accessor) {
                continue;
            }
            self.by_accessor.insert(
                accessor.clone(),
                CredentialInfo {
                    accessor: accessor.clone(),
                    stable_id: stable_id.clone(),
                    provider: provider.to_string(),
                    tier: None,
                    priority: None,
                    display_name: None,
                },
            );
            self.by_stable_id.insert(stable_id.clone(), accessor.clone());
        }
    }
}

/// OAuth accessors are file paths; raw keys are bare strings
fn is_oauth_accessor(accessor: &str) -> bool {
    accessor.ends_with(".json") || accessor.contains('/') || accessor.contains('\\')
}

/// Stable ID for an OAuth credential file: the email inside it, falling back
/// to a content hash, falling back to a path hash when unreadable.
fn oauth_stable_id(accessor: &str) -> String {
    match std::fs::read_to_string(Path::new(accessor)) {
        Ok(raw) => match serde_json::from_str::<Value>(&raw) {
            Ok(data) => {
                if let Some(email) = email_from_metadata(&data) {
                    return email;
                }
                debug!(
                    credential = %mask_credential(accessor),
                    "no email in OAuth credential, using content hash"
                );
                hash_content(&raw)
            }
            Err(err) => {
                warn!(
                    credential = %mask_credential(accessor),
                    %err,
                    "OAuth credential is not valid JSON, using content hash"
                );
                hash_content(&raw)
            }
        },
        Err(err) => {
            warn!(
                credential = %mask_credential(accessor),
                %err,
                "failed to read OAuth credential, using path hash"
            );
            hash_content(accessor)
        }
    }
}

fn email_from_metadata(data: &Value) -> Option<String> {
    if let Some(email) = data
        .pointer("/_proxy_metadata/email")
        .and_then(Value::as_str)
    {
        return Some(email.to_string());
    }
    for field in ["email", "client_email", "account"] {
        if let Some(email) = data.get(field).and_then(Value::as_str) {
            return Some(email.to_string());
        }
    }
    None
}

fn hash_content(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    hex::encode(digest)[..STABLE_ID_HASH_LEN].to_string()
}
