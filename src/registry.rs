//! In-memory mapping from logical VM names to cloud coordinates.
//!
//! Built once from the config file and shared read-only (behind an `Arc`)
//! with every handler task.

use std::fmt;

use crate::error::BotError;

/// Cloud coordinates of one configured VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmEntry {
    pub logical_name: String,
    pub resource_group: String,
    pub vm_name: String,
    pub subscription_id: String,
}

impl fmt::Display for VmEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {}/{} ({})",
            self.logical_name, self.resource_group, self.vm_name, self.subscription_id
        )
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("failed to find a VM with that name")]
    NotFound { logical_name: String },
}

#[derive(Debug, Clone, Default)]
pub struct VmRegistry {
    entries: Vec<VmEntry>,
}

impl VmRegistry {
    /// Build a registry, rejecting blank coordinates and duplicate names.
    pub fn new(entries: Vec<VmEntry>) -> Result<Self, BotError> {
        for (i, entry) in entries.iter().enumerate() {
            for (field, value) in [
                ("logical_name", &entry.logical_name),
                ("azurevm_name", &entry.vm_name),
                ("resource_group", &entry.resource_group),
                ("subscription_id", &entry.subscription_id),
            ] {
                if value.trim().is_empty() {
                    return Err(BotError::Validation {
                        message: format!("vms[{i}]: {field} must not be empty"),
                    });
                }
            }
            if entries[..i]
                .iter()
                .any(|other| other.logical_name == entry.logical_name)
            {
                return Err(BotError::Validation {
                    message: format!("duplicate logical_name '{}'", entry.logical_name),
                });
            }
        }
        Ok(Self { entries })
    }

    /// Linear lookup; registries hold tens of entries at most.
    pub fn resolve(&self, logical_name: &str) -> Result<&VmEntry, RegistryError> {
        self.entries
            .iter()
            .find(|e| e.logical_name == logical_name)
            .ok_or_else(|| RegistryError::NotFound {
                logical_name: logical_name.to_string(),
            })
    }

    pub fn entries(&self) -> &[VmEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
