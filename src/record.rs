//! Persisted VM records.
//!
//! A running VM survives a control-plane restart: enough of its context is
//! serialized to re-associate later. The record is an opaque blob from the
//! caller's point of view; the core only validates that the id matches the VM
//! being re-attached.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Boot-time flags and sizing for a guest VM.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BootConfig {
    /// Number of vCPUs.
    #[serde(default = "default_cpus")]
    pub cpus: u8,

    /// Memory in MiB.
    #[serde(default = "default_memory_mib")]
    pub memory_mib: u32,

    /// The VM boots from a memory template and starts paused; the init
    /// handshake skips the READY frame and the version probe until resume.
    #[serde(default)]
    pub boot_from_template: bool,

    /// The VM is being booted to become a template; the version probe is
    /// skipped so the snapshot stays quiescent.
    #[serde(default)]
    pub boot_to_be_template: bool,
}

fn default_cpus() -> u8 {
    1
}

fn default_memory_mib() -> u32 {
    256
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            cpus: default_cpus(),
            memory_mib: default_memory_mib(),
            boot_from_template: false,
            boot_to_be_template: false,
        }
    }
}

/// Serialized state of a supervised VM, sufficient to rebuild a
/// [`crate::VmContext`] around an already-running guest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VmRecord {
    /// Stable VM identifier.
    pub id: String,

    /// Name of the hypervisor driver that launched the VM.
    pub driver: String,

    /// Filesystem path of the guest agent socket.
    pub agent_socket: PathBuf,

    /// Boot flags the VM was started with.
    #[serde(default)]
    pub boot: BootConfig,
}

impl VmRecord {
    /// Decode a record from its serialized form.
    pub fn decode(blob: &[u8]) -> Result<Self> {
        serde_json::from_slice(blob).map_err(Error::Record)
    }

    /// Serialize the record for storage.
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(Error::Record)
    }
}
