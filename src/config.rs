//! Runtime configuration for accel-host.
//!
//! Configuration can be loaded from a JSON file or constructed
//! programmatically. Transfer staging and execution-queue knobs live here.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Largest scratch chunk a staged transfer may allocate, in bytes.
///
/// Matches the native transfer limit: the largest 8-byte-aligned size that
/// still fits a 32-bit signed length.
pub const MAX_CHUNK_BYTES: usize = (i32::MAX & !7) as usize;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Staged (indirect host) transfer settings.
    pub staging: StagingConfig,

    /// Execution queue settings.
    pub exec: ExecConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            staging: StagingConfig::default(),
            exec: ExecConfig::default(),
        }
    }
}

/// Scratch-buffer sizing for transfers whose host side is not directly
/// addressable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingConfig {
    /// Upper bound on the scratch buffer size in bytes. The effective chunk
    /// is `min(remaining bytes, max_chunk_bytes)`.
    pub max_chunk_bytes: usize,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            max_chunk_bytes: MAX_CHUNK_BYTES,
        }
    }
}

/// Execution queue defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecConfig {
    /// Priority assigned to queues created without an explicit priority.
    /// Lower values run sooner on runtimes that honor priorities.
    pub default_stream_priority: i32,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            default_stream_priority: 0,
        }
    }
}

impl CoreConfig {
    /// Load configuration from a JSON file, falling back to defaults when the
    /// file does not exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: CoreConfig = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(CoreConfig::default())
        }
    }

    /// Effective scratch chunk size for a transfer of `remaining` bytes.
    pub fn chunk_bytes(&self, remaining: u64) -> usize {
        let cap = self.staging.max_chunk_bytes.min(MAX_CHUNK_BYTES).max(8);
        (remaining.min(cap as u64)) as usize
    }
}
