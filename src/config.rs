//! Layered configuration, mirroring the host node's own config crate: a
//! typed struct with `Default` derived from the documented tunables in §8,
//! loaded from an optional TOML file and falling back to defaults for
//! anything absent, plus the raw TOML kept alongside for diagnostics.
//!
//! Durations are stored as plain `_secs: u64` fields, the way the teacher's
//! `DandelionConfig` stores its timers, so a hand-written TOML file just
//! says `blocks_timeout_secs = 60` rather than a serialized `Duration`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::TdOffender;
use crate::error::{Error, ErrorKind};

/// Every tunable in §8, with the documented defaults. TOML fields are all
/// optional; the [`Default`] impl supplies what's missing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockPoolConfig {
    /// Max hashes per `request_block_hashes` response expected.
    pub block_hashes_batch_size: u32,
    /// Max hashes per `request_blocks` request.
    pub block_batch_size: u32,
    /// Delay between consecutive block-request rounds per section.
    pub blocks_request_interval_secs: u64,
    /// Delay between consecutive hash-request rounds per section.
    pub block_hashes_request_interval_secs: u64,
    /// Number of peers to fan a block request out to on retries.
    pub blocks_request_repetition: usize,
    /// Idle-round budget before section suicide.
    pub blocks_request_max_idle_rounds: u32,
    /// Max peer silence before `InsufficientChainInfo`.
    pub block_hashes_timeout_secs: u64,
    /// Max section lifetime before suicide.
    pub blocks_timeout_secs: u64,
    /// Max best-peer silence post-sync before `IdleTooLong`.
    pub idle_best_peer_timeout_secs: u64,
    /// Duration a fatal-error peer id is blacklisted.
    pub peer_suspension_interval_secs: u64,
    /// Status log cadence.
    pub status_update_interval_secs: u64,
    /// Capacity of the reusable hash-slice pool (§5).
    pub hash_slice_pool_capacity: usize,
    /// Who gets penalised on a TD-integrity mismatch (§9 open question).
    pub td_mismatch_penalises: TdOffender,
    /// Directory for the blacklist-suspension and status log, mirroring the
    /// host node's platform data directory convention. Not otherwise used:
    /// the pool keeps no other state across restarts (§1 Non-goals).
    pub data_dir: String,
}

impl Default for BlockPoolConfig {
    fn default() -> BlockPoolConfig {
        BlockPoolConfig {
            block_hashes_batch_size: 256,
            block_batch_size: 64,
            blocks_request_interval_secs: 3,
            block_hashes_request_interval_secs: 3,
            blocks_request_repetition: 1,
            blocks_request_max_idle_rounds: 20,
            block_hashes_timeout_secs: 60,
            blocks_timeout_secs: 60,
            idle_best_peer_timeout_secs: 120,
            peer_suspension_interval_secs: 300,
            status_update_interval_secs: 3,
            hash_slice_pool_capacity: 150,
            td_mismatch_penalises: TdOffender::default(),
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> String {
    dirs::data_dir()
        .map(|p| p.join("blockpool").to_string_lossy().into_owned())
        .unwrap_or_else(|| String::from("."))
}

macro_rules! duration_accessor {
    ($name:ident, $field:ident) => {
        pub fn $name(&self) -> Duration {
            Duration::from_secs(self.$field)
        }
    };
}

impl BlockPoolConfig {
    duration_accessor!(blocks_request_interval, blocks_request_interval_secs);
    duration_accessor!(
        block_hashes_request_interval,
        block_hashes_request_interval_secs
    );
    duration_accessor!(block_hashes_timeout, block_hashes_timeout_secs);
    duration_accessor!(blocks_timeout, blocks_timeout_secs);
    duration_accessor!(idle_best_peer_timeout, idle_best_peer_timeout_secs);
    duration_accessor!(peer_suspension_interval, peer_suspension_interval_secs);
    duration_accessor!(status_update_interval, status_update_interval_secs);
}

/// Parsed config plus the original file text, mirroring the teacher's split
/// between typed config and raw TOML (kept around for `--dump-config`-style
/// diagnostics).
#[derive(Debug)]
pub struct GlobalConfig {
    pub members: BlockPoolConfig,
    pub ser_config: Option<String>,
}

impl Default for GlobalConfig {
    fn default() -> GlobalConfig {
        GlobalConfig {
            members: BlockPoolConfig::default(),
            ser_config: None,
        }
    }
}

impl GlobalConfig {
    /// Load configuration from a TOML file. Parse failures are reported as
    /// `ErrorKind::Configuration`; a missing file is not an error here, the
    /// caller decides whether that's acceptable (the pool itself is happy to
    /// run with `GlobalConfig::default()`).
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<GlobalConfig, Error> {
        let raw = fs::read_to_string(path.as_ref())
            .map_err(|e| ErrorKind::Configuration(e.to_string()))?;
        let members: BlockPoolConfig =
            toml::from_str(&raw).map_err(|e| ErrorKind::Configuration(e.to_string()))?;
        Ok(GlobalConfig {
            members,
            ser_config: Some(raw),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let cfg = BlockPoolConfig::default();
        assert_eq!(cfg.block_hashes_batch_size, 256);
        assert_eq!(cfg.block_batch_size, 64);
        assert_eq!(cfg.blocks_request_repetition, 1);
        assert_eq!(cfg.blocks_request_max_idle_rounds, 20);
        assert_eq!(cfg.blocks_timeout(), Duration::from_secs(60));
        assert_eq!(cfg.idle_best_peer_timeout(), Duration::from_secs(120));
        assert_eq!(cfg.peer_suspension_interval(), Duration::from_secs(300));
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let toml_str = r#"
            block_batch_size = 32
        "#;
        let cfg: BlockPoolConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.block_batch_size, 32);
        assert_eq!(cfg.block_hashes_batch_size, 256);
    }
}
