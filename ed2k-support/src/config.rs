use serde_derive::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;

/// Size of a hash part, in bytes. A file of `PART_SIZE` bytes exactly still produces a second,
/// empty part by construction -- see `ed2k_net::hash`.
pub const PART_SIZE: u64 = 9_728_000;

/// Every tunable the engine itself needs. Session-level configuration (accounts, shares,
/// queues) belongs to the hosting application, not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub listen_port: u16,
    pub socket_read_size: usize,
    pub socket_write_size: usize,
    pub thread_frequency_ms: u64,
    pub thread_timeout_ms: u64,
    pub max_packet_size: u32,
    pub data_queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            listen_port: 4662,
            socket_read_size: 16 * 1024,
            socket_write_size: 16 * 1024,
            thread_frequency_ms: 50,
            thread_timeout_ms: 1_000,
            max_packet_size: 10 * 1024 * 1024,
            data_queue_capacity: 4_096,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(input: &str) -> io::Result<EngineConfig> {
        serdeconv::from_toml_str(input)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }

    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> io::Result<EngineConfig> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }
}
