use std::fs;
use std::path::Path;

use ldoged_consensus::Network;
use serde::{Deserialize, Serialize};

use crate::error::ChainError;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainOptions {
    pub network: Network,
    /// Track headers only. Inputs and scripts are never verified.
    pub spv: bool,
    pub checkpoints: bool,
    pub max_orphans: usize,
    pub orphan_ttl_secs: u64,
    pub entry_cache: usize,
    pub invalid_cache: usize,
    pub prune: bool,
    /// Overrides the network's number of full blocks kept when pruning.
    pub keep_blocks: Option<u32>,
    /// Script verification threads. Zero lets rayon decide.
    pub script_threads: usize,
}

impl Default for ChainOptions {
    fn default() -> Self {
        Self {
            network: Network::Mainnet,
            spv: false,
            checkpoints: true,
            max_orphans: 20,
            orphan_ttl_secs: 60 * 60,
            entry_cache: 5000,
            invalid_cache: 100,
            prune: false,
            keep_blocks: None,
            script_threads: 0,
        }
    }
}

impl ChainOptions {
    pub fn from_toml_str(text: &str) -> Result<Self, ChainError> {
        toml::from_str(text)
            .map_err(|err| ChainError::Config(format!("unable to parse chain options: {err}")))
    }

    pub fn load(path: &Path) -> Result<Self, ChainError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn to_toml_string(&self) -> Result<String, ChainError> {
        toml::to_string_pretty(self)
            .map_err(|err| ChainError::Config(format!("unable to encode chain options: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let options = ChainOptions::from_toml_str("network = \"testnet\"\nmax_orphans = 5\n")
            .expect("parse");
        assert_eq!(options.network, Network::Testnet);
        assert_eq!(options.max_orphans, 5);
        assert!(options.checkpoints);
        assert_eq!(options.entry_cache, 5000);
        assert_eq!(options.keep_blocks, None);
    }

    #[test]
    fn encoded_options_parse_back() {
        let options = ChainOptions {
            prune: true,
            keep_blocks: Some(500),
            ..ChainOptions::default()
        };
        let text = options.to_toml_string().expect("encode");
        assert_eq!(ChainOptions::from_toml_str(&text).expect("parse"), options);
    }

    #[test]
    fn unknown_network_is_a_config_error() {
        let err = ChainOptions::from_toml_str("network = \"moon\"").expect_err("bad network");
        assert!(matches!(err, ChainError::Config(_)));
    }
}
