//! Per-network chain parameters.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::{MODIFIER_INTERVAL_RATIO, STAKE_MODIFIER_ROUNDS, VERSION_TOP_MASK};
use crate::deployments::Deployment;
use crate::{hash_from_hex, Hash256};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Network {
    #[serde(rename = "main", alias = "mainnet")]
    Mainnet,
    #[serde(rename = "testnet")]
    Testnet,
    #[serde(rename = "regtest")]
    Regtest,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Network::Mainnet => "main",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown network {0:?}")]
pub struct UnknownNetwork(pub String);

impl FromStr for Network {
    type Err = UnknownNetwork;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "main" | "mainnet" => Ok(Network::Mainnet),
            "testnet" => Ok(Network::Testnet),
            "regtest" => Ok(Network::Regtest),
            other => Err(UnknownNetwork(other.to_string())),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Checkpoint {
    pub height: u32,
    pub hash: Hash256,
}

/// Header fields and coinbase of the hard-coded genesis block.
#[derive(Clone, Debug)]
pub struct GenesisParams {
    pub version: u32,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
    pub merkle_root: Hash256,
    pub hash: Hash256,
    pub coinbase_time: u32,
    pub coinbase_script: &'static [u8],
}

#[derive(Clone, Debug)]
pub struct PowParams {
    /// Easiest allowed target, little-endian.
    pub limit: Hash256,
    pub bits: u32,
    pub target_timespan: i64,
    pub target_spacing: i64,
    pub retarget_interval: u32,
}

#[derive(Clone, Debug)]
pub struct PosParams {
    /// Easiest allowed stake target, little-endian.
    pub limit: Hash256,
    pub bits: u32,
    pub stake_min_age: i64,
    pub modifier_interval: i64,
}

#[derive(Clone, Debug)]
pub struct BlockParams {
    pub prune_after_height: u32,
    pub keep_blocks: u32,
    pub max_tip_age: i64,
    pub slow_height: u32,
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    pub genesis: GenesisParams,
    pub pow: PowParams,
    pub pos: PosParams,
    pub block: BlockParams,
    pub checkpoints: Vec<Checkpoint>,
    pub last_checkpoint: u32,
    /// Historical blocks allowed to overwrite unspent transactions.
    pub bip30: Vec<Checkpoint>,
    pub activation_threshold: u32,
    pub miner_window: u32,
    pub deployments: Vec<Deployment>,
    stake_modifier_sections: [i64; STAKE_MODIFIER_ROUNDS],
}

impl ChainParams {
    fn new(
        network: Network,
        genesis: GenesisParams,
        pow: PowParams,
        pos: PosParams,
        block: BlockParams,
    ) -> Self {
        let mut stake_modifier_sections = [0i64; STAKE_MODIFIER_ROUNDS];
        for (section, slot) in stake_modifier_sections.iter_mut().enumerate() {
            let section = section as i64;
            *slot = pos.modifier_interval * 63
                / (63 + (63 - section) * (MODIFIER_INTERVAL_RATIO - 1));
        }
        Self {
            network,
            genesis,
            pow,
            pos,
            block,
            checkpoints: Vec::new(),
            last_checkpoint: 0,
            bip30: Vec::new(),
            activation_threshold: 0,
            miner_window: 0,
            deployments: Vec::new(),
            stake_modifier_sections,
        }
    }

    pub fn checkpoint(&self, height: u32) -> Option<&Hash256> {
        self.checkpoints
            .binary_search_by_key(&height, |checkpoint| checkpoint.height)
            .ok()
            .map(|index| &self.checkpoints[index].hash)
    }

    pub fn bip30_exception(&self, height: u32) -> Option<&Hash256> {
        self.bip30
            .iter()
            .find(|checkpoint| checkpoint.height == height)
            .map(|checkpoint| &checkpoint.hash)
    }

    pub fn deployment(&self, name: &str) -> Option<&Deployment> {
        self.deployments
            .iter()
            .find(|deployment| deployment.name == name)
    }

    /// Version bits not claimed by any known deployment.
    pub fn unknown_bits(&self) -> u32 {
        let mut bits = VERSION_TOP_MASK;
        for deployment in &self.deployments {
            bits |= deployment.mask();
        }
        !bits
    }

    pub fn is_protocol_v2(&self, height: u32) -> bool {
        self.network == Network::Testnet || height > 2
    }

    pub fn is_protocol_v1(&self, height: u32) -> bool {
        !self.is_protocol_v2(height)
    }

    /// Negative block spacing clamps to the target spacing from here on.
    pub fn is_protocol_v1_retargeting_fixed(&self, height: u32) -> bool {
        self.network == Network::Testnet || height > 1
    }

    pub fn target_spacing(&self, height: u32) -> i64 {
        if self.is_protocol_v2(height) {
            64
        } else {
            60
        }
    }

    pub fn future_drift(&self, time: i64, height: u32) -> i64 {
        if self.is_protocol_v2(height) {
            time + 15
        } else {
            time + 10 * 60
        }
    }

    pub fn past_drift(&self, time: i64, height: u32) -> i64 {
        if self.is_protocol_v2(height) {
            time
        } else {
            time - 10 * 60
        }
    }

    pub fn stake_modifier_selection_interval_section(&self, section: usize) -> i64 {
        self.stake_modifier_sections[section.min(STAKE_MODIFIER_ROUNDS - 1)]
    }

    pub fn stake_modifier_selection_interval(&self) -> i64 {
        self.stake_modifier_sections.iter().sum()
    }
}

/// Converts a big-endian hex number into a little-endian 256-bit buffer.
const fn target_from_hex(hex: &str) -> Hash256 {
    let be = hash_from_hex(hex);
    let mut out = [0u8; 32];
    let mut index = 0;
    while index < 32 {
        out[index] = be[31 - index];
        index += 1;
    }
    out
}

const fn checkpoint(height: u32, hash: &str) -> Checkpoint {
    Checkpoint {
        height,
        hash: hash_from_hex(hash),
    }
}

/// Coinbase scriptSig shared by every network's genesis block.
const GENESIS_COINBASE_SCRIPT: &[u8] = b"\x00\x01\x2a\x15plz time stamp. stahp";
const GENESIS_COINBASE_TIME: u32 = 1_426_450_258;
const GENESIS_MERKLE_ROOT: Hash256 =
    hash_from_hex("3268f84c964c94f8fd7c3e55cbc4de0d3e11ebc82960ca7c4311383e8689806e");

const MAIN_LIMIT: Hash256 =
    target_from_hex("00000fffffffffffffffffffffffffffffffffffffffffffffffffffffffffff");
const TESTNET_LIMIT: Hash256 =
    target_from_hex("00000000ffffffffffffffffffffffffffffffffffffffffffffffffffffffff");
const REGTEST_LIMIT: Hash256 =
    target_from_hex("7fffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff");

const MAIN_CHECKPOINTS: [Checkpoint; 35] = [
    checkpoint(0, "c6674f5395dd5a1332747194621b9efcf7536319b1ddcde7272f030121030000"),
    checkpoint(42_700, "a3a741f9a22580a54528091a57d80c9b6b33dd853868bbb7ab915b2e4bc32235"),
    checkpoint(50_000, "3f98b7d366fc83842d16f5d87ddeafeeb72148692b954584e8320c42908a51e2"),
    checkpoint(51_000, "e3ada835b20446660634536d5a86d17987068c4910d53552e5e4285c87f8cf46"),
    checkpoint(52_000, "200b94d19c883935dead3b9956cd884fe28143d5d6b1415309579e1a72cafbb3"),
    checkpoint(70_000, "abe26439e61d62a27f2efd9a44518127e4ec9e1123c30413fd2954fed57942e1"),
    checkpoint(90_000, "dc4c7836c8ac771d9499e5a5889eb3b9cb243f4502a74ec519e77e6b22e8c197"),
    checkpoint(100_000, "efd9bf1e26fc76805e960a3a82529efcadb362597d340965c169b88752dcc366"),
    checkpoint(110_000, "bf583f6d42cb16cd404f6ca5ff0c73d2f2fe4a0c9af0fd45008a00bd0fa41fef"),
    checkpoint(120_000, "31a8e387a315ab776d5ffb7e965442cbf6f9a3f3f751d0039b939ae2c8e33987"),
    checkpoint(130_000, "ed09acb5a2b9d240e50d446ca2ab8016476fcc7227891450f29aab3fca400627"),
    checkpoint(200_000, "75bd20932d60087b11c0ec88a1f8d4ed70bb5e43cbfe0a45f9920df4b6d217e5"),
    checkpoint(300_000, "65f9c99ccbdefed803431cf713f5f68ad2ca5a981c1dd8ed84a9bee8009c581d"),
    checkpoint(400_000, "b570855456176df4d1db18ead360211b89b37f3e4f91bb1cefe99d3a44b85715"),
    checkpoint(500_000, "c8f330d9e84f437316e6ad76c68be5c65c97559938a230c19b900dffb3215f5b"),
    checkpoint(600_000, "97410539b160b5843fdb3a68a08095dee40f86bca6dd66bbce95cb717d1fdf3b"),
    checkpoint(700_000, "35bfa565f187070847d2856598d1c6b176659919f43915de2203d3142293c616"),
    checkpoint(800_000, "d3c1c185abc0ea38d20d81db208b3cde64a3b875878174fcc1a5b6d22c37a3e9"),
    checkpoint(900_000, "6ba3049e7ae92eb95284716b79caab705a64f2890cf90a2c6f13b04bdea259c0"),
    checkpoint(1_000_000, "a37a5a7098a8a53d41d57f49bcdc4288ae129c677845c4f518097b64417a3724"),
    checkpoint(1_100_000, "c977e09f34fd98c38812753d660dac1af9363e5d11ee6465849c1cd1589b6bd9"),
    checkpoint(1_200_000, "508cd75c8a09435f430841da786991d903a08fd8e257bc94d7432e07ecdbd0d5"),
    checkpoint(1_300_000, "09fe75addd270b290bef12d06f69b5ea093b47d5380dfb5f06f50467db8b815f"),
    checkpoint(1_400_000, "fd71235575c35e5857141c21a4d7efc1d41178792d758ce7d7f76b2f0eb6883d"),
    checkpoint(1_500_000, "3306eb26d94b171e761566828f66f58f9e26dcd25a6814ffce5226ca86543897"),
    checkpoint(1_600_000, "d2706b7339ebf1eada9b1675ebd207f731338a9b26e2e2c43184aa5c56720be7"),
    checkpoint(1_700_000, "96478d2ac5db6a983f12e74b5d00ebb1c423f22493fddc69a3b6f389a64124cd"),
    checkpoint(1_800_000, "4cbf79d6e43d3d924ba7985798e81c1345d890ca0e5ac83ff5056b8382d6b602"),
    checkpoint(1_900_000, "d73101f0c1b5045bd88033ee64efcdc1ff7a67484f1ff880c268d386431234c8"),
    checkpoint(2_000_000, "d1a7a6da1b38ddaf2b1b5417a57081e6c218d2d901253218199ab4c697a6c15f"),
    checkpoint(2_100_000, "e78f41c9a0cba7d800ec5519b13f8c36b377b6867c57f2836436c184ffbf049d"),
    checkpoint(2_200_000, "fe621dc3942a65fbf89d73aac5abfab0c2ba47e01f7201a2af8e7bfb72bfb247"),
    checkpoint(2_300_000, "066b59d1d93b8817b4cd924c46407eed8a37cd8e3974f32a3f164740a419b10f"),
    checkpoint(2_400_000, "7478c433a85ece446f0589fe3921d873909dd84a91b246b977aad453b64ee3fb"),
    checkpoint(2_500_000, "506afb5a080cf89f21ff246ccf4a6b2c6cea24550583fa82ea2825054022a01a"),
];

fn csv_deployment(start_time: i64, timeout: i64) -> Deployment {
    Deployment {
        name: "csv".to_string(),
        bit: 0,
        start_time: Some(start_time),
        timeout,
        threshold: None,
        window: None,
        required: false,
        force: true,
    }
}

fn pos_params(limit: Hash256, bits: u32) -> PosParams {
    PosParams {
        limit,
        bits,
        stake_min_age: 8 * 60 * 60,
        modifier_interval: 10 * 60,
    }
}

pub fn chain_params(network: Network) -> ChainParams {
    match network {
        Network::Mainnet => mainnet_params(),
        Network::Testnet => testnet_params(),
        Network::Regtest => regtest_params(),
    }
}

fn mainnet_params() -> ChainParams {
    let genesis = GenesisParams {
        version: 1,
        time: 1_426_450_258,
        bits: 504_365_055,
        nonce: 925_125,
        merkle_root: GENESIS_MERKLE_ROOT,
        hash: hash_from_hex("c6674f5395dd5a1332747194621b9efcf7536319b1ddcde7272f030121030000"),
        coinbase_time: GENESIS_COINBASE_TIME,
        coinbase_script: GENESIS_COINBASE_SCRIPT,
    };
    let pow = PowParams {
        limit: MAIN_LIMIT,
        bits: 504_365_055,
        target_timespan: 16 * 60,
        target_spacing: 10 * 60,
        retarget_interval: 2016,
    };
    let block = BlockParams {
        prune_after_height: 1000,
        keep_blocks: 288,
        max_tip_age: 24 * 60 * 60,
        slow_height: 325_000,
    };
    let mut params = ChainParams::new(
        Network::Mainnet,
        genesis,
        pow,
        pos_params(MAIN_LIMIT, 504_365_055),
        block,
    );
    params.checkpoints = MAIN_CHECKPOINTS.to_vec();
    params.last_checkpoint = 2_500_000;
    params.activation_threshold = 1916;
    params.miner_window = 2016;
    params.deployments = vec![csv_deployment(1_462_060_800, 1_493_596_800)];
    params
}

fn testnet_params() -> ChainParams {
    let genesis = GenesisParams {
        version: 1,
        time: 1_296_688_602,
        bits: 486_604_799,
        nonce: 414_098_458,
        merkle_root: GENESIS_MERKLE_ROOT,
        hash: hash_from_hex("8bd2dfb10276719ae719c99af58d24fbb6d345a8b77b0d47cb7844b70f5d2f66"),
        coinbase_time: GENESIS_COINBASE_TIME,
        coinbase_script: GENESIS_COINBASE_SCRIPT,
    };
    let pow = PowParams {
        limit: TESTNET_LIMIT,
        bits: 486_604_799,
        target_timespan: 16 * 60,
        target_spacing: 10 * 60,
        retarget_interval: 2016,
    };
    let block = BlockParams {
        prune_after_height: 1000,
        keep_blocks: 10_000,
        max_tip_age: 24 * 60 * 60,
        slow_height: 950_000,
    };
    let mut params = ChainParams::new(
        Network::Testnet,
        genesis,
        pow,
        pos_params(TESTNET_LIMIT, 486_604_799),
        block,
    );
    params.activation_threshold = 1512;
    params.miner_window = 2016;
    params.deployments = vec![csv_deployment(1_456_790_400, 1_493_596_800)];
    params
}

fn regtest_params() -> ChainParams {
    let genesis = GenesisParams {
        version: 1,
        time: 1_296_688_602,
        bits: 545_259_519,
        nonce: 2,
        merkle_root: GENESIS_MERKLE_ROOT,
        hash: hash_from_hex("3410372bda1d8baa296131f390edeb1e7a2aa011d4c0dfcd86df8aa61e82ccad"),
        coinbase_time: GENESIS_COINBASE_TIME,
        coinbase_script: GENESIS_COINBASE_SCRIPT,
    };
    let pow = PowParams {
        limit: REGTEST_LIMIT,
        bits: 545_259_519,
        target_timespan: 16 * 60,
        target_spacing: 10 * 60,
        retarget_interval: 2016,
    };
    let block = BlockParams {
        prune_after_height: 1000,
        keep_blocks: 10_000,
        max_tip_age: i64::from(u32::MAX),
        slow_height: 0,
    };
    let mut params = ChainParams::new(
        Network::Regtest,
        genesis,
        pow,
        pos_params(REGTEST_LIMIT, 545_259_519),
        block,
    );
    params.activation_threshold = 108;
    params.miner_window = 144;
    params.deployments = vec![csv_deployment(0, i64::from(u32::MAX))];
    params
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_interval_sections_grow_towards_the_modifier_interval() {
        let params = chain_params(Network::Mainnet);
        assert_eq!(params.stake_modifier_selection_interval_section(0), 600 * 63 / 189);
        assert_eq!(params.stake_modifier_selection_interval_section(63), 600);
        let sum: i64 = (0..64)
            .map(|section| params.stake_modifier_selection_interval_section(section))
            .sum();
        assert_eq!(params.stake_modifier_selection_interval(), sum);
    }

    #[test]
    fn protocol_gates_follow_height() {
        let main = chain_params(Network::Mainnet);
        assert!(main.is_protocol_v1(2));
        assert!(main.is_protocol_v2(3));
        assert_eq!(main.target_spacing(2), 60);
        assert_eq!(main.target_spacing(3), 64);
        assert!(!main.is_protocol_v1_retargeting_fixed(1));
        assert!(main.is_protocol_v1_retargeting_fixed(2));

        let testnet = chain_params(Network::Testnet);
        assert!(testnet.is_protocol_v2(0));
        assert!(testnet.is_protocol_v1_retargeting_fixed(0));
    }

    #[test]
    fn mainnet_checkpoints_are_sorted_and_end_at_last_checkpoint() {
        let params = chain_params(Network::Mainnet);
        assert!(params
            .checkpoints
            .windows(2)
            .all(|pair| pair[0].height < pair[1].height));
        assert_eq!(params.checkpoints.last().map(|c| c.height), Some(params.last_checkpoint));
        assert_eq!(params.checkpoint(0), Some(&params.genesis.hash));
        assert!(params.checkpoint(1).is_none());
    }

    #[test]
    fn limits_are_little_endian() {
        let params = chain_params(Network::Mainnet);
        assert_eq!(params.pow.limit[31], 0x00);
        assert_eq!(params.pow.limit[29], 0x0f);
        assert_eq!(params.pow.limit[0], 0xff);
    }

    #[test]
    fn network_parses_from_config_names() {
        assert_eq!("main".parse::<Network>().ok(), Some(Network::Mainnet));
        assert_eq!("regtest".parse::<Network>().ok(), Some(Network::Regtest));
        assert!("simnet".parse::<Network>().is_err());
    }
}
