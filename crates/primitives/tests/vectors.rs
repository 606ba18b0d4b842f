use ldoged_consensus::{chain_params, Network};
use ldoged_primitives::block::Block;

const MAIN_GENESIS_RAW: &str = "0100000000000000000000000000000000000000000000000000000000000000000000003268f84c964c94f8fd7c3e55cbc4de0d3e11ebc82960ca7c4311383e8689806e52e70555ffff0f1ec51d0e00010100000052e70555010000000000000000000000000000000000000000000000000000000000000000ffffffff1900012a15706c7a2074696d65207374616d702e207374616870ffffffff0100000000000000000000000000";

#[test]
fn mainnet_genesis_serializes_to_known_bytes() {
    let params = chain_params(Network::Mainnet);
    let block = Block::genesis(&params);
    let raw = block.consensus_encode();
    assert_eq!(raw.len(), 170);
    assert_eq!(hex::encode(&raw), MAIN_GENESIS_RAW);

    let decoded = Block::consensus_decode(&raw).expect("decode genesis");
    assert_eq!(decoded, block);
}

#[test]
fn genesis_merkle_root_matches_coinbase() {
    let params = chain_params(Network::Mainnet);
    let block = Block::genesis(&params);
    let (root, mutated) = block.merkle_root();
    assert!(!mutated);
    assert_eq!(root, params.genesis.merkle_root);
    assert_eq!(root, block.transactions[0].txid());
    assert_eq!(block.transactions[0].size(), 89);
}

#[test]
fn genesis_hashes_match_parameters() {
    for network in [Network::Mainnet, Network::Testnet, Network::Regtest] {
        let params = chain_params(network);
        let block = Block::genesis(&params);
        assert_eq!(block.hash(), params.genesis.hash, "{network}");
        assert!(block.transactions[0].is_coinbase());
        assert!(!block.is_proof_of_stake());
    }
}

#[test]
fn mainnet_genesis_display_hash() {
    let params = chain_params(Network::Mainnet);
    let hash = Block::genesis(&params).hash();
    assert_eq!(
        ldoged_consensus::hash_to_display(&hash),
        "0000032101032f27e7cdddb1196353f7fc9e1b6294717432135add95534f67c6"
    );
}
