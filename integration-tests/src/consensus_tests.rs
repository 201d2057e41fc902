//! Multi-validator scenarios: happy path, proposer failure, partitions,
//! Byzantine double-votes, and the single-validator boundary.

use {
    crate::harness::{test_config, Network, CHAIN_ID},
    reimint_consensus::{
        calc_block_hash, ConsensusMessage, ExtraData, Vote, VoteType,
    },
    reimint_types::H256,
    std::time::Duration,
};

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_happy_path_four_validators() {
    init_logs();
    let mut net = Network::new(4, test_config());
    net.start();
    net.run_until_height(&[0, 1, 2, 3], 2, Duration::from_secs(30)).await;

    // Every node committed the same chain, exactly once per height.
    let chain0 = net.nodes[0].committed_blocks();
    assert!(chain0.len() >= 2);
    for node in &net.nodes[1..] {
        let chain = node.committed_blocks();
        for (a, b) in chain0.iter().zip(chain.iter()) {
            assert_eq!(calc_block_hash(&a.header), calc_block_hash(&b.header));
        }
    }
    // Heights are strictly sequential — commit fired once per height.
    for (i, block) in chain0.iter().enumerate() {
        assert_eq!(block.number(), i as u64 + 1);
    }

    // The decided blocks carry verifying commit aggregates.
    let seal = ExtraData::from_header(&chain0[0].header).unwrap();
    assert!(seal.commit_round.is_some());
    seal.verify_commit(&chain0[0].header, &net.validators).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_absent_proposer_skips_to_next_round() {
    init_logs();
    let mut net = Network::new(4, test_config());
    // Silence the validator that would propose round 0 of height 1.
    let dead = net.seeded_proposer();
    net.isolate(dead);
    net.start();

    let live: Vec<usize> = (0..4).filter(|&i| i != dead).collect();
    net.run_until_height(&live, 1, Duration::from_secs(30)).await;

    for &i in &live {
        let chain = net.nodes[i].committed_blocks();
        let seal = ExtraData::from_header(&chain[0].header).unwrap();
        // Round 0 could not decide without its proposer.
        assert!(seal.commit_round.unwrap() >= 1, "expected a round skip");
        // The dead validator cannot appear in the aggregate.
        let dead_addr = net.nodes[dead].address;
        let dead_index = net.validators.index_by_address(&dead_addr).unwrap();
        assert!(!seal.commit_bitmap.iter_ones().any(|idx| idx == dead_index));
        seal.verify_commit(&chain[0].header, &net.validators).unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_partition_heals_without_forking() {
    init_logs();
    let mut net = Network::new(4, test_config());
    // Split 2/2: neither side can gather two thirds.
    net.cut_link(0, 2);
    net.cut_link(0, 3);
    net.cut_link(1, 2);
    net.cut_link(1, 3);
    net.start();

    // Let a few rounds burn with no possible progress.
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    for node in &net.nodes {
        assert!(node.committed_blocks().is_empty(), "committed during partition");
    }

    net.heal();
    net.run_until_height(&[0, 1, 2, 3], 1, Duration::from_secs(30)).await;

    let reference = calc_block_hash(&net.nodes[0].committed_blocks()[0].header);
    for node in &net.nodes[1..] {
        assert_eq!(
            calc_block_hash(&node.committed_blocks()[0].header),
            reference,
            "partition healed into a fork"
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_double_vote_becomes_sealed_evidence() {
    init_logs();
    let mut net = Network::new(4, test_config());
    net.start();

    // Validator 3 equivocates: two different round-0 prevotes at height 1,
    // pushed straight into every honest node.
    let byz = 3u32;
    let vote_a = Vote::signed(
        CHAIN_ID,
        VoteType::Prevote,
        1,
        0,
        H256::repeat_byte(0xA1),
        10,
        byz,
        &net.signers[byz as usize],
    );
    let vote_b = Vote::signed(
        CHAIN_ID,
        VoteType::Prevote,
        1,
        0,
        H256::repeat_byte(0xB2),
        11,
        byz,
        &net.signers[byz as usize],
    );
    for to in 0..3 {
        net.inject(to, "byzantine", ConsensusMessage::Vote(vote_a.clone()));
        net.inject(to, "byzantine", ConsensusMessage::Vote(vote_b.clone()));
    }

    // Consensus still proceeds (3 of 4 honest), and by height 3 some honest
    // proposer has sealed the duplicate-vote proof into a block.
    net.run_until_height(&[0, 1, 2], 3, Duration::from_secs(30)).await;

    let chain = net.nodes[0].committed_blocks();
    let sealed_evidence: Vec<_> = chain
        .iter()
        .flat_map(|b| ExtraData::from_header(&b.header).unwrap().evidence)
        .collect();
    assert!(
        !sealed_evidence.is_empty(),
        "equivocation never made it into a block"
    );
    let ev = &sealed_evidence[0];
    assert_eq!(ev.vote_a.validator_index, byz);
    assert_eq!(ev.height(), 1);
    assert_ne!(ev.vote_a.block_hash, ev.vote_b.block_hash);

    // At least one honest pool recorded it within the height.
    let pool_hit = (0..3).any(|i| {
        net.nodes[i]
            .evidence
            .is_pending(ev)
            .unwrap_or(false)
            || net.nodes[i].evidence.is_committed(ev).unwrap_or(false)
    });
    assert!(pool_hit, "no honest evidence pool holds the proof");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_single_validator_chain_advances() {
    init_logs();
    let mut config = test_config();
    config.skip_timeout_commit = true;
    let mut net = Network::new(1, config);
    net.start();
    net.run_until_height(&[0], 3, Duration::from_secs(30)).await;

    let chain = net.nodes[0].committed_blocks();
    assert!(chain.len() >= 3);
    for (i, block) in chain.iter().enumerate().take(3) {
        assert_eq!(block.number(), i as u64 + 1);
        let seal = ExtraData::from_header(&block.header).unwrap();
        assert_eq!(seal.commit_round, Some(0));
        // One vote is a commit all by itself.
        assert_eq!(seal.commit_bitmap.count_ones(), 1);
        seal.verify_commit(&block.header, &net.validators).unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_locked_validators_recommit_original_block() {
    init_logs();
    let mut net = Network::new(4, test_config());
    net.start();

    // Let height 1 get decided normally, then partition during height 2 and
    // heal — whatever block survives must be agreed on by everyone.
    net.run_until_height(&[0, 1, 2, 3], 1, Duration::from_secs(30)).await;
    net.cut_link(2, 0);
    net.cut_link(2, 1);
    net.cut_link(3, 0);
    net.cut_link(3, 1);
    tokio::time::sleep(Duration::from_millis(1_000)).await;
    net.heal();
    net.run_until_height(&[0, 1, 2, 3], 2, Duration::from_secs(30)).await;

    let reference: Vec<H256> = net.nodes[0]
        .committed_blocks()
        .iter()
        .map(|b| calc_block_hash(&b.header))
        .collect();
    for node in &net.nodes[1..] {
        let chain: Vec<H256> = node
            .committed_blocks()
            .iter()
            .take(reference.len())
            .map(|b| calc_block_hash(&b.header))
            .collect();
        assert_eq!(chain, reference[..chain.len()].to_vec());
    }
}
