//! Canonical-encoding round trips and the block-identity law.

use {
    proptest::prelude::*,
    reimint_consensus::{
        calc_block_hash, calc_block_hash_with, BitArray, ConsensusMessage, DuplicateVoteEvidence,
        ExtraData, Proposal, Vote, VoteType,
    },
    reimint_types::{Block, Header, LocalSigner, Signer, H256, U256},
};

const CHAIN: u64 = 7;

fn signer(seed: u8) -> LocalSigner {
    let mut b = [0u8; 32];
    b[0] = seed.max(1);
    b[31] = 0xEF;
    LocalSigner::from_secret_bytes(&b).unwrap()
}

prop_compose! {
    fn arb_vote()(
        kind_is_prevote in any::<bool>(),
        height in 1u64..=1_000_000,
        round in 0u32..=64,
        hash_tag in 0u8..=255,
        timestamp in 0u64..=u64::MAX / 2,
        index in 0u32..=200,
        seed in 1u8..=16,
    ) -> Vote {
        let kind = if kind_is_prevote { VoteType::Prevote } else { VoteType::Precommit };
        let hash = if hash_tag == 0 { H256::zero() } else { H256::repeat_byte(hash_tag) };
        Vote::signed(CHAIN, kind, height, round, hash, timestamp, index, &signer(seed))
    }
}

prop_compose! {
    fn arb_proposal()(
        height in 1u64..=1_000_000,
        round in 1u32..=64,
        has_pol in any::<bool>(),
        pol in 0u32..=63,
        hash_tag in 0u8..=255,
        timestamp in 0u64..=u64::MAX / 2,
        seed in 1u8..=16,
    ) -> Proposal {
        let pol_round = if has_pol { Some(pol.min(round - 1)) } else { None };
        Proposal::signed(
            CHAIN,
            height,
            round,
            pol_round,
            H256::repeat_byte(hash_tag),
            timestamp,
            &signer(seed),
        )
    }
}

fn header_from(parts: &(u64, u8, u8, u64, u64)) -> Header {
    let (number, parent_tag, root_tag, gas, timestamp) = *parts;
    let mut h = Header::empty();
    h.number = number;
    h.parent_hash = H256::repeat_byte(parent_tag);
    h.state_root = H256::repeat_byte(root_tag);
    h.gas_limit = gas;
    h.timestamp = timestamp;
    h.difficulty = U256::from(1u64);
    h.extra_data = vec![0u8; 32];
    h
}

fn evidence_pair(seed: u8, height: u64) -> DuplicateVoteEvidence {
    let s = signer(seed);
    let a = Vote::signed(CHAIN, VoteType::Prevote, height, 0, H256::repeat_byte(1), 1, 0, &s);
    let b = Vote::signed(CHAIN, VoteType::Prevote, height, 0, H256::repeat_byte(2), 2, 0, &s);
    DuplicateVoteEvidence::new(a, b).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn vote_roundtrip(vote in arb_vote()) {
        let decoded: Vote = rlp::decode(&rlp::encode(&vote)).unwrap();
        prop_assert_eq!(&decoded, &vote);
        // Signatures survive re-encoding.
        prop_assert_eq!(decoded.recover_signer().ok(), vote.recover_signer().ok());
    }

    #[test]
    fn proposal_roundtrip(proposal in arb_proposal()) {
        let decoded: Proposal = rlp::decode(&rlp::encode(&proposal)).unwrap();
        prop_assert_eq!(decoded, proposal);
    }

    #[test]
    fn vote_wire_envelope_roundtrip(vote in arb_vote()) {
        let msg = ConsensusMessage::Vote(vote);
        let decoded = ConsensusMessage::decode(&msg.encode()).unwrap();
        prop_assert_eq!(decoded, msg);
    }

    #[test]
    fn block_roundtrip(
        parts in (1u64..=1_000_000, 0u8..=255, 0u8..=255, 0u64..=30_000_000, 0u64..=u64::MAX / 2),
        tx_bytes in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..32), 0..8),
    ) {
        let txs: Vec<Vec<u8>> = tx_bytes
            .iter()
            .map(|payload| rlp::encode(&payload.as_slice()).to_vec())
            .collect();
        let block = Block::new(header_from(&parts), txs);
        let decoded: Block = rlp::decode(&rlp::encode(&block)).unwrap();
        prop_assert_eq!(decoded, block);
    }

    #[test]
    fn extra_data_roundtrip(
        round in 0u32..=32,
        commit_round in prop::option::of(0u32..=32),
        evidence_count in 0usize..=3,
        seed in 1u8..=8,
    ) {
        let proposal = Proposal::signed(
            CHAIN, 9, round, None, H256::repeat_byte(5), 77, &signer(seed),
        );
        let evidence = (0..evidence_count)
            .map(|i| evidence_pair(i as u8 + 1, 9))
            .collect::<Vec<_>>();
        let mut bitmap = BitArray::new(4);
        bitmap.set(0, true);
        bitmap.set(2, true);
        let base = ExtraData::new_proposal(round, None, evidence, proposal);
        let extra = match commit_round {
            Some(cr) => base.with_commit(
                cr,
                bitmap,
                vec![signer(seed).sign(H256::repeat_byte(9)); 2],
            ),
            None => base,
        };
        let decoded: ExtraData = rlp::decode(&rlp::encode(&extra)).unwrap();
        prop_assert_eq!(decoded, extra);
    }

    /// The block hash covers evidence but is indifferent to which votes
    /// sealed the block.
    #[test]
    fn block_hash_excludes_votes(
        parts in (1u64..=1_000_000, 0u8..=255, 0u8..=255, 0u64..=30_000_000, 0u64..=u64::MAX / 2),
        commit_round_a in 0u32..=8,
        commit_round_b in 0u32..=8,
    ) {
        let evidence = vec![evidence_pair(3, parts.0)];
        let header = header_from(&parts);
        let expected = calc_block_hash_with(&header, &evidence);
        let proposal = Proposal::signed(CHAIN, parts.0, 0, None, expected, 5, &signer(1));

        let seal_with = |commit_round: u32, voters: &[usize]| {
            let mut bitmap = BitArray::new(4);
            let mut sigs = Vec::new();
            for &i in voters {
                bitmap.set(i, true);
                sigs.push(signer(i as u8 + 1).sign(H256::repeat_byte(i as u8)));
            }
            let mut sealed = header.clone();
            ExtraData::new_proposal(0, None, evidence.clone(), proposal.clone())
                .with_commit(commit_round, bitmap, sigs)
                .seal_into(&mut sealed);
            sealed
        };

        let a = seal_with(commit_round_a, &[0, 1, 2]);
        let b = seal_with(commit_round_b, &[1, 2, 3]);
        prop_assert_eq!(calc_block_hash(&a), expected);
        prop_assert_eq!(calc_block_hash(&b), expected);

        // Different evidence is a different block.
        let mut other = header.clone();
        ExtraData::new_proposal(0, None, vec![evidence_pair(7, parts.0)], proposal.clone())
            .seal_into(&mut other);
        prop_assert_ne!(calc_block_hash(&other), expected);
    }
}
