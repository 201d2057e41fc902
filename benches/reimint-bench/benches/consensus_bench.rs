//! Consensus core benchmarks.
//!
//! Measures:
//! - Vote verification + tally throughput at committee sizes 50/100/200
//! - Proposer-priority increments
//! - Block identity hashing with and without a seal

use {
    criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput},
    reimint_bench::committee,
    reimint_consensus::{
        calc_block_hash, calc_block_hash_with, ExtraData, Proposal, Vote, VoteSet, VoteType,
    },
    reimint_types::{Header, Signer, H256, EXTRA_VANITY},
    std::sync::Arc,
};

const CHAIN: u64 = 7;

fn bench_vote_set_fill(c: &mut Criterion) {
    let mut group = c.benchmark_group("vote_set_fill");
    for &n in &[50usize, 100, 200] {
        let (signers, vs) = committee(n);
        let vs = Arc::new(vs);
        let hash = H256::repeat_byte(0xAA);
        let votes: Vec<Vote> = (0..n as u32)
            .map(|i| {
                Vote::signed(
                    CHAIN,
                    VoteType::Prevote,
                    1,
                    0,
                    hash,
                    1_000,
                    i,
                    &signers[i as usize],
                )
            })
            .collect();

        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n), &votes, |b, votes| {
            b.iter(|| {
                let mut set = VoteSet::new(CHAIN, 1, 0, VoteType::Prevote, vs.clone());
                for vote in votes {
                    set.add_vote(vote.clone()).unwrap();
                }
                assert!(set.has_two_thirds_majority());
            })
        });
    }
    group.finish();
}

fn bench_proposer_priority(c: &mut Criterion) {
    let mut group = c.benchmark_group("proposer_priority");
    for &n in &[50usize, 100, 200] {
        let (_, vs) = committee(n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &vs, |b, vs| {
            b.iter(|| {
                let mut set = vs.clone();
                set.increment_proposer_priority(100);
                set.proposer().address
            })
        });
    }
    group.finish();
}

fn bench_block_hash(c: &mut Criterion) {
    let (signers, _) = committee(4);
    let mut header = Header::empty();
    header.number = 42;
    header.parent_hash = H256::repeat_byte(1);
    header.extra_data = vec![0u8; EXTRA_VANITY];

    let hash = calc_block_hash_with(&header, &[]);
    let proposal = Proposal::signed(CHAIN, 42, 0, None, hash, 1_000, &signers[0]);
    let mut sealed = header.clone();
    ExtraData::new_proposal(0, None, vec![], proposal).seal_into(&mut sealed);

    c.bench_function("block_hash_unsealed", |b| {
        b.iter(|| calc_block_hash(&header))
    });
    c.bench_function("block_hash_sealed", |b| b.iter(|| calc_block_hash(&sealed)));
}

criterion_group!(
    benches,
    bench_vote_set_fill,
    bench_proposer_priority,
    bench_block_hash
);
criterion_main!(benches);
