//! In-memory multi-validator network.
//!
//! Each node is the full consensus stack: a state machine plus a reactor.
//! Links between nodes are modeled as peer *sessions* — cutting a link
//! disconnects the peers (frames in flight are lost), healing establishes a
//! fresh session, after which the reactors' height caches re-gossip
//! whatever the other side missed. Arbitrary signed messages can be
//! injected to model Byzantine validators.
//!
//! Each node runs a tiny block pipeline that builds deterministic blocks
//! (the proposer's address is the coinbase, so different proposers build
//! different blocks) and reports commits back to the harness, which feeds
//! the new head into the committing node — the production
//! `commit → new_block_header` cycle, minus the EVM.

use {
    async_trait::async_trait,
    reimint_consensus::{
        BlockPipeline, ConsensusMessage, EvidencePool, PipelineError, ReimintConfig, StateMachine,
        StateMachineHandle, ValidatorSet,
    },
    reimint_consensus_net::{Reactor, ReactorConfig, ReactorHandle},
    reimint_types::{Address, Block, Header, LocalSigner, Signer, H256, EXTRA_VANITY},
    std::{
        collections::HashSet,
        sync::{Arc, Mutex},
        time::Duration,
    },
    tokio::sync::mpsc,
};

pub const CHAIN_ID: u64 = 7;

/// A consensus configuration with short timeouts for in-process networks.
pub fn test_config() -> ReimintConfig {
    let mut config = ReimintConfig::default();
    config.chain_id = CHAIN_ID;
    config.propose_timeout_base_ms = 300;
    config.propose_timeout_delta_ms = 150;
    config.prevote_timeout_base_ms = 200;
    config.prevote_timeout_delta_ms = 100;
    config.precommit_timeout_base_ms = 200;
    config.precommit_timeout_delta_ms = 100;
    config.commit_timeout_ms = 100;
    // Bursty in-process gossip; keep the queue roomy so tests exercise
    // protocol logic rather than overflow recovery.
    config.message_queue_size = 256;
    config
}

fn reactor_config() -> ReactorConfig {
    let mut config = ReactorConfig::dev_default();
    config.gossip_interval_ms = 25;
    config
}

struct HarnessPipeline {
    coinbase: Address,
    committed: Arc<Mutex<Vec<Block>>>,
    commit_tx: mpsc::UnboundedSender<(usize, Block)>,
    index: usize,
    validators: ValidatorSet,
}

#[async_trait]
impl BlockPipeline for HarnessPipeline {
    async fn build_pending_block(&self, parent_hash: H256) -> Result<Block, PipelineError> {
        let height = self.committed.lock().unwrap().len() as u64 + 1;
        let mut header = Header::empty();
        header.number = height;
        header.parent_hash = parent_hash;
        header.coinbase = self.coinbase;
        header.gas_limit = 8_000_000;
        header.timestamp = 1_700_000_000 + height;
        header.extra_data = vec![0u8; EXTRA_VANITY];
        Ok(Block::new(header, vec![]))
    }

    async fn commit_block(&self, block: Block) -> Result<(), PipelineError> {
        self.committed.lock().unwrap().push(block.clone());
        let _ = self.commit_tx.send((self.index, block));
        Ok(())
    }

    fn validator_set(&self, _state_root: H256) -> Result<ValidatorSet, PipelineError> {
        Ok(self.validators.clone())
    }

    fn has_pending_transactions(&self) -> bool {
        false
    }
}

/// One validator node: state machine, reactor, and its observable outputs.
pub struct Node {
    pub handle: Arc<StateMachineHandle>,
    pub reactor: Arc<ReactorHandle>,
    pub committed: Arc<Mutex<Vec<Block>>>,
    pub evidence: Arc<EvidencePool>,
    pub address: Address,
}

impl Node {
    pub fn committed_blocks(&self) -> Vec<Block> {
        self.committed.lock().unwrap().clone()
    }
}

/// A full-mesh network of consensus stacks with session-style links.
pub struct Network {
    pub nodes: Vec<Node>,
    /// Signers in canonical validator-index order.
    pub signers: Vec<LocalSigner>,
    pub validators: ValidatorSet,
    /// Unordered pairs currently connected.
    connected: HashSet<(usize, usize)>,
    commit_rx: mpsc::UnboundedReceiver<(usize, Block)>,
    genesis: Header,
}

impl Network {
    /// Build and start `n` equal-power validators in a full mesh. The
    /// network is idle until [`Network::start`] seeds the first height.
    pub fn new(n: usize, config: ReimintConfig) -> Self {
        let mut signers: Vec<LocalSigner> = (0..n)
            .map(|i| {
                let mut b = [0u8; 32];
                b[0] = i as u8 + 1;
                b[31] = 0xE7;
                LocalSigner::from_secret_bytes(&b).unwrap()
            })
            .collect();
        let validators =
            ValidatorSet::new(signers.iter().map(|s| (s.address(), 100)).collect()).unwrap();
        signers.sort_by_key(|s| validators.index_by_address(&s.address()).unwrap());

        let (commit_tx, commit_rx) = mpsc::unbounded_channel();
        let mut nodes = Vec::with_capacity(n);
        for (i, signer) in signers.iter().enumerate() {
            let committed = Arc::new(Mutex::new(Vec::new()));
            let evidence =
                Arc::new(EvidencePool::in_memory(config.max_age_num_blocks).unwrap());
            let address = signer.address();
            let pipeline = Arc::new(HarnessPipeline {
                coinbase: address,
                committed: committed.clone(),
                commit_tx: commit_tx.clone(),
                index: i,
                validators: validators.clone(),
            });
            let mut b = [0u8; 32];
            b[0] = seed_of(&signers, i);
            b[31] = 0xE7;
            let own_signer = Arc::new(LocalSigner::from_secret_bytes(&b).unwrap());
            let (machine, notifications) =
                StateMachine::new(config.clone(), own_signer, pipeline, evidence.clone());
            let handle = Arc::new(machine.start());
            let reactor = Arc::new(
                Reactor::new(reactor_config(), handle.input_queue()).start(notifications),
            );
            nodes.push(Node {
                handle,
                reactor,
                committed,
                evidence,
                address,
            });
        }

        let mut genesis = Header::empty();
        genesis.number = 0;
        genesis.state_root = H256::repeat_byte(0x10);

        let mut net = Self {
            nodes,
            signers,
            validators,
            connected: HashSet::new(),
            commit_rx,
            genesis,
        };
        for a in 0..n {
            for b in a + 1..n {
                net.connect(a, b);
            }
        }
        net
    }

    /// Seed the first height on every node.
    pub fn start(&self) {
        for node in &self.nodes {
            node.handle
                .new_block_header(self.genesis.clone(), self.validators.clone());
        }
    }

    fn peer_name(i: usize) -> String {
        format!("node-{i}")
    }

    /// Open a fresh session between two nodes (idempotent).
    pub fn connect(&mut self, a: usize, b: usize) {
        let key = (a.min(b), a.max(b));
        if !self.connected.insert(key) {
            return;
        }
        self.wire(a, b);
        self.wire(b, a);
    }

    /// One direction: frames queued by `from`'s reactor for `to` are
    /// delivered into `to`'s reactor.
    fn wire(&self, from: usize, to: usize) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        self.nodes[from]
            .reactor
            .add_peer(Self::peer_name(to), tx)
            .expect("add peer");
        let receiver = self.nodes[to].reactor.clone();
        let from_name = Self::peer_name(from);
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if receiver.on_frame(from_name.clone(), frame).is_err() {
                    break;
                }
            }
        });
    }

    /// Drop the session between two nodes; frames in flight are lost.
    pub fn cut_link(&mut self, a: usize, b: usize) {
        let key = (a.min(b), a.max(b));
        if !self.connected.remove(&key) {
            return;
        }
        let _ = self.nodes[a].reactor.remove_peer(Self::peer_name(b));
        let _ = self.nodes[b].reactor.remove_peer(Self::peer_name(a));
    }

    /// Disconnect a node from everyone.
    pub fn isolate(&mut self, node: usize) {
        for other in 0..self.nodes.len() {
            if other != node {
                self.cut_link(node, other);
            }
        }
    }

    /// Re-establish every missing link.
    pub fn heal(&mut self) {
        for a in 0..self.nodes.len() {
            for b in a + 1..self.nodes.len() {
                self.connect(a, b);
            }
        }
    }

    /// Inject a message into one node's state machine as if it came from
    /// the named peer, bypassing the reactor.
    pub fn inject(&self, to: usize, from: &str, msg: ConsensusMessage) {
        self.nodes[to].handle.new_message(from.to_string(), msg);
    }

    /// Drive the commit → next-height cycle until every node in
    /// `participants` has committed `target` blocks. Panics on timeout.
    pub async fn run_until_height(&mut self, participants: &[usize], target: u64, limit: Duration) {
        let result = tokio::time::timeout(limit, async {
            let mut heights = vec![0u64; self.nodes.len()];
            for (i, node) in self.nodes.iter().enumerate() {
                heights[i] = node.committed.lock().unwrap().len() as u64;
            }
            loop {
                if participants.iter().all(|&i| heights[i] >= target) {
                    return;
                }
                let (i, block) = self
                    .commit_rx
                    .recv()
                    .await
                    .expect("commit channel closed");
                heights[i] = block.number();
                self.nodes[i]
                    .handle
                    .new_block_header(block.header.clone(), self.validators.clone());
            }
        })
        .await;
        result.unwrap_or_else(|_| panic!("network did not reach height {target} in {limit:?}"))
    }

    /// The canonical index whose turn it is to propose round 0 of height 1
    /// (the seeded proposer).
    pub fn seeded_proposer(&self) -> usize {
        self.validators
            .index_by_address(&self.validators.proposer().address)
            .unwrap()
    }
}

fn seed_of(signers: &[LocalSigner], index: usize) -> u8 {
    // Recover the generation seed for the signer now at `index`.
    let target = signers[index].address();
    for seed in 1..=signers.len() as u8 {
        let mut b = [0u8; 32];
        b[0] = seed;
        b[31] = 0xE7;
        if LocalSigner::from_secret_bytes(&b).unwrap().address() == target {
            return seed;
        }
    }
    unreachable!("signer seed must exist")
}
