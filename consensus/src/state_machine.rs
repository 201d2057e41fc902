//! The Reimint height/round/step state machine.
//!
//! One cooperative loop consumes [`Event`]s — peer messages, timer expiries,
//! new chain heads — in arrival order and drives the two-phase commit:
//!
//! ```text
//! NewHeight ─▶ NewRound ─▶ Propose ─▶ Prevote ─▶ (PrevoteWait)
//!                 ▲                                    │
//!                 │                                    ▼
//!                 └──── (PrecommitWait) ◀─── Precommit ┴─▶ Commit
//! ```
//!
//! Transitions are serial and lock-free; the only suspension points are
//! reading the next event, awaiting a pending-block build (run on a side
//! task that feeds the result back through the queue), and awaiting
//! `commit_block` after a decision.
//!
//! The machine holds no knowledge of execution, storage, or networking: it
//! sees the narrow [`BlockPipeline`] trait, a [`Signer`], the evidence pool,
//! and emits [`Notification`]s the reactor turns into gossip.

use {
    crate::{
        config::ReimintConfig,
        event::{Event, EventQueue},
        evidence::{DuplicateVoteEvidence, EvidencePool},
        extra_data::{calc_block_hash, calc_block_hash_with, ExtraData},
        message::ConsensusMessage,
        proposal::Proposal,
        round_state::{RoundState, Step},
        timeout::{TimeoutInfo, TimeoutTicker},
        validator_set::ValidatorSet,
        vote::{Vote, VoteType},
        vote_set::VoteSetError,
        PeerId,
    },
    async_trait::async_trait,
    log::*,
    lru::LruCache,
    reimint_types::{Block, Header, Signer, H256},
    std::{
        collections::BTreeMap,
        num::NonZeroUsize,
        sync::Arc,
        time::{Duration, Instant, SystemTime, UNIX_EPOCH},
    },
    tokio::{sync::mpsc, task::JoinHandle},
    thiserror::Error,
};

/// Errors surfaced by the block pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pending block build failed: {0}")]
    BuildFailed(String),
    #[error("block commit failed: {0}")]
    CommitFailed(String),
    #[error("no validator set for state root {0:?}")]
    UnknownStateRoot(H256),
}

/// The narrow seam between consensus and the rest of the node.
///
/// `commit_block` applies a decided block (execution + persistence); once
/// the new head is durable the pipeline re-enters the machine through
/// [`StateMachineHandle::new_block_header`].
#[async_trait]
pub trait BlockPipeline: Send + Sync {
    /// Ask the worker for a pending block built on `parent_hash`.
    async fn build_pending_block(&self, parent_hash: H256) -> Result<Block, PipelineError>;

    /// Execute and persist a decided block.
    async fn commit_block(&self, block: Block) -> Result<(), PipelineError>;

    /// Validator set recorded at a state root (the staking-contract reader).
    fn validator_set(&self, state_root: H256) -> Result<ValidatorSet, PipelineError>;

    /// Whether the transaction pool currently holds anything; gates the
    /// empty-block wait.
    fn has_pending_transactions(&self) -> bool;
}

/// Outbound notifications, consumed by the reactor.
#[derive(Debug, Clone)]
pub enum Notification {
    /// We moved to a new (height, round, step).
    NewRoundStep {
        height: u64,
        round: u32,
        step: Step,
        seconds_since_start_time: u64,
        last_commit_round: Option<u32>,
    },
    /// A block gathered a prevote majority (or was decided).
    NewValidBlock {
        height: u64,
        round: u32,
        block_hash: H256,
        is_commit: bool,
    },
    /// We ingested a vote; peers can skip sending it.
    HasVote {
        height: u64,
        round: u32,
        kind: VoteType,
        index: u32,
    },
    /// We need the full block for `block_hash`; `peer` is the preferred
    /// source when known.
    GetProposalBlock {
        block_hash: H256,
        peer: Option<PeerId>,
    },
    /// A self-generated message (our proposal, block, or vote) to gossip.
    Broadcast(Box<ConsensusMessage>),
}

/// Control handle returned by [`StateMachine::start`].
pub struct StateMachineHandle {
    queue: EventQueue,
    join: JoinHandle<()>,
}

impl StateMachineHandle {
    /// Feed a consensus message from a peer.
    pub fn new_message(&self, peer: PeerId, msg: ConsensusMessage) {
        self.queue.push(Event::Message {
            peer: Some(peer),
            msg,
        });
    }

    /// Start the next height: `header` is the freshly committed head, and
    /// `validators` the set elected for `header.number + 1`.
    pub fn new_block_header(&self, header: Header, validators: ValidatorSet) {
        self.queue.push(Event::NewBlockHeader { header, validators });
    }

    /// A clone of the machine's input queue, for producers (the reactor)
    /// that feed `(peer, message)` events directly.
    pub fn input_queue(&self) -> EventQueue {
        self.queue.clone()
    }

    /// Close the input queue and wait for the loop to drain and exit. An
    /// in-flight commit is allowed to finish.
    pub async fn abort(self) {
        self.queue.close();
        let _ = self.join.await;
    }
}

/// The consensus state machine. Construct with [`StateMachine::new`], then
/// [`StateMachine::start`] to spawn the loop.
pub struct StateMachine {
    config: ReimintConfig,
    signer: Arc<dyn Signer>,
    pipeline: Arc<dyn BlockPipeline>,
    evidence: Arc<EvidencePool>,

    queue: EventQueue,
    ticker: TimeoutTicker,
    notifications: mpsc::UnboundedSender<Notification>,

    /// Round state of the height being decided; `None` until the first
    /// `new_block_header`.
    rs: Option<RoundState>,
    /// Commit round of the previously finalized height.
    last_commit_round: Option<u32>,

    /// Historic validator sets keyed by the parent state root, plus the
    /// height → root index used when verifying old evidence.
    vset_cache: LruCache<H256, Arc<ValidatorSet>>,
    roots_by_height: BTreeMap<u64, H256>,

    /// A decided, sealed block waiting to be applied after the current
    /// event finishes.
    pending_commit: Option<Block>,
}

impl StateMachine {
    /// Build a machine and the notification stream it will emit into.
    pub fn new(
        config: ReimintConfig,
        signer: Arc<dyn Signer>,
        pipeline: Arc<dyn BlockPipeline>,
        evidence: Arc<EvidencePool>,
    ) -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let queue = EventQueue::new(config.message_queue_size);
        let ticker = TimeoutTicker::start(queue.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        let cache_size =
            NonZeroUsize::new(config.validator_set_cache_size).expect("validated config");
        let machine = Self {
            config,
            signer,
            pipeline,
            evidence,
            queue,
            ticker,
            notifications: tx,
            rs: None,
            last_commit_round: None,
            vset_cache: LruCache::new(cache_size),
            roots_by_height: BTreeMap::new(),
            pending_commit: None,
        };
        (machine, rx)
    }

    /// Spawn the cooperative loop.
    pub fn start(self) -> StateMachineHandle {
        let queue = self.queue.clone();
        let join = tokio::spawn(self.run());
        StateMachineHandle { queue, join }
    }

    async fn run(mut self) {
        info!(
            "consensus state machine started (signer: {:?})",
            self.signer.address()
        );
        while let Some(event) = self.queue.pop().await {
            match event {
                Event::NewBlockHeader { header, validators } => {
                    self.handle_new_block_header(header, validators)
                }
                Event::Timeout(info) => self.handle_timeout(info),
                Event::Message { peer, msg } => self.handle_message(peer, msg),
            }
            // Suspension point: apply a decided block before the next event.
            if let Some(block) = self.pending_commit.take() {
                let height = block.number();
                let evidence = ExtraData::from_header(&block.header)
                    .map(|extra| extra.evidence)
                    .unwrap_or_default();
                match self.pipeline.commit_block(block).await {
                    Ok(()) => {
                        info!("committed block at height {height}");
                        if let Err(e) = self.evidence.update(&evidence, height) {
                            warn!("evidence pool update failed at height {height}: {e}");
                        }
                    }
                    Err(e) => {
                        // Stay at Commit; a later majority re-enters the
                        // height once the pipeline recovers.
                        error!("commit failed at height {height}: {e}");
                    }
                }
            }
        }
        self.ticker.stop();
        info!("consensus state machine stopped");
    }

    // ── Event handlers ──────────────────────────────────────────────────

    fn handle_new_block_header(&mut self, header: Header, validators: ValidatorSet) {
        let height = header.number + 1;
        let validators = Arc::new(validators);

        self.vset_cache.put(header.state_root, validators.clone());
        self.roots_by_height.insert(height, header.state_root);
        while self.roots_by_height.len() > self.config.validator_set_cache_size {
            self.roots_by_height.pop_first();
        }

        let commit_time = self
            .rs
            .as_ref()
            .and_then(|rs| rs.commit_time)
            .unwrap_or_else(Instant::now);
        self.last_commit_round = self.rs.as_ref().and_then(|rs| rs.commit_round);
        let start_time = commit_time + Duration::from_millis(self.config.commit_timeout_ms);
        let parent_hash = calc_block_hash(&header);

        info!(
            "starting height {height} on parent {:?} ({} validators)",
            parent_hash,
            validators.len()
        );
        self.rs = Some(RoundState::new(
            self.config.chain_id,
            height,
            validators,
            parent_hash,
            header.state_root,
            start_time,
        ));
        self.notify_new_round_step();

        if self.config.skip_timeout_commit {
            self.enter_new_round(height, 0);
        } else {
            let wait = start_time.saturating_duration_since(Instant::now());
            self.schedule(wait, height, 0, Step::NewHeight);
        }
    }

    fn handle_timeout(&mut self, info: TimeoutInfo) {
        let Some(rs) = self.rs.as_ref() else { return };
        if info.height != rs.height
            || info.round < rs.round
            || (info.round == rs.round && info.step < rs.step)
        {
            debug!(
                "ignoring stale timeout {info} at h={} r={} step={}",
                rs.height, rs.round, rs.step
            );
            return;
        }
        debug!("timeout fired: {info}");
        match info.step {
            Step::NewHeight => self.enter_new_round(info.height, 0),
            Step::NewRound => self.enter_propose(info.height, 0),
            Step::Propose => self.enter_prevote(info.height, info.round),
            Step::PrevoteWait => self.enter_precommit(info.height, info.round),
            Step::PrecommitWait => self.enter_new_round(info.height, info.round + 1),
            other => warn!("unexpected timeout step {other}"),
        }
    }

    fn handle_message(&mut self, peer: Option<PeerId>, msg: ConsensusMessage) {
        match msg {
            ConsensusMessage::Proposal(p) => self.set_proposal(peer, p),
            ConsensusMessage::ProposalBlock(b) => self.add_proposal_block(peer, b),
            ConsensusMessage::Vote(v) => self.try_add_vote(peer, v),
            ConsensusMessage::VoteSetMaj23 {
                height,
                round,
                kind,
                block_hash,
            } => self.record_peer_maj23(peer, height, round, kind, block_hash),
            other => trace!(
                "state machine ignoring reactor-level message {}",
                other.kind()
            ),
        }
    }

    /// Record a peer's claim of a two-thirds majority; the reactor uses it
    /// to steer targeted gossip, transitions never trust it.
    fn record_peer_maj23(
        &mut self,
        peer: Option<PeerId>,
        height: u64,
        round: u32,
        kind: VoteType,
        block_hash: H256,
    ) {
        let Some(peer) = peer else { return };
        let Some(rs) = self.rs.as_mut() else { return };
        if height != rs.height {
            return;
        }
        let set = match kind {
            VoteType::Prevote => rs.votes.prevotes_mut(round),
            VoteType::Precommit => rs.votes.precommits_mut(round),
            VoteType::Proposal => None,
        };
        if let Some(set) = set {
            set.set_peer_maj23(peer, block_hash);
        }
    }

    // ── Message handling ────────────────────────────────────────────────

    fn set_proposal(&mut self, peer: Option<PeerId>, p: Proposal) {
        let Some(rs) = self.rs.as_mut() else { return };
        if rs.proposal.is_some() {
            return;
        }
        if p.height != rs.height || p.round != rs.round {
            debug!(
                "proposal for ({}, {}) ignored at ({}, {})",
                p.height, p.round, rs.height, rs.round
            );
            return;
        }
        if p.chain_id != self.config.chain_id || !p.pol_round_is_valid() {
            warn!("protocol violation: malformed proposal from {peer:?}");
            return;
        }
        let proposer = rs.validators.proposer().address;
        if !p.validate_signature(&proposer) {
            warn!("protocol violation: proposal not signed by proposer {proposer:?}");
            return;
        }

        info!(
            "accepted proposal for h={} r={} hash={:?} (pol={:?})",
            p.height, p.round, p.block_hash, p.pol_round
        );
        let block_hash = p.block_hash;
        let have_block = rs
            .proposal_block
            .as_ref()
            .map(|b| calc_block_hash(&b.header) == block_hash)
            .unwrap_or(false);
        rs.proposal = Some(p.clone());
        rs.proposal_block_hash = Some(block_hash);

        match peer {
            None => {
                // Our own proposal; the block follows right behind it.
                self.notify(Notification::Broadcast(Box::new(ConsensusMessage::Proposal(p))));
            }
            Some(peer) if !have_block => {
                self.notify(Notification::GetProposalBlock {
                    block_hash,
                    peer: Some(peer),
                });
            }
            Some(_) => {}
        }
    }

    fn add_proposal_block(&mut self, peer: Option<PeerId>, block: Block) {
        let Some(rs) = self.rs.as_mut() else { return };
        if rs.proposal_block.is_some() {
            return;
        }
        let Some(expected) = rs.proposal_block_hash else {
            debug!("proposal block before hash is known; dropping");
            return;
        };
        let hash = calc_block_hash(&block.header);
        if hash != expected {
            debug!("proposal block hash {hash:?} does not match expected {expected:?}");
            return;
        }

        debug!("stored proposal block {hash:?} at h={} r={}", rs.height, rs.round);
        rs.proposal_block = Some(block.clone());

        let (height, round, step) = (rs.height, rs.round, rs.step);
        if rs
            .votes
            .prevotes(round)
            .and_then(|s| s.two_thirds_majority())
            == Some(hash)
            && rs.valid_round.map(|v| v < round).unwrap_or(true)
        {
            rs.valid_round = Some(round);
            rs.valid_block = rs.proposal_block.clone();
        }
        let complete = Self::is_proposal_complete(rs);
        let precommit_majority = rs
            .votes
            .precommits(round)
            .map(|s| s.has_two_thirds_majority())
            .unwrap_or(false);

        if peer.is_none() {
            self.notify(Notification::Broadcast(Box::new(
                ConsensusMessage::ProposalBlock(block),
            )));
        }

        if step <= Step::Propose && complete {
            self.enter_prevote(height, round);
            if precommit_majority {
                self.enter_precommit(height, round);
            }
        } else if step == Step::Commit {
            self.try_finalize_commit(height);
        }
    }

    fn try_add_vote(&mut self, peer: Option<PeerId>, vote: Vote) {
        let Some(rs) = self.rs.as_mut() else { return };
        if vote.height != rs.height {
            debug!("vote for height {} ignored at height {}", vote.height, rs.height);
            return;
        }

        let our_index = rs
            .validators
            .index_by_address(&self.signer.address())
            .map(|i| i as u32);
        let vote_round = vote.round;
        let vote_kind = vote.kind;
        let vote_index = vote.validator_index;
        let had_majority = match vote_kind {
            VoteType::Prevote => rs
                .votes
                .prevotes(vote_round)
                .map(|s| s.has_two_thirds_majority())
                .unwrap_or(false),
            VoteType::Precommit => rs
                .votes
                .precommits(vote_round)
                .map(|s| s.has_two_thirds_majority())
                .unwrap_or(false),
            VoteType::Proposal => false,
        };

        match rs.votes.add_vote(vote, peer.as_ref()) {
            Ok(true) => {}
            Ok(false) => return, // duplicate
            Err(VoteSetError::ConflictingVotes {
                existing,
                conflicting,
            }) => {
                if Some(vote_index) == our_index {
                    warn!("conflicting vote signed by ourselves; suppressing evidence");
                    return;
                }
                let validators = rs.validators.clone();
                let height = rs.height;
                match DuplicateVoteEvidence::new(*existing, *conflicting) {
                    Ok(ev) => match self.evidence.add_evidence(&ev, &validators, height) {
                        Ok(true) => {
                            info!(
                                "stored duplicate-vote evidence against index {vote_index} at h={height} r={vote_round}"
                            );
                        }
                        Ok(false) => {}
                        Err(e) => warn!("evidence rejected: {e}"),
                    },
                    Err(e) => warn!("conflicting votes did not form evidence: {e}"),
                }
                return;
            }
            Err(VoteSetError::GotVoteFromUnwantedRound(r)) => {
                debug!("peer {peer:?} pushed vote for unwanted round {r}");
                return;
            }
            Err(e) => {
                warn!("rejected vote from {peer:?}: {e}");
                return;
            }
        }

        let height = rs.height;
        self.notify(Notification::HasVote {
            height,
            round: vote_round,
            kind: vote_kind,
            index: vote_index,
        });

        match vote_kind {
            VoteType::Prevote => self.on_prevote_added(vote_round, had_majority),
            VoteType::Precommit => self.on_precommit_added(vote_round, had_majority),
            VoteType::Proposal => unreachable!("proposal ballots are never tallied"),
        }
    }

    /// Prevote bookkeeping after a successful add at `vote_round`.
    fn on_prevote_added(&mut self, vote_round: u32, had_majority: bool) {
        let (height, current_round, majority) = {
            let rs = self.rs.as_ref().expect("checked by caller");
            (
                rs.height,
                rs.round,
                rs.votes
                    .prevotes(vote_round)
                    .and_then(|s| s.two_thirds_majority()),
            )
        };

        if let Some(maj23) = majority {
            if !had_majority {
                // A polka just formed at vote_round; announce it so peers
                // can answer with the votes we are missing.
                self.notify(Notification::Broadcast(Box::new(
                    ConsensusMessage::VoteSetMaj23 {
                        height,
                        round: vote_round,
                        kind: VoteType::Prevote,
                        block_hash: maj23,
                    },
                )));

                let mut new_valid = false;
                {
                    let rs = self.rs.as_mut().expect("checked by caller");
                    let locked_hash =
                        rs.locked_block.as_ref().map(|b| calc_block_hash(&b.header));
                    let unlock = match (locked_hash, rs.locked_round) {
                        (Some(hash), Some(locked_round)) => {
                            locked_round < vote_round
                                && vote_round <= current_round
                                && hash != maj23
                        }
                        _ => false,
                    };
                    if unlock {
                        info!("unlocking at h={height} r={vote_round}: polka for {maj23:?}");
                        rs.locked_round = None;
                        rs.locked_block = None;
                    }

                    if !maj23.is_zero()
                        && rs.valid_round.map(|v| v < vote_round).unwrap_or(true)
                        && vote_round == current_round
                    {
                        if rs.proposal_block_hash == Some(maj23) {
                            rs.valid_round = Some(vote_round);
                            rs.valid_block = rs.proposal_block.clone();
                        } else {
                            debug!("polka for a block we don't hold; refetching {maj23:?}");
                            rs.proposal_block = None;
                            rs.proposal_block_hash = Some(maj23);
                        }
                        new_valid = true;
                    }
                }
                if new_valid {
                    self.notify(Notification::NewValidBlock {
                        height,
                        round: vote_round,
                        block_hash: maj23,
                        is_commit: false,
                    });
                }
            }
        }

        let rs = self.rs.as_ref().expect("checked by caller");
        let has_any = rs
            .votes
            .prevotes(vote_round)
            .map(|s| s.has_two_thirds_any())
            .unwrap_or(false);
        let step = rs.step;
        let complete = Self::is_proposal_complete(rs);
        let pol_matches = rs
            .proposal
            .as_ref()
            .map(|p| p.pol_round == Some(vote_round))
            .unwrap_or(false);

        if current_round < vote_round && has_any {
            self.enter_new_round(height, vote_round);
        } else if current_round == vote_round && step >= Step::Prevote {
            if let Some(maj23) = majority {
                if complete || maj23.is_zero() {
                    self.enter_precommit(height, vote_round);
                } else if has_any {
                    self.enter_prevote_wait(height, vote_round);
                }
            } else if has_any {
                self.enter_prevote_wait(height, vote_round);
            }
        } else if pol_matches && complete {
            // The proposal's proof-of-lock completed; re-evaluate Propose.
            self.enter_prevote(height, current_round);
        }
    }

    /// Precommit bookkeeping after a successful add at `vote_round`.
    fn on_precommit_added(&mut self, vote_round: u32, had_majority: bool) {
        let rs = self.rs.as_ref().expect("checked by caller");
        let height = rs.height;
        let majority = rs
            .votes
            .precommits(vote_round)
            .and_then(|s| s.two_thirds_majority());
        let has_any = rs
            .votes
            .precommits(vote_round)
            .map(|s| s.has_two_thirds_any())
            .unwrap_or(false);

        if let Some(maj23) = majority {
            if !had_majority {
                self.notify(Notification::Broadcast(Box::new(
                    ConsensusMessage::VoteSetMaj23 {
                        height,
                        round: vote_round,
                        kind: VoteType::Precommit,
                        block_hash: maj23,
                    },
                )));
            }
            self.enter_new_round(height, vote_round);
            self.enter_precommit(height, vote_round);
            if !maj23.is_zero() {
                self.enter_commit(height, vote_round);
                // With skip_timeout_commit the next height starts the moment
                // the pipeline reports the new head.
            } else {
                self.enter_precommit_wait(height, vote_round);
            }
        } else if has_any {
            self.enter_new_round(height, vote_round);
            self.enter_precommit_wait(height, vote_round);
        }
    }

    // ── Transitions ─────────────────────────────────────────────────────

    fn enter_new_round(&mut self, height: u64, round: u32) {
        {
            let Some(rs) = self.rs.as_mut() else { return };
            if rs.height != height
                || round < rs.round
                || (round == rs.round && rs.step != Step::NewHeight)
            {
                return;
            }
            info!("entering new round h={height} r={round}");
            if round > rs.round {
                let mut advanced = (*rs.validators).clone();
                advanced.increment_proposer_priority(round - rs.round);
                rs.validators = Arc::new(advanced);
            }
            rs.round = round;
            rs.step = Step::NewRound;
            if round > 0 {
                rs.proposal = None;
                rs.proposal_block = None;
                rs.proposal_block_hash = None;
            }
            rs.votes.set_round(round);
            rs.triggered_timeout_precommit = false;
        }
        self.notify_new_round_step();

        let wait_for_txs = round == 0
            && self.config.create_empty_blocks_interval_ms > 0
            && !self.pipeline.has_pending_transactions();
        if wait_for_txs {
            self.schedule(
                Duration::from_millis(self.config.create_empty_blocks_interval_ms),
                height,
                round,
                Step::NewRound,
            );
        } else {
            self.enter_propose(height, round);
        }
    }

    fn enter_propose(&mut self, height: u64, round: u32) {
        if !self.transition_allowed(height, round, Step::Propose) {
            return;
        }
        {
            let rs = self.rs.as_mut().expect("guard passed");
            rs.step = Step::Propose;
        }
        self.notify_new_round_step();
        self.schedule(
            Duration::from_millis(self.config.propose_timeout_ms(round)),
            height,
            round,
            Step::Propose,
        );

        let we_propose = {
            let rs = self.rs.as_ref().expect("guard passed");
            rs.validators.proposer().address == self.signer.address()
        };
        if we_propose {
            info!("we are the proposer for h={height} r={round}");
            self.decide_proposal(height, round);
        }
    }

    /// Build (or reuse) the block to propose and feed the signed proposal
    /// plus block through our own input queue, so self-proposals take the
    /// same path as everything from the wire.
    fn decide_proposal(&mut self, height: u64, round: u32) {
        let rs = self.rs.as_ref().expect("caller checked");
        if let Some(block) = rs.valid_block.clone() {
            // A block already earned a polka; re-propose it.
            let pol_round = rs.valid_round;
            let hash = calc_block_hash(&block.header);
            let proposal = Proposal::signed(
                self.config.chain_id,
                height,
                round,
                pol_round,
                hash,
                now_ms(),
                self.signer.as_ref(),
            );
            let mut block = block;
            match ExtraData::from_header(&block.header) {
                Ok(old_seal) => {
                    ExtraData::new_proposal(round, pol_round, old_seal.evidence, proposal.clone())
                        .seal_into(&mut block.header);
                }
                Err(e) => warn!("re-proposed block has no decodable seal: {e}"),
            }
            self.queue.push(Event::Message {
                peer: None,
                msg: ConsensusMessage::Proposal(proposal),
            });
            self.queue.push(Event::Message {
                peer: None,
                msg: ConsensusMessage::ProposalBlock(block),
            });
            return;
        }

        // Ask the worker for a fresh pending block off the loop, then feed
        // the results back through the queue.
        let parent_hash = rs.parent_hash;
        let chain_id = self.config.chain_id;
        let evidence = match self.evidence.pending_evidence(self.config.max_evidence_bytes) {
            Ok(list) => list,
            Err(e) => {
                warn!("failed to read pending evidence: {e}");
                Vec::new()
            }
        };
        let pipeline = self.pipeline.clone();
        let signer = self.signer.clone();
        let queue = self.queue.clone();
        tokio::spawn(async move {
            match pipeline.build_pending_block(parent_hash).await {
                Ok(mut block) => {
                    let hash = calc_block_hash_with(&block.header, &evidence);
                    let proposal = Proposal::signed(
                        chain_id,
                        height,
                        round,
                        None,
                        hash,
                        now_ms(),
                        signer.as_ref(),
                    );
                    ExtraData::new_proposal(round, None, evidence, proposal.clone())
                        .seal_into(&mut block.header);
                    queue.push(Event::Message {
                        peer: None,
                        msg: ConsensusMessage::Proposal(proposal),
                    });
                    queue.push(Event::Message {
                        peer: None,
                        msg: ConsensusMessage::ProposalBlock(block),
                    });
                }
                Err(e) => warn!("pending block build failed for h={height} r={round}: {e}"),
            }
        });
    }

    fn enter_prevote(&mut self, height: u64, round: u32) {
        if !self.transition_allowed(height, round, Step::Prevote) {
            return;
        }
        {
            let rs = self.rs.as_mut().expect("guard passed");
            rs.step = Step::Prevote;
        }
        self.notify_new_round_step();

        let rs = self.rs.as_ref().expect("guard passed");
        let vote_hash = if let Some(locked) = &rs.locked_block {
            calc_block_hash(&locked.header)
        } else if let Some(block) = &rs.proposal_block {
            if self.validate_proposal_block(rs, block) {
                calc_block_hash(&block.header)
            } else {
                info!("proposal block invalid; prevoting nil at h={height} r={round}");
                H256::zero()
            }
        } else {
            H256::zero()
        };
        self.sign_and_add_vote(VoteType::Prevote, vote_hash, now_ms());
    }

    fn enter_prevote_wait(&mut self, height: u64, round: u32) {
        if !self.transition_allowed(height, round, Step::PrevoteWait) {
            return;
        }
        {
            let rs = self.rs.as_mut().expect("guard passed");
            let has_any = rs
                .votes
                .prevotes(round)
                .map(|s| s.has_two_thirds_any())
                .unwrap_or(false);
            if !has_any {
                error!("enter_prevote_wait without 2/3 prevotes at h={height} r={round}");
                return;
            }
            rs.step = Step::PrevoteWait;
        }
        self.notify_new_round_step();
        self.schedule(
            Duration::from_millis(self.config.prevote_timeout_ms(round)),
            height,
            round,
            Step::PrevoteWait,
        );
    }

    fn enter_precommit(&mut self, height: u64, round: u32) {
        if !self.transition_allowed(height, round, Step::Precommit) {
            return;
        }

        // Work out lock movement and the vote before mutating.
        enum Action {
            Nil,
            NilUnlock,
            RelockSame(H256, u64),
            LockProposal(H256, u64),
            NilSwitchTarget(H256),
        }
        let action = {
            let rs = self.rs.as_ref().expect("guard passed");
            let majority = rs
                .votes
                .prevotes(round)
                .and_then(|s| s.two_thirds_majority());
            match majority {
                None => Action::Nil,
                Some(maj23) if maj23.is_zero() => Action::NilUnlock,
                Some(maj23) => {
                    let pol_ok = rs
                        .votes
                        .pol_info()
                        .map(|(pol_round, _)| pol_round >= round)
                        .unwrap_or(false);
                    if !pol_ok {
                        // Should be impossible while prevotes(round) holds a
                        // non-nil majority; recover instead of halting.
                        error!(
                            "proof-of-lock behind precommit round at h={height} r={round}; precommitting nil"
                        );
                        Action::Nil
                    } else if rs
                        .locked_block
                        .as_ref()
                        .map(|b| calc_block_hash(&b.header) == maj23)
                        .unwrap_or(false)
                    {
                        let ts = rs
                            .locked_block
                            .as_ref()
                            .and_then(|b| block_proposal_timestamp(b))
                            .unwrap_or_else(now_ms);
                        Action::RelockSame(maj23, ts)
                    } else if rs
                        .proposal_block
                        .as_ref()
                        .map(|b| calc_block_hash(&b.header) == maj23)
                        .unwrap_or(false)
                    {
                        let block = rs.proposal_block.as_ref().expect("hash matched");
                        if self.validate_proposal_block(rs, block) {
                            let ts = block_proposal_timestamp(block).unwrap_or_else(now_ms);
                            Action::LockProposal(maj23, ts)
                        } else {
                            error!(
                                "polka for an invalid block at h={height} r={round}; precommitting nil"
                            );
                            Action::Nil
                        }
                    } else {
                        Action::NilSwitchTarget(maj23)
                    }
                }
            }
        };

        {
            let rs = self.rs.as_mut().expect("guard passed");
            rs.step = Step::Precommit;
        }
        self.notify_new_round_step();

        let (vote_hash, vote_ts) = {
            let rs = self.rs.as_mut().expect("guard passed");
            match action {
                Action::Nil => (H256::zero(), now_ms()),
                Action::NilUnlock => {
                    rs.locked_round = None;
                    rs.locked_block = None;
                    (H256::zero(), now_ms())
                }
                Action::RelockSame(hash, ts) => {
                    rs.locked_round = Some(round);
                    (hash, ts)
                }
                Action::LockProposal(hash, ts) => {
                    info!("locking on {hash:?} at h={height} r={round}");
                    rs.locked_round = Some(round);
                    rs.locked_block = rs.proposal_block.clone();
                    (hash, ts)
                }
                Action::NilSwitchTarget(hash) => {
                    rs.locked_round = None;
                    rs.locked_block = None;
                    rs.proposal_block = None;
                    rs.proposal_block_hash = Some(hash);
                    (H256::zero(), now_ms())
                }
            }
        };
        self.sign_and_add_vote(VoteType::Precommit, vote_hash, vote_ts);
    }

    fn enter_precommit_wait(&mut self, height: u64, round: u32) {
        {
            let Some(rs) = self.rs.as_mut() else { return };
            if rs.height != height || round != rs.round || rs.triggered_timeout_precommit {
                return;
            }
            let has_any = rs
                .votes
                .precommits(round)
                .map(|s| s.has_two_thirds_any())
                .unwrap_or(false);
            if !has_any {
                error!("enter_precommit_wait without 2/3 precommits at h={height} r={round}");
                return;
            }
            rs.triggered_timeout_precommit = true;
        }
        self.schedule(
            Duration::from_millis(self.config.precommit_timeout_ms(round)),
            height,
            round,
            Step::PrecommitWait,
        );
    }

    fn enter_commit(&mut self, height: u64, commit_round: u32) {
        let mut fetch: Option<H256> = None;
        let decided: H256;
        {
            let Some(rs) = self.rs.as_mut() else { return };
            if rs.height != height || rs.step == Step::Commit {
                return;
            }
            let Some(maj23) = rs
                .votes
                .precommits(commit_round)
                .and_then(|s| s.two_thirds_majority())
                .filter(|h| !h.is_zero())
            else {
                error!("enter_commit without a decided block at h={height} r={commit_round}");
                return;
            };
            decided = maj23;
            info!("entering commit for {maj23:?} at h={height} r={commit_round}");
            rs.step = Step::Commit;
            rs.commit_round = Some(commit_round);
            rs.commit_time = Some(Instant::now());

            let locked_matches = rs
                .locked_block
                .as_ref()
                .map(|b| calc_block_hash(&b.header) == maj23)
                .unwrap_or(false);
            if locked_matches {
                rs.proposal_block = rs.locked_block.clone();
                rs.proposal_block_hash = Some(maj23);
            } else {
                let have = rs
                    .proposal_block
                    .as_ref()
                    .map(|b| calc_block_hash(&b.header) == maj23)
                    .unwrap_or(false);
                if !have {
                    rs.proposal_block = None;
                    rs.proposal_block_hash = Some(maj23);
                    fetch = Some(maj23);
                }
            }
        }
        self.notify_new_round_step();
        self.notify(Notification::NewValidBlock {
            height,
            round: commit_round,
            block_hash: decided,
            is_commit: true,
        });
        if let Some(block_hash) = fetch {
            self.notify(Notification::GetProposalBlock {
                block_hash,
                peer: None,
            });
        }
        self.try_finalize_commit(height);
    }

    fn try_finalize_commit(&mut self, height: u64) {
        let Some(rs) = self.rs.as_ref() else { return };
        if rs.height != height || rs.step != Step::Commit {
            return;
        }
        let Some(commit_round) = rs.commit_round else { return };
        let Some(maj23) = rs
            .votes
            .precommits(commit_round)
            .and_then(|s| s.two_thirds_majority())
            .filter(|h| !h.is_zero())
        else {
            return;
        };
        let Some(block) = rs.proposal_block.as_ref() else {
            debug!("decided but still waiting for block {maj23:?}");
            return;
        };
        if calc_block_hash(&block.header) != maj23 {
            debug!("held block does not match the decision; waiting");
            return;
        }
        let seal = match ExtraData::from_header(&block.header) {
            Ok(seal) => seal,
            Err(e) => {
                error!("decided block has no decodable seal: {e}");
                return;
            }
        };
        let Some((bitmap, signatures)) = rs
            .votes
            .precommits(commit_round)
            .and_then(|s| s.make_commit())
        else {
            error!("decided without a commit aggregate at h={height} r={commit_round}");
            return;
        };

        let mut decided_block = block.clone();
        seal.with_commit(commit_round, bitmap, signatures)
            .seal_into(&mut decided_block.header);
        info!(
            "finalizing {maj23:?} at h={height} r={commit_round} ({} txs, {} evidence)",
            decided_block.transactions.len(),
            seal.evidence.len()
        );
        // Applied by the loop right after this event; the pipeline re-enters
        // the machine at the next height via `new_block_header`.
        self.pending_commit = Some(decided_block);
    }

    // ── Helpers ─────────────────────────────────────────────────────────

    fn transition_allowed(&self, height: u64, round: u32, target: Step) -> bool {
        match self.rs.as_ref() {
            Some(rs) => {
                rs.height == height
                    && round >= rs.round
                    && !(round == rs.round && rs.step >= target)
            }
            None => false,
        }
    }

    fn is_proposal_complete(rs: &RoundState) -> bool {
        let Some(proposal) = rs.proposal.as_ref() else {
            return false;
        };
        if rs.proposal_block.is_none() {
            return false;
        }
        match proposal.pol_round {
            None => true,
            Some(pol_round) => rs
                .votes
                .prevotes(pol_round)
                .map(|s| s.has_two_thirds_majority())
                .unwrap_or(false),
        }
    }

    /// Structural validation of a proposed block: linkage, well-formed
    /// transactions, a decodable seal whose proposal matches the block, and
    /// acceptable evidence. Execution-level validity is the pipeline's
    /// concern at commit time.
    fn validate_proposal_block(&self, rs: &RoundState, block: &Block) -> bool {
        if block.header.number != rs.height {
            debug!(
                "block number {} does not match height {}",
                block.header.number, rs.height
            );
            return false;
        }
        if block.header.parent_hash != rs.parent_hash {
            debug!("block parent {:?} does not match {:?}", block.header.parent_hash, rs.parent_hash);
            return false;
        }
        if let Err(i) = block.check_transactions() {
            debug!("transaction {i} is not well-formed RLP");
            return false;
        }
        let seal = match ExtraData::from_header(&block.header) {
            Ok(seal) => seal,
            Err(e) => {
                debug!("proposal block seal undecodable: {e}");
                return false;
            }
        };
        if seal.proposal.block_hash != calc_block_hash(&block.header) {
            debug!("embedded proposal does not match block identity");
            return false;
        }
        let current_height = rs.height;
        let current_validators = rs.validators.clone();
        let resolve = |h: u64| -> Option<Arc<ValidatorSet>> {
            if h == current_height {
                return Some(current_validators.clone());
            }
            let root = self.roots_by_height.get(&h)?;
            if let Some(cached) = self.vset_cache.peek(root) {
                return Some(cached.clone());
            }
            // Cold path: ask the staking reader directly.
            self.pipeline.validator_set(*root).ok().map(Arc::new)
        };
        if let Err(e) = self
            .evidence
            .check_evidence(&seal.evidence, current_height, &resolve)
        {
            debug!("proposal block evidence rejected: {e}");
            return false;
        }
        true
    }

    fn sign_and_add_vote(&mut self, kind: VoteType, block_hash: H256, timestamp: u64) {
        let vote = {
            let Some(rs) = self.rs.as_ref() else { return };
            let Some(index) = rs.validators.index_by_address(&self.signer.address()) else {
                debug!("not in the validator set; observing only");
                return;
            };
            Vote::signed(
                self.config.chain_id,
                kind,
                rs.height,
                rs.round,
                block_hash,
                timestamp,
                index as u32,
                self.signer.as_ref(),
            )
        };
        debug!("signed {vote}");
        self.notify(Notification::Broadcast(Box::new(ConsensusMessage::Vote(
            vote.clone(),
        ))));
        self.try_add_vote(None, vote);
    }

    fn schedule(&self, duration: Duration, height: u64, round: u32, step: Step) {
        self.ticker.schedule(TimeoutInfo {
            duration,
            height,
            round,
            step,
        });
    }

    fn notify(&self, notification: Notification) {
        let _ = self.notifications.send(notification);
    }

    fn notify_new_round_step(&self) {
        let Some(rs) = self.rs.as_ref() else { return };
        let seconds = Instant::now()
            .saturating_duration_since(rs.start_time)
            .as_secs();
        let _ = self.notifications.send(Notification::NewRoundStep {
            height: rs.height,
            round: rs.round,
            step: rs.step,
            seconds_since_start_time: seconds,
            last_commit_round: self.last_commit_round,
        });
    }
}

/// The proposal timestamp embedded in a block's seal; non-nil precommits
/// are signed with it so commit aggregates stay verifiable.
fn block_proposal_timestamp(block: &Block) -> Option<u64> {
    ExtraData::from_header(&block.header)
        .ok()
        .map(|seal| seal.proposal.timestamp)
}

/// Milliseconds since the Unix epoch.
fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ── Tests ───────────────────────────────────────────────────────────────────
