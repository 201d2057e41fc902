//! The consensus reactor.
//!
//! Sits between the wire and the state machine:
//!
//! - **Inbound**: decodes `[code, payload]` frames, keeps the sender's
//!   [`PeerRoundState`] current, answers catch-up queries
//!   (`VoteSetMaj23` → `VoteSetBits`, `GetProposalBlock` → block), and
//!   forwards proposals, blocks, and votes to the state machine as
//!   `(peer, message)` events.
//! - **Outbound**: turns state-machine [`Notification`]s into broadcasts
//!   (round-step announcements, our own proposals/blocks/votes) and runs a
//!   periodic gossip sweep that sends every peer one vote it is missing.
//!
//! The reactor caches the current height's proposal, block, and votes so it
//! can serve gossip without reaching into the state machine; the cache is
//! dropped whenever the machine moves to a new height.

use {
    crate::{
        config::ReactorConfig,
        error::{ReactorError, Result},
        peer::Peer,
    },
    log::{debug, info, trace, warn},
    reimint_consensus::{
        calc_block_hash, BitArray, ConsensusMessage, Event, EventQueue, Notification, PeerId,
        Proposal, Step, Vote, VoteType,
    },
    reimint_types::{Block, H256},
    std::collections::{BTreeMap, HashMap},
    tokio::{
        sync::mpsc,
        task::JoinHandle,
        time::{interval, Duration},
    },
};

/// Commands for managing the peer set at runtime.
#[derive(Debug)]
pub enum PeerCommand {
    /// Track a peer; frames for it are queued on the given channel.
    Add(PeerId, mpsc::UnboundedSender<Vec<u8>>),
    /// Forget a peer.
    Remove(PeerId),
}

/// Everything we hold for the height currently being decided.
#[derive(Debug, Default)]
struct HeightCache {
    height: u64,
    proposal: Option<Proposal>,
    proposal_block: Option<Block>,
    proposal_block_hash: Option<H256>,
    /// (round, type) → validator index → vote.
    votes: BTreeMap<(u32, u8), HashMap<u32, Vote>>,
}

impl HeightCache {
    fn reset(&mut self, height: u64) {
        *self = Self {
            height,
            ..Default::default()
        };
    }

    fn insert_vote(&mut self, vote: Vote) {
        if vote.height != self.height {
            return;
        }
        self.votes
            .entry((vote.round, vote.kind.as_u8()))
            .or_default()
            .insert(vote.validator_index, vote);
    }

    fn bit_array_for(&self, round: u32, kind: VoteType, block_hash: H256, width: usize) -> BitArray {
        let mut bits = BitArray::new(width);
        if let Some(votes) = self.votes.get(&(round, kind.as_u8())) {
            for (index, vote) in votes {
                if vote.block_hash == block_hash {
                    bits.set(*index as usize, true);
                }
            }
        }
        bits
    }
}

/// Our own position, mirrored from state-machine notifications.
#[derive(Debug, Default, Clone)]
struct LocalState {
    height: u64,
    round: u32,
    step: Option<Step>,
    seconds_since_start_time: u64,
    last_commit_round: Option<u32>,
}

/// Handle to a running [`Reactor`].
pub struct ReactorHandle {
    inbound: mpsc::UnboundedSender<(PeerId, Vec<u8>)>,
    commands: mpsc::UnboundedSender<PeerCommand>,
    join: JoinHandle<()>,
}

impl ReactorHandle {
    /// Deliver a raw frame received from a peer.
    pub fn on_frame(&self, peer: PeerId, frame: Vec<u8>) -> Result<()> {
        self.inbound
            .send((peer, frame))
            .map_err(|_| ReactorError::ChannelClosed)
    }

    /// Track a new peer.
    pub fn add_peer(&self, peer: PeerId, outbound: mpsc::UnboundedSender<Vec<u8>>) -> Result<()> {
        self.commands
            .send(PeerCommand::Add(peer, outbound))
            .map_err(|_| ReactorError::ChannelClosed)
    }

    /// Forget a peer.
    pub fn remove_peer(&self, peer: PeerId) -> Result<()> {
        self.commands
            .send(PeerCommand::Remove(peer))
            .map_err(|_| ReactorError::ChannelClosed)
    }

    /// Stop the reactor loop.
    pub async fn shutdown(self) {
        drop(self.inbound);
        drop(self.commands);
        let _ = self.join.await;
    }
}

/// Gossips consensus data between the local state machine and its peers.
pub struct Reactor {
    config: ReactorConfig,
    /// Input queue of the state machine.
    machine: EventQueue,
    peers: HashMap<PeerId, Peer>,
    cache: HeightCache,
    local: LocalState,
    /// Validator-set width for bitmap answers, learned from traffic.
    committee_size: usize,
}

impl Reactor {
    pub fn new(config: ReactorConfig, machine: EventQueue) -> Self {
        Self {
            config,
            machine,
            peers: HashMap::new(),
            cache: HeightCache::default(),
            local: LocalState::default(),
            committee_size: 0,
        }
    }

    /// Spawn the reactor loop: consumes state-machine notifications, peer
    /// frames, peer commands, and a gossip interval.
    pub fn start(
        mut self,
        mut notifications: mpsc::UnboundedReceiver<Notification>,
    ) -> ReactorHandle {
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel::<(PeerId, Vec<u8>)>();
        let (command_tx, mut command_rx) = mpsc::unbounded_channel::<PeerCommand>();
        let gossip_every = Duration::from_millis(self.config.gossip_interval_ms);
        let join = tokio::spawn(async move {
            let mut gossip = interval(gossip_every);
            loop {
                tokio::select! {
                    notification = notifications.recv() => match notification {
                        Some(n) => self.handle_notification(n),
                        None => break,
                    },
                    frame = inbound_rx.recv() => match frame {
                        Some((peer, bytes)) => {
                            if let Err(e) = self.handle_frame(&peer, &bytes) {
                                debug!("dropping frame: {e}");
                            }
                        }
                        None => break,
                    },
                    command = command_rx.recv() => match command {
                        Some(command) => {
                            if let Err(e) = self.handle_command(command) {
                                warn!("peer command failed: {e}");
                            }
                        }
                        None => break,
                    },
                    _ = gossip.tick() => self.gossip_sweep(),
                }
            }
            info!("reactor stopped");
        });
        ReactorHandle {
            inbound: inbound_tx,
            commands: command_tx,
            join,
        }
    }

    // ── Peer management ─────────────────────────────────────────────────

    fn handle_command(&mut self, command: PeerCommand) -> Result<()> {
        match command {
            PeerCommand::Add(id, outbound) => self.add_peer(id, outbound),
            PeerCommand::Remove(id) => {
                if self.peers.remove(&id).is_some() {
                    info!("removed peer {id}");
                }
                Ok(())
            }
        }
    }

    fn add_peer(&mut self, id: PeerId, outbound: mpsc::UnboundedSender<Vec<u8>>) -> Result<()> {
        // Re-adding an id replaces the session: fresh channel, fresh state.
        if !self.peers.contains_key(&id) && self.peers.len() >= self.config.max_peers {
            return Err(ReactorError::MaxPeersReached(self.config.max_peers));
        }
        info!("tracking peer {id}");
        let peer = Peer::new(id.clone(), outbound);
        // Tell the newcomer where we are so it can gossip usefully.
        if self.local.step.is_some() {
            peer.send(self.round_step_message().encode());
        }
        self.peers.insert(id, peer);
        Ok(())
    }

    // ── Inbound ─────────────────────────────────────────────────────────

    fn handle_frame(&mut self, peer_id: &PeerId, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.config.max_message_size {
            return Err(ReactorError::Oversized {
                peer: peer_id.clone(),
                size: bytes.len(),
                max: self.config.max_message_size,
            });
        }
        let msg = ConsensusMessage::decode(bytes).map_err(|e| ReactorError::Decode {
            peer: peer_id.clone(),
            reason: e.to_string(),
        })?;
        self.handle_peer_message(peer_id, msg)
    }

    fn handle_peer_message(&mut self, peer_id: &PeerId, msg: ConsensusMessage) -> Result<()> {
        trace!("{} from {peer_id}", msg.kind());
        let peer = self
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| ReactorError::UnknownPeer(peer_id.clone()))?;

        match msg {
            ConsensusMessage::NewRoundStep {
                height,
                round,
                step,
                ..
            } => {
                peer.state.apply_new_round_step(height, round, step);
            }
            ConsensusMessage::NewValidBlock {
                height,
                round,
                ..
            } => {
                // The peer has a (potentially decided) block for that round.
                if height == peer.state.height && round >= peer.state.round {
                    peer.state.has_proposal_block = true;
                }
            }
            ConsensusMessage::HasVote {
                height,
                round,
                kind,
                index,
            } => {
                peer.state.set_has_vote(height, round, kind, index);
            }
            ConsensusMessage::ProposalPol {
                height,
                proposal_pol_round,
                proposal_pol,
            } => {
                peer.state
                    .apply_proposal_pol(height, proposal_pol_round, &proposal_pol);
            }
            ConsensusMessage::VoteSetBits {
                height,
                round,
                kind,
                votes,
                ..
            } => {
                peer.state.apply_vote_bits(height, round, kind, &votes);
            }
            ConsensusMessage::VoteSetMaj23 {
                height,
                round,
                kind,
                block_hash,
            } => {
                // Answer with the bitmap of matching votes we hold.
                if height == self.cache.height && self.committee_size > 0 {
                    let bits =
                        self.cache
                            .bit_array_for(round, kind, block_hash, self.committee_size);
                    let reply = ConsensusMessage::VoteSetBits {
                        height,
                        round,
                        kind,
                        block_hash,
                        votes: bits,
                    };
                    peer.send(reply.encode());
                }
            }
            ConsensusMessage::GetProposalBlock { block_hash } => {
                if self.cache.proposal_block_hash == Some(block_hash) {
                    if let Some(block) = self.cache.proposal_block.clone() {
                        peer.state.has_proposal_block = true;
                        peer.send(ConsensusMessage::ProposalBlock(block).encode());
                    }
                }
            }
            ConsensusMessage::Proposal(p) => {
                peer.state.has_proposal = true;
                self.cache_proposal(&p);
                self.machine.push(Event::Message {
                    peer: Some(peer_id.clone()),
                    msg: ConsensusMessage::Proposal(p),
                });
            }
            ConsensusMessage::ProposalBlock(b) => {
                peer.state.has_proposal_block = true;
                self.cache_block(&b);
                self.machine.push(Event::Message {
                    peer: Some(peer_id.clone()),
                    msg: ConsensusMessage::ProposalBlock(b),
                });
            }
            ConsensusMessage::Vote(v) => {
                peer.state
                    .set_has_vote(v.height, v.round, v.kind, v.validator_index);
                self.cache.insert_vote(v.clone());
                self.committee_size = self.committee_size.max(v.validator_index as usize + 1);
                self.machine.push(Event::Message {
                    peer: Some(peer_id.clone()),
                    msg: ConsensusMessage::Vote(v),
                });
            }
        }
        Ok(())
    }

    // ── Outbound ────────────────────────────────────────────────────────

    fn handle_notification(&mut self, n: Notification) {
        match n {
            Notification::NewRoundStep {
                height,
                round,
                step,
                seconds_since_start_time,
                last_commit_round,
            } => {
                if height != self.local.height {
                    self.cache.reset(height);
                }
                self.local = LocalState {
                    height,
                    round,
                    step: Some(step),
                    seconds_since_start_time,
                    last_commit_round,
                };
                self.broadcast(&self.round_step_message());
            }
            Notification::NewValidBlock {
                height,
                round,
                block_hash,
                is_commit,
            } => {
                self.broadcast(&ConsensusMessage::NewValidBlock {
                    height,
                    round,
                    block_hash,
                    is_commit,
                });
            }
            Notification::HasVote {
                height,
                round,
                kind,
                index,
            } => {
                self.broadcast(&ConsensusMessage::HasVote {
                    height,
                    round,
                    kind,
                    index,
                });
            }
            Notification::GetProposalBlock { block_hash, peer } => {
                let request = ConsensusMessage::GetProposalBlock { block_hash };
                match peer.and_then(|id| self.peers.get(&id)) {
                    Some(peer) => {
                        peer.send(request.encode());
                    }
                    None => self.broadcast(&request),
                }
            }
            Notification::Broadcast(msg) => {
                match msg.as_ref() {
                    ConsensusMessage::Proposal(p) => self.cache_proposal(p),
                    ConsensusMessage::ProposalBlock(b) => self.cache_block(b),
                    ConsensusMessage::Vote(v) => {
                        self.cache.insert_vote(v.clone());
                        self.committee_size =
                            self.committee_size.max(v.validator_index as usize + 1);
                    }
                    _ => {}
                }
                self.broadcast_marking(&msg);
            }
        }
    }

    fn round_step_message(&self) -> ConsensusMessage {
        ConsensusMessage::NewRoundStep {
            height: self.local.height,
            round: self.local.round,
            step: self.local.step.unwrap_or(Step::NewHeight),
            seconds_since_start_time: self.local.seconds_since_start_time,
            last_commit_round: self.local.last_commit_round,
        }
    }

    fn cache_proposal(&mut self, p: &Proposal) {
        if p.height == self.cache.height && self.cache.proposal.is_none() {
            self.cache.proposal = Some(p.clone());
            self.cache.proposal_block_hash = Some(p.block_hash);
        }
    }

    fn cache_block(&mut self, b: &Block) {
        if b.number() == self.cache.height && self.cache.proposal_block.is_none() {
            let hash = calc_block_hash(&b.header);
            if self.cache.proposal_block_hash.map_or(true, |h| h == hash) {
                self.cache.proposal_block_hash = Some(hash);
                self.cache.proposal_block = Some(b.clone());
            }
        }
    }

    /// Send to every peer, without marking anything.
    fn broadcast(&self, msg: &ConsensusMessage) {
        let frame = msg.encode();
        for peer in self.peers.values() {
            if !peer.send(frame.clone()) {
                debug!("peer {} outbound closed", peer.id);
            }
        }
    }

    /// Send to every peer, recording what they now hold.
    fn broadcast_marking(&mut self, msg: &ConsensusMessage) {
        let frame = msg.encode();
        for peer in self.peers.values_mut() {
            if !peer.send(frame.clone()) {
                continue;
            }
            match msg {
                ConsensusMessage::Proposal(_) => peer.state.has_proposal = true,
                ConsensusMessage::ProposalBlock(_) => peer.state.has_proposal_block = true,
                ConsensusMessage::Vote(v) => {
                    peer.state
                        .set_has_vote(v.height, v.round, v.kind, v.validator_index);
                }
                _ => {}
            }
        }
    }

    /// One pass over the peer set: give each peer the proposal data and at
    /// most one vote it is missing.
    fn gossip_sweep(&mut self) {
        let height = self.cache.height;
        if height == 0 {
            return;
        }
        for peer in self.peers.values_mut() {
            if peer.state.height != height {
                continue;
            }

            // Proposal and block first; votes are useless without them.
            if !peer.state.has_proposal {
                if let Some(p) = &self.cache.proposal {
                    if p.round == peer.state.round
                        && peer.send(ConsensusMessage::Proposal(p.clone()).encode())
                    {
                        peer.state.has_proposal = true;
                        // A re-proposal is justified by an earlier polka;
                        // ship the prevote bitmap that backs it.
                        if let Some(pol_round) = p.pol_round {
                            let bits = self.cache.bit_array_for(
                                pol_round,
                                VoteType::Prevote,
                                p.block_hash,
                                self.committee_size,
                            );
                            peer.send(
                                ConsensusMessage::ProposalPol {
                                    height,
                                    proposal_pol_round: pol_round,
                                    proposal_pol: bits,
                                }
                                .encode(),
                            );
                        }
                    }
                }
            }
            if peer.state.has_proposal && !peer.state.has_proposal_block {
                if let Some(b) = &self.cache.proposal_block {
                    if peer.send(ConsensusMessage::ProposalBlock(b.clone()).encode()) {
                        peer.state.has_proposal_block = true;
                    }
                }
            }

            // One missing vote per sweep, most recent rounds first.
            'votes: for ((round, kind), votes) in self.cache.votes.iter().rev() {
                if *round > peer.state.round.saturating_add(1) {
                    continue;
                }
                for (index, vote) in votes {
                    let kind = VoteType::from_u8(*kind).expect("cache holds valid kinds");
                    if !peer.state.has_vote(*round, kind, *index)
                        && peer.send(ConsensusMessage::Vote(vote.clone()).encode())
                    {
                        peer.state.set_has_vote(height, *round, kind, *index);
                        break 'votes;
                    }
                }
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
