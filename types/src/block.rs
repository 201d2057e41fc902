//! Ethereum-style block header and block body.
//!
//! The header is a plain 15-field RLP list. Transactions are carried as
//! opaque RLP payloads — executing them is the runtime's job, not ours.
//!
//! Note on hashing: Reimint defines the block hash over a *modified* header
//! (the consensus seal in `extra_data` is replaced by evidence digests), so
//! this module deliberately exposes [`Header::encode_with_extra_data`]
//! instead of a `hash()` method. The consensus crate owns the hashing rule.

use {
    crate::{Address, H256, U256},
    rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream},
};

/// Number of extra-data prefix bytes reserved for proposer vanity.
pub const EXTRA_VANITY: usize = 32;

/// An Ethereum-compatible block header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub parent_hash: H256,
    pub uncle_hash: H256,
    pub coinbase: Address,
    pub state_root: H256,
    pub transactions_root: H256,
    pub receipts_root: H256,
    pub logs_bloom: Vec<u8>,
    pub difficulty: U256,
    pub number: u64,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub timestamp: u64,
    pub extra_data: Vec<u8>,
    pub mix_digest: H256,
    pub nonce: u64,
}

impl Header {
    /// A header with every field zeroed — the base for builders and tests.
    pub fn empty() -> Self {
        Self {
            parent_hash: H256::zero(),
            uncle_hash: H256::zero(),
            coinbase: Address::zero(),
            state_root: H256::zero(),
            transactions_root: H256::zero(),
            receipts_root: H256::zero(),
            logs_bloom: vec![0u8; 256],
            difficulty: U256::zero(),
            number: 0,
            gas_limit: 0,
            gas_used: 0,
            timestamp: 0,
            extra_data: Vec::new(),
            mix_digest: H256::zero(),
            nonce: 0,
        }
    }

    /// The vanity prefix of `extra_data` (at most [`EXTRA_VANITY`] bytes).
    pub fn extra_vanity(&self) -> &[u8] {
        &self.extra_data[..self.extra_data.len().min(EXTRA_VANITY)]
    }

    /// Everything in `extra_data` after the vanity prefix.
    pub fn extra_seal(&self) -> &[u8] {
        if self.extra_data.len() <= EXTRA_VANITY {
            &[]
        } else {
            &self.extra_data[EXTRA_VANITY..]
        }
    }

    /// RLP-encode this header as if its `extra_data` were `extra`.
    ///
    /// The consensus layer hashes headers through this: the seal is swapped
    /// for the vanity plus evidence digests so that vote signatures never
    /// change a block's identity.
    pub fn encode_with_extra_data(&self, extra: &[u8]) -> Vec<u8> {
        let mut s = RlpStream::new();
        self.rlp_append_inner(&mut s, extra);
        s.out().to_vec()
    }

    fn rlp_append_inner(&self, s: &mut RlpStream, extra: &[u8]) {
        s.begin_list(15);
        s.append(&self.parent_hash);
        s.append(&self.uncle_hash);
        s.append(&self.coinbase);
        s.append(&self.state_root);
        s.append(&self.transactions_root);
        s.append(&self.receipts_root);
        s.append(&self.logs_bloom);
        s.append(&self.difficulty);
        s.append(&self.number);
        s.append(&self.gas_limit);
        s.append(&self.gas_used);
        s.append(&self.timestamp);
        s.append(&extra);
        s.append(&self.mix_digest);
        s.append(&self.nonce);
    }
}

impl Encodable for Header {
    fn rlp_append(&self, s: &mut RlpStream) {
        self.rlp_append_inner(s, &self.extra_data);
    }
}

impl Decodable for Header {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        if rlp.item_count()? != 15 {
            return Err(DecoderError::RlpIncorrectListLen);
        }
        Ok(Self {
            parent_hash: rlp.val_at(0)?,
            uncle_hash: rlp.val_at(1)?,
            coinbase: rlp.val_at(2)?,
            state_root: rlp.val_at(3)?,
            transactions_root: rlp.val_at(4)?,
            receipts_root: rlp.val_at(5)?,
            logs_bloom: rlp.val_at(6)?,
            difficulty: rlp.val_at(7)?,
            number: rlp.val_at(8)?,
            gas_limit: rlp.val_at(9)?,
            gas_used: rlp.val_at(10)?,
            timestamp: rlp.val_at(11)?,
            extra_data: rlp.val_at(12)?,
            mix_digest: rlp.val_at(13)?,
            nonce: rlp.val_at(14)?,
        })
    }
}

/// A block: header plus opaque transaction payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: Header,
    /// Raw RLP-encoded transactions. The consensus layer only checks that
    /// each payload is well-formed RLP; execution happens downstream.
    pub transactions: Vec<Vec<u8>>,
}

impl Block {
    pub fn new(header: Header, transactions: Vec<Vec<u8>>) -> Self {
        Self {
            header,
            transactions,
        }
    }

    /// Block height, straight from the header.
    pub fn number(&self) -> u64 {
        self.header.number
    }

    /// Returns `Err` with the offending index if any transaction payload is
    /// not a well-formed RLP item.
    pub fn check_transactions(&self) -> Result<(), usize> {
        for (i, tx) in self.transactions.iter().enumerate() {
            let item = Rlp::new(tx);
            if item.payload_info().is_err() {
                return Err(i);
            }
        }
        Ok(())
    }
}

impl Encodable for Block {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(2);
        s.append(&self.header);
        s.begin_list(self.transactions.len());
        for tx in &self.transactions {
            s.append_raw(tx, 1);
        }
    }
}

impl Decodable for Block {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        if rlp.item_count()? != 2 {
            return Err(DecoderError::RlpIncorrectListLen);
        }
        let header = rlp.val_at(0)?;
        let txs = rlp.at(1)?;
        let mut transactions = Vec::with_capacity(txs.item_count()?);
        for i in 0..txs.item_count()? {
            transactions.push(txs.at(i)?.as_raw().to_vec());
        }
        Ok(Self {
            header,
            transactions,
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
