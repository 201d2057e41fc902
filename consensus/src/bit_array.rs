//! Fixed-width bit array used for vote bitmaps.
//!
//! Keyed by validator index: bit `i` set means "validator `i` contributed".
//! Travels over the wire inside `ProposalPOL`, `VoteSetBits`, and the commit
//! seal, so it carries a canonical RLP form: `[num_bits, packed_words]`.

use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};

const WORD_BITS: usize = 64;

/// A fixed-length array of bits backed by 64-bit words.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitArray {
    bits: usize,
    words: Vec<u64>,
}

impl BitArray {
    /// A cleared array of `bits` bits.
    pub fn new(bits: usize) -> Self {
        Self {
            bits,
            words: vec![0; bits.div_ceil(WORD_BITS)],
        }
    }

    /// Number of bits (set or not).
    pub fn len(&self) -> usize {
        self.bits
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    /// Read bit `i`; out-of-range reads are false.
    pub fn get(&self, i: usize) -> bool {
        if i >= self.bits {
            return false;
        }
        self.words[i / WORD_BITS] & (1u64 << (i % WORD_BITS)) != 0
    }

    /// Write bit `i`; out-of-range writes are ignored.
    pub fn set(&mut self, i: usize, value: bool) {
        if i >= self.bits {
            return;
        }
        let mask = 1u64 << (i % WORD_BITS);
        if value {
            self.words[i / WORD_BITS] |= mask;
        } else {
            self.words[i / WORD_BITS] &= !mask;
        }
    }

    /// Number of set bits.
    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// True when every bit is set.
    pub fn is_full(&self) -> bool {
        self.count_ones() == self.bits
    }

    /// Indices of set bits, ascending.
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.bits).filter(|&i| self.get(i))
    }

    /// Bits set in `self` but not in `other` (sizes may differ; the result
    /// keeps `self`'s width).
    pub fn sub(&self, other: &BitArray) -> BitArray {
        let mut out = self.clone();
        for (i, word) in out.words.iter_mut().enumerate() {
            if let Some(o) = other.words.get(i) {
                *word &= !o;
            }
        }
        out.mask_tail();
        out
    }

    /// Union with `other`, keeping `self`'s width.
    pub fn or(&self, other: &BitArray) -> BitArray {
        let mut out = self.clone();
        for (i, word) in out.words.iter_mut().enumerate() {
            if let Some(o) = other.words.get(i) {
                *word |= o;
            }
        }
        out.mask_tail();
        out
    }

    /// First set bit, if any.
    pub fn first_one(&self) -> Option<usize> {
        self.iter_ones().next()
    }

    fn mask_tail(&mut self) {
        let tail = self.bits % WORD_BITS;
        if tail != 0 {
            if let Some(last) = self.words.last_mut() {
                *last &= (1u64 << tail) - 1;
            }
        }
    }
}

impl Encodable for BitArray {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(2);
        s.append(&(self.bits as u64));
        s.begin_list(self.words.len());
        for w in &self.words {
            s.append(w);
        }
    }
}

impl Decodable for BitArray {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        if rlp.item_count()? != 2 {
            return Err(DecoderError::RlpIncorrectListLen);
        }
        let bits = rlp.val_at::<u64>(0)? as usize;
        let words_rlp = rlp.at(1)?;
        let mut words = Vec::with_capacity(words_rlp.item_count()?);
        for i in 0..words_rlp.item_count()? {
            words.push(words_rlp.val_at(i)?);
        }
        if words.len() != bits.div_ceil(WORD_BITS) {
            return Err(DecoderError::Custom("bit array word count mismatch"));
        }
        let mut out = Self { bits, words };
        out.mask_tail();
        Ok(out)
    }
}

impl std::fmt::Display for BitArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for i in 0..self.bits {
            write!(f, "{}", if self.get(i) { 'x' } else { '_' })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get() {
        let mut ba = BitArray::new(100);
        assert!(!ba.get(63));
        ba.set(63, true);
        ba.set(64, true);
        ba.set(99, true);
        assert!(ba.get(63));
        assert!(ba.get(64));
        assert!(ba.get(99));
        assert_eq!(ba.count_ones(), 3);
        ba.set(63, false);
        assert!(!ba.get(63));
    }

    #[test]
    fn test_out_of_range_ignored() {
        let mut ba = BitArray::new(10);
        ba.set(10, true);
        ba.set(1000, true);
        assert_eq!(ba.count_ones(), 0);
        assert!(!ba.get(1000));
    }

    #[test]
    fn test_sub() {
        let mut a = BitArray::new(8);
        let mut b = BitArray::new(8);
        a.set(1, true);
        a.set(2, true);
        a.set(3, true);
        b.set(2, true);
        let d = a.sub(&b);
        assert_eq!(d.iter_ones().collect::<Vec<_>>(), vec![1, 3]);
    }

    #[test]
    fn test_or_and_full() {
        let mut a = BitArray::new(4);
        let mut b = BitArray::new(4);
        a.set(0, true);
        a.set(1, true);
        b.set(2, true);
        b.set(3, true);
        assert!(a.or(&b).is_full());
    }

    #[test]
    fn test_first_one() {
        let mut ba = BitArray::new(70);
        assert_eq!(ba.first_one(), None);
        ba.set(65, true);
        assert_eq!(ba.first_one(), Some(65));
        ba.set(3, true);
        assert_eq!(ba.first_one(), Some(3));
    }

    #[test]
    fn test_rlp_roundtrip() {
        let mut ba = BitArray::new(130);
        ba.set(0, true);
        ba.set(64, true);
        ba.set(129, true);
        let decoded: BitArray = rlp::decode(&rlp::encode(&ba)).unwrap();
        assert_eq!(decoded, ba);
    }

    #[test]
    fn test_rlp_rejects_word_mismatch() {
        let mut s = RlpStream::new_list(2);
        s.append(&130u64);
        s.begin_list(1);
        s.append(&0u64);
        assert!(rlp::decode::<BitArray>(&s.out()).is_err());
    }
}
