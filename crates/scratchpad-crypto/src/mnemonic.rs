//! Human-auditable fingerprint of a symmetric key
//!
//! The raw key is read as a big-endian bitstream (bit 0 = MSB of byte 0) and
//! cut into 26 consecutive 10-bit groups; each group indexes a 1024-word
//! dictionary (the first 1024 words of the BIP-39 English list).
//!
//! 26 × 10 = 260 bits, so for a 256-bit key the last group reads four bits
//! past the end of the key. Those positions are read as zero. The same rule
//! applies to any shorter input, which keeps the encoding deterministic on
//! both devices.
//!
//! The fingerprint is for out-of-band comparison only and is never used in a
//! security decision.

use bip39::Language;

use crate::keys::SymmetricKey;

/// Number of words in a fingerprint
pub const WORD_COUNT: usize = 26;

/// Bits consumed per word
pub const BITS_PER_WORD: usize = 10;

/// Dictionary size (2^BITS_PER_WORD)
pub const DICTIONARY_SIZE: usize = 1 << BITS_PER_WORD;

/// Fingerprint words for a symmetric key.
pub fn encode_key(key: &SymmetricKey) -> Vec<&'static str> {
    encode_raw(key.as_bytes())
}

/// Fingerprint words for arbitrary raw key material.
pub fn encode_raw(raw: &[u8]) -> Vec<&'static str> {
    let dictionary = Language::English.word_list();

    (0..WORD_COUNT)
        .map(|word| {
            let index = (0..BITS_PER_WORD).fold(0usize, |acc, i| {
                (acc << 1) | usize::from(bit_at(raw, word * BITS_PER_WORD + i))
            });
            dictionary[index]
        })
        .collect()
}

/// Bit `pos` of `raw`, MSB-first; zero past the end.
fn bit_at(raw: &[u8], pos: usize) -> u8 {
    raw.get(pos / 8)
        .map(|byte| (byte >> (7 - pos % 8)) & 1)
        .unwrap_or(0)
}
