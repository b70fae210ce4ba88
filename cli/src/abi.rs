//! Just enough ABI decoding for the two contract events the relay watches.
//!
//! Event data is a sequence of 32-byte head words; dynamic values (strings)
//! store an offset in their head word pointing at `len ‖ bytes`.

use thiserror::Error;
use tiny_keccak::{Hasher, Keccak};

const WORD: usize = 32;

#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("data too short: need {need} bytes, have {have}")]
    Short { need: usize, have: usize },
    #[error("value in word {index} does not fit in 64 bits")]
    Overflow { index: usize },
    #[error("string at word {index} is not valid UTF-8")]
    Utf8 { index: usize },
}

pub fn keccak256(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    let mut out = [0u8; 32];
    hasher.update(bytes);
    hasher.finalize(&mut out);
    out
}

/// `topics[0]` of an event: keccak256 of its canonical signature, 0x-hex.
pub fn event_topic(signature: &str) -> String {
    format!("0x{}", hex::encode(keccak256(signature.as_bytes())))
}

/// The non-indexed part of a log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbiData(Vec<u8>);

impl AbiData {
    /// Accepts `0x`-prefixed or bare hex.
    pub fn from_hex(data: &str) -> Result<Self, DecodeError> {
        let data = data.strip_prefix("0x").unwrap_or(data);
        Ok(Self(hex::decode(data)?))
    }

    fn slice(&self, start: usize, len: usize) -> Result<&[u8], DecodeError> {
        let end = start.saturating_add(len);
        self.0.get(start..end).ok_or(DecodeError::Short {
            need: end,
            have: self.0.len(),
        })
    }

    fn word(&self, index: usize) -> Result<&[u8], DecodeError> {
        self.slice(index.saturating_mul(WORD), WORD)
    }

    fn u64_at(&self, offset: usize, index: usize) -> Result<u64, DecodeError> {
        let word = self.slice(offset, WORD)?;
        let (high, low) = word.split_at(WORD - 8);
        if high.iter().any(|b| *b != 0) {
            return Err(DecodeError::Overflow { index });
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(low);
        Ok(u64::from_be_bytes(buf))
    }

    /// `uint256` head word that must fit in a `u64`.
    pub fn uint(&self, index: usize) -> Result<u64, DecodeError> {
        self.u64_at(index.saturating_mul(WORD), index)
    }

    /// `address` head word as lowercase 0x-hex.
    pub fn address(&self, index: usize) -> Result<String, DecodeError> {
        let word = self.word(index)?;
        Ok(format!("0x{}", hex::encode(&word[WORD - 20..])))
    }

    /// `string` whose offset lives in head word `index`.
    pub fn string(&self, index: usize) -> Result<String, DecodeError> {
        let offset = to_usize(self.uint(index)?, index)?;
        let len = to_usize(self.u64_at(offset, index)?, index)?;
        let bytes = self.slice(offset.saturating_add(WORD), len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::Utf8 { index })
    }
}

fn to_usize(value: u64, index: usize) -> Result<usize, DecodeError> {
    usize::try_from(value).map_err(|_| DecodeError::Overflow { index })
}
