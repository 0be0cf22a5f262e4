//! Module health records.

use serde::Serialize;

/// Health of one logical sub-module (meter, weigh cell, flow meter).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ModuleStatus {
    pub error: bool,
    pub status_word: u16,
}

impl ModuleStatus {
    /// Size of a status record in the block.
    pub const LEN: usize = 4;

    /// Decode a record: low bit of byte 0 is the error flag, bytes 2-3 the
    /// big-endian status word. Byte 1 is unused.
    pub fn decode(slot: &[u8]) -> Option<Self> {
        if slot.len() < Self::LEN {
            return None;
        }
        Some(Self {
            error: slot[0] & 0x01 != 0,
            status_word: u16::from_be_bytes([slot[2], slot[3]]),
        })
    }

    pub fn encode(&self) -> [u8; 4] {
        let word = self.status_word.to_be_bytes();
        [self.error as u8, 0, word[0], word[1]]
    }
}
