//! AES-CMAC (RFC 4493) on top of the AES block engine
//!
//! The engine does not call AES itself. The scheduler asks it for the next
//! block with [`CmacEngine::next_block`], runs that block on the shared AES
//! engine and feeds the ciphertext back with [`CmacEngine::handle_aes_result`].

use super::engine::CmacOp;
use super::types::*;
use log::{debug, warn};
use std::fmt;

/// Lazily supplies the message octet at an offset
pub type MessageAccessor = Box<dyn Fn(usize) -> u8 + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmacState {
    Idle,
    CalcSubkeys,
    W4Subkeys,
    CalcMi,
    W4Mi,
    CalcMlast,
    W4Mlast,
}

pub(crate) struct CmacEngine {
    state: CmacState,
    key: [u8; 16],
    message_len: usize,
    accessor: Option<MessageAccessor>,
    block_count: usize,
    block_index: usize,
    x: [u8; 16],
    m_last: [u8; 16],
    op: Option<CmacOp>,
}

impl fmt::Debug for CmacEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CmacEngine")
            .field("state", &self.state)
            .field("message_len", &self.message_len)
            .field("block_index", &self.block_index)
            .field("op", &self.op)
            .finish()
    }
}

impl Default for CmacEngine {
    fn default() -> Self {
        Self {
            state: CmacState::Idle,
            key: [0; 16],
            message_len: 0,
            accessor: None,
            block_count: 0,
            block_index: 0,
            x: [0; 16],
            m_last: [0; 16],
            op: None,
        }
    }
}

/// Subkey generation step: shift left by one bit, conditionally XOR Rb
fn shift_left_rb(input: &[u8; 16]) -> [u8; 16] {
    let mut out = [0u8; 16];
    for i in 0..16 {
        let carry = if i < 15 { input[i + 1] >> 7 } else { 0 };
        out[i] = (input[i] << 1) | carry;
    }
    if input[0] & 0x80 != 0 {
        out[15] ^= 0x87;
    }
    out
}

impl CmacEngine {
    pub fn is_idle(&self) -> bool {
        self.state == CmacState::Idle
    }

    /// Start a CMAC over `message_len` octets supplied by `accessor`
    pub fn start(
        &mut self,
        key: [u8; 16],
        message_len: usize,
        accessor: MessageAccessor,
        op: CmacOp,
    ) -> SmResult<()> {
        if !self.is_idle() {
            return Err(SmError::EngineBusy("cmac"));
        }
        debug!("CMAC start {:?}, {} octets", op, message_len);
        self.key = key;
        self.message_len = message_len;
        self.accessor = Some(accessor);
        self.block_count = message_len.div_ceil(16).max(1);
        self.block_index = 0;
        self.x = [0; 16];
        self.op = Some(op);
        self.state = CmacState::CalcSubkeys;
        Ok(())
    }

    /// Start a CMAC over a contiguous message
    pub fn start_with_message(&mut self, key: [u8; 16], message: Vec<u8>, op: CmacOp) -> SmResult<()> {
        let len = message.len();
        self.start(key, len, Box::new(move |offset| message[offset]), op)
    }

    fn octet(&self, offset: usize) -> u8 {
        self.accessor.as_ref().map_or(0, |accessor| accessor(offset))
    }

    fn block(&self, index: usize) -> [u8; 16] {
        let mut block = [0u8; 16];
        for (i, byte) in block.iter_mut().enumerate() {
            *byte = self.octet(index * 16 + i);
        }
        block
    }

    /// Next AES block to run as (key, plaintext), moving to the matching wait state
    pub fn next_block(&mut self) -> Option<([u8; 16], [u8; 16])> {
        let plaintext = match self.state {
            CmacState::CalcSubkeys => {
                self.state = CmacState::W4Subkeys;
                [0u8; 16]
            }
            CmacState::CalcMi => {
                self.state = CmacState::W4Mi;
                let block = self.block(self.block_index);
                let mut y = [0u8; 16];
                for i in 0..16 {
                    y[i] = self.x[i] ^ block[i];
                }
                y
            }
            CmacState::CalcMlast => {
                self.state = CmacState::W4Mlast;
                let mut y = [0u8; 16];
                for i in 0..16 {
                    y[i] = self.x[i] ^ self.m_last[i];
                }
                y
            }
            _ => return None,
        };
        Some((self.key, plaintext))
    }

    /// Feed the AES result, returns the MAC once the last block is done
    pub fn handle_aes_result(&mut self, ciphertext: [u8; 16]) -> Option<(CmacOp, [u8; 16])> {
        match self.state {
            CmacState::W4Subkeys => {
                let k1 = shift_left_rb(&ciphertext);
                let k2 = shift_left_rb(&k1);

                let last = self.block_count - 1;
                let complete = self.message_len > 0 && self.message_len % 16 == 0;
                let mut m_last = [0u8; 16];
                if complete {
                    let block = self.block(last);
                    for i in 0..16 {
                        m_last[i] = block[i] ^ k1[i];
                    }
                } else {
                    let valid = self.message_len - last * 16;
                    for i in 0..16 {
                        let octet = match i.cmp(&valid) {
                            std::cmp::Ordering::Less => self.octet(last * 16 + i),
                            std::cmp::Ordering::Equal => 0x80,
                            std::cmp::Ordering::Greater => 0x00,
                        };
                        m_last[i] = octet ^ k2[i];
                    }
                }
                self.m_last = m_last;
                self.state = if self.block_count > 1 {
                    CmacState::CalcMi
                } else {
                    CmacState::CalcMlast
                };
                None
            }
            CmacState::W4Mi => {
                self.x = ciphertext;
                self.block_index += 1;
                self.state = if self.block_index + 1 >= self.block_count {
                    CmacState::CalcMlast
                } else {
                    CmacState::CalcMi
                };
                None
            }
            CmacState::W4Mlast => {
                self.state = CmacState::Idle;
                self.accessor = None;
                self.op.take().map(|op| (op, ciphertext))
            }
            state => {
                warn!("CMAC: unexpected AES result in state {:?}", state);
                None
            }
        }
    }

    /// Abandon the current run after an AES failure
    pub fn abort(&mut self) -> Option<CmacOp> {
        self.state = CmacState::Idle;
        self.accessor = None;
        self.op.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smp::sim::aes128;

    const KEY: &str = "2b7e151628aed2a6abf7158809cf4f3c";
    const MESSAGE: &str = "6bc1bee22e409f96e93d7e117393172aae2d8a571e03ac9c9eb76fac45af8e5130c81c46a35ce411e5fbc1191a0a52eff69f2445df4f9b17ad2b417be66c3710";

    fn key() -> [u8; 16] {
        let mut key = [0u8; 16];
        key.copy_from_slice(&hex::decode(KEY).unwrap());
        key
    }

    fn run(engine: &mut CmacEngine) -> (CmacOp, [u8; 16], usize) {
        let mut blocks = 0;
        loop {
            let (key, plaintext) = engine.next_block().expect("engine stalled");
            blocks += 1;
            if let Some((op, mac)) = engine.handle_aes_result(aes128(&key, &plaintext)) {
                return (op, mac, blocks);
            }
        }
    }

    fn cmac_hex(len: usize) -> (String, usize) {
        let message = hex::decode(MESSAGE).unwrap()[..len].to_vec();
        let mut engine = CmacEngine::default();
        engine
            .start_with_message(key(), message, CmacOp::SignedWrite)
            .unwrap();
        let (op, mac, blocks) = run(&mut engine);
        assert_eq!(op, CmacOp::SignedWrite);
        assert!(engine.is_idle());
        (hex::encode(mac), blocks)
    }

    #[test]
    fn test_subkeys() {
        let l = aes128(&key(), &[0u8; 16]);
        assert_eq!(hex::encode(l), "7df76b0c1ab899b33e42f047b91b546f");
        let k1 = shift_left_rb(&l);
        assert_eq!(hex::encode(k1), "fbeed618357133667c85e08f7236a8de");
        assert_eq!(
            hex::encode(shift_left_rb(&k1)),
            "f7ddac306ae266ccf90bc11ee46d513b"
        );
    }

    #[test]
    fn test_rfc4493_vectors() {
        // subkey block plus one AES call per message block
        assert_eq!(
            cmac_hex(0),
            ("bb1d6929e95937287fa37d129b756746".to_string(), 2)
        );
        assert_eq!(
            cmac_hex(16),
            ("070a16b46b4d4144f79bdd9dd04a287c".to_string(), 2)
        );
        assert_eq!(
            cmac_hex(40),
            ("dfa66747de9ae63030ca32611497c827".to_string(), 4)
        );
        assert_eq!(
            cmac_hex(64),
            ("51f0bebf7e3b9d92fc49741779363cfe".to_string(), 5)
        );
    }

    #[test]
    fn test_deterministic_and_lazy_accessor() {
        let message = hex::decode(MESSAGE).unwrap();
        let first = cmac_hex(40).0;
        assert_eq!(cmac_hex(40).0, first);

        // same message served through a reversed virtual buffer
        let mut reversed = message[..40].to_vec();
        reversed.reverse();
        let mut engine = CmacEngine::default();
        engine
            .start(
                key(),
                40,
                Box::new(move |offset| reversed[39 - offset]),
                CmacOp::SignedWrite,
            )
            .unwrap();
        assert_eq!(hex::encode(run(&mut engine).1), first);
    }

    #[test]
    fn test_busy() {
        let mut engine = CmacEngine::default();
        engine
            .start_with_message(key(), vec![1, 2, 3], CmacOp::ScOobConfirm)
            .unwrap();
        assert_eq!(
            engine.start_with_message(key(), vec![], CmacOp::SignedWrite),
            Err(SmError::EngineBusy("cmac"))
        );
        assert_eq!(engine.abort(), Some(CmacOp::ScOobConfirm));
        assert!(engine.is_idle());
        assert!(engine.next_block().is_none());
    }
}
