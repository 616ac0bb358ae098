//! Primitive engine adapters
//!
//! AES-128 and random numbers come from the controller as LE Encrypt and LE Rand
//! commands, P-256 runs in host software seeded from LE Rand. Every adapter
//! keeps at most one operation in flight and tags it with the continuation that
//! consumes its result.

use super::types::*;
use crate::hci::HciCommand;
use log::{debug, warn};
use p256::ecdh::diffie_hellman;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::VecDeque;

fn reverse_128(value: &[u8; 16]) -> [u8; 16] {
    let mut out = *value;
    out.reverse();
    out
}

/// Step of the local key hierarchy derivation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DkgStep {
    Irk,
    Dhk,
}

/// Legacy pairing steps that run on the AES engine for one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnAesStep {
    /// First c1 round for the local confirm
    ConfirmA,
    /// Second c1 round for the local confirm
    ConfirmB,
    /// First c1 round for the peer confirm
    CheckC,
    /// Second c1 round for the peer confirm
    CheckD,
    Stk,
    /// dm for EDIV while distributing keys
    Ph3Y,
    Ph3Ltk,
    Ph3Csrk,
    /// dm for EDIV while answering an LTK request
    Ph4Y,
    Ph4Ltk,
}

/// Continuation of an AES block operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AesOp {
    Cmac,
    Dkg(DkgStep),
    RandomAddressHash,
    AddressResolution,
    Connection { handle: u16, step: ConnAesStep },
}

/// Secure Connections steps that run on the CMAC engine for one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScCmacStep {
    LocalConfirm,
    CheckConfirm,
    G2,
    F5Salt,
    F5MacKey,
    F5Ltk,
    F6ForDhKeyCheck,
    F6ToVerifyDhKeyCheck,
    IlkH6,
    IlkH7,
    BrEdrLinkKey,
}

/// Continuation of a CMAC run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CmacOp {
    Connection { handle: u16, step: ScCmacStep },
    ScOobConfirm,
    SignedWrite,
}

/// Connection steps waiting for random bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnRandomStep {
    /// Passkey to display
    Tk,
    /// Legacy Mconfirm/Sconfirm random
    LocalRandom,
    /// Secure Connections nonce, then compute the local confirm
    NonceForConfirm,
    /// Secure Connections nonce, then send Pairing Random
    NonceForRandom,
    /// Legacy RAND for key distribution
    Ph3Rand,
    /// Legacy DIV for key distribution
    Ph3Div,
    /// Local CSRK for Secure Connections key distribution
    ScCsrk,
}

/// Continuation of a random number request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RandomOp {
    EcSeed,
    RandomAddress,
    ScOobRandom,
    Connection { handle: u16, step: ConnRandomStep },
}

/// AES-128 block engine on top of LE Encrypt
#[derive(Debug, Default)]
pub(crate) struct AesEngine {
    pending: Option<AesOp>,
}

impl AesEngine {
    pub fn is_idle(&self) -> bool {
        self.pending.is_none()
    }

    /// Start one block, key and plaintext most significant octet first
    ///
    /// Returns the LE Encrypt command to submit. Both inputs are reversed here,
    /// the result is reversed back in [`AesEngine::complete`].
    pub fn start(&mut self, key: &[u8; 16], plaintext: &[u8; 16], op: AesOp) -> SmResult<HciCommand> {
        if self.pending.is_some() {
            return Err(SmError::EngineBusy("aes"));
        }
        debug!("AES start {:?}", op);
        self.pending = Some(op);
        Ok(HciCommand::LeEncrypt {
            key: reverse_128(key),
            plaintext: reverse_128(plaintext),
        })
    }

    /// Consume the LE Encrypt return parameters
    ///
    /// The engine is idle again when this returns, so the caller may chain
    /// the next block right away.
    pub fn complete(&mut self, return_parameters: &[u8]) -> Option<(AesOp, Result<[u8; 16], u8>)> {
        let op = self.pending.take()?;
        let status = return_parameters.first().copied().unwrap_or(0xFF);
        if status != 0 || return_parameters.len() < 17 {
            warn!("LE Encrypt failed, status {:#04x}", status);
            return Some((op, Err(status)));
        }
        let mut ciphertext = [0u8; 16];
        for (i, byte) in return_parameters[1..17].iter().rev().enumerate() {
            ciphertext[i] = *byte;
        }
        Some((op, Ok(ciphertext)))
    }
}

struct RandomRequest {
    op: RandomOp,
    len: usize,
    data: Vec<u8>,
}

/// Random number engine on top of LE Rand
///
/// Requests are served in order, eight octets per LE Rand, with only one
/// LE Rand outstanding.
#[derive(Default)]
pub(crate) struct RandomEngine {
    requests: VecDeque<RandomRequest>,
    in_flight: bool,
}

impl RandomEngine {
    pub fn request(&mut self, op: RandomOp, len: usize) {
        debug!("random {:?}, {} octets", op, len);
        self.requests.push_back(RandomRequest {
            op,
            len,
            data: Vec::with_capacity(len),
        });
    }

    pub fn is_pending(&self, op: RandomOp) -> bool {
        self.requests.iter().any(|request| request.op == op)
    }

    /// Next LE Rand to submit, if any
    pub fn poll(&mut self) -> Option<HciCommand> {
        if self.in_flight || self.requests.is_empty() {
            return None;
        }
        self.in_flight = true;
        Some(HciCommand::LeRand)
    }

    /// Consume the LE Rand return parameters, returns the finished request
    pub fn complete(&mut self, return_parameters: &[u8]) -> Option<(RandomOp, Vec<u8>)> {
        if !self.in_flight {
            return None;
        }
        self.in_flight = false;
        let status = return_parameters.first().copied().unwrap_or(0xFF);
        if status != 0 || return_parameters.len() < 9 {
            // retried on the next poll
            warn!("LE Rand failed, status {:#04x}", status);
            return None;
        }

        let request = self.requests.front_mut()?;
        let missing = request.len - request.data.len();
        let take = missing.min(8);
        request.data.extend_from_slice(&return_parameters[1..1 + take]);
        if request.data.len() < request.len {
            return None;
        }
        self.requests.pop_front().map(|request| (request.op, request.data))
    }

    /// Drop queued requests for a connection that went away
    pub fn cancel_connection(&mut self, handle: u16) {
        let in_flight = self.in_flight;
        let mut index = 0;
        self.requests.retain(|request| {
            let keep = (index == 0 && in_flight)
                || !matches!(request.op, RandomOp::Connection { handle: h, .. } if h == handle);
            index += 1;
            keep
        });
    }
}

/// Local P-256 key pair state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EcKeyState {
    Idle,
    W4Seed,
    Done,
}

/// Host P-256 engine
pub(crate) struct EcEngine {
    state: EcKeyState,
    secret: Option<SecretKey>,
    /// Public key, x || y most significant octet first
    public_q: [u8; 64],
    /// Connection waiting for the DH key
    pending_dhkey: Option<(u16, [u8; 64])>,
}

impl Default for EcEngine {
    fn default() -> Self {
        Self {
            state: EcKeyState::Idle,
            secret: None,
            public_q: [0; 64],
            pending_dhkey: None,
        }
    }
}

impl EcEngine {
    pub fn state(&self) -> EcKeyState {
        self.state
    }

    pub fn seed_requested(&mut self) {
        self.state = EcKeyState::W4Seed;
    }

    /// Generate the key pair from 64 octets of LE Rand output
    pub fn generate(&mut self, seed: &[u8]) {
        let mut folded = [0u8; 32];
        for (i, byte) in seed.iter().enumerate() {
            folded[i % 32] ^= byte;
        }
        let mut rng = StdRng::from_seed(folded);
        let secret = SecretKey::random(&mut rng);
        let point = secret.public_key().to_encoded_point(false);
        // uncompressed SEC1: 0x04 || x || y
        self.public_q.copy_from_slice(&point.as_bytes()[1..65]);
        self.secret = Some(secret);
        self.state = EcKeyState::Done;
        debug!("EC public key {}", hex::encode(self.public_q));
    }

    pub fn public_q(&self) -> &[u8; 64] {
        &self.public_q
    }

    /// Check that x || y is a point on P-256
    pub fn validate_public_key(q: &[u8; 64]) -> bool {
        Self::parse_public_key(q).is_some()
    }

    fn parse_public_key(q: &[u8; 64]) -> Option<PublicKey> {
        let mut sec1 = [0u8; 65];
        sec1[0] = 0x04;
        sec1[1..].copy_from_slice(q);
        PublicKey::from_sec1_bytes(&sec1).ok()
    }

    /// Queue a DH key computation, delivered by [`EcEngine::take_dhkey`]
    pub fn start_dhkey(&mut self, handle: u16, peer_q: [u8; 64]) {
        self.pending_dhkey = Some((handle, peer_q));
    }

    pub fn has_pending_dhkey(&self) -> bool {
        self.pending_dhkey.is_some()
    }

    pub fn cancel_connection(&mut self, handle: u16) {
        if matches!(self.pending_dhkey, Some((h, _)) if h == handle) {
            self.pending_dhkey = None;
        }
    }

    /// Run a queued DH key computation, returns the x coordinate of the shared point
    pub fn take_dhkey(&mut self) -> Option<(u16, Option<[u8; 32]>)> {
        let (handle, peer_q) = self.pending_dhkey.take()?;
        let dhkey = match (self.secret.as_ref(), Self::parse_public_key(&peer_q)) {
            (Some(secret), Some(peer)) => {
                let shared = diffie_hellman(secret.to_nonzero_scalar(), peer.as_affine());
                let mut dhkey = [0u8; 32];
                dhkey.copy_from_slice(shared.raw_secret_bytes().as_slice());
                Some(dhkey)
            }
            _ => None,
        };
        Some((handle, dhkey))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aes_engine_reverses_at_boundary() {
        let mut aes = AesEngine::default();
        let mut key = [0u8; 16];
        key[0] = 0x01;
        let mut plaintext = [0u8; 16];
        plaintext[15] = 0x02;

        let command = aes.start(&key, &plaintext, AesOp::Cmac).unwrap();
        match command {
            HciCommand::LeEncrypt { key, plaintext } => {
                assert_eq!(key[15], 0x01);
                assert_eq!(plaintext[0], 0x02);
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert!(!aes.is_idle());
        assert_eq!(
            aes.start(&key, &plaintext, AesOp::Cmac),
            Err(SmError::EngineBusy("aes"))
        );

        let mut params = vec![0u8];
        params.extend(0u8..16);
        let (op, result) = aes.complete(&params).unwrap();
        assert_eq!(op, AesOp::Cmac);
        let ciphertext = result.unwrap();
        assert_eq!(ciphertext[0], 15);
        assert_eq!(ciphertext[15], 0);
        assert!(aes.is_idle());
        assert!(aes.complete(&params).is_none());
    }

    #[test]
    fn test_random_engine_accumulates_in_order() {
        let mut random = RandomEngine::default();
        random.request(RandomOp::ScOobRandom, 16);
        random.request(RandomOp::RandomAddress, 8);

        assert_eq!(random.poll(), Some(HciCommand::LeRand));
        // one LE Rand outstanding at a time
        assert_eq!(random.poll(), None);
        assert!(random.complete(&[0, 1, 1, 1, 1, 1, 1, 1, 1]).is_none());

        assert_eq!(random.poll(), Some(HciCommand::LeRand));
        let (op, data) = random.complete(&[0, 2, 2, 2, 2, 2, 2, 2, 2]).unwrap();
        assert_eq!(op, RandomOp::ScOobRandom);
        assert_eq!(data.len(), 16);
        assert_eq!(&data[..8], &[1; 8]);
        assert_eq!(&data[8..], &[2; 8]);

        assert_eq!(random.poll(), Some(HciCommand::LeRand));
        let (op, data) = random.complete(&[0, 3, 3, 3, 3, 3, 3, 3, 3]).unwrap();
        assert_eq!(op, RandomOp::RandomAddress);
        assert_eq!(data, vec![3; 8]);
        assert_eq!(random.poll(), None);
    }

    #[test]
    fn test_random_engine_cancel_keeps_in_flight_request() {
        let mut random = RandomEngine::default();
        let tk = RandomOp::Connection {
            handle: 0x40,
            step: ConnRandomStep::Tk,
        };
        let nonce = RandomOp::Connection {
            handle: 0x40,
            step: ConnRandomStep::NonceForConfirm,
        };
        random.request(tk, 8);
        random.request(nonce, 16);
        assert!(random.poll().is_some());

        random.cancel_connection(0x40);
        assert!(random.is_pending(tk));
        assert!(!random.is_pending(nonce));
    }

    #[test]
    fn test_ec_key_agreement() {
        let mut a = EcEngine::default();
        let mut b = EcEngine::default();
        a.generate(&[1u8; 64]);
        b.generate(&[2u8; 64]);
        assert_eq!(a.state(), EcKeyState::Done);
        assert!(EcEngine::validate_public_key(a.public_q()));
        assert_ne!(a.public_q(), b.public_q());

        a.start_dhkey(1, *b.public_q());
        b.start_dhkey(2, *a.public_q());
        let (handle_a, dhkey_a) = a.take_dhkey().unwrap();
        let (handle_b, dhkey_b) = b.take_dhkey().unwrap();
        assert_eq!((handle_a, handle_b), (1, 2));
        assert!(dhkey_a.is_some());
        assert_eq!(dhkey_a, dhkey_b);
    }

    #[test]
    fn test_ec_rejects_point_off_curve() {
        let mut a = EcEngine::default();
        a.generate(&[7u8; 64]);
        let mut bad = *a.public_q();
        bad[63] ^= 0x01;
        assert!(!EcEngine::validate_public_key(&bad));
        assert!(!EcEngine::validate_public_key(&[0u8; 64]));
    }
}
