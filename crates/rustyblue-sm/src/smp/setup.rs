//! Shared pairing scratch context
//!
//! Exactly one instance exists per security manager. It belongs to the
//! connection holding the setup lock and is reset whenever a new connection
//! takes the lock.

use super::pdu::PairingFeatures;
use super::types::*;
use crate::gap::{AddressType, BdAddr};
use std::collections::VecDeque;

pub(crate) struct SetupContext {
    /// Identity of the peer, replaced by Identity Address Information
    pub peer_address_type: AddressType,
    pub peer_address: BdAddr,

    pub preq: PairingFeatures,
    pub pres: PairingFeatures,
    pub method: StkGenerationMethod,
    pub use_sc: bool,
    pub user_response: UserResponse,
    pub have_oob_data: bool,

    /// c1 address inputs, m is the initiator and s the responder
    pub m_address_type: AddressType,
    pub m_address: BdAddr,
    pub s_address_type: AddressType,
    pub s_address: BdAddr,

    pub tk: [u8; 16],
    pub local_random: [u8; 16],
    pub peer_random: [u8; 16],
    pub local_confirm: [u8; 16],
    pub peer_confirm: [u8; 16],
    /// Second c1 round input, between the two AES blocks
    pub c1_t3: [u8; 16],
    /// STK during phase 2, then the (truncated) LTK
    pub ltk: [u8; 16],

    // legacy local key distribution
    pub local_rand: [u8; 8],
    pub local_ediv: u16,
    pub local_div: u16,
    pub local_y: u16,
    pub local_csrk: [u8; 16],

    // received keys
    pub peer_ltk: [u8; 16],
    pub peer_ediv: u16,
    pub peer_rand: [u8; 8],
    pub peer_irk: [u8; 16],
    pub peer_csrk: [u8; 16],

    pub key_distribution_send: DistributedKeys,
    pub key_distribution_sent: DistributedKeys,
    pub key_distribution_expected: DistributedKeys,
    pub key_distribution_received: DistributedKeys,

    // Secure Connections
    pub peer_q: [u8; 64],
    pub local_nonce: [u8; 16],
    pub peer_nonce: [u8; 16],
    pub dhkey: [u8; 32],
    pub dhkey_calculated: bool,
    pub dhkey_command_received: bool,
    pub peer_dhkey_check: [u8; 16],
    pub local_dhkey_check: [u8; 16],
    pub t: [u8; 16],
    pub mackey: [u8; 16],
    /// Untruncated Secure Connections LTK, input of the link key derivation
    pub local_ltk: [u8; 16],
    pub ra: [u8; 16],
    pub rb: [u8; 16],
    pub passkey_bit: u8,

    pub keypress_queue: VecDeque<u8>,
}

impl Default for SetupContext {
    fn default() -> Self {
        Self {
            peer_address_type: AddressType::Public,
            peer_address: BdAddr::default(),
            preq: PairingFeatures::default(),
            pres: PairingFeatures::default(),
            method: StkGenerationMethod::JustWorks,
            use_sc: false,
            user_response: UserResponse::Idle,
            have_oob_data: false,
            m_address_type: AddressType::Public,
            m_address: BdAddr::default(),
            s_address_type: AddressType::Public,
            s_address: BdAddr::default(),
            tk: [0; 16],
            local_random: [0; 16],
            peer_random: [0; 16],
            local_confirm: [0; 16],
            peer_confirm: [0; 16],
            c1_t3: [0; 16],
            ltk: [0; 16],
            local_rand: [0; 8],
            local_ediv: 0,
            local_div: 0,
            local_y: 0,
            local_csrk: [0; 16],
            peer_ltk: [0; 16],
            peer_ediv: 0,
            peer_rand: [0; 8],
            peer_irk: [0; 16],
            peer_csrk: [0; 16],
            key_distribution_send: DistributedKeys::empty(),
            key_distribution_sent: DistributedKeys::empty(),
            key_distribution_expected: DistributedKeys::empty(),
            key_distribution_received: DistributedKeys::empty(),
            peer_q: [0; 64],
            local_nonce: [0; 16],
            peer_nonce: [0; 16],
            dhkey: [0; 32],
            dhkey_calculated: false,
            dhkey_command_received: false,
            peer_dhkey_check: [0; 16],
            local_dhkey_check: [0; 16],
            t: [0; 16],
            mackey: [0; 16],
            local_ltk: [0; 16],
            ra: [0; 16],
            rb: [0; 16],
            passkey_bit: 0,
            keypress_queue: VecDeque::new(),
        }
    }
}

impl SetupContext {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Key distribution sets for the PDUs we send and expect
    pub fn setup_key_distribution(&mut self, send: KeyDistribution, receive: KeyDistribution) {
        self.key_distribution_send = DistributedKeys::for_key_distribution(send);
        self.key_distribution_sent = DistributedKeys::empty();
        self.key_distribution_expected = DistributedKeys::for_key_distribution(receive);
        self.key_distribution_received = DistributedKeys::empty();
    }

    /// Received set equals the expected set
    pub fn all_keys_received(&self) -> bool {
        self.key_distribution_received == self.key_distribution_expected
    }

    /// Both sides asked for bonding
    pub fn bonding_enabled(&self) -> bool {
        (self.preq.auth_req & self.pres.auth_req).contains(AuthReq::BONDING)
    }

    /// Both sides support the h7 based link key derivation
    pub fn use_h7(&self) -> bool {
        (self.preq.auth_req & self.pres.auth_req).contains(AuthReq::CT2)
    }

    /// Passkey as held in the TK
    pub fn passkey(&self) -> u32 {
        super::crypto::passkey_from_tk(&self.tk)
    }
}
