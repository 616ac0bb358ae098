//! Per-link security context

use super::pdu::PairingFeatures;
use super::state::SmState;
use super::types::*;
use crate::gap::{AddressType, BdAddr, Role};

/// Security context of one physical link
#[derive(Debug, Clone)]
pub(crate) struct SmConnection {
    pub handle: u16,
    pub role: Role,
    pub peer_address_type: AddressType,
    pub peer_address: BdAddr,
    pub own_address_type: AddressType,
    pub own_address: BdAddr,

    pub state: SmState,

    pub encrypted: bool,
    pub key_size: u8,
    pub authenticated: bool,
    pub authorization: AuthorizationState,
    /// Link was encrypted with a Secure Connections key
    pub secure_connections: bool,

    pub pairing_requested: bool,
    pub security_request_received: bool,
    pub irk_lookup: IrkLookupState,
    pub db_index: Option<usize>,

    /// Pairing Request received as responder
    pub preq: PairingFeatures,

    /// EDIV/RAND from the last LTK request, RAND most significant octet first
    pub ltk_rand: [u8; 8],
    pub ltk_ediv: u16,

    pub pairing_active: bool,
    pub reencryption_active: bool,
    pub pairing_failed_reason: u8,
}

impl SmConnection {
    pub fn new(
        handle: u16,
        role: Role,
        peer_address_type: AddressType,
        peer_address: BdAddr,
        own_address_type: AddressType,
        own_address: BdAddr,
    ) -> Self {
        let state = match role {
            Role::Central => SmState::InitiatorConnected,
            Role::Peripheral => SmState::ResponderIdle,
        };
        Self {
            handle,
            role,
            peer_address_type,
            peer_address,
            own_address_type,
            own_address,
            state,
            encrypted: false,
            key_size: 0,
            authenticated: false,
            authorization: AuthorizationState::Unknown,
            secure_connections: false,
            pairing_requested: false,
            security_request_received: false,
            irk_lookup: IrkLookupState::W4Ready,
            db_index: None,
            preq: PairingFeatures::default(),
            ltk_rand: [0; 8],
            ltk_ediv: 0,
            pairing_active: false,
            reencryption_active: false,
            pairing_failed_reason: 0,
        }
    }

    pub fn is_responder(&self) -> bool {
        self.role == Role::Peripheral
    }

    /// Idle state of this connection's role
    pub fn idle_state(&self) -> SmState {
        if self.is_responder() {
            SmState::ResponderIdle
        } else {
            SmState::InitiatorConnected
        }
    }
}
