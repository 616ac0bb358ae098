//! Notifications emitted to registered listeners

use crate::gap::{AddressType, BdAddr};

/// Connection and peer address an event refers to
///
/// The address is the identity address once the peer has been resolved,
/// otherwise the address it connected with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerInfo {
    pub handle: u16,
    pub address_type: AddressType,
    pub address: BdAddr,
}

/// Security manager event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmEvent {
    /// Confirm or decline a Just Works pairing
    JustWorksRequest { peer: PeerInfo, secure_connections: bool },
    /// Compare the six digit value with the peer and confirm or decline
    NumericComparisonRequest { peer: PeerInfo, passkey: u32 },
    /// Show the passkey to the user
    PasskeyDisplay { peer: PeerInfo, passkey: u32, secure_connections: bool },
    /// Peer finished passkey entry, the displayed passkey can be hidden
    PasskeyDisplayCancel { peer: PeerInfo },
    /// Ask the user for the passkey
    PasskeyInput { peer: PeerInfo, secure_connections: bool },
    /// Keypress notification received from the peer
    KeypressNotification { handle: u16, action: u8 },

    IdentityResolvingStarted {
        handle: Option<u16>,
        address_type: AddressType,
        address: BdAddr,
    },
    IdentityResolvingSucceeded {
        handle: Option<u16>,
        address_type: AddressType,
        address: BdAddr,
        identity_address_type: AddressType,
        identity_address: BdAddr,
        index: usize,
    },
    IdentityResolvingFailed {
        handle: Option<u16>,
        address_type: AddressType,
        address: BdAddr,
    },
    /// Peer stored in the bonding store
    IdentityCreated {
        peer: PeerInfo,
        identity_address_type: AddressType,
        identity_address: BdAddr,
        index: usize,
    },

    AuthorizationResult { peer: PeerInfo, granted: bool },

    PairingStarted { peer: PeerInfo },
    /// `status` is an HCI status code, `reason` the SMP failure reason if any
    PairingComplete { peer: PeerInfo, status: u8, reason: u8 },
    ReencryptionStarted { peer: PeerInfo },
    ReencryptionComplete { peer: PeerInfo, status: u8 },

    /// Local Secure Connections OOB data to hand to the peer
    ScOobData { confirm: [u8; 16], random: [u8; 16] },
    /// Result of a signed-write CMAC
    SignedWriteSignature { mac: [u8; 16] },
    /// BR/EDR link key derived from the LE Secure Connections LTK
    LinkKeyDerived { peer: PeerInfo, link_key: [u8; 16], authenticated: bool },
}
