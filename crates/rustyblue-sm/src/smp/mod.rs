//! Security Manager Protocol (SMP) implementation
//!
//! This module implements the host side of the LE Security Manager:
//! - Pairing (legacy and Secure Connections) for one connection at a time
//! - Key generation, distribution and bonding
//! - Re-encryption with stored or reconstructed keys
//! - Identity resolution and local private addresses
//!
//! All cryptography runs through the controller's LE Encrypt and LE Rand
//! commands, except the P-256 operations which run on the host.

mod address;
mod cmac;
mod completion;
mod config;
mod connection;
mod constants;
pub mod crypto;
mod engine;
mod events;
mod handler;
mod keys;
mod link;
mod manager;
pub mod pairing;
pub mod pdu;
mod resolution;
mod run;
mod setup;
mod state;
mod types;

#[cfg(test)]
pub(crate) mod sim;

// Re-export public API
pub use self::config::SecurityManagerConfig;
pub use self::events::{PeerInfo, SmEvent};
pub use self::keys::{BondedDevice, BondingStore, MemoryBondingStore, DEFAULT_BONDING_STORE_CAPACITY};
pub use self::link::LinkLayer;
pub use self::manager::{
    OobDataProvider, PeerScOobData, ScOobDataProvider, SecurityManager, SmEventListener,
};
pub use self::pdu::{PairingFeatures, SmpPdu};
pub use self::state::SmState;
pub use self::types::*;
