//! RustyBlue SM - host-side Bluetooth LE Security Manager
//!
//! This library implements the LE Security Manager of a Bluetooth host:
//! pairing, key distribution, bonding, re-encryption and identity resolution.
//! It sits on top of an HCI transport and an L2CAP SMP channel provided by
//! the embedding stack through [`smp::LinkLayer`].

pub mod error;
pub mod gap;
pub mod hci;
pub mod smp;

// Re-export common types for convenience
pub use error::HciError;
pub use gap::{AddressType, BdAddr, RandomAddressMode, Role};
pub use hci::{HciCommand, HciEvent, LinkEvent};
pub use smp::{
    AuthReq, BondedDevice, BondingStore, IoCapability, KeyDistribution, LinkLayer,
    MemoryBondingStore, SecurityManager, SecurityManagerConfig, SmError, SmEvent, SmState,
};
