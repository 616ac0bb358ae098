use crate::gap::constants::*;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Central,
    Peripheral,
}

impl From<u8> for Role {
    fn from(value: u8) -> Self {
        match value {
            ROLE_PERIPHERAL => Role::Peripheral,
            _ => Role::Central,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressType {
    Public,
    Random,
    PublicIdentity,
    RandomIdentity,
}

impl AddressType {
    /// Address type as carried in SMP PDUs and the c1/f5/f6 inputs (public 0, random 1)
    pub fn smp_type(self) -> u8 {
        match self {
            AddressType::Public | AddressType::PublicIdentity => PUBLIC_DEVICE_ADDRESS,
            AddressType::Random | AddressType::RandomIdentity => RANDOM_DEVICE_ADDRESS,
        }
    }

    pub fn is_public(self) -> bool {
        self.smp_type() == PUBLIC_DEVICE_ADDRESS
    }
}

impl From<u8> for AddressType {
    fn from(value: u8) -> Self {
        match value {
            PUBLIC_DEVICE_ADDRESS => AddressType::Public,
            RANDOM_DEVICE_ADDRESS => AddressType::Random,
            PUBLIC_IDENTITY_ADDRESS => AddressType::PublicIdentity,
            RANDOM_IDENTITY_ADDRESS => AddressType::RandomIdentity,
            _ => AddressType::Public,
        }
    }
}

impl From<AddressType> for u8 {
    fn from(value: AddressType) -> Self {
        match value {
            AddressType::Public => PUBLIC_DEVICE_ADDRESS,
            AddressType::Random => RANDOM_DEVICE_ADDRESS,
            AddressType::PublicIdentity => PUBLIC_IDENTITY_ADDRESS,
            AddressType::RandomIdentity => RANDOM_IDENTITY_ADDRESS,
        }
    }
}

/// Bluetooth device address, stored least significant byte first (HCI wire order)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BdAddr {
    pub bytes: [u8; 6],
}

impl BdAddr {
    pub fn new(bytes: [u8; 6]) -> Self {
        Self { bytes }
    }

    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        if slice.len() >= 6 {
            let mut bytes = [0u8; 6];
            bytes.copy_from_slice(&slice[0..6]);
            Some(Self { bytes })
        } else {
            None
        }
    }

    /// Build from the most-significant-byte-first form used by the crypto toolbox
    pub fn from_be_bytes(be: [u8; 6]) -> Self {
        let mut bytes = be;
        bytes.reverse();
        Self { bytes }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// Most significant byte first
    pub fn to_be_bytes(&self) -> [u8; 6] {
        let mut be = self.bytes;
        be.reverse();
        be
    }

    pub fn is_resolvable_private(&self) -> bool {
        self.bytes[5] & RANDOM_ADDRESS_TYPE_MASK == RANDOM_ADDRESS_RESOLVABLE_BITS
    }

    /// prand part of a resolvable private address, most significant byte first
    pub fn prand(&self) -> [u8; 3] {
        [self.bytes[5], self.bytes[4], self.bytes[3]]
    }

    /// hash part of a resolvable private address, most significant byte first
    pub fn hash(&self) -> [u8; 3] {
        [self.bytes[2], self.bytes[1], self.bytes[0]]
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.bytes[5],
            self.bytes[4],
            self.bytes[3],
            self.bytes[2],
            self.bytes[1],
            self.bytes[0]
        )
    }
}

/// How the local random address is managed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RandomAddressMode {
    /// Public address only
    Off,
    /// Static random address, set once
    Static,
    /// Non-resolvable private address, rotated
    NonResolvable,
    /// Resolvable private address derived from the local IRK, rotated
    Resolvable,
}
