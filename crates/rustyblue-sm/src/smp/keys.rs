//! Bonded device records and the bonding store
//!
//! The security manager never persists anything itself. It reads and writes
//! [`BondedDevice`] records through the [`BondingStore`] trait, indexed by a
//! small integer that stays stable for the lifetime of a record.

use super::types::*;
use crate::gap::{AddressType, BdAddr};

/// Default number of records kept by [`MemoryBondingStore`]
pub const DEFAULT_BONDING_STORE_CAPACITY: usize = 16;

/// Keys and flags stored for a bonded peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BondedDevice {
    /// Identity address type
    pub address_type: AddressType,
    /// Identity address
    pub address: BdAddr,
    /// Identity Resolving Key, all zero if the peer did not distribute one
    pub irk: [u8; 16],
    /// Long Term Key, all zero if none was distributed
    pub ltk: [u8; 16],
    /// EDIV, zero for Secure Connections keys
    pub ediv: u16,
    /// RAND, zero for Secure Connections keys
    pub rand: [u8; 8],
    /// Negotiated encryption key size
    pub key_size: u8,
    pub authenticated: bool,
    pub authorized: bool,
    pub secure_connections: bool,
    /// Our CSRK given to the peer, with our signing counter
    pub local_csrk: Option<[u8; 16]>,
    pub local_counter: u32,
    /// CSRK received from the peer, with the last counter seen
    pub remote_csrk: Option<[u8; 16]>,
    pub remote_counter: u32,
}

impl BondedDevice {
    /// Create a new record with only identity information
    pub fn new(address_type: AddressType, address: BdAddr, irk: [u8; 16]) -> Self {
        Self {
            address_type,
            address,
            irk,
            ltk: [0; 16],
            ediv: 0,
            rand: [0; 8],
            key_size: 0,
            authenticated: false,
            authorized: false,
            secure_connections: false,
            local_csrk: None,
            local_counter: 0,
            remote_csrk: None,
            remote_counter: 0,
        }
    }

    pub fn has_ltk(&self) -> bool {
        self.ltk != [0; 16]
    }

    pub fn has_irk(&self) -> bool {
        self.irk != [0; 16]
    }

    /// Same identity type and address
    pub fn matches(&self, address_type: AddressType, address: &BdAddr) -> bool {
        self.address_type.smp_type() == address_type.smp_type() && self.address == *address
    }
}

/// Key-value store for bonded devices
pub trait BondingStore: Send {
    /// Number of stored records
    fn count(&self) -> usize;

    /// Number of slots, indices are `0..capacity()`
    fn capacity(&self) -> usize;

    fn get(&self, index: usize) -> Option<&BondedDevice>;

    /// Index of the record with this identity address
    fn get_by_address(&self, address_type: AddressType, address: &BdAddr) -> Option<usize>;

    /// Store a new record in a free slot
    fn put(&mut self, device: BondedDevice) -> SmResult<usize>;

    /// Replace the record at `index`
    fn update(&mut self, index: usize, device: BondedDevice) -> SmResult<()>;

    fn remove(&mut self, index: usize) -> Option<BondedDevice>;

    /// All stored records with their index
    fn iterate(&self) -> Box<dyn Iterator<Item = (usize, &BondedDevice)> + '_>;
}

/// Fixed-capacity in-memory bonding store
#[derive(Debug, Clone)]
pub struct MemoryBondingStore {
    slots: Vec<Option<BondedDevice>>,
}

impl MemoryBondingStore {
    /// Create a new empty store
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity],
        }
    }
}

impl Default for MemoryBondingStore {
    fn default() -> Self {
        Self::new(DEFAULT_BONDING_STORE_CAPACITY)
    }
}

impl BondingStore for MemoryBondingStore {
    fn count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn get(&self, index: usize) -> Option<&BondedDevice> {
        self.slots.get(index).and_then(|slot| slot.as_ref())
    }

    fn get_by_address(&self, address_type: AddressType, address: &BdAddr) -> Option<usize> {
        self.iterate()
            .find(|(_, device)| device.matches(address_type, address))
            .map(|(index, _)| index)
    }

    fn put(&mut self, device: BondedDevice) -> SmResult<usize> {
        let index = self
            .slots
            .iter()
            .position(|slot| slot.is_none())
            .ok_or(SmError::BondingStoreFull)?;
        self.slots[index] = Some(device);
        Ok(index)
    }

    fn update(&mut self, index: usize, device: BondedDevice) -> SmResult<()> {
        match self.slots.get_mut(index) {
            Some(slot @ Some(_)) => {
                *slot = Some(device);
                Ok(())
            }
            _ => Err(SmError::InvalidParameter(format!(
                "No bonded device at index {}",
                index
            ))),
        }
    }

    fn remove(&mut self, index: usize) -> Option<BondedDevice> {
        self.slots.get_mut(index).and_then(|slot| slot.take())
    }

    fn iterate(&self) -> Box<dyn Iterator<Item = (usize, &BondedDevice)> + '_> {
        Box::new(
            self.slots
                .iter()
                .enumerate()
                .filter_map(|(index, slot)| slot.as_ref().map(|device| (index, device))),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(last: u8) -> BondedDevice {
        BondedDevice::new(
            AddressType::Public,
            BdAddr::new([last, 2, 3, 4, 5, 6]),
            [last; 16],
        )
    }

    #[test]
    fn test_put_get_remove() {
        let mut store = MemoryBondingStore::new(2);
        assert_eq!(store.capacity(), 2);
        assert_eq!(store.count(), 0);

        let a = store.put(device(1)).unwrap();
        let b = store.put(device(2)).unwrap();
        assert_ne!(a, b);
        assert_eq!(store.count(), 2);
        assert_eq!(store.put(device(3)), Err(SmError::BondingStoreFull));

        let address = BdAddr::new([2, 2, 3, 4, 5, 6]);
        assert_eq!(store.get_by_address(AddressType::Public, &address), Some(b));
        assert_eq!(store.get_by_address(AddressType::Random, &address), None);
        // identity types compare by their public/random bit
        assert_eq!(
            store.get_by_address(AddressType::PublicIdentity, &address),
            Some(b)
        );

        assert_eq!(store.remove(a).map(|d| d.irk), Some([1; 16]));
        assert!(store.get(a).is_none());
        assert_eq!(store.iterate().count(), 1);

        // freed slot is reused
        assert_eq!(store.put(device(4)).unwrap(), a);
    }

    #[test]
    fn test_update() {
        let mut store = MemoryBondingStore::default();
        let index = store.put(device(1)).unwrap();

        let mut record = store.get(index).unwrap().clone();
        assert!(!record.has_ltk());
        assert!(record.has_irk());
        record.ltk = [0xAA; 16];
        record.key_size = 16;
        store.update(index, record).unwrap();
        assert!(store.get(index).unwrap().has_ltk());

        assert!(store.update(index + 1, device(2)).is_err());
    }
}
