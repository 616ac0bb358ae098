//! Identity resolution against the bonding store
//!
//! One lookup runs at a time. Lookups for new connections go first, then
//! lookups queued through `address_resolution_lookup`. Each stored IRK costs
//! one AES block (ah), so a scan pauses while the AES engine is busy.

use super::crypto::{ah_hash, ah_r_prime};
use super::engine::AesOp;
use super::events::SmEvent;
use super::manager::SecurityManager;
use super::state::SmState;
use super::types::*;
use crate::gap::{AddressType, BdAddr, Role};
use log::{debug, info};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LookupTarget {
    Connection(u16),
    General,
}

#[derive(Debug, Clone, Copy)]
struct Lookup {
    target: LookupTarget,
    address_type: AddressType,
    address: BdAddr,
    /// Next bonding store index to test
    index: usize,
    /// ah running for `index`
    ah_pending: bool,
}

#[derive(Debug, Default)]
pub(crate) struct AddressResolution {
    current: Option<Lookup>,
    pub queue: VecDeque<(AddressType, BdAddr)>,
}

impl AddressResolution {
    /// The address is being resolved or waits in the queue
    pub fn is_queued(&self, address_type: AddressType, address: &BdAddr) -> bool {
        let running = self.current.map_or(false, |lookup| {
            lookup.target == LookupTarget::General
                && lookup.address_type == address_type
                && lookup.address == *address
        });
        running
            || self
                .queue
                .iter()
                .any(|(t, a)| *t == address_type && a == address)
    }

    /// Forget the lookup of a connection that went away
    pub fn cancel_connection(&mut self, handle: u16) {
        if matches!(self.current, Some(lookup) if lookup.target == LookupTarget::Connection(handle)) {
            // an AES block may still be in flight, its result is dropped
            self.current = None;
        }
    }
}

impl SecurityManager {
    /// Advance the running lookup or start the next one
    pub(super) fn run_address_resolution(&mut self) {
        if self.resolution.current.is_none() && !self.start_next_lookup() {
            return;
        }

        loop {
            let Some(lookup) = self.resolution.current else {
                return;
            };
            if lookup.ah_pending {
                return;
            }
            if lookup.index >= self.store.capacity() {
                self.finish_lookup(None);
                return;
            }

            let index = lookup.index;
            let Some(device) = self.store.get(index) else {
                self.advance_lookup();
                continue;
            };
            if device.matches(lookup.address_type, &lookup.address) {
                self.finish_lookup(Some(index));
                return;
            }
            if lookup.address_type.is_public()
                || !lookup.address.is_resolvable_private()
                || !device.has_irk()
            {
                self.advance_lookup();
                continue;
            }
            if !self.aes.is_idle() {
                return;
            }

            let irk = device.irk;
            let plaintext = ah_r_prime(&lookup.address.prand());
            debug!("resolving {} against index {}", lookup.address, index);
            if self.start_aes(&irk, &plaintext, AesOp::AddressResolution) {
                if let Some(current) = self.resolution.current.as_mut() {
                    current.ah_pending = true;
                }
            }
            return;
        }
    }

    fn start_next_lookup(&mut self) -> bool {
        let pending = self
            .connections
            .values_mut()
            .find(|conn| conn.irk_lookup == IrkLookupState::W4Ready);
        let lookup = match pending {
            Some(conn) => {
                conn.irk_lookup = IrkLookupState::Started;
                Lookup {
                    target: LookupTarget::Connection(conn.handle),
                    address_type: conn.peer_address_type,
                    address: conn.peer_address,
                    index: 0,
                    ah_pending: false,
                }
            }
            None => match self.resolution.queue.pop_front() {
                Some((address_type, address)) => Lookup {
                    target: LookupTarget::General,
                    address_type,
                    address,
                    index: 0,
                    ah_pending: false,
                },
                None => return false,
            },
        };

        self.resolution.current = Some(lookup);
        let handle = match lookup.target {
            LookupTarget::Connection(handle) => Some(handle),
            LookupTarget::General => None,
        };
        self.emit(SmEvent::IdentityResolvingStarted {
            handle,
            address_type: lookup.address_type,
            address: lookup.address,
        });
        true
    }

    fn advance_lookup(&mut self) {
        if let Some(lookup) = self.resolution.current.as_mut() {
            lookup.index += 1;
            lookup.ah_pending = false;
        }
    }

    /// Result of the ah block for the current index
    pub(super) fn address_resolution_aes_done(&mut self, result: Result<[u8; 16], u8>) {
        let Some(lookup) = self.resolution.current else {
            return;
        };
        if !lookup.ah_pending {
            return;
        }
        match result {
            Ok(ciphertext) if ah_hash(&ciphertext) == lookup.address.hash() => {
                self.finish_lookup(Some(lookup.index));
            }
            _ => self.advance_lookup(),
        }
    }

    fn finish_lookup(&mut self, matched: Option<usize>) {
        let Some(lookup) = self.resolution.current.take() else {
            return;
        };
        self.progress += 1;
        let handle = match lookup.target {
            LookupTarget::Connection(handle) => Some(handle),
            LookupTarget::General => None,
        };

        match matched.and_then(|index| self.store.get(index).map(|device| (index, device))) {
            Some((index, device)) => {
                info!(
                    "{} resolved to {} (index {})",
                    lookup.address, device.address, index
                );
                let event = SmEvent::IdentityResolvingSucceeded {
                    handle,
                    address_type: lookup.address_type,
                    address: lookup.address,
                    identity_address_type: device.address_type,
                    identity_address: device.address,
                    index,
                };
                if let Some(handle) = handle {
                    if let Some(conn) = self.connections.get_mut(&handle) {
                        conn.irk_lookup = IrkLookupState::Succeeded;
                        conn.db_index = Some(index);
                    }
                }
                self.emit(event);
            }
            None => {
                debug!("{} not found in bonding store", lookup.address);
                if let Some(handle) = handle {
                    if let Some(conn) = self.connections.get_mut(&handle) {
                        conn.irk_lookup = IrkLookupState::Failed;
                    }
                }
                self.emit(SmEvent::IdentityResolvingFailed {
                    handle,
                    address_type: lookup.address_type,
                    address: lookup.address,
                });
            }
        }

        if let Some(handle) = handle {
            self.connection_lookup_done(handle, matched.is_some());
        }
    }

    /// Resume whatever waited for the identity of a connection
    fn connection_lookup_done(&mut self, handle: u16, succeeded: bool) {
        let mitm_required = self.config.auth_req.contains(AuthReq::MITM);
        let request_security = self.config.request_security;
        let Some(conn) = self.connections.get_mut(&handle) else {
            return;
        };
        let stored = conn
            .db_index
            .and_then(|index| self.store.get(index))
            .map(|device| (device.has_ltk(), device.authenticated));
        let (have_ltk, stored_authenticated) = stored.unwrap_or((false, false));

        match conn.role {
            Role::Peripheral => {
                conn.state = match (conn.state, succeeded) {
                    (SmState::ResponderPh0ReceivedLtkW4Irk, true) => SmState::ResponderPh0ReceivedLtkRequest,
                    (SmState::ResponderPh0ReceivedLtkW4Irk, false) => {
                        SmState::ResponderPh0SendLtkRequestedNegativeReply
                    }
                    (SmState::ResponderPh1PairingRequestReceivedW4Irk, _) => {
                        SmState::ResponderPh1PairingRequestReceived
                    }
                    (state, _) => state,
                };
                let trigger = conn.pairing_requested || request_security;
                if !trigger || conn.state != SmState::ResponderIdle {
                    return;
                }
                conn.pairing_requested = true;
                conn.state = SmState::ResponderSendSecurityRequest;
                if succeeded && have_ltk {
                    self.reencryption_started(handle);
                } else {
                    self.pairing_started(handle);
                }
            }
            Role::Central => {
                if !(conn.pairing_requested || conn.security_request_received) {
                    return;
                }
                if conn.state != SmState::InitiatorConnected {
                    return;
                }
                conn.security_request_received = false;
                conn.state = if succeeded && have_ltk && (stored_authenticated || !mitm_required) {
                    SmState::InitiatorPh4HasLtk
                } else {
                    SmState::InitiatorPh1W2SendPairingRequest
                };
            }
        }
    }
}
