//! Inbound HCI events and SMP PDUs

use super::connection::SmConnection;
use super::constants::SMP_PDU_SIZE;
use super::engine::{ConnRandomStep, EcEngine};
use super::events::SmEvent;
use super::manager::SecurityManager;
use super::pdu::SmpPdu;
use super::state::SmState;
use super::types::*;
use crate::hci::constants::*;
use crate::hci::{HciEvent, LinkEvent};
use log::{debug, info, warn};

impl SecurityManager {
    /// Feed an HCI event from the controller
    ///
    /// Events that do not concern the security manager are ignored.
    pub fn handle_hci_event(&mut self, event: &HciEvent) {
        match event.decode() {
            Some(link_event) => self.handle_link_event(link_event),
            None => debug!("ignoring HCI event {:#04x}", event.event_code),
        }
    }

    /// Feed an already decoded link event
    pub fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::LeConnectionComplete {
                status,
                handle,
                role,
                peer_address_type,
                peer_address,
            } => {
                if status != HCI_SUCCESS {
                    return;
                }
                let (own_type, own_address) = self.own_address();
                info!(
                    "connection {:#06x} to {} ({:?}) as {:?}",
                    handle, peer_address, peer_address_type, role
                );
                let conn = SmConnection::new(
                    handle,
                    role,
                    peer_address_type,
                    peer_address,
                    own_type,
                    own_address,
                );
                self.connections.insert(handle, conn);
                self.progress += 1;
            }
            LinkEvent::DisconnectionComplete { handle, reason, .. } => {
                self.on_disconnect(handle, reason);
            }
            LinkEvent::EncryptionChange {
                status,
                handle,
                enabled,
            } => {
                let Some(conn) = self.connections.get_mut(&handle) else {
                    return;
                };
                conn.encrypted = status == HCI_SUCCESS && enabled;
                info!(
                    "{:#06x}: encryption {}, status {:#04x}",
                    handle,
                    if conn.encrypted { "on" } else { "off" },
                    status
                );
                self.on_encryption_result(handle, status);
            }
            LinkEvent::EncryptionKeyRefreshComplete { status, handle } => {
                if self.connections.contains_key(&handle) {
                    debug!("{:#06x}: key refresh, status {:#04x}", handle, status);
                    self.on_encryption_result(handle, status);
                }
            }
            LinkEvent::LeLongTermKeyRequest { handle, rand, ediv } => {
                self.on_ltk_request(handle, rand, ediv);
            }
            LinkEvent::CommandComplete {
                opcode,
                return_parameters,
            } => match opcode {
                HCI_OPCODE_LE_ENCRYPT => {
                    if let Some((op, result)) = self.aes.complete(&return_parameters) {
                        self.aes_done(op, result);
                    }
                }
                HCI_OPCODE_LE_RAND => {
                    if let Some((op, data)) = self.random.complete(&return_parameters) {
                        self.random_done(op, data);
                    }
                }
                _ => {}
            },
        }
        self.run();
    }

    fn on_disconnect(&mut self, handle: u16, reason: u8) {
        if !self.connections.contains_key(&handle) {
            return;
        }
        info!("connection {:#06x} closed, reason {:#04x}", handle, reason);
        self.random.cancel_connection(handle);
        self.ec.cancel_connection(handle);
        self.resolution.cancel_connection(handle);
        self.reencryption_complete(handle, HCI_ERROR_REMOTE_USER_TERMINATED);
        self.pairing_complete(handle, HCI_ERROR_REMOTE_USER_TERMINATED, 0);
        self.done_for_handle(handle);
        if matches!(self.timeout, Some((owner, _)) if owner == handle) {
            self.timeout_stop();
        }
        self.connections.remove(&handle);
        self.progress += 1;
    }

    /// Encryption Change or Key Refresh Complete
    fn on_encryption_result(&mut self, handle: u16, status: u8) {
        let Some(conn) = self.connections.get(&handle) else {
            return;
        };
        let encrypted = conn.encrypted;
        let responder = conn.is_responder();
        let idle = conn.idle_state();
        match conn.state {
            SmState::Ph4W4ConnectionEncrypted => {
                let status = if encrypted {
                    HCI_SUCCESS
                } else if status == HCI_SUCCESS {
                    HCI_ERROR_AUTHENTICATION_FAILURE
                } else {
                    status
                };
                if status == HCI_SUCCESS {
                    self.set_state(handle, idle);
                } else {
                    // pairing stays possible, other requests are refused
                    self.set_state(handle, SmState::ReencryptionFailed);
                }
                self.reencryption_complete(handle, status);
                let requested = self
                    .connections
                    .get_mut(&handle)
                    .map_or(false, |conn| std::mem::take(&mut conn.pairing_requested));
                if requested {
                    if let Some(conn) = self.connections.get_mut(&handle) {
                        conn.pairing_active = true;
                    }
                    self.pairing_complete(handle, status, 0);
                }
                self.done_for_handle(handle);
            }
            SmState::Ph2W4ConnectionEncrypted => {
                if !encrypted {
                    return;
                }
                let use_sc = self.setup.use_sc;
                if let Some(conn) = self.connections.get_mut(&handle) {
                    conn.secure_connections = use_sc;
                }
                if responder {
                    self.start_key_distribution(handle);
                } else if self.setup.all_keys_received() {
                    // nothing to receive, or every key arrived before encryption
                    self.handle_all_received(handle);
                    self.start_key_distribution(handle);
                } else {
                    self.set_state(handle, SmState::Ph3ReceiveKeys);
                }
                self.timeout_reset(handle);
            }
            _ => {}
        }
    }

    fn on_ltk_request(&mut self, handle: u16, rand: [u8; 8], ediv: u16) {
        let Some(conn) = self.connections.get_mut(&handle) else {
            return;
        };
        debug!("{:#06x}: LTK request, EDIV {:#06x}", handle, ediv);
        let next = match conn.state {
            SmState::ResponderPh2W4LtkRequest => SmState::Ph2CalcStk,
            SmState::ScW4LtkRequestSc => SmState::ResponderPh2SendLtkReply,
            _ => {
                let mut rand_be = rand;
                rand_be.reverse();
                conn.ltk_rand = rand_be;
                conn.ltk_ediv = ediv;
                if ediv != 0 || rand_be != [0; 8] {
                    // legacy key, rebuilt from EDIV and RAND
                    if self.config.reconstruct_ltk_without_db_entry {
                        SmState::ResponderPh0ReceivedLtkRequest
                    } else {
                        match conn.irk_lookup {
                            IrkLookupState::Failed => SmState::ResponderPh0SendLtkRequestedNegativeReply,
                            IrkLookupState::Succeeded => SmState::ResponderPh0ReceivedLtkRequest,
                            _ => SmState::ResponderPh0ReceivedLtkW4Irk,
                        }
                    }
                } else if self.config.secure_connections_enabled {
                    SmState::ScReceivedLtkRequest
                } else {
                    SmState::ResponderPh0SendLtkRequestedNegativeReply
                }
            }
        };
        self.set_state(handle, next);
    }

    /// Feed an SMP PDU received on the security manager channel of `handle`
    pub fn handle_smp_pdu(&mut self, handle: u16, data: &[u8]) {
        let Some(state) = self.connection_state(handle) else {
            warn!("SMP PDU for unknown connection {:#06x}", handle);
            return;
        };
        if state == SmState::Timeout {
            debug!("{:#06x}: SM timed out, PDU dropped", handle);
            return;
        }
        let pdu = match SmpPdu::parse(data) {
            Ok(pdu) => pdu,
            Err(e) => {
                warn!("{:#06x}: invalid SMP PDU: {}", handle, e);
                let known = data.first().map_or(false, |&code| {
                    SMP_PDU_SIZE.get(code as usize).map_or(false, |&size| size != 0)
                });
                let reason = if known {
                    PairingFailure::InvalidParameters
                } else {
                    PairingFailure::CommandNotSupported
                };
                self.pairing_error(handle, reason);
                self.run();
                return;
            }
        };
        debug!("{:#06x} -> {:?}", handle, pdu);
        if self.active == Some(handle) {
            self.timeout_reset(handle);
        }
        self.dispatch_pdu(handle, state, pdu);
        self.run();
    }

    fn dispatch_pdu(&mut self, handle: u16, state: SmState, pdu: SmpPdu) {
        match pdu {
            SmpPdu::KeypressNotification { notification } => {
                self.emit(SmEvent::KeypressNotification {
                    handle,
                    action: notification,
                });
                return;
            }
            SmpPdu::PairingFailed { reason } => {
                let idle = match self.connections.get(&handle) {
                    Some(conn) => conn.idle_state(),
                    None => return,
                };
                match PairingFailure::from_u8(reason) {
                    Some(failure) => info!("{:#06x}: peer failed pairing: {}", handle, failure),
                    None => info!("{:#06x}: peer failed pairing, reason {:#04x}", handle, reason),
                }
                self.reencryption_complete(handle, HCI_ERROR_AUTHENTICATION_FAILURE);
                self.pairing_complete(handle, HCI_ERROR_AUTHENTICATION_FAILURE, reason);
                self.done_for_handle(handle);
                self.set_state(handle, idle);
                return;
            }
            _ => {}
        }

        match state {
            SmState::InitiatorConnected | SmState::ReencryptionFailed if !self.is_responder(handle) => {
                match pdu {
                    SmpPdu::SecurityRequest { auth_req } => self.on_security_request(handle, state, auth_req),
                    _ => self.pdu_in_wrong_state(handle, state),
                }
            }
            SmState::InitiatorPh1W4PairingResponse => match pdu {
                // ignored while our Pairing Request is outstanding
                SmpPdu::SecurityRequest { .. } => {}
                SmpPdu::PairingResponse(features) => self.on_pairing_response(handle, features),
                _ => self.pdu_in_wrong_state(handle, state),
            },
            SmState::InitiatorPh2W4PairingConfirm => match pdu {
                SmpPdu::PairingConfirm { confirm } => {
                    self.setup.peer_confirm = confirm;
                    if confirm == self.setup.local_confirm {
                        // reflected confirm value
                        self.pdu_in_wrong_state(handle, state);
                        return;
                    }
                    self.set_state(handle, SmState::Ph2SendPairingRandom);
                }
                _ => self.pdu_in_wrong_state(handle, state),
            },
            SmState::InitiatorPh2W4PairingRandom | SmState::ResponderPh2W4PairingRandom => match pdu {
                SmpPdu::PairingRandom { random } => {
                    self.setup.peer_random = random;
                    self.set_state(handle, SmState::Ph2C1GetEncC);
                }
                _ => self.pdu_in_wrong_state(handle, state),
            },
            SmState::InitiatorPh4HasLtk | SmState::Ph4W4ConnectionEncrypted => match pdu {
                SmpPdu::SecurityRequest { .. } => {}
                _ => self.pdu_in_wrong_state(handle, state),
            },

            SmState::ResponderIdle
            | SmState::ResponderSendSecurityRequest
            | SmState::ResponderPh1W4PairingRequest
            | SmState::ReencryptionFailed => match pdu {
                SmpPdu::PairingRequest(features) => {
                    let Some(conn) = self.connections.get_mut(&handle) else {
                        return;
                    };
                    conn.preq = features;
                    conn.state = match conn.irk_lookup {
                        IrkLookupState::Succeeded | IrkLookupState::Failed => {
                            SmState::ResponderPh1PairingRequestReceived
                        }
                        _ => SmState::ResponderPh1PairingRequestReceivedW4Irk,
                    };
                    self.progress += 1;
                }
                _ => self.pdu_in_wrong_state(handle, state),
            },
            SmState::ResponderPh1W4PairingConfirm => match pdu {
                SmpPdu::PairingConfirm { confirm } => self.on_legacy_responder_confirm(handle, confirm),
                _ => self.pdu_in_wrong_state(handle, state),
            },

            SmState::ScW4PublicKeyCommand => match pdu {
                SmpPdu::PairingPublicKey { x, y } => self.on_public_key(handle, x, y),
                _ => self.pdu_in_wrong_state(handle, state),
            },
            SmState::ScW4Confirmation => match pdu {
                SmpPdu::PairingConfirm { confirm } => self.on_sc_confirm(handle, confirm),
                _ => self.pdu_in_wrong_state(handle, state),
            },
            SmState::ScW4PairingRandom => match pdu {
                SmpPdu::PairingRandom { random } => self.on_sc_random(handle, random),
                _ => self.pdu_in_wrong_state(handle, state),
            },
            state if state.accepts_early_dhkey_check() => match pdu {
                SmpPdu::PairingDhKeyCheck { check } => {
                    self.setup.dhkey_command_received = true;
                    self.setup.peer_dhkey_check = check;
                    if state == SmState::ScW4DhKeyCheckCommand {
                        self.set_state(handle, SmState::ScW2CalculateF6ToVerifyDhKeyCheck);
                    }
                }
                _ => self.pdu_in_wrong_state(handle, state),
            },

            // keys may overtake the Encryption Change event
            SmState::Ph3ReceiveKeys | SmState::Ph2W4ConnectionEncrypted => self.on_key_pdu(handle, state, pdu),

            _ => self.pdu_in_wrong_state(handle, state),
        }
    }

    fn pdu_in_wrong_state(&mut self, handle: u16, state: SmState) {
        warn!("{:#06x}: unexpected PDU in state {:?}", handle, state);
        self.pairing_error(handle, PairingFailure::UnspecifiedReason);
    }

    fn on_security_request(&mut self, handle: u16, state: SmState, auth_req: AuthReq) {
        if self.config.secure_connections_only && !auth_req.contains(AuthReq::SECURE_CONNECTIONS) {
            self.pairing_error(handle, PairingFailure::AuthenticationRequirements);
            return;
        }
        let Some(conn) = self.connections.get_mut(&handle) else {
            return;
        };
        if state == SmState::ReencryptionFailed {
            conn.state = SmState::InitiatorPh1W2SendPairingRequest;
            self.progress += 1;
            return;
        }
        let stored = conn
            .db_index
            .and_then(|index| self.store.get(index))
            .map(|device| (device.has_ltk(), device.authenticated));
        let (have_ltk, stored_authenticated) = stored.unwrap_or((false, false));
        let mitm_requested = auth_req.contains(AuthReq::MITM);

        conn.security_request_received = true;
        let next = match conn.irk_lookup {
            IrkLookupState::Succeeded
                if have_ltk && !conn.encrypted && (stored_authenticated || !mitm_requested) =>
            {
                SmState::InitiatorPh4HasLtk
            }
            IrkLookupState::Succeeded | IrkLookupState::Failed => SmState::InitiatorPh1W2SendPairingRequest,
            _ => {
                debug!("{:#06x}: security request deferred until the peer is resolved", handle);
                return;
            }
        };
        conn.security_request_received = false;
        conn.state = next;
        self.progress += 1;
    }

    fn on_pairing_response(&mut self, handle: u16, features: super::pdu::PairingFeatures) {
        self.setup.pres = features;
        if let Err(reason) = self.stk_generation_init(handle) {
            self.pairing_error(handle, reason);
            return;
        }
        let method = self.setup.method;
        if method == StkGenerationMethod::PasskeyResponderInput {
            // we display, generate the passkey first
            self.request_connection_random(handle, ConnRandomStep::Tk, 8);
            return;
        }
        if self.setup.use_sc {
            if method == StkGenerationMethod::JustWorks {
                self.set_state(handle, SmState::Ph1W4UserResponse);
                self.trigger_user_response(handle);
                if self.setup.user_response == UserResponse::Idle {
                    self.set_state(handle, SmState::ScSendPublicKeyCommand);
                }
            } else {
                self.set_state(handle, SmState::ScSendPublicKeyCommand);
            }
            return;
        }
        self.set_state(handle, SmState::Ph1W4UserResponse);
        self.trigger_user_response(handle);
        if self.setup.user_response == UserResponse::Idle {
            self.request_connection_random(handle, ConnRandomStep::LocalRandom, 16);
        }
    }

    fn on_legacy_responder_confirm(&mut self, handle: u16, confirm: [u8; 16]) {
        self.setup.peer_confirm = confirm;
        if self.setup.method == StkGenerationMethod::PasskeyInitiatorInput {
            if let Some(peer) = self.peer_info(handle) {
                self.emit(SmEvent::PasskeyDisplayCancel { peer });
            }
        }
        match self.setup.user_response {
            UserResponse::Decline => self.pairing_error(handle, PairingFailure::PasskeyEntryFailed),
            UserResponse::Pending => self.set_state(handle, SmState::Ph1W4UserResponse),
            _ => self.request_connection_random(handle, ConnRandomStep::LocalRandom, 16),
        }
    }

    fn on_public_key(&mut self, handle: u16, x: [u8; 32], y: [u8; 32]) {
        let mut peer_q = [0u8; 64];
        peer_q[..32].copy_from_slice(&x);
        peer_q[32..].copy_from_slice(&y);
        self.setup.peer_q = peer_q;

        if peer_q == *self.ec.public_q() {
            warn!("{:#06x}: peer reflected our public key", handle);
            self.pairing_error(handle, PairingFailure::DhKeyCheckFailed);
            return;
        }
        if !EcEngine::validate_public_key(&peer_q) {
            warn!("{:#06x}: peer public key not on the curve", handle);
            self.pairing_error(handle, PairingFailure::DhKeyCheckFailed);
            return;
        }
        self.ec.start_dhkey(handle, peer_q);

        if self.is_responder(handle) {
            self.set_state(handle, SmState::ScSendPublicKeyCommand);
            return;
        }
        match self.setup.method {
            StkGenerationMethod::JustWorks | StkGenerationMethod::NumericComparison => {
                self.set_state(handle, SmState::ScW4Confirmation)
            }
            StkGenerationMethod::PasskeyResponderInput => self.start_calculating_local_confirm(handle),
            StkGenerationMethod::PasskeyInitiatorInput | StkGenerationMethod::PasskeyBothInput => {
                if self.setup.user_response == UserResponse::Passkey {
                    self.start_calculating_local_confirm(handle);
                } else {
                    self.set_state(handle, SmState::ScW4UserResponse);
                }
            }
            StkGenerationMethod::Oob => {
                self.set_state(handle, SmState::ScW4LocalNonce);
                self.request_connection_random(handle, ConnRandomStep::NonceForRandom, 16);
            }
        }
    }

    fn on_sc_confirm(&mut self, handle: u16, confirm: [u8; 16]) {
        self.setup.peer_confirm = confirm;
        let method = self.setup.method;
        if self.is_responder(handle) {
            let we_input = matches!(
                method,
                StkGenerationMethod::PasskeyResponderInput | StkGenerationMethod::PasskeyBothInput
            );
            if we_input && self.setup.user_response != UserResponse::Passkey {
                self.set_state(handle, SmState::ScW4UserResponse);
                return;
            }
            self.start_calculating_local_confirm(handle);
        } else if method.is_just_works_or_numeric_comparison() {
            self.set_state(handle, SmState::ScW4LocalNonce);
            self.request_connection_random(handle, ConnRandomStep::NonceForRandom, 16);
        } else {
            self.set_state(handle, SmState::ScSendPairingRandom);
        }
    }

    fn on_sc_random(&mut self, handle: u16, random: [u8; 16]) {
        self.setup.peer_nonce = random;
        let responder = self.is_responder(handle);
        let method = self.setup.method;
        if (!responder && method.is_just_works_or_numeric_comparison()) || method.is_passkey_entry() {
            self.set_state(handle, SmState::ScW2CmacForCheckConfirmation);
            return;
        }
        if method == StkGenerationMethod::Oob {
            // our random only counts if the peer received our OOB data
            let peer_has_our_data = if responder {
                self.setup.preq.has_oob_data()
            } else {
                self.setup.pres.has_oob_data()
            };
            let local_random = if peer_has_our_data { self.sc_oob_random } else { [0; 16] };
            if responder {
                self.setup.rb = local_random;
            } else {
                self.setup.ra = local_random;
            }
            if self.setup.have_oob_data {
                self.set_state(handle, SmState::ScW2CmacForCheckConfirmation);
                return;
            }
        }
        self.state_after_receiving_random(handle);
    }

    /// Phase 3 key PDUs from the peer
    fn on_key_pdu(&mut self, handle: u16, state: SmState, pdu: SmpPdu) {
        let key = match pdu {
            SmpPdu::EncryptionInformation { ltk } => {
                self.setup.peer_ltk = ltk;
                DistributedKeys::ENCRYPTION_INFORMATION
            }
            SmpPdu::MasterIdentification { ediv, rand } => {
                self.setup.peer_ediv = ediv;
                self.setup.peer_rand = rand;
                DistributedKeys::MASTER_IDENTIFICATION
            }
            SmpPdu::IdentityInformation { irk } => {
                self.setup.peer_irk = irk;
                DistributedKeys::IDENTITY_INFORMATION
            }
            SmpPdu::IdentityAddressInformation { address_type, address } => {
                self.setup.peer_address_type = address_type;
                self.setup.peer_address = address;
                DistributedKeys::IDENTITY_ADDRESS_INFORMATION
            }
            SmpPdu::SigningInformation { csrk } => {
                self.setup.peer_csrk = csrk;
                DistributedKeys::SIGNING_INFORMATION
            }
            _ => {
                self.pdu_in_wrong_state(handle, state);
                return;
            }
        };
        let expected = self.setup.key_distribution_expected;
        if !expected.contains(key) || self.setup.key_distribution_received.contains(key) {
            warn!("{:#06x}: key {:?} was not expected", handle, key);
            self.pairing_error(handle, PairingFailure::UnspecifiedReason);
            return;
        }
        self.setup.key_distribution_received.insert(key);
        // stored keys are handled once the link is encrypted
        if state == SmState::Ph2W4ConnectionEncrypted || !self.setup.all_keys_received() {
            return;
        }

        self.handle_all_received(handle);
        if self.is_responder(handle) {
            self.complete_responder(handle);
        } else {
            self.start_key_distribution(handle);
        }
    }
}
