//! Continuations of AES, CMAC, random and DH key results

use super::crypto::*;
use super::engine::*;
use super::events::SmEvent;
use super::keys::BondedDevice;
use super::manager::{DkgState, ScOobState, SecurityManager};
use super::state::SmState;
use super::types::*;
use log::{debug, error, info, warn};

fn array_16(data: &[u8]) -> [u8; 16] {
    let mut out = [0u8; 16];
    let len = data.len().min(16);
    out[..len].copy_from_slice(&data[..len]);
    out
}

impl SecurityManager {
    /// Dispatch an LE Encrypt result
    pub(super) fn aes_done(&mut self, op: AesOp, result: Result<[u8; 16], u8>) {
        match op {
            AesOp::Cmac => match result {
                Ok(ciphertext) => {
                    if let Some((cmac_op, mac)) = self.cmac.handle_aes_result(ciphertext) {
                        self.cmac_done(cmac_op, mac);
                    }
                }
                Err(_) => {
                    if let Some(cmac_op) = self.cmac.abort() {
                        self.cmac_failed(cmac_op);
                    }
                }
            },
            AesOp::Dkg(step) => match (step, result) {
                (DkgStep::Irk, Ok(irk)) => {
                    self.persistent_irk = irk;
                    debug!("IRK {}", hex::encode(irk));
                    self.dkg = DkgState::CalcDhk;
                }
                (DkgStep::Dhk, Ok(dhk)) => {
                    self.persistent_dhk = dhk;
                    debug!("DHK {}", hex::encode(dhk));
                    info!("local key hierarchy ready");
                    self.dkg = DkgState::Ready;
                }
                (DkgStep::Irk, Err(_)) => self.dkg = DkgState::CalcIrk,
                (DkgStep::Dhk, Err(_)) => self.dkg = DkgState::CalcDhk,
            },
            AesOp::RandomAddressHash => self.random_address_aes_done(result),
            AesOp::AddressResolution => self.address_resolution_aes_done(result),
            AesOp::Connection { handle, step } => {
                if self.active != Some(handle) {
                    debug!("dropping AES result for {:#06x}", handle);
                    return;
                }
                match result {
                    Ok(ciphertext) => self.connection_aes_done(handle, step, ciphertext),
                    Err(status) => {
                        error!("LE Encrypt failed for {:#06x}, status {:#04x}", handle, status);
                        match step {
                            ConnAesStep::Ph4Y | ConnAesStep::Ph4Ltk => {
                                self.set_state(handle, SmState::ResponderPh0SendLtkRequestedNegativeReply);
                            }
                            _ => self.pairing_error(handle, PairingFailure::UnspecifiedReason),
                        }
                    }
                }
            }
        }
    }

    fn connection_aes_done(&mut self, handle: u16, step: ConnAesStep, ciphertext: [u8; 16]) {
        let responder = self.is_responder(handle);
        let key_size = self.connections.get(&handle).map_or(0, |conn| conn.key_size);
        match step {
            ConnAesStep::ConfirmA => {
                self.setup.c1_t3 = c1_t3(&ciphertext, &self.setup.m_address, &self.setup.s_address);
                self.set_state(handle, SmState::Ph2C1GetEncB);
            }
            ConnAesStep::ConfirmB => {
                self.setup.local_confirm = ciphertext;
                self.set_state(handle, SmState::Ph2C1SendPairingConfirm);
            }
            ConnAesStep::CheckC => {
                self.setup.c1_t3 = c1_t3(&ciphertext, &self.setup.m_address, &self.setup.s_address);
                self.set_state(handle, SmState::Ph2C1GetEncD);
            }
            ConnAesStep::CheckD => {
                if ciphertext != self.setup.peer_confirm {
                    self.pairing_error(handle, PairingFailure::ConfirmValueFailed);
                    return;
                }
                let next = if responder {
                    SmState::Ph2SendPairingRandom
                } else {
                    SmState::Ph2CalcStk
                };
                self.set_state(handle, next);
            }
            ConnAesStep::Stk => {
                let mut stk = ciphertext;
                truncate_key(&mut stk, key_size);
                debug!("STK {}", hex::encode(stk));
                self.setup.ltk = stk;
                let next = if responder {
                    SmState::ResponderPh2SendLtkReply
                } else {
                    SmState::InitiatorPh3SendStartEncryption
                };
                self.set_state(handle, next);
            }
            ConnAesStep::Ph3Y => {
                self.setup.local_y = dm_y(&ciphertext);
                self.setup.local_ediv = self.setup.local_y ^ self.setup.local_div;
                self.set_state(handle, SmState::Ph3LtkGetEnc);
            }
            ConnAesStep::Ph3Ltk => {
                let mut ltk = ciphertext;
                truncate_key(&mut ltk, key_size);
                self.setup.ltk = ltk;
                self.set_state(handle, SmState::Ph3CsrkGetEnc);
            }
            ConnAesStep::Ph3Csrk => {
                self.setup.local_csrk = ciphertext;
                self.set_state(handle, SmState::Ph3DistributeKeys);
            }
            ConnAesStep::Ph4Y => {
                self.setup.local_y = dm_y(&ciphertext);
                self.setup.local_div = self.setup.local_y ^ self.setup.local_ediv;
                self.set_state(handle, SmState::ResponderPh4LtkGetEnc);
            }
            ConnAesStep::Ph4Ltk => {
                let mut ltk = ciphertext;
                truncate_key(&mut ltk, key_size);
                debug!("reconstructed LTK {}", hex::encode(ltk));
                self.setup.ltk = ltk;
                self.set_state(handle, SmState::ResponderPh4SendLtkReply);
            }
        }
    }

    /// Dispatch a finished random request
    pub(super) fn random_done(&mut self, op: RandomOp, data: Vec<u8>) {
        match op {
            RandomOp::EcSeed => self.ec.generate(&data),
            RandomOp::RandomAddress => self.random_address_random_done(&data),
            RandomOp::ScOobRandom => {
                if self.sc_oob == ScOobState::W4Random {
                    self.sc_oob_random = array_16(&data);
                    self.sc_oob = ScOobState::W2CalcConfirm;
                }
            }
            RandomOp::Connection { handle, step } => {
                if self.active != Some(handle) {
                    debug!("dropping random for {:#06x}", handle);
                    return;
                }
                self.connection_random_done(handle, step, &data);
            }
        }
    }

    fn connection_random_done(&mut self, handle: u16, step: ConnRandomStep, data: &[u8]) {
        match step {
            ConnRandomStep::Tk => {
                let passkey = self
                    .config
                    .fixed_passkey
                    .unwrap_or_else(|| passkey_from_random(data));
                self.setup.tk = tk_from_passkey(passkey);
                if self.is_responder(handle) {
                    self.set_state(handle, SmState::ResponderPh1SendPairingResponse);
                } else if self.setup.use_sc {
                    self.set_state(handle, SmState::ScSendPublicKeyCommand);
                } else {
                    self.set_state(handle, SmState::Ph1W4UserResponse);
                    self.trigger_user_response(handle);
                    if self.setup.user_response == UserResponse::Idle {
                        self.request_connection_random(handle, ConnRandomStep::LocalRandom, 16);
                    }
                }
            }
            ConnRandomStep::LocalRandom => {
                self.setup.local_random = array_16(data);
                self.set_state(handle, SmState::Ph2C1GetEncA);
            }
            ConnRandomStep::NonceForConfirm => {
                self.setup.local_nonce = array_16(data);
                self.set_state(handle, SmState::ScW2CmacForConfirmation);
            }
            ConnRandomStep::NonceForRandom => {
                self.setup.local_nonce = array_16(data);
                self.set_state(handle, SmState::ScSendPairingRandom);
            }
            ConnRandomStep::Ph3Rand => {
                self.setup.local_rand.copy_from_slice(&data[..8]);
                self.request_connection_random(handle, ConnRandomStep::Ph3Div, 2);
            }
            ConnRandomStep::Ph3Div => {
                self.setup.local_div = u16::from_be_bytes([data[0], data[1]]);
                self.set_state(handle, SmState::Ph3YGetEnc);
            }
            ConnRandomStep::ScCsrk => {
                self.setup.local_csrk = array_16(data);
                self.set_state(handle, SmState::Ph3DistributeKeys);
            }
        }
    }

    fn cmac_failed(&mut self, op: CmacOp) {
        match op {
            CmacOp::Connection { handle, .. } => {
                if self.active == Some(handle) {
                    self.pairing_error(handle, PairingFailure::UnspecifiedReason);
                }
            }
            CmacOp::ScOobConfirm => self.sc_oob = ScOobState::Idle,
            CmacOp::SignedWrite => warn!("signed write CMAC failed"),
        }
    }

    fn cmac_done(&mut self, op: CmacOp, mac: [u8; 16]) {
        match op {
            CmacOp::SignedWrite => self.emit(SmEvent::SignedWriteSignature { mac }),
            CmacOp::ScOobConfirm => {
                self.sc_oob = ScOobState::Idle;
                let random = self.sc_oob_random;
                self.emit(SmEvent::ScOobData { confirm: mac, random });
            }
            CmacOp::Connection { handle, step } => {
                if self.active != Some(handle) {
                    debug!("dropping CMAC result for {:#06x}", handle);
                    return;
                }
                self.sc_cmac_done(handle, step, mac);
            }
        }
    }

    fn sc_cmac_done(&mut self, handle: u16, step: ScCmacStep, mac: [u8; 16]) {
        let responder = self.is_responder(handle);
        match step {
            ScCmacStep::LocalConfirm => {
                self.setup.local_confirm = mac;
                self.set_state(handle, SmState::ScSendConfirmation);
            }
            ScCmacStep::CheckConfirm => {
                if mac != self.setup.peer_confirm {
                    self.pairing_error(handle, PairingFailure::ConfirmValueFailed);
                    return;
                }
                self.state_after_receiving_random(handle);
            }
            ScCmacStep::G2 => {
                let value = g2_value(&mac);
                self.setup.tk = tk_from_passkey(value);
                self.set_state(handle, SmState::ScW4UserResponse);
                self.trigger_user_response(handle);
            }
            ScCmacStep::F5Salt => {
                self.setup.t = mac;
                self.set_state(handle, SmState::ScW2CalculateF5MacKey);
            }
            ScCmacStep::F5MacKey => {
                self.setup.mackey = mac;
                self.set_state(handle, SmState::ScW2CalculateF5Ltk);
            }
            ScCmacStep::F5Ltk => {
                // the link key derivation uses the full LTK
                self.setup.local_ltk = mac;
                let mut ltk = mac;
                let key_size = self.connections.get(&handle).map_or(0, |conn| conn.key_size);
                truncate_key(&mut ltk, key_size);
                debug!("LTK {}", hex::encode(ltk));
                self.setup.ltk = ltk;
                self.set_state(handle, SmState::ScW2CalculateF6ForDhKeyCheck);
            }
            ScCmacStep::F6ForDhKeyCheck => {
                self.setup.local_dhkey_check = mac;
                let next = if !responder {
                    SmState::ScSendDhKeyCheckCommand
                } else if self.setup.dhkey_command_received {
                    SmState::ScW2CalculateF6ToVerifyDhKeyCheck
                } else {
                    SmState::ScW4DhKeyCheckCommand
                };
                self.set_state(handle, next);
            }
            ScCmacStep::F6ToVerifyDhKeyCheck => {
                if mac != self.setup.peer_dhkey_check {
                    self.pairing_error(handle, PairingFailure::DhKeyCheckFailed);
                    return;
                }
                let next = if responder {
                    SmState::ScSendDhKeyCheckCommand
                } else {
                    SmState::InitiatorPh3SendStartEncryption
                };
                self.set_state(handle, next);
            }
            ScCmacStep::IlkH6 | ScCmacStep::IlkH7 => {
                self.setup.t = mac;
                self.set_state(handle, SmState::ScW2CalculateBrEdrLinkKey);
            }
            ScCmacStep::BrEdrLinkKey => {
                info!("{:#06x}: derived BR/EDR link key", handle);
                let authenticated = self
                    .connections
                    .get(&handle)
                    .map_or(false, |conn| conn.authenticated);
                if let Some(peer) = self.peer_info(handle) {
                    self.emit(SmEvent::LinkKeyDerived {
                        peer,
                        link_key: mac,
                        authenticated,
                    });
                }
                let idle = if responder {
                    SmState::ResponderIdle
                } else {
                    SmState::InitiatorConnected
                };
                self.set_state(handle, idle);
                self.pairing_complete(handle, 0, 0);
                self.done_for_handle(handle);
            }
        }
    }

    /// DH key from the EC engine, `None` if the peer key was unusable
    pub(super) fn on_dhkey(&mut self, handle: u16, dhkey: Option<[u8; 32]>) {
        if self.active != Some(handle) {
            return;
        }
        let Some(dhkey) = dhkey else {
            self.pairing_error(handle, PairingFailure::DhKeyCheckFailed);
            return;
        };
        debug!("DHKey {}", hex::encode(dhkey));
        self.setup.dhkey = dhkey;
        self.setup.dhkey_calculated = true;
        if self.connection_state(handle) == Some(SmState::ScW4CalculateDhKey) {
            self.set_state(handle, SmState::ScW2CalculateF5Salt);
        }
    }

    pub(super) fn start_calculating_local_confirm(&mut self, handle: u16) {
        self.set_state(handle, SmState::ScW4LocalNonce);
        self.request_connection_random(handle, ConnRandomStep::NonceForConfirm, 16);
    }

    pub(super) fn prepare_dhkey_check(&mut self, handle: u16) {
        let next = if self.setup.dhkey_calculated {
            SmState::ScW2CalculateF5Salt
        } else {
            SmState::ScW4CalculateDhKey
        };
        self.set_state(handle, next);
    }

    /// Next step once the peer's Pairing Random checked out
    pub(super) fn state_after_receiving_random(&mut self, handle: u16) {
        if self.is_responder(handle) {
            if self.setup.method == StkGenerationMethod::Oob {
                self.set_state(handle, SmState::ScW4LocalNonce);
                self.request_connection_random(handle, ConnRandomStep::NonceForRandom, 16);
            } else {
                self.set_state(handle, SmState::ScSendPairingRandom);
            }
            return;
        }
        match self.setup.method {
            StkGenerationMethod::NumericComparison => self.set_state(handle, SmState::ScW2CalculateG2),
            method if method.is_passkey_entry() && self.setup.passkey_bit < super::constants::SMP_PASSKEY_BITS => {
                self.start_calculating_local_confirm(handle)
            }
            _ => self.prepare_dhkey_check(handle),
        }
    }

    /// Start phase 3 by generating the keys we distribute
    pub(super) fn start_key_distribution(&mut self, handle: u16) {
        if self.setup.use_sc {
            self.request_connection_random(handle, ConnRandomStep::ScCsrk, 16);
        } else {
            self.request_connection_random(handle, ConnRandomStep::Ph3Rand, 8);
        }
    }

    /// Store what the peer distributed
    pub(super) fn handle_all_received(&mut self, handle: u16) {
        let received = self.setup.key_distribution_received;
        if !received.contains(DistributedKeys::IDENTITY_INFORMATION) {
            self.setup.peer_irk = [0; 16];
        }
        if !self.setup.bonding_enabled() {
            info!("bonding not enabled, received keys are not stored");
            if let Some(conn) = self.connections.get_mut(&handle) {
                conn.db_index = None;
            }
            return;
        }
        let peer_type = self.setup.peer_address_type;
        let peer_address = self.setup.peer_address;
        let peer_irk = self.setup.peer_irk;

        if received.contains(DistributedKeys::IDENTITY_INFORMATION) {
            // a stale record for this identity with another IRK is dropped
            if let Some(index) = self.store.get_by_address(peer_type, &peer_address) {
                let stale = self.store.get(index).map_or(false, |device| device.irk != peer_irk);
                if stale {
                    info!("replacing bonding for {} with a new IRK", peer_address);
                    self.store.remove(index);
                }
            }
        }

        let existing = if received.contains(DistributedKeys::IDENTITY_INFORMATION) {
            self.store
                .iterate()
                .find(|(_, device)| device.address == peer_address && device.irk == peer_irk)
                .map(|(index, _)| index)
        } else {
            None
        };
        let existing = existing.or_else(|| {
            if peer_type.is_public() {
                self.store
                    .iterate()
                    .find(|(_, device)| device.address_type.is_public() && device.address == peer_address)
                    .map(|(index, _)| index)
            } else {
                None
            }
        });

        let Some(conn) = self.connections.get(&handle) else {
            return;
        };
        let mut device = existing
            .and_then(|index| self.store.get(index).cloned())
            .unwrap_or_else(|| BondedDevice::new(peer_type, peer_address, peer_irk));
        device.address_type = peer_type;
        device.address = peer_address;
        device.irk = peer_irk;
        if self.setup.key_distribution_sent.contains(DistributedKeys::SIGNING_INFORMATION) {
            device.local_csrk = Some(self.setup.local_csrk);
            device.local_counter = 0;
        }
        if received.contains(DistributedKeys::SIGNING_INFORMATION) {
            device.remote_csrk = Some(self.setup.peer_csrk);
            device.remote_counter = 0;
        }
        let legacy_keys = DistributedKeys::ENCRYPTION_INFORMATION | DistributedKeys::MASTER_IDENTIFICATION;
        if self.setup.use_sc {
            device.ltk = self.setup.ltk;
            device.ediv = 0;
            device.rand = [0; 8];
        } else if received.contains(legacy_keys) {
            device.ltk = self.setup.peer_ltk;
            device.ediv = self.setup.peer_ediv;
            device.rand = self.setup.peer_rand;
        }
        device.key_size = conn.key_size;
        device.authenticated = conn.authenticated;
        device.authorized = conn.authorization == AuthorizationState::Granted;
        device.secure_connections = self.setup.use_sc;

        let stored = match existing {
            Some(index) => self.store.update(index, device).map(|_| index),
            None => self.store.put(device),
        };
        let index = match stored {
            Ok(index) => index,
            Err(e) => {
                error!("failed to store bonding for {}: {}", peer_address, e);
                return;
            }
        };
        info!("bonding for {} stored at index {}", peer_address, index);

        if let Some(conn) = self.connections.get_mut(&handle) {
            conn.irk_lookup = IrkLookupState::Succeeded;
            conn.db_index = Some(index);
        }
        if let Some(peer) = self.peer_info(handle) {
            self.emit(SmEvent::IdentityCreated {
                peer,
                identity_address_type: peer_type,
                identity_address: peer_address,
                index,
            });
        }
    }

    /// Derive a BR/EDR link key after this pairing
    fn ctkd_requested(&self) -> bool {
        let have_identity = self
            .setup
            .key_distribution_received
            .contains(DistributedKeys::IDENTITY_ADDRESS_INFORMATION)
            || self.setup.peer_address_type.is_public();
        self.config.cross_transport_key_derivation
            && self.setup.use_sc
            && self.setup.bonding_enabled()
            && have_identity
    }

    fn ctkd_state(&self) -> SmState {
        if self.setup.use_h7() {
            SmState::ScW2CalculateIlkUsingH7
        } else {
            SmState::ScW2CalculateIlkUsingH6
        }
    }

    pub(super) fn complete_responder(&mut self, handle: u16) {
        if self.ctkd_requested() {
            let next = self.ctkd_state();
            self.set_state(handle, next);
            return;
        }
        self.set_state(handle, SmState::ResponderIdle);
        self.pairing_complete(handle, 0, 0);
        self.done_for_handle(handle);
    }

    pub(super) fn complete_initiator(&mut self, handle: u16) {
        if self.ctkd_requested() {
            let next = self.ctkd_state();
            self.set_state(handle, next);
            return;
        }
        self.set_state(handle, SmState::InitiatorConnected);
        self.pairing_complete(handle, 0, 0);
        self.done_for_handle(handle);
    }
}
