//! Scheduler
//!
//! `run` is called after every input. It hands results to waiting engines,
//! starts new AES, CMAC and random operations and steps the connection that
//! owns the setup context, until a pass makes no progress.

use super::constants::*;
use super::crypto::*;
use super::engine::*;
use super::manager::{DkgState, ScOobState, SecurityManager};
use super::pairing::key_distribution_for_auth_req;
use super::pdu::SmpPdu;
use super::state::SmState;
use super::types::*;
use crate::gap::{AddressType, RandomAddressMode};
use crate::hci::HciCommand;
use log::{debug, info};

/// Passes per `run` call before the scheduler gives up for now
const MAX_RUN_PASSES: usize = 32;

fn reversed<const N: usize>(value: &[u8; N]) -> [u8; N] {
    let mut out = *value;
    out.reverse();
    out
}

fn x_coordinate(q: &[u8; 64]) -> [u8; 32] {
    let mut x = [0u8; 32];
    x.copy_from_slice(&q[..32]);
    x
}

impl SecurityManager {
    pub(super) fn run(&mut self) {
        for _ in 0..MAX_RUN_PASSES {
            let before = self.progress;
            self.run_once();
            if self.progress == before {
                break;
            }
        }
        self.flush_commands();
    }

    fn run_once(&mut self) {
        self.flush_commands();
        if !self.outbox.is_empty() {
            // controller busy
            return;
        }

        if let Some((handle, dhkey)) = self.ec.take_dhkey() {
            self.on_dhkey(handle, dhkey);
        }

        self.run_key_derivation();
        self.run_random_address_update();
        self.run_address_resolution();

        // CMAC blocks interleave with the key derivation, address and
        // resolution AES above. A running CMAC only holds back the active
        // connection below.
        if !self.cmac.is_idle() && self.aes.is_idle() {
            if let Some((key, plaintext)) = self.cmac.next_block() {
                self.start_aes(&key, &plaintext, AesOp::Cmac);
            }
        }

        self.run_sc_oob();
        self.run_basic();
        self.run_active_connection();

        if let Some(command) = self.random.poll() {
            self.queue_command(command);
        }
        self.flush_commands();
    }

    /// IRK = d1(IR, 1, 0), DHK = d1(IR, 3, 0)
    fn run_key_derivation(&mut self) {
        if !self.aes.is_idle() {
            return;
        }
        let ir = self.config.ir();
        match self.dkg {
            DkgState::CalcIrk => {
                let plaintext = d1_d_prime(SMP_DKG_IRK_DIV, 0);
                if self.start_aes(&ir, &plaintext, AesOp::Dkg(DkgStep::Irk)) {
                    self.dkg = DkgState::W4Irk;
                }
            }
            DkgState::CalcDhk => {
                let plaintext = d1_d_prime(SMP_DKG_DHK_DIV, 0);
                if self.start_aes(&ir, &plaintext, AesOp::Dkg(DkgStep::Dhk)) {
                    self.dkg = DkgState::W4Dhk;
                }
            }
            _ => {}
        }
    }

    fn run_sc_oob(&mut self) {
        if self.sc_oob != ScOobState::W2CalcConfirm || !self.cmac.is_idle() {
            return;
        }
        match self.ec.state() {
            EcKeyState::Done => {}
            EcKeyState::Idle => {
                self.ec_generate_new_key();
                return;
            }
            EcKeyState::W4Seed => return,
        }
        let x = x_coordinate(self.ec.public_q());
        let message = f4_message(&x, &x, 0);
        if self
            .cmac
            .start_with_message(self.sc_oob_random, message, CmacOp::ScOobConfirm)
            .is_ok()
        {
            self.sc_oob = ScOobState::W4Confirm;
            // first block goes out on the next pass
            self.progress += 1;
        }
    }

    /// Work that does not need the setup context
    fn run_basic(&mut self) {
        let handles: Vec<u16> = self.connections.keys().copied().collect();
        for handle in handles {
            let Some(conn) = self.connections.get(&handle) else {
                continue;
            };
            match conn.state {
                SmState::SendPairingFailed => {
                    if !self.link.can_send_pdu(handle) {
                        self.link.request_can_send_now(handle);
                        continue;
                    }
                    let reason = conn.pairing_failed_reason;
                    let idle = conn.idle_state();
                    self.set_state(handle, idle);
                    self.send_pdu(handle, SmpPdu::PairingFailed { reason });
                    self.pairing_complete(
                        handle,
                        crate::hci::constants::HCI_ERROR_AUTHENTICATION_FAILURE,
                        reason,
                    );
                    self.done_for_handle(handle);
                }
                SmState::ResponderPh0SendLtkRequestedNegativeReply => {
                    self.set_state(handle, SmState::ResponderIdle);
                    self.queue_command(HciCommand::LeLongTermKeyRequestNegativeReply { handle });
                    self.done_for_handle(handle);
                }
                _ => {}
            }
        }
    }

    /// Hand the setup context to the first connection waiting for it
    fn activate_connection(&mut self) {
        if self.active.is_some() {
            return;
        }
        let waiting: Vec<(u16, SmState)> = self
            .connections
            .values()
            .filter(|conn| conn.state.needs_setup())
            .map(|conn| (conn.handle, conn.state))
            .collect();
        for (handle, state) in waiting {
            if state.needs_ec_key() && self.config.secure_connections_enabled {
                match self.ec.state() {
                    EcKeyState::Done => {}
                    EcKeyState::Idle => {
                        self.ec_generate_new_key();
                        continue;
                    }
                    EcKeyState::W4Seed => continue,
                }
            }
            if self.acquire_setup(handle).is_ok() {
                return;
            }
        }
    }

    fn run_active_connection(&mut self) {
        self.activate_connection();
        let Some(handle) = self.active else {
            return;
        };
        if !self.link.can_send_pdu(handle) {
            self.link.request_can_send_now(handle);
            return;
        }
        if let Some(notification) = self.setup.keypress_queue.pop_front() {
            self.send_pdu(handle, SmpPdu::KeypressNotification { notification });
            return;
        }
        if !self.cmac.is_idle() {
            return;
        }
        self.step_connection(handle);
    }

    /// One step of the connection owning the setup context
    fn step_connection(&mut self, handle: u16) {
        let Some(conn) = self.connections.get(&handle) else {
            return;
        };
        let state = conn.state;
        let responder = conn.is_responder();

        match state {
            // Secure Connections CMAC steps
            SmState::ScW2CmacForConfirmation => {
                self.set_state(handle, SmState::ScW4CmacForConfirmation);
                let mut z = 0;
                if self.setup.method.is_passkey_entry() {
                    z = passkey_round_z(self.setup.passkey(), self.setup.passkey_bit);
                    self.setup.passkey_bit += 1;
                }
                let u = x_coordinate(self.ec.public_q());
                let v = x_coordinate(&self.setup.peer_q);
                let key = self.setup.local_nonce;
                self.start_cmac(handle, key, f4_message(&u, &v, z), ScCmacStep::LocalConfirm);
            }
            SmState::ScW2CmacForCheckConfirmation => {
                self.set_state(handle, SmState::ScW4CmacForCheckConfirmation);
                let peer_x = x_coordinate(&self.setup.peer_q);
                if self.setup.method == StkGenerationMethod::Oob {
                    let key = if responder { self.setup.ra } else { self.setup.rb };
                    self.start_cmac(handle, key, f4_message(&peer_x, &peer_x, 0), ScCmacStep::CheckConfirm);
                } else {
                    let mut z = 0;
                    if self.setup.method.is_passkey_entry() {
                        let bit = self.setup.passkey_bit.saturating_sub(1);
                        z = passkey_round_z(self.setup.passkey(), bit);
                    }
                    let local_x = x_coordinate(self.ec.public_q());
                    let key = self.setup.peer_nonce;
                    self.start_cmac(handle, key, f4_message(&peer_x, &local_x, z), ScCmacStep::CheckConfirm);
                }
            }
            SmState::ScW2CalculateG2 => {
                self.set_state(handle, SmState::ScW4CalculateG2);
                let local_x = x_coordinate(self.ec.public_q());
                let peer_x = x_coordinate(&self.setup.peer_q);
                let (key, message) = if responder {
                    (self.setup.peer_nonce, g2_message(&peer_x, &local_x, &self.setup.local_nonce))
                } else {
                    (self.setup.local_nonce, g2_message(&local_x, &peer_x, &self.setup.peer_nonce))
                };
                self.start_cmac(handle, key, message, ScCmacStep::G2);
            }
            SmState::ScW2CalculateF5Salt => {
                self.set_state(handle, SmState::ScW4CalculateF5Salt);
                let message = self.setup.dhkey.to_vec();
                self.start_cmac(handle, SMP_F5_SALT, message, ScCmacStep::F5Salt);
            }
            SmState::ScW2CalculateF5MacKey => {
                self.set_state(handle, SmState::ScW4CalculateF5MacKey);
                let message = self.f5_message_for(0, responder);
                self.start_cmac(handle, self.setup.t, message, ScCmacStep::F5MacKey);
            }
            SmState::ScW2CalculateF5Ltk => {
                self.set_state(handle, SmState::ScW4CalculateF5Ltk);
                let message = self.f5_message_for(1, responder);
                self.start_cmac(handle, self.setup.t, message, ScCmacStep::F5Ltk);
            }
            SmState::ScW2CalculateF6ForDhKeyCheck => {
                self.set_state(handle, SmState::ScW4CalculateF6ForDhKeyCheck);
                let (a, b) = self.c1_addresses();
                let setup = &self.setup;
                let message = if responder {
                    f6_message(&setup.local_nonce, &setup.peer_nonce, &setup.ra, &setup.pres.f6_io_cap(), &b, &a)
                } else {
                    f6_message(&setup.local_nonce, &setup.peer_nonce, &setup.rb, &setup.preq.f6_io_cap(), &a, &b)
                };
                self.start_cmac(handle, self.setup.mackey, message, ScCmacStep::F6ForDhKeyCheck);
            }
            SmState::ScW2CalculateF6ToVerifyDhKeyCheck => {
                self.set_state(handle, SmState::ScW4CalculateF6ToVerifyDhKeyCheck);
                let (a, b) = self.c1_addresses();
                let setup = &self.setup;
                let message = if responder {
                    f6_message(&setup.peer_nonce, &setup.local_nonce, &setup.rb, &setup.preq.f6_io_cap(), &a, &b)
                } else {
                    f6_message(&setup.peer_nonce, &setup.local_nonce, &setup.ra, &setup.pres.f6_io_cap(), &b, &a)
                };
                self.start_cmac(handle, self.setup.mackey, message, ScCmacStep::F6ToVerifyDhKeyCheck);
            }
            SmState::ScW2CalculateIlkUsingH6 => {
                self.set_state(handle, SmState::ScW4CalculateIlk);
                let key = self.setup.local_ltk;
                self.start_cmac(handle, key, h6_message(SMP_KEY_ID_TMP1), ScCmacStep::IlkH6);
            }
            SmState::ScW2CalculateIlkUsingH7 => {
                self.set_state(handle, SmState::ScW4CalculateIlk);
                let message = self.setup.local_ltk.to_vec();
                self.start_cmac(handle, h7_salt(SMP_KEY_ID_TMP1), message, ScCmacStep::IlkH7);
            }
            SmState::ScW2CalculateBrEdrLinkKey => {
                self.set_state(handle, SmState::ScW4CalculateBrEdrLinkKey);
                let ilk = self.setup.t;
                self.start_cmac(handle, ilk, h6_message(SMP_KEY_ID_LEBR), ScCmacStep::BrEdrLinkKey);
            }

            // initiator
            SmState::InitiatorPh4HasLtk => {
                self.setup.reset();
                self.load_security_info(handle);
                self.set_state(handle, SmState::Ph4W4ConnectionEncrypted);
                info!("{:#06x}: encrypting with stored LTK", handle);
                self.queue_command(HciCommand::LeStartEncryption {
                    handle,
                    rand: reversed(&self.setup.peer_rand),
                    ediv: self.setup.peer_ediv,
                    ltk: reversed(&self.setup.peer_ltk),
                });
                self.reencryption_started(handle);
            }
            SmState::InitiatorPh1W2SendPairingRequest => {
                self.setup.reset();
                self.init_setup(handle);
                if let Some(conn) = self.connections.get_mut(&handle) {
                    conn.pairing_requested = false;
                }
                self.set_state(handle, SmState::InitiatorPh1W4PairingResponse);
                self.send_pdu(handle, SmpPdu::PairingRequest(self.setup.preq));
                self.timeout_reset(handle);
                self.pairing_started(handle);
            }
            SmState::InitiatorPh3SendStartEncryption => {
                self.set_state(handle, SmState::Ph2W4ConnectionEncrypted);
                self.queue_command(HciCommand::LeStartEncryption {
                    handle,
                    rand: [0; 8],
                    ediv: 0,
                    ltk: reversed(&self.setup.ltk),
                });
            }

            // Secure Connections PDUs
            SmState::ScSendPublicKeyCommand => {
                let q = *self.ec.public_q();
                let mut x = [0u8; 32];
                let mut y = [0u8; 32];
                x.copy_from_slice(&q[..32]);
                y.copy_from_slice(&q[32..]);
                let method = self.setup.method;
                if method.is_passkey_entry() {
                    self.setup.ra = self.setup.tk;
                    self.setup.rb = self.setup.tk;
                    self.setup.passkey_bit = 0;
                }
                if responder && method.is_just_works_or_numeric_comparison() {
                    self.start_calculating_local_confirm(handle);
                } else {
                    let next = if !responder {
                        SmState::ScW4PublicKeyCommand
                    } else if method == StkGenerationMethod::Oob {
                        SmState::ScW4PairingRandom
                    } else {
                        SmState::ScW4Confirmation
                    };
                    self.set_state(handle, next);
                }
                if method.is_passkey_entry() {
                    self.trigger_user_response(handle);
                }
                self.send_pdu(handle, SmpPdu::PairingPublicKey { x, y });
                self.timeout_reset(handle);
            }
            SmState::ScSendConfirmation => {
                let next = if responder {
                    SmState::ScW4PairingRandom
                } else {
                    SmState::ScW4Confirmation
                };
                self.set_state(handle, next);
                self.send_pdu(
                    handle,
                    SmpPdu::PairingConfirm {
                        confirm: self.setup.local_confirm,
                    },
                );
                self.timeout_reset(handle);
            }
            SmState::ScSendPairingRandom => {
                let more_rounds = self.setup.method.is_passkey_entry()
                    && self.setup.passkey_bit < SMP_PASSKEY_BITS;
                if !responder {
                    self.set_state(handle, SmState::ScW4PairingRandom);
                } else if more_rounds {
                    self.set_state(handle, SmState::ScW4Confirmation);
                } else if self.setup.method == StkGenerationMethod::NumericComparison {
                    self.set_state(handle, SmState::ScW2CalculateG2);
                } else {
                    self.prepare_dhkey_check(handle);
                }
                self.send_pdu(
                    handle,
                    SmpPdu::PairingRandom {
                        random: self.setup.local_nonce,
                    },
                );
                self.timeout_reset(handle);
            }
            SmState::ScSendDhKeyCheckCommand => {
                let next = if responder {
                    SmState::ScW4LtkRequestSc
                } else {
                    SmState::ScW4DhKeyCheckCommand
                };
                self.set_state(handle, next);
                self.send_pdu(
                    handle,
                    SmpPdu::PairingDhKeyCheck {
                        check: self.setup.local_dhkey_check,
                    },
                );
                self.timeout_reset(handle);
            }

            // responder
            SmState::ResponderSendSecurityRequest => {
                let auth_req = self.local_auth_req() - AuthReq::CT2;
                self.set_state(handle, SmState::ResponderPh1W4PairingRequest);
                self.send_pdu(handle, SmpPdu::SecurityRequest { auth_req });
                self.timeout_start(handle);
            }
            SmState::ScReceivedLtkRequest => self.step_sc_ltk_request(handle),
            SmState::ResponderPh1PairingRequestReceived => self.step_pairing_request_received(handle),
            SmState::ResponderPh1SendPairingResponse => self.send_pairing_response(handle),
            SmState::ResponderPh2SendLtkReply => {
                self.set_state(handle, SmState::Ph2W4ConnectionEncrypted);
                self.queue_command(HciCommand::LeLongTermKeyRequestReply {
                    handle,
                    ltk: reversed(&self.setup.ltk),
                });
            }
            SmState::ResponderPh4SendLtkReply => {
                self.set_state(handle, SmState::Ph4W4ConnectionEncrypted);
                self.queue_command(HciCommand::LeLongTermKeyRequestReply {
                    handle,
                    ltk: reversed(&self.setup.ltk),
                });
            }
            SmState::ResponderPh0ReceivedLtkRequest => {
                if !self.aes.is_idle() {
                    return;
                }
                self.setup.reset();
                let (stored, max_key_size) = (
                    self.connections
                        .get(&handle)
                        .and_then(|conn| conn.db_index)
                        .and_then(|index| self.store.get(index))
                        .map(|device| (device.key_size, device.authenticated)),
                    self.config.max_encryption_key_size,
                );
                let (key_size, authenticated) = stored.unwrap_or((max_key_size, false));
                if let Some(conn) = self.connections.get_mut(&handle) {
                    self.setup.local_rand = conn.ltk_rand;
                    self.setup.local_ediv = conn.ltk_ediv;
                    conn.key_size = key_size;
                    conn.authenticated = authenticated;
                    conn.secure_connections = false;
                }
                debug!(
                    "reconstructing LTK for EDIV {:#06x}, key size {}",
                    self.setup.local_ediv, key_size
                );
                self.reencryption_started(handle);
                let dhk = self.persistent_dhk;
                let plaintext = dm_r_prime(&self.setup.local_rand);
                if self.start_aes(
                    &dhk,
                    &plaintext,
                    AesOp::Connection {
                        handle,
                        step: ConnAesStep::Ph4Y,
                    },
                ) {
                    self.set_state(handle, SmState::ResponderPh4YW4Enc);
                }
            }
            SmState::ResponderPh4LtkGetEnc => {
                let er = self.config.er();
                let plaintext = d1_d_prime(self.setup.local_div, 0);
                self.aes_step(handle, &er, &plaintext, ConnAesStep::Ph4Ltk, SmState::ResponderPh4LtkW4Enc);
            }

            // legacy phase 2
            SmState::Ph2SendPairingRandom => {
                let next = if responder {
                    SmState::ResponderPh2W4LtkRequest
                } else {
                    SmState::InitiatorPh2W4PairingRandom
                };
                self.set_state(handle, next);
                self.send_pdu(
                    handle,
                    SmpPdu::PairingRandom {
                        random: self.setup.local_random,
                    },
                );
                self.timeout_reset(handle);
            }
            SmState::Ph2C1GetEncA => {
                let plaintext = self.c1_first_round(&self.setup.local_random);
                let tk = self.setup.tk;
                self.aes_step(handle, &tk, &plaintext, ConnAesStep::ConfirmA, SmState::Ph2C1W4EncA);
            }
            SmState::Ph2C1GetEncB => {
                let (plaintext, tk) = (self.setup.c1_t3, self.setup.tk);
                self.aes_step(handle, &tk, &plaintext, ConnAesStep::ConfirmB, SmState::Ph2C1W4EncB);
            }
            SmState::Ph2C1GetEncC => {
                let plaintext = self.c1_first_round(&self.setup.peer_random);
                let tk = self.setup.tk;
                self.aes_step(handle, &tk, &plaintext, ConnAesStep::CheckC, SmState::Ph2C1W4EncC);
            }
            SmState::Ph2C1GetEncD => {
                let (plaintext, tk) = (self.setup.c1_t3, self.setup.tk);
                self.aes_step(handle, &tk, &plaintext, ConnAesStep::CheckD, SmState::Ph2C1W4EncD);
            }
            SmState::Ph2C1SendPairingConfirm => {
                let next = if responder {
                    SmState::ResponderPh2W4PairingRandom
                } else {
                    SmState::InitiatorPh2W4PairingConfirm
                };
                self.set_state(handle, next);
                self.send_pdu(
                    handle,
                    SmpPdu::PairingConfirm {
                        confirm: self.setup.local_confirm,
                    },
                );
                self.timeout_reset(handle);
            }
            SmState::Ph2CalcStk => {
                let plaintext = if responder {
                    s1_r_prime(&self.setup.local_random, &self.setup.peer_random)
                } else {
                    s1_r_prime(&self.setup.peer_random, &self.setup.local_random)
                };
                let tk = self.setup.tk;
                self.aes_step(handle, &tk, &plaintext, ConnAesStep::Stk, SmState::Ph2W4Stk);
            }

            // legacy phase 3
            SmState::Ph3YGetEnc => {
                let dhk = self.persistent_dhk;
                let plaintext = dm_r_prime(&self.setup.local_rand);
                self.aes_step(handle, &dhk, &plaintext, ConnAesStep::Ph3Y, SmState::Ph3YW4Enc);
            }
            SmState::Ph3LtkGetEnc => {
                let er = self.config.er();
                let plaintext = d1_d_prime(self.setup.local_div, 0);
                self.aes_step(handle, &er, &plaintext, ConnAesStep::Ph3Ltk, SmState::Ph3LtkW4Enc);
            }
            SmState::Ph3CsrkGetEnc => {
                let er = self.config.er();
                let plaintext = d1_d_prime(self.setup.local_div, 1);
                self.aes_step(handle, &er, &plaintext, ConnAesStep::Ph3Csrk, SmState::Ph3CsrkW4Enc);
            }
            SmState::Ph3DistributeKeys => self.distribute_next_key(handle),

            _ => {}
        }
    }

    /// Start a connection AES step once the engine is free
    fn aes_step(&mut self, handle: u16, key: &[u8; 16], plaintext: &[u8; 16], step: ConnAesStep, next: SmState) {
        if !self.aes.is_idle() {
            return;
        }
        if self.start_aes(key, plaintext, AesOp::Connection { handle, step }) {
            self.set_state(handle, next);
        }
    }

    /// Initiator and responder addresses with type, as used by f5 and f6
    fn c1_addresses(&self) -> ([u8; 7], [u8; 7]) {
        (
            address_with_type(self.setup.m_address_type, &self.setup.m_address),
            address_with_type(self.setup.s_address_type, &self.setup.s_address),
        )
    }

    fn c1_first_round(&self, random: &[u8; 16]) -> [u8; 16] {
        c1_t1(
            random,
            &self.setup.preq.to_bytes(SMP_PAIRING_REQUEST),
            &self.setup.pres.to_bytes(SMP_PAIRING_RESPONSE),
            self.setup.m_address_type.smp_type(),
            self.setup.s_address_type.smp_type(),
        )
    }

    /// f5 message with N1 the initiator nonce and N2 the responder nonce
    fn f5_message_for(&self, counter: u8, responder: bool) -> Vec<u8> {
        let (a, b) = self.c1_addresses();
        if responder {
            f5_message(counter, &self.setup.peer_nonce, &self.setup.local_nonce, &a, &b)
        } else {
            f5_message(counter, &self.setup.local_nonce, &self.setup.peer_nonce, &a, &b)
        }
    }

    fn step_sc_ltk_request(&mut self, handle: u16) {
        let Some(conn) = self.connections.get(&handle) else {
            return;
        };
        match conn.irk_lookup {
            IrkLookupState::Succeeded => {
                self.setup.reset();
                self.load_security_info(handle);
                let setup = &self.setup;
                if setup.peer_ediv == 0 && setup.peer_rand == [0; 8] && setup.peer_ltk != [0; 16] {
                    self.setup.ltk = self.setup.peer_ltk;
                    self.set_state(handle, SmState::ResponderPh4SendLtkReply);
                    self.reencryption_started(handle);
                } else {
                    info!("{:#06x}: LTK request without EDIV/RAND but no stored LTK", handle);
                    self.set_state(handle, SmState::ResponderIdle);
                    self.queue_command(HciCommand::LeLongTermKeyRequestNegativeReply { handle });
                    self.done_for_handle(handle);
                }
            }
            IrkLookupState::Failed => {
                info!("{:#06x}: LTK request from unknown peer", handle);
                self.set_state(handle, SmState::ResponderIdle);
                self.queue_command(HciCommand::LeLongTermKeyRequestNegativeReply { handle });
                self.done_for_handle(handle);
            }
            _ => {}
        }
    }

    fn step_pairing_request_received(&mut self, handle: u16) {
        let tk = RandomOp::Connection {
            handle,
            step: ConnRandomStep::Tk,
        };
        if self.random.is_pending(tk) {
            return;
        }
        let Some(conn) = self.connections.get(&handle) else {
            return;
        };
        let preq = conn.preq;
        let bonded_with_ltk = conn.irk_lookup == IrkLookupState::Succeeded
            && conn
                .db_index
                .and_then(|index| self.store.get(index))
                .map_or(false, |device| device.has_ltk());

        self.setup.reset();
        if bonded_with_ltk {
            // peer lost its bond, report the failed re-encryption before pairing again
            self.reencryption_started(handle);
            self.reencryption_complete(handle, crate::hci::constants::HCI_ERROR_PIN_OR_KEY_MISSING);
        }
        self.init_setup(handle);
        self.setup.preq = preq;
        if let Err(reason) = self.stk_generation_init(handle) {
            self.pairing_started(handle);
            self.pairing_error(handle, reason);
            return;
        }
        self.timeout_start(handle);

        if self.setup.method == StkGenerationMethod::PasskeyInitiatorInput {
            self.request_connection_random(handle, ConnRandomStep::Tk, 8);
            return;
        }
        self.send_pairing_response(handle);
    }

    fn send_pairing_response(&mut self, handle: u16) {
        let mut flags = key_distribution_for_auth_req(
            self.local_auth_req(),
            self.config.cross_transport_key_derivation,
        );
        if self.setup.use_sc {
            flags.remove(KeyDistribution::ENC_KEY);
        }
        let preq = self.setup.preq;
        self.setup.pres.initiator_key_distribution = preq.initiator_key_distribution & flags;
        self.setup.pres.responder_key_distribution = preq.responder_key_distribution & flags;
        let pres = self.setup.pres;
        self.setup
            .setup_key_distribution(pres.responder_key_distribution, pres.initiator_key_distribution);

        let next = if self.setup.use_sc {
            SmState::ScW4PublicKeyCommand
        } else {
            SmState::ResponderPh1W4PairingConfirm
        };
        self.set_state(handle, next);
        self.send_pdu(handle, SmpPdu::PairingResponse(pres));
        self.timeout_reset(handle);
        self.pairing_started(handle);

        if !self.setup.use_sc || self.setup.method == StkGenerationMethod::JustWorks {
            self.trigger_user_response(handle);
        }
    }

    /// Send one distributed key per step
    fn distribute_next_key(&mut self, handle: u16) {
        let send = self.setup.key_distribution_send;
        let pdu = if send.contains(DistributedKeys::ENCRYPTION_INFORMATION) {
            self.mark_key_sent(DistributedKeys::ENCRYPTION_INFORMATION);
            Some(SmpPdu::EncryptionInformation { ltk: self.setup.ltk })
        } else if send.contains(DistributedKeys::MASTER_IDENTIFICATION) {
            self.mark_key_sent(DistributedKeys::MASTER_IDENTIFICATION);
            Some(SmpPdu::MasterIdentification {
                ediv: self.setup.local_ediv,
                rand: self.setup.local_rand,
            })
        } else if send.contains(DistributedKeys::IDENTITY_INFORMATION) {
            self.mark_key_sent(DistributedKeys::IDENTITY_INFORMATION);
            Some(SmpPdu::IdentityInformation {
                irk: self.persistent_irk,
            })
        } else if send.contains(DistributedKeys::IDENTITY_ADDRESS_INFORMATION) {
            self.mark_key_sent(DistributedKeys::IDENTITY_ADDRESS_INFORMATION);
            let (address_type, address) = match self.config.random_address_mode {
                RandomAddressMode::Off | RandomAddressMode::Static => self.own_address(),
                _ => (AddressType::Public, self.config.public_address),
            };
            Some(SmpPdu::IdentityAddressInformation {
                address_type,
                address,
            })
        } else if send.contains(DistributedKeys::SIGNING_INFORMATION) {
            self.mark_key_sent(DistributedKeys::SIGNING_INFORMATION);
            let csrk = self.setup.local_csrk;
            let db_index = self.connections.get(&handle).and_then(|conn| conn.db_index);
            if let Some(index) = db_index {
                if let Some(mut device) = self.store.get(index).cloned() {
                    device.local_csrk = Some(csrk);
                    device.local_counter = 0;
                    if let Err(e) = self.store.update(index, device) {
                        log::error!("failed to store local CSRK: {}", e);
                    }
                }
            }
            Some(SmpPdu::SigningInformation { csrk })
        } else {
            None
        };

        if let Some(pdu) = pdu {
            self.send_pdu(handle, pdu);
            self.timeout_reset(handle);
            return;
        }

        // all keys sent
        if self.is_responder(handle) {
            if self.setup.all_keys_received() {
                self.handle_all_received(handle);
                self.complete_responder(handle);
            } else {
                self.set_state(handle, SmState::Ph3ReceiveKeys);
            }
        } else {
            self.complete_initiator(handle);
        }
    }

    fn mark_key_sent(&mut self, key: DistributedKeys) {
        self.setup.key_distribution_send.remove(key);
        self.setup.key_distribution_sent.insert(key);
    }
}
