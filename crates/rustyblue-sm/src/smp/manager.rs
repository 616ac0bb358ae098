//! Security manager
//!
//! [`SecurityManager`] owns the per-connection state machines, the shared setup
//! context and the primitive engines. Every public entry point records its
//! input and then calls the scheduler, which drives engines and connections
//! until nothing more can be done without another event.

use super::cmac::CmacEngine;
use super::config::SecurityManagerConfig;
use super::connection::SmConnection;
use super::constants::*;
use super::crypto::*;
use super::engine::*;
use super::events::{PeerInfo, SmEvent};
use super::keys::{BondedDevice, BondingStore};
use super::link::LinkLayer;
use super::pairing::*;
use super::pdu::{PairingFeatures, SmpPdu};
use super::resolution::AddressResolution;
use super::setup::SetupContext;
use super::state::SmState;
use super::types::*;
use crate::gap::{AddressType, BdAddr, RandomAddressMode, Role};
use crate::hci::HciCommand;
use log::{debug, error, info, warn};
use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

/// Receives every [`SmEvent`]
pub type SmEventListener = Box<dyn FnMut(&SmEvent) + Send>;

/// Supplies the legacy OOB TK for a peer, if the application has one
pub type OobDataProvider = Box<dyn FnMut(AddressType, &BdAddr) -> Option<[u8; 16]> + Send>;

/// Secure Connections OOB data received from a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerScOobData {
    pub confirm: [u8; 16],
    pub random: [u8; 16],
}

/// Supplies the peer's Secure Connections OOB confirm and random values
pub type ScOobDataProvider = Box<dyn FnMut(AddressType, &BdAddr) -> Option<PeerScOobData> + Send>;

/// Local IRK/DHK derivation from IR
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum DkgState {
    CalcIrk,
    W4Irk,
    CalcDhk,
    W4Dhk,
    Ready,
}

/// Random address update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum RauState {
    Idle,
    GetRandom,
    W4Random,
    GetEnc,
    W4Enc,
}

/// Local Secure Connections OOB data generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum ScOobState {
    Idle,
    W4Random,
    W2CalcConfirm,
    W4Confirm,
}

/// Host-side LE Security Manager
pub struct SecurityManager {
    pub(super) config: SecurityManagerConfig,
    pub(super) link: Box<dyn LinkLayer + Send>,
    pub(super) store: Box<dyn BondingStore>,
    pub(super) listeners: Vec<SmEventListener>,
    pub(super) oob_provider: Option<OobDataProvider>,
    pub(super) sc_oob_provider: Option<ScOobDataProvider>,

    pub(super) connections: BTreeMap<u16, SmConnection>,
    /// Connection owning the setup context
    pub(super) active: Option<u16>,
    pub(super) setup: SetupContext,
    /// HCI commands waiting for the command channel
    pub(super) outbox: VecDeque<HciCommand>,

    pub(super) aes: AesEngine,
    pub(super) random: RandomEngine,
    pub(super) ec: EcEngine,
    pub(super) cmac: CmacEngine,
    pub(super) resolution: AddressResolution,

    pub(super) dkg: DkgState,
    pub(super) persistent_irk: [u8; 16],
    pub(super) persistent_dhk: [u8; 16],

    pub(super) rau: RauState,
    pub(super) random_address: BdAddr,
    pub(super) random_address_deadline: Option<Instant>,

    pub(super) sc_oob: ScOobState,
    pub(super) sc_oob_random: [u8; 16],

    /// SM timer of the active connection
    pub(super) timeout: Option<(u16, Instant)>,
    /// Bumped on every state change and every PDU or command sent
    pub(super) progress: u64,
}

impl SecurityManager {
    /// Create a security manager and start deriving the local keys
    pub fn new(
        config: SecurityManagerConfig,
        link: Box<dyn LinkLayer + Send>,
        store: Box<dyn BondingStore>,
    ) -> SmResult<Self> {
        config.validate()?;
        if config.er.is_none() {
            error!("ER not set, using the default test key");
        }
        if config.ir.is_none() {
            error!("IR not set, using the default test key");
        }

        let mut sm = Self {
            config,
            link,
            store,
            listeners: Vec::new(),
            oob_provider: None,
            sc_oob_provider: None,
            connections: BTreeMap::new(),
            active: None,
            setup: SetupContext::default(),
            outbox: VecDeque::new(),
            aes: AesEngine::default(),
            random: RandomEngine::default(),
            ec: EcEngine::default(),
            cmac: CmacEngine::default(),
            resolution: AddressResolution::default(),
            dkg: DkgState::CalcIrk,
            persistent_irk: [0; 16],
            persistent_dhk: [0; 16],
            rau: RauState::Idle,
            random_address: BdAddr::default(),
            random_address_deadline: None,
            sc_oob: ScOobState::Idle,
            sc_oob_random: [0; 16],
            timeout: None,
            progress: 0,
        };

        if sm.config.secure_connections_enabled {
            sm.ec_generate_new_key();
        }
        let mode = sm.config.random_address_mode;
        sm.apply_random_address_mode(mode);
        sm.run();
        Ok(sm)
    }

    pub fn config(&self) -> &SecurityManagerConfig {
        &self.config
    }

    pub fn register_listener<F>(&mut self, listener: F)
    where
        F: FnMut(&SmEvent) + Send + 'static,
    {
        self.listeners.push(Box::new(listener));
    }

    pub fn register_oob_data_provider<F>(&mut self, provider: F)
    where
        F: FnMut(AddressType, &BdAddr) -> Option<[u8; 16]> + Send + 'static,
    {
        self.oob_provider = Some(Box::new(provider));
    }

    pub fn register_sc_oob_data_provider<F>(&mut self, provider: F)
    where
        F: FnMut(AddressType, &BdAddr) -> Option<PeerScOobData> + Send + 'static,
    {
        self.sc_oob_provider = Some(Box::new(provider));
    }

    // Configuration

    pub fn set_io_capability(&mut self, io_capability: IoCapability) {
        self.config.io_capability = io_capability;
    }

    pub fn set_authentication_requirements(&mut self, auth_req: AuthReq) {
        let mut auth_req = auth_req;
        if !self.config.secure_connections_enabled && auth_req.contains(AuthReq::SECURE_CONNECTIONS) {
            error!("Secure Connections disabled, dropping SC flag from authentication requirements");
            auth_req.remove(AuthReq::SECURE_CONNECTIONS);
        }
        self.config.auth_req = auth_req;
    }

    pub fn set_accepted_association_models(&mut self, accepted: AcceptedMethods) {
        self.config.accepted_methods = accepted;
    }

    pub fn set_min_max_encryption_key_size(&mut self, min: u8, max: u8) -> SmResult<()> {
        let mut config = self.config.clone();
        config.min_encryption_key_size = min;
        config.max_encryption_key_size = max;
        config.validate()?;
        self.config = config;
        Ok(())
    }

    pub fn set_secure_connections_only_mode(&mut self, enabled: bool) {
        self.config.secure_connections_only = enabled;
        if enabled && !self.config.secure_connections_enabled {
            self.config.secure_connections_enabled = true;
            self.ec_generate_new_key();
            self.run();
        }
    }

    pub fn set_request_security(&mut self, enabled: bool) {
        self.config.request_security = enabled;
    }

    /// Passkey shown instead of a random one, `None` restores random passkeys
    pub fn set_fixed_passkey(&mut self, passkey: Option<u32>) -> SmResult<()> {
        if let Some(value) = passkey {
            if value > SMP_PASSKEY_MAX {
                return Err(SmError::InvalidParameter(format!("passkey {}", value)));
            }
        }
        self.config.fixed_passkey = passkey;
        Ok(())
    }

    pub fn set_er(&mut self, er: [u8; 16]) {
        self.config.er = Some(er);
    }

    /// Set IR and derive IRK and DHK again
    pub fn set_ir(&mut self, ir: [u8; 16]) {
        self.config.ir = Some(ir);
        self.dkg = DkgState::CalcIrk;
        self.run();
    }

    pub fn allow_ltk_reconstruction_without_bonding_entry(&mut self, allow: bool) {
        self.config.reconstruct_ltk_without_db_entry = allow;
    }

    // Link-layer inputs

    /// Run pending work after the SMP channel of `handle` became writable
    pub fn handle_can_send_now(&mut self, _handle: u16) {
        self.run();
    }

    /// Expire the SM timer and rotate the random address against the wall clock
    pub fn process_timeouts(&mut self) {
        self.process_timeouts_at(Instant::now());
    }

    pub fn process_timeouts_at(&mut self, now: Instant) {
        if let Some((handle, deadline)) = self.timeout {
            if now >= deadline {
                self.timeout = None;
                self.on_timeout(handle);
            }
        }
        if let Some(deadline) = self.random_address_deadline {
            if now >= deadline {
                self.random_address_deadline = None;
                self.start_random_address_update();
            }
        }
        self.run();
    }

    fn on_timeout(&mut self, handle: u16) {
        let Some(conn) = self.connections.get_mut(&handle) else {
            return;
        };
        warn!("SM timeout on connection {:#06x} in state {:?}", handle, conn.state);
        conn.state = SmState::Timeout;
        self.reencryption_complete(handle, crate::hci::constants::HCI_ERROR_CONNECTION_TIMEOUT);
        self.pairing_complete(handle, crate::hci::constants::HCI_ERROR_CONNECTION_TIMEOUT, 0);
        self.done_for_handle(handle);
    }

    // Pairing control

    /// Start pairing, or re-encryption with a bonded peer
    ///
    /// As responder this sends a Security Request once the identity lookup
    /// settled.
    pub fn request_pairing(&mut self, handle: u16) -> SmResult<()> {
        let mitm_required = self.config.auth_req.contains(AuthReq::MITM);
        let conn = self.conn(handle)?;
        let stored = conn
            .db_index
            .and_then(|index| self.store.get(index))
            .map(|device| (device.has_ltk(), device.authenticated));
        let (have_ltk, stored_authenticated) = stored.unwrap_or((false, false));
        let role = conn.role;
        let state = conn.state;
        let lookup = conn.irk_lookup;
        info!(
            "pairing requested on {:#06x} as {:?} in state {:?}",
            handle, role, state
        );

        match role {
            Role::Peripheral => {
                if !matches!(state, SmState::Idle | SmState::ResponderIdle) {
                    return Ok(());
                }
                match lookup {
                    IrkLookupState::Succeeded | IrkLookupState::Failed => {
                        if let Some(conn) = self.connections.get_mut(&handle) {
                            conn.pairing_requested = true;
                            conn.state = SmState::ResponderSendSecurityRequest;
                        }
                        if lookup == IrkLookupState::Succeeded && have_ltk {
                            self.reencryption_started(handle);
                        } else {
                            self.pairing_started(handle);
                        }
                    }
                    _ => {
                        debug!("identity lookup pending, deferring security request");
                        if let Some(conn) = self.connections.get_mut(&handle) {
                            conn.pairing_requested = true;
                        }
                    }
                }
            }
            Role::Central => {
                let next = match state {
                    SmState::InitiatorConnected => match lookup {
                        IrkLookupState::Succeeded
                            if have_ltk && (stored_authenticated || !mitm_required) =>
                        {
                            Some(SmState::InitiatorPh4HasLtk)
                        }
                        IrkLookupState::Succeeded | IrkLookupState::Failed => {
                            Some(SmState::InitiatorPh1W2SendPairingRequest)
                        }
                        _ => None,
                    },
                    SmState::ReencryptionFailed => Some(SmState::InitiatorPh1W2SendPairingRequest),
                    SmState::Idle => None,
                    _ => return Ok(()),
                };
                if let Some(conn) = self.connections.get_mut(&handle) {
                    match next {
                        Some(next) => conn.state = next,
                        None => {
                            debug!("identity lookup pending, deferring pairing");
                            conn.pairing_requested = true;
                        }
                    }
                }
            }
        }
        self.run();
        Ok(())
    }

    /// Responder: ask the central to pair or encrypt
    pub fn send_security_request(&mut self, handle: u16) -> SmResult<()> {
        if !self.conn(handle)?.is_responder() {
            return Err(SmError::InvalidState);
        }
        self.request_pairing(handle)
    }

    pub fn just_works_confirm(&mut self, handle: u16) -> SmResult<()> {
        self.require_setup_owner(handle)?;
        self.setup.user_response = UserResponse::Confirm;
        match self.conn(handle)?.state {
            SmState::Ph1W4UserResponse => {
                if self.setup.use_sc {
                    self.set_state(handle, SmState::ScSendPublicKeyCommand);
                } else {
                    self.request_connection_random(handle, ConnRandomStep::LocalRandom, 16);
                }
            }
            SmState::ScW4UserResponse => self.prepare_dhkey_check(handle),
            _ => {}
        }
        self.run();
        Ok(())
    }

    pub fn numeric_comparison_confirm(&mut self, handle: u16) -> SmResult<()> {
        self.just_works_confirm(handle)
    }

    /// Accept or decline a Just Works or Numeric Comparison prompt
    pub fn respond_user_confirm(&mut self, handle: u16, accept: bool) -> SmResult<()> {
        if accept {
            self.just_works_confirm(handle)
        } else {
            self.bonding_decline(handle)
        }
    }

    /// Decline the pending prompt, failing the pairing
    pub fn bonding_decline(&mut self, handle: u16) -> SmResult<()> {
        self.require_setup_owner(handle)?;
        self.setup.user_response = UserResponse::Decline;
        let state = self.conn(handle)?.state;
        info!("pairing declined by user in state {:?}", state);
        if matches!(
            state,
            SmState::ScW4UserResponse
                | SmState::ScW4Confirmation
                | SmState::ScW4PublicKeyCommand
                | SmState::Ph1W4UserResponse
        ) {
            let reason = match self.setup.method {
                method if method.is_passkey_entry() => PairingFailure::PasskeyEntryFailed,
                StkGenerationMethod::NumericComparison => PairingFailure::NumericComparisonFailed,
                _ => PairingFailure::UnspecifiedReason,
            };
            self.pairing_error(handle, reason);
        }
        self.run();
        Ok(())
    }

    /// Passkey typed in by the user
    pub fn respond_passkey(&mut self, handle: u16, passkey: u32) -> SmResult<()> {
        if passkey > SMP_PASSKEY_MAX {
            return Err(SmError::InvalidParameter(format!("passkey {}", passkey)));
        }
        self.require_setup_owner(handle)?;
        self.setup.tk = tk_from_passkey(passkey);
        self.setup.user_response = UserResponse::Passkey;
        self.setup.ra = self.setup.tk;
        self.setup.rb = self.setup.tk;
        match self.conn(handle)?.state {
            SmState::Ph1W4UserResponse => {
                self.request_connection_random(handle, ConnRandomStep::LocalRandom, 16);
            }
            SmState::ScW4UserResponse => self.start_calculating_local_confirm(handle),
            _ => {}
        }
        self.run();
        Ok(())
    }

    /// Queue a Keypress Notification for the peer
    pub fn send_keypress_notification(
        &mut self,
        handle: u16,
        action: KeypressNotificationType,
    ) -> SmResult<()> {
        self.require_setup_owner(handle)?;
        self.setup.keypress_queue.push_back(action.to_u8());
        self.run();
        Ok(())
    }

    /// Grant or decline authorization of the peer
    pub fn respond_authorization(&mut self, handle: u16, granted: bool) -> SmResult<()> {
        let conn = self.conn_mut(handle)?;
        conn.authorization = if granted {
            AuthorizationState::Granted
        } else {
            AuthorizationState::Declined
        };
        let db_index = conn.db_index;
        if let Some(index) = db_index {
            if let Some(mut device) = self.store.get(index).cloned() {
                device.authorized = granted;
                self.store.update(index, device)?;
            }
        }
        let peer = self.peer_info(handle);
        if let Some(peer) = peer {
            self.emit(SmEvent::AuthorizationResult { peer, granted });
        }
        Ok(())
    }

    /// Generate local Secure Connections OOB data, delivered as [`SmEvent::ScOobData`]
    pub fn generate_sc_oob_data(&mut self) -> SmResult<()> {
        if !self.config.secure_connections_enabled {
            return Err(SmError::InvalidState);
        }
        if self.sc_oob != ScOobState::Idle {
            return Err(SmError::EngineBusy("sc oob"));
        }
        self.sc_oob = ScOobState::W4Random;
        self.random.request(RandomOp::ScOobRandom, 16);
        self.run();
        Ok(())
    }

    // Utilities

    /// Queue a lookup of `address` in the bonding store
    pub fn address_resolution_lookup(&mut self, address_type: AddressType, address: BdAddr) -> SmResult<()> {
        if self.resolution.is_queued(address_type, &address) {
            return Err(SmError::EngineBusy("address resolution"));
        }
        self.resolution.queue.push_back((address_type, address));
        self.run();
        Ok(())
    }

    /// AES-CMAC of `message` under `key`, delivered as [`SmEvent::SignedWriteSignature`]
    pub fn signed_write_start(&mut self, key: [u8; 16], message: Vec<u8>) -> SmResult<()> {
        self.cmac.start_with_message(key, message, CmacOp::SignedWrite)?;
        self.run();
        Ok(())
    }

    pub fn cmac_ready(&self) -> bool {
        self.cmac.is_idle()
    }

    // Queries

    /// Remove the bonding record of an identity address
    pub fn delete_bonding(&mut self, address_type: AddressType, address: &BdAddr) -> bool {
        let Some(index) = self.store.get_by_address(address_type, address) else {
            return false;
        };
        self.store.remove(index);
        for conn in self.connections.values_mut() {
            if conn.db_index == Some(index) {
                conn.db_index = None;
            }
        }
        info!("bonding for {} removed", address);
        true
    }

    pub fn bonded_device(&self, index: usize) -> Option<&BondedDevice> {
        self.store.get(index)
    }

    pub fn identity_resolving_state(&self, handle: u16) -> SmResult<IrkLookupState> {
        Ok(self.conn(handle)?.irk_lookup)
    }

    /// Bonding store index of the peer
    pub fn le_device_index(&self, handle: u16) -> SmResult<Option<usize>> {
        Ok(self.conn(handle)?.db_index)
    }

    /// Key size of the link, 0 while unencrypted
    pub fn encryption_key_size(&self, handle: u16) -> SmResult<u8> {
        let conn = self.conn(handle)?;
        Ok(if conn.encrypted { conn.key_size } else { 0 })
    }

    pub fn authenticated(&self, handle: u16) -> SmResult<bool> {
        let conn = self.conn(handle)?;
        Ok(conn.encrypted && conn.authenticated)
    }

    pub fn authorization_state(&self, handle: u16) -> SmResult<AuthorizationState> {
        Ok(self.conn(handle)?.authorization)
    }

    /// Local IRK once derived from IR
    pub fn persistent_irk(&self) -> Option<[u8; 16]> {
        (self.dkg == DkgState::Ready).then_some(self.persistent_irk)
    }

    /// Re-encryption with a bonded peer is in progress or has failed
    pub fn reconnect_security_setup_active(&self, handle: u16) -> SmResult<bool> {
        let conn = self.conn(handle)?;
        Ok(match conn.state {
            SmState::InitiatorPh4HasLtk | SmState::Ph4W4ConnectionEncrypted => true,
            SmState::ReencryptionFailed => true,
            _ => conn.reencryption_active,
        })
    }

    pub fn connection_state(&self, handle: u16) -> Option<SmState> {
        self.connections.get(&handle).map(|conn| conn.state)
    }

    /// Connection owning the setup context
    pub fn active_connection(&self) -> Option<u16> {
        self.active
    }

    // Internal helpers

    pub(super) fn conn(&self, handle: u16) -> SmResult<&SmConnection> {
        self.connections
            .get(&handle)
            .ok_or(SmError::UnknownConnection(handle))
    }

    pub(super) fn conn_mut(&mut self, handle: u16) -> SmResult<&mut SmConnection> {
        self.connections
            .get_mut(&handle)
            .ok_or(SmError::UnknownConnection(handle))
    }

    fn require_setup_owner(&self, handle: u16) -> SmResult<()> {
        self.conn(handle)?;
        if self.active != Some(handle) {
            return Err(SmError::InvalidState);
        }
        Ok(())
    }

    pub(super) fn is_responder(&self, handle: u16) -> bool {
        self.connections
            .get(&handle)
            .map_or(false, SmConnection::is_responder)
    }

    pub(super) fn set_state(&mut self, handle: u16, state: SmState) {
        if let Some(conn) = self.connections.get_mut(&handle) {
            debug!("{:#06x}: {:?} -> {:?}", handle, conn.state, state);
            conn.state = state;
            self.progress += 1;
        }
    }

    pub(super) fn emit(&mut self, event: SmEvent) {
        debug!("event {:?}", event);
        for listener in self.listeners.iter_mut() {
            listener(&event);
        }
    }

    /// Identity address if the peer is bonded, the connection address otherwise
    pub(super) fn peer_info(&self, handle: u16) -> Option<PeerInfo> {
        let conn = self.connections.get(&handle)?;
        let identity = conn.db_index.and_then(|index| self.store.get(index));
        Some(match identity {
            Some(device) => PeerInfo {
                handle,
                address_type: device.address_type,
                address: device.address,
            },
            None => PeerInfo {
                handle,
                address_type: conn.peer_address_type,
                address: conn.peer_address,
            },
        })
    }

    /// Take the setup context for `handle`
    pub(super) fn acquire_setup(&mut self, handle: u16) -> SmResult<()> {
        match self.active {
            Some(owner) if owner != handle => {
                error!(
                    "setup context requested by {:#06x} while owned by {:#06x}",
                    handle, owner
                );
                Err(SmError::SetupBusy(owner))
            }
            _ => {
                if self.active.is_none() {
                    info!("connection {:#06x} took the setup context", handle);
                }
                self.active = Some(handle);
                Ok(())
            }
        }
    }

    /// Release the setup context if `handle` owns it
    pub(super) fn done_for_handle(&mut self, handle: u16) {
        if self.active != Some(handle) {
            return;
        }
        self.timeout_stop();
        self.active = None;
        info!("connection {:#06x} released the setup context", handle);
        if self.setup.use_sc && self.config.secure_connections_enabled {
            self.ec_generate_new_key();
        }
    }

    pub(super) fn ec_generate_new_key(&mut self) {
        if self.ec.state() == EcKeyState::W4Seed {
            return;
        }
        info!("generating new EC key");
        self.ec.seed_requested();
        self.random.request(RandomOp::EcSeed, SMP_EC_SEED_LEN);
    }

    pub(super) fn pairing_started(&mut self, handle: u16) {
        let Some(conn) = self.connections.get_mut(&handle) else {
            return;
        };
        if conn.pairing_active {
            return;
        }
        conn.pairing_active = true;
        if let Some(peer) = self.peer_info(handle) {
            self.emit(SmEvent::PairingStarted { peer });
        }
    }

    pub(super) fn pairing_complete(&mut self, handle: u16, status: u8, reason: u8) {
        let Some(conn) = self.connections.get_mut(&handle) else {
            return;
        };
        if !conn.pairing_active {
            return;
        }
        conn.pairing_active = false;
        if status == 0 {
            info!("pairing on {:#06x} complete", handle);
        } else {
            warn!(
                "pairing on {:#06x} failed, status {:#04x}, reason {:#04x}",
                handle, status, reason
            );
        }
        if let Some(peer) = self.peer_info(handle) {
            self.emit(SmEvent::PairingComplete { peer, status, reason });
        }
    }

    pub(super) fn reencryption_started(&mut self, handle: u16) {
        let Some(conn) = self.connections.get_mut(&handle) else {
            return;
        };
        if conn.reencryption_active {
            return;
        }
        conn.reencryption_active = true;
        if let Some(peer) = self.peer_info(handle) {
            self.emit(SmEvent::ReencryptionStarted { peer });
        }
    }

    pub(super) fn reencryption_complete(&mut self, handle: u16, status: u8) {
        let Some(conn) = self.connections.get_mut(&handle) else {
            return;
        };
        if !conn.reencryption_active {
            return;
        }
        conn.reencryption_active = false;
        if let Some(peer) = self.peer_info(handle) {
            self.emit(SmEvent::ReencryptionComplete { peer, status });
        }
    }

    /// Fail the pairing, the Pairing Failed PDU goes out from the scheduler
    pub(super) fn pairing_error(&mut self, handle: u16, reason: PairingFailure) {
        if let Some(conn) = self.connections.get_mut(&handle) {
            warn!("pairing error on {:#06x}: {}", handle, reason);
            conn.pairing_failed_reason = reason.to_u8();
        }
        self.set_state(handle, SmState::SendPairingFailed);
    }

    pub(super) fn timeout_start(&mut self, handle: u16) {
        self.timeout = Some((
            handle,
            Instant::now() + Duration::from_millis(SMP_TIMEOUT_GENERAL),
        ));
    }

    pub(super) fn timeout_reset(&mut self, handle: u16) {
        self.timeout_start(handle);
    }

    pub(super) fn timeout_stop(&mut self) {
        self.timeout = None;
    }

    pub(super) fn send_pdu(&mut self, handle: u16, pdu: SmpPdu) {
        debug!("{:#06x} <- {:?}", handle, pdu);
        let packet = pdu.serialize();
        self.progress += 1;
        if let Err(e) = self.link.send_pdu(handle, &packet) {
            error!("failed to send SMP PDU on {:#06x}: {}", handle, e);
        }
    }

    pub(super) fn queue_command(&mut self, command: HciCommand) {
        self.progress += 1;
        self.outbox.push_back(command);
    }

    pub(super) fn flush_commands(&mut self) {
        while !self.outbox.is_empty() && self.link.can_send_command() {
            if let Some(command) = self.outbox.pop_front() {
                if let Err(e) = self.link.send_command(command) {
                    error!("failed to send HCI command: {}", e);
                }
            }
        }
    }

    /// Start an AES block, the scheduler checked that the engine is idle
    pub(super) fn start_aes(&mut self, key: &[u8; 16], plaintext: &[u8; 16], op: AesOp) -> bool {
        match self.aes.start(key, plaintext, op) {
            Ok(command) => {
                self.queue_command(command);
                true
            }
            Err(e) => {
                error!("{}", e);
                false
            }
        }
    }

    /// Start a CMAC for a connection step
    pub(super) fn start_cmac(&mut self, handle: u16, key: [u8; 16], message: Vec<u8>, step: ScCmacStep) {
        if let Err(e) = self
            .cmac
            .start_with_message(key, message, CmacOp::Connection { handle, step })
        {
            error!("{}", e);
        }
    }

    pub(super) fn request_connection_random(&mut self, handle: u16, step: ConnRandomStep, len: usize) {
        self.random.request(RandomOp::Connection { handle, step }, len);
    }

    /// Tell the user what to do for the chosen association model
    pub(super) fn trigger_user_response(&mut self, handle: u16) {
        self.setup.user_response = UserResponse::Idle;
        let responder = match self.connections.get_mut(&handle) {
            Some(conn) => {
                conn.pairing_active = true;
                conn.is_responder()
            }
            None => return,
        };
        let Some(peer) = self.peer_info(handle) else {
            return;
        };
        let secure_connections = self.setup.use_sc;
        let display = SmEvent::PasskeyDisplay {
            peer,
            passkey: self.setup.passkey(),
            secure_connections,
        };
        let input = SmEvent::PasskeyInput {
            peer,
            secure_connections,
        };
        let event = match self.setup.method {
            StkGenerationMethod::PasskeyResponderInput => {
                if responder {
                    input
                } else {
                    display
                }
            }
            StkGenerationMethod::PasskeyInitiatorInput => {
                if responder {
                    display
                } else {
                    input
                }
            }
            StkGenerationMethod::PasskeyBothInput => input,
            StkGenerationMethod::NumericComparison => SmEvent::NumericComparisonRequest {
                peer,
                passkey: self.setup.passkey(),
            },
            StkGenerationMethod::JustWorks => SmEvent::JustWorksRequest {
                peer,
                secure_connections,
            },
            StkGenerationMethod::Oob => return,
        };
        if !matches!(event, SmEvent::PasskeyDisplay { .. }) {
            self.setup.user_response = UserResponse::Pending;
        }
        self.emit(event);
    }

    /// AuthReq we put into Pairing Request/Response and Security Request
    pub(super) fn local_auth_req(&self) -> AuthReq {
        let mut auth_req = self.config.auth_req - AuthReq::CT2;
        if !self.config.secure_connections_enabled {
            auth_req.remove(AuthReq::SECURE_CONNECTIONS);
        }
        if self.config.secure_connections_only {
            auth_req |= AuthReq::SECURE_CONNECTIONS;
        }
        if self.config.cross_transport_key_derivation
            && auth_req.contains(AuthReq::SECURE_CONNECTIONS | AuthReq::BONDING)
        {
            auth_req |= AuthReq::CT2;
        }
        auth_req
    }

    /// Fill the setup context for a new pairing on `handle`
    pub(super) fn init_setup(&mut self, handle: u16) {
        let Some(conn) = self.connections.get(&handle) else {
            return;
        };
        let responder = conn.is_responder();
        let (peer_type, peer_address) = (conn.peer_address_type, conn.peer_address);
        let (own_type, own_address) = (conn.own_address_type, conn.own_address);
        let local_auth_req = self.local_auth_req();

        self.setup.peer_address_type = peer_type;
        self.setup.peer_address = peer_address;

        self.setup.have_oob_data = false;
        if let Some(provider) = self.oob_provider.as_mut() {
            if let Some(tk) = provider(peer_type, &peer_address) {
                self.setup.tk = tk;
                self.setup.have_oob_data = true;
            }
        }

        self.setup.ra = [0; 16];
        self.setup.rb = [0; 16];
        if self.setup.have_oob_data && local_auth_req.contains(AuthReq::SECURE_CONNECTIONS) {
            let data = self
                .sc_oob_provider
                .as_mut()
                .and_then(|provider| provider(peer_type, &peer_address));
            match data {
                Some(data) => {
                    self.setup.peer_confirm = data.confirm;
                    if responder {
                        self.setup.ra = data.random;
                    } else {
                        self.setup.rb = data.random;
                    }
                }
                None => self.setup.have_oob_data = false,
            }
        }

        let mut local = PairingFeatures {
            io_capability: self.config.io_capability.to_u8(),
            oob_data_flag: self.setup.have_oob_data as u8,
            auth_req: local_auth_req,
            max_encryption_key_size: if self.config.secure_connections_only {
                SMP_MAX_ENCRYPTION_KEY_SIZE
            } else {
                self.config.max_encryption_key_size
            },
            ..Default::default()
        };

        if responder {
            self.setup.m_address_type = peer_type;
            self.setup.m_address = peer_address;
            self.setup.s_address_type = own_type;
            self.setup.s_address = own_address;
            self.setup.pres = local;
        } else {
            self.setup.m_address_type = own_type;
            self.setup.m_address = own_address;
            self.setup.s_address_type = peer_type;
            self.setup.s_address = peer_address;
            let flags = key_distribution_for_auth_req(
                local_auth_req,
                self.config.cross_transport_key_derivation,
            );
            local.initiator_key_distribution = flags;
            local.responder_key_distribution = flags;
            self.setup.preq = local;
        }
    }

    /// Negotiate key size, association model and key distribution
    pub(super) fn stk_generation_init(&mut self, handle: u16) -> Result<(), PairingFailure> {
        let responder = self.is_responder(handle);
        let (remote, keys_to_send, keys_to_receive) = if responder {
            let preq = self.setup.preq;
            (preq, preq.responder_key_distribution, preq.initiator_key_distribution)
        } else {
            let pres = self.setup.pres;
            (pres, pres.initiator_key_distribution, pres.responder_key_distribution)
        };

        if self.config.secure_connections_only
            && remote.max_encryption_key_size < SMP_MAX_ENCRYPTION_KEY_SIZE
        {
            return Err(PairingFailure::EncryptionKeySize);
        }
        let key_size = actual_encryption_key_size(
            remote.max_encryption_key_size,
            self.config.min_encryption_key_size,
            self.config.max_encryption_key_size,
        );
        if let Some(conn) = self.connections.get_mut(&handle) {
            conn.key_size = key_size;
        }
        if key_size == 0 {
            return Err(PairingFailure::EncryptionKeySize);
        }

        self.setup.use_sc = use_secure_connections(&self.setup.preq, &self.setup.pres);
        self.setup.method = stk_generation_method(&self.setup.preq, &self.setup.pres, self.setup.use_sc);
        if self.setup.method != StkGenerationMethod::Oob {
            self.setup.tk = [0; 16];
        }
        info!(
            "{:#06x}: {} pairing, {}, key size {}",
            handle,
            if self.setup.use_sc { "LE Secure Connections" } else { "legacy" },
            self.setup.method,
            key_size
        );

        if !method_accepted(self.setup.method, self.config.accepted_methods) {
            return Err(PairingFailure::AuthenticationRequirements);
        }
        if self.config.secure_connections_only && !self.setup.use_sc {
            return Err(PairingFailure::AuthenticationRequirements);
        }

        let (mut send, mut receive) = (keys_to_send, keys_to_receive);
        if self.setup.use_sc {
            send.remove(KeyDistribution::ENC_KEY);
            receive.remove(KeyDistribution::ENC_KEY);
        }
        self.setup.setup_key_distribution(send, receive);

        let authenticated = self.setup.method != StkGenerationMethod::JustWorks;
        if let Some(conn) = self.connections.get_mut(&handle) {
            conn.authenticated = authenticated;
        }
        Ok(())
    }

    /// Load the stored keys of a bonded peer into the setup context
    pub(super) fn load_security_info(&mut self, handle: u16) {
        let Some(conn) = self.connections.get_mut(&handle) else {
            return;
        };
        let Some(device) = conn.db_index.and_then(|index| self.store.get(index)) else {
            return;
        };
        self.setup.peer_ltk = device.ltk;
        self.setup.peer_ediv = device.ediv;
        self.setup.peer_rand = device.rand;
        conn.key_size = device.key_size;
        conn.authenticated = device.authenticated;
        conn.authorization = if device.authorized {
            AuthorizationState::Granted
        } else {
            AuthorizationState::Unknown
        };
        conn.secure_connections = device.secure_connections;
        debug!(
            "loaded security info, key size {}, authenticated {}, secure connections {}",
            device.key_size, device.authenticated, device.secure_connections
        );
    }

    /// Own address used on new connections
    pub(super) fn own_address(&self) -> (AddressType, BdAddr) {
        match self.config.random_address_mode {
            RandomAddressMode::Off => (AddressType::Public, self.config.public_address),
            _ => (AddressType::Random, self.random_address),
        }
    }
}
