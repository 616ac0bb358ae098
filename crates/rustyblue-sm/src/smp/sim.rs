//! Simulated controllers for tests
//!
//! A [`Sim`] connects several security managers through fake controllers.
//! LE Encrypt runs real AES-128, LE Rand draws from a seeded generator, and
//! encryption start compares the LTK the central used with the one the
//! peripheral replied with. SMP PDUs are relayed between the two ends of a
//! connection. Prompts are answered automatically once the calls that raised
//! them have returned.

use super::cmac::CmacEngine;
use super::config::SecurityManagerConfig;
use super::engine::CmacOp;
use super::events::SmEvent;
use super::keys::MemoryBondingStore;
use super::link::LinkLayer;
use super::manager::SecurityManager;
use super::types::{AuthReq, IoCapability};
use crate::error::HciError;
use crate::gap::{BdAddr, ROLE_CENTRAL, ROLE_PERIPHERAL};
use crate::hci::constants::*;
use crate::hci::{HciCommand, HciEvent};
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const MAX_STEPS: usize = 10_000;

/// AES-128 on big-endian key and block
pub fn aes128(key: &[u8; 16], plaintext: &[u8; 16]) -> [u8; 16] {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut block = GenericArray::clone_from_slice(plaintext);
    cipher.encrypt_block(&mut block);
    let mut out = [0u8; 16];
    out.copy_from_slice(&block);
    out
}

/// AES-CMAC computed with the block-by-block engine
pub fn cmac(key: &[u8; 16], message: &[u8]) -> [u8; 16] {
    let mut engine = CmacEngine::default();
    engine
        .start_with_message(*key, message.to_vec(), CmacOp::SignedWrite)
        .expect("engine idle");
    loop {
        let (k, block) = engine.next_block().expect("engine waits for a block");
        if let Some((_, mac)) = engine.handle_aes_result(aes128(&k, &block)) {
            return mac;
        }
    }
}

/// Everything a manager handed to its link layer
#[derive(Debug, Default)]
pub struct LinkState {
    pub commands: VecDeque<HciCommand>,
    pub pdus: VecDeque<(u16, Vec<u8>)>,
    /// Every command ever sent, in order
    pub command_log: Vec<HciCommand>,
    /// SMP channel refuses PDUs
    pub blocked: bool,
    pub can_send_now_requests: Vec<u16>,
}

pub struct SimLink(Arc<Mutex<LinkState>>);

impl LinkLayer for SimLink {
    fn can_send_command(&self) -> bool {
        true
    }

    fn send_command(&mut self, command: HciCommand) -> Result<(), HciError> {
        let mut state = self.0.lock().unwrap();
        state.command_log.push(command.clone());
        state.commands.push_back(command);
        Ok(())
    }

    fn can_send_pdu(&self, _handle: u16) -> bool {
        !self.0.lock().unwrap().blocked
    }

    fn send_pdu(&mut self, handle: u16, pdu: &[u8]) -> Result<(), HciError> {
        self.0.lock().unwrap().pdus.push_back((handle, pdu.to_vec()));
        Ok(())
    }

    fn request_can_send_now(&mut self, handle: u16) {
        self.0.lock().unwrap().can_send_now_requests.push(handle);
    }
}

pub struct SimDevice {
    pub sm: SecurityManager,
    pub link: Arc<Mutex<LinkState>>,
    pub events: Arc<Mutex<Vec<SmEvent>>>,
    pub address: BdAddr,
    rng: StdRng,
    /// Events already looked at for prompts
    seen: usize,
}

impl SimDevice {
    pub fn new(config: SecurityManagerConfig, seed: u64) -> Self {
        Self::with_store(config, seed, MemoryBondingStore::default())
    }

    pub fn with_store(config: SecurityManagerConfig, seed: u64, store: MemoryBondingStore) -> Self {
        let link = Arc::new(Mutex::new(LinkState::default()));
        let address = config.public_address;
        let mut sm = SecurityManager::new(config, Box::new(SimLink(link.clone())), Box::new(store))
            .expect("valid configuration");
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        sm.register_listener(move |event| sink.lock().unwrap().push(event.clone()));
        Self {
            sm,
            link,
            events,
            address,
            rng: StdRng::seed_from_u64(seed),
            seen: 0,
        }
    }

    pub fn events(&self) -> Vec<SmEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn clear_events(&mut self) {
        self.events.lock().unwrap().clear();
        self.seen = 0;
    }

    /// Status and reason of the last pairing that completed
    pub fn pairing_result(&self) -> Option<(u8, u8)> {
        self.events().iter().rev().find_map(|event| match event {
            SmEvent::PairingComplete { status, reason, .. } => Some((*status, *reason)),
            _ => None,
        })
    }

    pub fn reencryption_result(&self) -> Option<u8> {
        self.events().iter().rev().find_map(|event| match event {
            SmEvent::ReencryptionComplete { status, .. } => Some(*status),
            _ => None,
        })
    }
}

/// Test configuration with a distinct public address
pub fn config(io_capability: IoCapability, auth_req: AuthReq, address: u8) -> SecurityManagerConfig {
    SecurityManagerConfig {
        io_capability,
        auth_req,
        public_address: BdAddr::from_be_bytes([0x00, 0x1b, 0xdc, 0x07, 0x32, address]),
        ..Default::default()
    }
}

#[derive(Debug)]
struct SimConnection {
    central: (usize, u16),
    peripheral: (usize, u16),
    /// LTK the central started encryption with
    pending_ltk: Option<[u8; 16]>,
    open: bool,
}

type PduFilter = Box<dyn FnMut(usize, &[u8]) -> bool>;

pub struct Sim {
    pub devices: Vec<SimDevice>,
    connections: Vec<SimConnection>,
    /// Confirm Just Works and numeric comparison prompts
    pub auto_confirm: bool,
    /// Passkey typed into input prompts, the last displayed one if unset
    pub passkey: Option<u32>,
    /// Answer passkey input prompts, otherwise the test types them in
    pub answer_passkeys: bool,
    displayed: Option<u32>,
    pending_input: Vec<(usize, u16)>,
    /// Called for every relayed PDU with the sending device, false drops it
    pub pdu_filter: Option<PduFilter>,
    /// Deliver the next PDU with this opcode from this device twice
    pub duplicate: Option<(usize, u8)>,
    /// Hold the central's Encryption Change until everything else settled
    pub delay_central_encryption: bool,
    held_events: Vec<(usize, HciEvent)>,
}

impl Sim {
    pub fn new(devices: Vec<SimDevice>) -> Self {
        let mut sim = Self {
            devices,
            connections: Vec::new(),
            auto_confirm: true,
            passkey: None,
            answer_passkeys: true,
            displayed: None,
            pending_input: Vec::new(),
            pdu_filter: None,
            duplicate: None,
            delay_central_encryption: false,
            held_events: Vec::new(),
        };
        // local key derivation and the first EC key
        sim.pump();
        sim
    }

    pub fn sm(&mut self, device: usize) -> &mut SecurityManager {
        &mut self.devices[device].sm
    }

    pub fn connect(&mut self, central: usize, peripheral: usize, handle: u16) {
        self.connections.push(SimConnection {
            central: (central, handle),
            peripheral: (peripheral, handle),
            pending_ltk: None,
            open: true,
        });
        let central_address = self.devices[central].address;
        let peripheral_address = self.devices[peripheral].address;
        self.devices[central]
            .sm
            .handle_hci_event(&connection_complete(handle, ROLE_CENTRAL, &peripheral_address));
        self.devices[peripheral]
            .sm
            .handle_hci_event(&connection_complete(handle, ROLE_PERIPHERAL, &central_address));
        self.pump();
    }

    pub fn disconnect(&mut self, handle: u16) {
        for connection in self.connections.iter_mut().filter(|c| c.open) {
            if connection.central.1 != handle {
                continue;
            }
            connection.open = false;
            let event = disconnection_complete(handle, HCI_ERROR_REMOTE_USER_TERMINATED);
            self.devices[connection.central.0].sm.handle_hci_event(&event);
            self.devices[connection.peripheral.0].sm.handle_hci_event(&event);
        }
        self.pump();
    }

    /// Run timers of every device as if `elapsed` had passed
    pub fn advance(&mut self, elapsed: Duration) {
        let now = Instant::now() + elapsed;
        for device in &mut self.devices {
            device.sm.process_timeouts_at(now);
        }
        self.pump();
    }

    pub fn pump(&mut self) {
        self.pump_with(|_| {});
    }

    /// Run until no device has anything left to do, calling `check` after every step
    pub fn pump_with<F: FnMut(&Sim)>(&mut self, mut check: F) {
        for _ in 0..MAX_STEPS {
            if !self.step() {
                return;
            }
            check(self);
        }
        panic!("simulation did not settle");
    }

    fn step(&mut self) -> bool {
        let mut busy = false;
        for index in 0..self.devices.len() {
            let commands: Vec<HciCommand> = {
                let mut link = self.devices[index].link.lock().unwrap();
                link.commands.drain(..).collect()
            };
            for command in commands {
                busy = true;
                self.execute(index, command);
            }

            let pdus: Vec<(u16, Vec<u8>)> = {
                let mut link = self.devices[index].link.lock().unwrap();
                link.pdus.drain(..).collect()
            };
            for (handle, pdu) in pdus {
                busy = true;
                self.relay(index, handle, pdu);
            }
        }
        if self.answer_prompts() || busy {
            return true;
        }
        let held = std::mem::take(&mut self.held_events);
        let delivered = !held.is_empty();
        for (index, event) in held {
            self.devices[index].sm.handle_hci_event(&event);
        }
        delivered
    }

    /// Connection and the remote end of `(device, handle)`
    fn remote(&self, device: usize, handle: u16) -> Option<(usize, (usize, u16))> {
        self.connections
            .iter()
            .enumerate()
            .filter(|(_, c)| c.open)
            .find_map(|(i, c)| {
                if c.central == (device, handle) {
                    Some((i, c.peripheral))
                } else if c.peripheral == (device, handle) {
                    Some((i, c.central))
                } else {
                    None
                }
            })
    }

    fn execute(&mut self, index: usize, command: HciCommand) {
        match command {
            HciCommand::LeEncrypt { mut key, mut plaintext } => {
                key.reverse();
                plaintext.reverse();
                let mut ciphertext = aes128(&key, &plaintext);
                ciphertext.reverse();
                let mut return_parameters = vec![0];
                return_parameters.extend_from_slice(&ciphertext);
                self.devices[index]
                    .sm
                    .handle_hci_event(&command_complete(HCI_OPCODE_LE_ENCRYPT, &return_parameters));
            }
            HciCommand::LeRand => {
                let mut random = [0u8; 8];
                self.devices[index].rng.fill_bytes(&mut random);
                let mut return_parameters = vec![0];
                return_parameters.extend_from_slice(&random);
                self.devices[index]
                    .sm
                    .handle_hci_event(&command_complete(HCI_OPCODE_LE_RAND, &return_parameters));
            }
            HciCommand::LeSetRandomAddress { address } => {
                self.devices[index].address = address;
            }
            HciCommand::LeStartEncryption { handle, rand, ediv, ltk } => {
                if let Some((connection, (peer, peer_handle))) = self.remote(index, handle) {
                    self.connections[connection].pending_ltk = Some(ltk);
                    self.devices[peer]
                        .sm
                        .handle_hci_event(&ltk_request(peer_handle, &rand, ediv));
                }
            }
            HciCommand::LeLongTermKeyRequestReply { handle, ltk } => {
                if let Some((connection, (peer, peer_handle))) = self.remote(index, handle) {
                    let expected = self.connections[connection].pending_ltk.take();
                    let (status, enabled) = if expected == Some(ltk) {
                        (0, true)
                    } else {
                        (HCI_ERROR_CONNECTION_TERMINATED_MIC_FAILURE, false)
                    };
                    self.devices[index]
                        .sm
                        .handle_hci_event(&encryption_change(handle, status, enabled));
                    let event = encryption_change(peer_handle, status, enabled);
                    if self.delay_central_encryption {
                        self.held_events.push((peer, event));
                    } else {
                        self.devices[peer].sm.handle_hci_event(&event);
                    }
                }
            }
            HciCommand::LeLongTermKeyRequestNegativeReply { handle } => {
                if let Some((connection, (peer, peer_handle))) = self.remote(index, handle) {
                    self.connections[connection].pending_ltk = None;
                    self.devices[peer].sm.handle_hci_event(&encryption_change(
                        peer_handle,
                        HCI_ERROR_PIN_OR_KEY_MISSING,
                        false,
                    ));
                }
            }
        }
    }

    fn relay(&mut self, index: usize, handle: u16, pdu: Vec<u8>) {
        if let Some(filter) = self.pdu_filter.as_mut() {
            if !filter(index, &pdu) {
                return;
            }
        }
        let copies = match self.duplicate {
            Some((from, code)) if from == index && pdu.first() == Some(&code) => {
                self.duplicate = None;
                2
            }
            _ => 1,
        };
        if let Some((_, (peer, peer_handle))) = self.remote(index, handle) {
            for _ in 0..copies {
                self.devices[peer].sm.handle_smp_pdu(peer_handle, &pdu);
            }
        }
    }

    fn answer_prompts(&mut self) -> bool {
        let mut busy = false;
        for index in 0..self.devices.len() {
            let fresh: Vec<SmEvent> = {
                let device = &self.devices[index];
                let events = device.events.lock().unwrap();
                events[device.seen..].to_vec()
            };
            self.devices[index].seen += fresh.len();

            for event in fresh {
                match event {
                    SmEvent::JustWorksRequest { peer, .. }
                    | SmEvent::NumericComparisonRequest { peer, .. }
                        if self.auto_confirm =>
                    {
                        busy = true;
                        self.devices[index]
                            .sm
                            .respond_user_confirm(peer.handle, true)
                            .expect("confirm accepted");
                    }
                    SmEvent::PasskeyDisplay { passkey, .. } => self.displayed = Some(passkey),
                    SmEvent::PasskeyInput { peer, .. } => self.pending_input.push((index, peer.handle)),
                    _ => {}
                }
            }
        }

        if !self.answer_passkeys {
            self.pending_input.clear();
            return busy;
        }
        if let Some(passkey) = self.passkey.or(self.displayed) {
            for (index, handle) in std::mem::take(&mut self.pending_input) {
                busy = true;
                self.devices[index]
                    .sm
                    .respond_passkey(handle, passkey)
                    .expect("passkey accepted");
            }
        }
        busy
    }
}

fn command_complete(opcode: u16, return_parameters: &[u8]) -> HciEvent {
    let mut parameters = vec![1];
    parameters.extend_from_slice(&opcode.to_le_bytes());
    parameters.extend_from_slice(return_parameters);
    HciEvent::new(EVT_CMD_COMPLETE, parameters)
}

fn connection_complete(handle: u16, role: u8, peer: &BdAddr) -> HciEvent {
    let mut parameters = vec![EVT_LE_CONN_COMPLETE, 0];
    parameters.extend_from_slice(&handle.to_le_bytes());
    parameters.push(role);
    parameters.push(0);
    parameters.extend_from_slice(peer.as_slice());
    // interval, latency, supervision timeout, clock accuracy
    parameters.extend_from_slice(&[0x18, 0x00, 0x00, 0x00, 0x48, 0x00, 0x00]);
    HciEvent::new(EVT_LE_META_EVENT, parameters)
}

fn disconnection_complete(handle: u16, reason: u8) -> HciEvent {
    let mut parameters = vec![0];
    parameters.extend_from_slice(&handle.to_le_bytes());
    parameters.push(reason);
    HciEvent::new(EVT_DISCONN_COMPLETE, parameters)
}

fn encryption_change(handle: u16, status: u8, enabled: bool) -> HciEvent {
    let mut parameters = vec![status];
    parameters.extend_from_slice(&handle.to_le_bytes());
    parameters.push(enabled as u8);
    HciEvent::new(EVT_ENCRYPTION_CHANGE, parameters)
}

fn ltk_request(handle: u16, rand: &[u8; 8], ediv: u16) -> HciEvent {
    let mut parameters = vec![EVT_LE_LONG_TERM_KEY_REQUEST];
    parameters.extend_from_slice(&handle.to_le_bytes());
    parameters.extend_from_slice(rand);
    parameters.extend_from_slice(&ediv.to_le_bytes());
    HciEvent::new(EVT_LE_META_EVENT, parameters)
}
