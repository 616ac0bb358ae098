//! Local random address management

use super::crypto::{ah_hash, ah_r_prime};
use super::engine::{AesOp, RandomOp};
use super::manager::{DkgState, RauState, SecurityManager};
use crate::gap::*;
use crate::hci::HciCommand;
use log::{debug, info};
use std::time::{Duration, Instant};

impl SecurityManager {
    pub fn set_random_address_mode(&mut self, mode: RandomAddressMode) {
        self.config.random_address_mode = mode;
        self.apply_random_address_mode(mode);
        self.run();
    }

    /// Rotation period of private addresses, applies from the next rotation
    pub fn set_random_address_update_period(&mut self, period: Duration) {
        self.config.random_address_update_period = period;
        if self.random_address_deadline.is_some() {
            self.random_address_deadline = Some(Instant::now() + period);
        }
    }

    /// Use a fixed static random address
    pub fn set_static_random_address(&mut self, address: BdAddr) {
        self.config.random_address_mode = RandomAddressMode::Static;
        self.rau = RauState::Idle;
        self.random_address_deadline = None;
        self.random_address = address;
        self.queue_command(HciCommand::LeSetRandomAddress { address });
        self.run();
    }

    /// Current local random address, all zero before the first one is set
    pub fn random_address(&self) -> BdAddr {
        self.random_address
    }

    pub(super) fn apply_random_address_mode(&mut self, mode: RandomAddressMode) {
        self.random_address_deadline = None;
        match mode {
            RandomAddressMode::Off => self.rau = RauState::Idle,
            RandomAddressMode::Static => {
                let is_static = self.random_address.bytes[5] & RANDOM_ADDRESS_TYPE_MASK
                    == RANDOM_ADDRESS_STATIC_BITS;
                if !is_static {
                    self.start_random_address_update();
                }
            }
            RandomAddressMode::NonResolvable | RandomAddressMode::Resolvable => {
                self.start_random_address_update();
            }
        }
    }

    pub(super) fn start_random_address_update(&mut self) {
        if self.config.random_address_mode == RandomAddressMode::Off {
            return;
        }
        if matches!(self.rau, RauState::W4Random | RauState::W4Enc) {
            return;
        }
        self.rau = RauState::GetRandom;
    }

    /// Scheduler step of the random address update
    pub(super) fn run_random_address_update(&mut self) {
        match self.rau {
            RauState::GetRandom => {
                self.rau = RauState::W4Random;
                self.random.request(RandomOp::RandomAddress, 6);
            }
            RauState::GetEnc => {
                if self.dkg != DkgState::Ready || !self.aes.is_idle() {
                    return;
                }
                let plaintext = ah_r_prime(&self.random_address.prand());
                let irk = self.persistent_irk;
                if self.start_aes(&irk, &plaintext, AesOp::RandomAddressHash) {
                    self.rau = RauState::W4Enc;
                }
            }
            _ => {}
        }
    }

    pub(super) fn random_address_random_done(&mut self, random: &[u8]) {
        if self.rau != RauState::W4Random {
            return;
        }
        let Some(mut address) = BdAddr::from_slice(random) else {
            return;
        };
        match self.config.random_address_mode {
            RandomAddressMode::Off => {
                self.rau = RauState::Idle;
            }
            RandomAddressMode::Static => {
                address.bytes[5] |= RANDOM_ADDRESS_STATIC_BITS;
                self.set_random_address(address, false);
            }
            RandomAddressMode::NonResolvable => {
                address.bytes[5] =
                    (address.bytes[5] & !RANDOM_ADDRESS_TYPE_MASK) | RANDOM_ADDRESS_NON_RESOLVABLE_BITS;
                self.set_random_address(address, true);
            }
            RandomAddressMode::Resolvable => {
                address.bytes[5] =
                    (address.bytes[5] & !RANDOM_ADDRESS_TYPE_MASK) | RANDOM_ADDRESS_RESOLVABLE_BITS;
                self.random_address = address;
                self.rau = RauState::GetEnc;
            }
        }
    }

    pub(super) fn random_address_aes_done(&mut self, result: Result<[u8; 16], u8>) {
        if self.rau != RauState::W4Enc {
            return;
        }
        match result {
            Ok(ciphertext) => {
                let hash = ah_hash(&ciphertext);
                let mut address = self.random_address;
                address.bytes[0] = hash[2];
                address.bytes[1] = hash[1];
                address.bytes[2] = hash[0];
                self.set_random_address(address, true);
            }
            Err(_) => self.rau = RauState::GetEnc,
        }
    }

    fn set_random_address(&mut self, address: BdAddr, rotate: bool) {
        info!("new random address {}", address);
        self.random_address = address;
        self.rau = RauState::Idle;
        self.queue_command(HciCommand::LeSetRandomAddress { address });
        if rotate {
            let period = self.config.random_address_update_period;
            debug!("next random address update in {:?}", period);
            self.random_address_deadline = Some(Instant::now() + period);
        }
    }
}
