//! Link-layer collaborator
//!
//! The security manager never talks to a controller directly. Commands and
//! SMP PDUs go out through a [`LinkLayer`], events come back in through
//! `SecurityManager::handle_hci_event` and `SecurityManager::handle_smp_pdu`.

use crate::error::HciError;
use crate::hci::HciCommand;

/// Command channel and SMP fixed channel of the host stack
pub trait LinkLayer {
    /// Controller accepts another command right now
    fn can_send_command(&self) -> bool;

    /// Submit one HCI command
    fn send_command(&mut self, command: HciCommand) -> Result<(), HciError>;

    /// The SMP channel of `handle` accepts another PDU right now
    fn can_send_pdu(&self, handle: u16) -> bool;

    /// Send one SMP PDU on the security manager channel of `handle`
    fn send_pdu(&mut self, handle: u16, pdu: &[u8]) -> Result<(), HciError>;

    /// Ask for a `handle_can_send_now` call once `handle` can take a PDU
    fn request_can_send_now(&mut self, handle: u16);
}
