//! Bluetooth HCI (Host Controller Interface) implementation
//!
//! This module provides the HCI commands and events exchanged between the
//! security manager and the controller.

pub mod constants;
pub mod packet;

#[cfg(test)]
mod tests;

pub use packet::{HciCommand, HciEvent, LinkEvent};
