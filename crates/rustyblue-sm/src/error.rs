//! Error types for the rustyblue-sm library
//!
//! This module defines the errors reported by the link-layer collaborator.

use thiserror::Error;

/// Errors that can occur when handing commands or PDUs to the link layer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HciError {
    #[error("Failed to send HCI command: {0}")]
    SendError(String),

    #[error("Failed to send SMP PDU on handle {0:#06x}")]
    PduSendError(u16),

    #[error("Invalid parameter length: {0}")]
    InvalidParamLength(usize),

    #[error("Invalid HCI packet format")]
    InvalidPacketFormat,

    #[error("Unsupported operation")]
    Unsupported,
}
