//! HCI protocol constants
//!
//! This module contains the subset of the Bluetooth HCI protocol used by the
//! security manager: LE encryption and random-number commands, and the events
//! that report connection, encryption and command-completion state.

// HCI packet type
pub const HCI_COMMAND_PKT: u8 = 0x01;

// Connection handles are 12 bits, upper bits carry flags
pub const HCI_HANDLE_MASK: u16 = 0x0FFF;

// LE controller commands OGF
pub const OGF_LE: u8 = 0x08;

// LE Command OCF values (OGF: 0x08)
pub const OCF_LE_SET_RANDOM_ADDRESS: u16 = 0x0005;
pub const OCF_LE_ENCRYPT: u16 = 0x0017;
pub const OCF_LE_RAND: u16 = 0x0018;
pub const OCF_LE_START_ENCRYPTION: u16 = 0x0019;
pub const OCF_LE_LONG_TERM_KEY_REQUEST_REPLY: u16 = 0x001A;
pub const OCF_LE_LONG_TERM_KEY_REQUEST_NEGATIVE_REPLY: u16 = 0x001B;

// HCI Events
pub const EVT_DISCONN_COMPLETE: u8 = 0x05;
pub const EVT_ENCRYPTION_CHANGE: u8 = 0x08;
pub const EVT_CMD_COMPLETE: u8 = 0x0E;
pub const EVT_CMD_STATUS: u8 = 0x0F;
pub const EVT_ENCRYPTION_KEY_REFRESH_COMPLETE: u8 = 0x30;
pub const EVT_LE_META_EVENT: u8 = 0x3E;

// LE Meta Events
pub const EVT_LE_CONN_COMPLETE: u8 = 0x01;
pub const EVT_LE_LONG_TERM_KEY_REQUEST: u8 = 0x05;
pub const EVT_LE_ENHANCED_CONN_COMPLETE: u8 = 0x0A;

// Status codes used by the security manager
pub const HCI_SUCCESS: u8 = 0x00;
pub const HCI_ERROR_AUTHENTICATION_FAILURE: u8 = 0x05;
pub const HCI_ERROR_PIN_OR_KEY_MISSING: u8 = 0x06;
pub const HCI_ERROR_CONNECTION_TIMEOUT: u8 = 0x08;
pub const HCI_ERROR_REMOTE_USER_TERMINATED: u8 = 0x13;
pub const HCI_ERROR_CONNECTION_TERMINATED_MIC_FAILURE: u8 = 0x3D;

/// Build an opcode from its group and command fields
pub const fn opcode(ogf: u8, ocf: u16) -> u16 {
    ((ogf as u16) << 10) | (ocf & 0x3ff)
}

pub const HCI_OPCODE_LE_ENCRYPT: u16 = opcode(OGF_LE, OCF_LE_ENCRYPT);
pub const HCI_OPCODE_LE_RAND: u16 = opcode(OGF_LE, OCF_LE_RAND);
