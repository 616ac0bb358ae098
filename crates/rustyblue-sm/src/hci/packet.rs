//! HCI packet structures and parsing
//!
//! Commands the security manager submits to the controller and the events it
//! consumes. Multi-byte key material inside commands and events is kept in
//! controller byte order (least significant byte first); conversion to the
//! big-endian order of the crypto toolbox happens in the security manager.

use crate::gap::{AddressType, BdAddr, Role};
use crate::hci::constants::*;
use byteorder::{ByteOrder, LittleEndian};

/// Commands issued by the security manager
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum HciCommand {
    LeSetRandomAddress { address: BdAddr },
    /// Single AES-128 block, key and plaintext in controller order
    LeEncrypt { key: [u8; 16], plaintext: [u8; 16] },
    LeRand,
    LeStartEncryption {
        handle: u16,
        rand: [u8; 8],
        ediv: u16,
        ltk: [u8; 16],
    },
    LeLongTermKeyRequestReply { handle: u16, ltk: [u8; 16] },
    LeLongTermKeyRequestNegativeReply { handle: u16 },
}

impl HciCommand {
    /// Get the OGF and OCF for this command
    pub fn opcode_parts(&self) -> (u8, u16) {
        match self {
            Self::LeSetRandomAddress { .. } => (OGF_LE, OCF_LE_SET_RANDOM_ADDRESS),
            Self::LeEncrypt { .. } => (OGF_LE, OCF_LE_ENCRYPT),
            Self::LeRand => (OGF_LE, OCF_LE_RAND),
            Self::LeStartEncryption { .. } => (OGF_LE, OCF_LE_START_ENCRYPTION),
            Self::LeLongTermKeyRequestReply { .. } => (OGF_LE, OCF_LE_LONG_TERM_KEY_REQUEST_REPLY),
            Self::LeLongTermKeyRequestNegativeReply { .. } => {
                (OGF_LE, OCF_LE_LONG_TERM_KEY_REQUEST_NEGATIVE_REPLY)
            }
        }
    }

    pub fn opcode(&self) -> u16 {
        let (ogf, ocf) = self.opcode_parts();
        opcode(ogf, ocf)
    }

    /// Convert the command to its raw parameter bytes
    fn parameters(&self) -> Vec<u8> {
        match self {
            Self::LeRand => vec![],

            Self::LeSetRandomAddress { address } => address.bytes.to_vec(),

            Self::LeEncrypt { key, plaintext } => {
                let mut params = Vec::with_capacity(32);
                params.extend_from_slice(key);
                params.extend_from_slice(plaintext);
                params
            }

            Self::LeStartEncryption {
                handle,
                rand,
                ediv,
                ltk,
            } => {
                let mut params = Vec::with_capacity(28);
                params.extend_from_slice(&handle.to_le_bytes());
                params.extend_from_slice(rand);
                params.extend_from_slice(&ediv.to_le_bytes());
                params.extend_from_slice(ltk);
                params
            }

            Self::LeLongTermKeyRequestReply { handle, ltk } => {
                let mut params = Vec::with_capacity(18);
                params.extend_from_slice(&handle.to_le_bytes());
                params.extend_from_slice(ltk);
                params
            }

            Self::LeLongTermKeyRequestNegativeReply { handle } => handle.to_le_bytes().to_vec(),
        }
    }

    /// Convert the command to a raw HCI packet
    pub fn to_packet(&self) -> Vec<u8> {
        let params = self.parameters();

        let mut packet = vec![HCI_COMMAND_PKT];
        packet.extend_from_slice(&self.opcode().to_le_bytes());
        packet.push(params.len() as u8);
        packet.extend_from_slice(&params);
        packet
    }
}

/// HCI Event packet
#[derive(Debug, Clone)]
pub struct HciEvent {
    pub event_code: u8,
    pub parameter_total_length: u8,
    pub parameters: Vec<u8>,
}

/// Events the security manager reacts to, decoded from an [`HciEvent`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    LeConnectionComplete {
        status: u8,
        handle: u16,
        role: Role,
        peer_address_type: AddressType,
        peer_address: BdAddr,
    },
    DisconnectionComplete {
        status: u8,
        handle: u16,
        reason: u8,
    },
    EncryptionChange {
        status: u8,
        handle: u16,
        enabled: bool,
    },
    EncryptionKeyRefreshComplete {
        status: u8,
        handle: u16,
    },
    /// `rand` is in controller order
    LeLongTermKeyRequest {
        handle: u16,
        rand: [u8; 8],
        ediv: u16,
    },
    CommandComplete {
        opcode: u16,
        return_parameters: Vec<u8>,
    },
}

impl HciEvent {
    pub fn new(event_code: u8, parameters: Vec<u8>) -> Self {
        Self {
            event_code,
            parameter_total_length: parameters.len() as u8,
            parameters,
        }
    }

    /// Parse an HCI event from raw bytes
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 2 {
            return None;
        }

        let event_code = data[0];
        let parameter_total_length = data[1];

        if data.len() < (parameter_total_length as usize + 2) {
            return None;
        }

        let parameters = data[2..(parameter_total_length as usize + 2)].to_vec();

        Some(HciEvent {
            event_code,
            parameter_total_length,
            parameters,
        })
    }

    /// Decode the events relevant to security, `None` for everything else
    pub fn decode(&self) -> Option<LinkEvent> {
        let p = &self.parameters;
        match self.event_code {
            EVT_DISCONN_COMPLETE if p.len() >= 4 => Some(LinkEvent::DisconnectionComplete {
                status: p[0],
                handle: LittleEndian::read_u16(&p[1..3]) & HCI_HANDLE_MASK,
                reason: p[3],
            }),
            EVT_ENCRYPTION_CHANGE if p.len() >= 4 => Some(LinkEvent::EncryptionChange {
                status: p[0],
                handle: LittleEndian::read_u16(&p[1..3]) & HCI_HANDLE_MASK,
                enabled: p[3] != 0,
            }),
            EVT_ENCRYPTION_KEY_REFRESH_COMPLETE if p.len() >= 3 => {
                Some(LinkEvent::EncryptionKeyRefreshComplete {
                    status: p[0],
                    handle: LittleEndian::read_u16(&p[1..3]) & HCI_HANDLE_MASK,
                })
            }
            EVT_CMD_COMPLETE if p.len() >= 3 => Some(LinkEvent::CommandComplete {
                opcode: LittleEndian::read_u16(&p[1..3]),
                return_parameters: p[3..].to_vec(),
            }),
            EVT_LE_META_EVENT if !p.is_empty() => Self::decode_le_meta(p),
            _ => None,
        }
    }

    fn decode_le_meta(p: &[u8]) -> Option<LinkEvent> {
        match p[0] {
            EVT_LE_CONN_COMPLETE | EVT_LE_ENHANCED_CONN_COMPLETE if p.len() >= 12 => {
                Some(LinkEvent::LeConnectionComplete {
                    status: p[1],
                    handle: LittleEndian::read_u16(&p[2..4]) & HCI_HANDLE_MASK,
                    role: Role::from(p[4]),
                    peer_address_type: AddressType::from(p[5]),
                    peer_address: BdAddr::from_slice(&p[6..12])?,
                })
            }
            EVT_LE_LONG_TERM_KEY_REQUEST if p.len() >= 13 => {
                let mut rand = [0u8; 8];
                rand.copy_from_slice(&p[3..11]);
                Some(LinkEvent::LeLongTermKeyRequest {
                    handle: LittleEndian::read_u16(&p[1..3]) & HCI_HANDLE_MASK,
                    rand,
                    ediv: LittleEndian::read_u16(&p[11..13]),
                })
            }
            _ => None,
        }
    }
}
