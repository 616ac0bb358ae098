//! SMP PDU codec
//!
//! Multi-octet values travel least significant octet first on the SMP channel.
//! Everything above this module keeps 128-bit values, RAND and public key
//! coordinates most significant octet first, the order used by the crypto
//! toolbox, so the conversion happens only in `parse` and `serialize`.

use super::constants::*;
use super::types::*;
use crate::gap::{AddressType, BdAddr};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};

/// Body of a Pairing Request or Pairing Response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingFeatures {
    /// IO capability, kept raw as peers may send reserved values
    pub io_capability: u8,
    /// OOB data flag
    pub oob_data_flag: u8,
    /// Authentication requirements
    pub auth_req: AuthReq,
    /// Maximum encryption key size
    pub max_encryption_key_size: u8,
    /// Initiator key distribution
    pub initiator_key_distribution: KeyDistribution,
    /// Responder key distribution
    pub responder_key_distribution: KeyDistribution,
}

impl Default for PairingFeatures {
    fn default() -> Self {
        Self {
            io_capability: SMP_IO_CAPABILITY_NO_INPUT_NO_OUTPUT,
            oob_data_flag: 0,
            auth_req: AuthReq::empty(),
            max_encryption_key_size: SMP_MAX_ENCRYPTION_KEY_SIZE,
            initiator_key_distribution: KeyDistribution::empty(),
            responder_key_distribution: KeyDistribution::empty(),
        }
    }
}

impl PairingFeatures {
    /// IO capability if it is one of the defined values
    pub fn io_capability(&self) -> Option<IoCapability> {
        IoCapability::from_u8(self.io_capability)
    }

    pub fn has_oob_data(&self) -> bool {
        self.oob_data_flag != 0
    }

    /// Full 7-octet PDU as it goes over the air, used by c1
    pub fn to_bytes(&self, code: u8) -> [u8; 7] {
        [
            code,
            self.io_capability,
            self.oob_data_flag,
            self.auth_req.bits(),
            self.max_encryption_key_size,
            self.initiator_key_distribution.bits(),
            self.responder_key_distribution.bits(),
        ]
    }

    fn from_bytes(data: &[u8]) -> Self {
        Self {
            io_capability: data[0],
            oob_data_flag: data[1],
            auth_req: AuthReq::from_bits_retain(data[2]),
            max_encryption_key_size: data[3],
            initiator_key_distribution: KeyDistribution::from_bits_retain(data[4]),
            responder_key_distribution: KeyDistribution::from_bits_retain(data[5]),
        }
    }

    /// IOcap input of f6: AuthReq || OOB data flag || IO capability
    pub fn f6_io_cap(&self) -> [u8; 3] {
        [self.auth_req.bits(), self.oob_data_flag, self.io_capability]
    }
}

/// Security Manager Protocol PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmpPdu {
    PairingRequest(PairingFeatures),
    PairingResponse(PairingFeatures),
    PairingConfirm { confirm: [u8; 16] },
    PairingRandom { random: [u8; 16] },
    PairingFailed { reason: u8 },
    EncryptionInformation { ltk: [u8; 16] },
    MasterIdentification { ediv: u16, rand: [u8; 8] },
    IdentityInformation { irk: [u8; 16] },
    IdentityAddressInformation { address_type: AddressType, address: BdAddr },
    SigningInformation { csrk: [u8; 16] },
    SecurityRequest { auth_req: AuthReq },
    PairingPublicKey { x: [u8; 32], y: [u8; 32] },
    PairingDhKeyCheck { check: [u8; 16] },
    KeypressNotification { notification: u8 },
}

fn read_reversed<const N: usize>(cursor: &mut Cursor<&[u8]>) -> std::io::Result<[u8; N]> {
    let mut value = [0u8; N];
    cursor.read_exact(&mut value)?;
    value.reverse();
    Ok(value)
}

fn push_reversed(packet: &mut Vec<u8>, value: &[u8]) {
    packet.extend(value.iter().rev());
}

impl SmpPdu {
    /// Parse a PDU, rejecting unknown codes and lengths that differ from the defined size
    pub fn parse(data: &[u8]) -> SmResult<Self> {
        let code = *data
            .first()
            .ok_or_else(|| SmError::InvalidParameter("Empty SMP PDU".into()))?;
        let expected = SMP_PDU_SIZE.get(code as usize).copied().unwrap_or(0);
        if expected == 0 {
            return Err(SmError::InvalidParameter(format!(
                "Unknown SMP code {:#04x}",
                code
            )));
        }
        if data.len() != expected {
            return Err(SmError::InvalidParameter(format!(
                "SMP code {:#04x} with length {}, expected {}",
                code,
                data.len(),
                expected
            )));
        }

        let mut cursor = Cursor::new(&data[1..]);
        Self::parse_body(code, &data[1..], &mut cursor)
            .map_err(|_| SmError::InvalidParameter("Truncated SMP PDU".into()))
    }

    fn parse_body(code: u8, body: &[u8], cursor: &mut Cursor<&[u8]>) -> std::io::Result<Self> {
        let pdu = match code {
            SMP_PAIRING_REQUEST => SmpPdu::PairingRequest(PairingFeatures::from_bytes(body)),
            SMP_PAIRING_RESPONSE => SmpPdu::PairingResponse(PairingFeatures::from_bytes(body)),
            SMP_PAIRING_CONFIRM => SmpPdu::PairingConfirm {
                confirm: read_reversed(cursor)?,
            },
            SMP_PAIRING_RANDOM => SmpPdu::PairingRandom {
                random: read_reversed(cursor)?,
            },
            SMP_PAIRING_FAILED => SmpPdu::PairingFailed {
                reason: cursor.read_u8()?,
            },
            SMP_ENCRYPTION_INFORMATION => SmpPdu::EncryptionInformation {
                ltk: read_reversed(cursor)?,
            },
            SMP_MASTER_IDENTIFICATION => SmpPdu::MasterIdentification {
                ediv: cursor.read_u16::<LittleEndian>()?,
                rand: read_reversed(cursor)?,
            },
            SMP_IDENTITY_INFORMATION => SmpPdu::IdentityInformation {
                irk: read_reversed(cursor)?,
            },
            SMP_IDENTITY_ADDRESS_INFORMATION => {
                let address_type = AddressType::from(cursor.read_u8()?);
                let mut bytes = [0u8; 6];
                cursor.read_exact(&mut bytes)?;
                SmpPdu::IdentityAddressInformation {
                    address_type,
                    address: BdAddr::new(bytes),
                }
            }
            SMP_SIGNING_INFORMATION => SmpPdu::SigningInformation {
                csrk: read_reversed(cursor)?,
            },
            SMP_SECURITY_REQUEST => SmpPdu::SecurityRequest {
                auth_req: AuthReq::from_bits_retain(cursor.read_u8()?),
            },
            SMP_PAIRING_PUBLIC_KEY => SmpPdu::PairingPublicKey {
                x: read_reversed(cursor)?,
                y: read_reversed(cursor)?,
            },
            SMP_PAIRING_DHK_CHECK => SmpPdu::PairingDhKeyCheck {
                check: read_reversed(cursor)?,
            },
            _ => SmpPdu::KeypressNotification {
                notification: cursor.read_u8()?,
            },
        };
        Ok(pdu)
    }

    /// Command code
    pub fn code(&self) -> u8 {
        match self {
            SmpPdu::PairingRequest(_) => SMP_PAIRING_REQUEST,
            SmpPdu::PairingResponse(_) => SMP_PAIRING_RESPONSE,
            SmpPdu::PairingConfirm { .. } => SMP_PAIRING_CONFIRM,
            SmpPdu::PairingRandom { .. } => SMP_PAIRING_RANDOM,
            SmpPdu::PairingFailed { .. } => SMP_PAIRING_FAILED,
            SmpPdu::EncryptionInformation { .. } => SMP_ENCRYPTION_INFORMATION,
            SmpPdu::MasterIdentification { .. } => SMP_MASTER_IDENTIFICATION,
            SmpPdu::IdentityInformation { .. } => SMP_IDENTITY_INFORMATION,
            SmpPdu::IdentityAddressInformation { .. } => SMP_IDENTITY_ADDRESS_INFORMATION,
            SmpPdu::SigningInformation { .. } => SMP_SIGNING_INFORMATION,
            SmpPdu::SecurityRequest { .. } => SMP_SECURITY_REQUEST,
            SmpPdu::PairingPublicKey { .. } => SMP_PAIRING_PUBLIC_KEY,
            SmpPdu::PairingDhKeyCheck { .. } => SMP_PAIRING_DHK_CHECK,
            SmpPdu::KeypressNotification { .. } => SMP_PAIRING_KEYPRESS_NOTIFICATION,
        }
    }

    /// Serialize to raw packet
    pub fn serialize(&self) -> Vec<u8> {
        let code = self.code();
        let mut packet = Vec::with_capacity(SMP_PDU_SIZE[code as usize]);
        packet.push(code);

        match self {
            SmpPdu::PairingRequest(features) | SmpPdu::PairingResponse(features) => {
                packet.extend_from_slice(&features.to_bytes(code)[1..]);
            }
            SmpPdu::PairingConfirm { confirm: value }
            | SmpPdu::PairingRandom { random: value }
            | SmpPdu::EncryptionInformation { ltk: value }
            | SmpPdu::IdentityInformation { irk: value }
            | SmpPdu::SigningInformation { csrk: value }
            | SmpPdu::PairingDhKeyCheck { check: value } => push_reversed(&mut packet, value),
            SmpPdu::PairingFailed { reason } => packet.push(*reason),
            SmpPdu::MasterIdentification { ediv, rand } => {
                // writing into a Vec cannot fail
                let _ = packet.write_u16::<LittleEndian>(*ediv);
                push_reversed(&mut packet, rand);
            }
            SmpPdu::IdentityAddressInformation {
                address_type,
                address,
            } => {
                packet.push(address_type.smp_type());
                packet.extend_from_slice(address.as_slice());
            }
            SmpPdu::SecurityRequest { auth_req } => packet.push(auth_req.bits()),
            SmpPdu::PairingPublicKey { x, y } => {
                push_reversed(&mut packet, x);
                push_reversed(&mut packet, y);
            }
            SmpPdu::KeypressNotification { notification } => packet.push(*notification),
        }

        packet
    }
}
