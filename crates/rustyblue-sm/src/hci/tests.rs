//! Unit tests for HCI packet parsing and serialization

use super::constants::*;
use super::packet::*;
use crate::gap::{AddressType, BdAddr, Role};

#[test]
fn test_hci_command_serialization() {
    // LE Rand carries no parameters
    let packet = HciCommand::LeRand.to_packet();

    assert_eq!(packet[0], HCI_COMMAND_PKT);
    let opcode = u16::from_le_bytes([packet[1], packet[2]]);
    assert_eq!(opcode, 0x2018); // OGF_LE << 10 | OCF_LE_RAND
    assert_eq!(packet[3], 0);

    // LE Encrypt: key then plaintext, both as given
    let command = HciCommand::LeEncrypt {
        key: [0x11; 16],
        plaintext: [0x22; 16],
    };
    let packet = command.to_packet();

    let opcode = u16::from_le_bytes([packet[1], packet[2]]);
    assert_eq!(opcode, HCI_OPCODE_LE_ENCRYPT);
    assert_eq!(packet[3], 32);
    assert_eq!(&packet[4..20], &[0x11; 16]);
    assert_eq!(&packet[20..36], &[0x22; 16]);

    // LE Start Encryption
    let command = HciCommand::LeStartEncryption {
        handle: 0x0040,
        rand: [1, 2, 3, 4, 5, 6, 7, 8],
        ediv: 0xBEEF,
        ltk: [0xAA; 16],
    };
    let packet = command.to_packet();

    let opcode = u16::from_le_bytes([packet[1], packet[2]]);
    assert_eq!(opcode, 0x2019);
    assert_eq!(packet[3], 28);
    assert_eq!(u16::from_le_bytes([packet[4], packet[5]]), 0x0040); // handle
    assert_eq!(&packet[6..14], &[1, 2, 3, 4, 5, 6, 7, 8]); // rand
    assert_eq!(u16::from_le_bytes([packet[14], packet[15]]), 0xBEEF); // ediv
    assert_eq!(&packet[16..32], &[0xAA; 16]); // ltk

    // LE Long Term Key Request Negative Reply
    let command = HciCommand::LeLongTermKeyRequestNegativeReply { handle: 0x0041 };
    let packet = command.to_packet();

    let opcode = u16::from_le_bytes([packet[1], packet[2]]);
    assert_eq!(opcode, 0x201B);
    assert_eq!(packet[3], 2);
    assert_eq!(u16::from_le_bytes([packet[4], packet[5]]), 0x0041);

    // LE Set Random Address keeps wire order
    let address = BdAddr::new([0x01, 0x02, 0x03, 0x04, 0x05, 0x46]);
    let packet = HciCommand::LeSetRandomAddress { address }.to_packet();
    assert_eq!(u16::from_le_bytes([packet[1], packet[2]]), 0x2005);
    assert_eq!(&packet[4..10], &[0x01, 0x02, 0x03, 0x04, 0x05, 0x46]);
}

#[test]
fn test_hci_event_parsing() {
    // Command Complete for LE Rand
    let data = [
        EVT_CMD_COMPLETE, // Event code
        12,               // Parameter length
        1,                // Num_HCI_Command_Packets
        0x18,             // Command_Opcode (low byte)
        0x20,             // Command_Opcode (high byte)
        0x00,             // Status
        1, 2, 3, 4, 5, 6, 7, 8, // Random_Number
    ];

    let event = HciEvent::parse(&data).unwrap();

    assert_eq!(event.event_code, EVT_CMD_COMPLETE);
    assert_eq!(event.parameter_total_length, 12);

    match event.decode() {
        Some(LinkEvent::CommandComplete {
            opcode,
            return_parameters,
        }) => {
            assert_eq!(opcode, HCI_OPCODE_LE_RAND);
            assert_eq!(return_parameters, vec![0, 1, 2, 3, 4, 5, 6, 7, 8]);
        }
        other => panic!("unexpected decode result {:?}", other),
    }

    // Invalid data tests
    assert!(HciEvent::parse(&[]).is_none()); // Empty data
    assert!(HciEvent::parse(&[EVT_CMD_COMPLETE, 10, 1, 2]).is_none()); // Too short for parameter length
}

#[test]
fn test_connection_event_decoding() {
    // LE Connection Complete, peripheral role, random peer address
    let data = [
        EVT_LE_META_EVENT,    // Event code
        19,                   // Parameter length
        EVT_LE_CONN_COMPLETE, // Subevent code
        0x00,                 // Status
        0x40,
        0x00, // Connection_Handle
        0x01, // Role
        0x01, // Peer_Address_Type
        0x01,
        0x02,
        0x03,
        0x04,
        0x05,
        0x06, // Peer_Address
        0x0A,
        0x00, // Conn_Interval
        0x00,
        0x00, // Conn_Latency
        0x80,
        0x0C, // Supervision_Timeout
        0x00, // Master_Clock_Accuracy
    ];

    let event = HciEvent::parse(&data).unwrap();
    assert_eq!(
        event.decode(),
        Some(LinkEvent::LeConnectionComplete {
            status: 0,
            handle: 0x0040,
            role: Role::Peripheral,
            peer_address_type: AddressType::Random,
            peer_address: BdAddr::new([0x01, 0x02, 0x03, 0x04, 0x05, 0x06]),
        })
    );

    // Disconnection Complete
    let data = [
        EVT_DISCONN_COMPLETE, // Event code
        4,                    // Parameter length
        0x00,                 // Status
        0x40,
        0x00, // Connection_Handle
        0x13, // Reason
    ];

    let event = HciEvent::parse(&data).unwrap();
    assert_eq!(
        event.decode(),
        Some(LinkEvent::DisconnectionComplete {
            status: 0,
            handle: 0x0040,
            reason: HCI_ERROR_REMOTE_USER_TERMINATED,
        })
    );

    // Encryption Change, handle flags in the upper bits are masked off
    let event = HciEvent::new(EVT_ENCRYPTION_CHANGE, vec![0x00, 0x40, 0x20, 0x01]);
    assert_eq!(
        event.decode(),
        Some(LinkEvent::EncryptionChange {
            status: 0,
            handle: 0x0040,
            enabled: true,
        })
    );

    // Truncated events are ignored
    let event = HciEvent::new(EVT_ENCRYPTION_CHANGE, vec![0x00, 0x40]);
    assert_eq!(event.decode(), None);
}

#[test]
fn test_long_term_key_request_decoding() {
    let mut params = vec![EVT_LE_LONG_TERM_KEY_REQUEST, 0x41, 0x00];
    params.extend_from_slice(&[8, 7, 6, 5, 4, 3, 2, 1]); // Random_Number
    params.extend_from_slice(&0x1234u16.to_le_bytes()); // EDIV

    let event = HciEvent::new(EVT_LE_META_EVENT, params);
    assert_eq!(
        event.decode(),
        Some(LinkEvent::LeLongTermKeyRequest {
            handle: 0x0041,
            rand: [8, 7, 6, 5, 4, 3, 2, 1],
            ediv: 0x1234,
        })
    );

    // Unknown events decode to nothing
    let event = HciEvent::new(EVT_CMD_STATUS, vec![0x00, 0x01, 0x19, 0x20]);
    assert_eq!(event.decode(), None);
}
