//! Constants for the Security Manager Protocol

// SMP command codes
pub const SMP_PAIRING_REQUEST: u8 = 0x01;
pub const SMP_PAIRING_RESPONSE: u8 = 0x02;
pub const SMP_PAIRING_CONFIRM: u8 = 0x03;
pub const SMP_PAIRING_RANDOM: u8 = 0x04;
pub const SMP_PAIRING_FAILED: u8 = 0x05;
pub const SMP_ENCRYPTION_INFORMATION: u8 = 0x06;
pub const SMP_MASTER_IDENTIFICATION: u8 = 0x07;
pub const SMP_IDENTITY_INFORMATION: u8 = 0x08;
pub const SMP_IDENTITY_ADDRESS_INFORMATION: u8 = 0x09;
pub const SMP_SIGNING_INFORMATION: u8 = 0x0A;
pub const SMP_SECURITY_REQUEST: u8 = 0x0B;
pub const SMP_PAIRING_PUBLIC_KEY: u8 = 0x0C;
pub const SMP_PAIRING_DHK_CHECK: u8 = 0x0D;
pub const SMP_PAIRING_KEYPRESS_NOTIFICATION: u8 = 0x0E;

/// Exact PDU length per command code, index is the code, 0 marks an invalid code
pub const SMP_PDU_SIZE: [usize; 15] = [
    0,  // 0x00 invalid opcode
    7,  // 0x01 pairing request
    7,  // 0x02 pairing response
    17, // 0x03 pairing confirm
    17, // 0x04 pairing random
    2,  // 0x05 pairing failed
    17, // 0x06 encryption information
    11, // 0x07 master identification
    17, // 0x08 identity information
    8,  // 0x09 identity address information
    17, // 0x0a signing information
    2,  // 0x0b security request
    65, // 0x0c pairing public key
    17, // 0x0d pairing dhkey check
    2,  // 0x0e keypress notification
];

// IO Capability values
pub const SMP_IO_CAPABILITY_DISPLAY_ONLY: u8 = 0x00;
pub const SMP_IO_CAPABILITY_DISPLAY_YES_NO: u8 = 0x01;
pub const SMP_IO_CAPABILITY_KEYBOARD_ONLY: u8 = 0x02;
pub const SMP_IO_CAPABILITY_NO_INPUT_NO_OUTPUT: u8 = 0x03;
pub const SMP_IO_CAPABILITY_KEYBOARD_DISPLAY: u8 = 0x04;

// Authentication Requirements bit masks
pub const SMP_AUTH_REQ_BONDING: u8 = 0x01;
pub const SMP_AUTH_REQ_MITM: u8 = 0x04;
pub const SMP_AUTH_REQ_SC: u8 = 0x08;
pub const SMP_AUTH_REQ_KEYPRESS: u8 = 0x10;
pub const SMP_AUTH_REQ_CT2: u8 = 0x20;

// Pairing Failed reason codes
pub const SMP_REASON_PASSKEY_ENTRY_FAILED: u8 = 0x01;
pub const SMP_REASON_OOB_NOT_AVAILABLE: u8 = 0x02;
pub const SMP_REASON_AUTHENTICATION_REQUIREMENTS: u8 = 0x03;
pub const SMP_REASON_CONFIRM_VALUE_FAILED: u8 = 0x04;
pub const SMP_REASON_PAIRING_NOT_SUPPORTED: u8 = 0x05;
pub const SMP_REASON_ENCRYPTION_KEY_SIZE: u8 = 0x06;
pub const SMP_REASON_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const SMP_REASON_UNSPECIFIED_REASON: u8 = 0x08;
pub const SMP_REASON_REPEATED_ATTEMPTS: u8 = 0x09;
pub const SMP_REASON_INVALID_PARAMETERS: u8 = 0x0A;
pub const SMP_REASON_DHKEY_CHECK_FAILED: u8 = 0x0B;
pub const SMP_REASON_NUMERIC_COMPARISON_FAILED: u8 = 0x0C;
pub const SMP_REASON_BR_EDR_PAIRING_IN_PROGRESS: u8 = 0x0D;
pub const SMP_REASON_CROSS_TRANSPORT_KEY_NOT_ALLOWED: u8 = 0x0E;

// SMP key distribution bit masks (Pairing Request/Response)
pub const SMP_KEY_DIST_ENC_KEY: u8 = 0x01;
pub const SMP_KEY_DIST_ID_KEY: u8 = 0x02;
pub const SMP_KEY_DIST_SIGN_KEY: u8 = 0x04;
pub const SMP_KEY_DIST_LINK_KEY: u8 = 0x08;

// SMP encryption key size limits
pub const SMP_MIN_ENCRYPTION_KEY_SIZE: u8 = 7;
pub const SMP_MAX_ENCRYPTION_KEY_SIZE: u8 = 16;

// Keypress notification types
pub const SMP_KEYPRESS_ENTRY_STARTED: u8 = 0x00;
pub const SMP_KEYPRESS_DIGIT_ENTERED: u8 = 0x01;
pub const SMP_KEYPRESS_DIGIT_ERASED: u8 = 0x02;
pub const SMP_KEYPRESS_CLEARED: u8 = 0x03;
pub const SMP_KEYPRESS_ENTRY_COMPLETED: u8 = 0x04;

// SMP timeout values (in milliseconds)
pub const SMP_TIMEOUT_GENERAL: u64 = 30000; // 30 seconds general timeout

// Passkey entry runs one confirm/random round per passkey bit
pub const SMP_PASSKEY_BITS: u8 = 20;
pub const SMP_PASSKEY_MAX: u32 = 999_999;

// Salt for f5 (Vol 3, Part H, 2.2.7)
pub const SMP_F5_SALT: [u8; 16] = [
    0x6C, 0x88, 0x83, 0x91, 0xAA, 0xF5, 0xA5, 0x38, 0x60, 0x37, 0x0B, 0xDB, 0x5A, 0x60, 0x83, 0xBE,
];

// f5 keyID "btle"
pub const SMP_F5_KEY_ID: [u8; 4] = [0x62, 0x74, 0x6C, 0x65];

// f5 Length = 256
pub const SMP_F5_LENGTH: [u8; 2] = [0x01, 0x00];

// h6/h7 key IDs
pub const SMP_KEY_ID_TMP1: u32 = 0x746D_7031;
pub const SMP_KEY_ID_LEBR: u32 = 0x6C65_6272;

// d1 diversifiers for the local key hierarchy
pub const SMP_DKG_IRK_DIV: u16 = 1;
pub const SMP_DKG_DHK_DIV: u16 = 3;

// Default ER and IR, only meant for testing
pub const SMP_DEFAULT_ER: [u8; 16] = [
    0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x3A, 0x3B, 0x3C, 0x3D, 0x3E, 0x3F,
];
pub const SMP_DEFAULT_IR: [u8; 16] = [
    0x90, 0x91, 0x92, 0x93, 0x94, 0x95, 0x96, 0x97, 0x98, 0x99, 0x9A, 0x9B, 0x9C, 0x9D, 0x9E, 0x9F,
];

// Number of LE Rand results needed to seed the EC key generator
pub const SMP_EC_SEED_LEN: usize = 64;
