//! Type definitions for the Security Manager
use super::constants::*;
use crate::error::HciError;
use bitflags::bitflags;
use std::fmt;
use thiserror::Error;

/// Errors returned to callers of the security manager API
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SmError {
    #[error("Unknown connection handle {0:#06x}")]
    UnknownConnection(u16),

    #[error("Invalid state for operation")]
    InvalidState,

    #[error("Engine busy: {0}")]
    EngineBusy(&'static str),

    #[error("Setup context already owned by connection {0:#06x}")]
    SetupBusy(u16),

    #[error("Bonding store full")]
    BondingStoreFull,

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("HCI error: {0}")]
    Hci(#[from] HciError),

    #[error("Pairing failed: {0}")]
    Pairing(PairingFailure),
}

/// Result type for security manager operations
pub type SmResult<T> = Result<T, SmError>;

/// Reason carried in a Pairing Failed PDU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PairingFailure {
    PasskeyEntryFailed,
    OobNotAvailable,
    AuthenticationRequirements,
    ConfirmValueFailed,
    PairingNotSupported,
    EncryptionKeySize,
    CommandNotSupported,
    UnspecifiedReason,
    RepeatedAttempts,
    InvalidParameters,
    DhKeyCheckFailed,
    NumericComparisonFailed,
    BrEdrPairingInProgress,
    CrossTransportKeyNotAllowed,
}

impl PairingFailure {
    /// Convert to u8 value for protocol
    pub fn to_u8(&self) -> u8 {
        match self {
            PairingFailure::PasskeyEntryFailed => SMP_REASON_PASSKEY_ENTRY_FAILED,
            PairingFailure::OobNotAvailable => SMP_REASON_OOB_NOT_AVAILABLE,
            PairingFailure::AuthenticationRequirements => SMP_REASON_AUTHENTICATION_REQUIREMENTS,
            PairingFailure::ConfirmValueFailed => SMP_REASON_CONFIRM_VALUE_FAILED,
            PairingFailure::PairingNotSupported => SMP_REASON_PAIRING_NOT_SUPPORTED,
            PairingFailure::EncryptionKeySize => SMP_REASON_ENCRYPTION_KEY_SIZE,
            PairingFailure::CommandNotSupported => SMP_REASON_COMMAND_NOT_SUPPORTED,
            PairingFailure::UnspecifiedReason => SMP_REASON_UNSPECIFIED_REASON,
            PairingFailure::RepeatedAttempts => SMP_REASON_REPEATED_ATTEMPTS,
            PairingFailure::InvalidParameters => SMP_REASON_INVALID_PARAMETERS,
            PairingFailure::DhKeyCheckFailed => SMP_REASON_DHKEY_CHECK_FAILED,
            PairingFailure::NumericComparisonFailed => SMP_REASON_NUMERIC_COMPARISON_FAILED,
            PairingFailure::BrEdrPairingInProgress => SMP_REASON_BR_EDR_PAIRING_IN_PROGRESS,
            PairingFailure::CrossTransportKeyNotAllowed => {
                SMP_REASON_CROSS_TRANSPORT_KEY_NOT_ALLOWED
            }
        }
    }

    /// Convert from u8 value from protocol
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            SMP_REASON_PASSKEY_ENTRY_FAILED => Some(PairingFailure::PasskeyEntryFailed),
            SMP_REASON_OOB_NOT_AVAILABLE => Some(PairingFailure::OobNotAvailable),
            SMP_REASON_AUTHENTICATION_REQUIREMENTS => {
                Some(PairingFailure::AuthenticationRequirements)
            }
            SMP_REASON_CONFIRM_VALUE_FAILED => Some(PairingFailure::ConfirmValueFailed),
            SMP_REASON_PAIRING_NOT_SUPPORTED => Some(PairingFailure::PairingNotSupported),
            SMP_REASON_ENCRYPTION_KEY_SIZE => Some(PairingFailure::EncryptionKeySize),
            SMP_REASON_COMMAND_NOT_SUPPORTED => Some(PairingFailure::CommandNotSupported),
            SMP_REASON_UNSPECIFIED_REASON => Some(PairingFailure::UnspecifiedReason),
            SMP_REASON_REPEATED_ATTEMPTS => Some(PairingFailure::RepeatedAttempts),
            SMP_REASON_INVALID_PARAMETERS => Some(PairingFailure::InvalidParameters),
            SMP_REASON_DHKEY_CHECK_FAILED => Some(PairingFailure::DhKeyCheckFailed),
            SMP_REASON_NUMERIC_COMPARISON_FAILED => Some(PairingFailure::NumericComparisonFailed),
            SMP_REASON_BR_EDR_PAIRING_IN_PROGRESS => Some(PairingFailure::BrEdrPairingInProgress),
            SMP_REASON_CROSS_TRANSPORT_KEY_NOT_ALLOWED => {
                Some(PairingFailure::CrossTransportKeyNotAllowed)
            }
            _ => None,
        }
    }
}

impl fmt::Display for PairingFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PairingFailure::PasskeyEntryFailed => write!(f, "Passkey entry failed"),
            PairingFailure::OobNotAvailable => write!(f, "OOB data not available"),
            PairingFailure::AuthenticationRequirements => {
                write!(f, "Authentication requirements not met")
            }
            PairingFailure::ConfirmValueFailed => write!(f, "Confirm value failed"),
            PairingFailure::PairingNotSupported => write!(f, "Pairing not supported"),
            PairingFailure::EncryptionKeySize => write!(f, "Encryption key size"),
            PairingFailure::CommandNotSupported => write!(f, "Command not supported"),
            PairingFailure::UnspecifiedReason => write!(f, "Unspecified reason"),
            PairingFailure::RepeatedAttempts => write!(f, "Too many pairing attempts"),
            PairingFailure::InvalidParameters => write!(f, "Invalid parameters"),
            PairingFailure::DhKeyCheckFailed => write!(f, "DHKey check failed"),
            PairingFailure::NumericComparisonFailed => write!(f, "Numeric comparison failed"),
            PairingFailure::BrEdrPairingInProgress => write!(f, "BR/EDR pairing in progress"),
            PairingFailure::CrossTransportKeyNotAllowed => {
                write!(f, "Cross-transport key derivation not allowed")
            }
        }
    }
}

/// IO Capability types for pairing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoCapability {
    /// Display only capability
    DisplayOnly,
    /// Display with yes/no capability
    DisplayYesNo,
    /// Keyboard only
    KeyboardOnly,
    /// No input, no output
    NoInputNoOutput,
    /// Both keyboard and display
    KeyboardDisplay,
}

impl IoCapability {
    /// Convert to u8 value for protocol
    pub fn to_u8(&self) -> u8 {
        match self {
            IoCapability::DisplayOnly => SMP_IO_CAPABILITY_DISPLAY_ONLY,
            IoCapability::DisplayYesNo => SMP_IO_CAPABILITY_DISPLAY_YES_NO,
            IoCapability::KeyboardOnly => SMP_IO_CAPABILITY_KEYBOARD_ONLY,
            IoCapability::NoInputNoOutput => SMP_IO_CAPABILITY_NO_INPUT_NO_OUTPUT,
            IoCapability::KeyboardDisplay => SMP_IO_CAPABILITY_KEYBOARD_DISPLAY,
        }
    }

    /// Convert from u8 value from protocol
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            SMP_IO_CAPABILITY_DISPLAY_ONLY => Some(IoCapability::DisplayOnly),
            SMP_IO_CAPABILITY_DISPLAY_YES_NO => Some(IoCapability::DisplayYesNo),
            SMP_IO_CAPABILITY_KEYBOARD_ONLY => Some(IoCapability::KeyboardOnly),
            SMP_IO_CAPABILITY_NO_INPUT_NO_OUTPUT => Some(IoCapability::NoInputNoOutput),
            SMP_IO_CAPABILITY_KEYBOARD_DISPLAY => Some(IoCapability::KeyboardDisplay),
            _ => None,
        }
    }
}

impl fmt::Display for IoCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoCapability::DisplayOnly => write!(f, "Display Only"),
            IoCapability::DisplayYesNo => write!(f, "Display Yes/No"),
            IoCapability::KeyboardOnly => write!(f, "Keyboard Only"),
            IoCapability::NoInputNoOutput => write!(f, "No Input No Output"),
            IoCapability::KeyboardDisplay => write!(f, "Keyboard Display"),
        }
    }
}

bitflags! {
    /// AuthReq field of Pairing Request/Response and Security Request
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AuthReq: u8 {
        const BONDING = SMP_AUTH_REQ_BONDING;
        const MITM = SMP_AUTH_REQ_MITM;
        const SECURE_CONNECTIONS = SMP_AUTH_REQ_SC;
        const KEYPRESS = SMP_AUTH_REQ_KEYPRESS;
        const CT2 = SMP_AUTH_REQ_CT2;
    }
}

bitflags! {
    /// Initiator/Responder Key Distribution fields of Pairing Request/Response
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct KeyDistribution: u8 {
        const ENC_KEY = SMP_KEY_DIST_ENC_KEY;
        const ID_KEY = SMP_KEY_DIST_ID_KEY;
        const SIGN_KEY = SMP_KEY_DIST_SIGN_KEY;
        const LINK_KEY = SMP_KEY_DIST_LINK_KEY;
    }
}

bitflags! {
    /// Phase 3 PDUs still to send, or already received
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DistributedKeys: u8 {
        const ENCRYPTION_INFORMATION = 0x01;
        const MASTER_IDENTIFICATION = 0x02;
        const IDENTITY_INFORMATION = 0x04;
        const IDENTITY_ADDRESS_INFORMATION = 0x08;
        const SIGNING_INFORMATION = 0x10;
    }
}

impl DistributedKeys {
    /// PDUs that carry the keys of a key distribution field
    pub fn for_key_distribution(keys: KeyDistribution) -> Self {
        let mut flags = DistributedKeys::empty();
        if keys.contains(KeyDistribution::ENC_KEY) {
            flags |= DistributedKeys::ENCRYPTION_INFORMATION | DistributedKeys::MASTER_IDENTIFICATION;
        }
        if keys.contains(KeyDistribution::ID_KEY) {
            flags |= DistributedKeys::IDENTITY_INFORMATION
                | DistributedKeys::IDENTITY_ADDRESS_INFORMATION;
        }
        if keys.contains(KeyDistribution::SIGN_KEY) {
            flags |= DistributedKeys::SIGNING_INFORMATION;
        }
        flags
    }
}

bitflags! {
    /// Association models the local device accepts
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AcceptedMethods: u8 {
        const JUST_WORKS = 0x01;
        const PASSKEY = 0x02;
        const OOB = 0x04;
        const NUMERIC_COMPARISON = 0x08;
    }
}

/// Association model chosen in phase 1
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StkGenerationMethod {
    JustWorks,
    /// Initiator displays the passkey, responder inputs it
    PasskeyResponderInput,
    /// Responder displays the passkey, initiator inputs it
    PasskeyInitiatorInput,
    /// Both sides input the same passkey
    PasskeyBothInput,
    NumericComparison,
    Oob,
}

impl StkGenerationMethod {
    /// Any of the passkey entry variants
    pub fn is_passkey_entry(self) -> bool {
        matches!(
            self,
            StkGenerationMethod::PasskeyResponderInput
                | StkGenerationMethod::PasskeyInitiatorInput
                | StkGenerationMethod::PasskeyBothInput
        )
    }

    /// Responder has to wait for a passkey from its user
    pub fn passkey_input_by_responder(self) -> bool {
        self == StkGenerationMethod::PasskeyResponderInput
    }

    pub fn is_just_works_or_numeric_comparison(self) -> bool {
        matches!(
            self,
            StkGenerationMethod::JustWorks | StkGenerationMethod::NumericComparison
        )
    }

    /// Accepted-methods bit needed for this model
    pub fn required_acceptance(self) -> AcceptedMethods {
        match self {
            StkGenerationMethod::JustWorks => AcceptedMethods::JUST_WORKS,
            StkGenerationMethod::PasskeyResponderInput
            | StkGenerationMethod::PasskeyInitiatorInput
            | StkGenerationMethod::PasskeyBothInput => AcceptedMethods::PASSKEY,
            StkGenerationMethod::NumericComparison => AcceptedMethods::NUMERIC_COMPARISON,
            StkGenerationMethod::Oob => AcceptedMethods::OOB,
        }
    }
}

impl fmt::Display for StkGenerationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StkGenerationMethod::JustWorks => write!(f, "Just Works"),
            StkGenerationMethod::PasskeyResponderInput => write!(f, "Passkey (responder input)"),
            StkGenerationMethod::PasskeyInitiatorInput => write!(f, "Passkey (initiator input)"),
            StkGenerationMethod::PasskeyBothInput => write!(f, "Passkey (both input)"),
            StkGenerationMethod::NumericComparison => write!(f, "Numeric Comparison"),
            StkGenerationMethod::Oob => write!(f, "Out of Band"),
        }
    }
}

/// Answer of the local user to a pairing prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserResponse {
    Idle,
    Pending,
    Confirm,
    Decline,
    Passkey,
}

/// Authorization state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationState {
    Unknown,
    Pending,
    Granted,
    Declined,
}

/// Progress of the bonded-device lookup for a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrkLookupState {
    W4Ready,
    Started,
    Succeeded,
    Failed,
}

/// Keypress notification type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeypressNotificationType {
    /// Entry started
    EntryStarted,
    /// Digit entered
    DigitEntered,
    /// Digit erased
    DigitErased,
    /// Cleared
    Cleared,
    /// Entry completed
    EntryCompleted,
}

impl KeypressNotificationType {
    /// Convert to u8 value for protocol
    pub fn to_u8(&self) -> u8 {
        match self {
            KeypressNotificationType::EntryStarted => SMP_KEYPRESS_ENTRY_STARTED,
            KeypressNotificationType::DigitEntered => SMP_KEYPRESS_DIGIT_ENTERED,
            KeypressNotificationType::DigitErased => SMP_KEYPRESS_DIGIT_ERASED,
            KeypressNotificationType::Cleared => SMP_KEYPRESS_CLEARED,
            KeypressNotificationType::EntryCompleted => SMP_KEYPRESS_ENTRY_COMPLETED,
        }
    }

    /// Convert from u8 value from protocol
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            SMP_KEYPRESS_ENTRY_STARTED => Some(KeypressNotificationType::EntryStarted),
            SMP_KEYPRESS_DIGIT_ENTERED => Some(KeypressNotificationType::DigitEntered),
            SMP_KEYPRESS_DIGIT_ERASED => Some(KeypressNotificationType::DigitErased),
            SMP_KEYPRESS_CLEARED => Some(KeypressNotificationType::Cleared),
            SMP_KEYPRESS_ENTRY_COMPLETED => Some(KeypressNotificationType::EntryCompleted),
            _ => None,
        }
    }
}
