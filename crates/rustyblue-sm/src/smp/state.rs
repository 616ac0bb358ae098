//! Per-connection security state
//!
//! One value per link. Transitions are always spelled out at the call site,
//! there is no ordering between the variants.

/// Engine state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SmState {
    // general
    Idle,
    SendPairingFailed,
    /// SM timer expired, a new physical link is needed for another attempt
    Timeout,
    ReencryptionFailed,

    // legacy phase 1 and 2, both roles
    Ph1W4UserResponse,
    Ph2SendPairingRandom,
    Ph2C1GetEncA,
    Ph2C1W4EncA,
    Ph2C1GetEncB,
    Ph2C1W4EncB,
    Ph2C1SendPairingConfirm,
    Ph2C1GetEncC,
    Ph2C1W4EncC,
    Ph2C1GetEncD,
    Ph2C1W4EncD,
    Ph2CalcStk,
    Ph2W4Stk,
    Ph2W4ConnectionEncrypted,

    // phase 3, both roles
    Ph3YGetEnc,
    Ph3YW4Enc,
    Ph3LtkGetEnc,
    Ph3LtkW4Enc,
    Ph3CsrkGetEnc,
    Ph3CsrkW4Enc,
    Ph3DistributeKeys,
    Ph3ReceiveKeys,

    // phase 4, both roles
    Ph4W4ConnectionEncrypted,

    // initiator
    InitiatorConnected,
    InitiatorPh1W2SendPairingRequest,
    InitiatorPh1W4PairingResponse,
    InitiatorPh2W4PairingConfirm,
    InitiatorPh2W4PairingRandom,
    InitiatorPh3SendStartEncryption,
    InitiatorPh4HasLtk,

    // responder
    ResponderIdle,
    ResponderSendSecurityRequest,
    ResponderPh0ReceivedLtkRequest,
    ResponderPh0ReceivedLtkW4Irk,
    ResponderPh0SendLtkRequestedNegativeReply,
    ResponderPh1W4PairingRequest,
    ResponderPh1PairingRequestReceived,
    ResponderPh1PairingRequestReceivedW4Irk,
    ResponderPh1SendPairingResponse,
    ResponderPh1W4PairingConfirm,
    ResponderPh2W4PairingRandom,
    ResponderPh2W4LtkRequest,
    ResponderPh2SendLtkReply,
    ResponderPh4YW4Enc,
    ResponderPh4LtkGetEnc,
    ResponderPh4LtkW4Enc,
    ResponderPh4SendLtkReply,

    // Secure Connections
    ScSendPublicKeyCommand,
    ScW4PublicKeyCommand,
    ScW4LocalNonce,
    ScW2CmacForConfirmation,
    ScW4CmacForConfirmation,
    ScSendConfirmation,
    ScW2CmacForCheckConfirmation,
    ScW4CmacForCheckConfirmation,
    ScW4Confirmation,
    ScSendPairingRandom,
    ScW4PairingRandom,
    ScW2CalculateG2,
    ScW4CalculateG2,
    ScW4CalculateDhKey,
    ScW2CalculateF5Salt,
    ScW4CalculateF5Salt,
    ScW2CalculateF5MacKey,
    ScW4CalculateF5MacKey,
    ScW2CalculateF5Ltk,
    ScW4CalculateF5Ltk,
    ScW2CalculateF6ForDhKeyCheck,
    ScW4CalculateF6ForDhKeyCheck,
    ScW2CalculateF6ToVerifyDhKeyCheck,
    ScW4CalculateF6ToVerifyDhKeyCheck,
    ScSendDhKeyCheckCommand,
    ScW4DhKeyCheckCommand,
    ScW4LtkRequestSc,
    ScReceivedLtkRequest,
    ScW4UserResponse,

    // cross-transport key derivation
    ScW2CalculateIlkUsingH6,
    ScW2CalculateIlkUsingH7,
    ScW4CalculateIlk,
    ScW2CalculateBrEdrLinkKey,
    ScW4CalculateBrEdrLinkKey,
}

impl SmState {
    /// Role idle state, or the general idle state before the role is known
    pub fn is_idle(self) -> bool {
        matches!(
            self,
            SmState::Idle | SmState::InitiatorConnected | SmState::ResponderIdle
        )
    }

    /// States that need the setup context before they can make progress
    pub(crate) fn needs_setup(self) -> bool {
        matches!(
            self,
            SmState::ResponderSendSecurityRequest
                | SmState::ResponderPh1PairingRequestReceived
                | SmState::ResponderPh0ReceivedLtkRequest
                | SmState::ScReceivedLtkRequest
                | SmState::InitiatorPh4HasLtk
                | SmState::InitiatorPh1W2SendPairingRequest
        )
    }

    /// States that start a pairing and therefore need the local EC key first
    pub(crate) fn needs_ec_key(self) -> bool {
        matches!(
            self,
            SmState::ResponderPh1PairingRequestReceived
                | SmState::InitiatorPh1W2SendPairingRequest
                | SmState::ResponderSendSecurityRequest
        )
    }

    /// States in which a DHKey Check PDU may arrive early and is kept for later
    pub(crate) fn accepts_early_dhkey_check(self) -> bool {
        matches!(
            self,
            SmState::ScW2CalculateG2
                | SmState::ScW4CalculateG2
                | SmState::ScW4CalculateDhKey
                | SmState::ScW2CalculateF5Salt
                | SmState::ScW4CalculateF5Salt
                | SmState::ScW2CalculateF5MacKey
                | SmState::ScW4CalculateF5MacKey
                | SmState::ScW2CalculateF5Ltk
                | SmState::ScW4CalculateF5Ltk
                | SmState::ScW2CalculateF6ForDhKeyCheck
                | SmState::ScW4DhKeyCheckCommand
                | SmState::ScW4CalculateF6ForDhKeyCheck
                | SmState::ScW4UserResponse
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_states() {
        assert!(SmState::Idle.is_idle());
        assert!(SmState::InitiatorConnected.is_idle());
        assert!(SmState::ResponderIdle.is_idle());
        assert!(!SmState::Timeout.is_idle());
        assert!(!SmState::ReencryptionFailed.is_idle());
    }

    #[test]
    fn test_setup_states_need_ec_key_subset() {
        for state in [
            SmState::ResponderPh1PairingRequestReceived,
            SmState::InitiatorPh1W2SendPairingRequest,
            SmState::ResponderSendSecurityRequest,
        ] {
            assert!(state.needs_ec_key());
            assert!(state.needs_setup());
        }
        assert!(SmState::InitiatorPh4HasLtk.needs_setup());
        assert!(!SmState::InitiatorPh4HasLtk.needs_ec_key());
        assert!(!SmState::ScW4DhKeyCheckCommand.needs_setup());
    }
}
