//! Phase 1 negotiation rules
//!
//! Association model selection, encryption key size negotiation and the key
//! distribution wish lists derived from the local authentication requirements.

use super::pdu::PairingFeatures;
use super::types::*;

use StkGenerationMethod::{
    JustWorks as JW, NumericComparison as NC, PasskeyBothInput as PK_BOTH,
    PasskeyInitiatorInput as PK_INIT, PasskeyResponderInput as PK_RESP,
};

/// Legacy association models, indexed by [responder IO capability][initiator IO capability]
const LEGACY_ASSOCIATION: [[StkGenerationMethod; 5]; 5] = [
    [JW, JW, PK_INIT, JW, PK_INIT],
    [JW, JW, PK_INIT, JW, PK_INIT],
    [PK_RESP, PK_RESP, PK_BOTH, JW, PK_RESP],
    [JW, JW, JW, JW, JW],
    [PK_RESP, PK_RESP, PK_INIT, JW, PK_RESP],
];

/// Secure Connections association models, same indexing
const SC_ASSOCIATION: [[StkGenerationMethod; 5]; 5] = [
    [JW, JW, PK_INIT, JW, PK_INIT],
    [JW, NC, PK_INIT, JW, NC],
    [PK_RESP, PK_RESP, PK_BOTH, JW, PK_RESP],
    [JW, JW, JW, JW, JW],
    [PK_RESP, NC, PK_INIT, JW, NC],
];

/// Both sides set the Secure Connections bit
pub fn use_secure_connections(preq: &PairingFeatures, pres: &PairingFeatures) -> bool {
    (preq.auth_req & pres.auth_req).contains(AuthReq::SECURE_CONNECTIONS)
}

/// Association model for a Pairing Request/Response pair
///
/// OOB wins when both sides have OOB data (either side for Secure
/// Connections). Without MITM on either side the result is Just Works.
/// Reserved IO capabilities fall back to Just Works.
pub fn stk_generation_method(
    preq: &PairingFeatures,
    pres: &PairingFeatures,
    use_sc: bool,
) -> StkGenerationMethod {
    let oob = if use_sc {
        preq.has_oob_data() || pres.has_oob_data()
    } else {
        preq.has_oob_data() && pres.has_oob_data()
    };
    if oob {
        return StkGenerationMethod::Oob;
    }

    if !(preq.auth_req | pres.auth_req).contains(AuthReq::MITM) {
        return JW;
    }

    let initiator = preq.io_capability as usize;
    let responder = pres.io_capability as usize;
    if initiator > 4 || responder > 4 {
        return JW;
    }

    if use_sc {
        SC_ASSOCIATION[responder][initiator]
    } else {
        LEGACY_ASSOCIATION[responder][initiator]
    }
}

/// Negotiated key size, 0 if the peer's maximum is below our minimum
pub fn actual_encryption_key_size(other: u8, min: u8, max: u8) -> u8 {
    if other < min {
        return 0;
    }
    other.min(max)
}

/// Association model is enabled locally
pub fn method_accepted(method: StkGenerationMethod, accepted: AcceptedMethods) -> bool {
    accepted.contains(method.required_acceptance())
}

/// Keys we offer and request, derived from our authentication requirements
pub fn key_distribution_for_auth_req(auth_req: AuthReq, cross_transport: bool) -> KeyDistribution {
    let mut flags = KeyDistribution::ID_KEY;
    if auth_req.contains(AuthReq::BONDING) {
        flags |= KeyDistribution::ENC_KEY | KeyDistribution::SIGN_KEY;
        if cross_transport && auth_req.contains(AuthReq::SECURE_CONNECTIONS) {
            flags |= KeyDistribution::LINK_KEY;
        }
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smp::constants::*;

    fn features(io: IoCapability, auth_req: AuthReq, oob: bool) -> PairingFeatures {
        PairingFeatures {
            io_capability: io.to_u8(),
            oob_data_flag: oob as u8,
            auth_req,
            ..Default::default()
        }
    }

    const ALL_IO: [IoCapability; 5] = [
        IoCapability::DisplayOnly,
        IoCapability::DisplayYesNo,
        IoCapability::KeyboardOnly,
        IoCapability::NoInputNoOutput,
        IoCapability::KeyboardDisplay,
    ];

    /// Expected model per (initiator, responder) from the mapping of IO capabilities
    fn expected(initiator: IoCapability, responder: IoCapability, sc: bool) -> StkGenerationMethod {
        use IoCapability::*;
        match (initiator, responder) {
            (NoInputNoOutput, _) | (_, NoInputNoOutput) => JW,
            (KeyboardOnly, KeyboardOnly) => PK_BOTH,
            (KeyboardOnly, _) => PK_INIT,
            (_, KeyboardOnly) => PK_RESP,
            (DisplayYesNo | KeyboardDisplay, DisplayYesNo | KeyboardDisplay) if sc => NC,
            (DisplayOnly | DisplayYesNo, DisplayOnly | DisplayYesNo) => JW,
            (KeyboardDisplay, DisplayOnly | DisplayYesNo) => PK_INIT,
            (DisplayOnly | DisplayYesNo, KeyboardDisplay) => PK_RESP,
            (KeyboardDisplay, KeyboardDisplay) => PK_RESP,
        }
    }

    #[test]
    fn test_association_tables() {
        let mitm_sc = AuthReq::MITM | AuthReq::SECURE_CONNECTIONS;
        for initiator in ALL_IO {
            for responder in ALL_IO {
                let preq = features(initiator, AuthReq::MITM, false);
                let pres = features(responder, AuthReq::MITM, false);
                assert_eq!(
                    stk_generation_method(&preq, &pres, false),
                    expected(initiator, responder, false),
                    "legacy {} / {}",
                    initiator,
                    responder
                );

                let preq = features(initiator, mitm_sc, false);
                let pres = features(responder, mitm_sc, false);
                assert!(use_secure_connections(&preq, &pres));
                assert_eq!(
                    stk_generation_method(&preq, &pres, true),
                    expected(initiator, responder, true),
                    "sc {} / {}",
                    initiator,
                    responder
                );
            }
        }
    }

    #[test]
    fn test_no_mitm_is_just_works() {
        for initiator in ALL_IO {
            for responder in ALL_IO {
                let preq = features(initiator, AuthReq::BONDING, false);
                let pres = features(responder, AuthReq::SECURE_CONNECTIONS, false);
                assert_eq!(stk_generation_method(&preq, &pres, false), JW);
                assert_eq!(stk_generation_method(&preq, &pres, true), JW);
            }
        }
        // one side asking for MITM is enough
        let preq = features(IoCapability::KeyboardOnly, AuthReq::empty(), false);
        let pres = features(IoCapability::DisplayOnly, AuthReq::MITM, false);
        assert_eq!(stk_generation_method(&preq, &pres, false), PK_INIT);
    }

    #[test]
    fn test_oob_overrides_table() {
        let io = IoCapability::KeyboardOnly;
        let both_legacy = stk_generation_method(
            &features(io, AuthReq::MITM, true),
            &features(io, AuthReq::MITM, true),
            false,
        );
        assert_eq!(both_legacy, StkGenerationMethod::Oob);

        // legacy needs OOB data on both sides
        let one_legacy = stk_generation_method(
            &features(io, AuthReq::MITM, true),
            &features(io, AuthReq::MITM, false),
            false,
        );
        assert_eq!(one_legacy, PK_BOTH);

        // Secure Connections needs it on one side, even without MITM
        let one_sc = stk_generation_method(
            &features(io, AuthReq::SECURE_CONNECTIONS, false),
            &features(io, AuthReq::SECURE_CONNECTIONS, true),
            true,
        );
        assert_eq!(one_sc, StkGenerationMethod::Oob);
    }

    #[test]
    fn test_reserved_io_capability() {
        let mut preq = features(IoCapability::KeyboardOnly, AuthReq::MITM, false);
        let pres = features(IoCapability::KeyboardOnly, AuthReq::MITM, false);
        preq.io_capability = 0x05;
        assert_eq!(stk_generation_method(&preq, &pres, false), JW);
    }

    #[test]
    fn test_actual_encryption_key_size() {
        for min in SMP_MIN_ENCRYPTION_KEY_SIZE..=SMP_MAX_ENCRYPTION_KEY_SIZE {
            for max in min..=SMP_MAX_ENCRYPTION_KEY_SIZE {
                for other in 0..=16u8 {
                    let size = actual_encryption_key_size(other, min, max);
                    if other < min {
                        assert_eq!(size, 0);
                    } else {
                        assert_eq!(size, other.min(max));
                    }
                    assert_eq!(actual_encryption_key_size(other, min, max), size);
                }
            }
        }
    }

    #[test]
    fn test_method_accepted() {
        let all = AcceptedMethods::all();
        for method in [JW, PK_INIT, PK_RESP, PK_BOTH, NC, StkGenerationMethod::Oob] {
            assert!(method_accepted(method, all));
        }
        // numeric comparison needs its own bit
        let no_nc = AcceptedMethods::JUST_WORKS | AcceptedMethods::PASSKEY | AcceptedMethods::OOB;
        assert!(!method_accepted(NC, no_nc));
        assert!(method_accepted(PK_BOTH, AcceptedMethods::PASSKEY));
        assert!(!method_accepted(JW, AcceptedMethods::PASSKEY));
    }

    #[test]
    fn test_key_distribution_for_auth_req() {
        assert_eq!(
            key_distribution_for_auth_req(AuthReq::empty(), true),
            KeyDistribution::ID_KEY
        );
        assert_eq!(
            key_distribution_for_auth_req(AuthReq::BONDING, true),
            KeyDistribution::ID_KEY | KeyDistribution::ENC_KEY | KeyDistribution::SIGN_KEY
        );
        let sc_bonding = AuthReq::BONDING | AuthReq::SECURE_CONNECTIONS;
        assert!(key_distribution_for_auth_req(sc_bonding, true).contains(KeyDistribution::LINK_KEY));
        assert!(!key_distribution_for_auth_req(sc_bonding, false).contains(KeyDistribution::LINK_KEY));
    }
}
