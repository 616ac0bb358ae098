//! Security manager configuration

use super::constants::*;
use super::types::*;
use crate::gap::{BdAddr, RandomAddressMode, RANDOM_ADDRESS_UPDATE_PERIOD_DEFAULT};
use std::time::Duration;

/// Security manager configuration
#[derive(Debug, Clone)]
pub struct SecurityManagerConfig {
    /// Local IO capability
    pub io_capability: IoCapability,
    /// Authentication requirements sent in Pairing Request/Response
    pub auth_req: AuthReq,
    /// Association models we agree to
    pub accepted_methods: AcceptedMethods,
    pub min_encryption_key_size: u8,
    pub max_encryption_key_size: u8,
    /// LE Secure Connections support
    pub secure_connections_enabled: bool,
    /// Refuse legacy pairing and keys shorter than 128 bits
    pub secure_connections_only: bool,
    /// Responder sends a Security Request as soon as the peer is resolved
    pub request_security: bool,
    /// Passkey to show instead of a random one
    pub fixed_passkey: Option<u32>,
    /// Answer LTK requests with EDIV/RAND even without a bonding record
    pub reconstruct_ltk_without_db_entry: bool,
    /// Derive a BR/EDR link key after LE Secure Connections bonding
    pub cross_transport_key_derivation: bool,
    /// Encryption Root, the test value is used when unset
    pub er: Option<[u8; 16]>,
    /// Identity Root, the test value is used when unset
    pub ir: Option<[u8; 16]>,
    /// Public address of the local controller
    pub public_address: BdAddr,
    pub random_address_mode: RandomAddressMode,
    pub random_address_update_period: Duration,
}

impl Default for SecurityManagerConfig {
    fn default() -> Self {
        Self {
            io_capability: IoCapability::NoInputNoOutput,
            auth_req: AuthReq::BONDING,
            accepted_methods: AcceptedMethods::all(),
            min_encryption_key_size: SMP_MIN_ENCRYPTION_KEY_SIZE,
            max_encryption_key_size: SMP_MAX_ENCRYPTION_KEY_SIZE,
            secure_connections_enabled: true,
            secure_connections_only: false,
            request_security: false,
            fixed_passkey: None,
            reconstruct_ltk_without_db_entry: true,
            cross_transport_key_derivation: false,
            er: None,
            ir: None,
            public_address: BdAddr::default(),
            random_address_mode: RandomAddressMode::Off,
            random_address_update_period: Duration::from_secs(RANDOM_ADDRESS_UPDATE_PERIOD_DEFAULT),
        }
    }
}

impl SecurityManagerConfig {
    pub fn er(&self) -> [u8; 16] {
        self.er.unwrap_or(SMP_DEFAULT_ER)
    }

    pub fn ir(&self) -> [u8; 16] {
        self.ir.unwrap_or(SMP_DEFAULT_IR)
    }

    /// Check the key size range
    pub fn validate(&self) -> SmResult<()> {
        let range = SMP_MIN_ENCRYPTION_KEY_SIZE..=SMP_MAX_ENCRYPTION_KEY_SIZE;
        if !range.contains(&self.min_encryption_key_size)
            || !range.contains(&self.max_encryption_key_size)
            || self.min_encryption_key_size > self.max_encryption_key_size
        {
            return Err(SmError::InvalidParameter(format!(
                "encryption key size range {}..={}",
                self.min_encryption_key_size, self.max_encryption_key_size
            )));
        }
        if let Some(passkey) = self.fixed_passkey {
            if passkey > SMP_PASSKEY_MAX {
                return Err(SmError::InvalidParameter(format!("passkey {}", passkey)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SecurityManagerConfig::default();
        assert_eq!(config.io_capability, IoCapability::NoInputNoOutput);
        assert_eq!(config.auth_req, AuthReq::BONDING);
        assert!(config.accepted_methods.contains(AcceptedMethods::NUMERIC_COMPARISON));
        assert_eq!(config.er(), SMP_DEFAULT_ER);
        assert_eq!(config.ir(), SMP_DEFAULT_IR);
        assert_eq!(config.random_address_update_period, Duration::from_secs(900));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_ranges() {
        let config = SecurityManagerConfig {
            min_encryption_key_size: 12,
            max_encryption_key_size: 10,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = SecurityManagerConfig {
            max_encryption_key_size: 17,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = SecurityManagerConfig {
            fixed_passkey: Some(1_000_000),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
