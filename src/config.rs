use serde::Deserialize;
use thiserror::Error;

use crate::common::U256;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("malformed config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("x2c_rate must be positive")]
    ZeroX2cRate,
}

/// VM settings, read from the config bytes handed over by the consensus host.
#[derive(Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct VmConfig {
    /// Fee of an atomic transaction, in UTXO denomination.
    pub tx_fee: u64,
    /// UTXO denomination to EVM denomination scaling factor.
    pub x2c_rate: u64,
    /// Minimum gas price (wei) of ordinary transactions once bootstrapped.
    pub min_gas_price: u64,
    pub block_gas_limit: u64,
    pub max_block_txs: usize,
    pub block_cache_size: usize,
    pub status_cache_size: usize,
    /// Should grow with the fork width the host tolerates.
    pub ancestor_input_cache_size: usize,
    pub accepted_input_cache_size: usize,
    pub issued_queue_capacity: usize,
    pub reissue_queue_capacity: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            tx_fee: 1_000_000,
            x2c_rate: 1_000_000_000,
            min_gas_price: 470_000_000_000,
            block_gas_limit: 8_000_000,
            max_block_txs: 256,
            block_cache_size: 2048,
            status_cache_size: 2048,
            ancestor_input_cache_size: 4096,
            accepted_input_cache_size: 8192,
            issued_queue_capacity: 4096,
            reissue_queue_capacity: 1024,
        }
    }
}

impl VmConfig {
    /// An empty input yields the defaults.
    pub fn from_json(bytes: &[u8]) -> Result<Self, ConfigError> {
        if bytes.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(Self::default())
        }
        let cfg: Self = serde_json::from_slice(bytes)?;
        if cfg.x2c_rate == 0 {
            return Err(ConfigError::ZeroX2cRate)
        }
        Ok(cfg)
    }

    pub fn x2c_rate(&self) -> U256 {
        self.x2c_rate.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_json() {
        assert_eq!(VmConfig::from_json(b"").unwrap(), VmConfig::default());
        let cfg =
            VmConfig::from_json(br#"{"tx_fee": 1, "x2c_rate": 10}"#).unwrap();
        assert_eq!(cfg.tx_fee, 1);
        assert_eq!(cfg.x2c_rate(), U256::from(10u64));
        assert_eq!(cfg.min_gas_price, VmConfig::default().min_gas_price);
        assert!(matches!(
            VmConfig::from_json(br#"{"nope": 1}"#),
            Err(ConfigError::Json(_))
        ));
        assert!(matches!(
            VmConfig::from_json(br#"{"x2c_rate": 0}"#),
            Err(ConfigError::ZeroX2cRate)
        ));
    }
}
