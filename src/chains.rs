//! Static chain registry: per-chain family, network parameters and precision.
//!
//! A data-driven capability table replaces chain-symbol switches at call
//! sites: callers look a chain up once and branch on [`ChainFamily`].

use crate::error::{Error, Result};

/// How a (chain, token) pair can be withdrawn
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenCapability {
    /// Plain value transfer from the owning wallet
    Native,
    /// ERC20-Permit (EIP-2612) token: gasless owner approval
    Permit,
    /// No permit support: spend from the custodial contract pool
    Custodial,
}

/// Base58 version bytes and bech32 prefix of one UTXO network. Each
/// chain encodes addresses and WIF keys with its own constants, so a
/// destination pasted for the wrong chain fails to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UtxoParams {
    pub p2pkh_prefix: u8,
    pub p2sh_prefix: u8,
    pub wif_prefix: u8,
    pub bech32_hrp: Option<&'static str>,
}

pub const BITCOIN_PARAMS: UtxoParams = UtxoParams {
    p2pkh_prefix: 0x00,
    p2sh_prefix: 0x05,
    wif_prefix: 0x80,
    bech32_hrp: Some("bc"),
};

pub const BITCOIN_TESTNET_PARAMS: UtxoParams = UtxoParams {
    p2pkh_prefix: 0x6f,
    p2sh_prefix: 0xc4,
    wif_prefix: 0xef,
    bech32_hrp: Some("tb"),
};

pub const LITECOIN_PARAMS: UtxoParams = UtxoParams {
    p2pkh_prefix: 0x30,
    p2sh_prefix: 0x32,
    wif_prefix: 0xb0,
    bech32_hrp: Some("ltc"),
};

pub const DOGECOIN_PARAMS: UtxoParams = UtxoParams {
    p2pkh_prefix: 0x1e,
    p2sh_prefix: 0x16,
    wif_prefix: 0x9e,
    bech32_hrp: None,
};

pub const DASH_PARAMS: UtxoParams = UtxoParams {
    p2pkh_prefix: 0x4c,
    p2sh_prefix: 0x10,
    wif_prefix: 0xcc,
    bech32_hrp: None,
};

/// Chain family with its network parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainFamily {
    Evm { chain_id: u64 },
    Utxo { params: UtxoParams },
}

/// One row of the registry
#[derive(Debug, Clone)]
pub struct ChainSpec {
    pub symbol: &'static str,
    pub family: ChainFamily,
    /// Decimals of the native unit (8 for UTXO chains, 18 for EVM)
    pub decimals: u32,
    /// Fastest-confirmation chains use a fixed flat network fee instead of
    /// the size-based estimate
    pub fixed_fee_sats: Option<u64>,
    /// Etherscan-style explorer API, for remote ABI lookup on EVM chains
    pub explorer_api: Option<&'static str>,
}

const REGISTRY: &[ChainSpec] = &[
    ChainSpec {
        symbol: "ETH",
        family: ChainFamily::Evm { chain_id: 1 },
        decimals: 18,
        fixed_fee_sats: None,
        explorer_api: Some("https://api.etherscan.io/api"),
    },
    ChainSpec {
        symbol: "BSC",
        family: ChainFamily::Evm { chain_id: 56 },
        decimals: 18,
        fixed_fee_sats: None,
        explorer_api: Some("https://api.bscscan.com/api"),
    },
    ChainSpec {
        symbol: "POLYGON",
        family: ChainFamily::Evm { chain_id: 137 },
        decimals: 18,
        fixed_fee_sats: None,
        explorer_api: Some("https://api.polygonscan.com/api"),
    },
    ChainSpec {
        symbol: "ARBITRUM",
        family: ChainFamily::Evm { chain_id: 42161 },
        decimals: 18,
        fixed_fee_sats: None,
        explorer_api: Some("https://api.arbiscan.io/api"),
    },
    ChainSpec {
        symbol: "BTC",
        family: ChainFamily::Utxo {
            params: BITCOIN_PARAMS,
        },
        decimals: 8,
        fixed_fee_sats: Some(380),
        explorer_api: None,
    },
    ChainSpec {
        symbol: "LTC",
        family: ChainFamily::Utxo {
            params: LITECOIN_PARAMS,
        },
        decimals: 8,
        fixed_fee_sats: None,
        explorer_api: None,
    },
    ChainSpec {
        symbol: "DOGE",
        family: ChainFamily::Utxo {
            params: DOGECOIN_PARAMS,
        },
        decimals: 8,
        fixed_fee_sats: None,
        explorer_api: None,
    },
    ChainSpec {
        symbol: "DASH",
        family: ChainFamily::Utxo {
            params: DASH_PARAMS,
        },
        decimals: 8,
        fixed_fee_sats: None,
        explorer_api: None,
    },
];

/// Symbols of every chain the engine can settle on
pub fn supported_chains() -> impl Iterator<Item = &'static str> {
    REGISTRY.iter().map(|spec| spec.symbol)
}

/// Look up a chain in the registry
pub fn chain_spec(chain: &str) -> Result<&'static ChainSpec> {
    REGISTRY
        .iter()
        .find(|spec| spec.symbol == chain)
        .ok_or_else(|| Error::UnsupportedChain(chain.to_string()))
}

/// True when the chain settles through the UTXO engine
pub fn is_utxo_chain(chain: &str) -> bool {
    matches!(
        chain_spec(chain).map(|s| s.family),
        Ok(ChainFamily::Utxo { .. })
    )
}

/// Encoding parameters to sign against, honoring the testnet switch for BTC
pub fn utxo_params(chain: &str, testnet: bool) -> Result<UtxoParams> {
    match chain_spec(chain)?.family {
        ChainFamily::Utxo { params } => {
            if chain == "BTC" && testnet {
                Ok(BITCOIN_TESTNET_PARAMS)
            } else {
                Ok(params)
            }
        }
        ChainFamily::Evm { .. } => Err(Error::UnsupportedChain(format!(
            "{chain} is not a UTXO chain"
        ))),
    }
}

/// Convert a standard-unit amount to satoshis for a UTXO chain
pub fn standard_unit_to_satoshi(amount: f64, chain: &str) -> Result<u64> {
    let decimals = chain_spec(chain)?.decimals;
    let scaled = amount * 10f64.powi(decimals as i32);
    if scaled < 0.0 {
        return Err(Error::Internal(format!("negative amount: {amount}")));
    }
    Ok(scaled.round() as u64)
}

/// Convert satoshis back to standard units
pub fn satoshi_to_standard_unit(sats: u64, chain: &str) -> Result<f64> {
    let decimals = chain_spec(chain)?.decimals;
    Ok(sats as f64 / 10f64.powi(decimals as i32))
}

/// UNIX timestamp in seconds, used for permit deadlines
pub fn timestamp_secs() -> u64 {
    chrono::Utc::now().timestamp() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_lookup() {
        let btc = chain_spec("BTC").unwrap();
        assert!(matches!(btc.family, ChainFamily::Utxo { .. }));
        assert_eq!(btc.fixed_fee_sats, Some(380));

        let eth = chain_spec("ETH").unwrap();
        assert!(matches!(eth.family, ChainFamily::Evm { chain_id: 1 }));

        assert!(chain_spec("XMR").is_err());
    }

    #[test]
    fn test_family_predicate() {
        assert!(is_utxo_chain("BTC"));
        assert!(is_utxo_chain("DOGE"));
        assert!(!is_utxo_chain("ETH"));
        assert!(!is_utxo_chain("XMR"));
    }

    #[test]
    fn test_unit_conversions_round_trip() {
        let sats = standard_unit_to_satoshi(0.6, "BTC").unwrap();
        assert_eq!(sats, 60_000_000);
        let back = satoshi_to_standard_unit(sats, "BTC").unwrap();
        assert!((back - 0.6).abs() < 1e-12);
    }

    #[test]
    fn test_testnet_switch_only_affects_btc() {
        assert_eq!(utxo_params("BTC", true).unwrap(), BITCOIN_TESTNET_PARAMS);
        assert_eq!(utxo_params("BTC", false).unwrap(), BITCOIN_PARAMS);
        assert_eq!(utxo_params("LTC", true).unwrap(), LITECOIN_PARAMS);
        assert!(utxo_params("ETH", false).is_err());
    }

    #[test]
    fn test_each_utxo_chain_has_distinct_prefixes() {
        let chains = ["BTC", "LTC", "DOGE", "DASH"];
        let prefixes: Vec<u8> = chains
            .iter()
            .map(|c| utxo_params(c, false).unwrap().p2pkh_prefix)
            .collect();
        for (i, a) in prefixes.iter().enumerate() {
            for b in &prefixes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
