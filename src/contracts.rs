//! Contract bindings, artifact loading and remote ABI lookup.
//!
//! The permit and custodial send paths encode calldata through the `sol!`
//! bindings below. Compiled artifacts (custodial wallet bytecode) come
//! from JSON files on disk; unknown token contracts can have their ABI
//! pulled from the chain's block explorer for inspection tooling.

use std::path::{Path, PathBuf};
use std::time::Duration;

use alloy::sol;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::chains::chain_spec;
use crate::config::Config;
use crate::error::{Error, Result};

sol! {
    /// EIP-2612 surface of a permit-capable ERC-20
    #[derive(Debug)]
    interface IERC20Permit {
        function name() external view returns (string);
        function decimals() external view returns (uint8);
        function balanceOf(address owner) external view returns (uint256);
        function nonces(address owner) external view returns (uint256);
        function permit(
            address owner,
            address spender,
            uint256 value,
            uint256 deadline,
            uint8 v,
            bytes32 r,
            bytes32 s
        ) external;
        function transferFrom(address from, address to, uint256 amount) external returns (bool);
    }

    /// Pooled custodial wallet contract
    #[derive(Debug)]
    interface ICustodialWallet {
        function getNativeBalance() external view returns (uint256);
        function getTokenBalance(address token) external view returns (uint256);
        function transferNative(address to, uint256 amount) external;
        function transferTokens(address token, address to, uint256 amount) external;
    }

    /// EIP-712 payload signed by the token owner for permit()
    #[derive(Debug)]
    struct Permit {
        address owner;
        address spender;
        uint256 value;
        uint256 nonce;
        uint256 deadline;
    }
}

/// Compiled contract artifact as produced by the build pipeline
#[derive(Debug, Clone, Deserialize)]
pub struct ContractArtifact {
    pub abi: Value,
    pub bytecode: String,
}

/// Loads compiled artifacts from a directory of `<Name>.json` files
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.artifacts_dir)
    }

    /// Load `<category>/<name>.json` and check it carries both abi and
    /// bytecode
    pub fn load(&self, category: &str, name: &str) -> Result<ContractArtifact> {
        let path = self.dir.join(category).join(format!("{name}.json"));
        let raw = std::fs::read_to_string(&path)
            .map_err(|_| Error::ArtifactNotFound(path.display().to_string()))?;
        let artifact: ContractArtifact = serde_json::from_str(&raw)
            .map_err(|e| Error::ArtifactNotFound(format!("{}: {e}", path.display())))?;
        if artifact.abi.is_null() || artifact.bytecode.is_empty() {
            return Err(Error::ArtifactNotFound(format!(
                "{}: missing abi or bytecode",
                path.display()
            )));
        }
        Ok(artifact)
    }
}

#[derive(Debug, Deserialize)]
struct ExplorerResponse {
    status: String,
    result: String,
}

/// Fetch a verified contract ABI from the chain's block explorer
pub async fn fetch_abi_from_explorer(
    chain: &str,
    contract_address: &str,
    config: &Config,
) -> Result<Value> {
    let spec = chain_spec(chain)?;
    let api = spec
        .explorer_api
        .ok_or_else(|| Error::Config(format!("no explorer API for {chain}")))?;
    let api_key = config
        .chain_endpoints(chain)
        .map(|ep| ep.explorer_api_key.clone())
        .unwrap_or_default();

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.utxo.http_timeout_secs))
        .build()?;
    let url = format!(
        "{api}?module=contract&action=getabi&address={contract_address}&apikey={api_key}"
    );
    debug!(chain, contract_address, "fetching verified ABI");

    let response: ExplorerResponse = client.get(&url).send().await?.json().await?;
    if response.status != "1" {
        return Err(Error::Rpc(format!(
            "explorer ABI lookup failed for {contract_address} on {chain}: {}",
            response.result
        )));
    }
    serde_json::from_str(&response.result).map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_artifact_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("wallet")).unwrap();
        let path = dir.path().join("wallet/CustodialWallet.json");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(
            file,
            r#"{{"abi":[{{"type":"function","name":"transferNative"}}],"bytecode":"0x6080"}}"#
        )
        .unwrap();

        let store = ArtifactStore::new(dir.path());
        let artifact = store.load("wallet", "CustodialWallet").unwrap();
        assert_eq!(artifact.bytecode, "0x6080");
        assert!(artifact.abi.is_array());

        // Same name under another category is a different artifact
        let err = store.load("token", "CustodialWallet").unwrap_err();
        assert!(matches!(err, Error::ArtifactNotFound(_)));
    }

    #[test]
    fn test_missing_artifact_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let err = store.load("wallet", "Nope").unwrap_err();
        assert!(matches!(err, Error::ArtifactNotFound(_)));
    }

    #[test]
    fn test_artifact_without_bytecode_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("wallet")).unwrap();
        let path = dir.path().join("wallet/Partial.json");
        std::fs::write(&path, r#"{"abi":[],"bytecode":""}"#).unwrap();

        let store = ArtifactStore::new(dir.path());
        let err = store.load("wallet", "Partial").unwrap_err();
        assert!(matches!(err, Error::ArtifactNotFound(_)));
    }
}
