use std::fmt;

use ethers::providers::{Http, Middleware, Provider, ProviderError};
use ethers::signers::{LocalWallet, Signer as _};
use ethers::types::H160;
use futures::future;

use crate::address::Address;
use crate::error::{InboxError, InboxResult};
use crate::sdk::{BoxFuture, NameResolver, SdkError, SdkResult, Signer};

pub const FALLBACK_RPC_URL: &str = "https://cloudflare-eth.com";
const PRIVATE_KEY_HEX_LEN: usize = 64;
const SIGNATURE_LEN: usize = 65;

/// Where name lookups are sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub network: String,
    pub infura_key: Option<String>,
    pub rpc_url: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            network: "mainnet".to_string(),
            infura_key: None,
            rpc_url: None,
        }
    }
}

impl ProviderConfig {
    /// Explicit RPC URL, else Infura when a key is set, else the public fallback.
    pub fn endpoint(&self) -> String {
        if let Some(rpc_url) = &self.rpc_url {
            return rpc_url.clone();
        }
        match &self.infura_key {
            Some(key) => format!("https://{}.infura.io/v3/{key}", self.network),
            None => FALLBACK_RPC_URL.to_string(),
        }
    }
}

/// Signer over a raw secp256k1 secret held in memory.
pub struct LocalSigner {
    wallet: LocalWallet,
    address: Address,
}

impl LocalSigner {
    pub fn from_private_key(raw: &str) -> InboxResult<Self> {
        let clean = raw.trim().trim_start_matches("0x").trim_start_matches("0X");
        if clean.len() != PRIVATE_KEY_HEX_LEN || !clean.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(InboxError::InvalidKey {
                stage: "private-key-format",
                details: format!("expected {PRIVATE_KEY_HEX_LEN} hex digits"),
            });
        }

        let bytes = hex::decode(clean).map_err(|error| InboxError::InvalidKey {
            stage: "private-key-decode",
            details: error.to_string(),
        })?;
        let wallet = LocalWallet::from_bytes(&bytes).map_err(|error| InboxError::InvalidKey {
            stage: "private-key-scalar",
            details: error.to_string(),
        })?;
        Self::from_wallet(wallet)
    }

    pub fn random() -> InboxResult<Self> {
        Self::from_wallet(LocalWallet::new(&mut rand::thread_rng()))
    }

    fn from_wallet(wallet: LocalWallet) -> InboxResult<Self> {
        let address = Address::parse(&format!("{:#x}", wallet.address()))?;
        Ok(Self { wallet, address })
    }
}

impl fmt::Debug for LocalSigner {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("LocalSigner")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl Signer for LocalSigner {
    fn address(&self) -> Address {
        self.address.clone()
    }

    fn sign_message<'a>(&'a self, message: &'a [u8]) -> BoxFuture<'a, SdkResult<Vec<u8>>> {
        let hash = ethers::utils::hash_message(message);
        let result = self
            .wallet
            .sign_hash(hash)
            .map(|signature| signature.to_vec())
            .map_err(|error| SdkError::Rejected {
                stage: "local-sign-hash",
                details: error.to_string(),
            })
            .and_then(|bytes| {
                if bytes.len() == SIGNATURE_LEN {
                    Ok(bytes)
                } else {
                    Err(SdkError::Rejected {
                        stage: "local-signature-length",
                        details: format!("expected {SIGNATURE_LEN} bytes, got {}", bytes.len()),
                    })
                }
            });
        Box::pin(future::ready(result))
    }
}

/// ENS lookups over JSON-RPC.
#[derive(Debug, Clone)]
pub struct EnsNameResolver {
    provider: Provider<Http>,
}

impl EnsNameResolver {
    pub fn new(config: &ProviderConfig) -> InboxResult<Self> {
        let endpoint = config.endpoint();
        let provider = Provider::<Http>::try_from(endpoint.as_str()).map_err(|error| {
            InboxError::InvalidConfiguration {
                stage: "ens-provider-url",
                details: format!("invalid RPC URL {endpoint}: {error}"),
            }
        })?;
        Ok(Self { provider })
    }
}

impl NameResolver for EnsNameResolver {
    fn resolve_name<'a>(&'a self, name: &'a str) -> BoxFuture<'a, SdkResult<Option<Address>>> {
        Box::pin(async move {
            let resolved = match self.provider.resolve_name(name).await {
                Ok(address) => address,
                Err(ProviderError::EnsError(details)) => {
                    tracing::debug!(name, details = %details, "name has no resolver");
                    return Ok(None);
                }
                Err(error) => {
                    return Err(SdkError::Network {
                        stage: "ens-resolve-name",
                        details: error.to_string(),
                    });
                }
            };

            if resolved == H160::zero() {
                return Ok(None);
            }
            Address::parse(&format!("{resolved:#x}"))
                .map(Some)
                .map_err(|error| SdkError::Rejected {
                    stage: "ens-parse-address",
                    details: error.to_string(),
                })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

    #[test]
    fn known_key_derives_its_address() {
        let signer = LocalSigner::from_private_key(KEY).unwrap();
        assert_eq!(
            signer.address().as_str(),
            "0x2c7536e3605d9c16a7a3d7b1898e529396a65c23"
        );

        let unprefixed = LocalSigner::from_private_key(&KEY[2..]).unwrap();
        assert_eq!(unprefixed.address(), signer.address());
    }

    #[test]
    fn malformed_keys_are_invalid() {
        for raw in ["", "0x1234", "zz0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318"] {
            let error = LocalSigner::from_private_key(raw).unwrap_err();
            assert!(matches!(error, InboxError::InvalidKey { .. }), "{raw}");
        }

        let zero = format!("0x{}", "0".repeat(64));
        assert!(matches!(
            LocalSigner::from_private_key(&zero),
            Err(InboxError::InvalidKey { .. })
        ));
    }

    #[tokio::test]
    async fn signatures_are_recoverable_length() {
        let signer = LocalSigner::random().unwrap();
        let signature = signer.sign_message(b"hello").await.unwrap();
        assert_eq!(signature.len(), SIGNATURE_LEN);
    }

    #[test]
    fn endpoint_prefers_explicit_url_then_infura() {
        let mut config = ProviderConfig::default();
        assert_eq!(config.endpoint(), FALLBACK_RPC_URL);

        config.infura_key = Some("abc".to_string());
        assert_eq!(config.endpoint(), "https://mainnet.infura.io/v3/abc");

        config.rpc_url = Some("http://localhost:8545".to_string());
        assert_eq!(config.endpoint(), "http://localhost:8545");
    }

    #[test]
    fn resolver_rejects_unparseable_urls() {
        let config = ProviderConfig {
            rpc_url: Some("not a url".to_string()),
            ..ProviderConfig::default()
        };
        assert!(matches!(
            EnsNameResolver::new(&config),
            Err(InboxError::InvalidConfiguration { .. })
        ));
    }
}
