//! Vault-id allocation against the coordination service.
//!
//! Every vault needs a globally unique id tied to an unused derivation
//! index. Candidate ids are derived deterministically from the wallet's
//! account key (hash160 of the child key at each index), so a re-installed
//! wallet probes the same sequence, and the registry is asked index by index
//! until it reports one free. The probe loop is bounded; exhausting it is an
//! integrity failure, not something to retry silently.

use bitcoin::bip32::{ChildNumber, Xpub};
use bitcoin::hashes::{hash160, Hash};
use bitcoin::secp256k1::{Secp256k1, VerifyOnly};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AllocError {
    /// The registry reported a conflicting allocation (HTTP 409). Fatal.
    #[error("allocation conflict for vault id {0}")]
    Conflict(String),

    #[error("registry request failed: {0}")]
    Failed(String),

    #[error("registry response malformed: {0}")]
    InvalidResponse(String),

    #[error("no free vault id within {0} probed indices")]
    Exhausted(u32),

    #[error("key derivation failed: {0}")]
    Derivation(String),
}

/// Allocation capability consumed by the builder.
pub trait VaultIdAllocator {
    /// Returns `(vault_id, vault_path)`: the id and the first unused
    /// derivation index it belongs to.
    fn allocate(&self) -> Result<(String, u32), AllocError>;
}

/// Wire shape of the registry's probe response body.
#[derive(Debug, Deserialize)]
struct ProbeBody {
    exists: bool,
}

/// Transport behind the probe loop, so the decision logic tests without a
/// live service.
pub trait ProbeTransport {
    /// GET `url`, returning the HTTP status code and raw body.
    fn get(&self, url: &str) -> Result<(u16, String), AllocError>;
}

/// Blocking HTTP transport for real deployments.
pub struct HttpTransport {
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self, AllocError> {
        let client = reqwest::blocking::Client::builder()
            .build()
            .map_err(|e| AllocError::Failed(e.to_string()))?;
        Ok(Self { client })
    }
}

impl ProbeTransport for HttpTransport {
    fn get(&self, url: &str) -> Result<(u16, String), AllocError> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|e| AllocError::Failed(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .map_err(|e| AllocError::Failed(e.to_string()))?;
        Ok((status, body))
    }
}

/// Registry client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// URL template with `{vaultId}` and `{network}` placeholders.
    pub url_template: String,
    /// Network identifier substituted into the template.
    pub network_id: String,
    /// Upper bound on probed derivation indices.
    #[serde(default = "default_max_probes")]
    pub max_probes: u32,
}

fn default_max_probes() -> u32 {
    64
}

/// Probes the registry in derivation-index order.
pub struct VaultIdRegistry<T: ProbeTransport> {
    transport: T,
    config: RegistryConfig,
    account_key: Xpub,
    secp: Secp256k1<VerifyOnly>,
}

impl<T: ProbeTransport> VaultIdRegistry<T> {
    pub fn new(transport: T, config: RegistryConfig, account_key: Xpub) -> Self {
        Self {
            transport,
            config,
            account_key,
            secp: Secp256k1::verification_only(),
        }
    }

    /// Candidate id for one derivation index: hex hash160 of the child key.
    fn candidate_id(&self, index: u32) -> Result<String, AllocError> {
        let child = ChildNumber::from_normal_idx(index)
            .map_err(|e| AllocError::Derivation(e.to_string()))?;
        let derived = self
            .account_key
            .derive_pub(&self.secp, &[child])
            .map_err(|e| AllocError::Derivation(e.to_string()))?;
        Ok(hash160::Hash::hash(&derived.public_key.serialize()).to_string())
    }

    fn probe_url(&self, vault_id: &str) -> String {
        self.config
            .url_template
            .replace("{vaultId}", vault_id)
            .replace("{network}", &self.config.network_id)
    }
}

impl<T: ProbeTransport> VaultIdAllocator for VaultIdRegistry<T> {
    fn allocate(&self) -> Result<(String, u32), AllocError> {
        for index in 0..self.config.max_probes {
            let vault_id = self.candidate_id(index)?;
            let url = self.probe_url(&vault_id);
            let (status, body) = self.transport.get(&url)?;
            log::debug!("probed index {}: HTTP {}", index, status);

            match status {
                200 => {
                    let parsed: ProbeBody = serde_json::from_str(&body)
                        .map_err(|e| AllocError::InvalidResponse(e.to_string()))?;
                    if !parsed.exists {
                        return Err(AllocError::InvalidResponse(
                            "200 with exists=false".into(),
                        ));
                    }
                    // Taken, try the next index.
                }
                404 => {
                    let parsed: ProbeBody = serde_json::from_str(&body)
                        .map_err(|e| AllocError::InvalidResponse(e.to_string()))?;
                    if parsed.exists {
                        return Err(AllocError::InvalidResponse("404 with exists=true".into()));
                    }
                    return Ok((vault_id, index));
                }
                409 => return Err(AllocError::Conflict(vault_id)),
                other => {
                    return Err(AllocError::Failed(format!(
                        "unexpected HTTP {} probing {}",
                        other, url
                    )))
                }
            }
        }

        Err(AllocError::Exhausted(self.config.max_probes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::str::FromStr;

    fn test_xpub() -> Xpub {
        Xpub::from_str("xpub661MyMwAqRbcFtXgS5sYJABqqG9YLmC4Q1Rdap9gSE8NqtwybGhePY2gZ29ESFjqJoCu1Rupje8YtGqsefD265TMg7usUDFdp6W1EGMcet8").unwrap()
    }

    fn config() -> RegistryConfig {
        RegistryConfig {
            url_template: "https://registry.example/v1/vaults/{vaultId}?network={network}".into(),
            network_id: "signet".into(),
            max_probes: 4,
        }
    }

    /// Transport replaying a scripted response sequence, recording URLs.
    struct ScriptedTransport {
        responses: RefCell<Vec<(u16, String)>>,
        urls: RefCell<Vec<String>>,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<(u16, &str)>) -> Self {
            Self {
                responses: RefCell::new(
                    responses
                        .into_iter()
                        .rev()
                        .map(|(s, b)| (s, b.to_string()))
                        .collect(),
                ),
                urls: RefCell::new(Vec::new()),
            }
        }
    }

    impl ProbeTransport for ScriptedTransport {
        fn get(&self, url: &str) -> Result<(u16, String), AllocError> {
            self.urls.borrow_mut().push(url.to_string());
            self.responses
                .borrow_mut()
                .pop()
                .ok_or_else(|| AllocError::Failed("no scripted response left".into()))
        }
    }

    #[test]
    fn allocates_first_free_index() {
        let transport = ScriptedTransport::new(vec![
            (200, r#"{"exists":true}"#),
            (200, r#"{"exists":true}"#),
            (404, r#"{"exists":false}"#),
        ]);
        let registry = VaultIdRegistry::new(transport, config(), test_xpub());

        let (vault_id, vault_path) = registry.allocate().unwrap();
        assert_eq!(vault_path, 2);
        assert_eq!(vault_id.len(), 40); // hex hash160

        // Ids are deterministic per index.
        assert_eq!(vault_id, registry.candidate_id(2).unwrap());
    }

    #[test]
    fn substitutes_template_placeholders() {
        let transport = ScriptedTransport::new(vec![(404, r#"{"exists":false}"#)]);
        let registry = VaultIdRegistry::new(transport, config(), test_xpub());
        let (vault_id, _) = registry.allocate().unwrap();

        let urls = registry.transport.urls.borrow();
        assert_eq!(urls.len(), 1);
        assert!(urls[0].contains(&vault_id));
        assert!(urls[0].ends_with("network=signet"));
        assert!(!urls[0].contains("{vaultId}"));
    }

    #[test]
    fn conflict_is_fatal() {
        let transport = ScriptedTransport::new(vec![
            (200, r#"{"exists":true}"#),
            (409, ""),
        ]);
        let registry = VaultIdRegistry::new(transport, config(), test_xpub());
        assert!(matches!(registry.allocate(), Err(AllocError::Conflict(_))));
    }

    #[test]
    fn unexpected_status_fails() {
        let transport = ScriptedTransport::new(vec![(500, "boom")]);
        let registry = VaultIdRegistry::new(transport, config(), test_xpub());
        assert!(matches!(registry.allocate(), Err(AllocError::Failed(_))));
    }

    #[test]
    fn contradictory_body_is_invalid() {
        let transport = ScriptedTransport::new(vec![(404, r#"{"exists":true}"#)]);
        let registry = VaultIdRegistry::new(transport, config(), test_xpub());
        assert!(matches!(
            registry.allocate(),
            Err(AllocError::InvalidResponse(_))
        ));
    }

    #[test]
    fn bounded_probing_exhausts() {
        let transport = ScriptedTransport::new(vec![
            (200, r#"{"exists":true}"#),
            (200, r#"{"exists":true}"#),
            (200, r#"{"exists":true}"#),
            (200, r#"{"exists":true}"#),
        ]);
        let registry = VaultIdRegistry::new(transport, config(), test_xpub());
        assert!(matches!(registry.allocate(), Err(AllocError::Exhausted(4))));
    }

    #[test]
    fn registry_config_default_probes() {
        let parsed: RegistryConfig = serde_json::from_str(
            r#"{"url_template":"https://r/{vaultId}/{network}","network_id":"bitcoin"}"#,
        )
        .unwrap();
        assert_eq!(parsed.max_probes, 64);
    }
}
