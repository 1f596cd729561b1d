//! Session recovery.
//!
//! A recovery token is a signed snapshot of a starling: its identity plus
//! whatever registered [`StateProvider`]s chose to save. Presenting the
//! token on a new connection rebinds the surviving starling, or rebuilds the
//! state on a fresh one when the original is gone.
//!
//! Tokens are compact HS256 JWTs: `base64url(header).base64url(claims).base64url(mac)`.

use crate::error::{HeliosError, Result};
use crate::locks::{read, write};
use crate::message::now_millis;
use crate::starling::Starling;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hmac::{Hmac, Mac};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::Sha256;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;

/// Signs and verifies opaque claim sets.
pub trait TokenSigner: Send + Sync {
    fn sign(&self, claims: &Value) -> Result<String>;

    /// Check the signature and return the claims.
    fn verify(&self, token: &str) -> Result<Value>;
}

/// HMAC-SHA256 signer.
pub struct HmacSigner {
    key: Vec<u8>,
}

impl HmacSigner {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }

    /// Signer with a random 256-bit key, valid for this process only.
    pub fn random() -> Self {
        let mut key = [0u8; 32];
        rand::rng().fill(&mut key);
        Self::new(key.to_vec())
    }

    /// Signer from a hex-encoded key.
    pub fn from_hex(secret: &str) -> Result<Self> {
        let key = hex::decode(secret.trim()).map_err(|e| HeliosError::Config {
            message: format!("secret is not valid hex: {}", e),
        })?;
        if key.len() < 16 {
            return Err(HeliosError::Config {
                message: "secret must be at least 16 bytes".into(),
            });
        }
        Ok(Self::new(key))
    }

    fn mac(&self) -> Result<HmacSha256> {
        HmacSha256::new_from_slice(&self.key).map_err(|e| HeliosError::Config {
            message: e.to_string(),
        })
    }
}

impl std::fmt::Debug for HmacSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacSigner").finish_non_exhaustive()
    }
}

fn invalid(reason: impl Into<String>) -> HeliosError {
    HeliosError::InvalidToken {
        reason: reason.into(),
    }
}

impl TokenSigner for HmacSigner {
    fn sign(&self, claims: &Value) -> Result<String> {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let body = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);
        let signing_input = format!("{}.{}", header, body);

        let mut mac = self.mac()?;
        mac.update(signing_input.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

        Ok(format!("{}.{}", signing_input, signature))
    }

    fn verify(&self, token: &str) -> Result<Value> {
        let mut parts = token.split('.');
        let (Some(header_part), Some(body_part), Some(signature), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid("malformed token"));
        };

        let header: Value = URL_SAFE_NO_PAD
            .decode(header_part)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .ok_or_else(|| invalid("malformed header"))?;
        if header["alg"] != "HS256" {
            return Err(invalid("unsupported algorithm"));
        }

        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| invalid("malformed signature"))?;
        let mut mac = self.mac()?;
        mac.update(format!("{}.{}", header_part, body_part).as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| invalid("signature mismatch"))?;

        let body = URL_SAFE_NO_PAD
            .decode(body_part)
            .map_err(|_| invalid("malformed claims"))?;
        serde_json::from_slice(&body).map_err(|_| invalid("malformed claims"))
    }
}

/// Claims carried by a recovery token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryClaims {
    /// Identity of the starling that issued the token.
    pub identity: String,
    /// Saved state per provider namespace.
    #[serde(default)]
    pub state: Map<String, Value>,
    /// Milliseconds since the Unix epoch.
    pub issued_at: u64,
    /// Validity in seconds.
    pub expires_in: u64,
}

impl RecoveryClaims {
    pub fn is_expired(&self) -> bool {
        let expires_at = self
            .issued_at
            .saturating_add(self.expires_in.saturating_mul(1000));
        now_millis() >= expires_at
    }
}

/// Saves and restores one namespace of starling state across reconnects.
pub trait StateProvider: Send + Sync {
    fn save(&self, starling: &Starling) -> Result<Value>;

    /// Reject saved data before it reaches `restore`.
    fn validate(&self, _data: &Value) -> bool {
        true
    }

    fn restore(&self, starling: &Starling, data: Value) -> Result<()>;
}

/// Server-wide providers, in registration order.
#[derive(Default)]
pub struct StateProviders {
    providers: RwLock<Vec<(String, Arc<dyn StateProvider>)>>,
}

impl StateProviders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, namespace: &str, provider: Arc<dyn StateProvider>) -> Result<()> {
        let mut providers = write(&self.providers);
        if providers.iter().any(|(ns, _)| ns == namespace) {
            return Err(HeliosError::DuplicateNamespace {
                namespace: namespace.to_string(),
            });
        }
        providers.push((namespace.to_string(), provider));
        Ok(())
    }

    pub fn namespaces(&self) -> Vec<String> {
        read(&self.providers)
            .iter()
            .map(|(ns, _)| ns.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        read(&self.providers).len()
    }

    pub fn is_empty(&self) -> bool {
        read(&self.providers).is_empty()
    }

    fn snapshot(&self) -> Vec<(String, Arc<dyn StateProvider>)> {
        read(&self.providers).clone()
    }

    /// Snapshot the starling into a signed token.
    ///
    /// A provider that fails to save is skipped; the token still carries
    /// everything else.
    pub fn generate_token(
        &self,
        starling: &Starling,
        signer: &dyn TokenSigner,
        ttl: Duration,
    ) -> Result<String> {
        let mut state = Map::new();
        for (namespace, provider) in self.snapshot() {
            match provider.save(starling) {
                Ok(data) => {
                    state.insert(namespace, data);
                }
                Err(e) => warn!(
                    "Failed to save state namespace {} for {}: {}",
                    namespace,
                    starling.id(),
                    e
                ),
            }
        }

        let claims = RecoveryClaims {
            identity: starling.id().to_string(),
            state,
            issued_at: now_millis(),
            expires_in: ttl.as_secs(),
        };
        signer.sign(&serde_json::to_value(&claims)?)
    }

    /// Restore saved state namespace by namespace.
    ///
    /// Unknown namespaces are ignored; failures are isolated per namespace.
    pub fn apply_state(&self, starling: &Starling, state: &Map<String, Value>) -> RestoreReport {
        let mut report = RestoreReport::default();
        for (namespace, provider) in self.snapshot() {
            let Some(data) = state.get(&namespace) else {
                continue;
            };
            if !provider.validate(data) {
                report.failed.push(HeliosError::NamespaceRestore {
                    namespace,
                    message: "saved state failed validation".into(),
                });
                continue;
            }
            match provider.restore(starling, data.clone()) {
                Ok(()) => {
                    debug!("Restored namespace {} for {}", namespace, starling.id());
                    report.restored.push(namespace);
                }
                Err(e) => report.failed.push(HeliosError::NamespaceRestore {
                    namespace,
                    message: e.to_string(),
                }),
            }
        }
        for failure in &report.failed {
            warn!("{}", failure);
        }
        report
    }
}

/// Which namespaces came back.
#[derive(Debug, Default)]
pub struct RestoreReport {
    pub restored: Vec<String>,
    pub failed: Vec<HeliosError>,
}

/// Verify a token and return its claims if still valid.
pub fn restore_from_token(token: &str, signer: &dyn TokenSigner) -> Result<RecoveryClaims> {
    let claims: RecoveryClaims =
        serde_json::from_value(signer.verify(token)?).map_err(|_| invalid("malformed claims"))?;
    if claims.is_expired() {
        return Err(invalid("token expired"));
    }
    Ok(claims)
}

/// Payload of the `starling:token` notification.
pub fn token_notification(token: &str, ttl: Duration) -> Value {
    json!({
        "type": "starling:token",
        "token": token,
        "expiresIn": ttl.as_secs(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims(issued_at: u64, expires_in: u64) -> Value {
        serde_json::to_value(RecoveryClaims {
            identity: "abc".into(),
            state: Map::new(),
            issued_at,
            expires_in,
        })
        .unwrap()
    }

    #[test]
    fn test_sign_and_verify() {
        let signer = HmacSigner::random();
        let token = signer.sign(&claims(now_millis(), 60)).unwrap();
        assert_eq!(token.split('.').count(), 3);

        let restored = restore_from_token(&token, &signer).unwrap();
        assert_eq!(restored.identity, "abc");
    }

    #[test]
    fn test_tampered_token_rejected() {
        let signer = HmacSigner::random();
        let token = signer.sign(&claims(now_millis(), 60)).unwrap();

        let forged_claims = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&json!({
                "identity": "someone-else", "state": {}, "issuedAt": now_millis(), "expiresIn": 60
            }))
            .unwrap(),
        );
        let parts: Vec<&str> = token.split('.').collect();
        let forged = format!("{}.{}.{}", parts[0], forged_claims, parts[2]);

        assert!(matches!(
            restore_from_token(&forged, &signer),
            Err(HeliosError::InvalidToken { .. })
        ));
    }

    #[test]
    fn test_other_key_rejected() {
        let token = HmacSigner::random()
            .sign(&claims(now_millis(), 60))
            .unwrap();
        assert!(restore_from_token(&token, &HmacSigner::random()).is_err());
    }

    #[test]
    fn test_expired_token_rejected() {
        let signer = HmacSigner::random();
        let token = signer.sign(&claims(now_millis() - 120_000, 60)).unwrap();
        match restore_from_token(&token, &signer) {
            Err(HeliosError::InvalidToken { reason }) => assert_eq!(reason, "token expired"),
            other => panic!("Expected expiry, got {:?}", other),
        }
    }

    #[test]
    fn test_garbage_rejected() {
        let signer = HmacSigner::random();
        for token in ["", "a.b", "a.b.c.d", "!!.??.##"] {
            assert!(signer.verify(token).is_err(), "accepted {:?}", token);
        }
    }

    #[test]
    fn test_hex_secret() {
        let signer = HmacSigner::from_hex("00112233445566778899aabbccddeeff").unwrap();
        let again = HmacSigner::from_hex("00112233445566778899aabbccddeeff").unwrap();
        let token = signer.sign(&claims(now_millis(), 60)).unwrap();
        assert!(again.verify(&token).is_ok());

        assert!(HmacSigner::from_hex("not hex").is_err());
        assert!(HmacSigner::from_hex("0011").is_err());
    }

    struct Noop;

    impl StateProvider for Noop {
        fn save(&self, _starling: &Starling) -> Result<Value> {
            Ok(Value::Null)
        }

        fn restore(&self, _starling: &Starling, _data: Value) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_duplicate_namespace_rejected() {
        let providers = StateProviders::new();
        providers.register("session", Arc::new(Noop)).unwrap();
        assert!(matches!(
            providers.register("session", Arc::new(Noop)),
            Err(HeliosError::DuplicateNamespace { .. })
        ));
        assert_eq!(providers.namespaces(), vec!["session"]);
    }
}
