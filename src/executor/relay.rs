//! Private relay client
//!
//! Submits signed bundles via `eth_sendPrivateTransaction`. Replies are
//! parsed into a tx hash or a typed error: transport problems are
//! retryable, nonce complaints invalidate the local nonce view, anything
//! else is a terminal relay rejection.

use std::time::Duration;

use alloy_primitives::{Bytes, B256};
use base64::Engine;
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::debug;

use crate::config::RelayCfg;
use crate::error::{MipError, MipResult};

type HmacSha256 = Hmac<Sha256>;

pub struct RelayClient {
    pub name: String,
    url: String,
    http: reqwest::Client,
    auth: Option<String>,
    signing_secret: Option<Vec<u8>>,
}

impl RelayClient {
    pub fn from_config(cfg: &RelayCfg, timeout: Duration) -> MipResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MipError::Config(format!("relay {}: {e}", cfg.name)))?;

        let auth = match &cfg.auth_env {
            Some(var) => Some(std::env::var(var).map_err(|_| {
                MipError::Config(format!("relay {}: auth env {var} not set", cfg.name))
            })?),
            None => None,
        };
        let signing_secret = match &cfg.signing_secret_env {
            Some(var) => Some(
                std::env::var(var)
                    .map_err(|_| {
                        MipError::Config(format!("relay {}: secret env {var} not set", cfg.name))
                    })?
                    .into_bytes(),
            ),
            None => None,
        };

        Ok(Self {
            name: cfg.name.clone(),
            url: cfg.url.clone(),
            http,
            auth,
            signing_secret,
        })
    }

    /// Submit one signed transaction with a max target block. Returns the
    /// relay-acknowledged tx hash.
    pub async fn submit(&self, raw: &Bytes, max_block: u64) -> MipResult<B256> {
        let payload = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_sendPrivateTransaction",
            "params": [{
                "tx": format!("0x{}", hex::encode(raw)),
                "maxBlockNumber": format!("0x{max_block:x}"),
            }],
        });
        let body = serde_json::to_vec(&payload)
            .map_err(|e| MipError::InvariantViolation(format!("relay payload: {e}")))?;

        let mut req = self
            .http
            .post(&self.url)
            .header("content-type", "application/json");
        if let Some(auth) = &self.auth {
            req = req.header("authorization", format!("Bearer {auth}"));
        }
        if let Some(secret) = &self.signing_secret {
            req = req.header("x-body-signature", sign_body(secret, &body));
        }

        let resp = req
            .body(body)
            .send()
            .await
            .map_err(|e| MipError::EndpointUnreachable(format!("{}: {e}", self.name)))?;

        let value: Value = resp
            .json()
            .await
            .map_err(|e| MipError::RelayRejected(format!("{}: bad reply: {e}", self.name)))?;

        classify_reply(&self.name, &value)
    }
}

/// base64(HMAC-SHA256(secret, body)) for relays that want proof the body
/// came from the keyed operator.
fn sign_body(secret: &[u8], body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(body);
    base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}

fn classify_reply(relay: &str, value: &Value) -> MipResult<B256> {
    if let Some(err) = value.get("error") {
        let message = err
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown relay error");
        let lowered = message.to_lowercase();
        if lowered.contains("nonce") {
            return Err(MipError::NonceConflict(format!("{relay}: {message}")));
        }
        return Err(MipError::RelayRejected(format!("{relay}: {message}")));
    }

    let hash = value
        .get("result")
        .and_then(|r| {
            // Some relays answer with the bare hash, some wrap it.
            r.as_str()
                .map(str::to_string)
                .or_else(|| r.get("txHash").and_then(Value::as_str).map(str::to_string))
        })
        .ok_or_else(|| MipError::RelayRejected(format!("{relay}: reply without tx hash")))?;

    hash.parse::<B256>().map_err(|e| {
        debug!(relay, hash, "unparseable relay hash");
        MipError::RelayRejected(format!("{relay}: bad hash: {e}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_with_hash_parses() {
        let v = json!({"jsonrpc": "2.0", "id": 1,
            "result": "0x00000000000000000000000000000000000000000000000000000000000000aa"});
        let hash = classify_reply("test", &v).unwrap();
        assert_eq!(hash, B256::with_last_byte(0xaa));
    }

    #[test]
    fn wrapped_hash_parses_too() {
        let v = json!({"result": {"txHash":
            "0x00000000000000000000000000000000000000000000000000000000000000bb"}});
        assert!(classify_reply("test", &v).is_ok());
    }

    #[test]
    fn nonce_complaints_are_nonce_conflicts() {
        let v = json!({"error": {"code": -32000, "message": "nonce too low"}});
        let err = classify_reply("test", &v).unwrap_err();
        assert!(matches!(err, MipError::NonceConflict(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn other_errors_are_terminal_rejections() {
        let v = json!({"error": {"code": -32000, "message": "bundle reverted"}});
        let err = classify_reply("test", &v).unwrap_err();
        assert!(matches!(err, MipError::RelayRejected(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn body_signature_is_stable() {
        let a = sign_body(b"secret", b"payload");
        let b = sign_body(b"secret", b"payload");
        assert_eq!(a, b);
        assert_ne!(a, sign_body(b"other", b"payload"));
    }
}
