// Anti-CSRF state tokens for the Slack OAuth flow.
//
// A token is `base64(payload "." hex(hmac_sha256(secret, payload)))` where
// the payload is a JSON object `{timestamp, nonce}`. Nothing is stored
// server-side: the signature makes the token self-verifying, and the
// timestamp bounds its lifetime.

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

/// Fixed validity window for a state token.
pub const STATE_EXPIRY_SECONDS: i64 = 600;

const NONCE_BYTES: usize = 16;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Serialize, Deserialize)]
struct StatePayload {
    timestamp: i64,
    nonce: String,
}

/// Issues and verifies signed, time-boxed OAuth `state` parameters.
///
/// `validate` is the only authoritative check. Malformed tokens, bad
/// signatures and expired timestamps are indistinguishable to callers so
/// the failure mode leaks nothing about which check tripped.
#[derive(Clone)]
pub struct StateTokenService {
    mac: HmacSha256,
}

impl StateTokenService {
    pub fn new(secret: &str) -> Result<Self> {
        if secret.trim().is_empty() {
            bail!("state token secret must not be empty");
        }
        let mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|_| anyhow::anyhow!("state token secret rejected by hmac"))?;
        Ok(Self { mac })
    }

    /// Produce a fresh state token valid for [`STATE_EXPIRY_SECONDS`].
    pub fn generate(&self) -> String {
        self.generate_at(now_unix())
    }

    fn generate_at(&self, timestamp: i64) -> String {
        let mut nonce = [0u8; NONCE_BYTES];
        rand::thread_rng().fill_bytes(&mut nonce);

        let payload = StatePayload { timestamp, nonce: hex::encode(nonce) };
        // Struct field order keeps the serialization stable between
        // generation and verification.
        let payload_json = serde_json::to_string(&payload)
            .unwrap_or_else(|_| String::from("{}"));

        let mut mac = self.mac.clone();
        mac.update(payload_json.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        STANDARD.encode(format!("{payload_json}.{signature}"))
    }

    /// Verify signature and expiry. Never panics; every decode or parse
    /// failure yields `false`.
    pub fn validate(&self, token: &str) -> bool {
        self.validate_at(token, now_unix())
    }

    fn validate_at(&self, token: &str, now: i64) -> bool {
        let Some((payload_json, signature)) = decode_segments(token) else {
            return false;
        };

        let Ok(signature_bytes) = hex::decode(&signature) else {
            return false;
        };

        let mut mac = self.mac.clone();
        mac.update(payload_json.as_bytes());
        if mac.verify_slice(&signature_bytes).is_err() {
            return false;
        }

        let Ok(payload) = serde_json::from_str::<StatePayload>(&payload_json) else {
            return false;
        };

        now - payload.timestamp <= STATE_EXPIRY_SECONDS
    }

    /// Diagnostic only: whether the embedded timestamp has aged out.
    /// Does not check the signature and must not gate authorization.
    pub fn is_expired(&self, token: &str) -> bool {
        match self.issued_at(token) {
            Some(timestamp) => now_unix() - timestamp > STATE_EXPIRY_SECONDS,
            None => true,
        }
    }

    /// Diagnostic only: the embedded issuance timestamp, unverified.
    pub fn issued_at(&self, token: &str) -> Option<i64> {
        let (payload_json, _) = decode_segments(token)?;
        serde_json::from_str::<StatePayload>(&payload_json)
            .ok()
            .map(|payload| payload.timestamp)
    }
}

fn decode_segments(token: &str) -> Option<(String, String)> {
    let decoded = STANDARD.decode(token).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (payload, signature) = decoded.split_once('.')?;
    if payload.is_empty() || signature.is_empty() {
        return None;
    }
    Some((payload.to_owned(), signature.to_owned()))
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or(0)
}
