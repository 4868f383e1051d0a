//! Stateless HMAC-SHA256 bearer tokens asserting an agent SID (§4.2, §6).
//!
//! A token is `fwd_<payload>_<signature>` where `payload` is
//! `hex(sid_len:sid:issued_at:expiry)` and `signature` is the hex-encoded
//! HMAC-SHA256 over the payload bytes. `Verify` recomputes the tag and
//! compares it with `hmac::Mac::verify_slice`, which runs in constant time,
//! then checks the decoded expiry before accepting the SID.
//!
//! No pack example wires up hop-to-hop auth tokens, so this is grounded in
//! the RustCrypto `hmac`/`sha2` crates as the ecosystem-standard way to
//! build exactly this kind of short-lived signed bearer (noted in
//! DESIGN.md rather than attributed to a specific example file).

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{CoreError, CoreResult};

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct TokenService {
    secret: Vec<u8>,
    ttl: Duration,
}

fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs() as i64
}

impl TokenService {
    pub fn new(secret: Vec<u8>, ttl: Duration) -> Self {
        Self { secret, ttl }
    }

    fn payload_for(&self, sid: &str, issued_at: i64, expiry: i64) -> String {
        format!("{}:{issued_at}:{expiry}", sid)
    }

    fn sign(&self, payload: &str) -> CoreResult<String> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| CoreError::Internal(format!("bad hmac key: {e}")))?;
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Generates a fresh token asserting `sid`, valid for this service's
    /// configured TTL.
    pub fn generate(&self, sid: &str) -> CoreResult<String> {
        let issued_at = now_epoch();
        let expiry = issued_at + self.ttl.as_secs() as i64;
        let payload = self.payload_for(sid, issued_at, expiry);
        let payload_hex = hex::encode(payload.as_bytes());
        let signature = self.sign(&payload)?;
        Ok(format!("fwd_{payload_hex}_{signature}"))
    }

    /// Verifies a token's signature and expiry, returning the asserted SID.
    pub fn verify(&self, token: &str) -> CoreResult<String> {
        let body = token
            .strip_prefix("fwd_")
            .ok_or_else(|| CoreError::Unauthorized)?;
        let (payload_hex, signature) = body.split_once('_').ok_or(CoreError::Unauthorized)?;

        let payload_bytes = hex::decode(payload_hex).map_err(|_| CoreError::Unauthorized)?;
        let payload = String::from_utf8(payload_bytes).map_err(|_| CoreError::Unauthorized)?;

        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| CoreError::Internal(format!("bad hmac key: {e}")))?;
        mac.update(payload.as_bytes());
        let expected_sig = hex::decode(signature).map_err(|_| CoreError::Unauthorized)?;
        mac.verify_slice(&expected_sig)
            .map_err(|_| CoreError::Unauthorized)?;

        let mut parts = payload.rsplitn(3, ':');
        let expiry: i64 = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or(CoreError::Unauthorized)?;
        let _issued_at: i64 = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or(CoreError::Unauthorized)?;
        let sid = parts.next().ok_or(CoreError::Unauthorized)?.to_string();

        if now_epoch() > expiry {
            return Err(CoreError::Unauthorized);
        }
        Ok(sid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> TokenService {
        TokenService::new(b"test-secret".to_vec(), Duration::from_secs(30))
    }

    #[test]
    fn round_trips_a_valid_token() {
        let svc = service();
        let token = svc.generate("fa_abc123").unwrap();
        assert_eq!(svc.verify(&token).unwrap(), "fa_abc123");
    }

    #[test]
    fn rejects_a_tampered_signature() {
        let svc = service();
        let mut token = svc.generate("fa_abc123").unwrap();
        token.push('0');
        assert!(svc.verify(&token).is_err());
    }

    #[test]
    fn rejects_an_expired_token() {
        let svc = TokenService::new(b"test-secret".to_vec(), Duration::from_secs(0));
        let token = svc.generate("fa_abc123").unwrap();
        std::thread::sleep(Duration::from_millis(1100));
        assert!(svc.verify(&token).is_err());
    }
}
