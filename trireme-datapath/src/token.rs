use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwap;
use ed25519_dalek::{Signature, SigningKey, Verifier, VerifyingKey};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use crate::error::TokenError;
use crate::tag::TagStore;

type HmacSha256 = Hmac<Sha256>;

/// The TCP option area gives us at most 40 bytes total; minus the 4-byte
/// MSS option and our own 2-byte `[kind][len]` header, 34 bytes of actual
/// token payload fit alongside it.
pub const SYN_TOKEN_BUDGET: usize = 34;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningMode {
    Psk,
    PublicKey,
}

/// Key material for one direction of the relationship: a node signs with
/// its own secret and verifies peers with the corresponding public half.
/// PSK mode is symmetric: the same secret signs and verifies.
#[derive(Clone)]
pub enum Secrets {
    Psk(Vec<u8>),
    Ed25519 { signing_key: SigningKey, peer_verifying_key: VerifyingKey },
}

impl Secrets {
    pub fn mode(&self) -> SigningMode {
        match self {
            Secrets::Psk(_) => SigningMode::Psk,
            Secrets::Ed25519 { .. } => SigningMode::PublicKey,
        }
    }

    /// Encoded signature length for this mode: a 32-byte HMAC-SHA256 tag
    /// for `Psk`, a 64-byte Ed25519 signature for `PublicKey`.
    fn signature_len(&self) -> usize {
        match self.mode() {
            SigningMode::Psk => 32,
            SigningMode::PublicKey => 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claims {
    pub tags: TagStore,
    pub issued_at_unix_ms: u64,
    pub overflow: bool,
}

#[derive(Debug, Clone)]
pub struct Token {
    pub nonce: [u8; 16],
    pub claims: Claims,
    pub signature: Vec<u8>,
}

impl Token {
    fn signed_bytes(nonce: &[u8; 16], claims: &Claims) -> Vec<u8> {
        let claims_bytes = claims.tags.encode();
        let mut buf = Vec::with_capacity(16 + 8 + 1 + 2 + claims_bytes.len());
        buf.extend_from_slice(nonce);
        buf.extend_from_slice(&claims.issued_at_unix_ms.to_be_bytes());
        buf.push(claims.overflow as u8);
        buf.extend_from_slice(&(claims_bytes.len() as u16).to_be_bytes());
        buf.extend_from_slice(&claims_bytes);
        buf
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Self::signed_bytes(&self.nonce, &self.claims);
        out.extend_from_slice(&self.signature);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, TokenError> {
        if bytes.len() < 16 + 8 + 1 + 2 {
            return Err(TokenError::Malformed("token shorter than its fixed header".into()));
        }
        let nonce: [u8; 16] = bytes[0..16].try_into().unwrap();
        let issued_at_unix_ms = u64::from_be_bytes(bytes[16..24].try_into().unwrap());
        let overflow = bytes[24] != 0;
        let claims_len = u16::from_be_bytes(bytes[25..27].try_into().unwrap()) as usize;
        let claims_start = 27;
        let claims_end = claims_start + claims_len;
        if claims_end > bytes.len() {
            return Err(TokenError::Malformed("claims length runs past end of token".into()));
        }
        let tags = TagStore::decode(&bytes[claims_start..claims_end])?;
        let signature = bytes[claims_end..].to_vec();
        Ok(Token { nonce, claims: Claims { tags, issued_at_unix_ms, overflow }, signature })
    }
}

fn unix_millis(now: Instant, baseline_instant: Instant, baseline_unix_ms: u64) -> u64 {
    baseline_unix_ms + now.saturating_duration_since(baseline_instant).as_millis() as u64
}

/// Signs and verifies identity tokens. Key material is held behind
/// `ArcSwap` so `update_secrets` is lock-free for concurrent readers; the
/// token accessor itself is otherwise stateless per call.
pub struct TokenAccessor {
    secrets: ArcSwap<Secrets>,
    validity: Duration,
    baseline_instant: Instant,
    baseline_unix_ms: u64,
}

impl TokenAccessor {
    pub fn new(secrets: Secrets, validity: Duration) -> Self {
        let baseline_instant = Instant::now();
        let baseline_unix_ms = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0);
        TokenAccessor { secrets: ArcSwap::from_pointee(secrets), validity, baseline_instant, baseline_unix_ms }
    }

    pub fn update_secrets(&self, secrets: Secrets) {
        self.secrets.store(std::sync::Arc::new(secrets));
    }

    fn sign(&self, nonce: &[u8; 16], claims: &Claims) -> Vec<u8> {
        let message = Token::signed_bytes(nonce, claims);
        match self.secrets.load().as_ref() {
            Secrets::Psk(key) => {
                let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
                mac.update(&message);
                mac.finalize().into_bytes().to_vec()
            }
            Secrets::Ed25519 { signing_key, .. } => signing_key.sign(&message).to_bytes().to_vec(),
        }
    }

    fn verify_signature(&self, nonce: &[u8; 16], claims: &Claims, signature: &[u8]) -> Result<(), TokenError> {
        let message = Token::signed_bytes(nonce, claims);
        match self.secrets.load().as_ref() {
            Secrets::Psk(key) => {
                let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
                mac.update(&message);
                mac.verify_slice(signature).map_err(|_| TokenError::BadSignature)
            }
            Secrets::Ed25519 { peer_verifying_key, .. } => {
                let sig_bytes: [u8; 64] = signature.try_into().map_err(|_| TokenError::Malformed("signature is not 64 bytes".into()))?;
                let signature = Signature::from_bytes(&sig_bytes);
                peer_verifying_key.verify(&message, &signature).map_err(|_| TokenError::BadSignature)
            }
        }
    }

    /// Issues a token for `tags`, truncating to the longest affordable
    /// prefix (and setting `overflow`) if it doesn't fit in `budget` bytes:
    /// `SYN_TOKEN_BUDGET` for the handshake SYN/SYN-ACK, the deployment's
    /// `ackSize` for the final ACK. `budget` bounds the whole encoded
    /// token, so the signature this mode will append has to come out of
    /// the tags allowance up front.
    pub fn issue(&self, tags: &TagStore, now: Instant, budget: usize) -> Token {
        let sig_len = self.secrets.load().signature_len();
        let (kept, overflow) = tags.truncate_to_budget(budget.saturating_sub(16 + 8 + 1 + 2 + sig_len));
        let claims = Claims { tags: kept, issued_at_unix_ms: unix_millis(now, self.baseline_instant, self.baseline_unix_ms), overflow };
        let mut nonce = [0u8; 16];
        rand::rng().fill_bytes(&mut nonce);
        let signature = self.sign(&nonce, &claims);
        Token { nonce, claims, signature }
    }

    /// Verifies a decoded token against the current key material and the
    /// configured validity window, returning the claim tags on success.
    pub fn verify(&self, token: &Token, now: Instant) -> Result<TagStore, TokenError> {
        let issued_at_ms = token.claims.issued_at_unix_ms;
        let now_ms = unix_millis(now, self.baseline_instant, self.baseline_unix_ms);
        let age_ms = now_ms.saturating_sub(issued_at_ms);
        if age_ms > self.validity.as_millis() as u64 {
            return Err(TokenError::Expired);
        }
        self.verify_signature(&token.nonce, &token.claims, &token.signature)?;
        Ok(token.claims.tags.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    fn psk_accessor() -> TokenAccessor {
        TokenAccessor::new(Secrets::Psk(b"shared-secret-key".to_vec()), Duration::from_secs(20))
    }

    #[test]
    fn verify_sign_round_trips_for_psk() {
        let accessor = psk_accessor();
        let mut tags = TagStore::new();
        tags.push("app", "web");
        let now = Instant::now();
        let token = accessor.issue(&tags, now, 4096);
        let verified = accessor.verify(&token, now).unwrap();
        assert_eq!(verified, tags);
    }

    #[test]
    fn verify_sign_round_trips_for_ed25519() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        let accessor = TokenAccessor::new(Secrets::Ed25519 { signing_key, peer_verifying_key: verifying_key }, Duration::from_secs(20));
        let mut tags = TagStore::new();
        tags.push("app", "db");
        let now = Instant::now();
        let token = accessor.issue(&tags, now, 4096);
        let verified = accessor.verify(&token, now).unwrap();
        assert_eq!(verified, tags);
    }

    #[test]
    fn expired_token_fails_verification() {
        let accessor = psk_accessor();
        let tags = TagStore::new();
        let issued = Instant::now();
        let token = accessor.issue(&tags, issued, 4096);
        let later = issued + Duration::from_secs(21);
        assert_eq!(accessor.verify(&token, later), Err(TokenError::Expired));
    }

    #[test]
    fn tampered_signature_fails_verification() {
        let accessor = psk_accessor();
        let tags = TagStore::new();
        let now = Instant::now();
        let mut token = accessor.issue(&tags, now, 4096);
        token.signature[0] ^= 0xff;
        assert_eq!(accessor.verify(&token, now), Err(TokenError::BadSignature));
    }

    #[test]
    fn oversized_claims_are_truncated_with_overflow_flagged() {
        let accessor = psk_accessor();
        let mut tags = TagStore::new();
        for i in 0..20 {
            tags.push(format!("key{i}"), "a-fairly-long-tag-value");
        }
        let now = Instant::now();
        let token = accessor.issue(&tags, now, SYN_TOKEN_BUDGET);
        assert!(token.claims.overflow);
        assert!(token.claims.tags.len() < tags.len());
    }

    #[test]
    fn signature_length_is_reserved_out_of_the_tags_budget() {
        let mut tags = TagStore::new();
        for i in 0..5 {
            tags.push(format!("k{i}"), "value");
        }
        let now = Instant::now();
        // Exactly enough room for the fixed header, a PSK signature, and
        // every tag - nothing left over for a longer Ed25519 signature.
        let budget = 16 + 8 + 1 + 2 + 32 + tags.encode().len();

        let psk_token = psk_accessor().issue(&tags, now, budget);
        assert!(!psk_token.claims.overflow);
        assert_eq!(psk_token.claims.tags.len(), tags.len());

        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        let ed25519 = TokenAccessor::new(Secrets::Ed25519 { signing_key, peer_verifying_key: verifying_key }, Duration::from_secs(20));
        let ed_token = ed25519.issue(&tags, now, budget);
        assert!(ed_token.claims.overflow);
        assert!(ed_token.claims.tags.len() < tags.len());
    }

    #[test]
    fn encode_decode_round_trips() {
        let accessor = psk_accessor();
        let mut tags = TagStore::new();
        tags.push("a", "b");
        let now = Instant::now();
        let token = accessor.issue(&tags, now, 4096);
        let decoded = Token::decode(&token.encode()).unwrap();
        assert_eq!(decoded.claims.tags, tags);
        assert_eq!(decoded.signature, token.signature);
    }
}
