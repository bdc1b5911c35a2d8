//! Handshake Tokens
//!
//! Short-lived HMAC-SHA256 tokens that authorize a caller to open a stream
//! connection or use the HTTP fallback endpoint.
//!
//! # Format
//!
//! ```text
//! <issued_at_ms>.<hex(HMAC-SHA256(secret, issued_at_ms as decimal string))>
//! ```
//!
//! Tokens are stateless: verification needs only the process secret and
//! the token string.
//!
//! # Security Model
//!
//! - The secret is 256 random bits, generated once per process unless one is
//!   supplied through [`initialize_secret`]. Later initializations are no-ops.
//! - The secret lives in a private holder with no accessor and a redacted
//!   `Debug` impl. It is zeroized if the holder is ever dropped.
//! - Signatures are compared in constant time.
//! - Tokens older than the validity window, or dated further in the future
//!   than the clock-skew tolerance, are rejected.
//!
//! # Example
//!
//! ```
//! use tidewire_common::token::{TokenAuthenticator, TokenConfig};
//!
//! let auth = TokenAuthenticator::new(TokenConfig::default()).unwrap();
//! let token = auth.generate();
//! assert!(auth.verify(&token));
//! assert!(!auth.verify("123.deadbeef"));
//! ```

use std::fmt;
use std::sync::{Arc, OnceLock};

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::protocol::{Result, TidewireError};
use crate::time::{system_clock, SharedClock};

type HmacSha256 = Hmac<Sha256>;

/// Length of a generated secret in bytes.
pub const SECRET_LEN: usize = 32;

/// Default token lifetime (5 minutes).
pub const DEFAULT_TOKEN_VALIDITY_MS: u64 = 5 * 60 * 1000;

/// Default tolerance for tokens dated slightly in the future.
pub const DEFAULT_CLOCK_SKEW_TOLERANCE_MS: u64 = 1000;

static PROCESS_SECRET: OnceLock<Secret> = OnceLock::new();

/// Where the process secret comes from.
#[derive(Clone)]
pub enum SecretSource {
    /// 256 bits from the operating system's random source.
    Generate,
    /// A hex-encoded secret of at least 32 bytes, shared between processes
    /// that must accept each other's tokens.
    Hex(String),
}

impl fmt::Debug for SecretSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecretSource::Generate => f.write_str("Generate"),
            SecretSource::Hex(_) => f.write_str("Hex(<redacted>)"),
        }
    }
}

struct Secret(Zeroizing<Vec<u8>>);

impl Secret {
    fn generate() -> Result<Self> {
        let mut bytes = Zeroizing::new(vec![0u8; SECRET_LEN]);
        getrandom::fill(bytes.as_mut_slice())
            .map_err(|e| TidewireError::Config(format!("Failed to generate token secret: {e}")))?;
        Ok(Secret(bytes))
    }

    fn from_hex(encoded: &str) -> Result<Self> {
        let bytes = Zeroizing::new(
            hex::decode(encoded.trim())
                .map_err(|e| TidewireError::Config(format!("Invalid token secret: {e}")))?,
        );
        if bytes.len() < SECRET_LEN {
            return Err(TidewireError::Config(format!(
                "Token secret must be at least {SECRET_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Secret(bytes))
    }

    fn sign(&self, message: &[u8]) -> Vec<u8> {
        match HmacSha256::new_from_slice(&self.0) {
            Ok(mut mac) => {
                mac.update(message);
                mac.finalize().into_bytes().to_vec()
            }
            // HMAC accepts keys of any length, so an empty signature is
            // never produced for a real secret and never verifies.
            Err(_) => Vec::new(),
        }
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

/// Sets the process secret.
///
/// Returns `Ok(true)` if this call installed the secret and `Ok(false)` if a
/// secret was already in place, in which case nothing changes.
pub fn initialize_secret(source: SecretSource) -> Result<bool> {
    if PROCESS_SECRET.get().is_some() {
        return Ok(false);
    }
    let secret = match source {
        SecretSource::Generate => Secret::generate()?,
        SecretSource::Hex(encoded) => Secret::from_hex(&encoded)?,
    };
    let installed = PROCESS_SECRET.set(secret).is_ok();
    if installed {
        info!("Handshake token secret initialized");
    }
    Ok(installed)
}

fn process_secret() -> Result<&'static Secret> {
    if let Some(secret) = PROCESS_SECRET.get() {
        return Ok(secret);
    }
    initialize_secret(SecretSource::Generate)?;
    PROCESS_SECRET
        .get()
        .ok_or_else(|| TidewireError::Config("Token secret unavailable".into()))
}

/// Token lifetime settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenConfig {
    /// Maximum token age in milliseconds.
    pub validity_ms: u64,
    /// How far in the future a token's timestamp may be.
    pub clock_skew_tolerance_ms: u64,
}

impl TokenConfig {
    pub fn new(validity_ms: u64) -> Self {
        Self {
            validity_ms,
            ..Self::default()
        }
    }

    pub fn with_clock_skew_tolerance(mut self, tolerance_ms: u64) -> Self {
        self.clock_skew_tolerance_ms = tolerance_ms;
        self
    }
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            validity_ms: DEFAULT_TOKEN_VALIDITY_MS,
            clock_skew_tolerance_ms: DEFAULT_CLOCK_SKEW_TOLERANCE_MS,
        }
    }
}

/// Issues and verifies handshake tokens against the process secret.
///
/// Construct once at startup and share by `Arc`. Both operations only read
/// the immutable secret, so they are safe from any number of tasks.
#[derive(Clone)]
pub struct TokenAuthenticator {
    config: TokenConfig,
    secret: &'static Secret,
    clock: SharedClock,
}

impl TokenAuthenticator {
    /// Creates an authenticator, generating the process secret if no one has
    /// initialized it yet.
    pub fn new(config: TokenConfig) -> Result<Self> {
        Ok(Self {
            config,
            secret: process_secret()?,
            clock: system_clock(),
        })
    }

    /// Replaces the time source.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &TokenConfig {
        &self.config
    }

    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Issues a token stamped with the current time.
    pub fn generate(&self) -> String {
        self.generate_at(self.clock.now_ms())
    }

    /// Issues a token stamped with `issued_at_ms`.
    pub fn generate_at(&self, issued_at_ms: u64) -> String {
        let timestamp = issued_at_ms.to_string();
        let signature = self.secret.sign(timestamp.as_bytes());
        format!("{timestamp}.{}", hex::encode(signature))
    }

    /// Checks a token against the current time.
    pub fn verify(&self, token: &str) -> bool {
        self.verify_at(token, self.clock.now_ms())
    }

    /// Checks a token as of `now_ms`.
    pub fn verify_at(&self, token: &str, now_ms: u64) -> bool {
        let Some((timestamp, signature)) = token.split_once('.') else {
            debug!("Rejecting token without separator");
            return false;
        };
        if timestamp.is_empty() || signature.is_empty() {
            return false;
        }

        let Ok(issued_at) = timestamp.parse::<u64>() else {
            debug!("Rejecting token with non-numeric timestamp");
            return false;
        };

        if now_ms.saturating_sub(issued_at) > self.config.validity_ms {
            debug!("Rejecting expired token");
            return false;
        }
        if issued_at > now_ms.saturating_add(self.config.clock_skew_tolerance_ms) {
            debug!("Rejecting future-dated token");
            return false;
        }

        let Ok(provided) = hex::decode(signature) else {
            return false;
        };
        let expected = self.secret.sign(timestamp.as_bytes());
        if provided.len() != expected.len() {
            return false;
        }
        provided.ct_eq(&expected).into()
    }
}

impl fmt::Debug for TokenAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenAuthenticator")
            .field("config", &self.config)
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualClock;

    const T0: u64 = 1_700_000_000_000;

    fn authenticator(validity_ms: u64) -> (TokenAuthenticator, ManualClock) {
        let clock = ManualClock::new(T0);
        let auth = TokenAuthenticator::new(TokenConfig::new(validity_ms))
            .unwrap()
            .with_clock(Arc::new(clock.clone()));
        (auth, clock)
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let _ = initialize_secret(SecretSource::Generate).unwrap();
        assert!(!initialize_secret(SecretSource::Generate).unwrap());
        assert!(!initialize_secret(SecretSource::Hex("00".repeat(32))).unwrap());
    }

    #[test]
    fn test_secret_from_hex_validation() {
        assert!(Secret::from_hex("zz").is_err());
        assert!(Secret::from_hex(&"ab".repeat(16)).is_err());
        assert!(Secret::from_hex(&"ab".repeat(32)).is_ok());
    }

    #[test]
    fn test_token_format() {
        let (auth, _) = authenticator(10_000);
        let token = auth.generate();
        let (ts, sig) = token.split_once('.').unwrap();
        assert_eq!(ts, T0.to_string());
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_verify_within_validity() {
        let (auth, clock) = authenticator(10_000);
        let token = auth.generate();
        assert!(auth.verify(&token));

        clock.advance(9_999);
        assert!(auth.verify(&token));

        clock.advance(2);
        assert!(!auth.verify(&token));
    }

    #[test]
    fn test_verify_exact_boundary() {
        let (auth, _) = authenticator(10_000);
        let token = auth.generate_at(T0);
        assert!(auth.verify_at(&token, T0 + 10_000));
        assert!(!auth.verify_at(&token, T0 + 10_001));
    }

    #[test]
    fn test_future_dated_tokens() {
        let (auth, _) = authenticator(10_000);
        assert!(auth.verify_at(&auth.generate_at(T0 + 1_000), T0));
        assert!(!auth.verify_at(&auth.generate_at(T0 + 1_001), T0));

        let strict = auth.clone();
        let strict = TokenAuthenticator {
            config: strict.config.with_clock_skew_tolerance(0),
            ..strict
        };
        assert!(!strict.verify_at(&strict.generate_at(T0 + 1), T0));
    }

    #[test]
    fn test_any_flipped_bit_fails() {
        let (auth, _) = authenticator(10_000);
        let token = auth.generate();
        let (ts, sig) = token.split_once('.').unwrap();
        let sig_bytes = hex::decode(sig).unwrap();

        for byte in 0..sig_bytes.len() {
            for bit in 0..8 {
                let mut tampered = sig_bytes.clone();
                tampered[byte] ^= 1 << bit;
                let forged = format!("{ts}.{}", hex::encode(&tampered));
                assert!(!auth.verify(&forged), "byte {byte} bit {bit}");
            }
        }
    }

    #[test]
    fn test_malformed_tokens() {
        let (auth, _) = authenticator(10_000);
        let token = auth.generate();
        let (_, sig) = token.split_once('.').unwrap();

        assert!(!auth.verify(""));
        assert!(!auth.verify("no-separator"));
        assert!(!auth.verify(&format!(".{sig}")));
        assert!(!auth.verify(&format!("{T0}.")));
        assert!(!auth.verify(&format!("abc.{sig}")));
        assert!(!auth.verify(&format!("-5.{sig}")));
        assert!(!auth.verify(&format!("{T0}.{}", &sig[..62])));
        assert!(!auth.verify(&format!("{T0}.{}zz", &sig[..62])));
    }

    #[test]
    fn test_signature_bound_to_timestamp() {
        let (auth, _) = authenticator(10_000);
        let token = auth.generate_at(T0);
        let (_, sig) = token.split_once('.').unwrap();
        assert!(!auth.verify_at(&format!("{}.{sig}", T0 + 1), T0));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let (auth, _) = authenticator(10_000);
        let rendered = format!("{auth:?}");
        assert!(rendered.contains("<redacted>"));
        assert_eq!(
            format!("{:?}", SecretSource::Hex("abcd".into())),
            "Hex(<redacted>)"
        );
    }
}
