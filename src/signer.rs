//! GitHub App identity assertions (signed JWTs).
//!
//! The App authenticates to GitHub with a short-lived RS256 JWT signed by
//! its private key. The key is read once at startup and never leaves this
//! module; it does not appear in logs, debug output, or error messages.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{Error, Result};

/// GitHub caps App JWT lifetime at 10 minutes; stay just under it.
fn max_ttl() -> Duration {
    Duration::minutes(9)
}

/// Allowance for clock drift between us and GitHub, applied to `iat`.
fn clock_drift() -> Duration {
    Duration::seconds(60)
}

/// JWT claims for GitHub App authentication
#[derive(Debug, Serialize)]
struct AppJwtClaims {
    /// Issued at time (backdated by the drift allowance)
    iat: i64,
    /// Expiration time
    exp: i64,
    /// GitHub App ID (issuer)
    iss: String,
    /// Random nonce, so no two assertions are ever identical
    jti: String,
}

/// A freshly signed App identity assertion.
///
/// Consumed exactly once by the token exchange; never reused across runs.
#[derive(Clone)]
pub struct SignedAssertion {
    jwt: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub jti: String,
}

impl SignedAssertion {
    /// Assemble an assertion from parts. Stub signers (dry-run, tests)
    /// use this; real assertions come out of [`RsaSigner::sign`].
    pub fn new(
        jwt: String,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
        jti: String,
    ) -> Self {
        Self {
            jwt,
            issued_at,
            expires_at,
            jti,
        }
    }

    /// The encoded JWT, for the Authorization header.
    pub fn jwt(&self) -> &str {
        &self.jwt
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

// Manual Debug: the JWT is a credential, keep it out of logs.
impl std::fmt::Debug for SignedAssertion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignedAssertion")
            .field("jwt", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .field("jti", &self.jti)
            .finish()
    }
}

/// Signs App identity assertions. Implemented by the real RSA signer and by
/// in-memory stubs in tests.
pub trait AssertionSigner: Send + Sync {
    /// Produce a fresh assertion valid for `ttl` (clamped to the platform
    /// maximum). Embedded expiry is exactly `issued_at + ttl`.
    fn sign(&self, ttl: Duration) -> Result<SignedAssertion>;
}

/// RS256 signer backed by the GitHub App's private key.
pub struct RsaSigner {
    app_id: u64,
    key: EncodingKey,
}

impl std::fmt::Debug for RsaSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RsaSigner")
            .field("app_id", &self.app_id)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl RsaSigner {
    /// Read and parse the App private key from a PEM file.
    pub fn from_pem_file(app_id: u64, path: &std::path::Path) -> Result<Self> {
        let pem = std::fs::read(path).map_err(|e| {
            Error::KeyUnavailable(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_pem(app_id, &pem)
    }

    /// Parse the App private key from PEM bytes.
    pub fn from_pem(app_id: u64, pem: &[u8]) -> Result<Self> {
        let key = EncodingKey::from_rsa_pem(pem)
            .map_err(|e| Error::KeyUnavailable(format!("not a valid RSA private key: {e}")))?;
        Ok(Self { app_id, key })
    }
}

impl AssertionSigner for RsaSigner {
    fn sign(&self, ttl: Duration) -> Result<SignedAssertion> {
        let ttl = ttl.min(max_ttl());
        let issued_at = Utc::now();
        let expires_at = issued_at + ttl;
        let jti = Uuid::new_v4().to_string();

        let claims = AppJwtClaims {
            iat: (issued_at - clock_drift()).timestamp(),
            exp: expires_at.timestamp(),
            iss: self.app_id.to_string(),
            jti: jti.clone(),
        };

        let header = Header::new(Algorithm::RS256);
        let jwt = encode(&header, &claims, &self.key)
            .map_err(|e| Error::SigningFailure(e.to_string()))?;

        Ok(SignedAssertion {
            jwt,
            issued_at,
            expires_at,
            jti,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{decode, DecodingKey, Validation};
    use serde::Deserialize;

    const TEST_KEY: &[u8] = include_bytes!("../tests/data/test_key.pem");
    const TEST_PUB_KEY: &[u8] = include_bytes!("../tests/data/test_key.pub.pem");

    #[derive(Debug, Deserialize)]
    struct DecodedClaims {
        iat: i64,
        exp: i64,
        iss: String,
        jti: String,
    }

    fn decode_claims(jwt: &str) -> DecodedClaims {
        let key = DecodingKey::from_rsa_pem(TEST_PUB_KEY).unwrap();
        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_exp = false;
        validation.required_spec_claims.clear();
        decode::<DecodedClaims>(jwt, &key, &validation)
            .expect("assertion should verify against the public key")
            .claims
    }

    #[test]
    fn test_expiry_is_issued_at_plus_ttl() {
        let signer = RsaSigner::from_pem(123, TEST_KEY).unwrap();
        let ttl = Duration::minutes(5);
        let assertion = signer.sign(ttl).unwrap();
        assert_eq!(assertion.expires_at - assertion.issued_at, ttl);

        let claims = decode_claims(assertion.jwt());
        assert_eq!(claims.iss, "123");
        assert_eq!(claims.exp, assertion.expires_at.timestamp());
        // iat is backdated by the drift allowance
        assert_eq!(
            claims.iat,
            (assertion.issued_at - clock_drift()).timestamp()
        );
    }

    #[test]
    fn test_ttl_clamped_to_platform_max() {
        let signer = RsaSigner::from_pem(123, TEST_KEY).unwrap();
        let assertion = signer.sign(Duration::hours(2)).unwrap();
        assert_eq!(assertion.expires_at - assertion.issued_at, max_ttl());
    }

    #[test]
    fn test_resigning_yields_fresh_nonce() {
        let signer = RsaSigner::from_pem(456, TEST_KEY).unwrap();
        let a = signer.sign(Duration::minutes(5)).unwrap();
        let b = signer.sign(Duration::minutes(5)).unwrap();
        assert_ne!(a.jti, b.jti);
        assert_ne!(a.jwt(), b.jwt());
        assert_eq!(decode_claims(a.jwt()).jti, a.jti);
    }

    #[test]
    fn test_invalid_key_is_key_unavailable() {
        let err = RsaSigner::from_pem(1, b"not a pem").unwrap_err();
        assert!(matches!(err, Error::KeyUnavailable(_)));

        let err =
            RsaSigner::from_pem_file(1, std::path::Path::new("/nonexistent/key.pem")).unwrap_err();
        assert!(matches!(err, Error::KeyUnavailable(_)));
    }

    #[test]
    fn test_debug_redacts_jwt() {
        let signer = RsaSigner::from_pem(1, TEST_KEY).unwrap();
        let assertion = signer.sign(Duration::minutes(1)).unwrap();
        let debug = format!("{assertion:?}");
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains(assertion.jwt()));
    }
}
