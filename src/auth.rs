//! Local verification of registry-issued identity tokens.
//!
//! Tokens are compact JWTs signed with Ed25519 (`alg: EdDSA`). The registry's public key is
//! distributed through configuration, so no request ever calls back to the registry.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use ring::signature::{UnparsedPublicKey, ED25519};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::mode::Operation;

const ED25519_KEY_LEN: usize = 32;
/// DER prefix of an Ed25519 SubjectPublicKeyInfo, followed by the raw 32-byte key.
const ED25519_SPKI_PREFIX: [u8; 12] = [
    0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x03, 0x21, 0x00,
];

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing bearer token")]
    MissingToken,
    #[error("Malformed token: {0}")]
    Malformed(String),
    #[error("Unsupported token algorithm '{0}'")]
    UnsupportedAlgorithm(String),
    #[error("Invalid token signature")]
    BadSignature,
    #[error("Token expired")]
    Expired,
    #[error("Role '{role}' may not {operation}")]
    Forbidden { role: Role, operation: Operation },
    #[error("Invalid public key: {0}")]
    InvalidKey(String),
}

impl AuthError {
    /// Authenticated but not allowed, as opposed to not authenticated.
    pub fn is_forbidden(&self) -> bool {
        matches!(self, AuthError::Forbidden { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Writer,
    /// Any role this node does not recognise is treated as read-only
    #[serde(other)]
    Reader,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Role::Admin => "admin",
            Role::Writer => "writer",
            Role::Reader => "reader",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub role: Role,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
}

#[derive(Deserialize)]
struct TokenHeader {
    alg: String,
}

/// The caller behind a request.
#[derive(Debug, Clone)]
pub struct Identity {
    pub subject: String,
    pub role: Role,
    /// Raw bearer token, forwarded when this node calls a peer on the caller's behalf
    pub token: Option<String>,
}

impl Identity {
    /// Caller on a node that does not require tokens.
    pub fn anonymous() -> Self {
        Self {
            subject: "anonymous".to_string(),
            role: Role::Admin,
            token: None,
        }
    }

    pub fn authorize(&self, operation: Operation) -> Result<(), AuthError> {
        match (self.role, operation) {
            (Role::Reader, Operation::Read) => Ok(()),
            (Role::Reader, operation) => Err(AuthError::Forbidden {
                role: self.role,
                operation,
            }),
            _ => Ok(()),
        }
    }
}

pub struct TokenVerifier {
    key: Option<UnparsedPublicKey<Vec<u8>>>,
    required: bool,
    leeway_secs: i64,
}

impl TokenVerifier {
    /// `public_key` is the raw 32-byte Ed25519 key. Without a key, tokens cannot be
    /// verified and `required` must be false.
    pub fn new(public_key: Option<Vec<u8>>, required: bool, leeway_secs: i64) -> Self {
        Self {
            key: public_key.map(|key| UnparsedPublicKey::new(&ED25519, key)),
            required,
            leeway_secs,
        }
    }

    /// Accept everything; for nodes running without an identity authority.
    pub fn disabled() -> Self {
        Self::new(None, false, 0)
    }

    /// Load a public key from a PEM (`BEGIN PUBLIC KEY`) or raw 32-byte file.
    pub fn load_public_key(path: &str) -> Result<Vec<u8>, AuthError> {
        let data = std::fs::read(path)
            .map_err(|e| AuthError::InvalidKey(format!("failed to read {path}: {e}")))?;
        parse_public_key(&data)
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    /// Resolve the caller from an `Authorization` header value.
    pub fn authenticate(&self, authorization: Option<&str>, now: i64) -> Result<Identity, AuthError> {
        let token = authorization
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty());

        match (token, &self.key) {
            (Some(token), Some(_)) => {
                let claims = self.verify(token, now)?;
                Ok(Identity {
                    subject: claims.sub,
                    role: claims.role,
                    token: Some(token.to_string()),
                })
            }
            (None, _) if self.required => Err(AuthError::MissingToken),
            (Some(_), None) if self.required => {
                Err(AuthError::InvalidKey("no public key configured".into()))
            }
            (token, _) => Ok(Identity {
                token: token.map(str::to_string),
                ..Identity::anonymous()
            }),
        }
    }

    /// Check signature and lifetime, returning the claims.
    pub fn verify(&self, token: &str, now: i64) -> Result<Claims, AuthError> {
        let key = self
            .key
            .as_ref()
            .ok_or_else(|| AuthError::InvalidKey("no public key configured".into()))?;

        let mut segments = token.split('.');
        let (Some(header), Some(payload), Some(signature), None) = (
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
        ) else {
            return Err(AuthError::Malformed("expected three segments".into()));
        };

        let header: TokenHeader = serde_json::from_slice(&decode_segment(header)?)
            .map_err(|e| AuthError::Malformed(format!("header: {e}")))?;
        if header.alg != "EdDSA" {
            return Err(AuthError::UnsupportedAlgorithm(header.alg));
        }

        let signed_len = token.len() - signature.len() - 1;
        key.verify(token[..signed_len].as_bytes(), &decode_segment(signature)?)
            .map_err(|_| AuthError::BadSignature)?;

        let claims: Claims = serde_json::from_slice(&decode_segment(payload)?)
            .map_err(|e| AuthError::Malformed(format!("claims: {e}")))?;

        if now > claims.exp + self.leeway_secs {
            return Err(AuthError::Expired);
        }
        if claims.iat.is_some_and(|iat| iat > now + self.leeway_secs) {
            return Err(AuthError::Malformed("issued in the future".into()));
        }
        Ok(claims)
    }
}

fn decode_segment(segment: &str) -> Result<Vec<u8>, AuthError> {
    URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| AuthError::Malformed(format!("invalid base64url: {e}")))
}

fn parse_public_key(data: &[u8]) -> Result<Vec<u8>, AuthError> {
    let der = match std::str::from_utf8(data) {
        Ok(text) if text.trim_start().starts_with("-----BEGIN") => {
            let body: String = text
                .lines()
                .filter(|line| !line.starts_with("-----"))
                .map(str::trim)
                .collect();
            STANDARD
                .decode(body)
                .map_err(|e| AuthError::InvalidKey(format!("invalid PEM body: {e}")))?
        }
        _ => data.to_vec(),
    };

    match der.len() {
        ED25519_KEY_LEN => Ok(der),
        len if len == ED25519_SPKI_PREFIX.len() + ED25519_KEY_LEN
            && der.starts_with(&ED25519_SPKI_PREFIX) =>
        {
            Ok(der[ED25519_SPKI_PREFIX.len()..].to_vec())
        }
        len => Err(AuthError::InvalidKey(format!(
            "expected an Ed25519 public key, got {len} bytes"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ring::rand::SystemRandom;
    use ring::signature::{Ed25519KeyPair, KeyPair};

    fn key_pair() -> Ed25519KeyPair {
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&SystemRandom::new()).unwrap();
        Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).unwrap()
    }

    fn sign(key_pair: &Ed25519KeyPair, alg: &str, claims: &Claims) -> String {
        let header = URL_SAFE_NO_PAD.encode(format!(r#"{{"alg":"{alg}","typ":"JWT"}}"#));
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).unwrap());
        let unsigned = format!("{header}.{payload}");
        let signature = URL_SAFE_NO_PAD.encode(key_pair.sign(unsigned.as_bytes()));
        format!("{unsigned}.{signature}")
    }

    fn claims(role: Role, exp: i64) -> Claims {
        Claims {
            sub: "alice".into(),
            role,
            exp,
            iat: None,
        }
    }

    fn verifier(key_pair: &Ed25519KeyPair) -> TokenVerifier {
        TokenVerifier::new(Some(key_pair.public_key().as_ref().to_vec()), true, 30)
    }

    #[test]
    fn test_valid_token() {
        let keys = key_pair();
        let token = sign(&keys, "EdDSA", &claims(Role::Writer, 2_000));
        let identity = verifier(&keys)
            .authenticate(Some(&format!("Bearer {token}")), 1_000)
            .unwrap();

        assert_eq!(identity.subject, "alice");
        assert_eq!(identity.role, Role::Writer);
        assert_eq!(identity.token.as_deref(), Some(token.as_str()));
    }

    #[test]
    fn test_expiry_with_leeway() {
        let keys = key_pair();
        let token = sign(&keys, "EdDSA", &claims(Role::Writer, 1_000));
        let verifier = verifier(&keys);

        assert!(verifier.verify(&token, 1_020).is_ok());
        assert!(matches!(verifier.verify(&token, 1_031), Err(AuthError::Expired)));
    }

    #[test]
    fn test_foreign_key_and_tampering_rejected() {
        let keys = key_pair();
        let token = sign(&key_pair(), "EdDSA", &claims(Role::Admin, 2_000));
        assert!(matches!(
            verifier(&keys).verify(&token, 1_000),
            Err(AuthError::BadSignature)
        ));

        let token = sign(&keys, "EdDSA", &claims(Role::Reader, 2_000));
        let forged_claims = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&claims(Role::Admin, 2_000)).unwrap(),
        );
        let parts: Vec<&str> = token.split('.').collect();
        let forged = format!("{}.{}.{}", parts[0], forged_claims, parts[2]);
        assert!(matches!(
            verifier(&keys).verify(&forged, 1_000),
            Err(AuthError::BadSignature)
        ));
    }

    #[test]
    fn test_only_eddsa_accepted() {
        let keys = key_pair();
        let token = sign(&keys, "none", &claims(Role::Admin, 2_000));
        assert!(matches!(
            verifier(&keys).verify(&token, 1_000),
            Err(AuthError::UnsupportedAlgorithm(_))
        ));
    }

    #[test]
    fn test_missing_token() {
        let keys = key_pair();
        assert!(matches!(
            verifier(&keys).authenticate(None, 0),
            Err(AuthError::MissingToken)
        ));
        assert!(TokenVerifier::disabled().authenticate(None, 0).is_ok());
    }

    #[test]
    fn test_reader_is_read_only() {
        let reader = Identity {
            subject: "bob".into(),
            role: Role::Reader,
            token: None,
        };
        assert!(reader.authorize(Operation::Read).is_ok());
        let err = reader.authorize(Operation::Create).unwrap_err();
        assert!(err.is_forbidden());

        let role: Role = serde_json::from_str("\"auditor\"").unwrap();
        assert_eq!(role, Role::Reader);
    }

    #[test]
    fn test_parse_public_key_forms() {
        let keys = key_pair();
        let raw = keys.public_key().as_ref().to_vec();
        assert_eq!(parse_public_key(&raw).unwrap(), raw);

        let mut der = ED25519_SPKI_PREFIX.to_vec();
        der.extend_from_slice(&raw);
        let pem = format!(
            "-----BEGIN PUBLIC KEY-----\n{}\n-----END PUBLIC KEY-----\n",
            STANDARD.encode(&der)
        );
        assert_eq!(parse_public_key(pem.as_bytes()).unwrap(), raw);

        assert!(parse_public_key(b"short").is_err());
    }
}
