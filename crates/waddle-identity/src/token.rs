//! Signed session tokens — produced by password login, consumed by the
//! auth resolver.
//!
//! Format: `base64url(claims-json) . base64url(hmac-sha256(claims-json))`.
//! The claims envelope embeds everything the pipeline needs so session
//! requests skip the principal lookup entirely.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use waddle_core::types::{AuthFailure, Role};

use crate::error::{IdentityError, Result};
use crate::types::PrincipalContext;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Principal id.
    pub sub: String,
    pub name: String,
    pub role: Role,
    pub tenant: String,
    #[serde(default)]
    pub managed: Vec<String>,
    /// Issued-at (unix seconds).
    pub iat: i64,
    /// Expiry (unix seconds). A token whose expiry equals "now" is expired.
    pub exp: i64,
}

impl SessionClaims {
    pub fn into_context(self) -> PrincipalContext {
        PrincipalContext {
            principal_id: self.sub,
            name: self.name,
            role: self.role,
            tenant_id: self.tenant,
            managed_tenants: self.managed,
            credential_id: None,
        }
    }
}

/// Sign a claims envelope for `ctx`, valid for `ttl_hours`.
pub fn sign(ctx: &PrincipalContext, signing_secret: &str, ttl_hours: u64) -> Result<String> {
    let now = Utc::now().timestamp();
    let claims = SessionClaims {
        sub: ctx.principal_id.clone(),
        name: ctx.name.clone(),
        role: ctx.role,
        tenant: ctx.tenant_id.clone(),
        managed: ctx.managed_tenants.clone(),
        iat: now,
        exp: now + (ttl_hours as i64) * 3600,
    };
    let payload = serde_json::to_vec(&claims).map_err(|e| IdentityError::Token(e.to_string()))?;
    let tag = mac_over(&payload, signing_secret)?;
    Ok(format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(&payload),
        URL_SAFE_NO_PAD.encode(tag)
    ))
}

/// Verify a presented token: signature first, then expiry.
pub fn verify(token: &str, signing_secret: &str) -> Result<SessionClaims> {
    let (payload_b64, tag_b64) = token
        .split_once('.')
        .ok_or(IdentityError::Authentication(AuthFailure::Malformed))?;

    let payload = URL_SAFE_NO_PAD
        .decode(payload_b64)
        .map_err(|_| IdentityError::Authentication(AuthFailure::Malformed))?;
    let tag = URL_SAFE_NO_PAD
        .decode(tag_b64)
        .map_err(|_| IdentityError::Authentication(AuthFailure::Malformed))?;

    let mut mac = HmacSha256::new_from_slice(signing_secret.as_bytes())
        .map_err(|e| IdentityError::Token(e.to_string()))?;
    mac.update(&payload);
    mac.verify_slice(&tag)
        .map_err(|_| IdentityError::Authentication(AuthFailure::BadSecret))?;

    let claims: SessionClaims = serde_json::from_slice(&payload)
        .map_err(|_| IdentityError::Authentication(AuthFailure::Malformed))?;

    if claims.exp <= Utc::now().timestamp() {
        return Err(IdentityError::Authentication(AuthFailure::Expired));
    }
    Ok(claims)
}

fn mac_over(payload: &[u8], signing_secret: &str) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(signing_secret.as_bytes())
        .map_err(|e| IdentityError::Token(e.to_string()))?;
    mac.update(payload);
    Ok(mac.finalize().into_bytes().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> PrincipalContext {
        PrincipalContext {
            principal_id: "p-1".into(),
            name: "alice".into(),
            role: Role::User,
            tenant_id: "t-1".into(),
            managed_tenants: vec![],
            credential_id: None,
        }
    }

    #[test]
    fn sign_verify_round_trip() {
        let token = sign(&ctx(), "secret", 1).unwrap();
        let claims = verify(&token, "secret").unwrap();
        assert_eq!(claims.sub, "p-1");
        assert_eq!(claims.role, Role::User);
        assert_eq!(claims.tenant, "t-1");
    }

    #[test]
    fn wrong_key_is_rejected() {
        let token = sign(&ctx(), "secret", 1).unwrap();
        let err = verify(&token, "other-secret").unwrap_err();
        assert!(matches!(
            err,
            IdentityError::Authentication(AuthFailure::BadSecret)
        ));
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let token = sign(&ctx(), "secret", 1).unwrap();
        let (payload, tag) = token.split_once('.').unwrap();
        // Forge a different payload with the original tag.
        let mut claims: SessionClaims =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(payload).unwrap()).unwrap();
        claims.role = Role::Admin;
        let forged = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).unwrap()),
            tag
        );
        assert!(verify(&forged, "secret").is_err());
    }

    #[test]
    fn expired_token_is_rejected() {
        // ttl of zero hours makes exp == iat == now, which counts as expired.
        let token = sign(&ctx(), "secret", 0).unwrap();
        let err = verify(&token, "secret").unwrap_err();
        assert!(matches!(
            err,
            IdentityError::Authentication(AuthFailure::Expired)
        ));
    }

    #[test]
    fn garbage_is_malformed() {
        for garbage in ["", "no-dot-here", "a.b", "!!!.???"] {
            let err = verify(garbage, "secret").unwrap_err();
            assert!(matches!(err, IdentityError::Authentication(_)), "{garbage}");
        }
    }
}
