use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::AuthError;
use crate::types::ConnectionRole;

/// Caller identity asserted by the external auth service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub subject: String,
    pub role: ConnectionRole,
}

fn role_label(role: ConnectionRole) -> &'static str {
    match role {
        ConnectionRole::Operator => "operator",
        _ => "user",
    }
}

fn identity_mac(secret: &str, subject: &str, role: &str) -> Option<Hmac<Sha256>> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(format!("{subject}:{role}").as_bytes());
    Some(mac)
}

/// Token format: `subject:role:hex(hmac_sha256(secret, "subject:role"))`.
pub fn sign_identity_token(secret: &str, subject: &str, role: ConnectionRole) -> Option<String> {
    if secret.is_empty() || subject.is_empty() || subject.contains(':') {
        return None;
    }
    let label = role_label(role);
    let mac = identity_mac(secret, subject, label)?;
    Some(format!(
        "{subject}:{label}:{}",
        hex::encode(mac.finalize().into_bytes())
    ))
}

/// With an empty secret (dev mode) the token is read without a signature
/// check: `subject` or `subject:role`.
pub fn verify_identity_token(secret: &str, token: &str) -> Option<Identity> {
    let token = token.trim();
    let mut parts = token.splitn(3, ':');
    let subject = parts.next().filter(|s| !s.is_empty())?.to_string();
    let role = match parts.next().unwrap_or("user") {
        "operator" => ConnectionRole::Operator,
        "user" => ConnectionRole::User,
        _ => return None,
    };

    if secret.is_empty() {
        return Some(Identity { subject, role });
    }

    let signature = parts.next()?;
    let Ok(signature_bytes) = hex::decode(signature) else {
        return None;
    };
    let mac = identity_mac(secret, &subject, role_label(role))?;
    mac.verify_slice(&signature_bytes).ok()?;
    Some(Identity { subject, role })
}

/// Operator id behind a token. In dev mode any subject may act as an
/// operator.
pub fn operator_subject(secret: &str, token: &str) -> Option<String> {
    let identity = verify_identity_token(secret, token)?;
    (secret.is_empty() || identity.role == ConnectionRole::Operator).then_some(identity.subject)
}

/// End user behind a request. A token must verify; a bare claimed id is
/// only trusted in dev mode and ignored otherwise.
pub fn resolve_user(
    secret: &str,
    token: Option<&str>,
    claimed: Option<&str>,
) -> Result<Option<String>, AuthError> {
    if let Some(token) = token.map(str::trim).filter(|t| !t.is_empty()) {
        return verify_identity_token(secret, token)
            .map(|identity| Some(identity.subject))
            .ok_or(AuthError::InvalidToken);
    }
    if !secret.is_empty() {
        return Ok(None);
    }
    Ok(claimed
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string))
}

pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let header = headers.get("authorization")?.to_str().ok()?;
    let token = header.strip_prefix("Bearer ")?;
    Some(token.trim().to_string())
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn signed_token_round_trips_with_role() {
        let token = sign_identity_token("s3cret", "op-7", ConnectionRole::Operator).unwrap();
        let identity = verify_identity_token("s3cret", &token).unwrap();
        assert_eq!(identity.subject, "op-7");
        assert_eq!(identity.role, ConnectionRole::Operator);
    }

    #[test]
    fn tampered_role_is_rejected() {
        let token = sign_identity_token("s3cret", "u-1", ConnectionRole::User).unwrap();
        let forged = token.replacen(":user:", ":operator:", 1);
        assert!(verify_identity_token("s3cret", &forged).is_none());
        assert!(verify_identity_token("other", &token).is_none());
        assert!(verify_identity_token("s3cret", "u-1:user").is_none());
    }

    #[test]
    fn dev_mode_accepts_plain_subjects() {
        let identity = verify_identity_token("", "u-9").unwrap();
        assert_eq!(identity.role, ConnectionRole::User);
        let operator = verify_identity_token("", "op-1:operator").unwrap();
        assert_eq!(operator.role, ConnectionRole::Operator);
        assert!(verify_identity_token("", "").is_none());
    }

    #[test]
    fn operator_role_is_required_outside_dev_mode() {
        let user = sign_identity_token("s3cret", "u-1", ConnectionRole::User).unwrap();
        let operator = sign_identity_token("s3cret", "op-1", ConnectionRole::Operator).unwrap();
        assert!(operator_subject("s3cret", &user).is_none());
        assert_eq!(operator_subject("s3cret", &operator).as_deref(), Some("op-1"));
        assert_eq!(operator_subject("", "op-2").as_deref(), Some("op-2"));
    }

    #[test]
    fn claimed_user_ids_only_count_in_dev_mode() {
        assert_eq!(resolve_user("", None, Some("u-1")).unwrap().as_deref(), Some("u-1"));
        assert_eq!(resolve_user("s3cret", None, Some("u-1")).unwrap(), None);
        let token = sign_identity_token("s3cret", "u-2", ConnectionRole::User).unwrap();
        assert_eq!(
            resolve_user("s3cret", Some(&token), Some("u-1")).unwrap().as_deref(),
            Some("u-2")
        );
        assert!(matches!(
            resolve_user("s3cret", Some("u-2:user:00"), None),
            Err(AuthError::InvalidToken)
        ));
    }

    #[test]
    fn bearer_token_strips_prefix() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer  abc "));
        assert_eq!(bearer_token(&headers).as_deref(), Some("abc"));
        headers.insert("authorization", HeaderValue::from_static("Basic abc"));
        assert!(bearer_token(&headers).is_none());
    }
}
