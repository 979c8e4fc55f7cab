//! OpenID Connect token exchange
//!
//! Keycloak password grants (CDSE, CREODIAS with a TOTP second factor) and the
//! OAuth client-credentials grant used by EUMETSAT.

use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha1::Sha1;
use tracing::debug;

use super::{ApiClient, Credentials, FetchError, FetchResult, Provider, Session};
use crate::transfer::Credential;

/// Lifetime assumed when the server does not report one
const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 600;

/// Period of a time-based one-time password
const TOTP_STEP_SECS: i64 = 30;

/// Digits of a time-based one-time password
const TOTP_DIGITS: u32 = 6;

/// Token endpoint response
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    /// Bearer token
    pub access_token: String,
    /// Lifetime in seconds
    #[serde(default)]
    pub expires_in: Option<i64>,
}

impl TokenResponse {
    /// Bearer session for `provider`
    pub fn into_session(self, provider: Provider) -> Session {
        Session::expiring_in(
            provider,
            Credential::Bearer(self.access_token),
            self.expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS),
        )
    }
}

/// Resource-owner password grant
pub async fn password_grant(
    api: &ApiClient,
    token_url: &str,
    client_id: &str,
    credentials: &Credentials,
    totp: Option<&str>,
) -> FetchResult<TokenResponse> {
    debug!(token_url, client_id, user = %credentials.user, "Requesting token");
    let mut form = vec![
        ("client_id", client_id.to_string()),
        ("username", credentials.user.clone()),
        ("password", credentials.secret.clone()),
        ("grant_type", "password".to_string()),
    ];
    if let Some(code) = totp {
        form.push(("totp", code.to_string()));
    }

    api.json("token", |client| client.post(token_url).form(&form))
        .await
        .map_err(authentication_failure)
}

/// OAuth client-credentials grant with HTTP basic authentication
pub async fn client_credentials_grant(
    api: &ApiClient,
    token_url: &str,
    credentials: &Credentials,
) -> FetchResult<TokenResponse> {
    debug!(token_url, "Requesting client-credentials token");
    api.json("token", |client| {
        client
            .post(token_url)
            .basic_auth(&credentials.user, Some(&credentials.secret))
            .form(&[("grant_type", "client_credentials")])
    })
    .await
    .map_err(authentication_failure)
}

/// Turn a 4xx from a token endpoint into an authentication failure
pub fn authentication_failure(err: FetchError) -> FetchError {
    match err {
        FetchError::Http { status, message, .. } if (400..500).contains(&status) && status != 429 => {
            FetchError::Authentication(format!(
                "token creation failed (HTTP {status}); response from the server was: {message}"
            ))
        }
        other => other,
    }
}

/// Current one-time password for a base32 `secret`
pub fn totp_now(secret: &str) -> FetchResult<String> {
    totp_at(secret, Utc::now().timestamp())
}

/// One-time password of `secret` at Unix time `timestamp`
pub fn totp_at(secret: &str, timestamp: i64) -> FetchResult<String> {
    let key = decode_base32(secret)
        .ok_or_else(|| FetchError::Authentication("TOTP secret is not valid base32".to_string()))?;
    let counter = (timestamp / TOTP_STEP_SECS) as u64;

    let mut mac = Hmac::<Sha1>::new_from_slice(&key)
        .map_err(|e| FetchError::Authentication(format!("TOTP secret rejected: {e}")))?;
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let code = u32::from_be_bytes([
        digest[offset] & 0x7f,
        digest[offset + 1],
        digest[offset + 2],
        digest[offset + 3],
    ]) % 10u32.pow(TOTP_DIGITS);
    Ok(format!("{:0width$}", code, width = TOTP_DIGITS as usize))
}

/// RFC 4648 base32, case-insensitive, padding and spaces ignored
fn decode_base32(input: &str) -> Option<Vec<u8>> {
    let mut buffer = 0u64;
    let mut bits = 0u32;
    let mut out = Vec::with_capacity(input.len() * 5 / 8);

    for c in input.chars().filter(|c| !c.is_whitespace() && *c != '=') {
        let value = match c.to_ascii_uppercase() {
            c @ 'A'..='Z' => c as u64 - 'A' as u64,
            c @ '2'..='7' => c as u64 - '2' as u64 + 26,
            _ => return None,
        };
        buffer = (buffer << 5) | value;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push((buffer >> bits) as u8);
            buffer &= (1 << bits) - 1;
        }
    }
    if out.is_empty() {
        return None;
    }
    Some(out)
}
