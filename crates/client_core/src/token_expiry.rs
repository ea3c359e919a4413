use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::Utc;

pub const DEFAULT_REFRESH_THRESHOLD_SECS: i64 = 60;

/// Reads the integer `exp` claim (unix seconds) from a bearer token's payload
/// segment. Any decoding failure yields `None`.
pub fn expiration_time(token: Option<&str>) -> Option<i64> {
    let token = token?;
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return None;
    }
    let payload = URL_SAFE_NO_PAD
        .decode(parts[1].trim_end_matches('='))
        .ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&payload).ok()?;
    claims.get("exp")?.as_i64()
}

/// True when the token is absent, undecodable, has no `exp`, or expires within
/// `threshold_secs` of now (inclusive).
pub fn is_expiring_soon(token: Option<&str>, threshold_secs: i64) -> bool {
    is_expiring_soon_at(token, threshold_secs, Utc::now().timestamp())
}

pub fn is_expiring_soon_at(token: Option<&str>, threshold_secs: i64, now_secs: i64) -> bool {
    match expiration_time(token) {
        Some(exp) => exp.saturating_sub(now_secs) <= threshold_secs,
        None => true,
    }
}

#[cfg(test)]
#[path = "tests/token_expiry_tests.rs"]
mod tests;
