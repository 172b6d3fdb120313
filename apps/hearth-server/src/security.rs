use axum::http::HeaderMap;
use hearth_core::util::env_string;
use sha2::Digest;

pub(crate) const ADMIN_HEADER: &str = "X-Hearth-Admin";

fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn presented_token(headers: &HeaderMap) -> Option<String> {
    let bearer = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string());
    bearer.or_else(|| {
        headers
            .get(ADMIN_HEADER)
            .and_then(|h| h.to_str().ok())
            .map(|t| t.trim().to_string())
    })
}

/// Gate for mutating endpoints. Open when no admin token is configured or in
/// debug mode; otherwise the caller must present the token (or a token whose
/// sha256 matches `HEARTH_ADMIN_TOKEN_SHA256`).
pub(crate) fn admin_ok(headers: &HeaderMap) -> bool {
    if hearth_core::settings::debug_mode() {
        return true;
    }
    let token_plain = env_string("HEARTH_ADMIN_TOKEN");
    let token_hash = env_string("HEARTH_ADMIN_TOKEN_SHA256");
    if token_plain.is_none() && token_hash.is_none() {
        return true;
    }
    let Some(presented) = presented_token(headers) else {
        return false;
    };
    if let Some(plain) = token_plain.as_deref() {
        if ct_eq(plain.as_bytes(), presented.as_bytes()) {
            return true;
        }
    }
    if let Some(hash) = token_hash.as_deref() {
        let want = hash.to_ascii_lowercase();
        let got = hex::encode(sha2::Sha256::digest(presented.as_bytes()));
        return ct_eq(want.as_bytes(), got.as_bytes());
    }
    false
}
