use axum::http::{HeaderMap, header::AUTHORIZATION};

use hostgate_protocol::{ACCESS_TOKEN_PARAM, Params};

// ── Types ────────────────────────────────────────────────────────────────────

/// Why a caller was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AuthFailure {
    #[error("token_missing")]
    TokenMissing,
    #[error("token_mismatch")]
    TokenMismatch,
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Constant-time string comparison (prevents timing attacks).
fn safe_equal(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let diff = a
        .as_bytes()
        .iter()
        .zip(b.as_bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y));
    diff == 0
}

/// Token from `Authorization: Token <value>` (or `Bearer <value>`).
fn header_token(headers: &HeaderMap) -> Option<&str> {
    let raw = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, value) = raw.trim().split_once(' ')?;
    if scheme.eq_ignore_ascii_case("token") || scheme.eq_ignore_ascii_case("bearer") {
        let value = value.trim();
        (!value.is_empty()).then_some(value)
    } else {
        None
    }
}

/// The token a caller presented: header first, then the query parameter.
pub fn presented_token(headers: &HeaderMap, query: &Params) -> Option<String> {
    header_token(headers)
        .map(str::to_string)
        .or_else(|| query.get_str(ACCESS_TOKEN_PARAM))
}

// ── Auth logic ───────────────────────────────────────────────────────────────

/// Check a caller against the configured access token.
///
/// With no token configured every caller is let through.
pub fn authorize(
    expected: Option<&str>,
    headers: &HeaderMap,
    query: &Params,
) -> Result<(), AuthFailure> {
    let Some(expected) = expected else {
        return Ok(());
    };
    let Some(given) = presented_token(headers, query) else {
        return Err(AuthFailure::TokenMissing);
    };
    if !safe_equal(&given, expected) {
        return Err(AuthFailure::TokenMismatch);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use {super::*, axum::http::HeaderValue};

    fn headers(auth: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(AUTHORIZATION, HeaderValue::from_str(auth).unwrap());
        h
    }

    #[test]
    fn open_access_without_configured_token() {
        assert!(authorize(None, &HeaderMap::new(), &Params::new()).is_ok());
    }

    #[test]
    fn header_token_is_accepted() {
        assert!(authorize(Some("abc"), &headers("Token abc"), &Params::new()).is_ok());
        assert!(authorize(Some("abc"), &headers("bearer abc"), &Params::new()).is_ok());
    }

    #[test]
    fn query_token_is_fallback() {
        let q = Params::from_pairs([("access_token", "abc")]);
        assert!(authorize(Some("abc"), &HeaderMap::new(), &q).is_ok());
        // unknown scheme falls through to the query
        assert!(authorize(Some("abc"), &headers("Basic xyz"), &q).is_ok());
    }

    #[test]
    fn header_wins_over_query() {
        let q = Params::from_pairs([("access_token", "abc")]);
        assert_eq!(
            authorize(Some("abc"), &headers("Token nope"), &q),
            Err(AuthFailure::TokenMismatch)
        );
    }

    #[test]
    fn missing_and_mismatch() {
        assert_eq!(
            authorize(Some("abc"), &HeaderMap::new(), &Params::new()),
            Err(AuthFailure::TokenMissing)
        );
        assert_eq!(
            authorize(Some("abc"), &headers("Token"), &Params::new()),
            Err(AuthFailure::TokenMissing)
        );
        assert_eq!(
            authorize(Some("abc"), &headers("Token abd"), &Params::new()),
            Err(AuthFailure::TokenMismatch)
        );
    }

    #[test]
    fn safe_equal_handles_length_mismatch() {
        assert!(safe_equal("abc", "abc"));
        assert!(!safe_equal("abc", "abcd"));
        assert!(!safe_equal("abc", "abd"));
    }
}
