//! Relay URL helpers: validation, auth tokens and gateway URLs.

use url::Url;

use crate::error::{Error, Result};

const TOKEN_PARAM: &str = "token";

/// Validate a relay URL (ws:// or wss:// with a host) and strip a trailing slash.
pub fn validate_relay_url(url: &str) -> Result<String> {
    let trimmed = url.trim();
    let parsed = Url::parse(trimmed)?;

    if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
        return Err(Error::Precondition(format!(
            "Relay URL must use ws:// or wss://, got {}",
            parsed.scheme()
        )));
    }
    if parsed.host_str().map(|h| h.is_empty()).unwrap_or(true) {
        return Err(Error::Precondition("Relay URL must include a host".into()));
    }

    Ok(trimmed.trim_end_matches('/').to_string())
}

/// The auth token carried in the URL's query, if any
pub fn token_of(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let token = parsed
        .query_pairs()
        .find(|(k, _)| k == TOKEN_PARAM)
        .map(|(_, v)| v.into_owned());
    token.filter(|t| !t.is_empty())
}

pub fn has_token(url: &str) -> bool {
    token_of(url).is_some()
}

/// Return `url` with its `token` query parameter set to `token` (replacing any existing one)
pub fn with_token(url: &str, token: &str) -> Result<String> {
    let mut parsed = Url::parse(url)?;
    let others: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(k, _)| k != TOKEN_PARAM)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    {
        let mut query = parsed.query_pairs_mut();
        query.clear();
        for (k, v) in &others {
            query.append_pair(k, v);
        }
        query.append_pair(TOKEN_PARAM, token);
    }
    Ok(parsed.to_string())
}

/// Merge rule for competing URLs: a token-bearing URL always beats one without;
/// otherwise the incoming URL replaces the current one.
pub fn prefer_url(current: Option<&str>, incoming: &str) -> String {
    match current {
        Some(current) if has_token(current) && !has_token(incoming) => current.to_string(),
        _ => incoming.to_string(),
    }
}

/// `<base>/relay[?token=<token>]`
pub fn gateway_relay_url(base: &str, token: Option<&str>) -> Result<String> {
    let url = format!("{}/relay", base.trim().trim_end_matches('/'));
    match token {
        Some(token) if !token.is_empty() => with_token(&url, token),
        _ => Ok(Url::parse(&url)?.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate() {
        assert_eq!(validate_relay_url(" wss://relay.example/ ").unwrap(), "wss://relay.example");
        assert!(validate_relay_url("https://relay.example").is_err());
        assert!(validate_relay_url("not a url").is_err());
    }

    #[test]
    fn test_token_extraction() {
        assert_eq!(token_of("wss://r1/g?token=abc").as_deref(), Some("abc"));
        assert_eq!(token_of("wss://r1/g?x=1&token=abc").as_deref(), Some("abc"));
        assert!(token_of("wss://r1/g").is_none());
        assert!(token_of("wss://r1/g?token=").is_none());
    }

    #[test]
    fn test_with_token_replaces() {
        let url = with_token("wss://r1/g?token=old&x=1", "new").unwrap();
        assert_eq!(token_of(&url).as_deref(), Some("new"));
        assert!(url.contains("x=1"));
        assert_eq!(url.matches("token=").count(), 1);
    }

    #[test]
    fn test_prefer_token_url() {
        assert_eq!(prefer_url(Some("wss://r1?token=a"), "wss://r1"), "wss://r1?token=a");
        assert_eq!(prefer_url(Some("wss://r1"), "wss://r2"), "wss://r2");
        assert_eq!(prefer_url(Some("wss://r1?token=a"), "wss://r1?token=b"), "wss://r1?token=b");
        assert_eq!(prefer_url(None, "wss://r1"), "wss://r1");
    }

    #[test]
    fn test_gateway_url() {
        assert_eq!(
            gateway_relay_url("wss://gw.example/", Some("tok")).unwrap(),
            "wss://gw.example/relay?token=tok"
        );
        assert_eq!(gateway_relay_url("wss://gw.example", None).unwrap(), "wss://gw.example/relay");
    }
}
