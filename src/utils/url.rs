//! URL helpers for building chat service endpoints.

/// Remove trailing slashes from a base URL.
///
/// # Examples
///
/// ```
/// use uru::utils::url::normalize_base_url;
///
/// assert_eq!(normalize_base_url("http://localhost:8000/api/"), "http://localhost:8000/api");
/// assert_eq!(normalize_base_url("http://localhost:8000/api///"), "http://localhost:8000/api");
/// ```
pub fn normalize_base_url(base_url: &str) -> String {
    base_url.trim().trim_end_matches('/').to_string()
}

/// Join a base URL and an endpoint path with exactly one slash.
///
/// # Examples
///
/// ```
/// use uru::utils::url::construct_api_url;
///
/// assert_eq!(
///     construct_api_url("http://localhost:8000/api/", "/chat/message"),
///     "http://localhost:8000/api/chat/message"
/// );
/// ```
pub fn construct_api_url(base_url: &str, endpoint: &str) -> String {
    let normalized_base = normalize_base_url(base_url);
    let endpoint = endpoint.trim_start_matches('/');
    format!("{}/{}", normalized_base, endpoint)
}

/// Whether `url` names an http or https location with a host part.
pub fn is_http_url(url: &str) -> bool {
    let url = url.trim();
    ["http://", "https://"].iter().any(|scheme| {
        url.get(..scheme.len())
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case(scheme))
            && url.len() > scheme.len()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_without_double_slashes() {
        for base in [
            "http://localhost:8000/api",
            "http://localhost:8000/api/",
            " http://localhost:8000/api// ",
        ] {
            assert_eq!(
                construct_api_url(base, "chat/stream"),
                "http://localhost:8000/api/chat/stream"
            );
        }
        assert_eq!(
            construct_api_url("https://chat.example.com", "//chat/models"),
            "https://chat.example.com/chat/models"
        );
    }

    #[test]
    fn recognises_http_urls() {
        assert!(is_http_url("http://localhost:8000/api"));
        assert!(is_http_url("HTTPS://chat.example.com"));
        assert!(!is_http_url("https://"));
        assert!(!is_http_url("localhost:8000"));
        assert!(!is_http_url("ftp://example.com"));
        assert!(!is_http_url(""));
    }
}
