//! Cache key construction.
//!
//! Query keys are readable strings (`path?sorted-params`) so they can double
//! as invalidation targets named by mutations. Request signatures are hashes
//! used only by the transport-level response cache.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use url::form_urlencoded;

/// Build a query key from a path and its parameters.
///
/// Parameters are sorted so that the same logical query always maps to the
/// same key regardless of the order the caller listed them in.
pub fn query_key(path: &str, params: &[(&str, &str)]) -> String {
    if params.is_empty() {
        return path.to_string();
    }

    let mut sorted = params.to_vec();
    sorted.sort();

    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (name, value) in sorted {
        serializer.append_pair(name, value);
    }
    format!("{path}?{}", serializer.finish())
}

/// Compute a hash for any hashable value.
pub fn hash_value<T: Hash>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

/// Signature of an outbound request: target, method and headers.
///
/// Header names are case-insensitive on the wire, so they are lowercased and
/// sorted before hashing.
pub fn request_signature(method: &str, target: &str, headers: &[(String, String)]) -> u64 {
    let mut normalized: Vec<(String, &str)> = headers
        .iter()
        .map(|(name, value)| (name.to_ascii_lowercase(), value.as_str()))
        .collect();
    normalized.sort();
    hash_value(&(method.to_ascii_uppercase(), target, normalized))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_key_without_params_is_the_path() {
        assert_eq!(query_key("/api/friends", &[]), "/api/friends");
    }

    #[test]
    fn query_key_sorts_and_encodes_params() {
        let key = query_key("/api/search", &[("q", "rust & go"), ("page", "2")]);
        assert_eq!(key, "/api/search?page=2&q=rust+%26+go");
        assert_eq!(
            key,
            query_key("/api/search", &[("page", "2"), ("q", "rust & go")])
        );
    }

    #[test]
    fn signature_ignores_header_order_and_case() {
        let a = request_signature(
            "GET",
            "/api/me",
            &[
                ("Accept".to_string(), "application/json".to_string()),
                ("X-Client".to_string(), "cli".to_string()),
            ],
        );
        let b = request_signature(
            "get",
            "/api/me",
            &[
                ("x-client".to_string(), "cli".to_string()),
                ("accept".to_string(), "application/json".to_string()),
            ],
        );
        assert_eq!(a, b);
    }

    #[test]
    fn signature_distinguishes_method_target_and_headers() {
        let base = request_signature("GET", "/api/me", &[]);
        assert_ne!(base, request_signature("HEAD", "/api/me", &[]));
        assert_ne!(base, request_signature("GET", "/api/friends", &[]));
        assert_ne!(
            base,
            request_signature("GET", "/api/me", &[("accept".into(), "text/plain".into())])
        );
    }
}
