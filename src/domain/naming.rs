//! Deterministic Kubernetes resource names
//!
//! Names derived here are stable for a given instance id, so the same
//! resource is addressed on every reconciliation.

use regex::Regex;
use std::sync::LazyLock;

use crate::error::KubernetesResourceError;

/// Maximum length of a Kubernetes label value / DNS-1123 label
pub const MAX_NAME_LENGTH: usize = 63;

const INVALID_FIRST_CHAR_PREFIX: &str = "short-name-";

static DASH_CHARS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[._\s]+").unwrap());
static INVALID_CHARS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^-a-z0-9]").unwrap());
static DASH_RUNS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"-+").unwrap());
static DNS_LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z]([-a-z0-9]*[a-z0-9])?$").unwrap());

/// Turn an arbitrary name into a valid Kubernetes resource name
pub fn normalize(name: &str) -> Result<String, KubernetesResourceError> {
    let ascii: String = name.chars().filter(|c| c.is_ascii()).collect();
    let lower = ascii.to_lowercase();
    let dashed = DASH_CHARS.replace_all(&lower, "-");
    let valid = INVALID_CHARS.replace_all(&dashed, "");
    let collapsed = DASH_RUNS.replace_all(&valid, "-");
    let trimmed = collapsed.trim_matches('-');

    let result = if trimmed.starts_with(|c: char| c.is_ascii_lowercase()) {
        trimmed.to_string()
    } else {
        format!("{}{}", INVALID_FIRST_CHAR_PREFIX, trimmed)
    };

    if result.len() > MAX_NAME_LENGTH {
        return Err(KubernetesResourceError::InvalidName {
            name: name.to_string(),
            reason: format!("longer than {} characters after normalization", MAX_NAME_LENGTH),
        });
    }
    if !DNS_LABEL.is_match(&result) {
        return Err(KubernetesResourceError::InvalidName {
            name: name.to_string(),
            reason: "not a valid DNS-1123 label after normalization".to_string(),
        });
    }

    Ok(result)
}

/// Name of the Deployment of a service instance
pub fn deployment_name(instance_id: &str) -> Result<String, KubernetesResourceError> {
    normalize(instance_id)
}

/// Name of the Kubernetes Service exposing one interface of an instance
pub fn interface_service_name(
    instance_id: &str,
    interface_name: &str,
) -> Result<String, KubernetesResourceError> {
    normalize(&format!("{}-{}", instance_id, interface_name))
}

/// Name of the image build of a service version
pub fn build_name(short_name: &str, version: &str) -> Result<String, KubernetesResourceError> {
    normalize(&format!("build-{}-{}", short_name, version))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_basic() {
        assert_eq!(normalize("Cart Service").unwrap(), "cart-service");
        assert_eq!(normalize("my_app.v2").unwrap(), "my-app-v2");
        assert_eq!(normalize("--a--b--").unwrap(), "a-b");
        assert_eq!(normalize("Grüße").unwrap(), "gre");
    }

    #[test]
    fn test_normalize_prefixes_invalid_first_char() {
        assert_eq!(normalize("1cart").unwrap(), "short-name-1cart");
        assert_eq!(normalize("-9").unwrap(), "short-name-9");
    }

    #[test]
    fn test_normalize_rejects_empty_and_long() {
        assert!(matches!(
            normalize("!!!"),
            Err(KubernetesResourceError::InvalidName { .. })
        ));
        assert!(normalize(&"a".repeat(64)).is_err());
        assert_eq!(normalize(&"a".repeat(63)).unwrap().len(), 63);
    }

    #[test]
    fn test_derived_names() {
        assert_eq!(deployment_name("cart-1a2b3c4d").unwrap(), "cart-1a2b3c4d");
        assert_eq!(
            interface_service_name("cart-1a2b3c4d", "http").unwrap(),
            "cart-1a2b3c4d-http"
        );
        assert_eq!(build_name("cart", "1.0.0").unwrap(), "build-cart-1-0-0");
    }
}
