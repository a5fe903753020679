//! Name sanitizers for Kubernetes objects, DNS labels, and docker names.

/// Lowercase, `_` becomes `-`, and everything outside `[a-z0-9-]` is dropped.
///
/// `"My_App.1.0"` becomes `"my-app10"`.
pub fn k8s_sanitize(name: &str) -> String {
    name.chars()
        .filter_map(|c| match c {
            '_' => Some('-'),
            c if c.is_ascii_alphanumeric() || c == '-' => Some(c.to_ascii_lowercase()),
            _ => None,
        })
        .collect()
}

/// Like [`k8s_sanitize`], with leading and trailing dashes trimmed so the
/// result is a valid DNS label.
pub fn dns_sanitize(name: &str) -> String {
    k8s_sanitize(name).trim_matches('-').to_string()
}

/// Docker names allow `[a-zA-Z0-9_.-]`; everything else is dropped.
pub fn docker_sanitize(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        .collect()
}
