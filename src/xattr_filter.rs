//! Reserved extended attribute namespaces (spec §4.11).
//!
//! Anything under these prefixes is the overlay's own bookkeeping and must
//! never be visible to, or settable by, a caller.

pub const RESERVED_PREFIXES: &[&str] = &["user.fuseoverlayfs.", "trusted.overlay."];

pub fn is_reserved(name: &str) -> bool {
    RESERVED_PREFIXES.iter().any(|p| name.starts_with(p))
}

/// Filter a `listxattr` result, dropping reserved names.
pub fn filter_listxattr(names: Vec<String>) -> Vec<String> {
    names.into_iter().filter(|n| !is_reserved(n)).collect()
}

pub const OPAQUE_TRUSTED: &str = "trusted.overlay.opaque";
pub const OPAQUE_USER: &str = "user.fuseoverlayfs.opaque";
pub const ORIGIN_XATTR: &str = "user.fuseoverlayfs.origin";
pub const OVERRIDE_STAT_USER: &str = "user.containers.override_stat";
pub const OVERRIDE_STAT_TRUSTED: &str = "trusted.overlay.override_stat";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_namespaces_are_caught() {
        assert!(is_reserved("trusted.overlay.opaque"));
        assert!(is_reserved("user.fuseoverlayfs.origin"));
        assert!(!is_reserved("user.mime_type"));
        assert!(!is_reserved("security.selinux"));
    }

    #[test]
    fn listxattr_filter_drops_only_reserved() {
        let names = vec![
            "user.mime_type".to_string(),
            "trusted.overlay.opaque".to_string(),
            "security.selinux".to_string(),
        ];
        let filtered = filter_listxattr(names);
        assert_eq!(filtered, vec!["user.mime_type".to_string(), "security.selinux".to_string()]);
    }
}
