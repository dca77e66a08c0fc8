//! Volume identifiers
//!
//! A volume id is either a bare bucket name or `bucket/prefix`.

use sha1::{Digest, Sha1};

/// Longest name usable as a bucket name as-is
const MAX_NAME_LEN: usize = 63;

/// Lowercase a requested volume name, hashing names that would not fit in
/// a bucket name
pub fn sanitize_volume_id(name: &str) -> String {
    let name = name.to_lowercase();
    if name.len() > MAX_NAME_LEN {
        hex::encode(Sha1::digest(name.as_bytes()))
    } else {
        name
    }
}

/// Split a volume id into bucket and prefix on the first slash; the
/// prefix is empty for a whole-bucket volume
pub fn volume_id_to_bucket_prefix(volume_id: &str) -> (&str, &str) {
    volume_id.split_once('/').unwrap_or((volume_id, ""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_short_name() {
        assert_eq!(sanitize_volume_id("PVC-Data"), "pvc-data");
    }

    #[test]
    fn test_sanitize_long_name_is_hashed() {
        let long = "a".repeat(64);
        let id = sanitize_volume_id(&long);
        assert_eq!(id.len(), 40);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(id, sanitize_volume_id(&long.to_uppercase()));
        assert_eq!(sanitize_volume_id(&"b".repeat(63)), "b".repeat(63));
    }

    #[test]
    fn test_bucket_prefix_split() {
        assert_eq!(volume_id_to_bucket_prefix("data"), ("data", ""));
        assert_eq!(volume_id_to_bucket_prefix("data/pvc-1"), ("data", "pvc-1"));
        assert_eq!(volume_id_to_bucket_prefix("data/a/b"), ("data", "a/b"));
    }
}
