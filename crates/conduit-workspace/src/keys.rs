//! Content addressing and artifact path handling.

use conduit_core::{Error, Result};
use sha2::{Digest, Sha256};

/// Hex SHA-256 of `data`.
pub fn digest(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Blob key for content with the given digest.
pub fn blob_key(checksum: &str) -> String {
    format!("sha256/{}", checksum)
}

/// Normalize a relative artifact path.
///
/// Backslashes become `/`, empty and `.` segments are dropped. Absolute paths
/// and `..` segments are rejected.
pub fn normalize_path(path: &str) -> Result<String> {
    let unified = path.replace('\\', "/");
    if unified.starts_with('/') || unified.contains(':') {
        return Err(Error::InvalidArtifactPath(path.to_string()));
    }
    let mut segments = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => {}
            ".." => return Err(Error::InvalidArtifactPath(path.to_string())),
            s => segments.push(s),
        }
    }
    if segments.is_empty() {
        return Err(Error::InvalidArtifactPath(path.to_string()));
    }
    Ok(segments.join("/"))
}

/// Place a stored artifact path under an attach root.
pub fn rebase(root: &str, path: &str) -> String {
    let root = root.trim_end_matches('/');
    match root {
        "" | "." => path.to_string(),
        _ => format!("{}/{}", root, path),
    }
}

/// Sanitize a key for use in filenames.
pub fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            _ => c,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_key_is_content_addressed() {
        let a = blob_key(&digest(b"hello"));
        let b = blob_key(&digest(b"hello"));
        assert_eq!(a, b);
        assert!(a.starts_with("sha256/"));
        assert_eq!(a.len(), "sha256/".len() + 64);
        assert_ne!(a, blob_key(&digest(b"world")));
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("release/app").unwrap(), "release/app");
        assert_eq!(normalize_path("./release//app/").unwrap(), "release/app");
        assert_eq!(normalize_path("bin\\tool.exe").unwrap(), "bin/tool.exe");
        assert!(matches!(
            normalize_path("/etc/passwd"),
            Err(Error::InvalidArtifactPath(_))
        ));
        assert!(normalize_path("../outside").is_err());
        assert!(normalize_path("a/../../b").is_err());
        assert!(normalize_path("C:/temp").is_err());
        assert!(normalize_path("./").is_err());
    }

    #[test]
    fn test_rebase() {
        assert_eq!(rebase("/srv/app/", "release/app"), "/srv/app/release/app");
        assert_eq!(rebase(".", "report.xml"), "report.xml");
        assert_eq!(rebase("workspace", "a"), "workspace/a");
    }

    #[test]
    fn test_sanitize_key() {
        assert_eq!(sanitize_key("sha256/abc"), "sha256_abc");
        assert_eq!(sanitize_key("cache:key"), "cache_key");
    }
}
