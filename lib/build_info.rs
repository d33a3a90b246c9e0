/// Build metadata reported by `--version`, the bootstrap log event and the
/// `export_build_info` metric.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_COMMIT_HASH: &str = env!("EXPORT_STREAMER_GIT_COMMIT_HASH");
pub const VERSION_WITH_COMMIT: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    "+",
    env!("EXPORT_STREAMER_GIT_COMMIT_HASH")
);

/// Returns a short git hash suitable for log context and labels.
///
/// `"unknown"` is kept as-is when git metadata was unavailable at build time.
pub fn short_commit_hash() -> &'static str {
    if GIT_COMMIT_HASH == "unknown" {
        return GIT_COMMIT_HASH;
    }

    let short_len = 12usize.min(GIT_COMMIT_HASH.len());
    &GIT_COMMIT_HASH[..short_len]
}

#[cfg(test)]
mod tests {
    use super::{short_commit_hash, GIT_COMMIT_HASH, VERSION, VERSION_WITH_COMMIT};

    #[test]
    fn version_with_commit_starts_with_semver_and_separator() {
        assert!(VERSION_WITH_COMMIT.starts_with(VERSION));
        assert!(VERSION_WITH_COMMIT.contains('+'));
    }

    #[test]
    fn short_hash_never_exceeds_twelve_chars() {
        assert!(!GIT_COMMIT_HASH.is_empty());
        assert!(short_commit_hash().len() <= 12);
    }
}
