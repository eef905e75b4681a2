pub const FULL: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    "+git.",
    env!("TAGLEDGER_GIT_COUNT"),
    ".",
    env!("TAGLEDGER_GIT_SHA"),
    env!("TAGLEDGER_GIT_DIRTY")
);

#[cfg(test)]
mod tests {
    use super::FULL;

    #[test]
    fn version_includes_current_git_sha() {
        assert!(FULL.starts_with(env!("CARGO_PKG_VERSION")));
        assert!(FULL.contains("+git."));
        // Source tarballs build without git metadata.
        let Ok(output) = std::process::Command::new("git")
            .args(["rev-parse", "--short", "HEAD"])
            .output()
        else {
            return;
        };
        if !output.status.success() {
            return;
        }
        let sha = String::from_utf8(output.stdout).expect("utf8");
        let sha = sha.trim();
        assert!(
            FULL.contains(sha),
            "version string does not include git sha; version={FULL} sha={sha}"
        );
    }
}
