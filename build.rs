use std::process::Command;

fn main() {
    println!("cargo:rerun-if-env-changed=EXPORT_STREAMER_COMMIT");
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");

    // Release images pass the commit in; local builds ask git.
    let commit = match std::env::var("EXPORT_STREAMER_COMMIT") {
        Ok(commit) if !commit.trim().is_empty() => commit.trim().to_string(),
        _ => git_commit().unwrap_or_else(|| "unknown".to_string()),
    };

    println!("cargo:rustc-env=EXPORT_STREAMER_GIT_COMMIT_HASH={commit}");
}

/// `HEAD`, with a `-dirty` suffix when tracked files have local edits.
fn git_commit() -> Option<String> {
    let head = git(&["rev-parse", "--verify", "HEAD"])?;
    let head = head.trim();
    if head.is_empty() {
        return None;
    }

    let dirty = git(&["status", "--porcelain", "--untracked-files=no"])
        .is_some_and(|status| !status.trim().is_empty());
    Some(if dirty {
        format!("{head}-dirty")
    } else {
        head.to_string()
    })
}

fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8(output.stdout).ok()
}
