//! Embeds a short commit hash for `parley --version`.
//!
//! Packagers building from a tarball can set `PARLEY_GIT_HASH` instead.

use std::process::Command;

fn git_short_hash() -> Option<String> {
    let output = Command::new("git")
        .args(["rev-parse", "--short=7", "HEAD"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let hash = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!hash.is_empty()).then_some(hash)
}

fn main() {
    println!("cargo:rerun-if-env-changed=PARLEY_GIT_HASH");
    println!("cargo:rerun-if-changed=.git/HEAD");

    let hash = std::env::var("PARLEY_GIT_HASH")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(git_short_hash);
    if let Some(hash) = hash {
        println!("cargo:rustc-env=GIT_HASH={}", hash);
    }
}
