// SPDX-License-Identifier: GPL-3.0-only

use std::process::Command;

fn main() {
    println!("cargo::rerun-if-changed=.git/HEAD");
    println!("cargo::rerun-if-changed=.git/refs/tags");
    println!("cargo::rerun-if-env-changed=DEPTH_VSR_VERSION");

    // Packagers building from a tarball set the version explicitly
    let version = std::env::var("DEPTH_VSR_VERSION").unwrap_or_else(|_| git_version());
    println!("cargo::rustc-env=GIT_VERSION={}", version);
}

/// `0.1.0` at a tag, `0.1.0+5.abcdef1` five commits past it, the package
/// version plus short hash when no tag exists, `unknown` outside git
fn git_version() -> String {
    let package = env!("CARGO_PKG_VERSION");
    let Some(describe) = git(&["describe", "--tags", "--long", "--match", "v*"]) else {
        return match git(&["rev-parse", "--short", "HEAD"]) {
            Some(hash) => format!("{}+{}", package, hash),
            None => "unknown".to_string(),
        };
    };

    // v0.1.0-5-gabcdef1
    let describe = describe.strip_prefix('v').unwrap_or(&describe);
    let parts: Vec<&str> = describe.rsplitn(3, '-').collect();
    match parts.as_slice() {
        [_, "0", tag] => tag.to_string(),
        [hash, commits, tag] => {
            let hash = hash.strip_prefix('g').unwrap_or(hash);
            format!("{}+{}.{}", tag, commits, hash)
        }
        _ => describe.to_string(),
    }
}

fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
