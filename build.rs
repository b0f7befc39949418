use chrono::{DateTime, Utc};
use std::process::Command;

/// Build timestamp, pinned by `SOURCE_DATE_EPOCH` for reproducible packages
fn build_date() -> DateTime<Utc> {
    std::env::var("SOURCE_DATE_EPOCH")
        .ok()
        .and_then(|epoch| epoch.trim().parse::<i64>().ok())
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .unwrap_or_else(Utc::now)
}

fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Short commit, suffixed when the tree has local changes
fn source_revision() -> String {
    let Some(commit) = git(&["rev-parse", "--short", "HEAD"]) else {
        return "unknown".to_string();
    };
    match git(&["status", "--porcelain", "--untracked-files=no"]) {
        Some(changes) if !changes.is_empty() => format!("{}-dirty", commit),
        _ => commit,
    }
}

fn main() {
    // Both end up in the banner logged when the object is preloaded
    println!(
        "cargo:rustc-env=BUILD_DATE={}",
        build_date().format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!("cargo:rustc-env=GIT_COMMIT={}", source_revision());

    println!("cargo:rerun-if-env-changed=SOURCE_DATE_EPOCH");
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");
}
