use std::process::Command;

use time::OffsetDateTime;
use time::macros::format_description;

/// Exported to the compiler for `playerd --version`.
fn main() {
    println!("cargo:rerun-if-env-changed=SOURCE_DATE_EPOCH");
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rustc-env=PLAYERD_REVISION={}", revision());
    println!("cargo:rustc-env=PLAYERD_BUILT={}", built_on());
}

/// Abbreviated commit, marked `-dirty` for uncommitted changes; `unknown` outside a checkout.
fn revision() -> String {
    let out = Command::new("git")
        .args(["describe", "--always", "--dirty", "--abbrev=10"])
        .output();
    match out {
        Ok(out) if out.status.success() => {
            let rev = String::from_utf8_lossy(&out.stdout).trim().to_string();
            if rev.is_empty() { "unknown".into() } else { rev }
        }
        _ => "unknown".into(),
    }
}

/// Build day in UTC. Honours `SOURCE_DATE_EPOCH` for reproducible builds.
fn built_on() -> String {
    let when = std::env::var("SOURCE_DATE_EPOCH")
        .ok()
        .and_then(|secs| secs.parse::<i64>().ok())
        .and_then(|secs| OffsetDateTime::from_unix_timestamp(secs).ok())
        .unwrap_or_else(OffsetDateTime::now_utc);
    when.format(format_description!("[year]-[month]-[day]"))
        .unwrap_or_else(|_| "unknown".into())
}
