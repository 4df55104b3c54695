#![forbid(unsafe_code)]

//! Startup safety checks for the server binary.

use anyhow::{Result, bail};
use nix::unistd::Uid;

/// Fails fast when the server is started as root. The process shells out to
/// yt-dlp and deletes directory trees; a regular unprivileged user keeps any
/// misbehavior contained to the temp root.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!(
            "{process} must not be run as root; use a regular user or a dedicated service account"
        );
    }
    Ok(())
}
