use anyhow::{Result, bail};
use nix::unistd::Uid;

/// Fails fast when a binary is started as root. The server and the sweep
/// only ever need access to the upload directory and the database file,
/// both owned by the service account.
pub fn ensure_not_root(process: &str) -> Result<()> {
    if Uid::current().is_root() {
        bail!("{process} must not be run as root; use the vidshelf service account");
    }
    Ok(())
}
