//! Embedded AWS credential helper binaries.
//!
//! The helper is a small native binary the AWS CLI invokes through
//! `credential_process`; inside the container it talks to the credential
//! proxy named by `AGENTOPS_CREDENTIAL_URL` (authenticated with
//! `AGENTOPS_CREDENTIAL_TOKEN` when set). One blob per supported
//! architecture is embedded at build time and selected for the host arch.

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};

static HELPER_X86_64: &[u8] =
    include_bytes!("../../assets/helpers/moat-credential-helper-x86_64");
static HELPER_AARCH64: &[u8] =
    include_bytes!("../../assets/helpers/moat-credential-helper-aarch64");

const HELPER_NAME: &str = "moat-credential-helper";

/// The helper blob matching the host architecture.
pub fn helper_binary() -> Result<&'static [u8]> {
    match std::env::consts::ARCH {
        "x86_64" => Ok(HELPER_X86_64),
        "aarch64" => Ok(HELPER_AARCH64),
        other => bail!("no credential helper is built for architecture {}", other),
    }
}

/// Write the helper into `dir` with execute permissions; returns its path.
pub fn install_helper(dir: &Path) -> Result<PathBuf> {
    let blob = helper_binary()?;
    std::fs::create_dir_all(dir)?;

    let path = dir.join(HELPER_NAME);
    std::fs::write(&path, blob)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
    }

    Ok(path)
}
