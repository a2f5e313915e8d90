//! Container user mapping.
//!
//! Run images bake in a `moatuser` account at UID 5000. When the workspace
//! on a Linux host is owned by that UID the container keeps the image
//! default; any other owner is mapped through so files written into the
//! workspace stay accessible. macOS and Windows hosts always keep the image
//! default since their container runtimes translate file ownership.

use std::path::Path;

/// UID of the `moatuser` account baked into run images.
pub const IMAGE_USER_UID: u32 = 5000;

#[cfg(target_os = "linux")]
pub fn user_for_workspace(workspace: &Path) -> String {
    use std::os::unix::fs::MetadataExt;

    match std::fs::metadata(workspace) {
        Ok(meta) if meta.uid() == IMAGE_USER_UID => String::new(),
        Ok(meta) => format!("{}:{}", meta.uid(), meta.gid()),
        Err(_) => String::new(),
    }
}

#[cfg(not(target_os = "linux"))]
pub fn user_for_workspace(_workspace: &Path) -> String {
    String::new()
}
