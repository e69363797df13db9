//! Readiness marker consulted by `entrypoint --ready`.

use std::path::Path;

use tracing::info;

use crate::error::{EntrypointError, EntrypointResult};

/// Create the marker just before the child is launched.
pub fn mark_ready(path: &Path) -> EntrypointResult<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .map_err(|e| EntrypointError::local_io("create directory", dir, e))?;
    }
    std::fs::File::create(path).map_err(|e| EntrypointError::local_io("create", path, e))?;
    info!(path = %path.display(), "ready marker written");
    Ok(())
}

pub fn is_ready(path: &Path) -> bool {
    path.exists()
}
