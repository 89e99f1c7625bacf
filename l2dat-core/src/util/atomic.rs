use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;

use crate::error::Result;

/// Replace `path` with `bytes` via a temp file in the same directory and a
/// rename. On any failure the previous file is left untouched and the temp
/// file is removed when dropped.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
