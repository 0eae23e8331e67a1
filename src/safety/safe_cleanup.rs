use crate::config::types::Result;
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

fn boundary_error(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::Other,
        format!("Refusing to cross filesystem boundary at {}", path.display()),
    )
}

fn remove_dir_contents(dir: &Path, root_dev: u64) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        // symlink_metadata: a link is removed as a link, never followed
        let meta = match fs::symlink_metadata(&path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };

        if meta.file_type().is_dir() {
            if meta.dev() != root_dev {
                return Err(boundary_error(&path));
            }
            remove_dir_contents(&path, root_dev)?;
            fs::remove_dir(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// Remove a file, symlink or directory tree without following symlinks and
/// without descending into another filesystem. A missing path is not an error.
/// Returns whether anything was removed.
pub fn remove_tree_secure(path: &Path) -> Result<bool> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };

    if meta.file_type().is_dir() {
        remove_dir_contents(path, meta.dev())?;
        fs::remove_dir(path)?;
    } else {
        fs::remove_file(path)?;
    }
    Ok(true)
}
