//! Path resolution and directory listing on a mounted session.

use super::{StorageSession, UsbFileSystem};
use crate::block::BlockStream;
use crate::error::UsbStorageError;
use fatfs::{Dir, DirEntry};
use log::debug;
use serde::Serialize;

/// A child of a listed directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FsEntry {
    pub name: String,
    pub is_directory: bool,
}

/// What a path resolved to.
pub(crate) enum Node<'a> {
    Root(Dir<'a, BlockStream>),
    Entry(DirEntry<'a, BlockStream>),
}

/// Lists the children of the directory at `path`, in on-disk order.
///
/// `""`, `"/"` and `"."` are the root. `.` and `..` entries are left out.
pub fn list(session: &StorageSession, path: &str) -> Result<Vec<FsEntry>, UsbStorageError> {
    let fs = session.fs()?;
    let dir = match resolve(fs, path)? {
        Some(Node::Root(root)) => root,
        Some(Node::Entry(entry)) if entry.is_dir() => entry.to_dir(),
        Some(Node::Entry(_)) => {
            return Err(UsbStorageError::NotADirectory { path: path.to_string() });
        }
        None => return Err(UsbStorageError::NotFound { path: path.to_string() }),
    };

    let mut entries = Vec::new();
    for entry in dir.iter() {
        let entry = entry.map_err(|e| UsbStorageError::io("Couldn't read the directory", e))?;
        let name = entry.file_name();
        if is_dot_entry(&name) {
            continue;
        }
        entries.push(FsEntry {
            name,
            is_directory: entry.is_dir(),
        });
    }
    debug!("Listed {} entries in {:?} on {}", entries.len(), path, session.device_name());
    Ok(entries)
}

/// Resolves a slash-separated path from the root. `Ok(None)` if any component is missing.
pub(crate) fn resolve<'a>(fs: &'a UsbFileSystem, path: &str) -> Result<Option<Node<'a>>, UsbStorageError> {
    let components = path_components(path);
    let Some((last, parents)) = components.split_last() else {
        return Ok(Some(Node::Root(fs.root_dir())));
    };

    let mut dir = fs.root_dir();
    for component in parents {
        match find_child(&dir, component)? {
            Some(entry) if entry.is_dir() => dir = entry.to_dir(),
            // A file in the middle of the path, or nothing at all
            _ => return Ok(None),
        }
    }
    Ok(find_child(&dir, last)?.map(Node::Entry))
}

fn path_components(path: &str) -> Vec<&str> {
    path.split('/').filter(|c| !c.is_empty() && *c != ".").collect()
}

fn find_child<'a>(
    dir: &Dir<'a, BlockStream>,
    name: &str,
) -> Result<Option<DirEntry<'a, BlockStream>>, UsbStorageError> {
    for entry in dir.iter() {
        let entry = entry.map_err(|e| UsbStorageError::io("Couldn't read the directory", e))?;
        let long_name = entry.file_name();
        if is_dot_entry(&long_name) {
            continue;
        }
        if names_equal(&long_name, name) || names_equal(&entry.short_file_name(), name) {
            return Ok(Some(entry));
        }
    }
    Ok(None)
}

fn is_dot_entry(name: &str) -> bool {
    name == "." || name == ".."
}

/// FAT names compare case-insensitively.
fn names_equal(a: &str, b: &str) -> bool {
    a.chars()
        .flat_map(char::to_uppercase)
        .eq(b.chars().flat_map(char::to_uppercase))
}
