use std::fs::{create_dir_all, read, File};
use std::path::{Path, PathBuf};

use crate::defs::{Error, ErrorKind::*, IntoResult, Result};

fn describe(action: &str, path: &Path) -> String {
    if let Some(path) = path.to_str() {
        format!("failed to {} '{}'", action, path)
    } else {
        format!("failed to {}", action)
    }
}

pub fn open_file<P: AsRef<Path>>(path: P) -> Result<File> {
    let path = path.as_ref();
    File::open(path).res(|| describe("open file", path))
}

pub fn create_file<P: AsRef<Path>>(path: P) -> Result<File> {
    let path = path.as_ref();
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        create_dir_all(dir).res(|| describe("create directory", dir))?;
    }
    File::create(path).res(|| describe("create file", path))
}

pub fn read_file<P: AsRef<Path>>(path: P) -> Result<Vec<u8>> {
    let path = path.as_ref();
    read(path).res(|| describe("read file", path))
}

/// Returns the path with its extension replaced and a suffix appended to
/// the file stem, e.g. `mesh.obj` -> `mesh_0.png`.
pub fn sibling_path<P: AsRef<Path>>(path: P, suffix: &str, ext: &str) -> Result<PathBuf> {
    let path = path.as_ref();
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| Error::new(MalformedData, describe("get file stem of", path)))?;
    Ok(path.with_file_name(format!("{}{}.{}", stem, suffix, ext)))
}

pub fn file_name<P: AsRef<Path>>(path: P) -> Result<String> {
    let path = path.as_ref();
    path.file_name()
        .and_then(|s| s.to_str())
        .map(str::to_string)
        .ok_or_else(|| Error::new(MalformedData, describe("get file name of", path)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sibling_path() {
        let path = sibling_path("out/mesh.obj", "_1", "png").unwrap();
        assert_eq!(path, PathBuf::from("out/mesh_1.png"));
        let path = sibling_path("mesh.obj", "", "mtl").unwrap();
        assert_eq!(path, PathBuf::from("mesh.mtl"));
        assert_eq!(file_name("out/mesh.mtl").unwrap(), "mesh.mtl");
    }

    #[test]
    fn test_open_missing_file() {
        let err = open_file("/nonexistent/mesh.obj").unwrap_err();
        assert_eq!(err.kind, IoError);
    }
}
