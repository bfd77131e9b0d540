//! Blob-store collaborator.
//!
//! The pipeline only needs two things from wherever submission files live:
//! list the objects under a prefix and stream one of them. `LocalObjectStore`
//! serves a directory tree; remote stores implement the same trait.

use std::fmt::Debug;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::error::Result;

/// One listed object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
    /// `/`-separated key relative to the store root
    pub key: String,
    pub size: u64,
}

impl ObjectInfo {
    /// Last key segment
    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }
}

pub trait ObjectStore: Debug + Send + Sync {
    /// Objects whose key starts with `prefix`, sorted by key
    fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectInfo>>;

    /// Open an object for streaming; nothing is buffered up front
    fn download_as_stream(&self, key: &str) -> Result<Box<dyn Read + Send>>;
}

/// Object store backed by a local directory
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalObjectStore { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(parts.join("/"))
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let escapes = relative.components().any(|c| {
            !matches!(c, std::path::Component::Normal(_))
        });
        if key.is_empty() || escapes {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid object key '{}'", key),
            )
            .into());
        }
        Ok(self.root.join(relative))
    }
}

impl ObjectStore for LocalObjectStore {
    fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let mut objects = Vec::new();

        for entry in WalkDir::new(&self.root).follow_links(false) {
            let entry = entry.map_err(io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(key) = self.key_for(entry.path()) else {
                continue;
            };
            if !key.starts_with(prefix) {
                continue;
            }
            let size = entry.metadata().map_err(io::Error::from)?.len();
            objects.push(ObjectInfo { key, size });
        }

        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    fn download_as_stream(&self, key: &str) -> Result<Box<dyn Read + Send>> {
        let file = File::open(self.path_for(key)?)?;
        Ok(Box::new(file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn store_with_files(files: &[(&str, &str)]) -> (tempfile::TempDir, LocalObjectStore) {
        let dir = tempfile::tempdir().unwrap();
        for (key, content) in files {
            let path = dir.path().join(key);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
        let store = LocalObjectStore::new(dir.path());
        (dir, store)
    }

    #[test]
    fn test_list_objects_by_prefix() {
        let (_dir, store) = store_with_files(&[
            ("2024/SOGGETTI_2024.txt", "a"),
            ("2024/COLLEGAMENTI_2024.txt", "bb"),
            ("2023/SOGGETTI_2023.txt", "c"),
        ]);

        let all = store.list_objects("").unwrap();
        assert_eq!(all.len(), 3);

        let year = store.list_objects("2024/").unwrap();
        let keys: Vec<&str> = year.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["2024/COLLEGAMENTI_2024.txt", "2024/SOGGETTI_2024.txt"]);
        assert_eq!(year[0].size, 2);
        assert_eq!(year[0].file_name(), "COLLEGAMENTI_2024.txt");
    }

    #[test]
    fn test_download_as_stream() {
        let (_dir, store) = store_with_files(&[("in/RAPPORTI.txt", "IT01|REL1\n")]);

        let mut content = String::new();
        store
            .download_as_stream("in/RAPPORTI.txt")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "IT01|REL1\n");
    }

    #[test]
    fn test_keys_cannot_escape_root() {
        let (_dir, store) = store_with_files(&[("a.txt", "x")]);
        assert!(store.download_as_stream("../a.txt").is_err());
        assert!(store.download_as_stream("/etc/passwd").is_err());
        assert!(store.download_as_stream("missing.txt").is_err());
    }
}
