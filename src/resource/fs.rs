use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::bag::{safe_join, ResourceBag};
use crate::errors::ConfigSourceError;
use crate::pathcodec::unescape_path;

/// Where a layer sits in the overlay order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FsLevel {
    Builtin,
    /// Files derived from the app's plan.
    Plan,
    App,
}

/// One filesystem-like layer of resources addressed by `/`-separated
/// relative paths. `a` and `/a` name the same file.
pub trait ResourceFs: Send + Sync + fmt::Debug {
    fn level(&self) -> FsLevel;

    /// `Ok(None)` when this layer does not have the file.
    fn read(&self, path: &str) -> io::Result<Option<Vec<u8>>>;

    /// Every file path in this layer.
    fn list(&self) -> io::Result<Vec<String>>;
}

fn normalize(path: &str) -> &str {
    path.trim_start_matches('/')
}

/// A layer backed by a directory on local disk.
#[derive(Debug, Clone)]
pub struct DiskFs {
    root: PathBuf,
    level: FsLevel,
}

impl DiskFs {
    pub fn new(root: impl Into<PathBuf>, level: FsLevel) -> Self {
        Self {
            root: root.into(),
            level,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> io::Result<PathBuf> {
        safe_join(&self.root, normalize(path))
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))
    }

    pub fn write(&self, path: &str, data: &[u8]) -> io::Result<()> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(target, data)
    }

    /// Removing a file that does not exist is not an error.
    pub fn remove(&self, path: &str) -> io::Result<()> {
        match fs::remove_file(self.resolve(path)?) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

impl ResourceFs for DiskFs {
    fn level(&self) -> FsLevel {
        self.level
    }

    fn read(&self, path: &str) -> io::Result<Option<Vec<u8>>> {
        match fs::read(self.resolve(path)?) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn list(&self) -> io::Result<Vec<String>> {
        let mut out = Vec::new();
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            for entry in fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.is_dir() {
                    stack.push(path);
                } else if let Ok(relative) = path.strip_prefix(&self.root) {
                    let parts: Vec<_> = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .collect();
                    out.push(parts.join("/"));
                }
            }
        }
        out.sort();
        Ok(out)
    }
}

/// An in-memory layer, built from a resource bag or from the per-key data of
/// a Kubernetes object.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct MemoryFs {
    files: BTreeMap<String, Vec<u8>>,
    level: Option<FsLevel>,
}

impl fmt::Debug for MemoryFs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryFs")
            .field("level", &self.level())
            .field("files", &self.files.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl MemoryFs {
    pub fn new(level: FsLevel) -> Self {
        Self {
            files: BTreeMap::new(),
            level: Some(level),
        }
    }

    pub fn insert(&mut self, path: &str, data: Vec<u8>) {
        self.files.insert(normalize(path).to_string(), data);
    }

    /// Populate a layer from escaped keys, unescaping each one.
    pub fn from_escaped<I, K>(entries: I, level: FsLevel) -> Result<Self, ConfigSourceError>
    where
        I: IntoIterator<Item = (K, Vec<u8>)>,
        K: AsRef<str>,
    {
        let mut fs = Self::new(level);
        for (key, data) in entries {
            let path = unescape_path(key.as_ref())?;
            fs.insert(&path, data);
        }
        Ok(fs)
    }

    pub fn from_bag(bag: &ResourceBag, level: FsLevel) -> Result<Self, ConfigSourceError> {
        Self::from_escaped(bag.entries().map(|(k, v)| (k, v.to_vec())), level)
    }

    /// Copy every file of `other` over this layer.
    pub fn extend(&mut self, other: &MemoryFs) {
        for (path, data) in &other.files {
            self.files.insert(path.clone(), data.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl ResourceFs for MemoryFs {
    fn level(&self) -> FsLevel {
        self.level.unwrap_or(FsLevel::App)
    }

    fn read(&self, path: &str) -> io::Result<Option<Vec<u8>>> {
        Ok(self.files.get(normalize(path)).cloned())
    }

    fn list(&self) -> io::Result<Vec<String>> {
        Ok(self.files.keys().cloned().collect())
    }
}
