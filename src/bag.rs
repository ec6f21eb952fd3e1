//! The flat representation of an app's resources used by Kubernetes Secrets
//! and the `config_sources.data` column: escaped path to base64 bytes.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

use base64ct::{Base64, Encoding};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::ConfigSourceError;
use crate::pathcodec::{escape_path, unescape_path};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceBag {
    entries: BTreeMap<String, Vec<u8>>,
}

impl ResourceBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a bag from unescaped relative paths.
    pub fn from_files<I, P>(files: I) -> Self
    where
        I: IntoIterator<Item = (P, Vec<u8>)>,
        P: AsRef<str>,
    {
        let mut bag = Self::new();
        for (path, data) in files {
            bag.insert(path.as_ref(), data);
        }
        bag
    }

    pub fn insert(&mut self, path: &str, data: Vec<u8>) {
        self.entries.insert(escape_path(path), data);
    }

    /// Insert under a key that is already escaped, as read from storage.
    pub fn insert_escaped(&mut self, key: String, data: Vec<u8>) {
        self.entries.insert(key, data);
    }

    pub fn remove(&mut self, path: &str) -> Option<Vec<u8>> {
        self.entries.remove(&escape_path(path))
    }

    pub fn get(&self, path: &str) -> Option<&[u8]> {
        self.entries.get(&escape_path(path)).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Escaped keys with their bytes.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Unescape every key back into its relative path.
    pub fn files(&self) -> Result<BTreeMap<String, Vec<u8>>, ConfigSourceError> {
        self.entries
            .iter()
            .map(|(key, data)| Ok((unescape_path(key)?, data.clone())))
            .collect()
    }

    pub fn to_json(&self) -> Result<String, ConfigSourceError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn to_json_pretty(&self) -> Result<String, ConfigSourceError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigSourceError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read every regular file below `dir` into a bag keyed by its
    /// `/`-separated relative path.
    pub fn pack_directory(dir: &Path) -> Result<Self, ConfigSourceError> {
        let mut bag = Self::new();
        let mut stack = vec![dir.to_path_buf()];

        while let Some(current) = stack.pop() {
            for entry in fs::read_dir(&current)? {
                let path = entry?.path();
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }
                let relative = relative_slash_path(dir, &path)?;
                bag.insert(&relative, fs::read(&path)?);
            }
        }

        tracing::debug!(directory = %dir.display(), files = bag.len(), "Packed resource directory");
        Ok(bag)
    }

    /// Write every resource under `dir`, creating parent directories.
    pub fn unpack_into(&self, dir: &Path) -> Result<(), ConfigSourceError> {
        for (path, data) in self.files()? {
            let target = safe_join(dir, &path)?;
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&target, data)?;
        }
        tracing::debug!(directory = %dir.display(), files = self.len(), "Unpacked resource bag");
        Ok(())
    }
}

fn relative_slash_path(root: &Path, path: &Path) -> Result<String, ConfigSourceError> {
    let relative = path.strip_prefix(root).map_err(|_| {
        ConfigSourceError::malformed(path.display().to_string(), "file is outside the packed directory")
    })?;
    let parts: Vec<_> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}

/// Join a relative resource path onto `root`, refusing absolute paths and `..`.
pub(crate) fn safe_join(root: &Path, path: &str) -> Result<PathBuf, ConfigSourceError> {
    let relative = Path::new(path.trim_start_matches('/'));
    let mut joined = root.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => joined.push(part),
            Component::CurDir => {}
            _ => {
                return Err(ConfigSourceError::malformed(
                    path,
                    "resource paths must stay inside the app directory",
                ))
            }
        }
    }
    Ok(joined)
}

impl Serialize for ResourceBag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let encoded: BTreeMap<&str, String> = self
            .entries
            .iter()
            .map(|(k, v)| (k.as_str(), Base64::encode_string(v)))
            .collect();
        encoded.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ResourceBag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = BTreeMap::<String, String>::deserialize(deserializer)?;
        let mut entries = BTreeMap::new();
        for (key, value) in encoded {
            let data = Base64::decode_vec(&value)
                .map_err(|e| D::Error::custom(format!("invalid base64 for `{key}`: {e}")))?;
            entries.insert(key, data);
        }
        Ok(ResourceBag { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_json_shape_uses_escaped_keys_and_base64() {
        let bag = ResourceBag::from_files([
            ("authgear.yaml", b"id: demo\n".to_vec()),
            ("templates/en/translation.json", b"{}".to_vec()),
        ]);
        let value: serde_json::Value = serde_json::from_str(&bag.to_json().unwrap()).unwrap();
        assert_eq!(value["authgear.yaml"], "aWQ6IGRlbW8K");
        assert_eq!(value["templates_2f_en_2f_translation.json"], "e30=");
    }

    #[test]
    fn test_from_json_rejects_bad_base64() {
        let err = ResourceBag::from_json(r#"{"authgear.yaml": "***"}"#).unwrap_err();
        assert!(matches!(err, ConfigSourceError::Json(_)));
    }

    #[test]
    fn test_files_rejects_bad_escape() {
        let mut bag = ResourceBag::new();
        bag.insert_escaped("broken_2f".to_string(), vec![]);
        assert!(matches!(
            bag.files(),
            Err(ConfigSourceError::InvalidEscape { .. })
        ));
    }

    #[test]
    fn test_pack_then_unpack_reproduces_tree() {
        let src = TempDir::new().unwrap();
        fs::create_dir_all(src.path().join("static/en")).unwrap();
        fs::write(src.path().join("authgear.yaml"), "id: demo\n").unwrap();
        fs::write(src.path().join("static/en/app_logo.png"), [0u8, 159, 146, 150]).unwrap();

        let bag = ResourceBag::pack_directory(src.path()).unwrap();
        assert_eq!(bag.len(), 2);
        assert_eq!(bag.get("static/en/app_logo.png"), Some(&[0u8, 159, 146, 150][..]));

        let json = bag.to_json().unwrap();
        let dst = TempDir::new().unwrap();
        ResourceBag::from_json(&json).unwrap().unpack_into(dst.path()).unwrap();

        assert_eq!(
            fs::read(dst.path().join("static/en/app_logo.png")).unwrap(),
            vec![0u8, 159, 146, 150]
        );
        assert_eq!(
            fs::read_to_string(dst.path().join("authgear.yaml")).unwrap(),
            "id: demo\n"
        );
    }

    #[test]
    fn test_unpack_refuses_parent_traversal() {
        let bag = ResourceBag::from_files([("../escape.txt", b"x".to_vec())]);
        let dst = TempDir::new().unwrap();
        assert!(matches!(
            bag.unpack_into(dst.path()),
            Err(ConfigSourceError::MalformedResource { .. })
        ));
    }
}
