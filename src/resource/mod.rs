//! Layered resource lookup: the built-in base first, the app's own files last.

pub mod fs;
pub mod kinds;

use std::sync::Arc;

use crate::errors::ConfigSourceError;
use crate::settings::Settings;

pub use fs::{DiskFs, FsLevel, MemoryFs, ResourceFs};
pub use kinds::{
    AppConfigKind, FeatureConfigKind, MergedFile, ResourceFile, ResourceKind, SecretConfigKind,
    APP_CONFIG_PATH, FEATURE_CONFIG_PATH, SECRET_CONFIG_PATH,
};

#[derive(Debug, Clone, Default)]
pub struct Manager {
    layers: Vec<Arc<dyn ResourceFs>>,
}

impl Manager {
    pub fn new(layers: Vec<Arc<dyn ResourceFs>>) -> Self {
        Self { layers }
    }

    /// The process-wide base layers, shared by every app.
    pub fn builtin(settings: &Settings) -> Self {
        let mut layers: Vec<Arc<dyn ResourceFs>> = Vec::new();
        if let Some(dir) = &settings.resources.builtin_directory {
            tracing::info!(directory = %dir.display(), "Using built-in resource layer");
            layers.push(Arc::new(DiskFs::new(dir, FsLevel::Builtin)));
        }
        Self { layers }
    }

    /// A new manager with `fs` as the most specific layer. `self` is untouched.
    pub fn overlay(&self, fs: Arc<dyn ResourceFs>) -> Self {
        let mut layers = self.layers.clone();
        layers.push(fs);
        Self { layers }
    }

    pub fn layers(&self) -> &[Arc<dyn ResourceFs>] {
        &self.layers
    }

    /// Collect the kind's file from every layer that has it and merge them.
    pub fn read<K: ResourceKind>(&self, kind: &K) -> Result<MergedFile, ConfigSourceError> {
        let mut files = Vec::new();
        for layer in &self.layers {
            if let Some(file) = kind.locate(layer.as_ref())? {
                files.push(file);
            }
        }
        if files.is_empty() {
            return Err(ConfigSourceError::ResourceNotFound {
                path: kind.path().to_string(),
            });
        }
        kind.merge(files)
    }

    pub fn parse<K: ResourceKind>(
        &self,
        kind: &K,
        merged: &MergedFile,
    ) -> Result<K::Output, ConfigSourceError> {
        kind.parse(merged)
    }

    pub fn load<K: ResourceKind>(&self, kind: &K) -> Result<K::Output, ConfigSourceError> {
        let merged = self.read(kind)?;
        self.parse(kind, &merged)
    }

    /// Raw bytes of an arbitrary resource from the most specific layer that has it.
    pub fn read_file(&self, path: &str) -> Result<Vec<u8>, ConfigSourceError> {
        for layer in self.layers.iter().rev() {
            if let Some(data) = layer.read(path)? {
                return Ok(data);
            }
        }
        Err(ConfigSourceError::ResourceNotFound {
            path: path.to_string(),
        })
    }
}
