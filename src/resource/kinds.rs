//! The typed resources of an app, with their merge policies.

use std::io;

use crate::errors::ConfigSourceError;
use crate::model::app::{AppConfig, ParseError};
use crate::model::feature::FeatureConfig;
use crate::model::secret::{SecretConfig, SecretDocument};
use crate::resource::fs::{FsLevel, ResourceFs};

pub const APP_CONFIG_PATH: &str = "authgear.yaml";
pub const SECRET_CONFIG_PATH: &str = "authgear.secrets.yaml";
pub const FEATURE_CONFIG_PATH: &str = "authgear.features.yaml";

/// The bytes one layer contributed for a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceFile {
    pub level: FsLevel,
    pub path: String,
    pub data: Vec<u8>,
}

/// The result of merging every contributing layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedFile {
    pub path: String,
    pub data: Vec<u8>,
    /// How many layers contributed.
    pub layers: usize,
}

pub trait ResourceKind {
    type Output;

    fn path(&self) -> &'static str;

    /// The file this kind reads from one layer, if the layer has it.
    fn locate(&self, fs: &dyn ResourceFs) -> io::Result<Option<ResourceFile>> {
        Ok(fs.read(self.path())?.map(|data| ResourceFile {
            level: fs.level(),
            path: self.path().to_string(),
            data,
        }))
    }

    /// Combine the located files, ordered from most general to most specific.
    /// `files` is never empty.
    fn merge(&self, files: Vec<ResourceFile>) -> Result<MergedFile, ConfigSourceError>;

    fn parse(&self, merged: &MergedFile) -> Result<Self::Output, ConfigSourceError>;
}

fn last_layer(files: Vec<ResourceFile>, path: &str) -> Result<MergedFile, ConfigSourceError> {
    let layers = files.len();
    let last = files
        .into_iter()
        .last()
        .ok_or_else(|| ConfigSourceError::ResourceNotFound {
            path: path.to_string(),
        })?;
    Ok(MergedFile {
        path: last.path,
        data: last.data,
        layers,
    })
}

pub(crate) fn parse_failure(path: &str, err: ParseError) -> ConfigSourceError {
    match err {
        ParseError::Syntax(e) => ConfigSourceError::malformed(path, e),
        ParseError::Invalid(errs) => ConfigSourceError::Validation(errs),
    }
}

/// `authgear.yaml`: the most specific layer replaces the whole file.
#[derive(Debug, Clone, Copy, Default)]
pub struct AppConfigKind;

impl ResourceKind for AppConfigKind {
    type Output = AppConfig;

    fn path(&self) -> &'static str {
        APP_CONFIG_PATH
    }

    fn merge(&self, files: Vec<ResourceFile>) -> Result<MergedFile, ConfigSourceError> {
        last_layer(files, APP_CONFIG_PATH)
    }

    fn parse(&self, merged: &MergedFile) -> Result<AppConfig, ConfigSourceError> {
        AppConfig::parse(&merged.data).map_err(|e| parse_failure(&merged.path, e))
    }
}

/// `authgear.secrets.yaml`: items are overlaid by key across layers.
#[derive(Debug, Clone, Copy, Default)]
pub struct SecretConfigKind;

impl ResourceKind for SecretConfigKind {
    type Output = SecretConfig;

    fn path(&self) -> &'static str {
        SECRET_CONFIG_PATH
    }

    fn merge(&self, files: Vec<ResourceFile>) -> Result<MergedFile, ConfigSourceError> {
        let layers = files.len();
        let mut documents = Vec::with_capacity(layers);
        for file in &files {
            let doc = SecretDocument::parse(&file.data).map_err(|e| {
                ConfigSourceError::malformed(format!("{} ({:?} layer)", file.path, file.level), e)
            })?;
            documents.push(doc);
        }
        let data = SecretDocument::overlay(documents)
            .to_yaml()
            .map_err(|e| ConfigSourceError::malformed(SECRET_CONFIG_PATH, e))?;
        Ok(MergedFile {
            path: SECRET_CONFIG_PATH.to_string(),
            data,
            layers,
        })
    }

    fn parse(&self, merged: &MergedFile) -> Result<SecretConfig, ConfigSourceError> {
        SecretConfig::parse(&merged.data).map_err(|e| parse_failure(&merged.path, e))
    }
}

/// `authgear.features.yaml`: written by the plan layer, optionally replaced
/// whole by a more specific layer. Built-in copies are ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureConfigKind;

impl ResourceKind for FeatureConfigKind {
    type Output = FeatureConfig;

    fn path(&self) -> &'static str {
        FEATURE_CONFIG_PATH
    }

    fn locate(&self, fs: &dyn ResourceFs) -> io::Result<Option<ResourceFile>> {
        if fs.level() == FsLevel::Builtin {
            return Ok(None);
        }
        Ok(fs.read(FEATURE_CONFIG_PATH)?.map(|data| ResourceFile {
            level: fs.level(),
            path: FEATURE_CONFIG_PATH.to_string(),
            data,
        }))
    }

    fn merge(&self, files: Vec<ResourceFile>) -> Result<MergedFile, ConfigSourceError> {
        last_layer(files, FEATURE_CONFIG_PATH)
    }

    fn parse(&self, merged: &MergedFile) -> Result<FeatureConfig, ConfigSourceError> {
        FeatureConfig::parse(&merged.data).map_err(|e| parse_failure(&merged.path, e))
    }
}
