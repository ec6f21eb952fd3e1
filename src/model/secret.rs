use std::collections::BTreeMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::app::{AppConfig, ParseError};
use crate::model::validation::{ValidationContext, ValidationErrors};

/// Untyped `authgear.secrets.yaml` as written on disk. Layers are merged at
/// this level, before any item is interpreted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SecretDocument {
    #[serde(default)]
    pub secrets: Vec<RawSecretItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawSecretItem {
    pub key: String,
    pub data: Value,
}

impl SecretDocument {
    pub fn parse(bytes: &[u8]) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_slice(bytes)
    }

    pub fn to_yaml(&self) -> Result<Vec<u8>, serde_yaml::Error> {
        serde_yaml::to_string(self).map(String::into_bytes)
    }

    /// Fold layers left to right; a later item replaces an earlier one with the
    /// same key. The result is sorted by key.
    pub fn overlay(layers: impl IntoIterator<Item = SecretDocument>) -> SecretDocument {
        let mut items: BTreeMap<String, RawSecretItem> = BTreeMap::new();
        for layer in layers {
            for item in layer.secrets {
                items.insert(item.key.clone(), item);
            }
        }
        SecretDocument {
            secrets: items.into_values().collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SecretKey {
    Database,
    AuditDatabase,
    Redis,
    AdminApiAuthKey,
    OAuthKeyMaterials,
    CsrfKeyMaterials,
    WebhookKeyMaterials,
    OAuthSsoProviderCredentials,
    OAuthClientCredentials,
    SmtpServerCredentials,
}

impl SecretKey {
    pub const ALL: [SecretKey; 10] = [
        SecretKey::Database,
        SecretKey::AuditDatabase,
        SecretKey::Redis,
        SecretKey::AdminApiAuthKey,
        SecretKey::OAuthKeyMaterials,
        SecretKey::CsrfKeyMaterials,
        SecretKey::WebhookKeyMaterials,
        SecretKey::OAuthSsoProviderCredentials,
        SecretKey::OAuthClientCredentials,
        SecretKey::SmtpServerCredentials,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SecretKey::Database => "db",
            SecretKey::AuditDatabase => "audit.db",
            SecretKey::Redis => "redis",
            SecretKey::AdminApiAuthKey => "admin-api.auth",
            SecretKey::OAuthKeyMaterials => "oauth",
            SecretKey::CsrfKeyMaterials => "csrf",
            SecretKey::WebhookKeyMaterials => "webhook",
            SecretKey::OAuthSsoProviderCredentials => "sso.oauth.client",
            SecretKey::OAuthClientCredentials => "oauth.client_secrets",
            SecretKey::SmtpServerCredentials => "mail.smtp",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        SecretKey::ALL.into_iter().find(|k| k.as_str() == name)
    }
}

impl fmt::Display for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseCredentials {
    pub database_url: String,
    #[serde(default = "default_schema")]
    pub database_schema: String,
}

fn default_schema() -> String {
    "public".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedisCredentials {
    pub redis_url: String,
}

/// A JWK set. Keys are kept as opaque JSON; only their presence is checked here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeyMaterials {
    pub keys: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OAuthSsoProviderCredentials {
    pub items: Vec<OAuthSsoProviderCredentialsItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OAuthSsoProviderCredentialsItem {
    pub alias: String,
    #[serde(default)]
    pub client_secret: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OAuthClientCredentials {
    pub items: Vec<OAuthClientCredentialsItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OAuthClientCredentialsItem {
    pub client_id: String,
    pub keys: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SmtpServerCredentials {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SecretData {
    Database(DatabaseCredentials),
    Redis(RedisCredentials),
    KeyMaterials(KeyMaterials),
    OAuthSsoProviderCredentials(OAuthSsoProviderCredentials),
    OAuthClientCredentials(OAuthClientCredentials),
    SmtpServer(SmtpServerCredentials),
}

impl SecretData {
    fn parse(key: SecretKey, data: &Value) -> Result<Self, serde_json::Error> {
        fn typed<T: DeserializeOwned>(data: &Value) -> Result<T, serde_json::Error> {
            T::deserialize(data)
        }
        Ok(match key {
            SecretKey::Database | SecretKey::AuditDatabase => SecretData::Database(typed(data)?),
            SecretKey::Redis => SecretData::Redis(typed(data)?),
            SecretKey::AdminApiAuthKey
            | SecretKey::OAuthKeyMaterials
            | SecretKey::CsrfKeyMaterials
            | SecretKey::WebhookKeyMaterials => SecretData::KeyMaterials(typed(data)?),
            SecretKey::OAuthSsoProviderCredentials => {
                SecretData::OAuthSsoProviderCredentials(typed(data)?)
            }
            SecretKey::OAuthClientCredentials => SecretData::OAuthClientCredentials(typed(data)?),
            SecretKey::SmtpServerCredentials => SecretData::SmtpServer(typed(data)?),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SecretItem {
    pub key: SecretKey,
    pub data: SecretData,
}

/// Parsed, typed `authgear.secrets.yaml`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SecretConfig {
    pub secrets: Vec<SecretItem>,
}

impl SecretConfig {
    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        let doc = SecretDocument::parse(bytes).map_err(ParseError::Syntax)?;
        Self::from_document(&doc).map_err(ParseError::Invalid)
    }

    pub fn from_document(doc: &SecretDocument) -> Result<Self, ValidationErrors> {
        let mut ctx = ValidationContext::new();
        let mut secrets = Vec::with_capacity(doc.secrets.len());

        for (i, raw) in doc.secrets.iter().enumerate() {
            let index = i.to_string();
            let Some(key) = SecretKey::from_name(&raw.key) else {
                ctx.at(&["secrets", index.as_str(), "key"])
                    .emit(format!("unknown secret key '{}'", raw.key));
                continue;
            };
            match SecretData::parse(key, &raw.data) {
                Ok(data) => secrets.push(SecretItem { key, data }),
                Err(e) => ctx.at(&["secrets", index.as_str(), "data"]).emit(e.to_string()),
            }
        }

        ctx.finish("invalid secrets")?;
        Ok(SecretConfig { secrets })
    }

    pub fn lookup(&self, key: SecretKey) -> Option<&SecretData> {
        self.secrets.iter().find(|i| i.key == key).map(|i| &i.data)
    }

    pub fn database(&self) -> Option<&DatabaseCredentials> {
        match self.lookup(SecretKey::Database) {
            Some(SecretData::Database(c)) => Some(c),
            _ => None,
        }
    }

    pub fn redis(&self) -> Option<&RedisCredentials> {
        match self.lookup(SecretKey::Redis) {
            Some(SecretData::Redis(c)) => Some(c),
            _ => None,
        }
    }

    fn require(&self, ctx: &mut ValidationContext, key: SecretKey, what: &str) {
        if self.lookup(key).is_none() {
            ctx.emit(format!("{what} (secret '{key}') is required"));
        }
    }

    /// Check that every secret the app config depends on is present.
    pub fn validate(&self, app: &AppConfig) -> Result<(), ValidationErrors> {
        let mut ctx = ValidationContext::new();

        self.require(&mut ctx, SecretKey::Database, "database credentials");
        self.require(&mut ctx, SecretKey::Redis, "redis credentials");
        self.require(&mut ctx, SecretKey::AdminApiAuthKey, "admin API auth key materials");
        self.require(&mut ctx, SecretKey::OAuthKeyMaterials, "OAuth key materials");
        self.require(&mut ctx, SecretKey::CsrfKeyMaterials, "CSRF key materials");

        if app.has_hooks() {
            self.require(&mut ctx, SecretKey::WebhookKeyMaterials, "web-hook signing key materials");
        }

        let providers = &app.identity.oauth.providers;
        if !providers.is_empty() {
            self.require(
                &mut ctx,
                SecretKey::OAuthSsoProviderCredentials,
                "OAuth SSO provider client credentials",
            );
            if let Some(SecretData::OAuthSsoProviderCredentials(creds)) =
                self.lookup(SecretKey::OAuthSsoProviderCredentials)
            {
                for p in providers {
                    if !creds.items.iter().any(|item| item.alias == p.alias) {
                        ctx.emit(format!(
                            "OAuth SSO provider client credentials for '{}' is required",
                            p.alias
                        ));
                    }
                }
            }
        }

        let confidential: Vec<_> = app
            .oauth
            .clients
            .iter()
            .filter(|c| c.is_confidential())
            .collect();
        if !confidential.is_empty() {
            self.require(&mut ctx, SecretKey::OAuthClientCredentials, "OAuth client credentials");
            if let Some(SecretData::OAuthClientCredentials(creds)) =
                self.lookup(SecretKey::OAuthClientCredentials)
            {
                for c in confidential {
                    if !creds.items.iter().any(|item| item.client_id == c.client_id) {
                        ctx.emit(format!(
                            "OAuth client credentials for '{}' is required",
                            c.client_id
                        ));
                    }
                }
            }
        }

        ctx.finish("invalid secrets")
    }
}
