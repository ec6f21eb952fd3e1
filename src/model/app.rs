use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::model::validation::{ValidationContext, ValidationErrors};

/// Parsed `authgear.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    pub id: String,
    pub http: HttpConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub hook: HookConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpConfig {
    pub public_origin: String,
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookie_domain: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OAuthConfig {
    #[serde(default)]
    pub clients: Vec<OAuthClientConfig>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationType {
    #[default]
    Spa,
    TraditionalWebapp,
    Native,
    Confidential,
    ThirdPartyApp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OAuthClientConfig {
    pub client_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
    #[serde(default)]
    pub x_application_type: ApplicationType,
    #[serde(default = "default_access_token_lifetime")]
    pub access_token_lifetime_seconds: u64,
    #[serde(default = "default_refresh_token_lifetime")]
    pub refresh_token_lifetime_seconds: u64,
}

fn default_access_token_lifetime() -> u64 {
    1800
}

fn default_refresh_token_lifetime() -> u64 {
    86400 * 30
}

impl OAuthClientConfig {
    /// Confidential and third-party clients authenticate with a client secret.
    pub fn is_confidential(&self) -> bool {
        matches!(
            self.x_application_type,
            ApplicationType::Confidential | ApplicationType::ThirdPartyApp
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdentityConfig {
    #[serde(default)]
    pub oauth: IdentityOAuthConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdentityOAuthConfig {
    #[serde(default)]
    pub providers: Vec<OAuthProviderConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OAuthProviderConfig {
    pub alias: String,
    #[serde(rename = "type")]
    pub provider_type: String,
    pub client_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HookConfig {
    #[serde(default)]
    pub blocking_handlers: Vec<BlockingHandler>,
    #[serde(default)]
    pub non_blocking_handlers: Vec<NonBlockingHandler>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BlockingHandler {
    pub event: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NonBlockingHandler {
    pub events: Vec<String>,
    pub url: String,
}

impl AppConfig {
    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        let cfg: AppConfig = serde_yaml::from_slice(bytes).map_err(ParseError::Syntax)?;
        cfg.validate().map_err(ParseError::Invalid)?;
        Ok(cfg)
    }

    pub fn has_hooks(&self) -> bool {
        !self.hook.blocking_handlers.is_empty() || !self.hook.non_blocking_handlers.is_empty()
    }

    /// Host of `http.public_origin`, used to register the app's default domain.
    pub fn public_host(&self) -> Option<String> {
        Url::parse(&self.http.public_origin)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
    }

    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut ctx = ValidationContext::new();

        if self.id.trim().is_empty() {
            ctx.at(&["id"]).emit("app id must not be empty");
        }

        match Url::parse(&self.http.public_origin) {
            Ok(u) if matches!(u.scheme(), "http" | "https") && u.host_str().is_some() => {}
            Ok(_) => ctx
                .at(&["http", "public_origin"])
                .emit("public origin must be an http(s) URL with a host"),
            Err(e) => ctx
                .at(&["http", "public_origin"])
                .emit(format!("invalid URL: {e}")),
        }

        let mut client_ids = HashSet::new();
        for (i, client) in self.oauth.clients.iter().enumerate() {
            let index = i.to_string();
            if !client_ids.insert(client.client_id.as_str()) {
                ctx.at(&["oauth", "clients", index.as_str(), "client_id"])
                    .emit("duplicated OAuth client ID");
            }
            if client.refresh_token_lifetime_seconds < client.access_token_lifetime_seconds {
                ctx.at(&["oauth", "clients", index.as_str(), "refresh_token_lifetime_seconds"])
                    .emit("refresh token lifetime must be greater than or equal to access token lifetime");
            }
        }

        let mut aliases = HashSet::new();
        for (i, provider) in self.identity.oauth.providers.iter().enumerate() {
            if !aliases.insert(provider.alias.as_str()) {
                ctx.at(&["identity", "oauth", "providers", i.to_string().as_str()])
                    .emit("duplicated OAuth provider alias");
            }
        }

        ctx.finish("invalid app config")
    }
}

/// Failure to turn bytes into a typed config document.
#[derive(Debug)]
pub enum ParseError {
    Syntax(serde_yaml::Error),
    Invalid(ValidationErrors),
}
