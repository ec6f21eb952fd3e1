use serde::{Deserialize, Serialize};

use crate::model::app::{AppConfig, ParseError};
use crate::model::validation::{ValidationContext, ValidationErrors};

/// Parsed `authgear.features.yaml`: the limits of the app's plan. An absent
/// limit means unlimited.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FeatureConfig {
    #[serde(default)]
    pub oauth: OAuthFeatureConfig,
    #[serde(default)]
    pub identity: IdentityFeatureConfig,
    #[serde(default)]
    pub hook: HookFeatureConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OAuthFeatureConfig {
    #[serde(default)]
    pub client: LimitFeatureConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimitFeatureConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdentityFeatureConfig {
    #[serde(default)]
    pub oauth: OAuthSsoFeatureConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OAuthSsoFeatureConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum_providers: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HookFeatureConfig {
    #[serde(default)]
    pub blocking_handler: LimitFeatureConfig,
    #[serde(default)]
    pub non_blocking_handler: LimitFeatureConfig,
}

impl FeatureConfig {
    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        serde_yaml::from_slice(bytes).map_err(ParseError::Syntax)
    }

    /// Check the app config against the plan's limits.
    pub fn check(&self, app: &AppConfig) -> Result<(), ValidationErrors> {
        let mut ctx = ValidationContext::new();

        let mut limit = |segments: &[&str], used: usize, maximum: Option<usize>, what: &str| {
            if let Some(maximum) = maximum.filter(|m| used > *m) {
                ctx.at(segments)
                    .emit(format!("{what}: {used} exceeds the plan maximum of {maximum}"));
            }
        };

        limit(
            &["oauth", "clients"],
            app.oauth.clients.len(),
            self.oauth.client.maximum,
            "OAuth clients",
        );
        limit(
            &["identity", "oauth", "providers"],
            app.identity.oauth.providers.len(),
            self.identity.oauth.maximum_providers,
            "OAuth providers",
        );
        limit(
            &["hook", "blocking_handlers"],
            app.hook.blocking_handlers.len(),
            self.hook.blocking_handler.maximum,
            "blocking hook handlers",
        );
        limit(
            &["hook", "non_blocking_handlers"],
            app.hook.non_blocking_handlers.len(),
            self.hook.non_blocking_handler.maximum,
            "non-blocking hook handlers",
        );

        ctx.finish("app config exceeds plan features")
    }
}
