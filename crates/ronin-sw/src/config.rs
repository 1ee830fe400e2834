//! Offline cache configuration: scope, release manifest and routing rules.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::router::RoutingRules;
use crate::store::GenerationId;
use crate::SwError;

/// Cache version shipped with the current build. Bump it to force a clean
/// cache cycle on every client.
pub const DEFAULT_CACHE_VERSION: &str = "ronins-maths-v4.0";

/// Typeface stylesheet cached on a best-effort basis.
pub const FONT_STYLESHEET_URL: &str = "https://fonts.googleapis.com/css2?family=Space+Grotesk:wght@400;500;600;700&family=JetBrains+Mono:wght@400;500&display=swap";

/// Assets fetched into a new generation at install time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetManifest {
    /// Scope-relative or absolute URLs that must all be cached for the
    /// install to succeed.
    pub mandatory: Vec<String>,

    /// URLs cached if reachable; failures are logged and skipped.
    #[serde(default)]
    pub best_effort: Vec<String>,
}

impl Default for AssetManifest {
    fn default() -> Self {
        Self {
            mandatory: vec!["./index.html".to_string(), "./manifest.json".to_string()],
            best_effort: vec![FONT_STYLESHEET_URL.to_string()],
        }
    }
}

/// A deployable generation: its version label and what to pre-cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    pub version: GenerationId,
    #[serde(default)]
    pub manifest: AssetManifest,
}

impl Release {
    pub fn new(version: impl Into<GenerationId>, manifest: AssetManifest) -> Self {
        Self {
            version: version.into(),
            manifest,
        }
    }
}

impl Default for Release {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_VERSION, AssetManifest::default())
    }
}

/// Configuration of one lifecycle controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwConfig {
    /// Base URL that relative manifest paths resolve against.
    pub scope: Url,

    /// Release installed by [`LifecycleController::install`](crate::LifecycleController::install).
    #[serde(default)]
    pub release: Release,

    /// Request classification rules.
    #[serde(default)]
    pub routing: RoutingRules,

    /// Activate right after install instead of waiting for old clients to
    /// detach.
    #[serde(default)]
    pub skip_waiting_after_install: bool,
}

impl SwConfig {
    /// Configuration with the shipped release and routing rules.
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            release: Release::default(),
            routing: RoutingRules::default(),
            skip_waiting_after_install: false,
        }
    }

    /// Use a different release.
    pub fn with_release(mut self, release: Release) -> Self {
        self.release = release;
        self
    }

    /// Resolve a manifest path against the scope.
    pub fn resolve(&self, path: &str) -> Result<Url, SwError> {
        Ok(self.scope.join(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_manifest() {
        let manifest = AssetManifest::default();
        assert_eq!(manifest.mandatory, vec!["./index.html", "./manifest.json"]);
        assert_eq!(manifest.best_effort, vec![FONT_STYLESHEET_URL]);
    }

    #[test]
    fn test_default_release_version() {
        assert_eq!(Release::default().version.as_str(), "ronins-maths-v4.0");
    }

    #[test]
    fn test_resolve_relative_to_scope() {
        let config = SwConfig::new(Url::parse("https://maths.test/app/").unwrap());
        assert_eq!(
            config.resolve("./index.html").unwrap().as_str(),
            "https://maths.test/app/index.html"
        );
        assert_eq!(config.resolve(FONT_STYLESHEET_URL).unwrap().as_str(), FONT_STYLESHEET_URL);
    }

    #[test]
    fn test_config_from_json_uses_defaults() {
        let config: SwConfig = serde_json::from_str(r#"{ "scope": "https://maths.test/" }"#).unwrap();
        assert_eq!(config, SwConfig::new(Url::parse("https://maths.test/").unwrap()));
    }

    #[test]
    fn test_release_from_json() {
        let release: Release = serde_json::from_str(
            r#"{ "version": "ronins-maths-v4.1", "manifest": { "mandatory": ["./index.html"] } }"#,
        )
        .unwrap();
        assert_eq!(release.version, GenerationId::from("ronins-maths-v4.1"));
        assert!(release.manifest.best_effort.is_empty());
    }
}
