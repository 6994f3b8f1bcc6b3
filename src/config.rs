use std::collections::BTreeMap;
use std::env;
use std::sync::Arc;
use std::time::Duration;

use crate::adapter::{HttpPlatformHandler, PlatformAdapter};
use crate::types::Platform;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Staging,
    Production,
}

/// What to do when the acting user is unknown to the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorFallback {
    /// act as the configured system user
    System,
    Reject,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub adapter_timeout: Duration,
    pub actor_fallback: ActorFallback,
    pub system_user_id: String,
    pub page_size: usize,
    pub max_page_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            adapter_timeout: Duration::from_millis(10_000),
            actor_fallback: ActorFallback::System,
            system_user_id: "system".into(),
            page_size: 20,
            max_page_size: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlatformEndpoint {
    pub base_url: String,
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub environment: Environment,
    pub db_path: String,
    pub engine: EngineConfig,
    pub platforms: BTreeMap<Platform, PlatformEndpoint>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let environment = match lookup("APP_ENV").as_deref() {
            Some("production") | Some("prod") => Environment::Production,
            Some("staging") | Some("stage") => Environment::Staging,
            _ => Environment::Development,
        };

        // defaults per environment, then specific overrides
        match environment {
            Environment::Production => Self::production(),
            Environment::Staging => Self::staging(),
            Environment::Development => Self::development(),
        }
        .with_overrides(&lookup)
    }

    fn with_overrides(mut self, lookup: &impl Fn(&str) -> Option<String>) -> Self {
        if let Some(v) = lookup("WO_DB_PATH") {
            self.db_path = v;
        }
        if let Some(v) = lookup("WO_ADAPTER_TIMEOUT_MS") {
            if let Ok(ms) = v.parse() {
                self.engine.adapter_timeout = Duration::from_millis(ms);
            }
        }
        if let Some(v) = lookup("WO_ACTOR_FALLBACK") {
            match v.to_ascii_lowercase().as_str() {
                "system" => self.engine.actor_fallback = ActorFallback::System,
                "reject" => self.engine.actor_fallback = ActorFallback::Reject,
                other => tracing::warn!(value = other, "ignoring unknown WO_ACTOR_FALLBACK"),
            }
        }
        if let Some(v) = lookup("WO_SYSTEM_USER_ID") {
            self.engine.system_user_id = v;
        }
        if let Some(v) = lookup("WO_PAGE_SIZE") {
            self.engine.page_size = v.parse().unwrap_or(self.engine.page_size);
        }
        if let Some(v) = lookup("WO_MAX_PAGE_SIZE") {
            self.engine.max_page_size = v.parse().unwrap_or(self.engine.max_page_size);
        }

        for platform in Platform::ALL {
            let prefix = format!("WO_{}", platform.as_str().to_ascii_uppercase());
            if let Some(base_url) = lookup(&format!("{prefix}_BASE_URL")) {
                let token = lookup(&format!("{prefix}_TOKEN"));
                self.platforms
                    .insert(platform, PlatformEndpoint { base_url, token });
            }
        }

        self
    }

    /// Adapter with an HTTP handler for every configured platform
    pub fn build_adapter(&self) -> PlatformAdapter {
        let mut adapter = PlatformAdapter::new();
        for (platform, endpoint) in &self.platforms {
            adapter.register_platform(
                *platform,
                Arc::new(HttpPlatformHandler::new(
                    endpoint.base_url.clone(),
                    endpoint.token.clone(),
                )),
            );
        }
        adapter
    }

    fn development() -> Self {
        Self {
            environment: Environment::Development,
            db_path: "./data/work-orders.db".into(),
            engine: EngineConfig::default(),
            platforms: BTreeMap::new(),
        }
    }

    fn staging() -> Self {
        Self {
            environment: Environment::Staging,
            db_path: "/var/lib/ad-work-orders/staging.db".into(),
            engine: EngineConfig::default(),
            platforms: BTreeMap::new(),
        }
    }

    fn production() -> Self {
        Self {
            environment: Environment::Production,
            db_path: "/var/lib/ad-work-orders/work-orders.db".into(),
            engine: EngineConfig {
                page_size: 50,
                ..EngineConfig::default()
            },
            platforms: BTreeMap::new(),
        }
    }
}
