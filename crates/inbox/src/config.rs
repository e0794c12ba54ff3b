use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::chat::AllowedScope;
use crate::wallet::ProviderConfig;

pub const SETTINGS_DIRECTORY_NAME: &str = "floating-inbox";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const ENV_PREFIX: &str = "FLOATING_INBOX_";
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Messaging network a client connects to. Part of the key bundle namespace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkEnv {
    Dev,
    #[default]
    Production,
    Local,
}

impl NetworkEnv {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Dev => "dev",
            Self::Production => "production",
            Self::Local => "local",
        }
    }
}

impl fmt::Display for NetworkEnv {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InboxSettings {
    pub env: NetworkEnv,
    /// SQLite key-value database; `None` keeps local storage in memory.
    pub database_path: Option<PathBuf>,
    /// Explicit RPC endpoint for name resolution.
    pub name_resolver_url: Option<String>,
    pub infura_key: Option<String>,
    pub ens_network: String,
    /// Raw signer secret. Only ever read from the environment or an existing
    /// file; never written back.
    #[serde(skip_serializing)]
    pub private_key: Option<String>,
    pub allowed_scope: AllowedScope,
    pub log_filter: String,
}

impl Default for InboxSettings {
    fn default() -> Self {
        Self {
            env: NetworkEnv::default(),
            database_path: None,
            name_resolver_url: None,
            infura_key: None,
            ens_network: "mainnet".to_string(),
            private_key: None,
            allowed_scope: AllowedScope::default(),
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl InboxSettings {
    pub fn normalized(mut self) -> Self {
        self.name_resolver_url = non_blank(self.name_resolver_url);
        self.infura_key = non_blank(self.infura_key);
        self.private_key = non_blank(self.private_key);
        self.ens_network = match self.ens_network.trim() {
            "" => "mainnet".to_string(),
            network => network.to_string(),
        };
        if self.log_filter.trim().is_empty() {
            self.log_filter = DEFAULT_LOG_FILTER.to_string();
        }
        self
    }

    pub fn provider_config(&self) -> ProviderConfig {
        ProviderConfig {
            network: self.ens_network.clone(),
            infura_key: self.infura_key.clone(),
            rpc_url: self.name_resolver_url.clone(),
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Layered settings: defaults, then the JSON file, then `FLOATING_INBOX_*` variables.
pub struct SettingsStore {
    settings: Arc<ArcSwap<InboxSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".floating-inbox"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_layers(&config_path);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<InboxSettings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: InboxSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    fn load_layers(path: &Path) -> InboxSettings {
        let mut figment = Figment::from(Serialized::defaults(InboxSettings::default()));
        if path.exists() {
            figment = figment.merge(Json::file(path));
        } else {
            tracing::info!("settings file not found at {:?}, using defaults", path);
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX));

        match figment.extract::<InboxSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    "failed to parse settings from {:?}: {}. using defaults",
                    path,
                    error
                );
                InboxSettings::default()
            }
        }
    }

    fn persist(&self, settings: &InboxSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!("saved settings to {:?}", self.config_path);
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}
