use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use echo_chat::{PairBudget, UnknownRolePolicy};
use echo_llm::{
    DEFAULT_OPENROUTER_MODEL, DEFAULT_TEMPERATURE, OPENROUTER_ENDPOINT, ProviderConfig,
};
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub const DEFAULT_PROVIDER_ID: &str = "openrouter";
pub const SETTINGS_DIRECTORY_NAME: &str = "echo";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const DATABASE_FILE_NAME: &str = "chat_history.db";
pub const ENV_PREFIX: &str = "ECHO_";
pub const API_KEY_ENV: &str = "OPENROUTER_API_KEY";
pub const DATABASE_PATH_ENV: &str = "DB_PATH";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EchoSettings {
    pub provider_id: String,
    pub api_key: String,
    pub endpoint: String,
    pub default_model: String,
    pub default_temperature: f64,
    pub history_pairs: usize,
    pub database_path: String,
    pub streaming: bool,
    pub turn_timeout_secs: u64,
    pub unknown_roles: UnknownRolePolicy,
}

impl Default for EchoSettings {
    fn default() -> Self {
        Self {
            provider_id: DEFAULT_PROVIDER_ID.to_string(),
            api_key: String::new(),
            endpoint: OPENROUTER_ENDPOINT.to_string(),
            default_model: DEFAULT_OPENROUTER_MODEL.to_string(),
            default_temperature: DEFAULT_TEMPERATURE,
            history_pairs: PairBudget::DEFAULT.get(),
            database_path: default_database_path().display().to_string(),
            streaming: true,
            turn_timeout_secs: 120,
            unknown_roles: UnknownRolePolicy::default(),
        }
    }
}

impl EchoSettings {
    /// Returns `None` while no API key is configured.
    pub fn to_provider_config(&self) -> Option<ProviderConfig> {
        if self.api_key.trim().is_empty() {
            return None;
        }

        Some(
            ProviderConfig::new(&self.provider_id, &self.api_key, &self.endpoint)
                .with_default_model(&self.default_model)
                .with_default_temperature(self.default_temperature),
        )
    }

    pub fn history_budget(&self) -> PairBudget {
        PairBudget::clamped(self.history_pairs)
    }

    pub fn normalized(mut self) -> Self {
        let defaults = Self::default();
        self.provider_id = self.provider_id.trim().to_ascii_lowercase();
        if self.provider_id.is_empty() {
            self.provider_id = defaults.provider_id;
        }
        self.api_key = self.api_key.trim().to_string();
        self.endpoint = self.endpoint.trim().trim_end_matches('/').to_string();
        self.default_model = self.default_model.trim().to_string();
        if self.default_model.is_empty() {
            self.default_model = defaults.default_model;
        }
        if !self.default_temperature.is_finite() {
            self.default_temperature = defaults.default_temperature;
        }
        self.default_temperature = self.default_temperature.clamp(0.0, 2.0);
        self.history_pairs = self.history_budget().get();
        self.database_path = self.database_path.trim().to_string();
        if self.database_path.is_empty() {
            self.database_path = defaults.database_path;
        }
        self.turn_timeout_secs = self.turn_timeout_secs.max(1);
        self
    }

    /// Fills gaps from the conventional variables: `OPENROUTER_API_KEY` when no key is
    /// set, and `DB_PATH` overriding the database location.
    pub fn with_env_fallbacks(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if self.api_key.trim().is_empty()
            && let Some(api_key) = lookup(API_KEY_ENV).filter(|value| !value.trim().is_empty())
        {
            self.api_key = api_key;
        }
        if let Some(path) = lookup(DATABASE_PATH_ENV).filter(|value| !value.trim().is_empty()) {
            self.database_path = path;
        }
        self
    }
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<EchoSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".echo"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    /// Defaults, then the JSON file, then `ECHO_*` variables, then conventional fallbacks.
    pub fn load() -> Self {
        Self::open(Self::default_config_path(), ENV_PREFIX, |name| {
            std::env::var(name).ok()
        })
    }

    pub fn open(
        config_path: PathBuf,
        env_prefix: &str,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Self {
        let settings = Self::load_layers(&config_path, env_prefix)
            .with_env_fallbacks(lookup)
            .normalized();
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<EchoSettings> {
        self.settings.load_full()
    }

    /// Applies `edit` to the file layer and writes it back, then to the live value.
    ///
    /// Values that only came from the environment are never written to disk.
    pub fn update(&self, edit: impl Fn(&mut EchoSettings)) -> Result<(), SettingsError> {
        let mut on_disk =
            Self::extract_or_default(Self::file_layer(&self.config_path), &self.config_path);
        edit(&mut on_disk);
        self.persist(&on_disk.normalized())?;

        let mut live = EchoSettings::clone(&self.settings.load());
        edit(&mut live);
        self.settings.store(Arc::new(live.normalized()));
        Ok(())
    }

    fn file_layer(path: &Path) -> Figment {
        let figment = Figment::from(Serialized::defaults(EchoSettings::default()));
        if path.exists() {
            figment.merge(Json::file(path))
        } else {
            tracing::info!(path = ?path, "settings file not found, using defaults");
            figment
        }
    }

    fn load_layers(path: &Path, env_prefix: &str) -> EchoSettings {
        let figment = Self::file_layer(path).merge(Env::prefixed(env_prefix));
        Self::extract_or_default(figment, path)
    }

    fn extract_or_default(figment: Figment, path: &Path) -> EchoSettings {
        match figment.extract::<EchoSettings>() {
            Ok(settings) => settings,
            Err(error) => {
                tracing::warn!(
                    path = ?path,
                    error = %error,
                    "failed to parse settings, using defaults"
                );
                EchoSettings::default()
            }
        }
    }

    fn persist(&self, settings: &EchoSettings) -> Result<(), SettingsError> {
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

        tracing::info!(path = ?self.config_path, "saved settings");
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

fn default_database_path() -> PathBuf {
    dirs::config_dir()
        .map(|path| path.join(SETTINGS_DIRECTORY_NAME).join(DATABASE_FILE_NAME))
        .unwrap_or_else(|| PathBuf::from(DATABASE_FILE_NAME))
}
