use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use phoenix_llm::{
    DEFAULT_GEMINI_MODEL, GenerationConfig, LlmProvider, ModelSession, ProviderConfig,
    RIG_GEMINI_PROVIDER_ID,
};
use phoenix_storage::{HistoryStore, SqliteKeyValueStore};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu, ensure};
use tempfile::NamedTempFile;

use crate::error::{ChatResult, MissingCredentialSnafu, ProviderSnafu, StorageSnafu};

pub const SETTINGS_DIRECTORY_NAME: &str = "phoenix";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const HISTORY_FILE_NAME: &str = "history.db";
pub const ENV_PREFIX: &str = "PHOENIX_";
pub const API_KEY_FALLBACK_ENV: &str = "GEMINI_API_KEY";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub model_api_key: String,
    #[serde(default)]
    pub response_delay_ms: u64,
    #[serde(default = "default_provider_id")]
    pub provider_id: String,
    #[serde(default = "default_model_name")]
    pub model_name: String,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub history_path: Option<PathBuf>,
    #[serde(default)]
    pub generation: GenerationConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            model_api_key: String::new(),
            response_delay_ms: 0,
            provider_id: default_provider_id(),
            model_name: default_model_name(),
            endpoint: String::new(),
            history_path: None,
            generation: GenerationConfig::default(),
        }
    }
}

impl Settings {
    /// Defaults, then the JSON file, then `PHOENIX_*` environment variables.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn load_from(path: &Path) -> Self {
        let settings = match Self::figment(path).extract::<Settings>() {
            Ok(settings) => settings,
            Err(error) => {
                tracing::warn!(
                    "failed to parse settings from {:?}: {}. using defaults",
                    path,
                    error
                );
                Settings::default()
            }
        };

        settings.with_env_api_key_fallback().normalized()
    }

    pub fn normalized(mut self) -> Self {
        self.model_api_key = self.model_api_key.trim().to_string();
        self.provider_id = if self.provider_id.trim().is_empty() {
            default_provider_id()
        } else {
            self.provider_id.trim().to_string()
        };
        self.model_name = if self.model_name.trim().is_empty() {
            default_model_name()
        } else {
            self.model_name.trim().to_string()
        };
        self.endpoint = self.endpoint.trim().to_string();
        self
    }

    pub fn has_api_key(&self) -> bool {
        !self.model_api_key.trim().is_empty()
    }

    /// Fails with `MissingCredential` when no key is configured.
    pub fn provider_config(&self) -> ChatResult<ProviderConfig> {
        ensure!(
            self.has_api_key(),
            MissingCredentialSnafu {
                stage: "settings-provider-config",
            }
        );

        Ok(ProviderConfig::new(
            &self.provider_id,
            &self.model_api_key,
            &self.endpoint,
            &self.model_name,
        )
        .with_generation(self.generation))
    }

    pub fn create_provider(&self) -> ChatResult<Arc<dyn LlmProvider>> {
        phoenix_llm::create_provider(self.provider_config()?).context(ProviderSnafu {
            stage: "settings-create-provider",
        })
    }

    /// Model session for the configured provider, model and generation parameters.
    pub fn model_session(&self) -> ChatResult<ModelSession> {
        Ok(ModelSession::new(self.create_provider()?)
            .with_model(&self.model_name)
            .with_generation(self.generation))
    }

    pub async fn open_history_store(&self) -> ChatResult<HistoryStore> {
        let location = self.history_location();
        let backend = SqliteKeyValueStore::open(location.as_path())
            .await
            .context(StorageSnafu {
                stage: "open-history-store",
            })?;
        Ok(HistoryStore::new(Arc::new(backend)))
    }

    pub fn response_delay(&self) -> Duration {
        Duration::from_millis(self.response_delay_ms)
    }

    pub fn history_location(&self) -> PathBuf {
        self.history_path.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
                .unwrap_or_else(|| PathBuf::from(".phoenix"))
                .join(HISTORY_FILE_NAME)
        })
    }

    fn with_env_api_key_fallback(mut self) -> Self {
        if self.model_api_key.trim().is_empty()
            && let Some(api_key) = std::env::var(API_KEY_FALLBACK_ENV)
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        {
            self.model_api_key = api_key;
        }
        self
    }
}

/// Live settings plus the file they are saved to.
pub struct SettingsStore {
    settings: ArcSwap<Settings>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".phoenix"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        Self {
            settings: ArcSwap::from_pointee(Settings::load_from(&config_path)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<Settings> {
        self.settings.load_full()
    }

    /// Saves `settings` to disk, then makes them live. A failed save changes nothing.
    pub fn update(&self, settings: Settings) -> Result<(), SettingsError> {
        let settings = settings.normalized();
        write_settings_atomic(&self.config_path, &settings)?;
        tracing::info!(path = ?self.config_path, "saved settings");
        self.settings.store(Arc::new(settings));
        Ok(())
    }
}

fn write_settings_atomic(path: &Path, settings: &Settings) -> Result<(), SettingsError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent).context(CreateDirSnafu {
        stage: "create-settings-directory",
        path: parent.to_path_buf(),
    })?;

    let mut contents = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
        stage: "serialize-settings-json",
    })?;
    contents.push('\n');

    let mut temp = NamedTempFile::new_in(parent).context(WriteFileSnafu {
        stage: "create-temporary-settings-file",
        path: parent.to_path_buf(),
    })?;

    // The file carries the model API key.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        temp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))
            .context(WriteFileSnafu {
                stage: "restrict-settings-permissions",
                path: temp.path().to_path_buf(),
            })?;
    }

    temp.write_all(contents.as_bytes())
        .and_then(|()| temp.as_file().sync_all())
        .context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp.path().to_path_buf(),
        })?;

    temp.persist(path).context(PersistSnafu {
        stage: "persist-settings-file",
        path: path.to_path_buf(),
    })?;
    Ok(())
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("could not create settings directory {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("could not serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("could not write settings near {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("could not replace settings file {path:?} on `{stage}`: {source}"))]
    Persist {
        stage: &'static str,
        path: PathBuf,
        source: tempfile::PersistError,
    },
}

fn default_provider_id() -> String {
    RIG_GEMINI_PROVIDER_ID.to_string()
}

fn default_model_name() -> String {
    DEFAULT_GEMINI_MODEL.to_string()
}
