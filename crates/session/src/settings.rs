use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use parley_llm::{DEFAULT_OPENAI_MODEL, GenerationConfig, LlmProvider, ProviderConfig};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::attachment::{
    AttachmentLimits, DEFAULT_MAX_ATTACHMENT_BYTES, DEFAULT_MAX_ATTACHMENTS_PER_MESSAGE,
};
use crate::controller::ControllerConfig;
use crate::error::{ProviderConnectSnafu, ProviderUnavailableSnafu, SessionResult};

pub const DEFAULT_PROVIDER_ID: &str = "openai";
pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1";
pub const SETTINGS_DIRECTORY_NAME: &str = "parley";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const DATABASE_FILE_NAME: &str = "conversations.db";
pub const ENV_PREFIX: &str = "PARLEY_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(default = "default_provider_id")]
    pub provider_id: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_model")]
    pub model: String,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            provider_id: default_provider_id(),
            api_key: String::new(),
            endpoint: default_endpoint(),
            model: default_model(),
        }
    }
}

impl ProviderSettings {
    /// `None` until an API key is configured.
    pub fn to_provider_config(&self) -> Option<ProviderConfig> {
        if !self.is_valid() {
            return None;
        }

        Some(ProviderConfig::new(
            &self.provider_id,
            &self.api_key,
            &self.endpoint,
            Some(self.model.clone()),
        ))
    }

    pub fn is_valid(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    fn normalized(mut self) -> Self {
        self.provider_id = non_blank(self.provider_id).unwrap_or_else(default_provider_id);
        self.api_key = self.api_key.trim().to_string();
        self.endpoint = non_blank(self.endpoint).unwrap_or_else(default_endpoint);
        self.model = non_blank(self.model).unwrap_or_else(default_model);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentSettings {
    #[serde(default = "default_max_per_message")]
    pub max_per_message: usize,
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,
}

impl Default for AttachmentSettings {
    fn default() -> Self {
        Self {
            max_per_message: DEFAULT_MAX_ATTACHMENTS_PER_MESSAGE,
            max_bytes: DEFAULT_MAX_ATTACHMENT_BYTES,
        }
    }
}

impl From<AttachmentSettings> for AttachmentLimits {
    fn from(settings: AttachmentSettings) -> Self {
        Self {
            max_per_message: settings.max_per_message,
            max_bytes: settings.max_bytes,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Defaults to `conversations.db` next to the settings file.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParleySettings {
    #[serde(default)]
    pub provider: ProviderSettings,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub attachments: AttachmentSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    /// System prompt sent ahead of every conversation.
    #[serde(default)]
    pub preamble: Option<String>,
}

impl ParleySettings {
    pub fn normalized(mut self) -> Self {
        self.provider = self.provider.normalized();
        self.generation = self.generation.sanitized();
        if self.attachments.max_per_message == 0 {
            self.attachments.max_per_message = DEFAULT_MAX_ATTACHMENTS_PER_MESSAGE;
        }
        if self.attachments.max_bytes == 0 {
            self.attachments.max_bytes = DEFAULT_MAX_ATTACHMENT_BYTES;
        }
        self.storage.database_path = self
            .storage
            .database_path
            .filter(|path| !path.as_os_str().is_empty());
        self.preamble = self.preamble.and_then(non_blank);
        self
    }

    /// Fills provider fields left blank from the conventional `OPENAI_*` variables.
    pub fn with_openai_fallbacks(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if self.provider.api_key.trim().is_empty()
            && let Some(api_key) = lookup("OPENAI_API_KEY").and_then(non_blank)
        {
            self.provider.api_key = api_key;
        }
        if self.provider.endpoint == DEFAULT_ENDPOINT
            && let Some(endpoint) = lookup("OPENAI_BASE_URL").and_then(non_blank)
        {
            self.provider.endpoint = endpoint;
        }
        if self.provider.model == DEFAULT_OPENAI_MODEL
            && let Some(model) = lookup("OPENAI_MODEL").and_then(non_blank)
        {
            self.provider.model = model;
        }
        self
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            model_id: Some(self.provider.model.clone()),
            generation: self.generation,
            preamble: self.preamble.clone(),
            attachment_limits: self.attachments.into(),
        }
    }

    pub fn database_path(&self, config_dir: &Path) -> PathBuf {
        self.storage
            .database_path
            .clone()
            .unwrap_or_else(|| config_dir.join(DATABASE_FILE_NAME))
    }

    /// Builds the configured provider, or `ProviderUnavailable` without credentials.
    pub fn connect_provider(&self) -> SessionResult<Arc<dyn LlmProvider>> {
        let Some(config) = self.provider.to_provider_config() else {
            return ProviderUnavailableSnafu {
                stage: "settings-connect-provider",
                reason: "no API key configured; set provider.api_key or OPENAI_API_KEY"
                    .to_string(),
            }
            .fail();
        };

        parley_llm::create_provider(config).context(ProviderConnectSnafu {
            stage: "settings-connect-provider",
        })
    }
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<ParleySettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".parley"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_disk(&config_path)
            .with_openai_fallbacks(|key| std::env::var(key).ok())
            .normalized();
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

    pub fn config_dir(&self) -> PathBuf {
        self.config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(Self::default_config_dir)
    }

    pub fn settings(&self) -> Arc<ParleySettings> {
        self.settings.load_full()
    }

    /// Writes a default settings file when none exists yet. Values taken from
    /// the environment stay out of it. Returns whether a file was written.
    pub fn ensure_settings_file(&self) -> Result<bool, SettingsError> {
        if self.config_path.exists() {
            return Ok(false);
        }
        self.persist(&ParleySettings::default().normalized())?;
        Ok(true)
    }

    fn load_from_disk(path: &Path) -> ParleySettings {
        let mut figment = Figment::from(Serialized::defaults(ParleySettings::default()));
        if path.exists() {
            figment = figment.merge(Json::file(path));
        } else {
            tracing::info!(path = ?path, "settings file not found, using defaults");
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        match figment.extract::<ParleySettings>() {
            Ok(settings) => settings,
            Err(error) => {
                tracing::warn!(path = ?path, error = %error, "failed to parse settings, using defaults");
                ParleySettings::default()
            }
        }
    }

    fn persist(&self, settings: &ParleySettings) -> Result<(), SettingsError> {
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

fn non_blank(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn default_provider_id() -> String {
    DEFAULT_PROVIDER_ID.to_string()
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_model() -> String {
    DEFAULT_OPENAI_MODEL.to_string()
}

fn default_max_per_message() -> usize {
    DEFAULT_MAX_ATTACHMENTS_PER_MESSAGE
}

fn default_max_bytes() -> u64 {
    DEFAULT_MAX_ATTACHMENT_BYTES
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SessionError;

    #[test]
    fn normalization_restores_blank_fields() {
        let settings = ParleySettings {
            provider: ProviderSettings {
                provider_id: "  ".to_string(),
                api_key: " sk-test ".to_string(),
                endpoint: String::new(),
                model: " ".to_string(),
            },
            attachments: AttachmentSettings {
                max_per_message: 0,
                max_bytes: 0,
            },
            preamble: Some("   ".to_string()),
            ..ParleySettings::default()
        }
        .normalized();

        assert_eq!(settings.provider.provider_id, DEFAULT_PROVIDER_ID);
        assert_eq!(settings.provider.api_key, "sk-test");
        assert_eq!(settings.provider.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(settings.provider.model, DEFAULT_OPENAI_MODEL);
        assert_eq!(settings.attachments, AttachmentSettings::default());
        assert_eq!(settings.preamble, None);
    }

    #[test]
    fn openai_variables_fill_only_blank_fields() {
        let lookup = |key: &str| match key {
            "OPENAI_API_KEY" => Some("sk-env".to_string()),
            "OPENAI_MODEL" => Some("gpt-4.1".to_string()),
            _ => None,
        };

        let settings = ParleySettings::default().with_openai_fallbacks(lookup);
        assert_eq!(settings.provider.api_key, "sk-env");
        assert_eq!(settings.provider.model, "gpt-4.1");
        assert_eq!(settings.provider.endpoint, DEFAULT_ENDPOINT);

        let mut configured = ParleySettings::default();
        configured.provider.api_key = "sk-file".to_string();
        let settings = configured.with_openai_fallbacks(lookup);
        assert_eq!(settings.provider.api_key, "sk-file");
    }

    #[test]
    fn missing_api_key_is_provider_unavailable() {
        let result = ParleySettings::default().connect_provider();
        assert!(matches!(
            result,
            Err(SessionError::ProviderUnavailable { .. })
        ));
    }

    #[test]
    fn settings_file_is_written_once_with_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join(SETTINGS_FILE_NAME);
        let store = SettingsStore::new(path.clone());

        assert!(store.ensure_settings_file().expect("write template"));
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());

        let written: ParleySettings =
            serde_json::from_str(&std::fs::read_to_string(&path).expect("read"))
                .expect("parse");
        assert_eq!(written, ParleySettings::default().normalized());
        assert!(written.provider.api_key.is_empty());

        std::fs::write(&path, r#"{"attachments":{"max_per_message":2}}"#).expect("edit");
        assert!(!store.ensure_settings_file().expect("existing file"));
        let reloaded = SettingsStore::new(path);
        assert_eq!(reloaded.settings().attachments.max_per_message, 2);
    }

    #[test]
    fn database_defaults_next_to_settings() {
        let settings = ParleySettings::default();
        assert_eq!(
            settings.database_path(Path::new("/tmp/parley")),
            PathBuf::from("/tmp/parley").join(DATABASE_FILE_NAME)
        );
    }
}
