use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use deskmate_llm::{DEFAULT_ENDPOINT, DEFAULT_OPENAI_MODEL, ProviderConfig};
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::calendar::{Contact, DEFAULT_CALENDAR_MAX_TOKENS, default_contacts};
use crate::router::{DEFAULT_CLASSIFY_TIMEOUT, RoutingStrategy, Tool, ToolRouter};
use crate::script::{
    DEFAULT_MAX_OUTPUT_BYTES, DEFAULT_SCRIPT_TIMEOUT, Interpreter, ScriptRunner, duration_millis,
};

pub const DEFAULT_PROVIDER_ID: &str = "openai";
pub const SETTINGS_DIRECTORY_NAME: &str = "deskmate";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const ENV_PREFIX: &str = "DESKMATE_";
pub const DEFAULT_SYSTEM_MESSAGE: &str = "You are a helpful assistant. When it makes sense, use markdown syntax to output code, links, tables, etc. If outputting code, include the programming language.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(default = "default_provider_id")]
    pub provider_id: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Model used for streamed chat turns.
    #[serde(default = "default_model")]
    pub chat_model: String,
    /// Model used for routing, calendar scripts and titles.
    #[serde(default = "default_model")]
    pub completion_model: String,
    #[serde(default = "default_system_message")]
    pub system_message: String,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            provider_id: default_provider_id(),
            api_key: String::new(),
            endpoint: default_endpoint(),
            chat_model: default_model(),
            completion_model: default_model(),
            system_message: default_system_message(),
        }
    }
}

impl ProviderSettings {
    pub fn to_provider_config(&self) -> Option<ProviderConfig> {
        if self.api_key.trim().is_empty() {
            return None;
        }

        Some(ProviderConfig::new(
            &self.provider_id,
            &self.api_key,
            &self.endpoint,
            Some(self.chat_model.clone()),
        ))
    }

    fn normalized(mut self) -> Self {
        self.provider_id = non_blank_or(self.provider_id, default_provider_id);
        self.api_key = self.api_key.trim().to_string();
        self.endpoint = non_blank_or(self.endpoint, default_endpoint);
        self.chat_model = non_blank_or(self.chat_model, default_model);
        self.completion_model = non_blank_or(self.completion_model, default_model);
        self.system_message = self.system_message.trim().to_string();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterSettings {
    #[serde(default = "default_strategy")]
    pub strategy: RoutingStrategy,
    #[serde(default = "default_fixed_tool")]
    pub fixed_tool: Tool,
    #[serde(default = "default_classify_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            fixed_tool: default_fixed_tool(),
            timeout_ms: default_classify_timeout_ms(),
        }
    }
}

impl RouterSettings {
    pub fn tool_router(&self) -> ToolRouter {
        match self.strategy {
            RoutingStrategy::Fixed => ToolRouter::fixed(self.fixed_tool),
            RoutingStrategy::Model => {
                ToolRouter::model_backed(Duration::from_millis(self.timeout_ms.max(1)))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarSettings {
    #[serde(default = "default_contacts")]
    pub contacts: Vec<Contact>,
    #[serde(default = "default_calendar_max_tokens")]
    pub max_tokens: u64,
}

impl Default for CalendarSettings {
    fn default() -> Self {
        Self {
            contacts: default_contacts(),
            max_tokens: default_calendar_max_tokens(),
        }
    }
}

impl CalendarSettings {
    fn normalized(mut self) -> Self {
        // Drop half-filled directory rows rather than teaching the model a blank address.
        self.contacts = self
            .contacts
            .into_iter()
            .map(|contact| Contact::new(contact.name.trim(), contact.email.trim()))
            .filter(|contact| !contact.name.is_empty() && !contact.email.is_empty())
            .collect();
        if self.max_tokens == 0 {
            self.max_tokens = default_calendar_max_tokens();
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptSettings {
    #[serde(default = "default_interpreter")]
    pub interpreter: Interpreter,
    #[serde(default = "default_script_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

impl Default for ScriptSettings {
    fn default() -> Self {
        Self {
            interpreter: default_interpreter(),
            timeout_ms: default_script_timeout_ms(),
            max_output_bytes: default_max_output_bytes(),
        }
    }
}

impl ScriptSettings {
    pub fn script_runner(&self) -> ScriptRunner {
        ScriptRunner::new(self.interpreter)
            .with_timeout(Duration::from_millis(self.timeout_ms.max(1)))
            .with_max_output_bytes(self.max_output_bytes.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub provider: ProviderSettings,
    #[serde(default)]
    pub router: RouterSettings,
    #[serde(default)]
    pub calendar: CalendarSettings,
    #[serde(default)]
    pub script: ScriptSettings,
}

impl Settings {
    pub fn normalized(self) -> Self {
        Self {
            provider: self.provider.normalized(),
            router: self.router,
            calendar: self.calendar.normalized(),
            script: self.script,
        }
    }
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<Settings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".deskmate"))
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

    pub fn settings(&self) -> Arc<Settings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: Settings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    /// Persists a new chat model and returns the updated snapshot.
    pub fn set_chat_model(&self, model: &str) -> Result<Arc<Settings>, SettingsError> {
        let mut settings = Settings::clone(&self.settings());
        settings.provider.chat_model = model.to_string();
        self.update(settings)?;
        Ok(self.settings())
    }

    /// Defaults, then the JSON file, then `OPENAI_API_KEY`, then `DESKMATE_*` variables.
    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Json::file(path))
            .merge(
                Env::raw()
                    .only(&["OPENAI_API_KEY"])
                    .map(|_| "provider.api_key".into()),
            )
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    fn load_layers(path: &Path) -> Settings {
        if !path.exists() {
            tracing::info!(path = ?path, "settings file not found, using defaults and environment");
        }

        match Self::figment(path).extract::<Settings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    path = ?path,
                    error = %error,
                    "failed to parse settings; using defaults"
                );
                Settings::default()
            }
        }
    }

    fn persist(&self, settings: &Settings) -> Result<(), SettingsError> {
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

fn non_blank_or(value: String, fallback: fn() -> String) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback()
    } else {
        trimmed.to_string()
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

fn default_system_message() -> String {
    DEFAULT_SYSTEM_MESSAGE.to_string()
}

fn default_strategy() -> RoutingStrategy {
    RoutingStrategy::Model
}

fn default_fixed_tool() -> Tool {
    Tool::Chat
}

fn default_classify_timeout_ms() -> u64 {
    duration_millis(DEFAULT_CLASSIFY_TIMEOUT)
}

fn default_calendar_max_tokens() -> u64 {
    DEFAULT_CALENDAR_MAX_TOKENS
}

fn default_interpreter() -> Interpreter {
    Interpreter::OsScripting
}

fn default_script_timeout_ms() -> u64 {
    duration_millis(DEFAULT_SCRIPT_TIMEOUT)
}

fn default_max_output_bytes() -> usize {
    DEFAULT_MAX_OUTPUT_BYTES
}
