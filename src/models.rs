//! Data models and structures
//!
//! Defines the wire payloads exchanged with the agent API, the request and
//! result types passed between the sequencer and the transport, and the
//! on-disk configuration.

use crate::scene::Scene;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upload category the API uses to route a file.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Document,
    Custom,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransferMethod {
    LocalFile,
}

/// Reference to a file already uploaded to the agent API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileDescriptor {
    #[serde(rename = "type")]
    pub kind: FileKind,
    pub transfer_method: TransferMethod,
    pub upload_file_id: String,
}

/// A tool the agent can be asked to invoke directly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSpec {
    pub label: String,
    #[serde(default)]
    pub default_params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolInvocation {
    pub name: String,
    pub parameters: Value,
}

/// One user turn waiting to be dispatched.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRequest {
    pub seq: u64,
    pub text: String,
    pub tool_name: Option<String>,
    pub tool_params: Option<Value>,
    pub files: Vec<FileDescriptor>,
}

impl PendingRequest {
    pub fn new(seq: u64, text: impl Into<String>) -> Self {
        Self {
            seq,
            text: text.into(),
            tool_name: None,
            tool_params: None,
            files: Vec::new(),
        }
    }
}

// Agent API Request/Response models
#[derive(Debug, Serialize)]
pub struct ChatMessageRequest {
    pub query: String,
    pub user: String,
    pub response_mode: String,
    pub inputs: Map<String, Value>,
    pub auto_generate_name: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileDescriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_only: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolInvocation>>,
}

#[derive(Debug, Deserialize)]
pub struct UploadResponse {
    pub id: String,
}

/// Error payload returned by the API alongside non-2xx statuses.
#[derive(Debug, Deserialize)]
pub struct ApiErrorBody {
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultKind {
    Reply,
    Error,
}

/// Terminal aggregate of one streamed chat call.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamResult {
    pub kind: ResultKind,
    pub conversation_id: Option<String>,
    pub task_id: Option<String>,
    pub audio_path: Option<PathBuf>,
    pub image_path: Option<PathBuf>,
    /// Text to display: the reply itself, a media path marker, or an error message.
    pub content: String,
    /// Everything the server streamed, untouched by media handling.
    pub raw_text: String,
    pub audio_detected: bool,
    pub image_detected: bool,
    /// True only when the server sent its end-of-message event.
    pub completed: bool,
}

impl StreamResult {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: ResultKind::Error,
            conversation_id: None,
            task_id: None,
            audio_path: None,
            image_path: None,
            content: message.into(),
            raw_text: String::new(),
            audio_detected: false,
            image_detected: false,
            completed: false,
        }
    }

    pub fn is_error(&self) -> bool {
        self.kind == ResultKind::Error
    }
}

fn default_base_url() -> String {
    "https://api.dify.ai/v1".to_string()
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("downloads")
}

fn default_request_timeout() -> u64 {
    120
}

fn default_transfer_timeout() -> u64 {
    30
}

fn default_switch_marker() -> String {
    "*切换地点*".to_string()
}

// Configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    pub api_keys: BTreeMap<String, String>,
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_transfer_timeout")]
    pub upload_timeout_secs: u64,
    #[serde(default = "default_transfer_timeout")]
    pub download_timeout_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub turn_timeout_secs: u64,
    #[serde(default = "default_switch_marker")]
    pub switch_marker: String,
    #[serde(default)]
    pub default_scene: Option<String>,
    #[serde(default)]
    pub scenes: Vec<Scene>,
    #[serde(default)]
    pub tools: BTreeMap<String, ToolSpec>,
}

impl Config {
    /// Load `config.json` (or the given path) and apply environment overrides.
    ///
    /// A missing file is reported as a configuration error; the binary treats
    /// that as fatal.
    pub fn load(path: &Path) -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(_) => {}
            Err(e) if e.not_found() => {}
            Err(e) => return Err(e.into()),
        }

        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::Config(format!(
                    "missing {}; copy config.example.json and fill in your API keys",
                    path.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };

        let mut config = Self::from_json(&raw)?;
        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Override selected fields from `SCENE_CHAT_*` variables.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("SCENE_CHAT_BASE_URL") {
            self.base_url = url;
        }
        if let Some(dir) = lookup("SCENE_CHAT_DOWNLOAD_DIR") {
            self.download_dir = PathBuf::from(dir);
        }
        if let Some(key) = lookup("SCENE_CHAT_API_KEY") {
            self.api_keys.insert("default".to_string(), key);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.base_url.trim().is_empty() {
            return Err(Error::Config("base_url must not be empty".to_string()));
        }
        if let Some(name) = &self.default_scene {
            if !self.scenes.iter().any(|s| &s.name == name) {
                return Err(Error::Config(format!(
                    "default_scene '{}' is not listed in scenes",
                    name
                )));
            }
        }
        self.api_key(self.default_key_name())?;
        Ok(())
    }

    pub fn default_scene(&self) -> Option<&Scene> {
        let name = self.default_scene.as_ref()?;
        self.scenes.iter().find(|s| &s.name == name)
    }

    fn default_key_name(&self) -> &str {
        self.default_scene()
            .map(|s| s.api_key.as_str())
            .unwrap_or("default")
    }

    pub fn default_api_key(&self) -> Result<&str> {
        self.api_key(self.default_key_name())
    }

    pub fn api_key(&self, name: &str) -> Result<&str> {
        self.api_keys
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| Error::Config(format!("api_keys has no entry named '{}'", name)))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    pub fn turn_timeout(&self) -> Duration {
        Duration::from_secs(self.turn_timeout_secs)
    }
}
