use super::stream::{
    decode_body, download_failed_message, extract_media_url, media_marker, missing_link_message,
    DecodedStream, StreamObserver, Termination,
};
use super::AgentService;
use crate::media::{mime, MediaDownloader, MediaKind};
use crate::models::{
    ApiErrorBody, ChatMessageRequest, Config, FileDescriptor, FileKind, PendingRequest,
    ResultKind, StreamResult, ToolInvocation, ToolSpec, TransferMethod, UploadResponse,
};
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response};
use serde_json::Map;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

const CHAT_PATH: &str = "/chat-messages";
const UPLOAD_PATH: &str = "/files/upload";

const DOCUMENT_EXTENSIONS: &[&str] = &[
    "TXT", "MD", "MARKDOWN", "PDF", "HTML", "XLSX", "XLS", "DOCX", "CSV", "EML", "MSG", "PPTX",
    "PPT", "XML", "EPUB",
];

/// Connection settings for [`AgentClient`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub base_url: String,
    pub request_timeout: Duration,
    pub upload_timeout: Duration,
    /// User id sent with uploads; chat turns pass their own.
    pub upload_user: String,
    pub tools: BTreeMap<String, ToolSpec>,
}

impl ClientOptions {
    pub fn from_config(config: &Config, upload_user: &str) -> Self {
        Self {
            base_url: config.base_url.clone(),
            request_timeout: config.request_timeout(),
            upload_timeout: config.upload_timeout(),
            upload_user: upload_user.to_string(),
            tools: config.tools.clone(),
        }
    }
}

/// Credential and conversation shared between the worker and the front-end.
#[derive(Debug)]
struct ClientState {
    api_key: String,
    conversation_id: Option<String>,
    /// Bumped on every credential change or reset; a turn started in an
    /// older epoch must not write its conversation id back.
    epoch: u64,
}

/// What a chat turn saw of [`ClientState`] when it started.
#[derive(Debug, Clone)]
struct Snapshot {
    api_key: String,
    conversation_id: Option<String>,
    epoch: u64,
}

/// HTTP client for the hosted agent API.
pub struct AgentClient {
    http: Client,
    base_url: String,
    request_timeout: Duration,
    upload_timeout: Duration,
    upload_user: String,
    tools: BTreeMap<String, ToolSpec>,
    downloader: MediaDownloader,
    state: RwLock<ClientState>,
}

impl AgentClient {
    pub fn new(api_key: String, options: ClientOptions, downloader: MediaDownloader) -> Self {
        Self::new_with_client(Client::new(), api_key, options, downloader)
    }

    pub fn new_with_client(
        http: Client,
        api_key: String,
        options: ClientOptions,
        downloader: MediaDownloader,
    ) -> Self {
        Self {
            http,
            base_url: options.base_url.trim_end_matches('/').to_string(),
            request_timeout: options.request_timeout,
            upload_timeout: options.upload_timeout,
            upload_user: options.upload_user,
            tools: options.tools,
            downloader,
            state: RwLock::new(ClientState {
                api_key,
                conversation_id: None,
                epoch: 0,
            }),
        }
    }

    /// Build a client and downloader sharing one connection pool.
    pub fn from_config(config: &Config, upload_user: &str) -> Result<Self> {
        let http = Client::new();
        let downloader = MediaDownloader::new(
            http.clone(),
            config.download_dir.clone(),
            config.download_timeout(),
        );
        Ok(Self::new_with_client(
            http,
            config.default_api_key()?.to_string(),
            ClientOptions::from_config(config, upload_user),
            downloader,
        ))
    }

    fn read_state(&self) -> RwLockReadGuard<'_, ClientState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, ClientState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn api_key(&self) -> String {
        self.read_state().api_key.clone()
    }

    fn snapshot(&self) -> Snapshot {
        let state = self.read_state();
        Snapshot {
            api_key: state.api_key.clone(),
            conversation_id: state.conversation_id.clone(),
            epoch: state.epoch,
        }
    }

    /// Store the conversation id a turn produced, unless the session moved on.
    fn remember_conversation(&self, started: &Snapshot, conversation_id: &str) {
        let mut state = self.write_state();
        if state.epoch == started.epoch {
            state.conversation_id = Some(conversation_id.to_string());
        } else {
            tracing::info!(
                "Discarding conversation {} from a turn started before the last reset",
                conversation_id
            );
        }
    }

    fn build_request(
        &self,
        request: &PendingRequest,
        user_id: &str,
        conversation_id: Option<String>,
    ) -> ChatMessageRequest {
        let mut body = ChatMessageRequest {
            query: request.text.clone(),
            user: user_id.to_string(),
            response_mode: "streaming".to_string(),
            inputs: Map::new(),
            auto_generate_name: true,
            conversation_id,
            files: request.files.clone(),
            llm_only: None,
            tools: None,
        };

        if let Some(name) = &request.tool_name {
            match self.tools.get(name) {
                Some(spec) => {
                    let parameters = request
                        .tool_params
                        .clone()
                        .unwrap_or_else(|| spec.default_params.clone());
                    body.llm_only = Some(false);
                    body.tools = Some(vec![ToolInvocation {
                        name: name.clone(),
                        parameters,
                    }]);
                }
                None => tracing::warn!("Ignoring unknown tool '{}'", name),
            }
        }

        body
    }

    async fn open_stream(
        &self,
        api_key: &str,
        body: &ChatMessageRequest,
    ) -> std::result::Result<Response, String> {
        let url = format!("{}{}", self.base_url, CHAT_PATH);
        tracing::debug!(
            "Sending chat request to {}: {}",
            url,
            serde_json::to_string(body).unwrap_or_default()
        );

        let response = self
            .http
            .post(&url)
            .timeout(self.request_timeout)
            .bearer_auth(api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                tracing::error!("Failed to send chat request: {}", e);
                format!("API request failed: {}", e)
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            let message = server_message(&text).unwrap_or_else(|| {
                if text.is_empty() {
                    "unknown error".to_string()
                } else {
                    text
                }
            });
            let message = format!("HTTP error {}: {}", status.as_u16(), message);
            tracing::error!("{}", message);
            return Err(message);
        }

        Ok(response)
    }

    /// Turn a decoded stream into the final result, fetching any announced media.
    async fn finalize(&self, decoded: DecodedStream, api_key: &str) -> StreamResult {
        let completed = match decoded.termination {
            Termination::Failed(message) => {
                let mut result = StreamResult::error(message);
                result.task_id = decoded.task_id;
                result.raw_text = decoded.text;
                return result;
            }
            Termination::Ended => true,
            Termination::Closed => {
                tracing::warn!("Chat stream closed before the end event");
                false
            }
        };

        let mut content = decoded.text.clone();
        let mut audio_path = None;
        let mut image_path = None;

        if let Some(kind) = decoded.media {
            match extract_media_url(&decoded.text) {
                Some(url) => {
                    tracing::info!("Found {} link: {}", kind, url);
                    match self.downloader.download(url, kind, api_key).await {
                        Some(path) => {
                            content = media_marker(kind, &path);
                            match kind {
                                MediaKind::Audio => audio_path = Some(path),
                                MediaKind::Image => image_path = Some(path),
                            }
                        }
                        None => {
                            tracing::warn!("{} download failed", kind);
                            content = download_failed_message(kind);
                        }
                    }
                }
                None => {
                    tracing::warn!("No {} link found in reply", kind);
                    content = missing_link_message(kind);
                }
            }
        }

        StreamResult {
            kind: ResultKind::Reply,
            conversation_id: decoded.conversation_id,
            task_id: decoded.task_id,
            audio_path,
            image_path,
            content,
            raw_text: decoded.text,
            audio_detected: decoded.media == Some(MediaKind::Audio),
            image_detected: decoded.media == Some(MediaKind::Image),
            completed,
        }
    }
}

fn server_message(body: &str) -> Option<String> {
    serde_json::from_str::<ApiErrorBody>(body)
        .ok()
        .and_then(|b| b.message)
        .filter(|m| !m.is_empty())
}

fn classify(extension: &str) -> FileKind {
    if DOCUMENT_EXTENSIONS.contains(&extension) {
        FileKind::Document
    } else {
        FileKind::Custom
    }
}

#[async_trait]
impl AgentService for AgentClient {
    async fn upload_file(&self, path: &Path) -> Result<FileDescriptor> {
        if !path.exists() {
            tracing::error!("Upload source does not exist: {}", path.display());
            return Err(Error::FileNotFound(path.to_path_buf()));
        }

        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_uppercase())
            .unwrap_or_default();
        let kind = classify(&extension);
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "upload".to_string());

        let bytes = tokio::fs::read(path).await?;
        let part = Part::bytes(bytes)
            .file_name(file_name)
            .mime_str(&mime::upload_mime(&extension))?;
        let form = Form::new()
            .part("file", part)
            .text("user", self.upload_user.clone());

        let url = format!("{}{}", self.base_url, UPLOAD_PATH);
        let response = self
            .http
            .post(&url)
            .timeout(self.upload_timeout)
            .bearer_auth(self.api_key())
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                tracing::error!("File upload failed: {}", e);
                Error::Upload(format!("File upload failed: {}", e))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            let message = server_message(&text)
                .unwrap_or_else(|| format!("File upload failed: status {}", status.as_u16()));
            tracing::error!("{}", message);
            return Err(Error::Upload(message));
        }

        let body = response.text().await?;
        let uploaded: UploadResponse = serde_json::from_str(&body).map_err(|e| {
            tracing::error!("Failed to parse upload response: {}\nBody: {}", e, body);
            Error::Upload(format!("Unexpected upload response: {}", e))
        })?;

        tracing::info!("Uploaded {} as {}", path.display(), uploaded.id);
        Ok(FileDescriptor {
            kind,
            transfer_method: TransferMethod::LocalFile,
            upload_file_id: uploaded.id,
        })
    }

    async fn send_chat(
        &self,
        request: &PendingRequest,
        user_id: &str,
        observer: &mut dyn StreamObserver,
    ) -> StreamResult {
        let session = self.snapshot();
        let body = self.build_request(request, user_id, session.conversation_id.clone());

        let result = match self.open_stream(&session.api_key, &body).await {
            Ok(response) => {
                let decoded = decode_body(Box::pin(response.bytes_stream()), observer).await;
                self.finalize(decoded, &session.api_key).await
            }
            Err(message) => StreamResult::error(message),
        };

        if result.completed {
            if let Some(id) = &result.conversation_id {
                self.remember_conversation(&session, id);
            }
        }

        if result.completed || result.is_error() {
            observer.on_end(&result);
        }
        result
    }

    fn change_api_key(&self, api_key: &str) {
        let mut state = self.write_state();
        state.api_key = api_key.to_string();
        state.epoch += 1;
        tracing::info!("Agent credential replaced");
    }

    fn reset_conversation(&self) {
        let mut state = self.write_state();
        state.conversation_id = None;
        state.epoch += 1;
    }

    fn conversation_id(&self) -> Option<String> {
        self.read_state().conversation_id.clone()
    }
}
