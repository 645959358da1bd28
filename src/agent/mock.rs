use super::stream::{StreamNotification, StreamObserver};
use super::AgentService;
use crate::models::{
    FileDescriptor, FileKind, PendingRequest, ResultKind, StreamResult, TransferMethod,
};
use crate::{Error, Result};
use async_trait::async_trait;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// One call observed by [`MockAgentClient`].
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub request: PendingRequest,
    pub user_id: String,
    pub api_key: String,
    pub conversation_id: Option<String>,
    pub started: Instant,
    pub finished: Instant,
}

/// In-memory agent that replays scripted replies.
///
/// Replies are served in order and cycle once exhausted; each reply is
/// streamed word by word with an optional delay between chunks.
#[derive(Clone)]
pub struct MockAgentClient {
    replies: Arc<Mutex<Vec<String>>>,
    calls: Arc<Mutex<Vec<RecordedCall>>>,
    uploads: Arc<Mutex<usize>>,
    chunk_delay: Duration,
    complete: bool,
    api_key: Arc<Mutex<String>>,
    conversation_id: Arc<Mutex<Option<String>>>,
}

impl MockAgentClient {
    pub fn new() -> Self {
        Self {
            replies: Arc::new(Mutex::new(Vec::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
            uploads: Arc::new(Mutex::new(0)),
            chunk_delay: Duration::ZERO,
            complete: true,
            api_key: Arc::new(Mutex::new("mock-key".to_string())),
            conversation_id: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_reply(self, reply: impl Into<String>) -> Self {
        self.replies.lock().unwrap().push(reply.into());
        self
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// Close streams without the end event.
    pub fn without_end_event(mut self) -> Self {
        self.complete = false;
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn get_call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn get_upload_count(&self) -> usize {
        *self.uploads.lock().unwrap()
    }

    pub fn current_api_key(&self) -> String {
        self.api_key.lock().unwrap().clone()
    }

    fn next_reply(&self, call_index: usize, request: &PendingRequest) -> String {
        let replies = self.replies.lock().unwrap();
        if replies.is_empty() {
            format!("echo: {}", request.text)
        } else {
            replies[call_index % replies.len()].clone()
        }
    }
}

impl Default for MockAgentClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentService for MockAgentClient {
    async fn upload_file(&self, path: &Path) -> Result<FileDescriptor> {
        if !path.exists() {
            return Err(Error::FileNotFound(path.to_path_buf()));
        }

        let mut uploads = self.uploads.lock().unwrap();
        *uploads += 1;

        Ok(FileDescriptor {
            kind: FileKind::Document,
            transfer_method: TransferMethod::LocalFile,
            upload_file_id: format!("mock-file-{}", *uploads),
        })
    }

    async fn send_chat(
        &self,
        request: &PendingRequest,
        user_id: &str,
        observer: &mut dyn StreamObserver,
    ) -> StreamResult {
        let started = Instant::now();
        let call_index = self.calls.lock().unwrap().len();
        let api_key = self.current_api_key();
        let conversation_id = self.conversation_id();
        let reply = self.next_reply(call_index, request);

        for word in reply.split_inclusive(' ') {
            if !self.chunk_delay.is_zero() {
                tokio::time::sleep(self.chunk_delay).await;
            }
            observer.on_data(StreamNotification::Text(word.to_string()));
        }

        let new_conversation = format!("mock-conv-{}", call_index + 1);
        let result = StreamResult {
            kind: ResultKind::Reply,
            conversation_id: self.complete.then(|| new_conversation.clone()),
            task_id: Some(format!("mock-task-{}", call_index + 1)),
            audio_path: None,
            image_path: None,
            content: reply.clone(),
            raw_text: reply,
            audio_detected: false,
            image_detected: false,
            completed: self.complete,
        };

        if self.complete {
            *self.conversation_id.lock().unwrap() = Some(new_conversation);
            observer.on_end(&result);
        }

        self.calls.lock().unwrap().push(RecordedCall {
            request: request.clone(),
            user_id: user_id.to_string(),
            api_key,
            conversation_id,
            started,
            finished: Instant::now(),
        });

        result
    }

    fn change_api_key(&self, api_key: &str) {
        *self.api_key.lock().unwrap() = api_key.to_string();
    }

    fn reset_conversation(&self) {
        *self.conversation_id.lock().unwrap() = None;
    }

    fn conversation_id(&self) -> Option<String> {
        self.conversation_id.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::stream::NoopObserver;

    #[tokio::test]
    async fn test_mock_default_reply_echoes() {
        let client = MockAgentClient::new();
        let result = client
            .send_chat(&PendingRequest::new(1, "ping"), "u", &mut NoopObserver)
            .await;
        assert_eq!(result.content, "echo: ping");
        assert!(result.completed);
        assert_eq!(client.conversation_id().as_deref(), Some("mock-conv-1"));
    }

    #[tokio::test]
    async fn test_mock_cycles_replies() {
        let client = MockAgentClient::new().with_reply("one").with_reply("two");

        let mut contents = Vec::new();
        for seq in 1..=3 {
            let result = client
                .send_chat(&PendingRequest::new(seq, "x"), "u", &mut NoopObserver)
                .await;
            contents.push(result.content);
        }
        assert_eq!(contents, vec!["one", "two", "one"]);
        assert_eq!(client.get_call_count(), 3);
    }

    #[tokio::test]
    async fn test_mock_records_key_and_conversation() {
        let client = MockAgentClient::new();
        client
            .send_chat(&PendingRequest::new(1, "a"), "u", &mut NoopObserver)
            .await;
        client.change_api_key("other");
        client.reset_conversation();
        client
            .send_chat(&PendingRequest::new(2, "b"), "u", &mut NoopObserver)
            .await;

        let calls = client.calls();
        assert_eq!(calls[0].api_key, "mock-key");
        assert_eq!(calls[1].api_key, "other");
        assert!(calls[1].conversation_id.is_none());
    }

    #[tokio::test]
    async fn test_mock_upload_requires_existing_file() {
        let client = MockAgentClient::new();
        let err = client
            .upload_file(Path::new("/no/such/file.txt"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::FileNotFound(_)));
        assert_eq!(client.get_upload_count(), 0);
    }
}
