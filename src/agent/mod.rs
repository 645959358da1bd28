//! Conversational agent API integration
//!
//! Uploads attachments and streams chat replies from the hosted agent,
//! turning its event stream into incremental UI notifications and one final
//! result per turn.

pub mod client;
pub mod mock;
pub mod stream;

pub use client::{AgentClient, ClientOptions};
pub use mock::MockAgentClient;
pub use stream::{StreamNotification, StreamObserver};

use crate::models::{FileDescriptor, PendingRequest, StreamResult};
use crate::Result;
use async_trait::async_trait;
use std::path::Path;

#[async_trait]
pub trait AgentService: Send + Sync {
    /// Upload a local file and return the descriptor to attach to a chat turn.
    async fn upload_file(&self, path: &Path) -> Result<FileDescriptor>;

    /// Send one chat turn and stream the reply into `observer`.
    ///
    /// Transport and API failures come back as an error [`StreamResult`]
    /// rather than an `Err`.
    async fn send_chat(
        &self,
        request: &PendingRequest,
        user_id: &str,
        observer: &mut dyn StreamObserver,
    ) -> StreamResult;

    /// Use a different credential for every call started from now on.
    fn change_api_key(&self, api_key: &str);

    /// Forget the current conversation so the next turn starts a new one.
    fn reset_conversation(&self);

    fn conversation_id(&self) -> Option<String>;
}
