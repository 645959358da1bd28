//! Request sequencing for one conversation.
//!
//! Submissions are queued and dispatched strictly one at a time in FIFO order
//! by a single worker task. Everything the front-end needs to render comes
//! back as [`UiEvent`]s on one channel, so all UI mutation happens wherever
//! that channel is drained.

use crate::agent::{AgentService, StreamNotification, StreamObserver};
use crate::media::MediaKind;
use crate::models::{FileDescriptor, PendingRequest, StreamResult};
use crate::{Error, Result};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencerState {
    Idle,
    Dispatching { seq: u64 },
}

/// How a dispatched turn ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    /// The stream reached its end event.
    Completed(StreamResult),
    /// Transport, HTTP or server-reported error.
    Failed(StreamResult),
    /// The connection closed before the end event.
    Interrupted(StreamResult),
    /// No result within the turn timeout; the call was abandoned.
    TimedOut,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    Chunk {
        seq: u64,
        text: String,
    },
    MediaDetected {
        seq: u64,
        kind: MediaKind,
        chunk: String,
    },
    TurnFinished {
        seq: u64,
        outcome: TurnOutcome,
    },
    /// The queue drained; the front-end may show itself as ready.
    Ready,
}

/// Forwards one turn's stream notifications onto the UI channel.
struct UiForwarder {
    seq: u64,
    ui: mpsc::UnboundedSender<UiEvent>,
}

impl StreamObserver for UiForwarder {
    fn on_data(&mut self, notification: StreamNotification) {
        let seq = self.seq;
        let event = match notification {
            StreamNotification::Text(text) => UiEvent::Chunk { seq, text },
            StreamNotification::AudioDetected(chunk) => UiEvent::MediaDetected {
                seq,
                kind: MediaKind::Audio,
                chunk,
            },
            StreamNotification::ImageDetected(chunk) => UiEvent::MediaDetected {
                seq,
                kind: MediaKind::Image,
                chunk,
            },
        };
        // A closed channel means the front-end is gone; the turn still finishes.
        let _ = self.ui.send(event);
    }

    fn on_end(&mut self, result: &StreamResult) {
        tracing::debug!(
            "Turn {} stream ended (task {:?})",
            self.seq,
            result.task_id
        );
    }
}

/// Handle for submitting turns to the background worker.
pub struct RequestSequencer {
    queue: mpsc::UnboundedSender<PendingRequest>,
    next_seq: AtomicU64,
    state: watch::Receiver<SequencerState>,
}

impl RequestSequencer {
    /// Start the worker. Must be called from within a tokio runtime.
    pub fn spawn(
        agent: Arc<dyn AgentService>,
        user_id: String,
        turn_timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<UiEvent>) {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (ui_tx, ui_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SequencerState::Idle);

        tokio::spawn(run_worker(
            agent,
            user_id,
            turn_timeout,
            queue_rx,
            ui_tx,
            state_tx,
        ));

        (
            Self {
                queue: queue_tx,
                next_seq: AtomicU64::new(0),
                state: state_rx,
            },
            ui_rx,
        )
    }

    /// Queue a turn and return its sequence number.
    pub fn submit(
        &self,
        text: String,
        tool_name: Option<String>,
        tool_params: Option<Value>,
        files: Vec<FileDescriptor>,
    ) -> Result<u64> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let request = PendingRequest {
            seq,
            text,
            tool_name,
            tool_params,
            files,
        };

        self.queue
            .send(request)
            .map_err(|_| Error::Invariant("request worker has stopped".to_string()))?;
        tracing::debug!("Queued turn {}", seq);
        Ok(seq)
    }

    pub fn state(&self) -> SequencerState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SequencerState> {
        self.state.clone()
    }
}

async fn run_worker(
    agent: Arc<dyn AgentService>,
    user_id: String,
    turn_timeout: Duration,
    mut queue: mpsc::UnboundedReceiver<PendingRequest>,
    ui: mpsc::UnboundedSender<UiEvent>,
    state: watch::Sender<SequencerState>,
) {
    while let Some(request) = queue.recv().await {
        let seq = request.seq;
        state.send_replace(SequencerState::Dispatching { seq });
        tracing::info!("Dispatching turn {}", seq);

        let mut observer = UiForwarder {
            seq,
            ui: ui.clone(),
        };
        let dispatch = agent.send_chat(&request, &user_id, &mut observer);

        let outcome = match tokio::time::timeout(turn_timeout, dispatch).await {
            Ok(result) if result.is_error() => TurnOutcome::Failed(result),
            Ok(result) if result.completed => TurnOutcome::Completed(result),
            Ok(result) => {
                tracing::warn!("Turn {} ended without a completion event", seq);
                TurnOutcome::Interrupted(result)
            }
            Err(_) => {
                tracing::warn!("Turn {} timed out after {:?}", seq, turn_timeout);
                TurnOutcome::TimedOut
            }
        };

        let _ = ui.send(UiEvent::TurnFinished { seq, outcome });

        if queue.is_empty() {
            state.send_replace(SequencerState::Idle);
            let _ = ui.send(UiEvent::Ready);
        }
    }

    tracing::debug!("Request worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::MockAgentClient;

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<UiEvent>) -> UiEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for UI event")
            .expect("UI channel closed")
    }

    async fn finished_turns(
        rx: &mut mpsc::UnboundedReceiver<UiEvent>,
        count: usize,
    ) -> Vec<(u64, TurnOutcome)> {
        let mut finished = Vec::new();
        while finished.len() < count {
            if let UiEvent::TurnFinished { seq, outcome } = next_event(rx).await {
                finished.push((seq, outcome));
            }
        }
        finished
    }

    #[tokio::test]
    async fn test_turns_dispatched_in_submission_order() {
        let mock = MockAgentClient::new().with_chunk_delay(Duration::from_millis(10));
        let (sequencer, mut rx) =
            RequestSequencer::spawn(Arc::new(mock.clone()), "u".to_string(), Duration::from_secs(5));

        for text in ["first", "second", "third"] {
            sequencer
                .submit(text.to_string(), None, None, Vec::new())
                .unwrap();
        }

        let finished = finished_turns(&mut rx, 3).await;
        let seqs: Vec<u64> = finished.iter().map(|(seq, _)| *seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);

        let calls = mock.calls();
        let texts: Vec<&str> = calls.iter().map(|c| c.request.text.as_str()).collect();
        assert_eq!(texts, vec!["first", "second", "third"]);
        for pair in calls.windows(2) {
            assert!(pair[0].finished <= pair[1].started);
        }
    }

    #[tokio::test]
    async fn test_chunks_carry_sequence_number() {
        let mock = MockAgentClient::new().with_reply("hello world");
        let (sequencer, mut rx) =
            RequestSequencer::spawn(Arc::new(mock), "u".to_string(), Duration::from_secs(5));

        let seq = sequencer
            .submit("hi".to_string(), None, None, Vec::new())
            .unwrap();

        assert_eq!(
            next_event(&mut rx).await,
            UiEvent::Chunk {
                seq,
                text: "hello ".to_string()
            }
        );
        assert_eq!(
            next_event(&mut rx).await,
            UiEvent::Chunk {
                seq,
                text: "world".to_string()
            }
        );
        match next_event(&mut rx).await {
            UiEvent::TurnFinished {
                outcome: TurnOutcome::Completed(result),
                ..
            } => assert_eq!(result.content, "hello world"),
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(next_event(&mut rx).await, UiEvent::Ready);
        assert_eq!(sequencer.state(), SequencerState::Idle);
    }

    #[tokio::test]
    async fn test_timeout_is_surfaced_and_queue_advances() {
        let slow = MockAgentClient::new()
            .with_reply("a b c d e")
            .with_chunk_delay(Duration::from_millis(100));
        let (sequencer, mut rx) =
            RequestSequencer::spawn(Arc::new(slow), "u".to_string(), Duration::from_millis(150));

        sequencer
            .submit("slow".to_string(), None, None, Vec::new())
            .unwrap();
        sequencer
            .submit("next".to_string(), None, None, Vec::new())
            .unwrap();

        let finished = finished_turns(&mut rx, 2).await;
        assert_eq!(finished[0], (1, TurnOutcome::TimedOut));
        assert_eq!(finished[1], (2, TurnOutcome::TimedOut));
    }

    #[tokio::test]
    async fn test_missing_end_event_is_interrupted() {
        let mock = MockAgentClient::new().without_end_event();
        let (sequencer, mut rx) =
            RequestSequencer::spawn(Arc::new(mock), "u".to_string(), Duration::from_secs(5));

        sequencer
            .submit("x".to_string(), None, None, Vec::new())
            .unwrap();

        let finished = finished_turns(&mut rx, 1).await;
        assert!(matches!(finished[0].1, TurnOutcome::Interrupted(_)));
    }

    #[tokio::test]
    async fn test_state_tracks_dispatch() {
        let mock = MockAgentClient::new().with_chunk_delay(Duration::from_millis(50));
        let (sequencer, mut rx) =
            RequestSequencer::spawn(Arc::new(mock), "u".to_string(), Duration::from_secs(5));
        let mut state = sequencer.subscribe();

        assert_eq!(sequencer.state(), SequencerState::Idle);
        sequencer
            .submit("x".to_string(), None, None, Vec::new())
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), state.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*state.borrow(), SequencerState::Dispatching { seq: 1 });

        finished_turns(&mut rx, 1).await;
        assert_eq!(next_event(&mut rx).await, UiEvent::Ready);
        assert_eq!(sequencer.state(), SequencerState::Idle);
    }

    #[tokio::test]
    async fn test_files_and_tool_forwarded() {
        let mock = MockAgentClient::new();
        let (sequencer, mut rx) =
            RequestSequencer::spawn(Arc::new(mock.clone()), "user-9".to_string(), Duration::from_secs(5));

        let file = FileDescriptor {
            kind: crate::models::FileKind::Document,
            transfer_method: crate::models::TransferMethod::LocalFile,
            upload_file_id: "f-1".to_string(),
        };
        sequencer
            .submit(
                "summarize".to_string(),
                Some("weather".to_string()),
                Some(serde_json::json!({"city": "Paris"})),
                vec![file.clone()],
            )
            .unwrap();
        finished_turns(&mut rx, 1).await;

        let call = &mock.calls()[0];
        assert_eq!(call.user_id, "user-9");
        assert_eq!(call.request.files, vec![file]);
        assert_eq!(call.request.tool_name.as_deref(), Some("weather"));
    }
}
