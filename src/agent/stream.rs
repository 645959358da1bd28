//! Decoding of the agent's server-sent event stream.
//!
//! Lines arrive as `data: {json}`. Each payload is decoded once into a
//! [`StreamEvent`]; message fragments are accumulated and forwarded to a
//! [`StreamObserver`] until a media tag shows up, after which plain text is
//! withheld for the rest of the stream.

use crate::media::MediaKind;
use crate::models::StreamResult;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use std::fmt::Display;

const AUDIO_TAGS: &[&str] = &["[audio]", "[音频]"];
const IMAGE_TAGS: &[&str] = &["[image]", "[图片]"];

/// One decoded event from the chat stream.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    Message {
        #[serde(default)]
        task_id: Option<String>,
        #[serde(default)]
        answer: String,
    },
    Error {
        #[serde(default)]
        task_id: Option<String>,
        #[serde(default)]
        message: Option<String>,
    },
    MessageEnd {
        #[serde(default)]
        task_id: Option<String>,
        #[serde(default)]
        conversation_id: Option<String>,
    },
    /// Events the client has no use for (pings, workflow progress, ...).
    #[serde(other)]
    Other,
}

/// Incremental update handed to the front-end while a reply streams in.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamNotification {
    Text(String),
    AudioDetected(String),
    ImageDetected(String),
}

/// Receives streaming updates for a single chat call.
pub trait StreamObserver: Send {
    fn on_data(&mut self, notification: StreamNotification);

    /// Called once with the final result when the stream ended cleanly or the
    /// server reported an error. Not called when the connection just closed.
    fn on_end(&mut self, result: &StreamResult);
}

/// Observer that ignores every update.
#[derive(Debug, Default)]
pub struct NoopObserver;

impl StreamObserver for NoopObserver {
    fn on_data(&mut self, _notification: StreamNotification) {}
    fn on_end(&mut self, _result: &StreamResult) {}
}

/// One-shot media detection over the accumulated reply text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MediaDetector {
    #[default]
    Scanning,
    AudioLocked,
    ImageLocked,
}

impl MediaDetector {
    /// Advance on the text accumulated so far.
    ///
    /// Returns the media kind only on the step that locks the detector. When
    /// both kinds are present, the tag at the earlier offset wins.
    pub fn observe(&mut self, accumulated: &str) -> Option<MediaKind> {
        if *self != MediaDetector::Scanning {
            return None;
        }

        let audio = earliest_tag(accumulated, AUDIO_TAGS);
        let image = earliest_tag(accumulated, IMAGE_TAGS);

        let kind = match (audio, image) {
            (Some(a), Some(i)) if i < a => MediaKind::Image,
            (Some(_), _) => MediaKind::Audio,
            (None, Some(_)) => MediaKind::Image,
            (None, None) => return None,
        };

        *self = match kind {
            MediaKind::Audio => MediaDetector::AudioLocked,
            MediaKind::Image => MediaDetector::ImageLocked,
        };
        Some(kind)
    }

    pub fn locked(&self) -> Option<MediaKind> {
        match self {
            MediaDetector::Scanning => None,
            MediaDetector::AudioLocked => Some(MediaKind::Audio),
            MediaDetector::ImageLocked => Some(MediaKind::Image),
        }
    }
}

fn earliest_tag(text: &str, tags: &[&str]) -> Option<usize> {
    tags.iter().filter_map(|tag| text.find(tag)).min()
}

/// How a stream stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// `message_end` received.
    Ended,
    /// Server error event or a broken transfer.
    Failed(String),
    /// Body closed without an end event.
    Closed,
}

/// Everything the decoder learned from one stream, before media handling.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedStream {
    pub text: String,
    pub media: Option<MediaKind>,
    pub task_id: Option<String>,
    pub conversation_id: Option<String>,
    pub termination: Termination,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Step {
    Continue,
    Stop,
}

/// Stateful decoder for one chat stream.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    accumulated: String,
    detector: MediaDetector,
    task_id: Option<String>,
    conversation_id: Option<String>,
    termination: Option<Termination>,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one raw line. Blank lines, comments and malformed payloads are
    /// skipped.
    pub fn feed_line(&mut self, line: &str, observer: &mut dyn StreamObserver) -> Step {
        let Some(payload) = data_payload(line) else {
            return Step::Continue;
        };

        match serde_json::from_str::<StreamEvent>(payload) {
            Ok(event) => self.apply(event, observer),
            Err(e) => {
                tracing::warn!("Skipping malformed stream line ({}): {}", e, line);
                Step::Continue
            }
        }
    }

    pub fn apply(&mut self, event: StreamEvent, observer: &mut dyn StreamObserver) -> Step {
        match event {
            StreamEvent::Message { task_id, answer } => {
                self.remember_task(task_id);
                self.accumulated.push_str(&answer);

                match self.detector.observe(&self.accumulated) {
                    Some(MediaKind::Audio) => {
                        tracing::info!("Audio reply detected");
                        observer.on_data(StreamNotification::AudioDetected(answer));
                    }
                    Some(MediaKind::Image) => {
                        tracing::info!("Image reply detected");
                        observer.on_data(StreamNotification::ImageDetected(answer));
                    }
                    None if self.detector.locked().is_none() => {
                        observer.on_data(StreamNotification::Text(answer));
                    }
                    None => {}
                }
                Step::Continue
            }
            StreamEvent::Error { task_id, message } => {
                self.remember_task(task_id);
                let message = format!(
                    "API error: {}",
                    message.unwrap_or_else(|| "unknown error".to_string())
                );
                tracing::error!("{}", message);
                self.termination = Some(Termination::Failed(message));
                Step::Stop
            }
            StreamEvent::MessageEnd {
                task_id,
                conversation_id,
            } => {
                self.remember_task(task_id);
                self.conversation_id = conversation_id;
                self.termination = Some(Termination::Ended);
                Step::Stop
            }
            StreamEvent::Other => Step::Continue,
        }
    }

    /// Record a transfer failure that cut the stream short.
    pub fn fail(&mut self, message: String) {
        if self.termination.is_none() {
            self.termination = Some(Termination::Failed(message));
        }
    }

    pub fn finish(self) -> DecodedStream {
        DecodedStream {
            text: self.accumulated,
            media: self.detector.locked(),
            task_id: self.task_id,
            conversation_id: self.conversation_id,
            termination: self.termination.unwrap_or(Termination::Closed),
        }
    }

    fn remember_task(&mut self, task_id: Option<String>) {
        if task_id.is_some() {
            self.task_id = task_id;
        }
    }
}

fn data_payload(line: &str) -> Option<&str> {
    let payload = line.trim_end_matches('\r').strip_prefix("data:")?.trim_start();
    if payload.is_empty() {
        None
    } else {
        Some(payload)
    }
}

/// Splits a byte stream into lines without breaking multi-byte characters
/// that straddle chunk boundaries.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
    /// Bytes of `pending` already known to hold no newline.
    scanned: usize,
}

impl LineBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        let mut from = self.scanned;
        while let Some(offset) = self.pending[from..].iter().position(|b| *b == b'\n') {
            let end = from + offset;
            lines.push(String::from_utf8_lossy(&self.pending[start..end]).into_owned());
            start = end + 1;
            from = start;
        }

        self.pending.drain(..start);
        self.scanned = self.pending.len();
        lines
    }

    /// Remaining bytes after the body closed, if any.
    pub fn finish(self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&self.pending).into_owned())
        }
    }
}

/// Drive a decoder over a streamed response body.
pub async fn decode_body<S, B, E>(mut body: S, observer: &mut dyn StreamObserver) -> DecodedStream
where
    S: Stream<Item = std::result::Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Display,
{
    let mut decoder = StreamDecoder::new();
    let mut lines = LineBuffer::default();

    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::error!("Stream transfer failed: {}", e);
                decoder.fail(format!("Stream interrupted: {}", e));
                return decoder.finish();
            }
        };

        for line in lines.push(chunk.as_ref()) {
            if decoder.feed_line(&line, observer) == Step::Stop {
                return decoder.finish();
            }
        }
    }

    if let Some(line) = lines.finish() {
        decoder.feed_line(&line, observer);
    }
    decoder.finish()
}

/// First `(http://...)` or `(https://...)` link in the text.
pub fn extract_media_url(text: &str) -> Option<&str> {
    for (idx, _) in text.match_indices('(') {
        let rest = &text[idx + 1..];
        let scheme_len = if rest.starts_with("https://") {
            "https://".len()
        } else if rest.starts_with("http://") {
            "http://".len()
        } else {
            continue;
        };

        let Some(end) = rest.find(')') else {
            continue;
        };
        if end > scheme_len {
            return Some(rest[..end].trim());
        }
    }
    None
}

/// Content shown in place of a reply whose media was saved locally.
pub fn media_marker(kind: MediaKind, path: &std::path::Path) -> String {
    match kind {
        MediaKind::Audio => format!("[AUDIO:{}]", path.display()),
        MediaKind::Image => format!("[IMAGE:{}]", path.display()),
    }
}

pub fn download_failed_message(kind: MediaKind) -> String {
    match kind {
        MediaKind::Audio => "Audio download failed, check the network connection".to_string(),
        MediaKind::Image => "Image download failed, check the network connection".to_string(),
    }
}

pub fn missing_link_message(kind: MediaKind) -> String {
    format!("No valid {} download link found", kind)
}
