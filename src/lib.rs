//! Scene chat - a terminal front-end for a hosted conversational agent
//!
//! Sends chat turns to an agent API, renders streamed replies as they arrive,
//! downloads audio and image replies, and switches persona scenes when the
//! agent asks for a change of location.

pub mod agent;
pub mod app;
pub mod error;
pub mod media;
pub mod models;
pub mod scene;
pub mod sequencer;

pub use error::{Error, Result};
