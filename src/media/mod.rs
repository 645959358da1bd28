//! Media replies: downloading, previewing and opening audio/image files
//!
//! The agent announces media with an inline tag and a link; these modules turn
//! that link into a local file the front-end can show or play.

pub mod download;
pub mod mime;
pub mod player;
pub mod preview;

pub use download::MediaDownloader;
pub use player::MediaPlayer;
pub use preview::PreviewMaker;

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Image,
}

impl MediaKind {
    pub fn label(self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Image => "image",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
