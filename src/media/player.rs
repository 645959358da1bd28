use crate::{Error, Result};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::process::Command;
use tokio::sync::oneshot;

/// Hands downloaded media to the desktop's default player or viewer.
///
/// At most one launched player is tracked; opening new media stops the
/// previous one.
#[derive(Debug, Clone)]
pub struct MediaPlayer {
    program: String,
    args: Vec<String>,
    current: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl MediaPlayer {
    /// Player using the platform opener.
    pub fn system() -> Self {
        if cfg!(target_os = "windows") {
            Self::with_command("cmd", &["/C", "start", ""])
        } else if cfg!(target_os = "macos") {
            Self::with_command("open", &[])
        } else {
            Self::with_command("xdg-open", &[])
        }
    }

    pub fn with_command(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            current: Arc::new(Mutex::new(None)),
        }
    }

    /// Launch the player on `path` without waiting for it to exit.
    pub fn open(&self, path: &Path) -> Result<()> {
        if !path.exists() {
            tracing::warn!("Cannot open missing media file: {}", path.display());
            return Err(Error::FileNotFound(path.to_path_buf()));
        }

        self.stop();

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(path)
            .kill_on_drop(false)
            .spawn()?;

        let (stop_tx, stop_rx) = oneshot::channel();
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = Some(stop_tx);

        let program = self.program.clone();
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => match status {
                    Ok(status) if !status.success() => {
                        tracing::warn!("{} exited with {}", program, status);
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!("Failed waiting for {}: {}", program, e),
                },
                Ok(()) = stop_rx => {
                    if let Err(e) = child.kill().await {
                        tracing::warn!("Failed to stop {}: {}", program, e);
                    }
                }
            }
        });

        tracing::info!("Opened {} with {}", path.display(), self.program);
        Ok(())
    }

    /// Stop the player launched by the last [`open`](Self::open).
    ///
    /// Returns `false` when nothing launched by us is still running.
    pub fn stop(&self) -> bool {
        let sender = self
            .current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match sender {
            Some(sender) => {
                let stopped = sender.send(()).is_ok();
                if stopped {
                    tracing::info!("Stopped {}", self.program);
                }
                stopped
            }
            None => false,
        }
    }
}

impl Default for MediaPlayer {
    fn default() -> Self {
        Self::system()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_missing_file_rejected() {
        let player = MediaPlayer::with_command("true", &[]);
        let err = player
            .open(Path::new("/definitely/not/here.mp3"))
            .unwrap_err();
        assert!(matches!(err, Error::FileNotFound(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_launches_configured_command() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.mp3");
        std::fs::write(&file, b"x").unwrap();

        MediaPlayer::with_command("true", &[]).open(&file).unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_ends_running_player() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("song.mp3");
        std::fs::write(&file, b"x").unwrap();

        let player = MediaPlayer::with_command("sh", &["-c", "sleep 30", "player"]);
        assert!(!player.stop());

        player.open(&file).unwrap();
        assert!(player.stop());
        assert!(!player.stop());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_opening_new_media_stops_previous() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("one.mp3");
        let second = dir.path().join("two.mp3");
        std::fs::write(&first, b"1").unwrap();
        std::fs::write(&second, b"2").unwrap();

        let player = MediaPlayer::with_command("sh", &["-c", "sleep 30", "player"]);
        player.open(&first).unwrap();
        let (previous_tx, previous_rx) = oneshot::channel::<()>();
        // Swap in a handle we observe; the next open must signal it.
        let launched = player.current.lock().unwrap().replace(previous_tx);
        player.open(&second).unwrap();

        tokio::time::timeout(Duration::from_secs(1), previous_rx)
            .await
            .unwrap()
            .unwrap();
        if let Some(launched) = launched {
            let _ = launched.send(());
        }
        assert!(player.stop());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_after_player_exits_reports_nothing_playing() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.png");
        std::fs::write(&file, b"x").unwrap();

        let player = MediaPlayer::with_command("true", &[]);
        player.open(&file).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(!player.stop());
    }

    #[tokio::test]
    async fn test_unknown_program_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.png");
        std::fs::write(&file, b"x").unwrap();

        let err = MediaPlayer::with_command("scene-chat-no-such-player", &[])
            .open(&file)
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
