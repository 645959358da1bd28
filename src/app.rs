//! Terminal front-end: reads commands, submits turns and renders replies.
//!
//! The event loop here is the single UI context. The sequencer's worker never
//! touches the output; it only sends [`UiEvent`]s that are rendered in
//! arrival order.

use crate::agent::{AgentClient, AgentService};
use crate::media::{MediaPlayer, PreviewMaker};
use crate::models::{Config, FileDescriptor, StreamResult};
use crate::scene::{Scene, SceneCatalog};
use crate::sequencer::{RequestSequencer, TurnOutcome, UiEvent};
use crate::{Error, Result};
use serde_json::Value;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

const HELP: &str = "\
Commands:
  <text>                 send a message
  /upload <path>         attach a file to the next message
  /tool <name> [json]    invoke a tool with the next message
  /new                   start a new conversation
  /clear                 drop staged files and tool
  /open                  play or view the last downloaded media
  /stop                  stop the player started by /open
  /scene                 show the current persona
  /help                  show this help
  /quit                  exit";

/// One line of user input.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Send(String),
    Upload(PathBuf),
    Tool { name: String, params: Option<Value> },
    New,
    Clear,
    Open,
    Stop,
    Scene,
    Help,
    Quit,
    Empty,
}

impl Command {
    pub fn parse(line: &str) -> std::result::Result<Command, String> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(Command::Empty);
        }
        if !line.starts_with('/') {
            return Ok(Command::Send(line.to_string()));
        }

        let (name, rest) = match line.split_once(char::is_whitespace) {
            Some((name, rest)) => (name, rest.trim()),
            None => (line, ""),
        };

        match name {
            "/upload" if rest.is_empty() => Err("Usage: /upload <path>".to_string()),
            "/upload" => Ok(Command::Upload(PathBuf::from(rest))),
            "/tool" if rest.is_empty() => Err("Usage: /tool <name> [json]".to_string()),
            "/tool" => {
                let (tool, params) = match rest.split_once(char::is_whitespace) {
                    Some((tool, params)) => (tool, Some(params.trim())),
                    None => (rest, None),
                };
                let params = params
                    .map(serde_json::from_str::<Value>)
                    .transpose()
                    .map_err(|e| format!("Invalid tool parameters: {}", e))?;
                Ok(Command::Tool {
                    name: tool.to_string(),
                    params,
                })
            }
            "/new" => Ok(Command::New),
            "/clear" => Ok(Command::Clear),
            "/open" => Ok(Command::Open),
            "/stop" => Ok(Command::Stop),
            "/scene" => Ok(Command::Scene),
            "/help" => Ok(Command::Help),
            "/quit" | "/exit" => Ok(Command::Quit),
            other => Err(format!("Unknown command '{}'; try /help", other)),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// Injectable service bundle used to construct [`App`] in tests/harnesses.
pub struct AppServices {
    pub agent: Arc<dyn AgentService>,
    pub player: MediaPlayer,
    pub previews: PreviewMaker,
}

pub struct App {
    config: Config,
    agent: Arc<dyn AgentService>,
    sequencer: RequestSequencer,
    events: mpsc::UnboundedReceiver<UiEvent>,
    scenes: SceneCatalog,
    current_scene: Option<Scene>,
    staged_files: Vec<FileDescriptor>,
    selected_tool: Option<(String, Option<Value>)>,
    streaming: Option<u64>,
    last_media: Option<PathBuf>,
    player: MediaPlayer,
    previews: PreviewMaker,
    out: Box<dyn Write + Send>,
}

impl App {
    /// Build an app from concrete service dependencies.
    ///
    /// Must be called from within a tokio runtime; the request worker starts
    /// immediately.
    pub fn with_services(
        services: AppServices,
        config: Config,
        user_id: String,
        out: Box<dyn Write + Send>,
    ) -> Self {
        let (sequencer, events) =
            RequestSequencer::spawn(services.agent.clone(), user_id, config.turn_timeout());
        let scenes = SceneCatalog::new(config.scenes.clone());
        let current_scene = config.default_scene().cloned();

        Self {
            config,
            agent: services.agent,
            sequencer,
            events,
            scenes,
            current_scene,
            staged_files: Vec::new(),
            selected_tool: None,
            streaming: None,
            last_media: None,
            player: services.player,
            previews: services.previews,
            out,
        }
    }

    /// Construct the app from configuration, talking to the real agent API.
    pub fn new(config: Config, user_id: String) -> Result<Self> {
        let agent = Arc::new(AgentClient::from_config(&config, &user_id)?);
        info!(
            "Agent API at {} (downloads in {})",
            config.base_url,
            config.download_dir.display()
        );

        Ok(Self::with_services(
            AppServices {
                agent,
                player: MediaPlayer::system(),
                previews: PreviewMaker::new(),
            },
            config,
            user_id,
            Box::new(std::io::stdout()),
        ))
    }

    /// Switch to a named scene before the first message.
    pub fn enter_scene(&mut self, name: &str) -> Result<()> {
        let scene = self
            .scenes
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Config(format!("unknown scene '{}'", name)))?;
        self.apply_scene(scene)
    }

    /// Run until `/quit` or end of input.
    pub async fn run(mut self) -> Result<()> {
        self.render_scene()?;
        writeln!(self.out, "Type /help for commands.")?;
        self.out.flush()?;

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else {
                        info!("Input closed");
                        break;
                    };
                    if self.handle_line(&line).await? == Flow::Quit {
                        break;
                    }
                }
                Some(event) = self.events.recv() => {
                    self.handle_event(event).await?;
                }
            }
        }
        Ok(())
    }

    pub async fn handle_line(&mut self, line: &str) -> Result<Flow> {
        let command = match Command::parse(line) {
            Ok(command) => command,
            Err(message) => {
                writeln!(self.out, "{}", message)?;
                return Ok(Flow::Continue);
            }
        };

        match command {
            Command::Empty => {}
            Command::Send(text) => self.send(text)?,
            Command::Upload(path) => self.upload(&path).await?,
            Command::Tool { name, params } => self.select_tool(name, params)?,
            Command::New => self.new_conversation()?,
            Command::Clear => self.clear()?,
            Command::Open => self.open_last_media()?,
            Command::Stop => {
                if self.player.stop() {
                    writeln!(self.out, "Playback stopped")?;
                } else {
                    writeln!(self.out, "Nothing is playing")?;
                }
            }
            Command::Scene => self.render_scene()?,
            Command::Help => writeln!(self.out, "{}", HELP)?,
            Command::Quit => return Ok(Flow::Quit),
        }
        self.out.flush()?;
        Ok(Flow::Continue)
    }

    fn send(&mut self, text: String) -> Result<()> {
        let (tool_name, tool_params) = match self.selected_tool.take() {
            Some((name, params)) => (Some(name), params),
            None => (None, None),
        };
        let files = std::mem::take(&mut self.staged_files);

        writeln!(self.out, "You: {}", text)?;
        let seq = self.sequencer.submit(text, tool_name, tool_params, files)?;
        info!("Submitted turn {}", seq);
        writeln!(self.out, "Processing...")?;
        Ok(())
    }

    async fn upload(&mut self, path: &Path) -> Result<()> {
        writeln!(self.out, "Uploading {}...", path.display())?;
        self.out.flush()?;

        match self.agent.upload_file(path).await {
            Ok(descriptor) => {
                self.staged_files.push(descriptor);
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| path.display().to_string());
                writeln!(self.out, "Uploaded file: {}", name)?;
            }
            Err(e) => {
                warn!("Upload of {} failed: {}", path.display(), e);
                writeln!(self.out, "File upload failed: {}", e)?;
            }
        }
        Ok(())
    }

    fn select_tool(&mut self, name: String, params: Option<Value>) -> Result<()> {
        match self.config.tools.get(&name) {
            Some(spec) => {
                writeln!(self.out, "Next message will use tool: {}", spec.label)?;
                self.selected_tool = Some((name, params));
            }
            None => writeln!(self.out, "Unknown tool '{}'", name)?,
        }
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        self.staged_files.clear();
        self.selected_tool = None;
        writeln!(self.out, "Ready")?;
        Ok(())
    }

    fn new_conversation(&mut self) -> Result<()> {
        self.clear_staging();
        self.agent.reset_conversation();

        match self.config.default_scene().cloned() {
            Some(scene) => self.apply_scene(scene)?,
            None => {
                self.agent.change_api_key(self.config.default_api_key()?);
                self.current_scene = None;
            }
        }
        writeln!(self.out, "New conversation created")?;
        Ok(())
    }

    fn clear_staging(&mut self) {
        self.staged_files.clear();
        self.selected_tool = None;
        self.streaming = None;
    }

    fn apply_scene(&mut self, scene: Scene) -> Result<()> {
        let api_key = self.config.api_key(&scene.api_key)?;
        info!("Switching to scene {}", scene.name);

        self.agent.change_api_key(api_key);
        self.agent.reset_conversation();
        self.staged_files.clear();
        self.current_scene = Some(scene);
        self.render_scene()
    }

    fn render_scene(&mut self) -> Result<()> {
        let Some(scene) = &self.current_scene else {
            writeln!(self.out, "== Assistant ==")?;
            return Ok(());
        };

        writeln!(self.out, "== {} @ {} ==", scene.persona, scene.name)?;
        if let Some(avatar) = &scene.avatar {
            writeln!(self.out, "avatar: {}", avatar)?;
        }
        if let Some(background) = &scene.background {
            writeln!(self.out, "background: {}", background)?;
        }
        if !scene.intro.is_empty() {
            writeln!(self.out, "{}", scene.intro)?;
        }
        Ok(())
    }

    fn open_last_media(&mut self) -> Result<()> {
        let Some(path) = self.last_media.clone() else {
            writeln!(self.out, "No media downloaded yet")?;
            return Ok(());
        };

        if let Err(e) = self.player.open(&path) {
            warn!("Could not open {}: {}", path.display(), e);
            writeln!(self.out, "Could not open {}: {}", path.display(), e)?;
        }
        Ok(())
    }

    pub async fn handle_event(&mut self, event: UiEvent) -> Result<()> {
        match event {
            UiEvent::Chunk { seq, text } => {
                if self.streaming != Some(seq) {
                    self.streaming = Some(seq);
                    write!(self.out, "Assistant: ")?;
                }
                write!(self.out, "{}", text)?;
            }
            UiEvent::MediaDetected { seq, kind, chunk } => {
                self.end_stream_line(seq)?;
                info!("Turn {} carries {} ({} chars)", seq, kind, chunk.len());
                writeln!(self.out, "[{} reply detected, fetching...]", kind)?;
            }
            UiEvent::TurnFinished { seq, outcome } => {
                self.end_stream_line(seq)?;
                self.finish_turn(seq, outcome).await?;
            }
            UiEvent::Ready => writeln!(self.out, "Ready")?,
        }
        self.out.flush()?;
        Ok(())
    }

    fn end_stream_line(&mut self, seq: u64) -> Result<()> {
        if self.streaming == Some(seq) {
            writeln!(self.out)?;
            self.streaming = None;
        }
        Ok(())
    }

    async fn finish_turn(&mut self, seq: u64, outcome: TurnOutcome) -> Result<()> {
        match outcome {
            TurnOutcome::Completed(result) => {
                self.render_media(&result).await?;
                if let Some(scene) = self
                    .scenes
                    .detect(&result.raw_text, &self.config.switch_marker)
                    .cloned()
                {
                    if let Err(e) = self.apply_scene(scene) {
                        warn!("Scene switch failed: {}", e);
                        writeln!(self.out, "Scene switch failed: {}", e)?;
                    }
                }
            }
            TurnOutcome::Failed(result) => {
                writeln!(self.out, "Error: {}", result.content)?;
            }
            TurnOutcome::Interrupted(result) => {
                self.render_media(&result).await?;
                writeln!(self.out, "[reply {} interrupted before completion]", seq)?;
            }
            TurnOutcome::TimedOut => {
                writeln!(self.out, "Timed out (request {} abandoned)", seq)?;
            }
        }
        Ok(())
    }

    async fn render_media(&mut self, result: &StreamResult) -> Result<()> {
        if let Some(path) = &result.audio_path {
            writeln!(self.out, "Audio saved: {} (/open to play)", path.display())?;
            self.last_media = Some(path.clone());
        } else if let Some(path) = &result.image_path {
            match self.previews.make_preview(path).await {
                Ok(preview) => writeln!(
                    self.out,
                    "Image saved: {} (preview {}; /open to view)",
                    path.display(),
                    preview.display()
                )?,
                Err(e) => {
                    warn!("No preview for {}: {}", path.display(), e);
                    writeln!(self.out, "Image saved: {} (/open to view)", path.display())?;
                }
            }
            self.last_media = Some(path.clone());
        } else if result.audio_detected || result.image_detected {
            writeln!(self.out, "{}", result.content)?;
        }
        Ok(())
    }
}
