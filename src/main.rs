use anyhow::Result;
use clap::Parser;
use scene_chat::app::App;
use scene_chat::models::Config;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "scene-chat")]
#[command(about = "Chat with a hosted agent from the terminal")]
struct CliArgs {
    /// Path to the JSON configuration file.
    #[arg(long, default_value = "config.json")]
    config: PathBuf,

    /// User id sent with every request; random when omitted.
    #[arg(long)]
    user: Option<String>,

    /// Scene to start in instead of the configured default.
    #[arg(long)]
    scene: Option<String>,
}

fn default_user_id() -> String {
    format!("user_{}", uuid::Uuid::new_v4().simple())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so they never interleave with the chat transcript.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "scene_chat=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = CliArgs::parse();
    let user_id = args.user.unwrap_or_else(default_user_id);
    info!("Starting scene-chat as {}", user_id);

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let mut app = match App::new(config, user_id) {
        Ok(app) => app,
        Err(e) => {
            error!("Failed to initialize application: {}", e);
            std::process::exit(1);
        }
    };

    if let Some(scene) = &args.scene {
        if let Err(e) = app.enter_scene(scene) {
            error!("{}", e);
            std::process::exit(1);
        }
    }

    match app.run().await {
        Ok(_) => {
            info!("Session closed");
            Ok(())
        }
        Err(e) => {
            error!("Session failed: {}", e);
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_user_id_format() {
        let id = default_user_id();
        assert!(id.starts_with("user_"));
        assert_eq!(id.len(), "user_".len() + 32);
        assert_ne!(id, default_user_id());
    }

    #[test]
    fn test_cli_defaults() {
        let args = CliArgs::parse_from(["scene-chat"]);
        assert_eq!(args.config, PathBuf::from("config.json"));
        assert!(args.user.is_none());
        assert!(args.scene.is_none());
    }

    #[test]
    fn test_cli_overrides() {
        let args =
            CliArgs::parse_from(["scene-chat", "--config", "alt.json", "--scene", "Lakeside"]);
        assert_eq!(args.config, PathBuf::from("alt.json"));
        assert_eq!(args.scene.as_deref(), Some("Lakeside"));
    }
}
