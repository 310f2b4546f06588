use std::fs::File;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use clap::Parser;
use konexion::core::config::{self, CliOverrides, ResolvedConfig};
use konexion::core::registry::ModelRegistry;
use konexion::core::relay::BatchPolicy;
use konexion::core::session::ChatSession;
use konexion::core::vision::VisionPolicy;
use konexion::inference::{ChatProvider, GroqProvider, OllamaProvider};
use konexion::server::{self, AppState};
use simplelog::{
    ColorChoice, CombinedLogger, ConfigBuilder, LevelFilter, SharedLogger, TermLogger,
    TerminalMode, WriteLogger,
};

#[derive(Parser)]
#[command(name = "konexion", about = "Streaming chat backend for Groq and Ollama models")]
struct Args {
    /// Address to bind
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Config file (defaults to ~/.konexion/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// off, error, warn, info, debug or trace
    #[arg(long)]
    log_level: Option<String>,

    /// Skip fetching model listings at startup
    #[arg(long)]
    no_preload: bool,
}

fn init_logging(config: &ResolvedConfig) {
    let (level, bad_level) = match LevelFilter::from_str(&config.log_level) {
        Ok(level) => (level, false),
        Err(_) => (LevelFilter::Info, true),
    };
    let log_config = ConfigBuilder::new().set_time_format_rfc3339().build();

    let mut loggers: Vec<Box<dyn SharedLogger>> = Vec::new();
    loggers.push(TermLogger::new(
        level,
        log_config.clone(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    ));
    if let Some(path) = config.log_file.as_deref() {
        match File::create(path) {
            Ok(log_file) => loggers.push(WriteLogger::new(level, log_config, log_file)),
            Err(e) => eprintln!("konexion: cannot open log file {path}: {e}"),
        }
    }
    let _ = CombinedLogger::init(loggers);

    if bad_level {
        log::warn!("Unknown log level '{}', using info", config.log_level);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    dotenv::dotenv().ok();

    let file_config = config::load_config(args.config.as_deref())?;
    let resolved = config::resolve(
        &file_config,
        &CliOverrides {
            host: args.host,
            port: args.port,
            log_level: args.log_level,
        },
    );
    init_logging(&resolved);

    log::info!("Konexion starting up");
    if resolved.groq_api_key.is_none() {
        log::warn!("GROQ_API_KEY is not set; Groq models will be unavailable");
    }

    let providers: Vec<Arc<dyn ChatProvider>> = vec![
        Arc::new(GroqProvider::new(
            resolved.groq_api_key.clone(),
            Some(resolved.groq_base_url.clone()),
            resolved.groq_timeout,
        )),
        Arc::new(OllamaProvider::new(
            Some(resolved.ollama_base_url.clone()),
            resolved.ollama_timeout,
            resolved.ollama_max_tokens,
        )),
    ];
    let registry = Arc::new(ModelRegistry::new(providers));

    if args.no_preload {
        log::info!("Skipping model preload; listings load on first use");
    } else {
        registry.preload().await;
    }

    let session = Arc::new(ChatSession::new(
        registry,
        VisionPolicy::new(resolved.vision_models.clone()),
        resolved.system_prompt.clone(),
        BatchPolicy::default(),
    ));

    server::serve(
        AppState::new(session),
        &resolved.host,
        resolved.port,
        &resolved.cors_origins,
    )
    .await?;

    log::info!("Konexion stopped");
    Ok(())
}
