use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use inference_session::server::run_server;
use inference_session::session::{default_batch, OutputOptions, PromptInput, RequestOptions};
use inference_session::{InferenceSession, LoopbackLauncher, ProcessTopology, SessionError, SessionSettings};

/// Drives a batched generation engine over a fixed prompt set or a TCP session.
#[derive(Parser)]
#[command(name = "inference-session", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a fixed set of prompts to completion and print one JSON result per line.
    Batch {
        /// Directory holding config.json and the engine artifacts.
        #[arg(long)]
        engine_dir: PathBuf,

        /// Prompt text; repeat for several requests. Defaults to the built-in prompt set.
        #[arg(long)]
        input_text: Vec<String>,

        /// Token budget per request (the built-in set adds the request index).
        #[arg(long)]
        max_new_tokens: Option<u32>,

        #[arg(long, default_value_t = true, action = ArgAction::Set)]
        streaming: bool,

        #[arg(long, default_value_t = 1)]
        num_beams: u32,

        #[arg(long)]
        return_log_probs: bool,

        /// trace, debug, info, warning or error.
        #[arg(long, default_value = "info")]
        log_level: String,

        /// Optional TOML file with a [session] table.
        #[arg(long)]
        settings: Option<PathBuf>,
    },
    /// Accept requests over TCP until a SHUTDOWN command arrives.
    Serve {
        #[arg(long)]
        engine_dir: PathBuf,

        #[arg(long)]
        port: u16,

        #[arg(long, default_value = "info")]
        log_level: String,

        #[arg(long)]
        settings: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
}

impl FromStr for LogLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warning" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            other => anyhow::bail!(
                "unsupported log level '{}' (expected trace, debug, info, warning or error)",
                other
            ),
        }
    }
}

impl LogLevel {
    fn directive(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
        }
    }
}

fn init_logging(level: &str) -> anyhow::Result<()> {
    let level: LogLevel = level.parse()?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.directive()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn load_settings(path: Option<&Path>) -> anyhow::Result<SessionSettings> {
    match path {
        Some(path) => Ok(SessionSettings::load(path)?),
        None => Ok(SessionSettings::default()),
    }
}

fn run_batch_mode(
    engine_dir: &Path,
    settings: SessionSettings,
    input_text: Vec<String>,
    options: RequestOptions,
) -> anyhow::Result<()> {
    let prompts = if input_text.is_empty() {
        let settings = SessionSettings {
            default_max_new_tokens: options.max_new_tokens,
            ..settings.clone()
        };
        default_batch(&settings, &options)
    } else {
        input_text
            .into_iter()
            .map(|text| (PromptInput::Text(text), options.clone()))
            .collect()
    };

    let mut session = InferenceSession::initialize(engine_dir, settings, &LoopbackLauncher)?;
    let results = session.run_prompts(prompts)?;
    session.shutdown();

    for result in &results {
        let line = serde_json::to_string(&result.to_record()).context("cannot serialize result")?;
        println!("{}", line);
    }
    let failed = results.iter().filter(|r| r.is_error()).count();
    tracing::info!(results = results.len(), failed, "batch complete");
    Ok(())
}

fn run_serve_mode(engine_dir: &Path, settings: SessionSettings, port: u16) -> anyhow::Result<()> {
    let host = settings.listen_host.clone();
    let session = InferenceSession::initialize(engine_dir, settings, &LoopbackLauncher)?;
    let listener = TcpListener::bind((host.as_str(), port))
        .with_context(|| format!("cannot listen on {}:{}", host, port))?;
    run_server(session, listener, Arc::new(AtomicBool::new(false)))?;
    Ok(())
}

fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Batch {
            engine_dir,
            input_text,
            max_new_tokens,
            streaming,
            num_beams,
            return_log_probs,
            log_level,
            settings,
        } => {
            init_logging(&log_level)?;
            tracing::info!("{}", ProcessTopology::from_env());
            let settings = load_settings(settings.as_deref())?;
            let options = RequestOptions {
                max_new_tokens: max_new_tokens.unwrap_or(settings.default_max_new_tokens),
                streaming,
                num_beams,
                output: OutputOptions {
                    return_log_probs,
                    exclude_input_from_output: false,
                },
                ..RequestOptions::default()
            };
            run_batch_mode(&engine_dir, settings, input_text, options)
        }
        Command::Serve {
            engine_dir,
            port,
            log_level,
            settings,
        } => {
            init_logging(&log_level)?;
            tracing::info!("{}", ProcessTopology::from_env());
            let settings = load_settings(settings.as_deref())?;
            run_serve_mode(&engine_dir, settings, port)
        }
    }
}

/// 1 for anything that fails before the engine runs, 2 once it is running.
fn exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<SessionError>() {
        Some(e) if !e.is_startup() => 2,
        _ => 1,
    }
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::from(exit_code(&e))
        }
    }
}
