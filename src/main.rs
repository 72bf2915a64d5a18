//! kite: interactive assistant with speech output.

use std::io::{BufReader, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use kite_speech::assistant::{spawn_line_reader, Assistant, ReplySpeech, Turn};
use kite_speech::config::{BackendKind, Config};
use kite_speech::pipeline::{EchoPipeline, OllamaPipeline, Pipeline};
use kite_speech::router::SpeechMode;
use kite_speech::speaker::api::{start_api, SpeechApiState};
use kite_speech::speaker::{HistoryLog, PlaybackController, SpeakSkill};
use kite_speech::tts::EngineFactory;
use kite_speech::SpeechError;

#[derive(Parser, Debug)]
#[command(name = "kite", about = "Conversational assistant with speech output")]
struct Args {
    /// Path to kite.yaml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose (debug) logging
    #[arg(short, long)]
    verbose: bool,

    /// Start without speech output
    #[arg(long)]
    no_speech: bool,

    /// Speak every reply from the first turn
    #[arg(long)]
    speech_mode: bool,

    /// Voice name or id
    #[arg(long)]
    voice: Option<String>,

    /// Speaking rate in words per minute (80-500)
    #[arg(long)]
    rate: Option<u32>,

    /// Output volume (0.0-1.0)
    #[arg(long)]
    volume: Option<f32>,

    /// Speech backend: auto, command, rodio or simulated
    #[arg(long)]
    backend: Option<String>,

    /// Enable the local control API on this port
    #[arg(long)]
    api_port: Option<u16>,

    #[command(subcommand)]
    command: Option<Cmd>,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Print the speech history report for a day
    Report {
        /// YYYY-MM-DD, defaults to today
        date: Option<String>,
    },
}

fn apply_overrides(config: &mut Config, args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    if args.no_speech {
        config.speech.enabled = false;
    }
    if args.speech_mode {
        config.speech.speech_mode = true;
    }
    if let Some(voice) = &args.voice {
        config.speech.voice = Some(voice.clone());
    }
    if let Some(rate) = args.rate {
        config.speech.rate = rate;
    }
    if let Some(volume) = args.volume {
        config.speech.volume = volume;
    }
    if let Some(backend) = &args.backend {
        config.speech.backend =
            BackendKind::from_str(backend).ok_or_else(|| format!("unknown backend '{backend}'"))?;
    }
    if let Some(port) = args.api_port {
        config.api.enabled = true;
        config.api.port = port;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Logs go to stderr; stdout carries the conversation.
    let default_filter = if args.verbose { "debug,hyper=info,reqwest=info" } else { "info,hyper=warn,reqwest=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut config = Config::load(args.config.as_deref());
    apply_overrides(&mut config, &args)?;

    if let Some(Cmd::Report { date }) = &args.command {
        let Some(dir) = config.history.resolved_dir() else {
            return Err("speech history is disabled".into());
        };
        println!("{}", HistoryLog::new(dir).report(date.as_deref().unwrap_or("today")));
        return Ok(());
    }

    info!("kite starting");

    let factory = EngineFactory::new();
    let skill = start_speech(&factory, &config)?;
    let speech_mode = SpeechMode::new(config.speech.speech_mode && skill.is_some());

    if config.api.enabled {
        match &skill {
            Some(skill) => {
                let state = SpeechApiState {
                    skill: skill.clone(),
                    speech_mode: speech_mode.clone(),
                };
                start_api(state, config.api.port).await;
            }
            None => warn!("Speech API not started: speech output is unavailable"),
        }
    }

    let barge_in = config.speech.barge_in;
    if config.pipeline.enabled {
        info!("Replies from Ollama model '{}'", config.pipeline.model);
        let pipeline = OllamaPipeline::new(config.pipeline.clone());
        run(Assistant::new(skill, pipeline, speech_mode).with_barge_in(barge_in)).await
    } else {
        info!("Pipeline disabled, echoing requests");
        run(Assistant::new(skill, EchoPipeline, speech_mode).with_barge_in(barge_in)).await
    }
}

/// Acquire the engine and start playback. `None` means text-only operation.
fn start_speech(factory: &EngineFactory, config: &Config) -> Result<Option<SpeakSkill>, Box<dyn std::error::Error>> {
    if !config.speech.enabled {
        info!("Speech output disabled");
        return Ok(None);
    }

    let session = match factory.initialize(&config.speech) {
        Ok(s) => s,
        Err(SpeechError::AlreadyInitialized) => return Err(SpeechError::AlreadyInitialized.into()),
        Err(e) => {
            warn!("{e}");
            println!("[System] Speech output unavailable ({e}); continuing text-only.");
            return Ok(None);
        }
    };

    let history = config.history.resolved_dir().map(HistoryLog::new);
    let controller = PlaybackController::start(session, history)?;
    Ok(Some(SpeakSkill::new(Arc::new(controller))))
}

async fn run<P: Pipeline>(assistant: Assistant<P>) -> Result<(), Box<dyn std::error::Error>> {
    let lines = spawn_line_reader(BufReader::new(std::io::stdin()))?;
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Ctrl-C handler unavailable: {e}");
            std::future::pending::<()>().await;
        }
    };

    prompt();
    assistant
        .serve(lines, interrupt, |turn| {
            let go_on = show(turn);
            if go_on {
                prompt();
            }
            go_on
        })
        .await;
    Ok(())
}

fn prompt() {
    print!("> ");
    let _ = std::io::stdout().flush();
}

/// Print the outcome of a turn. Returns false when the loop should end.
fn show(turn: Turn) -> bool {
    match turn {
        Turn::Empty => {}
        Turn::Spoken { confirmation, .. } => println!("{confirmation}"),
        Turn::NotSpoken { text, error } => {
            println!("[System] Could not speak ({error}). Text: {text}");
        }
        Turn::Reply { text, speech } => {
            println!("{text}");
            if let ReplySpeech::Failed(e) = speech {
                println!("[System] Reply not spoken: {e}");
            }
        }
        Turn::PipelineFailed(e) => println!("[System] {e}"),
        Turn::SpeechMode { enabled, available } => {
            if !available {
                println!("[System] Speech output is unavailable; speech mode stays off.");
            } else {
                println!("[System] Speech mode {}.", if enabled { "enabled" } else { "disabled" });
            }
        }
        Turn::Stopped { cancelled } => println!("[System] Stopped ({cancelled} cancelled)."),
        Turn::Configured(settings) => println!(
            "[System] Voice: {}, rate {} wpm, volume {:.2}",
            settings.voice.as_deref().unwrap_or("default"),
            settings.rate,
            settings.volume
        ),
        Turn::Rejected(e) => println!("[System] {e}"),
        Turn::Exit => return false,
    }
    true
}
