//! Command-line entry point: start a conversation, show live phase and
//! spectrum, and print the transcript on exit.

use std::io::IsTerminal;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use charla::audio::visualizer::Visualizer;
use charla::{
    Proficiency, ProviderKind, ScenarioConfig, Session, SessionStatus, TargetLanguage,
};

#[derive(Parser, Debug)]
#[command(name = "charla", about = "Realtime voice conversation practice", version)]
struct Cli {
    /// Scenario config file (TOML). Flags below override its fields.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Provider: openai_realtime or gemini_live.
    #[arg(long)]
    provider: Option<String>,

    /// Target language code (es, en, fr, de, it, pt).
    #[arg(long)]
    language: Option<String>,

    /// Proficiency level: beginner, intermediate, advanced.
    #[arg(long)]
    level: Option<String>,

    /// Assistant voice id.
    #[arg(long)]
    voice: Option<String>,

    /// Persona for the assistant.
    #[arg(long)]
    persona: Option<String>,

    /// Conversation topic.
    #[arg(long)]
    topic: Option<String>,

    /// Gently correct learner mistakes.
    #[arg(long)]
    corrections: bool,

    /// Disable the spectrum visualizer.
    #[arg(long)]
    no_visualizer: bool,
}

impl Cli {
    fn into_scenario(self) -> anyhow::Result<ScenarioConfig> {
        let mut config = match &self.config {
            Some(path) => ScenarioConfig::load(path)?,
            None => ScenarioConfig::default(),
        };

        if let Some(provider) = &self.provider {
            config.provider = match provider.as_str() {
                "openai_realtime" | "openai" => ProviderKind::OpenAiRealtime,
                "gemini_live" | "gemini" => ProviderKind::GeminiLive,
                other => anyhow::bail!("Unknown provider: {other}"),
            };
        }
        if let Some(code) = &self.language {
            config.target_language = TargetLanguage::from_str_code(code)
                .with_context(|| format!("Unknown language code: {code}"))?;
        }
        if let Some(level) = &self.level {
            config.proficiency = Proficiency::from_str_code(level)
                .with_context(|| format!("Unknown proficiency: {level}"))?;
        }
        if let Some(voice) = self.voice {
            config.voice = voice;
        }
        if self.persona.is_some() {
            config.persona = self.persona;
        }
        if self.topic.is_some() {
            config.topic = self.topic;
        }
        if self.corrections {
            config.corrections = true;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("charla=info")),
        )
        .with_ansi(std::io::stderr().is_terminal())
        .with_writer(std::io::stderr)
        .init();

    let no_visualizer = cli.no_visualizer;
    let config = cli.into_scenario()?;
    info!(
        provider = ?config.provider,
        language = config.target_language.as_str(),
        level = config.proficiency.as_str(),
        "Starting conversation"
    );

    let mut session = Session::new(config);
    let mut status = session.status();
    session.start().await?;

    let visualizer = if no_visualizer {
        None
    } else {
        session
            .analyzer_slot()
            .map(|slot| Visualizer::spawn(slot, std::io::stdout(), 32))
    };

    // Phase changes go to stderr so they interleave with the logs, not
    // the visualizer row.
    let status_task = tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let snapshot = *status.borrow_and_update();
            match snapshot.phase {
                Some(phase) => info!(status = ?snapshot.status, phase = ?phase, "Session state"),
                None => info!(status = ?snapshot.status, "Session state"),
            }
            if matches!(
                snapshot.status,
                SessionStatus::Closed | SessionStatus::Error
            ) {
                break;
            }
        }
    });

    eprintln!("Commands: m = toggle mute, q = quit (or Ctrl-C)");
    let mut muted = false;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line.ok().flatten().as_deref().map(str::trim) {
                    Some("m") => {
                        muted = !muted;
                        session.set_muted(muted);
                        eprintln!("Microphone {}", if muted { "muted" } else { "live" });
                    }
                    Some("q") | None => break,
                    Some(_) => {}
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.stop().await;
    if let Some(visualizer) = &visualizer {
        visualizer.stop();
    }
    status_task.abort();

    let transcript = session.transcript();
    if !transcript.is_empty() {
        println!("\n── Transcript ──");
        for entry in &transcript {
            let speaker = match entry.role {
                charla::session::Role::User => "you",
                charla::session::Role::Assistant => "bot",
            };
            println!("[{speaker}] {}", entry.text);
        }
    }

    Ok(())
}
