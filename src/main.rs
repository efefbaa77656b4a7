//! Kora - push-to-talk voice client
//!
//! Connects to the agent, then reads commands from stdin:
//! Enter toggles talking, `r` resets the turn, `c` reconnects,
//! `d` disconnects and `q` quits.

use anyhow::Context;
use kora::pulse::{PulseMicrophone, PulseSpeaker};
use kora::transcript::Speaker;
use kora::transport::ConnectionStatus;
use kora::turn::TurnState;
use kora::{Session, SessionConfig, SessionUpdate, UserCommand};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    info!("Starting kora voice client");

    let config = SessionConfig::from_env().context("invalid configuration")?;
    info!("Agent endpoint: {}", config.url());

    let microphone = Arc::new(PulseMicrophone::new(&config));
    let speaker = Arc::new(PulseSpeaker::new(&config).context("failed to start playback thread")?);

    let (session, mut updates) = Session::new(config, microphone, speaker);
    let (handle, session_task) = session.spawn();

    // ------ Updates -> terminal ------
    let meter = handle.meter().clone();
    let printer = tokio::spawn(async move {
        let mut listening = false;
        let mut ticker = tokio::time::interval(Duration::from_millis(500));
        loop {
            tokio::select! {
                update = updates.recv() => {
                    let Some(update) = update else { break };
                    match update {
                        SessionUpdate::Status(status) => match status {
                            ConnectionStatus::Connecting => println!("… connecting"),
                            ConnectionStatus::Connected => {
                                println!("✅ connected. Press Enter to talk.")
                            }
                            ConnectionStatus::Disconnected => {
                                println!("⛔ disconnected. Type c to reconnect.")
                            }
                        },
                        SessionUpdate::Turn(state) => {
                            listening = state == TurnState::Listening;
                            match state {
                                TurnState::Listening => println!("🎤 listening... (Enter to stop)"),
                                TurnState::AwaitingResponse => println!("⏳ waiting for agent"),
                                TurnState::Speaking => println!("🔊 agent speaking"),
                                TurnState::Idle => println!("   ready"),
                            }
                        }
                        SessionUpdate::Transcript(entry) => match entry.speaker {
                            Speaker::User => println!("you:   {}", entry.text),
                            Speaker::Agent => println!("agent: {}", entry.text),
                        },
                        SessionUpdate::Error(message) => eprintln!("❌ {}", message),
                    }
                }
                _ = ticker.tick(), if listening => {
                    let level = meter.sample().level;
                    let bars = (level * 60.0).min(30.0) as usize;
                    println!("   [{:<30}] {:.3}", "#".repeat(bars), level);
                }
            }
        }
    });

    handle.connect();

    // ------ stdin -> commands ------
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut talking = false;
    while let Some(line) = lines.next_line().await? {
        let command = match line.trim() {
            "" => {
                talking = !talking;
                if talking {
                    UserCommand::Press
                } else {
                    UserCommand::Release
                }
            }
            "r" => {
                talking = false;
                UserCommand::Reset
            }
            "c" => UserCommand::Connect,
            "d" => {
                talking = false;
                UserCommand::Disconnect
            }
            "q" => break,
            other => {
                println!("unknown command {:?} (Enter, r, c, d, q)", other);
                continue;
            }
        };
        debug!("stdin command: {:?}", command);
        if !handle.send(command) {
            break;
        }
    }

    handle.shutdown();
    session_task.await.context("session task panicked")?;
    printer.await.context("printer task panicked")?;
    info!("Goodbye");
    Ok(())
}
