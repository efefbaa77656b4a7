//! Voice session: composition root and event loop
//!
//! One task owns all session state. Capture chunks, inbound messages,
//! playback completions, flush timers and user commands arrive on channels
//! and are handled one at a time, so nothing here needs a lock.

use crate::capture::{AudioChunk, AudioSource, CaptureEvent, LevelMeter, MicrophoneSource};
use crate::codec::encode_chunk;
use crate::config::SessionConfig;
use crate::error::KoraError;
use crate::playback::{AudioSink, PlaybackDone, PlaybackQueue};
use crate::protocol::Message;
use crate::transcript::{Speaker, Transcript, TranscriptEntry};
use crate::transport::{ConnectionStatus, DuplexTransport, TransportEvent};
use crate::turn::{TurnAction, TurnController, TurnEvent, TurnState};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// User gestures and lifecycle requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserCommand {
    Connect,
    Disconnect,
    /// Push-to-talk down
    Press,
    /// Push-to-talk up
    Release,
    /// Abandon the current turn and go idle
    Reset,
    Shutdown,
}

/// What the UI gets to see
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    Status(ConnectionStatus),
    Turn(TurnState),
    Transcript(TranscriptEntry),
    /// Something the user has to know about
    Error(String),
}

#[derive(Debug)]
enum SessionEvent {
    Chunk(AudioChunk),
    /// The microphone broke while the user was talking
    CaptureFailed { utterance: u64, error: KoraError },
    Transport(TransportEvent),
    /// Every chunk of the utterance has been sent; start the grace delay
    ArmFlush { utterance: u64 },
    /// Time to send the utterance's `end_of_speech`
    FlushElapsed { utterance: u64 },
}

/// Cheap handle for driving a running session
#[derive(Clone)]
pub struct SessionHandle {
    commands: UnboundedSender<UserCommand>,
    meter: LevelMeter,
}

impl SessionHandle {
    /// Queue a command. Returns `false` once the session has ended.
    pub fn send(&self, command: UserCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn connect(&self) -> bool {
        self.send(UserCommand::Connect)
    }

    pub fn press(&self) -> bool {
        self.send(UserCommand::Press)
    }

    pub fn release(&self) -> bool {
        self.send(UserCommand::Release)
    }

    pub fn shutdown(&self) -> bool {
        self.send(UserCommand::Shutdown)
    }

    /// Live microphone level for visualizers
    pub fn meter(&self) -> &LevelMeter {
        &self.meter
    }
}

pub struct Session {
    config: SessionConfig,
    transport: DuplexTransport,
    capture: AudioSource,
    playback: PlaybackQueue,
    turn: TurnController,
    transcript: Transcript,

    events_tx: UnboundedSender<SessionEvent>,
    events_rx: Option<UnboundedReceiver<SessionEvent>>,
    playback_rx: Option<UnboundedReceiver<PlaybackDone>>,
    updates: UnboundedSender<SessionUpdate>,

    /// Utterance whose audio is being (or was last) captured
    utterance: Option<u64>,
    /// Utterances still owed an `end_of_speech`
    pending_flush: Vec<u64>,
    reported_status: ConnectionStatus,
    reported_turn: TurnState,
}

impl Session {
    pub fn new(
        config: SessionConfig,
        microphone: Arc<dyn MicrophoneSource>,
        sink: Arc<dyn AudioSink>,
    ) -> (Self, UnboundedReceiver<SessionUpdate>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (playback_tx, playback_rx) = mpsc::unbounded_channel();
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();

        let session = Self {
            capture: AudioSource::new(microphone, &config),
            playback: PlaybackQueue::new(sink, playback_tx),
            transport: DuplexTransport::new(),
            turn: TurnController::new(),
            transcript: Transcript::new(),
            config,
            events_tx,
            events_rx: Some(events_rx),
            playback_rx: Some(playback_rx),
            updates: updates_tx,
            utterance: None,
            pending_flush: Vec::new(),
            reported_status: ConnectionStatus::Disconnected,
            reported_turn: TurnState::Idle,
        };
        (session, updates_rx)
    }

    /// Run the session on its own task.
    pub fn spawn(self) -> (SessionHandle, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let handle = SessionHandle {
            commands: commands_tx,
            meter: self.capture.meter(),
        };
        let task = tokio::spawn(self.run(commands_rx));
        (handle, task)
    }

    /// Event loop. Returns after `Shutdown` or when every command sender is gone.
    pub async fn run(mut self, mut commands: UnboundedReceiver<UserCommand>) {
        let (Some(mut events_rx), Some(mut playback_rx)) =
            (self.events_rx.take(), self.playback_rx.take())
        else {
            error!("Session event loop started twice");
            return;
        };

        info!("Voice session started");
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(UserCommand::Shutdown) | None => break,
                    Some(command) => self.on_command(command).await,
                },
                Some(event) = events_rx.recv() => self.on_event(event).await,
                Some(done) = playback_rx.recv() => self.on_playback_done(done).await,
            }
            self.report();
        }

        self.teardown().await;
        self.report();
        info!("Voice session stopped");
    }

    async fn on_command(&mut self, command: UserCommand) {
        debug!("User command: {:?}", command);
        match command {
            UserCommand::Connect => self.connect().await,
            UserCommand::Disconnect => self.teardown().await,
            UserCommand::Press => {
                let connected = self.transport.is_connected();
                self.turn.on_event(TurnEvent::Press { connected });
                self.apply_turn_actions().await;
            }
            UserCommand::Release => {
                self.turn.on_event(TurnEvent::Release);
                self.apply_turn_actions().await;
            }
            UserCommand::Reset => {
                self.turn.on_event(TurnEvent::Reset);
                self.apply_turn_actions().await;
            }
            UserCommand::Shutdown => {}
        }
    }

    async fn connect(&mut self) {
        if self.transport.status() != ConnectionStatus::Disconnected {
            debug!("Already connected or connecting");
            return;
        }

        self.set_status(ConnectionStatus::Connecting);
        let events_tx = self.events_tx.clone();
        let url = self.config.url();
        let result = self
            .transport
            .connect(&url, self.config.connect_timeout, move |event| {
                events_tx.send(SessionEvent::Transport(event)).is_ok()
            })
            .await;

        match result {
            Ok(_) => {
                self.transcript.clear();
                self.set_status(ConnectionStatus::Connected);
            }
            Err(e) => {
                error!("Failed to connect to agent: {}", e);
                self.notify(SessionUpdate::Error(format!("Failed to connect: {}", e)));
                self.set_status(ConnectionStatus::Disconnected);
            }
        }
    }

    async fn on_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Chunk(chunk) => {
                if let Some(msg) = encode_chunk(&chunk) {
                    debug!(
                        "🎤 Sending chunk {} of utterance {} ({} bytes)",
                        chunk.seq,
                        chunk.utterance,
                        chunk.pcm.len()
                    );
                    self.transport.send(&msg);
                }
            }
            SessionEvent::CaptureFailed { utterance, error } => {
                self.on_capture_failed(utterance, error).await;
            }
            SessionEvent::ArmFlush { utterance } => {
                if self.pending_flush.contains(&utterance) {
                    let events_tx = self.events_tx.clone();
                    let delay = self.config.flush_delay;
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = events_tx.send(SessionEvent::FlushElapsed { utterance });
                    });
                }
            }
            SessionEvent::FlushElapsed { utterance } => {
                if let Some(pos) = self.pending_flush.iter().position(|&u| u == utterance) {
                    self.pending_flush.remove(pos);
                    self.transport.send(&Message::EndOfSpeech {});
                } else {
                    debug!("Flush for utterance {} no longer pending", utterance);
                }
            }
            SessionEvent::Transport(event) => {
                if event.connection() != self.transport.connection_id()
                    || !self.transport.is_connected()
                {
                    debug!("Ignoring event from stale connection {}", event.connection());
                    return;
                }
                match event {
                    TransportEvent::Message { message, .. } => self.route(message).await,
                    TransportEvent::Closed { reason, .. } => self.on_transport_closed(reason).await,
                }
            }
        }
    }

    /// Dispatch one inbound message
    async fn route(&mut self, message: Message) {
        match message {
            Message::Text { content } => self.append_transcript(Speaker::Agent, &content),
            Message::Transcript { content } => self.append_transcript(Speaker::User, &content),
            Message::Audio { content } => {
                self.turn.on_event(TurnEvent::AgentAudio(content));
                self.apply_turn_actions().await;
            }
            Message::EndOfTurn {} => {
                let playback_idle = self.playback.is_idle();
                self.turn.on_event(TurnEvent::EndOfTurn { playback_idle });
                self.apply_turn_actions().await;
            }
            // Dropped by the transport
            Message::AudioInput { .. } | Message::EndOfSpeech {} => {}
        }
    }

    async fn on_playback_done(&mut self, done: PlaybackDone) {
        if self.playback.on_complete(done) && self.playback.is_idle() {
            self.turn.on_event(TurnEvent::PlaybackDrained);
            self.apply_turn_actions().await;
        }
    }

    async fn on_transport_closed(&mut self, reason: Option<String>) {
        warn!(
            "Connection to agent lost{}",
            reason.as_deref().map(|r| format!(": {}", r)).unwrap_or_default()
        );
        self.transport.mark_closed();
        self.pending_flush.clear();
        self.turn.on_event(TurnEvent::TransportClosed);
        self.apply_turn_actions().await;
        self.set_status(ConnectionStatus::Disconnected);
        self.notify(SessionUpdate::Error(KoraError::TransportClosed.to_string()));
    }

    async fn apply_turn_actions(&mut self) {
        for action in self.turn.drain_actions() {
            match action {
                TurnAction::StartCapture => self.start_capture().await,
                TurnAction::StopCapture => self.capture.stop().await,
                TurnAction::ScheduleEndOfSpeech => self.schedule_end_of_speech(),
                TurnAction::Play(content) => self.playback.enqueue(content),
                TurnAction::ClearPlayback => self.playback.clear(),
            }
        }
    }

    async fn start_capture(&mut self) {
        // A new utterance closes the previous ones on the wire before its
        // own audio goes out
        for utterance in self.pending_flush.clone() {
            debug!("Ending utterance {} early", utterance);
            let _ = self.events_tx.send(SessionEvent::FlushElapsed { utterance });
        }

        let events_tx = self.events_tx.clone();
        let started = self
            .capture
            .start(move |event| {
                let event = match event {
                    CaptureEvent::Chunk(chunk) => SessionEvent::Chunk(chunk),
                    CaptureEvent::Failed { utterance, error } => {
                        SessionEvent::CaptureFailed { utterance, error }
                    }
                };
                events_tx.send(event).is_ok()
            })
            .await;

        match started {
            Ok(utterance) => self.utterance = Some(utterance),
            Err(e) => {
                error!("Failed to start capture: {}", e);
                self.notify(SessionUpdate::Error(microphone_error(&e)));
                // Mic never opened, so the user does not hold the floor
                self.turn.on_event(TurnEvent::Reset);
                self.turn.drain_actions();
            }
        }
    }

    /// The mic died mid-utterance. What was captured still counts as the
    /// user's turn, so it is closed like a release.
    async fn on_capture_failed(&mut self, utterance: u64, error: KoraError) {
        if self.capture.utterance() != Some(utterance) || !self.turn.is_recording() {
            debug!("Ignoring failure of finished utterance {}", utterance);
            return;
        }
        error!("Microphone failed during utterance {}: {}", utterance, error);
        self.notify(SessionUpdate::Error(microphone_error(&error)));
        self.turn.on_event(TurnEvent::Release);
        self.apply_turn_actions().await;
    }

    /// Arrange for `end_of_speech` after the grace delay.
    ///
    /// Capture has already been stopped (its thread joined), so every chunk
    /// of the utterance is queued on the event channel. The delay starts once
    /// the loop has worked through them.
    fn schedule_end_of_speech(&mut self) {
        let Some(utterance) = self.utterance else {
            warn!("No utterance to end");
            return;
        };
        self.pending_flush.push(utterance);
        let _ = self.events_tx.send(SessionEvent::ArmFlush { utterance });
    }

    fn append_transcript(&mut self, speaker: Speaker, text: &str) {
        if let Some(entry) = self.transcript.append(speaker, text) {
            info!("💬 {:?}: {}", entry.speaker, entry.text);
            let entry = entry.clone();
            self.notify(SessionUpdate::Transcript(entry));
        }
    }

    /// Stop capture, clear playback, close the connection. Each step runs
    /// regardless of the others.
    async fn teardown(&mut self) {
        self.turn.on_event(TurnEvent::TransportClosed);
        self.turn.drain_actions();

        self.capture.stop().await;
        self.playback.clear();
        if self.transport.is_connected() {
            info!(
                "Closing agent connection ({} sent, {} dropped)",
                self.transport.sent_count(),
                self.transport.dropped_count()
            );
        }
        self.transport.close();

        self.pending_flush.clear();
        self.set_status(ConnectionStatus::Disconnected);
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        if self.reported_status != status {
            info!("Connection status: {:?}", status);
            self.reported_status = status;
            self.notify(SessionUpdate::Status(status));
        }
    }

    /// Publish a turn change, if any
    fn report(&mut self) {
        let state = self.turn.state();
        if self.reported_turn != state {
            self.reported_turn = state;
            self.notify(SessionUpdate::Turn(state));
        }
    }

    fn notify(&self, update: SessionUpdate) {
        // Nobody listening is fine
        let _ = self.updates.send(update);
    }
}

fn microphone_error(error: &KoraError) -> String {
    if error.is_device_error() {
        format!("Microphone unavailable: {}", error)
    } else {
        format!("Microphone failed: {}", error)
    }
}
