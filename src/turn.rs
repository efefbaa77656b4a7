//! Turn-taking state machine
//!
//! Tracks who holds the floor. The controller is pure: it consumes events and
//! queues actions, and the session performs them (capture, playback, sends).
//! It is the only place that knows whether the mic is open or the agent is
//! speaking.

use tracing::{debug, info, warn};

/// Turn states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    /// Nobody is talking
    Idle,
    /// Mic open, user talking
    Listening,
    /// User finished, waiting for the agent
    AwaitingResponse,
    /// Agent audio is queued or playing
    Speaking,
}

/// Inputs to the controller
#[derive(Debug)]
pub enum TurnEvent {
    /// Push-to-talk pressed
    Press { connected: bool },
    /// Push-to-talk released
    Release,
    /// Inbound `audio` segment
    AgentAudio(String),
    /// Inbound `end_of_turn`
    EndOfTurn { playback_idle: bool },
    /// The playback queue ran dry
    PlaybackDrained,
    /// The connection went away
    TransportClosed,
    /// Explicit user reset back to idle
    Reset,
}

/// Effects the owner must carry out, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnAction {
    StartCapture,
    StopCapture,
    /// Send `end_of_speech` once the utterance's audio is flushed
    ScheduleEndOfSpeech,
    /// Append a segment to the playback queue
    Play(String),
    ClearPlayback,
}

pub struct TurnController {
    state: TurnState,
    /// `end_of_turn` arrived while segments were still playing
    end_of_turn_pending: bool,
    /// Actions produced by the last events (drained by the owner)
    actions: Vec<TurnAction>,
}

impl Default for TurnController {
    fn default() -> Self {
        Self::new()
    }
}

impl TurnController {
    pub fn new() -> Self {
        Self {
            state: TurnState::Idle,
            end_of_turn_pending: false,
            actions: Vec::new(),
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    /// Mic is open for the user
    pub fn is_recording(&self) -> bool {
        self.state == TurnState::Listening
    }

    /// Process an event and queue the resulting actions
    pub fn on_event(&mut self, event: TurnEvent) {
        let before = self.state;

        match (self.state, event) {
            (_, TurnEvent::Press { connected: false }) => {
                warn!("Ignoring press while disconnected");
            }

            (TurnState::Idle | TurnState::AwaitingResponse, TurnEvent::Press { .. }) => {
                self.actions.push(TurnAction::StartCapture);
                self.state = TurnState::Listening;
            }

            // Barge-in: the user takes the floor back from the agent
            (TurnState::Speaking, TurnEvent::Press { .. }) => {
                info!("✋ User interrupted agent speech");
                self.actions.push(TurnAction::ClearPlayback);
                self.actions.push(TurnAction::StartCapture);
                self.end_of_turn_pending = false;
                self.state = TurnState::Listening;
            }

            (TurnState::Listening, TurnEvent::Release) => {
                self.actions.push(TurnAction::StopCapture);
                self.actions.push(TurnAction::ScheduleEndOfSpeech);
                self.state = TurnState::AwaitingResponse;
            }

            (TurnState::Idle | TurnState::AwaitingResponse, TurnEvent::AgentAudio(content)) => {
                self.actions.push(TurnAction::Play(content));
                self.end_of_turn_pending = false;
                self.state = TurnState::Speaking;
            }

            // Audio after `end_of_turn` opens a new agent turn, which ends on
            // its own `end_of_turn`
            (TurnState::Speaking, TurnEvent::AgentAudio(content)) => {
                self.actions.push(TurnAction::Play(content));
                self.end_of_turn_pending = false;
            }

            (TurnState::Listening, TurnEvent::AgentAudio(_)) => {
                debug!("Dropping agent audio while the user holds the floor");
            }

            (TurnState::Speaking, TurnEvent::EndOfTurn { playback_idle: true })
            | (TurnState::AwaitingResponse, TurnEvent::EndOfTurn { .. }) => {
                self.end_of_turn_pending = false;
                self.state = TurnState::Idle;
            }

            (TurnState::Speaking, TurnEvent::EndOfTurn { playback_idle: false }) => {
                debug!("End of turn deferred until playback drains");
                self.end_of_turn_pending = true;
            }

            (TurnState::Speaking, TurnEvent::PlaybackDrained) if self.end_of_turn_pending => {
                self.end_of_turn_pending = false;
                self.state = TurnState::Idle;
            }

            (state, TurnEvent::TransportClosed | TurnEvent::Reset) => {
                if state == TurnState::Listening {
                    self.actions.push(TurnAction::StopCapture);
                }
                self.actions.push(TurnAction::ClearPlayback);
                self.end_of_turn_pending = false;
                self.state = TurnState::Idle;
            }

            (state, event) => {
                debug!("Ignoring {:?} in {:?}", event, state);
            }
        }

        if before != self.state {
            info!("🔁 Turn {:?} → {:?}", before, self.state);
        }
    }

    /// Drain all pending actions
    pub fn drain_actions(&mut self) -> Vec<TurnAction> {
        std::mem::take(&mut self.actions)
    }
}
