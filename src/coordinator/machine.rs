//! The conversation state machine
//!
//! Transitions are computed under one lock and produce a list of effects;
//! the effects run after the lock is released.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{mpsc, watch};

use super::peripherals::Peripherals;
use super::state::{ConversationState, DisplayState};
use crate::config::Config;
use crate::feedback::FeedbackEvent;
use crate::playback::PlaybackEvent;
use crate::shutdown::Shutdown;
use crate::vad::ConversationContext;
use crate::{Error, Result};

/// Inputs that may move the conversation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorEvent {
    /// Button or API request to start listening
    UserTrigger,
    /// Stop TTS playback now
    Interrupt,
    /// Leave the error state
    Reset,
    /// Local trigger; starts listening only while the server is unreachable
    LocalWakeWord { detection_id: u32 },
    WakeWordConfirmed { detection_id: u32 },
    SpeechStarted,
    SpeechEnded,
    /// Server is working on a response
    ServerThinking,
    /// First TTS chunk accepted by the jitter buffer
    TtsStarted,
    PlaybackDrained {
        return_to_listening: bool,
        cooldown_ms: u32,
    },
    PlaybackInterrupted,
    CodecFault(String),
    TransportConnected,
    TransportDisconnected,
    TransportFailed { consecutive_failures: u32 },
    TransportGaveUp,
    /// No server endpoint known
    Searching,
}

impl CoordinatorEvent {
    /// Translate a playback milestone
    #[must_use]
    pub fn from_playback(event: &PlaybackEvent) -> Option<Self> {
        match event {
            PlaybackEvent::FirstChunk { .. } => Some(Self::TtsStarted),
            PlaybackEvent::Drained { actions, .. } => {
                let (return_to_listening, cooldown_ms) =
                    actions.map_or((false, 0), |a| (a.return_to_listening, a.cooldown_period_ms));
                Some(Self::PlaybackDrained {
                    return_to_listening,
                    cooldown_ms,
                })
            }
            PlaybackEvent::Interrupted => Some(Self::PlaybackInterrupted),
            PlaybackEvent::SessionStarted { .. } => None,
        }
    }

    /// Translate a feedback outcome
    #[must_use]
    pub const fn from_feedback(event: &FeedbackEvent) -> Option<Self> {
        match event {
            FeedbackEvent::WakeWordConfirmed { detection_id } => Some(Self::WakeWordConfirmed {
                detection_id: *detection_id,
            }),
            _ => None,
        }
    }
}

/// Side effect of a transition
#[derive(Debug, Clone, PartialEq, Eq)]
enum Effect {
    Microphone(bool),
    Speaker(bool),
    VadContext(ConversationContext),
    Display(DisplayState),
    StopPlayback,
}

/// Coordinator counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CoordinatorStats {
    pub state: ConversationState,
    pub sessions_started: u64,
    pub sessions_completed: u64,
    pub sessions_interrupted: u64,
    pub transitions: u64,
    pub rejected_transitions: u64,
    pub errors: u64,
    pub transport_failures: u32,
    pub connected: bool,
    pub last_error: Option<String>,
}

struct Machine {
    state: ConversationState,
    silence_timeout: Option<Duration>,
    auto_start_after_tts: bool,
    max_transport_failures: u32,
    silence_deadline: Option<Instant>,
    cooldown_until: Option<Instant>,
    error_since: Option<Instant>,
    stats: CoordinatorStats,
}

impl Machine {
    fn new(config: &Config) -> Self {
        let silence_ms = config.audio.silence_timeout_ms;
        Self {
            state: ConversationState::Idle,
            silence_timeout: (silence_ms > 0).then(|| Duration::from_millis(u64::from(silence_ms))),
            auto_start_after_tts: config.audio.auto_start_after_tts,
            max_transport_failures: config.coordinator.max_transport_failures,
            silence_deadline: None,
            cooldown_until: None,
            error_since: None,
            stats: CoordinatorStats::default(),
        }
    }

    fn move_to(
        &mut self,
        to: ConversationState,
        now: Instant,
        reason: &str,
        effects: &mut Vec<Effect>,
    ) -> Result<()> {
        let from = self.state;
        if !from.can_move_to(to) {
            self.stats.rejected_transitions += 1;
            return Err(Error::InvalidInput(format!(
                "transition {from} -> {to} is not allowed"
            )));
        }

        match from {
            ConversationState::Listening => {
                effects.push(Effect::Microphone(false));
                self.silence_deadline = None;
            }
            ConversationState::Speaking => {
                effects.push(Effect::Speaker(false));
                self.cooldown_until = None;
            }
            ConversationState::Error => self.error_since = None,
            ConversationState::Idle | ConversationState::Processing => {}
        }

        effects.push(Effect::VadContext(to.vad_context()));
        match to {
            ConversationState::Idle => {
                effects.push(Effect::Microphone(false));
                effects.push(Effect::Speaker(false));
                effects.push(Effect::Display(self.idle_display()));
            }
            ConversationState::Listening => {
                effects.push(Effect::Microphone(true));
                effects.push(Effect::Display(DisplayState::Listening));
                self.silence_deadline = self.silence_timeout.map(|t| now + t);
                if from == ConversationState::Idle {
                    self.stats.sessions_started += 1;
                }
            }
            ConversationState::Processing => {
                effects.push(Effect::Microphone(false));
                effects.push(Effect::Display(DisplayState::Processing));
            }
            ConversationState::Speaking => {
                effects.push(Effect::Speaker(true));
                effects.push(Effect::Display(DisplayState::Speaking));
            }
            ConversationState::Error => {
                effects.push(Effect::Microphone(false));
                effects.push(Effect::StopPlayback);
                effects.push(Effect::Speaker(false));
                effects.push(Effect::Display(DisplayState::Error(reason.to_string())));
                self.error_since = Some(now);
                self.stats.errors += 1;
                self.stats.last_error = Some(reason.to_string());
            }
        }

        self.state = to;
        self.stats.state = to;
        self.stats.transitions += 1;
        tracing::info!(from = %from, to = %to, reason, "conversation state change");
        Ok(())
    }

    fn idle_display(&self) -> DisplayState {
        if self.stats.connected {
            DisplayState::Idle
        } else {
            DisplayState::Connecting
        }
    }

    fn on_event(&mut self, event: CoordinatorEvent, now: Instant) -> Vec<Effect> {
        use ConversationState::{Error as Failed, Idle, Listening, Processing, Speaking};

        let mut effects = Vec::new();
        let state = self.state;

        let result = match event {
            CoordinatorEvent::UserTrigger if state == Idle => {
                self.move_to(Listening, now, "user trigger", &mut effects)
            }
            CoordinatorEvent::WakeWordConfirmed { detection_id } if state == Idle => {
                tracing::debug!(detection_id, "wake word confirmed");
                self.move_to(Listening, now, "wake word confirmed", &mut effects)
            }
            CoordinatorEvent::LocalWakeWord { detection_id }
                if state == Idle && !self.stats.connected =>
            {
                tracing::debug!(detection_id, "local wake word while offline");
                self.move_to(Listening, now, "local wake word", &mut effects)
            }
            CoordinatorEvent::SpeechStarted if state == Listening => {
                self.silence_deadline = self.silence_timeout.map(|t| now + t);
                Ok(())
            }
            CoordinatorEvent::SpeechEnded if state == Listening => {
                self.move_to(Processing, now, "speech ended", &mut effects)
            }
            CoordinatorEvent::ServerThinking if state == Listening => {
                self.move_to(Processing, now, "server thinking", &mut effects)
            }
            CoordinatorEvent::TtsStarted if state == Processing => {
                self.move_to(Speaking, now, "tts started", &mut effects)
            }
            CoordinatorEvent::TtsStarted if state == Listening => self
                .move_to(Processing, now, "tts before speech end", &mut effects)
                .and_then(|()| self.move_to(Speaking, now, "tts started", &mut effects)),
            CoordinatorEvent::Interrupt if state == Speaking => {
                effects.push(Effect::StopPlayback);
                self.stats.sessions_interrupted += 1;
                self.move_to(Idle, now, "interrupt", &mut effects)
            }
            CoordinatorEvent::PlaybackInterrupted if state == Speaking => {
                self.stats.sessions_interrupted += 1;
                self.move_to(Idle, now, "playback interrupted", &mut effects)
            }
            CoordinatorEvent::PlaybackDrained {
                return_to_listening,
                cooldown_ms,
            } if state == Speaking => {
                self.stats.sessions_completed += 1;
                if return_to_listening && self.auto_start_after_tts {
                    if cooldown_ms == 0 {
                        self.move_to(Listening, now, "tts finished", &mut effects)
                    } else {
                        self.cooldown_until =
                            Some(now + Duration::from_millis(u64::from(cooldown_ms)));
                        Ok(())
                    }
                } else {
                    self.move_to(Idle, now, "tts finished", &mut effects)
                }
            }
            CoordinatorEvent::CodecFault(reason) if state != Failed => {
                self.move_to(Failed, now, &reason, &mut effects)
            }
            CoordinatorEvent::Reset if state == Failed => {
                self.move_to(Idle, now, "reset", &mut effects)
            }
            CoordinatorEvent::TransportConnected => {
                self.stats.connected = true;
                self.stats.transport_failures = 0;
                if state == Idle {
                    effects.push(Effect::Display(DisplayState::Idle));
                }
                Ok(())
            }
            CoordinatorEvent::TransportDisconnected => {
                self.stats.connected = false;
                match state {
                    Idle => effects.push(Effect::Display(DisplayState::Connecting)),
                    // The rest of the reply will never arrive
                    Speaking => effects.push(Effect::StopPlayback),
                    _ => {}
                }
                Ok(())
            }
            CoordinatorEvent::TransportFailed {
                consecutive_failures,
            } => {
                self.stats.connected = false;
                self.stats.transport_failures = consecutive_failures;
                if consecutive_failures > self.max_transport_failures && state != Failed {
                    self.move_to(Failed, now, "server unreachable", &mut effects)
                } else {
                    Ok(())
                }
            }
            CoordinatorEvent::TransportGaveUp if state != Failed => {
                self.stats.connected = false;
                self.move_to(Failed, now, "server unreachable", &mut effects)
            }
            CoordinatorEvent::Searching => {
                if state == Idle {
                    effects.push(Effect::Display(DisplayState::Searching));
                }
                Ok(())
            }
            other => {
                tracing::debug!(event = ?other, state = %state, "event ignored in this state");
                Ok(())
            }
        };

        if let Err(e) = result {
            tracing::warn!(error = %e, "transition rejected");
        }
        effects
    }

    fn on_tick(&mut self, now: Instant) -> Vec<Effect> {
        let mut effects = Vec::new();

        let result = match self.state {
            ConversationState::Listening if self.silence_deadline.is_some_and(|d| now >= d) => {
                self.move_to(ConversationState::Idle, now, "silence timeout", &mut effects)
            }
            ConversationState::Speaking if self.cooldown_until.is_some_and(|d| now >= d) => {
                self.move_to(ConversationState::Listening, now, "cooldown elapsed", &mut effects)
            }
            _ => Ok(()),
        };

        if let Err(e) = result {
            tracing::warn!(error = %e, "timed transition rejected");
        }
        effects
    }
}

/// Receivers the coordinator task drains
pub struct CoordinatorInputs {
    pub events: mpsc::Receiver<CoordinatorEvent>,
    pub playback: mpsc::Receiver<PlaybackEvent>,
    pub feedback: mpsc::Receiver<FeedbackEvent>,
}

/// Owns the conversation state and drives the peripherals
pub struct Coordinator {
    machine: Mutex<Machine>,
    peripherals: Box<dyn Peripherals>,
    state_tx: watch::Sender<ConversationState>,
    tick: Duration,
}

impl Coordinator {
    /// Build the coordinator and apply the idle entry actions
    #[must_use]
    pub fn new(config: &Config, peripherals: Box<dyn Peripherals>) -> Self {
        let (state_tx, _) = watch::channel(ConversationState::Idle);
        let coordinator = Self {
            machine: Mutex::new(Machine::new(config)),
            peripherals,
            state_tx,
            tick: Duration::from_millis(config.coordinator.tick_ms.max(1)),
        };

        coordinator.apply(vec![
            Effect::Microphone(false),
            Effect::Speaker(false),
            Effect::VadContext(ConversationContext::Idle),
            Effect::Display(DisplayState::Searching),
        ]);
        coordinator
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Machine> {
        self.machine.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Feed one event, returning the resulting state
    pub fn handle_event(&self, event: CoordinatorEvent, now: Instant) -> ConversationState {
        let (effects, state) = {
            let mut machine = self.lock();
            let effects = machine.on_event(event, now);
            (effects, machine.state)
        };
        self.apply(effects);
        self.state_tx.send_if_modified(|s| std::mem::replace(s, state) != state);
        state
    }

    /// Run timers: silence timeout and post-TTS cooldown
    pub fn tick(&self, now: Instant) -> ConversationState {
        let (effects, state) = {
            let mut machine = self.lock();
            let effects = machine.on_tick(now);
            (effects, machine.state)
        };
        self.apply(effects);
        self.state_tx.send_if_modified(|s| std::mem::replace(s, state) != state);
        state
    }

    fn apply(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Microphone(on) => self.peripherals.set_microphone(on),
                Effect::Speaker(on) => self.peripherals.set_speaker(on),
                Effect::VadContext(context) => self.peripherals.set_vad_context(context),
                Effect::Display(display) => self.peripherals.show(display),
                Effect::StopPlayback => self.peripherals.stop_playback(),
            }
        }
    }

    #[must_use]
    pub fn state(&self) -> ConversationState {
        self.lock().state
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConversationState> {
        self.state_tx.subscribe()
    }

    #[must_use]
    pub fn stats(&self) -> CoordinatorStats {
        self.lock().stats.clone()
    }

    /// How long the coordinator has been in `error`, if it is
    #[must_use]
    pub fn error_duration(&self, now: Instant) -> Option<Duration> {
        self.lock()
            .error_since
            .map(|since| now.saturating_duration_since(since))
    }

    /// Drain inputs and run timers until shutdown
    pub async fn run(self: Arc<Self>, mut inputs: CoordinatorInputs, mut shutdown: Shutdown) {
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = shutdown.wait() => break,
                Some(event) = inputs.events.recv() => {
                    self.handle_event(event, Instant::now());
                }
                Some(event) = inputs.playback.recv() => {
                    if let Some(event) = CoordinatorEvent::from_playback(&event) {
                        self.handle_event(event, Instant::now());
                    }
                }
                Some(event) = inputs.feedback.recv() => {
                    if let Some(event) = CoordinatorEvent::from_feedback(&event) {
                        self.handle_event(event, Instant::now());
                    }
                }
                _ = interval.tick() => {
                    self.tick(Instant::now());
                }
            }
        }

        tracing::debug!(state = %self.state(), "coordinator stopped");
    }
}
