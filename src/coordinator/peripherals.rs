//! Hardware and collaborator side effects of state changes

use tokio::sync::watch;

use super::state::DisplayState;
use crate::audio::{CaptureControl, PlaybackControl};
use crate::playback::PlayerHandle;
use crate::vad::{ConversationContext, DetectorHandle};

/// Side effects the coordinator drives, invoked outside its lock
pub trait Peripherals: Send + Sync {
    fn set_microphone(&self, on: bool);

    fn set_speaker(&self, on: bool);

    fn set_vad_context(&self, context: ConversationContext);

    fn show(&self, display: DisplayState);

    /// Drop queued TTS and silence the speaker now
    fn stop_playback(&self);
}

/// Peripherals backed by the audio rings, the detector and the player
pub struct DevicePeripherals {
    capture: CaptureControl,
    playback: PlaybackControl,
    detector: DetectorHandle,
    player: PlayerHandle,
    display: watch::Sender<DisplayState>,
}

impl DevicePeripherals {
    #[must_use]
    pub fn new(
        capture: CaptureControl,
        playback: PlaybackControl,
        detector: DetectorHandle,
        player: PlayerHandle,
    ) -> Self {
        let (display, _) = watch::channel(DisplayState::Idle);
        Self {
            capture,
            playback,
            detector,
            player,
            display,
        }
    }

    /// Watch what the display should show
    #[must_use]
    pub fn subscribe_display(&self) -> watch::Receiver<DisplayState> {
        self.display.subscribe()
    }
}

impl Peripherals for DevicePeripherals {
    fn set_microphone(&self, on: bool) {
        self.capture.enable(on);
    }

    fn set_speaker(&self, on: bool) {
        self.playback.enable(on);
    }

    fn set_vad_context(&self, context: ConversationContext) {
        self.detector.set_context(context);
    }

    fn show(&self, display: DisplayState) {
        let shown = &display;
        tracing::debug!(display = ?shown, "display update");
        self.display.send_replace(display);
    }

    fn stop_playback(&self) {
        self.player.interrupt();
        self.playback.flush();
    }
}
