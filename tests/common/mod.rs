//! Shared test utilities

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use voice_terminal::Result;
use voice_terminal::audio::Frame;
use voice_terminal::coordinator::{DisplayState, Peripherals};
use voice_terminal::feedback::MessageSink;
use voice_terminal::transport::ClientMessage;
use voice_terminal::vad::ConversationContext;

/// Relative energy of the wake phrase, one value per frame
///
/// Three syllables: rise, dip, strong middle, dip, tail.
const WAKE_SHAPE: [f32; 11] = [0.3, 0.7, 0.4, 0.2, 0.1, 0.4, 0.8, 0.3, 0.6, 0.3, 0.1];

/// Peak amplitude of a generated wake phrase
pub const WAKE_PEAK: f32 = 7000.0;

/// Square wave whose RMS equals `amplitude`
#[must_use]
pub fn square(amplitude: i16) -> Frame {
    let mut frame = Frame::silent();
    for (i, s) in frame.samples_mut().iter_mut().enumerate() {
        *s = if (i / 20) % 2 == 0 { amplitude } else { -amplitude };
    }
    frame
}

/// `n` frames at a constant RMS
#[must_use]
pub fn constant(amplitude: i16, n: usize) -> Vec<Frame> {
    (0..n).map(|_| square(amplitude)).collect()
}

/// Wake phrase envelope stretched to `frames` points
#[must_use]
pub fn wake_envelope(frames: usize) -> Vec<f32> {
    let step = (WAKE_SHAPE.len() - 1) as f32 / (frames - 1) as f32;
    (0..frames)
        .map(|i| {
            let x = i as f32 * step;
            let lo = (x.floor() as usize).min(WAKE_SHAPE.len() - 1);
            let hi = (lo + 1).min(WAKE_SHAPE.len() - 1);
            let frac = x - x.floor();
            (WAKE_SHAPE[hi] - WAKE_SHAPE[lo]).mul_add(frac, WAKE_SHAPE[lo])
        })
        .collect()
}

/// Silence, a 20-frame wake phrase, then enough silence to close it
#[must_use]
pub fn wake_phrase() -> Vec<Frame> {
    let mut frames = constant(0, 10);
    frames.extend(
        wake_envelope(20)
            .into_iter()
            .map(|v| square((v * WAKE_PEAK).round() as i16)),
    );
    frames.extend(constant(0, 20));
    frames
}

/// Collects outbound control messages
#[derive(Clone, Default)]
pub struct SentMessages(Arc<Mutex<Vec<ClientMessage>>>);

impl SentMessages {
    pub fn kinds(&self) -> Vec<&'static str> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .map(ClientMessage::kind)
            .collect()
    }

    pub fn all(&self) -> Vec<ClientMessage> {
        self.0.lock().unwrap().clone()
    }
}

impl MessageSink for SentMessages {
    fn send(&self, message: ClientMessage) -> Result<()> {
        self.0.lock().unwrap().push(message);
        Ok(())
    }
}

/// Peripheral state as last set by the coordinator
#[derive(Debug, Clone, Default)]
pub struct PanelState {
    pub microphone: bool,
    pub speaker: bool,
    pub context: Option<ConversationContext>,
    pub display: Option<DisplayState>,
    pub stop_requests: u32,
}

/// Peripherals that only remember what they were told
#[derive(Clone, Default)]
pub struct Panel(Arc<Mutex<PanelState>>);

impl Panel {
    pub fn snapshot(&self) -> PanelState {
        self.0.lock().unwrap().clone()
    }
}

impl Peripherals for Panel {
    fn set_microphone(&self, on: bool) {
        self.0.lock().unwrap().microphone = on;
    }

    fn set_speaker(&self, on: bool) {
        self.0.lock().unwrap().speaker = on;
    }

    fn set_vad_context(&self, context: ConversationContext) {
        self.0.lock().unwrap().context = Some(context);
    }

    fn show(&self, display: DisplayState) {
        self.0.lock().unwrap().display = Some(display);
    }

    fn stop_playback(&self) {
        self.0.lock().unwrap().stop_requests += 1;
    }
}
