//! Audio I/O
//!
//! Fixed 16kHz mono int16 frames move between the codec driver and the
//! pipeline through lock-free SPSC rings. Host drivers use `cpal`.

mod device;
mod frame;
mod ring;
mod wav;

pub use device::{CpalCapture, CpalPlayback};
pub use frame::{
    FRAME_BYTES, FRAME_DURATION_MS, FRAME_SAMPLES, Frame, SAMPLE_RATE, max_amplitude, rms,
    scale_samples,
};
pub use ring::{
    CaptureControl, CaptureProducer, CaptureSource, FRAME_WAIT, GAIN_RANGE, PlaybackControl,
    PlaybackSink, PlaybackSource, VOLUME_RANGE, capture_ring, playback_ring,
};
pub use wav::{samples_to_wav, wav_to_samples};
