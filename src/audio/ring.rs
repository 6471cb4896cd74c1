//! Lock-free capture and playback rings
//!
//! Each ring is a single-producer/single-consumer `ringbuf` of int16
//! samples. The driver side (codec callback) and the pipeline side never
//! share a lock; control state lives in atomics behind a cloneable handle.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use tokio::sync::Notify;

use super::frame::{FRAME_DURATION_MS, FRAME_SAMPLES, Frame, scale_samples};
use crate::{Error, Result};

/// Accepted microphone gain range
pub const GAIN_RANGE: std::ops::RangeInclusive<f32> = 0.5..=2.0;

/// Accepted playback volume range
pub const VOLUME_RANGE: std::ops::RangeInclusive<f32> = 0.0..=1.0;

/// Longest `next_frame` waits for a complete frame
pub const FRAME_WAIT: Duration = Duration::from_millis(FRAME_DURATION_MS as u64);

struct CaptureShared {
    enabled: AtomicBool,
    gain_bits: AtomicU32,
    flush: AtomicBool,
    fault: AtomicBool,
    overruns: AtomicU64,
    frames_delivered: AtomicU64,
    ready: Notify,
}

/// Create a capture ring holding at least `capacity_frames` frames
///
/// Returns the driver-side producer, the pipeline-side source and a
/// control handle for enable/gain.
#[must_use]
pub fn capture_ring(capacity_frames: usize) -> (CaptureProducer, CaptureSource, CaptureControl) {
    let capacity = (capacity_frames.max(1) * FRAME_SAMPLES).next_power_of_two();
    let (prod, cons) = HeapRb::<i16>::new(capacity).split();

    let shared = Arc::new(CaptureShared {
        enabled: AtomicBool::new(false),
        gain_bits: AtomicU32::new(1.0f32.to_bits()),
        flush: AtomicBool::new(false),
        fault: AtomicBool::new(false),
        overruns: AtomicU64::new(0),
        frames_delivered: AtomicU64::new(0),
        ready: Notify::new(),
    });

    (
        CaptureProducer {
            prod,
            shared: Arc::clone(&shared),
        },
        CaptureSource {
            cons,
            shared: Arc::clone(&shared),
        },
        CaptureControl { shared },
    )
}

/// Driver side of the capture ring
pub struct CaptureProducer {
    prod: HeapProd<i16>,
    shared: Arc<CaptureShared>,
}

impl CaptureProducer {
    /// Push raw samples from the codec
    ///
    /// Samples arriving while capture is disabled are discarded. Samples
    /// that don't fit are dropped and counted as overruns. Returns the
    /// number of samples accepted.
    pub fn push(&mut self, samples: &[i16]) -> usize {
        if !self.shared.enabled.load(Ordering::Acquire) {
            return 0;
        }

        let pushed = self.prod.push_slice(samples);
        let dropped = samples.len() - pushed;
        if dropped > 0 {
            self.shared
                .overruns
                .fetch_add(dropped as u64, Ordering::Relaxed);
        }

        if self.prod.occupied_len() >= FRAME_SAMPLES {
            self.shared.ready.notify_one();
        }

        pushed
    }

    /// Mark the capture path as failed
    pub fn report_fault(&self) {
        self.shared.fault.store(true, Ordering::Release);
        self.shared.ready.notify_one();
    }
}

/// Pipeline side of the capture ring
pub struct CaptureSource {
    cons: HeapCons<i16>,
    shared: Arc<CaptureShared>,
}

impl CaptureSource {
    /// Wait at most one frame period for the next complete frame
    ///
    /// # Errors
    ///
    /// Returns `Error::CodecFault` if the driver reported a failure and
    /// `Error::TimedOut` if no complete frame arrived within 20ms
    pub async fn next_frame(&mut self) -> Result<Frame> {
        let deadline = tokio::time::Instant::now() + FRAME_WAIT;

        loop {
            if let Some(frame) = self.try_next_frame()? {
                return Ok(frame);
            }

            if tokio::time::timeout_at(deadline, self.shared.ready.notified())
                .await
                .is_err()
            {
                // One last look: the notify permit may have raced the deadline
                return self
                    .try_next_frame()?
                    .ok_or_else(|| Error::TimedOut("no capture frame within 20ms".to_string()));
            }
        }
    }

    /// Pop a complete frame if one is buffered
    ///
    /// # Errors
    ///
    /// Returns `Error::CodecFault` if the driver reported a failure
    pub fn try_next_frame(&mut self) -> Result<Option<Frame>> {
        if self.shared.fault.load(Ordering::Acquire) {
            return Err(Error::CodecFault("capture driver failed".to_string()));
        }

        if self.shared.flush.swap(false, Ordering::AcqRel) {
            self.cons.clear();
        }

        if self.cons.occupied_len() < FRAME_SAMPLES {
            return Ok(None);
        }

        let mut frame = Frame::silent();
        let popped = self.cons.pop_slice(frame.samples_mut());
        debug_assert_eq!(popped, FRAME_SAMPLES);

        let gain = f32::from_bits(self.shared.gain_bits.load(Ordering::Relaxed));
        frame.apply_gain(gain);

        self.shared.frames_delivered.fetch_add(1, Ordering::Relaxed);
        Ok(Some(frame))
    }

    /// Complete frames currently buffered
    #[must_use]
    pub fn buffered_frames(&self) -> usize {
        self.cons.occupied_len() / FRAME_SAMPLES
    }
}

/// Cloneable control handle for the capture ring
#[derive(Clone)]
pub struct CaptureControl {
    shared: Arc<CaptureShared>,
}

impl CaptureControl {
    /// Gate whether the driver's samples are accepted
    ///
    /// Re-enabling discards anything buffered before the gap.
    pub fn enable(&self, enabled: bool) {
        let was = self.shared.enabled.swap(enabled, Ordering::AcqRel);
        if enabled && !was {
            self.shared.flush.store(true, Ordering::Release);
        }
        tracing::debug!(enabled, "capture gate");
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::Acquire)
    }

    /// Set the pre-delivery gain
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` if `gain` is outside 0.5 to 2.0
    pub fn apply_gain(&self, gain: f32) -> Result<()> {
        if !GAIN_RANGE.contains(&gain) {
            return Err(Error::InvalidInput(format!(
                "microphone gain {gain} outside 0.5..=2.0"
            )));
        }
        self.shared.gain_bits.store(gain.to_bits(), Ordering::Relaxed);
        Ok(())
    }

    #[must_use]
    pub fn gain(&self) -> f32 {
        f32::from_bits(self.shared.gain_bits.load(Ordering::Relaxed))
    }

    /// Samples dropped because the pipeline fell behind
    #[must_use]
    pub fn overruns(&self) -> u64 {
        self.shared.overruns.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn frames_delivered(&self) -> u64 {
        self.shared.frames_delivered.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_faulted(&self) -> bool {
        self.shared.fault.load(Ordering::Acquire)
    }
}

struct PlaybackShared {
    enabled: AtomicBool,
    volume_bits: AtomicU32,
    flush: AtomicBool,
    fade_out: AtomicBool,
    fault: AtomicBool,
    underruns: AtomicU64,
    samples_played: AtomicU64,
}

/// Create a playback ring holding exactly `capacity_frames` frames
#[must_use]
pub fn playback_ring(capacity_frames: usize) -> (PlaybackSink, PlaybackSource, PlaybackControl) {
    let (prod, cons) = HeapRb::<i16>::new(capacity_frames.max(1) * FRAME_SAMPLES).split();

    let shared = Arc::new(PlaybackShared {
        enabled: AtomicBool::new(false),
        volume_bits: AtomicU32::new(1.0f32.to_bits()),
        flush: AtomicBool::new(false),
        fade_out: AtomicBool::new(false),
        fault: AtomicBool::new(false),
        underruns: AtomicU64::new(0),
        samples_played: AtomicU64::new(0),
    });

    (
        PlaybackSink {
            prod,
            shared: Arc::clone(&shared),
        },
        PlaybackSource {
            cons,
            shared: Arc::clone(&shared),
            primed: false,
        },
        PlaybackControl { shared },
    )
}

/// Pipeline side of the playback ring
pub struct PlaybackSink {
    prod: HeapProd<i16>,
    shared: Arc<PlaybackShared>,
}

impl PlaybackSink {
    /// Enqueue one frame for the speaker
    ///
    /// # Errors
    ///
    /// Returns `Error::Busy` when the ring already holds its configured
    /// number of frames and `Error::CodecFault` if the driver failed
    pub fn submit(&mut self, frame: &Frame) -> Result<()> {
        if self.shared.fault.load(Ordering::Acquire) {
            return Err(Error::CodecFault("playback driver failed".to_string()));
        }
        if self.prod.vacant_len() < FRAME_SAMPLES {
            return Err(Error::Busy("playback buffer full".to_string()));
        }
        self.prod.push_slice(frame.samples());
        Ok(())
    }

    /// Frames queued but not yet consumed by the driver
    #[must_use]
    pub fn outstanding_frames(&self) -> usize {
        self.prod.occupied_len().div_ceil(FRAME_SAMPLES)
    }
}

/// Driver side of the playback ring
pub struct PlaybackSource {
    cons: HeapCons<i16>,
    shared: Arc<PlaybackShared>,
    primed: bool,
}

impl PlaybackSource {
    /// Fill a device buffer, padding with silence
    ///
    /// Returns the number of real samples written. Running dry while
    /// enabled after audio has started counts one underrun.
    pub fn fill(&mut self, out: &mut [i16]) -> usize {
        if self.shared.flush.swap(false, Ordering::AcqRel) {
            self.cons.clear();
            self.primed = false;
        }

        if !self.shared.enabled.load(Ordering::Acquire) {
            out.fill(0);
            return 0;
        }

        let volume = f32::from_bits(self.shared.volume_bits.load(Ordering::Relaxed));

        if self.shared.fade_out.swap(false, Ordering::AcqRel) {
            let len = out.len().min(FRAME_SAMPLES);
            let n = self.cons.pop_slice(&mut out[..len]);
            scale_samples(&mut out[..n], volume);
            ramp_down(&mut out[..n]);
            out[n..].fill(0);
            self.cons.clear();
            self.primed = false;
            return n;
        }

        let n = self.cons.pop_slice(out);
        scale_samples(&mut out[..n], volume);
        out[n..].fill(0);

        if n > 0 {
            self.primed = true;
            self.shared
                .samples_played
                .fetch_add(n as u64, Ordering::Relaxed);
        }
        if n < out.len() && self.primed {
            self.shared.underruns.fetch_add(1, Ordering::Relaxed);
            self.primed = false;
        }

        n
    }

    /// Mark the playback path as failed
    pub fn report_fault(&self) {
        self.shared.fault.store(true, Ordering::Release);
    }
}

/// Cloneable control handle for the playback ring
#[derive(Clone)]
pub struct PlaybackControl {
    shared: Arc<PlaybackShared>,
}

impl PlaybackControl {
    /// Gate whether the driver consumes frames
    ///
    /// Disabling discards everything still queued.
    pub fn enable(&self, enabled: bool) {
        self.shared.enabled.store(enabled, Ordering::Release);
        if !enabled {
            self.shared.flush.store(true, Ordering::Release);
        }
        tracing::debug!(enabled, "playback gate");
    }

    /// Drop queued frames without changing the gate
    pub fn flush(&self) {
        self.shared.flush.store(true, Ordering::Release);
    }

    /// Ramp the next device buffer to silence, then drop the rest
    ///
    /// The ramp covers at most one frame.
    pub fn fade_out_and_flush(&self) {
        self.shared.fade_out.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::Acquire)
    }

    /// Set the pre-delivery volume
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` if `volume` is outside 0.0 to 1.0
    pub fn apply_volume(&self, volume: f32) -> Result<()> {
        if !VOLUME_RANGE.contains(&volume) {
            return Err(Error::InvalidInput(format!(
                "playback volume {volume} outside 0.0..=1.0"
            )));
        }
        self.shared
            .volume_bits
            .store(volume.to_bits(), Ordering::Relaxed);
        Ok(())
    }

    #[must_use]
    pub fn volume(&self) -> f32 {
        f32::from_bits(self.shared.volume_bits.load(Ordering::Relaxed))
    }

    #[must_use]
    pub fn underruns(&self) -> u64 {
        self.shared.underruns.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn samples_played(&self) -> u64 {
        self.shared.samples_played.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_faulted(&self) -> bool {
        self.shared.fault.load(Ordering::Acquire)
    }
}

/// Linear ramp from full scale to zero across `pcm`
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn ramp_down(pcm: &mut [i16]) {
    let len = pcm.len();
    for (k, s) in pcm.iter_mut().enumerate() {
        let gain = 1.0 - (k + 1) as f32 / len as f32;
        *s = (f32::from(*s) * gain).round() as i16;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(value: i16) -> Frame {
        Frame::from_slice(&[value; FRAME_SAMPLES]).unwrap()
    }

    #[test]
    fn test_capture_disabled_discards() {
        let (mut prod, mut source, control) = capture_ring(4);
        assert_eq!(prod.push(&[100; FRAME_SAMPLES]), 0);
        assert!(source.try_next_frame().unwrap().is_none());

        control.enable(true);
        assert_eq!(prod.push(&[100; FRAME_SAMPLES]), FRAME_SAMPLES);
        assert_eq!(source.try_next_frame().unwrap().unwrap(), tone(100));
        assert_eq!(control.frames_delivered(), 1);
    }

    #[test]
    fn test_capture_never_partial() {
        let (mut prod, mut source, control) = capture_ring(4);
        control.enable(true);
        prod.push(&[1; FRAME_SAMPLES / 2]);
        assert!(source.try_next_frame().unwrap().is_none());
        prod.push(&[1; FRAME_SAMPLES / 2]);
        assert!(source.try_next_frame().unwrap().is_some());
    }

    #[test]
    fn test_capture_gain() {
        let (mut prod, mut source, control) = capture_ring(4);
        control.enable(true);
        assert!(control.apply_gain(3.0).is_err());
        control.apply_gain(2.0).unwrap();
        prod.push(&[20_000; FRAME_SAMPLES]);
        let frame = source.try_next_frame().unwrap().unwrap();
        assert_eq!(frame.max_amplitude(), 32767);
    }

    #[test]
    fn test_capture_overrun_counted() {
        let (mut prod, _source, control) = capture_ring(1);
        control.enable(true);
        // Capacity rounds up to 512 samples
        let accepted = prod.push(&[0; 1000]);
        assert_eq!(accepted, 512);
        assert_eq!(control.overruns(), 488);
    }

    #[test]
    fn test_capture_fault() {
        let (prod, mut source, control) = capture_ring(2);
        prod.report_fault();
        assert!(control.is_faulted());
        assert!(matches!(source.try_next_frame(), Err(Error::CodecFault(_))));
    }

    #[tokio::test]
    async fn test_next_frame_times_out() {
        let (_prod, mut source, control) = capture_ring(2);
        control.enable(true);
        let start = std::time::Instant::now();
        let result = source.next_frame().await;
        assert!(matches!(result, Err(Error::TimedOut(_))));
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_next_frame_wakes_on_push() {
        let (mut prod, mut source, control) = capture_ring(4);
        control.enable(true);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            prod.push(&[7; FRAME_SAMPLES]);
        });
        let frame = source.next_frame().await.unwrap();
        assert_eq!(frame, tone(7));
        handle.await.unwrap();
    }

    #[test]
    fn test_playback_buffer_full() {
        let (mut sink, _source, _control) = playback_ring(2);
        sink.submit(&tone(1)).unwrap();
        sink.submit(&tone(2)).unwrap();
        assert!(matches!(sink.submit(&tone(3)), Err(Error::Busy(_))));
        assert_eq!(sink.outstanding_frames(), 2);
    }

    #[test]
    fn test_playback_volume_and_order() {
        let (mut sink, mut source, control) = playback_ring(4);
        control.enable(true);
        control.apply_volume(0.5).unwrap();
        sink.submit(&tone(1000)).unwrap();
        sink.submit(&tone(2000)).unwrap();

        let mut out = [0i16; FRAME_SAMPLES];
        assert_eq!(source.fill(&mut out), FRAME_SAMPLES);
        assert!(out.iter().all(|&s| s == 500));
        assert_eq!(source.fill(&mut out), FRAME_SAMPLES);
        assert!(out.iter().all(|&s| s == 1000));
        assert_eq!(control.underruns(), 0);
    }

    #[test]
    fn test_playback_underrun_counted_once() {
        let (mut sink, mut source, control) = playback_ring(4);
        control.enable(true);
        sink.submit(&tone(10)).unwrap();

        let mut out = [0i16; FRAME_SAMPLES];
        source.fill(&mut out);
        assert_eq!(source.fill(&mut out), 0);
        assert_eq!(source.fill(&mut out), 0);
        assert_eq!(control.underruns(), 1);
    }

    #[test]
    fn test_playback_disable_clears_queue() {
        let (mut sink, mut source, control) = playback_ring(4);
        control.enable(true);
        sink.submit(&tone(10)).unwrap();
        sink.submit(&tone(10)).unwrap();
        control.enable(false);

        let mut out = [1i16; FRAME_SAMPLES];
        assert_eq!(source.fill(&mut out), 0);
        assert!(out.iter().all(|&s| s == 0));
        assert_eq!(sink.outstanding_frames(), 0);

        control.enable(true);
        assert_eq!(source.fill(&mut out), 0);
        assert_eq!(control.underruns(), 0);
    }

    #[test]
    fn test_playback_fade_out_and_flush() {
        let (mut sink, mut source, control) = playback_ring(4);
        control.enable(true);
        sink.submit(&tone(1000)).unwrap();
        sink.submit(&tone(1000)).unwrap();
        control.fade_out_and_flush();

        let mut out = [0i16; FRAME_SAMPLES];
        assert_eq!(source.fill(&mut out), FRAME_SAMPLES);
        assert!(out[0] > 990);
        assert!(out[FRAME_SAMPLES / 2] < 510);
        assert_eq!(out[FRAME_SAMPLES - 1], 0);

        assert_eq!(source.fill(&mut out), 0);
        assert!(out.iter().all(|&s| s == 0));
        assert_eq!(control.underruns(), 0);
    }
}
