//! Host audio drivers feeding the capture and playback rings

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleRate, Stream, StreamConfig};

use super::frame::SAMPLE_RATE;
use super::ring::{CaptureProducer, PlaybackSource};
use crate::{Error, Result};

/// Scratch size for sample-format conversion inside device callbacks
const SCRATCH_SAMPLES: usize = 1024;

/// Microphone driver on the default input device
pub struct CpalCapture {
    device: Device,
    config: StreamConfig,
    stream: Option<Stream>,
}

impl CpalCapture {
    /// Open the default input device at 16kHz
    ///
    /// # Errors
    ///
    /// Returns `Error::CodecFault` if no suitable input device exists
    pub fn new() -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_input_device()
            .ok_or_else(|| Error::CodecFault("no input device available".to_string()))?;

        let supported_config = device
            .supported_input_configs()
            .map_err(|e| Error::CodecFault(e.to_string()))?
            .find(|c| {
                c.channels() == 1
                    && c.min_sample_rate() <= SampleRate(SAMPLE_RATE)
                    && c.max_sample_rate() >= SampleRate(SAMPLE_RATE)
            })
            .ok_or_else(|| Error::CodecFault("no 16kHz mono input config".to_string()))?;

        let config = supported_config
            .with_sample_rate(SampleRate(SAMPLE_RATE))
            .config();

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = SAMPLE_RATE,
            channels = config.channels,
            "audio capture initialized"
        );

        Ok(Self {
            device,
            config,
            stream: None,
        })
    }

    /// Start streaming microphone samples into the capture ring
    ///
    /// # Errors
    ///
    /// Returns `Error::CodecFault` if the stream cannot be built or started
    pub fn start(&mut self, mut producer: CaptureProducer) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        // The error callback needs its own way to flag the fault
        let (fault_tx, fault_rx) = std::sync::mpsc::channel::<()>();
        let mut scratch = [0i16; SCRATCH_SAMPLES];

        let stream = self
            .device
            .build_input_stream(
                &self.config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if fault_rx.try_recv().is_ok() {
                        producer.report_fault();
                        return;
                    }
                    for chunk in data.chunks(SCRATCH_SAMPLES) {
                        let out = &mut scratch[..chunk.len()];
                        for (dst, &src) in out.iter_mut().zip(chunk) {
                            *dst = f32_to_i16(src);
                        }
                        producer.push(out);
                    }
                },
                move |err| {
                    tracing::error!(error = %err, "audio capture error");
                    let _ = fault_tx.send(());
                },
                None,
            )
            .map_err(|e| Error::CodecFault(e.to_string()))?;

        stream
            .play()
            .map_err(|e| Error::CodecFault(e.to_string()))?;
        self.stream = Some(stream);

        tracing::debug!("audio capture started");
        Ok(())
    }

    /// Stop the input stream
    pub fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            tracing::debug!("audio capture stopped");
        }
    }

    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.stream.is_some()
    }
}

/// Speaker driver on the default output device
pub struct CpalPlayback {
    device: Device,
    config: StreamConfig,
    stream: Option<Stream>,
}

impl CpalPlayback {
    /// Open the default output device at 16kHz
    ///
    /// # Errors
    ///
    /// Returns `Error::CodecFault` if no suitable output device exists
    pub fn new() -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_output_device()
            .ok_or_else(|| Error::CodecFault("no output device available".to_string()))?;

        let supported_config = device
            .supported_output_configs()
            .map_err(|e| Error::CodecFault(e.to_string()))?
            .find(|c| {
                c.channels() == 1
                    && c.min_sample_rate() <= SampleRate(SAMPLE_RATE)
                    && c.max_sample_rate() >= SampleRate(SAMPLE_RATE)
            })
            .or_else(|| {
                // Fallback: stereo, mono duplicated to both channels
                device.supported_output_configs().ok()?.find(|c| {
                    c.channels() == 2
                        && c.min_sample_rate() <= SampleRate(SAMPLE_RATE)
                        && c.max_sample_rate() >= SampleRate(SAMPLE_RATE)
                })
            })
            .ok_or_else(|| Error::CodecFault("no 16kHz output config".to_string()))?;

        let config = supported_config
            .with_sample_rate(SampleRate(SAMPLE_RATE))
            .config();

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = SAMPLE_RATE,
            channels = config.channels,
            "audio playback initialized"
        );

        Ok(Self {
            device,
            config,
            stream: None,
        })
    }

    /// Start draining the playback ring into the speaker
    ///
    /// # Errors
    ///
    /// Returns `Error::CodecFault` if the stream cannot be built or started
    pub fn start(&mut self, mut source: PlaybackSource) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let channels = usize::from(self.config.channels);
        let (fault_tx, fault_rx) = std::sync::mpsc::channel::<()>();
        let mut scratch = [0i16; SCRATCH_SAMPLES];

        let stream = self
            .device
            .build_output_stream(
                &self.config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    if fault_rx.try_recv().is_ok() {
                        source.report_fault();
                    }
                    for out in data.chunks_mut(SCRATCH_SAMPLES / channels * channels) {
                        let frames = out.len() / channels;
                        let mono = &mut scratch[..frames];
                        source.fill(mono);
                        for (frame, &sample) in out.chunks_mut(channels).zip(mono.iter()) {
                            let value = f32::from(sample) / 32768.0;
                            frame.fill(value);
                        }
                    }
                },
                move |err| {
                    tracing::error!(error = %err, "audio playback error");
                    let _ = fault_tx.send(());
                },
                None,
            )
            .map_err(|e| Error::CodecFault(e.to_string()))?;

        stream
            .play()
            .map_err(|e| Error::CodecFault(e.to_string()))?;
        self.stream = Some(stream);

        tracing::debug!("audio playback started");
        Ok(())
    }

    /// Stop the output stream
    pub fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            tracing::debug!("audio playback stopped");
        }
    }
}

/// Convert a device sample in [-1.0, 1.0] to int16
#[allow(clippy::cast_possible_truncation)]
fn f32_to_i16(sample: f32) -> i16 {
    (sample * 32767.0).clamp(-32768.0, 32767.0) as i16
}
