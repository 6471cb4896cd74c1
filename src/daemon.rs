//! Daemon - the voice terminal service
//!
//! Builds every component, wires their channels and supervises them until
//! Ctrl-C or an unrecoverable error state.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};

use crate::audio::{CpalCapture, CpalPlayback, capture_ring, playback_ring};
use crate::config::Config;
use crate::coordinator::{
    Coordinator, CoordinatorEvent, CoordinatorInputs, DevicePeripherals,
};
use crate::discovery::{DeviceAdvert, Discovery, MdnsAdvertiser};
use crate::feedback::FeedbackAdapter;
use crate::observability::{DeviceDiagnostics, StatusServer, Telemetry};
use crate::pipeline::{AudioTask, EndpointFollower, EventRouter};
use crate::playback::Player;
use crate::shutdown::{Shutdown, shutdown_channel};
use crate::transport::{DatagramSender, DeviceIdentity, ReliableChannel};
use crate::vad::Detector;
use crate::{Error, Result};

/// Depth of the coordinator's event queue
const EVENT_QUEUE_DEPTH: usize = 64;

/// Wake word verdicts buffered for the detector
const VERDICT_QUEUE_DEPTH: usize = 16;

/// How often the supervisor checks the error grace period
const SUPERVISE_INTERVAL: Duration = Duration::from_secs(1);

/// Time allowed for tasks to finish after shutdown
const STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// The voice terminal daemon
pub struct Daemon {
    config: Config,
}

impl Daemon {
    #[must_use]
    pub const fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run until interrupted
    ///
    /// # Errors
    ///
    /// Returns error if a component cannot be built, or `Error::TimedOut`
    /// when the coordinator stays in `error` past the grace period
    #[allow(clippy::future_not_send, clippy::too_many_lines)]
    pub async fn run(self) -> Result<()> {
        let config = self.config;
        let (trigger, shutdown) = shutdown_channel();

        let ctrl_c = trigger.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown requested");
                ctrl_c.trigger();
            }
        });

        // Audio rings and host drivers
        let (producer, capture_source, capture_control) =
            capture_ring(config.audio.capture_buffer_frames);
        let (playback_sink, playback_source, playback_control) =
            playback_ring(config.audio.playback_buffer_frames);
        capture_control.apply_gain(config.audio.microphone_gain)?;
        playback_control.apply_volume(config.audio.playback_volume)?;

        let mut codec_faults = Vec::new();
        let mut mic = match CpalCapture::new() {
            Ok(mic) => Some(mic),
            Err(e) => {
                codec_faults.push(e.to_string());
                None
            }
        };
        if let Some(mic) = mic.as_mut()
            && let Err(e) = mic.start(producer)
        {
            codec_faults.push(e.to_string());
        }
        let mut speaker = match CpalPlayback::new() {
            Ok(speaker) => Some(speaker),
            Err(e) => {
                codec_faults.push(e.to_string());
                None
            }
        };
        if let Some(speaker) = speaker.as_mut()
            && let Err(e) = speaker.start(playback_source)
        {
            codec_faults.push(e.to_string());
        }

        // Detection, playback and transport
        let (detector, detector_handle) = Detector::new(
            config.vad.clone(),
            config.wake_word.clone(),
            VERDICT_QUEUE_DEPTH,
        )?;

        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let (playback_events_tx, playback_events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let (feedback_events_tx, feedback_events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);

        let (player, player_handle) = Player::new(
            config.playback.clone(),
            playback_sink,
            playback_control.clone(),
            detector_handle.clone(),
            playback_events_tx,
        );

        let placeholder = SocketAddr::from(([127, 0, 0, 1], config.transport.audio_port));
        let sender = DatagramSender::bind(placeholder, &config.transport).await?;
        let datagram_stats = sender.stats();

        let identity = DeviceIdentity::from_config(&config.feedback, &config.discovery.capabilities);
        let (channel, channel_handle, channel_events) =
            ReliableChannel::new(&config.transport, identity, None, shutdown.clone());

        let (feedback, feedback_handle) = FeedbackAdapter::new(
            &config,
            Box::new(channel_handle.clone()),
            detector_handle.clone(),
            feedback_events_tx,
        );
        let feedback = feedback
            .with_datagram_stats(Arc::clone(&datagram_stats))
            .with_player(player_handle.clone());

        let peripherals = DevicePeripherals::new(
            capture_control,
            playback_control,
            detector_handle.clone(),
            player_handle.clone(),
        );
        let coordinator = Arc::new(Coordinator::new(&config, Box::new(peripherals)));

        // Discovery
        let (discovery, discovery_handle) = Discovery::from_config(&config)?;
        let advertiser = if config.discovery.advertise {
            match MdnsAdvertiser::new() {
                Ok(advertiser) => {
                    let advert = DeviceAdvert::from_config(
                        &config.feedback,
                        &config.discovery,
                        &config.status,
                    );
                    if let Err(e) = advertiser.start(&advert).await {
                        tracing::warn!(error = %e, "device advertisement failed");
                    }
                    Some(advertiser)
                }
                Err(e) => {
                    tracing::warn!(error = %e, "mDNS advertisement unavailable");
                    None
                }
            }
        } else {
            None
        };

        let (target_tx, target_rx) = watch::channel(None);
        let follower = EndpointFollower::new(
            discovery_handle.subscribe_best(),
            channel_handle.clone(),
            config.transport.control_path.clone(),
            target_tx,
            events_tx.clone(),
        );

        let telemetry = Arc::new(Telemetry::new());
        let mut audio = AudioTask::new(
            capture_source,
            detector,
            sender,
            target_rx,
            events_tx.clone(),
            feedback_handle.clone(),
            Arc::clone(&telemetry),
        );
        if config.transport.audio_stream {
            audio = audio.with_voice_stream(
                Box::new(channel_handle.clone()),
                &config.feedback.device_id,
                config.transport.audio_stream_batch_frames,
            );
        }
        let router = EventRouter::new(
            channel_events,
            player_handle.clone(),
            feedback_handle.clone(),
            events_tx.clone(),
        );

        let mut handles = vec![
            channel.spawn(),
            discovery.spawn(shutdown.clone()),
            follower.spawn(shutdown.clone()),
            router.spawn(shutdown.clone()),
            feedback.spawn(shutdown.clone()),
            player.spawn(shutdown.clone()),
            audio.spawn(shutdown.clone()),
            tokio::spawn(Arc::clone(&coordinator).run(
                CoordinatorInputs {
                    events: events_rx,
                    playback: playback_events_rx,
                    feedback: feedback_events_rx,
                },
                shutdown.clone(),
            )),
        ];

        if config.status.enabled {
            let diagnostics = DeviceDiagnostics {
                telemetry,
                datagram: datagram_stats,
                channel: channel_handle,
                detector: detector_handle,
                player: player_handle,
                feedback: feedback_handle,
                coordinator: Arc::clone(&coordinator),
                discovery: Some(discovery_handle),
            };
            let server = StatusServer::new(Arc::new(diagnostics), config.status.port);
            let status_shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                if let Err(e) = server.run(status_shutdown).await {
                    tracing::error!(error = %e, "status server failed");
                }
            }));
        }

        for fault in codec_faults {
            tracing::error!(error = %fault, "audio device unavailable");
            coordinator.handle_event(CoordinatorEvent::CodecFault(fault), Instant::now());
        }

        tracing::info!(
            device_id = %config.feedback.device_id,
            status_port = config.status.port,
            "voice terminal running"
        );

        let grace = Duration::from_millis(config.coordinator.error_grace_period_ms);
        let result = supervise(&coordinator, grace, shutdown).await;

        trigger.trigger();
        if let Some(advertiser) = advertiser {
            advertiser.stop().await;
        }
        if tokio::time::timeout(STOP_TIMEOUT, futures::future::join_all(handles))
            .await
            .is_err()
        {
            tracing::warn!("tasks did not stop in time");
        }
        if let Some(mut mic) = mic {
            mic.stop();
        }
        if let Some(mut speaker) = speaker {
            speaker.stop();
        }

        tracing::info!("voice terminal stopped");
        result
    }
}

/// Wait for shutdown, failing once `error` outlasts the grace period
async fn supervise(coordinator: &Coordinator, grace: Duration, mut shutdown: Shutdown) -> Result<()> {
    let mut interval = tokio::time::interval(SUPERVISE_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = shutdown.wait() => return Ok(()),
            _ = interval.tick() => {
                if let Some(elapsed) = coordinator.error_duration(Instant::now())
                    && elapsed > grace
                {
                    let reason = coordinator.stats().last_error.unwrap_or_default();
                    tracing::error!(elapsed_ms = elapsed.as_millis(), reason, "error state persisted, exiting");
                    return Err(Error::TimedOut(format!(
                        "error state persisted for {}s: {reason}",
                        elapsed.as_secs()
                    )));
                }
            }
        }
    }
}
