//! Outbound playback and inbound capture over one media port.
//!
//! Both loops run on the conversation task, which owns the RTP socket;
//! the only state shared with the signaling side is the call-active flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};

use crate::bargein::{rms, PlaybackSession};
use crate::config::ListenSettings;
use crate::error::RtpError;
use crate::g711;
use crate::resample::{TelephonyResampler, TELEPHONY_RATE};
use crate::rtp::{MediaPort, FRAME_DURATION, SAMPLES_PER_FRAME};
use crate::services::SpeechStream;

/// Longest a barge-in check may hold up the next packet.
const BARGE_IN_POLL: Duration = Duration::from_millis(1);

/// How long to wait on a slow synthesizer before re-checking the call.
const SYNTHESIS_POLL: Duration = Duration::from_millis(100);

pub const DEFAULT_MAX_SEND_FAILURES: u32 = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlaybackOutcome {
    Completed,
    Interrupted,
    HungUp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListenEnd {
    /// Speech followed by the silence timeout
    Silence,
    MaxDuration,
    HungUp,
}

/// Linear audio captured by one `listen()` call.
#[derive(Clone, Debug)]
pub struct Utterance {
    pub samples: Vec<i16>,
    pub frames: usize,
    pub speech_detected: bool,
    pub ended: ListenEnd,
}

impl Utterance {
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples.len() as f64 / TELEPHONY_RATE as f64)
    }
}

fn call_active(active: &AtomicBool) -> bool {
    active.load(Ordering::Acquire)
}

/// Play synthesized speech to the caller, one 20ms packet at a time.
///
/// Before each packet after the grace deadline, one inbound frame is
/// checked for barge-in; on interruption nothing more is sent.
pub async fn speak<P>(
    port: &mut P,
    mut speech: SpeechStream,
    mut session: PlaybackSession,
    active: &AtomicBool,
    max_send_failures: u32,
) -> Result<PlaybackOutcome, RtpError>
where
    P: MediaPort + ?Sized,
{
    let mut resampler = TelephonyResampler::new(speech.sample_rate)?;
    let mut pending: Vec<i16> = Vec::with_capacity(SAMPLES_PER_FRAME * 4);
    let mut stream_done = false;

    let mut armed = false;
    let mut frames_sent = 0usize;
    let mut consecutive_failures = 0u32;

    let mut ticker = tokio::time::interval(FRAME_DURATION);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    port.start_talkspurt();

    loop {
        while pending.len() < SAMPLES_PER_FRAME && !stream_done {
            if !call_active(active) {
                return Ok(PlaybackOutcome::HungUp);
            }
            match tokio::time::timeout(SYNTHESIS_POLL, speech.chunks.recv()).await {
                Ok(Some(chunk)) => pending.extend(resampler.process(&chunk)?),
                Ok(None) => {
                    stream_done = true;
                    pending.extend(resampler.finish()?);
                }
                Err(_) => tracing::debug!("[RTP] Waiting for synthesizer"),
            }
        }

        if pending.is_empty() {
            break;
        }

        let take = pending.len().min(SAMPLES_PER_FRAME);
        let mut frame: Vec<i16> = pending.drain(..take).collect();
        frame.resize(SAMPLES_PER_FRAME, 0);

        if !call_active(active) {
            tracing::info!("[RTP] Call ended during playback after {} packets", frames_sent);
            return Ok(PlaybackOutcome::HungUp);
        }

        ticker.tick().await;

        if session.is_armed() {
            if !armed {
                // Audio queued during the grace period is stale by now
                port.flush(usize::MAX).await;
                armed = true;
            }
            match port.receive_frame(BARGE_IN_POLL).await {
                Ok(Some(payload)) => {
                    if session.check_payload(&payload) {
                        tracing::info!("[RTP] Playback interrupted after {} packets", frames_sent);
                        return Ok(PlaybackOutcome::Interrupted);
                    }
                }
                Ok(None) => {}
                Err(e) => tracing::debug!("[RTP] Barge-in check skipped: {}", e),
            }
        }

        let payload = g711::encode(&frame);
        match port.send_frame(&payload).await {
            Ok(()) => {
                consecutive_failures = 0;
                frames_sent += 1;
            }
            Err(e) => {
                consecutive_failures += 1;
                tracing::warn!("[RTP] Send failed ({} in a row): {}", consecutive_failures, e);
                if consecutive_failures >= max_send_failures {
                    return Err(RtpError::SendFailed {
                        consecutive: consecutive_failures,
                    });
                }
            }
        }
    }

    tracing::debug!("[RTP] Playback complete, {} packets sent", frames_sent);
    Ok(PlaybackOutcome::Completed)
}

/// Capture caller audio with energy-based voice activity detection.
///
/// Returns once `silence_timeout` passes after speech, at `max_duration`,
/// or as soon as the call ends.
pub async fn listen<P>(
    port: &mut P,
    settings: &ListenSettings,
    active: &AtomicBool,
) -> Result<Utterance, RtpError>
where
    P: MediaPort + ?Sized,
{
    let start = Instant::now();
    let max_end = start + settings.max_duration();
    let silence_timeout = settings.silence_timeout();

    let mut samples = Vec::new();
    let mut frames = 0usize;
    let mut speech_detected = false;
    let mut last_speech = start;

    tracing::debug!(
        "[RTP] Listening (max {:?}, {:?} silence timeout)",
        settings.max_duration(),
        silence_timeout
    );

    let ended = loop {
        if !call_active(active) {
            break ListenEnd::HungUp;
        }

        let now = Instant::now();
        if now >= max_end {
            break ListenEnd::MaxDuration;
        }

        let wait = settings.poll_interval().min(max_end - now);
        match port.receive_frame(wait).await {
            Ok(Some(payload)) => {
                let decoded = g711::decode_frame(&payload);
                if rms(&decoded) > settings.speech_threshold {
                    if !speech_detected {
                        tracing::info!("[RTP] Speech detected");
                        speech_detected = true;
                    }
                    last_speech = Instant::now();
                }
                samples.extend(decoded);
                frames += 1;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("[RTP] Receive failed: {}", e);
                tokio::time::sleep(FRAME_DURATION).await;
            }
        }

        if speech_detected && Instant::now() - last_speech > silence_timeout {
            break ListenEnd::Silence;
        }
    };

    tracing::debug!(
        "[RTP] Listen ended ({:?}): {} packets, speech={}",
        ended,
        frames,
        speech_detected
    );

    Ok(Utterance {
        samples,
        frames,
        speech_detected,
        ended,
    })
}
