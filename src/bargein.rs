//! Barge-in detection for outbound playback.
//!
//! Runs inline in the send loop: after the grace deadline each inbound
//! frame is decoded and its energy compared against a fixed threshold.

use std::time::Duration;

use tokio::time::Instant;

use crate::config::BargeInSettings;
use crate::g711;

/// Root-mean-square energy of a block of PCM16 samples.
pub fn rms(samples: &[i16]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum / samples.len() as f64).sqrt()
}

/// Energy threshold with a consecutive-frame debounce.
#[derive(Clone, Debug)]
pub struct BargeInMonitor {
    threshold: f64,
    debounce_frames: u32,
    streak: u32,
}

impl BargeInMonitor {
    pub fn new(threshold: f64, debounce_frames: u32) -> Self {
        Self {
            threshold,
            debounce_frames: debounce_frames.max(1),
            streak: 0,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Feed one decoded frame; true once enough loud frames arrived in a row.
    pub fn observe(&mut self, samples: &[i16]) -> bool {
        if rms(samples) > self.threshold {
            self.streak += 1;
        } else {
            self.streak = 0;
        }
        self.streak >= self.debounce_frames
    }

    pub fn reset(&mut self) {
        self.streak = 0;
    }
}

/// Per-utterance barge-in state; lives for one `speak()` call.
#[derive(Clone, Debug)]
pub struct PlaybackSession {
    pub grace_deadline: Instant,
    pub monitor: BargeInMonitor,
}

impl PlaybackSession {
    pub fn new(grace: Duration, monitor: BargeInMonitor) -> Self {
        Self {
            grace_deadline: Instant::now() + grace,
            monitor,
        }
    }

    /// Longer grace so the caller's own "hello" does not cut the greeting.
    pub fn for_greeting(settings: &BargeInSettings) -> Self {
        Self::new(settings.greeting_grace(), settings.monitor())
    }

    pub fn for_reply(settings: &BargeInSettings) -> Self {
        Self::new(settings.reply_grace(), settings.monitor())
    }

    pub fn is_armed(&self) -> bool {
        Instant::now() >= self.grace_deadline
    }

    /// Decode an inbound RTP payload and report whether the user is talking over us.
    pub fn check_payload(&mut self, payload: &[u8]) -> bool {
        let samples = g711::decode_frame(payload);
        let interrupted = self.monitor.observe(&samples);
        if interrupted {
            tracing::info!(
                "[Barge-in] Caller interrupted (RMS {:.0} > {:.0})",
                rms(&samples),
                self.monitor.threshold()
            );
        }
        interrupted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loud_frame() -> Vec<i16> {
        (0..160).map(|i| if i % 2 == 0 { 4000 } else { -4000 }).collect()
    }

    #[test]
    fn test_rms() {
        assert_eq!(rms(&[]), 0.0);
        assert_eq!(rms(&[0; 160]), 0.0);
        assert!((rms(&[1000; 160]) - 1000.0).abs() < 1e-9);
        assert!((rms(&loud_frame()) - 4000.0).abs() < 1e-9);
    }

    #[test]
    fn test_single_frame_triggers_without_debounce() {
        let mut monitor = BargeInMonitor::new(1000.0, 1);
        assert!(!monitor.observe(&[0; 160]));
        assert!(monitor.observe(&loud_frame()));
    }

    #[test]
    fn test_debounce_needs_consecutive_frames() {
        let mut monitor = BargeInMonitor::new(1000.0, 3);
        assert!(!monitor.observe(&loud_frame()));
        assert!(!monitor.observe(&loud_frame()));
        assert!(!monitor.observe(&[0; 160]));
        assert!(!monitor.observe(&loud_frame()));
        assert!(!monitor.observe(&loud_frame()));
        assert!(monitor.observe(&loud_frame()));

        monitor.reset();
        assert!(!monitor.observe(&loud_frame()));
    }

    #[test]
    fn test_zero_debounce_treated_as_one() {
        let mut monitor = BargeInMonitor::new(1000.0, 0);
        assert!(!monitor.observe(&[0; 160]));
        assert!(monitor.observe(&loud_frame()));
    }

    #[test]
    fn test_check_payload_decodes_ulaw() {
        let mut session = PlaybackSession::new(Duration::ZERO, BargeInMonitor::new(1000.0, 1));
        assert!(!session.check_payload(&[g711::SILENCE; 160]));
        assert!(session.check_payload(&g711::encode(&loud_frame())));
        // Truncated loud payload still counts after padding
        let mut session = PlaybackSession::new(Duration::ZERO, BargeInMonitor::new(1000.0, 1));
        assert!(session.check_payload(&g711::encode(&loud_frame())[..120]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_period() {
        let settings = BargeInSettings::default();
        let greeting = PlaybackSession::for_greeting(&settings);
        let reply = PlaybackSession::for_reply(&settings);
        assert!(!greeting.is_armed());
        assert!(!reply.is_armed());

        tokio::time::advance(settings.reply_grace()).await;
        assert!(reply.is_armed());
        assert!(!greeting.is_armed());

        tokio::time::advance(settings.greeting_grace() - settings.reply_grace()).await;
        assert!(greeting.is_armed());
    }
}
