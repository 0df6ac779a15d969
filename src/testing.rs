//! In-memory media port for timing tests under a paused tokio clock.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::RtpError;
use crate::g711;
use crate::rtp::{MediaPort, FRAME_DURATION, SAMPLES_PER_FRAME};

type Source = Box<dyn Fn(Duration) -> Option<Vec<u8>> + Send>;

/// Inbound frames come from `source`, asked once per 20ms slot with the
/// slot's offset from creation; `None` means nothing arrives in that slot.
pub struct FakePort {
    start: Instant,
    source: Source,
    rx_slot: u32,
    pub sent: Vec<(Duration, Vec<u8>)>,
    pub received: Vec<Duration>,
    pub talkspurts: Vec<Duration>,
    pub fail_sends: bool,
}

impl FakePort {
    pub fn new<F>(source: F) -> Self
    where
        F: Fn(Duration) -> Option<Vec<u8>> + Send + 'static,
    {
        Self {
            start: Instant::now(),
            source: Box::new(source),
            rx_slot: 0,
            sent: Vec::new(),
            received: Vec::new(),
            talkspurts: Vec::new(),
            fail_sends: false,
        }
    }

    /// Nothing ever arrives.
    pub fn silent() -> Self {
        Self::new(|_| None)
    }

    pub fn elapsed(&self) -> Duration {
        Instant::now() - self.start
    }

    fn slot_time(&self, slot: u32) -> Instant {
        self.start + FRAME_DURATION * slot
    }
}

/// One μ-law frame of a square wave at `amplitude`.
pub fn tone_frame(amplitude: i16) -> Vec<u8> {
    let samples: Vec<i16> = (0..SAMPLES_PER_FRAME)
        .map(|i| if i % 2 == 0 { amplitude } else { -amplitude })
        .collect();
    g711::encode(&samples)
}

pub fn silence_frame() -> Vec<u8> {
    vec![g711::SILENCE; SAMPLES_PER_FRAME]
}

#[async_trait]
impl MediaPort for FakePort {
    async fn send_frame(&mut self, payload: &[u8]) -> Result<(), RtpError> {
        if self.fail_sends {
            return Err(RtpError::Send(io::Error::new(io::ErrorKind::Other, "link down")));
        }
        let at = self.elapsed();
        self.sent.push((at, payload.to_vec()));
        Ok(())
    }

    async fn receive_frame(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, RtpError> {
        let deadline = Instant::now() + timeout;
        loop {
            let at = self.slot_time(self.rx_slot);
            if at > deadline {
                tokio::time::sleep_until(deadline).await;
                return Ok(None);
            }
            self.rx_slot += 1;
            if let Some(frame) = (self.source)(at - self.start) {
                tokio::time::sleep_until(at).await;
                let now = self.elapsed();
                self.received.push(now);
                return Ok(Some(frame));
            }
        }
    }

    async fn flush(&mut self, limit: usize) -> usize {
        let now = Instant::now();
        let mut cleared = 0;
        while cleared < limit && self.slot_time(self.rx_slot) <= now {
            if (self.source)(self.slot_time(self.rx_slot) - self.start).is_some() {
                cleared += 1;
            }
            self.rx_slot += 1;
        }
        cleared
    }

    fn start_talkspurt(&mut self) {
        let at = self.elapsed();
        self.talkspurts.push(at);
    }
}
