//! Boundaries to the speech, language and hardware collaborators.
//!
//! The conversation loop only sees these traits. The stand-ins at the
//! bottom let the binary run a full call without any cloud credentials
//! or GPIO hardware.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::ServiceError;
use crate::resample::TELEPHONY_RATE;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Mono PCM16 audio delivered progressively by a synthesizer.
pub struct SpeechStream {
    pub sample_rate: u32,
    pub chunks: mpsc::Receiver<Vec<i16>>,
}

impl SpeechStream {
    /// Producer half for a synthesizer that streams as it renders.
    pub fn channel(sample_rate: u32, buffer: usize) -> (mpsc::Sender<Vec<i16>>, Self) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (
            tx,
            Self {
                sample_rate,
                chunks: rx,
            },
        )
    }

    /// A stream holding one already-rendered buffer.
    pub fn from_samples(sample_rate: u32, samples: Vec<i16>) -> Self {
        let (tx, stream) = Self::channel(sample_rate, 1);
        if !samples.is_empty() {
            // Capacity 1 and a fresh channel: cannot be full
            let _ = tx.try_send(samples);
        }
        stream
    }

    /// Drain the stream into one buffer.
    pub async fn collect(mut self) -> Vec<i16> {
        let mut samples = Vec::new();
        while let Some(chunk) = self.chunks.recv().await {
            samples.extend(chunk);
        }
        samples
    }
}

#[async_trait]
pub trait TextToSpeech: Send + Sync {
    async fn synthesize(&self, text: &str, voice_id: &str) -> Result<SpeechStream, ServiceError>;
}

#[async_trait]
pub trait SpeechToText: Send + Sync {
    /// Empty string when nothing intelligible was said.
    async fn transcribe(&self, pcm: &[i16], sample_rate: u32) -> Result<String, ServiceError>;
}

#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    /// `history` starts with the system prompt and ends just before `user_text`.
    async fn generate_reply(&self, history: &[Turn], user_text: &str) -> Result<String, ServiceError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PhoneState {
    pub off_hook: bool,
    pub nearby_presence: bool,
}

#[async_trait]
pub trait PhoneHardware: Send + Sync {
    async fn state(&self) -> PhoneState;
    async fn ring_bell(&self, duration: Duration) -> Result<(), ServiceError>;
}

/// Renders text as a quiet beep whose length follows the text length.
#[derive(Clone, Debug)]
pub struct ToneSpeech {
    pub sample_rate: u32,
    pub frequency: f64,
    pub amplitude: f64,
    pub per_char: Duration,
    pub max_duration: Duration,
}

impl Default for ToneSpeech {
    fn default() -> Self {
        Self {
            sample_rate: TELEPHONY_RATE,
            frequency: 440.0,
            amplitude: 3000.0,
            per_char: Duration::from_millis(40),
            max_duration: Duration::from_secs(6),
        }
    }
}

impl ToneSpeech {
    fn render(&self, text: &str) -> Vec<i16> {
        let duration = (self.per_char * text.chars().count() as u32).min(self.max_duration);
        let count = (duration.as_secs_f64() * self.sample_rate as f64) as usize;

        (0..count)
            .map(|n| {
                let t = n as f64 / self.sample_rate as f64;
                (self.amplitude * (2.0 * std::f64::consts::PI * self.frequency * t).sin()) as i16
            })
            .collect()
    }
}

#[async_trait]
impl TextToSpeech for ToneSpeech {
    async fn synthesize(&self, text: &str, voice_id: &str) -> Result<SpeechStream, ServiceError> {
        tracing::debug!("[TTS] Tone stand-in for voice {}: {:?}", voice_id, text);
        Ok(SpeechStream::from_samples(self.sample_rate, self.render(text)))
    }
}

/// Never recognizes anything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoTranscription;

#[async_trait]
impl SpeechToText for NoTranscription {
    async fn transcribe(&self, pcm: &[i16], _sample_rate: u32) -> Result<String, ServiceError> {
        tracing::debug!("[STT] No transcriber configured, ignoring {} samples", pcm.len());
        Ok(String::new())
    }
}

/// Cycles through a fixed list of replies.
#[derive(Debug)]
pub struct CannedReplies {
    lines: Vec<String>,
    next: AtomicUsize,
}

impl CannedReplies {
    pub fn new(lines: Vec<String>) -> Self {
        Self {
            lines,
            next: AtomicUsize::new(0),
        }
    }
}

impl Default for CannedReplies {
    fn default() -> Self {
        Self::new(vec![
            "Fascinating. Tell me more.".to_string(),
            "I had not considered that. What else?".to_string(),
            "An excellent question for another century.".to_string(),
        ])
    }
}

#[async_trait]
impl ReplyGenerator for CannedReplies {
    async fn generate_reply(&self, _history: &[Turn], _user_text: &str) -> Result<String, ServiceError> {
        if self.lines.is_empty() {
            return Err(ServiceError::Reply("no canned replies configured".to_string()));
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.lines.len();
        Ok(self.lines[index].clone())
    }
}

/// Off the target hardware: handset always lifted, someone always nearby.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoHardware;

#[async_trait]
impl PhoneHardware for NoHardware {
    async fn state(&self) -> PhoneState {
        PhoneState {
            off_hook: true,
            nearby_presence: true,
        }
    }

    async fn ring_bell(&self, duration: Duration) -> Result<(), ServiceError> {
        tracing::debug!("[Hardware] No bell attached, skipping {:?} ring", duration);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_speech_stream_from_samples() {
        let stream = SpeechStream::from_samples(8000, vec![1, 2, 3]);
        assert_eq!(stream.sample_rate, 8000);
        assert_eq!(stream.collect().await, vec![1, 2, 3]);

        let empty = SpeechStream::from_samples(8000, Vec::new());
        assert!(empty.collect().await.is_empty());
    }

    #[tokio::test]
    async fn test_speech_stream_channel() {
        let (tx, stream) = SpeechStream::channel(16000, 4);
        tokio::spawn(async move {
            for i in 0..3 {
                tx.send(vec![i; 10]).await.unwrap();
            }
        });
        let samples = stream.collect().await;
        assert_eq!(samples.len(), 30);
        assert_eq!(samples[29], 2);
    }

    #[tokio::test]
    async fn test_tone_speech_length_follows_text() {
        let tts = ToneSpeech::default();
        let short = tts.synthesize("Hi", "voice").await.unwrap().collect().await;
        let long = tts.synthesize("Hello there, friend", "voice").await.unwrap().collect().await;

        assert_eq!(short.len(), 640);
        assert!(long.len() > short.len());

        let capped = tts.synthesize(&"a".repeat(1000), "voice").await.unwrap().collect().await;
        assert_eq!(capped.len(), 6 * 8000);
    }

    #[tokio::test]
    async fn test_canned_replies_cycle() {
        let replies = CannedReplies::new(vec!["one".into(), "two".into()]);
        let history = [Turn::system("prompt")];
        assert_eq!(replies.generate_reply(&history, "x").await.unwrap(), "one");
        assert_eq!(replies.generate_reply(&history, "x").await.unwrap(), "two");
        assert_eq!(replies.generate_reply(&history, "x").await.unwrap(), "one");

        let empty = CannedReplies::new(Vec::new());
        assert!(empty.generate_reply(&history, "x").await.is_err());
    }

    #[tokio::test]
    async fn test_stand_ins() {
        assert_eq!(NoTranscription.transcribe(&[0; 160], 8000).await.unwrap(), "");
        let state = NoHardware.state().await;
        assert!(state.off_hook && state.nearby_presence);
        NoHardware.ring_bell(Duration::from_secs(1)).await.unwrap();
    }
}
