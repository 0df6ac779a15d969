//! Drives one phone conversation: dial, greet, then listen/reply until
//! someone hangs up.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::time::Instant;

use crate::audio::{self, ListenEnd, PlaybackOutcome};
use crate::bargein::PlaybackSession;
use crate::call::{Call, CallConfig};
use crate::config::{BargeInSettings, ConversationSettings, ListenSettings, Settings};
use crate::error::{CallError, RtpError};
use crate::persona::{Persona, FAREWELL};
use crate::resample::TELEPHONY_RATE;
use crate::rtp::MediaPort;
use crate::services::{
    CannedReplies, NoHardware, NoTranscription, PhoneHardware, ReplyGenerator, SpeechToText,
    TextToSpeech, ToneSpeech, Turn,
};

pub const FALLBACK_REPLY: &str = "I'm having trouble thinking right now. Could you repeat that?";

const GOODBYE_WORDS: &[&str] = &["goodbye", "bye"];
const GOODBYE_PHRASES: &[&[&str]] = &[&["end", "call"], &["hang", "up"]];

/// The external services a conversation talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub tts: Arc<dyn TextToSpeech>,
    pub stt: Arc<dyn SpeechToText>,
    pub replies: Arc<dyn ReplyGenerator>,
    pub hardware: Arc<dyn PhoneHardware>,
}

impl Collaborators {
    /// Stand-ins that need no credentials or hardware.
    pub fn offline() -> Self {
        Self {
            tts: Arc::new(ToneSpeech::default()),
            stt: Arc::new(NoTranscription),
            replies: Arc::new(CannedReplies::default()),
            hardware: Arc::new(NoHardware),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndReason {
    CallerSaidGoodbye,
    RemoteHangUp,
    OnHook,
    NobodyNearby,
    MediaFailure,
    /// The local operator asked the hotline to stop
    Shutdown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConversationSummary {
    pub turns: usize,
    pub interruptions: usize,
    pub check_ins: usize,
    pub ended_by: EndReason,
}

/// True if the caller is saying goodbye.
pub fn is_goodbye(text: &str) -> bool {
    let words: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric() && c != '\'')
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect();

    words.iter().any(|w| GOODBYE_WORDS.contains(&w.as_str()))
        || GOODBYE_PHRASES.iter().any(|phrase| {
            words
                .windows(phrase.len())
                .any(|window| window.iter().zip(phrase.iter()).all(|(w, p)| w == p))
        })
}

pub struct Conversation {
    persona: &'static Persona,
    settings: ConversationSettings,
    barge_in: BargeInSettings,
    listen: ListenSettings,
    max_send_failures: u32,
    services: Collaborators,

    history: Vec<Turn>,
    last_interaction: Instant,
    pending_check_ins: usize,
    turns: usize,
    interruptions: usize,
    check_ins: usize,
}

impl Conversation {
    pub fn new(persona: &'static Persona, settings: &Settings, services: Collaborators) -> Self {
        Self {
            persona,
            settings: settings.conversation.clone(),
            barge_in: settings.barge_in.clone(),
            listen: settings.listen.clone(),
            max_send_failures: settings.media.max_send_failures,
            services,
            history: Vec::new(),
            last_interaction: Instant::now(),
            pending_check_ins: 0,
            turns: 0,
            interruptions: 0,
            check_ins: 0,
        }
    }

    pub fn persona(&self) -> &'static Persona {
        self.persona
    }

    /// Completed user/assistant turns, oldest first.
    pub fn history(&self) -> &[Turn] {
        &self.history
    }

    fn summary(&self, ended_by: EndReason) -> ConversationSummary {
        ConversationSummary {
            turns: self.turns,
            interruptions: self.interruptions,
            check_ins: self.check_ins,
            ended_by,
        }
    }

    /// Place the call, hold the conversation and always hang up afterwards.
    pub async fn run(&mut self, config: CallConfig) -> Result<ConversationSummary, CallError> {
        self.run_until(config, std::future::pending()).await
    }

    /// Like [`run`](Self::run), but ends the call with a BYE as soon as
    /// `shutdown` completes.
    pub async fn run_until<F>(
        &mut self,
        config: CallConfig,
        shutdown: F,
    ) -> Result<ConversationSummary, CallError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let phone = self.services.hardware.state().await;
        if !phone.nearby_presence {
            tracing::info!("[Conversation] Nobody near the phone, not calling");
            return Ok(self.summary(EndReason::NobodyNearby));
        }

        if self.settings.ring_secs > 0 {
            let ring = Duration::from_secs(self.settings.ring_secs);
            if let Err(e) = self.services.hardware.ring_bell(ring).await {
                tracing::warn!("[Conversation] Could not ring bell: {}", e);
            }
        }

        tracing::info!("[Conversation] Starting call with {}", self.persona.name);

        let mut call = Call::connect(config).await?;
        let answered = tokio::select! {
            result = call.invite() => Some(result),
            _ = &mut shutdown => None,
        };
        match answered {
            Some(result) => result?,
            None => {
                tracing::info!("[Conversation] Shutdown before answer, abandoning call");
                call.hang_up().await?;
                return Ok(self.summary(EndReason::Shutdown));
            }
        }

        let control = call.control();
        let ended_by = tokio::select! {
            result = self.converse(call.rtp_mut(), control.active_flag()) => match result {
                Ok(reason) => reason,
                Err(e) => {
                    tracing::error!("[Conversation] Media failure: {}", e);
                    EndReason::MediaFailure
                }
            },
            _ = &mut shutdown => {
                tracing::info!("[Conversation] Shutdown requested, hanging up");
                EndReason::Shutdown
            }
        };

        if let Err(e) = call.hang_up().await {
            tracing::warn!("[Conversation] Hang-up failed: {}", e);
        }
        if ended_by == EndReason::MediaFailure {
            call.mark_failed();
        }

        let summary = self.summary(ended_by);
        tracing::info!(
            "[Conversation] Call ended ({:?}): {} turns, {} interruptions, {} check-ins",
            summary.ended_by,
            summary.turns,
            summary.interruptions,
            summary.check_ins
        );
        Ok(summary)
    }

    /// Conversation loop over an established media path.
    pub async fn converse<P>(&mut self, port: &mut P, active: &AtomicBool) -> Result<EndReason, RtpError>
    where
        P: MediaPort + ?Sized,
    {
        let greeting = PlaybackSession::for_greeting(&self.barge_in);
        if self.say(port, self.persona.greeting, greeting, active).await? == PlaybackOutcome::HungUp {
            return Ok(EndReason::RemoteHangUp);
        }
        self.last_interaction = Instant::now();

        loop {
            if !active.load(Ordering::Acquire) {
                return Ok(EndReason::RemoteHangUp);
            }
            if !self.services.hardware.state().await.off_hook {
                tracing::info!("[Conversation] Handset back on hook");
                return Ok(EndReason::OnHook);
            }

            port.flush(self.listen.flush_limit).await;
            let utterance = audio::listen(port, &self.listen, active).await?;
            if utterance.ended == ListenEnd::HungUp {
                return Ok(EndReason::RemoteHangUp);
            }

            let text = if utterance.speech_detected {
                self.transcribe(&utterance.samples).await
            } else {
                String::new()
            };

            if text.is_empty() {
                if self.check_in_due() {
                    let line = self.next_check_in();
                    self.check_ins += 1;
                    tracing::info!("[Conversation] Natural check-in #{}: {}", self.pending_check_ins, line);
                    let session = PlaybackSession::for_reply(&self.barge_in);
                    if self.say(port, line, session, active).await? == PlaybackOutcome::HungUp {
                        return Ok(EndReason::RemoteHangUp);
                    }
                } else {
                    tracing::debug!("[Conversation] Waiting quietly");
                }
                continue;
            }

            tracing::info!("[Conversation] Caller: {}", text);
            self.last_interaction = Instant::now();
            self.pending_check_ins = 0;

            if is_goodbye(&text) {
                let session = PlaybackSession::for_reply(&self.barge_in);
                self.say(port, FAREWELL, session, active).await?;
                return Ok(EndReason::CallerSaidGoodbye);
            }

            let reply = self.reply_to(text).await;
            self.turns += 1;

            let session = PlaybackSession::for_reply(&self.barge_in);
            if self.say(port, &reply, session, active).await? == PlaybackOutcome::HungUp {
                return Ok(EndReason::RemoteHangUp);
            }
        }
    }

    async fn transcribe(&self, samples: &[i16]) -> String {
        match self.services.stt.transcribe(samples, TELEPHONY_RATE).await {
            Ok(text) => text.trim().to_string(),
            Err(e) => {
                tracing::warn!("[Conversation] {}", e);
                String::new()
            }
        }
    }

    /// System prompt plus the most recent turns.
    fn window(&self) -> Vec<Turn> {
        let skip = self.history.len().saturating_sub(self.settings.history_window);
        std::iter::once(Turn::system(self.persona.system_prompt()))
            .chain(self.history[skip..].iter().cloned())
            .collect()
    }

    async fn reply_to(&mut self, text: String) -> String {
        let window = self.window();
        let generated = self.services.replies.generate_reply(&window, &text).await;
        self.history.push(Turn::user(text));

        match generated {
            Ok(reply) if !reply.trim().is_empty() => {
                self.history.push(Turn::assistant(reply.clone()));
                reply
            }
            Ok(_) => {
                tracing::warn!("[Conversation] Empty reply, using fallback");
                FALLBACK_REPLY.to_string()
            }
            Err(e) => {
                tracing::warn!("[Conversation] {}", e);
                FALLBACK_REPLY.to_string()
            }
        }
    }

    fn check_in_due(&self) -> bool {
        Instant::now() - self.last_interaction > self.settings.check_in_after(self.pending_check_ins)
    }

    fn next_check_in(&mut self) -> &'static str {
        self.pending_check_ins += 1;
        let lines = self.persona.check_in_lines();
        lines
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or("Are you still there?")
    }

    /// Synthesize and play one line. A synthesis failure skips the line.
    async fn say<P>(
        &mut self,
        port: &mut P,
        text: &str,
        session: PlaybackSession,
        active: &AtomicBool,
    ) -> Result<PlaybackOutcome, RtpError>
    where
        P: MediaPort + ?Sized,
    {
        tracing::info!("[Conversation] {}: {}", self.persona.name, text);

        let speech = match self.services.tts.synthesize(text, self.persona.voice_id).await {
            Ok(speech) => speech,
            Err(e) => {
                tracing::warn!("[Conversation] {}", e);
                return Ok(PlaybackOutcome::Completed);
            }
        };

        let outcome = audio::speak(port, speech, session, active, self.max_send_failures).await?;
        if outcome == PlaybackOutcome::Interrupted {
            self.interruptions += 1;
        }
        Ok(outcome)
    }
}
