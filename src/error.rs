use std::io;

use thiserror::Error;

use crate::call::CallState;

/// Errors produced while parsing or building SIP messages.
#[derive(Debug, Error)]
pub enum SipError {
    #[error("empty SIP message")]
    Empty,
    #[error("SIP message is not valid UTF-8")]
    NotUtf8,
    #[error("invalid start line: {0}")]
    StartLine(String),
    #[error("invalid header line: {0}")]
    HeaderLine(String),
    #[error("missing {0} header")]
    MissingHeader(&'static str),
    #[error("invalid CSeq: {0}")]
    CSeq(String),
}

#[derive(Debug, Error)]
pub enum SdpError {
    #[error("no m=audio line in SDP")]
    MissingAudio,
    #[error("invalid media port in SDP: {0}")]
    InvalidPort(String),
    #[error("invalid connection address in SDP: {0}")]
    InvalidAddress(String),
}

#[derive(Debug, Error)]
pub enum RtpError {
    #[error("failed to bind RTP socket: {0}")]
    Bind(#[source] io::Error),
    #[error("failed to send RTP packet: {0}")]
    Send(#[source] io::Error),
    #[error("failed to receive RTP packet: {0}")]
    Receive(#[source] io::Error),
    #[error("RTP packet too short ({0} bytes)")]
    PacketTooShort(usize),
    #[error("RTP remote endpoint not negotiated")]
    NoRemote,
    #[error("RTP send failed {consecutive} times in a row")]
    SendFailed { consecutive: u32 },
    #[error("resampling failed: {0}")]
    Resample(String),
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Sip(#[from] SipError),
    #[error(transparent)]
    Sdp(#[from] SdpError),
    #[error(transparent)]
    Media(#[from] RtpError),
    #[error("call rejected: {code} {reason}")]
    Rejected { code: u16, reason: String },
    #[error("timeout waiting for {0}")]
    Timeout(&'static str),
    #[error("operation not allowed in state {0:?}")]
    InvalidState(CallState),
}

/// Failures reported by the external speech and language collaborators.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("speech synthesis failed: {0}")]
    Synthesis(String),
    #[error("transcription failed: {0}")]
    Transcription(String),
    #[error("reply generation failed: {0}")]
    Reply(String),
    #[error("phone hardware error: {0}")]
    Hardware(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access settings file: {0}")]
    Io(#[from] io::Error),
    #[error("failed to parse settings file: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}
