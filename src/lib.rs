//! Voice hotline over SIP/RTP: a user agent that dials an analog phone
//! through an ATA, a small proxy/registrar for the local network, and
//! the conversation loop that talks to the caller.

pub mod audio;
pub mod bargein;
pub mod call;
pub mod config;
pub mod conversation;
pub mod error;
pub mod g711;
pub mod logging;
pub mod persona;
pub mod proxy;
pub mod resample;
pub mod rtp;
pub mod sdp;
pub mod services;
pub mod sip;

#[cfg(test)]
mod testing;
