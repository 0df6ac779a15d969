use std::env;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::audio::DEFAULT_MAX_SEND_FAILURES;
use crate::bargein::BargeInMonitor;
use crate::error::ConfigError;

/// Full runtime configuration. Every section falls back to its defaults
/// when missing from the settings file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub sip: SipSettings,
    pub media: MediaSettings,
    pub barge_in: BargeInSettings,
    pub listen: ListenSettings,
    pub proxy: ProxySettings,
    pub conversation: ConversationSettings,
    pub log: LogSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SipSettings {
    /// Proxy (or ATA) that receives our INVITE
    pub proxy: SocketAddr,
    /// Address advertised in SIP and SDP; detected when unset
    pub local_ip: Option<IpAddr>,
    /// 0 picks an ephemeral port
    pub local_port: u16,
    pub target_user: String,
    pub caller_user: String,
    pub invite_timeout_secs: u64,
    pub bye_timeout_secs: u64,
}

impl Default for SipSettings {
    fn default() -> Self {
        Self {
            proxy: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 254)), 5060),
            local_ip: None,
            local_port: 0,
            target_user: "1000".to_string(),
            caller_user: "hotline".to_string(),
            invite_timeout_secs: 30,
            bye_timeout_secs: 5,
        }
    }
}

impl SipSettings {
    pub fn invite_timeout(&self) -> Duration {
        Duration::from_secs(self.invite_timeout_secs)
    }

    pub fn bye_timeout(&self) -> Duration {
        Duration::from_secs(self.bye_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaSettings {
    pub rtp_port: u16,
    /// Consecutive RTP send failures before the call is treated as failed
    pub max_send_failures: u32,
}

impl Default for MediaSettings {
    fn default() -> Self {
        Self {
            rtp_port: 6000,
            max_send_failures: DEFAULT_MAX_SEND_FAILURES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BargeInSettings {
    pub greeting_grace_ms: u64,
    pub reply_grace_ms: u64,
    /// RMS in PCM16 units (1000 ≈ 3% of full scale)
    pub threshold: f64,
    pub debounce_frames: u32,
}

impl Default for BargeInSettings {
    fn default() -> Self {
        Self {
            greeting_grace_ms: 1000,
            reply_grace_ms: 500,
            threshold: 1000.0,
            debounce_frames: 1,
        }
    }
}

impl BargeInSettings {
    pub fn greeting_grace(&self) -> Duration {
        Duration::from_millis(self.greeting_grace_ms)
    }

    pub fn reply_grace(&self) -> Duration {
        Duration::from_millis(self.reply_grace_ms)
    }

    pub fn monitor(&self) -> BargeInMonitor {
        BargeInMonitor::new(self.threshold, self.debounce_frames)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenSettings {
    pub max_duration_ms: u64,
    pub silence_timeout_ms: u64,
    /// RMS above which a frame counts as speech
    pub speech_threshold: f64,
    pub poll_interval_ms: u64,
    /// Upper bound on datagrams discarded before each listen; the queue
    /// is normally drained completely well below it
    pub flush_limit: usize,
}

impl Default for ListenSettings {
    fn default() -> Self {
        Self {
            max_duration_ms: 8000,
            silence_timeout_ms: 1500,
            speech_threshold: 500.0,
            poll_interval_ms: 100,
            flush_limit: 10_000,
        }
    }
}

impl ListenSettings {
    pub fn max_duration(&self) -> Duration {
        Duration::from_millis(self.max_duration_ms)
    }

    pub fn silence_timeout(&self) -> Duration {
        Duration::from_millis(self.silence_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    pub bind: SocketAddr,
    pub ata_ip: Option<IpAddr>,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 5060),
            ata_ip: Some(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 179))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationSettings {
    pub persona: String,
    /// Most recent turns handed to the reply generator
    pub history_window: usize,
    /// Silence before the first, second, third check-in
    pub check_in_schedule_secs: Vec<u64>,
    /// Silence between check-ins once the schedule is used up
    pub check_in_repeat_secs: u64,
    /// Ring the bell this long before dialling, when hardware is present
    pub ring_secs: u64,
}

impl Default for ConversationSettings {
    fn default() -> Self {
        Self {
            persona: "einstein".to_string(),
            history_window: 20,
            check_in_schedule_secs: vec![15, 30, 60],
            check_in_repeat_secs: 90,
            ring_secs: 0,
        }
    }
}

impl ConversationSettings {
    /// Silence required before check-in number `count` (0-based).
    pub fn check_in_after(&self, count: usize) -> Duration {
        let secs = self
            .check_in_schedule_secs
            .get(count)
            .copied()
            .unwrap_or(self.check_in_repeat_secs);
        Duration::from_secs(secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// Default filter when RUST_LOG is unset
    pub level: String,
    /// Write a daily rolling log file here in addition to stderr
    pub directory: Option<PathBuf>,
    pub file_prefix: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: None,
            file_prefix: "hotline.log".to_string(),
        }
    }
}

impl Settings {
    /// Load from `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!("No settings file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let json = fs::read_to_string(path)?;
        let settings: Settings = serde_json::from_str(&json)?;
        tracing::info!("Loaded settings from: {}", path.display());
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        tracing::info!("Saved settings to: {}", path.display());
        Ok(())
    }

    /// Apply `HOTLINE_*` environment overrides.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("HOTLINE_PROXY") {
            self.sip.proxy = parse_value("HOTLINE_PROXY", &value)?;
        }
        if let Some(value) = lookup("HOTLINE_LOCAL_IP") {
            self.sip.local_ip = Some(parse_value("HOTLINE_LOCAL_IP", &value)?);
        }
        if let Some(value) = lookup("HOTLINE_RTP_PORT") {
            self.media.rtp_port = parse_value("HOTLINE_RTP_PORT", &value)?;
        }
        if let Some(value) = lookup("HOTLINE_ATA_IP") {
            self.proxy.ata_ip = Some(parse_value("HOTLINE_ATA_IP", &value)?);
        }
        if let Some(value) = lookup("HOTLINE_LOG_DIR") {
            self.log.directory = Some(PathBuf::from(value));
        }
        Ok(())
    }

    /// Configured local IP, or the detected outbound interface address.
    pub fn local_ip(&self) -> IpAddr {
        self.sip.local_ip.unwrap_or_else(|| detect_local_ip(self.sip.proxy))
    }
}

fn parse_value<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        key,
        value: value.to_string(),
    })
}

/// Address of the interface that routes towards `target`. Nothing is sent;
/// connecting a UDP socket only selects a route.
pub fn detect_local_ip(target: SocketAddr) -> IpAddr {
    let detect = || -> std::io::Result<IpAddr> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect(target)?;
        Ok(socket.local_addr()?.ip())
    };

    match detect() {
        Ok(ip) if !ip.is_unspecified() => ip,
        Ok(_) | Err(_) => {
            tracing::warn!("Could not detect local IP towards {}, using 127.0.0.1", target);
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}
