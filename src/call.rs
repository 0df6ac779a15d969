use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::error::{CallError, SdpError};
use crate::rtp::{RtpSession, PAYLOAD_TYPE_PCMU};
use crate::sdp;
use crate::sip::{self, Method, SipMessage, StartLine, USER_AGENT};

const MAX_SIP_DATAGRAM: usize = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Calling,
    Ringing,
    Established,
    Terminating,
    Terminated,
    Failed,
}

/// Everything needed to place one outbound call.
#[derive(Clone, Debug)]
pub struct CallConfig {
    /// Proxy (or ATA) that receives INVITE/ACK/BYE
    pub proxy_addr: SocketAddr,
    /// Address advertised in Via/Contact/SDP
    pub local_ip: IpAddr,
    /// 0 picks an ephemeral port
    pub sip_port: u16,
    pub rtp_port: u16,
    pub target_user: String,
    pub caller_user: String,
    pub invite_timeout: Duration,
    pub bye_timeout: Duration,
    /// Fixed Call-ID; generated when `None`
    pub call_id: Option<String>,
}

/// State shared between the conversation task and the BYE monitor task.
///
/// `active` is written only by the monitor once the call is up; the
/// conversation loop just reads it.
#[derive(Debug, Default)]
pub struct CallControl {
    active: AtomicBool,
    ended: Notify,
}

impl CallControl {
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn active_flag(&self) -> &AtomicBool {
        &self.active
    }

    fn mark_active(&self) {
        self.active.store(true, Ordering::Release);
    }

    fn mark_remote_hangup(&self) {
        self.active.store(false, Ordering::Release);
        self.ended.notify_one();
    }

    fn confirm_bye(&self) {
        self.ended.notify_one();
    }
}

/// Negotiated media endpoints for one call (PCMU/8000 only).
#[derive(Debug)]
pub struct MediaSession {
    pub rtp: RtpSession,
    pub advertised: SocketAddr,
}

/// One outbound SIP dialog driven as a UAC.
pub struct Call {
    config: CallConfig,
    state: CallState,
    call_id: String,
    local_tag: String,
    remote_tag: Option<String>,
    cseq: u32,
    socket: Arc<UdpSocket>,
    local_sip: SocketAddr,
    local_uri: String,
    target_uri: String,
    media: MediaSession,
    control: Arc<CallControl>,
    monitor: Option<JoinHandle<()>>,
}

impl Call {
    /// Bind the signaling and RTP sockets so the real RTP port can go in the offer.
    pub async fn connect(config: CallConfig) -> Result<Self, CallError> {
        let socket = UdpSocket::bind(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            config.sip_port,
        ))
        .await?;
        let local_sip = SocketAddr::new(config.local_ip, socket.local_addr()?.port());

        let rtp = RtpSession::bind(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            config.rtp_port,
        ))
        .await?;
        let advertised = SocketAddr::new(config.local_ip, rtp.local_port());

        tracing::info!("[SIP] Signaling socket bound, advertised address: {}", local_sip);

        let call_id = config
            .call_id
            .clone()
            .unwrap_or_else(|| sip::new_call_id(&config.local_ip.to_string()));
        let target_uri = format!("sip:{}@{}", config.target_user, config.proxy_addr);
        let local_uri = format!("sip:{}@{}", config.caller_user, config.local_ip);

        Ok(Self {
            config,
            state: CallState::Idle,
            call_id,
            local_tag: sip::new_tag(),
            remote_tag: None,
            cseq: 1,
            socket: Arc::new(socket),
            local_sip,
            local_uri,
            target_uri,
            media: MediaSession { rtp, advertised },
            control: Arc::new(CallControl::default()),
            monitor: None,
        })
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    /// Established and not hung up by the far end.
    pub fn is_active(&self) -> bool {
        self.state == CallState::Established && self.control.is_active()
    }

    pub fn control(&self) -> Arc<CallControl> {
        self.control.clone()
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn remote_tag(&self) -> Option<&str> {
        self.remote_tag.as_deref()
    }

    pub fn cseq(&self) -> u32 {
        self.cseq
    }

    pub fn local_sip_addr(&self) -> SocketAddr {
        self.local_sip
    }

    pub fn media(&self) -> &MediaSession {
        &self.media
    }

    pub fn rtp_mut(&mut self) -> &mut RtpSession {
        &mut self.media.rtp
    }

    pub fn remote_rtp(&self) -> Option<SocketAddr> {
        self.media.rtp.remote_addr()
    }

    /// Record a media failure after the dialog has been torn down.
    pub fn mark_failed(&mut self) {
        self.stop_monitor();
        self.state = CallState::Failed;
    }

    /// Send INVITE and drive the dialog to Established or Failed.
    pub async fn invite(&mut self) -> Result<(), CallError> {
        if self.state != CallState::Idle {
            return Err(CallError::InvalidState(self.state));
        }

        let session_id = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let offer = sdp::build_offer(self.config.local_ip, self.media.advertised.port(), session_id);

        let invite = self
            .request(Method::Invite, self.cseq)
            .with_header(
                "Contact",
                format!("<sip:{}@{}>", self.config.caller_user, self.local_sip),
            )
            .with_body("application/sdp", offer);

        tracing::info!("[SIP] Calling {} via {}", self.target_uri, self.config.proxy_addr);
        tracing::debug!("[SIP] INVITE:\n{}", String::from_utf8_lossy(&invite.to_bytes()));

        if let Err(e) = self.socket.send_to(&invite.to_bytes(), self.config.proxy_addr).await {
            self.state = CallState::Failed;
            return Err(e.into());
        }
        self.state = CallState::Calling;

        let deadline = tokio::time::Instant::now() + self.config.invite_timeout;
        let mut buf = vec![0u8; MAX_SIP_DATAGRAM];

        loop {
            let (size, from) = match tokio::time::timeout_at(deadline, self.socket.recv_from(&mut buf)).await {
                Err(_) => {
                    tracing::warn!("[SIP] Timeout waiting for INVITE response");
                    self.state = CallState::Failed;
                    return Err(CallError::Timeout("INVITE response"));
                }
                Ok(Err(e)) if e.kind() == ErrorKind::ConnectionReset => continue,
                Ok(Err(e)) => {
                    self.state = CallState::Failed;
                    return Err(e.into());
                }
                Ok(Ok(received)) => received,
            };

            let response = match SipMessage::parse(&buf[..size]) {
                Ok(msg) if msg.is_response() => msg,
                Ok(msg) => {
                    tracing::debug!("[SIP] Ignoring request during call setup: {}", msg.summary());
                    continue;
                }
                Err(e) => {
                    tracing::debug!("[SIP] Ignoring unparsable datagram from {}: {}", from, e);
                    continue;
                }
            };

            if response.call_id().ok() != Some(self.call_id.as_str()) {
                tracing::debug!("[SIP] Ignoring response for another call: {}", response.summary());
                continue;
            }
            if !matches!(response.cseq(), Ok((_, Method::Invite))) {
                continue;
            }

            let code = response.status().unwrap_or_default();
            tracing::info!("[SIP] Received {} from {}", response.summary(), from);

            match code {
                100..=199 => {
                    if code == 180 || code == 183 {
                        tracing::info!("[SIP] Phone is ringing");
                        self.state = CallState::Ringing;
                    }
                }
                200..=299 => return self.on_answer(&response, from).await,
                _ => {
                    let reason = response.reason().unwrap_or_default().to_string();
                    tracing::warn!("[SIP] Call failed: {} {}", code, reason);
                    self.state = CallState::Failed;
                    return Err(CallError::Rejected { code, reason });
                }
            }
        }
    }

    async fn on_answer(&mut self, response: &SipMessage, from: SocketAddr) -> Result<(), CallError> {
        self.remote_tag = response.to_tag().map(str::to_string);
        tracing::info!("[SIP] Call answered, To tag: {:?}", self.remote_tag);

        // ACK reuses the INVITE's CSeq number
        let ack = self.request(Method::Ack, self.cseq).to_bytes();
        if let Err(e) = self.socket.send_to(&ack, self.config.proxy_addr).await {
            self.state = CallState::Failed;
            return Err(e.into());
        }
        tracing::debug!("[SIP] ACK sent");

        let answer = match sdp::parse_answer(&response.body) {
            Ok(answer) => answer,
            Err(e) => {
                tracing::error!("[SIP] Unusable SDP in answer: {}", e);
                self.abandon_dialog().await;
                return Err(e.into());
            }
        };

        if !answer.payload_types.is_empty() && !answer.payload_types.contains(&PAYLOAD_TYPE_PCMU) {
            tracing::error!("[SIP] Answer does not accept PCMU: {:?}", answer.payload_types);
            self.abandon_dialog().await;
            return Err(SdpError::MissingAudio.into());
        }

        let remote_ip = answer
            .connection
            .filter(|ip| !ip.is_unspecified())
            .unwrap_or_else(|| from.ip());
        self.media
            .rtp
            .set_remote(SocketAddr::new(remote_ip, answer.audio_port));

        self.control.mark_active();
        self.state = CallState::Established;

        self.monitor = Some(tokio::spawn(monitor_signaling(
            self.socket.clone(),
            self.control.clone(),
            self.call_id.clone(),
            ack,
            self.config.proxy_addr,
        )));

        tracing::info!("[SIP] Call established");
        Ok(())
    }

    /// Tear down a dialog the callee considers up but we cannot use.
    async fn abandon_dialog(&mut self) {
        self.cseq += 1;
        let bye = self.request(Method::Bye, self.cseq).to_bytes();
        if let Err(e) = self.socket.send_to(&bye, self.config.proxy_addr).await {
            tracing::warn!("[SIP] Failed to send BYE: {}", e);
        }
        self.state = CallState::Failed;
    }

    /// End the call. Safe to call in any state; sends at most one BYE.
    pub async fn hang_up(&mut self) -> Result<(), CallError> {
        match self.state {
            CallState::Established => {}
            CallState::Calling | CallState::Ringing => {
                tracing::info!("[SIP] Abandoning unanswered call");
                self.state = CallState::Terminated;
                return Ok(());
            }
            state => {
                tracing::debug!("[SIP] Hang-up ignored in state {:?}", state);
                return Ok(());
            }
        }

        if !self.control.is_active() {
            tracing::info!("[SIP] Remote side already hung up");
            self.stop_monitor();
            self.state = CallState::Terminated;
            return Ok(());
        }

        self.state = CallState::Terminating;
        self.cseq += 1;
        let bye = self.request(Method::Bye, self.cseq).to_bytes();

        tracing::info!("[SIP] Hanging up call {}", self.call_id);
        match self.socket.send_to(&bye, self.config.proxy_addr).await {
            Ok(_) => {
                let confirmed = tokio::time::timeout(self.config.bye_timeout, self.control.ended.notified()).await;
                match confirmed {
                    Ok(()) => tracing::info!("[SIP] Call terminated"),
                    Err(_) => tracing::info!("[SIP] No response to BYE (call terminated anyway)"),
                }
            }
            Err(e) => tracing::warn!("[SIP] Failed to send BYE: {}", e),
        }

        self.stop_monitor();
        self.state = CallState::Terminated;
        Ok(())
    }

    fn stop_monitor(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
    }

    fn request(&self, method: Method, cseq: u32) -> SipMessage {
        let to = match &self.remote_tag {
            Some(tag) => format!("<{}>;tag={}", self.target_uri, tag),
            None => format!("<{}>", self.target_uri),
        };

        SipMessage::request(method.clone(), &self.target_uri)
            .with_header(
                "Via",
                format!("SIP/2.0/UDP {};branch={}", self.local_sip, sip::new_branch()),
            )
            .with_header("Max-Forwards", "70")
            .with_header("From", format!("<{}>;tag={}", self.local_uri, self.local_tag))
            .with_header("To", to)
            .with_header("Call-ID", &self.call_id)
            .with_header("CSeq", format!("{} {}", cseq, method))
            .with_header("User-Agent", USER_AGENT)
    }
}

impl Drop for Call {
    fn drop(&mut self) {
        self.stop_monitor();
    }
}

/// Watch the signaling socket for the far end hanging up while the
/// conversation task is busy with media.
async fn monitor_signaling(
    socket: Arc<UdpSocket>,
    control: Arc<CallControl>,
    call_id: String,
    ack: Vec<u8>,
    proxy: SocketAddr,
) {
    tracing::info!("[SIP] Monitoring for hang-up (BYE)");
    let mut buf = vec![0u8; MAX_SIP_DATAGRAM];

    loop {
        let (size, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) if e.kind() == ErrorKind::ConnectionReset => continue,
            Err(e) => {
                tracing::warn!("[SIP] Monitor socket error: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        let msg = match SipMessage::parse(&buf[..size]) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!("[SIP] Monitor ignoring datagram from {}: {}", from, e);
                continue;
            }
        };

        if msg.call_id().ok() != Some(call_id.as_str()) {
            tracing::debug!("[SIP] Monitor ignoring {} for another call", msg.summary());
            continue;
        }

        match &msg.start {
            StartLine::Request { method: Method::Bye, .. } => {
                tracing::info!("[SIP] Hang-up detected (BYE received)");
                let ok = SipMessage::response_to(&msg, 200, "OK").to_bytes();
                if let Err(e) = socket.send_to(&ok, from).await {
                    tracing::warn!("[SIP] Failed to answer BYE: {}", e);
                }
                control.mark_remote_hangup();
                break;
            }
            StartLine::Request { method, .. } => {
                tracing::debug!("[SIP] Monitor ignoring {} request", method);
            }
            StartLine::Response { code, .. } => match msg.cseq() {
                Ok((_, Method::Bye)) => {
                    tracing::debug!("[SIP] BYE answered with {}", code);
                    control.confirm_bye();
                    break;
                }
                Ok((_, Method::Invite)) if (200..300).contains(code) => {
                    // Our ACK was lost and the callee is retransmitting its answer
                    tracing::debug!("[SIP] Re-sending ACK for retransmitted {}", code);
                    if let Err(e) = socket.send_to(&ack, proxy).await {
                        tracing::warn!("[SIP] Failed to re-send ACK: {}", e);
                    }
                }
                _ => {}
            },
        }
    }

    tracing::info!("[SIP] Hang-up monitoring stopped");
}
