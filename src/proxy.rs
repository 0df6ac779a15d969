//! Minimal SIP proxy/registrar sitting between the hotline and the ATA.
//!
//! Dispatch is per message and keyed by method. The only state is two
//! in-memory tables: registrations by source address and call routes by
//! Call-ID. Messages are forwarded byte for byte.

use std::collections::HashMap;
use std::io::{self, ErrorKind};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;

use crate::sip::{self, Method, SipMessage, StartLine, ALLOWED_METHODS, USER_AGENT};

const MAX_SIP_DATAGRAM: usize = 4096;
const REGISTER_EXPIRES: u32 = 3600;
/// How long a finished call waits for its last response or ACK (RFC 3261 Timer F)
const CLOSING_TTL: Duration = Duration::from_secs(32);

#[derive(Clone, Debug)]
pub struct ProxyConfig {
    pub bind: SocketAddr,
    /// Fallback callee when no registration matches the Request-URI user
    pub ata_ip: Option<IpAddr>,
}

#[derive(Clone, Debug)]
pub struct Registration {
    pub contact: String,
    pub registered_at: Instant,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Route {
    pub caller: SocketAddr,
    pub callee: SocketAddr,
}

/// A call whose route is gone but whose last message is still in flight:
/// the response to a forwarded BYE, or the ACK for a rejected INVITE.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Closing {
    responder: SocketAddr,
    originator: SocketAddr,
    ack_pending: bool,
    since: Instant,
}

/// A datagram the proxy wants on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outbound {
    pub to: SocketAddr,
    pub data: Vec<u8>,
}

impl Outbound {
    fn new(to: SocketAddr, data: Vec<u8>) -> Self {
        Self { to, data }
    }
}

/// Routing logic without any socket, so it can be driven directly.
#[derive(Debug, Default)]
pub struct ProxyCore {
    ata_ip: Option<IpAddr>,
    registrations: HashMap<SocketAddr, Registration>,
    routes: HashMap<String, Route>,
    closing: HashMap<String, Closing>,
}

impl ProxyCore {
    pub fn new(ata_ip: Option<IpAddr>) -> Self {
        Self {
            ata_ip,
            ..Default::default()
        }
    }

    pub fn registration(&self, addr: &SocketAddr) -> Option<&Registration> {
        self.registrations.get(addr)
    }

    pub fn route(&self, call_id: &str) -> Option<Route> {
        self.routes.get(call_id).copied()
    }

    pub fn active_calls(&self) -> usize {
        self.routes.len()
    }

    /// Handle one inbound datagram and return whatever must be sent in reply.
    pub fn handle(&mut self, data: &[u8], from: SocketAddr) -> Vec<Outbound> {
        self.expire_closing(Instant::now());

        let msg = match SipMessage::parse(data) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!("[Proxy] Dropping unparsable datagram from {}: {}", from, e);
                return Vec::new();
            }
        };

        tracing::info!("[Proxy] From {}: {}", from, msg.summary());

        match &msg.start {
            StartLine::Response { .. } => self.route_response(&msg, data, from),
            StartLine::Request { method, .. } => match method {
                Method::Register => self.register(&msg, from),
                Method::Options => self.options(&msg, from),
                Method::Invite => self.route_invite(&msg, data, from),
                Method::Ack | Method::Cancel => self.route_to_callee(&msg, data, from),
                Method::Bye => self.route_bye(&msg, data, from),
                Method::Other(name) => {
                    tracing::warn!("[Proxy] Unsupported method {} from {}", name, from);
                    Vec::new()
                }
            },
        }
    }

    fn expire_closing(&mut self, now: Instant) {
        self.closing
            .retain(|_, closing| now.duration_since(closing.since) < CLOSING_TTL);
    }

    fn register(&mut self, msg: &SipMessage, from: SocketAddr) -> Vec<Outbound> {
        let mut response = reply(msg, 200, "OK");

        match msg.header("Contact") {
            Some(contact) => {
                response.add_header("Contact", contact);
                self.registrations.insert(
                    from,
                    Registration {
                        contact: contact.to_string(),
                        registered_at: Instant::now(),
                    },
                );
                tracing::info!("[Proxy] Registered {} as {}", from, contact);
            }
            None => tracing::debug!("[Proxy] REGISTER without Contact from {}", from),
        }
        response.add_header("Expires", REGISTER_EXPIRES.to_string());

        vec![Outbound::new(from, response.to_bytes())]
    }

    fn options(&self, msg: &SipMessage, from: SocketAddr) -> Vec<Outbound> {
        let response = reply(msg, 200, "OK").with_header("Allow", ALLOWED_METHODS);
        vec![Outbound::new(from, response.to_bytes())]
    }

    fn find_callee(&self, msg: &SipMessage) -> Option<SocketAddr> {
        if let Some(user) = msg.request_uri().and_then(sip::uri_user) {
            let by_user = self
                .registrations
                .iter()
                .find(|(_, reg)| sip::uri_user(&reg.contact) == Some(user))
                .map(|(addr, _)| *addr);
            if by_user.is_some() {
                return by_user;
            }
        }

        let ata_ip = self.ata_ip?;
        self.registrations
            .keys()
            .find(|addr| addr.ip() == ata_ip)
            .copied()
    }

    fn route_invite(&mut self, msg: &SipMessage, data: &[u8], from: SocketAddr) -> Vec<Outbound> {
        let call_id = match msg.call_id() {
            Ok(id) => id.to_string(),
            Err(e) => {
                tracing::warn!("[Proxy] Dropping INVITE from {}: {}", from, e);
                return Vec::new();
            }
        };

        let Some(callee) = self.find_callee(msg) else {
            tracing::warn!("[Proxy] No registered callee for {}", msg.summary());
            return vec![Outbound::new(from, reply(msg, 404, "Not Found").to_bytes())];
        };

        tracing::info!("[Proxy] Forwarding INVITE {} to {}", call_id, callee);
        self.closing.remove(&call_id);
        self.routes.insert(call_id, Route { caller: from, callee });

        vec![Outbound::new(callee, data.to_vec())]
    }

    fn route_response(&mut self, msg: &SipMessage, data: &[u8], from: SocketAddr) -> Vec<Outbound> {
        let Ok(call_id) = msg.call_id() else {
            tracing::warn!("[Proxy] Dropping response without Call-ID from {}", from);
            return Vec::new();
        };

        if let Some(route) = self.routes.get(call_id).copied() {
            if from != route.callee {
                tracing::warn!("[Proxy] Unexpected response from {} for {}", from, call_id);
                return Vec::new();
            }

            let rejected = msg.status().unwrap_or_default() >= 300
                && matches!(msg.cseq(), Ok((_, Method::Invite)));
            if rejected {
                tracing::info!("[Proxy] Call {} rejected: {}", call_id, msg.summary());
                self.routes.remove(call_id);
                self.closing.insert(
                    call_id.to_string(),
                    Closing {
                        responder: route.callee,
                        originator: route.caller,
                        ack_pending: true,
                        since: Instant::now(),
                    },
                );
            }

            tracing::debug!("[Proxy] Forwarding {} to caller {}", msg.summary(), route.caller);
            return vec![Outbound::new(route.caller, data.to_vec())];
        }

        if let Some(closing) = self.closing.get(call_id).copied() {
            if from == closing.responder {
                if !closing.ack_pending {
                    self.closing.remove(call_id);
                }
                tracing::debug!("[Proxy] Forwarding final response to {}", closing.originator);
                return vec![Outbound::new(closing.originator, data.to_vec())];
            }
        }

        tracing::warn!("[Proxy] No call route for Call-ID {}", call_id);
        Vec::new()
    }

    fn route_to_callee(&mut self, msg: &SipMessage, data: &[u8], from: SocketAddr) -> Vec<Outbound> {
        let call_id = msg.call_id().ok();
        if let Some(id) = call_id {
            if msg.method() == Some(&Method::Ack) {
                let closing = self.closing.get(id).copied();
                if let Some(closing) = closing.filter(|c| c.ack_pending && c.originator == from) {
                    self.closing.remove(id);
                    tracing::debug!("[Proxy] Forwarding ACK for rejected call {}", id);
                    return vec![Outbound::new(closing.responder, data.to_vec())];
                }
            }
        }

        let route = call_id.and_then(|id| self.routes.get(id));
        match route {
            Some(route) if from == route.caller => {
                if msg.method() == Some(&Method::Ack) {
                    tracing::info!("[Proxy] Call established");
                }
                vec![Outbound::new(route.callee, data.to_vec())]
            }
            Some(_) => {
                tracing::warn!("[Proxy] Dropping {} from non-caller {}", msg.summary(), from);
                Vec::new()
            }
            None => {
                tracing::warn!("[Proxy] No call route for {} from {}", msg.summary(), from);
                Vec::new()
            }
        }
    }

    fn route_bye(&mut self, msg: &SipMessage, data: &[u8], from: SocketAddr) -> Vec<Outbound> {
        let Ok(call_id) = msg.call_id() else {
            tracing::warn!("[Proxy] Dropping BYE without Call-ID from {}", from);
            return Vec::new();
        };

        let Some(route) = self.routes.get(call_id).copied() else {
            tracing::warn!("[Proxy] No call route for BYE {} from {}", call_id, from);
            return Vec::new();
        };

        let other = if from == route.caller {
            route.callee
        } else if from == route.callee {
            route.caller
        } else {
            tracing::warn!("[Proxy] BYE for {} from outsider {}", call_id, from);
            return Vec::new();
        };

        self.routes.remove(call_id);
        self.closing.insert(
            call_id.to_string(),
            Closing {
                responder: other,
                originator: from,
                ack_pending: false,
                since: Instant::now(),
            },
        );
        tracing::info!("[Proxy] Call {} ended, forwarding BYE to {}", call_id, other);

        vec![Outbound::new(other, data.to_vec())]
    }
}

/// Locally generated response; adds a To tag when the request had none.
fn reply(request: &SipMessage, code: u16, reason: &str) -> SipMessage {
    let mut response = SipMessage::response_to(request, code, reason);
    if request.to_tag().is_none() {
        if let Some(to) = request.header("To") {
            response.set_header("To", format!("{};tag={}", to, sip::new_tag()));
        }
    }
    response.with_header("Server", USER_AGENT)
}

/// UDP front end for [`ProxyCore`].
pub struct SipProxy {
    socket: UdpSocket,
    core: ProxyCore,
}

impl SipProxy {
    pub async fn bind(config: ProxyConfig) -> io::Result<Self> {
        let socket = UdpSocket::bind(config.bind).await?;
        tracing::info!("[Proxy] Listening on {}", socket.local_addr()?);
        if let Some(ip) = config.ata_ip {
            tracing::info!("[Proxy] Default callee: ATA at {}", ip);
        }

        Ok(Self {
            socket,
            core: ProxyCore::new(config.ata_ip),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Serve until the socket fails.
    pub async fn run(mut self) -> io::Result<()> {
        let mut buf = vec![0u8; MAX_SIP_DATAGRAM];

        loop {
            let (size, from) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) if e.kind() == ErrorKind::ConnectionReset => continue,
                Err(e) => {
                    tracing::error!("[Proxy] Socket error: {}", e);
                    return Err(e);
                }
            };

            for out in self.core.handle(&buf[..size], from) {
                if let Err(e) = self.socket.send_to(&out.data, out.to).await {
                    tracing::warn!("[Proxy] Failed to send to {}: {}", out.to, e);
                }
            }
        }
    }
}
