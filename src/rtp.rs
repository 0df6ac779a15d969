use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;

use crate::error::RtpError;

/// RTP payload type for PCMU (RFC 3551)
pub const PAYLOAD_TYPE_PCMU: u8 = 0;

/// 20ms of audio at 8kHz
pub const SAMPLES_PER_FRAME: usize = 160;

pub const FRAME_DURATION: Duration = Duration::from_millis(20);

pub const HEADER_LEN: usize = 12;

const MAX_DATAGRAM: usize = 2048;

/// RTP packet structure (RFC 3550)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub marker: bool,          // 1 bit
    pub payload_type: u8,      // 7 bits
    pub sequence_number: u16,  // 16 bits
    pub timestamp: u32,        // 32 bits
    pub ssrc: u32,             // 32 bits (synchronization source)
    pub payload: Vec<u8>,      // Variable length
}

impl RtpPacket {
    pub fn new(payload_type: u8, sequence_number: u16, timestamp: u32, ssrc: u32, payload: Vec<u8>) -> Self {
        Self {
            marker: false,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            payload,
        }
    }

    /// Serialize with version 2 and no padding, extension or CSRCs.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LEN + self.payload.len());

        // Byte 0: V(2), P(1), X(1), CC(4)
        bytes.push(2 << 6);

        // Byte 1: M(1), PT(7)
        bytes.push(((self.marker as u8) << 7) | (self.payload_type & 0x7F));

        bytes.extend_from_slice(&self.sequence_number.to_be_bytes());
        bytes.extend_from_slice(&self.timestamp.to_be_bytes());
        bytes.extend_from_slice(&self.ssrc.to_be_bytes());
        bytes.extend_from_slice(&self.payload);

        bytes
    }

    /// Parse an RTP packet, skipping any CSRC list.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RtpError> {
        if bytes.len() < HEADER_LEN {
            return Err(RtpError::PacketTooShort(bytes.len()));
        }

        let csrc_count = (bytes[0] & 0x0F) as usize;
        let marker = (bytes[1] & 0x80) != 0;
        let payload_type = bytes[1] & 0x7F;

        let sequence_number = u16::from_be_bytes([bytes[2], bytes[3]]);
        let timestamp = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let ssrc = u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);

        let header_len = HEADER_LEN + csrc_count * 4;
        if bytes.len() < header_len {
            return Err(RtpError::PacketTooShort(bytes.len()));
        }

        Ok(Self {
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            payload: bytes[header_len..].to_vec(),
        })
    }
}

/// Sequence/timestamp/SSRC for one outbound stream.
///
/// Both counters wrap; neither ever repeats or moves backwards within the
/// life of one media session.
#[derive(Debug, Clone)]
pub struct RtpStreamState {
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpStreamState {
    pub fn random() -> Self {
        Self {
            sequence: rand::random(),
            timestamp: rand::random(),
            ssrc: rand::random(),
        }
    }

    /// Return the counters for the next packet and advance past them.
    pub fn advance(&mut self) -> (u16, u32) {
        let current = (self.sequence, self.timestamp);
        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(SAMPLES_PER_FRAME as u32);
        current
    }
}

/// Frame-level media I/O used by the playback and capture loops.
#[async_trait]
pub trait MediaPort: Send {
    async fn send_frame(&mut self, payload: &[u8]) -> Result<(), RtpError>;

    /// Bounded wait for one inbound frame; `Ok(None)` on timeout.
    async fn receive_frame(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, RtpError>;

    /// Discard queued inbound frames, returning how many were dropped.
    async fn flush(&mut self, limit: usize) -> usize;

    /// Set the marker bit on the next outbound packet.
    fn start_talkspurt(&mut self) {}
}

/// RTP session for a call
#[derive(Debug)]
pub struct RtpSession {
    socket: UdpSocket,
    local_addr: SocketAddr,
    remote_addr: Option<SocketAddr>,
    stream: RtpStreamState,
    payload_type: u8,
    marker_pending: bool,
}

impl RtpSession {
    /// Bind the local RTP socket. No packet is sent until `set_remote` is called.
    pub async fn bind(local: SocketAddr) -> Result<Self, RtpError> {
        let socket = UdpSocket::bind(local).await.map_err(RtpError::Bind)?;
        let local_addr = socket.local_addr().map_err(RtpError::Bind)?;

        tracing::info!("[RTP] Socket bound to {}", local_addr);

        Ok(Self {
            socket,
            local_addr,
            remote_addr: None,
            stream: RtpStreamState::random(),
            payload_type: PAYLOAD_TYPE_PCMU,
            marker_pending: true,
        })
    }

    pub fn set_remote(&mut self, remote: SocketAddr) {
        tracing::info!("[RTP] Remote address: {}", remote);
        self.remote_addr = Some(remote);
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn stream(&self) -> &RtpStreamState {
        &self.stream
    }
}

#[async_trait]
impl MediaPort for RtpSession {
    async fn send_frame(&mut self, payload: &[u8]) -> Result<(), RtpError> {
        let remote = self.remote_addr.ok_or(RtpError::NoRemote)?;

        let mut packet = RtpPacket::new(
            self.payload_type,
            self.stream.sequence,
            self.stream.timestamp,
            self.stream.ssrc,
            payload.to_vec(),
        );
        packet.marker = self.marker_pending;

        self.socket
            .send_to(&packet.to_bytes(), remote)
            .await
            .map_err(RtpError::Send)?;

        // Counters only move once the packet is actually on the wire
        self.stream.advance();
        self.marker_pending = false;

        Ok(())
    }

    async fn receive_frame(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, RtpError> {
        let mut buf = [0u8; MAX_DATAGRAM];

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let size = match tokio::time::timeout_at(deadline, self.socket.recv_from(&mut buf)).await {
                Err(_) => return Ok(None),
                Ok(Ok((size, _))) => size,
                // ICMP port-unreachable from an earlier send surfaces here on some platforms
                Ok(Err(e)) if e.kind() == ErrorKind::ConnectionReset => continue,
                Ok(Err(e)) => return Err(RtpError::Receive(e)),
            };

            match RtpPacket::from_bytes(&buf[..size]) {
                Ok(packet) => return Ok(Some(packet.payload)),
                Err(e) => {
                    tracing::debug!("[RTP] Discarding malformed packet: {}", e);
                    continue;
                }
            }
        }
    }

    async fn flush(&mut self, limit: usize) -> usize {
        let mut buf = [0u8; MAX_DATAGRAM];
        let mut cleared = 0;

        while cleared < limit {
            match self.socket.try_recv_from(&mut buf) {
                Ok(_) => cleared += 1,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::ConnectionReset => continue,
                Err(e) => {
                    tracing::warn!("[RTP] Flush stopped on socket error: {}", e);
                    break;
                }
            }
        }

        if cleared > 5 {
            tracing::debug!("[RTP] Cleared {} buffered packets", cleared);
        }
        cleared
    }

    fn start_talkspurt(&mut self) {
        self.marker_pending = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn test_rtp_packet_serialization() {
        let packet = RtpPacket::new(0, 1234, 5678, 9012, vec![1, 2, 3, 4]);
        let bytes = packet.to_bytes();
        assert_eq!(bytes.len(), HEADER_LEN + 4);
        assert_eq!(bytes[0], 0x80);
        assert_eq!(bytes[1], 0x00);

        let parsed = RtpPacket::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, packet);
    }

    #[test]
    fn test_marker_bit() {
        let mut packet = RtpPacket::new(0, 1, 2, 3, vec![]);
        packet.marker = true;
        let bytes = packet.to_bytes();
        assert_eq!(bytes[1], 0x80);
        assert!(RtpPacket::from_bytes(&bytes).unwrap().marker);
    }

    #[test]
    fn test_short_packet_rejected() {
        assert!(matches!(
            RtpPacket::from_bytes(&[0x80; 11]),
            Err(RtpError::PacketTooShort(11))
        ));

        // CSRC count claims more header than is present
        let mut bytes = RtpPacket::new(0, 1, 2, 3, vec![]).to_bytes();
        bytes[0] |= 0x02;
        assert!(RtpPacket::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_stream_counters_wrap() {
        let mut stream = RtpStreamState {
            sequence: u16::MAX - 1,
            timestamp: u32::MAX - 100,
            ssrc: 7,
        };

        assert_eq!(stream.advance(), (u16::MAX - 1, u32::MAX - 100));
        assert_eq!(stream.advance(), (u16::MAX, 59));
        assert_eq!(stream.advance(), (0, 219));
        assert_eq!(stream.advance(), (1, 379));
    }

    #[tokio::test]
    async fn test_send_without_remote_fails() {
        let mut session = RtpSession::bind(loopback()).await.unwrap();
        assert!(matches!(
            session.send_frame(&[0xFF; SAMPLES_PER_FRAME]).await,
            Err(RtpError::NoRemote)
        ));
    }

    #[tokio::test]
    async fn test_sent_counters_are_monotonic() {
        let peer = UdpSocket::bind(loopback()).await.unwrap();
        let mut session = RtpSession::bind(loopback()).await.unwrap();
        session.set_remote(peer.local_addr().unwrap());

        let first = session.stream().clone();
        let count = 40u16;
        for _ in 0..count {
            session.send_frame(&[0xFF; SAMPLES_PER_FRAME]).await.unwrap();
        }

        let mut seen = HashSet::new();
        let mut buf = [0u8; MAX_DATAGRAM];
        for i in 0..count {
            let (size, _) = peer.recv_from(&mut buf).await.unwrap();
            let packet = RtpPacket::from_bytes(&buf[..size]).unwrap();

            assert_eq!(packet.payload_type, PAYLOAD_TYPE_PCMU);
            assert_eq!(packet.ssrc, first.ssrc);
            assert_eq!(packet.payload.len(), SAMPLES_PER_FRAME);
            assert_eq!(packet.sequence_number, first.sequence.wrapping_add(i));
            assert_eq!(
                packet.timestamp,
                first.timestamp.wrapping_add(160 * i as u32)
            );
            assert_eq!(packet.marker, i == 0);
            assert!(seen.insert(packet.sequence_number));
        }
    }

    #[tokio::test]
    async fn test_receive_timeout_and_malformed() {
        let mut session = RtpSession::bind(loopback()).await.unwrap();
        let peer = UdpSocket::bind(loopback()).await.unwrap();

        let none = session.receive_frame(Duration::from_millis(20)).await.unwrap();
        assert!(none.is_none());

        peer.send_to(&[1, 2, 3], session.local_addr()).await.unwrap();
        let packet = RtpPacket::new(0, 9, 9, 9, vec![0xAA; 160]);
        peer.send_to(&packet.to_bytes(), session.local_addr()).await.unwrap();

        let payload = session
            .receive_frame(Duration::from_millis(500))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload, vec![0xAA; 160]);
    }

    #[tokio::test]
    async fn test_flush_before_listen_discards_whole_backlog() {
        let mut session = RtpSession::bind(loopback()).await.unwrap();
        let peer = UdpSocket::bind(loopback()).await.unwrap();

        // 3 seconds of caller audio queued while a reply was being generated
        let packet = RtpPacket::new(0, 1, 1, 1, vec![0x10; 160]).to_bytes();
        for _ in 0..150 {
            peer.send_to(&packet, session.local_addr()).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let limit = crate::config::ListenSettings::default().flush_limit;
        assert_eq!(session.flush(limit).await, 150);
        let stale = session.receive_frame(Duration::from_millis(10)).await.unwrap();
        assert!(stale.is_none());
    }

    #[tokio::test]
    async fn test_flush_drains_queue() {
        let mut session = RtpSession::bind(loopback()).await.unwrap();
        let peer = UdpSocket::bind(loopback()).await.unwrap();

        let packet = RtpPacket::new(0, 1, 1, 1, vec![0x00; 160]).to_bytes();
        for _ in 0..10 {
            peer.send_to(&packet, session.local_addr()).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(session.flush(50).await, 10);
        let none = session.receive_frame(Duration::from_millis(10)).await.unwrap();
        assert!(none.is_none());
    }
}
