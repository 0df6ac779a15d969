use std::net::IpAddr;

use crate::error::SdpError;

/// Media parameters taken from a remote SDP answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpAnswer {
    /// `c=` address, if the answer carried one
    pub connection: Option<IpAddr>,
    pub audio_port: u16,
    pub payload_types: Vec<u8>,
}

/// Build the PCMU-only offer sent with INVITE.
pub fn build_offer(ip: IpAddr, rtp_port: u16, session_id: u64) -> String {
    format!(
        "v=0\r\n\
         o=- {session_id} {session_id} IN IP4 {ip}\r\n\
         s=Hotline Call\r\n\
         c=IN IP4 {ip}\r\n\
         t=0 0\r\n\
         m=audio {rtp_port} RTP/AVP 0\r\n\
         a=rtpmap:0 PCMU/8000\r\n\
         a=ptime:20\r\n\
         a=sendrecv\r\n"
    )
}

/// Parse an SDP answer for its audio port and connection address.
pub fn parse_answer(sdp: &str) -> Result<SdpAnswer, SdpError> {
    let mut connection: Option<IpAddr> = None;
    let mut audio: Option<(u16, Vec<u8>)> = None;

    for line in sdp.lines() {
        let line = line.trim();

        // Connection line: c=IN IP4 <address>
        if let Some(rest) = line.strip_prefix("c=") {
            // Media-level c= after m=audio takes precedence over session level
            if connection.is_none() || audio.is_some() {
                let addr = rest
                    .split_whitespace()
                    .nth(2)
                    .ok_or_else(|| SdpError::InvalidAddress(rest.to_string()))?;
                let addr = addr.split('/').next().unwrap_or(addr);
                connection = Some(
                    addr.parse()
                        .map_err(|_| SdpError::InvalidAddress(addr.to_string()))?,
                );
            }
        }

        // Media line: m=audio <port> RTP/AVP <payload_types>
        if let Some(rest) = line.strip_prefix("m=audio") {
            if audio.is_some() {
                continue;
            }
            let mut parts = rest.split_whitespace();
            let port_str = parts.next().ok_or(SdpError::InvalidPort(String::new()))?;
            let port: u16 = port_str
                .parse()
                .map_err(|_| SdpError::InvalidPort(port_str.to_string()))?;
            if port == 0 {
                return Err(SdpError::InvalidPort(port_str.to_string()));
            }
            let payload_types = parts.skip(1).filter_map(|pt| pt.parse().ok()).collect();
            audio = Some((port, payload_types));
        }
    }

    let (audio_port, payload_types) = audio.ok_or(SdpError::MissingAudio)?;

    tracing::debug!(
        "[SDP] Parsed answer: {:?}:{}, payload types {:?}",
        connection,
        audio_port,
        payload_types
    );

    Ok(SdpAnswer {
        connection,
        audio_port,
        payload_types,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sdp_parsing() {
        let sdp = "v=0\r\n\
                   o=root 123 456 IN IP4 192.168.1.1\r\n\
                   s=Test\r\n\
                   c=IN IP4 192.168.1.100\r\n\
                   t=0 0\r\n\
                   m=audio 12345 RTP/AVP 0 8 101\r\n";

        let answer = parse_answer(sdp).unwrap();
        assert_eq!(answer.connection, Some("192.168.1.100".parse().unwrap()));
        assert_eq!(answer.audio_port, 12345);
        assert_eq!(answer.payload_types, vec![0, 8, 101]);
    }

    #[test]
    fn test_media_level_connection_wins() {
        let sdp = "v=0\nc=IN IP4 10.0.0.1\nm=audio 5004 RTP/AVP 0\nc=IN IP4 10.0.0.2\n";
        let answer = parse_answer(sdp).unwrap();
        assert_eq!(answer.connection, Some("10.0.0.2".parse().unwrap()));
    }

    #[test]
    fn test_missing_connection_is_allowed() {
        let answer = parse_answer("v=0\r\nm=audio 6000 RTP/AVP 0\r\n").unwrap();
        assert_eq!(answer.connection, None);
        assert_eq!(answer.audio_port, 6000);
    }

    #[test]
    fn test_missing_audio_line() {
        let sdp = "v=0\r\nc=IN IP4 10.0.0.1\r\nm=video 5000 RTP/AVP 96\r\n";
        assert!(matches!(parse_answer(sdp), Err(SdpError::MissingAudio)));
        assert!(matches!(parse_answer(""), Err(SdpError::MissingAudio)));
    }

    #[test]
    fn test_bad_port() {
        assert!(matches!(
            parse_answer("m=audio abc RTP/AVP 0\r\n"),
            Err(SdpError::InvalidPort(_))
        ));
        assert!(matches!(
            parse_answer("m=audio 0 RTP/AVP 0\r\n"),
            Err(SdpError::InvalidPort(_))
        ));
    }

    #[test]
    fn test_offer_lines() {
        let offer = build_offer("192.168.1.254".parse().unwrap(), 6000, 42);
        let lines: Vec<&str> = offer.lines().collect();

        assert_eq!(lines[0], "v=0");
        assert!(lines.contains(&"o=- 42 42 IN IP4 192.168.1.254"));
        assert!(lines.contains(&"c=IN IP4 192.168.1.254"));
        assert!(lines.contains(&"t=0 0"));
        assert!(lines.contains(&"m=audio 6000 RTP/AVP 0"));
        assert!(lines.contains(&"a=rtpmap:0 PCMU/8000"));
        assert!(lines.contains(&"a=sendrecv"));
        assert!(offer.ends_with("\r\n"));

        let answer = parse_answer(&offer).unwrap();
        assert_eq!(answer.audio_port, 6000);
    }
}
