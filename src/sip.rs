//! SIP message model shared by the call engine and the proxy.
//!
//! One parser and one serializer so header extraction (`To` tag, `Call-ID`,
//! `CSeq`) lives in a single place.

use std::fmt;

use crate::error::SipError;

pub const SIP_VERSION: &str = "SIP/2.0";
pub const USER_AGENT: &str = concat!("Hotline/", env!("CARGO_PKG_VERSION"));
pub const ALLOWED_METHODS: &str = "INVITE, ACK, BYE, CANCEL, OPTIONS, REGISTER";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Register,
    Options,
    Invite,
    Ack,
    Bye,
    Cancel,
    Other(String),
}

impl Method {
    pub fn parse(token: &str) -> Self {
        match token.to_ascii_uppercase().as_str() {
            "REGISTER" => Method::Register,
            "OPTIONS" => Method::Options,
            "INVITE" => Method::Invite,
            "ACK" => Method::Ack,
            "BYE" => Method::Bye,
            "CANCEL" => Method::Cancel,
            other => Method::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Method::Register => "REGISTER",
            Method::Options => "OPTIONS",
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Bye => "BYE",
            Method::Cancel => "CANCEL",
            Method::Other(name) => name,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    Request { method: Method, uri: String },
    Response { code: u16, reason: String },
}

#[derive(Debug, Clone)]
pub struct SipMessage {
    pub start: StartLine,
    headers: Vec<(String, String)>,
    pub body: String,
}

/// Long header name for a compact form (RFC 3261 §7.3.3).
fn expand_compact(name: &str) -> &str {
    match name {
        "i" | "I" => "Call-ID",
        "f" | "F" => "From",
        "t" | "T" => "To",
        "v" | "V" => "Via",
        "l" | "L" => "Content-Length",
        "c" | "C" => "Content-Type",
        "m" | "M" => "Contact",
        other => other,
    }
}

fn split_head_and_body(input: &str) -> (&str, &str) {
    if let Some(pos) = input.find("\r\n\r\n") {
        return (&input[..pos], &input[pos + 4..]);
    }
    if let Some(pos) = input.find("\n\n") {
        return (&input[..pos], &input[pos + 2..]);
    }
    (input, "")
}

impl SipMessage {
    pub fn request(method: Method, uri: impl Into<String>) -> Self {
        Self {
            start: StartLine::Request {
                method,
                uri: uri.into(),
            },
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn response(code: u16, reason: impl Into<String>) -> Self {
        Self {
            start: StartLine::Response {
                code,
                reason: reason.into(),
            },
            headers: Vec::new(),
            body: String::new(),
        }
    }

    /// Start a response to `request`, echoing its Via, From, To, Call-ID and CSeq.
    pub fn response_to(request: &SipMessage, code: u16, reason: &str) -> Self {
        let mut response = Self::response(code, reason);
        for via in request.header_values("Via") {
            response.add_header("Via", via);
        }
        for name in ["From", "To", "Call-ID", "CSeq"] {
            if let Some(value) = request.header(name) {
                response.add_header(name, value);
            }
        }
        response
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.add_header(name, value);
        self
    }

    pub fn with_body(mut self, content_type: &str, body: impl Into<String>) -> Self {
        self.set_header("Content-Type", content_type);
        self.body = body.into();
        self
    }

    pub fn add_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.push((name.to_string(), value.into()));
    }

    /// Replace the first header called `name`, or append it.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self
            .headers
            .iter_mut()
            .find(|(n, _)| expand_compact(n).eq_ignore_ascii_case(name))
        {
            Some(entry) => entry.1 = value,
            None => self.headers.push((name.to_string(), value)),
        }
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, SipError> {
        let text = std::str::from_utf8(bytes).map_err(|_| SipError::NotUtf8)?;
        if text.trim().is_empty() {
            return Err(SipError::Empty);
        }

        let (head, body) = split_head_and_body(text.trim_start_matches(['\r', '\n']));
        let mut lines = head.lines();

        let start_line = lines.next().ok_or(SipError::Empty)?.trim();
        let start = if let Some(rest) = start_line.strip_prefix(SIP_VERSION) {
            let mut parts = rest.trim_start().splitn(2, ' ');
            let code = parts
                .next()
                .and_then(|c| c.parse::<u16>().ok())
                .filter(|c| (100..700).contains(c))
                .ok_or_else(|| SipError::StartLine(start_line.to_string()))?;
            let reason = parts.next().unwrap_or("").trim().to_string();
            StartLine::Response { code, reason }
        } else {
            let parts: Vec<&str> = start_line.split_whitespace().collect();
            match parts.as_slice() {
                [method, uri, version] if version.starts_with("SIP/") => StartLine::Request {
                    method: Method::parse(method),
                    uri: uri.to_string(),
                },
                _ => return Err(SipError::StartLine(start_line.to_string())),
            }
        };

        let mut headers: Vec<(String, String)> = Vec::new();
        for line in lines {
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }

            // Folded continuation of the previous header
            if line.starts_with(' ') || line.starts_with('\t') {
                match headers.last_mut() {
                    Some((_, value)) => {
                        value.push(' ');
                        value.push_str(line.trim());
                        continue;
                    }
                    None => return Err(SipError::HeaderLine(line.to_string())),
                }
            }

            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| SipError::HeaderLine(line.to_string()))?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        let mut message = Self {
            start,
            headers,
            body: body.to_string(),
        };

        if let Some(len) = message
            .header("Content-Length")
            .and_then(|v| v.parse::<usize>().ok())
        {
            if len < message.body.len() && message.body.is_char_boundary(len) {
                message.body.truncate(len);
            }
        }

        Ok(message)
    }

    /// Serialize, writing `Content-Length` from the actual body.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = String::with_capacity(256 + self.body.len());

        match &self.start {
            StartLine::Request { method, uri } => {
                out.push_str(&format!("{} {} {}\r\n", method, uri, SIP_VERSION));
            }
            StartLine::Response { code, reason } => {
                out.push_str(&format!("{} {} {}\r\n", SIP_VERSION, code, reason));
            }
        }

        for (name, value) in &self.headers {
            if expand_compact(name).eq_ignore_ascii_case("Content-Length") {
                continue;
            }
            out.push_str(&format!("{}: {}\r\n", name, value));
        }
        out.push_str(&format!("Content-Length: {}\r\n\r\n", self.body.len()));
        out.push_str(&self.body);

        out.into_bytes()
    }

    /// First value of header `name`; compact forms match their long names.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| expand_compact(n).eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn header_values<'a, 'n>(&'a self, name: &'n str) -> impl Iterator<Item = &'a str> + 'n
    where
        'a: 'n,
    {
        self.headers
            .iter()
            .filter(move |(n, _)| expand_compact(n).eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn method(&self) -> Option<&Method> {
        match &self.start {
            StartLine::Request { method, .. } => Some(method),
            StartLine::Response { .. } => None,
        }
    }

    pub fn request_uri(&self) -> Option<&str> {
        match &self.start {
            StartLine::Request { uri, .. } => Some(uri),
            StartLine::Response { .. } => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match &self.start {
            StartLine::Response { code, .. } => Some(*code),
            StartLine::Request { .. } => None,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match &self.start {
            StartLine::Response { reason, .. } => Some(reason),
            StartLine::Request { .. } => None,
        }
    }

    pub fn is_response(&self) -> bool {
        matches!(self.start, StartLine::Response { .. })
    }

    pub fn call_id(&self) -> Result<&str, SipError> {
        self.header("Call-ID").ok_or(SipError::MissingHeader("Call-ID"))
    }

    pub fn cseq(&self) -> Result<(u32, Method), SipError> {
        let value = self.header("CSeq").ok_or(SipError::MissingHeader("CSeq"))?;
        let mut parts = value.split_whitespace();
        let number = parts
            .next()
            .and_then(|n| n.parse::<u32>().ok())
            .ok_or_else(|| SipError::CSeq(value.to_string()))?;
        let method = parts
            .next()
            .map(Method::parse)
            .ok_or_else(|| SipError::CSeq(value.to_string()))?;
        Ok((number, method))
    }

    pub fn to_tag(&self) -> Option<&str> {
        self.header("To").and_then(tag_param)
    }

    pub fn from_tag(&self) -> Option<&str> {
        self.header("From").and_then(tag_param)
    }

    /// Start line for logging.
    pub fn summary(&self) -> String {
        match &self.start {
            StartLine::Request { method, uri } => format!("{} {}", method, uri),
            StartLine::Response { code, reason } => format!("{} {}", code, reason),
        }
    }
}

/// `tag` parameter of a From/To header value.
pub fn tag_param(value: &str) -> Option<&str> {
    let params = match value.rfind('>') {
        Some(idx) => &value[idx + 1..],
        None => value,
    };
    params
        .split(';')
        .map(str::trim)
        .find_map(|p| {
            p.split_once('=')
                .filter(|(k, _)| k.trim().eq_ignore_ascii_case("tag"))
                .map(|(_, v)| v.trim())
        })
        .filter(|tag| !tag.is_empty())
}

/// User part of the first SIP URI in a header value or request line.
pub fn uri_user(value: &str) -> Option<&str> {
    let start = value.find("sip:").map(|i| i + 4)?;
    let rest = &value[start..];
    let end = rest.find(|c| matches!(c, '>' | ';' | ' ')).unwrap_or(rest.len());
    let (user, _) = rest[..end].split_once('@')?;
    if user.is_empty() {
        None
    } else {
        Some(user)
    }
}

pub fn new_branch() -> String {
    format!("z9hG4bK{}", uuid::Uuid::new_v4().simple())
}

pub fn new_tag() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..10].to_string()
}

pub fn new_call_id(host: &str) -> String {
    format!("{}@{}", uuid::Uuid::new_v4(), host)
}

#[cfg(test)]
mod tests {
    use super::*;

    const OK_RESPONSE: &str = "SIP/2.0 200 OK\r\n\
        Via: SIP/2.0/UDP 10.0.0.5:5062;branch=z9hG4bKabc\r\n\
        From: <sip:hotline@10.0.0.5>;tag=1111\r\n\
        To: <sip:1000@10.0.0.1>;tag=9999\r\n\
        Call-ID: abc123\r\n\
        CSeq: 1 INVITE\r\n\
        Content-Type: application/sdp\r\n\
        Content-Length: 24\r\n\
        \r\n\
        m=audio 6000 RTP/AVP 0\r\n";

    #[test]
    fn test_parse_response() {
        let msg = SipMessage::parse(OK_RESPONSE.as_bytes()).unwrap();

        assert!(msg.is_response());
        assert_eq!(msg.status(), Some(200));
        assert_eq!(msg.reason(), Some("OK"));
        assert_eq!(msg.call_id().unwrap(), "abc123");
        assert_eq!(msg.cseq().unwrap(), (1, Method::Invite));
        assert_eq!(msg.to_tag(), Some("9999"));
        assert_eq!(msg.from_tag(), Some("1111"));
        assert_eq!(msg.body, "m=audio 6000 RTP/AVP 0\r\n");
    }

    #[test]
    fn test_parse_request_compact_headers() {
        let raw = "BYE sip:hotline@10.0.0.5 SIP/2.0\n\
                   v: SIP/2.0/UDP 10.0.0.9;branch=z9hG4bK1\n\
                   f: <sip:1000@10.0.0.1>;tag=9999\n\
                   t: <sip:hotline@10.0.0.5>;tag=1111\n\
                   i: abc123\n\
                   CSeq: 7 BYE\n\
                   l: 0\n\n";
        let msg = SipMessage::parse(raw.as_bytes()).unwrap();

        assert_eq!(msg.method(), Some(&Method::Bye));
        assert_eq!(msg.request_uri(), Some("sip:hotline@10.0.0.5"));
        assert_eq!(msg.call_id().unwrap(), "abc123");
        assert_eq!(msg.header("Via"), Some("SIP/2.0/UDP 10.0.0.9;branch=z9hG4bK1"));
        assert_eq!(msg.to_tag(), Some("1111"));
        assert_eq!(msg.cseq().unwrap(), (7, Method::Bye));
    }

    #[test]
    fn test_header_values_outlive_lookup_name() {
        let msg = SipMessage::parse(OK_RESPONSE.as_bytes()).unwrap();

        let (call_id, vias) = {
            let name = String::from("call-id");
            let via = String::from("VIA");
            let call_id = msg.header(&name);
            let vias: Vec<&str> = msg.header_values(&via).collect();
            (call_id, vias)
        };

        assert_eq!(call_id, Some("abc123"));
        assert_eq!(vias, vec!["SIP/2.0/UDP 10.0.0.5:5062;branch=z9hG4bKabc"]);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(SipMessage::parse(b""), Err(SipError::Empty)));
        assert!(matches!(
            SipMessage::parse(b"hello world\r\n\r\n"),
            Err(SipError::StartLine(_))
        ));
        assert!(matches!(
            SipMessage::parse(b"SIP/2.0 abc OK\r\n\r\n"),
            Err(SipError::StartLine(_))
        ));
        assert!(matches!(
            SipMessage::parse(b"INVITE sip:a@b SIP/2.0\r\nNoColonHere\r\n\r\n"),
            Err(SipError::HeaderLine(_))
        ));
        assert!(matches!(
            SipMessage::parse(&[0xff, 0xfe, 0x00]),
            Err(SipError::NotUtf8)
        ));
    }

    #[test]
    fn test_missing_headers() {
        let msg = SipMessage::parse(b"OPTIONS sip:a@b SIP/2.0\r\n\r\n").unwrap();
        assert!(matches!(msg.call_id(), Err(SipError::MissingHeader("Call-ID"))));
        assert!(matches!(msg.cseq(), Err(SipError::MissingHeader("CSeq"))));
        assert_eq!(msg.to_tag(), None);
    }

    #[test]
    fn test_serialize_sets_content_length() {
        let msg = SipMessage::request(Method::Invite, "sip:1000@10.0.0.1")
            .with_header("Call-ID", "xyz")
            .with_header("Content-Length", "999")
            .with_body("application/sdp", "v=0\r\n");

        let text = String::from_utf8(msg.to_bytes()).unwrap();
        assert!(text.starts_with("INVITE sip:1000@10.0.0.1 SIP/2.0\r\n"));
        assert!(text.contains("Content-Type: application/sdp\r\n"));
        assert!(text.contains("Content-Length: 5\r\n\r\nv=0\r\n"));
        assert!(!text.contains("999"));

        let reparsed = SipMessage::parse(text.as_bytes()).unwrap();
        assert_eq!(reparsed.body, "v=0\r\n");
        assert_eq!(reparsed.call_id().unwrap(), "xyz");
    }

    #[test]
    fn test_response_to_echoes_dialog_headers() {
        let request = SipMessage::parse(
            b"BYE sip:x@y SIP/2.0\r\n\
              Via: SIP/2.0/UDP 1.1.1.1;branch=a\r\n\
              Via: SIP/2.0/UDP 2.2.2.2;branch=b\r\n\
              From: <sip:1000@y>;tag=1\r\n\
              To: <sip:x@y>;tag=2\r\n\
              Call-ID: c1\r\n\
              CSeq: 3 BYE\r\n\r\n",
        )
        .unwrap();

        let response = SipMessage::response_to(&request, 200, "OK");
        let vias: Vec<&str> = response.header_values("Via").collect();

        assert_eq!(response.status(), Some(200));
        assert_eq!(vias, vec!["SIP/2.0/UDP 1.1.1.1;branch=a", "SIP/2.0/UDP 2.2.2.2;branch=b"]);
        assert_eq!(response.header("From"), Some("<sip:1000@y>;tag=1"));
        assert_eq!(response.to_tag(), Some("2"));
        assert_eq!(response.call_id().unwrap(), "c1");
        assert_eq!(response.cseq().unwrap(), (3, Method::Bye));
    }

    #[test]
    fn test_tag_and_user_helpers() {
        assert_eq!(tag_param("<sip:1000@host>;tag=abc;foo=bar"), Some("abc"));
        assert_eq!(tag_param("\"Name\" <sip:1000@host;transport=udp>"), None);
        assert_eq!(tag_param("sip:1000@host;tag=zz"), Some("zz"));
        assert_eq!(tag_param("<sip:1000@host>;tag="), None);

        assert_eq!(uri_user("sip:1000@10.0.0.1"), Some("1000"));
        assert_eq!(uri_user("<sip:1000@10.0.0.179:5060>;expires=3600"), Some("1000"));
        assert_eq!(uri_user("<sip:10.0.0.179>"), None);
    }

    #[test]
    fn test_identifier_shapes() {
        assert!(new_branch().starts_with("z9hG4bK"));
        assert_eq!(new_tag().len(), 10);
        assert!(new_call_id("10.0.0.5").ends_with("@10.0.0.5"));
        assert_ne!(new_tag(), new_tag());
    }
}
