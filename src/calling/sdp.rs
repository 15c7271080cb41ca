//! Minimal SDP offer/answer generation and parsing.
//!
//! Generates one m-line per local track kind (PCMU audio, VP8 video) with a
//! single set of ICE credentials and a host candidate. The parser extracts
//! just enough of a remote description to validate it and answer it.

use anyhow::{bail, Context, Result};

use super::media::TrackKind;

/// Fields extracted from a remote description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpInfo {
    pub ice_ufrag: String,
    pub ice_pwd: String,
    pub media: Vec<MediaSection>,
    /// `candidate:` values embedded in the description.
    pub candidates: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSection {
    pub kind: String,
    pub port: u16,
    pub mid: Option<String>,
    pub direction: Direction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl Direction {
    fn attribute(&self) -> &'static str {
        match self {
            Direction::SendRecv => "a=sendrecv",
            Direction::SendOnly => "a=sendonly",
            Direction::RecvOnly => "a=recvonly",
            Direction::Inactive => "a=inactive",
        }
    }

    /// Direction that answers this one.
    fn reverse(&self) -> Self {
        match self {
            Direction::SendOnly => Direction::RecvOnly,
            Direction::RecvOnly => Direction::SendOnly,
            other => *other,
        }
    }
}

/// Local transport parameters for one description.
#[derive(Debug, Clone)]
pub struct LocalParams {
    pub session_id: u64,
    pub local_ip: String,
    pub port: u16,
    pub ice_ufrag: String,
    pub ice_pwd: String,
}

impl LocalParams {
    /// Fresh credentials bound to the default outbound interface.
    pub fn generate(port: u16) -> Result<Self> {
        Ok(Self {
            session_id: u64::from_be_bytes(rand_bytes()?) >> 1,
            local_ip: get_local_ip(),
            port,
            ice_ufrag: generate_ice_ufrag()?,
            ice_pwd: generate_ice_pwd()?,
        })
    }

    /// The host candidate these parameters advertise.
    pub fn host_candidate(&self) -> String {
        format!(
            "candidate:1 1 UDP 2130706431 {} {} typ host",
            self.local_ip, self.port
        )
    }
}

fn push_session(sdp: &mut String, p: &LocalParams) {
    sdp.push_str("v=0\r\n");
    sdp.push_str(&format!(
        "o=- {} 2 IN IP4 {}\r\n",
        p.session_id, p.local_ip
    ));
    sdp.push_str("s=-\r\n");
    sdp.push_str("t=0 0\r\n");
}

fn push_media(sdp: &mut String, p: &LocalParams, kind: &str, mid: &str, direction: Direction) {
    match kind {
        "video" => {
            sdp.push_str(&format!("m=video {} RTP/AVP 96\r\n", p.port));
            sdp.push_str(&format!("c=IN IP4 {}\r\n", p.local_ip));
            sdp.push_str("a=rtpmap:96 VP8/90000\r\n");
        }
        _ => {
            sdp.push_str(&format!("m=audio {} RTP/AVP 0\r\n", p.port));
            sdp.push_str(&format!("c=IN IP4 {}\r\n", p.local_ip));
            sdp.push_str("a=rtpmap:0 PCMU/8000\r\n");
            sdp.push_str("a=ptime:20\r\n");
        }
    }
    sdp.push_str(&format!("a=mid:{}\r\n", mid));
    sdp.push_str(direction.attribute());
    sdp.push_str("\r\n");
    sdp.push_str("a=rtcp-mux\r\n");
    sdp.push_str(&format!("a=ice-ufrag:{}\r\n", p.ice_ufrag));
    sdp.push_str(&format!("a=ice-pwd:{}\r\n", p.ice_pwd));
    sdp.push_str(&format!("a={}\r\n", p.host_candidate()));
}

/// Generate an offer with one m-line per local track kind.
///
/// With no local tracks the offer still carries a receive-only audio line
/// so the remote side has something to answer.
pub fn generate_offer(p: &LocalParams, kinds: &[TrackKind]) -> String {
    let mut sdp = String::new();
    push_session(&mut sdp, p);

    if kinds.is_empty() {
        push_media(&mut sdp, p, "audio", "0", Direction::RecvOnly);
    }
    for (i, kind) in kinds.iter().enumerate() {
        push_media(&mut sdp, p, kind.as_str(), &i.to_string(), Direction::SendRecv);
    }
    sdp
}

/// Generate an answer mirroring the offer's m-lines.
///
/// Sections whose kind we have no local track for are answered recvonly
/// (or inactive if the offer does not send).
pub fn generate_answer(p: &LocalParams, offer: &SdpInfo, kinds: &[TrackKind]) -> String {
    let mut sdp = String::new();
    push_session(&mut sdp, p);

    for (i, section) in offer.media.iter().enumerate() {
        let mid = section.mid.clone().unwrap_or_else(|| i.to_string());
        let have_local = kinds.iter().any(|k| k.as_str() == section.kind);
        let direction = match (have_local, section.direction.reverse()) {
            (true, d) => d,
            (false, Direction::SendRecv | Direction::RecvOnly) => Direction::RecvOnly,
            (false, _) => Direction::Inactive,
        };
        push_media(&mut sdp, p, &section.kind, &mid, direction);
    }
    sdp
}

/// Parse a remote description.
pub fn parse_sdp(sdp: &str) -> Result<SdpInfo> {
    let mut ice_ufrag = String::new();
    let mut ice_pwd = String::new();
    let mut media: Vec<MediaSection> = Vec::new();
    let mut candidates = Vec::new();

    let mut lines = sdp.lines().map(str::trim).filter(|l| !l.is_empty());
    match lines.next() {
        Some("v=0") => {}
        Some(other) => bail!("SDP must start with v=0, got {:?}", other),
        None => bail!("Empty SDP"),
    }

    for line in lines {
        if let Some(m) = line.strip_prefix("m=") {
            let mut parts = m.split_whitespace();
            let kind = parts.next().context("m-line without media type")?;
            let port: u16 = parts
                .next()
                .and_then(|p| p.parse().ok())
                .with_context(|| format!("Invalid m-line port: {}", line))?;
            media.push(MediaSection {
                kind: kind.to_string(),
                port,
                mid: None,
                direction: Direction::SendRecv,
            });
        } else if let Some(v) = line.strip_prefix("a=ice-ufrag:") {
            if ice_ufrag.is_empty() {
                ice_ufrag = v.to_string();
            }
        } else if let Some(v) = line.strip_prefix("a=ice-pwd:") {
            if ice_pwd.is_empty() {
                ice_pwd = v.to_string();
            }
        } else if let Some(v) = line.strip_prefix("a=mid:") {
            if let Some(section) = media.last_mut() {
                section.mid = Some(v.to_string());
            }
        } else if let Some(v) = line.strip_prefix("a=") {
            if v.starts_with("candidate:") {
                candidates.push(v.to_string());
                continue;
            }
            let direction = match v {
                "sendrecv" => Direction::SendRecv,
                "sendonly" => Direction::SendOnly,
                "recvonly" => Direction::RecvOnly,
                "inactive" => Direction::Inactive,
                _ => continue,
            };
            if let Some(section) = media.last_mut() {
                section.direction = direction;
            }
        }
    }

    if media.is_empty() {
        bail!("SDP has no media sections");
    }
    if ice_ufrag.is_empty() || ice_pwd.is_empty() {
        bail!("Could not extract ICE credentials from SDP");
    }

    Ok(SdpInfo {
        ice_ufrag,
        ice_pwd,
        media,
        candidates,
    })
}

/// Generate a random 4-character ICE ufrag.
pub fn generate_ice_ufrag() -> Result<String> {
    let bytes: [u8; 2] = rand_bytes()?;
    Ok(bytes.iter().map(|b| format!("{:02x}", b)).collect())
}

/// Generate a random 24-character ICE password using only hex characters.
///
/// RFC 5245 requires ice-pwd to be 22-256 ice-chars.
pub fn generate_ice_pwd() -> Result<String> {
    let bytes: [u8; 12] = rand_bytes()?;
    Ok(bytes.iter().map(|b| format!("{:02x}", b)).collect())
}

/// Random bytes from the OS CSPRNG.
fn rand_bytes<const N: usize>() -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    getrandom::getrandom(&mut buf).context("OS CSPRNG failed")?;
    Ok(buf)
}

/// Get the local IP address (best effort, falls back to 127.0.0.1).
pub fn get_local_ip() -> String {
    // Connecting a UDP socket sends nothing; it only picks the outbound interface.
    if let Ok(socket) = std::net::UdpSocket::bind("0.0.0.0:0") {
        if socket.connect("8.8.8.8:80").is_ok() {
            if let Ok(addr) = socket.local_addr() {
                return addr.ip().to_string();
            }
        }
    }
    "127.0.0.1".to_string()
}
