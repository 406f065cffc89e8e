//! Wire messages exchanged between peers.
//!
//! Three message families share one TCP port:
//!
//! - **Join request** (joiner to bootstrap, text):
//!   `Join request from <name> [<peer id>]`, optionally followed by
//!   ` listening on <port>`.
//! - **Welcome** (bootstrap to joiner, binary): a 5-byte header, the sender's
//!   name, then up to `num_peers` peer entries.
//! - **Heartbeat** (text): the probe `HEARTBEAT`, answered by anything
//!   containing `RESPONSE`.
//!
//! # Welcome layout
//!
//! All integers are big-endian.
//!
//! | offset | size | field |
//! |---|---|---|
//! | 0 | 1 | protocol version |
//! | 1 | 1 | message type |
//! | 2 | 1 | number of peers |
//! | 3 | 2 | sender name length |
//! | 5 | N | sender name, UTF-8 |
//!
//! Each peer entry is `id_len:u8, id, name_len:u16, name, addr_len:u8,
//! addr (text), port:u16`. A welcome that stops right after the sender name
//! is valid and carries no entries.

use std::net::IpAddr;
use std::sync::OnceLock;

use anyhow::{anyhow, bail, Context, Result};
use regex::Regex;

use crate::core::{PeerId, PeerRecord};

/// Protocol version carried in every welcome.
pub const PROTOCOL_VERSION: u8 = 18;

/// Message type of a welcome.
pub const MSG_TYPE_WELCOME: u8 = 2;

pub const WELCOME_HEADER_LEN: usize = 5;

/// Most peer entries a single welcome can advertise.
pub const MAX_WELCOME_PEERS: usize = u8::MAX as usize;

/// Longest identifier a welcome entry can carry (its length is one byte).
pub const MAX_PEER_ID_LEN: usize = u8::MAX as usize;

/// Name used when a join request does not carry one.
pub const UNKNOWN_PEER_NAME: &str = "unknown";

/// Identifier used when a join request does not carry one.
pub const UNKNOWN_PEER_ID: &str = "xxxx";

pub const HEARTBEAT_PROBE: &[u8] = b"HEARTBEAT";

pub const HEARTBEAT_RESPONSE: &[u8] = b"RESPONSE";

// ─────────────────────────────────────────────────────────────────────────────
// Join Request
// ─────────────────────────────────────────────────────────────────────────────

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"from\s+(\S+)").expect("valid name pattern"))
}

fn id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\[([0-9A-Za-z_]+)\]").expect("valid id pattern"))
}

fn port_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"listening on (\d+)").expect("valid port pattern"))
}

/// A joining peer introducing itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JoinRequest {
    pub peer_name: String,
    pub peer_id: PeerId,
    /// Port the joiner accepts connections on, when advertised.
    pub listen_port: Option<u16>,
}

impl JoinRequest {
    pub fn new(peer_name: impl Into<String>, peer_id: PeerId, listen_port: Option<u16>) -> Self {
        Self {
            peer_name: peer_name.into(),
            peer_id,
            listen_port,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut text = format!("Join request from {} [{}]", self.peer_name, self.peer_id);
        if let Some(port) = self.listen_port {
            text.push_str(&format!(" listening on {port}"));
        }
        text.into_bytes()
    }

    /// Decode a join request by pattern matching.
    ///
    /// Never fails: a missing name or identifier falls back to
    /// [`UNKNOWN_PEER_NAME`] / [`UNKNOWN_PEER_ID`], and a missing or
    /// out-of-range port to `None`. An identifier longer than
    /// [`MAX_PEER_ID_LEN`] is treated as missing.
    pub fn decode(data: &[u8]) -> Self {
        let text = String::from_utf8_lossy(data);
        let capture = |pattern: &Regex| {
            pattern
                .captures(&text)
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str().to_string())
        };

        let peer_name = capture(name_pattern()).unwrap_or_else(|| UNKNOWN_PEER_NAME.to_string());
        let peer_id = capture(id_pattern())
            .filter(|id| id.len() <= MAX_PEER_ID_LEN)
            .unwrap_or_else(|| UNKNOWN_PEER_ID.to_string());
        let listen_port = capture(port_pattern()).and_then(|port| port.parse().ok());

        Self {
            peer_name,
            peer_id: PeerId::new(peer_id),
            listen_port,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Welcome
// ─────────────────────────────────────────────────────────────────────────────

/// Reply sent by a bootstrap peer to a joiner.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Welcome {
    pub version: u8,
    pub msg_type: u8,
    /// Number of peers the sender advertises.
    pub num_peers: u8,
    pub sender_name: String,
    /// Decoded peer entries; may be shorter than `num_peers` for senders that
    /// only transmit the header.
    pub peers: Vec<PeerRecord>,
}

impl Welcome {
    /// Build a welcome advertising `peers`, keeping at most
    /// [`MAX_WELCOME_PEERS`] of them.
    ///
    /// Records whose fields overflow the entry layout are left out, so
    /// `num_peers` always matches what [`Welcome::encode`] writes.
    pub fn new(sender_name: impl Into<String>, peers: Vec<PeerRecord>) -> Self {
        let peers: Vec<PeerRecord> = peers
            .into_iter()
            .filter(fits_entry)
            .take(MAX_WELCOME_PEERS)
            .collect();
        Self {
            version: PROTOCOL_VERSION,
            msg_type: MSG_TYPE_WELCOME,
            num_peers: peers.len() as u8,
            sender_name: sender_name.into(),
            peers,
        }
    }

    /// A welcome carrying only the fixed header and sender name.
    pub fn header_only(version: u8, msg_type: u8, num_peers: u8, sender_name: impl Into<String>) -> Self {
        Self {
            version,
            msg_type,
            num_peers,
            sender_name: sender_name.into(),
            peers: Vec::new(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let name = self.sender_name.as_bytes();
        let name_len = u16::try_from(name.len())
            .map_err(|_| anyhow!("sender name is {} bytes, limit is {}", name.len(), u16::MAX))?;

        let mut buf = Vec::with_capacity(WELCOME_HEADER_LEN + name.len());
        buf.push(self.version);
        buf.push(self.msg_type);
        buf.push(self.num_peers);
        buf.extend_from_slice(&name_len.to_be_bytes());
        buf.extend_from_slice(name);

        for peer in &self.peers {
            encode_peer(&mut buf, peer)
                .with_context(|| format!("encoding welcome entry for {}", peer.peer_id))?;
        }
        Ok(buf)
    }

    /// Decode a welcome, rejecting any buffer that ends inside a field.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        let version = reader.u8().context("welcome header")?;
        let msg_type = reader.u8().context("welcome header")?;
        let num_peers = reader.u8().context("welcome header")?;
        let name_len = reader.u16().context("welcome header")? as usize;
        let sender_name = reader.string(name_len).context("welcome sender name")?;

        let mut peers = Vec::new();
        while peers.len() < usize::from(num_peers) && !reader.is_empty() {
            let entry = decode_peer(&mut reader)
                .with_context(|| format!("welcome peer entry {}", peers.len()))?;
            peers.push(entry);
        }

        Ok(Self {
            version,
            msg_type,
            num_peers,
            sender_name,
            peers,
        })
    }
}

fn fits_entry(peer: &PeerRecord) -> bool {
    peer.peer_id.as_str().len() <= MAX_PEER_ID_LEN && peer.name.len() <= usize::from(u16::MAX)
}

fn encode_peer(buf: &mut Vec<u8>, peer: &PeerRecord) -> Result<()> {
    let id = peer.peer_id.as_str().as_bytes();
    let name = peer.name.as_bytes();
    let addr = peer.ip.to_string();

    let id_len = u8::try_from(id.len()).map_err(|_| anyhow!("peer id too long"))?;
    let name_len = u16::try_from(name.len()).map_err(|_| anyhow!("peer name too long"))?;
    let addr_len = u8::try_from(addr.len()).map_err(|_| anyhow!("peer address too long"))?;

    buf.push(id_len);
    buf.extend_from_slice(id);
    buf.extend_from_slice(&name_len.to_be_bytes());
    buf.extend_from_slice(name);
    buf.push(addr_len);
    buf.extend_from_slice(addr.as_bytes());
    buf.extend_from_slice(&peer.port.to_be_bytes());
    Ok(())
}

fn decode_peer(reader: &mut Reader<'_>) -> Result<PeerRecord> {
    let id_len = reader.u8()? as usize;
    let peer_id = PeerId::new(reader.string(id_len)?);
    let name_len = reader.u16()? as usize;
    let name = reader.string(name_len)?;
    let addr_len = reader.u8()? as usize;
    let addr = reader.string(addr_len)?;
    let ip: IpAddr = addr
        .parse()
        .with_context(|| format!("invalid peer address {addr:?}"))?;
    let port = reader.u16()?;
    Ok(PeerRecord::new(peer_id, name, ip, port))
}

/// Bounds-checked cursor over a welcome buffer.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.buf.len() < len {
            bail!("truncated: need {len} bytes, {} left", self.buf.len());
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn string(&mut self, len: usize) -> Result<String> {
        let bytes = self.take(len)?;
        Ok(String::from_utf8(bytes.to_vec())?)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Dispatch
// ─────────────────────────────────────────────────────────────────────────────

/// First message received on an inbound connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InboundMessage {
    Heartbeat,
    Join(JoinRequest),
}

impl InboundMessage {
    /// Anything that is not a heartbeat probe is handled as a join request.
    pub fn classify(data: &[u8]) -> Self {
        if data.starts_with(HEARTBEAT_PROBE) {
            InboundMessage::Heartbeat
        } else {
            InboundMessage::Join(JoinRequest::decode(data))
        }
    }
}

/// Whether received data answers a heartbeat probe.
pub fn is_heartbeat_response(data: &[u8]) -> bool {
    data.windows(HEARTBEAT_RESPONSE.len())
        .any(|window| window == HEARTBEAT_RESPONSE)
}
