use std::fmt::Write as _;
use std::net::SocketAddr;

use crate::error::FabricError;

// ── Magnet links ────────────────────────────────────────────────────────────

/// Parsed form of a `magnet:` URI.
///
/// Recognized parameters: `xt=urn:btih:<40 hex>` (required), `dn` (display
/// name), `tr` (tracker, repeatable), `x.pe` (peer address hint,
/// repeatable). Unknown parameters are ignored so links from other
/// implementations still parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagnetLink {
    pub info_hash: [u8; 20],
    pub name: Option<String>,
    pub trackers: Vec<String>,
    pub peer_hints: Vec<SocketAddr>,
}

impl MagnetLink {
    pub fn parse(uri: &str) -> Result<Self, FabricError> {
        let invalid = |msg: &str| FabricError::InvalidMagnet(msg.to_string());

        let query = uri
            .strip_prefix("magnet:?")
            .ok_or_else(|| invalid("missing magnet:? prefix"))?;

        let mut info_hash = None;
        let mut name = None;
        let mut trackers = Vec::new();
        let mut peer_hints = Vec::new();

        for pair in query.split('&') {
            let Some((key, raw)) = pair.split_once('=') else {
                continue;
            };
            let value = urlencoding::decode(raw)
                .map_err(|_| invalid("parameter is not valid UTF-8"))?;
            match key {
                "xt" => {
                    let hex = value
                        .strip_prefix("urn:btih:")
                        .ok_or_else(|| invalid("xt is not urn:btih"))?;
                    info_hash = Some(decode_hex(hex)?);
                }
                "dn" => name = Some(value.into_owned()),
                "tr" => trackers.push(value.into_owned()),
                "x.pe" => {
                    // Unresolvable hints are dropped rather than failing
                    // the whole link.
                    if let Ok(addr) = value.parse::<SocketAddr>() {
                        peer_hints.push(addr);
                    } else {
                        log::debug!("ignoring unparseable peer hint {value}");
                    }
                }
                _ => {}
            }
        }

        Ok(Self {
            info_hash: info_hash.ok_or_else(|| invalid("missing xt parameter"))?,
            name,
            trackers,
            peer_hints,
        })
    }

    pub fn to_uri(&self) -> String {
        let mut uri = format!("magnet:?xt=urn:btih:{}", encode_hex(&self.info_hash));
        if let Some(name) = &self.name {
            let _ = write!(uri, "&dn={}", urlencoding::encode(name));
        }
        for tracker in &self.trackers {
            let _ = write!(uri, "&tr={}", urlencoding::encode(tracker));
        }
        for hint in &self.peer_hints {
            let _ = write!(uri, "&x.pe={}", urlencoding::encode(&hint.to_string()));
        }
        uri
    }
}

pub fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::new(), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

fn decode_hex(hex: &str) -> Result<[u8; 20], FabricError> {
    if hex.len() != 40 {
        return Err(FabricError::InvalidMagnet(format!(
            "info hash must be 40 hex characters, got {}",
            hex.len()
        )));
    }
    let mut out = [0u8; 20];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
            .map_err(|_| FabricError::InvalidMagnet("non-hex info hash".to_string()))?;
    }
    Ok(out)
}
