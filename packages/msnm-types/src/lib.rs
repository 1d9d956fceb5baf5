//! # msnm-types
//!
//! Wire types shared by the sensor runtime and any external tooling that
//! speaks the sensor-to-sensor peer protocol (child sensors forwarding
//! statistics to a parent, offline tooling replaying a capture, ...).
//!
//! Packets are framed on the wire as a 4-byte big-endian length prefix
//! around a JSON body (see `tokio_util::codec::LengthDelimitedCodec` in
//! the sensor crate's `peer` module). Only the fields below are part of
//! the contract; the framing and the JSON encoding are implementation
//! choices.

use serde::{Deserialize, Serialize};

// ── Packet Header ─────────────────────────────────────────────────────────

/// Common envelope carried by every packet on the peer link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacketHeader {
    /// Per-sender monotonic packet id.
    pub id: u64,
    /// Sensor id of the sender (the child, for Data packets).
    pub sid: String,
    /// Interval timestamp this packet belongs to, formatted per
    /// `GeneralParams.tsDateFormat`.
    pub ts: String,
}

// ── Packet Body ───────────────────────────────────────────────────────────

/// A statistic pair forwarded from a child sensor to its parent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DataBody {
    #[serde(rename = "Q")]
    pub q: f64,
    #[serde(rename = "D")]
    pub d: f64,
}

/// Acknowledgement returned for every packet the server accepts a
/// connection for, regardless of whether the sender's `sid` is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResponseCode {
    Ok,
    Ko,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseBody {
    pub resp: ResponseCode,
}

/// Reserved for future control operations; currently carries no fields
/// beyond the header and is never interpreted by the server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandBody {}

/// One frame on the peer link. `type` is the wire discriminant, matching
/// the three packet kinds the original protocol defines.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Packet {
    #[serde(rename = "D")]
    Data {
        header: PacketHeader,
        body: DataBody,
    },
    #[serde(rename = "C")]
    Command {
        header: PacketHeader,
        body: CommandBody,
    },
    #[serde(rename = "R")]
    Response {
        header: PacketHeader,
        body: ResponseBody,
    },
}

impl Packet {
    pub fn header(&self) -> &PacketHeader {
        match self {
            Packet::Data { header, .. } => header,
            Packet::Command { header, .. } => header,
            Packet::Response { header, .. } => header,
        }
    }

    pub fn data(sid: impl Into<String>, ts: impl Into<String>, id: u64, q: f64, d: f64) -> Self {
        Packet::Data {
            header: PacketHeader { id, sid: sid.into(), ts: ts.into() },
            body: DataBody { q, d },
        }
    }

    pub fn response(sid: impl Into<String>, ts: impl Into<String>, id: u64, code: ResponseCode) -> Self {
        Packet::Response {
            header: PacketHeader { id, sid: sid.into(), ts: ts.into() },
            body: ResponseBody { resp: code },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_packet_round_trips_through_json() {
        let p = Packet::data("leaf-1", "2026-01-01T00:00:00", 7, 0.42, 1.5);
        let encoded = serde_json::to_vec(&p).unwrap();
        let decoded: Packet = serde_json::from_slice(&encoded).unwrap();
        match decoded {
            Packet::Data { header, body } => {
                assert_eq!(header.id, 7);
                assert_eq!(header.sid, "leaf-1");
                assert_eq!(body.q, 0.42);
                assert_eq!(body.d, 1.5);
            }
            _ => panic!("expected a Data packet"),
        }
    }

    #[test]
    fn response_code_serializes_uppercase() {
        let body = ResponseBody { resp: ResponseCode::Ok };
        let json = serde_json::to_string(&body).unwrap();
        assert_eq!(json, r#"{"resp":"OK"}"#);
    }
}
