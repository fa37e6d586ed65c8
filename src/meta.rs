// Copyright 2022 jmjoy
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Wire-level constants and pure byte-layout helpers for FastCGI version 1.
//!
//! Nothing in this module performs I/O; it only knows how the 8-byte header
//! and the begin/end-request bodies are laid out on the wire.

/// FastCGI protocol version 1, the only version this core accepts.
pub(crate) const VERSION_1: u8 = 1;

/// Length of the fixed FastCGI record header, in bytes.
pub(crate) const HEADER_LEN: usize = 8;

/// Maximum content bytes per record the encoder will ever produce.
///
/// Content length must fit 16 bits *and* leave room to round up to a
/// multiple of 8 for padding, hence 65528 rather than 65535.
pub(crate) const MAX_CONTENT_LEN: usize = 65528;

/// Backing capacity of both the inbound and outbound buffers: 128 KiB * 8.
pub(crate) const BUFFER_CAPACITY: usize = 128 * 1024 * 8;

/// Rounds `n` up to the next multiple of 8.
pub(crate) const fn align_up_8(n: usize) -> usize {
    (n + 7) & !7
}

/// FastCGI record types this core recognizes on the wire.
///
/// `Data`, `GetValues`, and `AbortRequest` are recognized only so that their
/// arrival can be reported as a protocol violation; they are never
/// dispatched to the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    BeginRequest = 1,
    AbortRequest = 2,
    EndRequest = 3,
    Params = 4,
    Stdin = 5,
    Stdout = 6,
    Stderr = 7,
    Data = 8,
    GetValues = 9,
    GetValuesResult = 10,
    UnknownType = 11,
}

impl RecordType {
    pub(crate) fn from_u8(b: u8) -> Option<Self> {
        Some(match b {
            1 => Self::BeginRequest,
            2 => Self::AbortRequest,
            3 => Self::EndRequest,
            4 => Self::Params,
            5 => Self::Stdin,
            6 => Self::Stdout,
            7 => Self::Stderr,
            8 => Self::Data,
            9 => Self::GetValues,
            10 => Self::GetValuesResult,
            11 => Self::UnknownType,
            _ => return None,
        })
    }
}

/// FastCGI application roles. This core only honors `Responder`; the other
/// two are recorded on the request but never given special treatment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Responder,
    Authorizer,
    Filter,
    /// A role value the peer sent that this core does not know about. The
    /// numeric value is preserved rather than rejected outright, since only
    /// `Responder` behavior is ever enforced.
    Unknown(u16),
}

impl Role {
    pub(crate) fn from_u16(v: u16) -> Self {
        match v {
            1 => Self::Responder,
            2 => Self::Authorizer,
            3 => Self::Filter,
            other => Self::Unknown(other),
        }
    }

    pub fn as_u16(self) -> u16 {
        match self {
            Self::Responder => 1,
            Self::Authorizer => 2,
            Self::Filter => 3,
            Self::Unknown(v) => v,
        }
    }
}

/// The flags byte carried in `BEGIN_REQUEST`. Only bit 0 is defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeginRequestFlags(pub(crate) u8);

impl BeginRequestFlags {
    const KEEP_CONN: u8 = 1 << 0;

    pub(crate) fn from_u8(b: u8) -> Self {
        Self(b)
    }

    /// Whether the peer asked to reuse this socket after the request.
    pub fn keep_conn(self) -> bool {
        self.0 & Self::KEEP_CONN != 0
    }
}

/// Protocol status carried in `END_REQUEST`. This core only ever emits
/// `RequestComplete`; the other variants exist to document the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProtocolStatus {
    RequestComplete = 0,
    CantMpxConn = 1,
    Overloaded = 2,
    UnknownRole = 3,
}

/// A parsed record header, borrowed from the inbound buffer at `idx`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Header {
    pub(crate) version: u8,
    pub(crate) record_type: u8,
    pub(crate) request_id: u16,
    pub(crate) content_length: u16,
    pub(crate) padding_length: u8,
}

impl Header {
    pub(crate) const LEN: usize = HEADER_LEN;

    /// Parses a header from the first 8 bytes of `buf`. Caller guarantees
    /// `buf.len() >= HEADER_LEN`.
    pub(crate) fn parse(buf: &[u8]) -> Self {
        Self {
            version: buf[0],
            record_type: buf[1],
            request_id: u16::from_be_bytes([buf[2], buf[3]]),
            content_length: u16::from_be_bytes([buf[4], buf[5]]),
            padding_length: buf[6],
            // buf[7] is reserved.
        }
    }

    pub(crate) fn complete_len(&self) -> usize {
        HEADER_LEN + self.content_length as usize + self.padding_length as usize
    }

    /// Writes an 8-byte record header into `dst[0..8]`.
    pub(crate) fn encode(
        dst: &mut [u8], record_type: RecordType, request_id: u16, content_length: u16,
        padding_length: u8,
    ) {
        dst[0] = VERSION_1;
        dst[1] = record_type as u8;
        dst[2..4].copy_from_slice(&request_id.to_be_bytes());
        dst[4..6].copy_from_slice(&content_length.to_be_bytes());
        dst[6] = padding_length;
        dst[7] = 0;
    }
}

/// Parses the `BEGIN_REQUEST` body (role + flags) out of a record's content.
/// Caller guarantees `content.len() >= 8`.
pub(crate) fn parse_begin_request_body(content: &[u8]) -> (Role, BeginRequestFlags) {
    let role = Role::from_u16(u16::from_be_bytes([content[0], content[1]]));
    let flags = BeginRequestFlags::from_u8(content[2]);
    (role, flags)
}

/// Writes the 8-byte `END_REQUEST` body: app-status, protocol-status, 3
/// reserved zero bytes.
pub(crate) fn encode_end_request_body(
    dst: &mut [u8], app_status: u32, protocol_status: ProtocolStatus,
) {
    dst[0..4].copy_from_slice(&app_status.to_be_bytes());
    dst[4] = protocol_status as u8;
    dst[5] = 0;
    dst[6] = 0;
    dst[7] = 0;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_8_rounds_to_next_multiple() {
        assert_eq!(align_up_8(0), 0);
        assert_eq!(align_up_8(1), 8);
        assert_eq!(align_up_8(8), 8);
        assert_eq!(align_up_8(65528), 65528);
        assert_eq!(align_up_8(65529), 65536);
    }

    #[test]
    fn header_round_trips_fields() {
        let mut buf = [0u8; HEADER_LEN];
        Header::encode(&mut buf, RecordType::Stdout, 0x0102, 0x0304, 5);
        let header = Header::parse(&buf);
        assert_eq!(header.version, VERSION_1);
        assert_eq!(header.record_type, RecordType::Stdout as u8);
        assert_eq!(header.request_id, 0x0102);
        assert_eq!(header.content_length, 0x0304);
        assert_eq!(header.padding_length, 5);
    }
}
