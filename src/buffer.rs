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

//! The per-connection inbound and outbound byte buffers and the record
//! codec that operates over them.
//!
//! Neither buffer performs I/O. The connection driver (`crate::connection`)
//! is the only caller of `transferred`, and it is the only code that talks
//! to a socket.

use crate::meta::{
    self, align_up_8, encode_end_request_body, BeginRequestFlags, Header, ProtocolStatus,
    RecordType, Role, BUFFER_CAPACITY, HEADER_LEN, MAX_CONTENT_LEN,
};

/// Outcome of classifying the record currently at the front of the inbound
/// buffer, minus the parts that are the aggregator's responsibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecordKind {
    BeginRequest { role: Role, flags: BeginRequestFlags },
    Params,
    Stdin,
    /// `DATA`, `GET_VALUES`, or `ABORT_REQUEST` arrived; fatal
    ProtocolViolation,
    /// A record type this core does not recognize at all; fatal.
    UnknownType,
}

/// Accumulates raw bytes read from one connection and exposes the FastCGI
/// record-framing contract: header, content, and padding regions, all
/// addressed through a pair of cursors over a fixed-size backing array.
pub(crate) struct InboundBuffer {
    buf: Box<[u8]>,
    idx: usize,
    len: usize,
}

impl InboundBuffer {
    pub(crate) fn new() -> Self {
        Self { buf: vec![0u8; BUFFER_CAPACITY].into_boxed_slice(), idx: 0, len: 0 }
    }

    /// The free region past the valid bytes, for the driver to read into.
    pub(crate) fn writable(&mut self) -> &mut [u8] {
        let start = self.idx + self.len;
        &mut self.buf[start..]
    }

    /// Announces that `n` freshly read bytes were appended past `idx + len`.
    pub(crate) fn transferred(&mut self, n: usize) {
        self.len += n;
    }

    /// True iff a full header is present and the complete header-advertised
    /// record (header + content + padding) fits in the current `len`.
    pub(crate) fn can_read(&self) -> bool {
        if self.len < HEADER_LEN {
            return false;
        }
        self.header().complete_len() <= self.len
    }

    fn header(&self) -> Header {
        Header::parse(&self.buf[self.idx..self.idx + HEADER_LEN])
    }

    fn content(&self) -> &[u8] {
        let header = self.header();
        let start = self.idx + HEADER_LEN;
        &self.buf[start..start + header.content_length as usize]
    }

    /// The raw content bytes of the current record (e.g. a `STDIN` chunk),
    /// as opposed to the name/value pairs `decode_params` parses out of a
    /// `PARAMS` record's content.
    pub(crate) fn current_content(&self) -> &[u8] {
        self.content()
    }

    /// True iff the current record's header carries protocol version 1.
    /// Checked before `classify` by the connection driver, which rejects a
    /// version mismatch before dispatching on record type.
    pub(crate) fn version_ok(&self) -> bool {
        self.header().version == meta::VERSION_1
    }

    /// Classifies the record currently at the front of the buffer. Caller
    /// must have checked `can_read()` and `version_ok()` first.
    pub(crate) fn classify(&self) -> RecordKind {
        let header = self.header();
        let Some(record_type) = RecordType::from_u8(header.record_type) else {
            return RecordKind::UnknownType;
        };
        match record_type {
            RecordType::BeginRequest => {
                let (role, flags) = meta::parse_begin_request_body(self.content());
                RecordKind::BeginRequest { role, flags }
            }
            RecordType::Params => RecordKind::Params,
            RecordType::Stdin => RecordKind::Stdin,
            RecordType::AbortRequest | RecordType::Data | RecordType::GetValues => {
                RecordKind::ProtocolViolation
            }
            RecordType::EndRequest
            | RecordType::Stdout
            | RecordType::Stderr
            | RecordType::GetValuesResult
            | RecordType::UnknownType => RecordKind::UnknownType,
        }
    }

    pub(crate) fn request_id(&self) -> u16 {
        self.header().request_id
    }

    /// Iterates the name/value pairs in the current record's content,
    /// yielding borrowed slices into the inbound buffer.
    pub(crate) fn decode_params(&self) -> ParamIter<'_> {
        ParamIter { rest: self.content() }
    }

    /// Advances `idx` by the complete length of the current record and
    /// decreases `len` by the same.
    pub(crate) fn advance(&mut self) {
        let total = self.header().complete_len();
        self.idx += total;
        self.len -= total;
    }

    /// If `idx > 0`, moves the remaining `len` bytes to offset 0.
    pub(crate) fn compact(&mut self) {
        if self.idx != 0 {
            if self.len != 0 {
                self.buf.copy_within(self.idx..self.idx + self.len, 0);
            }
            self.idx = 0;
        }
    }

    /// True iff an advertised record exceeds capacity and can never fit.
    pub(crate) fn buf_full(&self) -> bool {
        self.idx + self.len >= self.buf.len()
    }
}

/// One name/value pair decoded from a `PARAMS` record's content.
pub(crate) struct ParamIter<'a> {
    rest: &'a [u8],
}

/// Decodes a single length prefix: one byte if the high bit is clear, else
/// four big-endian bytes with the high bit masked from the first.
fn decode_length(buf: &[u8]) -> Option<(u32, usize)> {
    let first = *buf.first()?;
    if first & 0x80 == 0 {
        Some((first as u32, 1))
    } else {
        let bytes = buf.get(0..4)?;
        let masked = (bytes[0] & 0x7f) as u32;
        let len = (masked << 24) | ((bytes[1] as u32) << 16) | ((bytes[2] as u32) << 8) | bytes[3] as u32;
        Some((len, 4))
    }
}

impl<'a> Iterator for ParamIter<'a> {
    type Item = (&'a [u8], &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }
        let (name_len, name_len_size) = decode_length(self.rest)?;
        let rest = &self.rest[name_len_size..];
        let (value_len, value_len_size) = decode_length(rest)?;
        let rest = &rest[value_len_size..];
        let (name, rest) = rest.split_at(name_len as usize);
        let (value, rest) = rest.split_at(value_len as usize);
        self.rest = rest;
        Some((name, value))
    }
}

/// Stages encoded response records for one connection.
pub(crate) struct OutboundBuffer {
    buf: Box<[u8]>,
    len: usize,
}

impl OutboundBuffer {
    pub(crate) fn new() -> Self {
        Self { buf: vec![0u8; BUFFER_CAPACITY].into_boxed_slice(), len: 0 }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Borrowed view of the bytes pending a write.
    pub(crate) fn pending(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Consumes the first `n` bytes of pending output, moving the remainder
    /// to offset 0.
    pub(crate) fn transferred(&mut self, n: usize) {
        self.buf.copy_within(n..self.len, 0);
        self.len -= n;
    }

    fn remaining_capacity(&self) -> usize {
        self.buf.len() - self.len
    }

    /// Splits `payload` into records of at most `MAX_CONTENT_LEN` content
    /// bytes each. Returns `false` without mutating state if the total
    /// encoded size would not fit in the remaining buffer capacity.
    pub(crate) fn write_stdout(&mut self, request_id: u16, payload: &[u8]) -> bool {
        let required: usize = payload
            .chunks(MAX_CONTENT_LEN)
            .map(|chunk| HEADER_LEN + align_up_8(chunk.len()))
            .sum();
        if required > self.remaining_capacity() {
            return false;
        }

        for chunk in payload.chunks(MAX_CONTENT_LEN) {
            let content_length = chunk.len() as u16;
            let padding_length = (align_up_8(chunk.len()) - chunk.len()) as u8;
            self.append_record(RecordType::Stdout, request_id, content_length, padding_length, |body| {
                body[..chunk.len()].copy_from_slice(chunk);
            });
        }
        true
    }

    /// Appends a single zero-content `STDOUT` record, the stream terminator.
    pub(crate) fn write_end_stdout(&mut self, request_id: u16) -> bool {
        if HEADER_LEN > self.remaining_capacity() {
            return false;
        }
        self.append_record(RecordType::Stdout, request_id, 0, 0, |_| {});
        true
    }

    /// Appends an `END_REQUEST` record: 8 bytes of body (app-status,
    /// protocol-status, 3 reserved zero bytes).
    pub(crate) fn write_end_request(&mut self, request_id: u16, app_status: u32) -> bool {
        if HEADER_LEN + 8 > self.remaining_capacity() {
            return false;
        }
        self.append_record(RecordType::EndRequest, request_id, 8, 0, |body| {
            encode_end_request_body(body, app_status, ProtocolStatus::RequestComplete);
        });
        true
    }

    fn append_record(
        &mut self, record_type: RecordType, request_id: u16, content_length: u16, padding_length: u8,
        fill_content: impl FnOnce(&mut [u8]),
    ) {
        let start = self.len;
        let content_start = start + HEADER_LEN;
        let content_end = content_start + content_length as usize;
        let total = HEADER_LEN + content_length as usize + padding_length as usize;

        Header::encode(&mut self.buf[start..start + HEADER_LEN], record_type, request_id, content_length, padding_length);
        fill_content(&mut self.buf[content_start..content_end]);
        self.len += total;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(inbound: &mut InboundBuffer, bytes: &[u8]) {
        inbound.writable()[..bytes.len()].copy_from_slice(bytes);
        inbound.transferred(bytes.len());
    }

    #[test]
    fn decode_params_127_byte_name_uses_short_form() {
        let mut content = vec![127u8, 1u8];
        content.extend(vec![b'x'; 127]);
        content.push(b'v');
        let mut inbound = InboundBuffer::new();
        let mut record = vec![1u8, RecordType::Params as u8, 0, 1];
        let content_len = content.len() as u16;
        record.extend(content_len.to_be_bytes());
        record.push(0);
        record.push(0);
        record.extend(content);
        feed(&mut inbound, &record);
        assert!(inbound.can_read());
        let pairs: Vec<_> = inbound.decode_params().collect();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].0.len(), 127);
        assert_eq!(pairs[0].1, b"v");
    }

    #[test]
    fn buf_full_once_capacity_is_exhausted() {
        // The content-length field is 16 bits, so no single record can
        // advertise more than HEADER_LEN + 65535 + 255 bytes, well under
        // BUFFER_CAPACITY. `buf_full()` is exercised directly here against
        // a `usize` byte count rather than an over-the-wire scenario.
        let mut inbound = InboundBuffer::new();
        assert!(!inbound.buf_full());
        let remaining = inbound.buf.len() - (inbound.idx + inbound.len);
        inbound.transferred(remaining);
        assert!(inbound.buf_full());
    }

    #[test]
    fn compact_is_noop_when_idx_is_zero() {
        let mut inbound = InboundBuffer::new();
        feed(&mut inbound, &[1, 2, 3]);
        inbound.compact();
        assert_eq!(&inbound.buf[..3], &[1, 2, 3]);
    }

    #[test]
    fn stdout_exactly_max_content_len_has_no_padding() {
        let mut outbound = OutboundBuffer::new();
        let payload = vec![b'a'; MAX_CONTENT_LEN];
        assert!(outbound.write_stdout(1, &payload));
        let pending = outbound.pending();
        assert_eq!(pending.len(), HEADER_LEN + MAX_CONTENT_LEN);
        assert_eq!(pending[6], 0);
    }

    #[test]
    fn stdout_one_byte_more_emits_two_records() {
        let mut outbound = OutboundBuffer::new();
        let payload = vec![b'a'; MAX_CONTENT_LEN + 1];
        assert!(outbound.write_stdout(1, &payload));
        let pending = outbound.pending();
        let first = Header::parse(&pending[..HEADER_LEN]);
        assert_eq!(first.content_length as usize, MAX_CONTENT_LEN);
        let second_start = HEADER_LEN + MAX_CONTENT_LEN;
        let second = Header::parse(&pending[second_start..second_start + HEADER_LEN]);
        assert_eq!(second.content_length, 1);
        assert_eq!(second.padding_length, 7);
    }

    #[test]
    fn end_request_body_has_expected_layout() {
        let mut outbound = OutboundBuffer::new();
        assert!(outbound.write_end_request(7, 0));
        let pending = outbound.pending();
        let header = Header::parse(&pending[..HEADER_LEN]);
        assert_eq!(header.record_type, RecordType::EndRequest as u8);
        assert_eq!(header.request_id, 7);
        assert_eq!(header.content_length, 8);
        let body = &pending[HEADER_LEN..HEADER_LEN + 8];
        assert_eq!(&body[0..4], &[0, 0, 0, 0]);
        assert_eq!(body[4], ProtocolStatus::RequestComplete as u8);
    }

    #[test]
    fn transferred_consumes_exactly_n_bytes() {
        let mut outbound = OutboundBuffer::new();
        outbound.write_end_stdout(1);
        let total = outbound.pending().len();
        outbound.transferred(total);
        assert!(outbound.is_empty());
    }
}
