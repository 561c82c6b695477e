use std::{cmp, fmt::Display, io, ops::Range, str};

use bytes::{Buf, Bytes, BytesMut};
use coarsetime::Instant;
use tokio_util::codec::Decoder;

use crate::error::FrameError;

/// One metric line: `key value timestamp`.
///
/// The event is immutable once parsed and is shared (`Arc`) between every
/// destination queue it is routed to. The normalised line, newline included,
/// is kept as the wire representation so writers never re-encode it.
#[derive(Debug, Clone)]
pub struct MetricEvent {
    raw: String,
    key_end: usize,
    value: Range<usize>,
    timestamp: Range<usize>,
    recv_time: Instant,
}

impl MetricEvent {
    /// Parse a single line, with or without its line terminator.
    ///
    /// Fields may be separated by any run of spaces or tabs; the stored line
    /// uses single spaces.
    pub fn parse(line: &[u8]) -> Result<Self, FrameError> {
        let line = str::from_utf8(trim_line_end(line)).map_err(|_| FrameError::Encoding)?;

        let mut fields = line.split_ascii_whitespace();
        let (Some(key), Some(value), Some(timestamp)) = (fields.next(), fields.next(), fields.next())
        else {
            return Err(match line.split_ascii_whitespace().count() {
                0 => FrameError::Empty,
                found => FrameError::FieldCount(found),
            });
        };

        let extra = fields.count();
        if extra > 0 {
            return Err(FrameError::FieldCount(3 + extra));
        }
        if value.parse::<f64>().is_err() {
            return Err(FrameError::Value);
        }
        if timestamp.parse::<f64>().is_err() {
            return Err(FrameError::Timestamp);
        }

        Ok(Self::assemble(key, value, timestamp))
    }

    /// Build an event from already known parts, validating them like a received line.
    pub fn new(key: &str, value: impl Display, timestamp: impl Display) -> Result<Self, FrameError> {
        Self::parse(format!("{key} {value} {timestamp}").as_bytes())
    }

    fn assemble(key: &str, value: &str, timestamp: &str) -> Self {
        let mut raw = String::with_capacity(key.len() + value.len() + timestamp.len() + 3);
        raw.push_str(key);
        raw.push(' ');
        let value_start = raw.len();
        raw.push_str(value);
        let value_end = raw.len();
        raw.push(' ');
        raw.push_str(timestamp);
        let timestamp_end = raw.len();
        raw.push('\n');

        MetricEvent {
            raw,
            key_end: key.len(),
            value: value_start..value_end,
            timestamp: value_end + 1..timestamp_end,
            recv_time: Instant::now(),
        }
    }

    #[inline]
    pub fn key(&self) -> &str {
        &self.raw[..self.key_end]
    }

    #[inline]
    pub fn value(&self) -> &str {
        &self.raw[self.value.clone()]
    }

    #[inline]
    pub fn timestamp(&self) -> &str {
        &self.raw[self.timestamp.clone()]
    }

    /// Wire form, newline terminated.
    #[inline]
    pub fn raw(&self) -> &[u8] {
        self.raw.as_bytes()
    }

    #[inline]
    pub fn recv_time(&self) -> Instant {
        self.recv_time
    }
}

fn trim_line_end(mut line: &[u8]) -> &[u8] {
    while let [rest @ .., b'\n' | b'\r'] = line {
        line = rest;
    }
    line
}

/// Split a datagram into the lines it carries. A trailing line without
/// terminator is still returned.
pub fn datagram_lines(data: &[u8]) -> impl Iterator<Item = &[u8]> {
    data.split(|b| *b == b'\n').filter(|line| !line.is_empty())
}

/// Output of [`LineFramer`].
#[derive(Debug, PartialEq, Eq)]
pub enum Frame {
    Line(Bytes),
    /// A line longer than the configured maximum was skipped.
    Oversized,
}

/// Newline framing for one connection.
///
/// The framer (through the `FramedRead` that owns it) keeps the partial line
/// of exactly one connection between reads.
#[derive(Debug, Clone)]
pub struct LineFramer {
    max_length: usize,
    next_index: usize,
    discarding: bool,
}

impl LineFramer {
    pub fn new(max_length: usize) -> Self {
        LineFramer {
            max_length,
            next_index: 0,
            discarding: false,
        }
    }
}

impl Decoder for LineFramer {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, io::Error> {
        loop {
            let read_to = cmp::min(self.max_length.saturating_add(1), buf.len());
            let newline = buf[self.next_index..read_to]
                .iter()
                .position(|b| *b == b'\n');

            match (self.discarding, newline) {
                (true, Some(offset)) => {
                    buf.advance(self.next_index + offset + 1);
                    self.next_index = 0;
                    self.discarding = false;
                    return Ok(Some(Frame::Oversized));
                }
                (true, None) => {
                    buf.advance(read_to);
                    self.next_index = 0;
                    if buf.is_empty() {
                        return Ok(None);
                    }
                }
                (false, Some(offset)) => {
                    let end = self.next_index + offset + 1;
                    self.next_index = 0;
                    return Ok(Some(Frame::Line(buf.split_to(end).freeze())));
                }
                (false, None) if buf.len() > self.max_length => {
                    self.discarding = true;
                }
                (false, None) => {
                    self.next_index = read_to;
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, io::Error> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }

        self.next_index = 0;
        if self.discarding {
            self.discarding = false;
            buf.clear();
            return Ok(Some(Frame::Oversized));
        }
        if buf.is_empty() {
            return Ok(None);
        }
        let rest = buf.split_to(buf.len());
        Ok(Some(Frame::Line(rest.freeze())))
    }
}

#[cfg(test)]
mod event_tests {
    use bytes::{BufMut, BytesMut};
    use tokio_util::codec::Decoder;

    use crate::{
        error::FrameError,
        event::{datagram_lines, Frame, LineFramer, MetricEvent},
    };

    #[test]
    fn test_parse_normalises_whitespace() {
        let event = MetricEvent::parse(b"app.cpu.user \t 12.5   1700000000\r\n").unwrap();

        assert_eq!(event.key(), "app.cpu.user");
        assert_eq!(event.value(), "12.5");
        assert_eq!(event.timestamp(), "1700000000");
        assert_eq!(event.raw(), b"app.cpu.user 12.5 1700000000\n");
    }

    #[test]
    fn test_parse_rejects_malformed_lines() {
        assert_eq!(MetricEvent::parse(b"   \n").unwrap_err(), FrameError::Empty);
        assert_eq!(
            MetricEvent::parse(b"app.cpu 1\n").unwrap_err(),
            FrameError::FieldCount(2)
        );
        assert_eq!(
            MetricEvent::parse(b"app.cpu 1 2 3\n").unwrap_err(),
            FrameError::FieldCount(4)
        );
        assert_eq!(
            MetricEvent::parse(b"app.cpu one 1700000000\n").unwrap_err(),
            FrameError::Value
        );
        assert_eq!(
            MetricEvent::parse(b"app.cpu 1 yesterday\n").unwrap_err(),
            FrameError::Timestamp
        );
        assert_eq!(
            MetricEvent::parse(&[b'a', 0xff, b' ', b'1', b' ', b'2']).unwrap_err(),
            FrameError::Encoding
        );
    }

    #[test]
    fn test_new_builds_valid_line() {
        let event = MetricEvent::new("relay.metricsReceived", 42, 1700000000).unwrap();
        assert_eq!(event.raw(), b"relay.metricsReceived 42 1700000000\n");
        assert!(MetricEvent::new("bad key", 1, 2).is_err());
    }

    #[test]
    fn test_framer_buffers_partial_lines() {
        let mut framer = LineFramer::new(64);
        let mut buf = BytesMut::new();

        buf.put_slice(b"a.b 1 10\na.c 2");
        assert_eq!(
            framer.decode(&mut buf).unwrap(),
            Some(Frame::Line("a.b 1 10\n".into()))
        );
        assert_eq!(framer.decode(&mut buf).unwrap(), None);

        buf.put_slice(b" 20\n");
        assert_eq!(
            framer.decode(&mut buf).unwrap(),
            Some(Frame::Line("a.c 2 20\n".into()))
        );
        assert_eq!(framer.decode(&mut buf).unwrap(), None);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_framer_skips_oversized_lines() {
        let mut framer = LineFramer::new(8);
        let mut buf = BytesMut::new();

        buf.put_slice(b"this.line.is.way.too.long");
        assert_eq!(framer.decode(&mut buf).unwrap(), None);
        buf.put_slice(b" 1 1\nok 1 1\n");

        assert_eq!(framer.decode(&mut buf).unwrap(), Some(Frame::Oversized));
        assert_eq!(
            framer.decode(&mut buf).unwrap(),
            Some(Frame::Line("ok 1 1\n".into()))
        );
    }

    #[test]
    fn test_framer_flushes_trailing_line_at_eof() {
        let mut framer = LineFramer::new(64);
        let mut buf = BytesMut::from(&b"a.b 1 10"[..]);

        assert_eq!(framer.decode(&mut buf).unwrap(), None);
        assert_eq!(
            framer.decode_eof(&mut buf).unwrap(),
            Some(Frame::Line("a.b 1 10".into()))
        );
        assert_eq!(framer.decode_eof(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_datagram_lines() {
        let lines: Vec<&[u8]> = datagram_lines(b"a 1 1\n\nb 2 2\nc 3 3").collect();
        assert_eq!(lines, vec![&b"a 1 1"[..], &b"b 2 2"[..], &b"c 3 3"[..]]);
    }
}
