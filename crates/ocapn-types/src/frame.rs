//! Incremental message boundaries for a byte stream.
//!
//! A socket reader accumulates bytes until a whole top-level value has
//! arrived. [`FrameScanner`] walks tokens without building values and keeps
//! its place between calls, so input split into many small reads is not
//! walked again from the start on every read. The canonical decode then runs
//! once per complete frame.

use crate::codec::{Encoding, MAX_DEPTH};
use crate::{cbor, syrup};

/// Result of scanning the bytes received so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    /// A complete value occupies `bytes[..end]`.
    Complete(usize),
    /// More bytes are needed.
    Incomplete,
    /// The input cannot be framed. Decoding it reports why.
    Invalid,
}

/// One lexical step, as seen by a codec's tokenizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Token {
    /// Not enough bytes for the next token.
    Need,
    Bad,
    /// A complete scalar of this many bytes.
    Atom(usize),
    /// A composite opener. `owed` counts CBOR elements, zero for Syrup.
    Open { len: usize, owed: u64 },
    /// A Syrup closing bracket.
    Close,
    /// A CBOR tag head that qualifies the next element.
    Prefix(usize),
}

#[derive(Debug)]
pub struct FrameScanner {
    encoding: Encoding,
    offset: usize,
    open: Vec<u64>,
}

impl FrameScanner {
    pub fn new(encoding: Encoding) -> Self {
        Self {
            encoding,
            offset: 0,
            open: Vec::new(),
        }
    }

    /// Bytes of the current frame already walked past.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Forget the current frame. Call after consuming a complete one.
    pub fn reset(&mut self) {
        self.offset = 0;
        self.open.clear();
    }

    /// Continue scanning. `bytes` must extend the bytes given to earlier
    /// calls since the last [`reset`](Self::reset).
    pub fn scan(&mut self, bytes: &[u8]) -> Frame {
        while self.offset < bytes.len() {
            let rest = &bytes[self.offset..];
            let token = match self.encoding {
                Encoding::Syrup => syrup::next_token(rest),
                Encoding::Cbor => cbor::next_token(rest),
            };
            match token {
                Token::Need => return Frame::Incomplete,
                Token::Bad => return Frame::Invalid,
                Token::Prefix(len) => self.offset += len,
                Token::Open { len, owed } => {
                    if self.open.len() >= MAX_DEPTH {
                        return Frame::Invalid;
                    }
                    self.offset += len;
                    self.open.push(owed);
                }
                Token::Close => {
                    if self.open.pop().is_none() {
                        return Frame::Invalid;
                    }
                    self.offset += 1;
                    if self.open.is_empty() {
                        return Frame::Complete(self.offset);
                    }
                }
                Token::Atom(len) => {
                    self.offset += len;
                    if self.element_done() {
                        return Frame::Complete(self.offset);
                    }
                }
            }
        }
        Frame::Incomplete
    }

    /// Count a finished element against the open composites. True once
    /// the outermost value is finished.
    fn element_done(&mut self) -> bool {
        if self.encoding == Encoding::Cbor {
            while let Some(owed) = self.open.last_mut() {
                *owed -= 1;
                if *owed > 0 {
                    return false;
                }
                self.open.pop();
            }
        }
        self.open.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integer::Integer;
    use crate::value::{Label, Record, Value};
    use std::time::{Duration, Instant};

    fn sample() -> Value {
        Value::Record(Record {
            label: Label::Symbol("op:deliver".into()),
            fields: vec![
                Value::List((0..2_000).map(|i| Value::String(format!("item {i}"))).collect()),
                Value::Dictionary(vec![(Value::String("k".into()), Value::Boolean(true))]),
                Value::Float64(1.5),
                Value::Bytes(vec![7; 300]),
            ],
        })
    }

    fn scan_bytewise(encoding: Encoding, bytes: &[u8]) -> Vec<(usize, Frame)> {
        let mut scanner = FrameScanner::new(encoding);
        let mut seen = Vec::new();
        for end in 1..=bytes.len() {
            let frame = scanner.scan(&bytes[..end]);
            if frame != Frame::Incomplete {
                seen.push((end, frame));
            }
        }
        seen
    }

    #[test]
    fn test_byte_at_a_time_finds_one_frame() {
        for encoding in [Encoding::Syrup, Encoding::Cbor] {
            let bytes = encoding.encode(&sample()).unwrap();
            let started = Instant::now();
            let seen = scan_bytewise(encoding, &bytes);
            assert!(started.elapsed() < Duration::from_secs(2));
            assert_eq!(seen, vec![(bytes.len(), Frame::Complete(bytes.len()))]);
        }
    }

    #[test]
    fn test_scan_resumes_where_it_stopped() {
        let bytes = Encoding::Syrup.encode(&sample()).unwrap();
        let mut scanner = FrameScanner::new(Encoding::Syrup);
        assert_eq!(scanner.scan(&bytes[..1000]), Frame::Incomplete);
        let mark = scanner.offset();
        assert!(mark > 900 && mark <= 1000);
        assert_eq!(scanner.scan(&bytes[..1000]), Frame::Incomplete);
        assert_eq!(scanner.offset(), mark);
        assert_eq!(scanner.scan(&bytes), Frame::Complete(bytes.len()));
    }

    #[test]
    fn test_back_to_back_values() {
        for encoding in [Encoding::Syrup, Encoding::Cbor] {
            let first = encoding.encode(&Value::Integer(Integer::from(5i64))).unwrap();
            let mut bytes = first.clone();
            bytes.extend(encoding.encode(&sample()).unwrap());
            let mut scanner = FrameScanner::new(encoding);
            assert_eq!(scanner.scan(&bytes), Frame::Complete(first.len()));
            scanner.reset();
            assert_eq!(
                scanner.scan(&bytes[first.len()..]),
                Frame::Complete(bytes.len() - first.len())
            );
        }
    }

    #[test]
    fn test_empty_composites_complete() {
        let mut scanner = FrameScanner::new(Encoding::Cbor);
        assert_eq!(scanner.scan(&[0x80]), Frame::Complete(1));
        let mut scanner = FrameScanner::new(Encoding::Syrup);
        assert_eq!(scanner.scan(b"[]"), Frame::Complete(2));
    }

    #[test]
    fn test_unframeable_input() {
        let mut scanner = FrameScanner::new(Encoding::Syrup);
        assert_eq!(scanner.scan(b"!!not syrup"), Frame::Invalid);

        let mut scanner = FrameScanner::new(Encoding::Syrup);
        assert_eq!(scanner.scan(&vec![b'['; MAX_DEPTH + 1]), Frame::Invalid);

        let mut scanner = FrameScanner::new(Encoding::Cbor);
        assert_eq!(scanner.scan(&[0x9f]), Frame::Invalid);
    }
}
