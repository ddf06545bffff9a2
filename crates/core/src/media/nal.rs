//! Annex B start-code scanning (ITU-T H.264 Annex B, H.265 Annex B).
//!
//! Encoders emit NAL units separated by start codes:
//! - 4-byte: `0x00 0x00 0x00 0x01`
//! - 3-byte: `0x00 0x00 0x01`
//!
//! [`NalUnits`] walks a buffer and yields each NAL unit as a borrowed view,
//! without the start code. Nothing is copied.

use std::iter::FusedIterator;
use std::ops::Range;

/// One NAL unit inside an Annex B buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NalUnit<'a> {
    offset: usize,
    prefix_len: usize,
    bytes: &'a [u8],
}

impl<'a> NalUnit<'a> {
    /// NAL bytes, header included, start code excluded.
    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Position of the first NAL byte in the scanned buffer.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Length of the start code in front of this unit (3 or 4).
    pub fn prefix_len(&self) -> usize {
        self.prefix_len
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Always false; empty ranges are never yielded.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Range of the NAL bytes in the scanned buffer.
    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.bytes.len()
    }

    /// Range including the start code.
    pub fn range_with_prefix(&self) -> Range<usize> {
        self.offset - self.prefix_len..self.offset + self.bytes.len()
    }
}

/// Lazy iterator over the NAL units of an Annex B buffer.
///
/// Bytes before the first start code are skipped. A zero byte directly in
/// front of `00 00 01` is taken as the first byte of a 4-byte start code,
/// not as a trailing byte of the previous unit. Adjacent start codes
/// produce no empty units.
#[derive(Debug, Clone)]
pub struct NalUnits<'a> {
    data: &'a [u8],
    /// (payload start, prefix length) of the unit to yield next.
    next: Option<(usize, usize)>,
}

impl<'a> NalUnits<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        let next = find_start_code(data, 0).map(|(code_start, payload)| (payload, payload - code_start));
        Self { data, next }
    }
}

impl<'a> Iterator for NalUnits<'a> {
    type Item = NalUnit<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (start, prefix_len) = self.next?;
            let end = match find_start_code(self.data, start) {
                Some((code_start, payload)) => {
                    self.next = Some((payload, payload - code_start));
                    code_start
                }
                None => {
                    self.next = None;
                    self.data.len()
                }
            };
            if end > start {
                return Some(NalUnit {
                    offset: start,
                    prefix_len,
                    bytes: &self.data[start..end],
                });
            }
        }
    }
}

impl FusedIterator for NalUnits<'_> {}

/// Find the next start code at or after `from`.
///
/// Returns `(start code position, first payload byte position)`.
fn find_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 3 <= data.len() {
        if data[i + 2] > 1 {
            // No start code can end at i + 2; skip past it.
            i += 3;
            continue;
        }
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            let code_start = if i > from && data[i - 1] == 0 { i - 1 } else { i };
            return Some((code_start, i + 3));
        }
        i += 1;
    }
    None
}
