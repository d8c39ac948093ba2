//! Newline scanning over an in-memory buffer
//!
//! The vectorized scanner relies on `memchr`, which picks SSE2/AVX2/NEON at
//! runtime. The scalar scanner is the byte-at-a-time reference; both yield the
//! same spans.

use crate::error::SortError;
use memchr::memchr;
use std::str::FromStr;

/// Line boundary scanning strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineScan {
    #[default]
    Vectorized,
    Scalar,
}

impl LineScan {
    #[inline]
    fn find_newline(self, haystack: &[u8]) -> Option<usize> {
        match self {
            LineScan::Vectorized => memchr(b'\n', haystack),
            LineScan::Scalar => haystack.iter().position(|&b| b == b'\n'),
        }
    }
}

impl FromStr for LineScan {
    type Err = SortError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "vectorized" | "simd" => Ok(LineScan::Vectorized),
            "scalar" => Ok(LineScan::Scalar),
            _ => Err(SortError::parse_error(&format!("unknown line scan: {s}"))),
        }
    }
}

/// Iterator over `(start, end)` byte ranges of the lines in a buffer, newline
/// excluded. A final line without a trailing newline is still returned.
pub struct LineSpans<'a> {
    data: &'a [u8],
    pos: usize,
    scan: LineScan,
}

/// Scan `data` for lines
pub fn line_spans(data: &[u8], scan: LineScan) -> LineSpans<'_> {
    LineSpans { data, pos: 0, scan }
}

impl<'a> Iterator for LineSpans<'a> {
    type Item = (usize, usize);

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.data.len() {
            return None;
        }
        let start = self.pos;
        let end = match self.scan.find_newline(&self.data[start..]) {
            Some(offset) => start + offset,
            None => self.data.len(),
        };
        self.pos = end + 1;
        Some((start, end))
    }
}
