//! Record key extraction and line-oriented record reading
//!
//! A record is one line. Only the first two tab-separated fields are looked
//! at: the grouping key and the integer position. The rest of the line is
//! carried along untouched.

use crate::error::{KeyError, SortContext, SortResult};
use memchr::memchr;
use std::io::{self, BufRead, Write};

/// Field separator of the record format
pub const FIELD_SEPARATOR: u8 = b'\t';

/// Default first byte of header/pass-through lines
pub const DEFAULT_COMMENT_MARKER: u8 = b'#';

/// Borrowed view of the sort-relevant part of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordKey<'a> {
    pub group: &'a [u8],
    pub position: i64,
}

/// Extract `(grouping key, position)` from a line without copying it.
///
/// The line must not include its terminating newline. A trailing `\r` on the
/// position field is tolerated.
pub fn extract(line: &[u8]) -> Result<RecordKey<'_>, KeyError> {
    let first_tab = memchr(FIELD_SEPARATOR, line).ok_or(KeyError::MissingFields)?;
    let group = &line[..first_tab];
    let rest = &line[first_tab + 1..];
    let mut field = match memchr(FIELD_SEPARATOR, rest) {
        Some(end) => &rest[..end],
        None => rest,
    };
    if let Some(stripped) = field.strip_suffix(b"\r") {
        field = stripped;
    }
    let position = parse_position(field).ok_or(KeyError::InvalidPosition)?;
    Ok(RecordKey { group, position })
}

/// Parse a non-negative decimal integer that fits in `i64`
fn parse_position(bytes: &[u8]) -> Option<i64> {
    if bytes.is_empty() {
        return None;
    }

    let mut result: i64 = 0;
    for &byte in bytes {
        if !byte.is_ascii_digit() {
            return None;
        }
        result = result.checked_mul(10)?;
        result = result.checked_add((byte - b'0') as i64)?;
    }
    Some(result)
}

/// Whether `line` is a header/pass-through line
#[inline]
pub fn is_comment(line: &[u8], marker: u8) -> bool {
    line.first() == Some(&marker)
}

/// Header lines captured verbatim before the first data record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderBlock {
    lines: Vec<Vec<u8>>,
}

impl HeaderBlock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, line: Vec<u8>) {
        self.lines.push(line);
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn lines(&self) -> impl Iterator<Item = &[u8]> {
        self.lines.iter().map(Vec::as_slice)
    }

    /// Write every header line, newline-terminated
    pub fn write_to<W: Write + ?Sized>(&self, out: &mut W) -> io::Result<()> {
        for line in &self.lines {
            out.write_all(line)?;
            out.write_all(b"\n")?;
        }
        Ok(())
    }
}

/// Line reader over a buffered stream that separates the header block from
/// the data lines.
pub struct RecordReader<R> {
    reader: R,
    name: String,
    comment: u8,
    line_no: u64,
    pending: Option<Vec<u8>>,
    in_header: bool,
}

impl<R: BufRead> RecordReader<R> {
    pub fn new(reader: R, name: impl Into<String>, comment: u8) -> Self {
        Self {
            reader,
            name: name.into(),
            comment,
            line_no: 0,
            pending: None,
            in_header: true,
        }
    }

    /// Name used in diagnostics (file path or `-`)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 1-based number of the line most recently returned
    pub fn line_no(&self) -> u64 {
        self.line_no
    }

    fn read_raw(&mut self, buf: &mut Vec<u8>) -> io::Result<bool> {
        buf.clear();
        if self.reader.read_until(b'\n', buf)? == 0 {
            return Ok(false);
        }
        if buf.last() == Some(&b'\n') {
            buf.pop();
        }
        self.line_no += 1;
        Ok(true)
    }

    /// Consume the leading comment lines. Must be called before the first
    /// [`next_line`](Self::next_line) to capture them; otherwise they are
    /// returned as ordinary lines. Blank lines are skipped.
    pub fn read_header(&mut self) -> io::Result<HeaderBlock> {
        let mut header = HeaderBlock::new();
        if !self.in_header {
            return Ok(header);
        }
        let mut line = Vec::new();
        while self.read_raw(&mut line)? {
            if line.is_empty() {
                continue;
            }
            if is_comment(&line, self.comment) {
                header.push(std::mem::take(&mut line));
                continue;
            }
            self.pending = Some(line);
            break;
        }
        self.in_header = false;
        Ok(header)
    }

    /// Read the next non-blank line into `buf`. Returns `false` at end of input.
    pub fn next_line(&mut self, buf: &mut Vec<u8>) -> io::Result<bool> {
        if let Some(line) = self.pending.take() {
            *buf = line;
            return Ok(true);
        }
        self.in_header = false;
        while self.read_raw(buf)? {
            if !buf.is_empty() {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Read every reader's header and keep the first non-empty one. The later
/// header blocks are consumed and dropped.
pub fn first_header<R: BufRead>(readers: &mut [RecordReader<R>]) -> SortResult<HeaderBlock> {
    let mut chosen: Option<HeaderBlock> = None;
    for reader in readers.iter_mut() {
        let name = reader.name().to_string();
        let header = reader.read_header().with_file_context(&name)?;
        if chosen.is_none() && !header.is_empty() {
            chosen = Some(header);
        }
    }
    Ok(chosen.unwrap_or_default())
}
