//! Incremental conversation stream
//!
//! Parses the export's top-level object header eagerly (to expose `userId`
//! and `exportDate`) and then yields one conversation at a time out of the
//! `conversations` array, so peak memory is bounded by the largest single
//! conversation rather than the whole document.
//!
//! The scanner below only understands the JSON skeleton: object keys,
//! string values, and the byte extent of a complete value. Whole
//! conversation objects are captured as raw bytes and handed to serde_json,
//! which keeps the delimiter handling in one place.

use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use crate::error::{Error, Result};
use crate::models::{ExportHeader, RawConversation};

/// Open an export for streaming. Returns the eagerly-parsed header and a
/// single-pass, non-restartable conversation sequence. The underlying file
/// descriptor is released when the stream is dropped.
///
/// TAR inputs are unpacked to a temporary file first; the stream then runs
/// over that spilled copy, keeping memory bounded either way.
pub fn stream(path: &Path) -> Result<(ExportHeader, ConversationStream)> {
    let is_tar = path
        .extension()
        .map(|e| e.eq_ignore_ascii_case("tar"))
        .unwrap_or(false);

    if is_tar {
        let spilled = spill_archive_entry(path)?;
        let file = File::open(spilled.path())?;
        ConversationStream::open(BufReader::new(file), Some(spilled))
    } else {
        let file = File::open(path)
            .map_err(|e| Error::Extraction(format!("cannot open {}: {e}", path.display())))?;
        ConversationStream::open(BufReader::new(file), None)
    }
}

/// Copy the selected JSON entry of a TAR archive into a temp file.
fn spill_archive_entry(path: &Path) -> Result<tempfile::NamedTempFile> {
    let document = super::read_tarball(path, true)?;
    let mut tmp = tempfile::NamedTempFile::new()?;
    serde_json::to_writer(&mut tmp, &document)?;
    tmp.flush()?;
    Ok(tmp)
}

/// Lazy sequence of conversations out of one export document
pub struct ConversationStream {
    scanner: Scanner<BufReader<File>>,
    done: bool,
    first: bool,
    /// Keeps the spilled archive entry alive for the stream's lifetime
    _spill: Option<tempfile::NamedTempFile>,
}

impl ConversationStream {
    fn open(
        reader: BufReader<File>,
        spill: Option<tempfile::NamedTempFile>,
    ) -> Result<(ExportHeader, Self)> {
        let mut scanner = Scanner::new(reader);
        let header = read_header(&mut scanner)?;
        Ok((
            header,
            Self {
                scanner,
                done: false,
                first: true,
                _spill: spill,
            },
        ))
    }

    fn next_conversation(&mut self) -> Result<Option<RawConversation>> {
        self.scanner.skip_whitespace()?;

        match self.scanner.peek()? {
            Some(b']') => {
                self.scanner.bump()?;
                self.done = true;
                return Ok(None);
            }
            Some(b',') if !self.first => {
                self.scanner.bump()?;
                self.scanner.skip_whitespace()?;
            }
            Some(_) if self.first => {}
            Some(other) => {
                return Err(Error::Extraction(format!(
                    "expected ',' or ']' in conversations array, found '{}'",
                    other as char
                )))
            }
            None => {
                return Err(Error::Extraction(
                    "unexpected end of input inside conversations array".to_string(),
                ))
            }
        }

        self.first = false;
        let bytes = self.scanner.capture_value()?;
        let conversation = serde_json::from_slice(&bytes)
            .map_err(|e| Error::Extraction(format!("malformed conversation object: {e}")))?;
        Ok(Some(conversation))
    }
}

impl Iterator for ConversationStream {
    type Item = Result<RawConversation>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_conversation() {
            Ok(Some(conversation)) => Some(Ok(conversation)),
            Ok(None) => None,
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Parse top-level keys until the `conversations` array opens.
///
/// Real Skype exports write `userId` and `exportDate` before the
/// conversation list; a header still incomplete at that point is an error.
fn read_header<R: BufRead>(scanner: &mut Scanner<R>) -> Result<ExportHeader> {
    scanner.skip_whitespace()?;
    scanner.expect(b'{')?;

    let mut user_id: Option<String> = None;
    let mut export_date: Option<String> = None;
    let mut first = true;

    loop {
        scanner.skip_whitespace()?;
        match scanner.peek()? {
            Some(b'}') => {
                return Err(Error::Extraction(
                    "export has no conversations array".to_string(),
                ))
            }
            Some(b',') if !first => {
                scanner.bump()?;
                scanner.skip_whitespace()?;
            }
            Some(_) if first => {}
            Some(b'"') => {}
            Some(other) => {
                return Err(Error::Extraction(format!(
                    "unexpected '{}' in export header",
                    other as char
                )))
            }
            None => {
                return Err(Error::Extraction(
                    "unexpected end of input in export header".to_string(),
                ))
            }
        }
        first = false;

        let key = scanner.read_string()?;
        scanner.skip_whitespace()?;
        scanner.expect(b':')?;
        scanner.skip_whitespace()?;

        match key.as_str() {
            "conversations" => {
                scanner.expect(b'[')?;
                let user_id = user_id.ok_or_else(|| {
                    Error::Extraction(
                        "export header has no userId before conversations".to_string(),
                    )
                })?;
                let export_date = export_date.ok_or_else(|| {
                    Error::Extraction(
                        "export header has no exportDate before conversations".to_string(),
                    )
                })?;
                return Ok(ExportHeader {
                    user_id,
                    export_date,
                });
            }
            "userId" => {
                user_id = Some(scanner.read_string()?);
            }
            "exportDate" => {
                export_date = Some(scanner.read_string()?);
            }
            _ => {
                scanner.capture_value()?;
            }
        }
    }
}

/// Byte-level scanner over a buffered reader. `peek` never consumes, so the
/// hand-off between skeleton parsing and serde stays exact.
struct Scanner<R: BufRead> {
    reader: R,
}

impl<R: BufRead> Scanner<R> {
    fn new(reader: R) -> Self {
        Self { reader }
    }

    fn peek(&mut self) -> Result<Option<u8>> {
        let buf = self.reader.fill_buf()?;
        Ok(buf.first().copied())
    }

    fn bump(&mut self) -> Result<u8> {
        let byte = self.peek()?.ok_or_else(|| {
            Error::Extraction("unexpected end of input".to_string())
        })?;
        self.reader.consume(1);
        Ok(byte)
    }

    fn expect(&mut self, expected: u8) -> Result<()> {
        let found = self.bump()?;
        if found != expected {
            return Err(Error::Extraction(format!(
                "expected '{}', found '{}'",
                expected as char, found as char
            )));
        }
        Ok(())
    }

    fn skip_whitespace(&mut self) -> Result<()> {
        while let Some(byte) = self.peek()? {
            if byte.is_ascii_whitespace() {
                self.reader.consume(1);
            } else {
                break;
            }
        }
        Ok(())
    }

    /// Read a JSON string, decoding escapes.
    fn read_string(&mut self) -> Result<String> {
        self.expect(b'"')?;
        let mut raw = vec![b'"'];
        self.take_string_tail(&mut raw)?;
        let value: String = serde_json::from_slice(&raw)
            .map_err(|e| Error::Extraction(format!("malformed JSON string: {e}")))?;
        Ok(value)
    }

    /// Consume the remainder of a string (after the opening quote already in
    /// `out`) into `out`, including the closing quote.
    fn take_string_tail(&mut self, out: &mut Vec<u8>) -> Result<()> {
        let mut escaped = false;
        loop {
            let byte = self.bump()?;
            out.push(byte);
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                return Ok(());
            }
        }
    }

    /// Capture the raw bytes of the next complete JSON value.
    fn capture_value(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let first = self.peek()?.ok_or_else(|| {
            Error::Extraction("unexpected end of input".to_string())
        })?;

        match first {
            b'"' => {
                out.push(self.bump()?);
                self.take_string_tail(&mut out)?;
            }
            b'{' | b'[' => {
                let mut depth = 0usize;
                loop {
                    let byte = self.bump()?;
                    out.push(byte);
                    match byte {
                        b'"' => self.take_string_tail(&mut out)?,
                        b'{' | b'[' => depth += 1,
                        b'}' | b']' => {
                            depth = depth.checked_sub(1).ok_or_else(|| {
                                Error::Extraction("unbalanced JSON value".to_string())
                            })?;
                            if depth == 0 {
                                break;
                            }
                        }
                        _ => {}
                    }
                }
            }
            _ => {
                // Number or literal: runs until a structural delimiter
                loop {
                    match self.peek()? {
                        Some(b',') | Some(b'}') | Some(b']') | None => break,
                        Some(byte) if byte.is_ascii_whitespace() => break,
                        Some(_) => out.push(self.bump()?),
                    }
                }
                if out.is_empty() {
                    return Err(Error::Extraction("empty JSON value".to_string()));
                }
            }
        }

        Ok(out)
    }
}
