//-
// Copyright (c) 2026, Pistolet contributors
//
// This file is part of Pistolet.
//
// Pistolet is free software: you can  redistribute it and/or modify it under
// the terms of the GNU General Public  License as published by the Free Soft-
// ware Foundation, either version 3 of  the License, or (at your option) any
// later version.
//
// Pistolet is distributed in the hope  that it will be useful, but WITHOUT
// ANY  WARRANTY; without  even the  implied warranty  of MERCHANTABILITY  or
// FITNESS FOR  A PARTICULAR  PURPOSE. See the  GNU General  Public License
// for more details.
//
// You should have received a copy of the GNU General Public License along
// with Pistolet. If not, see <http://www.gnu.org/licenses/>.

//! Byte-level framing: the bounded line reader used for command input and
//! the dot-stuffed reader used for the DATA payload.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt};

/// Maximum octets in a command line, including the line ending (RFC 5321
/// §4.5.3.1.4).
pub const MAX_COMMAND_LINE: usize = 512;

/// Ceiling used per read while resynchronising after an overlong line.
const RESYNC_CEILING: usize = 1024;

#[derive(Error, Debug)]
pub enum LineError {
    /// The byte ceiling was reached before the delimiter.
    #[error("Line too long")]
    TooLong,
    /// The stream ended cleanly before the delimiter.
    #[error("Delimiter not found")]
    NoDelimiter,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Reads one line of at most `max_bytes` octets ending with `delims`,
/// returning the line including the delimiter.
///
/// The delimiter is matched positionally; a non-matching byte resets the
/// match progress to zero without being re-examined, so overlapping
/// matches are not found (`b"\r\r\n"` does not end a CRLF-delimited line).
pub async fn read_line<R: AsyncRead + Unpin>(
    io: &mut R,
    max_bytes: usize,
    delims: &[u8],
) -> Result<Vec<u8>, LineError> {
    let mut line = Vec::new();
    let mut matched = 0;
    let mut byte = [0u8; 1];

    while line.len() < max_bytes {
        if 0 == io.read(&mut byte).await? {
            return Err(LineError::NoDelimiter);
        }

        line.push(byte[0]);
        if delims[matched] == byte[0] {
            matched += 1;
            if matched == delims.len() {
                return Ok(line);
            }
        } else {
            matched = 0;
        }
    }

    Err(LineError::TooLong)
}

/// Discards input up to and including the next newline, with a raised
/// internal ceiling per attempt. Used to get back in sync with the client
/// after an overlong line.
pub async fn skip_to_newline<R: AsyncRead + Unpin>(
    io: &mut R,
) -> Result<(), LineError> {
    loop {
        match read_line(io, RESYNC_CEILING, b"\n").await {
            Ok(_) => return Ok(()),
            Err(LineError::TooLong) => continue,
            Err(e) => return Err(e),
        }
    }
}

#[derive(Error, Debug)]
pub enum BodyError {
    /// The decoded payload exceeded the permitted size.
    #[error("Too much mail data")]
    TooLarge,
    #[error(transparent)]
    Io(#[from] io::Error),
}

// Headroom over the remaining budget when reading one payload line, so
// that the terminator and the stuffed dot of the final permitted line are
// never what pushes the transfer over the limit.
const LINE_SLACK: usize = 1002;

/// Reads the DATA payload, undoing dot-stuffing.
///
/// A line consisting solely of `.` ends the payload; the terminator is not
/// part of the output. Any other line whose first octet is `.` has that
/// octet stripped. Line endings inside the payload are preserved exactly.
///
/// RFC 5321 prescribes `.\r\n` as the terminator; `.\n`, and `.\r` at the
/// very end of the stream, are tolerated as well for the benefit of sloppy
/// clients.
///
/// A payload larger than `max_size` yields `BodyError::TooLarge`; the
/// remaining input is left unconsumed (see [`drain_dot_stuffed`]).
pub async fn read_dot_stuffed<R: AsyncBufRead + Unpin>(
    src: &mut R,
    max_size: usize,
) -> Result<Vec<u8>, BodyError> {
    let mut body = Vec::new();
    let mut line = Vec::new();

    loop {
        line.clear();
        let ceiling = (max_size - body.len() + LINE_SLACK) as u64;
        let nread = (&mut *src)
            .take(ceiling)
            .read_until(b'\n', &mut line)
            .await?;
        if 0 == nread {
            return Err(unexpected_eof().into());
        }

        if is_end_of_data(&line) {
            return Ok(body);
        }

        if !line.ends_with(b"\n") {
            if line.len() as u64 == ceiling {
                return Err(BodyError::TooLarge);
            }
            return Err(unexpected_eof().into());
        }

        let content = if b'.' == line[0] { &line[1..] } else { &line[..] };
        if body.len() + content.len() > max_size {
            return Err(BodyError::TooLarge);
        }
        body.extend_from_slice(content);
    }
}

/// Consumes and discards the remainder of a DATA payload up to and
/// including the terminator line.
pub async fn drain_dot_stuffed<R: AsyncBufRead + Unpin>(
    src: &mut R,
) -> io::Result<()> {
    let mut line = Vec::new();

    loop {
        line.clear();
        if 0 == src.read_until(b'\n', &mut line).await? {
            return Err(unexpected_eof());
        }

        if is_end_of_data(&line) {
            return Ok(());
        }

        if !line.ends_with(b"\n") {
            return Err(unexpected_eof());
        }
    }
}

// `.\r` only reaches us without its `\n` when the stream ends right
// after it.
fn is_end_of_data(line: &[u8]) -> bool {
    line == b".\r\n" || line == b".\n" || line == b".\r"
}

fn unexpected_eof() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "EOF in DATA payload")
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    fn read_line_sync(
        input: &[u8],
        max_bytes: usize,
        delims: &[u8],
    ) -> Result<Vec<u8>, LineError> {
        let mut input = input;
        futures::executor::block_on(read_line(&mut input, max_bytes, delims))
    }

    fn read_dot_stuffed_sync(
        input: &[u8],
        max_size: usize,
    ) -> Result<Vec<u8>, BodyError> {
        let mut input = input;
        futures::executor::block_on(read_dot_stuffed(&mut input, max_size))
    }

    #[test]
    fn read_line_includes_delimiter() {
        assert_eq!(
            b"NOOP\r\n".to_vec(),
            read_line_sync(b"NOOP\r\nQUIT\r\n", 512, b"\r\n").unwrap(),
        );
    }

    #[test]
    fn read_line_multibyte_delimiter_does_not_overlap() {
        // The second CR resets the match and is not itself counted as
        // progress, so the CRLF straddling it is not found.
        assert_eq!(
            b"a\r\r\nb\r\n".to_vec(),
            read_line_sync(b"a\r\r\nb\r\nrest", 512, b"\r\n").unwrap(),
        );
    }

    #[test]
    fn read_line_too_long() {
        assert_matches!(
            Err(LineError::TooLong),
            read_line_sync(b"aaaaaaaaaa\r\n", 4, b"\r\n"),
        );
    }

    #[test]
    fn read_line_eof_before_delimiter() {
        assert_matches!(
            Err(LineError::NoDelimiter),
            read_line_sync(b"NOOP", 512, b"\r\n"),
        );
    }

    #[test]
    fn skip_to_newline_resynchronises() {
        let mut input = vec![b'x'; 3000];
        input.extend_from_slice(b"\nNOOP\r\n");

        let mut cursor = &input[..];
        futures::executor::block_on(skip_to_newline(&mut cursor)).unwrap();
        assert_eq!(
            b"NOOP\r\n".to_vec(),
            futures::executor::block_on(read_line(&mut cursor, 512, b"\r\n"))
                .unwrap(),
        );
    }

    #[test]
    fn dot_stuffing_decodes() {
        assert_eq!(
            b".foo\r\nbar\r\n".to_vec(),
            read_dot_stuffed_sync(b"..foo\r\n.bar\r\n.\r\n", 1024).unwrap(),
        );
    }

    #[test]
    fn dot_stuffing_lenient_terminators() {
        assert_eq!(
            b"foo\r\n".to_vec(),
            read_dot_stuffed_sync(b"foo\r\n.\r\n", 1024).unwrap(),
        );
        assert_eq!(
            b"foo\n".to_vec(),
            read_dot_stuffed_sync(b"foo\n.\n", 1024).unwrap(),
        );
        assert_eq!(
            b"foo\r\n".to_vec(),
            read_dot_stuffed_sync(b"foo\r\n.\r", 1024).unwrap(),
        );
    }

    #[test]
    fn dot_stuffing_preserves_interior_line_endings() {
        assert_eq!(
            b"a\rb\r\nplain\nmixed\r\n".to_vec(),
            read_dot_stuffed_sync(b"a\rb\r\nplain\nmixed\r\n.\r\n", 1024)
                .unwrap(),
        );
    }

    #[test]
    fn dot_stuffing_eof_is_an_error() {
        assert_matches!(
            Err(BodyError::Io(_)),
            read_dot_stuffed_sync(b"foo\r\n", 1024),
        );
        assert_matches!(
            Err(BodyError::Io(_)),
            read_dot_stuffed_sync(b"foo\r\npartial", 1024),
        );
    }

    #[test]
    fn dot_stuffing_enforces_size_limit() {
        assert_matches!(
            Err(BodyError::TooLarge),
            read_dot_stuffed_sync(b"aaaaaaaaaa\r\nbbbbbbbbbb\r\n.\r\n", 16),
        );

        // A single enormous line cannot buffer unboundedly either.
        let mut huge = vec![b'x'; 4096];
        huge.extend_from_slice(b"\r\n.\r\n");
        assert_matches!(
            Err(BodyError::TooLarge),
            read_dot_stuffed_sync(&huge, 16),
        );
    }

    #[test]
    fn drain_consumes_through_terminator() {
        let mut cursor: &[u8] = b"junk\r\nmore junk\r\n.\r\nNOOP\r\n";
        futures::executor::block_on(drain_dot_stuffed(&mut cursor)).unwrap();
        assert_eq!(
            b"NOOP\r\n".to_vec(),
            futures::executor::block_on(read_line(&mut cursor, 512, b"\r\n"))
                .unwrap(),
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 4096,
            ..ProptestConfig::default()
        })]

        #[test]
        fn dot_stuffing_round_trips(content in "[x.\r\n]{0,100}\r\n") {
            // Encode the way a conforming sender would: double any dot at
            // the start of a line, then append the terminator.
            let mut stuffed = content.replace("\n.", "\n..");
            if stuffed.starts_with('.') {
                stuffed = format!(".{}", stuffed);
            }
            stuffed.push_str(".\r\n");

            let decoded =
                read_dot_stuffed_sync(stuffed.as_bytes(), 4096).unwrap();
            prop_assert_eq!(content.as_bytes(), &decoded[..]);
        }
    }
}
