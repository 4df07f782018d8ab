//! Per-connection framing: `Content-Length: N\r\n\r\n<N bytes>`
//! primary, newline-delimited JSON when a connection opts in by sending a
//! line starting with `{` before any header block. The framing mode is
//! sniffed once per connection from the first meaningful line, never
//! configured globally — this mirrors the per-session sniff in the
//! session layer's Python ancestor.

use std::io::{self, BufRead, Write};

/// Hard cap on a single framed body.
pub const MAX_MESSAGE_BYTES: usize = 10 * 1024 * 1024;

/// How many blank/junk lines we tolerate while sniffing the framing mode
/// before giving up on the connection.
const MAX_PREAMBLE_LINES: usize = 200;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameMode {
    ContentLength,
    Ndjson,
}

/// Tracks the framing mode for one connection across calls to
/// [`read_message`]. `None` means not yet sniffed.
#[derive(Default)]
pub struct FrameState {
    mode: Option<FrameMode>,
}

impl FrameState {
    pub fn mode(&self) -> Option<FrameMode> {
        self.mode
    }
}

#[derive(Debug)]
pub enum FrameError {
    Io(io::Error),
    OversizeBody(usize),
    MalformedHeader,
    NoFramingDetected,
}

impl From<io::Error> for FrameError {
    fn from(e: io::Error) -> Self {
        FrameError::Io(e)
    }
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::Io(e) => write!(f, "transport io error: {e}"),
            FrameError::OversizeBody(n) => write!(f, "body of {n} bytes exceeds the {MAX_MESSAGE_BYTES}-byte cap"),
            FrameError::MalformedHeader => write!(f, "malformed header block"),
            FrameError::NoFramingDetected => write!(f, "connection sent only junk preamble lines"),
        }
    }
}

impl std::error::Error for FrameError {}

/// Reads one framed message body. Returns `Ok(None)` on a clean EOF
/// (including premature EOF mid-frame, which this session treats the same
/// as a tidy disconnect rather than an error).
pub fn read_message<R: BufRead>(reader: &mut R, state: &mut FrameState) -> Result<Option<Vec<u8>>, FrameError> {
    match state.mode {
        Some(FrameMode::Ndjson) => read_ndjson_line(reader),
        Some(FrameMode::ContentLength) => read_content_length_body(reader, None),
        None => {
            let Some(sniffed) = sniff_first_line(reader)? else { return Ok(None) };
            match sniffed {
                Sniffed::Ndjson(line) => {
                    state.mode = Some(FrameMode::Ndjson);
                    Ok(Some(line.into_bytes()))
                }
                Sniffed::ContentLength(first_header_line) => {
                    state.mode = Some(FrameMode::ContentLength);
                    read_content_length_body(reader, Some(first_header_line))
                }
            }
        }
    }
}

enum Sniffed {
    Ndjson(String),
    ContentLength(String),
}

/// Scans forward past blank/junk preamble lines until a line looks like
/// either a JSON object (NDJSON opt-in) or a `Content-Length` header.
fn sniff_first_line<R: BufRead>(reader: &mut R) -> Result<Option<Sniffed>, FrameError> {
    for _ in 0..MAX_PREAMBLE_LINES {
        let mut line = String::new();
        let n = reader.read_line(&mut line)?;
        if n == 0 {
            return Ok(None);
        }
        let trimmed = line.trim().to_string();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed.starts_with('{') {
            if trimmed.len() > MAX_MESSAGE_BYTES {
                return Err(FrameError::OversizeBody(trimmed.len()));
            }
            return Ok(Some(Sniffed::Ndjson(trimmed)));
        }
        if trimmed.to_ascii_lowercase().starts_with("content-length:") {
            return Ok(Some(Sniffed::ContentLength(trimmed)));
        }
        // Junk preamble line; keep scanning.
    }
    Err(FrameError::NoFramingDetected)
}

fn read_ndjson_line<R: BufRead>(reader: &mut R) -> Result<Option<Vec<u8>>, FrameError> {
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line)?;
        if n == 0 {
            return Ok(None);
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed.len() > MAX_MESSAGE_BYTES {
            return Err(FrameError::OversizeBody(trimmed.len()));
        }
        return Ok(Some(trimmed.as_bytes().to_vec()));
    }
}

/// Parses a `Content-Length` header block (case-insensitive name, folded
/// continuation lines, unknown headers ignored) and reads the body that
/// follows. `seed_line`, when given, is a header line already consumed by
/// the caller (the sniff) and is parsed first before reading more lines.
fn read_content_length_body<R: BufRead>(
    reader: &mut R,
    seed_line: Option<String>,
) -> Result<Option<Vec<u8>>, FrameError> {
    let mut content_length: Option<usize> = None;
    let mut last_header: Option<String> = None;

    if let Some(line) = seed_line {
        apply_header_line(&line, &mut content_length, &mut last_header)?;
    }

    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line)?;
        if n == 0 {
            return Ok(None);
        }
        let raw = line.trim_end_matches(['\r', '\n']);
        if raw.is_empty() {
            break;
        }
        if raw.starts_with(' ') || raw.starts_with('\t') {
            // Folded continuation of the previous header.
            if matches!(&last_header, Some(name) if name.eq_ignore_ascii_case("content-length")) {
                if let Some(n) = raw.trim().parse().ok() {
                    content_length = Some(n);
                }
            }
            continue;
        }
        apply_header_line(raw, &mut content_length, &mut last_header)?;
    }

    let len = content_length.ok_or(FrameError::MalformedHeader)?;
    if len > MAX_MESSAGE_BYTES {
        return Err(FrameError::OversizeBody(len));
    }

    let mut body = vec![0u8; len];
    match reader.read_exact(&mut body) {
        Ok(()) => Ok(Some(body)),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn apply_header_line(
    raw: &str,
    content_length: &mut Option<usize>,
    last_header: &mut Option<String>,
) -> Result<(), FrameError> {
    let Some((name, value)) = raw.split_once(':') else {
        return Err(FrameError::MalformedHeader);
    };
    let name = name.trim();
    let value = value.trim();
    *last_header = Some(name.to_string());
    if name.eq_ignore_ascii_case("content-length") {
        *content_length = value.parse().ok();
    }
    // Any other header is accepted and ignored.
    Ok(())
}

/// Writes one message in `mode`'s wire shape.
pub fn write_message<W: Write>(writer: &mut W, mode: FrameMode, body: &[u8]) -> io::Result<()> {
    match mode {
        FrameMode::ContentLength => {
            write!(writer, "Content-Length: {}\r\n\r\n", body.len())?;
            writer.write_all(body)?;
        }
        FrameMode::Ndjson => {
            writer.write_all(body)?;
            writer.write_all(b"\n")?;
        }
    }
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufReader, Cursor};

    #[test]
    fn reads_content_length_framed_message() {
        let body = br#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#;
        let input = format!("Content-Length: {}\r\n\r\n{}", body.len(), std::str::from_utf8(body).unwrap());
        let mut reader = BufReader::new(Cursor::new(input));
        let mut state = FrameState::default();
        let got = read_message(&mut reader, &mut state).unwrap().unwrap();
        assert_eq!(got, body);
        assert_eq!(state.mode(), Some(FrameMode::ContentLength));
    }

    #[test]
    fn content_length_header_name_is_case_insensitive() {
        let body = b"{}";
        let input = format!("CONTENT-LENGTH: {}\r\n\r\n{}", body.len(), "{}");
        let mut reader = BufReader::new(Cursor::new(input));
        let mut state = FrameState::default();
        let got = read_message(&mut reader, &mut state).unwrap().unwrap();
        assert_eq!(got, body);
    }

    #[test]
    fn unknown_headers_are_ignored() {
        let body = b"{}";
        let input = format!("X-Junk: yes\r\nContent-Length: {}\r\n\r\n{}", body.len(), "{}");
        let mut reader = BufReader::new(Cursor::new(input));
        let mut state = FrameState::default();
        let got = read_message(&mut reader, &mut state).unwrap().unwrap();
        assert_eq!(got, body);
    }

    #[test]
    fn oversize_body_is_rejected() {
        let input = format!("Content-Length: {}\r\n\r\n", MAX_MESSAGE_BYTES + 1);
        let mut reader = BufReader::new(Cursor::new(input));
        let mut state = FrameState::default();
        let err = read_message(&mut reader, &mut state).unwrap_err();
        assert!(matches!(err, FrameError::OversizeBody(_)));
    }

    #[test]
    fn clean_eof_before_any_bytes_is_none() {
        let mut reader = BufReader::new(Cursor::new(Vec::<u8>::new()));
        let mut state = FrameState::default();
        assert!(read_message(&mut reader, &mut state).unwrap().is_none());
    }

    #[test]
    fn premature_eof_mid_body_is_treated_as_clean_close() {
        let input = "Content-Length: 10\r\n\r\n{}".to_string();
        let mut reader = BufReader::new(Cursor::new(input));
        let mut state = FrameState::default();
        assert!(read_message(&mut reader, &mut state).unwrap().is_none());
    }

    #[test]
    fn ndjson_mode_sniffed_from_leading_brace() {
        let input = "{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"ping\"}\n{\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"ping\"}\n";
        let mut reader = BufReader::new(Cursor::new(input));
        let mut state = FrameState::default();
        let first = read_message(&mut reader, &mut state).unwrap().unwrap();
        assert_eq!(state.mode(), Some(FrameMode::Ndjson));
        assert!(std::str::from_utf8(&first).unwrap().contains("\"id\":1"));
        let second = read_message(&mut reader, &mut state).unwrap().unwrap();
        assert!(std::str::from_utf8(&second).unwrap().contains("\"id\":2"));
    }

    #[test]
    fn junk_preamble_lines_are_survived() {
        let body = b"{}";
        let input = format!("\n   \nnot a header\r\nContent-Length: {}\r\n\r\n{}", body.len(), "{}");
        let mut reader = BufReader::new(Cursor::new(input));
        let mut state = FrameState::default();
        let got = read_message(&mut reader, &mut state).unwrap().unwrap();
        assert_eq!(got, body);
    }

    #[test]
    fn write_then_read_round_trips_content_length() {
        let mut buf = Vec::new();
        write_message(&mut buf, FrameMode::ContentLength, b"{\"x\":1}").unwrap();
        let mut reader = BufReader::new(Cursor::new(buf));
        let mut state = FrameState::default();
        let got = read_message(&mut reader, &mut state).unwrap().unwrap();
        assert_eq!(got, b"{\"x\":1}");
    }
}
