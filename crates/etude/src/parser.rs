// src/parser.rs
//! Incremental request-line and header parser.
//!
//! The parser pulls complete CRLF-terminated lines out of the connection's
//! input chain. A partial line stays in the chain untouched until more bytes
//! arrive, so a request head may straddle any number of reads and blocks.

use percent_encoding::percent_decode_str;

use crate::chain::BlockChain;
use crate::config::ServerLimits;
use crate::error::ParseError;
use crate::http::{Method, RequestHead, Version};
use crate::pool::MemoryPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    RequestLine,
    Headers,
}

#[derive(Debug)]
pub struct HeadParser {
    state: State,
    /// Scratch copy of the line being parsed; reused across requests.
    line: Vec<u8>,
    header_bytes: usize,
    header_count: usize,
}

impl Default for HeadParser {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadParser {
    pub fn new() -> Self {
        Self {
            state: State::RequestLine,
            line: Vec::with_capacity(256),
            header_bytes: 0,
            header_count: 0,
        }
    }

    /// No part of a request head has been consumed yet.
    pub fn is_idle(&self) -> bool {
        self.state == State::RequestLine
    }

    pub fn reset(&mut self) {
        self.state = State::RequestLine;
        self.line.clear();
        self.header_bytes = 0;
        self.header_count = 0;
    }

    /// Consume as many complete lines as `input` holds.
    ///
    /// Returns `Ok(true)` once the blank line ending the head was consumed;
    /// `head` is then fully populated and any following bytes (body or a
    /// pipelined request) are left in `input`. `Ok(false)` means more bytes
    /// are needed.
    pub fn parse(
        &mut self,
        input: &mut BlockChain,
        pool: &MemoryPool,
        head: &mut RequestHead,
        limits: &ServerLimits,
    ) -> Result<bool, ParseError> {
        loop {
            let Some(lf) = input.find(b'\n') else {
                self.check_partial(input.len(), limits)?;
                return Ok(false);
            };
            let line_len = lf + 1;
            self.check_line(line_len, limits)?;

            self.line.clear();
            input.copy_prefix(line_len, &mut self.line);
            input.consume(pool, line_len);

            let content = match self.line.strip_suffix(b"\r\n") {
                Some(content) => content,
                None => return Err(self.bare_lf()),
            };

            match self.state {
                // Robustness: empty lines before a request line are skipped.
                State::RequestLine if content.is_empty() => {}
                State::RequestLine => {
                    parse_request_line(content, head)?;
                    self.state = State::Headers;
                }
                State::Headers if content.is_empty() => {
                    self.reset();
                    return Ok(true);
                }
                State::Headers => {
                    self.header_count += 1;
                    if self.header_count > limits.max_headers {
                        return Err(ParseError::TooManyHeaders);
                    }
                    let (name, value) = parse_header_line(content)?;
                    head.headers.append(name, value);
                }
            }
        }
    }

    fn check_partial(&self, pending: usize, limits: &ServerLimits) -> Result<(), ParseError> {
        match self.state {
            State::RequestLine if pending > limits.max_request_line + 2 => {
                Err(ParseError::RequestLineTooLong)
            }
            State::Headers if self.header_bytes + pending > limits.max_header_bytes => {
                Err(ParseError::HeadersTooLarge)
            }
            _ => Ok(()),
        }
    }

    fn check_line(&mut self, line_len: usize, limits: &ServerLimits) -> Result<(), ParseError> {
        match self.state {
            State::RequestLine if line_len > limits.max_request_line + 2 => {
                Err(ParseError::RequestLineTooLong)
            }
            State::RequestLine => Ok(()),
            State::Headers => {
                self.header_bytes += line_len;
                if self.header_bytes > limits.max_header_bytes {
                    Err(ParseError::HeadersTooLarge)
                } else {
                    Ok(())
                }
            }
        }
    }

    fn bare_lf(&self) -> ParseError {
        match self.state {
            State::RequestLine => ParseError::InvalidRequestLine,
            State::Headers => ParseError::InvalidHeader,
        }
    }
}

/// `METHOD SP request-target SP HTTP-version`
fn parse_request_line(line: &[u8], head: &mut RequestHead) -> Result<(), ParseError> {
    let mut parts = line.split(|&b| b == b' ');
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(ParseError::InvalidRequestLine);
    };

    if method.is_empty() || !method.iter().all(|&b| is_token(b)) {
        return Err(ParseError::InvalidRequestLine);
    }
    head.method = Method::from_bytes(method).map_err(|_| ParseError::InvalidRequestLine)?;

    head.version = match version {
        b"HTTP/1.1" => Version::HTTP_11,
        b"HTTP/1.0" => Version::HTTP_10,
        v if v.starts_with(b"HTTP/") => return Err(ParseError::UnsupportedVersion),
        _ => return Err(ParseError::InvalidRequestLine),
    };

    let target = std::str::from_utf8(target).map_err(|_| ParseError::InvalidTarget)?;
    if target.is_empty() || target.bytes().any(|b| b.is_ascii_control()) {
        return Err(ParseError::InvalidTarget);
    }

    let path_and_query = if target.starts_with('/') || target == "*" {
        target
    } else if let Some(scheme_end) = target.find("://") {
        // Absolute form: drop scheme and authority.
        let rest = &target[scheme_end + 3..];
        match rest.find(['/', '?']) {
            Some(i) => &rest[i..],
            None => "/",
        }
    } else {
        return Err(ParseError::InvalidTarget);
    };

    let (path, query) = match path_and_query.find('?') {
        Some(idx) => (&path_and_query[..idx], Some(&path_and_query[idx + 1..])),
        None => (path_and_query, None),
    };
    let path = if path.is_empty() { "/" } else { path };

    let decoded = percent_decode_str(path)
        .decode_utf8()
        .map_err(|_| ParseError::InvalidTarget)?;

    head.raw_target.clear();
    head.raw_target.push_str(target);
    head.path.clear();
    head.path.push_str(&decoded);
    head.query = query.map(str::to_string);
    Ok(())
}

/// `field-name ":" OWS field-value OWS`
fn parse_header_line(line: &[u8]) -> Result<(&str, &str), ParseError> {
    // Obsolete line folding is rejected.
    if matches!(line.first(), Some(b' ' | b'\t')) {
        return Err(ParseError::InvalidHeader);
    }
    let colon = memchr::memchr(b':', line).ok_or(ParseError::InvalidHeader)?;
    let name = &line[..colon];
    if name.is_empty() || !name.iter().all(|&b| is_token(b)) {
        return Err(ParseError::InvalidHeader);
    }

    let value = trim_ows(&line[colon + 1..]);
    if value.iter().any(|&b| b != b'\t' && b.is_ascii_control()) {
        return Err(ParseError::InvalidHeader);
    }

    let name = std::str::from_utf8(name).map_err(|_| ParseError::InvalidHeader)?;
    let value = std::str::from_utf8(value).map_err(|_| ParseError::InvalidHeader)?;
    Ok((name, value))
}

fn trim_ows(mut value: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = value {
        value = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = value {
        value = rest;
    }
    value
}

#[inline]
fn is_token(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(bytes: &[u8]) -> Result<(bool, RequestHead, usize), ParseError> {
        let pool = MemoryPool::new(64);
        let mut chain = BlockChain::new();
        chain.extend_from_slice(&pool, bytes);
        let mut parser = HeadParser::new();
        let mut head = RequestHead::default();
        let done = parser.parse(&mut chain, &pool, &mut head, &ServerLimits::default())?;
        let left = chain.len();
        chain.release(&pool);
        Ok((done, head, left))
    }

    #[test]
    fn test_parse_basic_request() {
        let (done, head, left) = parse_all(
            b"GET /some/path?foo=bar HTTP/1.1\r\nHost: localhost\r\nContent-Length: 11\r\n\r\nBodyContent",
        )
        .unwrap();

        assert!(done);
        assert_eq!(head.method, Method::GET);
        assert_eq!(head.path, "/some/path");
        assert_eq!(head.query.as_deref(), Some("foo=bar"));
        assert_eq!(head.raw_target, "/some/path?foo=bar");
        assert_eq!(head.headers.len(), 2);
        assert_eq!(head.headers.get("content-length"), Some("11"));
        // The body stays in the chain for the body reader.
        assert_eq!(left, 11);
    }

    #[test]
    fn test_parse_incomplete_request() {
        let (done, _, left) = parse_all(b"GET /some/path?foo=bar HTT").unwrap();
        assert!(!done);
        assert_eq!(left, 26);
    }

    #[test]
    fn test_head_split_across_reads() {
        let pool = MemoryPool::new(64);
        let limits = ServerLimits::default();
        let mut chain = BlockChain::new();
        let mut parser = HeadParser::new();
        let mut head = RequestHead::default();

        let request = b"POST /upload HTTP/1.0\r\nHost: a\r\nX-Long: 0123456789012345678901234567890123456789012345678901234567890123456789\r\n\r\n";
        for piece in request.chunks(7) {
            assert!(
                !parser.parse(&mut chain, &pool, &mut head, &limits).unwrap(),
                "finished early"
            );
            chain.extend_from_slice(&pool, piece);
        }
        assert!(parser.parse(&mut chain, &pool, &mut head, &limits).unwrap());
        assert_eq!(head.method, Method::POST);
        assert_eq!(head.version, Version::HTTP_10);
        assert_eq!(head.headers.get("x-long").map(str::len), Some(70));
        assert!(parser.is_idle());
        assert!(chain.is_empty());
    }

    #[test]
    fn test_malformed_start_line() {
        assert_eq!(
            parse_all(b"NOTHTTP\r\n\r\n").unwrap_err(),
            ParseError::InvalidRequestLine
        );
        assert_eq!(
            parse_all(b"GET  / HTTP/1.1\r\n\r\n").unwrap_err(),
            ParseError::InvalidRequestLine
        );
        assert_eq!(
            parse_all(b"GET / HTTP/2.0\r\n\r\n").unwrap_err(),
            ParseError::UnsupportedVersion
        );
        assert_eq!(
            parse_all(b"GET nope HTTP/1.1\r\n\r\n").unwrap_err(),
            ParseError::InvalidTarget
        );
        assert_eq!(
            parse_all(b"GET / HTTP/1.1\n\n").unwrap_err(),
            ParseError::InvalidRequestLine
        );
    }

    #[test]
    fn test_malformed_headers() {
        for raw in [
            &b"GET / HTTP/1.1\r\nNoColon\r\n\r\n"[..],
            b"GET / HTTP/1.1\r\nBad Name: x\r\n\r\n",
            b"GET / HTTP/1.1\r\nA: b\r\n folded\r\n\r\n",
            b"GET / HTTP/1.1\r\n: empty\r\n\r\n",
        ] {
            assert_eq!(parse_all(raw).unwrap_err(), ParseError::InvalidHeader);
        }
    }

    #[test]
    fn test_leading_empty_lines_are_skipped() {
        let (done, head, _) = parse_all(b"\r\n\r\nGET / HTTP/1.1\r\n\r\n").unwrap();
        assert!(done);
        assert_eq!(head.path, "/");
    }

    #[test]
    fn test_path_is_percent_decoded() {
        let (_, head, _) = parse_all(b"GET /%%2000?a=%20 HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(head.path, "/% 00");
        assert_eq!(head.raw_target, "/%%2000?a=%20");
        assert_eq!(head.query.as_deref(), Some("a=%20"));
    }

    #[test]
    fn test_absolute_form_and_asterisk() {
        let (_, head, _) =
            parse_all(b"GET http://example.com/a/b?x=1 HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(head.path, "/a/b");
        assert_eq!(head.query.as_deref(), Some("x=1"));

        let (_, head, _) = parse_all(b"OPTIONS * HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(head.method, Method::OPTIONS);
        assert_eq!(head.path, "*");
    }

    #[test]
    fn test_header_value_whitespace_trimmed() {
        let (_, head, _) = parse_all(b"GET / HTTP/1.1\r\nX-A: \t padded \t\r\nX-B:\r\n\r\n").unwrap();
        assert_eq!(head.headers.get("x-a"), Some("padded"));
        assert_eq!(head.headers.get("x-b"), Some(""));
    }

    #[test]
    fn test_limits() {
        let pool = MemoryPool::new(64);
        let limits = ServerLimits {
            max_request_line: 16,
            max_header_bytes: 32,
            max_headers: 2,
            ..ServerLimits::default()
        };
        let run = |bytes: &[u8]| {
            let mut chain = BlockChain::new();
            chain.extend_from_slice(&pool, bytes);
            let mut head = RequestHead::default();
            let res = HeadParser::new().parse(&mut chain, &pool, &mut head, &limits);
            chain.release(&pool);
            res
        };

        assert_eq!(
            run(b"GET /a-very-long-path HTTP/1.1\r\n\r\n"),
            Err(ParseError::RequestLineTooLong)
        );
        // Still unterminated, but already past the limit.
        assert_eq!(run(b"GET /a-very-long-path"), Err(ParseError::RequestLineTooLong));
        assert_eq!(
            run(b"GET / HTTP/1.1\r\nA: 1\r\nB: 2\r\nC: 3\r\n\r\n"),
            Err(ParseError::TooManyHeaders)
        );
        assert_eq!(
            run(b"GET / HTTP/1.1\r\nX-Big: 0123456789012345678901234567890\r\n\r\n"),
            Err(ParseError::HeadersTooLarge)
        );
    }
}
