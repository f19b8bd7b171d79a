// src/http.rs
pub use ::http::{Method, Version};

use crate::headers::Headers;

/// Parsed request line and headers of the current exchange.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    /// Request target exactly as sent.
    pub raw_target: String,
    /// Percent-decoded path component.
    pub path: String,
    /// Raw query string, without the leading `?`.
    pub query: Option<String>,
    pub version: Version,
    pub headers: Headers,
}

impl Default for RequestHead {
    fn default() -> Self {
        Self {
            method: Method::GET,
            raw_target: String::new(),
            path: String::new(),
            query: None,
            version: Version::HTTP_11,
            headers: Headers::new(),
        }
    }
}

impl RequestHead {
    /// Clear for the next keep-alive exchange, keeping allocations.
    pub(crate) fn reset(&mut self) {
        self.method = Method::GET;
        self.raw_target.clear();
        self.path.clear();
        self.query = None;
        self.version = Version::HTTP_11;
        self.headers.clear();
    }

    pub fn is_head(&self) -> bool {
        self.method == Method::HEAD
    }

    /// `Connection: upgrade` was requested.
    pub fn is_upgrade(&self) -> bool {
        self.headers.has_token("connection", "upgrade")
    }

    /// Keep-alive default for the negotiated version plus the `Connection` header.
    pub fn wants_keep_alive(&self) -> bool {
        if self.headers.has_token("connection", "close") {
            return false;
        }
        match self.version {
            Version::HTTP_11 => true,
            _ => self.headers.has_token("connection", "keep-alive"),
        }
    }

    pub fn expects_continue(&self) -> bool {
        self.version == Version::HTTP_11
            && self
                .headers
                .get("expect")
                .is_some_and(|v| v.trim().eq_ignore_ascii_case("100-continue"))
    }
}

/// Status line and headers the application builds for the response.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: Option<String>,
    pub headers: Headers,
}

impl Default for ResponseHead {
    fn default() -> Self {
        Self {
            status: 200,
            reason: None,
            headers: Headers::new(),
        }
    }
}

impl ResponseHead {
    pub(crate) fn reset(&mut self) {
        self.status = 200;
        self.reason = None;
        self.headers.clear();
    }

    /// Reason phrase that goes on the wire.
    pub fn reason_phrase(&self) -> &str {
        match &self.reason {
            Some(reason) => reason,
            None => reason_phrase(self.status),
        }
    }
}

/// Canonical reason phrase for `status`, or `"Unknown"`.
pub fn reason_phrase(status: u16) -> &'static str {
    ::http::StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("Unknown")
}

/// Informational, 204, 205 and 304 responses never carry a body.
pub fn status_can_have_body(status: u16) -> bool {
    !(100..200).contains(&status) && status != 204 && status != 205 && status != 304
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_phrases() {
        assert_eq!(reason_phrase(200), "OK");
        assert_eq!(reason_phrase(101), "Switching Protocols");
        assert_eq!(reason_phrase(431), "Request Header Fields Too Large");
        assert_eq!(reason_phrase(599), "Unknown");
    }

    #[test]
    fn test_custom_reason_wins() {
        let mut head = ResponseHead::default();
        head.status = 404;
        assert_eq!(head.reason_phrase(), "Not Found");
        head.reason = Some("Gone Fishing".into());
        assert_eq!(head.reason_phrase(), "Gone Fishing");
    }

    #[test]
    fn test_bodiless_statuses() {
        assert!(status_can_have_body(200));
        assert!(status_can_have_body(500));
        for status in [100, 101, 204, 205, 304] {
            assert!(!status_can_have_body(status), "{status}");
        }
    }

    #[test]
    fn test_keep_alive_defaults() {
        let mut head = RequestHead::default();
        assert!(head.wants_keep_alive());
        head.headers.append("Connection", "close");
        assert!(!head.wants_keep_alive());

        let mut head = RequestHead {
            version: Version::HTTP_10,
            ..RequestHead::default()
        };
        assert!(!head.wants_keep_alive());
        head.headers.append("Connection", "Keep-Alive");
        assert!(head.wants_keep_alive());
    }

    #[test]
    fn test_expect_continue_only_on_http11() {
        let mut head = RequestHead::default();
        head.headers.append("Expect", "100-continue");
        assert!(head.expects_continue());
        head.version = Version::HTTP_10;
        assert!(!head.expects_continue());
    }
}
