// src/frame.rs
//! HTTP/1.x exchange state machine for one connection.
//!
//! A [`Frame`] reads a request head into pooled blocks, hands the
//! application an [`Exchange`], frames whatever the application writes, and
//! then either resets for the next keep-alive request or closes the socket.

use std::io;
use std::rc::Rc;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, error, trace, warn};

use crate::body::{Decoded, RequestBody};
use crate::chain::BlockChain;
use crate::conn::ConnectionInfo;
use crate::context::{Lifetime, ServiceContext};
use crate::error::{BoxError, EngineError, EngineResult, ParseError};
use crate::filter::BoxedStream;
use crate::headers::Headers;
use crate::http::{Method, RequestHead, ResponseHead, Version, status_can_have_body};
use crate::parser::HeadParser;
use crate::pool::MemoryPool;
use crate::upgrade::Upgraded;

/// Value of the `Server` header the engine adds.
pub const SERVER_NAME: &str = "etude";

const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";
const LAST_CHUNK: &[u8] = b"0\r\n\r\n";
const HEX: &[u8; 16] = b"0123456789ABCDEF";

/// The request handler invoked once per parsed request.
///
/// Runs on the worker thread that owns the connection; the future it returns
/// does not need to be `Send`.
#[async_trait::async_trait(?Send)]
pub trait Application: Send + Sync + 'static {
    async fn call(&self, exchange: &mut Exchange<'_>) -> Result<(), BoxError>;
}

type StartingHook = Box<dyn FnOnce(&mut ResponseHead) -> Result<(), BoxError>>;
type CompletedHook = Box<dyn FnOnce() -> Result<(), BoxError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    /// Response head not produced yet.
    Pending,
    /// HEAD or a bodiless status: body bytes never reach the wire.
    Suppressed,
    Length(u64),
    Chunked,
    /// Delimited by closing the connection.
    UntilClose,
}

pub struct Frame {
    ctx: Arc<ServiceContext>,
    pool: Rc<MemoryPool>,
    io: Option<BoxedStream>,
    info: ConnectionInfo,
    drain: watch::Receiver<bool>,

    input: BlockChain,
    output: BlockChain,
    parser: HeadParser,

    request: RequestHead,
    response: ResponseHead,
    body: RequestBody,
    framing: Framing,
    keep_alive: bool,
    continue_pending: bool,
    upgraded: bool,
    on_starting: Vec<StartingHook>,
    on_completed: Vec<CompletedHook>,
    requests_served: u32,
}

impl Frame {
    pub fn new(
        ctx: Arc<ServiceContext>,
        pool: Rc<MemoryPool>,
        io: BoxedStream,
        info: ConnectionInfo,
        drain: watch::Receiver<bool>,
    ) -> Self {
        Self {
            ctx,
            pool,
            io: Some(io),
            info,
            drain,
            input: BlockChain::new(),
            output: BlockChain::new(),
            parser: HeadParser::new(),
            request: RequestHead::default(),
            response: ResponseHead::default(),
            body: RequestBody::empty(),
            framing: Framing::Pending,
            keep_alive: false,
            continue_pending: false,
            upgraded: false,
            on_starting: Vec::new(),
            on_completed: Vec::new(),
            requests_served: 0,
        }
    }

    /// Serve requests until the connection closes.
    pub async fn run(mut self) {
        loop {
            match self.next_request().await {
                Ok(true) => {}
                Ok(false) => break,
                Err(err) => {
                    self.reject(err).await;
                    break;
                }
            }
            if !self.exchange().await {
                break;
            }
            self.reset();
        }
        self.close().await;
    }

    #[inline]
    fn has_started(&self) -> bool {
        self.framing != Framing::Pending
    }

    fn draining(&self) -> bool {
        *self.drain.borrow()
    }

    fn reset(&mut self) {
        self.request.reset();
        self.response.reset();
        self.parser.reset();
        self.body = RequestBody::empty();
        self.framing = Framing::Pending;
        self.continue_pending = false;
        self.on_starting.clear();
        self.on_completed.clear();
    }

    /// Wait for and parse the next request head.
    ///
    /// `Ok(false)` is a clean end: EOF, idle timeout or drain between requests.
    async fn next_request(&mut self) -> EngineResult<bool> {
        loop {
            if self
                .parser
                .parse(&mut self.input, &self.pool, &mut self.request, self.ctx.limits())?
            {
                self.body = RequestBody::for_request(&self.request)?;
                return Ok(true);
            }

            let idle = self.input.is_empty() && self.parser.is_idle();
            if idle && self.draining() {
                return Ok(false);
            }
            let timeout = self.ctx.limits().keep_alive_timeout;
            let Some(io) = self.io.as_mut() else {
                return Ok(false);
            };

            let read = tokio::time::timeout(timeout, fill(io, &mut self.input, &self.pool));
            let res = if idle {
                tokio::select! {
                    res = read => res,
                    _ = self.drain.changed() => return Ok(false),
                }
            } else {
                read.await
            };

            let n = match res {
                Ok(n) => n?,
                Err(_) => {
                    debug!(idle, "read timed out");
                    return Ok(false);
                }
            };
            if n == 0 {
                return if idle {
                    Ok(false)
                } else {
                    Err(ParseError::UnexpectedEof.into())
                };
            }
        }
    }

    /// Run the application for the parsed request and complete the response.
    /// Returns whether the connection may carry another request.
    async fn exchange(&mut self) -> bool {
        self.requests_served += 1;
        self.ctx.metrics().inc_req();

        let at_cap = self
            .ctx
            .limits()
            .max_requests_per_connection
            .is_some_and(|max| self.requests_served >= max);
        self.keep_alive = self.request.wants_keep_alive() && !at_cap && !self.draining();
        self.continue_pending = self.request.expects_continue() && !self.body.is_complete();

        trace!(
            method = %self.request.method,
            path = %self.request.path,
            version = ?self.request.version,
            "request"
        );

        let app = self.ctx.application().clone();
        let result = invoke(&*app, &mut Exchange { frame: &mut *self }).await;

        if self.upgraded {
            if let Err(err) = result {
                warn!(error = %err, "application failed after upgrade");
            }
            self.fire_completed();
            return false;
        }
        // Whatever the client sends next was meant for the protocol it asked for.
        if self.request.is_upgrade() {
            self.keep_alive = false;
        }

        if let Err(err) = result {
            if self.has_started() {
                error!(error = %err, path = %self.request.path, "application failed mid-response, aborting");
                self.fire_completed();
                return false;
            }
            let status = match err.downcast_ref::<EngineError>() {
                Some(EngineError::Protocol(parse)) => {
                    warn!(error = %parse, "bad request body");
                    self.ctx.metrics().inc_bad_request();
                    self.keep_alive = false;
                    parse.status_code()
                }
                _ => {
                    error!(error = %err, path = %self.request.path, "application error");
                    500
                }
            };
            self.error_response(status);
        }

        // The client is still waiting for permission to send the body.
        if self.continue_pending {
            self.keep_alive = false;
        }

        if let Err(err) = self.finish().await {
            debug!(error = %err, "failed to complete response");
            self.fire_completed();
            return false;
        }
        self.fire_completed();

        if !self.keep_alive {
            return false;
        }
        if !self.body.is_complete() {
            if let Err(err) = self.drain_body().await {
                debug!(error = %err, "failed to drain request body");
                return false;
            }
        }
        self.keep_alive
    }

    fn error_response(&mut self, status: u16) {
        self.response.reset();
        self.response.status = status;
    }

    /// Produce the head if the application never wrote, terminate the body,
    /// and flush.
    async fn finish(&mut self) -> EngineResult<()> {
        if !self.has_started() {
            if let Err(err) = self.produce_start(true) {
                error!(error = %err, "on_starting callback failed");
                self.error_response(500);
                self.produce_start(true)?;
            }
        }
        match self.framing {
            Framing::Chunked => self.output.extend_from_slice(&self.pool, LAST_CHUNK),
            Framing::Length(missing) if missing > 0 => {
                warn!(missing, "response body shorter than its Content-Length");
                self.keep_alive = false;
            }
            Framing::UntilClose => self.keep_alive = false,
            _ => {}
        }
        self.flush_output().await?;
        Ok(())
    }

    /// Freeze status and headers and serialize the response head.
    ///
    /// `complete` means the application has finished without writing a body.
    fn produce_start(&mut self, complete: bool) -> EngineResult<()> {
        if self.has_started() {
            return Ok(());
        }
        while let Some(hook) = self.on_starting.pop() {
            hook(&mut self.response).map_err(EngineError::Application)?;
        }

        if self.draining() || self.response.headers.has_token("connection", "close") {
            self.keep_alive = false;
        }

        let version = self.request.version;
        let bodiless = self.request.is_head() || !status_can_have_body(self.response.status);
        let headers = &mut self.response.headers;

        self.framing = if bodiless {
            Framing::Suppressed
        } else if let Some(len) = headers.get("content-length") {
            match len.trim().parse::<u64>() {
                Ok(n) => Framing::Length(n),
                Err(_) => {
                    warn!(value = len, "unparseable response Content-Length");
                    Framing::UntilClose
                }
            }
        } else if headers.contains("transfer-encoding") {
            if last_coding_is_chunked(headers) {
                Framing::Chunked
            } else {
                Framing::UntilClose
            }
        } else if complete {
            headers.insert("Content-Length", "0");
            Framing::Length(0)
        } else if version == Version::HTTP_11 {
            headers.insert("Transfer-Encoding", "chunked");
            Framing::Chunked
        } else {
            Framing::UntilClose
        };
        if self.framing == Framing::UntilClose {
            self.keep_alive = false;
        }

        let headers = &mut self.response.headers;
        if self.keep_alive {
            if version == Version::HTTP_10 && !headers.has_token("connection", "keep-alive") {
                headers.append("Connection", "keep-alive");
            }
        } else if version == Version::HTTP_11 && !headers.has_token("connection", "close") {
            headers.append("Connection", "close");
        }

        self.add_engine_headers();
        self.write_head();
        Ok(())
    }

    fn add_engine_headers(&mut self) {
        let headers = &mut self.response.headers;
        if !headers.contains("date") {
            headers.insert("Date", &*self.ctx.date_cache().current());
        }
        if self.ctx.add_server_header() && !headers.contains("server") {
            headers.insert("Server", SERVER_NAME);
        }
    }

    fn write_head(&mut self) {
        let pool = &*self.pool;
        let out = &mut self.output;
        let mut status = itoa::Buffer::new();

        let reason = self.response.reason_phrase();
        let reason = if is_field_safe(reason) {
            reason
        } else {
            crate::http::reason_phrase(self.response.status)
        };

        out.extend_from_slice(pool, b"HTTP/1.1 ");
        out.extend_from_slice(pool, status.format(self.response.status).as_bytes());
        out.extend_from_slice(pool, b" ");
        out.extend_from_slice(pool, reason.as_bytes());
        out.extend_from_slice(pool, b"\r\n");

        for (name, value) in self.response.headers.pairs() {
            if name.is_empty() || !is_field_safe(name) || !is_field_safe(value) {
                warn!(header = name, "dropping response header containing CR or LF");
                continue;
            }
            out.extend_from_slice(pool, name.as_bytes());
            out.extend_from_slice(pool, b": ");
            out.extend_from_slice(pool, value.as_bytes());
            out.extend_from_slice(pool, b"\r\n");
        }
        out.extend_from_slice(pool, b"\r\n");
    }

    async fn write_body(&mut self, data: &[u8]) -> EngineResult<()> {
        self.produce_start(false)?;

        match self.framing {
            Framing::Pending | Framing::Suppressed => {}
            Framing::Length(remaining) => {
                let len = data.len() as u64;
                if len > remaining {
                    self.keep_alive = false;
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "response body longer than its Content-Length",
                    )
                    .into());
                }
                self.framing = Framing::Length(remaining - len);
                self.output.extend_from_slice(&self.pool, data);
            }
            Framing::Chunked if data.is_empty() => {}
            Framing::Chunked => {
                let (line, n) = chunk_size_line(data.len());
                self.output.extend_from_slice(&self.pool, &line[..n]);
                self.output.extend_from_slice(&self.pool, data);
                self.output.extend_from_slice(&self.pool, b"\r\n");
            }
            Framing::UntilClose => self.output.extend_from_slice(&self.pool, data),
        }

        if self.output.len() >= self.pool.block_size() {
            self.flush_output().await?;
        }
        Ok(())
    }

    async fn flush_output(&mut self) -> io::Result<()> {
        let Some(io) = self.io.as_mut() else {
            return Err(io::ErrorKind::NotConnected.into());
        };
        if !self.output.is_empty() {
            let n = self.output.write_to(&self.pool, io).await?;
            self.ctx.metrics().add_bytes(n);
        }
        io.flush().await
    }

    async fn read_body(&mut self, buf: &mut [u8]) -> EngineResult<usize> {
        if buf.is_empty() || self.body.is_complete() {
            return Ok(0);
        }
        if self.continue_pending {
            self.continue_pending = false;
            if !self.has_started() {
                trace!("sending 100 Continue");
                self.output.extend_from_slice(&self.pool, CONTINUE);
                self.flush_output().await?;
            }
        }
        self.read_body_raw(buf).await
    }

    async fn read_body_raw(&mut self, buf: &mut [u8]) -> EngineResult<usize> {
        loop {
            match self.body.decode(&mut self.input, &self.pool, buf) {
                Ok(Decoded::Data(n)) => return Ok(n),
                Ok(Decoded::Done) => return Ok(0),
                Ok(Decoded::NeedMore) => {}
                Err(err) => {
                    self.keep_alive = false;
                    return Err(err.into());
                }
            }

            let Some(io) = self.io.as_mut() else {
                return Err(EngineError::Io(io::ErrorKind::NotConnected.into()));
            };
            match fill(io, &mut self.input, &self.pool).await {
                Ok(0) => {
                    self.keep_alive = false;
                    return Err(ParseError::UnexpectedEof.into());
                }
                Ok(_) => {}
                Err(err) => {
                    self.keep_alive = false;
                    return Err(err.into());
                }
            }
        }
    }

    async fn drain_body(&mut self) -> EngineResult<()> {
        let mut scratch = [0u8; 1024];
        while self.read_body_raw(&mut scratch).await? > 0 {}
        Ok(())
    }

    async fn upgrade(&mut self) -> EngineResult<Upgraded> {
        if self.has_started() {
            return Err(EngineError::ResponseStarted);
        }
        while let Some(hook) = self.on_starting.pop() {
            hook(&mut self.response).map_err(EngineError::Application)?;
        }

        self.upgraded = true;
        self.keep_alive = false;
        self.continue_pending = false;
        self.framing = Framing::UntilClose;
        self.response.status = 101;
        self.response.reason = None;
        self.response.headers.insert("Connection", "Upgrade");
        self.add_engine_headers();
        self.write_head();
        self.flush_output().await?;

        let mut prefix = Vec::with_capacity(self.input.len());
        self.input.copy_prefix(self.input.len(), &mut prefix);
        self.input.release(&self.pool);

        let io = self.io.take().ok_or(EngineError::Io(io::ErrorKind::NotConnected.into()))?;
        debug!(buffered = prefix.len(), "connection upgraded");
        Ok(Upgraded::new(Bytes::from(prefix), io))
    }

    fn fire_completed(&mut self) {
        while let Some(hook) = self.on_completed.pop() {
            if let Err(err) = hook() {
                warn!(error = %err, "on_completed callback failed");
                self.keep_alive = false;
            }
        }
    }

    /// Answer a request that could not be parsed, then give up on the connection.
    async fn reject(&mut self, err: EngineError) {
        match err {
            EngineError::Protocol(ParseError::UnexpectedEof) => {
                debug!("peer closed mid-request");
            }
            EngineError::Protocol(parse) => {
                warn!(error = %parse, peer = %self.info.peer, "bad request");
                self.ctx.metrics().inc_bad_request();
                if self.has_started() {
                    return;
                }
                self.keep_alive = false;
                self.on_starting.clear();
                self.error_response(parse.status_code());
                if self.produce_start(true).is_ok() {
                    if let Err(e) = self.flush_output().await {
                        debug!(error = %e, "failed to send error response");
                    }
                }
            }
            err => debug!(error = %err, "connection error"),
        }
    }

    async fn close(mut self) {
        if let Some(mut io) = self.io.take() {
            if let Err(e) = io.shutdown().await {
                trace!(error = %e, "shutdown failed");
            }
        }
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        self.input.release(&self.pool);
        self.output.release(&self.pool);
    }
}

async fn fill(io: &mut BoxedStream, input: &mut BlockChain, pool: &MemoryPool) -> io::Result<usize> {
    let buf = input.reserve(pool);
    let n = io.read(buf).await?;
    input.commit(n);
    Ok(n)
}

#[cfg(feature = "catch-panic")]
async fn invoke(app: &dyn Application, exchange: &mut Exchange<'_>) -> Result<(), BoxError> {
    use futures::FutureExt;

    match std::panic::AssertUnwindSafe(app.call(exchange)).catch_unwind().await {
        Ok(res) => res,
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(format!("application panicked: {msg}").into())
        }
    }
}

#[cfg(not(feature = "catch-panic"))]
async fn invoke(app: &dyn Application, exchange: &mut Exchange<'_>) -> Result<(), BoxError> {
    app.call(exchange).await
}

fn last_coding_is_chunked(headers: &Headers) -> bool {
    headers
        .get_all("transfer-encoding")
        .iter()
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .last()
        .is_some_and(|t| t.eq_ignore_ascii_case("chunked"))
}

#[inline]
fn is_field_safe(s: &str) -> bool {
    !s.bytes().any(|b| b == b'\r' || b == b'\n')
}

/// Hex chunk-size line: `<len>\r\n`.
fn chunk_size_line(len: usize) -> ([u8; 18], usize) {
    let mut line = [0u8; 18];
    let digits = ((usize::BITS - len.leading_zeros()).div_ceil(4) as usize).max(1);
    for (i, slot) in line[..digits].iter_mut().enumerate() {
        let shift = 4 * (digits - 1 - i);
        *slot = HEX[(len >> shift) & 0xF];
    }
    line[digits] = b'\r';
    line[digits + 1] = b'\n';
    (line, digits + 2)
}

/// One request/response pair, as seen by the application.
///
/// Status, reason and headers are mutable until the first body byte is
/// written or [`flush`](Self::flush) is called; after that the head is on its
/// way to the wire and mutators return [`EngineError::ResponseStarted`].
pub struct Exchange<'a> {
    frame: &'a mut Frame,
}

impl Exchange<'_> {
    pub fn method(&self) -> &Method {
        &self.frame.request.method
    }

    /// Percent-decoded request path.
    pub fn path(&self) -> &str {
        &self.frame.request.path
    }

    pub fn raw_target(&self) -> &str {
        &self.frame.request.raw_target
    }

    pub fn query(&self) -> Option<&str> {
        self.frame.request.query.as_deref()
    }

    pub fn version(&self) -> Version {
        self.frame.request.version
    }

    pub fn request(&self) -> &RequestHead {
        &self.frame.request
    }

    pub fn request_headers(&self) -> &Headers {
        &self.frame.request.headers
    }

    pub fn connection(&self) -> &ConnectionInfo {
        &self.frame.info
    }

    pub fn lifetime(&self) -> &Lifetime {
        self.frame.ctx.lifetime()
    }

    /// Read decoded request body bytes; `Ok(0)` at the end of the body.
    ///
    /// The first read of an `Expect: 100-continue` request sends the interim
    /// `100 Continue` response.
    pub async fn read_body(&mut self, buf: &mut [u8]) -> EngineResult<usize> {
        self.frame.read_body(buf).await
    }

    pub async fn read_to_end(&mut self) -> EngineResult<Vec<u8>> {
        let mut body = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = self.read_body(&mut buf).await?;
            if n == 0 {
                return Ok(body);
            }
            body.extend_from_slice(&buf[..n]);
        }
    }

    pub fn status(&self) -> u16 {
        self.frame.response.status
    }

    pub fn set_status(&mut self, status: u16) -> EngineResult<()> {
        if self.frame.has_started() {
            return Err(EngineError::ResponseStarted);
        }
        if !(100..=999).contains(&status) {
            return Err(EngineError::Usage("status code must be a three-digit number"));
        }
        self.frame.response.status = status;
        Ok(())
    }

    pub fn reason(&self) -> &str {
        self.frame.response.reason_phrase()
    }

    pub fn set_reason(&mut self, reason: impl Into<String>) -> EngineResult<()> {
        if self.frame.has_started() {
            return Err(EngineError::ResponseStarted);
        }
        self.frame.response.reason = Some(reason.into());
        Ok(())
    }

    pub fn response_headers(&self) -> &Headers {
        &self.frame.response.headers
    }

    pub fn response_headers_mut(&mut self) -> EngineResult<&mut Headers> {
        if self.frame.has_started() {
            return Err(EngineError::ResponseStarted);
        }
        Ok(&mut self.frame.response.headers)
    }

    pub fn has_started(&self) -> bool {
        self.frame.has_started()
    }

    /// Append to the response body, producing the head first if needed.
    pub async fn write(&mut self, data: &[u8]) -> EngineResult<()> {
        self.frame.write_body(data).await
    }

    /// Start the response if it has not started and push buffered bytes out.
    pub async fn flush(&mut self) -> EngineResult<()> {
        self.frame.produce_start(false)?;
        self.frame.flush_output().await?;
        Ok(())
    }

    /// Run `hook` just before the response head is serialized.
    /// Hooks run last-registered first.
    pub fn on_starting<F>(&mut self, hook: F) -> EngineResult<()>
    where
        F: FnOnce(&mut ResponseHead) -> Result<(), BoxError> + 'static,
    {
        if self.frame.has_started() {
            return Err(EngineError::ResponseStarted);
        }
        self.frame.on_starting.push(Box::new(hook));
        Ok(())
    }

    /// Run `hook` once the response has been fully sent.
    /// Hooks run last-registered first.
    pub fn on_completed<F>(&mut self, hook: F)
    where
        F: FnOnce() -> Result<(), BoxError> + 'static,
    {
        self.frame.on_completed.push(Box::new(hook));
    }

    /// Send `101 Switching Protocols` and take over the raw stream.
    ///
    /// Headers set so far (e.g. `Upgrade`) go out with the 101. The
    /// connection stops being HTTP once this returns.
    pub async fn upgrade(&mut self) -> EngineResult<Upgraded> {
        self.frame.upgrade().await
    }
}
