// src/body.rs
//! Request body framing.
//!
//! The frame owns the socket; this module only turns bytes already sitting in
//! the input chain into body bytes and says when it needs more.

use crate::chain::BlockChain;
use crate::error::ParseError;
use crate::http::RequestHead;
use crate::pool::MemoryPool;

/// How the request body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    None,
    ContentLength(u64),
    Chunked,
}

/// Outcome of one decode step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoded {
    /// `n` body bytes were copied out.
    Data(usize),
    /// The chain ran dry before the body ended.
    NeedMore,
    /// The body is complete.
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Chunk {
    Size { value: u64, digits: u32 },
    Extension { size: u64 },
    SizeLf { size: u64 },
    Data { remaining: u64 },
    DataCr,
    DataLf,
    TrailerStart,
    Trailer,
    TrailerLf,
    FinalLf,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Length { remaining: u64 },
    Chunked(Chunk),
    Complete,
}

#[derive(Debug, Clone)]
pub struct RequestBody {
    framing: BodyFraming,
    state: State,
}

impl Default for RequestBody {
    fn default() -> Self {
        Self::empty()
    }
}

impl RequestBody {
    pub fn empty() -> Self {
        Self {
            framing: BodyFraming::None,
            state: State::Complete,
        }
    }

    pub fn new(framing: BodyFraming) -> Self {
        let state = match framing {
            BodyFraming::None | BodyFraming::ContentLength(0) => State::Complete,
            BodyFraming::ContentLength(n) => State::Length { remaining: n },
            BodyFraming::Chunked => State::Chunked(Chunk::Size { value: 0, digits: 0 }),
        };
        Self { framing, state }
    }

    /// Pick the framing announced by the request head.
    ///
    /// Upgrade requests carry no HTTP body: whatever follows the head belongs
    /// to the upgraded protocol. One that announces a payload anyway is
    /// rejected.
    pub fn for_request(head: &RequestHead) -> Result<Self, ParseError> {
        let body = Self::announced(head)?;
        if !head.is_upgrade() {
            return Ok(body);
        }
        match body.framing {
            BodyFraming::None | BodyFraming::ContentLength(0) => Ok(Self::empty()),
            _ => Err(ParseError::UpgradeWithBody),
        }
    }

    fn announced(head: &RequestHead) -> Result<Self, ParseError> {
        let te = head.headers.get_all("transfer-encoding");
        let cl = head.headers.get_all("content-length");

        if !te.is_empty() {
            if !cl.is_empty() {
                return Err(ParseError::InvalidHeader);
            }
            let last = te
                .iter()
                .flat_map(|v| v.split(','))
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .last();
            return match last {
                Some(coding) if coding.eq_ignore_ascii_case("chunked") => {
                    Ok(Self::new(BodyFraming::Chunked))
                }
                _ => Err(ParseError::UnsupportedTransferEncoding),
            };
        }

        let mut length = None;
        for token in cl.iter().flat_map(|v| v.split(',')).map(str::trim) {
            if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
                return Err(ParseError::InvalidContentLength);
            }
            let n: u64 = token.parse().map_err(|_| ParseError::InvalidContentLength)?;
            match length {
                Some(prev) if prev != n => return Err(ParseError::InvalidContentLength),
                _ => length = Some(n),
            }
        }

        Ok(match length {
            Some(n) => Self::new(BodyFraming::ContentLength(n)),
            None => Self::empty(),
        })
    }

    pub fn framing(&self) -> BodyFraming {
        self.framing
    }

    pub fn is_complete(&self) -> bool {
        self.state == State::Complete
    }

    /// Decode from `input` into `out`.
    pub fn decode(
        &mut self,
        input: &mut BlockChain,
        pool: &MemoryPool,
        out: &mut [u8],
    ) -> Result<Decoded, ParseError> {
        match &mut self.state {
            State::Complete => Ok(Decoded::Done),
            State::Length { remaining } => {
                if input.is_empty() {
                    return Ok(Decoded::NeedMore);
                }
                let want = clamp(out.len(), *remaining);
                let n = input.read_into(pool, &mut out[..want]);
                *remaining -= n as u64;
                if *remaining == 0 {
                    self.state = State::Complete;
                }
                Ok(Decoded::Data(n))
            }
            State::Chunked(chunk) => {
                let res = decode_chunked(chunk, input, pool, out);
                if *chunk == Chunk::Done {
                    self.state = State::Complete;
                }
                res
            }
        }
    }
}

fn clamp(len: usize, remaining: u64) -> usize {
    usize::try_from(remaining).map_or(len, |r| r.min(len))
}

fn decode_chunked(
    state: &mut Chunk,
    input: &mut BlockChain,
    pool: &MemoryPool,
    out: &mut [u8],
) -> Result<Decoded, ParseError> {
    loop {
        if let Chunk::Data { remaining } = state {
            if input.is_empty() {
                return Ok(Decoded::NeedMore);
            }
            let want = clamp(out.len(), *remaining);
            let n = input.read_into(pool, &mut out[..want]);
            *remaining -= n as u64;
            if *remaining == 0 {
                *state = Chunk::DataCr;
            }
            return Ok(Decoded::Data(n));
        }
        if *state == Chunk::Done {
            return Ok(Decoded::Done);
        }

        let Some(b) = input.get(0) else {
            return Ok(Decoded::NeedMore);
        };
        input.consume(pool, 1);

        *state = match (*state, b) {
            (Chunk::Size { value, digits }, b) if b.is_ascii_hexdigit() => {
                let digit = u64::from((b as char).to_digit(16).unwrap_or(0));
                let value = value
                    .checked_mul(16)
                    .and_then(|v| v.checked_add(digit))
                    .ok_or(ParseError::InvalidChunk)?;
                Chunk::Size {
                    value,
                    digits: digits + 1,
                }
            }
            (Chunk::Size { value, digits }, b';') if digits > 0 => Chunk::Extension { size: value },
            (Chunk::Size { value, digits }, b'\r') if digits > 0 => Chunk::SizeLf { size: value },
            (Chunk::Extension { size }, b'\r') => Chunk::SizeLf { size },
            (Chunk::Extension { .. }, b'\n') => return Err(ParseError::InvalidChunk),
            (ext @ Chunk::Extension { .. }, _) => ext,
            (Chunk::SizeLf { size: 0 }, b'\n') => Chunk::TrailerStart,
            (Chunk::SizeLf { size }, b'\n') => Chunk::Data { remaining: size },
            (Chunk::DataCr, b'\r') => Chunk::DataLf,
            (Chunk::DataLf, b'\n') => Chunk::Size { value: 0, digits: 0 },
            (Chunk::TrailerStart, b'\r') => Chunk::FinalLf,
            (Chunk::TrailerStart | Chunk::Trailer, b'\n') => return Err(ParseError::InvalidChunk),
            (Chunk::TrailerStart | Chunk::Trailer, b'\r') => Chunk::TrailerLf,
            (Chunk::TrailerStart | Chunk::Trailer, _) => Chunk::Trailer,
            (Chunk::TrailerLf, b'\n') => Chunk::TrailerStart,
            (Chunk::FinalLf, b'\n') => Chunk::Done,
            _ => return Err(ParseError::InvalidChunk),
        };
    }
}
