//! Streaming relay of upstream responses
//!
//! The upstream body is decoded into whole UTF-8 characters and handed to
//! hyper one unit per frame, so clients see output as it arrives and no
//! frame boundary ever splits a multi-byte character.
//!
//! Failure handling is best effort. The first unit is read before the
//! response head is returned, so an upstream read error at that point still
//! becomes a 500. Once the head is committed, a later read error can only
//! abort the body and the client sees a truncated stream.

use std::collections::VecDeque;
use std::ops::Range;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use hyper::{HeaderMap, Response, StatusCode};
use tracing::{debug, warn};

use crate::config::FlushGranularity;
use crate::error::{GatewayError, Result};
use crate::proxy::cancel::Cancellation;

/// Body type for every response the gateway writes
pub type RelayBody = UnsyncBoxBody<Bytes, GatewayError>;

/// Upstream body as a stream of raw chunks
pub type UpstreamStream = BoxStream<'static, Result<Bytes>>;

/// Incremental UTF-8 splitter
///
/// Holds back at most three bytes of an incomplete trailing sequence between
/// reads. Bytes that can never start a valid sequence are passed through
/// unchanged so binary payloads survive.
#[derive(Debug)]
pub struct Utf8Units {
    carry: Vec<u8>,
    granularity: FlushGranularity,
}

impl Utf8Units {
    pub fn new(granularity: FlushGranularity) -> Self {
        Self {
            carry: Vec::new(),
            granularity,
        }
    }

    /// Feed one upstream chunk, returning the units now complete
    pub fn push(&mut self, chunk: Bytes) -> Vec<Bytes> {
        let buf = if self.carry.is_empty() {
            chunk
        } else {
            let mut joined = std::mem::take(&mut self.carry);
            joined.extend_from_slice(&chunk);
            Bytes::from(joined)
        };

        let mut ranges = Vec::new();
        let consumed = unit_ranges(&buf, &mut ranges);
        self.carry = buf[consumed..].to_vec();

        match self.granularity {
            FlushGranularity::Char => ranges.into_iter().map(|r| buf.slice(r)).collect(),
            FlushGranularity::Chunk if consumed > 0 => vec![buf.slice(..consumed)],
            FlushGranularity::Chunk => Vec::new(),
        }
    }

    /// Flush whatever is held back at end of stream
    pub fn finish(&mut self) -> Option<Bytes> {
        if self.carry.is_empty() {
            None
        } else {
            Some(Bytes::from(std::mem::take(&mut self.carry)))
        }
    }
}

/// Split `buf` into character (or invalid-byte) ranges. Returns how many
/// leading bytes were covered; the rest is an incomplete sequence.
fn unit_ranges(buf: &[u8], out: &mut Vec<Range<usize>>) -> usize {
    let mut offset = 0;
    loop {
        let (valid_len, invalid) = match std::str::from_utf8(&buf[offset..]) {
            Ok(_) => (buf.len() - offset, None),
            Err(e) => (e.valid_up_to(), Some(e.error_len())),
        };

        if let Ok(text) = std::str::from_utf8(&buf[offset..offset + valid_len]) {
            out.extend(
                text.char_indices()
                    .map(|(i, c)| offset + i..offset + i + c.len_utf8()),
            );
        }
        offset += valid_len;

        match invalid {
            Some(Some(len)) => {
                out.push(offset..offset + len);
                offset += len;
            }
            None | Some(None) => return offset,
        }
    }
}

/// Pulls decoded units out of the upstream body
struct UnitReader {
    upstream: UpstreamStream,
    units: Utf8Units,
    pending: VecDeque<Bytes>,
    idle_timeout: Duration,
    finished: bool,
}

impl UnitReader {
    async fn next_unit(&mut self) -> Option<Result<Bytes>> {
        loop {
            if let Some(unit) = self.pending.pop_front() {
                return Some(Ok(unit));
            }
            if self.finished {
                return None;
            }

            match tokio::time::timeout(self.idle_timeout, self.upstream.next()).await {
                Ok(Some(Ok(chunk))) => self.pending.extend(self.units.push(chunk)),
                Ok(None) => {
                    self.finished = true;
                    self.pending.extend(self.units.finish());
                }
                Ok(Some(Err(e))) => {
                    self.finished = true;
                    return Some(Err(e));
                }
                Err(_) => {
                    self.finished = true;
                    return Some(Err(GatewayError::IdleTimeout));
                }
            }
        }
    }
}

/// Copies upstream status, headers and body to the client
#[derive(Debug, Clone)]
pub struct StreamingRelay {
    idle_timeout: Duration,
    granularity: FlushGranularity,
}

impl StreamingRelay {
    pub fn new(idle_timeout: Duration, granularity: FlushGranularity) -> Self {
        Self {
            idle_timeout,
            granularity,
        }
    }

    /// Build the client response. Errors are only returned while nothing has
    /// been committed; afterwards they end the body stream.
    pub async fn relay(
        &self,
        status: StatusCode,
        headers: HeaderMap,
        upstream: UpstreamStream,
        cancel: Cancellation,
    ) -> Result<Response<RelayBody>> {
        let mut reader = UnitReader {
            upstream,
            units: Utf8Units::new(self.granularity),
            pending: VecDeque::new(),
            idle_timeout: self.idle_timeout,
            finished: false,
        };

        let first = tokio::select! {
            first = reader.next_unit() => first,
            _ = cancel.clone().cancelled() => return Err(GatewayError::ClientDisconnected),
        };
        match first {
            Some(Ok(unit)) => reader.pending.push_front(unit),
            Some(Err(e)) => {
                warn!(error = %e, "Upstream body failed before any output");
                return Err(e);
            }
            None => {}
        }

        let frames = stream::unfold(reader, |mut reader| async move {
            let item = reader.next_unit().await?;
            if let Err(e) = &item {
                warn!(error = %e, "Upstream body failed mid-stream, truncating response");
            }
            Some((item.map(Frame::data), reader))
        })
        .take_until(async move {
            cancel.cancelled().await;
            debug!("Client went away, releasing upstream body");
        });

        let mut response = Response::new(StreamBody::new(frames).boxed_unsync());
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}
