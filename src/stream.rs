use crate::client::ByteStream;
use crate::decoder::EventDecoder;
use crate::error::SessionResult;
use crate::protocol::Envelope;
use futures::StreamExt;
use std::collections::VecDeque;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Decoded events of one network stream, readable until the stream ends or
/// its token is cancelled.
pub struct EventStream {
    bytes: ByteStream,
    decoder: EventDecoder,
    ready: VecDeque<Envelope>,
    token: CancellationToken,
    exhausted: bool,
}

impl EventStream {
    pub fn new(bytes: ByteStream, token: CancellationToken) -> Self {
        Self {
            bytes,
            decoder: EventDecoder::new(),
            ready: VecDeque::new(),
            token,
            exhausted: false,
        }
    }

    /// Yields the next event. Returns `None` at end of stream and as soon as
    /// the token is cancelled, including when a chunk resolves after the
    /// cancellation.
    pub async fn next(&mut self) -> Option<SessionResult<Envelope>> {
        loop {
            if self.token.is_cancelled() {
                return None;
            }
            if let Some(envelope) = self.ready.pop_front() {
                return Some(Ok(envelope));
            }
            if self.exhausted {
                return None;
            }

            let chunk = tokio::select! {
                biased;
                _ = self.token.cancelled() => return None,
                chunk = self.bytes.next() => chunk,
            };
            if self.token.is_cancelled() {
                trace!("discarding chunk that resolved after cancellation");
                return None;
            }

            match chunk {
                Some(Ok(bytes)) => self.ready.extend(self.decoder.decode(&bytes)),
                Some(Err(err)) => {
                    self.exhausted = true;
                    return Some(Err(err));
                }
                None => {
                    self.exhausted = true;
                    self.ready.extend(self.decoder.finish());
                }
            }
        }
    }
}
