//! Streaming fan-out of a response body.
//!
//! One upstream feeds up to three consumers: the cache writer, the
//! optional integrity verifier, and the caller. The cache write is the
//! back-pressure authority: each chunk is written and flushed to the
//! sink before it is handed to the caller, so the cache can never lose
//! bytes the caller has observed. An error on any branch terminates all
//! of them with the same error. The whole pipeline is lazy; until the
//! caller polls the body, neither the upstream nor the sink does any
//! work.

use async_trait::async_trait;
use futures::StreamExt;

use crate::base::error::FetchError;
use crate::cache::integrity::IntegrityVerifier;
use crate::http::response::ResponseBody;

/// Destination for teed body bytes.
///
/// Implementations buffer or stream as they see fit; `commit` runs after
/// the final chunk and makes the entry visible. Dropping a sink without
/// committing must discard any partial state.
#[async_trait(?Send)]
pub(crate) trait EntrySink: Send {
    /// Persist one chunk. Must not return before the chunk is accepted
    /// durably enough that a subsequent `commit` will include it.
    async fn write(&mut self, chunk: &[u8]) -> Result<(), FetchError>;

    /// Finalize the entry. `verified` carries the digest reported by the
    /// integrity verifier, when one ran.
    async fn commit(self: Box<Self>, verified: Option<String>) -> Result<(), FetchError>;
}

struct TeeState {
    upstream: ResponseBody,
    sink: Option<Box<dyn EntrySink>>,
    verifier: Option<IntegrityVerifier>,
    done: bool,
}

/// Wrap `upstream` so that reading it also feeds `sink` and `verifier`.
pub(crate) fn tee_body(
    upstream: ResponseBody,
    sink: Option<Box<dyn EntrySink>>,
    verifier: Option<IntegrityVerifier>,
) -> ResponseBody {
    let state = TeeState {
        upstream,
        sink,
        verifier,
        done: false,
    };

    ResponseBody::stream(futures::stream::unfold(state, |mut state| async move {
        if state.done {
            return None;
        }
        match state.upstream.next().await {
            Some(Ok(chunk)) => {
                if let Some(sink) = state.sink.as_mut() {
                    if let Err(err) = sink.write(&chunk).await {
                        state.done = true;
                        state.sink = None;
                        return Some((Err(err), state));
                    }
                }
                if let Some(verifier) = state.verifier.as_mut() {
                    verifier.update(&chunk);
                }
                Some((Ok(chunk), state))
            }
            Some(Err(err)) => {
                // Upstream failed: the partial cache write is abandoned
                // (dropping the sink discards it) and the caller sees the
                // same error.
                state.done = true;
                state.sink = None;
                Some((Err(err), state))
            }
            None => {
                state.done = true;
                let verified = match state.verifier.take() {
                    Some(verifier) => match verifier.finalize() {
                        Ok(digest) => Some(digest),
                        Err(err) => {
                            state.sink = None;
                            return Some((Err(err), state));
                        }
                    },
                    None => None,
                };
                if let Some(sink) = state.sink.take() {
                    if let Err(err) = sink.commit(verified).await {
                        return Some((Err(err), state));
                    }
                }
                None
            }
        }
    }))
}
