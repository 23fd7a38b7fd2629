//! Pending-buffer discipline shared by both transport variants.
//!
//! Every raw chunk is appended to the pending bytes, the whole buffer is run
//! through [`envelope::parse`], the unconsumed tail becomes the new pending
//! buffer, and each complete frame goes to the handler in arrival order.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use frames::envelope::{self, EnvelopeFrame};
use frames::CloseReason;

use super::TransportHandler;

/// What the delivery loop should do after a chunk was fed.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    /// The server sent a close frame. `on_close` has not been called yet.
    Closed(CloseReason),
    /// A local close was requested while dispatching.
    Stopped,
}

#[derive(Debug)]
pub(crate) struct FrameReader {
    pending: Vec<u8>,
    closing: Arc<AtomicBool>,
}

impl FrameReader {
    pub(crate) fn new(closing: Arc<AtomicBool>) -> Self {
        Self {
            pending: Vec::new(),
            closing,
        }
    }

    /// Feed one raw chunk and dispatch every complete frame it finishes.
    ///
    /// Close frames are returned rather than dispatched so the transport can
    /// fire `on_close` exactly once, after its own teardown.
    pub(crate) fn feed<H: TransportHandler + ?Sized>(&mut self, chunk: &[u8], handler: &mut H) -> Flow {
        if self.is_closing() {
            return Flow::Stopped;
        }

        self.pending.extend_from_slice(chunk);
        let parsed = envelope::parse(&self.pending);

        for error in &parsed.errors {
            tracing::warn!(error = %error, "skipped malformed envelope input");
        }
        self.pending = parsed.remainder;

        for frame in parsed.frames {
            if self.is_closing() {
                return Flow::Stopped;
            }
            match frame {
                EnvelopeFrame::Open => {
                    tracing::debug!("envelope open");
                    handler.on_open();
                }
                EnvelopeFrame::Heartbeat => {
                    tracing::trace!("envelope heartbeat");
                    handler.on_heartbeat();
                }
                EnvelopeFrame::Message(payload) => handler.on_message(&payload),
                EnvelopeFrame::Close(reason) => return Flow::Closed(reason),
            }
        }

        if self.is_closing() {
            Flow::Stopped
        } else {
            Flow::Continue
        }
    }

    /// Bytes still waiting for the rest of their frame.
    pub(crate) fn pending(&self) -> &[u8] {
        &self.pending
    }

    pub(crate) fn reset(&mut self) {
        self.pending.clear();
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
#[path = "reader_test.rs"]
mod tests;
