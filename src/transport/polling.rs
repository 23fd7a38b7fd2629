//! Polling transport — XHR receive requests plus independent send POSTs.
//!
//! DESIGN
//! ======
//! Receiving and sending never share a request:
//! - The delivery loop POSTs to the receive URL. Plain polling reads each
//!   response whole; streaming reads one long response chunk by chunk.
//! - A sender task drains the outbound queue, POSTing each wrapped frame to
//!   `xhr_send` in order. Its replies carry no frames.
//!
//! An empty poll response ends the session, as a close frame would. A close
//! request is observed at the top of the loop and also abandons the request
//! in flight.

use std::fmt;
use std::sync::Arc;

use frames::CloseReason;
use reqwest::header::CONTENT_TYPE;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, info, warn};

use super::reader::{Flow, FrameReader};
use super::{
    CLOSE_ABNORMAL, CLOSE_NORMAL, ConnectionDescriptor, Outbound, TransportError, TransportHandle,
    TransportHandler, TransportKind,
};

/// Streaming responses open with a run of `h` bytes and a newline.
const PRELUDE_BYTE: u8 = b'h';

pub struct PollingTransport {
    descriptor: ConnectionDescriptor,
    handle: TransportHandle,
    outbound: Option<mpsc::UnboundedReceiver<Outbound>>,
    http: reqwest::Client,
    first: Option<reqwest::Response>,
}

impl fmt::Debug for PollingTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollingTransport")
            .field("url", &self.descriptor.receive_url())
            .field("connected", &self.first.is_some())
            .field("started", &self.outbound.is_none())
            .finish_non_exhaustive()
    }
}

impl PollingTransport {
    #[must_use]
    pub fn new(descriptor: ConnectionDescriptor) -> Self {
        let (handle, outbound) = TransportHandle::pair();
        Self {
            descriptor,
            handle,
            outbound: Some(outbound),
            http: reqwest::Client::new(),
            first: None,
        }
    }

    #[must_use]
    pub fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    #[must_use]
    pub fn handle(&self) -> TransportHandle {
        self.handle.clone()
    }

    /// Issue the first receive request. Its body is consumed by `start`.
    ///
    /// # Errors
    ///
    /// Returns HTTP failures and non-success statuses.
    pub async fn connect(&mut self) -> Result<(), TransportError> {
        let url = self.descriptor.receive_url();
        let response = self.receive(&url).await?;
        info!(%url, kind = %self.descriptor.kind(), "xhr session opened");
        self.first = Some(response);
        Ok(())
    }

    /// Run the receive loop until the session ends.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::AlreadyStarted`] or
    /// [`TransportError::NotConnected`]; I/O faults go to `on_close`.
    pub async fn start<H: TransportHandler + Send>(
        &mut self,
        handler: &mut H,
    ) -> Result<(), TransportError> {
        if self.outbound.is_none() {
            return Err(TransportError::AlreadyStarted);
        }
        let first = self.first.take().ok_or(TransportError::NotConnected)?;
        let outbound = self.outbound.take().ok_or(TransportError::AlreadyStarted)?;
        let send_url = self
            .descriptor
            .send_url()
            .ok_or_else(|| TransportError::InvalidUrl("polling transport without send URL".into()))?;

        let stop = Arc::new(Notify::new());
        let sender = tokio::spawn(send_loop(
            self.http.clone(),
            send_url,
            outbound,
            Arc::clone(&stop),
        ));

        let mut reader = FrameReader::new(self.handle.closing_flag());
        let reason = match self.descriptor.kind() {
            TransportKind::XhrStreaming => self.stream_loop(first, &stop, &mut reader, handler).await,
            TransportKind::XhrPolling | TransportKind::Websocket => {
                self.poll_loop(first, &stop, &mut reader, handler).await
            }
        };

        self.handle.close();
        sender.abort();
        info!(code = reason.code, reason = %reason.reason, "xhr session closed");
        handler.on_close(&reason);
        Ok(())
    }

    async fn poll_loop<H: TransportHandler + Send>(
        &self,
        first: reqwest::Response,
        stop: &Notify,
        reader: &mut FrameReader,
        handler: &mut H,
    ) -> CloseReason {
        let url = self.descriptor.receive_url();
        let mut next = Some(first);

        loop {
            if self.handle.is_closing() {
                return closed_by_client();
            }
            let response = match next.take() {
                Some(response) => response,
                None => tokio::select! {
                    result = self.receive(&url) => match result {
                        Ok(response) => response,
                        Err(e) => return fault(&e),
                    },
                    () = stop.notified() => return closed_by_client(),
                },
            };

            let body = tokio::select! {
                result = response.bytes() => match result {
                    Ok(body) => body,
                    Err(e) => return fault(&TransportError::Http(e)),
                },
                () = stop.notified() => return closed_by_client(),
            };
            if body.is_empty() {
                return CloseReason::new(CLOSE_NORMAL, "session ended by server");
            }

            match reader.feed(&body, handler) {
                Flow::Continue => {}
                Flow::Closed(reason) => return reason,
                Flow::Stopped => return closed_by_client(),
            }
        }
    }

    async fn stream_loop<H: TransportHandler + Send>(
        &self,
        first: reqwest::Response,
        stop: &Notify,
        reader: &mut FrameReader,
        handler: &mut H,
    ) -> CloseReason {
        let url = self.descriptor.receive_url();
        let mut response = first;

        loop {
            let mut prelude = Prelude::default();
            let mut received = 0usize;

            loop {
                let chunk = tokio::select! {
                    result = response.chunk() => match result {
                        Ok(chunk) => chunk,
                        Err(e) => return fault(&TransportError::Http(e)),
                    },
                    () = stop.notified() => return closed_by_client(),
                };
                let Some(chunk) = chunk else { break };
                received += chunk.len();

                match reader.feed(prelude.strip(&chunk), handler) {
                    Flow::Continue => {}
                    Flow::Closed(reason) => return reason,
                    Flow::Stopped => return closed_by_client(),
                }
            }

            if received == 0 {
                return CloseReason::new(CLOSE_NORMAL, "session ended by server");
            }
            if self.handle.is_closing() {
                return closed_by_client();
            }

            // The server ends long streams periodically; reopen on the same session.
            debug!("xhr stream rolled over");
            reader.reset();
            response = tokio::select! {
                result = self.receive(&url) => match result {
                    Ok(response) => response,
                    Err(e) => return fault(&e),
                },
                () = stop.notified() => return closed_by_client(),
            };
        }
    }

    async fn receive(&self, url: &str) -> Result<reqwest::Response, TransportError> {
        let response = self.http.post(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }
        Ok(response)
    }
}

async fn send_loop(
    http: reqwest::Client,
    url: String,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    stop: Arc<Notify>,
) {
    while let Some(item) = outbound.recv().await {
        match item {
            Outbound::Frame(frame) => {
                let result = http
                    .post(&url)
                    .header(CONTENT_TYPE, "text/plain")
                    .body(frame)
                    .send()
                    .await;
                match result {
                    Ok(response) if response.status().is_success() => {
                        debug!(status = %response.status(), "xhr send");
                    }
                    Ok(response) => warn!(status = %response.status(), "xhr send rejected"),
                    Err(e) => warn!(error = %e, "xhr send failed"),
                }
            }
            Outbound::Close => break,
        }
    }
    stop.notify_one();
}

fn closed_by_client() -> CloseReason {
    CloseReason::new(CLOSE_NORMAL, "closed by client")
}

fn fault(error: &TransportError) -> CloseReason {
    warn!(error = %error, "xhr receive failed");
    CloseReason::new(CLOSE_ABNORMAL, error.to_string())
}

/// Strips the `hhhh…\n` preamble from the start of a streaming response.
#[derive(Debug, Default)]
struct Prelude {
    done: bool,
}

impl Prelude {
    fn strip<'a>(&mut self, chunk: &'a [u8]) -> &'a [u8] {
        if self.done {
            return chunk;
        }
        match chunk.iter().position(|&b| b != PRELUDE_BYTE) {
            None => &[],
            Some(at) => {
                self.done = true;
                if chunk[at] == b'\n' {
                    &chunk[at + 1..]
                } else {
                    &chunk[at..]
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "polling_test.rs"]
mod tests;
