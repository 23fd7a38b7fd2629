//! Duplex transport — one websocket carrying both directions.
//!
//! DESIGN
//! ======
//! `start` owns the socket and runs a single `select!` loop:
//! - Incoming text/binary messages → [`FrameReader`] → handler
//! - Queued [`Outbound`] frames → socket write
//!
//! Socket-level faults end the loop with a 1006 close reason; nothing is
//! raised past the caller.

use std::fmt;

use frames::CloseReason;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use super::reader::{Flow, FrameReader};
use super::{
    CLOSE_ABNORMAL, CLOSE_NORMAL, ConnectionDescriptor, Outbound, TransportError, TransportHandle,
    TransportHandler,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct DuplexTransport {
    descriptor: ConnectionDescriptor,
    handle: TransportHandle,
    outbound: Option<mpsc::UnboundedReceiver<Outbound>>,
    stream: Option<WsStream>,
}

impl fmt::Debug for DuplexTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DuplexTransport")
            .field("url", &self.descriptor.receive_url())
            .field("connected", &self.stream.is_some())
            .field("started", &self.outbound.is_none())
            .finish_non_exhaustive()
    }
}

impl DuplexTransport {
    #[must_use]
    pub fn new(descriptor: ConnectionDescriptor) -> Self {
        let (handle, outbound) = TransportHandle::pair();
        Self {
            descriptor,
            handle,
            outbound: Some(outbound),
            stream: None,
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

    /// Open the websocket.
    ///
    /// # Errors
    ///
    /// Returns the handshake error.
    pub async fn connect(&mut self) -> Result<(), TransportError> {
        let url = self.descriptor.receive_url();
        let (stream, _) = connect_async(url.as_str()).await?;
        info!(%url, "websocket connected");
        self.stream = Some(stream);
        Ok(())
    }

    /// Run the read/write loop until either side closes.
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
        let mut stream = self.stream.take().ok_or(TransportError::NotConnected)?;
        let mut outbound = self.outbound.take().ok_or(TransportError::AlreadyStarted)?;
        let mut reader = FrameReader::new(self.handle.closing_flag());

        let reason = run_loop(&mut stream, &mut outbound, &mut reader, handler).await;
        self.handle.close();

        info!(code = reason.code, reason = %reason.reason, "websocket closed");
        handler.on_close(&reason);
        Ok(())
    }
}

async fn run_loop<H: TransportHandler + Send>(
    stream: &mut WsStream,
    outbound: &mut mpsc::UnboundedReceiver<Outbound>,
    reader: &mut FrameReader,
    handler: &mut H,
) -> CloseReason {
    loop {
        tokio::select! {
            incoming = stream.next() => {
                let flow = match incoming {
                    Some(Ok(Message::Text(text))) => reader.feed(text.as_bytes(), handler),
                    Some(Ok(Message::Binary(bytes))) => reader.feed(&bytes, handler),
                    Some(Ok(Message::Close(frame))) => {
                        return match frame {
                            Some(frame) => CloseReason::new(u16::from(frame.code), frame.reason.as_str()),
                            None => CloseReason::new(CLOSE_NORMAL, "closed by server"),
                        };
                    }
                    Some(Ok(_)) => Flow::Continue,
                    Some(Err(e)) => {
                        warn!(error = %e, "websocket read failed");
                        return CloseReason::new(CLOSE_ABNORMAL, e.to_string());
                    }
                    None => return CloseReason::new(CLOSE_ABNORMAL, "connection lost"),
                };
                match flow {
                    Flow::Continue => {}
                    Flow::Closed(reason) => {
                        let _ = stream.close(None).await;
                        return reason;
                    }
                    Flow::Stopped => return close_locally(stream).await,
                }
            }
            queued = outbound.recv() => match queued {
                Some(Outbound::Frame(frame)) => {
                    debug!(bytes = frame.len(), "websocket send");
                    if let Err(e) = stream.send(Message::Text(frame.into())).await {
                        warn!(error = %e, "websocket write failed");
                        return CloseReason::new(CLOSE_ABNORMAL, e.to_string());
                    }
                }
                Some(Outbound::Close) | None => return close_locally(stream).await,
            }
        }
    }
}

async fn close_locally(stream: &mut WsStream) -> CloseReason {
    // The peer may already be gone; the close reason is ours either way.
    let _ = stream.close(None).await;
    CloseReason::new(CLOSE_NORMAL, "closed by client")
}
