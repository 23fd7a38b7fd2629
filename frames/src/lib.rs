//! Wire codecs for the utalk realtime channel.
//!
//! Two layers live here, both pure and free of I/O:
//!
//! - [`envelope`]: the `SockJS` style outer framing (`o`, `h`, `a[...]`,
//!   `c[...]`) that multiplexes open/heartbeat/message/close signals over a
//!   single byte stream and survives arbitrary chunking.
//! - [`stomp`]: the inner STOMP command/header/body frames used to
//!   authenticate, subscribe and publish.
//!
//! The transport layer feeds raw chunks into [`envelope::parse`], hands each
//! message payload to [`stomp::decode`], and wraps outbound STOMP frames with
//! [`envelope::wrap`].

pub mod envelope;
pub mod stomp;

pub use envelope::{CloseReason, EnvelopeFrame, FramingError, Parsed};
pub use stomp::{Body, Headers, StompError, StompFrame};
