//! Outbound message kinds.
//!
//! Both directions of a proxied call move the same four kinds of message:
//! a full message, a headers-only first chunk, a content chunk, and the
//! terminal content chunk. `H` is the head type (`RequestHead` downstream,
//! `ResponseHead` upstream).

use axum::http::{HeaderMap, Method, StatusCode, Uri, Version};
use bytes::Bytes;

/// Method, target and headers of a request.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
}

/// Status and headers of a response.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
}

impl ResponseHead {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
        }
    }
}

/// One message written towards a peer.
#[derive(Debug)]
pub enum OutboundMessage<H> {
    /// Head and complete body in one message.
    Full { head: H, body: Bytes },
    /// Head only; the body follows as content chunks.
    Headers(H),
    /// A body fragment.
    Content(Bytes),
    /// The final body fragment, possibly empty, with optional trailers.
    LastContent { body: Bytes, trailers: Option<HeaderMap> },
}

impl<H> OutboundMessage<H> {
    /// An empty terminal chunk.
    pub fn last() -> Self {
        OutboundMessage::LastContent {
            body: Bytes::new(),
            trailers: None,
        }
    }

    /// True if nothing may follow this message.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OutboundMessage::Full { .. } | OutboundMessage::LastContent { .. })
    }

    /// True for a terminal chunk that carries no data and no trailers.
    pub fn is_empty_terminal(&self) -> bool {
        match self {
            OutboundMessage::LastContent { body, trailers } => {
                body.is_empty() && trailers.as_ref().map_or(true, HeaderMap::is_empty)
            }
            _ => false,
        }
    }

    /// Number of body bytes carried.
    pub fn body_len(&self) -> usize {
        match self {
            OutboundMessage::Full { body, .. }
            | OutboundMessage::Content(body)
            | OutboundMessage::LastContent { body, .. } => body.len(),
            OutboundMessage::Headers(_) => 0,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::Full { .. } => "full",
            OutboundMessage::Headers(_) => "headers",
            OutboundMessage::Content(_) => "content",
            OutboundMessage::LastContent { .. } => "last_content",
        }
    }
}
