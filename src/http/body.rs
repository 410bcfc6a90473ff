//! Channel-backed message bodies.
//!
//! A `ChannelBody` is either complete up front or fed frame by frame from an
//! mpsc channel. Dropping the sender ends the body; sending an `Err` aborts it.
//! An abortable body can also be failed through a [`BodyAbort`], which
//! needs no channel capacity and overtakes frames still buffered.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use http_body::{Body, Frame, SizeHint};
use tokio::sync::{mpsc, oneshot};

/// Sender half feeding a streaming [`ChannelBody`].
pub type BodySender = mpsc::Sender<Result<Frame<Bytes>, io::Error>>;

/// Fails an abortable [`ChannelBody`] on its next poll.
pub type BodyAbort = oneshot::Sender<io::Error>;

/// Frames buffered between producer and body before the producer waits.
pub const BODY_CHANNEL_CAPACITY: usize = 8;

/// A body that is either known in full or streamed through a channel.
#[derive(Debug)]
pub enum ChannelBody {
    Full(Option<Bytes>),
    Streaming {
        rx: mpsc::Receiver<Result<Frame<Bytes>, io::Error>>,
        abort: Option<oneshot::Receiver<io::Error>>,
    },
}

impl ChannelBody {
    pub fn full(bytes: Bytes) -> Self {
        ChannelBody::Full(Some(bytes).filter(|b| !b.is_empty()))
    }

    pub fn empty() -> Self {
        ChannelBody::Full(None)
    }

    /// A streaming body and the sender that feeds it.
    pub fn channel() -> (BodySender, Self) {
        let (tx, rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
        (tx, ChannelBody::Streaming { rx, abort: None })
    }

    /// A streaming body, its sender, and a handle that fails it even while
    /// the channel is full.
    pub fn abortable_channel() -> (BodySender, BodyAbort, Self) {
        let (tx, rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
        let (abort_tx, abort_rx) = oneshot::channel();
        let body = ChannelBody::Streaming {
            rx,
            abort: Some(abort_rx),
        };
        (tx, abort_tx, body)
    }
}

impl Body for ChannelBody {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match self.get_mut() {
            ChannelBody::Full(bytes) => Poll::Ready(bytes.take().map(|b| Ok(Frame::data(b)))),
            ChannelBody::Streaming { rx, abort } => {
                if let Some(signal) = abort.as_mut() {
                    let polled = Pin::new(signal).poll(cx);
                    match polled {
                        Poll::Ready(Ok(error)) => {
                            *abort = None;
                            rx.close();
                            return Poll::Ready(Some(Err(error)));
                        }
                        // Handle dropped without aborting.
                        Poll::Ready(Err(_)) => *abort = None,
                        Poll::Pending => {}
                    }
                }
                rx.poll_recv(cx)
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        matches!(self, ChannelBody::Full(None))
    }

    fn size_hint(&self) -> SizeHint {
        match self {
            ChannelBody::Full(Some(bytes)) => SizeHint::with_exact(bytes.len() as u64),
            ChannelBody::Full(None) => SizeHint::with_exact(0),
            ChannelBody::Streaming { .. } => SizeHint::default(),
        }
    }
}
