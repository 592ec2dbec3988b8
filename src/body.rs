use std::{
    fmt, mem,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::Bytes;
use futures_core::Stream;
use http_body::Frame;
use tracing::warn;

use crate::error::{Error, Result};

/// Boxed close hook attached to a body or registered for cleanup
pub type CloseHook = Box<dyn FnOnce() -> Result<()> + Send>;

type Chunks = Box<dyn Iterator<Item = Result<Bytes>> + Send>;

/// Run `first` then `second`, returning the first failure
fn chain_hooks(first: Option<CloseHook>, second: CloseHook) -> CloseHook {
    match first {
        Some(first) => Box::new(move || {
            let a = first();
            let b = second();
            a.and(b)
        }),
        None => second,
    }
}

enum Inner {
    Chunks {
        chunks: Chunks,
        close: Option<CloseHook>,
    },
    Wrapped(Box<ResponseWrapper>),
}

/// Lazy, single-pass sequence of response chunks with an optional close hook
///
/// Iterating a `Body` never closes it; whoever owns the body is responsible
/// for calling [`Body::close`], usually by handing it to a
/// [`ResponseWrapper`] or to the cleanup registry.
pub struct Body {
    inner: Inner,
}

impl Body {
    /// Create a body from anything that yields chunk-like values
    pub fn new<I>(chunks: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Bytes>,
        I::IntoIter: Send + 'static,
    {
        Self::from_results(chunks.into_iter().map(|chunk| Ok(chunk.into())))
    }

    /// Create a body from a fallible chunk iterator
    pub fn from_results<I>(chunks: I) -> Self
    where
        I: Iterator<Item = Result<Bytes>> + Send + 'static,
    {
        Self {
            inner: Inner::Chunks {
                chunks: Box::new(chunks),
                close: None,
            },
        }
    }

    /// A body with no chunks
    pub fn empty() -> Self {
        Self::from_results(std::iter::empty())
    }

    /// Attach a close hook. An already attached hook runs first.
    pub fn with_close<F>(mut self, hook: F) -> Self
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        match &mut self.inner {
            Inner::Chunks { close, .. } => *close = Some(chain_hooks(close.take(), Box::new(hook))),
            Inner::Wrapped(wrapper) => {
                wrapper.on_close = Some(chain_hooks(wrapper.on_close.take(), Box::new(hook)))
            }
        }
        self
    }

    /// Whether a close hook is still attached
    pub fn has_close(&self) -> bool {
        match &self.inner {
            Inner::Chunks { close, .. } => close.is_some(),
            Inner::Wrapped(wrapper) => wrapper.has_close(),
        }
    }

    /// Detach the close hook so another owner can run it
    pub fn take_close(&mut self) -> Option<CloseHook> {
        match &mut self.inner {
            Inner::Chunks { close, .. } => close.take(),
            Inner::Wrapped(wrapper) => wrapper.take_close(),
        }
    }

    /// Run the close hook, if any. Later calls do nothing.
    pub fn close(&mut self) -> Result<()> {
        match &mut self.inner {
            Inner::Chunks { close, .. } => match close.take() {
                Some(close) => close(),
                None => Ok(()),
            },
            Inner::Wrapped(wrapper) => wrapper.close(),
        }
    }
}

impl Iterator for Body {
    type Item = Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.inner {
            Inner::Chunks { chunks, .. } => chunks.next(),
            Inner::Wrapped(wrapper) => wrapper.next(),
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Body")
            .field("has_close", &self.has_close())
            .finish_non_exhaustive()
    }
}

impl Default for Body {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<ResponseWrapper> for Body {
    fn from(wrapper: ResponseWrapper) -> Self {
        Self {
            inner: Inner::Wrapped(Box::new(wrapper)),
        }
    }
}

impl From<Bytes> for Body {
    fn from(chunk: Bytes) -> Self {
        Self::new([chunk])
    }
}

impl From<&'static str> for Body {
    fn from(chunk: &'static str) -> Self {
        Self::new([chunk])
    }
}

impl From<String> for Body {
    fn from(chunk: String) -> Self {
        Self::new([chunk])
    }
}

impl<T: Into<Bytes> + Send + 'static> From<Vec<T>> for Body {
    fn from(chunks: Vec<T>) -> Self {
        Self::new(chunks)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Fresh,
    Prepending,
    Draining,
    Closed,
}

/// Push-back and close-once decorator for body sequences
///
/// The wrapper yields an optional prepended chunk, then every chunk of the
/// wrapped body, and closes itself when the body is exhausted. Closing runs
/// the body's own close hook and then the extra hook given with
/// [`ResponseWrapper::on_close`], each at most once, no matter how many
/// times `close` is called. A wrapper dropped before it was closed closes
/// on drop.
///
/// ```
/// use wsgi_lite::{Body, ResponseWrapper};
///
/// let wrapper = ResponseWrapper::with_first(Body::new(["b", "c"]), "a");
/// let chunks: Vec<_> = wrapper.map(|chunk| chunk.unwrap()).collect();
/// assert_eq!(chunks, ["a", "b", "c"]);
/// ```
pub struct ResponseWrapper {
    body: Body,
    first: Option<Bytes>,
    on_close: Option<CloseHook>,
    state: State,
}

impl ResponseWrapper {
    /// Wrap a body without a prepended chunk
    pub fn new(body: Body) -> Self {
        Self {
            body,
            first: None,
            on_close: None,
            state: State::Fresh,
        }
    }

    /// Wrap a body, yielding `first` before any of its chunks
    pub fn with_first(body: Body, first: impl Into<Bytes>) -> Self {
        Self {
            body,
            first: Some(first.into()),
            on_close: None,
            state: State::Fresh,
        }
    }

    /// Run `close` after the body's own close hook
    pub fn on_close<F>(mut self, close: F) -> Self
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.on_close = Some(Box::new(close));
        self
    }

    /// Whether the wrapper has been closed
    pub fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    /// Close the body and run the extra hook. Only the first call has any effect.
    ///
    /// Both hooks run even if the first one fails; the first failure is returned.
    pub fn close(&mut self) -> Result<()> {
        if mem::replace(&mut self.state, State::Closed) == State::Closed {
            return Ok(());
        }
        self.first = None;
        let own = self.body.close();
        let extra = match self.on_close.take() {
            Some(close) => close(),
            None => Ok(()),
        };
        own.and(extra)
    }

    /// Whether closing would still run a hook
    pub fn has_close(&self) -> bool {
        !self.is_closed() && (self.body.has_close() || self.on_close.is_some())
    }

    /// Detach both close hooks as one, leaving the wrapper with nothing to run
    pub fn take_close(&mut self) -> Option<CloseHook> {
        let own = self.body.take_close();
        match self.on_close.take() {
            Some(extra) => Some(chain_hooks(own, extra)),
            None => own,
        }
    }
}

impl Iterator for ResponseWrapper {
    type Item = Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.state {
                State::Fresh => match self.first.take() {
                    Some(first) => {
                        self.state = State::Prepending;
                        return Some(Ok(first));
                    }
                    None => self.state = State::Draining,
                },
                State::Prepending => self.state = State::Draining,
                State::Draining => {
                    return match self.body.next() {
                        Some(chunk) => Some(chunk),
                        None => self.close().err().map(Err),
                    };
                }
                State::Closed => return None,
            }
        }
    }
}

impl Drop for ResponseWrapper {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(error = %err, "close hook failed while dropping response body");
        }
    }
}

impl From<Body> for ResponseWrapper {
    fn from(body: Body) -> Self {
        Self::new(body)
    }
}

impl fmt::Debug for ResponseWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseWrapper")
            .field("state", &self.state)
            .field("first", &self.first)
            .field("body", &self.body)
            .finish_non_exhaustive()
    }
}

/// Allows a wrapped body to be handed to servers built on `http-body`
impl http_body::Body for ResponseWrapper {
    type Data = Bytes;
    type Error = Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Self::Data>, Self::Error>>> {
        // Chunks are produced synchronously, so every poll is ready
        Poll::Ready(self.get_mut().next().map(|chunk| chunk.map(Frame::data)))
    }

    fn is_end_stream(&self) -> bool {
        self.is_closed()
    }
}

/// Implement Stream for ResponseWrapper to enable async iteration in Rust
impl Stream for ResponseWrapper {
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Poll::Ready(self.get_mut().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce() -> Result<()> + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let hook_count = Arc::clone(&count);
        (count, move || {
            hook_count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn collect(wrapper: &mut ResponseWrapper) -> Vec<Bytes> {
        wrapper.by_ref().map(|chunk| chunk.unwrap()).collect()
    }

    #[test]
    fn test_push_back_yields_first_then_body_then_closes() {
        let (closed, hook) = counter();
        let body = Body::new(["b", "c"]).with_close(hook);
        let mut wrapper = ResponseWrapper::with_first(body, "a");

        assert_eq!(collect(&mut wrapper), ["a", "b", "c"]);
        assert!(wrapper.is_closed());
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert!(wrapper.next().is_none());
    }

    #[test]
    fn test_close_is_idempotent() {
        let (own, own_hook) = counter();
        let (extra, extra_hook) = counter();
        let mut wrapper = ResponseWrapper::new(Body::new(["x"]).with_close(own_hook)).on_close(extra_hook);

        for _ in 0..5 {
            wrapper.close().unwrap();
        }
        drop(wrapper);

        assert_eq!(own.load(Ordering::SeqCst), 1);
        assert_eq!(extra.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_exhaustion_then_close_runs_once() {
        let (closed, hook) = counter();
        let mut wrapper = ResponseWrapper::new(Body::new(["x"])).on_close(hook);

        assert_eq!(collect(&mut wrapper), ["x"]);
        wrapper.close().unwrap();
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_closes_unfinished_body() {
        let (closed, hook) = counter();
        let mut wrapper = ResponseWrapper::new(Body::new(["x", "y"]).with_close(hook));
        assert_eq!(wrapper.next().unwrap().unwrap(), "x");
        drop(wrapper);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_closed_wrapper_skips_prepended_chunk() {
        let mut wrapper = ResponseWrapper::with_first(Body::new(["b"]), "a");
        wrapper.close().unwrap();
        assert!(wrapper.next().is_none());
    }

    #[test]
    fn test_close_error_is_final_item() {
        let (extra, extra_hook) = counter();
        let body = Body::new(["x"]).with_close(|| Err(Error::application("disk gone")));
        let mut wrapper = ResponseWrapper::new(body).on_close(extra_hook);

        assert_eq!(wrapper.next().unwrap().unwrap(), "x");
        let err = wrapper.next().unwrap().unwrap_err();
        assert_eq!(err.to_string(), "disk gone");
        assert!(wrapper.next().is_none());
        // the extra hook still ran
        assert_eq!(extra.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_body_close_hooks_chain() {
        let (first, first_hook) = counter();
        let (second, second_hook) = counter();
        let mut body = Body::empty().with_close(first_hook).with_close(second_hook);
        body.close().unwrap();
        body.close().unwrap();
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert!(!body.has_close());
    }

    #[test]
    fn test_wrapped_body_keeps_close_semantics() {
        let (closed, hook) = counter();
        let wrapper = ResponseWrapper::with_first(Body::new(["b"]), "a").on_close(hook);
        let mut body = Body::from(wrapper);

        let chunks: Vec<_> = body.by_ref().map(|chunk| chunk.unwrap()).collect();
        assert_eq!(chunks, ["a", "b"]);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        body.close().unwrap();
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_take_close_moves_both_hooks() {
        let (own, own_hook) = counter();
        let (extra, extra_hook) = counter();
        let wrapper = ResponseWrapper::new(Body::new(["x"]).with_close(own_hook)).on_close(extra_hook);
        let mut body = Body::from(wrapper);

        let hook = body.take_close().unwrap();
        assert!(!body.has_close());
        assert_eq!(body.by_ref().count(), 1);
        assert_eq!(own.load(Ordering::SeqCst), 0);

        hook().unwrap();
        assert_eq!(own.load(Ordering::SeqCst), 1);
        assert_eq!(extra.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_http_body_collect() {
        let (closed, hook) = counter();
        let wrapper = ResponseWrapper::with_first(Body::new(["world"]), "hello ").on_close(hook);

        let collected = BodyExt::collect(wrapper).await.unwrap().to_bytes();
        assert_eq!(&collected[..], b"hello world");
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }
}
