//! Write-emulation bridge
//!
//! A full-convention handler may produce its body by calling `write()`
//! instead of returning chunks. Such a handler returns
//! [`Reply::Deferred`](crate::Reply::Deferred): an async block that awaits
//! [`Writer::write`] for every chunk. The bridge polls that future on the
//! consumer's thread with a no-op waker. Each `write` parks its chunk in a
//! single-slot rendezvous and suspends; the consumer takes the chunk, and
//! asking for the next one resumes the handler. Handler and consumer
//! alternate strictly and at most one chunk is in flight.
//!
//! ```
//! use wsgi_lite::{bridge::Bridge, Body, Config, Reply};
//!
//! let bridge = Bridge::new(&Config::default());
//! let writer = bridge.writer();
//! let Reply::Deferred(future) = Reply::deferred(async move {
//!     writer.write("a").await?;
//!     writer.write("b").await?;
//!     Ok(Body::empty())
//! }) else { unreachable!() };
//!
//! let chunks: Vec<_> = bridge.drive(future).unwrap().map(|c| c.unwrap()).collect();
//! assert_eq!(chunks, ["a", "b"]);
//! ```

use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use bytes::Bytes;
use futures_util::task::noop_waker_ref;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::body::{Body, ResponseWrapper};
use crate::config::{Config, WriteBridge};
use crate::error::{Error, Result, Violation};
use crate::types::Deferred;

#[derive(Debug, Default)]
struct Rendezvous {
    chunk: Option<Bytes>,
    returned: bool,
}

type Slot = Arc<Mutex<Rendezvous>>;

#[derive(Clone)]
enum Target {
    Bridge(Slot),
    Sink(Arc<dyn Fn(Bytes) -> Result<()> + Send + Sync>),
    Unsupported,
}

/// The write function handed out by a status callback
#[derive(Clone)]
pub struct Writer {
    target: Target,
}

impl Writer {
    /// A writer that passes every chunk to `sink` immediately
    pub fn sink<F>(sink: F) -> Self
    where
        F: Fn(Bytes) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            target: Target::Sink(Arc::new(sink)),
        }
    }

    /// A writer that fails on first use
    pub fn unsupported() -> Self {
        Self {
            target: Target::Unsupported,
        }
    }

    /// Write one chunk
    ///
    /// A bridged write only completes once the bridge's consumer has taken
    /// the chunk; it must be awaited inside the handler's deferred body.
    pub fn write(&self, data: impl Into<Bytes>) -> Write {
        let data = data.into();
        let state = match &self.target {
            Target::Bridge(slot) => WriteState::Parked {
                slot: Arc::clone(slot),
                data: Some(data),
            },
            Target::Sink(sink) => WriteState::Done(Some(sink(data))),
            Target::Unsupported => {
                warn!("write() called while the write bridge is disabled");
                WriteState::Done(Some(Err(Error::NotSupported(
                    "write() requires the cooperative write bridge, which is disabled".into(),
                ))))
            }
        };
        Write { state }
    }
}

impl fmt::Debug for Writer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.target {
            Target::Bridge(_) => "bridge",
            Target::Sink(_) => "sink",
            Target::Unsupported => "unsupported",
        };
        f.debug_tuple("Writer").field(&kind).finish()
    }
}

enum WriteState {
    Done(Option<Result<()>>),
    Parked { slot: Slot, data: Option<Bytes> },
}

/// Future returned by [`Writer::write`]
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Write {
    state: WriteState,
}

impl Future for Write {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            WriteState::Done(result) => Poll::Ready(result.take().unwrap_or(Ok(()))),
            WriteState::Parked { slot, data } => {
                let mut slot = slot.lock();
                if slot.returned {
                    return Poll::Ready(Err(Violation::WriteAfterReturn.into()));
                }
                match data.take() {
                    // The slot holds at most one chunk; wait for the consumer.
                    Some(chunk) if slot.chunk.is_some() => {
                        *data = Some(chunk);
                        Poll::Pending
                    }
                    Some(chunk) => {
                        slot.chunk = Some(chunk);
                        Poll::Pending
                    }
                    None if slot.chunk.is_none() => Poll::Ready(Ok(())),
                    None => Poll::Pending,
                }
            }
        }
    }
}

fn poll_once(future: &mut Deferred) -> Poll<Result<Body>> {
    let mut cx = Context::from_waker(noop_waker_ref());
    future.as_mut().poll(&mut cx)
}

/// Per-request bridge between a write-style handler and a body consumer
pub struct Bridge {
    slot: Slot,
    mode: WriteBridge,
}

impl Bridge {
    /// Create a bridge for one request
    pub fn new(config: &Config) -> Self {
        Self {
            slot: Slot::default(),
            mode: config.write_bridge(),
        }
    }

    /// The writer a status callback should return for this request
    pub fn writer(&self) -> Writer {
        match self.mode {
            WriteBridge::Cooperative => Writer {
                target: Target::Bridge(Arc::clone(&self.slot)),
            },
            WriteBridge::Disabled => Writer::unsupported(),
        }
    }

    /// Mark the handler as returned, so later writes fail
    ///
    /// Used when the handler returned its body directly instead of deferring.
    pub fn seal(&self) {
        self.slot.lock().returned = true;
    }

    /// Run a deferred handler body up to its first write or its return
    ///
    /// A handler that returns without writing gets its body passed through
    /// unchanged. Otherwise the result yields the first written chunk, the
    /// remaining writes as they happen, and finally the chunks of the body
    /// the handler returned. Closing the result drops the suspended handler.
    pub fn drive(self, mut future: Deferred) -> Result<Body> {
        match poll_once(&mut future) {
            Poll::Ready(result) => {
                self.slot.lock().returned = true;
                result
            }
            Poll::Pending => {
                let first = self.slot.lock().chunk.take();
                let Some(first) = first else {
                    self.slot.lock().returned = true;
                    return Err(Violation::Stalled.into());
                };
                debug!("write bridge engaged");

                let driver = Arc::new(Mutex::new(Driver {
                    future: Some(future),
                    tail: None,
                    slot: self.slot,
                }));
                let reader = Arc::clone(&driver);
                let body = Body::from_results(std::iter::from_fn(move || reader.lock().next_chunk()))
                    .with_close(move || driver.lock().close());
                Ok(ResponseWrapper::with_first(body, first).into())
            }
        }
    }
}

impl fmt::Debug for Bridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bridge").field("mode", &self.mode).finish()
    }
}

/// Resumes a suspended handler one chunk at a time
struct Driver {
    future: Option<Deferred>,
    tail: Option<Body>,
    slot: Slot,
}

impl Driver {
    fn next_chunk(&mut self) -> Option<Result<Bytes>> {
        loop {
            if let Some(tail) = &mut self.tail {
                return tail.next();
            }
            let future = self.future.as_mut()?;
            match poll_once(future) {
                Poll::Ready(Ok(body)) => {
                    self.finish();
                    self.tail = Some(body);
                }
                Poll::Ready(Err(err)) => {
                    self.finish();
                    return Some(Err(err));
                }
                Poll::Pending => {
                    let chunk = self.slot.lock().chunk.take();
                    return Some(match chunk {
                        Some(chunk) => Ok(chunk),
                        None => {
                            self.finish();
                            Err(Violation::Stalled.into())
                        }
                    });
                }
            }
        }
    }

    fn finish(&mut self) {
        self.future = None;
        self.slot.lock().returned = true;
    }

    fn close(&mut self) -> Result<()> {
        self.finish();
        match self.tail.take() {
            Some(mut tail) => tail.close(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Reply;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn deferred<F>(future: F) -> Deferred
    where
        F: Future<Output = Result<Body>> + Send + 'static,
    {
        match Reply::deferred(future) {
            Reply::Deferred(future) => future,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_writes_become_lazy_chunks() {
        let progress = Arc::new(AtomicUsize::new(0));
        let bridge = Bridge::new(&Config::default());
        let writer = bridge.writer();
        let seen = Arc::clone(&progress);

        let mut body = bridge
            .drive(deferred(async move {
                seen.store(1, Ordering::SeqCst);
                writer.write("a").await?;
                seen.store(2, Ordering::SeqCst);
                writer.write("b").await?;
                seen.store(3, Ordering::SeqCst);
                Ok(Body::empty())
            }))
            .unwrap();

        // The handler is parked on its first write until the consumer asks for more
        assert_eq!(progress.load(Ordering::SeqCst), 1);
        assert_eq!(body.next().unwrap().unwrap(), "a");
        assert_eq!(progress.load(Ordering::SeqCst), 1);
        assert_eq!(body.next().unwrap().unwrap(), "b");
        assert_eq!(progress.load(Ordering::SeqCst), 2);
        assert!(body.next().is_none());
        assert_eq!(progress.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_returned_body_passes_through() {
        let bridge = Bridge::new(&Config::default());
        let body = bridge
            .drive(deferred(async { Ok(Body::new(["x"]).with_close(|| Ok(()))) }))
            .unwrap();
        // No bridging: the handler's own body, close hook included
        assert!(body.has_close());
        let chunks: Vec<_> = body.map(|c| c.unwrap()).collect();
        assert_eq!(chunks, ["x"]);
    }

    #[test]
    fn test_returned_body_follows_writes() {
        let closed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&closed);
        let bridge = Bridge::new(&Config::default());
        let writer = bridge.writer();

        let mut body = bridge
            .drive(deferred(async move {
                writer.write("head").await?;
                Ok(Body::new(["tail"]).with_close(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }))
            }))
            .unwrap();

        let chunks: Vec<_> = body.by_ref().map(|c| c.unwrap()).collect();
        assert_eq!(chunks, ["head", "tail"]);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        body.close().unwrap();
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_write_after_return_is_a_violation() {
        let bridge = Bridge::new(&Config::default());
        let writer = bridge.writer();
        let late = writer.clone();

        let mut body = bridge
            .drive(deferred(async move {
                writer.write("a").await?;
                Ok(Body::empty())
            }))
            .unwrap();
        assert_eq!(body.next().unwrap().unwrap(), "a");
        assert!(body.next().is_none());

        let mut write = late.write("b");
        let mut cx = Context::from_waker(noop_waker_ref());
        match Pin::new(&mut write).poll(&mut cx) {
            Poll::Ready(Err(err)) => assert_eq!(err.violation(), Some(Violation::WriteAfterReturn)),
            _ => panic!("write after return must fail"),
        }
    }

    #[test]
    fn test_sealed_bridge_rejects_writes() {
        let bridge = Bridge::new(&Config::default());
        let writer = bridge.writer();
        bridge.seal();

        let mut write = writer.write("late");
        let mut cx = Context::from_waker(noop_waker_ref());
        match Pin::new(&mut write).poll(&mut cx) {
            Poll::Ready(Err(err)) => assert_eq!(err.violation(), Some(Violation::WriteAfterReturn)),
            _ => panic!("write on a sealed bridge must fail"),
        }
    }

    #[test]
    fn test_disabled_bridge_fails_on_first_write() {
        let bridge = Bridge::new(&Config::new().with_write_bridge(WriteBridge::Disabled));
        let writer = bridge.writer();
        let err = bridge
            .drive(deferred(async move {
                writer.write("a").await?;
                Ok(Body::empty())
            }))
            .unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)));
    }

    #[test]
    fn test_suspending_without_write_is_a_violation() {
        let bridge = Bridge::new(&Config::default());
        let err = bridge
            .drive(deferred(async {
                std::future::pending::<()>().await;
                Ok(Body::empty())
            }))
            .unwrap_err();
        assert_eq!(err.violation(), Some(Violation::Stalled));
    }

    #[test]
    fn test_handler_error_after_write_is_yielded() {
        let bridge = Bridge::new(&Config::default());
        let writer = bridge.writer();
        let mut body = bridge
            .drive(deferred(async move {
                writer.write("partial").await?;
                Err(Error::application("upstream timed out"))
            }))
            .unwrap();

        assert_eq!(body.next().unwrap().unwrap(), "partial");
        assert_eq!(body.next().unwrap().unwrap_err().to_string(), "upstream timed out");
        assert!(body.next().is_none());
    }

    #[test]
    fn test_close_drops_suspended_handler() {
        struct Guard(Arc<AtomicUsize>);
        impl Drop for Guard {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let dropped = Arc::new(AtomicUsize::new(0));
        let guard = Guard(Arc::clone(&dropped));
        let bridge = Bridge::new(&Config::default());
        let writer = bridge.writer();

        let mut body = bridge
            .drive(deferred(async move {
                let _guard = guard;
                loop {
                    writer.write("tick").await?;
                }
            }))
            .unwrap();

        assert_eq!(body.next().unwrap().unwrap(), "tick");
        assert_eq!(body.next().unwrap().unwrap(), "tick");
        assert_eq!(dropped.load(Ordering::SeqCst), 0);
        body.close().unwrap();
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_sink_writer_completes_immediately() {
        let out = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&out);
        let writer = Writer::sink(move |data| {
            sink.lock().push(data);
            Ok(())
        });

        let mut write = writer.write("now");
        let mut cx = Context::from_waker(noop_waker_ref());
        assert!(matches!(Pin::new(&mut write).poll(&mut cx), Poll::Ready(Ok(()))));
        assert_eq!(*out.lock(), ["now"]);
    }
}
