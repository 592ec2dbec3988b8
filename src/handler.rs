//! Handler traits for both calling conventions
//!
//! A *simple* handler takes the request context and returns the whole
//! response triple. A *full* handler also receives an optional status
//! callback: without one it behaves like a simple handler, with one it must
//! call it before producing any body data and then return only the body.
//!
//! # Examples
//!
//! ## Simple handler
//!
//! ```
//! use wsgi_lite::{Environ, Handler, Response};
//!
//! let hello = Handler::simple_fn(|environ: &mut Environ| {
//!     let name = environ.get("QUERY_STRING").unwrap_or("world").to_string();
//!     Ok(Response::new(
//!         "200 OK",
//!         vec![("Content-Type".into(), "text/plain".into())],
//!         format!("Hello, {name}!"),
//!     ))
//! });
//! assert!(!hello.is_adapted());
//! ```
//!
//! ## Full handler producing its body with `write()`
//!
//! ```
//! use wsgi_lite::{Body, Environ, Handler, Reply, Response, StartResponse};
//!
//! let streaming = Handler::full_fn(|_environ: &mut Environ, start: Option<StartResponse>| {
//!     let Some(start) = start else {
//!         return Ok(Reply::Response(Response::new("200 OK", vec![], "done")));
//!     };
//!     let write = start.call("200 OK", vec![])?;
//!     Ok(Reply::deferred(async move {
//!         write.write("partial ").await?;
//!         write.write("output").await?;
//!         Ok(Body::empty())
//!     }))
//! });
//! ```

use std::{fmt, sync::Arc};

use parking_lot::Mutex;

use crate::adapter::Adapted;
use crate::bridge::Writer;
use crate::environ::Environ;
use crate::error::{Result, Violation};
use crate::types::{Headers, Reply, Response, Status};

/// A handler written against the simple convention
pub trait SimpleApp: Send + Sync {
    /// Handle a request and produce the response triple
    fn respond(&self, environ: &mut Environ) -> Result<Response>;
}

impl<F> SimpleApp for F
where
    F: Fn(&mut Environ) -> Result<Response> + Send + Sync,
{
    fn respond(&self, environ: &mut Environ) -> Result<Response> {
        self(environ)
    }
}

/// A handler written against the full convention
pub trait FullApp: Send + Sync {
    /// Handle a request
    ///
    /// Without a status callback the reply must be [`Reply::Response`].
    /// With one, the callback must be invoked before any body data is
    /// produced, and the reply is a body or a deferred write-style body.
    fn handle(&self, environ: &mut Environ, start_response: Option<StartResponse>) -> Result<Reply>;
}

impl<F> FullApp for F
where
    F: Fn(&mut Environ, Option<StartResponse>) -> Result<Reply> + Send + Sync,
{
    fn handle(&self, environ: &mut Environ, start_response: Option<StartResponse>) -> Result<Reply> {
        self(environ, start_response)
    }
}

/// Exception information passed with a repeated status callback
#[derive(Clone, Debug)]
pub struct ExcInfo(Arc<dyn std::error::Error + Send + Sync>);

impl ExcInfo {
    /// Wrap the error that caused the handler to replace its headers
    pub fn new(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self(Arc::from(err.into()))
    }

    /// The wrapped error
    pub fn error(&self) -> &(dyn std::error::Error + Send + Sync) {
        &*self.0
    }
}

impl fmt::Display for ExcInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

type StartFn = dyn Fn(Status, Headers, Option<ExcInfo>) -> Result<Writer> + Send + Sync;

/// The status callback of the full convention
///
/// Cloning shares the same callback.
#[derive(Clone)]
pub struct StartResponse {
    inner: Arc<StartFn>,
}

impl StartResponse {
    /// Wrap a callback
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(Status, Headers, Option<ExcInfo>) -> Result<Writer> + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(callback),
        }
    }

    /// A callback that records status and headers and hands out `writer`
    ///
    /// A second invocation without exception info fails with
    /// [`Violation::HeadersAlreadySet`]; with exception info it replaces the
    /// recorded values.
    pub fn recording(writer: Writer) -> (Self, HeaderSlot) {
        let slot = HeaderSlot::default();
        let recorder = slot.clone();
        let start = Self::new(move |status, headers, exc_info| {
            recorder.record(status, headers, exc_info.as_ref())?;
            Ok(writer.clone())
        });
        (start, slot)
    }

    /// Register status and headers
    pub fn call(&self, status: impl Into<Status>, headers: Headers) -> Result<Writer> {
        (self.inner)(status.into(), headers, None)
    }

    /// Register replacement status and headers after an error
    pub fn call_with_exc_info(
        &self,
        status: impl Into<Status>,
        headers: Headers,
        exc_info: ExcInfo,
    ) -> Result<Writer> {
        (self.inner)(status.into(), headers, Some(exc_info))
    }
}

impl fmt::Debug for StartResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StartResponse").finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct Recorded {
    head: Option<(Status, Headers)>,
    calls: usize,
}

/// Status and headers captured by a recording status callback
#[derive(Clone, Debug, Default)]
pub struct HeaderSlot {
    inner: Arc<Mutex<Recorded>>,
}

impl HeaderSlot {
    /// Record a status callback invocation
    pub fn record(&self, status: Status, headers: Headers, exc_info: Option<&ExcInfo>) -> Result<()> {
        let mut recorded = self.inner.lock();
        if recorded.head.is_some() && exc_info.is_none() {
            return Err(Violation::HeadersAlreadySet.into());
        }
        recorded.head = Some((status, headers));
        recorded.calls += 1;
        Ok(())
    }

    /// Whether status and headers were provided
    pub fn is_set(&self) -> bool {
        self.inner.lock().head.is_some()
    }

    /// How many times the callback accepted a status
    pub fn calls(&self) -> usize {
        self.inner.lock().calls
    }

    /// Copy of the recorded status and headers
    pub fn get(&self) -> Option<(Status, Headers)> {
        self.inner.lock().head.clone()
    }
}

/// A handler of either convention, or one already adapted to both
#[derive(Clone)]
pub enum Handler {
    /// Simple convention only
    Simple(Arc<dyn SimpleApp>),
    /// Full convention only
    Full(Arc<dyn FullApp>),
    /// Wrapped by `lite` or `lighten`, callable with either convention
    Adapted(Arc<Adapted>),
}

impl Handler {
    /// Tag a simple-convention handler
    pub fn simple(app: impl SimpleApp + 'static) -> Self {
        Handler::Simple(Arc::new(app))
    }

    /// Tag a simple-convention closure
    pub fn simple_fn<F>(app: F) -> Self
    where
        F: Fn(&mut Environ) -> Result<Response> + Send + Sync + 'static,
    {
        Handler::Simple(Arc::new(app))
    }

    /// Tag a full-convention handler
    pub fn full(app: impl FullApp + 'static) -> Self {
        Handler::Full(Arc::new(app))
    }

    /// Tag a full-convention closure
    pub fn full_fn<F>(app: F) -> Self
    where
        F: Fn(&mut Environ, Option<StartResponse>) -> Result<Reply> + Send + Sync + 'static,
    {
        Handler::Full(Arc::new(app))
    }

    /// Whether the handler supports both conventions
    pub fn is_adapted(&self) -> bool {
        matches!(self, Handler::Adapted(_))
    }

    /// The adapted handler, if any
    pub fn as_adapted(&self) -> Option<&Arc<Adapted>> {
        match self {
            Handler::Adapted(adapted) => Some(adapted),
            _ => None,
        }
    }

    /// Whether both values refer to the same handler instance
    pub fn ptr_eq(&self, other: &Handler) -> bool {
        match (self, other) {
            (Handler::Simple(a), Handler::Simple(b)) => Arc::ptr_eq(a, b),
            (Handler::Full(a), Handler::Full(b)) => Arc::ptr_eq(a, b),
            (Handler::Adapted(a), Handler::Adapted(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<Arc<Adapted>> for Handler {
    fn from(adapted: Arc<Adapted>) -> Self {
        Handler::Adapted(adapted)
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handler::Simple(_) => f.write_str("Handler::Simple(..)"),
            Handler::Full(_) => f.write_str("Handler::Full(..)"),
            Handler::Adapted(adapted) => f.debug_tuple("Handler::Adapted").field(adapted).finish(),
        }
    }
}
