//! Core response types shared by both calling conventions

use std::{fmt, future::Future};

use futures_core::future::BoxFuture;
use http::StatusCode;

use crate::body::{Body, ResponseWrapper};
use crate::error::{Error, Result};

/// Ordered response header pairs, kept exactly as the handler produced them
pub type Headers = Vec<(String, String)>;

/// Write-style handler body, driven by the write-emulation bridge
pub type Deferred = BoxFuture<'static, Result<Body>>;

/// A full status line such as `"200 OK"`
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Status(String);

impl Status {
    /// Create a status from a status line
    pub fn new(line: impl Into<String>) -> Self {
        Self(line.into())
    }

    /// The status line as given
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse the numeric part of the status line
    pub fn code(&self) -> Result<StatusCode> {
        let digits = self.0.split_whitespace().next().unwrap_or_default();
        StatusCode::from_bytes(digits.as_bytes()).map_err(|_| Error::InvalidStatus(self.0.clone()))
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<StatusCode> for Status {
    fn from(code: StatusCode) -> Self {
        match code.canonical_reason() {
            Some(reason) => Self(format!("{} {}", code.as_str(), reason)),
            None => Self(code.as_str().to_string()),
        }
    }
}

impl From<&str> for Status {
    fn from(line: &str) -> Self {
        Self::new(line)
    }
}

impl From<String> for Status {
    fn from(line: String) -> Self {
        Self(line)
    }
}

impl PartialEq<&str> for Status {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// The `(status, headers, body)` triple of the simple convention
#[derive(Debug)]
pub struct Response {
    /// Status line
    pub status: Status,
    /// Header pairs in order
    pub headers: Headers,
    /// Lazy body sequence
    pub body: Body,
}

impl Response {
    /// Build a response triple
    pub fn new(status: impl Into<Status>, headers: Headers, body: impl Into<Body>) -> Self {
        Self {
            status: status.into(),
            headers,
            body: body.into(),
        }
    }

    /// Split into the triple
    pub fn into_parts(self) -> (Status, Headers, Body) {
        (self.status, self.headers, self.body)
    }

    /// Convert into an `http::Response` whose body closes exactly once
    ///
    /// The body is closed before an error is returned.
    pub fn into_http(self) -> Result<http::Response<ResponseWrapper>> {
        let wrapper = ResponseWrapper::new(self.body);
        let code = self.status.code()?;
        let mut builder = http::Response::builder().status(code);
        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        Ok(builder.body(wrapper)?)
    }
}

/// What a full-convention handler hands back
pub enum Reply {
    /// A response triple, returned when no status callback was supplied
    Response(Response),
    /// A body sequence, returned after the status callback was invoked
    Body(Body),
    /// A handler that produces its body through `write()` calls
    Deferred(Deferred),
}

impl Reply {
    /// Wrap a write-style handler body
    pub fn deferred<F>(future: F) -> Self
    where
        F: Future<Output = Result<Body>> + Send + 'static,
    {
        Reply::Deferred(Box::pin(future))
    }
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Response(response) => f.debug_tuple("Response").field(response).finish(),
            Reply::Body(body) => f.debug_tuple("Body").field(body).finish(),
            Reply::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

impl From<Response> for Reply {
    fn from(response: Response) -> Self {
        Reply::Response(response)
    }
}

impl From<Body> for Reply {
    fn from(body: Body) -> Self {
        Reply::Body(body)
    }
}
