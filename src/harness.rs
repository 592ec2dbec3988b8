//! Run handlers against synthetic requests
//!
//! [`TestRequest`] assembles a context with the usual server defaults,
//! runs a handler through the full convention the way a server gateway
//! would, and returns everything it produced as a [`Captured`] record.
//!
//! ```
//! use wsgi_lite::harness::TestRequest;
//! use wsgi_lite::{lite, Environ, Handler, Response};
//!
//! let app = lite(Handler::simple_fn(|environ: &mut Environ| {
//!     let method = environ.get("REQUEST_METHOD").unwrap_or_default().to_string();
//!     Ok(Response::new("200 OK", vec![("Content-Type".into(), "text/plain".into())], method))
//! }))
//! .unwrap();
//!
//! let captured = TestRequest::new().form_field("q", "rust").run(&app).unwrap();
//! assert_eq!(captured.to_string(), "Status: 200 OK\nContent-Type: text/plain\n\nPOST");
//! ```

use std::{fmt, sync::Arc};

use bytes::{Bytes, BytesMut};
use futures_util::FutureExt;
use parking_lot::Mutex;

use crate::body::{Body, ResponseWrapper};
use crate::bridge::Writer;
use crate::environ::{Environ, ErrorLog, Input};
use crate::error::{Error, Result, Violation};
use crate::handler::{FullApp, HeaderSlot, Handler, SimpleApp, StartResponse};
use crate::types::{Headers, Reply, Status};

/// Builder for a synthetic request context
#[derive(Debug, Default)]
pub struct TestRequest {
    environ: Environ,
    form: Vec<(String, String)>,
}

impl TestRequest {
    /// Start from an empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing context
    pub fn with_environ(environ: Environ) -> Self {
        Self {
            environ,
            form: Vec::new(),
        }
    }

    /// Set a context variable; a leading `wsgi_` becomes `wsgi.`
    pub fn var(mut self, key: &str, value: impl Into<String>) -> Self {
        let key = if key.starts_with("wsgi_") {
            key.replacen('_', ".", 1)
        } else {
            key.to_string()
        };
        self.environ.insert(key, value);
        self
    }

    /// Add a form field; repeat a name to send several values
    pub fn form_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.form.push((name.into(), value.into()));
        self
    }

    /// Set the request payload
    pub fn input(mut self, data: impl Into<Bytes>) -> Self {
        self.environ.set_input(Input::new(data));
        self
    }

    /// Assemble the context
    ///
    /// A non-empty form is urlencoded into the payload and makes the request
    /// a `POST`, unless those values were set explicitly.
    pub fn build(self) -> Environ {
        let mut environ = self.environ;
        if !self.form.is_empty() {
            let encoded = encode_form(&self.form);
            if environ.input().is_none() {
                environ.set_input(Input::new(encoded.clone()));
            }
            environ.set_default("CONTENT_LENGTH", encoded.len().to_string());
            environ.set_default("CONTENT_TYPE", "application/x-www-form-urlencoded");
            environ.set_default("REQUEST_METHOD", "POST");
        }
        setup_testing_defaults(&mut environ);
        environ
    }

    /// Run `handler` through the full convention and capture its output
    ///
    /// The body is drained and closed before this returns, also on error.
    pub fn run(self, handler: &Handler) -> Result<Captured> {
        let mut environ = self.build();
        let errors = environ.errors_mut().clone();

        let output: Arc<Mutex<BytesMut>> = Arc::default();
        let sink = Arc::clone(&output);
        let (start, head) = StartResponse::recording(Writer::sink(move |chunk: Bytes| {
            sink.lock().extend_from_slice(&chunk);
            Ok(())
        }));

        let body = match handler {
            Handler::Simple(app) => {
                let response = app.respond(&mut environ)?;
                reply_body(Reply::Response(response), &head)?
            }
            Handler::Full(app) => reply_body(app.handle(&mut environ, Some(start))?, &head)?,
            Handler::Adapted(app) => {
                reply_body(FullApp::handle(app.as_ref(), &mut environ, Some(start))?, &head)?
            }
        };

        let mut body = ResponseWrapper::new(body);
        for chunk in &mut body {
            let chunk = chunk?;
            if chunk.is_empty() {
                continue;
            }
            if !head.is_set() {
                return Err(Violation::BodyBeforeHeaders.into());
            }
            output.lock().extend_from_slice(&chunk);
        }
        body.close()?;

        let (status, headers) = head.get().ok_or(Violation::NoStartResponse)?;
        let body = output.lock().split().freeze();
        Ok(Captured {
            status,
            headers,
            body,
            errors: errors.contents(),
        })
    }
}

fn reply_body(reply: Reply, head: &HeaderSlot) -> Result<Body> {
    match reply {
        Reply::Body(body) => Ok(body),
        Reply::Response(response) => {
            let (status, headers, mut body) = response.into_parts();
            if let Err(err) = head.record(status, headers, None) {
                body.close()?;
                return Err(err);
            }
            Ok(body)
        }
        Reply::Deferred(future) => future.now_or_never().unwrap_or_else(|| {
            Err(Error::NotSupported(
                "deferred handler awaited something other than write()".into(),
            ))
        }),
    }
}

/// Fill in the variables every server is expected to provide
///
/// Values already present are left alone.
pub fn setup_testing_defaults(environ: &mut Environ) {
    let host = environ.set_default("SERVER_NAME", "127.0.0.1").to_string();
    environ.set_default("SERVER_PROTOCOL", "HTTP/1.0");
    environ.set_default("HTTP_HOST", host);
    environ.set_default("REQUEST_METHOD", "GET");
    if !environ.contains_key("SCRIPT_NAME") && !environ.contains_key("PATH_INFO") {
        environ.insert("SCRIPT_NAME", "");
        environ.insert("PATH_INFO", "/");
    }
    environ.set_default("wsgi.version", "1.0");
    environ.set_default("wsgi.run_once", "0");
    environ.set_default("wsgi.multithread", "0");
    environ.set_default("wsgi.multiprocess", "0");
    if environ.input().is_none() {
        environ.set_input(Input::default());
    }
    if environ.errors().is_none() {
        environ.set_errors(ErrorLog::new());
    }
    let scheme = environ.set_default("wsgi.url_scheme", "http").to_string();
    match scheme.as_str() {
        "http" => {
            environ.set_default("SERVER_PORT", "80");
        }
        "https" => {
            environ.set_default("SERVER_PORT", "443");
        }
        _ => {}
    }
}

fn encode_form(fields: &[(String, String)]) -> String {
    form_urlencoded::Serializer::new(String::new())
        .extend_pairs(fields)
        .finish()
}

/// Everything a handler produced for one request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Captured {
    /// Final status line
    pub status: Status,
    /// Final headers
    pub headers: Headers,
    /// Body bytes, including anything passed to `write()`
    pub body: Bytes,
    /// Contents of the error log
    pub errors: Bytes,
}

impl Captured {
    /// Look up a header, ignoring case
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// CGI-style transcript, followed by the error log if it is not empty
impl fmt::Display for Captured {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Status: {}", self.status)?;
        for (name, value) in &self.headers {
            writeln!(f, "{name}: {value}")?;
        }
        writeln!(f)?;
        f.write_str(&String::from_utf8_lossy(&self.body))?;
        if !self.errors.is_empty() {
            writeln!(f)?;
            writeln!(f, "--- Log Output ---")?;
            f.write_str(&String::from_utf8_lossy(&self.errors))?;
        }
        Ok(())
    }
}
