//! Adapters between the simple and full calling conventions
//!
//! [`lite`] lets a simple-convention handler be served by full-convention
//! drivers; [`lighten`] lets a full-convention handler be called like a
//! simple one, which is what simple-convention middleware needs. Both return
//! a [`Handler::Adapted`] that supports either convention, and both return
//! an already adapted handler unchanged.
//!
//! The outermost adapter to see a request installs the cleanup registry and
//! closes it when its body is closed; nested adapters register their bodies'
//! close hooks with it instead of closing them themselves.
//!
//! ```
//! use wsgi_lite::{lite, Body, Environ, FullApp, Handler, Reply, Response, StartResponse, Writer};
//!
//! let app = lite(Handler::simple_fn(|_: &mut Environ| {
//!     Ok(Response::new("200 OK", vec![("Content-Type".into(), "text/plain".into())], "hello"))
//! }))
//! .unwrap();
//!
//! let (start, head) = StartResponse::recording(Writer::unsupported());
//! let mut environ = Environ::new();
//! let Reply::Body(body) = app.as_adapted().unwrap().handle(&mut environ, Some(start)).unwrap() else {
//!     unreachable!()
//! };
//! assert_eq!(head.get().unwrap().0, "200 OK");
//! assert_eq!(body.map(|c| c.unwrap()).collect::<Vec<_>>(), ["hello"]);
//! ```

use std::{fmt, sync::Arc};

use tracing::{debug, warn};

use crate::body::{Body, ResponseWrapper};
use crate::bridge::Bridge;
use crate::cleanup::{self, AggregateClose};
use crate::config::Config;
use crate::environ::Environ;
use crate::error::{Error, Result, Violation};
use crate::handler::{FullApp, HeaderSlot, Handler, SimpleApp, StartResponse};
use crate::types::{Reply, Response};

enum Inner {
    Lite(Arc<dyn SimpleApp>),
    Lightened {
        app: Arc<dyn FullApp>,
        config: Config,
    },
}

/// A handler callable with either convention
///
/// Produced by [`lite`] and [`lighten`].
pub struct Adapted {
    inner: Inner,
}

impl fmt::Debug for Adapted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            Inner::Lite(_) => f.write_str("Adapted::Lite(..)"),
            Inner::Lightened { config, .. } => f
                .debug_struct("Adapted::Lightened")
                .field("config", config)
                .finish_non_exhaustive(),
        }
    }
}

/// Wrap a simple-convention handler so full-convention drivers can call it
///
/// Fails with a configuration error for a full-convention handler; use
/// [`lighten`] for those.
pub fn lite(handler: Handler) -> Result<Handler> {
    match handler {
        Handler::Adapted(_) => Ok(handler),
        Handler::Simple(app) => {
            debug!("adapting simple handler with lite");
            Ok(Handler::Adapted(Arc::new(Adapted {
                inner: Inner::Lite(app),
            })))
        }
        Handler::Full(_) => Err(Error::Configuration(
            "lite() expects a simple-convention handler; use lighten() for full-convention handlers"
                .into(),
        )),
    }
}

/// Wrap a full-convention handler so it can be called with only a context
pub fn lighten(handler: Handler) -> Result<Handler> {
    lighten_with(handler, Config::default())
}

/// [`lighten`] with explicit configuration
pub fn lighten_with(handler: Handler, config: Config) -> Result<Handler> {
    match handler {
        Handler::Adapted(_) => Ok(handler),
        Handler::Full(app) => {
            debug!(write_bridge = ?config.write_bridge(), "adapting full handler with lighten");
            Ok(Handler::Adapted(Arc::new(Adapted {
                inner: Inner::Lightened { app, config },
            })))
        }
        Handler::Simple(_) => Err(Error::Configuration(
            "lighten() expects a full-convention handler; use lite() for simple-convention handlers"
                .into(),
        )),
    }
}

impl SimpleApp for Adapted {
    fn respond(&self, environ: &mut Environ) -> Result<Response> {
        let aggregate = cleanup::install(environ);
        let result = match &self.inner {
            Inner::Lite(app) => app.respond(environ),
            Inner::Lightened { app, config } => lightened(app.as_ref(), environ, config),
        };
        match result {
            Ok(mut response) => {
                response.body = attach(response.body, aggregate);
                Ok(response)
            }
            Err(err) => {
                abandon(aggregate);
                Err(err)
            }
        }
    }
}

impl FullApp for Adapted {
    fn handle(&self, environ: &mut Environ, start_response: Option<StartResponse>) -> Result<Reply> {
        let Some(start_response) = start_response else {
            return self.respond(environ).map(Reply::Response);
        };
        match &self.inner {
            Inner::Lite(app) => {
                let aggregate = cleanup::install(environ);
                let response = match app.respond(environ) {
                    Ok(response) => response,
                    Err(err) => {
                        abandon(aggregate);
                        return Err(err);
                    }
                };
                let mut body = attach(response.body, aggregate);
                if let Err(err) = start_response.call(response.status, response.headers) {
                    if let Err(close_err) = body.close() {
                        warn!(error = %close_err, "closing body after failed start_response");
                    }
                    return Err(err);
                }
                Ok(Reply::Body(body))
            }
            // Already the full convention
            Inner::Lightened { app, .. } => app.handle(environ, Some(start_response)),
        }
    }
}

/// Chain the aggregate close, if this adapter owns it, onto the body
fn attach(body: Body, aggregate: Option<AggregateClose>) -> Body {
    match aggregate {
        Some(aggregate) => ResponseWrapper::new(body)
            .on_close(move || aggregate.close())
            .into(),
        None => body,
    }
}

/// Run the registry when the handler failed before a body existed
fn abandon(aggregate: Option<AggregateClose>) {
    if let Some(aggregate) = aggregate {
        if let Err(err) = aggregate.close() {
            warn!(error = %err, "cleanup failed after handler error");
        }
    }
}

fn close_quietly(mut body: Body) {
    if let Err(err) = body.close() {
        warn!(error = %err, "closing body after protocol violation");
    }
}

/// Call a full-convention handler with only a context
fn lightened(app: &dyn FullApp, environ: &mut Environ, config: &Config) -> Result<Response> {
    let registration = environ.cleanup_registration().cloned().ok_or_else(|| {
        Error::Configuration("lighten() called without a cleanup registry".into())
    })?;

    let bridge = Bridge::new(config);
    let (start_response, head) = StartResponse::recording(bridge.writer());

    let mut body = match app.handle(environ, Some(start_response))? {
        Reply::Body(body) => {
            bridge.seal();
            body
        }
        Reply::Deferred(future) => bridge.drive(future)?,
        Reply::Response(response) => {
            bridge.seal();
            if let Err(err) = head.record(response.status, response.headers, None) {
                close_quietly(response.body);
                return Err(err);
            }
            response.body
        }
    };

    if !head.is_set() {
        body = pull_until_headers(body, &head)?;
    }
    let Some((status, headers)) = head.get() else {
        close_quietly(body);
        return Err(Violation::NoStartResponse.into());
    };

    if let Some(close) = body.take_close() {
        registration.add_boxed(close);
    }
    Ok(Response {
        status,
        headers,
        body,
    })
}

/// Pull chunks until the handler supplies headers from inside its body
///
/// Empty chunks are skipped; the first non-empty chunk seen after the
/// headers is pushed back in front of the rest of the body.
fn pull_until_headers(mut body: Body, head: &HeaderSlot) -> Result<Body> {
    loop {
        match body.next() {
            Some(Ok(chunk)) if chunk.is_empty() => continue,
            Some(Ok(chunk)) if head.is_set() => {
                return Ok(ResponseWrapper::with_first(body, chunk).into());
            }
            Some(Ok(_)) => {
                close_quietly(body);
                return Err(Violation::BodyBeforeHeaders.into());
            }
            Some(Err(err)) => {
                close_quietly(body);
                return Err(err);
            }
            None if head.is_set() => return Ok(body),
            None => {
                close_quietly(body);
                return Err(Violation::NoStartResponse.into());
            }
        }
    }
}
