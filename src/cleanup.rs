//! Per-request cleanup registry
//!
//! The first adapter that sees a context installs a [`Registration`] under
//! the well-known cleanup key and keeps the matching [`AggregateClose`].
//! Nested adapters find the registration already present and only append
//! to it, so every hook is run by the outermost adapter's aggregate close.
//!
//! Hooks run in registration order. Every hook runs even if an earlier one
//! failed; failures are logged and the first one is returned.

use std::{collections::VecDeque, fmt, sync::Arc};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::body::CloseHook;
use crate::environ::Environ;
use crate::error::{Error, Result};

type Hooks = Arc<Mutex<VecDeque<CloseHook>>>;

/// Handle for appending close hooks to a request's registry
#[derive(Clone)]
pub struct Registration {
    hooks: Hooks,
}

impl Registration {
    /// Append a close hook
    pub fn add<F>(&self, hook: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.add_boxed(Box::new(hook));
    }

    /// Append an already boxed close hook
    pub fn add_boxed(&self, hook: CloseHook) {
        self.hooks.lock().push_back(hook);
    }

    /// Number of hooks waiting to run
    pub fn len(&self) -> usize {
        self.hooks.lock().len()
    }

    /// Whether no hooks are waiting
    pub fn is_empty(&self) -> bool {
        self.hooks.lock().is_empty()
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("pending", &self.len())
            .finish()
    }
}

/// Runs every hook of a registry, once
#[must_use = "hooks only run when the aggregate close is called"]
pub struct AggregateClose {
    hooks: Hooks,
}

impl AggregateClose {
    /// Drain the registry in registration order
    ///
    /// Hooks registered while draining also run.
    pub fn close(self) -> Result<()> {
        let mut first_error: Option<Error> = None;
        loop {
            // Lock is released before the hook runs so hooks may register more.
            let Some(hook) = self.hooks.lock().pop_front() else {
                break;
            };
            if let Err(err) = hook() {
                warn!(error = %err, "cleanup hook failed");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Box the aggregate close as a close hook
    pub fn into_hook(self) -> CloseHook {
        Box::new(move || self.close())
    }
}

impl fmt::Debug for AggregateClose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregateClose")
            .field("pending", &self.hooks.lock().len())
            .finish()
    }
}

/// Install a registry on `environ` unless one is already present
///
/// Returns the aggregate close when this call created the registry, and
/// `None` when an outer adapter owns it.
pub fn install(environ: &mut Environ) -> Option<AggregateClose> {
    if environ.cleanup_registration().is_some() {
        return None;
    }
    let hooks: Hooks = Arc::default();
    environ.extensions_mut().insert(Registration {
        hooks: Arc::clone(&hooks),
    });
    debug!("installed cleanup registry");
    Some(AggregateClose { hooks })
}

impl Environ {
    /// The cleanup registration, if an adapter installed one
    pub fn cleanup_registration(&self) -> Option<&Registration> {
        self.extensions().get::<Registration>()
    }

    /// Register a close hook with the request's cleanup registry
    pub fn add_cleanup<F>(&self, hook: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        match self.cleanup_registration() {
            Some(registration) => {
                registration.add(hook);
                Ok(())
            }
            None => Err(Error::Configuration(format!(
                "no cleanup registry installed under {}",
                crate::environ::keys::ADD_CLEANUP
            ))),
        }
    }
}
