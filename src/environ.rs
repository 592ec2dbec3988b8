//! Request context passed through a handler chain
//!
//! The context has two layers: an open string map for CGI-style variables
//! such as `REQUEST_METHOD`, and a typed extension map for the well-known
//! keys this crate and its callers rely on. The typed keys are reached
//! through accessors so their types are checked at compile time.

use std::{collections::BTreeMap, io, sync::Arc};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

/// Names of the well-known context keys
pub mod keys {
    /// Cleanup registration, see [`crate::cleanup`]
    pub const ADD_CLEANUP: &str = "wsgi_lite.add_cleanup";
    /// Error output sink
    pub const ERRORS: &str = "wsgi.errors";
    /// Request payload
    pub const INPUT: &str = "wsgi.input";
}

/// Shared error output sink
///
/// Clones share the same buffer, so a handler can move a clone into a
/// deferred body and the driver still sees everything written.
#[derive(Clone, Debug, Default)]
pub struct ErrorLog {
    buffer: Arc<Mutex<BytesMut>>,
}

impl ErrorLog {
    /// Create a new empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Append data to the log
    pub fn append(&self, data: impl AsRef<[u8]>) {
        self.buffer.lock().extend_from_slice(data.as_ref());
    }

    /// Copy of everything written so far
    pub fn contents(&self) -> Bytes {
        Bytes::copy_from_slice(&self.buffer.lock())
    }

    /// Get the length of the log
    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Check if the log is empty
    pub fn is_empty(&self) -> bool {
        self.buffer.lock().is_empty()
    }
}

impl io::Write for ErrorLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.append(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Request payload
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Input(pub Bytes);

impl Input {
    /// Create an input from any byte source
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self(data.into())
    }

    /// The payload bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Mutable per-request context
#[derive(Clone, Debug, Default)]
pub struct Environ {
    vars: BTreeMap<String, String>,
    extensions: http::Extensions,
}

impl Environ {
    /// Create an empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a variable
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Whether a variable is set
    pub fn contains_key(&self, key: &str) -> bool {
        self.vars.contains_key(key)
    }

    /// Set a variable, returning the previous value
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.vars.insert(key.into(), value.into())
    }

    /// Set a variable only if it is not set yet
    pub fn set_default(&mut self, key: impl Into<String>, value: impl Into<String>) -> &str {
        self.vars.entry(key.into()).or_insert_with(|| value.into())
    }

    /// Remove a variable
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.vars.remove(key)
    }

    /// Iterate over all variables in key order
    pub fn vars(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Typed extension values
    pub fn extensions(&self) -> &http::Extensions {
        &self.extensions
    }

    /// Mutable typed extension values
    pub fn extensions_mut(&mut self) -> &mut http::Extensions {
        &mut self.extensions
    }

    /// Get the error sink
    pub fn errors(&self) -> Option<&ErrorLog> {
        self.extensions.get::<ErrorLog>()
    }

    /// Get the error sink, creating an empty one if needed
    pub fn errors_mut(&mut self) -> &mut ErrorLog {
        self.extensions.get_or_insert_default::<ErrorLog>()
    }

    /// Set the error sink
    pub fn set_errors(&mut self, errors: ErrorLog) {
        self.extensions.insert(errors);
    }

    /// Get the request payload
    pub fn input(&self) -> Option<&Input> {
        self.extensions.get::<Input>()
    }

    /// Set the request payload
    pub fn set_input(&mut self, input: Input) {
        self.extensions.insert(input);
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Environ {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut environ = Self::new();
        environ.extend(iter);
        environ
    }
}

impl<K: Into<String>, V: Into<String>> Extend<(K, V)> for Environ {
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        for (key, value) in iter {
            self.insert(key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_vars() {
        let mut environ: Environ = [("REQUEST_METHOD", "GET")].into_iter().collect();
        assert_eq!(environ.get("REQUEST_METHOD"), Some("GET"));
        assert!(!environ.contains_key("PATH_INFO"));

        assert_eq!(environ.insert("REQUEST_METHOD", "POST").as_deref(), Some("GET"));
        assert_eq!(environ.set_default("REQUEST_METHOD", "PUT"), "POST");
        assert_eq!(environ.set_default("PATH_INFO", "/"), "/");

        let vars: Vec<_> = environ.vars().collect();
        assert_eq!(vars, [("PATH_INFO", "/"), ("REQUEST_METHOD", "POST")]);

        assert_eq!(environ.remove("PATH_INFO").as_deref(), Some("/"));
        assert!(!environ.contains_key("PATH_INFO"));
    }

    #[test]
    fn test_error_log_is_shared_between_clones() {
        let mut environ = Environ::new();
        assert!(environ.errors().is_none());

        let mut sink = environ.errors_mut().clone();
        write!(sink, "warning: {}", 42).unwrap();
        environ.errors_mut().append("\n");

        let errors = environ.errors().unwrap();
        assert_eq!(&errors.contents()[..], b"warning: 42\n");
        assert_eq!(errors.len(), 12);
        assert!(!errors.is_empty());
    }

    #[test]
    fn test_input() {
        let mut environ = Environ::new();
        assert!(environ.input().is_none());
        environ.set_input(Input::new("a=1"));
        assert_eq!(environ.input().unwrap().as_bytes(), b"a=1");
    }
}
