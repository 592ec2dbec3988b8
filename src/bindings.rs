//! Named arguments extracted from the request context
//!
//! A [`Bound`] handler declares parameter names and binds each one to a
//! [`Rule`]. On every call the first value a rule yields is passed to the
//! handler in an [`Args`] map; names with no match are absent.
//!
//! ```
//! use wsgi_lite::bindings::{Args, Bound};
//! use wsgi_lite::{Environ, Response, Result, SimpleApp};
//!
//! let greet = Bound::new(["name"], |_: &mut Environ, args: &Args| -> Result<Response> {
//!     let name = args.get("name").map_or("world", String::as_str);
//!     Ok(Response::new("200 OK", vec![], format!("Hello, {name}!")))
//! })
//! .bind("name", "REQUEST_METHOD")
//! .unwrap();
//!
//! let mut environ: Environ = [("REQUEST_METHOD", "POST")].into_iter().collect();
//! let body: Vec<_> = greet.respond(&mut environ).unwrap().body.map(|c| c.unwrap()).collect();
//! assert_eq!(body, ["Hello, POST!"]);
//! ```

use std::{collections::BTreeMap, fmt, sync::Arc};

use crate::environ::Environ;
use crate::error::{Error, Result};
use crate::handler::SimpleApp;
use crate::types::Response;

/// Values passed to a bound handler, keyed by parameter name
pub type Args = BTreeMap<String, String>;

type RuleFn = dyn Fn(&Environ) -> Vec<String> + Send + Sync;

/// Where a bound value comes from
#[derive(Clone)]
pub enum Rule {
    /// A context variable
    Key(String),
    /// A function producing candidate values
    Func(Arc<RuleFn>),
    /// Several rules tried in order
    Any(Vec<Rule>),
}

impl Rule {
    /// Wrap a function producing candidate values
    pub fn func<F>(f: F) -> Self
    where
        F: Fn(&Environ) -> Vec<String> + Send + Sync + 'static,
    {
        Rule::Func(Arc::new(f))
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rule::Key(key) => f.debug_tuple("Key").field(key).finish(),
            Rule::Func(_) => f.write_str("Func(..)"),
            Rule::Any(rules) => f.debug_tuple("Any").field(rules).finish(),
        }
    }
}

impl From<&str> for Rule {
    fn from(key: &str) -> Self {
        Rule::Key(key.to_string())
    }
}

impl From<String> for Rule {
    fn from(key: String) -> Self {
        Rule::Key(key)
    }
}

impl<R: Into<Rule>> From<Vec<R>> for Rule {
    fn from(rules: Vec<R>) -> Self {
        Rule::Any(rules.into_iter().map(Into::into).collect())
    }
}

/// Every candidate value of `rule` against `environ`, in order
pub fn iter_bindings<'a>(
    rule: &'a Rule,
    environ: &'a Environ,
) -> Box<dyn Iterator<Item = String> + 'a> {
    match rule {
        Rule::Key(key) => Box::new(environ.get(key).map(str::to_string).into_iter()),
        Rule::Func(f) => Box::new(f(environ).into_iter()),
        Rule::Any(rules) => Box::new(rules.iter().flat_map(move |rule| iter_bindings(rule, environ))),
    }
}

/// A simple-convention handler with context-derived arguments
pub struct Bound<F> {
    params: Vec<String>,
    rules: BTreeMap<String, Rule>,
    func: F,
}

impl<F> Bound<F>
where
    F: Fn(&mut Environ, &Args) -> Result<Response> + Send + Sync,
{
    /// Declare the parameters `func` accepts
    pub fn new<I>(params: I, func: F) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        Self {
            params: params.into_iter().map(Into::into).collect(),
            rules: BTreeMap::new(),
            func,
        }
    }

    /// Bind parameter `name` to `rule`
    ///
    /// Fails if the handler has no such parameter or it is already bound.
    pub fn bind(mut self, name: &str, rule: impl Into<Rule>) -> Result<Self> {
        if !self.params.iter().any(|param| param == name) {
            return Err(Error::Configuration(format!("handler has no {name:?} argument")));
        }
        if let Some(existing) = self.rules.get(name) {
            return Err(Error::Configuration(format!(
                "rebound argument {name:?} from {existing:?}"
            )));
        }
        self.rules.insert(name.to_string(), rule.into());
        Ok(self)
    }

    /// The first matching value of every bound rule
    pub fn resolve(&self, environ: &Environ) -> Args {
        self.rules
            .iter()
            .filter_map(|(name, rule)| {
                iter_bindings(rule, environ)
                    .next()
                    .map(|value| (name.clone(), value))
            })
            .collect()
    }
}

impl<F> SimpleApp for Bound<F>
where
    F: Fn(&mut Environ, &Args) -> Result<Response> + Send + Sync,
{
    fn respond(&self, environ: &mut Environ) -> Result<Response> {
        let args = self.resolve(environ);
        (self.func)(environ, &args)
    }
}

impl<F> fmt::Debug for Bound<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bound")
            .field("params", &self.params)
            .field("rules", &self.rules)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::lite;
    use crate::handler::Handler;

    fn echo(_: &mut Environ, args: &Args) -> Result<Response> {
        let body: Vec<String> = args.iter().map(|(k, v)| format!("{k}={v}")).collect();
        Ok(Response::new("200 OK", vec![], body.join("&")))
    }

    fn body_of(response: Response) -> String {
        let chunks: Vec<_> = response.body.map(|c| c.unwrap()).collect();
        String::from_utf8(chunks.concat()).unwrap()
    }

    #[test]
    fn test_iter_bindings_in_order() {
        let environ: Environ = [("A", "1"), ("C", "3")].into_iter().collect();
        let rule = Rule::from(vec![
            Rule::from("A"),
            Rule::from("B"),
            Rule::func(|_| vec!["f1".into(), "f2".into()]),
            Rule::from(vec!["C"]),
        ]);
        let values: Vec<_> = iter_bindings(&rule, &environ).collect();
        assert_eq!(values, ["1", "f1", "f2", "3"]);
    }

    #[test]
    fn test_bound_arguments_resolve_first_match() {
        let app = Bound::new(["name", "missing"], echo)
            .bind("name", "REQUEST_METHOD")
            .unwrap()
            .bind("missing", vec!["HTTP_X_NOPE", "HTTP_X_ALSO_NOPE"])
            .unwrap();

        let mut environ: Environ = [("REQUEST_METHOD", "POST")].into_iter().collect();
        assert_eq!(body_of(app.respond(&mut environ).unwrap()), "name=POST");
    }

    #[test]
    fn test_function_rule_sees_context() {
        let app = Bound::new(["path"], echo)
            .bind(
                "path",
                Rule::func(|environ| {
                    environ
                        .get("PATH_INFO")
                        .map(|path| vec![path.trim_start_matches('/').to_string()])
                        .unwrap_or_default()
                }),
            )
            .unwrap();

        let mut environ: Environ = [("PATH_INFO", "/users")].into_iter().collect();
        assert_eq!(body_of(app.respond(&mut environ).unwrap()), "path=users");
    }

    #[test]
    fn test_bind_errors() {
        let unknown = Bound::new(["name"], echo).bind("other", "X");
        assert!(matches!(unknown, Err(Error::Configuration(_))));

        let rebound = Bound::new(["name"], echo)
            .bind("name", "X")
            .and_then(|app| app.bind("name", "Y"));
        assert!(matches!(rebound, Err(Error::Configuration(_))));
    }

    #[test]
    fn test_bound_handler_composes_with_lite() {
        let app = Bound::new(["method"], echo).bind("method", "REQUEST_METHOD").unwrap();
        let app = lite(Handler::simple(app)).unwrap();

        let mut environ: Environ = [("REQUEST_METHOD", "GET")].into_iter().collect();
        let response = app.as_adapted().unwrap().respond(&mut environ).unwrap();
        assert_eq!(body_of(response), "method=GET");
    }
}
