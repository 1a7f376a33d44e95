//! Channel route matching, middleware, and authorization.
//!
//! Resolution order: exact name, then wildcard (`*`), then parameter
//! patterns (`user.{id}`), where `.` separates segments. Authorization is
//! denied by default for private and presence channels; public channels are
//! allowed unless the route carries an authorizer.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::OnceLock;

use regex::Regex;

use crate::channel::ChannelKind;
use crate::connection::Connection;
use crate::error::{Error, Result};

pub type RouteParams = HashMap<String, String>;
pub type Authorizer = Arc<dyn Fn(&Connection, &RouteParams) -> bool + Send + Sync>;

const MAX_CHANNEL_NAME_LEN: usize = 200;

fn name_charset() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z0-9._\-:]+$").expect("charset regex"))
}

/// A channel or event name is valid iff it matches `[a-zA-Z0-9._\-:]+`, is
/// at most 200 characters, and contains neither `..` nor `//`.
pub fn validate_channel_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_CHANNEL_NAME_LEN {
        return Err(Error::ChannelValidation(format!(
            "name length must be 1..={MAX_CHANNEL_NAME_LEN}"
        )));
    }
    if !name_charset().is_match(name) {
        return Err(Error::ChannelValidation(format!(
            "'{name}' contains invalid characters"
        )));
    }
    if name.contains("..") || name.contains("//") {
        return Err(Error::ChannelValidation(format!(
            "'{name}' contains a forbidden sequence"
        )));
    }
    Ok(())
}

pub fn validate_event_name(name: &str) -> Result<()> {
    validate_channel_name(name)
}

/// Middleware in the subscribe pipeline. Short-circuits by not calling
/// `next`.
pub trait ChannelMiddleware: Send + Sync {
    fn handle(
        &self,
        conn: &Connection,
        channel: &str,
        next: &dyn Fn(&Connection, &str) -> bool,
    ) -> bool;
}

enum Matcher {
    Exact,
    /// `*` segments; lower priority than exact, higher than params.
    Wildcard(Regex),
    /// `{name}` captures; `.` is the separator.
    Params(Regex),
}

pub struct ChannelRoute {
    pub pattern: String,
    matcher: Matcher,
    authorizer: Option<Authorizer>,
    middleware: Vec<Arc<dyn ChannelMiddleware>>,
    guards: Vec<String>,
}

impl ChannelRoute {
    pub fn new(pattern: impl Into<String>) -> Result<Self> {
        let pattern = pattern.into();
        let matcher = compile(&pattern)?;
        Ok(Self {
            pattern,
            matcher,
            authorizer: None,
            middleware: Vec::new(),
            guards: Vec::new(),
        })
    }

    pub fn authorizer(
        mut self,
        f: impl Fn(&Connection, &RouteParams) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.authorizer = Some(Arc::new(f));
        self
    }

    pub fn middleware(mut self, mw: Arc<dyn ChannelMiddleware>) -> Self {
        self.middleware.push(mw);
        self
    }

    /// Restrict to the listed authentication guards. Empty = all allowed.
    pub fn guards<I, S>(mut self, guards: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.guards = guards.into_iter().map(Into::into).collect();
        self
    }

    pub fn guard_names(&self) -> &[String] {
        &self.guards
    }

    /// Classification for operational listings.
    pub fn kind_label(&self) -> &'static str {
        match self.matcher {
            Matcher::Exact => ChannelKind::classify(&self.pattern).as_str(),
            _ => "dynamic",
        }
    }

    fn try_match(&self, name: &str) -> Option<RouteParams> {
        match &self.matcher {
            Matcher::Exact => (self.pattern == name).then(RouteParams::new),
            Matcher::Wildcard(re) => re.is_match(name).then(RouteParams::new),
            Matcher::Params(re) => re.captures(name).map(|caps| {
                re.capture_names()
                    .flatten()
                    .filter_map(|n| caps.name(n).map(|m| (n.to_string(), m.as_str().to_string())))
                    .collect()
            }),
        }
    }
}

fn compile(pattern: &str) -> Result<Matcher> {
    let has_params = pattern.contains('{');
    let has_wildcard = pattern.contains('*');
    if !has_params && !has_wildcard {
        return Ok(Matcher::Exact);
    }

    let mut regex = String::from("^");
    let mut rest = pattern;
    while !rest.is_empty() {
        if let Some(open) = rest.find(['{', '*']) {
            regex.push_str(&regex::escape(&rest[..open]));
            if rest.as_bytes()[open] == b'*' {
                regex.push_str(".*");
                rest = &rest[open + 1..];
            } else {
                let close = rest[open..].find('}').ok_or_else(|| {
                    Error::ChannelValidation(format!("unclosed parameter in '{pattern}'"))
                })? + open;
                let param = &rest[open + 1..close];
                regex.push_str(&format!("(?P<{param}>[^.]+)"));
                rest = &rest[close + 1..];
            }
        } else {
            regex.push_str(&regex::escape(rest));
            rest = "";
        }
    }
    regex.push('$');

    let re = Regex::new(&regex)
        .map_err(|e| Error::ChannelValidation(format!("bad pattern '{pattern}': {e}")))?;
    if has_params {
        Ok(Matcher::Params(re))
    } else {
        Ok(Matcher::Wildcard(re))
    }
}

pub struct RouteMatch<'a> {
    pub route: &'a ChannelRoute,
    pub params: RouteParams,
}

/// Registered channel routes. Immutable once the application has started.
#[derive(Default)]
pub struct ChannelRouter {
    routes: Vec<ChannelRoute>,
}

impl ChannelRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, route: ChannelRoute) {
        self.routes.push(route);
    }

    pub fn routes(&self) -> &[ChannelRoute] {
        &self.routes
    }

    /// Resolve a channel name: exact match wins over wildcard, wildcard
    /// over parameter extraction. Ties break in registration order.
    pub fn find(&self, name: &str) -> Option<RouteMatch<'_>> {
        for pass in [0, 1, 2] {
            for route in &self.routes {
                let rank = match route.matcher {
                    Matcher::Exact => 0,
                    Matcher::Wildcard(_) => 1,
                    Matcher::Params(_) => 2,
                };
                if rank != pass {
                    continue;
                }
                if let Some(params) = route.try_match(name) {
                    return Some(RouteMatch { route, params });
                }
            }
        }
        None
    }

    /// Run validation, guard filtering, the middleware pipeline, and the
    /// authorizer. Returns the bound path parameters on success.
    pub fn authorize(&self, conn: &Connection, name: &str) -> Result<RouteParams> {
        validate_channel_name(name)?;
        let kind = ChannelKind::classify(name);
        let matched = self.find(name);

        let Some(RouteMatch { route, params }) = matched else {
            // No route: public channels stay open, the rest deny by default.
            return if kind == ChannelKind::Public {
                Ok(RouteParams::new())
            } else {
                Err(Error::AuthorizationDenied {
                    channel: name.to_string(),
                    reason: "no authorizer registered".to_string(),
                })
            };
        };

        if !route.guards.is_empty() {
            let admitted = conn
                .guard
                .as_deref()
                .map(|g| route.guards.iter().any(|allowed| allowed == g))
                .unwrap_or(false);
            if !admitted {
                return Err(Error::AuthorizationDenied {
                    channel: name.to_string(),
                    reason: "guard not admitted".to_string(),
                });
            }
        }

        let authorized = {
            let authorizer = route.authorizer.clone();
            let params_ref = &params;
            let core: Box<dyn Fn(&Connection, &str) -> bool + '_> =
                Box::new(move |conn, _channel| match &authorizer {
                    Some(f) => f(conn, params_ref),
                    // Deny-by-default for private and presence channels.
                    None => kind == ChannelKind::Public,
                });

            // Built in reverse so execution follows declaration order.
            let mut next = core;
            for mw in route.middleware.iter().rev() {
                let mw = mw.clone();
                let inner = next;
                next = Box::new(move |conn, channel| mw.handle(conn, channel, &*inner));
            }
            next(conn, name)
        };

        if authorized {
            Ok(params)
        } else {
            Err(Error::AuthorizationDenied {
                channel: name.to_string(),
                reason: "authorizer rejected".to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    fn conn() -> Connection {
        Connection::new("c1", &SystemClock)
    }

    #[test]
    fn exact_beats_wildcard_beats_params() {
        let mut router = ChannelRouter::new();
        router.add(ChannelRoute::new("user.{id}").expect("route"));
        router.add(ChannelRoute::new("user.*").expect("route"));
        router.add(ChannelRoute::new("user.admin").expect("route"));

        let m = router.find("user.admin").expect("match");
        assert_eq!(m.route.pattern, "user.admin");
        let m = router.find("user.42").expect("match");
        assert_eq!(m.route.pattern, "user.*");
    }

    #[test]
    fn params_bind_by_name() {
        let mut router = ChannelRouter::new();
        router.add(ChannelRoute::new("orders.{region}.{id}").expect("route"));
        let m = router.find("orders.eu.77").expect("match");
        assert_eq!(m.params["region"], "eu");
        assert_eq!(m.params["id"], "77");
        assert!(router.find("orders.eu").is_none());
    }

    #[test]
    fn name_validation() {
        assert!(validate_channel_name("orders.eu-1:live_x").is_ok());
        assert!(validate_channel_name("orders/eu").is_err());
        assert!(validate_channel_name("a..b").is_err());
        assert!(validate_channel_name(&"x".repeat(201)).is_err());
        assert!(validate_channel_name("").is_err());
    }

    #[test]
    fn private_denied_without_authorizer() {
        let router = ChannelRouter::new();
        assert!(router.authorize(&conn(), "private-admin").is_err());
        assert!(router.authorize(&conn(), "orders").is_ok());
    }

    #[test]
    fn guards_filter_auth_sources() {
        let mut router = ChannelRouter::new();
        router.add(
            ChannelRoute::new("private-api")
                .expect("route")
                .guards(["api"])
                .authorizer(|_, _| true),
        );
        let mut c = conn();
        assert!(router.authorize(&c, "private-api").is_err());
        c.guard = Some("api".to_string());
        assert!(router.authorize(&c, "private-api").is_ok());
    }

    #[test]
    fn middleware_runs_in_declaration_order_and_short_circuits() {
        use std::sync::Mutex;

        struct Tag(&'static str, Arc<Mutex<Vec<&'static str>>>, bool);
        impl ChannelMiddleware for Tag {
            fn handle(
                &self,
                conn: &Connection,
                channel: &str,
                next: &dyn Fn(&Connection, &str) -> bool,
            ) -> bool {
                self.1.lock().expect("order lock").push(self.0);
                if self.2 {
                    next(conn, channel)
                } else {
                    false
                }
            }
        }

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut router = ChannelRouter::new();
        router.add(
            ChannelRoute::new("private-x")
                .expect("route")
                .middleware(Arc::new(Tag("first", order.clone(), true)))
                .middleware(Arc::new(Tag("second", order.clone(), false)))
                .middleware(Arc::new(Tag("third", order.clone(), true)))
                .authorizer(|_, _| true),
        );

        assert!(router.authorize(&conn(), "private-x").is_err());
        assert_eq!(*order.lock().expect("order lock"), vec!["first", "second"]);
    }
}
