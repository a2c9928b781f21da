//! URL resolver: maps a request to the active module hooked to it.
//!
//! The table is immutable once built. A switchover builds a new one from the
//! active boundary set and replaces the shared `Arc` in one step, so every
//! request resolves against a single consistent snapshot.

use std::sync::{Arc, RwLock};

use crate::boundary::{Boundary, RequestGuard};
use crate::settings::{HookConfig, HookProtocol};

/// The parts of a request hooks match on.
#[derive(Debug, Clone)]
pub struct RequestTarget<'a> {
    pub https: bool,
    /// Lowercase, without port
    pub host: &'a str,
    pub port: u16,
    pub path: &'a str,
}

/// Where a matched request lands inside the module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookMatch {
    pub base_path: String,
    pub sub_path: String,
}

pub struct Route<T> {
    pub hook: HookConfig,
    pub handler: T,
}

pub struct RoutingTable<T = Arc<Boundary>> {
    routes: Vec<Route<T>>,
}

impl<T> Default for RoutingTable<T> {
    fn default() -> Self {
        Self { routes: Vec::new() }
    }
}

impl<T: Clone> RoutingTable<T> {
    /// Concatenate the hooks of every handler, most specific first.
    pub fn build<'a, I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (&'a [HookConfig], T)>,
    {
        let mut routes: Vec<Route<T>> = entries
            .into_iter()
            .flat_map(|(hooks, handler)| {
                hooks.iter().map(move |hook| Route {
                    hook: hook.clone(),
                    handler: handler.clone(),
                })
            })
            .collect();
        routes.sort_by(|a, b| specificity(&b.hook).cmp(&specificity(&a.hook)));
        Self { routes }
    }
}

impl<T> RoutingTable<T> {
    pub fn resolve(&self, target: &RequestTarget<'_>) -> Option<(&Route<T>, HookMatch)> {
        self.routes
            .iter()
            .find_map(|route| hook_matches(&route.hook, target).map(|m| (route, m)))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl RoutingTable<Arc<Boundary>> {
    pub fn from_boundaries(active: &[Arc<Boundary>]) -> Self {
        Self::build(active.iter().map(|b| (b.hooks(), Arc::clone(b))))
    }
}

/// Published routing table, swapped as a whole on every switchover.
pub type SharedRoutes = Arc<RwLock<Arc<RoutingTable>>>;

/// A request that has been routed and counted against its boundary.
pub struct Routed {
    pub guard: RequestGuard,
    pub hook: HookMatch,
}

/// Resolve and count the request in one step, under the read lock, so a
/// concurrent swap can't retire the boundary between lookup and count.
pub fn route(routes: &SharedRoutes, target: &RequestTarget<'_>) -> Option<Routed> {
    let table = match routes.read() {
        Ok(t) => t,
        Err(poisoned) => poisoned.into_inner(),
    };
    let (route, hook) = table.resolve(target)?;
    Some(Routed {
        guard: route.handler.enter(),
        hook,
    })
}

fn specificity(hook: &HookConfig) -> (bool, usize, usize, bool, bool) {
    (
        hook.port.is_some(),
        hook.domain.as_deref().map(str::len).unwrap_or(0),
        hook.path.as_deref().map(trim_path).map(str::len).unwrap_or(0),
        hook.specific_domain,
        hook.specific_path,
    )
}

fn trim_path(path: &str) -> &str {
    path.trim_end_matches('/')
}

pub fn hook_matches(hook: &HookConfig, target: &RequestTarget<'_>) -> Option<HookMatch> {
    let protocol_ok = match hook.protocol {
        HookProtocol::Any => true,
        HookProtocol::Http => !target.https,
        HookProtocol::Https => target.https,
    };
    if !protocol_ok {
        return None;
    }
    if hook.port.is_some_and(|p| p != target.port) {
        return None;
    }

    if let Some(domain) = hook.domain.as_deref().filter(|d| !d.is_empty()) {
        let domain = domain.to_ascii_lowercase();
        let exact = target.host == domain;
        let sub = !hook.specific_domain
            && target.host.len() > domain.len()
            && target.host.ends_with(&domain)
            && target.host.as_bytes()[target.host.len() - domain.len() - 1] == b'.';
        if !exact && !sub {
            return None;
        }
    }

    let base = hook.path.as_deref().map(trim_path).unwrap_or("");
    if !base.is_empty() {
        let exact = target.path == base || trim_path(target.path) == base;
        let below = !hook.specific_path
            && target.path.starts_with(base)
            && target.path[base.len()..].starts_with('/');
        if !exact && !below {
            return None;
        }
    }

    let sub_path = target.path.get(base.len()..).unwrap_or("").to_string();
    Some(HookMatch {
        base_path: base.to_string(),
        sub_path,
    })
}
