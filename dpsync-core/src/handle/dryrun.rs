//! In-memory handles for dry runs
//!
//! These handles keep the "system" in process memory instead of the kernel
//! or the dataplane.  They back the `dpsync` binary and every test
//! that drives descriptors end to end: each call is counted, failures can be
//! queued up front, and pre-existing objects can be seeded for dumps.

use nix::errno::Errno;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::debug;

use super::{HandleError, KernelRoute, PuntHandle, RouteHandle};
use crate::model::PuntToHost;
use crate::namespace::{NamespaceError, NamespaceGuard, NamespaceRef, NamespaceSwitcher};

/// Counts calls and hands out queued failures.
#[derive(Debug, Default)]
struct CallLog {
    calls: AtomicUsize,
    failures: Mutex<VecDeque<HandleError>>,
}

impl CallLog {
    fn begin(&self) -> Result<(), HandleError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self
            .failures
            .lock()
            .expect("dry-run failure queue poisoned")
            .pop_front()
        {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn fail_next(&self, err: HandleError) {
        self.failures
            .lock()
            .expect("dry-run failure queue poisoned")
            .push_back(err);
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
struct StoredRoute {
    route: KernelRoute,
    ipv6: bool,
}

impl StoredRoute {
    /// Stores routes the way the kernel reports them: default routes lose
    /// their destination.
    fn new(route: &KernelRoute, ipv6: bool) -> Self {
        let mut route = route.clone();
        if route.dst.map_or(false, |dst| dst.is_any()) {
            route.dst = None;
        }
        Self { route, ipv6 }
    }

    fn from_route(route: &KernelRoute) -> Self {
        let ipv6 = match (route.dst, route.gw) {
            (Some(dst), _) => dst.is_ipv6(),
            (None, Some(gw)) => gw.is_ipv6(),
            (None, None) => false,
        };
        Self::new(route, ipv6)
    }

    fn same_as(&self, other: &StoredRoute) -> bool {
        self.ipv6 == other.ipv6
            && self.route.link_index == other.route.link_index
            && self.route.dst == other.route.dst
    }
}

/// Route table kept in memory.
#[derive(Debug, Default)]
pub struct DryRunRouteHandle {
    routes: Mutex<Vec<StoredRoute>>,
    log: CallLog,
}

impl DryRunRouteHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a route as if it had been configured outside the agent.
    pub fn seed(&self, route: KernelRoute, ipv6: bool) {
        self.lock().push(StoredRoute::new(&route, ipv6));
    }

    /// Current routes, in insertion order.
    pub fn routes(&self) -> Vec<KernelRoute> {
        self.lock().iter().map(|stored| stored.route.clone()).collect()
    }

    /// Number of handle calls made so far, failed ones included.
    pub fn calls(&self) -> usize {
        self.log.calls()
    }

    /// Make the next call fail with `err`.
    pub fn fail_next(&self, err: HandleError) {
        self.log.fail_next(err);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<StoredRoute>> {
        self.routes.lock().expect("dry-run route table poisoned")
    }
}

impl RouteHandle for DryRunRouteHandle {
    fn add_static_route(&self, route: &KernelRoute) -> Result<(), HandleError> {
        self.log.begin()?;
        let stored = StoredRoute::from_route(route);
        let mut routes = self.lock();
        if routes.iter().any(|r| r.same_as(&stored)) {
            return Err(Errno::EEXIST.into());
        }
        debug!(?route, "dry-run: route added");
        routes.push(stored);
        Ok(())
    }

    fn replace_static_route(&self, route: &KernelRoute) -> Result<(), HandleError> {
        self.log.begin()?;
        let stored = StoredRoute::from_route(route);
        let mut routes = self.lock();
        match routes.iter_mut().find(|r| r.same_as(&stored)) {
            Some(existing) => *existing = stored,
            None => routes.push(stored),
        }
        debug!(?route, "dry-run: route replaced");
        Ok(())
    }

    fn del_static_route(&self, route: &KernelRoute) -> Result<(), HandleError> {
        self.log.begin()?;
        let stored = StoredRoute::from_route(route);
        let mut routes = self.lock();
        let before = routes.len();
        routes.retain(|r| !r.same_as(&stored));
        if routes.len() == before {
            return Err(Errno::ESRCH.into());
        }
        debug!(?route, "dry-run: route deleted");
        Ok(())
    }

    fn get_static_routes(
        &self,
        link_index: i32,
    ) -> Result<(Vec<KernelRoute>, Vec<KernelRoute>), HandleError> {
        self.log.begin()?;
        let (v6, v4): (Vec<_>, Vec<_>) = self
            .lock()
            .iter()
            .filter(|r| r.route.link_index == link_index)
            .cloned()
            .partition(|r| r.ipv6);
        Ok((
            v4.into_iter().map(|r| r.route).collect(),
            v6.into_iter().map(|r| r.route).collect(),
        ))
    }
}

/// Punt tables kept in memory.
#[derive(Debug, Default)]
pub struct DryRunPuntHandle {
    punts: Mutex<Vec<PuntToHost>>,
    sockets: Mutex<Vec<PuntToHost>>,
    log: CallLog,
}

impl DryRunPuntHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plain punt-to-host entries.
    pub fn punts(&self) -> Vec<PuntToHost> {
        self.punts.lock().expect("dry-run punt table poisoned").clone()
    }

    /// Registered punt sockets.
    pub fn sockets(&self) -> Vec<PuntToHost> {
        self.sockets
            .lock()
            .expect("dry-run socket table poisoned")
            .clone()
    }

    pub fn calls(&self) -> usize {
        self.log.calls()
    }

    pub fn fail_next(&self, err: HandleError) {
        self.log.fail_next(err);
    }
}

impl PuntHandle for DryRunPuntHandle {
    fn add_punt(&self, punt: &PuntToHost) -> Result<(), HandleError> {
        self.log.begin()?;
        debug!(?punt, "dry-run: punt added");
        self.punts
            .lock()
            .expect("dry-run punt table poisoned")
            .push(punt.clone());
        Ok(())
    }

    fn register_punt_socket(&self, punt: &PuntToHost) -> Result<(), HandleError> {
        self.log.begin()?;
        let mut sockets = self.sockets.lock().expect("dry-run socket table poisoned");
        if sockets.iter().any(|s| s.key() == punt.key()) {
            return Err(HandleError::Rejected {
                retval: -1,
                message: format!("punt socket already registered for {}", punt.key()),
            });
        }
        debug!(?punt, "dry-run: punt socket registered");
        sockets.push(punt.clone());
        Ok(())
    }

    fn deregister_punt_socket(&self, punt: &PuntToHost) -> Result<(), HandleError> {
        self.log.begin()?;
        let mut sockets = self.sockets.lock().expect("dry-run socket table poisoned");
        let before = sockets.len();
        sockets.retain(|s| s.key() != punt.key());
        if sockets.len() == before {
            return Err(HandleError::Rejected {
                retval: -2,
                message: format!("no punt socket registered for {}", punt.key()),
            });
        }
        debug!(?punt, "dry-run: punt socket deregistered");
        Ok(())
    }
}

/// Namespace switcher that only pretends to switch.
///
/// The agent's own namespace always exists; other namespaces exist once
/// added.  Counters expose how many guards were handed out and how many are
/// still live, so callers can check that every entry was reverted.
#[derive(Debug, Default)]
pub struct DryRunSwitcher {
    existing: RwLock<HashSet<NamespaceRef>>,
    entered: AtomicUsize,
    active: Arc<AtomicUsize>,
}

impl DryRunSwitcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_namespace(&self, ns: NamespaceRef) {
        self.existing
            .write()
            .expect("dry-run namespace set poisoned")
            .insert(ns);
    }

    pub fn remove_namespace(&self, ns: &NamespaceRef) {
        self.existing
            .write()
            .expect("dry-run namespace set poisoned")
            .remove(ns);
    }

    /// Number of successful switches into a non-default namespace.
    pub fn entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }

    /// Number of guards not yet reverted.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

impl NamespaceSwitcher for DryRunSwitcher {
    fn switch_to(&self, ns: &NamespaceRef) -> Result<NamespaceGuard, NamespaceError> {
        if *ns == NamespaceRef::Default {
            return Ok(NamespaceGuard::noop(ns.clone()));
        }
        if !self
            .existing
            .read()
            .expect("dry-run namespace set poisoned")
            .contains(ns)
        {
            return Err(NamespaceError::NotFound(ns.clone()));
        }
        self.entered.fetch_add(1, Ordering::SeqCst);
        self.active.fetch_add(1, Ordering::SeqCst);
        let active = self.active.clone();
        Ok(NamespaceGuard::new(ns.clone(), move || {
            active.fetch_sub(1, Ordering::SeqCst);
        }))
    }
}
