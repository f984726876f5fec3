//! Linux static routes
//!
//! Routes are validated completely before anything is looked up or
//! touched.  The outgoing interface is then resolved through the interface
//! index, and the handle call runs inside the interface's namespace.
//!
//! Dependencies:
//! - `interface`: the outgoing interface must exist and be UP.
//! - `gw-reachability`: a non-empty gateway must be reachable, either
//!   through a link-local route on the same interface or through a local
//!   network assigned to that interface.
//!
//! Link-scoped routes publish a derived link-local-route key, which is what
//! other routes' gateway reachability can depend on.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, warn};

use super::{Dependency, Descriptor, KeyValue, KvWithMetadata, Origin, Value};
use crate::addrs::{self, IpNetwork, IPV4_ADDR_ANY, IPV6_ADDR_ANY};
use crate::config::DumpConfig;
use crate::handle::{HandleError, KernelRoute, KernelScope, RouteHandle};
use crate::ifindex::InterfaceIndex;
use crate::model::interface::parse_interface_address_key;
use crate::model::route::ROUTE_KEY_PREFIX;
use crate::model::{
    interface_state_key, link_local_route_key, parse_link_local_route_key, RouteScope, StaticRoute,
};
use crate::namespace::{NamespaceError, NamespaceRef, NamespaceSwitcher};
use crate::resync::pool::{Discovery, DumpPool};

pub const ROUTE_DESCRIPTOR_NAME: &str = "linux-route";

/// Dumped before routes so their interfaces are indexed.
pub const INTERFACE_DESCRIPTOR_NAME: &str = "linux-interface";

const ROUTE_OUT_INTERFACE_DEP: &str = "interface";
const ROUTE_GW_REACHABILITY_DEP: &str = "gw-reachability";

/// Invalid route configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum RouteValidationError {
    #[error("linux static route defined without outgoing interface")]
    WithoutInterface,
    #[error("linux static route defined without destination network")]
    WithoutDestination,
    #[error("linux static route with undefined scope")]
    UndefinedScope,
    #[error("linux static route with invalid destination network")]
    InvalidDestination,
    #[error("linux static route with invalid GW address")]
    InvalidGateway,
    #[error("linux static route of link scope must not have GW address")]
    LinkWithGateway,
}

/// Errors that no retry can fix without a configuration change.
pub const NON_RETRIABLE_ROUTE_ERRORS: [RouteValidationError; 6] = [
    RouteValidationError::WithoutInterface,
    RouteValidationError::WithoutDestination,
    RouteValidationError::UndefinedScope,
    RouteValidationError::InvalidDestination,
    RouteValidationError::InvalidGateway,
    RouteValidationError::LinkWithGateway,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteAction {
    Add,
    Modify,
    Delete,
    Dump,
}

impl fmt::Display for RouteAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add => write!(f, "add"),
            Self::Modify => write!(f, "modify"),
            Self::Delete => write!(f, "delete"),
            Self::Dump => write!(f, "dump"),
        }
    }
}

#[derive(Debug, Error)]
pub enum RouteError {
    #[error(transparent)]
    Invalid(#[from] RouteValidationError),
    #[error("failed to obtain metadata for interface {0}")]
    InterfaceNotFound(String),
    #[error("failed to switch namespace: {0}")]
    Namespace(#[from] NamespaceError),
    #[error("failed to {action} linux route: {source}")]
    Handle {
        action: RouteAction,
        #[source]
        source: HandleError,
    },
}

/// Where a configured route lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMetadata {
    pub link_index: i32,
    pub namespace: NamespaceRef,
}

/// A route with every field parsed; only the link index is missing.
#[derive(Debug, Clone, Copy)]
struct ValidatedRoute {
    dst: IpNetwork,
    gw: Option<IpAddr>,
    scope: KernelScope,
    priority: u32,
}

impl ValidatedRoute {
    fn into_kernel(self, link_index: i32) -> KernelRoute {
        KernelRoute {
            link_index,
            dst: Some(self.dst),
            gw: self.gw,
            scope: self.scope,
            priority: self.priority,
        }
    }
}

fn validate(route: &StaticRoute) -> Result<ValidatedRoute, RouteValidationError> {
    if route.outgoing_interface.is_empty() {
        return Err(RouteValidationError::WithoutInterface);
    }
    if route.dst_network.is_empty() {
        return Err(RouteValidationError::WithoutDestination);
    }
    if route.scope == RouteScope::Link && !route.gw_addr.is_empty() {
        return Err(RouteValidationError::LinkWithGateway);
    }
    let dst = route
        .dst_network
        .parse::<IpNetwork>()
        .map_err(|_| RouteValidationError::InvalidDestination)?;
    let gw = if route.gw_addr.is_empty() {
        None
    } else {
        Some(
            route
                .gw_addr
                .trim()
                .parse::<IpAddr>()
                .map_err(|_| RouteValidationError::InvalidGateway)?,
        )
    };
    let scope = scope_to_kernel(route.scope).ok_or(RouteValidationError::UndefinedScope)?;
    Ok(ValidatedRoute {
        dst,
        gw,
        scope,
        priority: route.metric,
    })
}

fn scope_to_kernel(scope: RouteScope) -> Option<KernelScope> {
    match scope {
        RouteScope::Global => Some(KernelScope::UNIVERSE),
        RouteScope::Site => Some(KernelScope::SITE),
        RouteScope::Host => Some(KernelScope::HOST),
        RouteScope::Link => Some(KernelScope::LINK),
        RouteScope::Undefined => None,
    }
}

fn scope_from_kernel(scope: KernelScope) -> Option<RouteScope> {
    match scope {
        KernelScope::UNIVERSE => Some(RouteScope::Global),
        KernelScope::SITE => Some(RouteScope::Site),
        KernelScope::HOST => Some(RouteScope::Host),
        KernelScope::LINK => Some(RouteScope::Link),
        _ => None,
    }
}

/// Gateway used for comparison; an empty one means "any" of the
/// destination's family.
fn gw_addr(route: &StaticRoute) -> &str {
    if !route.gw_addr.is_empty() {
        &route.gw_addr
    } else if addrs::is_ipv6(&route.dst_network) {
        IPV6_ADDR_ANY
    } else {
        IPV4_ADDR_ANY
    }
}

/// Converts a route read from the kernel back to its desired form.
///
/// Returns `None` for routes the agent never configures: IPv6 link-local
/// destinations and scopes without a northbound counterpart.  A missing
/// destination becomes the "any" network of the route's family.
pub fn kernel_to_static_route(
    if_name: &str,
    route: &KernelRoute,
    ipv6: bool,
) -> Option<StaticRoute> {
    let dst_network = match route.dst {
        None => IpNetwork::any(ipv6).to_string(),
        Some(dst) if dst.is_ipv6_link_local() => return None,
        Some(dst) => dst.to_string(),
    };
    let scope = scope_from_kernel(route.scope)?;
    Some(StaticRoute {
        outgoing_interface: if_name.to_string(),
        scope,
        dst_network,
        gw_addr: route.gw.map(|gw| gw.to_string()).unwrap_or_default(),
        metric: route.priority,
    })
}

fn gateway_reachable_via(key: &str, if_name: &str, gw: &IpAddr) -> bool {
    if let Some((dst, route_if)) = parse_link_local_route_key(key) {
        if route_if == if_name && dst.contains(gw) {
            return true;
        }
    }
    if let Some((addr_if, network)) = parse_interface_address_key(key) {
        if addr_if == if_name && network.contains(gw) {
            return true;
        }
    }
    false
}

pub struct RouteDescriptor {
    handle: Arc<dyn RouteHandle>,
    interfaces: Arc<dyn InterfaceIndex>,
    switcher: Arc<dyn NamespaceSwitcher>,
    pool: DumpPool,
}

impl RouteDescriptor {
    pub fn new(
        handle: Arc<dyn RouteHandle>,
        interfaces: Arc<dyn InterfaceIndex>,
        switcher: Arc<dyn NamespaceSwitcher>,
    ) -> Self {
        Self {
            handle,
            interfaces,
            switcher,
            pool: DumpPool::default(),
        }
    }

    pub fn with_dump_config(mut self, config: &DumpConfig) -> Self {
        self.pool = DumpPool::from_config(config);
        self
    }

    /// Validates, resolves the interface and runs `call` in its namespace.
    fn update_route(
        &self,
        route: &StaticRoute,
        action: RouteAction,
        call: impl FnOnce(&dyn RouteHandle, &KernelRoute) -> Result<(), HandleError>,
    ) -> Result<RouteMetadata, RouteError> {
        let validated = validate(route).map_err(|err| {
            error!(route = ?route, error = %err, "Invalid linux route");
            err
        })?;

        let meta = self
            .interfaces
            .lookup_by_name(&route.outgoing_interface)
            .ok_or_else(|| RouteError::InterfaceNotFound(route.outgoing_interface.clone()))?;

        let _guard = self.switcher.switch_to(&meta.namespace)?;
        let kernel = validated.into_kernel(meta.linux_if_index);
        call(self.handle.as_ref(), &kernel).map_err(|source| {
            error!(route = ?route, error = %source, "Failed to {action} linux route");
            RouteError::Handle { action, source }
        })?;
        debug!(route = ?route, "Linux route {action} done");

        Ok(RouteMetadata {
            link_index: meta.linux_if_index,
            namespace: meta.namespace,
        })
    }

    /// Routes of one interface, converted back to their desired form.
    fn dump_interface(
        &self,
        if_name: &String,
    ) -> Result<Vec<KvWithMetadata<StaticRoute, RouteMetadata>>, RouteError> {
        let meta = self.interfaces.lookup_by_name(if_name).ok_or_else(|| {
            error!(interface = %if_name, "Failed to obtain metadata for interface");
            RouteError::InterfaceNotFound(if_name.clone())
        })?;

        let (v4, v6) = {
            let _guard = match self.switcher.switch_to(&meta.namespace) {
                Ok(guard) => guard,
                Err(err) => {
                    // The namespace and every route it held are gone.
                    warn!(
                        namespace = %meta.namespace,
                        error = %err,
                        gone = err.is_gone(),
                        "Failed to dump namespace"
                    );
                    return Ok(Vec::new());
                }
            };
            self.handle
                .get_static_routes(meta.linux_if_index)
                .map_err(|source| RouteError::Handle {
                    action: RouteAction::Dump,
                    source,
                })?
        };

        let metadata = RouteMetadata {
            link_index: meta.linux_if_index,
            namespace: meta.namespace.clone(),
        };
        let families = v4.iter().map(|r| (r, false)).chain(v6.iter().map(|r| (r, true)));
        Ok(families
            .filter_map(|(kernel, ipv6)| kernel_to_static_route(if_name, kernel, ipv6))
            .map(|route| KvWithMetadata {
                key: route.key(),
                value: route,
                metadata: Some(metadata.clone()),
                origin: Origin::Unknown,
            })
            .collect())
    }
}

impl Descriptor for RouteDescriptor {
    type Value = StaticRoute;
    type Metadata = RouteMetadata;
    type Error = RouteError;

    fn name(&self) -> &str {
        ROUTE_DESCRIPTOR_NAME
    }

    fn is_key(&self, key: &str) -> bool {
        key.starts_with(ROUTE_KEY_PREFIX)
    }

    fn equivalent(&self, _key: &str, old: &StaticRoute, new: &StaticRoute) -> bool {
        if old.outgoing_interface != new.outgoing_interface
            || old.scope != new.scope
            || old.metric != new.metric
        {
            return false;
        }
        addrs::equal_networks(&old.dst_network, &new.dst_network)
            && addrs::equal_addrs(gw_addr(old), gw_addr(new))
    }

    fn add(&self, _key: &str, route: &StaticRoute) -> Result<RouteMetadata, RouteError> {
        self.update_route(route, RouteAction::Add, |handle, kernel| {
            handle.add_static_route(kernel)
        })
    }

    fn delete(
        &self,
        _key: &str,
        route: &StaticRoute,
        metadata: Option<&RouteMetadata>,
    ) -> Result<(), RouteError> {
        if self.interfaces.lookup_by_name(&route.outgoing_interface).is_none() {
            if let Some(meta) = metadata {
                // The interface left the index; fall back to where the
                // route was configured.
                let validated = validate(route)?;
                let _guard = self.switcher.switch_to(&meta.namespace)?;
                return self
                    .handle
                    .del_static_route(&validated.into_kernel(meta.link_index))
                    .map_err(|source| RouteError::Handle {
                        action: RouteAction::Delete,
                        source,
                    });
            }
        }
        self.update_route(route, RouteAction::Delete, |handle, kernel| {
            handle.del_static_route(kernel)
        })
        .map(drop)
    }

    fn modify(
        &self,
        _key: &str,
        _old: &StaticRoute,
        new: &StaticRoute,
        _old_metadata: Option<&RouteMetadata>,
    ) -> Result<RouteMetadata, RouteError> {
        self.update_route(new, RouteAction::Modify, |handle, kernel| {
            handle.replace_static_route(kernel)
        })
    }

    fn dependencies(&self, _key: &str, route: &StaticRoute) -> Vec<Dependency> {
        let mut deps = Vec::new();
        if !route.outgoing_interface.is_empty() {
            deps.push(Dependency::key(
                ROUTE_OUT_INTERFACE_DEP,
                interface_state_key(&route.outgoing_interface, true),
            ));
        }
        // A link-scoped route never has a reachable gateway; validation
        // rejects any gateway it carries.
        if route.scope == RouteScope::Link {
            return deps;
        }
        if let Ok(gw) = gw_addr(route).trim().parse::<IpAddr>() {
            if !gw.is_unspecified() {
                let if_name = route.outgoing_interface.clone();
                deps.push(Dependency::any_of(ROUTE_GW_REACHABILITY_DEP, move |key| {
                    gateway_reachable_via(key, &if_name, &gw)
                }));
            }
        }
        deps
    }

    fn derived_values(&self, _key: &str, route: &StaticRoute) -> Vec<KeyValue> {
        if route.scope != RouteScope::Link {
            return Vec::new();
        }
        vec![KeyValue::new(
            link_local_route_key(&route.dst_network, &route.outgoing_interface),
            Value::empty(),
        )]
    }

    fn is_retriable_failure(&self, err: &RouteError) -> bool {
        match err {
            RouteError::Invalid(invalid) => !NON_RETRIABLE_ROUTE_ERRORS.contains(invalid),
            _ => true,
        }
    }

    fn dump(
        &self,
        _correlate: &[KvWithMetadata<StaticRoute, RouteMetadata>],
    ) -> Discovery<KvWithMetadata<StaticRoute, RouteMetadata>, RouteError> {
        let interfaces = self.interfaces.list_all();
        let discovery = self.pool.run(&interfaces, |if_name| self.dump_interface(if_name));
        debug!(
            interfaces = interfaces.len(),
            routes = discovery.items.len(),
            complete = discovery.is_complete(),
            "Linux routes dumped"
        );
        discovery
    }

    fn dump_dependencies(&self) -> Vec<String> {
        vec![INTERFACE_DESCRIPTOR_NAME.to_string()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{DryRunRouteHandle, DryRunSwitcher};
    use crate::ifindex::{InterfaceMeta, SharedInterfaceIndex};
    use crate::model::interface_address_key;
    use nix::errno::Errno;

    struct Fixture {
        handle: Arc<DryRunRouteHandle>,
        index: Arc<SharedInterfaceIndex>,
        switcher: Arc<DryRunSwitcher>,
        descriptor: RouteDescriptor,
    }

    fn fixture() -> Fixture {
        let handle = Arc::new(DryRunRouteHandle::new());
        let index = Arc::new(SharedInterfaceIndex::new());
        let switcher = Arc::new(DryRunSwitcher::new());
        index.put(
            "eth0",
            InterfaceMeta {
                linux_if_index: 2,
                namespace: NamespaceRef::Default,
            },
        );
        let descriptor = RouteDescriptor::new(handle.clone(), index.clone(), switcher.clone());
        Fixture {
            handle,
            index,
            switcher,
            descriptor,
        }
    }

    fn route(dst: &str, gw: &str, scope: RouteScope) -> StaticRoute {
        StaticRoute {
            outgoing_interface: "eth0".into(),
            scope,
            dst_network: dst.into(),
            gw_addr: gw.into(),
            metric: 0,
        }
    }

    #[test]
    fn test_equivalence_tolerates_representation() {
        let f = fixture();
        let d = &f.descriptor;
        let a = route("FD00::1/64", "FD00::FFFF", RouteScope::Global);
        let b = route("fd00::/64", "fd00::ffff", RouteScope::Global);
        assert!(d.equivalent("k", &a, &b));

        let no_gw = route("10.0.0.0/24", "", RouteScope::Global);
        let any_gw = route("10.0.0.5/24", "0.0.0.0", RouteScope::Global);
        assert!(d.equivalent("k", &no_gw, &any_gw));

        let mut metric = no_gw.clone();
        metric.metric = 10;
        assert!(!d.equivalent("k", &no_gw, &metric));
        assert!(!d.equivalent(
            "k",
            &no_gw,
            &route("10.0.1.0/24", "", RouteScope::Global)
        ));
    }

    #[test]
    fn test_validation_order() {
        let mut r = route("", "10.0.0.1", RouteScope::Undefined);
        r.outgoing_interface.clear();
        assert_eq!(validate(&r).unwrap_err(), RouteValidationError::WithoutInterface);

        let r = route("", "bad", RouteScope::Link);
        assert_eq!(validate(&r).unwrap_err(), RouteValidationError::WithoutDestination);

        let r = route("bad", "also-bad", RouteScope::Link);
        assert_eq!(validate(&r).unwrap_err(), RouteValidationError::LinkWithGateway);

        let r = route("10.0.0.0", "bad", RouteScope::Undefined);
        assert_eq!(validate(&r).unwrap_err(), RouteValidationError::InvalidDestination);

        let r = route("10.0.0.0/24", "bad", RouteScope::Undefined);
        assert_eq!(validate(&r).unwrap_err(), RouteValidationError::InvalidGateway);

        let r = route("10.0.0.0/24", "10.0.0.1", RouteScope::Undefined);
        assert_eq!(validate(&r).unwrap_err(), RouteValidationError::UndefinedScope);
    }

    #[test]
    fn test_invalid_route_never_reaches_handle() {
        let f = fixture();
        let mut r = route("10.0.0.0/24", "", RouteScope::Global);
        r.outgoing_interface.clear();
        let err = f.descriptor.add(&r.key(), &r).unwrap_err();
        assert!(matches!(
            err,
            RouteError::Invalid(RouteValidationError::WithoutInterface)
        ));
        assert_eq!(f.handle.calls(), 0);
    }

    #[test]
    fn test_link_scope_with_gateway_rejected_on_add_and_modify() {
        let f = fixture();
        let good = route("169.254.0.0/16", "", RouteScope::Link);
        let bad = route("169.254.0.0/16", "10.0.0.1", RouteScope::Link);

        let err = f.descriptor.add(&bad.key(), &bad).unwrap_err();
        assert!(matches!(
            err,
            RouteError::Invalid(RouteValidationError::LinkWithGateway)
        ));
        let err = f.descriptor.modify(&bad.key(), &good, &bad, None).unwrap_err();
        assert!(matches!(
            err,
            RouteError::Invalid(RouteValidationError::LinkWithGateway)
        ));
        assert!(!f.descriptor.is_retriable_failure(&err));
        assert_eq!(f.handle.calls(), 0);
    }

    #[test]
    fn test_retriable_classification() {
        let f = fixture();
        for invalid in NON_RETRIABLE_ROUTE_ERRORS {
            assert!(!f.descriptor.is_retriable_failure(&RouteError::Invalid(invalid)));
        }
        assert!(f
            .descriptor
            .is_retriable_failure(&RouteError::InterfaceNotFound("eth9".into())));
        assert!(f.descriptor.is_retriable_failure(&RouteError::Handle {
            action: RouteAction::Add,
            source: HandleError::Os(Errno::EBUSY),
        }));
    }

    #[test]
    fn test_unresolved_interface_is_retriable() {
        let f = fixture();
        let mut r = route("10.0.0.0/24", "", RouteScope::Global);
        r.outgoing_interface = "eth9".into();
        let err = f.descriptor.add(&r.key(), &r).unwrap_err();
        assert!(matches!(err, RouteError::InterfaceNotFound(ref name) if name == "eth9"));
        assert!(f.descriptor.is_retriable_failure(&err));
        assert_eq!(f.handle.calls(), 0);
    }

    #[test]
    fn test_add_runs_in_interface_namespace() {
        let f = fixture();
        let blue = NamespaceRef::Named("blue".into());
        f.switcher.add_namespace(blue.clone());
        f.index.put(
            "veth1",
            InterfaceMeta {
                linux_if_index: 7,
                namespace: blue.clone(),
            },
        );

        let mut r = route("10.1.0.0/16", "", RouteScope::Global);
        r.outgoing_interface = "veth1".into();
        let metadata = f.descriptor.add(&r.key(), &r).unwrap();
        assert_eq!(
            metadata,
            RouteMetadata {
                link_index: 7,
                namespace: blue
            }
        );
        assert_eq!(f.switcher.entered(), 1);
        assert_eq!(f.switcher.active(), 0);
        assert_eq!(f.handle.routes()[0].link_index, 7);
    }

    #[test]
    fn test_add_dump_round_trip() {
        let f = fixture();
        let routes = vec![
            route("10.0.0.0/24", "", RouteScope::Global),
            route("0.0.0.0/0", "192.168.1.1", RouteScope::Global),
            route("::/0", "fd00::1", RouteScope::Global),
            route("169.254.0.0/16", "", RouteScope::Link),
            route("fd00:1::/64", "", RouteScope::Site),
        ];
        for r in &routes {
            f.descriptor.add(&r.key(), r).unwrap();
        }

        let discovery = f.descriptor.dump(&[]);
        assert!(discovery.is_complete());
        assert_eq!(discovery.items.len(), routes.len());
        for r in &routes {
            let found = discovery
                .items
                .iter()
                .find(|kv| kv.key == r.key())
                .unwrap_or_else(|| panic!("route {} not dumped", r.key()));
            assert!(f.descriptor.equivalent(&r.key(), r, &found.value));
            assert_eq!(found.origin, Origin::Unknown);
            assert_eq!(found.metadata.as_ref().unwrap().link_index, 2);
        }
    }

    #[test]
    fn test_dump_skips_foreign_routes() {
        let f = fixture();
        f.handle.seed(
            KernelRoute {
                link_index: 2,
                dst: Some("fe80::/64".parse().unwrap()),
                gw: None,
                scope: KernelScope::LINK,
                priority: 256,
            },
            true,
        );
        f.handle.seed(
            KernelRoute {
                link_index: 2,
                dst: Some("10.9.0.0/16".parse().unwrap()),
                gw: None,
                scope: KernelScope::NOWHERE,
                priority: 0,
            },
            false,
        );
        f.handle.seed(
            KernelRoute {
                link_index: 2,
                dst: None,
                gw: Some("10.0.0.1".parse().unwrap()),
                scope: KernelScope::UNIVERSE,
                priority: 0,
            },
            false,
        );

        let discovery = f.descriptor.dump(&[]);
        assert_eq!(discovery.items.len(), 1);
        assert_eq!(discovery.items[0].value.dst_network, "0.0.0.0/0");
        assert_eq!(discovery.items[0].key, "linux/config/l3/route/eth0/0.0.0.0/0");
    }

    #[test]
    fn test_dump_skips_vanished_namespace() {
        let f = fixture();
        f.index.put(
            "veth9",
            InterfaceMeta {
                linux_if_index: 9,
                namespace: NamespaceRef::Named("gone".into()),
            },
        );
        f.handle.seed(
            KernelRoute {
                link_index: 2,
                dst: Some("10.0.0.0/24".parse().unwrap()),
                gw: None,
                scope: KernelScope::UNIVERSE,
                priority: 0,
            },
            false,
        );

        let discovery = f.descriptor.dump(&[]);
        assert!(discovery.is_complete());
        assert_eq!(discovery.items.len(), 1);
    }

    /// Lists an interface the lookup cannot resolve.
    struct GhostIndex {
        inner: Arc<SharedInterfaceIndex>,
    }

    impl InterfaceIndex for GhostIndex {
        fn lookup_by_name(&self, name: &str) -> Option<crate::ifindex::InterfaceMeta> {
            self.inner.lookup_by_name(name)
        }

        fn list_all(&self) -> Vec<String> {
            let mut names = self.inner.list_all();
            names.insert(0, "ghost0".to_string());
            names
        }
    }

    #[test]
    fn test_dump_unindexed_interface_is_fatal() {
        let f = fixture();
        let descriptor = RouteDescriptor::new(
            f.handle.clone(),
            Arc::new(GhostIndex {
                inner: f.index.clone(),
            }),
            f.switcher.clone(),
        );
        let discovery = descriptor.dump(&[]);
        assert!(matches!(
            discovery.error,
            Some(RouteError::InterfaceNotFound(ref name)) if name == "ghost0"
        ));
    }

    #[test]
    fn test_dump_handle_failure_keeps_partial_result() {
        let f = fixture();
        for (idx, name) in ["eth1", "eth2", "eth3", "eth4", "eth5"].iter().enumerate() {
            f.index.put(
                *name,
                InterfaceMeta {
                    linux_if_index: 10 + idx as i32,
                    namespace: NamespaceRef::Default,
                },
            );
            f.handle.seed(
                KernelRoute {
                    link_index: 10 + idx as i32,
                    dst: Some(format!("10.{idx}.0.0/16").parse().unwrap()),
                    gw: None,
                    scope: KernelScope::UNIVERSE,
                    priority: 0,
                },
                false,
            );
        }
        f.handle.fail_next(HandleError::Os(Errno::EIO));

        let descriptor = RouteDescriptor::new(f.handle.clone(), f.index.clone(), f.switcher.clone())
            .with_dump_config(&DumpConfig {
                max_workers: 2,
                min_units_per_worker: 1,
            });
        let discovery = descriptor.dump(&[]);
        assert!(matches!(
            discovery.error,
            Some(RouteError::Handle {
                action: RouteAction::Dump,
                ..
            })
        ));
        assert!(!discovery.items.is_empty());
        assert!(discovery.items.len() < 5);
    }

    #[test]
    fn test_dependencies() {
        let f = fixture();
        let r = route("10.1.0.0/16", "10.0.0.1", RouteScope::Global);
        let deps = f.descriptor.dependencies(&r.key(), &r);
        assert_eq!(deps.len(), 2);
        assert!(deps[0].references("linux/interface/state/eth0/UP"));

        let gw = &deps[1];
        assert_eq!(gw.label(), ROUTE_GW_REACHABILITY_DEP);
        assert!(gw.references(&link_local_route_key("10.0.0.0/24", "eth0")));
        assert!(gw.references(&interface_address_key("eth0", "10.0.0.2/24")));
        assert!(!gw.references(&interface_address_key("eth1", "10.0.0.2/24")));
        assert!(!gw.references(&interface_address_key("eth0", "10.9.0.2/24")));

        let direct = route("10.1.0.0/16", "", RouteScope::Global);
        assert_eq!(f.descriptor.dependencies(&direct.key(), &direct).len(), 1);

        let link_with_gw = route("169.254.0.0/16", "10.0.0.1", RouteScope::Link);
        assert_eq!(
            f.descriptor.dependencies(&link_with_gw.key(), &link_with_gw).len(),
            1
        );

        let mut orphan = direct.clone();
        orphan.outgoing_interface.clear();
        assert!(f.descriptor.dependencies(&orphan.key(), &orphan).is_empty());
    }

    #[test]
    fn test_link_scope_derives_link_local_key() {
        let f = fixture();
        let link = route("169.254.1.1/16", "", RouteScope::Link);
        let derived = f.descriptor.derived_values(&link.key(), &link);
        assert_eq!(derived.len(), 1);
        assert_eq!(derived[0].key, "linux/l3/link-local-route/eth0/169.254.0.0/16");
        assert!(derived[0].value.is::<crate::descriptor::Empty>());

        let global = route("10.0.0.0/24", "", RouteScope::Global);
        assert!(f.descriptor.derived_values(&global.key(), &global).is_empty());
    }

    #[test]
    fn test_delete_missing_route_surfaces_handle_error() {
        let f = fixture();
        let r = route("10.0.0.0/24", "", RouteScope::Global);
        let err = f.descriptor.delete(&r.key(), &r, None).unwrap_err();
        assert!(matches!(
            err,
            RouteError::Handle {
                action: RouteAction::Delete,
                source: HandleError::Os(Errno::ESRCH)
            }
        ));
        assert!(f.descriptor.is_retriable_failure(&err));
    }

    #[test]
    fn test_delete_falls_back_to_metadata() {
        let f = fixture();
        let r = route("10.0.0.0/24", "", RouteScope::Global);
        let metadata = f.descriptor.add(&r.key(), &r).unwrap();
        f.index.remove("eth0");

        f.descriptor.delete(&r.key(), &r, Some(&metadata)).unwrap();
        assert!(f.handle.routes().is_empty());
    }
}
