//! End-to-end reconciliation scenarios over the dry-run handles.

use std::sync::Arc;

use dpsync_core::descriptor::punt::PUNT_DESCRIPTOR_NAME;
use dpsync_core::descriptor::route::{INTERFACE_DESCRIPTOR_NAME, ROUTE_DESCRIPTOR_NAME};
use dpsync_core::handle::{
    DryRunPuntHandle, DryRunRouteHandle, DryRunSwitcher, KernelRoute, KernelScope,
};
use dpsync_core::ifindex::{InterfaceMeta, SharedInterfaceIndex};
use dpsync_core::model::{
    interface_address_key, interface_state_key, L3Protocol, L4Protocol, PuntToHost, RouteScope,
    StaticRoute,
};
use dpsync_core::namespace::NamespaceRef;
use dpsync_core::{
    AgentConfig, DescriptorRegistry, Engine, KeyState, PuntDescriptor, ResyncRequest,
    RouteDescriptor, UnwantedPolicy, Value,
};

struct Agent {
    engine: Engine,
    routes: Arc<DryRunRouteHandle>,
    punts: Arc<DryRunPuntHandle>,
    index: Arc<SharedInterfaceIndex>,
    switcher: Arc<DryRunSwitcher>,
}

impl Agent {
    fn new(config: AgentConfig) -> Self {
        let routes = Arc::new(DryRunRouteHandle::new());
        let punts = Arc::new(DryRunPuntHandle::new());
        let index = Arc::new(SharedInterfaceIndex::new());
        let switcher = Arc::new(DryRunSwitcher::new());

        let registry = DescriptorRegistry::new();
        registry
            .register(
                RouteDescriptor::new(routes.clone(), index.clone(), switcher.clone())
                    .with_dump_config(&config.dump),
            )
            .unwrap();
        registry.register(PuntDescriptor::new(punts.clone())).unwrap();

        Self {
            engine: Engine::new(registry, config),
            routes,
            punts,
            index,
            switcher,
        }
    }

    /// Indexes an interface in the agent's namespace and announces it UP.
    fn interface_up(&self, name: &str, if_index: i32) {
        self.index.put(
            name,
            InterfaceMeta {
                linux_if_index: if_index,
                namespace: NamespaceRef::Default,
            },
        );
        self.engine.notify_external(interface_state_key(name, true), true);
    }

    fn set_route(&self, route: &StaticRoute) {
        self.engine
            .set_desired(route.key(), Value::new(route.clone()))
            .unwrap();
    }

    fn state(&self, key: &str) -> KeyState {
        self.engine.status(key).unwrap().state
    }
}

fn route(if_name: &str, dst: &str, gw: &str, scope: RouteScope) -> StaticRoute {
    StaticRoute {
        outgoing_interface: if_name.into(),
        scope,
        dst_network: dst.into(),
        gw_addr: gw.into(),
        metric: 0,
    }
}

#[tokio::test]
async fn route_waits_for_its_interface() {
    let agent = Agent::new(AgentConfig::default());
    let r = route("eth1", "10.10.0.0/16", "", RouteScope::Global);
    agent.set_route(&r);

    let report = agent.engine.reconcile().await;
    assert_eq!(report.pending, vec![r.key()]);
    assert_eq!(agent.state(&r.key()), KeyState::PendingDependencies);
    assert_eq!(agent.routes.calls(), 0);

    agent.interface_up("eth1", 3);
    let report = agent.engine.reconcile().await;
    assert!(report.is_converged());
    assert_eq!(agent.state(&r.key()), KeyState::Configured);
    let installed = agent.routes.routes();
    assert_eq!(installed.len(), 1);
    assert_eq!(installed[0].link_index, 3);
}

#[tokio::test]
async fn link_route_with_gateway_fails_terminally() {
    let agent = Agent::new(AgentConfig::default());
    agent.interface_up("eth0", 2);
    let bad = route("eth0", "169.254.0.0/16", "10.0.0.1", RouteScope::Link);
    let good = route("eth0", "10.20.0.0/16", "", RouteScope::Global);
    agent.set_route(&bad);
    agent.set_route(&good);

    let report = agent.engine.reconcile().await;
    let failure = report.failure(&bad.key()).unwrap();
    assert!(!failure.retriable);
    assert!(failure.error.contains("link scope"));
    assert_eq!(report.applied, vec![good.key()]);
    assert_eq!(agent.routes.calls(), 1);

    let report = agent.engine.reconcile().await;
    assert!(report.failed.is_empty());
    assert_eq!(
        agent.state(&bad.key()),
        KeyState::Failed { retriable: false }
    );
    assert_eq!(agent.routes.calls(), 1);
}

#[tokio::test]
async fn gateway_route_follows_link_local_route() {
    let agent = Agent::new(AgentConfig::default());
    agent.interface_up("eth0", 2);
    let link = route("eth0", "192.168.1.0/24", "", RouteScope::Link);
    let default = route("eth0", "0.0.0.0/0", "192.168.1.1", RouteScope::Global);
    agent.set_route(&default);
    agent.set_route(&link);

    let report = agent.engine.reconcile().await;
    assert!(report.is_converged());
    assert_eq!(report.applied, vec![link.key(), default.key()]);

    assert!(agent.engine.remove_desired(&link.key()));
    let report = agent.engine.reconcile().await;
    assert_eq!(report.unapplied, vec![default.key()]);
    assert_eq!(report.removed, vec![link.key()]);
    assert_eq!(agent.state(&default.key()), KeyState::PendingDependencies);
    assert!(agent.routes.routes().is_empty());

    agent
        .engine
        .notify_external(interface_address_key("eth0", "192.168.1.10/24"), true);
    let report = agent.engine.reconcile().await;
    assert_eq!(report.applied, vec![default.key()]);
}

#[tokio::test]
async fn resync_removes_unwanted_and_adopts_existing() {
    let agent = Agent::new(AgentConfig::default());
    agent.interface_up("eth0", 2);
    let kept = route("eth0", "10.1.0.0/16", "", RouteScope::Global);
    agent.routes.seed(
        KernelRoute {
            link_index: 2,
            dst: Some("10.1.0.0/16".parse().unwrap()),
            gw: None,
            scope: KernelScope::UNIVERSE,
            priority: 0,
        },
        false,
    );
    agent.routes.seed(
        KernelRoute {
            link_index: 2,
            dst: Some("10.66.0.0/16".parse().unwrap()),
            gw: None,
            scope: KernelScope::UNIVERSE,
            priority: 0,
        },
        false,
    );

    let punt = PuntToHost {
        l3_protocol: L3Protocol::Ipv4,
        l4_protocol: L4Protocol::Udp,
        port: 4789,
        socket_path: String::new(),
    };
    let request = ResyncRequest::new()
        .linux_route(kept.clone())
        .punt_to_host(punt.clone());

    let report = agent.engine.resync(request.into_pairs()).await.unwrap();
    assert_eq!(report.dumped, vec![ROUTE_DESCRIPTOR_NAME]);
    assert_eq!(report.skipped, vec![PUNT_DESCRIPTOR_NAME]);
    assert_eq!(report.discovered, 2);
    assert_eq!(report.adopted, 1);
    assert_eq!(report.to_remove, 1);
    assert!(report.reconcile.is_converged());

    let remaining = agent.routes.routes();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].dst, Some("10.1.0.0/16".parse().unwrap()));
    assert_eq!(agent.state(&kept.key()), KeyState::Configured);
    assert_eq!(agent.punts.punts(), vec![punt.clone()]);
    assert_eq!(agent.state(&punt.key()), KeyState::Configured);

    let report = agent
        .engine
        .resync(
            ResyncRequest::new()
                .linux_route(kept.clone())
                .punt_to_host(punt)
                .into_pairs(),
        )
        .await
        .unwrap();
    assert_eq!(report.adopted, 1);
    assert!(report.reconcile.applied.is_empty());
    assert_eq!(agent.punts.calls(), 1);
}

#[tokio::test]
async fn resync_ignore_policy_keeps_foreign_routes() {
    let mut config = AgentConfig::default();
    config
        .unwanted
        .descriptors
        .insert(ROUTE_DESCRIPTOR_NAME.to_string(), UnwantedPolicy::Ignore);
    let agent = Agent::new(config);
    agent.interface_up("eth0", 2);
    agent.routes.seed(
        KernelRoute {
            link_index: 2,
            dst: Some("10.66.0.0/16".parse().unwrap()),
            gw: None,
            scope: KernelScope::UNIVERSE,
            priority: 0,
        },
        false,
    );

    let report = agent.engine.resync(Vec::new()).await.unwrap();
    assert_eq!(report.ignored, 1);
    assert_eq!(agent.routes.routes().len(), 1);
    assert!(agent.engine.statuses().is_empty());
}

#[tokio::test]
async fn route_in_named_namespace_restores_namespace() {
    let agent = Agent::new(AgentConfig::default());
    let blue = NamespaceRef::Named("blue".into());
    agent.switcher.add_namespace(blue.clone());
    agent.index.put(
        "veth0",
        InterfaceMeta {
            linux_if_index: 12,
            namespace: blue,
        },
    );
    agent
        .engine
        .notify_external(interface_state_key("veth0", true), true);

    let r = route("veth0", "172.16.0.0/12", "", RouteScope::Global);
    agent.set_route(&r);
    let report = agent.engine.reconcile().await;
    assert!(report.is_converged());
    assert_eq!(agent.switcher.entered(), 1);
    assert_eq!(agent.switcher.active(), 0);

    let report = agent.engine.resync(vec![]).await.unwrap();
    assert_eq!(report.reconcile.removed, vec![r.key()]);
    assert!(agent.routes.routes().is_empty());
    assert_eq!(agent.switcher.active(), 0);
}

#[tokio::test]
async fn interface_dump_dependency_is_optional() {
    let agent = Agent::new(AgentConfig::default());
    let order: Vec<String> = agent
        .engine
        .registry()
        .dump_order()
        .unwrap()
        .iter()
        .map(|d| d.name().to_string())
        .collect();
    assert!(!order.iter().any(|name| name == INTERFACE_DESCRIPTOR_NAME));
    assert_eq!(order, vec![ROUTE_DESCRIPTOR_NAME, PUNT_DESCRIPTOR_NAME]);
}

#[tokio::test]
async fn punt_socket_changes_recreate() {
    let agent = Agent::new(AgentConfig::default());
    let mut punt = PuntToHost {
        l3_protocol: L3Protocol::Ipv6,
        l4_protocol: L4Protocol::Tcp,
        port: 179,
        socket_path: "/run/punt/a.sock".into(),
    };
    agent
        .engine
        .set_desired(punt.key(), Value::new(punt.clone()))
        .unwrap();
    agent.engine.reconcile().await;
    assert_eq!(agent.punts.sockets(), vec![punt.clone()]);

    punt.socket_path = "/run/punt/b.sock".into();
    agent
        .engine
        .set_desired(punt.key(), Value::new(punt.clone()))
        .unwrap();
    let report = agent.engine.reconcile().await;
    assert_eq!(report.applied, vec![punt.key()]);
    assert_eq!(agent.punts.sockets(), vec![punt]);
}
