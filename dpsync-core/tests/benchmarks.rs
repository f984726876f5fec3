//! Performance benchmarks for dpsync core.
//!
//! These tests measure timing for key operations and validate that
//! performance stays within acceptable bounds. Run with:
//!
//! ```sh
//! cargo test -p dpsync-core --test benchmarks -- --ignored --nocapture
//! ```

use std::sync::Arc;
use std::time::Instant;

use dpsync_core::handle::{DryRunRouteHandle, DryRunSwitcher, KernelRoute, KernelScope};
use dpsync_core::ifindex::{InterfaceMeta, SharedInterfaceIndex};
use dpsync_core::model::{interface_state_key, RouteScope, StaticRoute};
use dpsync_core::namespace::NamespaceRef;
use dpsync_core::resync::DumpPool;
use dpsync_core::{AgentConfig, DescriptorRegistry, Engine, ResyncRequest, RouteDescriptor};

const INTERFACES: usize = 32;

/// Engine with one route descriptor over `INTERFACES` UP interfaces.
fn bench_engine() -> (Engine, Arc<DryRunRouteHandle>) {
    let handle = Arc::new(DryRunRouteHandle::new());
    let index = Arc::new(SharedInterfaceIndex::new());
    for i in 0..INTERFACES {
        index.put(
            format!("eth{i}"),
            InterfaceMeta {
                linux_if_index: i as i32 + 2,
                namespace: NamespaceRef::Default,
            },
        );
    }
    let config = AgentConfig::default();
    let registry = DescriptorRegistry::new();
    registry
        .register(
            RouteDescriptor::new(handle.clone(), index, Arc::new(DryRunSwitcher::new()))
                .with_dump_config(&config.dump),
        )
        .unwrap();
    let engine = Engine::new(registry, config);
    for i in 0..INTERFACES {
        engine.notify_external(interface_state_key(&format!("eth{i}"), true), true);
    }
    (engine, handle)
}

fn bench_route(i: usize) -> StaticRoute {
    StaticRoute {
        outgoing_interface: format!("eth{}", i % INTERFACES),
        scope: RouteScope::Global,
        dst_network: format!("10.{}.{}.0/24", i / 256, i % 256),
        gw_addr: String::new(),
        metric: 0,
    }
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
}

// ---------------------------------------------------------------------------
// Reconciliation pass benchmark
// ---------------------------------------------------------------------------

#[test]
#[ignore]
fn bench_reconcile_routes() {
    const ROUTES: usize = 2000;
    let rt = runtime();
    let (engine, handle) = bench_engine();
    let request = (0..ROUTES).fold(ResyncRequest::new(), |req, i| req.linux_route(bench_route(i)));

    let start = Instant::now();
    let report = rt.block_on(engine.resync(request.into_pairs())).unwrap();
    let elapsed = start.elapsed();
    let per_route = elapsed / ROUTES as u32;

    eprintln!("[bench_reconcile_routes] {ROUTES} routes in {elapsed:?} ({per_route:?}/route)");
    eprintln!("  {}", engine.metrics().snapshot().summary());
    assert!(report.reconcile.is_converged());
    assert_eq!(handle.routes().len(), ROUTES);
    assert!(
        elapsed.as_millis() < 5000,
        "{ROUTES} route adds should finish in < 5 s, got {elapsed:?}"
    );

    // A second resync over a converged system only adopts.
    let request = (0..ROUTES).fold(ResyncRequest::new(), |req, i| req.linux_route(bench_route(i)));
    let start = Instant::now();
    let report = rt.block_on(engine.resync(request.into_pairs())).unwrap();
    let elapsed = start.elapsed();
    eprintln!("[bench_resync_converged] {ROUTES} routes adopted in {elapsed:?}");
    assert_eq!(report.adopted, ROUTES);
    assert!(report.reconcile.applied.is_empty());
}

// ---------------------------------------------------------------------------
// Dump pool benchmark
// ---------------------------------------------------------------------------

#[test]
#[ignore]
fn bench_dump_pool() {
    const UNITS: usize = 10_000;
    let units: Vec<usize> = (0..UNITS).collect();

    for workers in [1, 4, 10] {
        let pool = DumpPool::new(workers, 1);
        let start = Instant::now();
        let discovery = pool.run(&units, |unit| -> Result<Vec<usize>, ()> {
            Ok((0..8).map(|i| unit * 8 + i).collect())
        });
        let elapsed = start.elapsed();
        eprintln!("[bench_dump_pool] {UNITS} units on {workers} workers in {elapsed:?}");
        assert!(discovery.is_complete());
        assert_eq!(discovery.items.len(), UNITS * 8);
    }
}

// ---------------------------------------------------------------------------
// Route dump benchmark
// ---------------------------------------------------------------------------

#[test]
#[ignore]
fn bench_route_dump() {
    const ROUTES_PER_INTERFACE: usize = 100;
    let rt = runtime();
    let (engine, handle) = bench_engine();
    for i in 0..INTERFACES {
        for j in 0..ROUTES_PER_INTERFACE {
            handle.seed(
                KernelRoute {
                    link_index: i as i32 + 2,
                    dst: Some(format!("172.{i}.{j}.0/24").parse().unwrap()),
                    gw: None,
                    scope: KernelScope::UNIVERSE,
                    priority: 0,
                },
                false,
            );
        }
    }

    let start = Instant::now();
    let report = rt.block_on(engine.resync(Vec::new())).unwrap();
    let elapsed = start.elapsed();
    eprintln!(
        "[bench_route_dump] {} routes discovered and removed in {elapsed:?}",
        report.discovered
    );
    assert_eq!(report.discovered, INTERFACES * ROUTES_PER_INTERFACE);
    assert!(handle.routes().is_empty());
    assert!(
        elapsed.as_millis() < 5000,
        "dump and cleanup should finish in < 5 s, got {elapsed:?}"
    );
}
