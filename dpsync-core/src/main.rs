//! dpsync - dataplane configuration agent
//!
//! Runs the reconciliation engine against in-memory dry-run handles, which
//! makes it possible to try out desired-state documents without touching the
//! host.

use anyhow::{Context, Result};
use dpsync_core::descriptor::{PuntDescriptor, RouteDescriptor};
use dpsync_core::handle::{DryRunPuntHandle, DryRunRouteHandle, DryRunSwitcher};
use dpsync_core::ifindex::{InterfaceIndex, InterfaceMeta, SharedInterfaceIndex};
use dpsync_core::model::{interface_state_key, StaticRoute};
use dpsync_core::namespace::NamespaceRef;
use dpsync_core::{
    init, AgentConfig, DescriptorRegistry, DesiredStateSource, Engine, FileSource, KeyValue,
    ResyncRequest,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

fn print_help() {
    println!("dpsync - dataplane configuration agent v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("USAGE:");
    println!("  dpsync [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("  -h, --help            Print this help message");
    println!("  -v, --version         Print version information");
    println!("      --config <PATH>   Agent configuration (JSON)");
    println!("      --desired <PATH>  Desired state document (JSON, key -> value)");
    println!("      --once            Run a single resync, print the result and exit");
    println!();
    println!("Logging is controlled through RUST_LOG (default: info).");
}

struct Args {
    config: Option<PathBuf>,
    desired: Option<PathBuf>,
    once: bool,
}

fn usage_error(message: &str) -> ! {
    eprintln!("error: {message}");
    eprintln!("Run 'dpsync --help' for usage information.");
    std::process::exit(1);
}

fn parse_args() -> Args {
    let mut args = Args {
        config: None,
        desired: None,
        once: false,
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            "-v" | "--version" => {
                println!("dpsync {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--config" => match iter.next() {
                Some(path) => args.config = Some(path.into()),
                None => usage_error("--config requires a path"),
            },
            "--desired" => match iter.next() {
                Some(path) => args.desired = Some(path.into()),
                None => usage_error("--desired requires a path"),
            },
            "--once" => args.once = true,
            other => usage_error(&format!("unrecognized argument '{other}'")),
        }
    }
    args
}

/// Makes every interface used by a desired route exist and be UP, since the
/// dry-run handles have no interface plugin behind them.
fn seed_interfaces(engine: &Engine, index: &SharedInterfaceIndex, desired: &[KeyValue]) {
    let mut next_index = 1;
    for kv in desired {
        let Some(route) = kv.value.downcast_ref::<StaticRoute>() else {
            continue;
        };
        let name = &route.outgoing_interface;
        if name.is_empty() || index.lookup_by_name(name).is_some() {
            continue;
        }
        next_index += 1;
        index.put(
            name.clone(),
            InterfaceMeta {
                linux_if_index: next_index,
                namespace: NamespaceRef::Default,
            },
        );
        engine.notify_external(interface_state_key(name, true), true);
    }
}

fn print_statuses(engine: &Engine) {
    println!("{:<56} {:<20} ERROR", "KEY", "STATE");
    for status in engine.statuses() {
        println!(
            "{:<56} {:<20} {}",
            status.key,
            status.state.to_string(),
            status.last_error.unwrap_or_default()
        );
    }
    println!();
    println!("{}", engine.metrics().snapshot().summary());
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args();
    init();

    let config = match &args.config {
        Some(path) => AgentConfig::from_file(path)?,
        None => AgentConfig::default(),
    };

    let index = Arc::new(SharedInterfaceIndex::new());
    let registry = DescriptorRegistry::new();
    registry.register(
        RouteDescriptor::new(
            Arc::new(DryRunRouteHandle::new()),
            index.clone(),
            Arc::new(DryRunSwitcher::new()),
        )
        .with_dump_config(&config.dump),
    )?;
    registry.register(PuntDescriptor::new(Arc::new(DryRunPuntHandle::new())))?;

    let source: Arc<dyn DesiredStateSource> = match &args.desired {
        Some(path) => Arc::new(FileSource::new(path)),
        None => Arc::new(ResyncRequest::new()),
    };
    let desired = source
        .load(&registry)
        .await
        .context("failed to load desired state")?;

    let engine = Arc::new(Engine::new(registry, config));
    seed_interfaces(&engine, &index, &desired);
    info!(keys = desired.len(), "dpsync agent starting");

    if args.once {
        let report = engine.resync(desired).await?;
        print_statuses(&engine);
        if !report.reconcile.is_converged() {
            std::process::exit(2);
        }
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let agent = tokio::spawn(engine.clone().run(source, cancel.clone()));
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("Shutting down");
    cancel.cancel();
    agent.await.context("agent loop panicked")??;
    print_statuses(&engine);
    Ok(())
}
