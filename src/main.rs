use rust_sandbox_proxy::admin::AdminService;
use rust_sandbox_proxy::admin_listener::AdminListener;
use rust_sandbox_proxy::circuit_breaker::BreakerRegistry;
use rust_sandbox_proxy::config::ProxyConfig;
use rust_sandbox_proxy::connection::ConnectionLimiter;
use rust_sandbox_proxy::listener::Listener;
use rust_sandbox_proxy::propagation::ContextPropagator;
use rust_sandbox_proxy::protocol::Protocol;
use rust_sandbox_proxy::router::RoutingTable;
use rust_sandbox_proxy::service::ProxyService;
use rust_sandbox_proxy::sync::{ConfiguredSource, RuleSync};
use rust_sandbox_proxy::transport::ClientPool;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting Rust Sandbox Proxy");

    if let Err(e) = run().await {
        error!("fatal error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = ProxyConfig::from_env_validated()?;
    info!(
        "config: http={}, rpc={}, admin={}, default_target={}, rules={:?}, timeout={}ms",
        config.listen_addr,
        config.rpc_listen_addr,
        config.metrics_addr,
        config.default_target,
        config.rule_source,
        config.request_timeout.as_millis()
    );

    let (shutdown_tx, _shutdown_rx) = broadcast::channel(1);

    let table = Arc::new(RoutingTable::new(config.default_target.clone()));
    let breakers = Arc::new(BreakerRegistry::new(config.breaker_config()));
    let propagator = ContextPropagator::new(config.route_key_header_name()?);

    // Populate the table before taking traffic; a failed first fetch is not
    // fatal, the sync loop keeps retrying.
    let rule_sync = match config.rule_source_spec()? {
        Some(spec) => {
            let source = ConfiguredSource::from_spec(&spec)?;
            let sync = RuleSync::new(
                source,
                Arc::clone(&table),
                config.sync_interval,
                config.sync_timeout,
            );
            if let Err(e) = sync.sync_once().await {
                warn!(error = %e, "initial rule sync failed, starting with default routing");
            }
            Some(sync)
        }
        None => {
            info!("no rule source configured, all traffic goes to the default target");
            None
        }
    };

    let http_pool = Arc::new(ClientPool::new(config.pool_config(false)));
    let rpc_pool = Arc::new(ClientPool::new(config.pool_config(true)));

    let http_service = ProxyService::new(
        Protocol::Http,
        Arc::clone(&table),
        Arc::clone(&http_pool),
        Arc::clone(&breakers),
        config.request_timeout,
    )
    .with_propagator(propagator.clone());
    let rpc_service = ProxyService::new(
        Protocol::Rpc,
        Arc::clone(&table),
        Arc::clone(&rpc_pool),
        Arc::clone(&breakers),
        config.request_timeout,
    )
    .with_propagator(propagator);

    let http_listener = Listener::bind(
        &config.listen_addr,
        http_service,
        ConnectionLimiter::new(config.max_connections),
    )
    .await?;
    info!("http proxy listening on {}", http_listener.local_addr());

    let rpc_listener = Listener::bind(
        &config.rpc_listen_addr,
        rpc_service,
        ConnectionLimiter::new(config.max_connections),
    )
    .await?;
    info!("rpc proxy listening on {}", rpc_listener.local_addr());

    let admin = AdminService::new(Arc::clone(&table));
    let admin_listener = AdminListener::bind(&config.metrics_addr, admin.clone()).await?;
    info!(
        "admin endpoints on {} (/health, /ready, /metrics, /routes)",
        admin_listener.local_addr()
    );

    let mut tasks = JoinSet::new();

    for (name, listener) in [("http listener", http_listener), ("rpc listener", rpc_listener)] {
        let shutdown_rx = shutdown_tx.subscribe();
        tasks.spawn(async move {
            if let Err(e) = listener.serve(shutdown_rx).await {
                error!("{} error: {}", name, e);
            }
            name
        });
    }

    let shutdown_rx = shutdown_tx.subscribe();
    tasks.spawn(async move {
        if let Err(e) = admin_listener.serve(shutdown_rx).await {
            error!("admin listener error: {}", e);
        }
        "admin listener"
    });

    if let Some(sync) = rule_sync {
        let shutdown_rx = shutdown_tx.subscribe();
        tasks.spawn(async move {
            sync.run(shutdown_rx).await;
            "rule sync"
        });
    }

    let shutdown_rx = shutdown_tx.subscribe();
    let prune = Arc::clone(&breakers).prune_unrouted(
        Arc::clone(&table),
        config.sync_interval,
        shutdown_rx,
    );
    tasks.spawn(async move {
        prune.await;
        "breaker pruner"
    });

    for (name, pool) in [("http pool reaper", http_pool), ("rpc pool reaper", rpc_pool)] {
        let shutdown_rx = shutdown_tx.subscribe();
        tasks.spawn(async move {
            pool.reap_idle(shutdown_rx).await;
            name
        });
    }

    admin.set_ready(true);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, initiating graceful shutdown");
        }
        Some(res) = tasks.join_next() => {
            match res {
                Ok(name) => warn!("{} exited before shutdown", name),
                Err(err) => error!("task join error: {}", err),
            }
        }
    }

    admin.set_ready(false);
    let _ = shutdown_tx.send(());

    while let Some(res) = tasks.join_next().await {
        match res {
            Ok(name) => info!("{} completed", name),
            Err(err) => error!("task join error: {}", err),
        }
    }

    info!("shutdown complete");
    Ok(())
}
