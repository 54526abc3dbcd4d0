// src/main.rs
use anyhow::Result;
use hyper::{Body, Request, Response, Server, StatusCode};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

use session_gateway::{
    balancer::LoadBalancer,
    config::Config,
    controller::Controller,
    health::HealthMonitor,
    metrics::MetricsRegistry,
    registry::ServerRegistry,
    server::{RequestHandler, ServerBuilder},
};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;

    let config = Arc::new(Config::from_env()?);
    info!(
        "fronting {} backend(s), max {} sessions each",
        config.backend_servers.len(),
        config.max_sessions_per_server
    );

    let metrics_registry = MetricsRegistry::new()?;
    let metrics = metrics_registry.collector();

    let registry = Arc::new(ServerRegistry::from_config(&config));
    let balancer = Arc::new(LoadBalancer::new(
        registry.clone(),
        config.clone(),
        metrics.clone(),
    ));
    let monitor = HealthMonitor::new(registry.clone(), metrics.clone(), &config);
    monitor.start();

    if config.metrics.enabled {
        let metrics_addr: SocketAddr = ([0, 0, 0, 0], config.metrics.port).into();
        start_metrics_server(metrics_addr, metrics_registry, config.metrics.path.clone())
            .await?;
    }

    let controller = Arc::new(Controller::new(
        config.clone(),
        registry,
        balancer,
        monitor.clone(),
        metrics,
    ));

    // Shutdown order: stop the monitor first, then drain the HTTP server.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    {
        let monitor = monitor.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            monitor.stop();
            let _ = shutdown_tx.send(true);
        });
    }

    let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
    info!("starting session gateway on {}", addr);

    ServerBuilder::new(addr)
        .with_handler(RequestHandler::new(controller))
        .serve_until(shutdown_rx)
        .await?;

    info!("shutdown complete");
    Ok(())
}

fn init_tracing() -> Result<()> {
    let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("session_gateway={level}").parse()?)
                .add_directive("hyper=info".parse()?),
        )
        .init();
    Ok(())
}

async fn start_metrics_server(
    addr: SocketAddr,
    registry: MetricsRegistry,
    path: String,
) -> Result<()> {
    let registry = Arc::new(registry);
    let metrics_path = Arc::new(path);
    let service_path = metrics_path.clone();

    let make_service = hyper::service::make_service_fn(move |_| {
        let registry = registry.clone();
        let path = service_path.clone();

        async move {
            Ok::<_, Infallible>(hyper::service::service_fn(move |req: Request<Body>| {
                let registry = registry.clone();
                let path = path.clone();

                async move {
                    if req.uri().path() == path.as_str() {
                        let metrics = registry.gather();
                        Ok::<_, Infallible>(
                            Response::builder()
                                .status(StatusCode::OK)
                                .header("Content-Type", "text/plain; version=0.0.4")
                                .body(Body::from(metrics))
                                .unwrap(),
                        )
                    } else {
                        Ok::<_, Infallible>(
                            Response::builder()
                                .status(StatusCode::NOT_FOUND)
                                .body(Body::from("Not Found"))
                                .unwrap(),
                        )
                    }
                }
            }))
        }
    });

    let server = Server::bind(&addr).serve(make_service);

    info!(
        "metrics server listening on http://{}{}",
        addr,
        metrics_path.as_str()
    );

    tokio::spawn(async move {
        if let Err(e) = server.await {
            error!("metrics server error: {}", e);
        }
    });

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}
