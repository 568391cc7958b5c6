use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};

use svcgw::config::{Configuration, DispatchingMode, Startup};
use svcgw::consul::ConsulClient;
use svcgw::dispatcher::build_gateway;
use svcgw::http::HttpClient;
use svcgw::monitoring::{Metrics, MonitoringController, monitoring_router};

/// svcgw - microservice API gateway
///
/// Dispatches requests to backend services based on a JSON configuration
/// file, with optional overrides from the Consul KV store. Runs three
/// listeners: the proxy itself, a private administration API and a
/// monitoring endpoint.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Configuration file
    #[arg(
        long = "config",
        short = 'c',
        env = "SVCGW_CONFIG",
        value_name = "FILE",
        default_value = "/etc/servicegateway.json"
    )]
    config_file: PathBuf,

    /// Dispatching mode
    #[arg(long = "dispatch", value_enum, default_value = "path")]
    dispatching_mode: DispatchingMode,

    /// HTTP port to listen on
    #[arg(long = "port", short = 'p', default_value_t = 8080)]
    port: u16,

    /// Address to listen on (administration port)
    #[arg(long = "admin-addr", default_value = "127.0.0.1")]
    admin_address: String,

    /// HTTP port to listen on (administration port)
    #[arg(long = "admin-port", default_value_t = 8081)]
    admin_port: u16,

    /// Address to listen on (monitoring port)
    #[arg(long = "monitor-addr", default_value = "0.0.0.0")]
    monitor_address: String,

    /// HTTP port to listen on (monitoring port)
    #[arg(long = "monitor-port", default_value_t = 8082)]
    monitor_port: u16,

    /// Base key name for configuration in the Consul KV store
    #[arg(long = "consul-base", default_value = "gateway/ui")]
    consul_base_key: String,

    /// Add debug information to each response
    #[arg(long = "debug", default_value_t = false)]
    debug: bool,
}

impl Cli {
    fn into_startup(self) -> Startup {
        Startup {
            config_file: self.config_file,
            dispatching_mode: self.dispatching_mode,
            consul_base_key: self.consul_base_key,
            port: self.port,
            admin_address: self.admin_address,
            admin_port: self.admin_port,
            monitor_address: self.monitor_address,
            monitor_port: self.monitor_port,
            debug: self.debug,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let startup = Cli::parse().into_startup();

    let cfg = Configuration::from_file(&startup.config_file)?;
    info!("completed startup");

    let metrics = Arc::new(Metrics::new());

    let consul = cfg.consul.enabled().then(|| {
        Arc::new(ConsulClient::new(
            HttpClient::new(reqwest::Client::new()),
            &cfg.consul,
        ))
    });

    let monitoring = MonitoringController::new(consul.clone(), startup.monitor_port);

    let build = build_gateway(&startup, &cfg, consul.as_deref(), metrics.clone()).await?;

    let listen_address = format!("0.0.0.0:{}", startup.port);
    let admin_address = format!("{}:{}", startup.admin_address, startup.admin_port);
    let monitor_address = format!("{}:{}", startup.monitor_address, startup.monitor_port);

    let proxy_listener = tokio::net::TcpListener::bind(&listen_address)
        .await
        .with_context(|| format!("could not bind {}", listen_address))?;
    let admin_listener = tokio::net::TcpListener::bind(&admin_address)
        .await
        .with_context(|| format!("could not bind {}", admin_address))?;
    let monitor_listener = tokio::net::TcpListener::bind(&monitor_address)
        .await
        .with_context(|| format!("could not bind {}", monitor_address))?;

    monitoring.register().await?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received interrupt signal");
            let _ = shutdown_tx.send(true);
        }
    });

    let wait_for_shutdown = |mut rx: tokio::sync::watch::Receiver<bool>| async move {
        let _ = rx.wait_for(|stop| *stop).await;
    };

    info!("starting dispatcher on address {}", listen_address);
    let proxy_server = axum::serve(
        proxy_listener,
        build
            .app_router
            .into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(wait_for_shutdown(shutdown_rx.clone()));

    info!("starting admin server on address {}", admin_address);
    let admin_server = axum::serve(
        admin_listener,
        build
            .admin_router
            .into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(wait_for_shutdown(shutdown_rx.clone()));

    info!("starting monitoring server on address {}", monitor_address);
    let monitor_server = axum::serve(
        monitor_listener,
        monitoring_router(metrics).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(wait_for_shutdown(shutdown_rx));

    let (proxy_result, admin_result, monitor_result) =
        tokio::join!(proxy_server, admin_server, monitor_server);
    for result in [proxy_result, admin_result, monitor_result] {
        if let Err(e) = result {
            error!("server error: {}", e);
        }
    }

    monitoring.deregister().await?;
    info!("everything has shut down. exiting process.");

    Ok(())
}
