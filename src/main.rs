//! ed2k-server - Main entry point

use anyhow::{Context, Result};
use ed2k_server::{
    CliArgs, Config, MemoryDirectory, ServerContext, SessionRegistry, TcpReachabilityProbe, TcpService,
    UdpKeyspace, UdpObfuscation, UdpService,
};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

/// Set up panic handler for unexpected errors
fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();
        match panic_info.location() {
            Some(location) => error!(
                "PANIC occurred at {}:{}:{}",
                location.file(),
                location.line(),
                location.column()
            ),
            None => error!("PANIC occurred at unknown location"),
        }
        let payload = panic_info.payload();
        if let Some(s) = payload.downcast_ref::<&str>() {
            error!("Panic message: {}", s);
        } else if let Some(s) = payload.downcast_ref::<String>() {
            error!("Panic message: {}", s);
        } else {
            error!("Panic message: unknown");
        }
        error!("Backtrace:\n{:?}", backtrace);
    }));
}

fn init_logging(args: &CliArgs) {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(args.log_level())
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if args.is_verbose() {
        subscriber.pretty().init();
    } else {
        subscriber.compact().init();
    }
    debug!("Logging initialized at {:?}", args.log_level());
}

fn build_context(config: &Config) -> Result<Arc<ServerContext>> {
    let info = config.server_info();
    info!("Server hash: {}", hex::encode(info.hash));

    let directory = MemoryDirectory::new(config.known_servers()?);
    let probe = TcpReachabilityProbe::new(config.probe_identity(), config.timeout(), config.obfuscation);

    Ok(Arc::new(ServerContext {
        info,
        directory: Arc::new(directory),
        registry: SessionRegistry::new(config.low_id_pool()),
        probe: Arc::new(probe),
        handshake: config.handshake_strategy(),
        handshake_timeout: config.timeout(),
    }))
}

async fn start_services(config: &Config, ctx: Arc<ServerContext>) -> Result<JoinSet<Result<()>>> {
    let mut services = JoinSet::new();

    let tcp = TcpService::bind(ctx.clone(), config.tcp_addr(), false).await?;
    services.spawn(tcp.run());
    let udp = UdpService::bind(ctx.clone(), config.udp_addr(), None).await?;
    services.spawn(udp.run());

    if config.obfuscation {
        let tcp = TcpService::bind(ctx.clone(), config.tcp_obfuscated_addr(), true).await?;
        services.spawn(tcp.run());

        let keyspace = Arc::new(UdpKeyspace::build(config.udp_server_key));
        let udp = UdpService::bind(ctx, config.udp_obfuscated_addr(), Some(UdpObfuscation::server(keyspace))).await?;
        services.spawn(udp.run());
    }

    Ok(services)
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_panic_handler();

    let args = CliArgs::parse_args();
    init_logging(&args);
    debug!("CLI arguments: {:?}", args);

    let config = Config::from_args(&args).context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    info!("{} starting", config.name);
    let ctx = build_context(&config)?;
    let mut services = start_services(&config, ctx.clone())
        .await
        .context("Failed to start listeners")?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down ({} connections open)", ctx.registry.connection_count());
        }
        Some(finished) = services.join_next() => {
            match finished {
                Ok(Ok(())) => info!("A listener stopped"),
                Ok(Err(e)) => error!("Listener failed: {}", e),
                Err(e) => error!("Listener task panicked: {}", e),
            }
        }
    }

    services.shutdown().await;
    Ok(())
}
