//! Tunlens command line tool
//!
//! Attaches the proxy core to an inherited tun file descriptor, prints the
//! event stream as JSON lines, and can export the root CA certificate for
//! installation into a trust store.

use clap::Parser;
use log::{info, warn};

use tunlens::common::{
    init_logger, parse_socket_addr, ArcProtector, DeviceProtector, NullProtector,
    ProxyError, Result,
};
use tunlens::config::{Config, ENV_PREFIX};
use tunlens::event;
use tunlens::intercept::{MitmContext, RedirectMap};
use tunlens::proxy::Engine;
use tunlens::tls::CaManager;
use tunlens::{APP_NAME, VERSION};

use std::env;
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// Tunlens: transparent TLS-intercepting proxy over a tun interface
#[derive(Parser, Debug)]
#[clap(author, version = VERSION, about, long_about = None)]
struct Args {
    /// File descriptor of the externally-created tun device
    #[clap(long)]
    tun_fd: Option<i32>,

    /// Listen address for the local intercept listener
    #[clap(short, long, default_value = "127.0.0.1:8889")]
    listen: String,

    /// Path of the password-protected CA store
    #[clap(long, default_value = "ca_keystore.p12")]
    ca_store: String,

    /// Uplink interface outbound sockets are bound to (routing-loop guard)
    #[clap(long)]
    bind_device: Option<String>,

    /// Verify upstream server certificates instead of trusting any chain
    #[clap(long)]
    verify_upstream: bool,

    /// Log level
    #[clap(long, default_value = "info")]
    log_level: String,

    /// Load configuration from a file
    #[clap(long)]
    config_file: Option<String>,

    /// Load configuration from environment variables
    #[clap(long)]
    from_env: bool,

    /// Write the root CA certificate (PEM) to this path and exit
    #[clap(long)]
    export_ca: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logger(&args.log_level);
    info!("Starting {} v{}", APP_NAME, VERSION);

    let mut config = Config::default();

    // Configuration priority: defaults < file < environment < command line
    if let Some(config_file) = args.config_file.as_deref() {
        if Path::new(config_file).exists() {
            info!("Loading configuration from file: {}", config_file);
            config = config.merge(Config::from_file(Path::new(config_file))?);
        } else {
            warn!("Configuration file not found: {}", config_file);
        }
    }

    if args.from_env {
        info!("Loading configuration from environment variables");
        config = config.merge(config_from_env()?);
    }

    config = config.merge(config_from_args(&args)?);
    config.validate()?;

    let config = Arc::new(config);
    info!("Intercept listener: {}", config.listen);
    info!("Intercepted ports: {:?}", config.intercept_ports);
    info!("CA store: {}", config.ca_store_path.display());
    if config.verify_upstream {
        info!("Upstream certificate verification enabled");
    } else {
        warn!("Upstream certificate verification disabled (interception mode)");
    }

    let ca = Arc::new(CaManager::new(&config.ca_store_path, &config.ca_password));

    // Export mode: bootstrap, write the PEM, and exit
    if let Some(export_path) = args.export_ca.as_deref() {
        ca.ensure_root().await?;
        let pem = ca.export_root_pem()?;
        fs::write(export_path, pem).map_err(ProxyError::Io)?;
        info!("Root CA certificate written to {}", export_path);
        info!("Fingerprint: {}", ca.root_fingerprint()?);
        return Ok(());
    }

    let Some(tun_fd) = args.tun_fd else {
        return Err(ProxyError::Config(
            "no tun device supplied (--tun-fd); nothing to proxy".to_string(),
        ));
    };
    let device = device_from_fd(tun_fd)?;

    let protector: ArcProtector = match config.bind_device.as_deref() {
        Some(device) => {
            info!("Protecting outbound sockets via {}", device);
            Arc::new(DeviceProtector::new(device))
        }
        None => {
            warn!("No --bind-device given; routing must exclude this process");
            Arc::new(NullProtector)
        }
    };

    let (events, mut event_rx) = event::channel();
    let ctx = Arc::new(MitmContext::new(&config, ca, events, protector));
    let redirects = Arc::new(RedirectMap::new());

    // The event stream is the sole outbound interface; this binary prints
    // it as JSON lines
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!("unserializable event: {}", e),
            }
        }
    });

    let engine = Engine::new(Arc::clone(&config), ctx, redirects);
    let mut handle = engine.start(device).await?;

    info!("Proxy ready, press Ctrl+C to stop");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
        _ = handle.wait() => info!("Tun device closed"),
    }
    handle.stop().await;

    Ok(())
}

fn config_from_env() -> Result<Config> {
    let get_env = |name: &str| env::var(format!("{}{}", ENV_PREFIX, name)).ok();
    let mut config = Config::default();

    if let Some(listen) = get_env("LISTEN") {
        config.listen = parse_socket_addr(&listen)?;
    }
    if let Some(ca_store) = get_env("CA_STORE") {
        config.ca_store_path = ca_store.into();
    }
    if let Some(ca_password) = get_env("CA_PASSWORD") {
        config.ca_password = ca_password;
    }
    if let Some(bind_device) = get_env("BIND_DEVICE") {
        config.bind_device = Some(bind_device);
    }
    if let Some(log_level) = get_env("LOG_LEVEL") {
        config.log_level = log_level;
    }
    if let Some(verify) = get_env("VERIFY_UPSTREAM") {
        config.verify_upstream = verify.to_lowercase() == "true";
    }

    Ok(config)
}

fn config_from_args(args: &Args) -> Result<Config> {
    let mut config = Config::default();

    config.listen = parse_socket_addr(&args.listen)?;
    config.ca_store_path = args.ca_store.clone().into();
    config.bind_device = args.bind_device.clone();
    config.log_level = args.log_level.clone();
    if args.verify_upstream {
        config.verify_upstream = true;
    }

    Ok(config)
}

#[cfg(unix)]
fn device_from_fd(fd: i32) -> Result<tokio::fs::File> {
    use std::os::unix::io::FromRawFd;

    // The launcher hands this descriptor over for exclusive use
    let file = unsafe { std::fs::File::from_raw_fd(fd) };
    Ok(tokio::fs::File::from_std(file))
}

#[cfg(not(unix))]
fn device_from_fd(_fd: i32) -> Result<tokio::fs::File> {
    Err(ProxyError::Config(
        "inherited tun descriptors are only supported on unix".to_string(),
    ))
}
