use bifrost_tunnel::config::{Config, LogOutputType, LogTarget, LoggingConfig, ServerAddr};
use bifrost_tunnel::config_validation::ConfigValidator;
use bifrost_tunnel::logging::{self, CustomLogger};
use bifrost_tunnel::ProxyClient;
use clap::Parser;
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[clap(
    version,
    about = "Forwards local TCP clients to a fixed destination through an HTTP CONNECT proxy"
)]
struct Args {
    #[clap(short, long, value_name = "HOST:PORT", help = "Local listen address (e.g., 127.0.0.1:2222)")]
    listen: Option<String>,

    #[clap(short, long, value_name = "HOST:PORT", help = "Destination opened through the proxy (e.g., ssh.example.com:22)")]
    target: Option<String>,

    #[clap(short = 'r', long = "proxy", value_name = "HOST:PORT", help = "Upstream HTTP proxy (e.g., proxy.corp:3128)")]
    proxy: Option<String>,

    #[clap(short, long, value_name = "FILE", help = "Configuration file path")]
    config: Option<String>,

    #[clap(long, value_name = "FILE", help = "Generate a sample configuration file")]
    generate_config: Option<String>,

    #[clap(long, value_name = "USERNAME", help = "Username for proxy authentication (Basic Auth)")]
    proxy_username: Option<String>,

    #[clap(long, value_name = "PASSWORD", help = "Password for proxy authentication (Basic Auth)")]
    proxy_password: Option<String>,

    #[clap(long, value_name = "NUM", help = "Maximum idle tunnels kept for reuse")]
    pool_capacity: Option<usize>,

    #[clap(long, value_name = "BYTES", help = "Maximum proxy response header size in bytes")]
    max_header_size: Option<usize>,

    #[clap(long, value_name = "BYTES", help = "Client bytes held in memory per tunnel before spilling to disk")]
    cache_memory_limit: Option<usize>,

    #[clap(long, value_name = "BYTES", help = "Unsent bytes per connection before the other side stops being read")]
    max_pending_bytes: Option<usize>,

    #[clap(long, value_name = "DIR", help = "Directory for spill files (default: system temp dir)")]
    cache_dir: Option<PathBuf>,

    #[clap(long, value_name = "LEVEL", help = "Log level: trace, debug, info, warn, error")]
    log_level: Option<String>,

    #[clap(long, value_name = "FORMAT", help = "Log format: text or json")]
    log_format: Option<String>,

    #[clap(long, value_name = "FILE", help = "Also append log lines to this file")]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if let Some(config_file) = &args.generate_config {
        Config::sample().to_file(config_file)?;
        println!("Sample configuration file generated: {}", config_file);
        return Ok(());
    }

    let mut config = if let Some(config_file) = &args.config {
        if !Path::new(config_file).exists() {
            return Err(format!("Configuration file not found: {}", config_file).into());
        }
        Config::from_file(config_file)?
    } else {
        Config::default()
    };
    apply_args(&mut config, &args)?;
    init_logging(&config, &args)?;

    let validation = ConfigValidator::validate(&config);
    for warning in &validation.warnings {
        warn!("{}", warning);
    }
    for suggestion in &validation.suggestions {
        info!("suggestion: {}", suggestion);
    }
    if !validation.is_valid {
        for e in &validation.errors {
            error!("{}", e);
        }
        return Err(format!("Invalid configuration: {}", validation.errors.join("; ")).into());
    }

    let listen = config
        .listen_addr
        .as_ref()
        .ok_or("listen address is required")?
        .to_string();

    let mut client = ProxyClient::from_config(&config)?;
    client.initialise(&listen)?;
    let exit = client.exit_handle();
    let metrics = client.metrics();

    info!("Starting tunnel client on {}...", listen);
    let mut worker = tokio::task::spawn_blocking(move || {
        let result = client.run_loop();
        client.finalise();
        result
    });

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut quit = signal(SignalKind::quit())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut pipe = signal(SignalKind::pipe())?;

    let outcome = loop {
        tokio::select! {
            _ = interrupt.recv() => {
                info!("SIGINT received, shutting down...");
                exit.exit_loop();
            }
            _ = quit.recv() => {
                info!("SIGQUIT received, shutting down...");
                exit.exit_loop();
            }
            _ = terminate.recv() => {
                info!("SIGTERM received, shutting down...");
                exit.exit_loop();
            }
            _ = pipe.recv() => {
                warn!("SIGPIPE received, ignored");
            }
            result = &mut worker => break result,
        }
    };

    info!("Final stats: {}", metrics.get_metrics_summary().to_json());
    match outcome {
        Ok(Ok(())) => {
            info!("Tunnel client stopped.");
            Ok(())
        }
        Ok(Err(e)) if e.is_fatal() => {
            error!("Event loop stopped by a setup failure: {}", e);
            Err(e.into())
        }
        Ok(Err(e)) => {
            error!("Event loop failed: {}", e);
            Err(e.into())
        }
        Err(e) => Err(format!("Event loop task failed: {}", e).into()),
    }
}

/// Command-line values take precedence over the configuration file.
fn apply_args(config: &mut Config, args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(listen) = &args.listen {
        config.listen_addr = Some(ServerAddr::parse(listen)?);
    }
    if let Some(target) = &args.target {
        config.dest_addr = Some(ServerAddr::parse(target)?);
    }
    if let Some(proxy) = &args.proxy {
        config.proxy_addr = Some(ServerAddr::parse(proxy)?);
    }
    if args.proxy_username.is_some() {
        config.proxy_username = args.proxy_username.clone();
    }
    if args.proxy_password.is_some() {
        config.proxy_password = args.proxy_password.clone();
    }
    if args.pool_capacity.is_some() {
        config.pool_capacity = args.pool_capacity;
    }
    if args.max_header_size.is_some() {
        config.max_header_size = args.max_header_size;
    }
    if args.cache_memory_limit.is_some() {
        config.cache_memory_limit = args.cache_memory_limit;
    }
    if args.max_pending_bytes.is_some() {
        config.max_pending_bytes = args.max_pending_bytes;
    }
    if args.cache_dir.is_some() {
        config.cache_dir = args.cache_dir.clone();
    }
    Ok(())
}

fn init_logging(config: &Config, args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let logging = match (config.logging.clone(), &args.log_file) {
        (Some(logging), log_file) => Some(with_log_file(logging, log_file)),
        (None, Some(log_file)) => Some(with_log_file(
            LoggingConfig {
                level: None,
                format: None,
                targets: Some(vec![LogTarget {
                    output_type: LogOutputType::Stderr,
                    path: None,
                    level: None,
                }]),
            },
            &Some(log_file.clone()),
        )),
        (None, None) => None,
    };

    match logging {
        Some(mut logging) => {
            if let Some(level) = &args.log_level {
                logging.level = Some(logging::parse_log_level(level)?);
            }
            if let Some(format) = &args.log_format {
                logging.format = Some(logging::parse_log_format(format)?);
            }
            CustomLogger::init(logging)
        }
        None => logging::init_fallback(args.log_level.as_deref(), args.log_format.as_deref()),
    }
}

fn with_log_file(mut logging: LoggingConfig, log_file: &Option<PathBuf>) -> LoggingConfig {
    if let Some(path) = log_file {
        logging.targets.get_or_insert_with(Vec::new).push(LogTarget {
            output_type: LogOutputType::File,
            path: Some(path.clone()),
            level: None,
        });
    }
    logging
}
