//! `rust_scope` command line entry point.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_scope::config::{ScopeConfig, DEFAULT_CONFIG_PATH};
use rust_scope::logging;
use rust_scope::messaging::EchoDevice;
use rust_scope::properties::PropertyClient;
use rust_scope::rpc::{HeartbeatClient, HeartbeatMonitor, RpcClient};
use rust_scope::scope::ScopeServer;
use serde_json::{Map, Value};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Override the configured log level
    #[arg(long)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Open all devices and serve RPC, interrupts, properties and heartbeat
    Serve,
    /// List the commands offered by a running server
    Describe,
    /// Call one command; arguments are parsed as JSON, falling back to strings
    Call {
        /// Dotted command name, e.g. scope.stage.send_message
        command: String,
        /// Positional arguments
        args: Vec<String>,
        /// Keyword arguments as key=value
        #[arg(long = "kw", value_parser = parse_kwarg)]
        kwargs: Vec<(String, Value)>,
    },
    /// Print property updates under a prefix until Ctrl-C
    Watch {
        /// Dotted prefix; empty watches everything
        #[arg(default_value = "")]
        prefix: String,
        /// Ask the server to resend all values first
        #[arg(long)]
        rebroadcast: bool,
    },
    /// Report when a running server stops sending heartbeats, until Ctrl-C
    Heartbeat {
        /// Missed checks before reporting
        #[arg(long, default_value_t = 3)]
        max_missed: u32,
    },
    /// Run a simulated device that echoes messages back after a random delay
    EchoDevice {
        #[arg(long, default_value = "127.0.0.1:4001")]
        listen: String,
        #[arg(long, default_value_t = 100)]
        max_delay_ms: u64,
        #[arg(long, default_value = "\r")]
        terminator: String,
    },
    /// Print the effective configuration as TOML
    Config,
}

fn parse_json_or_string(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn parse_kwarg(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    Ok((key.to_string(), parse_json_or_string(value)))
}

/// Run `on_signal` on a helper thread once Ctrl-C is pressed.
fn on_ctrl_c<F>(on_signal: F) -> Result<()>
where
    F: FnOnce() + Send + 'static,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building signal runtime")?;
    thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            match runtime.block_on(tokio::signal::ctrl_c()) {
                Ok(()) => {
                    info!("Ctrl-C received, shutting down");
                    on_signal();
                }
                Err(e) => error!("could not listen for Ctrl-C: {}", e),
            }
        })?;
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ScopeConfig::load_from(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config))?;
    logging::init(
        cli.log_level
            .as_deref()
            .unwrap_or(&config.application.log_level),
        config.application.json_logs,
    );

    match cli.command {
        Commands::Serve => {
            let server = ScopeServer::bind(&config).context("starting scope server")?;
            let handle = server.handle();
            on_ctrl_c(move || handle.stop())?;
            info!("serving on {}", server.rpc_addr()?);
            server.run()?;
        }
        Commands::Describe => {
            let client = RpcClient::connect(config.server.rpc_addr())?;
            for command in client.describe()? {
                println!("{}{}", command.name, command.params.signature());
                if !command.doc.is_empty() {
                    println!("    {}", command.doc);
                }
            }
        }
        Commands::Call {
            command,
            args,
            kwargs,
        } => {
            let client = RpcClient::connect_with_interrupt(
                config.server.rpc_addr(),
                config.server.interrupt_addr(),
            )?;
            let interrupt = client.interrupt_handle();
            on_ctrl_c(move || interrupt.interrupt())?;
            let args = args.iter().map(|a| parse_json_or_string(a)).collect();
            let kwargs: Map<String, Value> = kwargs.into_iter().collect();
            let retval = client.call(&command, args, kwargs)?;
            println!("{}", serde_json::to_string_pretty(&retval)?);
        }
        Commands::Watch {
            prefix,
            rebroadcast,
        } => {
            let properties = PropertyClient::connect(config.server.property_addr())?;
            properties.subscribe_prefix(&prefix, |name, value| println!("{name} = {value}"));
            if rebroadcast {
                // Give the server a moment to register this subscriber.
                thread::sleep(Duration::from_millis(200));
                let client = RpcClient::connect(config.server.rpc_addr())?;
                client.call(
                    &format!("{}.rebroadcast_properties", config.application.name),
                    Vec::new(),
                    Map::new(),
                )?;
            }
            let (stop_tx, stop_rx) = mpsc::channel();
            on_ctrl_c(move || {
                let _ = stop_tx.send(());
            })?;
            let _ = stop_rx.recv();
        }
        Commands::Heartbeat { max_missed } => {
            let addr = config.server.heartbeat_addr();
            // Check a little less often than the server beats.
            let check = config.server.heartbeat_interval() * 3 / 2;
            let error_addr = addr.clone();
            let clear_addr = addr.clone();
            let monitor = HeartbeatMonitor::new(check, max_missed)
                .on_error(move || warn!("server at {} is not beating", error_addr))
                .on_clear(move || info!("server at {} is beating again", clear_addr));
            let _watcher = HeartbeatClient::start(addr.as_str(), monitor)?;
            let (stop_tx, stop_rx) = mpsc::channel();
            on_ctrl_c(move || {
                let _ = stop_tx.send(());
            })?;
            let _ = stop_rx.recv();
        }
        Commands::EchoDevice {
            listen,
            max_delay_ms,
            terminator,
        } => {
            let server = EchoDevice::new(terminator.as_bytes())
                .with_max_delay(Duration::from_millis(max_delay_ms))
                .listen(listen.as_str())?;
            let flag = server.stop_flag();
            on_ctrl_c(move || flag.store(false, std::sync::atomic::Ordering::SeqCst))?;
            server.join();
        }
        Commands::Config => {
            print!("{}", config.to_toml_string()?);
        }
    }
    Ok(())
}
