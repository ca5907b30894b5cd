//! vsock-exchange - run either end of the one-shot vsock exchange.
//!
//! `serve` and `send` use real `AF_VSOCK` sockets. `pair` runs both ends in
//! one process over the loopback transport, which is handy on hosts without
//! vsock support.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::process::ExitCode;
use tracing::level_filters::LevelFilter;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use vsock_exchange::{ClientConfig, ExchangeConfig, LoopbackConfig, ServerConfig};

use commands::{Outcome, FAILURE_STATUS};

#[derive(Parser, Debug)]
#[command(name = "vsock-exchange")]
#[command(about = "One-shot byte-stream exchange over vsock")]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Print the run report as one JSON line on stdout
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept one connection and drain it until the peer closes
    Serve {
        /// Context identifier to bind to
        #[arg(long, default_value_t = ExchangeConfig::SERVER_BIND_CID)]
        cid: u32,

        /// Port to bind to
        #[arg(short, long, default_value_t = ExchangeConfig::PORT)]
        port: u32,

        /// Listen backlog
        #[arg(long, default_value_t = ExchangeConfig::LISTEN_BACKLOG)]
        backlog: u32,
    },

    /// Connect and send one payload
    Send {
        /// Context identifier to connect to
        #[arg(long, default_value_t = ExchangeConfig::CLIENT_REMOTE_CID)]
        cid: u32,

        /// Port to connect to
        #[arg(short, long, default_value_t = ExchangeConfig::PORT)]
        port: u32,

        /// Bytes to send
        #[arg(long, default_value = "hello")]
        payload: String,
    },

    /// Run both ends in-process over the loopback transport
    Pair {
        /// Context identifier shared by both ends
        #[arg(long, default_value_t = LoopbackConfig::DEFAULT_CID)]
        cid: u32,

        /// Port shared by both ends
        #[arg(short, long, default_value_t = ExchangeConfig::PORT)]
        port: u32,

        /// Bytes to send
        #[arg(long, default_value = "hello")]
        payload: String,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    // Set up logging; stdout is reserved for the JSON report
    let filter = log_filter(args.debug, std::env::var("RUST_LOG").ok().as_deref());
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let outcome = match args.command {
        Command::Serve { cid, port, backlog } => {
            let config = ServerConfig {
                backlog,
                ..ServerConfig::new(cid, port)
            };
            commands::serve(config).await?
        }
        Command::Send { cid, port, payload } => {
            let config = ClientConfig::new(cid, port).with_payload(payload);
            commands::send(config).await?
        }
        Command::Pair { cid, port, payload } => commands::pair(cid, port, payload).await?,
    };

    if args.json {
        println!("{}", serde_json::to_string(&commands::outcome_json(&outcome))?);
    }

    Ok(exit_status(&outcome))
}

/// `--debug` picks the default level; `RUST_LOG` directives refine it.
fn log_filter(debug: bool, directives: Option<&str>) -> EnvFilter {
    let level = if debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    EnvFilter::builder()
        .with_default_directive(level.into())
        .parse_lossy(directives.unwrap_or_default())
}

fn exit_status(outcome: &Outcome) -> ExitCode {
    match outcome {
        Ok(_) => {
            info!("Exchange complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Exchange failed at {}: {}", e.step(), e);
            ExitCode::from(FAILURE_STATUS)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serve_defaults() {
        let args = Args::try_parse_from(["vsock-exchange", "serve"]).unwrap();
        match args.command {
            Command::Serve { cid, port, backlog } => {
                assert_eq!(cid, 33);
                assert_eq!(port, 1234);
                assert_eq!(backlog, 1);
            }
            other => panic!("Expected serve, got: {:?}", other),
        }
        assert!(!args.debug);
        assert!(!args.json);
    }

    #[test]
    fn test_send_defaults() {
        let args = Args::try_parse_from(["vsock-exchange", "send"]).unwrap();
        match args.command {
            Command::Send { cid, port, payload } => {
                assert_eq!(cid, 2);
                assert_eq!(port, 1234);
                assert_eq!(payload, "hello");
            }
            other => panic!("Expected send, got: {:?}", other),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let args =
            Args::try_parse_from(["vsock-exchange", "pair", "--cid", "7", "--json", "-d"]).unwrap();
        assert!(args.json);
        assert!(args.debug);
        assert!(matches!(args.command, Command::Pair { cid: 7, .. }));
    }

    #[test]
    fn test_log_filter_levels() {
        assert_eq!(log_filter(false, None).max_level_hint(), Some(LevelFilter::INFO));
        assert_eq!(log_filter(true, None).max_level_hint(), Some(LevelFilter::DEBUG));
        assert_eq!(
            log_filter(false, Some("vsock_exchange=trace")).max_level_hint(),
            Some(LevelFilter::TRACE)
        );
    }

    #[test]
    fn test_rejects_non_numeric_port() {
        assert!(Args::try_parse_from(["vsock-exchange", "send", "--port", "http"]).is_err());
    }
}
