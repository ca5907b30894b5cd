//! Command handlers.
//!
//! Endpoints are blocking, so each one runs on the blocking pool. The outer
//! `anyhow::Result` carries runtime failures (join errors, signal setup); the
//! inner [`Outcome`] is the exchange result itself.

use anyhow::Result;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::info;
use vsock_exchange::{
    run_client, ClientConfig, DrainReport, LoopbackTransport, SendReport, Server, ServerConfig,
};

/// Exit status for a failed exchange (-1 as a byte).
pub const FAILURE_STATUS: u8 = 255;

/// What a command produced.
#[derive(Debug, Serialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Report {
    Server(DrainReport),
    Client(SendReport),
    Pair {
        server: DrainReport,
        client: SendReport,
    },
}

pub type Outcome = vsock_exchange::Result<Report>;

/// JSON line printed by `--json`.
pub fn outcome_json(outcome: &Outcome) -> Value {
    match outcome {
        Ok(report) => json!({
            "ok": true,
            "code": 0,
            "report": report,
        }),
        Err(e) => json!({
            "ok": false,
            "code": e.exit_code(),
            "step": e.step().as_str(),
            "error": e.to_string(),
        }),
    }
}

/// Run the server endpoint over AF_VSOCK until the peer closes or Ctrl-C.
#[cfg(target_os = "linux")]
pub async fn serve(config: ServerConfig) -> Result<Outcome> {
    use tracing::warn;
    use vsock_exchange::server::is_peer_reset;
    use vsock_exchange::{run_server, VsockTransport};

    info!("Starting vsock server on {}", config.bind);
    let task = tokio::task::spawn_blocking(move || run_server(&VsockTransport::new(), &config));

    tokio::select! {
        joined = task => {
            let outcome = joined?;
            if let Err(e) = &outcome {
                if is_peer_reset(e) {
                    warn!("Peer reset the connection before closing it");
                }
            }
            Ok(outcome.map(Report::Server))
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            warn!("Shutdown signal received before the exchange finished");
            // The blocking accept/recv cannot be cancelled, so leave without
            // waiting for the runtime to drain it.
            std::process::exit(i32::from(FAILURE_STATUS));
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub async fn serve(_config: ServerConfig) -> Result<Outcome> {
    anyhow::bail!("AF_VSOCK is only available on Linux; use `pair` instead")
}

/// Run the client endpoint over AF_VSOCK.
#[cfg(target_os = "linux")]
pub async fn send(config: ClientConfig) -> Result<Outcome> {
    use vsock_exchange::VsockTransport;

    info!("Sending {} bytes to {}", config.payload.len(), config.remote);
    let outcome =
        tokio::task::spawn_blocking(move || run_client(&VsockTransport::new(), &config)).await?;
    Ok(outcome.map(Report::Client))
}

#[cfg(not(target_os = "linux"))]
pub async fn send(_config: ClientConfig) -> Result<Outcome> {
    anyhow::bail!("AF_VSOCK is only available on Linux; use `pair` instead")
}

/// Run both endpoints in-process over the loopback transport.
///
/// The server is listening before the client starts, so the client never
/// races the bind.
pub async fn pair(cid: u32, port: u32, payload: String) -> Result<Outcome> {
    let transport = LoopbackTransport::new(cid);
    let listener = match Server::listen(&transport, &ServerConfig::new(cid, port)) {
        Ok(listener) => listener,
        Err(e) => return Ok(Err(e)),
    };
    info!("Loopback pair on {}", listener.local_addr());

    let client_config = ClientConfig::new(cid, port).with_payload(payload);
    let server = tokio::task::spawn_blocking(move || listener.accept_and_drain());
    let client = tokio::task::spawn_blocking(move || run_client(&transport, &client_config));

    let (server, client) = tokio::try_join!(server, client)?;
    Ok(match (server, client) {
        (Ok(server), Ok(client)) => Ok(Report::Pair { server, client }),
        (Err(e), _) | (_, Err(e)) => Err(e),
    })
}
