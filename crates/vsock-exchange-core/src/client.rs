//! Client endpoint: connect, send one payload, shut down.
//!
//! The payload goes out in a single send call and no response is read. The
//! byte count is checked: zero bytes fails with
//! [`ExchangeError::NothingSent`], a partial write fails with
//! [`ExchangeError::ShortSend`]. Either way the connection is not shut down.

use crate::address::AddressDescriptor;
use crate::config::ExchangeConfig;
use crate::error::{ExchangeError, Result};
use crate::socket::SocketHandle;
use crate::transport::Transport;
use serde::Serialize;
use tracing::{debug, info, warn};

/// Client endpoint settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Address to connect to.
    pub remote: AddressDescriptor,
    /// Bytes to transmit.
    pub payload: Vec<u8>,
}

impl ClientConfig {
    /// Target `(cid, port)` with the default payload.
    pub fn new(cid: u32, port: u32) -> Self {
        Self {
            remote: AddressDescriptor::remote(cid, port),
            ..Self::default()
        }
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            remote: AddressDescriptor::remote(
                ExchangeConfig::CLIENT_REMOTE_CID,
                ExchangeConfig::PORT,
            ),
            payload: ExchangeConfig::PAYLOAD.to_vec(),
        }
    }
}

/// What a completed client run did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendReport {
    pub local: Option<AddressDescriptor>,
    pub remote: AddressDescriptor,
    pub bytes_sent: usize,
}

/// Run the whole client side: connect, send the payload once, shut down.
pub fn run_client<T: Transport>(transport: &T, config: &ClientConfig) -> Result<SendReport> {
    let mut socket = SocketHandle::create(transport)?;

    debug!("Connecting to {} over {}", config.remote, transport.name());
    socket.connect(&config.remote)?;
    let local = socket.local_addr();
    info!("Connected to {}", config.remote);

    let expected = config.payload.len();
    let sent = socket.send(&config.payload)?;
    if sent == 0 {
        return Err(ExchangeError::NothingSent {
            addr: config.remote,
        });
    }
    if sent < expected {
        warn!("Only {} of {} bytes went out", sent, expected);
        return Err(ExchangeError::ShortSend {
            addr: config.remote,
            sent,
            expected,
        });
    }
    debug!("Sent {} bytes", sent);

    socket.shutdown()?;
    info!("Sent {} bytes to {}", sent, config.remote);

    Ok(SendReport {
        local,
        remote: config.remote,
        bytes_sent: sent,
    })
}
