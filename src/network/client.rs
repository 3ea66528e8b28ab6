//! Registration Client
//!
//! Connects to a master and registers this client with it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;

use super::connection::{Connection, ConnectionError, PendingResponse};
use super::{MasterAddr, NetworkConfig};
use crate::protocol::{
    BincodeCodec, CodecError, MasterStatus, MessageCodec, RegistrationRequest,
    RegistrationResponse, SINGLE_SEGMENT,
};

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Serialization error: {0}")]
    Serialization(#[source] CodecError),

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Not connected")]
    NotConnected,

    #[error("Registration rejected: {status}: {message}")]
    Rejected { status: MasterStatus, message: String },
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Registration lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Disconnected,
    Connecting,
    Connected,
    Registering,
    Registered,
    RegistrationFailed,
    Closed,
}

/// Client that registers with a master over one connection
pub struct RegistrationClient {
    /// Network configuration
    config: NetworkConfig,
    /// Turns messages into payloads
    codec: Arc<dyn MessageCodec>,
    /// Current state
    state: Arc<RwLock<RegistrationState>>,
    /// Live connection, if any
    connection: RwLock<Option<Arc<Connection>>>,
}

impl RegistrationClient {
    /// Create a client using the default message codec
    pub fn new(config: NetworkConfig) -> Self {
        Self::with_codec(config, BincodeCodec)
    }

    /// Create a client that serializes messages with `codec`
    pub fn with_codec(config: NetworkConfig, codec: impl MessageCodec) -> Self {
        Self {
            config,
            codec: Arc::new(codec),
            state: Arc::new(RwLock::new(RegistrationState::Disconnected)),
            connection: RwLock::new(None),
        }
    }

    /// Connect to a master by socket address.
    ///
    /// A failure is returned as is; trying again or trying another master
    /// is up to the caller.
    pub async fn connect(&self, addr: SocketAddr) -> ClientResult<()> {
        {
            let mut state = self.state.write().await;
            let live = self
                .connection
                .read()
                .await
                .as_ref()
                .is_some_and(|conn| !conn.is_closed());

            if live || *state == RegistrationState::Connecting {
                return Err(ClientError::AlreadyConnected);
            }
            *state = RegistrationState::Connecting;
        }

        match Connection::connect(addr, &self.config).await {
            Ok(conn) => {
                *self.connection.write().await = Some(Arc::new(conn));
                self.set_state(RegistrationState::Connected).await;
                tracing::info!("Connected to master at {}", addr);
                Ok(())
            }
            Err(e) => {
                self.set_state(RegistrationState::Disconnected).await;
                tracing::warn!("Could not connect to master at {}: {}", addr, e);
                Err(e.into())
            }
        }
    }

    /// Resolve a master address and connect to it
    pub async fn connect_master(&self, master: &MasterAddr) -> ClientResult<()> {
        let addr = master.resolve().await?;
        self.connect(addr).await
    }

    /// Send a registration request.
    ///
    /// Returns as soon as the frame is written; the handle waits for the
    /// master's answer. Serialization and framing failures leave the
    /// connection usable; a socket failure closes it.
    pub async fn register(&self, request: &RegistrationRequest) -> ClientResult<PendingRegistration> {
        let conn = self.live_connection().await?;

        let payload = self
            .codec
            .encode_request(request)
            .map_err(ClientError::Serialization)?;

        let previous = std::mem::replace(
            &mut *self.state.write().await,
            RegistrationState::Registering,
        );

        let pending = match conn.send_request(SINGLE_SEGMENT, &payload).await {
            Ok(pending) => pending,
            Err(e) if e.is_fatal() => {
                tracing::warn!("Registration with {} failed: {}", conn.remote_addr(), e);
                conn.close().await;
                self.set_state(RegistrationState::Closed).await;
                return Err(e.into());
            }
            Err(e) => {
                self.set_state(previous).await;
                return Err(e.into());
            }
        };

        tracing::info!(
            "Registering {} ({}) with serial {}",
            request.client_id,
            request.host_name,
            pending.serial_number()
        );

        Ok(PendingRegistration {
            pending,
            codec: Arc::clone(&self.codec),
            state: Arc::clone(&self.state),
            timeout: Duration::from_millis(self.config.response_timeout_ms),
        })
    }

    /// Register and wait for the master's answer
    pub async fn register_and_wait(
        &self,
        request: &RegistrationRequest,
    ) -> ClientResult<RegistrationResponse> {
        self.register(request).await?.wait().await
    }

    /// Close the connection. Safe to call at any time, any number of times.
    pub async fn close(&self) {
        let conn = self.connection.write().await.take();
        if let Some(conn) = conn {
            conn.close().await;
        }
        self.set_state(RegistrationState::Closed).await;
    }

    /// Get the current state
    pub async fn state(&self) -> RegistrationState {
        let dropped = self
            .connection
            .read()
            .await
            .as_ref()
            .is_some_and(|conn| conn.is_closed());

        if dropped {
            self.set_state(RegistrationState::Closed).await;
        }

        *self.state.read().await
    }

    /// The live connection, for stats or unsolicited frames
    pub async fn connection(&self) -> Option<Arc<Connection>> {
        self.connection.read().await.clone()
    }

    async fn live_connection(&self) -> ClientResult<Arc<Connection>> {
        let conn = self
            .connection
            .read()
            .await
            .clone()
            .ok_or(ClientError::NotConnected)?;

        if conn.is_closed() {
            self.set_state(RegistrationState::Closed).await;
            return Err(ClientError::Connection(ConnectionError::Closed));
        }

        Ok(conn)
    }

    async fn set_state(&self, state: RegistrationState) {
        *self.state.write().await = state;
    }
}

/// A registration waiting for the master's answer
pub struct PendingRegistration {
    pending: PendingResponse,
    codec: Arc<dyn MessageCodec>,
    state: Arc<RwLock<RegistrationState>>,
    timeout: Duration,
}

impl std::fmt::Debug for PendingRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRegistration")
            .field("serial_number", &self.pending.serial_number())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl PendingRegistration {
    pub fn serial_number(&self) -> u32 {
        self.pending.serial_number()
    }

    /// Override the configured response timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Wait for the master's answer and settle the client's state
    pub async fn wait(self) -> ClientResult<RegistrationResponse> {
        let serial_number = self.pending.serial_number();

        let frame = match self.pending.wait_timeout(self.timeout).await {
            Ok(frame) => frame,
            Err(ConnectionError::ResponseTimeout(serial)) => {
                *self.state.write().await = RegistrationState::RegistrationFailed;
                return Err(ConnectionError::ResponseTimeout(serial).into());
            }
            Err(e) => {
                *self.state.write().await = RegistrationState::Closed;
                return Err(e.into());
            }
        };

        let response = match self.codec.decode_response(&frame.payload) {
            Ok(response) => response,
            Err(e) => {
                *self.state.write().await = RegistrationState::RegistrationFailed;
                return Err(ClientError::Serialization(e));
            }
        };

        if response.is_accepted() {
            *self.state.write().await = RegistrationState::Registered;
            tracing::info!(
                "Registered with serial {}, broker checksum {}",
                serial_number,
                response.broker_check_sum
            );
            Ok(response)
        } else {
            *self.state.write().await = RegistrationState::RegistrationFailed;
            let status = response.status();
            if status.is_server_error() {
                tracing::error!(
                    "Master failed registration with serial {}: {} {}",
                    serial_number,
                    status,
                    response.err_msg
                );
            } else {
                tracing::warn!(
                    "Registration with serial {} rejected: {} {}",
                    serial_number,
                    status,
                    response.err_msg
                );
            }
            Err(ClientError::Rejected {
                status: response.status(),
                message: response.err_msg,
            })
        }
    }
}
