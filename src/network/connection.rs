//! Connection handling for the master protocol
//!
//! A [`Connection`] owns one TCP stream. The read half lives in a background
//! task that decodes frames and routes each one to the request waiting on its
//! serial number. The write half sits behind a mutex so two frames never
//! interleave on the wire.

use bytes::BytesMut;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::NetworkConfig;
use crate::protocol::{self, CodecError, Decoder, Frame, UNSOLICITED_SERIAL};

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Connection to {0} timed out")]
    ConnectTimeout(SocketAddr),

    #[error("Write error: {0}")]
    Write(#[source] std::io::Error),

    #[error("Read error: {0}")]
    Read(String),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] CodecError),

    #[error("Connection closed")]
    Closed,

    #[error("No response for serial number {0}")]
    ResponseTimeout(u32),
}

impl ConnectionError {
    /// Whether the connection is unusable after this error
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ConnectionError::Write(_)
                | ConnectionError::Read(_)
                | ConnectionError::InvalidFrame(_)
                | ConnectionError::Closed
        )
    }
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Why the receive task stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseCause {
    /// `close()` or drop on this side
    Local,
    /// Peer closed the stream cleanly
    Peer,
    /// Socket write failed
    Write(String),
    /// Socket read failed
    Read(String),
    /// Peer sent bytes that are not a valid frame
    InvalidFrame(String),
}

impl std::fmt::Display for CloseCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseCause::Local => write!(f, "closed locally"),
            CloseCause::Peer => write!(f, "closed by peer"),
            CloseCause::Write(e) => write!(f, "write error: {}", e),
            CloseCause::Read(e) => write!(f, "read error: {}", e),
            CloseCause::InvalidFrame(e) => write!(f, "invalid frame: {}", e),
        }
    }
}

/// Connection statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Frames sent
    pub frames_sent: u64,
    /// Frames received
    pub frames_received: u64,
    /// Bytes sent
    pub bytes_sent: u64,
    /// Bytes received
    pub bytes_received: u64,
    /// Frames that matched no pending request
    pub unsolicited_frames: u64,
}

#[derive(Default)]
struct StatsCounters {
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    unsolicited_frames: AtomicU64,
}

impl StatsCounters {
    fn snapshot(&self) -> ConnectionStats {
        ConnectionStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            unsolicited_frames: self.unsolicited_frames.load(Ordering::Relaxed),
        }
    }
}

/// Serial number allocation and the requests still waiting for an answer
struct Correlation {
    next_serial: u32,
    waiters: HashMap<u32, oneshot::Sender<Frame>>,
}

impl Correlation {
    fn new() -> Self {
        Self {
            next_serial: 1,
            waiters: HashMap::new(),
        }
    }

    /// Hand out the next free serial, never [`UNSOLICITED_SERIAL`]
    fn register(&mut self, waiter: oneshot::Sender<Frame>) -> u32 {
        loop {
            let serial = self.next_serial;
            self.next_serial = self.next_serial.wrapping_add(1);

            if serial == UNSOLICITED_SERIAL || self.waiters.contains_key(&serial) {
                continue;
            }

            self.waiters.insert(serial, waiter);
            return serial;
        }
    }
}

/// State shared between the connection, its receive task and pending handles
struct Shared {
    remote_addr: SocketAddr,
    closed: AtomicBool,
    close_cause: Mutex<Option<CloseCause>>,
    correlation: Mutex<Correlation>,
    unsolicited_tx: Mutex<Option<mpsc::Sender<Frame>>>,
    stats: StatsCounters,
}

impl Shared {
    fn correlation(&self) -> MutexGuard<'_, Correlation> {
        self.correlation.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close_cause(&self) -> Option<CloseCause> {
        self.close_cause
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Record the first cause only; later ones are consequences of it
    fn record_close(&self, cause: CloseCause) {
        self.closed.store(true, Ordering::SeqCst);
        self.close_cause
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert(cause);
    }

    /// Error a waiter sees once the connection went away under it
    fn closed_error(&self) -> ConnectionError {
        match self.close_cause() {
            Some(CloseCause::Read(e)) => ConnectionError::Read(e),
            Some(CloseCause::InvalidFrame(e)) => ConnectionError::InvalidFrame(e),
            _ => ConnectionError::Closed,
        }
    }

    /// Drop every waiter so their handles observe `Closed`
    fn fail_pending(&self) {
        let drained: Vec<_> = self.correlation().waiters.drain().collect();
        if !drained.is_empty() {
            tracing::debug!(
                "Releasing {} pending request(s) on {}",
                drained.len(),
                self.remote_addr
            );
        }
    }

    /// Drop the unsolicited sender so its receiver sees the end of the stream
    fn release_unsolicited(&self) {
        self.unsolicited_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    fn forget(&self, serial_number: u32) {
        let mut correlation = self.correlation();
        let abandoned = correlation
            .waiters
            .get(&serial_number)
            .is_some_and(|tx| tx.is_closed());
        if abandoned {
            correlation.waiters.remove(&serial_number);
        }
    }

    fn dispatch(&self, frame: Frame) {
        self.stats.frames_received.fetch_add(1, Ordering::Relaxed);

        let waiter = if frame.serial_number == UNSOLICITED_SERIAL {
            None
        } else {
            self.correlation().waiters.remove(&frame.serial_number)
        };

        match waiter {
            Some(tx) => {
                let serial_number = frame.serial_number;
                if tx.send(frame).is_err() {
                    tracing::debug!("Response for serial {} arrived after its waiter left", serial_number);
                }
            }
            None => self.route_unsolicited(frame),
        }
    }

    fn route_unsolicited(&self, frame: Frame) {
        self.stats.unsolicited_frames.fetch_add(1, Ordering::Relaxed);

        let tx = self
            .unsolicited_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let Some(tx) = tx else {
            tracing::debug!(
                "Dropping unsolicited frame serial={} len={} from {}",
                frame.serial_number,
                frame.payload_length(),
                self.remote_addr
            );
            return;
        };

        match tx.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(frame)) => {
                tracing::warn!(
                    "Unsolicited channel full, dropping frame serial={}",
                    frame.serial_number
                );
            }
            Err(mpsc::error::TrySendError::Closed(frame)) => {
                tracing::debug!(
                    "Unsolicited receiver gone, dropping frame serial={}",
                    frame.serial_number
                );
            }
        }
    }
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared")
            .field("remote_addr", &self.remote_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Represents a framed connection to a master
pub struct Connection {
    /// Remote peer address
    remote_addr: SocketAddr,
    /// Write half; the lock keeps frames whole on the wire
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    shared: Arc<Shared>,
    unsolicited_capacity: usize,
    max_payload_size: usize,
    /// Background receive task
    reader_handle: Mutex<Option<JoinHandle<()>>>,
    /// Flips to `true` once; stops the receive task and any write in flight
    closing: watch::Sender<bool>,
}

impl Connection {
    /// Open a TCP connection, bounded by the configured connect timeout
    pub async fn connect(addr: SocketAddr, config: &NetworkConfig) -> ConnectionResult<Self> {
        tracing::info!("Connecting to {}", addr);

        let stream = match tokio::time::timeout(
            Duration::from_millis(config.connect_timeout_ms),
            TcpStream::connect(addr),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(ConnectionError::Connect { addr, source }),
            Err(_) => return Err(ConnectionError::ConnectTimeout(addr)),
        };

        stream
            .set_nodelay(true)
            .map_err(|source| ConnectionError::Connect { addr, source })?;

        Ok(Self::from_stream(stream, addr, config))
    }

    /// Wrap an established stream and start its receive task
    pub fn from_stream(stream: TcpStream, remote_addr: SocketAddr, config: &NetworkConfig) -> Self {
        let (read_half, write_half) = stream.into_split();
        let (closing, closing_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            remote_addr,
            closed: AtomicBool::new(false),
            close_cause: Mutex::new(None),
            correlation: Mutex::new(Correlation::new()),
            unsolicited_tx: Mutex::new(None),
            stats: StatsCounters::default(),
        });

        let reader_handle = tokio::spawn(read_loop(
            read_half,
            Decoder::with_max_payload(config.max_payload_size),
            Arc::clone(&shared),
            closing_rx,
        ));

        Self {
            remote_addr,
            writer: tokio::sync::Mutex::new(write_half),
            shared,
            unsolicited_capacity: config.unsolicited_capacity.max(1),
            max_payload_size: config.max_payload_size,
            reader_handle: Mutex::new(Some(reader_handle)),
            closing,
        }
    }

    /// Get the remote address
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Check if the connection has been closed, locally or by the peer
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Why the connection closed, once it has
    pub fn close_cause(&self) -> Option<CloseCause> {
        self.shared.close_cause()
    }

    /// Get connection statistics
    pub fn stats(&self) -> ConnectionStats {
        self.shared.stats.snapshot()
    }

    /// Number of requests still waiting for a response
    pub fn pending_count(&self) -> usize {
        self.shared.correlation().waiters.len()
    }

    /// Receive frames that answer no pending request.
    ///
    /// Until this is called such frames are logged and dropped. Calling it
    /// again replaces the previous receiver. The receiver yields `None` once
    /// the connection closes.
    pub fn take_unsolicited_receiver(&self) -> mpsc::Receiver<Frame> {
        let (tx, rx) = mpsc::channel(self.unsolicited_capacity);
        let mut slot = self
            .shared
            .unsolicited_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !self.is_closed() {
            *slot = Some(tx);
        }
        rx
    }

    /// Frame `payload` under a fresh serial number and write it.
    ///
    /// The returned handle resolves to the response carrying the same serial.
    /// A write failure closes the connection. A write still in flight when
    /// [`Connection::close`] runs is abandoned with `Closed`.
    pub async fn send_request(
        &self,
        list_size: u32,
        payload: &[u8],
    ) -> ConnectionResult<PendingResponse> {
        if self.is_closed() {
            return Err(self.shared.closed_error());
        }
        if payload.len() > self.max_payload_size {
            return Err(CodecError::PayloadTooLarge(payload.len(), self.max_payload_size).into());
        }

        let (tx, rx) = oneshot::channel();
        let serial_number = self.shared.correlation().register(tx);
        let pending = PendingResponse {
            serial_number,
            rx,
            shared: Arc::clone(&self.shared),
        };

        let mut buf = BytesMut::new();
        protocol::encode(serial_number, list_size, payload, &mut buf)?;

        {
            let mut writer = self.writer.lock().await;
            if self.is_closed() {
                return Err(self.shared.closed_error());
            }

            let mut closing = self.closing.subscribe();
            let written = tokio::select! {
                result = write_bytes(&mut writer, &buf) => result,
                _ = closing.wait_for(|closing| *closing) => {
                    tracing::debug!(
                        "Abandoned write of serial {} to {}: connection closing",
                        serial_number,
                        self.remote_addr
                    );
                    return Err(self.shared.closed_error());
                }
            };

            if let Err(e) = written {
                tracing::warn!("Write to {} failed: {}", self.remote_addr, e);
                self.signal_close(CloseCause::Write(e.to_string()));
                return Err(ConnectionError::Write(e));
            }
        }

        self.shared.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.shared
            .stats
            .bytes_sent
            .fetch_add(buf.len() as u64, Ordering::Relaxed);

        tracing::debug!(
            "Sent frame serial={} len={} to {}",
            serial_number,
            payload.len(),
            self.remote_addr
        );

        Ok(pending)
    }

    /// Mark closed and wake the receive task and any pending write
    fn signal_close(&self, cause: CloseCause) {
        self.shared.record_close(cause);
        self.closing.send_replace(true);
    }

    /// Close the connection. Safe to call any number of times.
    pub async fn close(&self) {
        self.signal_close(CloseCause::Local);

        let handle = self
            .reader_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let Some(handle) = handle else {
            return;
        };

        // a stalled write lets go of the lock once it sees the close signal
        let _ = self.writer.lock().await.shutdown().await;
        let _ = handle.await;
        self.shared.fail_pending();
        self.shared.release_unsolicited();

        tracing::info!("Connection to {} closed", self.remote_addr);
    }

    #[cfg(test)]
    pub(crate) async fn shutdown_write(&self) {
        let _ = self.writer.lock().await.shutdown().await;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.signal_close(CloseCause::Local);
        if let Some(handle) = self
            .reader_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
        self.shared.fail_pending();
        self.shared.release_unsolicited();
    }
}

/// Handle for the response to one request
#[derive(Debug)]
pub struct PendingResponse {
    serial_number: u32,
    rx: oneshot::Receiver<Frame>,
    shared: Arc<Shared>,
}

impl PendingResponse {
    /// Serial number the request was sent under
    pub fn serial_number(&self) -> u32 {
        self.serial_number
    }

    /// Wait for the response frame
    pub async fn wait(mut self) -> ConnectionResult<Frame> {
        match (&mut self.rx).await {
            Ok(frame) => Ok(frame),
            Err(_) => Err(self.shared.closed_error()),
        }
    }

    /// Wait for the response frame, giving up after `timeout`
    pub async fn wait_timeout(self, timeout: Duration) -> ConnectionResult<Frame> {
        let serial_number = self.serial_number;
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::ResponseTimeout(serial_number)),
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        self.rx.close();
        self.shared.forget(self.serial_number);
    }
}

async fn write_bytes(writer: &mut OwnedWriteHalf, buf: &[u8]) -> std::io::Result<()> {
    writer.write_all(buf).await?;
    writer.flush().await
}

/// Receive task: decode frames and route them until the stream ends
async fn read_loop(
    mut reader: OwnedReadHalf,
    mut decoder: Decoder,
    shared: Arc<Shared>,
    mut closing: watch::Receiver<bool>,
) {
    let mut read_buf = BytesMut::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    let cause = loop {
        match decoder.decode(&mut read_buf) {
            Ok(Some(frame)) => {
                tracing::debug!(
                    "Received frame serial={} len={} from {}",
                    frame.serial_number,
                    frame.payload_length(),
                    shared.remote_addr
                );
                shared.dispatch(frame);
                continue;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("Dropping connection to {}: {}", shared.remote_addr, e);
                break CloseCause::InvalidFrame(e.to_string());
            }
        }

        tokio::select! {
            // also fires when the connection is dropped with the sender
            _ = closing.wait_for(|closing| *closing) => {
                break CloseCause::Local;
            }
            result = reader.read(&mut chunk) => {
                match result {
                    Ok(0) => break CloseCause::Peer,
                    Ok(n) => {
                        read_buf.extend_from_slice(&chunk[..n]);
                        shared.stats.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                    }
                    Err(e) => break CloseCause::Read(e.to_string()),
                }
            }
        }
    };

    tracing::debug!("Receive task for {} exited: {}", shared.remote_addr, cause);

    shared.record_close(cause);
    shared.fail_pending();
    shared.release_unsolicited();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{MARKER, SINGLE_SEGMENT};
    use tokio::net::TcpListener;
    use tokio_test::{assert_err, assert_ok};

    async fn pair(config: &NetworkConfig) -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (conn, accepted) = tokio::join!(Connection::connect(addr, config), listener.accept());
        (conn.unwrap(), accepted.unwrap().0)
    }

    async fn read_frame(peer: &mut TcpStream, decoder: &mut Decoder, buf: &mut BytesMut) -> Frame {
        loop {
            if let Some(frame) = decoder.decode(buf).unwrap() {
                return frame;
            }
            let mut chunk = [0u8; 1024];
            let n = peer.read(&mut chunk).await.unwrap();
            assert!(n > 0, "peer saw EOF before a full frame");
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    async fn write_frame(peer: &mut TcpStream, serial_number: u32, payload: &[u8]) {
        let mut out = BytesMut::new();
        protocol::encode(serial_number, SINGLE_SEGMENT, payload, &mut out).unwrap();
        peer.write_all(&out).await.unwrap();
    }

    #[tokio::test]
    async fn test_responses_in_reverse_order() {
        let config = NetworkConfig::default();
        let (conn, mut peer) = pair(&config).await;

        let first = conn.send_request(SINGLE_SEGMENT, b"first").await.unwrap();
        let second = conn.send_request(SINGLE_SEGMENT, b"second").await.unwrap();
        assert_ne!(first.serial_number(), second.serial_number());
        assert_eq!(conn.pending_count(), 2);

        let mut decoder = Decoder::new();
        let mut buf = BytesMut::new();
        let req_a = read_frame(&mut peer, &mut decoder, &mut buf).await;
        let req_b = read_frame(&mut peer, &mut decoder, &mut buf).await;

        write_frame(&mut peer, req_b.serial_number, b"reply-second").await;
        write_frame(&mut peer, req_a.serial_number, b"reply-first").await;

        let timeout = Duration::from_secs(5);
        let reply_first = first.wait_timeout(timeout).await.unwrap();
        let reply_second = second.wait_timeout(timeout).await.unwrap();

        assert_eq!(&reply_first.payload[..], b"reply-first");
        assert_eq!(&reply_second.payload[..], b"reply-second");
        assert_eq!(conn.pending_count(), 0);

        conn.close().await;
    }

    #[tokio::test]
    async fn test_concurrent_writes_stay_framed() {
        let config = NetworkConfig::default();
        let (conn, mut peer) = pair(&config).await;
        let big = vec![0xAB; 16 * 1024];

        let (a, b) = tokio::join!(
            conn.send_request(SINGLE_SEGMENT, &big),
            conn.send_request(SINGLE_SEGMENT, b"small"),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        let mut decoder = Decoder::new();
        let mut buf = BytesMut::new();
        let mut seen = vec![
            read_frame(&mut peer, &mut decoder, &mut buf).await,
            read_frame(&mut peer, &mut decoder, &mut buf).await,
        ];
        seen.sort_by_key(|frame| frame.payload_length());

        assert_eq!(&seen[0].payload[..], b"small");
        assert_eq!(seen[1].payload_length(), big.len());
        assert_eq!(seen[0].serial_number, b.serial_number());
        assert_eq!(seen[1].serial_number, a.serial_number());
        assert_eq!(conn.stats().frames_sent, 2);
    }

    #[test]
    fn test_serial_numbers_skip_zero() {
        let mut correlation = Correlation::new();
        correlation.next_serial = u32::MAX;

        let (tx_a, _rx_a) = oneshot::channel();
        let (tx_b, _rx_b) = oneshot::channel();
        assert_eq!(correlation.register(tx_a), u32::MAX);
        assert_eq!(correlation.register(tx_b), 1);
    }

    #[test]
    fn test_serial_numbers_skip_in_flight() {
        let mut correlation = Correlation::new();
        let (tx_a, _rx_a) = oneshot::channel();
        assert_eq!(correlation.register(tx_a), 1);

        correlation.next_serial = 1;
        let (tx_b, _rx_b) = oneshot::channel();
        assert_eq!(correlation.register(tx_b), 2);
    }

    #[tokio::test]
    async fn test_unsolicited_frames_forwarded() {
        let config = NetworkConfig::default();
        let (conn, mut peer) = pair(&config).await;
        let mut unsolicited = conn.take_unsolicited_receiver();

        write_frame(&mut peer, UNSOLICITED_SERIAL, b"notice").await;
        write_frame(&mut peer, 4242, b"stray").await;

        let notice = unsolicited.recv().await.unwrap();
        let stray = unsolicited.recv().await.unwrap();

        assert_eq!(&notice.payload[..], b"notice");
        assert_eq!(stray.serial_number, 4242);
        assert_eq!(conn.stats().unsolicited_frames, 2);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let config = NetworkConfig::default();
        let (conn, _peer) = pair(&config).await;

        let pending = conn.send_request(SINGLE_SEGMENT, b"hello").await.unwrap();

        conn.close().await;
        conn.close().await;

        assert!(conn.is_closed());
        assert_eq!(conn.close_cause(), Some(CloseCause::Local));
        assert!(matches!(pending.wait().await, Err(ConnectionError::Closed)));
        assert!(matches!(
            conn.send_request(SINGLE_SEGMENT, b"again").await,
            Err(ConnectionError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_close_returns_while_write_stalled() {
        let config = NetworkConfig::default().with_max_payload(32 * 1024 * 1024);
        // the peer never reads, so a large frame fills both socket buffers
        let (conn, _peer) = pair(&config).await;
        let conn = Arc::new(conn);

        let sender = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move {
                let big = vec![0u8; 16 * 1024 * 1024];
                conn.send_request(SINGLE_SEGMENT, &big)
                    .await
                    .map(|pending| pending.serial_number())
            })
        };
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_ok!(tokio::time::timeout(Duration::from_secs(3), conn.close()).await);
        assert!(conn.is_closed());

        let result = assert_ok!(tokio::time::timeout(Duration::from_secs(3), sender).await);
        assert!(matches!(result.unwrap(), Err(ConnectionError::Closed)));
        assert_eq!(conn.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_write_failure_closes_connection() {
        let config = NetworkConfig::default();
        let (conn, _peer) = pair(&config).await;

        let pending = conn.send_request(SINGLE_SEGMENT, b"first").await.unwrap();
        conn.shutdown_write().await;

        let result = conn.send_request(SINGLE_SEGMENT, b"second").await;
        assert!(matches!(result, Err(ConnectionError::Write(_))));
        assert!(conn.is_closed());
        assert!(matches!(conn.close_cause(), Some(CloseCause::Write(_))));

        let waited = pending.wait_timeout(Duration::from_secs(5)).await;
        assert!(matches!(waited, Err(ConnectionError::Closed)));

        assert_ok!(tokio::time::timeout(Duration::from_secs(3), conn.close()).await);
        assert!(matches!(conn.close_cause(), Some(CloseCause::Write(_))));
    }

    #[tokio::test]
    async fn test_unsolicited_receiver_ends_when_peer_closes() {
        let config = NetworkConfig::default();
        let (conn, peer) = pair(&config).await;
        let mut unsolicited = conn.take_unsolicited_receiver();

        drop(peer);

        let next = assert_ok!(tokio::time::timeout(Duration::from_secs(2), unsolicited.recv()).await);
        assert!(next.is_none());
        assert!(conn.is_closed());

        // taken after the fact, the receiver is already finished
        let mut late = conn.take_unsolicited_receiver();
        assert!(late.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_unsolicited_receiver_ends_on_close() {
        let config = NetworkConfig::default();
        let (conn, _peer) = pair(&config).await;
        let mut unsolicited = conn.take_unsolicited_receiver();

        conn.close().await;

        let next = assert_ok!(tokio::time::timeout(Duration::from_secs(2), unsolicited.recv()).await);
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn test_oversized_request_keeps_connection() {
        let config = NetworkConfig::default().with_max_payload(8);
        let (conn, mut peer) = pair(&config).await;

        let result = conn.send_request(SINGLE_SEGMENT, &[0u8; 9]).await;
        assert!(matches!(
            result,
            Err(ConnectionError::Protocol(CodecError::PayloadTooLarge(9, 8)))
        ));
        assert!(!conn.is_closed());
        assert_eq!(conn.pending_count(), 0);

        let pending = assert_ok!(conn.send_request(SINGLE_SEGMENT, b"fits").await);
        let mut decoder = Decoder::new();
        let mut buf = BytesMut::new();
        let seen = read_frame(&mut peer, &mut decoder, &mut buf).await;
        assert_eq!(seen.serial_number, pending.serial_number());
        assert_eq!(&seen.payload[..], b"fits");
    }

    #[test]
    fn test_fatal_errors() {
        assert!(ConnectionError::Closed.is_fatal());
        assert!(ConnectionError::Read("reset".into()).is_fatal());
        assert!(ConnectionError::InvalidFrame("marker".into()).is_fatal());
        assert!(ConnectionError::Write(std::io::ErrorKind::BrokenPipe.into()).is_fatal());

        assert!(!ConnectionError::Protocol(CodecError::PayloadTooLarge(usize::MAX, u32::MAX as usize)).is_fatal());
        assert!(!ConnectionError::ResponseTimeout(1).is_fatal());
    }

    #[tokio::test]
    async fn test_peer_close_releases_pending() {
        let config = NetworkConfig::default();
        let (conn, peer) = pair(&config).await;

        let pending = conn.send_request(SINGLE_SEGMENT, b"hello").await.unwrap();
        drop(peer);

        let result = pending.wait_timeout(Duration::from_secs(5)).await;
        assert!(matches!(
            result,
            Err(ConnectionError::Closed) | Err(ConnectionError::Read(_))
        ));
        assert!(conn.is_closed());
        assert!(matches!(
            conn.close_cause(),
            Some(CloseCause::Peer) | Some(CloseCause::Read(_))
        ));
    }

    #[tokio::test]
    async fn test_bad_marker_closes_connection() {
        let config = NetworkConfig::default();
        let (conn, mut peer) = pair(&config).await;

        let pending = conn.send_request(SINGLE_SEGMENT, b"hello").await.unwrap();

        let mut garbage = vec![0u8; 16];
        garbage[..4].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        assert_ne!(&garbage[..4], &MARKER);
        peer.write_all(&garbage).await.unwrap();

        let result = pending.wait_timeout(Duration::from_secs(5)).await;
        assert!(matches!(result, Err(ConnectionError::InvalidFrame(_))));
        assert!(conn.is_closed());
        assert!(matches!(
            conn.send_request(SINGLE_SEGMENT, b"again").await,
            Err(ConnectionError::InvalidFrame(_))
        ));
    }

    #[tokio::test]
    async fn test_response_timeout_forgets_waiter() {
        let config = NetworkConfig::default();
        let (conn, _peer) = pair(&config).await;

        let pending = conn.send_request(SINGLE_SEGMENT, b"hello").await.unwrap();
        let serial = pending.serial_number();

        let result = pending.wait_timeout(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(ConnectionError::ResponseTimeout(s)) if s == serial));
        assert_eq!(conn.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = Connection::connect(addr, &NetworkConfig::default()).await;
        assert!(matches!(result, Err(ConnectionError::Connect { .. })));
    }

    #[tokio::test]
    async fn test_oversized_inbound_payload_closes() {
        let config = NetworkConfig::default().with_max_payload(8);
        let (conn, mut peer) = pair(&config).await;

        let pending = assert_ok!(conn.send_request(SINGLE_SEGMENT, b"hi").await);
        write_frame(&mut peer, pending.serial_number(), &[0u8; 32]).await;

        assert_err!(pending.wait_timeout(Duration::from_secs(5)).await);
        assert!(conn.is_closed());
    }
}
