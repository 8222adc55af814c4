//! [`IpConnection`] – TCP transport to a brick daemon.
//!
//! One socket carries every request, response and callback of the stack.
//! The write half sits behind an async mutex; a reader task owns the read
//! half and routes each incoming packet:
//!
//! | Packet | Destination |
//! |---|---|
//! | response (`sequence != 0`) | the waiting request, matched on `(uid, function_id, sequence)` |
//! | enumerate callback (function 253) | notification channel as [`TransportNotification::Enumerate`] |
//! | any other callback | callback broadcast channel |
//!
//! When the peer goes away every pending request fails with
//! [`DeviceError::NotConnected`], a `Disconnected` notification is emitted
//! and, with auto-reconnect enabled, the reader task keeps retrying until
//! the link is back or `disconnect()` is called.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tinkerbus_types::{ConnectionState, DeviceError, StackAddress, TransportError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::{
    CallbackFrame, ConnectReason, DisconnectReason, Request, StackConnection,
    TransportNotification,
};
use crate::packet::{self, CALLBACK_ENUMERATE, FUNCTION_ENUMERATE, HEADER_LEN, Header};

/// How long a request waits for its response.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(2500);
/// Pause between two auto-reconnect attempts.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(1);

const CALLBACK_BUFFER: usize = 256;

type PendingKey = (u32, u8, u8);
type PendingReply = oneshot::Sender<Result<Vec<u8>, DeviceError>>;

struct Inner {
    timeout: Duration,
    auto_reconnect: bool,
    state: Mutex<ConnectionState>,
    address: Mutex<Option<StackAddress>>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    pending: Mutex<HashMap<PendingKey, PendingReply>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    sequence: AtomicU8,
    disconnect_requested: AtomicBool,
    notify_tx: mpsc::UnboundedSender<TransportNotification>,
    notify_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportNotification>>>,
    callbacks: broadcast::Sender<CallbackFrame>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        *lock(&self.state) = state;
    }

    fn notify(&self, notification: TransportNotification) {
        let _ = self.notify_tx.send(notification);
    }

    /// Next request sequence number, cycling through `1..=15`.
    fn next_sequence(&self) -> u8 {
        let previous = self
            .sequence
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |s| {
                Some(if s >= 15 { 1 } else { s + 1 })
            })
            .unwrap_or(0);
        if previous >= 15 { 1 } else { previous + 1 }
    }

    /// Drop every waiting request; their callers see `NotConnected`.
    fn fail_pending(&self) {
        lock(&self.pending).clear();
    }

    fn dispatch(&self, header: Header, payload: Vec<u8>) {
        if header.is_callback() {
            if header.function_id == CALLBACK_ENUMERATE {
                match packet::decode_enumerate(&payload) {
                    Some(notification) => self.notify(TransportNotification::Enumerate(notification)),
                    None => warn!(len = payload.len(), "dropping malformed enumerate callback"),
                }
            } else {
                let _ = self.callbacks.send(CallbackFrame {
                    uid: header.uid,
                    function_id: header.function_id,
                    payload: payload.into(),
                });
            }
            return;
        }

        let key = (header.uid, header.function_id, header.sequence);
        let Some(reply) = lock(&self.pending).remove(&key) else {
            debug!(
                uid = %packet::base58_encode(header.uid),
                function_id = header.function_id,
                sequence = header.sequence,
                "response without waiting request"
            );
            return;
        };
        let _ = reply.send(header.check_error().map(|()| payload));
    }
}

/// TCP implementation of [`StackConnection`].
#[derive(Clone)]
pub struct IpConnection {
    inner: Arc<Inner>,
}

impl Default for IpConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl IpConnection {
    /// Connection with [`DEFAULT_TIMEOUT`] and auto-reconnect enabled.
    pub fn new() -> Self {
        Self::with_options(DEFAULT_TIMEOUT, true)
    }

    pub fn with_options(timeout: Duration, auto_reconnect: bool) -> Self {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let (callbacks, _) = broadcast::channel(CALLBACK_BUFFER);
        Self {
            inner: Arc::new(Inner {
                timeout,
                auto_reconnect,
                state: Mutex::new(ConnectionState::Disconnected),
                address: Mutex::new(None),
                writer: tokio::sync::Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                reader: Mutex::new(None),
                sequence: AtomicU8::new(0),
                disconnect_requested: AtomicBool::new(false),
                notify_tx,
                notify_rx: Mutex::new(Some(notify_rx)),
                callbacks,
            }),
        }
    }

    async fn open(address: &StackAddress) -> std::io::Result<(OwnedReadHalf, OwnedWriteHalf)> {
        let stream = TcpStream::connect((address.host(), address.port())).await?;
        stream.set_nodelay(true)?;
        Ok(stream.into_split())
    }
}

/// Read packets until the socket fails; returns why it stopped.
async fn read_packets(inner: &Inner, reader: &mut OwnedReadHalf) -> DisconnectReason {
    let mut header_buf = [0u8; HEADER_LEN];
    loop {
        if let Err(err) = reader.read_exact(&mut header_buf).await {
            return if err.kind() == ErrorKind::UnexpectedEof {
                DisconnectReason::Shutdown
            } else {
                DisconnectReason::Error
            };
        }
        let Some(header) = Header::parse(&header_buf) else {
            warn!(bytes = ?header_buf, "invalid packet header");
            return DisconnectReason::Error;
        };
        let mut payload = vec![0u8; header.payload_len()];
        if reader.read_exact(&mut payload).await.is_err() {
            return DisconnectReason::Error;
        }
        inner.dispatch(header, payload);
    }
}

/// Reader task body: pump packets, and on link loss optionally reconnect.
async fn run_reader(inner: Arc<Inner>, mut reader: OwnedReadHalf) {
    loop {
        let reason = read_packets(&inner, &mut reader).await;
        if inner.disconnect_requested.load(Ordering::SeqCst) {
            return;
        }

        inner.writer.lock().await.take();
        inner.set_state(ConnectionState::Disconnected);
        inner.fail_pending();
        warn!(?reason, "stack connection lost");
        inner.notify(TransportNotification::Disconnected { reason });

        if !inner.auto_reconnect {
            return;
        }
        let Some(address) = lock(&inner.address).clone() else {
            return;
        };
        reader = loop {
            tokio::time::sleep(RECONNECT_DELAY).await;
            if inner.disconnect_requested.load(Ordering::SeqCst) {
                return;
            }
            inner.set_state(ConnectionState::Connecting);
            match IpConnection::open(&address).await {
                Ok((read_half, write_half)) => {
                    *inner.writer.lock().await = Some(write_half);
                    break read_half;
                }
                Err(err) => {
                    debug!(%address, error = %err, "reconnect attempt failed");
                    inner.set_state(ConnectionState::Disconnected);
                }
            }
        };
        inner.set_state(ConnectionState::Connected);
        info!(%address, "stack connection re-established");
        inner.notify(TransportNotification::Connected {
            reason: ConnectReason::AutoReconnect,
        });
    }
}

#[async_trait]
impl StackConnection for IpConnection {
    async fn connect(&self, address: &StackAddress) -> Result<(), TransportError> {
        {
            let mut state = lock(&self.inner.state);
            if *state != ConnectionState::Disconnected {
                return Err(TransportError::AlreadyConnected);
            }
            *state = ConnectionState::Connecting;
        }

        let (read_half, write_half) = match Self::open(address).await {
            Ok(halves) => halves,
            Err(err) => {
                self.inner.set_state(ConnectionState::Disconnected);
                return Err(TransportError::Io(err));
            }
        };

        self.inner.disconnect_requested.store(false, Ordering::SeqCst);
        *lock(&self.inner.address) = Some(address.clone());
        *self.inner.writer.lock().await = Some(write_half);
        self.inner.set_state(ConnectionState::Connected);

        let task = tokio::spawn(run_reader(Arc::clone(&self.inner), read_half));
        if let Some(previous) = lock(&self.inner.reader).replace(task) {
            previous.abort();
        }

        info!(%address, "connected to stack");
        self.inner.notify(TransportNotification::Connected {
            reason: ConnectReason::Request,
        });
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let reader_idle = lock(&self.inner.reader)
            .as_ref()
            .is_none_or(JoinHandle::is_finished);
        if reader_idle && *lock(&self.inner.state) == ConnectionState::Disconnected {
            return Err(TransportError::NotConnected);
        }
        self.inner.disconnect_requested.store(true, Ordering::SeqCst);

        if let Some(task) = lock(&self.inner.reader).take() {
            task.abort();
        }
        if let Some(mut writer) = self.inner.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.inner.set_state(ConnectionState::Disconnected);
        self.inner.fail_pending();

        info!("disconnected from stack");
        self.inner.notify(TransportNotification::Disconnected {
            reason: DisconnectReason::Request,
        });
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        *lock(&self.inner.state)
    }

    async fn enumerate(&self) -> Result<(), DeviceError> {
        self.request(Request {
            uid: 0,
            function_id: FUNCTION_ENUMERATE,
            payload: Vec::new(),
            response_expected: false,
        })
        .await
        .map(|_| ())
    }

    async fn request(&self, request: Request) -> Result<Vec<u8>, DeviceError> {
        let sequence = self.inner.next_sequence();
        let key = (request.uid, request.function_id, sequence);
        let packet = packet::encode_packet(
            request.uid,
            request.function_id,
            sequence,
            request.response_expected,
            &request.payload,
        );

        let reply = {
            let mut writer = self.inner.writer.lock().await;
            let Some(stream) = writer.as_mut() else {
                return Err(DeviceError::NotConnected);
            };
            let reply = if request.response_expected {
                let (tx, rx) = oneshot::channel();
                lock(&self.inner.pending).insert(key, tx);
                Some(rx)
            } else {
                None
            };
            if let Err(err) = stream.write_all(&packet).await {
                debug!(error = %err, "request write failed");
                lock(&self.inner.pending).remove(&key);
                return Err(DeviceError::NotConnected);
            }
            reply
        };

        let Some(reply) = reply else {
            return Ok(Vec::new());
        };
        match tokio::time::timeout(self.inner.timeout, reply).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DeviceError::NotConnected),
            Err(_) => {
                lock(&self.inner.pending).remove(&key);
                Err(DeviceError::Timeout {
                    uid: packet::base58_encode(request.uid),
                    function_id: request.function_id,
                })
            }
        }
    }

    fn take_notifications(&self) -> Option<mpsc::UnboundedReceiver<TransportNotification>> {
        lock(&self.inner.notify_rx).take()
    }

    fn subscribe_callbacks(&self) -> broadcast::Receiver<CallbackFrame> {
        self.inner.callbacks.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tinkerbus_types::{EnumerationCause, EnumerationNotification};
    use tokio::net::TcpListener;

    async fn fake_daemon() -> (TcpListener, StackAddress) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, StackAddress::new("127.0.0.1", port).unwrap())
    }

    async fn read_packet(stream: &mut TcpStream) -> (Header, Vec<u8>) {
        let mut header = [0u8; HEADER_LEN];
        stream.read_exact(&mut header).await.unwrap();
        let header = Header::parse(&header).unwrap();
        let mut payload = vec![0u8; header.payload_len()];
        stream.read_exact(&mut payload).await.unwrap();
        (header, payload)
    }

    #[tokio::test]
    async fn enumerate_round_trip_through_the_socket() {
        let (listener, address) = fake_daemon().await;
        let connection = IpConnection::with_options(DEFAULT_TIMEOUT, false);
        let mut notifications = connection.take_notifications().unwrap();

        connection.connect(&address).await.unwrap();
        let (mut peer, _) = listener.accept().await.unwrap();
        assert_eq!(
            notifications.recv().await,
            Some(TransportNotification::Connected {
                reason: ConnectReason::Request
            })
        );

        connection.enumerate().await.unwrap();
        let (header, payload) = read_packet(&mut peer).await;
        assert_eq!(header.uid, 0);
        assert_eq!(header.function_id, FUNCTION_ENUMERATE);
        assert!(payload.is_empty());

        let announced = EnumerationNotification {
            uid: "ab1".to_string(),
            connected_uid: "6qzRzc".to_string(),
            position: 'b',
            hardware_version: [1, 0, 0],
            firmware_version: [2, 0, 1],
            device_identifier: 21,
            cause: EnumerationCause::Available,
        };
        let uid = packet::base58_decode("ab1").unwrap();
        let callback = packet::encode_packet(
            uid,
            CALLBACK_ENUMERATE,
            0,
            false,
            &packet::encode_enumerate(&announced),
        );
        peer.write_all(&callback).await.unwrap();

        assert_eq!(
            notifications.recv().await,
            Some(TransportNotification::Enumerate(announced))
        );
    }

    #[tokio::test]
    async fn response_is_matched_and_error_code_mapped() {
        let (listener, address) = fake_daemon().await;
        let connection = IpConnection::with_options(DEFAULT_TIMEOUT, false);
        connection.connect(&address).await.unwrap();
        let (mut peer, _) = listener.accept().await.unwrap();

        let server = tokio::spawn(async move {
            let (header, _) = read_packet(&mut peer).await;
            let mut reply =
                packet::encode_packet(header.uid, header.function_id, header.sequence, true, &[]);
            reply[7] = 2 << 6;
            peer.write_all(&reply).await.unwrap();

            let (header, _) = read_packet(&mut peer).await;
            let reply = packet::encode_packet(
                header.uid,
                header.function_id,
                header.sequence,
                true,
                &[0x34, 0x12],
            );
            peer.write_all(&reply).await.unwrap();
            peer
        });

        let err = connection
            .request(Request::expecting_response(42, 3, vec![0; 4]))
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::FunctionNotSupported { function_id: 3, .. }));

        let payload = connection
            .request(Request::expecting_response(42, 1, Vec::new()))
            .await
            .unwrap();
        assert_eq!(payload, vec![0x34, 0x12]);
        let _peer = server.await.unwrap();
    }

    #[tokio::test]
    async fn silent_device_times_out() {
        let (listener, address) = fake_daemon().await;
        let connection = IpConnection::with_options(Duration::from_millis(50), false);
        connection.connect(&address).await.unwrap();
        let (_peer, _) = listener.accept().await.unwrap();

        let err = connection
            .request(Request::expecting_response(42, 1, Vec::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::Timeout { function_id: 1, .. }));
    }

    #[tokio::test]
    async fn peer_close_emits_disconnected() {
        let (listener, address) = fake_daemon().await;
        let connection = IpConnection::with_options(DEFAULT_TIMEOUT, false);
        let mut notifications = connection.take_notifications().unwrap();
        connection.connect(&address).await.unwrap();
        let (peer, _) = listener.accept().await.unwrap();
        let _ = notifications.recv().await;

        drop(peer);

        assert_eq!(
            notifications.recv().await,
            Some(TransportNotification::Disconnected {
                reason: DisconnectReason::Shutdown
            })
        );
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert!(matches!(
            connection
                .request(Request::expecting_response(42, 1, Vec::new()))
                .await,
            Err(DeviceError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn connect_and_disconnect_report_benign_conditions() {
        let (listener, address) = fake_daemon().await;
        let connection = IpConnection::with_options(DEFAULT_TIMEOUT, false);
        assert!(matches!(
            connection.disconnect().await,
            Err(TransportError::NotConnected)
        ));

        connection.connect(&address).await.unwrap();
        let _peer = listener.accept().await.unwrap();
        assert!(matches!(
            connection.connect(&address).await,
            Err(TransportError::AlreadyConnected)
        ));
        connection.disconnect().await.unwrap();
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn refused_endpoint_is_an_io_error() {
        let (listener, address) = fake_daemon().await;
        drop(listener);
        let connection = IpConnection::with_options(DEFAULT_TIMEOUT, false);

        assert!(matches!(
            connection.connect(&address).await,
            Err(TransportError::Io(_))
        ));
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn sequence_numbers_cycle_without_zero() {
        let connection = IpConnection::new();
        let seqs: Vec<u8> = (0..16).map(|_| connection.inner.next_sequence()).collect();
        assert_eq!(seqs[0], 1);
        assert_eq!(seqs[14], 15);
        assert_eq!(seqs[15], 1);
        assert!(!seqs.contains(&0));
    }
}
