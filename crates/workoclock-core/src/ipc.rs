//! Control channel between the foreground process and the enforcement process.
//!
//! Each side binds one UDP socket on a fixed loopback address. A datagram is a
//! bincode-encoded [`Envelope`]: a routing address naming the message kind and
//! an opaque payload. Sends are fire-and-forget; received messages are routed
//! to the handler registered for their kind.

use serde::{Deserialize, Serialize};
use std::{collections::HashMap, io, net::SocketAddr, sync::Arc};
use tokio::{
    net::UdpSocket,
    sync::{Mutex, RwLock},
    task::JoinHandle,
};

use crate::error::ChannelError;

const MAX_DATAGRAM: usize = 4096;

/// Longest status text [`ChannelMessage::status`] keeps; leaves room for the
/// envelope around it.
pub const MAX_STATUS_BYTES: usize = MAX_DATAGRAM - 64;

/// Routing key of a control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Liveness check, foreground to enforcement.
    Ping,
    /// Human-readable state, enforcement to foreground.
    StatusUpdate,
    /// Cooperative stop request, foreground to enforcement.
    Shutdown,
}

impl MessageKind {
    #[must_use]
    pub fn address(self) -> &'static str {
        match self {
            Self::Ping => "/ping",
            Self::StatusUpdate => "/status",
            Self::Shutdown => "/shutdown",
        }
    }

    #[must_use]
    pub fn from_address(address: &str) -> Option<Self> {
        match address {
            "/ping" => Some(Self::Ping),
            "/status" => Some(Self::StatusUpdate),
            "/shutdown" => Some(Self::Shutdown),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    Ping,
    StatusUpdate(String),
    Shutdown,
}

impl ChannelMessage {
    /// A status update cut to [`MAX_STATUS_BYTES`] on a char boundary.
    #[must_use]
    pub fn status(text: impl Into<String>) -> Self {
        let mut text = text.into();
        if text.len() > MAX_STATUS_BYTES {
            let mut end = MAX_STATUS_BYTES;
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            text.truncate(end);
        }
        Self::StatusUpdate(text)
    }

    #[must_use]
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Ping => MessageKind::Ping,
            Self::StatusUpdate(_) => MessageKind::StatusUpdate,
            Self::Shutdown => MessageKind::Shutdown,
        }
    }

    fn to_envelope(&self) -> Envelope {
        let payload = match self {
            Self::StatusUpdate(text) => text.as_bytes().to_vec(),
            Self::Ping | Self::Shutdown => Vec::new(),
        };
        Envelope {
            address: self.kind().address().to_string(),
            payload,
        }
    }

    /// `None` for addresses this side does not understand.
    fn from_envelope(envelope: Envelope) -> Option<Self> {
        match MessageKind::from_address(&envelope.address)? {
            MessageKind::Ping => Some(Self::Ping),
            MessageKind::Shutdown => Some(Self::Shutdown),
            MessageKind::StatusUpdate => match String::from_utf8(envelope.payload) {
                Ok(text) => Some(Self::StatusUpdate(text)),
                Err(e) => {
                    log::warn!("Dropping status update with invalid UTF-8 payload: {e}");
                    None
                }
            },
        }
    }
}

/// Wire frame.
#[derive(Serialize, Deserialize, Debug)]
struct Envelope {
    address: String,
    payload: Vec<u8>,
}

/// Callback invoked on the listener task. Must return quickly; hand long work
/// to another task.
pub type Handler = Arc<dyn Fn(ChannelMessage, SocketAddr) + Send + Sync>;

type Handlers = Arc<RwLock<HashMap<MessageKind, Handler>>>;

pub struct ControlChannel {
    socket: Arc<UdpSocket>,
    handlers: Handlers,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl ControlChannel {
    /// Bind the channel to its fixed local address.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Bind`] if the address is unavailable.
    pub async fn bind(addr: SocketAddr) -> Result<Self, ChannelError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| ChannelError::Bind { addr, source })?;
        log::debug!("Control channel bound to {addr}");

        Ok(Self {
            socket: Arc::new(socket),
            handlers: Arc::new(RwLock::new(HashMap::new())),
            listener: Mutex::new(None),
        })
    }

    /// # Errors
    ///
    /// Returns an error if the socket address cannot be queried.
    pub fn local_addr(&self) -> Result<SocketAddr, ChannelError> {
        Ok(self.socket.local_addr()?)
    }

    /// Register the handler for `kind`, replacing any previous one.
    pub async fn on<F>(&self, kind: MessageKind, handler: F)
    where
        F: Fn(ChannelMessage, SocketAddr) + Send + Sync + 'static,
    {
        self.handlers.write().await.insert(kind, Arc::new(handler));
    }

    /// Start dispatching inbound messages. Calling it again is a no-op.
    pub async fn start(&self) {
        let mut listener = self.listener.lock().await;
        if listener.is_some() {
            return;
        }
        let socket = Arc::clone(&self.socket);
        let handlers = Arc::clone(&self.handlers);
        *listener = Some(tokio::spawn(listen(socket, handlers)));
    }

    /// Stop dispatching. Registered handlers are kept.
    pub async fn close(&self) {
        if let Some(listener) = self.listener.lock().await.take() {
            listener.abort();
        }
    }

    /// Send `message` to `peer` without waiting for any acknowledgement.
    ///
    /// Nobody listening on `peer` is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be encoded, would not fit in one
    /// datagram, or the local socket fails.
    pub async fn send(&self, peer: SocketAddr, message: &ChannelMessage) -> Result<(), ChannelError> {
        let encoded = bincode::serialize(&message.to_envelope())?;
        if encoded.len() > MAX_DATAGRAM {
            return Err(ChannelError::TooLarge {
                size: encoded.len(),
                max: MAX_DATAGRAM,
            });
        }
        match self.socket.send_to(&encoded, peer).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                log::debug!("No listener at {peer}, dropped {:?}", message.kind());
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.get_mut().take() {
            listener.abort();
        }
    }
}

async fn listen(socket: Arc<UdpSocket>, handlers: Handlers) {
    let mut buf = vec![0; MAX_DATAGRAM];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, sender)) => {
                let Some(datagram) = buf.get(..n) else {
                    continue;
                };
                dispatch(&handlers, datagram, sender).await;
            }
            // A previous send to a closed port can surface here on some platforms.
            Err(e) => log::warn!("Control channel receive error: {e}"),
        }
    }
}

async fn dispatch(handlers: &Handlers, datagram: &[u8], sender: SocketAddr) {
    let envelope = match bincode::deserialize::<Envelope>(datagram) {
        Ok(envelope) => envelope,
        Err(e) => {
            log::warn!("Dropping undecodable datagram from {sender}: {e}");
            return;
        }
    };

    let address = envelope.address.clone();
    let Some(message) = ChannelMessage::from_envelope(envelope) else {
        log::debug!("Dropping message with unknown address '{address}' from {sender}");
        return;
    };

    let handler = handlers.read().await.get(&message.kind()).cloned();
    match handler {
        Some(handler) => handler(message, sender),
        None => log::debug!("No handler for {:?}, dropped", message.kind()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn test_addresses_round_trip() {
        for kind in [MessageKind::Ping, MessageKind::StatusUpdate, MessageKind::Shutdown] {
            assert_eq!(MessageKind::from_address(kind.address()), Some(kind));
        }
        assert_eq!(MessageKind::from_address("/bogus"), None);
    }

    #[tokio::test]
    async fn test_send_without_listener_is_ok() {
        let unused = std::net::UdpSocket::bind(loopback()).unwrap();
        let peer = unused.local_addr().unwrap();
        drop(unused);

        let channel = ControlChannel::bind(loopback()).await.unwrap();
        channel.send(peer, &ChannelMessage::Ping).await.unwrap();
        channel.send(peer, &ChannelMessage::Ping).await.unwrap();
    }

    #[tokio::test]
    async fn test_status_update_reaches_handler() {
        let foreground = ControlChannel::bind(loopback()).await.unwrap();
        let enforcement = ControlChannel::bind(loopback()).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        foreground
            .on(MessageKind::StatusUpdate, move |message, sender| {
                let _ = tx.send((message, sender));
            })
            .await;
        foreground.start().await;

        let text = ChannelMessage::StatusUpdate("Blocking: game, video".to_string());
        enforcement
            .send(foreground.local_addr().unwrap(), &text)
            .await
            .unwrap();

        let (message, sender) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message, text);
        assert_eq!(sender, enforcement.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_unknown_and_garbage_messages_are_dropped() {
        let channel = ControlChannel::bind(loopback()).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        channel
            .on(MessageKind::Ping, move |message, _| {
                let _ = tx.send(message);
            })
            .await;
        channel.start().await;

        let raw = std::net::UdpSocket::bind(loopback()).unwrap();
        let target = channel.local_addr().unwrap();
        let bogus = bincode::serialize(&Envelope {
            address: "/bogus".to_string(),
            payload: vec![1, 2, 3],
        })
        .unwrap();
        raw.send_to(&bogus, target).unwrap();
        raw.send_to(&[0xff, 0x00, 0x13], target).unwrap();
        raw.send_to(
            &bincode::serialize(&ChannelMessage::Ping.to_envelope()).unwrap(),
            target,
        )
        .unwrap();

        let message = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message, ChannelMessage::Ping);
    }

    #[tokio::test]
    async fn test_message_without_handler_is_dropped() {
        let channel = ControlChannel::bind(loopback()).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        channel
            .on(MessageKind::Shutdown, move |message, _| {
                let _ = tx.send(message);
            })
            .await;
        channel.start().await;

        let sender = ControlChannel::bind(loopback()).await.unwrap();
        let target = channel.local_addr().unwrap();
        sender.send(target, &ChannelMessage::Ping).await.unwrap();
        sender.send(target, &ChannelMessage::Shutdown).await.unwrap();

        let message = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message, ChannelMessage::Shutdown);
    }

    #[tokio::test]
    async fn test_oversized_message_is_refused() {
        let channel = ControlChannel::bind(loopback()).await.unwrap();
        let peer = channel.local_addr().unwrap();

        let raw = ChannelMessage::StatusUpdate("x".repeat(MAX_DATAGRAM));
        let result = channel.send(peer, &raw).await;
        assert!(matches!(
            result,
            Err(ChannelError::TooLarge { size, max }) if size > max && max == MAX_DATAGRAM
        ));
    }

    #[test]
    fn test_status_is_cut_on_char_boundary() {
        let ChannelMessage::StatusUpdate(text) = ChannelMessage::status("\u{e9}".repeat(MAX_STATUS_BYTES))
        else {
            panic!("expected a status update");
        };
        assert!(text.len() <= MAX_STATUS_BYTES);
        assert!(text.len() >= MAX_STATUS_BYTES - 1);
        assert!(text.chars().all(|c| c == '\u{e9}'));

        assert_eq!(
            ChannelMessage::status("Blocking: game"),
            ChannelMessage::StatusUpdate("Blocking: game".to_string())
        );
    }

    #[tokio::test]
    async fn test_long_status_is_delivered() {
        let foreground = ControlChannel::bind(loopback()).await.unwrap();
        let enforcement = ControlChannel::bind(loopback()).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        foreground
            .on(MessageKind::StatusUpdate, move |message, _| {
                let _ = tx.send(message);
            })
            .await;
        foreground.start().await;

        let message = ChannelMessage::status(format!("Blocking: {}", "game, ".repeat(2000)));
        enforcement
            .send(foreground.local_addr().unwrap(), &message)
            .await
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, message);
        let ChannelMessage::StatusUpdate(text) = received else {
            panic!("expected a status update");
        };
        assert_eq!(text.len(), MAX_STATUS_BYTES);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_bind_error() {
        let first = ControlChannel::bind(loopback()).await.unwrap();
        let taken = first.local_addr().unwrap();

        let result = ControlChannel::bind(taken).await;
        assert!(matches!(result, Err(ChannelError::Bind { addr, .. }) if addr == taken));
    }
}
