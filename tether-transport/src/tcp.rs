//! TCP signaling channel.
//!
//! The socket is owned by a spawned task; the [`TcpSignalingChannel`] handle
//! forwards outbound frames to it and the task reports events to observers.

use crate::channel::{ChannelEvent, ChannelObserver, Connector, SignalingChannel, close_code};
use crate::codec::ControlFrameCodec;
use crate::error::TransportError;
use crate::frame::SignalFrame;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tether_core::{ObserverId, ObserverSet};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

/// Configuration for a TCP signaling channel.
#[derive(Debug, Clone)]
pub struct TcpChannelConfig {
    /// Server address to connect to.
    pub server_addr: SocketAddr,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Maximum frame size in bytes.
    pub max_frame_size: usize,
    /// Enable TCP_NODELAY.
    pub tcp_nodelay: bool,
}

impl Default for TcpChannelConfig {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::from(([127, 0, 0, 1], 9000)),
            connect_timeout: Duration::from_secs(5),
            max_frame_size: 64 * 1024,
            tcp_nodelay: true,
        }
    }
}

impl TcpChannelConfig {
    /// Creates a config for the specified server address.
    #[must_use]
    pub fn new(server_addr: SocketAddr) -> Self {
        Self {
            server_addr,
            ..Default::default()
        }
    }

    /// Sets the connection timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the maximum frame size.
    #[must_use]
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Sets TCP_NODELAY option.
    #[must_use]
    pub fn tcp_nodelay(mut self, enabled: bool) -> Self {
        self.tcp_nodelay = enabled;
        self
    }
}

enum Outbound {
    Frame(SignalFrame),
    Close(u16),
}

#[derive(Default)]
struct Shared {
    ready: AtomicBool,
    closed: AtomicBool,
    close_requested: Mutex<Option<u16>>,
    observers: ObserverSet<dyn ChannelObserver>,
}

impl Shared {
    fn emit(&self, event: &ChannelEvent) {
        for (_, observer) in self.observers.snapshot() {
            observer.on_channel_event(event);
        }
    }

    fn fail(&self, message: String) {
        self.ready.store(false, Ordering::SeqCst);
        tracing::warn!("signaling channel failed: {}", message);
        self.emit(&ChannelEvent::Errored {
            message: message.clone(),
        });
        self.emit(&ChannelEvent::Closed {
            code: close_code::ABNORMAL,
            reason: message,
        });
    }

    fn finish_local_close(&self, code: u16) {
        self.ready.store(false, Ordering::SeqCst);
        self.emit(&ChannelEvent::Closing);
        self.emit(&ChannelEvent::Closed {
            code,
            reason: "closed locally".to_string(),
        });
    }
}

/// Signaling channel over a framed TCP stream.
pub struct TcpSignalingChannel {
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl TcpSignalingChannel {
    /// Starts connecting in the background and returns the channel handle.
    ///
    /// On a multi-threaded runtime the connection can resolve before an
    /// observer registered after this call is in place; use
    /// [`connect_observed`](Self::connect_observed) when the first events matter.
    ///
    /// # Errors
    /// Returns `TransportError::Channel` when called outside a tokio runtime.
    pub fn connect(config: TcpChannelConfig) -> Result<Arc<Self>, TransportError> {
        let runtime = Self::runtime()?;
        Ok(Self::spawn(config, Arc::new(Shared::default()), &runtime))
    }

    /// Registers `observer` and then starts connecting in the background.
    ///
    /// # Errors
    /// Returns `TransportError::Channel` when called outside a tokio runtime.
    pub fn connect_observed(
        config: TcpChannelConfig,
        observer: Arc<dyn ChannelObserver>,
    ) -> Result<(Arc<Self>, ObserverId), TransportError> {
        let runtime = Self::runtime()?;
        let shared = Arc::new(Shared::default());
        let id = shared.observers.insert(observer);
        Ok((Self::spawn(config, shared, &runtime), id))
    }

    fn runtime() -> Result<tokio::runtime::Handle, TransportError> {
        tokio::runtime::Handle::try_current()
            .map_err(|e| TransportError::channel(format!("no tokio runtime: {e}")))
    }

    fn spawn(
        config: TcpChannelConfig,
        shared: Arc<Shared>,
        runtime: &tokio::runtime::Handle,
    ) -> Arc<Self> {
        let (outbound, rx) = mpsc::unbounded_channel();
        runtime.spawn(run(config, Arc::clone(&shared), rx));
        Arc::new(Self { shared, outbound })
    }
}

async fn run(
    config: TcpChannelConfig,
    shared: Arc<Shared>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) {
    let stream = match tokio::time::timeout(
        config.connect_timeout,
        TcpStream::connect(config.server_addr),
    )
    .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return shared.fail(TransportError::Io(e).to_string()),
        Err(_) => return shared.fail(TransportError::ConnectTimeout.to_string()),
    };

    if let Err(e) = stream.set_nodelay(config.tcp_nodelay) {
        tracing::warn!("failed to set TCP_NODELAY: {}", e);
    }

    if let Some(code) = *shared.close_requested.lock() {
        return shared.finish_local_close(code);
    }

    tracing::info!("signaling channel connected to {}", config.server_addr);
    let mut framed = Framed::new(stream, ControlFrameCodec::new(config.max_frame_size));
    shared.ready.store(true, Ordering::SeqCst);
    shared.emit(&ChannelEvent::Opened);

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(Outbound::Frame(frame)) => {
                    if let Err(e) = framed.send(frame).await {
                        return shared.fail(e.to_string());
                    }
                }
                Some(Outbound::Close(code)) => {
                    if let Err(e) = SinkExt::<SignalFrame>::close(&mut framed).await {
                        tracing::debug!("error flushing channel on close: {}", e);
                    }
                    return shared.finish_local_close(code);
                }
                None => {
                    // Every handle is gone; nobody is left to observe the channel.
                    return;
                }
            },

            frame = framed.next() => match frame {
                Some(Ok(frame)) => shared.emit(&ChannelEvent::FrameReceived(frame)),
                Some(Err(e)) => return shared.fail(e.to_string()),
                None => {
                    shared.ready.store(false, Ordering::SeqCst);
                    shared.emit(&ChannelEvent::Closed {
                        code: close_code::ABNORMAL,
                        reason: "connection closed by peer".to_string(),
                    });
                    return;
                }
            },
        }
    }
}

impl SignalingChannel for TcpSignalingChannel {
    fn is_ready(&self) -> bool {
        self.shared.ready.load(Ordering::SeqCst)
    }

    fn send(&self, frame: SignalFrame) -> Result<(), TransportError> {
        if !self.is_ready() {
            return Err(TransportError::NotOpen);
        }
        self.outbound
            .send(Outbound::Frame(frame))
            .map_err(|_| TransportError::ConnectionClosed)
    }

    fn close(&self, code: u16) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.shared.close_requested.lock() = Some(code);
        // The task may already be gone after a remote close or failure.
        let _ = self.outbound.send(Outbound::Close(code));
    }

    fn register_observer(&self, observer: Arc<dyn ChannelObserver>) -> ObserverId {
        self.shared.observers.insert(observer)
    }

    fn remove_observer(&self, id: ObserverId) {
        self.shared.observers.remove(id);
    }
}

/// Connector opening a [`TcpSignalingChannel`] per call.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    config: TcpChannelConfig,
}

impl TcpConnector {
    /// Creates a connector for the given configuration.
    #[must_use]
    pub fn new(config: TcpChannelConfig) -> Self {
        Self { config }
    }

    /// Returns the channel configuration.
    #[must_use]
    pub fn config(&self) -> &TcpChannelConfig {
        &self.config
    }
}

impl Connector for TcpConnector {
    fn open(
        &self,
        observer: Arc<dyn ChannelObserver>,
    ) -> Result<(Arc<dyn SignalingChannel>, ObserverId), TransportError> {
        let (channel, id) = TcpSignalingChannel::connect_observed(self.config.clone(), observer)?;
        Ok((channel, id))
    }
}
