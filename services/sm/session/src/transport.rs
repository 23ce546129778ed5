//! Transport boundary for managed streams.
//!
//! Stream management only needs three things from a connection: a way to
//! write serialized bytes, a notification when the connection goes away,
//! and a liveness check. [`ChannelTransport`] implements this over a bounded
//! channel drained by a writer task, so any `AsyncWrite` (a TCP socket in
//! the server, a duplex pipe in tests) can sit underneath.

use crate::error::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Callback run once when a transport closes
pub type CloseCallback = Box<dyn FnOnce() + Send + 'static>;

/// Byte transport underneath a managed stream
#[async_trait]
pub trait Transport: Send + Sync {
    /// Write serialized bytes, in call order
    async fn send(&self, bytes: Bytes) -> Result<(), TransportError>;

    /// Register a callback for when the transport closes.
    ///
    /// Runs immediately if the transport is already closed.
    fn on_close(&self, callback: CloseCallback);

    /// True until the transport closes
    fn is_alive(&self) -> bool;

    /// Close the transport, running close callbacks
    fn close(&self);
}

/// Channel-backed transport drained by a writer task
pub struct ChannelTransport {
    label: String,
    tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    alive: AtomicBool,
    callbacks: Mutex<Vec<CloseCallback>>,
}

impl ChannelTransport {
    /// Create a transport whose writes appear on the returned receiver
    pub fn new(label: impl Into<String>, capacity: usize) -> (Arc<Self>, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity);
        let transport = Arc::new(Self {
            label: label.into(),
            tx: Mutex::new(Some(tx)),
            alive: AtomicBool::new(true),
            callbacks: Mutex::new(Vec::new()),
        });
        (transport, rx)
    }

    /// Create a transport writing into `writer` from a spawned task
    pub fn spawn<W>(label: impl Into<String>, capacity: usize, writer: W) -> (Arc<Self>, JoinHandle<()>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (transport, rx) = Self::new(label, capacity);
        let handle = tokio::spawn(run_writer(rx, writer, Arc::clone(&transport)));
        (transport, handle)
    }

    /// Label used in log lines
    pub fn label(&self) -> &str {
        &self.label
    }

    fn sender(&self) -> Option<mpsc::Sender<Bytes>> {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl std::fmt::Debug for ChannelTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelTransport")
            .field("label", &self.label)
            .field("alive", &self.is_alive())
            .finish()
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, bytes: Bytes) -> Result<(), TransportError> {
        let tx = match self.sender() {
            Some(tx) if self.is_alive() => tx,
            _ => return Err(TransportError::Closed),
        };
        trace!("[{}] Writing {} bytes", self.label, bytes.len());
        if tx.send(bytes).await.is_err() {
            self.close();
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    fn on_close(&self, callback: CloseCallback) {
        let mut callbacks = self.callbacks.lock().unwrap_or_else(|e| e.into_inner());
        if self.is_alive() {
            callbacks.push(callback);
        } else {
            drop(callbacks);
            callback();
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    fn close(&self) {
        let callbacks = {
            let mut guard = self.callbacks.lock().unwrap_or_else(|e| e.into_inner());
            if !self.alive.swap(false, Ordering::AcqRel) {
                return;
            }
            std::mem::take(&mut *guard)
        };
        // Dropping the sender lets the writer finish once the queue drains
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();

        debug!("[{}] Transport closed", self.label);
        for callback in callbacks {
            callback();
        }
    }
}

/// Drain queued writes into `writer` until the transport closes
pub async fn run_writer<W>(mut rx: mpsc::Receiver<Bytes>, mut writer: W, transport: Arc<ChannelTransport>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(bytes) = rx.recv().await {
        if let Err(e) = writer.write_all(&bytes).await {
            warn!("[{}] Write failed: {}", transport.label(), e);
            transport.close();
            return;
        }
        if let Err(e) = writer.flush().await {
            warn!("[{}] Flush failed: {}", transport.label(), e);
            transport.close();
            return;
        }
    }
    let _ = writer.shutdown().await;
    transport.close();
}

/// Create a TCP listener bound to the given address
pub async fn listen_tcp(addr: SocketAddr) -> tokio::io::Result<TcpListener> {
    TcpListener::bind(addr).await
}
