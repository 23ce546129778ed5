//! XEP-0198 stream management service binary.
//!
//! Runs the stream management layer behind a plain TCP listener. Each
//! connection gets a stream header advertising stream management; management
//! elements go to the [`StreamManager`], other stanzas are counted as handled
//! and echoed back through the managed stream so acknowledgment, buffering and
//! resumption can be exercised end to end.

use anyhow::Context;
use bytes::{Buf, Bytes, BytesMut};
use clap::Parser;
use sm_session::{
    listen_tcp, ChannelTransport, ManagedStream, ResumptionId, SmEventHandler, StreamError, StreamManager,
    Transport, TransportLoss,
};
use sm_storage::OutboundRecord;
use sm_wire::{extract_frame_bounded, parse_element, stream_error, Frame, WireError};
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::ServerConfig;
use logging::SmLogFormatter;

/// XEP-0198 stream management service
#[derive(Parser, Debug)]
#[command(name = "xmpp-sm", version, about = "XEP-0198 stream management service")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Listen address, e.g. 127.0.0.1:5222
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Send an unsolicited <a/> every N inbound stanzas (0 = only on <r/>)
    #[arg(long)]
    ack_frequency: Option<u32>,

    /// Send <r/> every N unacknowledged outbound stanzas (0 = never)
    #[arg(long)]
    request_frequency: Option<u32>,

    /// How long a detached session stays resumable, e.g. 5m
    #[arg(long)]
    resumption_ttl: Option<humantime::Duration>,

    /// Maximum number of unacknowledged stanzas per session
    #[arg(long)]
    max_unacked: Option<usize>,

    /// Never offer resumption
    #[arg(long)]
    no_resumption: bool,
}

impl Args {
    fn apply_to(&self, config: &mut ServerConfig) {
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(n) = self.ack_frequency {
            config.sm.ack_frequency = n;
        }
        if let Some(n) = self.request_frequency {
            config.sm.request_frequency = n;
        }
        if let Some(ttl) = &self.resumption_ttl {
            config.sm.resumption_ttl = **ttl;
        }
        if let Some(n) = self.max_unacked {
            config.sm.max_unacked_buffer_size = n;
        }
        if self.no_resumption {
            config.sm.resumption_enabled = false;
        }
    }
}

/// Logs session lifecycle events
#[derive(Debug)]
struct LoggingEvents;

impl SmEventHandler for LoggingEvents {
    fn notify_detached(&self, id: &ResumptionId) {
        crate::component_debug!("registry", "Session {} is resumable", id);
    }

    fn notify_resumed(&self, id: &ResumptionId, replayed: usize) {
        crate::component_info!("registry", "Session {} resumed, {} stanzas retransmitted", id, replayed);
    }

    fn notify_undelivered(&self, label: &str, undelivered: Vec<OutboundRecord>) {
        crate::component_warn!(
            "router",
            "[{}] {} stanzas were never acknowledged and have no route",
            label,
            undelivered.len()
        );
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("xmpp_sm={}", args.log_level).parse()?)
        .add_directive(format!("sm_session={}", args.log_level).parse()?)
        .add_directive(format!("sm_storage={}", args.log_level).parse()?)
        .add_directive(format!("sm_wire={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(true)
        .event_format(SmLogFormatter::new("xmpp-sm".to_string()))
        .init();

    info!("Starting XMPP stream management service v{}", env!("CARGO_PKG_VERSION"));

    let mut config = ServerConfig::load_from_file(&args.config)?;
    args.apply_to(&mut config);

    let mut manager = StreamManager::new(config.sm_config()).context("Invalid stream management configuration")?;
    manager.set_event_handler(Arc::new(LoggingEvents));
    let manager = Arc::new(manager);
    manager.start();

    let listener = listen_tcp(config.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen))?;
    info!("Listening on {}", config.listen);

    let config = Arc::new(config);

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to install SIGTERM handler: {}", e))?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("Failed to install SIGINT handler: {}", e))?;

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, peer)) => {
                        let manager = Arc::clone(&manager);
                        let config = Arc::clone(&config);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(manager, config, socket, peer).await {
                                warn!("Connection {} ended with error: {:#}", peer, e);
                            }
                        });
                    }
                    Err(e) => warn!("Accept failed: {}", e),
                }
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
                break;
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down");
                break;
            }
        }
    }

    manager.shutdown().await;
    info!("Stream management service stopped");
    Ok(())
}

/// How long a closing connection may take to write out what is queued
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

fn stream_header(domain: &str) -> String {
    format!(
        "<?xml version='1.0'?><stream:stream xmlns='jabber:client' \
         xmlns:stream='http://etherx.jabber.org/streams' from='{}' id='{}' version='1.0'>\
         <stream:features><sm xmlns='urn:xmpp:sm:2'/><sm xmlns='urn:xmpp:sm:3'/></stream:features>",
        domain,
        uuid::Uuid::new_v4().simple()
    )
}

async fn handle_connection(
    manager: Arc<StreamManager>,
    config: Arc<ServerConfig>,
    socket: TcpStream,
    peer: SocketAddr,
) -> anyhow::Result<()> {
    let label = peer.to_string();
    let (mut reader, writer) = socket.into_split();
    let (transport, writer_task) = ChannelTransport::spawn(label.clone(), config.write_queue, writer);
    let stream = manager.open_stream(transport.clone(), &label);
    info!("[{}] Connection accepted", stream.label());

    let closed = Arc::new(Notify::new());
    {
        let closed = Arc::clone(&closed);
        transport.on_close(Box::new(move || closed.notify_one()));
    }

    // Echoes go through their own task so a full buffer never stalls reading acks
    let (echo_tx, echo_rx) = mpsc::unbounded_channel::<Bytes>();
    let echo_task = tokio::spawn(run_echo(Arc::clone(&stream), echo_rx));

    let mut buf = BytesMut::with_capacity(8192);
    let result = async {
        'read: loop {
            loop {
                let (frame, used) = match extract_frame_bounded(&buf, config.max_frame_size) {
                    Ok(Some(found)) => found,
                    Ok(None) => break,
                    Err(e @ WireError::FrameTooLarge { .. }) => {
                        warn!("[{}] Closing stream: {}", stream.label(), e);
                        let error = stream_error("policy-violation", &e.to_string());
                        if let Err(send_err) = stream.write_raw(Bytes::from(error)) {
                            debug!("[{}] Stream error not sent: {}", stream.label(), send_err);
                        }
                        break 'read;
                    }
                    Err(e) => return Err(e.into()),
                };
                buf.advance(used);
                if !handle_frame(&manager, &stream, &config, &echo_tx, frame)? {
                    break 'read;
                }
            }

            tokio::select! {
                read = reader.read_buf(&mut buf) => {
                    if read? == 0 {
                        debug!("[{}] Peer closed the socket", stream.label());
                        break 'read;
                    }
                }
                _ = closed.notified() => {
                    debug!("[{}] Transport closed locally", stream.label());
                    break 'read;
                }
            }
        }
        Ok::<(), anyhow::Error>(())
    }
    .await;

    drop(echo_tx);
    match manager.connection_closed(&stream) {
        TransportLoss::Detached(id) => info!("[{}] Connection lost, session {} detached", stream.label(), id),
        TransportLoss::Discarded { undelivered } => info!(
            "[{}] Connection closed ({} unacknowledged stanzas discarded)",
            stream.label(),
            undelivered.len()
        ),
    }
    if tokio::time::timeout(FLUSH_TIMEOUT, stream.finish()).await.is_err() {
        debug!("[{}] Peer is not reading, dropping queued writes", stream.label());
        writer_task.abort();
    }
    let _ = echo_task.await;
    let _ = writer_task.await;
    result
}

/// Handle one frame; returns false when the connection should end
fn handle_frame(
    manager: &StreamManager,
    stream: &Arc<ManagedStream>,
    config: &ServerConfig,
    echo_tx: &mpsc::UnboundedSender<Bytes>,
    frame: Frame,
) -> anyhow::Result<bool> {
    match frame {
        Frame::StreamOpen(_) => {
            stream.write_raw(Bytes::from(stream_header(&config.domain)))?;
        }
        Frame::StreamClose => {
            debug!("[{}] Peer closed the stream", stream.label());
            stream.formal_close();
            if let Err(e) = stream.write_raw(Bytes::from_static(b"</stream:stream>")) {
                debug!("[{}] Closing tag not sent: {}", stream.label(), e);
            }
            return Ok(false);
        }
        Frame::Element(xml) => match parse_element(&xml) {
            Ok(Some(element)) => match manager.process(stream, element) {
                Ok(()) => {}
                Err(StreamError::Session(e)) if e.is_fatal() => return Ok(false),
                Err(StreamError::Transport(_)) | Err(StreamError::Detached) => return Ok(false),
                Err(e) => debug!("[{}] Management element refused: {}", stream.label(), e),
            },
            Ok(None) => {
                stream.handle_inbound_stanza()?;
                if echo_tx.send(Bytes::from(xml)).is_err() {
                    return Ok(false);
                }
            }
            Err(e) => warn!("[{}] Malformed element ignored: {}", stream.label(), e),
        },
    }
    Ok(true)
}

async fn run_echo(stream: Arc<ManagedStream>, mut rx: mpsc::UnboundedReceiver<Bytes>) {
    while let Some(stanza) = rx.recv().await {
        if let Err(e) = stream.send_stanza_when_ready(stanza).await {
            debug!("[{}] Echo stopped: {}", stream.label(), e);
            break;
        }
    }
}
