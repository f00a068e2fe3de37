use crate::config::{ClusterOptionsValidated, SocketConfig, TransportKind};
use crate::coordinator::ClusterCounters;
use crate::event::ChangeEvent;
use crate::processor::RequestProcessor;
use crate::transport::{OfferError, Transport, TransportStartError, TransportStatus};
use crate::wire::{self, Envelope, FrameError, Receipt};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Point-to-point TCP to a static peer list, for clusters where multicast is unavailable
/// or crosses subnets. TCP supplies the reliability, so there is no packet-id/ack layer;
/// each frame is acknowledged by an in-band receipt.
pub(crate) struct SocketTransport {
    logger: slog::Logger,
    peer_queues: Vec<(SocketAddr, mpsc::Sender<ChangeEvent>)>,
    local_addr: SocketAddr,
    counters: Arc<ClusterCounters>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SocketTransport {
    pub async fn start(
        logger: slog::Logger,
        local_node_id: String,
        config: &SocketConfig,
        options: &ClusterOptionsValidated,
        processor: Arc<RequestProcessor>,
        counters: Arc<ClusterCounters>,
    ) -> Result<Self, TransportStartError> {
        let listener = TcpListener::bind(("0.0.0.0", config.listen_port))
            .await
            .map_err(TransportStartError::Bind)?;
        let local_addr = listener.local_addr().map_err(TransportStartError::Bind)?;
        slog::info!(logger, "Socket transport listening on {}", local_addr);

        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        // Fixed worker pool behind a bounded queue: a burst of inbound connections applies
        // backpressure at the accept loop instead of exhausting memory.
        let (conn_tx, conn_rx) = flume::bounded::<TcpStream>(options.worker_pool_size * 2);
        for worker_id in 0..options.worker_pool_size {
            tasks.push(tokio::spawn(worker_task(
                logger.clone(),
                worker_id,
                conn_rx.clone(),
                processor.clone(),
                counters.clone(),
                cancel.clone(),
            )));
        }
        tasks.push(tokio::spawn(listener_task(logger.clone(), listener, conn_tx, cancel.clone())));

        let mut peer_queues = Vec::with_capacity(config.peers.len());
        for peer_addr in &config.peers {
            let (event_tx, event_rx) = mpsc::channel::<ChangeEvent>(options.outbound_queue_depth);
            peer_queues.push((*peer_addr, event_tx));
            tasks.push(tokio::spawn(peer_sender_task(
                logger.clone(),
                local_node_id.clone(),
                *peer_addr,
                event_rx,
                options.send_retries,
                options.io_timeout,
                counters.clone(),
                cancel.clone(),
            )));
        }

        Ok(SocketTransport {
            logger,
            peer_queues,
            local_addr,
            counters,
            cancel,
            tasks: Mutex::new(tasks),
        })
    }

    /// Actual listening address; useful when configured with port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[async_trait::async_trait]
impl Transport for SocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Socket
    }

    /// Fan out to every peer queue. A lagging peer drops its own copy; it never blocks the
    /// committing transaction or the other peers.
    fn offer(&self, event: ChangeEvent) -> Result<(), OfferError> {
        if self.peer_queues.is_empty() {
            return Ok(());
        }

        let mut all_closed = true;
        for (peer_addr, queue) in &self.peer_queues {
            match queue.try_send(event.clone()) {
                Ok(()) => all_closed = false,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    all_closed = false;
                    ClusterCounters::incr(&self.counters.events_dropped);
                    slog::warn!(self.logger, "Outbound queue for peer {} is full, dropping event", peer_addr);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }

        if all_closed {
            Err(OfferError::Stopped)
        } else {
            Ok(())
        }
    }

    fn status(&self) -> TransportStatus {
        TransportStatus {
            group_size: self.peer_queues.len(),
            ..TransportStatus::default()
        }
    }

    async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
        for task in tasks {
            if tokio::time::timeout(SHUTDOWN_JOIN_TIMEOUT, task).await.is_err() {
                slog::warn!(self.logger, "Socket transport task did not stop within the join timeout");
            }
        }
        slog::info!(self.logger, "Socket transport stopped");
    }
}

async fn listener_task(
    logger: slog::Logger,
    listener: TcpListener,
    conn_tx: flume::Sender<TcpStream>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, remote)) => {
                        slog::debug!(logger, "Accepted cluster connection from {}", remote);
                        if conn_tx.send_async(stream).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        slog::warn!(logger, "Accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }
    slog::debug!(logger, "Socket listener task exited");
}

async fn worker_task(
    logger: slog::Logger,
    worker_id: usize,
    conn_rx: flume::Receiver<TcpStream>,
    processor: Arc<RequestProcessor>,
    counters: Arc<ClusterCounters>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = conn_rx.recv_async() => {
                match received {
                    Ok(stream) => serve_connection(&logger, stream, &processor, &counters, &cancel).await,
                    Err(_) => break,
                }
            }
        }
    }
    slog::debug!(logger, "Socket worker {} exited", worker_id);
}

/// Serve framed requests on one accepted connection until the peer closes it or shutdown
/// is requested. Each frame gets a receipt so the sender can retry failures.
async fn serve_connection(
    logger: &slog::Logger,
    mut stream: TcpStream,
    processor: &RequestProcessor,
    counters: &ClusterCounters,
    cancel: &CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = wire::read_frame(&mut stream) => frame,
        };

        let bytes = match frame {
            Ok(bytes) => bytes,
            Err(FrameError::Closed) => break,
            Err(e) => {
                slog::warn!(logger, "Dropping cluster connection after read error: {}", e);
                break;
            }
        };
        ClusterCounters::incr(&counters.packets_received);
        ClusterCounters::add(&counters.bytes_received, bytes.len() as u64);

        let receipt = match wire::decode::<Envelope>(&bytes) {
            Ok(Envelope::Events { sender_id, events }) => {
                slog::debug!(logger, "Applying {} events from '{}'", events.len(), sender_id);
                processor.apply_all(&events);
                Receipt { ok: true, detail: None }
            }
            Ok(other) => {
                slog::warn!(logger, "Unexpected envelope on socket transport: {:?}", other);
                Receipt {
                    ok: false,
                    detail: Some("unexpected envelope".to_string()),
                }
            }
            Err(e) => {
                // Corrupt bytes cannot be fixed by retrying; tell the sender and move on.
                ClusterCounters::incr(&counters.malformed_payloads);
                slog::warn!(logger, "Discarding malformed frame: {}", e);
                Receipt {
                    ok: false,
                    detail: Some(e.to_string()),
                }
            }
        };

        let reply = match wire::encode(&Envelope::Receipt(receipt)) {
            Ok(reply) => reply,
            Err(_) => break,
        };
        if let Err(e) = wire::write_frame(&mut stream, &reply).await {
            slog::debug!(logger, "Failed to write receipt: {}", e);
            break;
        }
    }
}

/// One background sender per configured peer. Owns the connection, retries with
/// reconnection, and drops an event once the retry budget is spent.
async fn peer_sender_task(
    logger: slog::Logger,
    local_node_id: String,
    peer_addr: SocketAddr,
    mut event_rx: mpsc::Receiver<ChangeEvent>,
    send_retries: u32,
    io_timeout: Duration,
    counters: Arc<ClusterCounters>,
    cancel: CancellationToken,
) {
    let mut connection: Option<TcpStream> = None;

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            received = event_rx.recv() => match received {
                Some(event) => event,
                None => break,
            },
        };

        let envelope = Envelope::Events {
            sender_id: local_node_id.clone(),
            events: vec![event],
        };
        let frame = match wire::encode(&envelope) {
            Ok(frame) => frame,
            Err(e) => {
                slog::error!(logger, "Failed to encode event for {}: {}", peer_addr, e);
                continue;
            }
        };

        let mut delivered = false;
        for attempt in 0..=send_retries {
            if connection.is_none() {
                match tokio::time::timeout(io_timeout, TcpStream::connect(peer_addr)).await {
                    Ok(Ok(stream)) => connection = Some(stream),
                    Ok(Err(e)) => {
                        slog::debug!(logger, "Connect to {} failed (attempt {}): {}", peer_addr, attempt, e);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                    Err(_) => {
                        slog::debug!(logger, "Connect to {} timed out (attempt {})", peer_addr, attempt);
                        continue;
                    }
                }
            }

            let stream = connection.as_mut().unwrap();
            match send_and_confirm(stream, &frame, io_timeout).await {
                Ok(()) => {
                    ClusterCounters::incr(&counters.events_sent);
                    ClusterCounters::incr(&counters.packets_sent);
                    ClusterCounters::add(&counters.bytes_sent, frame.len() as u64);
                    delivered = true;
                    break;
                }
                Err(e) => {
                    slog::debug!(logger, "Send to {} failed (attempt {}): {}", peer_addr, attempt, e);
                    connection = None;
                }
            }
        }

        if !delivered {
            ClusterCounters::incr(&counters.events_dropped);
            slog::warn!(
                logger,
                "Dropping event for peer {} after {} attempts; peer will self-heal on next successful delivery",
                peer_addr,
                send_retries + 1
            );
        }
    }
    slog::debug!(logger, "Peer sender for {} exited", peer_addr);
}

async fn send_and_confirm(stream: &mut TcpStream, frame: &[u8], io_timeout: Duration) -> Result<(), FrameError> {
    tokio::time::timeout(io_timeout, wire::write_frame(stream, frame))
        .await
        .map_err(|_| FrameError::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "write timed out")))??;

    let reply = tokio::time::timeout(io_timeout, wire::read_frame(stream))
        .await
        .map_err(|_| FrameError::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "receipt timed out")))??;

    match wire::decode::<Envelope>(&reply) {
        Ok(Envelope::Receipt(receipt)) if receipt.ok => Ok(()),
        Ok(Envelope::Receipt(receipt)) => Err(FrameError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            receipt.detail.unwrap_or_else(|| "peer rejected frame".to_string()),
        ))),
        Ok(_) => Err(FrameError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "peer sent a non-receipt reply",
        ))),
        Err(e) => Err(FrameError::Wire(e)),
    }
}
