use crate::config::{ClusterOptionsValidated, MulticastConfig, TransportKind};
use crate::coordinator::ClusterCounters;
use crate::coordinator::ServerRegistry;
use crate::event::ChangeEvent;
use crate::processor::RequestProcessor;
use crate::sequencer::{InboundSequencer, OutboundSequencer};
use crate::transport::{OfferError, Transport, TransportStartError, TransportStatus};
use crate::wire::{self, AckMessage, Envelope, NackMessage};
use bytes::Bytes;
use rand::Rng;
use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Events batched into one packet when the outbound queue has a backlog.
const MAX_BATCH: usize = 16;
/// Bound on escalation loops: a full invalidate whose own send escalates more peers.
const MAX_ESCALATION_ROUNDS: usize = 4;
const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// One shared datagram medium: every send reaches every member, unreliably. Production
/// uses the multicast group socket; tests substitute an in-process link so loss can be
/// injected deterministically.
#[async_trait::async_trait]
pub(crate) trait GroupLink: Send + Sync {
    async fn send(&self, bytes: &[u8]) -> io::Result<usize>;
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;
}

struct UdpGroupLink {
    socket: UdpSocket,
    group_addr: SocketAddr,
}

#[async_trait::async_trait]
impl GroupLink for UdpGroupLink {
    async fn send(&self, bytes: &[u8]) -> io::Result<usize> {
        self.socket.send_to(bytes, self.group_addr).await
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.socket.recv_from(buf).await.map(|(len, _from)| len)
    }
}

/// Best-effort UDP multicast made reliable by the sequencer: every cluster broadcast goes
/// to the group address, receivers restore order and nack holes, and a periodic timer
/// drives ack emission and the retransmission sweep.
pub(crate) struct MulticastTransport {
    outbound_tx: mpsc::Sender<ChangeEvent>,
    worker: Arc<MulticastWorker>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MulticastTransport {
    pub async fn start(
        logger: slog::Logger,
        local_node_id: String,
        config: &MulticastConfig,
        options: &ClusterOptionsValidated,
        processor: Arc<RequestProcessor>,
        registry: Arc<ServerRegistry>,
        counters: Arc<ClusterCounters>,
    ) -> Result<Self, TransportStartError> {
        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.port))
            .await
            .map_err(TransportStartError::Bind)?;
        socket
            .join_multicast_v4(config.group, config.interface)
            .map_err(TransportStartError::JoinGroup)?;
        // Loopback on: peers on the same host must hear us. Our own packets are filtered
        // by sender id in the receive path.
        socket
            .set_multicast_loop_v4(true)
            .map_err(TransportStartError::JoinGroup)?;
        slog::info!(logger, "Multicast transport joined {}:{} as '{}'", config.group, config.port, local_node_id);

        let link = Arc::new(UdpGroupLink {
            socket,
            group_addr: SocketAddr::V4(SocketAddrV4::new(config.group, config.port)),
        });

        Ok(Self::start_on_link(logger, local_node_id, link, options, processor, registry, counters))
    }

    /// Wire the worker, sequencer, and background tasks onto an already-established group
    /// link. Tests call this directly with an in-process link.
    pub(crate) fn start_on_link(
        logger: slog::Logger,
        local_node_id: String,
        link: Arc<dyn GroupLink>,
        options: &ClusterOptionsValidated,
        processor: Arc<RequestProcessor>,
        registry: Arc<ServerRegistry>,
        counters: Arc<ClusterCounters>,
    ) -> Self {
        let sequencer = OutboundSequencer::new(
            logger.clone(),
            local_node_id.clone(),
            current_epoch(),
            options.resend_timeout,
            options.retry_budget,
            options.outgoing_cache_capacity,
            options.silence_timeout,
        );

        let worker = Arc::new(MulticastWorker {
            logger: logger.clone(),
            local_node_id,
            link,
            sequencer,
            inbound: Mutex::new(HashMap::new()),
            reorder_window: options.reorder_window,
            processor,
            registry,
            counters,
        });

        slog::info!(
            logger,
            "Multicast transport started as '{}' (epoch {})",
            worker.local_node_id,
            worker.sequencer.group_epoch()
        );

        let (outbound_tx, outbound_rx) = mpsc::channel(options.outbound_queue_depth);
        let cancel = CancellationToken::new();
        let tasks = vec![
            tokio::spawn(send_task(worker.clone(), outbound_rx, cancel.clone())),
            tokio::spawn(receive_task(worker.clone(), cancel.clone())),
            tokio::spawn(timer_task(worker.clone(), options.ack_interval, cancel.clone())),
        ];

        MulticastTransport {
            outbound_tx,
            worker,
            cancel,
            tasks: Mutex::new(tasks),
        }
    }
}

#[async_trait::async_trait]
impl Transport for MulticastTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Multicast
    }

    fn offer(&self, event: ChangeEvent) -> Result<(), OfferError> {
        self.outbound_tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => OfferError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => OfferError::Stopped,
        })
    }

    fn status(&self) -> TransportStatus {
        let snapshot = self.worker.sequencer.snapshot();
        TransportStatus {
            group_size: snapshot.group_size,
            outgoing_cache_size: snapshot.outgoing_cache_size,
            current_packet_id: snapshot.current_packet_id,
            min_acked_packet_id: snapshot.min_acked_packet_id,
            ack_digest: snapshot.ack_digest,
        }
    }

    async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
        for task in tasks {
            if tokio::time::timeout(SHUTDOWN_JOIN_TIMEOUT, task).await.is_err() {
                // Soft shutdown: a hung task is left behind rather than force-killed.
                slog::warn!(self.worker.logger, "Multicast task did not stop within the join timeout");
            }
        }
        slog::info!(self.worker.logger, "Multicast transport stopped");
    }
}

struct MulticastWorker {
    logger: slog::Logger,
    local_node_id: String,
    link: Arc<dyn GroupLink>,
    sequencer: OutboundSequencer,
    /// One reorder buffer per remote sender.
    inbound: Mutex<HashMap<String, InboundSequencer>>,
    reorder_window: usize,
    processor: Arc<RequestProcessor>,
    registry: Arc<ServerRegistry>,
    counters: Arc<ClusterCounters>,
}

impl MulticastWorker {
    /// Sequence and transmit one batch. Returns peers escalated by capacity eviction.
    async fn broadcast_events(&self, events: Vec<ChangeEvent>, barrier_for: Option<&[String]>) -> Vec<String> {
        let payload = match wire::encode(&events) {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                slog::error!(self.logger, "Failed to encode {} events: {}", events.len(), e);
                return Vec::new();
            }
        };

        let prepared = self.sequencer.next_packet(payload, Instant::now());
        if let Some(peers) = barrier_for {
            self.sequencer.set_resync_barrier(peers, prepared.packet.packet_id);
        }

        ClusterCounters::add(&self.counters.events_sent, events.len() as u64);
        ClusterCounters::incr(&self.counters.packets_sent);
        self.send_envelope(&Envelope::Packet(prepared.packet)).await;

        prepared.escalated
    }

    /// Broadcast with escalation follow-up: any peer the cache had to abandon gets healed
    /// by a full invalidate.
    async fn broadcast(&self, events: Vec<ChangeEvent>) {
        let escalated = self.broadcast_events(events, None).await;
        if !escalated.is_empty() {
            self.heal_peers(escalated).await;
        }
    }

    /// Send the full invalidate that returns lagging peers to sync. Sending it can itself
    /// escalate further peers (capacity eviction), so loop with a bound.
    async fn heal_peers(&self, peers: Vec<String>) {
        let mut escalated = self.send_full_invalidate(&peers).await;
        let mut rounds = 0;
        while !escalated.is_empty() && rounds < MAX_ESCALATION_ROUNDS {
            rounds += 1;
            escalated = self.send_full_invalidate(&escalated).await;
        }
    }

    async fn send_full_invalidate(&self, peers: &[String]) -> Vec<String> {
        let names = self.registry.names();
        if names.is_empty() {
            slog::warn!(self.logger, "Resync needed for {:?} but no server is registered", peers);
            return Vec::new();
        }
        slog::info!(self.logger, "Broadcasting full invalidate to heal peers {:?}", peers);
        let events: Vec<ChangeEvent> = names.into_iter().map(ChangeEvent::full_invalidate).collect();
        self.broadcast_events(events, Some(peers)).await
    }

    async fn handle_datagram(&self, datagram: &[u8]) {
        let envelope = match wire::decode::<Envelope>(datagram) {
            Ok(envelope) => envelope,
            Err(e) => {
                ClusterCounters::incr(&self.counters.malformed_payloads);
                slog::warn!(self.logger, "Discarding undecodable datagram: {}", e);
                return;
            }
        };

        match envelope {
            Envelope::Packet(packet) => self.handle_packet(packet).await,
            Envelope::Ack(ack) => self.handle_ack(ack),
            Envelope::Nack(nack) => self.handle_nack(nack).await,
            other => {
                slog::debug!(self.logger, "Ignoring unexpected envelope on multicast: {:?}", other);
            }
        }
    }

    async fn handle_packet(&self, packet: wire::Packet) {
        if packet.sender_id == self.local_node_id {
            return; // our own loopback copy
        }

        ClusterCounters::incr(&self.counters.packets_received);
        self.sequencer.note_traffic(&packet.sender_id, Instant::now());

        // Decode before sequencing: a full invalidate is applied authoritatively, and a
        // malformed payload must not advance the watermark (the sender will resend it).
        let events = match packet.events() {
            Ok(events) => events,
            Err(e) => {
                ClusterCounters::incr(&self.counters.malformed_payloads);
                slog::warn!(
                    self.logger,
                    "Discarding malformed payload in packet {} from '{}': {}",
                    packet.packet_id,
                    packet.sender_id,
                    e
                );
                return;
            }
        };
        let authoritative = events.iter().any(|e| e.is_full_invalidate());
        let incoming_id = packet.packet_id;
        let origin_id = packet.sender_id.clone();

        let accepted = {
            let mut inbound = self.inbound.lock().unwrap();
            let entry = inbound
                .entry(packet.sender_id.clone())
                .or_insert_with(|| InboundSequencer::new(packet.sender_id.clone(), self.reorder_window));
            if authoritative {
                entry.accept_authoritative(packet)
            } else {
                entry.accept(packet)
            }
        };

        if accepted.duplicate {
            ClusterCounters::incr(&self.counters.duplicate_packets);
            return;
        }

        for deliverable in &accepted.deliver {
            if deliverable.packet_id == incoming_id {
                self.processor.apply_all(&events);
            } else {
                // A buffered packet released by this arrival; decoded on its own.
                let _ = self.processor.apply_packet(deliverable);
            }
        }

        if let Some(missing) = accepted.nack {
            let nack = Envelope::Nack(NackMessage {
                sender_id: self.local_node_id.clone(),
                origin_id,
                missing,
            });
            self.send_envelope(&nack).await;
        }
    }

    fn handle_ack(&self, ack: AckMessage) {
        if ack.origin_id == self.local_node_id {
            self.sequencer.record_ack(&ack.sender_id, ack.acked_up_to, Instant::now());
        } else {
            // Someone else's ack still proves the peer is alive.
            self.sequencer.note_traffic(&ack.sender_id, Instant::now());
        }
    }

    async fn handle_nack(&self, nack: NackMessage) {
        if nack.origin_id != self.local_node_id {
            self.sequencer.note_traffic(&nack.sender_id, Instant::now());
            return;
        }

        let reply = self.sequencer.record_nack(&nack.sender_id, &nack.missing, Instant::now());
        for packet in reply.resend {
            ClusterCounters::incr(&self.counters.packets_resent);
            self.send_envelope(&Envelope::Packet(packet)).await;
        }
        if reply.resync_required {
            self.heal_peers(vec![nack.sender_id]).await;
        }
    }

    /// Emit one cumulative ack per sender whose watermark advanced since the last tick.
    async fn emit_acks(&self) {
        let due: Vec<(String, u64)> = {
            let mut inbound = self.inbound.lock().unwrap();
            inbound
                .values_mut()
                .filter_map(|seq| seq.take_ack().map(|up_to| (seq.origin_id().to_string(), up_to)))
                .collect()
        };

        for (origin_id, acked_up_to) in due {
            let ack = Envelope::Ack(AckMessage {
                sender_id: self.local_node_id.clone(),
                origin_id,
                acked_up_to,
            });
            self.send_envelope(&ack).await;
        }
    }

    async fn run_sweep(&self) {
        let sweep = self.sequencer.sweep(Instant::now());
        for packet in sweep.resend {
            ClusterCounters::incr(&self.counters.packets_resent);
            self.send_envelope(&Envelope::Packet(packet)).await;
        }
        if !sweep.resync_peers.is_empty() {
            self.heal_peers(sweep.resync_peers).await;
        }
    }

    async fn send_envelope(&self, envelope: &Envelope) {
        let bytes = match wire::encode(envelope) {
            Ok(bytes) => bytes,
            Err(e) => {
                slog::error!(self.logger, "Failed to encode envelope: {}", e);
                return;
            }
        };
        match self.link.send(&bytes).await {
            Ok(sent) => ClusterCounters::add(&self.counters.bytes_sent, sent as u64),
            Err(e) => {
                // Transient network error: logged, never surfaced to the commit path.
                slog::warn!(self.logger, "Multicast send failed: {}", e);
            }
        }
    }
}

async fn send_task(worker: Arc<MulticastWorker>, mut outbound_rx: mpsc::Receiver<ChangeEvent>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = outbound_rx.recv() => {
                let event = match received {
                    Some(event) => event,
                    None => break,
                };
                let mut events = vec![event];
                while events.len() < MAX_BATCH {
                    match outbound_rx.try_recv() {
                        Ok(more) => events.push(more),
                        Err(_) => break,
                    }
                }
                worker.broadcast(events).await;
            }
        }
    }
    slog::debug!(worker.logger, "Multicast send task exited");
}

async fn receive_task(worker: Arc<MulticastWorker>, cancel: CancellationToken) {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = worker.link.recv(&mut buf) => {
                match received {
                    Ok(len) => {
                        ClusterCounters::add(&worker.counters.bytes_received, len as u64);
                        worker.handle_datagram(&buf[..len]).await;
                    }
                    Err(e) => {
                        slog::warn!(worker.logger, "Multicast receive error: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }
    slog::debug!(worker.logger, "Multicast receive task exited");
}

async fn timer_task(worker: Arc<MulticastWorker>, ack_interval: Duration, cancel: CancellationToken) {
    // Jitter the first tick so a fleet restarted together doesn't ack in lockstep.
    let jitter_ms = rand::thread_rng().gen_range(0..=(ack_interval.as_millis() as u64 / 2).max(1));
    tokio::select! {
        _ = cancel.cancelled() => return,
        _ = tokio::time::sleep(Duration::from_millis(jitter_ms)) => {}
    }

    let mut interval = tokio::time::interval(ack_interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                worker.emit_acks().await;
                worker.run_sweep().await;
            }
        }
    }
    slog::debug!(worker.logger, "Multicast timer task exited");
}

fn current_epoch() -> u32 {
    // Millisecond-truncated wall clock: unique enough to distinguish process restarts.
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u32)
        .unwrap_or(1)
        .max(1)
}
