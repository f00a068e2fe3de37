use crate::config::{ClusterConfig, ClusterOptionsValidated, TransportKind};
use crate::coordinator::registry::{RegisterServerError, ServerHandle, ServerRegistry};
use crate::coordinator::status::{ClusterCounters, ClusterStatus};
use crate::event::ChangeEvent;
use crate::processor::RequestProcessor;
use crate::transport::{MulticastTransport, NullTransport, SocketTransport, Transport};
use std::convert::TryFrom;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};

/// The single process-wide entry point for cluster cache coherence. Local servers register
/// here; committed-transaction events are broadcast from here; inbound peer events are
/// routed from here to the right server's invalidation hook.
///
/// Nothing in this type ever blocks or fails a committing transaction: `broadcast` only
/// enqueues, and every failure below it is contained, logged, and retried or escalated
/// inside the transport.
pub struct ClusterCoordinator {
    logger: slog::Logger,
    config: ClusterConfig,
    options: Option<ClusterOptionsValidated>,
    registry: Arc<ServerRegistry>,
    processor: Arc<RequestProcessor>,
    counters: Arc<ClusterCounters>,
    /// Running transport, readable from the hot broadcast path without awaiting.
    active: RwLock<Option<Arc<dyn Transport>>>,
    /// Guards the start-once / stop-once lifecycle.
    lifecycle: Mutex<Lifecycle>,
    /// Bound listener address once the socket transport is running.
    socket_addr_slot: Mutex<Option<SocketAddr>>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Lifecycle {
    NotStarted,
    Starting,
    Running,
    Stopped,
}

impl ClusterCoordinator {
    /// Build a coordinator. A configuration error disables clustering with a loud log
    /// instead of failing the host process: a node still serves correctly from its own
    /// caches without cluster coherence, just possibly staler.
    pub fn new(config: ClusterConfig, logger: slog::Logger) -> Self {
        let registry = Arc::new(ServerRegistry::new());
        let counters = Arc::new(ClusterCounters::default());
        let processor = Arc::new(RequestProcessor::new(logger.clone(), registry.clone(), counters.clone()));

        let options = match ClusterOptionsValidated::try_from(config.options.clone()) {
            Ok(options) => Some(options),
            Err(e) => {
                slog::error!(
                    logger,
                    "CLUSTERING DISABLED: invalid cluster options ({}); this node will serve without cluster coherence",
                    e
                );
                None
            }
        };

        ClusterCoordinator {
            logger,
            config,
            options,
            registry,
            processor,
            counters,
            active: RwLock::new(None),
            lifecycle: Mutex::new(Lifecycle::NotStarted),
            socket_addr_slot: Mutex::new(None),
        }
    }

    /// Register a named local server. The transport is started lazily on the first
    /// registration; a process that never registers a server does no transport work.
    pub async fn register_server(&self, name: &str, handle: Arc<dyn ServerHandle>) -> Result<(), RegisterServerError> {
        self.registry.register(name, handle)?;
        slog::info!(self.logger, "Registered server '{}' for cluster invalidation", name);
        self.ensure_transport_started().await;
        Ok(())
    }

    /// Broadcast one committed transaction's changes to all peers. Fire-and-forget: hands
    /// the event to the transport's outbound queue and returns immediately, regardless of
    /// network health.
    pub fn broadcast(&self, event: ChangeEvent) {
        let active = self.active.read().unwrap();
        match active.as_ref() {
            Some(transport) => {
                if let Err(e) = transport.offer(event) {
                    // Saturation or shutdown: drop rather than stall the commit path.
                    ClusterCounters::incr(&self.counters.events_dropped);
                    slog::warn!(self.logger, "Dropping cluster broadcast: {}", e);
                }
            }
            None => {
                slog::debug!(self.logger, "No transport running, broadcast ignored");
            }
        }
    }

    /// Boundary called by the persistence layer on the committing thread. Alias of
    /// `broadcast`; must stay O(µs).
    pub fn notify_commit(&self, event: ChangeEvent) {
        self.broadcast(event)
    }

    /// Route an inbound event to its locally-registered server. Exposed for transports
    /// and for embedding tests; unroutable events are logged and dropped.
    pub fn apply(&self, event: &ChangeEvent) {
        self.processor.apply(event);
    }

    /// Read-only snapshot of live counters and reliability-layer state.
    pub fn status(&self) -> ClusterStatus {
        let (kind, transport_status) = {
            let active = self.active.read().unwrap();
            match active.as_ref() {
                Some(transport) => (transport.kind(), transport.status()),
                None => (TransportKind::Disabled, Default::default()),
            }
        };

        ClusterStatus {
            transport: kind,
            events_sent: ClusterCounters::get(&self.counters.events_sent),
            packets_sent: ClusterCounters::get(&self.counters.packets_sent),
            bytes_sent: ClusterCounters::get(&self.counters.bytes_sent),
            packets_resent: ClusterCounters::get(&self.counters.packets_resent),
            events_received: ClusterCounters::get(&self.counters.events_received),
            packets_received: ClusterCounters::get(&self.counters.packets_received),
            bytes_received: ClusterCounters::get(&self.counters.bytes_received),
            events_dropped: ClusterCounters::get(&self.counters.events_dropped),
            malformed_payloads: ClusterCounters::get(&self.counters.malformed_payloads),
            duplicate_packets: ClusterCounters::get(&self.counters.duplicate_packets),
            group_size: transport_status.group_size,
            outgoing_cache_size: transport_status.outgoing_cache_size,
            current_packet_id: transport_status.current_packet_id,
            min_acked_packet_id: transport_status.min_acked_packet_id,
            last_ack_digest: transport_status.ack_digest,
        }
    }

    /// The socket listener's actual address, once running. Mostly useful when configured
    /// with port 0 so peers in tests can find each other.
    pub fn socket_listen_addr(&self) -> Option<SocketAddr> {
        *self.socket_addr_slot.lock().unwrap()
    }

    /// Stop the transport, then drain registered servers. Idempotent; later calls no-op.
    pub async fn shutdown(&self) {
        {
            let mut lifecycle = self.lifecycle.lock().unwrap();
            if *lifecycle == Lifecycle::Stopped {
                return;
            }
            *lifecycle = Lifecycle::Stopped;
        }

        let transport = self.active.write().unwrap().take();
        if let Some(transport) = transport {
            transport.shutdown().await;
        }
        self.registry.clear();
        slog::info!(self.logger, "Cluster coordinator shut down");
    }

    async fn ensure_transport_started(&self) {
        {
            let mut lifecycle = self.lifecycle.lock().unwrap();
            if *lifecycle != Lifecycle::NotStarted {
                return;
            }
            *lifecycle = Lifecycle::Starting;
        }

        let options = match &self.options {
            Some(options) => options.clone(),
            None => {
                self.install(Arc::new(NullTransport)).await;
                return;
            }
        };

        let transport: Arc<dyn Transport> = match self.config.transport {
            TransportKind::Disabled => {
                slog::info!(self.logger, "Clustering disabled by configuration");
                Arc::new(NullTransport)
            }
            TransportKind::Multicast => {
                match MulticastTransport::start(
                    self.logger.clone(),
                    self.config.local_node_id.clone(),
                    &self.config.multicast,
                    &options,
                    self.processor.clone(),
                    self.registry.clone(),
                    self.counters.clone(),
                )
                .await
                {
                    Ok(transport) => Arc::new(transport),
                    Err(e) => {
                        slog::error!(
                            self.logger,
                            "CLUSTERING DISABLED: multicast transport failed to start ({}); serving without cluster coherence",
                            e
                        );
                        Arc::new(NullTransport)
                    }
                }
            }
            TransportKind::Socket => {
                match SocketTransport::start(
                    self.logger.clone(),
                    self.config.local_node_id.clone(),
                    &self.config.socket,
                    &options,
                    self.processor.clone(),
                    self.counters.clone(),
                )
                .await
                {
                    Ok(transport) => {
                        *self.socket_addr_slot.lock().unwrap() = Some(transport.local_addr());
                        Arc::new(transport)
                    }
                    Err(e) => {
                        slog::error!(
                            self.logger,
                            "CLUSTERING DISABLED: socket transport failed to start ({}); serving without cluster coherence",
                            e
                        );
                        Arc::new(NullTransport)
                    }
                }
            }
        };

        self.install(transport).await;
    }

    async fn install(&self, transport: Arc<dyn Transport>) {
        let shut_down_while_starting = {
            let mut lifecycle = self.lifecycle.lock().unwrap();
            if *lifecycle == Lifecycle::Stopped {
                true
            } else {
                *self.active.write().unwrap() = Some(transport.clone());
                *lifecycle = Lifecycle::Running;
                false
            }
        };

        if shut_down_while_starting {
            transport.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClusterOptions, MulticastConfig, SocketConfig};
    use crate::event::ChangeEventBuilder;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandle {
        calls: AtomicUsize,
    }

    impl CountingHandle {
        fn new() -> Arc<Self> {
            Arc::new(CountingHandle {
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl ServerHandle for CountingHandle {
        fn invalidate(&self, _event: &ChangeEvent) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn disabled_config() -> ClusterConfig {
        ClusterConfig {
            local_node_id: "node-a".to_string(),
            transport: TransportKind::Disabled,
            multicast: MulticastConfig::default(),
            socket: SocketConfig::default(),
            options: ClusterOptions::default(),
        }
    }

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    #[tokio::test]
    async fn disabled_clustering_still_registers_and_ignores_broadcasts() {
        let coordinator = ClusterCoordinator::new(disabled_config(), test_logger());
        coordinator.register_server("db", CountingHandle::new()).await.unwrap();

        let event = ChangeEventBuilder::new("db").table("customer", 1, 0, 0).build().unwrap();
        coordinator.broadcast(event);

        assert_eq!(coordinator.status().transport, TransportKind::Disabled);
        assert_eq!(coordinator.status().events_dropped, 0);
    }

    #[tokio::test]
    async fn duplicate_server_registration_is_rejected() {
        let coordinator = ClusterCoordinator::new(disabled_config(), test_logger());
        coordinator.register_server("db", CountingHandle::new()).await.unwrap();
        let second = coordinator.register_server("db", CountingHandle::new()).await;
        assert!(matches!(second, Err(RegisterServerError::AlreadyRegistered(_))));
    }

    #[tokio::test]
    async fn apply_routes_inbound_events_and_drops_unroutable() {
        let coordinator = ClusterCoordinator::new(disabled_config(), test_logger());
        let handle = CountingHandle::new();
        coordinator.register_server("db", handle.clone()).await.unwrap();

        let routable = ChangeEventBuilder::new("db").table("customer", 0, 1, 0).build().unwrap();
        coordinator.apply(&routable);
        assert_eq!(handle.calls.load(Ordering::SeqCst), 1);

        let unroutable = ChangeEventBuilder::new("elsewhere").table("t", 1, 0, 0).build().unwrap();
        coordinator.apply(&unroutable);
        assert_eq!(handle.calls.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.status().events_dropped, 1);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_drains_servers() {
        let coordinator = ClusterCoordinator::new(disabled_config(), test_logger());
        coordinator.register_server("db", CountingHandle::new()).await.unwrap();

        coordinator.shutdown().await;
        coordinator.shutdown().await;

        // After shutdown, inbound routing finds nothing.
        let event = ChangeEventBuilder::new("db").table("customer", 1, 0, 0).build().unwrap();
        coordinator.apply(&event);
        assert_eq!(coordinator.status().events_dropped, 1);
    }

    #[tokio::test]
    async fn invalid_options_degrade_to_disabled_instead_of_failing() {
        let mut config = disabled_config();
        config.transport = TransportKind::Multicast;
        config.options.worker_pool_size = Some(0);

        let coordinator = ClusterCoordinator::new(config, test_logger());
        coordinator.register_server("db", CountingHandle::new()).await.unwrap();
        assert_eq!(coordinator.status().transport, TransportKind::Disabled);
    }
}
