//! Two-node cluster on one machine over the socket transport. Node A commits a change,
//! node B's invalidation hook fires, and both print their status snapshots.
//!
//! Run with: cargo run --example two_node

use clustercast::{
    ChangeEvent, ChangeEventBuilder, ClusterConfig, ClusterCoordinator, ClusterOptions, MulticastConfig, ServerHandle,
    SocketConfig, TransportKind,
};
use slog::Drain;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::Duration;

struct PrintingCache {
    node: &'static str,
}

impl ServerHandle for PrintingCache {
    fn invalidate(&self, event: &ChangeEvent) {
        if event.is_full_invalidate() {
            println!("[{}] full invalidate for server '{}'", self.node, event.server_name());
            return;
        }
        for (table, mods) in event.table_mods() {
            println!(
                "[{}] invalidate table '{}' (+{} ~{} -{})",
                self.node, table, mods.inserted, mods.updated, mods.deleted
            );
        }
    }
}

fn config(node_id: &str, peers: Vec<SocketAddr>) -> ClusterConfig {
    ClusterConfig {
        local_node_id: node_id.to_string(),
        transport: TransportKind::Socket,
        multicast: MulticastConfig::default(),
        socket: SocketConfig { listen_port: 0, peers },
        options: ClusterOptions::default(),
    }
}

fn logger(node_id: &str) -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    slog::Logger::root(drain, slog::o!("NodeId" => node_id.to_string()))
}

#[tokio::main]
async fn main() {
    let node_b = ClusterCoordinator::new(config("node-b", vec![]), logger("node-b"));
    node_b
        .register_server("db", Arc::new(PrintingCache { node: "node-b" }))
        .await
        .unwrap();
    let b_addr = node_b.socket_listen_addr().unwrap();

    let node_a = ClusterCoordinator::new(config("node-a", vec![b_addr]), logger("node-a"));
    node_a
        .register_server("db", Arc::new(PrintingCache { node: "node-a" }))
        .await
        .unwrap();

    // A local transaction committed: one customer row updated, one order inserted.
    let event = ChangeEventBuilder::new("db")
        .table("customer", 0, 1, 0)
        .table("orders", 1, 0, 0)
        .build()
        .unwrap();
    node_a.notify_commit(event);

    tokio::time::sleep(Duration::from_millis(500)).await;

    let status = node_a.status();
    println!(
        "[node-a] sent {} events / {} packets / {} bytes",
        status.events_sent, status.packets_sent, status.bytes_sent
    );
    let status = node_b.status();
    println!(
        "[node-b] received {} events / {} packets / {} bytes",
        status.events_received, status.packets_received, status.bytes_received
    );

    node_a.shutdown().await;
    node_b.shutdown().await;
}
