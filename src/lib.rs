mod config;
mod coordinator;
mod event;
mod processor;
mod sequencer;
mod transport;
mod wire;

pub use config::ClusterConfig;
pub use config::ClusterOptions;
pub use config::MulticastConfig;
pub use config::SocketConfig;
pub use config::TransportKind;
pub use coordinator::ClusterCoordinator;
pub use coordinator::ClusterStatus;
pub use coordinator::RegisterServerError;
pub use coordinator::ServerHandle;
pub use event::BeanDelta;
pub use event::ChangeEvent;
pub use event::ChangeEventBuilder;
pub use event::ChangeKind;
pub use event::EmptyChangeEvent;
pub use event::TableMod;

// Root mod only re-exports. All `mod` statements stay private; everything public is exported
// via individual `use` statements so the internal layout can change freely.
