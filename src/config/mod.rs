mod options;

pub use options::ClusterConfig;
pub use options::ClusterOptions;
pub use options::MulticastConfig;
pub use options::SocketConfig;
pub use options::TransportKind;

pub(crate) use options::ClusterOptionsValidated;
