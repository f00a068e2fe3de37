mod coordinator;
mod registry;
mod status;

pub use coordinator::ClusterCoordinator;
pub use registry::RegisterServerError;
pub use registry::ServerHandle;
pub use status::ClusterStatus;

pub(crate) use registry::ServerRegistry;
pub(crate) use status::ClusterCounters;
