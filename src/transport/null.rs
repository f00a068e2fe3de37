use crate::config::TransportKind;
use crate::event::ChangeEvent;
use crate::transport::{OfferError, Transport, TransportStatus};

/// Substituted when clustering is disabled, or when a real transport failed to start and
/// the node degraded rather than refusing to serve. Broadcasts become no-ops.
pub(crate) struct NullTransport;

#[async_trait::async_trait]
impl Transport for NullTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Disabled
    }

    fn offer(&self, _event: ChangeEvent) -> Result<(), OfferError> {
        Ok(())
    }

    fn status(&self) -> TransportStatus {
        TransportStatus::default()
    }

    async fn shutdown(&self) {}
}
