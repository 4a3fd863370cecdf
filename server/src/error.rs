use dbss_shared::{Datagram, DatagramError};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("datagram error: {0}")]
    Datagram(#[from] DatagramError),

    #[error("outbound queue closed")]
    OutboundClosed,
}

/// Queues a datagram for the network sender task.
pub(crate) fn queue(
    outbound: &mpsc::UnboundedSender<Datagram>,
    dg: Datagram,
) -> Result<(), DispatchError> {
    outbound.send(dg).map_err(|_| DispatchError::OutboundClosed)
}
