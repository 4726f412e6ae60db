//! Point-to-point transport
//!
//! Nodes exchange JSON-framed [`Envelope`]s addressed by party. Links are
//! FIFO; a message to an offline party is lost, which the protocols tolerate
//! through their timeouts.

use crate::models::PartyId;
use crate::protocol::{CodecError, Envelope};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// Errors raised while moving frames between nodes
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("No route to party {0}")]
    UnknownParty(String),

    #[error("Inbox of party {0} is closed")]
    Closed(String),

    #[error("Transport unavailable: {0}")]
    Unavailable(String),
}

/// Outbound side of a node's links
pub trait Transport: Send + Sync {
    fn send(&self, envelope: &Envelope) -> Result<(), TransportError>;
}

#[derive(Debug, Default)]
struct Routes {
    inboxes: BTreeMap<PartyId, mpsc::UnboundedSender<Vec<u8>>>,
    offline: BTreeSet<PartyId>,
}

/// In-process network of unbounded channels, one inbox per party
#[derive(Debug, Clone, Default)]
pub struct InMemoryNetwork {
    routes: Arc<Mutex<Routes>>,
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Routes>, TransportError> {
        self.routes
            .lock()
            .map_err(|_| TransportError::Unavailable("route table lock poisoned".to_string()))
    }

    /// Open an inbox for `party`, replacing any previous one
    pub fn register(&self, party: &PartyId) -> Result<mpsc::UnboundedReceiver<Vec<u8>>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock()?.inboxes.insert(party.clone(), tx);
        Ok(rx)
    }

    /// Take a party off the network (or bring it back)
    pub fn set_offline(&self, party: &PartyId, offline: bool) -> Result<(), TransportError> {
        let mut routes = self.lock()?;
        if offline {
            routes.offline.insert(party.clone());
        } else {
            routes.offline.remove(party);
        }
        Ok(())
    }

    pub fn parties(&self) -> Vec<PartyId> {
        self.lock()
            .map(|routes| routes.inboxes.keys().cloned().collect())
            .unwrap_or_default()
    }
}

impl Transport for InMemoryNetwork {
    fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let frame = envelope.encode()?;
        let routes = self.lock()?;
        if routes.offline.contains(&envelope.to) {
            debug!(to = %envelope.to, kind = envelope.message.kind(), "dropping message to offline party");
            return Ok(());
        }
        let inbox = routes
            .inboxes
            .get(&envelope.to)
            .ok_or_else(|| TransportError::UnknownParty(envelope.to.to_string()))?;
        inbox
            .send(frame)
            .map_err(|_| TransportError::Closed(envelope.to.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Message, ScanAcknowledgement, ScanId};

    fn ack(to: &str) -> Envelope {
        Envelope::new(
            "A".into(),
            to.into(),
            Message::ScanAcknowledgement(ScanAcknowledgement {
                id: ScanId::compute(0, &"A".into()),
            }),
        )
    }

    #[test]
    fn test_frames_reach_the_addressed_inbox() {
        let network = InMemoryNetwork::new();
        let mut inbox = network.register(&"B".into()).unwrap();

        network.send(&ack("B")).unwrap();
        let frame = inbox.try_recv().unwrap();
        assert_eq!(Envelope::decode(&frame).unwrap(), ack("B"));
    }

    #[test]
    fn test_offline_party_loses_messages() {
        let network = InMemoryNetwork::new();
        let mut inbox = network.register(&"B".into()).unwrap();
        network.set_offline(&"B".into(), true).unwrap();

        network.send(&ack("B")).unwrap();
        assert!(inbox.try_recv().is_err());
    }

    #[test]
    fn test_unknown_party_is_an_error() {
        let network = InMemoryNetwork::new();
        assert_eq!(
            network.send(&ack("Z")),
            Err(TransportError::UnknownParty("Z".to_string()))
        );
    }
}
