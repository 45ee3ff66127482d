//! Fire-and-forget vote events for downstream live-count consumers.
//!
//! A broadcast channel replaces the usual pattern of holding open
//! connection handles in a process-wide list: consumers register by
//! subscribing and unregister by dropping their receiver, and a commit
//! never depends on delivery succeeding.

use rocket::tokio::sync::broadcast;
use serde::Serialize;

use crate::model::{
    election::{CandidateId, PositionId},
    mongodb::Id,
};

/// Emitted after every successful ballot commit.
#[derive(Debug, Clone, Serialize)]
pub struct VoteCommitted {
    pub election_id: Id,
    pub position_id: PositionId,
    pub candidate_id: CandidateId,
    /// The candidate's tally after this commit.
    pub tally: u64,
}

/// Buffered events per subscriber; slow consumers lag and skip, they do
/// not block commits.
const CHANNEL_CAPACITY: usize = 128;

/// The publish side of the vote event stream. Managed state.
pub struct VoteNotifier {
    sender: broadcast::Sender<VoteCommitted>,
}

impl VoteNotifier {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Publish an event. Fire-and-forget: an error just means nobody is
    /// currently listening.
    pub fn publish(&self, event: VoteCommitted) {
        trace!("Publishing {event:?}");
        let _ = self.sender.send(event);
    }

    /// Register a new consumer.
    pub fn subscribe(&self) -> broadcast::Receiver<VoteCommitted> {
        self.sender.subscribe()
    }
}

impl Default for VoteNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[rocket::async_test]
    async fn subscribers_receive_published_events() {
        let notifier = VoteNotifier::new();
        let mut receiver = notifier.subscribe();

        let event = VoteCommitted {
            election_id: Id::new(),
            position_id: 1,
            candidate_id: "Alice".to_string(),
            tally: 4,
        };
        notifier.publish(event.clone());

        let received = receiver.recv().await.unwrap();
        assert_eq!(received.election_id, event.election_id);
        assert_eq!(received.tally, 4);
    }

    #[test]
    fn publishing_without_subscribers_is_fine() {
        let notifier = VoteNotifier::new();
        notifier.publish(VoteCommitted {
            election_id: Id::new(),
            position_id: 1,
            candidate_id: "Alice".to_string(),
            tally: 1,
        });
    }
}
