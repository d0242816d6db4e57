//! Outstanding set/get request correlation.
//!
//! The wire protocol has no sequence numbers: a configuration response is
//! matched to its request purely by the requested field name appearing in
//! the response body, relying on the device answering in send order. Two
//! concurrent requests for the same key therefore race; the earliest
//! still-pending one wins. That limitation is inherited from the protocol
//! and deliberately left visible.

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::trace;

use crate::error::{Result, TinygError};

#[derive(Debug)]
struct PendingRequest {
    key: String,
    tx: oneshot::Sender<Result<Value>>,
}

/// Registry of outstanding configuration requests, in send order.
#[derive(Debug, Default)]
pub struct RequestTracker {
    pending: Vec<PendingRequest>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request for `key`; the receiver resolves when a response
    /// carrying that field arrives, or rejects on a protocol error.
    pub fn register(&mut self, key: &str) -> oneshot::Receiver<Result<Value>> {
        let (tx, rx) = oneshot::channel();
        self.pending.push(PendingRequest {
            key: key.to_string(),
            tx,
        });
        rx
    }

    /// Resolve pending requests whose key appears in the response body.
    ///
    /// At most one request per key resolves per response; later duplicates
    /// stay pending for the next response.
    pub fn resolve(&mut self, body: &Value) {
        let mut resolved_keys: Vec<String> = Vec::new();
        let mut index = 0;
        while index < self.pending.len() {
            let key = self.pending[index].key.clone();
            let matched = body.get(&key).is_some() && !resolved_keys.contains(&key);
            if matched {
                let request = self.pending.remove(index);
                trace!(key = %key, "resolving pending request");
                let _ = request.tx.send(Ok(body[&key].clone()));
                resolved_keys.push(key);
            } else {
                index += 1;
            }
        }
    }

    /// Reject every outstanding request with the given error.
    pub fn fail_all(&mut self, error: &TinygError) {
        for request in self.pending.drain(..) {
            let _ = request.tx.send(Err(error.clone()));
        }
    }

    /// Drop entries whose caller has already gone away.
    ///
    /// An abandoned entry would otherwise consume the next response
    /// carrying its key and starve a later live request for the same key.
    pub fn prune_dead(&mut self) {
        self.pending.retain(|request| !request.tx.is_closed());
    }

    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use serde_json::json;

    #[test]
    fn response_with_key_resolves_the_request() {
        let mut tracker = RequestTracker::new();
        let mut rx = tracker.register("jv");
        tracker.resolve(&json!({"jv": 4}));
        assert_eq!(rx.try_recv().unwrap().unwrap(), json!(4));
        assert_eq!(tracker.outstanding(), 0);
    }

    #[test]
    fn response_without_key_leaves_request_pending() {
        let mut tracker = RequestTracker::new();
        let mut rx = tracker.register("jv");
        tracker.resolve(&json!({"qv": 2}));
        assert!(rx.try_recv().is_err());
        assert_eq!(tracker.outstanding(), 1);
    }

    #[test]
    fn concurrent_distinct_keys_resolve_independently() {
        let mut tracker = RequestTracker::new();
        let mut jv = tracker.register("jv");
        let mut qv = tracker.register("qv");

        tracker.resolve(&json!({"qv": 2}));
        assert!(jv.try_recv().is_err());
        assert_eq!(qv.try_recv().unwrap().unwrap(), json!(2));

        tracker.resolve(&json!({"jv": 4}));
        assert_eq!(jv.try_recv().unwrap().unwrap(), json!(4));
    }

    #[test]
    fn same_key_requests_resolve_in_order() {
        // The documented race: whichever response carries the key first
        // resolves the earliest still-pending request for it.
        let mut tracker = RequestTracker::new();
        let mut first = tracker.register("jv");
        let mut second = tracker.register("jv");

        tracker.resolve(&json!({"jv": 1}));
        assert_eq!(first.try_recv().unwrap().unwrap(), json!(1));
        assert!(second.try_recv().is_err());

        tracker.resolve(&json!({"jv": 2}));
        assert_eq!(second.try_recv().unwrap().unwrap(), json!(2));
    }

    #[test]
    fn errors_reject_all_outstanding_requests() {
        let mut tracker = RequestTracker::new();
        let mut jv = tracker.register("jv");
        let mut qv = tracker.register("qv");

        tracker.fail_all(&TinygError::Alarm);
        assert_eq!(jv.try_recv().unwrap().unwrap_err(), TinygError::Alarm);
        assert_eq!(qv.try_recv().unwrap().unwrap_err(), TinygError::Alarm);
        assert_eq!(tracker.outstanding(), 0);
    }

    #[test]
    fn pruned_abandoned_entry_cannot_starve_a_later_request() {
        let mut tracker = RequestTracker::new();
        // A request whose send failed: the caller dropped the receiver.
        let rx = tracker.register("jv");
        drop(rx);
        tracker.prune_dead();
        assert_eq!(tracker.outstanding(), 0);

        // A fresh request for the same key gets the next response instead
        // of losing it to the dead entry.
        let mut live = tracker.register("jv");
        tracker.resolve(&json!({"jv": 4}));
        assert_eq!(live.try_recv().unwrap().unwrap(), json!(4));
    }

    #[test]
    fn dropped_receiver_does_not_disturb_the_rest() {
        let mut tracker = RequestTracker::new();
        let rx = tracker.register("jv");
        drop(rx);
        let mut qv = tracker.register("qv");
        tracker.resolve(&json!({"jv": 1, "qv": 2}));
        assert_eq!(qv.try_recv().unwrap().unwrap(), json!(2));
    }
}
