//! Pending-request correlation table
//!
//! Maps each in-flight request id to the completion handle that will
//! fulfill it. This is the only shared mutable state in the client; id
//! allocation, registration, resolution, and invalidation all serialize on
//! one lock, so a racing resolve or shutdown can never observe a
//! half-registered entry.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::oneshot;

use pod_protocol::{RequestId, Response};

use crate::error::ClientError;
use crate::lifecycle::CloseReason;

/// Outcome delivered to a waiting caller
pub(crate) type CallResult = Result<Option<Value>, ClientError>;

#[derive(Debug)]
pub(crate) struct CorrelationTable {
    inner: Mutex<TableInner>,
}

#[derive(Debug)]
struct TableInner {
    /// Next id to allocate. Strictly increasing from 1; ids are never
    /// recycled, so reuse can never collide with an outstanding request.
    next_id: u64,
    pending: HashMap<RequestId, oneshot::Sender<CallResult>>,
    /// Set on invalidation; registrations fail fast afterwards
    closed: Option<CloseReason>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TableInner {
                next_id: 1,
                pending: HashMap::new(),
                closed: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TableInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Allocate the next id and file a pending entry for it.
    ///
    /// Fails once the table has been invalidated; no request registered
    /// after connection loss could ever complete.
    pub fn register(&self) -> Result<(RequestId, oneshot::Receiver<CallResult>), ClientError> {
        let mut inner = self.lock();

        if let Some(reason) = &inner.closed {
            return Err(ClientError::Closed(reason.clone()));
        }

        let id = RequestId::new(inner.next_id);
        inner.next_id += 1;

        let (tx, rx) = oneshot::channel();
        let previous = inner.pending.insert(id, tx);
        debug_assert!(previous.is_none(), "request id {id} allocated twice");

        Ok((id, rx))
    }

    /// Complete the pending entry matching a response.
    ///
    /// An id with no pending entry is logged and dropped; it may be a
    /// benign late reply and is never escalated to a connection failure.
    pub fn resolve(&self, response: Response) {
        let entry = self.lock().pending.remove(&response.id);

        let Some(tx) = entry else {
            tracing::warn!(id = %response.id, "Dropping response with no pending request");
            return;
        };

        let err = response.remote_error().cloned();
        let result = match err {
            Some(payload) => Err(ClientError::Remote(payload)),
            None => Ok(response.body),
        };

        // The caller may have given up on the receiver; nothing to do then
        let _ = tx.send(result);
    }

    /// Remove a pending entry without completing it.
    ///
    /// Used when a request was registered but could not be handed to the
    /// writer; the caller reports its own error.
    pub fn discard(&self, id: RequestId) {
        self.lock().pending.remove(&id);
    }

    /// Fail every pending entry with a connection-closed error.
    ///
    /// No response will ever arrive for them. Idempotent; later calls with
    /// a different reason are ignored.
    pub fn invalidate_all(&self, reason: CloseReason) {
        let drained: Vec<_> = {
            let mut inner = self.lock();
            if inner.closed.is_some() {
                return;
            }
            inner.closed = Some(reason.clone());
            inner.pending.drain().collect()
        };

        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), %reason, "Failing pending requests");
        }

        for (_, tx) in drained {
            let _ = tx.send(Err(ClientError::Closed(reason.clone())));
        }
    }

    #[cfg(test)]
    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(id: u64, err: Value, body: Value) -> Response {
        serde_json::from_value(serde_json::json!({"id": id, "err": err, "body": body})).unwrap()
    }

    #[test]
    fn test_ids_strictly_increasing() {
        let table = CorrelationTable::new();

        let (a, _rx_a) = table.register().unwrap();
        let (b, _rx_b) = table.register().unwrap();
        let (c, _rx_c) = table.register().unwrap();

        assert_eq!(a, RequestId::new(1));
        assert_eq!(b, RequestId::new(2));
        assert_eq!(c, RequestId::new(3));
        assert_eq!(table.pending_len(), 3);
    }

    #[tokio::test]
    async fn test_resolve_success_and_failure() {
        let table = CorrelationTable::new();

        let (ok_id, ok_rx) = table.register().unwrap();
        let (err_id, err_rx) = table.register().unwrap();

        table.resolve(response(ok_id.as_u64(), Value::from(""), serde_json::json!({"podId": "p1"})));
        table.resolve(response(
            err_id.as_u64(),
            serde_json::json!({"message": "not found"}),
            Value::Null,
        ));

        let body = ok_rx.await.unwrap().unwrap().unwrap();
        assert_eq!(body["podId"], "p1");

        let err = err_rx.await.unwrap().unwrap_err();
        assert!(matches!(err, ClientError::Remote(ref p) if p["message"] == "not found"));

        assert_eq!(table.pending_len(), 0);
    }

    #[test]
    fn test_unmatched_response_dropped() {
        let table = CorrelationTable::new();
        let (_id, _rx) = table.register().unwrap();

        table.resolve(response(7, Value::from(""), Value::Null));

        // The unrelated pending entry is untouched
        assert_eq!(table.pending_len(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_fails_pending_and_future_registers() {
        let table = CorrelationTable::new();
        let (_id, rx) = table.register().unwrap();

        table.invalidate_all(CloseReason::Remote);

        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, ClientError::Closed(CloseReason::Remote)));

        let err = table.register().unwrap_err();
        assert!(matches!(err, ClientError::Closed(CloseReason::Remote)));
    }

    #[tokio::test]
    async fn test_invalidate_is_idempotent() {
        let table = CorrelationTable::new();
        let (_id, rx) = table.register().unwrap();

        table.invalidate_all(CloseReason::Remote);
        table.invalidate_all(CloseReason::Local);

        // First reason wins
        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, ClientError::Closed(CloseReason::Remote)));
    }
}
