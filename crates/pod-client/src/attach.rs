//! Attach session
//!
//! Consumes the event stream and reassembles `podOut` chunks into a
//! continuously growing transcript for one attached pod. Chunks append in
//! strict arrival order; nothing is reordered, coalesced, or rewritten.

use std::borrow::Cow;

use bytes::Bytes;
use tokio::sync::{broadcast, watch};

use pod_protocol::event::POD_OUT;
use pod_protocol::{Event, PodOutput};

use crate::lifecycle::ConnState;

/// Reassembles the output stream of one attached pod
///
/// Returned by [`PodClient::attach`](crate::PodClient::attach). The session
/// owns its event subscription; a later attach creates a new session and
/// this one simply stops receiving matching output.
pub struct AttachSession {
    pod_id: String,
    events: broadcast::Receiver<Event>,
    state: watch::Receiver<ConnState>,
    transcript: Vec<u8>,
}

impl AttachSession {
    pub(crate) fn new(
        pod_id: String,
        events: broadcast::Receiver<Event>,
        state: watch::Receiver<ConnState>,
    ) -> Self {
        Self {
            pod_id,
            events,
            state,
            transcript: Vec::new(),
        }
    }

    /// The attached pod's id
    pub fn pod_id(&self) -> &str {
        &self.pod_id
    }

    /// Apply one event to this session.
    ///
    /// Returns the decoded chunk if the event was pod output belonging to
    /// this session; everything else is ignored here. A chunk scoped to a
    /// different pod is skipped; an unscoped chunk (older servers omit the
    /// pod id) is attributed to this session, since the server only streams
    /// output for the active attachment.
    pub fn apply(&mut self, event: &Event) -> Option<Bytes> {
        if event.name != POD_OUT {
            return None;
        }

        let output: PodOutput = match serde_json::from_value(event.body.clone()) {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping podOut event with malformed body");
                return None;
            }
        };

        if let Some(id) = &output.id {
            if *id != self.pod_id {
                return None;
            }
        }

        let chunk = match output.decode_data() {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping podOut chunk that is not valid base64");
                return None;
            }
        };

        self.transcript.extend_from_slice(&chunk);
        Some(Bytes::from(chunk))
    }

    /// Wait for the next output chunk belonging to this session.
    ///
    /// Returns `None` once the connection has closed and no further chunks
    /// are buffered. A subscriber that falls behind the event channel loses
    /// the oldest chunks (logged with the missed count); order of what
    /// remains is preserved.
    pub async fn next_chunk(&mut self) -> Option<Bytes> {
        loop {
            tokio::select! {
                result = self.events.recv() => match result {
                    Ok(event) => {
                        if let Some(chunk) = self.apply(&event) {
                            return Some(chunk);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Attach session lagged; output chunks dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                },
                _ = async {
                    let _ = self.state.wait_for(|s| matches!(s, ConnState::Closed(_))).await;
                } => {
                    // Drain whatever was delivered before the close
                    loop {
                        match self.events.try_recv() {
                            Ok(event) => {
                                if let Some(chunk) = self.apply(&event) {
                                    return Some(chunk);
                                }
                            }
                            Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                                tracing::warn!(missed, "Attach session lagged; output chunks dropped");
                            }
                            Err(_) => return None,
                        }
                    }
                }
            }
        }
    }

    /// The accumulated output, in arrival order
    pub fn transcript(&self) -> &[u8] {
        &self.transcript
    }

    /// The accumulated output as text, with invalid UTF-8 replaced
    pub fn transcript_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.transcript)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::CloseReason;
    use serde_json::json;

    fn session(
        pod_id: &str,
    ) -> (
        AttachSession,
        broadcast::Sender<Event>,
        watch::Sender<ConnState>,
    ) {
        let (event_tx, events) = broadcast::channel(16);
        let (state_tx, state) = watch::channel(ConnState::Open);
        (
            AttachSession::new(pod_id.to_string(), events, state),
            event_tx,
            state_tx,
        )
    }

    fn pod_out(body: serde_json::Value) -> Event {
        Event {
            name: POD_OUT.to_string(),
            body,
        }
    }

    #[test]
    fn test_transcript_appends_in_arrival_order() {
        let (mut session, _tx, _state) = session("bob");

        let first = session.apply(&pod_out(json!({"data": "aGk="}))).unwrap();
        assert_eq!(&first[..], b"hi");

        session.apply(&pod_out(json!({"data": "dGhlcmU="}))).unwrap();

        assert_eq!(session.transcript(), b"hithere");
        assert_eq!(session.transcript_lossy(), "hithere");
    }

    #[test]
    fn test_other_events_ignored() {
        let (mut session, _tx, _state) = session("bob");

        let event = Event {
            name: "podGone".to_string(),
            body: json!({"data": "aGk="}),
        };
        assert!(session.apply(&event).is_none());
        assert!(session.transcript().is_empty());
    }

    #[test]
    fn test_chunk_scoped_to_other_pod_ignored() {
        let (mut session, _tx, _state) = session("bob");

        assert!(session
            .apply(&pod_out(json!({"id": "alice", "data": "aGk="})))
            .is_none());
        assert!(session.transcript().is_empty());

        // Matching scope and legacy unscoped chunks both land
        session
            .apply(&pod_out(json!({"id": "bob", "data": "aGk="})))
            .unwrap();
        session.apply(&pod_out(json!({"data": "dGhlcmU="}))).unwrap();
        assert_eq!(session.transcript(), b"hithere");
    }

    #[test]
    fn test_malformed_chunk_skipped() {
        let (mut session, _tx, _state) = session("bob");

        assert!(session.apply(&pod_out(json!({"data": "!!!"}))).is_none());
        assert!(session.apply(&pod_out(json!({"nodata": true}))).is_none());
        assert!(session.transcript().is_empty());
    }

    #[tokio::test]
    async fn test_next_chunk_pumps_subscription() {
        let (event_tx, events) = broadcast::channel(16);
        let (state_tx, state) = watch::channel(ConnState::Open);
        let mut session = AttachSession::new("bob".to_string(), events, state);

        event_tx.send(pod_out(json!({"data": "aGk="}))).unwrap();
        let chunk = session.next_chunk().await.unwrap();
        assert_eq!(&chunk[..], b"hi");

        // Closing the connection ends the stream after draining
        event_tx.send(pod_out(json!({"data": "dGhlcmU="}))).unwrap();
        state_tx
            .send(ConnState::Closed(CloseReason::Remote))
            .unwrap();

        assert_eq!(&session.next_chunk().await.unwrap()[..], b"there");
        assert!(session.next_chunk().await.is_none());
        assert_eq!(session.transcript(), b"hithere");
    }
}
