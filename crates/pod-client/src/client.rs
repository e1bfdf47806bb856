//! Pod control client
//!
//! A [`PodClient`] multiplexes arbitrarily many concurrent method calls and
//! one unbounded event stream over a single injected duplex transport. Two
//! background tasks own the I/O halves: the writer drains an outbound
//! queue, the reader routes each inbound record either to the correlation
//! table (identified response) or to the event broadcast (unsolicited
//! notification). Callers suspend only on their own completion handle, so
//! a slow consumer of one result never delays resolution of another.

use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use pod_protocol::{
    method, Event, Inbound, Pod, PodIdBody, PodListBody, RecordCodec, Request,
};

use crate::attach::AttachSession;
use crate::correlation::CorrelationTable;
use crate::error::ClientError;
use crate::lifecycle::{CloseReason, ConnState, Lifecycle};

/// Client configuration.
///
/// Plain data so an embedding application can carry it in its own config
/// file; there is no file format or CLI surface at this layer.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Outbound write queue capacity. Callers past this many queued
    /// requests wait rather than buffering without bound.
    pub outbound_capacity: usize,
    /// Event broadcast capacity. A subscriber that falls further behind
    /// than this loses the oldest events and is told how many it missed.
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 64,
            event_capacity: 256,
        }
    }
}

/// State shared between client handles and the I/O tasks
struct Shared {
    table: CorrelationTable,
    lifecycle: Lifecycle,
    /// Last server-reported pod snapshot; never a source of truth
    pods: Mutex<Vec<Pod>>,
    event_tx: broadcast::Sender<Event>,
    outbound_tx: mpsc::Sender<Request>,
    shutdown: CancellationToken,
}

/// Client for the pod control protocol
///
/// Cheap to clone; all clones issue calls over the same connection.
#[derive(Clone)]
pub struct PodClient {
    shared: Arc<Shared>,
}

impl PodClient {
    /// Connect over an established transport with default configuration.
    ///
    /// Performs the fire-and-forget `open` handshake and triggers the
    /// initial pod list refresh (a refresh failure is logged, not fatal).
    pub async fn connect<T>(transport: T) -> Result<Self, ClientError>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::connect_with_config(transport, ClientConfig::default()).await
    }

    /// Connect over an established transport
    pub async fn connect_with_config<T>(
        transport: T,
        config: ClientConfig,
    ) -> Result<Self, ClientError>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(transport);
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity);
        let (event_tx, _) = broadcast::channel(config.event_capacity);

        let shared = Arc::new(Shared {
            table: CorrelationTable::new(),
            lifecycle: Lifecycle::new(),
            pods: Mutex::new(Vec::new()),
            event_tx,
            outbound_tx,
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(write_loop(
            FramedWrite::new(write_half, RecordCodec::new()),
            outbound_rx,
            Arc::clone(&shared),
        ));
        tokio::spawn(read_loop(
            FramedRead::new(read_half, RecordCodec::new()),
            Arc::clone(&shared),
        ));

        shared.lifecycle.set_open();
        tracing::debug!("Connection open");

        let client = Self { shared };

        client.send_no_reply(method::OPEN, vec![]).await?;
        if let Err(e) = client.list_pods().await {
            tracing::warn!(error = %e, "Initial pod list refresh failed");
        }

        Ok(client)
    }

    /// Issue a method call and await its matched response.
    ///
    /// Any number of calls may be outstanding at once; responses resolve
    /// out of send order. Fails synchronously when the connection is not
    /// open, and with [`ClientError::Closed`] if it drops while the call
    /// is in flight.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Option<Value>, ClientError> {
        if !self.shared.lifecycle.is_open() {
            return Err(self.not_open_error());
        }

        let (id, completion) = self.shared.table.register()?;
        let request = Request::new(method, args, id);

        if self.shared.outbound_tx.send(request).await.is_err() {
            // Writer already gone; the shutdown path owns the close reason
            self.shared.table.discard(id);
            return Err(self.not_open_error());
        }

        match completion.await {
            Ok(result) => result,
            Err(_) => Err(self.not_open_error()),
        }
    }

    /// Send a fire-and-forget request: no id, no pending entry, and no
    /// response will ever arrive for it
    pub async fn send_no_reply(&self, method: &str, args: Vec<Value>) -> Result<(), ClientError> {
        if !self.shared.lifecycle.is_open() {
            return Err(self.not_open_error());
        }

        let request = Request::fire_and_forget(method, args);
        self.shared
            .outbound_tx
            .send(request)
            .await
            .map_err(|_| self.not_open_error())
    }

    /// Fetch the current pod list and refresh the local snapshot
    pub async fn list_pods(&self) -> Result<Vec<Pod>, ClientError> {
        let body = self.call(method::LIST_PODS, vec![]).await?;
        let list: PodListBody = parse_body(body)?;

        let mut pods = self.pods_lock();
        pods.clone_from(&list.pods);

        Ok(list.pods)
    }

    /// Create a pod, returning its server-assigned id
    pub async fn create_pod(&self, name: &str) -> Result<String, ClientError> {
        let body = self.call(method::CREATE_POD, vec![name.into()]).await?;
        let body: PodIdBody = parse_body(body)?;
        Ok(body.pod_id)
    }

    /// Stop a running pod
    pub async fn stop_pod(&self, name: &str) -> Result<(), ClientError> {
        self.call(method::STOP_POD, vec![name.into()]).await?;
        Ok(())
    }

    /// Remove a pod
    pub async fn remove_pod(&self, name: &str) -> Result<(), ClientError> {
        self.call(method::REMOVE_POD, vec![name.into()]).await?;
        Ok(())
    }

    /// Restart a pod
    pub async fn restart_pod(&self, name: &str) -> Result<(), ClientError> {
        self.call(method::RESTART_POD, vec![name.into()]).await?;
        Ok(())
    }

    /// Forward input bytes to the currently attached pod
    pub async fn send_to_pod(&self, data: &[u8]) -> Result<(), ClientError> {
        let encoded = BASE64.encode(data);
        self.call(method::SEND_TO_POD, vec![encoded.into()]).await?;
        Ok(())
    }

    /// Upload a file into a pod at the given destination path
    pub async fn upload_to_pod(
        &self,
        pod_id: &str,
        dst_path: &str,
        data: &[u8],
    ) -> Result<(), ClientError> {
        let encoded = BASE64.encode(data);
        self.call(
            method::UPLOAD_TO_POD,
            vec![pod_id.into(), dst_path.into(), encoded.into()],
        )
        .await?;
        Ok(())
    }

    /// Attach to a pod and return the session that will reassemble its
    /// output stream.
    ///
    /// The event subscription is taken before the call is sent, so output
    /// racing the attach reply is not lost. A later attach supersedes this
    /// session: the server re-targets its output events and old sessions
    /// simply stop matching.
    pub async fn attach(&self, name: &str) -> Result<AttachSession, ClientError> {
        let events = self.shared.event_tx.subscribe();
        let state = self.shared.lifecycle.subscribe();

        let body = self.call(method::ATTACH_TO_POD, vec![name.into()]).await?;
        let body: PodIdBody = parse_body(body)?;

        tracing::debug!(pod_id = %body.pod_id, "Attached to pod");
        Ok(AttachSession::new(body.pod_id, events, state))
    }

    /// Subscribe to all unsolicited events from the server
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.shared.event_tx.subscribe()
    }

    /// Last pod snapshot reported by the server
    pub fn pods(&self) -> Vec<Pod> {
        self.pods_lock().clone()
    }

    /// Current connection state
    pub fn state(&self) -> ConnState {
        self.shared.lifecycle.state()
    }

    /// Watch connection state transitions
    pub fn state_changes(&self) -> watch::Receiver<ConnState> {
        self.shared.lifecycle.subscribe()
    }

    /// Wait until the connection has closed and return the reason
    pub async fn closed(&self) -> CloseReason {
        self.shared.lifecycle.closed().await
    }

    /// Close the connection.
    ///
    /// Every pending call fails with a connection-closed error and further
    /// calls are rejected.
    pub fn close(&self) {
        shutdown(&self.shared, CloseReason::Local);
    }

    fn not_open_error(&self) -> ClientError {
        match self.shared.lifecycle.state() {
            ConnState::Closed(reason) => ClientError::Closed(reason),
            _ => ClientError::NotConnected,
        }
    }

    fn pods_lock(&self) -> std::sync::MutexGuard<'_, Vec<Pod>> {
        self.shared.pods.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn parse_body<T: DeserializeOwned>(body: Option<Value>) -> Result<T, ClientError> {
    serde_json::from_value(body.unwrap_or(Value::Null))
        .map_err(|e| ClientError::UnexpectedBody(e.to_string()))
}

/// Close the connection once; whichever path gets here first owns cleanup
fn shutdown(shared: &Shared, reason: CloseReason) {
    if shared.lifecycle.set_closed(reason.clone()) {
        shared.table.invalidate_all(reason);
        shared.shutdown.cancel();
    }
}

async fn read_loop<T>(mut records: FramedRead<ReadHalf<T>, RecordCodec>, shared: Arc<Shared>)
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let reason = loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break CloseReason::Local,
            record = records.next() => match record {
                Some(Ok(Inbound::Response(response))) => shared.table.resolve(response),
                Some(Ok(Inbound::Event(event))) => {
                    // No subscribers yet is fine; events before the first
                    // attach have no consumer
                    let _ = shared.event_tx.send(event);
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "Read failed");
                    break CloseReason::Transport(e.to_string());
                }
                None => break CloseReason::Remote,
            },
        }
    };

    shutdown(&shared, reason);
}

async fn write_loop<T>(
    mut sink: FramedWrite<WriteHalf<T>, RecordCodec>,
    mut outbound: mpsc::Receiver<Request>,
    shared: Arc<Shared>,
) where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            request = outbound.recv() => {
                let Some(request) = request else { break };
                if let Err(e) = sink.send(request).await {
                    tracing::warn!(error = %e, "Write failed");
                    shutdown(&shared, CloseReason::Transport(e.to_string()));
                    break;
                }
            }
        }
    }

    let _ = sink.close().await;
}
