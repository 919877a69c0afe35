// src/core/executor/backend.rs

//! The seam to the local executor daemon: the request/event vocabulary, the
//! length-prefixed wire codec, and an in-process scripted backend used for
//! tests and for driving remote-node state without a daemon.

use crate::core::HelmsmanError;
use crate::core::executor::ops::{CallIdAllocator, OpEvent};
use crate::core::types::{OpStatus, ResourceSpec};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};
use tracing::{debug, trace};

/// A request for the executor to run one operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct ExecRequest {
    pub rsc_id: String,
    pub action: String,
    pub user_data: Option<String>,
    pub interval_ms: u32,
    pub timeout_ms: u64,
    pub start_delay_ms: u64,
    pub params: BTreeMap<String, String>,
}

/// Commands sent over the executor IPC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub enum ExecutorRequest {
    Register { rsc: ResourceSpec },
    Unregister { rsc_id: String },
    Exec(ExecRequest),
    Cancel {
        rsc_id: String,
        action: String,
        interval_ms: u32,
    },
    Poke,
    GetRecurring { rsc_id: String },
    GetMetadata { rsc: ResourceSpec },
}

/// Asynchronous events the executor pushes back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub enum ExecutorEvent {
    ExecComplete(OpEvent),
    Disconnect,
    NewClient,
    Poke,
}

/// Whether a cancellation actually reached a running operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The executor will deliver a cancelled result for the op.
    Cancelled,
    /// The op was not active; the caller owns the cleanup.
    NothingToCancel,
}

// --- Wire codec ------------------------------------------------------------

/// Frames `ExecutorRequest`/`ExecutorEvent` values with a length prefix for
/// stream transports. Both sides of the IPC use the same framing.
pub fn encode_request(request: &ExecutorRequest) -> Result<Bytes, HelmsmanError> {
    let body = bincode::encode_to_vec(request, bincode::config::standard())?;
    let mut codec = LengthDelimitedCodec::new();
    let mut framed = BytesMut::new();
    codec
        .encode(Bytes::from(body), &mut framed)
        .map_err(HelmsmanError::from)?;
    Ok(framed.freeze())
}

pub fn encode_event(event: &ExecutorEvent) -> Result<Bytes, HelmsmanError> {
    let body = bincode::encode_to_vec(event, bincode::config::standard())?;
    let mut codec = LengthDelimitedCodec::new();
    let mut framed = BytesMut::new();
    codec
        .encode(Bytes::from(body), &mut framed)
        .map_err(HelmsmanError::from)?;
    Ok(framed.freeze())
}

/// Pulls the next complete event frame out of a receive buffer, if one is
/// fully buffered.
pub fn decode_event(buffer: &mut BytesMut) -> Result<Option<ExecutorEvent>, HelmsmanError> {
    let mut codec = LengthDelimitedCodec::new();
    match codec.decode(buffer).map_err(HelmsmanError::from)? {
        Some(frame) => {
            let (event, _): (ExecutorEvent, usize) =
                bincode::decode_from_slice(&frame, bincode::config::standard())?;
            Ok(Some(event))
        }
        None => Ok(None),
    }
}

pub fn decode_request(buffer: &mut BytesMut) -> Result<Option<ExecutorRequest>, HelmsmanError> {
    let mut codec = LengthDelimitedCodec::new();
    match codec.decode(buffer).map_err(HelmsmanError::from)? {
        Some(frame) => {
            let (request, _): (ExecutorRequest, usize) =
                bincode::decode_from_slice(&frame, bincode::config::standard())?;
            Ok(Some(request))
        }
        None => Ok(None),
    }
}

// --- Backend trait ----------------------------------------------------------

/// What the executor client needs from an executor connection.
#[async_trait]
pub trait ExecutorBackend: Send + Sync {
    async fn register(&self, rsc: &ResourceSpec) -> Result<(), HelmsmanError>;

    async fn unregister(&self, rsc_id: &str) -> Result<(), HelmsmanError>;

    /// Submits an operation; returns the executor-assigned call id.
    async fn exec(&self, request: ExecRequest) -> Result<i32, HelmsmanError>;

    /// Asks the executor to cancel a (recurring) operation.
    async fn cancel(
        &self,
        rsc_id: &str,
        action: &str,
        interval_ms: u32,
    ) -> Result<CancelOutcome, HelmsmanError>;

    /// Fetches the agent self-description document.
    async fn get_metadata(&self, rsc: &ResourceSpec) -> Result<String, HelmsmanError>;

    /// Hands over the event stream. May only be called once per connection.
    fn take_events(&self) -> Option<mpsc::Receiver<ExecutorEvent>>;

    /// Attempts to re-establish a lost connection, yielding the new event
    /// stream on success.
    async fn reconnect(&self) -> Result<mpsc::Receiver<ExecutorEvent>, HelmsmanError>;

    fn is_connected(&self) -> bool;
}

// --- Scripted in-process backend --------------------------------------------

/// A deterministic in-process executor. Registered resources accept exec
/// requests; results are injected by the driver (a test, or the remote-node
/// relay). Recurring cancels behave like the real daemon: active ops get a
/// cancelled completion, unknown ops report nothing-to-cancel.
pub struct ScriptedExecutor {
    registered: Mutex<Vec<ResourceSpec>>,
    call_ids: CallIdAllocator,
    active: Mutex<Vec<(i32, ExecRequest)>>,
    metadata: Mutex<BTreeMap<String, String>>,
    events_tx: Mutex<mpsc::Sender<ExecutorEvent>>,
    events_rx: Mutex<Option<mpsc::Receiver<ExecutorEvent>>>,
    connected: AtomicBool,
    reconnectable: AtomicBool,
    /// When set, exec requests complete immediately with this status/rc.
    auto_result: Mutex<Option<(OpStatus, i32)>>,
}

impl ScriptedExecutor {
    pub fn new() -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::channel(256);
        Arc::new(Self {
            registered: Mutex::new(Vec::new()),
            call_ids: CallIdAllocator::new(),
            active: Mutex::new(Vec::new()),
            metadata: Mutex::new(BTreeMap::new()),
            events_tx: Mutex::new(events_tx),
            events_rx: Mutex::new(Some(events_rx)),
            connected: AtomicBool::new(true),
            reconnectable: AtomicBool::new(false),
            auto_result: Mutex::new(None),
        })
    }

    /// Allows `reconnect` to succeed after a simulated disconnect.
    pub fn allow_reconnect(&self, allowed: bool) {
        self.reconnectable.store(allowed, Ordering::Release);
    }

    /// Provides the metadata document returned for an agent spec.
    pub fn script_metadata(&self, rsc: &ResourceSpec, document: &str) {
        self.metadata
            .lock()
            .insert(rsc.agent_spec(), document.to_string());
    }

    /// Makes every subsequent exec complete immediately with the given
    /// result.
    pub fn auto_complete(&self, status: OpStatus, rc: i32) {
        *self.auto_result.lock() = Some((status, rc));
    }

    /// Active (not yet completed) requests, oldest first.
    pub fn active_requests(&self) -> Vec<(i32, ExecRequest)> {
        self.active.lock().clone()
    }

    /// Completes an active request with the given result.
    pub async fn complete(&self, call_id: i32, status: OpStatus, rc: i32) -> bool {
        let request = {
            let mut active = self.active.lock();
            match active.iter().position(|(id, _)| *id == call_id) {
                Some(idx) => active.remove(idx).1,
                None => return false,
            }
        };
        self.push_result(call_id, &request, status, rc).await;
        true
    }

    async fn push_result(&self, call_id: i32, request: &ExecRequest, status: OpStatus, rc: i32) {
        let event = ExecutorEvent::ExecComplete(OpEvent {
            rsc_id: request.rsc_id.clone(),
            op_type: request.action.clone(),
            interval_ms: request.interval_ms,
            call_id,
            rc,
            op_status: status,
            output: None,
            user_data: request.user_data.clone(),
            rsc_deleted: false,
            exec_time_ms: 0,
            queue_time_ms: 0,
            params: request.params.clone(),
        });
        let tx = self.events_tx.lock().clone();
        let _ = tx.send(event).await;
    }

    /// Simulates the daemon going away.
    pub async fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
        let tx = self.events_tx.lock().clone();
        let _ = tx.send(ExecutorEvent::Disconnect).await;
    }
}

#[async_trait]
impl ExecutorBackend for ScriptedExecutor {
    async fn register(&self, rsc: &ResourceSpec) -> Result<(), HelmsmanError> {
        let mut registered = self.registered.lock();
        if !registered.iter().any(|r| r.id == rsc.id) {
            registered.push(rsc.clone());
        }
        Ok(())
    }

    async fn unregister(&self, rsc_id: &str) -> Result<(), HelmsmanError> {
        self.registered.lock().retain(|r| r.id != rsc_id);
        Ok(())
    }

    async fn exec(&self, request: ExecRequest) -> Result<i32, HelmsmanError> {
        if !self.is_connected() {
            return Err(HelmsmanError::NotConnected("executor".to_string()));
        }
        if !self
            .registered
            .lock()
            .iter()
            .any(|r| r.id == request.rsc_id)
        {
            return Err(HelmsmanError::UnknownResource(request.rsc_id.clone()));
        }

        let call_id = self.call_ids.next();
        debug!(
            "Executor accepted {}:{} as call {}",
            request.rsc_id, request.action, call_id
        );

        let auto = *self.auto_result.lock();
        match auto {
            Some((status, rc)) => self.push_result(call_id, &request, status, rc).await,
            None => self.active.lock().push((call_id, request)),
        }
        Ok(call_id)
    }

    async fn cancel(
        &self,
        rsc_id: &str,
        action: &str,
        interval_ms: u32,
    ) -> Result<CancelOutcome, HelmsmanError> {
        let request = {
            let mut active = self.active.lock();
            match active.iter().position(|(_, r)| {
                r.rsc_id == rsc_id && r.action == action && r.interval_ms == interval_ms
            }) {
                Some(idx) => Some(active.remove(idx)),
                None => None,
            }
        };

        match request {
            Some((call_id, request)) => {
                trace!("Cancelling call {} ({}:{})", call_id, rsc_id, action);
                self.push_result(call_id, &request, OpStatus::Cancelled, 0)
                    .await;
                Ok(CancelOutcome::Cancelled)
            }
            None => Ok(CancelOutcome::NothingToCancel),
        }
    }

    async fn get_metadata(&self, rsc: &ResourceSpec) -> Result<String, HelmsmanError> {
        self.metadata
            .lock()
            .get(&rsc.agent_spec())
            .cloned()
            .ok_or_else(|| HelmsmanError::UnknownResource(rsc.agent_spec()))
    }

    fn take_events(&self) -> Option<mpsc::Receiver<ExecutorEvent>> {
        self.events_rx.lock().take()
    }

    async fn reconnect(&self) -> Result<mpsc::Receiver<ExecutorEvent>, HelmsmanError> {
        if self.reconnectable.load(Ordering::Acquire) {
            let (tx, rx) = mpsc::channel(256);
            // The sender is swapped in place; results injected after this
            // point reach the new stream.
            *self.events_tx.lock() = tx;
            self.connected.store(true, Ordering::Release);
            Ok(rx)
        } else {
            Err(HelmsmanError::NotConnected(
                "executor refused reconnection".to_string(),
            ))
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}
