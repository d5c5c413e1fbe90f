mod archive;
mod spec;

pub use archive::sha256_hex;
pub use spec::{ApplyOutcome, SyncSpec, SyncSpecBuilder};

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bus::{EventBus, Subscription};
use crate::envelope::now_millis;
use crate::error::{FleetwireError, Result};
use crate::interfaces::messenger::Messenger;
use crate::interfaces::scheduler::{Scheduler, TaskHandle};

pub const REQUEST_CHANNEL: &str = "fleetwire:filesync:req";
pub const RESPONSE_META_CHANNEL: &str = "fleetwire:filesync:res_meta";
pub const RESPONSE_CHUNK_CHANNEL: &str = "fleetwire:filesync:res_chunk";
pub const INVALIDATE_CHANNEL: &str = "fleetwire:filesync:invalidate";

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_TRANSFER_TIMEOUT: Duration = Duration::from_secs(20);
const DEFAULT_MAX_CHUNK_BYTES: usize = 8 * 1024;
const DEFAULT_MAX_PAYLOAD_BYTES: u64 = 5 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncRole {
    Authority,
    Follower,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub request_id: String,
    pub group_id: String,
    #[serde(default)]
    pub file_hashes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponseMeta {
    pub request_id: String,
    pub group_id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub delete_paths: Vec<String>,
    pub chunk_count: i32,
    pub payload_size: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_sha256: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponseChunk {
    pub request_id: String,
    pub group_id: String,
    pub index: i32,
    pub data_base64: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncInvalidate {
    pub group_id: String,
    pub invalidate_id: String,
    #[serde(default)]
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub group_id: String,
    pub files_written: usize,
    pub files_deleted: usize,
    pub written_paths: Vec<String>,
    pub deleted_paths: Vec<String>,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("only a follower can request a sync")]
    WrongRole,
    #[error("messenger is not connected")]
    NotConnected,
    #[error("sync endpoint is closed")]
    Closed,
    #[error("file sync request timed out: {0}")]
    RequestTimeout(String),
    #[error("file sync transfer timed out: {0}")]
    TransferTimeout(String),
    #[error("authority returned an error: {0}")]
    Authority(String),
    #[error("payload too large ({0} bytes)")]
    PayloadTooLarge(i64),
    #[error("invalid chunk count: {0}")]
    InvalidChunkCount(i32),
    #[error("payload checksum mismatch")]
    ChecksumMismatch,
    #[error("file sync protocol error: {0}")]
    Protocol(String),
    #[error("i/o error: {0}")]
    Io(String),
    #[error("failed to send file sync message: {0}")]
    Send(String),
}

/// Observer hooks for sync activity; all methods default to no-ops.
pub trait SyncListener: Send + Sync {
    fn on_invalidate(&self, _invalidate: &SyncInvalidate, _source_server: &str) {}
    fn on_applied(&self, _report: &SyncReport) {}
    fn on_error(&self, _message: &str) {}
}

struct NoopListener;

impl SyncListener for NoopListener {}

struct InFlightTransfer {
    meta: SyncResponseMeta,
    chunks: Vec<Option<String>>,
    received: usize,
    timeout_task: Box<dyn TaskHandle>,
}

struct PendingSync {
    tx: Option<oneshot::Sender<std::result::Result<SyncReport, SyncError>>>,
    request_timeout: Box<dyn TaskHandle>,
    transfer: Option<InFlightTransfer>,
}

struct SyncInner {
    bus: EventBus,
    scheduler: Arc<dyn Scheduler>,
    group_id: String,
    spec: Arc<SyncSpec>,
    role: SyncRole,
    authority_server: Option<String>,
    auto_resync: bool,
    request_timeout: Duration,
    transfer_timeout: Duration,
    max_chunk_bytes: usize,
    max_payload_bytes: u64,
    listener: Arc<dyn SyncListener>,
    pending: Mutex<HashMap<String, PendingSync>>,
    closed: AtomicBool,
}

/// Authority/follower endpoint for chunked file synchronization over a
/// [`Messenger`]. The payload travels in fixed-size chunks so transports with
/// small message limits can carry it.
pub struct SyncEndpoint {
    inner: Arc<SyncInner>,
    subscriptions: Vec<Subscription>,
}

pub struct SyncEndpointBuilder {
    messenger: Arc<dyn Messenger>,
    scheduler: Arc<dyn Scheduler>,
    group_id: String,
    spec: SyncSpec,
    role: SyncRole,
    authority_server: Option<String>,
    auto_resync: bool,
    request_timeout: Duration,
    transfer_timeout: Duration,
    max_chunk_bytes: usize,
    max_payload_bytes: u64,
    listener: Option<Arc<dyn SyncListener>>,
}

impl SyncEndpointBuilder {
    pub fn authority_server(mut self, server_name: impl Into<String>) -> Self {
        self.authority_server = Some(server_name.into());
        self
    }

    pub fn auto_resync(mut self, auto_resync: bool) -> Self {
        self.auto_resync = auto_resync;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn transfer_timeout(mut self, timeout: Duration) -> Self {
        self.transfer_timeout = timeout;
        self
    }

    pub fn max_chunk_bytes(mut self, max_chunk_bytes: usize) -> Self {
        self.max_chunk_bytes = max_chunk_bytes;
        self
    }

    pub fn max_payload_bytes(mut self, max_payload_bytes: u64) -> Self {
        self.max_payload_bytes = max_payload_bytes;
        self
    }

    pub fn listener(mut self, listener: Arc<dyn SyncListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn build(self) -> Result<SyncEndpoint> {
        if self.group_id.trim().is_empty() {
            return Err(FleetwireError::Config("group id cannot be blank".into()));
        }
        let authority_server = self
            .authority_server
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty());
        if self.role == SyncRole::Follower && authority_server.is_none() {
            return Err(FleetwireError::Config(
                "a follower needs an authority server name".into(),
            ));
        }

        let bus = EventBus::new(self.messenger);
        let inner = Arc::new(SyncInner {
            bus: bus.clone(),
            scheduler: self.scheduler,
            group_id: self.group_id,
            spec: Arc::new(self.spec),
            role: self.role,
            authority_server,
            auto_resync: self.auto_resync,
            request_timeout: positive_or(self.request_timeout, DEFAULT_REQUEST_TIMEOUT),
            transfer_timeout: positive_or(self.transfer_timeout, DEFAULT_TRANSFER_TIMEOUT),
            max_chunk_bytes: if self.max_chunk_bytes == 0 {
                DEFAULT_MAX_CHUNK_BYTES
            } else {
                self.max_chunk_bytes
            },
            max_payload_bytes: if self.max_payload_bytes == 0 {
                DEFAULT_MAX_PAYLOAD_BYTES
            } else {
                self.max_payload_bytes
            },
            listener: self.listener.unwrap_or_else(|| Arc::new(NoopListener)),
            pending: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });

        let subscriptions = vec![
            bus.register::<SyncRequest, _>(REQUEST_CHANNEL, {
                let inner = Arc::clone(&inner);
                move |request, source_server: &str| inner.handle_request(request, source_server)
            }),
            bus.register::<SyncResponseMeta, _>(RESPONSE_META_CHANNEL, {
                let inner = Arc::clone(&inner);
                move |meta, source_server: &str| inner.handle_meta(meta, source_server)
            }),
            bus.register::<SyncResponseChunk, _>(RESPONSE_CHUNK_CHANNEL, {
                let inner = Arc::clone(&inner);
                move |chunk, source_server: &str| inner.handle_chunk(chunk, source_server)
            }),
            bus.register::<SyncInvalidate, _>(INVALIDATE_CHANNEL, {
                let inner = Arc::clone(&inner);
                move |invalidate, source_server: &str| {
                    inner.handle_invalidate(invalidate, source_server)
                }
            }),
        ];

        Ok(SyncEndpoint {
            inner,
            subscriptions,
        })
    }
}

impl SyncEndpoint {
    pub fn builder(
        messenger: Arc<dyn Messenger>,
        scheduler: Arc<dyn Scheduler>,
        group_id: impl Into<String>,
        spec: SyncSpec,
        role: SyncRole,
    ) -> SyncEndpointBuilder {
        SyncEndpointBuilder {
            messenger,
            scheduler,
            group_id: group_id.into(),
            spec,
            role,
            authority_server: None,
            auto_resync: false,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            transfer_timeout: DEFAULT_TRANSFER_TIMEOUT,
            max_chunk_bytes: DEFAULT_MAX_CHUNK_BYTES,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            listener: None,
        }
    }

    pub fn group_id(&self) -> &str {
        &self.inner.group_id
    }

    pub fn role(&self) -> SyncRole {
        self.inner.role
    }

    /// Follower-only: computes the local manifest, asks the authority for the
    /// diff, and resolves once the transfer has been applied.
    pub async fn request_sync(&self) -> std::result::Result<SyncReport, SyncError> {
        self.inner.request_sync().await
    }

    /// Authority-only: tells every server that the group's content changed.
    pub async fn broadcast_invalidate(&self) -> std::result::Result<(), SyncError> {
        if self.inner.role != SyncRole::Authority {
            return Err(SyncError::WrongRole);
        }
        let invalidate = SyncInvalidate {
            group_id: self.inner.group_id.clone(),
            invalidate_id: Uuid::new_v4().to_string(),
            created_at: now_millis(),
        };
        self.inner
            .bus
            .send_to_all(INVALIDATE_CHANNEL, &invalidate)
            .await
            .map_err(|e| SyncError::Send(e.to_string()))
    }

    /// Cancels all pending timers and fails every in-flight sync.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for subscription in &self.subscriptions {
            subscription.close();
        }
        let drained: Vec<PendingSync> = {
            let mut pending = self.inner.pending_lock();
            pending.drain().map(|(_, entry)| entry).collect()
        };
        for mut entry in drained {
            entry.request_timeout.cancel();
            if let Some(transfer) = entry.transfer.take() {
                transfer.timeout_task.cancel();
            }
            if let Some(tx) = entry.tx.take() {
                let _ = tx.send(Err(SyncError::Closed));
            }
        }
    }
}

impl Drop for SyncEndpoint {
    fn drop(&mut self) {
        self.close();
    }
}

impl SyncInner {
    async fn request_sync(self: &Arc<Self>) -> std::result::Result<SyncReport, SyncError> {
        if self.role != SyncRole::Follower {
            return Err(SyncError::WrongRole);
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(SyncError::Closed);
        }
        if !self.bus.messenger().is_connected() {
            return Err(SyncError::NotConnected);
        }

        let manifest = {
            let spec = Arc::clone(&self.spec);
            tokio::task::spawn_blocking(move || spec.compute_manifest())
                .await
                .map_err(|e| SyncError::Io(e.to_string()))?
                .map_err(|e| SyncError::Io(e.to_string()))?
        };

        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();

        let request_timeout = {
            let inner = Arc::clone(self);
            let request_id = request_id.clone();
            self.scheduler.run_later(
                self.request_timeout,
                async move {
                    let group_id = inner.group_id.clone();
                    inner.fail_pending(&request_id, SyncError::RequestTimeout(group_id));
                }
                .boxed(),
            )
        };

        self.pending_lock().insert(
            request_id.clone(),
            PendingSync {
                tx: Some(tx),
                request_timeout,
                transfer: None,
            },
        );

        let authority = self.authority_server.clone().unwrap_or_default();
        let request = SyncRequest {
            request_id: request_id.clone(),
            group_id: self.group_id.clone(),
            file_hashes: manifest,
        };
        if let Err(err) = self
            .bus
            .send_to_server(REQUEST_CHANNEL, &authority, &request)
            .await
        {
            if let Some(mut entry) = self.remove_pending(&request_id) {
                entry.request_timeout.cancel();
                entry.tx.take();
            }
            return Err(SyncError::Send(err.to_string()));
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Closed),
        }
    }

    fn handle_request(self: &Arc<Self>, request: SyncRequest, source_server: &str) {
        if self.role != SyncRole::Authority {
            return;
        }
        if request.request_id.is_empty() || request.group_id != self.group_id {
            return;
        }
        if source_server.trim().is_empty() {
            return;
        }
        let inner = Arc::clone(self);
        let source_server = source_server.to_string();
        self.scheduler.run(
            async move {
                inner.serve_request(request, source_server).await;
            }
            .boxed(),
        );
    }

    async fn serve_request(&self, request: SyncRequest, source_server: String) {
        let built = {
            let spec = Arc::clone(&self.spec);
            let remote = request.file_hashes.clone();
            tokio::task::spawn_blocking(move || build_response_payload(&spec, &remote)).await
        };
        let payload = match built {
            Ok(Ok(payload)) => payload,
            Ok(Err(err)) => {
                self.listener
                    .on_error(&format!("file sync authority handler failed: {err}"));
                self.send_error(&request.request_id, &source_server, &err.to_string())
                    .await;
                return;
            }
            Err(err) => {
                self.listener
                    .on_error(&format!("file sync authority handler failed: {err}"));
                self.send_error(&request.request_id, &source_server, &err.to_string())
                    .await;
                return;
            }
        };

        if payload.archive.len() as u64 > self.max_payload_bytes {
            self.send_error(
                &request.request_id,
                &source_server,
                &format!("payload too large ({} bytes)", payload.archive.len()),
            )
            .await;
            return;
        }

        let chunk_count = if payload.archive.is_empty() {
            0
        } else {
            payload.archive.len().div_ceil(self.max_chunk_bytes)
        };
        let meta = SyncResponseMeta {
            request_id: request.request_id.clone(),
            group_id: self.group_id.clone(),
            ok: true,
            error: None,
            delete_paths: payload.delete_paths,
            chunk_count: chunk_count as i32,
            payload_size: payload.archive.len() as i64,
            payload_sha256: Some(archive::sha256_hex(&payload.archive)),
        };
        if let Err(err) = self
            .bus
            .send_to_server(RESPONSE_META_CHANNEL, &source_server, &meta)
            .await
        {
            warn!("failed to send file sync meta ({}): {err}", self.group_id);
            return;
        }

        for (index, slice) in payload.archive.chunks(self.max_chunk_bytes).enumerate() {
            let chunk = SyncResponseChunk {
                request_id: request.request_id.clone(),
                group_id: self.group_id.clone(),
                index: index as i32,
                data_base64: BASE64.encode(slice),
            };
            if let Err(err) = self
                .bus
                .send_to_server(RESPONSE_CHUNK_CHANNEL, &source_server, &chunk)
                .await
            {
                warn!("failed to send file sync chunk ({}): {err}", self.group_id);
                return;
            }
        }
    }

    async fn send_error(&self, request_id: &str, target_server: &str, message: &str) {
        let meta = SyncResponseMeta {
            request_id: request_id.to_string(),
            group_id: self.group_id.clone(),
            ok: false,
            error: Some(message.to_string()),
            delete_paths: Vec::new(),
            chunk_count: 0,
            payload_size: 0,
            payload_sha256: None,
        };
        if let Err(err) = self
            .bus
            .send_to_server(RESPONSE_META_CHANNEL, target_server, &meta)
            .await
        {
            debug!(
                "failed to send file sync error response ({}, requestId={request_id}): {err}",
                self.group_id
            );
        }
    }

    fn handle_meta(self: &Arc<Self>, meta: SyncResponseMeta, source_server: &str) {
        if self.role != SyncRole::Follower {
            return;
        }
        if meta.request_id.is_empty() || meta.group_id != self.group_id {
            return;
        }
        if !self.source_is_authority(source_server) {
            return;
        }
        if !self.pending_lock().contains_key(&meta.request_id) {
            return;
        }

        if meta.ok {
            if meta.payload_size > self.max_payload_bytes as i64 {
                self.fail_pending(&meta.request_id, SyncError::PayloadTooLarge(meta.payload_size));
                return;
            }
            if meta.chunk_count < 0 {
                self.fail_pending(&meta.request_id, SyncError::InvalidChunkCount(meta.chunk_count));
                return;
            }
        }

        if !meta.ok {
            let message = meta
                .error
                .clone()
                .filter(|error| !error.trim().is_empty())
                .unwrap_or_else(|| "authority returned an error".to_string());
            self.fail_pending(&meta.request_id, SyncError::Authority(message));
            return;
        }

        // Meta arrived; the request stage is complete.
        {
            let mut pending = self.pending_lock();
            if let Some(entry) = pending.get_mut(&meta.request_id) {
                entry.request_timeout.cancel();
            }
        }

        if meta.chunk_count == 0 {
            let inner = Arc::clone(self);
            self.scheduler.run(
                async move {
                    let request_id = meta.request_id.clone();
                    inner
                        .apply_and_complete(request_id, Vec::new(), meta.delete_paths)
                        .await;
                }
                .boxed(),
            );
            return;
        }

        let transfer_timeout = {
            let inner = Arc::clone(self);
            let request_id = meta.request_id.clone();
            self.scheduler.run_later(
                self.transfer_timeout,
                async move {
                    let group_id = inner.group_id.clone();
                    inner.fail_pending(&request_id, SyncError::TransferTimeout(group_id));
                }
                .boxed(),
            )
        };

        let mut pending = self.pending_lock();
        match pending.get_mut(&meta.request_id) {
            Some(entry) => {
                let chunk_count = meta.chunk_count as usize;
                entry.transfer = Some(InFlightTransfer {
                    meta,
                    chunks: vec![None; chunk_count],
                    received: 0,
                    timeout_task: transfer_timeout,
                });
            }
            None => transfer_timeout.cancel(),
        }
    }

    fn handle_chunk(self: &Arc<Self>, chunk: SyncResponseChunk, source_server: &str) {
        if self.role != SyncRole::Follower {
            return;
        }
        let SyncResponseChunk {
            request_id,
            group_id,
            index,
            data_base64,
        } = chunk;
        if request_id.is_empty() || group_id != self.group_id {
            return;
        }
        if !self.source_is_authority(source_server) {
            return;
        }
        if data_base64.is_empty() {
            return;
        }

        let completed = {
            let mut pending = self.pending_lock();
            let Some(entry) = pending.get_mut(&request_id) else {
                return;
            };
            let Some(transfer) = entry.transfer.as_mut() else {
                return;
            };
            if index < 0 || index as usize >= transfer.chunks.len() {
                return;
            }
            let slot = &mut transfer.chunks[index as usize];
            if slot.is_none() {
                transfer.received += 1;
            }
            *slot = Some(data_base64);
            if transfer.received < transfer.chunks.len() {
                None
            } else {
                // All slots filled; pull the transfer out for assembly while
                // the pending entry stays registered until apply finishes.
                let transfer = entry.transfer.take();
                if let Some(transfer) = &transfer {
                    transfer.timeout_task.cancel();
                }
                transfer
            }
        };

        let Some(transfer) = completed else {
            return;
        };
        let inner = Arc::clone(self);
        self.scheduler.run(
            async move {
                inner.assemble_and_apply(request_id, transfer).await;
            }
            .boxed(),
        );
    }

    async fn assemble_and_apply(&self, request_id: String, transfer: InFlightTransfer) {
        let mut payload = Vec::with_capacity(transfer.meta.payload_size.max(0) as usize);
        for encoded in &transfer.chunks {
            let Some(encoded) = encoded else {
                self.fail_pending(&request_id, SyncError::Protocol("missing chunk".into()));
                return;
            };
            match BASE64.decode(encoded.as_bytes()) {
                Ok(bytes) => payload.extend_from_slice(&bytes),
                Err(err) => {
                    self.fail_pending(
                        &request_id,
                        SyncError::Protocol(format!("invalid chunk payload: {err}")),
                    );
                    return;
                }
            }
        }

        if let Some(expected) = transfer.meta.payload_sha256.as_deref() {
            let actual = archive::sha256_hex(&payload);
            if !expected.eq_ignore_ascii_case(&actual) {
                self.fail_pending(&request_id, SyncError::ChecksumMismatch);
                return;
            }
        }

        self.apply_and_complete(request_id, payload, transfer.meta.delete_paths)
            .await;
    }

    async fn apply_and_complete(
        &self,
        request_id: String,
        payload: Vec<u8>,
        delete_paths: Vec<String>,
    ) {
        let applied = {
            let spec = Arc::clone(&self.spec);
            tokio::task::spawn_blocking(move || spec.apply_archive(&payload, &delete_paths)).await
        };
        let outcome = match applied {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => {
                self.fail_pending(&request_id, SyncError::Io(err.to_string()));
                return;
            }
            Err(err) => {
                self.fail_pending(&request_id, SyncError::Io(err.to_string()));
                return;
            }
        };

        let report = SyncReport {
            group_id: self.group_id.clone(),
            files_written: outcome.written.len(),
            files_deleted: outcome.deleted.len(),
            written_paths: outcome.written,
            deleted_paths: outcome.deleted,
        };

        let Some(mut entry) = self.remove_pending(&request_id) else {
            return;
        };
        entry.request_timeout.cancel();
        if let Some(transfer) = entry.transfer.take() {
            transfer.timeout_task.cancel();
        }
        self.listener.on_applied(&report);
        if let Some(tx) = entry.tx.take() {
            let _ = tx.send(Ok(report));
        }
    }

    fn handle_invalidate(self: &Arc<Self>, invalidate: SyncInvalidate, source_server: &str) {
        if invalidate.group_id != self.group_id {
            return;
        }
        self.listener.on_invalidate(&invalidate, source_server);

        if self.role != SyncRole::Follower || !self.auto_resync {
            return;
        }
        if !self.source_is_authority(source_server) {
            return;
        }
        if !self.bus.messenger().is_connected() {
            return;
        }
        if !self.pending_lock().is_empty() {
            return;
        }

        let inner = Arc::clone(self);
        self.scheduler.run(
            async move {
                if let Err(err) = inner.request_sync().await {
                    inner.listener.on_error(&format!("auto sync failed: {err}"));
                }
            }
            .boxed(),
        );
    }

    fn source_is_authority(&self, source_server: &str) -> bool {
        match &self.authority_server {
            Some(authority) => authority.eq_ignore_ascii_case(source_server),
            None => true,
        }
    }

    fn fail_pending(&self, request_id: &str, error: SyncError) {
        let Some(mut entry) = self.remove_pending(request_id) else {
            return;
        };
        entry.request_timeout.cancel();
        if let Some(transfer) = entry.transfer.take() {
            transfer.timeout_task.cancel();
        }
        warn!("file sync failed ({}): {error}", self.group_id);
        if let Some(tx) = entry.tx.take() {
            let _ = tx.send(Err(error));
        }
    }

    fn remove_pending(&self, request_id: &str) -> Option<PendingSync> {
        self.pending_lock().remove(request_id)
    }

    fn pending_lock(&self) -> MutexGuard<'_, HashMap<String, PendingSync>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

struct ResponsePayload {
    delete_paths: Vec<String>,
    archive: Vec<u8>,
}

fn build_response_payload(
    spec: &SyncSpec,
    remote: &BTreeMap<String, String>,
) -> Result<ResponsePayload> {
    let local = spec.compute_manifest()?;

    let mut changed: BTreeSet<String> = BTreeSet::new();
    for (path, hash) in &local {
        match remote.get(path) {
            Some(remote_hash) if remote_hash.eq_ignore_ascii_case(hash) => {}
            _ => {
                changed.insert(path.clone());
            }
        }
    }

    let mut delete_paths = Vec::new();
    if spec.delete_extraneous() && !remote.is_empty() {
        for path in remote.keys() {
            if !local.contains_key(path) {
                delete_paths.push(path.clone());
            }
        }
    }

    let archive = if changed.is_empty() {
        Vec::new()
    } else {
        spec.build_archive(&changed)?
    };
    Ok(ResponsePayload {
        delete_paths,
        archive,
    })
}

fn positive_or(value: Duration, fallback: Duration) -> Duration {
    if value.is_zero() {
        fallback
    } else {
        value
    }
}
