mod common;

use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use fleetwire::error::Result;
use fleetwire::filesync::{
    SyncEndpoint, SyncError, SyncInvalidate, SyncListener, SyncReport, SyncResponseChunk,
    SyncResponseMeta, SyncRole, SyncSpec, RESPONSE_CHUNK_CHANNEL, RESPONSE_META_CHANNEL,
    REQUEST_CHANNEL,
};
use fleetwire::interfaces::messenger::{MessageListener, Messenger};
use fleetwire::interfaces::scheduler::Scheduler;

use common::{ManualScheduler, TestNetwork};

fn spec_for(root: &std::path::Path) -> SyncSpec {
    SyncSpec::builder(root).include_glob("**").build().unwrap()
}

fn endpoint(
    messenger: Arc<dyn Messenger>,
    scheduler: &Arc<ManualScheduler>,
    spec: SyncSpec,
    role: SyncRole,
) -> fleetwire::filesync::SyncEndpointBuilder {
    SyncEndpoint::builder(
        messenger,
        Arc::clone(scheduler) as Arc<dyn Scheduler>,
        "group",
        spec,
        role,
    )
}

#[tokio::test]
async fn follower_receives_and_applies_files() {
    common::init_tracing();
    let temp = tempfile::tempdir().unwrap();
    let authority_dir = temp.path().join("authority");
    let follower_dir = temp.path().join("follower");
    fs::create_dir_all(&authority_dir).unwrap();
    fs::create_dir_all(&follower_dir).unwrap();
    fs::write(authority_dir.join("a.txt"), "hello").unwrap();

    let network = TestNetwork::new();
    let scheduler = ManualScheduler::new();

    let _authority = endpoint(
        network.create("auth", "proxy"),
        &scheduler,
        spec_for(&authority_dir),
        SyncRole::Authority,
    )
    .build()
    .unwrap();
    let follower = endpoint(
        network.create("fol", "proxy"),
        &scheduler,
        spec_for(&follower_dir),
        SyncRole::Follower,
    )
    .authority_server("auth")
    .build()
    .unwrap();

    let report = follower.request_sync().await.unwrap();

    let applied = follower_dir.join("a.txt");
    assert!(applied.is_file());
    assert_eq!(fs::read(&applied).unwrap(), b"hello");
    assert_eq!(report.files_written, 1);
    assert_eq!(report.files_deleted, 0);
    assert_eq!(report.written_paths, vec!["a.txt".to_string()]);
}

#[tokio::test]
async fn follower_deletes_extraneous_files_when_enabled() {
    let temp = tempfile::tempdir().unwrap();
    let authority_dir = temp.path().join("authority");
    let follower_dir = temp.path().join("follower");
    fs::create_dir_all(&authority_dir).unwrap();
    fs::create_dir_all(&follower_dir).unwrap();
    fs::write(authority_dir.join("a.txt"), "hello").unwrap();
    fs::write(follower_dir.join("a.txt"), "hello").unwrap();
    fs::write(follower_dir.join("b.txt"), "remove-me").unwrap();

    let network = TestNetwork::new();
    let scheduler = ManualScheduler::new();

    let authority_spec = SyncSpec::builder(&authority_dir)
        .include_glob("**")
        .delete_extraneous(true)
        .build()
        .unwrap();
    let _authority = endpoint(
        network.create("auth", "proxy"),
        &scheduler,
        authority_spec,
        SyncRole::Authority,
    )
    .build()
    .unwrap();
    let follower = endpoint(
        network.create("fol", "proxy"),
        &scheduler,
        spec_for(&follower_dir),
        SyncRole::Follower,
    )
    .authority_server("auth")
    .build()
    .unwrap();

    let report = follower.request_sync().await.unwrap();

    assert!(follower_dir.join("a.txt").is_file());
    assert!(!follower_dir.join("b.txt").exists());
    assert_eq!(report.files_written, 0);
    assert_eq!(report.files_deleted, 1);
    assert_eq!(report.deleted_paths, vec!["b.txt".to_string()]);
}

#[tokio::test]
async fn follower_rejects_oversized_payload() {
    let temp = tempfile::tempdir().unwrap();
    let authority_dir = temp.path().join("authority");
    let follower_dir = temp.path().join("follower");
    fs::create_dir_all(&authority_dir).unwrap();
    fs::create_dir_all(&follower_dir).unwrap();
    fs::write(authority_dir.join("big.bin"), vec![7u8; 256]).unwrap();

    let network = TestNetwork::new();
    let scheduler = ManualScheduler::new();

    let _authority = endpoint(
        network.create("auth", "proxy"),
        &scheduler,
        spec_for(&authority_dir),
        SyncRole::Authority,
    )
    .build()
    .unwrap();
    let follower = endpoint(
        network.create("fol", "proxy"),
        &scheduler,
        spec_for(&follower_dir),
        SyncRole::Follower,
    )
    .authority_server("auth")
    .max_payload_bytes(32)
    .build()
    .unwrap();

    let err = follower.request_sync().await.unwrap_err();
    assert!(matches!(err, SyncError::PayloadTooLarge(_)));
    assert!(format!("{err}").to_lowercase().contains("payload too large"));
    assert!(!follower_dir.join("big.bin").exists());
}

#[tokio::test]
async fn follower_fails_on_checksum_mismatch() {
    let temp = tempfile::tempdir().unwrap();
    let authority_dir = temp.path().join("authority");
    let follower_dir = temp.path().join("follower");
    fs::create_dir_all(&authority_dir).unwrap();
    fs::create_dir_all(&follower_dir).unwrap();
    fs::write(authority_dir.join("a.txt"), "hello").unwrap();

    let network = TestNetwork::new();
    let scheduler = ManualScheduler::new();

    let raw_authority = network.create("auth", "proxy");
    let tampering = Arc::new(TamperingMessenger::new(
        raw_authority,
        TamperMode::CorruptFirstChunk,
    ));
    let _authority = endpoint(
        tampering,
        &scheduler,
        spec_for(&authority_dir),
        SyncRole::Authority,
    )
    .build()
    .unwrap();
    let follower = endpoint(
        network.create("fol", "proxy"),
        &scheduler,
        spec_for(&follower_dir),
        SyncRole::Follower,
    )
    .authority_server("auth")
    .build()
    .unwrap();

    let err = follower.request_sync().await.unwrap_err();
    assert!(matches!(err, SyncError::ChecksumMismatch));
    assert!(format!("{err}").to_lowercase().contains("checksum"));
}

#[tokio::test]
async fn follower_fails_on_invalid_chunk_count() {
    let temp = tempfile::tempdir().unwrap();
    let authority_dir = temp.path().join("authority");
    let follower_dir = temp.path().join("follower");
    fs::create_dir_all(&authority_dir).unwrap();
    fs::create_dir_all(&follower_dir).unwrap();
    fs::write(authority_dir.join("a.txt"), "hello").unwrap();

    let network = TestNetwork::new();
    let scheduler = ManualScheduler::new();

    let raw_authority = network.create("auth", "proxy");
    let tampering = Arc::new(TamperingMessenger::new(
        raw_authority,
        TamperMode::InvalidChunkCount,
    ));
    let _authority = endpoint(
        tampering,
        &scheduler,
        spec_for(&authority_dir),
        SyncRole::Authority,
    )
    .build()
    .unwrap();
    let follower = endpoint(
        network.create("fol", "proxy"),
        &scheduler,
        spec_for(&follower_dir),
        SyncRole::Follower,
    )
    .authority_server("auth")
    .build()
    .unwrap();

    let err = follower.request_sync().await.unwrap_err();
    assert!(matches!(err, SyncError::InvalidChunkCount(-1)));
    assert!(format!("{err}").to_lowercase().contains("chunk"));
}

#[tokio::test]
async fn request_times_out_without_an_authority() {
    let temp = tempfile::tempdir().unwrap();
    let follower_dir = temp.path().join("follower");
    fs::create_dir_all(&follower_dir).unwrap();

    let network = TestNetwork::new();
    let scheduler = ManualScheduler::new();

    let follower = Arc::new(
        endpoint(
            network.create("fol", "proxy"),
            &scheduler,
            spec_for(&follower_dir),
            SyncRole::Follower,
        )
        .authority_server("auth")
        .request_timeout(Duration::from_secs(1))
        .build()
        .unwrap(),
    );

    let call = tokio::spawn({
        let follower = Arc::clone(&follower);
        async move { follower.request_sync().await }
    });

    scheduler.wait_for_delayed(1).await;
    scheduler.fire_delayed().await;

    let err = call.await.unwrap().unwrap_err();
    assert!(matches!(err, SyncError::RequestTimeout(_)));
}

#[tokio::test]
async fn transfer_times_out_when_chunks_never_arrive() {
    let temp = tempfile::tempdir().unwrap();
    let follower_dir = temp.path().join("follower");
    fs::create_dir_all(&follower_dir).unwrap();

    let network = TestNetwork::new();
    let scheduler = ManualScheduler::new();

    // Fake authority: advertises one chunk in the meta but never sends it.
    let authority_messenger = network.create("auth", "proxy");
    let fake: MessageListener = {
        let authority = Arc::clone(&authority_messenger);
        Arc::new(move |_channel: &str, data: &str, source_server: &str| {
            let request: fleetwire::filesync::SyncRequest = serde_json::from_str(data).unwrap();
            let meta = SyncResponseMeta {
                request_id: request.request_id,
                group_id: request.group_id,
                ok: true,
                error: None,
                delete_paths: Vec::new(),
                chunk_count: 1,
                payload_size: 1,
                payload_sha256: Some("deadbeef".to_string()),
            };
            let authority = Arc::clone(&authority);
            let source_server = source_server.to_string();
            let payload = serde_json::to_string(&meta).unwrap();
            tokio::spawn(async move {
                let _ = authority
                    .send_to_server(RESPONSE_META_CHANNEL, &source_server, &payload)
                    .await;
            });
        })
    };
    authority_messenger.register_listener(REQUEST_CHANNEL, fake);

    let follower = Arc::new(
        endpoint(
            network.create("fol", "proxy"),
            &scheduler,
            spec_for(&follower_dir),
            SyncRole::Follower,
        )
        .authority_server("auth")
        .transfer_timeout(Duration::from_secs(1))
        .build()
        .unwrap(),
    );

    let call = tokio::spawn({
        let follower = Arc::clone(&follower);
        async move { follower.request_sync().await }
    });

    // First the request timeout is registered, then the transfer timeout once
    // the meta arrives; the request timeout is cancelled by then.
    scheduler.wait_for_delayed(2).await;
    assert!(scheduler.delayed_cancelled(0));
    scheduler.fire_delayed().await;

    let err = call.await.unwrap().unwrap_err();
    assert!(matches!(err, SyncError::TransferTimeout(_)));
}

#[tokio::test]
async fn invalidate_triggers_auto_resync() {
    let temp = tempfile::tempdir().unwrap();
    let authority_dir = temp.path().join("authority");
    let follower_dir = temp.path().join("follower");
    fs::create_dir_all(&authority_dir).unwrap();
    fs::create_dir_all(&follower_dir).unwrap();
    fs::write(authority_dir.join("a.txt"), "fresh").unwrap();

    let network = TestNetwork::new();
    let scheduler = ManualScheduler::new();

    struct Recorder {
        invalidated: AtomicBool,
        applied: Mutex<Option<SyncReport>>,
    }
    impl SyncListener for Recorder {
        fn on_invalidate(&self, _invalidate: &SyncInvalidate, _source_server: &str) {
            self.invalidated.store(true, Ordering::SeqCst);
        }
        fn on_applied(&self, report: &SyncReport) {
            *self.applied.lock().unwrap() = Some(report.clone());
        }
    }
    let recorder = Arc::new(Recorder {
        invalidated: AtomicBool::new(false),
        applied: Mutex::new(None),
    });

    let authority = endpoint(
        network.create("auth", "proxy"),
        &scheduler,
        spec_for(&authority_dir),
        SyncRole::Authority,
    )
    .build()
    .unwrap();
    let _follower = endpoint(
        network.create("fol", "proxy"),
        &scheduler,
        spec_for(&follower_dir),
        SyncRole::Follower,
    )
    .authority_server("auth")
    .auto_resync(true)
    .listener(Arc::clone(&recorder) as Arc<dyn SyncListener>)
    .build()
    .unwrap();

    authority.broadcast_invalidate().await.unwrap();

    for _ in 0..400 {
        if recorder.applied.lock().unwrap().is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert!(recorder.invalidated.load(Ordering::SeqCst));
    let applied = recorder.applied.lock().unwrap().clone().unwrap();
    assert_eq!(applied.files_written, 1);
    assert_eq!(fs::read(follower_dir.join("a.txt")).unwrap(), b"fresh");
}

enum TamperMode {
    CorruptFirstChunk,
    InvalidChunkCount,
}

/// Wraps the authority's messenger and corrupts the first outbound chunk or
/// the meta's chunk count, once.
struct TamperingMessenger {
    delegate: Arc<dyn Messenger>,
    mode: TamperMode,
    tampered: AtomicBool,
}

impl TamperingMessenger {
    fn new(delegate: Arc<dyn Messenger>, mode: TamperMode) -> Self {
        Self {
            delegate,
            mode,
            tampered: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Messenger for TamperingMessenger {
    async fn send_to_all(&self, channel: &str, data: &str) -> Result<()> {
        self.delegate.send_to_all(channel, data).await
    }

    async fn send_to_server(&self, channel: &str, server_name: &str, data: &str) -> Result<()> {
        match self.mode {
            TamperMode::CorruptFirstChunk
                if channel == RESPONSE_CHUNK_CHANNEL
                    && !self.tampered.swap(true, Ordering::SeqCst) =>
            {
                let mut chunk: SyncResponseChunk = serde_json::from_str(data).unwrap();
                let mut bytes = BASE64.decode(chunk.data_base64.as_bytes()).unwrap();
                if !bytes.is_empty() {
                    bytes[0] ^= 0x01;
                }
                chunk.data_base64 = BASE64.encode(&bytes);
                let corrupted = serde_json::to_string(&chunk).unwrap();
                self.delegate
                    .send_to_server(channel, server_name, &corrupted)
                    .await
            }
            TamperMode::InvalidChunkCount
                if channel == RESPONSE_META_CHANNEL
                    && !self.tampered.swap(true, Ordering::SeqCst) =>
            {
                let mut meta: SyncResponseMeta = serde_json::from_str(data).unwrap();
                meta.chunk_count = -1;
                let tampered = serde_json::to_string(&meta).unwrap();
                self.delegate
                    .send_to_server(channel, server_name, &tampered)
                    .await
            }
            _ => self.delegate.send_to_server(channel, server_name, data).await,
        }
    }

    async fn send_to_proxy(&self, channel: &str, data: &str) -> Result<()> {
        self.delegate.send_to_proxy(channel, data).await
    }

    fn register_listener(&self, channel: &str, listener: MessageListener) {
        self.delegate.register_listener(channel, listener);
    }

    fn unregister_listener(&self, channel: &str, listener: &MessageListener) {
        self.delegate.unregister_listener(channel, listener);
    }

    fn is_connected(&self) -> bool {
        self.delegate.is_connected()
    }

    fn server_name(&self) -> String {
        self.delegate.server_name()
    }

    fn proxy_server_name(&self) -> String {
        self.delegate.proxy_server_name()
    }
}
