use super::*;
use crate::crypto::codec::encode_bytes;
use crate::crypto::{decode, derive_credentials, encode, SyncCredentials};
use crate::wallet::{LocalWallet, Wallet, WalletIdentity, LABELS_KEY};
use crate::LabelSyncError;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

const FINGERPRINT: &[u8] = b"xpub6CUGRUonZSQ4TWtTMmzXdrXDtypWKiKrhko4egpiMZbpiaQL2jkwSB1icqYh2cfDfVxdx4df189oLKnC5fSwqPfgyP3hooxujYzAu3fDVmz";

type Responder = Box<dyn Fn(&HttpRequest) -> HttpResponse + Send + Sync>;

/// Scripted label server. Optionally holds POSTs until released.
struct FakeServer {
    responder: Responder,
    requests: Mutex<Vec<HttpRequest>>,
    post_gate: Option<Semaphore>,
}

impl FakeServer {
    fn new(responder: impl Fn(&HttpRequest) -> HttpResponse + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            responder: Box::new(responder),
            requests: Mutex::new(Vec::new()),
            post_gate: None,
        })
    }

    fn holding_posts(
        responder: impl Fn(&HttpRequest) -> HttpResponse + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            responder: Box::new(responder),
            requests: Mutex::new(Vec::new()),
            post_gate: Some(Semaphore::new(0)),
        })
    }

    fn release_posts(&self, n: usize) {
        if let Some(gate) = &self.post_gate {
            gate.add_permits(n);
        }
    }

    fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn posts(&self) -> Vec<HttpRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == Method::Post)
            .collect()
    }

    async fn wait_for_posts(&self, n: usize) {
        for _ in 0..500 {
            if self.posts().len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} POST requests, saw {}", n, self.posts().len());
    }
}

#[async_trait]
impl Transport for FakeServer {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.requests.lock().unwrap().push(request.clone());
        if request.method == Method::Post {
            if let Some(gate) = &self.post_gate {
                gate.acquire()
                    .await
                    .map_err(|e| TransportError::Other(e.to_string()))?
                    .forget();
            }
        }
        Ok((self.responder)(&request))
    }
}

fn ok(body: Value) -> HttpResponse {
    HttpResponse {
        status: 200,
        body: body.to_string(),
    }
}

fn nothing_new(_: &HttpRequest) -> HttpResponse {
    ok(json!({"labels": null, "nonce": 0}))
}

/// Everything sent to the observer.
#[derive(Default)]
struct Recorder {
    pulled: Mutex<Vec<WalletIdentity>>,
    not_synced: Mutex<Vec<WalletIdentity>>,
    failures: Mutex<Vec<String>>,
}

impl SyncObserver for Recorder {
    fn on_pulled(&self, wallet: &Arc<dyn Wallet>, _outcome: &PullOutcome) {
        self.pulled.lock().unwrap().push(wallet.identity());
    }

    fn on_wallet_not_synced(&self, wallet: &Arc<dyn Wallet>) {
        self.not_synced.lock().unwrap().push(wallet.identity());
    }

    fn on_request_failure(&self, _wallet: &Arc<dyn Wallet>, error: &LabelSyncError) {
        self.failures.lock().unwrap().push(error.to_string());
    }
}

fn creds() -> SyncCredentials {
    derive_credentials(FINGERPRINT).unwrap()
}

fn wire(key: &str, value: &str) -> Value {
    let c = creds();
    json!({"externalId": encode(&c, key), "encryptedLabel": encode(&c, value)})
}

fn setup(server: Arc<FakeServer>) -> (SessionRegistry, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let config = LabelSyncConfig {
        server_url: "https://labels.test".to_string(),
        ..LabelSyncConfig::default()
    };
    let client = SyncClient::with_transport(&config, server);
    let registry = SessionRegistry::new(client, recorder.clone()).unwrap();
    (registry, recorder)
}

fn new_wallet() -> Arc<LocalWallet> {
    Arc::new(LocalWallet::in_memory("main", Some(FINGERPRINT.to_vec())))
}

/// Start `wallet` and let its startup pull finish.
async fn start(registry: &SessionRegistry, wallet: &Arc<LocalWallet>) -> WalletIdentity {
    assert!(registry.start_wallet(wallet.clone()));
    registry.wait_idle().await;
    wallet.identity()
}

fn nonce_of(wallet: &LocalWallet) -> u64 {
    get_nonce(wallet).unwrap()
}

#[tokio::test]
async fn set_label_posts_current_nonce_and_advances_before_response() {
    let server = FakeServer::holding_posts(nothing_new);
    let (registry, _) = setup(server.clone());
    let wallet = new_wallet();
    let id = start(&registry, &wallet).await;
    assert_eq!(nonce_of(&wallet), 1);

    assert!(registry.set_label(id, "k1", "v1"));
    // The upload is still held by the server.
    assert_eq!(nonce_of(&wallet), 2);

    server.wait_for_posts(1).await;
    let post = &server.posts()[0];
    assert_eq!(post.url, "https://labels.test/label");
    let body: Value = serde_json::from_slice(post.body.as_ref().unwrap()).unwrap();
    assert_eq!(body["walletNonce"], json!(1));
    assert_eq!(body["walletId"], json!(creds().wallet_id()));
    assert_eq!(decode(&creds(), body["externalId"].as_str().unwrap()).unwrap(), "k1");
    assert_eq!(decode(&creds(), body["encryptedLabel"].as_str().unwrap()).unwrap(), "v1");

    server.release_posts(1);
    registry.shutdown().await.unwrap();
}

#[tokio::test]
async fn set_label_ignores_empty_key_and_inactive_wallet() {
    let server = FakeServer::new(nothing_new);
    let (registry, _) = setup(server.clone());
    let wallet = new_wallet();
    let id = start(&registry, &wallet).await;

    assert!(!registry.set_label(id, "", "nothing"));
    assert!(registry.stop_wallet(id));
    assert!(!registry.set_label(id, "k", "v"));

    registry.wait_idle().await;
    assert!(server.posts().is_empty());
    assert_eq!(nonce_of(&wallet), 1);
}

#[tokio::test]
async fn pull_merges_new_labels_and_advances_nonce() {
    let server = FakeServer::new(|_| ok(json!({"labels": [wire("k1", "v1")], "nonce": 5})));
    let (registry, recorder) = setup(server.clone());
    let wallet = new_wallet();
    assert!(registry.start_wallet(wallet.clone()));
    let id = wallet.identity();

    let outcome = registry.pull(id, false).await.unwrap();
    registry.wait_idle().await;

    assert!(matches!(outcome, PullOutcome::Merged { received: 1, dropped: 0, .. }));
    assert_eq!(wallet.labels().unwrap()["k1"], "v1");
    assert_eq!(nonce_of(&wallet), 6);
    assert!(recorder.pulled.lock().unwrap().contains(&id));

    let state = wallet.lock_state().unwrap();
    assert_eq!(state.storage.get(LABELS_KEY).unwrap(), Some(json!({"k1": "v1"})));
}

#[tokio::test]
async fn pull_requests_one_before_current_nonce() {
    let server = FakeServer::new(nothing_new);
    let (registry, _) = setup(server.clone());
    let wallet = new_wallet();
    set_nonce(&*wallet, 8).unwrap();
    let id = start(&registry, &wallet).await;

    registry.pull(id, false).await.unwrap();
    registry.pull(id, true).await.unwrap();

    let wallet_id = creds().wallet_id().to_string();
    let urls: Vec<String> = server.requests().into_iter().map(|r| r.url).collect();
    assert!(urls.contains(&format!("https://labels.test/labels/since/7/for/{}", wallet_id)));
    assert!(urls.contains(&format!("https://labels.test/labels/since/1/for/{}", wallet_id)));
}

#[tokio::test]
async fn normal_pull_keeps_local_labels_forced_pull_overwrites() {
    let server = FakeServer::new(|_| {
        ok(json!({"labels": [wire("mine", "remote"), wire("blank", "filled")], "nonce": 2}))
    });
    let (registry, _) = setup(server);
    let wallet = new_wallet();
    {
        let mut state = wallet.lock_state().unwrap();
        state.labels.insert("mine".to_string(), "local".to_string());
        state.labels.insert("blank".to_string(), String::new());
    }
    let id = start(&registry, &wallet).await;

    registry.pull(id, false).await.unwrap();
    let labels = wallet.labels().unwrap();
    assert_eq!(labels["mine"], "local");
    assert_eq!(labels["blank"], "filled");

    registry.pull(id, true).await.unwrap();
    assert_eq!(wallet.labels().unwrap()["mine"], "remote");
}

#[tokio::test]
async fn null_labels_leave_state_untouched() {
    let server = FakeServer::new(|_| ok(json!({"labels": null, "nonce": 40})));
    let (registry, recorder) = setup(server);
    let wallet = new_wallet();
    {
        let mut state = wallet.lock_state().unwrap();
        state.labels.insert("addr".to_string(), "savings".to_string());
    }
    set_nonce(&*wallet, 3).unwrap();
    let id = start(&registry, &wallet).await;

    let outcome = registry.pull(id, false).await.unwrap();
    assert_eq!(outcome, PullOutcome::Unchanged);
    assert_eq!(nonce_of(&wallet), 3);
    assert_eq!(wallet.labels().unwrap().len(), 1);
    assert!(recorder.pulled.lock().unwrap().is_empty());
}

#[tokio::test]
async fn pull_never_moves_nonce_backwards() {
    let server = FakeServer::new(|_| ok(json!({"labels": [wire("k", "v")], "nonce": 2})));
    let (registry, _) = setup(server);
    let wallet = new_wallet();
    set_nonce(&*wallet, 10).unwrap();
    let id = start(&registry, &wallet).await;

    registry.pull(id, true).await.unwrap();
    assert_eq!(nonce_of(&wallet), 10);
}

#[tokio::test]
async fn undecodable_labels_are_dropped_individually() {
    let server = FakeServer::new(|_| {
        let c = creds();
        ok(json!({
            "labels": [
                wire("good", "label"),
                {"externalId": encode_bytes(&c, &[0xff, 0xfe]), "encryptedLabel": encode(&c, "x")},
                {"externalId": "%%% not base64", "encryptedLabel": encode(&c, "y")},
                {"externalId": encode(&c, "short"), "encryptedLabel": "AAAA"},
            ],
            "nonce": 9
        }))
    });
    let (registry, _) = setup(server);
    let wallet = new_wallet();
    let id = start(&registry, &wallet).await;

    let outcome = registry.pull(id, true).await.unwrap();
    assert_eq!(
        outcome,
        PullOutcome::Merged {
            received: 4,
            applied: 1,
            dropped: 3,
            nonce: 10
        }
    );
    let labels = wallet.labels().unwrap();
    assert_eq!(labels.len(), 1);
    assert_eq!(labels["good"], "label");
}

#[tokio::test]
async fn malformed_entries_are_dropped_without_losing_the_rest() {
    let server = FakeServer::new(|_| {
        ok(json!({
            "labels": [
                wire("good", "label"),
                {"externalId": 5, "encryptedLabel": "x"},
                {"encryptedLabel": "y"},
                "not an object",
            ],
            "nonce": 9
        }))
    });
    let (registry, _) = setup(server);
    let wallet = new_wallet();
    let id = start(&registry, &wallet).await;

    let outcome = registry.pull(id, true).await.unwrap();
    assert_eq!(
        outcome,
        PullOutcome::Merged {
            received: 4,
            applied: 1,
            dropped: 3,
            nonce: 10
        }
    );
    assert_eq!(wallet.labels().unwrap()["good"], "label");
    assert_eq!(nonce_of(&wallet), 10);
}

#[tokio::test]
async fn null_labels_without_nonce_is_unchanged() {
    let server = FakeServer::new(|_| ok(json!({"labels": null})));
    let (registry, _) = setup(server);
    let wallet = new_wallet();
    let id = start(&registry, &wallet).await;

    assert_eq!(registry.pull(id, true).await.unwrap(), PullOutcome::Unchanged);
    assert_eq!(registry.pull(id, false).await.unwrap(), PullOutcome::Unchanged);
    assert_eq!(nonce_of(&wallet), 1);
}

#[tokio::test]
async fn labels_without_nonce_are_rejected() {
    let server = FakeServer::new(|_| ok(json!({"labels": [wire("k", "v")]})));
    let (registry, _) = setup(server);
    let wallet = new_wallet();
    let id = start(&registry, &wallet).await;

    let err = registry.pull(id, true).await.unwrap_err();
    assert!(matches!(err, LabelSyncError::InvalidResponse(_)));
    assert!(wallet.labels().unwrap().is_empty());
    assert_eq!(nonce_of(&wallet), 1);
}

#[tokio::test]
async fn nonce_conflict_goes_to_not_synced_hook() {
    let server = FakeServer::new(|req| match req.method {
        Method::Get => ok(json!({"labels": null, "nonce": 0})),
        Method::Post => HttpResponse {
            status: 400,
            body: "serverNonce is larger then walletNonde".to_string(),
        },
    });
    let (registry, recorder) = setup(server.clone());
    let wallet = new_wallet();
    let id = start(&registry, &wallet).await;
    set_nonce(&*wallet, 4).unwrap();

    assert!(registry.push(id));
    registry.wait_idle().await;

    assert_eq!(server.posts().len(), 1);
    assert_eq!(recorder.not_synced.lock().unwrap().as_slice(), &[id]);
    assert!(recorder.failures.lock().unwrap().is_empty());
    assert_eq!(nonce_of(&wallet), 4);
}

#[tokio::test]
async fn nonce_conflict_on_pull_is_routed_and_leaves_nonce() {
    let server = FakeServer::new(|_| HttpResponse {
        status: 400,
        body: "error: serverNonce is larger then walletNonce".to_string(),
    });
    let (registry, recorder) = setup(server);
    let wallet = new_wallet();
    let id = start(&registry, &wallet).await;

    let err = registry.pull(id, true).await.unwrap_err();
    assert!(matches!(err, LabelSyncError::NonceConflict));
    assert_eq!(nonce_of(&wallet), 1);
    // startup pull and the forced pull
    assert_eq!(recorder.not_synced.lock().unwrap().len(), 2);
    assert!(recorder.failures.lock().unwrap().is_empty());
}

#[tokio::test]
async fn failed_upload_goes_to_failure_hook() {
    let server = FakeServer::new(|req| match req.method {
        Method::Get => ok(json!({"labels": null, "nonce": 0})),
        Method::Post => HttpResponse {
            status: 503,
            body: "maintenance".to_string(),
        },
    });
    let (registry, recorder) = setup(server);
    let wallet = new_wallet();
    let id = start(&registry, &wallet).await;

    assert!(registry.set_label(id, "k", "v"));
    registry.wait_idle().await;

    let failures = recorder.failures.lock().unwrap();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].contains("503"));
    assert!(recorder.not_synced.lock().unwrap().is_empty());
    // The optimistic bump stays.
    assert_eq!(nonce_of(&wallet), 2);
}

#[tokio::test]
async fn pull_failures_raise_only_when_forced() {
    let server = FakeServer::new(|_| HttpResponse {
        status: 500,
        body: "down".to_string(),
    });
    let (registry, recorder) = setup(server);
    let wallet = new_wallet();
    let id = start(&registry, &wallet).await;

    assert_eq!(registry.pull(id, false).await.unwrap(), PullOutcome::Deferred);
    assert!(matches!(
        registry.pull(id, true).await.unwrap_err(),
        LabelSyncError::RemoteStatus { status: 500, .. }
    ));
    assert!(recorder.failures.lock().unwrap().is_empty());
}

#[tokio::test]
async fn forced_background_pull_failure_goes_to_failure_hook() {
    let server = FakeServer::new(|_| HttpResponse {
        status: 503,
        body: "unavailable".to_string(),
    });
    let (registry, recorder) = setup(server);
    let wallet = new_wallet();
    let id = start(&registry, &wallet).await;
    assert!(recorder.failures.lock().unwrap().is_empty());

    assert!(registry.spawn_pull(id, false));
    registry.wait_idle().await;
    assert!(recorder.failures.lock().unwrap().is_empty());

    assert!(registry.spawn_pull(id, true));
    registry.wait_idle().await;
    let failures = recorder.failures.lock().unwrap();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].contains("503"));
}

#[tokio::test]
async fn forced_background_pull_conflict_is_routed_once() {
    let server = FakeServer::new(|_| HttpResponse {
        status: 400,
        body: "serverNonce is larger then walletNonce".to_string(),
    });
    let (registry, recorder) = setup(server);
    let wallet = new_wallet();
    let id = start(&registry, &wallet).await;
    recorder.not_synced.lock().unwrap().clear();

    assert!(registry.spawn_pull(id, true));
    registry.wait_idle().await;
    assert_eq!(recorder.not_synced.lock().unwrap().len(), 1);
    assert!(recorder.failures.lock().unwrap().is_empty());
}

#[tokio::test]
async fn dropping_registry_handle_keeps_uploads_running() {
    let server = FakeServer::holding_posts(|req| match req.method {
        Method::Get => nothing_new(req),
        Method::Post => HttpResponse {
            status: 503,
            body: "unavailable".to_string(),
        },
    });
    let (registry, recorder) = setup(server.clone());
    let wallet = new_wallet();
    let id = start(&registry, &wallet).await;

    assert!(registry.set_label(id, "k", "v"));
    server.wait_for_posts(1).await;
    drop(registry);

    server.release_posts(1);
    for _ in 0..500 {
        if !recorder.failures.lock().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(recorder.failures.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn start_and_stop_lifecycle() {
    let server = FakeServer::new(nothing_new);
    let (registry, _) = setup(server.clone());
    let wallet = new_wallet();

    assert!(registry.start_wallet(wallet.clone()));
    assert!(!registry.start_wallet(wallet.clone()));
    assert!(registry.is_active(wallet.identity()));

    let session = registry
        .find_session_by_wallet_id(creds().wallet_id())
        .unwrap();
    assert_eq!(session.identity(), wallet.identity());

    assert!(registry.stop_wallet(wallet.identity()));
    assert!(!registry.stop_wallet(wallet.identity()));
    assert!(registry.find_session_by_wallet_id(creds().wallet_id()).is_none());
    assert_eq!(
        registry.pull(wallet.identity(), true).await.unwrap(),
        PullOutcome::Inactive
    );
    registry.wait_idle().await;
}

#[tokio::test]
async fn wallet_without_fingerprint_is_not_started() {
    let server = FakeServer::new(nothing_new);
    let (registry, _) = setup(server.clone());
    let watch_only = Arc::new(LocalWallet::in_memory("watch", None));

    assert!(!registry.start_wallet(watch_only.clone()));
    assert!(!registry.is_active(watch_only.identity()));
    assert_eq!(registry.pending_tasks(), 0);
    assert!(server.requests().is_empty());
}

#[tokio::test]
async fn failure_after_stop_is_dropped() {
    let server = FakeServer::holding_posts(|req| match req.method {
        Method::Get => ok(json!({"labels": null, "nonce": 0})),
        Method::Post => HttpResponse {
            status: 500,
            body: "boom".to_string(),
        },
    });
    let (registry, recorder) = setup(server.clone());
    let wallet = new_wallet();
    let id = start(&registry, &wallet).await;

    assert!(registry.set_label(id, "k", "v"));
    server.wait_for_posts(1).await;
    registry.stop_wallet(id);
    server.release_posts(1);
    registry.wait_idle().await;

    assert!(recorder.failures.lock().unwrap().is_empty());
}

#[tokio::test]
async fn status_reports_nonce_and_labels() {
    let server = FakeServer::new(|_| ok(json!({"labels": [wire("a", "b")], "nonce": 1})));
    let (registry, _) = setup(server);
    let wallet = new_wallet();
    let id = start(&registry, &wallet).await;

    let status = registry.status(id).unwrap().unwrap();
    assert_eq!(status.wallet_id, creds().wallet_id());
    assert_eq!(status.nonce, 2);
    assert_eq!(status.label_count, 1);
    assert!(status.last_pull_at.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_joins_in_flight_uploads() {
    let server = FakeServer::holding_posts(nothing_new);
    let (registry, _) = setup(server.clone());
    let wallet = new_wallet();
    let id = start(&registry, &wallet).await;

    for i in 0..3 {
        assert!(registry.set_label(id, &format!("k{}", i), "v"));
    }
    server.wait_for_posts(3).await;
    assert_eq!(nonce_of(&wallet), 4);

    let closing = {
        let registry = registry.clone();
        tokio::spawn(async move { registry.shutdown().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!closing.is_finished());
    assert!(!registry.is_active(id));

    server.release_posts(3);
    let report = closing.await.unwrap().unwrap();
    assert_eq!(
        report,
        ShutdownReport {
            wallets_stopped: 1,
            tasks_joined: 3
        }
    );
    assert_eq!(registry.pending_tasks(), 0);
}

#[tokio::test]
async fn registry_can_be_driven_from_a_plain_thread() {
    let server = FakeServer::new(nothing_new);
    let (registry, _) = setup(server.clone());
    let wallet = new_wallet();
    let id = start(&registry, &wallet).await;

    let from_ui = registry.clone();
    std::thread::spawn(move || from_ui.set_label(id, "k", "v"))
        .join()
        .unwrap();

    registry.wait_idle().await;
    assert_eq!(server.posts().len(), 1);
    assert_eq!(nonce_of(&wallet), 2);
}
