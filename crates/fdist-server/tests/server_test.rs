//! File server, notifier and re-download over real TCP connections.

use std::sync::Arc;
use std::time::Duration;

use fdist_cas::{ContentStore, FileReference};
use fdist_config::testing::TestEnvironment;
use fdist_ipc::client::FileClient;
use fdist_ipc::IpcError;
use fdist_registry::{ActiveApplications, ApplicationIndex, RegistrySnapshot};
use fdist_server::maintenance::PackageRedownloader;
use fdist_server::{DistributionNotifier, DownloadListener, FileServer};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

const TIMEOUT: Duration = Duration::from_secs(5);

struct Running {
    port: u16,
    stop: Option<oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<()>,
}

impl Running {
    async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.task.await.unwrap();
    }
}

async fn start(server: FileServer) -> Running {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        Arc::new(server)
            .serve(listener, async {
                let _ = stop_rx.await;
            })
            .await
            .unwrap();
    });
    Running {
        port,
        stop: Some(stop_tx),
        task,
    }
}

#[derive(Default)]
struct Recorder(Mutex<Vec<FileReference>>);

impl DownloadListener for Recorder {
    fn on_start_download(&self, references: Vec<FileReference>) {
        self.0.lock().extend(references);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fetch_file_and_directory() {
    let env = TestEnvironment::new().unwrap();
    let file = env.create_file("b.txt", b"hello").unwrap();
    env.create_file("bundle/conf/a.cfg", b"a=1").unwrap();
    env.create_file("bundle/readme", b"read me").unwrap();

    let store = ContentStore::new(&env.store_root).unwrap();
    let file_ref = store.add_file(&file).unwrap();
    let dir_ref = store.add_file(env.app_dir.join("bundle")).unwrap();

    let running = start(FileServer::new(store, 2)).await;
    let mut client = FileClient::connect("127.0.0.1", running.port, TIMEOUT).await.unwrap();

    assert!(client.has_file(&file_ref).await.unwrap());
    let data = client.receive_file(&file_ref).await.unwrap();
    assert_eq!(data.filename, "b.txt");
    assert_eq!(data.payload, b"hello");

    // Install the directory into a second store: same reference, same content
    let data = client.receive_file(&dir_ref).await.unwrap();
    let other = TestEnvironment::new().unwrap();
    let mirror = ContentStore::new(&other.store_root).unwrap();
    let installed = mirror.install(&data).unwrap();
    assert!(installed.ends_with("bundle"));
    assert_eq!(std::fs::read(installed.join("conf/a.cfg")).unwrap(), b"a=1");
    assert!(mirror.has_file(&dir_ref));

    running.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_missing_file_reports_not_found() {
    let env = TestEnvironment::new().unwrap();
    let store = ContentStore::new(&env.store_root).unwrap();
    let running = start(FileServer::new(store, 1)).await;

    let missing = FileReference::parse("deadbeef").unwrap();
    let mut client = FileClient::connect("127.0.0.1", running.port, TIMEOUT).await.unwrap();
    assert!(!client.has_file(&missing).await.unwrap());
    assert!(matches!(
        client.receive_file(&missing).await,
        Err(IpcError::NotFound { .. })
    ));

    running.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_file_over_frame_limit_reported_in_reply() {
    let env = TestEnvironment::new().unwrap();
    let store = ContentStore::new(&env.store_root).unwrap();
    let big = store.add_blob(&vec![9u8; 4096], "big.bin").unwrap();
    let small = store.add_blob(b"tiny", "tiny.txt").unwrap();
    let running = start(FileServer::new(store, 1).with_max_frame_bytes(1024)).await;

    let mut client = FileClient::connect("127.0.0.1", running.port, TIMEOUT)
        .await
        .unwrap()
        .with_max_frame_bytes(1024);
    match client.receive_file(&big).await {
        Err(IpcError::Remote(msg)) => assert!(msg.contains("too large"), "{}", msg),
        other => panic!("unexpected {:?}", other),
    }
    // Connection stays in sync for the next request
    assert!(client.is_usable());
    assert_eq!(client.receive_file(&small).await.unwrap().payload, b"tiny");
    client.ping().await.unwrap();

    running.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_fetches_with_one_worker() {
    let env = TestEnvironment::new().unwrap();
    let store = ContentStore::new(&env.store_root).unwrap();
    let references: Vec<_> = (0..8)
        .map(|i| store.add_blob(format!("blob {}", i).as_bytes(), &format!("f{}", i)).unwrap())
        .collect();
    let running = start(FileServer::new(store, 1)).await;
    let port = running.port;

    let fetches: Vec<_> = references
        .iter()
        .cloned()
        .enumerate()
        .map(|(i, reference)| {
            tokio::spawn(async move {
                let mut client = FileClient::connect("127.0.0.1", port, TIMEOUT).await.unwrap();
                let data = client.receive_file(&reference).await.unwrap();
                assert_eq!(data.payload, format!("blob {}", i).into_bytes());
            })
        })
        .collect();
    for fetch in fetches {
        fetch.await.unwrap();
    }

    running.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_notifier_delivers_start_download() {
    let env = TestEnvironment::new().unwrap();
    let store = ContentStore::new(&env.store_root).unwrap();
    let recorder = Arc::new(Recorder::default());
    let running = start(FileServer::new(store, 1).with_download_listener(recorder.clone())).await;

    let references = vec![
        FileReference::parse("1a").unwrap(),
        FileReference::parse("2b").unwrap(),
    ];
    let notifier = DistributionNotifier::new(TIMEOUT, tokio::runtime::Handle::current());
    notifier
        .start_download("127.0.0.1", running.port, references.clone())
        .await
        .unwrap();
    assert_eq!(*recorder.0.lock(), references);

    running.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_notifier_swallows_unreachable_hosts() {
    let dead_port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let notifier = DistributionNotifier::new(Duration::from_millis(500), tokio::runtime::Handle::current());
    let handles = notifier.notify_all(
        &[("127.0.0.1".to_string(), dead_port), ("127.0.0.1".to_string(), dead_port)],
        &[FileReference::parse("1a").unwrap()],
    );
    for handle in handles {
        // Completes without panicking; the failure is only logged
        handle.await.unwrap();
    }

    assert!(notifier
        .notify("127.0.0.1", dead_port, Vec::new())
        .await
        .is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_redownload_missing_package_from_peer() {
    // Peer replica holding the package
    let peer_env = TestEnvironment::new().unwrap();
    let peer_store = ContentStore::new(&peer_env.store_root).unwrap();
    let package = peer_store.add_blob(b"application package", "app.zip").unwrap();
    let running = start(FileServer::new(peer_store, 1)).await;

    // Local replica knows the application but lacks its package
    let env = TestEnvironment::new().unwrap();
    let snapshot = env.snapshot_path("tenant.app");
    RegistrySnapshot::new("cfg1", Vec::new()).write(&snapshot).unwrap();
    let mut index = ApplicationIndex::new();
    index.register("tenant.app", &snapshot, Some(package.clone()));
    index.save(&env.state_dir).unwrap();

    let store = ContentStore::new(&env.store_root).unwrap();
    let redownloader = PackageRedownloader::new(
        store.clone(),
        ActiveApplications::new(&env.state_dir, TIMEOUT),
        vec![("127.0.0.1".to_string(), running.port)],
        TIMEOUT,
        tokio::runtime::Handle::current(),
    );

    // block_on must not run on a runtime worker thread
    let report = tokio::task::spawn_blocking(move || redownloader.redownload_missing().unwrap())
        .await
        .unwrap();
    assert_eq!(report.missing, 1);
    assert_eq!(report.restored, vec![package.clone()]);
    assert_eq!(
        std::fs::read(store.get_file(&package).unwrap()).unwrap(),
        b"application package"
    );

    running.shutdown().await;
}
