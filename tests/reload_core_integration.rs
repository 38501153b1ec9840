// End-to-end test of the core facade: a descriptor change on disk flows
// through the debounced watcher, the reload pipeline and the install thread,
// and the installer's state lands in the reactive store.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use pulse_core::error::{CoreError, CoreResult};
use pulse_core::hot_reload::{Artifact, ArtifactId, ArtifactInstaller, ArtifactProducer};
use pulse_core::state::StateStore;
use pulse_core::{Core, CoreConfig};

/// Descriptor parsed into its widget type name.
struct TypeNameProducer;

impl ArtifactProducer for TypeNameProducer {
    fn produce(&self, path: &Path) -> CoreResult<Artifact> {
        let text = std::fs::read_to_string(path).map_err(|e| CoreError::IoError {
            path: path.to_string_lossy().to_string(),
            error: e.to_string(),
        })?;
        let document: serde_json::Value =
            serde_json::from_str(&text).map_err(|e| CoreError::SerializationError {
                message: e.to_string(),
            })?;
        let type_name = document
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or("Unknown")
            .to_string();
        Ok(Artifact::new(type_name))
    }
}

/// Installs the widget type name into a state cell keyed by identity; the
/// materializer side of the reload contract, reduced to state writes.
struct StoreInstaller {
    store: Arc<StateStore>,
    installs: AtomicUsize,
    install_threads: Mutex<Vec<String>>,
}

impl StoreInstaller {
    fn cell_key(identity: ArtifactId) -> String {
        format!("widget.{}", identity.0)
    }
}

impl ArtifactInstaller for StoreInstaller {
    fn snapshot(&self, identity: ArtifactId) -> CoreResult<Artifact> {
        let current = self
            .store
            .value::<String>(&Self::cell_key(identity))
            .unwrap_or_default();
        Ok(Artifact::new(current))
    }

    fn replace(&self, identity: ArtifactId, new_artifact: Artifact) -> CoreResult<()> {
        let type_name = new_artifact
            .downcast::<String>()
            .ok_or(CoreError::Internal {
                message: "foreign artifact".to_string(),
            })?;
        let thread = std::thread::current()
            .name()
            .unwrap_or("unnamed")
            .to_string();
        self.install_threads.lock().push(thread);
        self.store
            .write(&Self::cell_key(identity), (*type_name).clone())?;
        self.installs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn test_descriptor_change_reaches_store_through_install_thread() {
    init_logging();
    let core = Core::new(CoreConfig {
        hot_reload: pulse_core::hot_reload::HotReloadConfig {
            reload_delay_ms: 0,
            watcher: pulse_core::hot_reload::WatcherConfig {
                debounce_ms: 50,
                ..Default::default()
            },
            ..Default::default()
        },
        ..Default::default()
    })
    .expect("core");

    let store = Arc::new(core.store().clone());
    let identity = ArtifactId(1);
    store
        .create(&StoreInstaller::cell_key(identity), String::new())
        .expect("create cell");

    let installer = Arc::new(StoreInstaller {
        store: store.clone(),
        installs: AtomicUsize::new(0),
        install_threads: Mutex::new(Vec::new()),
    });
    let manager = core
        .attach_hot_reload(Arc::new(TypeNameProducer), installer.clone())
        .expect("hot reload");

    let dir = tempfile::tempdir().expect("tempdir");
    let file = dir.path().join("ui.json");
    std::fs::write(&file, r#"{"type":"Button"}"#).expect("write");
    manager.register(&file, identity).expect("register");

    let changed = Arc::new(AtomicUsize::new(0));
    let cell = store
        .get::<String>(&StoreInstaller::cell_key(identity))
        .expect("cell");
    let c = changed.clone();
    let _sub = cell.subscribe(move |_| {
        c.fetch_add(1, Ordering::SeqCst);
    });

    std::fs::write(&file, r#"{"type":"Slider"}"#).expect("write");
    std::thread::sleep(Duration::from_millis(800));

    assert_eq!(installer.installs.load(Ordering::SeqCst), 1);
    assert_eq!(
        store
            .value::<String>(&StoreInstaller::cell_key(identity))
            .expect("cell"),
        "Slider"
    );
    assert_eq!(changed.load(Ordering::SeqCst), 1);

    // Every install ran on the executor's dedicated install thread.
    let threads = installer.install_threads.lock();
    assert!(!threads.is_empty());
    assert!(threads.iter().all(|name| name.contains("install")));

    core.shutdown();
}

#[test]
fn test_manual_reload_all_handles_multiple_registrations() {
    init_logging();
    let core = Core::new(CoreConfig::default()).expect("core");
    let store = Arc::new(core.store().clone());

    let ids = [ArtifactId(10), ArtifactId(11)];
    for id in ids {
        store
            .create(&StoreInstaller::cell_key(id), String::new())
            .expect("create");
    }
    let installer = Arc::new(StoreInstaller {
        store: store.clone(),
        installs: AtomicUsize::new(0),
        install_threads: Mutex::new(Vec::new()),
    });
    let manager = core
        .attach_hot_reload(Arc::new(TypeNameProducer), installer.clone())
        .expect("hot reload");

    let dir = tempfile::tempdir().expect("tempdir");
    let files = [dir.path().join("a.json"), dir.path().join("b.json")];
    std::fs::write(&files[0], r#"{"type":"Label"}"#).expect("write");
    std::fs::write(&files[1], r#"{"type":"Panel"}"#).expect("write");
    for (file, id) in files.iter().zip(ids) {
        manager.register(file, id).expect("register");
    }

    manager.reload_all();

    assert_eq!(installer.installs.load(Ordering::SeqCst), 2);
    assert_eq!(
        store
            .value::<String>(&StoreInstaller::cell_key(ids[0]))
            .expect("a"),
        "Label"
    );
    assert_eq!(
        store
            .value::<String>(&StoreInstaller::cell_key(ids[1]))
            .expect("b"),
        "Panel"
    );

    core.shutdown();
}
