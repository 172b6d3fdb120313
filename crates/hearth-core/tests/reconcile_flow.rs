use std::fs;
use std::path::Path;
use std::sync::Arc;

use hearth_core::{
    diff, scan_installed, ConfigStore, ExtensionEntry, ExtensionPatch, InstallMarker,
    MasterConfig, Operation, OperationKind, PortAllocator, PortScope, QueueManager, ToolConfig,
};

fn install_on_disk(extensions_dir: &Path, name: &str) {
    let dir = extensions_dir.join(name);
    fs::create_dir_all(&dir).unwrap();
    fs::write(
        dir.join("extension.toml"),
        format!("name = \"{name}\"\n[[services]]\nname = \"api\"\ncommand = \"true\"\n"),
    )
    .unwrap();
    InstallMarker::write(&dir, "local", None).unwrap();
}

#[test]
fn diff_of_matching_state_is_empty() {
    let tmp = tempfile::tempdir().unwrap();
    let ext_dir = tmp.path().join("extensions");
    let mut cfg = MasterConfig::default();
    for name in ["chef", "pantry"] {
        cfg.extensions
            .insert(name.into(), ExtensionEntry::new("local"));
        install_on_disk(&ext_dir, name);
    }
    cfg.tool_configs.insert(
        "recipes".into(),
        ToolConfig {
            enabled_in_mcp: true,
            passthrough: true,
        },
    );
    let installed = scan_installed(&ext_dir).unwrap();
    assert!(diff(&cfg, &installed, &cfg).is_empty());
}

#[test]
fn fresh_install_queues_one_install() {
    let tmp = tempfile::tempdir().unwrap();
    let store = ConfigStore::in_dir(tmp.path());
    let queue = QueueManager::in_dir(tmp.path());
    let queued = store
        .patch_extension(
            &queue,
            &[],
            "chef",
            Some(ExtensionPatch {
                source: Some("local".into()),
                ..Default::default()
            }),
        )
        .unwrap()
        .unwrap();
    assert_eq!(
        queued.operations,
        vec![Operation::Install {
            target: "chef".into(),
            source: "local".into()
        }]
    );
    // Reloading from disk yields the same queue.
    assert_eq!(queue.load().unwrap().unwrap(), queued);
}

#[test]
fn toggle_only_changes_target_config() {
    let tmp = tempfile::tempdir().unwrap();
    let ext_dir = tmp.path().join("extensions");
    install_on_disk(&ext_dir, "chef");
    let store = ConfigStore::in_dir(tmp.path());
    let queue = QueueManager::in_dir(tmp.path());
    let mut base = MasterConfig::default();
    base.extensions
        .insert("chef".into(), ExtensionEntry::new("local"));
    store.save(&base).unwrap();

    let installed = scan_installed(&ext_dir).unwrap();
    let queued = store
        .patch_extension(
            &queue,
            &installed,
            "chef",
            Some(ExtensionPatch {
                enabled: Some(false),
                ..Default::default()
            }),
        )
        .unwrap()
        .unwrap();
    assert!(queued.operations.is_empty());
    assert!(!queued.target_config.extensions["chef"].enabled);
}

#[test]
fn reverting_a_patch_deletes_the_queue() {
    let tmp = tempfile::tempdir().unwrap();
    let ext_dir = tmp.path().join("extensions");
    install_on_disk(&ext_dir, "chef");
    let store = ConfigStore::in_dir(tmp.path());
    let queue = QueueManager::in_dir(tmp.path());
    let mut base = MasterConfig::default();
    base.extensions
        .insert("chef".into(), ExtensionEntry::new("local"));
    store.save(&base).unwrap();
    let installed = scan_installed(&ext_dir).unwrap();

    let set_enabled = |enabled| {
        Some(ExtensionPatch {
            enabled: Some(enabled),
            ..Default::default()
        })
    };
    assert!(store
        .patch_extension(&queue, &installed, "chef", set_enabled(false))
        .unwrap()
        .is_some());
    assert!(queue.load().unwrap().is_some());

    let after = store
        .patch_extension(&queue, &installed, "chef", set_enabled(true))
        .unwrap();
    assert!(after.is_none());
    assert!(queue.load().unwrap().is_none());
    assert!(!queue.path().exists());
}

#[test]
fn delete_and_reinstall_in_one_batch() {
    let tmp = tempfile::tempdir().unwrap();
    let ext_dir = tmp.path().join("extensions");
    install_on_disk(&ext_dir, "chef");
    let store = ConfigStore::in_dir(tmp.path());
    let queue = QueueManager::in_dir(tmp.path());
    let mut base = MasterConfig::default();
    base.extensions
        .insert("chef".into(), ExtensionEntry::new("local"));
    store.save(&base).unwrap();

    let doc = hearth_core::QueueDocument {
        operations: vec![
            Operation::Install {
                target: "chef".into(),
                source: "local".into(),
            },
            Operation::Delete {
                target: "chef".into(),
            },
        ],
        master_config: base.clone(),
    };
    let queued = queue.save_document(&store, doc).unwrap().unwrap();
    let order: Vec<OperationKind> = hearth_core::execution_order(&queued.operations)
        .iter()
        .map(|op| op.kind())
        .collect();
    assert_eq!(order, vec![OperationKind::Delete, OperationKind::Install]);
}

#[test]
fn install_then_update_before_apply_keeps_one_operation() {
    let tmp = tempfile::tempdir().unwrap();
    let store = ConfigStore::in_dir(tmp.path());
    let queue = QueueManager::in_dir(tmp.path());
    let mut base = MasterConfig::default();
    base.extensions
        .insert("chef".into(), ExtensionEntry::new("local"));
    store.save(&base).unwrap();

    // Not on disk, so the first patch schedules an install.
    let first = store
        .patch_extension(
            &queue,
            &[],
            "chef",
            Some(ExtensionPatch {
                enabled: Some(true),
                ..Default::default()
            }),
        )
        .unwrap()
        .unwrap();
    assert_eq!(first.operations.len(), 1);
    assert_eq!(first.operations[0].kind(), OperationKind::Install);

    let second = store
        .patch_extension(
            &queue,
            &[],
            "chef",
            Some(ExtensionPatch {
                source: Some("git+https://example.invalid/chef.git".into()),
                ..Default::default()
            }),
        )
        .unwrap()
        .unwrap();
    let for_chef: Vec<_> = second
        .operations
        .iter()
        .filter(|op| op.target() == "chef")
        .collect();
    assert_eq!(for_chef.len(), 1);
    assert_eq!(for_chef[0].kind(), OperationKind::Update);
}

#[test]
fn ports_survive_reload_and_are_exclusive() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(ConfigStore::in_dir(tmp.path()));
    let alloc = PortAllocator::new(store.clone()).with_os_probe(false);
    let a = alloc
        .allocate(PortScope::ExtensionService, "chef.api")
        .unwrap();
    let b = alloc
        .allocate(PortScope::ExtensionService, "pantry.api")
        .unwrap();
    assert_ne!(a, b);

    let reopened = PortAllocator::new(Arc::new(ConfigStore::in_dir(tmp.path()))).with_os_probe(false);
    assert_eq!(
        reopened
            .allocate(PortScope::ExtensionService, "chef.api")
            .unwrap(),
        a
    );
}
