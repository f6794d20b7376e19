//! Integration tests for harvest, ledger persistence, restoration and
//! modification detection on real directory trees.
//!
//! These run without root: ownership is always the test process's own.

mod helpers;

use helpers::{assert_mode, create_mock_tree, current_ids, owned_ledgers, write_file, TestEnv};
use repackfs::config::Config;
use repackfs::ledger::{self, ChecksumBaseline, ImageMetadata, Ledgers, INFO_DIR};
use repackfs::repack::{restore_attributes, strip_sidecar, RepackContext};
use repackfs::selinux;
use repackfs::unpack::Harvester;
use serial_test::serial;
use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::MetadataExt;

// =============================================================================
// Harvest and ledger round trip
// =============================================================================

#[test]
fn test_harvest_save_load_is_lossless() {
    let env = TestEnv::new();
    create_mock_tree(&env.tree);

    let (ledgers, stats) = Harvester::new(Vec::new()).harvest(&env.tree).unwrap();
    assert_eq!(stats.symlinks, 1);
    ledgers.save(&env.sidecar()).unwrap();

    let loaded = Ledgers::load(&env.sidecar()).unwrap();
    assert_eq!(loaded.attributes, ledgers.attributes);
    assert_eq!(loaded.symlinks, ledgers.symlinks);
    assert_eq!(
        loaded.attributes.iter().next().map(|(k, _)| k),
        Some("/")
    );
}

#[test]
fn test_restore_then_harvest_reproduces_ledger() {
    let env = TestEnv::new();
    create_mock_tree(&env.tree);
    let (original, _) = Harvester::new(Vec::new()).harvest(&env.tree).unwrap();

    // Scramble modes, restore, harvest again
    for rel in ["bin/sh", "etc/init/boot.rc", "build.prop"] {
        write_file(&env.tree, rel, "changed", 0o666);
    }
    restore_attributes(&env.tree, &original).unwrap();
    let (again, _) = Harvester::new(Vec::new()).harvest(&env.tree).unwrap();

    for (path, record) in original.attributes.iter() {
        assert_eq!(again.attributes.get(path), Some(record), "{}", path);
    }
}

// =============================================================================
// Restoration
// =============================================================================

#[test]
fn test_restore_applies_exact_and_inherited_modes() {
    let env = TestEnv::new();
    let tree = &env.tree;
    fs::create_dir_all(tree.join("lib/modules")).unwrap();
    write_file(tree, "lib/libc.so", "elf", 0o600);
    write_file(tree, "lib/newmod.ko", "new", 0o700);
    write_file(tree, "top.txt", "new", 0o777);
    fs::create_dir_all(tree.join("lib/firmware")).unwrap();

    let ledgers = owned_ledgers(&[
        ("/", 0o755),
        ("/lib", 0o750),
        ("/lib/libc.so", 0o644),
        ("/lib/modules", 0o755),
    ]);

    let stats = restore_attributes(tree, &ledgers).unwrap();
    assert_eq!(stats.exact, 4);
    assert_eq!(stats.inherited, 3);

    assert_mode(&tree.join("lib/libc.so"), 0o644);
    assert_mode(&tree.join("lib/newmod.ko"), 0o644);
    assert_mode(&tree.join("top.txt"), 0o644);
    assert_mode(&tree.join("lib/firmware"), 0o750);
    assert_mode(tree, 0o755);

    let (uid, gid) = current_ids();
    let meta = fs::metadata(tree.join("lib/newmod.ko")).unwrap();
    assert_eq!((meta.uid(), meta.gid()), (uid, gid));
}

#[test]
fn test_restore_preserves_setid_bits() {
    let env = TestEnv::new();
    write_file(&env.tree, "bin/run-as", "x", 0o755);
    let ledgers = owned_ledgers(&[("/", 0o755), ("/bin", 0o755), ("/bin/run-as", 0o2750)]);

    restore_attributes(&env.tree, &ledgers).unwrap();
    assert_mode(&env.tree.join("bin/run-as"), 0o2750);
}

#[test]
fn test_restore_skips_sidecar_and_leaves_links_alone() {
    let env = TestEnv::new();
    create_mock_tree(&env.tree);
    let ledgers = owned_ledgers(&[("/", 0o755)]);
    ledgers.save(&env.sidecar()).unwrap();
    let sidecar_file = env.tree.join(INFO_DIR).join("attributes.json");
    fs::set_permissions(&sidecar_file, std::os::unix::fs::PermissionsExt::from_mode(0o600))
        .unwrap();

    restore_attributes(&env.tree, &ledgers).unwrap();
    assert_mode(&sidecar_file, 0o600);
    assert_eq!(
        fs::read_link(env.tree.join("bin/toolbox")).unwrap().to_str(),
        Some("/system/bin/sh")
    );
}

#[test]
fn test_label_failures_are_soft() {
    let env = TestEnv::new();
    write_file(&env.tree, "etc/hosts", "x", 0o644);
    let mut ledgers = owned_ledgers(&[("/", 0o755)]);
    ledgers.labels.insert("/", "u:object_r:system_file:s0");

    // Whether or not the host accepts the xattr, restoration succeeds
    let stats = restore_attributes(&env.tree, &ledgers).unwrap();
    assert_eq!(stats.labels_applied + stats.label_failures, stats.total());
}

#[test]
fn test_unlabeled_objects_lose_host_labels() {
    let env = TestEnv::new();
    write_file(&env.tree, "etc/hosts", "x", 0o644);
    let file = env.tree.join("etc/hosts");
    // Setting a security.* attribute needs root on hosts without a policy
    if selinux::write_label_xattr(&file, "host_home_t").is_err() {
        return;
    }
    let ledgers = owned_ledgers(&[("/", 0o755)]);

    let stats = restore_attributes(&env.tree, &ledgers).unwrap();
    if stats.label_failures == 0 {
        assert_eq!(selinux::read_label_xattr(&file).unwrap(), None);
        assert!(stats.labels_cleared >= 1);
    }
    assert_eq!(stats.labels_applied, 0);
}

// =============================================================================
// Modification detection
// =============================================================================

#[test]
fn test_single_edit_is_flagged_alone() {
    let env = TestEnv::new();
    create_mock_tree(&env.tree);
    let baseline = ChecksumBaseline::compute(&env.tree).unwrap();
    ledger::save_baseline(&env.sidecar(), &baseline).unwrap();

    fs::write(env.tree.join("etc/hosts"), "10.0.0.1 gateway\n").unwrap();

    let stored = ledger::load_baseline(&env.sidecar()).unwrap().unwrap();
    let report = stored.diff(&ChecksumBaseline::compute(&env.tree).unwrap());
    assert_eq!(report.modified, vec!["/etc/hosts"]);
    assert!(report.added.is_empty());
    assert!(report.removed.is_empty());
}

#[test]
fn test_touch_without_change_is_clean() {
    let env = TestEnv::new();
    create_mock_tree(&env.tree);
    let baseline = ChecksumBaseline::compute(&env.tree).unwrap();

    let content = fs::read(env.tree.join("build.prop")).unwrap();
    fs::write(env.tree.join("build.prop"), content).unwrap();

    assert!(baseline
        .diff(&ChecksumBaseline::compute(&env.tree).unwrap())
        .is_clean());
}

// =============================================================================
// Repack context
// =============================================================================

#[test]
fn test_context_loads_sidecar_without_touching_tree() {
    let env = TestEnv::new();
    create_mock_tree(&env.tree);
    let (ledgers, _) = Harvester::new(Vec::new()).harvest(&env.tree).unwrap();
    ledgers.save(&env.sidecar()).unwrap();
    let meta_path = env.sidecar().metadata_path();
    fs::write(&meta_path, "FS_TYPE=erofs\nMOUNT_METHOD=kernel\nUUID=\n").unwrap();

    let config = env.config();
    let scratch_path = {
        let ctx = RepackContext::load(&config, &env.tree, &env.work_root.join("out.img")).unwrap();
        let metadata: &ImageMetadata = ctx.metadata.as_ref().unwrap();
        assert_eq!(metadata.fs_type.as_str(), "erofs");
        assert!(metadata.uuid.is_none());
        assert!(ctx.baseline.is_none());
        assert!(ctx.scratch.path().starts_with(&env.work_root));
        ctx.scratch.path().to_path_buf()
    };
    assert!(!scratch_path.exists());
    assert!(env.sidecar().exists());
}

#[test]
fn test_context_refuses_plain_directory() {
    let env = TestEnv::new();
    create_mock_tree(&env.tree);
    let config = env.config();
    let err = RepackContext::load(&config, &env.tree, &env.work_root.join("o.img")).err();
    assert!(err.unwrap().to_string().contains("repackfs unpack"));
}

#[test]
fn test_strip_sidecar() {
    let env = TestEnv::new();
    owned_ledgers(&[("/", 0o755)]).save(&env.sidecar()).unwrap();
    strip_sidecar(&env.tree).unwrap();
    assert!(!env.tree.join(INFO_DIR).exists());
    // Idempotent
    strip_sidecar(&env.tree).unwrap();
}

// =============================================================================
// Configuration
// =============================================================================

#[test]
#[serial]
fn test_config_reads_process_environment() {
    std::env::set_var("REPACKFS_DEFAULT_OVERHEAD", "20");
    std::env::set_var("REPACKFS_KERNEL_LABEL_OPTION", "");
    let config = Config::load();
    std::env::remove_var("REPACKFS_DEFAULT_OVERHEAD");
    std::env::remove_var("REPACKFS_KERNEL_LABEL_OPTION");

    assert_eq!(config.default_overhead, 20);
    assert_eq!(config.kernel_label_option, "");
}

#[test]
#[serial]
fn test_config_from_explicit_vars() {
    let vars = HashMap::from([(
        "REPACKFS_WORK_ROOT".to_string(),
        "/var/tmp/repack-a".to_string(),
    )]);
    let config = Config::from_vars(&vars);
    assert_eq!(config.work_root, std::path::PathBuf::from("/var/tmp/repack-a"));
}
