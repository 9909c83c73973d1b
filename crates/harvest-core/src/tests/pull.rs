use std::fs;

use crate::commands::pull::{self, plan_transfer};
use crate::hash::ContentHash;
use crate::manifest::{Manifest, MANIFEST_FILE_NAME};
use crate::store::BlobStore;
use crate::testutil::{fixture_file, make_test_config, FakeShell, FakeTransfer};

struct Harness {
    _tmp: tempfile::TempDir,
    config: crate::config::HarvestConfig,
    store: BlobStore,
    fixture_root: std::path::PathBuf,
}

fn harness() -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let config = make_test_config(&tmp.path().join("store"));
    let store = BlobStore::new(config.paths());
    store.ensure_layout().unwrap();
    let fixture_root = tmp.path().join("remote");
    fs::create_dir_all(&fixture_root).unwrap();
    Harness {
        config,
        store,
        fixture_root,
        _tmp: tmp,
    }
}

fn reconcile(h: &Harness, transfer: &FakeTransfer, host: &str, raw: &str) -> pull::HostReport {
    let manifest = Manifest::parse(raw.as_bytes());
    pull::reconcile_host(&h.config, &h.store, transfer, &None, host, &manifest).unwrap()
}

#[test]
fn round_trip_commits_blob_and_persists_manifest() {
    let h = harness();
    let line = fixture_file(&h.fixture_root, "/opt", "data/file1", &[0x61; 1024]);
    let transfer = FakeTransfer::new(&h.fixture_root);

    let raw = format!("{line}\n");
    let report = reconcile(&h, &transfer, "web01", &raw);

    assert_eq!(report.entries, 1);
    assert_eq!(report.planned, 1);
    assert_eq!(report.expected_bytes, 1024);
    assert_eq!(report.committed, 1);
    assert_eq!(report.skipped(), 0);
    assert!(report.transfer_error.is_none());

    let hash = ContentHash::compute(&[0x61; 1024]);
    assert!(h.store.exists(&hash));
    let blob = h.store.blob_path(&hash);
    assert_eq!(fs::metadata(&blob).unwrap().len(), 1024);
    assert!(blob.starts_with(h.config.paths().hash_dir.join(hash.shard_prefix())));

    let persisted = h.config.paths().host_meta_dir("web01").join(MANIFEST_FILE_NAME);
    assert_eq!(fs::read_to_string(persisted).unwrap(), raw);
}

#[test]
fn commit_trusts_the_scanners_digest() {
    // The engine never re-hashes on the receiving side: a record whose
    // digest does not match the content still commits under that key, and
    // only the integrity sweep would ever notice.
    let h = harness();
    fixture_file(&h.fixture_root, "/opt", "data/file1", b"whatever");
    let path = h.fixture_root.join("opt/data/file1");
    let claimed = "abcdef0123456789abcdef0123456789";
    let raw = format!(
        "md5 {claimed} {} 8 data/file1\n",
        crate::testutil::mtime_text(&path)
    );
    let transfer = FakeTransfer::new(&h.fixture_root);

    let report = reconcile(&h, &transfer, "web01", &raw);
    assert_eq!(report.committed, 1);
    let key = ContentHash::parse_hex(claimed).unwrap();
    assert!(h.store.exists(&key));
    assert_eq!(
        h.store.blob_path(&key),
        h.config
            .paths()
            .hash_dir
            .join("ab")
            .join("cdef0123456789abcdef0123456789")
    );
}

#[test]
fn duplicate_hashes_transfer_once() {
    let h = harness();
    let line = fixture_file(&h.fixture_root, "/opt", "data/file1", b"shared content");
    // Same content at a second path
    let line2 = line.replace("data/file1", "data/file1-copy");
    let transfer = FakeTransfer::new(&h.fixture_root);

    let report = reconcile(&h, &transfer, "web01", &format!("{line}\n{line2}\n"));

    assert_eq!(report.entries, 2);
    assert_eq!(report.planned, 1);
    assert_eq!(report.committed, 1);
    let calls = transfer.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1, vec!["/opt/data/file1".to_string()]);
}

#[test]
fn present_hashes_are_not_requested_again() {
    let h = harness();
    let line = fixture_file(&h.fixture_root, "/opt", "data/file1", b"already stored");
    let transfer = FakeTransfer::new(&h.fixture_root);
    reconcile(&h, &transfer, "web01", &format!("{line}\n"));

    // Second host references the same content plus something new
    let line_new = fixture_file(&h.fixture_root, "/opt", "data/file2", b"fresh content");
    let report = reconcile(&h, &transfer, "web02", &format!("{line}\n{line_new}\n"));

    assert_eq!(report.planned, 1);
    assert_eq!(report.committed, 1);
    let calls = transfer.calls.lock().unwrap();
    assert_eq!(calls[1].1, vec!["/opt/data/file2".to_string()]);
}

#[test]
fn empty_delta_skips_the_transfer_tool_entirely() {
    let h = harness();
    let line = fixture_file(&h.fixture_root, "/opt", "data/file1", b"content");
    let transfer = FakeTransfer::new(&h.fixture_root);
    reconcile(&h, &transfer, "web01", &format!("{line}\n"));
    assert_eq!(transfer.call_count(), 1);

    // Everything already present: no second invocation, manifest persisted
    let report = reconcile(&h, &transfer, "web02", &format!("{line}\n"));
    assert_eq!(report.planned, 0);
    assert_eq!(transfer.call_count(), 1);
    assert!(h
        .config
        .paths()
        .host_meta_dir("web02")
        .join(MANIFEST_FILE_NAME)
        .is_file());
}

#[test]
fn size_mismatch_is_skipped_and_never_committed() {
    let h = harness();
    let line = fixture_file(&h.fixture_root, "/opt", "data/file1", b"actual bytes");
    // Manifest claims a different size than the file that will be staged
    let lied = line.replace(
        &format!(" {} ", b"actual bytes".len()),
        &format!(" {} ", b"actual bytes".len() + 7),
    );
    let transfer = FakeTransfer::new(&h.fixture_root);

    let report = reconcile(&h, &transfer, "web01", &format!("{lied}\n"));
    assert_eq!(report.mismatched, 1);
    assert_eq!(report.committed, 0);
    assert!(!h.store.exists(&ContentHash::compute(b"actual bytes")));
}

#[test]
fn mtime_mismatch_is_skipped_and_never_committed() {
    let h = harness();
    let line = fixture_file(&h.fixture_root, "/opt", "data/file1", b"timed bytes");
    let path = h.fixture_root.join("opt/data/file1");
    let real = crate::testutil::mtime_text(&path);
    let lied = line.replace(&real, "19990101000000");
    let transfer = FakeTransfer::new(&h.fixture_root);

    let report = reconcile(&h, &transfer, "web01", &format!("{lied}\n"));
    assert_eq!(report.mismatched, 1);
    assert_eq!(report.committed, 0);
}

#[test]
fn files_that_never_stage_are_counted_missing() {
    let h = harness();
    let staged = fixture_file(&h.fixture_root, "/opt", "data/kept", b"kept");
    // Record for a file the fixture does not contain
    let gone = "md5 00112233445566778899aabbccddeeff 20230101120000 5 data/gone";
    let transfer = FakeTransfer::new(&h.fixture_root);

    let report = reconcile(&h, &transfer, "web01", &format!("{staged}\n{gone}\n"));
    assert_eq!(report.planned, 2);
    assert_eq!(report.committed, 1);
    assert_eq!(report.missing, 1);
}

#[test]
fn transfer_failure_is_surfaced_but_staged_files_are_salvaged() {
    let h = harness();
    let line = fixture_file(&h.fixture_root, "/opt", "data/file1", b"landed anyway");
    let mut transfer = FakeTransfer::new(&h.fixture_root);
    transfer.fail_hosts.insert("web01".to_string());

    let report = reconcile(&h, &transfer, "web01", &format!("{line}\n"));
    assert!(report.transfer_error.is_some());
    assert_eq!(report.committed, 1);
    // Manifest persisted despite the failed tool
    assert!(h
        .config
        .paths()
        .host_meta_dir("web01")
        .join(MANIFEST_FILE_NAME)
        .is_file());
}

#[test]
fn plan_preserves_manifest_order() {
    let h = harness();
    let a = fixture_file(&h.fixture_root, "/opt", "b/second", b"bb");
    let b = fixture_file(&h.fixture_root, "/opt", "a/first", b"aa");
    let manifest = Manifest::parse(format!("{a}\n{b}\n").as_bytes());
    let plan = plan_transfer(&manifest, &h.store, "/opt");
    let paths: Vec<_> = plan.items.iter().map(|i| i.remote_path.as_str()).collect();
    assert_eq!(paths, vec!["/opt/b/second", "/opt/a/first"]);
    assert_eq!(plan.expected_bytes, 4);
}

#[test]
fn run_excludes_failing_hosts_without_aborting_others() {
    let h = harness();
    let line = fixture_file(&h.fixture_root, "/opt", "data/file1", b"fleet content");
    let transfer = FakeTransfer::new(&h.fixture_root);

    let mut shell = FakeShell::default();
    shell
        .manifests
        .insert("good".to_string(), format!("{line}\n").into_bytes());
    shell.fail_deploy.insert("undeployable".to_string());
    shell.fail_fetch.insert("unfetchable".to_string());

    let hosts: Vec<String> = ["undeployable", "good", "unfetchable"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let report = pull::run(&h.config, &shell, &transfer, &hosts, None).unwrap();

    assert_eq!(report.reports.len(), 1);
    assert_eq!(report.reports[0].hostname, "good");
    assert_eq!(report.reports[0].committed, 1);
    assert_eq!(report.failed.len(), 2);
    assert!(!report.all_clean());
    assert!(report.store_bytes > 0);

    // Only the good host's manifest was persisted
    assert!(h.config.paths().host_meta_dir("good").join(MANIFEST_FILE_NAME).is_file());
    assert!(!h.config.paths().host_meta_dir("unfetchable").exists());
}

#[test]
fn run_leaves_prior_manifest_intact_when_fetch_fails() {
    let h = harness();
    let line = fixture_file(&h.fixture_root, "/opt", "data/file1", b"old content");
    let transfer = FakeTransfer::new(&h.fixture_root);

    let mut shell = FakeShell::default();
    shell
        .manifests
        .insert("web01".to_string(), format!("{line}\n").into_bytes());
    let hosts = vec!["web01".to_string()];
    pull::run(&h.config, &shell, &transfer, &hosts, None).unwrap();

    // Next pass: the fetch fails; the persisted manifest must survive
    shell.fail_fetch.insert("web01".to_string());
    let report = pull::run(&h.config, &shell, &transfer, &hosts, None).unwrap();
    assert_eq!(report.failed.len(), 1);

    let persisted = Manifest::load_persisted(&h.config.paths(), "web01")
        .unwrap()
        .unwrap();
    assert_eq!(persisted.entries.len(), 1);
}
