//! End-to-end backup and restore against the in-process blob store.

mod common;

use std::fs;
use std::sync::Arc;

use common::{start_control_plane, temp_layout, ControlPlane, RecordingManager, RecordingSink};
use ngr_core::events::{BackupRequest, Event, RestoreRequest};
use ngr_core::hashio;
use ngr_daemon::backup::BackupEngine;
use tempfile::TempDir;

struct Fixture {
    _dir: TempDir,
    layout: ngr_daemon::Layout,
    plane: Arc<ControlPlane>,
    svc: Arc<RecordingManager>,
    sink: Arc<RecordingSink>,
    engine: BackupEngine,
}

async fn fixture() -> Fixture {
    let plane = Arc::new(ControlPlane::default());
    let settings = start_control_plane(Arc::clone(&plane)).await;

    let dir = TempDir::new().unwrap();
    let layout = temp_layout(&dir);
    let svc = Arc::new(RecordingManager::default());
    let sink = Arc::new(RecordingSink::default());

    let engine = BackupEngine::new(
        layout.clone(),
        settings,
        Arc::clone(&svc) as _,
        Arc::clone(&sink) as _,
    );

    Fixture {
        _dir: dir,
        layout,
        plane,
        svc,
        sink,
        engine,
    }
}

fn progress_percents(events: &[Event]) -> Vec<u32> {
    events
        .iter()
        .filter_map(|event| match event {
            Event::ProgressUpdated(p) => Some(p.percent),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn backup_uploads_only_missing_blobs() {
    let fx = fixture().await;

    // instance executable plus three data files, one already known remotely
    hashio::write_file(fx.layout.exec_file("svc-a"), b"the binary", 0o755).unwrap();
    fx.plane.seed_blob(b"the binary");

    let data_dir = fx.layout.data_dir("svc-a");
    hashio::write_file(data_dir.join("x.db"), b"content x", 0o644).unwrap();
    hashio::write_file(data_dir.join("files/y.bin"), b"content y", 0o644).unwrap();
    hashio::write_file(data_dir.join("files/z.bin"), b"content z", 0o644).unwrap();
    fx.plane.seed_blob(b"content x");

    fx.engine
        .do_backup(&BackupRequest {
            request_id: 1,
            progress_id: "p1".into(),
            instance_id: "svc-a".into(),
        })
        .await
        .unwrap();

    // exec and x.db were deduplicated, only y and z travelled
    assert_eq!(fx.plane.upload_count(), 2);

    let commits = fx.plane.committed();
    assert_eq!(commits.len(), 1);
    let manifest = &commits[0];
    assert_eq!(manifest.instance_id, "svc-a");
    assert_eq!(manifest.exec.name, "svc-a");
    assert_eq!(manifest.exec.hash, hashio::sha3_bytes(b"the binary"));

    let mut names: Vec<&str> = manifest.data.iter().map(|e| e.name.as_str()).collect();
    names.sort_unstable();
    assert_eq!(names, vec!["files/y.bin", "files/z.bin", "x.db"]);

    // one progress event per data file, monotone, terminated by finished
    let events = fx.sink.events();
    assert_eq!(progress_percents(&events), vec![33, 67, 100, 100]);
    match events.last().unwrap() {
        Event::ProgressUpdated(last) => {
            assert!(last.finished);
            assert!(last.error.is_empty());
        }
        other => panic!("unexpected final event: {other:?}"),
    }
}

#[tokio::test]
async fn restore_is_the_inverse_of_backup() {
    let fx = fixture().await;

    hashio::write_file(fx.layout.exec_file("svc-a"), b"the binary", 0o755).unwrap();
    let data_dir = fx.layout.data_dir("svc-a");
    hashio::write_file(data_dir.join("x.db"), b"content x", 0o640).unwrap();
    hashio::write_file(data_dir.join("files/deep/y.bin"), b"content y", 0o600).unwrap();

    fx.engine
        .do_backup(&BackupRequest {
            request_id: 1,
            progress_id: "p1".into(),
            instance_id: "svc-a".into(),
        })
        .await
        .unwrap();

    let manifest = fx.plane.committed().pop().unwrap();

    // wreck the local state entirely
    fs::remove_dir_all(&data_dir).unwrap();
    fs::remove_file(fx.layout.exec_file("svc-a")).unwrap();

    fx.engine
        .do_restore(&RestoreRequest {
            request_id: 2,
            instance_id: "svc-a".into(),
            progress_id: "p2".into(),
            exec: manifest.exec.clone(),
            data: manifest.data.clone(),
        })
        .await
        .unwrap();

    // byte-identical content, modes preserved
    assert_eq!(fs::read(fx.layout.exec_file("svc-a")).unwrap(), b"the binary");
    assert_eq!(fs::read(data_dir.join("x.db")).unwrap(), b"content x");
    assert_eq!(
        fs::read(data_dir.join("files/deep/y.bin")).unwrap(),
        b"content y"
    );
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = |p: &std::path::Path| fs::metadata(p).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode(&data_dir.join("x.db")), 0o640);
        assert_eq!(mode(&data_dir.join("files/deep/y.bin")), 0o600);
        // restored parents are service-manager safe
        assert_eq!(mode(&data_dir.join("files/deep")), 0o700);
    }

    // the service was quiesced and brought back
    assert_eq!(fx.svc.count("stop svc-a"), 1);
    assert_eq!(fx.svc.count("start svc-a"), 1);

    // the restore progress stream is monotone and finishes
    let events = fx.sink.events();
    let restore_percents: Vec<u32> = events
        .iter()
        .filter_map(|event| match event {
            Event::ProgressUpdated(p) if p.progress_id == "p2" => Some(p.percent),
            _ => None,
        })
        .collect();
    assert!(restore_percents.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(*restore_percents.last().unwrap(), 100);
}

#[tokio::test]
async fn failed_backup_still_finishes_the_progress_stream() {
    let fx = fixture().await;

    // no executable and no data at all: the exec hash fails hard enough to
    // surface an aggregated error, but the stream still terminates
    let err = fx
        .engine
        .do_backup(&BackupRequest {
            request_id: 1,
            progress_id: "p1".into(),
            instance_id: "svc-missing".into(),
        })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("occured during backup"));

    let events = fx.sink.events();
    match events.last().unwrap() {
        Event::ProgressUpdated(last) => {
            assert!(last.finished);
            assert!(!last.error.is_empty());
        }
        other => panic!("unexpected final event: {other:?}"),
    }
}
