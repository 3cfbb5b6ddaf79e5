//! Window construction and sequence batch layout.

mod common;

use common::{create_synthetic_tub, write_frame, H, W};
use rand::SeedableRng;
use std::fs;
use tub_dataset::{
    build_windows, ingest_tubs, split_windows, ImageGeometry, IngestOptions, RecordStore,
    SequenceBatchGen, SequenceConfig, Targets,
};

fn ingest(tubs: &[std::path::PathBuf]) -> RecordStore {
    let mut store = RecordStore::new();
    let mut rng = rand::rngs::StdRng::seed_from_u64(3);
    ingest_tubs(tubs, &mut store, &IngestOptions::default(), &mut rng);
    store
}

#[test]
fn contiguous_run_yields_sliding_windows() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let tub = create_synthetic_tub(tmp.path(), "tub", 0, 10)?;
    let store = ingest(&[tub]);
    let windows = build_windows(&store, 4);
    assert_eq!(windows.len(), 7);
    for w in &windows {
        let idx: Vec<u64> = w.iter().map(|k| k.index).collect();
        assert!(idx.windows(2).all(|p| p[1] == p[0] + 1));
    }
    Ok(())
}

#[test]
fn windows_never_span_gaps_or_tubs() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let tub = create_synthetic_tub(tmp.path(), "tub", 0, 10)?;
    fs::remove_file(tub.join("record_5.json"))?;
    let other = create_synthetic_tub(tmp.path(), "other", 10, 2)?;
    let store = ingest(&[tub, other]);
    let windows = build_windows(&store, 4);
    // 0..=4 gives two windows, 6..=9 gives one, the two-frame tub none.
    assert_eq!(windows.len(), 3);
    assert!(windows.iter().all(|w| w.iter().all(|k| k.index != 5)));
    assert!(windows
        .iter()
        .all(|w| w.iter().all(|k| k.tub == w[0].tub)));
    Ok(())
}

#[test]
fn windows_stop_at_the_last_index() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let tub = tmp.path().join("tub");
    write_frame(&tub, u64::MAX - 1, 0.0, 0.1, None, None)?;
    write_frame(&tub, u64::MAX, 0.0, 0.1, None, None)?;
    let store = ingest(&[tub]);
    assert_eq!(store.len(), 2);
    assert!(build_windows(&store, 3).is_empty());
    assert_eq!(build_windows(&store, 2).len(), 1);
    Ok(())
}

#[test]
fn split_rounds_validation_up() {
    let windows: Vec<_> = (0..7)
        .map(|i| vec![tub_dataset::SampleKey::new("t", i)])
        .collect();
    let mut rng = rand::rngs::StdRng::seed_from_u64(5);
    let (train, val) = split_windows(windows, 0.8, &mut rng);
    assert_eq!(train.len(), 5);
    assert_eq!(val.len(), 2);
}

#[test]
fn plain_sequence_batch_layout() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let tub = create_synthetic_tub(tmp.path(), "tub", 0, 6)?;
    let store = ingest(&[tub]);
    let cfg = SequenceConfig::plain(3);
    let windows = build_windows(&store, cfg.window_len());
    let store = store.shared();
    let geometry = ImageGeometry::new(W, H, 3);
    let mut gen = SequenceBatchGen::new(store.clone(), windows, cfg, 2, geometry, Some(1));
    let batch = gen.next().expect("batch");
    assert_eq!(batch.images.shape, vec![2, 3, H as usize, W as usize, 3]);
    assert!(batch.history.is_none());
    match batch.targets {
        Targets::Paired(t) => {
            assert_eq!(t.shape, vec![2, 2]);
            assert!((t.data[1] - 0.3).abs() < 1e-6);
        }
        other => panic!("unexpected targets {other:?}"),
    }
    Ok(())
}

#[test]
fn look_ahead_batch_masks_history() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let tub = create_synthetic_tub(tmp.path(), "tub", 0, 8)?;
    let store = ingest(&[tub]);
    let cfg = SequenceConfig::look_ahead(2);
    let windows = build_windows(&store, cfg.window_len());
    assert_eq!(windows.len(), 5);
    let geometry = ImageGeometry::new(W, H, 3);
    let mut gen = SequenceBatchGen::new(store.shared(), windows, cfg, 3, geometry, Some(2));
    let batch = gen.next().expect("batch");
    assert_eq!(batch.images.shape, vec![3, 2, H as usize, W as usize, 3]);
    let history = batch.history.expect("history input");
    assert_eq!(history.shape, vec![3, 4]);
    assert!(history.data.iter().all(|v| *v == 0.0));
    match batch.targets {
        Targets::Paired(t) => assert_eq!(t.shape, vec![3, 4]),
        other => panic!("unexpected targets {other:?}"),
    }
    Ok(())
}

#[test]
fn too_few_windows_ends_iteration() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let tub = create_synthetic_tub(tmp.path(), "tub", 0, 3)?;
    let store = ingest(&[tub]);
    let windows = build_windows(&store, 3);
    let geometry = ImageGeometry::new(W, H, 3);
    let cfg = SequenceConfig::plain(3);
    let mut gen = SequenceBatchGen::new(store.shared(), windows, cfg, 2, geometry, None);
    assert!(gen.next().is_none());
    Ok(())
}
