//! Legacy archive extraction.

use flate2::write::ZlibEncoder;
use flate2::Compression;
use rand::SeedableRng;
use serde_json::json;
use std::fs;
use std::io::Write;
use std::path::Path;
use tub_dataset::{
    convert_archive, extract_legacy_archives, ingest_tubs, IngestOptions, RecordStore,
};

fn write_archive(path: &Path, angle: f32) -> anyhow::Result<()> {
    let rows: Vec<Vec<[u8; 3]>> = (0..4)
        .map(|y| (0..5).map(|x| [x * 40, y * 60, 7]).collect())
        .collect();
    let body = json!({
        "val": {
            "cam/image_array": rows,
            "user/angle": angle,
            "user/throttle": 0.25,
            "user/mode": "user",
        }
    });
    let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
    enc.write_all(&serde_json::to_vec(&body)?)?;
    fs::write(path, enc.finish()?)?;
    Ok(())
}

#[test]
fn archives_become_records_once() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let tub = tmp.path().join("tub");
    fs::create_dir_all(&tub)?;
    write_archive(&tub.join("17_cam.zframe"), -0.5)?;
    write_archive(&tub.join("18_cam.zframe"), 0.5)?;
    fs::write(tub.join("19_cam.zframe"), b"garbage")?;

    assert_eq!(extract_legacy_archives(&[tub.clone()]), 2);
    assert!(tub.join("record_17_cam.json").is_file());
    let img = image::open(tub.join("17_cam.jpg"))?;
    assert_eq!((img.width(), img.height()), (5, 4));

    // Second pass finds everything already converted.
    assert_eq!(extract_legacy_archives(&[tub.clone()]), 0);
    assert!(!convert_archive(&tub.join("18_cam.zframe"))?);

    let mut store = RecordStore::new();
    let mut rng = rand::rngs::StdRng::seed_from_u64(0);
    let added = ingest_tubs(&[tub], &mut store, &IngestOptions::default(), &mut rng);
    assert_eq!(added, 2);
    Ok(())
}
