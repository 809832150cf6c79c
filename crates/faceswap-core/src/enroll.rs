//! Identity enrollment: average the face embeddings of a sample set.

use crate::analyzer::FaceAnalyzer;
use crate::codec;
use crate::error::PipelineError;
use crate::store::{validate_name, EmbeddingStore, StoreError};
use crate::types::{Embedding, IdentityRecord, IdentityVector};
use chrono::{SecondsFormat, Utc};
use image::RgbImage;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;
use zip::ZipArchive;

const DATASET_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("dataset archive: {0}")]
    Archive(#[from] zip::result::ZipError),
}

/// Averaged identity and how many samples went into it.
#[derive(Debug, Clone)]
pub struct BuiltIdentity {
    /// Arithmetic mean of the per-image unit embeddings; not renormalized.
    pub vector: IdentityVector,
    pub contributing: usize,
    pub skipped: usize,
}

/// Average the first face embedding of every image that has one.
///
/// Images with no face, or whose first face has no embedding, are skipped.
/// Fails with [`PipelineError::NoFaceFound`] when nothing contributes.
pub fn build_identity_embedding<I>(analyzer: &dyn FaceAnalyzer, images: I) -> Result<BuiltIdentity, PipelineError>
where
    I: IntoIterator<Item = RgbImage>,
{
    let mut sum: Vec<f32> = Vec::new();
    let mut model_version = None;
    let mut contributing = 0usize;
    let mut skipped = 0usize;

    for (index, image) in images.into_iter().enumerate() {
        let faces = analyzer.analyze(&image)?;
        let Some(first) = faces.into_iter().next() else {
            tracing::warn!(index, "no face detected in sample; skipping");
            skipped += 1;
            continue;
        };
        let Some(embedding) = first.embedding else {
            tracing::warn!(index, "first face has no embedding; skipping sample");
            skipped += 1;
            continue;
        };

        if sum.is_empty() {
            sum = vec![0.0; embedding.dim()];
            model_version = embedding.model_version.clone();
        } else if embedding.dim() != sum.len() {
            return Err(PipelineError::EmbeddingDimension {
                expected: sum.len(),
                actual: embedding.dim(),
            });
        }
        for (acc, v) in sum.iter_mut().zip(&embedding.values) {
            *acc += v;
        }
        contributing += 1;
    }

    if contributing == 0 {
        return Err(PipelineError::NoFaceFound);
    }

    let n = contributing as f32;
    let mean = sum.into_iter().map(|v| v / n).collect();
    tracing::debug!(contributing, skipped, "identity embedding built");

    Ok(BuiltIdentity {
        vector: IdentityVector::Raw(Embedding { values: mean, model_version }),
        contributing,
        skipped,
    })
}

/// Build an identity from `images` and persist it under `name`.
///
/// The name is validated, and must not already be stored, before any image is
/// analyzed. Nothing is written unless at least one sample contributes.
pub fn enroll<I>(
    analyzer: &dyn FaceAnalyzer,
    store: &dyn EmbeddingStore,
    name: &str,
    images: I,
) -> Result<IdentityRecord, PipelineError>
where
    I: IntoIterator<Item = RgbImage>,
{
    validate_name(name)?;
    if store.exists(name) {
        return Err(StoreError::AlreadyExists(name.to_string()).into());
    }
    let built = build_identity_embedding(analyzer, images)?;

    let record = IdentityRecord {
        name: name.to_string(),
        model_version: built.vector.embedding().model_version.clone(),
        vector: built.vector,
        samples: built.contributing,
        created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    };
    store.save(&record)?;

    tracing::info!(
        name,
        samples = built.contributing,
        skipped = built.skipped,
        "identity enrolled"
    );
    Ok(record)
}

/// Recursively collect `.jpg`, `.jpeg` and `.png` files under `dir`, sorted.
pub fn collect_dataset_images(dir: &Path) -> Result<Vec<PathBuf>, std::io::Error> {
    let mut paths = Vec::new();
    for entry in WalkDir::new(dir) {
        let entry = entry.map_err(std::io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        if has_dataset_extension(entry.path()) {
            paths.push(entry.into_path());
        }
    }
    paths.sort();
    Ok(paths)
}

fn has_dataset_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| DATASET_EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known)))
}

pub fn is_dataset_archive(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("zip"))
}

/// Identity name implied by an uploaded archive: its file stem.
pub fn dataset_name_from_archive(path: &Path) -> Option<String> {
    path.file_stem().and_then(|s| s.to_str()).map(str::to_string)
}

/// Decode every `.jpg`, `.jpeg` and `.png` entry of a ZIP archive, in entry-name order.
///
/// Entries are read in memory; nothing is extracted to disk. Entries that
/// fail to decode are skipped with a warning.
pub fn read_dataset_archive(path: &Path) -> Result<Vec<RgbImage>, DatasetError> {
    let mut archive = ZipArchive::new(File::open(path)?)?;

    let mut entries: Vec<(String, usize)> = Vec::new();
    for index in 0..archive.len() {
        let entry = archive.by_index(index)?;
        if entry.is_file() && has_dataset_extension(Path::new(entry.name())) {
            entries.push((entry.name().to_string(), index));
        }
    }
    entries.sort();

    let mut images = Vec::with_capacity(entries.len());
    for (name, index) in entries {
        let mut bytes = Vec::new();
        archive.by_index(index)?.read_to_end(&mut bytes)?;
        match codec::decode_image_bytes(&bytes) {
            Ok(image) => images.push(image),
            Err(e) => tracing::warn!(entry = %name, error = %e, "skipping undecodable archive entry"),
        }
    }

    tracing::info!(
        archive = %path.display(),
        images = images.len(),
        "dataset archive read"
    );
    Ok(images)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::AnalyzerError;
    use crate::store::SafetensorsStore;
    use crate::types::{BoundingBox, DetectedFace};
    use image::Rgb;

    /// Encodes the sample's embedding in the red channel of pixel (0, 0):
    /// 0 = no face, 1 = face without embedding, otherwise a face whose
    /// embedding is `[r, 255 - r]` normalized.
    struct PixelAnalyzer;

    impl FaceAnalyzer for PixelAnalyzer {
        fn analyze(&self, image: &RgbImage) -> Result<Vec<DetectedFace>, AnalyzerError> {
            let r = image.get_pixel(0, 0).0[0];
            let bbox = BoundingBox::from_corners(0.0, 0.0, 4.0, 4.0, 0.9);
            Ok(match r {
                0 => Vec::new(),
                1 => vec![DetectedFace { bbox, embedding: None }],
                _ => vec![DetectedFace {
                    bbox,
                    embedding: Some(Embedding::new(vec![r as f32, 255.0 - r as f32]).normalized()),
                }],
            })
        }
    }

    fn sample(r: u8) -> RgbImage {
        RgbImage::from_pixel(4, 4, Rgb([r, 0, 0]))
    }

    #[test]
    fn test_mean_of_unit_embeddings_is_not_renormalized() {
        // The third sample has no face and is skipped.
        let built = build_identity_embedding(&PixelAnalyzer, vec![sample(255), sample(2), sample(0)]).unwrap();
        assert_eq!(built.contributing, 2);
        assert_eq!(built.skipped, 1);
        assert!(!built.vector.is_normalized());

        let mean = &built.vector.embedding().values;
        let e2 = Embedding::new(vec![2.0, 253.0]).normalized();
        assert!((mean[0] - (1.0 + e2.values[0]) / 2.0).abs() < 1e-6);
        assert!((mean[1] - e2.values[1] / 2.0).abs() < 1e-6);
        assert!(built.vector.embedding().norm() < 1.0);
    }

    #[test]
    fn test_mean_is_order_independent() {
        let a = build_identity_embedding(&PixelAnalyzer, vec![sample(40), sample(200), sample(90)]).unwrap();
        let b = build_identity_embedding(&PixelAnalyzer, vec![sample(90), sample(40), sample(200)]).unwrap();
        for (x, y) in a.vector.embedding().values.iter().zip(&b.vector.embedding().values) {
            assert!((x - y).abs() < 1e-6);
        }
    }

    #[test]
    fn test_face_without_embedding_is_skipped() {
        let built = build_identity_embedding(&PixelAnalyzer, vec![sample(1), sample(255)]).unwrap();
        assert_eq!(built.contributing, 1);
        assert_eq!(built.skipped, 1);
    }

    #[test]
    fn test_no_faces_fails() {
        let err = build_identity_embedding(&PixelAnalyzer, vec![sample(0), sample(1)]).unwrap_err();
        assert!(matches!(err, PipelineError::NoFaceFound));
        let err = build_identity_embedding(&PixelAnalyzer, Vec::<RgbImage>::new()).unwrap_err();
        assert!(matches!(err, PipelineError::NoFaceFound));
    }

    #[test]
    fn test_enroll_persists_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = SafetensorsStore::new(dir.path());
        let record = enroll(&PixelAnalyzer, &store, "alice", vec![sample(255), sample(128)]).unwrap();
        assert_eq!(record.samples, 2);

        let loaded = store.load("alice").unwrap();
        assert!(!loaded.vector.is_normalized());
        assert_eq!(loaded.vector.embedding().values, record.vector.embedding().values);
        assert_eq!(loaded.samples, 2);
    }

    #[test]
    fn test_enroll_without_faces_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = SafetensorsStore::new(dir.path());
        let err = enroll(&PixelAnalyzer, &store, "bob", vec![sample(0)]).unwrap_err();
        assert!(matches!(err, PipelineError::NoFaceFound));
        assert!(!store.exists("bob"));
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_reenrolling_a_name_keeps_the_first_identity() {
        let dir = tempfile::tempdir().unwrap();
        let store = SafetensorsStore::new(dir.path());
        let first = enroll(&PixelAnalyzer, &store, "alice", vec![sample(200)]).unwrap();

        let err = enroll(&PixelAnalyzer, &store, "alice", vec![sample(2)]).unwrap_err();
        assert!(matches!(err, PipelineError::Store(StoreError::AlreadyExists(ref n)) if n == "alice"));

        let stored = store.load("alice").unwrap();
        assert_eq!(stored.vector.embedding().values, first.vector.embedding().values);
        assert_eq!(store.list().unwrap(), vec!["alice"]);
    }

    #[test]
    fn test_enroll_rejects_bad_name_before_analysis() {
        let dir = tempfile::tempdir().unwrap();
        let store = SafetensorsStore::new(dir.path());
        let err = enroll(&PixelAnalyzer, &store, "../evil", vec![sample(255)]).unwrap_err();
        assert!(matches!(err, PipelineError::Store(StoreError::InvalidName(_))));
    }

    fn png(r: u8) -> Vec<u8> {
        let mut buf = std::io::Cursor::new(Vec::new());
        sample(r).write_to(&mut buf, image::ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    fn write_archive(path: &Path, entries: &[(&str, Vec<u8>)]) {
        use std::io::Write;
        let mut writer = zip::ZipWriter::new(File::create(path).unwrap());
        let options = zip::write::SimpleFileOptions::default();
        writer.add_directory("faces/", options).unwrap();
        for (name, bytes) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(bytes).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn test_read_dataset_archive_filters_and_orders_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alice.zip");
        write_archive(
            &path,
            &[
                ("faces/b.PNG", png(200)),
                ("a.png", png(40)),
                ("notes.txt", b"not an image".to_vec()),
                ("faces/broken.jpg", b"garbage".to_vec()),
            ],
        );

        let images = read_dataset_archive(&path).unwrap();
        let reds: Vec<u8> = images.iter().map(|i| i.get_pixel(0, 0).0[0]).collect();
        assert_eq!(reds, vec![40, 200]);
        assert_eq!(dataset_name_from_archive(&path).as_deref(), Some("alice"));
        assert!(is_dataset_archive(&path));
        assert!(!is_dataset_archive(Path::new("alice.png")));
    }

    #[test]
    fn test_enroll_from_archive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("erin.zip");
        write_archive(&path, &[("x/1.jpeg", png(255)), ("x/2.png", png(0))]);
        let store = SafetensorsStore::new(dir.path().join("store"));

        let images = read_dataset_archive(&path).unwrap();
        let name = dataset_name_from_archive(&path).unwrap();
        let record = enroll(&PixelAnalyzer, &store, &name, images).unwrap();
        assert_eq!(record.samples, 1);
        assert!(store.exists("erin"));
    }

    #[test]
    fn test_read_dataset_archive_rejects_non_zip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fake.zip");
        std::fs::write(&path, b"plain text").unwrap();
        assert!(matches!(read_dataset_archive(&path), Err(DatasetError::Archive(_))));
    }

    #[test]
    fn test_collect_dataset_images_recursive_and_case_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("person").join("more");
        std::fs::create_dir_all(&nested).unwrap();
        for name in ["b.JPG", "a.png", "notes.txt"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        std::fs::write(nested.join("c.JpEg"), b"x").unwrap();
        std::fs::write(nested.join("d.gif"), b"x").unwrap();

        let found = collect_dataset_images(dir.path()).unwrap();
        let names: Vec<_> = found
            .iter()
            .map(|p| p.strip_prefix(dir.path()).unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 3);
        assert!(names.contains(&"a.png".to_string()));
        assert!(names.contains(&"b.JPG".to_string()));
        assert!(names.iter().any(|n| n.ends_with("c.JpEg")));
        let mut sorted = found.clone();
        sorted.sort();
        assert_eq!(found, sorted);
    }
}
