//! End-to-end behavior of the public `Verifier` surface.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use rollcall_core::codec::{self, DecodeError};
use rollcall_core::preprocess::Preprocessor;
use rollcall_core::types::ModelArtifact;
use rollcall_core::{Config, MatchDecision, NoMatchReason, RawImage, RecognizerError, Verifier};
use std::io::Cursor;
use std::path::Path;

fn config(dir: &Path) -> Config {
    Config {
        model_dir: dir.to_path_buf(),
        epochs: 10,
        seed: Some(7),
        ..Config::default()
    }
}

/// A deterministic "face": a colored gradient whose hue depends on `tint`.
fn face(tint: u8, width: u32, height: u32) -> DynamicImage {
    let img = RgbImage::from_fn(width, height, |x, y| {
        let gx = (x * 255 / width.max(1)) as u8;
        let gy = (y * 255 / height.max(1)) as u8;
        Rgb([gx.wrapping_add(tint), gy, tint.wrapping_mul(3) ^ gx])
    });
    DynamicImage::ImageRgb8(img)
}

fn data_uri(img: &DynamicImage) -> RawImage {
    let mut png = Vec::new();
    img.write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .unwrap();
    RawImage::DataUri(format!("data:image/png;base64,{}", STANDARD.encode(png)))
}

fn save_png(dir: &Path, name: &str, img: &DynamicImage) -> RawImage {
    let path = dir.join(name);
    img.save(&path).unwrap();
    RawImage::Path(path)
}

fn artifact_file(dir: &Path, identity: &str) -> std::path::PathBuf {
    dir.join(format!("trained_model_{identity}.bin"))
}

#[test]
fn test_round_trip_recognizes_trained_identity() {
    let models = tempfile::tempdir().unwrap();
    let images = tempfile::tempdir().unwrap();
    let verifier = Verifier::new(&config(models.path())).unwrap();

    let enrollment = vec![
        save_png(images.path(), "a.png", &face(10, 120, 90)),
        save_png(images.path(), "b.png", &face(14, 64, 64)),
        data_uri(&face(18, 200, 150)),
    ];
    assert!(verifier.train("S1", &enrollment));

    let result = verifier.recognize(&enrollment[0], "S1").unwrap();
    assert_eq!(result.as_deref(), Some("S1"));
}

#[test]
fn test_round_trip_with_default_epochs() {
    let models = tempfile::tempdir().unwrap();
    let defaults = Config {
        model_dir: models.path().to_path_buf(),
        seed: Some(21),
        ..Config::default()
    };
    assert_eq!(defaults.epochs, 5);
    let verifier = Verifier::new(&defaults).unwrap();

    let enrollment = [data_uri(&face(60, 90, 110)), data_uri(&face(64, 100, 100))];
    assert!(verifier.train("S4", &enrollment));
    assert_eq!(
        verifier.recognize(&enrollment[1], "S4").unwrap().as_deref(),
        Some("S4")
    );
}

#[test]
fn test_data_uri_probe() {
    let models = tempfile::tempdir().unwrap();
    let verifier = Verifier::new(&config(models.path())).unwrap();
    let probe = data_uri(&face(40, 80, 80));

    assert!(verifier.train("S1", &[probe.clone()]));
    match verifier.verify(&probe, "S1").unwrap() {
        MatchDecision::Match { identity, confidence } => {
            assert_eq!(identity, "S1");
            assert!(confidence > 0.5 && confidence <= 1.0);
        }
        other => panic!("expected a match, got {other:?}"),
    }
}

#[test]
fn test_absent_artifact_is_no_match() {
    let models = tempfile::tempdir().unwrap();
    let verifier = Verifier::new(&config(models.path())).unwrap();
    let probe = data_uri(&face(1, 32, 32));

    assert_eq!(verifier.recognize(&probe, "nobody").unwrap(), None);
    assert_eq!(
        verifier.verify(&probe, "nobody").unwrap(),
        MatchDecision::NoMatch {
            reason: NoMatchReason::ArtifactMissing,
            confidence: None
        }
    );
}

#[test]
fn test_canonical_shape_for_any_input() {
    let pre = Preprocessor::default();
    let inputs = [
        face(0, 1, 1),
        face(0, 640, 480),
        face(0, 37, 501),
        DynamicImage::ImageLuma8(image::GrayImage::from_pixel(50, 20, image::Luma([9]))),
        DynamicImage::ImageRgba8(image::RgbaImage::from_pixel(300, 300, image::Rgba([1, 2, 3, 4]))),
    ];
    for img in inputs {
        let decoded = codec::decode(&data_uri(&img)).unwrap();
        let canonical = pre.normalize(&decoded).unwrap();
        assert_eq!(canonical.shape(), [1, 100, 100, 3]);
    }
}

#[test]
fn test_malformed_base64_is_decode_error() {
    let models = tempfile::tempdir().unwrap();
    let verifier = Verifier::new(&config(models.path())).unwrap();
    let enrollment = [data_uri(&face(5, 50, 50))];
    assert!(verifier.train("S1", &enrollment));

    let bad = RawImage::DataUri("data:image/png;base64,@@not*base64@@".into());
    assert!(matches!(codec::decode(&bad), Err(DecodeError::Base64(_))));
    assert!(matches!(
        verifier.recognize(&bad, "S1"),
        Err(RecognizerError::Decode(DecodeError::Base64(_)))
    ));
}

#[test]
fn test_retraining_overwrites_single_artifact() {
    let models = tempfile::tempdir().unwrap();
    let verifier = Verifier::new(&config(models.path())).unwrap();

    assert!(verifier.train("S1", &[data_uri(&face(20, 60, 60))]));
    let first = std::fs::read(artifact_file(models.path(), "S1")).unwrap();

    assert!(verifier.train("S1", &[data_uri(&face(200, 60, 60)), data_uri(&face(90, 30, 70))]));
    let second = std::fs::read(artifact_file(models.path(), "S1")).unwrap();

    assert_ne!(first, second, "second call must replace the artifact");
    assert_eq!(std::fs::read_dir(models.path()).unwrap().count(), 1);
    assert_eq!(verifier.registry().identities().unwrap(), vec!["S1".to_string()]);
}

#[test]
fn test_training_one_identity_leaves_others_untouched() {
    let models = tempfile::tempdir().unwrap();
    let verifier = Verifier::new(&config(models.path())).unwrap();

    assert!(verifier.train("S2", &[data_uri(&face(70, 40, 40))]));
    let before = std::fs::read(artifact_file(models.path(), "S2")).unwrap();

    assert!(verifier.train("S1", &[data_uri(&face(150, 40, 40))]));
    let after = std::fs::read(artifact_file(models.path(), "S2")).unwrap();
    assert_eq!(before, after);
}

#[test]
fn test_failed_training_keeps_previous_artifact() {
    let models = tempfile::tempdir().unwrap();
    let verifier = Verifier::new(&config(models.path())).unwrap();

    assert!(verifier.train("S1", &[data_uri(&face(33, 48, 48))]));
    let before = std::fs::read(artifact_file(models.path(), "S1")).unwrap();

    let with_bad_image = [
        data_uri(&face(34, 48, 48)),
        RawImage::DataUri("data:image/png;base64,AAAA".into()),
    ];
    assert!(!verifier.train("S1", &with_bad_image));
    assert!(!verifier.train("S1", &[]));

    let after = std::fs::read(artifact_file(models.path(), "S1")).unwrap();
    assert_eq!(before, after);
}

#[test]
fn test_corrupted_artifact_is_inference_error() {
    let models = tempfile::tempdir().unwrap();
    let verifier = Verifier::new(&config(models.path())).unwrap();
    verifier
        .registry()
        .save("S1", &ModelArtifact::from_bytes(b"definitely not weights".to_vec()))
        .unwrap();

    let result = verifier.recognize(&data_uri(&face(1, 20, 20)), "S1");
    assert!(matches!(result, Err(RecognizerError::Inference(_))), "{result:?}");
}

#[test]
fn test_concurrent_training_of_distinct_identities() {
    let models = tempfile::tempdir().unwrap();
    let verifier = Verifier::new(&Config {
        epochs: 3,
        ..config(models.path())
    })
    .unwrap();
    let identities = ["S1", "S2", "S3"];

    std::thread::scope(|s| {
        for (i, id) in identities.iter().enumerate() {
            let verifier = &verifier;
            s.spawn(move || {
                let images = [data_uri(&face(i as u8 * 60, 50, 50))];
                assert!(verifier.train(id, &images), "training {id}");
            });
        }
    });

    for id in identities {
        let artifact = verifier.registry().load(id).unwrap();
        assert!(!artifact.is_empty());
    }
    assert_eq!(verifier.registry().identities().unwrap(), identities.to_vec());
}

#[test]
fn test_negative_pool_is_loaded_from_config() {
    let models = tempfile::tempdir().unwrap();
    let impostors = tempfile::tempdir().unwrap();
    save_png(impostors.path(), "x.png", &face(250, 40, 40));
    save_png(impostors.path(), "y.png", &face(120, 40, 40));

    let verifier = Verifier::new(&Config {
        negative_dir: Some(impostors.path().to_path_buf()),
        ..config(models.path())
    })
    .unwrap();

    let report = verifier
        .trainer()
        .try_train("S1", &[data_uri(&face(3, 40, 40))])
        .unwrap();
    assert_eq!((report.positives, report.negatives), (1, 2));
}

#[test]
fn test_invalid_config_is_rejected() {
    let models = tempfile::tempdir().unwrap();
    let bad = Config {
        match_threshold: 1.5,
        ..config(models.path())
    };
    assert!(Verifier::new(&bad).is_err());
}
