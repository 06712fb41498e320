//! End-to-end tests of discovery, sampling, caching and batching.

mod common;

use common::{params, write_tree, FULL};
use ndarray::Array3;
use proptest::prelude::*;
use tempfile::tempdir;
use volseg::data::{read_key, read_manifest, split_index, DataModule, Split};
use volseg::transforms::intensity::foreground_fraction;
use volseg::transforms::AugmentationPipeline;
use volseg::Error;

#[test]
fn test_setup_builds_both_caches() {
    let root = tempdir().unwrap();
    write_tree(root.path(), 5);

    let mut dm = DataModule::new(params(root.path()));
    dm.setup().unwrap();

    assert_eq!(dm.num_subjects(), 5);
    assert_eq!(dm.split_idx(), 4);
    let train = dm.train_dataset().unwrap();
    let val = dm.val_dataset().unwrap();
    assert_eq!(train.len(), 4 * 3);
    assert_eq!(val.len(), 2);
    assert_eq!(train.split(), Split::Train);

    let training = root.path().join("MICCAI_BraTS_2018_Data_Training");
    assert!(training.join("brats2018-list-train-samples-3.txt").is_file());
    assert!(training.join("brats2018-list-val-samples-2.txt").is_file());
    assert!(training.join("generated").join("train_vol_4x4x4").is_dir());

    for i in 0..train.len() {
        let sample = train.get(i).unwrap();
        assert_eq!(sample.modalities.len(), 4);
        for m in &sample.modalities {
            assert_eq!(m.shape(), &[4, 4, 4]);
        }
        assert_eq!(sample.label.dim(), (4, 4, 4));
        assert!(sample.label.iter().all(|&v| [0.0, 1.0, 2.0, 3.0].contains(&v)));
    }
}

#[test]
fn test_crops_meet_foreground_threshold() {
    let root = tempdir().unwrap();
    write_tree(root.path(), 5);
    let mut dm = DataModule::new(params(root.path()));
    dm.setup().unwrap();

    let train = dm.train_dataset().unwrap();
    for i in 0..train.len() {
        let label = train.get(i).unwrap().label;
        assert!(foreground_fraction(label.view()) >= 0.25);
    }
}

#[test]
fn test_existing_manifest_is_reused() {
    let root = tempdir().unwrap();
    write_tree(root.path(), 5);

    let mut first = DataModule::new(params(root.path()));
    first.setup().unwrap();
    let before = first.train_dataset().unwrap().entries().to_vec();

    // A different seed would give different crops if the cache were rebuilt.
    let mut p = params(root.path());
    p.seed = Some(999);
    let mut second = DataModule::new(p);
    second.setup().unwrap();
    assert_eq!(second.train_dataset().unwrap().entries(), before.as_slice());

    let manifest = root
        .path()
        .join("MICCAI_BraTS_2018_Data_Training")
        .join("brats2018-list-train-samples-3.txt");
    assert_eq!(read_manifest(&manifest, 4).unwrap(), before);
}

#[test]
fn test_changed_settings_regenerate_cache() {
    let root = tempdir().unwrap();
    write_tree(root.path(), 5);

    let mut first = DataModule::new(params(root.path()));
    first.setup().unwrap();
    assert_eq!(first.train_dataset().unwrap().len(), 12);

    let mut p = params(root.path());
    p.vol_crop_dim = [2, 2, 2];
    p.split = 0.4;
    let mut second = DataModule::new(p);
    second.setup().unwrap();

    assert_eq!(second.split_idx(), 2);
    let train = second.train_dataset().unwrap();
    assert_eq!(train.len(), 2 * 3);
    assert_eq!(second.val_dataset().unwrap().len(), 3 * 2);
    let sample = train.get(0).unwrap();
    assert_eq!(sample.label.dim(), (2, 2, 2));
    assert!(sample.modalities.iter().all(|m| m.shape() == [2, 2, 2]));

    let manifest = root
        .path()
        .join("MICCAI_BraTS_2018_Data_Training")
        .join("brats2018-list-train-samples-3.txt");
    let key = read_key(&manifest).unwrap().unwrap();
    assert_eq!(key.crop_size, [2, 2, 2]);
    // Subjects sort by path, so HGG comes before LGG.
    assert_eq!(key.subjects, vec!["Brats18_000", "Brats18_002"]);
}

#[test]
fn test_new_subject_invalidates_cache() {
    let root = tempdir().unwrap();
    write_tree(root.path(), 4);
    let mut first = DataModule::new(params(root.path()));
    first.setup().unwrap();
    assert_eq!(first.train_dataset().unwrap().len(), 3 * 3);

    write_tree(root.path(), 5);
    let mut second = DataModule::new(params(root.path()));
    second.setup().unwrap();
    assert_eq!(second.num_subjects(), 5);
    assert_eq!(second.train_dataset().unwrap().len(), 4 * 3);
}

#[test]
fn test_deleted_cache_file_is_corrupt_entry() {
    let root = tempdir().unwrap();
    write_tree(root.path(), 5);
    let mut dm = DataModule::new(params(root.path()));
    dm.setup().unwrap();

    let train = dm.train_dataset().unwrap();
    std::fs::remove_file(&train.entries()[2].modalities[1]).unwrap();
    assert!(matches!(
        train.get(2),
        Err(Error::CorruptCache { index: 2, .. })
    ));
    assert!(train.get(0).is_ok());
}

#[test]
fn test_missing_modality_fails_setup() {
    let root = tempdir().unwrap();
    let dirs = write_tree(root.path(), 3);
    let id = dirs[1].file_name().unwrap().to_string_lossy().into_owned();
    std::fs::remove_file(dirs[1].join(format!("{id}_flair.nii.gz"))).unwrap();

    let mut dm = DataModule::new(params(root.path()));
    match dm.setup() {
        Err(Error::MissingModality { subject, modality }) => {
            assert_eq!(subject, id);
            assert_eq!(modality, "flair");
        }
        other => panic!("expected MissingModality, got {other:?}"),
    }
}

#[test]
fn test_unknown_dataset() {
    let root = tempdir().unwrap();
    let mut p = params(root.path());
    p.dataset = "isles2015".to_string();
    let mut dm = DataModule::new(p);
    assert!(matches!(dm.setup(), Err(Error::DatasetNotFound(name)) if name == "isles2015"));
}

#[test]
fn test_wrong_volume_shape_is_rejected() {
    let root = tempdir().unwrap();
    write_tree(root.path(), 2);
    let mut p = params(root.path());
    p.full_vol_dim = Some([FULL[0], FULL[1], FULL[2] + 1]);
    let mut dm = DataModule::new(p);
    assert!(matches!(dm.setup(), Err(Error::ShapeMismatch(_))));
}

#[test]
fn test_batches_cover_split() {
    let root = tempdir().unwrap();
    write_tree(root.path(), 5);
    let mut p = params(root.path());
    p.augmentation = true;
    let mut dm = DataModule::new(p);
    dm.setup().unwrap();

    let batches: Vec<_> = dm
        .train_batches()
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(batches.iter().map(|b| b.len()).collect::<Vec<_>>(), vec![5, 5, 2]);
    let first = &batches[0];
    assert_eq!(first.inputs.len(), 4);
    assert_eq!(first.inputs[0].dim(), (5, 1, 4, 4, 4));
    assert_eq!(first.target.dim(), (5, 4, 4, 4));

    let val: Vec<_> = dm.val_batches().unwrap().collect::<Result<Vec<_>, _>>().unwrap();
    assert_eq!(val.len(), 1);
    assert_eq!(val[0].len(), 2);
}

#[test]
fn test_split_of_brats_subject_count() {
    assert_eq!(split_index(244, 0.8), 195);
    assert_eq!(244 - split_index(244, 0.8), 49);
}

proptest! {
    #[test]
    fn prop_split_partitions_subjects(total in 0usize..1000, ratio in 0.0f64..=1.0) {
        let idx = split_index(total, ratio);
        prop_assert!(idx <= total);
        let train: Vec<_> = (0..idx).collect();
        let val: Vec<_> = (idx..total).collect();
        prop_assert_eq!(train.len() + val.len(), total);
        prop_assert!(train.iter().all(|t| !val.contains(t)));
    }

    #[test]
    fn prop_augmentation_preserves_shape_and_labels(
        d in 2usize..10,
        h in 2usize..10,
        w in 2usize..10,
        seed in any::<u64>(),
    ) {
        let pipeline = AugmentationPipeline::builder().prob(1.0).build();
        let modalities = vec![Array3::from_elem((d, h, w), 1.0f32); 2];
        let label = Array3::from_shape_fn((d, h, w), |(i, j, k)| ((i + j + k) % 4) as f32);

        let (out, out_label) = pipeline.apply(modalities, label, Some(seed)).unwrap();
        prop_assert_eq!(out.len(), 2);
        prop_assert!(out.iter().all(|m| m.dim() == (d, h, w)));
        prop_assert_eq!(out_label.dim(), (d, h, w));
        prop_assert!(out_label.iter().all(|v| [0.0, 1.0, 2.0, 3.0].contains(v)));
    }
}
