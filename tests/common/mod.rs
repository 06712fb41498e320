//! Synthetic BraTS-style trees for integration tests.

#![allow(dead_code)]

use ndarray::Array3;
use std::path::{Path, PathBuf};
use volseg::config::DataParams;
use volseg::transforms::Normalization;
use volseg::volume::{save_volume, IDENTITY_AFFINE};

pub const MODALITIES: [&str; 4] = ["t1", "t1ce", "t2", "flair"];
pub const FULL: [usize; 3] = [8, 8, 8];

/// Write `subjects` subjects split over HGG/LGG. The label has foreground
/// (values 1, 2 and 4) in the lower half of the first axis.
pub fn write_tree(root: &Path, subjects: usize) -> Vec<PathBuf> {
    let training = root.join("MICCAI_BraTS_2018_Data_Training");
    let mut dirs = Vec::new();
    for s in 0..subjects {
        let group = if s % 2 == 0 { "HGG" } else { "LGG" };
        let id = format!("Brats18_{s:03}");
        let dir = training.join(group).join(&id);
        std::fs::create_dir_all(&dir).unwrap();

        for (m, key) in MODALITIES.iter().enumerate() {
            let data = Array3::from_shape_fn((FULL[0], FULL[1], FULL[2]), |(i, j, k)| {
                (1 + m * 100 + s * 7 + i * 3 + j + k) as f32
            });
            save_volume(dir.join(format!("{id}_{key}.nii.gz")), data.view(), IDENTITY_AFFINE)
                .unwrap();
        }
        let label = Array3::from_shape_fn((FULL[0], FULL[1], FULL[2]), |(i, j, _)| {
            if i < FULL[0] / 2 {
                [1.0, 2.0, 4.0][j % 3]
            } else {
                0.0
            }
        });
        save_volume(dir.join(format!("{id}_seg.nii.gz")), label.view(), IDENTITY_AFFINE).unwrap();
        dirs.push(dir);
    }
    dirs
}

pub fn params(root: &Path) -> DataParams {
    DataParams {
        data_path: root.to_path_buf(),
        dataset: "brats2018".to_string(),
        classes: 4,
        vol_crop_dim: [4, 4, 4],
        train_batch_size: 5,
        num_workers: 0,
        split: 0.8,
        train_samples: 3,
        val_samples: 2,
        threshold: 0.25,
        normalization: Normalization::FullVolumeMean,
        augmentation: false,
        max_retries: 100,
        force_regenerate: false,
        full_vol_dim: Some(FULL),
        seed: Some(11),
    }
}
