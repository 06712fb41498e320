//! Dataset assembly: subject discovery, sub-volume caching, lazy loading and
//! batching.

pub mod batch;
pub mod dataset;
pub mod manifest;
pub mod module;
pub mod sampler;
pub mod subjects;

pub use batch::{collate, Batch, BatchIter};
pub use dataset::{Sample, Split, SubVolumeDataset};
pub use manifest::{
    key_path, manifest_name, read_key, read_manifest, write_key, write_manifest, CacheEntry,
    ManifestKey,
};
pub use module::{split_index, DataModule};
pub use sampler::{choose_crop, SamplerConfig, SubVolumeSampler};
pub use subjects::{resolve_layout, DatasetLayout, SubjectRecord, BRATS2018};
