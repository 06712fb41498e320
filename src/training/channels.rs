//! Which modality tensors feed the model for a given channel count.

use crate::error::{Error, Result};

/// `(modalities, channels) -> modality indices`, in concatenation order.
const SELECTIONS: &[((usize, usize), &[usize])] = &[
    ((4, 4), &[0, 1, 2, 3]),
    ((4, 3), &[0, 2, 3]),
    ((4, 2), &[0, 2]),
    ((4, 1), &[0]),
    ((3, 3), &[0, 1, 2]),
    ((3, 2), &[0, 1]),
    ((3, 1), &[0]),
    ((2, 2), &[0, 1]),
    ((2, 1), &[0]),
    ((1, 1), &[0]),
];

/// Look up the modality indices for a supported combination.
pub fn channel_selection(modalities: usize, channels: usize) -> Result<&'static [usize]> {
    SELECTIONS
        .iter()
        .find(|(key, _)| *key == (modalities, channels))
        .map(|(_, indices)| *indices)
        .ok_or(Error::UnsupportedModalityChannels {
            modalities,
            channels,
        })
}
