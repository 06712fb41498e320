//! In-memory NIfTI image: header plus voxels decoded to `f32`.

use super::header::{DataType, NiftiHeader};
use crate::error::{Error, Result};
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use half::{bf16, f16};
use ndarray::{ArrayD, IxDyn, ShapeBuilder};

/// A decoded NIfTI image.
///
/// Voxels are held in Fortran order, matching the on-disk layout, so axis 0
/// is the fastest-varying `i` index.
#[derive(Debug, Clone)]
pub struct NiftiImage {
    header: NiftiHeader,
    data: ArrayD<f32>,
}

impl NiftiImage {
    /// Build an image from an array and an affine. The header is derived
    /// from the array shape and always describes `f32` voxels.
    pub fn from_array(data: ArrayD<f32>, affine: [[f32; 4]; 4]) -> Self {
        let mut header = NiftiHeader::default();
        header.ndim = data.ndim() as u8;
        header.dim = [1; 7];
        for (d, &extent) in header.dim.iter_mut().zip(data.shape()) {
            *d = extent;
        }
        header.set_affine(affine);
        Self { header, data }
    }

    /// Decode the voxel payload described by `header` from `bytes`.
    pub(crate) fn from_payload(header: NiftiHeader, bytes: &[u8]) -> Result<Self> {
        let expected = header.data_size();
        if bytes.len() < expected {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "file truncated: {} voxel bytes present, {} required",
                    bytes.len(),
                    expected
                ),
            )));
        }
        let payload = &bytes[..expected];

        let mut values = if header.is_little_endian() {
            decode_voxels::<LittleEndian>(header.datatype, payload)
        } else {
            decode_voxels::<BigEndian>(header.datatype, payload)
        };

        let (slope, inter) = (header.scl_slope, header.scl_inter);
        if (slope != 0.0 && slope != 1.0) || inter != 0.0 {
            let slope = if slope == 0.0 { 1.0 } else { slope };
            for v in &mut values {
                *v = *v * slope + inter;
            }
        }

        let data = ArrayD::from_shape_vec(IxDyn(&header.shape()).f(), values)
            .map_err(|e| Error::InvalidDimensions(format!("voxel payload/shape mismatch: {e}")))?;
        Ok(Self { header, data })
    }

    /// Header as parsed (or derived).
    pub fn header(&self) -> &NiftiHeader {
        &self.header
    }

    /// Voxel data.
    pub fn data(&self) -> &ArrayD<f32> {
        &self.data
    }

    /// Consume the image, keeping only the voxels.
    pub fn into_data(self) -> ArrayD<f32> {
        self.data
    }

    /// Array shape.
    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    /// Voxel-to-world transform.
    pub fn affine(&self) -> [[f32; 4]; 4] {
        self.header.affine()
    }

    /// Serialize voxels as little-endian `f32` in Fortran order.
    pub(crate) fn payload_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.data.len() * 4];
        // Transposed logical order is Fortran order of the original.
        for (chunk, &v) in out.chunks_exact_mut(4).zip(self.data.t().iter()) {
            LittleEndian::write_f32(chunk, v);
        }
        out
    }

    /// Header to write alongside [`Self::payload_bytes`].
    pub(crate) fn output_header(&self) -> NiftiHeader {
        let mut header = self.header.clone();
        header.datatype = DataType::Float32;
        header.scl_slope = 1.0;
        header.scl_inter = 0.0;
        header.vox_offset = 352;
        header.little_endian = true;
        header
    }
}

fn decode_voxels<E: ByteOrder>(datatype: DataType, bytes: &[u8]) -> Vec<f32> {
    let n = datatype.byte_size();
    let chunks = bytes.chunks_exact(n);
    match datatype {
        DataType::UInt8 => bytes.iter().map(|&b| f32::from(b)).collect(),
        DataType::Int8 => bytes.iter().map(|&b| f32::from(b as i8)).collect(),
        DataType::Int16 => chunks.map(|c| f32::from(E::read_i16(c))).collect(),
        DataType::UInt16 => chunks.map(|c| f32::from(E::read_u16(c))).collect(),
        DataType::Int32 => chunks.map(|c| E::read_i32(c) as f32).collect(),
        DataType::UInt32 => chunks.map(|c| E::read_u32(c) as f32).collect(),
        DataType::Int64 => chunks.map(|c| E::read_i64(c) as f32).collect(),
        DataType::UInt64 => chunks.map(|c| E::read_u64(c) as f32).collect(),
        DataType::Float16 => chunks
            .map(|c| f16::from_bits(E::read_u16(c)).to_f32())
            .collect(),
        DataType::BFloat16 => chunks
            .map(|c| bf16::from_bits(E::read_u16(c)).to_f32())
            .collect(),
        DataType::Float32 => chunks.map(E::read_f32).collect(),
        DataType::Float64 => chunks.map(|c| E::read_f64(c) as f32).collect(),
    }
}
