//! NIfTI-1 header parsing and serialization.
//!
//! Reads both byte orders; always writes little endian. Only the fields the
//! sampling pipeline needs survive a round trip (geometry, voxel type,
//! intensity scaling and the qform/sform orientation).

use crate::error::{Error, Result};
use byteorder::{BigEndian, ByteOrder, LittleEndian};

/// Byte offsets of the NIfTI-1 fields we read or write.
mod offsets {
    pub const SIZEOF_HDR: usize = 0;
    pub const DIM: usize = 40;
    pub const DATATYPE: usize = 70;
    pub const BITPIX: usize = 72;
    pub const PIXDIM: usize = 76;
    pub const VOX_OFFSET: usize = 108;
    pub const SCL_SLOPE: usize = 112;
    pub const SCL_INTER: usize = 116;
    pub const XYZT_UNITS: usize = 123;
    pub const DESCRIP: usize = 148;
    pub const QFORM_CODE: usize = 252;
    pub const SFORM_CODE: usize = 254;
    pub const QUATERN_B: usize = 256;
    pub const QOFFSET_X: usize = 268;
    pub const SROW_X: usize = 280;
    pub const SROW_Y: usize = 296;
    pub const SROW_Z: usize = 312;
    pub const MAGIC: usize = 344;
}

/// Voxel storage types understood by the loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum DataType {
    /// Unsigned 8-bit integer
    UInt8 = 2,
    /// Signed 16-bit integer
    Int16 = 4,
    /// Signed 32-bit integer
    Int32 = 8,
    /// 32-bit float
    Float32 = 16,
    /// 64-bit float
    Float64 = 64,
    /// Signed 8-bit integer
    Int8 = 256,
    /// Unsigned 16-bit integer
    UInt16 = 512,
    /// Unsigned 32-bit integer
    UInt32 = 768,
    /// Signed 64-bit integer
    Int64 = 1024,
    /// Unsigned 64-bit integer
    UInt64 = 1280,
    /// IEEE half precision
    Float16 = 16384,
    /// bfloat16
    BFloat16 = 16385,
}

impl DataType {
    /// Parse a header datatype code.
    pub fn from_code(code: i16) -> Result<Self> {
        Ok(match code {
            2 => Self::UInt8,
            4 => Self::Int16,
            8 => Self::Int32,
            16 => Self::Float32,
            64 => Self::Float64,
            256 => Self::Int8,
            512 => Self::UInt16,
            768 => Self::UInt32,
            1024 => Self::Int64,
            1280 => Self::UInt64,
            16384 => Self::Float16,
            16385 => Self::BFloat16,
            _ => return Err(Error::UnsupportedDataType(code)),
        })
    }

    /// Bytes per voxel.
    pub const fn byte_size(self) -> usize {
        match self {
            Self::UInt8 | Self::Int8 => 1,
            Self::Int16 | Self::UInt16 | Self::Float16 | Self::BFloat16 => 2,
            Self::Int32 | Self::UInt32 | Self::Float32 => 4,
            Self::Int64 | Self::UInt64 | Self::Float64 => 8,
        }
    }
}

/// Parsed NIfTI-1 header.
#[derive(Debug, Clone, PartialEq)]
pub struct NiftiHeader {
    /// Number of used dimensions (1-7).
    pub ndim: u8,
    /// Extent of each dimension; entries past `ndim` are 1.
    pub dim: [usize; 7],
    /// Voxel storage type.
    pub datatype: DataType,
    /// qfac at index 0, voxel spacing at 1..=ndim.
    pub pixdim: [f32; 8],
    /// Byte offset of the voxel data.
    pub vox_offset: usize,
    /// Intensity scale; 0 means "no scaling".
    pub scl_slope: f32,
    /// Intensity offset.
    pub scl_inter: f32,
    /// Packed spatial/temporal unit codes.
    pub xyzt_units: u8,
    /// Free-text description (max 79 bytes on disk).
    pub descrip: String,
    /// qform transform code.
    pub qform_code: i16,
    /// sform transform code.
    pub sform_code: i16,
    /// Quaternion b, c, d.
    pub quatern: [f32; 3],
    /// qform translation.
    pub qoffset: [f32; 3],
    /// sform rows.
    pub srow: [[f32; 4]; 3],
    pub(crate) little_endian: bool,
}

impl Default for NiftiHeader {
    fn default() -> Self {
        Self {
            ndim: 3,
            dim: [1; 7],
            datatype: DataType::Float32,
            pixdim: [1.0; 8],
            vox_offset: 352,
            scl_slope: 1.0,
            scl_inter: 0.0,
            xyzt_units: 2, // millimetres
            descrip: String::new(),
            qform_code: 0,
            sform_code: 1,
            quatern: [0.0; 3],
            qoffset: [0.0; 3],
            srow: [
                [1.0, 0.0, 0.0, 0.0],
                [0.0, 1.0, 0.0, 0.0],
                [0.0, 0.0, 1.0, 0.0],
            ],
            little_endian: true,
        }
    }
}

impl NiftiHeader {
    /// On-disk header size.
    pub const SIZE: usize = 348;

    /// Parse a header, detecting byte order from `sizeof_hdr`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("header too short: {} bytes, need {}", bytes.len(), Self::SIZE),
            )));
        }

        if LittleEndian::read_i32(&bytes[offsets::SIZEOF_HDR..]) == 348 {
            Self::parse::<LittleEndian>(bytes, true)
        } else if BigEndian::read_i32(&bytes[offsets::SIZEOF_HDR..]) == 348 {
            Self::parse::<BigEndian>(bytes, false)
        } else {
            Err(Error::InvalidMagic([bytes[0], bytes[1], bytes[2], bytes[3]]))
        }
    }

    #[allow(clippy::wildcard_imports)]
    fn parse<E: ByteOrder>(bytes: &[u8], little_endian: bool) -> Result<Self> {
        use offsets::*;

        let magic = &bytes[MAGIC..MAGIC + 4];
        if magic != b"n+1\0" && magic != b"ni1\0" {
            return Err(Error::InvalidMagic([magic[0], magic[1], magic[2], magic[3]]));
        }

        let ndim = E::read_i16(&bytes[DIM..]);
        if !(1..=7).contains(&ndim) {
            return Err(Error::InvalidDimensions(format!(
                "ndim must be 1..=7, got {ndim}"
            )));
        }

        let mut dim = [1usize; 7];
        for (i, d) in dim.iter_mut().enumerate().take(ndim as usize) {
            let raw = E::read_i16(&bytes[DIM + 2 + i * 2..]);
            if raw <= 0 {
                return Err(Error::InvalidDimensions(format!(
                    "dimension {i} must be positive, got {raw}"
                )));
            }
            *d = raw as usize;
        }

        let datatype = DataType::from_code(E::read_i16(&bytes[DATATYPE..]))?;
        let bitpix = E::read_i16(&bytes[BITPIX..]);
        if bitpix as usize != datatype.byte_size() * 8 {
            return Err(Error::InvalidDimensions(format!(
                "bitpix {bitpix} does not match datatype {datatype:?}"
            )));
        }

        let read_f32s = |start: usize, out: &mut [f32]| {
            for (i, v) in out.iter_mut().enumerate() {
                *v = E::read_f32(&bytes[start + i * 4..]);
            }
        };

        let mut pixdim = [0.0f32; 8];
        read_f32s(PIXDIM, &mut pixdim);
        let mut quatern = [0.0f32; 3];
        read_f32s(QUATERN_B, &mut quatern);
        let mut qoffset = [0.0f32; 3];
        read_f32s(QOFFSET_X, &mut qoffset);
        let mut srow = [[0.0f32; 4]; 3];
        for (row, start) in srow.iter_mut().zip([SROW_X, SROW_Y, SROW_Z]) {
            read_f32s(start, row);
        }

        let vox_offset = E::read_f32(&bytes[VOX_OFFSET..]);
        if !vox_offset.is_finite() || vox_offset.fract() != 0.0 || vox_offset < Self::SIZE as f32 {
            return Err(Error::InvalidDimensions(format!(
                "vox_offset must be an integer >= {}, got {vox_offset}",
                Self::SIZE
            )));
        }

        let descrip = String::from_utf8_lossy(&bytes[DESCRIP..DESCRIP + 80])
            .trim_end_matches('\0')
            .to_string();

        Ok(Self {
            ndim: ndim as u8,
            dim,
            datatype,
            pixdim,
            vox_offset: vox_offset as usize,
            scl_slope: E::read_f32(&bytes[SCL_SLOPE..]),
            scl_inter: E::read_f32(&bytes[SCL_INTER..]),
            xyzt_units: bytes[XYZT_UNITS],
            descrip,
            qform_code: E::read_i16(&bytes[QFORM_CODE..]),
            sform_code: E::read_i16(&bytes[SFORM_CODE..]),
            quatern,
            qoffset,
            srow,
            little_endian,
        })
    }

    /// Serialize as a little-endian NIfTI-1 header (348 bytes).
    #[allow(clippy::wildcard_imports)]
    pub fn to_bytes(&self) -> Vec<u8> {
        use offsets::*;

        let mut buf = vec![0u8; Self::SIZE];
        LittleEndian::write_i32(&mut buf[SIZEOF_HDR..], Self::SIZE as i32);

        LittleEndian::write_i16(&mut buf[DIM..], i16::from(self.ndim));
        for (i, &d) in self.dim.iter().enumerate() {
            let clamped = d.min(i16::MAX as usize) as i16;
            LittleEndian::write_i16(&mut buf[DIM + 2 + i * 2..], clamped);
        }
        LittleEndian::write_i16(&mut buf[DATATYPE..], self.datatype as i16);
        LittleEndian::write_i16(&mut buf[BITPIX..], (self.datatype.byte_size() * 8) as i16);

        let write_f32s = |buf: &mut [u8], start: usize, values: &[f32]| {
            for (i, &v) in values.iter().enumerate() {
                LittleEndian::write_f32(&mut buf[start + i * 4..], v);
            }
        };
        write_f32s(&mut buf, PIXDIM, &self.pixdim);
        write_f32s(&mut buf, VOX_OFFSET, &[self.vox_offset as f32]);
        write_f32s(&mut buf, SCL_SLOPE, &[self.scl_slope, self.scl_inter]);
        write_f32s(&mut buf, QUATERN_B, &self.quatern);
        write_f32s(&mut buf, QOFFSET_X, &self.qoffset);
        for (row, start) in self.srow.iter().zip([SROW_X, SROW_Y, SROW_Z]) {
            write_f32s(&mut buf, start, row);
        }

        buf[XYZT_UNITS] = self.xyzt_units;
        let descrip = self.descrip.as_bytes();
        let len = descrip.len().min(79);
        buf[DESCRIP..DESCRIP + len].copy_from_slice(&descrip[..len]);

        LittleEndian::write_i16(&mut buf[QFORM_CODE..], self.qform_code);
        LittleEndian::write_i16(&mut buf[SFORM_CODE..], self.sform_code);
        buf[MAGIC..MAGIC + 4].copy_from_slice(b"n+1\0");
        buf
    }

    /// Spatial shape (first `ndim` extents).
    pub fn shape(&self) -> Vec<usize> {
        self.dim[..self.ndim as usize].to_vec()
    }

    /// Number of voxels.
    pub fn num_voxels(&self) -> usize {
        self.dim[..self.ndim as usize].iter().product()
    }

    /// Size of the voxel payload in bytes.
    pub fn data_size(&self) -> usize {
        self.num_voxels() * self.datatype.byte_size()
    }

    /// Whether the voxel payload is little endian.
    pub fn is_little_endian(&self) -> bool {
        self.little_endian
    }

    /// Voxel-to-world affine: sform if present, else qform, else scaled identity.
    pub fn affine(&self) -> [[f32; 4]; 4] {
        if self.sform_code > 0 {
            [self.srow[0], self.srow[1], self.srow[2], [0.0, 0.0, 0.0, 1.0]]
        } else if self.qform_code > 0 {
            self.qform_affine()
        } else {
            [
                [self.pixdim[1], 0.0, 0.0, 0.0],
                [0.0, self.pixdim[2], 0.0, 0.0],
                [0.0, 0.0, self.pixdim[3], 0.0],
                [0.0, 0.0, 0.0, 1.0],
            ]
        }
    }

    /// Store `affine` as the sform and derive voxel spacing from its columns.
    pub fn set_affine(&mut self, affine: [[f32; 4]; 4]) {
        self.srow = [affine[0], affine[1], affine[2]];
        self.sform_code = 1;
        for axis in 0..3 {
            let norm = (0..3).map(|r| affine[r][axis].powi(2)).sum::<f32>().sqrt();
            // Degenerate columns would fail the spacing check on reload.
            self.pixdim[axis + 1] = if norm > 0.0 { norm } else { 1.0 };
        }
    }

    #[allow(clippy::many_single_char_names)]
    fn qform_affine(&self) -> [[f32; 4]; 4] {
        let [b, c, d] = self.quatern;
        let a = (1.0 - b * b - c * c - d * d).max(0.0).sqrt();
        let qfac = if self.pixdim[0] < 0.0 { -1.0 } else { 1.0 };
        let (i, j, k) = (self.pixdim[1], self.pixdim[2], self.pixdim[3] * qfac);
        [
            [
                (a * a + b * b - c * c - d * d) * i,
                2.0 * (b * c - a * d) * j,
                2.0 * (b * d + a * c) * k,
                self.qoffset[0],
            ],
            [
                2.0 * (b * c + a * d) * i,
                (a * a - b * b + c * c - d * d) * j,
                2.0 * (c * d - a * b) * k,
                self.qoffset[1],
            ],
            [
                2.0 * (b * d - a * c) * i,
                2.0 * (c * d + a * b) * j,
                (a * a - b * b - c * c + d * d) * k,
                self.qoffset[2],
            ],
            [0.0, 0.0, 0.0, 1.0],
        ]
    }
}
