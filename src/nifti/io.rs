//! NIfTI file I/O.
//!
//! - Memory-mapped reading for uncompressed `.nii`
//! - Single-shot libdeflate decode for `.nii.gz`, with a streaming fallback
//!   for multi-member archives or an unreliable ISIZE trailer
//! - Writing always produces little-endian `f32` voxels

use super::header::NiftiHeader;
use super::image::NiftiImage;
use crate::error::{Error, Result};
use flate2::bufread::{GzDecoder, MultiGzDecoder};
use libdeflater::{CompressionLvl, Compressor, DecompressionError, Decompressor};
use memmap2::Mmap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

thread_local! {
    static DECOMPRESSOR: std::cell::RefCell<Decompressor> =
        std::cell::RefCell::new(Decompressor::new());
}

const GZIP_BUFFER_SIZE: usize = 256 * 1024;

#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
fn read_file_with_readahead(path: &Path) -> Result<Vec<u8>> {
    use std::os::unix::io::AsRawFd;

    let file = File::open(path)?;
    let len = file.metadata()?.len() as usize;

    // SAFETY: fd is valid for the lifetime of `file`; fadvise is only a hint.
    unsafe {
        libc::posix_fadvise(
            file.as_raw_fd(),
            0,
            len as libc::off_t,
            libc::POSIX_FADV_SEQUENTIAL,
        );
    }

    let mut buffer = Vec::with_capacity(len);
    BufReader::with_capacity(GZIP_BUFFER_SIZE, file).read_to_end(&mut buffer)?;
    Ok(buffer)
}

#[cfg(not(target_os = "linux"))]
fn read_file_with_readahead(path: &Path) -> Result<Vec<u8>> {
    Ok(std::fs::read(path)?)
}

fn is_gzipped(path: &Path) -> bool {
    path.extension().is_some_and(|e| e == "gz")
}

/// Load a NIfTI image from `.nii` or `.nii.gz`, decoding voxels to `f32`.
#[must_use = "this function returns a loaded image that should be used"]
pub fn load<P: AsRef<Path>>(path: P) -> Result<NiftiImage> {
    let path = path.as_ref();
    if is_gzipped(path) {
        load_gzipped(path)
    } else {
        load_uncompressed(path)
    }
}

#[allow(unsafe_code)]
fn load_uncompressed(path: &Path) -> Result<NiftiImage> {
    let file = File::open(path)?;
    // SAFETY: read-only mapping of a file we just opened; concurrent external
    // writes can yield inconsistent values but not UB in our decode.
    let mmap = unsafe { Mmap::map(&file)? };
    decode_image(&mmap)
}

fn load_gzipped(path: &Path) -> Result<NiftiImage> {
    let compressed = read_file_with_readahead(path)?;
    let (output, used_streaming) = decompress_gzip_with_fallback(&compressed)?;

    match decode_image(&output) {
        Ok(image) => Ok(image),
        // A short single-shot decode means ISIZE lied; retry once streaming.
        Err(_) if !used_streaming => decode_image(&decompress_gzip_streaming(&compressed)?),
        Err(e) => Err(e),
    }
}

fn decode_image(bytes: &[u8]) -> Result<NiftiImage> {
    let header = NiftiHeader::from_bytes(bytes)?;
    let offset = header.vox_offset;
    let payload = bytes.get(offset..).ok_or_else(|| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("vox_offset {offset} beyond end of file ({} bytes)", bytes.len()),
        ))
    })?;
    NiftiImage::from_payload(header, payload)
}

fn estimate_gzip_uncompressed_size(compressed: &[u8]) -> usize {
    // ISIZE (RFC 1952) is the input size mod 2^32 of the last member only.
    if compressed.len() >= 4 {
        let trailer = &compressed[compressed.len() - 4..];
        u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]) as usize
    } else {
        compressed.len() * 4
    }
}

fn decompress_gzip_streaming(compressed: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = MultiGzDecoder::new(BufReader::with_capacity(GZIP_BUFFER_SIZE, compressed));
    let mut output = Vec::with_capacity(estimate_gzip_uncompressed_size(compressed));
    decoder
        .read_to_end(&mut output)
        .map_err(|e| Error::Decompression(format!("gzip stream decode failed: {e}")))?;
    Ok(output)
}

/// Returns the decoded bytes and whether the streaming path was taken.
fn decompress_gzip_with_fallback(compressed: &[u8]) -> Result<(Vec<u8>, bool)> {
    let buffer_size = estimate_gzip_uncompressed_size(compressed).max(NiftiHeader::SIZE);
    let mut output = vec![0u8; buffer_size];

    let result = DECOMPRESSOR.with(|d| d.borrow_mut().gzip_decompress(compressed, &mut output));
    match result {
        Ok(written) => {
            output.truncate(written);
            Ok((output, false))
        }
        Err(DecompressionError::InsufficientSpace) => {
            Ok((decompress_gzip_streaming(compressed)?, true))
        }
        Err(e) => Err(Error::Decompression(e.to_string())),
    }
}

/// Load only the header (fast metadata inspection).
#[allow(unsafe_code)]
pub fn load_header<P: AsRef<Path>>(path: P) -> Result<NiftiHeader> {
    let path = path.as_ref();
    let file = File::open(path)?;
    if is_gzipped(path) {
        let mut decoder = GzDecoder::new(BufReader::new(file));
        let mut header_buf = vec![0u8; NiftiHeader::SIZE];
        decoder.read_exact(&mut header_buf)?;
        NiftiHeader::from_bytes(&header_buf)
    } else {
        // SAFETY: read-only mapping of a file we just opened.
        let mmap = unsafe { Mmap::map(&file)? };
        NiftiHeader::from_bytes(&mmap)
    }
}

/// Save an image as `.nii` or `.nii.gz`, chosen by extension.
pub fn save<P: AsRef<Path>>(image: &NiftiImage, path: P) -> Result<()> {
    let path = path.as_ref();
    let header = image.output_header();

    let data = image.payload_bytes();
    let mut bytes = Vec::with_capacity(header.vox_offset + data.len());
    bytes.extend_from_slice(&header.to_bytes());
    // Zeroed extension flag up to vox_offset.
    bytes.resize(header.vox_offset, 0u8);
    bytes.extend_from_slice(&data);

    if is_gzipped(path) {
        let mut compressor = Compressor::new(CompressionLvl::fastest());
        let mut compressed = vec![0u8; compressor.gzip_compress_bound(bytes.len())];
        let written = compressor
            .gzip_compress(&bytes, &mut compressed)
            .map_err(|e| Error::Io(std::io::Error::other(format!("compression failed: {e:?}"))))?;
        compressed.truncate(written);
        bytes = compressed;
    }

    let mut writer = BufWriter::with_capacity(1024 * 1024, File::create(path)?);
    writer.write_all(&bytes)?;
    writer.flush()?;
    Ok(())
}
