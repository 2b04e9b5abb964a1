//! Pipeline-cache persistence.
//!
//! On-disk format: `[header][opaque driver blob]`. The header records a
//! magic value, the blob size, an FNV-1a content hash, and the device
//! identity (vendor/device/driver plus pipeline-cache UUID). A blob is
//! only fed back to the driver when every header field checks out against
//! the live device; any mismatch (missing file, truncation, corruption, a
//! different GPU) falls back to an empty cache instead of failing the
//! caller. Saving writes a temporary file and renames it over the
//! destination so a crash never leaves a half-written cache behind.

use crate::error::Result;
use crate::hash::fnv1a_64;
use ash::vk;
use std::fs;
use std::io::{Read, Write};
use std::path::Path;

const MAGIC: u32 = u32::from_le_bytes(*b"KPC1");
const HEADER_SIZE: usize = 48;

/// Identity of the device a cache blob belongs to, captured from the
/// physical-device properties the startup layer queried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceIdent {
    pub vendor_id: u32,
    pub device_id: u32,
    pub driver_version: u32,
    pub cache_uuid: [u8; vk::UUID_SIZE],
}

impl DeviceIdent {
    #[must_use]
    pub fn from_properties(props: &vk::PhysicalDeviceProperties) -> Self {
        Self {
            vendor_id: props.vendor_id,
            device_id: props.device_id,
            driver_version: props.driver_version,
            cache_uuid: props.pipeline_cache_uuid,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Header {
    magic: u32,
    data_size: u32,
    data_hash: u64,
    vendor_id: u32,
    device_id: u32,
    driver_version: u32,
    /// Pointer width of the writing process; a 32-bit blob is useless to a
    /// 64-bit driver instance and vice versa.
    driver_abi: u32,
    cache_uuid: [u8; vk::UUID_SIZE],
}

impl Header {
    fn for_blob(ident: &DeviceIdent, blob: &[u8]) -> Self {
        Self {
            magic: MAGIC,
            data_size: blob.len() as u32,
            data_hash: fnv1a_64(blob),
            vendor_id: ident.vendor_id,
            device_id: ident.device_id,
            driver_version: ident.driver_version,
            driver_abi: std::mem::size_of::<usize>() as u32,
            cache_uuid: ident.cache_uuid,
        }
    }

    fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&self.magic.to_le_bytes());
        out[4..8].copy_from_slice(&self.data_size.to_le_bytes());
        out[8..16].copy_from_slice(&self.data_hash.to_le_bytes());
        out[16..20].copy_from_slice(&self.vendor_id.to_le_bytes());
        out[20..24].copy_from_slice(&self.device_id.to_le_bytes());
        out[24..28].copy_from_slice(&self.driver_version.to_le_bytes());
        out[28..32].copy_from_slice(&self.driver_abi.to_le_bytes());
        out[32..48].copy_from_slice(&self.cache_uuid);
        out
    }

    fn decode(bytes: &[u8; HEADER_SIZE]) -> Self {
        let u32_at = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        let u64_at = |i: usize| {
            u64::from_le_bytes([
                bytes[i],
                bytes[i + 1],
                bytes[i + 2],
                bytes[i + 3],
                bytes[i + 4],
                bytes[i + 5],
                bytes[i + 6],
                bytes[i + 7],
            ])
        };
        let mut cache_uuid = [0u8; vk::UUID_SIZE];
        cache_uuid.copy_from_slice(&bytes[32..48]);
        Self {
            magic: u32_at(0),
            data_size: u32_at(4),
            data_hash: u64_at(8),
            vendor_id: u32_at(16),
            device_id: u32_at(20),
            driver_version: u32_at(24),
            driver_abi: u32_at(28),
            cache_uuid,
        }
    }

    fn matches(&self, ident: &DeviceIdent) -> bool {
        self.magic == MAGIC
            && self.driver_abi == std::mem::size_of::<usize>() as u32
            && self.vendor_id == ident.vendor_id
            && self.device_id == ident.device_id
            && self.driver_version == ident.driver_version
            && self.cache_uuid == ident.cache_uuid
    }
}

/// Read and validate a cache blob. Returns `None` (with a log line) on any
/// integrity or identity failure.
#[must_use]
pub fn read_validated_blob(path: &Path, ident: &DeviceIdent) -> Option<Vec<u8>> {
    let mut file = match fs::File::open(path) {
        Ok(f) => f,
        Err(_) => {
            tracing::debug!(path = %path.display(), "no pipeline cache file");
            return None;
        }
    };

    let mut header_bytes = [0u8; HEADER_SIZE];
    if file.read_exact(&mut header_bytes).is_err() {
        tracing::warn!(path = %path.display(), "pipeline cache header truncated");
        return None;
    }

    let header = Header::decode(&header_bytes);
    if !header.matches(ident) {
        tracing::warn!(path = %path.display(), "pipeline cache is for another device, ignoring");
        return None;
    }

    // data_size has not been hash-checked yet, so validate it against the
    // actual file length before sizing the allocation by it.
    let file_len = match file.metadata() {
        Ok(meta) => meta.len(),
        Err(_) => {
            tracing::warn!(path = %path.display(), "pipeline cache file unreadable");
            return None;
        }
    };
    if file_len != HEADER_SIZE as u64 + u64::from(header.data_size) {
        tracing::warn!(path = %path.display(), "pipeline cache length field mismatch, ignoring");
        return None;
    }

    let mut blob = vec![0u8; header.data_size as usize];
    if file.read_exact(&mut blob).is_err() {
        tracing::warn!(path = %path.display(), "pipeline cache blob truncated");
        return None;
    }

    if fnv1a_64(&blob) != header.data_hash {
        tracing::warn!(path = %path.display(), "pipeline cache hash mismatch, ignoring");
        return None;
    }

    Some(blob)
}

/// Write `[header][blob]` via a temporary file and an atomic rename.
pub fn write_blob(path: &Path, ident: &DeviceIdent, blob: &[u8]) -> std::io::Result<()> {
    let header = Header::for_blob(ident, blob);

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = std::path::PathBuf::from(tmp);

    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&header.encode())?;
        file.write_all(blob)?;
    }
    fs::rename(&tmp, path)
}

/// Create a `vk::PipelineCache`, seeded from `path` when the file is valid
/// for this device, empty otherwise.
///
/// # Safety
/// The device must be valid and `ident` must describe its physical device.
pub unsafe fn load_or_create(
    device: &ash::Device,
    ident: &DeviceIdent,
    path: &Path,
) -> Result<vk::PipelineCache> {
    if let Some(blob) = read_validated_blob(path, ident) {
        let info = vk::PipelineCacheCreateInfo::default().initial_data(&blob);
        match unsafe { device.create_pipeline_cache(&info, None) } {
            Ok(cache) => {
                tracing::info!(path = %path.display(), bytes = blob.len(), "loaded pipeline cache");
                return Ok(cache);
            }
            Err(e) => {
                // Valid-looking file the driver still rejects; start over.
                tracing::warn!(?e, "driver rejected pipeline cache blob, starting empty");
            }
        }
    }

    let info = vk::PipelineCacheCreateInfo::default();
    let cache = unsafe { device.create_pipeline_cache(&info, None)? };
    Ok(cache)
}

/// Persist the cache blob to `path`. Empty blobs are skipped.
///
/// # Safety
/// The device and cache must be valid and `ident` must describe the
/// device's physical device.
pub unsafe fn save(
    device: &ash::Device,
    ident: &DeviceIdent,
    cache: vk::PipelineCache,
    path: &Path,
) -> Result<()> {
    let blob = unsafe { device.get_pipeline_cache_data(cache)? };
    if blob.is_empty() {
        return Ok(());
    }

    write_blob(path, ident, &blob)?;
    tracing::info!(path = %path.display(), bytes = blob.len(), "saved pipeline cache");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn ident() -> DeviceIdent {
        DeviceIdent {
            vendor_id: 0x10de,
            device_id: 0x2684,
            driver_version: 0x2104_0000,
            cache_uuid: *b"0123456789abcdef",
        }
    }

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("karst-{}-{name}.bin", std::process::id()))
    }

    #[test]
    fn header_roundtrips() {
        let header = Header::for_blob(&ident(), b"some driver blob");
        let decoded = Header::decode(&header.encode());
        assert_eq!(header, decoded);
        assert!(decoded.matches(&ident()));
    }

    #[test]
    fn header_rejects_bad_magic() {
        let mut bytes = Header::for_blob(&ident(), b"x").encode();
        bytes[0] ^= 0xff;
        assert!(!Header::decode(&bytes).matches(&ident()));
    }

    #[test]
    fn header_rejects_foreign_device() {
        let header = Header::for_blob(&ident(), b"x");

        let mut other = ident();
        other.device_id += 1;
        assert!(!header.matches(&other));

        let mut other = ident();
        other.vendor_id = 0x1002;
        assert!(!header.matches(&other));

        let mut other = ident();
        other.cache_uuid[0] ^= 0xff;
        assert!(!header.matches(&other));

        let mut other = ident();
        other.driver_version += 1;
        assert!(!header.matches(&other));
    }

    #[test]
    fn blob_roundtrips_on_same_device() {
        let path = temp_path("roundtrip");
        let blob = vec![7u8; 1024];
        write_blob(&path, &ident(), &blob).unwrap();
        assert_eq!(read_validated_blob(&path, &ident()), Some(blob));
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn foreign_device_falls_back_to_none() {
        let path = temp_path("foreign");
        write_blob(&path, &ident(), b"blob for gpu A").unwrap();
        let mut other = ident();
        other.cache_uuid = *b"fedcba9876543210";
        assert_eq!(read_validated_blob(&path, &other), None);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn corrupted_blob_is_rejected() {
        let path = temp_path("corrupt");
        write_blob(&path, &ident(), &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        let mut raw = fs::read(&path).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        fs::write(&path, &raw).unwrap();
        assert_eq!(read_validated_blob(&path, &ident()), None);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn truncated_file_is_rejected() {
        let path = temp_path("truncated");
        write_blob(&path, &ident(), &[9u8; 64]).unwrap();
        let raw = fs::read(&path).unwrap();
        fs::write(&path, &raw[..HEADER_SIZE + 10]).unwrap();
        assert_eq!(read_validated_blob(&path, &ident()), None);

        // Even the header alone can be short.
        fs::write(&path, &raw[..10]).unwrap();
        assert_eq!(read_validated_blob(&path, &ident()), None);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn corrupted_length_field_is_rejected_without_reading() {
        let path = temp_path("bad-length");
        write_blob(&path, &ident(), &[3u8; 32]).unwrap();
        let mut raw = fs::read(&path).unwrap();
        // Make the header claim a multi-gigabyte blob the file cannot hold.
        raw[4..8].copy_from_slice(&u32::MAX.to_le_bytes());
        fs::write(&path, &raw).unwrap();
        assert_eq!(read_validated_blob(&path, &ident()), None);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let path = temp_path("missing-never-created");
        assert_eq!(read_validated_blob(&path, &ident()), None);
    }

    #[test]
    fn save_leaves_no_temp_file() {
        let path = temp_path("atomic");
        write_blob(&path, &ident(), b"payload").unwrap();
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        assert!(!PathBuf::from(tmp).exists());
        let _ = fs::remove_file(&path);
    }
}
