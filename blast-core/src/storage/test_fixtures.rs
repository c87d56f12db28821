//! Test fixtures for storage testing.
//!
//! Provides temporary directories and deterministic payloads for tests
//! across storage and torrent modules.

/// Creates a temporary download directory.
///
/// # Panics
///
/// Panics if temporary directory creation fails.
/// This is acceptable in test fixtures where failures indicate environment issues.
pub fn create_temp_download_dir() -> (tempfile::TempDir, std::path::PathBuf) {
    let temp_dir = tempfile::tempdir().unwrap();
    let downloads_dir = temp_dir.path().join("downloads");
    std::fs::create_dir_all(&downloads_dir).unwrap();
    (temp_dir, downloads_dir)
}

/// Deterministic, non-repeating-per-block byte pattern.
pub fn patterned_bytes(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u32).wrapping_mul(31).wrapping_add(u32::from(seed) * 7 + (i / 251) as u32) as u8)
        .collect()
}
