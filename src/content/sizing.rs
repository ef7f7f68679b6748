//! Space accounting for pre-flight checks.

use std::path::Path;

use super::cache::is_cached;
use super::descriptor::ContentDescriptor;

/// Extraction briefly holds archive and expanded copy side by side.
pub const DUPLICATION_MARGIN_RATIO: u64 = 10;
pub const DUPLICATION_MARGIN_CAP: u64 = 2 << 30;

/// Bytes still to be downloaded (entries not already in the cache).
pub fn required_download_bytes(descriptors: &[ContentDescriptor], cache_dir: &Path) -> u64 {
    descriptors
        .iter()
        .filter(|d| !is_cached(d, cache_dir, false))
        .map(ContentDescriptor::archive_size)
        .sum()
}

/// Bytes the content occupies once placed, margin included.
pub fn required_expanded_bytes(descriptors: &[ContentDescriptor]) -> u64 {
    let total: u64 = descriptors
        .iter()
        .map(ContentDescriptor::expanded_size)
        .sum();
    total + duplication_margin(total)
}

/// The greater of 10% of `total` and 2 GiB; nothing for no content.
pub fn duplication_margin(total: u64) -> u64 {
    if total == 0 {
        return 0;
    }
    (total / DUPLICATION_MARGIN_RATIO).max(DUPLICATION_MARGIN_CAP)
}
