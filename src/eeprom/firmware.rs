//! Pluggable SII firmware overrides.
//!
//! A loader can short-circuit the word-by-word EEPROM read during scan by providing a complete
//! image for a given device identity, e.g. from a file shipped alongside the application.

use alloc::vec::Vec;

/// A source of complete SII images keyed by vendor and product.
pub trait FirmwareLoader {
    /// Return the raw SII image for the given identity, or `None` to fall through to the
    /// device read.
    fn load(&self, vendor_id: u32, product_code: u32) -> Option<Vec<u8>>;
}

/// A [`FirmwareLoader`] reading `sii-<vendor>-<product>.bin` files from a directory, with both
/// ids formatted as 8 digit lowercase hex.
///
/// For example, the image for vendor `0x0000000b`, product `0x00001234` is looked up at
/// `<root>/sii-0000000b-00001234.bin`.
#[cfg(feature = "std")]
#[derive(Debug, Clone)]
pub struct SiiFirmwareDir {
    root: std::path::PathBuf,
}

#[cfg(feature = "std")]
impl SiiFirmwareDir {
    /// Create a loader rooted at `root`.
    pub fn new(root: impl Into<std::path::PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[cfg(feature = "std")]
impl FirmwareLoader for SiiFirmwareDir {
    fn load(&self, vendor_id: u32, product_code: u32) -> Option<Vec<u8>> {
        let path = self
            .root
            .join(std::format!("sii-{:08x}-{:08x}.bin", vendor_id, product_code));

        match std::fs::read(&path) {
            Ok(data) => {
                crate::fmt::info!("Loaded SII override from {}", path.display());

                Some(data)
            }
            Err(_) => None,
        }
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;

    #[test]
    fn file_name_format() {
        let dir = std::env::temp_dir().join("carapace-sii-test");

        std::fs::create_dir_all(&dir).unwrap();

        let path = dir.join("sii-0000000b-00001234.bin");

        std::fs::write(&path, [0xaa, 0xbb]).unwrap();

        let loader = SiiFirmwareDir::new(&dir);

        assert_eq!(loader.load(0x0b, 0x1234), Some(alloc::vec![0xaa, 0xbb]));
        assert_eq!(loader.load(0x0b, 0x9999), None);

        std::fs::remove_file(path).ok();
    }
}
