use crate::{FlashDevice, ReadStatus, check_range};
use ffl_error::{FflError, Result};
use ffl_types::{BlockIndex, FlashGeometry};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

/// Flash image stored in a regular file.
///
/// Uses `std::os::unix::fs::FileExt`, which is thread-safe and does not
/// require a shared seek position. Bad-block marks live only in memory.
#[derive(Debug, Clone)]
pub struct FileFlash {
    file: Arc<File>,
    geometry: FlashGeometry,
    bad: Arc<Mutex<BTreeSet<u32>>>,
}

impl FileFlash {
    /// Create (or truncate) `path` as a fully erased image.
    pub fn create(path: impl AsRef<Path>, geometry: FlashGeometry) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(u64::from(geometry.flash_size))?;
        let erased = vec![0xFF_u8; geometry.sector_size as usize];
        for block in 0..geometry.block_count() {
            file.write_all_at(&erased, u64::from(geometry.block_start(BlockIndex(block))))?;
        }
        tracing::info!(
            target: "ffl::device",
            path = %path.as_ref().display(),
            flash_size = geometry.flash_size,
            sector_size = geometry.sector_size,
            "file_flash_created"
        );
        Ok(Self {
            file: Arc::new(file),
            geometry,
            bad: Arc::new(Mutex::new(BTreeSet::new())),
        })
    }

    /// Open an existing image. Its length must be a whole number of sectors.
    pub fn open(path: impl AsRef<Path>, sector_size: u32, page_size: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        let len = u32::try_from(file.metadata()?.len()).map_err(|_| {
            FflError::InvalidGeometry("image larger than 4 GiB".to_owned())
        })?;
        let geometry = FlashGeometry::new(len, sector_size, page_size)
            .map_err(|err| FflError::InvalidGeometry(err.to_string()))?;
        Ok(Self {
            file: Arc::new(file),
            geometry,
            bad: Arc::new(Mutex::new(BTreeSet::new())),
        })
    }

    #[must_use]
    pub fn bad_blocks(&self) -> Vec<BlockIndex> {
        self.bad.lock().iter().copied().map(BlockIndex).collect()
    }
}

impl FlashDevice for FileFlash {
    fn geometry(&self) -> FlashGeometry {
        self.geometry
    }

    fn read(&self, offset: u32, buf: &mut [u8]) -> Result<ReadStatus> {
        check_range(&self.geometry, offset, buf.len())?;
        self.file.read_exact_at(buf, u64::from(offset))?;
        Ok(ReadStatus::Clean)
    }

    /// Programs with NOR semantics: the new bytes are ANDed into the image.
    fn write(&self, offset: u32, data: &[u8]) -> Result<()> {
        check_range(&self.geometry, offset, data.len())?;
        let mut current = vec![0_u8; data.len()];
        self.file.read_exact_at(&mut current, u64::from(offset))?;
        for (dst, src) in current.iter_mut().zip(data) {
            *dst &= *src;
        }
        self.file.write_all_at(&current, u64::from(offset))?;
        Ok(())
    }

    fn erase(&self, block: BlockIndex) -> Result<()> {
        let start = self.geometry.block_start(block);
        check_range(&self.geometry, start, self.geometry.sector_size as usize)?;
        let erased = vec![0xFF_u8; self.geometry.sector_size as usize];
        self.file.write_all_at(&erased, u64::from(start))?;
        Ok(())
    }

    fn mark_bad(&self, block: BlockIndex) -> Result<()> {
        tracing::warn!(target: "ffl::device", block = block.0, "file_flash_mark_bad");
        self.bad.lock().insert(block.0);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("flash.img");
        let geometry = FlashGeometry::new(32 * 1024, 8192, 512).expect("geometry");

        let dev = FileFlash::create(&path, geometry).expect("create");
        dev.write(8192 + 16, b"node").expect("write");
        dev.sync().expect("sync");
        drop(dev);

        let dev = FileFlash::open(&path, 8192, 512).expect("open");
        assert_eq!(dev.geometry(), geometry);
        let mut buf = [0_u8; 6];
        dev.read(8192 + 14, &mut buf).expect("read");
        assert_eq!(&buf, b"\xFF\xFFnode");
    }

    #[test]
    fn erase_and_bad_marks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let geometry = FlashGeometry::new(16 * 1024, 4096, 256).expect("geometry");
        let dev = FileFlash::create(dir.path().join("img"), geometry).expect("create");
        dev.write(4096, &[0; 64]).expect("write");
        dev.erase(BlockIndex(1)).expect("erase");
        let mut buf = [0_u8; 64];
        dev.read(4096, &mut buf).expect("read");
        assert!(buf.iter().all(|b| *b == 0xFF));

        dev.mark_bad(BlockIndex(3)).expect("mark");
        assert_eq!(dev.bad_blocks(), vec![BlockIndex(3)]);
    }

    #[test]
    fn programming_only_clears_bits() {
        let dir = tempfile::tempdir().expect("tempdir");
        let geometry = FlashGeometry::new(8192, 4096, 256).expect("geometry");
        let dev = FileFlash::create(dir.path().join("img"), geometry).expect("create");
        dev.write(0, &[0x0F]).expect("first");
        dev.write(0, &[0xF3]).expect("second");
        let mut buf = [0_u8; 1];
        dev.read(0, &mut buf).expect("read");
        assert_eq!(buf[0], 0x03);
    }

    #[test]
    fn open_rejects_ragged_image() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ragged");
        std::fs::write(&path, vec![0xFF_u8; 10_000]).expect("write");
        assert!(matches!(
            FileFlash::open(&path, 4096, 256),
            Err(FflError::InvalidGeometry(_))
        ));
    }
}
