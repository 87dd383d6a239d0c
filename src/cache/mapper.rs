use memmap2::{MmapOptions, MmapRaw};
use std::fmt::Debug;
use std::fs::File;
use std::io;

/// Access requested when a page's file region is mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    ReadOnly,
    ReadWrite,
}

impl Access {
    pub fn is_writable(&self) -> bool {
        matches!(self, Access::ReadWrite)
    }
}

/// A live mapping of a file region. Dropping it unmaps the region.
#[derive(Debug)]
pub struct MappedRegion {
    raw: MmapRaw,
}

impl MappedRegion {
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.raw.as_mut_ptr()
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.len() == 0
    }
}

/// The primitive the cache uses to map, unmap and persist file regions.
///
/// All methods are called with the cache lock held.
pub trait FileMapper: Send + Sync + Debug {
    /// Map `len` bytes of `file` starting at `offset`.
    fn map(&self, file: &File, offset: u64, len: usize, access: Access)
        -> io::Result<MappedRegion>;

    /// Release a mapping.
    fn unmap(&self, region: MappedRegion) -> io::Result<()> {
        drop(region);
        Ok(())
    }

    /// Write the mapped bytes back to the file.
    fn sync(&self, region: &MappedRegion, synchronous: bool) -> io::Result<()>;
}

/// [`FileMapper`] backed by `mmap(2)` through `memmap2`.
#[derive(Debug, Default, Clone, Copy)]
pub struct MmapMapper;

impl FileMapper for MmapMapper {
    fn map(
        &self,
        file: &File,
        offset: u64,
        len: usize,
        access: Access,
    ) -> io::Result<MappedRegion> {
        let mut options = MmapOptions::new();
        options.offset(offset).len(len);
        let raw = match access {
            Access::ReadOnly => options.map_raw_read_only(file)?,
            Access::ReadWrite => options.map_raw(file)?,
        };
        Ok(MappedRegion { raw })
    }

    fn sync(&self, region: &MappedRegion, synchronous: bool) -> io::Result<()> {
        if synchronous {
            region.raw.flush()
        } else {
            region.raw.flush_async()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::fs::OpenOptions;
    use std::io::{Read, Seek, SeekFrom, Write};
    use tempfile::tempdir;

    #[test]
    fn test_map_read_write_and_sync() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("region.dat");
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(8192)?;

        let mapper = MmapMapper;
        let region = mapper.map(&file, 4096, 4096, Access::ReadWrite)?;
        assert_eq!(region.len(), 4096);

        unsafe {
            *region.as_mut_ptr() = 0xAB;
        }
        mapper.sync(&region, true)?;
        mapper.unmap(region)?;

        let mut buf = [0u8; 1];
        file.seek(SeekFrom::Start(4096))?;
        file.read_exact(&mut buf)?;
        assert_eq!(buf[0], 0xAB);

        Ok(())
    }

    #[test]
    fn test_map_read_only_sees_file_contents() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("region.dat");
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.write_all(&[7u8; 128])?;

        let region = MmapMapper.map(&file, 0, 128, Access::ReadOnly)?;
        let first = unsafe { *region.as_mut_ptr() };
        assert_eq!(first, 7);

        Ok(())
    }

    #[test]
    fn test_access_is_writable() {
        assert!(Access::ReadWrite.is_writable());
        assert!(!Access::ReadOnly.is_writable());
    }
}
