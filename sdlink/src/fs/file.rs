//! File data transfer along cluster chains.

use std::io::{self, Read, Write};

use log::debug;

use crate::error::{Error, Result};
use crate::fs::BlockDevice;
use crate::fs::dir::DirectoryInfo;
use crate::fs::entry::fat_timestamp_now;
use crate::fs::fat::FatFs;
use crate::fs::volume::BLOCK_SIZE;

/// Fill `buf` from `source`, stopping early only at end of input.
fn read_full(source: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

impl<D: BlockDevice> FatFs<D> {
    /// Stream the contents of `info` into `sink`.
    ///
    /// `progress` is called with the byte count after every cluster; an
    /// error from it (usually [`Error::Cancelled`]) stops the transfer.
    pub fn read_file(
        &mut self,
        info: &DirectoryInfo,
        sink: &mut dyn Write,
        progress: &mut dyn FnMut(u64) -> Result<()>,
    ) -> Result<u64> {
        let volume = self.volume()?;
        let total = u64::from(info.size());
        let mut remaining = total;
        let mut cluster = info.first_cluster();

        while remaining > 0 {
            if volume.is_eoc(cluster) || !volume.is_valid_cluster(cluster) {
                return Err(Error::Filesystem(format!(
                    "'{}' ends before its recorded size",
                    info.name
                )));
            }
            let first = volume.cluster_block(cluster);
            for block in first..first + u32::from(volume.blocks_per_cluster) {
                if remaining == 0 {
                    break;
                }
                let n = remaining.min(BLOCK_SIZE as u64) as usize;
                let data = self.block(block)?;
                sink.write_all(&data[..n])?;
                remaining -= n as u64;
            }
            progress(total - remaining)?;
            cluster = self.fat_get(cluster)?;
        }
        sink.flush()?;
        Ok(total)
    }

    /// Replace the contents of `info` with `len` bytes from `source`.
    ///
    /// Any previous chain is freed. The first cluster is recorded in the
    /// entry as soon as it is allocated, so deleting the entry after a
    /// failed or cancelled write releases everything. The size is written
    /// last.
    pub fn write_file(
        &mut self,
        info: &mut DirectoryInfo,
        source: &mut dyn Read,
        len: u64,
        progress: &mut dyn FnMut(u64) -> Result<()>,
    ) -> Result<()> {
        let size = u32::try_from(len)
            .map_err(|_| Error::Unsupported(format!("'{}' is larger than 4 GiB", info.name)))?;
        let volume = self.volume()?;

        if info.first_cluster() != 0 {
            self.wipe_cluster_chain(info.first_cluster())?;
        }
        info.entry.set_first_cluster(0);
        info.entry.set_file_size(0);
        self.update_entry(info)?;

        let cluster_bytes = u64::from(volume.cluster_bytes());
        let mut written = 0u64;
        let mut prev = 0;
        let mut buf = [0u8; BLOCK_SIZE];
        while written < len {
            let cluster = self.alloc_cluster(prev, false)?;
            if prev == 0 {
                info.entry.set_first_cluster(cluster);
                self.update_entry(info)?;
            }
            prev = cluster;

            let chunk = (len - written).min(cluster_bytes);
            let first = volume.cluster_block(cluster);
            let mut done = 0u64;
            for block in first..first + u32::from(volume.blocks_per_cluster) {
                if done >= chunk {
                    break;
                }
                let want = (chunk - done).min(BLOCK_SIZE as u64) as usize;
                buf.fill(0);
                let got = read_full(source, &mut buf[..want])?;
                if got < want {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("source for '{}' ended after {} bytes", info.name, written + done + got as u64),
                    )));
                }
                self.block_overwrite(block)?
                    .copy_from_slice(&buf);
                done += want as u64;
            }
            written += done;
            progress(written)?;
        }

        info.entry.set_file_size(size);
        let (date, time) = fat_timestamp_now();
        info.entry.set_timestamps(date, time);
        self.update_entry(info)?;
        debug!("Wrote {len} bytes to '{}'", info.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::entry::attr;
    use crate::fs::memory::{FormatOptions, MemoryCard};

    fn data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 251) as u8).collect()
    }

    #[test]
    fn test_write_then_read() {
        let mut fs = FatFs::new(MemoryCard::format(&FormatOptions::fat16(2048, 1)));
        let root = fs.root_pointer().unwrap();
        let mut info = fs.create_entry(root, "blob.bin", attr::ARCHIVE).unwrap();
        let content = data(1300);

        fs.write_file(&mut info, &mut content.as_slice(), 1300, &mut |_| Ok(()))
            .unwrap();
        assert_eq!(fs.chain(info.first_cluster()).unwrap().len(), 3);
        fs.flush().unwrap();

        let listed = fs.find(root, "blob.bin").unwrap().unwrap();
        assert_eq!(listed.size(), 1300);
        let mut out = Vec::new();
        fs.read_file(&listed, &mut out, &mut |_| Ok(())).unwrap();
        assert_eq!(out, content);
    }

    #[test]
    fn test_overwrite_frees_old_chain() {
        let mut fs = FatFs::new(MemoryCard::format(&FormatOptions::fat32(4096, 1)));
        let root = fs.root_pointer().unwrap();
        let mut info = fs.create_entry(root, "log.txt", attr::ARCHIVE).unwrap();
        let big = data(5000);
        fs.write_file(&mut info, &mut big.as_slice(), 5000, &mut |_| Ok(()))
            .unwrap();
        let old_chain = fs.chain(info.first_cluster()).unwrap();
        assert_eq!(old_chain.len(), 10);

        fs.write_file(&mut info, &mut &b"short"[..], 5, &mut |_| Ok(()))
            .unwrap();
        let new_chain = fs.chain(info.first_cluster()).unwrap();
        assert_eq!(new_chain.len(), 1);
        let still_used = old_chain
            .iter()
            .filter(|c| !new_chain.contains(c))
            .filter(|&&c| fs.fat_get(c).unwrap() != 0)
            .count();
        assert_eq!(still_used, 0);
    }

    #[test]
    fn test_progress_error_stops_write() {
        let mut fs = FatFs::new(MemoryCard::format(&FormatOptions::fat16(2048, 1)));
        let root = fs.root_pointer().unwrap();
        let mut info = fs.create_entry(root, "big.bin", attr::ARCHIVE).unwrap();
        let content = data(4096);
        let result = fs.write_file(&mut info, &mut content.as_slice(), 4096, &mut |done| {
            if done >= 1024 { Err(Error::Cancelled) } else { Ok(()) }
        });
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(info.size(), 0);
        assert_ne!(info.first_cluster(), 0);

        // Deleting releases what was allocated so far.
        let first = info.first_cluster();
        fs.delete_entry(&info).unwrap();
        assert_eq!(fs.fat_get(first).unwrap(), 0);
    }

    #[test]
    fn test_short_source_is_an_error() {
        let mut fs = FatFs::new(MemoryCard::format(&FormatOptions::fat16(2048, 1)));
        let root = fs.root_pointer().unwrap();
        let mut info = fs.create_entry(root, "cut.bin", attr::ARCHIVE).unwrap();
        let result = fs.write_file(&mut info, &mut &b"abc"[..], 10, &mut |_| Ok(()));
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[test]
    fn test_empty_file() {
        let mut fs = FatFs::new(MemoryCard::format(&FormatOptions::fat16(2048, 1)));
        let root = fs.root_pointer().unwrap();
        let mut info = fs.create_entry(root, "empty", attr::ARCHIVE).unwrap();
        fs.write_file(&mut info, &mut io::empty(), 0, &mut |_| Ok(()))
            .unwrap();
        assert_eq!(info.first_cluster(), 0);
        let mut out = Vec::new();
        assert_eq!(fs.read_file(&info, &mut out, &mut |_| Ok(())).unwrap(), 0);
        assert!(out.is_empty());
    }
}
