// Licensed under the Apache-2.0 license

//! User-space contiguous DMA buffers.
//!
//! The u-dma-buf kernel module allocates physically contiguous memory and
//! exports each buffer as a device node plus a sysfs directory carrying its
//! physical address, size and cache-synchronization controls. This module
//! discovers a buffer by name, maps it into the process and drives the sysfs
//! attributes.

use std::fs::{self, File};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::slice;

use log::debug;

use crate::error::DmaError;
use crate::mem::{Mapping, MemDevice};
use crate::Result;

/// Filesystem layout the buffers are discovered in. The default is the real
/// u-dma-buf convention; tests point it at a temporary tree.
#[derive(Debug, Clone)]
pub struct BufferLayout {
    /// sysfs class roots, searched in order.
    pub sys_roots: Vec<PathBuf>,
    /// Directory holding the buffer device nodes.
    pub dev_dir: PathBuf,
}

impl Default for BufferLayout {
    fn default() -> Self {
        Self {
            sys_roots: vec![
                PathBuf::from("/sys/class/u-dma-buf"),
                PathBuf::from("/sys/class/udmabuf"),
            ],
            dev_dir: PathBuf::from("/dev"),
        }
    }
}

/// Buffer owner for explicit cache handoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferOwner {
    Cpu,
    Device,
}

/// Transfer direction for an explicitly synchronized area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirection {
    /// DMA to device (processor to fabric).
    ToDevice = 1,
    /// DMA from device (fabric to processor).
    FromDevice = 2,
}

/// An open, mapped contiguous DMA buffer.
///
/// Dropping the buffer unmaps it and closes the device node; reopening the
/// same name observes the same physical address and size.
#[derive(Debug)]
pub struct DmaBuffer {
    name: String,
    sys_path: PathBuf,
    #[allow(dead_code)] // owns the device node for the mapping's lifetime
    file: File,
    map: Mapping,
    phys_addr: u64,
    size: u64,
    sync_mode: u8,
    cache_on: bool,
}

impl DmaBuffer {
    /// Opens buffer `name` under the standard u-dma-buf layout.
    ///
    /// `cache_on` selects whether the CPU cache covers the mapping; when
    /// disabled the device node is opened with synchronous (O_SYNC) access
    /// and the default sync mode 1 maps that to an uncached buffer.
    pub fn open(name: &str, cache_on: bool) -> Result<Self> {
        Self::open_with_layout(&BufferLayout::default(), name, cache_on)
    }

    /// Opens buffer `name` under an explicit filesystem layout.
    pub fn open_with_layout(layout: &BufferLayout, name: &str, cache_on: bool) -> Result<Self> {
        let sys_path = layout
            .sys_roots
            .iter()
            .map(|root| root.join(name))
            .find(|path| path.is_dir())
            .ok_or_else(|| DmaError::BufferNotFound(name.to_string()))?;

        let phys_addr = read_hex_attr(&sys_path.join("phys_addr"))?;
        let size = read_decimal_attr(&sys_path.join("size"))?;

        let file = File::options()
            .read(true)
            .write(true)
            .custom_flags(if cache_on { 0 } else { libc::O_SYNC })
            .open(layout.dev_dir.join(name))
            .map_err(DmaError::io("open buffer device"))?;
        let dup = file.try_clone().map_err(DmaError::io("open buffer device"))?;
        let map = MemDevice::from_file(dup).map(0, size as usize)?;

        debug!("opened {name}: {size} bytes at {phys_addr:#x}");
        Ok(Self {
            name: name.to_string(),
            sys_path,
            file,
            map,
            phys_addr,
            size,
            sync_mode: 1,
            cache_on,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Physical base address of the buffer, stable for its lifetime.
    pub fn phys_addr(&self) -> u64 {
        self.phys_addr
    }

    /// Buffer size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Sync mode last written (or the default, 1).
    pub fn sync_mode(&self) -> u8 {
        self.sync_mode
    }

    pub fn cache_enabled(&self) -> bool {
        self.cache_on
    }

    /// The mapped buffer contents.
    pub fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.map.as_ptr() as *const u8, self.size as usize) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.map.as_ptr() as *mut u8, self.size as usize) }
    }

    /// Selects the kernel module's cache strategy (0..=7); see the u-dma-buf
    /// sync_mode documentation for the semantics of each value.
    pub fn set_sync_mode(&mut self, mode: u8) -> Result<()> {
        if mode > 7 {
            return Err(DmaError::InvalidSyncMode(mode));
        }
        self.write_attr("sync_mode", mode as u64)?;
        self.sync_mode = mode;
        Ok(())
    }

    /// Defines the region the next explicit cache synchronization applies to.
    pub fn set_sync_area(&self, offset: u32, size: u32, direction: SyncDirection) -> Result<()> {
        self.write_attr("sync_offset", offset as u64)?;
        self.write_attr("sync_size", size as u64)?;
        self.write_attr("sync_direction", direction as u64)
    }

    /// Hands the buffer to the CPU or the device when the cache is managed
    /// explicitly.
    pub fn set_owner(&self, owner: BufferOwner) -> Result<()> {
        match owner {
            BufferOwner::Cpu => self.write_attr("sync_for_cpu", 1),
            BufferOwner::Device => self.write_attr("sync_for_device", 1),
        }
    }

    fn write_attr(&self, attr: &'static str, value: u64) -> Result<()> {
        fs::write(self.sys_path.join(attr), value.to_string()).map_err(DmaError::io(attr))
    }
}

fn read_hex_attr(path: &Path) -> Result<u64> {
    let text = fs::read_to_string(path).map_err(DmaError::io("read phys_addr"))?;
    let text = text.trim();
    let digits = text.strip_prefix("0x").unwrap_or(text);
    u64::from_str_radix(digits, 16).map_err(|err| DmaError::Io {
        op: "parse phys_addr",
        source: io::Error::new(io::ErrorKind::InvalidData, err),
    })
}

fn read_decimal_attr(path: &Path) -> Result<u64> {
    let text = fs::read_to_string(path).map_err(DmaError::io("read size"))?;
    text.trim().parse().map_err(|err| DmaError::Io {
        op: "parse size",
        source: io::Error::new(io::ErrorKind::InvalidData, err),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::TempDir;

    const SIZE: u64 = 65536;

    /// Fake u-dma-buf tree: two sysfs roots (the buffer lives in the second,
    /// exercising the ordered search) and a dev directory with a regular
    /// file standing in for the device node.
    fn fake_tree(name: &str) -> (TempDir, BufferLayout) {
        let dir = tempfile::tempdir().unwrap();
        let root_a = dir.path().join("u-dma-buf");
        let root_b = dir.path().join("udmabuf");
        let dev_dir = dir.path().join("dev");
        fs::create_dir_all(&root_a).unwrap();
        fs::create_dir_all(root_b.join(name)).unwrap();
        fs::create_dir_all(&dev_dir).unwrap();
        fs::write(root_b.join(name).join("phys_addr"), "0x70000000\n").unwrap();
        fs::write(root_b.join(name).join("size"), format!("{SIZE}\n")).unwrap();
        let dev = File::create(dev_dir.join(name)).unwrap();
        dev.set_len(SIZE).unwrap();
        let layout = BufferLayout {
            sys_roots: vec![root_a, root_b],
            dev_dir,
        };
        (dir, layout)
    }

    #[test]
    fn test_open_reads_metadata_and_maps() {
        let (_dir, layout) = fake_tree("udmabuf0");
        let mut buf = DmaBuffer::open_with_layout(&layout, "udmabuf0", true).unwrap();
        assert_eq!(buf.phys_addr(), 0x7000_0000);
        assert_eq!(buf.size(), SIZE);
        assert_eq!(buf.sync_mode(), 1);
        assert_eq!(buf.as_slice().len(), SIZE as usize);

        buf.as_mut_slice()[..4].copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(&buf.as_slice()[..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_reopen_after_drop() {
        let (_dir, layout) = fake_tree("udmabuf0");
        let first = DmaBuffer::open_with_layout(&layout, "udmabuf0", false).unwrap();
        let (addr, size) = (first.phys_addr(), first.size());
        drop(first);

        let second = DmaBuffer::open_with_layout(&layout, "udmabuf0", false).unwrap();
        assert_eq!(second.phys_addr(), addr);
        assert_eq!(second.size(), size);
    }

    #[test]
    fn test_unknown_name_fails() {
        let (_dir, layout) = fake_tree("udmabuf0");
        assert!(matches!(
            DmaBuffer::open_with_layout(&layout, "udmabuf7", true),
            Err(DmaError::BufferNotFound(name)) if name == "udmabuf7"
        ));
    }

    #[test]
    fn test_sync_mode_range() {
        let (_dir, layout) = fake_tree("udmabuf0");
        let mut buf = DmaBuffer::open_with_layout(&layout, "udmabuf0", true).unwrap();

        buf.set_sync_mode(3).unwrap();
        assert_eq!(buf.sync_mode(), 3);
        let written = fs::read_to_string(buf.sys_path.join("sync_mode")).unwrap();
        assert_eq!(written, "3");

        assert!(matches!(
            buf.set_sync_mode(8),
            Err(DmaError::InvalidSyncMode(8))
        ));
        // Rejected without side effect.
        assert_eq!(buf.sync_mode(), 3);
    }

    #[test]
    fn test_sync_area_and_owner() {
        let (_dir, layout) = fake_tree("udmabuf0");
        let buf = DmaBuffer::open_with_layout(&layout, "udmabuf0", false).unwrap();

        buf.set_sync_area(0x1000, 0x800, SyncDirection::FromDevice)
            .unwrap();
        let read = |attr: &str| fs::read_to_string(buf.sys_path.join(attr)).unwrap();
        assert_eq!(read("sync_offset"), "4096");
        assert_eq!(read("sync_size"), "2048");
        assert_eq!(read("sync_direction"), "2");

        buf.set_owner(BufferOwner::Device).unwrap();
        assert_eq!(read("sync_for_device"), "1");
        buf.set_owner(BufferOwner::Cpu).unwrap();
        assert_eq!(read("sync_for_cpu"), "1");
    }
}
