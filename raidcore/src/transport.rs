// vim: tw=80
//! The seam between the RAID core and whatever actually moves data to and
//! from member disks

use futures::{Future, future};
#[cfg(test)] use mockall::automock;
use std::{
    pin::Pin,
    sync::Mutex,
};

use crate::types::*;

/// Future returned by every [`Transport`] operation
pub type BoxIoFut = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Physical I/O to member disks.
///
/// Addresses are in sectors of the array's configured size.
#[cfg_attr(test, automock)]
pub trait Transport: Send + Sync {
    /// Asynchronously fill `buf` from `disk`, starting at `sector`
    fn read_at(&self, disk: DiskT, buf: IoVecMut, sector: SectorT) -> BoxIoFut;

    /// Asynchronously write `buf` to `disk`, starting at `sector`
    fn write_at(&self, disk: DiskT, buf: IoVec, sector: SectorT) -> BoxIoFut;
}

#[derive(Debug, Default)]
struct MemDisk {
    data: Vec<u8>,
    failed: bool,
    reads: u64,
    writes: u64,
}

/// A [`Transport`] that keeps every member disk in RAM.
///
/// Disks can be failed, replaced, and corrupted, which makes it useful for
/// exercising degraded-mode code.
#[derive(Debug)]
pub struct MemTransport {
    bytes_per_sector: usize,
    disks: Mutex<Vec<MemDisk>>,
}

impl MemTransport {
    pub fn new(ndisks: DiskT, sectors_per_disk: SectorT,
               bytes_per_sector: usize) -> Self
    {
        let len = sectors_per_disk as usize * bytes_per_sector;
        let disks = (0..ndisks)
            .map(|_| MemDisk{data: vec![0u8; len], ..Default::default()})
            .collect();
        MemTransport{bytes_per_sector, disks: Mutex::new(disks)}
    }

    /// Make every subsequent access to `disk` fail with `EIO`
    pub fn fail(&self, disk: DiskT) {
        if let Some(d) = self.disks.lock().unwrap().get_mut(usize::from(disk)) {
            d.failed = true;
        }
    }

    /// Swap in a blank disk in place of `disk`
    pub fn replace(&self, disk: DiskT) {
        if let Some(d) = self.disks.lock().unwrap().get_mut(usize::from(disk)) {
            d.data.fill(0);
            d.failed = false;
        }
    }

    /// Flip the bits of one byte, behind the array's back
    pub fn corrupt(&self, disk: DiskT, sector: SectorT) {
        let off = sector as usize * self.bytes_per_sector;
        if let Some(d) = self.disks.lock().unwrap().get_mut(usize::from(disk)) {
            if let Some(b) = d.data.get_mut(off) {
                *b ^= 0xFF;
            }
        }
    }

    /// A copy of a disk's entire contents
    pub fn contents(&self, disk: DiskT) -> Vec<u8> {
        self.disks.lock().unwrap()
            .get(usize::from(disk))
            .map(|d| d.data.clone())
            .unwrap_or_default()
    }

    /// Number of reads and writes completed by `disk`
    pub fn io_counts(&self, disk: DiskT) -> (u64, u64) {
        self.disks.lock().unwrap()
            .get(usize::from(disk))
            .map(|d| (d.reads, d.writes))
            .unwrap_or_default()
    }

    fn check<'a>(disks: &'a mut [MemDisk], disk: DiskT, off: usize, len: usize)
        -> Result<&'a mut MemDisk>
    {
        let d = disks.get_mut(usize::from(disk)).ok_or(Error::ENXIO)?;
        if d.failed {
            return Err(Error::EIO);
        }
        if off + len > d.data.len() {
            return Err(Error::EINVAL);
        }
        Ok(d)
    }
}

impl Transport for MemTransport {
    fn read_at(&self, disk: DiskT, mut buf: IoVecMut, sector: SectorT)
        -> BoxIoFut
    {
        let off = sector as usize * self.bytes_per_sector;
        let len = buf.len();
        let mut disks = self.disks.lock().unwrap();
        let r = MemTransport::check(&mut disks, disk, off, len)
            .map(|d| {
                buf[..].copy_from_slice(&d.data[off..off + len]);
                d.reads += 1;
            });
        Box::pin(future::ready(r))
    }

    fn write_at(&self, disk: DiskT, buf: IoVec, sector: SectorT) -> BoxIoFut {
        let off = sector as usize * self.bytes_per_sector;
        let mut disks = self.disks.lock().unwrap();
        let r = MemTransport::check(&mut disks, disk, off, buf.len())
            .map(|d| {
                d.data[off..off + buf.len()].copy_from_slice(&buf[..]);
                d.writes += 1;
            });
        Box::pin(future::ready(r))
    }
}
