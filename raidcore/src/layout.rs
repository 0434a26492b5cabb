// vim: tw=80
//! Array geometry and the decomposition of logical accesses into per-disk
//! extents

use fixedbitset::FixedBitSet;
use std::{cmp, sync::Arc};

use crate::{
    config::ArrayConfig,
    raid::{self, RedundancyScheme},
    types::*,
};

/// One contiguous extent on one member disk
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PhysDiskAddr {
    /// Column of the parity stripe that this extent belongs to
    pub col: usize,
    pub disk: DiskT,
    /// Starting sector on `disk`
    pub sector: SectorT,
    pub nsectors: SectorT,
    /// Offset of `sector` within its stripe unit
    pub su_offset: SectorT,
    /// Logical address of the first sector.  For redundancy extents, the
    /// logical address of the access that they protect.
    pub raid_addr: SectorT,
}

impl PhysDiskAddr {
    /// Offset within the stripe unit one past this extent's last sector
    pub fn su_end(&self) -> SectorT {
        self.su_offset + self.nsectors
    }
}

/// The portion of a single access that falls within one parity stripe
#[derive(Clone, Debug)]
pub struct AccessStripeMap {
    pub psid: PsidT,
    /// First logical sector of the access within this stripe
    pub raid_addr: SectorT,
    pub nsectors: SectorT,
    /// Lowest logical sector of the whole stripe
    pub stripe_addr: SectorT,
    /// Disk of each column, data columns first
    pub disks: Vec<DiskT>,
    /// Sector where each of the stripe's stripe units begins
    pub stripe_sector: SectorT,
    pub sectors_per_su: SectorT,
    pub data_cols: usize,
    /// Touched data, in logical order
    pub data: Vec<PhysDiskAddr>,
    /// Redundancy units covering the touched range, one per redundancy column
    pub redundancy: Vec<PhysDiskAddr>,
    /// Failed columns
    pub failed: FixedBitSet,
}

impl AccessStripeMap {
    fn new(psid: PsidT, raid_addr: SectorT, disks: Vec<DiskT>,
           scheme: &dyn RedundancyScheme) -> Self
    {
        let ncols = disks.len();
        AccessStripeMap {
            psid,
            raid_addr,
            nsectors: 0,
            stripe_addr: scheme.stripe_addr(psid),
            disks,
            stripe_sector: scheme.stripe_start(psid),
            sectors_per_su: scheme.sectors_per_su(),
            data_cols: scheme.data_cols(),
            data: Vec::new(),
            redundancy: Vec::new(),
            failed: FixedBitSet::with_capacity(ncols),
        }
    }

    /// Fill in the redundancy extents and failed columns once every data
    /// extent is known.
    fn finish(&mut self, failed_disks: &FixedBitSet) {
        let (lo, hi) = self.su_range();
        self.redundancy = (self.data_cols..self.ncols())
            .map(|col| self.extent(col, lo, hi))
            .collect();
        for (col, disk) in self.disks.iter().enumerate() {
            if failed_disks.contains(usize::from(*disk)) {
                self.failed.insert(col);
            }
        }
    }

    /// Total columns, data plus redundancy
    pub fn ncols(&self) -> usize {
        self.disks.len()
    }

    pub fn num_failed(&self) -> usize {
        self.failed.count_ones(..)
    }

    pub fn is_failed(&self, col: usize) -> bool {
        self.failed.contains(col)
    }

    /// Failed data columns, whether touched or not
    pub fn failed_data_cols(&self) -> Vec<usize> {
        self.failed.ones().filter(|c| *c < self.data_cols).collect()
    }

    /// Touched data extents whose column has failed
    pub fn failed_data(&self) -> impl Iterator<Item=&PhysDiskAddr> {
        self.data.iter().filter(|pda| self.failed.contains(pda.col))
    }

    /// The touched extent of data column `col`, if any
    pub fn data_for(&self, col: usize) -> Option<&PhysDiskAddr> {
        self.data.iter().find(|pda| pda.col == col)
    }

    /// Does this access overwrite every data column in full?
    pub fn is_full_stripe(&self) -> bool {
        self.data.len() == self.data_cols &&
            self.data.iter().all(|pda| pda.nsectors == self.sectors_per_su)
    }

    /// Union of the stripe unit offsets touched in any data column, as a
    /// half-open range
    pub fn su_range(&self) -> (SectorT, SectorT) {
        let lo = self.data.iter().map(|pda| pda.su_offset).min().unwrap_or(0);
        let hi = self.data.iter().map(PhysDiskAddr::su_end).max().unwrap_or(0);
        (lo, hi)
    }

    /// The extent of column `col` covering stripe unit offsets `lo..hi`
    pub fn extent(&self, col: usize, lo: SectorT, hi: SectorT) -> PhysDiskAddr
    {
        let raid_addr = if col < self.data_cols {
            self.stripe_addr + col as SectorT * self.sectors_per_su + lo
        } else {
            self.raid_addr
        };
        PhysDiskAddr {
            col,
            disk: self.disks[col],
            sector: self.stripe_sector + lo,
            nsectors: hi - lo,
            su_offset: lo,
            raid_addr,
        }
    }

    /// The whole stripe unit of column `col`
    pub fn stripe_unit(&self, col: usize) -> PhysDiskAddr {
        self.extent(col, 0, self.sectors_per_su)
    }
}

/// Every parity stripe touched by a single access, in logical order
#[derive(Clone, Debug)]
pub struct AccessMap {
    pub raid_addr: SectorT,
    pub nsectors: SectorT,
    pub stripes: Vec<AccessStripeMap>,
}

impl AccessMap {
    pub fn psids(&self) -> impl Iterator<Item=PsidT> + '_ {
        self.stripes.iter().map(|asm| asm.psid)
    }
}

/// Immutable geometry of an array, including its redundancy scheme
#[derive(Clone, Debug)]
pub struct ArrayLayout {
    pub ndisks: DiskT,
    pub sectors_per_disk: SectorT,
    pub sectors_per_su: SectorT,
    pub bytes_per_sector: usize,
    scheme: Arc<dyn RedundancyScheme>,
}

impl ArrayLayout {
    pub fn new(config: &ArrayConfig) -> Result<Self> {
        let scheme = raid::scheme_for(config)?;
        Ok(ArrayLayout {
            ndisks: config.disks,
            sectors_per_disk: config.sectors_per_disk,
            sectors_per_su: config.sectors_per_su,
            bytes_per_sector: config.bytes_per_sector,
            scheme,
        })
    }

    pub fn scheme(&self) -> &Arc<dyn RedundancyScheme> {
        &self.scheme
    }

    pub fn bytes_per_su(&self) -> usize {
        self.sectors_per_su as usize * self.bytes_per_sector
    }

    /// Usable logical sectors
    pub fn capacity(&self) -> SectorT {
        self.scheme.capacity()
    }

    pub fn stripes(&self) -> PsidT {
        self.scheme.stripes()
    }

    /// Decompose an access into per-stripe, per-disk extents.
    ///
    /// `failed_disks` is indexed by disk.
    pub fn map_access(&self, raid_addr: SectorT, nsectors: SectorT,
                      failed_disks: &FixedBitSet) -> Result<AccessMap>
    {
        if nsectors == 0 {
            return Err(Error::EINVAL);
        }
        let end = raid_addr.checked_add(nsectors).ok_or(Error::ENOSPC)?;
        if end > self.capacity() {
            return Err(Error::ENOSPC);
        }
        let spsu = self.sectors_per_su;
        let ndata = self.scheme.data_cols() as SectorT;
        let mut stripes: Vec<AccessStripeMap> = Vec::new();
        let mut addr = raid_addr;
        while addr < end {
            let su_offset = addr % spsu;
            let len = cmp::min(spsu - su_offset, end - addr);
            let (disks, psid) = self.scheme.identify_stripe(addr);
            let (disk, sector) = self.scheme.map_data(addr);
            if stripes.last().map(|asm| asm.psid) != Some(psid) {
                stripes.push(AccessStripeMap::new(psid, addr, disks,
                                                  &*self.scheme));
            }
            let asm = stripes.last_mut().ok_or(Error::EDOOFUS)?;
            asm.data.push(PhysDiskAddr {
                col: ((addr / spsu) % ndata) as usize,
                disk,
                sector,
                nsectors: len,
                su_offset,
                raid_addr: addr,
            });
            asm.nsectors += len;
            addr += len;
        }
        for asm in stripes.iter_mut() {
            asm.finish(failed_disks);
        }
        Ok(AccessMap{raid_addr, nsectors, stripes})
    }

    /// Map the entirety of parity stripe `psid`
    pub fn map_stripe(&self, psid: PsidT, failed_disks: &FixedBitSet)
        -> Result<AccessStripeMap>
    {
        if psid >= self.stripes() {
            return Err(Error::ENOSPC);
        }
        let len = self.scheme.data_cols() as SectorT * self.sectors_per_su;
        let mut am = self.map_access(self.scheme.stripe_addr(psid), len,
                                     failed_disks)?;
        am.stripes.pop().ok_or(Error::EDOOFUS)
    }
}

#[cfg(test)]
mod t {
    use pretty_assertions::assert_eq;
    use super::*;
    use crate::raid::SchemeKind;

    fn layout(scheme: SchemeKind, disks: DiskT) -> ArrayLayout {
        let config = ArrayConfig::new(scheme, disks, 1024);
        ArrayLayout::new(&config).unwrap()
    }

    fn nofail(layout: &ArrayLayout) -> FixedBitSet {
        FixedBitSet::with_capacity(usize::from(layout.ndisks))
    }

    #[test]
    fn zero_length() {
        let l = layout(SchemeKind::EvenOdd, 5);
        let r = l.map_access(0, 0, &nofail(&l));
        assert_eq!(r.unwrap_err(), Error::EINVAL);
    }

    #[test]
    fn past_capacity() {
        let l = layout(SchemeKind::EvenOdd, 5);
        let cap = l.capacity();
        let r = l.map_access(cap - 1, 2, &nofail(&l));
        assert_eq!(r.unwrap_err(), Error::ENOSPC);
        assert!(l.map_access(cap - 1, 1, &nofail(&l)).is_ok());
    }

    /// An access spanning two stripes, starting mid-stripe-unit
    #[test]
    fn evenodd_split() {
        let l = layout(SchemeKind::EvenOdd, 5);
        // 3 data columns of 8 sectors each
        let am = l.map_access(20, 10, &nofail(&l)).unwrap();
        assert_eq!(am.stripes.len(), 2);
        let a0 = &am.stripes[0];
        assert_eq!(a0.psid, 0);
        assert_eq!(a0.nsectors, 4);
        assert_eq!(a0.data.len(), 1);
        assert_eq!(a0.data[0].col, 2);
        assert_eq!(a0.data[0].su_offset, 4);
        assert_eq!(a0.data[0].sector, 4);
        assert_eq!(a0.redundancy.len(), 2);
        assert_eq!(a0.redundancy[0].su_offset, 4);
        assert_eq!(a0.redundancy[0].nsectors, 4);
        let a1 = &am.stripes[1];
        assert_eq!(a1.psid, 1);
        assert_eq!(a1.raid_addr, 24);
        assert_eq!(a1.nsectors, 6);
        assert_eq!(a1.data[0].col, 0);
        assert_eq!(a1.data[0].sector, 8);
        assert!(!a1.is_full_stripe());
    }

    #[test]
    fn full_stripe() {
        let l = layout(SchemeKind::EvenOdd, 5);
        let asm = l.map_stripe(3, &nofail(&l)).unwrap();
        assert!(asm.is_full_stripe());
        assert_eq!(asm.su_range(), (0, 8));
        assert_eq!(asm.data.iter().map(|p| p.col).collect::<Vec<_>>(),
                   vec![0, 1, 2]);
    }

    #[test]
    fn failed_columns() {
        let l = layout(SchemeKind::EvenOdd, 5);
        let mut failed = nofail(&l);
        let (disks, _) = l.scheme().identify_stripe(0);
        failed.insert(usize::from(disks[1]));
        failed.insert(usize::from(disks[4]));
        let asm = l.map_stripe(0, &failed).unwrap();
        assert_eq!(asm.failed.ones().collect::<Vec<_>>(), vec![1, 4]);
        assert_eq!(asm.failed_data_cols(), vec![1]);
        assert_eq!(asm.num_failed(), 2);
    }

    /// Mirrors put each stripe unit in its own parity stripe
    #[test]
    fn mirror_units() {
        let l = layout(SchemeKind::Mirror, 4);
        let am = l.map_access(4, 16, &nofail(&l)).unwrap();
        assert_eq!(am.stripes.len(), 3);
        assert_eq!(am.psids().collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(am.stripes[0].disks, vec![0, 1]);
        assert_eq!(am.stripes[1].disks, vec![2, 3]);
        assert_eq!(am.stripes[2].disks, vec![0, 1]);
        assert_eq!(am.stripes[2].data[0].sector, 8);
        assert_eq!(am.stripes[2].redundancy[0].disk, 1);
        assert_eq!(am.stripes[2].redundancy[0].sector, 8);
    }
}
