// vim: tw=80
//! A complete RAID array: layout, scheduling, graph execution, verification
//! and rebuild, tied together over a [`Transport`].

use divbuf::DivBufShared;
use fixedbitset::FixedBitSet;
use futures::future;
use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use crate::{
    config::ArrayConfig,
    dag::{OpKind, build_degraded_dag, engine},
    disk_queue::Priority,
    dispatch::Dispatcher,
    health::Health,
    layout::{AccessMap, AccessStripeMap, ArrayLayout},
    recon::{ReconBuffer, ReconBufferPool, Submitted},
    shutdown::ShutdownList,
    transport::Transport,
    types::*,
};

/// State of one member disk
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DiskState {
    Online,
    Failed,
    /// Replaced, and valid for every parity stripe below `upto`
    Rebuilding { upto: PsidT },
}

/// Return value of [`Array::status`]
#[derive(Clone, Debug)]
pub struct Status {
    pub health: Health,
    pub disks: Vec<DiskState>,
}

/// Outcome of [`Array::verify_redundancy`]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ParityStatus {
    /// Redundancy matches the data
    Okay,
    /// Redundancy is stale, and was left alone
    Bad,
    /// Redundancy was stale, and has been rewritten
    Corrected,
    /// A data column of the stripe is missing, so there is nothing to check
    /// against
    CouldNotVerify,
}

/// Serializes accesses to each parity stripe.
///
/// A stripe's lock exists only while somebody holds it or waits for it.
#[derive(Default)]
struct StripeLocks {
    /// Each lock, and how many callers are using it
    locks: Mutex<BTreeMap<PsidT, (futures_locks::Mutex<()>, usize)>>,
}

/// One caller's use of a stripe lock
struct StripeRef<'a> {
    locks: &'a StripeLocks,
    psid: PsidT,
    mtx: futures_locks::Mutex<()>,
}

impl Drop for StripeRef<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.locks.lock().unwrap();
        if let Some((_, users)) = locks.get_mut(&self.psid) {
            *users -= 1;
            if *users == 0 {
                locks.remove(&self.psid);
            }
        }
    }
}

/// Exclusive access to one parity stripe
struct StripeGuard<'a> {
    // Must drop before _sref
    _guard: futures_locks::MutexGuard<()>,
    _sref: StripeRef<'a>,
}

impl StripeLocks {
    fn get(&self, psid: PsidT) -> StripeRef<'_> {
        let mut locks = self.locks.lock().unwrap();
        let (mtx, users) = locks.entry(psid)
            .or_insert_with(|| (futures_locks::Mutex::new(()), 0));
        *users += 1;
        StripeRef{locks: self, psid, mtx: mtx.clone()}
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().unwrap().len()
    }

    /// Lock every stripe in `psids`, in ascending order.
    ///
    /// If a stripe is already locked, its queued I/O is promoted on every disk
    /// before waiting, so that background work on it finishes sooner.
    async fn lock(&self, disp: &Dispatcher, psids: &[PsidT])
        -> Vec<StripeGuard<'_>>
    {
        let mut psids = psids.to_vec();
        psids.sort_unstable();
        psids.dedup();
        let mut guards = Vec::with_capacity(psids.len());
        for psid in psids {
            let sref = self.get(psid);
            let guard = match sref.mtx.try_lock() {
                Ok(g) => g,
                Err(_) => {
                    let n = disp.promote_stripe(psid);
                    tracing::debug!(psid, promoted = n, "stripe contended");
                    sref.mtx.lock().await
                }
            };
            guards.push(StripeGuard{_guard: guard, _sref: sref});
        }
        guards
    }
}

/// Clears the one-rebuild-at-a-time flag when the rebuild ends, however it
/// ends
struct RebuildFlag<'a>(&'a AtomicBool);

impl Drop for RebuildFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Forgets a stripe's reconstruction record when dropped, so that a failed or
/// abandoned stripe rebuild can be retried
struct ReconStripe<'a> {
    pool: &'a ReconBufferPool,
    psid: PsidT,
}

impl Drop for ReconStripe<'_> {
    fn drop(&mut self) {
        // EINVAL if nothing was ever submitted
        let _ = self.pool.complete_stripe(self.psid);
    }
}

pub struct Array {
    config: ArrayConfig,
    layout: ArrayLayout,
    disp: Arc<Dispatcher>,
    recon: Arc<ReconBufferPool>,
    disks: Mutex<Vec<DiskState>>,
    locks: StripeLocks,
    rebuilding: AtomicBool,
    shutdown: Mutex<ShutdownList>,
}

impl Array {
    /// Activate an array.  Its redundancy scheme is fixed from here on.
    pub fn new(config: ArrayConfig, transport: Arc<dyn Transport>)
        -> Result<Self>
    {
        let layout = ArrayLayout::new(&config)?;
        let disp = Arc::new(Dispatcher::new(config.disks,
            config.queue.discipline, config.queue.depth, transport));
        let scheme = layout.scheme();
        let ncols = scheme.data_cols() + scheme.redundancy_cols();
        let recon = Arc::new(ReconBufferPool::new(scheme.data_cols(), ncols,
            layout.bytes_per_su(), &config.recon));

        let mut shutdown = ShutdownList::new();
        let disp2 = disp.clone();
        shutdown.push("dispatcher", move || disp2.abort());
        let recon2 = recon.clone();
        shutdown.push("reconstruction buffers", move || recon2.abort());

        let disks = vec![DiskState::Online; usize::from(config.disks)];
        Ok(Array {
            config,
            layout,
            disp,
            recon,
            disks: Mutex::new(disks),
            locks: StripeLocks::default(),
            rebuilding: AtomicBool::new(false),
            shutdown: Mutex::new(shutdown),
        })
    }

    pub fn config(&self) -> &ArrayConfig {
        &self.config
    }

    pub fn layout(&self) -> &ArrayLayout {
        &self.layout
    }

    /// Usable size in sectors
    pub fn capacity(&self) -> SectorT {
        self.layout.capacity()
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.disp
    }

    pub fn recon_pool(&self) -> &Arc<ReconBufferPool> {
        &self.recon
    }

    pub fn disk_state(&self, disk: DiskT) -> Option<DiskState> {
        self.disks.lock().unwrap().get(usize::from(disk)).copied()
    }

    /// Mark a member disk as failed.  From now on it is neither read nor
    /// written.
    pub fn fail_disk(&self, disk: DiskT) -> Result<()> {
        let mut disks = self.disks.lock().unwrap();
        let state = disks.get_mut(usize::from(disk)).ok_or(Error::ENXIO)?;
        *state = DiskState::Failed;
        tracing::warn!(disk, "disk failed");
        Ok(())
    }

    /// Note that a failed disk has been replaced by a blank one.  It remains
    /// unreadable until [`rebuild`](Self::rebuild) restores its contents.
    pub fn replace_disk(&self, disk: DiskT) -> Result<()> {
        let mut disks = self.disks.lock().unwrap();
        let state = disks.get_mut(usize::from(disk)).ok_or(Error::ENXIO)?;
        if *state != DiskState::Failed {
            return Err(Error::EINVAL);
        }
        *state = DiskState::Rebuilding{upto: 0};
        tracing::debug!(disk, "disk replaced");
        Ok(())
    }

    /// Overall health.
    ///
    /// Faulted if any parity stripe has lost more columns than the scheme
    /// can tolerate.
    pub fn health(&self) -> Health {
        let disks = self.disks.lock().unwrap();
        let scheme = self.layout.scheme();
        // Placement repeats with a period of at most ndisks stripes
        let nstripes = self.layout.stripes().min(PsidT::from(scheme.ndisks()));
        let worst = (0..nstripes).map(|psid| {
            scheme.stripe_disks(psid).iter()
                .filter(|d| disks[usize::from(**d)] != DiskState::Online)
                .count()
        }).max().unwrap_or(0);
        let rebuilding = disks.iter()
            .any(|s| matches!(s, DiskState::Rebuilding{..}));
        match Health::from_failures(worst, scheme.fault_tolerance()) {
            Health::Faulted => Health::Faulted,
            _ if rebuilding => Health::Rebuilding,
            h => h
        }
    }

    pub fn status(&self) -> Status {
        Status {
            health: self.health(),
            disks: self.disks.lock().unwrap().clone()
        }
    }

    fn sectors_for(&self, len: usize) -> Result<SectorT> {
        let bps = self.layout.bytes_per_sector;
        if len % bps != 0 {
            return Err(Error::EINVAL);
        }
        Ok((len / bps) as SectorT)
    }

    /// Parity stripes touched by an access, without regard to failures
    fn psids(&self, raid_addr: SectorT, nsectors: SectorT)
        -> Result<Vec<PsidT>>
    {
        let none = FixedBitSet::with_capacity(usize::from(self.layout.ndisks));
        let map = self.layout.map_access(raid_addr, nsectors, &none)?;
        Ok(map.psids().collect())
    }

    /// Map an access using the current disk states.
    ///
    /// Must be called with the access's stripes locked.
    fn map_access(&self, raid_addr: SectorT, nsectors: SectorT)
        -> Result<AccessMap>
    {
        let disks = self.disks.lock().unwrap().clone();
        let mut failed = FixedBitSet::with_capacity(disks.len());
        for (i, s) in disks.iter().enumerate() {
            if *s != DiskState::Online {
                failed.insert(i);
            }
        }
        let mut map = self.layout.map_access(raid_addr, nsectors, &failed)?;
        for asm in map.stripes.iter_mut() {
            // Columns already rebuilt count as healthy
            for col in 0..asm.ncols() {
                let disk = usize::from(asm.disks[col]);
                if let DiskState::Rebuilding{upto} = disks[disk] {
                    if asm.psid < upto {
                        asm.failed.set(col, false);
                    }
                }
            }
        }
        Ok(map)
    }

    fn map_stripe(&self, psid: PsidT) -> Result<AccessMap> {
        let scheme = self.layout.scheme();
        let len = scheme.data_cols() as SectorT * self.layout.sectors_per_su;
        self.map_access(scheme.stripe_addr(psid), len)
    }

    /// Read `buf.len()` bytes starting at logical sector `raid_addr`
    #[tracing::instrument(skip(self, buf), fields(len = buf.len()))]
    pub async fn read_at(&self, mut buf: IoVecMut, raid_addr: SectorT)
        -> Result<()>
    {
        let nsectors = self.sectors_for(buf.len())?;
        let psids = self.psids(raid_addr, nsectors)?;
        let _guards = self.locks.lock(&self.disp, &psids).await;
        let map = self.map_access(raid_addr, nsectors)?;
        let mut dag = build_degraded_dag(&self.layout, OpKind::Read, &map,
                                         None)?;
        engine::execute(&mut dag, &self.disp).await?;
        let data = dag.read_result()?;
        buf[..].copy_from_slice(&data[..]);
        Ok(())
    }

    /// Write `buf` starting at logical sector `raid_addr`
    #[tracing::instrument(skip(self, buf), fields(len = buf.len()))]
    pub async fn write_at(&self, buf: IoVec, raid_addr: SectorT) -> Result<()> {
        let nsectors = self.sectors_for(buf.len())?;
        let psids = self.psids(raid_addr, nsectors)?;
        let _guards = self.locks.lock(&self.disp, &psids).await;
        let map = self.map_access(raid_addr, nsectors)?;
        let mut dag = build_degraded_dag(&self.layout, OpKind::Write, &map,
                                         Some(&buf[..]))?;
        engine::execute(&mut dag, &self.disp).await
    }

    /// Read whole stripe units of the given columns, in parallel.
    ///
    /// Every read is allowed to finish before returning, even if one fails.
    async fn read_units(&self, asm: &AccessStripeMap, cols: &[usize],
                        priority: Priority) -> Result<Vec<DivBufShared>>
    {
        let su = self.layout.bytes_per_su();
        let bufs = cols.iter()
            .map(|_| DivBufShared::from(vec![0u8; su]))
            .collect::<Vec<_>>();
        let futs = cols.iter().zip(bufs.iter())
            .map(|(col, dbs)| {
                let m = dbs.try_mut().map_err(|_| Error::EDOOFUS)?;
                Ok(self.disp.read_at(asm.disks[*col], m, asm.stripe_sector,
                                     priority, Some(asm.psid)))
            }).collect::<Result<Vec<_>>>()?;
        future::join_all(futs).await
            .into_iter()
            .collect::<Result<Vec<()>>>()?;
        Ok(bufs)
    }

    /// Check the redundancy of the parity stripe containing `raid_addr`
    /// against its data.
    ///
    /// A mismatch is reported, not treated as an error.  With
    /// `correct_if_wrong`, the stale redundancy units are rewritten.
    #[tracing::instrument(skip(self))]
    pub async fn verify_redundancy(&self, raid_addr: SectorT,
                                   correct_if_wrong: bool)
        -> Result<ParityStatus>
    {
        if raid_addr >= self.capacity() {
            return Err(Error::ENOSPC);
        }
        let scheme = self.layout.scheme();
        let psid = scheme.psid_of(raid_addr);
        let _guards = self.locks.lock(&self.disp, &[psid]).await;
        let map = self.map_stripe(psid)?;
        let asm = map.stripes.first().ok_or(Error::EDOOFUS)?;
        if !asm.failed_data_cols().is_empty() {
            return Ok(ParityStatus::CouldNotVerify);
        }
        let k = asm.data_cols;
        let cols = (0..asm.ncols()).collect::<Vec<_>>();
        let live = cols.iter()
            .copied()
            .filter(|c| !asm.is_failed(*c))
            .collect::<Vec<_>>();
        let mut units = self.read_units(asm, &live, Priority::Normal).await?
            .into_iter();
        let su = self.layout.bytes_per_su();
        let bufs = cols.iter()
            .map(|c| if asm.is_failed(*c) {
                DivBufShared::from(vec![0u8; su])
            } else {
                units.next().unwrap_or_else(|| DivBufShared::from(Vec::new()))
            }).collect::<Vec<_>>();
        let consts = bufs.iter()
            .map(|b| b.try_const().map_err(|_| Error::EDOOFUS))
            .collect::<Result<Vec<_>>>()?;
        let data = consts[..k].iter().map(|b| &b[..]).collect::<Vec<_>>();
        let redundancy = consts[k..].iter().map(|b| &b[..]).collect::<Vec<_>>();
        let mut bad = scheme.verify(&data, &redundancy);
        for col in k..asm.ncols() {
            // A missing unit isn't a stale one
            if asm.is_failed(col) {
                bad.set(col - k, false);
            }
        }
        if bad.count_ones(..) == 0 {
            return Ok(ParityStatus::Okay);
        }
        tracing::warn!(psid, bad = ?bad.ones().collect::<Vec<_>>(),
                       "redundancy mismatch");
        if !correct_if_wrong {
            return Ok(ParityStatus::Bad);
        }
        let mut expected = vec![vec![0u8; su]; asm.ncols() - k];
        {
            let mut out = expected.iter_mut()
                .map(|v| &mut v[..])
                .collect::<Vec<_>>();
            scheme.compute_redundancy(&data, &mut out);
        }
        let fixes = bad.ones()
            .map(|i| (asm.disks[k + i], DivBufShared::from(expected[i].clone())))
            .collect::<Vec<_>>();
        let futs = fixes.iter()
            .map(|(disk, dbs)| {
                let b = dbs.try_const().map_err(|_| Error::EDOOFUS)?;
                Ok(self.disp.write_at(*disk, b, asm.stripe_sector,
                                      Priority::Normal, Some(psid)))
            }).collect::<Result<Vec<_>>>()?;
        future::join_all(futs).await
            .into_iter()
            .collect::<Result<Vec<()>>>()?;
        Ok(ParityStatus::Corrected)
    }

    /// Restore the contents of a replaced disk, one parity stripe at a time.
    ///
    /// Foreground I/O may continue meanwhile.  Stripes already rebuilt are
    /// served from the new disk.
    #[tracing::instrument(skip(self))]
    pub async fn rebuild(&self, disk: DiskT) -> Result<()> {
        match self.disk_state(disk) {
            Some(DiskState::Rebuilding{..}) => (),
            Some(_) => return Err(Error::EINVAL),
            None => return Err(Error::ENXIO),
        }
        if self.rebuilding.swap(true, Ordering::AcqRel) {
            return Err(Error::EBUSY);
        }
        let r = {
            let _busy = RebuildFlag(&self.rebuilding);
            self.rebuild_stripes(disk).await
        };
        match r {
            Ok(()) => {
                let mut disks = self.disks.lock().unwrap();
                disks[usize::from(disk)] = DiskState::Online;
                tracing::info!(disk, "rebuild complete");
            }
            Err(e) => tracing::warn!(disk, "rebuild failed: {}", e)
        }
        r
    }

    /// Rebuild every stripe from the disk's mark onward.  Stripes finished by
    /// an interrupted rebuild are not redone.
    async fn rebuild_stripes(&self, disk: DiskT) -> Result<()> {
        let scheme = self.layout.scheme();
        let start = match self.disk_state(disk) {
            Some(DiskState::Rebuilding{upto}) => upto,
            _ => return Err(Error::ECANCELED)
        };
        if start > 0 {
            tracing::debug!(disk, start, "resuming rebuild");
        }
        for psid in start..self.layout.stripes() {
            let _guards = if scheme.stripe_disks(psid).contains(&disk) {
                let guards = self.locks.lock(&self.disp, &[psid]).await;
                self.rebuild_stripe(disk, psid).await?;
                Some(guards)
            } else {
                None
            };
            let mut disks = self.disks.lock().unwrap();
            match disks.get_mut(usize::from(disk)) {
                Some(DiskState::Rebuilding{upto}) => *upto = psid + 1,
                // Failed again
                _ => return Err(Error::ECANCELED)
            }
        }
        Ok(())
    }

    async fn rebuild_stripe(&self, disk: DiskT, psid: PsidT) -> Result<()> {
        let map = self.map_stripe(psid)?;
        let asm = map.stripes.first().ok_or(Error::EDOOFUS)?;
        self.layout.scheme().check_tolerance(asm)?;
        let col = asm.disks.iter()
            .position(|d| *d == disk)
            .ok_or(Error::EDOOFUS)?;
        if asm.num_failed() == 1 && col <= asm.data_cols {
            self.rebuild_by_xor(asm, col).await
        } else {
            self.rebuild_by_decode(&map, col).await
        }
    }

    /// Recompute a data or row parity unit by XORing every other data and row
    /// parity unit, through the reconstruction buffer pool.
    async fn rebuild_by_xor(&self, asm: &AccessStripeMap, col: usize)
        -> Result<()>
    {
        let psid = asm.psid;
        let pool: &ReconBufferPool = &self.recon;
        let su = self.layout.bytes_per_su();
        let rbufs = (0..=asm.data_cols)
            .filter(|c| *c != col)
            .map(|c| ReconBuffer::new(su, psid, c, asm.stripe_sector))
            .collect::<Vec<_>>();
        let futs = rbufs.iter()
            .map(|rb| {
                let m = rb.io_buf()?;
                Ok(self.disp.read_at(asm.disks[rb.col], m, asm.stripe_sector,
                                     Priority::Low, Some(psid)))
            }).collect::<Result<Vec<_>>>()?;
        future::join_all(futs).await
            .into_iter()
            .collect::<Result<Vec<()>>>()?;

        let _stripe = ReconStripe{pool, psid};
        for mut rbuf in rbufs {
            loop {
                match pool.submit(rbuf, false, false)? {
                    Submitted::Accepted{..} => break,
                    Submitted::Blocked{rbuf: rb, wait} => {
                        wait.await?;
                        rbuf = rb;
                    }
                }
            }
        }
        let full = pool.get_full().await?;
        if full.psid != psid {
            pool.release_floating(full);
            return Err(Error::EDOOFUS);
        }
        let r = match full.contents() {
            Ok(b) => self.disp.write_at(asm.disks[col], b, asm.stripe_sector,
                                        Priority::Low, Some(psid)).await,
            Err(e) => Err(e)
        };
        pool.release_floating(full);
        r
    }

    /// Recompute any unit through a degraded read of the stripe's data, then
    /// re-encoding if the unit holds redundancy.
    async fn rebuild_by_decode(&self, map: &AccessMap, col: usize)
        -> Result<()>
    {
        let asm = map.stripes.first().ok_or(Error::EDOOFUS)?;
        let scheme = self.layout.scheme();
        let su = self.layout.bytes_per_su();
        let k = asm.data_cols;
        let mut dag = build_degraded_dag(&self.layout, OpKind::Read, map,
                                         None)?;
        dag.set_priority(Priority::Low);
        engine::execute(&mut dag, &self.disp).await?;
        let data = dag.read_result()?;
        let content = if col < k {
            data[col * su..(col + 1) * su].to_vec()
        } else {
            let dcols = data.chunks(su).collect::<Vec<_>>();
            let mut redundancy = vec![vec![0u8; su]; asm.ncols() - k];
            {
                let mut out = redundancy.iter_mut()
                    .map(|v| &mut v[..])
                    .collect::<Vec<_>>();
                scheme.compute_redundancy(&dcols, &mut out);
            }
            redundancy.swap_remove(col - k)
        };
        let dbs = DivBufShared::from(content);
        let b = dbs.try_const().map_err(|_| Error::EDOOFUS)?;
        self.disp.write_at(asm.disks[col], b, asm.stripe_sector, Priority::Low,
                           Some(asm.psid)).await
    }

    /// Abort outstanding work and run every registered teardown action
    pub fn shutdown(&self) {
        self.shutdown.lock().unwrap().run();
    }
}
