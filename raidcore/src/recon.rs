// vim: tw=80
//! Reconstruction buffer management
//!
//! While a failed disk is rebuilt, each of its stripe units is recomputed by
//! XORing one stripe unit from every surviving column of its parity stripe.
//! Those contributions arrive in any order, from reads of different disks.
//! The [`ReconBufferPool`] accumulates them per parity stripe, and hands out
//! each stripe's result once every needed column has contributed.

use divbuf::DivBufShared;
use fixedbitset::FixedBitSet;
use futures::{
    FutureExt,
    channel::oneshot,
    future::{self, BoxFuture},
};
use std::{
    collections::{BTreeMap, VecDeque},
    mem,
    sync::Mutex,
};

use crate::{
    config::ReconConfig,
    raid::codec,
    types::*,
};

/// Who owns a [`ReconBuffer`]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BufKind {
    /// Belongs to the pool, and is shared among all stripes
    Floating,
    /// Belongs to whoever submitted it
    Exclusive,
}

/// A buffer that accumulates the reconstruction of one stripe unit
#[derive(Debug)]
pub struct ReconBuffer {
    buf: DivBufShared,
    pub psid: PsidT,
    /// Column whose data this buffer holds, or the first column that
    /// contributed to it
    pub col: usize,
    /// Where the result belongs on the disk being rebuilt
    pub failed_sector: SectorT,
    /// Number of contributions combined into this buffer
    pub count: usize,
    pub kind: BufKind,
}

impl ReconBuffer {
    /// A zero-filled exclusive buffer
    pub fn new(len: usize, psid: PsidT, col: usize, failed_sector: SectorT)
        -> Self
    {
        ReconBuffer {
            buf: DivBufShared::from(vec![0u8; len]),
            psid,
            col,
            failed_sector,
            count: 1,
            kind: BufKind::Exclusive
        }
    }

    fn floating(len: usize) -> Self {
        ReconBuffer {
            kind: BufKind::Floating,
            count: 0,
            ..ReconBuffer::new(len, 0, 0, 0)
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Buffer suitable for reading a stripe unit from disk
    pub fn io_buf(&self) -> Result<IoVecMut> {
        self.buf.try_mut().map_err(|_| Error::EDOOFUS)
    }

    pub fn contents(&self) -> Result<IoVec> {
        self.buf.try_const().map_err(|_| Error::EDOOFUS)
    }
}

/// A future that completes when the condition waited for holds, or fails with
/// `ECANCELED` if the pool aborts first
pub type WaitFut = BoxFuture<'static, Result<()>>;

fn wait_on(rx: oneshot::Receiver<()>) -> WaitFut {
    rx.map(|r| r.map_err(|_| Error::ECANCELED)).boxed()
}

/// Result of [`ReconBufferPool::submit`]
pub enum Submitted {
    Accepted {
        /// The submitter's buffer, if the pool no longer needs it
        returned: Option<ReconBuffer>,
        /// Did this contribution complete the stripe?
        full: bool,
    },
    /// A floating buffer was needed, but none was available.  Resubmit the
    /// returned buffer once `wait` completes.
    Blocked {
        rbuf: ReconBuffer,
        wait: WaitFut,
    },
}

impl std::fmt::Debug for Submitted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Submitted::Accepted{returned, full} => f.debug_struct("Accepted")
                .field("returned", returned)
                .field("full", full)
                .finish(),
            Submitted::Blocked{rbuf, ..} => f.debug_struct("Blocked")
                .field("rbuf", rbuf)
                .finish_non_exhaustive()
        }
    }
}

/// Parity-stripe status: reconstruction progress of one stripe
#[derive(Debug)]
struct StripeStatus {
    failed_sector: SectorT,
    /// Buffer accumulating the result
    target: Option<ReconBuffer>,
    /// Contributions not yet combined into `target`
    pending: Vec<ReconBuffer>,
    /// Columns that have contributed so far
    contributed: FixedBitSet,
    full: bool,
    /// Tasks waiting for this stripe to become full, oldest first
    waiters: VecDeque<oneshot::Sender<()>>,
}

impl StripeStatus {
    fn new(ncols: usize, failed_sector: SectorT) -> Self {
        StripeStatus {
            failed_sector,
            target: None,
            pending: Vec::new(),
            contributed: FixedBitSet::with_capacity(ncols),
            full: false,
            waiters: VecDeque::new(),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    /// Idle floating buffers
    floating: Vec<ReconBuffer>,
    /// Idle floating buffers already promised to somebody
    committed: usize,
    pss: BTreeMap<PsidT, StripeStatus>,
    /// Completed buffers not yet claimed, sorted by sector on the failed disk
    full: VecDeque<ReconBuffer>,
    full_waiters: VecDeque<oneshot::Sender<ReconBuffer>>,
    /// Submitters waiting for a floating buffer, and the stripes they want to
    /// contribute to
    buffer_waiters: VecDeque<(PsidT, oneshot::Sender<()>)>,
    aborting: bool,
}

impl Inner {
    /// Return a floating buffer to the pool, waking somebody who needs one
    fn release_floating(&mut self, rbuf: ReconBuffer) {
        debug_assert_eq!(rbuf.kind, BufKind::Floating);
        self.floating.push(rbuf);
        while let Some((_, w)) = self.buffer_waiters.pop_front() {
            if w.send(()).is_ok() {
                break;
            }
        }
    }

    /// Wake every submitter blocked on `psid`
    fn wake_stripe(&mut self, psid: PsidT) {
        let (wake, keep) = mem::take(&mut self.buffer_waiters)
            .into_iter()
            .partition::<VecDeque<_>, _>(|(p, _)| *p == psid);
        self.buffer_waiters = keep;
        for (_, w) in wake {
            let _ = w.send(());
        }
    }

    fn has_floating(&self, use_committed: bool) -> bool {
        if use_committed {
            self.committed > 0 && !self.floating.is_empty()
        } else {
            self.floating.len() > self.committed
        }
    }

    /// Take an idle floating buffer, if allowed
    fn take_floating(&mut self, use_committed: bool) -> Option<ReconBuffer> {
        if use_committed {
            if self.committed == 0 {
                return None;
            }
            self.committed -= 1;
            self.floating.pop()
        } else if self.floating.len() > self.committed {
            self.floating.pop()
        } else {
            None
        }
    }

    /// Put a completed buffer where [`ReconBufferPool::get_full`] will find it
    fn deliver(&mut self, mut rbuf: ReconBuffer) {
        while let Some(w) = self.full_waiters.pop_front() {
            match w.send(rbuf) {
                Ok(()) => return,
                // That waiter gave up
                Err(r) => rbuf = r
            }
        }
        let pos = self.full
            .partition_point(|b| b.failed_sector <= rbuf.failed_sector);
        self.full.insert(pos, rbuf);
    }
}

/// A [`ReconBufferPool::get_full`] caller's place in line.
///
/// If the caller goes away after a buffer was sent to it, but before receiving
/// it, the buffer is delivered again.
struct FullReceiver<'a> {
    inner: &'a Mutex<Inner>,
    rx: oneshot::Receiver<ReconBuffer>,
}

impl Drop for FullReceiver<'_> {
    fn drop(&mut self) {
        self.rx.close();
        if let Ok(Some(rbuf)) = self.rx.try_recv() {
            tracing::debug!(psid = rbuf.psid, "full buffer unclaimed");
            self.inner.lock().unwrap().deliver(rbuf);
        }
    }
}

/// XOR every pending contribution into the stripe's target buffer.
///
/// Returns the pending buffers, which are no longer needed.
fn multi_way_xor(pss: &mut StripeStatus, extra: Option<&ReconBuffer>)
    -> Result<Vec<ReconBuffer>>
{
    let pending = mem::take(&mut pss.pending);
    let target = pss.target.as_mut().ok_or(Error::EDOOFUS)?;
    let srcs = pending.iter()
        .chain(extra)
        .map(ReconBuffer::contents)
        .collect::<Result<Vec<_>>>()?;
    if !srcs.is_empty() {
        let refs = srcs.iter().map(|s| &s[..]).collect::<Vec<_>>();
        let mut t = target.io_buf()?;
        codec::accumulate(&mut t[..], &refs);
        target.count += srcs.len();
    }
    Ok(pending)
}

/// Pool of reconstruction buffers for one array row
pub struct ReconBufferPool {
    /// Contributions needed to complete a stripe
    ndata: usize,
    /// Columns per stripe
    ncols: usize,
    su_bytes: usize,
    /// Hold up to this many contributions before combining them
    accumulate: usize,
    inner: Mutex<Inner>,
}

impl ReconBufferPool {
    pub fn new(ndata: usize, ncols: usize, su_bytes: usize,
               config: &ReconConfig) -> Self
    {
        let floating = (0..config.floating_buffers)
            .map(|_| ReconBuffer::floating(su_bytes))
            .collect();
        let inner = Inner{floating, ..Default::default()};
        ReconBufferPool {
            ndata,
            ncols,
            su_bytes,
            accumulate: config.bufs_to_accumulate.max(1),
            inner: Mutex::new(inner)
        }
    }

    /// Contributions needed to complete a stripe
    pub fn ndata(&self) -> usize {
        self.ndata
    }

    /// Offer one surviving column's stripe unit.
    ///
    /// With `keep_interim`, the pool copies the data into a floating buffer if
    /// it needs to keep it, and hands the caller's buffer back.  With
    /// `use_committed`, that floating buffer comes from a reservation
    /// previously made with [`commit_floating`](Self::commit_floating).
    pub fn submit(&self, rbuf: ReconBuffer, keep_interim: bool,
                  use_committed: bool) -> Result<Submitted>
    {
        if rbuf.len() != self.su_bytes || rbuf.col >= self.ncols {
            return Err(Error::EINVAL);
        }
        let psid = rbuf.psid;
        let col = rbuf.col;
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        if inner.aborting {
            return Err(Error::ECANCELED);
        }
        let have_floating = inner.has_floating(use_committed);
        let (has_target, npending, ncontributed) = match inner.pss.get(&psid) {
            Some(pss) if pss.full || pss.contributed.contains(col) => {
                tracing::debug!(psid, col, "duplicate contribution");
                return Err(Error::EEXIST);
            }
            Some(pss) => (pss.target.is_some(), pss.pending.len(),
                          pss.contributed.count_ones(..)),
            None => (false, 0, 0)
        };
        let last = ncontributed + 1 >= self.ndata;
        let mut returned = None;
        let mut spent = Vec::new();
        if has_target && (last || npending + 1 >= self.accumulate ||
                          (keep_interim && !have_floating))
        {
            // Combine everything outstanding right away
            let pss = inner.pss.get_mut(&psid).ok_or(Error::EDOOFUS)?;
            spent = multi_way_xor(pss, Some(&rbuf))?;
            match rbuf.kind {
                BufKind::Floating => spent.push(rbuf),
                BufKind::Exclusive => returned = Some(rbuf),
            }
        } else {
            let installed = if keep_interim {
                let Some(mut fb) = inner.take_floating(use_committed) else {
                    let (tx, rx) = oneshot::channel();
                    inner.buffer_waiters.push_back((psid, tx));
                    tracing::debug!(psid, col, "no floating buffer");
                    return Ok(Submitted::Blocked{rbuf, wait: wait_on(rx)});
                };
                {
                    let src = rbuf.contents()?;
                    fb.io_buf()?[..].copy_from_slice(&src[..]);
                }
                fb.psid = psid;
                fb.col = col;
                fb.failed_sector = rbuf.failed_sector;
                fb.count = 1;
                returned = Some(rbuf);
                fb
            } else {
                rbuf
            };
            let ncols = self.ncols;
            let failed_sector = installed.failed_sector;
            let pss = inner.pss.entry(psid)
                .or_insert_with(|| StripeStatus::new(ncols, failed_sector));
            if pss.target.is_none() {
                pss.target = Some(installed);
                // Anyone blocked on this stripe can now combine directly
                inner.wake_stripe(psid);
            } else {
                pss.pending.push(installed);
            }
        }
        let pss = inner.pss.get_mut(&psid).ok_or(Error::EDOOFUS)?;
        pss.contributed.insert(col);
        for b in spent {
            if b.kind == BufKind::Floating {
                inner.release_floating(b);
            }
        }
        let full = self.check_full(inner, psid)?;
        Ok(Submitted::Accepted{returned, full})
    }

    /// If every needed column of `psid` has contributed, finish combining and
    /// move its buffer to the full list.  Then release everyone waiting on
    /// the stripe, oldest first.
    fn check_full(&self, inner: &mut Inner, psid: PsidT) -> Result<bool> {
        let Some(pss) = inner.pss.get_mut(&psid) else {
            return Ok(false);
        };
        if pss.full {
            return Ok(true);
        }
        if pss.contributed.count_ones(..) < self.ndata {
            return Ok(false);
        }
        let spent = multi_way_xor(pss, None)?;
        pss.full = true;
        let target = pss.target.take().ok_or(Error::EDOOFUS)?;
        let waiters = mem::take(&mut pss.waiters);
        tracing::debug!(psid, sector = pss.failed_sector, "stripe full");
        for b in spent {
            if b.kind == BufKind::Floating {
                inner.release_floating(b);
            }
        }
        inner.deliver(target);
        for w in waiters {
            // The waiter may have given up
            let _ = w.send(());
        }
        Ok(true)
    }

    /// Has every needed column of `psid` contributed?
    pub fn is_full(&self, psid: PsidT) -> bool {
        self.inner.lock().unwrap().pss.get(&psid)
            .map(|pss| pss.full)
            .unwrap_or(false)
    }

    /// Is the pool tracking `psid`?
    pub fn is_tracked(&self, psid: PsidT) -> bool {
        self.inner.lock().unwrap().pss.contains_key(&psid)
    }

    /// Number of distinct columns that have contributed to `psid`
    pub fn contributions(&self, psid: PsidT) -> usize {
        self.inner.lock().unwrap().pss.get(&psid)
            .map(|pss| pss.contributed.count_ones(..))
            .unwrap_or(0)
    }

    /// Idle floating buffers, including committed ones
    pub fn nfloating(&self) -> usize {
        self.inner.lock().unwrap().floating.len()
    }

    /// Wait for any stripe to complete, and take its buffer.
    ///
    /// Buffers are handed out lowest failed-disk sector first, and callers
    /// are served in the order they started waiting.
    pub async fn get_full(&self) -> Result<ReconBuffer> {
        let mut fr = {
            let mut inner = self.inner.lock().unwrap();
            if inner.aborting {
                return Err(Error::ECANCELED);
            }
            if let Some(rbuf) = inner.full.pop_front() {
                return Ok(rbuf);
            }
            let (tx, rx) = oneshot::channel();
            inner.full_waiters.push_back(tx);
            FullReceiver{inner: &self.inner, rx}
        };
        (&mut fr.rx).await.map_err(|_| Error::ECANCELED)
    }

    /// Return a floating buffer, obtained from `get_full`, to the pool.
    /// Exclusive buffers are simply dropped.
    pub fn release_floating(&self, rbuf: ReconBuffer) {
        if rbuf.kind == BufKind::Floating {
            self.inner.lock().unwrap().release_floating(rbuf);
        }
    }

    /// Reserve one idle floating buffer for a later `submit` with
    /// `use_committed`.
    pub fn commit_floating(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.floating.len() > inner.committed {
            inner.committed += 1;
            Ok(())
        } else {
            Err(Error::EBUSY)
        }
    }

    /// Wait until `psid` is full.  Completes immediately if it already is, or
    /// if the pool isn't tracking it.
    pub fn wait_for_stripe(&self, psid: PsidT) -> WaitFut {
        let mut inner = self.inner.lock().unwrap();
        if inner.aborting {
            return future::err(Error::ECANCELED).boxed();
        }
        match inner.pss.get_mut(&psid) {
            Some(pss) if !pss.full => {
                let (tx, rx) = oneshot::channel();
                pss.waiters.push_back(tx);
                wait_on(rx)
            }
            _ => future::ok(()).boxed()
        }
    }

    /// Forget about `psid`, once its result has been written.
    ///
    /// Anyone still waiting on it is released before the record is destroyed.
    /// If its result was never claimed from the full list, that goes too.
    pub fn complete_stripe(&self, psid: PsidT) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let mut pss = inner.pss.remove(&psid).ok_or(Error::EINVAL)?;
        for w in pss.waiters.drain(..) {
            let _ = w.send(());
        }
        let mut leftovers = pss.pending.drain(..)
            .chain(pss.target.take())
            .collect::<Vec<_>>();
        loop {
            let Some(i) = inner.full.iter().position(|b| b.psid == psid) else {
                break;
            };
            leftovers.extend(inner.full.remove(i));
        }
        for b in leftovers {
            if b.kind == BufKind::Floating {
                inner.release_floating(b);
            }
        }
        Ok(())
    }

    /// Fail every waiter with `ECANCELED`, and refuse new submissions
    pub fn abort(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.aborting = true;
        inner.full_waiters.clear();
        inner.buffer_waiters.clear();
        for pss in inner.pss.values_mut() {
            pss.waiters.clear();
        }
        tracing::debug!("reconstruction aborted");
    }
}
