// vim: tw=80
//! Per-disk request queues with seek-minimizing dequeue order

use futures::channel::oneshot;
use serde_derive::{Deserialize, Serialize};
use std::{
    cmp::Reverse,
    collections::BTreeMap,
    mem,
    sync::Mutex,
};

use crate::types::*;

/// Seek-minimizing discipline used by a [`DiskQueue`]
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Discipline {
    /// Shortest seek time first
    Sstf,
    /// Elevator: sweep in one direction, then reverse
    Scan,
    /// Circular elevator: sweep upward, then wrap to the lowest request
    #[default]
    Cscan,
}

/// Queueing priority of a request.
///
/// `Low` requests wait in the overflow queue and are serviced only when no
/// other request is pending.  `High` is what [`DiskQueue::promote`] raises
/// requests to.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// Current sweep direction of the disk head
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Direction {
    /// Toward increasing sectors
    #[default]
    Up,
    /// Toward decreasing sectors
    Down,
}

#[derive(Debug)]
pub enum Cmd {
    ReadAt(IoVecMut),
    WriteAt(IoVec),
}

/// Identifies a queued request, for revocation
pub type ReqId = u64;

/// A single read or write command that is queued to one disk
#[derive(Debug)]
pub struct DiskRequest {
    pub sector: SectorT,
    pub cmd: Cmd,
    pub priority: Priority,
    /// The parity stripe on whose behalf this request was issued, if any
    pub psid: Option<PsidT>,
    /// Used by the dispatcher to complete this request
    pub sender: oneshot::Sender<Result<()>>,
}

impl DiskRequest {
    pub fn read_at(buf: IoVecMut, sector: SectorT, priority: Priority,
                   psid: Option<PsidT>, sender: oneshot::Sender<Result<()>>)
        -> Self
    {
        DiskRequest{sector, cmd: Cmd::ReadAt(buf), priority, psid, sender}
    }

    pub fn write_at(buf: IoVec, sector: SectorT, priority: Priority,
                    psid: Option<PsidT>, sender: oneshot::Sender<Result<()>>)
        -> Self
    {
        DiskRequest{sector, cmd: Cmd::WriteAt(buf), priority, psid, sender}
    }

    /// Length of the transfer, in bytes
    pub fn len(&self) -> usize {
        match &self.cmd {
            Cmd::ReadAt(buf) => buf.len(),
            Cmd::WriteAt(buf) => buf.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Sort key within one sub-queue.
///
/// Requests sort by priority (highest first), then by distance from the
/// queue's boundary in its sweep direction, then by arrival.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
struct Key {
    priority: Reverse<Priority>,
    order: u64,
    id: ReqId,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Side {
    Left,
    Right,
}

/// What the scheduler will service next
#[derive(Clone, Copy, Debug)]
enum Pick {
    Left,
    Right,
    /// CSCAN only: the right queue is empty, so start over from the lowest
    /// request on the left.
    Wrap,
    Lopri(Key),
}

struct Inner {
    discipline: Discipline,

    // Pending operations are stored in a pair of ordered maps, one on either
    // side of the head.  Each map's key already encodes the distance from the
    // head in that side's sweep direction, so the first entry is always the
    // nearest.
    /// Pending operations below the head
    left: BTreeMap<Key, DiskRequest>,

    /// Pending operations at or above the head
    right: BTreeMap<Key, DiskRequest>,

    /// Low priority operations, ordered by sector
    lopri: BTreeMap<Key, DiskRequest>,

    /// The sector of the last request dequeued
    head: SectorT,

    dir: Direction,

    next_id: ReqId,
}

impl Inner {
    fn new(discipline: Discipline) -> Self {
        Inner {
            discipline,
            left: BTreeMap::new(),
            right: BTreeMap::new(),
            lopri: BTreeMap::new(),
            head: 0,
            dir: Direction::Up,
            next_id: 0,
        }
    }

    fn key(&self, side: Side, priority: Priority, sector: SectorT, id: ReqId)
        -> Key
    {
        let order = match (side, self.discipline) {
            (Side::Right, _) => sector,
            // CSCAN services the left side only after wrapping, lowest first
            (Side::Left, Discipline::Cscan) => sector,
            (Side::Left, _) => u64::MAX - sector,
        };
        Key{priority: Reverse(priority), order, id}
    }

    fn lopri_key(sector: SectorT, id: ReqId) -> Key {
        Key{priority: Reverse(Priority::Low), order: sector, id}
    }

    /// Place a non-low-priority request on the correct side of the head
    fn file(&mut self, req: DiskRequest, id: ReqId) {
        let side = if req.sector >= self.head {
            Side::Right
        } else {
            Side::Left
        };
        let key = self.key(side, req.priority, req.sector, id);
        match side {
            Side::Left => self.left.insert(key, req),
            Side::Right => self.right.insert(key, req),
        };
    }

    /// Schedule the `req`
    fn sched(&mut self, req: DiskRequest) -> ReqId {
        let id = self.next_id;
        self.next_id += 1;
        if req.priority == Priority::Low {
            self.lopri.insert(Inner::lopri_key(req.sector, id), req);
        } else {
            self.file(req, id);
        }
        id
    }

    /// Low priority request closest to the head.
    ///
    /// With `allow_reverse`, the nearest in either direction wins, and a tie
    /// goes to the current direction.  Without it, the head only ascends,
    /// wrapping to the lowest request when nothing lies above.
    fn closest_to_arm(&self, allow_reverse: bool) -> Option<Key> {
        let boundary = Inner::lopri_key(self.head, 0);
        let above = self.lopri.range(boundary..).next().map(|(k, _)| *k);
        if !allow_reverse {
            return above.or_else(|| self.lopri.keys().next().copied());
        }
        let below = self.lopri.range(..boundary).next_back().map(|(k, _)| *k);
        match (below, above) {
            (None, None) => None,
            (Some(b), None) => Some(b),
            (None, Some(a)) => Some(a),
            (Some(b), Some(a)) => {
                let db = self.head - b.order;
                let da = a.order - self.head;
                if db < da || (db == da && self.dir == Direction::Down) {
                    Some(b)
                } else {
                    Some(a)
                }
            }
        }
    }

    fn select(&self) -> Option<Pick> {
        let lk = self.left.first_key_value();
        let rk = self.right.first_key_value();
        let pick = match (self.discipline, lk, rk) {
            (_, None, None) => None,
            (Discipline::Sstf, Some(_), None) => Some(Pick::Left),
            (Discipline::Sstf, None, Some(_)) => Some(Pick::Right),
            (Discipline::Sstf, Some((lk, l)), Some((rk, r))) => {
                if lk.priority != rk.priority {
                    // Reverse ordering: the smaller key has higher priority
                    if lk.priority < rk.priority {
                        Some(Pick::Left)
                    } else {
                        Some(Pick::Right)
                    }
                } else {
                    let dl = self.head - l.sector;
                    let dr = r.sector - self.head;
                    if dl < dr || (dl == dr && self.dir == Direction::Down) {
                        Some(Pick::Left)
                    } else {
                        Some(Pick::Right)
                    }
                }
            }
            (Discipline::Scan, _, _) => match self.dir {
                Direction::Up if rk.is_some() => Some(Pick::Right),
                Direction::Up => Some(Pick::Left),
                Direction::Down if lk.is_some() => Some(Pick::Left),
                Direction::Down => Some(Pick::Right),
            },
            (Discipline::Cscan, _, Some(_)) => Some(Pick::Right),
            (Discipline::Cscan, Some(_), None) => Some(Pick::Wrap),
        };
        pick.or_else(|| {
            let allow_reverse = self.discipline != Discipline::Cscan;
            self.closest_to_arm(allow_reverse).map(Pick::Lopri)
        })
    }

    /// Move the head to `sector`, and refile any requests that ended up on the
    /// wrong side of it.
    ///
    /// Within each priority class, the stale requests form one contiguous run
    /// of keys, so only those are visited.
    fn advance(&mut self, sector: SectorT) {
        self.head = sector;
        let head = self.head;
        for p in [Priority::High, Priority::Normal] {
            let lo = Key{priority: Reverse(p), order: 0, id: 0};
            let hi = Key{priority: Reverse(p), order: u64::MAX, id: ReqId::MAX};
            // Right side requests below the head
            let stale_right = self.right
                .range(lo..Key{order: head, ..lo})
                .map(|(k, _)| *k)
                .collect::<Vec<_>>();
            // Left side requests at or above the head
            let stale_left = match self.discipline {
                Discipline::Cscan => self.left
                    .range(Key{order: head, ..lo}..=hi)
                    .map(|(k, _)| *k)
                    .collect::<Vec<_>>(),
                _ => self.left
                    .range(lo..=Key{order: u64::MAX - head, ..hi})
                    .map(|(k, _)| *k)
                    .collect::<Vec<_>>(),
            };
            for k in stale_right {
                if let Some(req) = self.right.remove(&k) {
                    let key = self.key(Side::Left, p, req.sector, k.id);
                    self.left.insert(key, req);
                }
            }
            for k in stale_left {
                if let Some(req) = self.left.remove(&k) {
                    let key = self.key(Side::Right, p, req.sector, k.id);
                    self.right.insert(key, req);
                }
            }
        }
    }

    /// Get a reference to the next pending operation, if any
    fn peek_op(&self) -> Option<&DiskRequest> {
        match self.select()? {
            Pick::Left | Pick::Wrap => self.left.first_key_value().map(|kv| kv.1),
            Pick::Right => self.right.first_key_value().map(|kv| kv.1),
            Pick::Lopri(key) => self.lopri.get(&key),
        }
    }

    /// Get the next pending operation, if any
    fn pop_op(&mut self) -> Option<DiskRequest> {
        let req = match self.select()? {
            Pick::Right => {
                self.dir = Direction::Up;
                self.right.pop_first()?.1
            }
            Pick::Left => {
                self.dir = Direction::Down;
                self.left.pop_first()?.1
            }
            Pick::Wrap => {
                // Ran out of operations ahead of the head.  Go back to the
                // beginning
                mem::swap(&mut self.left, &mut self.right);
                self.dir = Direction::Up;
                self.right.pop_first()?.1
            }
            Pick::Lopri(key) => {
                let req = self.lopri.remove(&key)?;
                self.dir = if self.discipline == Discipline::Cscan ||
                    req.sector >= self.head
                {
                    Direction::Up
                } else {
                    Direction::Down
                };
                req
            }
        };
        self.advance(req.sector);
        Some(req)
    }

    fn promote(&mut self, psid: PsidT) -> usize {
        let mut n = 0;
        for side in [Side::Left, Side::Right] {
            let map = match side {
                Side::Left => &self.left,
                Side::Right => &self.right,
            };
            let keys = map.iter()
                .filter(|(k, r)| {
                    r.psid == Some(psid) && k.priority.0 < Priority::High
                }).map(|(k, _)| *k)
                .collect::<Vec<_>>();
            for k in keys {
                let map = match side {
                    Side::Left => &mut self.left,
                    Side::Right => &mut self.right,
                };
                if let Some(mut req) = map.remove(&k) {
                    req.priority = Priority::High;
                    let key = Key{priority: Reverse(Priority::High), ..k};
                    map.insert(key, req);
                    n += 1;
                }
            }
        }
        let keys = self.lopri.iter()
            .filter(|(_, r)| r.psid == Some(psid))
            .map(|(k, _)| *k)
            .collect::<Vec<_>>();
        for k in keys {
            if let Some(mut req) = self.lopri.remove(&k) {
                req.priority = Priority::High;
                self.file(req, k.id);
                n += 1;
            }
        }
        n
    }

    fn cancel(&mut self, id: ReqId) -> Option<DiskRequest> {
        for map in [&mut self.left, &mut self.right, &mut self.lopri] {
            let key = map.keys().find(|k| k.id == id).copied();
            if let Some(k) = key {
                return map.remove(&k);
            }
        }
        None
    }

    fn len(&self) -> usize {
        self.left.len() + self.right.len() + self.lopri.len()
    }
}

/// Queue of pending requests for one member disk.
///
/// Requests may not be dequeued in the order they were scheduled.  All methods
/// take the queue's own lock, and none of them block.
pub struct DiskQueue {
    inner: Mutex<Inner>,
}

impl DiskQueue {
    pub fn new(discipline: Discipline) -> Self {
        DiskQueue{inner: Mutex::new(Inner::new(discipline))}
    }

    pub fn discipline(&self) -> Discipline {
        self.inner.lock().unwrap().discipline
    }

    /// Sector of the most recently dequeued request
    pub fn head(&self) -> SectorT {
        self.inner.lock().unwrap().head
    }

    pub fn direction(&self) -> Direction {
        self.inner.lock().unwrap().dir
    }

    /// Enqueue a request.  The returned id may later be used to revoke it.
    pub fn schedule(&self, req: DiskRequest) -> ReqId {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.sched(req);
        tracing::trace!(id, head = inner.head, "scheduled");
        id
    }

    /// Dequeue the next request to issue, if any.
    ///
    /// `None` simply means there's no work.
    pub fn next(&self) -> Option<DiskRequest> {
        self.inner.lock().unwrap().pop_op()
    }

    /// Sector of the request that [`next`](Self::next) would return
    pub fn peek(&self) -> Option<SectorT> {
        self.inner.lock().unwrap().peek_op().map(|r| r.sector)
    }

    /// Raise every queued request belonging to `psid` to `High` priority.
    ///
    /// Returns the number of requests promoted.
    pub fn promote(&self, psid: PsidT) -> usize {
        let n = self.inner.lock().unwrap().promote(psid);
        if n > 0 {
            tracing::debug!(psid, n, "promoted");
        }
        n
    }

    /// Revoke a request that has not yet been dequeued.
    pub fn cancel(&self, id: ReqId) -> Option<DiskRequest> {
        self.inner.lock().unwrap().cancel(id)
    }

    /// Remove every pending request
    pub fn drain(&self) -> Vec<DiskRequest> {
        let mut inner = self.inner.lock().unwrap();
        let mut reqs = Vec::with_capacity(inner.len());
        reqs.extend(mem::take(&mut inner.right).into_values());
        reqs.extend(mem::take(&mut inner.left).into_values());
        reqs.extend(mem::take(&mut inner.lopri).into_values());
        reqs
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One [`DiskQueue`] for every member disk of an array
pub struct DiskQueues {
    queues: Box<[DiskQueue]>,
}

impl DiskQueues {
    pub fn new(ndisks: DiskT, discipline: Discipline) -> Self {
        let queues = (0..ndisks)
            .map(|_| DiskQueue::new(discipline))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        DiskQueues{queues}
    }

    /// Access the queue for a single disk
    pub fn get(&self, disk: DiskT) -> Option<&DiskQueue> {
        self.queues.get(usize::from(disk))
    }

    pub fn ndisks(&self) -> usize {
        self.queues.len()
    }

    pub fn schedule(&self, disk: DiskT, req: DiskRequest) -> Result<ReqId> {
        self.get(disk)
            .map(|q| q.schedule(req))
            .ok_or(Error::ENXIO)
    }

    pub fn next(&self, disk: DiskT) -> Option<DiskRequest> {
        self.get(disk).and_then(DiskQueue::next)
    }

    pub fn promote(&self, disk: DiskT, psid: PsidT) -> usize {
        self.get(disk).map(|q| q.promote(psid)).unwrap_or(0)
    }

    /// Promote `psid`'s requests on every disk
    pub fn promote_all(&self, psid: PsidT) -> usize {
        self.queues.iter().map(|q| q.promote(psid)).sum()
    }

    pub fn cancel(&self, disk: DiskT, id: ReqId) -> Option<DiskRequest> {
        self.get(disk).and_then(|q| q.cancel(id))
    }

    /// Remove every pending request from every disk
    pub fn drain_all(&self) -> Vec<DiskRequest> {
        self.queues.iter().flat_map(DiskQueue::drain).collect()
    }
}
