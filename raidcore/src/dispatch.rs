// vim: tw=80
//! Moves requests from the per-disk queues to the transport, in scheduler
//! order, while limiting how many are outstanding on each disk.

use futures::{
    Future,
    channel::oneshot,
    task::{Context, Poll},
};
use pin_project::{pin_project, pinned_drop};
use std::{
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
};

use crate::{
    disk_queue::{Cmd, Discipline, DiskQueues, DiskRequest, Priority, ReqId},
    transport::Transport,
    types::*,
};

pub struct Dispatcher {
    queues: DiskQueues,
    transport: Arc<dyn Transport>,
    /// Most requests that may be simultaneously issued to one disk
    depth: u32,
    /// Requests currently issued to each disk
    busy: Box<[AtomicU32]>,
    aborting: AtomicBool,
}

impl Dispatcher {
    pub fn new(ndisks: DiskT, discipline: Discipline, depth: u32,
               transport: Arc<dyn Transport>) -> Self
    {
        let busy = (0..ndisks).map(|_| AtomicU32::new(0)).collect();
        Dispatcher {
            queues: DiskQueues::new(ndisks, discipline),
            transport,
            depth,
            busy,
            aborting: AtomicBool::new(false),
        }
    }

    pub fn queues(&self) -> &DiskQueues {
        &self.queues
    }

    /// Queue a read of `buf.len()` bytes from `disk`.
    ///
    /// Nothing is scheduled until the returned future is first polled.
    pub fn read_at(self: &Arc<Self>, disk: DiskT, buf: IoVecMut,
                   sector: SectorT, priority: Priority, psid: Option<PsidT>)
        -> DispatchFut
    {
        let (sender, receiver) = oneshot::channel::<Result<()>>();
        let req = DiskRequest::read_at(buf, sector, priority, psid, sender);
        DispatchFut::new(self.clone(), disk, req, receiver)
    }

    /// Queue a write of `buf` to `disk`.
    ///
    /// Nothing is scheduled until the returned future is first polled.
    pub fn write_at(self: &Arc<Self>, disk: DiskT, buf: IoVec,
                    sector: SectorT, priority: Priority, psid: Option<PsidT>)
        -> DispatchFut
    {
        let (sender, receiver) = oneshot::channel::<Result<()>>();
        let req = DiskRequest::write_at(buf, sector, priority, psid, sender);
        DispatchFut::new(self.clone(), disk, req, receiver)
    }

    /// Raise all of `psid`'s queued requests to high priority, on every disk
    pub fn promote_stripe(&self, psid: PsidT) -> usize {
        self.queues.promote_all(psid)
    }

    /// Fail every queued request, and refuse new ones.  Requests that were
    /// already issued are allowed to finish.
    pub fn abort(&self) {
        self.aborting.store(true, Ordering::Release);
        let reqs = self.queues.drain_all();
        tracing::debug!(n = reqs.len(), "aborting queued requests");
        for req in reqs {
            // The requester may have already given up
            let _ = req.sender.send(Err(Error::ECANCELED));
        }
    }

    pub fn is_aborting(&self) -> bool {
        self.aborting.load(Ordering::Acquire)
    }

    fn submit(self: &Arc<Self>, disk: DiskT, req: DiskRequest)
        -> Result<ReqId>
    {
        if self.is_aborting() {
            return Err(Error::ECANCELED);
        }
        let id = self.queues.schedule(disk, req)?;
        self.issue(disk);
        Ok(id)
    }

    /// Issue as many of `disk`'s queued requests as its depth allows
    fn issue(self: &Arc<Self>, disk: DiskT) {
        let (Some(queue), Some(busy)) = (self.queues.get(disk),
                                         self.busy.get(usize::from(disk)))
        else {
            return;
        };
        loop {
            let claimed = busy.fetch_update(Ordering::AcqRel, Ordering::Acquire,
                |b| (b < self.depth).then_some(b + 1));
            if claimed.is_err() {
                // A completion will call us again
                return;
            }
            match queue.next() {
                Some(req) => self.spawn(disk, req),
                None => {
                    busy.fetch_sub(1, Ordering::AcqRel);
                    // Recheck, in case a request arrived while we held the
                    // last slot
                    if queue.is_empty() {
                        return;
                    }
                }
            }
        }
    }

    fn spawn(self: &Arc<Self>, disk: DiskT, req: DiskRequest) {
        let sector = req.sector;
        let fut = match req.cmd {
            Cmd::ReadAt(buf) => self.transport.read_at(disk, buf, sector),
            Cmd::WriteAt(buf) => self.transport.write_at(disk, buf, sector),
        };
        let sender = req.sender;
        let this = self.clone();
        tokio::spawn(async move {
            let r = fut.await;
            if let Err(e) = r {
                tracing::warn!(disk, sector, "I/O error: {}", e);
            }
            // The requester may have been dropped
            let _ = sender.send(r);
            if let Some(busy) = this.busy.get(usize::from(disk)) {
                busy.fetch_sub(1, Ordering::AcqRel);
            }
            this.issue(disk);
        });
    }
}

/// Return type of [`Dispatcher::read_at`] and [`Dispatcher::write_at`].
///
/// Dropping it before completion revokes the request if it hasn't yet been
/// issued.
#[pin_project(PinnedDrop)]
pub struct DispatchFut {
    disp: Arc<Dispatcher>,
    disk: DiskT,
    req: Option<DiskRequest>,
    /// Set once the request is queued
    id: Option<ReqId>,
    #[pin]
    receiver: oneshot::Receiver<Result<()>>,
    done: bool,
}

impl DispatchFut {
    fn new(disp: Arc<Dispatcher>, disk: DiskT, req: DiskRequest,
           receiver: oneshot::Receiver<Result<()>>) -> Self
    {
        DispatchFut{disp, disk, req: Some(req), id: None, receiver, done: false}
    }
}

impl Future for DispatchFut {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let this = self.project();
        if let Some(req) = this.req.take() {
            match this.disp.submit(*this.disk, req) {
                Ok(id) => *this.id = Some(id),
                Err(e) => {
                    *this.done = true;
                    return Poll::Ready(Err(e));
                }
            }
        }
        match this.receiver.poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(r) => {
                *this.done = true;
                match r {
                    Ok(r) => Poll::Ready(r),
                    Err(_) => Poll::Ready(Err(Error::EPIPE))
                }
            }
        }
    }
}

#[pinned_drop]
impl PinnedDrop for DispatchFut {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        if !*this.done {
            if let Some(id) = this.id.take() {
                if this.disp.queues.cancel(*this.disk, id).is_some() {
                    tracing::debug!(disk = *this.disk, id, "revoked request");
                }
            }
        }
    }
}
