// vim: tw=80
//! Executes operation graphs against a [`Dispatcher`]

use futures::{
    Future,
    FutureExt,
    StreamExt,
    stream::FuturesUnordered,
};
use std::{collections::VecDeque, sync::Arc};

use crate::{
    dispatch::{DispatchFut, Dispatcher},
    types::*,
};
use super::{Dag, DagStatus, NodeId, NodeKind};

fn tag(id: NodeId, fut: DispatchFut)
    -> impl Future<Output=(NodeId, Result<()>)>
{
    fut.map(move |r| (id, r))
}

/// Launch a disk I/O node
fn launch(dag: &Dag, id: NodeId, disp: &Arc<Dispatcher>)
    -> Result<DispatchFut>
{
    let node = &dag.nodes[id];
    let psid = Some(node.psid);
    match node.kind {
        NodeKind::Read{disk, sector, buf} => {
            let m = dag.mut_buf(buf)?;
            Ok(disp.read_at(disk, m, sector, dag.priority, psid))
        }
        NodeKind::Write{disk, sector, ref src} => {
            let b = dag.write_buf(src)?;
            Ok(disp.write_at(disk, b, sector, dag.priority, psid))
        }
        _ => Err(Error::EDOOFUS)
    }
}

/// Run every node of `dag`, respecting dependencies.
///
/// Disk I/O is issued as soon as a node's dependencies are satisfied.
/// Computations run inline.  On the first error no further nodes are started,
/// but those already in flight are allowed to finish before returning.
pub async fn execute(dag: &mut Dag, disp: &Arc<Dispatcher>) -> Result<()> {
    let n = dag.nodes.len();
    let mut waiting = dag.nodes.iter()
        .map(|node| node.deps.len())
        .collect::<Vec<_>>();
    let mut dependents: Vec<Vec<NodeId>> = vec![Vec::new(); n];
    for (id, node) in dag.nodes.iter().enumerate() {
        for d in node.deps.iter() {
            dependents[*d].push(id);
        }
    }
    let mut ready = (0..n).filter(|i| waiting[*i] == 0)
        .collect::<VecDeque<_>>();
    let mut inflight = FuturesUnordered::new();
    let mut completed = 0;
    let mut error: Option<Error> = None;

    let mut finish = |id: NodeId, ready: &mut VecDeque<NodeId>| {
        for dep in dependents[id].iter() {
            waiting[*dep] -= 1;
            if waiting[*dep] == 0 {
                ready.push_back(*dep);
            }
        }
    };

    loop {
        while error.is_none() {
            let Some(id) = ready.pop_front() else {
                break;
            };
            if dag.nodes[id].kind.is_io() {
                match launch(dag, id, disp) {
                    Ok(fut) => inflight.push(tag(id, fut)),
                    Err(e) => error = Some(e),
                }
            } else {
                match dag.run_compute(id) {
                    Ok(()) => {
                        completed += 1;
                        finish(id, &mut ready);
                    }
                    Err(e) => error = Some(e),
                }
            }
        }
        match inflight.next().await {
            Some((id, Ok(()))) => {
                completed += 1;
                finish(id, &mut ready);
            }
            Some((id, Err(e))) => {
                tracing::warn!(node = id, "graph node failed: {}", e);
                error.get_or_insert(e);
            }
            None => break
        }
    }

    let r = match error {
        Some(e) => Err(e),
        None if completed == n => Ok(()),
        // Some node could never become ready
        None => Err(Error::EDOOFUS)
    };
    dag.set_status(match r {
        Ok(()) => DagStatus::Complete,
        Err(e) => DagStatus::Aborted(e),
    });
    r
}

#[cfg(test)]
mod t {
    use fixedbitset::FixedBitSet;
    use pretty_assertions::assert_eq;
    use super::*;
    use crate::{
        config::ArrayConfig,
        dag::{OpKind, build_degraded_dag},
        disk_queue::Discipline,
        layout::ArrayLayout,
        raid::SchemeKind,
        transport::MemTransport,
    };

    fn setup() -> (ArrayLayout, Arc<MemTransport>, Arc<Dispatcher>) {
        let mut config = ArrayConfig::new(SchemeKind::EvenOdd, 5, 64);
        config.sectors_per_su = 2;
        config.bytes_per_sector = 64;
        let layout = ArrayLayout::new(&config).unwrap();
        let mt = Arc::new(MemTransport::new(5, 64, 64));
        let disp = Arc::new(Dispatcher::new(5, Discipline::Sstf, 2,
                                            mt.clone()));
        (layout, mt, disp)
    }

    async fn write(layout: &ArrayLayout, disp: &Arc<Dispatcher>,
                   addr: SectorT, data: &[u8], failed: &FixedBitSet)
        -> Result<()>
    {
        let nsectors = (data.len() / layout.bytes_per_sector) as SectorT;
        let map = layout.map_access(addr, nsectors, failed)?;
        let mut dag = build_degraded_dag(layout, OpKind::Write, &map,
                                         Some(data))?;
        execute(&mut dag, disp).await
    }

    async fn read(layout: &ArrayLayout, disp: &Arc<Dispatcher>,
                  addr: SectorT, nsectors: SectorT, failed: &FixedBitSet)
        -> Result<Vec<u8>>
    {
        let map = layout.map_access(addr, nsectors, failed)?;
        let mut dag = build_degraded_dag(layout, OpKind::Read, &map, None)?;
        execute(&mut dag, disp).await?;
        dag.read_result()
    }

    #[tokio::test]
    async fn write_and_read_back() {
        let (layout, _mt, disp) = setup();
        let none = FixedBitSet::with_capacity(5);
        let data = (0..64 * 9).map(|i| (i % 251) as u8).collect::<Vec<_>>();
        write(&layout, &disp, 3, &data, &none).await.unwrap();
        let got = read(&layout, &disp, 3, 9, &none).await.unwrap();
        assert!(got == data);
    }

    /// An I/O error aborts the graph, and the status says so
    #[tokio::test]
    async fn io_error() {
        let (layout, mt, disp) = setup();
        let none = FixedBitSet::with_capacity(5);
        let (disks, _) = layout.scheme().identify_stripe(0);
        mt.fail(disks[0]);
        let map = layout.map_access(0, 6, &none).unwrap();
        let mut dag = build_degraded_dag(&layout, OpKind::Read, &map, None)
            .unwrap();
        assert_eq!(execute(&mut dag, &disp).await, Err(Error::EIO));
        assert_eq!(dag.status(), DagStatus::Aborted(Error::EIO));
        assert_eq!(dag.read_result(), Err(Error::EIO));
    }

    /// Writes never start before the commit node, so a failed read means
    /// nothing gets written
    #[tokio::test]
    async fn no_writes_after_failed_read() {
        let (layout, mt, disp) = setup();
        let none = FixedBitSet::with_capacity(5);
        let (disks, _) = layout.scheme().identify_stripe(0);
        // Small write: reads old data and both parities first
        mt.fail(disks[3]);
        let r = write(&layout, &disp, 0, &[1u8; 64], &none).await;
        assert_eq!(r, Err(Error::EIO));
        for d in 0..5 {
            assert_eq!(mt.io_counts(d).1, 0, "disk {d} was written");
        }
    }
}
