// vim: tw=80
//! Graph templates for stripes whose failures don't affect the access

use crate::{
    layout::AccessStripeMap,
    types::*,
};
use super::{BufId, DagBuilder, NodeId, NodeKind};

/// The portion of a stripe's write data that belongs to extent `i`
fn data_for<'d>(b: &DagBuilder, asm: &AccessStripeMap, data: &'d [u8],
                i: usize) -> &'d [u8]
{
    let pda = &asm.data[i];
    let off = b.bytes(pda.raid_addr - asm.raid_addr);
    &data[off..off + b.bytes(pda.nsectors)]
}

/// Copy each touched data extent's new contents into its own buffer
fn stage_data(b: &mut DagBuilder, asm: &AccessStripeMap, data: &[u8])
    -> Vec<BufId>
{
    (0..asm.data.len())
        .map(|i| {
            let d = data_for(b, asm, data, i);
            b.alloc_from(d)
        }).collect()
}

/// Read the touched data directly from the data columns
pub(super) fn read(b: &mut DagBuilder, asm: &AccessStripeMap) -> Result<()> {
    for pda in asm.data.iter() {
        let (_, buf) = b.read(pda);
        let r = b.whole(buf);
        b.output(r);
    }
    Ok(())
}

/// Write to every surviving half of a mirrored pair.  No reads are needed.
pub(super) fn mirror_write(b: &mut DagBuilder, asm: &AccessStripeMap,
                           data: &[u8]) -> Result<()>
{
    let bufs = stage_data(b, asm, data);
    let commit = b.commit(Vec::new());
    for (pda, buf) in asm.data.iter().zip(bufs.into_iter()) {
        let src = b.whole(buf);
        for col in 0..asm.ncols() {
            if !asm.is_failed(col) {
                let target = asm.extent(col, pda.su_offset, pda.su_end());
                b.write(&target, src, vec![commit]);
            }
        }
    }
    Ok(())
}

/// Overwrite a whole stripe.  Redundancy is computed from the new data alone,
/// and failed columns are simply skipped.
pub(super) fn large_write(b: &mut DagBuilder, asm: &AccessStripeMap,
                          data: &[u8]) -> Result<()>
{
    let k = asm.data_cols;
    let bufs = stage_data(b, asm, data);
    if bufs.len() != k || asm.ncols() != k + 2 {
        return Err(Error::EDOOFUS);
    }
    let su = b.bytes_per_su();
    let row = b.alloc(su);
    let diag = b.alloc(su);
    let encode = b.node(NodeKind::Encode{data: bufs.clone(), row, diag},
                        Vec::new());
    let commit = b.commit(vec![encode]);
    let cols = bufs.into_iter().chain([row, diag]);
    for (col, buf) in cols.enumerate() {
        if !asm.is_failed(col) {
            let src = b.whole(buf);
            b.write(&asm.stripe_unit(col), src, vec![commit]);
        }
    }
    Ok(())
}

/// Read-modify-write.
///
/// The old contents of each touched data extent are XORed with the new to
/// form a delta.  The row parity absorbs the deltas directly.  The diagonal
/// parity is read whole and absorbs each column's delta in turn.  Redundancy
/// columns that have failed are neither read nor written.  Failed data
/// columns don't matter, because they aren't touched.
pub(super) fn small_write(b: &mut DagBuilder, asm: &AccessStripeMap,
                          data: &[u8]) -> Result<()>
{
    let k = asm.data_cols;
    let su = b.bytes_per_su();
    let (lo, hi) = asm.su_range();
    let row_live = !asm.is_failed(k);
    let diag_live = asm.ncols() > k + 1 && !asm.is_failed(k + 1);
    let new_bufs = stage_data(b, asm, data);

    let mut computes: Vec<NodeId> = Vec::new();
    // (column, full stripe unit delta buffer, node that computes it)
    let mut deltas: Vec<(usize, BufId, NodeId)> = Vec::new();
    if row_live || diag_live {
        for (pda, new) in asm.data.iter().zip(new_bufs.iter()) {
            let (rd, old) = b.read(pda);
            let delta = b.alloc(su);
            let dest = b.range(delta, b.bytes(pda.su_offset),
                               b.bytes(pda.nsectors));
            let srcs = vec![b.whole(old), b.whole(*new)];
            let x = b.node(NodeKind::Xor{srcs, dest}, vec![rd]);
            deltas.push((pda.col, delta, x));
            computes.push(x);
        }
    }

    let mut parity_writes = Vec::new();
    if row_live {
        let rpda = asm.extent(k, lo, hi);
        let (rd, old) = b.read(&rpda);
        let new = b.alloc(b.bytes(hi - lo));
        let mut srcs = vec![b.whole(old)];
        let mut deps = vec![rd];
        for (_, delta, x) in deltas.iter() {
            srcs.push(b.range(*delta, b.bytes(lo), b.bytes(hi - lo)));
            deps.push(*x);
        }
        let dest = b.whole(new);
        computes.push(b.node(NodeKind::Xor{srcs, dest}, deps));
        parity_writes.push((rpda, new));
    }
    if diag_live {
        let dpda = asm.stripe_unit(k + 1);
        let (rd, diag) = b.read(&dpda);
        let mut prev = rd;
        for (col, delta, x) in deltas.iter() {
            let kind = NodeKind::DiagDelta{k, col: *col, delta: *delta, diag};
            prev = b.node(kind, vec![prev, *x]);
        }
        computes.push(prev);
        parity_writes.push((dpda, diag));
    }

    let commit = b.commit(computes);
    for (pda, new) in asm.data.iter().zip(new_bufs.into_iter()) {
        let src = b.whole(new);
        b.write(pda, src, vec![commit]);
    }
    for (pda, buf) in parity_writes {
        let src = b.whole(buf);
        b.write(&pda, src, vec![commit]);
    }
    Ok(())
}
