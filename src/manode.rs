// MANode: one evolving multi-alignment (a unitig or contig under
// construction). Owns the head/tail of a column chain plus a periodically
// refreshed flat list of column ids for O(1) positional lookup.

use crate::store::{BeadId, CnsSession, ColId, FragId, FragKind, GAP};
use crate::{Placement, PlacementKind};

#[derive(Clone, Debug)]
pub struct MANode {
    /// External identity of the object under construction.
    pub iid: u32,
    pub first: ColId,
    pub last: ColId,
    /// Ordered column ids; valid only after a refresh (grows out of order
    /// as columns are spliced in between refreshes).
    pub columns: Vec<ColId>,
}

/// Create an empty MANode and return its index in the session.
pub fn create_manode(cns: &mut CnsSession, iid: u32) -> usize {
    cns.manodes.push(MANode {
        iid,
        first: ColId::INVALID,
        last: ColId::INVALID,
        columns: Vec::new(),
    });
    cns.manodes.len() - 1
}

/// Record a column in its MANode, updating the chain endpoints when the
/// column sits at either end.
pub fn add_column_to_manode(cns: &mut CnsSession, mid: usize, cid: ColId) {
    let (prev, next) = {
        let c = &cns.columns[cid.idx()];
        (c.prev, c.next)
    };
    let ma = &mut cns.manodes[mid];
    ma.columns.push(cid);
    if !next.is_valid() {
        ma.last = cid;
    }
    if !prev.is_valid() {
        ma.first = cid;
    }
}

/// Number of columns currently known to the MANode (exact after a refresh).
pub fn manode_length(cns: &CnsSession, mid: usize) -> usize {
    cns.manodes[mid].columns.len()
}

/// Seed an empty MANode with a fragment: one fresh column per bead, chained
/// left to right. The fragment becomes resident.
pub fn seed_manode_with_fragment(cns: &mut CnsSession, mid: usize, fid: FragId) {
    assert!(
        !cns.manodes[mid].first.is_valid(),
        "seed_manode_with_fragment: MANode {mid} already seeded"
    );
    let beads = cns.fragment_bead_ids(fid);
    assert!(!beads.is_empty());

    let first = cns.create_column(beads[0]);
    cns.columns[first.idx()].ma = mid as i32;
    cns.columns[first.idx()].ma_index = 0;
    add_column_to_manode(cns, mid, first);

    let mut cid = first;
    for &bid in &beads[1..] {
        cid = cns.column_append(cid, bid);
    }

    cns.frags[fid.idx()].manode = mid as i32;
}

/// Copy out the gapped consensus and quality strings (call beads, left to
/// right).
pub fn get_manode_consensus(cns: &CnsSession, mid: usize) -> (Vec<u8>, Vec<u8>) {
    let mut seq = Vec::new();
    let mut qual = Vec::new();
    let mut cid = cns.manodes[mid].first;
    while cid.is_valid() {
        let call = cns.columns[cid.idx()].call;
        seq.push(cns.base(call));
        qual.push(cns.qual_char(call));
        cid = cns.columns[cid.idx()].next;
    }
    (seq, qual)
}

/// Gap positions of a fragment within its own (ungapped) coordinates,
/// trailing end-gaps excluded.
fn fragment_deltas(cns: &CnsSession, fid: FragId) -> Vec<i32> {
    let length = cns.frags[fid.idx()].length as i32;
    let mut deltas = Vec::new();
    let mut index = 0;
    let mut bid = cns.frags[fid.idx()].firstbead;
    while bid.is_valid() && index < length {
        if cns.base(bid) == GAP {
            deltas.push(index);
        } else {
            index += 1;
        }
        bid = cns.beads[bid.idx()].next;
    }
    deltas
}

/// Placements of every resident fragment in the MANode's gapped coordinate
/// space. Requires a current refresh (uses ma_index).
pub fn get_manode_positions(cns: &CnsSession, mid: usize) -> Vec<Placement> {
    let mut out = Vec::new();
    for fi in 0..cns.frags.len() {
        let frag = &cns.frags[fi];
        if frag.deleted || frag.manode != mid as i32 {
            continue;
        }
        let fid = FragId(fi as u32);
        let firstbead = frag.firstbead;
        let lastbead = BeadId(firstbead.0 + frag.length - 1);

        let bgn = cns.columns[cns.beads[firstbead.idx()].column.idx()].ma_index;
        let end = cns.columns[cns.beads[lastbead.idx()].column.idx()].ma_index + 1;

        out.push(Placement {
            iid: frag.iid,
            kind: match frag.kind {
                FragKind::Read => PlacementKind::Read,
                FragKind::Tig => PlacementKind::Tig,
            },
            begin: if frag.complement { end } else { bgn },
            end: if frag.complement { bgn } else { end },
            deltas: fragment_deltas(cns, fid),
        });
    }
    out
}

/// Executable structural integrity check: the column chain visits every
/// owned column exactly once with mutually inverse prev/next links, and
/// every bead reachable from a column's stack records that column as its
/// membership, with a base histogram matching the stack. Panics on any
/// violation.
pub fn check_columns(cns: &CnsSession, mid: usize) {
    let mut seen = vec![false; cns.columns.len()];
    let mut cid = cns.manodes[mid].first;
    let mut prev = ColId::INVALID;

    while cid.is_valid() {
        assert!(!seen[cid.idx()], "column {cid:?} visited twice");
        seen[cid.idx()] = true;

        let col = &cns.columns[cid.idx()];
        assert_eq!(col.prev, prev, "column {cid:?} prev link broken");
        if prev.is_valid() {
            assert_eq!(cns.columns[prev.idx()].next, cid, "column {prev:?} next link broken");
        }

        let mut counts = [0i32; 6];
        let mut depth = 0;
        for bid in cns.column_bead_ids(cid) {
            assert_eq!(
                cns.beads[bid.idx()].column,
                cid,
                "bead {bid:?} reachable from column {cid:?} but records {:?}",
                cns.beads[bid.idx()].column
            );
            counts[crate::store::base_index(cns.base(bid))] += 1;
            depth += 1;
        }
        assert_eq!(depth, col.counts.depth, "depth mismatch in column {cid:?}");
        assert_eq!(counts, col.counts.count, "histogram mismatch in column {cid:?}");

        prev = cid;
        cid = col.next;
    }

    assert_eq!(prev, cns.manodes[mid].last, "MANode {mid} last column stale");
}
