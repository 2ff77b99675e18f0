// Splice a new sequence into the column structure along a pairwise edit
// trace against an anchor that is already resident.
//
// The trace is a sequence of signed deltas: a negative entry -k means the
// new sequence (B) has an insertion before anchor position k, handled by
// inserting a fresh gap column into the anchor; a positive entry +k means
// the anchor has an insertion before B position k, handled by inserting a
// gap bead into B aligned to the anchor's existing extra column. Trace
// entries inconsistent with strictly advancing positions indicate an
// upstream aligner bug and abort.

use crate::store::{BeadId, CnsSession, FragId};

/// The anchor side of an alignment application: either a resident fragment,
/// or an explicit bead array standing in for a synthetic running consensus
/// (whose beads may belong to many fragments).
pub enum Anchor<'a> {
    Fragment(FragId),
    Beads(&'a [BeadId]),
}

/// Locate the bead in the same column as `bi` that belongs to the same
/// fragment as `fi`. Aborts if the column has no bead of that fragment;
/// the anchor array guarantees one exists.
fn find_bead_in_column(cns: &CnsSession, bi: BeadId, fi: BeadId) -> BeadId {
    if !bi.is_valid() || !fi.is_valid() {
        return BeadId::INVALID;
    }
    let want = cns.beads[fi.idx()].frag;
    if cns.beads[bi.idx()].frag == want {
        return bi;
    }

    // search up first; the bead we want is usually above
    let mut b = cns.beads[bi.idx()].up;
    while b.is_valid() {
        if cns.beads[b.idx()].frag == want {
            return b;
        }
        b = cns.beads[b.idx()].up;
    }
    let mut b = cns.beads[bi.idx()].down;
    while b.is_valid() {
        if cns.beads[b.idx()].frag == want {
            return b;
        }
        b = cns.beads[b.idx()].down;
    }
    panic!("find_bead_in_column: no bead of fragment {want:?} in column of {bi:?}");
}

struct Splicer<'a> {
    aindex: &'a [BeadId],
    bindex: &'a [BeadId],
    apos: usize,
    bpos: usize,
    lasta: BeadId,
    lastb: BeadId,
}

impl<'a> Splicer<'a> {
    /// Absorb gap columns already present in the anchor between the bead we
    /// just aligned and the next anchor base, padding B with gap beads. The
    /// walk may hop to a different resident fragment at anchor seams.
    fn align_gaps(&mut self, cns: &mut CnsSession) {
        if self.apos >= self.aindex.len() {
            return;
        }
        self.lasta = find_bead_in_column(cns, self.lasta, self.aindex[self.apos]);
        if !self.lasta.is_valid() {
            return;
        }
        let mut nexta = cns.beads[self.lasta.idx()].next;
        while nexta != self.aindex[self.apos] {
            self.lastb = cns.append_gap_bead(self.lastb);
            self.lasta = nexta;
            let col = cns.beads[nexta.idx()].column;
            cns.align_bead_to_column(col, self.lastb);
            nexta = cns.beads[nexta.idx()].next;
        }
    }

    /// Align one B base 1:1 into the column of the current anchor base.
    fn align_position(&mut self, cns: &mut CnsSession) {
        assert!(self.apos < self.aindex.len(), "trace ran past the anchor");
        assert!(self.bpos < self.bindex.len(), "trace ran past the new sequence");

        let abead = self.aindex[self.apos];
        let col = cns.beads[abead.idx()].column;
        cns.align_bead_to_column(col, self.bindex[self.bpos]);

        self.lasta = abead;
        self.lastb = self.bindex[self.bpos];
        self.apos += 1;
        self.bpos += 1;

        self.align_gaps(cns);
    }
}

/// All anchor beads must be in a column; all new-sequence beads must not.
fn sanity_check(cns: &CnsSession, aindex: &[BeadId], bindex: &[BeadId]) {
    for &bid in aindex {
        assert!(
            cns.beads[bid.idx()].column.is_valid(),
            "anchor bead {bid:?} has no column"
        );
    }
    for &bid in bindex {
        assert!(
            !cns.beads[bid.idx()].column.is_valid(),
            "new bead {bid:?} already has a column"
        );
    }
}

/// Apply a pairwise alignment of fragment `bfid` against `anchor` with
/// offset `ahang` and the given signed-delta trace. On return every base of
/// B is attached to exactly one column; the anchor's column order is
/// unchanged except for newly inserted columns; no existing bead moves.
pub fn apply_alignment(
    cns: &mut CnsSession,
    anchor: Anchor<'_>,
    bfid: FragId,
    ahang: i32,
    trace: &[i32],
) {
    // Anchor beads are the fragment's original bases, which sit contiguous
    // in the arena; gap beads picked up since registration are reached via
    // align_gaps, not listed here.
    let afrag_beads;
    let aindex: &[BeadId] = match anchor {
        Anchor::Fragment(afid) => {
            let f = &cns.frags[afid.idx()];
            afrag_beads =
                (0..f.length).map(|i| BeadId(f.firstbead.0 + i)).collect::<Vec<_>>();
            &afrag_beads
        }
        Anchor::Beads(beads) => beads,
    };
    let bfrag = &cns.frags[bfid.idx()];
    let bindex: Vec<BeadId> =
        (0..bfrag.length).map(|i| BeadId(bfrag.firstbead.0 + i)).collect();

    let mut sp = Splicer {
        aindex,
        bindex: &bindex,
        apos: ahang.max(0) as usize,
        bpos: 0,
        lasta: BeadId::INVALID,
        lastb: BeadId::INVALID,
    };

    assert!(sp.apos < aindex.len(), "ahang {ahang} places B past the anchor end");
    sanity_check(cns, aindex, &bindex);

    // A negative ahang prepends columns before the anchor's current first
    // column; legal only when that column heads the chain (anything else
    // means the driver anchored against a truncated consensus).
    if ahang < 0 {
        let colp = cns.beads[aindex[0].idx()].column;
        assert!(
            !cns.beads[aindex[0].idx()].prev.is_valid(),
            "negative ahang against an anchor with sequence before its first column"
        );
        while sp.bpos < (-ahang) as usize {
            cns.column_prepend(colp, bindex[sp.bpos]);
            sp.bpos += 1;
        }
        sp.lasta = cns.beads[aindex[0].idx()].prev;
        sp.lastb = bindex[sp.bpos - 1];
    }

    for &t in trace {
        assert!(t != 0, "zero trace entry");

        if t < 0 {
            // insertion in B: align 1:1 up to anchor position -t-1, then
            // host B's extra base in a fresh gap column
            while sp.apos < (-t - 1) as usize {
                sp.align_position(cns);
            }

            assert!(sp.apos < aindex.len());
            assert!(sp.bpos < bindex.len());

            if !sp.lasta.is_valid() || sp.bpos == 0 {
                // the alignment starts with the insertion
                assert!(!sp.lasta.is_valid());
                assert!(sp.bpos == 0);
                let col = cns.beads[aindex[sp.apos].idx()].column;
                cns.column_prepend(col, bindex[sp.bpos]);
                sp.lasta = cns.beads[aindex[sp.apos].idx()].prev;
            } else {
                assert_eq!(sp.lasta, cns.beads[aindex[sp.apos].idx()].prev);
                let col = cns.beads[sp.lasta.idx()].column;
                cns.column_append(col, bindex[sp.bpos]);
                sp.lasta = cns.beads[sp.lasta.idx()].next;
            }
            sp.lastb = bindex[sp.bpos];

            assert_eq!(sp.lasta, cns.beads[aindex[sp.apos].idx()].prev);
            sp.bpos += 1;
        } else {
            // insertion in A: align 1:1 up to B position t-1, then pad B
            // with a gap bead aligned into the anchor's extra column
            while sp.bpos < (t - 1) as usize {
                sp.align_position(cns);
            }

            assert!(sp.apos < aindex.len());
            assert!(sp.bpos < bindex.len());

            sp.lasta = if sp.lasta.is_valid() {
                cns.beads[sp.lasta.idx()].next
            } else {
                aindex[sp.apos]
            };
            sp.lastb = cns.append_gap_bead(sp.lastb);

            assert_eq!(sp.lasta, aindex[sp.apos]);
            let col = cns.beads[sp.lasta.idx()].column;
            cns.align_bead_to_column(col, sp.lastb);

            sp.apos += 1;
            sp.align_gaps(cns);
        }
    }

    // remaining indel-free run
    let rem = (bindex.len() - sp.bpos).min(aindex.len() - sp.apos);
    for _ in 0..rem {
        sp.align_position(cns);
    }

    // dovetail: any leftover B tail becomes brand-new columns
    if sp.bpos < bindex.len() {
        let mut ci = cns.beads[sp.lastb.idx()].column;
        assert!(
            !cns.columns[ci.idx()].next.is_valid(),
            "dovetail extension into the middle of the column chain"
        );
        while sp.bpos < bindex.len() {
            ci = cns.column_append(ci, bindex[sp.bpos]);
            sp.bpos += 1;
        }
    }

    // B is now resident in the anchor's MANode
    let first = cns.frags[bfid.idx()].firstbead;
    let ma = cns.columns[cns.beads[first.idx()].column.idx()].ma;
    cns.frags[bfid.idx()].manode = ma;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cns_opt::CnsOptions;
    use crate::manode::{
        check_columns, create_manode, get_manode_consensus, manode_length,
        seed_manode_with_fragment,
    };
    use crate::refresh::{refresh_manode, RefreshMode};
    use crate::store::{CnsSession, FragKind, GAP};

    fn qv(n: usize) -> Vec<u8> {
        vec![b'0' + 20; n]
    }

    #[test]
    fn identity_alignment_keeps_column_count() {
        let mut cns = CnsSession::new();
        let a = cns.register_fragment(1, FragKind::Read, false, b"ACGTACGT", &qv(8), Vec::new());
        let b = cns.register_fragment(2, FragKind::Read, false, b"ACGTACGT", &qv(8), Vec::new());
        let mid = create_manode(&mut cns, 1);
        seed_manode_with_fragment(&mut cns, mid, a);

        apply_alignment(&mut cns, Anchor::Fragment(a), b, 0, &[]);
        check_columns(&cns, mid);

        let opt = CnsOptions::default();
        refresh_manode(&mut cns, mid, &opt, RefreshMode::CallOnly, true);
        assert_eq!(manode_length(&cns, mid), 8);
        let (seq, _) = get_manode_consensus(&cns, mid);
        assert_eq!(seq, b"ACGTACGT");
    }

    #[test]
    fn deletion_in_b_inserts_gap_column() {
        // B is missing A's base at position 4; the trace carries a single
        // inserted-gap event in B at position 5 (1-based)
        let mut cns = CnsSession::new();
        let a = cns.register_fragment(1, FragKind::Read, false, b"ACGTACGT", &qv(8), Vec::new());
        let b = cns.register_fragment(2, FragKind::Read, false, b"ACGTCGT", &qv(7), Vec::new());
        let mid = create_manode(&mut cns, 1);
        seed_manode_with_fragment(&mut cns, mid, a);

        apply_alignment(&mut cns, Anchor::Fragment(a), b, 0, &[5]);
        check_columns(&cns, mid);

        let opt = CnsOptions::default();
        refresh_manode(&mut cns, mid, &opt, RefreshMode::CallOnly, true);
        assert_eq!(manode_length(&cns, mid), 8);

        // B's bead at alignment position 4 is a gap
        let bbeads = cns.fragment_bead_ids(b);
        assert_eq!(bbeads.len(), 8);
        assert_eq!(cns.base(bbeads[4]), GAP);
        let (seq, _) = get_manode_consensus(&cns, mid);
        assert_eq!(seq, b"ACGTACGT");
    }

    #[test]
    fn insertion_in_b_adds_column() {
        // B carries an extra base between A positions 4 and 5
        let mut cns = CnsSession::new();
        let a = cns.register_fragment(1, FragKind::Read, false, b"ACGTACGT", &qv(8), Vec::new());
        let b = cns.register_fragment(2, FragKind::Read, false, b"ACGTTACGT", &qv(9), Vec::new());
        let mid = create_manode(&mut cns, 1);
        seed_manode_with_fragment(&mut cns, mid, a);

        apply_alignment(&mut cns, Anchor::Fragment(a), b, 0, &[-5]);
        check_columns(&cns, mid);

        let opt = CnsOptions::default();
        refresh_manode(&mut cns, mid, &opt, RefreshMode::CallOnly, true);
        assert_eq!(manode_length(&cns, mid), 9);

        // A picked up a padding gap at the inserted column
        let abeads = cns.fragment_bead_ids(a);
        assert_eq!(abeads.len(), 9);
        assert_eq!(cns.base(abeads[4]), GAP);
    }

    #[test]
    fn dovetail_extension_appends_columns() {
        let mut cns = CnsSession::new();
        let a = cns.register_fragment(1, FragKind::Read, false, b"ACGTACGT", &qv(8), Vec::new());
        let b = cns.register_fragment(2, FragKind::Read, false, b"ACGTTTTT", &qv(8), Vec::new());
        let mid = create_manode(&mut cns, 1);
        seed_manode_with_fragment(&mut cns, mid, a);

        // B overlaps A's last 4 bases then extends 4 beyond
        apply_alignment(&mut cns, Anchor::Fragment(a), b, 4, &[]);
        check_columns(&cns, mid);

        let opt = CnsOptions::default();
        refresh_manode(&mut cns, mid, &opt, RefreshMode::CallOnly, true);
        assert_eq!(manode_length(&cns, mid), 12);
    }

    #[test]
    fn negative_ahang_prepends_columns() {
        let mut cns = CnsSession::new();
        let a = cns.register_fragment(1, FragKind::Read, false, b"CGTACGT", &qv(7), Vec::new());
        let b = cns.register_fragment(2, FragKind::Read, false, b"TTCGTACGT", &qv(9), Vec::new());
        let mid = create_manode(&mut cns, 1);
        seed_manode_with_fragment(&mut cns, mid, a);

        apply_alignment(&mut cns, Anchor::Fragment(a), b, -2, &[]);
        check_columns(&cns, mid);

        let opt = CnsOptions::default();
        refresh_manode(&mut cns, mid, &opt, RefreshMode::CallOnly, true);
        assert_eq!(manode_length(&cns, mid), 9);
        let (seq, _) = get_manode_consensus(&cns, mid);
        assert_eq!(&seq[2..], b"CGTACGT");
    }
}
