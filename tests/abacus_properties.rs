// Abacus refinement properties exercised on live column structures.

use tigcns::abacus::{
    abacus_refine, affine_score_abacus, create_abacus, refine_window, score_abacus, RefineLevel,
};
use tigcns::apply_alignment::{apply_alignment, Anchor};
use tigcns::cns_opt::CnsOptions;
use tigcns::manode::{check_columns, create_manode, get_manode_consensus, seed_manode_with_fragment};
use tigcns::refresh::{refresh_manode, RefreshMode};
use tigcns::store::{CnsSession, ColId, FragId, FragKind, GAP};

fn qv(n: usize) -> Vec<u8> {
    vec![b'0' + 30; n]
}

fn register(cns: &mut CnsSession, iid: u32, bases: &[u8]) -> FragId {
    let q = qv(bases.len());
    cns.register_fragment(iid, FragKind::Read, false, bases, &q, Vec::new())
}

/// Build the classic disagreeing-gap structure:
///   row 1:  A C - G T
///   row 2:  A C G - T
///   row 3:  A C - G T
/// by splicing three copies of ACGT with different gap placements.
fn build_disagreeing_window() -> (CnsSession, usize, Vec<ColId>) {
    let mut cns = CnsSession::new();
    let a = register(&mut cns, 1, b"ACGT");
    let b = register(&mut cns, 2, b"ACGT");
    let c = register(&mut cns, 3, b"ACGT");
    let mid = create_manode(&mut cns, 1);
    seed_manode_with_fragment(&mut cns, mid, a);

    // B's G is an insertion before A position 3, then A's own G pairs
    // against a gap in B
    apply_alignment(&mut cns, Anchor::Fragment(a), b, 0, &[-3, 4]);
    // C aligns 1:1 with A, inheriting A's gap placement
    apply_alignment(&mut cns, Anchor::Fragment(a), c, 0, &[]);
    check_columns(&cns, mid);

    let opt = CnsOptions::default();
    refresh_manode(&mut cns, mid, &opt, RefreshMode::CallOnly, false);
    let cols = cns.manodes[mid].columns.clone();
    assert_eq!(cols.len(), 5);

    // confirm the planted rows
    let row = |fid: FragId| -> Vec<u8> {
        cns.fragment_bead_ids(fid).iter().map(|&bid| cns.base(bid)).collect()
    };
    assert_eq!(row(a), b"AC-GT");
    assert_eq!(row(b), b"ACG-T");
    assert_eq!(row(c), b"AC-GT");

    (cns, mid, cols)
}

#[test]
fn refine_window_commits_a_strictly_better_arrangement() {
    let (mut cns, mid, cols) = build_disagreeing_window();
    let opt = CnsOptions::default();

    let before = {
        let mut ab = create_abacus(&mut cns, cols[2], cols[4]);
        let (mm, ncols) = score_abacus(&mut ab);
        mm + ncols + affine_score_abacus(&ab)
    };

    refine_window(&mut cns, cols[2], cols[4], &opt);
    check_columns(&cns, mid);

    let after = {
        let mut ab = create_abacus(&mut cns, cols[2], cols[4]);
        let (mm, ncols) = score_abacus(&mut ab);
        mm + ncols + affine_score_abacus(&ab)
    };
    assert!(after < before, "committed arrangement must improve ({before} -> {after})");

    // content preserved: every read still spells ACGT
    for fid in [FragId(0), FragId(1), FragId(2)] {
        let bases: Vec<u8> = cns
            .fragment_bead_ids(fid)
            .iter()
            .map(|&bid| cns.base(bid))
            .filter(|&b| b != GAP)
            .collect();
        assert_eq!(bases, b"ACGT", "sequence content must never change");
    }

    // the disagreement collapsed: one of the two middle columns is now
    // all-gap
    refresh_manode(&mut cns, mid, &opt, RefreshMode::CallOnly, true);
    let (seq, _) = get_manode_consensus(&cns, mid);
    let ungapped: Vec<u8> = seq.iter().copied().filter(|&b| b != GAP).collect();
    assert_eq!(ungapped, b"ACGT");
    assert_eq!(seq.iter().filter(|&&b| b == GAP).count(), 1);
}

#[test]
fn full_refine_pass_leaves_structure_sane() {
    let (mut cns, mid, _) = build_disagreeing_window();
    let opt = CnsOptions::default();

    abacus_refine(&mut cns, mid, 0, -1, RefineLevel::Smooth, &opt);
    check_columns(&cns, mid);
    abacus_refine(&mut cns, mid, 0, -1, RefineLevel::PolyX, &opt);
    check_columns(&cns, mid);
    abacus_refine(&mut cns, mid, 0, -1, RefineLevel::Indel, &opt);
    check_columns(&cns, mid);

    let (seq, _) = get_manode_consensus(&cns, mid);
    let ungapped: Vec<u8> = seq.iter().copied().filter(|&b| b != GAP).collect();
    assert_eq!(ungapped, b"ACGT");
}

/// Two consecutive gap-majority columns (a two-base insertion carried by a
/// single read) open a Smooth window of width >= 2.
fn build_smooth_window() -> (CnsSession, usize) {
    let mut cns = CnsSession::new();
    let a = register(&mut cns, 1, b"ACGTACGT");
    let b = register(&mut cns, 2, b"ACGGGTACGT");
    let c = register(&mut cns, 3, b"ACGTACGT");
    let mid = create_manode(&mut cns, 1);
    seed_manode_with_fragment(&mut cns, mid, a);

    // B carries GG inserted before A position 3
    apply_alignment(&mut cns, Anchor::Fragment(a), b, 0, &[-3, -3]);
    apply_alignment(&mut cns, Anchor::Fragment(a), c, 0, &[]);
    check_columns(&cns, mid);

    let opt = CnsOptions::default();
    refresh_manode(&mut cns, mid, &opt, RefreshMode::CallOnly, false);
    (cns, mid)
}

#[test]
fn oversized_windows_are_skipped_not_refined() {
    let (mut cns, mid) = build_smooth_window();
    let mut opt = CnsOptions::default();
    opt.max_abacus_window = 1; // every window is now "too wide"

    let row_before: Vec<u8> =
        cns.fragment_bead_ids(FragId(1)).iter().map(|&bid| cns.base(bid)).collect();

    abacus_refine(&mut cns, mid, 0, -1, RefineLevel::Smooth, &opt);
    check_columns(&cns, mid);

    // gap placement untouched: skipping is silent, not destructive
    let row_after: Vec<u8> =
        cns.fragment_bead_ids(FragId(1)).iter().map(|&bid| cns.base(bid)).collect();
    assert_eq!(row_before, row_after);
}

#[test]
fn smooth_refinement_preserves_content_and_consensus() {
    // the two insertion columns each hold a real base of the same read, so
    // no shift can merge them; refinement must leave content alone and the
    // majority consensus must still drop the single-read insertion
    let (mut cns, mid) = build_smooth_window();
    let opt = CnsOptions::default();

    abacus_refine(&mut cns, mid, 0, -1, RefineLevel::Smooth, &opt);
    check_columns(&cns, mid);

    // every read keeps its bases
    for (fid, want) in [
        (FragId(0), b"ACGTACGT".as_slice()),
        (FragId(1), b"ACGGGTACGT".as_slice()),
        (FragId(2), b"ACGTACGT".as_slice()),
    ] {
        let bases: Vec<u8> = cns
            .fragment_bead_ids(fid)
            .iter()
            .map(|&bid| cns.base(bid))
            .filter(|&b| b != GAP)
            .collect();
        assert_eq!(bases, want);
    }

    let (seq, _) = get_manode_consensus(&cns, mid);
    let ungapped: Vec<u8> = seq.iter().copied().filter(|&b| b != GAP).collect();
    assert_eq!(ungapped, b"ACGTACGT", "majority consensus drops the single-read insertion");
}
