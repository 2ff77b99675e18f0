// Structural and behavioral properties of the consensus core, exercised
// through the public library surface.

use tigcns::aligner::{DpAligner, TraceAligner};
use tigcns::apply_alignment::{apply_alignment, Anchor};
use tigcns::basecall::{base_call, CallPolicy};
use tigcns::cns_opt::CnsOptions;
use tigcns::manode::{
    check_columns, create_manode, get_manode_consensus, manode_length, seed_manode_with_fragment,
};
use tigcns::refresh::{refresh_manode, RefreshMode};
use tigcns::store::{CnsSession, FragId, FragKind, GAP};
use tigcns::unitig::{multi_align_unitig, LayoutRead, UnitigLayout};

fn qv(n: usize, q: u8) -> Vec<u8> {
    vec![b'0' + q; n]
}

fn register(cns: &mut CnsSession, iid: u32, bases: &[u8]) -> FragId {
    cns.register_fragment(iid, FragKind::Read, false, bases, &qv(bases.len(), 30), Vec::new())
}

#[test]
fn self_alignment_round_trip() {
    // applying a sequence against itself with no hangs and an empty trace
    // leaves the column count unchanged and reproduces the input
    let mut cns = CnsSession::new();
    let a = register(&mut cns, 1, b"ACGTACGT");
    let b = register(&mut cns, 2, b"ACGTACGT");
    let mid = create_manode(&mut cns, 1);
    seed_manode_with_fragment(&mut cns, mid, a);

    let before = manode_length(&cns, mid);
    apply_alignment(&mut cns, Anchor::Fragment(a), b, 0, &[]);
    check_columns(&cns, mid);

    let opt = CnsOptions::default();
    refresh_manode(&mut cns, mid, &opt, RefreshMode::CallOnly, true);
    assert_eq!(manode_length(&cns, mid), before);

    let (seq, _) = get_manode_consensus(&cns, mid);
    assert_eq!(seq, b"ACGTACGT");
}

#[test]
fn single_deletion_scenario() {
    // a second sequence missing the base at position 4 pads with one gap
    // bead; the alignment still spans 8 columns
    let mut cns = CnsSession::new();
    let a = register(&mut cns, 1, b"ACGTACGT");
    let b = register(&mut cns, 2, b"ACGTCGT");
    let mid = create_manode(&mut cns, 1);
    seed_manode_with_fragment(&mut cns, mid, a);

    apply_alignment(&mut cns, Anchor::Fragment(a), b, 0, &[5]);
    check_columns(&cns, mid);

    let opt = CnsOptions::default();
    refresh_manode(&mut cns, mid, &opt, RefreshMode::CallOnly, true);
    assert_eq!(manode_length(&cns, mid), 8);

    let bbeads = cns.fragment_bead_ids(b);
    assert_eq!(bbeads.len(), 8);
    assert_eq!(cns.base(bbeads[4]), GAP);

    let (seq, _) = get_manode_consensus(&cns, mid);
    assert_eq!(seq, b"ACGTACGT");
}

#[test]
fn base_call_is_idempotent() {
    let mut cns = CnsSession::new();
    let a = register(&mut cns, 1, b"ACGTACGT");
    let b = register(&mut cns, 2, b"ACGTACGT");
    let c = register(&mut cns, 3, b"ACCTACGT");
    let mid = create_manode(&mut cns, 1);
    seed_manode_with_fragment(&mut cns, mid, a);
    apply_alignment(&mut cns, Anchor::Fragment(a), b, 0, &[]);
    apply_alignment(&mut cns, Anchor::Fragment(a), c, 0, &[]);

    let opt = CnsOptions::default();
    refresh_manode(&mut cns, mid, &opt, RefreshMode::CallOnly, true);

    for &cid in cns.manodes[mid].columns.clone().iter() {
        let r1 = base_call(&mut cns, cid, CallPolicy::Weighted, None, &opt, None);
        let r2 = base_call(&mut cns, cid, CallPolicy::Weighted, None, &opt, None);
        assert_eq!(r1.base, r2.base);
        assert_eq!(r1.qual, r2.qual);
        assert_eq!(r1.var, r2.var);
    }
}

#[test]
fn column_integrity_after_every_operation() {
    let mut cns = CnsSession::new();
    let a = register(&mut cns, 1, b"ACGGTCATCGATTTGCAGCC");
    let b = register(&mut cns, 2, b"ACGGTCTCGATTTGCAGCC"); // deletion at 6
    let c = register(&mut cns, 3, b"ACGGTCATCGAATTTGCAGCC"); // insertion at 11
    let mid = create_manode(&mut cns, 1);
    seed_manode_with_fragment(&mut cns, mid, a);
    check_columns(&cns, mid);

    apply_alignment(&mut cns, Anchor::Fragment(a), b, 0, &[7]);
    check_columns(&cns, mid);

    apply_alignment(&mut cns, Anchor::Fragment(a), c, 0, &[-12]);
    check_columns(&cns, mid);
}

#[test]
fn pipeline_consensus_matches_planted_reference_with_errors() {
    let reference = b"ACGGTCATCGATTTGCAGCCTAAGTTTCTGCATCAGGACCAGTTGCAACCTGGATTCAGG".to_vec();
    let len = 30;
    let step = 6;

    let mut reads = Vec::new();
    let mut iid = 0;
    let mut at = 0;
    loop {
        iid += 1;
        let mut bases = reference[at..at + len].to_vec();
        // plant one low-quality error per third read
        let mut quals = qv(len, 35);
        if iid % 3 == 0 {
            bases[len / 2] = match bases[len / 2] {
                b'A' => b'C',
                _ => b'A',
            };
            quals[len / 2] = b'0' + 8;
        }
        reads.push(LayoutRead { iid, bases, quals, begin: at as i32, end: (at + len) as i32 });
        if at + len == reference.len() {
            break;
        }
        at = (at + step).min(reference.len() - len);
    }

    let layout = UnitigLayout { iid: 9, reads };
    let dp = DpAligner;
    let aligners: [&dyn TraceAligner; 1] = [&dp];
    let mut opt = CnsOptions::default();
    opt.min_overlap = 16;

    let rec = multi_align_unitig(&layout, &aligners, &opt).unwrap();
    let (seq, _) = rec.ungapped();
    assert_eq!(seq, reference, "scattered low-quality errors must be outvoted");

    // placements cover the whole consensus
    assert!(rec.placements.iter().any(|p| p.begin == 0));
    let max_end = rec.placements.iter().map(|p| p.end.max(p.begin)).max().unwrap();
    assert_eq!(max_end as usize, rec.consensus.len());
}

#[test]
fn reverse_complement_reads_assemble() {
    let reference = b"ACGGTCATCGATTTGCAGCCTAAGTTTCTGCATCAGGACCA".to_vec();

    fn revcomp(s: &[u8]) -> Vec<u8> {
        s.iter()
            .rev()
            .map(|&b| match b {
                b'A' => b'T',
                b'C' => b'G',
                b'G' => b'C',
                _ => b'A',
            })
            .collect()
    }

    let layout = UnitigLayout {
        iid: 3,
        reads: vec![
            LayoutRead {
                iid: 1,
                bases: reference[0..24].to_vec(),
                quals: qv(24, 30),
                begin: 0,
                end: 24,
            },
            LayoutRead {
                iid: 2,
                bases: revcomp(&reference[8..32]),
                quals: qv(24, 30),
                begin: 32,
                end: 8,
            },
            LayoutRead {
                iid: 3,
                bases: reference[17..41].to_vec(),
                quals: qv(24, 30),
                begin: 17,
                end: 41,
            },
        ],
    };

    let dp = DpAligner;
    let aligners: [&dyn TraceAligner; 1] = [&dp];
    let mut opt = CnsOptions::default();
    opt.min_overlap = 12;

    let rec = multi_align_unitig(&layout, &aligners, &opt).unwrap();
    let (seq, _) = rec.ungapped();
    assert_eq!(seq, reference);

    // the reverse read's placement is flipped
    let p2 = rec.placements.iter().find(|p| p.iid == 2).unwrap();
    assert!(p2.begin > p2.end);
}
