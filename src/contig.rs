// Contig consensus driver: the same placement machinery as unitig
// consensus, but the unit being placed is an already-consensed unitig
// acting as a pseudo-read ("guide"); the base caller only falls back to
// guide coverage where no raw read coverage exists. After the contig is
// finalized, each unitig's own member reads are re-placed into contig
// coordinates through the unitig's gapped placement.

use anyhow::{anyhow, bail, Result};
use log::{info, warn};

use crate::aligner::TraceAligner;
use crate::cns_opt::CnsOptions;
use crate::store::{Component, FragKind, GAP};
use crate::unitig::TigDriver;
use crate::{MultiAlignRecord, Placement, PlacementKind};

/// One unitig of a contig layout: its ungapped consensus/quality plus the
/// placements of its own components in the unitig's ungapped coordinates.
#[derive(Clone, Debug)]
pub struct LayoutTig {
    pub iid: u32,
    pub bases: Vec<u8>,
    pub quals: Vec<u8>,
    pub begin: i32,
    pub end: i32,
    pub components: Vec<Component>,
}

#[derive(Clone, Debug, Default)]
pub struct ContigLayout {
    pub iid: u32,
    pub tigs: Vec<LayoutTig>,
}

/// Build the consensus of one contig from its unitig layout, then re-place
/// every component read against the finalized contig coordinates.
pub fn multi_align_contig(
    layout: &ContigLayout,
    aligners: &[&dyn TraceAligner],
    opt: &CnsOptions,
) -> Result<MultiAlignRecord> {
    if layout.tigs.is_empty() {
        bail!("contig {} has no unitigs", layout.iid);
    }

    let num_bases: usize = layout.tigs.iter().map(|t| t.bases.len()).sum();
    let mut driver = TigDriver::new(layout.iid, aligners, opt, num_bases, layout.tigs.len());

    for t in &layout.tigs {
        if t.begin == t.end {
            bail!("contig {}: unitig {} has an empty layout interval", layout.iid, t.iid);
        }
        if t.bases.len() != t.quals.len() {
            bail!("contig {}: unitig {} length/quality mismatch", layout.iid, t.iid);
        }
        driver.add_fragment(
            t.iid,
            FragKind::Tig,
            &t.bases,
            &t.quals,
            t.begin,
            t.end,
            t.components.clone(),
        );
    }

    driver.seed();
    info!(
        "multi_align_contig: contig {} seeded with unitig {} ({} unitigs total)",
        layout.iid,
        layout.tigs[0].iid,
        layout.tigs.len()
    );

    let mut failed: Vec<u32> = Vec::new();
    for tiid in 1..layout.tigs.len() {
        if !driver.place_fragment(tiid) {
            warn!(
                "multi_align_contig: contig {} failed to place unitig {}",
                layout.iid, layout.tigs[tiid].iid
            );
            failed.push(layout.tigs[tiid].iid);
        }
    }

    if !failed.is_empty() {
        return Err(anyhow!(
            "contig {} failed: could not place {} unitig(s): {:?}",
            layout.iid,
            failed.len(),
            failed
        ));
    }

    let mut record = driver.generate_record(layout.iid);

    // Post-pass: nested component placements. Each unitig's bead chain maps
    // its ungapped positions to finalized contig columns; a component's
    // interval projects straight through that map.
    let cns = &driver.cns;
    let mut nested: Vec<Placement> = Vec::new();

    for fi in 0..cns.frags.len() {
        let frag = &cns.frags[fi];
        if frag.kind != FragKind::Tig || frag.deleted || frag.components.is_empty() {
            continue;
        }

        // ungapped position -> contig column index, via the tig's beads
        let tig_len = frag.length as usize;
        let mut colmap: Vec<i32> = Vec::with_capacity(tig_len + 1);
        let mut bid = frag.firstbead;
        let mut last_index = 0;
        while bid.is_valid() {
            let col = cns.beads[bid.idx()].column;
            last_index = cns.columns[col.idx()].ma_index;
            if cns.base(bid) != GAP {
                colmap.push(last_index);
            }
            bid = cns.beads[bid.idx()].next;
        }
        assert_eq!(colmap.len(), tig_len, "tig {} lost bases in the alignment", frag.iid);
        colmap.push(last_index + 1);

        for comp in &frag.components {
            let (iid, begin, end, kind) = match comp {
                Component::Read { iid, begin, end } => (*iid, *begin, *end, PlacementKind::Read),
                Component::Tig { iid, begin, end } => (*iid, *begin, *end, PlacementKind::Tig),
            };
            let reversed = begin > end;
            let (mut lo, mut hi) = (begin.min(end), begin.max(end));

            // components are in the unitig's forward coordinates; flip them
            // when the unitig itself was placed reverse-complemented
            if frag.complement {
                let l = tig_len as i32;
                let (flo, fhi) = (l - hi, l - lo);
                lo = flo;
                hi = fhi;
            }
            let lo = lo.clamp(0, tig_len as i32) as usize;
            let hi = hi.clamp(0, tig_len as i32) as usize;
            if lo >= hi {
                continue;
            }

            let cbgn = colmap[lo];
            let cend = colmap[hi - 1] + 1;
            let flipped = reversed != frag.complement;
            nested.push(Placement {
                iid,
                kind,
                begin: if flipped { cend } else { cbgn },
                end: if flipped { cbgn } else { cend },
                deltas: Vec::new(),
            });
        }
    }

    record.placements.extend(nested);
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aligner::DpAligner;

    #[test]
    fn contig_from_two_unitigs_reproduces_reference() {
        let reference = b"ACGGTCATCGATTTGCAGCCTAAGTTTCTGCATCAGGACCAGTTGCA".to_vec();
        let tig1 = &reference[..30];
        let tig2 = &reference[14..];

        let layout = ContigLayout {
            iid: 500,
            tigs: vec![
                LayoutTig {
                    iid: 11,
                    bases: tig1.to_vec(),
                    quals: vec![b'0' + 40; tig1.len()],
                    begin: 0,
                    end: 30,
                    components: vec![
                        Component::Read { iid: 1, begin: 0, end: 20 },
                        Component::Read { iid: 2, begin: 10, end: 30 },
                    ],
                },
                LayoutTig {
                    iid: 12,
                    bases: tig2.to_vec(),
                    quals: vec![b'0' + 40; tig2.len()],
                    begin: 14,
                    end: 47,
                    components: vec![Component::Read { iid: 3, begin: 0, end: 33 }],
                },
            ],
        };

        let dp = DpAligner;
        let aligners: [&dyn TraceAligner; 1] = [&dp];
        let mut opt = CnsOptions::default();
        opt.min_overlap = 12;

        let rec = multi_align_contig(&layout, &aligners, &opt).unwrap();
        let (seq, _) = rec.ungapped();
        assert_eq!(seq, reference);

        // two tig placements plus three nested read placements
        let tigs: Vec<_> =
            rec.placements.iter().filter(|p| p.kind == PlacementKind::Tig).collect();
        let reads: Vec<_> =
            rec.placements.iter().filter(|p| p.kind == PlacementKind::Read).collect();
        assert_eq!(tigs.len(), 2);
        assert_eq!(reads.len(), 3);

        // with a gap-free contig, nested coordinates line up exactly
        let r3 = reads.iter().find(|p| p.iid == 3).unwrap();
        assert_eq!(r3.begin, 14);
        assert_eq!(r3.end, 47);
    }
}
