pub mod abacus;
pub mod aligner;
pub mod apply_alignment;
pub mod basecall;
pub mod cns_opt;
pub mod contig;
pub mod defaults;
pub mod layout; // tig layout + reads input (used by the CLI driver)
pub mod manode;
pub mod refresh;
pub mod store;
pub mod unitig;

pub use cns_opt::CnsOptions;
pub use refresh::{VarAllele, VarRecord};

use anyhow::Result;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum PlacementKind {
    Read,
    Tig,
}

/// Final placement of one contributing sequence in the gapped consensus
/// coordinate space. begin > end for reverse-complemented sequences.
#[derive(Clone, Debug)]
pub struct Placement {
    pub iid: u32,
    pub kind: PlacementKind,
    pub begin: i32,
    pub end: i32,
    /// Gap positions within the sequence's own ungapped coordinates.
    pub deltas: Vec<i32>,
}

/// The finished product of one consensus run: gapped consensus and quality
/// strings, per-sequence placements, and the variant report.
#[derive(Clone, Debug, Default)]
pub struct MultiAlignRecord {
    pub iid: u32,
    pub consensus: Vec<u8>,
    pub quality: Vec<u8>,
    pub placements: Vec<Placement>,
    pub variants: Vec<VarRecord>,
}

impl MultiAlignRecord {
    /// Consensus with the gap symbols stripped (and quality to match).
    pub fn ungapped(&self) -> (Vec<u8>, Vec<u8>) {
        let mut seq = Vec::with_capacity(self.consensus.len());
        let mut qual = Vec::with_capacity(self.quality.len());
        for (i, &b) in self.consensus.iter().enumerate() {
            if b != store::GAP {
                seq.push(b.to_ascii_uppercase());
                qual.push(self.quality[i]);
            }
        }
        (seq, qual)
    }
}

/// Opaque persistent store of finished multi-alignments. The core only
/// produces and consumes records; how they live on disk is the store's
/// business.
pub trait TigStore {
    fn load(&mut self, iid: u32) -> Result<MultiAlignRecord>;
    fn save(&mut self, iid: u32, record: &MultiAlignRecord) -> Result<()>;
}
