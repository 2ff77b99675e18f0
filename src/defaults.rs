// src/defaults.rs
//
// Empirically tuned constants for consensus calling and abacus refinement.
// These values are policy, not derivation; change them only with assembly
// validation data in hand.

// Quality-value range for consensus calls (phred, '0'-based ASCII encoding)
pub const CNS_MIN_QV: i32 = 0;
pub const CNS_MAX_QV: i32 = 60;

// Column variation detection
pub const MIN_AVE_QV_FOR_VARIATION: i32 = 21;
pub const MIN_SUM_QVS_FOR_VARIATION: i32 = 60;

// Quality assigned to a gap whose flanking bases are themselves gaps
pub const QV_FOR_MULTI_GAP: i32 = 14;

// Abacus refinement
pub const MAX_WINDOW_FOR_ABACUS_REFINE: usize = 100;
pub const STABWIDTH: usize = 6;
pub const STAB_MISMATCH_RATE: f64 = 0.02;
pub const STAB_GAP_RATE: f64 = 0.25;

// Mixed-shift boundary detection
pub const MSTRING_SIZE: usize = 3;
pub const MAX_SIZE_OF_ADJUSTED_REGION: i32 = 5;

// Alignment acceptance
pub const CNS_ERROR_RATE: f64 = 0.06;
pub const MAX_ERROR_RATE: f64 = 0.40;
pub const MIN_OVERLAP_LEN: usize = 40;

// Default smoothing window for variation scores (also the minimum anchor
// size between variant regions)
pub const DEFAULT_SMOOTH_WIN: i32 = 4;

// Mismatch probability is spread evenly over the four non-matching symbols
pub const TAU_MISMATCH: f64 = 1.0 / 4.0;
