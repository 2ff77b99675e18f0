// Runtime options for consensus generation.
//
// Everything here has a sane default; the CLI maps its flags onto this
// struct and library callers can override fields directly.

use crate::defaults;

#[derive(Debug, Clone)]
pub struct CnsOptions {
    /// Split column coverage into alleles before calling bases.
    pub split_alleles: bool,

    /// Width of the moving window used to smooth per-column variation
    /// scores. Zero groups only immediately adjacent variant columns;
    /// negative disables grouping entirely.
    pub smooth_win: i32,

    /// Base error rate accepted when aligning a read to the running
    /// consensus. Escalated (2x, 4x) when placement fails.
    pub error_rate: f64,

    /// Hard ceiling on the escalated error rate.
    pub max_error_rate: f64,

    /// Minimum accepted overlap length between a read and the anchor.
    pub min_overlap: usize,

    /// Windows wider than this are skipped by abacus refinement; a window
    /// this wide usually hides a real polymorphism that shifting would
    /// corrupt.
    pub max_abacus_window: usize,
}

impl Default for CnsOptions {
    fn default() -> Self {
        CnsOptions {
            split_alleles: true,
            smooth_win: defaults::DEFAULT_SMOOTH_WIN,
            error_rate: defaults::CNS_ERROR_RATE,
            max_error_rate: defaults::MAX_ERROR_RATE,
            min_overlap: defaults::MIN_OVERLAP_LEN,
            max_abacus_window: defaults::MAX_WINDOW_FOR_ABACUS_REFINE,
        }
    }
}

impl CnsOptions {
    /// Error rate for retry round `attempt` (0-based), clamped to the
    /// configured ceiling.
    pub fn escalated_error_rate(&self, attempt: u32) -> f64 {
        (self.error_rate * f64::from(1u32 << attempt)).min(self.max_error_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_rate_escalation_is_clamped() {
        let opt = CnsOptions::default();
        assert_eq!(opt.escalated_error_rate(0), opt.error_rate);
        assert_eq!(opt.escalated_error_rate(1), opt.error_rate * 2.0);
        assert!(opt.escalated_error_rate(10) <= opt.max_error_rate);
    }
}
