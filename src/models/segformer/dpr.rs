//! Progressive drop-path rate schedules.
//!
//! Stochastic depth rates for a hierarchical backbone grow linearly from 0
//! at the first block to the configured maximum at the last block, counted
//! over the flattened depth of all stages.
use crate::compat::ops::float_vec_linspace;

/// Computes a linear drop-path rate ramp over the total block depth.
///
/// ## Arguments
///
/// * `drop_path_rate` - Maximum rate, reached at the final block.
/// * `total_depth` - Total number of blocks across all stages.
///
/// ## Returns
///
/// A rate per block, starting at 0.
#[must_use]
pub fn progressive_drop_path_rates(
    drop_path_rate: f64,
    total_depth: usize,
) -> Vec<f64> {
    float_vec_linspace(0.0, drop_path_rate, total_depth)
}

/// A per-stage view of a progressive drop-path rate schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct DropPathSchedule {
    rates: Vec<f64>,
    stage_depths: Vec<usize>,
}

impl DropPathSchedule {
    /// Builds a schedule from a maximum rate and per-stage block depths.
    #[must_use]
    pub fn new(
        drop_path_rate: f64,
        stage_depths: &[usize],
    ) -> Self {
        let total_depth = stage_depths.iter().sum();
        Self {
            rates: progressive_drop_path_rates(drop_path_rate, total_depth),
            stage_depths: stage_depths.to_vec(),
        }
    }

    /// Per-stage block depths.
    #[must_use]
    pub fn stage_depths(&self) -> &[usize] {
        &self.stage_depths
    }

    /// Total number of blocks across all stages.
    #[must_use]
    pub fn total_depth(&self) -> usize {
        self.rates.len()
    }

    /// Number of stages.
    #[must_use]
    pub fn num_stages(&self) -> usize {
        self.stage_depths.len()
    }

    /// Rates for the blocks of one stage.
    ///
    /// ## Panics
    ///
    /// If `stage` is out of range.
    #[must_use]
    pub fn stage_rates(
        &self,
        stage: usize,
    ) -> &[f64] {
        assert!(
            stage < self.num_stages(),
            "Stage index {} out of range for {} stages",
            stage,
            self.num_stages()
        );
        let start: usize = self.stage_depths[..stage].iter().sum();
        &self.rates[start..start + self.stage_depths[stage]]
    }

    /// Rates for every stage.
    #[must_use]
    pub fn all_stage_rates(&self) -> Vec<&[f64]> {
        (0..self.num_stages()).map(|i| self.stage_rates(i)).collect()
    }
}

/// Convenience wrapper producing owned per-stage rate tables.
#[must_use]
pub fn stage_rate_table(
    drop_path_rate: f64,
    stage_depths: &[usize],
) -> Vec<Vec<f64>> {
    DropPathSchedule::new(drop_path_rate, stage_depths)
        .all_stage_rates()
        .iter()
        .map(|r| r.to_vec())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::assert_close_to_vec;

    #[test]
    fn test_progressive_rates() {
        assert_eq!(progressive_drop_path_rates(0.5, 0), Vec::<f64>::new());
        assert_eq!(progressive_drop_path_rates(0.5, 1), vec![0.0]);
        assert_close_to_vec(
            &progressive_drop_path_rates(0.3, 4),
            &[0.0, 0.1, 0.2, 0.3],
            1e-9,
        );
    }

    #[test]
    fn test_schedule() {
        let schedule = DropPathSchedule::new(0.1, &[2, 3, 4]);

        assert_eq!(schedule.num_stages(), 3);
        assert_eq!(schedule.total_depth(), 9);
        assert_eq!(schedule.stage_depths(), &[2, 3, 4]);

        assert_close_to_vec(schedule.stage_rates(0), &[0.0, 0.0125], 1e-9);
        assert_close_to_vec(schedule.stage_rates(1), &[0.025, 0.0375, 0.05], 1e-9);
        assert_close_to_vec(
            schedule.stage_rates(2),
            &[0.0625, 0.075, 0.0875, 0.1],
            1e-9,
        );

        let all = schedule.all_stage_rates();
        assert_eq!(all.len(), 3);
        assert_eq!(all[1].len(), 3);
    }

    #[test]
    #[should_panic(expected = "Stage index 3 out of range for 3 stages")]
    fn test_schedule_out_of_range() {
        let schedule = DropPathSchedule::new(0.1, &[2, 3, 4]);
        let _ = schedule.stage_rates(3);
    }

    #[test]
    fn test_stage_rate_table() {
        let table = stage_rate_table(0.1, &[2, 2]);
        assert_eq!(table.len(), 2);
        assert_close_to_vec(&table[0], &[0.0, 0.1 / 3.0], 1e-9);
        assert_close_to_vec(&table[1], &[0.2 / 3.0, 0.1], 1e-9);
    }
}
