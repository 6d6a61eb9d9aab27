//! Tiered polling cadence.
//!
//! Which endpoints a cycle polls depends only on `cycle_index mod 6`:
//!
//! | cycle mod 6 | endpoints                                  |
//! |-------------|--------------------------------------------|
//! | 0           | Tier A + B + C (full sweep)                |
//! | 3           | Tier A + B                                 |
//! | otherwise   | Tier A (`position`, `car_data`)            |
//!
//! With 11 cycles per invocation this yields full sweeps on cycles 0 and 6
//! and lap summaries on cycles 3 and 9.

use f1_common::{Endpoint, Tier};

/// Endpoints to poll on `cycle_index`, in polling order.
pub fn endpoints_for_cycle(cycle_index: u32) -> Vec<Endpoint> {
    Endpoint::ALL
        .iter()
        .copied()
        .filter(|endpoint| endpoint.tier().is_due(cycle_index))
        .collect()
}

/// Tiers due on `cycle_index`.
pub fn tiers_for_cycle(cycle_index: u32) -> Vec<Tier> {
    [Tier::A, Tier::B, Tier::C]
        .into_iter()
        .filter(|tier| tier.is_due(cycle_index))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIER_A: [Endpoint; 2] = [Endpoint::Position, Endpoint::CarData];

    #[test]
    fn test_full_sweep_cycles() {
        for cycle in [0, 6] {
            assert_eq!(endpoints_for_cycle(cycle), Endpoint::ALL.to_vec());
            assert_eq!(tiers_for_cycle(cycle), vec![Tier::A, Tier::B, Tier::C]);
        }
    }

    #[test]
    fn test_lap_cycles() {
        for cycle in [3, 9] {
            assert_eq!(
                endpoints_for_cycle(cycle),
                vec![Endpoint::Position, Endpoint::CarData, Endpoint::Laps]
            );
            assert_eq!(tiers_for_cycle(cycle), vec![Tier::A, Tier::B]);
        }
    }

    #[test]
    fn test_tier_a_only_cycles() {
        for cycle in [1, 2, 4, 5, 7, 8, 10] {
            assert_eq!(endpoints_for_cycle(cycle), TIER_A.to_vec());
            assert_eq!(tiers_for_cycle(cycle), vec![Tier::A]);
        }
    }

    #[test]
    fn test_schedule_is_periodic() {
        for cycle in 0..60 {
            assert_eq!(endpoints_for_cycle(cycle), endpoints_for_cycle(cycle + 6));
            assert_eq!(endpoints_for_cycle(cycle), endpoints_for_cycle(cycle));
        }
    }

    #[test]
    fn test_invocation_poll_count() {
        let total: usize = (0..11).map(|cycle| endpoints_for_cycle(cycle).len()).sum();
        // 11 * 2 tier A + 4 lap polls + 2 * 3 tier C
        assert_eq!(total, 32);
    }
}
