//! Per-phase budget allocation and zone classification.
//!
//! The monitor turns a budget profile into absolute per-phase token
//! allocations and classifies usage into zones. Warnings are data; callers
//! surface them through the event bus rather than raising errors.

use crate::config::BudgetProfile;
use crate::phase::PhaseId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Context-utilization band for a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetZone {
    /// 0-40% of the phase allocation: full quality expected.
    Smart,
    /// 40-80%: degradation risk, consider compacting.
    Dumb,
    /// 80-100%: compaction urgent.
    Critical,
    /// Above the phase allocation.
    OverBudget,
}

/// Result of a budget check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetCheck {
    pub phase: PhaseId,
    pub used: u64,
    pub allocated: u64,
    pub usage_pct: f64,
    pub zone: BudgetZone,
    pub warnings: Vec<String>,
    pub recommendations: Vec<String>,
}

/// Allocates and polices per-phase token budgets.
#[derive(Debug, Clone)]
pub struct BudgetMonitor {
    allocations: HashMap<PhaseId, u64>,
    window: u64,
}

impl BudgetMonitor {
    /// Compute allocations for every phase from a profile and window size.
    ///
    /// Phases absent from the profile get a zero allocation; profile
    /// percentages that sum below 100 leave headroom unallocated.
    pub fn allocate(profile: &BudgetProfile, window: u64) -> Self {
        let mut allocations = HashMap::new();
        for phase in PhaseId::ALL {
            let pct = profile.percentages.get(phase.as_str()).copied().unwrap_or(0.0);
            let tokens = (window as f64 * pct / 100.0).floor() as u64;
            allocations.insert(phase, tokens);
        }
        // Planning and healing draw from the architect and builder shares.
        if allocations.get(&PhaseId::Planning) == Some(&0) {
            let architect = allocations.get(&PhaseId::Architecting).copied().unwrap_or(0);
            allocations.insert(PhaseId::Planning, architect);
        }
        if allocations.get(&PhaseId::Healing) == Some(&0) {
            let builder = allocations.get(&PhaseId::Building).copied().unwrap_or(0);
            allocations.insert(PhaseId::Healing, builder);
        }
        Self {
            allocations,
            window,
        }
    }

    /// The context window these allocations were derived from.
    pub fn window(&self) -> u64 {
        self.window
    }

    /// Allocation for one phase.
    pub fn allocation(&self, phase: PhaseId) -> u64 {
        self.allocations.get(&phase).copied().unwrap_or(0)
    }

    /// All allocations.
    pub fn allocations(&self) -> &HashMap<PhaseId, u64> {
        &self.allocations
    }

    /// Classify usage for a phase into a zone and derive warnings.
    pub fn check(&self, phase: PhaseId, used: u64) -> BudgetCheck {
        let allocated = self.allocation(phase);
        let usage_pct = if allocated == 0 {
            if used == 0 { 0.0 } else { 100.0 }
        } else {
            (used as f64 / allocated as f64) * 100.0
        };

        let zone = if used > allocated {
            BudgetZone::OverBudget
        } else if usage_pct >= 80.0 {
            BudgetZone::Critical
        } else if usage_pct >= 40.0 {
            BudgetZone::Dumb
        } else {
            BudgetZone::Smart
        };

        let mut warnings = Vec::new();
        let mut recommendations = Vec::new();
        match zone {
            BudgetZone::Smart => {}
            BudgetZone::Dumb => {
                warnings.push(format!(
                    "{phase} at {usage_pct:.1}% of allocation, quality degradation possible"
                ));
                recommendations.push("Consider compacting context before the next call".into());
            }
            BudgetZone::Critical => {
                warnings.push(format!(
                    "{phase} at {usage_pct:.1}% of allocation, compaction urgent"
                ));
                recommendations.push("Compact context now".into());
            }
            BudgetZone::OverBudget => {
                warnings.push(format!(
                    "{phase} exceeded its allocation: {used} of {allocated} tokens"
                ));
                recommendations.push("Force a compaction; fail the phase if still exceeded".into());
            }
        }

        BudgetCheck {
            phase,
            used,
            allocated,
            usage_pct,
            zone,
            warnings,
            recommendations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> BudgetMonitor {
        BudgetMonitor::allocate(&BudgetProfile::standard(), 200_000)
    }

    #[test]
    fn standard_allocations_follow_profile_percentages() {
        let m = monitor();
        assert_eq!(m.allocation(PhaseId::System), 30_000); // 15%
        assert_eq!(m.allocation(PhaseId::Scouting), 14_000); // 7%
        assert_eq!(m.allocation(PhaseId::Architecting), 14_000); // 7%
        assert_eq!(m.allocation(PhaseId::Building), 40_000); // 20%
        assert_eq!(m.allocation(PhaseId::Validating), 40_000); // 20%
        assert_eq!(m.allocation(PhaseId::Documentation), 10_000); // 5%
        assert_eq!(m.allocation(PhaseId::Deploy), 6_000); // 3%
        assert_eq!(m.allocation(PhaseId::Feedback), 10_000); // 5%
    }

    #[test]
    fn allocations_leave_headroom() {
        let m = monitor();
        let total: u64 = PhaseId::ALL
            .iter()
            .filter(|p| !matches!(p, PhaseId::Planning | PhaseId::Healing))
            .map(|p| m.allocation(*p))
            .sum();
        assert!(total < 200_000);
    }

    #[test]
    fn planning_and_healing_borrow_allocations() {
        let m = monitor();
        assert_eq!(m.allocation(PhaseId::Planning), m.allocation(PhaseId::Architecting));
        assert_eq!(m.allocation(PhaseId::Healing), m.allocation(PhaseId::Building));
    }

    #[test]
    fn zone_boundaries() {
        let m = monitor();
        let alloc = m.allocation(PhaseId::Building); // 40_000

        assert_eq!(m.check(PhaseId::Building, 0).zone, BudgetZone::Smart);
        // Just below 40%
        assert_eq!(m.check(PhaseId::Building, alloc * 39 / 100).zone, BudgetZone::Smart);
        // Exactly 40%
        assert_eq!(m.check(PhaseId::Building, alloc * 40 / 100).zone, BudgetZone::Dumb);
        // Exactly 80%
        assert_eq!(m.check(PhaseId::Building, alloc * 80 / 100).zone, BudgetZone::Critical);
        // Exactly 100%
        assert_eq!(m.check(PhaseId::Building, alloc).zone, BudgetZone::Critical);
        // Beyond the allocation
        assert_eq!(m.check(PhaseId::Building, alloc + 1).zone, BudgetZone::OverBudget);
    }

    #[test]
    fn zero_usage_is_smart_zone() {
        let m = monitor();
        let check = m.check(PhaseId::Scouting, 0);
        assert_eq!(check.zone, BudgetZone::Smart);
        assert!(check.warnings.is_empty());
    }

    #[test]
    fn warnings_are_data_not_errors() {
        let m = monitor();
        let alloc = m.allocation(PhaseId::Scouting);

        let check = m.check(PhaseId::Scouting, alloc + 100);
        assert_eq!(check.zone, BudgetZone::OverBudget);
        assert!(!check.warnings.is_empty());
        assert!(!check.recommendations.is_empty());
        assert!(check.warnings[0].contains("scouting"));
    }

    #[test]
    fn zero_allocation_phase_with_usage_is_over() {
        let mut profile = BudgetProfile::standard();
        profile.percentages.clear();
        let m = BudgetMonitor::allocate(&profile, 200_000);
        assert_eq!(m.check(PhaseId::Deploy, 10).zone, BudgetZone::OverBudget);
        assert_eq!(m.check(PhaseId::Deploy, 0).zone, BudgetZone::Smart);
    }
}
