use tracing::warn;

/// Decision returned by the run budget after a freeze.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BudgetDecision {
    /// Repetitions are still owed: restart the runner asking for exactly `remaining`.
    Restart { remaining: u32 },
    /// Nothing left to run, or too many freezes in a row made no progress; the test is failed.
    Exhausted,
}

/// Repetitions still owed for one logical test.
///
/// Only pass markers pay the budget down. A repetition that failed or hung
/// before reporting is not subtracted, so it is implicitly asked for again on
/// the next restart.
///
/// `max_stalled` bounds consecutive restarts that added no pass. A runner that
/// keeps passing is restarted until the budget is paid off.
pub struct RunBudget {
    configured: u32,
    remaining: u32,
    max_stalled: u32,
    stalled: u32,
    passes_at_last_freeze: u64,
    restarts: u32,
}

impl RunBudget {
    pub fn new(configured: u32, max_stalled: u32) -> Self {
        Self {
            configured,
            remaining: configured,
            max_stalled,
            stalled: 0,
            passes_at_last_freeze: 0,
            restarts: 0,
        }
    }

    /// Repetitions to request from the next runner start.
    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    /// Evaluate a freeze given the cumulative pass markers seen so far.
    pub fn after_freeze(&mut self, passes_observed: u64) -> BudgetDecision {
        let passes = i64::try_from(passes_observed).unwrap_or(i64::MAX);
        let remaining = i64::from(self.configured).saturating_sub(passes);

        if remaining <= 0 {
            self.remaining = 0;
            warn!(
                configured = self.configured,
                passes_observed, "freeze with no repetitions left, giving up"
            );
            return BudgetDecision::Exhausted;
        }

        let progressed = passes_observed > self.passes_at_last_freeze;
        self.passes_at_last_freeze = passes_observed;
        if progressed {
            self.stalled = 0;
        } else if self.stalled >= self.max_stalled {
            warn!(
                stalled = self.stalled,
                max_restarts = self.max_stalled,
                remaining,
                "runner keeps freezing without passing, giving up"
            );
            return BudgetDecision::Exhausted;
        } else {
            self.stalled += 1;
        }

        self.restarts += 1;
        // remaining is in 1..=configured here
        self.remaining = u32::try_from(remaining).unwrap_or(self.configured);
        warn!(
            remaining = self.remaining,
            passes_observed,
            restart = self.restarts,
            "runner froze, restarting for remaining repetitions"
        );
        BudgetDecision::Restart {
            remaining: self.remaining,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_budget_owes_everything() {
        let budget = RunBudget::new(5, u32::MAX);
        assert_eq!(budget.remaining(), 5);
        assert_eq!(budget.restarts(), 0);
    }

    #[test]
    fn test_remaining_is_configured_minus_passes() {
        let mut budget = RunBudget::new(10, u32::MAX);
        assert_eq!(
            budget.after_freeze(3),
            BudgetDecision::Restart { remaining: 7 }
        );
        assert_eq!(budget.remaining(), 7);
    }

    #[test]
    fn test_freeze_before_any_pass_retries_everything() {
        let mut budget = RunBudget::new(4, u32::MAX);
        assert_eq!(
            budget.after_freeze(0),
            BudgetDecision::Restart { remaining: 4 }
        );
        assert_eq!(
            budget.after_freeze(0),
            BudgetDecision::Restart { remaining: 4 }
        );
        assert_eq!(budget.restarts(), 2);
    }

    #[test]
    fn test_passes_are_cumulative_across_restarts() {
        let mut budget = RunBudget::new(5, u32::MAX);
        assert_eq!(
            budget.after_freeze(2),
            BudgetDecision::Restart { remaining: 3 }
        );
        // Second attempt added one more pass before freezing again.
        assert_eq!(
            budget.after_freeze(3),
            BudgetDecision::Restart { remaining: 2 }
        );
    }

    #[test]
    fn test_exhausted_when_all_passed() {
        let mut budget = RunBudget::new(3, u32::MAX);
        assert_eq!(budget.after_freeze(3), BudgetDecision::Exhausted);
        assert_eq!(budget.remaining(), 0);
    }

    #[test]
    fn test_exhausted_when_overpaid() {
        let mut budget = RunBudget::new(1, u32::MAX);
        assert_eq!(budget.after_freeze(4), BudgetDecision::Exhausted);
    }

    #[test]
    fn test_stall_cap() {
        let mut budget = RunBudget::new(3, 1);
        assert_eq!(
            budget.after_freeze(0),
            BudgetDecision::Restart { remaining: 3 }
        );
        assert_eq!(budget.after_freeze(0), BudgetDecision::Exhausted);
        assert_eq!(budget.restarts(), 1);
    }

    #[test]
    fn test_progress_resets_stall_count() {
        let mut budget = RunBudget::new(6, 1);
        assert_eq!(
            budget.after_freeze(0),
            BudgetDecision::Restart { remaining: 6 }
        );
        assert_eq!(
            budget.after_freeze(1),
            BudgetDecision::Restart { remaining: 5 }
        );
        assert_eq!(
            budget.after_freeze(1),
            BudgetDecision::Restart { remaining: 5 }
        );
        assert_eq!(budget.after_freeze(1), BudgetDecision::Exhausted);
    }

    #[test]
    fn test_progressing_runner_restarts_until_paid_off() {
        let mut budget = RunBudget::new(6, 0);
        for passes in 1..6u64 {
            assert_eq!(
                budget.after_freeze(passes),
                BudgetDecision::Restart {
                    remaining: 6 - passes as u32
                }
            );
        }
        assert_eq!(budget.restarts(), 5);
        assert_eq!(budget.after_freeze(6), BudgetDecision::Exhausted);
        assert_eq!(budget.remaining(), 0);
    }

    #[test]
    fn test_zero_restart_cap_never_restarts() {
        let mut budget = RunBudget::new(3, 0);
        assert_eq!(budget.after_freeze(0), BudgetDecision::Exhausted);
    }
}
