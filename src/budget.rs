//! Atomic daily token budget for background LLM work.
//!
//! Knowledge extraction and integrity checks pre-check the budget before
//! calling the model and record actual usage after. The counter resets
//! when the calendar day changes.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use chrono::{Datelike, Utc};

/// Error produced when the daily token limit is exceeded.
#[derive(Debug, thiserror::Error)]
#[error("daily token limit exceeded: used {used} of {limit}")]
pub struct BudgetExceeded {
    /// Tokens already consumed today.
    pub used: u64,
    /// Maximum tokens allowed per day.
    pub limit: u64,
}

/// Daily token budget shared across all background agents.
///
/// Lock-free: the counter resets when the ordinal day of the year changes.
#[derive(Debug)]
pub struct DailyBudget {
    tokens: AtomicU64,
    reset_day: AtomicU32,
    limit: u64,
}

impl DailyBudget {
    /// Create a budget with the given daily token limit.
    pub fn new(limit: u64) -> Self {
        Self {
            tokens: AtomicU64::new(0),
            reset_day: AtomicU32::new(current_ordinal_day()),
            limit,
        }
    }

    /// Check that `estimate` more tokens would fit within today's budget.
    ///
    /// # Errors
    ///
    /// Returns [`BudgetExceeded`] when the estimate would cross the limit.
    pub fn check(&self, estimate: u64) -> Result<(), BudgetExceeded> {
        self.maybe_reset();
        let used = self.tokens.load(Ordering::Relaxed);
        if used.saturating_add(estimate) > self.limit {
            return Err(BudgetExceeded {
                used,
                limit: self.limit,
            });
        }
        Ok(())
    }

    /// Record actual token consumption.
    pub fn record(&self, tokens: u64) {
        self.maybe_reset();
        self.tokens.fetch_add(tokens, Ordering::Relaxed);
    }

    /// Tokens consumed today.
    pub fn used(&self) -> u64 {
        self.maybe_reset();
        self.tokens.load(Ordering::Relaxed)
    }

    /// The configured daily limit.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    fn maybe_reset(&self) {
        let today = current_ordinal_day();
        let stored = self.reset_day.load(Ordering::Relaxed);
        if stored != today
            && self
                .reset_day
                .compare_exchange(stored, today, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            self.tokens.store(0, Ordering::Relaxed);
        }
    }
}

fn current_ordinal_day() -> u32 {
    Utc::now().ordinal()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_within_limit() {
        let budget = DailyBudget::new(1000);
        assert!(budget.check(500).is_ok());
        budget.record(500);
        assert!(budget.check(500).is_ok());
        assert!(budget.check(501).is_err());
    }

    #[test]
    fn test_record_accumulates() {
        let budget = DailyBudget::new(1000);
        budget.record(100);
        budget.record(250);
        assert_eq!(budget.used(), 350);
    }

    #[test]
    fn test_exceeded_error_carries_context() {
        let budget = DailyBudget::new(100);
        budget.record(90);
        let err = budget.check(20).expect_err("over limit");
        assert_eq!(err.used, 90);
        assert_eq!(err.limit, 100);
    }
}
