//! Balance derivation from ledger contents
use std::collections::BTreeMap;

use crate::error::{BankError, Result};
use crate::ledger::{Ledger, LedgerEntry};
use crate::types::{BloodGroup, Movement};

/// Credited and debited totals of one category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StockLevel {
    pub credited: u64,
    pub debited: u64,
}

impl StockLevel {
    pub fn available(&self) -> i64 {
        self.credited as i64 - self.debited as i64
    }

    pub fn apply(&mut self, entry: &LedgerEntry) {
        match entry.movement {
            Movement::Credit => self.credited += u64::from(entry.quantity),
            Movement::Debit => self.debited += u64::from(entry.quantity),
        }
    }
}

/// Folds a sequence of entries into a level. Order does not matter.
pub fn fold<'a>(entries: impl IntoIterator<Item = &'a LedgerEntry>) -> StockLevel {
    entries
        .into_iter()
        .fold(StockLevel::default(), |mut level, entry| {
            level.apply(entry);
            level
        })
}

/// Reads balances straight off the ledger.
///
/// This is the slow path: every call rescans the category. The coordinator
/// keeps running totals for the hot path and uses this resolver to seed and
/// audit them.
#[derive(Clone)]
pub struct BalanceResolver {
    ledger: Ledger,
}

impl BalanceResolver {
    pub fn new(ledger: Ledger) -> Self {
        Self { ledger }
    }

    pub fn recompute(&self, category: BloodGroup) -> Result<StockLevel> {
        let mut level = StockLevel::default();
        for entry in self.ledger.entries_for(category) {
            level.apply(&entry?);
        }
        Ok(level)
    }

    pub fn recompute_all(&self) -> Result<BTreeMap<BloodGroup, StockLevel>> {
        BloodGroup::ALL
            .into_iter()
            .map(|category| Ok((category, self.recompute(category)?)))
            .collect()
    }

    /// Checks a category's chain and that its fold is not negative.
    pub fn audit(&self, category: BloodGroup) -> Result<StockLevel> {
        self.ledger.verify_chain(category)?;
        let level = self.recompute(category)?;
        if level.available() < 0 {
            return Err(BankError::Integrity {
                category,
                reason: format!("balance folded to {}", level.available()),
            });
        }
        Ok(level)
    }
}
