//! Per-category serialization of stock-affecting decisions
//!
//! Each blood group owns one section. Holding a section is the only way to
//! append to the ledger through this coordinator, and the running totals kept
//! next to it are checked against the stored ledger head on every entry, so
//! other handles on the same database are noticed and folded in before a
//! debit is gated. Different categories never wait on each other.
use std::collections::BTreeMap;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use sled::Transactional;
use sled::transaction::{ConflictableTransactionResult, TransactionalTree};

use crate::balance::{BalanceResolver, StockLevel};
use crate::error::{BankError, Result, ValidationError};
use crate::ledger::{EntryDraft, Ledger, LedgerEntry};
use crate::types::{BloodGroup, Movement};

// Commit attempts before a moving head is reported as `Stale`.
const MAX_ATTEMPTS: u32 = 3;

struct SectionState {
    held: bool,
    level: StockLevel,
    head: Option<String>, // digest of the last committed entry
}

struct Section {
    state: Mutex<SectionState>,
    released: Condvar,
}

impl Section {
    fn seeded(level: StockLevel, head: Option<String>) -> Self {
        Self {
            state: Mutex::new(SectionState {
                held: false,
                level,
                head,
            }),
            released: Condvar::new(),
        }
    }

    // The inner mutex is only ever held for a few field reads or writes, so a
    // poisoned lock still guards consistent data.
    fn lock(&self) -> MutexGuard<'_, SectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Exclusive hold on one category. Released on drop, including on unwind.
pub(crate) struct SectionGuard<'a> {
    section: &'a Section,
    category: BloodGroup,
}

impl SectionGuard<'_> {
    fn snapshot(&self) -> (StockLevel, Option<String>) {
        let state = self.section.lock();
        (state.level, state.head.clone())
    }

    fn advance(&self, entry: &LedgerEntry, digest: String) {
        let mut state = self.section.lock();
        state.level.apply(entry);
        state.head = Some(digest);
    }

    fn reseed(&self, level: StockLevel, head: Option<String>) {
        let mut state = self.section.lock();
        state.level = level;
        state.head = head;
    }
}

impl Drop for SectionGuard<'_> {
    fn drop(&mut self) {
        self.section.lock().held = false;
        self.section.released.notify_all();
        tracing::trace!(category = %self.category, "section released");
    }
}

pub struct ApprovalCoordinator {
    ledger: Ledger,
    resolver: BalanceResolver,
    sections: Vec<Section>, // indexed by BloodGroup::code
    lock_timeout: Duration,
}

impl ApprovalCoordinator {
    /// Seeds every section's running totals and digest head from a full fold
    /// of the ledger.
    pub fn open(ledger: Ledger, lock_timeout: Duration) -> Result<Self> {
        let resolver = BalanceResolver::new(ledger.clone());
        let mut sections = Vec::with_capacity(BloodGroup::ALL.len());
        for category in BloodGroup::ALL {
            let head = ledger.head(category)?;
            sections.push(Section::seeded(resolver.recompute(category)?, head));
        }
        Ok(Self {
            ledger,
            resolver,
            sections,
            lock_timeout,
        })
    }

    fn section(&self, category: BloodGroup) -> &Section {
        &self.sections[category.code() as usize]
    }

    /// Committed totals for a category. Does not wait for the section.
    ///
    /// The running totals are used unless the stored head shows another
    /// handle has written since, in which case the category is refolded.
    pub fn level(&self, category: BloodGroup) -> StockLevel {
        let (level, head) = {
            let state = self.section(category).lock();
            (state.level, state.head.clone())
        };
        let moved = match self.ledger.head(category) {
            Ok(stored) => stored != head,
            Err(err) => {
                tracing::warn!(%category, %err, "could not read the ledger head");
                false
            }
        };
        if !moved {
            return level;
        }
        match self.resolver.recompute(category) {
            Ok(folded) => folded,
            Err(err) => {
                tracing::warn!(%category, %err, "could not refold the ledger, using running totals");
                level
            }
        }
    }

    pub fn levels(&self) -> BTreeMap<BloodGroup, StockLevel> {
        BloodGroup::ALL
            .into_iter()
            .map(|category| (category, self.level(category)))
            .collect()
    }

    pub(crate) fn enter(&self, category: BloodGroup) -> Result<SectionGuard<'_>> {
        let section = self.section(category);
        let started = Instant::now();
        let state = section.lock();
        let (mut state, _) = section
            .released
            .wait_timeout_while(state, self.lock_timeout, |state| state.held)
            .unwrap_or_else(PoisonError::into_inner);
        if state.held {
            let waited = started.elapsed();
            tracing::warn!(
                %category,
                ?waited,
                timeout = ?self.lock_timeout,
                "gave up waiting for the category section"
            );
            return Err(BankError::Contention { category, waited });
        }
        state.held = true;
        tracing::trace!(%category, waited = ?started.elapsed(), "section entered");
        Ok(SectionGuard { section, category })
    }

    /// Reloads a held section from the ledger if the stored head moved since
    /// this coordinator last wrote, e.g. through another handle on the same
    /// database.
    pub(crate) fn refresh(&self, guard: &SectionGuard<'_>) -> Result<()> {
        let category = guard.category;
        let stored = self.ledger.head(category)?;
        if guard.snapshot().1 != stored {
            let level = self.resolver.recompute(category)?;
            tracing::debug!(%category, available = level.available(), "ledger moved, section reseeded");
            guard.reseed(level, stored);
        }
        Ok(())
    }

    /// Appends a standalone entry, with debits gated on the current balance.
    pub fn commit(&self, draft: EntryDraft) -> Result<LedgerEntry> {
        if draft.quantity == 0 {
            return Err(ValidationError::ZeroQuantity.into());
        }
        let guard = self.enter(draft.category)?;
        self.run(&guard, draft, || Ok(()), |entry| self.ledger.append(entry))
    }

    /// Appends an entry and applies `stage` to `records` in one transaction.
    /// Either both land or neither does.
    ///
    /// `ready` runs under the section before the balance is read, so a record
    /// that moved while the caller queued is reported as such rather than as
    /// a stock shortage.
    pub(crate) fn commit_with<T, C, F>(
        &self,
        draft: EntryDraft,
        records: &sled::Tree,
        ready: C,
        stage: F,
    ) -> Result<(LedgerEntry, T)>
    where
        C: Fn() -> Result<()>,
        F: Fn(&TransactionalTree) -> ConflictableTransactionResult<T, BankError>,
    {
        if draft.quantity == 0 {
            return Err(ValidationError::ZeroQuantity.into());
        }
        let guard = self.enter(draft.category)?;
        let mut staged = None;
        let entry = self.run(&guard, draft, ready, |entry| {
            let outcome = (self.ledger.tree(), self.ledger.heads(), records).transaction(
                |(entries, heads, records)| {
                    let outcome = stage(records)?;
                    Ledger::stage(entries, heads, entry)?;
                    Ok(outcome)
                },
            )?;
            staged = Some(outcome);
            Ok(())
        })?;
        match staged {
            Some(outcome) => Ok((entry, outcome)),
            None => Err(BankError::Integrity {
                category: entry.category,
                reason: format!("entry {} committed without its record change", entry.id),
            }),
        }
    }

    /// Credits `drafts` as the first entries of an empty ledger. Every
    /// section is held throughout, so two seeds through this coordinator can
    /// never both find the ledger empty. Returns nothing when the ledger was
    /// already in use.
    pub fn seed(&self, drafts: Vec<EntryDraft>) -> Result<Vec<LedgerEntry>> {
        if drafts.iter().any(|draft| draft.quantity == 0) {
            return Err(ValidationError::ZeroQuantity.into());
        }
        let guards = BloodGroup::ALL
            .into_iter()
            .map(|category| self.enter(category))
            .collect::<Result<Vec<_>>>()?;
        if !self.ledger.is_empty() {
            tracing::debug!("ledger already holds entries, skipping seed");
            return Ok(Vec::new());
        }
        drafts
            .into_iter()
            .map(|draft| {
                let guard = &guards[draft.category.code() as usize];
                self.run(guard, draft, || Ok(()), |entry| self.ledger.append(entry))
            })
            .collect()
    }

    /// The critical section: refresh, check, seal, write, advance. A write
    /// that loses to another handle is retried against the reloaded totals.
    fn run<C, W>(
        &self,
        guard: &SectionGuard<'_>,
        draft: EntryDraft,
        ready: C,
        mut write: W,
    ) -> Result<LedgerEntry>
    where
        C: Fn() -> Result<()>,
        W: FnMut(&LedgerEntry) -> Result<()>,
    {
        let category = guard.category;
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.refresh(guard)?;
            ready()?;
            let (level, head) = guard.snapshot();

            if draft.movement == Movement::Debit && level.available() < i64::from(draft.quantity) {
                tracing::warn!(
                    %category,
                    available = level.available(),
                    requested = draft.quantity,
                    "debit refused"
                );
                return Err(BankError::InsufficientStock {
                    category,
                    available: level.available(),
                    requested: draft.quantity,
                });
            }

            let entry = draft.clone().seal(self.ledger.next_id()?, head);
            let digest = entry.digest()?;
            match write(&entry) {
                Ok(()) => {
                    guard.advance(&entry, digest);
                    tracing::info!(
                        %category,
                        id = entry.id,
                        movement = %entry.movement,
                        quantity = entry.quantity,
                        balance = level.available() + entry.delta(),
                        "ledger entry committed"
                    );
                    return Ok(entry);
                }
                Err(BankError::Stale { .. }) if attempt < MAX_ATTEMPTS => {
                    tracing::debug!(%category, attempt, "ledger head moved during commit, retrying");
                }
                Err(err) => return Err(err),
            }
        }
    }
}
