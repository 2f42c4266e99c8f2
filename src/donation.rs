//! Donor pledges and the credit they turn into once approved
use std::fmt;
use std::sync::Arc;

use chrono::Utc;

use crate::context::{History, Record, RecordTree, Status};
use crate::coordinator::ApprovalCoordinator;
use crate::error::{BankError, Result, ValidationError};
use crate::ledger::{EntryDraft, LedgerEntry};
use crate::types::{Actor, BloodGroup, TimeStamp};
use crate::utils::new_uuid_to_bech32;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
#[cbor(index_only)]
pub enum DonationStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Approved,
    #[n(2)]
    Rejected,
    #[n(3)]
    Cancelled,
}

impl fmt::Display for DonationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl Status for DonationStatus {
    const INITIAL: Self = DonationStatus::Pending;

    fn permits(self, next: Self) -> bool {
        use DonationStatus::*;
        matches!(
            (self, next),
            (Pending, Approved) | (Pending, Rejected) | (Pending, Cancelled)
        )
    }

    fn is_terminal(self) -> bool {
        self != DonationStatus::Pending
    }
}

/// What an administrator may decide about a pending donation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DonationOutcome {
    Approved,
    Rejected,
}

impl From<DonationOutcome> for DonationStatus {
    fn from(value: DonationOutcome) -> Self {
        match value {
            DonationOutcome::Approved => DonationStatus::Approved,
            DonationOutcome::Rejected => DonationStatus::Rejected,
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Donation {
    #[n(0)]
    pub id: String, // bech32 encoded uuid7, "don" prefix
    #[n(1)]
    pub donor: String,
    #[n(2)]
    pub category: BloodGroup,
    #[n(3)]
    pub quantity: u32,
    #[n(4)]
    pub donation_date: TimeStamp<Utc>,
    #[n(5)]
    pub submitted_at: TimeStamp<Utc>,
    #[n(6)]
    pub history: History<DonationStatus>,
}

impl Donation {
    pub fn status(&self) -> DonationStatus {
        self.history.current()
    }
}

impl Record for Donation {
    const KIND: &'static str = "donation";

    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Clone)]
pub struct DonationWorkflow {
    records: RecordTree<Donation>,
    coordinator: Arc<ApprovalCoordinator>,
}

impl DonationWorkflow {
    pub const TREE: &'static str = "donations";

    pub fn open(db: &sled::Db, coordinator: Arc<ApprovalCoordinator>) -> Result<Self> {
        Ok(Self {
            records: RecordTree::open(db, Self::TREE)?,
            coordinator,
        })
    }

    /// Records a pledge. No stock moves until an administrator approves it.
    pub fn submit(
        &self,
        caller: &Actor,
        donor: &str,
        category: BloodGroup,
        quantity: u32,
        donation_date: TimeStamp<Utc>,
    ) -> Result<Donation> {
        if quantity == 0 {
            return Err(ValidationError::ZeroQuantity.into());
        }
        if donor.trim().is_empty() {
            return Err(ValidationError::EmptyField("donor").into());
        }
        if caller.id != donor && !caller.is_admin() {
            return Err(BankError::Authorization {
                actor: caller.id.clone(),
                action: "submit a donation for another donor",
            });
        }

        let donation = Donation {
            id: new_uuid_to_bech32("don")?,
            donor: donor.to_string(),
            category,
            quantity,
            donation_date,
            submitted_at: TimeStamp::new(),
            history: History::opened_by(&caller.id),
        };
        self.records.insert_new(&donation)?;

        tracing::debug!(id = %donation.id, %category, quantity, "donation submitted");
        Ok(donation)
    }

    /// Withdraws a pending pledge. Only the donor who made it may do so.
    pub fn cancel(&self, caller: &Actor, id: &str) -> Result<Donation> {
        let donation = self.records.update(id, |donation| {
            if donation.donor != caller.id {
                return Err(BankError::Authorization {
                    actor: caller.id.clone(),
                    action: "cancel another donor's donation",
                });
            }
            donation.history.advance(
                Donation::KIND,
                &donation.id,
                DonationStatus::Cancelled,
                &caller.id,
                None,
            )
        })?;

        tracing::debug!(id, "donation cancelled");
        Ok(donation)
    }

    /// Applies an administrator's decision. Approval credits the ledger with
    /// the pledged units in the same commit as the status change.
    pub fn decide(
        &self,
        caller: &Actor,
        id: &str,
        outcome: DonationOutcome,
    ) -> Result<(Donation, Option<LedgerEntry>)> {
        if !caller.is_admin() {
            return Err(BankError::Authorization {
                actor: caller.id.clone(),
                action: "decide donations",
            });
        }
        let next = DonationStatus::from(outcome);
        let change = |donation: &mut Donation| {
            donation
                .history
                .advance(Donation::KIND, &donation.id, next, &caller.id, None)
        };

        match outcome {
            DonationOutcome::Rejected => {
                let donation = self.records.update(id, &change)?;
                tracing::info!(id, "donation rejected");
                Ok((donation, None))
            }
            DonationOutcome::Approved => {
                // Fail fast on stale decisions without queueing on the section.
                // The check repeats under the section and again inside the
                // transaction against the stored record.
                let current = self.movable(id, next)?;

                let draft = EntryDraft::credit(current.category, current.quantity, &caller.id)
                    .with_donor(Some(current.donor.clone()))
                    .with_source(id);
                let (entry, donation) = self.coordinator.commit_with(
                    draft,
                    self.records.tree(),
                    || self.movable(id, next).map(|_| ()),
                    |tx| RecordTree::<Donation>::update_in(tx, id, &change),
                )?;

                tracing::info!(id, entry = entry.id, "donation approved");
                Ok((donation, Some(entry)))
            }
        }
    }

    /// The stored donation, if it may still move to `next`.
    fn movable(&self, id: &str, next: DonationStatus) -> Result<Donation> {
        let current = self.records.get(id)?;
        if !current.status().permits(next) {
            return Err(BankError::InvalidState {
                kind: Donation::KIND,
                id: id.to_string(),
                from: current.status().to_string(),
                to: next.to_string(),
            });
        }
        Ok(current)
    }

    pub fn get(&self, id: &str) -> Result<Donation> {
        self.records.get(id)
    }

    /// Every donation, newest first.
    pub fn all(&self) -> Result<Vec<Donation>> {
        let mut donations = self.records.all()?;
        donations.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
        Ok(donations)
    }

    pub fn by_donor(&self, donor: &str) -> Result<Vec<Donation>> {
        Ok(self
            .all()?
            .into_iter()
            .filter(|donation| donation.donor == donor)
            .collect())
    }
}
