//! Recipient requests and the debit they turn into once approved
use std::fmt;
use std::sync::Arc;

use chrono::Utc;

use crate::context::{History, Record, RecordTree, Status};
use crate::coordinator::ApprovalCoordinator;
use crate::error::{BankError, Result, ValidationError};
use crate::ledger::{EntryDraft, LedgerEntry};
use crate::types::{Actor, BloodGroup, TimeStamp, Urgency};
use crate::utils::new_uuid_to_bech32;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
#[cbor(index_only)]
pub enum RequestStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Approved,
    #[n(2)]
    Rejected,
    #[n(3)]
    Fulfilled,
    #[n(4)]
    Cancelled,
    #[n(5)]
    Unavailable,
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl Status for RequestStatus {
    const INITIAL: Self = RequestStatus::Pending;

    fn permits(self, next: Self) -> bool {
        use RequestStatus::*;
        matches!(
            (self, next),
            (Pending, Approved)
                | (Pending, Rejected)
                | (Pending, Fulfilled)
                | (Pending, Cancelled)
                | (Pending, Unavailable)
        )
    }

    fn is_terminal(self) -> bool {
        self != RequestStatus::Pending
    }
}

/// What an administrator may decide about a pending request. Cancellation
/// belongs to the recipient and is not a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Approved,
    Rejected,
    Fulfilled,
    Unavailable,
}

impl From<RequestOutcome> for RequestStatus {
    fn from(value: RequestOutcome) -> Self {
        match value {
            RequestOutcome::Approved => RequestStatus::Approved,
            RequestOutcome::Rejected => RequestStatus::Rejected,
            RequestOutcome::Fulfilled => RequestStatus::Fulfilled,
            RequestOutcome::Unavailable => RequestStatus::Unavailable,
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Request {
    #[n(0)]
    pub id: String, // bech32 encoded uuid7, "req" prefix
    #[n(1)]
    pub recipient: String,
    #[n(2)]
    pub category: BloodGroup,
    #[n(3)]
    pub quantity: u32,
    #[n(4)]
    pub reason: String,
    #[n(5)]
    pub hospital: String,
    #[n(6)]
    pub urgency: Urgency,
    #[n(7)]
    pub submitted_at: TimeStamp<Utc>,
    #[n(8)]
    pub rejection_reason: Option<String>,
    #[n(9)]
    pub history: History<RequestStatus>,
}

impl Request {
    pub fn status(&self) -> RequestStatus {
        self.history.current()
    }
}

impl Record for Request {
    const KIND: &'static str = "request";

    fn id(&self) -> &str {
        &self.id
    }
}

/// What a recipient fills in when asking for blood.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestForm {
    pub recipient: String,
    pub category: BloodGroup,
    pub quantity: u32,
    pub reason: String,
    pub hospital: String,
    pub urgency: Urgency,
}

impl RequestForm {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.quantity == 0 {
            return Err(ValidationError::ZeroQuantity);
        }
        if self.recipient.trim().is_empty() {
            return Err(ValidationError::EmptyField("recipient"));
        }
        if self.reason.trim().is_empty() {
            return Err(ValidationError::EmptyField("reason"));
        }
        if self.hospital.trim().is_empty() {
            return Err(ValidationError::EmptyField("hospital"));
        }
        Ok(())
    }
}

/// Stock as seen at submission time. Informational only: stock can move
/// before an administrator gets to the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StockAdvisory {
    pub available: i64,
    pub is_low: bool,
    pub is_unavailable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionNotice {
    Accepted,
    LowStock,
    Unavailable,
}

impl fmt::Display for SubmissionNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SubmissionNotice::Accepted => "Request submitted successfully",
            SubmissionNotice::LowStock => "Request submitted but stock is low for this blood type",
            SubmissionNotice::Unavailable => {
                "Request submitted but blood type is currently unavailable"
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub request: Request,
    pub advisory: StockAdvisory,
    pub notice: SubmissionNotice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub low_stock: i64,
    pub notice: i64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            low_stock: 5,
            notice: 10,
        }
    }
}

impl Thresholds {
    pub fn advise(&self, available: i64) -> (StockAdvisory, SubmissionNotice) {
        let advisory = StockAdvisory {
            available,
            is_low: available <= self.low_stock,
            is_unavailable: available <= 0,
        };
        let notice = if available <= 0 {
            SubmissionNotice::Unavailable
        } else if available <= self.notice {
            SubmissionNotice::LowStock
        } else {
            SubmissionNotice::Accepted
        };
        (advisory, notice)
    }
}

#[derive(Clone)]
pub struct RequestWorkflow {
    records: RecordTree<Request>,
    coordinator: Arc<ApprovalCoordinator>,
    thresholds: Thresholds,
}

impl RequestWorkflow {
    pub const TREE: &'static str = "requests";

    pub fn open(
        db: &sled::Db,
        coordinator: Arc<ApprovalCoordinator>,
        thresholds: Thresholds,
    ) -> Result<Self> {
        Ok(Self {
            records: RecordTree::open(db, Self::TREE)?,
            coordinator,
            thresholds,
        })
    }

    /// Records a request in Pending whatever the current stock. The advisory
    /// returned alongside is computed from the committed balance.
    pub fn submit(&self, caller: &Actor, form: RequestForm) -> Result<Submission> {
        form.validate()?;
        if caller.id != form.recipient && !caller.is_admin() {
            return Err(BankError::Authorization {
                actor: caller.id.clone(),
                action: "submit a request for another recipient",
            });
        }

        let available = self.coordinator.level(form.category).available();
        let (advisory, notice) = self.thresholds.advise(available);

        let request = Request {
            id: new_uuid_to_bech32("req")?,
            recipient: form.recipient,
            category: form.category,
            quantity: form.quantity,
            reason: form.reason,
            hospital: form.hospital,
            urgency: form.urgency,
            submitted_at: TimeStamp::new(),
            rejection_reason: None,
            history: History::opened_by(&caller.id),
        };
        self.records.insert_new(&request)?;

        tracing::debug!(
            id = %request.id,
            category = %request.category,
            quantity = request.quantity,
            available,
            "request submitted"
        );
        Ok(Submission {
            request,
            advisory,
            notice,
        })
    }

    /// Withdraws a pending request. Only the recipient who made it may do so.
    pub fn cancel(&self, caller: &Actor, id: &str) -> Result<Request> {
        let request = self.records.update(id, |request| {
            if request.recipient != caller.id {
                return Err(BankError::Authorization {
                    actor: caller.id.clone(),
                    action: "cancel another recipient's request",
                });
            }
            request.history.advance(
                Request::KIND,
                &request.id,
                RequestStatus::Cancelled,
                &caller.id,
                None,
            )
        })?;

        tracing::debug!(id, "request cancelled");
        Ok(request)
    }

    /// Applies an administrator's decision.
    ///
    /// Approval goes through the coordinator: the balance is checked, the
    /// debit appended and the status moved in one commit. When stock is short
    /// the request stays Pending and the caller gets
    /// [`BankError::InsufficientStock`]; marking it Unavailable instead is a
    /// separate decision.
    pub fn decide(
        &self,
        caller: &Actor,
        id: &str,
        outcome: RequestOutcome,
        rejection_reason: Option<String>,
    ) -> Result<(Request, Option<LedgerEntry>)> {
        if !caller.is_admin() {
            return Err(BankError::Authorization {
                actor: caller.id.clone(),
                action: "decide requests",
            });
        }
        if rejection_reason.is_some() && outcome != RequestOutcome::Rejected {
            return Err(ValidationError::UnexpectedReason.into());
        }
        let next = RequestStatus::from(outcome);
        let change = |request: &mut Request| -> Result<()> {
            request.history.advance(
                Request::KIND,
                &request.id,
                next,
                &caller.id,
                rejection_reason.clone(),
            )?;
            if next == RequestStatus::Rejected {
                request.rejection_reason = rejection_reason.clone();
            }
            Ok(())
        };

        if outcome != RequestOutcome::Approved {
            let request = self.records.update(id, &change)?;
            tracing::info!(id, status = %next, "request decided");
            return Ok((request, None));
        }

        // Fail fast on stale decisions without queueing on the section. The
        // check repeats under the section, before the balance is read, and
        // again inside the transaction against the stored record.
        let current = self.movable(id, next)?;

        let draft = EntryDraft::debit(current.category, current.quantity, &caller.id)
            .with_patient(Some(current.recipient.clone()))
            .with_source(id);
        let (entry, request) = self.coordinator.commit_with(
            draft,
            self.records.tree(),
            || self.movable(id, next).map(|_| ()),
            |tx| RecordTree::<Request>::update_in(tx, id, &change),
        )?;

        tracing::info!(id, entry = entry.id, "request approved");
        Ok((request, Some(entry)))
    }

    /// The stored request, if it may still move to `next`.
    fn movable(&self, id: &str, next: RequestStatus) -> Result<Request> {
        let current = self.records.get(id)?;
        if !current.status().permits(next) {
            return Err(BankError::InvalidState {
                kind: Request::KIND,
                id: id.to_string(),
                from: current.status().to_string(),
                to: next.to_string(),
            });
        }
        Ok(current)
    }

    pub fn get(&self, id: &str) -> Result<Request> {
        self.records.get(id)
    }

    /// Every request, newest first.
    pub fn all(&self) -> Result<Vec<Request>> {
        let mut requests = self.records.all()?;
        requests.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
        Ok(requests)
    }

    pub fn by_recipient(&self, recipient: &str) -> Result<Vec<Request>> {
        Ok(self
            .all()?
            .into_iter()
            .filter(|request| request.recipient == recipient)
            .collect())
    }
}
