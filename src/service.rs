//! Service layer API for the donation and request workflows
use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::instrument;

use crate::balance::{BalanceResolver, StockLevel};
use crate::config::Config;
use crate::coordinator::ApprovalCoordinator;
use crate::donation::{Donation, DonationOutcome, DonationWorkflow};
use crate::error::{BankError, Result};
use crate::ledger::{Entries, EntryDraft, Ledger, LedgerEntry};
use crate::request::{Request, RequestForm, RequestOutcome, RequestWorkflow, Submission, Thresholds};
use crate::types::{Actor, BloodGroup, Movement, TimeStamp};

pub struct BloodBank {
    instance: Arc<sled::Db>,
    ledger: Ledger,
    resolver: BalanceResolver,
    coordinator: Arc<ApprovalCoordinator>,
    donations: DonationWorkflow,
    requests: RequestWorkflow,
}

impl BloodBank {
    /// Opens the bank over an existing database with default settings.
    pub fn new(instance: Arc<sled::Db>) -> Result<Self> {
        Self::with_config(instance, &Config::default())
    }

    /// Opens the sled database named by `config.db_path`.
    pub fn open(config: &Config) -> Result<Self> {
        let instance = Arc::new(sled::open(&config.db_path)?);
        Self::with_config(instance, config)
    }

    pub fn with_config(instance: Arc<sled::Db>, config: &Config) -> Result<Self> {
        let ledger = Ledger::open(&instance)?;
        let resolver = BalanceResolver::new(ledger.clone());
        let coordinator = Arc::new(ApprovalCoordinator::open(
            ledger.clone(),
            config.lock_timeout(),
        )?);
        let donations = DonationWorkflow::open(&instance, Arc::clone(&coordinator))?;
        let thresholds = Thresholds {
            low_stock: config.low_stock_threshold,
            notice: config.notice_threshold,
        };
        let requests = RequestWorkflow::open(&instance, Arc::clone(&coordinator), thresholds)?;

        let bank = Self {
            instance,
            ledger,
            resolver,
            coordinator,
            donations,
            requests,
        };

        let initial_stock = config.initial_stock()?;
        if !initial_stock.is_empty() {
            bank.seed_if_empty(&Actor::system(), &initial_stock)?;
        }
        Ok(bank)
    }

    /// Submit a new donation pledge
    #[instrument(skip(self), fields(caller = %caller.id))]
    pub fn submit_donation(
        &self,
        caller: &Actor,
        donor: &str,
        category: BloodGroup,
        quantity: u32,
        donation_date: TimeStamp<Utc>,
    ) -> Result<Donation> {
        self.donations
            .submit(caller, donor, category, quantity, donation_date)
    }

    /// Withdraw a pending donation
    #[instrument(skip(self), fields(caller = %caller.id))]
    pub fn cancel_donation(&self, caller: &Actor, donation_id: &str) -> Result<Donation> {
        self.donations.cancel(caller, donation_id)
    }

    /// Approve or reject a pending donation
    #[instrument(skip(self), fields(caller = %caller.id))]
    pub fn decide_donation(
        &self,
        caller: &Actor,
        donation_id: &str,
        outcome: DonationOutcome,
    ) -> Result<(Donation, Option<LedgerEntry>)> {
        self.donations.decide(caller, donation_id, outcome)
    }

    /// Submit a new blood request
    #[instrument(skip(self, form), fields(caller = %caller.id, category = %form.category))]
    pub fn submit_request(&self, caller: &Actor, form: RequestForm) -> Result<Submission> {
        self.requests.submit(caller, form)
    }

    /// Withdraw a pending request
    #[instrument(skip(self), fields(caller = %caller.id))]
    pub fn cancel_request(&self, caller: &Actor, request_id: &str) -> Result<Request> {
        self.requests.cancel(caller, request_id)
    }

    /// Decide a pending request; approval debits the ledger or fails with
    /// [`BankError::InsufficientStock`]
    #[instrument(skip(self), fields(caller = %caller.id))]
    pub fn decide_request(
        &self,
        caller: &Actor,
        request_id: &str,
        outcome: RequestOutcome,
        rejection_reason: Option<String>,
    ) -> Result<(Request, Option<LedgerEntry>)> {
        self.requests
            .decide(caller, request_id, outcome, rejection_reason)
    }

    /// Committed units available for a blood group.
    pub fn balance_of(&self, category: BloodGroup) -> i64 {
        self.coordinator.level(category).available()
    }

    pub fn all_balances(&self) -> BTreeMap<BloodGroup, i64> {
        self.coordinator
            .levels()
            .into_iter()
            .map(|(category, level)| (category, level.available()))
            .collect()
    }

    /// Credited, debited and available units per blood group.
    pub fn stock_levels(&self) -> BTreeMap<BloodGroup, StockLevel> {
        self.coordinator.levels()
    }

    /// Manually moves stock, e.g. to correct a miscount or record units that
    /// arrived outside the donation workflow. Debits are gated on the balance
    /// like request approvals.
    #[instrument(skip(self), fields(caller = %caller.id))]
    pub fn adjust_stock(
        &self,
        caller: &Actor,
        movement: Movement,
        category: BloodGroup,
        quantity: u32,
        donor: Option<String>,
        patient: Option<String>,
    ) -> Result<LedgerEntry> {
        if !caller.is_admin() {
            return Err(BankError::Authorization {
                actor: caller.id.clone(),
                action: "adjust stock",
            });
        }
        let draft = EntryDraft::new(movement, category, quantity, &caller.id)
            .with_donor(donor)
            .with_patient(patient);
        self.coordinator.commit(draft)
    }

    /// Credits `stock` only if the ledger holds no entries yet. Returns the
    /// entries written, which is empty when the ledger was already in use.
    ///
    /// Every category section is held while checking and writing, so
    /// concurrent seeds through one bank credit the stock once. All
    /// quantities are validated before anything is written.
    #[instrument(skip(self, stock), fields(caller = %caller.id))]
    pub fn seed_if_empty(
        &self,
        caller: &Actor,
        stock: &[(BloodGroup, u32)],
    ) -> Result<Vec<LedgerEntry>> {
        if !caller.is_admin() {
            return Err(BankError::Authorization {
                actor: caller.id.clone(),
                action: "seed stock",
            });
        }
        let drafts = stock
            .iter()
            .map(|(category, units)| EntryDraft::credit(*category, *units, &caller.id))
            .collect();
        self.coordinator.seed(drafts)
    }

    /// Re-derives every balance from the ledger and checks it against the
    /// running totals and the digest chain. Each category is checked while
    /// holding its section, after folding in anything other handles on the
    /// database committed, so concurrent approvals wait rather than skew the
    /// comparison.
    #[instrument(skip(self))]
    pub fn verify_ledger(&self) -> Result<BTreeMap<BloodGroup, StockLevel>> {
        let mut levels = BTreeMap::new();
        for category in BloodGroup::ALL {
            let section = self.coordinator.enter(category)?;
            self.coordinator.refresh(&section)?;
            let folded = self.resolver.audit(category)?;
            let running = self.coordinator.level(category);
            if folded != running {
                return Err(BankError::Integrity {
                    category,
                    reason: format!(
                        "running total {} disagrees with ledger fold {}",
                        running.available(),
                        folded.available()
                    ),
                });
            }
            levels.insert(category, folded);
        }
        tracing::info!("ledger verified");
        Ok(levels)
    }

    pub fn get_donation(&self, donation_id: &str) -> Result<Donation> {
        self.donations.get(donation_id)
    }

    pub fn all_donations(&self) -> Result<Vec<Donation>> {
        self.donations.all()
    }

    pub fn donations_by(&self, donor: &str) -> Result<Vec<Donation>> {
        self.donations.by_donor(donor)
    }

    pub fn get_request(&self, request_id: &str) -> Result<Request> {
        self.requests.get(request_id)
    }

    pub fn all_requests(&self) -> Result<Vec<Request>> {
        self.requests.all()
    }

    pub fn requests_by(&self, recipient: &str) -> Result<Vec<Request>> {
        self.requests.by_recipient(recipient)
    }

    /// Entries of one blood group, oldest first.
    pub fn entries_for(&self, category: BloodGroup) -> Entries {
        self.ledger.entries_for(category)
    }

    /// Every ledger entry, newest first.
    pub fn ledger_entries(&self) -> Result<Vec<LedgerEntry>> {
        let mut entries = self.ledger.entries().collect::<Result<Vec<_>>>()?;
        entries.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(entries)
    }

    /// Blocks until everything written so far is on disk.
    pub fn flush(&self) -> Result<usize> {
        Ok(self.instance.flush()?)
    }
}
