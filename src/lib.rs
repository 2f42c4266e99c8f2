//! Blood bank inventory: donations, requests and the append-only ledger that
//! is the only source of truth for stock.

pub mod balance;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod donation;
pub mod error;
pub mod ledger;
pub mod request;
pub mod service;
pub mod types;
pub mod utils;

pub use balance::StockLevel;
pub use config::Config;
pub use donation::{Donation, DonationOutcome, DonationStatus};
pub use error::{BankError, Result, ValidationError};
pub use ledger::{EntryDraft, LedgerEntry};
pub use request::{
    Request, RequestForm, RequestOutcome, RequestStatus, StockAdvisory, Submission,
    SubmissionNotice,
};
pub use service::BloodBank;
pub use types::{Actor, BloodGroup, Movement, Role, TimeStamp, Urgency};
