//! Append-only store of inventory movements
//!
//! Entries live in their own sled tree under `[category code][entry id]`
//! keys. Nothing here updates or removes an entry; corrections are further
//! entries in the opposite direction.
use chrono::Utc;
use sled::Transactional;
use sled::transaction::{ConflictableTransactionResult, TransactionalTree, abort};

use crate::error::{BankError, Result, ValidationError, or_abort};
use crate::types::{BloodGroup, Movement, TimeStamp};
use crate::utils::ledger_key;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    #[n(0)]
    pub id: u64, // monotonic, assigned by the store
    #[n(1)]
    pub movement: Movement,
    #[n(2)]
    pub category: BloodGroup,
    #[n(3)]
    pub quantity: u32,
    #[n(4)]
    pub donor: Option<String>,
    #[n(5)]
    pub patient: Option<String>,
    #[n(6)]
    pub source: Option<String>, // donation or request id that produced the movement
    #[n(7)]
    pub recorded_by: String,
    #[n(8)]
    pub recorded_at: TimeStamp<Utc>,
    #[n(9)]
    pub prev_digest: Option<String>, // digest of the previous entry in the same category
}

impl LedgerEntry {
    /// Signed effect of this entry on its category's balance.
    pub fn delta(&self) -> i64 {
        match self.movement {
            Movement::Credit => i64::from(self.quantity),
            Movement::Debit => -i64::from(self.quantity),
        }
    }

    /// sha256 over the CBOR encoding, hex encoded.
    pub fn digest(&self) -> Result<String> {
        let cbor = minicbor::to_vec(self)?;
        Ok(sha256::digest(&cbor))
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.quantity == 0 {
            return Err(ValidationError::ZeroQuantity);
        }
        if self.recorded_by.trim().is_empty() {
            return Err(ValidationError::EmptyField("recorded_by"));
        }
        Ok(())
    }
}

/// The caller-supplied part of an entry. The store fills in the id, the
/// timestamp and the digest link when the draft is sealed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryDraft {
    pub movement: Movement,
    pub category: BloodGroup,
    pub quantity: u32,
    pub donor: Option<String>,
    pub patient: Option<String>,
    pub source: Option<String>,
    pub recorded_by: String,
}

impl EntryDraft {
    pub fn new(movement: Movement, category: BloodGroup, quantity: u32, recorded_by: &str) -> Self {
        Self {
            movement,
            category,
            quantity,
            donor: None,
            patient: None,
            source: None,
            recorded_by: recorded_by.to_string(),
        }
    }
    pub fn credit(category: BloodGroup, quantity: u32, recorded_by: &str) -> Self {
        Self::new(Movement::Credit, category, quantity, recorded_by)
    }
    pub fn debit(category: BloodGroup, quantity: u32, recorded_by: &str) -> Self {
        Self::new(Movement::Debit, category, quantity, recorded_by)
    }
    pub fn with_donor(mut self, donor: Option<String>) -> Self {
        self.donor = donor;
        self
    }
    pub fn with_patient(mut self, patient: Option<String>) -> Self {
        self.patient = patient;
        self
    }
    pub fn with_source(mut self, source: &str) -> Self {
        self.source = Some(source.to_string());
        self
    }

    pub(crate) fn seal(self, id: u64, prev_digest: Option<String>) -> LedgerEntry {
        LedgerEntry {
            id,
            movement: self.movement,
            category: self.category,
            quantity: self.quantity,
            donor: self.donor,
            patient: self.patient,
            source: self.source,
            recorded_by: self.recorded_by,
            recorded_at: TimeStamp::new(),
            prev_digest,
        }
    }
}

#[derive(Clone)]
pub struct Ledger {
    db: sled::Db,
    tree: sled::Tree,
    heads: sled::Tree, // category code -> digest of its last entry
}

impl Ledger {
    pub const TREE: &'static str = "ledger";
    pub const HEADS: &'static str = "ledger_heads";

    pub fn open(db: &sled::Db) -> Result<Self> {
        Ok(Self {
            db: db.clone(),
            tree: db.open_tree(Self::TREE)?,
            heads: db.open_tree(Self::HEADS)?,
        })
    }

    pub(crate) fn tree(&self) -> &sled::Tree {
        &self.tree
    }

    pub(crate) fn heads(&self) -> &sled::Tree {
        &self.heads
    }

    /// Digest of the last committed entry of a category, as stored. Every
    /// handle on the database sees the same head.
    pub fn head(&self, category: BloodGroup) -> Result<Option<String>> {
        match self.heads.get([category.code()])? {
            Some(bytes) => String::from_utf8(bytes.to_vec())
                .map(Some)
                .map_err(|e| BankError::Codec(e.to_string())),
            None => Ok(None),
        }
    }

    pub(crate) fn next_id(&self) -> Result<u64> {
        Ok(self.db.generate_id()?)
    }

    /// Durable, immutable append outside of any record transaction.
    pub(crate) fn append(&self, entry: &LedgerEntry) -> Result<()> {
        (&self.tree, &self.heads)
            .transaction(|(entries, heads)| Self::stage(entries, heads, entry))?;
        Ok(())
    }

    /// Stages `entry` inside a transaction that covers both ledger trees.
    ///
    /// The entry must extend the stored head of its category; if another
    /// handle appended first the transaction aborts with
    /// [`BankError::Stale`] and nothing is written.
    pub(crate) fn stage(
        entries: &TransactionalTree,
        heads: &TransactionalTree,
        entry: &LedgerEntry,
    ) -> ConflictableTransactionResult<(), BankError> {
        or_abort(entry.validate())?;
        let key = ledger_key(entry.category, entry.id);
        if entries.get(&key[..])?.is_some() {
            return abort(BankError::Integrity {
                category: entry.category,
                reason: format!("entry {} already exists", entry.id),
            });
        }
        let head_key = [entry.category.code()];
        let stored = heads.get(head_key)?;
        if stored.as_deref() != entry.prev_digest.as_deref().map(str::as_bytes) {
            return abort(BankError::Stale {
                category: entry.category,
            });
        }
        let digest = or_abort(entry.digest())?;
        entries.insert(&key[..], or_abort(minicbor::to_vec(entry))?)?;
        heads.insert(&head_key[..], digest.as_bytes())?;
        Ok(())
    }

    /// Every entry of one category, oldest first. Each call starts a fresh
    /// scan, so the sequence can be restarted at will.
    pub fn entries_for(&self, category: BloodGroup) -> Entries {
        Entries {
            inner: self.tree.scan_prefix([category.code()]),
        }
    }

    /// Every entry across all categories, grouped by category.
    pub fn entries(&self) -> Entries {
        Entries {
            inner: self.tree.iter(),
        }
    }

    pub fn last_for(&self, category: BloodGroup) -> Result<Option<LedgerEntry>> {
        self.entries_for(category).next_back().transpose()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    /// Walks one category checking that every entry links to the digest of
    /// its predecessor. Returns the number of entries checked.
    pub fn verify_chain(&self, category: BloodGroup) -> Result<usize> {
        let mut expected: Option<String> = None;
        let mut checked = 0;
        for entry in self.entries_for(category) {
            let entry = entry?;
            let fail = |reason: String| BankError::Integrity { category, reason };
            if entry.category != category {
                return Err(fail(format!("entry {} is filed under the wrong key", entry.id)));
            }
            entry.validate()?;
            if entry.prev_digest != expected {
                return Err(fail(format!("entry {} breaks the digest chain", entry.id)));
            }
            expected = Some(entry.digest()?);
            checked += 1;
        }
        if self.head(category)? != expected {
            return Err(BankError::Integrity {
                category,
                reason: "stored head does not match the last entry".to_string(),
            });
        }
        Ok(checked)
    }
}

/// Lazy iterator over stored entries.
pub struct Entries {
    inner: sled::Iter,
}

fn decode_item(item: sled::Result<(sled::IVec, sled::IVec)>) -> Result<LedgerEntry> {
    let (_, value) = item?;
    Ok(minicbor::decode(&value)?)
}

impl Iterator for Entries {
    type Item = Result<LedgerEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(decode_item)
    }
}

impl DoubleEndedIterator for Entries {
    fn next_back(&mut self) -> Option<Self::Item> {
        self.inner.next_back().map(decode_item)
    }
}
