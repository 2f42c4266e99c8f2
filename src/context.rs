//! Append-only status histories and the sled trees records live in
use std::fmt;
use std::marker::PhantomData;

use chrono::Utc;
use sled::transaction::{ConflictableTransactionResult, TransactionalTree, abort};

use crate::error::{BankError, Result, or_abort};
use crate::types::TimeStamp;

/// A closed status enumeration with an explicit transition table.
pub trait Status: Copy + Eq + fmt::Debug + fmt::Display {
    const INITIAL: Self;

    /// Whether `self -> next` is in the table.
    fn permits(self, next: Self) -> bool;

    fn is_terminal(self) -> bool;
}

/// One step in a record's history: who moved it where, and when.
#[derive(Debug, PartialEq, Eq, minicbor::Encode, minicbor::Decode, Clone)]
pub struct Witness<S> {
    #[n(0)]
    pub status: S,
    #[n(1)]
    pub actor: String,
    #[n(2)]
    pub at: TimeStamp<Utc>,
    #[n(3)]
    pub note: Option<String>,
}

impl<S> Witness<S> {
    pub fn new(status: S, actor: &str, note: Option<String>) -> Self {
        Self {
            status,
            actor: actor.to_string(),
            at: TimeStamp::new(),
            note,
        }
    }
}

/// The witnesses of one record, oldest first. Witnesses are only ever pushed.
#[derive(Debug, PartialEq, Eq, minicbor::Encode, minicbor::Decode, Clone)]
pub struct History<S> {
    #[n(0)]
    witnesses: Vec<Witness<S>>,
}

impl<S: Status> History<S> {
    /// A history opened by `actor` in the initial status.
    pub fn opened_by(actor: &str) -> Self {
        Self {
            witnesses: vec![Witness::new(S::INITIAL, actor, None)],
        }
    }

    pub fn current(&self) -> S {
        self.witnesses
            .last()
            .map(|witness| witness.status)
            .unwrap_or(S::INITIAL)
    }

    pub fn witnesses(&self) -> &[Witness<S>] {
        &self.witnesses
    }

    /// Pushes a witness for `next` if the transition table allows it.
    pub fn advance(
        &mut self,
        kind: &'static str,
        id: &str,
        next: S,
        actor: &str,
        note: Option<String>,
    ) -> Result<()> {
        let current = self.current();
        if !current.permits(next) {
            return Err(BankError::InvalidState {
                kind,
                id: id.to_string(),
                from: current.to_string(),
                to: next.to_string(),
            });
        }
        self.witnesses.push(Witness::new(next, actor, note));
        Ok(())
    }
}

/// Something stored in a [`RecordTree`], keyed by its id.
pub trait Record: minicbor::Encode<()> + for<'b> minicbor::Decode<'b, ()> {
    const KIND: &'static str;

    fn id(&self) -> &str;
}

pub struct RecordTree<R> {
    tree: sled::Tree,
    _record: PhantomData<R>,
}

impl<R> Clone for RecordTree<R> {
    fn clone(&self) -> Self {
        Self {
            tree: self.tree.clone(),
            _record: PhantomData,
        }
    }
}

impl<R: Record> RecordTree<R> {
    pub fn open(db: &sled::Db, name: &str) -> Result<Self> {
        Ok(Self {
            tree: db.open_tree(name)?,
            _record: PhantomData,
        })
    }

    pub(crate) fn tree(&self) -> &sled::Tree {
        &self.tree
    }

    fn not_found(id: &str) -> BankError {
        BankError::NotFound {
            kind: R::KIND,
            id: id.to_string(),
        }
    }

    /// Stores a brand-new record; an existing id is never overwritten.
    pub fn insert_new(&self, record: &R) -> Result<()> {
        let value = minicbor::to_vec(record)?;
        let swapped =
            self.tree
                .compare_and_swap(record.id().as_bytes(), None as Option<&[u8]>, Some(value))?;
        if swapped.is_err() {
            return Err(BankError::AlreadyExists {
                kind: R::KIND,
                id: record.id().to_string(),
            });
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<R> {
        let bytes = self
            .tree
            .get(id.as_bytes())?
            .ok_or_else(|| Self::not_found(id))?;
        Ok(minicbor::decode(&bytes)?)
    }

    pub fn all(&self) -> Result<Vec<R>> {
        self.tree
            .iter()
            .values()
            .map(|value| Ok(minicbor::decode(&value?)?))
            .collect()
    }

    /// Applies `change` to the stored record as a compare-and-set: if another
    /// writer moved the record first, the change is re-evaluated against the
    /// newer state.
    pub fn update<F>(&self, id: &str, change: F) -> Result<R>
    where
        F: Fn(&mut R) -> Result<()>,
    {
        Ok(self.tree.transaction(|tx| Self::update_in(tx, id, &change))?)
    }

    /// [`RecordTree::update`] as a step of a larger transaction.
    pub(crate) fn update_in<F>(
        tx: &TransactionalTree,
        id: &str,
        change: &F,
    ) -> ConflictableTransactionResult<R, BankError>
    where
        F: Fn(&mut R) -> Result<()>,
    {
        let Some(bytes) = tx.get(id.as_bytes())? else {
            return abort(Self::not_found(id));
        };
        let mut record: R = or_abort(minicbor::decode(&bytes))?;
        or_abort(change(&mut record))?;
        tx.insert(id.as_bytes(), or_abort(minicbor::to_vec(&record))?)?;
        Ok(record)
    }
}
