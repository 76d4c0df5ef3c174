//! Query handles.
//!
//! `Query` rows stay attached to their context: changes made through
//! `modify` are written by the next flush. `ReadonlyQuery` rows are
//! detached copies and never reach the store.

use crate::context::retry_context::RetryContext;
use crate::error::{ContextError, ContextResult};
use crate::store::{Entity, Store};

/// Tracked rows of `T`.
pub struct Query<'a, T: Entity, S: Store> {
    context: &'a RetryContext<S>,
    rows: Vec<T>,
}

impl<'a, T: Entity, S: Store> Query<'a, T, S> {
    pub(crate) fn new(context: &'a RetryContext<S>, rows: Vec<T>) -> Self {
        Self { context, rows }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.rows.iter()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, key: &T::Key) -> Option<&T> {
        self.rows.iter().find(|r| &r.key() == key)
    }

    pub fn find<P>(&self, predicate: P) -> Option<&T>
    where
        P: Fn(&T) -> bool,
    {
        self.rows.iter().find(|r| predicate(r))
    }

    /// Keep only rows matching `predicate`. Dropped rows stay tracked.
    pub fn filter<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&T) -> bool,
    {
        self.rows.retain(|r| predicate(r));
        self
    }

    /// Change the row with `key` in place and record the change for the
    /// next flush. Returns false if no such row was loaded.
    pub fn modify<F>(&mut self, key: &T::Key, f: F) -> ContextResult<bool>
    where
        F: FnOnce(&mut T),
    {
        let Some(row) = self.rows.iter_mut().find(|r| &r.key() == key) else {
            return Ok(false);
        };

        let before = row.clone();
        f(row);
        if &row.key() != key {
            *row = before;
            return Err(ContextError::Argument(format!(
                "modify must not change the key of {} {:?}",
                T::TABLE,
                key
            )));
        }

        self.context.refresh_tracked(row)?;
        Ok(true)
    }

    /// Take the rows. They remain tracked; later changes need `RetryContext::save`.
    pub fn into_vec(self) -> Vec<T> {
        self.rows
    }
}

/// Detached rows of `T`.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadonlyQuery<T> {
    rows: Vec<T>,
}

impl<T: Entity> ReadonlyQuery<T> {
    pub(crate) fn new(rows: Vec<T>) -> Self {
        Self { rows }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.rows.iter()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, key: &T::Key) -> Option<&T> {
        self.rows.iter().find(|r| &r.key() == key)
    }

    pub fn filter<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&T) -> bool,
    {
        self.rows.retain(|r| predicate(r));
        self
    }

    pub fn into_vec(self) -> Vec<T> {
        self.rows
    }
}

impl<T> IntoIterator for ReadonlyQuery<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}
