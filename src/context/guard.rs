//! Single in-flight operation guard.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{ContextError, ContextResult};

/// A RAII guard that marks a context busy for one operation.
#[derive(Debug)]
pub(crate) struct OperationGuard<'a> {
    busy: &'a AtomicBool,
}

impl<'a> OperationGuard<'a> {
    /// Take the busy flag, or fail if another operation holds it.
    pub(crate) fn acquire(busy: &'a AtomicBool, operation: &str) -> ContextResult<Self> {
        busy.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .map_err(|_| {
                ContextError::InvalidOperation(format!(
                    "{} started while another operation is in flight on the same context",
                    operation
                ))
            })?;
        Ok(Self { busy })
    }
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_fails_until_drop() {
        let busy = AtomicBool::new(false);
        let first = OperationGuard::acquire(&busy, "save").unwrap();
        assert!(matches!(
            OperationGuard::acquire(&busy, "delete"),
            Err(ContextError::InvalidOperation(_))
        ));
        drop(first);
        assert!(OperationGuard::acquire(&busy, "delete").is_ok());
    }
}
