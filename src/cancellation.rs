//! Cancellation primitives shared by every operation in the crate.
//!
//! Anything that represents in-flight work hands back something
//! [`Cancellable`]. Cancelling is cooperative: it stops further work from
//! being dispatched and makes late results be ignored, but it cannot recall a
//! request that has already left the process.
//!
//! # Example
//!
//! ```rust
//! use paysub::{Cancellable, CancellationToken, GroupCancellable};
//!
//! let group = GroupCancellable::new();
//! let first = CancellationToken::new();
//! group.add(first.clone());
//!
//! group.cancel();
//! assert!(first.is_cancelled());
//!
//! // Children added after the fact are cancelled on the spot.
//! let late = CancellationToken::new();
//! group.add(late.clone());
//! assert!(late.is_cancelled());
//! assert!(group.is_empty());
//! ```

use std::sync::Arc;

use parking_lot::Mutex;

/// A token for cooperative cancellation of async work.
///
/// Re-exported from `tokio_util` so that callers can `select!` on
/// [`cancelled()`](tokio_util::sync::CancellationToken::cancelled) as well as
/// use it through the [`Cancellable`] trait.
pub type CancellationToken = tokio_util::sync::CancellationToken;

/// Something that can be cancelled.
///
/// `cancel` must be idempotent and callable from any thread. Once it returns,
/// no further work may be dispatched on behalf of the cancelled operation.
pub trait Cancellable: Send + Sync {
    /// Cancel the underlying work. Calling this more than once has no
    /// additional effect.
    fn cancel(&self);
}

impl Cancellable for CancellationToken {
    fn cancel(&self) {
        CancellationToken::cancel(self);
    }
}

impl<C: Cancellable + ?Sized> Cancellable for Box<C> {
    fn cancel(&self) {
        (**self).cancel();
    }
}

impl<C: Cancellable + ?Sized> Cancellable for Arc<C> {
    fn cancel(&self) {
        (**self).cancel();
    }
}

/// Aggregates child cancellables and cancels them together.
///
/// Once the group is cancelled it stays cancelled; children added afterwards
/// are cancelled inline instead of being stored, so a late timer or retry can
/// never outlive the operation that owned the group.
#[derive(Default)]
pub struct GroupCancellable {
    state: Mutex<GroupState>,
}

#[derive(Default)]
struct GroupState {
    cancelled: bool,
    children: Vec<Box<dyn Cancellable>>,
}

impl GroupCancellable {
    /// Create an empty, live group.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a child to the group.
    ///
    /// If the group has already been cancelled the child is cancelled
    /// immediately and dropped.
    pub fn add(&self, child: impl Cancellable + 'static) {
        let mut state = self.state.lock();
        if state.cancelled {
            drop(state);
            child.cancel();
        } else {
            state.children.push(Box::new(child));
        }
    }

    /// Whether [`cancel`](Cancellable::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    /// Number of live children.
    pub fn len(&self) -> usize {
        self.state.lock().children.len()
    }

    /// Returns true if the group holds no live children.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Cancellable for GroupCancellable {
    fn cancel(&self) {
        // Drained under the lock, cancelled outside it: a child may call back
        // into this group while being cancelled.
        let children = {
            let mut state = self.state.lock();
            if state.cancelled {
                return;
            }
            state.cancelled = true;
            std::mem::take(&mut state.children)
        };
        for child in children {
            child.cancel();
        }
    }
}

/// Cancels the wrapped value when dropped.
///
/// Used by the async front-ends so that dropping a pending future cancels the
/// operation it was awaiting.
pub(crate) struct CancelOnDrop<C: Cancellable>(pub(crate) C);

impl<C: Cancellable> Drop for CancelOnDrop<C> {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

impl std::fmt::Debug for GroupCancellable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("GroupCancellable")
            .field("cancelled", &state.cancelled)
            .field("children", &state.children.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Default)]
    struct CountingCancellable(Arc<AtomicUsize>);

    impl CountingCancellable {
        fn count(&self) -> usize {
            self.0.load(Ordering::SeqCst)
        }
    }

    impl Cancellable for CountingCancellable {
        fn cancel(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_cancel_cancels_every_child_once() {
        let group = GroupCancellable::new();
        let a = CountingCancellable::default();
        let b = CountingCancellable::default();
        group.add(a.clone());
        group.add(b.clone());
        assert_eq!(group.len(), 2);

        group.cancel();
        group.cancel();

        assert_eq!(a.count(), 1);
        assert_eq!(b.count(), 1);
        assert!(group.is_cancelled());
        assert!(group.is_empty());
    }

    #[test]
    fn test_add_after_cancel_cancels_inline() {
        let group = GroupCancellable::new();
        group.cancel();

        let child = CountingCancellable::default();
        group.add(child.clone());

        assert_eq!(child.count(), 1);
        assert!(group.is_empty());
    }

    #[test]
    fn test_reentrant_cancel_from_child() {
        struct Reentrant(Arc<GroupCancellable>, CountingCancellable);

        impl Cancellable for Reentrant {
            fn cancel(&self) {
                self.0.cancel();
                self.0.add(self.1.clone());
            }
        }

        let group = Arc::new(GroupCancellable::new());
        let late = CountingCancellable::default();
        group.add(Reentrant(group.clone(), late.clone()));

        group.cancel();

        assert_eq!(late.count(), 1);
    }

    #[test]
    fn test_tokio_token_through_trait() {
        let token = CancellationToken::new();
        let boxed: Box<dyn Cancellable> = Box::new(token.clone());
        boxed.cancel();
        boxed.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_debug_output() {
        let group = GroupCancellable::new();
        group.add(CancellationToken::new());
        let debug = format!("{:?}", group);
        assert!(debug.contains("GroupCancellable"));
        assert!(debug.contains("children: 1"));
    }
}
