//! Shared accumulator for difference rows.
//!
//! The accumulator holds the set of difference rows under the invariant that
//! no stored row includes another, together with a per-column weight vector.
//! All mutating operations are safe to call from many worker threads at
//! once. The weight vector and the row store are guarded independently, so
//! weight updates never contend with row scans.
//!
//! Two row stores are provided. [`StoreKind::Locked`] keeps the rows in a
//! vector behind a single mutex and runs the scan-discard-evict pass inside
//! the critical section. [`StoreKind::Lockfree`] (the default) keeps a
//! singly linked list with a per-node spin flag: traversals proceed
//! hand-over-hand holding at most two locks, so concurrent insertions scan
//! disjoint parts of the list in parallel. Each node carries an insertion
//! generation ("age"), and the list is ordered by strictly decreasing age;
//! when a concurrent prepend forces a retry, the re-scan stops at the first
//! node the previous pass already examined.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use thiserror::Error;

use crate::row::Row;

#[derive(Debug, Error)]
pub enum AccumulateError {
    #[error("column weight overflow at column {column}: {current} + {delta} exceeds i64 range")]
    WeightOverflow {
        column: usize,
        current: i64,
        delta: i64,
    },
}

/// Storage strategy for the row set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreKind {
    /// Mutex-guarded vector. Insertions serialize; simplest possible store.
    Locked,
    /// Hand-over-hand locked list. Insertions pipeline down the list.
    #[default]
    Lockfree,
}

/// Dominance-filtered collection of difference rows plus column weights.
#[derive(Debug)]
pub struct Accumulator {
    width: usize,
    weights: Mutex<Vec<i64>>,
    store: Store,
}

#[derive(Debug)]
enum Store {
    Locked(Mutex<Vec<Row>>),
    Lockfree(LinkList),
}

impl Accumulator {
    pub fn new(width: usize) -> Self {
        Self::with_store(width, StoreKind::default())
    }

    pub fn with_store(width: usize, kind: StoreKind) -> Self {
        let store = match kind {
            StoreKind::Locked => Store::Locked(Mutex::new(Vec::new())),
            StoreKind::Lockfree => Store::Lockfree(LinkList::new()),
        };
        Self {
            width,
            weights: Mutex::new(vec![0i64; width]),
            store,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Add one difference row and its per-column weight contribution.
    ///
    /// The weight update and the dominance-filtered insertion run under
    /// separate guards and never nest.
    pub fn add_row(&self, row: Row, deltas: &[i64]) -> Result<(), AccumulateError> {
        assert_eq!(row.width(), self.width, "row width mismatch");
        assert_eq!(deltas.len(), self.width, "weight delta width mismatch");
        self.add_weights(deltas)?;
        self.insert(row);
        Ok(())
    }

    /// Fold another accumulator of the same width into this one, consuming
    /// it. Every row goes through the same dominance-filtered insertion, so
    /// folding per-worker accumulators yields the same final set as sharing
    /// a single one.
    pub fn add_matrix(&self, other: Accumulator) -> Result<(), AccumulateError> {
        assert_eq!(other.width, self.width, "accumulator width mismatch");
        let (weights, rows) = other.into_parts();
        self.add_weights(&weights)?;
        for row in rows {
            self.insert(row);
        }
        Ok(())
    }

    fn add_weights(&self, deltas: &[i64]) -> Result<(), AccumulateError> {
        let mut weights = self.weights.lock();
        for (column, (slot, &delta)) in weights.iter_mut().zip(deltas).enumerate() {
            *slot = slot
                .checked_add(delta)
                .ok_or(AccumulateError::WeightOverflow {
                    column,
                    current: *slot,
                    delta,
                })?;
        }
        Ok(())
    }

    fn insert(&self, row: Row) {
        match &self.store {
            Store::Locked(rows) => insert_filtered(&mut rows.lock(), row),
            Store::Lockfree(list) => list.insert(row),
        }
    }

    /// Snapshot of the column weights.
    pub fn column_weights(&self) -> Vec<i64> {
        self.weights.lock().clone()
    }

    /// Snapshot of the stored rows, in the store's internal order. The
    /// order is stable once the computation has quiesced.
    pub fn rows(&self) -> Vec<Row> {
        match &self.store {
            Store::Locked(rows) => rows.lock().clone(),
            Store::Lockfree(list) => list.snapshot(),
        }
    }

    /// Decompose into the weight vector and the stored rows.
    pub fn into_parts(self) -> (Vec<i64>, Vec<Row>) {
        let weights = self.weights.into_inner();
        let rows = match self.store {
            Store::Locked(rows) => rows.into_inner(),
            Store::Lockfree(list) => list.into_rows(),
        };
        (weights, rows)
    }
}

/// The single-threaded dominance filter: discard the candidate if a stored
/// row includes it, evict every stored row the candidate includes, then
/// append.
fn insert_filtered(rows: &mut Vec<Row>, row: Row) {
    let mut i = 0;
    while i < rows.len() {
        if rows[i].includes(&row) {
            return;
        }
        if row.includes(&rows[i]) {
            rows.swap_remove(i);
            continue;
        }
        i += 1;
    }
    rows.push(row);
}

// ============================================================================
// Lock-free list store
// ============================================================================

/// Test-and-set spin flag with acquire/release ordering.
struct Spin(AtomicBool);

impl Spin {
    const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    fn lock(&self) {
        while self.0.swap(true, Ordering::Acquire) {
            std::hint::spin_loop();
        }
    }

    fn unlock(&self) {
        self.0.store(false, Ordering::Release);
    }
}

struct Node {
    row: Row,
    /// Insertion generation. Strictly decreasing along the list; carries no
    /// meaning beyond bounding the re-scan on retry.
    age: u64,
    /// Guarded by `sync`.
    next: *mut Node,
    sync: Spin,
}

struct HeadState {
    next: *mut Node,
    age: u64,
}

/// Singly linked list with hand-over-hand locking.
///
/// Lock discipline: the head flag guards `HeadState`; each node's flag
/// guards that node's `next` link and its unlinking. Locks are acquired in
/// list order and at most two are held at once, so traversals cannot
/// deadlock and a node can never be unlinked out from under a traversal
/// positioned on it. `row` and `age` are written once before the node is
/// published and are immutable afterwards, so they may be read while
/// holding the predecessor's lock only.
struct LinkList {
    head: UnsafeCell<HeadState>,
    sync: Spin,
}

impl std::fmt::Debug for LinkList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkList").finish_non_exhaustive()
    }
}

// Nodes are only ever dereferenced under the lock discipline above.
unsafe impl Send for LinkList {}
unsafe impl Sync for LinkList {}

impl LinkList {
    fn new() -> Self {
        Self {
            head: UnsafeCell::new(HeadState {
                next: ptr::null_mut(),
                age: 0,
            }),
            sync: Spin::new(),
        }
    }

    /// Read the link out of the currently held predecessor: the head when
    /// `prev` is null, otherwise the node `prev`.
    ///
    /// # Safety
    ///
    /// The caller must hold the head flag (when `prev` is null) or the
    /// node's flag.
    unsafe fn next_of(&self, prev: *mut Node) -> *mut Node {
        if prev.is_null() {
            unsafe { (*self.head.get()).next }
        } else {
            unsafe { (*prev).next }
        }
    }

    /// Release the currently held predecessor lock.
    fn release(&self, prev: *mut Node) {
        if prev.is_null() {
            self.sync.unlock();
        } else {
            unsafe { (*prev).sync.unlock() };
        }
    }

    /// Dominance-filtered insertion.
    ///
    /// One pass walks the list hand-over-hand, discarding the candidate if
    /// an existing row includes it and unlinking rows the candidate
    /// includes. The pass ends at the list tail or at the first node with
    /// `age < age_bound_min`: on a retry, everything from there on was
    /// already compared, since ages strictly decrease along the list and
    /// nodes never move. The prepend succeeds only if the head link is unchanged
    /// since the pass began; otherwise the bound advances and the walk
    /// restarts over the freshly inserted prefix.
    fn insert(&self, row: Row) {
        let mut age_bound_min = 0u64;
        loop {
            self.sync.lock();
            let (start, age_bound_max) = {
                // Safety: head flag held.
                let head = unsafe { &*self.head.get() };
                (head.next, head.age)
            };

            // `prev` is the locked predecessor; null means the head.
            let mut prev: *mut Node = ptr::null_mut();
            let mut discarded = false;
            loop {
                // Safety: `prev`'s flag is held.
                let current = unsafe { self.next_of(prev) };

                // `current` cannot be freed while we hold `prev`: unlinking
                // it would require `prev`'s flag. Its `age` is immutable.
                if current.is_null() || unsafe { (*current).age } < age_bound_min {
                    self.release(prev);
                    break;
                }

                unsafe { (*current).sync.lock() };

                if unsafe { (*current).row.includes(&row) } {
                    self.release(prev);
                    unsafe { (*current).sync.unlock() };
                    discarded = true;
                    break;
                } else if unsafe { row.includes(&(*current).row) } {
                    // Unlink while holding both flags, then free. `prev`
                    // stays locked and its new link is re-examined.
                    unsafe {
                        let after = (*current).next;
                        if prev.is_null() {
                            (*self.head.get()).next = after;
                        } else {
                            (*prev).next = after;
                        }
                        (*current).sync.unlock();
                        drop(Box::from_raw(current));
                    }
                } else {
                    self.release(prev);
                    prev = current;
                }
            }

            if discarded {
                return;
            }

            self.sync.lock();
            // Safety: head flag held.
            let head = unsafe { &mut *self.head.get() };
            // The age check backs up the pointer comparison: a freed node's
            // address can be recycled by a later insertion, but the head
            // generation only ever grows.
            if head.next == start && head.age == age_bound_max {
                head.age += 1;
                let node = Box::into_raw(Box::new(Node {
                    row,
                    age: head.age,
                    next: head.next,
                    sync: Spin::new(),
                }));
                head.next = node;
                self.sync.unlock();
                return;
            }

            // A concurrent insertion won the prepend. Everything at or past
            // `start` was already compared this pass; only the new prefix
            // needs examining next time around.
            age_bound_min = age_bound_max;
            self.sync.unlock();
            std::thread::yield_now();
        }
    }

    /// Clone the stored rows, head first. Takes the locks hand-over-hand so
    /// it is safe to call concurrently with insertions.
    fn snapshot(&self) -> Vec<Row> {
        let mut out = Vec::new();
        self.sync.lock();
        let mut prev: *mut Node = ptr::null_mut();
        loop {
            // Safety: `prev`'s flag is held.
            let current = unsafe { self.next_of(prev) };
            if current.is_null() {
                self.release(prev);
                break;
            }
            unsafe { (*current).sync.lock() };
            out.push(unsafe { (*current).row.clone() });
            self.release(prev);
            prev = current;
        }
        out
    }

    /// Take ownership of the rows, head first. Exclusive access via `self`
    /// by value, so no locks are needed.
    fn into_rows(mut self) -> Vec<Row> {
        let mut out = Vec::new();
        let head = self.head.get_mut();
        let mut current = head.next;
        head.next = ptr::null_mut();
        while !current.is_null() {
            let node = unsafe { Box::from_raw(current) };
            current = node.next;
            out.push(node.row);
        }
        out
    }
}

impl Drop for LinkList {
    fn drop(&mut self) {
        let mut current = self.head.get_mut().next;
        while !current.is_null() {
            let node = unsafe { Box::from_raw(current) };
            current = node.next;
        }
    }
}
