//! The class-pair sweep: block processing, weight arithmetic, and the two
//! parallel drivers.
//!
//! A block is the Cartesian product of the rows of two classes. For every
//! row pair the block processor forms the difference row and the per-column
//! weight contribution and hands both to the shared accumulator. The
//! drivers differ only in how blocks are dealt out: the bisection driver
//! runs a fixed pool through barrier-synchronized steps of a precomputed
//! plan, the queue driver lets workers serve themselves single class pairs
//! until the queue is dry.
//!
//! The final row set and weight vector are order-independent, so every
//! driver / store / fold-mode combination converges to the same result.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::{debug, info};

use crate::accumulator::{AccumulateError, Accumulator, StoreKind};
use crate::dataset::Dataset;
use crate::plan::{BisectionPlan, PairQueue, Task};
use crate::row::{DASH, Row};

#[derive(Debug, Error)]
pub enum SweepError {
    #[error("weight arithmetic overflowed at column {column}: operands {lhs} and {rhs}")]
    WeightOverflow { column: usize, lhs: i64, rhs: i64 },
    #[error(transparent)]
    Accumulate(#[from] AccumulateError),
}

/// Which work-distribution plan drives the sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlannerKind {
    /// Balanced recursive bisection, barrier-synchronized steps.
    Bisection,
    /// Self-service queue of class pairs, heaviest first.
    #[default]
    Queue,
}

/// Configuration for a sweep.
#[derive(Debug, Clone, Default)]
pub struct SweepConfig {
    pub planner: PlannerKind,
    /// Worker count for the queue planner. Defaults to the host's available
    /// parallelism. The bisection planner sizes its pool from the plan.
    pub threads: Option<usize>,
    /// Give each task a private accumulator and fold it into the shared one
    /// at the task boundary, instead of mutating the shared one directly.
    pub private_accumulators: bool,
    pub store: StoreKind,
}

impl SweepConfig {
    pub fn with_planner(mut self, planner: PlannerKind) -> Self {
        self.planner = planner;
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    pub fn with_private_accumulators(mut self, private: bool) -> Self {
        self.private_accumulators = private;
        self
    }

    pub fn with_store(mut self, store: StoreKind) -> Self {
        self.store = store;
        self
    }
}

/// Run the full class-pair sweep over a partitioned dataset.
pub fn sweep(set: &Dataset, config: &SweepConfig) -> Result<Accumulator, SweepError> {
    let accumulator = Accumulator::with_store(set.feature_width(), config.store);
    match config.planner {
        PlannerKind::Bisection => sweep_bisection(set, &accumulator, config)?,
        PlannerKind::Queue => sweep_queue(set, &accumulator, config)?,
    }
    Ok(accumulator)
}

// ============================================================================
// Weight arithmetic
// ============================================================================

fn checked_mul(lhs: i64, rhs: i64, column: usize) -> Result<i64, SweepError> {
    lhs.checked_mul(rhs)
        .ok_or(SweepError::WeightOverflow { column, lhs, rhs })
}

fn checked_add(lhs: i64, rhs: i64, column: usize) -> Result<i64, SweepError> {
    lhs.checked_add(rhs)
        .ok_or(SweepError::WeightOverflow { column, lhs, rhs })
}

/// The concrete values a cell ranges over: the column's declared range for
/// a DASH cell, the cell's own value otherwise.
fn cell_limits(set: &Dataset, value: i32, k: usize) -> (i64, i64) {
    if value == DASH {
        (set.min(k) as i64, set.max(k) as i64)
    } else {
        (value as i64, value as i64)
    }
}

/// Per-column weight contribution of one row pair, written into `out`.
///
/// For each column the weight is the L1 distance summed over every concrete
/// instantiation of the two rows, where each instantiation counts once per
/// combination of values the *other* DASH columns can take. The
/// multipliers and sums stay in checked i64; an overflow surfaces the
/// offending column and operands instead of wrapping.
pub fn weight_vector(
    set: &Dataset,
    row1: usize,
    row2: usize,
    out: &mut [i64],
) -> Result<(), SweepError> {
    let q = set.feature_width();
    debug_assert_eq!(out.len(), q);
    let a = set.feature_row(row1);
    let b = set.feature_row(row2);

    let mut multiplier1: i64 = 1;
    let mut multiplier2: i64 = 1;
    for k in 0..q {
        out[k] = 0;
        if a[k] == DASH {
            multiplier1 = checked_mul(multiplier1, set.values_count(k), k)?;
        }
        if b[k] == DASH {
            multiplier2 = checked_mul(multiplier2, set.values_count(k), k)?;
        }
    }

    for k in 0..q {
        let mut scale = checked_mul(multiplier1, multiplier2, k)?;
        if a[k] == DASH {
            scale /= set.values_count(k);
        }
        if b[k] == DASH {
            scale /= set.values_count(k);
        }

        let (lo1, hi1) = cell_limits(set, a[k], k);
        let (lo2, hi2) = cell_limits(set, b[k], k);
        let mut sum: i64 = 0;
        for i in lo1..=hi1 {
            for j in lo2..=hi2 {
                sum = checked_add(sum, checked_mul((i - j).abs(), scale, k)?, k)?;
            }
        }
        out[k] = sum;
    }

    Ok(())
}

// ============================================================================
// Block processing
// ============================================================================

/// Process one class-pair block: every row of `class1` against every row of
/// `class2`. `scratch` is a reusable width-Q buffer owned by the worker.
fn process_block(
    set: &Dataset,
    accumulator: &Accumulator,
    class1: u32,
    class2: u32,
    scratch: &mut [i64],
) -> Result<(), SweepError> {
    let offset1 = set.offsets()[class1 as usize];
    let length1 = set.counts()[class1 as usize];
    let offset2 = set.offsets()[class2 as usize];
    let length2 = set.counts()[class2 as usize];

    for i in offset1..offset1 + length1 {
        for j in offset2..offset2 + length2 {
            let diff = Row::difference(set.feature_row(i), set.feature_row(j));
            weight_vector(set, i, j, scratch)?;
            accumulator.add_row(diff, scratch)?;
        }
    }
    Ok(())
}

/// Shared failure slot: the first error wins and flips the abort flag, which
/// every worker checks at its next task boundary.
struct Failure {
    abort: AtomicBool,
    first: Mutex<Option<SweepError>>,
}

impl Failure {
    fn new() -> Self {
        Self {
            abort: AtomicBool::new(false),
            first: Mutex::new(None),
        }
    }

    fn aborted(&self) -> bool {
        self.abort.load(Ordering::Relaxed)
    }

    fn record(&self, error: SweepError) {
        let mut slot = self.first.lock();
        if slot.is_none() {
            *slot = Some(error);
        }
        self.abort.store(true, Ordering::Relaxed);
    }

    fn into_result(self) -> Result<(), SweepError> {
        match self.first.into_inner() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

// ============================================================================
// Queue driver
// ============================================================================

fn sweep_queue(
    set: &Dataset,
    accumulator: &Accumulator,
    config: &SweepConfig,
) -> Result<(), SweepError> {
    let queue = PairQueue::new(set.counts());
    let threads = config.threads.unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    });
    info!(
        "queue sweep: {} class pairs over {} workers",
        queue.len(),
        threads
    );

    let failure = Failure::new();
    std::thread::scope(|scope| {
        for worker in 0..threads {
            let queue = &queue;
            let failure = &failure;
            std::thread::Builder::new()
                .name(format!("sweep-{worker}"))
                .spawn_scoped(scope, move || {
                    let mut scratch = vec![0i64; set.feature_width()];
                    while let Some((class1, class2)) = queue.pop() {
                        if failure.aborted() {
                            break;
                        }
                        debug!("worker {worker} processing classes {class1}:{class2}");

                        let result = if config.private_accumulators {
                            let private =
                                Accumulator::with_store(set.feature_width(), config.store);
                            process_block(set, &private, class1, class2, &mut scratch).and_then(
                                |()| accumulator.add_matrix(private).map_err(SweepError::from),
                            )
                        } else {
                            process_block(set, accumulator, class1, class2, &mut scratch)
                        };

                        if let Err(error) = result {
                            failure.record(error);
                            break;
                        }
                    }
                    debug!("worker {worker} stopped");
                })
                .expect("failed to spawn sweep worker");
        }
    });

    failure.into_result()
}

// ============================================================================
// Bisection driver
// ============================================================================

/// Centralized barrier shared by the driver and the worker pool. The driver
/// advances `unblocked_step` and waits for `remaining` to reach zero;
/// workers wait for their step to unblock and decrement on completion.
struct StepGate {
    state: Mutex<GateState>,
    workers: Condvar,
    driver: Condvar,
}

struct GateState {
    unblocked_step: isize,
    remaining: usize,
}

fn sweep_bisection(
    set: &Dataset,
    accumulator: &Accumulator,
    config: &SweepConfig,
) -> Result<(), SweepError> {
    let plan = BisectionPlan::new(set.counts());
    if plan.step_count() == 0 {
        return Ok(());
    }
    let pool = plan.max_threads();
    info!(
        "bisection sweep: {} steps, up to {} workers per step",
        plan.step_count(),
        pool
    );

    let gate = StepGate {
        state: Mutex::new(GateState {
            unblocked_step: -1,
            remaining: 0,
        }),
        workers: Condvar::new(),
        driver: Condvar::new(),
    };
    let failure = Failure::new();

    std::thread::scope(|scope| {
        for thread_id in 0..pool {
            let plan = &plan;
            let gate = &gate;
            let failure = &failure;
            std::thread::Builder::new()
                .name(format!("sweep-{thread_id}"))
                .spawn_scoped(scope, move || {
                    let mut scratch = vec![0i64; set.feature_width()];
                    for step in 0..plan.step_count() {
                        {
                            let mut state = gate.state.lock();
                            gate.workers
                                .wait_while(&mut state, |s| s.unblocked_step < step as isize);
                        }

                        if thread_id < plan.threads_for_step(step) && !failure.aborted() {
                            let task = plan.task(step, thread_id);
                            if !task.is_empty() {
                                debug!(
                                    "worker {thread_id} step {step}: {}x{} classes",
                                    task.first.len(),
                                    task.second.len()
                                );
                                if let Err(error) =
                                    run_task(set, accumulator, config, task, failure, &mut scratch)
                                {
                                    failure.record(error);
                                }
                            }
                        }

                        let mut state = gate.state.lock();
                        state.remaining -= 1;
                        if state.remaining == 0 {
                            gate.driver.notify_one();
                        }
                    }
                })
                .expect("failed to spawn sweep worker");
        }

        // Step the barrier from the calling thread.
        for step in 0..plan.step_count() {
            {
                let mut state = gate.state.lock();
                state.remaining = pool;
                state.unblocked_step = step as isize;
            }
            gate.workers.notify_all();

            let mut state = gate.state.lock();
            gate.driver.wait_while(&mut state, |s| s.remaining > 0);
        }
    });

    failure.into_result()
}

/// Run one bisection task: the Cartesian product of its class-id sets.
/// The abort flag is consulted between blocks, the task's suspension points.
fn run_task(
    set: &Dataset,
    accumulator: &Accumulator,
    config: &SweepConfig,
    task: &Task,
    failure: &Failure,
    scratch: &mut [i64],
) -> Result<(), SweepError> {
    if config.private_accumulators {
        let private = Accumulator::with_store(set.feature_width(), config.store);
        for &class1 in &task.first {
            for &class2 in &task.second {
                if failure.aborted() {
                    return Ok(());
                }
                process_block(set, &private, class1, class2, scratch)?;
            }
        }
        accumulator.add_matrix(private)?;
    } else {
        for &class1 in &task.first {
            for &class2 in &task.second {
                if failure.aborted() {
                    return Ok(());
                }
                process_block(set, accumulator, class1, class2, scratch)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;
    use rand::rngs::SmallRng;

    fn sorted_cells(rows: Vec<Row>) -> Vec<Vec<i32>> {
        let mut cells: Vec<Vec<i32>> = rows.into_iter().map(|r| r.cells().to_vec()).collect();
        cells.sort();
        cells
    }

    /// Synthetic dataset with the given class sizes: label = class index,
    /// features drawn from [0, 2] with occasional DASH cells.
    fn synthetic(class_sizes: &[usize], width: usize, seed: u64) -> Dataset {
        let mut rng = SmallRng::seed_from_u64(seed);
        let n: usize = class_sizes.iter().sum();
        let mut features = Vec::with_capacity(n * width);
        let mut labels = Vec::with_capacity(n);
        for (class, &size) in class_sizes.iter().enumerate() {
            for _ in 0..size {
                labels.push(class as i32);
                for _ in 0..width {
                    if rng.random_range(0..4) == 0 {
                        features.push(DASH);
                    } else {
                        features.push(rng.random_range(0..3));
                    }
                }
            }
        }
        Dataset::new(n, features, labels, vec![0; width], vec![2; width]).unwrap()
    }

    #[test]
    fn test_single_class_produces_nothing() {
        let set = Dataset::new(
            3,
            vec![1, 1, 2, 2, 1, 2],
            vec![0, 0, 0],
            vec![1, 1],
            vec![2, 2],
        )
        .unwrap();
        for planner in [PlannerKind::Bisection, PlannerKind::Queue] {
            let config = SweepConfig::default().with_planner(planner);
            let acc = sweep(&set, &config).unwrap();
            assert!(acc.rows().is_empty());
            assert_eq!(acc.column_weights(), vec![0, 0]);
        }
    }

    #[test]
    fn test_two_singleton_classes() {
        let set = Dataset::new(
            2,
            vec![1, 2, 2, 1],
            vec![0, 1],
            vec![1, 1],
            vec![2, 2],
        )
        .unwrap();
        for planner in [PlannerKind::Bisection, PlannerKind::Queue] {
            let config = SweepConfig::default().with_planner(planner);
            let acc = sweep(&set, &config).unwrap();
            let expected = Row::difference(&[1, 2], &[2, 1]);
            assert_eq!(sorted_cells(acc.rows()), vec![expected.cells().to_vec()]);
            assert_eq!(acc.column_weights(), vec![1, 1]);
        }
    }

    #[test]
    fn test_dash_weighting_over_a_declared_range() {
        // Width 1, range [0, 2]: DASH against 1 sums |0-1| + |1-1| + |2-1|.
        let set = Dataset::new(2, vec![DASH, 1], vec![0, 1], vec![0], vec![2]).unwrap();
        let mut out = vec![0i64];
        weight_vector(&set, 0, 1, &mut out).unwrap();
        assert_eq!(out, vec![2]);
    }

    #[test]
    fn test_shared_dash_columns_scale_the_weight() {
        // Both rows DASH in column 0 (range size 2) and disagreeing in
        // column 1. Column 1's weight picks up the 2 x 2 instantiations of
        // column 0; column 0's own weight drops both divisors.
        let set = Dataset::new(
            2,
            vec![DASH, 0, DASH, 1],
            vec![0, 1],
            vec![0, 0],
            vec![1, 1],
        )
        .unwrap();
        let mut out = vec![0i64; 2];
        weight_vector(&set, 0, 1, &mut out).unwrap();
        // Column 0: scale 1, sum over [0,1]x[0,1] of |i-j| = 2.
        // Column 1: scale 4, |0-1| = 1.
        assert_eq!(out, vec![2, 4]);
    }

    #[test]
    fn test_weight_overflow_reports_the_column() {
        // A huge declared range makes the multiplier product overflow.
        let set = Dataset::new(
            2,
            vec![DASH, DASH, DASH, DASH],
            vec![0, 1],
            vec![i32::MIN + 1, i32::MIN + 1],
            vec![i32::MAX, i32::MAX],
        )
        .unwrap();
        let mut out = vec![0i64; 2];
        let err = weight_vector(&set, 0, 1, &mut out).unwrap_err();
        assert!(matches!(err, SweepError::WeightOverflow { .. }));
    }

    #[test]
    fn test_overflow_during_sweep_aborts_with_the_error() {
        let set = Dataset::new(
            2,
            vec![DASH, DASH, DASH, DASH],
            vec![0, 1],
            vec![i32::MIN + 1, i32::MIN + 1],
            vec![i32::MAX, i32::MAX],
        )
        .unwrap();
        for planner in [PlannerKind::Bisection, PlannerKind::Queue] {
            let config = SweepConfig::default().with_planner(planner);
            let err = sweep(&set, &config).unwrap_err();
            assert!(matches!(err, SweepError::WeightOverflow { .. }));
        }
    }

    /// Every planner / store / fold-mode combination must agree with the
    /// single-threaded baseline, rows and weights both.
    #[test]
    fn test_all_execution_modes_agree() {
        let set = synthetic(&[5, 4, 3, 2], 3, 11);

        let baseline = sweep(
            &set,
            &SweepConfig::default()
                .with_planner(PlannerKind::Queue)
                .with_store(StoreKind::Locked)
                .with_threads(1),
        )
        .unwrap();
        let (base_weights, base_rows) = baseline.into_parts();
        let base_rows = sorted_cells(base_rows);
        assert!(!base_rows.is_empty());

        for planner in [PlannerKind::Bisection, PlannerKind::Queue] {
            for store in [StoreKind::Locked, StoreKind::Lockfree] {
                for private in [false, true] {
                    let config = SweepConfig::default()
                        .with_planner(planner)
                        .with_store(store)
                        .with_private_accumulators(private);
                    let acc = sweep(&set, &config).unwrap();
                    assert_eq!(
                        acc.column_weights(),
                        base_weights,
                        "{planner:?}/{store:?}/private={private}"
                    );
                    assert_eq!(
                        sorted_cells(acc.rows()),
                        base_rows,
                        "{planner:?}/{store:?}/private={private}"
                    );
                }
            }
        }
    }

    /// Many classes hammered by a fixed-size pool converge to the
    /// sequential result on the lock-free store.
    #[test]
    fn test_many_class_concurrency_matches_sequential() {
        let set = synthetic(&[64; 16], 3, 77);

        let sequential = sweep(
            &set,
            &SweepConfig::default()
                .with_planner(PlannerKind::Queue)
                .with_store(StoreKind::Locked)
                .with_threads(1),
        )
        .unwrap();

        let parallel = sweep(
            &set,
            &SweepConfig::default()
                .with_planner(PlannerKind::Queue)
                .with_store(StoreKind::Lockfree)
                .with_threads(8),
        )
        .unwrap();

        assert_eq!(parallel.column_weights(), sequential.column_weights());
        assert_eq!(
            sorted_cells(parallel.rows()),
            sorted_cells(sequential.rows())
        );
    }
}
