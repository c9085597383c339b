//! Work-distribution plans over the upper triangle of class pairs.
//!
//! Both plans are built once from the class sizes produced by the
//! partitioner and are read-only afterwards (the queue hands out tasks but
//! its task list is fixed at construction). [`BisectionPlan`] drives the
//! barrier-synchronized driver; [`PairQueue`] drives the self-service
//! worker pool.

use crossbeam::channel::{self, Receiver};

/// One bisection task: process every class pair in `first` x `second`.
#[derive(Debug, Clone)]
pub struct Task {
    pub first: Vec<u32>,
    pub second: Vec<u32>,
}

impl Task {
    pub fn is_empty(&self) -> bool {
        self.first.is_empty() || self.second.is_empty()
    }
}

/// Balanced recursive bisection of the class list.
///
/// Each split partitions a class subset into two halves of roughly equal
/// total row count and emits one cross task (all pairs between the halves).
/// Splits at the same depth form one barrier step, so a pair of classes is
/// processed in exactly one task at exactly one step. Because the class
/// list arrives sorted by descending size, the first step pairs the heavy
/// classes against a balanced partition of everything else.
pub struct BisectionPlan {
    steps: Vec<Vec<Task>>,
    max_threads: usize,
}

impl BisectionPlan {
    pub fn new(counts: &[usize]) -> Self {
        let mut steps = Vec::new();
        let mut max_threads = 0;

        let mut level: Vec<Vec<u32>> = if counts.len() >= 2 {
            vec![(0..counts.len() as u32).collect()]
        } else {
            Vec::new()
        };

        while !level.is_empty() {
            let mut tasks = Vec::with_capacity(level.len());
            let mut next = Vec::new();
            for subset in level {
                let (first, second) = split_balanced(&subset, counts);
                if first.len() >= 2 {
                    next.push(first.clone());
                }
                if second.len() >= 2 {
                    next.push(second.clone());
                }
                tasks.push(Task { first, second });
            }
            max_threads = max_threads.max(tasks.len());
            steps.push(tasks);
            level = next;
        }

        Self { steps, max_threads }
    }

    /// Number of barrier steps.
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Worker pool size: the widest step's task count.
    pub fn max_threads(&self) -> usize {
        self.max_threads
    }

    /// How many workers have a task in the given step.
    pub fn threads_for_step(&self, step: usize) -> usize {
        self.steps[step].len()
    }

    pub fn task(&self, step: usize, thread: usize) -> &Task {
        &self.steps[step][thread]
    }
}

/// Greedily deal a subset into two halves balanced by total row count.
///
/// Each class goes to the lighter side, subject to capacity caps of
/// ceil(n/2) and floor(n/2) so the recursion halves the subset. Iterating
/// in the subset's descending-size order keeps both halves descending.
fn split_balanced(subset: &[u32], counts: &[usize]) -> (Vec<u32>, Vec<u32>) {
    let first_cap = subset.len().div_ceil(2);
    let second_cap = subset.len() - first_cap;

    let mut first = Vec::with_capacity(first_cap);
    let mut second = Vec::with_capacity(second_cap);
    let mut first_sum = 0usize;
    let mut second_sum = 0usize;

    for &class in subset {
        let prefer_first = first_sum <= second_sum || second.len() == second_cap;
        if (prefer_first && first.len() < first_cap) || second.len() == second_cap {
            first.push(class);
            first_sum += counts[class as usize];
        } else {
            second.push(class);
            second_sum += counts[class as usize];
        }
    }

    (first, second)
}

/// Self-service queue of single class pairs, heaviest product first.
///
/// All `C * (C - 1) / 2` pairs are enqueued at construction; workers call
/// [`pop`](PairQueue::pop) until it returns `None`. Ordering by descending
/// `count[i] * count[j]` puts the longest blocks first, which trims the
/// tail when the last workers drain the queue.
pub struct PairQueue {
    tasks: Receiver<(u32, u32)>,
    len: usize,
}

impl PairQueue {
    pub fn new(counts: &[usize]) -> Self {
        let c = counts.len();
        let mut pairs = Vec::new();
        for i in 0..c as u32 {
            for j in i + 1..c as u32 {
                pairs.push((i, j));
            }
        }
        // Stable sort: equal products keep lexicographic pair order.
        pairs.sort_by_key(|&(i, j)| std::cmp::Reverse(counts[i as usize] * counts[j as usize]));

        let (tx, rx) = channel::unbounded();
        for &pair in &pairs {
            tx.send(pair).expect("queue receiver alive");
        }
        Self {
            tasks: rx,
            len: pairs.len(),
        }
    }

    /// Total number of tasks enqueued at construction.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Next class pair, or `None` once the queue is drained.
    pub fn pop(&self) -> Option<(u32, u32)> {
        self.tasks.try_recv().ok()
    }
}
