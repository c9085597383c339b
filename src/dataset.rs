//! Learning-set storage and equivalence partitioning.
//!
//! Rows are grouped into classes by identical label vector and the storage
//! is reordered so that every class occupies a contiguous row span, largest
//! class first. The planners pair the largest classes first because the cost
//! of a class pair is the product of its sizes, so the descending order
//! front-loads the expensive work.

use std::collections::HashMap;

use thiserror::Error;
use tracing::debug;

use crate::row::Row;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("empty learning set")]
    Empty,
    #[error("feature matrix has {got} cells, expected {rows} rows x {cols} columns")]
    FeatureShape { got: usize, rows: usize, cols: usize },
    #[error("label matrix has {got} cells, which is not a multiple of {rows} rows")]
    LabelShape { got: usize, rows: usize },
    #[error("range arrays have {min_len} minimum and {max_len} maximum entries, expected {cols}")]
    RangeShape {
        min_len: usize,
        max_len: usize,
        cols: usize,
    },
    #[error("column {column}: minimum {min} exceeds maximum {max}")]
    EmptyRange { column: usize, min: i32, max: i32 },
}

/// A partitioned learning set.
///
/// Construction validates the declared shape, then reorders the rows so
/// classes are contiguous and exposes the class index as parallel
/// [`offsets`](Dataset::offsets) and [`counts`](Dataset::counts) arrays.
pub struct Dataset {
    n: usize,
    q: usize,
    r: usize,
    /// Row-major `n x q` feature matrix, reordered by class.
    features: Vec<i32>,
    /// Row-major `n x r` label matrix, reordered in lockstep.
    labels: Vec<i32>,
    min: Vec<i32>,
    max: Vec<i32>,
    /// Class id of each (reordered) row, renumbered `0..class_count`.
    class_of: Vec<u32>,
    offsets: Vec<usize>,
    counts: Vec<usize>,
}

impl Dataset {
    /// Build a dataset from row-major feature and label matrices plus the
    /// per-feature-column inclusive value ranges, and partition it.
    ///
    /// The feature width is `min.len()`; the label width is derived from
    /// `labels.len() / n`.
    pub fn new(
        n: usize,
        features: Vec<i32>,
        labels: Vec<i32>,
        min: Vec<i32>,
        max: Vec<i32>,
    ) -> Result<Self, DatasetError> {
        if n == 0 {
            return Err(DatasetError::Empty);
        }
        let q = min.len();
        if max.len() != q {
            return Err(DatasetError::RangeShape {
                min_len: min.len(),
                max_len: max.len(),
                cols: q,
            });
        }
        if features.len() != n * q {
            return Err(DatasetError::FeatureShape {
                got: features.len(),
                rows: n,
                cols: q,
            });
        }
        if labels.is_empty() || labels.len() % n != 0 {
            return Err(DatasetError::LabelShape {
                got: labels.len(),
                rows: n,
            });
        }
        for (column, (&lo, &hi)) in min.iter().zip(&max).enumerate() {
            if lo > hi {
                return Err(DatasetError::EmptyRange {
                    column,
                    min: lo,
                    max: hi,
                });
            }
        }
        let r = labels.len() / n;

        let mut dataset = Self {
            n,
            q,
            r,
            features,
            labels,
            min,
            max,
            class_of: Vec::new(),
            offsets: Vec::new(),
            counts: Vec::new(),
        };
        dataset.partition();
        Ok(dataset)
    }

    /// Group rows by label vector, sort classes by descending size (stable,
    /// so ties keep first-appearance order), and scatter the rows into the
    /// new contiguous layout.
    fn partition(&mut self) {
        let (n, q, r) = (self.n, self.q, self.r);

        // First-seen class ids, keyed by the full label row.
        let mut ids: HashMap<Row, usize> = HashMap::new();
        let mut class_of = vec![0usize; n];
        for (i, slot) in class_of.iter_mut().enumerate() {
            let key = Row::from_cells(self.labels[i * r..(i + 1) * r].to_vec());
            let next = ids.len();
            *slot = *ids.entry(key).or_insert(next);
        }
        let class_count = ids.len();

        let mut sizes = vec![0usize; class_count];
        for &id in &class_of {
            sizes[id] += 1;
        }

        let mut order: Vec<usize> = (0..class_count).collect();
        order.sort_by_key(|&id| std::cmp::Reverse(sizes[id]));

        // Destination cursor and new id per original class id.
        let mut dest = vec![0usize; class_count];
        let mut renumber = vec![0u32; class_count];
        let mut offsets = Vec::with_capacity(class_count);
        let mut counts = Vec::with_capacity(class_count);
        let mut cursor = 0usize;
        for (new_id, &old_id) in order.iter().enumerate() {
            dest[old_id] = cursor;
            renumber[old_id] = new_id as u32;
            offsets.push(cursor);
            counts.push(sizes[old_id]);
            cursor += sizes[old_id];
        }

        let mut new_features = vec![0i32; n * q];
        let mut new_labels = vec![0i32; n * r];
        let mut new_class = vec![0u32; n];
        for (i, &id) in class_of.iter().enumerate() {
            let to = dest[id];
            dest[id] += 1;
            new_features[to * q..(to + 1) * q].copy_from_slice(&self.features[i * q..(i + 1) * q]);
            new_labels[to * r..(to + 1) * r].copy_from_slice(&self.labels[i * r..(i + 1) * r]);
            new_class[to] = renumber[id];
        }

        self.features = new_features;
        self.labels = new_labels;
        self.class_of = new_class;
        self.offsets = offsets;
        self.counts = counts;

        debug!(
            "partitioned learning set: {} rows into {} classes, largest {}",
            n,
            class_count,
            self.counts.first().copied().unwrap_or(0)
        );
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    /// Feature width `Q`.
    pub fn feature_width(&self) -> usize {
        self.q
    }

    /// Label width `R`.
    pub fn label_width(&self) -> usize {
        self.r
    }

    pub fn class_count(&self) -> usize {
        self.counts.len()
    }

    /// Starting row index of each class, parallel to [`counts`](Self::counts).
    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    /// Row count of each class, non-increasing.
    pub fn counts(&self) -> &[usize] {
        &self.counts
    }

    /// Class id of a (reordered) row.
    pub fn class_of(&self, i: usize) -> u32 {
        self.class_of[i]
    }

    pub fn feature_row(&self, i: usize) -> &[i32] {
        &self.features[i * self.q..(i + 1) * self.q]
    }

    pub fn label_row(&self, i: usize) -> &[i32] {
        &self.labels[i * self.r..(i + 1) * self.r]
    }

    pub fn min(&self, k: usize) -> i32 {
        self.min[k]
    }

    pub fn max(&self, k: usize) -> i32 {
        self.max[k]
    }

    /// Cardinality of the declared value range of feature column `k`.
    pub fn values_count(&self, k: usize) -> i64 {
        self.max[k] as i64 - self.min[k] as i64 + 1
    }
}
