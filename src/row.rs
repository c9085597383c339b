//! Row value type: a fixed-width integer vector with a "don't care" sentinel.
//!
//! Rows play two roles. Label rows key the equivalence partitioning (hashed
//! and compared wholesale), and difference rows are the unit stored in the
//! accumulator, where the inclusion relation [`Row::includes`] drives the
//! dominance filter.

use std::fmt;

/// Sentinel for "any value" at a cell position.
///
/// The data file layer renders it as `-`. `i32::MIN` never occurs as a
/// concrete feature value (ranges are declared per column), so equality
/// tests against real cells are always false.
pub const DASH: i32 = i32::MIN;

/// A fixed-width row of integer cells.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Row {
    cells: Vec<i32>,
}

impl Row {
    pub fn from_cells(cells: Vec<i32>) -> Self {
        Self { cells }
    }

    /// Position-wise difference of two equal-width rows.
    ///
    /// The result holds [`DASH`] wherever the inputs agree. Where they
    /// disagree it holds the absolute difference, computed in i64 and
    /// saturated to `i32::MAX` because a [`DASH`] operand would overflow
    /// i32. Callers must not read anything into the magnitude: the contract
    /// is DASH versus not-DASH, and a disagreement is never zero.
    pub fn difference(a: &[i32], b: &[i32]) -> Self {
        debug_assert_eq!(a.len(), b.len());
        let cells = a
            .iter()
            .zip(b)
            .map(|(&x, &y)| {
                if x == y {
                    DASH
                } else {
                    (x as i64 - y as i64).unsigned_abs().min(i32::MAX as u64) as i32
                }
            })
            .collect();
        Self { cells }
    }

    /// True iff `self` generalizes `other`: every cell of `self` is either
    /// [`DASH`] or equal to the corresponding cell of `other`.
    ///
    /// Reflexive and transitive. Mutual inclusion implies equality.
    pub fn includes(&self, other: &Row) -> bool {
        debug_assert_eq!(self.width(), other.width());
        self.cells
            .iter()
            .zip(&other.cells)
            .all(|(&a, &b)| a == DASH || a == b)
    }

    pub fn value(&self, k: usize) -> i32 {
        self.cells[k]
    }

    pub fn width(&self) -> usize {
        self.cells.len()
    }

    pub fn cells(&self) -> &[i32] {
        &self.cells
    }
}

impl fmt::Display for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (k, &cell) in self.cells.iter().enumerate() {
            if k > 0 {
                write!(f, " ")?;
            }
            if cell == DASH {
                write!(f, "-")?;
            } else {
                write!(f, "{cell}")?;
            }
        }
        Ok(())
    }
}
