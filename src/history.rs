//! Fixed-capacity row history
//!
//! [`HistoryBuffer`] stores fixed-width numeric rows in insertion order.
//! Once full, every push evicts the oldest row.

use crate::error::{LiveError, Result};
use std::collections::VecDeque;

/// Default number of rows kept by a history getter
pub const DEFAULT_HISTORY_CAPACITY: usize = 10_000;

/// Ring buffer of rows
#[derive(Debug, Clone)]
pub struct HistoryBuffer {
    rows: VecDeque<Vec<f64>>,
    capacity: usize,
    width: usize,
}

impl HistoryBuffer {
    /// Create an empty buffer
    ///
    /// Both `capacity` and `width` must be at least 1.
    pub fn new(capacity: usize, width: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(LiveError::Configuration(
                "history capacity must be at least 1".to_string(),
            ));
        }
        if width == 0 {
            return Err(LiveError::Configuration(
                "history rows need at least one column".to_string(),
            ));
        }
        Ok(Self {
            rows: VecDeque::with_capacity(capacity.min(DEFAULT_HISTORY_CAPACITY)),
            capacity,
            width,
        })
    }

    /// Append a row, evicting the oldest one when full
    pub fn push(&mut self, row: Vec<f64>) -> Result<()> {
        if row.len() != self.width {
            return Err(LiveError::Configuration(format!(
                "row has {} columns, history expects {}",
                row.len(),
                self.width
            )));
        }
        if self.rows.len() >= self.capacity {
            self.rows.pop_front();
        }
        self.rows.push_back(row);
        Ok(())
    }

    /// The last `size` rows, oldest first, or all rows for `None`
    pub fn get_values(&self, size: Option<usize>) -> Vec<Vec<f64>> {
        let skip = match size {
            Some(size) => self.rows.len().saturating_sub(size),
            None => 0,
        };
        self.rows.iter().skip(skip).cloned().collect()
    }

    /// Most recent row
    pub fn last(&self) -> Option<&[f64]> {
        self.rows.back().map(Vec::as_slice)
    }

    /// Iterate rows oldest first
    pub fn iter(&self) -> impl Iterator<Item = &[f64]> {
        self.rows.iter().map(Vec::as_slice)
    }

    pub fn clear(&mut self) {
        self.rows.clear();
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// One column as a vector, oldest first
    pub fn column(&self, column: usize) -> Option<Vec<f64>> {
        if column >= self.width {
            return None;
        }
        Some(self.rows.iter().map(|row| row[column]).collect())
    }

    /// `[x, y]` pairs taken from two columns
    pub fn as_plot_points(&self, x_column: usize, y_column: usize) -> Vec<[f64; 2]> {
        if x_column >= self.width || y_column >= self.width {
            return Vec::new();
        }
        self.rows
            .iter()
            .map(|row| [row[x_column], row[y_column]])
            .collect()
    }

    /// First and last value of a column (the time span for column 0)
    pub fn span(&self, column: usize) -> Option<(f64, f64)> {
        if column >= self.width {
            return None;
        }
        let first = self.rows.front()?[column];
        let last = self.rows.back()?[column];
        Some((first, last))
    }

    /// Minimum and maximum of a column
    pub fn value_range(&self, column: usize) -> Option<(f64, f64)> {
        if column >= self.width || self.rows.is_empty() {
            return None;
        }
        let mut min = f64::MAX;
        let mut max = f64::MIN;
        for row in &self.rows {
            min = min.min(row[column]);
            max = max.max(row[column]);
        }
        Some((min, max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_rejects_zero_sizes() {
        assert!(HistoryBuffer::new(0, 1).is_err());
        assert!(HistoryBuffer::new(1, 0).is_err());
    }

    #[test]
    fn test_ring_keeps_last_rows() {
        let mut buf = HistoryBuffer::new(3, 1).unwrap();
        for i in 0..5 {
            buf.push(vec![i as f64]).unwrap();
        }
        assert_eq!(buf.get_values(None), vec![vec![2.0], vec![3.0], vec![4.0]]);
        assert_eq!(buf.get_values(Some(2)), vec![vec![3.0], vec![4.0]]);
        assert_eq!(buf.get_values(Some(10)).len(), 3);
        assert_eq!(buf.last(), Some(&[4.0][..]));
    }

    #[test]
    fn test_width_is_enforced() {
        let mut buf = HistoryBuffer::new(3, 2).unwrap();
        assert!(buf.push(vec![1.0]).is_err());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_columns_and_ranges() {
        let mut buf = HistoryBuffer::new(10, 2).unwrap();
        buf.push(vec![0.0, 5.0]).unwrap();
        buf.push(vec![0.5, -1.0]).unwrap();
        buf.push(vec![1.0, 2.0]).unwrap();

        assert_eq!(buf.column(1), Some(vec![5.0, -1.0, 2.0]));
        assert_eq!(buf.column(2), None);
        assert_eq!(buf.span(0), Some((0.0, 1.0)));
        assert_eq!(buf.value_range(1), Some((-1.0, 5.0)));
        assert_eq!(buf.as_plot_points(0, 1)[1], [0.5, -1.0]);

        buf.clear();
        assert_eq!(buf.span(0), None);
    }

    proptest! {
        #[test]
        fn prop_ring_never_exceeds_capacity(capacity in 1usize..50, pushes in 0usize..200) {
            let mut buf = HistoryBuffer::new(capacity, 1).unwrap();
            for i in 0..pushes {
                buf.push(vec![i as f64]).unwrap();
            }
            prop_assert_eq!(buf.len(), pushes.min(capacity));

            let expected: Vec<Vec<f64>> = (pushes.saturating_sub(capacity)..pushes)
                .map(|i| vec![i as f64])
                .collect();
            prop_assert_eq!(buf.get_values(None), expected);
        }
    }
}
