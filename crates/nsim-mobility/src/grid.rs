//! Grid layout of initial positions for a group of nodes.

use nsim_common::Vector;
use serde::{Deserialize, Serialize};

/// Fill order of a [`GridPositionAllocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GridLayout {
    /// Fill a row of `grid_width` positions, then move to the next row.
    #[default]
    RowFirst,
    /// Fill a column of `grid_width` positions, then move to the next column.
    ColumnFirst,
}

/// Hands out positions on a regular grid, one per call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GridPositionAllocator {
    /// X of the first position.
    #[serde(default)]
    pub min_x: f64,
    /// Y of the first position.
    #[serde(default)]
    pub min_y: f64,
    /// Spacing along x.
    pub delta_x: f64,
    /// Spacing along y.
    pub delta_y: f64,
    /// Positions per row (or column).
    pub grid_width: u32,
    /// Fill order.
    #[serde(default)]
    pub layout: GridLayout,
    #[serde(skip)]
    next: u32,
}

impl GridPositionAllocator {
    /// Create an allocator starting at its first position.
    pub fn new(min_x: f64, min_y: f64, delta_x: f64, delta_y: f64, grid_width: u32, layout: GridLayout) -> Self {
        GridPositionAllocator {
            min_x,
            min_y,
            delta_x,
            delta_y,
            grid_width,
            layout,
            next: 0,
        }
    }

    /// Position with the given index, independent of allocation state.
    pub fn position_at_index(&self, index: u32) -> Vector {
        let width = self.grid_width.max(1);
        let (major, minor) = (index / width, index % width);
        match self.layout {
            GridLayout::RowFirst => Vector::new(
                self.min_x + self.delta_x * minor as f64,
                self.min_y + self.delta_y * major as f64,
                0.0,
            ),
            GridLayout::ColumnFirst => Vector::new(
                self.min_x + self.delta_x * major as f64,
                self.min_y + self.delta_y * minor as f64,
                0.0,
            ),
        }
    }
}

impl Iterator for GridPositionAllocator {
    type Item = Vector;

    fn next(&mut self) -> Option<Vector> {
        let p = self.position_at_index(self.next);
        self.next += 1;
        Some(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_first() {
        let grid = GridPositionAllocator::new(0.0, 0.0, 5.0, 10.0, 3, GridLayout::RowFirst);
        let points: Vec<Vector> = grid.take(4).collect();
        assert_eq!(points[0], Vector::new(0.0, 0.0, 0.0));
        assert_eq!(points[1], Vector::new(5.0, 0.0, 0.0));
        assert_eq!(points[2], Vector::new(10.0, 0.0, 0.0));
        assert_eq!(points[3], Vector::new(0.0, 10.0, 0.0));
    }

    #[test]
    fn test_column_first() {
        let grid = GridPositionAllocator::new(1.0, 2.0, 5.0, 10.0, 2, GridLayout::ColumnFirst);
        assert_eq!(grid.position_at_index(1), Vector::new(1.0, 12.0, 0.0));
        assert_eq!(grid.position_at_index(2), Vector::new(6.0, 2.0, 0.0));
    }

    #[test]
    fn test_allocation_follows_index_order() {
        let mut grid = GridPositionAllocator::new(0.0, 0.0, 5.0, 10.0, 3, GridLayout::RowFirst);
        let indexed: Vec<Vector> = (0..5).map(|i| grid.position_at_index(i)).collect();
        let allocated: Vec<Vector> = (&mut grid).take(5).collect();
        assert_eq!(allocated, indexed);
        assert_eq!(grid.next(), Some(Vector::new(10.0, 10.0, 0.0)));
    }
}
