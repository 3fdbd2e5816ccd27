//! Kernel functions and the row cache used by the SMO solver.
use std::collections::HashMap;
use std::rc::Rc;

use ndarray::*;
use serde_derive::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Kernel {
    /// `<a, b>`
    Linear,
    /// `exp(-gamma * |a - b|^2)`
    Rbf { gamma: f64 },
}

impl Kernel {
    pub fn evaluate(&self, a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
        debug_assert_eq!(a.len(), b.len());
        match *self {
            Kernel::Linear => a.dot(&b),
            Kernel::Rbf { gamma } => {
                let distance: f64 = a
                    .iter()
                    .zip(b.iter())
                    .map(|(x, y)| (x - y) * (x - y))
                    .sum();
                (-gamma * distance).exp()
            }
        }
    }
}

/// Rows of the kernel matrix of the examples `indices` of `data`, computed on demand without
/// copying the examples. Once `capacity` rows are cached the cache starts over.
pub(crate) struct KernelCache<'a> {
    data: ArrayView2<'a, f64>,
    indices: &'a [usize],
    kernel: Kernel,
    squared_norms: Array1<f64>,
    rows: HashMap<usize, Rc<Array1<f64>>>,
    capacity: usize,
}

impl<'a> KernelCache<'a> {
    pub(crate) fn new(
        data: ArrayView2<'a, f64>,
        indices: &'a [usize],
        kernel: Kernel,
        capacity: usize,
    ) -> Self {
        let squared_norms = indices
            .iter()
            .map(|&i| {
                let row = data.row(i);
                row.dot(&row)
            })
            .collect();
        KernelCache {
            data,
            indices,
            kernel,
            squared_norms,
            rows: HashMap::new(),
            capacity: capacity.max(2),
        }
    }

    /// `K(i, i)` for every example.
    pub(crate) fn diagonal(&self) -> Array1<f64> {
        match self.kernel {
            Kernel::Linear => self.squared_norms.clone(),
            Kernel::Rbf { .. } => Array1::ones(self.squared_norms.len()),
        }
    }

    /// Row `i` of the kernel matrix, `i` counts positions in `indices`.
    pub(crate) fn row(&mut self, i: usize) -> Rc<Array1<f64>> {
        if let Some(row) = self.rows.get(&i) {
            return Rc::clone(row);
        }
        let row = Rc::new(self.compute_row(i));
        if self.rows.len() >= self.capacity {
            self.rows.clear();
        }
        self.rows.insert(i, Rc::clone(&row));
        row
    }

    fn compute_row(&self, i: usize) -> Array1<f64> {
        let example = self.data.row(self.indices[i]);
        let dots: Array1<f64> = self
            .indices
            .iter()
            .map(|&j| self.data.row(j).dot(&example))
            .collect();
        match self.kernel {
            Kernel::Linear => dots,
            Kernel::Rbf { gamma } => {
                let norm = self.squared_norms[i];
                Zip::from(&dots)
                    .and(&self.squared_norms)
                    .map_collect(|&dot, &other| {
                        (-gamma * (norm + other - 2.0 * dot).max(0.0)).exp()
                    })
            }
        }
    }
}
