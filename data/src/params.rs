//! Non-grid scalar parameter arrays
//!
//! Stencil problems carry small coefficient tables alongside their grids
//! (material constants, per-layer weights, ...). They are read-only during
//! compute but participate in seeding and validation compare.

use crate::Real;
use ndarray::Array1;

/// Named 1-D coefficient array
pub struct Param {
    name: String,
    data: Array1<Real>,
}
//
impl Param {
    pub fn new(name: impl Into<String>, len: usize) -> Self {
        Self {
            name: name.into(),
            data: Array1::zeros(len),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn get(&self, i: usize) -> Real {
        self.data[i]
    }

    #[inline]
    pub fn set(&mut self, i: usize, val: Real) {
        self.data[i] = val;
    }

    pub fn fill(&mut self, val: Real) {
        self.data.fill(val);
    }

    pub fn num_bytes(&self) -> usize {
        self.data.len() * std::mem::size_of::<Real>()
    }

    /// Count elements that differ from `other` by more than `epsilon`
    pub fn compare(&self, other: &Param, epsilon: Real) -> usize {
        assert_eq!(self.len(), other.len(), "comparing params of different sizes");
        (self.data.iter())
            .zip(other.data.iter())
            .filter(|(a, b)| (**a - **b).abs() > epsilon)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_and_compare() {
        let mut a = Param::new("coef", 8);
        let mut b = Param::new("coef", 8);
        a.fill(0.25);
        b.fill(0.25);
        assert_eq!(a.compare(&b, crate::EPSILON), 0);
        b.set(3, 0.5);
        assert_eq!(a.compare(&b, crate::EPSILON), 1);
    }
}
