//! Random variates
//!
//! Every random number the kernel consumes goes through [`UniformDraw`]. Any
//! `rand` generator implements it; tests substitute [`SequenceDraw`] to pin
//! the exact values a handler or a lifting scheme sees.

use std::collections::VecDeque;

use rand::{Rng, RngCore};

/// Source of uniform variates in `[0, 1)`.
pub trait UniformDraw {
    fn next_unit(&mut self) -> f64;
}

impl<R: RngCore + ?Sized> UniformDraw for R {
    #[inline]
    fn next_unit(&mut self) -> f64 {
        self.gen::<f64>()
    }
}

/// Uniform variate in `[low, high)`.
#[inline]
pub fn uniform<D: UniformDraw + ?Sized>(draw: &mut D, low: f64, high: f64) -> f64 {
    low + (high - low) * draw.next_unit()
}

/// Exponentially distributed variate with rate `beta`.
#[inline]
pub fn expovariate<D: UniformDraw + ?Sized>(draw: &mut D, beta: f64) -> f64 {
    -(1.0 - draw.next_unit()).ln() / beta
}

/// Uniformly chosen index in `0..len`.
#[inline]
pub fn choose_index<D: UniformDraw + ?Sized>(draw: &mut D, len: usize) -> usize {
    ((draw.next_unit() * len as f64) as usize).min(len.saturating_sub(1))
}

/// Replays a fixed list of unit variates, then repeats the last one.
#[derive(Clone, Debug)]
pub struct SequenceDraw {
    values: VecDeque<f64>,
    last: f64,
}

impl SequenceDraw {
    pub fn new(values: impl IntoIterator<Item = f64>) -> Self {
        SequenceDraw {
            values: values.into_iter().collect(),
            last: 0.0,
        }
    }

    pub fn remaining(&self) -> usize {
        self.values.len()
    }
}

impl UniformDraw for SequenceDraw {
    fn next_unit(&mut self) -> f64 {
        if let Some(value) = self.values.pop_front() {
            self.last = value;
        }
        self.last
    }
}
