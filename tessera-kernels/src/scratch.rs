/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

//! Per-worker scratch buffers, allocated once from a [`TilePlan`] and reused for every
//! tile the worker processes.

use tessera_utils::{Matrix, MatrixView};

use crate::plan::TilePlan;

/// Two staging buffers. One is read by the compute stage while the other is filled by
/// the load stage of the next tile.
#[derive(Debug)]
pub(crate) struct DoubleBuffer<T> {
    buffers: [Matrix<T>; 2],
    front: usize,
}

impl<T: Copy + Default> DoubleBuffer<T> {
    pub(crate) fn new(rows: usize, cols: usize) -> Self {
        Self {
            buffers: [
                Matrix::new(T::default(), rows, cols),
                Matrix::new(T::default(), rows, cols),
            ],
            front: 0,
        }
    }

    /// The buffer holding the tile being computed.
    pub(crate) fn front_mut(&mut self) -> &mut Matrix<T> {
        &mut self.buffers[self.front]
    }

    /// Borrow the front buffer for reading and the back buffer for loading at once.
    pub(crate) fn split(&mut self) -> (&Matrix<T>, &mut Matrix<T>) {
        let [a, b] = &mut self.buffers;
        if self.front == 0 {
            (a, b)
        } else {
            (b, a)
        }
    }

    /// Promote the back buffer to the front.
    pub(crate) fn swap(&mut self) {
        self.front ^= 1;
    }
}

/// All scratch memory used by one worker.
#[derive(Debug)]
pub(crate) struct Scratch<T> {
    pub(crate) staging: DoubleBuffer<T>,
    accumulator: Matrix<f32>,
}

impl<T: Copy + Default> Scratch<T> {
    pub(crate) fn new(plan: &TilePlan, dim: usize) -> Self {
        Self {
            staging: DoubleBuffer::new(plan.code_tile, dim),
            accumulator: Matrix::new(0.0, plan.query_tile, plan.code_tile),
        }
    }

    /// Split into the front staged tile (trimmed to `codes` rows), the back staging
    /// buffer, and the accumulator.
    pub(crate) fn stages(
        &mut self,
        codes: usize,
    ) -> (MatrixView<'_, T>, &mut Matrix<T>, &mut Matrix<f32>) {
        let (front, back) = self.staging.split();
        (front.subrows(0..codes), back, &mut self.accumulator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_buffer_alternates() {
        let mut buf = DoubleBuffer::<u8>::new(2, 2);
        buf.front_mut().as_mut_slice().fill(1);
        {
            let (front, back) = buf.split();
            assert_eq!(front.as_slice(), &[1; 4]);
            back.as_mut_slice().fill(2);
        }
        buf.swap();
        {
            let (front, back) = buf.split();
            assert_eq!(front.as_slice(), &[2; 4]);
            assert_eq!(back.as_slice(), &[1; 4]);
        }
        buf.swap();
        assert_eq!(buf.front_mut().as_slice(), &[1; 4]);
    }

    #[test]
    fn stages_are_trimmed() {
        let plan = TilePlan {
            query_tile: 4,
            code_tile: 32,
            align: 16,
        };
        let mut scratch = Scratch::<f32>::new(&plan, 16);
        let (front, back, acc) = scratch.stages(20);
        assert_eq!(front.shape(), (20, 16));
        assert_eq!(back.shape(), (32, 16));
        assert_eq!(acc.reshape_prefix_mut(3, 20).shape(), (3, 20));
    }
}
