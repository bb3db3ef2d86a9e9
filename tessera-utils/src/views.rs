/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

//! Dense row-major matrices and borrowed views over them.
//!
//! Every kernel in this workspace passes its operands as one of three types:
//!
//! * [`Matrix<T>`]: an owned, boxed matrix.
//! * [`MatrixView<'_, T>`]: a shared view, which is `Copy`.
//! * [`MutMatrixView<'_, T>`]: an exclusive view.
//!
//! All three are aliases of [`MatrixBase`], parameterized over the storage.

use std::{
    fmt,
    ops::{Index, IndexMut, Range},
};

#[cfg(feature = "rayon")]
use rayon::prelude::{IndexedParallelIterator, ParallelSlice, ParallelSliceMut};
use thiserror::Error;

/// Storage that can be viewed as a dense slice.
///
/// Implementations must return the same slice (same base and length) on every call.
pub trait DenseData {
    type Elem;

    fn as_slice(&self) -> &[Self::Elem];
}

/// Storage that can additionally be viewed as a mutable dense slice spanning the same
/// memory as [`DenseData::as_slice`].
pub trait MutDenseData: DenseData {
    fn as_mut_slice(&mut self) -> &mut [Self::Elem];
}

impl<T> DenseData for &[T] {
    type Elem = T;
    fn as_slice(&self) -> &[T] {
        self
    }
}

impl<T> DenseData for &mut [T] {
    type Elem = T;
    fn as_slice(&self) -> &[T] {
        self
    }
}

impl<T> MutDenseData for &mut [T] {
    fn as_mut_slice(&mut self) -> &mut [T] {
        self
    }
}

impl<T> DenseData for Box<[T]> {
    type Elem = T;
    fn as_slice(&self) -> &[T] {
        self
    }
}

impl<T> MutDenseData for Box<[T]> {
    fn as_mut_slice(&mut self) -> &mut [T] {
        self
    }
}

////////////
// Matrix //
////////////

/// A two dimensional row-major interpretation of dense storage.
#[derive(Clone, Copy, PartialEq)]
pub struct MatrixBase<S>
where
    S: DenseData,
{
    data: S,
    nrows: usize,
    ncols: usize,
}

/// An owned matrix.
pub type Matrix<T> = MatrixBase<Box<[T]>>;

/// A shared view of a matrix.
pub type MatrixView<'a, T> = MatrixBase<&'a [T]>;

/// An exclusive view of a matrix.
pub type MutMatrixView<'a, T> = MatrixBase<&'a mut [T]>;

/// Error returned when the storage length does not match the requested shape.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[non_exhaustive]
#[error("cannot view {len} elements as a matrix with {nrows} rows and {ncols} columns")]
pub struct ShapeMismatch {
    pub len: usize,
    pub nrows: usize,
    pub ncols: usize,
}

/// A source of initial values for [`Matrix::new`].
pub trait Generator<T> {
    fn generate(&mut self) -> T;
}

impl<T: Clone> Generator<T> for T {
    fn generate(&mut self) -> T {
        self.clone()
    }
}

/// Initialize each element by invoking the wrapped closure, in memory order.
pub struct Init<F>(pub F);

impl<T, F> Generator<T> for Init<F>
where
    F: FnMut() -> T,
{
    fn generate(&mut self) -> T {
        (self.0)()
    }
}

impl<T> Matrix<T> {
    /// Construct an `nrows x ncols` matrix with each element drawn from `generator`.
    pub fn new<G>(mut generator: G, nrows: usize, ncols: usize) -> Self
    where
        G: Generator<T>,
    {
        let data: Box<[T]> = (0..nrows * ncols).map(|_| generator.generate()).collect();
        Self { data, nrows, ncols }
    }

    /// Construct a matrix where element `(r, c)` is `f(r, c)`.
    pub fn from_fn<F>(nrows: usize, ncols: usize, mut f: F) -> Self
    where
        F: FnMut(usize, usize) -> T,
    {
        let data: Box<[T]> = (0..nrows)
            .flat_map(|r| (0..ncols).map(move |c| (r, c)))
            .map(|(r, c)| f(r, c))
            .collect();
        Self { data, nrows, ncols }
    }
}

impl<S> MatrixBase<S>
where
    S: DenseData,
{
    /// View `data` as an `nrows x ncols` matrix.
    ///
    /// Fails if `data` does not contain exactly `nrows * ncols` elements.
    pub fn try_from(data: S, nrows: usize, ncols: usize) -> Result<Self, ShapeMismatch> {
        let len = data.as_slice().len();
        if len != nrows * ncols {
            return Err(ShapeMismatch { len, nrows, ncols });
        }
        Ok(Self { data, nrows, ncols })
    }

    /// View `data` as a matrix with a single row.
    pub fn row_vector(data: S) -> Self {
        let ncols = data.as_slice().len();
        Self {
            data,
            nrows: 1,
            ncols,
        }
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn ncols(&self) -> usize {
        self.ncols
    }

    /// Return `(nrows, ncols)`.
    pub fn shape(&self) -> (usize, usize) {
        (self.nrows, self.ncols)
    }

    pub fn as_slice(&self) -> &[S::Elem] {
        self.data.as_slice()
    }

    pub fn as_mut_slice(&mut self) -> &mut [S::Elem]
    where
        S: MutDenseData,
    {
        self.data.as_mut_slice()
    }

    /// Return row `row`.
    ///
    /// # Panics
    ///
    /// Panics if `row >= self.nrows()`.
    pub fn row(&self, row: usize) -> &[S::Elem] {
        assert!(
            row < self.nrows,
            "tried to access row {row} of a matrix with {} rows",
            self.nrows
        );
        let start = row * self.ncols;
        &self.as_slice()[start..start + self.ncols]
    }

    /// Return row `row`, or `None` if it is out of bounds.
    pub fn get_row(&self, row: usize) -> Option<&[S::Elem]> {
        (row < self.nrows).then(|| self.row(row))
    }

    /// Return row `row` mutably.
    ///
    /// # Panics
    ///
    /// Panics if `row >= self.nrows()`.
    pub fn row_mut(&mut self, row: usize) -> &mut [S::Elem]
    where
        S: MutDenseData,
    {
        assert!(
            row < self.nrows,
            "tried to access row {row} of a matrix with {} rows",
            self.nrows
        );
        let ncols = self.ncols;
        let start = row * ncols;
        &mut self.as_mut_slice()[start..start + ncols]
    }

    /// Iterate over the rows in order.
    pub fn row_iter(&self) -> impl ExactSizeIterator<Item = &[S::Elem]> {
        // `chunks_exact(0)` panics, so route empty-column matrices through a zero-row
        // iterator of the right length instead.
        let ncols = self.ncols.max(1);
        let rows = if self.ncols == 0 { 0 } else { self.nrows };
        self.as_slice()[..rows * self.ncols].chunks_exact(ncols)
    }

    /// Iterate mutably over the rows in order.
    pub fn row_iter_mut(&mut self) -> impl ExactSizeIterator<Item = &mut [S::Elem]>
    where
        S: MutDenseData,
    {
        let ncols = self.ncols.max(1);
        let rows = if self.ncols == 0 { 0 } else { self.nrows };
        let len = rows * self.ncols;
        self.as_mut_slice()[..len].chunks_exact_mut(ncols)
    }

    /// Return a shared view of the whole matrix.
    pub fn as_view(&self) -> MatrixView<'_, S::Elem> {
        MatrixBase {
            data: self.as_slice(),
            nrows: self.nrows,
            ncols: self.ncols,
        }
    }

    /// Return an exclusive view of the whole matrix.
    pub fn as_mut_view(&mut self) -> MutMatrixView<'_, S::Elem>
    where
        S: MutDenseData,
    {
        let (nrows, ncols) = (self.nrows, self.ncols);
        MatrixBase {
            data: self.as_mut_slice(),
            nrows,
            ncols,
        }
    }

    /// Return a view of the contiguous rows in `rows`.
    ///
    /// # Panics
    ///
    /// Panics if `rows` is not contained in `0..self.nrows()`.
    pub fn subrows(&self, rows: Range<usize>) -> MatrixView<'_, S::Elem> {
        assert!(
            rows.start <= rows.end && rows.end <= self.nrows,
            "row range {rows:?} is out of bounds for a matrix with {} rows",
            self.nrows
        );
        let ncols = self.ncols;
        MatrixBase {
            data: &self.as_slice()[rows.start * ncols..rows.end * ncols],
            nrows: rows.len(),
            ncols,
        }
    }

    /// Return an exclusive view of the contiguous rows in `rows`.
    ///
    /// # Panics
    ///
    /// Panics if `rows` is not contained in `0..self.nrows()`.
    pub fn subrows_mut(&mut self, rows: Range<usize>) -> MutMatrixView<'_, S::Elem>
    where
        S: MutDenseData,
    {
        assert!(
            rows.start <= rows.end && rows.end <= self.nrows,
            "row range {rows:?} is out of bounds for a matrix with {} rows",
            self.nrows
        );
        let ncols = self.ncols;
        MatrixBase {
            data: &mut self.as_mut_slice()[rows.start * ncols..rows.end * ncols],
            nrows: rows.len(),
            ncols,
        }
    }

    /// Reinterpret the leading `nrows * ncols` elements of the storage with a new shape.
    ///
    /// This is how reusable scratch buffers are resized for shorter tiles without
    /// reallocating.
    ///
    /// # Panics
    ///
    /// Panics if the storage holds fewer than `nrows * ncols` elements.
    pub fn reshape_prefix_mut(&mut self, nrows: usize, ncols: usize) -> MutMatrixView<'_, S::Elem>
    where
        S: MutDenseData,
    {
        let len = nrows * ncols;
        let available = self.as_slice().len();
        assert!(
            len <= available,
            "cannot reshape {available} elements into {nrows} x {ncols}"
        );
        MatrixBase {
            data: &mut self.as_mut_slice()[..len],
            nrows,
            ncols,
        }
    }

    /// Produce a new owned matrix by applying `f` to each element.
    pub fn map<U, F>(&self, f: F) -> Matrix<U>
    where
        F: FnMut(&S::Elem) -> U,
    {
        MatrixBase {
            data: self.as_slice().iter().map(f).collect(),
            nrows: self.nrows,
            ncols: self.ncols,
        }
    }

    /// Copy the contents into a new owned matrix.
    pub fn to_owned(&self) -> Matrix<S::Elem>
    where
        S::Elem: Clone,
    {
        self.map(Clone::clone)
    }

    /// Return the underlying storage, dropping the shape.
    pub fn into_inner(self) -> S {
        self.data
    }

    /// Parallel iterator over rows.
    #[cfg(feature = "rayon")]
    pub fn par_row_iter(&self) -> impl IndexedParallelIterator<Item = &[S::Elem]>
    where
        S::Elem: Sync,
    {
        self.as_slice().par_chunks_exact(self.ncols.max(1))
    }

    /// Parallel iterator over mutable rows.
    #[cfg(feature = "rayon")]
    pub fn par_row_iter_mut(&mut self) -> impl IndexedParallelIterator<Item = &mut [S::Elem]>
    where
        S: MutDenseData,
        S::Elem: Send,
    {
        let ncols = self.ncols.max(1);
        self.as_mut_slice().par_chunks_exact_mut(ncols)
    }
}

impl<'a, T> MatrixView<'a, T> {
    /// Return row `row` with the lifetime of the underlying borrow rather than the view.
    pub fn into_row(self, row: usize) -> &'a [T] {
        assert!(
            row < self.nrows,
            "tried to access row {row} of a matrix with {} rows",
            self.nrows
        );
        let start = row * self.ncols;
        &self.data[start..start + self.ncols]
    }
}

impl<S> Index<(usize, usize)> for MatrixBase<S>
where
    S: DenseData,
{
    type Output = S::Elem;

    fn index(&self, (row, col): (usize, usize)) -> &S::Elem {
        assert!(
            col < self.ncols,
            "column {col} is out of bounds for a matrix with {} columns",
            self.ncols
        );
        &self.row(row)[col]
    }
}

impl<S> IndexMut<(usize, usize)> for MatrixBase<S>
where
    S: MutDenseData,
{
    fn index_mut(&mut self, (row, col): (usize, usize)) -> &mut S::Elem {
        assert!(
            col < self.ncols,
            "column {col} is out of bounds for a matrix with {} columns",
            self.ncols
        );
        &mut self.row_mut(row)[col]
    }
}

// Manual so that large matrices print their shape rather than every element.
impl<S> fmt::Debug for MatrixBase<S>
where
    S: DenseData,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MatrixBase")
            .field("nrows", &self.nrows)
            .field("ncols", &self.ncols)
            .finish()
    }
}

///////////
// Tests //
///////////
