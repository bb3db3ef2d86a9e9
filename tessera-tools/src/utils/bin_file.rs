/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

//! Vector files: a little-endian `u32` point count and `u32` dimension, followed by the
//! points in row-major order.

use std::{
    fs::File,
    io::{BufWriter, Read, Write},
    path::Path,
};

use anyhow::{ensure, Context, Result};
use bytemuck::Pod;
use tessera_utils::{Matrix, MatrixView};

const HEADER_LEN: usize = 2 * std::mem::size_of::<u32>();

/// Read the point count and dimension from the header of `path`.
pub fn read_bin_header(path: &Path) -> Result<(usize, usize)> {
    let mut header = [0u8; HEADER_LEN];
    File::open(path)
        .and_then(|mut f| f.read_exact(&mut header))
        .with_context(|| format!("reading the header of {}", path.display()))?;
    Ok(parse_header(&header))
}

fn parse_header(header: &[u8; HEADER_LEN]) -> (usize, usize) {
    let npts = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let dim = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    (npts as usize, dim as usize)
}

/// Load a whole vector file as a matrix of `T`.
pub fn read_bin<T: Pod>(path: &Path) -> Result<Matrix<T>> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    ensure!(
        bytes.len() >= HEADER_LEN,
        "{} is too short to hold a vector file header",
        path.display()
    );
    let (header, body) = bytes.split_at(HEADER_LEN);
    let mut fixed = [0u8; HEADER_LEN];
    fixed.copy_from_slice(header);
    let (npts, dim) = parse_header(&fixed);

    let expected = npts * dim * std::mem::size_of::<T>();
    ensure!(
        body.len() == expected,
        "{} declares {npts} points of dimension {dim} ({expected} bytes) but holds {} bytes",
        path.display(),
        body.len()
    );
    let data: Vec<T> = bytemuck::pod_collect_to_vec(body);
    Ok(Matrix::try_from(data.into_boxed_slice(), npts, dim)?)
}

/// Write `data` as a vector file.
pub fn write_bin<T: Pod>(path: &Path, data: MatrixView<'_, T>) -> Result<()> {
    let npts = u32::try_from(data.nrows()).context("point count does not fit in u32")?;
    let dim = u32::try_from(data.ncols()).context("dimension does not fit in u32")?;

    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    writer.write_all(&npts.to_le_bytes())?;
    writer.write_all(&dim.to_le_bytes())?;
    writer.write_all(bytemuck::cast_slice(data.as_slice()))?;
    writer.flush()?;
    Ok(())
}
