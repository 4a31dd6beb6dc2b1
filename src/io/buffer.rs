//! Buffer shape utilities
//!
//! Every buffer side of a reprojection is handled as band-major 3-D; a 2-D
//! buffer is a single band.

use ndarray::{Array3, ArrayView3, ArrayViewD, ArrayViewMut3, ArrayViewMutD, Axis, Ix3};

use crate::error::{Error, Result};
use crate::types::Pixel;

/// Views a 2-D or 3-D buffer as (bands, rows, cols)
pub fn as_bands<'a, T>(data: ArrayViewD<'a, T>) -> Result<ArrayView3<'a, T>> {
    let data = match data.ndim() {
        2 => data.insert_axis(Axis(0)),
        3 => data,
        n => return Err(unsupported_ndim(n)),
    };
    data.into_dimensionality::<Ix3>()
        .map_err(|e| Error::InvalidInput(e.to_string()))
}

/// Mutable counterpart of [`as_bands`]
pub fn as_bands_mut<'a, T>(data: ArrayViewMutD<'a, T>) -> Result<ArrayViewMut3<'a, T>> {
    let data = match data.ndim() {
        2 => data.insert_axis(Axis(0)),
        3 => data,
        n => return Err(unsupported_ndim(n)),
    };
    data.into_dimensionality::<Ix3>()
        .map_err(|e| Error::InvalidInput(e.to_string()))
}

/// Replaces masked cells (`true` = invalid) with `fill`.
///
/// A 2-D mask applies to every band.
pub fn fill_masked<T: Pixel>(
    data: ArrayView3<'_, T>,
    mask: ArrayViewD<'_, bool>,
    fill: T,
) -> Result<Array3<T>> {
    let mask = as_bands(mask)?;
    let (bands, rows, cols) = data.dim();
    let mask = mask
        .broadcast((bands, rows, cols))
        .ok_or_else(|| {
            Error::InvalidInput(format!(
                "mask of shape {:?} does not match data of shape {:?}",
                mask.shape(),
                data.shape()
            ))
        })?;

    let mut filled = data.to_owned();
    filled.zip_mut_with(&mask, |value, masked| {
        if *masked {
            *value = fill;
        }
    });
    Ok(filled)
}

fn unsupported_ndim(ndim: usize) -> Error {
    Error::InvalidInput(format!(
        "expected a 2-D or 3-D buffer, got {} dimensions",
        ndim
    ))
}
