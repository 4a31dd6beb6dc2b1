//! Nodata policy of a reprojection.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::DataType;

/// Destination nodata used when neither side provides one
pub const DEFAULT_DST_NODATA: f64 = 0.0;

/// Requested nodata values; `None` means inherit or default
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NodataPolicy {
    pub src: Option<f64>,
    pub dst: Option<f64>,
}

/// Effective nodata values after inheritance and validation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedNodata {
    pub src: Option<f64>,
    pub dst: f64,
}

impl NodataPolicy {
    pub fn new(src: Option<f64>, dst: Option<f64>) -> Self {
        Self { src, dst }
    }

    /// Resolves effective values.
    ///
    /// `inherited_src` is the fill value of a masked source buffer or the
    /// stored nodata of a source dataset. A requested destination value needs
    /// a resolvable source value. Both values must fit their side's type.
    pub fn resolve(
        &self,
        inherited_src: Option<f64>,
        src_dtype: DataType,
        dst_dtype: DataType,
    ) -> Result<ResolvedNodata> {
        let src = self.src.or(inherited_src);
        if self.dst.is_some() && src.is_none() {
            return Err(Error::Configuration(
                "dst_nodata must be accompanied by a source nodata value".to_string(),
            ));
        }
        let dst = self.dst.or(src).unwrap_or(DEFAULT_DST_NODATA);

        if let Some(value) = src {
            if !src_dtype.contains(value) {
                return Err(Error::Range(format!(
                    "src_nodata {} is out of range for {}",
                    value, src_dtype
                )));
            }
        }
        if !dst_dtype.contains(dst) {
            return Err(Error::Range(format!(
                "dst_nodata {} is out of range for {}",
                dst, dst_dtype
            )));
        }

        debug!(?src, dst, "resolved nodata");
        Ok(ResolvedNodata { src, dst })
    }
}
