//! Buffer-band bridge for rasterbridge
//!
//! Moves pixel data between ndarray buffers and engine bands, including
//! per-band validity masks.

pub mod bridge;
pub mod buffer;
pub mod traits;

pub use bridge::{clear_nodata, transfer_band, transfer_multi_band, transfer_multi_mask};
pub use buffer::{as_bands, as_bands_mut, fill_masked};
pub use traits::{DatasetSource, RasterRef};

pub use crate::engine::{BandBuffer, IoMode, MultiBandBuffer};
