use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A point handed to PROJ; z is 0 for planar input
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Coordinate {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y, z: 0.0 }
    }

    pub fn new_3d(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Reads a GeoJSON position, `[x, y]` or `[x, y, z, ...]`
    pub fn from_position(position: &[f64]) -> Result<Self> {
        match position {
            [x, y] => Ok(Self::new(*x, *y)),
            [x, y, z, ..] => Ok(Self::new_3d(*x, *y, *z)),
            _ => Err(Error::InvalidInput(format!(
                "position needs at least two components, got {}",
                position.len()
            ))),
        }
    }

    /// Writes x and y back over `position`, leaving further components alone
    pub fn write_xy(&self, position: &mut [f64]) {
        if let [x, y, ..] = position {
            *x = self.x;
            *y = self.y;
        }
    }
}

pub(crate) fn round_to(value: f64, digits: u32) -> f64 {
    let factor = 10f64.powi(digits as i32);
    (value * factor).round() / factor
}
