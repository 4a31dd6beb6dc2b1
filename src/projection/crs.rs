use gdal::spatial_ref::SpatialRef;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Common EPSG codes
pub mod epsg {
    pub const WGS84: u32 = 4326;
    pub const WEB_MERCATOR: u32 = 3857;
}

const WKT_ROOTS: [&str; 12] = [
    "PROJCS[",
    "GEOGCS[",
    "GEOCCS[",
    "COMPD_CS[",
    "LOCAL_CS[",
    "PROJCRS[",
    "GEOGCRS[",
    "GEODCRS[",
    "BOUNDCRS[",
    "COMPOUNDCRS[",
    "ENGCRS[",
    "VERTCRS[",
];

/// A resolved coordinate reference system definition.
///
/// Accepts authority codes (`EPSG:4326`, `OGC:CRS84`), PROJ strings
/// (`+proj=longlat +datum=WGS84`) and WKT. Every definition is resolved against
/// the projection database on construction, so a `Crs` always names a system
/// that exists. The definition is kept verbatim and handed to PROJ when a
/// transformation is built; equality compares the resolved WKT.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Crs {
    definition: String,
    wkt: String,
    epsg: Option<u32>,
    geographic: bool,
}

impl Crs {
    /// Resolves a user-supplied CRS description
    pub fn from_user_input(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(Error::Crs("empty CRS definition".to_string()));
        }

        let resolvable = if let Some(code) = authority_code(trimmed) {
            code
        } else if trimmed.starts_with('+') {
            normalize_proj_string(trimmed)?
        } else if is_wkt(trimmed) {
            trimmed.to_string()
        } else {
            return Err(Error::Crs(format!("unrecognized CRS definition: {}", trimmed)));
        };

        let srs = SpatialRef::from_definition(&resolvable)
            .map_err(|e| Error::Crs(format!("unresolvable CRS {}: {}", trimmed, e)))?;
        let wkt = srs
            .to_wkt()
            .map_err(|e| Error::Crs(format!("CRS {} has no WKT form: {}", trimmed, e)))?;
        let epsg = match (srs.auth_name(), srs.auth_code()) {
            (Ok(name), Ok(code)) if name.eq_ignore_ascii_case("EPSG") => u32::try_from(code).ok(),
            _ => None,
        };

        Ok(Self {
            definition: trimmed.to_string(),
            wkt,
            epsg,
            geographic: srs.is_geographic(),
        })
    }

    /// Resolves an EPSG code
    pub fn from_epsg(code: u32) -> Result<Self> {
        Self::from_user_input(&format!("EPSG:{}", code))
    }

    /// Returns the definition as supplied
    pub fn definition(&self) -> &str {
        &self.definition
    }

    /// Returns the resolved definition as WKT
    pub fn wkt(&self) -> &str {
        &self.wkt
    }

    /// Returns the EPSG code the resolved system is registered under
    pub fn epsg(&self) -> Option<u32> {
        self.epsg
    }

    /// Returns true for longitude/latitude systems
    pub fn is_geographic(&self) -> bool {
        self.geographic
    }

    /// Returns true if both definitions resolve to the same system
    pub fn is_equivalent(&self, other: &Crs) -> bool {
        self.wkt == other.wkt
    }
}

impl PartialEq for Crs {
    fn eq(&self, other: &Self) -> bool {
        self.is_equivalent(other)
    }
}

impl std::str::FromStr for Crs {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Crs::from_user_input(s)
    }
}

impl TryFrom<String> for Crs {
    type Error = Error;

    fn try_from(definition: String) -> Result<Self> {
        Crs::from_user_input(&definition)
    }
}

impl From<Crs> for String {
    fn from(crs: Crs) -> Self {
        crs.definition
    }
}

impl std::fmt::Display for Crs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.definition)
    }
}

fn authority_code(input: &str) -> Option<String> {
    let (authority, code) = input.split_once(':')?;
    let authority_ok = !authority.is_empty()
        && authority
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    let code_ok = !code.is_empty()
        && code
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');

    if authority_ok && code_ok {
        Some(format!("{}:{}", authority.to_uppercase(), code.to_uppercase()))
    } else {
        None
    }
}

fn normalize_proj_string(input: &str) -> Result<String> {
    let tokens: Vec<&str> = input.split_whitespace().collect();
    if !tokens.iter().all(|t| t.starts_with('+')) {
        return Err(Error::Crs(format!("malformed PROJ string: {}", input)));
    }
    if !tokens
        .iter()
        .any(|t| t.starts_with("+proj=") || t.starts_with("+init="))
    {
        return Err(Error::Crs(format!("PROJ string without +proj: {}", input)));
    }
    Ok(tokens.join(" "))
}

fn is_wkt(input: &str) -> bool {
    let upper = input.to_uppercase();
    if !WKT_ROOTS.iter().any(|root| upper.starts_with(root)) {
        return false;
    }

    let mut depth: i64 = 0;
    for c in input.chars() {
        match c {
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => {}
        }
    }
    depth == 0
}
