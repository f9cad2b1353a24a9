use proj4rs::proj::Proj;
use proj4rs::transform::transform;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Proj strings for the EPSG codes survey data is usually delivered in.
fn epsg_proj_string(code: u32) -> Option<&'static str> {
    let s = match code {
        4326 => "+proj=longlat +datum=WGS84 +no_defs",
        4258 => "+proj=longlat +ellps=GRS80 +towgs84=0,0,0,0,0,0,0 +no_defs",
        3857 => {
            "+proj=merc +a=6378137 +b=6378137 +lat_ts=0 +lon_0=0 +x_0=0 +y_0=0 +k=1 +units=m +no_defs"
        }
        // British National Grid
        27700 => {
            "+proj=tmerc +lat_0=49 +lon_0=-2 +k=0.9996012717 +x_0=400000 +y_0=-100000 +ellps=airy +towgs84=446.448,-125.157,542.06,0.15,0.247,0.842,-20.489 +units=m +no_defs"
        }
        // Irish Grid
        29903 => {
            "+proj=tmerc +lat_0=53.5 +lon_0=-8 +k=1.000035 +x_0=200000 +y_0=250000 +ellps=mod_airy +towgs84=482.5,-130.6,564.6,-1.042,-0.214,-0.631,8.15 +units=m +no_defs"
        }
        // Irish Transverse Mercator
        2157 => {
            "+proj=tmerc +lat_0=53.5 +lon_0=-8 +k=0.99982 +x_0=600000 +y_0=750000 +ellps=GRS80 +towgs84=0,0,0,0,0,0,0 +units=m +no_defs"
        }
        32629 => "+proj=utm +zone=29 +datum=WGS84 +units=m +no_defs",
        32630 => "+proj=utm +zone=30 +datum=WGS84 +units=m +no_defs",
        32631 => "+proj=utm +zone=31 +datum=WGS84 +units=m +no_defs",
        _ => return None,
    };
    Some(s)
}

/// A coordinate reference system, given as `epsg:<code>` or a raw proj string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Crs {
    name: String,
    proj: String,
}

impl Crs {
    pub fn epsg(code: u32) -> Result<Self> {
        let proj = epsg_proj_string(code)
            .ok_or_else(|| Error::Crs(format!("EPSG:{code} is not in the built-in table; pass a proj string instead")))?;
        Ok(Self {
            name: format!("EPSG:{code}"),
            proj: proj.to_string(),
        })
    }

    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.starts_with('+') {
            return Ok(Self {
                name: s.to_string(),
                proj: s.to_string(),
            });
        }
        let code = s
            .strip_prefix("epsg:")
            .or_else(|| s.strip_prefix("EPSG:"))
            .unwrap_or(s);
        let code: u32 = code
            .parse()
            .map_err(|_| Error::Crs(format!("cannot interpret {s:?} as a CRS")))?;
        Self::epsg(code)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn proj_string(&self) -> &str {
        &self.proj
    }

    /// Geographic CRSs take and return degrees.
    pub fn is_geographic(&self) -> bool {
        self.proj.contains("+proj=longlat") || self.proj.contains("+proj=latlong")
    }
}

impl FromStr for Crs {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Crs::parse(s)
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Reprojects (x, y) pairs between two CRSs with proj4rs.
pub struct CoordTransformer {
    source: Proj,
    target: Proj,
    source_is_geographic: bool,
    target_is_geographic: bool,
}

impl CoordTransformer {
    pub fn new(source: &Crs, target: &Crs) -> Result<Self> {
        let source_proj = Proj::from_proj_string(source.proj_string())
            .map_err(|e| Error::Crs(format!("invalid source projection {source}: {e:?}")))?;
        let target_proj = Proj::from_proj_string(target.proj_string())
            .map_err(|e| Error::Crs(format!("invalid target projection {target}: {e:?}")))?;
        Ok(Self {
            source: source_proj,
            target: target_proj,
            source_is_geographic: source.is_geographic(),
            target_is_geographic: target.is_geographic(),
        })
    }

    /// Output order is always (x, y), i.e. (lon, lat) for geographic targets.
    pub fn transform(&self, x: f64, y: f64) -> Result<(f64, f64)> {
        let mut point = if self.source_is_geographic {
            (x.to_radians(), y.to_radians(), 0.0)
        } else {
            (x, y, 0.0)
        };

        transform(&self.source, &self.target, &mut point)
            .map_err(|e| Error::Crs(format!("cannot reproject ({x}, {y}): {e:?}")))?;

        let out = if self.target_is_geographic {
            (point.0.to_degrees(), point.1.to_degrees())
        } else {
            (point.0, point.1)
        };
        if !out.0.is_finite() || !out.1.is_finite() {
            return Err(Error::Crs(format!("({x}, {y}) has no image in the target CRS")));
        }
        Ok(out)
    }
}
