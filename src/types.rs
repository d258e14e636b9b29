use crate::error::ClistError;

pub type ColorIndex = u64;

pub use bandlist_format::NO_COLOR;

/// Pixel size of the page being recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageGeometry {
    pub width: u32,
    pub height: u32,
}

impl PageGeometry {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Page geometry split into bands of a fixed height.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandLayout {
    pub geometry: PageGeometry,
    pub band_height: u32,
    pub nbands: u32,
}

impl BandLayout {
    pub fn new(geometry: PageGeometry, band_height: u32) -> Result<Self, ClistError> {
        if geometry.width == 0 || geometry.height == 0 {
            return Err(ClistError::InvalidConfiguration(format!(
                "page must be non-empty, got {}x{}",
                geometry.width, geometry.height
            )));
        }
        if band_height == 0 {
            return Err(ClistError::InvalidConfiguration(
                "band height must be positive".to_string(),
            ));
        }
        let nbands = geometry.height.div_ceil(band_height);
        if nbands > i32::MAX as u32 {
            return Err(ClistError::InvalidConfiguration(format!(
                "{nbands} bands exceed the directory range"
            )));
        }
        Ok(Self {
            geometry,
            band_height,
            nbands,
        })
    }

    pub fn full_range(&self) -> BandRange {
        BandRange {
            min: 0,
            max: self.nbands - 1,
        }
    }

    pub fn check_band(&self, band: u32) -> Result<(), ClistError> {
        if band < self.nbands {
            Ok(())
        } else {
            Err(ClistError::BandOutOfRange {
                band,
                nbands: self.nbands,
            })
        }
    }

    pub fn check_range(&self, range: BandRange) -> Result<(), ClistError> {
        if range.min > range.max {
            return Err(ClistError::InvalidRange {
                min: range.min,
                max: range.max,
            });
        }
        self.check_band(range.max)
    }

    /// Rows `[top, bottom)` covered by `band`, clipped to the page.
    pub fn band_rows(&self, band: u32) -> (u32, u32) {
        let top = band.saturating_mul(self.band_height);
        let bottom = top.saturating_add(self.band_height).min(self.geometry.height);
        (top, bottom)
    }

    pub fn band_of_row(&self, row: u32) -> u32 {
        (row / self.band_height).min(self.nbands - 1)
    }
}

/// Inclusive span of bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BandRange {
    pub min: u32,
    pub max: u32,
}

impl BandRange {
    pub fn new(min: u32, max: u32) -> Self {
        Self { min, max }
    }

    pub fn bands(&self) -> std::ops::RangeInclusive<u32> {
        self.min..=self.max
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    Band(u32),
    Range(BandRange),
}

impl Target {
    pub fn bands(&self) -> std::ops::RangeInclusive<u32> {
        match self {
            Target::Band(band) => *band..=*band,
            Target::Range(range) => range.bands(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TilePhase {
    pub x: i32,
    pub y: i32,
}

impl TilePhase {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Raster operation code. The low six bits travel in a byte of their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LogicalOp(pub u32);

impl LogicalOp {
    pub const DEFAULT: LogicalOp = LogicalOp(bandlist_format::DEFAULT_LOP);

    pub fn is_default(self) -> bool {
        self == Self::DEFAULT
    }
}

impl Default for LogicalOp {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Axis-aligned pixel rectangle in page coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Intersection with the page, or `None` when nothing is left.
    pub fn clip_to(&self, geometry: PageGeometry) -> Option<Rect> {
        let x0 = (self.x as i64).max(0);
        let y0 = (self.y as i64).max(0);
        let x1 = (self.x as i64 + self.width as i64).min(geometry.width as i64);
        let y1 = (self.y as i64 + self.height as i64).min(geometry.height as i64);
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(Rect {
            x: x0 as i32,
            y: y0 as i32,
            width: (x1 - x0) as u32,
            height: (y1 - y0) as u32,
        })
    }
}
