use crate::error::ClistError;
use crate::types::{BandRange, ColorIndex, LogicalOp, NO_COLOR, TilePhase};

/// Field of a band state record, addressed by name instead of by offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateField {
    FillColor,
    StrokeColor,
    TileColor0,
    TileColor1,
    TilePhase,
    LogicalOp,
    LopEnabled,
    ClipEnabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateValue {
    Color(ColorIndex),
    Phase(TilePhase),
    Lop(LogicalOp),
    Flag(bool),
}

/// What the reader of a band knows as of the last instruction written to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandState {
    /// Indexed by color slot: 0 is stroke, 1 is fill.
    pub colors: [ColorIndex; 2],
    pub tile_colors: [ColorIndex; 2],
    pub tile_phase: TilePhase,
    pub lop: LogicalOp,
    pub lop_enabled: bool,
    pub clip_enabled: bool,
    pub tile_index: Option<u16>,
}

impl Default for BandState {
    fn default() -> Self {
        Self {
            colors: [NO_COLOR; 2],
            tile_colors: [NO_COLOR; 2],
            tile_phase: TilePhase::default(),
            lop: LogicalOp::DEFAULT,
            lop_enabled: false,
            clip_enabled: false,
            tile_index: None,
        }
    }
}

impl BandState {
    pub fn get(&self, field: StateField) -> StateValue {
        match field {
            StateField::FillColor => StateValue::Color(self.colors[1]),
            StateField::StrokeColor => StateValue::Color(self.colors[0]),
            StateField::TileColor0 => StateValue::Color(self.tile_colors[0]),
            StateField::TileColor1 => StateValue::Color(self.tile_colors[1]),
            StateField::TilePhase => StateValue::Phase(self.tile_phase),
            StateField::LogicalOp => StateValue::Lop(self.lop),
            StateField::LopEnabled => StateValue::Flag(self.lop_enabled),
            StateField::ClipEnabled => StateValue::Flag(self.clip_enabled),
        }
    }

    fn set(&mut self, field: StateField, value: StateValue) -> Result<(), ClistError> {
        match (field, value) {
            (StateField::FillColor, StateValue::Color(c)) => self.colors[1] = c,
            (StateField::StrokeColor, StateValue::Color(c)) => self.colors[0] = c,
            (StateField::TileColor0, StateValue::Color(c)) => self.tile_colors[0] = c,
            (StateField::TileColor1, StateValue::Color(c)) => self.tile_colors[1] = c,
            (StateField::TilePhase, StateValue::Phase(p)) => self.tile_phase = p,
            (StateField::LogicalOp, StateValue::Lop(lop)) => self.lop = lop,
            (StateField::LopEnabled, StateValue::Flag(on)) => self.lop_enabled = on,
            (StateField::ClipEnabled, StateValue::Flag(on)) => self.clip_enabled = on,
            (field, value) => return Err(ClistError::StateTypeMismatch { field, value }),
        }
        Ok(())
    }
}

/// Checks that `value` has the shape `field` stores.
pub fn check_value(field: StateField, value: StateValue) -> Result<(), ClistError> {
    BandState::default().set(field, value)
}

#[derive(Debug, Clone, Default)]
pub struct BandStateTable {
    bands: Vec<BandState>,
}

impl BandStateTable {
    pub fn new(nbands: u32) -> Self {
        Self {
            bands: vec![BandState::default(); nbands as usize],
        }
    }

    pub fn len(&self) -> usize {
        self.bands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bands.is_empty()
    }

    pub fn band(&self, band: u32) -> Result<&BandState, ClistError> {
        self.bands
            .get(band as usize)
            .ok_or(ClistError::BandOutOfRange {
                band,
                nbands: self.bands.len() as u32,
            })
    }

    pub fn get(&self, band: u32, field: StateField) -> Result<StateValue, ClistError> {
        Ok(self.band(band)?.get(field))
    }

    pub fn has_changed(
        &self,
        band: u32,
        field: StateField,
        value: &StateValue,
    ) -> Result<bool, ClistError> {
        check_value(field, *value)?;
        Ok(self.get(band, field)? != *value)
    }

    /// Records that the reader of `band` now knows `value`. Call only after
    /// the instruction carrying it has been appended.
    pub fn commit(
        &mut self,
        band: u32,
        field: StateField,
        value: StateValue,
    ) -> Result<(), ClistError> {
        let nbands = self.bands.len() as u32;
        self.bands
            .get_mut(band as usize)
            .ok_or(ClistError::BandOutOfRange { band, nbands })?
            .set(field, value)
    }

    pub fn commit_range(
        &mut self,
        range: BandRange,
        field: StateField,
        value: StateValue,
    ) -> Result<(), ClistError> {
        for band in range.bands() {
            self.commit(band, field, value)?;
        }
        Ok(())
    }

    /// The value every band in `range` shares, if they agree.
    pub fn common(
        &self,
        range: BandRange,
        field: StateField,
    ) -> Result<Option<StateValue>, ClistError> {
        let first = self.get(range.min, field)?;
        for band in range.bands().skip(1) {
            if self.get(band, field)? != first {
                return Ok(None);
            }
        }
        Ok(Some(first))
    }

    pub(crate) fn set_tile_index(&mut self, band: u32, index: Option<u16>) -> Result<(), ClistError> {
        let nbands = self.bands.len() as u32;
        self.bands
            .get_mut(band as usize)
            .ok_or(ClistError::BandOutOfRange { band, nbands })?
            .tile_index = index;
        Ok(())
    }

    /// Restores every band to the defaults a reader starts each page with.
    pub fn reset(&mut self, nbands: u32) {
        self.bands.clear();
        self.bands.resize(nbands as usize, BandState::default());
    }
}
