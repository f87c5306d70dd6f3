//! Data tensor assembly.
//!
//! Per-point traces accumulate into an ordered rows × columns × frequency
//! volume. The first recorded trace fixes the bin count (`sweep_points`);
//! from then on every cell is forced to exactly that many scalars: short
//! reads are padded with the sentinel and surfaced as warnings, never
//! silently truncated to a ragged tensor. Cells must arrive in visit
//! order; anything else is a bookkeeping bug and fails loudly.

use crate::error::{ScanError, ScanResult};
use crate::scan::region::ScanRegion;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

/// Reserved scalar marking a missing or invalid measurement.
pub const SENTINEL: f64 = f64::NAN;

/// What happened to the cell just recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellOutcome {
    /// Trace had exactly `sweep_points` values.
    Complete,
    /// Trace was short; this many bins were padded with the sentinel.
    Padded(usize),
    /// Trace was long; this many bins were dropped.
    Truncated(usize),
    /// No trace at all; the whole cell is sentinel values.
    Missing,
}

/// Which end of the current row a cell lands on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Back,
    Front,
}

/// Growing 3-D measurement volume for one scan run.
#[derive(Debug, Default)]
pub struct DataTensor {
    rows: Vec<Vec<Vec<f64>>>,
    frequencies_hz: Vec<f64>,
    sweep_points: Option<usize>,
    row_descending: bool,
}

impl DataTensor {
    /// Empty tensor for a new run.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bin count, once the first trace has established it.
    pub fn sweep_points(&self) -> Option<usize> {
        self.sweep_points
    }

    /// Frequency axis captured from the first trace of the run.
    pub fn frequencies_hz(&self) -> &[f64] {
        &self.frequencies_hz
    }

    /// Capture the frequency axis. Only the first call takes effect.
    pub fn set_frequencies(&mut self, frequencies_hz: Vec<f64>) {
        if self.frequencies_hz.is_empty() {
            self.frequencies_hz = frequencies_hz;
        }
    }

    /// Record one cell's amplitudes at `(row, column)`.
    ///
    /// Establishes `sweep_points` from the first non-empty trace and
    /// re-pads any earlier failed cells to match. Cells must arrive in
    /// visit order: rows strictly one at a time, columns within a row
    /// either ascending from zero (raster, and the first row always) or
    /// descending from the last column (serpentine return rows). Anything
    /// else is [`ScanError::GridOverflow`].
    pub fn record(
        &mut self,
        row: usize,
        column: usize,
        mut amplitudes: Vec<f64>,
    ) -> ScanResult<CellOutcome> {
        let slot = self.expect_slot(row, column)?;

        if self.sweep_points.is_none() && !amplitudes.is_empty() {
            self.sweep_points = Some(amplitudes.len());
            self.repad_existing();
        }

        let outcome = match self.sweep_points {
            None => CellOutcome::Missing,
            Some(points) if amplitudes.len() == points => CellOutcome::Complete,
            Some(points) if amplitudes.len() < points => {
                let padded = points - amplitudes.len();
                warn!(row, column, padded, "short trace padded with sentinel");
                amplitudes.resize(points, SENTINEL);
                CellOutcome::Padded(padded)
            }
            Some(points) => {
                let dropped = amplitudes.len() - points;
                warn!(row, column, dropped, "long trace truncated to sweep_points");
                amplitudes.truncate(points);
                CellOutcome::Truncated(dropped)
            }
        };

        self.insert(row, slot, amplitudes);
        Ok(outcome)
    }

    /// Record a failed acquisition as a full sentinel cell.
    pub fn record_missing(&mut self, row: usize, column: usize) -> ScanResult<CellOutcome> {
        let slot = self.expect_slot(row, column)?;
        let cell = vec![SENTINEL; self.sweep_points.unwrap_or(0)];
        self.insert(row, slot, cell);
        Ok(CellOutcome::Missing)
    }

    fn insert(&mut self, row: usize, slot: Slot, cell: Vec<f64>) {
        match slot {
            Slot::Back => self.rows[row].push(cell),
            Slot::Front => self.rows[row].insert(0, cell),
        }
    }

    fn expect_slot(&mut self, row: usize, column: usize) -> ScanResult<Slot> {
        let columns = if row == 0 {
            None
        } else {
            self.rows.first().map(Vec::len)
        };

        if row == self.rows.len() {
            // Starting a new row requires the previous one to be complete.
            let previous_complete = match (self.rows.last(), self.rows.first().map(Vec::len)) {
                (None, _) => true,
                (Some(last), Some(c)) => last.len() == c,
                (Some(_), None) => true,
            };
            if !previous_complete {
                error!(row, column, "new row started before previous row completed");
                return Err(ScanError::GridOverflow { row, column });
            }
            self.rows.push(Vec::new());
            self.row_descending = false;
        }

        if row + 1 != self.rows.len() {
            error!(
                row,
                column,
                have_rows = self.rows.len(),
                "tensor cell outside visit order; row/column bookkeeping is broken"
            );
            return Err(ScanError::GridOverflow { row, column });
        }

        let filled = self.rows[row].len();

        // The first cell of a row fixes its direction: ascending rows start
        // at column zero, serpentine return rows at the last column. The
        // first row must be ascending since it establishes the column count.
        if filled == 0 {
            self.row_descending = match columns {
                Some(c) if column + 1 == c && c > 1 => true,
                _ => false,
            };
        }

        let expected = if self.row_descending {
            match columns {
                Some(c) if column + filled + 1 == c => Some(Slot::Front),
                _ => None,
            }
        } else {
            let within = columns.map_or(true, |c| filled < c);
            (column == filled && within).then_some(Slot::Back)
        };

        expected.ok_or_else(|| {
            error!(row, column, filled, "tensor cell outside visit order");
            ScanError::GridOverflow { row, column }
        })
    }

    /// Pad cells recorded before `sweep_points` was known.
    fn repad_existing(&mut self) {
        let Some(points) = self.sweep_points else {
            return;
        };
        for row in &mut self.rows {
            for cell in row.iter_mut() {
                if cell.len() < points {
                    cell.resize(points, SENTINEL);
                }
            }
        }
    }

    /// Finish the run: verify rectangularity and produce the immutable
    /// volume handed to the export path.
    pub fn into_volume(self, region: &ScanRegion, started_at: DateTime<Utc>) -> ScanResult<ScanVolume> {
        let columns = self.rows.first().map_or(0, Vec::len);
        let points = self.sweep_points.unwrap_or(0);
        for (r, row) in self.rows.iter().enumerate() {
            if row.len() != columns {
                error!(row = r, have = row.len(), want = columns, "ragged tensor row");
                return Err(ScanError::GridOverflow {
                    row: r,
                    column: row.len(),
                });
            }
            for (c, cell) in row.iter().enumerate() {
                if cell.len() != points {
                    error!(row = r, column = c, "ragged tensor cell");
                    return Err(ScanError::GridOverflow { row: r, column: c });
                }
            }
        }
        Ok(ScanVolume {
            rows: self.rows,
            frequencies_hz: self.frequencies_hz,
            sweep_points: points,
            region: region.clone(),
            started_at,
            completed_at: Utc::now(),
        })
    }
}

/// A completed, immutable scan volume plus the geometry that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanVolume {
    /// `rows[row][column][bin]` amplitude scalars.
    pub rows: Vec<Vec<Vec<f64>>>,
    /// Frequency of each bin, hertz.
    pub frequencies_hz: Vec<f64>,
    /// Bin count per cell.
    pub sweep_points: usize,
    /// Geometry of the run.
    pub region: ScanRegion,
    /// When the scan started.
    pub started_at: DateTime<Utc>,
    /// When the volume was assembled.
    pub completed_at: DateTime<Utc>,
}

impl ScanVolume {
    /// Grid rows recorded.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Grid columns per row.
    pub fn column_count(&self) -> usize {
        self.rows.first().map_or(0, Vec::len)
    }
}
