//! Scan region geometry.
//!
//! Everything the grid needs to know about *where* to measure: the robot
//! coordinate of the board corner, the detected scan area in both pixel and
//! physical units, the measured probe height, and the step sizes. The
//! physical sizes are always derived from the pixel sizes through the
//! transform engine in one recompute, so a stale mix of old and new
//! coordinates cannot survive a calibration change.

use crate::calibration::{CalibrationModel, PixelRect};
use crate::config::Traversal;
use crate::error::{ScanError, ScanResult};
use nalgebra::{Point2, Point3, Vector2};
use serde::{Deserialize, Serialize};

/// Fully resolved geometry for one scan run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRegion {
    /// Robot coordinate of the board corner, millimeters.
    pub origin_mm: Point2<f64>,
    /// Board corner in physical units relative to the capture origin.
    pub pcb_corner_mm: Point2<f64>,
    /// Full board size, millimeters.
    pub board_size_mm: Vector2<f64>,
    /// Scan area in pixel units, as detected.
    pub area_px: PixelRect,
    /// Scan area origin in physical units.
    pub area_origin_mm: Point2<f64>,
    /// Scan area size in physical units.
    pub area_size_mm: Vector2<f64>,
    /// Probe standoff height for this run, millimeters.
    pub height_mm: f64,
    /// Grid step in X and Y, millimeters.
    pub step_xy_mm: f64,
    /// Plane step in Z, millimeters.
    pub step_z_mm: f64,
}

impl ScanRegion {
    /// Build a region from a detected board rectangle.
    ///
    /// All physical fields are derived from `area_px` through the transform
    /// engine at the given standoff; calling this again (or
    /// [`apply_height`](Self::apply_height)) recomputes every derived field
    /// together.
    pub fn from_detection(
        calibration: &CalibrationModel,
        area_px: PixelRect,
        height_mm: f64,
        step_xy_mm: f64,
        step_z_mm: f64,
    ) -> ScanResult<Self> {
        if !(step_xy_mm > 0.0) || !(step_z_mm > 0.0) {
            return Err(ScanError::Configuration(
                "step sizes must be positive".to_string(),
            ));
        }
        let standoff = calibration.standoff_for_height(height_mm)?;
        let (area_origin_mm, area_size_mm) = calibration.rect_to_mm(&area_px, standoff)?;
        if area_size_mm.x <= 0.0 || area_size_mm.y <= 0.0 {
            return Err(ScanError::InvalidCalibration(
                "detected scan area has non-positive size".to_string(),
            ));
        }
        Ok(Self {
            origin_mm: area_origin_mm,
            pcb_corner_mm: area_origin_mm,
            board_size_mm: area_size_mm,
            area_px,
            area_origin_mm,
            area_size_mm,
            height_mm,
            step_xy_mm,
            step_z_mm,
        })
    }

    /// Recompute the physical fields for a newly measured height.
    ///
    /// The pixel rectangle is the source of truth; every derived millimeter
    /// field is invalidated and recomputed in this one call.
    pub fn apply_height(&mut self, calibration: &CalibrationModel, height_mm: f64) -> ScanResult<()> {
        let standoff = calibration.standoff_for_height(height_mm)?;
        let (area_origin_mm, area_size_mm) = calibration.rect_to_mm(&self.area_px, standoff)?;
        self.height_mm = height_mm;
        self.area_origin_mm = area_origin_mm;
        self.area_size_mm = area_size_mm;
        self.pcb_corner_mm = area_origin_mm;
        self.board_size_mm = area_size_mm;
        Ok(())
    }

    /// Number of grid rows: `ceil(height / step)`.
    pub fn rows(&self) -> usize {
        (self.area_size_mm.y / self.step_xy_mm).ceil() as usize
    }

    /// Number of grid columns: `ceil(width / step)`.
    pub fn columns(&self) -> usize {
        (self.area_size_mm.x / self.step_xy_mm).ceil() as usize
    }

    /// Total grid points.
    pub fn point_count(&self) -> usize {
        self.rows() * self.columns()
    }

    /// The column visited at `(row, visit_index)` under a traversal policy.
    ///
    /// Raster restarts at zero each row; serpentine mirrors odd rows. The
    /// row index increases monotonically either way.
    pub fn column_at(&self, row: usize, visit_index: usize, traversal: Traversal) -> usize {
        match traversal {
            Traversal::Raster => visit_index,
            Traversal::Serpentine if row % 2 == 1 => self.columns() - 1 - visit_index,
            Traversal::Serpentine => visit_index,
        }
    }

    /// Robot target for a grid cell, at the region's probe height.
    pub fn target_mm(&self, row: usize, column: usize) -> Point3<f64> {
        Point3::new(
            self.origin_mm.x + column as f64 * self.step_xy_mm,
            self.origin_mm.y + row as f64 * self.step_xy_mm,
            self.height_mm,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(width_mm: f64, height_mm: f64, step: f64) -> ScanRegion {
        ScanRegion {
            origin_mm: Point2::new(0.0, 0.0),
            pcb_corner_mm: Point2::new(0.0, 0.0),
            board_size_mm: Vector2::new(width_mm, height_mm),
            area_px: PixelRect {
                origin: Point2::new(0.0, 0.0),
                size: Vector2::new(1.0, 1.0),
            },
            area_origin_mm: Point2::new(0.0, 0.0),
            area_size_mm: Vector2::new(width_mm, height_mm),
            height_mm: 10.0,
            step_xy_mm: step,
            step_z_mm: 5.0,
        }
    }

    #[test]
    fn grid_dimensions_round_up() {
        let r = region(100.0, 60.0, 10.0);
        assert_eq!(r.columns(), 10);
        assert_eq!(r.rows(), 6);
        assert_eq!(r.point_count(), 60);
    }

    #[test]
    fn partial_cells_get_their_own_point() {
        let r = region(101.0, 59.0, 10.0);
        assert_eq!(r.columns(), 11);
        assert_eq!(r.rows(), 6);
    }

    #[test]
    fn raster_restarts_each_row() {
        let r = region(30.0, 20.0, 10.0);
        let visits: Vec<usize> = (0..r.columns())
            .map(|i| r.column_at(1, i, Traversal::Raster))
            .collect();
        assert_eq!(visits, vec![0, 1, 2]);
    }

    #[test]
    fn serpentine_mirrors_odd_rows() {
        let r = region(30.0, 20.0, 10.0);
        let even: Vec<usize> = (0..3).map(|i| r.column_at(0, i, Traversal::Serpentine)).collect();
        let odd: Vec<usize> = (0..3).map(|i| r.column_at(1, i, Traversal::Serpentine)).collect();
        assert_eq!(even, vec![0, 1, 2]);
        assert_eq!(odd, vec![2, 1, 0]);
    }

    #[test]
    fn target_positions_step_by_grid_pitch() {
        let mut r = region(100.0, 60.0, 10.0);
        r.origin_mm = Point2::new(5.0, 7.0);
        let p = r.target_mm(2, 3);
        assert_eq!(p, Point3::new(35.0, 27.0, 10.0));
    }
}
