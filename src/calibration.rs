//! Coordinate transform engine.
//!
//! A single fixed-geometry pinhole model converts pixel measurements from
//! the calibration capture into physical millimeter coordinates, and infers
//! the board height from the apparent image-scale change of a reference
//! marker. Everything here is pure and synchronous: numeric fixtures are
//! enough to test it, no hardware or image data required.
//!
//! The projection applies similar triangles independently per axis:
//!
//! ```text
//! mm = px * (sensor_dim / resolution_dim) * (distance / focal_length)
//! ```
//!
//! Inputs must be finite and the focal length and resolution non-zero;
//! violations fail with [`ScanError::InvalidCalibration`] instead of
//! producing NaN coordinates downstream.

use crate::error::{ScanError, ScanResult};
use nalgebra::{Point2, Vector2};
use serde::{Deserialize, Serialize};

/// Fixed pinhole-camera constants for a rig.
///
/// Set once at construction (normally from [`crate::config::Settings`]) and
/// never mutated afterwards.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CalibrationModel {
    /// Physical sensor width, millimeters.
    pub sensor_width_mm: f64,
    /// Physical sensor height, millimeters.
    pub sensor_height_mm: f64,
    /// Lens focal length, millimeters.
    pub focal_length_mm: f64,
    /// Maximum horizontal resolution, pixels.
    pub resolution_width_px: f64,
    /// Maximum vertical resolution, pixels.
    pub resolution_height_px: f64,
    /// Reference standoff: camera to board reference plane, millimeters.
    pub camera_distance_mm: f64,
    /// Reference standoff: camera to lens origin, millimeters.
    pub camera_distance_2_mm: f64,
}

/// An axis-aligned rectangle in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PixelRect {
    /// Top-left corner.
    pub origin: Point2<f64>,
    /// Width and height, pixels.
    pub size: Vector2<f64>,
}

impl CalibrationModel {
    /// Check that the model can drive the projection at all.
    pub fn validate(&self) -> ScanResult<()> {
        let fields = [
            ("sensor_width_mm", self.sensor_width_mm),
            ("sensor_height_mm", self.sensor_height_mm),
            ("focal_length_mm", self.focal_length_mm),
            ("resolution_width_px", self.resolution_width_px),
            ("resolution_height_px", self.resolution_height_px),
            ("camera_distance_mm", self.camera_distance_mm),
            ("camera_distance_2_mm", self.camera_distance_2_mm),
        ];
        for (name, value) in fields {
            if !value.is_finite() {
                return Err(ScanError::InvalidCalibration(format!(
                    "{name} is not finite"
                )));
            }
        }
        if self.focal_length_mm == 0.0 {
            return Err(ScanError::InvalidCalibration(
                "focal length is zero".to_string(),
            ));
        }
        if self.resolution_width_px == 0.0 || self.resolution_height_px == 0.0 {
            return Err(ScanError::InvalidCalibration(
                "resolution is zero".to_string(),
            ));
        }
        if self.sensor_width_mm == 0.0 || self.sensor_height_mm == 0.0 {
            return Err(ScanError::InvalidCalibration(
                "sensor dimensions are zero".to_string(),
            ));
        }
        if self.camera_distance_mm <= 0.0 || self.camera_distance_2_mm <= 0.0 {
            return Err(ScanError::InvalidCalibration(
                "reference standoff distances must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Pixel pitch (mm per pixel on the sensor) per axis.
    fn pitch(&self) -> Vector2<f64> {
        Vector2::new(
            self.sensor_width_mm / self.resolution_width_px,
            self.sensor_height_mm / self.resolution_height_px,
        )
    }

    /// Convert a pixel offset within a capture into a physical offset in
    /// millimeters at the given standoff distance.
    pub fn px_to_mm(&self, offset_px: Vector2<f64>, distance_mm: f64) -> ScanResult<Vector2<f64>> {
        self.validate()?;
        if !offset_px.x.is_finite() || !offset_px.y.is_finite() || !distance_mm.is_finite() {
            return Err(ScanError::InvalidCalibration(
                "projection inputs must be finite".to_string(),
            ));
        }
        let pitch = self.pitch();
        let scale = distance_mm / self.focal_length_mm;
        Ok(Vector2::new(
            offset_px.x * pitch.x * scale,
            offset_px.y * pitch.y * scale,
        ))
    }

    /// Inverse of [`px_to_mm`](Self::px_to_mm): physical offset back to
    /// pixels at the same standoff distance.
    pub fn mm_to_px(&self, offset_mm: Vector2<f64>, distance_mm: f64) -> ScanResult<Vector2<f64>> {
        self.validate()?;
        if !offset_mm.x.is_finite() || !offset_mm.y.is_finite() || !distance_mm.is_finite() {
            return Err(ScanError::InvalidCalibration(
                "projection inputs must be finite".to_string(),
            ));
        }
        if distance_mm == 0.0 {
            return Err(ScanError::InvalidCalibration(
                "standoff distance is zero".to_string(),
            ));
        }
        let pitch = self.pitch();
        let scale = self.focal_length_mm / distance_mm;
        Ok(Vector2::new(
            offset_mm.x / pitch.x * scale,
            offset_mm.y / pitch.y * scale,
        ))
    }

    /// Project both the origin and the size of a pixel rectangle to
    /// millimeters at the given standoff distance.
    pub fn rect_to_mm(
        &self,
        rect: &PixelRect,
        distance_mm: f64,
    ) -> ScanResult<(Point2<f64>, Vector2<f64>)> {
        let origin = self.px_to_mm(rect.origin.coords, distance_mm)?;
        let size = self.px_to_mm(rect.size, distance_mm)?;
        Ok((Point2::from(origin), size))
    }

    /// Infer the board height from the apparent scale change of a reference
    /// marker between the reference capture and the measurement capture.
    ///
    /// The marker's apparent extent scales inversely with its distance from
    /// the lens origin, so with the reference extent taken at
    /// `camera_distance_2_mm`:
    ///
    /// ```text
    /// lens_distance = camera_distance_2 * reference_extent / measured_extent
    /// height        = camera_distance_2 - lens_distance
    /// ```
    ///
    /// Returns the measured board height above the reference plane,
    /// millimeters. The caller derives the updated probe standoff as
    /// `camera_distance_mm - height` via [`standoff_for_height`](Self::standoff_for_height).
    pub fn height_from_scale(
        &self,
        reference_extent_px: f64,
        measured_extent_px: f64,
    ) -> ScanResult<f64> {
        self.validate()?;
        if !reference_extent_px.is_finite() || !measured_extent_px.is_finite() {
            return Err(ScanError::InvalidCalibration(
                "marker extents must be finite".to_string(),
            ));
        }
        if reference_extent_px <= 0.0 || measured_extent_px <= 0.0 {
            return Err(ScanError::InvalidCalibration(
                "marker extents must be positive".to_string(),
            ));
        }
        let lens_distance = self.camera_distance_2_mm * reference_extent_px / measured_extent_px;
        Ok(self.camera_distance_2_mm - lens_distance)
    }

    /// Updated probe standoff for a measured board height.
    pub fn standoff_for_height(&self, height_mm: f64) -> ScanResult<f64> {
        if !height_mm.is_finite() {
            return Err(ScanError::InvalidCalibration(
                "measured height is not finite".to_string(),
            ));
        }
        let standoff = self.camera_distance_mm - height_mm;
        if standoff <= 0.0 {
            return Err(ScanError::InvalidCalibration(format!(
                "measured height {height_mm:.2} mm exceeds the reference standoff"
            )));
        }
        Ok(standoff)
    }
}
