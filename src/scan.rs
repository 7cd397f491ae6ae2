// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use crate::telegram::Error;
use log::warn;
use ndarray::{Array1, Array2};
use std::{f64::consts::PI, fmt};
use tracing::instrument;

/// Command name of the scan data variable.
pub const SCAN_DATA: &str = "LMDscandata";

/// Scan telegram layout version understood by the decoder.
pub const SCAN_VERSION: u16 = 1;

/// Converts the device scaling factor from millimetres to metres.
pub const SCALING_TO_METERS: f32 = 0.001;

/// Device angle units per half turn (1/10000 degree).
pub const ANGLE_UNITS_PER_PI: f64 = 1_800_000.0;

/// Big-endian field reader over a telegram payload.
pub(crate) struct Fields<'a> {
    slice: &'a [u8],
    offset: usize,
}

impl<'a> Fields<'a> {
    pub(crate) fn new(slice: &'a [u8]) -> Fields<'a> {
        Fields { slice, offset: 0 }
    }

    pub(crate) fn take(&mut self, len: usize) -> Result<&'a [u8], Error> {
        if self.offset + len > self.slice.len() {
            return Err(Error::UnexpectedEndOfSlice(self.offset));
        }
        let data = &self.slice[self.offset..self.offset + len];
        self.offset += len;
        Ok(data)
    }

    pub(crate) fn skip(&mut self, len: usize) -> Result<(), Error> {
        self.take(len).map(|_| ())
    }

    pub(crate) fn u8(&mut self) -> Result<u8, Error> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16, Error> {
        let data = self.take(2)?;
        Ok(u16::from_be_bytes([data[0], data[1]]))
    }

    pub(crate) fn u32(&mut self) -> Result<u32, Error> {
        let data = self.take(4)?;
        Ok(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
    }

    pub(crate) fn i32(&mut self) -> Result<i32, Error> {
        let data = self.take(4)?;
        Ok(i32::from_be_bytes([data[0], data[1], data[2], data[3]]))
    }

    pub(crate) fn f32(&mut self) -> Result<f32, Error> {
        let data = self.take(4)?;
        Ok(f32::from_be_bytes([data[0], data[1], data[2], data[3]]))
    }

    /// Reads a string prefixed with its 16-bit length.
    pub(crate) fn string(&mut self) -> Result<String, Error> {
        let len = self.u16()? as usize;
        Ok(String::from_utf8_lossy(self.take(len)?).to_string())
    }
}

/// Device state decoded from the most recent scan telegram.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScanFrame {
    /// Device serial number
    pub serial_number: u32,
    /// Device status byte, zero when the device reports no error
    pub device_status: u8,
    /// Scan counter, wraps at 16 bits
    pub scan_counter: u16,
    /// Device-relative timestamp in microseconds since power-on
    pub timestamp: u32,
    /// Data channel tag, such as `DIST1`
    pub channel_name: [u8; 5],
    /// Metres per raw sample unit
    pub scaling_factor: f32,
    /// Raw scaling offset as reported by the device
    pub scaling_offset: f32,
    /// Angle of the first sample on the wire in 1/10000 degree
    pub starting_angle: i32,
    /// Angle between consecutive samples in 1/10000 degree
    pub angular_step_width: u16,
    radii: Vec<u16>,
    directions: Option<Vec<[f64; 2]>>,
}

impl fmt::Display for ScanFrame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "ScanFrame {{ scan_counter: {}, timestamp: {}, channel: {}, samples: {}, start: {}, step: {} }}",
            self.scan_counter,
            self.timestamp,
            self.channel_name(),
            self.radii.len(),
            self.starting_angle,
            self.angular_step_width
        )
    }
}

impl ScanFrame {
    /// Creates an empty frame with no samples.
    pub fn new() -> ScanFrame {
        ScanFrame::default()
    }

    /// Updates the frame from the payload of a scan data acknowledgement.
    ///
    /// Unexpected version, status and channel count values are logged but do
    /// not fail the decode.  A truncated payload returns
    /// `UnexpectedEndOfSlice` and leaves the frame partially updated.
    #[instrument(skip_all, level = "debug")]
    pub fn decode(&mut self, payload: &[u8]) -> Result<(), Error> {
        let mut fields = Fields::new(payload);

        let version = fields.u16()?;
        if version != SCAN_VERSION {
            warn!("unexpected scan telegram version {}", version);
        }

        // device number
        fields.skip(2)?;
        self.serial_number = fields.u32()?;

        fields.skip(1)?;
        self.device_status = fields.u8()?;
        if self.device_status != 0 {
            warn!("device status 0x{:02X}", self.device_status);
        }

        // telegram counter
        fields.skip(2)?;
        self.scan_counter = fields.u16()?;

        // time since startup
        fields.skip(4)?;
        self.timestamp = fields.u32()?;

        // input/output states, reserved, scan and measurement frequency
        fields.skip(14)?;

        let channels = fields.u16()?;
        if channels != 1 {
            warn!("expected one 16-bit channel but got {}", channels);
        }

        self.channel_name.copy_from_slice(fields.take(5)?);
        self.scaling_factor = fields.f32()? * SCALING_TO_METERS;
        self.scaling_offset = fields.f32()?;

        let starting_angle = fields.i32()?;
        let angular_step_width = fields.u16()?;
        let count = fields.u16()? as usize;
        let samples = fields.take(count * 2)?;

        if starting_angle != self.starting_angle
            || angular_step_width != self.angular_step_width
            || count != self.radii.len()
        {
            self.directions = None;
        }
        self.starting_angle = starting_angle;
        self.angular_step_width = angular_step_width;

        self.radii.resize(count, 0);
        for (radius, sample) in self.radii.iter_mut().rev().zip(samples.chunks_exact(2)) {
            *radius = u16::from_be_bytes([sample[0], sample[1]]);
        }

        Ok(())
    }

    /// Returns the channel name as text.
    pub fn channel_name(&self) -> String {
        String::from_utf8_lossy(&self.channel_name).to_string()
    }

    /// Raw range samples in logical order, the reverse of wire order.
    pub fn radii(&self) -> &[u16] {
        &self.radii
    }

    /// Number of samples in the frame.
    pub fn len(&self) -> usize {
        self.radii.len()
    }

    /// Returns true when the frame holds no samples.
    pub fn is_empty(&self) -> bool {
        self.radii.is_empty()
    }

    /// Returns true when the direction cache matches the current geometry.
    pub fn has_directions(&self) -> bool {
        self.directions.is_some()
    }

    /// Angle of logical sample `index` in radians, or `None` past the end
    /// of the frame.
    pub fn angle(&self, index: usize) -> Option<f64> {
        let steps = self.radii.len().checked_sub(index)?.checked_sub(1)? as f64;
        Some(
            PI * (self.starting_angle as f64 + steps * self.angular_step_width as f64)
                / ANGLE_UNITS_PER_PI,
        )
    }

    /// Unit direction `(cos θ, sin θ)` of every sample, rebuilt only after the
    /// angular geometry or sample count has changed.
    pub fn directions(&mut self) -> &[[f64; 2]] {
        if self.directions.is_none() {
            let directions = (0..self.radii.len())
                .filter_map(|index| self.angle(index))
                .map(|theta| [theta.cos(), theta.sin()])
                .collect();
            self.directions = Some(directions);
        }

        self.directions.as_deref().unwrap_or_default()
    }

    /// Distance of every sample in metres.
    pub fn distances(&self) -> Array1<f32> {
        self.radii
            .iter()
            .map(|radius| self.scaling_factor * *radius as f32)
            .collect()
    }

    /// Cartesian points in the scan plane as an N×3 array of `(x, y, z)` in
    /// metres.  The scanner is planar so `y` is always zero.
    #[instrument(skip_all, level = "debug")]
    pub fn points(&mut self) -> Array2<f32> {
        let distances = self.distances();
        let directions = self.directions();
        let mut points = Array2::<f32>::zeros((distances.len(), 3));

        for ((mut point, distance), direction) in points
            .rows_mut()
            .into_iter()
            .zip(distances.iter())
            .zip(directions.iter())
        {
            point[0] = distance * direction[0] as f32;
            point[2] = distance * direction[1] as f32;
        }

        points
    }
}
