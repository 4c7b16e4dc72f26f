use std::str;
use std::time::SystemTime;

use crate::device::types::{CompassDirection, PayloadLayout, TelemetrySample};
use crate::error::DecodeError;

/// Maps a heading to the compass direction whose 45° arc contains it.
/// Any integer is accepted; it is first normalized into [0, 360).
pub fn direction_from_angle(angle: i32) -> CompassDirection {
    match angle.rem_euclid(360) {
        0..=21 | 337..=359 => CompassDirection::North,
        22..=66 => CompassDirection::Northeast,
        67..=111 => CompassDirection::East,
        112..=156 => CompassDirection::Southeast,
        157..=201 => CompassDirection::South,
        202..=246 => CompassDirection::Southwest,
        247..=291 => CompassDirection::West,
        // 292..=336
        _ => CompassDirection::Northwest,
    }
}

/// Stateless; safe to call from any notification callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelemetryDecoder {
    layout: PayloadLayout,
}

impl TelemetryDecoder {
    pub fn new(layout: PayloadLayout) -> Self {
        TelemetryDecoder { layout }
    }

    pub fn layout(&self) -> PayloadLayout {
        self.layout
    }

    pub fn decode(&self, raw: &[u8]) -> Result<TelemetrySample, DecodeError> {
        self.decode_at(raw, SystemTime::now())
    }

    pub fn decode_at(&self, raw: &[u8], captured_at: SystemTime) -> Result<TelemetrySample, DecodeError> {
        let (angle_degrees, direction) = match self.layout {
            PayloadLayout::Int32 => {
                let bytes: [u8; 4] = self.exact(raw)?;
                let angle = i32::from_le_bytes(bytes);
                (Some(angle), direction_from_angle(angle))
            },
            PayloadLayout::Int16 => {
                let bytes: [u8; 2] = self.exact(raw)?;
                let angle = i32::from(i16::from_le_bytes(bytes));
                (Some(angle), direction_from_angle(angle))
            },
            PayloadLayout::Utf8 => (None, self.parse_label(raw)?),
        };

        Ok(TelemetrySample {
            raw_bytes: raw.to_vec(),
            angle_degrees,
            direction,
            captured_at,
        })
    }

    /// The inverse of `decode` for a heading; the utf-8 layout encodes the direction label.
    pub fn encode(&self, angle: i32) -> Vec<u8> {
        match self.layout {
            PayloadLayout::Int32 => angle.to_le_bytes().to_vec(),
            // truncation mirrors a firmware writing an int into a 16-bit characteristic
            PayloadLayout::Int16 => (angle as i16).to_le_bytes().to_vec(),
            PayloadLayout::Utf8 => direction_from_angle(angle).abbreviation().as_bytes().to_vec(),
        }
    }

    fn exact<const N: usize>(&self, raw: &[u8]) -> Result<[u8; N], DecodeError> {
        raw.try_into().map_err(|_| DecodeError::PayloadTooShort {
            layout: self.layout,
            expected: N,
            actual: raw.len(),
        })
    }

    fn parse_label(&self, raw: &[u8]) -> Result<CompassDirection, DecodeError> {
        let text = str::from_utf8(raw)?;
        // fixed-size firmware buffers arrive NUL padded
        let label = text.trim_matches(|c: char| c == '\0' || c.is_whitespace());

        if label.is_empty() {
            return Err(DecodeError::PayloadTooShort { layout: self.layout, expected: 1, actual: 0 });
        }

        label.parse().map_err(|_| DecodeError::UnknownDirection { label: label.to_string() })
    }
}
