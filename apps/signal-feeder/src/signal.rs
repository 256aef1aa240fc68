use std::f64::consts::PI;
use std::ops::Range;

pub const FULL_TURN_DEGREES: u32 = 360;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub degree: u32,
    pub value: f64,
}

/// One sine sample per whole degree, starting at 0. Consumed once.
#[derive(Debug)]
pub struct SignalSource {
    degrees: Range<u32>,
}

impl SignalSource {
    /// `inclusive_end` adds the closing 360° sample.
    pub fn new(inclusive_end: bool) -> Self {
        let end = if inclusive_end {
            FULL_TURN_DEGREES + 1
        } else {
            FULL_TURN_DEGREES
        };
        Self { degrees: 0..end }
    }
}

impl Iterator for SignalSource {
    type Item = Sample;

    fn next(&mut self) -> Option<Sample> {
        self.degrees.next().map(|degree| Sample {
            degree,
            value: degree_to_radians(f64::from(degree)).sin(),
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.degrees.size_hint()
    }
}

impl ExactSizeIterator for SignalSource {}

pub fn degree_to_radians(degree: f64) -> f64 {
    degree * (PI / 180.0)
}
