//! Generated test patterns
//!
//! Rendered on the CPU into host-memory RGBA frames, one row per rayon task.
//! Static patterns are generated once and the same buffer is handed out for
//! every frame. Timestamps come from the frame counter; the bounded frame
//! queue throttles generation to the presentation rate.

use super::{DecodedFrame, FrameProducer, PixelFormat, PlaneDescriptor, Produced};
use crate::error::SourceError;

use rayon::prelude::*;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// SMPTE-style colour bars, left to right
const BARS: [[u8; 3]; 7] = [
    [191, 191, 191],
    [191, 191, 0],
    [0, 191, 191],
    [0, 191, 0],
    [191, 0, 191],
    [191, 0, 0],
    [0, 0, 191],
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Pattern {
    Bars,
    /// Horizontal hue sweep that drifts over time
    Gradient,
    Plasma,
    /// Scrolling 64px checkerboard
    Checker,
    Solid([u8; 4]),
}

impl Pattern {
    pub const NAMES: [&'static str; 5] = ["bars", "gradient", "plasma", "checker", "solid:#RRGGBB"];

    /// Whether every frame of this pattern is identical
    pub fn is_static(&self) -> bool {
        matches!(self, Self::Bars | Self::Solid(_))
    }

    /// Render one frame at `time` seconds into an RGBA buffer
    pub fn render(&self, width: u32, height: u32, time: f32) -> Vec<u8> {
        let stride = width as usize * 4;
        let mut data = vec![0u8; stride * height as usize];
        if stride == 0 {
            return data;
        }

        data.par_chunks_mut(stride).enumerate().for_each(|(y, row)| {
            for x in 0..width as usize {
                let rgba = self.pixel(x as f32, y as f32, width as f32, height as f32, time);
                row[x * 4..x * 4 + 4].copy_from_slice(&rgba);
            }
        });
        data
    }

    fn pixel(&self, x: f32, y: f32, width: f32, height: f32, time: f32) -> [u8; 4] {
        match self {
            Self::Solid(color) => *color,
            Self::Bars => {
                let index = ((x / width) * BARS.len() as f32) as usize;
                let [r, g, b] = BARS[index.min(BARS.len() - 1)];
                [r, g, b, 255]
            }
            Self::Gradient => {
                let hue = (x / width + time * 0.1).fract();
                let value = 1.0 - 0.5 * (y / height);
                hsv_to_rgba(hue, 1.0, value)
            }
            Self::Plasma => {
                let u = x / width * 8.0;
                let v = y / height * 8.0;
                let p = (u + time).sin()
                    + (v + time * 0.7).sin()
                    + ((u + v + time) * 0.5).sin()
                    + ((u * u + v * v).sqrt() - time).sin();
                let hue = (p / 8.0 + 0.5).fract();
                hsv_to_rgba(hue, 0.8, 1.0)
            }
            Self::Checker => {
                let offset = time * 64.0;
                let cx = ((x + offset) / 64.0).floor() as i64;
                let cy = (y / 64.0).floor() as i64;
                if (cx + cy).rem_euclid(2) == 0 {
                    [235, 235, 235, 255]
                } else {
                    [16, 16, 16, 255]
                }
            }
        }
    }
}

impl FromStr for Pattern {
    type Err = SourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bars" => Ok(Self::Bars),
            "gradient" => Ok(Self::Gradient),
            "plasma" => Ok(Self::Plasma),
            "checker" => Ok(Self::Checker),
            other => {
                if let Some(color) = other.strip_prefix("solid:") {
                    let (r, g, b, a) = parse_hex_color(color).ok_or_else(|| {
                        SourceError::NotFound(format!("invalid pattern colour {}", color))
                    })?;
                    Ok(Self::Solid([r, g, b, a]))
                } else {
                    Err(SourceError::NotFound(format!(
                        "unknown pattern {} (expected one of: {})",
                        other,
                        Self::NAMES.join(", ")
                    )))
                }
            }
        }
    }
}

/// Parse a hex color string (e.g., "#FF5733" or "FF5733") to RGBA
pub fn parse_hex_color(color: &str) -> Option<(u8, u8, u8, u8)> {
    let color = color.trim_start_matches('#');

    if !color.is_ascii() || (color.len() != 6 && color.len() != 8) {
        return None;
    }

    let r = u8::from_str_radix(&color[0..2], 16).ok()?;
    let g = u8::from_str_radix(&color[2..4], 16).ok()?;
    let b = u8::from_str_radix(&color[4..6], 16).ok()?;
    let a = if color.len() == 8 {
        u8::from_str_radix(&color[6..8], 16).ok()?
    } else {
        255
    };

    Some((r, g, b, a))
}

fn hsv_to_rgba(h: f32, s: f32, v: f32) -> [u8; 4] {
    let h6 = (h * 6.0).rem_euclid(6.0);
    let c = v * s;
    let x = c * (1.0 - ((h6 % 2.0) - 1.0).abs());
    let m = v - c;
    let (r, g, b) = match h6 as u32 {
        0 => (c, x, 0.0),
        1 => (x, c, 0.0),
        2 => (0.0, c, x),
        3 => (0.0, x, c),
        4 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };
    let to_u8 = |f: f32| ((f + m).clamp(0.0, 1.0) * 255.0).round() as u8;
    [to_u8(r), to_u8(g), to_u8(b), 255]
}

/// Produces pattern frames at a fixed rate
pub struct ProceduralProducer {
    pattern: Pattern,
    width: u32,
    height: u32,
    frame_duration: Duration,
    frame_index: u64,
    cached: Option<Arc<[u8]>>,
}

impl ProceduralProducer {
    pub fn new(pattern: Pattern, width: u32, height: u32, fps: u32) -> Self {
        Self {
            pattern,
            width,
            height,
            frame_duration: Duration::from_secs_f64(1.0 / fps.max(1) as f64),
            frame_index: 0,
            cached: None,
        }
    }

    /// Parse a pattern id such as `plasma` or `solid:#202040`
    pub fn from_id(id: &str, width: u32, height: u32, fps: u32) -> Result<Self, SourceError> {
        if width == 0 || height == 0 {
            return Err(SourceError::Allocation(format!(
                "invalid pattern size {}x{}",
                width, height
            )));
        }
        Ok(Self::new(id.parse()?, width, height, fps))
    }

    fn frame_data(&mut self, time: f32) -> Arc<[u8]> {
        if self.pattern.is_static() {
            if let Some(cached) = &self.cached {
                return Arc::clone(cached);
            }
            let data: Arc<[u8]> = self.pattern.render(self.width, self.height, time).into();
            self.cached = Some(Arc::clone(&data));
            return data;
        }
        self.pattern.render(self.width, self.height, time).into()
    }
}

impl FrameProducer for ProceduralProducer {
    fn start(&mut self) -> Result<(), SourceError> {
        self.frame_index = 0;
        log::debug!(
            "Generating {:?} at {}x{}, {:.1}ms per frame",
            self.pattern,
            self.width,
            self.height,
            self.frame_duration.as_secs_f64() * 1000.0
        );
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Produced, SourceError> {
        let timestamp = self.frame_duration.as_secs_f64() * self.frame_index as f64;
        let data = self.frame_data(timestamp as f32);
        let plane = PlaneDescriptor::host(data, self.width, self.height, PixelFormat::Rgba8);
        self.frame_index += 1;
        Ok(Produced::Frame(DecodedFrame::new(vec![plane], timestamp)))
    }

    fn restart(&mut self) -> Result<(), SourceError> {
        self.frame_index = 0;
        Ok(())
    }
}
