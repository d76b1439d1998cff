// packages/engine/src/dispatch/display.rs
//! Display size for a render
//!
//! Snippets may pin their own window size, either by assigning
//! `Window.size = (w, h)` or through `Config.set('graphics', 'width', n)`.
//! When they do, the virtual display is sized to match; otherwise 800x600.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

static WINDOW_SIZE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)Window\s*\.\s*size\s*=\s*(\([^)]*\)|\[[^\]]*\])").expect("valid regex")
});

static CONFIG_WIDTH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)Config\s*\.\s*set\s*\(\s*['"]graphics['"]\s*,\s*['"]width['"]\s*,\s*['"]?(\d+)['"]?\s*\)"#,
    )
    .expect("valid regex")
});

static CONFIG_HEIGHT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)Config\s*\.\s*set\s*\(\s*['"]graphics['"]\s*,\s*['"]height['"]\s*,\s*['"]?(\d+)['"]?\s*\)"#,
    )
    .expect("valid regex")
});

static NUMBER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+(?:\.\d+)?").expect("valid regex"));

/// Width and height of the virtual display, in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DisplaySize {
    pub width: u32,
    pub height: u32,
}

impl Default for DisplaySize {
    fn default() -> Self {
        Self {
            width: 800,
            height: 600,
        }
    }
}

impl fmt::Display for DisplaySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl DisplaySize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Size requested by the snippet itself, if any
    ///
    /// `Window.size` wins over `Config.set`. With `Config.set`, a missing
    /// dimension falls back to the default; the last assignment wins.
    pub fn detect(source: &str) -> Option<Self> {
        if let Some(captures) = WINDOW_SIZE_RE.captures(source) {
            if let Some(size) = first_two_numbers(&captures[1]) {
                return Some(size);
            }
        }

        let width = CONFIG_WIDTH_RE
            .captures_iter(source)
            .filter_map(|c| c[1].parse::<u32>().ok())
            .last();
        let height = CONFIG_HEIGHT_RE
            .captures_iter(source)
            .filter_map(|c| c[1].parse::<u32>().ok())
            .last();

        if width.is_none() && height.is_none() {
            return None;
        }

        let fallback = Self::default();
        Some(Self {
            width: width.filter(|w| *w > 0).unwrap_or(fallback.width),
            height: height.filter(|h| *h > 0).unwrap_or(fallback.height),
        })
    }

    /// Size to render `source` at, bounded by `max`
    pub fn for_source(source: &str, max: DisplaySize) -> Self {
        Self::detect(source).unwrap_or_default().clamp_to(max)
    }

    /// Shrink each dimension to at most `max`'s
    pub fn clamp_to(self, max: DisplaySize) -> Self {
        Self {
            width: self.width.min(max.width),
            height: self.height.min(max.height),
        }
    }
}

fn first_two_numbers(text: &str) -> Option<DisplaySize> {
    let mut numbers = NUMBER_RE
        .find_iter(text)
        .filter_map(|m| m.as_str().parse::<f64>().ok());

    let width = numbers.next()?;
    let height = numbers.next()?;

    if width >= 1.0 && height >= 1.0 && width <= u32::MAX as f64 && height <= u32::MAX as f64 {
        Some(DisplaySize::new(width as u32, height as u32))
    } else {
        None
    }
}
