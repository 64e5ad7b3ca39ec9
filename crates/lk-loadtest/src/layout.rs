/// Subscriber-side video layout: how many remote videos get which quality.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::rtc::VideoQuality;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Layout {
    /// One large speaker plus a strip of thumbnails.
    #[default]
    #[serde(rename = "speaker")]
    Speaker,
    #[serde(rename = "3x3")]
    Grid3x3,
    #[serde(rename = "4x4")]
    Grid4x4,
    #[serde(rename = "5x5")]
    Grid5x5,
}

impl Layout {
    /// Slots available for `quality`.
    pub fn capacity(self, quality: VideoQuality) -> usize {
        match (self, quality) {
            (Layout::Speaker, VideoQuality::High) => 1,
            (Layout::Speaker, VideoQuality::Low) => 5,
            (Layout::Grid3x3, VideoQuality::Medium) => 9,
            (Layout::Grid4x4, VideoQuality::Low) => 16,
            (Layout::Grid5x5, VideoQuality::Low) => 25,
            _ => 0,
        }
    }

    /// Quality for the next remote video given what is already assigned.
    /// Callers must hold the lock over `assigned` until the choice is recorded.
    pub fn select<'a>(self, assigned: impl IntoIterator<Item = &'a VideoQuality>) -> VideoQuality {
        let (mut high, mut medium, mut low) = (0usize, 0usize, 0usize);
        for quality in assigned {
            match quality {
                VideoQuality::High => high += 1,
                VideoQuality::Medium => medium += 1,
                VideoQuality::Low => low += 1,
                VideoQuality::Off => {}
            }
        }

        let order: &[(VideoQuality, usize)] = match self {
            Layout::Speaker => &[(VideoQuality::High, high), (VideoQuality::Low, low)],
            Layout::Grid3x3 => &[(VideoQuality::Medium, medium)],
            Layout::Grid4x4 | Layout::Grid5x5 => &[(VideoQuality::Low, low)],
        };
        order
            .iter()
            .find(|(quality, used)| *used < self.capacity(*quality))
            .map_or(VideoQuality::Off, |(quality, _)| *quality)
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Layout::Speaker => "speaker",
            Layout::Grid3x3 => "3x3",
            Layout::Grid4x4 => "4x4",
            Layout::Grid5x5 => "5x5",
        };
        f.write_str(s)
    }
}

impl FromStr for Layout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "speaker" => Ok(Layout::Speaker),
            "3x3" => Ok(Layout::Grid3x3),
            "4x4" => Ok(Layout::Grid4x4),
            "5x5" => Ok(Layout::Grid5x5),
            other => Err(format!("unknown layout {other:?} (expected speaker, 3x3, 4x4 or 5x5)")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(layout: Layout, n: usize) -> Vec<VideoQuality> {
        let mut assigned = Vec::new();
        for _ in 0..n {
            let q = layout.select(&assigned);
            assigned.push(q);
        }
        assigned
    }

    fn count(assigned: &[VideoQuality], q: VideoQuality) -> usize {
        assigned.iter().filter(|&&a| a == q).count()
    }

    #[test]
    fn speaker_layout() {
        let assigned = fill(Layout::Speaker, 10);
        assert_eq!(assigned[0], VideoQuality::High);
        assert!(assigned[1..6].iter().all(|&q| q == VideoQuality::Low));
        assert!(assigned[6..].iter().all(|&q| q == VideoQuality::Off));
    }

    #[test]
    fn grid_caps_are_exact() {
        for (layout, quality, cap) in [
            (Layout::Grid3x3, VideoQuality::Medium, 9),
            (Layout::Grid4x4, VideoQuality::Low, 16),
            (Layout::Grid5x5, VideoQuality::Low, 25),
        ] {
            let assigned = fill(layout, cap + 7);
            assert_eq!(count(&assigned, quality), cap, "{layout}");
            assert_eq!(count(&assigned, VideoQuality::Off), 7, "{layout}");
        }
    }

    #[test]
    fn freed_slot_is_reused() {
        let mut assigned = vec![VideoQuality::Off, VideoQuality::Low];
        assert_eq!(Layout::Speaker.select(&assigned), VideoQuality::High);
        assigned.push(VideoQuality::High);
        assert_eq!(Layout::Speaker.select(&assigned), VideoQuality::Low);
    }

    #[test]
    fn parse_and_display() {
        for name in ["speaker", "3x3", "4x4", "5x5"] {
            let layout: Layout = name.parse().unwrap();
            assert_eq!(layout.to_string(), name);
        }
        assert!("6x6".parse::<Layout>().is_err());
    }
}
