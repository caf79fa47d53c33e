use serde::Serialize;

/// One output resolution of the adaptive stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RenditionSpec {
    pub name: &'static str,
    pub width: u32,
    pub height: u32,
}

/// Bits per second per pixel used for the `BANDWIDTH` attribute.
pub const BANDWIDTH_PER_PIXEL: f64 = 2.5;

/// Rendition ladder, highest first. The master playlist lists renditions in
/// this order.
pub const RENDITIONS: [RenditionSpec; 3] = [
    RenditionSpec {
        name: "1080p",
        width: 1920,
        height: 1080,
    },
    RenditionSpec {
        name: "720p",
        width: 1280,
        height: 720,
    },
    RenditionSpec {
        name: "360p",
        width: 640,
        height: 360,
    },
];

impl RenditionSpec {
    pub fn playlist_name(&self) -> String {
        format!("{}.m3u8", self.name)
    }

    /// ffmpeg `-hls_segment_filename` pattern.
    pub fn segment_pattern(&self) -> String {
        format!("{}_%03d.ts", self.name)
    }

    pub fn is_segment_of(&self, file_name: &str) -> bool {
        file_name
            .strip_prefix(self.name)
            .and_then(|rest| rest.strip_prefix('_'))
            .and_then(|rest| rest.strip_suffix(".ts"))
            .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
    }

    pub fn bandwidth(&self) -> u64 {
        (f64::from(self.width) * f64::from(self.height) * BANDWIDTH_PER_PIXEL).round() as u64
    }

    pub fn resolution(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bandwidth_estimate() {
        assert_eq!(RENDITIONS[0].bandwidth(), 5_184_000);
        assert_eq!(RENDITIONS[1].bandwidth(), 2_304_000);
        assert_eq!(RENDITIONS[2].bandwidth(), 576_000);
    }

    #[test]
    fn test_segment_matching() {
        let r = RENDITIONS[1];
        assert!(r.is_segment_of("720p_000.ts"));
        assert!(r.is_segment_of("720p_1234.ts"));
        assert!(!r.is_segment_of("720p.m3u8"));
        assert!(!r.is_segment_of("1080p_000.ts"));
        assert!(!r.is_segment_of("720p_.ts"));
        assert!(!r.is_segment_of("720p_00a.ts"));
    }
}
