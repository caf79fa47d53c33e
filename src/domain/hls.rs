use super::rendition::RenditionSpec;
use std::fmt::Write as _;
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

pub struct VariantStream {
    pub bandwidth: u64,
    pub resolution: String,
    pub uri: String,
}

/// Top-level playlist pointing at one media playlist per rendition.
pub struct MasterPlaylist {
    pub version: u8,
    pub variants: Vec<VariantStream>,
}

impl MasterPlaylist {
    pub fn new() -> Self {
        Self {
            version: 3,
            variants: Vec::new(),
        }
    }

    /// Variants in the order given, so identical ladders produce identical
    /// bytes.
    pub fn for_renditions(renditions: &[RenditionSpec]) -> Self {
        let mut playlist = Self::new();
        for rendition in renditions {
            playlist.add_variant(
                rendition.bandwidth(),
                rendition.resolution(),
                rendition.playlist_name(),
            );
        }
        playlist
    }

    pub fn add_variant(&mut self, bandwidth: u64, resolution: String, uri: String) {
        self.variants.push(VariantStream {
            bandwidth,
            resolution,
            uri,
        });
    }

    pub fn render(&self) -> String {
        let mut out = String::from("#EXTM3U\n");
        let _ = writeln!(out, "#EXT-X-VERSION:{}", self.version);
        for variant in &self.variants {
            let _ = writeln!(
                out,
                "#EXT-X-STREAM-INF:BANDWIDTH={},RESOLUTION={}",
                variant.bandwidth, variant.resolution
            );
            out.push_str(&variant.uri);
            out.push('\n');
        }
        out
    }

    pub async fn write_to(&self, path: &Path) -> Result<(), std::io::Error> {
        let mut file = File::create(path).await?;
        file.write_all(self.render().as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

impl Default for MasterPlaylist {
    fn default() -> Self {
        Self::new()
    }
}
