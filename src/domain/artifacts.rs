//! Object key scheme for published videos.

use super::jobs::VideoId;
use super::rendition::RenditionSpec;
use std::collections::BTreeSet;
use uuid::Uuid;

pub const MASTER_PLAYLIST: &str = "master.m3u8";

pub fn video_prefix(video_id: &VideoId) -> String {
    format!("videos/{}/", video_id)
}

pub fn artifact_key(video_id: &VideoId, file_name: &str) -> String {
    format!("{}{}", video_prefix(video_id), file_name)
}

pub fn master_key(video_id: &VideoId) -> String {
    artifact_key(video_id, MASTER_PLAYLIST)
}

/// Where submitted bytes are parked until a worker picks the job up. Each
/// submission gets its own key, so a losing duplicate never overwrites the
/// upload a record points at.
pub fn upload_key(video_id: &VideoId, submission: &Uuid) -> String {
    format!("uploads/{}/{}", video_id, submission)
}

pub fn content_type_for(file_name: &str) -> &'static str {
    if file_name.ends_with(".m3u8") {
        "application/vnd.apple.mpegurl"
    } else if file_name.ends_with(".ts") {
        "video/MP2T"
    } else {
        "application/octet-stream"
    }
}

/// Keys that must all be listed under the video prefix before the video may
/// be reported as processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSet {
    expected: BTreeSet<String>,
}

impl ArtifactSet {
    /// Master playlist plus one playlist per rendition.
    pub fn for_video(video_id: &VideoId, renditions: &[RenditionSpec]) -> Self {
        let mut expected: BTreeSet<String> = renditions
            .iter()
            .map(|r| artifact_key(video_id, &r.playlist_name()))
            .collect();
        expected.insert(master_key(video_id));
        Self { expected }
    }

    /// Also require keys the run uploaded (segments).
    pub fn require<I: IntoIterator<Item = String>>(&mut self, keys: I) {
        self.expected.extend(keys);
    }

    pub fn expected(&self) -> &BTreeSet<String> {
        &self.expected
    }

    pub fn missing_from(&self, listed: &BTreeSet<String>) -> Vec<String> {
        self.expected.difference(listed).cloned().collect()
    }

    pub fn is_complete(&self, listed: &BTreeSet<String>) -> bool {
        self.expected.is_subset(listed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::rendition::RENDITIONS;

    #[test]
    fn test_expected_keys() {
        let id = VideoId::new("abc").unwrap();
        let set = ArtifactSet::for_video(&id, &RENDITIONS);
        let keys: Vec<&str> = set.expected().iter().map(String::as_str).collect();
        assert_eq!(
            keys,
            vec![
                "videos/abc/1080p.m3u8",
                "videos/abc/360p.m3u8",
                "videos/abc/720p.m3u8",
                "videos/abc/master.m3u8",
            ]
        );
    }

    #[test]
    fn test_partial_listing_is_incomplete() {
        let id = VideoId::new("abc").unwrap();
        let set = ArtifactSet::for_video(&id, &RENDITIONS);
        let listed: BTreeSet<String> = [
            "videos/abc/master.m3u8",
            "videos/abc/1080p.m3u8",
            "videos/abc/720p.m3u8",
            "videos/abc/720p_000.ts",
        ]
        .into_iter()
        .map(String::from)
        .collect();

        assert!(!set.is_complete(&listed));
        assert_eq!(set.missing_from(&listed), vec!["videos/abc/360p.m3u8"]);
    }

    #[test]
    fn test_required_segments() {
        let id = VideoId::new("abc").unwrap();
        let mut set = ArtifactSet::for_video(&id, &RENDITIONS[..1]);
        set.require(vec![artifact_key(&id, "1080p_000.ts")]);
        let mut listed: BTreeSet<String> =
            ["videos/abc/master.m3u8", "videos/abc/1080p.m3u8"]
                .into_iter()
                .map(String::from)
                .collect();
        assert!(!set.is_complete(&listed));
        listed.insert("videos/abc/1080p_000.ts".into());
        assert!(set.is_complete(&listed));
    }

    #[test]
    fn test_content_types() {
        assert_eq!(content_type_for("master.m3u8"), "application/vnd.apple.mpegurl");
        assert_eq!(content_type_for("720p_001.ts"), "video/MP2T");
        assert_eq!(content_type_for("notes.txt"), "application/octet-stream");
    }
}
