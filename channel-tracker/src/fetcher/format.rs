//! Metadata dump parsing and format selection.

use serde::Deserialize;

/// Subset of the JSON metadata dump that the tracker uses.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MediaInfo {
    pub id: String,
    pub title: Option<String>,
    pub is_live: Option<bool>,
    pub live_status: Option<String>,
    pub webpage_url: Option<String>,
    pub original_url: Option<String>,
    pub extractor: Option<String>,
    pub epoch: Option<i64>,
    pub formats: Vec<MediaFormat>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct MediaFormat {
    pub format_id: String,
    pub ext: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<f64>,
    pub tbr: Option<f64>,
    pub vbr: Option<f64>,
    pub vcodec: Option<String>,
    pub acodec: Option<String>,
    pub protocol: Option<String>,
}

impl MediaFormat {
    /// Total bitrate, falling back to the video bitrate.
    pub fn bitrate(&self) -> f64 {
        self.tbr.or(self.vbr).unwrap_or(0.0)
    }

    /// `WxH`, when both dimensions are known.
    pub fn resolution(&self) -> Option<String> {
        match (self.width, self.height) {
            (Some(w), Some(h)) => Some(format!("{w}x{h}")),
            _ => None,
        }
    }
}

impl MediaInfo {
    /// URL to hand to the downloader.
    pub fn url(&self) -> Option<&str> {
        self.original_url
            .as_deref()
            .or(self.webpage_url.as_deref())
    }
}

/// Best format with the given extension.
///
/// A candidate replaces the current pick when it is strictly taller and its
/// bitrate is not lower. Formats without a height are never chosen.
pub fn select_best<'a>(formats: &'a [MediaFormat], extension: &str) -> Option<&'a MediaFormat> {
    let mut best: Option<&MediaFormat> = None;
    let mut best_height = 0;
    let mut best_bitrate = 0.0;

    for format in formats
        .iter()
        .filter(|f| f.ext.as_deref() == Some(extension))
    {
        let height = format.height.unwrap_or(0);
        let bitrate = format.bitrate();
        if height > best_height && bitrate >= best_bitrate {
            best_height = height;
            best_bitrate = bitrate;
            best = Some(format);
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(id: &str, ext: &str, height: u32, tbr: f64) -> MediaFormat {
        MediaFormat {
            format_id: id.to_string(),
            ext: Some(ext.to_string()),
            width: Some(height * 16 / 9),
            height: Some(height),
            tbr: Some(tbr),
            ..MediaFormat::default()
        }
    }

    #[test]
    fn test_select_best_prefers_taller_mp4() {
        let formats = vec![
            format("360p", "mp4", 360, 800.0),
            format("1080p-webm", "webm", 1080, 9000.0),
            format("720p", "mp4", 720, 2500.0),
            format("480p", "mp4", 480, 1200.0),
        ];
        let best = select_best(&formats, "mp4").unwrap();
        assert_eq!(best.format_id, "720p");
        assert_eq!(best.resolution().as_deref(), Some("1280x720"));
    }

    #[test]
    fn test_taller_format_with_lower_bitrate_is_skipped() {
        let formats = vec![
            format("720p", "mp4", 720, 2500.0),
            format("1080p-starved", "mp4", 1080, 1000.0),
        ];
        assert_eq!(select_best(&formats, "mp4").unwrap().format_id, "720p");
    }

    #[test]
    fn test_no_matching_format() {
        let formats = vec![format("audio", "m4a", 0, 128.0)];
        assert!(select_best(&formats, "mp4").is_none());
    }

    #[test]
    fn test_parse_info_dump() {
        let json = r#"{
            "id": "v123",
            "is_live": true,
            "original_url": "https://example.com/alpha",
            "formats": [
                {"format_id": "hls-720p", "ext": "mp4", "width": 1280, "height": 720, "tbr": 2100.5},
                {"format_id": "audio_only", "ext": "mp4", "vcodec": "none", "tbr": 160}
            ]
        }"#;
        let info: MediaInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.url(), Some("https://example.com/alpha"));
        let best = select_best(&info.formats, "mp4").unwrap();
        assert_eq!(best.format_id, "hls-720p");
        assert_eq!(best.bitrate(), 2100.5);
    }
}
