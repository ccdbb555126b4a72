use std::fs;
use std::path::{Path, PathBuf};

use crate::record::Artifact;
use crate::Result;

/// Destination for a finished recording.
pub trait ArtifactSink {
    fn deliver(&mut self, artifact: &Artifact) -> Result<()>;
}

/// Writes the video and thumbnail into a directory, creating it if needed.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn video_path(&self, mime_type: &str) -> PathBuf {
        self.dir.join(format!("video.{}", extension_for(mime_type)))
    }

    pub fn thumbnail_path(&self) -> PathBuf {
        self.dir.join("thumbnail.png")
    }
}

impl ArtifactSink for DirectorySink {
    fn deliver(&mut self, artifact: &Artifact) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let video = self.video_path(&artifact.mime_type);
        fs::write(&video, &artifact.video)?;
        let thumbnail = self.thumbnail_path();
        fs::write(&thumbnail, &artifact.thumbnail_png)?;
        tracing::info!(video = %video.display(), thumbnail = %thumbnail.display(), "artifact written");
        Ok(())
    }
}

fn extension_for(mime_type: &str) -> &'static str {
    let base = mime_type.split(';').next().unwrap_or_default().trim();
    match base {
        "video/x-matroska" => "mkv",
        "video/webm" => "webm",
        "video/mp4" => "mp4",
        _ => "bin",
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    #[test]
    fn writes_video_and_thumbnail() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("nested");
        let mut sink = DirectorySink::new(&out);
        let artifact = Artifact {
            video: Bytes::from_static(b"video"),
            mime_type: "video/x-matroska".into(),
            thumbnail_png: Bytes::from_static(b"png"),
        };

        sink.deliver(&artifact).unwrap();
        assert_eq!(fs::read(out.join("video.mkv")).unwrap(), b"video");
        assert_eq!(fs::read(out.join("thumbnail.png")).unwrap(), b"png");
    }

    #[test]
    fn codec_parameters_do_not_change_the_extension() {
        assert_eq!(extension_for("video/webm;codecs=vp9,opus"), "webm");
        assert_eq!(extension_for("application/octet-stream"), "bin");
    }
}
