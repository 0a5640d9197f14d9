use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use url::Url;

use super::mime::{self, MimeError};

static CSS_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"url\(["']?(.*?)["']?\)"#).expect("css url pattern compiles")
});

#[derive(Debug, thiserror::Error)]
pub enum PathError {
    #[error("url {0} has no host")]
    MissingHost(String),
    #[error("cannot determine a file extension for {url} (content type {content_type:?})")]
    UnknownContentType { url: String, content_type: String },
    #[error(transparent)]
    ContentType(#[from] MimeError),
}

#[derive(Debug, thiserror::Error)]
pub enum SaveError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Relative location of a mirrored artifact: the host followed by the path segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPath {
    segments: Vec<String>,
}

impl ArtifactPath {
    pub fn to_path(&self) -> PathBuf {
        self.segments.iter().collect()
    }

    /// Object-store key, always `/` separated.
    pub fn key(&self) -> String {
        self.segments.join("/")
    }
}

/// Maps a URL and its content type to `<host>/<path>[.ext]`.
///
/// Query and fragment are dropped, percent escapes stay as they are, an empty
/// trailing segment becomes `index`. The last extension registered for the
/// content type is appended unless the segment already carries one of them.
pub fn synthesise_path(url: &Url, content_type: &str) -> Result<ArtifactPath, PathError> {
    let host = url
        .host_str()
        .ok_or_else(|| PathError::MissingHost(url.to_string()))?;

    let mut segments = url.path().split('/').map(str::to_string).collect::<Vec<_>>();
    match segments.last_mut() {
        Some(last) if last.is_empty() => *last = "index".to_string(),
        None => segments.push("index".to_string()),
        _ => {}
    }

    let extensions = if content_type.trim().is_empty() {
        Vec::new()
    } else {
        mime::extensions_by_type(content_type)?
    };

    if let Some(last) = segments.last_mut() {
        let existing = current_extension(last);
        if extensions.is_empty() && existing.is_empty() {
            return Err(PathError::UnknownContentType {
                url: url.to_string(),
                content_type: content_type.to_string(),
            });
        }
        let matches = extensions
            .iter()
            .any(|ext| ext.eq_ignore_ascii_case(existing));
        if let Some(ext) = extensions.last().filter(|_| !matches) {
            last.push_str(ext);
        }
    }

    let mut out = vec![host.to_string()];
    out.extend(segments.into_iter().filter(|s| !s.is_empty()));
    Ok(ArtifactPath { segments: out })
}

fn current_extension(segment: &str) -> &str {
    segment.rfind('.').map(|idx| &segment[idx..]).unwrap_or("")
}

/// Static page that sends the browser on to `target` after one second.
pub fn redirect_stub(target: &str) -> Vec<u8> {
    format!(
        "<!DOCTYPE html><html lang=en><head><meta http-equiv=refresh content=\"1; url={target}\"><title>Redirecting</title></head><body><p>Redirecting you to <a href=\"{target}\">{target}</a>.</p></body></html>"
    )
    .into_bytes()
}

/// Every `url(...)` reference in a stylesheet, quotes optional.
pub fn find_css_urls(body: &[u8]) -> Vec<String> {
    let text = String::from_utf8_lossy(body);
    CSS_URL
        .captures_iter(&text)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

#[derive(Debug, Clone)]
pub struct SavedArtifact {
    pub local_path: PathBuf,
    pub key: String,
}

/// Writes artifacts below a mirror root.
#[derive(Debug, Clone)]
pub struct MirrorWriter {
    root: PathBuf,
}

impl MirrorWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn save(&self, url: &Url, content_type: &str, body: &[u8]) -> Result<SavedArtifact, SaveError> {
        let artifact = synthesise_path(url, content_type)?;
        let local_path = self.root.join(artifact.to_path());
        write_atomic(&local_path, body).map_err(|source| SaveError::Io {
            path: local_path.clone(),
            source,
        })?;
        Ok(SavedArtifact {
            local_path,
            key: artifact.key(),
        })
    }

    pub fn save_redirect_stub(&self, from: &Url, target: &Url) -> Result<SavedArtifact, SaveError> {
        self.save(from, "text/html", &redirect_stub(target.as_str()))
    }
}

fn write_atomic(path: &Path, body: &[u8]) -> io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    create_dirs(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(body)?;
    tmp.as_file().sync_all()?;
    set_file_mode(tmp.path())?;
    tmp.persist(path).map_err(|err| err.error)?;
    Ok(())
}

#[cfg(unix)]
fn create_dirs(dir: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().recursive(true).mode(0o755).create(dir)
}

#[cfg(not(unix))]
fn create_dirs(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)
}

#[cfg(unix)]
fn set_file_mode(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o644))
}

#[cfg(not(unix))]
fn set_file_mode(_path: &Path) -> io::Result<()> {
    Ok(())
}
