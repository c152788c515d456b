//! Upload task model.
//!
//! An [`UploadTask`] only changes through the transition methods below, so
//! every caller gets the same lifecycle rules: terminal states are final and
//! progress never goes backwards.

use std::fmt;
use std::path::Path;

use bytes::Bytes;
use serde::Serialize;
use uuid::Uuid;

/// MIME types the uploader recognizes as images.
pub const SUPPORTED_IMAGE_TYPES: &[&str] = &[
    "image/jpeg",
    "image/png",
    "image/webp",
    "image/gif",
    "image/svg+xml",
];

/// Content type for files with an unrecognized extension.
pub const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A selected file: name, type and its bytes.
#[derive(Clone)]
pub struct FileRef {
    pub name: String,
    pub content_type: String,
    pub data: Bytes,
}

impl fmt::Debug for FileRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileRef")
            .field("name", &self.name)
            .field("content_type", &self.content_type)
            .field("size", &self.size())
            .finish()
    }
}

impl FileRef {
    pub fn new(name: impl Into<String>, content_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            content_type: content_type.into(),
            data: data.into(),
        }
    }

    /// Read a file from disk, guessing its content type from the extension.
    pub async fn from_path(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let data = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let content_type = guess_content_type(&name);
        Ok(Self::new(name, content_type, data))
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_image(&self) -> bool {
        SUPPORTED_IMAGE_TYPES.contains(&self.content_type.as_str())
    }
}

/// Guess a content type from a file name's extension.
pub fn guess_content_type(name: &str) -> &'static str {
    let ext = Path::new(name)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase());
    match ext.as_deref() {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        _ => FALLBACK_CONTENT_TYPE,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Uploading,
    Completed,
    Error,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Error | TaskStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Uploading => "uploading",
            TaskStatus::Completed => "completed",
            TaskStatus::Error => "error",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque handle to a transient preview of a selected file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewHandle(pub String);

/// Opens and releases previews for selected files.
pub trait PreviewProvider: Send + Sync + 'static {
    fn open(&self, file: &FileRef) -> Option<PreviewHandle>;

    fn release(&self, handle: PreviewHandle);
}

/// Provider for headless use: no previews.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPreview;

impl PreviewProvider for NoPreview {
    fn open(&self, _file: &FileRef) -> Option<PreviewHandle> {
        None
    }

    fn release(&self, _handle: PreviewHandle) {}
}

/// One file's upload lifecycle.
#[derive(Debug, Clone)]
pub struct UploadTask {
    pub id: TaskId,
    pub file: FileRef,
    /// Percent in `[0, 100]`.
    pub progress: f64,
    pub status: TaskStatus,
    /// Set iff `status` is `Completed`.
    pub public_url: Option<String>,
    /// Set iff `status` is `Error`.
    pub error: Option<String>,
    pub preview: Option<PreviewHandle>,
    pub description: Option<String>,
    pub analyzing: bool,
    pub description_error: Option<String>,
}

impl UploadTask {
    pub fn new(file: FileRef, preview: Option<PreviewHandle>) -> Self {
        Self {
            id: TaskId::new(),
            file,
            progress: 0.0,
            status: TaskStatus::Pending,
            public_url: None,
            error: None,
            preview,
            description: None,
            analyzing: false,
            description_error: None,
        }
    }

    /// `pending -> uploading`. Returns false for any other state.
    pub fn begin(&mut self) -> bool {
        if self.status != TaskStatus::Pending {
            return false;
        }
        self.status = TaskStatus::Uploading;
        true
    }

    /// Raise progress to `percent`. Ignored unless uploading or if lower.
    pub fn advance(&mut self, percent: f64) {
        if self.status != TaskStatus::Uploading || !percent.is_finite() {
            return;
        }
        let percent = percent.clamp(0.0, 100.0);
        if percent > self.progress {
            self.progress = percent;
        }
    }

    /// `uploading -> completed`.
    pub fn complete(&mut self, public_url: String) -> bool {
        if self.status != TaskStatus::Uploading {
            return false;
        }
        self.status = TaskStatus::Completed;
        self.progress = 100.0;
        self.public_url = Some(public_url);
        true
    }

    /// `uploading -> error`.
    pub fn fail(&mut self, message: String) -> bool {
        if self.status != TaskStatus::Uploading {
            return false;
        }
        self.status = TaskStatus::Error;
        self.error = Some(message);
        true
    }

    /// `pending | uploading -> cancelled`.
    pub fn cancel(&mut self) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = TaskStatus::Cancelled;
        true
    }
}
