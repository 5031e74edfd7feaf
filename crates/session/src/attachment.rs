//! Image attachments: encoding raw files into transport-safe payloads and tracking
//! the transient previews shown while composing.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use base64::Engine as _;
use snafu::ResultExt;

use crate::error::{ReadAttachmentSnafu, SessionResult};

pub const DEFAULT_MAX_ATTACHMENTS_PER_MESSAGE: usize = 4;
pub const DEFAULT_MAX_ATTACHMENT_BYTES: u64 = 20 * 1024 * 1024;

/// Raw file offered by the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHandle {
    pub file_name: String,
    /// Declared media type; guessed from the file name when absent.
    pub media_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl FileHandle {
    pub fn new(file_name: impl Into<String>, media_type: Option<String>, bytes: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            media_type,
            bytes,
        }
    }

    pub fn from_path(path: &Path) -> SessionResult<Self> {
        let bytes = std::fs::read(path).context(ReadAttachmentSnafu {
            stage: "attachment-read-file",
            path: path.display().to_string(),
        })?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        Ok(Self::new(file_name, None, bytes))
    }

    pub fn resolved_media_type(&self) -> String {
        self.media_type
            .as_deref()
            .map(str::trim)
            .filter(|media_type| !media_type.is_empty())
            .map(str::to_ascii_lowercase)
            .unwrap_or_else(|| {
                mime_guess::from_path(&self.file_name)
                    .first()
                    .map(|mime| mime.essence_str().to_owned())
                    .unwrap_or_else(|| "application/octet-stream".to_string())
            })
    }
}

/// Tracks live previews so each one is released exactly once.
#[derive(Debug, Default)]
pub struct PreviewRegistry {
    next_id: AtomicU64,
    live: Mutex<HashSet<u64>>,
}

impl PreviewRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().map(|live| live.len()).unwrap_or(0)
    }

    fn acquire(self: &Arc<Self>) -> PreviewHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut live) = self.live.lock() {
            live.insert(id);
        }

        PreviewHandle {
            id,
            registry: Arc::clone(self),
        }
    }

    fn release(&self, id: u64) {
        let released = self
            .live
            .lock()
            .map(|mut live| live.remove(&id))
            .unwrap_or(false);
        if !released {
            tracing::warn!(preview_id = id, "preview released twice or never registered");
        }
    }
}

/// Session-local render resource for an attachment; released on drop.
pub struct PreviewHandle {
    id: u64,
    registry: Arc<PreviewRegistry>,
}

impl PreviewHandle {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl fmt::Debug for PreviewHandle {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("PreviewHandle")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl Drop for PreviewHandle {
    fn drop(&mut self) {
        self.registry.release(self.id);
    }
}

/// Encoded image owned by a message or by the staging area.
#[derive(Debug)]
pub struct Attachment {
    pub file_name: String,
    pub media_type: String,
    /// Standard base64 of the original bytes, shared with every view of it.
    pub encoded_payload: Arc<str>,
    pub size_bytes: u64,
    /// Never persisted; absent for attachments restored from storage.
    pub preview: Option<PreviewHandle>,
}

impl Attachment {
    pub fn new(
        file_name: impl Into<String>,
        media_type: impl Into<String>,
        encoded_payload: impl Into<Arc<str>>,
        size_bytes: u64,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            media_type: media_type.into(),
            encoded_payload: encoded_payload.into(),
            size_bytes,
            preview: None,
        }
    }

    pub fn preview_id(&self) -> Option<u64> {
        self.preview.as_ref().map(PreviewHandle::id)
    }

    pub fn data_url(&self) -> String {
        data_url(&self.media_type, &self.encoded_payload)
    }
}

impl PartialEq for Attachment {
    fn eq(&self, other: &Self) -> bool {
        self.file_name == other.file_name
            && self.media_type == other.media_type
            && self.encoded_payload == other.encoded_payload
            && self.size_bytes == other.size_bytes
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachmentLimits {
    pub max_per_message: usize,
    pub max_bytes: u64,
}

impl Default for AttachmentLimits {
    fn default() -> Self {
        Self {
            max_per_message: DEFAULT_MAX_ATTACHMENTS_PER_MESSAGE,
            max_bytes: DEFAULT_MAX_ATTACHMENT_BYTES,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AttachmentEncoder {
    limits: AttachmentLimits,
    previews: Arc<PreviewRegistry>,
}

impl AttachmentEncoder {
    pub fn new(limits: AttachmentLimits, previews: Arc<PreviewRegistry>) -> Self {
        Self { limits, previews }
    }

    pub fn limits(&self) -> AttachmentLimits {
        self.limits
    }

    pub fn previews(&self) -> &Arc<PreviewRegistry> {
        &self.previews
    }

    /// Encodes the accepted subset of `files`.
    ///
    /// Non-images, oversized files and names in `reserved_names` (or repeated within
    /// the batch) are skipped without error. At most `available_slots` are returned.
    pub fn encode(
        &self,
        files: Vec<FileHandle>,
        reserved_names: &[&str],
        available_slots: usize,
    ) -> Vec<Attachment> {
        let mut seen = reserved_names
            .iter()
            .map(|name| name.to_string())
            .collect::<HashSet<_>>();
        let mut accepted = Vec::new();

        for file in files {
            let media_type = file.resolved_media_type();
            if !media_type.starts_with("image/") {
                tracing::debug!(
                    file_name = %file.file_name,
                    media_type = %media_type,
                    "skipping non-image attachment"
                );
                continue;
            }

            if file.bytes.len() as u64 > self.limits.max_bytes {
                tracing::debug!(
                    file_name = %file.file_name,
                    size_bytes = file.bytes.len(),
                    max_bytes = self.limits.max_bytes,
                    "skipping oversized attachment"
                );
                continue;
            }

            if !seen.insert(file.file_name.clone()) {
                tracing::debug!(file_name = %file.file_name, "skipping duplicate attachment");
                continue;
            }

            if accepted.len() >= available_slots {
                tracing::debug!(
                    file_name = %file.file_name,
                    max_per_message = self.limits.max_per_message,
                    "attachment limit reached"
                );
                break;
            }

            let encoded_payload = base64::engine::general_purpose::STANDARD.encode(&file.bytes);
            accepted.push(Attachment {
                file_name: file.file_name,
                media_type,
                encoded_payload: encoded_payload.into(),
                size_bytes: file.bytes.len() as u64,
                preview: Some(self.previews.acquire()),
            });
        }

        accepted
    }
}

/// Attachments staged for the next outgoing message.
#[derive(Debug)]
pub struct PendingAttachments {
    encoder: AttachmentEncoder,
    staged: Vec<Attachment>,
}

impl PendingAttachments {
    pub fn new(encoder: AttachmentEncoder) -> Self {
        Self {
            encoder,
            staged: Vec::new(),
        }
    }

    pub fn as_slice(&self) -> &[Attachment] {
        &self.staged
    }

    pub fn len(&self) -> usize {
        self.staged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    /// Stages the accepted subset and returns how many were added.
    pub fn add(&mut self, files: Vec<FileHandle>) -> usize {
        let reserved = self
            .staged
            .iter()
            .map(|attachment| attachment.file_name.as_str())
            .collect::<Vec<_>>();
        let available = self
            .encoder
            .limits()
            .max_per_message
            .saturating_sub(self.staged.len());
        let accepted = self.encoder.encode(files, &reserved, available);
        let added = accepted.len();
        self.staged.extend(accepted);
        added
    }

    /// Removes one staged attachment, releasing its preview.
    pub fn remove(&mut self, index: usize) -> bool {
        if index >= self.staged.len() {
            return false;
        }

        drop(self.staged.remove(index));
        true
    }

    /// Moves every staged attachment out, previews included.
    pub fn take(&mut self) -> Vec<Attachment> {
        std::mem::take(&mut self.staged)
    }

    pub fn clear(&mut self) {
        self.staged.clear();
    }
}

pub fn data_url(media_type: &str, encoded_payload: &str) -> String {
    format!("data:{media_type};base64,{encoded_payload}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png(name: &str) -> FileHandle {
        FileHandle::new(name, Some("image/png".to_string()), vec![0x89, b'P', b'N', b'G'])
    }

    fn pending(max_per_message: usize) -> (PendingAttachments, Arc<PreviewRegistry>) {
        let previews = PreviewRegistry::new();
        let encoder = AttachmentEncoder::new(
            AttachmentLimits {
                max_per_message,
                max_bytes: 1024,
            },
            Arc::clone(&previews),
        );
        (PendingAttachments::new(encoder), previews)
    }

    #[test]
    fn non_images_are_skipped_silently() {
        let (mut staged, _) = pending(4);
        let added = staged.add(vec![
            FileHandle::new("notes.txt", None, b"hello".to_vec()),
            FileHandle::new("photo.jpg", None, vec![1, 2, 3]),
        ]);

        assert_eq!(added, 1);
        assert_eq!(staged.as_slice()[0].file_name, "photo.jpg");
        assert_eq!(staged.as_slice()[0].media_type, "image/jpeg");
        assert_eq!(&*staged.as_slice()[0].encoded_payload, "AQID");
    }

    #[test]
    fn duplicate_names_fold_into_one() {
        let (mut staged, previews) = pending(4);
        assert_eq!(staged.add(vec![png("a.png")]), 1);
        assert_eq!(staged.add(vec![png("a.png"), png("a.png")]), 0);
        assert_eq!(staged.len(), 1);
        assert_eq!(previews.live_count(), 1);
    }

    #[test]
    fn reserved_names_are_not_restaged() {
        let (staged, _) = pending(4);
        let accepted = staged
            .encoder
            .encode(vec![png("kept.png"), png("new.png")], &["kept.png"], 4);
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].file_name, "new.png");
    }

    #[test]
    fn limit_caps_the_batch() {
        let (mut staged, _) = pending(2);
        let added = staged.add(vec![png("1.png"), png("2.png"), png("3.png")]);
        assert_eq!(added, 2);
        assert_eq!(staged.add(vec![png("4.png")]), 0);
    }

    #[test]
    fn oversized_files_are_skipped() {
        let (mut staged, _) = pending(4);
        let big = FileHandle::new("big.png", None, vec![0; 2048]);
        assert_eq!(staged.add(vec![big]), 0);
    }

    #[test]
    fn previews_are_released_once_on_remove_or_drop() {
        let (mut staged, previews) = pending(4);
        staged.add(vec![png("a.png"), png("b.png")]);
        assert_eq!(previews.live_count(), 2);

        assert!(staged.remove(0));
        assert!(!staged.remove(5));
        assert_eq!(previews.live_count(), 1);

        let taken = staged.take();
        assert!(staged.is_empty());
        assert_eq!(previews.live_count(), 1);

        drop(taken);
        assert_eq!(previews.live_count(), 0);
    }

    #[test]
    fn restored_attachments_have_no_preview() {
        let attachment = Attachment::new("x.png", "image/png", "AAAA", 3);
        assert_eq!(attachment.preview_id(), None);
        assert_eq!(attachment.data_url(), "data:image/png;base64,AAAA");
    }

    #[test]
    fn staged_attachments_carry_distinct_previews() {
        let (mut staged, _) = pending(4);
        staged.add(vec![png("a.png"), png("b.png")]);
        let ids = staged
            .as_slice()
            .iter()
            .map(Attachment::preview_id)
            .collect::<Vec<_>>();
        assert!(ids.iter().all(Option::is_some));
        assert_ne!(ids[0], ids[1]);
    }
}
