use std::path::{Path, PathBuf};

use bytes::Bytes;
use indexmap::IndexMap;

use super::{PreconditionError, UploadPolicy};

/// Where the bytes of a file part come from.
#[derive(Clone)]
pub enum BlobSource {
    Memory(Bytes),
    File { path: PathBuf, size: u64 },
}

impl std::fmt::Debug for BlobSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memory(data) => write!(f, "Memory({} bytes)", data.len()),
            Self::File { path, size } => write!(f, "File({}, {size} bytes)", path.display()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileBlob {
    pub file_name: String,
    pub content_type: mime::Mime,
    pub source: BlobSource,
}

impl FileBlob {
    pub fn from_bytes(
        file_name: impl Into<String>,
        content_type: mime::Mime,
        data: impl Into<Bytes>,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            content_type,
            source: BlobSource::Memory(data.into()),
        }
    }

    /// Reference a file on disk. Only its metadata is read here; the content
    /// is streamed by the transport on every attempt.
    pub async fn from_path(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_owned());
        Ok(Self {
            file_name,
            content_type: mime_guess::from_path(path).first_or_octet_stream(),
            source: BlobSource::File {
                path: path.to_owned(),
                size: metadata.len(),
            },
        })
    }

    pub fn size(&self) -> u64 {
        match &self.source {
            BlobSource::Memory(data) => data.len() as u64,
            BlobSource::File { size, .. } => *size,
        }
    }
}

/// A single create or update of a record, submitted as a multipart form.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub collection: String,
    /// Present for an update, absent for a create.
    pub record_id: Option<String>,
    pub fields: IndexMap<String, String>,
    pub files: IndexMap<String, FileBlob>,
    /// File fields that must be attached when creating a record.
    pub required_files: Vec<String>,
}

impl UploadRequest {
    pub fn create(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            record_id: None,
            fields: IndexMap::new(),
            files: IndexMap::new(),
            required_files: Vec::new(),
        }
    }

    pub fn update(collection: impl Into<String>, record_id: impl Into<String>) -> Self {
        Self {
            record_id: Some(record_id.into()),
            ..Self::create(collection)
        }
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn file(mut self, name: impl Into<String>, blob: FileBlob) -> Self {
        self.files.insert(name.into(), blob);
        self
    }

    pub fn require_file(mut self, name: impl Into<String>) -> Self {
        self.required_files.push(name.into());
        self
    }

    pub fn is_create(&self) -> bool {
        self.record_id.is_none()
    }

    pub fn total_file_bytes(&self) -> u64 {
        self.files.values().map(FileBlob::size).sum()
    }

    pub(crate) fn check(&self, policy: &UploadPolicy) -> Result<(), PreconditionError> {
        if self.is_create() {
            if let Some(missing) = self
                .required_files
                .iter()
                .find(|name| !self.files.contains_key(name.as_str()))
            {
                return Err(PreconditionError::MissingFile(missing.clone()));
            }
        }
        for (field, blob) in &self.files {
            let size = blob.size();
            if size > policy.max_file_size {
                return Err(PreconditionError::FileTooLarge {
                    field: field.clone(),
                    size,
                    limit: policy.max_file_size,
                });
            }
        }
        Ok(())
    }
}
