//! Admin forms of the library, turned into upload requests.

use chrono::NaiveDate;

use crate::upload::{FileBlob, UploadRequest};

pub const BOOKS_COLLECTION: &str = "books";
pub const COVER_FIELD: &str = "coverImage";
pub const DOCUMENT_FIELD: &str = "pdfFile";

pub const SITE_SETTINGS_COLLECTION: &str = "site_settings";
pub const HERO_PHOTO_FIELD: &str = "hero_photo";

#[derive(Debug, Clone, Default)]
pub struct BookForm {
    pub title: String,
    pub author: String,
    pub description: String,
    /// Id of the category record.
    pub category: String,
    pub isbn: String,
    pub published_date: Option<NaiveDate>,
    pub edition: String,
    pub subtitle: String,
    pub cover: Option<FileBlob>,
    pub document: Option<FileBlob>,
}

impl BookForm {
    /// Build the request for a new book (`record_id` absent) or an edit.
    /// A new book needs both the cover and the document; an edit keeps the
    /// stored files unless replacements are attached.
    pub fn into_request(self, record_id: Option<String>) -> UploadRequest {
        let request = match record_id {
            Some(id) => UploadRequest::update(BOOKS_COLLECTION, id),
            None => UploadRequest::create(BOOKS_COLLECTION),
        };
        let published_date = self
            .published_date
            .map(|date| date.format("%Y-%m-%d").to_string())
            .unwrap_or_default();
        let mut request = request
            .field("title", self.title)
            .field("author", self.author)
            .field("description", self.description)
            .field("category", self.category)
            .field("isbn", self.isbn)
            .field("published_date", published_date)
            .field("edition", self.edition)
            .field("subtitle", self.subtitle)
            .require_file(COVER_FIELD)
            .require_file(DOCUMENT_FIELD);
        if let Some(cover) = self.cover {
            request = request.file(COVER_FIELD, cover);
        }
        if let Some(document) = self.document {
            request = request.file(DOCUMENT_FIELD, document);
        }
        request
    }
}

/// Site-wide display settings. There is a single record of this collection.
#[derive(Debug, Clone, Default)]
pub struct SiteSettingsForm {
    pub site_title: String,
    pub site_description: String,
    pub subtitle: String,
    pub quote: String,
    pub quote_name: String,
    pub hero_caption: String,
    pub hero_photo: Option<FileBlob>,
}

impl SiteSettingsForm {
    pub fn into_request(self, record_id: Option<String>) -> UploadRequest {
        let request = match record_id {
            Some(id) => UploadRequest::update(SITE_SETTINGS_COLLECTION, id),
            None => UploadRequest::create(SITE_SETTINGS_COLLECTION),
        };
        let request = request
            .field("site_title", self.site_title)
            .field("site_description", self.site_description)
            .field("subtitle", self.subtitle)
            .field("quote", self.quote)
            .field("quote_name", self.quote_name)
            .field("hero_caption", self.hero_caption);
        match self.hero_photo {
            Some(photo) => request.file(HERO_PHOTO_FIELD, photo),
            None => request,
        }
    }
}

pub const CATEGORIES_COLLECTION: &str = "categories";

/// A new book category. Categories carry no files.
#[derive(Debug, Clone, Default)]
pub struct CategoryForm {
    pub name: String,
}

impl CategoryForm {
    pub fn into_request(self) -> UploadRequest {
        UploadRequest::create(CATEGORIES_COLLECTION).field("name", self.name)
    }
}
