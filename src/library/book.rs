//! Book metadata model.

use chrono::{DateTime, Utc};
use std::path::PathBuf;
use uuid::Uuid;

/// Supported book formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BookFormat {
    /// EPUB format (Electronic Publication).
    Epub,
    /// PDF format (Portable Document Format).
    Pdf,
    /// MOBI format (Mobipocket eBook).
    Mobi,
    /// Kindle formats (AZW, AZW3).
    Azw,
    /// FB2 format (FictionBook).
    Fb2,
    /// DjVu scanned documents.
    Djvu,
    /// CBZ format (Comic Book ZIP archive).
    Cbz,
    /// CBR format (Comic Book RAR archive).
    Cbr,
    /// Plain text format.
    Txt,
    /// Rich Text Format.
    Rtf,
}

impl BookFormat {
    /// Get the MIME type for this format.
    pub fn mime_type(&self) -> &'static str {
        match self {
            BookFormat::Epub => "application/epub+zip",
            BookFormat::Pdf => "application/pdf",
            BookFormat::Mobi => "application/x-mobipocket-ebook",
            BookFormat::Azw => "application/vnd.amazon.ebook",
            BookFormat::Fb2 => "application/x-fictionbook+xml",
            BookFormat::Djvu => "image/vnd.djvu",
            BookFormat::Cbz => "application/x-cbz",
            BookFormat::Cbr => "application/x-cbr",
            BookFormat::Txt => "text/plain; charset=utf-8",
            BookFormat::Rtf => "application/rtf",
        }
    }

    /// Try to detect format from a Calibre format name or file extension.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "epub" => Some(BookFormat::Epub),
            "pdf" => Some(BookFormat::Pdf),
            "mobi" => Some(BookFormat::Mobi),
            "azw" | "azw3" => Some(BookFormat::Azw),
            "fb2" => Some(BookFormat::Fb2),
            "djvu" => Some(BookFormat::Djvu),
            "cbz" => Some(BookFormat::Cbz),
            "cbr" => Some(BookFormat::Cbr),
            "txt" => Some(BookFormat::Txt),
            "rtf" => Some(BookFormat::Rtf),
            _ => None,
        }
    }

    /// MIME type for an arbitrary format name, falling back to a binary stream.
    pub fn mime_for(format: &str) -> &'static str {
        Self::from_extension(format)
            .map(|f| f.mime_type())
            .unwrap_or("application/octet-stream")
    }
}

/// Author reference attached to a book.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorRef {
    /// Calibre author id.
    pub id: i64,
    /// Display name.
    pub name: String,
}

/// Series reference attached to a book.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesRef {
    /// Calibre series id.
    pub id: i64,
    /// Series name.
    pub name: String,
}

/// One stored file of a book (a row of Calibre's `data` table).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookFile {
    /// Format name as Calibre stores it (upper case, e.g. "EPUB").
    pub format: String,
    /// File stem inside the book folder.
    pub name: String,
    /// Uncompressed size in bytes.
    pub size: Option<i64>,
}

impl BookFile {
    /// Lower-case format, used in URLs and file extensions.
    pub fn extension(&self) -> String {
        self.format.to_lowercase()
    }

    /// MIME type of this file.
    pub fn mime_type(&self) -> &'static str {
        BookFormat::mime_for(&self.format)
    }

    /// File name on disk, relative to the book folder.
    pub fn file_name(&self) -> String {
        format!("{}.{}", self.name, self.extension())
    }
}

/// A book as read from the Calibre catalog.
#[derive(Debug, Clone)]
pub struct Book {
    /// Calibre book id.
    pub id: i64,

    /// Book title.
    pub title: String,

    /// Authors in link order (may be empty for broken catalogs).
    pub authors: Vec<AuthorRef>,

    /// Series, if the book belongs to one.
    pub series: Option<SeriesRef>,

    /// Position in series.
    pub series_index: f64,

    /// Tag names.
    pub tags: Vec<String>,

    /// Available files.
    pub files: Vec<BookFile>,

    /// Calibre UUID.
    pub uuid: Option<String>,

    /// Description (HTML from Calibre's comments).
    pub description: Option<String>,

    /// Whether `cover.jpg` exists in the book folder.
    pub has_cover: bool,

    /// Book folder relative to the library root.
    pub path: PathBuf,

    /// When the book was added to the library.
    pub added: DateTime<Utc>,

    /// Publication date, if set.
    pub published: Option<DateTime<Utc>>,

    /// Last metadata change.
    pub modified: DateTime<Utc>,
}

impl Book {
    /// Stable Atom identifier for this book.
    pub fn urn(&self) -> String {
        match &self.uuid {
            Some(uuid) if !uuid.is_empty() => format!("urn:uuid:{}", uuid),
            _ => {
                let name = format!("calibre:book:{}", self.id);
                format!("urn:uuid:{}", Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes()))
            }
        }
    }

    /// Get display name for authors.
    pub fn authors_display(&self) -> String {
        if self.authors.is_empty() {
            "Unknown Author".to_string()
        } else {
            self.authors
                .iter()
                .map(|a| a.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        }
    }

    /// Find a file by format name, case-insensitively.
    pub fn file(&self, format: &str) -> Option<&BookFile> {
        self.files
            .iter()
            .find(|f| f.format.eq_ignore_ascii_case(format))
    }

    /// Download file name derived from the title.
    pub fn download_filename(&self, extension: &str) -> String {
        let mut title: String = self
            .title
            .chars()
            .map(|c| match c {
                '\\' | '/' | '*' | '?' | ':' | '"' | '<' | '>' | '|' => '_',
                c if c.is_control() => '_',
                c => c,
            })
            .collect::<String>()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");

        title = title.trim_matches(|c| c == ' ' || c == '.').to_string();
        if title.is_empty() {
            title = "book".to_string();
        }
        let title: String = title.chars().take(100).collect();

        format!("{}.{}", title, extension.to_lowercase())
    }
}
