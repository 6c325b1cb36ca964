//! Read-only access to a Calibre catalog.

pub(crate) mod pool;
pub mod queries;

pub use queries::BookOrder;

use crate::config::CatalogConfig;
use crate::error::{AppError, Result};
use crate::library::{Book, BookFile, Group, GroupKind, Page, PageRequest};
use pool::ConnectionPool;
use rusqlite::{Connection, InterruptHandle};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// Handle to a Calibre library: its root directory and its metadata database.
///
/// Cloning is cheap; all clones share one connection pool. Nothing opened
/// through this handle can write to the database.
#[derive(Clone)]
pub struct Catalog {
    inner: Arc<CatalogInner>,
}

struct CatalogInner {
    library_root: PathBuf,
    pool: ConnectionPool,
}

/// Interrupts the running statement if the awaiting request goes away.
struct InterruptOnDrop(Option<InterruptHandle>);

impl InterruptOnDrop {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for InterruptOnDrop {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            tracing::debug!("Request dropped, interrupting catalog query");
            handle.interrupt();
        }
    }
}

impl Catalog {
    /// Create a handle without touching the database. Connections are
    /// opened on first use, so a catalog that appears later is picked up.
    pub fn new(library_root: impl Into<PathBuf>, database_file: &str, max_idle: usize) -> Self {
        let library_root = library_root.into();
        let db_path = library_root.join(database_file);
        Self {
            inner: Arc::new(CatalogInner {
                library_root,
                pool: ConnectionPool::new(db_path, max_idle),
            }),
        }
    }

    /// Create a lazy handle from configuration.
    pub fn from_config(config: &CatalogConfig) -> Self {
        Self::new(
            config.library_path.clone(),
            &config.database_file,
            config.max_idle_connections,
        )
    }

    /// Open a catalog eagerly, failing with `Unavailable` when the database
    /// file is missing or unreadable.
    pub fn open(library_root: impl Into<PathBuf>, database_file: &str) -> Result<Self> {
        let catalog = Self::new(library_root, database_file, 1);
        let conn = pool::open_read_only(catalog.database_path())?;
        queries::ping(&conn).map_err(|e| AppError::Unavailable(e.to_string()))?;
        catalog.inner.pool.checkin(conn);
        Ok(catalog)
    }

    /// Path of the metadata database.
    pub fn database_path(&self) -> &Path {
        self.inner.pool.path()
    }

    /// Number of idle pooled connections.
    pub fn idle_connections(&self) -> usize {
        self.inner.pool.idle_count()
    }

    /// Run a query on a pooled connection on the blocking thread pool.
    pub(crate) async fn run<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.inner.pool.checkout()?;
        let guard = InterruptOnDrop(Some(conn.get_interrupt_handle()));

        let (conn, result) = tokio::task::spawn_blocking(move || {
            let result = f(&conn);
            (conn, result)
        })
        .await
        .map_err(|e| AppError::Internal(format!("catalog task failed: {}", e)))?;

        guard.disarm();

        match result {
            Ok(value) => {
                self.inner.pool.checkin(conn);
                Ok(value)
            }
            // Domain errors leave the connection usable.
            Err(e @ (AppError::NotFound(_) | AppError::Malformed(_))) => {
                self.inner.pool.checkin(conn);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Check that the catalog can be opened and queried right now.
    pub async fn ping(&self) -> Result<()> {
        if !self.database_path().is_file() {
            self.inner.pool.clear();
            return Err(AppError::Unavailable(format!(
                "catalog database not found at {}",
                self.database_path().display()
            )));
        }

        match self.run(queries::ping).await {
            Ok(_) => Ok(()),
            Err(e @ AppError::Config(_)) => Err(e),
            Err(e) => {
                self.inner.pool.clear();
                Err(AppError::Unavailable(e.to_string()))
            }
        }
    }

    /// Authors that have books, ordered by sort name.
    pub async fn list_authors(&self, page: PageRequest) -> Result<Page<Group>> {
        self.list_groups(GroupKind::Author, page).await
    }

    /// Series that have books, ordered by sort name.
    pub async fn list_series(&self, page: PageRequest) -> Result<Page<Group>> {
        self.list_groups(GroupKind::Series, page).await
    }

    /// Tags that have books, ordered by name.
    pub async fn list_tags(&self, page: PageRequest) -> Result<Page<Group>> {
        self.list_groups(GroupKind::Tag, page).await
    }

    /// Groups of any kind.
    pub async fn list_groups(&self, kind: GroupKind, page: PageRequest) -> Result<Page<Group>> {
        self.run(move |conn| queries::list_groups(conn, kind, page))
            .await
    }

    /// One author, series or tag, or `NotFound`.
    pub async fn get_group(&self, kind: GroupKind, id: i64) -> Result<Group> {
        self.run(move |conn| queries::get_group(conn, kind, id)).await
    }

    /// One author, or `NotFound`.
    pub async fn get_author(&self, id: i64) -> Result<Group> {
        self.get_group(GroupKind::Author, id).await
    }

    /// One series, or `NotFound`.
    pub async fn get_series(&self, id: i64) -> Result<Group> {
        self.get_group(GroupKind::Series, id).await
    }

    /// One tag, or `NotFound`.
    pub async fn get_tag(&self, id: i64) -> Result<Group> {
        self.get_group(GroupKind::Tag, id).await
    }

    /// Books by one author.
    pub async fn list_books_by_author(&self, author_id: i64, offset: u32, limit: u32) -> Result<Page<Book>> {
        self.list_books_in_group(GroupKind::Author, author_id, PageRequest::new(offset, limit))
            .await
    }

    /// Books in one series, in series order.
    pub async fn list_books_by_series(&self, series_id: i64, offset: u32, limit: u32) -> Result<Page<Book>> {
        self.list_books_in_group(GroupKind::Series, series_id, PageRequest::new(offset, limit))
            .await
    }

    /// Books carrying one tag.
    pub async fn list_books_by_tag(&self, tag_id: i64, offset: u32, limit: u32) -> Result<Page<Book>> {
        self.list_books_in_group(GroupKind::Tag, tag_id, PageRequest::new(offset, limit))
            .await
    }

    /// Books linked to any kind of group.
    pub async fn list_books_in_group(
        &self,
        kind: GroupKind,
        id: i64,
        page: PageRequest,
    ) -> Result<Page<Book>> {
        self.run(move |conn| queries::list_books_in_group(conn, kind, id, page))
            .await
    }

    /// Every book in the library.
    pub async fn list_books(&self, order: BookOrder, page: PageRequest) -> Result<Page<Book>> {
        self.run(move |conn| queries::list_books(conn, order, page))
            .await
    }

    /// Books matching a title or author substring.
    pub async fn search_books(&self, query: String, page: PageRequest) -> Result<Page<Book>> {
        self.run(move |conn| queries::search_books(conn, &query, page))
            .await
    }

    /// One book, or `NotFound`.
    pub async fn get_book(&self, id: i64) -> Result<Book> {
        self.run(move |conn| queries::get_book(conn, id)).await
    }

    /// Resolve the file of one format of a book under the library root.
    pub async fn book_file(&self, id: i64, format: String) -> Result<(Book, BookFile, PathBuf)> {
        let (book, file) = self
            .run(move |conn| queries::book_file_location(conn, id, &format))
            .await?;

        let path = self.resolve(&book.path, Some(&file.file_name()))?;
        if !path.is_file() {
            return Err(AppError::NotFound(format!(
                "file {} of book {} is missing on disk",
                file.file_name(),
                id
            )));
        }

        Ok((book, file, path))
    }

    /// Resolve `cover.jpg` of a book under the library root.
    pub async fn cover_file(&self, id: i64) -> Result<PathBuf> {
        let book = self.get_book(id).await?;
        if !book.has_cover {
            return Err(AppError::NotFound(format!("cover of book {}", id)));
        }

        let path = self.resolve(&book.path, Some("cover.jpg"))?;
        if !path.is_file() {
            return Err(AppError::NotFound(format!("cover of book {} is missing on disk", id)));
        }
        Ok(path)
    }

    /// Join a catalog-relative folder (and file) onto the library root,
    /// refusing anything that could leave it.
    fn resolve(&self, folder: &Path, file: Option<&str>) -> Result<PathBuf> {
        let mut relative = folder.to_path_buf();
        if let Some(file) = file {
            relative.push(file);
        }

        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if escapes || relative.as_os_str().is_empty() {
            return Err(AppError::Malformed(format!(
                "unsafe path in catalog: {}",
                relative.display()
            )));
        }

        Ok(self.inner.library_root.join(relative))
    }
}
