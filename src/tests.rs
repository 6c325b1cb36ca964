use crate::catalog::{BookOrder, Catalog, queries};
use crate::config::{Cli, Config};
use crate::error::AppError;
use crate::library::{Book, BookFile, BookFormat, GroupKind, Page, PageRequest};
use crate::opds::{self, Entry, FeedBuilder};
use crate::server::{AppState, create_router};
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use rusqlite::{Connection, params};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

const SCHEMA: &str = r#"
CREATE TABLE books (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    title TEXT NOT NULL DEFAULT 'Unknown' COLLATE NOCASE,
    sort TEXT COLLATE NOCASE,
    timestamp TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    pubdate TIMESTAMP DEFAULT '0101-01-01 00:00:00+00:00',
    series_index REAL NOT NULL DEFAULT 1.0,
    author_sort TEXT COLLATE NOCASE,
    path TEXT NOT NULL DEFAULT '',
    uuid TEXT,
    has_cover BOOL DEFAULT 0,
    last_modified TIMESTAMP NOT NULL DEFAULT '2000-01-01 00:00:00+00:00'
);
CREATE TABLE authors (id INTEGER PRIMARY KEY, name TEXT NOT NULL COLLATE NOCASE, sort TEXT COLLATE NOCASE, link TEXT NOT NULL DEFAULT '');
CREATE TABLE books_authors_link (id INTEGER PRIMARY KEY, book INTEGER NOT NULL, author INTEGER NOT NULL, UNIQUE(book, author));
CREATE TABLE series (id INTEGER PRIMARY KEY, name TEXT NOT NULL COLLATE NOCASE, sort TEXT COLLATE NOCASE);
CREATE TABLE books_series_link (id INTEGER PRIMARY KEY, book INTEGER NOT NULL, series INTEGER NOT NULL, UNIQUE(book));
CREATE TABLE tags (id INTEGER PRIMARY KEY, name TEXT NOT NULL COLLATE NOCASE);
CREATE TABLE books_tags_link (id INTEGER PRIMARY KEY, book INTEGER NOT NULL, tag INTEGER NOT NULL, UNIQUE(book, tag));
CREATE TABLE data (id INTEGER PRIMARY KEY, book INTEGER NOT NULL, format TEXT NOT NULL COLLATE NOCASE, uncompressed_size INTEGER NOT NULL, name TEXT NOT NULL);
CREATE TABLE comments (id INTEGER PRIMARY KEY, book INTEGER NOT NULL, text TEXT NOT NULL COLLATE NOCASE, UNIQUE(book));
"#;

/// A throwaway Calibre library on disk.
struct TestLibrary {
    dir: TempDir,
    conn: Connection,
}

impl TestLibrary {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let conn = create_metadata_db(dir.path());
        Self { dir, conn }
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn author(&self, id: i64, name: &str) {
        let sort = name.split_whitespace().last().unwrap_or(name);
        self.conn
            .execute(
                "INSERT INTO authors (id, name, sort) VALUES (?1, ?2, ?3)",
                params![id, name, sort],
            )
            .unwrap();
    }

    fn series(&self, id: i64, name: &str) {
        self.conn
            .execute(
                "INSERT INTO series (id, name, sort) VALUES (?1, ?2, ?2)",
                params![id, name],
            )
            .unwrap();
    }

    fn tag(&self, id: i64, name: &str) {
        self.conn
            .execute("INSERT INTO tags (id, name) VALUES (?1, ?2)", params![id, name])
            .unwrap();
    }

    fn book(&self, id: i64, title: &str, authors: &[i64]) {
        self.conn
            .execute(
                "INSERT INTO books (id, title, sort, timestamp, path, uuid, last_modified) \
                 VALUES (?1, ?2, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id,
                    title,
                    format!("2024-01-{:02} 10:00:00+00:00", id % 28 + 1),
                    book_folder(id),
                    format!("00000000-0000-4000-8000-{:012}", id),
                    "2024-02-01 12:00:00.123456+00:00",
                ],
            )
            .unwrap();
        for author in authors {
            self.conn
                .execute(
                    "INSERT INTO books_authors_link (book, author) VALUES (?1, ?2)",
                    params![id, author],
                )
                .unwrap();
        }
    }

    fn in_series(&self, book: i64, series: i64, index: f64) {
        self.conn
            .execute(
                "INSERT INTO books_series_link (book, series) VALUES (?1, ?2)",
                params![book, series],
            )
            .unwrap();
        self.conn
            .execute(
                "UPDATE books SET series_index = ?1 WHERE id = ?2",
                params![index, book],
            )
            .unwrap();
    }

    fn tagged(&self, book: i64, tag: i64) {
        self.conn
            .execute(
                "INSERT INTO books_tags_link (book, tag) VALUES (?1, ?2)",
                params![book, tag],
            )
            .unwrap();
    }

    fn format(&self, book: i64, format: &str, contents: &[u8]) {
        let name = format!("book-{}", book);
        self.conn
            .execute(
                "INSERT INTO data (book, format, uncompressed_size, name) VALUES (?1, ?2, ?3, ?4)",
                params![book, format, contents.len() as i64, name],
            )
            .unwrap();

        let folder = self.root().join(book_folder(book));
        std::fs::create_dir_all(&folder).unwrap();
        std::fs::write(folder.join(format!("{}.{}", name, format.to_lowercase())), contents).unwrap();
    }

    fn cover(&self, book: i64, contents: &[u8]) {
        self.conn
            .execute("UPDATE books SET has_cover = 1 WHERE id = ?1", params![book])
            .unwrap();
        let folder = self.root().join(book_folder(book));
        std::fs::create_dir_all(&folder).unwrap();
        std::fs::write(folder.join("cover.jpg"), contents).unwrap();
    }

    fn comment(&self, book: i64, text: &str) {
        self.conn
            .execute(
                "INSERT INTO comments (book, text) VALUES (?1, ?2)",
                params![book, text],
            )
            .unwrap();
    }

    fn catalog(&self) -> Catalog {
        Catalog::new(self.root(), "metadata.db", 2)
    }

    fn config(&self, page_size: u32) -> Config {
        test_config(self.root(), page_size)
    }

    fn router(&self, page_size: u32) -> Router {
        create_router(AppState::new(self.config(page_size)))
    }
}

fn book_folder(id: i64) -> String {
    format!("Author/Book ({})", id)
}

fn create_metadata_db(dir: &Path) -> Connection {
    let conn = Connection::open(dir.join("metadata.db")).unwrap();
    conn.execute_batch(SCHEMA).unwrap();
    conn
}

fn test_config(library: &Path, page_size: u32) -> Config {
    let mut config = Config::default();
    config.catalog.library_path = library.to_path_buf();
    config.feed.page_size = page_size;
    config
}

/// Three authors with one book each plus a couple of extras.
fn small_library() -> TestLibrary {
    let lib = TestLibrary::new();
    lib.author(1, "Ursula K. Le Guin");
    lib.author(2, "Iain M. Banks");
    lib.author(3, "Octavia Butler");
    lib.book(1, "The Dispossessed", &[1]);
    lib.book(2, "Consider Phlebas", &[2]);
    lib.book(3, "Kindred", &[3]);
    lib
}

async fn get(router: Router, uri: &str) -> (StatusCode, String, String) {
    let response = router
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();

    (status, content_type, String::from_utf8_lossy(&bytes).into_owned())
}

/// `(rel, href)` of every feed-level link.
fn feed_links(xml: &str) -> Vec<(String, String)> {
    let doc = roxmltree::Document::parse(xml).unwrap();
    doc.root_element()
        .children()
        .filter(|n| n.has_tag_name("link"))
        .map(|n| {
            (
                n.attribute("rel").unwrap_or_default().to_string(),
                n.attribute("href").unwrap_or_default().to_string(),
            )
        })
        .collect()
}

fn link_href(xml: &str, rel: &str) -> Option<String> {
    feed_links(xml)
        .into_iter()
        .find(|(r, _)| r == rel)
        .map(|(_, href)| href)
}

fn entry_titles(xml: &str) -> Vec<String> {
    let doc = roxmltree::Document::parse(xml).unwrap();
    doc.root_element()
        .children()
        .filter(|n| n.has_tag_name("entry"))
        .filter_map(|entry| {
            entry
                .children()
                .find(|c| c.has_tag_name("title"))
                .and_then(|t| t.text())
                .map(str::to_string)
        })
        .collect()
}

fn entry_count(xml: &str) -> usize {
    let doc = roxmltree::Document::parse(xml).unwrap();
    doc.descendants().filter(|n| n.has_tag_name("entry")).count()
}

fn page_of(offset: u32, limit: u32, total: u64) -> Page<()> {
    let len = total.saturating_sub(u64::from(offset)).min(u64::from(limit)) as usize;
    Page::new(vec![(); len], PageRequest::new(offset, limit), total)
}

#[test]
fn page_links_follow_offset_and_total() {
    let first = page_of(0, 2, 3);
    assert!(first.has_next());
    assert!(!first.has_previous());
    assert_eq!(first.next_offset(), Some(2));
    assert_eq!(first.last_offset(), Some(2));

    let last = page_of(2, 2, 3);
    assert!(!last.has_next());
    assert!(last.has_previous());
    assert_eq!(last.previous_offset(), Some(0));
}

#[test]
fn page_exactly_filled_has_no_next() {
    let page = page_of(4, 2, 6);
    assert!(!page.has_next());
    assert_eq!(page.last_offset(), Some(4));
}

#[test]
fn empty_set_has_no_last_page() {
    let page = page_of(0, 30, 0);
    assert!(!page.has_next());
    assert!(!page.has_previous());
    assert_eq!(page.last_offset(), None);
}

#[test]
fn page_past_end_points_back_to_last_page() {
    let page = page_of(100, 2, 3);
    assert!(page.is_empty());
    assert!(!page.has_next());
    assert_eq!(page.previous_offset(), Some(2));
    assert_eq!(page.last_offset(), Some(2));

    let empty = page_of(10, 5, 0);
    assert_eq!(empty.previous_offset(), Some(0));
}

#[test]
fn page_number_maps_to_offset() {
    assert_eq!(PageRequest::from_page_number(1, 30).offset, 0);
    assert_eq!(PageRequest::from_page_number(3, 30).offset, 60);
    assert_eq!(PageRequest::from_page_number(0, 30).offset, 0);
    assert_eq!(PageRequest::new(5, 0).limit, 1);
}

#[test]
fn page_href_keeps_extra_params() {
    assert_eq!(opds::page_href("/opds/authors", &[], 0), "/opds/authors");
    assert_eq!(opds::page_href("/opds/authors", &[], 30), "/opds/authors?offset=30");
    assert_eq!(
        opds::page_href("/opds/search", &[("q", "le guin")], 10),
        "/opds/search?q=le%20guin&offset=10"
    );
}

#[test]
fn config_default_values() {
    let config = Config::default();
    assert_eq!(config.server.bind.port(), 8080);
    assert_eq!(config.feed.page_size, 30);
    assert_eq!(config.catalog.library_path, PathBuf::from("/books"));
    assert_eq!(config.catalog.database_file, "metadata.db");
}

#[test]
fn config_parse_toml() {
    let toml = r#"
[server]
bind = "127.0.0.1:9090"
title = "Home Library"

[catalog]
library_path = "/srv/calibre"

[feed]
page_size = 50
"#;
    let config: Config = toml::from_str(toml).unwrap();
    assert_eq!(config.server.bind.port(), 9090);
    assert_eq!(config.server.title, "Home Library");
    assert_eq!(config.catalog.library_path, PathBuf::from("/srv/calibre"));
    assert_eq!(config.catalog.database_file, "metadata.db");
    assert_eq!(config.feed.page_size, 50);
}

#[test]
fn config_overrides_win_over_file_values() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    let cli = Cli {
        library: Some(dir.path().to_path_buf()),
        page_size: Some(12),
        base_url: Some("https://example.org/books/".to_string()),
        ..Default::default()
    };

    config.apply_overrides(&cli);

    assert_eq!(config.catalog.library_path, dir.path());
    assert_eq!(config.feed.page_size, 12);
    assert_eq!(config.server.base_url, "https://example.org/books");
    assert!(config.validate().is_ok());
}

#[test]
fn config_rejects_zero_page_size() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), 0);
    assert!(matches!(config.validate(), Err(AppError::Config(_))));
}

#[test]
fn config_rejects_missing_library_directory() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir.path().join("absent"), 30);
    assert!(matches!(config.validate(), Err(AppError::Config(_))));
}

#[test]
fn config_rejects_database_file_with_directories() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path(), 30);
    config.catalog.database_file = "../metadata.db".to_string();
    assert!(matches!(config.validate(), Err(AppError::Config(_))));
}

#[test]
fn config_resolve_fails_for_missing_library() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("config.toml");
    std::fs::write(
        &config_path,
        format!(
            "[catalog]\nlibrary_path = {:?}\n",
            dir.path().join("nope").display().to_string()
        ),
    )
    .unwrap();

    let cli = Cli {
        config: Some(config_path),
        ..Default::default()
    };
    assert!(matches!(Config::resolve(&cli), Err(AppError::Config(_))));
}

#[test]
fn book_format_mime_type() {
    assert_eq!(BookFormat::mime_for("EPUB"), "application/epub+zip");
    assert_eq!(BookFormat::mime_for("azw3"), "application/vnd.amazon.ebook");
    assert_eq!(BookFormat::mime_for("PDF"), "application/pdf");
    assert_eq!(BookFormat::mime_for("LIT"), "application/octet-stream");
}

#[test]
fn book_file_name_uses_lowercase_extension() {
    let file = BookFile {
        format: "EPUB".to_string(),
        name: "The Dispossessed - Ursula K. Le Guin".to_string(),
        size: Some(10),
    };
    assert_eq!(file.file_name(), "The Dispossessed - Ursula K. Le Guin.epub");
}

#[test]
fn download_filename_strips_unsafe_characters() {
    let lib = small_library();
    let mut book = queries::get_book(&lib.conn, 1).unwrap();

    book.title = "What? A: \"Title\" / with\tspaces.".to_string();
    assert_eq!(book.download_filename("EPUB"), "What_ A_ _Title_ _ with_spaces.epub");

    book.title = " ... ".to_string();
    assert_eq!(book.download_filename("pdf"), "book.pdf");
}

#[test]
fn parse_calibre_timestamps() {
    let ts = queries::parse_timestamp("2024-02-01 12:00:00.123456+00:00").unwrap();
    assert_eq!(ts.to_rfc3339(), "2024-02-01T12:00:00.123456+00:00");

    assert!(queries::parse_timestamp("2024-02-01T12:00:00+02:00").is_some());
    assert!(queries::parse_timestamp("2024-02-01 12:00:00").is_some());
    assert!(queries::parse_timestamp("yesterday").is_none());
}

#[test]
fn catalog_lists_authors_in_sort_order() {
    let lib = small_library();
    let page = queries::list_groups(&lib.conn, GroupKind::Author, PageRequest::new(0, 10)).unwrap();

    let names: Vec<_> = page.items.iter().map(|g| g.name.as_str()).collect();
    assert_eq!(names, vec!["Iain M. Banks", "Octavia Butler", "Ursula K. Le Guin"]);
    assert_eq!(page.total, 3);
    assert!(page.items.iter().all(|g| g.book_count == 1));
}

#[test]
fn catalog_hides_groups_without_books() {
    let lib = small_library();
    lib.tag(1, "Science Fiction");
    lib.tag(2, "Unused");
    lib.tagged(1, 1);
    lib.tagged(3, 1);

    let page = queries::list_groups(&lib.conn, GroupKind::Tag, PageRequest::new(0, 10)).unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.items[0].name, "Science Fiction");
    assert_eq!(page.items[0].book_count, 2);

    // Still addressable directly, just empty.
    let unused = queries::get_group(&lib.conn, GroupKind::Tag, 2).unwrap();
    assert_eq!(unused.book_count, 0);
}

#[test]
fn catalog_book_has_related_data() {
    let lib = small_library();
    lib.series(1, "Hainish Cycle");
    lib.in_series(1, 1, 5.0);
    lib.tag(1, "Science Fiction");
    lib.tagged(1, 1);
    lib.format(1, "EPUB", b"epub-bytes");
    lib.format(1, "PDF", b"pdf-bytes");
    lib.comment(1, "<p>An ambiguous utopia.</p>");

    let book = queries::get_book(&lib.conn, 1).unwrap();
    assert_eq!(book.title, "The Dispossessed");
    assert_eq!(book.authors_display(), "Ursula K. Le Guin");
    assert_eq!(book.series.as_ref().map(|s| s.name.as_str()), Some("Hainish Cycle"));
    assert_eq!(book.series_index, 5.0);
    assert_eq!(book.tags, vec!["Science Fiction".to_string()]);
    assert_eq!(book.files.len(), 2);
    assert!(book.file("epub").is_some());
    assert_eq!(book.description.as_deref(), Some("<p>An ambiguous utopia.</p>"));
    assert_eq!(book.urn(), "urn:uuid:00000000-0000-4000-8000-000000000001");
    assert!(book.published.is_none());
}

#[test]
fn catalog_missing_book_is_not_found() {
    let lib = small_library();
    assert!(matches!(
        queries::get_book(&lib.conn, 9999),
        Err(AppError::NotFound(_))
    ));
    assert!(matches!(
        queries::get_group(&lib.conn, GroupKind::Author, 9999),
        Err(AppError::NotFound(_))
    ));
}

#[test]
fn catalog_skips_books_with_unreadable_timestamps() {
    let lib = small_library();
    lib.book(4, "Broken", &[1]);
    lib.conn
        .execute(
            "UPDATE books SET timestamp = 'garbage', last_modified = 'garbage' WHERE id = 4",
            [],
        )
        .unwrap();

    let page = queries::list_books_in_group(&lib.conn, GroupKind::Author, 1, PageRequest::new(0, 10)).unwrap();
    let titles: Vec<_> = page.items.iter().map(|b| b.title.as_str()).collect();
    assert_eq!(titles, vec!["The Dispossessed"]);
}

#[test]
fn catalog_series_books_follow_series_index() {
    let lib = TestLibrary::new();
    lib.author(1, "Ann Leckie");
    lib.series(1, "Imperial Radch");
    lib.book(1, "Ancillary Mercy", &[1]);
    lib.book(2, "Ancillary Justice", &[1]);
    lib.book(3, "Ancillary Sword", &[1]);
    lib.in_series(1, 1, 3.0);
    lib.in_series(2, 1, 1.0);
    lib.in_series(3, 1, 2.0);

    let page = queries::list_books_in_group(&lib.conn, GroupKind::Series, 1, PageRequest::new(0, 10)).unwrap();
    let titles: Vec<_> = page.items.iter().map(|b| b.title.as_str()).collect();
    assert_eq!(titles, vec!["Ancillary Justice", "Ancillary Sword", "Ancillary Mercy"]);
}

#[test]
fn catalog_search_matches_title_and_author() {
    let lib = small_library();

    let by_title = queries::search_books(&lib.conn, "kindred", PageRequest::new(0, 10)).unwrap();
    assert_eq!(by_title.total, 1);
    assert_eq!(by_title.items[0].title, "Kindred");

    let by_author = queries::search_books(&lib.conn, "banks", PageRequest::new(0, 10)).unwrap();
    assert_eq!(by_author.items[0].title, "Consider Phlebas");

    let wildcard = queries::search_books(&lib.conn, "%", PageRequest::new(0, 10)).unwrap();
    assert_eq!(wildcard.total, 0);
}

#[test]
fn catalog_newest_first() {
    let lib = small_library();
    let page = queries::list_books(&lib.conn, BookOrder::Newest, PageRequest::new(0, 10)).unwrap();
    let ids: Vec<_> = page.items.iter().map(|b| b.id).collect();
    assert_eq!(ids, vec![3, 2, 1]);
}

#[test]
fn catalog_pages_never_exceed_limit() {
    let lib = TestLibrary::new();
    lib.author(1, "Terry Pratchett");
    for id in 1..=7 {
        lib.book(id, &format!("Discworld {:02}", id), &[1]);
    }

    let limit = 3;
    let mut offset = 0;
    loop {
        let page = queries::list_books_in_group(&lib.conn, GroupKind::Author, 1, PageRequest::new(offset, limit)).unwrap();
        assert!(page.len() <= limit as usize);
        if page.has_next() {
            assert_eq!(page.len(), limit as usize);
            offset = page.next_offset().unwrap();
        } else {
            assert_eq!(page.len(), 1);
            break;
        }
    }
}

#[test]
fn catalog_pagination_is_stable() {
    let lib = small_library();
    let a = queries::list_books(&lib.conn, BookOrder::Title, PageRequest::new(1, 2)).unwrap();
    let b = queries::list_books(&lib.conn, BookOrder::Title, PageRequest::new(1, 2)).unwrap();
    let ids = |p: &Page<Book>| p.items.iter().map(|b| b.id).collect::<Vec<_>>();
    assert_eq!(ids(&a), ids(&b));
}

#[test]
fn catalog_connections_refuse_writes() {
    let lib = small_library();
    let conn = crate::catalog::pool::open_read_only(&lib.root().join("metadata.db")).unwrap();
    let result = conn.execute("DELETE FROM books", []);
    assert!(result.is_err());

    let count: i64 = lib
        .conn
        .query_row("SELECT COUNT(*) FROM books", [], |r| r.get(0))
        .unwrap();
    assert_eq!(count, 3);
}

#[tokio::test]
async fn catalog_open_fails_when_database_missing() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
        Catalog::open(dir.path(), "metadata.db"),
        Err(AppError::Unavailable(_))
    ));
}

#[tokio::test]
async fn catalog_async_queries_reuse_connections() {
    let lib = small_library();
    let catalog = Catalog::open(lib.root(), "metadata.db").unwrap();

    let authors = catalog.list_authors(PageRequest::new(0, 30)).await.unwrap();
    assert_eq!(authors.total, 3);
    let books = catalog.list_books_by_author(1, 0, 30).await.unwrap();
    assert_eq!(books.items[0].title, "The Dispossessed");
    assert!(matches!(catalog.get_book(42).await, Err(AppError::NotFound(_))));

    assert_eq!(catalog.idle_connections(), 1);
}

#[tokio::test]
async fn catalog_follows_next_over_whole_group() {
    let lib = TestLibrary::new();
    lib.tag(1, "Fantasy");
    for id in 1..=11 {
        lib.book(id, &format!("Book {:02}", id), &[]);
        lib.tagged(id, 1);
    }
    let catalog = lib.catalog();

    let mut seen = Vec::new();
    let mut offset = 0;
    let last = loop {
        let page = catalog.list_books_by_tag(1, offset, 4).await.unwrap();
        seen.extend(page.items.iter().map(|b| b.id));
        match page.next_offset() {
            Some(next) => offset = next,
            None => break page,
        }
    };

    assert_eq!(seen.len(), 11);
    assert_eq!(seen.iter().collect::<HashSet<_>>().len(), 11);
    assert_eq!(Some(last.offset), last.last_offset());
}

#[tokio::test]
async fn catalog_resolves_files_inside_library() {
    let lib = small_library();
    lib.format(1, "EPUB", b"epub-bytes");
    let catalog = lib.catalog();

    let (_, file, path) = catalog.book_file(1, "epub".to_string()).await.unwrap();
    assert_eq!(file.format, "EPUB");
    assert!(path.starts_with(lib.root()));
    assert_eq!(std::fs::read(path).unwrap(), b"epub-bytes");

    assert!(matches!(
        catalog.book_file(1, "pdf".to_string()).await,
        Err(AppError::NotFound(_))
    ));
    assert!(matches!(catalog.cover_file(1).await, Err(AppError::NotFound(_))));
}

#[tokio::test]
async fn catalog_rejects_paths_escaping_library() {
    let lib = small_library();
    lib.format(1, "EPUB", b"epub-bytes");
    lib.conn
        .execute("UPDATE books SET path = '../outside' WHERE id = 1", [])
        .unwrap();

    assert!(matches!(
        lib.catalog().book_file(1, "epub".to_string()).await,
        Err(AppError::Malformed(_))
    ));
}

#[test]
fn feed_declares_namespaces_and_one_entry_per_book() {
    let lib = small_library();
    lib.format(2, "EPUB", b"x");
    let page = queries::list_books(&lib.conn, BookOrder::Title, PageRequest::new(0, 30)).unwrap();

    let mut feed = FeedBuilder::new("urn:test", "All").paginate("/opds/titles", &[], &page, opds::ACQUISITION_MIME);
    for book in &page.items {
        feed = feed.book_entry(book, "");
    }
    let xml = feed.build().unwrap();

    let doc = roxmltree::Document::parse(&xml).unwrap();
    let root = doc.root_element();
    assert_eq!(root.tag_name().namespace(), Some("http://www.w3.org/2005/Atom"));
    assert_eq!(root.lookup_namespace_uri(Some("opds")), Some("http://opds-spec.org/2010/catalog"));
    assert_eq!(entry_count(&xml), page.len());

    let acquisition = doc
        .descendants()
        .find(|n| n.attribute("rel") == Some("http://opds-spec.org/acquisition"))
        .unwrap();
    assert_eq!(acquisition.attribute("href"), Some("/opds/books/2/file/epub"));
    assert_eq!(acquisition.attribute("type"), Some("application/epub+zip"));
}

#[test]
fn feed_escapes_text() {
    let xml = FeedBuilder::new("urn:test", "Tom & Jerry <Collected>")
        .build()
        .unwrap();
    assert!(xml.contains("Tom &amp; Jerry &lt;Collected&gt;"));
    roxmltree::Document::parse(&xml).unwrap();
}

#[test]
fn empty_feed_has_no_first_or_last() {
    let page: Page<Book> = Page::new(Vec::new(), PageRequest::new(0, 30), 0);
    let xml = FeedBuilder::new("urn:test", "Nothing")
        .paginate("/opds/new", &[], &page, opds::ACQUISITION_MIME)
        .build()
        .unwrap();

    assert!(link_href(&xml, "self").is_some());
    assert!(link_href(&xml, "first").is_none());
    assert!(link_href(&xml, "last").is_none());
    assert_eq!(entry_count(&xml), 0);
}

#[test]
fn entry_document_is_standalone() {
    let lib = small_library();
    let book = queries::get_book(&lib.conn, 3).unwrap();
    let xml = opds::build_entry_document(&Entry::book(&book, "https://example.org")).unwrap();

    let doc = roxmltree::Document::parse(&xml).unwrap();
    let root = doc.root_element();
    assert!(root.has_tag_name("entry"));
    assert_eq!(root.tag_name().namespace(), Some("http://www.w3.org/2005/Atom"));
    let uri = root
        .descendants()
        .find(|n| n.has_tag_name("uri"))
        .and_then(|n| n.text());
    assert_eq!(uri, Some("https://example.org/opds/authors/3"));
}

#[tokio::test]
async fn healthz_is_always_ok() {
    let dir = tempfile::tempdir().unwrap();
    let router = create_router(AppState::new(test_config(dir.path(), 30)));

    let (status, _, body) = get(router, "/healthz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "ok");
}

#[tokio::test]
async fn ready_tracks_catalog_presence() {
    let dir = tempfile::tempdir().unwrap();
    let router = create_router(AppState::new(test_config(dir.path(), 30)));

    let (status, _, _) = get(router.clone(), "/ready").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let conn = create_metadata_db(dir.path());
    drop(conn);
    let (status, _, _) = get(router.clone(), "/ready").await;
    assert_eq!(status, StatusCode::OK);

    std::fs::remove_file(dir.path().join("metadata.db")).unwrap();
    let (status, _, _) = get(router, "/ready").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn feeds_report_unavailable_without_catalog() {
    let dir = tempfile::tempdir().unwrap();
    let router = create_router(AppState::new(test_config(dir.path(), 30)));

    let (status, _, body) = get(router, "/opds/authors").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(!body.contains(&dir.path().display().to_string()));
}

#[tokio::test]
async fn root_feed_links_to_navigation_feeds() {
    let lib = small_library();
    let (status, content_type, body) = get(lib.router(30), "/opds").await;

    assert_eq!(status, StatusCode::OK);
    assert!(content_type.starts_with("application/atom+xml;profile=opds-catalog"));
    let titles = entry_titles(&body);
    assert_eq!(titles, vec!["Newest", "By Title", "Authors", "Series", "Tags"]);
    assert_eq!(link_href(&body, "search").as_deref(), Some("/opds/opensearch.xml"));
}

#[tokio::test]
async fn authors_feed_paginates() {
    let lib = small_library();

    let (status, content_type, body) = get(lib.router(2), "/opds/authors").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(content_type, opds::NAVIGATION_MIME);
    assert_eq!(entry_count(&body), 2);
    assert_eq!(link_href(&body, "next").as_deref(), Some("/opds/authors?offset=2"));
    assert_eq!(link_href(&body, "first").as_deref(), Some("/opds/authors"));
    assert_eq!(link_href(&body, "last").as_deref(), Some("/opds/authors?offset=2"));
    assert!(link_href(&body, "previous").is_none());

    let (status, _, body) = get(lib.router(2), "/opds/authors?offset=2").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(entry_count(&body), 1);
    assert!(link_href(&body, "next").is_none());
    assert_eq!(link_href(&body, "previous").as_deref(), Some("/opds/authors"));
    assert_eq!(entry_titles(&body), vec!["Ursula K. Le Guin"]);
}

#[tokio::test]
async fn page_parameter_is_one_based() {
    let lib = small_library();
    let (_, _, by_page) = get(lib.router(2), "/opds/authors?page=2").await;
    let (_, _, by_offset) = get(lib.router(2), "/opds/authors?offset=2").await;
    assert_eq!(entry_titles(&by_page), entry_titles(&by_offset));
}

#[tokio::test]
async fn malformed_offset_is_bad_request() {
    let lib = small_library();
    let (status, _, _) = get(lib.router(2), "/opds/authors?offset=abc").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn author_feed_lists_books() {
    let lib = small_library();
    lib.format(1, "EPUB", b"x");

    let (status, content_type, body) = get(lib.router(30), "/opds/authors/1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(content_type, opds::ACQUISITION_MIME);
    assert_eq!(entry_titles(&body), vec!["The Dispossessed"]);

    let doc = roxmltree::Document::parse(&body).unwrap();
    let title = doc
        .root_element()
        .children()
        .find(|n| n.has_tag_name("title"))
        .and_then(|n| n.text());
    assert_eq!(title, Some("Books by Ursula K. Le Guin"));
}

#[tokio::test]
async fn unknown_group_is_not_found() {
    let lib = small_library();
    for uri in ["/opds/authors/999", "/opds/series/999", "/opds/tags/999"] {
        let (status, _, _) = get(lib.router(30), uri).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{}", uri);
    }
}

#[tokio::test]
async fn series_and_tag_feeds() {
    let lib = small_library();
    lib.series(1, "Culture");
    lib.in_series(2, 1, 1.0);
    lib.tag(1, "Space Opera");
    lib.tagged(2, 1);

    let (_, _, body) = get(lib.router(30), "/opds/series").await;
    assert_eq!(entry_titles(&body), vec!["Culture"]);

    let (_, _, body) = get(lib.router(30), "/opds/series/1").await;
    assert_eq!(entry_titles(&body), vec!["Consider Phlebas"]);

    let (_, _, body) = get(lib.router(30), "/opds/tags").await;
    assert_eq!(entry_titles(&body), vec!["Space Opera"]);

    let (_, _, body) = get(lib.router(30), "/opds/tags/1").await;
    assert_eq!(entry_titles(&body), vec!["Consider Phlebas"]);
}

#[tokio::test]
async fn missing_book_is_not_found() {
    let lib = small_library();
    let (status, _, body) = get(lib.router(30), "/opds/books/9999").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, "Not Found");
}

#[tokio::test]
async fn book_entry_document() {
    let lib = small_library();
    lib.format(3, "EPUB", b"x");

    let (status, content_type, body) = get(lib.router(30), "/opds/books/3").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(content_type, opds::ENTRY_MIME);
    assert_eq!(entry_count(&body), 1);
    assert!(body.contains("Kindred"));
}

#[tokio::test]
async fn book_download_streams_file() {
    let lib = small_library();
    lib.format(1, "EPUB", b"epub-bytes");

    let response = lib
        .router(30)
        .oneshot(
            Request::builder()
                .uri("/opds/books/1/file/epub")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "application/epub+zip");
    let disposition = response.headers()[header::CONTENT_DISPOSITION].to_str().unwrap();
    assert!(disposition.contains("The Dispossessed.epub"));

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&bytes[..], b"epub-bytes");
}

#[tokio::test]
async fn missing_format_and_cover_are_not_found() {
    let lib = small_library();
    lib.format(1, "EPUB", b"x");

    let (status, _, _) = get(lib.router(30), "/opds/books/1/file/pdf").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _, _) = get(lib.router(30), "/opds/books/1/cover").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cover_is_served() {
    let lib = small_library();
    lib.cover(2, b"jpeg-bytes");

    let (status, content_type, body) = get(lib.router(30), "/opds/books/2/cover").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(content_type, "image/jpeg");
    assert_eq!(body, "jpeg-bytes");
}

#[tokio::test]
async fn search_feed_keeps_query_in_links() {
    let lib = TestLibrary::new();
    lib.author(1, "Jack Vance");
    for id in 1..=3 {
        lib.book(id, &format!("Dying Earth {}", id), &[1]);
    }

    let (status, _, body) = get(lib.router(2), "/opds/search?q=dying%20earth").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(entry_count(&body), 2);
    assert_eq!(
        link_href(&body, "next").as_deref(),
        Some("/opds/search?q=dying%20earth&offset=2")
    );

    let (status, _, _) = get(lib.router(2), "/opds/search?q=%20").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn newest_and_title_feeds() {
    let lib = small_library();

    let (_, _, body) = get(lib.router(30), "/opds/new").await;
    assert_eq!(entry_titles(&body), vec!["Kindred", "Consider Phlebas", "The Dispossessed"]);

    let (_, _, body) = get(lib.router(30), "/opds/titles").await;
    assert_eq!(entry_titles(&body), vec!["Consider Phlebas", "Kindred", "The Dispossessed"]);
}

#[tokio::test]
async fn opensearch_description() {
    let lib = small_library();
    let (status, content_type, body) = get(lib.router(30), "/opds/opensearch.xml").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(content_type, opds::OPENSEARCH_MIME);
    let doc = roxmltree::Document::parse(&body).unwrap();
    let url = doc.descendants().find(|n| n.has_tag_name("Url")).unwrap();
    assert_eq!(url.attribute("template"), Some("/opds/search?q={searchTerms}"));
}

#[tokio::test]
async fn book_entry_without_authors_names_unknown_author() {
    let lib = TestLibrary::new();
    lib.book(1, "Orphan", &[]);

    let (status, _, body) = get(lib.router(30), "/opds/books/1").await;
    assert_eq!(status, StatusCode::OK);

    let doc = roxmltree::Document::parse(&body).unwrap();
    let author = doc
        .root_element()
        .children()
        .find(|n| n.has_tag_name("author"))
        .unwrap();
    let name = author
        .children()
        .find(|n| n.has_tag_name("name"))
        .and_then(|n| n.text());
    assert_eq!(name, Some("Unknown Author"));
    assert!(!author.children().any(|n| n.has_tag_name("uri")));
}

#[tokio::test]
async fn offset_past_end_links_back_to_last_page() {
    let lib = small_library();
    let (status, _, body) = get(lib.router(2), "/opds/authors?offset=100").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(entry_count(&body), 0);
    assert_eq!(link_href(&body, "previous").as_deref(), Some("/opds/authors?offset=2"));
    assert_eq!(link_href(&body, "last").as_deref(), Some("/opds/authors?offset=2"));
    assert!(link_href(&body, "next").is_none());
}

#[tokio::test]
async fn malformed_books_do_not_shorten_pages() {
    let lib = TestLibrary::new();
    lib.author(1, "Gene Wolfe");
    for id in 1..=5 {
        lib.book(id, &format!("Volume {}", id), &[1]);
    }
    lib.conn
        .execute(
            "UPDATE books SET timestamp = 'garbage', last_modified = 'garbage' WHERE id = 2",
            [],
        )
        .unwrap();

    let (_, _, body) = get(lib.router(2), "/opds/authors/1").await;
    assert_eq!(entry_titles(&body), vec!["Volume 1", "Volume 3"]);
    assert_eq!(link_href(&body, "next").as_deref(), Some("/opds/authors/1?offset=2"));

    let (_, _, body) = get(lib.router(2), "/opds/authors/1?offset=2").await;
    assert_eq!(entry_titles(&body), vec!["Volume 4", "Volume 5"]);
    assert!(link_href(&body, "next").is_none());

    let group = queries::get_group(&lib.conn, GroupKind::Author, 1).unwrap();
    assert_eq!(group.book_count, 4);
    let all = queries::list_books(&lib.conn, BookOrder::Title, PageRequest::new(0, 10)).unwrap();
    assert_eq!(all.total, 4);
    assert_eq!(all.len(), 4);
}

#[tokio::test]
async fn group_feeds_point_up_to_their_listing() {
    let lib = small_library();
    lib.series(1, "Hainish Cycle");
    lib.in_series(1, 1, 5.0);
    lib.tag(1, "Science Fiction");
    lib.tagged(1, 1);

    for (uri, up) in [
        ("/opds/authors/1", "/opds/authors"),
        ("/opds/series/1", "/opds/series"),
        ("/opds/tags/1", "/opds/tags"),
        ("/opds/authors", "/opds"),
        ("/opds/new", "/opds"),
        ("/opds/search?q=kindred", "/opds"),
    ] {
        let (status, _, body) = get(lib.router(30), uri).await;
        assert_eq!(status, StatusCode::OK, "{}", uri);
        assert_eq!(link_href(&body, "up").as_deref(), Some(up), "{}", uri);
    }
}

#[tokio::test]
async fn catalog_interrupts_abandoned_query() {
    let lib = small_library();
    let catalog = lib.catalog();
    let (started_tx, started_rx) = tokio::sync::oneshot::channel();
    let (done_tx, done_rx) = std::sync::mpsc::channel();

    let task = tokio::spawn({
        let catalog = catalog.clone();
        async move {
            catalog
                .run(move |conn| {
                    let _ = started_tx.send(());
                    let result = conn.query_row(
                        "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n) \
                         SELECT COUNT(*) FROM n",
                        [],
                        |row| row.get::<_, i64>(0),
                    );
                    let _ = done_tx.send(result.as_ref().err().and_then(|e| e.sqlite_error_code()));
                    Ok(result?)
                })
                .await
        }
    });

    started_rx.await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());

    let code = tokio::task::spawn_blocking(move || done_rx.recv_timeout(Duration::from_secs(10)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(code, Some(rusqlite::ErrorCode::OperationInterrupted));
    assert_eq!(catalog.idle_connections(), 0);

    // The pool recovers with a fresh connection.
    let authors = catalog.list_authors(PageRequest::new(0, 10)).await.unwrap();
    assert_eq!(authors.total, 3);
    assert_eq!(catalog.idle_connections(), 1);
}

#[tokio::test]
async fn locked_catalog_request_times_out() {
    let lib = small_library();
    let mut config = lib.config(30);
    config.server.request_timeout_secs = 1;
    let router = create_router(AppState::new(config));

    // Readers wait on this lock for the connection's busy timeout.
    lib.conn.execute_batch("BEGIN EXCLUSIVE").unwrap();
    let started = std::time::Instant::now();
    let (status, _, _) = get(router, "/opds/authors").await;
    let elapsed = started.elapsed();
    lib.conn.execute_batch("COMMIT").unwrap();

    assert_eq!(status, StatusCode::REQUEST_TIMEOUT);
    assert!(elapsed < Duration::from_secs(4), "{:?}", elapsed);
}
