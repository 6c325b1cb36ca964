//! SQL against Calibre's `metadata.db` schema.
//!
//! Everything schema-specific lives here. Functions take a borrowed
//! connection and run synchronously; [`Catalog`](super::Catalog) moves them
//! onto the blocking pool.

use crate::error::{AppError, Result};
use crate::library::{AuthorRef, Book, BookFile, Group, GroupKind, Page, PageRequest, SeriesRef};
use chrono::{DateTime, Datelike, NaiveDateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use std::collections::HashMap;
use std::path::PathBuf;

/// Sort order for whole-library book listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookOrder {
    /// Most recently added first.
    Newest,
    /// Alphabetical by sort title.
    Title,
}

impl BookOrder {
    fn order_by(&self) -> &'static str {
        match self {
            BookOrder::Newest => "b.timestamp DESC, b.id DESC",
            BookOrder::Title => "COALESCE(b.sort, b.title) COLLATE NOCASE, b.id",
        }
    }
}

/// Table layout behind one kind of group.
struct GroupTable {
    table: &'static str,
    link_table: &'static str,
    link_column: &'static str,
    order_by: &'static str,
    books_order_by: &'static str,
}

fn group_table(kind: GroupKind) -> GroupTable {
    match kind {
        GroupKind::Author => GroupTable {
            table: "authors",
            link_table: "books_authors_link",
            link_column: "author",
            order_by: "COALESCE(g.sort, g.name) COLLATE NOCASE, g.id",
            books_order_by: "COALESCE(b.sort, b.title) COLLATE NOCASE, b.id",
        },
        GroupKind::Series => GroupTable {
            table: "series",
            link_table: "books_series_link",
            link_column: "series",
            order_by: "COALESCE(g.sort, g.name) COLLATE NOCASE, g.id",
            books_order_by: "b.series_index, b.id",
        },
        GroupKind::Tag => GroupTable {
            table: "tags",
            link_table: "books_tags_link",
            link_column: "tag",
            order_by: "g.name COLLATE NOCASE, g.id",
            books_order_by: "COALESCE(b.sort, b.title) COLLATE NOCASE, b.id",
        },
    }
}

const BOOK_COLUMNS: &str = "b.id, b.title, b.timestamp, b.pubdate, b.series_index, \
                            b.path, b.uuid, b.has_cover, b.last_modified";

/// Rows that can become a [`Book`]: a title and at least one date SQLite
/// can read. Filtering here keeps `COUNT(*)` and the page in agreement.
const USABLE_BOOK: &str = "TRIM(COALESCE(b.title, '')) <> '' \
                           AND (julianday(b.timestamp) IS NOT NULL \
                                OR julianday(b.last_modified) IS NOT NULL)";

/// A `books` row before related tables are joined in.
struct BookRow {
    id: i64,
    title: Option<String>,
    timestamp: Option<String>,
    pubdate: Option<String>,
    series_index: Option<f64>,
    path: Option<String>,
    uuid: Option<String>,
    has_cover: Option<bool>,
    last_modified: Option<String>,
}

impl BookRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            title: row.get(1)?,
            timestamp: row.get(2)?,
            pubdate: row.get(3)?,
            series_index: row.get(4)?,
            path: row.get(5)?,
            uuid: row.get(6)?,
            has_cover: row.get(7)?,
            last_modified: row.get(8)?,
        })
    }
}

/// Cheap query used by the readiness probe. Touches the `books` table so a
/// file that is not a Calibre catalog is reported as unavailable.
pub fn ping(conn: &Connection) -> Result<i64> {
    let count = conn.query_row("SELECT COUNT(*) FROM books", [], |row| row.get(0))?;
    Ok(count)
}

fn limit_params(page: PageRequest) -> (i64, i64) {
    (i64::from(page.limit), i64::from(page.offset))
}

fn to_total(count: i64) -> u64 {
    u64::try_from(count).unwrap_or(0)
}

/// List groups of one kind that have at least one book.
pub fn list_groups(conn: &Connection, kind: GroupKind, page: PageRequest) -> Result<Page<Group>> {
    let t = group_table(kind);

    let linked = format!(
        "FROM {link} l JOIN books b ON b.id = l.book WHERE l.{col} = g.id AND {usable}",
        link = t.link_table,
        col = t.link_column,
        usable = USABLE_BOOK,
    );

    let total: i64 = conn.query_row(
        &format!(
            "SELECT COUNT(*) FROM {table} g WHERE EXISTS (SELECT 1 {linked})",
            table = t.table,
            linked = linked,
        ),
        [],
        |row| row.get(0),
    )?;

    let sql = format!(
        "SELECT g.id, g.name, (SELECT COUNT(*) {linked}) \
         FROM {table} g \
         WHERE EXISTS (SELECT 1 {linked}) \
         ORDER BY {order} \
         LIMIT ?1 OFFSET ?2",
        table = t.table,
        linked = linked,
        order = t.order_by,
    );

    let (limit, offset) = limit_params(page);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![limit, offset], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, Option<String>>(1)?,
            row.get::<_, i64>(2)?,
        ))
    })?;

    let mut groups = Vec::new();
    for row in rows {
        let (id, name, book_count) = row?;
        match name {
            Some(name) => groups.push(Group {
                kind,
                id,
                name,
                book_count,
            }),
            None => tracing::warn!(kind = %kind, id, "Skipping group without a name"),
        }
    }

    Ok(Page::new(groups, page, to_total(total)))
}

/// Look up one group by id.
pub fn get_group(conn: &Connection, kind: GroupKind, id: i64) -> Result<Group> {
    let t = group_table(kind);
    let sql = format!(
        "SELECT g.name, \
                (SELECT COUNT(*) FROM {link} l JOIN books b ON b.id = l.book \
                 WHERE l.{col} = g.id AND {usable}) \
         FROM {table} g WHERE g.id = ?1",
        table = t.table,
        link = t.link_table,
        col = t.link_column,
        usable = USABLE_BOOK,
    );

    let row = conn
        .query_row(&sql, params![id], |row| {
            Ok((row.get::<_, Option<String>>(0)?, row.get::<_, i64>(1)?))
        })
        .optional()?;

    match row {
        Some((Some(name), book_count)) => Ok(Group {
            kind,
            id,
            name,
            book_count,
        }),
        Some((None, _)) => Err(AppError::Malformed(format!("{} {} has no name", kind, id))),
        None => Err(AppError::NotFound(format!("{} {}", kind, id))),
    }
}

/// Books linked to one group.
pub fn list_books_in_group(
    conn: &Connection,
    kind: GroupKind,
    id: i64,
    page: PageRequest,
) -> Result<Page<Book>> {
    let t = group_table(kind);

    let total: i64 = conn.query_row(
        &format!(
            "SELECT COUNT(*) FROM books b JOIN {link} l ON l.book = b.id \
             WHERE l.{col} = ?1 AND {usable}",
            link = t.link_table,
            col = t.link_column,
            usable = USABLE_BOOK,
        ),
        params![id],
        |row| row.get(0),
    )?;

    let sql = format!(
        "SELECT {columns} FROM books b JOIN {link} l ON l.book = b.id \
         WHERE l.{col} = ?1 AND {usable} \
         ORDER BY {order} \
         LIMIT ?2 OFFSET ?3",
        columns = BOOK_COLUMNS,
        link = t.link_table,
        col = t.link_column,
        usable = USABLE_BOOK,
        order = t.books_order_by,
    );

    let (limit, offset) = limit_params(page);
    let rows = select_rows(conn, &sql, params![id, limit, offset])?;
    let books = hydrate(conn, rows)?;

    Ok(Page::new(books, page, to_total(total)))
}

/// All books in the library.
pub fn list_books(conn: &Connection, order: BookOrder, page: PageRequest) -> Result<Page<Book>> {
    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM books b WHERE {}", USABLE_BOOK),
        [],
        |row| row.get(0),
    )?;

    let sql = format!(
        "SELECT {columns} FROM books b WHERE {usable} ORDER BY {order} LIMIT ?1 OFFSET ?2",
        columns = BOOK_COLUMNS,
        usable = USABLE_BOOK,
        order = order.order_by(),
    );

    let (limit, offset) = limit_params(page);
    let rows = select_rows(conn, &sql, params![limit, offset])?;
    let books = hydrate(conn, rows)?;

    Ok(Page::new(books, page, to_total(total)))
}

/// Books whose title or one of whose authors contains `query`.
pub fn search_books(conn: &Connection, query: &str, page: PageRequest) -> Result<Page<Book>> {
    let pattern = format!("%{}%", escape_like(query));
    let filter = format!(
        "{usable} AND (b.title LIKE ?1 ESCAPE '\\' \
                       OR EXISTS (SELECT 1 FROM books_authors_link l \
                                  JOIN authors a ON a.id = l.author \
                                  WHERE l.book = b.id AND a.name LIKE ?1 ESCAPE '\\'))",
        usable = USABLE_BOOK,
    );

    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM books b WHERE {}", filter),
        params![pattern],
        |row| row.get(0),
    )?;

    let sql = format!(
        "SELECT {columns} FROM books b WHERE {filter} \
         ORDER BY COALESCE(b.sort, b.title) COLLATE NOCASE, b.id \
         LIMIT ?2 OFFSET ?3",
        columns = BOOK_COLUMNS,
        filter = filter,
    );

    let (limit, offset) = limit_params(page);
    let rows = select_rows(conn, &sql, params![pattern, limit, offset])?;
    let books = hydrate(conn, rows)?;

    Ok(Page::new(books, page, to_total(total)))
}

/// One book by id.
pub fn get_book(conn: &Connection, id: i64) -> Result<Book> {
    let sql = format!("SELECT {} FROM books b WHERE b.id = ?1", BOOK_COLUMNS);
    let rows = select_rows(conn, &sql, params![id])?;
    if rows.is_empty() {
        return Err(AppError::NotFound(format!("book {}", id)));
    }

    hydrate(conn, rows)?
        .pop()
        .ok_or_else(|| AppError::Malformed(format!("book {} could not be read", id)))
}

fn select_rows(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> Result<Vec<BookRow>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, BookRow::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Attach authors, series, tags, files and descriptions to a batch of rows.
/// Rows that cannot be turned into a book are logged and dropped.
fn hydrate(conn: &Connection, rows: Vec<BookRow>) -> Result<Vec<Book>> {
    if rows.is_empty() {
        return Ok(Vec::new());
    }

    let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
    let placeholders = vec!["?"; ids.len()].join(",");

    let mut authors: HashMap<i64, Vec<AuthorRef>> = HashMap::new();
    {
        let sql = format!(
            "SELECT l.book, a.id, a.name FROM books_authors_link l \
             JOIN authors a ON a.id = l.author \
             WHERE l.book IN ({}) ORDER BY l.book, l.id",
            placeholders
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut cursor = stmt.query(params_from_iter(ids.iter()))?;
        while let Some(row) = cursor.next()? {
            let book: i64 = row.get(0)?;
            let name: Option<String> = row.get(2)?;
            if let Some(name) = name {
                authors.entry(book).or_default().push(AuthorRef {
                    id: row.get(1)?,
                    name,
                });
            }
        }
    }

    let mut series: HashMap<i64, SeriesRef> = HashMap::new();
    {
        let sql = format!(
            "SELECT l.book, s.id, s.name FROM books_series_link l \
             JOIN series s ON s.id = l.series \
             WHERE l.book IN ({})",
            placeholders
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut cursor = stmt.query(params_from_iter(ids.iter()))?;
        while let Some(row) = cursor.next()? {
            let name: Option<String> = row.get(2)?;
            if let Some(name) = name {
                series.insert(row.get(0)?, SeriesRef { id: row.get(1)?, name });
            }
        }
    }

    let mut tags: HashMap<i64, Vec<String>> = HashMap::new();
    {
        let sql = format!(
            "SELECT l.book, t.name FROM books_tags_link l \
             JOIN tags t ON t.id = l.tag \
             WHERE l.book IN ({}) ORDER BY l.book, t.name COLLATE NOCASE",
            placeholders
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut cursor = stmt.query(params_from_iter(ids.iter()))?;
        while let Some(row) = cursor.next()? {
            let name: Option<String> = row.get(1)?;
            if let Some(name) = name {
                tags.entry(row.get(0)?).or_default().push(name);
            }
        }
    }

    let mut files: HashMap<i64, Vec<BookFile>> = HashMap::new();
    {
        let sql = format!(
            "SELECT book, format, name, uncompressed_size FROM data \
             WHERE book IN ({}) ORDER BY book, format",
            placeholders
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut cursor = stmt.query(params_from_iter(ids.iter()))?;
        while let Some(row) = cursor.next()? {
            let book: i64 = row.get(0)?;
            let format: Option<String> = row.get(1)?;
            let name: Option<String> = row.get(2)?;
            match (format, name) {
                (Some(format), Some(name)) => files.entry(book).or_default().push(BookFile {
                    format: format.to_uppercase(),
                    name,
                    size: row.get(3)?,
                }),
                _ => tracing::warn!(book, "Skipping data row without format or name"),
            }
        }
    }

    let mut descriptions: HashMap<i64, String> = HashMap::new();
    {
        let sql = format!(
            "SELECT book, text FROM comments WHERE book IN ({})",
            placeholders
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut cursor = stmt.query(params_from_iter(ids.iter()))?;
        while let Some(row) = cursor.next()? {
            let text: Option<String> = row.get(1)?;
            if let Some(text) = text.filter(|t| !t.trim().is_empty()) {
                descriptions.insert(row.get(0)?, text);
            }
        }
    }

    let mut books = Vec::with_capacity(rows.len());
    for row in rows {
        let id = row.id;
        let book = build_book(
            row,
            authors.remove(&id).unwrap_or_default(),
            series.remove(&id),
            tags.remove(&id).unwrap_or_default(),
            files.remove(&id).unwrap_or_default(),
            descriptions.remove(&id),
        );
        match book {
            Ok(book) => books.push(book),
            Err(e) => tracing::warn!(book = id, error = %e, "Skipping malformed book"),
        }
    }

    Ok(books)
}

fn build_book(
    row: BookRow,
    authors: Vec<AuthorRef>,
    series: Option<SeriesRef>,
    tags: Vec<String>,
    files: Vec<BookFile>,
    description: Option<String>,
) -> Result<Book> {
    let title = row
        .title
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| AppError::Malformed("missing title".to_string()))?;

    let added = row.timestamp.as_deref().and_then(parse_timestamp);
    let modified = row.last_modified.as_deref().and_then(parse_timestamp);
    let (added, modified) = match (added, modified) {
        (Some(a), Some(m)) => (a, m),
        (Some(a), None) => (a, a),
        (None, Some(m)) => (m, m),
        (None, None) => {
            return Err(AppError::Malformed(format!(
                "unreadable timestamps {:?} / {:?}",
                row.timestamp, row.last_modified
            )));
        }
    };

    Ok(Book {
        id: row.id,
        title,
        authors,
        series,
        series_index: row.series_index.unwrap_or(1.0),
        tags,
        files,
        uuid: row.uuid,
        description,
        has_cover: row.has_cover.unwrap_or(false),
        path: PathBuf::from(row.path.unwrap_or_default()),
        added,
        published: row.pubdate.as_deref().and_then(parse_pubdate),
        modified,
    })
}

/// Parse a Calibre timestamp such as `2023-01-15 10:20:30.123456+00:00`.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%:z"))
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
                .ok()
                .map(|naive| naive.and_utc())
        })
}

/// Calibre stores "no publication date" as year 101.
fn parse_pubdate(raw: &str) -> Option<DateTime<Utc>> {
    parse_timestamp(raw).filter(|dt| dt.year() > 101)
}

/// Escape `%`, `_` and the escape character itself for a LIKE pattern.
fn escape_like(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Folder and file stem of one format of a book.
pub fn book_file_location(conn: &Connection, id: i64, format: &str) -> Result<(Book, BookFile)> {
    let book = get_book(conn, id)?;
    let file = book
        .file(format)
        .cloned()
        .ok_or_else(|| AppError::NotFound(format!("format {} of book {}", format, id)))?;
    Ok((book, file))
}
