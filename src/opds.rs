//! OPDS catalog generation.

use crate::error::{AppError, Result};
use crate::library::{Book, Group, Page};
use chrono::{DateTime, SecondsFormat, Utc};
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use std::io::{Cursor, Write};

/// Generic OPDS catalog content type.
pub const OPDS_MIME: &str = "application/atom+xml;profile=opds-catalog";
/// Navigation feed content type.
pub const NAVIGATION_MIME: &str = "application/atom+xml;profile=opds-catalog;kind=navigation";
/// Acquisition feed content type.
pub const ACQUISITION_MIME: &str = "application/atom+xml;profile=opds-catalog;kind=acquisition";
/// Single entry document content type.
pub const ENTRY_MIME: &str = "application/atom+xml;type=entry;profile=opds-catalog";
/// OpenSearch description content type.
pub const OPENSEARCH_MIME: &str = "application/opensearchdescription+xml";

const ATOM_NS: &str = "http://www.w3.org/2005/Atom";
const OPDS_NS: &str = "http://opds-spec.org/2010/catalog";
const DC_NS: &str = "http://purl.org/dc/terms/";

const REL_ACQUISITION: &str = "http://opds-spec.org/acquisition";
const REL_IMAGE: &str = "http://opds-spec.org/image";
const REL_THUMBNAIL: &str = "http://opds-spec.org/image/thumbnail";

/// OPDS feed link.
#[derive(Debug, Clone)]
pub struct Link {
    /// Link relation type (e.g., "self", "subsection", "acquisition").
    pub rel: String,
    /// URL of the linked resource.
    pub href: String,
    /// MIME type of the linked resource.
    pub link_type: String,
    /// Optional title for the link.
    pub title: Option<String>,
}

impl Link {
    /// Create a link without a title.
    pub fn new(rel: impl Into<String>, href: impl Into<String>, link_type: impl Into<String>) -> Self {
        Self {
            rel: rel.into(),
            href: href.into(),
            link_type: link_type.into(),
            title: None,
        }
    }

    /// Set the link title.
    pub fn titled(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

/// Entry author with an optional link to the author's feed.
#[derive(Debug, Clone)]
pub struct Person {
    /// Display name.
    pub name: String,
    /// Feed of the author's books.
    pub uri: Option<String>,
}

/// OPDS feed entry.
#[derive(Debug, Clone)]
pub struct Entry {
    /// Unique identifier for the entry.
    pub id: String,
    /// Entry title.
    pub title: String,
    /// Last update timestamp.
    pub updated: DateTime<Utc>,
    /// Authors list.
    pub authors: Vec<Person>,
    /// Publication date, rendered as `dc:issued`.
    pub issued: Option<DateTime<Utc>>,
    /// Short summary text.
    pub summary: Option<String>,
    /// Full description, HTML.
    pub content: Option<String>,
    /// Links associated with this entry.
    pub links: Vec<Link>,
    /// Categories/tags.
    pub categories: Vec<String>,
}

impl Entry {
    /// Navigation entry pointing at another feed.
    pub fn navigation(
        id: impl Into<String>,
        title: impl Into<String>,
        summary: impl Into<String>,
        href: impl Into<String>,
        link_type: &str,
        updated: DateTime<Utc>,
    ) -> Self {
        let title = title.into();
        Self {
            id: id.into(),
            updated,
            authors: Vec::new(),
            issued: None,
            summary: Some(summary.into()),
            content: None,
            links: vec![Link::new("subsection", href, link_type).titled(title.clone())],
            categories: Vec::new(),
            title,
        }
    }

    /// Navigation entry for an author, series or tag.
    pub fn group(group: &Group, base_url: &str, updated: DateTime<Utc>) -> Self {
        let books = if group.book_count == 1 {
            "1 book".to_string()
        } else {
            format!("{} books", group.book_count)
        };

        Self::navigation(
            group.kind.urn(group.id),
            group.name.clone(),
            books,
            format!("{}/opds/{}/{}", base_url, group.kind.path_segment(), group.id),
            ACQUISITION_MIME,
            updated,
        )
    }

    /// Acquisition entry for a book.
    pub fn book(book: &Book, base_url: &str) -> Self {
        let mut links = vec![Link::new(
            "alternate",
            format!("{}/opds/books/{}", base_url, book.id),
            ENTRY_MIME,
        )
        .titled("Full entry")];

        for file in &book.files {
            links.push(
                Link::new(
                    REL_ACQUISITION,
                    format!("{}/opds/books/{}/file/{}", base_url, book.id, file.extension()),
                    file.mime_type(),
                )
                .titled(file.format.clone()),
            );
        }

        if book.has_cover {
            let cover = format!("{}/opds/books/{}/cover", base_url, book.id);
            links.push(Link::new(REL_IMAGE, cover.clone(), "image/jpeg"));
            links.push(Link::new(REL_THUMBNAIL, cover, "image/jpeg"));
        }

        let mut summary = None;
        if let Some(series) = &book.series {
            links.push(
                Link::new(
                    "related",
                    format!("{}/opds/series/{}", base_url, series.id),
                    ACQUISITION_MIME,
                )
                .titled(format!("Series: {}", series.name)),
            );
            summary = Some(format!(
                "Book {} of {}",
                format_series_index(book.series_index),
                series.name
            ));
        }

        // Atom requires an author on every standalone entry.
        let mut authors: Vec<Person> = book
            .authors
            .iter()
            .map(|a| Person {
                name: a.name.clone(),
                uri: Some(format!("{}/opds/authors/{}", base_url, a.id)),
            })
            .collect();
        if authors.is_empty() {
            authors.push(Person {
                name: book.authors_display(),
                uri: None,
            });
        }

        Self {
            id: book.urn(),
            title: book.title.clone(),
            updated: book.modified,
            authors,
            issued: book.published,
            summary,
            content: book.description.clone(),
            links,
            categories: book.tags.clone(),
        }
    }
}

/// Render a series index without a trailing `.0`.
fn format_series_index(index: f64) -> String {
    if index.fract() == 0.0 {
        format!("{}", index as i64)
    } else {
        format!("{}", index)
    }
}

/// Build a feed href with an optional offset, keeping extra query parameters.
pub fn page_href(path: &str, params: &[(&str, &str)], offset: u32) -> String {
    let mut query: Vec<String> = params
        .iter()
        .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
        .collect();
    if offset > 0 {
        query.push(format!("offset={}", offset));
    }

    if query.is_empty() {
        path.to_string()
    } else {
        format!("{}?{}", path, query.join("&"))
    }
}

/// OPDS feed builder.
pub struct FeedBuilder {
    id: String,
    title: String,
    updated: DateTime<Utc>,
    author_name: Option<String>,
    links: Vec<Link>,
    entries: Vec<Entry>,
}

impl FeedBuilder {
    /// Create a new feed builder.
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            updated: Utc::now(),
            author_name: None,
            links: Vec::new(),
            entries: Vec::new(),
        }
    }

    /// Override the feed's `updated` timestamp.
    pub fn updated(mut self, updated: DateTime<Utc>) -> Self {
        self.updated = updated;
        self
    }

    /// Set the feed author.
    pub fn author(mut self, name: impl Into<String>) -> Self {
        self.author_name = Some(name.into());
        self
    }

    /// Add an arbitrary link.
    pub fn link(mut self, link: Link) -> Self {
        self.links.push(link);
        self
    }

    /// Add a self link.
    pub fn self_link(self, href: impl Into<String>, link_type: &str) -> Self {
        self.link(Link::new("self", href, link_type))
    }

    /// Add a start link.
    pub fn start_link(self, href: impl Into<String>) -> Self {
        self.link(Link::new("start", href, NAVIGATION_MIME))
    }

    /// Add an "up" link to the parent feed.
    pub fn up_link(self, href: impl Into<String>) -> Self {
        self.link(Link::new("up", href, NAVIGATION_MIME))
    }

    /// Add a search link.
    pub fn search_link(self, href: impl Into<String>) -> Self {
        self.link(Link::new("search", href, OPENSEARCH_MIME).titled("Search"))
    }

    /// Add the self link and first/previous/next/last links for a page.
    ///
    /// `next` appears iff `offset + limit < total`, `previous` iff
    /// `offset > 0`; `first` and `last` appear whenever `total > 0`.
    pub fn paginate<T>(
        mut self,
        path: &str,
        params: &[(&str, &str)],
        page: &Page<T>,
        link_type: &str,
    ) -> Self {
        self = self.self_link(page_href(path, params, page.offset), link_type);

        if let Some(last) = page.last_offset() {
            self = self.link(Link::new("first", page_href(path, params, 0), link_type));
            if let Some(previous) = page.previous_offset() {
                self = self.link(Link::new("previous", page_href(path, params, previous), link_type));
            }
            if let Some(next) = page.next_offset() {
                self = self.link(Link::new("next", page_href(path, params, next), link_type));
            }
            self = self.link(Link::new("last", page_href(path, params, last), link_type));
        } else if let Some(previous) = page.previous_offset() {
            self = self.link(Link::new("previous", page_href(path, params, previous), link_type));
        }

        self
    }

    /// Add an entry.
    pub fn entry(mut self, entry: Entry) -> Self {
        self.entries.push(entry);
        self
    }

    /// Add a book entry.
    pub fn book_entry(self, book: &Book, base_url: &str) -> Self {
        self.entry(Entry::book(book, base_url))
    }

    /// Add a navigation entry for a group.
    pub fn group_entry(self, group: &Group, base_url: &str) -> Self {
        let updated = self.updated;
        self.entry(Entry::group(group, base_url, updated))
    }

    /// Build the XML feed.
    pub fn build(self) -> Result<String> {
        let mut writer = Writer::new(Cursor::new(Vec::new()));

        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

        let mut feed = BytesStart::new("feed");
        push_namespaces(&mut feed);
        writer.write_event(Event::Start(feed))?;

        write_text_element(&mut writer, "id", &self.id)?;
        write_text_element(&mut writer, "title", &self.title)?;
        write_text_element(&mut writer, "updated", &format_time(&self.updated))?;

        if let Some(name) = &self.author_name {
            writer.write_event(Event::Start(BytesStart::new("author")))?;
            write_text_element(&mut writer, "name", name)?;
            writer.write_event(Event::End(BytesEnd::new("author")))?;
        }

        for link in &self.links {
            write_link(&mut writer, link)?;
        }

        for entry in &self.entries {
            write_entry(&mut writer, entry, false)?;
        }

        writer.write_event(Event::End(BytesEnd::new("feed")))?;

        into_string(writer)
    }
}

/// Build a standalone entry document (`type=entry`).
pub fn build_entry_document(entry: &Entry) -> Result<String> {
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    write_entry(&mut writer, entry, true)?;
    into_string(writer)
}

fn into_string(writer: Writer<Cursor<Vec<u8>>>) -> Result<String> {
    String::from_utf8(writer.into_inner().into_inner())
        .map_err(|e| AppError::Internal(format!("feed is not UTF-8: {}", e)))
}

fn push_namespaces(elem: &mut BytesStart<'_>) {
    elem.push_attribute(("xmlns", ATOM_NS));
    elem.push_attribute(("xmlns:opds", OPDS_NS));
    elem.push_attribute(("xmlns:dc", DC_NS));
}

/// Atom date, UTC with a `Z` suffix.
fn format_time(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Write a simple text element.
fn write_text_element<W: Write>(writer: &mut Writer<W>, name: &str, text: &str) -> std::io::Result<()> {
    writer.write_event(Event::Start(BytesStart::new(name)))?;
    writer.write_event(Event::Text(BytesText::new(text)))?;
    writer.write_event(Event::End(BytesEnd::new(name)))
}

/// Write a link element.
fn write_link<W: Write>(writer: &mut Writer<W>, link: &Link) -> std::io::Result<()> {
    let mut elem = BytesStart::new("link");
    elem.push_attribute(("rel", link.rel.as_str()));
    elem.push_attribute(("href", link.href.as_str()));
    elem.push_attribute(("type", link.link_type.as_str()));
    if let Some(title) = &link.title {
        elem.push_attribute(("title", title.as_str()));
    }
    writer.write_event(Event::Empty(elem))
}

/// Write an entry element. Standalone entries carry the namespace declarations.
fn write_entry<W: Write>(writer: &mut Writer<W>, entry: &Entry, standalone: bool) -> std::io::Result<()> {
    let mut start = BytesStart::new("entry");
    if standalone {
        push_namespaces(&mut start);
    }
    writer.write_event(Event::Start(start))?;

    write_text_element(writer, "id", &entry.id)?;
    write_text_element(writer, "title", &entry.title)?;
    write_text_element(writer, "updated", &format_time(&entry.updated))?;

    for author in &entry.authors {
        writer.write_event(Event::Start(BytesStart::new("author")))?;
        write_text_element(writer, "name", &author.name)?;
        if let Some(uri) = &author.uri {
            write_text_element(writer, "uri", uri)?;
        }
        writer.write_event(Event::End(BytesEnd::new("author")))?;
    }

    if let Some(issued) = &entry.issued {
        write_text_element(writer, "dc:issued", &issued.format("%Y-%m-%d").to_string())?;
    }

    if let Some(summary) = &entry.summary {
        let mut elem = BytesStart::new("summary");
        elem.push_attribute(("type", "text"));
        writer.write_event(Event::Start(elem))?;
        writer.write_event(Event::Text(BytesText::new(summary)))?;
        writer.write_event(Event::End(BytesEnd::new("summary")))?;
    }

    if let Some(content) = &entry.content {
        let mut elem = BytesStart::new("content");
        elem.push_attribute(("type", "html"));
        writer.write_event(Event::Start(elem))?;
        writer.write_event(Event::Text(BytesText::new(content)))?;
        writer.write_event(Event::End(BytesEnd::new("content")))?;
    }

    for link in &entry.links {
        write_link(writer, link)?;
    }

    for category in &entry.categories {
        let mut elem = BytesStart::new("category");
        elem.push_attribute(("term", category.as_str()));
        elem.push_attribute(("label", category.as_str()));
        writer.write_event(Event::Empty(elem))?;
    }

    writer.write_event(Event::End(BytesEnd::new("entry")))
}

/// Generate OpenSearch description XML.
pub fn generate_opensearch(title: &str, base_url: &str) -> Result<String> {
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    let mut root = BytesStart::new("OpenSearchDescription");
    root.push_attribute(("xmlns", "http://a9.com/-/spec/opensearch/1.1/"));
    writer.write_event(Event::Start(root))?;

    write_text_element(&mut writer, "ShortName", title)?;
    write_text_element(&mut writer, "Description", &format!("Search the {} catalog", title))?;
    write_text_element(&mut writer, "InputEncoding", "UTF-8")?;
    write_text_element(&mut writer, "OutputEncoding", "UTF-8")?;

    let template = format!("{}/opds/search?q={{searchTerms}}", base_url);
    let mut url = BytesStart::new("Url");
    url.push_attribute(("type", ACQUISITION_MIME));
    url.push_attribute(("template", template.as_str()));
    writer.write_event(Event::Empty(url))?;

    writer.write_event(Event::End(BytesEnd::new("OpenSearchDescription")))?;
    into_string(writer)
}
