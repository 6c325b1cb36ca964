//! HTTP request handlers.

use crate::catalog::BookOrder;
use crate::error::{AppError, Result};
use crate::library::{Book, GroupKind, Page};
use crate::opds::{
    self, ACQUISITION_MIME, ENTRY_MIME, Entry, FeedBuilder, NAVIGATION_MIME, OPENSEARCH_MIME,
};
use crate::server::AppState;
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio_util::io::ReaderStream;

/// Build a response, returning 500 on error (which shouldn't happen).
fn build_response(status: StatusCode, content_type: &str, body: impl Into<Body>) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .body(body.into())
        .unwrap_or_else(|_| {
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Body::from("Internal error"))
                .unwrap_or_default()
        })
}

/// Pagination query parameters accepted by every listing endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct PageParams {
    /// 0-based offset into the listing.
    offset: Option<u32>,
    /// 1-based page number, used when no offset is given.
    page: Option<u32>,
}

/// Search query parameters.
#[derive(Debug, Default, Deserialize)]
pub struct SearchParams {
    #[serde(default)]
    q: String,
    offset: Option<u32>,
    page: Option<u32>,
}

/// Newest `modified` among the page's books; feeds fall back to now.
fn newest_update(page: &Page<Book>) -> DateTime<Utc> {
    page.items
        .iter()
        .map(|b| b.modified)
        .max()
        .unwrap_or_else(Utc::now)
}

/// Common skeleton: id, title, start/up/search links. `up` is relative to
/// the base URL.
fn feed_skeleton(
    state: &AppState,
    id: impl Into<String>,
    title: impl Into<String>,
    up: &str,
) -> FeedBuilder {
    let base_url = state.base_url();
    FeedBuilder::new(id, title)
        .author(state.config.server.title.clone())
        .start_link(format!("{}/opds", base_url))
        .up_link(format!("{}{}", base_url, up))
        .search_link(format!("{}/opds/opensearch.xml", base_url))
}

fn acquisition_feed(
    state: &AppState,
    builder: FeedBuilder,
    path: &str,
    params: &[(&str, &str)],
    page: &Page<Book>,
) -> Result<Response<Body>> {
    let base_url = state.base_url();
    let mut feed = builder
        .updated(newest_update(page))
        .paginate(path, params, page, ACQUISITION_MIME);

    for book in &page.items {
        feed = feed.book_entry(book, base_url);
    }

    Ok(build_response(StatusCode::OK, ACQUISITION_MIME, feed.build()?))
}

// ============================================================================
// HEALTH
// ============================================================================

/// Liveness probe.
pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness probe: the catalog must be openable right now.
pub async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    match state.catalog.ping().await {
        Ok(()) => (StatusCode::OK, "ready"),
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "catalog unavailable")
        }
    }
}

// ============================================================================
// OPDS CATALOG
// ============================================================================

/// OpenSearch description.
pub async fn opensearch(State(state): State<AppState>) -> Result<Response<Body>> {
    let xml = opds::generate_opensearch(&state.config.server.title, state.base_url())?;
    Ok(build_response(StatusCode::OK, OPENSEARCH_MIME, xml))
}

/// Catalog root feed.
pub async fn catalog_root(State(state): State<AppState>) -> Result<Response<Body>> {
    let base_url = state.base_url();
    let now = Utc::now();

    let mut feed = FeedBuilder::new("urn:calibre-opds:root", &state.config.server.title)
        .author(state.config.server.title.clone())
        .self_link(format!("{}/opds", base_url), NAVIGATION_MIME)
        .start_link(format!("{}/opds", base_url))
        .search_link(format!("{}/opds/opensearch.xml", base_url));

    feed = feed
        .entry(Entry::navigation(
            "urn:calibre-opds:new",
            "Newest",
            "Books sorted by date added",
            format!("{}/opds/new", base_url),
            ACQUISITION_MIME,
            now,
        ))
        .entry(Entry::navigation(
            "urn:calibre-opds:titles",
            "By Title",
            "Books sorted by title",
            format!("{}/opds/titles", base_url),
            ACQUISITION_MIME,
            now,
        ));

    for kind in [GroupKind::Author, GroupKind::Series, GroupKind::Tag] {
        feed = feed.entry(Entry::navigation(
            format!("urn:calibre-opds:{}", kind.path_segment()),
            kind.feed_title(),
            format!("Browse books by {}", kind),
            format!("{}/opds/{}", base_url, kind.path_segment()),
            NAVIGATION_MIME,
            now,
        ));
    }

    Ok(build_response(StatusCode::OK, NAVIGATION_MIME, feed.build()?))
}

/// Navigation feed listing every group of one kind.
async fn group_list(state: AppState, kind: GroupKind, params: PageParams) -> Result<Response<Body>> {
    let request = state.page_request(params.offset, params.page);
    let page = state.catalog.list_groups(kind, request).await?;

    let base_url = state.base_url();
    let path = format!("{}/opds/{}", base_url, kind.path_segment());

    let mut feed = feed_skeleton(
        &state,
        format!("urn:calibre-opds:{}", kind.path_segment()),
        kind.feed_title(),
        "/opds",
    )
    .paginate(&path, &[], &page, NAVIGATION_MIME);

    for group in &page.items {
        feed = feed.group_entry(group, base_url);
    }

    Ok(build_response(StatusCode::OK, NAVIGATION_MIME, feed.build()?))
}

/// Acquisition feed for the books of one group.
async fn group_books(
    state: AppState,
    kind: GroupKind,
    id: i64,
    params: PageParams,
) -> Result<Response<Body>> {
    let group = state.catalog.get_group(kind, id).await?;
    let request = state.page_request(params.offset, params.page);
    let page = state.catalog.list_books_in_group(kind, id, request).await?;

    let path = format!("{}/opds/{}/{}", state.base_url(), kind.path_segment(), id);
    let builder = feed_skeleton(
        &state,
        kind.urn(id),
        kind.books_title(&group.name),
        &format!("/opds/{}", kind.path_segment()),
    );

    acquisition_feed(&state, builder, &path, &[], &page)
}

/// Authors navigation feed.
pub async fn authors(
    State(state): State<AppState>,
    Query(params): Query<PageParams>,
) -> Result<Response<Body>> {
    group_list(state, GroupKind::Author, params).await
}

/// Series navigation feed.
pub async fn series(
    State(state): State<AppState>,
    Query(params): Query<PageParams>,
) -> Result<Response<Body>> {
    group_list(state, GroupKind::Series, params).await
}

/// Tags navigation feed.
pub async fn tags(
    State(state): State<AppState>,
    Query(params): Query<PageParams>,
) -> Result<Response<Body>> {
    group_list(state, GroupKind::Tag, params).await
}

/// Books by one author.
pub async fn author_books(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(params): Query<PageParams>,
) -> Result<Response<Body>> {
    group_books(state, GroupKind::Author, id, params).await
}

/// Books in one series.
pub async fn series_books(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(params): Query<PageParams>,
) -> Result<Response<Body>> {
    group_books(state, GroupKind::Series, id, params).await
}

/// Books with one tag.
pub async fn tag_books(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(params): Query<PageParams>,
) -> Result<Response<Body>> {
    group_books(state, GroupKind::Tag, id, params).await
}

async fn library_books(state: AppState, order: BookOrder, params: PageParams) -> Result<Response<Body>> {
    let request = state.page_request(params.offset, params.page);
    let page = state.catalog.list_books(order, request).await?;

    let (segment, title) = match order {
        BookOrder::Newest => ("new", "Newest"),
        BookOrder::Title => ("titles", "By Title"),
    };
    let path = format!("{}/opds/{}", state.base_url(), segment);
    let builder = feed_skeleton(&state, format!("urn:calibre-opds:{}", segment), title, "/opds");

    acquisition_feed(&state, builder, &path, &[], &page)
}

/// Recently added books.
pub async fn catalog_new(
    State(state): State<AppState>,
    Query(params): Query<PageParams>,
) -> Result<Response<Body>> {
    library_books(state, BookOrder::Newest, params).await
}

/// All books by title.
pub async fn catalog_titles(
    State(state): State<AppState>,
    Query(params): Query<PageParams>,
) -> Result<Response<Body>> {
    library_books(state, BookOrder::Title, params).await
}

/// Search feed.
pub async fn catalog_search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Response<Body>> {
    let query = params.q.trim().to_string();
    if query.is_empty() {
        return Err(AppError::BadRequest("empty search query".to_string()));
    }

    let request = state.page_request(params.offset, params.page);
    let page = state.catalog.search_books(query.clone(), request).await?;

    let path = format!("{}/opds/search", state.base_url());
    let builder = feed_skeleton(
        &state,
        format!("urn:calibre-opds:search:{}", urlencoding::encode(&query)),
        format!("Search results for '{}'", query),
        "/opds",
    );

    acquisition_feed(&state, builder, &path, &[("q", query.as_str())], &page)
}

// ============================================================================
// BOOK HANDLERS
// ============================================================================

/// Complete OPDS entry for one book.
pub async fn book_entry(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Response<Body>> {
    let book = state.catalog.get_book(id).await?;
    let xml = opds::build_entry_document(&Entry::book(&book, state.base_url()))?;
    Ok(build_response(StatusCode::OK, ENTRY_MIME, xml))
}

/// Book download.
pub async fn book_download(
    State(state): State<AppState>,
    Path((id, format)): Path<(i64, String)>,
) -> Result<Response<Body>> {
    let (book, file, path) = state.catalog.book_file(id, format).await?;

    let handle = tokio::fs::File::open(&path).await?;
    let length = handle.metadata().await?.len();
    let body = Body::from_stream(ReaderStream::new(handle));

    let filename = book.download_filename(&file.extension());
    let ascii: String = filename
        .chars()
        .map(|c| if c.is_ascii() { c } else { '_' })
        .collect();
    let content_disposition = format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        ascii,
        urlencoding::encode(&filename)
    );

    tracing::info!(book = id, format = %file.format, size = length, "Serving book file");

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, file.mime_type())
        .header(header::CONTENT_DISPOSITION, content_disposition)
        .header(header::CONTENT_LENGTH, length)
        .body(body)
        .unwrap_or_else(|_| Response::default()))
}

/// Book cover image.
pub async fn book_cover(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Response<Body>> {
    let path = state.catalog.cover_file(id).await?;
    let data = tokio::fs::read(&path).await?;

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "image/jpeg")
        .header(header::CACHE_CONTROL, "public, max-age=86400")
        .body(Body::from(data))
        .unwrap_or_else(|_| Response::default()))
}
