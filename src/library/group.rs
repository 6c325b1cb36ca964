//! Navigation groups: authors, series and tags.

use std::fmt;

/// Kind of grouping a navigation feed lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupKind {
    /// Books grouped by author.
    Author,
    /// Books grouped by series.
    Series,
    /// Books grouped by tag.
    Tag,
}

impl GroupKind {
    /// URL path segment under `/opds`.
    pub fn path_segment(&self) -> &'static str {
        match self {
            GroupKind::Author => "authors",
            GroupKind::Series => "series",
            GroupKind::Tag => "tags",
        }
    }

    /// Title of the navigation feed listing all groups of this kind.
    pub fn feed_title(&self) -> &'static str {
        match self {
            GroupKind::Author => "Authors",
            GroupKind::Series => "Series",
            GroupKind::Tag => "Tags",
        }
    }

    /// Title of the acquisition feed for one group.
    pub fn books_title(&self, name: &str) -> String {
        match self {
            GroupKind::Author => format!("Books by {}", name),
            GroupKind::Series => format!("Series: {}", name),
            GroupKind::Tag => format!("Tagged: {}", name),
        }
    }

    /// Stable URN prefix for feeds and entries of this kind.
    pub fn urn(&self, id: i64) -> String {
        format!("urn:calibre-opds:{}:{}", self.path_segment(), id)
    }
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GroupKind::Author => "author",
            GroupKind::Series => "series",
            GroupKind::Tag => "tag",
        };
        f.write_str(name)
    }
}

/// An author, series or tag with the number of books it groups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    /// Which table this group comes from.
    pub kind: GroupKind,
    /// Calibre id.
    pub id: i64,
    /// Display name.
    pub name: String,
    /// Number of books linked to this group.
    pub book_count: i64,
}
