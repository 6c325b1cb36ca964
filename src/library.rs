//! Catalog models: books, navigation groups and feed pages.

pub mod book;
pub mod group;
pub mod page;

pub use book::{AuthorRef, Book, BookFile, BookFormat, SeriesRef};
pub use group::{Group, GroupKind};
pub use page::{Page, PageRequest};
