//! Offset pagination shared by the catalog and the feed renderer.

/// A requested window into an ordered result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    /// Number of items to skip.
    pub offset: u32,
    /// Maximum number of items to return. Always positive.
    pub limit: u32,
}

impl PageRequest {
    /// Create a request, clamping a zero limit to one.
    pub fn new(offset: u32, limit: u32) -> Self {
        Self {
            offset,
            limit: limit.max(1),
        }
    }

    /// Request for a 1-based page number.
    pub fn from_page_number(page: u32, limit: u32) -> Self {
        let limit = limit.max(1);
        Self::new(page.saturating_sub(1).saturating_mul(limit), limit)
    }
}

/// One page of an ordered result set together with the set's total size.
#[derive(Debug, Clone)]
pub struct Page<T> {
    /// Items in this page, in catalog order.
    pub items: Vec<T>,
    /// Offset of the first item.
    pub offset: u32,
    /// Page size the page was requested with.
    pub limit: u32,
    /// Size of the whole result set.
    pub total: u64,
}

impl<T> Page<T> {
    /// Build a page from query results.
    pub fn new(items: Vec<T>, request: PageRequest, total: u64) -> Self {
        Self {
            items,
            offset: request.offset,
            limit: request.limit,
            total,
        }
    }

    /// Whether a following page exists.
    pub fn has_next(&self) -> bool {
        u64::from(self.offset) + u64::from(self.limit) < self.total
    }

    /// Whether a preceding page exists.
    pub fn has_previous(&self) -> bool {
        self.offset > 0
    }

    /// Offset of the following page.
    pub fn next_offset(&self) -> Option<u32> {
        self.has_next().then(|| self.offset.saturating_add(self.limit))
    }

    /// Offset of the preceding page. Past the end this is the last page,
    /// or the first one for an empty set.
    pub fn previous_offset(&self) -> Option<u32> {
        if !self.has_previous() {
            return None;
        }
        match self.last_offset() {
            Some(last) if self.offset > last => Some(last),
            None => Some(0),
            _ => Some(self.offset.saturating_sub(self.limit)),
        }
    }

    /// Offset of the last page, aligned to the page size. `None` for an empty set.
    pub fn last_offset(&self) -> Option<u32> {
        if self.total == 0 {
            return None;
        }
        let limit = u64::from(self.limit);
        let last = (self.total - 1) / limit * limit;
        Some(u32::try_from(last).unwrap_or(u32::MAX))
    }

    /// Number of items in this page.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether this page holds no items.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
