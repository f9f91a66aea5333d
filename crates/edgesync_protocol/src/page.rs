//! Pagination requests and responses for bulk entity reads.

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    /// Ascending.
    #[default]
    Asc,
    /// Descending.
    Desc,
}

/// Sort key and direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortOrder {
    /// Property to sort on. Must be unique per entity for stable paging.
    pub property: String,
    /// Direction.
    pub direction: SortDirection,
}

impl SortOrder {
    /// Creates a sort order.
    pub fn new(property: impl Into<String>, direction: SortDirection) -> Self {
        Self {
            property: property.into(),
            direction,
        }
    }
}

/// Position within a paged upstream query.
///
/// A `PageLink` fully describes one page request, so a fetch that fails
/// can be retried with the same link and will observe the same page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageLink {
    /// Entities per page. Always at least 1.
    pub page_size: u32,
    /// Zero-based page index.
    pub page: u32,
    /// Optional text filter.
    pub text_search: Option<String>,
    /// Optional sort order.
    pub sort_order: Option<SortOrder>,
    /// Optional lower time bound (ms, inclusive).
    pub start_time: Option<u64>,
    /// Optional upper time bound (ms, exclusive).
    pub end_time: Option<u64>,
}

impl PageLink {
    /// First page with the given size.
    pub fn new(page_size: u32) -> Self {
        Self {
            page_size: page_size.max(1),
            page: 0,
            text_search: None,
            sort_order: None,
            start_time: None,
            end_time: None,
        }
    }

    /// Sets the sort order.
    pub fn with_sort_order(mut self, sort_order: SortOrder) -> Self {
        self.sort_order = Some(sort_order);
        self
    }

    /// Sets the text filter.
    pub fn with_text_search(mut self, text: impl Into<String>) -> Self {
        self.text_search = Some(text.into());
        self
    }

    /// Sets the time window.
    pub fn with_time_window(mut self, start: Option<u64>, end: Option<u64>) -> Self {
        self.start_time = start;
        self.end_time = end;
        self
    }

    /// The link for the page after this one.
    pub fn next_page_link(&self) -> Self {
        let mut next = self.clone();
        next.page += 1;
        next
    }

    /// Index of the first item of this page.
    pub fn offset(&self) -> usize {
        self.page as usize * self.page_size as usize
    }
}

/// One page of results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageData<T> {
    /// Items on this page, in sort order.
    pub data: Vec<T>,
    /// Total number of pages.
    pub total_pages: u32,
    /// Total number of items across all pages.
    pub total_elements: u64,
    /// Whether another page follows.
    pub has_next: bool,
}

impl<T> PageData<T> {
    /// Creates a page.
    pub fn new(data: Vec<T>, total_pages: u32, total_elements: u64, has_next: bool) -> Self {
        Self {
            data,
            total_pages,
            total_elements,
            has_next,
        }
    }

    /// An empty final page.
    pub fn empty() -> Self {
        Self::new(Vec::new(), 0, 0, false)
    }

    /// True when no page should be requested after this one.
    ///
    /// A short page ends iteration even if the source claims `has_next`.
    pub fn is_last(&self, link: &PageLink) -> bool {
        !self.has_next || self.data.len() < link.page_size as usize
    }
}

impl<T: Clone> PageData<T> {
    /// Cuts the page described by `link` out of an already sorted slice.
    pub fn from_sorted(items: &[T], link: &PageLink) -> Self {
        let size = link.page_size.max(1) as usize;
        let total = items.len();
        let start = link.offset().min(total);
        let end = (start + size).min(total);
        let total_pages = total.div_ceil(size) as u32;
        Self::new(
            items[start..end].to_vec(),
            total_pages,
            total as u64,
            end < total,
        )
    }
}
