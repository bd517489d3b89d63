use serde::{Deserialize, Serialize};

/// Upper bound on a page size requested by a caller.
pub const MAX_PAGE_SIZE: u32 = 100;

/// A 1-based page request. Out-of-range values are clamped, never rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub num: u32,
    pub size: u32,
}

impl PageRequest {
    pub fn new(num: u32, size: u32) -> Self {
        Self {
            num: num.max(1),
            size: size.clamp(1, MAX_PAGE_SIZE),
        }
    }

    /// SQL `OFFSET` for this page.
    pub fn offset(&self) -> i64 {
        (self.num.max(1) as i64 - 1) * self.limit()
    }

    /// SQL `LIMIT` for this page.
    pub fn limit(&self) -> i64 {
        self.size.clamp(1, MAX_PAGE_SIZE) as i64
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(1, 10)
    }
}

/// One page of results plus the total row count matching the filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pager<T> {
    pub data: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub size: u32,
}

impl<T> Pager<T> {
    pub fn new(data: Vec<T>, total: u64, req: PageRequest) -> Self {
        Self {
            data,
            total,
            page: req.num,
            size: req.size,
        }
    }

    /// Number of pages needed to show `total` rows.
    pub fn pages(&self) -> u64 {
        if self.size == 0 {
            return 0;
        }
        self.total.div_ceil(self.size as u64)
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Pager<U> {
        Pager {
            data: self.data.into_iter().map(f).collect(),
            total: self.total,
            page: self.page,
            size: self.size,
        }
    }
}

/// Current UTC time as RFC 3339, the timestamp format of every table.
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_request_clamps() {
        let req = PageRequest::new(0, 1_000);
        assert_eq!(req.num, 1);
        assert_eq!(req.size, MAX_PAGE_SIZE);
        assert_eq!(req.offset(), 0);

        let req = PageRequest::new(3, 20);
        assert_eq!(req.offset(), 40);
        assert_eq!(req.limit(), 20);
    }

    #[test]
    fn pager_counts_pages() {
        let pager = Pager::new(vec![1, 2, 3], 21, PageRequest::new(1, 10));
        assert_eq!(pager.pages(), 3);
        let doubled = pager.map(|n| n * 2);
        assert_eq!(doubled.data, vec![2, 4, 6]);
        assert_eq!(doubled.total, 21);
    }
}
