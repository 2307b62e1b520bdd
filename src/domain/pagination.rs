// 流水分页

use serde::Serialize;

/// 分页结果
#[derive(Debug, Clone, Serialize)]
pub struct Paginated<T> {
    pub data: Vec<T>,
    pub page: u32,
    pub page_size: u32,
    pub total: u64,
    pub total_pages: u32,
}

impl<T> Paginated<T> {
    pub fn new(data: Vec<T>, page: PageRequest, total: u64) -> Self {
        let total_pages = total.div_ceil(page.page_size as u64) as u32;

        Self {
            data,
            page: page.page,
            page_size: page.page_size,
            total,
            total_pages,
        }
    }
}

/// 分页参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub page_size: u32,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(None, None)
    }
}

impl PageRequest {
    pub fn new(page: Option<u32>, page_size: Option<u32>) -> Self {
        Self {
            page: page.unwrap_or(1).max(1),
            page_size: page_size.unwrap_or(20).clamp(1, 100), // 限制在1-100之间
        }
    }

    pub fn offset(&self) -> i64 {
        (self.page as i64 - 1) * self.page_size as i64
    }

    pub fn limit(&self) -> i64 {
        self.page_size as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_request() {
        let params = PageRequest::new(Some(2), Some(10));
        assert_eq!(params.offset(), 10);
        assert_eq!(params.limit(), 10);
    }

    #[test]
    fn test_page_request_clamps() {
        let params = PageRequest::new(Some(0), Some(1000));
        assert_eq!(params.page, 1);
        assert_eq!(params.page_size, 100);
        assert_eq!(params.offset(), 0);
    }

    #[test]
    fn test_total_pages() {
        let response = Paginated::new(vec![1, 2, 3], PageRequest::new(Some(1), Some(10)), 25);
        assert_eq!(response.total_pages, 3);

        let empty: Paginated<u8> = Paginated::new(vec![], PageRequest::default(), 0);
        assert_eq!(empty.total_pages, 0);
    }
}
