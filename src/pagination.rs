use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::PaginationConfig;
use crate::error::{AppError, AppResult};

/// `page_num`/`page_size` query parameters shared by every list route.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PageParams {
    pub page_num: Option<u64>,
    pub page_size: Option<u64>,
}

/// Validated page window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub page_num: u64,
    pub page_size: u64,
    pub skip: u64,
}

impl PageParams {
    pub fn resolve(&self, cfg: &PaginationConfig) -> AppResult<Page> {
        let page_num = self.page_num.unwrap_or(1);
        let page_size = self.page_size.unwrap_or(cfg.default_page_size);
        if page_num == 0 {
            return Err(AppError::validation("page_num", "page_num must be at least 1"));
        }
        if page_size == 0 {
            return Err(AppError::validation("page_size", "page_size must be at least 1"));
        }
        let page_size = page_size.min(cfg.max_page_size);
        let skip = (page_num - 1)
            .checked_mul(page_size)
            .ok_or_else(|| AppError::validation("page_num", "page_num is too large"))?;
        Ok(Page { page_num, page_size, skip })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PageLinks {
    pub next: Option<String>,
    pub previous: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Paginated<T> {
    pub data: Vec<T>,
    pub total: u64,
    pub count: u64,
    pub pagination: PageLinks,
    pub message: String,
}

/// Builds links for the neighbouring pages of `route`, carrying over `extra` query
/// parameters (already filtered to the ones the route accepts).
pub fn page_links(route: &str, page: Page, returned: u64, total: u64, extra: &[(&str, String)]) -> PageLinks {
    let link = |num: u64| {
        let mut query = format!("page_num={}&page_size={}", num, page.page_size);
        for (k, v) in extra {
            query.push('&');
            query.push_str(k);
            query.push('=');
            query.push_str(&encode_query_value(v));
        }
        format!("{}?{}", route, query)
    };
    let next = if page.skip.saturating_add(returned) < total { Some(link(page.page_num + 1)) } else { None };
    let previous = if page.page_num > 1 { Some(link(page.page_num - 1)) } else { None };
    PageLinks { next, previous }
}

/// Percent-encodes everything outside the URL unreserved set.
fn encode_query_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for b in value.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

pub fn paginate(
    route: &str,
    page: Page,
    data: Vec<Value>,
    total: u64,
    extra: &[(&str, String)],
) -> Paginated<Value> {
    let count = data.len() as u64;
    Paginated {
        pagination: page_links(route, page, count, total, extra),
        data,
        total,
        count,
        message: "Get data.".to_string(),
    }
}
