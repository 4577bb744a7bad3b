use tracing::warn;
use url::Url;

use crate::extraction::config::{Pagination, PaginationType};

/// Build the URL of `page` for an optional `label`.
///
/// Never fails: a base URL that cannot be parsed falls back to the base URL
/// itself, and unknown strategies return it unchanged.
pub fn build_url(base_url: &str, page: u32, label: Option<&str>, pagination: &Pagination<'_>) -> String {
    match try_build_url(base_url, page, label, pagination) {
        Ok(url) => url,
        Err(e) => {
            warn!("Failed to build URL for page {} from {}: {}", page, base_url, e);
            base_url.to_string()
        }
    }
}

fn try_build_url(
    base_url: &str,
    page: u32,
    label: Option<&str>,
    pagination: &Pagination<'_>,
) -> Result<String, url::ParseError> {
    match pagination.kind {
        PaginationType::QueryParam => {
            let mut url = Url::parse(base_url)?;
            set_query_param(&mut url, pagination.page_param, &page.to_string());
            if let Some(label) = label {
                set_query_param(&mut url, pagination.label_param, label);
            }
            Ok(url.to_string())
        }
        PaginationType::Path => {
            let mut path_url = format!("{}/{}", base_url, page);
            if let Some(label) = label {
                path_url.push('/');
                path_url.push_str(label);
            }
            Ok(path_url)
        }
        PaginationType::Replace => {
            let mut replaced = base_url.replacen("{page}", &page.to_string(), 1);
            if let Some(label) = label {
                replaced = replaced.replacen("{label}", label, 1);
            }
            Ok(replaced)
        }
        PaginationType::Offset => {
            let mut url = Url::parse(base_url)?;
            let offset = u64::from(page.saturating_sub(1)) * u64::from(pagination.items_per_page);
            set_query_param(&mut url, "offset", &offset.to_string());
            if let Some(label) = label {
                set_query_param(&mut url, pagination.label_param, label);
            }
            Ok(url.to_string())
        }
        PaginationType::Unknown => Ok(base_url.to_string()),
    }
}

/// Set `key` to `value`, replacing any existing occurrences and keeping
/// every other parameter.
fn set_query_param(url: &mut Url, key: &str, value: &str) {
    let retained: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != key)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    let mut pairs = url.query_pairs_mut();
    pairs.clear();
    for (k, v) in &retained {
        pairs.append_pair(k, v);
    }
    pairs.append_pair(key, value);
}
