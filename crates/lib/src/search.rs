//! Web search for search-augmented replies.
//!
//! [`SearchProvider`] returns a single text blob for the model. [`DuckDuckGoSearch`]
//! scrapes the DuckDuckGo HTML endpoint, which needs no API key.

use async_trait::async_trait;

const DDG_HTML_URL: &str = "https://html.duckduckgo.com/html/";

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("search request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("search provider returned HTTP {0}")]
    Status(reqwest::StatusCode),
    #[error("search provider refused the request (captcha)")]
    Blocked,
    #[error("search is disabled")]
    Disabled,
}

/// Resolves a query to search-result text.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &str) -> Result<String, SearchError>;
}

/// Stand-in provider when search is turned off in config.
pub struct DisabledSearch;

#[async_trait]
impl SearchProvider for DisabledSearch {
    async fn search(&self, _query: &str) -> Result<String, SearchError> {
        Err(SearchError::Disabled)
    }
}

#[derive(Clone)]
pub struct DuckDuckGoSearch {
    client: reqwest::Client,
    max_results: usize,
}

impl DuckDuckGoSearch {
    pub fn new(max_results: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            max_results: max_results.max(1),
        }
    }
}

#[async_trait]
impl SearchProvider for DuckDuckGoSearch {
    async fn search(&self, query: &str) -> Result<String, SearchError> {
        let res = self
            .client
            .post(DDG_HTML_URL)
            .header("Referer", "https://html.duckduckgo.com/")
            .form(&[("q", query), ("b", "")])
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(SearchError::Status(res.status()));
        }
        let html = res.text().await?;
        if html.contains("challenge-form") || html.contains("not a Robot") {
            log::warn!("search: duckduckgo returned a captcha challenge");
            return Err(SearchError::Blocked);
        }
        let results = parse_results(&html, self.max_results);
        log::debug!("search: {} result(s) for {:?}", results.len(), query);
        Ok(format_results(&results))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchHit {
    pub title: String,
    pub snippet: String,
}

/// Pull titles and snippets out of a DuckDuckGo HTML result page.
fn parse_results(html: &str, max: usize) -> Vec<SearchHit> {
    let mut hits = Vec::new();
    let mut from = 0;
    while hits.len() < max {
        let Some(pos) = html[from..].find("class=\"result__a\"") else {
            break;
        };
        let anchor = from + pos;
        from = anchor + 1;
        let title = element_text(html, anchor);
        let next_anchor = html[from..]
            .find("class=\"result__a\"")
            .map(|p| from + p)
            .unwrap_or(html.len());
        let snippet = html[anchor..next_anchor]
            .find("class=\"result__snippet\"")
            .map(|p| element_text(html, anchor + p))
            .unwrap_or_default();
        if !title.is_empty() {
            hits.push(SearchHit { title, snippet });
        }
    }
    hits
}

/// Text content of the element whose opening tag contains `attr_pos`.
fn element_text(html: &str, attr_pos: usize) -> String {
    let Some(close) = html[attr_pos..].find('>') else {
        return String::new();
    };
    let start = attr_pos + close + 1;
    let rest = &html[start..];
    let end = find_element_end(rest);
    crate::fetch::html_to_text(&rest[..end])
}

/// End of an element's inner text, skipping over inline `<b>` highlights.
fn find_element_end(s: &str) -> usize {
    let mut from = 0;
    while let Some(p) = s[from..].find("</") {
        let at = from + p;
        if s[at..].starts_with("</b>") {
            from = at + 4;
            continue;
        }
        return at;
    }
    s.len()
}

fn format_results(hits: &[SearchHit]) -> String {
    if hits.is_empty() {
        return "No good search result was found".to_string();
    }
    hits.iter()
        .map(|h| {
            if h.snippet.is_empty() {
                h.title.clone()
            } else {
                format!("{}: {}", h.title, h.snippet)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
<div class="result">
  <a rel="nofollow" class="result__a" href="//duckduckgo.com/l/?uddg=https%3A%2F%2Frust-lang.org">Rust <b>Programming</b> Language</a>
  <a class="result__snippet" href="x">A language empowering <b>everyone</b> &amp; more.</a>
</div>
<div class="result">
  <a rel="nofollow" class="result__a" href="https://blog.rust-lang.org">Rust Blog</a>
</div>
"#;

    #[test]
    fn parses_titles_and_snippets() {
        let hits = parse_results(PAGE, 5);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].title, "Rust Programming Language");
        assert_eq!(hits[0].snippet, "A language empowering everyone & more.");
        assert_eq!(hits[1].title, "Rust Blog");
        assert_eq!(hits[1].snippet, "");
    }

    #[test]
    fn respects_max_results() {
        assert_eq!(parse_results(PAGE, 1).len(), 1);
    }

    #[test]
    fn formats_blob() {
        let blob = format_results(&parse_results(PAGE, 5));
        assert_eq!(
            blob,
            "Rust Programming Language: A language empowering everyone & more.\nRust Blog"
        );
        assert_eq!(format_results(&[]), "No good search result was found");
    }

    #[tokio::test]
    async fn disabled_search_errors() {
        assert!(matches!(
            DisabledSearch.search("q").await,
            Err(SearchError::Disabled)
        ));
    }
}
