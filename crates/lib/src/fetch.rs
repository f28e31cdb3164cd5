//! Web page fetching for URL summaries.
//!
//! [`WebContentFetcher`] never fails: errors come back as an inline diagnostic so the
//! dispatcher can still answer. [`HttpFetcher`] is the reqwest-backed implementation.

use async_trait::async_trait;
use encoding_rs::{Encoding, UTF_8};
use futures_util::StreamExt;
use regex::Regex;
use std::net::IpAddr;
use std::sync::LazyLock;
use std::time::Duration;
use url::{Host, Url};

/// Default bound on extracted text, in characters.
pub const DEFAULT_MAX_CHARS: usize = 5000;

/// Raw body bytes read before giving up on the rest of a page.
const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

const MAX_REDIRECTS: usize = 5;

/// Bytes scanned for a `<meta charset>` when the header has none.
const META_SNIFF_BYTES: usize = 2048;

static URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"https?://[A-Za-z0-9\-._~:/?#\[\]@!$&'()*+,;=%]+").expect("valid url regex")
});

static META_CHARSET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)<meta[^>]*charset\s*=\s*["']?([A-Za-z0-9_\-:.]+)"#)
        .expect("valid meta charset regex")
});

/// All `http(s)://` URLs in `text`, in order of appearance, verbatim.
pub fn extract_urls(text: &str) -> Vec<&str> {
    URL_RE.find_iter(text).map(|m| m.as_str()).collect()
}

/// Resolves a URL to plain text.
#[async_trait]
pub trait WebContentFetcher: Send + Sync {
    /// Plain text of the page, bounded in length; failures become a diagnostic string.
    async fn fetch(&self, url: &str) -> String;
}

#[derive(Debug, thiserror::Error)]
enum FetchFailure {
    #[error("{0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("HTTP {0}")]
    Status(reqwest::StatusCode),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("could not resolve {0}")]
    Resolve(String),
    #[error("{0} resolves to a private address")]
    PrivateHost(String),
}

/// Fetches pages over HTTP and reduces HTML to text.
///
/// Hosts resolving to loopback, private or link-local addresses are refused unless
/// [`HttpFetcher::allow_private_hosts`] is set.
#[derive(Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    max_chars: usize,
    timeout: Duration,
    allow_private_hosts: bool,
}

impl HttpFetcher {
    pub fn new(max_chars: usize, timeout: Duration) -> Self {
        Self {
            client: build_client(false),
            max_chars,
            timeout,
            allow_private_hosts: false,
        }
    }

    pub fn allow_private_hosts(mut self, allow: bool) -> Self {
        self.client = build_client(allow);
        self.allow_private_hosts = allow;
        self
    }

    async fn fetch_body(&self, url: &str) -> Result<String, FetchFailure> {
        let url = Url::parse(url)?;
        if !self.allow_private_hosts {
            ensure_public_host(&url).await?;
        }
        let res = self.client.get(url.clone()).send().await?;
        if !res.status().is_success() {
            return Err(FetchFailure::Status(res.status()));
        }
        let content_type = res
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let mut stream = res.bytes_stream();
        let mut body = Vec::new();
        while let Some(chunk) = stream.next().await {
            body.extend_from_slice(&chunk?);
            if body.len() >= MAX_BODY_BYTES {
                log::debug!("fetch: body of {} truncated at {} bytes", url, MAX_BODY_BYTES);
                body.truncate(MAX_BODY_BYTES);
                break;
            }
        }
        Ok(decode_body(&body, content_type.as_deref()))
    }

    async fn try_fetch(&self, url: &str) -> Result<String, FetchFailure> {
        let body = tokio::time::timeout(self.timeout, self.fetch_body(url))
            .await
            .map_err(|_| FetchFailure::Timeout(self.timeout))??;
        Ok(truncate_chars(&html_to_text(&body), self.max_chars))
    }
}

#[async_trait]
impl WebContentFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> String {
        match self.try_fetch(url).await {
            Ok(text) => text,
            Err(e) => {
                log::warn!("fetch: {} failed: {}", url, e);
                format!("Error fetching webpage: {}", e)
            }
        }
    }
}

/// Redirects to literal private addresses are stopped; named hosts were checked up front.
fn build_client(allow_private: bool) -> reqwest::Client {
    let policy = reqwest::redirect::Policy::custom(move |attempt| {
        if attempt.previous().len() >= MAX_REDIRECTS {
            return attempt.error("too many redirects");
        }
        let private = match attempt.url().host() {
            Some(Host::Ipv4(ip)) => is_private_ip(&IpAddr::V4(ip)),
            Some(Host::Ipv6(ip)) => is_private_ip(&IpAddr::V6(ip)),
            _ => false,
        };
        if private && !allow_private {
            attempt.error("redirect to a private address")
        } else {
            attempt.follow()
        }
    });
    reqwest::Client::builder()
        .redirect(policy)
        .build()
        .unwrap_or_else(|e| {
            log::warn!("fetch: client builder failed ({}), using defaults", e);
            reqwest::Client::new()
        })
}

async fn ensure_public_host(url: &Url) -> Result<(), FetchFailure> {
    let blocked = |host: &str| FetchFailure::PrivateHost(host.to_string());
    match url.host() {
        Some(Host::Ipv4(ip)) if is_private_ip(&IpAddr::V4(ip)) => Err(blocked(&ip.to_string())),
        Some(Host::Ipv6(ip)) if is_private_ip(&IpAddr::V6(ip)) => Err(blocked(&ip.to_string())),
        Some(Host::Ipv4(_)) | Some(Host::Ipv6(_)) => Ok(()),
        Some(Host::Domain(domain)) => {
            let port = url.port_or_known_default().unwrap_or(80);
            let addrs: Vec<_> = tokio::net::lookup_host((domain, port))
                .await
                .map_err(|_| FetchFailure::Resolve(domain.to_string()))?
                .collect();
            if addrs.is_empty() {
                return Err(FetchFailure::Resolve(domain.to_string()));
            }
            if addrs.iter().any(|a| is_private_ip(&a.ip())) {
                return Err(blocked(domain));
            }
            Ok(())
        }
        None => Err(FetchFailure::Resolve(url.to_string())),
    }
}

/// Loopback, private, link-local, CGNAT, unspecified or broadcast.
pub fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                || (o[0] == 100 && (o[1] & 0xC0) == 64)
                || (o[0] == 192 && o[1] == 0 && o[2] == 0)
        }
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_private_ip(&IpAddr::V4(v4));
            }
            v6.is_loopback()
                || v6.is_unspecified()
                || (v6.segments()[0] & 0xFE00) == 0xFC00
                || (v6.segments()[0] & 0xFFC0) == 0xFE80
        }
    }
}

/// Decode a response body using the `Content-Type` charset, else a `<meta charset>`
/// near the top of the page, else UTF-8. A byte-order mark overrides both.
pub fn decode_body(body: &[u8], content_type: Option<&str>) -> String {
    let encoding = content_type
        .and_then(charset_from_content_type)
        .and_then(|label| Encoding::for_label(label.as_bytes()))
        .or_else(|| {
            charset_from_meta(body).and_then(|label| Encoding::for_label(label.as_bytes()))
        })
        .unwrap_or(UTF_8);
    let (text, used, had_errors) = encoding.decode(body);
    if had_errors {
        log::debug!("fetch: body had invalid {} sequences", used.name());
    }
    text.into_owned()
}

fn charset_from_content_type(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("charset") {
            return None;
        }
        let value = value.trim().trim_matches(|c| c == '"' || c == '\'');
        (!value.is_empty()).then(|| value.to_string())
    })
}

fn charset_from_meta(body: &[u8]) -> Option<String> {
    let head = String::from_utf8_lossy(&body[..body.len().min(META_SNIFF_BYTES)]);
    META_CHARSET_RE
        .captures(&head)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Strip tags, drop script/style content, decode basic entities, collapse whitespace.
pub fn html_to_text(html: &str) -> String {
    let mut result = String::with_capacity(html.len() / 2);
    let mut in_tag = false;
    let mut skip_until: Option<&'static str> = None;
    let lower = html.to_ascii_lowercase();
    let mut i = 0;

    while i < html.len() {
        let rest = &html[i..];
        let rest_lower = &lower[i..];

        if let Some(close) = skip_until {
            match rest_lower.find(close) {
                Some(pos) => {
                    i += pos + close.len();
                    skip_until = None;
                    push_space(&mut result);
                }
                None => break,
            }
            continue;
        }

        if rest.starts_with('<') && opens_markup(rest) {
            if rest_lower.starts_with("<script") {
                skip_until = Some("</script>");
            } else if rest_lower.starts_with("<style") {
                skip_until = Some("</style>");
            } else {
                in_tag = true;
            }
            push_space(&mut result);
            i += 1;
            continue;
        }

        let Some(ch) = rest.chars().next() else { break };
        if in_tag {
            if ch == '>' {
                in_tag = false;
            }
            i += ch.len_utf8();
            continue;
        }

        if ch == '&' {
            if let Some((decoded, len)) = decode_entity(rest) {
                if decoded == ' ' {
                    push_space(&mut result);
                } else {
                    result.push(decoded);
                }
                i += len;
                continue;
            }
        }

        if ch.is_whitespace() {
            push_space(&mut result);
        } else {
            result.push(ch);
        }
        i += ch.len_utf8();
    }

    result.trim().to_string()
}

/// A `<` only starts markup when a tag name, `/`, `!` or `?` follows; otherwise it is text.
fn opens_markup(rest: &str) -> bool {
    matches!(
        rest.as_bytes().get(1),
        Some(b) if b.is_ascii_alphabetic() || matches!(b, b'/' | b'!' | b'?')
    )
}

fn push_space(out: &mut String) {
    if !out.is_empty() && !out.ends_with(' ') {
        out.push(' ');
    }
}

fn decode_entity(s: &str) -> Option<(char, usize)> {
    const ENTITIES: [(&str, char); 7] = [
        ("&amp;", '&'),
        ("&lt;", '<'),
        ("&gt;", '>'),
        ("&quot;", '"'),
        ("&#39;", '\''),
        ("&apos;", '\''),
        ("&nbsp;", ' '),
    ];
    ENTITIES
        .iter()
        .find(|(name, _)| s.starts_with(name))
        .map(|(name, c)| (*c, name.len()))
}

/// First `max` characters of `s`.
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_first_url_verbatim() {
        let text = "これ読んで https://example.com/a/b?x=1&y=%20z と http://other.org";
        let urls = extract_urls(text);
        assert_eq!(urls[0], "https://example.com/a/b?x=1&y=%20z");
        assert_eq!(urls[1], "http://other.org");
    }

    #[test]
    fn no_url_yields_empty() {
        assert!(extract_urls("summarise example dot com").is_empty());
        assert!(extract_urls("ftp://example.com").is_empty());
    }

    #[test]
    fn html_to_text_strips_script_and_style() {
        let html = "<html><head><style>.a{color:red}</style></head><body><h1>Title</h1>\
                    <script>alert('x')</script><p>Body   text</p></body></html>";
        let text = html_to_text(html);
        assert_eq!(text, "Title Body text");
    }

    #[test]
    fn html_to_text_decodes_entities() {
        assert_eq!(html_to_text("<p>A &amp; B &lt; C&nbsp;D</p>"), "A & B < C D");
    }

    #[test]
    fn html_to_text_keeps_multibyte_text() {
        assert_eq!(html_to_text("<p>日本語\n\n  テキスト</p>"), "日本語 テキスト");
    }

    #[test]
    fn truncate_counts_characters() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
        assert_eq!(truncate_chars(&"あ".repeat(6000), DEFAULT_MAX_CHARS).chars().count(), 5000);
    }

    #[test]
    fn html_to_text_keeps_bare_angle_brackets() {
        assert_eq!(html_to_text("<p>1 < 2 and 3 > 2</p>"), "1 < 2 and 3 > 2");
        assert_eq!(html_to_text("a <3 b<br/>c"), "a <3 b c");
        assert_eq!(html_to_text("<!-- note -->x <?xml?>y"), "x y");
    }

    #[test]
    fn decodes_charset_from_content_type() {
        let (sjis, _, _) = encoding_rs::SHIFT_JIS.encode("<p>日本語</p>");
        assert_eq!(
            decode_body(&sjis, Some("text/html; charset=Shift_JIS")),
            "<p>日本語</p>"
        );
        let (euc, _, _) = encoding_rs::EUC_JP.encode("ニュース");
        assert_eq!(decode_body(&euc, Some("text/html;charset=\"EUC-JP\"")), "ニュース");
    }

    #[test]
    fn decodes_charset_from_meta_tag() {
        let page = concat!(
            "<html><head><meta http-equiv=\"Content-Type\" ",
            "content=\"text/html; charset=shift_jis\"></head><body>日本語</body></html>"
        );
        let (sjis, _, _) = encoding_rs::SHIFT_JIS.encode(page);
        assert_eq!(decode_body(&sjis, Some("text/html")), page);
        assert_eq!(decode_body("plain ü".as_bytes(), None), "plain ü");
    }

    #[test]
    fn private_addresses_are_recognised() {
        let private = [
            "127.0.0.1",
            "10.1.2.3",
            "192.168.0.10",
            "169.254.169.254",
            "100.64.0.1",
            "::1",
            "fe80::1",
            "fd00::1",
            "::ffff:127.0.0.1",
        ];
        for ip in private {
            assert!(is_private_ip(&ip.parse().unwrap()), "{}", ip);
        }
        for ip in ["93.184.216.34", "1.1.1.1", "2606:4700::1111"] {
            assert!(!is_private_ip(&ip.parse().unwrap()), "{}", ip);
        }
    }

    #[tokio::test]
    async fn private_hosts_are_refused_by_default() {
        let f = HttpFetcher::new(DEFAULT_MAX_CHARS, Duration::from_secs(2));
        let urls = [
            "http://127.0.0.1:8080/admin",
            "http://[::1]/",
            "http://169.254.169.254/latest/meta-data",
        ];
        for url in urls {
            let text = f.fetch(url).await;
            assert!(text.starts_with("Error fetching webpage: "), "{}", text);
            assert!(text.contains("private address"), "{}", text);
        }
    }

    /// Serve one HTTP response with the given content type and body, then close.
    async fn serve_once(content_type: &'static str, body: Vec<u8>) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = sock.read(&mut buf).await;
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                content_type,
                body.len()
            );
            sock.write_all(head.as_bytes()).await.unwrap();
            sock.write_all(&body).await.unwrap();
            let _ = sock.shutdown().await;
        });
        format!("http://{}/", addr)
    }

    #[tokio::test]
    async fn shift_jis_page_is_decoded() {
        let (sjis, _, _) = encoding_rs::SHIFT_JIS.encode("<p>日本語</p>");
        let url = serve_once("text/html; charset=Shift_JIS", sjis.into_owned()).await;
        let f = HttpFetcher::new(DEFAULT_MAX_CHARS, Duration::from_secs(5))
            .allow_private_hosts(true);
        assert_eq!(f.fetch(&url).await, "日本語");
    }

    #[tokio::test]
    async fn unreachable_url_becomes_diagnostic() {
        let f = HttpFetcher::new(DEFAULT_MAX_CHARS, Duration::from_secs(2))
            .allow_private_hosts(true);
        let text = f.fetch("http://127.0.0.1:1/").await;
        assert!(text.starts_with("Error fetching webpage: "), "{}", text);
    }
}
