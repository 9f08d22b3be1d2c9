//! One-shot HTTP requests against a documented API version
//!
//! The tester builds a URL from a version's base URL and an endpoint path
//! template, sends a single request and reports what came back. Transport
//! failures are part of the result, not errors of the tester.
//!
//! Unless private targets are allowed, requests may only reach public
//! addresses: literal IPs and `localhost` are checked before sending, resolved
//! names are filtered in the DNS step, and redirects are never followed.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use apihub_shared::HttpMethod;
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::redirect::Policy;
use serde::Serialize;
use url::{Host, Url};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TesterError {
    #[error("Invalid base URL: {0}")]
    InvalidBaseUrl(String),
    #[error("Missing value for path parameter '{0}'")]
    MissingPathParam(String),
    #[error("Unterminated placeholder in path: {0}")]
    MalformedPath(String),
    #[error("Path must start with '/'")]
    RelativePath,
    #[error("Invalid header: {0}")]
    InvalidHeader(String),
    #[error("{0} requests cannot carry a body")]
    BodyNotAllowed(HttpMethod),
    #[error("Path parameter '{0}' cannot be '.' or '..'")]
    DotSegment(String),
    #[error("Target host is not publicly routable: {0}")]
    BlockedTarget(String),
}

/// What the target API answered
#[derive(Debug, Clone, Default, Serialize)]
pub struct TestResult {
    /// `None` when no response was received
    pub status: Option<u16>,
    pub headers: BTreeMap<String, String>,
    /// Body decoded as UTF-8 (lossy) and cut at the configured maximum
    pub body: Option<String>,
    pub truncated: bool,
    pub elapsed_ms: u64,
    /// Full payload size, including any part beyond the truncation limit
    pub size_bytes: u64,
    pub error: Option<String>,
}

#[derive(Clone)]
pub struct ApiTester {
    client: reqwest::Client,
    timeout: Duration,
    max_response_bytes: usize,
    allow_private_targets: bool,
}

impl ApiTester {
    pub fn new(
        timeout: Duration,
        max_response_bytes: usize,
        allow_private_targets: bool,
    ) -> Result<Self, reqwest::Error> {
        let mut builder = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("apihub-tester/", env!("CARGO_PKG_VERSION")))
            .redirect(Policy::none())
            .no_proxy();
        if !allow_private_targets {
            builder = builder.dns_resolver(Arc::new(PublicOnlyResolver));
        }

        Ok(Self {
            client: builder.build()?,
            timeout,
            max_response_bytes,
            allow_private_targets,
        })
    }

    /// Send one request; never retries
    pub async fn execute(
        &self,
        method: HttpMethod,
        url: Url,
        headers: &BTreeMap<String, String>,
        body: Option<&serde_json::Value>,
    ) -> Result<TestResult, TesterError> {
        if body.is_some() && !method.allows_body() {
            return Err(TesterError::BodyNotAllowed(method));
        }
        let header_map = build_headers(headers)?;
        if !self.allow_private_targets {
            ensure_public_target(&url)?;
        }

        let mut request = self
            .client
            .request(reqwest_method(method), url.clone())
            .headers(header_map);
        request = match body {
            Some(serde_json::Value::String(raw)) => request.body(raw.clone()),
            Some(value) => request.json(value),
            None => request,
        };

        let started = Instant::now();
        let mut result = TestResult::default();

        let mut response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                result.elapsed_ms = elapsed_ms(started);
                result.error = Some(self.describe(&e));
                tracing::debug!(url = %url, error = %e, "Tester request failed");
                return Ok(result);
            }
        };

        result.status = Some(response.status().as_u16());
        result.headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();

        let mut kept: Vec<u8> = Vec::new();
        let mut size: u64 = 0;
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    size += chunk.len() as u64;
                    let room = self.max_response_bytes.saturating_sub(kept.len());
                    if chunk.len() > room {
                        result.truncated = true;
                    }
                    kept.extend_from_slice(&chunk[..chunk.len().min(room)]);
                }
                Ok(None) => break,
                Err(e) => {
                    result.error = Some(self.describe(&e));
                    break;
                }
            }
        }

        result.elapsed_ms = elapsed_ms(started);
        result.size_bytes = size;
        result.body = Some(String::from_utf8_lossy(&kept).into_owned());

        tracing::debug!(
            url = %url,
            status = ?result.status,
            elapsed_ms = result.elapsed_ms,
            size_bytes = result.size_bytes,
            "Tester request complete"
        );

        Ok(result)
    }

    fn describe(&self, e: &reqwest::Error) -> String {
        if e.is_timeout() {
            format!("Request timed out after {}s", self.timeout.as_secs())
        } else if e.is_connect() {
            format!("Connection failed: {e}")
        } else {
            e.to_string()
        }
    }
}

/// Resolver that drops every non-public address a name resolves to
struct PublicOnlyResolver;

impl Resolve for PublicOnlyResolver {
    fn resolve(&self, name: Name) -> Resolving {
        Box::pin(resolve_public(name))
    }
}

async fn resolve_public(name: Name) -> Result<Addrs, Box<dyn std::error::Error + Send + Sync>> {
    let host = name.as_str().to_string();
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), 0))
        .await?
        .filter(|addr| is_public_ip(addr.ip()))
        .collect();
    if addrs.is_empty() {
        return Err(TesterError::BlockedTarget(host).into());
    }
    Ok(Box::new(addrs.into_iter()))
}

/// Refuse URLs whose host is a non-public literal address or a loopback name.
/// Names that resolve to private addresses are caught at resolution time.
pub fn ensure_public_target(url: &Url) -> Result<(), TesterError> {
    let blocked = match url.host() {
        Some(Host::Ipv4(ip)) => !is_public_ip(IpAddr::V4(ip)),
        Some(Host::Ipv6(ip)) => !is_public_ip(IpAddr::V6(ip)),
        Some(Host::Domain(domain)) => {
            let domain = domain.trim_end_matches('.').to_ascii_lowercase();
            domain == "localhost" || domain.ends_with(".localhost")
        }
        None => true,
    };
    if blocked {
        return Err(TesterError::BlockedTarget(
            url.host_str().unwrap_or_default().to_string(),
        ));
    }
    Ok(())
}

pub fn is_public_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_public_ipv4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_public_ipv4(v4),
            None => is_public_ipv6(v6),
        },
    }
}

fn is_public_ipv4(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    !(ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_documentation()
        || a == 0
        // 100.64.0.0/10 carrier-grade NAT
        || (a == 100 && (b & 0xc0) == 64))
}

fn is_public_ipv6(ip: Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    !(ip.is_loopback()
        || ip.is_unspecified()
        // fc00::/7 unique local
        || (first & 0xfe00) == 0xfc00
        // fe80::/10 link local
        || (first & 0xffc0) == 0xfe80)
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn reqwest_method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Patch => reqwest::Method::PATCH,
        HttpMethod::Delete => reqwest::Method::DELETE,
        HttpMethod::Head => reqwest::Method::HEAD,
        HttpMethod::Options => reqwest::Method::OPTIONS,
    }
}

fn build_headers(headers: &BTreeMap<String, String>) -> Result<HeaderMap, TesterError> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let header_name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|_| TesterError::InvalidHeader(name.clone()))?;
        let header_value =
            HeaderValue::from_str(value).map_err(|_| TesterError::InvalidHeader(name.clone()))?;
        map.insert(header_name, header_value);
    }
    Ok(map)
}

/// Replace `{name}` placeholders in one path segment
fn fill_segment(
    segment: &str,
    template: &str,
    params: &BTreeMap<String, String>,
) -> Result<String, TesterError> {
    let mut out = String::with_capacity(segment.len());
    let mut rest = segment;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let close = after
            .find('}')
            .ok_or_else(|| TesterError::MalformedPath(template.to_string()))?;
        let name = &after[..close];
        let value = params
            .get(name)
            .ok_or_else(|| TesterError::MissingPathParam(name.to_string()))?;
        out.push_str(value);
        rest = &after[close + 1..];
    }
    out.push_str(rest);

    Ok(out)
}

/// Join a base URL and a path template, substituting and percent-encoding
/// path parameters and appending query pairs
pub fn build_url(
    base_url: &str,
    path_template: &str,
    path_params: &BTreeMap<String, String>,
    query: &BTreeMap<String, String>,
) -> Result<Url, TesterError> {
    if !path_template.starts_with('/') {
        return Err(TesterError::RelativePath);
    }

    let mut url =
        Url::parse(base_url).map_err(|_| TesterError::InvalidBaseUrl(base_url.to_string()))?;
    url.set_query(None);
    url.set_fragment(None);

    let segments = path_template
        .trim_start_matches('/')
        .split('/')
        .map(|segment| fill_segment(segment, path_template, path_params))
        .collect::<Result<Vec<_>, _>>()?;
    // The URL parser would resolve these against the base path
    if let Some(dot) = segments.iter().find(|s| *s == "." || *s == "..") {
        return Err(TesterError::DotSegment(dot.clone()));
    }

    {
        let mut path = url
            .path_segments_mut()
            .map_err(|_| TesterError::InvalidBaseUrl(base_url.to_string()))?;
        path.pop_if_empty();
        for segment in &segments {
            path.push(segment);
        }
    }

    if !query.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in query {
            pairs.append_pair(key, value);
        }
    }

    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    /// Tester that may reach the local mock server
    fn tester(max_response_bytes: usize) -> ApiTester {
        ApiTester::new(Duration::from_secs(5), max_response_bytes, true).unwrap()
    }

    fn public_only_tester() -> ApiTester {
        ApiTester::new(Duration::from_secs(5), 1024, false).unwrap()
    }

    #[test]
    fn test_build_url_keeps_base_path() {
        let url = build_url(
            "https://api.example.com/v1/",
            "/users/{id}",
            &params(&[("id", "42")]),
            &BTreeMap::new(),
        )
        .unwrap();

        assert_eq!(url.as_str(), "https://api.example.com/v1/users/42");
    }

    #[test]
    fn test_build_url_percent_encodes_params() {
        let url = build_url(
            "https://api.example.com",
            "/files/{name}",
            &params(&[("name", "a b/c?d")]),
            &BTreeMap::new(),
        )
        .unwrap();

        assert_eq!(url.as_str(), "https://api.example.com/files/a%20b%2Fc%3Fd");
    }

    #[test]
    fn test_build_url_multiple_placeholders_in_segment() {
        let url = build_url(
            "http://localhost:8080",
            "/reports/{year}-{month}.json",
            &params(&[("year", "2026"), ("month", "10")]),
            &BTreeMap::new(),
        )
        .unwrap();

        assert_eq!(url.path(), "/reports/2026-10.json");
    }

    #[test]
    fn test_build_url_appends_query() {
        let url = build_url(
            "https://api.example.com/v1?stale=1",
            "/search",
            &BTreeMap::new(),
            &params(&[("q", "rust lang"), ("page", "2")]),
        )
        .unwrap();

        assert_eq!(url.as_str(), "https://api.example.com/v1/search?page=2&q=rust+lang");
    }

    #[test]
    fn test_build_url_missing_param() {
        let err = build_url(
            "https://api.example.com",
            "/users/{id}/posts/{post_id}",
            &params(&[("id", "1")]),
            &BTreeMap::new(),
        )
        .unwrap_err();

        assert_eq!(err, TesterError::MissingPathParam("post_id".to_string()));
    }

    #[test]
    fn test_build_url_rejects_bad_inputs() {
        let empty = BTreeMap::new();
        assert_eq!(
            build_url("https://api.example.com", "users", &empty, &empty).unwrap_err(),
            TesterError::RelativePath
        );
        assert!(matches!(
            build_url("not a url", "/users", &empty, &empty),
            Err(TesterError::InvalidBaseUrl(_))
        ));
        assert!(matches!(
            build_url("https://api.example.com", "/users/{id", &empty, &empty),
            Err(TesterError::MalformedPath(_))
        ));
    }

    #[tokio::test]
    async fn test_execute_reports_status_body_and_size() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/users/42")
            .match_query(Matcher::UrlEncoded("verbose".into(), "true".into()))
            .match_header("x-api-key", "secret")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"id":42}"#)
            .create_async()
            .await;

        let url = build_url(
            &server.url(),
            "/users/{id}",
            &params(&[("id", "42")]),
            &params(&[("verbose", "true")]),
        )
        .unwrap();

        let result = tester(1024)
            .execute(HttpMethod::Get, url, &params(&[("x-api-key", "secret")]), None)
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(result.status, Some(200));
        assert_eq!(result.body.as_deref(), Some(r#"{"id":42}"#));
        assert_eq!(result.size_bytes, 9);
        assert!(!result.truncated);
        assert_eq!(
            result.headers.get("content-type").map(String::as_str),
            Some("application/json")
        );
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_execute_sends_json_body() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/orders")
            .match_body(Matcher::Json(json!({ "item": "widget", "qty": 2 })))
            .with_status(201)
            .with_body("created")
            .create_async()
            .await;

        let url = build_url(&server.url(), "/orders", &BTreeMap::new(), &BTreeMap::new()).unwrap();
        let body = json!({ "item": "widget", "qty": 2 });

        let result = tester(1024)
            .execute(HttpMethod::Post, url, &BTreeMap::new(), Some(&body))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(result.status, Some(201));
    }

    #[tokio::test]
    async fn test_execute_truncates_large_body() {
        let mut server = mockito::Server::new_async().await;
        let payload = "x".repeat(100);
        server
            .mock("GET", "/big")
            .with_status(200)
            .with_body(&payload)
            .create_async()
            .await;

        let url = build_url(&server.url(), "/big", &BTreeMap::new(), &BTreeMap::new()).unwrap();

        let result = tester(10)
            .execute(HttpMethod::Get, url, &BTreeMap::new(), None)
            .await
            .unwrap();

        assert!(result.truncated);
        assert_eq!(result.body.as_deref(), Some("xxxxxxxxxx"));
        assert_eq!(result.size_bytes, 100);
    }

    #[tokio::test]
    async fn test_execute_error_status_is_a_result() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("DELETE", "/items/1")
            .with_status(404)
            .with_body("missing")
            .create_async()
            .await;

        let url = build_url(
            &server.url(),
            "/items/{id}",
            &params(&[("id", "1")]),
            &BTreeMap::new(),
        )
        .unwrap();

        let result = tester(1024)
            .execute(HttpMethod::Delete, url, &BTreeMap::new(), None)
            .await
            .unwrap();

        assert_eq!(result.status, Some(404));
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_execute_transport_error_in_result() {
        let url = Url::parse("http://127.0.0.1:1/unreachable").unwrap();

        let result = tester(1024)
            .execute(HttpMethod::Get, url, &BTreeMap::new(), None)
            .await
            .unwrap();

        assert_eq!(result.status, None);
        assert!(result.error.is_some());
        assert!(result.body.is_none());
    }

    #[tokio::test]
    async fn test_execute_rejects_body_on_get() {
        let url = Url::parse("http://127.0.0.1:1/").unwrap();
        let body = json!({});

        let err = tester(1024)
            .execute(HttpMethod::Get, url, &BTreeMap::new(), Some(&body))
            .await
            .unwrap_err();

        assert_eq!(err, TesterError::BodyNotAllowed(HttpMethod::Get));
    }

    #[tokio::test]
    async fn test_execute_rejects_invalid_header() {
        let url = Url::parse("http://127.0.0.1:1/").unwrap();

        let err = tester(1024)
            .execute(HttpMethod::Get, url, &params(&[("bad header", "v")]), None)
            .await
            .unwrap_err();

        assert_eq!(err, TesterError::InvalidHeader("bad header".to_string()));
    }

    #[test]
    fn test_build_url_rejects_dot_segments() {
        let empty = BTreeMap::new();
        for value in ["..", "."] {
            let err = build_url(
                "https://api.example.com/v1",
                "/users/{id}/orders",
                &params(&[("id", value)]),
                &empty,
            )
            .unwrap_err();
            assert_eq!(err, TesterError::DotSegment(value.to_string()));
        }

        let url = build_url(
            "https://api.example.com/v1",
            "/users/{id}",
            &params(&[("id", "...")]),
            &empty,
        )
        .unwrap();
        assert_eq!(url.path(), "/v1/users/...");
    }

    #[test]
    fn test_public_ip_classification() {
        let cases = [
            ("93.184.216.34", true),
            ("8.8.8.8", true),
            ("2606:4700::1111", true),
            ("127.0.0.1", false),
            ("10.1.2.3", false),
            ("172.16.0.1", false),
            ("192.168.1.1", false),
            ("169.254.169.254", false),
            ("100.64.0.1", false),
            ("0.0.0.0", false),
            ("255.255.255.255", false),
            ("::1", false),
            ("::", false),
            ("fd00::1", false),
            ("fe80::1", false),
            ("::ffff:127.0.0.1", false),
            ("::ffff:8.8.8.8", true),
        ];
        for (raw, public) in cases {
            let ip: IpAddr = raw.parse().unwrap();
            assert_eq!(is_public_ip(ip), public, "{raw}");
        }
    }

    #[tokio::test]
    async fn test_execute_refuses_internal_literal_addresses() {
        let tester = public_only_tester();
        for raw in [
            "http://169.254.169.254/latest/meta-data/",
            "http://127.0.0.1:5432/",
            "http://[::1]:8080/",
            "http://localhost:8080/admin",
        ] {
            let url = Url::parse(raw).unwrap();
            let err = tester
                .execute(HttpMethod::Get, url, &BTreeMap::new(), None)
                .await
                .unwrap_err();
            assert!(matches!(err, TesterError::BlockedTarget(_)), "{raw}");
        }
    }

    #[test]
    fn test_public_target_accepted() {
        let url = Url::parse("https://api.example.com/v1").unwrap();
        assert_eq!(ensure_public_target(&url), Ok(()));
    }

    #[tokio::test]
    async fn test_execute_does_not_follow_redirects() {
        let mut server = mockito::Server::new_async().await;
        let internal = server
            .mock("GET", "/internal")
            .with_status(200)
            .with_body("secret")
            .expect(0)
            .create_async()
            .await;
        server
            .mock("GET", "/start")
            .with_status(302)
            .with_header("location", &format!("{}/internal", server.url()))
            .create_async()
            .await;

        let url = build_url(&server.url(), "/start", &BTreeMap::new(), &BTreeMap::new()).unwrap();
        let result = tester(1024)
            .execute(HttpMethod::Get, url, &BTreeMap::new(), None)
            .await
            .unwrap();

        internal.assert_async().await;
        assert_eq!(result.status, Some(302));
        assert!(result.headers.contains_key("location"));
    }
}
