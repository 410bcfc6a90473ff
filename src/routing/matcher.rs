//! Route matching logic.
//!
//! # Responsibilities
//! - Match host header (exact match, case-insensitive, port ignored)
//! - Match method against an allow list
//! - Match path templates and extract their variables
//! - Combine conditions with AND semantics
//!
//! # Design Decisions
//! - Path matching is segment-by-segment and case-sensitive
//! - Empty condition = always matches (wildcard)
//! - No regex: a template is a list of literal, variable and catch-all
//!   segments

use std::collections::{HashMap, HashSet};
use std::fmt;

use axum::http::Method;

use crate::http::state::RequestInfo;

/// Trait for matching requests against conditions.
pub trait Matcher: Send + Sync + fmt::Debug {
    /// Returns true if the request matches this condition.
    fn matches(&self, req: &RequestInfo) -> bool;
}

/// Matches the Host header.
#[derive(Debug, Clone)]
pub struct HostMatcher {
    expected_host: String,
}

impl HostMatcher {
    /// The host is normalized to lowercase for case-insensitive matching.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            expected_host: host.into().to_lowercase(),
        }
    }
}

impl Matcher for HostMatcher {
    fn matches(&self, req: &RequestInfo) -> bool {
        req.host()
            .map(|h| h.rsplit_once(':').map_or(h, |(name, _port)| name))
            .map(|h| h.eq_ignore_ascii_case(&self.expected_host))
            .unwrap_or(false)
    }
}

/// Matches one of a set of methods.
#[derive(Debug, Clone)]
pub struct MethodMatcher {
    methods: Vec<Method>,
}

impl MethodMatcher {
    pub fn new(methods: Vec<Method>) -> Self {
        Self { methods }
    }
}

impl Matcher for MethodMatcher {
    fn matches(&self, req: &RequestInfo) -> bool {
        match &req.method {
            Some(method) => self.methods.is_empty() || self.methods.contains(method),
            None => false,
        }
    }
}

/// Matches the request path against a template.
#[derive(Debug, Clone)]
pub struct PathTemplateMatcher {
    template: PathTemplate,
}

impl PathTemplateMatcher {
    pub fn new(template: PathTemplate) -> Self {
        Self { template }
    }
}

impl Matcher for PathTemplateMatcher {
    fn matches(&self, req: &RequestInfo) -> bool {
        self.template.capture(req.path()).is_some()
    }
}

/// Combines multiple matchers with AND semantics.
#[derive(Debug)]
pub struct AndMatcher {
    matchers: Vec<Box<dyn Matcher>>,
}

impl AndMatcher {
    pub fn new(matchers: Vec<Box<dyn Matcher>>) -> Self {
        Self { matchers }
    }
}

impl Matcher for AndMatcher {
    fn matches(&self, req: &RequestInfo) -> bool {
        self.matchers.iter().all(|m| m.matches(req))
    }
}

/// Problem in a path template.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("path template must start with '/': {0}")]
    NotAbsolute(String),
    #[error("invalid segment {segment:?} in {template}")]
    InvalidSegment { template: String, segment: String },
    #[error("variable {{{name}}} appears twice in {template}")]
    DuplicateVariable { template: String, name: String },
    #[error("catch-all segment must be last in {0}")]
    CatchAllNotLast(String),
    #[error("no value for variable {{{0}}}")]
    MissingValue(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Variable(String),
    CatchAll(String),
}

/// A path like `/proxy/{id}` or `/files/{*rest}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTemplate {
    source: String,
    segments: Vec<Segment>,
}

fn valid_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl PathTemplate {
    pub fn parse(template: &str) -> Result<Self, TemplateError> {
        let rest = template
            .strip_prefix('/')
            .ok_or_else(|| TemplateError::NotAbsolute(template.to_string()))?;

        let raw: Vec<&str> = if rest.is_empty() { Vec::new() } else { rest.split('/').collect() };
        let mut segments = Vec::with_capacity(raw.len());
        let mut seen = HashSet::new();

        for (i, part) in raw.iter().enumerate() {
            let invalid = || TemplateError::InvalidSegment {
                template: template.to_string(),
                segment: part.to_string(),
            };
            let segment = match part.strip_prefix('{').and_then(|p| p.strip_suffix('}')) {
                Some(inner) => {
                    let (catch_all, name) = match inner.strip_prefix('*') {
                        Some(name) => (true, name),
                        None => (false, inner),
                    };
                    if !valid_name(name) {
                        return Err(invalid());
                    }
                    if !seen.insert(name.to_string()) {
                        return Err(TemplateError::DuplicateVariable {
                            template: template.to_string(),
                            name: name.to_string(),
                        });
                    }
                    if catch_all {
                        if i + 1 != raw.len() {
                            return Err(TemplateError::CatchAllNotLast(template.to_string()));
                        }
                        Segment::CatchAll(name.to_string())
                    } else {
                        Segment::Variable(name.to_string())
                    }
                }
                None if part.contains('{') || part.contains('}') => return Err(invalid()),
                None => Segment::Literal(part.to_string()),
            };
            segments.push(segment);
        }

        Ok(Self {
            source: template.to_string(),
            segments,
        })
    }

    /// Names of the variables this template binds, in order.
    pub fn variables(&self) -> impl Iterator<Item = &str> + '_ {
        self.segments.iter().filter_map(|s| match s {
            Segment::Variable(name) | Segment::CatchAll(name) => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    /// Variable values if `path` matches.
    pub fn capture(&self, path: &str) -> Option<HashMap<String, String>> {
        let rest = path.strip_prefix('/')?;
        let parts: Vec<&str> = if rest.is_empty() { Vec::new() } else { rest.split('/').collect() };
        let mut params = HashMap::new();

        for (i, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::CatchAll(name) => {
                    let remainder = parts.get(i..).map(|p| p.join("/")).unwrap_or_default();
                    params.insert(name.clone(), remainder);
                    return Some(params);
                }
                Segment::Literal(literal) => {
                    if parts.get(i) != Some(&literal.as_str()) {
                        return None;
                    }
                }
                Segment::Variable(name) => match parts.get(i) {
                    Some(value) if !value.is_empty() => {
                        params.insert(name.clone(), value.to_string());
                    }
                    _ => return None,
                },
            }
        }

        (parts.len() == self.segments.len()).then_some(params)
    }

    /// Substitute `params` into the template.
    pub fn render(&self, params: &HashMap<String, String>) -> Result<String, TemplateError> {
        if self.segments.is_empty() {
            return Ok("/".to_string());
        }
        let mut out = String::with_capacity(self.source.len());
        for segment in &self.segments {
            out.push('/');
            match segment {
                Segment::Literal(literal) => out.push_str(literal),
                Segment::Variable(name) | Segment::CatchAll(name) => {
                    let value = params
                        .get(name)
                        .ok_or_else(|| TemplateError::MissingValue(name.clone()))?;
                    out.push_str(value);
                }
            }
        }
        Ok(out)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl fmt::Display for PathTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, HeaderValue, Version};

    fn request(method: Option<Method>, host: &str, path: &str) -> RequestInfo {
        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_str(host).unwrap());
        RequestInfo {
            method,
            uri: path.parse().unwrap(),
            version: Version::HTTP_11,
            headers,
            path_params: HashMap::new(),
        }
    }

    #[test]
    fn test_host_matcher() {
        let matcher = HostMatcher::new("example.com");
        assert!(matcher.matches(&request(Some(Method::GET), "example.com", "/")));
        assert!(matcher.matches(&request(Some(Method::GET), "EXAMPLE.COM:8080", "/")));
        assert!(!matcher.matches(&request(Some(Method::GET), "other.com", "/")));
    }

    #[test]
    fn method_matcher_requires_a_method() {
        let any = MethodMatcher::new(Vec::new());
        assert!(any.matches(&request(Some(Method::DELETE), "h", "/")));
        assert!(!any.matches(&request(None, "h", "/")));

        let post_only = MethodMatcher::new(vec![Method::POST]);
        assert!(!post_only.matches(&request(Some(Method::GET), "h", "/")));
    }

    #[test]
    fn template_captures_and_renders() {
        let inbound = PathTemplate::parse("/proxy/{id}").unwrap();
        let params = inbound.capture("/proxy/42").unwrap();
        assert_eq!(params.get("id").map(String::as_str), Some("42"));
        assert!(inbound.capture("/proxy").is_none());
        assert!(inbound.capture("/proxy/42/extra").is_none());
        assert!(inbound.capture("/other/42").is_none());

        let downstream = PathTemplate::parse("/backend/{id}").unwrap();
        assert_eq!(downstream.render(&params).unwrap(), "/backend/42");
    }

    #[test]
    fn catch_all_takes_the_remainder() {
        let t = PathTemplate::parse("/files/{*rest}").unwrap();
        let params = t.capture("/files/a/b/c.txt").unwrap();
        assert_eq!(params["rest"], "a/b/c.txt");
        assert_eq!(t.capture("/files").unwrap()["rest"], "");
    }

    #[test]
    fn invalid_templates_are_rejected() {
        assert!(matches!(PathTemplate::parse("proxy/{id}"), Err(TemplateError::NotAbsolute(_))));
        assert!(matches!(PathTemplate::parse("/a/{}"), Err(TemplateError::InvalidSegment { .. })));
        assert!(matches!(PathTemplate::parse("/a/x{id}"), Err(TemplateError::InvalidSegment { .. })));
        assert!(matches!(PathTemplate::parse("/{id}/{id}"), Err(TemplateError::DuplicateVariable { .. })));
        assert!(matches!(PathTemplate::parse("/{*rest}/x"), Err(TemplateError::CatchAllNotLast(_))));
    }

    #[test]
    fn root_template() {
        let root = PathTemplate::parse("/").unwrap();
        assert!(root.capture("/").is_some());
        assert!(root.capture("/x").is_none());
        assert_eq!(root.render(&HashMap::new()).unwrap(), "/");
    }
}
