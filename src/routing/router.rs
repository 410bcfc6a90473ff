//! Route lookup.
//!
//! # Responsibilities
//! - Compile route configs into matchers and path templates
//! - Look up the first route matching a request
//! - Parse downstream base URLs into destinations
//!
//! # Design Decisions
//! - Immutable after construction; reload builds a new table
//! - O(n) scan in configuration order, first match wins
//! - Explicit no-match rather than silent default

use std::collections::HashMap;

use axum::http::Method;
use url::Url;

use crate::config::RouteConfig;
use crate::http::state::RequestInfo;
use crate::pool::Destination;
use crate::routing::matcher::{
    AndMatcher, HostMatcher, Matcher, MethodMatcher, PathTemplate, PathTemplateMatcher, TemplateError,
};

/// A downstream base URL that cannot be used.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DownstreamUrlError {
    #[error("invalid downstream URL {url}: {reason}")]
    Invalid { url: String, reason: String },
    #[error("unsupported scheme {scheme} in {url}, expected http or https")]
    UnsupportedScheme { url: String, scheme: String },
    #[error("downstream URL {0} has no host")]
    MissingHost(String),
    #[error("downstream URL {0} must not carry a path or query; use downstream_path")]
    HasPath(String),
}

/// Parse `http://host[:port]` or `https://host[:port]`.
pub fn parse_downstream(raw: &str) -> Result<Destination, DownstreamUrlError> {
    let url = Url::parse(raw).map_err(|e| DownstreamUrlError::Invalid {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;

    let use_https = match url.scheme() {
        "http" => false,
        "https" => true,
        other => {
            return Err(DownstreamUrlError::UnsupportedScheme {
                url: raw.to_string(),
                scheme: other.to_string(),
            })
        }
    };
    let host = url
        .host_str()
        .ok_or_else(|| DownstreamUrlError::MissingHost(raw.to_string()))?;
    if url.path() != "/" || url.query().is_some() {
        return Err(DownstreamUrlError::HasPath(raw.to_string()));
    }
    let port = url
        .port_or_known_default()
        .ok_or_else(|| DownstreamUrlError::MissingHost(raw.to_string()))?;

    // IPv6 hosts come back bracketed.
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Ok(Destination::new(host, port, use_https))
}

/// Failure compiling a route.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("route {route}: {source}")]
    Template {
        route: String,
        #[source]
        source: TemplateError,
    },
    #[error("route {route}: {source}")]
    Downstream {
        route: String,
        #[source]
        source: DownstreamUrlError,
    },
    #[error("route {route}: invalid method {method}")]
    Method { route: String, method: String },
}

/// A route ready for matching.
#[derive(Debug)]
pub struct CompiledRoute {
    pub name: String,
    pub destination: Destination,
    pub downstream_path: PathTemplate,
    pub disable_breaker: bool,
    template: PathTemplate,
    conditions: AndMatcher,
}

impl CompiledRoute {
    pub fn compile(config: &RouteConfig) -> Result<Self, RouteError> {
        let template_err = |source| RouteError::Template {
            route: config.name.clone(),
            source,
        };
        let template = PathTemplate::parse(&config.path).map_err(template_err)?;
        let downstream_path = PathTemplate::parse(&config.downstream_path).map_err(template_err)?;
        let destination = parse_downstream(&config.downstream).map_err(|source| RouteError::Downstream {
            route: config.name.clone(),
            source,
        })?;

        let methods = config
            .methods
            .iter()
            .map(|m| {
                Method::from_bytes(m.to_ascii_uppercase().as_bytes()).map_err(|_| RouteError::Method {
                    route: config.name.clone(),
                    method: m.clone(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut matchers: Vec<Box<dyn Matcher>> = Vec::new();
        if let Some(host) = &config.host {
            matchers.push(Box::new(HostMatcher::new(host.clone())));
        }
        matchers.push(Box::new(MethodMatcher::new(methods)));
        matchers.push(Box::new(PathTemplateMatcher::new(template.clone())));

        Ok(Self {
            name: config.name.clone(),
            destination,
            downstream_path,
            disable_breaker: config.disable_breaker,
            template,
            conditions: AndMatcher::new(matchers),
        })
    }
}

/// A matched route plus the inbound path variables.
#[derive(Debug)]
pub struct RouteMatch<'a> {
    pub route: &'a CompiledRoute,
    pub params: HashMap<String, String>,
}

/// Ordered route list.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: Vec<CompiledRoute>,
}

impl RouteTable {
    pub fn from_config(routes: &[RouteConfig]) -> Result<Self, RouteError> {
        let routes = routes.iter().map(CompiledRoute::compile).collect::<Result<Vec<_>, _>>()?;
        Ok(Self { routes })
    }

    /// First route whose conditions all hold.
    pub fn find(&self, req: &RequestInfo) -> Option<RouteMatch<'_>> {
        self.routes
            .iter()
            .filter(|route| route.conditions.matches(req))
            .find_map(|route| {
                route
                    .template
                    .capture(req.path())
                    .map(|params| RouteMatch { route, params })
            })
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
