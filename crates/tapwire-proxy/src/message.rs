//! HTTP message model.
//!
//! Requests and responses keep their head and body separate; header lookup
//! is case-insensitive and insertion order is preserved on write.

/// An ordered, case-insensitive multimap of header fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    /// Creates an empty header map.
    pub fn new() -> Self {
        Self::default()
    }

    /// The value of the first header with the given name, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values for the given name, in insertion order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.0
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Appends a header field.
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// Replaces all fields with the given name by a single one.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.0.push((name, value.into()));
    }

    /// Removes all fields with the given name.
    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    /// Whether the map contains a field with the given name.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Whether any field with the given name lists `token` in its
    /// comma-separated value, compared case-insensitively. Used for
    /// `Connection` and `Transfer-Encoding` checks.
    pub fn contains_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name).any(|value| {
            value
                .split(',')
                .any(|part| part.trim().eq_ignore_ascii_case(token))
        })
    }

    /// Whether the map has no fields.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over all fields in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

/// A decoded HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// Request method, uppercase as received.
    pub method: String,
    /// Request target exactly as received (origin, absolute or authority
    /// form).
    pub uri: String,
    /// Protocol version, `HTTP/1.0` or `HTTP/1.1`.
    pub version: String,
    /// Header fields.
    pub headers: Headers,
    /// Message body, already de-chunked.
    pub body: Vec<u8>,
    /// Whether the request arrived over an intercepted TLS stream.
    pub secure: bool,
}

impl HttpRequest {
    /// Creates a bodyless request.
    pub fn new(method: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            uri: uri.into(),
            version: "HTTP/1.1".to_string(),
            headers: Headers::new(),
            body: Vec::new(),
            secure: false,
        }
    }

    /// Whether this is a `CONNECT` request.
    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// The host and port this request is addressed to, resolved from the
    /// request target first and the `Host` header second. The default port
    /// fills in when neither carries one.
    pub fn target(&self, default_port: u16) -> Option<(String, u16)> {
        if self.is_connect() {
            return split_authority(&self.uri, default_port);
        }
        if let Some(rest) = self
            .uri
            .strip_prefix("http://")
            .map(|rest| (rest, 80))
            .or_else(|| self.uri.strip_prefix("https://").map(|rest| (rest, 443)))
        {
            let (rest, scheme_port) = rest;
            let authority = rest.split(['/', '?']).next().unwrap_or(rest);
            return split_authority(authority, scheme_port);
        }
        self.headers
            .get("Host")
            .and_then(|host| split_authority(host, default_port))
    }

    /// The request target as an absolute URI.
    ///
    /// Requests decoded inside an intercepted tunnel arrive in origin form
    /// (`/path`); host-based patterns (exclusions, scan scopes) expect the
    /// full `scheme://host/path` form, so the scheme and `Host` header are
    /// folded back in. Absolute and authority forms pass through unchanged.
    pub fn normalized_uri(&self) -> String {
        if self.is_connect()
            || self.uri.starts_with("http://")
            || self.uri.starts_with("https://")
        {
            return self.uri.clone();
        }
        match self.headers.get("Host") {
            Some(host) => {
                let scheme = if self.secure { "https" } else { "http" };
                format!("{scheme}://{host}{}", self.uri)
            }
            None => self.uri.clone(),
        }
    }

    /// Whether the connection should close after this exchange, judged from
    /// the request alone.
    pub fn wants_close(&self) -> bool {
        if self.version == "HTTP/1.0" {
            !self.headers.contains_token("Connection", "keep-alive")
        } else {
            self.headers.contains_token("Connection", "close")
        }
    }
}

/// A decoded or synthesized HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Protocol version.
    pub version: String,
    /// Status code; `0` marks the placeholder of a not-yet-filled response.
    pub status: u16,
    /// Reason phrase, possibly empty.
    pub reason: String,
    /// Header fields.
    pub headers: Headers,
    /// Message body.
    pub body: Vec<u8>,
}

impl Default for HttpResponse {
    fn default() -> Self {
        Self {
            version: "HTTP/1.0".to_string(),
            status: 0,
            reason: String::new(),
            headers: Headers::new(),
            body: Vec::new(),
        }
    }
}

impl HttpResponse {
    /// Creates a bodyless response with the given status.
    pub fn with_status(status: u16, reason: impl Into<String>) -> Self {
        Self {
            version: "HTTP/1.1".to_string(),
            status,
            reason: reason.into(),
            ..Self::default()
        }
    }

    /// Whether the response is still the untouched placeholder.
    pub fn is_empty(&self) -> bool {
        self.status == 0 && self.headers.is_empty() && self.body.is_empty()
    }

    /// The declared `Content-Length`, if present and well formed.
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get("Content-Length")
            .and_then(|v| v.trim().parse().ok())
    }

    /// Whether the connection should close after this exchange, judged from
    /// the response alone.
    pub fn wants_close(&self) -> bool {
        if self.version == "HTTP/1.0" {
            !self.headers.contains_token("Connection", "keep-alive")
        } else {
            self.headers.contains_token("Connection", "close")
        }
    }
}

/// A request paired with its (possibly still empty) response.
#[derive(Debug, Clone)]
pub struct HttpMessage {
    /// The client request.
    pub request: HttpRequest,
    /// The response to send back; starts out as the empty placeholder.
    pub response: HttpResponse,
    /// Set by whoever fetched the response when the upstream connection was
    /// closed, so the close decision can account for bodies with no
    /// declared length.
    pub connection_closed: bool,
}

impl HttpMessage {
    /// Wraps a freshly decoded request with an empty response.
    pub fn new(request: HttpRequest) -> Self {
        Self {
            request,
            response: HttpResponse::default(),
            connection_closed: false,
        }
    }
}

/// Splits `host[:port]` into its parts, handling bracketed IPv6 literals.
fn split_authority(authority: &str, default_port: u16) -> Option<(String, u16)> {
    let authority = authority.trim();
    if authority.is_empty() {
        return None;
    }
    if let Some(rest) = authority.strip_prefix('[') {
        let end = rest.find(']')?;
        let host = rest[..end].to_string();
        let port = match rest[end + 1..].strip_prefix(':') {
            Some(port) => port.parse().ok()?,
            None => default_port,
        };
        return Some((host, port));
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => Some((host.to_string(), port.parse().ok()?)),
        _ => Some((authority.to_string(), default_port)),
    }
}
