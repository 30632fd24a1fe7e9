//! Request serialisation.

use std::fmt;

use crate::transport::{write_all, Client, TransportError};

const USER_AGENT: &str = concat!("embercloud/", env!("CARGO_PKG_VERSION"));

/// HTTP request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
}

impl Method {
    /// The method token as sent on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
            Self::Head => "HEAD",
        }
    }

    /// Whether responses to this method never carry a body.
    pub fn has_empty_response(&self) -> bool {
        matches!(self, Self::Head)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An outgoing request.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub keep_alive: bool,
}

impl Request {
    /// Create a request for `host` on port 443.
    pub fn new(method: Method, host: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method,
            host: host.into(),
            port: 443,
            path: path.into(),
            headers: Vec::new(),
            body: Vec::new(),
            keep_alive: true,
        }
    }

    /// Shorthand for a GET request.
    pub fn get(host: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(Method::Get, host, path)
    }

    /// Shorthand for a POST request.
    pub fn post(host: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(Method::Post, host, path)
    }

    /// Shorthand for a PUT request.
    pub fn put(host: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(Method::Put, host, path)
    }

    /// Set the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Add a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set a raw body.
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Set a JSON body.
    pub fn with_json(mut self, value: &serde_json::Value) -> Self {
        self.body = value.to_string().into_bytes();
        self.with_header("Content-Type", "application/json")
    }

    /// Ask for a `Connection: close` exchange.
    pub fn close_after(mut self) -> Self {
        self.keep_alive = false;
        self
    }

    /// Ask for a server-sent event stream.
    pub fn event_stream(self) -> Self {
        self.with_header("Accept", "text/event-stream")
    }

    /// Look up a header value, ignoring case.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Request line and header block, including the blank line.
    pub fn head_bytes(&self) -> Vec<u8> {
        let mut head = format!(
            "{} {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: {}\r\nConnection: {}\r\n",
            self.method,
            if self.path.is_empty() { "/" } else { &self.path },
            self.host,
            USER_AGENT,
            if self.keep_alive { "keep-alive" } else { "close" },
        );
        for (name, value) in &self.headers {
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
        if !self.body.is_empty() || matches!(self.method, Method::Post | Method::Put | Method::Patch)
        {
            head.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        }
        head.push_str("\r\n");
        head.into_bytes()
    }

    /// Write the request onto an open connection.
    pub fn write_to(&self, client: &mut dyn Client) -> Result<(), TransportError> {
        write_all(client, &self.head_bytes(), TransportError::SendHeaderFailed)?;
        if !self.body.is_empty() {
            write_all(client, &self.body, TransportError::SendPayloadFailed)?;
        }
        Ok(())
    }
}
