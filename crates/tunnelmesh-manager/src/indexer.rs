//! Mapping inbound requests to cluster keys

use axum::body::Body;
use axum::http::Request;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("{0}")]
pub struct IndexError(pub String);

impl IndexError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Decides which cluster serves a request
pub trait Indexer: Send + Sync {
    fn index(&self, request: &Request<Body>) -> Result<String, IndexError>;
}

impl<F> Indexer for F
where
    F: Fn(&Request<Body>) -> Result<String, IndexError> + Send + Sync,
{
    fn index(&self, request: &Request<Body>) -> Result<String, IndexError> {
        self(request)
    }
}

/// Takes the cluster key from a request header
#[derive(Debug, Clone)]
pub struct HeaderIndexer {
    header: String,
}

impl HeaderIndexer {
    pub fn new(header: impl Into<String>) -> Self {
        Self {
            header: header.into(),
        }
    }
}

impl Indexer for HeaderIndexer {
    fn index(&self, request: &Request<Body>) -> Result<String, IndexError> {
        let value = request
            .headers()
            .get(self.header.as_str())
            .ok_or_else(|| IndexError::new(format!("missing header {}", self.header)))?;

        let key = value
            .to_str()
            .map_err(|_| IndexError::new(format!("header {} is not valid text", self.header)))?
            .trim();

        if key.is_empty() {
            return Err(IndexError::new(format!("header {} is empty", self.header)));
        }
        Ok(key.to_string())
    }
}

/// Takes the cluster key from the first path segment after a prefix,
/// e.g. `/clusters/{key}/...`
#[derive(Debug, Clone)]
pub struct PathIndexer {
    prefix: String,
}

impl PathIndexer {
    pub fn new(prefix: impl Into<String>) -> Self {
        let mut prefix = prefix.into();
        if !prefix.ends_with('/') {
            prefix.push('/');
        }
        Self { prefix }
    }
}

impl Indexer for PathIndexer {
    fn index(&self, request: &Request<Body>) -> Result<String, IndexError> {
        let path = request.uri().path();
        let rest = path
            .strip_prefix(self.prefix.as_str())
            .ok_or_else(|| IndexError::new(format!("path {} is outside {}", path, self.prefix)))?;

        match rest.split('/').next() {
            Some(key) if !key.is_empty() => Ok(key.to_string()),
            _ => Err(IndexError::new(format!("no cluster in path {}", path))),
        }
    }
}
