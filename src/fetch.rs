use std::{io::Write, time::Duration};

use anyhow::{Context, Result};
use url::Url;

use crate::http::Response;

pub const BASE_URL: &str = "https://pokeapi.co/api/v2/pokemon";
pub const DEFAULT_LIMIT: u32 = 10;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Something that can perform a single `GET` request.
pub trait Transport {
    fn get(&self, url: &Url, timeout: Duration) -> Result<Response>;
}

impl<T: Transport + ?Sized> Transport for &T {
    fn get(&self, url: &Url, timeout: Duration) -> Result<Response> {
        (**self).get(url, timeout)
    }
}

pub struct Fetcher<T> {
    transport: T,
    base_url: Url,
    timeout: Duration,
}

impl<T: Transport> Fetcher<T> {
    pub fn new(transport: T) -> Result<Self> {
        Ok(Self {
            transport,
            base_url: Url::parse(BASE_URL)?,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    pub fn with_base_url(mut self, base_url: Url) -> Self {
        self.base_url = base_url;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The base URL with its `limit` query parameter set to `limit`. Other
    /// query parameters are kept.
    pub fn request_url(&self, limit: u32) -> Url {
        let mut url = self.base_url.clone();
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(key, _)| key != "limit")
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();
        url.query_pairs_mut()
            .clear()
            .extend_pairs(pairs)
            .append_pair("limit", &limit.to_string());
        url
    }

    pub fn fetch(&self, limit: u32) -> Result<Response> {
        let url = self.request_url(limit);
        tracing::debug!(%url, timeout = ?self.timeout, "fetching");

        let response = self
            .transport
            .get(&url, self.timeout)
            .with_context(|| format!("GET {url} failed"))?;

        tracing::debug!(
            status = response.status_code(),
            reason = response.status_message(),
            content_type = response.headers().get("content-type").map(String::as_str),
            bytes = response.body().len(),
            "fetched"
        );
        Ok(response)
    }

    /// Fetches `limit` items and writes the status code and raw body to `out`.
    /// Error statuses are printed like any other.
    pub fn run(&self, limit: u32, mut out: impl Write) -> Result<()> {
        let response = self.fetch(limit)?;

        writeln!(out, "Response status code: {}", response.status_code())?;
        writeln!(out, "{}", response.text())?;
        out.flush()?;

        Ok(())
    }
}
