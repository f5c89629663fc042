// 🌐 HTTP Collaborators - blocking reqwest behind the source traits

use crate::config::HarvestConfig;
use crate::error::{HarvestError, HarvestResult};
use crate::geo::Location;
use crate::source::{parse_document, parse_geocode_response, Geocoder, JsonSource};
use reqwest::blocking::Client as HttpClient;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const USER_AGENT: &str = concat!("loan-atlas/", env!("CARGO_PKG_VERSION"));

fn build_client() -> anyhow::Result<HttpClient> {
    let client = HttpClient::builder()
        .timeout(REQUEST_TIMEOUT)
        .user_agent(USER_AGENT)
        .build()?;
    Ok(client)
}

/// GET a URL and return the body, whatever the status code.
///
/// The lending API reports failures in the body, so a non-2xx answer is
/// still handed to the document parser.
fn get_text(client: &HttpClient, url: &str) -> HarvestResult<String> {
    debug!(url, "GET");
    client
        .get(url)
        .send()
        .and_then(|response| response.text())
        .map_err(|e| HarvestError::SourceData(format!("Request to {} failed: {}", url, e)))
}

pub struct HttpSource {
    client: HttpClient,
}

impl HttpSource {
    pub fn new() -> anyhow::Result<Self> {
        Ok(HttpSource {
            client: build_client()?,
        })
    }
}

impl JsonSource for HttpSource {
    fn fetch_json(&mut self, url: &str) -> HarvestResult<Value> {
        let body = get_text(&self.client, url)?;
        parse_document(&body)
    }
}

pub struct HttpGeocoder {
    client: HttpClient,
    base: String,
}

impl HttpGeocoder {
    pub fn new(config: &HarvestConfig) -> anyhow::Result<Self> {
        Ok(HttpGeocoder {
            client: build_client()?,
            base: config.geocoder_base.clone(),
        })
    }

    fn url_for(&self, query: &str) -> String {
        format!("{}?q={}", self.base, urlencoding::encode(query))
    }
}

impl Geocoder for HttpGeocoder {
    fn geocode(&mut self, query: &str) -> HarvestResult<Option<Location>> {
        let body = get_text(&self.client, &self.url_for(query))?;
        let doc: Value = serde_json::from_str(&body)
            .map_err(|_| HarvestError::SourceData(format!("Couldn't parse geocoder answer: {}", body)))?;
        parse_geocode_response(&doc)
    }
}
