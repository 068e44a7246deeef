//! Public CCTV catalog (ITS open API `cctvInfo`).
//!
//! Lists the highway cameras inside a longitude/latitude box together with their stream
//! URLs, which can be fed straight to the stream worker.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

use crate::config::CatalogSettings;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CctvEntry {
    pub name: String,
    pub url: String,
    pub longitude: Option<f64>,
    pub latitude: Option<f64>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CatalogQuery {
    pub min_x: f64,
    pub max_x: f64,
    pub min_y: f64,
    pub max_y: f64,
}

impl From<&CatalogSettings> for CatalogQuery {
    fn from(settings: &CatalogSettings) -> Self {
        Self {
            min_x: settings.min_x,
            max_x: settings.max_x,
            min_y: settings.min_y,
            max_y: settings.max_y,
        }
    }
}

/// Build the request URL. `type=ex` selects expressway cameras, `cctvType=1` live HLS.
pub fn request_url(endpoint: &str, api_key: &str, query: &CatalogQuery) -> Result<url::Url> {
    let mut url = url::Url::parse(endpoint)
        .with_context(|| format!("catalog endpoint is not a URL: {}", endpoint))?;
    url.query_pairs_mut()
        .append_pair("apiKey", api_key)
        .append_pair("type", "ex")
        .append_pair("cctvType", "1")
        .append_pair("minX", &query.min_x.to_string())
        .append_pair("maxX", &query.max_x.to_string())
        .append_pair("minY", &query.min_y.to_string())
        .append_pair("maxY", &query.max_y.to_string())
        .append_pair("getType", "json");
    Ok(url)
}

pub fn fetch(settings: &CatalogSettings, query: &CatalogQuery) -> Result<Vec<CctvEntry>> {
    let api_key = settings
        .api_key
        .as_deref()
        .ok_or_else(|| anyhow!("catalog.api_key is not configured"))?;
    let url = request_url(&settings.endpoint, api_key, query)?;
    let body: Value = ureq::AgentBuilder::new()
        .timeout(Duration::from_secs(10))
        .build()
        .get(url.as_str())
        .call()
        .with_context(|| format!("fetch cctv catalog from {}", settings.endpoint))?
        .into_json()
        .context("cctv catalog response was not JSON")?;
    parse_catalog(&body)
}

/// Extract entries from a `cctvInfo` response. Entries without a name or URL are skipped.
pub fn parse_catalog(body: &Value) -> Result<Vec<CctvEntry>> {
    let data = body
        .get("response")
        .and_then(|r| r.get("data"))
        .ok_or_else(|| anyhow!("cctv catalog response has no response.data"))?;

    // A single camera comes back as an object instead of a one-element array.
    let items: Vec<&Value> = match data {
        Value::Array(items) => items.iter().collect(),
        Value::Object(_) => vec![data],
        Value::Null => Vec::new(),
        other => return Err(anyhow!("unexpected response.data: {}", other)),
    };

    Ok(items
        .into_iter()
        .filter_map(|item| {
            let name = item.get("cctvname")?.as_str()?.trim();
            let url = item.get("cctvurl")?.as_str()?.trim();
            if name.is_empty() || url.is_empty() {
                return None;
            }
            Some(CctvEntry {
                name: name.to_string(),
                url: url.to_string(),
                longitude: item.get("coordx").and_then(number),
                latitude: item.get("coordy").and_then(number),
            })
        })
        .collect())
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_camera_list() -> Result<()> {
        let body = json!({
            "response": {
                "datacount": 3,
                "data": [
                    {"cctvname": "[경부선] 기흥", "cctvurl": "http://cctv.example/1.m3u8", "coordx": 127.1, "coordy": "37.27"},
                    {"cctvname": "", "cctvurl": "http://cctv.example/2.m3u8"},
                    {"cctvname": "[영동선] 마성", "cctvurl": "http://cctv.example/3.m3u8"}
                ]
            }
        });
        let entries = parse_catalog(&body)?;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].longitude, Some(127.1));
        assert_eq!(entries[0].latitude, Some(37.27));
        assert_eq!(entries[1].url, "http://cctv.example/3.m3u8");
        assert_eq!(entries[1].latitude, None);
        Ok(())
    }

    #[test]
    fn single_camera_object_is_accepted() -> Result<()> {
        let body = json!({"response": {"data": {"cctvname": "a", "cctvurl": "http://x/a"}}});
        assert_eq!(parse_catalog(&body)?.len(), 1);
        Ok(())
    }

    #[test]
    fn missing_data_is_an_error() {
        assert!(parse_catalog(&json!({"error": "bad key"})).is_err());
    }

    #[test]
    fn request_url_carries_bounding_box() -> Result<()> {
        let query = CatalogQuery {
            min_x: 126.8,
            max_x: 127.2,
            min_y: 37.4,
            max_y: 37.7,
        };
        let url = request_url("https://openapi.its.go.kr:9443/cctvInfo", "k", &query)?;
        let pairs: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs.get("minX").map(String::as_str), Some("126.8"));
        assert_eq!(pairs.get("maxY").map(String::as_str), Some("37.7"));
        assert_eq!(pairs.get("getType").map(String::as_str), Some("json"));
        Ok(())
    }
}
