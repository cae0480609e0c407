pub mod error;

pub use error::{GeocodeError, Result};

use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://maps.googleapis.com";

/// Coordinates plus the provider's canonical address for a geocoded string.
#[derive(Debug, Clone, PartialEq)]
pub struct Geocoded {
    pub latitude: f64,
    pub longitude: f64,
    pub formatted_address: String,
    pub place_id: String,
}

#[derive(Clone)]
pub struct GeocodeClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl GeocodeClient {
    pub fn new(api_key: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    /// Forward-geocode a street address, biased toward US results.
    ///
    /// `Ok(None)` means the provider answered but found nothing — callers
    /// treat that the same as a provider outage (coordinates stay empty).
    pub async fn geocode(&self, address: &str) -> Result<Option<Geocoded>> {
        if address.trim().is_empty() {
            return Ok(None);
        }

        let endpoint = format!("{}/maps/api/geocode/json", self.base_url);

        let resp = self
            .client
            .get(&endpoint)
            .query(&[
                ("address", address),
                ("key", self.api_key.as_str()),
                ("region", "us"),
            ])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(GeocodeError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body: GeocodeResponse = resp.json().await?;

        match body.status.as_str() {
            "OK" => {}
            "ZERO_RESULTS" => {
                debug!(address, "Geocoder found no match");
                return Ok(None);
            }
            other => return Err(GeocodeError::Rejected(other.to_string())),
        }

        let Some(first) = body.results.into_iter().next() else {
            return Ok(None);
        };

        Ok(Some(Geocoded {
            latitude: first.geometry.location.lat,
            longitude: first.geometry.location.lng,
            formatted_address: first.formatted_address,
            place_id: first.place_id,
        }))
    }
}

#[derive(Debug, Deserialize)]
struct GeocodeResponse {
    status: String,
    #[serde(default)]
    results: Vec<GeocodeResult>,
}

#[derive(Debug, Deserialize)]
struct GeocodeResult {
    geometry: Geometry,
    formatted_address: String,
    place_id: String,
}

#[derive(Debug, Deserialize)]
struct Geometry {
    location: LatLng,
}

#[derive(Debug, Deserialize)]
struct LatLng {
    lat: f64,
    lng: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_body_decodes() {
        let raw = serde_json::json!({
            "status": "OK",
            "results": [{
                "geometry": {"location": {"lat": 46.6021, "lng": -120.5059}},
                "formatted_address": "Yakima, WA, USA",
                "place_id": "ChIJ123"
            }]
        });
        let body: GeocodeResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(body.status, "OK");
        assert_eq!(body.results[0].geometry.location.lat, 46.6021);
    }

    #[test]
    fn zero_results_body_decodes_without_results() {
        let raw = serde_json::json!({"status": "ZERO_RESULTS"});
        let body: GeocodeResponse = serde_json::from_value(raw).unwrap();
        assert!(body.results.is_empty());
    }

    #[test]
    fn base_url_trailing_slash_trimmed() {
        let client = GeocodeClient::new("key").with_base_url("http://localhost:8089/");
        assert_eq!(client.base_url, "http://localhost:8089");
    }
}
