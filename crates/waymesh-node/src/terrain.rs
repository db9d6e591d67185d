//! Elevation lookups for received poses.
//!
//! [`HttpTerrain`] speaks the OpenTopo-style API:
//!
//! ```text
//! GET {endpoint}/v1/{dataset}?locations=lat,lng|lat,lng
//! -> { "results": [ { "elevation": 512.3 }, { "elevation": null } ] }
//! ```
//!
//! [`GroundResolver`] puts a quantized cache in front of any [`Terrain`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::collaborators::Terrain;
use crate::error::{Error, Result};

/// Cached cells before the cache is cleared.
pub const CACHE_CAPACITY: usize = 4096;

/// Cells per degree (1e-5 degree, roughly a metre).
const CELLS_PER_DEGREE: f64 = 1e5;

#[derive(Debug, Deserialize)]
struct ElevationResponse {
    #[serde(default)]
    results: Vec<ElevationResult>,
}

#[derive(Debug, Deserialize)]
struct ElevationResult {
    #[serde(default)]
    elevation: Option<f64>,
}

/// HTTP elevation client.
pub struct HttpTerrain {
    client: reqwest::Client,
    endpoint: String,
    dataset: String,
}

impl HttpTerrain {
    pub fn new(endpoint: impl Into<String>, dataset: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Network(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            dataset: dataset.into(),
        })
    }

    fn locations(points: &[(f64, f64)]) -> String {
        points
            .iter()
            .map(|(lat, lon)| format!("{lat},{lon}"))
            .collect::<Vec<_>>()
            .join("|")
    }
}

#[async_trait]
impl Terrain for HttpTerrain {
    async fn query_batch(
        &self,
        points: &[(f64, f64)],
        timeout: Duration,
    ) -> Result<Vec<Option<f64>>> {
        if points.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/v1/{}", self.endpoint, self.dataset);
        let response: ElevationResponse = self
            .client
            .get(url)
            .query(&[("locations", Self::locations(points))])
            .timeout(timeout)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::Network(e.to_string()))?
            .json()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        let mut heights: Vec<Option<f64>> = response
            .results
            .into_iter()
            .map(|r| r.elevation.filter(|h| h.is_finite()))
            .collect();
        heights.resize(points.len(), None);
        Ok(heights)
    }
}

fn cell(lat: f64, lon: f64) -> (i64, i64) {
    (
        (lat * CELLS_PER_DEGREE).round() as i64,
        (lon * CELLS_PER_DEGREE).round() as i64,
    )
}

/// Ground heights keyed by quantized location.
#[derive(Debug)]
pub struct TerrainCache {
    cells: HashMap<(i64, i64), f64>,
    capacity: usize,
}

impl TerrainCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            cells: HashMap::new(),
            capacity,
        }
    }

    pub fn get(&self, lat: f64, lon: f64) -> Option<f64> {
        self.cells.get(&cell(lat, lon)).copied()
    }

    pub fn insert(&mut self, lat: f64, lon: f64, height: f64) {
        if self.cells.len() >= self.capacity {
            self.cells.clear();
        }
        self.cells.insert(cell(lat, lon), height);
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

impl Default for TerrainCache {
    fn default() -> Self {
        Self::new(CACHE_CAPACITY)
    }
}

/// Local ground height lookups with caching. Never fails: unknown ground is `None`.
pub struct GroundResolver {
    terrain: Option<Arc<dyn Terrain>>,
    cache: Mutex<TerrainCache>,
    timeout: Duration,
}

impl GroundResolver {
    pub fn new(terrain: Option<Arc<dyn Terrain>>, timeout: Duration) -> Self {
        Self {
            terrain,
            cache: Mutex::new(TerrainCache::default()),
            timeout,
        }
    }

    pub async fn ground_at(&self, lat: f64, lon: f64) -> Option<f64> {
        let cached = self
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(lat, lon);
        if cached.is_some() {
            return cached;
        }
        let terrain = self.terrain.as_ref()?;
        match terrain.query_batch(&[(lat, lon)], self.timeout).await {
            Ok(heights) => {
                let height = heights.first().copied().flatten()?;
                self.cache
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(lat, lon, height);
                Some(height)
            }
            Err(e) => {
                debug!(lat, lon, error = %e, "terrain lookup failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::Query, routing::get, Json, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn cache_quantizes_to_1e5_degrees() {
        let mut cache = TerrainCache::default();
        cache.insert(48.123451, 11.000001, 500.0);
        assert_eq!(cache.get(48.123449, 11.000002), Some(500.0));
        assert_eq!(cache.get(48.12347, 11.0), None);
    }

    #[test]
    fn cache_clears_when_full() {
        let mut cache = TerrainCache::new(2);
        cache.insert(0.0, 0.0, 1.0);
        cache.insert(0.0, 1.0, 2.0);
        cache.insert(0.0, 2.0, 3.0);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(0.0, 2.0), Some(3.0));
    }

    #[test]
    fn locations_format() {
        assert_eq!(HttpTerrain::locations(&[(1.5, 2.0), (-3.0, 4.25)]), "1.5,2|-3,4.25");
    }

    struct CountingTerrain {
        calls: AtomicUsize,
        height: Option<f64>,
    }

    #[async_trait]
    impl Terrain for CountingTerrain {
        async fn query_batch(&self, points: &[(f64, f64)], _: Duration) -> Result<Vec<Option<f64>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![self.height; points.len()])
        }
    }

    #[tokio::test]
    async fn resolver_caches_hits() {
        let terrain = Arc::new(CountingTerrain { calls: AtomicUsize::new(0), height: Some(42.0) });
        let resolver = GroundResolver::new(Some(terrain.clone()), Duration::from_millis(100));
        assert_eq!(resolver.ground_at(1.0, 2.0).await, Some(42.0));
        assert_eq!(resolver.ground_at(1.0, 2.0).await, Some(42.0));
        assert_eq!(terrain.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn resolver_without_terrain_or_data() {
        let resolver = GroundResolver::new(None, Duration::from_millis(100));
        assert_eq!(resolver.ground_at(1.0, 2.0).await, None);

        let terrain = Arc::new(CountingTerrain { calls: AtomicUsize::new(0), height: None });
        let resolver = GroundResolver::new(Some(terrain.clone()), Duration::from_millis(100));
        assert_eq!(resolver.ground_at(1.0, 2.0).await, None);
        assert_eq!(resolver.ground_at(1.0, 2.0).await, None);
        assert_eq!(terrain.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn http_terrain_against_local_service() {
        async fn elevations(Query(q): Query<HashMap<String, String>>) -> Json<serde_json::Value> {
            let results: Vec<serde_json::Value> = q
                .get("locations")
                .map(|l| l.split('|').collect::<Vec<_>>())
                .unwrap_or_default()
                .into_iter()
                .map(|loc| {
                    if loc.starts_with("0,") {
                        serde_json::json!({ "elevation": null })
                    } else {
                        serde_json::json!({ "elevation": 100.5 })
                    }
                })
                .collect();
            Json(serde_json::json!({ "results": results }))
        }

        let app = Router::new().route("/v1/mapzen", get(elevations));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let terrain = HttpTerrain::new(format!("http://{addr}/"), "mapzen").unwrap();
        let heights = terrain
            .query_batch(&[(48.1, 11.5), (0.0, 1.0)], Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(heights, vec![Some(100.5), None]);
    }

    #[tokio::test]
    async fn http_terrain_unreachable_is_error() {
        let terrain = HttpTerrain::new("http://127.0.0.1:9", "mapzen").unwrap();
        assert!(terrain
            .query_batch(&[(1.0, 1.0)], Duration::from_millis(300))
            .await
            .is_err());
    }
}
