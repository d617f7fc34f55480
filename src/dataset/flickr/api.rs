//! Flickr REST API client
//!
//! Only the two calls the downloader needs: `flickr.photos.search` (paginated)
//! and `flickr.photos.getExif` (GPS enrichment). Responses are requested as
//! plain JSON (`format=json&nojsoncallback=1`).

use std::fmt;
use std::sync::Arc;

use serde::de::{self, Deserializer};
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::dataset::fetcher::Transport;
use crate::dataset::flickr::{FlickrError, FlickrResult};

/// Default REST endpoint
pub const DEFAULT_BASE_URL: &str = "https://www.flickr.com/services/rest/";

/// Default page size for searches
pub const DEFAULT_PER_PAGE: u32 = 250;

/// Geographic bounding box in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub min_long: f64,
    pub max_lat: f64,
    pub max_long: f64,
}

impl BoundingBox {
    /// Parse `min_lat,min_long,max_lat,max_long`
    pub fn parse(input: &str) -> FlickrResult<Self> {
        let values = input
            .split(',')
            .map(|v| v.trim().parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| FlickrError::InvalidQuery(format!("bounding box {input:?}: {e}")))?;

        match values.as_slice() {
            [min_lat, min_long, max_lat, max_long] => Ok(Self {
                min_lat: *min_lat,
                min_long: *min_long,
                max_lat: *max_lat,
                max_long: *max_long,
            }),
            _ => Err(FlickrError::InvalidQuery(format!(
                "bounding box needs 4 values, got {}",
                values.len()
            ))),
        }
    }

    /// Flickr's `bbox` parameter order: longitude first
    fn as_param(&self) -> String {
        format!("{},{},{},{}", self.min_long, self.min_lat, self.max_long, self.max_lat)
    }
}

/// What to search for
#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
    pub bbox: Option<BoundingBox>,
    pub text: Option<String>,
}

impl fmt::Display for SearchQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.bbox, &self.text) {
            (Some(b), Some(t)) => write!(f, "'{}' in ({}, {}) - ({}, {})", t, b.min_lat, b.min_long, b.max_lat, b.max_long),
            (Some(b), None) => write!(f, "({}, {}) - ({}, {})", b.min_lat, b.min_long, b.max_lat, b.max_long),
            (None, Some(t)) => write!(f, "'{}'", t),
            (None, None) => write!(f, "everything"),
        }
    }
}

/// One photo record from a search page
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PhotoRecord {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub secret: String,
    #[serde(deserialize_with = "string_or_number")]
    pub server: String,
    #[serde(deserialize_with = "string_or_number")]
    pub farm: String,
}

impl PhotoRecord {
    /// Static image URL, also used as the duplicate key
    pub fn canonical_url(&self, size: &str) -> String {
        format!(
            "https://farm{}.staticflickr.com/{}/{}_{}_{}.jpg",
            self.farm, self.server, self.id, self.secret, size
        )
    }
}

/// A parsed search page
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchPage {
    #[serde(default, deserialize_with = "count")]
    pub page: u64,
    #[serde(default, deserialize_with = "count")]
    pub pages: u64,
    #[serde(default, deserialize_with = "count")]
    pub total: u64,
    #[serde(default, rename = "photo")]
    pub photos: Vec<PhotoRecord>,
}

/// GPS coordinates pulled from a photo's EXIF data
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeoTag {
    pub latitude: Option<String>,
    pub longitude: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    stat: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(flatten)]
    body: Option<T>,
}

#[derive(Debug, Deserialize)]
struct SearchBody {
    photos: SearchPage,
}

#[derive(Debug, Deserialize)]
struct ExifBody {
    photo: ExifPhoto,
}

#[derive(Debug, Deserialize)]
struct ExifPhoto {
    #[serde(default)]
    exif: Vec<ExifEntry>,
}

#[derive(Debug, Deserialize)]
struct ExifEntry {
    #[serde(default)]
    tagspace: String,
    #[serde(default)]
    label: String,
    #[serde(default)]
    raw: Option<Content>,
    #[serde(default)]
    clean: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(rename = "_content")]
    content: String,
}

/// Client for the Flickr REST API
pub struct FlickrClient {
    transport: Arc<dyn Transport>,
    api_key: String,
    base_url: String,
    per_page: u32,
}

impl FlickrClient {
    pub fn new(transport: Arc<dyn Transport>, api_key: impl Into<String>) -> Self {
        Self {
            transport,
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            per_page: DEFAULT_PER_PAGE,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_per_page(mut self, per_page: u32) -> Self {
        self.per_page = per_page.max(1);
        self
    }

    /// Query parameters for one search page
    pub fn search_params(&self, query: &SearchQuery, page: u64) -> Vec<(String, String)> {
        let mut params = vec![
            ("api_key".to_string(), self.api_key.clone()),
            ("method".to_string(), "flickr.photos.search".to_string()),
            ("page".to_string(), page.to_string()),
            ("per_page".to_string(), self.per_page.to_string()),
            ("media".to_string(), "photos".to_string()),
            ("format".to_string(), "json".to_string()),
            ("nojsoncallback".to_string(), "1".to_string()),
        ];
        if let Some(bbox) = &query.bbox {
            params.push(("bbox".to_string(), bbox.as_param()));
        }
        if let Some(text) = &query.text {
            params.push(("text".to_string(), text.clone()));
        }
        params
    }

    /// Fetch and parse one search page
    #[instrument(skip(self, query))]
    pub async fn search_page(&self, query: &SearchQuery, page: u64) -> FlickrResult<SearchPage> {
        let body = self.transport.get(&self.base_url, &self.search_params(query, page)).await?;
        let parsed: SearchBody = unwrap_envelope(&body)?;
        debug!("Page {} returned {} photos", page, parsed.photos.photos.len());
        Ok(parsed.photos)
    }

    /// GPS latitude and longitude for a photo, if it has any
    #[instrument(skip(self, photo), fields(photo_id = %photo.id))]
    pub async fn photo_location(&self, photo: &PhotoRecord) -> FlickrResult<GeoTag> {
        let params = vec![
            ("api_key".to_string(), self.api_key.clone()),
            ("method".to_string(), "flickr.photos.getExif".to_string()),
            ("photo_id".to_string(), photo.id.clone()),
            ("secret".to_string(), photo.secret.clone()),
            ("format".to_string(), "json".to_string()),
            ("nojsoncallback".to_string(), "1".to_string()),
        ];
        let body = self.transport.get(&self.base_url, &params).await?;
        let parsed: ExifBody = unwrap_envelope(&body)?;

        let mut geo = GeoTag::default();
        for entry in parsed.photo.exif.iter().filter(|e| e.tagspace == "GPS") {
            let value = entry.clean.as_ref().or(entry.raw.as_ref()).map(|c| c.content.clone());
            match entry.label.to_lowercase().as_str() {
                "gps latitude" | "latitude" => geo.latitude = value,
                "gps longitude" | "longitude" => geo.longitude = value,
                _ => {}
            }
        }
        Ok(geo)
    }
}

fn unwrap_envelope<T: for<'de> Deserialize<'de>>(body: &[u8]) -> FlickrResult<T> {
    let envelope: Envelope<T> = serde_json::from_slice(body)?;
    if envelope.stat != "ok" {
        return Err(FlickrError::Api(
            envelope.message.unwrap_or_else(|| format!("stat={}", envelope.stat)),
        ));
    }
    envelope
        .body
        .ok_or_else(|| FlickrError::Api("response body missing".to_string()))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrNumber {
    String(String),
    Number(serde_json::Number),
}

fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(match StringOrNumber::deserialize(deserializer)? {
        StringOrNumber::String(s) => s,
        StringOrNumber::Number(n) => n.to_string(),
    })
}

fn count<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    let raw = string_or_number(deserializer)?;
    raw.trim().parse::<u64>().map_err(de::Error::custom)
}
