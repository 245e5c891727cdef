use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use std::fmt;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::model::Business;
use crate::places::model::{Place, SearchTextRequest, SearchTextResponse};

pub mod model;

pub const PLACES_SEARCH_URL: &str = "https://places.googleapis.com/v1/places:searchText";
const PHOTO_MEDIA_BASE: &str = "https://places.googleapis.com/v1/";
const FIELD_MASK: &str = "places.id,places.displayName,places.formattedAddress,places.nationalPhoneNumber,places.internationalPhoneNumber,places.rating,places.userRatingCount,places.googleMapsUri,places.photos,nextPageToken";

/// Upper bound the API accepts for `maxResultCount`.
pub const MAX_RESULT_COUNT: u32 = 20;

pub const UNNAMED_BUSINESS: &str = "Unnamed business";
pub const ADDRESS_UNAVAILABLE: &str = "Address unavailable";

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("Places API key is not configured. Set places.api_key in the config file or the PLACES_API_KEY environment variable.")]
    MissingApiKey,
    #[error("Invalid search: {0}")]
    InvalidQuery(&'static str),
    #[error("Invalid request. Check the search parameters.")]
    BadRequest,
    #[error("API key is invalid or lacks permission. Check your configuration.")]
    Forbidden,
    #[error("Request limit exceeded. Try again later.")]
    RateLimited,
    #[error("Failed to search businesses. Please try again.")]
    Transport(String),
}

/// The two fields of the search form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    business: String,
    city: String,
}

impl SearchQuery {
    pub fn new(business: &str, city: &str) -> Result<Self, SearchError> {
        let business = business.trim();
        let city = city.trim();
        if business.is_empty() {
            return Err(SearchError::InvalidQuery("business type must be non-empty"));
        }
        if city.is_empty() {
            return Err(SearchError::InvalidQuery("city must be non-empty"));
        }
        Ok(Self {
            business: business.to_string(),
            city: city.to_string(),
        })
    }

    pub fn business(&self) -> &str {
        &self.business
    }

    pub fn city(&self) -> &str {
        &self.city
    }

    pub fn text_query(&self) -> String {
        format!("{} in {}", self.business, self.city)
    }
}

/// One page of normalized results.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchPage {
    pub businesses: Vec<Business>,
    pub next_page_token: Option<String>,
}

#[async_trait]
pub trait PlacesService: Send + Sync {
    async fn search(
        &self,
        query: &SearchQuery,
        page_token: Option<&str>,
    ) -> Result<SearchPage, SearchError>;
}

#[derive(Clone)]
pub struct PlacesClient {
    http: Client,
    endpoint: Url,
    api_key: String,
    language: String,
    max_results: u32,
}

impl fmt::Debug for PlacesClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlacesClient")
            .field("endpoint", &self.endpoint)
            .field("language", &self.language)
            .finish_non_exhaustive()
    }
}

impl PlacesClient {
    pub fn new(api_key: String) -> Result<Self, SearchError> {
        let endpoint = Url::parse(PLACES_SEARCH_URL)
            .map_err(|err| SearchError::Transport(err.to_string()))?;
        Self::with_endpoint(api_key, endpoint, "en".into(), MAX_RESULT_COUNT)
    }

    pub fn with_endpoint(
        api_key: String,
        endpoint: Url,
        language: String,
        max_results: u32,
    ) -> Result<Self, SearchError> {
        let http = Client::builder()
            .user_agent("lead-finder/0.1")
            .no_proxy()
            .build()
            .map_err(|err| SearchError::Transport(err.to_string()))?;
        Ok(Self {
            http,
            endpoint,
            api_key,
            language,
            max_results: max_results.clamp(1, MAX_RESULT_COUNT),
        })
    }

    pub fn from_config(cfg: &Config) -> Result<Self, SearchError> {
        let endpoint = Url::parse(cfg.places.endpoint.trim())
            .map_err(|err| SearchError::Transport(err.to_string()))?;
        Self::with_endpoint(
            cfg.places_api_key(),
            endpoint,
            cfg.places.language.clone(),
            cfg.places.max_results,
        )
    }

    pub fn build_body(&self, query: &SearchQuery, page_token: Option<&str>) -> SearchTextRequest {
        SearchTextRequest {
            text_query: query.text_query(),
            language_code: self.language.clone(),
            max_result_count: self.max_results,
            page_token: page_token
                .filter(|token| !token.is_empty())
                .map(str::to_string),
        }
    }

    pub fn build_request(
        &self,
        query: &SearchQuery,
        page_token: Option<&str>,
    ) -> Result<reqwest::Request, SearchError> {
        self.http
            .post(self.endpoint.clone())
            .header("Content-Type", "application/json")
            .header("X-Goog-Api-Key", &self.api_key)
            .header("X-Goog-FieldMask", FIELD_MASK)
            .json(&self.build_body(query, page_token))
            .build()
            .map_err(|err| SearchError::Transport(err.to_string()))
    }

    #[instrument(skip_all, fields(query = %query.text_query(), paged = page_token.is_some()))]
    pub async fn search(
        &self,
        query: &SearchQuery,
        page_token: Option<&str>,
    ) -> Result<SearchPage, SearchError> {
        if self.api_key.trim().is_empty() {
            return Err(SearchError::MissingApiKey);
        }

        let request = self.build_request(query, page_token)?;
        debug!(url = %request.url(), "sending places search");
        let res = self.http.execute(request).await.map_err(|err| {
            warn!(?err, "failed to reach places API");
            SearchError::Transport(err.to_string())
        })?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            warn!(%status, %body, "places API error");
            return Err(classify_status(status, &body));
        }

        let payload: SearchTextResponse = res.json().await.map_err(|err| {
            warn!(?err, "invalid places response");
            SearchError::Transport(format!("invalid places response: {}", err))
        })?;
        let page = to_page(payload, &self.api_key);
        info!(
            results = page.businesses.len(),
            more = page.next_page_token.is_some(),
            "places search completed"
        );
        Ok(page)
    }
}

#[async_trait]
impl PlacesService for PlacesClient {
    async fn search(
        &self,
        query: &SearchQuery,
        page_token: Option<&str>,
    ) -> Result<SearchPage, SearchError> {
        PlacesClient::search(self, query, page_token).await
    }
}

pub fn classify_status(status: StatusCode, body: &str) -> SearchError {
    match status {
        StatusCode::BAD_REQUEST => SearchError::BadRequest,
        StatusCode::FORBIDDEN => SearchError::Forbidden,
        StatusCode::TOO_MANY_REQUESTS => SearchError::RateLimited,
        other => SearchError::Transport(format!("places error {}: {}", other, body)),
    }
}

pub fn to_page(payload: SearchTextResponse, api_key: &str) -> SearchPage {
    let places = payload.places.unwrap_or_default();
    if places.is_empty() {
        return SearchPage::default();
    }
    SearchPage {
        businesses: places
            .into_iter()
            .map(|place| to_business(place, api_key))
            .collect(),
        next_page_token: payload.next_page_token.filter(|token| !token.is_empty()),
    }
}

pub fn to_business(place: Place, api_key: &str) -> Business {
    let name = place
        .display_name
        .and_then(|n| n.text)
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| UNNAMED_BUSINESS.to_string());
    let phone = place
        .national_phone_number
        .filter(|p| !p.trim().is_empty())
        .or(place.international_phone_number.filter(|p| !p.trim().is_empty()));
    let photo_url = place
        .photos
        .first()
        .and_then(|photo| photo_url(&photo.name, api_key));

    Business {
        id: place.id,
        name,
        address: place
            .formatted_address
            .filter(|a| !a.trim().is_empty())
            .unwrap_or_else(|| ADDRESS_UNAVAILABLE.to_string()),
        phone,
        rating: place.rating.filter(|r| *r > 0.0),
        rating_count: place.user_rating_count.unwrap_or(0),
        maps_url: place.google_maps_uri.filter(|u| !u.is_empty()),
        photo_url,
    }
}

/// Media URL for a photo resource name, or `None` without a name or key.
pub fn photo_url(photo_name: &str, api_key: &str) -> Option<String> {
    if photo_name.is_empty() || api_key.is_empty() {
        return None;
    }
    Some(format!(
        "{}{}/media?maxHeightPx=400&maxWidthPx=400&key={}",
        PHOTO_MEDIA_BASE, photo_name, api_key
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn query() -> SearchQuery {
        SearchQuery::new("dentists", "Monterrey").unwrap()
    }

    #[test]
    fn query_requires_both_fields() {
        assert!(matches!(
            SearchQuery::new(" ", "Monterrey"),
            Err(SearchError::InvalidQuery(_))
        ));
        assert!(matches!(
            SearchQuery::new("dentists", ""),
            Err(SearchError::InvalidQuery(_))
        ));
        assert_eq!(query().text_query(), "dentists in Monterrey");
    }

    #[test]
    fn build_request_sets_headers_and_body() {
        let client = PlacesClient::new("key-123".into()).unwrap();
        let request = client.build_request(&query(), Some("tok-2")).unwrap();
        assert_eq!(request.method(), reqwest::Method::POST);
        assert_eq!(request.url().path(), "/v1/places:searchText");
        let headers = request.headers();
        assert_eq!(
            headers
                .get("X-Goog-Api-Key")
                .and_then(|h| h.to_str().ok())
                .unwrap(),
            "key-123"
        );
        assert_eq!(
            headers
                .get("X-Goog-FieldMask")
                .and_then(|h| h.to_str().ok())
                .unwrap(),
            FIELD_MASK
        );

        let body: serde_json::Value = serde_json::from_slice(
            request.body().and_then(|b| b.as_bytes()).unwrap(),
        )
        .unwrap();
        assert_eq!(body["textQuery"], "dentists in Monterrey");
        assert_eq!(body["languageCode"], "en");
        assert_eq!(body["maxResultCount"], 20);
        assert_eq!(body["pageToken"], "tok-2");
    }

    #[test]
    fn first_page_body_omits_token() {
        let client = PlacesClient::new("key".into()).unwrap();
        let body = serde_json::to_value(client.build_body(&query(), None)).unwrap();
        assert!(body.get("pageToken").is_none());
    }

    #[test]
    fn max_results_is_capped() {
        let client = PlacesClient::with_endpoint(
            "key".into(),
            Url::parse(PLACES_SEARCH_URL).unwrap(),
            "es".into(),
            50,
        )
        .unwrap();
        assert_eq!(client.build_body(&query(), None).max_result_count, 20);
    }

    #[tokio::test]
    async fn missing_key_fails_before_any_request() {
        let client = PlacesClient::new("  ".into()).unwrap();
        let err = client.search(&query(), None).await.unwrap_err();
        assert!(matches!(err, SearchError::MissingApiKey));
    }

    #[test]
    fn maps_full_place() {
        let place: Place = serde_json::from_value(json!({
            "id": "ChIJ1",
            "displayName": { "text": "Smile Clinic", "languageCode": "en" },
            "formattedAddress": "Av. Constitución 100",
            "nationalPhoneNumber": "81 1234 5678",
            "internationalPhoneNumber": "+52 81 1234 5678",
            "rating": 4.7,
            "userRatingCount": 88,
            "googleMapsUri": "https://maps.google.com/?cid=1",
            "photos": [{ "name": "places/ChIJ1/photos/abc" }, { "name": "places/ChIJ1/photos/def" }]
        }))
        .unwrap();
        let b = to_business(place, "k");
        assert_eq!(b.id, "ChIJ1");
        assert_eq!(b.name, "Smile Clinic");
        assert_eq!(b.phone.as_deref(), Some("81 1234 5678"));
        assert_eq!(b.rating, Some(4.7));
        assert_eq!(b.rating_count, 88);
        assert_eq!(
            b.photo_url.as_deref(),
            Some("https://places.googleapis.com/v1/places/ChIJ1/photos/abc/media?maxHeightPx=400&maxWidthPx=400&key=k")
        );
    }

    #[test]
    fn maps_sparse_place_with_placeholders() {
        let place: Place = serde_json::from_value(json!({
            "id": "ChIJ2",
            "internationalPhoneNumber": "+52 81 0000 0000"
        }))
        .unwrap();
        let b = to_business(place, "k");
        assert_eq!(b.name, UNNAMED_BUSINESS);
        assert_eq!(b.address, ADDRESS_UNAVAILABLE);
        assert_eq!(b.phone.as_deref(), Some("+52 81 0000 0000"));
        assert_eq!(b.rating, None);
        assert_eq!(b.rating_count, 0);
        assert!(b.maps_url.is_none());
        assert!(b.photo_url.is_none());
    }

    #[test]
    fn empty_response_has_no_token() {
        let payload: SearchTextResponse =
            serde_json::from_value(json!({ "nextPageToken": "ignored" })).unwrap();
        let page = to_page(payload, "k");
        assert!(page.businesses.is_empty());
        assert!(page.next_page_token.is_none());

        let payload: SearchTextResponse = serde_json::from_value(json!({})).unwrap();
        assert_eq!(to_page(payload, "k"), SearchPage::default());
    }

    #[test]
    fn page_carries_token() {
        let payload: SearchTextResponse = serde_json::from_value(json!({
            "places": [{ "id": "a" }, { "id": "b" }],
            "nextPageToken": "next"
        }))
        .unwrap();
        let page = to_page(payload, "k");
        assert_eq!(page.businesses.len(), 2);
        assert_eq!(page.next_page_token.as_deref(), Some("next"));
    }

    #[test]
    fn status_codes_map_to_distinct_errors() {
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, ""),
            SearchError::BadRequest
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, ""),
            SearchError::Forbidden
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, ""),
            SearchError::RateLimited
        ));
        assert!(matches!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR, "boom"),
            SearchError::Transport(_)
        ));

        let messages: std::collections::HashSet<String> = [
            SearchError::MissingApiKey,
            SearchError::BadRequest,
            SearchError::Forbidden,
            SearchError::RateLimited,
            SearchError::Transport("x".into()),
        ]
        .iter()
        .map(|e| e.to_string())
        .collect();
        assert_eq!(messages.len(), 5);
    }
}
