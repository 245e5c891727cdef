use serde::{Deserialize, Serialize};

/// Body of a `places:searchText` request.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SearchTextRequest {
    pub text_query: String,
    pub language_code: String,
    pub max_result_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_token: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct SearchTextResponse {
    #[serde(default)]
    pub places: Option<Vec<Place>>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct Place {
    #[serde(default, deserialize_with = "crate::model::coerce_id")]
    pub id: String,
    pub display_name: Option<LocalizedText>,
    pub formatted_address: Option<String>,
    pub national_phone_number: Option<String>,
    pub international_phone_number: Option<String>,
    pub rating: Option<f64>,
    pub user_rating_count: Option<u32>,
    pub google_maps_uri: Option<String>,
    #[serde(default)]
    pub photos: Vec<Photo>,
}

#[derive(Deserialize, Debug, Default)]
pub struct LocalizedText {
    pub text: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct Photo {
    pub name: String,
}
