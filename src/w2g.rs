//! Watch2Gether rooms: create one around a video, or queue a video in an
//! existing room.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::api::{self, ApiError};

const API_BASE: &str = "https://api.w2g.tv";

#[async_trait]
pub trait WatchTogether: Send + Sync {
    /// Create a room sharing `video_url`. Returns the room's stream key.
    async fn create_room(&self, video_url: &str) -> Result<String, ApiError>;

    /// Append `video_url` to the current playlist of room `stream_key`.
    async fn add_video(&self, stream_key: &str, video_url: &str) -> Result<(), ApiError>;
}

pub fn room_url(stream_key: &str) -> String {
    format!("https://w2g.tv/rooms/{stream_key}")
}

pub struct W2gClient {
    api_key: String,
    http: reqwest::Client,
}

#[derive(Serialize)]
struct CreateRoomRequest<'a> {
    w2g_api_key: &'a str,
    share: &'a str,
    bg_color: &'static str,
    bg_opacity: &'static str,
}

#[derive(Deserialize)]
struct CreateRoomResponse {
    streamkey: Option<String>,
}

#[derive(Serialize)]
struct AddItemsRequest<'a> {
    w2g_api_key: &'a str,
    add_items: Vec<PlaylistItem<'a>>,
}

#[derive(Serialize)]
struct PlaylistItem<'a> {
    url: &'a str,
}

impl W2gClient {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            http: reqwest::Client::new(),
        }
    }

    fn create_request<'a>(&'a self, video_url: &'a str) -> CreateRoomRequest<'a> {
        CreateRoomRequest {
            w2g_api_key: &self.api_key,
            share: video_url,
            bg_color: "#1F1F1F",
            bg_opacity: "100",
        }
    }

    fn add_request<'a>(&'a self, video_url: &'a str) -> AddItemsRequest<'a> {
        AddItemsRequest {
            w2g_api_key: &self.api_key,
            add_items: vec![PlaylistItem { url: video_url }],
        }
    }
}

#[async_trait]
impl WatchTogether for W2gClient {
    async fn create_room(&self, video_url: &str) -> Result<String, ApiError> {
        let response: CreateRoomResponse = api::post_json(
            self.http.post(format!("{API_BASE}/rooms/create.json")),
            &self.create_request(video_url),
        )
        .await?;
        response.streamkey.filter(|key| !key.is_empty()).ok_or(ApiError::Empty)
    }

    async fn add_video(&self, stream_key: &str, video_url: &str) -> Result<(), ApiError> {
        let url = format!("{API_BASE}/rooms/{stream_key}/playlists/current/playlist_items/sync_update");
        api::post(self.http.post(url), &self.add_request(video_url)).await?;
        Ok(())
    }
}

/// Accept only absolute http(s) links.
pub fn is_video_url(text: &str) -> bool {
    let rest = text
        .strip_prefix("https://")
        .or_else(|| text.strip_prefix("http://"))
        .unwrap_or_default();
    !rest.is_empty() && !rest.starts_with('/') && !text.chars().any(char::is_whitespace)
}

/// Stream keys are plain alphanumerics; anything else would escape the URL path.
pub fn is_stream_key(text: &str) -> bool {
    !text.is_empty() && text.chars().all(|c| c.is_ascii_alphanumeric())
}
