//! Vision API classifier.
//! Sends the reassembled board image to an OpenAI-compatible chat endpoint
//! and reads the piece placement back. No local model needed.
//! Latency: 500-2000ms per board (network dependent), so pair it with a
//! stability window rather than per-frame decisions.
//! Requires OPENAI_API_KEY (or an explicit key).

use crate::classifier::{Classification, Classifier};
use crate::layout;
use crate::tiles::TileGrid;
use anyhow::{Context, Result};
use base64::{Engine as _, engine::general_purpose};
use image::{DynamicImage, ImageFormat};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::time::Duration;
use tokio::runtime::Runtime;
use tracing::{debug, warn};

const API_URL: &str = "https://api.openai.com/v1/chat/completions";
const MODEL: &str = "gpt-4o";
const MAX_API_RETRIES: u32 = 2;
const TIMEOUT_SECS: u64 = 30;
/// Reply meaning "this is not a chessboard".
const NO_BOARD_REPLY: &str = "NONE";

// *************** Request/Response Types ***************

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage {
    role: String,
    content: Vec<ContentPart>,
}

#[derive(Serialize)]
#[serde(tag = "type")]
enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrlDetail },
}

#[derive(Serialize)]
struct ImageUrlDetail {
    url: String,
    detail: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: String,
}

// *************** Public API ***************

/// Checks if the OpenAI API key is available
pub fn has_api_key() -> bool {
    std::env::var("OPENAI_API_KEY").is_ok()
}

pub struct VisionApiClassifier {
    client: Client,
    runtime: Runtime,
    api_key: String,
    api_url: String,
    model: String,
}

impl VisionApiClassifier {
    /// Reads the key from OPENAI_API_KEY.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .context("OPENAI_API_KEY environment variable not set")?;
        Self::new(api_key)
    }

    pub fn new(api_key: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(TIMEOUT_SECS))
            .build()
            .context("Failed to create HTTP client")?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("Failed to start async runtime for the vision API client")?;
        Ok(Self {
            client,
            runtime,
            api_key,
            api_url: API_URL.to_string(),
            model: MODEL.to_string(),
        })
    }

    /// Points the client at another OpenAI-compatible endpoint.
    pub fn with_endpoint(mut self, api_url: impl Into<String>, model: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self.model = model.into();
        self
    }

    async fn classify_async(&self, tiles: &TileGrid) -> Result<Option<Classification>> {
        let png = encode_board_png(tiles)?;
        let request = build_request(&self.model, &general_purpose::STANDARD.encode(&png));
        let reply = self.call_api_with_retry(&request).await?;
        debug!("Vision API returned: {}", reply);
        parse_reply(&reply)
    }

    async fn call_api_with_retry(&self, request: &ChatRequest) -> Result<String> {
        let mut last_error = None;

        for attempt in 1..=MAX_API_RETRIES + 1 {
            match self.call_api(request).await {
                Ok(reply) => return Ok(reply),
                Err(e) => {
                    warn!(
                        "Vision API attempt {}/{} failed: {}",
                        attempt,
                        MAX_API_RETRIES + 1,
                        e
                    );
                    last_error = Some(e);
                    if attempt <= MAX_API_RETRIES {
                        tokio::time::sleep(Duration::from_millis(500)).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("Vision API was never called")))
    }

    async fn call_api(&self, request: &ChatRequest) -> Result<String> {
        let response = self
            .client
            .post(&self.api_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await
            .context("Failed to send request to vision API")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Vision API error {}: {}", status, body);
        }

        let api_response: ChatResponse = response
            .json()
            .await
            .context("Failed to parse vision API response")?;

        api_response
            .choices
            .first()
            .map(|c| c.message.content.trim().to_string())
            .ok_or_else(|| anyhow::anyhow!("No response from vision API"))
    }
}

impl Classifier for VisionApiClassifier {
    fn classify(&self, tiles: &TileGrid) -> Result<Option<Classification>> {
        self.runtime.block_on(self.classify_async(tiles))
    }
}

// *************** Internal Functions ***************

fn encode_board_png(tiles: &TileGrid) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    DynamicImage::ImageLuma8(tiles.to_image())
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .context("Failed to encode board image")?;
    Ok(bytes)
}

fn build_prompt() -> String {
    format!(
        r#"This is a cropped chessboard from a video frame. Output ONLY the piece placement field of its FEN.

Rules:
- Output ONLY the placement, nothing else (no explanation, no markdown, no quotes, no side to move)
- Describe the board exactly as drawn, top row of the image first, even if black is at the bottom
- Uppercase = White (KQRBNP), lowercase = Black (kqrbnp)
- Numbers represent consecutive empty squares, rows separated by /
- If the image is not a chessboard, output {NO_BOARD_REPLY}

Example output for the starting position:
rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR"#
    )
}

fn build_request(model: &str, base64_image: &str) -> ChatRequest {
    ChatRequest {
        model: model.to_string(),
        messages: vec![ChatMessage {
            role: "user".to_string(),
            content: vec![
                ContentPart::Text {
                    text: build_prompt(),
                },
                ContentPart::ImageUrl {
                    image_url: ImageUrlDetail {
                        url: format!("data:image/png;base64,{}", base64_image),
                        detail: "high".to_string(),
                    },
                },
            ],
        }],
        max_tokens: 100,
    }
}

/// Accepts a bare placement or a full FEN (only the first field is kept).
fn parse_reply(reply: &str) -> Result<Option<Classification>> {
    let cleaned = reply.trim().trim_matches('`').trim();
    if cleaned.eq_ignore_ascii_case(NO_BOARD_REPLY) || cleaned.is_empty() {
        return Ok(None);
    }
    let placement = cleaned.split_whitespace().next().unwrap_or_default();
    let layout = layout::validate_layout(placement)?;
    Ok(Some(Classification {
        layout,
        confidence: None,
    }))
}

// *************** Tests ***************
