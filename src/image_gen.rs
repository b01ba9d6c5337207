//! Image generation via an OpenAI-compatible images endpoint.

use std::path::PathBuf;

use anyhow::{Context, Result};
use base64::Engine as _;
use serde::{Deserialize, Serialize};

pub struct ImageGenerator {
    api_url: String,
    api_key: Option<String>,
    output_dir: PathBuf,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ImageRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    n: usize,
    response_format: &'a str,
}

#[derive(Debug, Deserialize)]
struct ImageResponse {
    data: Vec<ImageData>,
}

#[derive(Debug, Deserialize)]
struct ImageData {
    b64_json: String,
}

impl ImageGenerator {
    pub fn new(api_url: String, api_key: Option<String>, output_dir: PathBuf) -> Self {
        Self {
            api_url,
            api_key,
            output_dir,
            client: reqwest::Client::new(),
        }
    }

    /// Generate `count` images for `prompt` and write them under the output
    /// directory as `<filename>.png`, `<filename>_2.png`, and so on. Returns
    /// the written paths in generation order.
    pub async fn generate(
        &self,
        prompt: &str,
        count: usize,
        model: &str,
        filename: &str,
    ) -> Result<Vec<PathBuf>> {
        let url = format!("{}/images/generations", self.api_url);
        let request = ImageRequest {
            model,
            prompt,
            n: count.max(1),
            response_format: "b64_json",
        };

        let mut req = self.client.post(&url).json(&request);
        if let Some(key) = self.api_key.as_deref().filter(|k| !k.is_empty()) {
            req = req.header("Authorization", format!("Bearer {}", key));
        }

        let response = req
            .send()
            .await
            .context("Failed to send image generation request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("Image API returned error {}: {}", status, body);
        }

        let parsed: ImageResponse = response
            .json()
            .await
            .context("Failed to parse image generation response")?;

        if parsed.data.is_empty() {
            anyhow::bail!("Image API returned no images for prompt '{}'", prompt);
        }

        std::fs::create_dir_all(&self.output_dir).with_context(|| {
            format!("Failed to create image output dir {:?}", self.output_dir)
        })?;

        let mut paths = Vec::with_capacity(parsed.data.len());
        for (i, image) in parsed.data.iter().enumerate() {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(&image.b64_json)
                .context("Image payload was not valid base64")?;
            let name = if i == 0 {
                format!("{}.png", filename)
            } else {
                format!("{}_{}.png", filename, i + 1)
            };
            let path = self.output_dir.join(name);
            std::fs::write(&path, bytes)
                .with_context(|| format!("Failed to write image to {:?}", path))?;
            paths.push(path);
        }

        tracing::info!("Generated {} image(s) for '{}'", paths.len(), filename);
        Ok(paths)
    }
}
