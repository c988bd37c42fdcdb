use std::path::Path;

use bytes::Bytes;
use reqwest::Client as HttpClient;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};

use crate::client::normalize_base_url;
use crate::error::VoiceError;

pub const DEFAULT_VOICE_PRESET: &str = "v2/en_speaker_1";

#[derive(Debug, Serialize)]
struct SynthesizeRequest<'a> {
    text: &'a str,
    voice_preset: &'a str,
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

#[derive(Debug, Deserialize)]
struct ServiceError {
    detail: String,
}

/// Client for the speech service (`/stt/` and `/tts/`).
#[derive(Clone)]
pub struct VoiceClient {
    base_url: String,
    http: HttpClient,
}

impl VoiceClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: normalize_base_url(base_url),
            http: HttpClient::new(),
        }
    }

    /// Uploads an audio file and returns its transcription.
    pub async fn transcribe(&self, path: impl AsRef<Path>) -> Result<String, VoiceError> {
        let path = path.as_ref();
        let audio = tokio::fs::read(path).await.map_err(|source| VoiceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audio.wav".to_string());

        let form = Form::new().part("audio", Part::bytes(audio).file_name(file_name));
        let response = self
            .http
            .post(format!("{}/stt/", self.base_url))
            .multipart(form)
            .send()
            .await?;

        let response = check_status(response).await?;
        let body: TranscriptionResponse = response.json().await?;
        Ok(body.text.trim().to_string())
    }

    /// Synthesizes `text` and returns the WAV audio.
    pub async fn synthesize(&self, text: &str, voice_preset: &str) -> Result<Bytes, VoiceError> {
        if text.trim().is_empty() {
            return Err(VoiceError::EmptyText);
        }

        let response = self
            .http
            .post(format!("{}/tts/", self.base_url))
            .json(&SynthesizeRequest { text, voice_preset })
            .send()
            .await?;

        let response = check_status(response).await?;
        Ok(response.bytes().await?)
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, VoiceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let detail = serde_json::from_str::<ServiceError>(&body)
        .map(|err| err.detail)
        .unwrap_or(body);
    Err(VoiceError::Status {
        status: status.as_u16(),
        detail,
    })
}
