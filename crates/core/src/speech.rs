//! Speech synthesis and transcription clients.

use crate::error::ChatError;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::{path::PathBuf, time::Duration};
use tracing::{debug, error, info, warn};

pub const DASHSCOPE_TTS_ENDPOINT: &str =
    "https://dashscope.aliyuncs.com/api/v1/services/aigc/multimodal-generation/generation";
pub const DEFAULT_TTS_MODEL: &str = "qwen3-tts-flash";
pub const DASHSCOPE_ASR_ENDPOINT: &str =
    "https://dashscope.aliyuncs.com/compatible-mode/v1/audio/transcriptions";
pub const DEFAULT_ASR_MODEL: &str = "qwen3-asr-flash";
pub const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Converts text into encoded audio bytes.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: String) -> Result<Vec<u8>, ChatError>;
}

/// Turns a local recording into text.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio_ref: PathBuf) -> Result<String, ChatError>;
}

#[derive(Deserialize)]
struct TtsEnvelope {
    output: TtsOutput,
}

#[derive(Deserialize)]
struct TtsOutput {
    audio: TtsAudio,
}

#[derive(Deserialize)]
struct TtsAudio {
    url: Option<String>,
}

/// The two reply shapes a TTS provider may use.
#[derive(Debug, PartialEq, Eq)]
pub enum TtsReply {
    /// `{"output": {"audio": {"url": ...}}}`; the audio must be fetched.
    Envelope { url: String },
    /// The body is the audio itself.
    RawAudio(Vec<u8>),
}

impl TtsReply {
    /// Tries the envelope first and falls back to raw audio. A JSON body that
    /// is not a usable envelope is never mistaken for audio.
    pub fn decode(body: Vec<u8>) -> Result<Self, ChatError> {
        let parsed = serde_json::from_slice::<TtsEnvelope>(&body);
        match parsed {
            Ok(envelope) => match envelope.output.audio.url {
                Some(url) if !url.trim().is_empty() => Ok(Self::Envelope { url }),
                _ => Err(ChatError::DecodingError("TTS reply has no audio url".into())),
            },
            Err(_) if body.is_empty() => Err(ChatError::DecodingError("TTS reply is empty".into())),
            Err(e) if serde_json::from_slice::<serde_json::Value>(&body).is_ok() => {
                Err(ChatError::DecodingError(format!("unexpected TTS reply: {e}")))
            }
            Err(_) => Ok(Self::RawAudio(body)),
        }
    }
}

/// Upgrades `http://` audio links to `https://`.
pub fn secure_audio_url(url: &str) -> String {
    match url.strip_prefix("http://") {
        Some(rest) => format!("https://{rest}"),
        None => url.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct SpeechConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub voice: Option<String>,
    pub download_timeout: Duration,
}

impl SpeechConfig {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            model: model.into(),
            voice: None,
            download_timeout: DEFAULT_DOWNLOAD_TIMEOUT,
        }
    }
}

/// `SpeechSynthesizer` backed by the DashScope multimodal generation API.
pub struct DashScopeSpeechClient {
    http: reqwest::Client,
    config: SpeechConfig,
}

impl DashScopeSpeechClient {
    pub fn new(config: SpeechConfig) -> Result<Self, ChatError> {
        reqwest::Url::parse(&config.endpoint)
            .map_err(|e| ChatError::InvalidUrl(format!("{}: {e}", config.endpoint)))?;
        Ok(Self {
            http: reqwest::Client::new(),
            config,
        })
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, ChatError> {
        let url = secure_audio_url(url);
        let parsed = reqwest::Url::parse(&url).map_err(|e| ChatError::InvalidUrl(format!("{url}: {e}")))?;

        debug!(%url, "Downloading synthesized audio");
        let response = self
            .http
            .get(parsed)
            .timeout(self.config.download_timeout)
            .send()
            .await
            .map_err(ChatError::connection)?;
        let status = response.status();
        if !status.is_success() {
            return Err(ChatError::status(status, ""));
        }
        Ok(response.bytes().await.map_err(ChatError::connection)?.to_vec())
    }
}

#[async_trait]
impl SpeechSynthesizer for DashScopeSpeechClient {
    async fn synthesize(&self, text: String) -> Result<Vec<u8>, ChatError> {
        let mut input = json!({ "text": text });
        if let Some(voice) = &self.config.voice {
            input["voice"] = json!(voice);
        }
        let body = json!({ "model": self.config.model, "input": input });

        info!(chars = text.chars().count(), "Requesting speech synthesis");
        let response = self
            .http
            .post(&self.config.endpoint)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(ChatError::connection)?;

        let status = response.status();
        let bytes = response.bytes().await.map_err(ChatError::connection)?;
        if !status.is_success() {
            let body = String::from_utf8_lossy(&bytes);
            error!(%status, %body, "TTS endpoint returned an error");
            return Err(ChatError::status(status, &body));
        }

        match TtsReply::decode(bytes.to_vec())? {
            TtsReply::Envelope { url } => self.download(&url).await,
            TtsReply::RawAudio(audio) => Ok(audio),
        }
    }
}

#[derive(Deserialize)]
struct TranscriptionReply {
    text: String,
}

fn mime_for(path: &std::path::Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase).as_deref() {
        Some("m4a") | Some("mp4") | Some("aac") => "audio/mp4",
        Some("wav") => "audio/wav",
        Some("mp3") => "audio/mpeg",
        _ => "application/octet-stream",
    }
}

/// `Transcriber` uploading recordings to an OpenAI-compatible
/// `/audio/transcriptions` endpoint.
pub struct RemoteTranscriber {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl RemoteTranscriber {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Result<Self, ChatError> {
        let endpoint = endpoint.into();
        reqwest::Url::parse(&endpoint).map_err(|e| ChatError::InvalidUrl(format!("{endpoint}: {e}")))?;
        Ok(Self {
            http: reqwest::Client::new(),
            endpoint,
            api_key: api_key.into(),
            model: model.into(),
        })
    }
}

#[async_trait]
impl Transcriber for RemoteTranscriber {
    async fn transcribe(&self, audio_ref: PathBuf) -> Result<String, ChatError> {
        let failed = |reason: String| {
            warn!(path = %audio_ref.display(), %reason, "Transcription failed");
            ChatError::TranscriptionFailed(reason)
        };

        let bytes = tokio::fs::read(&audio_ref)
            .await
            .map_err(|e| failed(format!("cannot read recording: {e}")))?;
        let file_name = audio_ref
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("recording.m4a")
            .to_string();
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str(mime_for(&audio_ref))
            .map_err(|e| failed(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone());

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(failed(format!("status {status}")));
        }

        let reply: TranscriptionReply = response.json().await.map_err(|e| failed(e.to_string()))?;
        let text = reply.text.trim().to_string();
        if text.is_empty() {
            return Err(failed("empty transcript".into()));
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_partial_json, header, method, path},
    };

    #[test]
    fn test_secure_audio_url() {
        assert_eq!(
            secure_audio_url("http://oss.example.com/a.wav?x=http://y"),
            "https://oss.example.com/a.wav?x=http://y"
        );
        assert_eq!(secure_audio_url("https://oss.example.com/a.wav"), "https://oss.example.com/a.wav");
    }

    #[test]
    fn test_reply_decoding() {
        let envelope = br#"{"output":{"audio":{"url":"http://oss/a.wav"}},"request_id":"r"}"#.to_vec();
        assert_eq!(
            TtsReply::decode(envelope).unwrap(),
            TtsReply::Envelope { url: "http://oss/a.wav".into() }
        );

        let raw = b"RIFF\x24\x00\x00\x00WAVEfmt ".to_vec();
        assert_eq!(TtsReply::decode(raw.clone()).unwrap(), TtsReply::RawAudio(raw));

        let no_url = br#"{"output":{"audio":{}}}"#.to_vec();
        assert!(matches!(TtsReply::decode(no_url), Err(ChatError::DecodingError(_))));

        let other_json = br#"{"code":"Throttling","message":"slow down"}"#.to_vec();
        assert!(matches!(TtsReply::decode(other_json), Err(ChatError::DecodingError(_))));

        assert!(matches!(TtsReply::decode(Vec::new()), Err(ChatError::DecodingError(_))));
    }

    fn speech_client(server: &MockServer) -> DashScopeSpeechClient {
        DashScopeSpeechClient::new(SpeechConfig::new(format!("{}/tts", server.uri()), "key", DEFAULT_TTS_MODEL))
            .unwrap()
    }

    #[tokio::test]
    async fn test_synthesize_raw_audio() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tts"))
            .and(header("authorization", "Bearer key"))
            .and(body_partial_json(json!({"model": "qwen3-tts-flash", "input": {"text": "元気です"}})))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ID3\x04audio".to_vec()))
            .mount(&server)
            .await;

        let audio = speech_client(&server).synthesize("元気です".into()).await.unwrap();
        assert_eq!(audio, b"ID3\x04audio".to_vec());
    }

    #[tokio::test]
    async fn test_synthesize_envelope_never_fetches_insecure_url() {
        let server = MockServer::start().await;
        let insecure = format!("{}/audio.wav", server.uri());
        assert!(insecure.starts_with("http://"));

        Mock::given(method("POST"))
            .and(path("/tts"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"output": {"audio": {"url": insecure}}})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/audio.wav"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"RIFF".to_vec()))
            .expect(0)
            .mount(&server)
            .await;

        // The rewritten https:// URL cannot be served by the plain-http mock.
        let result = speech_client(&server).synthesize("hi".into()).await;
        assert!(matches!(result, Err(ChatError::RequestFailed { .. })));
    }

    #[tokio::test]
    async fn test_synthesize_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .mount(&server)
            .await;

        match speech_client(&server).synthesize("hi".into()).await {
            Err(ChatError::RequestFailed { status, .. }) => assert_eq!(status, Some(401)),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_transcribe_uploads_recording() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/asr"))
            .and(header("authorization", "Bearer key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"text": " こんにちは "})))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let recording = dir.path().join("voice_msg_1.m4a");
        std::fs::write(&recording, b"fake aac").unwrap();

        let transcriber = RemoteTranscriber::new(format!("{}/asr", server.uri()), "key", DEFAULT_ASR_MODEL).unwrap();
        assert_eq!(transcriber.transcribe(recording).await.unwrap(), "こんにちは");
    }

    #[tokio::test]
    async fn test_transcribe_failures() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"text": "   "})))
            .mount(&server)
            .await;
        let transcriber = RemoteTranscriber::new(format!("{}/asr", server.uri()), "key", DEFAULT_ASR_MODEL).unwrap();

        let missing = transcriber.transcribe(PathBuf::from("/definitely/missing.m4a")).await;
        assert!(matches!(missing, Err(ChatError::TranscriptionFailed(_))));

        let dir = tempfile::tempdir().unwrap();
        let recording = dir.path().join("silence.wav");
        std::fs::write(&recording, b"RIFF").unwrap();
        let blank = transcriber.transcribe(recording).await;
        assert!(matches!(blank, Err(ChatError::TranscriptionFailed(_))));
    }

    #[test]
    fn test_mime_for_extension() {
        assert_eq!(mime_for(std::path::Path::new("a.M4A")), "audio/mp4");
        assert_eq!(mime_for(std::path::Path::new("a.wav")), "audio/wav");
        assert_eq!(mime_for(std::path::Path::new("a")), "application/octet-stream");
    }
}
