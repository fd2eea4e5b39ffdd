use anyhow::Result;
use async_trait::async_trait;
use palaver_schema::SynthesizedAudio;
use reqwest::StatusCode;
use serde::Deserialize;
use std::sync::Mutex;

#[async_trait]
pub trait SpeechProvider: Send + Sync {
    fn supports_transcription(&self) -> bool {
        false
    }

    async fn transcribe_audio(&self, _audio: Vec<u8>, _filename: &str) -> Result<String> {
        anyhow::bail!("transcription not supported by this speech provider")
    }

    async fn synthesize_voice(&self, text: &str, voice: &str) -> Result<SynthesizedAudio>;
}

#[derive(Debug, Clone)]
pub struct OpenAiSpeech {
    client: reqwest::Client,
    api_key: String,
    api_base: String,
}

impl OpenAiSpeech {
    pub fn new(api_key: impl Into<String>, api_base: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(60))
                .build()
                .unwrap_or_default(),
            api_key: api_key.into(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl SpeechProvider for OpenAiSpeech {
    fn supports_transcription(&self) -> bool {
        true
    }

    async fn transcribe_audio(&self, audio: Vec<u8>, filename: &str) -> Result<String> {
        let url = format!("{}/audio/transcriptions", self.api_base);
        let part = reqwest::multipart::Part::bytes(audio).file_name(filename.to_string());
        let form = reqwest::multipart::Form::new()
            .text("model", "whisper-1")
            .part("file", part);

        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await?;

        let status = resp.status();
        if status != StatusCode::OK {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("speech api error ({status}): {body}");
        }
        let body: TranscriptionResponse = resp.json().await?;
        Ok(body.text)
    }

    async fn synthesize_voice(&self, text: &str, voice: &str) -> Result<SynthesizedAudio> {
        let url = format!("{}/audio/speech", self.api_base);
        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "model": "tts-1",
                "voice": voice,
                "input": text,
                "response_format": "mp3",
            }))
            .send()
            .await?;

        let status = resp.status();
        if status != StatusCode::OK {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("speech api error ({status}): {body}");
        }

        let audio = resp.bytes().await?.to_vec();
        Ok(SynthesizedAudio {
            audio,
            duration_secs: estimate_duration(text),
            format: "mp3".into(),
        })
    }
}

/// The speech endpoint does not report duration; estimate it from word
/// count at a typical speaking rate.
fn estimate_duration(text: &str) -> f32 {
    let words = text.split_whitespace().count();
    words as f32 / 2.5
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

/// Scripted speech provider for tests. `fail_synthesis` forces the
/// text-fallback path in callers.
#[derive(Default)]
pub struct StubSpeech {
    pub transcript: Option<String>,
    pub fail_synthesis: bool,
    pub synthesized: Mutex<Vec<String>>,
}

impl StubSpeech {
    pub fn with_transcript(transcript: &str) -> Self {
        Self {
            transcript: Some(transcript.to_string()),
            ..Self::default()
        }
    }
}

#[async_trait]
impl SpeechProvider for StubSpeech {
    fn supports_transcription(&self) -> bool {
        self.transcript.is_some()
    }

    async fn transcribe_audio(&self, _audio: Vec<u8>, _filename: &str) -> Result<String> {
        self.transcript
            .clone()
            .ok_or_else(|| anyhow::anyhow!("transcription not supported by this speech provider"))
    }

    async fn synthesize_voice(&self, text: &str, voice: &str) -> Result<SynthesizedAudio> {
        if self.fail_synthesis {
            anyhow::bail!("synthesis failed");
        }
        self.synthesized
            .lock()
            .expect("stub lock poisoned")
            .push(text.to_string());
        Ok(SynthesizedAudio {
            audio: format!("{voice}:{text}").into_bytes(),
            duration_secs: estimate_duration(text),
            format: "mp3".into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn synthesize_returns_audio_bytes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/audio/speech"))
            .and(body_partial_json(serde_json::json!({"voice": "alloy"})))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"mp3-bytes".to_vec()))
            .mount(&server)
            .await;

        let speech = OpenAiSpeech::new("sk-test", server.uri());
        let audio = speech.synthesize_voice("hello world", "alloy").await.unwrap();
        assert_eq!(audio.audio, b"mp3-bytes");
        assert_eq!(audio.format, "mp3");
        assert!(audio.duration_secs > 0.0);
    }

    #[tokio::test]
    async fn synthesize_propagates_api_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/audio/speech"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let speech = OpenAiSpeech::new("sk-test", server.uri());
        assert!(speech.synthesize_voice("hello", "alloy").await.is_err());
    }

    #[tokio::test]
    async fn stub_records_synthesized_text() {
        let stub = StubSpeech::default();
        stub.synthesize_voice("say this", "alloy").await.unwrap();
        assert_eq!(
            stub.synthesized.lock().unwrap().as_slice(),
            &["say this".to_string()]
        );
    }

    #[test]
    fn duration_estimate_scales_with_words() {
        assert!(estimate_duration("one two three four five") > estimate_duration("one"));
    }
}
