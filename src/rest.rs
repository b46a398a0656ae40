use crate::config::RestConfig;
use crate::error::SessionError;
use crate::pcm;
use crate::protocol::{
    Blob, Content, GenerationConfig, Part, PrebuiltVoiceConfig, SpeechConfig, VoiceConfig,
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// generateContent リクエスト
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

/// generateContent レスポンス（使用するフィールドのみ）
#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
}

impl GenerateContentResponse {
    fn first_content(&self) -> Result<&Content, SessionError> {
        self.candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .ok_or_else(|| SessionError::EmptyResponse("候補がありません".to_string()))
    }

    /// 最初の候補に含まれる音声データ（base64）
    fn audio_data(&self) -> Result<&str, SessionError> {
        self.first_content()?
            .parts
            .iter()
            .filter_map(|p| p.inline_data.as_ref())
            .map(|blob| blob.data.as_str())
            .find(|data| !data.is_empty())
            .ok_or_else(|| SessionError::EmptyResponse("音声データがありません".to_string()))
    }

    /// 最初の候補のテキストパートを連結
    fn text(&self) -> Result<String, SessionError> {
        Ok(self
            .first_content()?
            .parts
            .iter()
            .filter_map(|p| p.text.as_deref())
            .collect())
    }
}

/// 解析結果が空のときに返す文
pub const NO_ANALYSIS_TEXT: &str = "No analysis provided by the Cloud Pastor Engineer.";

/// ファイル拡張子からメディアのMIMEタイプを推定
pub fn mime_from_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("mp3") => "audio/mp3",
        Some("flac") => "audio/flac",
        Some("ogg") | Some("opus") => "audio/ogg",
        Some("m4a") | Some("aac") => "audio/aac",
        Some("webm") => "audio/webm",
        Some("mp4") | Some("m4v") => "video/mp4",
        Some("mov") => "video/quicktime",
        Some("mpeg") | Some("mpg") => "video/mpeg",
        Some("avi") => "video/x-msvideo",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("heic") => "image/heic",
        _ => "audio/wav",
    }
}

/// インラインのメディアと指示文からなるリクエスト
fn inline_media_request(data: &[u8], mime_type: &str, instruction: &str) -> GenerateContentRequest {
    GenerateContentRequest {
        contents: vec![Content {
            parts: vec![
                Part {
                    text: None,
                    inline_data: Some(Blob {
                        mime_type: mime_type.to_string(),
                        data: pcm::encode(data),
                    }),
                },
                Part {
                    text: Some(instruction.to_string()),
                    inline_data: None,
                },
            ],
            role: None,
        }],
        generation_config: None,
    }
}

async fn read_media(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .with_context(|| format!("メディアファイルの読み込みに失敗: {:?}", path))
}

/// 単発のREST呼び出し（読み上げ・文字起こし・メディア解析）クライアント
pub struct GeminiRestClient {
    config: RestConfig,
    api_key: String,
    client: reqwest::Client,
}

impl GeminiRestClient {
    pub fn new(config: &RestConfig, api_key: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .context("HTTPクライアント作成失敗")?;

        Ok(Self {
            config: config.clone(),
            api_key,
            client,
        })
    }

    async fn generate(
        &self,
        model: &str,
        request: &GenerateContentRequest,
    ) -> Result<GenerateContentResponse> {
        let url = format!(
            "{}/models/{}:generateContent",
            self.config.base_url.trim_end_matches('/'),
            model
        );
        log::debug!("generateContent: {}", url);

        let response = self
            .client
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .json(request)
            .send()
            .await
            .context("generateContent リクエスト失敗")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("generateContent エラー: {} - {}", status, error_text);
        }

        response
            .json::<GenerateContentResponse>()
            .await
            .context("generateContent レスポンスパース失敗")
    }

    /// テキストを読み上げ、24kHz 16bit PCM（リトルエンディアン）を返す
    pub async fn speak_text(&self, text: &str) -> Result<Vec<u8>> {
        let request = GenerateContentRequest {
            contents: vec![Content {
                parts: vec![Part {
                    text: Some(text.to_string()),
                    inline_data: None,
                }],
                role: None,
            }],
            generation_config: Some(GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: self.config.tts_voice.clone(),
                        },
                    },
                },
            }),
        };

        let response = self.generate(&self.config.tts_model, &request).await?;
        let audio = pcm::decode(response.audio_data()?).context("読み上げ音声のデコードに失敗")?;
        log::info!("読み上げ音声を受信: {} バイト", audio.len());
        Ok(audio)
    }

    /// 音声データを文字起こし
    pub async fn transcribe_audio(&self, audio: &[u8], mime_type: &str) -> Result<String> {
        let request =
            inline_media_request(audio, mime_type, &self.config.transcribe_instruction);
        let response = self
            .generate(&self.config.transcribe_model, &request)
            .await?;
        Ok(response.text()?)
    }

    /// ファイルを読み込んで文字起こし
    pub async fn transcribe_file(&self, path: &Path) -> Result<String> {
        let audio = read_media(path).await?;
        self.transcribe_audio(&audio, mime_from_path(path)).await
    }

    /// 動画・画像を解析し、祈りのポイントなどをまとめる
    ///
    /// `prompt` が `None` なら設定の既定指示を使う。応答が空なら定型文を返す。
    pub async fn analyze_media(
        &self,
        media: &[u8],
        mime_type: &str,
        prompt: Option<&str>,
    ) -> Result<String> {
        let prompt = prompt.unwrap_or(self.config.analyze_prompt.as_str());
        let request = inline_media_request(media, mime_type, prompt);
        let response = self.generate(&self.config.analyze_model, &request).await?;

        match response.text() {
            Ok(text) if !text.trim().is_empty() => Ok(text),
            Ok(_) | Err(SessionError::EmptyResponse(_)) => {
                log::warn!("解析結果が空でした");
                Ok(NO_ANALYSIS_TEXT.to_string())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn analyze_file(&self, path: &Path, prompt: Option<&str>) -> Result<String> {
        let media = read_media(path).await?;
        self.analyze_media(&media, mime_from_path(path), prompt).await
    }
}
