use crate::error::{SessionError, SessionResult};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub live: LiveConfig,
    #[serde(default)]
    pub rest: RestConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

/// オーディオ入出力設定
///
/// サンプルレートはライブAPIの契約で固定（入力16kHz / 出力24kHz）のため
/// ここでは設定できない。
///
/// # デフォルト値
///
/// - `input_device`: "default" (システムのデフォルト入力デバイス)
/// - `output_device`: "default" (システムのデフォルト出力デバイス)
/// - `block_size`: 4096 サンプル (16kHzで256ms)
/// - `exclude_devices`: 仮想デバイス等を除外する正規表現
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AudioConfig {
    #[serde(default = "default_device")]
    pub input_device: String,
    #[serde(default = "default_device")]
    pub output_device: String,
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    #[serde(default = "default_exclude_devices")]
    pub exclude_devices: String,
}

/// ライブセッション設定
///
/// # デフォルト値
///
/// - `endpoint`: Gemini Live BidiGenerateContent のWebSocket URL
/// - `model`: "models/gemini-2.5-flash-native-audio-preview-12-2025"
/// - `voice`: "Puck"
/// - `api_key_env`: "API_KEY"
/// - `capture_queue`: 64 ブロック
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LiveConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_live_model")]
    pub model: String,
    #[serde(default = "default_live_voice")]
    pub voice: String,
    #[serde(default = "default_system_instruction")]
    pub system_instruction: String,
    /// APIキーを読み取る環境変数名
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// キャプチャスレッドからセッションへのキュー長（ブロック数）
    #[serde(default = "default_capture_queue")]
    pub capture_queue: usize,
}

/// 単発REST呼び出し（読み上げ・文字起こし）の設定
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RestConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_tts_model")]
    pub tts_model: String,
    #[serde(default = "default_tts_voice")]
    pub tts_voice: String,
    #[serde(default = "default_transcribe_model")]
    pub transcribe_model: String,
    #[serde(default = "default_transcribe_instruction")]
    pub transcribe_instruction: String,
    /// 動画・画像解析に使うモデル
    #[serde(default = "default_analyze_model")]
    pub analyze_model: String,
    /// `--prompt` 未指定時の解析指示
    #[serde(default = "default_analyze_prompt")]
    pub analyze_prompt: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

/// 出力設定
///
/// # デフォルト値
///
/// - `log_level`: "info"
/// - `recordings_dir`: "./recordings"
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_recordings_dir")]
    pub recordings_dir: String,
}

// Default functions
fn default_device() -> String {
    "default".to_string()
}

fn default_block_size() -> usize {
    crate::types::CAPTURE_BLOCK_SIZE
}

fn default_exclude_devices() -> String {
    "Background|Microsoft Teams|ZoomAudioDevice".to_string()
}

fn default_endpoint() -> String {
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_string()
}

fn default_live_model() -> String {
    "models/gemini-2.5-flash-native-audio-preview-12-2025".to_string()
}

fn default_live_voice() -> String {
    "Puck".to_string()
}

fn default_system_instruction() -> String {
    "You are a warm, empathetic spiritual counselor. Provide biblically-based, uplifting deliverance advice.".to_string()
}

fn default_api_key_env() -> String {
    "API_KEY".to_string()
}

fn default_capture_queue() -> usize {
    64
}

fn default_base_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}

fn default_tts_model() -> String {
    "gemini-2.5-flash-preview-tts".to_string()
}

fn default_tts_voice() -> String {
    "Kore".to_string()
}

fn default_transcribe_model() -> String {
    "gemini-3-flash-preview".to_string()
}

fn default_transcribe_instruction() -> String {
    "Transcribe this spiritual content precisely, focusing on the biblical scriptures mentioned."
        .to_string()
}

fn default_analyze_model() -> String {
    "gemini-3-flash-preview".to_string()
}

fn default_analyze_prompt() -> String {
    "Analyze this spiritual content. Summarize key prayer points and spiritual insights."
        .to_string()
}

fn default_timeout_seconds() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_recordings_dir() -> String {
    "./recordings".to_string()
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_device: default_device(),
            output_device: default_device(),
            block_size: default_block_size(),
            exclude_devices: default_exclude_devices(),
        }
    }
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            model: default_live_model(),
            voice: default_live_voice(),
            system_instruction: default_system_instruction(),
            api_key_env: default_api_key_env(),
            capture_queue: default_capture_queue(),
        }
    }
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            tts_model: default_tts_model(),
            tts_voice: default_tts_voice(),
            transcribe_model: default_transcribe_model(),
            transcribe_instruction: default_transcribe_instruction(),
            analyze_model: default_analyze_model(),
            analyze_prompt: default_analyze_prompt(),
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            recordings_dir: default_recordings_dir(),
        }
    }
}

impl LiveConfig {
    /// 環境変数からAPIキーを取得（前後の空白は除去）
    pub fn api_key(&self) -> SessionResult<String> {
        read_api_key(&self.api_key_env)
    }
}

/// 指定した環境変数からAPIキーを読み取る
pub fn read_api_key(var: &str) -> SessionResult<String> {
    let key = std::env::var(var).unwrap_or_default();
    let key = key.trim();
    if key.is_empty() {
        return Err(SessionError::MissingApiKey(var.to_string()));
    }
    Ok(key.to_string())
}

impl Config {
    /// 設定ファイルから読み込み
    ///
    /// TOML形式の設定ファイルをパースしてConfig構造体を生成する。
    ///
    /// # Errors
    ///
    /// ファイルの読み込みまたはパースに失敗した場合にエラーを返す。
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use pastor_live::config::Config;
    /// let config = Config::from_file("config.toml").unwrap();
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("設定ファイルの読み込みに失敗: {:?}", path.as_ref()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| "設定ファイルのパースに失敗")?;
        Ok(config)
    }

    /// デフォルト設定をファイルに書き出し
    ///
    /// 既存のファイルは上書きされる。
    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<()> {
        let config = Config::default();
        let content =
            toml::to_string_pretty(&config).with_context(|| "設定のシリアライズに失敗")?;
        fs::write(path.as_ref(), content)
            .with_context(|| format!("設定ファイルの書き込みに失敗: {:?}", path.as_ref()))?;
        Ok(())
    }

    /// 設定ファイルがあれば読み込み、なければデフォルトを使用
    ///
    /// # Errors
    ///
    /// ファイルが存在するがパースに失敗した場合にエラーを返す。
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::from_file(path)
        } else {
            log::warn!(
                "設定ファイルが見つかりません。デフォルト設定を使用します: {:?}",
                path.as_ref()
            );
            Ok(Config::default())
        }
    }
}
