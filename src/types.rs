use serde::{Deserialize, Serialize};

/// 16ビット整数型のオーディオサンプル
///
/// PCM形式の音声データを表現するための型エイリアス。
/// -32768 から 32767 の範囲の値を取る。
pub type SampleI16 = i16;

/// マイク入力のサンプルレート (16kHz)
pub const INPUT_SAMPLE_RATE: u32 = 16000;

/// モデル音声出力のサンプルレート (24kHz)
pub const OUTPUT_SAMPLE_RATE: u32 = 24000;

/// 1回のキャプチャコールバックで扱うサンプル数
pub const CAPTURE_BLOCK_SIZE: usize = 4096;

/// 送信音声フレームに付与するMIMEタグ
pub const INPUT_MIME_TYPE: &str = "audio/pcm;rate=16000";

/// オーディオフォーマット情報
///
/// 音声データのサンプリングレートとチャンネル数を保持する。
///
/// # Examples
///
/// ```
/// # use pastor_live::types::AudioFormat;
/// let format = AudioFormat::output();
/// assert_eq!(format.sample_rate, 24000);
/// assert_eq!(format.channels, 1);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AudioFormat {
    /// サンプリングレート (Hz)
    pub sample_rate: u32,

    /// チャンネル数
    ///
    /// ライブセッションでは入出力ともモノラル
    pub channels: u16,
}

impl AudioFormat {
    /// マイク入力フォーマット (16kHz モノラル)
    pub const fn input() -> Self {
        Self {
            sample_rate: INPUT_SAMPLE_RATE,
            channels: 1,
        }
    }

    /// 再生フォーマット (24kHz モノラル)
    pub const fn output() -> Self {
        Self {
            sample_rate: OUTPUT_SAMPLE_RATE,
            channels: 1,
        }
    }

    /// 指定フレーム数の再生時間（秒）
    pub fn duration_seconds(&self, frames: usize) -> f64 {
        frames as f64 / self.sample_rate as f64
    }
}

/// ライブセッションの状態
///
/// ```text
/// Idle ──start()──▶ Opening ──open──▶ Active ──stop()/close/error──▶ Closed
///   ▲                  │
///   └──mic/接続失敗────┘
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// 未開始
    Idle,
    /// 接続待ち
    Opening,
    /// 通話中
    Active,
    /// 終了済み（このセッションインスタンスでは終端状態）
    Closed,
}

impl SessionState {
    /// 新しい `start()` を受け付けられる状態かどうか
    pub fn can_start(self) -> bool {
        matches!(self, SessionState::Idle | SessionState::Closed)
    }
}

/// 発話者
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    /// マイク側（入力文字起こし）
    User,
    /// モデル側（出力文字起こし）
    Counselor,
}

/// 文字起こしエントリ
///
/// 部分文字起こしが届くたびに追加され、追加後は変更されない。
/// JSON形式でシリアライズして標準出力に出力される。
///
/// # JSON出力例
///
/// ```json
/// {
///   "speaker": "counselor",
///   "text": "Peace be with you.",
///   "timestamp": "2026-01-02T14:30:15+00:00"
/// }
/// ```
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TranscriptEntry {
    pub speaker: Speaker,
    pub text: String,
    /// ISO 8601形式のタイムスタンプ
    pub timestamp: String,
}

impl TranscriptEntry {
    /// 現在時刻付きでエントリを作成
    ///
    /// # Examples
    ///
    /// ```
    /// # use pastor_live::types::{Speaker, TranscriptEntry};
    /// let entry = TranscriptEntry::new(Speaker::User, "hello".to_string());
    /// assert_eq!(entry.speaker, Speaker::User);
    /// assert!(!entry.timestamp.is_empty());
    /// ```
    pub fn new(speaker: Speaker, text: String) -> Self {
        Self {
            speaker,
            text,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}
