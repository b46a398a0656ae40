//! pastor-live - ライブ音声カウンセリングセッション
//!
//! マイク音声をリアルタイムで生成モデル (Gemini Live) に送り、
//! ストリーミングで返ってくる音声を隙間なく再生するクレート。
//! 入出力の文字起こしを発話者付きのトランスクリプトとして蓄積する。
//!
//! # 主な機能
//!
//! - **マイク入力**: 16kHz モノラル、4096サンプル単位で送信
//! - **再生スケジューリング**: 24kHz の受信チャンクを出力クロック上に連続配置
//! - **割り込み**: サーバーの割り込み通知で再生中の音声を即時停止
//! - **トランスクリプト**: `user` / `counselor` の発話を追記のみで記録
//! - **単発API**: テキスト読み上げと音声ファイルの文字起こし
//!
//! # アーキテクチャ
//!
//! ```text
//! [Mic] → [AudioInput] → 4096ブロック → [LiveSession] → pcm → [LiveTransport] ⇄ Gemini Live
//!                                            │                       │
//!                                            │  ◀── ServerMessage ───┘
//!                                            ├── 音声 → [PlaybackScheduler] → [AudioOutput] → [Speaker]
//!                                            ├── 文字起こし → [Transcript]
//!                                            └── 割り込み → 全ユニット停止, カーソル=0
//! ```
//!
//! # 使用例
//!
//! ```no_run
//! use pastor_live::config::Config;
//!
//! // 設定ファイルを読み込み
//! let config = Config::load_or_default("config.toml").unwrap();
//!
//! // またはデフォルト設定を生成
//! Config::write_default("config.toml").unwrap();
//! ```

pub mod audio_input;
pub mod audio_output;
pub mod config;
pub mod error;
pub mod notify;
pub mod pcm;
pub mod protocol;
pub mod recorder;
pub mod rest;
pub mod scheduler;
pub mod session;
pub mod transport;
pub mod types;
