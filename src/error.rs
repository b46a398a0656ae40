use thiserror::Error;

/// ライブセッション境界で扱うエラー
///
/// いずれもホストプロセスをクラッシュさせず、セッション境界で
/// ログ出力またはユーザー通知に変換される。自動リトライは行わない。
#[derive(Debug, Error)]
pub enum SessionError {
    /// マイクが拒否された、または入力デバイスが存在しない
    #[error("マイクへのアクセスが必要です: {0}")]
    PermissionDenied(String),

    /// ライブチャンネルの確立に失敗
    #[error("ライブチャンネルの接続に失敗: {0}")]
    ChannelOpenFailed(String),

    /// 通話中のチャンネルエラー
    #[error("ライブチャンネルエラー: {0}")]
    ChannelRuntimeError(String),

    /// リモートが利用可能なペイロードを返さなかった
    #[error("応答が空です: {0}")]
    EmptyResponse(String),

    /// APIキーが設定されていない
    #[error("APIキーが見つかりません (環境変数 {0})")]
    MissingApiKey(String),

    /// 既に開始済みのセッションに start() が呼ばれた
    #[error("セッションは既に開始されています")]
    AlreadyStarted,
}

pub type SessionResult<T> = Result<T, SessionError>;
