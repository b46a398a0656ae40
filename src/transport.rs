use crate::config::{read_api_key, LiveConfig};
use crate::error::{SessionError, SessionResult};
use crate::protocol::{ClientMessage, ServerMessage};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

/// ライブチャンネルからセッションへ届くイベント
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// セットアップ完了（チャンネルオープン）
    Open,
    Message(ServerMessage),
    Error(String),
    Closed(Option<String>),
}

/// (送信チャンネル, イベント受信チャンネル)
pub type LiveChannel = (mpsc::Sender<ClientMessage>, mpsc::Receiver<ChannelEvent>);

/// 双方向ストリーミング接続の共通トレイト
#[async_trait]
pub trait LiveTransport: Send {
    /// 接続してセットアップメッセージを送信
    ///
    /// # Returns
    /// - 送信チャンネル: クライアントメッセージ。ドロップすると接続を閉じる
    /// - 受信チャンネル: `Open` に続いてサーバーメッセージ、最後に `Closed` または `Error`
    async fn connect(&mut self, setup: ClientMessage) -> SessionResult<LiveChannel>;
}

/// Gemini Live WebSocketクライアント
pub struct GeminiLiveTransport {
    endpoint: String,
    api_key_env: String,
    api_key: Option<String>,
    queue: usize,
}

impl GeminiLiveTransport {
    /// APIキーは接続時に環境変数から読み取る
    pub fn new(config: &LiveConfig) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            api_key_env: config.api_key_env.clone(),
            api_key: None,
            queue: config.capture_queue.max(1),
        }
    }

    pub fn with_api_key(endpoint: &str, api_key: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            api_key_env: String::new(),
            api_key: Some(api_key.to_string()),
            queue: 64,
        }
    }

    fn url(&self, key: &str) -> String {
        let sep = if self.endpoint.contains('?') { '&' } else { '?' };
        format!("{}{}key={}", self.endpoint, sep, key)
    }
}

/// サーバーからのJSONをイベントに変換して転送
///
/// 戻り値が `false` の場合、受信側が閉じている。
async fn forward_server_json(text: &str, event_tx: &mpsc::Sender<ChannelEvent>) -> bool {
    let msg = match ServerMessage::from_json(text) {
        Ok(msg) => msg,
        Err(e) => {
            log::warn!("サーバーメッセージのパースに失敗: {}", e);
            return true;
        }
    };

    if msg.setup_complete.is_some() && event_tx.send(ChannelEvent::Open).await.is_err() {
        return false;
    }
    if msg.go_away.is_some() {
        log::warn!("サーバーから切断予告を受信しました");
    }
    if msg.server_content.is_some() {
        return event_tx.send(ChannelEvent::Message(msg)).await.is_ok();
    }
    true
}

#[async_trait]
impl LiveTransport for GeminiLiveTransport {
    async fn connect(&mut self, setup: ClientMessage) -> SessionResult<LiveChannel> {
        let key = match &self.api_key {
            Some(key) => key.clone(),
            None => read_api_key(&self.api_key_env)?,
        };

        log::info!("ライブチャンネルに接続中: {}", self.endpoint);
        let (ws_stream, _) = tokio_tungstenite::connect_async(self.url(&key))
            .await
            .map_err(|e| SessionError::ChannelOpenFailed(e.to_string()))?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let setup_json = setup
            .to_json()
            .map_err(|e| SessionError::ChannelOpenFailed(e.to_string()))?;
        ws_sender
            .send(Message::Text(setup_json))
            .await
            .map_err(|e| SessionError::ChannelOpenFailed(e.to_string()))?;

        let (out_tx, mut out_rx) = mpsc::channel::<ClientMessage>(self.queue);
        let (event_tx, event_rx) = mpsc::channel::<ChannelEvent>(256);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    outgoing = out_rx.recv() => match outgoing {
                        Some(msg) => {
                            let json = match msg.to_json() {
                                Ok(json) => json,
                                Err(e) => {
                                    log::error!("送信メッセージのシリアライズに失敗: {}", e);
                                    continue;
                                }
                            };
                            if let Err(e) = ws_sender.send(Message::Text(json)).await {
                                let _ = event_tx.send(ChannelEvent::Error(e.to_string())).await;
                                break;
                            }
                        }
                        None => {
                            // セッション側が送信チャンネルを破棄した
                            let _ = ws_sender.send(Message::Close(None)).await;
                            log::debug!("ライブチャンネルを閉じました");
                            break;
                        }
                    },
                    incoming = ws_receiver.next() => match incoming {
                        Some(Ok(Message::Text(text))) => {
                            if !forward_server_json(&text, &event_tx).await {
                                break;
                            }
                        }
                        Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                            Ok(text) => {
                                if !forward_server_json(&text, &event_tx).await {
                                    break;
                                }
                            }
                            Err(e) => log::warn!("バイナリフレームがUTF-8ではありません: {}", e),
                        },
                        Some(Ok(Message::Close(frame))) => {
                            let reason = frame.map(|f| f.reason.to_string());
                            let _ = event_tx.send(ChannelEvent::Closed(reason)).await;
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            let _ = event_tx.send(ChannelEvent::Error(e.to_string())).await;
                            break;
                        }
                        None => {
                            let _ = event_tx.send(ChannelEvent::Closed(None)).await;
                            break;
                        }
                    },
                }
            }
        });

        Ok((out_tx, event_rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LiveConfig;
    use tokio::net::TcpListener;

    #[test]
    fn test_url_appends_key() {
        let transport = GeminiLiveTransport::with_api_key("wss://example.com/live", "k");
        assert_eq!(transport.url("k"), "wss://example.com/live?key=k");

        let transport = GeminiLiveTransport::with_api_key("wss://example.com/live?alt=1", "k");
        assert_eq!(transport.url("k"), "wss://example.com/live?alt=1&key=k");
    }

    #[tokio::test]
    async fn test_connect_fails_without_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut transport =
            GeminiLiveTransport::with_api_key(&format!("ws://{}/live", addr), "test");
        let result = transport
            .connect(ClientMessage::setup(&LiveConfig::default()))
            .await;
        assert!(matches!(result, Err(SessionError::ChannelOpenFailed(_))));
    }

    #[tokio::test]
    async fn test_round_trip_with_local_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

            // 最初のメッセージはsetup
            let setup = match ws.next().await {
                Some(Ok(Message::Text(text))) => text,
                other => panic!("unexpected first message: {:?}", other),
            };
            let setup: serde_json::Value = serde_json::from_str(&setup).unwrap();
            assert_eq!(
                setup["setup"]["generationConfig"]["responseModalities"][0],
                "AUDIO"
            );

            ws.send(Message::Binary(br#"{"setupComplete":{}}"#.to_vec()))
                .await
                .unwrap();
            ws.send(Message::Text(
                r#"{"serverContent":{"outputTranscription":{"text":"grace"}}}"#.to_string(),
            ))
            .await
            .unwrap();

            // クライアントからの音声フレーム
            let frame = match ws.next().await {
                Some(Ok(Message::Text(text))) => text,
                other => panic!("unexpected frame: {:?}", other),
            };
            let frame: serde_json::Value = serde_json::from_str(&frame).unwrap();
            assert_eq!(
                frame["realtimeInput"]["mediaChunks"][0]["mimeType"],
                "audio/pcm;rate=16000"
            );

            ws.close(None).await.unwrap();
        });

        let mut transport =
            GeminiLiveTransport::with_api_key(&format!("ws://{}/live", addr), "test");
        let (tx, mut rx) = transport
            .connect(ClientMessage::setup(&LiveConfig::default()))
            .await
            .unwrap();

        assert!(matches!(rx.recv().await, Some(ChannelEvent::Open)));
        match rx.recv().await {
            Some(ChannelEvent::Message(msg)) => {
                let content = msg.server_content.unwrap();
                assert_eq!(content.output_transcription.unwrap().text, "grace");
            }
            other => panic!("unexpected event: {:?}", other),
        }

        tx.send(ClientMessage::audio_frame("AAAA".to_string()))
            .await
            .unwrap();

        assert!(matches!(rx.recv().await, Some(ChannelEvent::Closed(_))));
        server.await.unwrap();
    }
}
