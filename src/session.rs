//! ライブ音声セッションコントローラ
//!
//! 1つの音声セッションの開始から終了までを管理する:
//! マイクキャプチャ、送受信のエンコード/デコード、再生スケジューリング、
//! 割り込み処理、終了時のリソース解放。
//!
//! コールバック群ではなく明示的な状態遷移として実装している。
//!
//! ```text
//! Idle ──start()──▶ Opening ──ChannelEvent::Open──▶ Active
//!                     │                               │
//!                     └─ マイク/接続失敗 → Idle        └─ stop()/Closed/Error → Closed
//! ```

use crate::audio_input::CaptureDevice;
use crate::config::LiveConfig;
use crate::error::{SessionError, SessionResult};
use crate::notify::Notifier;
use crate::pcm;
use crate::protocol::{ClientMessage, ServerEvent, ServerMessage};
use crate::scheduler::{PlaybackScheduler, PlaybackSink, UnitId};
use crate::transport::{ChannelEvent, LiveTransport};
use crate::types::{AudioFormat, SessionState, Speaker, TranscriptEntry};
use tokio::sync::mpsc;

/// セッション外部からの操作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// 開始/停止の切り替え
    Toggle,
    /// 終了
    Quit,
}

/// `start_or_cancel` の結果
#[derive(Debug)]
pub enum StartOutcome {
    Started,
    /// 開始失敗（通知済み、状態は Idle）
    Failed(SessionError),
    /// 接続待ちの間に外部操作を受け取り中止した（状態は Closed）
    Cancelled(Control),
}

/// `run` のループで待ち受けるイベント
enum Wake {
    Control(Option<Control>),
    Channel(Option<ChannelEvent>),
    Capture(Option<Vec<f32>>),
    Ended(Option<UnitId>),
}

async fn recv_from<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn recv_from_unbounded<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

pub struct LiveSession {
    config: LiveConfig,
    state: SessionState,
    transport: Box<dyn LiveTransport>,
    capture: Box<dyn CaptureDevice>,
    playback: Box<dyn PlaybackSink>,
    notifier: Box<dyn Notifier>,
    scheduler: PlaybackScheduler,
    transcript: Vec<TranscriptEntry>,
    transcript_tx: Option<mpsc::UnboundedSender<TranscriptEntry>>,
    outbound: Option<mpsc::Sender<ClientMessage>>,
    inbound: Option<mpsc::Receiver<ChannelEvent>>,
    capture_rx: Option<mpsc::Receiver<Vec<f32>>>,
    ended_rx: Option<mpsc::UnboundedReceiver<UnitId>>,
}

impl LiveSession {
    pub fn new(
        config: LiveConfig,
        transport: Box<dyn LiveTransport>,
        capture: Box<dyn CaptureDevice>,
        playback: Box<dyn PlaybackSink>,
        notifier: Box<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            state: SessionState::Idle,
            transport,
            capture,
            playback,
            notifier,
            scheduler: PlaybackScheduler::new(AudioFormat::output()),
            transcript: Vec::new(),
            transcript_tx: None,
            outbound: None,
            inbound: None,
            capture_rx: None,
            ended_rx: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn transcript(&self) -> &[TranscriptEntry] {
        &self.transcript
    }

    pub fn scheduler(&self) -> &PlaybackScheduler {
        &self.scheduler
    }

    /// 追加された文字起こしエントリを受け取るチャンネルを登録
    pub fn subscribe_transcript(&mut self) -> mpsc::UnboundedReceiver<TranscriptEntry> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.transcript_tx = Some(tx);
        rx
    }

    /// セッションを開始
    ///
    /// マイク確保 → 再生デバイス開始 → チャンネル接続 → オープン待ち の順に進む。
    /// どこで失敗しても状態は `Idle` に戻り、通知は1回だけ行う。
    pub async fn start(&mut self) -> SessionResult<()> {
        if !self.state.can_start() {
            return Err(SessionError::AlreadyStarted);
        }

        // 新しいセッションとして状態を初期化
        self.transcript.clear();
        self.scheduler = PlaybackScheduler::new(AudioFormat::output());
        self.state = SessionState::Opening;
        log::info!("ライブセッションを開始します");

        if let Err(e) = self.capture.acquire() {
            return Err(self.abort_start(e));
        }

        let (ended_tx, ended_rx) = mpsc::unbounded_channel();
        if let Err(e) = self.playback.start(ended_tx) {
            self.capture.stop();
            return Err(self.abort_start(SessionError::ChannelOpenFailed(format!(
                "再生デバイスを開けません: {:#}",
                e
            ))));
        }

        let (outbound, mut inbound) = match self
            .transport
            .connect(ClientMessage::setup(&self.config))
            .await
        {
            Ok(channel) => channel,
            Err(e) => {
                self.release_devices();
                return Err(self.abort_start(e));
            }
        };

        // チャンネルオープンを待つ
        loop {
            match inbound.recv().await {
                Some(ChannelEvent::Open) => break,
                Some(ChannelEvent::Message(_)) => {
                    log::debug!("オープン前のサーバーメッセージを無視");
                }
                Some(ChannelEvent::Error(e)) => {
                    self.release_devices();
                    return Err(self.abort_start(SessionError::ChannelOpenFailed(e)));
                }
                Some(ChannelEvent::Closed(reason)) => {
                    self.release_devices();
                    return Err(self.abort_start(SessionError::ChannelOpenFailed(
                        reason.unwrap_or_else(|| "オープン前に切断されました".to_string()),
                    )));
                }
                None => {
                    self.release_devices();
                    return Err(self.abort_start(SessionError::ChannelOpenFailed(
                        "オープン前に切断されました".to_string(),
                    )));
                }
            }
        }

        self.outbound = Some(outbound);
        self.inbound = Some(inbound);
        self.ended_rx = Some(ended_rx);
        self.on_open()
    }

    /// `start` を実行し、接続待ちの間に外部操作が届いたら中止する
    ///
    /// 中止時は開始途中のデバイスとチャンネルを `stop` で解放する。
    pub async fn start_or_cancel(
        &mut self,
        control: &mut mpsc::UnboundedReceiver<Control>,
    ) -> StartOutcome {
        let cancelled = tokio::select! {
            result = self.start() => {
                return match result {
                    Ok(()) => StartOutcome::Started,
                    Err(e) => StartOutcome::Failed(e),
                };
            }
            c = control.recv() => c.unwrap_or(Control::Quit),
        };

        log::info!("接続待ちを中止します: {:?}", cancelled);
        self.stop();
        StartOutcome::Cancelled(cancelled)
    }

    /// チャンネルオープン: Active に遷移してキャプチャを開始
    fn on_open(&mut self) -> SessionResult<()> {
        let (capture_tx, capture_rx) = mpsc::channel(self.config.capture_queue.max(1));
        if let Err(e) = self.capture.start(capture_tx) {
            self.teardown();
            return Err(self.abort_start(e));
        }
        self.capture_rx = Some(capture_rx);
        self.state = SessionState::Active;
        log::info!("ライブセッションがアクティブになりました");
        Ok(())
    }

    fn abort_start(&mut self, error: SessionError) -> SessionError {
        log::error!("ライブセッションの開始に失敗: {}", error);
        self.state = SessionState::Idle;
        self.notifier.notify(&error.to_string());
        error
    }

    fn release_devices(&mut self) {
        self.capture.stop();
        self.playback.shutdown();
    }

    /// セッションを停止
    ///
    /// どの状態から呼んでも失敗しない。Idle/Closed では何もしない。
    pub fn stop(&mut self) {
        match self.state {
            SessionState::Idle | SessionState::Closed => {
                log::debug!("停止要求: セッションは開始されていません");
            }
            SessionState::Opening | SessionState::Active => {
                log::info!("ライブセッションを停止します");
                self.teardown();
            }
        }
    }

    /// 再生を即時停止し、キャプチャとチャンネルを閉じて Closed に遷移
    fn teardown(&mut self) {
        self.capture.stop();
        self.flush_playback();
        self.playback.shutdown();

        // 送信チャンネルを破棄すると接続が閉じられる
        self.outbound = None;
        self.inbound = None;
        self.capture_rx = None;
        self.ended_rx = None;
        self.state = SessionState::Closed;
    }

    fn flush_playback(&mut self) {
        for id in self.scheduler.interrupt() {
            self.playback.stop(id);
        }
    }

    /// Active の間イベントを処理する
    ///
    /// 外部操作を受け取ったらそれを返す。チャンネルが閉じた場合は `None`。
    pub async fn run(&mut self, control: &mut mpsc::UnboundedReceiver<Control>) -> Option<Control> {
        while self.state == SessionState::Active {
            let wake = tokio::select! {
                c = control.recv() => Wake::Control(c),
                ev = recv_from(&mut self.inbound) => Wake::Channel(ev),
                block = recv_from(&mut self.capture_rx) => Wake::Capture(block),
                id = recv_from_unbounded(&mut self.ended_rx) => Wake::Ended(id),
            };

            match wake {
                Wake::Control(c) => return Some(c.unwrap_or(Control::Quit)),
                Wake::Channel(Some(event)) => self.handle_channel_event(event),
                Wake::Channel(None) => self.on_close(None),
                Wake::Capture(Some(block)) => self.handle_capture_block(&block),
                Wake::Capture(None) => {
                    log::warn!("キャプチャストリームが終了しました");
                    self.capture_rx = None;
                }
                Wake::Ended(Some(id)) => {
                    self.scheduler.complete(id);
                }
                Wake::Ended(None) => {
                    self.ended_rx = None;
                }
            }
        }
        None
    }

    fn handle_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Open => log::debug!("重複したオープン通知を無視"),
            ChannelEvent::Message(msg) => self.handle_server_message(&msg),
            ChannelEvent::Error(e) => {
                // 通話中のエラーはログのみ（ホストは落とさない）
                log::error!("{}", SessionError::ChannelRuntimeError(e));
                self.on_close(None);
            }
            ChannelEvent::Closed(reason) => self.on_close(reason),
        }
    }

    fn on_close(&mut self, reason: Option<String>) {
        if self.state != SessionState::Active {
            return;
        }
        match reason.filter(|r| !r.is_empty()) {
            Some(reason) => log::info!("ライブチャンネルが閉じられました: {}", reason),
            None => log::info!("ライブチャンネルが閉じられました"),
        }
        self.teardown();
    }

    /// キャプチャブロックを送信（送りっぱなし）
    pub fn handle_capture_block(&mut self, block: &[f32]) {
        let Some(outbound) = &self.outbound else {
            return;
        };
        let frame = ClientMessage::audio_frame(pcm::encode_capture_block(block));
        match outbound.try_send(frame) {
            Ok(_) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!("音声フレーム破棄: 送信キュー満杯");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                log::debug!("音声フレーム破棄: チャンネル終了済み");
            }
        }
    }

    /// サーバーメッセージを到着順に処理
    pub fn handle_server_message(&mut self, msg: &ServerMessage) {
        for event in msg.events() {
            match event {
                ServerEvent::Audio(data) => self.schedule_audio(&data),
                ServerEvent::InputTranscript(text) => self.append_transcript(Speaker::User, text),
                ServerEvent::OutputTranscript(text) => {
                    self.append_transcript(Speaker::Counselor, text)
                }
                ServerEvent::Interrupted => {
                    log::debug!(
                        "割り込み: {} 件の再生を停止",
                        self.scheduler.active_len()
                    );
                    self.flush_playback();
                }
                ServerEvent::TurnComplete => log::debug!("ターン完了"),
                ServerEvent::SetupComplete => {}
            }
        }
    }

    fn schedule_audio(&mut self, data: &str) {
        let samples = match pcm::decode_playback_chunk(data) {
            Ok(samples) if !samples.is_empty() => samples,
            Ok(_) => return,
            Err(e) => {
                log::warn!("受信音声のデコードに失敗: {}", e);
                return;
            }
        };

        let now = self.playback.now();
        let unit = self.scheduler.schedule(samples.len(), now);
        log::debug!(
            "再生スケジュール: unit={} start={:.3}s duration={:.3}s",
            unit.id,
            unit.start,
            unit.duration
        );

        match self.playback.play(unit.id, samples, unit.start) {
            // 出力クロックが先に進んでいた場合、実際の開始時刻に合わせる
            Ok(actual_start) => self.scheduler.extend_cursor(actual_start + unit.duration),
            Err(e) => {
                log::error!("再生に失敗: {:#}", e);
                self.scheduler.complete(unit.id);
            }
        }
    }

    fn append_transcript(&mut self, speaker: Speaker, text: String) {
        let entry = TranscriptEntry::new(speaker, text);
        if let Some(tx) = &self.transcript_tx {
            let _ = tx.send(entry.clone());
        }
        self.transcript.push(entry);
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Blob, Content, Part, ServerContent, Transcription};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    const EPS: f64 = 1e-9;

    /// テスト側から偽デバイスの様子を覗くための共有状態
    #[derive(Clone, Default)]
    struct Rig {
        notifications: Arc<Mutex<Vec<String>>>,
        connects: Arc<Mutex<usize>>,
        capture_started: Arc<Mutex<bool>>,
        capture_stops: Arc<Mutex<usize>>,
        playback_shutdowns: Arc<Mutex<usize>>,
        played: Arc<Mutex<Vec<(UnitId, f64, usize)>>>,
        stopped_units: Arc<Mutex<Vec<UnitId>>>,
        now: Arc<Mutex<f64>>,
        /// `play` 呼び出し時点の出力クロック（`now` より先に進んでいる場合がある）
        clock_at_play: Arc<Mutex<f64>>,
        server_tx: Arc<Mutex<Option<mpsc::Sender<ChannelEvent>>>>,
        client_rx: Arc<Mutex<Option<mpsc::Receiver<ClientMessage>>>>,
    }

    /// 接続直後にサーバーが返すもの
    #[derive(Clone, Copy, Default)]
    enum Reply {
        #[default]
        Open,
        Refuse,
        /// ソケットは受け付けるが setupComplete を返さない
        Silent,
    }

    /// 偽デバイスに仕込む故障
    #[derive(Clone, Copy, Default)]
    struct Faults {
        deny_mic: bool,
        capture_start_fails: bool,
        playback_start_fails: bool,
        reply: Reply,
    }

    struct FakeTransport {
        rig: Rig,
        reply: Reply,
    }

    #[async_trait]
    impl LiveTransport for FakeTransport {
        async fn connect(&mut self, _setup: ClientMessage) -> SessionResult<crate::transport::LiveChannel> {
            *self.rig.connects.lock().unwrap() += 1;
            let (out_tx, out_rx) = mpsc::channel(16);
            let (ev_tx, ev_rx) = mpsc::channel(16);
            match self.reply {
                Reply::Open => ev_tx.try_send(ChannelEvent::Open).unwrap(),
                Reply::Refuse => ev_tx
                    .try_send(ChannelEvent::Error("refused".to_string()))
                    .unwrap(),
                Reply::Silent => {}
            }
            *self.rig.server_tx.lock().unwrap() = Some(ev_tx);
            *self.rig.client_rx.lock().unwrap() = Some(out_rx);
            Ok((out_tx, ev_rx))
        }
    }

    struct FakeCapture {
        rig: Rig,
        deny: bool,
        start_fails: bool,
        blocks: Option<mpsc::Sender<Vec<f32>>>,
    }

    impl CaptureDevice for FakeCapture {
        fn acquire(&mut self) -> SessionResult<()> {
            if self.deny {
                return Err(SessionError::PermissionDenied("denied".to_string()));
            }
            Ok(())
        }

        fn start(&mut self, blocks: mpsc::Sender<Vec<f32>>) -> SessionResult<()> {
            if self.start_fails {
                return Err(SessionError::PermissionDenied("stream build failed".to_string()));
            }
            *self.rig.capture_started.lock().unwrap() = true;
            self.blocks = Some(blocks);
            Ok(())
        }

        fn stop(&mut self) {
            *self.rig.capture_stops.lock().unwrap() += 1;
            self.blocks = None;
        }
    }

    struct FakePlayback {
        rig: Rig,
        start_fails: bool,
        ended_tx: Option<mpsc::UnboundedSender<UnitId>>,
    }

    impl PlaybackSink for FakePlayback {
        fn start(&mut self, ended_tx: mpsc::UnboundedSender<UnitId>) -> Result<()> {
            if self.start_fails {
                anyhow::bail!("no output device");
            }
            self.ended_tx = Some(ended_tx);
            Ok(())
        }

        fn now(&self) -> f64 {
            *self.rig.now.lock().unwrap()
        }

        fn play(&mut self, id: UnitId, samples: Vec<f32>, start_at: f64) -> Result<f64> {
            self.rig
                .played
                .lock()
                .unwrap()
                .push((id, start_at, samples.len()));
            Ok(start_at.max(*self.rig.clock_at_play.lock().unwrap()))
        }

        fn stop(&mut self, id: UnitId) {
            self.rig.stopped_units.lock().unwrap().push(id);
        }

        fn shutdown(&mut self) {
            *self.rig.playback_shutdowns.lock().unwrap() += 1;
            self.ended_tx = None;
        }
    }

    struct RecordingNotifier {
        rig: Rig,
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, message: &str) {
            self.rig
                .notifications
                .lock()
                .unwrap()
                .push(message.to_string());
        }
    }

    fn make_session(rig: &Rig, faults: Faults) -> LiveSession {
        LiveSession::new(
            LiveConfig::default(),
            Box::new(FakeTransport {
                rig: rig.clone(),
                reply: faults.reply,
            }),
            Box::new(FakeCapture {
                rig: rig.clone(),
                deny: faults.deny_mic,
                start_fails: faults.capture_start_fails,
                blocks: None,
            }),
            Box::new(FakePlayback {
                rig: rig.clone(),
                start_fails: faults.playback_start_fails,
                ended_tx: None,
            }),
            Box::new(RecordingNotifier {
                rig: rig.clone(),
            }),
        )
    }

    async fn active_session(rig: &Rig) -> LiveSession {
        let mut session = make_session(rig, Faults::default());
        session.start().await.unwrap();
        session
    }

    fn audio_message(chunks: &[usize]) -> ServerMessage {
        let parts = chunks
            .iter()
            .map(|&frames| Part {
                text: None,
                inline_data: Some(Blob {
                    mime_type: "audio/pcm;rate=24000".to_string(),
                    data: pcm::encode(&vec![0u8; frames * 2]),
                }),
            })
            .collect();
        ServerMessage {
            server_content: Some(ServerContent {
                model_turn: Some(Content { parts, role: None }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn interrupted_message() -> ServerMessage {
        ServerMessage {
            server_content: Some(ServerContent {
                interrupted: true,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_stop_while_idle_is_noop() {
        let rig = Rig::default();
        let mut session = make_session(&rig, Faults::default());

        session.stop();
        session.stop();

        assert_eq!(session.state(), SessionState::Idle);
        assert!(rig.notifications.lock().unwrap().is_empty());
        assert_eq!(*rig.capture_stops.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_start_with_microphone_denied() {
        let rig = Rig::default();
        let mut session = make_session(
            &rig,
            Faults {
                deny_mic: true,
                ..Default::default()
            },
        );

        let result = session.start().await;

        assert!(matches!(result, Err(SessionError::PermissionDenied(_))));
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(rig.notifications.lock().unwrap().len(), 1);
        assert_eq!(*rig.connects.lock().unwrap(), 0);
        assert!(!*rig.capture_started.lock().unwrap());
    }

    #[tokio::test]
    async fn test_channel_open_failure_returns_to_idle() {
        let rig = Rig::default();
        let mut session = make_session(
            &rig,
            Faults {
                reply: Reply::Refuse,
                ..Default::default()
            },
        );

        let result = session.start().await;

        assert!(matches!(result, Err(SessionError::ChannelOpenFailed(_))));
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(rig.notifications.lock().unwrap().len(), 1);
        assert!(!*rig.capture_started.lock().unwrap());
    }

    #[tokio::test]
    async fn test_playback_start_failure_returns_to_idle() {
        let rig = Rig::default();
        let mut session = make_session(
            &rig,
            Faults {
                playback_start_fails: true,
                ..Default::default()
            },
        );

        let result = session.start().await;

        match result {
            Err(SessionError::ChannelOpenFailed(msg)) => assert!(msg.contains("no output device")),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(rig.notifications.lock().unwrap().len(), 1);
        // マイクは解放され、接続は試みない
        assert_eq!(*rig.capture_stops.lock().unwrap(), 1);
        assert_eq!(*rig.connects.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_capture_start_failure_returns_to_idle() {
        let rig = Rig::default();
        let mut session = make_session(
            &rig,
            Faults {
                capture_start_fails: true,
                ..Default::default()
            },
        );

        let result = session.start().await;

        assert!(matches!(result, Err(SessionError::PermissionDenied(_))));
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(rig.notifications.lock().unwrap().len(), 1);
        assert!(!*rig.capture_started.lock().unwrap());
        // 再生デバイスとチャンネルは解放済み
        assert_eq!(*rig.playback_shutdowns.lock().unwrap(), 1);
        let mut client_rx = rig.client_rx.lock().unwrap().take().unwrap();
        assert!(client_rx.recv().await.is_none());

        // Idle からは再開できる
        assert!(matches!(session.start().await, Err(SessionError::PermissionDenied(_))));
        assert_eq!(rig.notifications.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_stop_while_opening_releases_devices() {
        let rig = Rig::default();
        let mut session = make_session(
            &rig,
            Faults {
                reply: Reply::Silent,
                ..Default::default()
            },
        );

        // オープン通知が来ないので start は終わらない
        let pending = tokio::time::timeout(Duration::from_millis(50), session.start()).await;
        assert!(pending.is_err());
        assert_eq!(session.state(), SessionState::Opening);

        session.stop();

        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(*rig.capture_stops.lock().unwrap(), 1);
        assert_eq!(*rig.playback_shutdowns.lock().unwrap(), 1);
        assert!(!*rig.capture_started.lock().unwrap());
        assert!(rig.notifications.lock().unwrap().is_empty());
        let mut client_rx = rig.client_rx.lock().unwrap().take().unwrap();
        assert!(client_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_quit_while_opening_cancels_start() {
        let rig = Rig::default();
        let mut session = make_session(
            &rig,
            Faults {
                reply: Reply::Silent,
                ..Default::default()
            },
        );
        let (control_tx, mut control_rx) = mpsc::unbounded_channel();

        let (outcome, _) = tokio::join!(session.start_or_cancel(&mut control_rx), async {
            // start がオープン待ちに入ってから終了操作を送る
            tokio::task::yield_now().await;
            control_tx.send(Control::Quit).unwrap();
        });

        assert!(matches!(outcome, StartOutcome::Cancelled(Control::Quit)));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(*rig.connects.lock().unwrap(), 1);
        assert_eq!(*rig.capture_stops.lock().unwrap(), 1);
        assert_eq!(*rig.playback_shutdowns.lock().unwrap(), 1);
        assert!(rig.notifications.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_start_or_cancel_reports_started() {
        let rig = Rig::default();
        let mut session = make_session(&rig, Faults::default());
        let (_control_tx, mut control_rx) = mpsc::unbounded_channel();

        let outcome = session.start_or_cancel(&mut control_rx).await;

        assert!(matches!(outcome, StartOutcome::Started));
        assert_eq!(session.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_start_reaches_active_and_starts_capture() {
        let rig = Rig::default();
        let session = active_session(&rig).await;

        assert_eq!(session.state(), SessionState::Active);
        assert!(*rig.capture_started.lock().unwrap());
        assert_eq!(*rig.connects.lock().unwrap(), 1);
        assert!(rig.notifications.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let rig = Rig::default();
        let mut session = active_session(&rig).await;

        let result = session.start().await;
        assert!(matches!(result, Err(SessionError::AlreadyStarted)));
        assert_eq!(session.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_inbound_audio_is_scheduled_back_to_back() {
        let rig = Rig::default();
        let mut session = active_session(&rig).await;
        *rig.now.lock().unwrap() = 2.0;

        session.handle_server_message(&audio_message(&[2400, 4800]));
        session.handle_server_message(&audio_message(&[1200]));

        let played = rig.played.lock().unwrap().clone();
        assert_eq!(played.len(), 3);
        assert!((played[0].1 - 2.0).abs() < EPS);
        assert!((played[1].1 - 2.1).abs() < EPS);
        assert!((played[2].1 - 2.3).abs() < EPS);
        assert_eq!(played[1].2, 4800);
        assert!((session.scheduler().cursor() - 2.35).abs() < EPS);
        assert_eq!(session.scheduler().active_len(), 3);
    }

    #[tokio::test]
    async fn test_late_playback_start_extends_cursor() {
        let rig = Rig::default();
        let mut session = active_session(&rig).await;
        *rig.now.lock().unwrap() = 1.0;
        // now() の後、play() までに出力クロックが進んだ
        *rig.clock_at_play.lock().unwrap() = 1.01;

        session.handle_server_message(&audio_message(&[2400]));
        assert!((session.scheduler().cursor() - 1.11).abs() < EPS);

        session.handle_server_message(&audio_message(&[2400]));
        let played = rig.played.lock().unwrap().clone();
        assert!((played[1].1 - 1.11).abs() < EPS);
        assert!((session.scheduler().cursor() - 1.21).abs() < EPS);
    }

    #[tokio::test]
    async fn test_interruption_flushes_playback() {
        let rig = Rig::default();
        let mut session = active_session(&rig).await;
        *rig.now.lock().unwrap() = 1.0;

        session.handle_server_message(&audio_message(&[4800, 4800, 4800]));
        session.handle_server_message(&interrupted_message());

        assert_eq!(rig.stopped_units.lock().unwrap().len(), 3);
        assert_eq!(session.scheduler().active_len(), 0);
        assert_eq!(session.scheduler().cursor(), 0.0);

        // 次のチャンクは現在時刻から再生される
        *rig.now.lock().unwrap() = 1.5;
        session.handle_server_message(&audio_message(&[240]));
        let played = rig.played.lock().unwrap().clone();
        assert!((played[3].1 - 1.5).abs() < EPS);
    }

    #[tokio::test]
    async fn test_invalid_audio_payload_is_ignored() {
        let rig = Rig::default();
        let mut session = active_session(&rig).await;

        let mut msg = audio_message(&[10]);
        if let Some(content) = msg.server_content.as_mut() {
            if let Some(turn) = content.model_turn.as_mut() {
                turn.parts[0].inline_data.as_mut().unwrap().data = "@@@".to_string();
            }
        }
        session.handle_server_message(&msg);

        assert!(rig.played.lock().unwrap().is_empty());
        assert_eq!(session.scheduler().active_len(), 0);
    }

    #[tokio::test]
    async fn test_transcripts_append_in_order() {
        let rig = Rig::default();
        let mut session = active_session(&rig).await;
        let mut rx = session.subscribe_transcript();

        let msg = ServerMessage {
            server_content: Some(ServerContent {
                input_transcription: Some(Transcription {
                    text: "I need prayer".to_string(),
                }),
                output_transcription: Some(Transcription {
                    text: "Fear not".to_string(),
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        session.handle_server_message(&msg);

        let transcript = session.transcript();
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript[0].speaker, Speaker::User);
        assert_eq!(transcript[0].text, "I need prayer");
        assert_eq!(transcript[1].speaker, Speaker::Counselor);
        assert_eq!(transcript[1].text, "Fear not");

        assert_eq!(rx.try_recv().unwrap().speaker, Speaker::User);
        assert_eq!(rx.try_recv().unwrap().speaker, Speaker::Counselor);
    }

    #[tokio::test]
    async fn test_capture_block_is_sent_as_media_frame() {
        let rig = Rig::default();
        let mut session = active_session(&rig).await;

        session.handle_capture_block(&[0.0; 4096]);

        let frame = rig
            .client_rx
            .lock()
            .unwrap()
            .as_mut()
            .unwrap()
            .try_recv()
            .unwrap();
        match frame {
            ClientMessage::RealtimeInput(input) => {
                let chunk = &input.media_chunks[0];
                assert_eq!(chunk.mime_type, "audio/pcm;rate=16000");
                let bytes = pcm::decode(&chunk.data).unwrap();
                assert_eq!(bytes.len(), 8192);
                assert!(bytes.iter().all(|&b| b == 0));
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stop_while_active_closes_and_clears_playback() {
        let rig = Rig::default();
        let mut session = active_session(&rig).await;
        session.handle_server_message(&audio_message(&[2400, 2400]));

        session.stop();

        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.scheduler().active_len(), 0);
        assert_eq!(rig.stopped_units.lock().unwrap().len(), 2);
        assert_eq!(*rig.capture_stops.lock().unwrap(), 1);

        // 送信チャンネルが破棄されている
        let mut client_rx = rig.client_rx.lock().unwrap().take().unwrap();
        assert!(client_rx.try_recv().is_err());
        assert!(client_rx.recv().await.is_none());

        // 2回目の停止は何もしない
        session.stop();
        assert_eq!(*rig.capture_stops.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_run_returns_when_remote_closes() {
        let rig = Rig::default();
        let mut session = active_session(&rig).await;
        let (_control_tx, mut control_rx) = mpsc::unbounded_channel();

        let server_tx = rig.server_tx.lock().unwrap().clone().unwrap();
        server_tx
            .send(ChannelEvent::Closed(Some("bye".to_string())))
            .await
            .unwrap();

        assert_eq!(session.run(&mut control_rx).await, None);
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_run_closes_on_runtime_error() {
        let rig = Rig::default();
        let mut session = active_session(&rig).await;
        let (_control_tx, mut control_rx) = mpsc::unbounded_channel();

        let server_tx = rig.server_tx.lock().unwrap().clone().unwrap();
        server_tx
            .send(ChannelEvent::Error("reset by peer".to_string()))
            .await
            .unwrap();

        assert_eq!(session.run(&mut control_rx).await, None);
        assert_eq!(session.state(), SessionState::Closed);
        // 通話中のエラーは通知しない
        assert!(rig.notifications.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_returns_control() {
        let rig = Rig::default();
        let mut session = active_session(&rig).await;
        let (control_tx, mut control_rx) = mpsc::unbounded_channel();

        control_tx.send(Control::Toggle).unwrap();

        assert_eq!(session.run(&mut control_rx).await, Some(Control::Toggle));
        assert_eq!(session.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_restart_after_close_starts_fresh_session() {
        let rig = Rig::default();
        let mut session = active_session(&rig).await;
        session.handle_server_message(&ServerMessage {
            server_content: Some(ServerContent {
                input_transcription: Some(Transcription {
                    text: "hello".to_string(),
                }),
                ..Default::default()
            }),
            ..Default::default()
        });
        session.handle_server_message(&audio_message(&[2400]));
        session.stop();
        assert_eq!(session.transcript().len(), 1);

        session.start().await.unwrap();

        assert_eq!(session.state(), SessionState::Active);
        assert!(session.transcript().is_empty());
        assert_eq!(session.scheduler().cursor(), 0.0);
        assert_eq!(*rig.connects.lock().unwrap(), 2);
    }
}
