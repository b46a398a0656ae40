use crate::types::AudioFormat;
use anyhow::Result;
use std::collections::BTreeSet;
use tokio::sync::mpsc;

/// 再生ユニットの識別子
pub type UnitId = u64;

/// スケジュール済みの再生ユニット
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScheduledUnit {
    pub id: UnitId,
    /// 出力クロック上の開始時刻（秒）
    pub start: f64,
    /// 再生時間（秒）
    pub duration: f64,
}

impl ScheduledUnit {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

/// 再生デバイスの抽象
///
/// 出力クロック (`now`) を提供し、指定時刻からのサンプル再生と
/// 即時停止を受け付ける。自然終了したユニットは `start` で渡された
/// チャンネルにIDを通知する。
pub trait PlaybackSink {
    /// 出力ストリームを開始
    fn start(&mut self, ended_tx: mpsc::UnboundedSender<UnitId>) -> Result<()>;

    /// 出力クロックの現在時刻（秒、単調増加）
    fn now(&self) -> f64;

    /// `start_at` 秒からサンプル列を再生し、実際の開始時刻を返す
    ///
    /// `start_at` が既に過ぎていれば次に出力されるフレームから先頭を欠かさず再生する。
    fn play(&mut self, id: UnitId, samples: Vec<f32>, start_at: f64) -> Result<f64>;

    /// 再生中・再生待ちのユニットを即時停止
    fn stop(&mut self, id: UnitId);

    /// 出力ストリームを停止
    fn shutdown(&mut self) {}
}

/// 受信音声チャンクの再生スケジューラ
///
/// 再生カーソル（次のチャンクを開始できる最も早い時刻）と、
/// 開始済みかつ未終了のユニット集合を保持する。
/// カーソルは割り込み時の0リセット以外で後退しない。
#[derive(Debug)]
pub struct PlaybackScheduler {
    format: AudioFormat,
    cursor: f64,
    active: BTreeSet<UnitId>,
    next_id: UnitId,
}

impl PlaybackScheduler {
    pub fn new(format: AudioFormat) -> Self {
        Self {
            format,
            cursor: 0.0,
            active: BTreeSet::new(),
            next_id: 0,
        }
    }

    /// `frames` サンプル分のチャンクをスケジュール
    ///
    /// 開始時刻は `max(cursor, now)`。前のチャンクの直後に隙間なく続け、
    /// カーソルが過去にある場合は現在時刻から再生する。
    pub fn schedule(&mut self, frames: usize, now: f64) -> ScheduledUnit {
        let id = self.next_id;
        self.next_id += 1;

        let start = self.cursor.max(now);
        let duration = self.format.duration_seconds(frames);
        self.cursor = start + duration;
        self.active.insert(id);

        ScheduledUnit {
            id,
            start,
            duration,
        }
    }

    /// 実際の再生終了時刻までカーソルを進める（後退はしない）
    pub fn extend_cursor(&mut self, end: f64) {
        self.cursor = self.cursor.max(end);
    }

    /// 自然終了したユニットを集合から外す
    pub fn complete(&mut self, id: UnitId) -> bool {
        self.active.remove(&id)
    }

    /// 割り込み: 全ユニットを集合から外し、カーソルを0に戻す
    ///
    /// 停止すべきユニットIDを返す。
    pub fn interrupt(&mut self) -> Vec<UnitId> {
        let ids: Vec<UnitId> = std::mem::take(&mut self.active).into_iter().collect();
        self.cursor = 0.0;
        ids
    }

    pub fn cursor(&self) -> f64 {
        self.cursor
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn is_active(&self, id: UnitId) -> bool {
        self.active.contains(&id)
    }
}
