use crate::config::AudioConfig;
use crate::error::{SessionError, SessionResult};
use crate::types::INPUT_SAMPLE_RATE;
use anyhow::{Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Sample, SizedSample};
use regex_lite::Regex;
use tokio::sync::mpsc;

/// マイク入力の抽象
///
/// `acquire` でデバイスを確保し（確保できなければ `PermissionDenied`）、
/// `start` 以降は固定長の浮動小数点ブロックを送信チャンネルに流す。
pub trait CaptureDevice {
    fn acquire(&mut self) -> SessionResult<()>;
    fn start(&mut self, blocks: mpsc::Sender<Vec<f32>>) -> SessionResult<()>;
    fn stop(&mut self);
}

/// 固定長ブロックへの再分割
///
/// デバイスのバッファサイズに関係なく、常に `block_size` サンプルずつ取り出す。
pub struct BlockAssembler {
    block_size: usize,
    pending: Vec<f32>,
}

impl BlockAssembler {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            pending: Vec::with_capacity(block_size * 2),
        }
    }

    /// サンプルを追加し、揃ったブロックを返す
    pub fn push(&mut self, samples: &[f32]) -> Vec<Vec<f32>> {
        self.pending.extend_from_slice(samples);
        let mut blocks = Vec::new();
        while self.block_size > 0 && self.pending.len() >= self.block_size {
            blocks.push(self.pending.drain(..self.block_size).collect());
        }
        blocks
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// オーディオデバイスからのモノラル音声入力 (16kHz)
pub struct AudioInput {
    device_id: String,
    exclude_pattern: String,
    block_size: usize,
    device: Option<cpal::Device>,
    stream: Option<cpal::Stream>,
}

impl AudioInput {
    /// 新しいAudioInputを作成（デバイスは `acquire` まで開かない）
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            device_id: config.input_device.clone(),
            exclude_pattern: config.exclude_devices.clone(),
            block_size: config.block_size,
            device: None,
            stream: None,
        }
    }

    /// ストリームを構築
    fn build_stream<T>(
        &self,
        device: &cpal::Device,
        blocks: mpsc::Sender<Vec<f32>>,
    ) -> Result<cpal::Stream>
    where
        T: SizedSample + Sample + Send + 'static,
        <T as Sample>::Float: Into<f32>,
    {
        let config = cpal::StreamConfig {
            channels: 1,
            sample_rate: cpal::SampleRate(INPUT_SAMPLE_RATE),
            buffer_size: cpal::BufferSize::Default,
        };
        let mut assembler = BlockAssembler::new(self.block_size);

        let data_callback = move |data: &[T], _info: &cpal::InputCallbackInfo| {
            let samples: Vec<f32> = data.iter().map(|s| s.to_float_sample().into()).collect();

            for block in assembler.push(&samples) {
                // 送りっぱなし: 満杯・クローズ時はそのフレームを捨てる
                match blocks.try_send(block) {
                    Ok(_) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        log::warn!("キャプチャブロック破棄: キュー満杯");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        log::debug!("キャプチャブロック破棄: セッション終了済み");
                    }
                }
            }
        };

        let error_callback = move |err| {
            log::error!("入力ストリームエラー: {}", err);
        };

        let stream = device
            .build_input_stream(&config, data_callback, error_callback, None)
            .context("入力ストリームの構築に失敗")?;

        Ok(stream)
    }

    fn find_device(&self) -> Result<cpal::Device> {
        let host = cpal::default_host();
        if self.device_id == "default" {
            host.default_input_device()
                .context("デフォルト入力デバイスが見つかりません")
        } else {
            Self::input_devices(&self.exclude_pattern)?
                .into_iter()
                .find(|d| d.name().ok().as_deref() == Some(self.device_id.as_str()))
                .with_context(|| format!("デバイスが見つかりません: {}", self.device_id))
        }
    }

    /// デバイス一覧を表示
    pub fn list_devices(exclude_pattern: &str) -> Result<()> {
        println!("利用可能な入力デバイス:");
        println!();

        for (idx, device) in Self::input_devices(exclude_pattern)?.into_iter().enumerate() {
            let name = device.name()?;
            println!("  [{}] {}", idx, name);

            device.supported_input_configs()?.for_each(|config_range| {
                println!(
                    "      フォーマット: {:?}, {}-{}Hz, {}ch",
                    config_range.sample_format(),
                    config_range.min_sample_rate().0,
                    config_range.max_sample_rate().0,
                    config_range.channels()
                );
            });
            println!();
        }

        Ok(())
    }

    /// 除外パターンに一致するデバイスを除いた入力デバイス一覧を取得
    fn input_devices(exclude_pattern: &str) -> Result<Vec<cpal::Device>> {
        let host = cpal::default_host();
        let excluded = if exclude_pattern.is_empty() {
            None
        } else {
            Some(Regex::new(exclude_pattern).context("除外デバイスの正規表現が不正です")?)
        };
        let devices = host
            .input_devices()?
            .filter(|device| match (&excluded, device.name()) {
                (Some(re), Ok(name)) => !re.is_match(&name),
                _ => true,
            })
            .collect();
        Ok(devices)
    }
}

impl CaptureDevice for AudioInput {
    fn acquire(&mut self) -> SessionResult<()> {
        let device = self
            .find_device()
            .map_err(|e| SessionError::PermissionDenied(e.to_string()))?;
        log::info!("入力デバイス: {:?}", device.name());
        self.device = Some(device);
        Ok(())
    }

    fn start(&mut self, blocks: mpsc::Sender<Vec<f32>>) -> SessionResult<()> {
        let device = self
            .device
            .take()
            .ok_or_else(|| SessionError::PermissionDenied("入力デバイス未確保".to_string()))?;

        let result = (|| -> Result<cpal::Stream> {
            let default_config = device.default_input_config()?;
            let stream = match default_config.sample_format() {
                cpal::SampleFormat::F32 => self.build_stream::<f32>(&device, blocks)?,
                cpal::SampleFormat::I16 => self.build_stream::<i16>(&device, blocks)?,
                cpal::SampleFormat::U16 => self.build_stream::<u16>(&device, blocks)?,
                cpal::SampleFormat::I32 => self.build_stream::<i32>(&device, blocks)?,
                _ => anyhow::bail!("サポートされていないサンプルフォーマット"),
            };
            stream.play().context("ストリームの再生開始に失敗")?;
            Ok(stream)
        })();

        self.device = Some(device);
        let stream = result.map_err(|e| SessionError::PermissionDenied(format!("{:#}", e)))?;
        self.stream = Some(stream);

        log::info!("音声入力ストリームを開始しました");
        Ok(())
    }

    /// ストリームを停止
    fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            log::info!("音声入力ストリームを停止しました");
        }
        self.device = None;
    }
}

impl Drop for AudioInput {
    fn drop(&mut self) {
        self.stop();
    }
}
