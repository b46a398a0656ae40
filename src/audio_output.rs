use crate::scheduler::{PlaybackSink, UnitId};
use anyhow::{Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// ミキサーに登録された再生ユニット
struct MixUnit {
    id: UnitId,
    start_frame: u64,
    samples: Vec<f32>,
}

impl MixUnit {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// 出力コールバックと共有するミキサー状態
///
/// `position` は次に出力するフレーム番号で、出力クロックの正本。
#[derive(Default)]
struct Mixer {
    units: Vec<MixUnit>,
    ended_tx: Option<mpsc::UnboundedSender<UnitId>>,
    position: u64,
}

impl Mixer {
    /// ユニットを登録し、実際の開始フレームを返す
    ///
    /// 開始フレームが出力済みなら次の出力フレームから全サンプルを再生する。
    fn add(&mut self, id: UnitId, start_frame: u64, samples: Vec<f32>) -> u64 {
        let start_frame = start_frame.max(self.position);
        self.units.push(MixUnit {
            id,
            start_frame,
            samples,
        });
        start_frame
    }

    /// 現在位置から `out.len()` フレームを合成し、終了したユニットを通知
    fn render(&mut self, out: &mut [f32]) {
        out.fill(0.0);
        let first_frame = self.position;
        let last_frame = first_frame + out.len() as u64;

        for unit in &self.units {
            if unit.start_frame >= last_frame || unit.end_frame() <= first_frame {
                continue;
            }
            let from = unit.start_frame.max(first_frame);
            let to = unit.end_frame().min(last_frame);
            for frame in from..to {
                let sample = unit.samples[(frame - unit.start_frame) as usize];
                out[(frame - first_frame) as usize] += sample;
            }
        }

        let ended_tx = self.ended_tx.as_ref();
        self.units.retain(|unit| {
            if unit.end_frame() <= last_frame {
                if let Some(tx) = ended_tx {
                    let _ = tx.send(unit.id);
                }
                false
            } else {
                true
            }
        });
        self.position = last_frame;
    }
}

/// 音声出力デバイスマネージャ
///
/// 24kHz モノラルの出力ストリームを開き、スケジュールされたユニットを
/// 出力フレーム単位で合成する。再生済みフレーム数が出力クロックになる。
pub struct AudioOutput {
    device: Device,
    sample_rate: u32,
    stream: Option<Stream>,
    mixer: Arc<Mutex<Mixer>>,
    frames_played: Arc<AtomicU64>,
}

impl AudioOutput {
    /// 新しいAudioOutputを作成
    pub fn new(device_name: Option<&str>, sample_rate: u32) -> Result<Self> {
        let host = cpal::default_host();

        let device = if let Some(name) = device_name.filter(|n| *n != "default") {
            host.output_devices()?
                .find(|d| d.name().map(|n| n == name).unwrap_or(false))
                .ok_or_else(|| anyhow::anyhow!("出力デバイス '{}' が見つかりません", name))?
        } else {
            host.default_output_device()
                .ok_or_else(|| anyhow::anyhow!("デフォルト出力デバイスが見つかりません"))?
        };

        log::info!("出力デバイス: {}", device.name()?);

        Ok(Self {
            device,
            sample_rate,
            stream: None,
            mixer: Arc::new(Mutex::new(Mixer::default())),
            frames_played: Arc::new(AtomicU64::new(0)),
        })
    }

    /// デバイス一覧を表示
    pub fn list_devices() -> Result<()> {
        let host = cpal::default_host();
        println!("=== 利用可能な出力デバイス ===");

        let default_name = host.default_output_device().and_then(|d| d.name().ok());
        for (idx, device) in host.output_devices()?.enumerate() {
            let name = device.name()?;
            let marker = if default_name.as_deref() == Some(name.as_str()) {
                " (デフォルト)"
            } else {
                ""
            };
            println!("{}. {}{}", idx, name, marker);

            if let Ok(config) = device.default_output_config() {
                println!(
                    "   サンプルレート: {} Hz, チャンネル数: {}",
                    config.sample_rate().0,
                    config.channels()
                );
            }
        }

        Ok(())
    }

    /// 指定されたサンプルフォーマットで出力ストリームを構築
    fn build_stream<T>(&self, config: StreamConfig) -> Result<Stream>
    where
        T: SizedSample + Sample + FromSample<f32> + Send + 'static,
    {
        let mixer = self.mixer.clone();
        let frames_played = self.frames_played.clone();
        let mut scratch: Vec<f32> = Vec::new();

        let stream = self
            .device
            .build_output_stream(
                &config,
                move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                    scratch.resize(data.len(), 0.0);

                    match mixer.lock() {
                        Ok(mut mixer) => {
                            mixer.render(&mut scratch);
                            frames_played.store(mixer.position, Ordering::Release);
                        }
                        Err(_) => scratch.fill(0.0),
                    }

                    for (out, &sample) in data.iter_mut().zip(scratch.iter()) {
                        *out = T::from_sample(sample.clamp(-1.0, 1.0));
                    }
                },
                move |err| {
                    log::error!("出力ストリームエラー: {}", err);
                },
                None,
            )
            .context("出力ストリームの構築に失敗")?;

        Ok(stream)
    }

    fn seconds_to_frame(&self, seconds: f64) -> u64 {
        (seconds.max(0.0) * self.sample_rate as f64).round() as u64
    }
}

impl PlaybackSink for AudioOutput {
    /// 音声ストリームを開始
    fn start(&mut self, ended_tx: mpsc::UnboundedSender<UnitId>) -> Result<()> {
        if let Ok(mut mixer) = self.mixer.lock() {
            mixer.units.clear();
            mixer.ended_tx = Some(ended_tx);
        }
        if self.stream.is_some() {
            return Ok(());
        }

        // デバイスのデフォルト設定を取得してサンプルフォーマットを確認
        let default_config = self
            .device
            .default_output_config()
            .context("デフォルト出力設定が取得できません")?;

        let config = StreamConfig {
            channels: 1,
            sample_rate: cpal::SampleRate(self.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        log::info!(
            "出力ストリーム開始: {:?}, サンプルレート={}Hz, チャンネル={}",
            default_config.sample_format(),
            config.sample_rate.0,
            config.channels
        );

        let stream = match default_config.sample_format() {
            SampleFormat::F32 => self.build_stream::<f32>(config)?,
            SampleFormat::I16 => self.build_stream::<i16>(config)?,
            SampleFormat::U16 => self.build_stream::<u16>(config)?,
            _ => anyhow::bail!(
                "サポートされていないサンプルフォーマット: {:?}",
                default_config.sample_format()
            ),
        };

        stream.play().context("ストリームの再生開始に失敗")?;
        self.stream = Some(stream);

        Ok(())
    }

    fn now(&self) -> f64 {
        self.frames_played.load(Ordering::Acquire) as f64 / self.sample_rate as f64
    }

    fn play(&mut self, id: UnitId, samples: Vec<f32>, start_at: f64) -> Result<f64> {
        let start_frame = self.seconds_to_frame(start_at);
        let mut mixer = self
            .mixer
            .lock()
            .map_err(|_| anyhow::anyhow!("ミキサーのロックに失敗"))?;
        let actual_frame = mixer.add(id, start_frame, samples);
        if actual_frame > start_frame {
            log::debug!(
                "再生開始が {} フレーム遅れました: unit={}",
                actual_frame - start_frame,
                id
            );
        }
        Ok(actual_frame as f64 / self.sample_rate as f64)
    }

    fn stop(&mut self, id: UnitId) {
        if let Ok(mut mixer) = self.mixer.lock() {
            mixer.units.retain(|unit| unit.id != id);
        }
    }

    /// 音声ストリームを停止
    fn shutdown(&mut self) {
        if let Ok(mut mixer) = self.mixer.lock() {
            mixer.units.clear();
            mixer.ended_tx = None;
        }
        if let Some(stream) = self.stream.take() {
            drop(stream);
            log::info!("出力ストリームを停止しました");
        }
    }
}

impl Drop for AudioOutput {
    fn drop(&mut self) {
        self.shutdown();
    }
}
