use crate::types::{AudioFormat, SampleI16};
use anyhow::{Context, Result};
use std::fs;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

/// 読み上げ音声のWAV保存
///
/// 1回の録音ごとにタイムスタンプ付きのファイルを作成する。
pub struct WavRecorder {
    prefix: String,
    output_dir: PathBuf,
    current_file: Option<hound::WavWriter<BufWriter<fs::File>>>,
    current_path: Option<PathBuf>,
    spec: hound::WavSpec,
    samples_written: usize,
}

impl WavRecorder {
    pub fn new<P: AsRef<Path>>(prefix: &str, output_dir: P, format: AudioFormat) -> Result<Self> {
        let output_dir = output_dir.as_ref().to_path_buf();

        // 出力ディレクトリが存在しない場合は作成
        if !output_dir.exists() {
            fs::create_dir_all(&output_dir)
                .with_context(|| format!("出力ディレクトリの作成に失敗: {:?}", output_dir))?;
        }

        let spec = hound::WavSpec {
            channels: format.channels,
            sample_rate: format.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        Ok(Self {
            prefix: prefix.to_string(),
            output_dir,
            current_file: None,
            current_path: None,
            spec,
            samples_written: 0,
        })
    }

    /// 新しいファイルを作成
    pub fn start(&mut self) -> Result<PathBuf> {
        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S%.3f");
        let filepath = self
            .output_dir
            .join(format!("{}_{}.wav", self.prefix, timestamp));

        log::info!("WAVファイル作成: {:?}", filepath);

        let writer = hound::WavWriter::create(&filepath, self.spec)
            .with_context(|| format!("WAVファイルの作成に失敗: {:?}", filepath))?;

        self.current_file = Some(writer);
        self.current_path = Some(filepath.clone());
        self.samples_written = 0;

        Ok(filepath)
    }

    pub fn write_samples(&mut self, samples: &[SampleI16]) -> Result<()> {
        if self.current_file.is_none() {
            self.start()?;
        }

        if let Some(writer) = &mut self.current_file {
            for &sample in samples {
                writer
                    .write_sample(sample)
                    .context("WAVファイルへのサンプル書き込みに失敗")?;
            }
            self.samples_written += samples.len();
        }

        Ok(())
    }

    /// 現在のファイルを閉じ、そのパスを返す
    pub fn finalize(&mut self) -> Result<Option<PathBuf>> {
        let Some(writer) = self.current_file.take() else {
            return Ok(None);
        };
        writer
            .finalize()
            .context("WAVファイルのファイナライズに失敗")?;
        log::info!(
            "WAVファイル書き込み完了: {}サンプル ({:.2}秒)",
            self.samples_written,
            self.duration_seconds()
        );
        self.samples_written = 0;
        Ok(self.current_path.take())
    }

    pub fn samples_written(&self) -> usize {
        self.samples_written
    }

    /// 書き込んだ時間（秒）
    pub fn duration_seconds(&self) -> f64 {
        self.samples_written as f64 / (self.spec.sample_rate as f64 * self.spec.channels as f64)
    }
}

impl Drop for WavRecorder {
    fn drop(&mut self) {
        if self.current_file.is_some() {
            if let Err(e) = self.finalize() {
                log::error!("WavRecorder のドロップ時にエラー: {}", e);
            }
        }
    }
}
