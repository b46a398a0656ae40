use anyhow::{Context, Result};
use env_logger::Env;
use pastor_live::audio_input::AudioInput;
use pastor_live::audio_output::AudioOutput;
use pastor_live::config::Config;
use pastor_live::notify::ConsoleNotifier;
use pastor_live::pcm;
use pastor_live::recorder::WavRecorder;
use pastor_live::rest::GeminiRestClient;
use pastor_live::scheduler::{PlaybackScheduler, PlaybackSink};
use pastor_live::session::{Control, LiveSession, StartOutcome};
use pastor_live::transport::GeminiLiveTransport;
use pastor_live::types::{AudioFormat, SessionState, OUTPUT_SAMPLE_RATE};
use std::io::BufRead;
use std::path::Path;
use tokio::sync::mpsc;

const USAGE: &str = "\
使い方:
  pastor-live [config.toml]                        ライブセッション (Enter で開始/停止)
  pastor-live narrate <テキスト> [--save]           テキストを読み上げ
  pastor-live transcribe <音声ファイル>             音声ファイルを文字起こし
  pastor-live analyze <動画/画像> [--prompt <指示>] 動画・画像を解析
  pastor-live --generate-config [config.toml]      デフォルト設定を生成
  pastor-live --show-interfaces                    オーディオデバイス一覧
オプション:
  --config <path>                                  narrate / transcribe / analyze の設定ファイル";

/// `<name> <value>` 形式のオプション値
fn option_value<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

/// `--config <path>` があればその値、なければ `config.toml`
fn config_path_option(args: &[String]) -> &str {
    option_value(args, "--config").unwrap_or("config.toml")
}

fn init_logger(config: &Config) {
    env_logger::Builder::from_env(Env::default().default_filter_or(config.output.log_level.as_str()))
        .format_timestamp(None)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // コマンドライン引数をパース
    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(String::as_str);

    match command {
        Some("--help") | Some("-h") => {
            println!("{}", USAGE);
            Ok(())
        }

        // 設定ファイル生成モード
        Some("--generate-config") => {
            let config_path = args.get(2).map(String::as_str).unwrap_or("config.toml");
            Config::write_default(config_path)?;
            println!("設定ファイルを生成しました: {}", config_path);
            Ok(())
        }

        // デバイス一覧表示モード
        Some("--show-interfaces") => {
            let config = Config::load_or_default(config_path_option(&args))?;
            init_logger(&config);
            AudioInput::list_devices(&config.audio.exclude_devices)?;
            println!();
            AudioOutput::list_devices()?;
            Ok(())
        }

        Some("narrate") => {
            let text = args
                .get(2)
                .filter(|t| !t.starts_with("--"))
                .with_context(|| format!("読み上げるテキストを指定してください\n\n{}", USAGE))?;
            let save = args.iter().any(|a| a == "--save");
            let config = Config::load_or_default(config_path_option(&args))?;
            init_logger(&config);
            run_narrate(&config, text, save).await
        }

        Some("transcribe") => {
            let file = args
                .get(2)
                .filter(|t| !t.starts_with("--"))
                .with_context(|| format!("音声ファイルを指定してください\n\n{}", USAGE))?;
            let config = Config::load_or_default(config_path_option(&args))?;
            init_logger(&config);
            run_transcribe(&config, Path::new(file)).await
        }

        Some("analyze") => {
            let file = args
                .get(2)
                .filter(|t| !t.starts_with("--"))
                .with_context(|| format!("動画または画像ファイルを指定してください\n\n{}", USAGE))?;
            let prompt = option_value(&args, "--prompt");
            let config = Config::load_or_default(config_path_option(&args))?;
            init_logger(&config);
            run_analyze(&config, Path::new(file), prompt).await
        }

        _ => {
            // 設定ファイルのパス
            let config_path = match command {
                Some("live") => args.get(2).map(String::as_str).unwrap_or("config.toml"),
                Some(path) if !path.starts_with("--") => path,
                _ => "config.toml",
            };
            let config = Config::load_or_default(config_path)?;
            init_logger(&config);

            log::info!("pastor-live を起動します");
            log::debug!("設定: {:?}", config);
            run_live(config).await
        }
    }
}

/// ライブセッションを対話的に実行
async fn run_live(config: Config) -> Result<()> {
    let (control_tx, mut control_rx) = mpsc::unbounded_channel();

    // Ctrl+C ハンドラを設定
    let ctrlc_tx = control_tx.clone();
    ctrlc::set_handler(move || {
        log::info!("停止シグナルを受信しました...");
        let _ = ctrlc_tx.send(Control::Quit);
    })?;

    // Enter で開始/停止を切り替え
    let stdin_tx = control_tx;
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            if line.is_err() || stdin_tx.send(Control::Toggle).is_err() {
                return;
            }
        }
        let _ = stdin_tx.send(Control::Quit);
    });

    let output = AudioOutput::new(Some(&config.audio.output_device), OUTPUT_SAMPLE_RATE)?;
    let mut session = LiveSession::new(
        config.live.clone(),
        Box::new(GeminiLiveTransport::new(&config.live)),
        Box::new(AudioInput::new(&config.audio)),
        Box::new(output),
        Box::new(ConsoleNotifier),
    );

    // トランスクリプトをJSON形式で出力
    let mut transcript_rx = session.subscribe_transcript();
    let printer = tokio::spawn(async move {
        while let Some(entry) = transcript_rx.recv().await {
            if let Ok(json) = serde_json::to_string(&entry) {
                println!("{}", json);
            }
        }
    });

    println!("Enter でセッションを開始/停止します (Ctrl+C で終了)");

    loop {
        let control = if session.state() == SessionState::Active {
            match session.run(&mut control_rx).await {
                Some(control) => control,
                None => {
                    println!("セッションが終了しました (Enter で再開)");
                    continue;
                }
            }
        } else {
            control_rx.recv().await.unwrap_or(Control::Quit)
        };

        match control {
            Control::Quit => break,
            Control::Toggle if session.state() == SessionState::Active => {
                session.stop();
                println!("セッションを停止しました");
            }
            Control::Toggle => match session.start_or_cancel(&mut control_rx).await {
                StartOutcome::Started => println!("セッションを開始しました。話しかけてください"),
                // 失敗はセッション側で通知済み
                StartOutcome::Failed(e) => log::debug!("開始失敗: {}", e),
                StartOutcome::Cancelled(Control::Quit) => break,
                StartOutcome::Cancelled(Control::Toggle) => {
                    println!("接続待ちを中止しました")
                }
            },
        }
    }

    // クリーンアップ
    log::info!("停止処理を開始します...");
    session.stop();
    drop(session);
    let _ = printer.await;

    log::info!("pastor-live を終了しました");
    Ok(())
}

/// テキストを読み上げて再生（必要ならWAV保存）
async fn run_narrate(config: &Config, text: &str, save: bool) -> Result<()> {
    let client = GeminiRestClient::new(&config.rest, config.live.api_key()?)?;
    let bytes = client.speak_text(text).await?;
    let samples = pcm::le_bytes_to_i16(&bytes);

    if save {
        let mut recorder = WavRecorder::new(
            "narration",
            &config.output.recordings_dir,
            AudioFormat::output(),
        )?;
        recorder.write_samples(&samples)?;
        if let Some(path) = recorder.finalize()? {
            println!("保存しました: {}", path.display());
        }
    }

    let mut output = AudioOutput::new(Some(&config.audio.output_device), OUTPUT_SAMPLE_RATE)?;
    let (ended_tx, mut ended_rx) = mpsc::unbounded_channel();
    output.start(ended_tx)?;

    let mut scheduler = PlaybackScheduler::new(AudioFormat::output());
    let unit = scheduler.schedule(samples.len(), output.now());
    log::info!("読み上げを再生します ({:.2}秒)", unit.duration);
    output.play(unit.id, pcm::i16_to_float(&samples), unit.start)?;

    // 再生終了を待つ
    while let Some(id) = ended_rx.recv().await {
        scheduler.complete(id);
        if scheduler.active_len() == 0 {
            break;
        }
    }

    output.shutdown();
    Ok(())
}

/// 音声ファイルを文字起こしして標準出力へ
async fn run_transcribe(config: &Config, path: &Path) -> Result<()> {
    let client = GeminiRestClient::new(&config.rest, config.live.api_key()?)?;
    let text = client.transcribe_file(path).await?;
    println!("{}", text);
    Ok(())
}

/// 動画・画像を解析して標準出力へ
async fn run_analyze(config: &Config, path: &Path, prompt: Option<&str>) -> Result<()> {
    let client = GeminiRestClient::new(&config.rest, config.live.api_key()?)?;
    let analysis = client.analyze_file(path, prompt).await?;
    println!("{}", analysis);
    Ok(())
}
