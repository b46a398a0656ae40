/// ユーザー向けの単発通知
///
/// セッション開始失敗など、利用者に一度だけ知らせるべき事象に使う。
pub trait Notifier: Send {
    fn notify(&self, message: &str);
}

/// 標準エラー出力に通知を表示する
pub struct ConsoleNotifier;

impl Notifier for ConsoleNotifier {
    fn notify(&self, message: &str) {
        log::warn!("通知: {}", message);
        eprintln!("⚠ {}", message);
    }
}
