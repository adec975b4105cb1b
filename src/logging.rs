use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

/// 通常ログファイルの接頭辞
const LOG_FILE_PREFIX: &str = "compliance-store.log";
/// 監査ログファイルの接頭辞
const AUDIT_FILE_PREFIX: &str = "compliance-audit.log";
/// 監査イベントを出力するモジュールのターゲット
const AUDIT_TARGET: &str = "compliance_store::security::audit_log";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// ログ設定
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// ログレベル (trace, debug, info, warn, error) または EnvFilter 式
    pub level: String,
    /// ログディレクトリ
    pub log_dir: PathBuf,
    /// ファイルローテーション設定
    pub rotation: LogRotation,
    /// ログ保持ポリシー
    pub retention: LogRetention,
    /// コンソール出力有効
    pub console_enabled: bool,
    /// ファイル出力有効
    pub file_enabled: bool,
    /// JSON 形式で出力
    pub json: bool,
    /// 監査イベントを別ファイルに分離
    pub separate_audit: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogRotation {
    /// 日次ローテーション
    Daily,
    /// 時間毎ローテーション
    Hourly,
    /// ローテーションなし
    Never,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogRetention {
    /// アプリケーションは削除しない（OS/ログ管理ツール任せ）
    External,
    /// 指定日数後に自動削除
    Days(u32),
    /// 最大ファイル数を保持
    Count(u32),
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: PathBuf::from("logs"),
            rotation: LogRotation::Daily,
            retention: LogRetention::External,
            console_enabled: true,
            file_enabled: false,
            json: false,
            separate_audit: true,
        }
    }
}

impl LogConfig {
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    /// カスタムログディレクトリを設定
    pub fn with_log_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.log_dir = dir.into();
        self
    }

    pub fn with_rotation(mut self, rotation: LogRotation) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_retention(mut self, retention: LogRetention) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_console(mut self, enabled: bool) -> Self {
        self.console_enabled = enabled;
        self
    }

    pub fn with_file(mut self, enabled: bool) -> Self {
        self.file_enabled = enabled;
        self
    }

    pub fn with_json(mut self, enabled: bool) -> Self {
        self.json = enabled;
        self
    }

    pub fn with_separate_audit(mut self, enabled: bool) -> Self {
        self.separate_audit = enabled;
        self
    }
}

/// ファイル出力のフラッシュを保証するガード。ドロップするまで保持すること
#[must_use]
#[derive(Debug)]
pub struct LoggingGuard {
    _guards: Vec<WorkerGuard>,
}

/// ログディレクトリを確保
fn ensure_log_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create log directory {}", dir.display()))?;
    }
    Ok(())
}

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
}

fn appender(config: &LogConfig, prefix: &str) -> rolling::RollingFileAppender {
    match config.rotation {
        LogRotation::Daily => rolling::daily(&config.log_dir, prefix),
        LogRotation::Hourly => rolling::hourly(&config.log_dir, prefix),
        LogRotation::Never => rolling::never(&config.log_dir, prefix),
    }
}

fn console_layer(config: &LogConfig) -> BoxedLayer {
    let layer = fmt::layer().with_writer(std::io::stderr).with_target(true);
    if config.json {
        layer.json().with_filter(env_filter(&config.level)).boxed()
    } else {
        layer.with_filter(env_filter(&config.level)).boxed()
    }
}

fn file_layers(config: &LogConfig, guards: &mut Vec<WorkerGuard>) -> Vec<BoxedLayer> {
    let mut layers = Vec::new();

    let (writer, guard) = non_blocking(appender(config, LOG_FILE_PREFIX));
    guards.push(guard);
    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);
    layers.push(if config.json {
        layer.json().with_filter(env_filter(&config.level)).boxed()
    } else {
        layer.with_filter(env_filter(&config.level)).boxed()
    });

    if config.separate_audit {
        // 監査イベントはレベル設定に関わらず常に JSON で残す
        let (writer, guard) = non_blocking(appender(config, AUDIT_FILE_PREFIX));
        guards.push(guard);
        layers.push(
            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .json()
                .with_filter(filter_fn(|meta| meta.target().starts_with(AUDIT_TARGET)))
                .boxed(),
        );
    }

    layers
}

/// ログシステムを初期化
pub fn init_logging(config: &LogConfig) -> Result<LoggingGuard> {
    let mut guards = Vec::new();
    let mut layers: Vec<BoxedLayer> = Vec::new();

    if config.console_enabled {
        layers.push(console_layer(config));
    }
    if config.file_enabled {
        ensure_log_dir(&config.log_dir)?;
        layers.extend(file_layers(config, &mut guards));
    }
    if layers.is_empty() {
        // 最低限のコンソール出力
        layers.push(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(EnvFilter::new("warn"))
                .boxed(),
        );
    }

    tracing_subscriber::registry()
        .with(layers)
        .try_init()
        .context("a global tracing subscriber is already installed")?;

    tracing::info!(
        level = %config.level,
        log_dir = %config.log_dir.display(),
        console = config.console_enabled,
        file = config.file_enabled,
        retention = %format_retention_policy(&config.retention),
        "logging initialized"
    );

    if config.file_enabled {
        match apply_retention_policy(config) {
            Ok(removed) if removed > 0 => tracing::info!(removed, "old log files removed"),
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "failed to apply log retention policy"),
        }
    }

    Ok(LoggingGuard { _guards: guards })
}

/// ログ統計情報を取得
pub fn get_log_stats(log_dir: &Path) -> Result<LogStats> {
    let mut stats = LogStats::default();

    if !log_dir.exists() {
        return Ok(stats);
    }

    for (_, metadata) in log_files(log_dir)? {
        stats.file_count += 1;
        stats.total_size += metadata.len();
        if let Ok(modified) = metadata.modified() {
            if stats.last_modified.map(|t| modified > t).unwrap_or(true) {
                stats.last_modified = Some(modified);
            }
        }
    }

    Ok(stats)
}

#[derive(Debug, Default)]
pub struct LogStats {
    pub file_count: usize,
    pub total_size: u64,
    pub last_modified: Option<std::time::SystemTime>,
}

impl LogStats {
    pub fn format_size(&self) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB"];
        let mut size = self.total_size as f64;
        let mut unit_index = 0;

        while size >= 1024.0 && unit_index < UNITS.len() - 1 {
            size /= 1024.0;
            unit_index += 1;
        }

        format!("{:.2} {}", size, UNITS[unit_index])
    }
}

fn format_retention_policy(retention: &LogRetention) -> String {
    match retention {
        LogRetention::External => "external".to_string(),
        LogRetention::Days(days) => format!("{} days", days),
        LogRetention::Count(count) => format!("{} files", count),
    }
}

/// ログ保持ポリシーを適用し、削除したファイル数を返す
fn apply_retention_policy(config: &LogConfig) -> Result<usize> {
    match config.retention {
        LogRetention::External => Ok(0),
        LogRetention::Days(days) => cleanup_old_logs_by_age(&config.log_dir, days),
        LogRetention::Count(max_count) => cleanup_old_logs_by_count(&config.log_dir, max_count),
    }
}

/// ログファイルかどうかを判定
fn is_log_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|name| name.starts_with(LOG_FILE_PREFIX) || name.starts_with(AUDIT_FILE_PREFIX))
        .unwrap_or(false)
}

fn log_files(log_dir: &Path) -> Result<Vec<(PathBuf, fs::Metadata)>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(log_dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_file() && is_log_file(&path) {
            if let Ok(metadata) = entry.metadata() {
                files.push((path, metadata));
            }
        }
    }
    Ok(files)
}

fn remove_files<'a>(paths: impl Iterator<Item = &'a PathBuf>) -> usize {
    let mut removed = 0;
    for path in paths {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove log file"),
        }
    }
    removed
}

/// 日数ベースでログファイルを削除
fn cleanup_old_logs_by_age(log_dir: &Path, max_days: u32) -> Result<usize> {
    use std::time::{Duration, SystemTime};

    let cutoff = SystemTime::now() - Duration::from_secs(max_days as u64 * 24 * 60 * 60);
    let expired: Vec<PathBuf> = log_files(log_dir)?
        .into_iter()
        .filter(|(_, meta)| meta.modified().map(|m| m < cutoff).unwrap_or(false))
        .map(|(path, _)| path)
        .collect();

    Ok(remove_files(expired.iter()))
}

/// ファイル数ベースでログファイルを削除
fn cleanup_old_logs_by_count(log_dir: &Path, max_count: u32) -> Result<usize> {
    let mut files: Vec<(PathBuf, std::time::SystemTime)> = log_files(log_dir)?
        .into_iter()
        .filter_map(|(path, meta)| meta.modified().ok().map(|m| (path, m)))
        .collect();

    // 新しい順
    files.sort_by(|a, b| b.1.cmp(&a.1));

    Ok(remove_files(
        files.iter().skip(max_count as usize).map(|(path, _)| path),
    ))
}
