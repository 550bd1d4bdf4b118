//! 服务运行时

use relay_config::AppConfig;
use relay_telemetry::{LogFormat, init_tracing};
use tracing::{error, info, warn};

use crate::metrics::MetricsRecorder;

/// 初始化服务运行时
///
/// 指标开启时返回全局 recorder；recorder 安装失败只记录告警，不影响启动。
pub fn init_runtime(config: &AppConfig) -> Option<MetricsRecorder> {
    let format = LogFormat::from_json_flag(config.json_logs());
    if !init_tracing(&config.telemetry.log_level, format) {
        warn!("Tracing subscriber already installed");
    }

    let metrics = if config.telemetry.metrics_enabled {
        match MetricsRecorder::install() {
            Ok(recorder) => Some(recorder),
            Err(e) => {
                warn!(error = %e, "Failed to install metrics recorder");
                None
            }
        }
    } else {
        None
    };

    info!(
        app_name = %config.app_name,
        app_env = %config.app_env,
        log_format = ?format,
        metrics_enabled = metrics.is_some(),
        "Runtime initialized"
    );

    metrics
}

/// 等待关闭信号
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
