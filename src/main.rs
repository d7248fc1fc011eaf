use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, Command};
use tokio::signal;
use tracing::{error, info, warn};
use transcoder::{Application, ShutdownManager};
use transcoder_core::{init_logging, AppConfig};
use transcoder_infrastructure::install_prometheus_exporter;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("transcoder")
        .version(env!("CARGO_PKG_VERSION"))
        .about("分布式媒体转码调度系统")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径，未指定时按默认路径查找"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别，覆盖配置文件")
                .value_parser(["trace", "debug", "info", "warn", "error"]),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式，覆盖配置文件")
                .value_parser(["json", "pretty"]),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config").map(String::as_str);
    let mut config = AppConfig::load(config_path)
        .with_context(|| format!("加载配置失败: {}", config_path.unwrap_or("<默认路径>")))?;
    if let Some(level) = matches.get_one::<String>("log-level") {
        config.observability.log_level = level.clone();
    }
    if let Some(format) = matches.get_one::<String>("log-format") {
        config.observability.log_format = format.clone();
    }

    init_logging(
        &config.observability.log_level,
        &config.observability.log_format,
    )?;
    info!("启动分布式媒体转码调度系统 v{}", env!("CARGO_PKG_VERSION"));

    if config.observability.metrics_enabled {
        install_prometheus_exporter(&config.observability.metrics_bind_address)?;
    }

    let app = Arc::new(Application::new(config, config_path).await?);
    app.start().await?;

    let shutdown_manager = ShutdownManager::new();
    let app_handle = {
        let app = Arc::clone(&app);
        let shutdown_rx = shutdown_manager.subscribe().await;
        tokio::spawn(async move {
            if let Err(e) = app.run(shutdown_rx).await {
                error!("应用运行失败: {e}");
            }
        })
    };

    let signal_name = wait_for_shutdown_signal().await?;
    info!("收到{}信号，开始优雅关闭...", signal_name);
    shutdown_manager.shutdown(signal_name).await;

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, app_handle).await {
        Ok(Ok(())) => info!("周期循环已全部停止"),
        Ok(Err(e)) => error!("应用关闭时发生错误: {e}"),
        Err(_) => warn!("等待周期循环退出超时，继续关闭"),
    }

    app.stop(signal_name).await?;
    app.database().close().await;
    info!("分布式媒体转码调度系统已退出");
    Ok(())
}

/// 等待关闭信号并返回信号名
async fn wait_for_shutdown_signal() -> Result<&'static str> {
    #[cfg(unix)]
    {
        use signal::unix::{signal as unix_signal, SignalKind};

        let mut terminate =
            unix_signal(SignalKind::terminate()).context("安装SIGTERM信号处理器失败")?;
        let mut quit = unix_signal(SignalKind::quit()).context("安装SIGQUIT信号处理器失败")?;

        tokio::select! {
            result = signal::ctrl_c() => {
                result.context("安装Ctrl+C信号处理器失败")?;
                Ok("SIGINT")
            }
            _ = terminate.recv() => Ok("SIGTERM"),
            _ = quit.recv() => Ok("SIGQUIT"),
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await.context("安装Ctrl+C信号处理器失败")?;
        Ok("SIGINT")
    }
}
