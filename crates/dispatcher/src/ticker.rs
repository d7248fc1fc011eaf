use std::future::Future;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{error, info};
use transcoder_core::TranscoderResult;

/// 周期执行 `tick` 直到收到关闭信号
///
/// 每轮结束后才开始计时，同一循环不会与自身并发；单轮失败只记录日志，下一轮照常执行。
/// 正在执行的一轮不会被打断，保证认领总能被释放。
pub async fn run_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = TranscoderResult<()>>,
{
    info!("启动{}循环，间隔 {:?}", name, period);
    loop {
        if let Err(e) = tick().await {
            error!("{}执行失败: {}", name, e);
        }

        tokio::select! {
            _ = tokio::time::sleep(period) => {}
            _ = shutdown_rx.recv() => {
                info!("收到关闭信号，停止{}循环", name);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use transcoder_core::TranscoderError;

    #[tokio::test]
    async fn test_errors_do_not_stop_the_loop() {
        let (tx, rx) = broadcast::channel(1);
        let ticks = Arc::new(AtomicUsize::new(0));

        let counter = ticks.clone();
        let handle = tokio::spawn(run_periodic("测试", Duration::from_millis(10), rx, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(TranscoderError::Internal("boom".to_string()))
            }
        }));

        tokio::time::sleep(Duration::from_millis(80)).await;
        tx.send(()).unwrap();
        handle.await.unwrap();
        assert!(ticks.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_shutdown_stops_long_sleep() {
        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(run_periodic("测试", Duration::from_secs(3600), rx, || async {
            Ok(())
        }));

        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
