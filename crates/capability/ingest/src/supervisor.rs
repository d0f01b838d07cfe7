//! 监听任务托管：出错后延迟重启，关闭时有界等待。

use crate::event::{PushHandler, Source};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const RESTART_DELAY: Duration = Duration::from_secs(1);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// 一组监听任务的托管者。
#[derive(Debug, Default)]
pub struct ListenerSupervisor {
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ListenerSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 启动监听；`run` 返回错误后等待片刻再重启，直到关闭。
    pub fn spawn(&self, source: Arc<dyn Source>, handler: Arc<dyn PushHandler>) {
        let cancel = self.cancel.child_token();
        let handle = tokio::spawn(async move {
            let name = source.name();
            info!(target: "devgw.ingest", listener = %name, "listener_started");
            loop {
                match source.run(Arc::clone(&handler), cancel.clone()).await {
                    Ok(()) if cancel.is_cancelled() => break,
                    Ok(()) => {
                        warn!(target: "devgw.ingest", listener = %name, "listener_exited");
                    }
                    Err(err) => {
                        warn!(target: "devgw.ingest", listener = %name, error = %err, "listener_failed");
                    }
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RESTART_DELAY) => {}
                }
            }
            info!(target: "devgw.ingest", listener = %name, "listener_stopped");
        });
        self.tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(handle);
    }

    /// 取消全部监听并等待退出；超时的任务被中止。
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
            .collect();
        for mut task in tasks {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        }
    }
}
