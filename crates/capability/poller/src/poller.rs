//! 轮询周期
//!
//! 每个周期：会话未连接时先尝试一次 ensure_open，失败即结束本周期；
//! 然后按块批量读取、切片、解码并交给 Dispatcher。链路故障会终止本周期，
//! 剩余块等下一周期重试。

use crate::block::PollBlock;
use devgw_codec::{DecodeOutcome, decode, hex_dump};
use devgw_pipeline::Dispatcher;
use devgw_protocol::{Reply, TransportError, plan};
use devgw_session::{Session, SessionError};
use devgw_telemetry::PluginMetrics;
use domain::{ChangeSource, ConnectionState};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// 单个周期的结果。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// 上一周期仍在运行，本周期被丢弃。
    pub dropped: bool,
    /// 会话不可用，本周期未读取任何块。
    pub skipped: bool,
    pub blocks_read: usize,
    pub blocks_failed: usize,
    pub values_decoded: usize,
    pub items_written: usize,
}

/// 单设备轮询器
pub struct Poller {
    session: Arc<Session>,
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<PluginMetrics>,
    blocks: Vec<PollBlock>,
    running: Mutex<()>,
}

impl Poller {
    pub fn new(
        session: Arc<Session>,
        dispatcher: Arc<Dispatcher>,
        metrics: Arc<PluginMetrics>,
        blocks: Vec<PollBlock>,
    ) -> Self {
        Self {
            session,
            dispatcher,
            metrics,
            blocks,
            running: Mutex::new(()),
        }
    }

    pub fn blocks(&self) -> &[PollBlock] {
        &self.blocks
    }

    /// 执行一个周期；不会与另一个周期并行。
    pub async fn tick(&self) -> TickReport {
        let Ok(_guard) = self.running.try_lock() else {
            self.metrics.record_poll_tick_dropped();
            debug!(
                target: "devgw.poller",
                session = %self.session.name(),
                "poll_tick_dropped"
            );
            return TickReport {
                dropped: true,
                ..TickReport::default()
            };
        };
        self.metrics.record_poll_tick();
        let mut report = TickReport::default();

        if self.session.is_suspended() {
            report.skipped = true;
            return report;
        }
        if self.session.state() != ConnectionState::Connected {
            if let Err(err) = self.session.ensure_open().await {
                debug!(
                    target: "devgw.poller",
                    session = %self.session.name(),
                    error = %err,
                    "poll_tick_skipped"
                );
                report.skipped = true;
                return report;
            }
        }

        for block in &self.blocks {
            match self.session.call(block.request.clone()).await {
                Ok(reply) => {
                    report.blocks_read += 1;
                    self.metrics.record_block_read();
                    self.apply_block(block, &reply, &mut report).await;
                }
                Err(err) => {
                    report.blocks_failed += 1;
                    self.metrics.record_block_failure();
                    if stops_tick(&err) {
                        info!(
                            target: "devgw.poller",
                            block = %block.block_id,
                            error = %err,
                            "poll_tick_aborted"
                        );
                        break;
                    }
                    warn!(
                        target: "devgw.poller",
                        block = %block.block_id,
                        request = %block.request.describe(),
                        error = %err,
                        "poll_block_failed"
                    );
                }
            }
        }
        report
    }

    async fn apply_block(&self, block: &PollBlock, reply: &Reply, report: &mut TickReport) {
        for entry in &block.entries {
            let wire = match plan::extract(entry, reply, block.origin) {
                Ok(wire) => wire,
                Err(TransportError::ShortReply { expected, actual }) => {
                    warn!(
                        target: "devgw.poller",
                        block = %block.block_id,
                        entry = %entry.name,
                        expected,
                        actual,
                        "poll_block_short_reply"
                    );
                    return;
                }
                Err(err) => {
                    self.metrics.record_decode_failure();
                    warn!(
                        target: "devgw.poller",
                        block = %block.block_id,
                        entry = %entry.name,
                        error = %err,
                        "poll_entry_extract_failed"
                    );
                    continue;
                }
            };
            match decode(entry, &wire) {
                DecodeOutcome::Decoded(value) => {
                    report.values_decoded += 1;
                    let applied = self
                        .dispatcher
                        .apply(entry, &wire, value, ChangeSource::Poll)
                        .await;
                    report.items_written += applied.written;
                }
                DecodeOutcome::Skip(reason) => {
                    debug!(
                        target: "devgw.poller",
                        entry = %entry.name,
                        reason = %reason,
                        "poll_entry_skipped"
                    );
                }
                DecodeOutcome::Fatal(reason) => {
                    self.metrics.record_decode_failure();
                    warn!(
                        target: "devgw.poller",
                        entry = %entry.name,
                        payload = %hex_dump(&wire),
                        reason = %reason,
                        "poll_entry_decode_failed"
                    );
                }
            }
        }
    }
}

/// 链路不可用时本周期剩余块不再尝试。
fn stops_tick(err: &SessionError) -> bool {
    match err {
        SessionError::Transport(err) => err.is_link_failure(),
        _ => true,
    }
}
