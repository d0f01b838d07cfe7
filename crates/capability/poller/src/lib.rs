//! 周期轮询。
//!
//! - `block`：由命令表推导轮询块（一次批量读取覆盖的条目集合）
//! - `poller`：单设备的轮询周期；上一周期未结束时新周期直接丢弃

pub mod block;
pub mod poller;

pub use block::{MAX_READ_BITS, MAX_READ_REGISTERS, PollBlock, plan_blocks};
pub use poller::{Poller, TickReport};
