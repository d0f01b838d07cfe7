//! 内存存储实现模块
//!
//! 仅用于参考宿主和测试。

pub mod items;

pub use items::*;
