//! # 存储能力模块
//!
//! 插件侧所有“状态”的归属地：
//!
//! 1. **item 契约** (`traits.rs`)：宿主 item 树的最小读写接口 [`ItemStore`]
//! 2. **数据模型** (`models.rs`)：item 记录、写入记录、绑定快照
//! 3. **绑定注册表** (`registry.rs`)：item 路径 ↔ 命令表条目，最近线上值
//! 4. **状态缓存** (`cache.rs`)：需跨重启保留的条目值（JSON 文件）
//! 5. **错误处理** (`error.rs`) 与 **验证辅助** (`validation.rs`)
//! 6. **实现层** `in_memory/`：item 树内存实现（参考宿主与测试）
//!
//! ## 并发
//!
//! - 注册表与内存 item 树都使用 `RwLock`，读多写少
//! - 锁中毒时注册表继续使用内部数据；item 树返回 [`StorageError::Lock`]
//!
//! ## 设计约束
//!
//! - 绑定在 parse_item 阶段建立，运行期不删除
//! - 线上值只在解码成功或设备写入成功后更新

pub mod cache;
pub mod error;
pub mod in_memory;
pub mod models;
pub mod registry;
pub mod traits;
pub mod validation;

pub use cache::StateCache;
pub use error::*;
pub use in_memory::InMemoryItemStore;
pub use models::*;
pub use registry::{Binding, BindingRegistry};
pub use traits::*;
pub use validation::*;
