pub mod command;
pub mod item;
pub mod value;

pub use command::{
    Address, BoolPair, CommandEntry, Direction, Endian, HttpMethod, RegisterTable, RequestTemplate,
    Scale, ValueRange, WireType, fill_template,
};
pub use item::{ChangeSource, ConnectionState, ItemDescriptor, ItemType};
pub use value::{ItemValue, WireValue};

/// 当前 Unix 毫秒时间戳。
pub fn now_epoch_ms() -> i64 {
    let now = std::time::SystemTime::now();
    let duration = now
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    duration.as_millis() as i64
}
