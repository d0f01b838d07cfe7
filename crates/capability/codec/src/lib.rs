//! 命令表与编解码。
//!
//! - `table`：命令表加载与校验
//! - `codec`：`encode` / `decode` / `validate`，纯函数

pub mod codec;
pub mod error;
pub mod table;

pub use codec::{
    DecodeOutcome, decode, encode, hex_dump, is_invalid_sentinel, observed, try_decode, validate,
    zero_value,
};
pub use error::{CodecError, TableError};
pub use table::CommandTable;
