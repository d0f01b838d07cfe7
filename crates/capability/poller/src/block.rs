//! 轮询块规划
//!
//! - 寄存器条目：同 block_id、同表、同单元的条目合并为一个连续区间，
//!   超过单次读取上限时拆分；未声明 block_id 的条目单独读取
//! - 文本条目：相同查询命令共享一次读取
//! - JSON 条目：相同读取模板共享一次读取
//! - MQTT 主题条目不轮询

use devgw_protocol::{Request, plan};
use domain::{Address, CommandEntry, RegisterTable};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// 单次读取的寄存器上限
pub const MAX_READ_REGISTERS: u16 = 125;
/// 单次读取的 bit 上限
pub const MAX_READ_BITS: u16 = 2000;

/// 轮询块
#[derive(Debug, Clone, PartialEq)]
pub struct PollBlock {
    pub block_id: String,
    pub request: Request,
    /// 寄存器块的起始地址，用于从回复中切片。
    pub origin: u16,
    pub entries: Vec<Arc<CommandEntry>>,
    pub cycle: Duration,
}

impl PollBlock {
    /// 声明的块长度（寄存器 / bit 个数）；非寄存器块为 None。
    pub fn declared_len(&self) -> Option<u16> {
        match self.request {
            Request::ReadRegisters { count, .. } => Some(count),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum GroupKey {
    Register {
        table: u8,
        unit: Option<u8>,
        block: String,
    },
    Query(String),
    Template(String),
}

fn table_rank(table: RegisterTable) -> u8 {
    match table {
        RegisterTable::Holding => 0,
        RegisterTable::Input => 1,
        RegisterTable::Coil => 2,
        RegisterTable::Discrete => 3,
    }
}

fn group_key(entry: &CommandEntry) -> Option<GroupKey> {
    match &entry.address {
        Address::Register { table, unit, .. } => Some(GroupKey::Register {
            table: table_rank(*table),
            unit: *unit,
            block: entry
                .block_id
                .clone()
                .unwrap_or_else(|| format!("@{}", entry.name)),
        }),
        Address::Token { read: Some(text), .. } => Some(GroupKey::Query(text.clone())),
        Address::Json {
            read: Some(template),
            ..
        } => Some(GroupKey::Template(template.key())),
        _ => None,
    }
}

fn register_span(entry: &CommandEntry) -> (u16, u32) {
    match &entry.address {
        Address::Register { address, table, .. } => {
            let count = if table.is_bit_table() {
                1
            } else {
                entry.register_count()
            };
            (*address, u32::from(*address) + u32::from(count))
        }
        _ => (0, 0),
    }
}

/// 按地址顺序把寄存器条目切成不超过上限的连续区间。
fn split_registers(
    block_id: &str,
    mut entries: Vec<Arc<CommandEntry>>,
    cycle: Duration,
) -> Vec<PollBlock> {
    entries.sort_by_key(|entry| register_span(entry).0);
    let Some(first) = entries.first() else {
        return Vec::new();
    };
    let (table, unit) = match first.address {
        Address::Register { table, unit, .. } => (table, unit),
        _ => return Vec::new(),
    };
    let limit = u32::from(if table.is_bit_table() {
        MAX_READ_BITS
    } else {
        MAX_READ_REGISTERS
    });

    let mut blocks: Vec<PollBlock> = Vec::new();
    let mut current: Vec<Arc<CommandEntry>> = Vec::new();
    let mut start = 0u32;
    let mut end = 0u32;
    let mut flush = |current: &mut Vec<Arc<CommandEntry>>, start: u32, end: u32| {
        if current.is_empty() {
            return;
        }
        let part = blocks.len();
        blocks.push(PollBlock {
            block_id: if part == 0 {
                block_id.to_string()
            } else {
                format!("{}#{}", block_id, part)
            },
            request: Request::ReadRegisters {
                table,
                unit,
                address: start as u16,
                count: (end - start) as u16,
            },
            origin: start as u16,
            entries: std::mem::take(current),
            cycle,
        });
    };
    for entry in entries {
        let (address, entry_end) = register_span(&entry);
        let address = u32::from(address);
        if current.is_empty() {
            start = address;
            end = entry_end;
        } else if entry_end.max(end) - start > limit {
            flush(&mut current, start, end);
            start = address;
            end = entry_end;
        } else {
            end = end.max(entry_end);
        }
        current.push(entry);
    }
    flush(&mut current, start, end);
    blocks
}

/// 由条目推导轮询块；只包含可读且地址支持主动读取的条目。
pub fn plan_blocks<I>(entries: I, cycle: Duration) -> Vec<PollBlock>
where
    I: IntoIterator<Item = Arc<CommandEntry>>,
{
    let mut groups: BTreeMap<GroupKey, Vec<Arc<CommandEntry>>> = BTreeMap::new();
    for entry in entries {
        if !entry.is_polled() {
            continue;
        }
        if let Some(key) = group_key(&entry) {
            groups.entry(key).or_default().push(entry);
        }
    }

    let mut blocks = Vec::new();
    for (key, entries) in groups {
        match key {
            GroupKey::Register { block, .. } => {
                let block_id = block.trim_start_matches('@').to_string();
                blocks.extend(split_registers(&block_id, entries, cycle));
            }
            GroupKey::Query(_) | GroupKey::Template(_) => {
                let Some(request) = entries.first().and_then(|entry| plan::read_request(entry))
                else {
                    continue;
                };
                let block_id = entries
                    .iter()
                    .find_map(|entry| entry.block_id.clone())
                    .unwrap_or_else(|| entries[0].name.clone());
                blocks.push(PollBlock {
                    block_id,
                    request,
                    origin: 0,
                    entries,
                    cycle,
                });
            }
        }
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::{HttpMethod, RequestTemplate, WireType};

    const CYCLE: Duration = Duration::from_secs(30);

    fn holding(name: &str, address: u16, wire_type: WireType) -> CommandEntry {
        CommandEntry::new(
            name,
            Address::Register {
                table: RegisterTable::Holding,
                address,
                bit: None,
                unit: None,
            },
            wire_type,
        )
    }

    #[test]
    fn block_members_share_one_read() {
        let entries = vec![
            Arc::new(holding("flow", 0x10, WireType::Word).with_block("status")),
            Arc::new(holding("power", 0x12, WireType::Dword).with_block("status")),
            Arc::new(holding("mode", 0x40, WireType::Word)),
        ];
        let blocks = plan_blocks(entries, CYCLE);
        assert_eq!(blocks.len(), 2);
        let status = blocks
            .iter()
            .find(|block| block.block_id == "status")
            .expect("status block");
        assert_eq!(
            status.request,
            Request::ReadRegisters {
                table: RegisterTable::Holding,
                unit: None,
                address: 0x10,
                count: 4,
            }
        );
        assert_eq!(status.entries.len(), 2);
        assert_eq!(status.declared_len(), Some(4));
    }

    #[test]
    fn oversized_block_is_split() {
        let entries = vec![
            Arc::new(holding("a", 0, WireType::Word).with_block("big")),
            Arc::new(holding("b", 200, WireType::Word).with_block("big")),
        ];
        let blocks = plan_blocks(entries, CYCLE);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].block_id, "big");
        assert_eq!(blocks[1].block_id, "big#1");
        assert_eq!(blocks[1].origin, 200);
    }

    #[test]
    fn json_entries_group_by_template() {
        let template = RequestTemplate::Http {
            method: HttpMethod::Get,
            path: "/api/status".to_string(),
            body: None,
        };
        let json = |name: &str, pointer: &str| {
            Arc::new(CommandEntry::new(
                name,
                Address::Json {
                    pointer: pointer.to_string(),
                    push_pointer: None,
                    read: Some(template.clone()),
                    write: None,
                },
                WireType::Word,
            ))
        };
        let blocks = plan_blocks(vec![json("battery", "/battery"), json("state", "/state")], CYCLE);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].entries.len(), 2);
        assert!(matches!(blocks[0].request, Request::Http { .. }));
    }

    #[test]
    fn write_only_and_topic_entries_are_not_polled() {
        let entries = vec![
            Arc::new(holding("setpoint", 1, WireType::Word).with_direction(domain::Direction::Write)),
            Arc::new(CommandEntry::new(
                "state",
                Address::Topic {
                    state: "vacuum/state".to_string(),
                    command: None,
                },
                WireType::String,
            )),
        ];
        assert!(plan_blocks(entries, CYCLE).is_empty());
    }
}
