//! 来源 IP allow-list 与告警节流
//!
//! allow-list 为空表示接受任意来源。被拒绝的来源每个 IP 每小时只告警一次，
//! 其余静默丢弃。

use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::warn;

/// 同一来源两次告警的最小间隔
pub const ACL_WARN_WINDOW: Duration = Duration::from_secs(3600);

/// 来源 IP allow-list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowList {
    ips: BTreeSet<IpAddr>,
}

impl AllowList {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn new<I: IntoIterator<Item = IpAddr>>(ips: I) -> Self {
        Self {
            ips: ips.into_iter().collect(),
        }
    }

    /// 解析逗号 / 空白分隔的 IP 列表；返回无法解析的片段。
    pub fn parse(raw: &str) -> Result<Self, String> {
        let mut ips = BTreeSet::new();
        for part in raw
            .split(|ch: char| ch == ',' || ch == ';' || ch.is_whitespace())
            .filter(|part| !part.is_empty())
        {
            let ip = part.parse::<IpAddr>().map_err(|_| part.to_string())?;
            ips.insert(ip);
        }
        Ok(Self { ips })
    }

    pub fn is_open(&self) -> bool {
        self.ips.is_empty()
    }

    pub fn allows(&self, ip: IpAddr) -> bool {
        self.ips.is_empty() || self.ips.contains(&ip)
    }

    /// 合并另一份列表；任一方为空（不限制）时结果不限制。
    pub fn union(&self, other: &AllowList) -> AllowList {
        if self.is_open() || other.is_open() {
            return AllowList::any();
        }
        AllowList {
            ips: self.ips.union(&other.ips).copied().collect(),
        }
    }
}

/// 按来源节流告警
#[derive(Debug)]
pub struct WarnThrottle {
    window: Duration,
    last: Mutex<HashMap<IpAddr, Instant>>,
}

impl Default for WarnThrottle {
    fn default() -> Self {
        Self::new(ACL_WARN_WINDOW)
    }
}

impl WarnThrottle {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last: Mutex::new(HashMap::new()),
        }
    }

    /// 本来源在窗口内是否尚未告警；返回 true 时记录本次告警时间。
    pub fn should_warn(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let mut last = self.last.lock().unwrap_or_else(|p| p.into_inner());
        match last.get(&ip) {
            Some(at) if now.duration_since(*at) < self.window => false,
            _ => {
                last.insert(ip, now);
                true
            }
        }
    }

    /// 检查来源；拒绝时按节流规则告警。
    pub fn admit(&self, allow: &AllowList, ip: IpAddr, listener: &str) -> bool {
        if allow.allows(ip) {
            return true;
        }
        if self.should_warn(ip) {
            warn!(
                target: "devgw.ingest",
                listener = %listener,
                source = %ip,
                "push_source_rejected"
            );
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_list_allows_everything() {
        let allow = AllowList::parse("").expect("parse");
        assert!(allow.allows("10.1.2.3".parse().expect("ip")));
    }

    #[test]
    fn parse_reports_bad_entry() {
        let err = AllowList::parse("192.168.1.5, nonsense").expect_err("bad");
        assert_eq!(err, "nonsense");
    }

    #[test]
    fn throttle_warns_once_per_window() {
        let throttle = WarnThrottle::default();
        let ip: IpAddr = "192.168.1.99".parse().expect("ip");
        assert!(throttle.should_warn(ip));
        assert!(!throttle.should_warn(ip));
        assert!(throttle.should_warn("192.168.1.98".parse().expect("ip")));
    }

    #[test]
    fn zero_window_always_warns() {
        let throttle = WarnThrottle::new(Duration::ZERO);
        let ip: IpAddr = "::1".parse().expect("ip");
        assert!(throttle.should_warn(ip));
        assert!(throttle.should_warn(ip));
    }

    #[test]
    fn union_with_open_list_is_open() {
        let strict = AllowList::parse("10.0.0.1").expect("parse");
        assert!(strict.union(&AllowList::any()).is_open());
        let both = strict.union(&AllowList::parse("10.0.0.2").expect("parse"));
        assert!(both.allows("10.0.0.2".parse().expect("ip")));
        assert!(!both.allows("10.0.0.3".parse().expect("ip")));
    }
}
