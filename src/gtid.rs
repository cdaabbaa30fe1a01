//! GTID (Global Transaction ID) 집합 관리
//!
//! MySQL 형식: `uuid:interval[:interval]...[,uuid:interval...]`
//! 예: "3e11fa47-71ca-11e1-9e33-c80aa9429562:1-5:7,b9b4712a-df64-11e3-b391-60672090eb04:1-3"
//!
//! 복제 재시작 커서로 사용되므로 파싱은 엄격하게 검증합니다.

use crate::error::{CdcError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// GTID 범위 (양 끝 포함)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GtidRange {
    pub start: u64,
    pub end: u64,
}

/// MySQL이 허용하는 최대 GNO
pub const MAX_GNO: u64 = i64::MAX as u64;

impl GtidRange {
    pub fn new(start: u64, end: u64) -> Result<Self> {
        if start == 0 || start > end || end > MAX_GNO {
            return Err(CdcError::GtidError(format!(
                "Invalid interval: {}-{}",
                start, end
            )));
        }
        Ok(GtidRange { start, end })
    }

    pub fn contains(&self, value: u64) -> bool {
        value >= self.start && value <= self.end
    }

    /// 겹치거나 연접한 범위 병합
    pub fn merge(&self, other: &GtidRange) -> Option<GtidRange> {
        if self.end.saturating_add(1) >= other.start && other.end.saturating_add(1) >= self.start {
            Some(GtidRange {
                start: self.start.min(other.start),
                end: self.end.max(other.end),
            })
        } else {
            None
        }
    }

    fn parse(s: &str) -> Result<Self> {
        let invalid = || CdcError::GtidError(format!("Invalid interval: {}", s));
        match s.split_once('-') {
            Some((start, end)) => {
                let start = start.trim().parse::<u64>().map_err(|_| invalid())?;
                let end = end.trim().parse::<u64>().map_err(|_| invalid())?;
                GtidRange::new(start, end)
            }
            None => {
                let seq = s.trim().parse::<u64>().map_err(|_| invalid())?;
                GtidRange::new(seq, seq)
            }
        }
    }
}

impl fmt::Display for GtidRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// UUID별 GTID 범위들 (정렬 + 병합 상태 유지)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UUIDGtidSet {
    pub uuid: Uuid,
    pub ranges: Vec<GtidRange>,
}

impl UUIDGtidSet {
    pub fn new(uuid: Uuid) -> Self {
        UUIDGtidSet {
            uuid,
            ranges: Vec::new(),
        }
    }

    pub fn add_range(&mut self, range: GtidRange) {
        self.ranges.push(range);
        self.ranges.sort();

        let mut merged: Vec<GtidRange> = Vec::with_capacity(self.ranges.len());
        for range in self.ranges.drain(..) {
            match merged.last_mut() {
                Some(last) => match last.merge(&range) {
                    Some(m) => *last = m,
                    None => merged.push(range),
                },
                None => merged.push(range),
            }
        }
        self.ranges = merged;
    }

    pub fn add_gtid(&mut self, sequence: u64) -> Result<()> {
        self.add_range(GtidRange::new(sequence, sequence)?);
        Ok(())
    }

    pub fn contains(&self, sequence: u64) -> bool {
        self.ranges.iter().any(|r| r.contains(sequence))
    }
}

impl fmt::Display for UUIDGtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uuid.hyphenated())?;
        for range in &self.ranges {
            write!(f, ":{}", range)?;
        }
        Ok(())
    }
}

/// 전체 GTID 집합 (여러 UUID)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GtidSet {
    pub sets: BTreeMap<Uuid, UUIDGtidSet>,
}

impl GtidSet {
    pub fn new() -> Self {
        GtidSet {
            sets: BTreeMap::new(),
        }
    }

    /// GTID 집합 문자열 파싱
    ///
    /// 빈 문자열은 빈 집합입니다. `SELECT @@gtid_executed` 결과처럼
    /// 콤마 뒤 줄바꿈이 들어간 형태도 허용합니다.
    pub fn parse(gtid_str: &str) -> Result<Self> {
        let mut gtid_set = GtidSet::new();

        let gtid_str = gtid_str.trim();
        if gtid_str.is_empty() {
            return Ok(gtid_set);
        }

        for part in gtid_str.split(',') {
            let part = part.trim();
            if part.is_empty() {
                return Err(CdcError::GtidError(format!(
                    "Empty UUID set in: {}",
                    gtid_str
                )));
            }

            let mut fields = part.split(':');
            let uuid_str = fields.next().unwrap_or_default().trim();
            let uuid = Uuid::parse_str(uuid_str)
                .map_err(|_| CdcError::GtidError(format!("Invalid server UUID: {}", uuid_str)))?;

            let mut has_interval = false;
            let uuid_set = gtid_set
                .sets
                .entry(uuid)
                .or_insert_with(|| UUIDGtidSet::new(uuid));
            for interval in fields {
                uuid_set.add_range(GtidRange::parse(interval)?);
                has_interval = true;
            }

            if !has_interval {
                return Err(CdcError::GtidError(format!(
                    "Missing interval for {}",
                    uuid_str
                )));
            }
        }

        Ok(gtid_set)
    }

    /// 단일 트랜잭션(uuid:gno) 추가
    pub fn add(&mut self, uuid: Uuid, gno: u64) -> Result<()> {
        self.sets
            .entry(uuid)
            .or_insert_with(|| UUIDGtidSet::new(uuid))
            .add_gtid(gno)
    }

    /// "uuid:gno" 형식의 단일 GTID 추가
    pub fn add_gtid(&mut self, gtid: &str) -> Result<()> {
        let (uuid, sequence) = gtid
            .split_once(':')
            .ok_or_else(|| CdcError::GtidError(format!("Invalid GTID format: {}", gtid)))?;

        let uuid = Uuid::parse_str(uuid.trim())
            .map_err(|_| CdcError::GtidError(format!("Invalid server UUID: {}", uuid)))?;
        let sequence = sequence
            .trim()
            .parse::<u64>()
            .map_err(|_| CdcError::GtidError(format!("Invalid sequence: {}", sequence)))?;

        self.add(uuid, sequence)
    }

    pub fn contains(&self, uuid: &Uuid, gno: u64) -> bool {
        self.sets.get(uuid).map_or(false, |set| set.contains(gno))
    }

    pub fn is_empty(&self) -> bool {
        self.sets.values().all(|set| set.ranges.is_empty())
    }
}

impl fmt::Display for GtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for uuid_set in self.sets.values().filter(|s| !s.ranges.is_empty()) {
            if !first {
                f.write_str(",")?;
            }
            write!(f, "{}", uuid_set)?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SID_A: &str = "3e11fa47-71ca-11e1-9e33-c80aa9429562";
    const SID_B: &str = "b9b4712a-df64-11e3-b391-60672090eb04";

    #[test]
    fn test_gtid_parse() {
        let gtid_str = format!("{}:1-100:200:300-400", SID_A);
        let gtid_set = GtidSet::parse(&gtid_str).unwrap();
        let uuid = Uuid::parse_str(SID_A).unwrap();

        assert_eq!(gtid_set.sets[&uuid].ranges.len(), 3);
        assert!(gtid_set.contains(&uuid, 50));
        assert!(gtid_set.contains(&uuid, 200));
        assert!(!gtid_set.contains(&uuid, 201));
        assert_eq!(gtid_set.to_string(), gtid_str);
    }

    #[test]
    fn test_gtid_parse_multiple_servers() {
        let gtid_str = format!("{}:1-5,\n{}:1-3", SID_A, SID_B);
        let gtid_set = GtidSet::parse(&gtid_str).unwrap();

        assert_eq!(gtid_set.sets.len(), 2);
        assert_eq!(gtid_set.to_string(), format!("{}:1-5,{}:1-3", SID_A, SID_B));
    }

    #[test]
    fn test_gtid_parse_empty() {
        assert!(GtidSet::parse("").unwrap().is_empty());
        assert!(GtidSet::parse("  \n").unwrap().is_empty());
    }

    #[test]
    fn test_gtid_parse_rejects_malformed() {
        assert!(GtidSet::parse("not-a-uuid:1-5").is_err());
        assert!(GtidSet::parse(SID_A).is_err());
        assert!(GtidSet::parse(&format!("{}:5-1", SID_A)).is_err());
        assert!(GtidSet::parse(&format!("{}:abc", SID_A)).is_err());
        assert!(GtidSet::parse(&format!("{}:1-5,", SID_A)).is_err());
    }

    #[test]
    fn test_gtid_rejects_gno_beyond_mysql_limit() {
        let max = format!("{}:1-{}", SID_A, MAX_GNO);
        assert_eq!(GtidSet::parse(&max).unwrap().to_string(), max);

        assert!(GtidSet::parse(&format!("{}:1-{}", SID_A, u64::MAX)).is_err());
        assert!(GtidSet::parse(&format!("{}:{}", SID_A, MAX_GNO + 1)).is_err());

        let uuid = Uuid::parse_str(SID_A).unwrap();
        assert!(GtidSet::new().add(uuid, u64::MAX).is_err());
    }

    #[test]
    fn test_gtid_add_merges_adjacent() {
        let mut gtid_set = GtidSet::new();
        gtid_set.add_gtid(&format!("{}:1", SID_A)).unwrap();
        gtid_set.add_gtid(&format!("{}:3", SID_A)).unwrap();
        assert_eq!(gtid_set.to_string(), format!("{}:1:3", SID_A));

        gtid_set.add_gtid(&format!("{}:2", SID_A)).unwrap();
        assert_eq!(gtid_set.to_string(), format!("{}:1-3", SID_A));
    }
}
