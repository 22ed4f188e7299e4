//! GTID (Global Transaction ID) 관리
//!
//! GTID 형식: UUID:sequence-number
//! 여러 서버의 GTID 집합을 추적: "uuid1:1-100:200,uuid2:1-50"

use crate::error::{CdcError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// 단일 트랜잭션 식별자
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Gtid {
    pub sid: Uuid,
    pub gno: u64,
}

impl Gtid {
    pub fn new(sid: Uuid, gno: u64) -> Self {
        Gtid { sid, gno }
    }
}

impl fmt::Display for Gtid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.sid.hyphenated(), self.gno)
    }
}

impl FromStr for Gtid {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self> {
        let (sid, gno) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| CdcError::GtidError(format!("Invalid GTID format: {}", s)))?;
        let sid = parse_sid(sid)?;
        let gno = parse_gno(gno, s)?;
        Ok(Gtid { sid, gno })
    }
}

/// GTID 범위 (양 끝 포함)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct GtidRange {
    pub start: u64,
    pub end: u64,
}

impl GtidRange {
    pub fn new(start: u64, end: u64) -> Result<Self> {
        if start == 0 {
            return Err(CdcError::GtidError(
                "Invalid range: sequence numbers start at 1".to_string(),
            ));
        }
        if start > end {
            return Err(CdcError::GtidError(format!(
                "Invalid range: start {} > end {}",
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

/// UUID별 GTID 범위들 (정렬, 병합된 상태 유지)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UuidSet {
    pub sid: Uuid,
    ranges: Vec<GtidRange>,
}

impl UuidSet {
    pub fn new(sid: Uuid) -> Self {
        UuidSet {
            sid,
            ranges: Vec::new(),
        }
    }

    pub fn ranges(&self) -> &[GtidRange] {
        &self.ranges
    }

    pub fn add_range(&mut self, range: GtidRange) {
        self.ranges.push(range);
        self.coalesce();
    }

    pub fn add_gno(&mut self, gno: u64) -> Result<()> {
        self.add_range(GtidRange::new(gno, gno)?);
        Ok(())
    }

    pub fn contains(&self, gno: u64) -> bool {
        self.ranges.iter().any(|r| r.contains(gno))
    }

    fn coalesce(&mut self) {
        self.ranges.sort();
        let mut merged: Vec<GtidRange> = Vec::with_capacity(self.ranges.len());
        for range in std::mem::take(&mut self.ranges) {
            if let Some(last) = merged.last_mut() {
                if let Some(joined) = last.merge(&range) {
                    *last = joined;
                    continue;
                }
            }
            merged.push(range);
        }
        self.ranges = merged;
    }
}

impl fmt::Display for UuidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.sid.hyphenated())?;
        for range in &self.ranges {
            write!(f, ":{}", range)?;
        }
        Ok(())
    }
}

impl FromStr for UuidSet {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.trim().split(':');
        let sid = parse_sid(parts.next().unwrap_or_default())?;
        let mut uuid_set = UuidSet::new(sid);

        for interval in parts {
            let interval = interval.trim();
            let range = match interval.split_once('-') {
                Some((start, end)) => GtidRange::new(parse_gno(start, s)?, parse_gno(end, s)?)?,
                None => {
                    let gno = parse_gno(interval, s)?;
                    GtidRange::new(gno, gno)?
                }
            };
            uuid_set.ranges.push(range);
        }

        if uuid_set.ranges.is_empty() {
            return Err(CdcError::GtidError(format!("Missing interval: {}", s)));
        }
        uuid_set.coalesce();
        Ok(uuid_set)
    }
}

/// 전체 GTID 집합 (여러 UUID)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GtidSet {
    sets: BTreeMap<Uuid, UuidSet>,
}

impl GtidSet {
    pub fn new() -> Self {
        GtidSet {
            sets: BTreeMap::new(),
        }
    }

    /// GTID 문자열 파싱 (format: "uuid1:1-100:200,uuid2:1-50")
    pub fn parse(gtid_str: &str) -> Result<Self> {
        let mut gtid_set = GtidSet::new();

        let trimmed = gtid_str.trim();
        if trimmed.is_empty() {
            return Ok(gtid_set);
        }

        for part in trimmed.split(',') {
            let uuid_set: UuidSet = part.parse()?;
            match gtid_set.sets.get_mut(&uuid_set.sid) {
                Some(existing) => {
                    for range in uuid_set.ranges {
                        existing.add_range(range);
                    }
                }
                None => {
                    gtid_set.sets.insert(uuid_set.sid, uuid_set);
                }
            }
        }

        Ok(gtid_set)
    }

    /// 트랜잭션 하나만큼 집합을 전진시킵니다.
    pub fn merge_one(&mut self, gtid: &Gtid) -> Result<()> {
        self.sets
            .entry(gtid.sid)
            .or_insert_with(|| UuidSet::new(gtid.sid))
            .add_gno(gtid.gno)
    }

    pub fn contains(&self, gtid: &Gtid) -> bool {
        self.sets
            .get(&gtid.sid)
            .map(|set| set.contains(gtid.gno))
            .unwrap_or(false)
    }

    pub fn uuid_sets(&self) -> impl Iterator<Item = &UuidSet> {
        self.sets.values()
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

impl FromStr for GtidSet {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self> {
        GtidSet::parse(s)
    }
}

impl Serialize for GtidSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for GtidSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        GtidSet::parse(&text).map_err(serde::de::Error::custom)
    }
}

fn parse_sid(sid: &str) -> Result<Uuid> {
    Uuid::parse_str(sid.trim())
        .map_err(|e| CdcError::GtidError(format!("Invalid server uuid {:?}: {}", sid, e)))
}

fn parse_gno(gno: &str, full: &str) -> Result<u64> {
    gno.trim()
        .parse::<u64>()
        .map_err(|_| CdcError::GtidError(format!("Invalid sequence {:?} in {}", gno, full)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SID1: &str = "550e8400-e29b-41d4-a716-446655440000";
    const SID2: &str = "3e11fa47-71ca-11e1-9e33-c80aa9429562";

    fn gtid(sid: &str, gno: u64) -> Gtid {
        Gtid::new(Uuid::parse_str(sid).unwrap(), gno)
    }

    #[test]
    fn test_gtid_parse() {
        let text = format!("{}:1-100:200:300-400", SID1);
        let gtid_set = GtidSet::parse(&text).unwrap();
        assert!(gtid_set.contains(&gtid(SID1, 50)));
        assert!(gtid_set.contains(&gtid(SID1, 200)));
        assert!(!gtid_set.contains(&gtid(SID1, 150)));
        assert_eq!(gtid_set.to_string(), text);
    }

    #[test]
    fn test_gtid_parse_multiple_sources() {
        let text = format!("{}:1-5,\n {}:1-3", SID2.to_uppercase(), SID1);
        let gtid_set = GtidSet::parse(&text).unwrap();
        assert_eq!(gtid_set.uuid_sets().count(), 2);
        assert!(gtid_set.contains(&gtid(SID2, 5)));
        assert!(gtid_set.contains(&gtid(SID1, 3)));
        // BTreeMap 순서 (uuid 오름차순), 소문자 출력
        assert_eq!(gtid_set.to_string(), format!("{}:1-5,{}:1-3", SID2, SID1));
    }

    #[test]
    fn test_gtid_parse_empty() {
        assert!(GtidSet::parse("").unwrap().is_empty());
        assert!(GtidSet::parse("  \n").unwrap().is_empty());
    }

    #[test]
    fn test_gtid_parse_malformed() {
        assert!(GtidSet::parse("not-a-uuid:1-2").is_err());
        assert!(GtidSet::parse(&format!("{}", SID1)).is_err());
        assert!(GtidSet::parse(&format!("{}:5-3", SID1)).is_err());
        assert!(GtidSet::parse(&format!("{}:0", SID1)).is_err());
        assert!(GtidSet::parse(&format!("{}:1-x", SID1)).is_err());
        assert!(GtidSet::parse(&format!("{}:1,", SID1)).is_err());
    }

    #[test]
    fn test_gtid_merge_one() {
        let mut gtid_set = GtidSet::parse(&format!("{}:1-3:5", SID1)).unwrap();
        gtid_set.merge_one(&gtid(SID1, 4)).unwrap();
        assert_eq!(gtid_set.to_string(), format!("{}:1-5", SID1));

        gtid_set.merge_one(&gtid(SID2, 1)).unwrap();
        assert!(gtid_set.contains(&gtid(SID2, 1)));

        // 이미 포함된 GTID는 변화 없음
        let before = gtid_set.clone();
        gtid_set.merge_one(&gtid(SID1, 2)).unwrap();
        assert_eq!(gtid_set, before);
    }

    #[test]
    fn test_gtid_clone_is_independent() {
        let mut running = GtidSet::parse(&format!("{}:1-10", SID1)).unwrap();
        let snapshot = running.clone();
        running.merge_one(&gtid(SID1, 11)).unwrap();
        assert!(!snapshot.contains(&gtid(SID1, 11)));
        assert!(running.contains(&gtid(SID1, 11)));
    }

    #[test]
    fn test_gtid_display_and_from_str() {
        let g: Gtid = format!("{}:42", SID1).parse().unwrap();
        assert_eq!(g, gtid(SID1, 42));
        assert_eq!(g.to_string(), format!("{}:42", SID1));
        assert!("no-colon".parse::<Gtid>().is_err());
    }

    #[test]
    fn test_gtid_set_serde() {
        let gtid_set = GtidSet::parse(&format!("{}:1-7", SID1)).unwrap();
        let json = serde_json::to_string(&gtid_set).unwrap();
        assert_eq!(json, format!("\"{}:1-7\"", SID1));
        let back: GtidSet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, gtid_set);
    }
}
