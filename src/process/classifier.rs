//! Mapping classification for grouping a process snapshot into memory categories.
//!
//! The kernel reports one mapping per protection change, so a single shared
//! object shows up as several ranges: code (`r-xp`), read-only data (`r--p`),
//! data (`rw-p`) and an anonymous `rw-p` range right after it for `.bss`.
//! [`group`] folds those fragments back under the library name and sorts the
//! rest into thread stacks, heap, sockets and anonymous memory.

use ahash::AHashMap as HashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::process::memory::{SmapsRange, StatM};

const STACK_PREFIX: &str = "[stack";
const SOCKET_PREFIX: &str = "socket:";
const HEAP_NAME: &str = "[heap]";

const PERM_EXEC_PRIVATE: &str = "r-xp";
const PERM_READ_PRIVATE: &str = "r--p";
const PERM_WRITE_PRIVATE: &str = "rw-p";

/// Which per-process memory figure a query or grouping uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryType {
    Rss,
    #[default]
    Pss,
    /// Resident size as reported by statm; ranges are grouped by RSS.
    #[serde(rename = "statm")]
    StatmRss,
}

impl MemoryType {
    /// Value of one range under this memory type, in KiB.
    pub fn range_value(self, range: &SmapsRange) -> u64 {
        match self {
            MemoryType::Pss => range.pss,
            MemoryType::Rss | MemoryType::StatmRss => range.rss,
        }
    }
}

impl fmt::Display for MemoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryType::Rss => f.write_str("rss"),
            MemoryType::Pss => f.write_str("pss"),
            MemoryType::StatmRss => f.write_str("statm"),
        }
    }
}

impl FromStr for MemoryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rss" => Ok(MemoryType::Rss),
            "pss" => Ok(MemoryType::Pss),
            "statm" => Ok(MemoryType::StatmRss),
            other => Err(format!(
                "Invalid memory type '{}', expected 'rss', 'pss' or 'statm'",
                other
            )),
        }
    }
}

/// Size of one named mapping group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingSize {
    pub name: String,
    pub size: u64,
}

/// Semantic grouping of one measurement. Sizes in KiB.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MeasurementGroups {
    pub thread_stacks: u64,
    pub heap: u64,
    pub anonymous: u64,
    pub sockets: u64,
    pub sum: u64,
    pub statm: StatM,
    pub mappings: HashMap<String, u64>,
}

impl MeasurementGroups {
    /// Named mappings, largest first (ties by name).
    pub fn sorted_mappings(&self) -> Vec<MappingSize> {
        let mut out: Vec<MappingSize> = self
            .mappings
            .iter()
            .map(|(name, size)| MappingSize {
                name: name.clone(),
                size: *size,
            })
            .collect();
        out.sort_by(|a, b| b.size.cmp(&a.size).then_with(|| a.name.cmp(&b.name)));
        out
    }

    /// Sum of every named mapping group.
    pub fn mappings_total(&self) -> u64 {
        self.mappings.values().sum()
    }
}

/// Most recent executable segment of a named file and where it ends.
struct LibraryAnchor<'a> {
    name: &'a str,
    to: u64,
}

/// Groups `ranges`, in their observed order, into semantic buckets.
///
/// Zero-sized entries (under `memory_type`) are skipped entirely. Socket
/// mappings get their own bucket only when `group_sockets` is set; otherwise
/// they are grouped by name like any file.
pub fn group(
    ranges: &[SmapsRange],
    statm: StatM,
    memory_type: MemoryType,
    group_sockets: bool,
) -> MeasurementGroups {
    let mut groups = MeasurementGroups {
        statm,
        ..Default::default()
    };
    let mut anchor: Option<LibraryAnchor<'_>> = None;

    for range in ranges {
        let value = memory_type.range_value(range);
        if value == 0 {
            continue;
        }
        groups.sum += value;

        let key = &range.key;
        let name = key.name.as_str();
        let permission = key.permission.as_str();

        if name.starts_with(STACK_PREFIX) {
            groups.thread_stacks += value;
        } else if group_sockets && name.starts_with(SOCKET_PREFIX) {
            groups.sockets += value;
        } else if name == HEAP_NAME {
            groups.heap += value;
        } else if name.is_empty() {
            match anchor.take() {
                // .bss right behind the library's data segment
                Some(lib) if lib.to == key.from && permission == PERM_WRITE_PRIVATE => {
                    *groups.mappings.entry(lib.name.to_string()).or_insert(0) += value;
                }
                other => {
                    anchor = other;
                    groups.anonymous += value;
                }
            }
        } else {
            if permission == PERM_EXEC_PRIVATE {
                anchor = Some(LibraryAnchor { name, to: key.to });
            } else if (permission == PERM_READ_PRIVATE || permission == PERM_WRITE_PRIVATE)
                && anchor.as_ref().is_some_and(|lib| lib.name == name)
            {
                if let Some(lib) = anchor.as_mut() {
                    lib.to = key.to;
                }
            } else {
                anchor = None;
            }
            *groups.mappings.entry(name.to_string()).or_insert(0) += value;
        }
    }

    groups
}
