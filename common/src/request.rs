use std::collections::BTreeSet;
use std::fmt;
use std::iter::FromIterator;

/// Collector asks for every artifact it doesn't have yet.
pub const BLOCK_PULL_CLASSES: u8 = 0x16;
/// Collector asks only for the classes dumped by the running process.
pub const BLOCK_PULL_RUNNING_CLASSES: u8 = 0x17;
/// Acknowledges a command; terminates the remote reader loop.
pub const BLOCK_CMD_OK: u8 = 0x20;
/// Asks the agent to dump and/or reset its execution data.
pub const BLOCK_CMD_DUMP: u8 = 0x40;

#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub enum PullKind {
    Classes,
    RunningClasses,
}

impl PullKind {
    pub fn tag(self) -> u8 {
        match self {
            PullKind::Classes => BLOCK_PULL_CLASSES,
            PullKind::RunningClasses => BLOCK_PULL_RUNNING_CLASSES,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            BLOCK_PULL_CLASSES => Some(PullKind::Classes),
            BLOCK_PULL_RUNNING_CLASSES => Some(PullKind::RunningClasses),
            _ => None,
        }
    }
}

/// Identifiers of the artifacts the collector already has.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct KnownIds(BTreeSet<String>);

impl KnownIds {
    pub fn new() -> Self {
        KnownIds(BTreeSet::new())
    }

    /// Parses the `|`-delimited wire form; an empty string means nothing is known.
    pub fn parse(list: &str) -> Self {
        list.split('|')
            .filter(|id| !id.is_empty())
            .map(|id| id.to_owned())
            .collect()
    }

    pub fn insert<S: Into<String>>(&mut self, id: S) -> bool {
        self.0.insert(id.into())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.0.contains(id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|id| id.as_str())
    }
}

impl fmt::Display for KnownIds {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        for (index, id) in self.0.iter().enumerate() {
            if index != 0 {
                formatter.write_str("|")?;
            }
            formatter.write_str(id)?;
        }

        Ok(())
    }
}

impl<S: Into<String>> FromIterator<S> for KnownIds {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        KnownIds(iter.into_iter().map(|id| id.into()).collect())
    }
}

#[derive(Clone, PartialEq, Debug)]
pub struct PullRequest {
    pub kind: PullKind,
    pub known: KnownIds,
}

#[test]
fn test_known_ids_wire_form() {
    assert!(KnownIds::parse("").is_empty());

    let ids = KnownIds::parse("b2|a1||c3");
    assert_eq!(ids.len(), 3);
    assert!(ids.contains("a1"));
    assert!(!ids.contains(""));
    assert_eq!(ids.to_string(), "a1|b2|c3");
    assert_eq!(KnownIds::parse(&ids.to_string()), ids);
}

#[test]
fn test_pull_kind_tags() {
    assert_eq!(PullKind::from_tag(0x16), Some(PullKind::Classes));
    assert_eq!(PullKind::from_tag(0x17), Some(PullKind::RunningClasses));
    assert_eq!(PullKind::from_tag(0x20), None);
    assert_eq!(PullKind::RunningClasses.tag(), BLOCK_PULL_RUNNING_CLASSES);
}
