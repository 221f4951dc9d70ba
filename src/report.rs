//! Race report: ordered, deduplicated pairs of conflicting accesses.

use std::fmt;

use serde::Serialize;

use crate::ir::SourceLoc;
use crate::trace::{EventRef, ProgramTrace};

/// One side of a reported race. Location is the primary key: reports are
/// ordered and deduplicated by source position, not by thread identity.
#[derive(Debug, Clone, Serialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct RaceAccess {
    pub loc: Option<SourceLoc>,
    pub thread: u32,
}

/// A write racing with another access. `first`/`second` are ordered by
/// location so reports compare stably.
#[derive(Debug, Clone, Serialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct Race {
    pub first: RaceAccess,
    pub second: RaceAccess,
}

impl Race {
    fn new(mut first: RaceAccess, mut second: RaceAccess) -> Self {
        if second < first {
            std::mem::swap(&mut first, &mut second);
        }
        Race { first, second }
    }
}

impl fmt::Display for Race {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let loc = |access: &RaceAccess| match &access.loc {
            Some(loc) => loc.to_string(),
            None => "<unknown>".to_string(),
        };
        write!(f, "{} {}", loc(&self.first), loc(&self.second))
    }
}

/// Collects candidate pairs during detection.
#[derive(Default)]
pub struct Reporter {
    races: Vec<Race>,
}

impl Reporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn collect(&mut self, program: &ProgramTrace, write: EventRef, other: EventRef) {
        let access = |eref: EventRef| {
            let event = program.event(eref);
            RaceAccess {
                thread: eref.thread.0,
                loc: program.module.loc_of(event.site).cloned(),
            }
        };
        self.races.push(Race::new(access(write), access(other)));
    }

    /// Finalize into a sorted report, deduplicated by location pair.
    pub fn into_report(self) -> Report {
        let mut races = self.races;
        races.sort();
        races.dedup_by(|a, b| a.first.loc == b.first.loc && a.second.loc == b.second.loc);
        Report { races }
    }
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct Report {
    races: Vec<Race>,
}

impl Report {
    pub fn races(&self) -> &[Race] {
        &self.races
    }

    pub fn is_empty(&self) -> bool {
        self.races.is_empty()
    }

    pub fn len(&self) -> usize {
        self.races.len()
    }

    /// True if some race matches the two `file:line:col` strings, in either
    /// order. Test helper.
    pub fn contains_loc_pair(&self, a: &str, b: &str) -> bool {
        let loc_str = |loc: &Option<SourceLoc>| {
            loc.as_ref().map(|l| l.to_string()).unwrap_or_default()
        };
        self.races.iter().any(|race| {
            let (first, second) = (loc_str(&race.first.loc), loc_str(&race.second.loc));
            (first == a && second == b) || (first == b && second == a)
        })
    }

    /// Keep only races whose formatted locations match the pattern.
    pub fn filtered(&self, pattern: &regex::Regex) -> Report {
        Report {
            races: self
                .races
                .iter()
                .filter(|race| pattern.is_match(&race.to_string()))
                .cloned()
                .collect(),
        }
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.races.is_empty() {
            return writeln!(f, "No races detected");
        }
        writeln!(f, "==== Detected {} race(s) ====", self.races.len())?;
        for race in &self.races {
            writeln!(f, "{race}  (T{} / T{})", race.first.thread, race.second.thread)?;
        }
        Ok(())
    }
}
