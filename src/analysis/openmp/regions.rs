//! Generic start/end marker scan over a thread's event list.
//!
//! One pass per (start, end) marker pair produces the ordered, non-nested
//! region list used for omp-for bodies, single blocks, and friends. The
//! marker pair is an ordinary runtime parameter; the scan logic is
//! identical for every construct.

use crate::ir::summary::MarkerKind;
use crate::trace::{Event, EventId};

/// An inclusive interval `[start, end]` of event ids on one thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub start: EventId,
    pub end: EventId,
}

impl Region {
    pub fn contains(&self, event: EventId) -> bool {
        self.start <= event && event <= self.end
    }
}

/// Scan for non-nested `[start, end]` marker regions. The result is
/// ordered by end id, which the containment queries rely on for early
/// exit.
pub fn scan_regions(events: &[Event], start: MarkerKind, end: MarkerKind) -> Vec<Region> {
    let mut regions = Vec::new();
    let mut open: Option<EventId> = None;

    for event in events {
        let Some(marker) = event.marker() else { continue };
        if marker == start {
            debug_assert!(open.is_none(), "two region starts in a row");
            open.get_or_insert(event.id);
        } else if marker == end {
            debug_assert!(open.is_some(), "region end without matching start");
            if let Some(s) = open.take() {
                regions.push(Region {
                    start: s,
                    end: event.id,
                });
            }
        }
    }

    regions
}

/// Index of the region containing `event`, if any. Breaks early once the
/// scan passes the event id without a match.
pub fn region_index_containing(regions: &[Region], event: EventId) -> Option<usize> {
    for (i, region) in regions.iter().enumerate() {
        if region.contains(event) {
            return Some(i);
        }
        if region.end > event {
            return None;
        }
    }
    None
}

pub fn in_any_region(regions: &[Region], event: EventId) -> bool {
    region_index_containing(regions, event).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::summary::MarkerKind;
    use crate::ir::{FuncId, InstrId, InstrSite};
    use crate::trace::EventKind;

    fn marker_event(id: EventId, kind: MarkerKind) -> Event {
        Event {
            id,
            kind: EventKind::Marker(kind),
            site: InstrSite {
                func: FuncId(0),
                instr: InstrId(id as u32),
            },
        }
    }

    fn plain_event(id: EventId) -> Event {
        Event {
            id,
            kind: EventKind::ExternCall,
            site: InstrSite {
                func: FuncId(0),
                instr: InstrId(id as u32),
            },
        }
    }

    #[test]
    fn test_scan_finds_ordered_regions() {
        let events = vec![
            plain_event(0),
            marker_event(1, MarkerKind::ForInit),
            plain_event(2),
            marker_event(3, MarkerKind::ForFini),
            marker_event(4, MarkerKind::ForInit),
            marker_event(5, MarkerKind::ForFini),
        ];
        let regions = scan_regions(&events, MarkerKind::ForInit, MarkerKind::ForFini);
        assert_eq!(
            regions,
            vec![Region { start: 1, end: 3 }, Region { start: 4, end: 5 }]
        );
    }

    #[test]
    fn test_region_membership_is_exclusive() {
        let events = vec![
            marker_event(0, MarkerKind::SingleStart),
            plain_event(1),
            marker_event(2, MarkerKind::SingleEnd),
            plain_event(3),
            marker_event(4, MarkerKind::SingleStart),
            marker_event(5, MarkerKind::SingleEnd),
        ];
        let regions = scan_regions(&events, MarkerKind::SingleStart, MarkerKind::SingleEnd);

        // every event is in at most one region of this marker pair
        assert_eq!(region_index_containing(&regions, 1), Some(0));
        assert_eq!(region_index_containing(&regions, 3), None);
        assert_eq!(region_index_containing(&regions, 5), Some(1));
        assert!(!in_any_region(&regions, 3));
    }

    #[test]
    fn test_other_markers_are_ignored() {
        let events = vec![
            marker_event(0, MarkerKind::ForInit),
            marker_event(1, MarkerKind::SingleStart),
            marker_event(2, MarkerKind::SingleEnd),
            marker_event(3, MarkerKind::ForFini),
        ];
        let regions = scan_regions(&events, MarkerKind::ForInit, MarkerKind::ForFini);
        assert_eq!(regions, vec![Region { start: 0, end: 3 }]);
    }
}
