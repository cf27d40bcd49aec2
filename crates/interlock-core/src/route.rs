//! Partial path routes: the concrete, ordered list of section traversals a
//! signal tries to reserve.
//!
//! [`build_route`] turns a requested list of sections into a
//! [`PartialPathRoute`], resolving each hop to a (section, direction) pair,
//! recording the junction alignment each traversal needs, and tagging runs
//! through deadlock groups with alternative-path markers. It reads only the
//! static network; reservation happens in the signal logic.

use crate::id::{DeadlockId, PathId, SectionId};
use crate::network::{Direction, Pin, SectionKind, TrackNetwork};
use serde::{Deserialize, Serialize};

/// Reference to one alternative path of a deadlock group, and whether the
/// route traverses it against its defined direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AltMarker {
    pub group: DeadlockId,
    pub path: PathId,
    pub reversed: bool,
}

/// One traversal of one section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteElement {
    pub section: SectionId,
    pub direction: Direction,
    /// Junction entered from its single-pin side.
    pub facing_point: bool,
    /// Branch a junction must be set to, or the lane used through a
    /// crossover. `None` for plain track and for a facing junction at the
    /// very end of the route.
    pub alignment: Option<u8>,
    pub alt_start: Option<AltMarker>,
    pub alt_end: Option<AltMarker>,
}

impl RouteElement {
    pub fn new(section: SectionId, direction: Direction) -> Self {
        Self {
            section,
            direction,
            facing_point: false,
            alignment: None,
            alt_start: None,
            alt_end: None,
        }
    }

    pub fn pin(&self) -> Pin {
        Pin::new(self.section, self.direction)
    }
}

/// An ordered, contiguous stretch of route elements.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialPathRoute {
    pub elements: Vec<RouteElement>,
}

impl PartialPathRoute {
    pub fn new(elements: Vec<RouteElement>) -> Self {
        Self { elements }
    }

    /// A marker-free route following `pins` exactly.
    pub fn from_pins(pins: &[Pin]) -> Self {
        Self {
            elements: pins
                .iter()
                .map(|p| RouteElement::new(p.section, p.direction))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn first(&self) -> Option<&RouteElement> {
        self.elements.first()
    }

    pub fn last(&self) -> Option<&RouteElement> {
        self.elements.last()
    }

    pub fn sections(&self) -> impl Iterator<Item = SectionId> + '_ {
        self.elements.iter().map(|e| e.section)
    }

    pub fn contains(&self, section: SectionId) -> bool {
        self.elements.iter().any(|e| e.section == section)
    }

    pub fn position(&self, section: SectionId) -> Option<usize> {
        self.elements.iter().position(|e| e.section == section)
    }

    /// Split after `index`, returning the tail. `self` keeps `..=index`.
    pub fn split_after(&mut self, index: usize) -> PartialPathRoute {
        if index + 1 >= self.elements.len() {
            return PartialPathRoute::default();
        }
        PartialPathRoute {
            elements: self.elements.split_off(index + 1),
        }
    }
}

/// Route construction failures. Reported to the caller, never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("empty path")]
    EmptyPath,
    #[error("unknown section {0:?}")]
    UnknownSection(SectionId),
    #[error("no connection from {from:?} to {to:?}")]
    BrokenPath { from: SectionId, to: SectionId },
    #[error("run through deadlock group {group:?} starting at {section:?} matches no alternative")]
    NoMatchingAlternative { group: DeadlockId, section: SectionId },
}

pub(crate) fn is_junction(network: &TrackNetwork, section: SectionId) -> bool {
    network
        .section(section)
        .is_some_and(|d| d.kind == SectionKind::Junction)
}

/// Build the route that starts beyond `entry` (a signal's section and
/// direction) and follows `path`. A leading repeat of the entry section is
/// ignored.
pub fn build_route(
    network: &TrackNetwork,
    entry: Pin,
    path: &[SectionId],
) -> Result<PartialPathRoute, RouteError> {
    network
        .section(entry.section)
        .ok_or(RouteError::UnknownSection(entry.section))?;
    let path = match path.first() {
        Some(first) if *first == entry.section => &path[1..],
        _ => path,
    };
    if path.is_empty() {
        return Err(RouteError::EmptyPath);
    }

    let mut elements: Vec<RouteElement> = Vec::with_capacity(path.len());
    let mut current = entry;
    // Lane through the section we are currently leaving, for crossovers.
    let mut current_lane: Option<u8> = None;

    for &next in path {
        network
            .section(next)
            .ok_or(RouteError::UnknownSection(next))?;
        let def = network
            .section(current.section)
            .ok_or(RouteError::UnknownSection(current.section))?;
        let exits = def.exits(current.direction);
        let Some(branch) = exits.iter().position(|p| p.section == next) else {
            return Err(RouteError::BrokenPath {
                from: current.section,
                to: next,
            });
        };

        match def.kind {
            SectionKind::Crossover => {
                if current_lane.is_some_and(|lane| lane as usize != branch) {
                    return Err(RouteError::BrokenPath {
                        from: current.section,
                        to: next,
                    });
                }
            }
            SectionKind::Junction if def.facing_direction() == Some(current.direction) => {
                if let Some(last) = elements.last_mut() {
                    last.alignment = Some(branch as u8);
                }
            }
            _ => {}
        }

        let pin = exits[branch];
        let mut element = RouteElement::new(pin.section, pin.direction);
        current_lane = None;
        if let Some(next_def) = network.section(pin.section) {
            // Lane or trailing branch is fixed by the side we enter from.
            let back = Pin::new(current.section, current.direction.reverse());
            let entry_index = next_def
                .exits(pin.direction.reverse())
                .iter()
                .position(|p| *p == back);
            match next_def.kind {
                SectionKind::Crossover => {
                    element.alignment = entry_index.map(|i| i as u8);
                    current_lane = element.alignment;
                }
                SectionKind::Junction => {
                    if next_def.facing_direction() == Some(pin.direction) {
                        element.facing_point = true;
                    } else {
                        element.alignment = entry_index.map(|i| i as u8);
                    }
                }
                _ => {}
            }
        }
        elements.push(element);
        current = pin;
    }

    mark_alternatives(network, &mut elements)?;
    Ok(PartialPathRoute { elements })
}

/// Tag every run of elements through a deadlock group with the alternative
/// it follows. A run cut off by the route's start or end may match part of
/// an alternative.
fn mark_alternatives(
    network: &TrackNetwork,
    elements: &mut [RouteElement],
) -> Result<(), RouteError> {
    for (g, group) in network.deadlock_groups().iter().enumerate() {
        let gid = DeadlockId(g as u32);
        let in_group = |e: &RouteElement| network.group_of(e.section) == Some(gid);

        let mut i = 0;
        while i < elements.len() {
            if !in_group(&elements[i]) {
                i += 1;
                continue;
            }
            let start = i;
            while i < elements.len() && in_group(&elements[i]) {
                i += 1;
            }
            let end = i - 1;
            let run: Vec<Pin> = elements[start..=end].iter().map(RouteElement::pin).collect();
            let at_route_start = start == 0;
            let at_route_end = end == elements.len() - 1;

            let mut marker = None;
            'paths: for (p, alt) in group.paths.iter().enumerate() {
                for reversed in [false, true] {
                    let candidate: Vec<Pin> = if reversed {
                        alt.sections.iter().rev().map(|p| p.reversed()).collect()
                    } else {
                        alt.sections.clone()
                    };
                    if run_matches(&run, &candidate, at_route_start, at_route_end) {
                        marker = Some(AltMarker {
                            group: gid,
                            path: PathId(p as u32),
                            reversed,
                        });
                        break 'paths;
                    }
                }
            }
            let Some(marker) = marker else {
                return Err(RouteError::NoMatchingAlternative {
                    group: gid,
                    section: elements[start].section,
                });
            };
            elements[start].alt_start = Some(marker);
            elements[end].alt_end = Some(marker);
        }
    }
    Ok(())
}

fn run_matches(run: &[Pin], candidate: &[Pin], open_start: bool, open_end: bool) -> bool {
    if run.len() > candidate.len() {
        return false;
    }
    match (open_start, open_end) {
        (false, false) => run == candidate,
        (false, true) => candidate.starts_with(run),
        (true, false) => candidate.ends_with(run),
        (true, true) => candidate.windows(run.len()).any(|w| w == run),
    }
}
