use chrono::NaiveDate;
use tracing::debug;

use super::estimate::{months_between, OffsetEstimator};
use super::{DateWindow, Direction};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowState {
    Before,
    Inside,
    After,
}

/// What the driver should do with the tile at the current offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Skip(usize),
    Backtrack(usize),
    Process,
    Stop,
}

#[derive(Debug, Clone, Copy)]
pub struct WindowPolicy {
    pub backtrack_amount: usize,
    /// Consecutive too-old tiles tolerated inside a newest-first run.
    pub exit_streak: u32,
}

/// Where a date sits relative to the window, seen from the direction of travel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    /// Not reached yet.
    Approach,
    Inside,
    /// Already travelled past.
    Passed,
}

pub struct WindowTracker {
    window: DateWindow,
    direction: Direction,
    policy: WindowPolicy,
    estimator: OffsetEstimator,
    state: WindowState,
    skip: usize,
    exit_count: u32,
    /// Highest offset seen on the approach side.
    last_approach: Option<usize>,
    /// Lowest offset seen past the window while still approaching.
    overshoot: Option<usize>,
}

impl WindowTracker {
    pub fn new(
        window: DateWindow,
        direction: Direction,
        policy: WindowPolicy,
        estimator: OffsetEstimator,
    ) -> Self {
        let state = if window.is_bounded() {
            WindowState::Before
        } else {
            WindowState::Inside
        };
        Self {
            window,
            direction,
            policy,
            estimator,
            state,
            skip: 1,
            exit_count: 0,
            last_approach: None,
            overshoot: None,
        }
    }

    pub fn state(&self) -> WindowState {
        self.state
    }

    /// Current fast-forward magnitude.
    pub fn skip(&self) -> usize {
        self.skip
    }

    /// The boundary a traversal reaches first.
    pub fn near_boundary(&self) -> Option<NaiveDate> {
        match self.direction {
            Direction::NewestFirst => self.window.end,
            Direction::OldestFirst => self.window.start,
        }
    }

    fn side(&self, date: NaiveDate) -> Side {
        let (approach, passed) = match self.direction {
            Direction::NewestFirst => (
                self.window.end.is_some_and(|e| date > e),
                self.window.start.is_some_and(|s| date < s),
            ),
            Direction::OldestFirst => (
                self.window.start.is_some_and(|s| date < s),
                self.window.end.is_some_and(|e| date > e),
            ),
        };
        if approach {
            Side::Approach
        } else if passed {
            Side::Passed
        } else {
            Side::Inside
        }
    }

    /// Room between the last approach-side offset and `offset`.
    fn room_behind(&self, offset: usize) -> usize {
        let floor = self.last_approach.map_or(0, |o| o + 1);
        offset.saturating_sub(floor)
    }

    /// Never zero, so a backtrack always moves.
    fn backtrack(&self, room: usize) -> usize {
        room.min(self.policy.backtrack_amount.max(1))
    }

    /// Feed the date of the tile at `offset`. `None` means the date could not
    /// be read; such tiles are always processed.
    pub fn observe(&mut self, offset: usize, date: Option<NaiveDate>) -> Decision {
        if self.state == WindowState::After {
            return Decision::Stop;
        }
        let Some(date) = date else {
            return Decision::Process;
        };

        let decision = match self.state {
            WindowState::Before => self.observe_before(offset, date),
            WindowState::Inside => self.observe_inside(date),
            WindowState::After => Decision::Stop,
        };
        debug!("offset {} date {} -> {:?} ({:?})", offset, date, decision, self.state);
        decision
    }

    fn observe_before(&mut self, offset: usize, date: NaiveDate) -> Decision {
        match self.side(date) {
            Side::Approach => {
                self.last_approach = Some(self.last_approach.map_or(offset, |o| o.max(offset)));
                let months = self
                    .near_boundary()
                    .map_or(0, |boundary| months_between(date, boundary));
                let mut skip = self.estimator.skip_for_months(months);
                // Never jump onto or past a known overshoot again.
                if let Some(over) = self.overshoot {
                    skip = skip.min(over.saturating_sub(offset + 1)).max(1);
                }
                self.skip = skip;
                Decision::Skip(skip)
            }
            Side::Passed => {
                self.overshoot = Some(self.overshoot.map_or(offset, |o| o.min(offset)));
                match self.room_behind(offset) {
                    0 => {
                        self.state = WindowState::After;
                        Decision::Stop
                    }
                    room => Decision::Backtrack(self.backtrack(room)),
                }
            }
            Side::Inside => {
                self.state = WindowState::Inside;
                self.exit_count = 0;
                match self.room_behind(offset) {
                    0 => Decision::Process,
                    room => Decision::Backtrack(self.backtrack(room)),
                }
            }
        }
    }

    fn observe_inside(&mut self, date: NaiveDate) -> Decision {
        match self.side(date) {
            Side::Inside => {
                self.exit_count = 0;
                Decision::Process
            }
            Side::Approach => Decision::Skip(1),
            Side::Passed => match self.direction {
                Direction::OldestFirst => {
                    self.state = WindowState::After;
                    Decision::Stop
                }
                Direction::NewestFirst => {
                    self.exit_count += 1;
                    if self.exit_count >= self.policy.exit_streak {
                        self.state = WindowState::After;
                        Decision::Stop
                    } else {
                        Decision::Skip(1)
                    }
                }
            },
        }
    }
}
