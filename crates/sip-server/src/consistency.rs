//! Per-block access tracking across workers within one program section.
//!
//! Within a section a distributed block may be read by any number of
//! workers, accumulated into by any number of workers, or used in any way
//! by exactly one worker. Any other mix is a program error: the block moves
//! to [`ConsistencyMode::Invalid`] and stays there until the next section.

use sip_types::{MessageType, SectionNumber, WorkerId};
use std::fmt;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsistencyMode {
    None,
    Read,
    Write,
    Accumulate,
    SingleWorker,
    Invalid,
}

/// Which worker(s) the current mode belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerClass {
    /// No access yet this section.
    Open,
    Rank(WorkerId),
    Multiple,
    Invalid,
}

/// The three kinds of data access a message can make.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Get,
    Put,
    Accumulate,
}

impl Access {
    fn of(message: MessageType) -> Option<Self> {
        match message {
            MessageType::Get => Some(Self::Get),
            MessageType::Put | MessageType::PutScale | MessageType::PutInitialize => {
                Some(Self::Put)
            }
            MessageType::PutAccumulate | MessageType::PutIncrement => Some(Self::Accumulate),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistributedBlockConsistency {
    mode: ConsistencyMode,
    worker: WorkerClass,
    last_section: SectionNumber,
}

impl Default for DistributedBlockConsistency {
    fn default() -> Self {
        Self {
            mode: ConsistencyMode::None,
            worker: WorkerClass::Open,
            last_section: SectionNumber(0),
        }
    }
}

impl DistributedBlockConsistency {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn mode(&self) -> ConsistencyMode {
        self.mode
    }

    #[must_use]
    pub fn worker(&self) -> WorkerClass {
        self.worker
    }

    #[must_use]
    pub fn last_section(&self) -> SectionNumber {
        self.last_section
    }

    /// Back to (None, Open), whatever the current state.
    pub fn reset_consistency_status(&mut self) {
        self.mode = ConsistencyMode::None;
        self.worker = WorkerClass::Open;
    }

    /// Record an access by `worker` in `section`. Returns false, leaving
    /// the block invalid for the rest of the section, when the access
    /// conflicts with earlier ones.
    pub fn update_and_check_consistency(
        &mut self,
        message: MessageType,
        worker: WorkerId,
        section: SectionNumber,
    ) -> bool {
        if section > self.last_section {
            self.reset_consistency_status();
            self.last_section = section;
        }
        if self.mode == ConsistencyMode::Invalid {
            return false;
        }
        let Some(access) = Access::of(message) else {
            return self.invalidate(message, worker);
        };
        match self.next_state(access, worker) {
            Some((mode, class)) => {
                self.mode = mode;
                self.worker = class;
                true
            }
            None => self.invalidate(message, worker),
        }
    }

    fn next_state(
        &self,
        access: Access,
        worker: WorkerId,
    ) -> Option<(ConsistencyMode, WorkerClass)> {
        use ConsistencyMode as M;
        let same = self.worker == WorkerClass::Rank(worker);
        let mine = WorkerClass::Rank(worker);
        match (self.mode, access) {
            (M::None, Access::Get) => Some((M::Read, mine)),
            (M::None, Access::Put) => Some((M::Write, mine)),
            (M::None, Access::Accumulate) => Some((M::Accumulate, mine)),

            (M::Read, Access::Get) if same => Some((M::Read, mine)),
            (M::Read, Access::Get) => Some((M::Read, WorkerClass::Multiple)),
            (M::Read, Access::Put | Access::Accumulate) if same => Some((M::SingleWorker, mine)),

            (M::Write | M::SingleWorker, _) if same => Some((M::SingleWorker, mine)),

            (M::Accumulate, Access::Accumulate) if same => Some((M::Accumulate, mine)),
            (M::Accumulate, Access::Accumulate) => Some((M::Accumulate, WorkerClass::Multiple)),
            (M::Accumulate, Access::Get | Access::Put) if same => Some((M::SingleWorker, mine)),

            _ => None,
        }
    }

    fn invalidate(&mut self, message: MessageType, worker: WorkerId) -> bool {
        warn!(
            ?message,
            worker = worker.0,
            previous = %self,
            "inconsistent block access"
        );
        self.mode = ConsistencyMode::Invalid;
        self.worker = WorkerClass::Invalid;
        false
    }
}

impl fmt::Display for DistributedBlockConsistency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self.mode {
            ConsistencyMode::None => "NONE",
            ConsistencyMode::Read => "READ",
            ConsistencyMode::Write => "WRITE",
            ConsistencyMode::Accumulate => "ACCUMULATE",
            ConsistencyMode::SingleWorker => "SINGLE_WORKER",
            ConsistencyMode::Invalid => "INVALID",
        };
        match self.worker {
            WorkerClass::Open => write!(f, "({mode}, OPEN)"),
            WorkerClass::Rank(w) => write!(f, "({mode}, {})", w.0),
            WorkerClass::Multiple => write!(f, "({mode}, MULTIPLE)"),
            WorkerClass::Invalid => write!(f, "({mode}, INVALID)"),
        }?;
        write!(f, " section {}", self.last_section.0)
    }
}
