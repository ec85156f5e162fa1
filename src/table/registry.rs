//! Registry of cached tables
//!
//! Holds every table spec with its generation cell. The set of tables is fixed when
//! the registry is created; all tables share one epoch.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::epoch::LightEpoch;
use crate::table::cell::{GenerationCell, GenerationRef};
use crate::table::generation::Generation;
use crate::table::spec::{validate_tables, SpecError, TableId, TableSpec};

/// Coarse lifecycle state of a table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TableState {
    /// Nothing published yet and no build running
    Empty = 0,
    /// A build is running
    Building = 1,
    /// A generation is being served and no build is running
    Current = 2,
}

impl TableState {
    /// Get the state as a string
    pub const fn as_str(&self) -> &'static str {
        match self {
            TableState::Empty => "empty",
            TableState::Building => "building",
            TableState::Current => "current",
        }
    }
}

/// One registered table
#[derive(Debug)]
pub struct TableEntry {
    spec: Arc<TableSpec>,
    cell: GenerationCell,
    building: AtomicBool,
    next_sequence: AtomicU64,
}

impl TableEntry {
    /// Table spec
    #[inline]
    pub fn spec(&self) -> &Arc<TableSpec> {
        &self.spec
    }

    /// Current-generation cell
    #[inline]
    pub fn cell(&self) -> &GenerationCell {
        &self.cell
    }

    /// Pin the current generation
    #[inline]
    pub fn pin(&self) -> Option<GenerationRef<'_>> {
        self.cell.pin()
    }

    /// Lifecycle state
    pub fn state(&self) -> TableState {
        if self.building.load(Ordering::Acquire) {
            TableState::Building
        } else if self.cell.is_published() {
            TableState::Current
        } else {
            TableState::Empty
        }
    }

    /// Claim the right to build this table. Returns `false` if a build is running.
    pub fn begin_build(&self) -> bool {
        self.building
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Release the build claim.
    pub fn end_build(&self) {
        self.building.store(false, Ordering::Release);
    }

    /// Allocate the next generation sequence number (starting at 1).
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Publish `generation`, returning the sequence it displaced.
    pub fn publish(&self, generation: Generation) -> Option<u64> {
        self.cell.publish(generation)
    }
}

/// Fixed set of tables sharing one epoch
#[derive(Debug)]
pub struct TableRegistry {
    epoch: Arc<LightEpoch>,
    tables: Vec<TableEntry>,
}

impl TableRegistry {
    /// Validate `specs` and register them, assigning ids by position.
    pub fn new(specs: Vec<TableSpec>) -> Result<Self, SpecError> {
        validate_tables(&specs)?;
        let epoch = Arc::new(LightEpoch::new());
        let tables = specs
            .into_iter()
            .enumerate()
            .map(|(id, mut spec)| {
                spec.set_id(id as TableId);
                TableEntry {
                    spec: Arc::new(spec),
                    cell: GenerationCell::new(epoch.clone()),
                    building: AtomicBool::new(false),
                    next_sequence: AtomicU64::new(0),
                }
            })
            .collect();
        Ok(Self { epoch, tables })
    }

    /// Number of tables
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// Check if no table is registered
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Table by id
    #[inline]
    pub fn get(&self, id: TableId) -> Option<&TableEntry> {
        self.tables.get(id as usize)
    }

    /// Table by name
    pub fn by_name(&self, name: &str) -> Option<&TableEntry> {
        self.tables.iter().find(|entry| entry.spec.name() == name)
    }

    /// Id of the table called `name`
    pub fn table_id(&self, name: &str) -> Option<TableId> {
        self.by_name(name).map(|entry| entry.spec.id())
    }

    /// All tables in id order
    pub fn iter(&self) -> impl Iterator<Item = &TableEntry> {
        self.tables.iter()
    }

    /// Shared epoch
    pub fn epoch(&self) -> &Arc<LightEpoch> {
        &self.epoch
    }

    /// Whether every table has a published generation
    pub fn all_published(&self) -> bool {
        self.tables.iter().all(|entry| entry.cell.is_published())
    }
}
