//! Chained reader over every fragment of a logical unit

use batchio_common::types::{FileFragment, LogicalUnit, Record};
use batchio_common::{BatchioError, Result};
use tracing::debug;

use super::FragmentReader;

/// Observable lifecycle position of a [`ChainedFragmentReader`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainPhase {
    Idle,
    Reading(usize),
    Exhausted(usize),
    Done,
}

enum ChainState<R> {
    Idle,
    Reading { index: usize, reader: R },
    Exhausted(usize),
    Done,
}

/// Presents the fragments of one logical unit as a single record stream.
///
/// Only one sub-reader is open at a time; fragment `i + 1` is opened when
/// fragment `i` runs dry. Fragments are read in the order the unit lists them.
pub struct ChainedFragmentReader<R: FragmentReader> {
    unit: LogicalUnit,
    options: R::Options,
    state: ChainState<R>,
}

impl<R: FragmentReader> ChainedFragmentReader<R> {
    pub fn new(unit: LogicalUnit, options: R::Options) -> Self {
        Self {
            unit,
            options,
            state: ChainState::Idle,
        }
    }

    /// Open the first fragment, or go straight to `Done` for a unit with
    /// zero total length.
    pub fn initialize(&mut self) -> Result<()> {
        if !matches!(self.state, ChainState::Idle) {
            return Err(BatchioError::ReaderState(
                "chained reader is already initialized".to_string(),
            ));
        }

        if self.unit.total_length() == 0 {
            debug!(fragments = self.unit.len(), "Empty logical unit, nothing to read");
            self.state = ChainState::Done;
            return Ok(());
        }

        self.open_fragment(0)
    }

    fn open_fragment(&mut self, index: usize) -> Result<()> {
        let Some(fragment) = self.unit.fragment(index) else {
            return Err(BatchioError::ReaderState(format!(
                "fragment {} out of range for a unit of {}",
                index,
                self.unit.len()
            )));
        };

        let reader = R::open(fragment, &self.options)?;
        debug!(fragment = index, total = self.unit.len(), source = %fragment, "Opened fragment");
        self.state = ChainState::Reading { index, reader };
        Ok(())
    }

    /// Next record of the unit. Initializes on first use.
    pub fn next_record(&mut self) -> Result<Option<Record>> {
        loop {
            match self.state {
                ChainState::Idle => self.initialize()?,
                ChainState::Done => return Ok(None),
                ChainState::Reading {
                    index,
                    ref mut reader,
                } => {
                    if let Some(record) = reader.next_record()? {
                        return Ok(Some(record));
                    }
                    reader.close()?;
                    self.state = ChainState::Exhausted(index);
                },
                ChainState::Exhausted(index) => {
                    let next = index + 1;
                    if next < self.unit.len() {
                        self.open_fragment(next)?;
                    } else {
                        debug!(fragments = self.unit.len(), "Logical unit exhausted");
                        self.state = ChainState::Done;
                    }
                },
            }
        }
    }

    /// `(i + p) / n` where `i` is the index of the active fragment, `p` its
    /// reader's own progress and `n` the number of fragments.
    pub fn progress(&self) -> f32 {
        let total = self.unit.len().max(1) as f32;
        match &self.state {
            ChainState::Idle => 0.0,
            ChainState::Reading { index, reader } => {
                (*index as f32 + reader.progress().clamp(0.0, 1.0)) / total
            },
            ChainState::Exhausted(index) => (*index as f32 + 1.0) / total,
            ChainState::Done => 1.0,
        }
    }

    /// Close the active sub-reader, if any. Earlier fragments were closed when
    /// they ran dry.
    pub fn close(&mut self) -> Result<()> {
        if let ChainState::Reading { reader, .. } = &mut self.state {
            reader.close()?;
        }
        self.state = ChainState::Done;
        Ok(())
    }

    pub fn phase(&self) -> ChainPhase {
        match self.state {
            ChainState::Idle => ChainPhase::Idle,
            ChainState::Reading { index, .. } => ChainPhase::Reading(index),
            ChainState::Exhausted(index) => ChainPhase::Exhausted(index),
            ChainState::Done => ChainPhase::Done,
        }
    }

    /// Fragment currently being read
    pub fn current_fragment(&self) -> Option<&FileFragment> {
        match self.state {
            ChainState::Reading { index, .. } => self.unit.fragment(index),
            _ => None,
        }
    }

    pub fn unit(&self) -> &LogicalUnit {
        &self.unit
    }
}

impl<R: FragmentReader> Iterator for ChainedFragmentReader<R> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}
