//! The parts of the processor which the memory management and trap
//! machinery need: the page table and fault recorder, the pending
//! traps, the status word and stack pointers, and the CPU error
//! register.
use tracing::{event, Level};

use base::prelude::*;

use crate::config::CpuConfiguration;
use crate::fault::{BusFault, MemoryFault};
use crate::mmu::{FaultRecorder, PageTable};
use crate::registers::{CPUERR_NON_EXISTENT_MEMORY, CPUERR_ODD_ADDRESS, CPUERR_TIMEOUT};
use crate::state::ProcessorState;
use crate::trap::TrapUnit;

#[derive(Debug)]
pub struct Processor {
    pub(crate) config: CpuConfiguration,
    pub(crate) page_table: PageTable,
    pub(crate) recorder: FaultRecorder,
    pub(crate) traps: TrapUnit,
    pub(crate) state: ProcessorState,
    pub(crate) cpu_error: u16,
}

impl Processor {
    pub(crate) fn new(config: CpuConfiguration) -> Processor {
        Processor {
            page_table: PageTable::new(config.physical_width),
            recorder: FaultRecorder::new(),
            traps: TrapUnit::new(),
            state: ProcessorState::default(),
            cpu_error: 0,
            config,
        }
    }

    pub fn config(&self) -> &CpuConfiguration {
        &self.config
    }

    pub fn page_table(&self) -> &PageTable {
        &self.page_table
    }

    pub fn page_table_mut(&mut self) -> &mut PageTable {
        &mut self.page_table
    }

    pub fn fault_recorder(&self) -> &FaultRecorder {
        &self.recorder
    }

    pub fn traps(&self) -> &TrapUnit {
        &self.traps
    }

    pub fn state(&self) -> &ProcessorState {
        &self.state
    }

    pub fn cpu_error(&self) -> u16 {
        self.cpu_error
    }

    /// Form the physical address for a reference by the processor.
    /// The odd-address check (on processors which make it) comes
    /// before translation, so an odd word reference never reaches the
    /// page table.
    pub fn translate(
        &mut self,
        va: VirtualAddress,
        mode: Mode,
        space: Space,
        access: AccessKind,
        width: Width,
    ) -> Result<PhysicalAddress, MemoryFault> {
        if self.config.odd_address_traps && width == Width::Word && va.is_odd() {
            return Err(MemoryFault::OddAddress(va));
        }
        let pa = self
            .page_table
            .translate(va, mode, space, access, &mut self.recorder)?;
        Ok(pa)
    }

    /// Turn a failed reference into a pending trap.  The reference
    /// itself has already had no effect.
    pub(crate) fn post_fault(&mut self, fault: MemoryFault) {
        match fault {
            MemoryFault::OddAddress(_) => self.cpu_error |= CPUERR_ODD_ADDRESS,
            MemoryFault::Bus(BusFault::NonExistentResource(pa)) => {
                self.cpu_error |= if pa.is_in_io_page() {
                    CPUERR_TIMEOUT
                } else {
                    CPUERR_NON_EXISTENT_MEMORY
                };
            }
            // The fault recorder has already latched the details.
            MemoryFault::Translation(_) => (),
        }
        event!(Level::DEBUG, "{fault}");
        self.traps.post(fault.trap_slot());
    }

    /// Power-on state.
    pub(crate) fn reset(&mut self) {
        self.page_table.reset();
        self.recorder.reset();
        self.traps.reset();
        self.state = ProcessorState::default();
        self.cpu_error = 0;
    }
}
