//! Flat device heap of the simulated device

use std::collections::BTreeMap;
use std::ops::Range;

use crate::diagnostics::{InternalError, Result};

/// Device address of the first heap byte
pub const HEAP_BASE: u64 = 0x1000_0000;

const ALIGNMENT: u64 = 64;

/// Bump-allocated byte heap; addresses start at [`HEAP_BASE`]
#[derive(Debug)]
pub struct DeviceMemory {
    bytes: Vec<u8>,
    capacity: u64,
    next: u64,
    allocations: BTreeMap<u64, usize>,
}

impl DeviceMemory {
    pub fn new(capacity: u64) -> Self {
        Self {
            bytes: Vec::new(),
            capacity,
            next: 0,
            allocations: BTreeMap::new(),
        }
    }

    pub fn allocate(&mut self, size: usize) -> Result<u64> {
        let offset = self.next.div_ceil(ALIGNMENT) * ALIGNMENT;
        let end = offset + size.max(1) as u64;
        if end > self.capacity {
            return Err(InternalError::Execution(format!(
                "out of device memory allocating {} bytes ({} of {} in use)",
                size, self.next, self.capacity
            ))
            .into());
        }
        self.bytes.resize(end as usize, 0);
        self.next = end;

        let address = HEAP_BASE + offset;
        self.allocations.insert(address, size);
        Ok(address)
    }

    pub fn free(&mut self, address: u64) -> Result<()> {
        self.allocations
            .remove(&address)
            .map(|_| ())
            .ok_or_else(|| InternalError::UnknownBuffer(address).into())
    }

    pub fn allocation_size(&self, address: u64) -> Option<usize> {
        self.allocations.get(&address).copied()
    }

    pub fn live_allocations(&self) -> usize {
        self.allocations.len()
    }

    fn range(&self, address: u64, len: usize) -> Result<Range<usize>> {
        let in_bounds = address >= HEAP_BASE
            && (address - HEAP_BASE)
                .checked_add(len as u64)
                .is_some_and(|end| end <= self.bytes.len() as u64);
        if !in_bounds {
            return Err(InternalError::Execution(format!(
                "access of {} bytes at {:#x} is outside device memory",
                len, address
            ))
            .into());
        }
        let start = (address - HEAP_BASE) as usize;
        Ok(start..start + len)
    }

    pub fn read(&self, address: u64, len: usize) -> Result<Vec<u8>> {
        let range = self.range(address, len)?;
        Ok(self.bytes[range].to_vec())
    }

    pub fn write(&mut self, address: u64, data: &[u8]) -> Result<()> {
        let range = self.range(address, data.len())?;
        self.bytes[range].copy_from_slice(data);
        Ok(())
    }
}
