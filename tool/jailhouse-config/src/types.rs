//
// Copyright 2024, UNSW
//
// SPDX-License-Identifier: BSD-2-Clause
//

//! Primitive values shared by every descriptor record.

use bitflags::bitflags;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

use crate::bounded::{BoundedVec, CapacityError};
use crate::MAX_CPU_SET_WORDS;

/// Rejection of a locally non-sensical value at construction time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConstructionError {
    #[error("address range must not be empty")]
    EmptyRange,
    #[error("address range starting at 0x{start:x} with size 0x{size:x} overflows the address space")]
    AddressOverflow { start: u64, size: u64 },
    #[error("{what} 0x{value:x} is not aligned to 0x{alignment:x}")]
    Misaligned {
        what: &'static str,
        value: u64,
        alignment: u64,
    },
    #[error("name '{name}' is longer than {max} bytes")]
    NameTooLong { name: String, max: usize },
    #[error("name must not be empty")]
    EmptyName,
    #[error(transparent)]
    CapacityExceeded(#[from] CapacityError),
    #[error("invalid PCI address {bus:02x}:{device:02x}.{function:x}")]
    InvalidBdf { bus: u8, device: u8, function: u8 },
}

pub(crate) fn check_name(name: &str, max: usize) -> Result<(), ConstructionError> {
    if name.is_empty() {
        return Err(ConstructionError::EmptyName);
    }
    if name.len() > max {
        return Err(ConstructionError::NameTooLong {
            name: name.to_string(),
            max,
        });
    }
    Ok(())
}

/// A half-open range of addresses `[start, start + size)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct AddressRange {
    pub start: u64,
    pub size: u64,
}

impl AddressRange {
    pub fn new(start: u64, size: u64) -> Result<AddressRange, ConstructionError> {
        if size == 0 {
            return Err(ConstructionError::EmptyRange);
        }
        if start.checked_add(size).is_none() {
            return Err(ConstructionError::AddressOverflow { start, size });
        }
        Ok(AddressRange { start, size })
    }

    /// Exclusive end. Saturates for ranges that were built without the
    /// constructor and wrap the address space.
    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.size)
    }

    pub fn checked_end(&self) -> Option<u64> {
        self.start.checked_add(self.size)
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn overlaps(&self, other: &AddressRange) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && crate::util::ranges_overlap(self.start, self.end(), other.start, other.end())
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end()
    }

    pub fn is_aligned(&self, alignment: u64) -> bool {
        self.start.is_multiple_of(alignment) && self.size.is_multiple_of(alignment)
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[0x{:x}..0x{:x})", self.start, self.end())
    }
}

bitflags! {
    /// Access and role flags of a memory region, as the hypervisor reads them.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
    pub struct MemFlags: u64 {
        const READ = 0x0001;
        const WRITE = 0x0002;
        const EXECUTE = 0x0004;
        const DMA = 0x0008;
        const IO = 0x0010;
        const COMM_REGION = 0x0020;
        const LOADABLE = 0x0040;
        const ROOTSHARED = 0x0080;
        const NO_HUGEPAGES = 0x0100;
        const IO_UNALIGNED = 0x8000;
        const IO_8 = 0x1_0000;
        const IO_16 = 0x2_0000;
        const IO_32 = 0x4_0000;
        const IO_64 = 0x8_0000;
    }
}

impl MemFlags {
    /// Bits set that no known flag accounts for.
    pub fn unknown_bits(&self) -> u64 {
        self.bits() & !MemFlags::all().bits()
    }
}

/// PCI bus/device/function packed as `bus << 8 | device << 3 | function`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Bdf(pub u16);

impl Bdf {
    pub fn new(bus: u8, device: u8, function: u8) -> Result<Bdf, ConstructionError> {
        if device >= 32 || function >= 8 {
            return Err(ConstructionError::InvalidBdf {
                bus,
                device,
                function,
            });
        }
        Ok(Bdf(((bus as u16) << 8) | ((device as u16) << 3) | function as u16))
    }

    pub fn bus(&self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub fn device(&self) -> u8 {
        ((self.0 >> 3) & 0x1f) as u8
    }

    pub fn function(&self) -> u8 {
        (self.0 & 0x7) as u8
    }
}

impl fmt::Display for Bdf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}.{:x}",
            self.bus(),
            self.device(),
            self.function()
        )
    }
}

/// Set of CPU indices, stored as 64-bit words the way the loader ABI carries
/// it. The number of words is kept as given so that the encoded
/// `cpu_set_size` survives a round trip.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(transparent)]
pub struct CpuSet {
    words: BoundedVec<u64, MAX_CPU_SET_WORDS>,
}

impl CpuSet {
    /// A single-word set covering CPUs 0 to 63.
    pub fn from_mask(mask: u64) -> CpuSet {
        let mut words = BoundedVec::new();
        // A fresh set always has room for one word.
        let _ = words.push(mask);
        CpuSet { words }
    }

    pub fn from_words(words: Vec<u64>) -> Result<CpuSet, ConstructionError> {
        Ok(CpuSet {
            words: BoundedVec::from_vec(words)?,
        })
    }

    pub fn from_cpus(cpus: impl IntoIterator<Item = u32>) -> Result<CpuSet, ConstructionError> {
        let mut words = vec![0u64];
        for cpu in cpus {
            let word = (cpu / 64) as usize;
            if word >= MAX_CPU_SET_WORDS {
                return Err(CapacityError {
                    capacity: MAX_CPU_SET_WORDS * 64,
                }
                .into());
            }
            if words.len() <= word {
                words.resize(word + 1, 0);
            }
            words[word] |= 1 << (cpu % 64);
        }
        CpuSet::from_words(words)
    }

    pub fn words(&self) -> &[u64] {
        &self.words
    }

    /// Size of the set in bytes as encoded.
    pub fn size_bytes(&self) -> usize {
        self.words.len() * 8
    }

    pub fn contains(&self, cpu: u32) -> bool {
        self.words
            .get((cpu / 64) as usize)
            .is_some_and(|word| word & (1 << (cpu % 64)) != 0)
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|word| *word == 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.words.iter().enumerate().flat_map(|(i, word)| {
            (0..64u32)
                .filter(move |bit| word & (1 << bit) != 0)
                .map(move |bit| i as u32 * 64 + bit)
        })
    }

    /// CPUs of `self` missing from `other`.
    pub fn difference<'a>(&'a self, other: &'a CpuSet) -> impl Iterator<Item = u32> + 'a {
        self.iter().filter(|cpu| !other.contains(*cpu))
    }

    pub fn intersection<'a>(&'a self, other: &'a CpuSet) -> impl Iterator<Item = u32> + 'a {
        self.iter().filter(|cpu| other.contains(*cpu))
    }
}

impl fmt::Display for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cpus: Vec<String> = self.iter().map(|cpu| cpu.to_string()).collect();
        write!(f, "{{{}}}", cpus.join(","))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Architecture {
    X86,
    Arm,
    Arm64,
}

impl Architecture {
    pub fn code(&self) -> u8 {
        match self {
            Architecture::X86 => 0,
            Architecture::Arm => 1,
            Architecture::Arm64 => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Architecture> {
        match code {
            0 => Some(Architecture::X86),
            1 => Some(Architecture::Arm),
            2 => Some(Architecture::Arm64),
            _ => None,
        }
    }

    pub fn from_name(s: &str) -> Option<Architecture> {
        match s {
            "x86" => Some(Architecture::X86),
            "arm" => Some(Architecture::Arm),
            "arm64" => Some(Architecture::Arm64),
            _ => None,
        }
    }

    pub fn is_arm(&self) -> bool {
        matches!(self, Architecture::Arm | Architecture::Arm64)
    }

    /// Offset of the first shared peripheral interrupt. Interrupt numbers
    /// relative to the SPI space are shifted by this much to become absolute.
    pub fn spi_offset(&self) -> u32 {
        if self.is_arm() {
            32
        } else {
            0
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Architecture::X86 => "x86",
            Architecture::Arm => "arm",
            Architecture::Arm64 => "arm64",
        };
        write!(f, "{s}")
    }
}
