//
// Copyright 2024, UNSW
//
// SPDX-License-Identifier: BSD-2-Clause
//

pub mod abi;
pub mod bounded;
pub mod region;
pub mod report;
pub mod sdf;
pub mod system;
pub mod types;
pub mod util;
pub mod validate;

pub use abi::{decode, decode_cell, decode_descriptor, encode, encode_cell, DecodeError};
pub use bounded::{BoundedVec, CapacityError};
pub use region::{
    Console, ConsoleFlags, ConsoleKind, IrqChip, MemoryRegion, Partition, PciDevice, PciKind,
    QosDevice, QosFlags, ShmemDescriptor, ShmemProtocol, StreamId,
};
pub use system::{
    ArchPlatform, CellDescriptor, CellFlags, ColorInfo, Descriptor, GicInfo, IommuKind, IommuUnit,
    MemguardInfo, PlatformInfo, QosPlatform, SysFlags, SystemDescriptor, X86Info,
};
pub use types::{AddressRange, Architecture, Bdf, ConstructionError, CpuSet, MemFlags};
pub use validate::{
    check, check_with, validate, validate_with, validated, validated_with, Entity, InvariantId,
    Severity, SharingTopology, Validated, ValidationConfig, Violation,
};

/// Granule of every non-IO memory region and of the hypervisor memory.
pub const PAGE_SIZE: u64 = 0x1000;

// These values are part of the loader ABI. The hypervisor rejects any
// configuration revision it was not built for, so they must change together.
pub const CONFIG_REVISION: u16 = 13;
pub const SYSTEM_SIGNATURE: [u8; 6] = *b"JHSYST";
pub const CELL_SIGNATURE: [u8; 6] = *b"JHCELL";

/// Longest partition name, excluding the terminating NUL of the ABI field.
pub const CELL_NAME_MAXLEN: usize = 31;
pub const QOS_NAME_MAXLEN: usize = 19;

pub const MAX_MEMORY_REGIONS: usize = 256;
pub const MAX_IRQCHIPS: usize = 16;
pub const MAX_PCI_DEVICES: usize = 64;
pub const MAX_STREAM_IDS: usize = 64;
pub const MAX_QOS_DEVICES: usize = 64;
/// CPU sets are stored as 64-bit words, so this allows 512 CPUs.
pub const MAX_CPU_SET_WORDS: usize = 8;
pub const MAX_IOMMU_UNITS: usize = 8;
pub const MAX_PMU_IRQS: usize = 8;
pub const MAX_IVSHMEM_PEERS: u32 = 16;

/// Interrupt lines covered by a single irqchip entry.
pub const IRQCHIP_PINS: u32 = 128;
/// Virtual INTx lines used by the virtual PCI host controller of a partition.
pub const VPCI_IRQ_LINES: u32 = 4;
