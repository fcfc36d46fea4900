//
// Copyright 2024, UNSW
//
// SPDX-License-Identifier: BSD-2-Clause
//

//! The binary configuration format read by the hypervisor loader.
//!
//! All records are packed and use the byte order of the host that produces
//! them, which is the byte order of the target. A system blob is laid out as
//!
//! ```text
//! preamble | system info | cell header | cpu set | memory regions | irqchips
//!          | pci devices | stream ids  | qos devices
//! ```
//!
//! and a guest cell blob is the same without the system info. The cell header
//! carries the count of every list that follows, so the decoder can check the
//! counts against their capacities and the total length before it looks at
//! any payload.

use std::mem::size_of;
use thiserror::Error;
use tracing::trace;
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

use crate::bounded::BoundedVec;
use crate::region::{
    Console, ConsoleFlags, ConsoleKind, IrqChip, MemoryRegion, Partition, PciDevice, PciKind,
    QosDevice, QosFlags, ShmemDescriptor, ShmemProtocol, StreamId,
};
use crate::system::{
    ArchPlatform, CellDescriptor, CellFlags, ColorInfo, Descriptor, GicInfo, IommuKind, IommuUnit,
    MemguardInfo, PlatformInfo, QosPlatform, SysFlags, SystemDescriptor, X86Info,
};
use crate::types::{AddressRange, Architecture, Bdf, CpuSet, MemFlags};
use crate::{
    CELL_NAME_MAXLEN, CELL_SIGNATURE, CONFIG_REVISION, MAX_CPU_SET_WORDS, MAX_IOMMU_UNITS,
    MAX_IRQCHIPS, MAX_MEMORY_REGIONS, MAX_PCI_DEVICES, MAX_PMU_IRQS, MAX_QOS_DEVICES,
    MAX_STREAM_IDS, QOS_NAME_MAXLEN, SYSTEM_SIGNATURE,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error(
        "bad signature '{}', expected '{}'",
        String::from_utf8_lossy(.found),
        String::from_utf8_lossy(.expected)
    )]
    BadSignature { found: [u8; 6], expected: [u8; 6] },
    #[error("unsupported configuration revision {found}, expected {expected}")]
    UnsupportedRevision { found: u16, expected: u16 },
    #[error("input truncated: {what} needs {needed} bytes but only {available} are left")]
    TruncatedInput {
        what: &'static str,
        needed: usize,
        available: usize,
    },
    #[error("{what} count {count} exceeds the capacity of {capacity}")]
    CountExceedsCapacity {
        what: &'static str,
        count: u64,
        capacity: usize,
    },
    #[error("invalid {what}: {value}")]
    InvalidField { what: &'static str, value: String },
    #[error("{count} unexpected bytes after the configuration")]
    TrailingBytes { count: usize },
}

const NAME_FIELD_LEN: usize = CELL_NAME_MAXLEN + 1;
const QOS_NAME_FIELD_LEN: usize = QOS_NAME_MAXLEN + 1;
const ARCH_INFO_LEN: usize = 48;

#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy, Debug)]
struct RawPreamble {
    signature: [u8; 6],
    revision: u16,
    architecture: u8,
    flags: u32,
}

#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy, Debug)]
struct RawConsole {
    address: u64,
    size: u32,
    kind: u16,
    flags: u16,
    divider: u32,
    gate_nr: u32,
    clock_reg: u64,
}

#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy, Debug)]
struct RawIommu {
    kind: u32,
    base: u64,
    size: u32,
}

#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy, Debug)]
struct RawGic {
    maintenance_irq: u8,
    gic_version: u8,
    reserved: [u8; 6],
    gicd_base: u64,
    gicc_base: u64,
    gich_base: u64,
    gicv_base: u64,
    gicr_base: u64,
}

#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy, Debug)]
struct RawX86 {
    pm_timer_address: u16,
    apic_mode: u8,
    reserved0: u8,
    vtd_interrupt_limit: u32,
    tsc_khz: u32,
    apic_khz: u32,
    reserved1: [u8; 32],
}

#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy, Debug)]
struct RawMemguard {
    num_irqs: u32,
    hv_timer: u32,
    irq_prio_min: u8,
    irq_prio_max: u8,
    irq_prio_step: u8,
    irq_prio_threshold: u8,
    num_pmu_irq: u32,
    pmu_cpu_irq: [u32; MAX_PMU_IRQS],
}

#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy, Debug)]
struct RawSystemInfo {
    hypervisor_phys_start: u64,
    hypervisor_size: u64,
    debug_console: RawConsole,
    pci_mmconfig_base: u64,
    pci_mmconfig_end_bus: u8,
    pci_is_virtual: u8,
    pci_domain: u16,
    num_iommu_units: u32,
    iommu_units: [RawIommu; MAX_IOMMU_UNITS],
    /// `RawGic` or `RawX86`, depending on the architecture.
    arch: [u8; ARCH_INFO_LEN],
    color_way_size: u64,
    color_root_map_offset: u64,
    memguard: RawMemguard,
    qos_nic_base: u64,
    qos_nic_size: u64,
}

#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy, Debug)]
struct RawCellHeader {
    name: [u8; NAME_FIELD_LEN],
    cpu_set_size: u32,
    num_memory_regions: u32,
    num_irqchips: u32,
    num_pci_devices: u32,
    num_stream_ids: u32,
    num_qos_devices: u32,
    vpci_irq_base: u32,
    cpu_reset_address: u64,
    msg_reply_timeout: u64,
    console: RawConsole,
}

#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy, Debug)]
struct RawMemory {
    phys_start: u64,
    virt_start: u64,
    size: u64,
    flags: u64,
}

#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy, Debug)]
struct RawIrqChip {
    address: u64,
    id: u32,
    pin_base: u32,
    pin_bitmap: [u32; 4],
}

#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy, Debug)]
struct RawPciDevice {
    kind: u8,
    iommu: u8,
    domain: u16,
    bdf: u16,
    bar_mask: [u32; 6],
    num_msi_vectors: u8,
    msi_64bits: u8,
    msi_maskable: u8,
    num_msix_vectors: u16,
    msix_region_size: u16,
    msix_address: u64,
    shmem_regions_start: u32,
    shmem_dev_id: u32,
    shmem_peers: u32,
    shmem_protocol: u16,
}

#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy, Debug)]
struct RawStreamId {
    id: u32,
    mask_out: u32,
}

#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy, Debug)]
struct RawQosDevice {
    name: [u8; QOS_NAME_FIELD_LEN],
    flags: u32,
    base: u64,
}

/// Copies `name` into a NUL-terminated fixed-size field. Names that do not
/// fit are cut, validation rejects those before encoding.
fn name_field<const N: usize>(name: &str) -> [u8; N] {
    let mut field = [0u8; N];
    let len = name.len().min(N - 1);
    field[..len].copy_from_slice(&name.as_bytes()[..len]);
    field
}

fn raw_console(console: &Console) -> RawConsole {
    RawConsole {
        address: console.address,
        size: console.size,
        kind: console.kind.code(),
        flags: console.flags.bits(),
        divider: console.divider,
        gate_nr: console.gate_nr,
        clock_reg: console.clock_reg,
    }
}

fn raw_system_info(system: &SystemDescriptor) -> RawSystemInfo {
    let platform = &system.platform_info;
    let mut info = RawSystemInfo::new_zeroed();

    info.hypervisor_phys_start = system.hypervisor_memory.start;
    info.hypervisor_size = system.hypervisor_memory.size;
    info.debug_console = raw_console(&system.debug_console);
    info.pci_mmconfig_base = platform.pci_mmconfig_base;
    info.pci_mmconfig_end_bus = platform.pci_mmconfig_end_bus;
    info.pci_is_virtual = platform.pci_is_virtual as u8;
    info.pci_domain = platform.pci_domain;
    info.num_iommu_units = platform.iommu_units.len() as u32;
    for (raw, unit) in info.iommu_units.iter_mut().zip(platform.iommu_units.iter()) {
        *raw = RawIommu {
            kind: unit.kind.code(),
            base: unit.base,
            size: unit.size,
        };
    }
    match &platform.arch {
        ArchPlatform::Arm(gic) => {
            let raw = RawGic {
                maintenance_irq: gic.maintenance_irq,
                gic_version: gic.gic_version,
                reserved: [0; 6],
                gicd_base: gic.gicd_base,
                gicc_base: gic.gicc_base,
                gich_base: gic.gich_base,
                gicv_base: gic.gicv_base,
                gicr_base: gic.gicr_base,
            };
            info.arch.copy_from_slice(raw.as_bytes());
        }
        ArchPlatform::X86(x86) => {
            let raw = RawX86 {
                pm_timer_address: x86.pm_timer_address,
                apic_mode: x86.apic_mode,
                reserved0: 0,
                vtd_interrupt_limit: x86.vtd_interrupt_limit,
                tsc_khz: x86.tsc_khz,
                apic_khz: x86.apic_khz,
                reserved1: [0; 32],
            };
            info.arch.copy_from_slice(raw.as_bytes());
        }
    }
    info.color_way_size = platform.color.way_size;
    info.color_root_map_offset = platform.color.root_map_offset;

    let memguard = &platform.memguard;
    let mut pmu_cpu_irq = [0u32; MAX_PMU_IRQS];
    pmu_cpu_irq[..memguard.pmu_cpu_irq.len()].copy_from_slice(&memguard.pmu_cpu_irq);
    info.memguard = RawMemguard {
        num_irqs: memguard.num_irqs,
        hv_timer: memguard.hv_timer,
        irq_prio_min: memguard.irq_prio_min,
        irq_prio_max: memguard.irq_prio_max,
        irq_prio_step: memguard.irq_prio_step,
        irq_prio_threshold: memguard.irq_prio_threshold,
        num_pmu_irq: memguard.pmu_cpu_irq.len() as u32,
        pmu_cpu_irq,
    };
    info.qos_nic_base = platform.qos.nic_base;
    info.qos_nic_size = platform.qos.nic_size;

    info
}

/// Fields of the cell header that only guest cells carry.
#[derive(Default)]
struct CellExtras {
    console: Option<Console>,
    cpu_reset_address: u64,
    msg_reply_timeout: u64,
}

fn encode_partition(out: &mut Vec<u8>, partition: &Partition, extras: CellExtras) {
    let header = RawCellHeader {
        name: name_field(&partition.name),
        cpu_set_size: partition.cpu_set.size_bytes() as u32,
        num_memory_regions: partition.memory_regions.len() as u32,
        num_irqchips: partition.irqchips.len() as u32,
        num_pci_devices: partition.pci_devices.len() as u32,
        num_stream_ids: partition.stream_ids.len() as u32,
        num_qos_devices: partition.qos_devices.len() as u32,
        vpci_irq_base: partition.vpci_irq_base,
        cpu_reset_address: extras.cpu_reset_address,
        msg_reply_timeout: extras.msg_reply_timeout,
        console: raw_console(&extras.console.unwrap_or_else(Console::none)),
    };
    out.extend_from_slice(header.as_bytes());

    for word in partition.cpu_set.words() {
        out.extend_from_slice(word.as_bytes());
    }
    for region in &partition.memory_regions {
        let raw = RawMemory {
            phys_start: region.phys.start,
            virt_start: region.virt_start,
            size: region.phys.size,
            flags: region.flags.bits(),
        };
        out.extend_from_slice(raw.as_bytes());
    }
    for chip in &partition.irqchips {
        let raw = RawIrqChip {
            address: chip.controller_address,
            id: chip.id,
            pin_base: chip.pin_base,
            pin_bitmap: chip.pin_bitmap,
        };
        out.extend_from_slice(raw.as_bytes());
    }
    for dev in &partition.pci_devices {
        out.extend_from_slice(raw_pci_device(dev).as_bytes());
    }
    for sid in &partition.stream_ids {
        let raw = RawStreamId {
            id: sid.id,
            mask_out: sid.mask_out,
        };
        out.extend_from_slice(raw.as_bytes());
    }
    for qos in &partition.qos_devices {
        let raw = RawQosDevice {
            name: name_field(&qos.name),
            flags: qos.flags.bits(),
            base: qos.base,
        };
        out.extend_from_slice(raw.as_bytes());
    }
}

fn raw_pci_device(dev: &PciDevice) -> RawPciDevice {
    let shmem = dev.shmem.unwrap_or(ShmemDescriptor {
        regions_start: 0,
        dev_id: 0,
        peers: 0,
        protocol: ShmemProtocol::Undefined,
    });
    RawPciDevice {
        kind: dev.kind.code(),
        iommu: dev.iommu,
        domain: dev.domain,
        bdf: dev.bdf.0,
        bar_mask: dev.bar_mask,
        num_msi_vectors: dev.num_msi_vectors,
        msi_64bits: dev.msi_64bits as u8,
        msi_maskable: dev.msi_maskable as u8,
        num_msix_vectors: dev.num_msix_vectors,
        msix_region_size: dev.msix_region_size,
        msix_address: dev.msix_address,
        shmem_regions_start: shmem.regions_start,
        shmem_dev_id: shmem.dev_id,
        shmem_peers: shmem.peers,
        shmem_protocol: shmem.protocol.code(),
    }
}

/// Serializes a system descriptor. Callers that need the validation
/// guarantee go through [`crate::validate::Validated::encode`].
pub fn encode(system: &SystemDescriptor) -> Vec<u8> {
    let preamble = RawPreamble {
        signature: system.signature,
        revision: system.revision,
        architecture: system.architecture.code(),
        flags: system.flags.bits(),
    };
    let mut out = Vec::new();
    out.extend_from_slice(preamble.as_bytes());
    out.extend_from_slice(raw_system_info(system).as_bytes());
    encode_partition(&mut out, &system.root, CellExtras::default());
    out
}

pub fn encode_cell(cell: &CellDescriptor) -> Vec<u8> {
    let preamble = RawPreamble {
        signature: cell.signature,
        revision: cell.revision,
        architecture: cell.architecture.code(),
        flags: cell.flags.bits(),
    };
    let mut out = Vec::new();
    out.extend_from_slice(preamble.as_bytes());
    encode_partition(
        &mut out,
        &cell.partition,
        CellExtras {
            console: Some(cell.console),
            cpu_reset_address: cell.cpu_reset_address,
            msg_reply_timeout: cell.msg_reply_timeout,
        },
    );
    out
}

struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn read<T: FromBytes>(&mut self, what: &'static str) -> Result<T, DecodeError> {
        match T::read_from_prefix(self.bytes) {
            Ok((value, rest)) => {
                self.bytes = rest;
                Ok(value)
            }
            Err(_) => Err(DecodeError::TruncatedInput {
                what,
                needed: size_of::<T>(),
                available: self.bytes.len(),
            }),
        }
    }

    fn read_n<T: FromBytes>(&mut self, count: usize, what: &'static str) -> Result<Vec<T>, DecodeError> {
        (0..count).map(|_| self.read(what)).collect()
    }

    /// The remaining input must be exactly `needed` bytes long.
    fn expect_exactly(&self, needed: usize, what: &'static str) -> Result<(), DecodeError> {
        let available = self.bytes.len();
        if available < needed {
            return Err(DecodeError::TruncatedInput {
                what,
                needed,
                available,
            });
        }
        if available > needed {
            return Err(DecodeError::TrailingBytes {
                count: available - needed,
            });
        }
        Ok(())
    }
}

fn read_preamble(reader: &mut Reader, expected: [u8; 6]) -> Result<RawPreamble, DecodeError> {
    let Some(signature) = reader.bytes.get(..expected.len()) else {
        return Err(DecodeError::TruncatedInput {
            what: "signature",
            needed: expected.len(),
            available: reader.bytes.len(),
        });
    };
    if signature != expected {
        let mut found = [0u8; 6];
        found.copy_from_slice(signature);
        return Err(DecodeError::BadSignature { found, expected });
    }

    let preamble: RawPreamble = reader.read("header")?;
    if preamble.revision != CONFIG_REVISION {
        return Err(DecodeError::UnsupportedRevision {
            found: preamble.revision,
            expected: CONFIG_REVISION,
        });
    }
    Ok(preamble)
}

fn check_count(count: u32, capacity: usize, what: &'static str) -> Result<usize, DecodeError> {
    if count as usize > capacity {
        return Err(DecodeError::CountExceedsCapacity {
            what,
            count: count as u64,
            capacity,
        });
    }
    Ok(count as usize)
}

/// List lengths of a cell, checked against their capacities.
struct Counts {
    cpu_words: usize,
    memory_regions: usize,
    irqchips: usize,
    pci_devices: usize,
    stream_ids: usize,
    qos_devices: usize,
}

impl Counts {
    fn from_header(header: &RawCellHeader) -> Result<Counts, DecodeError> {
        let cpu_set_size = header.cpu_set_size;
        if cpu_set_size % 8 != 0 {
            return Err(DecodeError::InvalidField {
                what: "CPU set size",
                value: format!("{cpu_set_size} is not a multiple of 8"),
            });
        }
        Ok(Counts {
            cpu_words: check_count(cpu_set_size / 8, MAX_CPU_SET_WORDS, "CPU set word")?,
            memory_regions: check_count(
                header.num_memory_regions,
                MAX_MEMORY_REGIONS,
                "memory region",
            )?,
            irqchips: check_count(header.num_irqchips, MAX_IRQCHIPS, "irqchip")?,
            pci_devices: check_count(header.num_pci_devices, MAX_PCI_DEVICES, "PCI device")?,
            stream_ids: check_count(header.num_stream_ids, MAX_STREAM_IDS, "stream id")?,
            qos_devices: check_count(header.num_qos_devices, MAX_QOS_DEVICES, "QoS device")?,
        })
    }

    fn payload_size(&self) -> usize {
        self.cpu_words * size_of::<u64>()
            + self.memory_regions * size_of::<RawMemory>()
            + self.irqchips * size_of::<RawIrqChip>()
            + self.pci_devices * size_of::<RawPciDevice>()
            + self.stream_ids * size_of::<RawStreamId>()
            + self.qos_devices * size_of::<RawQosDevice>()
    }
}

fn decode_name(field: &[u8], what: &'static str) -> Result<String, DecodeError> {
    let Some(len) = field.iter().position(|b| *b == 0) else {
        return Err(DecodeError::InvalidField {
            what,
            value: "name is not NUL-terminated".to_string(),
        });
    };
    String::from_utf8(field[..len].to_vec()).map_err(|err| DecodeError::InvalidField {
        what,
        value: err.to_string(),
    })
}

fn decode_bool(value: u8, what: &'static str) -> Result<bool, DecodeError> {
    match value {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(DecodeError::InvalidField {
            what,
            value: value.to_string(),
        }),
    }
}

fn invalid_code(what: &'static str, code: impl Into<u64>) -> DecodeError {
    DecodeError::InvalidField {
        what,
        value: format!("unknown code 0x{:x}", code.into()),
    }
}

fn decode_architecture(code: u8) -> Result<Architecture, DecodeError> {
    Architecture::from_code(code).ok_or_else(|| invalid_code("architecture", code))
}

fn decode_console(raw: &RawConsole) -> Result<Console, DecodeError> {
    let kind = raw.kind;
    Ok(Console {
        address: raw.address,
        size: raw.size,
        kind: ConsoleKind::from_code(kind).ok_or_else(|| invalid_code("console type", kind))?,
        flags: ConsoleFlags::from_bits_retain(raw.flags),
        divider: raw.divider,
        gate_nr: raw.gate_nr,
        clock_reg: raw.clock_reg,
    })
}

fn bounded<T, const N: usize>(
    items: Vec<T>,
    what: &'static str,
) -> Result<BoundedVec<T, N>, DecodeError> {
    let count = items.len() as u64;
    BoundedVec::from_vec(items).map_err(|err| DecodeError::CountExceedsCapacity {
        what,
        count,
        capacity: err.capacity,
    })
}

fn decode_platform(
    info: &RawSystemInfo,
    architecture: Architecture,
) -> Result<PlatformInfo, DecodeError> {
    let num_iommu_units = check_count(info.num_iommu_units, MAX_IOMMU_UNITS, "IOMMU unit")?;
    let raw_units = info.iommu_units;
    let units = raw_units[..num_iommu_units]
        .iter()
        .map(|raw| {
            let kind = raw.kind;
            Ok(IommuUnit {
                kind: IommuKind::from_code(kind).ok_or_else(|| invalid_code("IOMMU type", kind))?,
                base: raw.base,
                size: raw.size,
            })
        })
        .collect::<Result<Vec<_>, DecodeError>>()?;

    let arch = if architecture.is_arm() {
        let raw = RawGic::read_from_bytes(&info.arch).map_err(|_| DecodeError::TruncatedInput {
            what: "GIC information",
            needed: size_of::<RawGic>(),
            available: ARCH_INFO_LEN,
        })?;
        ArchPlatform::Arm(GicInfo {
            gic_version: raw.gic_version,
            maintenance_irq: raw.maintenance_irq,
            gicd_base: raw.gicd_base,
            gicc_base: raw.gicc_base,
            gich_base: raw.gich_base,
            gicv_base: raw.gicv_base,
            gicr_base: raw.gicr_base,
        })
    } else {
        let raw = RawX86::read_from_bytes(&info.arch).map_err(|_| DecodeError::TruncatedInput {
            what: "x86 information",
            needed: size_of::<RawX86>(),
            available: ARCH_INFO_LEN,
        })?;
        ArchPlatform::X86(X86Info {
            pm_timer_address: raw.pm_timer_address,
            apic_mode: raw.apic_mode,
            vtd_interrupt_limit: raw.vtd_interrupt_limit,
            tsc_khz: raw.tsc_khz,
            apic_khz: raw.apic_khz,
        })
    };

    let memguard = info.memguard;
    let num_pmu_irq = check_count(memguard.num_pmu_irq, MAX_PMU_IRQS, "PMU interrupt")?;
    let pmu_cpu_irq = memguard.pmu_cpu_irq;

    Ok(PlatformInfo {
        pci_mmconfig_base: info.pci_mmconfig_base,
        pci_mmconfig_end_bus: info.pci_mmconfig_end_bus,
        pci_is_virtual: decode_bool(info.pci_is_virtual, "pci_is_virtual")?,
        pci_domain: info.pci_domain,
        iommu_units: bounded(units, "IOMMU unit")?,
        arch,
        color: ColorInfo {
            way_size: info.color_way_size,
            root_map_offset: info.color_root_map_offset,
        },
        memguard: MemguardInfo {
            num_irqs: memguard.num_irqs,
            hv_timer: memguard.hv_timer,
            irq_prio_min: memguard.irq_prio_min,
            irq_prio_max: memguard.irq_prio_max,
            irq_prio_step: memguard.irq_prio_step,
            irq_prio_threshold: memguard.irq_prio_threshold,
            pmu_cpu_irq: bounded(pmu_cpu_irq[..num_pmu_irq].to_vec(), "PMU interrupt")?,
        },
        qos: QosPlatform {
            nic_base: info.qos_nic_base,
            nic_size: info.qos_nic_size,
        },
    })
}

fn decode_pci_device(raw: &RawPciDevice) -> Result<PciDevice, DecodeError> {
    let kind = PciKind::from_code(raw.kind).ok_or_else(|| invalid_code("PCI device type", raw.kind))?;
    let protocol_code = raw.shmem_protocol;
    let protocol = ShmemProtocol::from_code(protocol_code)
        .ok_or_else(|| invalid_code("shared memory protocol", protocol_code))?;
    let shmem = ShmemDescriptor {
        regions_start: raw.shmem_regions_start,
        dev_id: raw.shmem_dev_id,
        peers: raw.shmem_peers,
        protocol,
    };
    let has_shmem = kind == PciKind::Ivshmem
        || shmem.regions_start != 0
        || shmem.dev_id != 0
        || shmem.peers != 0
        || protocol != ShmemProtocol::Undefined;

    Ok(PciDevice {
        kind,
        iommu: raw.iommu,
        domain: raw.domain,
        bdf: Bdf(raw.bdf),
        bar_mask: raw.bar_mask,
        num_msi_vectors: raw.num_msi_vectors,
        msi_64bits: decode_bool(raw.msi_64bits, "msi_64bits")?,
        msi_maskable: decode_bool(raw.msi_maskable, "msi_maskable")?,
        num_msix_vectors: raw.num_msix_vectors,
        msix_region_size: raw.msix_region_size,
        msix_address: raw.msix_address,
        shmem: has_shmem.then_some(shmem),
    })
}

fn decode_partition(
    reader: &mut Reader,
    header: &RawCellHeader,
    counts: &Counts,
) -> Result<Partition, DecodeError> {
    let name = decode_name(&header.name, "cell name")?;

    let words: Vec<u64> = reader.read_n(counts.cpu_words, "CPU set")?;
    let cpu_set = CpuSet::from_words(words).map_err(|_| DecodeError::CountExceedsCapacity {
        what: "CPU set word",
        count: counts.cpu_words as u64,
        capacity: MAX_CPU_SET_WORDS,
    })?;

    let memory_regions = reader
        .read_n::<RawMemory>(counts.memory_regions, "memory region")?
        .into_iter()
        .map(|raw| MemoryRegion {
            phys: AddressRange {
                start: raw.phys_start,
                size: raw.size,
            },
            virt_start: raw.virt_start,
            flags: MemFlags::from_bits_retain(raw.flags),
        })
        .collect();

    let irqchips = reader
        .read_n::<RawIrqChip>(counts.irqchips, "irqchip")?
        .into_iter()
        .map(|raw| IrqChip {
            controller_address: raw.address,
            id: raw.id,
            pin_base: raw.pin_base,
            pin_bitmap: raw.pin_bitmap,
        })
        .collect();

    let pci_devices = reader
        .read_n::<RawPciDevice>(counts.pci_devices, "PCI device")?
        .iter()
        .map(decode_pci_device)
        .collect::<Result<Vec<_>, _>>()?;

    let stream_ids = reader
        .read_n::<RawStreamId>(counts.stream_ids, "stream id")?
        .into_iter()
        .map(|raw| StreamId {
            id: raw.id,
            mask_out: raw.mask_out,
        })
        .collect();

    let qos_devices = reader
        .read_n::<RawQosDevice>(counts.qos_devices, "QoS device")?
        .into_iter()
        .map(|raw| {
            Ok(QosDevice {
                name: decode_name(&raw.name, "QoS device name")?,
                flags: QosFlags::from_bits_retain(raw.flags),
                base: raw.base,
            })
        })
        .collect::<Result<Vec<_>, DecodeError>>()?;

    trace!(
        "decoded cell '{}': {} memory regions, {} irqchips, {} PCI devices, {} stream ids, {} QoS devices",
        name,
        counts.memory_regions,
        counts.irqchips,
        counts.pci_devices,
        counts.stream_ids,
        counts.qos_devices
    );

    Ok(Partition {
        name,
        cpu_set,
        memory_regions: bounded(memory_regions, "memory region")?,
        irqchips: bounded(irqchips, "irqchip")?,
        pci_devices: bounded(pci_devices, "PCI device")?,
        stream_ids: bounded(stream_ids, "stream id")?,
        qos_devices: bounded(qos_devices, "QoS device")?,
        vpci_irq_base: header.vpci_irq_base,
    })
}

/// Parses a system blob. Structure is checked here; semantics are left to
/// [`crate::validate`].
pub fn decode(bytes: &[u8]) -> Result<SystemDescriptor, DecodeError> {
    let mut reader = Reader { bytes };
    let preamble = read_preamble(&mut reader, SYSTEM_SIGNATURE)?;
    let info: RawSystemInfo = reader.read("system information")?;
    let header: RawCellHeader = reader.read("root cell header")?;
    let counts = Counts::from_header(&header)?;
    reader.expect_exactly(counts.payload_size(), "root cell resources")?;

    let architecture = decode_architecture(preamble.architecture)?;
    let hypervisor_memory = AddressRange {
        start: info.hypervisor_phys_start,
        size: info.hypervisor_size,
    };
    let debug_console = decode_console(&info.debug_console)?;
    let platform_info = decode_platform(&info, architecture)?;
    let root = decode_partition(&mut reader, &header, &counts)?;

    Ok(SystemDescriptor {
        signature: preamble.signature,
        revision: preamble.revision,
        architecture,
        flags: SysFlags::from_bits_retain(preamble.flags),
        hypervisor_memory,
        debug_console,
        platform_info,
        root,
    })
}

pub fn decode_cell(bytes: &[u8]) -> Result<CellDescriptor, DecodeError> {
    let mut reader = Reader { bytes };
    let preamble = read_preamble(&mut reader, CELL_SIGNATURE)?;
    let header: RawCellHeader = reader.read("cell header")?;
    let counts = Counts::from_header(&header)?;
    reader.expect_exactly(counts.payload_size(), "cell resources")?;

    let architecture = decode_architecture(preamble.architecture)?;
    let console = decode_console(&header.console)?;
    let partition = decode_partition(&mut reader, &header, &counts)?;

    Ok(CellDescriptor {
        signature: preamble.signature,
        revision: preamble.revision,
        architecture,
        flags: CellFlags::from_bits_retain(preamble.flags),
        console,
        cpu_reset_address: header.cpu_reset_address,
        msg_reply_timeout: header.msg_reply_timeout,
        partition,
    })
}

/// Decodes either kind of blob, telling them apart by signature.
pub fn decode_descriptor(bytes: &[u8]) -> Result<Descriptor, DecodeError> {
    if bytes.starts_with(&CELL_SIGNATURE) {
        decode_cell(bytes).map(Descriptor::Cell)
    } else {
        decode(bytes).map(Descriptor::System)
    }
}

/// Whether `bytes` look like a loader blob rather than a text description.
pub fn has_signature(bytes: &[u8]) -> bool {
    bytes.starts_with(&SYSTEM_SIGNATURE) || bytes.starts_with(&CELL_SIGNATURE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::IVSHMEM_BAR_MASK_MSIX;
    use std::mem::offset_of;

    fn sample_system() -> SystemDescriptor {
        let mut sys = crate::validate::tests::system();
        sys.flags = SysFlags::VIRTUAL_DEBUG_CONSOLE;
        sys.debug_console = Console::mmio(ConsoleKind::Uart8250, 0xfe66_0000, 0x1_0000);
        sys.platform_info.pci_is_virtual = true;
        sys.platform_info.pci_domain = 3;
        sys.platform_info.pci_mmconfig_base = 0xf6c0_0000;
        sys.platform_info.color.way_size = 0x1_0000;
        sys.platform_info
            .iommu_units
            .push(IommuUnit {
                kind: IommuKind::ArmMmu500,
                base: 0xfd80_0000,
                size: 0x2_0000,
            })
            .unwrap();
        sys.platform_info.memguard.hv_timer = 26;
        for irq in [260, 261, 262, 263] {
            sys.platform_info.memguard.pmu_cpu_irq.push(irq).unwrap();
        }
        sys.root.memory_regions.push(MemoryRegion::placeholder()).unwrap();
        sys.root.stream_ids.push(StreamId { id: 0x870, mask_out: 0xf }).unwrap();
        sys.root
            .qos_devices
            .push(QosDevice::new("rpu0", QosFlags::HAS_REGUL, 0xfd74_2000).unwrap())
            .unwrap();
        let mut dev = PciDevice::ivshmem(
            3,
            Bdf::new(0, 1, 0).unwrap(),
            ShmemDescriptor {
                regions_start: 1,
                dev_id: 0,
                peers: 2,
                protocol: ShmemProtocol::VirtioBack(2),
            },
        );
        dev.bar_mask = IVSHMEM_BAR_MASK_MSIX;
        dev.num_msix_vectors = 16;
        dev.msi_64bits = true;
        sys.root.pci_devices.push(dev).unwrap();
        sys.root
            .pci_devices
            .push(PciDevice::passthrough(0, Bdf::new(1, 0, 0).unwrap(), [0xffff_0000; 6]))
            .unwrap();
        sys.root.vpci_irq_base = 252;
        sys
    }

    fn sample_cell() -> CellDescriptor {
        let mut cell = crate::validate::tests::cell("rk3568-linux-demo", 0b1100);
        cell.flags = CellFlags::PASSIVE_COMMREG;
        cell.console = Console::mmio(ConsoleKind::Uart8250, 0xfe6c_0000, 0x1_0000);
        cell.cpu_reset_address = 0x0b00_0000;
        cell.msg_reply_timeout = 100;
        cell.partition
            .memory_regions
            .push(MemoryRegion::comm_region(0x8000_0000, 0x1000).unwrap())
            .unwrap();
        cell.partition
            .irqchips
            .push(IrqChip::with_pins(0xfd40_0000, 288, [288, 289, 290, 291]).unwrap())
            .unwrap();
        cell.partition.vpci_irq_base = 256;
        cell
    }

    #[test]
    fn system_round_trip() {
        let sys = sample_system();
        let bytes = encode(&sys);
        assert_eq!(decode(&bytes).unwrap(), sys);
        assert_eq!(decode_descriptor(&bytes).unwrap(), Descriptor::System(sys));
    }

    #[test]
    fn cell_round_trip() {
        let cell = sample_cell();
        let bytes = encode_cell(&cell);
        assert_eq!(decode_cell(&bytes).unwrap(), cell);
        assert!(has_signature(&bytes));
    }

    #[test]
    fn x86_round_trip() {
        let mut sys = sample_system();
        sys.architecture = Architecture::X86;
        sys.platform_info.arch = ArchPlatform::X86(X86Info {
            pm_timer_address: 0x408,
            apic_mode: 1,
            vtd_interrupt_limit: 256,
            tsc_khz: 2_000_000,
            apic_khz: 100_000,
        });
        assert_eq!(decode(&encode(&sys)).unwrap(), sys);
    }

    #[test]
    fn record_sizes() {
        assert_eq!(size_of::<RawMemory>(), 32);
        assert_eq!(size_of::<RawIrqChip>(), 32);
        assert_eq!(size_of::<RawStreamId>(), 8);
        assert_eq!(size_of::<RawQosDevice>(), 32);
        assert_eq!(size_of::<RawGic>(), ARCH_INFO_LEN);
        assert_eq!(size_of::<RawX86>(), ARCH_INFO_LEN);
    }

    #[test]
    fn rejects_bad_signature() {
        let bytes = encode_cell(&sample_cell());
        assert!(matches!(
            decode(&bytes),
            Err(DecodeError::BadSignature {
                found: CELL_SIGNATURE,
                ..
            })
        ));
        assert!(matches!(
            decode_cell(&encode(&sample_system())),
            Err(DecodeError::BadSignature { .. })
        ));
    }

    #[test]
    fn rejects_other_revision() {
        let mut sys = sample_system();
        sys.revision = CONFIG_REVISION - 1;
        assert_eq!(
            decode(&encode(&sys)),
            Err(DecodeError::UnsupportedRevision {
                found: CONFIG_REVISION - 1,
                expected: CONFIG_REVISION
            })
        );
    }

    #[test]
    fn rejects_truncated_and_trailing() {
        let bytes = encode(&sample_system());
        assert!(matches!(
            decode(&bytes[..bytes.len() - 1]),
            Err(DecodeError::TruncatedInput { .. })
        ));
        assert!(matches!(
            decode(&bytes[..3]),
            Err(DecodeError::TruncatedInput { .. })
        ));
        assert!(matches!(
            decode(&bytes[..100]),
            Err(DecodeError::TruncatedInput { .. })
        ));

        let mut longer = bytes.clone();
        longer.push(0);
        assert_eq!(decode(&longer), Err(DecodeError::TrailingBytes { count: 1 }));
    }

    #[test]
    fn rejects_oversized_count_before_payload() {
        let mut bytes = encode_cell(&sample_cell());
        let offset = size_of::<RawPreamble>() + offset_of!(RawCellHeader, num_memory_regions);
        bytes[offset..offset + 4].copy_from_slice(&257u32.to_ne_bytes());
        assert_eq!(
            decode_cell(&bytes),
            Err(DecodeError::CountExceedsCapacity {
                what: "memory region",
                count: 257,
                capacity: MAX_MEMORY_REGIONS
            })
        );

        let mut bytes = encode_cell(&sample_cell());
        let offset = size_of::<RawPreamble>() + offset_of!(RawCellHeader, cpu_set_size);
        bytes[offset..offset + 4].copy_from_slice(&12u32.to_ne_bytes());
        assert!(matches!(
            decode_cell(&bytes),
            Err(DecodeError::InvalidField { what: "CPU set size", .. })
        ));
    }

    #[test]
    fn rejects_unknown_codes() {
        let mut bytes = encode_cell(&sample_cell());
        let offset = size_of::<RawPreamble>()
            + offset_of!(RawCellHeader, console)
            + offset_of!(RawConsole, kind);
        bytes[offset..offset + 2].copy_from_slice(&42u16.to_ne_bytes());
        assert!(matches!(
            decode_cell(&bytes),
            Err(DecodeError::InvalidField { what: "console type", .. })
        ));
    }
}
