//
// Copyright 2024, UNSW
//
// SPDX-License-Identifier: BSD-2-Clause
//

//! Resource records owned by a single partition.
//!
//! Fields are public so that board tooling and the decoder can express
//! anything the loader ABI can carry. The constructors reject values that make
//! no sense on their own; everything that relates one record to another is
//! left to [`crate::validate`].

use bitflags::bitflags;
use serde::Serialize;

use crate::bounded::BoundedVec;
use crate::types::{check_name, AddressRange, Bdf, ConstructionError, CpuSet, MemFlags};
use crate::{
    CELL_NAME_MAXLEN, IRQCHIP_PINS, MAX_IRQCHIPS, MAX_MEMORY_REGIONS, MAX_PCI_DEVICES,
    MAX_QOS_DEVICES, MAX_STREAM_IDS, PAGE_SIZE, QOS_NAME_MAXLEN, VPCI_IRQ_LINES,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct MemoryRegion {
    pub phys: AddressRange,
    pub virt_start: u64,
    pub flags: MemFlags,
}

impl MemoryRegion {
    pub fn new(
        phys_start: u64,
        virt_start: u64,
        size: u64,
        flags: MemFlags,
    ) -> Result<MemoryRegion, ConstructionError> {
        let phys = AddressRange::new(phys_start, size)?;
        if virt_start.checked_add(size).is_none() {
            return Err(ConstructionError::AddressOverflow {
                start: virt_start,
                size,
            });
        }

        // MMIO regions may cover a fraction of a page, the hypervisor
        // dispatches those accesses itself.
        if !flags.contains(MemFlags::IO) {
            for (what, value) in [
                ("physical start", phys_start),
                ("virtual start", virt_start),
                ("size", size),
            ] {
                if !value.is_multiple_of(PAGE_SIZE) {
                    return Err(ConstructionError::Misaligned {
                        what,
                        value,
                        alignment: PAGE_SIZE,
                    });
                }
            }
        }

        Ok(MemoryRegion {
            phys,
            virt_start,
            flags,
        })
    }

    /// Region mapped at its physical address.
    pub fn identity(
        phys_start: u64,
        size: u64,
        flags: MemFlags,
    ) -> Result<MemoryRegion, ConstructionError> {
        MemoryRegion::new(phys_start, phys_start, size, flags)
    }

    /// The communication page between the hypervisor and a cell. It has no
    /// physical backing in the descriptor.
    pub fn comm_region(virt_start: u64, size: u64) -> Result<MemoryRegion, ConstructionError> {
        if size == 0 {
            return Err(ConstructionError::EmptyRange);
        }
        let virt = AddressRange::new(virt_start, size)?;
        if !virt.is_aligned(PAGE_SIZE) {
            return Err(ConstructionError::Misaligned {
                what: "communication region",
                value: virt_start | size,
                alignment: PAGE_SIZE,
            });
        }
        Ok(MemoryRegion {
            phys: AddressRange { start: 0, size },
            virt_start,
            flags: MemFlags::READ | MemFlags::WRITE | MemFlags::COMM_REGION,
        })
    }

    /// All-zero entry standing for an absent section of an IVSHMEM layout.
    pub const fn placeholder() -> MemoryRegion {
        MemoryRegion {
            phys: AddressRange { start: 0, size: 0 },
            virt_start: 0,
            flags: MemFlags::empty(),
        }
    }

    pub fn is_placeholder(&self) -> bool {
        *self == MemoryRegion::placeholder()
    }

    pub fn is_comm_region(&self) -> bool {
        self.flags.contains(MemFlags::COMM_REGION)
    }

    /// Whether the region claims physical memory that other regions could
    /// collide with.
    pub fn has_physical_backing(&self) -> bool {
        !self.is_placeholder() && !self.is_comm_region() && !self.phys.is_empty()
    }

    pub fn virt(&self) -> AddressRange {
        AddressRange {
            start: self.virt_start,
            size: self.phys.size,
        }
    }

    pub fn is_writable(&self) -> bool {
        self.flags.contains(MemFlags::WRITE)
    }
}

/// A slice of an interrupt controller: 128 lines starting at `pin_base`, of
/// which the set bits of `pin_bitmap` are assigned to the owning partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct IrqChip {
    pub controller_address: u64,
    pub id: u32,
    pub pin_base: u32,
    pub pin_bitmap: [u32; 4],
}

impl IrqChip {
    pub fn new(controller_address: u64, pin_base: u32, pin_bitmap: [u32; 4]) -> IrqChip {
        IrqChip {
            controller_address,
            id: 0,
            pin_base,
            pin_bitmap,
        }
    }

    /// Builds a chip from absolute pin numbers. Pins outside of
    /// `[pin_base, pin_base + 128)` are returned as the error.
    pub fn with_pins(
        controller_address: u64,
        pin_base: u32,
        pins: impl IntoIterator<Item = u32>,
    ) -> Result<IrqChip, u32> {
        let mut pin_bitmap = [0u32; 4];
        for pin in pins {
            let offset = pin.checked_sub(pin_base).filter(|o| *o < IRQCHIP_PINS).ok_or(pin)?;
            pin_bitmap[(offset / 32) as usize] |= 1 << (offset % 32);
        }
        Ok(IrqChip::new(controller_address, pin_base, pin_bitmap))
    }

    /// Absolute numbers of the assigned pins, ascending.
    pub fn pins(&self) -> impl Iterator<Item = u64> + '_ {
        let base = self.pin_base as u64;
        self.pin_bitmap
            .iter()
            .enumerate()
            .flat_map(move |(word, bits)| {
                (0..32u64)
                    .filter(move |bit| bits & (1 << bit) != 0)
                    .map(move |bit| base + word as u64 * 32 + bit)
            })
    }

    /// Lines covered by this entry, assigned or not.
    pub fn pin_range(&self) -> (u64, u64) {
        let base = self.pin_base as u64;
        (base, base + IRQCHIP_PINS as u64)
    }

    pub fn owns(&self, pin: u64) -> bool {
        let (start, end) = self.pin_range();
        if pin < start || pin >= end {
            return false;
        }
        let offset = pin - start;
        self.pin_bitmap[(offset / 32) as usize] & (1 << (offset % 32)) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.pin_bitmap.iter().all(|bits| *bits == 0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PciKind {
    Passthrough,
    Ivshmem,
}

impl PciKind {
    pub fn code(&self) -> u8 {
        match self {
            PciKind::Passthrough => 1,
            PciKind::Ivshmem => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<PciKind> {
        match code {
            1 => Some(PciKind::Passthrough),
            3 => Some(PciKind::Ivshmem),
            _ => None,
        }
    }
}

/// Payload of the 14-bit protocol selector carried by custom and virtio
/// protocols.
pub const SHMEM_PROTO_PAYLOAD_MASK: u16 = 0x3fff;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ShmemProtocol {
    Undefined,
    Veth,
    Custom(u16),
    VirtioFront(u16),
    VirtioBack(u16),
}

impl ShmemProtocol {
    pub fn code(&self) -> u16 {
        match *self {
            ShmemProtocol::Undefined => 0x0000,
            ShmemProtocol::Veth => 0x0001,
            ShmemProtocol::Custom(n) => 0x4000 | (n & SHMEM_PROTO_PAYLOAD_MASK),
            ShmemProtocol::VirtioFront(n) => 0x8000 | (n & SHMEM_PROTO_PAYLOAD_MASK),
            ShmemProtocol::VirtioBack(n) => 0xc000 | (n & SHMEM_PROTO_PAYLOAD_MASK),
        }
    }

    pub fn from_code(code: u16) -> Option<ShmemProtocol> {
        let payload = code & SHMEM_PROTO_PAYLOAD_MASK;
        match code & !SHMEM_PROTO_PAYLOAD_MASK {
            0x0000 => match code {
                0x0000 => Some(ShmemProtocol::Undefined),
                0x0001 => Some(ShmemProtocol::Veth),
                _ => None,
            },
            0x4000 => Some(ShmemProtocol::Custom(payload)),
            0x8000 => Some(ShmemProtocol::VirtioFront(payload)),
            _ => Some(ShmemProtocol::VirtioBack(payload)),
        }
    }

    /// Payload that would not survive encoding.
    pub fn payload_overflows(&self) -> bool {
        match *self {
            ShmemProtocol::Custom(n) | ShmemProtocol::VirtioFront(n) | ShmemProtocol::VirtioBack(n) => {
                n > SHMEM_PROTO_PAYLOAD_MASK
            }
            _ => false,
        }
    }
}

/// Shared-memory link description of an IVSHMEM device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ShmemDescriptor {
    /// Index of the first memory region of the device's run.
    pub regions_start: u32,
    pub dev_id: u32,
    pub peers: u32,
    pub protocol: ShmemProtocol,
}

/// Number of memory regions an IVSHMEM device with `peers` peers references:
/// state table, read-write section and one output section per peer, padded
/// to whole groups of four.
pub fn ivshmem_region_count(peers: u32) -> usize {
    if peers <= 2 {
        4
    } else {
        4 + 4 * (peers as usize - 2)
    }
}

pub const IVSHMEM_BAR_MASK_INTX: [u32; 6] = [0xffff_f000, 0, 0, 0, 0, 0];
pub const IVSHMEM_BAR_MASK_MSIX: [u32; 6] = [0xffff_f000, 0xffff_fe00, 0, 0, 0, 0];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct PciDevice {
    pub kind: PciKind,
    pub iommu: u8,
    pub domain: u16,
    pub bdf: Bdf,
    pub bar_mask: [u32; 6],
    pub num_msi_vectors: u8,
    pub msi_64bits: bool,
    pub msi_maskable: bool,
    pub num_msix_vectors: u16,
    pub msix_region_size: u16,
    pub msix_address: u64,
    pub shmem: Option<ShmemDescriptor>,
}

impl PciDevice {
    pub fn passthrough(domain: u16, bdf: Bdf, bar_mask: [u32; 6]) -> PciDevice {
        PciDevice {
            kind: PciKind::Passthrough,
            iommu: 0,
            domain,
            bdf,
            bar_mask,
            num_msi_vectors: 0,
            msi_64bits: false,
            msi_maskable: false,
            num_msix_vectors: 0,
            msix_region_size: 0,
            msix_address: 0,
            shmem: None,
        }
    }

    /// An IVSHMEM device with INTx signalling.
    pub fn ivshmem(domain: u16, bdf: Bdf, shmem: ShmemDescriptor) -> PciDevice {
        PciDevice {
            kind: PciKind::Ivshmem,
            bar_mask: IVSHMEM_BAR_MASK_INTX,
            shmem: Some(shmem),
            ..PciDevice::passthrough(domain, bdf, [0; 6])
        }
    }

    pub fn is_ivshmem(&self) -> bool {
        self.kind == PciKind::Ivshmem
    }

    /// `dddd:bb:dd.f`
    pub fn address(&self) -> String {
        format!("{:04x}:{}", self.domain, self.bdf)
    }
}

/// A stream of DMA transactions routed through an IOMMU. Stream `s` matches
/// when it equals `id` in every bit not set in `mask_out`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct StreamId {
    pub id: u32,
    pub mask_out: u32,
}

impl StreamId {
    pub fn new(id: u32) -> StreamId {
        StreamId { id, mask_out: 0 }
    }

    pub fn matches(&self, stream: u32) -> bool {
        (stream & !self.mask_out) == (self.id & !self.mask_out)
    }

    /// Whether some stream matches both entries.
    pub fn conflicts_with(&self, other: &StreamId) -> bool {
        let compared = !self.mask_out & !other.mask_out;
        (self.id & compared) == (other.id & compared)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
    pub struct QosFlags: u32 {
        const HAS_REGUL = 0x1;
        const HAS_RWQOS = 0x2;
        const HAS_RWMAXTRANS = 0x4;
    }
}

/// A bus master whose traffic is regulated through the platform QoS window.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct QosDevice {
    pub name: String,
    pub flags: QosFlags,
    pub base: u64,
}

impl QosDevice {
    pub fn new(name: &str, flags: QosFlags, base: u64) -> Result<QosDevice, ConstructionError> {
        check_name(name, QOS_NAME_MAXLEN)?;
        Ok(QosDevice {
            name: name.to_string(),
            flags,
            base,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConsoleKind {
    None,
    Efifb,
    Uart8250,
    Pl011,
    XuartPs,
    Mvebu,
    Hscif,
    Scifa,
    Imx,
    ImxLpuart,
}

impl ConsoleKind {
    const ALL: [ConsoleKind; 10] = [
        ConsoleKind::None,
        ConsoleKind::Efifb,
        ConsoleKind::Uart8250,
        ConsoleKind::Pl011,
        ConsoleKind::XuartPs,
        ConsoleKind::Mvebu,
        ConsoleKind::Hscif,
        ConsoleKind::Scifa,
        ConsoleKind::Imx,
        ConsoleKind::ImxLpuart,
    ];

    pub fn code(&self) -> u16 {
        *self as u16
    }

    pub fn from_code(code: u16) -> Option<ConsoleKind> {
        ConsoleKind::ALL.get(code as usize).copied()
    }

    pub fn name(&self) -> &'static str {
        match self {
            ConsoleKind::None => "none",
            ConsoleKind::Efifb => "efifb",
            ConsoleKind::Uart8250 => "8250",
            ConsoleKind::Pl011 => "pl011",
            ConsoleKind::XuartPs => "xuartps",
            ConsoleKind::Mvebu => "mvebu",
            ConsoleKind::Hscif => "hscif",
            ConsoleKind::Scifa => "scifa",
            ConsoleKind::Imx => "imx",
            ConsoleKind::ImxLpuart => "imx-lpuart",
        }
    }

    pub fn from_name(name: &str) -> Option<ConsoleKind> {
        ConsoleKind::ALL.iter().copied().find(|kind| kind.name() == name)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
    pub struct ConsoleFlags: u16 {
        const ACCESS_MMIO = 0x0001;
        const REGDIST_4 = 0x0002;
        const FB_1920X1080 = 0x0004;
        const INVERTED_GATE = 0x1000;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Console {
    pub address: u64,
    pub size: u32,
    pub kind: ConsoleKind,
    pub flags: ConsoleFlags,
    pub divider: u32,
    pub gate_nr: u32,
    pub clock_reg: u64,
}

impl Console {
    pub const fn none() -> Console {
        Console {
            address: 0,
            size: 0,
            kind: ConsoleKind::None,
            flags: ConsoleFlags::empty(),
            divider: 0,
            gate_nr: 0,
            clock_reg: 0,
        }
    }

    /// A memory-mapped UART with 32-bit register spacing.
    pub fn mmio(kind: ConsoleKind, address: u64, size: u32) -> Console {
        Console {
            address,
            size,
            kind,
            flags: ConsoleFlags::ACCESS_MMIO | ConsoleFlags::REGDIST_4,
            ..Console::none()
        }
    }

    pub fn is_none(&self) -> bool {
        self.kind == ConsoleKind::None
    }
}

impl Default for Console {
    fn default() -> Self {
        Console::none()
    }
}

/// Resources assigned to one cell.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Partition {
    pub name: String,
    pub cpu_set: CpuSet,
    pub memory_regions: BoundedVec<MemoryRegion, MAX_MEMORY_REGIONS>,
    pub irqchips: BoundedVec<IrqChip, MAX_IRQCHIPS>,
    pub pci_devices: BoundedVec<PciDevice, MAX_PCI_DEVICES>,
    pub stream_ids: BoundedVec<StreamId, MAX_STREAM_IDS>,
    pub qos_devices: BoundedVec<QosDevice, MAX_QOS_DEVICES>,
    /// First virtual INTx line of the virtual PCI host controller, relative
    /// to the SPI space on ARM.
    pub vpci_irq_base: u32,
}

impl Partition {
    pub fn new(name: &str, cpu_set: CpuSet) -> Result<Partition, ConstructionError> {
        check_name(name, CELL_NAME_MAXLEN)?;
        Ok(Partition {
            name: name.to_string(),
            cpu_set,
            memory_regions: BoundedVec::new(),
            irqchips: BoundedVec::new(),
            pci_devices: BoundedVec::new(),
            stream_ids: BoundedVec::new(),
            qos_devices: BoundedVec::new(),
            vpci_irq_base: 0,
        })
    }

    /// IVSHMEM devices that carry a shared-memory description, with their
    /// index in `pci_devices`.
    pub fn ivshmem_devices(&self) -> impl Iterator<Item = (usize, &PciDevice, &ShmemDescriptor)> {
        self.pci_devices
            .iter()
            .enumerate()
            .filter(|(_, dev)| dev.is_ivshmem())
            .filter_map(|(i, dev)| dev.shmem.as_ref().map(|shmem| (i, dev, shmem)))
    }

    /// Number of virtual PCI interrupt lines the partition uses.
    pub fn vpci_irq_lines(&self) -> u32 {
        if self.pci_devices.iter().any(|dev| dev.is_ivshmem()) {
            VPCI_IRQ_LINES
        } else {
            0
        }
    }

    pub fn owns_pin(&self, pin: u64) -> bool {
        self.irqchips.iter().any(|chip| chip.owns(pin))
    }
}
