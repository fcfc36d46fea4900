//
// Copyright 2024, UNSW
//
// SPDX-License-Identifier: BSD-2-Clause
//

use bitflags::bitflags;
use serde::Serialize;

use crate::bounded::BoundedVec;
use crate::region::{Console, Partition};
use crate::types::{AddressRange, Architecture};
use crate::{CELL_SIGNATURE, CONFIG_REVISION, MAX_IOMMU_UNITS, MAX_PMU_IRQS, SYSTEM_SIGNATURE};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
    pub struct SysFlags: u32 {
        const VIRTUAL_DEBUG_CONSOLE = 0x1;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
    pub struct CellFlags: u32 {
        const PASSIVE_COMMREG = 0x0000_0001;
        const TEST_DEVICE = 0x0000_0002;
        const AARCH32 = 0x0000_0004;
        const VIRTUAL_CONSOLE_PERMITTED = 0x4000_0000;
        const VIRTUAL_CONSOLE_ACTIVE = 0x8000_0000;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum IommuKind {
    Amd,
    Intel,
    SmmuV3,
    Pvu,
    ArmMmu500,
}

impl IommuKind {
    pub fn code(&self) -> u32 {
        match self {
            IommuKind::Amd => 1,
            IommuKind::Intel => 2,
            IommuKind::SmmuV3 => 3,
            IommuKind::Pvu => 4,
            IommuKind::ArmMmu500 => 5,
        }
    }

    pub fn from_code(code: u32) -> Option<IommuKind> {
        match code {
            1 => Some(IommuKind::Amd),
            2 => Some(IommuKind::Intel),
            3 => Some(IommuKind::SmmuV3),
            4 => Some(IommuKind::Pvu),
            5 => Some(IommuKind::ArmMmu500),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> Option<IommuKind> {
        match name {
            "amd" => Some(IommuKind::Amd),
            "intel" => Some(IommuKind::Intel),
            "smmuv3" => Some(IommuKind::SmmuV3),
            "pvu" => Some(IommuKind::Pvu),
            "arm-mmu500" => Some(IommuKind::ArmMmu500),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct IommuUnit {
    pub kind: IommuKind,
    pub base: u64,
    pub size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct GicInfo {
    pub gic_version: u8,
    pub maintenance_irq: u8,
    pub gicd_base: u64,
    pub gicc_base: u64,
    pub gich_base: u64,
    pub gicv_base: u64,
    pub gicr_base: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct X86Info {
    pub pm_timer_address: u16,
    pub apic_mode: u8,
    pub vtd_interrupt_limit: u32,
    pub tsc_khz: u32,
    pub apic_khz: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ArchPlatform {
    Arm(GicInfo),
    X86(X86Info),
}

/// Cache colouring parameters. A zero `way_size` disables colouring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct ColorInfo {
    pub way_size: u64,
    pub root_map_offset: u64,
}

/// The interrupt budget of the platform and the memory-bandwidth regulator
/// parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize)]
pub struct MemguardInfo {
    /// Number of interrupt lines the platform controller implements. Zero
    /// means no budget is declared.
    pub num_irqs: u32,
    pub hv_timer: u32,
    pub irq_prio_min: u8,
    pub irq_prio_max: u8,
    pub irq_prio_step: u8,
    pub irq_prio_threshold: u8,
    pub pmu_cpu_irq: BoundedVec<u32, MAX_PMU_IRQS>,
}

/// Window of the QoS regulator registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct QosPlatform {
    pub nic_base: u64,
    pub nic_size: u64,
}

impl QosPlatform {
    pub fn window(&self) -> AddressRange {
        AddressRange {
            start: self.nic_base,
            size: self.nic_size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct PlatformInfo {
    pub pci_mmconfig_base: u64,
    pub pci_mmconfig_end_bus: u8,
    pub pci_is_virtual: bool,
    /// `0xffff` lets the hypervisor pick the domain.
    pub pci_domain: u16,
    pub iommu_units: BoundedVec<IommuUnit, MAX_IOMMU_UNITS>,
    pub arch: ArchPlatform,
    pub color: ColorInfo,
    pub memguard: MemguardInfo,
    pub qos: QosPlatform,
}

pub const PCI_DOMAIN_AUTO: u16 = 0xffff;

impl PlatformInfo {
    pub fn new(arch: ArchPlatform) -> PlatformInfo {
        PlatformInfo {
            pci_mmconfig_base: 0,
            pci_mmconfig_end_bus: 0,
            pci_is_virtual: false,
            pci_domain: PCI_DOMAIN_AUTO,
            iommu_units: BoundedVec::new(),
            arch,
            color: ColorInfo::default(),
            memguard: MemguardInfo::default(),
            qos: QosPlatform::default(),
        }
    }

    pub fn gic(&self) -> Option<&GicInfo> {
        match &self.arch {
            ArchPlatform::Arm(gic) => Some(gic),
            ArchPlatform::X86(_) => None,
        }
    }
}

/// The root cell together with the global platform parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SystemDescriptor {
    #[serde(serialize_with = "serialize_signature")]
    pub signature: [u8; 6],
    pub revision: u16,
    pub architecture: Architecture,
    pub flags: SysFlags,
    pub hypervisor_memory: AddressRange,
    pub debug_console: Console,
    pub platform_info: PlatformInfo,
    pub root: Partition,
}

impl SystemDescriptor {
    pub fn new(
        architecture: Architecture,
        hypervisor_memory: AddressRange,
        debug_console: Console,
        platform_info: PlatformInfo,
        root: Partition,
    ) -> SystemDescriptor {
        SystemDescriptor {
            signature: SYSTEM_SIGNATURE,
            revision: CONFIG_REVISION,
            architecture,
            flags: SysFlags::empty(),
            hypervisor_memory,
            debug_console,
            platform_info,
            root,
        }
    }
}

/// A guest cell that shares the platform with the root cell.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CellDescriptor {
    #[serde(serialize_with = "serialize_signature")]
    pub signature: [u8; 6],
    pub revision: u16,
    pub architecture: Architecture,
    pub flags: CellFlags,
    pub console: Console,
    pub cpu_reset_address: u64,
    pub msg_reply_timeout: u64,
    pub partition: Partition,
}

impl CellDescriptor {
    pub fn new(architecture: Architecture, console: Console, partition: Partition) -> CellDescriptor {
        CellDescriptor {
            signature: CELL_SIGNATURE,
            revision: CONFIG_REVISION,
            architecture,
            flags: CellFlags::empty(),
            console,
            cpu_reset_address: 0,
            msg_reply_timeout: 0,
            partition,
        }
    }
}

/// Either kind of loader blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Descriptor {
    System(SystemDescriptor),
    Cell(CellDescriptor),
}

impl Descriptor {
    pub fn partition(&self) -> &Partition {
        match self {
            Descriptor::System(system) => &system.root,
            Descriptor::Cell(cell) => &cell.partition,
        }
    }
}

fn serialize_signature<S: serde::Serializer>(signature: &[u8; 6], s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&String::from_utf8_lossy(signature))
}
