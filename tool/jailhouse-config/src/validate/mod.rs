//
// Copyright 2024, UNSW
//
// SPDX-License-Identifier: BSD-2-Clause
//

//! Joint validation of a system descriptor and the guest cells that run on
//! it.
//!
//! Every check is a function over the shared [`Layout`] that appends to the
//! same [`Findings`]. Nothing stops at the first problem: the caller always
//! gets the complete list, so a board configuration can be fixed in one pass.

mod irq;
mod memory;
mod pci;
mod platform;

use serde::Serialize;
use std::fmt;
use tracing::debug;

use crate::abi;
use crate::region::Partition;
use crate::system::{CellDescriptor, PlatformInfo, SystemDescriptor};
use crate::types::Architecture;
use crate::PAGE_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum InvariantId {
    MemoryOverlap,
    HypervisorOverlap,
    IvshmemLayout,
    DuplicateBdf,
    IrqChip,
    VpciIrq,
    QosDevice,
    RangeAlignment,
    Header,
    CpuSet,
    PartitionName,
    RegionFlags,
    PciDevice,
    IvshmemLink,
    StreamId,
    CommRegion,
    Platform,
    Memguard,
}

impl InvariantId {
    pub fn name(&self) -> &'static str {
        match self {
            InvariantId::MemoryOverlap => "memory-overlap",
            InvariantId::HypervisorOverlap => "hypervisor-overlap",
            InvariantId::IvshmemLayout => "ivshmem-layout",
            InvariantId::DuplicateBdf => "duplicate-bdf",
            InvariantId::IrqChip => "irqchip",
            InvariantId::VpciIrq => "vpci-irq",
            InvariantId::QosDevice => "qos-device",
            InvariantId::RangeAlignment => "range-alignment",
            InvariantId::Header => "header",
            InvariantId::CpuSet => "cpu-set",
            InvariantId::PartitionName => "partition-name",
            InvariantId::RegionFlags => "region-flags",
            InvariantId::PciDevice => "pci-device",
            InvariantId::IvshmemLink => "ivshmem-link",
            InvariantId::StreamId => "stream-id",
            InvariantId::CommRegion => "comm-region",
            InvariantId::Platform => "platform",
            InvariantId::Memguard => "memguard",
        }
    }
}

impl fmt::Display for InvariantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
        }
    }
}

/// What a violation is about.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Entity {
    Partition { partition: String },
    HypervisorMemory,
    MemoryRegion { partition: String, index: usize },
    IrqChip { partition: String, index: usize },
    PciDevice { partition: String, index: usize, address: String },
    StreamId { partition: String, index: usize },
    QosDevice { partition: String, index: usize, name: String },
    /// `None` is the system debug console.
    Console { partition: Option<String> },
    IommuUnit { index: usize },
    Platform { field: &'static str },
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entity::Partition { partition } => write!(f, "cell '{partition}'"),
            Entity::HypervisorMemory => write!(f, "hypervisor memory"),
            Entity::MemoryRegion { partition, index } => {
                write!(f, "memory region #{index} of '{partition}'")
            }
            Entity::IrqChip { partition, index } => write!(f, "irqchip #{index} of '{partition}'"),
            Entity::PciDevice {
                partition, address, ..
            } => write!(f, "PCI device {address} of '{partition}'"),
            Entity::StreamId { partition, index } => {
                write!(f, "stream id #{index} of '{partition}'")
            }
            Entity::QosDevice {
                partition, name, ..
            } => write!(f, "QoS device '{name}' of '{partition}'"),
            Entity::Console { partition: None } => write!(f, "debug console"),
            Entity::Console {
                partition: Some(partition),
            } => write!(f, "console of '{partition}'"),
            Entity::IommuUnit { index } => write!(f, "IOMMU unit #{index}"),
            Entity::Platform { field } => write!(f, "platform field '{field}'"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub invariant: InvariantId,
    pub severity: Severity,
    pub message: String,
    pub entities: Vec<Entity>,
}

impl Violation {
    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }

    pub fn mentions(&self, entity: &Entity) -> bool {
        self.entities.contains(entity)
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]: {}", self.severity, self.invariant, self.message)
    }
}

/// Which partitions are allowed to alias shared memory with each other.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SharingTopology {
    /// The root cell and every supplied guest cell form one sharing group.
    #[default]
    AllPeers,
    /// Only the listed pairs of partition names share. Order within a pair
    /// does not matter.
    Declared(Vec<(String, String)>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationConfig {
    /// Granule memory regions and platform frames are aligned to.
    pub page_size: u64,
    pub sharing: SharingTopology,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        ValidationConfig {
            page_size: PAGE_SIZE,
            sharing: SharingTopology::AllPeers,
        }
    }
}

/// Index of the root cell in [`Layout::partitions`].
pub(crate) const ROOT: usize = 0;

/// The joint view every check works on: the root cell at index 0 followed by
/// the guest cells in the order they were supplied.
pub(crate) struct Layout<'a> {
    pub system: &'a SystemDescriptor,
    pub cells: &'a [CellDescriptor],
    pub config: &'a ValidationConfig,
    pub partitions: Vec<&'a Partition>,
}

impl<'a> Layout<'a> {
    fn new(
        system: &'a SystemDescriptor,
        cells: &'a [CellDescriptor],
        config: &'a ValidationConfig,
    ) -> Layout<'a> {
        let mut partitions = vec![&system.root];
        partitions.extend(cells.iter().map(|cell| &cell.partition));
        Layout {
            system,
            cells,
            config,
            partitions,
        }
    }

    pub fn arch(&self) -> Architecture {
        self.system.architecture
    }

    pub fn platform(&self) -> &'a PlatformInfo {
        &self.system.platform_info
    }

    pub fn page_size(&self) -> u64 {
        self.config.page_size
    }

    pub fn guests(&self) -> impl Iterator<Item = (usize, &'a Partition)> + '_ {
        self.partitions.iter().copied().enumerate().skip(1)
    }

    pub fn name(&self, partition: usize) -> &'a str {
        &self.partitions[partition].name
    }

    /// Whether regions of partitions `a` and `b` may alias shared memory.
    pub fn shares(&self, a: usize, b: usize) -> bool {
        if a == b {
            return true;
        }
        match &self.config.sharing {
            SharingTopology::AllPeers => true,
            SharingTopology::Declared(pairs) => {
                let (a, b) = (self.name(a), self.name(b));
                pairs
                    .iter()
                    .any(|(x, y)| (x == a && y == b) || (x == b && y == a))
            }
        }
    }

    pub fn partition_entity(&self, partition: usize) -> Entity {
        Entity::Partition {
            partition: self.name(partition).to_string(),
        }
    }

    pub fn region_entity(&self, partition: usize, index: usize) -> Entity {
        Entity::MemoryRegion {
            partition: self.name(partition).to_string(),
            index,
        }
    }

    pub fn chip_entity(&self, partition: usize, index: usize) -> Entity {
        Entity::IrqChip {
            partition: self.name(partition).to_string(),
            index,
        }
    }

    pub fn pci_entity(&self, partition: usize, index: usize) -> Entity {
        Entity::PciDevice {
            partition: self.name(partition).to_string(),
            index,
            address: self.partitions[partition].pci_devices[index].address(),
        }
    }

    pub fn stream_entity(&self, partition: usize, index: usize) -> Entity {
        Entity::StreamId {
            partition: self.name(partition).to_string(),
            index,
        }
    }

    pub fn qos_entity(&self, partition: usize, index: usize) -> Entity {
        Entity::QosDevice {
            partition: self.name(partition).to_string(),
            index,
            name: self.partitions[partition].qos_devices[index].name.clone(),
        }
    }
}

#[derive(Default)]
pub(crate) struct Findings {
    violations: Vec<Violation>,
}

impl Findings {
    pub fn error(&mut self, invariant: InvariantId, message: String, entities: Vec<Entity>) {
        self.push(invariant, Severity::Error, message, entities);
    }

    pub fn warning(&mut self, invariant: InvariantId, message: String, entities: Vec<Entity>) {
        self.push(invariant, Severity::Warning, message, entities);
    }

    fn push(
        &mut self,
        invariant: InvariantId,
        severity: Severity,
        message: String,
        entities: Vec<Entity>,
    ) {
        self.violations.push(Violation {
            invariant,
            severity,
            message,
            entities,
        });
    }
}

/// Every finding, errors and warnings, for the system and its guest cells.
pub fn check(system: &SystemDescriptor, peers: &[CellDescriptor]) -> Vec<Violation> {
    check_with(system, peers, &ValidationConfig::default())
}

pub fn check_with(
    system: &SystemDescriptor,
    peers: &[CellDescriptor],
    config: &ValidationConfig,
) -> Vec<Violation> {
    let layout = Layout::new(system, peers, config);
    let mut findings = Findings::default();

    platform::check_headers(&layout, &mut findings);
    platform::check_names(&layout, &mut findings);
    platform::check_cpus(&layout, &mut findings);
    platform::check_consoles(&layout, &mut findings);
    platform::check_platform(&layout, &mut findings);
    platform::check_memguard(&layout, &mut findings);
    platform::check_qos(&layout, &mut findings);
    platform::check_stream_ids(&layout, &mut findings);

    memory::check_hypervisor_memory(&layout, &mut findings);
    memory::check_regions(&layout, &mut findings);
    memory::check_overlaps(&layout, &mut findings);

    pci::check_devices(&layout, &mut findings);
    pci::check_bdfs(&layout, &mut findings);
    pci::check_ivshmem_layout(&layout, &mut findings);
    pci::check_ivshmem_links(&layout, &mut findings);

    irq::check_irqchips(&layout, &mut findings);
    irq::check_guest_pins(&layout, &mut findings);
    irq::check_vpci(&layout, &mut findings);

    let violations = findings.violations;
    debug!(
        "validated '{}' with {} guest cell(s): {} error(s), {} warning(s)",
        system.root.name,
        peers.len(),
        violations.iter().filter(|v| v.is_error()).count(),
        violations.iter().filter(|v| !v.is_error()).count()
    );

    violations
}

/// Accepts the descriptor set unless at least one finding is an error. The
/// error carries every finding, warnings included.
pub fn validate(system: &SystemDescriptor, peers: &[CellDescriptor]) -> Result<(), Vec<Violation>> {
    validate_with(system, peers, &ValidationConfig::default())
}

pub fn validate_with(
    system: &SystemDescriptor,
    peers: &[CellDescriptor],
    config: &ValidationConfig,
) -> Result<(), Vec<Violation>> {
    let violations = check_with(system, peers, config);
    if violations.iter().any(Violation::is_error) {
        Err(violations)
    } else {
        Ok(())
    }
}

/// A descriptor set that passed validation. Holding one is the only way to
/// get loader bytes out of [`Validated::encode`].
#[derive(Debug)]
pub struct Validated<'a> {
    system: &'a SystemDescriptor,
    cells: &'a [CellDescriptor],
    warnings: Vec<Violation>,
}

impl<'a> Validated<'a> {
    pub fn system(&self) -> &'a SystemDescriptor {
        self.system
    }

    pub fn cells(&self) -> &'a [CellDescriptor] {
        self.cells
    }

    pub fn warnings(&self) -> &[Violation] {
        &self.warnings
    }

    /// Loader blob of the system descriptor.
    pub fn encode(&self) -> Vec<u8> {
        abi::encode(self.system)
    }

    /// Loader blobs of the guest cells, in the order they were validated.
    pub fn encode_cells(&self) -> Vec<Vec<u8>> {
        self.cells.iter().map(abi::encode_cell).collect()
    }
}

pub fn validated<'a>(
    system: &'a SystemDescriptor,
    peers: &'a [CellDescriptor],
) -> Result<Validated<'a>, Vec<Violation>> {
    validated_with(system, peers, &ValidationConfig::default())
}

pub fn validated_with<'a>(
    system: &'a SystemDescriptor,
    peers: &'a [CellDescriptor],
    config: &ValidationConfig,
) -> Result<Validated<'a>, Vec<Violation>> {
    let violations = check_with(system, peers, config);
    if violations.iter().any(Violation::is_error) {
        return Err(violations);
    }
    Ok(Validated {
        system,
        cells: peers,
        warnings: violations,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::region::{IrqChip, MemoryRegion};
    use crate::system::{ArchPlatform, GicInfo};
    use crate::types::{AddressRange, CpuSet, MemFlags};
    use crate::Console;

    pub const GICD: u64 = 0xfd40_0000;

    /// A minimal ARM64 system: 4 CPUs, 1 GiB of RAM at 0x4000_0000 and the
    /// hypervisor right below it.
    pub fn system() -> SystemDescriptor {
        let mut root = Partition::new("root", CpuSet::from_mask(0b1111)).unwrap();
        root.memory_regions
            .push(
                MemoryRegion::identity(
                    0x4000_0000,
                    0x4000_0000,
                    MemFlags::READ | MemFlags::WRITE | MemFlags::EXECUTE,
                )
                .unwrap(),
            )
            .unwrap();
        root.irqchips
            .push(IrqChip::with_pins(GICD, 32, [40, 41]).unwrap())
            .unwrap();

        let mut platform = PlatformInfo::new(ArchPlatform::Arm(GicInfo {
            gic_version: 3,
            maintenance_irq: 25,
            gicd_base: GICD,
            gicr_base: 0xfd46_0000,
            ..GicInfo::default()
        }));
        platform.memguard.num_irqs = 352;

        SystemDescriptor::new(
            Architecture::Arm64,
            AddressRange::new(0x3fe0_0000, 0x20_0000).unwrap(),
            Console::none(),
            platform,
            root,
        )
    }

    pub fn cell(name: &str, cpus: u64) -> CellDescriptor {
        CellDescriptor::new(
            Architecture::Arm64,
            Console::none(),
            Partition::new(name, CpuSet::from_mask(cpus)).unwrap(),
        )
    }

    pub fn of_kind(violations: &[Violation], invariant: InvariantId) -> Vec<&Violation> {
        violations
            .iter()
            .filter(|v| v.invariant == invariant)
            .collect()
    }

    #[test]
    fn minimal_system_is_clean() {
        assert_eq!(check(&system(), &[]), vec![]);
        assert!(validate(&system(), &[]).is_ok());
    }

    #[test]
    fn warnings_do_not_fail_validation() {
        let mut sys = system();
        sys.root
            .memory_regions
            .push(MemoryRegion::comm_region(0x8000_0000, 0x1000).unwrap())
            .unwrap();
        let violations = check(&sys, &[]);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].severity, Severity::Warning);
        assert!(validate(&sys, &[]).is_ok());

        let token = validated(&sys, &[]).unwrap();
        assert_eq!(token.warnings().len(), 1);
        assert_eq!(token.encode(), abi::encode(&sys));
    }

    #[test]
    fn independent_violations_are_all_reported() {
        let mut sys = system();
        let rw = MemFlags::READ | MemFlags::WRITE;
        sys.root
            .memory_regions
            .push(MemoryRegion::identity(0x9000_0000, 0x2000, rw).unwrap())
            .unwrap();
        let bdf = crate::types::Bdf::new(0, 3, 0).unwrap();
        for _ in 0..2 {
            sys.root
                .pci_devices
                .push(crate::region::PciDevice::passthrough(0, bdf, [0; 6]))
                .unwrap();
        }
        sys.platform_info.memguard.num_irqs = 284;
        let mut bitmap = [0u32; 4];
        bitmap[0] = 1 << 10;
        sys.root.irqchips.push(IrqChip::new(GICD, 280, bitmap)).unwrap();

        let mut guest = cell("guest", 0b10);
        guest
            .partition
            .memory_regions
            .push(MemoryRegion::identity(0x9000_1000, 0x1000, rw).unwrap())
            .unwrap();

        let Err(violations) = validate(&sys, &[guest]) else {
            panic!("expected violations");
        };
        assert_eq!(of_kind(&violations, InvariantId::MemoryOverlap).len(), 1);
        assert_eq!(of_kind(&violations, InvariantId::DuplicateBdf).len(), 1);
        assert_eq!(of_kind(&violations, InvariantId::IrqChip).len(), 1);
    }

    #[test]
    fn declared_sharing() {
        let sys = system();
        let cells = [cell("a", 0b10), cell("b", 0b100)];
        let config = ValidationConfig {
            sharing: SharingTopology::Declared(vec![("b".to_string(), "root".to_string())]),
            ..ValidationConfig::default()
        };
        let layout = Layout::new(&sys, &cells, &config);
        assert!(layout.shares(2, ROOT));
        assert!(layout.shares(ROOT, 2));
        assert!(!layout.shares(1, ROOT));
        assert!(layout.shares(1, 1));

        let all = ValidationConfig::default();
        let layout = Layout::new(&sys, &cells, &all);
        assert!(layout.shares(1, 2));
    }

    #[test]
    fn violation_json() {
        let v = Violation {
            invariant: InvariantId::MemoryOverlap,
            severity: Severity::Error,
            message: "overlap".to_string(),
            entities: vec![
                Entity::HypervisorMemory,
                Entity::MemoryRegion {
                    partition: "root".to_string(),
                    index: 2,
                },
            ],
        };
        let json = serde_json::to_value(&v).unwrap();
        assert_eq!(json["invariant"], "memory-overlap");
        assert_eq!(json["severity"], "error");
        assert_eq!(json["entities"][0]["kind"], "hypervisor_memory");
        assert_eq!(json["entities"][1]["index"], 2);
        assert_eq!(v.to_string(), "error[memory-overlap]: overlap");
    }
}
