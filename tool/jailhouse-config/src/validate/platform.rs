//
// Copyright 2024, UNSW
//
// SPDX-License-Identifier: BSD-2-Clause
//

use std::collections::HashMap;

use super::{Entity, Findings, InvariantId, Layout, ROOT};
use crate::region::{Console, ConsoleFlags};
use crate::system::{ArchPlatform, CellFlags, IommuKind, SysFlags};
use crate::types::{AddressRange, Architecture};
use crate::util::is_power_of_two;
use crate::{CELL_NAME_MAXLEN, CELL_SIGNATURE, CONFIG_REVISION, QOS_NAME_MAXLEN, SYSTEM_SIGNATURE};

/// The MMCONFIG window of a virtual host bridge is mapped with 1 MiB per bus.
const MMCONFIG_ALIGNMENT: u64 = 0x10_0000;
/// Stream ids and masks of an MMU-500 are 15 bits wide.
const MMU500_STREAM_ID_MASK: u32 = 0x7fff;

pub(crate) fn check_headers(layout: &Layout, findings: &mut Findings) {
    let system = layout.system;
    let root = || vec![layout.partition_entity(ROOT)];

    if system.signature != SYSTEM_SIGNATURE {
        findings.error(
            InvariantId::Header,
            format!(
                "system descriptor signature is '{}', expected 'JHSYST'",
                String::from_utf8_lossy(&system.signature)
            ),
            root(),
        );
    }
    if system.revision != CONFIG_REVISION {
        findings.error(
            InvariantId::Header,
            format!(
                "system descriptor revision is {}, expected {CONFIG_REVISION}",
                system.revision
            ),
            root(),
        );
    }
    let arch_matches = match system.platform_info.arch {
        ArchPlatform::Arm(_) => system.architecture.is_arm(),
        ArchPlatform::X86(_) => system.architecture == Architecture::X86,
    };
    if !arch_matches {
        findings.error(
            InvariantId::Header,
            format!(
                "platform information does not describe an {} platform",
                system.architecture
            ),
            vec![Entity::Platform { field: "arch" }],
        );
    }
    if system.flags.bits() & !SysFlags::all().bits() != 0 {
        findings.error(
            InvariantId::Header,
            format!("unknown system flags 0x{:x}", system.flags.bits()),
            root(),
        );
    }

    for (i, cell) in layout.cells.iter().enumerate() {
        let p = i + 1;
        let entity = || vec![layout.partition_entity(p)];
        if cell.signature != CELL_SIGNATURE {
            findings.error(
                InvariantId::Header,
                format!(
                    "cell descriptor '{}' has signature '{}', expected 'JHCELL'",
                    cell.partition.name,
                    String::from_utf8_lossy(&cell.signature)
                ),
                entity(),
            );
        }
        if cell.revision != CONFIG_REVISION {
            findings.error(
                InvariantId::Header,
                format!(
                    "cell descriptor '{}' has revision {}, expected {CONFIG_REVISION}",
                    cell.partition.name, cell.revision
                ),
                entity(),
            );
        }
        if cell.architecture != system.architecture {
            findings.error(
                InvariantId::Header,
                format!(
                    "cell '{}' is built for {}, the system is {}",
                    cell.partition.name, cell.architecture, system.architecture
                ),
                entity(),
            );
        }
        if cell.flags.bits() & !CellFlags::all().bits() != 0 {
            findings.error(
                InvariantId::Header,
                format!(
                    "unknown flags 0x{:x} on cell '{}'",
                    cell.flags.bits(),
                    cell.partition.name
                ),
                entity(),
            );
        }
        if cell.flags.contains(CellFlags::AARCH32) && system.architecture != Architecture::Arm64 {
            findings.error(
                InvariantId::Header,
                format!(
                    "cell '{}' requests AArch32 mode on a {} system",
                    cell.partition.name, system.architecture
                ),
                entity(),
            );
        }
    }
}

pub(crate) fn check_names(layout: &Layout, findings: &mut Findings) {
    let mut seen: HashMap<&str, usize> = HashMap::new();

    for (p, partition) in layout.partitions.iter().enumerate() {
        let name = partition.name.as_str();
        if name.is_empty() {
            findings.error(
                InvariantId::PartitionName,
                format!("cell #{p} has an empty name"),
                vec![layout.partition_entity(p)],
            );
            continue;
        }
        if name.len() > CELL_NAME_MAXLEN {
            findings.error(
                InvariantId::PartitionName,
                format!("cell name '{name}' is longer than {CELL_NAME_MAXLEN} bytes"),
                vec![layout.partition_entity(p)],
            );
        }
        if name.contains('\0') {
            findings.error(
                InvariantId::PartitionName,
                format!("cell name '{}' contains a NUL byte", name.escape_default()),
                vec![layout.partition_entity(p)],
            );
        }
        if let Some(first) = seen.insert(name, p) {
            findings.error(
                InvariantId::PartitionName,
                format!("cells #{first} and #{p} are both named '{name}'"),
                vec![layout.partition_entity(p)],
            );
        }
    }
}

pub(crate) fn check_cpus(layout: &Layout, findings: &mut Findings) {
    let root = layout.partitions[ROOT];

    for (p, partition) in layout.partitions.iter().enumerate() {
        if partition.cpu_set.is_empty() {
            findings.error(
                InvariantId::CpuSet,
                format!("cell '{}' has no CPUs", partition.name),
                vec![layout.partition_entity(p)],
            );
        }
    }

    for (p, partition) in layout.guests() {
        let foreign: Vec<String> = partition
            .cpu_set
            .difference(&root.cpu_set)
            .map(|cpu| cpu.to_string())
            .collect();
        if !foreign.is_empty() {
            findings.error(
                InvariantId::CpuSet,
                format!(
                    "cell '{}' uses CPUs {} that the root cell '{}' does not own",
                    partition.name,
                    foreign.join(","),
                    root.name
                ),
                vec![layout.partition_entity(p), layout.partition_entity(ROOT)],
            );
        }

        for (q, other) in layout.guests().filter(|(q, _)| *q > p) {
            let shared: Vec<String> = partition
                .cpu_set
                .intersection(&other.cpu_set)
                .map(|cpu| cpu.to_string())
                .collect();
            if !shared.is_empty() {
                findings.error(
                    InvariantId::CpuSet,
                    format!(
                        "cells '{}' and '{}' both use CPUs {}",
                        partition.name,
                        other.name,
                        shared.join(",")
                    ),
                    vec![layout.partition_entity(p), layout.partition_entity(q)],
                );
            }
        }
    }
}

fn check_console(layout: &Layout, console: &Console, entity: Entity, findings: &mut Findings) {
    if console.is_none() {
        return;
    }
    let range = AddressRange {
        start: console.address,
        size: console.size as u64,
    };
    if range.is_empty() || range.checked_end().is_none() {
        findings.error(
            InvariantId::RangeAlignment,
            format!(
                "{entity} at 0x{:x} with size 0x{:x} is empty or overflows",
                console.address, console.size
            ),
            vec![entity],
        );
    } else if console.flags.contains(ConsoleFlags::ACCESS_MMIO)
        && !console.address.is_multiple_of(layout.page_size())
    {
        findings.error(
            InvariantId::RangeAlignment,
            format!(
                "{entity} at 0x{:x} is not aligned to 0x{:x}",
                console.address,
                layout.page_size()
            ),
            vec![entity],
        );
    }
}

pub(crate) fn check_consoles(layout: &Layout, findings: &mut Findings) {
    check_console(
        layout,
        &layout.system.debug_console,
        Entity::Console { partition: None },
        findings,
    );
    for cell in layout.cells {
        check_console(
            layout,
            &cell.console,
            Entity::Console {
                partition: Some(cell.partition.name.clone()),
            },
            findings,
        );
    }
}

fn check_frame(layout: &Layout, field: &'static str, base: u64, findings: &mut Findings) {
    if base == 0 {
        findings.error(
            InvariantId::RangeAlignment,
            format!("platform field '{field}' is required but zero"),
            vec![Entity::Platform { field }],
        );
    } else if !base.is_multiple_of(layout.page_size()) {
        findings.error(
            InvariantId::RangeAlignment,
            format!(
                "platform field '{field}' 0x{base:x} is not aligned to 0x{:x}",
                layout.page_size()
            ),
            vec![Entity::Platform { field }],
        );
    }
}

pub(crate) fn check_platform(layout: &Layout, findings: &mut Findings) {
    let platform = layout.platform();
    let page_size = layout.page_size();

    if let ArchPlatform::Arm(gic) = &platform.arch {
        match gic.gic_version {
            2 => {
                check_frame(layout, "gicd_base", gic.gicd_base, findings);
                check_frame(layout, "gicc_base", gic.gicc_base, findings);
                check_frame(layout, "gich_base", gic.gich_base, findings);
                check_frame(layout, "gicv_base", gic.gicv_base, findings);
            }
            3 => {
                check_frame(layout, "gicd_base", gic.gicd_base, findings);
                check_frame(layout, "gicr_base", gic.gicr_base, findings);
            }
            version => findings.error(
                InvariantId::Platform,
                format!("unsupported GIC version {version}"),
                vec![Entity::Platform {
                    field: "gic_version",
                }],
            ),
        }
        if gic.maintenance_irq as u64 >= 32 {
            findings.error(
                InvariantId::Platform,
                format!(
                    "maintenance interrupt {} is not a private interrupt",
                    gic.maintenance_irq
                ),
                vec![Entity::Platform {
                    field: "maintenance_irq",
                }],
            );
        }
    }

    if platform.pci_is_virtual {
        if platform.pci_mmconfig_base == 0 {
            findings.error(
                InvariantId::RangeAlignment,
                "virtual PCI is enabled but the MMCONFIG base is zero".to_string(),
                vec![Entity::Platform {
                    field: "pci_mmconfig_base",
                }],
            );
        } else if !platform.pci_mmconfig_base.is_multiple_of(MMCONFIG_ALIGNMENT) {
            findings.error(
                InvariantId::RangeAlignment,
                format!(
                    "MMCONFIG base 0x{:x} is not aligned to 0x{MMCONFIG_ALIGNMENT:x}",
                    platform.pci_mmconfig_base
                ),
                vec![Entity::Platform {
                    field: "pci_mmconfig_base",
                }],
            );
        }
    }

    for (i, unit) in platform.iommu_units.iter().enumerate() {
        let range = AddressRange {
            start: unit.base,
            size: unit.size as u64,
        };
        if range.is_empty() || range.checked_end().is_none() || !range.is_aligned(page_size) {
            findings.error(
                InvariantId::RangeAlignment,
                format!("IOMMU unit #{i} {range} is empty or not aligned to 0x{page_size:x}"),
                vec![Entity::IommuUnit { index: i }],
            );
        }
        let arm_unit = matches!(
            unit.kind,
            IommuKind::SmmuV3 | IommuKind::Pvu | IommuKind::ArmMmu500
        );
        if arm_unit != layout.arch().is_arm() {
            findings.error(
                InvariantId::Platform,
                format!(
                    "IOMMU unit #{i} of type {:?} does not exist on {}",
                    unit.kind,
                    layout.arch()
                ),
                vec![Entity::IommuUnit { index: i }],
            );
        }
    }

    let way_size = platform.color.way_size;
    if way_size != 0 && (!is_power_of_two(way_size) || way_size < page_size) {
        findings.error(
            InvariantId::Platform,
            format!("cache way size 0x{way_size:x} is not a power of two of at least one page"),
            vec![Entity::Platform {
                field: "color.way_size",
            }],
        );
    }
}

pub(crate) fn check_memguard(layout: &Layout, findings: &mut Findings) {
    let memguard = &layout.platform().memguard;
    let field = |field| vec![Entity::Platform { field }];

    if layout.arch().is_arm() && memguard.hv_timer >= 32 {
        findings.error(
            InvariantId::Memguard,
            format!(
                "hypervisor timer interrupt {} is not a private interrupt",
                memguard.hv_timer
            ),
            field("memguard.hv_timer"),
        );
    }

    if memguard.num_irqs != 0 {
        for irq in memguard.pmu_cpu_irq.iter().filter(|irq| **irq >= memguard.num_irqs) {
            findings.error(
                InvariantId::Memguard,
                format!(
                    "PMU interrupt {irq} is beyond the {} interrupts of the platform",
                    memguard.num_irqs
                ),
                field("memguard.pmu_cpu_irq"),
            );
        }
    }

    let step = memguard.irq_prio_step;
    if step != 0 {
        let (min, max, threshold) = (
            memguard.irq_prio_min,
            memguard.irq_prio_max,
            memguard.irq_prio_threshold,
        );
        // Lower values are more urgent on a GIC.
        if !(max <= threshold && threshold <= min) {
            findings.error(
                InvariantId::Memguard,
                format!(
                    "interrupt priority threshold 0x{threshold:x} is outside 0x{max:x}..=0x{min:x}"
                ),
                field("memguard.irq_prio_threshold"),
            );
        } else if (min - max) % step != 0 {
            findings.error(
                InvariantId::Memguard,
                format!(
                    "interrupt priority range 0x{max:x}..=0x{min:x} is not a multiple of step 0x{step:x}"
                ),
                field("memguard.irq_prio_step"),
            );
        }
    }
}

/// QoS devices of a descriptor have unique names and sit inside the QoS
/// window of the platform.
pub(crate) fn check_qos(layout: &Layout, findings: &mut Findings) {
    let window = layout.platform().qos.window();

    for (p, partition) in layout.partitions.iter().enumerate() {
        let mut names: HashMap<&str, usize> = HashMap::new();
        let mut bases: HashMap<u64, usize> = HashMap::new();

        for (i, dev) in partition.qos_devices.iter().enumerate() {
            let entity = || layout.qos_entity(p, i);

            if dev.name.is_empty() || dev.name.len() > QOS_NAME_MAXLEN {
                findings.error(
                    InvariantId::QosDevice,
                    format!(
                        "QoS device #{i} of '{}' has a name of {} bytes, expected 1 to {QOS_NAME_MAXLEN}",
                        partition.name,
                        dev.name.len()
                    ),
                    vec![entity()],
                );
            }
            if dev.name.contains('\0') {
                findings.error(
                    InvariantId::QosDevice,
                    format!(
                        "QoS device name '{}' of '{}' contains a NUL byte",
                        dev.name.escape_default(),
                        partition.name
                    ),
                    vec![entity()],
                );
            }
            if let Some(first) = names.insert(dev.name.as_str(), i) {
                findings.error(
                    InvariantId::QosDevice,
                    format!(
                        "QoS devices #{first} and #{i} of '{}' are both named '{}'",
                        partition.name, dev.name
                    ),
                    vec![layout.qos_entity(p, first), entity()],
                );
            }

            if window.is_empty() {
                findings.error(
                    InvariantId::QosDevice,
                    format!(
                        "QoS device '{}' of '{}' is declared but the platform has no QoS window",
                        dev.name, partition.name
                    ),
                    vec![entity(), Entity::Platform { field: "qos" }],
                );
            } else if !window.contains(dev.base) {
                findings.error(
                    InvariantId::QosDevice,
                    format!(
                        "QoS device '{}' of '{}' at 0x{:x} is outside the QoS window {window}",
                        dev.name, partition.name, dev.base
                    ),
                    vec![entity(), Entity::Platform { field: "qos" }],
                );
            }

            if let Some(first) = bases.insert(dev.base, i) {
                findings.warning(
                    InvariantId::QosDevice,
                    format!(
                        "QoS devices '{}' and '{}' of '{}' share the register block at 0x{:x}",
                        partition.qos_devices[first].name, dev.name, partition.name, dev.base
                    ),
                    vec![layout.qos_entity(p, first), entity()],
                );
            }
        }
    }
}

pub(crate) fn check_stream_ids(layout: &Layout, findings: &mut Findings) {
    let units = &layout.platform().iommu_units;
    let mmu500 = units.iter().any(|unit| unit.kind == IommuKind::ArmMmu500);

    for (p, partition) in layout.partitions.iter().enumerate() {
        if !partition.stream_ids.is_empty() && units.is_empty() {
            findings.error(
                InvariantId::StreamId,
                format!(
                    "cell '{}' lists stream ids but the platform has no IOMMU",
                    partition.name
                ),
                vec![layout.partition_entity(p)],
            );
        }

        for (i, sid) in partition.stream_ids.iter().enumerate() {
            let wide = (sid.id | sid.mask_out) & !MMU500_STREAM_ID_MASK != 0;
            if mmu500 && wide {
                findings.error(
                    InvariantId::StreamId,
                    format!(
                        "stream id #{i} of '{}' (0x{:x}, mask 0x{:x}) does not fit 15 bits",
                        partition.name, sid.id, sid.mask_out
                    ),
                    vec![layout.stream_entity(p, i)],
                );
            }
            for (j, other) in partition.stream_ids.iter().enumerate().skip(i + 1) {
                if sid.conflicts_with(other) {
                    findings.error(
                        InvariantId::StreamId,
                        format!(
                            "stream ids #{i} and #{j} of '{}' match a common stream",
                            partition.name
                        ),
                        vec![layout.stream_entity(p, i), layout.stream_entity(p, j)],
                    );
                }
            }
        }
    }

    // Guest cells take their streams away from the root cell, but two guests
    // never share one.
    for (p, partition) in layout.guests() {
        for (q, other) in layout.guests().filter(|(q, _)| *q > p) {
            for (i, a) in partition.stream_ids.iter().enumerate() {
                for (j, b) in other.stream_ids.iter().enumerate() {
                    if a.conflicts_with(b) {
                        findings.error(
                            InvariantId::StreamId,
                            format!(
                                "stream id #{i} of '{}' and stream id #{j} of '{}' match a common stream",
                                partition.name, other.name
                            ),
                            vec![layout.stream_entity(p, i), layout.stream_entity(q, j)],
                        );
                    }
                }
            }
        }
    }
}
