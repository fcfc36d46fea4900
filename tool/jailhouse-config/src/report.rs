//
// Copyright 2025, UNSW
//
// SPDX-License-Identifier: BSD-2-Clause
//

//! Human readable layout and violation reports.

use std::io::{self, Write};

use crate::region::{Console, Partition, PciKind};
use crate::system::{ArchPlatform, CellDescriptor, Descriptor, SystemDescriptor};
use crate::util::{fold_ranges, human_size};
use crate::validate::{Severity, Violation};

/// Renders flags in the `NAME | NAME` form the XML description accepts.
fn flag_names<F>(flags: &F) -> String
where
    F: bitflags::Flags,
    F::Bits: bitflags::parser::WriteHex,
{
    let mut s = String::new();
    if bitflags::parser::to_writer(flags, &mut s).is_err() || s.is_empty() {
        return "-".to_string();
    }
    s
}

fn write_console(out: &mut impl Write, label: &str, console: &Console) -> io::Result<()> {
    if console.is_none() {
        return writeln!(out, "\t* {label}: none");
    }
    writeln!(
        out,
        "\t* {label}: {} at 0x{:x} ({}), flags {}",
        console.kind.name(),
        console.address,
        human_size(console.size as u64),
        flag_names(&console.flags)
    )
}

fn write_partition(out: &mut impl Write, partition: &Partition) -> io::Result<()> {
    writeln!(out, "\t* CPUs: {}", partition.cpu_set)?;

    writeln!(out, "\t* Memory regions:")?;
    for (i, region) in partition.memory_regions.iter().enumerate() {
        if region.is_placeholder() {
            writeln!(out, "\t\t{i:>3}: placeholder")?;
        } else if region.is_comm_region() {
            writeln!(
                out,
                "\t\t{i:>3}: communication region at virt 0x{:x} ({})",
                region.virt_start,
                human_size(region.phys.size)
            )?;
        } else {
            writeln!(
                out,
                "\t\t{i:>3}: phys {} -> virt 0x{:x} ({}) {}",
                region.phys,
                region.virt_start,
                human_size(region.phys.size),
                flag_names(&region.flags)
            )?;
        }
    }

    if !partition.irqchips.is_empty() {
        writeln!(out, "\t* IRQ chips:")?;
        for (i, chip) in partition.irqchips.iter().enumerate() {
            let pins: Vec<u64> = chip.pins().collect();
            let pins = if pins.is_empty() {
                "-".to_string()
            } else {
                fold_ranges(&pins)
            };
            writeln!(
                out,
                "\t\t{i:>3}: controller 0x{:x}, base {}: {pins}",
                chip.controller_address, chip.pin_base
            )?;
        }
    }

    if !partition.pci_devices.is_empty() {
        writeln!(out, "\t* PCI devices:")?;
        for dev in &partition.pci_devices {
            match (dev.kind, &dev.shmem) {
                (PciKind::Ivshmem, Some(shmem)) => writeln!(
                    out,
                    "\t\t{}: ivshmem, regions from #{}, dev_id {} of {} peers, protocol 0x{:04x}",
                    dev.address(),
                    shmem.regions_start,
                    shmem.dev_id,
                    shmem.peers,
                    shmem.protocol.code()
                )?,
                (PciKind::Ivshmem, None) => {
                    writeln!(out, "\t\t{}: ivshmem without shared memory", dev.address())?
                }
                (PciKind::Passthrough, _) => writeln!(out, "\t\t{}: passthrough", dev.address())?,
            }
        }
    }

    if partition.vpci_irq_lines() > 0 {
        writeln!(
            out,
            "\t* Virtual PCI interrupts: {} lines from {}",
            partition.vpci_irq_lines(),
            partition.vpci_irq_base
        )?;
    }

    if !partition.stream_ids.is_empty() {
        let ids: Vec<String> = partition
            .stream_ids
            .iter()
            .map(|sid| format!("0x{:x}/0x{:x}", sid.id, sid.mask_out))
            .collect();
        writeln!(out, "\t* Stream IDs: {}", ids.join(", "))?;
    }

    if !partition.qos_devices.is_empty() {
        writeln!(out, "\t* QoS devices:")?;
        for qos in &partition.qos_devices {
            writeln!(
                out,
                "\t\t{:<20} 0x{:x} {}",
                qos.name,
                qos.base,
                flag_names(&qos.flags)
            )?;
        }
    }

    Ok(())
}

pub fn write_system(out: &mut impl Write, system: &SystemDescriptor) -> io::Result<()> {
    writeln!(out, "# System '{}' ({})", system.root.name, system.architecture)?;
    writeln!(
        out,
        "\t* Hypervisor memory: {} ({})",
        system.hypervisor_memory,
        human_size(system.hypervisor_memory.size)
    )?;
    write_console(out, "Debug console", &system.debug_console)?;

    let platform = &system.platform_info;
    match &platform.arch {
        ArchPlatform::Arm(gic) => writeln!(
            out,
            "\t* GICv{}: distributor 0x{:x}, maintenance interrupt {}",
            gic.gic_version, gic.gicd_base, gic.maintenance_irq
        )?,
        ArchPlatform::X86(x86) => writeln!(
            out,
            "\t* x86: PM timer 0x{:x}, TSC {} kHz, APIC {} kHz",
            x86.pm_timer_address, x86.tsc_khz, x86.apic_khz
        )?,
    }
    if platform.pci_mmconfig_base != 0 {
        writeln!(
            out,
            "\t* PCI: MMCONFIG 0x{:x}, {} bus(es){}",
            platform.pci_mmconfig_base,
            platform.pci_mmconfig_end_bus as u32 + 1,
            if platform.pci_is_virtual {
                ", virtual"
            } else {
                ""
            }
        )?;
    }
    for unit in &platform.iommu_units {
        writeln!(
            out,
            "\t* IOMMU: {:?} at 0x{:x} ({})",
            unit.kind,
            unit.base,
            human_size(unit.size as u64)
        )?;
    }
    if platform.memguard.num_irqs != 0 {
        writeln!(out, "\t* Interrupts: {}", platform.memguard.num_irqs)?;
    }

    writeln!(out, "\n## Root cell")?;
    write_partition(out, &system.root)
}

pub fn write_cell(out: &mut impl Write, cell: &CellDescriptor) -> io::Result<()> {
    writeln!(out, "# Cell '{}' ({})", cell.partition.name, cell.architecture)?;
    writeln!(out, "\t* Flags: {}", flag_names(&cell.flags))?;
    write_console(out, "Console", &cell.console)?;
    write_partition(out, &cell.partition)
}

pub fn write_descriptor(out: &mut impl Write, descriptor: &Descriptor) -> io::Result<()> {
    match descriptor {
        Descriptor::System(system) => write_system(out, system),
        Descriptor::Cell(cell) => write_cell(out, cell),
    }
}

/// One line per violation followed by the entities it names, then a count.
pub fn write_violations(out: &mut impl Write, violations: &[Violation]) -> io::Result<()> {
    for violation in violations {
        writeln!(out, "{violation}")?;
        for entity in &violation.entities {
            writeln!(out, "\t- {entity}")?;
        }
    }

    let errors = violations
        .iter()
        .filter(|v| v.severity == Severity::Error)
        .count();
    writeln!(
        out,
        "{} error(s), {} warning(s)",
        errors,
        violations.len() - errors
    )
}

/// The full report: the layout of every partition followed by the findings.
pub fn write_report(
    out: &mut impl Write,
    system: &SystemDescriptor,
    cells: &[CellDescriptor],
    violations: &[Violation],
) -> io::Result<()> {
    write_system(out, system)?;
    for cell in cells {
        writeln!(out)?;
        write_cell(out, cell)?;
    }
    writeln!(out, "\n# Findings")?;
    write_violations(out, violations)
}

pub fn violations_json(violations: &[Violation]) -> serde_json::Result<String> {
    serde_json::to_string_pretty(violations)
}

pub fn descriptor_json(descriptor: &Descriptor) -> serde_json::Result<String> {
    serde_json::to_string_pretty(descriptor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::MemoryRegion;
    use crate::types::MemFlags;
    use crate::validate::check;
    use crate::validate::tests::{cell, system};

    fn render(f: impl FnOnce(&mut Vec<u8>) -> io::Result<()>) -> String {
        let mut out = Vec::new();
        f(&mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn layout() {
        let sys = system();
        let text = render(|out| write_system(out, &sys));
        assert!(text.starts_with("# System 'root' (arm64)\n"));
        assert!(text.contains("Hypervisor memory: [0x3fe00000..0x40000000) (2 MiB)"));
        assert!(text.contains("READ | WRITE | EXECUTE"));
        assert!(text.contains("base 32: 40-41"));
    }

    #[test]
    fn violations_are_listed_with_entities() {
        let sys = system();
        let mut guest = cell("guest", 0b10);
        guest
            .partition
            .memory_regions
            .push(MemoryRegion::identity(0x3fe0_0000, 0x1000, MemFlags::READ).unwrap())
            .unwrap();
        let violations = check(&sys, &[guest.clone()]);
        let text = render(|out| write_report(out, &sys, &[guest], &violations));
        assert!(text.contains("# Cell 'guest' (arm64)"));
        assert!(text.contains("error[hypervisor-overlap]"));
        assert!(text.contains("\t- hypervisor memory\n"));
        assert!(text.ends_with("1 error(s), 0 warning(s)\n"));
    }

    #[test]
    fn json_names_the_invariant() {
        let mut sys = system();
        sys.root.name.clear();
        let json = violations_json(&check(&sys, &[])).unwrap();
        assert!(json.contains("\"invariant\": \"partition-name\""));
    }
}
