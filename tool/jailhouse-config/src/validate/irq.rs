//
// Copyright 2024, UNSW
//
// SPDX-License-Identifier: BSD-2-Clause
//

use std::collections::BTreeMap;

use super::{Findings, InvariantId, Layout, ROOT};
use crate::util::{fold_ranges, overlapping_pairs};

/// Lines below this number are SGIs and PPIs on a GIC and belong to the
/// hypervisor.
const GIC_FIRST_SPI: u64 = 32;

pub(crate) fn check_irqchips(layout: &Layout, findings: &mut Findings) {
    let num_irqs = layout.platform().memguard.num_irqs as u64;
    let gic = layout.platform().gic().filter(|_| layout.arch().is_arm());
    let mut unbudgeted = Vec::new();

    for (p, partition) in layout.partitions.iter().enumerate() {
        let mut by_controller: BTreeMap<u64, Vec<(u64, u64, usize)>> = BTreeMap::new();
        for (i, chip) in partition.irqchips.iter().enumerate() {
            let (start, end) = chip.pin_range();
            by_controller
                .entry(chip.controller_address)
                .or_default()
                .push((start, end, i));
        }
        for (address, chips) in by_controller {
            for (a, b) in overlapping_pairs(chips) {
                findings.error(
                    InvariantId::IrqChip,
                    format!(
                        "irqchips #{a} and #{b} of '{}' cover overlapping lines of the controller at 0x{address:x}",
                        partition.name
                    ),
                    vec![layout.chip_entity(p, a), layout.chip_entity(p, b)],
                );
            }
        }

        for (i, chip) in partition.irqchips.iter().enumerate() {
            if let Some(gic) = gic {
                if chip.controller_address != gic.gicd_base {
                    findings.error(
                        InvariantId::IrqChip,
                        format!(
                            "irqchip #{i} of '{}' is at 0x{:x}, the distributor is at 0x{:x}",
                            partition.name, chip.controller_address, gic.gicd_base
                        ),
                        vec![layout.chip_entity(p, i)],
                    );
                }
                let private: Vec<u64> = chip.pins().filter(|pin| *pin < GIC_FIRST_SPI).collect();
                if !private.is_empty() {
                    findings.error(
                        InvariantId::IrqChip,
                        format!(
                            "irqchip #{i} of '{}' assigns private interrupts {}",
                            partition.name,
                            fold_ranges(&private)
                        ),
                        vec![layout.chip_entity(p, i)],
                    );
                }
            }

            if num_irqs == 0 {
                if !chip.is_empty() {
                    unbudgeted.push(layout.chip_entity(p, i));
                }
                continue;
            }
            let excess: Vec<u64> = chip.pins().filter(|pin| *pin >= num_irqs).collect();
            if !excess.is_empty() {
                findings.error(
                    InvariantId::IrqChip,
                    format!(
                        "irqchip #{i} of '{}' assigns interrupts {} but the platform has {num_irqs}",
                        partition.name,
                        fold_ranges(&excess)
                    ),
                    vec![layout.chip_entity(p, i)],
                );
            }
        }
    }

    if !unbudgeted.is_empty() {
        findings.warning(
            InvariantId::Memguard,
            "interrupts are assigned but the platform declares no interrupt count, budget checks skipped"
                .to_string(),
            unbudgeted,
        );
    }
}

/// An interrupt line is owned by at most one guest cell. The root cell hands
/// its lines to guests and is not part of this rule.
pub(crate) fn check_guest_pins(layout: &Layout, findings: &mut Findings) {
    let mut owner: BTreeMap<u64, usize> = BTreeMap::new();
    let mut conflicts: BTreeMap<(usize, usize), Vec<u64>> = BTreeMap::new();

    for (p, partition) in layout.guests() {
        let mut pins: Vec<u64> = partition.irqchips.iter().flat_map(|chip| chip.pins()).collect();
        pins.sort_unstable();
        pins.dedup();
        for pin in pins {
            match owner.get(&pin) {
                Some(first) => conflicts.entry((*first, p)).or_default().push(pin),
                None => {
                    owner.insert(pin, p);
                }
            }
        }
    }

    for ((a, b), pins) in conflicts {
        findings.error(
            InvariantId::IrqChip,
            format!(
                "cells '{}' and '{}' both own interrupts {}",
                layout.name(a),
                layout.name(b),
                fold_ranges(&pins)
            ),
            vec![layout.partition_entity(a), layout.partition_entity(b)],
        );
    }
}

/// Virtual PCI INTx lines stay within the platform and are used by nobody
/// else.
pub(crate) fn check_vpci(layout: &Layout, findings: &mut Findings) {
    let num_irqs = layout.platform().memguard.num_irqs as u64;
    let offset = layout.arch().spi_offset() as u64;

    let ranges: Vec<(u64, u64, usize)> = layout
        .partitions
        .iter()
        .enumerate()
        .filter(|(_, partition)| partition.vpci_irq_lines() > 0)
        .map(|(p, partition)| {
            let start = partition.vpci_irq_base as u64 + offset;
            (start, start + partition.vpci_irq_lines() as u64, p)
        })
        .collect();

    for &(start, end, p) in &ranges {
        let lines = format!("{start}-{}", end - 1);
        if num_irqs != 0 && end > num_irqs {
            findings.error(
                InvariantId::VpciIrq,
                format!(
                    "virtual PCI interrupts {lines} of '{}' exceed the {num_irqs} interrupts of the platform",
                    layout.name(p)
                ),
                vec![layout.partition_entity(p)],
            );
        }

        for (q, other) in layout.partitions.iter().enumerate() {
            if q == p || (q == ROOT && p != ROOT) {
                continue;
            }
            let taken: Vec<u64> = (start..end).filter(|pin| other.owns_pin(*pin)).collect();
            if !taken.is_empty() {
                findings.error(
                    InvariantId::VpciIrq,
                    format!(
                        "virtual PCI interrupts {lines} of '{}' collide with interrupts {} owned by '{}'",
                        layout.name(p),
                        fold_ranges(&taken),
                        layout.name(q)
                    ),
                    vec![layout.partition_entity(p), layout.partition_entity(q)],
                );
            }
        }
    }

    for (a, b) in overlapping_pairs(ranges) {
        findings.error(
            InvariantId::VpciIrq,
            format!(
                "cells '{}' and '{}' use overlapping virtual PCI interrupts",
                layout.name(a),
                layout.name(b)
            ),
            vec![layout.partition_entity(a), layout.partition_entity(b)],
        );
    }
}
