//
// Copyright 2024, UNSW
//
// SPDX-License-Identifier: BSD-2-Clause
//

use std::collections::HashSet;

use super::pci::ivshmem_runs;
use super::{Entity, Findings, InvariantId, Layout, ROOT};
use crate::types::{AddressRange, MemFlags};
use crate::util::overlapping_pairs;

pub(crate) fn check_hypervisor_memory(layout: &Layout, findings: &mut Findings) {
    let hv = layout.system.hypervisor_memory;
    let page_size = layout.page_size();

    if hv.is_empty() {
        findings.error(
            InvariantId::RangeAlignment,
            "hypervisor memory is empty".to_string(),
            vec![Entity::HypervisorMemory],
        );
    } else if hv.checked_end().is_none() {
        findings.error(
            InvariantId::RangeAlignment,
            format!(
                "hypervisor memory at 0x{:x} with size 0x{:x} overflows the address space",
                hv.start, hv.size
            ),
            vec![Entity::HypervisorMemory],
        );
    } else if !hv.is_aligned(page_size) {
        findings.error(
            InvariantId::RangeAlignment,
            format!("hypervisor memory {hv} is not aligned to 0x{page_size:x}"),
            vec![Entity::HypervisorMemory],
        );
    }
}

/// Local sanity of every memory region: extent, alignment and flags.
pub(crate) fn check_regions(layout: &Layout, findings: &mut Findings) {
    let page_size = layout.page_size();

    for (p, partition) in layout.partitions.iter().enumerate() {
        let mut comm_regions = Vec::new();

        for (i, region) in partition.memory_regions.iter().enumerate() {
            if region.is_placeholder() {
                continue;
            }
            let entity = || layout.region_entity(p, i);

            let unknown = region.flags.unknown_bits();
            if unknown != 0 {
                findings.error(
                    InvariantId::RegionFlags,
                    format!(
                        "memory region #{i} of '{}' has unknown flag bits 0x{unknown:x}",
                        partition.name
                    ),
                    vec![entity()],
                );
            }

            if region.is_comm_region() {
                comm_regions.push(i);
                let virt = region.virt();
                if virt.is_empty() || virt.checked_end().is_none() || !virt.is_aligned(page_size) {
                    findings.error(
                        InvariantId::CommRegion,
                        format!(
                            "communication region of '{}' at 0x{:x} with size 0x{:x} is empty or misaligned",
                            partition.name, virt.start, virt.size
                        ),
                        vec![entity()],
                    );
                }
                continue;
            }

            if region.phys.is_empty() {
                findings.error(
                    InvariantId::RangeAlignment,
                    format!("memory region #{i} of '{}' is empty", partition.name),
                    vec![entity()],
                );
                continue;
            }

            if region.phys.checked_end().is_none() || region.virt().checked_end().is_none() {
                findings.error(
                    InvariantId::RangeAlignment,
                    format!(
                        "memory region #{i} of '{}' overflows the address space",
                        partition.name
                    ),
                    vec![entity()],
                );
                continue;
            }

            if !region.flags.contains(MemFlags::IO) {
                let misaligned: Vec<&str> = [
                    ("physical start", region.phys.start),
                    ("virtual start", region.virt_start),
                    ("size", region.phys.size),
                ]
                .into_iter()
                .filter(|(_, value)| !value.is_multiple_of(page_size))
                .map(|(what, _)| what)
                .collect();
                if !misaligned.is_empty() {
                    findings.error(
                        InvariantId::RangeAlignment,
                        format!(
                            "memory region #{i} of '{}' {} is not aligned to 0x{page_size:x} ({})",
                            partition.name,
                            region.phys,
                            misaligned.join(", ")
                        ),
                        vec![entity()],
                    );
                }
            }

            if p == ROOT && region.flags.contains(MemFlags::LOADABLE) {
                findings.warning(
                    InvariantId::RegionFlags,
                    format!(
                        "memory region #{i} of root cell '{}' is loadable, the root cell is never reloaded",
                        partition.name
                    ),
                    vec![entity()],
                );
            }
        }

        if comm_regions.len() > 1 {
            findings.error(
                InvariantId::CommRegion,
                format!(
                    "cell '{}' declares {} communication regions, at most one is allowed",
                    partition.name,
                    comm_regions.len()
                ),
                comm_regions
                    .iter()
                    .map(|i| layout.region_entity(p, *i))
                    .collect(),
            );
        }
        if p == ROOT && !comm_regions.is_empty() {
            findings.warning(
                InvariantId::CommRegion,
                format!(
                    "root cell '{}' declares a communication region, the hypervisor ignores it",
                    partition.name
                ),
                vec![layout.region_entity(p, comm_regions[0])],
            );
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owner {
    Hypervisor,
    Region { partition: usize, index: usize },
}

/// Regions of the root cell that belong to one of its own IVSHMEM runs. For
/// the root cell this is the same declaration as `ROOTSHARED`.
fn root_ivshmem_regions(layout: &Layout) -> HashSet<usize> {
    let root = layout.partitions[ROOT];
    ivshmem_runs(root)
        .iter()
        .flat_map(|run| run.start..run.start + run.len)
        .collect()
}

/// No two physical ranges of the joint layout may overlap, except for shared
/// memory between partitions that share with each other. Hypervisor memory
/// never aliases anything.
pub(crate) fn check_overlaps(layout: &Layout, findings: &mut Findings) {
    let root_shared = root_ivshmem_regions(layout);
    let is_shared = |partition: usize, index: usize| {
        let region = &layout.partitions[partition].memory_regions[index];
        region.flags.contains(MemFlags::ROOTSHARED)
            || (partition == ROOT && root_shared.contains(&index))
    };

    let mut intervals = Vec::new();
    let hv = layout.system.hypervisor_memory;
    if let Some(end) = hv.checked_end() {
        intervals.push((hv.start, end, Owner::Hypervisor));
    }
    for (p, partition) in layout.partitions.iter().enumerate() {
        for (i, region) in partition.memory_regions.iter().enumerate() {
            if !region.has_physical_backing() {
                continue;
            }
            if let Some(end) = region.phys.checked_end() {
                intervals.push((
                    region.phys.start,
                    end,
                    Owner::Region {
                        partition: p,
                        index: i,
                    },
                ));
            }
        }
    }

    let range_of = |owner: Owner| -> AddressRange {
        match owner {
            Owner::Hypervisor => hv,
            Owner::Region { partition, index } => {
                layout.partitions[partition].memory_regions[index].phys
            }
        }
    };

    for (a, b) in overlapping_pairs(intervals) {
        match (a, b) {
            (Owner::Hypervisor, Owner::Region { partition, index })
            | (Owner::Region { partition, index }, Owner::Hypervisor) => {
                findings.error(
                    InvariantId::HypervisorOverlap,
                    format!(
                        "memory region #{index} of '{}' {} overlaps hypervisor memory {hv}",
                        layout.name(partition),
                        layout.partitions[partition].memory_regions[index].phys,
                    ),
                    vec![Entity::HypervisorMemory, layout.region_entity(partition, index)],
                );
            }
            (
                Owner::Region {
                    partition: pa,
                    index: ia,
                },
                Owner::Region {
                    partition: pb,
                    index: ib,
                },
            ) => {
                if is_shared(pa, ia) && is_shared(pb, ib) && layout.shares(pa, pb) {
                    continue;
                }
                findings.error(
                    InvariantId::MemoryOverlap,
                    format!(
                        "memory region #{ia} of '{}' {} overlaps memory region #{ib} of '{}' {}",
                        layout.name(pa),
                        range_of(a),
                        layout.name(pb),
                        range_of(b),
                    ),
                    vec![layout.region_entity(pa, ia), layout.region_entity(pb, ib)],
                );
            }
            (Owner::Hypervisor, Owner::Hypervisor) => {}
        }
    }
}
