//
// Copyright 2024, UNSW
//
// SPDX-License-Identifier: BSD-2-Clause
//

use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::{Findings, InvariantId, Layout, ROOT};
use crate::region::{
    ivshmem_region_count, MemoryRegion, Partition, PciDevice, PciKind, ShmemDescriptor,
};
use crate::system::PCI_DOMAIN_AUTO;
use crate::types::MemFlags;
use crate::MAX_IVSHMEM_PEERS;

/// The memory regions an IVSHMEM device refers to, `start..start + len` in
/// the owning partition's region list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct IvshmemRun {
    pub device: usize,
    pub start: usize,
    pub len: usize,
}

impl IvshmemRun {
    pub fn indices(&self) -> std::ops::Range<usize> {
        self.start..self.start + self.len
    }
}

/// Runs of every IVSHMEM device of the partition.
///
/// A run starts at `regions_start` and extends over physically contiguous
/// regions. Placeholders belong to the run without breaking contiguity. A
/// run never reaches into the start of another device's run, nor over a
/// region that shared memory cannot be. Output sections from the third entry
/// on all have the size of the first one.
pub(crate) fn ivshmem_runs(partition: &Partition) -> Vec<IvshmemRun> {
    let starts: BTreeSet<usize> = partition
        .ivshmem_devices()
        .map(|(_, _, shmem)| shmem.regions_start as usize)
        .collect();

    partition
        .ivshmem_devices()
        .map(|(device, _, shmem)| {
            let start = shmem.regions_start as usize;
            IvshmemRun {
                device,
                start,
                len: run_length(partition, start, &starts),
            }
        })
        .collect()
}

/// Flags that IVSHMEM memory never carries.
const NOT_SHARED_MEMORY: MemFlags = MemFlags::EXECUTE
    .union(MemFlags::LOADABLE)
    .union(MemFlags::DMA)
    .union(MemFlags::IO)
    .union(MemFlags::COMM_REGION);

/// Index of the first output section within a run.
const FIRST_OUTPUT: usize = 2;

fn run_length(partition: &Partition, start: usize, starts: &BTreeSet<usize>) -> usize {
    let regions = &partition.memory_regions;
    let Some(first) = regions.get(start) else {
        return 0;
    };

    let mut end = first.has_physical_backing().then(|| first.phys.end());
    let mut output_size = None;
    let mut len = 1;
    for region in &regions[start + 1..] {
        if starts.contains(&(start + len)) {
            break;
        }
        if region.is_placeholder() {
            len += 1;
            continue;
        }
        if !region.has_physical_backing() || region.flags.intersects(NOT_SHARED_MEMORY) {
            break;
        }
        if end.is_some_and(|end| region.phys.start != end) {
            break;
        }
        if len > FIRST_OUTPUT && output_size.is_some_and(|size| region.phys.size != size) {
            break;
        }
        if len == FIRST_OUTPUT {
            output_size = Some(region.phys.size);
        }
        end = Some(region.phys.end());
        len += 1;
    }

    len
}

/// Per-device sanity: the kind decides whether a shared-memory description
/// is required.
pub(crate) fn check_devices(layout: &Layout, findings: &mut Findings) {
    let platform = layout.platform();

    for (p, partition) in layout.partitions.iter().enumerate() {
        for (i, dev) in partition.pci_devices.iter().enumerate() {
            let entity = || vec![layout.pci_entity(p, i)];
            match (dev.kind, &dev.shmem) {
                (PciKind::Ivshmem, None) => findings.error(
                    InvariantId::PciDevice,
                    format!(
                        "IVSHMEM device {} of '{}' has no shared memory description",
                        dev.address(),
                        partition.name
                    ),
                    entity(),
                ),
                (PciKind::Passthrough, Some(_)) => findings.error(
                    InvariantId::PciDevice,
                    format!(
                        "pass-through device {} of '{}' carries a shared memory description",
                        dev.address(),
                        partition.name
                    ),
                    entity(),
                ),
                (PciKind::Ivshmem, Some(shmem)) if shmem.protocol.payload_overflows() => {
                    findings.error(
                        InvariantId::PciDevice,
                        format!(
                            "IVSHMEM device {} of '{}' has a protocol number that does not fit 14 bits",
                            dev.address(),
                            partition.name
                        ),
                        entity(),
                    )
                }
                _ => {}
            }

            if p == ROOT
                && dev.is_ivshmem()
                && platform.pci_is_virtual
                && platform.pci_domain != PCI_DOMAIN_AUTO
                && dev.domain != platform.pci_domain
            {
                findings.warning(
                    InvariantId::PciDevice,
                    format!(
                        "IVSHMEM device {} of root cell '{}' is outside the virtual PCI domain {:04x}",
                        dev.address(),
                        partition.name,
                        platform.pci_domain
                    ),
                    entity(),
                );
            }
        }
    }
}

/// `(domain, bdf)` is unique within a partition.
pub(crate) fn check_bdfs(layout: &Layout, findings: &mut Findings) {
    for (p, partition) in layout.partitions.iter().enumerate() {
        let mut seen: HashMap<(u16, u16), usize> = HashMap::new();
        for (i, dev) in partition.pci_devices.iter().enumerate() {
            if let Some(first) = seen.get(&(dev.domain, dev.bdf.0)) {
                findings.error(
                    InvariantId::DuplicateBdf,
                    format!(
                        "PCI devices #{first} and #{i} of '{}' both use {}",
                        partition.name,
                        dev.address()
                    ),
                    vec![layout.pci_entity(p, *first), layout.pci_entity(p, i)],
                );
            } else {
                seen.insert((dev.domain, dev.bdf.0), i);
            }
        }
    }
}

/// Every IVSHMEM device references exactly as many regions as its peer
/// count requires, with the access rights of its peer id.
pub(crate) fn check_ivshmem_layout(layout: &Layout, findings: &mut Findings) {
    for (p, partition) in layout.partitions.iter().enumerate() {
        for run in ivshmem_runs(partition) {
            let dev = &partition.pci_devices[run.device];
            let Some(shmem) = dev.shmem.as_ref() else {
                continue;
            };
            let device = || layout.pci_entity(p, run.device);

            if shmem.peers < 2 || shmem.peers > MAX_IVSHMEM_PEERS {
                findings.error(
                    InvariantId::IvshmemLayout,
                    format!(
                        "IVSHMEM device {} of '{}' declares {} peers, expected 2 to {MAX_IVSHMEM_PEERS}",
                        dev.address(),
                        partition.name,
                        shmem.peers
                    ),
                    vec![device()],
                );
                continue;
            }
            if shmem.dev_id >= shmem.peers {
                findings.error(
                    InvariantId::IvshmemLayout,
                    format!(
                        "IVSHMEM device {} of '{}' has peer id {} but only {} peers",
                        dev.address(),
                        partition.name,
                        shmem.dev_id,
                        shmem.peers
                    ),
                    vec![device()],
                );
            }
            if run.start >= partition.memory_regions.len() {
                findings.error(
                    InvariantId::IvshmemLayout,
                    format!(
                        "IVSHMEM device {} of '{}' starts at memory region #{} but the cell has {} regions",
                        dev.address(),
                        partition.name,
                        run.start,
                        partition.memory_regions.len()
                    ),
                    vec![device()],
                );
                continue;
            }

            let expected = ivshmem_region_count(shmem.peers);
            if run.len != expected {
                findings.error(
                    InvariantId::IvshmemLayout,
                    format!(
                        "IVSHMEM device {} of '{}' references {} memory regions starting at #{}, expected {expected} for {} peers",
                        dev.address(),
                        partition.name,
                        run.len,
                        run.start,
                        shmem.peers
                    ),
                    vec![device(), layout.region_entity(p, run.start)],
                );
                continue;
            }

            check_run_permissions(layout, p, dev, shmem, &run, findings);
        }
    }
}

/// The state table is read-only for everybody. Output section `n` is
/// writable only for the peer with id `n`.
fn check_run_permissions(
    layout: &Layout,
    p: usize,
    dev: &PciDevice,
    shmem: &ShmemDescriptor,
    run: &IvshmemRun,
    findings: &mut Findings,
) {
    let partition = layout.partitions[p];
    let regions = &partition.memory_regions[run.indices()];

    if regions[0].is_writable() {
        findings.error(
            InvariantId::IvshmemLayout,
            format!(
                "state table of IVSHMEM device {} of '{}' is writable",
                dev.address(),
                partition.name
            ),
            vec![layout.pci_entity(p, run.device), layout.region_entity(p, run.start)],
        );
    }

    for peer in 0..shmem.peers {
        let offset = 2 + peer as usize;
        let Some(region) = regions.get(offset) else {
            break;
        };
        if region.is_placeholder() {
            continue;
        }
        let own = peer == shmem.dev_id;
        if region.is_writable() != own {
            findings.error(
                InvariantId::IvshmemLayout,
                format!(
                    "output section of peer {peer} of IVSHMEM device {} of '{}' is {}writable for peer {}",
                    dev.address(),
                    partition.name,
                    if own { "not " } else { "" },
                    shmem.dev_id
                ),
                vec![
                    layout.pci_entity(p, run.device),
                    layout.region_entity(p, run.start + offset),
                ],
            );
        }
    }
}

struct LinkMember {
    partition: usize,
    run: IvshmemRun,
    shmem: ShmemDescriptor,
}

/// IVSHMEM devices with the same BDF in different partitions form one link.
/// Their layouts have to agree.
pub(crate) fn check_ivshmem_links(layout: &Layout, findings: &mut Findings) {
    if layout.partitions.len() < 2 {
        return;
    }

    let mut links: BTreeMap<u16, Vec<LinkMember>> = BTreeMap::new();
    for (p, partition) in layout.partitions.iter().enumerate() {
        for run in ivshmem_runs(partition) {
            let dev = &partition.pci_devices[run.device];
            if let Some(shmem) = dev.shmem {
                links.entry(dev.bdf.0).or_default().push(LinkMember {
                    partition: p,
                    run,
                    shmem,
                });
            }
        }
    }

    for members in links.values() {
        let entities = || {
            members
                .iter()
                .map(|m| layout.pci_entity(m.partition, m.run.device))
                .collect::<Vec<_>>()
        };
        let first = &members[0];
        let address = layout.partitions[first.partition].pci_devices[first.run.device].bdf;

        if members.len() == 1 {
            findings.warning(
                InvariantId::IvshmemLink,
                format!(
                    "IVSHMEM device {address} of '{}' has no peer in any other cell",
                    layout.name(first.partition)
                ),
                entities(),
            );
            continue;
        }

        if members
            .iter()
            .any(|m| m.shmem.peers != first.shmem.peers || m.shmem.protocol != first.shmem.protocol)
        {
            findings.error(
                InvariantId::IvshmemLink,
                format!("IVSHMEM devices at {address} disagree on peer count or protocol"),
                entities(),
            );
            continue;
        }

        if members.len() > first.shmem.peers as usize {
            findings.error(
                InvariantId::IvshmemLink,
                format!(
                    "IVSHMEM link at {address} has {} members but declares {} peers",
                    members.len(),
                    first.shmem.peers
                ),
                entities(),
            );
        }

        let mut ids: BTreeMap<u32, usize> = BTreeMap::new();
        for m in members {
            if let Some(other) = ids.insert(m.shmem.dev_id, m.partition) {
                findings.error(
                    InvariantId::IvshmemLink,
                    format!(
                        "'{}' and '{}' both use peer id {} on IVSHMEM link {address}",
                        layout.name(other),
                        layout.name(m.partition),
                        m.shmem.dev_id
                    ),
                    entities(),
                );
            }
        }

        check_link_ranges(layout, address, members, findings);
    }
}

fn check_link_ranges(
    layout: &Layout,
    address: crate::types::Bdf,
    members: &[LinkMember],
    findings: &mut Findings,
) {
    let expected = ivshmem_region_count(members[0].shmem.peers);
    let complete: Vec<&LinkMember> = members.iter().filter(|m| m.run.len == expected).collect();
    let Some((reference, others)) = complete.split_first() else {
        return;
    };

    for m in others {
        let pairs = run_regions(layout, reference).iter().zip(run_regions(layout, m));
        for (k, (a, b)) in pairs.enumerate() {
            let same = (a.is_placeholder() && b.is_placeholder()) || a.phys == b.phys;
            if !same {
                findings.error(
                    InvariantId::IvshmemLink,
                    format!(
                        "IVSHMEM link {address}: entry {k} is {} in '{}' but {} in '{}'",
                        a.phys,
                        layout.name(reference.partition),
                        b.phys,
                        layout.name(m.partition)
                    ),
                    vec![
                        layout.region_entity(reference.partition, reference.run.start + k),
                        layout.region_entity(m.partition, m.run.start + k),
                    ],
                );
            }
        }
    }
}

fn run_regions<'a>(layout: &Layout<'a>, member: &LinkMember) -> &'a [MemoryRegion] {
    &layout.partitions[member.partition].memory_regions[member.run.indices()]
}
