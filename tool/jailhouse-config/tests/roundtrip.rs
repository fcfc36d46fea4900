//
// Copyright 2025, UNSW
//
// SPDX-License-Identifier: BSD-2-Clause
//

use jailhouse_config::{
    decode, decode_cell, encode, encode_cell, sdf, validate, AddressRange, CellDescriptor,
    CpuSet, IommuKind, IommuUnit, MemFlags, MemoryRegion, QosDevice, QosFlags, StreamId,
    SystemDescriptor, CELL_NAME_MAXLEN, MAX_CPU_SET_WORDS, PAGE_SIZE, QOS_NAME_MAXLEN,
};
use proptest::prelude::*;

/// RAM above everything the RK3568 fixtures map.
const FREE_RAM: u64 = 0x4_0000_0000;
const QOS_WINDOW: u64 = 0xfd70_0000;
const QOS_WINDOW_SIZE: u64 = 0x10_0000;

fn read_fixture(name: &str) -> String {
    let mut path = std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("tests/sdf/");
    path.push(name);
    std::fs::read_to_string(path).unwrap()
}

fn rk3568() -> (SystemDescriptor, CellDescriptor) {
    let system = sdf::parse_system("rk3568.xml", &read_fixture("rk3568.xml")).unwrap();
    let guest =
        sdf::parse_cell("rk3568-linux-demo.xml", &read_fixture("rk3568-linux-demo.xml")).unwrap();
    (system, guest)
}

// Mostly identifier characters, sometimes a NUL byte or a character that
// takes two bytes in UTF-8.
fn name(max_len: usize) -> impl Strategy<Value = String> {
    proptest::collection::vec(
        prop_oneof![
            12 => proptest::char::range('a', 'z'),
            1 => Just('-'),
            1 => Just('\0'),
            1 => Just('é'),
        ],
        0..=max_len,
    )
    .prop_map(|chars| chars.into_iter().collect())
}

fn region() -> impl Strategy<Value = MemoryRegion> {
    let flags = prop_oneof![
        4 => Just(MemFlags::READ | MemFlags::WRITE),
        2 => Just(MemFlags::READ | MemFlags::WRITE | MemFlags::EXECUTE | MemFlags::DMA),
        1 => Just(MemFlags::READ | MemFlags::WRITE | MemFlags::IO),
        1 => any::<u64>().prop_map(MemFlags::from_bits_retain),
    ];
    (0u64..64, 0u64..64, 1u64..16, flags).prop_map(|(page, virt_page, pages, flags)| {
        MemoryRegion {
            phys: AddressRange {
                start: FREE_RAM + page * PAGE_SIZE,
                size: pages * PAGE_SIZE,
            },
            virt_start: FREE_RAM + virt_page * PAGE_SIZE,
            flags,
        }
    })
}

fn qos_device() -> impl Strategy<Value = QosDevice> {
    (name(QOS_NAME_MAXLEN + 2), 0u32..8, 0u64..2 * QOS_WINDOW_SIZE).prop_map(
        |(name, flags, offset)| QosDevice {
            name,
            flags: QosFlags::from_bits_retain(flags),
            base: QOS_WINDOW + offset,
        },
    )
}

fn stream_id() -> impl Strategy<Value = StreamId> {
    (0u32..0x1_0000, prop_oneof![Just(0u32), 0u32..0x100])
        .prop_map(|(id, mask_out)| StreamId { id, mask_out })
}

// Guest CPU sets with trailing zero words, whose count the loader format
// carries.
fn cpu_set() -> impl Strategy<Value = CpuSet> {
    (0u64..16, 1..=MAX_CPU_SET_WORDS).prop_map(|(mask, words)| {
        let mut all = vec![0; words];
        all[0] = mask;
        CpuSet::from_words(all).unwrap()
    })
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        .. ProptestConfig::default()
    })]

    #[test]
    fn valid_descriptors_survive_the_loader_format(
        root_name in proptest::option::of(name(CELL_NAME_MAXLEN + 2)),
        guest_name in proptest::option::of(name(CELL_NAME_MAXLEN + 2)),
        guest_cpus in proptest::option::of(cpu_set()),
        regions in proptest::collection::vec((any::<bool>(), region()), 0..4),
        qos_devices in proptest::collection::vec((any::<bool>(), qos_device()), 0..4),
        stream_ids in proptest::collection::vec((any::<bool>(), stream_id()), 0..4),
        with_qos_window in any::<bool>(),
        with_iommu in any::<bool>(),
        drop_shmem in any::<bool>(),
    ) {
        let (mut system, mut guest) = rk3568();

        if let Some(name) = root_name {
            system.root.name = name;
        }
        if let Some(name) = guest_name {
            guest.partition.name = name;
        }
        if let Some(cpus) = guest_cpus {
            guest.partition.cpu_set = cpus;
        }
        for (in_root, region) in regions {
            let partition = if in_root { &mut system.root } else { &mut guest.partition };
            partition.memory_regions.push(region).unwrap();
        }
        for (in_root, dev) in qos_devices {
            let partition = if in_root { &mut system.root } else { &mut guest.partition };
            partition.qos_devices.push(dev).unwrap();
        }
        for (in_root, sid) in stream_ids {
            let partition = if in_root { &mut system.root } else { &mut guest.partition };
            partition.stream_ids.push(sid).unwrap();
        }
        if with_qos_window {
            system.platform_info.qos.nic_base = QOS_WINDOW;
            system.platform_info.qos.nic_size = QOS_WINDOW_SIZE;
        }
        if with_iommu {
            system
                .platform_info
                .iommu_units
                .push(IommuUnit {
                    kind: IommuKind::ArmMmu500,
                    base: 0xfd80_0000,
                    size: 0x20000,
                })
                .unwrap();
        }
        if drop_shmem {
            if let Some(dev) = guest
                .partition
                .pci_devices
                .as_mut_slice()
                .iter_mut()
                .find(|dev| dev.is_ivshmem())
            {
                dev.shmem = None;
            }
        }

        if validate(&system, std::slice::from_ref(&guest)).is_ok() {
            prop_assert_eq!(decode(&encode(&system)), Ok(system.clone()));
            prop_assert_eq!(decode_cell(&encode_cell(&guest)), Ok(guest.clone()));
        }
    }
}

#[test]
fn unchanged_fixtures_round_trip() {
    let (system, guest) = rk3568();
    assert!(validate(&system, std::slice::from_ref(&guest)).is_ok());
    assert_eq!(decode(&encode(&system)), Ok(system));
    assert_eq!(decode_cell(&encode_cell(&guest)), Ok(guest));
}
