//
// Copyright 2025, UNSW
//
// SPDX-License-Identifier: BSD-2-Clause
//

use jailhouse_config::{sdf, CellDescriptor, Descriptor, SystemDescriptor};

fn read_fixture(test_name: &str) -> String {
    let mut path = std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("tests/sdf/");
    path.push(test_name);
    std::fs::read_to_string(path).unwrap()
}

fn check_error(test_name: &str, err: &str) {
    let xml = read_fixture(test_name);
    let parse_err = sdf::parse(test_name, &xml).unwrap_err();
    assert!(
        parse_err.starts_with(err),
        "unexpected error for {test_name}: {parse_err}"
    );
}

fn check_missing(test_name: &str, attr: &str, element: &str) {
    let expected_error = format!(
        "Error: Missing required attribute '{}' on element '{}'",
        attr, element
    );
    check_error(test_name, expected_error.as_str());
}

fn parse_system(test_name: &str) -> SystemDescriptor {
    let xml = read_fixture(test_name);
    sdf::parse_system(test_name, &xml).unwrap()
}

fn parse_cell(test_name: &str) -> CellDescriptor {
    let xml = read_fixture(test_name);
    sdf::parse_cell(test_name, &xml).unwrap()
}

/// The RK3568 root cell with its Linux guest. The pair is free of findings.
fn rk3568() -> (SystemDescriptor, CellDescriptor) {
    (
        parse_system("rk3568.xml"),
        parse_cell("rk3568-linux-demo.xml"),
    )
}

#[cfg(test)]
mod memory_region {
    use super::*;

    #[test]
    fn test_malformed_size() {
        check_error("mr_malformed_size.xml", "Error: failed to parse integer '0x200_000sd' on element 'memory_region': invalid digit found in string")
    }

    #[test]
    fn test_missing_size() {
        check_missing("mr_missing_size.xml", "size", "memory_region")
    }

    #[test]
    fn test_missing_phys_addr() {
        check_missing("mr_missing_phys_addr.xml", "phys_addr", "memory_region")
    }

    #[test]
    fn test_invalid_attrs() {
        check_error(
            "mr_invalid_attrs.xml",
            "Error: invalid attribute 'page_count' on element 'memory_region': ",
        )
    }

    #[test]
    fn test_addr_not_aligned() {
        check_error("mr_addr_not_aligned.xml", "Error: physical start 0x40000800 is not aligned to 0x1000 on element 'memory_region'")
    }

    #[test]
    fn test_size_not_aligned() {
        check_error(
            "mr_size_not_aligned.xml",
            "Error: size 0x1800 is not aligned to 0x1000 on element 'memory_region'",
        )
    }

    #[test]
    fn test_invalid_flags() {
        check_error(
            "mr_invalid_flags.xml",
            "Error: invalid flags 'READ | SHARED'",
        )
    }

    #[test]
    fn test_overflow() {
        check_error("mr_overflow.xml", "Error: address range starting at 0xfffffffffffff000 with size 0x2000 overflows the address space on element 'memory_region'")
    }

    #[test]
    fn test_net_regions_invalid_dev_id() {
        check_error(
            "net_invalid_dev_id.xml",
            "Error: dev_id 2 of a network link must be 0 or 1 on element 'shmem_net_regions'",
        )
    }
}

#[cfg(test)]
mod irqchip {
    use super::*;

    #[test]
    fn test_pin_outside_chip() {
        check_error(
            "irqchip_pin_outside.xml",
            "Error: pin 200 is outside the 128 lines starting at 32 on element 'irqchip'",
        )
    }

    #[test]
    fn test_pins_and_bitmap() {
        check_error(
            "irqchip_pins_and_bitmap.xml",
            "Error: 'pins' and 'bitmap' are mutually exclusive on element 'irqchip'",
        )
    }

    #[test]
    fn test_short_bitmap() {
        check_error(
            "irqchip_short_bitmap.xml",
            "Error: 'bitmap' needs 4 words on element 'irqchip'",
        )
    }

    #[test]
    fn test_pin_range_too_large() {
        check_error(
            "irqchip_range_too_large.xml",
            "Error: '32-4000000000' has more than 128 values on element 'irqchip'",
        )
    }

    #[test]
    fn test_missing_pin_base() {
        check_missing("irqchip_missing_pin_base.xml", "pin_base", "irqchip")
    }
}

#[cfg(test)]
mod pci_device {
    use super::*;

    #[test]
    fn test_invalid_bdf() {
        check_error(
            "pci_invalid_bdf.xml",
            "Error: invalid PCI address 00:20.0 on element 'pci_device'",
        )
    }

    #[test]
    fn test_malformed_bdf() {
        check_error(
            "pci_malformed_bdf.xml",
            "Error: invalid bdf '0001.0', expected 'bus:device.function' on element 'pci_device'",
        )
    }

    #[test]
    fn test_unknown_type() {
        check_error("pci_unknown_type.xml", "Error: unknown PCI device type 'virtio', expected 'passthrough' or 'ivshmem' on element 'pci_device'")
    }

    #[test]
    fn test_missing_shmem_peers() {
        check_missing("pci_missing_shmem_peers.xml", "shmem_peers", "pci_device")
    }

    #[test]
    fn test_passthrough_with_shmem() {
        check_error(
            "pci_passthrough_shmem.xml",
            "Error: invalid attribute 'shmem_peers' on element 'pci_device'",
        )
    }

    #[test]
    fn test_unknown_protocol() {
        check_error(
            "pci_unknown_protocol.xml",
            "Error: unknown shared memory protocol 'serial' on element 'pci_device'",
        )
    }

    #[test]
    fn test_protocol_payload_overflow() {
        check_error("pci_protocol_overflow.xml", "Error: payload of shared memory protocol 'custom:0x4000' does not fit 14 bits on element 'pci_device'")
    }

    #[test]
    fn test_dev_id_out_of_range() {
        check_error(
            "pci_dev_id_too_wide.xml",
            "Error: value 0x100000000 of 'shmem_dev_id' is out of range on element 'pci_device'",
        )
    }
}

#[cfg(test)]
mod partition {
    use super::*;

    #[test]
    fn test_missing_cpus() {
        check_error(
            "root_missing_cpus.xml",
            "Error: missing 'cpus' element on element 'root_cell'",
        )
    }

    #[test]
    fn test_duplicate_cpus() {
        check_error(
            "cpus_duplicate.xml",
            "Error: duplicate element on element 'cpus'",
        )
    }

    #[test]
    fn test_cpu_mask_and_ids() {
        check_error(
            "cell_cpu_ids_and_mask.xml",
            "Error: exactly one of 'mask' or 'ids' is required on element 'cpus'",
        )
    }

    #[test]
    fn test_cpu_range_too_large() {
        check_error(
            "cpus_range_too_large.xml",
            "Error: '0-0xffffffffffffffff' has more than 512 values on element 'cpus'",
        )
    }

    #[test]
    fn test_invalid_element() {
        check_error(
            "root_invalid_element.xml",
            "Error: invalid XML element 'protection_domain': ",
        )
    }

    #[test]
    fn test_text_after_element() {
        check_error(
            "text_after_element.xml",
            "Error: unexpected text found after element 'memory_region' @ ",
        )
    }

    #[test]
    fn test_qos_name_too_long() {
        check_error("qos_name_too_long.xml", "Error: name 'a-very-long-qos-device-name' is longer than 19 bytes on element 'qos_device'")
    }

    #[test]
    fn test_stream_id_missing_id() {
        check_missing("stream_id_missing_id.xml", "id", "stream_id")
    }
}

#[cfg(test)]
mod system {
    use super::*;

    #[test]
    fn test_missing_hypervisor_memory() {
        check_error(
            "system_missing_hypervisor_memory.xml",
            "Error: missing 'hypervisor_memory' element on element 'system'",
        )
    }

    #[test]
    fn test_missing_root_cell() {
        check_error(
            "system_missing_root_cell.xml",
            "Error: missing 'root_cell' element on element 'system'",
        )
    }

    #[test]
    fn test_unknown_architecture() {
        check_error("system_unknown_architecture.xml", "Error: unknown architecture 'riscv64', expected 'x86', 'arm' or 'arm64' on element 'system'")
    }

    #[test]
    fn test_duplicate_platform() {
        check_error(
            "system_duplicate_platform.xml",
            "Error: duplicate element on element 'platform'",
        )
    }

    #[test]
    fn test_unknown_console() {
        check_error(
            "system_unknown_console.xml",
            "Error: unknown console type 'uart' on element 'debug_console'",
        )
    }

    #[test]
    fn test_none_console_with_address() {
        check_error(
            "system_none_console_address.xml",
            "Error: invalid attribute 'address' on element 'debug_console'",
        )
    }

    #[test]
    fn test_not_xml() {
        check_error(
            "system_not_xml.xml",
            "Could not parse 'system_not_xml.xml'",
        )
    }

    #[test]
    fn test_cell_given_as_system() {
        let xml = read_fixture("rk3568-linux-demo.xml");
        let err = sdf::parse_system("rk3568-linux-demo.xml", &xml).unwrap_err();
        assert!(err.starts_with("Error: expected root element 'system' but found 'cell'"));
    }
}

#[cfg(test)]
mod platform {
    use super::*;

    #[test]
    fn test_invalid_pmu_element() {
        check_error(
            "platform_invalid_pmu_element.xml",
            "Error: invalid XML element 'pmu': ",
        )
    }

    #[test]
    fn test_gic_missing_version() {
        check_missing("platform_gic_missing_version.xml", "version", "gic")
    }

    #[test]
    fn test_bad_bool() {
        check_error(
            "platform_bad_bool.xml",
            "Error: 'pci_is_virtual' must be 'true' or 'false', got 'yes' on element 'platform'",
        )
    }

    #[test]
    fn test_unknown_iommu() {
        check_error(
            "platform_unknown_iommu.xml",
            "Error: unknown IOMMU type 'smmuv2' on element 'iommu'",
        )
    }
}

#[cfg(test)]
mod cell {
    use super::*;

    #[test]
    fn test_missing_name() {
        check_missing("cell_missing_name.xml", "name", "cell")
    }

    #[test]
    fn test_name_too_long() {
        check_error("cell_name_too_long.xml", "Error: name 'a-guest-name-well-over-thirty-one-bytes' is longer than 31 bytes on element 'cell'")
    }

    #[test]
    fn test_invalid_flags() {
        check_error("cell_invalid_flags.xml", "Error: invalid flags 'PASSIVE'")
    }

    #[test]
    fn test_duplicate_console() {
        check_error(
            "cell_duplicate_console.xml",
            "Error: duplicate element on element 'console'",
        )
    }

    #[test]
    fn test_comm_region_misaligned() {
        check_error("cell_comm_region_misaligned.xml", "Error: communication region 0x80000800 is not aligned to 0x1000 on element 'comm_region'")
    }
}

#[cfg(test)]
mod boards {
    use super::*;
    use jailhouse_config::{
        ArchPlatform, ConsoleKind, IommuKind, MemFlags, PciKind, QosFlags, ShmemProtocol,
    };

    #[test]
    fn test_rk3568_root() {
        let (system, _) = rk3568();
        assert_eq!(system.root.name, "rk3568");
        assert_eq!(system.hypervisor_memory.start, 0x0a80_0000);
        assert_eq!(system.debug_console.kind, ConsoleKind::Uart8250);
        assert_eq!(system.platform_info.pci_domain, 3);
        assert_eq!(system.platform_info.memguard.pmu_cpu_irq.len(), 4);

        // Demo run, four networking regions and six RAM and IO windows.
        let regions = &system.root.memory_regions;
        assert_eq!(regions.len(), 14);
        assert!(regions[5].is_placeholder());
        assert!(regions[6].is_writable());
        assert!(!regions[7].is_writable());
        assert_eq!(regions[12].phys.start, 0x1_0000_0000);

        let chips = &system.root.irqchips;
        assert_eq!(chips.len(), 3);
        assert_eq!(chips[2].pins().count(), 64);

        let devices = &system.root.pci_devices;
        assert_eq!(devices[1].address(), "0003:00:01.0");
        assert_eq!(
            devices[1].shmem.map(|shmem| shmem.protocol),
            Some(ShmemProtocol::Veth)
        );
    }

    #[test]
    fn test_rk3568_guest() {
        let (_, guest) = rk3568();
        let partition = &guest.partition;
        assert_eq!(partition.name, "rk3568-linux-demo");
        assert_eq!(partition.vpci_irq_base, 256);
        assert_eq!(partition.cpu_set.to_string(), "{2,3}");

        let loader = &partition.memory_regions[8];
        assert_eq!(loader.virt_start, 0);
        assert!(loader.flags.contains(MemFlags::LOADABLE));
        assert!(partition.memory_regions[11].is_comm_region());

        let pins: Vec<u64> = partition.irqchips.iter().flat_map(|chip| chip.pins()).collect();
        assert_eq!(pins, vec![156, 288, 289, 290, 291]);
        assert_eq!(partition.vpci_irq_lines(), 4);
    }

    #[test]
    fn test_zynqmp_kv260() {
        let system = parse_system("zynqmp-kv260.xml");
        let platform = &system.platform_info;

        let ArchPlatform::Arm(gic) = &platform.arch else {
            panic!("expected a GIC");
        };
        assert_eq!(gic.gic_version, 2);
        assert_eq!(gic.gicv_base, 0xf906_f000);
        assert_eq!(platform.iommu_units[0].kind, IommuKind::ArmMmu500);
        assert_eq!(platform.color.root_map_offset, 0xc0_0000_0000);
        assert_eq!(platform.memguard.irq_prio_min, 0xf0);
        assert_eq!(platform.qos.nic_size, 0x10_0000);

        let root = &system.root;
        assert_eq!(root.cpu_set.to_string(), "{0,1,2,3}");
        assert_eq!(root.stream_ids[2].mask_out, 0xf);
        assert_eq!(
            root.qos_devices[2].flags,
            QosFlags::HAS_REGUL | QosFlags::HAS_RWQOS
        );
        assert!(root
            .pci_devices
            .iter()
            .all(|dev| dev.kind == PciKind::Ivshmem && dev.domain == 1));
    }

    #[test]
    fn test_parse_dispatches_on_root_element() {
        let xml = read_fixture("rk3568-linux-demo.xml");
        assert!(matches!(
            sdf::parse("rk3568-linux-demo.xml", &xml),
            Ok(Descriptor::Cell(_))
        ));
        let xml = read_fixture("rk3568.xml");
        assert!(matches!(
            sdf::parse("rk3568.xml", &xml),
            Ok(Descriptor::System(_))
        ));
    }
}

#[cfg(test)]
mod validation {
    use super::*;
    use jailhouse_config::{
        check, check_with, validate, validated, Bdf, BoundedVec, CpuSet, Entity, InvariantId,
        MemFlags, MemoryRegion, PciDevice, SharingTopology, StreamId, ValidationConfig, Violation,
    };

    fn errors_of(violations: &[Violation], invariant: InvariantId) -> Vec<&Violation> {
        violations
            .iter()
            .filter(|v| v.invariant == invariant && v.is_error())
            .collect()
    }

    fn region(partition: &str, index: usize) -> Entity {
        Entity::MemoryRegion {
            partition: partition.to_string(),
            index,
        }
    }

    #[test]
    fn test_rk3568_is_clean() {
        let (system, guest) = rk3568();
        assert_eq!(check(&system, &[guest.clone()]), vec![]);
        assert!(validate(&system, &[guest]).is_ok());
    }

    #[test]
    fn test_kv260_platform_is_consistent() {
        let system = parse_system("zynqmp-kv260.xml");
        let violations = check(&system, &[]);
        for invariant in [
            InvariantId::Memguard,
            InvariantId::QosDevice,
            InvariantId::StreamId,
            InvariantId::IvshmemLayout,
        ] {
            assert_eq!(errors_of(&violations, invariant), Vec::<&Violation>::new());
        }
    }

    #[test]
    fn test_overlap_names_both_regions() {
        let (system, mut guest) = rk3568();
        guest
            .partition
            .memory_regions
            .push(
                MemoryRegion::identity(0x2000_0000, 0x10_0000, MemFlags::READ | MemFlags::WRITE)
                    .unwrap(),
            )
            .unwrap();

        let violations = check(&system, &[guest]);
        let overlaps = errors_of(&violations, InvariantId::MemoryOverlap);
        assert_eq!(overlaps.len(), 1);
        assert!(overlaps[0].mentions(&region("rk3568", 9)));
        assert!(overlaps[0].mentions(&region("rk3568-linux-demo", 12)));
    }

    #[test]
    fn test_shared_regions_need_a_sharing_pair() {
        let (system, guest) = rk3568();
        let config = ValidationConfig {
            sharing: SharingTopology::Declared(vec![]),
            ..ValidationConfig::default()
        };
        let violations = check_with(&system, &[guest.clone()], &config);
        let overlaps = errors_of(&violations, InvariantId::MemoryOverlap);
        // Demo run, three backed networking regions and the UART.
        assert_eq!(overlaps.len(), 8);
        assert!(overlaps
            .iter()
            .any(|v| v.mentions(&region("rk3568-linux-demo", 10))));

        let config = ValidationConfig {
            sharing: SharingTopology::Declared(vec![(
                "rk3568-linux-demo".to_string(),
                "rk3568".to_string(),
            )]),
            ..ValidationConfig::default()
        };
        assert_eq!(check_with(&system, &[guest], &config), vec![]);
    }

    #[test]
    fn test_hypervisor_memory_is_never_shared() {
        let (system, mut guest) = rk3568();
        guest
            .partition
            .memory_regions
            .push(
                MemoryRegion::identity(0x0a90_0000, 0x1000, MemFlags::READ | MemFlags::ROOTSHARED)
                    .unwrap(),
            )
            .unwrap();

        let violations = check(&system, &[guest]);
        let overlaps = errors_of(&violations, InvariantId::HypervisorOverlap);
        assert_eq!(overlaps.len(), 1);
        assert!(overlaps[0].mentions(&Entity::HypervisorMemory));
    }

    #[test]
    fn test_vpci_lines_exceed_interrupt_budget() {
        let (mut system, guest) = rk3568();
        system.platform_info.memguard.num_irqs = 290;

        let violations = check(&system, &[guest]);
        let vpci = errors_of(&violations, InvariantId::VpciIrq);
        assert_eq!(vpci.len(), 1);
        assert!(vpci[0]
            .message
            .contains("virtual PCI interrupts 288-291 of 'rk3568-linux-demo' exceed the 290 interrupts"));
    }

    #[test]
    fn test_bdf_is_unique_per_domain() {
        let (system, mut guest) = rk3568();
        guest
            .partition
            .pci_devices
            .push(PciDevice::passthrough(1, Bdf::new(0, 0, 0).unwrap(), [0; 6]))
            .unwrap();
        let violations = check(&system, &[guest.clone()]);
        assert!(errors_of(&violations, InvariantId::DuplicateBdf).is_empty());

        guest
            .partition
            .pci_devices
            .push(PciDevice::passthrough(0, Bdf::new(0, 0, 0).unwrap(), [0; 6]))
            .unwrap();
        let violations = check(&system, &[guest]);
        let duplicates = errors_of(&violations, InvariantId::DuplicateBdf);
        assert_eq!(duplicates.len(), 1);
        assert!(duplicates[0].message.contains("#0 and #3"));
    }

    #[test]
    fn test_ivshmem_run_too_short() {
        let (system, mut guest) = rk3568();
        if let Some(shmem) = guest.partition.pci_devices.as_mut_slice()[0].shmem.as_mut() {
            shmem.regions_start = 1;
        }

        let violations = check(&system, &[guest]);
        let layout = errors_of(&violations, InvariantId::IvshmemLayout);
        assert_eq!(layout.len(), 1);
        assert!(layout[0]
            .message
            .contains("references 3 memory regions starting at #1, expected 4"));
    }

    #[test]
    fn test_ivshmem_run_ignores_adjacent_ram() {
        let (mut system, guest) = rk3568();
        // Right behind the end of the networking run at #4.
        let mut regions = system.root.memory_regions.to_vec();
        regions.insert(
            8,
            MemoryRegion::identity(0x0abf_f000, 0x1000, MemFlags::READ | MemFlags::WRITE)
                .unwrap(),
        );
        system.root.memory_regions = BoundedVec::from_vec(regions).unwrap();

        assert_eq!(check(&system, &[guest]), vec![]);
    }

    #[test]
    fn test_ivshmem_peer_count_changes_layout() {
        let (system, mut guest) = rk3568();
        if let Some(shmem) = guest.partition.pci_devices.as_mut_slice()[0].shmem.as_mut() {
            shmem.peers = 3;
        }

        let violations = check(&system, &[guest]);
        let layout = errors_of(&violations, InvariantId::IvshmemLayout);
        assert_eq!(layout.len(), 1);
        assert!(layout[0].message.contains("expected 8 for 3 peers"));
        assert!(!errors_of(&violations, InvariantId::IvshmemLink).is_empty());
    }

    #[test]
    fn test_every_violation_is_reported() {
        let (system, mut guest) = rk3568();
        let partition = &mut guest.partition;
        partition.cpu_set = CpuSet::from_mask(0b1_1100);
        partition
            .memory_regions
            .push(MemoryRegion::identity(0x0a80_0000, 0x1000, MemFlags::READ).unwrap())
            .unwrap();
        partition.stream_ids.push(StreamId::new(0x860)).unwrap();

        let violations = check(&system, &[guest]);
        assert_eq!(violations.len(), 3, "{violations:#?}");
        let mut kinds: Vec<InvariantId> = violations.iter().map(|v| v.invariant).collect();
        kinds.sort_by_key(|kind| kind.name());
        assert_eq!(
            kinds,
            vec![
                InvariantId::CpuSet,
                InvariantId::HypervisorOverlap,
                InvariantId::StreamId,
            ]
        );
    }

    #[test]
    fn test_validated_set_encodes() {
        let (system, guest) = rk3568();
        let cells = [guest];
        let validated = validated(&system, &cells).unwrap();
        assert!(validated.warnings().is_empty());
        assert_eq!(validated.encode(), jailhouse_config::encode(&system));
        assert_eq!(validated.encode_cells().len(), 1);
    }
}

#[cfg(test)]
mod loader_blob {
    use super::*;
    use jailhouse_config::{
        decode, decode_cell, decode_descriptor, encode, encode_cell, DecodeError,
        CONFIG_REVISION,
    };

    #[test]
    fn test_round_trip() {
        let (system, guest) = rk3568();
        assert_eq!(decode(&encode(&system)), Ok(system));
        assert_eq!(decode_cell(&encode_cell(&guest)), Ok(guest));

        let kv260 = parse_system("zynqmp-kv260.xml");
        assert_eq!(
            decode_descriptor(&encode(&kv260)),
            Ok(Descriptor::System(kv260))
        );
    }

    #[test]
    fn test_blob_starts_with_signature() {
        let (system, guest) = rk3568();
        assert!(encode(&system).starts_with(b"JHSYST"));
        assert!(encode_cell(&guest).starts_with(b"JHCELL"));
    }

    #[test]
    fn test_wrong_kind_of_blob() {
        let (_, guest) = rk3568();
        assert!(matches!(
            decode(&encode_cell(&guest)),
            Err(DecodeError::BadSignature { .. })
        ));
    }

    #[test]
    fn test_other_revision() {
        let (system, _) = rk3568();
        let mut blob = encode(&system);
        blob[6..8].copy_from_slice(&(CONFIG_REVISION - 1).to_le_bytes());
        assert_eq!(
            decode(&blob),
            Err(DecodeError::UnsupportedRevision {
                found: CONFIG_REVISION - 1,
                expected: CONFIG_REVISION,
            })
        );
    }

    #[test]
    fn test_truncated() {
        let (_, guest) = rk3568();
        let blob = encode_cell(&guest);
        assert!(matches!(
            decode_cell(&blob[..blob.len() - 1]),
            Err(DecodeError::TruncatedInput { .. })
        ));
        assert!(matches!(
            decode_cell(&blob[..10]),
            Err(DecodeError::TruncatedInput { .. })
        ));
    }

    #[test]
    fn test_trailing_bytes() {
        let (system, _) = rk3568();
        let mut blob = encode(&system);
        blob.extend_from_slice(&[0; 3]);
        assert_eq!(decode(&blob), Err(DecodeError::TrailingBytes { count: 3 }));
    }
}
