//
// Copyright 2025, UNSW
//
// SPDX-License-Identifier: BSD-2-Clause
//

/// This module parses the XML board description into system and cell
/// descriptors.
///
/// The format follows the loader structures closely: every element maps to
/// one record and every attribute to one field. Local properties (alignment,
/// name length, capacities) are checked while parsing so that errors point at
/// the offending element. Properties spanning several records are left to
/// the validator.
///
/// roxmltree gives us the node positions that we need for user-facing
/// errors, which the serde based XML libraries do not.
use crate::bounded::BoundedVec;
use crate::region::{
    Console, ConsoleFlags, ConsoleKind, IrqChip, MemoryRegion, Partition, PciDevice, QosDevice,
    QosFlags, ShmemDescriptor, ShmemProtocol, StreamId, IVSHMEM_BAR_MASK_INTX,
    IVSHMEM_BAR_MASK_MSIX,
};
use crate::system::{
    ArchPlatform, CellDescriptor, CellFlags, Descriptor, GicInfo, IommuKind, IommuUnit,
    PlatformInfo, SysFlags, SystemDescriptor, X86Info,
};
use crate::types::{AddressRange, Architecture, Bdf, ConstructionError, CpuSet, MemFlags};
use crate::util::str_to_bool;
use crate::{IRQCHIP_PINS, MAX_CPU_SET_WORDS};

/// Layout of the networking IVSHMEM run: a read-only state table, an unused
/// read/write section and one output section per peer.
const NET_STATE_TABLE_SIZE: u64 = 0x1000;
const NET_OUTPUT_OFFSET: u64 = 0x1000;
const NET_OUTPUT_STRIDE: u64 = 0x7f000;
const NET_PEERS: u32 = 2;

const DEFAULT_COMM_REGION_SIZE: u64 = 0x1000;

/// Parses an integer given in decimal, hex (`0x`) or binary (`0b`).
/// Underscores are ignored so that long addresses can be grouped.
fn sdf_parse_number(s: &str, node: &roxmltree::Node) -> Result<u64, String> {
    let mut to_parse = s.trim().to_string();
    to_parse.retain(|c| c != '_');

    let (final_str, base) = if let Some(stripped) = to_parse.strip_prefix("0x") {
        (stripped, 16)
    } else if let Some(stripped) = to_parse.strip_prefix("0b") {
        (stripped, 2)
    } else {
        (to_parse.as_str(), 10)
    };

    match u64::from_str_radix(final_str, base) {
        Ok(value) => Ok(value),
        Err(err) => Err(format!(
            "Error: failed to parse integer '{}' on element '{}': {}",
            s,
            node.tag_name().name(),
            err
        )),
    }
}

fn loc_string(xml_sdf: &XmlSystemDescription, pos: roxmltree::TextPos) -> String {
    format!("{}:{}:{}", xml_sdf.filename, pos.row, pos.col)
}

struct XmlSystemDescription<'a> {
    filename: &'a str,
    doc: &'a roxmltree::Document<'a>,
}

fn check_attributes(
    xml_sdf: &XmlSystemDescription,
    node: &roxmltree::Node,
    attributes: &[&'static str],
) -> Result<(), String> {
    for attribute in node.attributes() {
        if !attributes.contains(&attribute.name()) {
            return Err(value_error(
                xml_sdf,
                node,
                format!("invalid attribute '{}'", attribute.name()),
            ));
        }
    }

    Ok(())
}

fn checked_lookup<'a>(
    xml_sdf: &XmlSystemDescription,
    node: &'a roxmltree::Node,
    attribute: &'static str,
) -> Result<&'a str, String> {
    if let Some(value) = node.attribute(attribute) {
        Ok(value)
    } else {
        let pos = xml_sdf.doc.text_pos_at(node.range().start);
        Err(format!(
            "Error: Missing required attribute '{}' on element '{}': {}:{}:{}",
            attribute,
            node.tag_name().name(),
            xml_sdf.filename,
            pos.row,
            pos.col
        ))
    }
}

fn value_error(xml_sdf: &XmlSystemDescription, node: &roxmltree::Node, err: String) -> String {
    let pos = xml_sdf.doc.text_pos_at(node.range().start);
    format!(
        "Error: {} on element '{}': {}:{}:{}",
        err,
        node.tag_name().name(),
        xml_sdf.filename,
        pos.row,
        pos.col
    )
}

fn check_no_text(xml_sdf: &XmlSystemDescription, node: &roxmltree::Node) -> Result<(), String> {
    let name = node.tag_name().name();
    let pos = xml_sdf.doc.text_pos_at(node.range().start);

    if let Some(text) = node.text() {
        // If the text is just whitespace then it is okay
        if !text.trim().is_empty() {
            return Err(format!(
                "Error: unexpected text found in element '{}' @ {}",
                name,
                loc_string(xml_sdf, pos)
            ));
        }
    }

    if let Some(tail) = node.tail() {
        if !tail.trim().is_empty() {
            return Err(format!(
                "Error: unexpected text found after element '{}' @ {}",
                name,
                loc_string(xml_sdf, pos)
            ));
        }
    }

    for child in node.children() {
        if child.is_element() {
            check_no_text(xml_sdf, &child)?;
        }
    }

    Ok(())
}

fn invalid_element(xml_sdf: &XmlSystemDescription, node: &roxmltree::Node) -> String {
    let pos = xml_sdf.doc.text_pos_at(node.range().start);
    format!(
        "Error: invalid XML element '{}': {}",
        node.tag_name().name(),
        loc_string(xml_sdf, pos)
    )
}

/// A required attribute that must fit the integer type of its field.
fn number<T: TryFrom<u64>>(
    xml_sdf: &XmlSystemDescription,
    node: &roxmltree::Node,
    attribute: &'static str,
) -> Result<T, String> {
    let value = sdf_parse_number(checked_lookup(xml_sdf, node, attribute)?, node)?;
    T::try_from(value).map_err(|_| {
        value_error(
            xml_sdf,
            node,
            format!("value 0x{value:x} of '{attribute}' is out of range"),
        )
    })
}

fn optional_number<T: TryFrom<u64>>(
    xml_sdf: &XmlSystemDescription,
    node: &roxmltree::Node,
    attribute: &'static str,
    default: T,
) -> Result<T, String> {
    if node.attribute(attribute).is_some() {
        number(xml_sdf, node, attribute)
    } else {
        Ok(default)
    }
}

fn optional_bool(
    xml_sdf: &XmlSystemDescription,
    node: &roxmltree::Node,
    attribute: &'static str,
) -> Result<bool, String> {
    match node.attribute(attribute) {
        None => Ok(false),
        Some(value) => str_to_bool(value).ok_or_else(|| {
            value_error(
                xml_sdf,
                node,
                format!("'{attribute}' must be 'true' or 'false', got '{value}'"),
            )
        }),
    }
}

/// Flags are written as `NAME | NAME | 0x..`, using the constant names.
fn optional_flags<F>(
    xml_sdf: &XmlSystemDescription,
    node: &roxmltree::Node,
    attribute: &'static str,
) -> Result<Option<F>, String>
where
    F: bitflags::Flags,
    F::Bits: bitflags::parser::ParseHex,
{
    let Some(value) = node.attribute(attribute) else {
        return Ok(None);
    };
    bitflags::parser::from_str::<F>(value)
        .map(Some)
        .map_err(|err| value_error(xml_sdf, node, format!("invalid flags '{value}': {err}")))
}

/// Splits a comma separated list of numbers, each optionally a `lo-hi`
/// inclusive range. Lists that expand to more than `max_len` values are
/// rejected before any range is expanded.
fn parse_number_list(
    s: &str,
    node: &roxmltree::Node,
    max_len: usize,
) -> Result<Vec<u64>, String> {
    let too_long = || {
        format!(
            "Error: '{}' has more than {} values on element '{}'",
            s,
            max_len,
            node.tag_name().name()
        )
    };

    let mut values = Vec::new();
    for item in s.split(',').map(str::trim).filter(|item| !item.is_empty()) {
        let remaining = (max_len - values.len()) as u64;
        match item.split_once('-') {
            Some((lo, hi)) => {
                let lo = sdf_parse_number(lo, node)?;
                let hi = sdf_parse_number(hi, node)?;
                if hi < lo {
                    return Err(format!(
                        "Error: empty range '{}' on element '{}'",
                        item,
                        node.tag_name().name()
                    ));
                }
                if hi - lo >= remaining {
                    return Err(too_long());
                }
                values.extend(lo..=hi);
            }
            None => {
                if remaining == 0 {
                    return Err(too_long());
                }
                values.push(sdf_parse_number(item, node)?);
            }
        }
    }
    Ok(values)
}

fn push_checked<T, const N: usize>(
    xml_sdf: &XmlSystemDescription,
    node: &roxmltree::Node,
    list: &mut BoundedVec<T, N>,
    item: T,
) -> Result<(), String> {
    list.push(item).map_err(|err| {
        value_error(
            xml_sdf,
            node,
            format!("too many '{}' elements, {}", node.tag_name().name(), err),
        )
    })
}

fn duplicate_error(xml_sdf: &XmlSystemDescription, node: &roxmltree::Node) -> String {
    value_error(xml_sdf, node, "duplicate element".to_string())
}

fn parse_architecture(
    xml_sdf: &XmlSystemDescription,
    node: &roxmltree::Node,
) -> Result<Architecture, String> {
    let name = checked_lookup(xml_sdf, node, "architecture")?;
    Architecture::from_name(name).ok_or_else(|| {
        value_error(
            xml_sdf,
            node,
            format!("unknown architecture '{name}', expected 'x86', 'arm' or 'arm64'"),
        )
    })
}

fn parse_bdf(xml_sdf: &XmlSystemDescription, node: &roxmltree::Node) -> Result<Bdf, String> {
    let value = checked_lookup(xml_sdf, node, "bdf")?;
    let invalid = || {
        value_error(
            xml_sdf,
            node,
            format!("invalid bdf '{value}', expected 'bus:device.function'"),
        )
    };
    let (bus, rest) = value.split_once(':').ok_or_else(invalid)?;
    let (device, function) = rest.split_once('.').ok_or_else(invalid)?;
    let bus = u8::from_str_radix(bus, 16).map_err(|_| invalid())?;
    let device = u8::from_str_radix(device, 16).map_err(|_| invalid())?;
    let function = u8::from_str_radix(function, 16).map_err(|_| invalid())?;
    Bdf::new(bus, device, function).map_err(|err| value_error(xml_sdf, node, err.to_string()))
}

fn parse_shmem_protocol(
    xml_sdf: &XmlSystemDescription,
    node: &roxmltree::Node,
) -> Result<ShmemProtocol, String> {
    let Some(value) = node.attribute("shmem_protocol") else {
        return Ok(ShmemProtocol::Undefined);
    };
    let (kind, payload) = match value.split_once(':') {
        Some((kind, payload)) => {
            let payload = sdf_parse_number(payload, node)?;
            let payload = u16::try_from(payload).map_err(|_| {
                value_error(
                    xml_sdf,
                    node,
                    format!("protocol payload 0x{payload:x} is out of range"),
                )
            })?;
            (kind, Some(payload))
        }
        None => (value, None),
    };
    let protocol = match (kind, payload) {
        ("undefined", None) => ShmemProtocol::Undefined,
        ("veth", None) => ShmemProtocol::Veth,
        ("custom", Some(n)) => ShmemProtocol::Custom(n),
        ("virtio-front", Some(n)) => ShmemProtocol::VirtioFront(n),
        ("virtio-back", Some(n)) => ShmemProtocol::VirtioBack(n),
        _ => {
            return Err(value_error(
                xml_sdf,
                node,
                format!("unknown shared memory protocol '{value}'"),
            ))
        }
    };
    if protocol.payload_overflows() {
        return Err(value_error(
            xml_sdf,
            node,
            format!("payload of shared memory protocol '{value}' does not fit 14 bits"),
        ));
    }
    Ok(protocol)
}

impl Console {
    fn from_xml(xml_sdf: &XmlSystemDescription, node: &roxmltree::Node) -> Result<Console, String> {
        check_attributes(
            xml_sdf,
            node,
            &[
                "type",
                "address",
                "size",
                "flags",
                "divider",
                "gate_nr",
                "clock_reg",
            ],
        )?;

        let type_name = checked_lookup(xml_sdf, node, "type")?;
        let Some(kind) = ConsoleKind::from_name(type_name) else {
            return Err(value_error(
                xml_sdf,
                node,
                format!("unknown console type '{type_name}'"),
            ));
        };
        if kind == ConsoleKind::None {
            check_attributes(xml_sdf, node, &["type"])?;
            return Ok(Console::none());
        }

        let default = Console::mmio(
            kind,
            number(xml_sdf, node, "address")?,
            number(xml_sdf, node, "size")?,
        );
        Ok(Console {
            flags: optional_flags::<ConsoleFlags>(xml_sdf, node, "flags")?
                .unwrap_or(default.flags),
            divider: optional_number(xml_sdf, node, "divider", 0)?,
            gate_nr: optional_number(xml_sdf, node, "gate_nr", 0)?,
            clock_reg: optional_number(xml_sdf, node, "clock_reg", 0)?,
            ..default
        })
    }
}

impl MemoryRegion {
    fn from_xml(
        xml_sdf: &XmlSystemDescription,
        node: &roxmltree::Node,
    ) -> Result<MemoryRegion, String> {
        check_attributes(xml_sdf, node, &["phys_addr", "virt_addr", "size", "flags"])?;

        let phys_addr = number(xml_sdf, node, "phys_addr")?;
        let virt_addr = optional_number(xml_sdf, node, "virt_addr", phys_addr)?;
        let size = number(xml_sdf, node, "size")?;
        let flags = optional_flags::<MemFlags>(xml_sdf, node, "flags")?
            .unwrap_or(MemFlags::READ | MemFlags::WRITE);

        MemoryRegion::new(phys_addr, virt_addr, size, flags)
            .map_err(|err| value_error(xml_sdf, node, err.to_string()))
    }

    fn comm_region_from_xml(
        xml_sdf: &XmlSystemDescription,
        node: &roxmltree::Node,
    ) -> Result<MemoryRegion, String> {
        check_attributes(xml_sdf, node, &["virt_addr", "size"])?;

        let virt_addr = number(xml_sdf, node, "virt_addr")?;
        let size = optional_number(xml_sdf, node, "size", DEFAULT_COMM_REGION_SIZE)?;
        MemoryRegion::comm_region(virt_addr, size)
            .map_err(|err| value_error(xml_sdf, node, err.to_string()))
    }

    /// The four regions of a virtual ethernet link between two peers. Output
    /// section `n` is writable by the peer with `dev_id == n`.
    fn net_regions_from_xml(
        xml_sdf: &XmlSystemDescription,
        node: &roxmltree::Node,
    ) -> Result<[MemoryRegion; 4], String> {
        check_attributes(xml_sdf, node, &["phys_addr", "dev_id"])?;

        let start: u64 = number(xml_sdf, node, "phys_addr")?;
        let dev_id: u32 = number(xml_sdf, node, "dev_id")?;
        if dev_id >= NET_PEERS {
            return Err(value_error(
                xml_sdf,
                node,
                format!("dev_id {dev_id} of a network link must be 0 or 1"),
            ));
        }

        let shared = MemFlags::READ | MemFlags::ROOTSHARED;
        let output = |n: u32| {
            let flags = if n == dev_id {
                shared | MemFlags::WRITE
            } else {
                shared
            };
            let phys = start + NET_OUTPUT_OFFSET + n as u64 * NET_OUTPUT_STRIDE;
            MemoryRegion::identity(phys, NET_OUTPUT_STRIDE, flags)
        };
        let state = MemoryRegion::identity(start, NET_STATE_TABLE_SIZE, shared);

        let map_err = |err: ConstructionError| value_error(xml_sdf, node, err.to_string());
        Ok([
            state.map_err(map_err)?,
            MemoryRegion::placeholder(),
            output(0).map_err(map_err)?,
            output(1).map_err(map_err)?,
        ])
    }
}

impl IrqChip {
    fn from_xml(xml_sdf: &XmlSystemDescription, node: &roxmltree::Node) -> Result<IrqChip, String> {
        check_attributes(xml_sdf, node, &["address", "id", "pin_base", "pins", "bitmap"])?;

        let address = number(xml_sdf, node, "address")?;
        let pin_base = number(xml_sdf, node, "pin_base")?;
        let id = optional_number(xml_sdf, node, "id", 0)?;

        let chip = match (node.attribute("pins"), node.attribute("bitmap")) {
            (Some(_), Some(_)) => {
                return Err(value_error(
                    xml_sdf,
                    node,
                    "'pins' and 'bitmap' are mutually exclusive".to_string(),
                ))
            }
            (Some(pins), None) => {
                let mut numbers = Vec::new();
                for pin in parse_number_list(pins, node, IRQCHIP_PINS as usize)? {
                    numbers.push(u32::try_from(pin).map_err(|_| {
                        value_error(xml_sdf, node, format!("pin {pin} is out of range"))
                    })?);
                }
                IrqChip::with_pins(address, pin_base, numbers).map_err(|pin| {
                    value_error(
                        xml_sdf,
                        node,
                        format!(
                            "pin {pin} is outside the {IRQCHIP_PINS} lines starting at {pin_base}"
                        ),
                    )
                })?
            }
            (None, Some(bitmap)) => {
                let mut pin_bitmap = [0u32; 4];
                let words = parse_number_list(bitmap, node, pin_bitmap.len() + 1)?;
                if words.len() != pin_bitmap.len() {
                    return Err(value_error(
                        xml_sdf,
                        node,
                        format!("'bitmap' needs {} words", pin_bitmap.len()),
                    ));
                }
                for (slot, word) in pin_bitmap.iter_mut().zip(words) {
                    *slot = u32::try_from(word).map_err(|_| {
                        value_error(
                            xml_sdf,
                            node,
                            format!("bitmap word 0x{word:x} does not fit 32 bits"),
                        )
                    })?;
                }
                IrqChip::new(address, pin_base, pin_bitmap)
            }
            (None, None) => IrqChip::new(address, pin_base, [0; 4]),
        };

        Ok(IrqChip { id, ..chip })
    }
}

impl PciDevice {
    fn from_xml(xml_sdf: &XmlSystemDescription, node: &roxmltree::Node) -> Result<PciDevice, String> {
        check_attributes(
            xml_sdf,
            node,
            &[
                "type",
                "domain",
                "bdf",
                "iommu",
                "bar_mask",
                "num_msi_vectors",
                "msi_64bits",
                "msi_maskable",
                "num_msix_vectors",
                "msix_region_size",
                "msix_address",
                "shmem_regions_start",
                "shmem_dev_id",
                "shmem_peers",
                "shmem_protocol",
            ],
        )?;

        let domain = optional_number(xml_sdf, node, "domain", 0)?;
        let bdf = parse_bdf(xml_sdf, node)?;
        let num_msix_vectors = optional_number(xml_sdf, node, "num_msix_vectors", 0)?;

        let mut device = match checked_lookup(xml_sdf, node, "type")? {
            "passthrough" => {
                check_attributes(
                    xml_sdf,
                    node,
                    &[
                        "type",
                        "domain",
                        "bdf",
                        "iommu",
                        "bar_mask",
                        "num_msi_vectors",
                        "msi_64bits",
                        "msi_maskable",
                        "num_msix_vectors",
                        "msix_region_size",
                        "msix_address",
                    ],
                )?;
                PciDevice::passthrough(domain, bdf, [0; 6])
            }
            "ivshmem" => {
                let shmem = ShmemDescriptor {
                    regions_start: number(xml_sdf, node, "shmem_regions_start")?,
                    dev_id: number(xml_sdf, node, "shmem_dev_id")?,
                    peers: number(xml_sdf, node, "shmem_peers")?,
                    protocol: parse_shmem_protocol(xml_sdf, node)?,
                };
                let mut device = PciDevice::ivshmem(domain, bdf, shmem);
                if num_msix_vectors > 0 {
                    device.bar_mask = IVSHMEM_BAR_MASK_MSIX;
                } else {
                    device.bar_mask = IVSHMEM_BAR_MASK_INTX;
                }
                device
            }
            other => {
                return Err(value_error(
                    xml_sdf,
                    node,
                    format!("unknown PCI device type '{other}', expected 'passthrough' or 'ivshmem'"),
                ))
            }
        };

        if let Some(bar_mask) = node.attribute("bar_mask") {
            let words = parse_number_list(bar_mask, node, device.bar_mask.len() + 1)?;
            if words.len() != device.bar_mask.len() {
                return Err(value_error(
                    xml_sdf,
                    node,
                    format!("'bar_mask' needs {} words", device.bar_mask.len()),
                ));
            }
            for (slot, word) in device.bar_mask.iter_mut().zip(words) {
                *slot = u32::try_from(word).map_err(|_| {
                    value_error(
                        xml_sdf,
                        node,
                        format!("BAR mask 0x{word:x} does not fit 32 bits"),
                    )
                })?;
            }
        }

        device.iommu = optional_number(xml_sdf, node, "iommu", 0)?;
        device.num_msi_vectors = optional_number(xml_sdf, node, "num_msi_vectors", 0)?;
        device.msi_64bits = optional_bool(xml_sdf, node, "msi_64bits")?;
        device.msi_maskable = optional_bool(xml_sdf, node, "msi_maskable")?;
        device.num_msix_vectors = num_msix_vectors;
        device.msix_region_size = optional_number(xml_sdf, node, "msix_region_size", 0)?;
        device.msix_address = optional_number(xml_sdf, node, "msix_address", 0)?;

        Ok(device)
    }
}

impl StreamId {
    fn from_xml(xml_sdf: &XmlSystemDescription, node: &roxmltree::Node) -> Result<StreamId, String> {
        check_attributes(xml_sdf, node, &["id", "mask_out"])?;

        Ok(StreamId {
            id: number(xml_sdf, node, "id")?,
            mask_out: optional_number(xml_sdf, node, "mask_out", 0)?,
        })
    }
}

impl QosDevice {
    fn from_xml(xml_sdf: &XmlSystemDescription, node: &roxmltree::Node) -> Result<QosDevice, String> {
        check_attributes(xml_sdf, node, &["name", "flags", "base"])?;

        let name = checked_lookup(xml_sdf, node, "name")?;
        let flags = optional_flags::<QosFlags>(xml_sdf, node, "flags")?.unwrap_or(QosFlags::empty());
        let base = number(xml_sdf, node, "base")?;
        QosDevice::new(name, flags, base).map_err(|err| value_error(xml_sdf, node, err.to_string()))
    }
}

fn parse_cpus(xml_sdf: &XmlSystemDescription, node: &roxmltree::Node) -> Result<CpuSet, String> {
    check_attributes(xml_sdf, node, &["mask", "ids"])?;

    match (node.attribute("mask"), node.attribute("ids")) {
        (Some(mask), None) => Ok(CpuSet::from_mask(sdf_parse_number(mask, node)?)),
        (None, Some(ids)) => {
            let mut cpus = Vec::new();
            for id in parse_number_list(ids, node, MAX_CPU_SET_WORDS * 64)? {
                cpus.push(u32::try_from(id).map_err(|_| {
                    value_error(xml_sdf, node, format!("CPU {id} is out of range"))
                })?);
            }
            CpuSet::from_cpus(cpus).map_err(|err| value_error(xml_sdf, node, err.to_string()))
        }
        _ => Err(value_error(
            xml_sdf,
            node,
            "exactly one of 'mask' or 'ids' is required".to_string(),
        )),
    }
}

/// Parses the resource children of `root_cell` or `cell`. Children in
/// `extra` are skipped so that the caller can handle them.
fn parse_partition(
    xml_sdf: &XmlSystemDescription,
    node: &roxmltree::Node,
    name: &str,
    extra: &[&str],
) -> Result<Partition, String> {
    let mut cpus = None;
    for child in node.children().filter(|child| child.is_element()) {
        if child.tag_name().name() == "cpus" {
            if cpus.is_some() {
                return Err(duplicate_error(xml_sdf, &child));
            }
            cpus = Some(parse_cpus(xml_sdf, &child)?);
        }
    }
    let Some(cpu_set) = cpus else {
        return Err(value_error(
            xml_sdf,
            node,
            "missing 'cpus' element".to_string(),
        ));
    };

    let mut partition = Partition::new(name, cpu_set)
        .map_err(|err| value_error(xml_sdf, node, err.to_string()))?;
    partition.vpci_irq_base = optional_number(xml_sdf, node, "vpci_irq_base", 0)?;

    for child in node.children() {
        if !child.is_element() {
            continue;
        }

        let regions = &mut partition.memory_regions;
        match child.tag_name().name() {
            "cpus" => {}
            "memory_region" => {
                push_checked(xml_sdf, &child, regions, MemoryRegion::from_xml(xml_sdf, &child)?)?
            }
            "comm_region" => push_checked(
                xml_sdf,
                &child,
                regions,
                MemoryRegion::comm_region_from_xml(xml_sdf, &child)?,
            )?,
            "placeholder" => {
                check_attributes(xml_sdf, &child, &[])?;
                push_checked(xml_sdf, &child, regions, MemoryRegion::placeholder())?
            }
            "shmem_net_regions" => {
                for region in MemoryRegion::net_regions_from_xml(xml_sdf, &child)? {
                    push_checked(xml_sdf, &child, regions, region)?;
                }
            }
            "irqchip" => push_checked(
                xml_sdf,
                &child,
                &mut partition.irqchips,
                IrqChip::from_xml(xml_sdf, &child)?,
            )?,
            "pci_device" => push_checked(
                xml_sdf,
                &child,
                &mut partition.pci_devices,
                PciDevice::from_xml(xml_sdf, &child)?,
            )?,
            "stream_id" => push_checked(
                xml_sdf,
                &child,
                &mut partition.stream_ids,
                StreamId::from_xml(xml_sdf, &child)?,
            )?,
            "qos_device" => push_checked(
                xml_sdf,
                &child,
                &mut partition.qos_devices,
                QosDevice::from_xml(xml_sdf, &child)?,
            )?,
            other if extra.contains(&other) => {}
            _ => return Err(invalid_element(xml_sdf, &child)),
        }
    }

    Ok(partition)
}

fn parse_gic(xml_sdf: &XmlSystemDescription, node: &roxmltree::Node) -> Result<GicInfo, String> {
    check_attributes(
        xml_sdf,
        node,
        &[
            "version",
            "maintenance_irq",
            "gicd_base",
            "gicc_base",
            "gich_base",
            "gicv_base",
            "gicr_base",
        ],
    )?;

    Ok(GicInfo {
        gic_version: number(xml_sdf, node, "version")?,
        maintenance_irq: number(xml_sdf, node, "maintenance_irq")?,
        gicd_base: number(xml_sdf, node, "gicd_base")?,
        gicc_base: optional_number(xml_sdf, node, "gicc_base", 0)?,
        gich_base: optional_number(xml_sdf, node, "gich_base", 0)?,
        gicv_base: optional_number(xml_sdf, node, "gicv_base", 0)?,
        gicr_base: optional_number(xml_sdf, node, "gicr_base", 0)?,
    })
}

fn parse_x86(xml_sdf: &XmlSystemDescription, node: &roxmltree::Node) -> Result<X86Info, String> {
    check_attributes(
        xml_sdf,
        node,
        &[
            "pm_timer_address",
            "apic_mode",
            "vtd_interrupt_limit",
            "tsc_khz",
            "apic_khz",
        ],
    )?;

    Ok(X86Info {
        pm_timer_address: optional_number(xml_sdf, node, "pm_timer_address", 0)?,
        apic_mode: optional_number(xml_sdf, node, "apic_mode", 0)?,
        vtd_interrupt_limit: optional_number(xml_sdf, node, "vtd_interrupt_limit", 0)?,
        tsc_khz: optional_number(xml_sdf, node, "tsc_khz", 0)?,
        apic_khz: optional_number(xml_sdf, node, "apic_khz", 0)?,
    })
}

fn default_platform(architecture: Architecture) -> PlatformInfo {
    if architecture.is_arm() {
        PlatformInfo::new(ArchPlatform::Arm(GicInfo::default()))
    } else {
        PlatformInfo::new(ArchPlatform::X86(X86Info::default()))
    }
}

fn parse_platform(
    xml_sdf: &XmlSystemDescription,
    node: &roxmltree::Node,
    architecture: Architecture,
) -> Result<PlatformInfo, String> {
    check_attributes(
        xml_sdf,
        node,
        &[
            "pci_mmconfig_base",
            "pci_mmconfig_end_bus",
            "pci_is_virtual",
            "pci_domain",
        ],
    )?;

    let mut platform = default_platform(architecture);
    platform.pci_mmconfig_base = optional_number(xml_sdf, node, "pci_mmconfig_base", 0)?;
    platform.pci_mmconfig_end_bus = optional_number(xml_sdf, node, "pci_mmconfig_end_bus", 0)?;
    platform.pci_is_virtual = optional_bool(xml_sdf, node, "pci_is_virtual")?;
    platform.pci_domain = optional_number(xml_sdf, node, "pci_domain", platform.pci_domain)?;

    let mut seen_arch = false;
    for child in node.children() {
        if !child.is_element() {
            continue;
        }

        match child.tag_name().name() {
            "gic" | "x86" if seen_arch => return Err(duplicate_error(xml_sdf, &child)),
            "gic" => {
                seen_arch = true;
                platform.arch = ArchPlatform::Arm(parse_gic(xml_sdf, &child)?);
            }
            "x86" => {
                seen_arch = true;
                platform.arch = ArchPlatform::X86(parse_x86(xml_sdf, &child)?);
            }
            "iommu" => {
                check_attributes(xml_sdf, &child, &["type", "base", "size"])?;
                let type_name = checked_lookup(xml_sdf, &child, "type")?;
                let Some(kind) = IommuKind::from_name(type_name) else {
                    return Err(value_error(
                        xml_sdf,
                        &child,
                        format!("unknown IOMMU type '{type_name}'"),
                    ));
                };
                let unit = IommuUnit {
                    kind,
                    base: number(xml_sdf, &child, "base")?,
                    size: number(xml_sdf, &child, "size")?,
                };
                push_checked(xml_sdf, &child, &mut platform.iommu_units, unit)?;
            }
            "color" => {
                check_attributes(xml_sdf, &child, &["way_size", "root_map_offset"])?;
                platform.color.way_size = number(xml_sdf, &child, "way_size")?;
                platform.color.root_map_offset =
                    optional_number(xml_sdf, &child, "root_map_offset", 0)?;
            }
            "memguard" => {
                check_attributes(
                    xml_sdf,
                    &child,
                    &[
                        "num_irqs",
                        "hv_timer",
                        "irq_prio_min",
                        "irq_prio_max",
                        "irq_prio_step",
                        "irq_prio_threshold",
                    ],
                )?;
                let memguard = &mut platform.memguard;
                memguard.num_irqs = number(xml_sdf, &child, "num_irqs")?;
                memguard.hv_timer = optional_number(xml_sdf, &child, "hv_timer", 0)?;
                memguard.irq_prio_min = optional_number(xml_sdf, &child, "irq_prio_min", 0)?;
                memguard.irq_prio_max = optional_number(xml_sdf, &child, "irq_prio_max", 0)?;
                memguard.irq_prio_step = optional_number(xml_sdf, &child, "irq_prio_step", 0)?;
                memguard.irq_prio_threshold =
                    optional_number(xml_sdf, &child, "irq_prio_threshold", 0)?;
                for pmu in child.children().filter(|c| c.is_element()) {
                    if pmu.tag_name().name() != "pmu_irq" {
                        return Err(invalid_element(xml_sdf, &pmu));
                    }
                    check_attributes(xml_sdf, &pmu, &["irq"])?;
                    let irq = number(xml_sdf, &pmu, "irq")?;
                    push_checked(xml_sdf, &pmu, &mut memguard.pmu_cpu_irq, irq)?;
                }
            }
            "qos" => {
                check_attributes(xml_sdf, &child, &["nic_base", "nic_size"])?;
                platform.qos.nic_base = number(xml_sdf, &child, "nic_base")?;
                platform.qos.nic_size = number(xml_sdf, &child, "nic_size")?;
            }
            _ => return Err(invalid_element(xml_sdf, &child)),
        }
    }

    Ok(platform)
}

fn parse_document<'a>(filename: &str, xml: &'a str) -> Result<roxmltree::Document<'a>, String> {
    roxmltree::Document::parse(xml).map_err(|err| format!("Could not parse '{filename}': {err}"))
}

fn find_root<'a, 'input>(
    filename: &str,
    doc: &'a roxmltree::Document<'input>,
    tag: &str,
) -> Result<roxmltree::Node<'a, 'input>, String> {
    let root = doc.root_element();
    if root.tag_name().name() != tag {
        return Err(format!(
            "Error: expected root element '{}' but found '{}' in '{}'",
            tag,
            root.tag_name().name(),
            filename
        ));
    }
    Ok(root)
}

/// Parses a `<system>` description into the root cell descriptor.
pub fn parse_system(filename: &str, xml: &str) -> Result<SystemDescriptor, String> {
    let doc = parse_document(filename, xml)?;
    let xml_sdf = XmlSystemDescription {
        filename,
        doc: &doc,
    };

    let system = find_root(filename, &doc, "system")?;

    // Ensure there is no non-whitespace/comment text
    check_no_text(&xml_sdf, &system)?;
    check_attributes(&xml_sdf, &system, &["architecture", "flags"])?;

    let architecture = parse_architecture(&xml_sdf, &system)?;
    let flags = optional_flags::<SysFlags>(&xml_sdf, &system, "flags")?.unwrap_or(SysFlags::empty());

    let mut hypervisor_memory = None;
    let mut debug_console = None;
    let mut platform = None;
    let mut root = None;

    for child in system.children() {
        if !child.is_element() {
            continue;
        }

        match child.tag_name().name() {
            "hypervisor_memory" => {
                if hypervisor_memory.is_some() {
                    return Err(duplicate_error(&xml_sdf, &child));
                }
                check_attributes(&xml_sdf, &child, &["phys_addr", "size"])?;
                let range = AddressRange::new(
                    number(&xml_sdf, &child, "phys_addr")?,
                    number(&xml_sdf, &child, "size")?,
                )
                .map_err(|err| value_error(&xml_sdf, &child, err.to_string()))?;
                hypervisor_memory = Some(range);
            }
            "debug_console" => {
                if debug_console.is_some() {
                    return Err(duplicate_error(&xml_sdf, &child));
                }
                debug_console = Some(Console::from_xml(&xml_sdf, &child)?);
            }
            "platform" => {
                if platform.is_some() {
                    return Err(duplicate_error(&xml_sdf, &child));
                }
                platform = Some(parse_platform(&xml_sdf, &child, architecture)?);
            }
            "root_cell" => {
                if root.is_some() {
                    return Err(duplicate_error(&xml_sdf, &child));
                }
                check_attributes(&xml_sdf, &child, &["name", "vpci_irq_base"])?;
                let name = checked_lookup(&xml_sdf, &child, "name")?;
                root = Some(parse_partition(&xml_sdf, &child, name, &[])?);
            }
            _ => return Err(invalid_element(&xml_sdf, &child)),
        }
    }

    let Some(hypervisor_memory) = hypervisor_memory else {
        return Err(value_error(
            &xml_sdf,
            &system,
            "missing 'hypervisor_memory' element".to_string(),
        ));
    };
    let Some(root) = root else {
        return Err(value_error(
            &xml_sdf,
            &system,
            "missing 'root_cell' element".to_string(),
        ));
    };
    let platform = platform.unwrap_or_else(|| default_platform(architecture));

    let mut descriptor = SystemDescriptor::new(
        architecture,
        hypervisor_memory,
        debug_console.unwrap_or_else(Console::none),
        platform,
        root,
    );
    descriptor.flags = flags;
    Ok(descriptor)
}

/// Parses a `<cell>` description of a guest cell.
pub fn parse_cell(filename: &str, xml: &str) -> Result<CellDescriptor, String> {
    let doc = parse_document(filename, xml)?;
    let xml_sdf = XmlSystemDescription {
        filename,
        doc: &doc,
    };

    let cell = find_root(filename, &doc, "cell")?;

    check_no_text(&xml_sdf, &cell)?;
    check_attributes(
        &xml_sdf,
        &cell,
        &[
            "name",
            "architecture",
            "flags",
            "vpci_irq_base",
            "cpu_reset_address",
            "msg_reply_timeout",
        ],
    )?;

    let architecture = parse_architecture(&xml_sdf, &cell)?;
    let name = checked_lookup(&xml_sdf, &cell, "name")?;
    let partition = parse_partition(&xml_sdf, &cell, name, &["console"])?;

    let mut console = None;
    for child in cell.children().filter(|child| child.is_element()) {
        if child.tag_name().name() == "console" {
            if console.is_some() {
                return Err(duplicate_error(&xml_sdf, &child));
            }
            console = Some(Console::from_xml(&xml_sdf, &child)?);
        }
    }

    let mut descriptor = CellDescriptor::new(
        architecture,
        console.unwrap_or_else(Console::none),
        partition,
    );
    descriptor.flags =
        optional_flags::<CellFlags>(&xml_sdf, &cell, "flags")?.unwrap_or(CellFlags::empty());
    descriptor.cpu_reset_address = optional_number(&xml_sdf, &cell, "cpu_reset_address", 0)?;
    descriptor.msg_reply_timeout = optional_number(&xml_sdf, &cell, "msg_reply_timeout", 0)?;
    Ok(descriptor)
}

/// Parses either kind of description, telling them apart by the root
/// element.
pub fn parse(filename: &str, xml: &str) -> Result<Descriptor, String> {
    let doc = parse_document(filename, xml)?;
    if doc.root_element().tag_name().name() == "cell" {
        parse_cell(filename, xml).map(Descriptor::Cell)
    } else {
        parse_system(filename, xml).map(Descriptor::System)
    }
}
