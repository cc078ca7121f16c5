mod common;

use std::fs;
use std::path::Path;

use common::*;
use fmmt::decompose::Decomposer;
use fmmt::device::Device;
use fmmt::error::{ErrorKind, FmmtError};
use fmmt::rebuild::{rebuild_device, volume_inf, Rebuilder};
use fmmt::tools::ToolRegistry;
use fmmt::tree::NodeKind;
use tempfile::tempdir;

fn extract_and_rebuild(
    image: Vec<u8>,
    registry: &ToolRegistry,
    runner: &ScriptedRunner,
    work: &Path,
) -> Result<(Device, Vec<u8>), FmmtError> {
    let mut device = Device::from_bytes(image)?;
    Decomposer::new(registry, runner)
        .extract_to(work.join("leaves"))
        .decompose_volume(&mut device, 0)?;
    let rebuilder = Rebuilder::new(registry, runner);
    let bytes = rebuild_device(&rebuilder, &mut device, 0, &work.join("build"))?;
    Ok((device, bytes))
}

fn nested_image(wrapper: impl Fn(&[u8]) -> Vec<u8>) -> Vec<u8> {
    let inner = build_volume(
        &[
            ffs_file(test_guid(0x10), TYPE_DRIVER, &ui_section("InnerDriver")),
            ffs_file(test_guid(0x11), TYPE_RAW, b"raw inner data"),
        ],
        true,
        Some(test_guid(0x77)),
        0x80,
        None,
    );
    let body = wrapper(&fv_section(&inner));
    let files = [
        ffs_file(test_guid(0x01), TYPE_FREEFORM, &ui_section("Outer")),
        ffs_file(test_guid(0x20), TYPE_FV_IMAGE, &body),
    ];
    build_volume(&files, true, None, 0x100, Some(16))
}

#[test]
fn flat_volume_round_trips_byte_for_byte() {
    let files = [
        ffs_file(test_guid(1), TYPE_RAW, b"raw one"),
        ffs_file(test_guid(2), TYPE_FREEFORM, &ui_section("Shell")),
        ffs_file(test_guid(3), TYPE_DRIVER, &sections(&[ui_section("Dxe"), raw_section(b"pe")])),
    ];
    let image = build_volume(&files, true, Some(test_guid(0x55)), 0x100, Some(8));
    let dir = tempdir().unwrap();
    let registry = registry();
    let runner = ScriptedRunner::default();

    let (_, rebuilt) = extract_and_rebuild(image.clone(), &registry, &runner, dir.path()).unwrap();
    assert_eq!(rebuilt, image);
    assert_eq!(runner.programs(), vec!["GenFv".to_string()]);

    let gen_fv = runner.call_to("GenFv").unwrap();
    let name_at = gen_fv.iter().position(|a| a == "--FvNameGuid").unwrap();
    assert_eq!(gen_fv[name_at + 1], test_guid(0x55).to_upper());
}

#[test]
fn nested_volume_behind_guided_section_round_trips() {
    let image = nested_image(|fv| guided_section(XOR_GUID, 0x01, &[], &xor(fv)));
    let dir = tempdir().unwrap();
    let registry = registry();
    let runner = ScriptedRunner::default();

    let (_, rebuilt) = extract_and_rebuild(image.clone(), &registry, &runner, dir.path()).unwrap();
    assert_eq!(rebuilt, image);

    let programs = runner.programs();
    // Decode once, then replay from the inner volume outwards.
    assert_eq!(
        programs,
        vec![XOR_TOOL, "GenFv", "GenSec", "GenSec", XOR_TOOL, "GenSec", "GenFfs", "GenFv"]
    );

    let gen_ffs = runner.call_to("GenFfs").unwrap();
    let g = gen_ffs.iter().position(|a| a == "-g").unwrap();
    assert_eq!(gen_ffs[g + 1], test_guid(0x20).to_string());
    assert!(gen_ffs.contains(&"EFI_FV_FILETYPE_FIRMWARE_VOLUME_IMAGE".to_string()));

    let inner_fv = &runner.calls.borrow()[1];
    let n = inner_fv.iter().position(|a| a == "--FvNameGuid").unwrap();
    assert_eq!(inner_fv[n + 1], test_guid(0x77).to_upper());
}

#[test]
fn nested_volume_behind_crc32_and_plain_compression_round_trips() {
    let image = nested_image(|fv| {
        let compressed = compression_section(0, fv, fv.len() as u32);
        crc32_section(&compressed)
    });
    let dir = tempdir().unwrap();
    let registry = registry();
    let runner = ScriptedRunner::default();

    let (device, rebuilt) =
        extract_and_rebuild(image.clone(), &registry, &runner, dir.path()).unwrap();
    assert_eq!(rebuilt, image);
    assert!(runner.call_to("GenCrc32").is_some());

    let tree = &device.volumes[0].tree;
    let kinds: Vec<&'static str> = tree.ids().map(|id| tree.node(id).kind.label()).collect();
    assert_eq!(
        kinds.iter().filter(|k| **k == "compressed section").count(),
        1
    );
}

#[test]
fn rebuilt_image_decomposes_to_the_same_files() {
    let image = nested_image(|fv| guided_section(XOR_GUID, 0x03, &[], &xor(fv)));
    let dir = tempdir().unwrap();
    let registry = registry();
    let runner = ScriptedRunner::default();
    let (before, rebuilt) = extract_and_rebuild(image, &registry, &runner, dir.path()).unwrap();

    let mut after = Device::from_bytes(rebuilt).unwrap();
    Decomposer::new(&registry, &runner)
        .decompose_all(&mut after)
        .unwrap();

    let summary = |d: &Device| -> Vec<(String, u8, Option<String>)> {
        d.volumes[0]
            .files
            .iter()
            .map(|f| (f.name.to_string(), f.file_type, f.ui_name.clone()))
            .collect()
    };
    assert_eq!(summary(&before), summary(&after));
}

#[test]
fn rebuilt_leaf_files_are_the_extracted_copies() {
    let image = nested_image(|fv| fv.to_vec());
    let dir = tempdir().unwrap();
    let registry = registry();
    let runner = ScriptedRunner::default();
    let (device, _) = extract_and_rebuild(image, &registry, &runner, dir.path()).unwrap();

    let leaves = fs::read_dir(dir.path().join("leaves")).unwrap().count();
    assert_eq!(leaves as u32, device.volumes[0].leaf_count);
    // The outer UI file plus both inner files; the FV image file is rebuilt.
    assert_eq!(leaves, 3);
}

#[test]
fn tool_failure_stops_the_rebuild() {
    let image = nested_image(|fv| fv.to_vec());
    let dir = tempdir().unwrap();
    let registry = registry();
    let runner = ScriptedRunner::failing("GenFfs");
    let err = extract_and_rebuild(image, &registry, &runner, dir.path()).unwrap_err();
    match err {
        FmmtError::ToolFailed { tool, .. } => assert!(tool.contains("GenFfs")),
        other => panic!("expected ToolFailed, got {}", other),
    }
}

#[test]
fn guided_section_without_encoder_is_unsupported_on_rebuild() {
    let image = nested_image(|fv| guided_section(XOR_GUID, 0x01, &[], &xor(fv)));
    let dir = tempdir().unwrap();
    let registry = registry();
    let runner = ScriptedRunner::default();
    let mut device = Device::from_bytes(image).unwrap();
    Decomposer::new(&registry, &runner)
        .extract_to(dir.path().join("leaves"))
        .decompose_volume(&mut device, 0)
        .unwrap();

    let bare = ToolRegistry::empty();
    let err = rebuild_device(
        &Rebuilder::new(&bare, &runner),
        &mut device,
        0,
        &dir.path().join("build"),
    )
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);
}

#[test]
fn rebuild_needs_a_decomposition() {
    let image = simple_volume(&[ffs_file(test_guid(1), TYPE_RAW, b"x")]);
    let dir = tempdir().unwrap();
    let registry = registry();
    let runner = ScriptedRunner::default();
    let mut device = Device::from_bytes(image).unwrap();
    let err = rebuild_device(&Rebuilder::new(&registry, &runner), &mut device, 0, dir.path())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);
}

#[test]
fn view_mode_decomposition_has_no_leaves_to_rebuild_from() {
    let image = simple_volume(&[ffs_file(test_guid(1), TYPE_RAW, b"x")]);
    let dir = tempdir().unwrap();
    let registry = registry();
    let runner = ScriptedRunner::default();
    let mut device = Device::from_bytes(image).unwrap();
    Decomposer::new(&registry, &runner)
        .decompose_all(&mut device)
        .unwrap();
    let err = rebuild_device(&Rebuilder::new(&registry, &runner), &mut device, 0, dir.path())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn nested_inf_omits_block_count() {
    let image = nested_image(|fv| fv.to_vec());
    let registry = registry();
    let runner = ScriptedRunner::default();
    let mut device = Device::from_bytes(image).unwrap();
    Decomposer::new(&registry, &runner)
        .decompose_all(&mut device)
        .unwrap();

    let tree = &device.volumes[0].tree;
    let headers: Vec<_> = tree
        .ids()
        .filter_map(|id| match &tree.node(id).kind {
            NodeKind::Volume { header, .. } => Some((tree.node(id).parent.is_none(), header)),
            _ => None,
        })
        .collect();
    assert_eq!(headers.len(), 2);
    for (is_root, header) in headers {
        let inf = volume_inf(header, is_root, &[]).unwrap();
        assert_eq!(inf.contains("EFI_NUM_BLOCKS"), is_root);
        assert!(inf.contains("EFI_ERASE_POLARITY = 1"));
        assert!(!inf.contains("[files]"));
    }
}
