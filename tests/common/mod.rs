//! Shared helpers: a synthetic image builder and an in-process stand-in for the EDK II tools.
#![allow(dead_code)]

use std::cell::RefCell;
use std::ffi::OsString;
use std::fs;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;

use fmmt::guid::{self, Guid};
use fmmt::tools::{CommandRunner, ToolRegistry};

pub const XOR_TOOL: &str = "XorTool";
pub const XOR_KEY: u8 = 0x5A;
pub const XOR_GUID: Guid = Guid::from_fields(
    0x1234_5678,
    0x9abc,
    0xdef0,
    [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08],
);

pub const HEADER_LEN: usize = 0x48;
pub const STATE_NATURAL: u8 = 0x07;

pub const TYPE_RAW: u8 = 0x01;
pub const TYPE_FREEFORM: u8 = 0x02;
pub const TYPE_DRIVER: u8 = 0x07;
pub const TYPE_FV_IMAGE: u8 = 0x0B;
pub const TYPE_PAD: u8 = 0xF0;

pub fn test_guid(n: u8) -> Guid {
    Guid::from_fields(
        0xA000_0000 | u32::from(n),
        0x1111,
        0x2222,
        [0x33, 0x44, 0, 0, 0, 0, 0, n],
    )
}

/// Built-in tools plus the XOR test codec.
pub fn registry() -> ToolRegistry {
    ToolRegistry::with_builtins()
        .extend_from_str(&format!("{} XOR {}", XOR_GUID, XOR_TOOL))
        .unwrap()
}

fn sum8(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |a, b| a.wrapping_add(*b))
}

pub fn section(kind: u8, body: &[u8]) -> Vec<u8> {
    let size = (4 + body.len()) as u32;
    let mut s = size.to_le_bytes()[..3].to_vec();
    s.push(kind);
    s.extend_from_slice(body);
    s
}

/// Section with the 0xFFFFFF size sentinel and the length in the extended field.
pub fn large_section(kind: u8, body: &[u8]) -> Vec<u8> {
    let mut s = vec![0xFF, 0xFF, 0xFF, kind];
    s.extend_from_slice(&((8 + body.len()) as u32).to_le_bytes());
    s.extend_from_slice(body);
    s
}

pub fn utf16(name: &str) -> Vec<u8> {
    name.encode_utf16()
        .chain(std::iter::once(0))
        .flat_map(|u| u.to_le_bytes())
        .collect()
}

pub fn ui_section(name: &str) -> Vec<u8> {
    section(0x15, &utf16(name))
}

pub fn raw_section(body: &[u8]) -> Vec<u8> {
    section(0x19, body)
}

pub fn fv_section(volume: &[u8]) -> Vec<u8> {
    section(0x17, volume)
}

pub fn compression_section(compression_type: u8, payload: &[u8], declared: u32) -> Vec<u8> {
    let mut body = declared.to_le_bytes().to_vec();
    body.push(compression_type);
    body.extend_from_slice(payload);
    section(0x01, &body)
}

/// GUID-defined section whose data starts right after `extra`.
pub fn guided_section(guid: Guid, attributes: u16, extra: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut data = extra.to_vec();
    data.extend_from_slice(payload);
    guided_raw(guid, (24 + extra.len()) as u16, attributes, &data)
}

pub fn guided_raw(guid: Guid, data_offset: u16, attributes: u16, data: &[u8]) -> Vec<u8> {
    let mut body = guid.0.to_vec();
    body.extend_from_slice(&data_offset.to_le_bytes());
    body.extend_from_slice(&attributes.to_le_bytes());
    body.extend_from_slice(data);
    section(0x02, &body)
}

pub fn crc32_section(payload: &[u8]) -> Vec<u8> {
    guided_section(
        guid::CRC32_SECTION,
        0x02,
        &crc32fast::hash(payload).to_le_bytes(),
        payload,
    )
}

pub fn xor(bytes: &[u8]) -> Vec<u8> {
    bytes.iter().map(|b| b ^ XOR_KEY).collect()
}

/// Joins sections, each starting on a 4-byte boundary.
pub fn sections(list: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    for s in list {
        while out.len() % 4 != 0 {
            out.push(0);
        }
        out.extend_from_slice(s);
    }
    out
}

pub fn ffs_file_with(name: Guid, file_type: u8, attributes: u8, body: &[u8]) -> Vec<u8> {
    let size = 24 + body.len();
    let mut h = vec![0u8; 24];
    h[..16].copy_from_slice(&name.0);
    h[17] = 0xAA;
    h[18] = file_type;
    h[19] = attributes;
    h[20..23].copy_from_slice(&(size as u32).to_le_bytes()[..3]);
    h[23] = STATE_NATURAL;
    let sum = sum8(&h).wrapping_sub(h[17]).wrapping_sub(h[23]);
    h[16] = 0u8.wrapping_sub(sum);
    h.extend_from_slice(body);
    h
}

/// A file in polarity-0 form; [`build_volume`] adjusts the state byte.
/// A file with the 32-byte header; `size` overrides the extended size field.
pub fn large_ffs_file(name: Guid, file_type: u8, body: &[u8], size: Option<u64>) -> Vec<u8> {
    let size = size.unwrap_or((32 + body.len()) as u64);
    let mut h = vec![0u8; 32];
    h[..16].copy_from_slice(&name.0);
    h[17] = 0xAA;
    h[18] = file_type;
    h[19] = 0x01;
    h[23] = STATE_NATURAL;
    h[24..32].copy_from_slice(&size.to_le_bytes());
    let sum = sum8(&h).wrapping_sub(h[17]).wrapping_sub(h[23]);
    h[16] = 0u8.wrapping_sub(sum);
    h.extend_from_slice(body);
    h
}

/// Rewrites the natural state byte of a built file.
pub fn with_state(mut file: Vec<u8>, state: u8) -> Vec<u8> {
    file[23] = state;
    file
}

pub fn ffs_file(name: Guid, file_type: u8, body: &[u8]) -> Vec<u8> {
    ffs_file_with(name, file_type, 0, body)
}

pub fn ext_header_file(name: Guid) -> Vec<u8> {
    let mut ext = name.0.to_vec();
    ext.extend_from_slice(&20u32.to_le_bytes());
    ffs_file(Guid([0xFF; 16]), TYPE_PAD, &ext)
}

/// A volume holding `files` (polarity-0 form) back to back on 8-byte boundaries.
pub fn build_volume(
    files: &[Vec<u8>],
    polarity: bool,
    name: Option<Guid>,
    block_size: u32,
    num_blocks: Option<u32>,
) -> Vec<u8> {
    let erase = if polarity { 0xFF } else { 0x00 };
    let mut all: Vec<Vec<u8>> = Vec::new();
    if let Some(g) = name {
        all.push(ext_header_file(g));
    }
    all.extend(files.iter().cloned());

    let mut image = vec![0u8; HEADER_LEN];
    for file in &all {
        while image.len() % 8 != 0 {
            image.push(erase);
        }
        let at = image.len();
        image.extend_from_slice(file);
        if polarity {
            image[at + 23] = !image[at + 23];
        }
    }

    let blocks = num_blocks
        .unwrap_or_else(|| ((image.len() as u32) + block_size - 1) / block_size)
        .max(1);
    let length = (block_size * blocks) as usize;
    assert!(length >= image.len(), "files do not fit the block map");
    image.resize(length, erase);

    image[0x10..0x20].copy_from_slice(&guid::FFS2.0);
    image[0x20..0x28].copy_from_slice(&(length as u64).to_le_bytes());
    image[0x28..0x2C].copy_from_slice(b"_FVH");
    let attributes: u32 = if polarity { 0x0003_0802 } else { 0x0003_0002 };
    image[0x2C..0x30].copy_from_slice(&attributes.to_le_bytes());
    image[0x30..0x32].copy_from_slice(&(HEADER_LEN as u16).to_le_bytes());
    let ext_offset: u16 = if name.is_some() { (HEADER_LEN + 24) as u16 } else { 0 };
    image[0x34..0x36].copy_from_slice(&ext_offset.to_le_bytes());
    image[0x37] = 2;
    image[0x38..0x3C].copy_from_slice(&blocks.to_le_bytes());
    image[0x3C..0x40].copy_from_slice(&block_size.to_le_bytes());
    image[0x40..0x48].fill(0);

    let sum = image[..HEADER_LEN]
        .chunks_exact(2)
        .fold(0u16, |a, w| a.wrapping_add(u16::from_le_bytes([w[0], w[1]])));
    image[0x32..0x34].copy_from_slice(&0u16.wrapping_sub(sum).to_le_bytes());
    image
}

pub fn simple_volume(files: &[Vec<u8>]) -> Vec<u8> {
    build_volume(files, true, None, 0x100, None)
}

/// Stand-in for GenFv, GenFfs, GenSec, GenCrc32 and the XOR codec.
#[derive(Default)]
pub struct ScriptedRunner {
    pub calls: RefCell<Vec<Vec<String>>>,
    pub fail: Option<String>,
}

impl ScriptedRunner {
    pub fn failing(program: &str) -> Self {
        ScriptedRunner {
            calls: RefCell::new(Vec::new()),
            fail: Some(program.to_string()),
        }
    }

    pub fn programs(&self) -> Vec<String> {
        self.calls.borrow().iter().map(|c| c[0].clone()).collect()
    }

    pub fn call_to(&self, program: &str) -> Option<Vec<String>> {
        self.calls
            .borrow()
            .iter()
            .find(|c| c[0] == program)
            .cloned()
    }
}

fn value_of<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
}

fn values_of<'a>(args: &'a [String], flag: &str) -> Vec<&'a str> {
    args.windows(2)
        .filter(|w| w[0] == flag)
        .map(|w| w[1].as_str())
        .collect()
}

/// Arguments that are neither flags nor flag values.
fn positionals<'a>(args: &'a [String], valued: &[&str]) -> Vec<&'a str> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < args.len() {
        let a = args[i].as_str();
        if valued.contains(&a) {
            i += 2;
        } else if a.starts_with('-') {
            i += 1;
        } else {
            out.push(a);
            i += 1;
        }
    }
    out
}

fn gen_fv(args: &[String]) {
    let inf = fs::read_to_string(value_of(args, "-i").unwrap()).unwrap();
    let mut block_size = 0x100;
    let mut num_blocks = None;
    let mut polarity = false;
    let mut files = Vec::new();
    for line in inf.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let (key, value) = (key.trim(), value.trim());
        match key {
            "EFI_BLOCK_SIZE" => block_size = u32::from_str_radix(&value[2..], 16).unwrap(),
            "EFI_NUM_BLOCKS" => num_blocks = Some(u32::from_str_radix(&value[2..], 16).unwrap()),
            "EFI_ERASE_POLARITY" => polarity = value == "1",
            "EFI_FILE_NAME" => files.push(fs::read(value).unwrap()),
            _ => {}
        }
    }
    let name = value_of(args, "--FvNameGuid").map(|g| g.parse::<Guid>().unwrap());
    let image = build_volume(&files, polarity, name, block_size, num_blocks);
    fs::write(value_of(args, "-o").unwrap(), image).unwrap();
}

fn gen_ffs(args: &[String]) {
    let type_name = value_of(args, "-t").unwrap();
    let file_type = (0..=0xFFu8)
        .find(|t| fmmt::ffs::file_type_name(*t) == Some(type_name))
        .unwrap();
    let inputs: Vec<Vec<u8>> = values_of(args, "-i")
        .into_iter()
        .map(|p| fs::read(p).unwrap())
        .collect();
    let name: Guid = value_of(args, "-g").unwrap().parse().unwrap();
    let attributes = if args.iter().any(|a| a == "-x") { 0x04 } else { 0 };
    let file = ffs_file_with(name, file_type, attributes, &sections(&inputs));
    fs::write(value_of(args, "-o").unwrap(), file).unwrap();
}

fn gen_sec(args: &[String]) -> bool {
    let valued = ["-s", "-c", "-g", "-o", "-r", "-l", "--sectionalign"];
    let inputs: Vec<Vec<u8>> = positionals(args, &valued)
        .into_iter()
        .map(|p| fs::read(p).unwrap())
        .collect();
    let joined = sections(&inputs);
    let out = value_of(args, "-o").unwrap();

    let produced = if value_of(args, "--sectionalign").is_some() {
        joined
    } else {
        match value_of(args, "-s").unwrap() {
            "EFI_SECTION_FIRMWARE_VOLUME_IMAGE" => fv_section(&joined),
            "EFI_SECTION_COMPRESSION" => match value_of(args, "-c") {
                Some("PI_NONE") => compression_section(0, &joined, joined.len() as u32),
                _ => return false,
            },
            "EFI_SECTION_GUID_DEFINED" => {
                let guid: Guid = value_of(args, "-g").unwrap().parse().unwrap();
                let extra: u16 = value_of(args, "-l").unwrap().parse().unwrap();
                let attributes = values_of(args, "-r")
                    .into_iter()
                    .map(|r| match r {
                        "PROCESSING_REQUIRED" => 1u16,
                        "AUTH_STATUS_VALID" => 2,
                        _ => 0,
                    })
                    .fold(0, |a, b| a | b);
                guided_raw(guid, 24 + extra, attributes, &joined)
            }
            _ => return false,
        }
    };
    fs::write(out, produced).unwrap();
    true
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &Path, args: &[OsString]) -> fmmt::error::Result<ExitStatus> {
        let program = program.to_string_lossy().into_owned();
        let args: Vec<String> = args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        let mut call = vec![program.clone()];
        call.extend(args.iter().cloned());
        self.calls.borrow_mut().push(call);

        if self.fail.as_deref() == Some(program.as_str()) {
            return Ok(ExitStatus::from_raw(1 << 8));
        }

        let ok = match program.as_str() {
            "GenFv" => {
                gen_fv(&args);
                true
            }
            "GenFfs" => {
                gen_ffs(&args);
                true
            }
            "GenSec" => gen_sec(&args),
            "GenCrc32" => {
                let input = fs::read(positionals(&args, &["-o"])[0]).unwrap();
                let mut out = crc32fast::hash(&input).to_le_bytes().to_vec();
                out.extend_from_slice(&input);
                fs::write(value_of(&args, "-o").unwrap(), out).unwrap();
                true
            }
            XOR_TOOL => {
                let input = fs::read(positionals(&args, &["-o"])[0]).unwrap();
                fs::write(value_of(&args, "-o").unwrap(), xor(&input)).unwrap();
                true
            }
            _ => false,
        };
        Ok(ExitStatus::from_raw(if ok { 0 } else { 1 << 8 }))
    }
}

pub fn write_image(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, bytes).unwrap();
    path
}
