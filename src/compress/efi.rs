use crate::error::{FmmtError, Result};
use crate::primitives::le_u32;

use super::Decompress;

const BITBUFSIZ: u32 = 32;
const MAXMATCH: u16 = 256;
const THRESHOLD: u16 = 3;
const CODE_BIT: u16 = 16;

/// Character and length alphabet.
const NC: usize = (0xFF + MAXMATCH + 2 - THRESHOLD) as usize;
const CBIT: u32 = 9;
const MAXPBIT: u32 = 5;
const TBIT: u32 = 5;
const MAXNP: usize = (1 << MAXPBIT) - 1;
const NT: usize = (CODE_BIT + 3) as usize;
const NPT: usize = if NT > MAXNP { NT } else { MAXNP };

/// Position-set width of the EFI 1.1 / UEFI standard format.
const EFI_PBIT: u32 = 4;

/// Decoder for the UEFI standard compression format.
///
/// The stream starts with `{compressed size: u32, original size: u32}` followed by a
/// sequence of Huffman-coded blocks.
#[derive(Debug, Default, Clone, Copy)]
pub struct EfiDecompressor;

impl EfiDecompressor {
    pub fn new() -> Self {
        EfiDecompressor
    }
}

fn corrupt(what: &str) -> FmmtError {
    FmmtError::SectionError(format!("compressed stream is corrupt: {}", what))
}

impl Decompress for EfiDecompressor {
    fn decoded_size(&self, src: &[u8]) -> Result<u32> {
        if src.len() < 8 {
            return Err(FmmtError::SectionError(
                "compressed stream shorter than its header".into(),
            ));
        }
        let compressed = le_u32(src, 0)? as usize;
        if src.len() < compressed + 8 {
            return Err(FmmtError::SectionError(format!(
                "compressed stream claims {:#x} bytes, {:#x} present",
                compressed,
                src.len() - 8
            )));
        }
        le_u32(src, 4)
    }

    fn decompress(&self, src: &[u8], dst: &mut [u8]) -> Result<()> {
        let orig_size = self.decoded_size(src)? as usize;
        if dst.len() != orig_size {
            return Err(FmmtError::InvalidParameter(format!(
                "destination holds {:#x} bytes, stream decodes to {:#x}",
                dst.len(),
                orig_size
            )));
        }
        if orig_size == 0 {
            return Ok(());
        }
        let comp_size = le_u32(src, 0)? as usize;
        let mut state = Decoder::new(&src[8..8 + comp_size], dst, EFI_PBIT);
        state.fill_buf(BITBUFSIZ);
        state.decode()
    }
}

struct Decoder<'a> {
    src: &'a [u8],
    in_pos: usize,
    dst: &'a mut [u8],
    out_pos: usize,

    bit_buf: u32,
    sub_bit_buf: u32,
    bit_count: u32,
    block_size: u16,
    pbit: u32,

    left: Vec<u16>,
    right: Vec<u16>,
    c_len: Vec<u8>,
    pt_len: Vec<u8>,
    c_table: Vec<u16>,
    pt_table: Vec<u16>,
}

impl<'a> Decoder<'a> {
    fn new(src: &'a [u8], dst: &'a mut [u8], pbit: u32) -> Self {
        Decoder {
            src,
            in_pos: 0,
            dst,
            out_pos: 0,
            bit_buf: 0,
            sub_bit_buf: 0,
            bit_count: 0,
            block_size: 0,
            pbit,
            left: vec![0; 2 * NC - 1],
            right: vec![0; 2 * NC - 1],
            c_len: vec![0; NC],
            pt_len: vec![0; NPT],
            c_table: vec![0; 4096],
            pt_table: vec![0; 256],
        }
    }

    /// Shifts `n` bits out of the bit buffer, refilling from the source.
    fn fill_buf(&mut self, mut n: u32) {
        self.bit_buf = ((u64::from(self.bit_buf)) << n) as u32;
        while n > self.bit_count {
            n -= self.bit_count;
            self.bit_buf |= ((u64::from(self.sub_bit_buf)) << n) as u32;
            self.sub_bit_buf = match self.src.get(self.in_pos) {
                Some(b) => {
                    self.in_pos += 1;
                    u32::from(*b)
                }
                None => 0,
            };
            self.bit_count = 8;
        }
        self.bit_count -= n;
        self.bit_buf |= self.sub_bit_buf >> self.bit_count;
    }

    fn get_bits(&mut self, n: u32) -> u32 {
        let out = if n == 0 {
            0
        } else {
            self.bit_buf >> (BITBUFSIZ - n)
        };
        self.fill_buf(n);
        out
    }

    /// Walks the overflow tree for codes longer than the lookup table.
    fn walk_tree(&self, mut val: u16, limit: usize, table_bits: u32) -> Result<u16> {
        let mut mask = 1u32 << (BITBUFSIZ - 1 - table_bits);
        while usize::from(val) >= limit {
            if mask == 0 {
                return Err(corrupt("code longer than 32 bits"));
            }
            let next = if self.bit_buf & mask != 0 {
                self.right.get(usize::from(val))
            } else {
                self.left.get(usize::from(val))
            };
            val = *next.ok_or_else(|| corrupt("tree index out of range"))?;
            mask >>= 1;
        }
        Ok(val)
    }

    fn read_pt_len(&mut self, nn: usize, nbit: u32, special: Option<usize>) -> Result<()> {
        let number = self.get_bits(nbit) as usize;
        if number > NPT || nn > NPT {
            return Err(corrupt("position/extra table too large"));
        }
        if number == 0 {
            let c = self.get_bits(nbit) as u16;
            self.pt_table.iter_mut().for_each(|v| *v = c);
            self.pt_len[..nn].iter_mut().for_each(|v| *v = 0);
            return Ok(());
        }

        let mut index = 0;
        while index < number && index < NPT {
            let mut c = self.bit_buf >> (BITBUFSIZ - 3);
            if c == 7 {
                let mut mask = 1u32 << (BITBUFSIZ - 1 - 3);
                while mask & self.bit_buf != 0 {
                    mask >>= 1;
                    c += 1;
                }
            }
            self.fill_buf(if c < 7 { 3 } else { c - 3 });
            self.pt_len[index] = c as u8;
            index += 1;
            if Some(index) == special {
                let zeros = self.get_bits(2);
                for _ in 0..zeros {
                    if index >= NPT {
                        break;
                    }
                    self.pt_len[index] = 0;
                    index += 1;
                }
            }
        }
        while index < nn && index < NPT {
            self.pt_len[index] = 0;
            index += 1;
        }
        make_table(
            nn,
            &self.pt_len,
            8,
            &mut self.pt_table,
            &mut self.left,
            &mut self.right,
        )
    }

    fn read_c_len(&mut self) -> Result<()> {
        let number = self.get_bits(CBIT) as usize;
        if number == 0 {
            let c = self.get_bits(CBIT) as u16;
            self.c_len.iter_mut().for_each(|v| *v = 0);
            self.c_table.iter_mut().for_each(|v| *v = c);
            return Ok(());
        }

        let mut index = 0;
        while index < number && index < NC {
            let first = self.pt_table[(self.bit_buf >> (BITBUFSIZ - 8)) as usize];
            let c = self.walk_tree(first, NT, 8)?;
            let len = *self
                .pt_len
                .get(usize::from(c))
                .ok_or_else(|| corrupt("length code out of range"))?;
            self.fill_buf(u32::from(len));
            if c <= 2 {
                let zeros = match c {
                    0 => 1,
                    1 => self.get_bits(4) + 3,
                    _ => self.get_bits(CBIT) + 20,
                };
                for _ in 0..zeros {
                    if index >= NC {
                        break;
                    }
                    self.c_len[index] = 0;
                    index += 1;
                }
            } else {
                self.c_len[index] = (c - 2) as u8;
                index += 1;
            }
        }
        self.c_len[index..].iter_mut().for_each(|v| *v = 0);
        make_table(
            NC,
            &self.c_len,
            12,
            &mut self.c_table,
            &mut self.left,
            &mut self.right,
        )
    }

    fn decode_c(&mut self) -> Result<u16> {
        if self.block_size == 0 {
            self.block_size = self.get_bits(16) as u16;
            self.read_pt_len(NT, TBIT, Some(3))?;
            self.read_c_len()?;
            self.read_pt_len(MAXNP, self.pbit, None)?;
        }
        self.block_size = self.block_size.wrapping_sub(1);
        let first = self.c_table[(self.bit_buf >> (BITBUFSIZ - 12)) as usize];
        let c = self.walk_tree(first, NC, 12)?;
        let len = *self
            .c_len
            .get(usize::from(c))
            .ok_or_else(|| corrupt("character code out of range"))?;
        self.fill_buf(u32::from(len));
        Ok(c)
    }

    fn decode_p(&mut self) -> Result<u32> {
        let first = self.pt_table[(self.bit_buf >> (BITBUFSIZ - 8)) as usize];
        let val = self.walk_tree(first, MAXNP, 8)?;
        let len = *self
            .pt_len
            .get(usize::from(val))
            .ok_or_else(|| corrupt("position code out of range"))?;
        self.fill_buf(u32::from(len));
        let val = u32::from(val);
        Ok(if val > 1 {
            (1u32 << (val - 1)) + self.get_bits(val - 1)
        } else {
            val
        })
    }

    fn decode(&mut self) -> Result<()> {
        let orig_size = self.dst.len();
        loop {
            let c = self.decode_c()?;
            if c < 256 {
                if self.out_pos >= orig_size {
                    return Ok(());
                }
                self.dst[self.out_pos] = c as u8;
                self.out_pos += 1;
            } else {
                let count = usize::from(c - (256 - THRESHOLD));
                let distance = self.decode_p()? as usize;
                let mut from = self
                    .out_pos
                    .checked_sub(distance + 1)
                    .ok_or_else(|| corrupt("match reaches before the start of the output"))?;
                for _ in 0..count {
                    if self.out_pos >= orig_size {
                        return Ok(());
                    }
                    self.dst[self.out_pos] = self.dst[from];
                    self.out_pos += 1;
                    from += 1;
                }
                if self.out_pos >= orig_size {
                    return Ok(());
                }
            }
        }
    }
}

/// Where `make_table` is about to store a value.
#[derive(Clone, Copy)]
enum Slot {
    Table(usize),
    Left(usize),
    Right(usize),
}

/// Builds the lookup table (and overflow tree) for canonical Huffman code lengths.
fn make_table(
    num_of_char: usize,
    bit_len: &[u8],
    table_bits: u32,
    table: &mut [u16],
    left: &mut [u16],
    right: &mut [u16],
) -> Result<()> {
    let mut count = [0u16; 17];
    let mut weight = [0u16; 17];
    let mut start = [0u16; 18];

    for &len in &bit_len[..num_of_char] {
        if len > 16 {
            return Err(corrupt("code length over 16 bits"));
        }
        count[usize::from(len)] += 1;
    }

    for i in 1..=16usize {
        let add = (u32::from(count[i]) << (16 - i)) as u16;
        start[i + 1] = start[i].wrapping_add(add);
    }
    if start[17] != 0 {
        return Err(corrupt("code lengths do not form a prefix code"));
    }

    let ju_bits = 16 - table_bits;
    let table_bits = table_bits as usize;
    for i in 1..=table_bits {
        start[i] >>= ju_bits;
        weight[i] = 1 << (table_bits - i);
    }
    for (i, w) in weight.iter_mut().enumerate().skip(table_bits + 1) {
        *w = 1 << (16 - i);
    }

    let first_free = usize::from(start[table_bits + 1] >> ju_bits);
    let table_len = 1usize << table_bits;
    if first_free != 0 && first_free < table_len {
        table[first_free..table_len].iter_mut().for_each(|v| *v = 0);
    }

    let mut avail = num_of_char as u16;
    let mask = 1u16 << (15 - table_bits);

    for ch in 0..num_of_char {
        let len = usize::from(bit_len[ch]);
        if len == 0 {
            continue;
        }
        let next_code = start[len].wrapping_add(weight[len]);
        if len <= table_bits {
            if start[len] >= next_code || usize::from(next_code) > table_len {
                return Err(corrupt("code overflows lookup table"));
            }
            table[usize::from(start[len])..usize::from(next_code)]
                .iter_mut()
                .for_each(|v| *v = ch as u16);
        } else {
            let mut code = start[len];
            let mut slot = Slot::Table(usize::from(code >> ju_bits));
            for _ in 0..(len - table_bits) {
                let current = read_slot(slot, table, left, right)?;
                let current = if current == 0 && usize::from(avail) < 2 * NC - 1 {
                    right[usize::from(avail)] = 0;
                    left[usize::from(avail)] = 0;
                    write_slot(slot, avail, table, left, right)?;
                    avail += 1;
                    avail - 1
                } else {
                    current
                };
                if usize::from(current) < 2 * NC - 1 {
                    slot = if code & mask != 0 {
                        Slot::Right(usize::from(current))
                    } else {
                        Slot::Left(usize::from(current))
                    };
                }
                code <<= 1;
            }
            write_slot(slot, ch as u16, table, left, right)?;
        }
        start[len] = next_code;
    }
    Ok(())
}

fn read_slot(slot: Slot, table: &[u16], left: &[u16], right: &[u16]) -> Result<u16> {
    let v = match slot {
        Slot::Table(i) => table.get(i),
        Slot::Left(i) => left.get(i),
        Slot::Right(i) => right.get(i),
    };
    v.copied().ok_or_else(|| corrupt("tree slot out of range"))
}

fn write_slot(
    slot: Slot,
    value: u16,
    table: &mut [u16],
    left: &mut [u16],
    right: &mut [u16],
) -> Result<()> {
    let v = match slot {
        Slot::Table(i) => table.get_mut(i),
        Slot::Left(i) => left.get_mut(i),
        Slot::Right(i) => right.get_mut(i),
    };
    *v.ok_or_else(|| corrupt("tree slot out of range"))? = value;
    Ok(())
}
