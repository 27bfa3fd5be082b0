//! Program images
//!
//! A compiled game ships as a flat image: one header block, the
//! read-only segment (code + rodata), then the initializer for the
//! read-write data segment. The header block is never mapped into the
//! guest's flash window; the RO segment starts at the next block
//! boundary so the window stays block aligned.

use serde::{Serialize, Deserialize};

use crate::cpu::instr::{self, IndirectOp};
use crate::flash::{FlashDevice, BLOCK_SIZE};
use crate::memory::RAM_SIZE;

pub const MAGIC: u32 = 0x314d_5643; // "CVM1"
pub const FORMAT_VERSION: u32 = 1;

/// Header occupies exactly one flash block
pub const HEADER_SIZE: u32 = BLOCK_SIZE;

const PACKAGE_FIELD: usize = 32;
const VERSION_FIELD: usize = 16;

/// Identity strings carried in the header and echoed into fault
/// records.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub uuid: [u8; 16],
    pub package: String,
    pub version: String,
}

impl Metadata {
    pub fn anonymous() -> Self {
        Metadata {
            uuid: [0; 16],
            package: String::new(),
            version: String::new(),
        }
    }
}

/// A validated program image.
pub struct Program {
    /// Entry vector, call-format literal
    pub entry: u32,
    pub ro_size: u32,
    pub rw_data: Vec<u8>,
    pub bss_size: u32,
    pub stack_size: u32,
    pub meta: Metadata,
    ro_segment: Vec<u8>,
}

impl Program {
    /// Parse and validate an image. Every size field is checked before
    /// anything is trusted; a bad image is rejected, never truncated.
    pub fn parse(image: &[u8]) -> Result<Program, String> {
        if image.len() < HEADER_SIZE as usize {
            return Err(format!("image too short: {} bytes", image.len()));
        }
        let word = |o: usize| {
            u32::from_le_bytes([image[o], image[o + 1], image[o + 2], image[o + 3]])
        };
        if word(0) != MAGIC {
            return Err(format!("bad magic {:#010x}", word(0)));
        }
        if word(4) != FORMAT_VERSION {
            return Err(format!("unsupported image version {}", word(4)));
        }

        let entry = word(8);
        let ro_size = word(12);
        let rw_size = word(16);
        let bss_size = word(20);
        let stack_size = word(24);

        let ro_start = HEADER_SIZE as usize;
        let ro_end = ro_start.checked_add(ro_size as usize)
            .ok_or("ro segment overflows")?;
        let rw_end = ro_end.checked_add(rw_size as usize)
            .ok_or("rw segment overflows")?;
        if rw_end > image.len() {
            return Err(format!(
                "segments ({} + {} bytes) exceed image ({} bytes)",
                ro_size, rw_size, image.len() - ro_start));
        }
        if ro_size == 0 {
            return Err("empty read-only segment".into());
        }

        let ram_need = (rw_size as u64) + (bss_size as u64) + (stack_size as u64);
        if ram_need > RAM_SIZE as u64 {
            return Err(format!("RAM layout needs {} bytes, have {}", ram_need, RAM_SIZE));
        }
        if stack_size == 0 || stack_size % 4 != 0 {
            return Err(format!("bad stack size {}", stack_size));
        }

        match instr::decode_literal(entry) {
            IndirectOp::Call { target, .. }
                if target - crate::memory::FLASH_BASE < ro_size => {}
            _ => return Err(format!("bad entry vector {:#010x}", entry)),
        }

        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&image[28..44]);
        let package = nul_string(&image[44..44 + PACKAGE_FIELD]);
        let version = nul_string(&image[44 + PACKAGE_FIELD..44 + PACKAGE_FIELD + VERSION_FIELD]);

        Ok(Program {
            entry,
            ro_size,
            rw_data: image[ro_end..rw_end].to_vec(),
            bss_size,
            stack_size,
            meta: Metadata { uuid, package, version },
            ro_segment: image[ro_start..ro_end].to_vec(),
        })
    }

    /// Write the RO segment to the flash device at `base` (block
    /// aligned); the guest window will cover it.
    pub fn install(&self, dev: &mut dyn FlashDevice, base: u32) -> Result<u32, String> {
        debug_assert_eq!(base % BLOCK_SIZE, 0);
        let end = base.checked_add(self.ro_size)
            .ok_or("install range overflows")?;
        if end > dev.capacity() {
            return Err(format!(
                "program needs {} bytes of flash at {:#x}, capacity {:#x}",
                self.ro_size, base, dev.capacity()));
        }
        dev.write(base, &self.ro_segment);
        Ok(base)
    }

    /// Host-side image encoder, used by tooling and tests.
    pub fn build(
        entry: u32,
        ro_segment: &[u8],
        rw_data: &[u8],
        bss_size: u32,
        stack_size: u32,
        meta: &Metadata,
    ) -> Vec<u8> {
        let mut image = vec![0u8; HEADER_SIZE as usize];
        image[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        image[4..8].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        image[8..12].copy_from_slice(&entry.to_le_bytes());
        image[12..16].copy_from_slice(&(ro_segment.len() as u32).to_le_bytes());
        image[16..20].copy_from_slice(&(rw_data.len() as u32).to_le_bytes());
        image[20..24].copy_from_slice(&bss_size.to_le_bytes());
        image[24..28].copy_from_slice(&stack_size.to_le_bytes());
        image[28..44].copy_from_slice(&meta.uuid);
        let pkg = meta.package.as_bytes();
        let n = pkg.len().min(PACKAGE_FIELD - 1);
        image[44..44 + n].copy_from_slice(&pkg[..n]);
        let ver = meta.version.as_bytes();
        let n = ver.len().min(VERSION_FIELD - 1);
        image[76..76 + n].copy_from_slice(&ver[..n]);

        image.extend_from_slice(ro_segment);
        image.extend_from_slice(rw_data);
        image
    }
}

fn nul_string(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::instr::emit;
    use crate::flash::MemFlash;

    fn meta() -> Metadata {
        Metadata {
            uuid: [7; 16],
            package: "com.example.demo".into(),
            version: "1.2.0".into(),
        }
    }

    fn ro_with_code() -> Vec<u8> {
        let mut ro = vec![0u8; 0x200];
        ro[0..2].copy_from_slice(&emit::svc(0).to_le_bytes());
        ro
    }

    #[test]
    fn test_build_parse_round_trip() {
        let image = Program::build(
            emit::call_literal(0, 4), &ro_with_code(), &[1, 2, 3], 64, 0x400, &meta());
        let p = Program::parse(&image).unwrap();
        assert_eq!(p.entry, emit::call_literal(0, 4));
        assert_eq!(p.ro_size, 0x200);
        assert_eq!(p.rw_data, vec![1, 2, 3]);
        assert_eq!(p.bss_size, 64);
        assert_eq!(p.stack_size, 0x400);
        assert_eq!(p.meta, meta());
    }

    #[test]
    fn test_parse_rejects_corrupt_headers() {
        let good = Program::build(
            emit::call_literal(0, 4), &ro_with_code(), &[], 0, 0x400, &meta());

        let mut bad = good.clone();
        bad[0] = 0;
        assert!(Program::parse(&bad).is_err());

        // ro_size larger than the image
        let mut bad = good.clone();
        bad[12..16].copy_from_slice(&0xffff_0000u32.to_le_bytes());
        assert!(Program::parse(&bad).is_err());

        // entry vector outside the RO segment
        let mut bad = good.clone();
        bad[8..12].copy_from_slice(&emit::call_literal(0x10000, 1).to_le_bytes());
        assert!(Program::parse(&bad).is_err());

        // RAM demand beyond the window
        let mut bad = good;
        bad[24..28].copy_from_slice(&(RAM_SIZE + 4).to_le_bytes());
        assert!(Program::parse(&bad).is_err());
    }

    #[test]
    fn test_install_writes_ro_segment() {
        let image = Program::build(
            emit::call_literal(0, 4), &ro_with_code(), &[], 0, 0x400, &meta());
        let p = Program::parse(&image).unwrap();

        let mut dev = MemFlash::new(0x4000);
        p.install(&mut dev, 0x100).unwrap();
        let mut buf = [0u8; 2];
        dev.read(0x100, &mut buf);
        assert_eq!(u16::from_le_bytes(buf), emit::svc(0));

        // too small a device is rejected cleanly
        let mut tiny = MemFlash::new(0x100);
        assert!(p.install(&mut tiny, 0).is_err());
    }
}
