//! Lightweight state snapshots
//!
//! Saves CPU state, RAM, and the cooperative clock — not the flash
//! cache, which refills on demand after restore. Physical pointers
//! (PC and the base pointers) are squashed to virtual addresses on
//! capture and re-validated on restore, so a snapshot survives cache
//! recycling and can move between simulator instances running the
//! same installed program.

use serde::{Serialize, Deserialize};

use crate::cpu::runtime::Runtime;
use crate::cpu::{Cpu, REG_BP_RO, REG_BP_RW};
use crate::memory;

#[derive(Serialize, Deserialize)]
pub struct Snapshot {
    /// Version for compatibility checking
    pub version: u32,
    pub cpu: Cpu,
    /// Virtual PC, rebranched on restore
    pub pc_va: u32,
    /// Virtual address last validated into the base pointers, or zero
    pub validated_va: u32,
    pub uptime: u64,
    pub volume: u32,
    pub ram: Vec<u8>,
}

impl Snapshot {
    pub const VERSION: u32 = 1;

    pub fn capture(rt: &Runtime) -> Self {
        let ro = rt.cpu.reg(REG_BP_RO);
        let validated_va = if ro == 0 {
            0
        } else if memory::pa_is_flash(ro) {
            let (slot, off) = memory::pa_flash_parts(ro);
            let fa = rt.cache.block_addr(slot) + off;
            rt.mem.flash_to_virt_addr(fa).unwrap_or(0)
        } else {
            rt.mem.phys_to_virt_ram(ro).unwrap_or(0)
        };

        Snapshot {
            version: Self::VERSION,
            cpu: rt.cpu.clone(),
            pc_va: rt.pc_virt(),
            validated_va,
            uptime: rt.uptime,
            volume: rt.volume,
            ram: rt.mem.ram_slice().to_vec(),
        }
    }

    /// Restore into a runtime with the same program installed. The PC
    /// and base pointers are rebuilt through the normal validation
    /// paths; a snapshot cannot smuggle unchecked pointers in.
    pub fn restore(&self, rt: &mut Runtime) -> Result<(), String> {
        if self.version != Self::VERSION {
            return Err(format!("snapshot version {} unsupported", self.version));
        }
        if self.ram.len() != rt.mem.ram_slice().len() {
            return Err("snapshot RAM size mismatch".into());
        }
        rt.cpu = self.cpu.clone();
        rt.mem.ram_slice_mut().copy_from_slice(&self.ram);
        rt.uptime = self.uptime;
        rt.volume = self.volume;

        rt.cpu.set_reg(REG_BP_RO, 0);
        rt.cpu.set_reg(REG_BP_RW, 0);
        if self.pc_va != 0 {
            rt.branch(self.pc_va)
                .map_err(|s| format!("snapshot PC invalid: {:?}", s))?;
        }
        if self.validated_va != 0 {
            rt.restore_validate(self.validated_va)
                .map_err(|s| format!("snapshot base pointer invalid: {:?}", s))?;
        }
        Ok(())
    }

    /// Serialize to bytes (compressed with zstd)
    pub fn to_bytes(&self) -> Result<Vec<u8>, String> {
        let serialized = bincode::serialize(self)
            .map_err(|e| format!("serialization error: {}", e))?;
        zstd::stream::encode_all(&serialized[..], 3)
            .map_err(|e| format!("compression error: {}", e))
    }

    /// Deserialize from bytes (compressed with zstd)
    pub fn from_bytes(data: &[u8]) -> Result<Self, String> {
        let decompressed = zstd::stream::decode_all(data)
            .map_err(|e| format!("decompression error: {}", e))?;
        bincode::deserialize(&decompressed)
            .map_err(|e| format!("deserialization error: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::instr::emit;
    use crate::flash::{MemFlash, BLOCK_SIZE};

    fn runtime() -> Runtime {
        let mut code = vec![0u8; BLOCK_SIZE as usize];
        let insts = [emit::mov_imm(0, 1), emit::mov_imm(1, 2), 0xBE00u16];
        for (i, hw) in insts.iter().enumerate() {
            code[i * 2..i * 2 + 2].copy_from_slice(&hw.to_le_bytes());
        }
        let mut dev = MemFlash::new(0x1000);
        dev.fill(0, &code);
        let mut rt = Runtime::new(Box::new(dev));
        rt.mem.set_flash_window(0, 0x100);
        rt.set_stack(0x1000);
        rt.launch(emit::call_literal(0, 4)).unwrap();
        rt
    }

    #[test]
    fn test_snapshot_round_trip() {
        let mut rt = runtime();
        rt.step().unwrap(); // r0 = 1
        rt.write_ram_virt(0x10010, &[0xAA, 0xBB]);
        rt.uptime = 99;

        let bytes = Snapshot::capture(&rt).to_bytes().unwrap();
        let snap = Snapshot::from_bytes(&bytes).unwrap();

        // restore into a fresh runtime over the same program
        let mut rt2 = runtime();
        snap.restore(&mut rt2).unwrap();

        assert_eq!(rt2.cpu.gpr(0), 1);
        assert_eq!(rt2.uptime, 99);
        assert_eq!(rt2.pc_virt(), rt.pc_virt());
        assert_eq!(rt2.read_ram_virt(0x10010, 2).unwrap(), vec![0xAA, 0xBB]);

        // execution continues identically
        rt2.step().unwrap();
        assert_eq!(rt2.cpu.gpr(1), 2);
    }

    #[test]
    fn test_snapshot_version_check() {
        let rt = runtime();
        let mut snap = Snapshot::capture(&rt);
        snap.version = 99;
        let mut rt2 = runtime();
        assert!(snap.restore(&mut rt2).is_err());
    }
}
