//! Debugger stub
//!
//! Serves a fixed-format word-packet protocol for a remote host:
//! register and RAM access, signals, breakpoints, single-step. A
//! command packet is at most 15 words; word 0 carries the command in
//! its top byte and a 24-bit argument below it. Register and
//! breakpoint-slot bitmaps use the CLZ convention: bit significance
//! follows count-leading-zeros order, register N is bit (23 - N) of
//! the argument field.
//!
//! Writing a stop signal of zero resumes execution.

use crate::cpu::fault::FaultCode;
use crate::cpu::instr;
use crate::cpu::runtime::Runtime;
use crate::cpu::{NUM_REGS, REG_FP, REG_PC, REG_SP};
use crate::flash::PatchSet;

pub const CMD_READ_REGISTERS: u8 = 0x01;
pub const CMD_WRITE_REGISTERS: u8 = 0x02;
pub const CMD_READ_RAM: u8 = 0x03;
pub const CMD_WRITE_RAM: u8 = 0x04;
pub const CMD_SIGNAL: u8 = 0x05;
pub const CMD_IS_STOPPED: u8 = 0x06;
pub const CMD_DETACH: u8 = 0x07;
pub const CMD_SET_BREAKPOINTS: u8 = 0x08;
pub const CMD_STEP: u8 = 0x09;

/// Client-visible breakpoint slots
pub const NUM_BREAKPOINTS: usize = 4;
/// One extra internal slot drives single-step; never exposed
const STEP_SLOT: usize = NUM_BREAKPOINTS;

/// Largest data payload per reply packet, in words
const MAX_DATA_WORDS: usize = 14;

pub const SIG_INT: u32 = 2;
pub const SIG_ILL: u32 = 4;
pub const SIG_TRAP: u32 = 5;
pub const SIG_ABRT: u32 = 6;
pub const SIG_SEGV: u32 = 11;
pub const SIG_SYS: u32 = 31;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DebugState {
    Detached,
    Running,
    Stopped(u32),
}

pub struct Debugger {
    state: DebugState,
    /// Breakpoint addresses (virtual); slot STEP_SLOT is internal
    breakpoints: [u32; NUM_BREAKPOINTS + 1],
    /// Bitmap of live slots
    live: u32,
}

impl Debugger {
    pub fn new() -> Self {
        Debugger {
            state: DebugState::Detached,
            breakpoints: [0; NUM_BREAKPOINTS + 1],
            live: 0,
        }
    }

    pub fn attached(&self) -> bool {
        self.state != DebugState::Detached
    }

    pub fn stop_signal(&self) -> Option<u32> {
        match self.state {
            DebugState::Stopped(sig) => Some(sig),
            _ => None,
        }
    }

    /// Offer a runtime fault to the debugger. Returns true if it was
    /// absorbed (debugger attached, target stopped for inspection).
    pub fn fault(&mut self, code: FaultCode) -> bool {
        if !self.attached() {
            return false;
        }
        self.state = DebugState::Stopped(signal_for(code));
        true
    }

    /// A breakpoint instruction fired. Clears the single-step slot if
    /// that is what planted it.
    pub fn breakpoint_hit(&mut self, rt: &mut Runtime) -> bool {
        if !self.attached() {
            return false;
        }
        if self.live & (1 << STEP_SLOT) != 0 {
            self.live &= !(1 << STEP_SLOT);
            self.sync_patches(rt);
        }
        self.state = DebugState::Stopped(SIG_TRAP);
        true
    }

    /// Handle one command packet, returning the reply words.
    pub fn handle_packet(&mut self, rt: &mut Runtime, packet: &[u32]) -> Vec<u32> {
        if packet.is_empty() {
            return Vec::new();
        }
        let cmd = (packet[0] >> 24) as u8;
        let arg = packet[0] & 0x00ff_ffff;

        // any traffic except DETACH attaches the debugger
        if cmd != CMD_DETACH && !self.attached() {
            self.state = DebugState::Running;
        }

        match cmd {
            CMD_READ_REGISTERS => {
                let mut reply = Vec::new();
                for r in 0..NUM_REGS {
                    if arg & (0x0080_0000 >> r) != 0 {
                        reply.push(self.read_register(rt, r));
                    }
                }
                reply
            }

            CMD_WRITE_REGISTERS => {
                let mut word = 1;
                for r in 0..NUM_REGS {
                    if arg & (0x0080_0000 >> r) != 0 {
                        if let Some(&v) = packet.get(word) {
                            self.write_register(rt, r, v);
                        }
                        word += 1;
                    }
                }
                Vec::new()
            }

            CMD_READ_RAM => {
                let len = packet.get(1).copied().unwrap_or(0)
                    .min((MAX_DATA_WORDS * 4) as u32);
                match rt.read_ram_virt(arg, len) {
                    Some(bytes) => pack_words(&bytes),
                    None => Vec::new(),
                }
            }

            CMD_WRITE_RAM => {
                let len = packet.get(1).copied().unwrap_or(0)
                    .min((MAX_DATA_WORDS * 4) as u32) as usize;
                let mut bytes = Vec::with_capacity(len);
                for w in packet.get(2..).unwrap_or(&[]) {
                    bytes.extend_from_slice(&w.to_le_bytes());
                }
                bytes.truncate(len);
                rt.write_ram_virt(arg, &bytes);
                Vec::new()
            }

            CMD_SIGNAL => {
                if arg == 0 {
                    self.state = DebugState::Running;
                } else {
                    self.state = DebugState::Stopped(arg);
                }
                Vec::new()
            }

            CMD_IS_STOPPED => {
                vec![self.stop_signal().unwrap_or(0)]
            }

            CMD_DETACH => {
                self.state = DebugState::Detached;
                self.live &= !(1 << STEP_SLOT);
                self.sync_patches(rt);
                Vec::new()
            }

            CMD_SET_BREAKPOINTS => {
                let mut word = 1;
                for slot in 0..NUM_BREAKPOINTS {
                    if arg & (0x0080_0000 >> slot) != 0 {
                        if let Some(&addr) = packet.get(word) {
                            self.breakpoints[slot] = addr & !1;
                            self.live |= 1 << slot;
                        }
                        word += 1;
                    } else {
                        self.live &= !(1 << slot);
                    }
                }
                self.sync_patches(rt);
                Vec::new()
            }

            CMD_STEP => {
                self.plant_step_breakpoint(rt);
                self.state = DebugState::Running;
                Vec::new()
            }

            _ => Vec::new(),
        }
    }

    fn read_register(&self, rt: &Runtime, r: usize) -> u32 {
        match r {
            REG_PC => rt.pc_virt(),
            REG_SP | REG_FP => {
                let v = rt.cpu.reg(r);
                if v == 0 {
                    0
                } else {
                    rt.mem.phys_to_virt_ram(v).unwrap_or(v)
                }
            }
            _ => rt.cpu.reg(r),
        }
    }

    fn write_register(&mut self, rt: &mut Runtime, r: usize, value: u32) {
        match r {
            REG_PC => {
                // re-branching to the held PC would force a spurious
                // revalidation; skip when the value is unchanged
                if value != rt.pc_virt() {
                    if rt.branch(value).is_err() {
                        self.state = DebugState::Stopped(SIG_SEGV);
                    }
                }
            }
            REG_SP | REG_FP => {
                let pa = if value == 0 {
                    0
                } else {
                    rt.mem.map_ram(value, 0).unwrap_or(value)
                };
                rt.cpu.set_reg(r, pa);
            }
            _ => rt.cpu.set_reg(r, value),
        }
    }

    /// Arm the internal slot at the next instruction boundary and let
    /// the target run into it.
    fn plant_step_breakpoint(&mut self, rt: &mut Runtime) {
        let pc = rt.pc_virt();
        let mut hw = [0u8; 2];
        let size = if rt.mem.copy_rodata(&mut rt.cache, &mut hw, pc)
            && instr::is_32bit(u16::from_le_bytes(hw))
        {
            4
        } else {
            2
        };
        self.breakpoints[STEP_SLOT] = pc + size;
        self.live |= 1 << STEP_SLOT;
        self.sync_patches(rt);
    }

    /// Rebuild the cache's patch table from the live slots and drop
    /// every cached block so the next load picks the patches up.
    fn sync_patches(&self, rt: &mut Runtime) {
        let mut patches = PatchSet::default();
        for slot in 0..=NUM_BREAKPOINTS {
            if self.live & (1 << slot) == 0 {
                continue;
            }
            if let Some(fa) = rt.mem.virt_to_flash_addr(self.breakpoints[slot]) {
                patches.addrs[slot] = fa;
                patches.live |= 1 << slot;
            }
        }
        rt.cache.set_patches(patches);
        rt.cache.invalidate();
    }
}

impl Default for Debugger {
    fn default() -> Self {
        Debugger::new()
    }
}

fn signal_for(code: FaultCode) -> u32 {
    match code {
        FaultCode::Abort => SIG_ABRT,
        FaultCode::BadSyscall | FaultCode::SyscallParam => SIG_SYS,
        FaultCode::ReservedSvc
        | FaultCode::ReservedAddrop
        | FaultCode::ReservedInstr => SIG_ILL,
        _ => SIG_SEGV,
    }
}

fn pack_words(bytes: &[u8]) -> Vec<u32> {
    bytes.chunks(4).map(|c| {
        let mut w = [0u8; 4];
        w[..c.len()].copy_from_slice(c);
        u32::from_le_bytes(w)
    }).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::fault::Stop;
    use crate::cpu::instr::emit;
    use crate::flash::{MemFlash, BLOCK_SIZE};
    use crate::memory::FLASH_BASE;

    fn cmd(c: u8, arg: u32) -> u32 {
        ((c as u32) << 24) | (arg & 0x00ff_ffff)
    }

    fn reg_bit(r: usize) -> u32 {
        0x0080_0000 >> r
    }

    fn boot(code: &[u16]) -> Runtime {
        let mut data = vec![0u8; BLOCK_SIZE as usize];
        for (i, hw) in code.iter().enumerate() {
            data[i * 2..i * 2 + 2].copy_from_slice(&hw.to_le_bytes());
        }
        let mut dev = MemFlash::new(0x1000);
        dev.fill(0, &data);
        let mut rt = Runtime::new(Box::new(dev));
        rt.mem.set_flash_window(0, 0x100);
        rt.set_stack(0x1000);
        rt.launch(emit::call_literal(0, 1)).unwrap();
        rt
    }

    #[test]
    fn test_attach_and_register_read() {
        let mut rt = boot(&[emit::mov_imm(0, 7), 0xBE00]);
        rt.cpu.set_gpr(0, 0x1234);
        let mut dbg = Debugger::new();
        assert!(!dbg.attached());

        let reply = dbg.handle_packet(&mut rt,
            &[cmd(CMD_READ_REGISTERS, reg_bit(0) | reg_bit(REG_PC))]);
        assert!(dbg.attached());
        assert_eq!(reply, vec![0x1234, FLASH_BASE]);
    }

    #[test]
    fn test_register_write_and_pc_branch() {
        let mut rt = boot(&[emit::mov_imm(0, 7), emit::mov_imm(1, 8), 0xBE00]);
        let mut dbg = Debugger::new();

        // write r3 and redirect PC to the second instruction
        dbg.handle_packet(&mut rt,
            &[cmd(CMD_WRITE_REGISTERS, reg_bit(3) | reg_bit(REG_PC)),
              0xAABB, FLASH_BASE + 2]);
        assert_eq!(rt.cpu.gpr(3), 0xAABB);
        assert_eq!(rt.pc_virt(), FLASH_BASE + 2);

        // stepping from here lands on the breakpoint instruction
        assert_eq!(rt.step(), Ok(()));
        assert_eq!(rt.cpu.gpr(1), 8);
    }

    #[test]
    fn test_ram_read_write_round_trip() {
        let mut rt = boot(&[0xBE00]);
        let mut dbg = Debugger::new();

        dbg.handle_packet(&mut rt,
            &[cmd(CMD_WRITE_RAM, 0x10080), 8,
              u32::from_le_bytes(*b"dbgw"), u32::from_le_bytes(*b"rite")]);
        let reply = dbg.handle_packet(&mut rt,
            &[cmd(CMD_READ_RAM, 0x10080), 8]);
        assert_eq!(reply.len(), 2);
        assert_eq!(reply[0].to_le_bytes(), *b"dbgw");
        assert_eq!(reply[1].to_le_bytes(), *b"rite");
    }

    #[test]
    fn test_signal_stop_resume_detach() {
        let mut rt = boot(&[0xBE00]);
        let mut dbg = Debugger::new();

        dbg.handle_packet(&mut rt, &[cmd(CMD_SIGNAL, SIG_INT)]);
        assert_eq!(dbg.stop_signal(), Some(SIG_INT));
        assert_eq!(dbg.handle_packet(&mut rt, &[cmd(CMD_IS_STOPPED, 0)]),
                   vec![SIG_INT]);

        dbg.handle_packet(&mut rt, &[cmd(CMD_SIGNAL, 0)]);
        assert_eq!(dbg.stop_signal(), None);

        dbg.handle_packet(&mut rt, &[cmd(CMD_DETACH, 0)]);
        assert!(!dbg.attached());
    }

    #[test]
    fn test_fault_absorbed_only_when_attached() {
        let mut rt = boot(&[0xBE00]);
        let mut dbg = Debugger::new();
        assert!(!dbg.fault(FaultCode::LoadAddress));

        dbg.handle_packet(&mut rt, &[cmd(CMD_IS_STOPPED, 0)]);
        assert!(dbg.fault(FaultCode::LoadAddress));
        assert_eq!(dbg.stop_signal(), Some(SIG_SEGV));
    }

    #[test]
    fn test_breakpoint_via_protocol() {
        // program: three movs then loops forever on itself
        let mut rt = boot(&[
            emit::mov_imm(0, 1),
            emit::mov_imm(1, 2),
            emit::mov_imm(2, 3),
            emit::b(-4),
        ]);
        let mut dbg = Debugger::new();

        // set a breakpoint on the third instruction
        dbg.handle_packet(&mut rt,
            &[cmd(CMD_SET_BREAKPOINTS, reg_bit(0)), FLASH_BASE + 4]);

        let stop = loop {
            match rt.step() {
                Ok(()) => continue,
                Err(s) => break s,
            }
        };
        assert_eq!(stop, Stop::Breakpoint);
        assert!(dbg.breakpoint_hit(&mut rt));
        assert_eq!(dbg.stop_signal(), Some(SIG_TRAP));
        assert_eq!(rt.pc_virt(), FLASH_BASE + 4);
        assert_eq!(rt.cpu.gpr(1), 2);
        assert_eq!(rt.cpu.gpr(2), 0); // not yet executed

        // clearing all breakpoints restores the original instruction
        dbg.handle_packet(&mut rt, &[cmd(CMD_SET_BREAKPOINTS, 0)]);
        assert_eq!(rt.step(), Ok(()));
        assert_eq!(rt.cpu.gpr(2), 3);
    }

    #[test]
    fn test_single_step() {
        let mut rt = boot(&[
            emit::mov_imm(0, 1),
            emit::mov_imm(1, 2),
            emit::mov_imm(2, 3),
            0xBE00,
        ]);
        let mut dbg = Debugger::new();
        dbg.handle_packet(&mut rt, &[cmd(CMD_SIGNAL, SIG_INT)]);

        dbg.handle_packet(&mut rt, &[cmd(CMD_STEP, 0)]);
        assert_eq!(rt.step(), Ok(()));             // executes mov r0
        assert_eq!(rt.step(), Err(Stop::Breakpoint));
        assert!(dbg.breakpoint_hit(&mut rt));
        assert_eq!(rt.cpu.gpr(0), 1);
        assert_eq!(rt.cpu.gpr(1), 0);
        assert_eq!(rt.pc_virt(), FLASH_BASE + 2);

        // the step slot is consumed; resuming runs to the real bkpt
        dbg.handle_packet(&mut rt, &[cmd(CMD_SIGNAL, 0)]);
        assert_eq!(rt.step(), Ok(()));
        assert_eq!(rt.step(), Ok(()));
        assert_eq!(rt.step(), Err(Stop::Breakpoint));
        assert_eq!(rt.cpu.gpr(2), 3);
    }
}
