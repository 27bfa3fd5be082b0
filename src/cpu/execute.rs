//! Instruction execution
//!
//! Executes the Thumb-like halfword subset compiled game code is built
//! from. Everything non-trivial (calls, returns, syscalls, validation)
//! is an SVC handled by the runtime dispatcher; what remains here is
//! ALU work on r0-r7, PC-relative literal loads, SP-relative and
//! base-pointer-relative load/store, and in-block branches.

use crate::cpu::fault::{FaultCode, Stop};
use crate::cpu::instr::{halfword, is_32bit, BKPT_OPCODE, NOP_OPCODE};
use crate::cpu::runtime::Runtime;
use crate::cpu::{REG_BP_RO, REG_BP_RW};
use crate::flash::BLOCK_SIZE;
use crate::memory;

#[inline(always)]
fn sext8(v: u16) -> i32 {
    (v as u8) as i8 as i32
}

#[inline(always)]
fn sext11(v: u16) -> i32 {
    ((v & 0x7ff) as i32) << 21 >> 21
}

impl Runtime {
    /// Execute one instruction at PC.
    pub fn step(&mut self) -> Result<(), Stop> {
        if self.abort_trap_set() {
            return Err(Stop::Fault(FaultCode::Abort));
        }

        let mut pc = self.cpu.pc();
        if !memory::pa_is_flash(pc) {
            return Err(self.fault(FaultCode::CodeFetch));
        }
        let (mut slot, mut off) = memory::pa_flash_parts(pc);

        // sequential flow off the block edge: revalidate into the
        // next block of the segment
        if off + 2 > BLOCK_SIZE {
            let va = self.reconstruct_code_addr(pc);
            self.branch(va)?;
            pc = self.cpu.pc();
            let parts = memory::pa_flash_parts(pc);
            slot = parts.0;
            off = parts.1;
        }

        let extent = self.cache.extend_code_validity(slot);
        if off + 2 > extent {
            return Err(self.fault(FaultCode::CodeFetch));
        }
        let data = self.cache.block_data(slot);
        let hw = halfword(data, off as usize);

        self.cpu.instruction_count += 1;

        if is_32bit(hw) {
            if off + 4 > extent {
                return Err(self.fault(FaultCode::CodeFetch));
            }
            let hw2 = halfword(data, off as usize + 2);
            self.cpu.set_pc(pc + 4);
            return self.exec32(hw, hw2);
        }

        self.cpu.set_pc(pc + 2);
        self.exec16(hw, slot, off, pc)
    }

    fn exec16(&mut self, hw: u16, slot: usize, off: u32, pc: u32) -> Result<(), Stop> {
        match hw >> 12 {
            0x0 | 0x1 => {
                if hw & 0x1800 == 0x1800 {
                    // add/sub with register or 3-bit immediate
                    let rd = (hw & 7) as usize;
                    let rs = ((hw >> 3) & 7) as usize;
                    let field = (hw >> 6) & 7;
                    let a = self.cpu.gpr(rs);
                    let b = if hw & 0x0400 != 0 {
                        field as u32
                    } else {
                        self.cpu.gpr(field as usize)
                    };
                    let result = if hw & 0x0200 != 0 {
                        let r = a.wrapping_sub(b);
                        self.cpu.set_flags_sub(a, b, r);
                        r
                    } else {
                        let r = a.wrapping_add(b);
                        self.cpu.set_flags_add(a, b, r);
                        r
                    };
                    self.cpu.set_gpr(rd, result);
                } else {
                    // shift by immediate
                    let rd = (hw & 7) as usize;
                    let rs = ((hw >> 3) & 7) as usize;
                    let imm = ((hw >> 6) & 0x1f) as u32;
                    let v = self.cpu.gpr(rs);
                    let result = match (hw >> 11) & 3 {
                        0 => v << imm,
                        // shift 0 encodes 32 for lsr/asr
                        1 => if imm == 0 { 0 } else { v >> imm },
                        _ => {
                            let s = if imm == 0 { 31 } else { imm };
                            ((v as i32) >> s) as u32
                        }
                    };
                    self.cpu.set_gpr(rd, result);
                    self.cpu.set_nz(result);
                }
                Ok(())
            }

            0x2 | 0x3 => {
                // mov/cmp/add/sub 8-bit immediate
                let rd = ((hw >> 8) & 7) as usize;
                let imm = (hw & 0xff) as u32;
                match (hw >> 11) & 3 {
                    0 => {
                        self.cpu.set_gpr(rd, imm);
                        self.cpu.set_nz(imm);
                    }
                    1 => {
                        let a = self.cpu.gpr(rd);
                        self.cpu.set_flags_sub(a, imm, a.wrapping_sub(imm));
                    }
                    2 => {
                        let a = self.cpu.gpr(rd);
                        let r = a.wrapping_add(imm);
                        self.cpu.set_flags_add(a, imm, r);
                        self.cpu.set_gpr(rd, r);
                    }
                    _ => {
                        let a = self.cpu.gpr(rd);
                        let r = a.wrapping_sub(imm);
                        self.cpu.set_flags_sub(a, imm, r);
                        self.cpu.set_gpr(rd, r);
                    }
                }
                Ok(())
            }

            0x4 => {
                if hw & 0x0C00 == 0 {
                    self.exec_alu(hw);
                    Ok(())
                } else if hw & 0x0800 != 0 {
                    // pc-relative literal load from the current block
                    let rd = ((hw >> 8) & 7) as usize;
                    let word_off = (hw & 0xff) as u32;
                    let base = (off + 4) & !3;
                    let byte = base + word_off * 4;
                    if byte + 4 > BLOCK_SIZE {
                        return Err(self.fault(FaultCode::CodeFetch));
                    }
                    let d = self.cache.block_data(slot);
                    let b = byte as usize;
                    let v = u32::from_le_bytes([d[b], d[b + 1], d[b + 2], d[b + 3]]);
                    self.cpu.set_gpr(rd, v);
                    Ok(())
                } else {
                    // hi-register operations are not part of the subset
                    Err(self.fault(FaultCode::ReservedInstr))
                }
            }

            0x9 => {
                // sp-relative load/store; SP is a trusted physical
                // address, the arena recheck guards the offset
                let rd = ((hw >> 8) & 7) as usize;
                let byte_off = ((hw & 0xff) as u32) * 4;
                let pa = self.cpu.sp().wrapping_add(byte_off);
                if hw & 0x0800 != 0 {
                    let v = self.mem.ram_read32(pa)
                        .ok_or(Stop::Fault(FaultCode::BadStack))?;
                    self.cpu.set_gpr(rd, v);
                } else {
                    let v = self.cpu.gpr(rd);
                    if !self.mem.ram_write32(pa, v) {
                        return Err(self.fault(FaultCode::BadStack));
                    }
                }
                Ok(())
            }

            0xB => {
                if hw & 0xFF00 == 0xB000 {
                    // add/sub sp, #imm7 words
                    let words = (hw & 0x7f) as i32;
                    let words = if hw & 0x80 != 0 { -words } else { words };
                    self.adjust_sp_words(words)
                } else if hw & 0xFF00 == (BKPT_OPCODE & 0xFF00) {
                    // leave PC on the breakpoint for the debugger
                    self.cpu.set_pc(pc);
                    Err(Stop::Breakpoint)
                } else if hw == NOP_OPCODE {
                    Ok(())
                } else {
                    Err(self.fault(FaultCode::ReservedInstr))
                }
            }

            0xD => {
                let cond = ((hw >> 8) & 0xf) as u32;
                match cond {
                    0xf => self.svc((hw & 0xff) as u8),
                    0xe => Err(self.fault(FaultCode::ReservedInstr)),
                    _ => {
                        if self.cpu.condition(cond) {
                            self.branch_relative(slot, off, sext8(hw & 0xff) * 2)
                        } else {
                            Ok(())
                        }
                    }
                }
            }

            0xE => {
                if hw & 0x0800 == 0 {
                    self.branch_relative(slot, off, sext11(hw) * 2)
                } else {
                    Err(self.fault(FaultCode::ReservedInstr))
                }
            }

            _ => Err(self.fault(FaultCode::ReservedInstr)),
        }
    }

    /// Branch relative to the current instruction (offset from pc+4,
    /// Thumb convention). Goes through full code validation like every
    /// other PC update.
    fn branch_relative(&mut self, slot: usize, off: u32, delta: i32) -> Result<(), Stop> {
        let block_va = match self.mem.flash_to_virt_addr(self.cache.block_addr(slot)) {
            Some(va) => va,
            None => return Err(self.fault(FaultCode::CodeFetch)),
        };
        let target = (block_va + off).wrapping_add(4).wrapping_add(delta as u32);
        self.branch(target)
    }

    fn exec_alu(&mut self, hw: u16) {
        let rd = (hw & 7) as usize;
        let rs = ((hw >> 3) & 7) as usize;
        let a = self.cpu.gpr(rd);
        let b = self.cpu.gpr(rs);
        let carry = self.cpu.cpsr() & crate::cpu::FLAG_C != 0;

        match (hw >> 6) & 0xf {
            0x0 => { let r = a & b; self.cpu.set_gpr(rd, r); self.cpu.set_nz(r); }
            0x1 => { let r = a ^ b; self.cpu.set_gpr(rd, r); self.cpu.set_nz(r); }
            0x2 => {
                let r = if b >= 32 { 0 } else { a << (b & 31) };
                self.cpu.set_gpr(rd, r);
                self.cpu.set_nz(r);
            }
            0x3 => {
                let r = if b >= 32 { 0 } else { a >> (b & 31) };
                self.cpu.set_gpr(rd, r);
                self.cpu.set_nz(r);
            }
            0x4 => {
                let r = if b >= 32 {
                    ((a as i32) >> 31) as u32
                } else {
                    ((a as i32) >> (b & 31)) as u32
                };
                self.cpu.set_gpr(rd, r);
                self.cpu.set_nz(r);
            }
            0x5 => {
                let c = carry as u32;
                let r = a.wrapping_add(b).wrapping_add(c);
                self.cpu.set_flags_add(a, b.wrapping_add(c), r);
                self.cpu.set_gpr(rd, r);
            }
            0x6 => {
                let c = !carry as u32;
                let r = a.wrapping_sub(b).wrapping_sub(c);
                self.cpu.set_flags_sub(a, b.wrapping_add(c), r);
                self.cpu.set_gpr(rd, r);
            }
            0x7 => {
                let r = a.rotate_right(b & 31);
                self.cpu.set_gpr(rd, r);
                self.cpu.set_nz(r);
            }
            0x8 => self.cpu.set_nz(a & b),
            0x9 => {
                let r = 0u32.wrapping_sub(b);
                self.cpu.set_flags_sub(0, b, r);
                self.cpu.set_gpr(rd, r);
            }
            0xa => self.cpu.set_flags_sub(a, b, a.wrapping_sub(b)),
            0xb => self.cpu.set_flags_add(a, b, a.wrapping_add(b)),
            0xc => { let r = a | b; self.cpu.set_gpr(rd, r); self.cpu.set_nz(r); }
            0xd => { let r = a.wrapping_mul(b); self.cpu.set_gpr(rd, r); self.cpu.set_nz(r); }
            0xe => { let r = a & !b; self.cpu.set_gpr(rd, r); self.cpu.set_nz(r); }
            _ => { let r = !b; self.cpu.set_gpr(rd, r); self.cpu.set_nz(r); }
        }
    }

    fn exec32(&mut self, hw1: u16, hw2: u16) -> Result<(), Stop> {
        // movw / movt
        if (hw1 & 0xFBF0) == 0xF240 || (hw1 & 0xFBF0) == 0xF2C0 {
            let rd = ((hw2 >> 8) & 0xf) as usize;
            if rd > 7 {
                return Err(self.fault(FaultCode::ReservedInstr));
            }
            let imm4 = (hw1 & 0xf) as u32;
            let i = ((hw1 >> 10) & 1) as u32;
            let imm3 = ((hw2 >> 12) & 7) as u32;
            let imm8 = (hw2 & 0xff) as u32;
            let imm16 = (imm4 << 12) | (i << 11) | (imm3 << 8) | imm8;
            if (hw1 & 0xFBF0) == 0xF240 {
                self.cpu.set_gpr(rd, imm16);
            } else {
                let low = self.cpu.gpr(rd) & 0xffff;
                self.cpu.set_gpr(rd, (imm16 << 16) | low);
            }
            return Ok(());
        }

        // ldr.w rd, [r8/r9, #imm12]
        if hw1 == 0xF8D8 || hw1 == 0xF8D9 {
            let rn = (hw1 & 0xf) as usize;
            let rd = ((hw2 >> 12) & 0xf) as usize;
            if rd > 7 {
                return Err(self.fault(FaultCode::ReservedInstr));
            }
            let imm12 = (hw2 & 0xfff) as u32;
            let base = self.cpu.reg(if rn == 8 { REG_BP_RO } else { REG_BP_RW });
            let v = self.load_via_base(base, imm12)?;
            self.cpu.set_gpr(rd, v);
            return Ok(());
        }

        // str.w rd, [r9, #imm12]
        if hw1 == 0xF8C9 {
            let rd = ((hw2 >> 12) & 0xf) as usize;
            if rd > 7 {
                return Err(self.fault(FaultCode::ReservedInstr));
            }
            let imm12 = (hw2 & 0xfff) as u32;
            let base = self.cpu.reg(REG_BP_RW);
            if base == 0 {
                return Err(self.fault(FaultCode::StoreAddress));
            }
            let pa = base.wrapping_add(imm12);
            if pa & 3 != 0 {
                return Err(self.fault(FaultCode::StoreAlignment));
            }
            let v = self.cpu.gpr(rd);
            if !self.mem.ram_write32(pa, v) {
                return Err(self.fault(FaultCode::StoreAddress));
            }
            return Ok(());
        }

        Err(self.fault(FaultCode::ReservedInstr))
    }

    /// Load a word through a validated base pointer. The base was
    /// produced by `validate`; only the arena bounds are rechecked.
    fn load_via_base(&mut self, base: u32, offset: u32) -> Result<u32, Stop> {
        if base == 0 {
            return Err(self.fault(FaultCode::LoadAddress));
        }
        let pa = base.wrapping_add(offset);
        if pa & 3 != 0 {
            return Err(self.fault(FaultCode::LoadAlignment));
        }
        if memory::pa_is_flash(pa) {
            let (slot, boff) = memory::pa_flash_parts(pa);
            // the base pointer must still be backed by the held
            // data-block reference
            if self.data_ref.slot() != Some(slot) || boff + 4 > BLOCK_SIZE {
                return Err(self.fault(FaultCode::LoadAddress));
            }
            let d = self.cache.block_data(slot);
            let b = boff as usize;
            Ok(u32::from_le_bytes([d[b], d[b + 1], d[b + 2], d[b + 3]]))
        } else {
            self.mem.ram_read32(pa).ok_or(Stop::Fault(FaultCode::LoadAddress))
        }
    }

    /// Read RAM by physical address for display purposes.
    pub fn ram_word(&self, pa: u32) -> u32 {
        self.mem.ram_read32(pa).unwrap_or(0)
    }
}
