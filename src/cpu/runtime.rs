//! Runtime dispatcher
//!
//! Decodes and executes the supervisor-call stream: memory validation,
//! function call/return, syscalls, indirect branches, long stack
//! offsets, and breakpoints. Owns the VM-wide execution state (CPU,
//! mapper, flash cache, current code/data block references, stack
//! limit) so there is exactly one instance per virtual machine and no
//! global state.

use crate::cpu::{Cpu, REG_BP_RO, REG_BP_RW};
use crate::cpu::fault::{FaultCode, Stop};
use crate::cpu::instr::{
    self, IndirectOp, SvcOp,
    ADDROP_ADJUST_SP, ADDROP_BRANCH, ADDROP_LONG_LOAD, ADDROP_LONG_STORE,
    ADDROP_PRELOAD, ADDROP_VALIDATE,
};
use crate::flash::{BlockCache, BlockRef, FlashDevice, BLOCK_SIZE};
use crate::memory::{self, Memory, PA_RAM_BASE, RAM_SIZE};
use crate::tasks::{Tasks, TASK_HEARTBEAT};

/// Call frame pushed by `call`: {pc, fp, r2..r7}. The layout is
/// compiler-visible ABI and never changes.
pub const FRAME_WORDS: u32 = 8;
pub const FRAME_BYTES: u32 = FRAME_WORDS * 4;

pub const NUM_EVENTS: usize = 8;

/// Ticks a queued paint takes before the peripheral acknowledges it
const PAINT_LATENCY: u32 = 4;

/// How a return unwinds. Tail syscalls split the return in two: the
/// branch happens before the syscall body (so a debugger entered
/// mid-syscall reports the correct PC), the register restore and frame
/// pop after it (so the syscall still sees the caller's argument
/// registers).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetIntent {
    /// Branch to the caller's return address, nothing else
    BranchOnly,
    /// Restore r2-r7, validate and pop the frame; exit when in main
    RestoreAndPop,
    /// The complete return: branch, restore, pop, exit when in main
    FullUnwind,
}

/// Guest-visible event delivery. Dispatch is strictly deferred until
/// after syscall return values are committed to registers.
pub struct Events {
    pub pending: u32,
    handlers: [u32; NUM_EVENTS],
    /// FP of the frame created for the in-flight handler, 0 when idle
    frame: u32,
    want_dispatch: bool,
}

impl Events {
    fn new() -> Self {
        Events {
            pending: 0,
            handlers: [0; NUM_EVENTS],
            frame: 0,
            want_dispatch: false,
        }
    }

    pub fn set_handler(&mut self, id: usize, call_literal: u32) {
        self.handlers[id] = call_literal;
    }

    pub fn post(&mut self, id: usize) {
        debug_assert!(id < NUM_EVENTS);
        self.pending |= 1 << id;
    }

    pub fn request_dispatch(&mut self) {
        self.want_dispatch = true;
    }
}

/// Display peripheral model: paints queue and acknowledge a few ticks
/// later.
struct Paint {
    queued: u32,
    countdown: u32,
}

impl Paint {
    fn tick(&mut self) {
        if self.queued == 0 {
            return;
        }
        if self.countdown == 0 {
            self.countdown = PAINT_LATENCY;
        }
        self.countdown -= 1;
        if self.countdown == 0 {
            self.queued -= 1;
        }
    }
}

/// The virtual machine core.
pub struct Runtime {
    pub cpu: Cpu,
    pub mem: Memory,
    pub cache: BlockCache,
    pub(crate) code_ref: BlockRef,
    pub(crate) data_ref: BlockRef,
    /// Lowest legal SP value (physical)
    pub(crate) stack_limit: u32,
    pub(crate) top_of_stack: u32,
    pub tasks: Tasks,
    pub events: Events,
    pub uptime: u64,
    /// Volume id of the running program
    pub volume: u32,
    /// Connected-peripheral bitmap, reported by syscall and captured
    /// in fault records
    pub cubes_connected: u32,
    paint: Paint,
    rng_state: u32,
    /// Set when the fault logger has quarantined the running code;
    /// execution may not resume past it
    abort_trap: bool,
}

impl Runtime {
    pub fn new(device: Box<dyn FlashDevice>) -> Self {
        let cache = BlockCache::new(device);
        let code_ref = cache.new_ref();
        let data_ref = cache.new_ref();
        Runtime {
            cpu: Cpu::new(),
            mem: Memory::new(),
            cache,
            code_ref,
            data_ref,
            stack_limit: PA_RAM_BASE,
            top_of_stack: PA_RAM_BASE + RAM_SIZE,
            tasks: Tasks::new(),
            events: Events::new(),
            uptime: 0,
            volume: 0,
            cubes_connected: 0,
            paint: Paint { queued: 0, countdown: 0 },
            rng_state: 0x2545_f491,
            abort_trap: false,
        }
    }

    /// Reserve `stack_bytes` at the top of RAM for the guest stack.
    pub fn set_stack(&mut self, stack_bytes: u32) {
        self.top_of_stack = PA_RAM_BASE + RAM_SIZE;
        self.stack_limit = self.top_of_stack - stack_bytes.min(RAM_SIZE);
    }

    /// Enter the program at its entry vector (a call-format literal).
    /// Main runs with no caller frame: FP stays zero and a return from
    /// it exits the program.
    pub fn launch(&mut self, entry_lit: u32) -> Result<(), Stop> {
        self.cpu.reset();
        self.cpu.set_sp(self.top_of_stack);
        self.cpu.set_fp(0);
        match instr::decode_literal(entry_lit) {
            IndirectOp::Call { target, frame_words } => {
                self.enter_function(target, frame_words)
            }
            _ => Err(Stop::Fault(FaultCode::BadCodeAddress)),
        }
    }

    #[inline(always)]
    pub(crate) fn fault(&self, code: FaultCode) -> Stop {
        Stop::Fault(code)
    }

    pub fn abort_trap_set(&self) -> bool {
        self.abort_trap
    }

    /// Quarantine: no further guest instruction may execute. Used by
    /// the fault logger before it snapshots the faulting code page.
    pub fn set_abort_trap(&mut self) {
        self.abort_trap = true;
        self.cache.invalidate();
    }

    // --- supervisor calls ---

    /// Execute an SVC by its 8-bit immediate. PC has already advanced
    /// past the SVC instruction, so it is the return address.
    pub fn svc(&mut self, imm8: u8) -> Result<(), Stop> {
        match instr::decode_svc(imm8) {
            SvcOp::Ret => self.ret(RetIntent::FullUnwind),
            SvcOp::Indirect(idx) => self.svc_indirect(idx),
            SvcOp::Syscall(num) => self.syscall(num as u16),
            SvcOp::AdjustSp(words) => self.adjust_sp_words(words),
            SvcOp::Validate(r) => {
                let va = self.cpu.gpr(r as usize);
                self.validate(va)
            }
            SvcOp::CallReg(r) => {
                let lit = self.cpu.gpr(r as usize);
                match instr::decode_literal(lit) {
                    IndirectOp::Call { target, frame_words } => {
                        self.call(target, frame_words)
                    }
                    _ => Err(self.fault(FaultCode::ReservedSvc)),
                }
            }
            SvcOp::TailCallReg(r) => {
                let lit = self.cpu.gpr(r as usize);
                match instr::decode_literal(lit) {
                    IndirectOp::Call { target, frame_words } => {
                        self.tailcall(target, frame_words)
                    }
                    _ => Err(self.fault(FaultCode::ReservedSvc)),
                }
            }
            SvcOp::Breakpoint => Err(Stop::Breakpoint),
            SvcOp::Reserved => Err(self.fault(FaultCode::ReservedSvc)),
        }
    }

    /// Fetch a 32-bit literal from the current code block and execute
    /// the operation it encodes. Literals never cross a block, by
    /// compiler contract.
    fn svc_indirect(&mut self, word_idx: u8) -> Result<(), Stop> {
        let slot = self.code_ref.slot()
            .ok_or_else(|| self.fault(FaultCode::CodeFetch))?;
        let off = (word_idx as u32) * 4;
        if off + 4 > BLOCK_SIZE {
            return Err(self.fault(FaultCode::CodeFetch));
        }
        let data = self.cache.block_data(slot);
        let o = off as usize;
        let lit = u32::from_le_bytes([data[o], data[o + 1], data[o + 2], data[o + 3]]);

        match instr::decode_literal(lit) {
            IndirectOp::Call { target, frame_words } => self.call(target, frame_words),
            IndirectOp::TailCall { target, frame_words } => self.tailcall(target, frame_words),
            IndirectOp::Syscall(num) => self.syscall(num),
            IndirectOp::TailSyscall(num) => self.tail_syscall(num),
            IndirectOp::Addrop { op, addr } => self.addrop(op, addr),
            IndirectOp::Reserved => Err(self.fault(FaultCode::ReservedSvc)),
        }
    }

    fn addrop(&mut self, op: u8, addr: u32) -> Result<(), Stop> {
        match op {
            ADDROP_BRANCH => self.branch(addr),
            ADDROP_PRELOAD => {
                // warm the cache; a bad hint is still a fault
                let mut r = self.cache.new_ref();
                match self.mem.map_rodata(&mut self.cache, &mut r, addr, 1) {
                    Some(_) => Ok(()),
                    None => Err(self.fault(FaultCode::PreloadAddress)),
                }
            }
            ADDROP_VALIDATE => self.validate(addr),
            ADDROP_ADJUST_SP => {
                // large frame allocation, byte count in the operand
                let sp = self.cpu.sp();
                let new_sp = sp.checked_sub(addr)
                    .ok_or_else(|| self.fault(FaultCode::StackOverflow))?;
                if new_sp < self.stack_limit {
                    return Err(self.fault(FaultCode::StackOverflow));
                }
                self.cpu.set_sp(new_sp);
                Ok(())
            }
            ADDROP_LONG_STORE => {
                let pa = self.cpu.sp().wrapping_add(addr);
                if pa & 3 != 0 {
                    return Err(self.fault(FaultCode::LongStackStore));
                }
                let value = self.cpu.gpr(0);
                if !self.mem.ram_write32(pa, value) {
                    return Err(self.fault(FaultCode::LongStackStore));
                }
                Ok(())
            }
            ADDROP_LONG_LOAD => {
                let pa = self.cpu.sp().wrapping_add(addr);
                if pa & 3 != 0 {
                    return Err(self.fault(FaultCode::LongStackLoad));
                }
                let value = self.mem.ram_read32(pa)
                    .ok_or_else(|| self.fault(FaultCode::LongStackLoad))?;
                self.cpu.set_gpr(0, value);
                Ok(())
            }
            _ => Err(self.fault(FaultCode::ReservedAddrop)),
        }
    }

    // --- control flow ---

    /// The only way PC changes to a non-sequential address. The target
    /// must map as validated code.
    pub fn branch(&mut self, va: u32) -> Result<(), Stop> {
        if va & 1 != 0 {
            return Err(self.fault(FaultCode::CodeAlignment));
        }
        match self.mem.map_rocode(&mut self.cache, &mut self.code_ref, va) {
            Some(pa) => {
                self.cpu.set_pc(pa);
                Ok(())
            }
            None => Err(self.fault(FaultCode::BadCodeAddress)),
        }
    }

    /// Rebuild the virtual address of a physical PC. Frames must store
    /// virtual code addresses so they stay meaningful across cache
    /// recycling.
    pub fn reconstruct_code_addr(&self, pa: u32) -> u32 {
        if !memory::pa_is_flash(pa) {
            return 0;
        }
        let (slot, off) = memory::pa_flash_parts(pa);
        let fa = self.cache.block_addr(slot) + off;
        self.mem.flash_to_virt_addr(fa).unwrap_or(0)
    }

    /// Current PC as a virtual code address.
    pub fn pc_virt(&self) -> u32 {
        self.reconstruct_code_addr(self.cpu.pc())
    }

    /// Allocate an 8-word call frame, link it, and enter the callee.
    pub(crate) fn call(&mut self, target: u32, frame_words: u32) -> Result<(), Stop> {
        let return_va = self.pc_virt();
        let fp = self.cpu.fp();
        let fp_virt = if fp == 0 {
            0
        } else {
            // squash the trusted physical FP back to a virtual value
            self.mem.phys_to_virt_ram(fp).unwrap_or(0)
        };

        let frame = self.alloc_stack(FRAME_BYTES)?;
        let words = [
            return_va,
            fp_virt,
            self.cpu.gpr(2),
            self.cpu.gpr(3),
            self.cpu.gpr(4),
            self.cpu.gpr(5),
            self.cpu.gpr(6),
            self.cpu.gpr(7),
        ];
        for (i, &w) in words.iter().enumerate() {
            if !self.mem.ram_write32(frame + 4 * i as u32, w) {
                return Err(self.fault(FaultCode::BadStack));
            }
        }
        self.cpu.set_fp(frame);
        self.enter_function(target, frame_words)
    }

    /// Like `call` but reuses the caller's frame slot: SP rewinds to
    /// the current frame (or the top of stack when tailcalling from
    /// main) and no new frame is pushed.
    pub(crate) fn tailcall(&mut self, target: u32, frame_words: u32) -> Result<(), Stop> {
        let fp = self.cpu.fp();
        let sp = if fp != 0 { fp } else { self.top_of_stack };
        self.cpu.set_sp(sp);
        self.enter_function(target, frame_words)
    }

    /// Allocate the callee's statically-declared stack frame and
    /// branch to its first instruction.
    fn enter_function(&mut self, target: u32, frame_words: u32) -> Result<(), Stop> {
        self.alloc_stack(frame_words * 4)?;
        self.branch(target)
    }

    fn alloc_stack(&mut self, bytes: u32) -> Result<u32, Stop> {
        let sp = self.cpu.sp();
        let new_sp = sp.checked_sub(bytes)
            .ok_or_else(|| self.fault(FaultCode::StackOverflow))?;
        if new_sp < self.stack_limit {
            return Err(self.fault(FaultCode::StackOverflow));
        }
        if new_sp > self.top_of_stack {
            return Err(self.fault(FaultCode::BadStack));
        }
        self.cpu.set_sp(new_sp);
        Ok(new_sp)
    }

    /// Small SP adjustment in word units; positive deallocates.
    pub(crate) fn adjust_sp_words(&mut self, words: i32) -> Result<(), Stop> {
        let sp = self.cpu.sp();
        let new_sp = sp.wrapping_add((words * 4) as u32);
        if new_sp < self.stack_limit {
            return Err(self.fault(FaultCode::StackOverflow));
        }
        if new_sp > self.top_of_stack {
            return Err(self.fault(FaultCode::BadStack));
        }
        self.cpu.set_sp(new_sp);
        Ok(())
    }

    /// Return state machine. The saved FP is untrusted (it was read
    /// back from guest-writable memory) and is re-validated before it
    /// reaches the trusted FP register.
    pub fn ret(&mut self, intent: RetIntent) -> Result<(), Stop> {
        let fp = self.cpu.fp();
        if fp == 0 {
            // no caller frame: we are in main
            return match intent {
                RetIntent::BranchOnly => Ok(()),
                _ => Err(Stop::Exit),
            };
        }

        let read_word = |mem: &Memory, i: u32| {
            mem.ram_read32(fp + 4 * i).ok_or(Stop::Fault(FaultCode::BadStack))
        };

        if intent != RetIntent::RestoreAndPop {
            let return_va = read_word(&self.mem, 0)?;
            self.branch(return_va)?;
        }

        if intent != RetIntent::BranchOnly {
            for r in 2..8 {
                let v = read_word(&self.mem, r as u32)?;
                self.cpu.set_gpr(r, v);
            }
            let saved_fp = read_word(&self.mem, 1)?;
            let new_fp = if saved_fp == 0 {
                0
            } else {
                self.mem.map_ram(saved_fp, FRAME_BYTES)
                    .ok_or(Stop::Fault(FaultCode::ReturnFrame))?
            };
            self.cpu.set_sp(fp + FRAME_BYTES);
            self.cpu.set_fp(new_fp);

            // leaving the event-dispatch frame: look for more work
            if self.events.frame == fp {
                self.events.frame = 0;
                self.dispatch_pending_event()?;
            }
        }
        Ok(())
    }

    /// Recompute the base-pointer registers from a guest address. This
    /// is the only place r8/r9 are written; load/store instructions
    /// trust them without re-validating per access.
    pub(crate) fn validate(&mut self, va: u32) -> Result<(), Stop> {
        let rw = self.mem.map_ram(va, 1).unwrap_or(0);
        let ro = match self.mem.map_rodata(&mut self.cache, &mut self.data_ref, va, 1) {
            Some((pa, _)) => pa,
            None => return Err(self.fault(FaultCode::LoadAddress)),
        };
        self.cpu.set_reg(REG_BP_RO, ro);
        self.cpu.set_reg(REG_BP_RW, rw);
        Ok(())
    }

    /// Re-derive the base pointers from a virtual address after a
    /// snapshot restore.
    pub fn restore_validate(&mut self, va: u32) -> Result<(), Stop> {
        self.validate(va)
    }

    // --- syscalls ---

    fn syscall(&mut self, num: u16) -> Result<(), Stop> {
        let handler = crate::syscall::lookup(num)
            .ok_or_else(|| self.fault(FaultCode::BadSyscall))?;
        let args = self.syscall_args();
        let result = handler(self, args)?;
        self.cpu.set_gpr(0, result as u32);
        self.cpu.set_gpr(1, (result >> 32) as u32);
        self.post_syscall_work()
    }

    /// Tail syscall: branch to the return address first, run the body
    /// against the caller's argument registers, then restore and pop.
    fn tail_syscall(&mut self, num: u16) -> Result<(), Stop> {
        let handler = crate::syscall::lookup(num)
            .ok_or_else(|| self.fault(FaultCode::BadSyscall))?;
        self.ret(RetIntent::BranchOnly)?;
        let args = self.syscall_args();
        let result = handler(self, args)?;
        self.cpu.set_gpr(0, result as u32);
        self.cpu.set_gpr(1, (result >> 32) as u32);
        self.ret(RetIntent::RestoreAndPop)?;
        self.post_syscall_work()
    }

    fn syscall_args(&self) -> [u32; 8] {
        [
            self.cpu.gpr(0),
            self.cpu.gpr(1),
            self.cpu.gpr(2),
            self.cpu.gpr(3),
            self.cpu.gpr(4),
            self.cpu.gpr(5),
            self.cpu.gpr(6),
            self.cpu.gpr(7),
        ]
    }

    /// Deferred work after a syscall: low-priority task polling, then
    /// event dispatch. Runs only after the syscall's return values are
    /// already committed, so handlers never observe a half-written
    /// result.
    fn post_syscall_work(&mut self) -> Result<(), Stop> {
        if self.tasks.is_pending(TASK_HEARTBEAT) {
            self.tasks.clear(TASK_HEARTBEAT);
            self.tick();
        }
        if self.events.want_dispatch {
            self.events.want_dispatch = false;
            self.dispatch_pending_event()?;
        }
        Ok(())
    }

    /// Deliver the lowest-numbered pending event to its registered
    /// handler, unless a handler is already on the stack.
    pub fn dispatch_pending_event(&mut self) -> Result<(), Stop> {
        if self.events.frame != 0 {
            return Ok(());
        }
        while self.events.pending != 0 {
            let id = self.events.pending.trailing_zeros() as usize;
            self.events.pending &= !(1 << id);
            let lit = self.events.handlers[id];
            if lit == 0 {
                continue;
            }
            if let IndirectOp::Call { target, frame_words } = instr::decode_literal(lit) {
                self.call(target, frame_words)?;
                self.events.frame = self.cpu.fp();
                return Ok(());
            }
        }
        Ok(())
    }

    // --- cooperative time ---

    /// One housekeeping tick: uptime and peripheral progress.
    pub fn tick(&mut self) {
        self.uptime += 1;
        self.paint.tick();
    }

    pub fn queue_paint(&mut self) {
        self.paint.queued += 1;
    }

    pub fn paint_queued(&self) -> u32 {
        self.paint.queued
    }

    pub fn next_random(&mut self) -> u32 {
        // xorshift32; deterministic across runs
        let mut x = self.rng_state;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.rng_state = x;
        x
    }

    // --- debugger access ---

    pub fn read_ram_virt(&self, va: u32, len: u32) -> Option<Vec<u8>> {
        let pa = self.mem.map_ram(va, len)?;
        let off = (pa - PA_RAM_BASE) as usize;
        Some(self.mem.ram_slice()[off..off + len as usize].to_vec())
    }

    pub fn write_ram_virt(&mut self, va: u32, data: &[u8]) -> bool {
        match self.mem.map_ram(va, data.len() as u32) {
            Some(pa) => {
                let off = (pa - PA_RAM_BASE) as usize;
                self.mem.ram_slice_mut()[off..off + data.len()].copy_from_slice(data);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::instr::emit;
    use crate::flash::MemFlash;
    use crate::memory::FLASH_BASE;

    /// Assemble halfwords and literals into one 256-byte block image.
    fn block(code: &[u16], lits: &[(u8, u32)]) -> Vec<u8> {
        let mut data = vec![0u8; BLOCK_SIZE as usize];
        for (i, hw) in code.iter().enumerate() {
            data[i * 2..i * 2 + 2].copy_from_slice(&hw.to_le_bytes());
        }
        for &(word_idx, lit) in lits {
            let o = word_idx as usize * 4;
            data[o..o + 4].copy_from_slice(&lit.to_le_bytes());
        }
        data
    }

    fn build_runtime(blocks: &[(u32, Vec<u8>)], ro_size: u32) -> Runtime {
        let mut dev = MemFlash::new(0x10000);
        for (addr, bytes) in blocks {
            dev.fill(*addr, bytes);
        }
        let mut rt = Runtime::new(Box::new(dev));
        rt.mem.set_flash_window(0, ro_size);
        rt.set_stack(0x1000);
        rt
    }

    fn run_to_stop(rt: &mut Runtime) -> Stop {
        for _ in 0..10_000 {
            if let Err(stop) = rt.step() {
                return stop;
            }
        }
        panic!("program did not stop");
    }

    #[test]
    fn test_call_ret_round_trip() {
        // main at 0x00: set r2..r7, call func at block 1, then bkpt.
        // func: plain ret.
        let main = block(
            &[
                emit::mov_imm(2, 12),
                emit::mov_imm(3, 13),
                emit::mov_imm(4, 14),
                emit::mov_imm(5, 15),
                emit::mov_imm(6, 16),
                emit::mov_imm(7, 17),
                emit::svc(0x30), // literal at word 0x30: call
                0xBE00,          // bkpt: stop so we can inspect state
            ],
            &[(0x30, emit::call_literal(0x100, 2))],
        );
        let func = block(
            &[
                emit::mov_imm(2, 99), // clobber callee-saved, must be restored
                emit::svc(0),
            ],
            &[],
        );
        let mut rt = build_runtime(&[(0, main), (0x100, func)], 0x200);
        rt.launch(emit::call_literal(0, 1)).unwrap();

        let sp_before = rt.cpu.sp();
        let stop = run_to_stop(&mut rt);
        assert_eq!(stop, Stop::Breakpoint);

        // SP, FP and r2-r7 restored; PC is the instruction after the call
        assert_eq!(rt.cpu.sp(), sp_before);
        assert_eq!(rt.cpu.fp(), 0);
        for (r, v) in (2..8).zip([12, 13, 14, 15, 16, 17]) {
            assert_eq!(rt.cpu.gpr(r), v);
        }
        assert_eq!(rt.pc_virt(), FLASH_BASE + 7 * 2);
    }

    #[test]
    fn test_nested_call_depth_scenario() {
        // three nested calls, each frame 4 words, then returns all the
        // way out; SP must come back to the exact launch value
        let f0 = block(
            &[emit::svc(0x30), 0xBE00],
            &[(0x30, emit::call_literal(0x100, 4))],
        );
        let f1 = block(
            &[emit::svc(0x30), emit::svc(0)],
            &[(0x30, emit::call_literal(0x200, 4))],
        );
        let f2 = block(
            &[emit::svc(0x30), emit::svc(0)],
            &[(0x30, emit::call_literal(0x300, 4))],
        );
        let f3 = block(&[emit::svc(0)], &[]);

        let mut rt = build_runtime(
            &[(0, f0), (0x100, f1), (0x200, f2), (0x300, f3)],
            0x400,
        );
        rt.launch(emit::call_literal(0, 1)).unwrap();
        let sp0 = rt.cpu.sp();

        // step until the first call has gone down a level
        rt.step().unwrap();
        assert_eq!(rt.cpu.sp(), sp0 - FRAME_BYTES - 16);

        assert_eq!(run_to_stop(&mut rt), Stop::Breakpoint);
        assert_eq!(rt.cpu.sp(), sp0);
        assert_eq!(rt.cpu.fp(), 0);
    }

    #[test]
    fn test_tailcall_stack_neutrality() {
        // main calls f1; f1 tailcalls f2; f2 returns straight to main.
        // Net stack depth after the sequence equals the depth before
        // the original call.
        let main = block(
            &[emit::svc(0x30), 0xBE00],
            &[(0x30, emit::call_literal(0x100, 2))],
        );
        let f1 = block(
            &[emit::svc(0x30)],
            &[(0x30, emit::tailcall_literal(0x200, 6))],
        );
        let f2 = block(&[emit::svc(0)], &[]);

        let mut rt = build_runtime(&[(0, main), (0x100, f1), (0x200, f2)], 0x300);
        rt.launch(emit::call_literal(0, 1)).unwrap();
        let sp0 = rt.cpu.sp();

        assert_eq!(run_to_stop(&mut rt), Stop::Breakpoint);
        assert_eq!(rt.cpu.sp(), sp0);
        assert_eq!(rt.pc_virt(), FLASH_BASE + 2);
    }

    #[test]
    fn test_bad_syscall_faults_with_pc_held() {
        let main = block(
            &[
                emit::svc(0x30), // indirect syscall with an unassigned number
            ],
            &[(0x30, emit::syscall_literal(0x3f3))],
        );
        let mut rt = build_runtime(&[(0, main)], 0x100);
        rt.launch(emit::call_literal(0, 1)).unwrap();

        let stop = run_to_stop(&mut rt);
        assert_eq!(stop, Stop::Fault(FaultCode::BadSyscall));
        // PC sits just past the SVC, unchanged by the failed dispatch
        assert_eq!(rt.pc_virt(), FLASH_BASE + 2);
    }

    #[test]
    fn test_validate_sets_base_pointers() {
        let main = block(
            &[emit::svc(0xe0), 0xBE00], // validate r0
            &[],
        );
        let mut rt = build_runtime(&[(0, main)], 0x100);
        rt.launch(emit::call_literal(0, 1)).unwrap();
        rt.cpu.set_gpr(0, 0x10040); // RAM address

        assert_eq!(run_to_stop(&mut rt), Stop::Breakpoint);
        assert_eq!(rt.cpu.reg(REG_BP_RO), PA_RAM_BASE + 0x40);
        assert_eq!(rt.cpu.reg(REG_BP_RW), PA_RAM_BASE + 0x40);
    }

    #[test]
    fn test_validate_flash_is_read_only() {
        let main = block(
            &[emit::svc(0xe0), 0xBE00],
            &[],
        );
        let mut rt = build_runtime(&[(0, main)], 0x100);
        rt.launch(emit::call_literal(0, 1)).unwrap();
        rt.cpu.set_gpr(0, FLASH_BASE + 0x20);

        assert_eq!(run_to_stop(&mut rt), Stop::Breakpoint);
        assert!(memory::pa_is_flash(rt.cpu.reg(REG_BP_RO)));
        assert_eq!(rt.cpu.reg(REG_BP_RW), 0);
    }

    #[test]
    fn test_stack_overflow_on_deep_recursion() {
        // function calls itself forever; the stack limit must stop it
        let f = block(
            &[emit::svc(0x30)],
            &[(0x30, emit::call_literal(0, 8))],
        );
        let mut rt = build_runtime(&[(0, f)], 0x100);
        rt.launch(emit::call_literal(0, 8)).unwrap();

        assert_eq!(run_to_stop(&mut rt), Stop::Fault(FaultCode::StackOverflow));
    }

    #[test]
    fn test_corrupt_saved_fp_faults_on_return() {
        // func scribbles on its own frame's saved-FP slot before
        // returning; the runtime must reject the bogus frame pointer
        let main = block(
            &[emit::svc(0x30), 0xBE00],
            &[(0x30, emit::call_literal(0x100, 0))],
        );
        let func = block(
            &[
                // overwrite saved fp (frame word 1) via sp: frame base
                // is FP and SP == FP here (no locals)
                emit::mov_imm(0, 0xEE),
                emit::str_sp(0, 1),
                emit::svc(0),
            ],
            &[],
        );
        let mut rt = build_runtime(&[(0, main), (0x100, func)], 0x200);
        rt.launch(emit::call_literal(0, 1)).unwrap();
        // make main's FP nonzero by nesting once more: simplest is to
        // pre-set FP to a valid frame? Instead: saved fp is 0 in this
        // frame (called from main), so overwrite makes it 0xEE != 0
        // and validation must fail.
        assert_eq!(run_to_stop(&mut rt), Stop::Fault(FaultCode::ReturnFrame));
    }

    #[test]
    fn test_adjust_sp_svc() {
        let main = block(
            &[
                emit::svc(0xc0 | 0x1e), // -2 words: allocate 8 bytes
                emit::svc(0xc2),        // +2 words: deallocate
                0xBE00,
            ],
            &[],
        );
        let mut rt = build_runtime(&[(0, main)], 0x100);
        rt.launch(emit::call_literal(0, 1)).unwrap();
        let sp0 = rt.cpu.sp();

        rt.step().unwrap();
        assert_eq!(rt.cpu.sp(), sp0 - 8);
        rt.step().unwrap();
        assert_eq!(rt.cpu.sp(), sp0);
    }

    #[test]
    fn test_long_stack_ops() {
        let main = block(
            &[
                emit::mov_imm(0, 0x5A),
                emit::svc(0x30), // long store r0 -> sp+0x40
                emit::mov_imm(0, 0),
                emit::svc(0x31), // long load r0 <- sp+0x40
                0xBE00,
            ],
            &[
                (0x30, emit::addrop_literal(ADDROP_LONG_STORE, 0x40)),
                (0x31, emit::addrop_literal(ADDROP_LONG_LOAD, 0x40)),
            ],
        );
        let mut rt = build_runtime(&[(0, main)], 0x100);
        // frame large enough that sp+0x40 stays inside it
        rt.launch(emit::call_literal(0, 32)).unwrap();

        assert_eq!(run_to_stop(&mut rt), Stop::Breakpoint);
        assert_eq!(rt.cpu.gpr(0), 0x5A);
    }

    #[test]
    fn test_long_stack_store_out_of_range() {
        let main = block(
            &[emit::svc(0x30)],
            &[(0x30, emit::addrop_literal(ADDROP_LONG_STORE, 0x0300_0000))],
        );
        let mut rt = build_runtime(&[(0, main)], 0x100);
        rt.launch(emit::call_literal(0, 1)).unwrap();
        assert_eq!(run_to_stop(&mut rt), Stop::Fault(FaultCode::LongStackStore));
    }

    #[test]
    fn test_branch_rejects_unvalidated_target() {
        // branching into erased flash past the code extent
        let mut data = vec![0xffu8; BLOCK_SIZE as usize];
        data[0..2].copy_from_slice(&emit::svc(0x30).to_le_bytes());
        let lit = emit::addrop_flash_literal(ADDROP_BRANCH, 0x40);
        data[0xC0..0xC4].copy_from_slice(&lit.to_le_bytes());

        let mut rt = build_runtime(&[(0, data)], 0x100);
        rt.launch(emit::call_literal(0, 1)).unwrap();
        let stop = run_to_stop(&mut rt);
        assert_eq!(stop, Stop::Fault(FaultCode::BadCodeAddress));
    }

    #[test]
    fn test_event_dispatch_deferred_to_post_syscall() {
        // handler at 0x100 writes r0 and returns; r0 is caller-saved,
        // so the value survives the frame pop. Main posts the event
        // and yields; the yield syscall requests dispatch, which runs
        // only after the syscall's return value is committed.
        let main = block(
            &[
                emit::svc(0x80 | crate::syscall::SYS_YIELD as u8),
                0xBE00,
            ],
            &[],
        );
        let handler = block(&[emit::mov_imm(0, 42), emit::svc(0)], &[]);
        let mut rt = build_runtime(&[(0, main), (0x100, handler)], 0x200);
        rt.launch(emit::call_literal(0, 1)).unwrap();
        rt.events.set_handler(2, emit::call_literal(0x100, 0));
        rt.events.post(2);

        assert_eq!(run_to_stop(&mut rt), Stop::Breakpoint);
        assert_eq!(rt.cpu.gpr(0), 42);
        assert_eq!(rt.events.pending, 0);
        assert_eq!(rt.events.frame, 0);
    }
}
