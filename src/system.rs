//! System orchestrator
//!
//! Wires the runtime core to the debugger stub and the fault logger,
//! owns the run loop, and routes unhandled stops: an attached debugger
//! gets first refusal on every fault, then the fault-logging hook,
//! and only if both are unavailable does the last-resort panic
//! display run.

use crate::console_log;
use crate::cpu::fault::{FaultCode, Stop};
use crate::cpu::runtime::Runtime;
use crate::debug::Debugger;
use crate::faultlog::{FaultLogStore, FaultLogger, FaultRecord, MemLogStore};
use crate::flash::{FlashDevice, MemFlash};
use crate::program::{Metadata, Program};
use crate::snapshot::Snapshot;
use crate::tasks::{Deadline, TASK_DEBUGGER, TASK_FAULT_LOGGER, TASK_HEARTBEAT};

/// Housekeeping cadence in executed instructions
const TICK_BATCH: u32 = 64;

/// Ticks the panic path spends draining the peripheral before the
/// display is painted regardless
const PANIC_DRAIN: u32 = 256;

struct Installed {
    entry: u32,
    rw_data: Vec<u8>,
    bss_size: u32,
    stack_size: u32,
    meta: Metadata,
}

/// One virtual machine with its debug and forensic attachments.
pub struct System {
    pub rt: Runtime,
    pub debugger: Debugger,
    /// The platform fault hook; absent in minimal configurations
    faultlog: Option<FaultLogger>,
    installed: Option<Installed>,
    halted: bool,
    /// Times the last-resort panic display has painted
    pub panic_count: u32,
}

impl System {
    /// Default simulator configuration: in-memory flash and fault log.
    pub fn new(flash_capacity: u32) -> Result<Self, String> {
        if flash_capacity == 0 || flash_capacity > 0x0100_0000 {
            return Err(format!("invalid flash capacity: {} bytes", flash_capacity));
        }
        Ok(System::with_parts(
            Box::new(MemFlash::new(flash_capacity)),
            Some(Box::new(MemLogStore::new())),
        ))
    }

    pub fn with_parts(
        device: Box<dyn FlashDevice>,
        store: Option<Box<dyn FaultLogStore>>,
    ) -> Self {
        System {
            rt: Runtime::new(device),
            debugger: Debugger::new(),
            faultlog: store.map(FaultLogger::new),
            installed: None,
            halted: true,
            panic_count: 0,
        }
    }

    /// Install a program image into flash. The RO segment lands at
    /// device offset zero; the cache is flushed because the device
    /// changed underneath it.
    pub fn install(&mut self, image: &[u8]) -> Result<(), String> {
        let program = Program::parse(image)?;
        program.install(self.rt.cache.device_mut(), 0)?;
        self.rt.cache.invalidate();
        self.rt.mem.set_flash_window(0, program.ro_size);
        self.installed = Some(Installed {
            entry: program.entry,
            rw_data: program.rw_data,
            bss_size: program.bss_size,
            stack_size: program.stack_size,
            meta: program.meta,
        });
        Ok(())
    }

    /// Set up RAM segments and enter the program.
    pub fn launch(&mut self) -> Result<(), String> {
        let installed = self.installed.as_ref().ok_or("no program installed")?;
        self.rt.mem.reset();
        self.rt.mem.init_segments(&installed.rw_data, installed.bss_size)?;
        self.rt.set_stack(installed.stack_size);
        self.rt.volume = 1;
        let entry = installed.entry;
        self.rt.launch(entry)
            .map_err(|stop| format!("launch failed: {:?}", stop))?;
        self.halted = false;
        Ok(())
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn is_stopped(&self) -> bool {
        self.debugger.stop_signal().is_some()
    }

    /// Run up to `max_steps` guest instructions. Returns the number
    /// executed; stops early on halt or a debugger stop.
    pub fn run(&mut self, max_steps: u32) -> u32 {
        let mut steps = 0u32;
        while steps < max_steps {
            if self.halted || self.is_stopped() {
                break;
            }
            if steps % TICK_BATCH == 0 {
                self.rt.tick();
                self.work();
            }
            match self.rt.step() {
                Ok(()) => steps += 1,
                Err(stop) => {
                    self.handle_stop(stop);
                }
            }
        }
        steps
    }

    /// Drain pending background tasks.
    pub fn work(&mut self) {
        while let Some(task) = self.rt.tasks.take_next() {
            match task {
                TASK_HEARTBEAT => self.rt.tick(),
                TASK_FAULT_LOGGER => self.commit_fault_record(),
                TASK_DEBUGGER => {
                    // transport is synchronous in the simulator; the
                    // pump exists for parity with the device loop
                }
                _ => {}
            }
        }
    }

    fn handle_stop(&mut self, stop: Stop) {
        match stop {
            Stop::Exit => {
                console_log!("program exited after {} instructions",
                             self.rt.cpu.instruction_count);
                self.halted = true;
            }
            Stop::Breakpoint => {
                if !self.debugger.breakpoint_hit(&mut self.rt) {
                    // a breakpoint with nobody listening is fatal
                    self.handle_fault(FaultCode::Abort);
                }
            }
            Stop::Fault(code) => self.handle_fault(code),
        }
    }

    /// Unhandled-fault routing. No guest fault is ever silently
    /// ignored: it stops in the debugger, lands in the fault log, or
    /// paints the panic display.
    fn handle_fault(&mut self, code: FaultCode) {
        if self.debugger.fault(code) {
            return;
        }

        if let Some(log) = self.faultlog.as_mut() {
            let meta = self.installed.as_ref()
                .map(|p| p.meta.clone())
                .unwrap_or_else(Metadata::anonymous);
            log.capture(&mut self.rt, code);
            self.halted = true;
            self.work();
            if self.faultlog.as_ref().map(|l| l.has_pending()).unwrap_or(false) {
                // the logger task could not persist the record
                self.panic_display(code, &meta);
            } else {
                console_log!("fault {:#04x} ({}) recorded", code.code(), code.label());
            }
        } else {
            let meta = self.installed.as_ref()
                .map(|p| p.meta.clone())
                .unwrap_or_else(Metadata::anonymous);
            self.halted = true;
            self.panic_display(code, &meta);
        }
    }

    fn commit_fault_record(&mut self) {
        let meta = self.installed.as_ref()
            .map(|p| p.meta.clone())
            .unwrap_or_else(Metadata::anonymous);
        if let Some(log) = self.faultlog.as_mut() {
            if log.has_pending() {
                match log.commit(&mut self.rt, &meta) {
                    Ok(reference) => {
                        console_log!("fault record #{} persisted", reference);
                    }
                    Err(e) => {
                        crate::console_error!("fault record lost: {}", e);
                    }
                }
            }
        }
    }

    /// Last-resort diagnostic: drain the peripheral for a bounded
    /// time, then paint a structured human-readable dump.
    fn panic_display(&mut self, code: FaultCode, meta: &Metadata) {
        let mut deadline = Deadline::ticks(PANIC_DRAIN);
        while self.rt.paint_queued() > 0 && deadline.tick() {
            self.rt.tick();
        }

        self.panic_count += 1;
        let pc = self.rt.pc_virt();
        let sp = self.rt.mem.phys_to_virt_ram(self.rt.cpu.sp()).unwrap_or(0);
        crate::console_error!(
            "*** VM FAULT {:#04x} ({})\n\
             ***   pc={:#010x} sp={:#010x}\n\
             ***   r0={:#010x} r1={:#010x} r2={:#010x} r3={:#010x}\n\
             ***   program \"{}\" {}",
            code.code(), code.label(),
            pc, sp,
            self.rt.cpu.gpr(0), self.rt.cpu.gpr(1),
            self.rt.cpu.gpr(2), self.rt.cpu.gpr(3),
            meta.package, meta.version,
        );
    }

    /// Feed one debugger command packet and collect the reply.
    pub fn debugger_packet(&mut self, packet: &[u32]) -> Vec<u32> {
        self.rt.tasks.trigger(TASK_DEBUGGER);
        let reply = self.debugger.handle_packet(&mut self.rt, packet);
        self.work();
        reply
    }

    // --- host inspection ---

    pub fn get_registers(&self) -> Vec<u32> {
        (0..crate::cpu::NUM_REGS).map(|r| self.rt.cpu.reg(r)).collect()
    }

    pub fn get_pc(&self) -> u32 {
        self.rt.pc_virt()
    }

    pub fn read_memory(&self, va: u32, len: u32) -> Vec<u8> {
        self.rt.read_ram_virt(va, len).unwrap_or_default()
    }

    pub fn get_instruction_count(&self) -> u64 {
        self.rt.cpu.instruction_count
    }

    pub fn fault_records(&self) -> Vec<FaultRecord> {
        let mut out = Vec::new();
        if let Some(log) = self.faultlog.as_ref() {
            for i in 0..log.store().len() {
                if let Some(bytes) = log.store().get(i) {
                    if let Ok(record) = FaultRecord::from_bytes(&bytes) {
                        out.push(record);
                    }
                }
            }
        }
        out
    }

    pub fn create_snapshot(&self) -> Result<Vec<u8>, String> {
        Snapshot::capture(&self.rt).to_bytes()
    }

    pub fn restore_snapshot(&mut self, data: &[u8]) -> Result<(), String> {
        let snap = Snapshot::from_bytes(data)?;
        snap.restore(&mut self.rt)?;
        self.halted = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::instr::emit;
    use crate::flash::BLOCK_SIZE;
    use crate::syscall;

    fn demo_image(code: &[u16], lits: &[(u8, u32)]) -> Vec<u8> {
        let mut ro = vec![0u8; BLOCK_SIZE as usize];
        for (i, hw) in code.iter().enumerate() {
            ro[i * 2..i * 2 + 2].copy_from_slice(&hw.to_le_bytes());
        }
        for &(idx, lit) in lits {
            let o = idx as usize * 4;
            ro[o..o + 4].copy_from_slice(&lit.to_le_bytes());
        }
        let meta = Metadata {
            uuid: [9; 16],
            package: "com.example.sys".into(),
            version: "1.0".into(),
        };
        Program::build(emit::call_literal(0, 4), &ro, &[0x11, 0x22], 8, 0x800, &meta)
    }

    #[test]
    fn test_install_launch_run_exit() {
        let mut sys = System::new(0x4000).unwrap();
        // program: set r0, syscall exit
        let image = demo_image(
            &[
                emit::mov_imm(0, 3),
                emit::svc(0x80 | syscall::SYS_EXIT as u8),
            ],
            &[],
        );
        sys.install(&image).unwrap();
        sys.launch().unwrap();

        // rw data initialized at the bottom of RAM
        assert_eq!(sys.read_memory(0x10000, 2), vec![0x11, 0x22]);

        sys.run(100);
        assert!(sys.is_halted());
        assert_eq!(sys.rt.cpu.gpr(0), 3);
    }

    #[test]
    fn test_fault_routing_prefers_debugger() {
        let mut sys = System::new(0x4000).unwrap();
        let image = demo_image(&[emit::svc(0xff)], &[]); // reserved svc
        sys.install(&image).unwrap();
        sys.launch().unwrap();

        // attach the debugger first
        sys.debugger_packet(&[(crate::debug::CMD_IS_STOPPED as u32) << 24]);
        sys.run(10);

        assert!(sys.is_stopped());
        assert!(!sys.is_halted());
        // absorbed: no record written, no panic painted
        assert!(sys.fault_records().is_empty());
        assert_eq!(sys.panic_count, 0);
    }

    #[test]
    fn test_fault_routing_logs_without_debugger() {
        let mut sys = System::new(0x4000).unwrap();
        let image = demo_image(&[emit::svc(0xff)], &[]);
        sys.install(&image).unwrap();
        sys.launch().unwrap();

        sys.run(10);
        assert!(sys.is_halted());
        let records = sys.fault_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].header.code, FaultCode::ReservedSvc.code());
        assert_eq!(records[0].header.volume, 1);
        assert_eq!(records[0].payload.as_ref().unwrap().package, "com.example.sys");
        assert_eq!(sys.panic_count, 0);
    }

    #[test]
    fn test_fault_routing_panics_as_last_resort() {
        let image = demo_image(&[emit::svc(0xff)], &[]);
        let mut sys = System::with_parts(
            Box::new(MemFlash::new(0x4000)), None);
        sys.install(&image).unwrap();
        sys.launch().unwrap();

        sys.run(10);
        assert!(sys.is_halted());
        // exactly one panic per unhandled fault
        assert_eq!(sys.panic_count, 1);
    }

    #[test]
    fn test_abort_syscall_produces_abort_record() {
        let mut sys = System::new(0x4000).unwrap();
        let image = demo_image(
            &[emit::svc(0x80 | syscall::SYS_ABORT as u8)],
            &[],
        );
        sys.install(&image).unwrap();
        sys.launch().unwrap();
        sys.run(10);

        let records = sys.fault_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].header.code, FaultCode::Abort.code());
    }

    #[test]
    fn test_snapshot_through_system() {
        let mut sys = System::new(0x4000).unwrap();
        let image = demo_image(
            &[
                emit::mov_imm(0, 1),
                emit::mov_imm(1, 2),
                emit::svc(0x80 | syscall::SYS_EXIT as u8),
            ],
            &[],
        );
        sys.install(&image).unwrap();
        sys.launch().unwrap();
        sys.run(1);

        let snap = sys.create_snapshot().unwrap();
        sys.run(100);
        assert!(sys.is_halted());

        sys.restore_snapshot(&snap).unwrap();
        assert_eq!(sys.rt.cpu.gpr(0), 1);
        sys.run(100);
        assert!(sys.is_halted());
        assert_eq!(sys.rt.cpu.gpr(1), 2);
    }
}
