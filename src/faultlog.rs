//! Post-mortem fault records
//!
//! When a guest fault goes unhandled, a forensic record is produced in
//! two phases: a cheap stack-only capture at fault time (header,
//! registers, peripheral connectivity), and a deferred task that adds
//! the expensive payload (stack tail, faulting code page, program
//! identity strings) and appends the record to persistent storage.
//! Record numbering is monotonic and derived from the last persisted
//! record, read back at logger-task time rather than fault time.

use serde::{Serialize, Deserialize};

use crate::cpu::fault::FaultCode;
use crate::cpu::runtime::Runtime;
use crate::flash::BLOCK_SIZE;
use crate::program::Metadata;
use crate::tasks::TASK_FAULT_LOGGER;

/// Bytes of stack captured above SP
const STACK_TAIL: u32 = 64;

pub const RECORD_TYPE_FAULT: u8 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultHeader {
    /// Monotonic record id
    pub reference: u32,
    pub record_type: u8,
    /// Volume id of the program that faulted
    pub volume: u32,
    pub code: u8,
    pub uptime: u64,
}

/// Peripheral connectivity at fault time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CubeSnapshot {
    pub connected: u32,
}

/// r0-r7, FP, SP, PC — all squashed to virtual addresses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterSnapshot {
    pub regs: [u32; 11],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultPayload {
    pub stack: Vec<u8>,
    pub code_page: Vec<u8>,
    pub uuid: [u8; 16],
    pub package: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultRecord {
    pub header: FaultHeader,
    pub cubes: CubeSnapshot,
    pub regs: RegisterSnapshot,
    pub payload: Option<FaultPayload>,
}

impl FaultRecord {
    pub fn to_bytes(&self) -> Result<Vec<u8>, String> {
        let serialized = bincode::serialize(self)
            .map_err(|e| format!("fault record serialization: {}", e))?;
        zstd::stream::encode_all(&serialized[..], 3)
            .map_err(|e| format!("fault record compression: {}", e))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, String> {
        let decompressed = zstd::stream::decode_all(data)
            .map_err(|e| format!("fault record decompression: {}", e))?;
        bincode::deserialize(&decompressed)
            .map_err(|e| format!("fault record deserialization: {}", e))
    }
}

/// Append-only record storage, keyed by insertion order.
pub trait FaultLogStore {
    fn append(&mut self, record: &[u8]) -> Result<(), String>;
    fn len(&self) -> usize;
    fn get(&self, index: usize) -> Option<Vec<u8>>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn last(&self) -> Option<Vec<u8>> {
        if self.len() == 0 {
            None
        } else {
            self.get(self.len() - 1)
        }
    }
}

/// In-memory store used by the simulator and tests.
#[derive(Default)]
pub struct MemLogStore {
    records: Vec<Vec<u8>>,
}

impl MemLogStore {
    pub fn new() -> Self {
        MemLogStore { records: Vec::new() }
    }
}

impl FaultLogStore for MemLogStore {
    fn append(&mut self, record: &[u8]) -> Result<(), String> {
        self.records.push(record.to_vec());
        Ok(())
    }

    fn len(&self) -> usize {
        self.records.len()
    }

    fn get(&self, index: usize) -> Option<Vec<u8>> {
        self.records.get(index).cloned()
    }
}

/// State captured synchronously at fault time. Everything here lives
/// on the stack of the fault path; nothing allocates.
struct PendingFault {
    code: FaultCode,
    uptime: u64,
    volume: u32,
    cubes: CubeSnapshot,
    regs: RegisterSnapshot,
    pc_va: u32,
    sp_va: u32,
}

pub struct FaultLogger {
    pending: Option<PendingFault>,
    store: Box<dyn FaultLogStore>,
}

impl FaultLogger {
    pub fn new(store: Box<dyn FaultLogStore>) -> Self {
        FaultLogger { pending: None, store }
    }

    pub fn store(&self) -> &dyn FaultLogStore {
        &*self.store
    }

    /// Phase one, at fault time: snapshot registers and connectivity,
    /// quarantine the faulting code, and queue the logger task. The
    /// running code block is invalidated and the runtime trapped so
    /// the interpreter cannot keep executing from a half-corrupted
    /// cached copy while the snapshot is pending.
    pub fn capture(&mut self, rt: &mut Runtime, code: FaultCode) {
        let pc_va = rt.pc_virt();
        let sp = rt.cpu.sp();
        let sp_va = rt.mem.phys_to_virt_ram(sp).unwrap_or(0);
        let fp = rt.cpu.fp();
        let fp_va = if fp == 0 { 0 } else { rt.mem.phys_to_virt_ram(fp).unwrap_or(0) };

        let regs = RegisterSnapshot {
            regs: [
                rt.cpu.gpr(0), rt.cpu.gpr(1), rt.cpu.gpr(2), rt.cpu.gpr(3),
                rt.cpu.gpr(4), rt.cpu.gpr(5), rt.cpu.gpr(6), rt.cpu.gpr(7),
                fp_va, sp_va, pc_va,
            ],
        };

        self.pending = Some(PendingFault {
            code,
            uptime: rt.uptime,
            volume: rt.volume,
            cubes: CubeSnapshot { connected: rt.cubes_connected },
            regs,
            pc_va,
            sp_va,
        });

        rt.set_abort_trap();
        rt.tasks.trigger(TASK_FAULT_LOGGER);
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Phase two, from the logger task: read the last persisted
    /// reference, gather the expensive payload, and append the
    /// finished record.
    pub fn commit(&mut self, rt: &mut Runtime, meta: &Metadata) -> Result<u32, String> {
        let pending = self.pending.take().ok_or("no pending fault")?;

        let reference = match self.store.last() {
            Some(bytes) => FaultRecord::from_bytes(&bytes)
                .map(|r| r.header.reference.wrapping_add(1))
                .unwrap_or(1),
            None => 1,
        };

        let stack = if pending.sp_va != 0 {
            rt.read_ram_virt(pending.sp_va, stack_tail_len(rt, pending.sp_va))
                .unwrap_or_default()
        } else {
            Vec::new()
        };

        // the faulting block was invalidated at capture time, so this
        // re-reads the device rather than a possibly-stale cache entry
        let code_page = if pending.pc_va != 0 {
            let page_va = pending.pc_va & !(BLOCK_SIZE - 1);
            let mut buf = vec![0u8; BLOCK_SIZE as usize];
            if rt.mem.copy_rodata(&mut rt.cache, &mut buf, page_va) {
                buf
            } else {
                Vec::new()
            }
        } else {
            Vec::new()
        };

        let record = FaultRecord {
            header: FaultHeader {
                reference,
                record_type: RECORD_TYPE_FAULT,
                volume: pending.volume,
                code: pending.code.code(),
                uptime: pending.uptime,
            },
            cubes: pending.cubes,
            regs: pending.regs,
            payload: Some(FaultPayload {
                stack,
                code_page,
                uuid: meta.uuid,
                package: meta.package.clone(),
                version: meta.version.clone(),
            }),
        };

        self.store.append(&record.to_bytes()?)?;
        Ok(reference)
    }
}

fn stack_tail_len(rt: &Runtime, sp_va: u32) -> u32 {
    let mut len = STACK_TAIL;
    while len > 0 && rt.read_ram_virt(sp_va, len).is_none() {
        len -= 4;
    }
    len
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::instr::emit;
    use crate::flash::MemFlash;

    fn runtime() -> Runtime {
        let mut code = vec![0u8; BLOCK_SIZE as usize];
        code[0..2].copy_from_slice(&emit::svc(0).to_le_bytes());
        let mut dev = MemFlash::new(0x1000);
        dev.fill(0, &code);
        let mut rt = Runtime::new(Box::new(dev));
        rt.mem.set_flash_window(0, 0x100);
        rt.set_stack(0x1000);
        rt.launch(emit::call_literal(0, 4)).unwrap();
        rt
    }

    fn meta() -> Metadata {
        Metadata {
            uuid: [3; 16],
            package: "com.example.faulty".into(),
            version: "0.9".into(),
        }
    }

    #[test]
    fn test_record_round_trip() {
        let record = FaultRecord {
            header: FaultHeader {
                reference: 7,
                record_type: RECORD_TYPE_FAULT,
                volume: 2,
                code: FaultCode::LoadAddress.code(),
                uptime: 12345,
            },
            cubes: CubeSnapshot { connected: 0b101 },
            regs: RegisterSnapshot { regs: [9; 11] },
            payload: Some(FaultPayload {
                stack: vec![1, 2, 3, 4],
                code_page: vec![0xBE, 0x00],
                uuid: [5; 16],
                package: "pkg".into(),
                version: "v".into(),
            }),
        };
        let bytes = record.to_bytes().unwrap();
        assert_eq!(FaultRecord::from_bytes(&bytes).unwrap(), record);
    }

    #[test]
    fn test_capture_quarantines_and_defers() {
        let mut rt = runtime();
        rt.cpu.set_gpr(0, 0xAAAA);
        rt.cubes_connected = 0b11;

        let mut logger = FaultLogger::new(Box::new(MemLogStore::new()));
        logger.capture(&mut rt, FaultCode::StoreAddress);

        // quarantined: the runtime refuses to execute further
        assert!(rt.abort_trap_set());
        assert!(rt.tasks.is_pending(TASK_FAULT_LOGGER));
        assert!(logger.has_pending());
        // nothing persisted yet; that happens at task time
        assert_eq!(logger.store().len(), 0);
    }

    #[test]
    fn test_commit_builds_numbered_records() {
        let mut rt = runtime();
        let mut logger = FaultLogger::new(Box::new(MemLogStore::new()));

        logger.capture(&mut rt, FaultCode::LoadAddress);
        assert_eq!(logger.commit(&mut rt, &meta()).unwrap(), 1);

        logger.capture(&mut rt, FaultCode::Abort);
        assert_eq!(logger.commit(&mut rt, &meta()).unwrap(), 2);

        let bytes = logger.store().get(1).unwrap();
        let record = FaultRecord::from_bytes(&bytes).unwrap();
        assert_eq!(record.header.reference, 2);
        assert_eq!(record.header.code, FaultCode::Abort.code());
        assert_eq!(record.header.volume, rt.volume);
        let payload = record.payload.unwrap();
        assert_eq!(payload.package, "com.example.faulty");
        assert_eq!(payload.code_page.len(), BLOCK_SIZE as usize);

        // the pc register slot holds the virtual fault address
        assert_eq!(record.regs.regs[10], rt.pc_virt());
    }

    #[test]
    fn test_commit_without_capture_fails() {
        let mut rt = runtime();
        let mut logger = FaultLogger::new(Box::new(MemLogStore::new()));
        assert!(logger.commit(&mut rt, &meta()).is_err());
    }
}
