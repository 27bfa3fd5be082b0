//! Syscall dispatch table
//!
//! Numbered entry points callable from guest code, up to 8 word
//! arguments in r0-r7 and a 64-bit result split across r0/r1. The
//! numbering is assigned at compile time and frozen; unassigned or
//! out-of-range numbers fault.

use crate::cpu::fault::{FaultCode, Stop};
use crate::cpu::runtime::{Runtime, NUM_EVENTS};
use crate::memory::PA_RAM_BASE;
use crate::tasks::{Deadline, TASK_HEARTBEAT};

pub type SyscallFn = fn(&mut Runtime, [u32; 8]) -> Result<u64, Stop>;

pub const SYS_ABORT: u16 = 0;
pub const SYS_EXIT: u16 = 1;
pub const SYS_YIELD: u16 = 2;
pub const SYS_LOG: u16 = 3;
pub const SYS_UPTIME: u16 = 4;
pub const SYS_MEMSET8: u16 = 5;
pub const SYS_MEMCPY8: u16 = 6;
pub const SYS_RANDOM: u16 = 7;
pub const SYS_SET_VECTOR: u16 = 8;
pub const SYS_PAINT: u16 = 9;
pub const SYS_FINISH: u16 = 10;
pub const SYS_CUBES_CONNECTED: u16 = 11;

/// Longest message the log syscall will fetch
const LOG_MAX: u32 = 512;

/// Ticks a blocking paint/finish wait may burn before giving up
const PAINT_DEADLINE: u32 = 1024;

static TABLE: [Option<SyscallFn>; 12] = [
    Some(sys_abort),
    Some(sys_exit),
    Some(sys_yield),
    Some(sys_log),
    Some(sys_uptime),
    Some(sys_memset8),
    Some(sys_memcpy8),
    Some(sys_random),
    Some(sys_set_vector),
    Some(sys_paint),
    Some(sys_finish),
    Some(sys_cubes_connected),
];

pub fn lookup(num: u16) -> Option<SyscallFn> {
    TABLE.get(num as usize).copied().flatten()
}

pub fn table_len() -> usize {
    TABLE.len()
}

fn sys_abort(_rt: &mut Runtime, _args: [u32; 8]) -> Result<u64, Stop> {
    Err(Stop::Fault(FaultCode::Abort))
}

fn sys_exit(_rt: &mut Runtime, _args: [u32; 8]) -> Result<u64, Stop> {
    Err(Stop::Exit)
}

/// Give the background tasks a turn and request event delivery once
/// this syscall's return value is committed.
fn sys_yield(rt: &mut Runtime, _args: [u32; 8]) -> Result<u64, Stop> {
    rt.tasks.trigger(TASK_HEARTBEAT);
    rt.events.request_dispatch();
    Ok(0)
}

/// Fetch a message from guest memory (RAM or flash) and emit it on the
/// host log.
fn sys_log(rt: &mut Runtime, args: [u32; 8]) -> Result<u64, Stop> {
    let va = args[0];
    let len = args[1].min(LOG_MAX);
    if len == 0 {
        return Ok(0);
    }
    let mut buf = vec![0u8; len as usize];
    if !rt.mem.copy_rodata(&mut rt.cache, &mut buf, va) {
        return Err(Stop::Fault(FaultCode::LogFetch));
    }
    crate::console_log!("[vm] {}", String::from_utf8_lossy(&buf));
    Ok(len as u64)
}

fn sys_uptime(rt: &mut Runtime, _args: [u32; 8]) -> Result<u64, Stop> {
    Ok(rt.uptime)
}

fn sys_memset8(rt: &mut Runtime, args: [u32; 8]) -> Result<u64, Stop> {
    let (dest, value, count) = (args[0], args[1], args[2]);
    if count == 0 {
        return Ok(dest as u64);
    }
    let pa = rt.mem.map_ram(dest, count)
        .ok_or(Stop::Fault(FaultCode::StoreAddress))?;
    let off = (pa - PA_RAM_BASE) as usize;
    rt.mem.ram_slice_mut()[off..off + count as usize].fill(value as u8);
    Ok(dest as u64)
}

fn sys_memcpy8(rt: &mut Runtime, args: [u32; 8]) -> Result<u64, Stop> {
    let (dest, src, count) = (args[0], args[1], args[2]);
    if count == 0 {
        return Ok(dest as u64);
    }
    // validate both ranges before moving a single byte
    if !rt.mem.check_rodata(src, count) {
        return Err(Stop::Fault(FaultCode::LoadAddress));
    }
    let pa = rt.mem.map_ram(dest, count)
        .ok_or(Stop::Fault(FaultCode::StoreAddress))?;

    let mut buf = vec![0u8; count as usize];
    if !rt.mem.copy_rodata(&mut rt.cache, &mut buf, src) {
        return Err(Stop::Fault(FaultCode::LoadAddress));
    }
    let off = (pa - PA_RAM_BASE) as usize;
    rt.mem.ram_slice_mut()[off..off + count as usize].copy_from_slice(&buf);
    Ok(dest as u64)
}

fn sys_random(rt: &mut Runtime, _args: [u32; 8]) -> Result<u64, Stop> {
    Ok(rt.next_random() as u64)
}

fn sys_set_vector(rt: &mut Runtime, args: [u32; 8]) -> Result<u64, Stop> {
    let id = args[0] as usize;
    if id >= NUM_EVENTS {
        return Err(Stop::Fault(FaultCode::SyscallParam));
    }
    rt.events.set_handler(id, args[1]);
    Ok(0)
}

/// Queue one frame for the display peripheral. Throttles by polling
/// the cooperative tick loop until the queue drains below two frames;
/// the wait is abandoned at a deadline, never infinite.
fn sys_paint(rt: &mut Runtime, _args: [u32; 8]) -> Result<u64, Stop> {
    rt.queue_paint();
    let mut deadline = Deadline::ticks(PAINT_DEADLINE);
    while rt.paint_queued() > 1 && deadline.tick() {
        rt.tick();
    }
    Ok(0)
}

/// Block until every queued paint is acknowledged, deadline bounded.
fn sys_finish(rt: &mut Runtime, _args: [u32; 8]) -> Result<u64, Stop> {
    let mut deadline = Deadline::ticks(PAINT_DEADLINE);
    while rt.paint_queued() > 0 && deadline.tick() {
        rt.tick();
    }
    Ok(0)
}

fn sys_cubes_connected(rt: &mut Runtime, _args: [u32; 8]) -> Result<u64, Stop> {
    Ok(rt.cubes_connected as u64)
}
