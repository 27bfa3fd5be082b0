//! Sandboxed game VM runtime
//!
//! Executes compiled game binaries inside a register-windowed virtual
//! CPU with a demand-paged flash cache and a strict address-space
//! sandbox, on the handheld device and in its simulator twin (native
//! and WebAssembly builds share this crate).

use wasm_bindgen::prelude::*;

pub mod cpu;
pub mod memory;
pub mod flash;
pub mod tasks;
pub mod syscall;
pub mod debug;
pub mod faultlog;
pub mod snapshot;
pub mod program;
mod system;
pub use system::System;

/// Initialize panic hook for better error messages in browser console
#[wasm_bindgen(start)]
pub fn init() {
    #[cfg(feature = "console_error_panic_hook")]
    console_error_panic_hook::set_once();
}

/// Log to browser console
#[cfg(target_arch = "wasm32")]
#[wasm_bindgen]
extern "C" {
    #[wasm_bindgen(js_namespace = console)]
    pub fn log(s: &str);

    #[wasm_bindgen(js_namespace = console, js_name = error)]
    pub fn error(s: &str);
}

#[cfg(not(target_arch = "wasm32"))]
pub fn log(s: &str) {
    println!("{}", s);
}

#[cfg(not(target_arch = "wasm32"))]
pub fn error(s: &str) {
    eprintln!("{}", s);
}

/// Helper macro for console logging
#[macro_export]
macro_rules! console_log {
    ($($t:tt)*) => (crate::log(&format!($($t)*)))
}

#[macro_export]
macro_rules! console_error {
    ($($t:tt)*) => (crate::error(&format!($($t)*)))
}

/// Main simulator interface exposed to JavaScript
#[wasm_bindgen]
pub struct Simulator {
    system: System,
}

#[wasm_bindgen]
impl Simulator {
    /// Create a simulator with the given flash capacity in bytes
    #[wasm_bindgen(constructor)]
    pub fn new(flash_capacity: u32) -> Result<Simulator, JsValue> {
        console_log!("creating VM simulator with {} bytes of flash", flash_capacity);
        let system = System::new(flash_capacity)
            .map_err(|e| JsValue::from_str(&e))?;
        Ok(Simulator { system })
    }

    /// Install a program image into flash
    pub fn install(&mut self, image: &[u8]) -> Result<(), JsValue> {
        self.system.install(image)
            .map_err(|e| JsValue::from_str(&e))
    }

    /// Launch the installed program
    pub fn launch(&mut self) -> Result<(), JsValue> {
        self.system.launch()
            .map_err(|e| JsValue::from_str(&e))
    }

    /// Run up to `steps` instructions; returns the number executed
    pub fn run(&mut self, steps: u32) -> u32 {
        self.system.run(steps)
    }

    pub fn is_halted(&self) -> bool {
        self.system.is_halted()
    }

    pub fn is_stopped(&self) -> bool {
        self.system.is_stopped()
    }

    /// Current PC as a guest virtual address
    pub fn get_pc(&self) -> u32 {
        self.system.get_pc()
    }

    pub fn get_registers(&self) -> Vec<u32> {
        self.system.get_registers()
    }

    pub fn get_instruction_count(&self) -> u32 {
        self.system.get_instruction_count() as u32
    }

    /// Read guest RAM by virtual address
    pub fn read_memory(&self, addr: u32, size: u32) -> Vec<u8> {
        self.system.read_memory(addr, size)
    }

    /// Exchange one debugger protocol packet
    pub fn debug_packet(&mut self, packet: Vec<u32>) -> Vec<u32> {
        self.system.debugger_packet(&packet)
    }

    /// Mark peripherals as connected (bitmap)
    pub fn set_cubes_connected(&mut self, bitmap: u32) {
        self.system.rt.cubes_connected = bitmap;
    }

    /// Number of persisted fault records
    pub fn fault_record_count(&self) -> u32 {
        self.system.fault_records().len() as u32
    }

    /// Serialize the VM state to a compressed blob
    pub fn get_state(&self) -> Result<Vec<u8>, JsValue> {
        self.system.create_snapshot()
            .map_err(|e| JsValue::from_str(&e))
    }

    /// Restore VM state from a compressed blob. The same program must
    /// already be installed.
    pub fn set_state(&mut self, state: &[u8]) -> Result<(), JsValue> {
        self.system.restore_snapshot(state)
            .map_err(|e| JsValue::from_str(&e))
    }
}

/// Decompress a gzip-compressed program image
/// Useful for shipping compressed binaries to the browser
pub fn decompress_gzip(data: &[u8]) -> Result<Vec<u8>, String> {
    use std::io::Read;
    use flate2::read::GzDecoder;

    let mut decoder = GzDecoder::new(data);
    let mut result = Vec::new();
    decoder.read_to_end(&mut result)
        .map_err(|e| format!("gzip decompression error: {}", e))?;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::instr::emit;
    use crate::flash::BLOCK_SIZE;
    use crate::program::{Metadata, Program};

    fn tiny_image() -> Vec<u8> {
        let mut ro = vec![0u8; BLOCK_SIZE as usize];
        let code = [
            emit::mov_imm(0, 7),
            emit::svc(0x80 | syscall::SYS_EXIT as u8),
        ];
        for (i, hw) in code.iter().enumerate() {
            ro[i * 2..i * 2 + 2].copy_from_slice(&hw.to_le_bytes());
        }
        Program::build(emit::call_literal(0, 2), &ro, &[], 0, 0x400,
                       &Metadata::anonymous())
    }

    #[test]
    fn test_simulator_end_to_end() {
        let mut sim = Simulator::new(0x4000).unwrap();
        sim.install(&tiny_image()).unwrap();
        sim.launch().unwrap();
        sim.run(100);
        assert!(sim.is_halted());
        assert_eq!(sim.get_registers()[0], 7);
    }

    #[test]
    fn test_state_round_trip() {
        let mut sim = Simulator::new(0x4000).unwrap();
        sim.install(&tiny_image()).unwrap();
        sim.launch().unwrap();
        sim.run(1);

        let state = sim.get_state().unwrap();
        assert!(!state.is_empty());

        let mut sim2 = Simulator::new(0x4000).unwrap();
        sim2.install(&tiny_image()).unwrap();
        sim2.launch().unwrap();
        sim2.set_state(&state).unwrap();

        assert_eq!(sim.get_registers(), sim2.get_registers());
        assert_eq!(sim.get_pc(), sim2.get_pc());
    }
}
