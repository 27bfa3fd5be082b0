use std::env;
use std::fs::File;
use std::io::{self, Read};

use cubevm::System;

fn main() -> io::Result<()> {
    let args: Vec<String> = env::args().collect();
    let mut image_path = String::new();
    let mut flash_capacity = 0x0010_0000u32; // 1 MiB
    let mut max_steps = 50_000_000u64;
    let mut dump_faults = false;
    let mut debug_stops = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--flash" => {
                i += 1;
                flash_capacity = args[i].parse().expect("invalid flash capacity");
            }
            "--steps" => {
                i += 1;
                max_steps = args[i].parse().expect("invalid step limit");
            }
            "--dump-faults" => {
                dump_faults = true;
            }
            "--trace-stops" => {
                debug_stops = true;
            }
            arg if !arg.starts_with('-') => {
                image_path = arg.to_string();
            }
            _ => {
                eprintln!("Unknown argument: {}", args[i]);
            }
        }
        i += 1;
    }

    if image_path.is_empty() {
        eprintln!("Usage: {} <program-image> [--flash <bytes>] [--steps <n>] [--dump-faults]",
                  args[0]);
        std::process::exit(1);
    }

    let mut f = File::open(&image_path)?;
    let mut image = Vec::new();
    f.read_to_end(&mut image)?;

    // gzip'd images are accepted transparently
    if image.len() >= 2 && image[0] == 0x1f && image[1] == 0x8b {
        image = cubevm::decompress_gzip(&image)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    }

    let mut system = System::new(flash_capacity)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    system.install(&image)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    system.launch()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

    println!("cubevm: running {} ({} bytes)", image_path, image.len());

    let mut executed = 0u64;
    loop {
        let batch = system.run(100_000);
        executed += batch as u64;

        if system.is_halted() {
            break;
        }
        if system.is_stopped() {
            if debug_stops {
                println!("stopped by debugger, pc={:#010x}", system.get_pc());
            }
            break;
        }
        if executed >= max_steps {
            println!("step limit reached, halting");
            break;
        }
        if batch == 0 {
            break;
        }
    }

    println!("{} instructions executed", system.get_instruction_count());

    if dump_faults {
        for record in system.fault_records() {
            println!(
                "fault record #{}: code {:#04x} volume {} uptime {} pc={:#010x}",
                record.header.reference,
                record.header.code,
                record.header.volume,
                record.header.uptime,
                record.regs.regs[10],
            );
        }
    }

    Ok(())
}
