//! Virtual/physical memory mapping
//!
//! Memory layout (guest-visible):
//! 0x00010000 - 0x00017FFF: RAM window (32 KiB)
//! 0x80000000 - ...:        flash window (read-only program segment)
//!
//! Every address the interpreter dereferences on behalf of guest code
//! goes through this module. Physical addresses are tagged arena
//! offsets, never raw pointers, and are only produced by a mapping call
//! that checked bounds.

use crate::flash::{BlockCache, BlockRef, BLOCK_SIZE};

/// Guest-visible virtual address.
pub type VirtAddr = u32;

/// Host-dereferenceable physical address: a tagged offset into either
/// the RAM arena or a cached flash block.
pub type PhysAddr = u32;

/// RAM window base and size
pub const RAM_BASE: u32 = 0x0001_0000;
pub const RAM_SIZE: u32 = 0x8000;

/// Flash window base (length is the installed program's RO segment)
pub const FLASH_BASE: u32 = 0x8000_0000;

/// Physical address spaces. RAM physical addresses are also accepted
/// by `map_ram` as an alias for the corresponding virtual address,
/// so SP-derived pointer arithmetic can be re-checked cheaply.
pub const PA_RAM_BASE: u32 = 0x2000_0000;
pub const PA_FLASH_BASE: u32 = 0x4000_0000;

#[inline(always)]
fn pa_flash(slot: usize, offset: u32) -> PhysAddr {
    PA_FLASH_BASE | ((slot as u32) << 16) | offset
}

/// Decompose a flash physical address into (cache slot, block offset).
/// The offset field is wider than a block so that sequential code
/// fetch can step one halfword past the block edge and detect the
/// crossing, instead of silently wrapping into the slot bits.
#[inline(always)]
pub fn pa_flash_parts(pa: PhysAddr) -> (usize, u32) {
    (((pa >> 16) & 0xff) as usize, pa & 0xffff)
}

#[inline(always)]
pub fn pa_is_flash(pa: PhysAddr) -> bool {
    (pa & 0xf000_0000) == PA_FLASH_BASE
}

/// Memory mapper: owns guest RAM and the flash window geometry.
pub struct Memory {
    ram: Vec<u8>,
    /// Device address of the read-only segment (block aligned)
    ro_offset: u32,
    /// Length of the read-only segment, i.e. the flash window size
    ro_size: u32,
}

impl Memory {
    pub fn new() -> Self {
        Memory {
            ram: vec![0u8; RAM_SIZE as usize],
            ro_offset: 0,
            ro_size: 0,
        }
    }

    /// Configure the flash window over the installed program's RO
    /// segment. `ro_offset` must be block aligned.
    pub fn set_flash_window(&mut self, ro_offset: u32, ro_size: u32) {
        debug_assert_eq!(ro_offset % BLOCK_SIZE, 0);
        self.ro_offset = ro_offset;
        self.ro_size = ro_size;
    }

    pub fn flash_window_size(&self) -> u32 {
        self.ro_size
    }

    /// Translate a RAM address range to a physical address.
    ///
    /// Accepts either a virtual RAM-window address or an
    /// already-physical RAM address (the SP alias). Succeeds only if
    /// the entire `[va, va+length)` range lies inside the RAM window;
    /// length arithmetic is overflow-checked, a wrapping range never
    /// maps.
    pub fn map_ram(&self, va: VirtAddr, length: u32) -> Option<PhysAddr> {
        let offset = if va >= RAM_BASE && va < RAM_BASE + RAM_SIZE {
            va - RAM_BASE
        } else if va >= PA_RAM_BASE && va < PA_RAM_BASE + RAM_SIZE {
            va - PA_RAM_BASE
        } else {
            return None;
        };

        let end = offset.checked_add(length)?;
        if end > RAM_SIZE {
            return None;
        }
        Some(PA_RAM_BASE + offset)
    }

    /// Pure bounds check for read-only data, no cache side effects.
    /// Used to validate parameters before committing to a multi-step
    /// copy.
    pub fn check_rodata(&self, va: VirtAddr, length: u32) -> bool {
        if self.map_ram(va, length).is_some() {
            return true;
        }
        if va < FLASH_BASE {
            return false;
        }
        let offset = va - FLASH_BASE;
        match offset.checked_add(length) {
            Some(end) => end <= self.ro_size,
            None => false,
        }
    }

    /// Map read-only data in RAM or flash.
    ///
    /// For flash the returned pointer reaches into a cached block and
    /// `length` is clipped to the remainder of that block and of the
    /// window; the caller re-calls to continue past the boundary. On
    /// success the clipped length is always >= 1.
    pub fn map_rodata(
        &self,
        cache: &mut BlockCache,
        r: &mut BlockRef,
        va: VirtAddr,
        length: u32,
    ) -> Option<(PhysAddr, u32)> {
        if length == 0 {
            return None;
        }
        if let Some(pa) = self.map_ram(va, length) {
            return Some((pa, length));
        }
        if va < FLASH_BASE {
            return None;
        }
        let offset = va - FLASH_BASE;
        if offset >= self.ro_size {
            return None;
        }
        let in_block = offset & (BLOCK_SIZE - 1);
        let block_addr = self.ro_offset + (offset - in_block);
        cache.get(r, block_addr);
        let slot = r.slot().expect("get always assigns a slot");

        let window_avail = self.ro_size - offset;
        let block_avail = BLOCK_SIZE - in_block;
        let clipped = length.min(block_avail).min(window_avail);
        Some((pa_flash(slot, in_block), clipped))
    }

    /// Map a code fetch or branch target.
    ///
    /// Like `map_rodata`, but additionally requires the block's lazy
    /// valid-code extent to cover the target halfword. This is what
    /// keeps control flow out of unverified instruction bytes.
    pub fn map_rocode(
        &self,
        cache: &mut BlockCache,
        r: &mut BlockRef,
        va: VirtAddr,
    ) -> Option<PhysAddr> {
        if va < FLASH_BASE || (va & 1) != 0 {
            return None;
        }
        let offset = va - FLASH_BASE;
        if offset.checked_add(2)? > self.ro_size {
            return None;
        }
        let in_block = offset & (BLOCK_SIZE - 1);
        let block_addr = self.ro_offset + (offset - in_block);
        cache.get(r, block_addr);
        let slot = r.slot().expect("get always assigns a slot");

        let extent = cache.extend_code_validity(slot);
        if in_block + 2 > extent {
            return None;
        }
        Some(pa_flash(slot, in_block))
    }

    /// Copy read-only data into a host buffer, transparently handling
    /// block-boundary splits.
    pub fn copy_rodata(
        &self,
        cache: &mut BlockCache,
        dest: &mut [u8],
        src_va: VirtAddr,
    ) -> bool {
        let mut r = cache.new_ref();
        let mut va = src_va;
        let mut copied = 0usize;
        while copied < dest.len() {
            let remaining = (dest.len() - copied) as u32;
            let (pa, len) = match self.map_rodata(cache, &mut r, va, remaining) {
                Some(m) => m,
                None => return false,
            };
            let chunk = &mut dest[copied..copied + len as usize];
            if pa_is_flash(pa) {
                let (slot, off) = pa_flash_parts(pa);
                let data = cache.block_data(slot);
                chunk.copy_from_slice(&data[off as usize..(off + len) as usize]);
            } else {
                let off = (pa - PA_RAM_BASE) as usize;
                chunk.copy_from_slice(&self.ram[off..off + len as usize]);
            }
            copied += len as usize;
            va = va.wrapping_add(len);
        }
        true
    }

    // --- physical RAM accessors ---
    // Callers hold physical addresses produced by a mapping call;
    // ranges are still rechecked so a bad offset faults instead of
    // panicking the host.

    #[inline(always)]
    fn ram_index(&self, pa: PhysAddr, len: u32) -> Option<usize> {
        if pa < PA_RAM_BASE {
            return None;
        }
        let off = pa - PA_RAM_BASE;
        if off.checked_add(len)? > RAM_SIZE {
            return None;
        }
        Some(off as usize)
    }

    #[inline(always)]
    pub fn ram_read8(&self, pa: PhysAddr) -> Option<u8> {
        let i = self.ram_index(pa, 1)?;
        Some(self.ram[i])
    }

    #[inline(always)]
    pub fn ram_read16(&self, pa: PhysAddr) -> Option<u16> {
        let i = self.ram_index(pa, 2)?;
        Some(u16::from_le_bytes([self.ram[i], self.ram[i + 1]]))
    }

    #[inline(always)]
    pub fn ram_read32(&self, pa: PhysAddr) -> Option<u32> {
        let i = self.ram_index(pa, 4)?;
        Some(u32::from_le_bytes([
            self.ram[i],
            self.ram[i + 1],
            self.ram[i + 2],
            self.ram[i + 3],
        ]))
    }

    #[inline(always)]
    pub fn ram_write8(&mut self, pa: PhysAddr, value: u8) -> bool {
        match self.ram_index(pa, 1) {
            Some(i) => {
                self.ram[i] = value;
                true
            }
            None => false,
        }
    }

    #[inline(always)]
    pub fn ram_write16(&mut self, pa: PhysAddr, value: u16) -> bool {
        match self.ram_index(pa, 2) {
            Some(i) => {
                self.ram[i..i + 2].copy_from_slice(&value.to_le_bytes());
                true
            }
            None => false,
        }
    }

    #[inline(always)]
    pub fn ram_write32(&mut self, pa: PhysAddr, value: u32) -> bool {
        match self.ram_index(pa, 4) {
            Some(i) => {
                self.ram[i..i + 4].copy_from_slice(&value.to_le_bytes());
                true
            }
            None => false,
        }
    }

    /// Direct access to the RAM arena (snapshots, debugger reads).
    pub fn ram_slice(&self) -> &[u8] {
        &self.ram
    }

    pub fn ram_slice_mut(&mut self) -> &mut [u8] {
        &mut self.ram
    }

    /// Initialize the data segment at the bottom of RAM and zero the
    /// BSS that follows it. Fails if the segments do not fit.
    pub fn init_segments(&mut self, rw_init: &[u8], bss_len: u32) -> Result<(), String> {
        let total = (rw_init.len() as u32).checked_add(bss_len)
            .filter(|&t| t <= RAM_SIZE)
            .ok_or_else(|| format!("data segments too large for RAM ({} + {} bytes)",
                                   rw_init.len(), bss_len))?;
        self.ram[..rw_init.len()].copy_from_slice(rw_init);
        self.ram[rw_init.len()..total as usize].fill(0);
        Ok(())
    }

    pub fn reset(&mut self) {
        self.ram.fill(0);
    }

    // --- pure address-space conversions (debugging/display only) ---

    pub fn phys_to_virt_ram(&self, pa: PhysAddr) -> Option<VirtAddr> {
        if pa >= PA_RAM_BASE && pa < PA_RAM_BASE + RAM_SIZE {
            Some(RAM_BASE + (pa - PA_RAM_BASE))
        } else {
            None
        }
    }

    pub fn virt_to_flash_addr(&self, va: VirtAddr) -> Option<u32> {
        if va >= FLASH_BASE && va - FLASH_BASE < self.ro_size {
            Some(self.ro_offset + (va - FLASH_BASE))
        } else {
            None
        }
    }

    pub fn flash_to_virt_addr(&self, fa: u32) -> Option<VirtAddr> {
        if fa >= self.ro_offset && fa - self.ro_offset < self.ro_size {
            Some(FLASH_BASE + (fa - self.ro_offset))
        } else {
            None
        }
    }
}

impl Default for Memory {
    fn default() -> Self {
        Memory::new()
    }
}
