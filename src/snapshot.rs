//! Snapshot/restore of emulator state (§4.5): registers plus every mapped
//! page, captured once and replayed exactly.
//!
//! The exploration engine (§4.7) uses this around the `step_into` it
//! performs to discover a `CALL`'s target: it would otherwise have to run
//! the callee for real, which may wander into unmapped or unsupported
//! code. `Snapshot::create` also suspends the emulator's user hooks for
//! the duration of that guarded step — see §9 — so a memory-read hook
//! doesn't double-fire on the callee's first instruction; `unhook`
//! reattaches them once the call site has been restored.

use failure::{Error, Fail};
use unicorn_engine::RegisterX86;

use crate::arch::Mode;
use crate::aspace::{AddressSpace, MemoryRegion};
use crate::emulator::{Emulator, SuspendedHooks};

#[derive(Debug, Fail)]
pub enum SnapshotError {
    #[fail(display = "snapshot was taken from a different emulator or arch/mode")]
    ForeignSnapshot,
}

const REGS_32: &[RegisterX86] = &[
    RegisterX86::EAX,
    RegisterX86::EBX,
    RegisterX86::ECX,
    RegisterX86::EDX,
    RegisterX86::ESI,
    RegisterX86::EDI,
    RegisterX86::EBP,
    RegisterX86::ESP,
    RegisterX86::EIP,
    RegisterX86::EFLAGS,
];

const REGS_64: &[RegisterX86] = &[
    RegisterX86::RAX,
    RegisterX86::RBX,
    RegisterX86::RCX,
    RegisterX86::RDX,
    RegisterX86::RSI,
    RegisterX86::RDI,
    RegisterX86::RBP,
    RegisterX86::RSP,
    RegisterX86::RIP,
    RegisterX86::R8,
    RegisterX86::R9,
    RegisterX86::R10,
    RegisterX86::R11,
    RegisterX86::R12,
    RegisterX86::R13,
    RegisterX86::R14,
    RegisterX86::R15,
    RegisterX86::EFLAGS,
];

fn regs_for(mode: Mode) -> &'static [RegisterX86] {
    match mode {
        Mode::M32 => REGS_32,
        Mode::M64 => REGS_64,
    }
}

/// An opaque, emulator-scoped capture of CPU state. Not thread-safe and
/// not transferable across emulators (`restore`/`unhook` reject a
/// snapshot taken from a different one, via the arch/mode check).
pub struct Snapshot {
    mode: Mode,
    registers: Vec<(RegisterX86, u64)>,
    regions: Vec<(MemoryRegion, Vec<u8>)>,
    suspended_hooks: std::cell::RefCell<Option<SuspendedHooks>>,
}

impl Snapshot {
    /// Capture `emu`'s register file and every mapped page, and suspend
    /// its user-registered hooks for the caller to reattach later via
    /// `unhook`.
    pub fn create(emu: &mut Emulator) -> Result<Snapshot, Error> {
        let mode = emu.mode();

        let mut registers = Vec::with_capacity(regs_for(mode).len());
        for &reg in regs_for(mode) {
            registers.push((reg, emu.reg_read(reg)?));
        }

        let mut regions = Vec::new();
        for region in emu.get_maps() {
            let data = emu.mem_read(region.address, region.length)?;
            regions.push((region, data));
        }

        let suspended_hooks = emu.suspended_hooks();

        Ok(Snapshot {
            mode,
            registers,
            regions,
            suspended_hooks: std::cell::RefCell::new(Some(suspended_hooks)),
        })
    }

    /// Overwrite `emu`'s registers and memory with the captured values.
    /// Regions present in `emu` but absent from the snapshot are left
    /// as-is; regions in the snapshot but currently unmapped in `emu` are
    /// re-mapped and re-written.
    pub fn restore(emu: &mut Emulator, snap: &Snapshot) -> Result<(), Error> {
        if emu.mode() != snap.mode {
            return Err(SnapshotError::ForeignSnapshot.into());
        }

        for &(reg, value) in &snap.registers {
            emu.reg_write(reg, value)?;
        }

        for (region, data) in &snap.regions {
            let already_mapped = emu
                .get_maps()
                .iter()
                .any(|r| r.address == region.address && r.length == region.length);
            if !already_mapped {
                emu.mem_map(region.address, region.length, &region.name)?;
            }
            emu.mem_write(region.address, data)?;
        }

        Ok(())
    }

    /// Reattach the hooks `create` suspended. Fails with `ForeignSnapshot`
    /// if called twice, or on a snapshot taken from a different emulator.
    pub fn unhook(emu: &mut Emulator, snap: &Snapshot) -> Result<(), Error> {
        if emu.mode() != snap.mode {
            return Err(SnapshotError::ForeignSnapshot.into());
        }
        let suspended = snap
            .suspended_hooks
            .borrow_mut()
            .take()
            .ok_or(SnapshotError::ForeignSnapshot)?;
        emu.resume_hooks(suspended)?;
        Ok(())
    }
}
