//! The Emulator (§4.4): owns CPU state for one function walk, exposing
//! reg/mem/hook/step/run primitives on top of `unicorn-engine` and a
//! `zydis` decoder.

use std::cell::RefCell;
use std::rc::Rc;

use failure::{Error, Fail};
use log::trace;
use unicorn_engine::unicorn_const::{uc_error, uc_hook, HookType, MemType, Permission};
use unicorn_engine::{RegisterX86, Unicorn};

use crate::arch::{Mode, VA};
use crate::aspace::{round_up_to_page, AddressSpace, AddressSpaceError, MemoryRegion};
use crate::config::Config;
use crate::hook::{add_hook, Multiplexer, Registration};
use crate::workspace::Workspace;

pub const MAX_INSN_SIZE: usize = 0x10;

#[derive(Debug, Fail)]
pub enum EmulatorError {
    #[fail(display = "invalid arch for this operation")]
    InvalidArch,
    #[fail(display = "invalid mode for this operation")]
    InvalidMode,
    #[fail(display = "invalid memory read")]
    InvalidMemoryRead,
    #[fail(display = "invalid memory write")]
    InvalidMemoryWrite,
    #[fail(display = "invalid memory exec")]
    InvalidMemoryExec,
    #[fail(display = "failed to disassemble instruction at the given address")]
    FailedToDisassemble,
    #[fail(display = "emulator escaped: stepped past more than one instruction")]
    EmulatorEscaped,
    #[fail(display = "unicorn engine error: {:?}", _0)]
    Engine(uc_error),
}

/// Build a `zydis` decoder configured for `mode`. Shared by `Emulator` and
/// `Workspace`, which both need a decoder matching the same arch/mode but
/// otherwise never touch each other's.
pub(crate) fn make_decoder(mode: Mode) -> Result<zydis::Decoder, Error> {
    Ok(match mode {
        Mode::M32 => zydis::Decoder::new(zydis::MachineMode::LEGACY_32, zydis::AddressWidth::_32)?,
        Mode::M64 => zydis::Decoder::new(zydis::MachineMode::LONG_64, zydis::AddressWidth::_64)?,
    })
}

fn translate_uc_error(e: uc_error) -> EmulatorError {
    match e {
        uc_error::READ_UNMAPPED | uc_error::READ_PROT => EmulatorError::InvalidMemoryRead,
        uc_error::WRITE_UNMAPPED | uc_error::WRITE_PROT => EmulatorError::InvalidMemoryWrite,
        uc_error::FETCH_UNMAPPED | uc_error::FETCH_PROT => EmulatorError::InvalidMemoryExec,
        other => EmulatorError::Engine(other),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecState {
    Idle,
    Running,
    Halted,
}

pub const EFLAG_CF: u64 = 1 << 0;
pub const EFLAG_PF: u64 = 1 << 2;
pub const EFLAG_AF: u64 = 1 << 4;
pub const EFLAG_ZF: u64 = 1 << 6;
pub const EFLAG_SF: u64 = 1 << 7;
pub const EFLAG_TF: u64 = 1 << 8;
pub const EFLAG_IF: u64 = 1 << 9;
pub const EFLAG_DF: u64 = 1 << 10;
pub const EFLAG_OF: u64 = 1 << 11;
pub const EFLAG_IOPL0: u64 = 1 << 12;
pub const EFLAG_IOPL1: u64 = 1 << 13;
pub const EFLAG_NT: u64 = 1 << 14;
pub const EFLAG_RF: u64 = 1 << 16;
pub const EFLAG_VM: u64 = 1 << 17;
pub const EFLAG_AC: u64 = 1 << 18;
pub const EFLAG_VIF: u64 = 1 << 19;
pub const EFLAG_VIP: u64 = 1 << 20;
pub const EFLAG_ID: u64 = 1 << 21;

/// `(insn_ip, accessed_va, size, value)` — the instruction pointer is read
/// from the engine at dispatch time, straight off the `uc` handle the raw
/// hook callback already has, so no re-entrant call back into `Emulator`
/// is needed to recover it.
type MemCallback = Box<dyn FnMut(VA, VA, usize, i64)>;
type UnmappedCallback = Box<dyn FnMut(VA, VA, usize, i64) -> bool>;
type CodeCallback = Box<dyn FnMut(VA, u32)>;

/// A multiplexer together with the low-level unicorn hook id currently
/// dispatching into it. Kept distinct from the `Multiplexer` itself because
/// suspend/resume (see `suspended_hooks`) detaches and later re-installs
/// the low-level hook while the multiplexer (and its registrations) lives
/// on unchanged.
struct InstalledHook<F> {
    mux: Rc<RefCell<Multiplexer<F>>>,
    hook_id: uc_hook,
}

/// `true` if `slot` is empty, or holds a multiplexer whose last
/// registration has already dropped — in either case the low-level hook
/// needs (re)installing before a new subscriber is added.
fn needs_reinstall<F>(slot: &Option<InstalledHook<F>>) -> bool {
    match slot {
        None => true,
        Some(installed) => installed.mux.borrow().is_empty(),
    }
}

#[derive(Default)]
struct Hooks {
    mem_read: Option<InstalledHook<MemCallback>>,
    mem_write: Option<InstalledHook<MemCallback>>,
    mem_unmapped: Option<InstalledHook<UnmappedCallback>>,
    code: Option<InstalledHook<CodeCallback>>,
}

/// One emulation context spawned from a `Workspace`. Its memory starts as
/// a full copy of the workspace's address space (`copy_address_space`);
/// further `mem_map`/`mem_unmap` calls affect only this emulator.
pub struct Emulator {
    mode: Mode,
    uc: Rc<RefCell<Unicorn<'static, ()>>>,
    decoder: zydis::Decoder,
    maps: Rc<RefCell<Vec<MemoryRegion>>>,
    hooks: Hooks,
    config: Config,
    state: ExecState,
}

impl Emulator {
    pub fn new(ws: &Workspace) -> Result<Emulator, Error> {
        let uc_mode = match ws.mode() {
            Mode::M32 => unicorn_engine::unicorn_const::Mode::MODE_32,
            Mode::M64 => unicorn_engine::unicorn_const::Mode::MODE_64,
        };
        let uc = Unicorn::new(unicorn_engine::unicorn_const::Arch::X86, uc_mode)
            .map_err(EmulatorError::Engine)?;

        let decoder = make_decoder(ws.mode())?;

        let mut emu = Emulator {
            mode: ws.mode(),
            uc: Rc::new(RefCell::new(uc)),
            decoder,
            maps: Rc::new(RefCell::new(Vec::new())),
            hooks: Hooks::default(),
            config: ws.config().clone(),
            state: ExecState::Idle,
        };

        crate::aspace::copy_address_space(&mut emu, ws)?;

        Ok(emu)
    }

    pub fn state(&self) -> ExecState {
        self.state
    }

    fn reg_id_for(&self, lo32: RegisterX86, lo64: RegisterX86) -> Result<RegisterX86, Error> {
        match self.mode {
            Mode::M32 => Ok(lo32),
            Mode::M64 => Ok(lo64),
        }
    }

    pub fn reg_read(&self, reg: RegisterX86) -> Result<u64, Error> {
        self.uc
            .borrow()
            .reg_read(reg)
            .map_err(|e| EmulatorError::Engine(e).into())
    }

    pub fn reg_write(&mut self, reg: RegisterX86, value: u64) -> Result<(), Error> {
        self.uc
            .borrow_mut()
            .reg_write(reg, value)
            .map_err(|e| EmulatorError::Engine(e).into())
    }

    fn eflags(&self) -> Result<u64, Error> {
        self.reg_read(RegisterX86::EFLAGS)
    }

    pub fn get_eflag(&self, mask: u64) -> Result<bool, Error> {
        Ok(self.eflags()? & mask != 0)
    }

    pub fn set_eflag(&mut self, mask: u64) -> Result<(), Error> {
        let v = self.eflags()?;
        self.reg_write(RegisterX86::EFLAGS, v | mask)
    }

    pub fn unset_eflag(&mut self, mask: u64) -> Result<(), Error> {
        let v = self.eflags()?;
        self.reg_write(RegisterX86::EFLAGS, v & !mask)
    }

    pub fn toggle_eflag(&mut self, mask: u64) -> Result<(), Error> {
        if self.get_eflag(mask)? {
            self.unset_eflag(mask)
        } else {
            self.set_eflag(mask)
        }
    }

    pub fn set_stack_pointer(&mut self, va: VA) -> Result<(), Error> {
        let reg = self.reg_id_for(RegisterX86::ESP, RegisterX86::RSP)?;
        self.reg_write(reg, va.0)
    }

    pub fn get_stack_pointer(&self) -> Result<VA, Error> {
        let reg = self.reg_id_for(RegisterX86::ESP, RegisterX86::RSP)?;
        Ok(VA(self.reg_read(reg)?))
    }

    pub fn set_instruction_pointer(&mut self, va: VA) -> Result<(), Error> {
        let reg = self.reg_id_for(RegisterX86::EIP, RegisterX86::RIP)?;
        self.reg_write(reg, va.0)
    }

    pub fn get_instruction_pointer(&self) -> Result<VA, Error> {
        let reg = self.reg_id_for(RegisterX86::EIP, RegisterX86::RIP)?;
        Ok(VA(self.reg_read(reg)?))
    }

    /// Install (or reuse, if re-attaching a suspended one) the low-level
    /// hook that dispatches into `existing`, or a fresh multiplexer if
    /// `existing` is `None`. The teardown closure always targets whatever
    /// `hook_id` this particular installation produced, so a
    /// suspend-then-resume cycle (which installs a new low-level hook with
    /// a new id) doesn't leave a stale teardown behind.
    fn install_hook<F>(
        &mut self,
        existing: Option<Rc<RefCell<Multiplexer<F>>>>,
        install: impl FnOnce(&mut Unicorn<'static, ()>, Rc<RefCell<Multiplexer<F>>>) -> Result<uc_hook, uc_error>,
    ) -> Result<InstalledHook<F>, Error> {
        let mux = existing.unwrap_or_else(|| Rc::new(RefCell::new(Multiplexer::new())));
        let hook_id = install(&mut self.uc.borrow_mut(), mux.clone()).map_err(EmulatorError::Engine)?;
        let teardown_uc = self.uc.clone();
        mux.borrow_mut()
            .set_teardown(Box::new(move || {
                let _ = teardown_uc.borrow_mut().remove_hook(hook_id);
            }));
        Ok(InstalledHook { mux, hook_id })
    }

    fn install_mem_multiplexer(
        &mut self,
        kind: HookType,
        existing: Option<Rc<RefCell<Multiplexer<MemCallback>>>>,
    ) -> Result<InstalledHook<MemCallback>, Error> {
        let ip_reg = self.reg_id_for(RegisterX86::EIP, RegisterX86::RIP)?;
        self.install_hook(existing, move |uc, dispatch_mux| {
            uc.add_mem_hook(kind, 1, 0, move |uc, _memtype: MemType, addr, size, value| {
                let ip = uc.reg_read(ip_reg).unwrap_or(0);
                dispatch_mux.borrow_mut().dispatch4(VA(ip), VA(addr), size, value);
                true
            })
        })
    }

    fn install_mem_unmapped_multiplexer(
        &mut self,
        existing: Option<Rc<RefCell<Multiplexer<UnmappedCallback>>>>,
    ) -> Result<InstalledHook<UnmappedCallback>, Error> {
        let ip_reg = self.reg_id_for(RegisterX86::EIP, RegisterX86::RIP)?;
        self.install_hook(existing, move |uc, dispatch_mux| {
            uc.add_mem_hook(
                HookType::MEM_UNMAPPED,
                1,
                0,
                move |uc, _memtype: MemType, addr, size, value| {
                    let ip = uc.reg_read(ip_reg).unwrap_or(0);
                    dispatch_mux.borrow_mut().dispatch_bool4(VA(ip), VA(addr), size, value)
                },
            )
        })
    }

    fn install_code_multiplexer(
        &mut self,
        existing: Option<Rc<RefCell<Multiplexer<CodeCallback>>>>,
    ) -> Result<InstalledHook<CodeCallback>, Error> {
        self.install_hook(existing, move |uc, dispatch_mux| {
            uc.add_code_hook(1, 0, move |_uc, addr, size| {
                dispatch_mux.borrow_mut().dispatch2(VA(addr), size);
            })
        })
    }

    /// Register a memory-read hook; the multiplexer and its one low-level
    /// unicorn hook are created lazily on first subscription, and
    /// reinstalled if a prior subscriber's teardown already detached the
    /// low-level hook (an internal caller, e.g. `step_into`'s single-shot
    /// tracing, subscribes and drops on every call — reusing a torn-down
    /// multiplexer without reattaching would silently stop dispatching).
    pub fn hook_mem_read(&mut self, f: MemCallback) -> Result<Registration<MemCallback>, Error> {
        if needs_reinstall(&self.hooks.mem_read) {
            let existing = self.hooks.mem_read.take().map(|h| h.mux);
            self.hooks.mem_read = Some(self.install_mem_multiplexer(HookType::MEM_READ, existing)?);
        }
        let mux = &self.hooks.mem_read.as_ref().unwrap().mux;
        Ok(add_hook(mux, f))
    }

    pub fn hook_mem_write(&mut self, f: MemCallback) -> Result<Registration<MemCallback>, Error> {
        if needs_reinstall(&self.hooks.mem_write) {
            let existing = self.hooks.mem_write.take().map(|h| h.mux);
            self.hooks.mem_write = Some(self.install_mem_multiplexer(HookType::MEM_WRITE, existing)?);
        }
        let mux = &self.hooks.mem_write.as_ref().unwrap().mux;
        Ok(add_hook(mux, f))
    }

    pub fn hook_mem_unmapped(&mut self, f: UnmappedCallback) -> Result<Registration<UnmappedCallback>, Error> {
        if needs_reinstall(&self.hooks.mem_unmapped) {
            let existing = self.hooks.mem_unmapped.take().map(|h| h.mux);
            self.hooks.mem_unmapped = Some(self.install_mem_unmapped_multiplexer(existing)?);
        }
        let mux = &self.hooks.mem_unmapped.as_ref().unwrap().mux;
        Ok(add_hook(mux, f))
    }

    pub fn hook_code(&mut self, f: CodeCallback) -> Result<Registration<CodeCallback>, Error> {
        if needs_reinstall(&self.hooks.code) {
            let existing = self.hooks.code.take().map(|h| h.mux);
            self.hooks.code = Some(self.install_code_multiplexer(existing)?);
        }
        let mux = &self.hooks.code.as_ref().unwrap().mux;
        Ok(add_hook(mux, f))
    }

    /// Detach the low-level unicorn hook (if any) dispatching into an
    /// installed multiplexer, handing back the multiplexer itself so its
    /// registrations survive the gap. Used by both `suspended_hooks` (all
    /// four kinds at once) and is the reason a suspended hook genuinely
    /// stops firing, rather than merely being forgotten by `Hooks`.
    fn detach<F>(&mut self, installed: Option<InstalledHook<F>>) -> Option<Rc<RefCell<Multiplexer<F>>>> {
        installed.map(|h| {
            let _ = self.uc.borrow_mut().remove_hook(h.hook_id);
            h.mux
        })
    }

    /// Suspend (detach) every user-registered hook, returning a token
    /// that `resume_hooks` uses to reattach them. Used by `Snapshot`
    /// around a guarded `step_into` so listening hooks don't double-fire
    /// on the callee's first instruction.
    pub(crate) fn suspended_hooks(&mut self) -> SuspendedHooks {
        SuspendedHooks {
            mem_read: self.detach(self.hooks.mem_read.take()),
            mem_write: self.detach(self.hooks.mem_write.take()),
            mem_unmapped: self.detach(self.hooks.mem_unmapped.take()),
            code: self.detach(self.hooks.code.take()),
        }
    }

    /// Re-install a low-level hook for each multiplexer `suspended` still
    /// holds, preserving its registrations.
    pub(crate) fn resume_hooks(&mut self, suspended: SuspendedHooks) -> Result<(), Error> {
        if let Some(mux) = suspended.mem_read {
            self.hooks.mem_read = Some(self.install_mem_multiplexer(HookType::MEM_READ, Some(mux))?);
        }
        if let Some(mux) = suspended.mem_write {
            self.hooks.mem_write = Some(self.install_mem_multiplexer(HookType::MEM_WRITE, Some(mux))?);
        }
        if let Some(mux) = suspended.mem_unmapped {
            self.hooks.mem_unmapped = Some(self.install_mem_unmapped_multiplexer(Some(mux))?);
        }
        if let Some(mux) = suspended.code {
            self.hooks.code = Some(self.install_code_multiplexer(Some(mux))?);
        }
        Ok(())
    }

    fn trace_mem_unmapped(&mut self) -> Result<(Registration<UnmappedCallback>, Rc<RefCell<Option<EmulatorError>>>), Error> {
        let captured: Rc<RefCell<Option<EmulatorError>>> = Rc::new(RefCell::new(None));
        let slot = captured.clone();
        let reg = self.hook_mem_unmapped(Box::new(move |_ip, addr, size, _value| {
            trace!("unmapped access: {} (0x{:x} bytes)", addr, size);
            *slot.borrow_mut() = Some(EmulatorError::InvalidMemoryRead);
            false
        }))?;
        Ok((reg, captured))
    }

    /// Run from the current instruction pointer until it reaches `target`,
    /// or a hook halts execution, or a fault occurs.
    pub fn run_to(&mut self, target: VA) -> Result<(), Error> {
        let ip = self.get_instruction_pointer()?;
        let (_trap, captured) = self.trace_mem_unmapped()?;

        self.state = ExecState::Running;
        let result = self
            .uc
            .borrow_mut()
            .emu_start(ip.0, target.0, 0, 0);
        self.state = ExecState::Idle;

        if let Some(err) = captured.borrow_mut().take() {
            self.state = ExecState::Halted;
            return Err(err.into());
        }
        result.map_err(|e| {
            self.state = ExecState::Halted;
            translate_uc_error(e).into()
        })
    }

    /// Step exactly one instruction. Installs a code hook that halts
    /// emulation on the second instruction entry; if that hook observes a
    /// *third* entry, the emulator escaped its bounds.
    pub fn step_into(&mut self) -> Result<(), Error> {
        let (_trap, captured) = self.trace_mem_unmapped()?;

        let escaped: Rc<RefCell<bool>> = Rc::new(RefCell::new(false));
        let hit_count: Rc<RefCell<u32>> = Rc::new(RefCell::new(0));
        let esc = escaped.clone();
        let hc = hit_count.clone();
        let uc_for_stop = self.uc.clone();
        let code_reg = self.hook_code(Box::new(move |_addr, _size| {
            let mut count = hc.borrow_mut();
            match *count {
                0 => {}
                1 => {
                    let _ = uc_for_stop.borrow_mut().emu_stop();
                }
                _ => *esc.borrow_mut() = true,
            }
            *count += 1;
        }))?;

        let insn = self.get_current_instruction()?;
        let ip = self.get_instruction_pointer()?;
        let end = VA(ip.0 + insn.length as u64);

        self.state = ExecState::Running;
        let result = self.uc.borrow_mut().emu_start(ip.0, end.0, 0, 0);
        self.state = ExecState::Idle;

        drop(code_reg);

        if let Some(err) = captured.borrow_mut().take() {
            self.state = ExecState::Halted;
            return Err(err.into());
        }
        if let Err(e) = result {
            self.state = ExecState::Halted;
            return Err(translate_uc_error(e).into());
        }
        if *escaped.borrow() {
            self.state = ExecState::Halted;
            return Err(EmulatorError::EmulatorEscaped.into());
        }

        Ok(())
    }

    /// Step over the current instruction: if it's a `CALL`, run to just
    /// past it (skipping the callee); otherwise identical to `step_into`.
    pub fn step_over(&mut self) -> Result<(), Error> {
        let insn = self.get_current_instruction()?;
        if is_call(&insn) {
            let ip = self.get_instruction_pointer()?;
            self.run_to(VA(ip.0 + insn.length as u64))
        } else {
            self.step_into()
        }
    }

    /// Decode exactly one instruction starting at `va`.
    pub fn read_instruction(&self, va: VA) -> Result<zydis::DecodedInstruction, Error> {
        let buf = self
            .mem_read(va, self.config.max_insn_size as u64)
            .map_err(|_| EmulatorError::InvalidMemoryRead)?;
        self.decoder
            .decode(&buf)?
            .ok_or_else(|| EmulatorError::FailedToDisassemble.into())
    }

    pub fn get_current_instruction(&self) -> Result<zydis::DecodedInstruction, Error> {
        let ip = self.get_instruction_pointer()?;
        self.read_instruction(ip)
    }

    /// Render `va` as a fixed-width hex-bytes prefix (padded to
    /// `config.num_opcode_bytes`) followed by mnemonic + operands.
    pub fn format_address(&self, va: VA) -> Result<(String, u64), Error> {
        let insn = self.read_instruction(va)?;
        let num_bytes = self.config.num_opcode_bytes;
        let n = std::cmp::min(insn.length as usize, num_bytes);
        let data = self.mem_read(va, n as u64)?;

        let mut prefix: Vec<String> = data.iter().map(|b| format!("{:02X}", b)).collect();
        for _ in data.len()..num_bytes {
            prefix.push("  ".to_string());
        }

        let formatter = zydis::Formatter::new(zydis::FormatterStyle::Intel)?;
        let mut raw_buffer = [0u8; 256];
        let mut buffer = zydis::OutputBuffer::new(&mut raw_buffer[..]);
        formatter.format_instruction(&insn, &mut buffer, Some(va.0), None)?;

        let text = format!("{}: {} {}", va, prefix.join(" "), buffer);
        Ok((text, u64::from(insn.length)))
    }
}

pub(crate) struct SuspendedHooks {
    mem_read: Option<Rc<RefCell<Multiplexer<MemCallback>>>>,
    mem_write: Option<Rc<RefCell<Multiplexer<MemCallback>>>>,
    mem_unmapped: Option<Rc<RefCell<Multiplexer<UnmappedCallback>>>>,
    code: Option<Rc<RefCell<Multiplexer<CodeCallback>>>>,
}

pub fn is_call(insn: &zydis::DecodedInstruction) -> bool {
    insn.mnemonic == zydis::Mnemonic::CALL
}

pub fn is_ret(insn: &zydis::DecodedInstruction) -> bool {
    matches!(insn.mnemonic, zydis::Mnemonic::RET)
}

pub fn is_iret(insn: &zydis::DecodedInstruction) -> bool {
    matches!(insn.mnemonic, zydis::Mnemonic::IRET | zydis::Mnemonic::IRETD | zydis::Mnemonic::IRETQ)
}

pub fn is_jump(insn: &zydis::DecodedInstruction) -> bool {
    matches!(
        insn.mnemonic,
        zydis::Mnemonic::JMP
            | zydis::Mnemonic::JZ
            | zydis::Mnemonic::JNZ
            | zydis::Mnemonic::JB
            | zydis::Mnemonic::JBE
            | zydis::Mnemonic::JA
            | zydis::Mnemonic::JAE
            | zydis::Mnemonic::JL
            | zydis::Mnemonic::JLE
            | zydis::Mnemonic::JG
            | zydis::Mnemonic::JGE
            | zydis::Mnemonic::JO
            | zydis::Mnemonic::JNO
            | zydis::Mnemonic::JS
            | zydis::Mnemonic::JNS
            | zydis::Mnemonic::JP
            | zydis::Mnemonic::JNP
            | zydis::Mnemonic::JCXZ
            | zydis::Mnemonic::JECXZ
            | zydis::Mnemonic::JRCXZ
    )
}

pub fn is_basic_block_terminator(insn: &zydis::DecodedInstruction) -> bool {
    is_call(insn) || is_jump(insn) || is_ret(insn) || is_iret(insn)
}

impl AddressSpace for Emulator {
    fn mode(&self) -> Mode {
        self.mode
    }

    fn mem_map(&mut self, va: VA, length: u64, name: &str) -> Result<(), Error> {
        let length = round_up_to_page(length);
        if self.maps.borrow().iter().any(|r| r.contains(va) || r.contains(VA(va.0 + length - 1))) {
            return Err(AddressSpaceError::AlreadyMapped(va.0, length).into());
        }
        self.uc
            .borrow_mut()
            .mem_map(va.0, length as usize, Permission::ALL)
            .map_err(EmulatorError::Engine)?;
        self.maps.borrow_mut().push(MemoryRegion {
            address: va,
            length,
            name: name.to_string(),
        });
        Ok(())
    }

    fn mem_unmap(&mut self, va: VA, length: u64) -> Result<(), Error> {
        let mut maps = self.maps.borrow_mut();
        let idx = maps
            .iter()
            .position(|r| r.address == va && r.length == length)
            .ok_or_else(|| AddressSpaceError::InvalidArgument(va.0, length))?;
        self.uc
            .borrow_mut()
            .mem_unmap(va.0, length as usize)
            .map_err(EmulatorError::Engine)?;
        maps.remove(idx);
        Ok(())
    }

    fn mem_read(&self, va: VA, length: u64) -> Result<Vec<u8>, Error> {
        let mut buf = vec![0u8; length as usize];
        self.uc
            .borrow()
            .mem_read(va.0, &mut buf)
            .map_err(|e| translate_uc_error(e))?;
        Ok(buf)
    }

    fn mem_write(&mut self, va: VA, data: &[u8]) -> Result<(), Error> {
        self.uc
            .borrow_mut()
            .mem_write(va.0, data)
            .map_err(|e| translate_uc_error(e).into())
    }

    fn get_maps(&self) -> Vec<MemoryRegion> {
        self.maps.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::get_shellcode32_workspace;

    #[test]
    fn s3_step_into_advances_past_a_two_byte_nop() {
        // NOP; RET
        let ws = get_shellcode32_workspace(b"\x90\xC3");
        let mut emu = Emulator::new(&ws).unwrap();
        emu.set_instruction_pointer(ws.base_address()).unwrap();

        emu.step_into().unwrap();
        assert_eq!(emu.get_instruction_pointer().unwrap(), ws.base_address() + 1u64);
    }

    #[test]
    fn step_over_non_call_matches_step_into() {
        let ws = get_shellcode32_workspace(b"\x90\x90\xC3");
        let mut a = Emulator::new(&ws).unwrap();
        let mut b = Emulator::new(&ws).unwrap();
        a.set_instruction_pointer(ws.base_address()).unwrap();
        b.set_instruction_pointer(ws.base_address()).unwrap();

        a.step_into().unwrap();
        b.step_over().unwrap();

        assert_eq!(a.get_instruction_pointer().unwrap(), b.get_instruction_pointer().unwrap());
    }
}
