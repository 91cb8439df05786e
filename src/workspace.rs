//! The Workspace (§4.6): the root object. Owns `arch`/`mode`, the loaded
//! modules, the address space backing them, and a default artifact sink
//! for callers that don't want to manage their own.
//!
//! Everything else in the crate is reached *through* a `Workspace`: the
//! `Emulator` is spun up from one (`get_emulator`), the `Module Loader`
//! populates one, and the exploration engine walks a function found in
//! one.

use std::cell::Cell;
use std::collections::HashSet;

use failure::{Error, Fail};

use crate::arch::{Arch, Mode, VA};
use crate::artifacts::{ArtifactCollection, BasicBlock, CallCrossReference, JumpCrossReference, SetArtifactCollection};
use crate::aspace::{AddressSpace, MemoryRegion, RegionAddressSpace};
use crate::config::Config;
use crate::emulator::{make_decoder, Emulator};
use crate::loader::LoadedModule;

#[derive(Debug, Fail)]
pub enum WorkspaceError {
    #[fail(display = "failed to disassemble instruction at the given address")]
    FailedToDisassemble,
}

/// The kind of code cross-reference `Workspace::make_code_cross_reference`
/// records; distinguishes the two xref artifact types that share a
/// `{from, to}` shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrossReferenceKind {
    Call,
    Jump,
}

pub struct WorkspaceBuilder {
    mode: Mode,
    config: Config,
}

impl WorkspaceBuilder {
    pub fn with_config(self, config: Config) -> WorkspaceBuilder {
        WorkspaceBuilder { config, ..self }
    }

    pub fn build(self) -> Result<Workspace, Error> {
        let decoder = make_decoder(self.mode)?;
        Ok(Workspace {
            arch: Arch::X86,
            mode: self.mode,
            config: self.config,
            address_space: RegionAddressSpace::new(self.mode),
            loaded_modules: Vec::new(),
            functions: HashSet::new(),
            artifacts: Box::new(SetArtifactCollection::default()),
            decoder,
            default_stack_pointer: Cell::new(VA(0)),
        })
    }
}

/// Root object: `(arch, mode)` fixed at construction, the address space
/// every `mem_*` call and loaded module's sections live in, and the
/// workspace-default artifact sink `make_*` writes into.
pub struct Workspace {
    arch: Arch,
    mode: Mode,
    config: Config,
    address_space: RegionAddressSpace,
    loaded_modules: Vec<LoadedModule>,
    /// Discovered function starts. Distinct from `artifacts`: a function
    /// address is workspace bookkeeping, not one of the five xref/block
    /// artifact shapes in §4.8.
    functions: HashSet<VA>,
    artifacts: Box<dyn ArtifactCollection>,
    decoder: zydis::Decoder,
    /// Legacy: a caller-set stack pointer value, for code that predates
    /// (or doesn't want) a real `Emulator`. New analyses should track the
    /// stack pointer through `Emulator::get_stack_pointer` instead.
    default_stack_pointer: Cell<VA>,
}

impl Workspace {
    pub fn new(mode: Mode) -> WorkspaceBuilder {
        WorkspaceBuilder {
            mode,
            config: Config::default(),
        }
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Spin up a fresh `Emulator` whose memory starts as an exact copy of
    /// this workspace's address space.
    pub fn get_emulator(&self) -> Result<Emulator, Error> {
        Emulator::new(self)
    }

    pub fn add_loaded_module(&mut self, module: LoadedModule) -> usize {
        self.loaded_modules.push(module);
        self.loaded_modules.len() - 1
    }

    pub fn loaded_modules(&self) -> &[LoadedModule] {
        &self.loaded_modules
    }

    /// The base address of the first loaded module, if any. A convenience
    /// for callers (tests, simple shellcode workspaces) that only ever
    /// load one module.
    pub fn base_address(&self) -> VA {
        self.loaded_modules
            .first()
            .map(|m| m.base_address)
            .unwrap_or(VA(0))
    }

    /// Record `va` as a discovered function start. Idempotent, like the
    /// rest of the artifact sink: returns whether this was newly added.
    pub fn make_function(&mut self, va: VA) -> bool {
        self.functions.insert(va)
    }

    pub fn functions(&self) -> impl Iterator<Item = &VA> {
        self.functions.iter()
    }

    pub fn make_basic_block(&mut self, start: VA, end: VA) {
        self.artifacts.add_basic_block(BasicBlock { start, end });
    }

    pub fn make_code_cross_reference(&mut self, from: VA, to: VA, kind: CrossReferenceKind) {
        match kind {
            CrossReferenceKind::Call => self.artifacts.add_call_xref(CallCrossReference { from, to }),
            CrossReferenceKind::Jump => self.artifacts.add_jump_xref(JumpCrossReference { from, to }),
        }
    }

    /// The workspace's own artifact sink, written to by `make_basic_block`
    /// and `make_code_cross_reference`. Separate from whatever sink a
    /// caller passes to `exploration::explore_function` directly.
    pub fn artifacts(&self) -> &dyn ArtifactCollection {
        self.artifacts.as_ref()
    }

    pub fn artifacts_mut(&mut self) -> &mut dyn ArtifactCollection {
        self.artifacts.as_mut()
    }

    /// Decode exactly one instruction at `va`.
    pub fn disassemble_instruction(&self, va: VA) -> Result<zydis::DecodedInstruction, Error> {
        let buf = self.mem_read(va, self.config.max_insn_size as u64)?;
        self.decoder
            .decode(&buf)?
            .ok_or_else(|| WorkspaceError::FailedToDisassemble.into())
    }

    pub fn get_instruction_length(&self, va: VA) -> Result<u64, Error> {
        Ok(u64::from(self.disassemble_instruction(va)?.length))
    }

    /// Linearly decode straight-line instructions starting at `va`,
    /// stopping at (and including) the first basic-block terminator. Pure
    /// memory-backed disassembly: no emulation, no branch following.
    pub fn disassemble(&self, va: VA) -> Result<Vec<zydis::DecodedInstruction>, Error> {
        let mut out = Vec::new();
        let mut cur = va;
        loop {
            let insn = self.disassemble_instruction(cur)?;
            let is_terminator = crate::emulator::is_basic_block_terminator(&insn);
            let length = u64::from(insn.length);
            out.push(insn);
            if is_terminator {
                break;
            }
            cur = cur + length;
        }
        Ok(out)
    }

    /// Legacy workspace-wide stack pointer bookkeeping; exploration should
    /// prefer `Emulator::get_stack_pointer`/`set_stack_pointer`, which
    /// reflect a real register file rather than a caller-set value.
    pub fn get_stack_pointer(&self) -> VA {
        self.default_stack_pointer.get()
    }

    pub fn set_stack_pointer(&self, va: VA) {
        self.default_stack_pointer.set(va);
    }
}

impl AddressSpace for Workspace {
    fn mode(&self) -> Mode {
        self.mode
    }

    fn mem_map(&mut self, va: VA, length: u64, name: &str) -> Result<(), Error> {
        self.address_space.mem_map(va, length, name)
    }

    fn mem_unmap(&mut self, va: VA, length: u64) -> Result<(), Error> {
        self.address_space.mem_unmap(va, length)
    }

    fn mem_read(&self, va: VA, length: u64) -> Result<Vec<u8>, Error> {
        self.address_space.mem_read(va, length)
    }

    fn mem_write(&mut self, va: VA, data: &[u8]) -> Result<(), Error> {
        self.address_space.mem_write(va, data)
    }

    fn get_maps(&self) -> Vec<MemoryRegion> {
        self.address_space.get_maps()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::get_shellcode32_workspace;

    #[test]
    fn disassemble_runs_until_a_terminator() {
        let ws = get_shellcode32_workspace(b"\x90\x90\xC3");
        let insns = ws.disassemble(ws.base_address()).unwrap();
        assert_eq!(insns.len(), 3);
        assert_eq!(insns.last().unwrap().mnemonic, zydis::Mnemonic::RET);
    }

    #[test]
    fn make_function_is_idempotent() {
        let mut ws = Workspace::new(Mode::M32).build().unwrap();
        assert!(ws.make_function(VA(0x1000)));
        assert!(!ws.make_function(VA(0x1000)));
        assert_eq!(ws.functions().count(), 1);
    }
}
