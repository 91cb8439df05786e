//! The Exploration Engine (§4.7), nicknamed "Dora" by its teacher codebase:
//! walks a function by emulation rather than by static disassembly, and
//! records the control- and data-flow artifacts it observes along the
//! way.
//!
//! Static linear disassembly (`linear_disasm`) can't tell a `CALL`'s
//! target without executing it, can't tell which branch of a conditional
//! jump is actually taken, and can't see the memory a `mov [eax], ebx`
//! touches. Emulating the function answers all three, at the cost of
//! only exploring the single path the emulator actually walks.

use std::cell::RefCell;
use std::rc::Rc;

use failure::Error;
use log::warn;

use crate::arch::VA;
use crate::artifacts::{
    ArtifactCollection, BasicBlock, CallCrossReference, FunctionFacts, JumpCrossReference, MemoryReadCrossReference,
    MemoryWriteCrossReference,
};
use crate::emulator::{is_basic_block_terminator, is_call, is_iret, is_ret};
use crate::snapshot::Snapshot;
use crate::workspace::Workspace;

/// Walk the function starting at `va` by emulation, writing every
/// discovered artifact into `artifacts`. Terminates at the function's
/// `RET`/`IRET`, or logs and gives up at the first step it can't recover
/// from (§7: the walk doesn't retry) — unless `ws.config().strict_mode` is
/// set, in which case that step error is propagated instead.
pub fn explore_function(ws: &Workspace, va: VA, artifacts: &mut dyn ArtifactCollection) -> Result<(), Error> {
    let strict_mode = ws.config().strict_mode;
    let mut emu = ws.get_emulator()?;
    emu.set_instruction_pointer(va)?;
    let before_sp = emu.get_stack_pointer()?;
    let mut bb_start = va;

    // The memory hooks run inside a 'static closure dispatched on the
    // emulator's own execution thread; they can't borrow `artifacts`
    // directly, so they buffer into these and the loop below drains the
    // buffer into the real sink after every step.
    let mem_reads: Rc<RefCell<Vec<MemoryReadCrossReference>>> = Rc::new(RefCell::new(Vec::new()));
    let mem_writes: Rc<RefCell<Vec<MemoryWriteCrossReference>>> = Rc::new(RefCell::new(Vec::new()));

    let reads = mem_reads.clone();
    let _read_reg = emu.hook_mem_read(Box::new(move |ip, target, _size, _value| {
        reads.borrow_mut().push(MemoryReadCrossReference { insn: ip, target });
    }))?;

    let writes = mem_writes.clone();
    let _write_reg = emu.hook_mem_write(Box::new(move |ip, target, _size, _value| {
        writes.borrow_mut().push(MemoryWriteCrossReference { insn: ip, target });
    }))?;

    loop {
        let site = emu.get_instruction_pointer()?;
        let insn = match emu.get_current_instruction() {
            Ok(insn) => insn,
            Err(e) => {
                warn!("exploration: failed to disassemble at {}: {}", site, e);
                if strict_mode {
                    return Err(e);
                }
                break;
            }
        };

        if is_call(&insn) {
            // Reveal the call's target by actually stepping into its
            // first instruction, then undo that: we don't want to drag
            // the emulator into the callee, which may be unmapped,
            // unsupported, or simply not part of this function. Suspend
            // our own hooks first so the callee's first instruction
            // doesn't double-fire them.
            let snap = Snapshot::create(&mut emu)?;
            match emu.step_into() {
                Ok(()) => {
                    let target = emu.get_instruction_pointer()?;
                    Snapshot::restore(&mut emu, &snap)?;
                    Snapshot::unhook(&mut emu, &snap)?;
                    artifacts.add_call_xref(CallCrossReference { from: site, to: target });
                }
                Err(e) => {
                    warn!("exploration: failed to probe call target at {}: {}", site, e);
                    Snapshot::restore(&mut emu, &snap)?;
                    Snapshot::unhook(&mut emu, &snap)?;
                    if strict_mode {
                        return Err(e);
                    }
                }
            }
        } else if is_ret(&insn) || is_iret(&insn) {
            let after_sp = emu.get_stack_pointer()?;
            let stack_delta = after_sp.0 as i64 - before_sp.0 as i64;
            artifacts.add_function_facts(FunctionFacts { start: va, stack_delta });
            break;
        }

        let is_terminator = is_basic_block_terminator(&insn);
        if is_terminator {
            artifacts.add_basic_block(BasicBlock { start: bb_start, end: site });
        }

        if let Err(e) = emu.step_over() {
            warn!("exploration: step error at {}: {}", site, e);
            if strict_mode {
                return Err(e);
            }
            break;
        }
        let after = emu.get_instruction_pointer()?;

        for r in mem_reads.borrow_mut().drain(..) {
            artifacts.add_memory_read_xref(r);
        }
        for w in mem_writes.borrow_mut().drain(..) {
            artifacts.add_memory_write_xref(w);
        }

        if is_terminator {
            artifacts.add_jump_xref(JumpCrossReference { from: site, to: after });
            bb_start = after;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Mode;
    use crate::artifacts::SetArtifactCollection;
    use crate::config::Config;
    use crate::test::get_shellcode32_workspace;

    #[test]
    fn s6_basic_block_and_jump_emitted_for_a_three_instruction_block() {
        // nop; nop; jmp +2 (to the byte right after the jmp)
        let ws = get_shellcode32_workspace(b"\x90\x90\xEB\x00\x90\xC3");
        let base = ws.base_address();

        let mut artifacts = SetArtifactCollection::default();
        explore_function(&ws, base, &mut artifacts).unwrap();

        let jmp_va = base + 2u64;
        let target = base + 4u64;

        assert_eq!(artifacts.basic_blocks.len(), 1);
        assert!(artifacts.basic_blocks.contains(&BasicBlock { start: base, end: jmp_va }));

        assert_eq!(artifacts.jump_xrefs.len(), 1);
        assert!(artifacts
            .jump_xrefs
            .contains(&JumpCrossReference { from: jmp_va, to: target }));
    }

    #[test]
    fn s4_call_discovery_via_snapshot_restores_call_site() {
        // call +5 (-> lands 5 bytes past the call, at the nop); nop; ret
        // the callee never executes for real: step_into peeks its first
        // instruction, then the snapshot restores us to the call site.
        let ws = get_shellcode32_workspace(b"\xE8\x00\x00\x00\x00\x90\xC3");
        let base = ws.base_address();

        let mut artifacts = SetArtifactCollection::default();
        explore_function(&ws, base, &mut artifacts).unwrap();

        let call_target = base + 5u64;
        assert!(artifacts
            .call_xrefs
            .contains(&CallCrossReference { from: base, to: call_target }));
    }

    #[test]
    fn function_facts_carries_the_stack_delta_at_ret() {
        // push eax; ret -- before_sp - 4 == after_sp
        let ws = get_shellcode32_workspace(b"\x50\xC3");
        let base = ws.base_address();

        let mut artifacts = SetArtifactCollection::default();
        explore_function(&ws, base, &mut artifacts).unwrap();

        let facts = artifacts
            .function_facts
            .iter()
            .find(|f| f.start == base)
            .expect("expected function facts to be recorded");
        assert_eq!(facts.stack_delta, -4);
    }

    #[test]
    fn memory_xrefs_are_recorded_for_loads_and_stores() {
        // mov eax, 0x10000000 ; mov ebx, [eax] ; mov [eax+4], ebx ; ret
        let mut code = vec![0xB8u8, 0x00, 0x00, 0x00, 0x10]; // mov eax, 0x10000000
        code.extend_from_slice(&[0x8B, 0x18]); // mov ebx, [eax]
        code.extend_from_slice(&[0x89, 0x58, 0x04]); // mov [eax+4], ebx
        code.push(0xC3); // ret

        let ws = get_shellcode32_workspace(&code);
        let base = ws.base_address();

        let mut artifacts = SetArtifactCollection::default();
        explore_function(&ws, base, &mut artifacts).unwrap();

        assert!(!artifacts.memory_read_xrefs.is_empty());
        assert!(!artifacts.memory_write_xrefs.is_empty());
    }

    #[test]
    fn strict_mode_governs_whether_a_step_error_aborts_the_walk() {
        let lenient = get_shellcode32_workspace(b"\x90\xC3");
        let base = lenient.base_address();
        let unmapped = base + 0x2000u64;

        let mut artifacts = SetArtifactCollection::default();
        assert!(explore_function(&lenient, unmapped, &mut artifacts).is_ok());
        assert!(artifacts.basic_blocks.is_empty());

        let mut strict_ws = Workspace::new(Mode::M32)
            .with_config(Config::default().with_strict_mode(true))
            .build()
            .unwrap();
        strict_ws.mem_map(base, 0x1000, "shellcode").unwrap();
        strict_ws.mem_write(base, b"\x90\xC3").unwrap();

        let mut artifacts = SetArtifactCollection::default();
        assert!(explore_function(&strict_ws, unmapped, &mut artifacts).is_err());
    }
}
