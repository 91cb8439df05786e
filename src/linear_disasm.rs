//! The Linear Disassembler (§4.9, ambient): a thin event-stream layer over
//! `Workspace::disassemble_instruction` for external control-flow analyses
//! to subscribe to. Unlike the exploration engine, it never touches an
//! `Emulator` — branch targets come from decoding an immediate operand,
//! not from executing anything, so a `CALL`'s target here is whatever the
//! instruction's encoding says, even if that's wrong (an indirect call,
//! a computed jump table) — those simply produce no `on_jump` event.
//!
//! Subscriptions follow the same `Registration`/`Multiplexer` scoping as
//! the emulator's hooks: unsubscribing is `drop`-based, and callbacks for
//! one event fire in insertion order.

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

use failure::Error;

use crate::arch::VA;
use crate::emulator::{is_basic_block_terminator, is_call, is_iret, is_jump, is_ret};
use crate::hook::{add_hook, Multiplexer, Registration};
use crate::workspace::Workspace;

/// The three flavors of branch `on_jump` reports, mirroring the
/// distinction drawn by the exploration engine's artifact kinds without
/// reusing them directly: a linear disassembly has no emulator to confirm
/// a call actually returns, so it reports what the encoding says and lets
/// the subscriber decide what to do with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpKind {
    Conditional,
    Unconditional,
    Call,
}

pub type InstructionCallback = Box<dyn FnMut(&zydis::DecodedInstruction)>;
pub type BasicBlockCallback = Box<dyn FnMut(VA, VA)>;
pub type JumpCallback = Box<dyn FnMut(&zydis::DecodedInstruction, VA, VA, JumpKind)>;

fn jump_kind(insn: &zydis::DecodedInstruction) -> Option<JumpKind> {
    if is_call(insn) {
        Some(JumpKind::Call)
    } else if insn.mnemonic == zydis::Mnemonic::JMP {
        Some(JumpKind::Unconditional)
    } else if is_jump(insn) {
        Some(JumpKind::Conditional)
    } else {
        None
    }
}

/// Resolve a branch's target from its immediate operand, if it has one.
/// `None` for indirect branches (`call eax`, `jmp [table + ecx*4]`) — the
/// caller simply gets no `on_jump` for those.
fn branch_target(insn: &zydis::DecodedInstruction, at: VA) -> Option<VA> {
    insn.operands
        .iter()
        .find(|op| op.ty == zydis::OperandType::IMMEDIATE)
        .and_then(|op| insn.calc_absolute_address(at.0, op).ok())
        .map(VA)
}

/// Owns the three event multiplexers for one walk. Cheap to construct;
/// callers typically make one per `AnalyzeFunction`-style pass.
pub struct LinearDisassembler<'a> {
    ws: &'a Workspace,
    instruction: Rc<RefCell<Multiplexer<InstructionCallback>>>,
    basic_block: Rc<RefCell<Multiplexer<BasicBlockCallback>>>,
    jump: Rc<RefCell<Multiplexer<JumpCallback>>>,
}

impl<'a> LinearDisassembler<'a> {
    pub fn new(ws: &'a Workspace) -> LinearDisassembler<'a> {
        LinearDisassembler {
            ws,
            instruction: Rc::new(RefCell::new(Multiplexer::new())),
            basic_block: Rc::new(RefCell::new(Multiplexer::new())),
            jump: Rc::new(RefCell::new(Multiplexer::new())),
        }
    }

    pub fn on_instruction(&self, f: InstructionCallback) -> Registration<InstructionCallback> {
        add_hook(&self.instruction, f)
    }

    pub fn on_basic_block(&self, f: BasicBlockCallback) -> Registration<BasicBlockCallback> {
        add_hook(&self.basic_block, f)
    }

    pub fn on_jump(&self, f: JumpCallback) -> Registration<JumpCallback> {
        add_hook(&self.jump, f)
    }

    /// Walk every basic block reachable from `va` by following immediate
    /// branch targets: a conditional jump or call queues both its target
    /// and its fallthrough; an unconditional jump queues only its target;
    /// `RET`/`IRET` end that path. Already-visited block starts are not
    /// re-walked, so a diamond in the control flow fires its shared
    /// successor's events exactly once.
    pub fn explore_function(&self, va: VA) -> Result<(), Error> {
        let mut visited: HashSet<VA> = HashSet::new();
        let mut worklist: Vec<VA> = vec![va];

        while let Some(block_start) = worklist.pop() {
            if !visited.insert(block_start) {
                continue;
            }

            let mut cur = block_start;
            loop {
                let insn = self.ws.disassemble_instruction(cur)?;
                self.instruction.borrow_mut().dispatch_ref(&insn);

                if !is_basic_block_terminator(&insn) {
                    cur = cur + u64::from(insn.length);
                    continue;
                }

                self.basic_block.borrow_mut().dispatch2(block_start, cur);

                if let Some(kind) = jump_kind(&insn) {
                    if let Some(target) = branch_target(&insn, cur) {
                        self.jump.borrow_mut().dispatch_ref4(&insn, block_start, target, kind);
                        if !visited.contains(&target) {
                            worklist.push(target);
                        }
                    }
                }

                let falls_through = !is_ret(&insn) && !is_iret(&insn) && jump_kind(&insn) != Some(JumpKind::Unconditional);
                if falls_through {
                    let after = cur + u64::from(insn.length);
                    if !visited.contains(&after) {
                        worklist.push(after);
                    }
                }

                break;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::get_shellcode32_workspace;
    use std::cell::RefCell as StdRefCell;
    use std::rc::Rc as StdRc;

    #[test]
    fn straight_line_code_is_one_basic_block() {
        let ws = get_shellcode32_workspace(b"\x90\x90\xC3");
        let base = ws.base_address();
        let ld = LinearDisassembler::new(&ws);

        let insn_count = StdRc::new(StdRefCell::new(0u32));
        let ic = insn_count.clone();
        let _r1 = ld.on_instruction(Box::new(move |_insn| *ic.borrow_mut() += 1));

        let blocks: StdRc<StdRefCell<Vec<(VA, VA)>>> = StdRc::new(StdRefCell::new(Vec::new()));
        let b = blocks.clone();
        let _r2 = ld.on_basic_block(Box::new(move |start, end| b.borrow_mut().push((start, end))));

        ld.explore_function(base).unwrap();

        assert_eq!(*insn_count.borrow(), 3);
        assert_eq!(*blocks.borrow(), vec![(base, base + 2u64)]);
    }

    #[test]
    fn unconditional_jump_does_not_queue_a_fallthrough() {
        // jmp +1 (skips one unreachable filler byte); unreachable nop; nop; ret
        let ws = get_shellcode32_workspace(b"\xEB\x01\x90\x90\xC3");
        let base = ws.base_address();
        let ld = LinearDisassembler::new(&ws);

        let jumps: StdRc<StdRefCell<Vec<(VA, VA, JumpKind)>>> = StdRc::new(StdRefCell::new(Vec::new()));
        let j = jumps.clone();
        let _r = ld.on_jump(Box::new(move |_insn, from_bb, target, kind| j.borrow_mut().push((from_bb, target, kind))));

        let insn_count = StdRc::new(StdRefCell::new(0u32));
        let ic = insn_count.clone();
        let _r2 = ld.on_instruction(Box::new(move |_insn| *ic.borrow_mut() += 1));

        ld.explore_function(base).unwrap();

        assert_eq!(*jumps.borrow(), vec![(base, base + 3u64, JumpKind::Unconditional)]);
        // the jmp itself, plus nop+ret at the target: never the filler byte.
        assert_eq!(*insn_count.borrow(), 3);
    }

    #[test]
    fn conditional_jump_queues_both_target_and_fallthrough() {
        // jz +3 -> base+5; fallthrough: nop; ret; (padding); target: ret
        let ws = get_shellcode32_workspace(b"\x74\x03\x90\xC3\x90\xC3");
        let base = ws.base_address();
        let ld = LinearDisassembler::new(&ws);

        let blocks: StdRc<StdRefCell<Vec<(VA, VA)>>> = StdRc::new(StdRefCell::new(Vec::new()));
        let b = blocks.clone();
        let _r1 = ld.on_basic_block(Box::new(move |start, end| b.borrow_mut().push((start, end))));

        let jumps: StdRc<StdRefCell<Vec<JumpKind>>> = StdRc::new(StdRefCell::new(Vec::new()));
        let j = jumps.clone();
        let _r2 = ld.on_jump(Box::new(move |_insn, _from, _to, kind| j.borrow_mut().push(kind)));

        ld.explore_function(base).unwrap();

        assert_eq!(*jumps.borrow(), vec![JumpKind::Conditional]);
        assert_eq!(blocks.borrow().len(), 3);
        assert!(blocks.borrow().contains(&(base, base)));
        assert!(blocks.borrow().contains(&(base + 2u64, base + 3u64)));
        assert!(blocks.borrow().contains(&(base + 5u64, base + 5u64)));
    }

    #[test]
    fn call_reports_call_kind_and_still_falls_through() {
        let ws = get_shellcode32_workspace(b"\xE8\x00\x00\x00\x00\xC3");
        let base = ws.base_address();
        let ld = LinearDisassembler::new(&ws);

        let jumps: StdRc<StdRefCell<Vec<(VA, JumpKind)>>> = StdRc::new(StdRefCell::new(Vec::new()));
        let j = jumps.clone();
        let _r = ld.on_jump(Box::new(move |_insn, _from, target, kind| j.borrow_mut().push((target, kind))));

        ld.explore_function(base).unwrap();

        assert_eq!(*jumps.borrow(), vec![(base + 5u64, JumpKind::Call)]);
    }

    #[test]
    fn unsubscribing_stops_further_callbacks() {
        let ws = get_shellcode32_workspace(b"\x90\xC3");
        let base = ws.base_address();
        let ld = LinearDisassembler::new(&ws);

        let count = StdRc::new(StdRefCell::new(0u32));
        let c = count.clone();
        let r = ld.on_instruction(Box::new(move |_insn| *c.borrow_mut() += 1));
        drop(r);

        ld.explore_function(base).unwrap();
        assert_eq!(*count.borrow(), 0);
    }
}
