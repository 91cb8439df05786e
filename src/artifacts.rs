//! Artifact value types (§3) and the append-only sink they flow into
//! (§4.8).

use std::collections::HashSet;

use log::info;

use crate::arch::VA;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BasicBlock {
    pub start: VA,
    pub end: VA,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallCrossReference {
    pub from: VA,
    pub to: VA,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JumpCrossReference {
    pub from: VA,
    pub to: VA,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryReadCrossReference {
    pub insn: VA,
    pub target: VA,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryWriteCrossReference {
    pub insn: VA,
    pub target: VA,
}

/// The stack delta computed at a function's `RET`/`IRET`, surfaced rather
/// than discarded (see the open question in DESIGN.md).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionFacts {
    pub start: VA,
    pub stack_delta: i64,
}

/// Append-only sink for discovered facts. Every `add_*` is idempotent:
/// adding an artifact that's already present is a no-op.
pub trait ArtifactCollection {
    fn add_basic_block(&mut self, bb: BasicBlock);
    fn add_call_xref(&mut self, xref: CallCrossReference);
    fn add_jump_xref(&mut self, xref: JumpCrossReference);
    fn add_memory_read_xref(&mut self, xref: MemoryReadCrossReference);
    fn add_memory_write_xref(&mut self, xref: MemoryWriteCrossReference);
    fn add_function_facts(&mut self, facts: FunctionFacts);
}

/// Default implementation: logs each artifact, keeps nothing. Useful when
/// the caller only wants to observe exploration via logs (or supplies
/// their own durable sink and just wants a no-op default while wiring
/// things up).
#[derive(Default)]
pub struct LoggingArtifactCollection;

impl ArtifactCollection for LoggingArtifactCollection {
    fn add_basic_block(&mut self, bb: BasicBlock) {
        info!("basic block: {} - {}", bb.start, bb.end);
    }

    fn add_call_xref(&mut self, xref: CallCrossReference) {
        info!("call: {} -> {}", xref.from, xref.to);
    }

    fn add_jump_xref(&mut self, xref: JumpCrossReference) {
        info!("jump: {} -> {}", xref.from, xref.to);
    }

    fn add_memory_read_xref(&mut self, xref: MemoryReadCrossReference) {
        info!("mem read: {} @ {}", xref.insn, xref.target);
    }

    fn add_memory_write_xref(&mut self, xref: MemoryWriteCrossReference) {
        info!("mem write: {} @ {}", xref.insn, xref.target);
    }

    fn add_function_facts(&mut self, facts: FunctionFacts) {
        info!("function {}: stack delta 0x{:x}", facts.start, facts.stack_delta);
    }
}

/// An in-memory implementation that dedupes into sets, for callers that
/// want to inspect results directly rather than scrape logs.
#[derive(Default)]
pub struct SetArtifactCollection {
    pub basic_blocks: HashSet<BasicBlock>,
    pub call_xrefs: HashSet<CallCrossReference>,
    pub jump_xrefs: HashSet<JumpCrossReference>,
    pub memory_read_xrefs: HashSet<MemoryReadCrossReference>,
    pub memory_write_xrefs: HashSet<MemoryWriteCrossReference>,
    pub function_facts: HashSet<FunctionFacts>,
}

impl ArtifactCollection for SetArtifactCollection {
    fn add_basic_block(&mut self, bb: BasicBlock) {
        self.basic_blocks.insert(bb);
    }

    fn add_call_xref(&mut self, xref: CallCrossReference) {
        self.call_xrefs.insert(xref);
    }

    fn add_jump_xref(&mut self, xref: JumpCrossReference) {
        self.jump_xrefs.insert(xref);
    }

    fn add_memory_read_xref(&mut self, xref: MemoryReadCrossReference) {
        self.memory_read_xrefs.insert(xref);
    }

    fn add_memory_write_xref(&mut self, xref: MemoryWriteCrossReference) {
        self.memory_write_xrefs.insert(xref);
    }

    fn add_function_facts(&mut self, facts: FunctionFacts) {
        self.function_facts.insert(facts);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adding_the_same_artifact_twice_is_a_no_op() {
        let mut ac = SetArtifactCollection::default();
        let bb = BasicBlock {
            start: VA(0x1000),
            end: VA(0x1010),
        };
        ac.add_basic_block(bb);
        ac.add_basic_block(bb);
        assert_eq!(ac.basic_blocks.len(), 1);
    }
}
