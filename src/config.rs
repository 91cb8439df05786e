//! Process-wide tunables, sourced however the caller likes (file, env, CLI
//! flags) and handed in as a plain value — this crate never reads them
//! itself.

/// Formatting and strictness knobs consulted by the loader, emulator, and
/// exploration engine.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of opcode bytes `Emulator::format_address` pads its hex
    /// prefix out to.
    pub num_opcode_bytes: usize,

    /// Maximum number of bytes read before giving up on decoding a single
    /// instruction.
    pub max_insn_size: usize,

    /// When true, loader/analysis failures abort instead of being logged
    /// and skipped.
    pub strict_mode: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            num_opcode_bytes: 8,
            max_insn_size: 0x10,
            strict_mode: false,
        }
    }
}

impl Config {
    pub fn with_num_opcode_bytes(mut self, n: usize) -> Config {
        self.num_opcode_bytes = n;
        self
    }

    pub fn with_strict_mode(mut self, strict: bool) -> Config {
        self.strict_mode = strict;
        self
    }
}
