//! Helpers shared by unit tests and doctests across the crate: synthetic
//! workspace fixtures and a `fern`-backed logger, mirroring the teacher's
//! own `test::init_logging`/`test::get_shellcode32_workspace` pattern.

use crate::arch::{Mode, RVA, VA};
use crate::loader::{self, DataDirectoryEntry, LoadedModule, PeImage, RawSection};
use crate::workspace::Workspace;
use std::collections::HashMap;

/// Base address a synthetic shellcode "module" is mapped at. Arbitrary,
/// but non-zero so off-by-one arithmetic against VA(0) isn't masked.
const SHELLCODE_BASE: u64 = 0x1000_0000;

fn shellcode_workspace(mode: Mode, buf: &[u8]) -> Workspace {
    let mut ws = Workspace::new(mode).build().expect("failed to build workspace");
    let base = VA(SHELLCODE_BASE);

    ws.mem_map(base, buf.len() as u64, "shellcode")
        .expect("failed to map shellcode");
    ws.mem_write(base, buf).expect("failed to write shellcode");

    ws.add_loaded_module(LoadedModule {
        name: "shellcode".to_string(),
        base_address: base,
        entry_point: base,
        imports: HashMap::new(),
        exports_by_name: HashMap::new(),
        exports_by_ordinal: HashMap::new(),
    });

    ws
}

/// Build a 32-bit workspace with `buf` mapped as a single executable
/// region at a fixed base, for tests that only care about a handful of
/// raw instructions.
pub fn get_shellcode32_workspace(buf: &[u8]) -> Workspace {
    shellcode_workspace(Mode::M32, buf)
}

pub fn get_shellcode64_workspace(buf: &[u8]) -> Workspace {
    shellcode_workspace(Mode::M64, buf)
}

/// Hand-build a 32-bit `PeImage` whose import/export directories match
/// the corpus's worked scenarios (one by-name import, one by-ordinal
/// import, two exported functions, one of them named) and load it,
/// bypassing `goblin`/`PeImage::from_goblin` entirely since the point is
/// to exercise the loader's own byte-level directory walk.
pub fn build_synthetic_pe_module() -> (Workspace, usize) {
    const SECTION_VA: u32 = 0x2000;

    const IMPORT_DIR_OFF: usize = 0x00; // two 20-byte ImageImportDirectory entries
    const EXPORT_DIR_OFF: usize = 0x28; // 40-byte ImageExportDirectory
    const FUNCS_OFF: usize = 0x50; // AddressOfFunctions: 2 x u32
    const NAMES_OFF: usize = 0x58; // AddressOfNames: 1 x u32
    const ORDINALS_OFF: usize = 0x5C; // AddressOfNameOrdinals: 1 x u16
    const NAME_FOO_OFF: usize = 0x5E; // "Foo\0"
    const MODNAME_OFF: usize = 0x62; // "kernel32.dll\0"
    const THUNK_OFF: usize = 0x70; // thunk table: by-name, by-ordinal, terminator
    const IMPORT_BY_NAME_OFF: usize = 0x7C; // hint:u16 + "GetProcAddress\0"
    const SECTION_LEN: usize = 0x8E;

    let mut buf = vec![0u8; SECTION_LEN];
    let rva = |off: usize| SECTION_VA + off as u32;

    // import directory: one real entry, then an all-zero terminator entry.
    buf[IMPORT_DIR_OFF..IMPORT_DIR_OFF + 4].copy_from_slice(&rva(THUNK_OFF).to_le_bytes());
    buf[IMPORT_DIR_OFF + 12..IMPORT_DIR_OFF + 16].copy_from_slice(&rva(MODNAME_OFF).to_le_bytes());
    buf[IMPORT_DIR_OFF + 16..IMPORT_DIR_OFF + 20].copy_from_slice(&rva(THUNK_OFF).to_le_bytes());
    // entry at IMPORT_DIR_OFF + 20 is left all-zero: the terminator.

    // export directory.
    buf[EXPORT_DIR_OFF + 16..EXPORT_DIR_OFF + 20].copy_from_slice(&1u32.to_le_bytes()); // Base
    buf[EXPORT_DIR_OFF + 20..EXPORT_DIR_OFF + 24].copy_from_slice(&2u32.to_le_bytes()); // NumberOfFunctions
    buf[EXPORT_DIR_OFF + 24..EXPORT_DIR_OFF + 28].copy_from_slice(&1u32.to_le_bytes()); // NumberOfNames
    buf[EXPORT_DIR_OFF + 28..EXPORT_DIR_OFF + 32].copy_from_slice(&rva(FUNCS_OFF).to_le_bytes());
    buf[EXPORT_DIR_OFF + 32..EXPORT_DIR_OFF + 36].copy_from_slice(&rva(NAMES_OFF).to_le_bytes());
    buf[EXPORT_DIR_OFF + 36..EXPORT_DIR_OFF + 40].copy_from_slice(&rva(ORDINALS_OFF).to_le_bytes());

    // AddressOfFunctions: ordinal Base+0 -> 0x1000, Base+1 -> 0x2000.
    buf[FUNCS_OFF..FUNCS_OFF + 4].copy_from_slice(&0x1000u32.to_le_bytes());
    buf[FUNCS_OFF + 4..FUNCS_OFF + 8].copy_from_slice(&0x2000u32.to_le_bytes());

    // "Foo" names the function at AddressOfFunctions[1] == 0x2000.
    buf[NAMES_OFF..NAMES_OFF + 4].copy_from_slice(&rva(NAME_FOO_OFF).to_le_bytes());
    buf[ORDINALS_OFF..ORDINALS_OFF + 2].copy_from_slice(&1u16.to_le_bytes());
    buf[NAME_FOO_OFF..NAME_FOO_OFF + 4].copy_from_slice(b"Foo\0");

    buf[MODNAME_OFF..MODNAME_OFF + 13].copy_from_slice(b"kernel32.dll\0");

    // thunk table: a by-name import, a by-ordinal import (ordinal 0x42), terminator.
    buf[THUNK_OFF..THUNK_OFF + 4].copy_from_slice(&rva(IMPORT_BY_NAME_OFF).to_le_bytes());
    buf[THUNK_OFF + 4..THUNK_OFF + 8].copy_from_slice(&0x8000_0042u32.to_le_bytes());
    // THUNK_OFF + 8..+12 is left all-zero: the terminator.

    buf[IMPORT_BY_NAME_OFF..IMPORT_BY_NAME_OFF + 2].copy_from_slice(&0x123u16.to_le_bytes());
    buf[IMPORT_BY_NAME_OFF + 2..IMPORT_BY_NAME_OFF + 17].copy_from_slice(b"GetProcAddress\0");

    let mut data_directory = [DataDirectoryEntry::default(); 16];
    data_directory[0] = DataDirectoryEntry {
        virtual_address: rva(EXPORT_DIR_OFF),
        size: 0,
    };
    data_directory[1] = DataDirectoryEntry {
        virtual_address: rva(IMPORT_DIR_OFF),
        size: 0,
    };

    let image = PeImage {
        image_base: VA(0x0040_0000),
        address_of_entry_point: RVA(0x1000),
        data_directory,
        sections: vec![RawSection {
            name: "synth".to_string(),
            virtual_address: RVA::from(SECTION_VA),
            virtual_size: SECTION_LEN as u32,
            data: &buf,
        }],
    };

    let mut ws = Workspace::new(Mode::M32).build().expect("failed to build workspace");
    let idx = loader::load_pe(&mut ws, "test.dll", &image).expect("failed to load synthetic PE");
    (ws, idx)
}

/// Configure a global `fern` logger at `DEBUG`, matching the teacher's own
/// test harness. Safe to call more than once per test binary; later calls
/// simply fail to re-apply and are ignored.
pub fn init_logging() {
    let log_level = log::LevelFilter::Debug;
    let _ = fern::Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!(
                "{} [{:5}] {} {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                if log_level == log::LevelFilter::Trace {
                    record.target()
                } else {
                    ""
                },
                message
            ))
        })
        .level(log_level)
        .chain(std::io::stderr())
        .apply();
}
