//! The Module Loader (§4.2): turns a parsed PE image into a `LoadedModule`
//! registered against a `Workspace`.
//!
//! The container-level parsing — DOS stub, COFF header, optional header,
//! section table — is an external collaborator's job; here that's
//! `goblin`. This module consumes only the four facts goblin hands back
//! (image base, entry point RVA, the 16-slot data directory, and each
//! section's virtual address/size/raw bytes) and does its own byte-level
//! walk of the import and export directories, exactly as the spec
//! describes, rather than trusting goblin's own import/export tables.

use bitflags::bitflags;
use failure::{Error, Fail};
use log::{debug, info, warn};
use std::collections::HashMap;

use crate::arch::{Mode, RVA, VA};
use crate::aspace::{round_up_to_page, AddressSpace};
use crate::util::read_ascii;
use crate::workspace::Workspace;

#[derive(Debug, Fail)]
pub enum LoaderError {
    #[fail(display = "unsupported or unexpected optional header type")]
    InvalidMode,
    #[fail(display = "export directory has a null AddressOfFunctions")]
    MalformedExportTable,
}

bitflags! {
    pub struct Permissions: u8 {
        const R = 0b0000_0001;
        const W = 0b0000_0010;
        const X = 0b0000_0100;
        const RW = Self::R.bits | Self::W.bits;
        const RX = Self::R.bits | Self::X.bits;
        const RWX = Self::R.bits | Self::W.bits | Self::X.bits;
    }
}

/// A single section as handed to us by the external PE reader: virtual
/// placement plus the raw bytes to place there.
pub struct RawSection<'a> {
    pub name: String,
    pub virtual_address: RVA,
    pub virtual_size: u32,
    pub data: &'a [u8],
}

/// A single `DataDirectory[i]` entry: an RVA and a size.
#[derive(Debug, Clone, Copy, Default)]
pub struct DataDirectoryEntry {
    pub virtual_address: u32,
    pub size: u32,
}

/// Exactly what the external PE reader contributes: optional-header facts,
/// the data directory, and section placement/bytes. Everything downstream
/// of this (imports, exports) is this module's own responsibility.
pub struct PeImage<'a> {
    pub image_base: VA,
    pub address_of_entry_point: RVA,
    pub data_directory: [DataDirectoryEntry; 16],
    pub sections: Vec<RawSection<'a>>,
}

impl<'a> PeImage<'a> {
    /// Adapt a `goblin`-parsed PE32 image into the shape this loader
    /// expects. Fails with `InvalidMode` for anything but a PE32 (32-bit)
    /// optional header, per the spec's stated scope.
    pub fn from_goblin(pe: &goblin::pe::PE<'a>, raw: &'a [u8]) -> Result<PeImage<'a>, Error> {
        let opt = pe.header.optional_header.ok_or(LoaderError::InvalidMode)?;
        if opt.standard_fields.magic != goblin::pe::optional_header::MAGIC_32 {
            return Err(LoaderError::InvalidMode.into());
        }

        let mut data_directory = [DataDirectoryEntry::default(); 16];
        for (i, slot) in opt.data_directories.data_directories.iter().enumerate().take(16) {
            if let Some(dd) = slot {
                data_directory[i] = DataDirectoryEntry {
                    virtual_address: dd.virtual_address,
                    size: dd.size,
                };
            }
        }

        let mut sections = Vec::with_capacity(pe.sections.len());
        for sec in &pe.sections {
            let start = sec.pointer_to_raw_data as usize;
            let size = sec.size_of_raw_data as usize;
            let data = if start < raw.len() {
                &raw[start..std::cmp::min(start + size, raw.len())]
            } else {
                &raw[0..0]
            };
            sections.push(RawSection {
                name: sec.name().unwrap_or("").trim_end_matches('\0').to_string(),
                virtual_address: RVA::from(sec.virtual_address),
                virtual_size: sec.virtual_size,
                data,
            });
        }

        Ok(PeImage {
            image_base: VA(opt.windows_fields.image_base),
            address_of_entry_point: RVA::from(opt.standard_fields.address_of_entry_point),
            data_directory,
            sections,
        })
    }
}

/// A resolved import or export symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkedSymbol {
    pub module_name: String,
    pub symbol_name: String,
}

/// A module mapped into a workspace's address space.
pub struct LoadedModule {
    pub name: String,
    pub base_address: VA,
    pub entry_point: VA,
    pub imports: HashMap<RVA, LinkedSymbol>,
    pub exports_by_name: HashMap<String, RVA>,
    pub exports_by_ordinal: HashMap<u16, RVA>,
}

impl LoadedModule {
    pub fn rva_to_va(&self, rva: RVA) -> VA {
        rva.to_va(self.base_address)
    }
}

const IMPORT_BY_ORDINAL_FLAG: u32 = 1 << 31;
const MAX_NAME_LEN: u64 = 0x100;

/// Load `image` into `ws`, mapping sections and resolving imports/exports,
/// and register the resulting module. Only the 32-bit path is implemented;
/// 64-bit mirrors it but is out of scope here.
///
/// Section-mapping and import/export resolution failures are always logged;
/// whether they also abort the load is governed by `ws.config().strict_mode`
/// — `false` (the default) logs and carries on with whatever was resolved so
/// far, `true` propagates the error immediately.
pub fn load_pe(ws: &mut Workspace, name: &str, image: &PeImage<'_>) -> Result<usize, Error> {
    if ws.mode() != Mode::M32 {
        return Err(LoaderError::InvalidMode.into());
    }

    let base = image.image_base;
    let strict_mode = ws.config().strict_mode;

    for section in &image.sections {
        let sec_start = section.virtual_address.to_va(base);
        let sec_len = round_up_to_page(u64::from(section.virtual_size));
        let region_name = format!("{}/{}", name, section.name);
        info!(
            "section: {} va=0x{:x} size=0x{:x}",
            region_name, sec_start.0, sec_len
        );
        if let Err(e) = ws.mem_map(sec_start, sec_len, &region_name).and_then(|_| ws.mem_write(sec_start, section.data)) {
            warn!("failed to map section {}: {}", region_name, e);
            if strict_mode {
                return Err(e);
            }
        }
    }

    let mut module = LoadedModule {
        name: name.to_string(),
        base_address: base,
        entry_point: image.address_of_entry_point.to_va(base),
        imports: HashMap::new(),
        exports_by_name: HashMap::new(),
        exports_by_ordinal: HashMap::new(),
    };

    if let Err(e) = resolve_imports(ws, &mut module, &image.data_directory[1]) {
        warn!("failed to resolve imports for {}: {}", name, e);
        if strict_mode {
            return Err(e);
        }
    }
    if let Err(e) = resolve_exports(ws, &mut module, &image.data_directory[0]) {
        warn!("failed to resolve exports for {}: {}", name, e);
        if strict_mode {
            return Err(e);
        }
    }

    Ok(ws.add_loaded_module(module))
}

fn resolve_thunk_table(
    ws: &Workspace,
    module: &mut LoadedModule,
    module_name: &str,
    rva_table: RVA,
) -> Result<(), Error> {
    let mut offset = rva_table;
    loop {
        let va = offset.to_va(module.base_address);
        let thunk = ws.mem_read_rva(va)?.0 as u32;
        if thunk == 0 {
            break;
        }

        if thunk & IMPORT_BY_ORDINAL_FLAG != 0 {
            let ordinal = thunk & 0x7FFF_FFFF;
            module.imports.insert(
                offset,
                LinkedSymbol {
                    module_name: module_name.to_string(),
                    symbol_name: format!("ordinal-{:x}", ordinal),
                },
            );
        } else {
            let name_va = RVA::from(thunk).to_va(module.base_address);
            // skip the 2-byte hint, then read the ASCIIZ name.
            let buf = ws.mem_read(name_va + 2u64, MAX_NAME_LEN)?;
            let name = read_ascii(&buf);
            module.imports.insert(
                offset,
                LinkedSymbol {
                    module_name: module_name.to_string(),
                    symbol_name: name,
                },
            );
        }

        offset = offset + 4u64;
    }
    Ok(())
}

fn resolve_imports(
    ws: &Workspace,
    module: &mut LoadedModule,
    import_dir: &DataDirectoryEntry,
) -> Result<(), Error> {
    if import_dir.virtual_address == 0 {
        return Ok(());
    }

    let mut offset = RVA::from(import_dir.virtual_address);
    loop {
        let entry_va = offset.to_va(module.base_address);

        let rva_original_thunk_table = ws.mem_read_rva(entry_va)?;
        if rva_original_thunk_table.0 == 0 {
            break;
        }
        // TimeDateStamp, ForwarderChain: unused here, skip 8 bytes.
        let rva_module_name = ws.mem_read_rva(entry_va + 12u64)?;
        let rva_thunk_table = ws.mem_read_rva(entry_va + 16u64)?;

        let name_buf = ws.mem_read(rva_module_name.to_va(module.base_address), MAX_NAME_LEN)?;
        let module_name = read_ascii(&name_buf);
        debug!("import module: {}", module_name);

        resolve_thunk_table(ws, module, &module_name, rva_thunk_table)?;

        offset = offset + 20u64;
    }
    Ok(())
}

fn resolve_exports(
    ws: &Workspace,
    module: &mut LoadedModule,
    export_dir: &DataDirectoryEntry,
) -> Result<(), Error> {
    if export_dir.virtual_address == 0 {
        return Ok(());
    }

    let dir_va = RVA::from(export_dir.virtual_address).to_va(module.base_address);

    // ImageExportDirectory, 40 bytes, all fields little-endian u32/u16:
    //   Characteristics, TimeDateStamp: u32 u32 (skip, 8 bytes)
    //   MajorVersion, MinorVersion: u16 u16 (skip, 4 bytes)
    //   Name: u32 (skip, 4 bytes)
    //   Base: u32
    //   NumberOfFunctions: u32
    //   NumberOfNames: u32
    //   AddressOfFunctions: u32
    //   AddressOfNames: u32
    //   AddressOfNameOrdinals: u32
    let base_ordinal = ws.mem_read_rva(dir_va + 16u64)?.0 as u32;
    let number_of_functions = ws.mem_read_rva(dir_va + 20u64)?.0 as u32;
    let number_of_names = ws.mem_read_rva(dir_va + 24u64)?.0 as u32;
    let rva_address_of_functions = ws.mem_read_rva(dir_va + 28u64)?.0 as u32;
    let rva_address_of_names = ws.mem_read_rva(dir_va + 32u64)?.0 as u32;
    let rva_address_of_name_ordinals = ws.mem_read_rva(dir_va + 36u64)?.0 as u32;

    if rva_address_of_functions == 0 {
        return Err(LoaderError::MalformedExportTable.into());
    }

    for i in 0..number_of_functions {
        let ordinal = (i + base_ordinal) as u16;
        let fn_rva = ws.mem_read_rva(
            RVA::from(rva_address_of_functions + 4 * i).to_va(module.base_address),
        )?;
        module.exports_by_ordinal.insert(ordinal, fn_rva);
    }

    for i in 0..number_of_names {
        let name_rva = ws.mem_read_rva(
            RVA::from(rva_address_of_names + 4 * i).to_va(module.base_address),
        )?;
        let name_ordinal = ws.mem_read_u16(
            RVA::from(rva_address_of_name_ordinals + 2 * i).to_va(module.base_address),
        )?;
        let fn_rva = ws.mem_read_rva(
            RVA::from(rva_address_of_functions + 4 * u32::from(name_ordinal)).to_va(module.base_address),
        )?;

        let name_buf = ws.mem_read(name_rva.to_va(module.base_address), MAX_NAME_LEN)?;
        let name = read_ascii(&name_buf);
        module.exports_by_name.insert(name, fn_rva);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::build_synthetic_pe_module;

    #[test]
    fn s1_import_resolution_by_name_and_ordinal() {
        let (ws, module_idx) = build_synthetic_pe_module();
        let ws = ws;
        let module = &ws.loaded_modules()[module_idx];

        let by_name = module
            .imports
            .values()
            .find(|s| s.symbol_name == "GetProcAddress")
            .expect("expected a by-name import");
        assert_eq!(by_name.module_name, "kernel32.dll");

        let by_ordinal = module
            .imports
            .values()
            .find(|s| s.symbol_name == "ordinal-42")
            .expect("expected an ordinal import");
        assert_eq!(by_ordinal.module_name, "kernel32.dll");

        assert_eq!(module.imports.len(), 2);
    }

    #[test]
    fn s2_export_by_name_and_ordinal() {
        let (ws, module_idx) = build_synthetic_pe_module();
        let module = &ws.loaded_modules()[module_idx];

        assert_eq!(module.exports_by_ordinal.len(), 2);
        assert_eq!(module.exports_by_name.get("Foo"), module.exports_by_ordinal.get(&2));
    }
}
