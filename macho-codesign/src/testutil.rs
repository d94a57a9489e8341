// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Synthesized Mach-O fixtures for tests.

use {
    crate::universal::{create_universal_macho, UniversalSlice},
    goblin::mach::{
        cputype::CPU_TYPE_ARM64,
        header::{MH_EXECUTE, MH_MAGIC_64},
        load_command::{LC_BUILD_VERSION, LC_SEGMENT_64},
    },
    scroll::{IOwrite, Pread},
    std::io::Write,
};

const SEGMENT_COMMAND_SIZE: u32 = 72;
const SECTION_SIZE: u32 = 80;
const BUILD_VERSION_SIZE: u32 = 24;
const TEXT_VMADDR: u64 = 0x1_0000_0000;

fn name16(name: &str) -> [u8; 16] {
    let mut v = [0u8; 16];
    v[..name.len()].copy_from_slice(name.as_bytes());
    v
}

fn align_up(v: u64, align: u64) -> u64 {
    (v + align - 1) / align * align
}

/// Builds a 64-bit little-endian executable with `__PAGEZERO`, `__TEXT`
/// (one `__text` section) and `__LINKEDIT` segments.
#[derive(Clone, Debug)]
pub struct MachOBuilder {
    cputype: u32,
    cpusubtype: u32,
    filetype: u32,
    text_size: usize,
    linkedit_size: usize,
    slack: Option<usize>,
    build_version: Option<(u32, u32, u32)>,
}

impl Default for MachOBuilder {
    fn default() -> Self {
        Self {
            cputype: CPU_TYPE_ARM64,
            cpusubtype: 0,
            filetype: MH_EXECUTE,
            text_size: 2000,
            linkedit_size: 600,
            slack: None,
            build_version: None,
        }
    }
}

impl MachOBuilder {
    pub fn cpu(mut self, cputype: u32, cpusubtype: u32) -> Self {
        self.cputype = cputype;
        self.cpusubtype = cpusubtype;
        self
    }

    pub fn filetype(mut self, filetype: u32) -> Self {
        self.filetype = filetype;
        self
    }

    pub fn text_size(mut self, size: usize) -> Self {
        self.text_size = size;
        self
    }

    pub fn linkedit_size(mut self, size: usize) -> Self {
        self.linkedit_size = size;
        self
    }

    /// Bytes between the end of load commands and the `__text` section.
    pub fn load_command_slack(mut self, slack: usize) -> Self {
        self.slack = Some(slack);
        self
    }

    pub fn build_version(mut self, platform: u32, minos: u32, sdk: u32) -> Self {
        self.build_version = Some((platform, minos, sdk));
        self
    }

    #[allow(clippy::too_many_arguments)]
    fn write_segment(
        out: &mut Vec<u8>,
        name: &str,
        vmaddr: u64,
        vmsize: u64,
        fileoff: u64,
        filesize: u64,
        nsects: u32,
    ) {
        out.iowrite_with(LC_SEGMENT_64, scroll::LE).unwrap();
        out.iowrite_with(SEGMENT_COMMAND_SIZE + nsects * SECTION_SIZE, scroll::LE)
            .unwrap();
        out.write_all(&name16(name)).unwrap();
        for v in [vmaddr, vmsize, fileoff, filesize] {
            out.iowrite_with(v, scroll::LE).unwrap();
        }
        // maxprot, initprot, nsects, flags
        for v in [7u32, 5, nsects, 0] {
            out.iowrite_with(v, scroll::LE).unwrap();
        }
    }

    pub fn build(&self) -> Vec<u8> {
        let ncmds = 3 + self.build_version.is_some() as u32;
        let sizeofcmds = 3 * SEGMENT_COMMAND_SIZE
            + SECTION_SIZE
            + if self.build_version.is_some() {
                BUILD_VERSION_SIZE
            } else {
                0
            };
        let commands_end = 32 + sizeofcmds as u64;

        let section_offset = match self.slack {
            Some(slack) => commands_end + slack as u64,
            None => 0x1000,
        };
        let text_filesize = align_up(section_offset + self.text_size as u64, 0x1000);
        let linkedit_fileoff = text_filesize;
        let linkedit_vmaddr = TEXT_VMADDR + align_up(text_filesize, 0x4000);

        let mut out = Vec::new();

        for v in [
            MH_MAGIC_64,
            self.cputype,
            self.cpusubtype,
            self.filetype,
            ncmds,
            sizeofcmds,
            0,
            0,
        ] {
            out.iowrite_with(v, scroll::LE).unwrap();
        }

        Self::write_segment(&mut out, "__PAGEZERO", 0, TEXT_VMADDR, 0, 0, 0);
        Self::write_segment(
            &mut out,
            "__TEXT",
            TEXT_VMADDR,
            align_up(text_filesize, 0x4000),
            0,
            text_filesize,
            1,
        );
        out.write_all(&name16("__text")).unwrap();
        out.write_all(&name16("__TEXT")).unwrap();
        out.iowrite_with(TEXT_VMADDR + section_offset, scroll::LE)
            .unwrap();
        out.iowrite_with(self.text_size as u64, scroll::LE).unwrap();
        // offset, align, reloff, nreloc, flags, reserved1-3
        for v in [section_offset as u32, 4, 0, 0, 0x8000_0400, 0, 0, 0] {
            out.iowrite_with(v, scroll::LE).unwrap();
        }

        Self::write_segment(
            &mut out,
            "__LINKEDIT",
            linkedit_vmaddr,
            align_up(self.linkedit_size as u64, 0x4000),
            linkedit_fileoff,
            self.linkedit_size as u64,
            0,
        );

        if let Some((platform, minos, sdk)) = self.build_version {
            for v in [LC_BUILD_VERSION, BUILD_VERSION_SIZE, platform, minos, sdk, 0] {
                out.iowrite_with(v, scroll::LE).unwrap();
            }
        }

        assert_eq!(out.len() as u64, commands_end);

        out.resize(section_offset as usize, 0);
        out.extend((0..self.text_size).map(|i| (i % 251) as u8));
        out.resize(text_filesize as usize, 0);
        out.extend((0..self.linkedit_size).map(|i| (i % 13) as u8 + 1));

        out
    }
}

/// Wrap thin images in a fat container. Each entry is `(data, align)`.
pub fn fat_binary(slices: &[(&[u8], u32)]) -> Vec<u8> {
    create_universal_macho(slices.iter().map(|(data, align)| UniversalSlice {
        cputype: data.pread_with(4, scroll::LE).unwrap(),
        cpusubtype: data.pread_with(8, scroll::LE).unwrap(),
        align: *align,
        data,
    }))
    .unwrap()
}
