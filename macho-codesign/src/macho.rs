// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Mach-O binary model and signature rewriting.

Code signing data lives at the end of the `__LINKEDIT` segment. An
`LC_CODE_SIGNATURE` load command points at it.

[MachOFile] owns the raw bytes of a thin or fat binary. Everything it
exposes about structure (load commands, segments, sections, the signature
region) is recorded as offsets and lengths into that buffer, relative to
the start of the architecture slice the structure belongs to. Rewriting
never mutates in place: [MachOFile::replace_signature] derives a new
buffer and reparses it.
*/

use {
    crate::{
        embedded_signature::EmbeddedSignature,
        error::{FormatError, MachoCodesignError},
        universal::{create_universal_macho, UniversalSlice, DEFAULT_ALIGN},
    },
    goblin::mach::{
        constants::{SEG_LINKEDIT, SEG_PAGEZERO, SEG_TEXT},
        cputype::{
            get_arch_name_from_types, CPU_TYPE_ARM, CPU_TYPE_ARM64, CPU_TYPE_ARM64_32,
            CPU_TYPE_POWERPC, CPU_TYPE_POWERPC64, CPU_TYPE_X86, CPU_TYPE_X86_64,
        },
        fat::{FatArch, FAT_MAGIC, SIZEOF_FAT_ARCH, SIZEOF_FAT_HEADER},
        header::{Header, MH_EXECUTE, SIZEOF_HEADER_32, SIZEOF_HEADER_64},
        load_command::{
            LinkeditDataCommand, LoadCommandHeader, Section32, Section64, SegmentCommand32,
            SegmentCommand64, VersionMinCommand, LC_BUILD_VERSION, LC_CODE_SIGNATURE, LC_SEGMENT,
            LC_SEGMENT_64, LC_VERSION_MIN_IPHONEOS, LC_VERSION_MIN_MACOSX, LC_VERSION_MIN_TVOS,
            LC_VERSION_MIN_WATCHOS, SIZEOF_LINKEDIT_DATA_COMMAND, SIZEOF_SECTION_32,
            SIZEOF_SECTION_64, SIZEOF_SEGMENT_COMMAND_32, SIZEOF_SEGMENT_COMMAND_64,
        },
        parse_magic_and_ctx,
    },
    log::debug,
    scroll::{ctx::SizeWith, Endian, Pread, Pwrite},
};

/// Magic of 64-bit fat headers, which we don't rewrite.
const FAT_MAGIC_64: u32 = 0xcafe_babf;

/// `codesign` rounds the `__LINKEDIT` vmsize up to 16k. We do the same.
pub const LINKEDIT_VM_ALIGN: u64 = 16384;

/// Signature data offset and size alignment within `__LINKEDIT`.
pub const SIGNATURE_ALIGN: usize = 16;

/// Section types whose content isn't backed by file data.
const S_ZEROFILL: u32 = 0x1;
const S_GB_ZEROFILL: u32 = 0xc;
const S_THREAD_LOCAL_ZEROFILL: u32 = 0x12;
const SECTION_TYPE: u32 = 0xff;

fn align_up(value: usize, align: usize) -> usize {
    match value % align {
        0 => value,
        rem => value + align - rem,
    }
}

fn truncated(what: &'static str, offset: usize, needed: usize, data: &[u8]) -> FormatError {
    FormatError::Truncated {
        what,
        offset,
        needed,
        available: data.len().saturating_sub(offset),
    }
}

fn fixed_name(raw: &[u8; 16]) -> String {
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).to_string()
}

/// Content of an `LC_BUILD_VERSION` load command.
#[derive(Clone, Debug, Pread)]
pub struct BuildVersionCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    pub platform: u32,
    /// X.Y.Z encoded in nibbles as xxxx.yy.zz.
    pub minos: u32,
    /// X.Y.Z encoded in nibbles as xxxx.yy.zz.
    pub sdk: u32,
    pub ntools: u32,
}

/// Represents `PLATFORM_` mach-o constants.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Platform {
    MacOs,
    IOs,
    TvOs,
    WatchOs,
    BridgeOs,
    MacCatalyst,
    IosSimulator,
    TvOsSimulator,
    WatchOsSimulator,
    DriverKit,
    Unknown(u32),
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MacOs => f.write_str("macOS"),
            Self::IOs => f.write_str("iOS"),
            Self::TvOs => f.write_str("tvOS"),
            Self::WatchOs => f.write_str("watchOS"),
            Self::BridgeOs => f.write_str("bridgeOS"),
            Self::MacCatalyst => f.write_str("macCatalyst"),
            Self::IosSimulator => f.write_str("iOSSimulator"),
            Self::TvOsSimulator => f.write_str("tvOSSimulator"),
            Self::WatchOsSimulator => f.write_str("watchOSSimulator"),
            Self::DriverKit => f.write_str("driverKit"),
            Self::Unknown(v) => f.write_fmt(format_args!("Unknown ({})", v)),
        }
    }
}

impl From<u32> for Platform {
    fn from(v: u32) -> Self {
        match v {
            1 => Self::MacOs,
            2 => Self::IOs,
            3 => Self::TvOs,
            4 => Self::WatchOs,
            5 => Self::BridgeOs,
            6 => Self::MacCatalyst,
            7 => Self::IosSimulator,
            8 => Self::TvOsSimulator,
            9 => Self::WatchOsSimulator,
            10 => Self::DriverKit,
            _ => Self::Unknown(v),
        }
    }
}

/// Targeting settings for a Mach-O binary.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MachoTarget {
    pub platform: Platform,
    pub minimum_os_version: semver::Version,
    pub sdk_version: semver::Version,
}

/// Parses an integer with nibbles xxxx.yy.zz into a [semver::Version].
pub fn parse_version_nibbles(v: u32) -> semver::Version {
    let major = v >> 16;
    let minor = (v >> 8) & 0xff;
    let patch = v & 0xff;

    semver::Version::new(major as _, minor as _, patch as _)
}

/// Convert a [semver::Version] to a u32 with nibble encoding used by Mach-O.
pub fn semver_to_macho_target_version(version: &semver::Version) -> u32 {
    let major = version.major as u32;
    let minor = version.minor as u32;
    let patch = version.patch as u32;

    (major << 16) | ((minor & 0xff) << 8) | (patch & 0xff)
}

/// The subset of the Mach-O header we model.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MachHeader {
    pub magic: u32,
    pub cputype: u32,
    pub cpusubtype: u32,
    pub filetype: u32,
    pub ncmds: u32,
    pub sizeofcmds: u32,
    pub flags: u32,
}

/// What a load command means to us.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LoadCommandKind {
    /// `LC_SEGMENT` / `LC_SEGMENT_64`, indexing into [Arch::segments].
    Segment(usize),
    /// `LC_CODE_SIGNATURE`.
    CodeSignature { dataoff: u32, datasize: u32 },
    /// Everything else is passed through opaquely.
    Other,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LoadCommand {
    /// Offset of the command within the slice.
    pub offset: usize,
    pub cmd: u32,
    pub cmdsize: u32,
    pub kind: LoadCommandKind,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Section {
    pub name: String,
    pub segment_name: String,
    pub addr: u64,
    pub size: u64,
    /// File offset of section data. 0 for zero-fill sections.
    pub offset: u32,
    pub flags: u32,
}

impl Section {
    /// Whether the section occupies bytes in the file.
    pub fn has_file_data(&self) -> bool {
        !matches!(
            self.flags & SECTION_TYPE,
            S_ZEROFILL | S_GB_ZEROFILL | S_THREAD_LOCAL_ZEROFILL
        ) && self.size > 0
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Segment {
    pub name: String,
    /// Offset of the defining load command within the slice.
    pub command_offset: usize,
    pub vmaddr: u64,
    pub vmsize: u64,
    pub fileoff: u64,
    pub filesize: u64,
    pub sections: Vec<Section>,
}

impl Segment {
    pub fn file_end(&self) -> u64 {
        self.fileoff + self.filesize
    }
}

/// A single architecture's Mach-O image inside a [MachOFile].
#[derive(Clone, Debug)]
pub struct Arch {
    /// Offset of this slice in the file. 0 for thin binaries.
    pub offset: usize,
    pub size: usize,
    /// Alignment of the slice within a fat container, as a power of 2.
    pub align: u32,
    pub is_64: bool,
    pub endian: Endian,
    pub header: MachHeader,
    pub load_commands: Vec<LoadCommand>,
    pub segments: Vec<Segment>,
    pub target: Option<MachoTarget>,
}

impl Arch {
    fn header_size(&self) -> usize {
        if self.is_64 {
            SIZEOF_HEADER_64
        } else {
            SIZEOF_HEADER_32
        }
    }

    /// End offset of the load command region.
    pub fn load_commands_end(&self) -> usize {
        self.header_size() + self.header.sizeofcmds as usize
    }

    /// Human readable architecture name.
    pub fn arch_name(&self) -> String {
        get_arch_name_from_types(self.header.cputype, self.header.cpusubtype)
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("cputype {:#x}", self.header.cputype))
    }

    pub fn is_executable(&self) -> bool {
        self.header.filetype == MH_EXECUTE
    }

    pub fn segment(&self, name: &str) -> Option<&Segment> {
        self.segments.iter().find(|s| s.name == name)
    }

    pub fn linkedit(&self) -> Result<&Segment, FormatError> {
        self.segment(SEG_LINKEDIT).ok_or(FormatError::MissingLinkedit)
    }

    pub fn code_signature_command(&self) -> Option<&LoadCommand> {
        self.load_commands
            .iter()
            .find(|lc| matches!(lc.kind, LoadCommandKind::CodeSignature { .. }))
    }

    /// `(offset, size)` of existing signature data within the slice.
    pub fn existing_signature_region(&self) -> Option<(usize, usize)> {
        self.code_signature_command().and_then(|lc| match lc.kind {
            LoadCommandKind::CodeSignature { dataoff, datasize } => {
                Some((dataoff as usize, datasize as usize))
            }
            _ => None,
        })
    }

    /// Offset within the slice where hashed code ends.
    ///
    /// This is the start of existing signature data or the end of
    /// `__LINKEDIT` when there is no signature.
    pub fn code_limit_unpadded(&self) -> Result<usize, FormatError> {
        let linkedit = self.linkedit()?;

        Ok(match self.existing_signature_region() {
            Some((offset, _)) => offset,
            None => linkedit.file_end() as usize,
        })
    }

    /// Offset within the slice where signature data will be written.
    ///
    /// All bytes before this offset are digested by the Code Directory.
    pub fn signature_offset(&self) -> Result<usize, FormatError> {
        Ok(align_up(self.code_limit_unpadded()?, SIGNATURE_ALIGN))
    }

    /// `(start, end)` file offsets of the `__TEXT` segment.
    pub fn executable_segment_boundary(&self) -> Result<(u64, u64), FormatError> {
        let segment = self
            .segment(SEG_TEXT)
            .ok_or_else(|| FormatError::Unsupported("no __TEXT segment".into()))?;

        Ok((segment.fileoff, segment.file_end()))
    }

    /// Bytes available between the last load command and the first file data.
    pub fn load_command_slack(&self) -> usize {
        let first_data = self
            .segments
            .iter()
            .flat_map(|s| s.sections.iter())
            .filter(|s| s.has_file_data())
            .map(|s| s.offset as usize)
            .chain(
                self.segments
                    .iter()
                    .filter(|s| s.fileoff != 0 && s.filesize != 0)
                    .map(|s| s.fileoff as usize),
            )
            .min()
            .unwrap_or(self.size);

        first_data.saturating_sub(self.load_commands_end())
    }

    /// Verify this slice can have its signature replaced.
    ///
    /// `__LINKEDIT` must be the final segment, and nothing may follow it or
    /// the signature inside it.
    pub fn check_signing_capability(&self) -> Result<(), FormatError> {
        let linkedit = self.linkedit()?;

        let last = self
            .segments
            .iter()
            .filter(|s| s.name != SEG_PAGEZERO)
            .max_by_key(|s| s.file_end())
            .ok_or(FormatError::MissingLinkedit)?;

        if last.name != SEG_LINKEDIT
            || self.segments.last().map(|s| s.name.as_str()) != Some(SEG_LINKEDIT)
        {
            return Err(FormatError::LinkeditNotLast);
        }

        let linkedit_end = linkedit.file_end() as usize;
        if linkedit_end != self.size {
            return Err(FormatError::DataAfterSignature);
        }

        match self.existing_signature_region() {
            Some((offset, size)) => {
                if (offset as u64) < linkedit.fileoff || offset + size != linkedit_end {
                    return Err(FormatError::DataAfterSignature);
                }
            }
            None => {
                let slack = self.load_command_slack();
                if slack < SIZEOF_LINKEDIT_DATA_COMMAND {
                    return Err(FormatError::LoadCommandNoRoom {
                        available: slack,
                        needed: SIZEOF_LINKEDIT_DATA_COMMAND,
                    });
                }
            }
        }

        Ok(())
    }
}

/// An owned, parsed thin or fat Mach-O file.
#[derive(Clone, Debug)]
pub struct MachOFile {
    data: Vec<u8>,
    fat: bool,
    arches: Vec<Arch>,
}

impl MachOFile {
    /// Parse a thin or fat Mach-O binary, taking ownership of its bytes.
    pub fn parse(data: Vec<u8>) -> Result<Self, MachoCodesignError> {
        let magic = data
            .pread_with::<u32>(0, scroll::BE)
            .map_err(|_| truncated("file magic", 0, 4, &data))?;

        match magic {
            FAT_MAGIC => {
                let arches = parse_fat(&data)?;
                Ok(Self {
                    data,
                    fat: true,
                    arches,
                })
            }
            FAT_MAGIC_64 => Err(FormatError::Unsupported("64-bit fat headers".into()).into()),
            _ => {
                let arch = parse_arch(&data, 0, data.len(), DEFAULT_ALIGN)?;
                Ok(Self {
                    data,
                    fat: false,
                    arches: vec![arch],
                })
            }
        }
    }

    /// Build a file from thin slices, preserving fat-ness and alignment of `self`.
    ///
    /// Offsets in the fat header are recomputed from the new slice sizes.
    pub fn with_slices(&self, slices: Vec<Vec<u8>>) -> Result<Self, MachoCodesignError> {
        if slices.len() != self.arches.len() {
            return Err(MachoCodesignError::SignatureBuilder(
                "slice count differs from architecture count",
            ));
        }

        if !self.fat {
            return Self::parse(slices.into_iter().next().unwrap_or_default());
        }

        let parsed = slices
            .iter()
            .zip(&self.arches)
            .map(|(data, original)| parse_arch(data, 0, data.len(), original.align))
            .collect::<Result<Vec<_>, _>>()?;

        let data = create_universal_macho(parsed.iter().zip(&slices).map(|(arch, data)| {
            UniversalSlice {
                cputype: arch.header.cputype,
                cpusubtype: arch.header.cpusubtype,
                align: arch.align,
                data,
            }
        }))?;

        Self::parse(data)
    }

    pub fn is_fat(&self) -> bool {
        self.fat
    }

    pub fn arches(&self) -> &[Arch] {
        &self.arches
    }

    pub fn arch(&self, index: usize) -> Result<&Arch, FormatError> {
        self.arches
            .get(index)
            .ok_or(FormatError::ArchOutOfRange(index))
    }

    /// Raw bytes of the entire file.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Raw bytes of a single architecture slice.
    pub fn arch_data(&self, index: usize) -> Result<&[u8], FormatError> {
        let arch = self.arch(index)?;

        Ok(&self.data[arch.offset..arch.offset + arch.size])
    }

    /// `(offset, size)` of existing signature data within the slice.
    pub fn existing_signature_region(
        &self,
        index: usize,
    ) -> Result<Option<(usize, usize)>, FormatError> {
        Ok(self.arch(index)?.existing_signature_region())
    }

    /// Parse the embedded signature of a slice, if present.
    pub fn code_signature(
        &self,
        index: usize,
    ) -> Result<Option<EmbeddedSignature<'_>>, MachoCodesignError> {
        let data = self.arch_data(index)?;

        match self.existing_signature_region(index)? {
            Some((offset, size)) => Ok(Some(EmbeddedSignature::from_bytes(
                &data[offset..offset + size],
            )?)),
            None => Ok(None),
        }
    }

    /// Derive a new file with the signature of slice `index` replaced by `blob`.
    ///
    /// `blob` is written at the 16 byte aligned end of the code region and
    /// padded with NULLs to a multiple of 16 bytes. `__LINKEDIT` is resized to
    /// end with it. A new `LC_CODE_SIGNATURE` is appended to the load
    /// commands if the slice has none. Every other byte is preserved.
    pub fn replace_signature(&self, index: usize, blob: &[u8]) -> Result<Self, MachoCodesignError> {
        let arch = self.arch(index)?;
        let slice = self.arch_data(index)?;

        let rewritten = rewrite_slice(arch, slice, blob)?;

        if self.fat {
            let slices = (0..self.arches.len())
                .map(|i| {
                    if i == index {
                        Ok(rewritten.clone())
                    } else {
                        self.arch_data(i).map(|d| d.to_vec())
                    }
                })
                .collect::<Result<Vec<_>, FormatError>>()?;

            self.with_slices(slices)
        } else {
            Self::parse(rewritten)
        }
    }
}

fn parse_fat(data: &[u8]) -> Result<Vec<Arch>, MachoCodesignError> {
    let count = data
        .pread_with::<u32>(4, scroll::BE)
        .map_err(|_| truncated("fat header", 0, SIZEOF_FAT_HEADER, data))? as usize;

    let records_end = SIZEOF_FAT_HEADER + count * SIZEOF_FAT_ARCH;
    if records_end > data.len() {
        return Err(truncated("fat arch records", SIZEOF_FAT_HEADER, count * SIZEOF_FAT_ARCH, data).into());
    }

    let mut arches = Vec::with_capacity(count);
    let mut ranges: Vec<(usize, usize)> = Vec::with_capacity(count);

    for i in 0..count {
        let record = data.pread_with::<FatArch>(SIZEOF_FAT_HEADER + i * SIZEOF_FAT_ARCH, scroll::BE)?;

        let offset = record.offset as usize;
        let size = record.size as usize;

        if offset + size > data.len() {
            return Err(truncated("fat slice", offset, size, data).into());
        }
        if offset < records_end || ranges.iter().any(|(o, s)| offset < o + s && *o < offset + size) {
            return Err(
                FormatError::SegmentOverlap(format!("fat slice {}", i), "fat header or slice".into())
                    .into(),
            );
        }
        ranges.push((offset, size));

        let arch = parse_arch(&data[offset..offset + size], offset, size, record.align)?;

        if arch.header.cputype != record.cputype {
            return Err(FormatError::Unsupported(format!(
                "fat record {} cputype {:#x} disagrees with slice header {:#x}",
                i, record.cputype, arch.header.cputype
            ))
            .into());
        }

        arches.push(arch);
    }

    Ok(arches)
}

fn is_supported_cputype(cputype: u32) -> bool {
    matches!(
        cputype,
        CPU_TYPE_X86
            | CPU_TYPE_X86_64
            | CPU_TYPE_ARM
            | CPU_TYPE_ARM64
            | CPU_TYPE_ARM64_32
            | CPU_TYPE_POWERPC
            | CPU_TYPE_POWERPC64
    )
}

/// Parse a thin Mach-O image. `data` is the slice alone.
fn parse_arch(
    data: &[u8],
    file_offset: usize,
    size: usize,
    align: u32,
) -> Result<Arch, MachoCodesignError> {
    let ctx = match parse_magic_and_ctx(data, 0) {
        Ok((_, Some(ctx))) => ctx,
        Ok((magic, None)) => {
            return Err(FormatError::Unsupported(format!("unknown Mach-O magic {:#x}", magic)).into());
        }
        Err(_) => return Err(truncated("Mach-O magic", 0, 4, data).into()),
    };

    let is_64 = ctx.container.is_big();
    let header_size = if is_64 {
        SIZEOF_HEADER_64
    } else {
        SIZEOF_HEADER_32
    };

    if data.len() < header_size {
        return Err(truncated("Mach-O header", 0, header_size, data).into());
    }

    let raw: Header = data.pread_with(0, ctx)?;

    if !is_supported_cputype(raw.cputype) {
        return Err(FormatError::Unsupported(format!("cpu type {:#x}", raw.cputype)).into());
    }

    let header = MachHeader {
        magic: raw.magic,
        cputype: raw.cputype,
        cpusubtype: raw.cpusubtype,
        filetype: raw.filetype,
        ncmds: raw.ncmds as u32,
        sizeofcmds: raw.sizeofcmds,
        flags: raw.flags,
    };

    let commands_end = header_size + header.sizeofcmds as usize;
    if commands_end > data.len() {
        return Err(truncated("load commands", header_size, header.sizeofcmds as usize, data).into());
    }

    let le = ctx.le;
    let mut load_commands = Vec::with_capacity(header.ncmds.min(1024) as usize);
    let mut segments = vec![];
    let mut target = None;
    let mut fallback_target = None;

    let mut offset = header_size;
    for _ in 0..header.ncmds {
        if offset + 8 > commands_end {
            return Err(truncated("load command", offset, 8, &data[..commands_end]).into());
        }

        let lc: LoadCommandHeader = data.pread_with(offset, le)?;
        let cmdsize = lc.cmdsize as usize;

        if cmdsize < 8 {
            return Err(FormatError::Unsupported(format!(
                "load command at {} has size {}",
                offset, cmdsize
            ))
            .into());
        }
        if offset + cmdsize > commands_end {
            return Err(truncated("load command", offset, cmdsize, &data[..commands_end]).into());
        }

        let command = &data[offset..offset + cmdsize];

        let kind = match lc.cmd {
            LC_SEGMENT_64 => {
                let segment = parse_segment_64(command, offset, le)?;
                segments.push(segment);
                LoadCommandKind::Segment(segments.len() - 1)
            }
            LC_SEGMENT => {
                let segment = parse_segment_32(command, offset, le)?;
                segments.push(segment);
                LoadCommandKind::Segment(segments.len() - 1)
            }
            LC_CODE_SIGNATURE => {
                let c: LinkeditDataCommand = command.pread_with(0, le)?;
                LoadCommandKind::CodeSignature {
                    dataoff: c.dataoff,
                    datasize: c.datasize,
                }
            }
            LC_BUILD_VERSION => {
                let c: BuildVersionCommand = command.pread_with(0, le)?;
                target = Some(MachoTarget {
                    platform: c.platform.into(),
                    minimum_os_version: parse_version_nibbles(c.minos),
                    sdk_version: parse_version_nibbles(c.sdk),
                });
                LoadCommandKind::Other
            }
            LC_VERSION_MIN_MACOSX
            | LC_VERSION_MIN_IPHONEOS
            | LC_VERSION_MIN_TVOS
            | LC_VERSION_MIN_WATCHOS => {
                let c: VersionMinCommand = command.pread_with(0, le)?;
                let platform = match lc.cmd {
                    LC_VERSION_MIN_MACOSX => Platform::MacOs,
                    LC_VERSION_MIN_IPHONEOS => Platform::IOs,
                    LC_VERSION_MIN_TVOS => Platform::TvOs,
                    _ => Platform::WatchOs,
                };
                fallback_target = Some(MachoTarget {
                    platform,
                    minimum_os_version: parse_version_nibbles(c.version),
                    sdk_version: parse_version_nibbles(c.sdk),
                });
                LoadCommandKind::Other
            }
            _ => LoadCommandKind::Other,
        };

        load_commands.push(LoadCommand {
            offset,
            cmd: lc.cmd,
            cmdsize: lc.cmdsize,
            kind,
        });

        offset += cmdsize;
    }

    if offset != commands_end {
        return Err(FormatError::SizeofcmdsMismatch {
            declared: header.sizeofcmds,
            actual: (offset - header_size) as u32,
        }
        .into());
    }

    validate_regions(data, &segments, &load_commands)?;

    Ok(Arch {
        offset: file_offset,
        size,
        align,
        is_64,
        endian: le,
        header,
        load_commands,
        segments,
        target: target.or(fallback_target),
    })
}

fn parse_segment_64(command: &[u8], offset: usize, le: Endian) -> Result<Segment, MachoCodesignError> {
    if command.len() < SIZEOF_SEGMENT_COMMAND_64 {
        return Err(truncated("segment command", offset, SIZEOF_SEGMENT_COMMAND_64, command).into());
    }

    let segment: SegmentCommand64 = command.pread_with(0, le)?;
    let name = fixed_name(&segment.segname);

    let sections_len = segment.nsects as usize * SIZEOF_SECTION_64;
    if SIZEOF_SEGMENT_COMMAND_64 + sections_len > command.len() {
        return Err(truncated("segment sections", offset, sections_len, command).into());
    }

    let sections = (0..segment.nsects as usize)
        .map(|i| {
            let s: Section64 =
                command.pread_with(SIZEOF_SEGMENT_COMMAND_64 + i * SIZEOF_SECTION_64, le)?;

            Ok(Section {
                name: fixed_name(&s.sectname),
                segment_name: fixed_name(&s.segname),
                addr: s.addr,
                size: s.size,
                offset: s.offset,
                flags: s.flags,
            })
        })
        .collect::<Result<Vec<_>, scroll::Error>>()?;

    Ok(Segment {
        name,
        command_offset: offset,
        vmaddr: segment.vmaddr,
        vmsize: segment.vmsize,
        fileoff: segment.fileoff,
        filesize: segment.filesize,
        sections,
    })
}

fn parse_segment_32(command: &[u8], offset: usize, le: Endian) -> Result<Segment, MachoCodesignError> {
    if command.len() < SIZEOF_SEGMENT_COMMAND_32 {
        return Err(truncated("segment command", offset, SIZEOF_SEGMENT_COMMAND_32, command).into());
    }

    let segment: SegmentCommand32 = command.pread_with(0, le)?;
    let name = fixed_name(&segment.segname);

    let sections_len = segment.nsects as usize * SIZEOF_SECTION_32;
    if SIZEOF_SEGMENT_COMMAND_32 + sections_len > command.len() {
        return Err(truncated("segment sections", offset, sections_len, command).into());
    }

    let sections = (0..segment.nsects as usize)
        .map(|i| {
            let s: Section32 =
                command.pread_with(SIZEOF_SEGMENT_COMMAND_32 + i * SIZEOF_SECTION_32, le)?;

            Ok(Section {
                name: fixed_name(&s.sectname),
                segment_name: fixed_name(&s.segname),
                addr: s.addr as u64,
                size: s.size as u64,
                offset: s.offset,
                flags: s.flags,
            })
        })
        .collect::<Result<Vec<_>, scroll::Error>>()?;

    Ok(Segment {
        name,
        command_offset: offset,
        vmaddr: segment.vmaddr as u64,
        vmsize: segment.vmsize as u64,
        fileoff: segment.fileoff as u64,
        filesize: segment.filesize as u64,
        sections,
    })
}

/// Segment, section and signature data must lie within the slice and
/// segments must not overlap each other.
fn validate_regions(
    data: &[u8],
    segments: &[Segment],
    load_commands: &[LoadCommand],
) -> Result<(), FormatError> {
    for segment in segments {
        let end = segment
            .fileoff
            .checked_add(segment.filesize)
            .ok_or_else(|| truncated("segment", segment.fileoff as usize, usize::MAX, data))?;
        if end > data.len() as u64 {
            return Err(truncated(
                "segment data",
                segment.fileoff as usize,
                segment.filesize as usize,
                data,
            ));
        }

        for section in segment.sections.iter().filter(|s| s.has_file_data()) {
            if section.offset as u64 + section.size > data.len() as u64 {
                return Err(truncated(
                    "section data",
                    section.offset as usize,
                    section.size as usize,
                    data,
                ));
            }
        }
    }

    let mut file_backed = segments
        .iter()
        .filter(|s| s.filesize > 0)
        .collect::<Vec<_>>();
    file_backed.sort_by_key(|s| s.fileoff);

    for pair in file_backed.windows(2) {
        if pair[0].file_end() > pair[1].fileoff {
            return Err(FormatError::SegmentOverlap(
                pair[0].name.clone(),
                pair[1].name.clone(),
            ));
        }
    }

    for lc in load_commands {
        if let LoadCommandKind::CodeSignature { dataoff, datasize } = lc.kind {
            if dataoff as usize + datasize as usize > data.len() {
                return Err(truncated(
                    "code signature",
                    dataoff as usize,
                    datasize as usize,
                    data,
                ));
            }
        }
    }

    Ok(())
}

/// Produce a new thin slice with `blob` as its signature data.
fn rewrite_slice(arch: &Arch, slice: &[u8], blob: &[u8]) -> Result<Vec<u8>, MachoCodesignError> {
    arch.check_signing_capability()?;

    let linkedit = arch.linkedit()?;
    let code_end = arch.code_limit_unpadded()?;
    let signature_offset = arch.signature_offset()?;
    let signature_size = align_up(blob.len(), SIGNATURE_ALIGN);

    let new_linkedit_filesize = (signature_offset + signature_size) as u64 - linkedit.fileoff;
    let new_linkedit_vmsize = {
        let v = new_linkedit_filesize;
        match v % LINKEDIT_VM_ALIGN {
            0 => v,
            rem => v + LINKEDIT_VM_ALIGN - rem,
        }
    };

    if signature_offset + signature_size > u32::MAX as usize {
        return Err(FormatError::Unsupported("signed slice exceeds 4 GiB".into()).into());
    }

    debug!(
        "{}: signature at {:#x} ({} bytes); __LINKEDIT filesize {:#x} vmsize {:#x}",
        arch.arch_name(),
        signature_offset,
        signature_size,
        new_linkedit_filesize,
        new_linkedit_vmsize
    );

    let mut data = Vec::with_capacity(signature_offset + signature_size);
    data.extend_from_slice(&slice[..code_end]);
    data.resize(signature_offset, 0);
    data.extend_from_slice(blob);
    data.resize(signature_offset + signature_size, 0);

    let le = arch.endian;

    // __LINKEDIT segment command.
    if arch.is_64 {
        let mut segment: SegmentCommand64 = data.pread_with(linkedit.command_offset, le)?;
        segment.filesize = new_linkedit_filesize;
        segment.vmsize = new_linkedit_vmsize;
        data.pwrite_with(segment, linkedit.command_offset, le)?;
    } else {
        let mut segment: SegmentCommand32 = data.pread_with(linkedit.command_offset, le)?;
        segment.filesize = new_linkedit_filesize as u32;
        segment.vmsize = new_linkedit_vmsize as u32;
        data.pwrite_with(segment, linkedit.command_offset, le)?;
    }

    let command = LinkeditDataCommand {
        cmd: LC_CODE_SIGNATURE,
        cmdsize: SIZEOF_LINKEDIT_DATA_COMMAND as u32,
        dataoff: signature_offset as u32,
        datasize: signature_size as u32,
    };

    match arch.code_signature_command() {
        Some(existing) => {
            data.pwrite_with(command, existing.offset, le)?;
        }
        None => {
            // Slack was verified by check_signing_capability(). It is NULL
            // in well-formed binaries but we overwrite it regardless.
            let position = arch.load_commands_end();
            data.pwrite_with(command, position, le)?;

            let ncmds_offset = 16;
            let sizeofcmds_offset = 20;
            data.pwrite_with(arch.header.ncmds + 1, ncmds_offset, le)?;
            data.pwrite_with(
                arch.header.sizeofcmds + LinkeditDataCommand::size_with(&le) as u32,
                sizeofcmds_offset,
                le,
            )?;
        }
    }

    Ok(data)
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::testutil::{fat_binary, MachOBuilder},
    };

    #[test]
    fn parse_thin() -> Result<(), MachoCodesignError> {
        let data = MachOBuilder::default().text_size(5000).build();
        let file = MachOFile::parse(data.clone())?;

        assert!(!file.is_fat());
        assert_eq!(file.arches().len(), 1);
        let arch = file.arch(0)?;
        assert!(arch.is_64);
        assert_eq!(arch.header.cputype, CPU_TYPE_ARM64);
        assert_eq!(
            arch.segments.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            vec!["__PAGEZERO", "__TEXT", "__LINKEDIT"]
        );
        assert_eq!(arch.segments[1].sections[0].name, "__text");
        assert!(arch.existing_signature_region().is_none());
        assert_eq!(arch.code_limit_unpadded()?, data.len());
        assert_eq!(file.as_bytes(), data.as_slice());

        Ok(())
    }

    #[test]
    fn parse_targeting() -> Result<(), MachoCodesignError> {
        let data = MachOBuilder::default()
            .build_version(1, 11 << 16, 12 << 16 | 3 << 8)
            .build();
        let file = MachOFile::parse(data)?;

        let target = file.arch(0)?.target.clone().expect("target");
        assert_eq!(target.platform, Platform::MacOs);
        assert_eq!(target.minimum_os_version, semver::Version::new(11, 0, 0));
        assert_eq!(target.sdk_version, semver::Version::new(12, 3, 0));

        Ok(())
    }

    #[test]
    fn parse_rejects_truncated() {
        let data = MachOBuilder::default().build();

        let res = MachOFile::parse(data[0..40].to_vec());
        assert!(matches!(
            res,
            Err(MachoCodesignError::Format(FormatError::Truncated { .. }))
        ));

        let res = MachOFile::parse(data[0..data.len() - 1].to_vec());
        assert!(matches!(
            res,
            Err(MachoCodesignError::Format(FormatError::Truncated { .. }))
        ));
    }

    #[test]
    fn parse_rejects_unknown_magic() {
        let res = MachOFile::parse(b"\x7fELF\x02\x01\x01\x00garbagegarbage".to_vec());
        assert!(matches!(
            res,
            Err(MachoCodesignError::Format(FormatError::Unsupported(_)))
        ));

        let res = MachOFile::parse(vec![0xca, 0xfe, 0xba, 0xbf, 0, 0, 0, 0]);
        assert!(matches!(
            res,
            Err(MachoCodesignError::Format(FormatError::Unsupported(_)))
        ));
    }

    #[test]
    fn parse_rejects_sizeofcmds_mismatch() {
        let mut data = MachOBuilder::default().build();
        // Claim more load command bytes than the commands occupy.
        let sizeofcmds = data.pread_with::<u32>(20, scroll::LE).unwrap();
        data.pwrite_with(sizeofcmds + 8, 20, scroll::LE).unwrap();

        let res = MachOFile::parse(data);
        assert!(matches!(
            res,
            Err(MachoCodesignError::Format(
                FormatError::SizeofcmdsMismatch { .. }
            ))
        ));
    }

    #[test]
    fn insert_signature_preserves_other_bytes() -> Result<(), MachoCodesignError> {
        let original = MachOBuilder::default().text_size(9000).build();
        let file = MachOFile::parse(original.clone())?;
        let arch = file.arch(0)?.clone();

        let blob = vec![0xabu8; 1000];
        let signed = file.replace_signature(0, &blob)?;
        let new_arch = signed.arch(0)?;

        assert_eq!(new_arch.header.ncmds, arch.header.ncmds + 1);
        assert_eq!(
            new_arch.header.sizeofcmds,
            arch.header.sizeofcmds + SIZEOF_LINKEDIT_DATA_COMMAND as u32
        );

        let (offset, size) = new_arch.existing_signature_region().expect("signature");
        assert_eq!(offset % SIGNATURE_ALIGN, 0);
        assert_eq!(size, 1008);
        assert_eq!(offset, align_up(original.len(), 16));

        let bytes = signed.as_bytes();
        assert_eq!(&bytes[offset..offset + 1000], blob.as_slice());
        assert!(bytes[offset + 1000..].iter().all(|b| *b == 0));

        let linkedit = new_arch.linkedit()?;
        assert_eq!(linkedit.file_end() as usize, bytes.len());
        assert_eq!(linkedit.vmsize % LINKEDIT_VM_ALIGN, 0);
        assert!(linkedit.vmsize >= linkedit.filesize);

        // Everything but the header counts, the new load command and the
        // __LINKEDIT sizes is untouched.
        let linkedit_cmd = arch.linkedit()?.command_offset;
        let patched = [16..24, linkedit_cmd..linkedit_cmd + 72, arch.load_commands_end()..arch.load_commands_end() + 16];
        for (i, (a, b)) in original.iter().zip(bytes.iter()).enumerate() {
            if patched.iter().any(|r| r.contains(&i)) {
                continue;
            }
            assert_eq!(a, b, "byte {} differs", i);
        }

        Ok(())
    }

    #[test]
    fn replace_existing_signature_in_place() -> Result<(), MachoCodesignError> {
        let original = MachOBuilder::default().build();
        let file = MachOFile::parse(original)?;

        let first = file.replace_signature(0, &[1u8; 3000])?;
        let (offset, _) = first.existing_signature_region(0)?.expect("signature");
        let ncmds = first.arch(0)?.header.ncmds;

        let second = first.replace_signature(0, &[2u8; 100])?;
        let arch = second.arch(0)?;
        assert_eq!(arch.header.ncmds, ncmds);
        assert_eq!(arch.header.sizeofcmds, first.arch(0)?.header.sizeofcmds);
        assert_eq!(arch.existing_signature_region(), Some((offset, 112)));
        assert_eq!(second.as_bytes().len(), offset + 112);
        assert_eq!(&second.as_bytes()[offset..offset + 100], &[2u8; 100][..]);

        let linkedit = arch.linkedit()?;
        assert_eq!(linkedit.file_end() as usize, offset + 112);
        assert_eq!(linkedit.vmsize % LINKEDIT_VM_ALIGN, 0);

        // Only the __LINKEDIT sizes and LC_CODE_SIGNATURE datasize change.
        let linkedit_cmd = linkedit.command_offset;
        let signature_cmd = arch.code_signature_command().expect("signature command").offset;
        let patched = [linkedit_cmd..linkedit_cmd + 72, signature_cmd..signature_cmd + 16];
        for (i, (a, b)) in first.as_bytes()[..offset]
            .iter()
            .zip(&second.as_bytes()[..offset])
            .enumerate()
        {
            if patched.iter().any(|r| r.contains(&i)) {
                continue;
            }
            assert_eq!(a, b, "byte {} differs", i);
        }

        Ok(())
    }

    #[test]
    fn insert_signature_requires_room() -> Result<(), MachoCodesignError> {
        let data = MachOBuilder::default().load_command_slack(8).build();
        let file = MachOFile::parse(data)?;

        let res = file.replace_signature(0, &[0u8; 32]);
        assert!(matches!(
            res,
            Err(MachoCodesignError::Format(FormatError::LoadCommandNoRoom {
                available: 8,
                needed: 16
            }))
        ));

        Ok(())
    }

    #[test]
    fn data_after_linkedit_is_refused() -> Result<(), MachoCodesignError> {
        let mut data = MachOBuilder::default().build();
        data.extend_from_slice(b"trailing");
        let file = MachOFile::parse(data)?;

        assert!(matches!(
            file.replace_signature(0, &[0u8; 32]),
            Err(MachoCodesignError::Format(FormatError::DataAfterSignature))
        ));

        Ok(())
    }

    #[test]
    fn fat_replace_recomputes_offsets() -> Result<(), MachoCodesignError> {
        let x86 = MachOBuilder::default()
            .cpu(CPU_TYPE_X86_64, 3)
            .text_size(4000)
            .build();
        let arm = MachOBuilder::default().text_size(20000).build();

        let file = MachOFile::parse(fat_binary(&[(x86.as_slice(), 12), (arm.as_slice(), 14)]))?;
        assert!(file.is_fat());
        assert_eq!(file.arch(0)?.offset, 4096);
        assert_eq!(file.arch_data(1)?, arm.as_slice());

        let signed = file.replace_signature(0, &vec![7u8; 20000])?;
        let a0 = signed.arch(0)?;
        let a1 = signed.arch(1)?;

        assert_eq!(a0.align, 12);
        assert_eq!(a1.align, 14);
        assert_eq!(a1.offset % 16384, 0);
        assert!(a1.offset >= a0.offset + a0.size);
        assert_eq!(signed.arch_data(1)?, arm.as_slice());
        assert!(a0.existing_signature_region().is_some());

        Ok(())
    }

    #[test]
    fn version_nibbles() {
        assert_eq!(
            parse_version_nibbles(12 << 16 | 1 << 8 | 2),
            semver::Version::new(12, 1, 2)
        );
        assert_eq!(
            parse_version_nibbles(11 << 16 | 10 << 8 | 15),
            semver::Version::new(11, 10, 15)
        );
        assert_eq!(
            semver_to_macho_target_version(&semver::Version::new(12, 1, 2)),
            12 << 16 | 1 << 8 | 2
        );
    }
}
