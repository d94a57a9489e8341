// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Code directory data structure and its builder.

use {
    crate::{
        code_hash::{page_count, paged_digests, validate_page_size},
        embedded_signature::{
            read_and_validate_blob_header, Blob, CodeSigningMagic, CodeSigningSlot, Digest,
            DigestType,
        },
        error::{FormatError, MachoCodesignError},
        macho::{MachoTarget, Platform},
    },
    scroll::{IOwrite, Pread},
    semver::Version,
    std::{borrow::Cow, collections::BTreeMap, io::Write, str::FromStr},
};

bitflags::bitflags! {
    /// Code signature flags.
    ///
    /// These flags are embedded in the Code Directory and govern use of the embedded
    /// signature.
    pub struct CodeSignatureFlags: u32 {
        /// Code may act as a host that controls and supervises guest code.
        const HOST = 0x0001;
        /// The code has been sealed without a signing identity.
        const ADHOC = 0x0002;
        /// Set the "hard" status bit for the code when it starts running.
        const FORCE_HARD = 0x0100;
        /// Implicitly set the "kill" status bit for the code when it starts running.
        const FORCE_KILL = 0x0200;
        /// Force certificate expiration checks.
        const FORCE_EXPIRATION = 0x0400;
        /// Restrict dyld loading.
        const RESTRICT = 0x0800;
        /// Enforce code signing.
        const ENFORCEMENT = 0x1000;
        /// Library validation required.
        const LIBRARY_VALIDATION = 0x2000;
        /// Apply runtime hardening policies.
        const RUNTIME = 0x10000;
        /// The code was automatically signed by the linker.
        const LINKER_SIGNED = 0x20000;
    }
}

impl FromStr for CodeSignatureFlags {
    type Err = MachoCodesignError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "host" => Ok(Self::HOST),
            "hard" => Ok(Self::FORCE_HARD),
            "kill" => Ok(Self::FORCE_KILL),
            "expires" => Ok(Self::FORCE_EXPIRATION),
            "library" => Ok(Self::LIBRARY_VALIDATION),
            "runtime" => Ok(Self::RUNTIME),
            "linker-signed" => Ok(Self::LINKER_SIGNED),
            _ => Err(MachoCodesignError::CodeSignatureUnknownFlag(s.to_string())),
        }
    }
}

impl CodeSignatureFlags {
    /// Attempt to convert a series of strings into a [CodeSignatureFlags].
    pub fn from_strs(s: &[&str]) -> Result<CodeSignatureFlags, MachoCodesignError> {
        let mut flags = CodeSignatureFlags::empty();

        for s in s {
            flags |= Self::from_str(s)?;
        }

        Ok(flags)
    }
}

bitflags::bitflags! {
    /// Flags that influence behavior of executable segment.
    pub struct ExecutableSegmentFlags: u64 {
        /// Executable segment belongs to main binary.
        const MAIN_BINARY = 0x0001;
        /// Allow unsigned pages (for debugging).
        const ALLOW_UNSIGNED = 0x0010;
        /// Main binary is debugger.
        const DEBUGGER = 0x0020;
        /// JIT enabled.
        const JIT = 0x0040;
        /// Skip library validation (obsolete).
        const SKIP_LIBRARY_VALIDATION = 0x0080;
        /// Can bless code directory hash for execution.
        const CAN_LOAD_CD_HASH = 0x0100;
        /// Can execute blessed code directory hash.
        const CAN_EXEC_CD_HASH = 0x0200;
    }
}

impl FromStr for ExecutableSegmentFlags {
    type Err = MachoCodesignError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "main-binary" => Ok(Self::MAIN_BINARY),
            "allow-unsigned" => Ok(Self::ALLOW_UNSIGNED),
            "debugger" => Ok(Self::DEBUGGER),
            "jit" => Ok(Self::JIT),
            "skip-library-validation" => Ok(Self::SKIP_LIBRARY_VALIDATION),
            "can-load-cd-hash" => Ok(Self::CAN_LOAD_CD_HASH),
            "can-exec-cd-hash" => Ok(Self::CAN_EXEC_CD_HASH),
            _ => Err(MachoCodesignError::ExecutableSegmentUnknownFlag(
                s.to_string(),
            )),
        }
    }
}

/// Version of Code Directory data structure.
///
/// Every version appends fields to the fixed header of the previous one.
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
#[repr(u32)]
pub enum CodeDirectoryVersion {
    Initial = 0x20000,
    SupportsScatter = 0x20100,
    SupportsTeamId = 0x20200,
    SupportsCodeLimit64 = 0x20300,
    SupportsExecutableSegment = 0x20400,
    SupportsRuntime = 0x20500,
    SupportsLinkage = 0x20600,
}

fn read_hashes(
    data: &[u8],
    offset: usize,
    count: usize,
    hash_size: usize,
) -> Result<Vec<Digest<'_>>, MachoCodesignError> {
    let needed = count * hash_size;

    let region = data
        .get(offset..offset + needed)
        .ok_or(FormatError::Truncated {
            what: "code directory hashes",
            offset,
            needed,
            available: data.len().saturating_sub(offset),
        })?;

    if hash_size == 0 {
        return Ok(vec![]);
    }

    Ok(region
        .chunks(hash_size)
        .map(|data| Digest { data: data.into() })
        .collect())
}

fn read_c_string(data: &[u8], offset: usize) -> Result<&str, MachoCodesignError> {
    let tail = data.get(offset..).ok_or(FormatError::Truncated {
        what: "code directory string",
        offset,
        needed: 1,
        available: 0,
    })?;

    let end = tail
        .iter()
        .position(|b| *b == 0)
        .ok_or(MachoCodesignError::RequirementMalformed(
            "code directory string not NUL terminated",
        ))?;

    std::str::from_utf8(&tail[..end])
        .map_err(|_| FormatError::Unsupported("code directory string not UTF-8".into()).into())
}

/// Read a field only present at or above `version`.
fn versioned<T, F>(
    version: u32,
    minimum: CodeDirectoryVersion,
    read: F,
) -> Result<Option<T>, MachoCodesignError>
where
    F: FnOnce() -> Result<T, scroll::Error>,
{
    if version >= minimum as u32 {
        Ok(Some(read()?))
    } else {
        Ok(None)
    }
}

/// Represents a code directory blob entry.
///
/// The struct is a superset of all versions. Fields introduced after the
/// blob's version are `None`.
#[derive(Clone, Debug)]
pub struct CodeDirectoryBlob<'a> {
    /// Compatibility version.
    pub version: u32,
    /// Setup and mode flags.
    pub flags: CodeSignatureFlags,
    /// File offset to stop digesting code data at.
    ///
    /// This is where the signature data begins in `__LINKEDIT`.
    pub code_limit: u32,
    /// Size of each hash in bytes.
    pub hash_size: u8,
    /// Type of hash.
    pub hash_type: DigestType,
    /// Platform identifier. 0 if not platform binary.
    pub platform: u8,
    /// Page size in bytes. Stored as log2 u8.
    pub page_size: u32,
    pub spare2: u32,
    // Version 0x20100
    pub scatter_offset: Option<u32>,
    // Version 0x20300
    pub spare3: Option<u32>,
    pub code_limit_64: Option<u64>,
    // Version 0x20400
    /// File offset of executable segment.
    pub exec_seg_base: Option<u64>,
    /// Limit of executable segment.
    pub exec_seg_limit: Option<u64>,
    pub exec_seg_flags: Option<ExecutableSegmentFlags>,
    // Version 0x20500
    pub runtime: Option<u32>,
    pub pre_encrypt_offset: Option<u32>,
    // Version 0x20600
    pub linkage_hash_type: Option<u8>,
    pub linkage_truncated: Option<u8>,
    pub spare4: Option<u16>,
    pub linkage_offset: Option<u32>,
    pub linkage_size: Option<u32>,

    pub ident: Cow<'a, str>,
    pub team_name: Option<Cow<'a, str>>,
    pub code_hashes: Vec<Digest<'a>>,
    pub special_hashes: BTreeMap<CodeSigningSlot, Digest<'a>>,
}

impl<'a> Blob<'a> for CodeDirectoryBlob<'a> {
    fn magic() -> u32 {
        u32::from(CodeSigningMagic::CodeDirectory)
    }

    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, MachoCodesignError> {
        read_and_validate_blob_header(data, Self::magic(), "code directory blob")?;

        let offset = &mut 8;

        let version: u32 = data.gread_with(offset, scroll::BE)?;
        let flags = CodeSignatureFlags::from_bits_truncate(data.gread_with(offset, scroll::BE)?);
        let hash_offset = data.gread_with::<u32>(offset, scroll::BE)?;
        let ident_offset = data.gread_with::<u32>(offset, scroll::BE)?;
        let n_special_slots = data.gread_with::<u32>(offset, scroll::BE)?;
        let n_code_slots = data.gread_with::<u32>(offset, scroll::BE)?;
        let code_limit = data.gread_with(offset, scroll::BE)?;
        let hash_size = data.gread_with::<u8>(offset, scroll::BE)?;
        let hash_type = data.gread_with::<u8>(offset, scroll::BE)?.into();
        let platform = data.gread_with(offset, scroll::BE)?;
        let page_size_log = data.gread_with::<u8>(offset, scroll::BE)?;
        if page_size_log >= 32 {
            return Err(FormatError::Unsupported(format!(
                "code directory page size 2^{}",
                page_size_log
            ))
            .into());
        }
        let page_size = 1u32 << page_size_log;
        let spare2 = data.gread_with(offset, scroll::BE)?;

        let scatter_offset = versioned(version, CodeDirectoryVersion::SupportsScatter, || {
            data.gread_with::<u32>(offset, scroll::BE)
        })?
        .filter(|v| *v != 0);
        let team_offset = versioned(version, CodeDirectoryVersion::SupportsTeamId, || {
            data.gread_with::<u32>(offset, scroll::BE)
        })?
        .filter(|v| *v != 0);
        let spare3 = versioned(version, CodeDirectoryVersion::SupportsCodeLimit64, || {
            data.gread_with(offset, scroll::BE)
        })?;
        let code_limit_64 = versioned(version, CodeDirectoryVersion::SupportsCodeLimit64, || {
            data.gread_with(offset, scroll::BE)
        })?;
        let exec_seg_base =
            versioned(version, CodeDirectoryVersion::SupportsExecutableSegment, || {
                data.gread_with(offset, scroll::BE)
            })?;
        let exec_seg_limit =
            versioned(version, CodeDirectoryVersion::SupportsExecutableSegment, || {
                data.gread_with(offset, scroll::BE)
            })?;
        let exec_seg_flags =
            versioned(version, CodeDirectoryVersion::SupportsExecutableSegment, || {
                data.gread_with::<u64>(offset, scroll::BE)
            })?
            .map(ExecutableSegmentFlags::from_bits_truncate);
        let runtime = versioned(version, CodeDirectoryVersion::SupportsRuntime, || {
            data.gread_with(offset, scroll::BE)
        })?;
        let pre_encrypt_offset = versioned(version, CodeDirectoryVersion::SupportsRuntime, || {
            data.gread_with(offset, scroll::BE)
        })?;
        let linkage_hash_type = versioned(version, CodeDirectoryVersion::SupportsLinkage, || {
            data.gread_with(offset, scroll::BE)
        })?;
        let linkage_truncated = versioned(version, CodeDirectoryVersion::SupportsLinkage, || {
            data.gread_with(offset, scroll::BE)
        })?;
        let spare4 = versioned(version, CodeDirectoryVersion::SupportsLinkage, || {
            data.gread_with(offset, scroll::BE)
        })?;
        let linkage_offset = versioned(version, CodeDirectoryVersion::SupportsLinkage, || {
            data.gread_with(offset, scroll::BE)
        })?;
        let linkage_size = versioned(version, CodeDirectoryVersion::SupportsLinkage, || {
            data.gread_with(offset, scroll::BE)
        })?;

        let ident = Cow::from(read_c_string(data, ident_offset as usize)?);
        let team_name = team_offset
            .map(|offset| read_c_string(data, offset as usize).map(Cow::from))
            .transpose()?;

        let code_hashes = read_hashes(
            data,
            hash_offset as usize,
            n_code_slots as usize,
            hash_size as usize,
        )?;

        let specials_start = (hash_offset as usize)
            .checked_sub(hash_size as usize * n_special_slots as usize)
            .ok_or(FormatError::SuperblobMalformed)?;

        let special_hashes = read_hashes(
            data,
            specials_start,
            n_special_slots as usize,
            hash_size as usize,
        )?
        .into_iter()
        .enumerate()
        .map(|(i, h)| (CodeSigningSlot::from(n_special_slots - i as u32), h))
        .filter(|(_, h)| !h.is_null())
        .collect();

        Ok(Self {
            version,
            flags,
            code_limit,
            hash_size,
            hash_type,
            platform,
            page_size,
            spare2,
            scatter_offset,
            spare3,
            code_limit_64,
            exec_seg_base,
            exec_seg_limit,
            exec_seg_flags,
            runtime,
            pre_encrypt_offset,
            linkage_hash_type,
            linkage_truncated,
            spare4,
            linkage_offset,
            linkage_size,
            ident,
            team_name,
            code_hashes,
            special_hashes,
        })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, MachoCodesignError> {
        if self.scatter_offset.is_some() {
            return Err(MachoCodesignError::SignatureBuilder(
                "scatter vectors are not supported",
            ));
        }

        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());

        // Offsets are backpatched once the variable length data is laid out.
        cursor.iowrite_with(self.version, scroll::BE)?;
        cursor.iowrite_with(self.flags.bits(), scroll::BE)?;
        let hash_offset_cursor_position = cursor.position();
        cursor.iowrite_with(0u32, scroll::BE)?;
        let ident_offset_cursor_position = cursor.position();
        cursor.iowrite_with(0u32, scroll::BE)?;

        // Special hashes live at negative indices before the code hashes and
        // every slot below the highest present one occupies space.
        let highest_slot = self
            .special_hashes
            .keys()
            .map(|slot| u32::from(*slot))
            .max()
            .unwrap_or(0);

        cursor.iowrite_with(highest_slot, scroll::BE)?;
        cursor.iowrite_with(self.code_hashes.len() as u32, scroll::BE)?;
        cursor.iowrite_with(self.code_limit, scroll::BE)?;
        cursor.iowrite_with(self.hash_size, scroll::BE)?;
        cursor.iowrite_with(u8::from(self.hash_type), scroll::BE)?;
        cursor.iowrite_with(self.platform, scroll::BE)?;
        cursor.iowrite_with(self.page_size.trailing_zeros() as u8, scroll::BE)?;
        cursor.iowrite_with(self.spare2, scroll::BE)?;

        let at_least = |v: CodeDirectoryVersion| self.version >= v as u32;

        let mut team_offset_cursor_position = None;

        if at_least(CodeDirectoryVersion::SupportsScatter) {
            cursor.iowrite_with(0u32, scroll::BE)?;
        }
        if at_least(CodeDirectoryVersion::SupportsTeamId) {
            team_offset_cursor_position = Some(cursor.position());
            cursor.iowrite_with(0u32, scroll::BE)?;
        }
        if at_least(CodeDirectoryVersion::SupportsCodeLimit64) {
            cursor.iowrite_with(self.spare3.unwrap_or(0), scroll::BE)?;
            cursor.iowrite_with(self.code_limit_64.unwrap_or(0), scroll::BE)?;
        }
        if at_least(CodeDirectoryVersion::SupportsExecutableSegment) {
            cursor.iowrite_with(self.exec_seg_base.unwrap_or(0), scroll::BE)?;
            cursor.iowrite_with(self.exec_seg_limit.unwrap_or(0), scroll::BE)?;
            cursor.iowrite_with(
                self.exec_seg_flags
                    .unwrap_or_else(ExecutableSegmentFlags::empty)
                    .bits(),
                scroll::BE,
            )?;
        }
        if at_least(CodeDirectoryVersion::SupportsRuntime) {
            cursor.iowrite_with(self.runtime.unwrap_or(0), scroll::BE)?;
            cursor.iowrite_with(self.pre_encrypt_offset.unwrap_or(0), scroll::BE)?;
        }
        if at_least(CodeDirectoryVersion::SupportsLinkage) {
            cursor.iowrite_with(self.linkage_hash_type.unwrap_or(0), scroll::BE)?;
            cursor.iowrite_with(self.linkage_truncated.unwrap_or(0), scroll::BE)?;
            cursor.iowrite_with(self.spare4.unwrap_or(0), scroll::BE)?;
            cursor.iowrite_with(self.linkage_offset.unwrap_or(0), scroll::BE)?;
            cursor.iowrite_with(self.linkage_size.unwrap_or(0), scroll::BE)?;
        }

        let identity_offset = cursor.position();
        cursor.write_all(self.ident.as_bytes())?;
        cursor.write_all(b"\0")?;

        let team_offset = cursor.position();
        let team_written = match (&self.team_name, team_offset_cursor_position) {
            (Some(team_name), Some(_)) => {
                cursor.write_all(team_name.as_bytes())?;
                cursor.write_all(b"\0")?;
                true
            }
            _ => false,
        };

        // Highest slot first, down to slot 1. Slot 0 is the first code digest.
        for slot_index in (1..=highest_slot).rev() {
            let slot = CodeSigningSlot::from(slot_index);
            if !slot.is_code_directory_specials_expressible() {
                return Err(MachoCodesignError::SignatureBuilder(
                    "special slot not expressible in code directory",
                ));
            }

            match self.special_hashes.get(&slot) {
                Some(hash) if hash.data.len() == self.hash_size as usize => {
                    cursor.write_all(&hash.data)?;
                }
                Some(_) => {
                    return Err(MachoCodesignError::SignatureBuilder(
                        "special slot digest length disagrees with hash size",
                    ));
                }
                None => {
                    cursor.write_all(&vec![0u8; self.hash_size as usize])?;
                }
            }
        }

        let code_hashes_start_offset = cursor.position();

        for hash in &self.code_hashes {
            cursor.write_all(&hash.data)?;
        }

        // Recorded offsets are relative to the blob start, which includes the
        // 8 byte header not present in this buffer.
        cursor.set_position(hash_offset_cursor_position);
        cursor.iowrite_with(code_hashes_start_offset as u32 + 8, scroll::BE)?;

        cursor.set_position(ident_offset_cursor_position);
        cursor.iowrite_with(identity_offset as u32 + 8, scroll::BE)?;

        if let (true, Some(position)) = (team_written, team_offset_cursor_position) {
            cursor.set_position(position);
            cursor.iowrite_with(team_offset as u32 + 8, scroll::BE)?;
        }

        Ok(cursor.into_inner())
    }
}

impl<'a> CodeDirectoryBlob<'a> {
    /// Lower the version to the minimum that carries every populated field.
    ///
    /// Targeting information can raise the floor. Returns the old version.
    pub fn adjust_version(&mut self, target: Option<&MachoTarget>) -> u32 {
        let old_version = self.version;

        let mut minimum_version = CodeDirectoryVersion::Initial;

        if self.scatter_offset.is_some() {
            minimum_version = CodeDirectoryVersion::SupportsScatter;
        }
        if self.team_name.is_some() {
            minimum_version = CodeDirectoryVersion::SupportsTeamId;
        }
        if self.spare3.is_some() || self.code_limit_64.is_some() {
            minimum_version = CodeDirectoryVersion::SupportsCodeLimit64;
        }
        if self.exec_seg_base.is_some()
            || self.exec_seg_limit.is_some()
            || self.exec_seg_flags.is_some()
        {
            minimum_version = CodeDirectoryVersion::SupportsExecutableSegment;
        }
        if self.runtime.is_some() || self.pre_encrypt_offset.is_some() {
            minimum_version = CodeDirectoryVersion::SupportsRuntime;
        }
        if self.linkage_hash_type.is_some()
            || self.linkage_truncated.is_some()
            || self.spare4.is_some()
            || self.linkage_offset.is_some()
            || self.linkage_size.is_some()
        {
            minimum_version = CodeDirectoryVersion::SupportsLinkage;
        }

        if let Some(target) = target {
            let target_minimum = match target.platform {
                // iOS 15 refuses pre executable segment code directories.
                Platform::IOs | Platform::IosSimulator
                    if target.minimum_os_version >= Version::new(15, 0, 0) =>
                {
                    CodeDirectoryVersion::SupportsExecutableSegment
                }
                Platform::MacOs if target.minimum_os_version >= Version::new(12, 0, 0) => {
                    CodeDirectoryVersion::SupportsExecutableSegment
                }
                _ => CodeDirectoryVersion::Initial,
            };

            minimum_version = minimum_version.max(target_minimum);
        }

        self.version = minimum_version as u32;

        old_version
    }

    /// Clears optional fields that are newer than the current version.
    pub fn clear_newer_fields(&mut self) {
        let below = |v: CodeDirectoryVersion| self.version < v as u32;

        if below(CodeDirectoryVersion::SupportsScatter) {
            self.scatter_offset = None;
        }
        if below(CodeDirectoryVersion::SupportsTeamId) {
            self.team_name = None;
        }
        if below(CodeDirectoryVersion::SupportsCodeLimit64) {
            self.spare3 = None;
            self.code_limit_64 = None;
        }
        if below(CodeDirectoryVersion::SupportsExecutableSegment) {
            self.exec_seg_base = None;
            self.exec_seg_limit = None;
            self.exec_seg_flags = None;
        }
        if below(CodeDirectoryVersion::SupportsRuntime) {
            self.runtime = None;
            self.pre_encrypt_offset = None;
        }
        if below(CodeDirectoryVersion::SupportsLinkage) {
            self.linkage_hash_type = None;
            self.linkage_truncated = None;
            self.spare4 = None;
            self.linkage_offset = None;
            self.linkage_size = None;
        }
    }

    /// The digest of this serialized blob, a.k.a. the CDHash.
    pub fn cdhash(&self) -> Result<Vec<u8>, MachoCodesignError> {
        self.digest_with(self.hash_type)
    }

    /// The CDHash truncated to 20 bytes, as used in ticket records and CMS attributes.
    pub fn cdhash_truncated(&self) -> Result<Vec<u8>, MachoCodesignError> {
        let mut digest = self.cdhash()?;
        digest.truncate(20);

        Ok(digest)
    }

    pub fn to_owned(&self) -> CodeDirectoryBlob<'static> {
        CodeDirectoryBlob {
            version: self.version,
            flags: self.flags,
            code_limit: self.code_limit,
            hash_size: self.hash_size,
            hash_type: self.hash_type,
            platform: self.platform,
            page_size: self.page_size,
            spare2: self.spare2,
            scatter_offset: self.scatter_offset,
            spare3: self.spare3,
            code_limit_64: self.code_limit_64,
            exec_seg_base: self.exec_seg_base,
            exec_seg_limit: self.exec_seg_limit,
            exec_seg_flags: self.exec_seg_flags,
            runtime: self.runtime,
            pre_encrypt_offset: self.pre_encrypt_offset,
            linkage_hash_type: self.linkage_hash_type,
            linkage_truncated: self.linkage_truncated,
            spare4: self.spare4,
            linkage_offset: self.linkage_offset,
            linkage_size: self.linkage_size,
            ident: Cow::Owned(self.ident.to_string()),
            team_name: self.team_name.as_ref().map(|x| Cow::Owned(x.to_string())),
            code_hashes: self.code_hashes.iter().map(|h| h.to_owned()).collect(),
            special_hashes: self
                .special_hashes
                .iter()
                .map(|(k, v)| (*k, v.to_owned()))
                .collect(),
        }
    }
}

/// Builds a [CodeDirectoryBlob] from code bytes and special slot sources.
///
/// Special slot sources are the full serialized bytes of the blob or file
/// occupying the slot (e.g. the requirement set blob or raw `Info.plist`).
/// Their digests are computed over those bytes verbatim.
#[derive(Clone, Debug)]
pub struct CodeDirectoryBuilder<'a> {
    ident: String,
    digest: DigestType,
    page_size: usize,
    flags: CodeSignatureFlags,
    team_name: Option<String>,
    exec_seg: Option<(u64, u64, ExecutableSegmentFlags)>,
    runtime: Option<u32>,
    platform: u8,
    target: Option<MachoTarget>,
    specials: BTreeMap<CodeSigningSlot, Cow<'a, [u8]>>,
}

impl<'a> CodeDirectoryBuilder<'a> {
    pub fn new(ident: impl ToString, digest: DigestType, page_size: usize) -> Self {
        Self {
            ident: ident.to_string(),
            digest,
            page_size,
            flags: CodeSignatureFlags::empty(),
            team_name: None,
            exec_seg: None,
            runtime: None,
            platform: 0,
            target: None,
            specials: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn flags(mut self, flags: CodeSignatureFlags) -> Self {
        self.flags = flags;
        self
    }

    #[must_use]
    pub fn team_name(mut self, team: Option<String>) -> Self {
        self.team_name = team;
        self
    }

    #[must_use]
    pub fn executable_segment(mut self, base: u64, limit: u64, flags: ExecutableSegmentFlags) -> Self {
        self.exec_seg = Some((base, limit, flags));
        self
    }

    #[must_use]
    pub fn runtime(mut self, version: Option<u32>) -> Self {
        self.runtime = version;
        self
    }

    #[must_use]
    pub fn platform(mut self, platform: u8) -> Self {
        self.platform = platform;
        self
    }

    /// Targeting of the binary, which may raise the minimum version.
    #[must_use]
    pub fn target(mut self, target: Option<MachoTarget>) -> Self {
        self.target = target;
        self
    }

    /// Register the source bytes for a special slot.
    #[must_use]
    pub fn special_slot(mut self, slot: CodeSigningSlot, data: impl Into<Cow<'a, [u8]>>) -> Self {
        self.specials.insert(slot, data.into());
        self
    }

    /// Hash `code` (everything before the signature) into a Code Directory.
    pub fn build(&self, code: &[u8]) -> Result<CodeDirectoryBlob<'static>, MachoCodesignError> {
        validate_page_size(self.page_size)?;

        let code_limit = u32::try_from(code.len()).map_err(|_| {
            FormatError::Unsupported("code larger than 4 GiB requires codeLimit64".into())
        })?;

        let code_hashes = paged_digests(code, self.digest, self.page_size)?
            .into_iter()
            .map(Digest::from)
            .collect::<Vec<_>>();

        debug_assert_eq!(code_hashes.len(), page_count(code.len(), self.page_size));

        let mut special_hashes = BTreeMap::new();
        for (slot, data) in &self.specials {
            if !slot.is_code_directory_specials_expressible() {
                return Err(MachoCodesignError::SignatureBuilder(
                    "special slot not expressible in code directory",
                ));
            }

            special_hashes.insert(*slot, Digest::from(self.digest.digest_data(data)?));
        }

        let (exec_seg_base, exec_seg_limit, exec_seg_flags) = match self.exec_seg {
            Some((base, limit, flags)) => (Some(base), Some(limit), Some(flags)),
            None => (None, None, None),
        };

        let mut cd = CodeDirectoryBlob {
            version: CodeDirectoryVersion::SupportsLinkage as u32,
            flags: self.flags,
            code_limit,
            hash_size: self.digest.hash_len()? as u8,
            hash_type: self.digest,
            platform: self.platform,
            page_size: self.page_size as u32,
            spare2: 0,
            scatter_offset: None,
            spare3: None,
            code_limit_64: None,
            exec_seg_base,
            exec_seg_limit,
            exec_seg_flags,
            runtime: self.runtime,
            pre_encrypt_offset: self.runtime.map(|_| 0),
            linkage_hash_type: None,
            linkage_truncated: None,
            spare4: None,
            linkage_offset: None,
            linkage_size: None,
            ident: Cow::Owned(self.ident.clone()),
            team_name: self.team_name.clone().map(Cow::Owned),
            code_hashes,
            special_hashes,
        };

        cd.adjust_version(self.target.as_ref());
        cd.clear_newer_fields();

        Ok(cd)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn code_signature_flags_from_str() -> Result<(), MachoCodesignError> {
        assert_eq!(
            CodeSignatureFlags::from_str("host")?,
            CodeSignatureFlags::HOST
        );
        assert_eq!(
            CodeSignatureFlags::from_str("runtime")?,
            CodeSignatureFlags::RUNTIME
        );
        assert_eq!(
            CodeSignatureFlags::from_strs(&["hard", "kill"])?,
            CodeSignatureFlags::FORCE_HARD | CodeSignatureFlags::FORCE_KILL
        );
        assert!(CodeSignatureFlags::from_str("bogus").is_err());
        assert_eq!(
            ExecutableSegmentFlags::from_str("main-binary")?,
            ExecutableSegmentFlags::MAIN_BINARY
        );

        Ok(())
    }

    #[test]
    fn single_page_adhoc_has_one_hash_and_null_specials() -> Result<(), MachoCodesignError> {
        let code = vec![0xcfu8; 4096];

        let cd = CodeDirectoryBuilder::new("com.example.one", DigestType::Sha256, 4096)
            .flags(CodeSignatureFlags::ADHOC)
            .build(&code)?;

        assert_eq!(cd.code_hashes.len(), 1);
        assert!(cd.special_hashes.is_empty());
        assert_eq!(cd.code_limit, 4096);
        assert_eq!(cd.version, CodeDirectoryVersion::Initial as u32);

        let serialized = cd.to_blob_bytes()?;
        let parsed = CodeDirectoryBlob::from_blob_bytes(&serialized)?;
        assert_eq!(parsed.code_hashes, cd.code_hashes);
        assert!(parsed.special_hashes.is_empty());
        assert_eq!(parsed.ident, "com.example.one");
        assert!(parsed.flags.contains(CodeSignatureFlags::ADHOC));

        Ok(())
    }

    #[test]
    fn zero_length_code_is_not_an_error() -> Result<(), MachoCodesignError> {
        let cd = CodeDirectoryBuilder::new("empty", DigestType::Sha256, 4096).build(&[])?;

        assert!(cd.code_hashes.is_empty());
        assert_eq!(cd.code_limit, 0);
        cd.to_blob_bytes()?;

        Ok(())
    }

    #[test]
    fn special_slots_written_at_fixed_indices() -> Result<(), MachoCodesignError> {
        let requirements = b"requirements".to_vec();
        let entitlements = b"entitlements".to_vec();

        let cd = CodeDirectoryBuilder::new("ident", DigestType::Sha256, 4096)
            .special_slot(CodeSigningSlot::RequirementSet, requirements.clone())
            .special_slot(CodeSigningSlot::Entitlements, entitlements.clone())
            .build(&[1, 2, 3])?;

        let data = cd.to_blob_bytes()?;
        let hash_offset = data.pread_with::<u32>(16, scroll::BE)? as usize;
        let n_special = data.pread_with::<u32>(24, scroll::BE)?;
        assert_eq!(n_special, 5);

        let slot = |n: usize| &data[hash_offset - n * 32..hash_offset - (n - 1) * 32];

        assert_eq!(slot(2), DigestType::Sha256.digest_data(&requirements)?.as_slice());
        assert_eq!(slot(5), DigestType::Sha256.digest_data(&entitlements)?.as_slice());
        assert_eq!(slot(1), &[0u8; 32]);
        assert_eq!(slot(3), &[0u8; 32]);
        assert_eq!(slot(4), &[0u8; 32]);

        Ok(())
    }

    #[test]
    fn single_byte_change_changes_cdhash() -> Result<(), MachoCodesignError> {
        let builder = CodeDirectoryBuilder::new("ident", DigestType::Sha256, 4096);

        let mut code = vec![0u8; 10000];
        let before = builder.build(&code)?.cdhash()?;
        code[9999] = 1;
        let after = builder.build(&code)?.cdhash()?;

        assert_ne!(before, after);
        assert_eq!(before.len(), 32);

        Ok(())
    }

    #[test]
    fn version_follows_populated_fields() -> Result<(), MachoCodesignError> {
        let cd = CodeDirectoryBuilder::new("ident", DigestType::Sha256, 16384)
            .team_name(Some("TEAMID1234".into()))
            .build(&[0; 100])?;
        assert_eq!(cd.version, CodeDirectoryVersion::SupportsTeamId as u32);

        let cd = CodeDirectoryBuilder::new("ident", DigestType::Sha256, 16384)
            .executable_segment(0, 0x4000, ExecutableSegmentFlags::MAIN_BINARY)
            .runtime(Some(0x000c0000))
            .build(&[0; 100])?;
        assert_eq!(cd.version, CodeDirectoryVersion::SupportsRuntime as u32);

        let data = cd.to_blob_bytes()?;
        let parsed = CodeDirectoryBlob::from_blob_bytes(&data)?;
        assert_eq!(parsed.exec_seg_limit, Some(0x4000));
        assert_eq!(parsed.exec_seg_flags, Some(ExecutableSegmentFlags::MAIN_BINARY));
        assert_eq!(parsed.runtime, Some(0x000c0000));
        assert_eq!(parsed.page_size, 16384);

        Ok(())
    }

    #[test]
    fn team_name_roundtrips() -> Result<(), MachoCodesignError> {
        let cd = CodeDirectoryBuilder::new("ident", DigestType::Sha1, 4096)
            .team_name(Some("ABCDE12345".into()))
            .build(&[0; 5000])?;

        let data = cd.to_blob_bytes()?;
        let parsed = CodeDirectoryBlob::from_blob_bytes(&data)?;
        assert_eq!(parsed.team_name.as_deref(), Some("ABCDE12345"));
        assert_eq!(parsed.hash_size, 20);
        assert_eq!(parsed.code_hashes.len(), 2);

        Ok(())
    }
}
