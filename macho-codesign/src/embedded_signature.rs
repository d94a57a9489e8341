// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Embedded signature data structures (superblobs, blob magic, slots).
//!
//! The values in here are pinned against Apple's `cs_blobs.h` header as
//! shipped in xnu. Apple publishes no versioned documentation of these
//! structures, so a reference binary signed by Apple's `codesign` remains the
//! ultimate source of truth.
//!
//! The high-level layout of embedded signature data is:
//!
//! * A `SuperBlob` header giving the magic, total length and number of blobs.
//! * An array of `BlobIndex` describing the slot type and offset of every blob.
//! * N blobs, each starting with a big-endian u32 magic and u32 length that
//!   includes the 8 byte header.

use {
    crate::{
        code_directory::CodeDirectoryBlob, code_requirement::RequirementType,
        error::FormatError, MachoCodesignError,
    },
    cryptographic_message_syntax::SignedData,
    scroll::{IOwrite, Pread},
    std::{
        borrow::Cow,
        cmp::Ordering,
        collections::BTreeMap,
        fmt::{Display, Formatter},
        io::Write,
    },
};

/// Declares a wire-level enum with conversions to and from its integer
/// representation. Values without a variant map to `Unknown`.
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident: $repr:ty {
            $($(#[$vmeta:meta])* $variant:ident = $value:literal,)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($(#[$vmeta])* $variant,)*
            Unknown($repr),
        }

        impl From<$repr> for $name {
            fn from(v: $repr) -> Self {
                match v {
                    $($value => Self::$variant,)*
                    _ => Self::Unknown(v),
                }
            }
        }

        impl From<$name> for $repr {
            fn from(v: $name) -> $repr {
                match v {
                    $($name::$variant => $value,)*
                    $name::Unknown(v) => v,
                }
            }
        }
    };
}

wire_enum! {
    /// Header magic of the blobs we know how to parse.
    #[derive(Debug)]
    pub enum CodeSigningMagic: u32 {
        Requirement = 0xfade0c00,
        RequirementSet = 0xfade0c01,
        CodeDirectory = 0xfade0c02,
        /// The magic of the embedded signature superblob itself.
        EmbeddedSignature = 0xfade0cc0,
        Entitlements = 0xfade7171,
        /// Generic wrapper. The CMS signature is stored in this type.
        BlobWrapper = 0xfade0b01,
    }
}

wire_enum! {
    /// A well-known slot within code signing data.
    ///
    /// Slots 1 through 7 double as the special slot indices of the code
    /// directory: the hash of the blob in slot N is stored N hashes before the
    /// first code page hash.
    pub enum CodeSigningSlot: u32 {
        CodeDirectory = 0,
        Info = 1,
        RequirementSet = 2,
        ResourceDir = 3,
        Application = 4,
        Entitlements = 5,
        RepSpecific = 6,
        EntitlementsDer = 7,
        AlternateCodeDirectory0 = 0x1000,
        Signature = 0x10000,
        Identification = 0x10001,
        /// Stapled notarization ticket. Stored without a blob header.
        Ticket = 0x10002,
    }
}

impl std::fmt::Debug for CodeSigningSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::CodeDirectory => "CodeDirectory",
            Self::Info => "Info",
            Self::RequirementSet => "RequirementSet",
            Self::ResourceDir => "Resources",
            Self::Application => "Application",
            Self::Entitlements => "Entitlements",
            Self::RepSpecific => "Rep Specific",
            Self::EntitlementsDer => "DER Entitlements",
            Self::AlternateCodeDirectory0 => "CodeDirectory Alternate #0",
            Self::Signature => "CMS Signature",
            Self::Identification => "Identification",
            Self::Ticket => "Ticket",
            Self::Unknown(_) => "Unknown",
        };

        f.write_fmt(format_args!("{} ({})", name, u32::from(*self)))
    }
}

impl PartialOrd for CodeSigningSlot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CodeSigningSlot {
    fn cmp(&self, other: &Self) -> Ordering {
        u32::from(*self).cmp(&u32::from(*other))
    }
}

impl CodeSigningSlot {
    /// Whether this slot has a hash recorded in the code directory special slots.
    pub fn is_code_directory_specials_expressible(&self) -> bool {
        (1..=7).contains(&u32::from(*self))
    }

    /// Whether the slot data is stored without a blob header.
    pub fn is_raw_data(&self) -> bool {
        matches!(self, Self::Ticket)
    }
}

#[repr(C)]
#[derive(Clone, Pread)]
struct BlobIndex {
    /// Corresponds to a [CodeSigningSlot] variant.
    typ: u32,
    offset: u32,
}

wire_enum! {
    /// Hash algorithm identifiers used by code directories.
    #[derive(Debug)]
    pub enum DigestType: u8 {
        None = 0,
        Sha1 = 1,
        Sha256 = 2,
        Sha256Truncated = 3,
        Sha384 = 4,
        Sha512 = 5,
    }
}

impl Default for DigestType {
    fn default() -> Self {
        Self::Sha256
    }
}

impl Display for DigestType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            DigestType::None => f.write_str("none"),
            DigestType::Sha1 => f.write_str("sha1"),
            DigestType::Sha256 => f.write_str("sha256"),
            DigestType::Sha256Truncated => f.write_str("sha256-truncated"),
            DigestType::Sha384 => f.write_str("sha384"),
            DigestType::Sha512 => f.write_str("sha512"),
            DigestType::Unknown(v) => f.write_fmt(format_args!("unknown: {}", v)),
        }
    }
}

impl TryFrom<&str> for DigestType {
    type Error = MachoCodesignError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "sha1" => Ok(Self::Sha1),
            "sha256" => Ok(Self::Sha256),
            "sha256-truncated" => Ok(Self::Sha256Truncated),
            "sha384" => Ok(Self::Sha384),
            "sha512" => Ok(Self::Sha512),
            _ => Err(MachoCodesignError::DigestUnknownAlgorithm(s.to_string())),
        }
    }
}

impl DigestType {
    /// Obtain the size of hashes for this hash type.
    pub fn hash_len(&self) -> Result<usize, MachoCodesignError> {
        Ok(self.digest_data(&[])?.len())
    }

    /// Obtain a hasher for this digest type.
    pub fn as_hasher(&self) -> Result<ring::digest::Context, MachoCodesignError> {
        match self {
            Self::Sha1 => Ok(ring::digest::Context::new(
                &ring::digest::SHA1_FOR_LEGACY_USE_ONLY,
            )),
            Self::Sha256 | Self::Sha256Truncated => {
                Ok(ring::digest::Context::new(&ring::digest::SHA256))
            }
            Self::Sha384 => Ok(ring::digest::Context::new(&ring::digest::SHA384)),
            Self::Sha512 => Ok(ring::digest::Context::new(&ring::digest::SHA512)),
            Self::None | Self::Unknown(_) => {
                Err(MachoCodesignError::DigestUnsupportedAlgorithm(*self))
            }
        }
    }

    /// Digest data given the configured hasher.
    pub fn digest_data(&self, data: &[u8]) -> Result<Vec<u8>, MachoCodesignError> {
        let mut hasher = self.as_hasher()?;

        hasher.update(data);
        let mut hash = hasher.finish().as_ref().to_vec();

        if matches!(self, Self::Sha256Truncated) {
            hash.truncate(20);
        }

        Ok(hash)
    }
}

/// A content digest, possibly borrowed from signature data.
#[derive(Clone, Eq, PartialEq)]
pub struct Digest<'a> {
    pub data: Cow<'a, [u8]>,
}

impl<'a> Digest<'a> {
    /// Whether this is the null hash (all 0s).
    pub fn is_null(&self) -> bool {
        self.data.iter().all(|b| *b == 0)
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.data.to_vec()
    }

    pub fn to_owned(&self) -> Digest<'static> {
        Digest {
            data: Cow::Owned(self.data.clone().into_owned()),
        }
    }

    pub fn as_hex(&self) -> String {
        hex::encode(&self.data)
    }
}

impl<'a> std::fmt::Debug for Digest<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(&self.data))
    }
}

impl<'a> From<Vec<u8>> for Digest<'a> {
    fn from(v: Vec<u8>) -> Self {
        Self { data: v.into() }
    }
}

/// Read the header from a Blob.
///
/// Blobs begin with a u32 magic and u32 length, inclusive.
fn read_blob_header(data: &[u8]) -> Result<(u32, usize, &[u8]), MachoCodesignError> {
    let magic = data.pread_with(0, scroll::BE)?;
    let length = data.pread_with::<u32>(4, scroll::BE)?;

    Ok((magic, length as usize, &data[8..]))
}

pub(crate) fn read_and_validate_blob_header<'a>(
    data: &'a [u8],
    expected_magic: u32,
    what: &'static str,
) -> Result<&'a [u8], MachoCodesignError> {
    let (magic, length, _) = read_blob_header(data)?;

    if magic != expected_magic {
        return Err(FormatError::BadMagic(what).into());
    }
    if length < 8 || length > data.len() {
        return Err(FormatError::SuperblobMalformed.into());
    }

    Ok(&data[8..length])
}

/// Create the binary content for a SuperBlob.
///
/// Blobs are indexed in slot order regardless of the order they are given
/// in. Offsets are a prefix sum over blob lengths starting after the index
/// and the total length is exact: no padding is emitted.
pub fn create_superblob<'a>(
    magic: CodeSigningMagic,
    blobs: impl IntoIterator<Item = (CodeSigningSlot, &'a [u8])>,
) -> Result<Vec<u8>, MachoCodesignError> {
    let mut blobs = blobs.into_iter().collect::<Vec<_>>();
    blobs.sort_by_key(|(slot, _)| *slot);

    // magic + total length + blob count + 8 bytes for each blob index.
    let header_length = 12 + 8 * blobs.len();
    let total_length = header_length + blobs.iter().map(|(_, data)| data.len()).sum::<usize>();

    let total_length = u32::try_from(total_length).map_err(|_| FormatError::SuperblobMalformed)?;

    let mut cursor = std::io::Cursor::new(Vec::<u8>::with_capacity(total_length as usize));
    cursor.iowrite_with(u32::from(magic), scroll::BE)?;
    cursor.iowrite_with(total_length, scroll::BE)?;
    cursor.iowrite_with(blobs.len() as u32, scroll::BE)?;

    let mut offset = header_length as u32;
    for (slot, data) in &blobs {
        cursor.iowrite_with(u32::from(*slot), scroll::BE)?;
        cursor.iowrite_with(offset, scroll::BE)?;
        offset += data.len() as u32;
    }
    for (_, data) in blobs {
        cursor.write_all(data)?;
    }

    Ok(cursor.into_inner())
}

/// Represents a single blob as defined by a SuperBlob index entry.
///
/// The blob data is unparsed in this type. Use [BlobEntry::into_parsed_blob]
/// to obtain a [ParsedBlob].
#[derive(Clone)]
pub struct BlobEntry<'a> {
    /// Our blob index within the `SuperBlob`.
    pub index: usize,

    /// The slot type.
    pub slot: CodeSigningSlot,

    /// Our start offset within the `SuperBlob`.
    pub offset: usize,

    /// The magic value appearing at the beginning of the blob.
    pub magic: CodeSigningMagic,

    /// The length of the blob, including its header.
    pub length: usize,

    /// The raw data in this blob, including magic and length.
    pub data: &'a [u8],
}

impl<'a> std::fmt::Debug for BlobEntry<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("BlobEntry")
            .field("index", &self.index)
            .field("slot", &self.slot)
            .field("offset", &self.offset)
            .field("length", &self.length)
            .field("magic", &self.magic)
            .finish()
    }
}

impl<'a> BlobEntry<'a> {
    /// Attempt to convert to a [ParsedBlob].
    pub fn into_parsed_blob(self) -> Result<ParsedBlob<'a>, MachoCodesignError> {
        self.try_into()
    }

    /// Obtain the payload of this blob.
    ///
    /// This is the data in the blob without the blob header.
    pub fn payload(&self) -> Result<&'a [u8], MachoCodesignError> {
        if self.slot.is_raw_data() {
            Ok(self.data)
        } else {
            Ok(read_blob_header(self.data)?.2)
        }
    }

    /// Compute the content digest of this blob using the specified hash type.
    pub fn digest_with(&self, hash: DigestType) -> Result<Vec<u8>, MachoCodesignError> {
        hash.digest_data(self.data)
    }
}

/// Provides common features for a parsed blob type.
pub trait Blob<'a>
where
    Self: Sized,
{
    /// The header magic that identifies this format.
    fn magic() -> u32;

    /// Attempt to construct an instance by parsing a bytes slice.
    ///
    /// The slice begins with the 8 byte blob header denoting the magic
    /// and length.
    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, MachoCodesignError>;

    /// Serialize the payload of this blob to bytes.
    ///
    /// Does not include the magic or length header fields common to blobs.
    fn serialize_payload(&self) -> Result<Vec<u8>, MachoCodesignError>;

    /// Serialize this blob to bytes.
    ///
    /// This is [Blob::serialize_payload] with the blob magic and length
    /// prepended.
    fn to_blob_bytes(&self) -> Result<Vec<u8>, MachoCodesignError> {
        let mut res = Vec::new();
        res.iowrite_with(Self::magic(), scroll::BE)?;

        let payload = self.serialize_payload()?;
        // Length includes our own header.
        res.iowrite_with(payload.len() as u32 + 8, scroll::BE)?;

        res.extend(payload);

        Ok(res)
    }

    /// Obtain the digest of the blob using the specified hasher.
    fn digest_with(&self, hash_type: DigestType) -> Result<Vec<u8>, MachoCodesignError> {
        hash_type.digest_data(&self.to_blob_bytes()?)
    }
}

/// Represents a Requirement blob.
///
/// `csreq -b` emits instances of this blob, header magic and all. So its
/// output can be fed into [RequirementBlob::from_blob_bytes].
#[derive(Clone)]
pub struct RequirementBlob<'a> {
    pub data: Cow<'a, [u8]>,
}

impl<'a> Blob<'a> for RequirementBlob<'a> {
    fn magic() -> u32 {
        u32::from(CodeSigningMagic::Requirement)
    }

    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, MachoCodesignError> {
        let data = read_and_validate_blob_header(data, Self::magic(), "requirement blob")?;

        Ok(Self { data: data.into() })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, MachoCodesignError> {
        Ok(self.data.to_vec())
    }
}

impl<'a> std::fmt::Debug for RequirementBlob<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("RequirementBlob({})", hex::encode(&self.data)))
    }
}

impl<'a> RequirementBlob<'a> {
    pub fn to_owned(&self) -> RequirementBlob<'static> {
        RequirementBlob {
            data: Cow::Owned(self.data.clone().into_owned()),
        }
    }
}

/// Represents a Requirement set blob.
///
/// A Requirement set blob contains nested Requirement blobs keyed by
/// [RequirementType]. An empty set is what ad-hoc signatures carry.
#[derive(Clone, Debug, Default)]
pub struct RequirementSetBlob<'a> {
    pub requirements: BTreeMap<RequirementType, RequirementBlob<'a>>,
}

impl<'a> Blob<'a> for RequirementSetBlob<'a> {
    fn magic() -> u32 {
        u32::from(CodeSigningMagic::RequirementSet)
    }

    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, MachoCodesignError> {
        let payload = read_and_validate_blob_header(data, Self::magic(), "requirement set blob")?;
        let data = &data[..payload.len() + 8];

        // A u32 count followed by N (u32 type, u32 offset) pairs. Offsets are
        // relative to the start of this blob.
        let offset = &mut 8;
        let count = data.gread_with::<u32>(offset, scroll::BE)?;

        let mut indices = Vec::with_capacity(count.min(64) as usize);
        for _ in 0..count {
            indices.push((
                data.gread_with::<u32>(offset, scroll::BE)?,
                data.gread_with::<u32>(offset, scroll::BE)? as usize,
            ));
        }

        let mut requirements = BTreeMap::new();

        for (i, (flavor, start)) in indices.iter().enumerate() {
            let end = indices.get(i + 1).map(|x| x.1).unwrap_or(data.len());

            let requirement_data = data
                .get(*start..end)
                .ok_or(FormatError::SuperblobMalformed)?;

            requirements.insert(
                RequirementType::from(*flavor),
                RequirementBlob::from_blob_bytes(requirement_data)?,
            );
        }

        Ok(Self { requirements })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, MachoCodesignError> {
        let mut res = Vec::new();

        // The index contains blob relative offsets, so the data start is the
        // blob header plus count plus the index.
        let data_start_offset = 8 + 4 + (8 * self.requirements.len() as u32);
        let mut written_requirements_data = 0;

        res.iowrite_with(self.requirements.len() as u32, scroll::BE)?;

        let blobs = self
            .requirements
            .iter()
            .map(|(typ, requirement)| Ok((*typ, requirement.to_blob_bytes()?)))
            .collect::<Result<Vec<_>, MachoCodesignError>>()?;

        for (typ, data) in &blobs {
            res.iowrite_with(u32::from(*typ), scroll::BE)?;
            res.iowrite_with(data_start_offset + written_requirements_data, scroll::BE)?;
            written_requirements_data += data.len() as u32;
        }

        for (_, data) in blobs {
            res.write_all(&data)?;
        }

        Ok(res)
    }
}

impl<'a> RequirementSetBlob<'a> {
    pub fn to_owned(&self) -> RequirementSetBlob<'static> {
        RequirementSetBlob {
            requirements: self
                .requirements
                .iter()
                .map(|(flavor, blob)| (*flavor, blob.to_owned()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    /// Set the requirements for a given [RequirementType].
    pub fn set_requirements(&mut self, slot: RequirementType, blob: RequirementBlob<'a>) {
        self.requirements.insert(slot, blob);
    }
}

/// Represents an Entitlements blob.
///
/// The payload is an XML plist carried verbatim: its hash is taken over
/// exactly the bytes the caller supplied.
#[derive(Clone, Debug)]
pub struct EntitlementsBlob<'a> {
    plist: Cow<'a, str>,
}

impl<'a> Blob<'a> for EntitlementsBlob<'a> {
    fn magic() -> u32 {
        u32::from(CodeSigningMagic::Entitlements)
    }

    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, MachoCodesignError> {
        let data = read_and_validate_blob_header(data, Self::magic(), "entitlements blob")?;
        let s = std::str::from_utf8(data).map_err(MachoCodesignError::EntitlementsBadUtf8)?;

        Ok(Self { plist: s.into() })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, MachoCodesignError> {
        Ok(self.plist.as_bytes().to_vec())
    }
}

impl<'a> EntitlementsBlob<'a> {
    /// Construct an instance using any string as the payload.
    pub fn from_string(s: &(impl ToString + ?Sized)) -> Self {
        Self {
            plist: s.to_string().into(),
        }
    }

    /// Obtain the plist representation as a string.
    pub fn as_str(&self) -> &str {
        &self.plist
    }
}

impl<'a> std::fmt::Display for EntitlementsBlob<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.plist)
    }
}

/// Represents a generic blob wrapper.
///
/// The CMS signature lives in one of these.
pub struct BlobWrapperBlob<'a> {
    data: Cow<'a, [u8]>,
}

impl<'a> Blob<'a> for BlobWrapperBlob<'a> {
    fn magic() -> u32 {
        u32::from(CodeSigningMagic::BlobWrapper)
    }

    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, MachoCodesignError> {
        Ok(Self {
            data: read_and_validate_blob_header(data, Self::magic(), "blob wrapper blob")?.into(),
        })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, MachoCodesignError> {
        Ok(self.data.to_vec())
    }
}

impl<'a> std::fmt::Debug for BlobWrapperBlob<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("BlobWrapper({} bytes)", self.data.len()))
    }
}

impl BlobWrapperBlob<'static> {
    /// Construct an instance with payload data.
    pub fn from_data_owned(data: Vec<u8>) -> BlobWrapperBlob<'static> {
        Self { data: data.into() }
    }
}

/// Represents an unknown blob type.
pub struct OtherBlob<'a> {
    pub magic: u32,
    pub data: &'a [u8],
}

impl<'a> Blob<'a> for OtherBlob<'a> {
    fn magic() -> u32 {
        // Placeholder: the real magic is per instance.
        u32::MAX
    }

    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, MachoCodesignError> {
        let (magic, _, data) = read_blob_header(data)?;

        Ok(Self { magic, data })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, MachoCodesignError> {
        Ok(self.data.to_vec())
    }

    fn to_blob_bytes(&self) -> Result<Vec<u8>, MachoCodesignError> {
        let mut res = Vec::with_capacity(self.data.len() + 8);
        res.iowrite_with(self.magic, scroll::BE)?;
        res.iowrite_with(self.data.len() as u32 + 8, scroll::BE)?;
        res.write_all(self.data)?;

        Ok(res)
    }
}

impl<'a> std::fmt::Debug for OtherBlob<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("OtherBlob({:#x}, {} bytes)", self.magic, self.data.len()))
    }
}

/// Represents a single, parsed Blob entry/slot.
#[derive(Debug)]
pub enum BlobData<'a> {
    Requirement(Box<RequirementBlob<'a>>),
    RequirementSet(Box<RequirementSetBlob<'a>>),
    CodeDirectory(Box<CodeDirectoryBlob<'a>>),
    Entitlements(Box<EntitlementsBlob<'a>>),
    BlobWrapper(Box<BlobWrapperBlob<'a>>),
    Other(Box<OtherBlob<'a>>),
}

impl<'a> Blob<'a> for BlobData<'a> {
    fn magic() -> u32 {
        u32::MAX
    }

    /// Parse blob data by reading its magic and feeding into magic-specific parser.
    fn from_blob_bytes(data: &'a [u8]) -> Result<Self, MachoCodesignError> {
        let (magic, length, _) = read_blob_header(data)?;

        let data = data.get(0..length).ok_or(FormatError::SuperblobMalformed)?;

        Ok(match CodeSigningMagic::from(magic) {
            CodeSigningMagic::Requirement => {
                Self::Requirement(Box::new(RequirementBlob::from_blob_bytes(data)?))
            }
            CodeSigningMagic::RequirementSet => {
                Self::RequirementSet(Box::new(RequirementSetBlob::from_blob_bytes(data)?))
            }
            CodeSigningMagic::CodeDirectory => {
                Self::CodeDirectory(Box::new(CodeDirectoryBlob::from_blob_bytes(data)?))
            }
            CodeSigningMagic::Entitlements => {
                Self::Entitlements(Box::new(EntitlementsBlob::from_blob_bytes(data)?))
            }
            CodeSigningMagic::BlobWrapper => {
                Self::BlobWrapper(Box::new(BlobWrapperBlob::from_blob_bytes(data)?))
            }
            _ => Self::Other(Box::new(OtherBlob::from_blob_bytes(data)?)),
        })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, MachoCodesignError> {
        match self {
            Self::Requirement(b) => b.serialize_payload(),
            Self::RequirementSet(b) => b.serialize_payload(),
            Self::CodeDirectory(b) => b.serialize_payload(),
            Self::Entitlements(b) => b.serialize_payload(),
            Self::BlobWrapper(b) => b.serialize_payload(),
            Self::Other(b) => b.serialize_payload(),
        }
    }

    fn to_blob_bytes(&self) -> Result<Vec<u8>, MachoCodesignError> {
        match self {
            Self::Requirement(b) => b.to_blob_bytes(),
            Self::RequirementSet(b) => b.to_blob_bytes(),
            Self::CodeDirectory(b) => b.to_blob_bytes(),
            Self::Entitlements(b) => b.to_blob_bytes(),
            Self::BlobWrapper(b) => b.to_blob_bytes(),
            Self::Other(b) => b.to_blob_bytes(),
        }
    }
}

impl<'a> From<RequirementSetBlob<'a>> for BlobData<'a> {
    fn from(b: RequirementSetBlob<'a>) -> Self {
        Self::RequirementSet(Box::new(b))
    }
}

impl<'a> From<CodeDirectoryBlob<'a>> for BlobData<'a> {
    fn from(b: CodeDirectoryBlob<'a>) -> Self {
        Self::CodeDirectory(Box::new(b))
    }
}

impl<'a> From<EntitlementsBlob<'a>> for BlobData<'a> {
    fn from(b: EntitlementsBlob<'a>) -> Self {
        Self::Entitlements(Box::new(b))
    }
}

impl<'a> From<BlobWrapperBlob<'a>> for BlobData<'a> {
    fn from(b: BlobWrapperBlob<'a>) -> Self {
        Self::BlobWrapper(Box::new(b))
    }
}

/// Represents the parsed content of a blob entry.
#[derive(Debug)]
pub struct ParsedBlob<'a> {
    /// The blob record this blob came from.
    pub blob_entry: BlobEntry<'a>,

    /// The parsed blob data.
    pub blob: BlobData<'a>,
}

impl<'a> TryFrom<BlobEntry<'a>> for ParsedBlob<'a> {
    type Error = MachoCodesignError;

    fn try_from(blob_entry: BlobEntry<'a>) -> Result<Self, Self::Error> {
        let blob = BlobData::from_blob_bytes(blob_entry.data)?;

        Ok(Self { blob_entry, blob })
    }
}

/// A lightly parsed `SuperBlob` with [CodeSigningMagic::EmbeddedSignature].
pub struct EmbeddedSignature<'a> {
    /// Magic value from header.
    pub magic: CodeSigningMagic,
    /// Length of this super blob.
    pub length: u32,
    /// Number of blobs in this super blob.
    pub count: u32,

    /// Raw data backing this super blob.
    pub data: &'a [u8],

    /// All the blobs within this super blob.
    pub blobs: Vec<BlobEntry<'a>>,
}

impl<'a> std::fmt::Debug for EmbeddedSignature<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("SuperBlob")
            .field("magic", &self.magic)
            .field("length", &self.length)
            .field("count", &self.count)
            .field("blobs", &self.blobs)
            .finish()
    }
}

impl<'a> EmbeddedSignature<'a> {
    /// Attempt to parse an embedded signature super blob from data.
    ///
    /// The input is likely the region of `__LINKEDIT` the `LC_CODE_SIGNATURE`
    /// load command points at. Trailing padding after the superblob is
    /// permitted.
    pub fn from_bytes(data: &'a [u8]) -> Result<Self, MachoCodesignError> {
        let offset = &mut 0;

        let magic = data.gread_with::<u32>(offset, scroll::BE)?.into();

        if magic != CodeSigningMagic::EmbeddedSignature {
            return Err(FormatError::BadMagic("embedded signature super blob").into());
        }

        let length = data.gread_with::<u32>(offset, scroll::BE)?;
        let count = data.gread_with::<u32>(offset, scroll::BE)?;

        let data = data
            .get(0..length as usize)
            .ok_or(FormatError::SuperblobMalformed)?;

        let mut blob_indices = Vec::with_capacity(count.min(64) as usize);
        for _ in 0..count {
            blob_indices.push(data.gread_with::<BlobIndex>(offset, scroll::BE)?);
        }

        let mut blobs = Vec::with_capacity(blob_indices.len());

        // Each blob is bounded by the next index entry (or the end of the
        // superblob) before its self-reported length is honored.
        for (i, index) in blob_indices.iter().enumerate() {
            let end_offset = blob_indices
                .get(i + 1)
                .map(|x| x.offset as usize)
                .unwrap_or(data.len());

            let full_slice = data
                .get(index.offset as usize..end_offset)
                .ok_or(FormatError::SuperblobMalformed)?;

            let slot = CodeSigningSlot::from(index.typ);

            let (magic, blob_data) = if slot.is_raw_data() {
                (CodeSigningMagic::Unknown(0), full_slice)
            } else {
                let (magic, blob_length, _) = read_blob_header(full_slice)?;

                if blob_length > full_slice.len() {
                    return Err(FormatError::SuperblobMalformed.into());
                }

                (magic.into(), &full_slice[0..blob_length])
            };

            blobs.push(BlobEntry {
                index: i,
                slot,
                offset: index.offset as usize,
                magic,
                length: blob_data.len(),
                data: blob_data,
            });
        }

        Ok(Self {
            magic,
            length,
            count,
            data,
            blobs,
        })
    }

    /// Find the first occurrence of the specified slot.
    pub fn find_slot(&self, slot: CodeSigningSlot) -> Option<&BlobEntry<'a>> {
        self.blobs.iter().find(|e| e.slot == slot)
    }

    pub fn find_slot_parsed(
        &self,
        slot: CodeSigningSlot,
    ) -> Result<Option<ParsedBlob<'a>>, MachoCodesignError> {
        if let Some(entry) = self.find_slot(slot) {
            Ok(Some(entry.clone().into_parsed_blob()?))
        } else {
            Ok(None)
        }
    }

    /// Parse the blob in `slot` and extract the variant `T` expected there.
    fn parsed_slot<T>(
        &self,
        slot: CodeSigningSlot,
        what: &'static str,
        extract: impl FnOnce(BlobData<'a>) -> Option<T>,
    ) -> Result<Option<T>, MachoCodesignError> {
        match self.find_slot_parsed(slot)? {
            Some(parsed) => extract(parsed.blob)
                .map(Some)
                .ok_or_else(|| FormatError::BadMagic(what).into()),
            None => Ok(None),
        }
    }

    /// Attempt to resolve a parsed `CodeDirectoryBlob` for this signature data.
    ///
    /// Returns `Ok(None)` if there is no code directory slot.
    pub fn code_directory(&self) -> Result<Option<Box<CodeDirectoryBlob<'a>>>, MachoCodesignError> {
        self.parsed_slot(CodeSigningSlot::CodeDirectory, "code directory blob", |blob| {
            match blob {
                BlobData::CodeDirectory(cd) => Some(cd),
                _ => None,
            }
        })
    }

    pub fn entitlements(&self) -> Result<Option<Box<EntitlementsBlob<'a>>>, MachoCodesignError> {
        self.parsed_slot(CodeSigningSlot::Entitlements, "entitlements blob", |blob| {
            match blob {
                BlobData::Entitlements(entitlements) => Some(entitlements),
                _ => None,
            }
        })
    }

    pub fn code_requirements(
        &self,
    ) -> Result<Option<Box<RequirementSetBlob<'a>>>, MachoCodesignError> {
        self.parsed_slot(CodeSigningSlot::RequirementSet, "requirements blob", |blob| {
            match blob {
                BlobData::RequirementSet(reqs) => Some(reqs),
                _ => None,
            }
        })
    }

    /// Attempt to resolve raw CMS signature data.
    ///
    /// The returned data is likely DER PKCS#7 with the root object
    /// pkcs7-signedData (1.2.840.113549.1.7.2).
    pub fn signature_data(&self) -> Result<Option<&'a [u8]>, MachoCodesignError> {
        if let Some(parsed) = self.find_slot(CodeSigningSlot::Signature) {
            ParsedBlob::try_from(parsed.clone())?;

            Ok(Some(parsed.payload()?))
        } else {
            Ok(None)
        }
    }

    /// Obtain the parsed CMS [SignedData].
    pub fn signed_data(&self) -> Result<Option<SignedData>, MachoCodesignError> {
        match self.signature_data()? {
            Some(data) if !data.is_empty() => Ok(Some(SignedData::parse_ber(data)?)),
            _ => Ok(None),
        }
    }

    /// Raw notarization ticket data stapled into this signature, if any.
    pub fn ticket_data(&self) -> Option<&'a [u8]> {
        self.find_slot(CodeSigningSlot::Ticket).map(|entry| entry.data)
    }

    /// Obtain `(slot, raw blob bytes)` for every blob, in index order.
    pub fn slot_data(&self) -> Vec<(CodeSigningSlot, &'a [u8])> {
        self.blobs.iter().map(|b| (b.slot, b.data)).collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn superblob_orders_by_slot_and_prefix_sums_offsets() -> Result<(), MachoCodesignError> {
        let cd = [0xfa, 0xde, 0x0c, 0x02, 0, 0, 0, 12, 1, 2, 3, 4];
        let reqs = [0xfa, 0xde, 0x0c, 0x01, 0, 0, 0, 12, 0, 0, 0, 0];

        // Deliberately out of order.
        let data = create_superblob(
            CodeSigningMagic::EmbeddedSignature,
            vec![
                (CodeSigningSlot::RequirementSet, &reqs[..]),
                (CodeSigningSlot::CodeDirectory, &cd[..]),
            ],
        )?;

        assert_eq!(data.len(), 12 + 16 + 24);
        assert_eq!(data.pread_with::<u32>(4, scroll::BE)?, data.len() as u32);

        let sig = EmbeddedSignature::from_bytes(&data)?;
        assert_eq!(sig.count, 2);
        assert_eq!(sig.blobs[0].slot, CodeSigningSlot::CodeDirectory);
        assert_eq!(sig.blobs[0].offset, 28);
        assert_eq!(sig.blobs[1].slot, CodeSigningSlot::RequirementSet);
        assert_eq!(sig.blobs[1].offset, 40);
        assert_eq!(sig.blobs[1].data, &reqs[..]);

        let empty = sig.code_requirements()?.expect("requirement set present");
        assert!(empty.requirements.is_empty());

        Ok(())
    }

    #[test]
    fn superblob_rejects_overlong_blob() -> Result<(), MachoCodesignError> {
        // Blob claims 64 bytes but only 12 are present.
        let blob = [0xfa, 0xde, 0x71, 0x71, 0, 0, 0, 64, 1, 2, 3, 4];
        let data = create_superblob(
            CodeSigningMagic::EmbeddedSignature,
            vec![(CodeSigningSlot::Entitlements, &blob[..])],
        )?;

        assert!(matches!(
            EmbeddedSignature::from_bytes(&data),
            Err(MachoCodesignError::Format(FormatError::SuperblobMalformed))
        ));

        Ok(())
    }

    #[test]
    fn superblob_rejects_bad_magic() {
        let data = [0u8; 16];
        assert!(matches!(
            EmbeddedSignature::from_bytes(&data),
            Err(MachoCodesignError::Format(FormatError::BadMagic(_)))
        ));
    }

    #[test]
    fn ticket_slot_is_raw() -> Result<(), MachoCodesignError> {
        let ticket = b"s8chticketdata";
        let data = create_superblob(
            CodeSigningMagic::EmbeddedSignature,
            vec![(CodeSigningSlot::Ticket, &ticket[..])],
        )?;

        let sig = EmbeddedSignature::from_bytes(&data)?;
        assert_eq!(sig.ticket_data(), Some(&ticket[..]));

        Ok(())
    }

    #[test]
    fn empty_requirement_set_encoding() -> Result<(), MachoCodesignError> {
        let blob = RequirementSetBlob::default().to_blob_bytes()?;
        assert_eq!(blob, vec![0xfa, 0xde, 0x0c, 0x01, 0, 0, 0, 12, 0, 0, 0, 0]);

        Ok(())
    }

    #[test]
    fn digest_lengths() -> Result<(), MachoCodesignError> {
        assert_eq!(DigestType::Sha1.hash_len()?, 20);
        assert_eq!(DigestType::Sha256.hash_len()?, 32);
        assert_eq!(DigestType::Sha256Truncated.hash_len()?, 20);
        assert!(DigestType::None.hash_len().is_err());

        Ok(())
    }
}
