// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Signing Mach-O binaries.
//!
//! There is a circular dependency between the signature and the binary it
//! is embedded in: the Code Directory digests the load commands, and the
//! load commands record the size of the signature. We break it the way
//! `codesign` does. The signature size is estimated first and a slice is
//! derived with that many NULL bytes in place of signature data. Digests
//! are computed over that intermediate slice, then the real signature is
//! padded to the reserved size and written over the placeholder.

use {
    crate::{
        code_directory::{CodeDirectoryBlob, CodeDirectoryBuilder, CodeSignatureFlags, ExecutableSegmentFlags},
        code_hash::paged_digests,
        code_requirement::RequirementType,
        cryptography::{verify_code_directory_signature, SigningIdentity},
        embedded_signature::{Blob, BlobData, CodeSigningSlot, EntitlementsBlob, RequirementBlob, RequirementSetBlob},
        embedded_signature_builder::EmbeddedSignatureBuilder,
        entitlements::plist_to_executable_segment_flags,
        error::{FormatError, MachoCodesignError},
        macho::{semver_to_macho_target_version, Arch, MachOFile},
        policy::derive_designated_requirement,
        signing_settings::{DesignatedRequirementMode, SettingsScope, SigningSettings},
    },
    log::{info, warn},
    rayon::prelude::*,
};

/// Signature space kept free for a notarization ticket stapled later.
///
/// Stapling can't grow the signature without invalidating the hashed load
/// commands, so certificate signatures carry the room up front.
pub const NOTARIZATION_TICKET_RESERVE: usize = 10240;

/// Estimate the size in bytes of an embedded signature for a slice.
///
/// The estimate errs large. Unused space is filled with NULLs.
pub fn estimate_embedded_signature_size(
    arch: &Arch,
    settings: &SigningSettings,
) -> Result<usize, MachoCodesignError> {
    // Assume the fixed data structures and identifiers fit in 1024 bytes.
    let mut size = 1024;

    let code_limit = arch.signature_offset()?;
    let page_size = settings.page_size();
    let pages = code_limit / page_size + 1;
    size += pages * settings.digest_type().hash_len()?;

    if let Some(entitlements) = settings.entitlements_xml(SettingsScope::Main) {
        size += entitlements.len() + 8;
    }

    if let DesignatedRequirementMode::Explicit(data) =
        settings.designated_requirement(SettingsScope::Main)
    {
        size += data.len() + 20;
    }

    if let Some(creds) = settings.identity().credentials() {
        // Assume the CMS structure and its attributes fit in 4k beyond certificates.
        size += 4096;

        for cert in creds.chain() {
            size += cert.constructed_data().len();
        }

        size += NOTARIZATION_TICKET_RESERVE;
    }

    // Round up to the next 1k boundary.
    Ok(((size + 1023) / 1024) * 1024)
}

/// Signs every slice of a Mach-O file.
#[derive(Debug)]
pub struct MachOSigner {
    macho: MachOFile,
}

impl MachOSigner {
    /// Construct a new instance from unparsed data representing a Mach-O binary.
    ///
    /// The data will be parsed as a Mach-O binary (either single arch or fat/universal)
    /// and validated that we are capable of signing it.
    pub fn new(macho_data: Vec<u8>) -> Result<Self, MachoCodesignError> {
        let macho = MachOFile::parse(macho_data)?;

        for arch in macho.arches() {
            arch.check_signing_capability()?;
        }

        Ok(Self { macho })
    }

    /// The parsed binary being signed.
    pub fn macho(&self) -> &MachOFile {
        &self.macho
    }

    /// Derive a signed binary using signing settings.
    ///
    /// Slices are signed in parallel. If any slice fails the whole operation
    /// fails and nothing is returned.
    pub fn sign(&self, settings: &SigningSettings) -> Result<MachOFile, MachoCodesignError> {
        let slices = self
            .macho
            .arches()
            .par_iter()
            .enumerate()
            .map(|(index, arch)| {
                info!("signing Mach-O slice {} ({})", index, arch.arch_name());
                let settings = settings.as_nested_macho_settings(index, arch.header.cputype);

                sign_slice(self.macho.arch_data(index)?, &settings)
                    .map_err(|e| {
                        warn!("signing slice {} failed: {}", index, e);
                        e
                    })
            })
            .collect::<Result<Vec<_>, MachoCodesignError>>()?;

        let signed = self.macho.with_slices(slices)?;

        for index in 0..signed.arches().len() {
            verify_signed_slice(&signed, index, settings.identity())?;
        }

        Ok(signed)
    }
}

/// Sign a single thin slice, returning the new slice bytes.
fn sign_slice(slice: &[u8], settings: &SigningSettings) -> Result<Vec<u8>, MachoCodesignError> {
    let original = MachOFile::parse(slice.to_vec())?;
    let arch = original.arch(0)?;

    // This should have already been checked. But a reparse is cheap compared to
    // emitting a broken binary.
    arch.check_signing_capability()?;

    let reserved = estimate_embedded_signature_size(arch, settings)?;
    info!("estimated signature size: {} bytes", reserved);

    let intermediate = original.replace_signature(0, &vec![0u8; reserved])?;

    let mut signature_data = create_signature_superblob(settings, &intermediate)?;
    info!("total signature size: {} bytes", signature_data.len());

    if signature_data.len() > reserved {
        return Err(FormatError::SignatureDataTooLarge {
            actual: signature_data.len(),
            reserved,
        }
        .into());
    }

    signature_data.resize(reserved, 0);

    Ok(intermediate.replace_signature(0, &signature_data)?.into_bytes())
}

/// Create the embedded signature superblob for a thin slice.
///
/// `macho` must already hold a placeholder signature region of the final
/// size, so the digested load commands are the ones that will be written.
pub fn create_signature_superblob(
    settings: &SigningSettings,
    macho: &MachOFile,
) -> Result<Vec<u8>, MachoCodesignError> {
    let mut builder = EmbeddedSignatureBuilder::default();

    for (slot, blob) in create_special_blobs(settings)? {
        builder.add_blob(slot, &blob)?;
    }

    let code_directory = create_code_directory(settings, macho)?;
    info!("code directory version: {:#x}", code_directory.version);

    let code_directory = builder.add_code_directory(code_directory)?;

    if let Some(creds) = settings.identity().credentials() {
        info!(
            "creating CMS signature with {}",
            creds
                .leaf()
                .subject_common_name()
                .unwrap_or_else(|| "<unknown>".to_string())
        );
        builder.create_cms_signature(creds, &code_directory.cdhash_truncated()?)?;
    }

    builder.create_superblob()
}

/// Create the `CodeDirectory` for a thin slice.
pub fn create_code_directory(
    settings: &SigningSettings,
    macho: &MachOFile,
) -> Result<CodeDirectoryBlob<'static>, MachoCodesignError> {
    let arch = macho.arch(0)?;

    if let Some(target) = &arch.target {
        info!(
            "binary targets {} >= {} with SDK {}",
            target.platform, target.minimum_os_version, target.sdk_version,
        );
    }

    let mut flags = settings
        .code_signature_flags(SettingsScope::Main)
        .unwrap_or_else(CodeSignatureFlags::empty);

    // The adhoc flag is set when there is no CMS signature.
    if settings.identity().is_ad_hoc() {
        info!("creating ad-hoc signature");
        flags |= CodeSignatureFlags::ADHOC;
    } else if flags.contains(CodeSignatureFlags::ADHOC) {
        info!("removing ad-hoc code signature flag");
        flags -= CodeSignatureFlags::ADHOC;
    }

    // We're not a linker.
    if flags.contains(CodeSignatureFlags::LINKER_SIGNED) {
        info!("removing linker signed flag from code signature");
        flags -= CodeSignatureFlags::LINKER_SIGNED;
    }

    let mut exec_seg_flags = settings
        .executable_segment_flags(SettingsScope::Main)
        .unwrap_or_else(ExecutableSegmentFlags::empty);

    if arch.is_executable() {
        exec_seg_flags |= ExecutableSegmentFlags::MAIN_BINARY;
    }

    // Entitlements can influence the executable segment flags.
    if let Some(entitlements) = settings.entitlements_plist(SettingsScope::Main)? {
        let implied = plist_to_executable_segment_flags(&entitlements);

        if !implied.is_empty() {
            info!("entitlements imply executable segment flags: {:?}", implied);
            exec_seg_flags |= implied;
        }
    }

    // If the runtime code signature flag is set, the runtime version must be
    // recorded or activation of the hardened runtime is incomplete.
    let runtime = match settings.runtime_version(SettingsScope::Main) {
        Some(version) => {
            info!("using hardened runtime version {} from signing settings", version);
            Some(semver_to_macho_target_version(version))
        }
        None if flags.contains(CodeSignatureFlags::RUNTIME) => match &arch.target {
            Some(target) => {
                info!(
                    "using hardened runtime version {} derived from SDK version",
                    target.sdk_version
                );
                Some(semver_to_macho_target_version(&target.sdk_version))
            }
            None => {
                warn!("hardened runtime version required but unable to derive suitable version; signature will likely fail Apple checks");
                None
            }
        },
        None => None,
    };

    let identifier = settings
        .binary_identifier(SettingsScope::Main)
        .ok_or(MachoCodesignError::NoIdentifier)?;

    let (exec_seg_base, exec_seg_limit) = arch.executable_segment_boundary()?;

    let mut builder =
        CodeDirectoryBuilder::new(identifier, settings.digest_type(), settings.page_size())
            .flags(flags)
            .team_name(settings.team_id().map(|s| s.to_string()))
            .executable_segment(exec_seg_base, exec_seg_limit, exec_seg_flags)
            .runtime(runtime)
            .target(arch.target.clone());

    // There is no blob for Info.plist. Only its digest is recorded.
    if let Some(data) = settings.info_plist_data(SettingsScope::Main) {
        builder = builder.special_slot(CodeSigningSlot::Info, data.to_vec());
    }

    let code_limit = arch.signature_offset()?;
    let data = macho.arch_data(0)?;

    builder.build(&data[..code_limit])
}

/// Create blobs the Code Directory digests.
///
/// This emits all blobs except `CodeDirectory` and `Signature`, which are
/// derived from the blobs emitted here.
pub fn create_special_blobs(
    settings: &SigningSettings,
) -> Result<Vec<(CodeSigningSlot, BlobData<'static>)>, MachoCodesignError> {
    let mut res = Vec::new();

    let designated = match settings.designated_requirement(SettingsScope::Main) {
        DesignatedRequirementMode::Auto => match settings.identity().credentials() {
            Some(creds) => {
                info!("deriving designated requirement from signing certificate");
                let identifier = settings
                    .binary_identifier(SettingsScope::Main)
                    .ok_or(MachoCodesignError::NoIdentifier)?;

                Some(RequirementBlob::try_from(&derive_designated_requirement(
                    creds.leaf(),
                    identifier,
                )?)?)
            }
            None => None,
        },
        DesignatedRequirementMode::Explicit(data) => {
            info!("using provided designated requirement");
            let blob = RequirementBlob::from_blob_bytes(data)?;
            Some(blob.to_owned())
        }
    };

    if let Some(blob) = designated {
        info!("designated requirement: {}", blob.parse_requirement()?);

        let mut set = RequirementSetBlob::default();
        set.set_requirements(RequirementType::Designated, blob);

        res.push((CodeSigningSlot::RequirementSet, set.into()));
    }

    if let Some(entitlements) = settings.entitlements_xml(SettingsScope::Main) {
        info!("adding entitlements XML");
        res.push((
            CodeSigningSlot::Entitlements,
            EntitlementsBlob::from_string(entitlements).into(),
        ));
    }

    Ok(res)
}

/// Check a freshly signed slice is internally consistent.
///
/// The Code Directory must cover the bytes before the signature, and the CMS
/// signature must be present exactly when signing with a certificate and
/// cover the Code Directory.
fn verify_signed_slice(
    macho: &MachOFile,
    index: usize,
    identity: &SigningIdentity,
) -> Result<(), MachoCodesignError> {
    let signature = macho
        .code_signature(index)?
        .ok_or(FormatError::SuperblobMalformed)?;

    let cd_entry = signature
        .find_slot(CodeSigningSlot::CodeDirectory)
        .ok_or(FormatError::SuperblobMalformed)?;
    let cd = signature
        .code_directory()?
        .ok_or(FormatError::SuperblobMalformed)?;

    let arch = macho.arch(index)?;
    if cd.code_limit as usize != arch.code_limit_unpadded()? {
        return Err(MachoCodesignError::SignatureBuilder(
            "code limit disagrees with signature placement",
        ));
    }

    verify_slice_digests(macho, index)?;

    match (identity.is_ad_hoc(), signature.signature_data()?) {
        (true, None) => Ok(()),
        (true, Some(_)) => Err(MachoCodesignError::SignatureBuilder(
            "ad-hoc signature carries CMS data",
        )),
        (false, None) => Err(MachoCodesignError::SignatureBuilder(
            "certificate signature lacks CMS data",
        )),
        (false, Some(cms)) => verify_code_directory_signature(cms, cd_entry.data),
    }
}

/// Recompute the digests recorded by a slice's Code Directory.
///
/// Every code page up to the code limit and every blob occupying a special
/// slot must hash to what the Code Directory records.
pub fn verify_slice_digests(macho: &MachOFile, index: usize) -> Result<(), MachoCodesignError> {
    let signature = macho
        .code_signature(index)?
        .ok_or(FormatError::SuperblobMalformed)?;
    let cd = signature
        .code_directory()?
        .ok_or(FormatError::SuperblobMalformed)?;

    let code_limit = match cd.code_limit_64 {
        Some(limit) if limit != 0 => limit as usize,
        _ => cd.code_limit as usize,
    };
    let code = macho
        .arch_data(index)?
        .get(..code_limit)
        .ok_or(FormatError::SuperblobMalformed)?;

    let pages = paged_digests(code, cd.hash_type, cd.page_size as usize)?;
    if pages.len() != cd.code_hashes.len() {
        return Err(MachoCodesignError::DigestMismatch(format!(
            "slice {} has {} code pages but {} are recorded",
            index,
            pages.len(),
            cd.code_hashes.len()
        )));
    }

    if let Some(page) = pages
        .iter()
        .zip(&cd.code_hashes)
        .position(|(actual, recorded)| actual.as_slice() != &*recorded.data)
    {
        return Err(MachoCodesignError::DigestMismatch(format!(
            "page {} of slice {}",
            page, index
        )));
    }

    for entry in signature
        .blobs
        .iter()
        .filter(|entry| entry.slot.is_code_directory_specials_expressible())
    {
        let recorded = cd
            .special_hashes
            .get(&entry.slot)
            .filter(|digest| !digest.is_null())
            .ok_or_else(|| {
                MachoCodesignError::DigestMismatch(format!(
                    "{:?} blob of slice {} is not recorded",
                    entry.slot, index
                ))
            })?;

        if entry.digest_with(cd.hash_type)? != recorded.to_vec() {
            return Err(MachoCodesignError::DigestMismatch(format!(
                "{:?} blob of slice {}",
                entry.slot, index
            )));
        }
    }

    Ok(())
}
