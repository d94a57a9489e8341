// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Provides primitives for constructing embeddable signature data structures.

use {
    crate::{
        code_directory::CodeDirectoryBlob,
        cryptography::SigningCredentials,
        embedded_signature::{
            create_superblob, Blob, BlobWrapperBlob, CodeSigningMagic, CodeSigningSlot,
            EmbeddedSignature,
        },
        error::MachoCodesignError,
    },
    log::debug,
    std::collections::BTreeMap,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum BlobsState {
    Empty,
    SpecialAdded,
    CodeDirectoryAdded,
    SignatureAdded,
}

impl Default for BlobsState {
    fn default() -> Self {
        Self::Empty
    }
}

/// An entity for producing [EmbeddedSignature] superblob data.
///
/// Blobs are registered in dependency order: special blobs, then the Code
/// Directory (which records their digests), then the CMS signature over
/// the Code Directory. Registered blobs are held serialized, so what gets
/// digested is exactly what gets written.
#[derive(Debug, Default)]
pub struct EmbeddedSignatureBuilder {
    state: BlobsState,
    blobs: BTreeMap<CodeSigningSlot, Vec<u8>>,
}

impl EmbeddedSignatureBuilder {
    /// Seed a builder with every slot of an existing signature.
    ///
    /// The result is sealed: only raw data slots outside the Code Directory's
    /// coverage, such as the notarization ticket, may be added.
    pub fn from_existing(signature: &EmbeddedSignature) -> Result<Self, MachoCodesignError> {
        if signature.find_slot(CodeSigningSlot::CodeDirectory).is_none() {
            return Err(MachoCodesignError::SignatureBuilder(
                "existing signature has no code directory",
            ));
        }

        let blobs = signature
            .slot_data()
            .into_iter()
            .map(|(slot, data)| (slot, data.to_vec()))
            .collect::<BTreeMap<_, _>>();

        let state = if blobs.contains_key(&CodeSigningSlot::Signature) {
            BlobsState::SignatureAdded
        } else {
            BlobsState::CodeDirectoryAdded
        };

        Ok(Self { state, blobs })
    }

    /// Obtain the serialized blob registered in a slot.
    pub fn slot(&self, slot: CodeSigningSlot) -> Option<&[u8]> {
        self.blobs.get(&slot).map(|x| x.as_slice())
    }

    /// Register a blob into a slot.
    ///
    /// There can only be a single blob per slot. Last write wins.
    ///
    /// Blobs cannot be registered after a code directory or signature are added, as this
    /// would invalidate the signature.
    pub fn add_blob<'a>(
        &mut self,
        slot: CodeSigningSlot,
        blob: &impl Blob<'a>,
    ) -> Result<(), MachoCodesignError> {
        match self.state {
            BlobsState::Empty | BlobsState::SpecialAdded => {}
            BlobsState::CodeDirectoryAdded | BlobsState::SignatureAdded => {
                return Err(MachoCodesignError::SignatureBuilder(
                    "cannot add blobs after code directory or signature is registered",
                ));
            }
        }

        if !slot.is_code_directory_specials_expressible() {
            return Err(MachoCodesignError::SignatureBuilder(
                "add_blob() only accepts slots covered by the code directory",
            ));
        }

        self.blobs.insert(slot, blob.to_blob_bytes()?);
        self.state = BlobsState::SpecialAdded;

        Ok(())
    }

    /// Register a [CodeDirectoryBlob] with this builder.
    ///
    /// Digests of previously registered blobs are recorded in its special
    /// slots before it is serialized. Returns the registered Code Directory.
    pub fn add_code_directory<'a>(
        &mut self,
        mut cd: CodeDirectoryBlob<'a>,
    ) -> Result<CodeDirectoryBlob<'a>, MachoCodesignError> {
        if matches!(self.state, BlobsState::SignatureAdded) {
            return Err(MachoCodesignError::SignatureBuilder(
                "cannot add code directory after signature data added",
            ));
        }

        for (slot, data) in &self.blobs {
            if *slot == CodeSigningSlot::CodeDirectory {
                continue;
            }

            cd.special_hashes
                .insert(*slot, cd.hash_type.digest_data(data)?.into());
        }

        self.blobs
            .insert(CodeSigningSlot::CodeDirectory, cd.to_blob_bytes()?);
        self.state = BlobsState::CodeDirectoryAdded;

        Ok(cd)
    }

    /// Add CMS signature data to this builder.
    pub fn add_cms_signature(&mut self, der_data: Vec<u8>) -> Result<(), MachoCodesignError> {
        if matches!(self.state, BlobsState::Empty | BlobsState::SpecialAdded) {
            return Err(MachoCodesignError::SignatureBuilder(
                "cannot add signature before code directory",
            ));
        }

        self.blobs.insert(
            CodeSigningSlot::Signature,
            BlobWrapperBlob::from_data_owned(der_data).to_blob_bytes()?,
        );

        self.state = BlobsState::SignatureAdded;

        Ok(())
    }

    /// Sign the registered Code Directory with the given credentials.
    pub fn create_cms_signature(
        &mut self,
        credentials: &SigningCredentials,
        cdhash_truncated: &[u8],
    ) -> Result<(), MachoCodesignError> {
        let cd = self
            .blobs
            .get(&CodeSigningSlot::CodeDirectory)
            .ok_or(MachoCodesignError::SignatureBuilder(
                "cannot create CMS signature unless code directory is present",
            ))?;

        debug!("signing {} byte code directory", cd.len());
        let der = credentials.sign_code_directory(cd, cdhash_truncated)?;

        self.add_cms_signature(der)
    }

    /// Attach a notarization ticket.
    ///
    /// The ticket is stored raw, without a blob header. It isn't covered by
    /// the Code Directory so it can be added to a sealed signature.
    pub fn add_notarization_ticket(&mut self, ticket: Vec<u8>) -> Result<(), MachoCodesignError> {
        if matches!(self.state, BlobsState::Empty | BlobsState::SpecialAdded) {
            return Err(MachoCodesignError::SignatureBuilder(
                "cannot add notarization ticket before code directory",
            ));
        }

        self.blobs.insert(CodeSigningSlot::Ticket, ticket);

        Ok(())
    }

    /// Create the embedded signature "superblob" data.
    pub fn create_superblob(&self) -> Result<Vec<u8>, MachoCodesignError> {
        if matches!(self.state, BlobsState::Empty | BlobsState::SpecialAdded) {
            return Err(MachoCodesignError::SignatureBuilder(
                "code directory required in order to materialize superblob",
            ));
        }

        create_superblob(
            CodeSigningMagic::EmbeddedSignature,
            self.blobs.iter().map(|(slot, data)| (*slot, data.as_slice())),
        )
    }
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::{
            code_directory::CodeDirectoryBuilder,
            cryptography::{test::credentials, verify_code_directory_signature},
            embedded_signature::{DigestType, EntitlementsBlob, RequirementSetBlob},
        },
        scroll::Pread,
    };

    fn code_directory() -> CodeDirectoryBlob<'static> {
        CodeDirectoryBuilder::new("com.example.tool", DigestType::Sha256, 4096)
            .build(&[0x11; 5000])
            .unwrap()
    }

    #[test]
    fn ordering_follows_slots() -> Result<(), MachoCodesignError> {
        let mut builder = EmbeddedSignatureBuilder::default();

        // Registered out of slot order on purpose.
        builder.add_blob(
            CodeSigningSlot::Entitlements,
            &EntitlementsBlob::from_string("<plist/>"),
        )?;
        builder.add_blob(CodeSigningSlot::RequirementSet, &RequirementSetBlob::default())?;
        let cd = builder.add_code_directory(code_directory())?;

        assert_eq!(cd.special_hashes.len(), 2);
        assert_eq!(
            cd.special_hashes[&CodeSigningSlot::Entitlements].to_vec(),
            DigestType::Sha256.digest_data(
                &EntitlementsBlob::from_string("<plist/>").to_blob_bytes()?
            )?
        );

        let data = builder.create_superblob()?;

        // magic, length, count
        assert_eq!(data.pread_with::<u32>(0, scroll::BE)?, 0xfade0cc0);
        assert_eq!(data.pread_with::<u32>(4, scroll::BE)? as usize, data.len());
        assert_eq!(data.pread_with::<u32>(8, scroll::BE)?, 3);

        let signature = EmbeddedSignature::from_bytes(&data)?;
        let slots = signature.blobs.iter().map(|b| b.slot).collect::<Vec<_>>();
        assert_eq!(
            slots,
            vec![
                CodeSigningSlot::CodeDirectory,
                CodeSigningSlot::RequirementSet,
                CodeSigningSlot::Entitlements
            ]
        );

        let offsets = signature.blobs.iter().map(|b| b.offset).collect::<Vec<_>>();
        assert_eq!(offsets[0], 12 + 3 * 8);
        for pair in signature.blobs.windows(2) {
            assert_eq!(pair[0].offset + pair[0].length, pair[1].offset);
        }

        // Ad-hoc: no signature slot at all.
        assert!(signature.find_slot(CodeSigningSlot::Signature).is_none());

        Ok(())
    }

    #[test]
    fn state_is_enforced() -> Result<(), MachoCodesignError> {
        let mut builder = EmbeddedSignatureBuilder::default();
        assert!(builder.create_superblob().is_err());
        assert!(builder.add_cms_signature(vec![1, 2, 3]).is_err());

        builder.add_code_directory(code_directory())?;
        assert!(builder
            .add_blob(CodeSigningSlot::RequirementSet, &RequirementSetBlob::default())
            .is_err());

        builder.add_cms_signature(vec![0x30, 0x00])?;
        assert!(builder.add_code_directory(code_directory()).is_err());

        Ok(())
    }

    #[test]
    fn cms_covers_code_directory() -> Result<(), MachoCodesignError> {
        let creds = credentials("signer");

        let mut builder = EmbeddedSignatureBuilder::default();
        let cd = builder.add_code_directory(code_directory())?;
        builder.create_cms_signature(&creds, &cd.cdhash_truncated()?)?;

        let data = builder.create_superblob()?;
        let signature = EmbeddedSignature::from_bytes(&data)?;

        let cd_bytes = signature
            .find_slot(CodeSigningSlot::CodeDirectory)
            .expect("code directory present")
            .data;
        let cms = signature.signature_data()?.expect("signature present");

        verify_code_directory_signature(cms, cd_bytes)?;

        Ok(())
    }

    #[test]
    fn ticket_added_to_sealed_signature() -> Result<(), MachoCodesignError> {
        let mut builder = EmbeddedSignatureBuilder::default();
        builder.add_code_directory(code_directory())?;
        let original = builder.create_superblob()?;

        let signature = EmbeddedSignature::from_bytes(&original)?;
        let mut builder = EmbeddedSignatureBuilder::from_existing(&signature)?;
        builder.add_notarization_ticket(b"ticket bytes".to_vec())?;

        let stapled = builder.create_superblob()?;
        let signature = EmbeddedSignature::from_bytes(&stapled)?;

        assert_eq!(signature.ticket_data(), Some(&b"ticket bytes"[..]));
        assert_eq!(
            signature.find_slot(CodeSigningSlot::CodeDirectory).map(|b| b.data),
            EmbeddedSignature::from_bytes(&original)?
                .find_slot(CodeSigningSlot::CodeDirectory)
                .map(|b| b.data)
        );

        Ok(())
    }
}
