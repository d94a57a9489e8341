// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Attach Apple notarization tickets to signed Mach-O binaries.

Stapling refers to the act of taking an Apple issued notarization
ticket (generated after uploading content to Apple for inspection)
and attaching that ticket to the entity that was uploaded. For a Mach-O
binary the ticket goes into a raw data slot of the embedded signature.
That slot isn't covered by the Code Directory, so adding it leaves the
existing signature valid.
*/

use {
    crate::{
        embedded_signature_builder::EmbeddedSignatureBuilder,
        error::{MachoCodesignError, StapleError},
        macho::MachOFile,
        macho_signing::verify_slice_digests,
        signing::write_file_atomic,
        ticket_lookup::{default_client, lookup_notarization_ticket, ticket_record_name},
    },
    log::{info, warn},
    reqwest::Client,
    std::{path::Path, time::Duration},
};

/// Resolve the notarization ticket record name of a signed binary.
///
/// The record name is derived from the Code Directory of the first slice.
pub fn record_name_from_macho(macho: &MachOFile) -> Result<String, StapleError> {
    let signature = macho
        .code_signature(0)
        .map_err(|e| StapleError::Rewrite(e.to_string()))?
        .ok_or(StapleError::NoSignature)?;

    let cd = signature
        .code_directory()
        .map_err(|e| StapleError::Rewrite(e.to_string()))?
        .ok_or(StapleError::NoSignature)?;

    ticket_record_name(&cd).map_err(|e| StapleError::Rewrite(e.to_string()))
}

/// Derive a binary with `ticket` embedded in the signature of every slice.
///
/// Any previously stapled ticket is replaced. The ticket must fit in the
/// signature space reserved at signing time: resizing the signature would
/// alter load commands the Code Directory has already hashed.
pub fn staple_ticket_to_macho(macho: &MachOFile, ticket: &[u8]) -> Result<MachOFile, StapleError> {
    let rewrite = |e: MachoCodesignError| StapleError::Rewrite(e.to_string());

    let mut stapled = macho.clone();

    for index in 0..macho.arches().len() {
        let reserved = stapled
            .existing_signature_region(index)
            .map_err(|e| rewrite(e.into()))?
            .map(|(_, size)| size)
            .ok_or(StapleError::NoSignature)?;

        let mut signature_data = {
            let signature = stapled
                .code_signature(index)
                .map_err(rewrite)?
                .ok_or(StapleError::NoSignature)?;

            let mut builder = EmbeddedSignatureBuilder::from_existing(&signature).map_err(rewrite)?;
            builder
                .add_notarization_ticket(ticket.to_vec())
                .map_err(rewrite)?;
            builder.create_superblob().map_err(rewrite)?
        };

        if signature_data.len() > reserved {
            return Err(StapleError::NoRoom {
                needed: signature_data.len(),
                reserved,
            });
        }
        signature_data.resize(reserved, 0);

        info!(
            "stapling {} byte ticket to slice {}",
            ticket.len(),
            index
        );
        stapled = stapled
            .replace_signature(index, &signature_data)
            .map_err(rewrite)?;

        verify_slice_digests(&stapled, index).map_err(rewrite)?;
    }

    Ok(stapled)
}

/// Handles stapling operations.
pub struct Stapler {
    client: Client,
}

impl Stapler {
    /// Construct a new instance with a default HTTP client.
    pub fn new(timeout: Duration) -> Result<Self, MachoCodesignError> {
        Ok(Self {
            client: default_client(timeout)?,
        })
    }

    /// Construct a new instance with a client of your choosing.
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    /// Look up the notarization ticket for a signed binary.
    pub async fn lookup_ticket_for_macho(&self, macho: &MachOFile) -> Result<Vec<u8>, StapleError> {
        let record_name = record_name_from_macho(macho)?;

        lookup_notarization_ticket(&self.client, &record_name).await
    }

    /// Staple a Mach-O binary at a filesystem path.
    ///
    /// The file is replaced atomically.
    pub async fn staple_path(&self, path: impl AsRef<Path>) -> Result<(), MachoCodesignError> {
        let path = path.as_ref();
        warn!("attempting to staple {}", path.display());

        let data = std::fs::read(path).map_err(|e| MachoCodesignError::io(path, e))?;
        let macho = MachOFile::parse(data)?;

        let ticket = self.lookup_ticket_for_macho(&macho).await?;
        let stapled = staple_ticket_to_macho(&macho, &ticket)?;

        warn!("writing stapled binary to {}", path.display());
        write_file_atomic(path, stapled.as_bytes(), None)
            .map_err(|e| StapleError::Rewrite(e.to_string()))?;

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::{
            code_hash::paged_digests,
            embedded_signature::CodeSigningSlot,
            macho_signing::MachOSigner,
            signing_settings::{SettingsScope, SigningSettings},
            testutil::{fat_binary, MachOBuilder},
        },
        goblin::mach::cputype::CPU_TYPE_X86_64,
    };

    fn signed(data: Vec<u8>) -> MachOFile {
        let mut settings = SigningSettings::default();
        settings.set_binary_identifier(SettingsScope::Main, "com.example.stapled");

        MachOSigner::new(data).unwrap().sign(&settings).unwrap()
    }

    #[test]
    fn staple_adds_ticket_and_keeps_code_directory() -> Result<(), StapleError> {
        let macho = signed(MachOBuilder::default().build());
        let stapled = staple_ticket_to_macho(&macho, b"s8ch ticket")?;

        let before = macho.code_signature(0).unwrap().unwrap();
        let after = stapled.code_signature(0).unwrap().unwrap();

        assert_eq!(after.ticket_data(), Some(&b"s8ch ticket"[..]));
        assert_eq!(
            before.find_slot(CodeSigningSlot::CodeDirectory).unwrap().data,
            after.find_slot(CodeSigningSlot::CodeDirectory).unwrap().data
        );

        // The record name doesn't change either.
        assert_eq!(record_name_from_macho(&macho)?, record_name_from_macho(&stapled)?);

        // Stapling again replaces the ticket.
        let restapled = staple_ticket_to_macho(&stapled, b"s8ch newer")?;
        assert_eq!(
            restapled.code_signature(0).unwrap().unwrap().ticket_data(),
            Some(&b"s8ch newer"[..])
        );

        Ok(())
    }

    #[test]
    fn staple_every_fat_slice() -> Result<(), StapleError> {
        let arm = MachOBuilder::default().build();
        let x86 = MachOBuilder::default().cpu(CPU_TYPE_X86_64, 3).build();
        let macho = signed(fat_binary(&[(&arm, 14), (&x86, 14)]));

        let stapled = staple_ticket_to_macho(&macho, b"ticket")?;

        for index in 0..2 {
            assert_eq!(
                stapled.code_signature(index).unwrap().unwrap().ticket_data(),
                Some(&b"ticket"[..])
            );
        }

        Ok(())
    }

    #[test]
    fn unsigned_binary_cannot_be_stapled() {
        let macho = MachOFile::parse(MachOBuilder::default().build()).unwrap();

        assert!(matches!(
            staple_ticket_to_macho(&macho, b"ticket"),
            Err(StapleError::NoSignature)
        ));
        assert!(matches!(
            record_name_from_macho(&macho),
            Err(StapleError::NoSignature)
        ));
    }

    #[test]
    fn stapling_keeps_code_pages_valid() -> Result<(), MachoCodesignError> {
        let macho = signed(MachOBuilder::default().build());
        let region = macho.existing_signature_region(0)?;

        let stapled = staple_ticket_to_macho(&macho, b"s8ch ticket")?;
        assert_eq!(stapled.existing_signature_region(0)?, region);

        // Every byte the Code Directory covers is untouched.
        let (offset, _) = region.expect("signature present");
        assert_eq!(&macho.as_bytes()[..offset], &stapled.as_bytes()[..offset]);
        assert_eq!(macho.as_bytes().len(), stapled.as_bytes().len());

        let signature = stapled.code_signature(0)?.expect("signature present");
        let cd = signature.code_directory()?.expect("code directory present");
        let pages = paged_digests(
            &stapled.as_bytes()[..cd.code_limit as usize],
            cd.hash_type,
            cd.page_size as usize,
        )?;
        assert_eq!(
            pages,
            cd.code_hashes.iter().map(|h| h.to_vec()).collect::<Vec<_>>()
        );

        verify_slice_digests(&stapled, 0)?;

        Ok(())
    }

    #[test]
    fn oversized_ticket_is_refused() -> Result<(), MachoCodesignError> {
        let macho = signed(MachOBuilder::default().build());
        let (_, reserved) = macho.existing_signature_region(0)?.expect("signature present");

        match staple_ticket_to_macho(&macho, &vec![0x42; reserved]) {
            Err(StapleError::NoRoom {
                needed,
                reserved: available,
            }) => {
                assert!(needed > available);
                assert_eq!(available, reserved);
            }
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }

        Ok(())
    }
}
