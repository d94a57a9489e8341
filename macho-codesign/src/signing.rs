// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! High level signing primitives.

use {
    crate::{
        error::MachoCodesignError,
        macho::MachOFile,
        macho_signing::MachOSigner,
        signing_settings::{SettingsScope, SigningSettings},
    },
    log::{info, warn},
    std::{io::Write, path::Path},
};

/// Write `data` to `path` so readers see either the old or the new content.
///
/// Data is written to a temporary file in the destination directory, which
/// is then renamed over `path`. Permissions of an existing destination are
/// kept. Otherwise `permissions` applies if given.
pub fn write_file_atomic(
    path: &Path,
    data: &[u8],
    permissions: Option<std::fs::Permissions>,
) -> Result<(), MachoCodesignError> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };

    let permissions = match std::fs::metadata(path) {
        Ok(metadata) => Some(metadata.permissions()),
        Err(_) => permissions,
    };

    let mut temp = tempfile::Builder::new()
        .prefix(".machosign-")
        .tempfile_in(dir)
        .map_err(|e| MachoCodesignError::io(dir, e))?;

    temp.write_all(data)
        .and_then(|_| temp.as_file().sync_all())
        .map_err(|e| MachoCodesignError::io(temp.path(), e))?;

    if let Some(permissions) = permissions {
        temp.as_file()
            .set_permissions(permissions)
            .map_err(|e| MachoCodesignError::io(temp.path(), e))?;
    }

    temp.persist(path)
        .map_err(|e| MachoCodesignError::io(path, e.error))?;

    Ok(())
}

/// Signs Mach-O files on the filesystem.
pub struct UnifiedSigner {
    settings: SigningSettings,
}

impl UnifiedSigner {
    /// Construct a new instance bound to a [SigningSettings].
    pub fn new(settings: SigningSettings) -> Self {
        Self { settings }
    }

    /// Sign Mach-O data, returning the signed binary.
    ///
    /// `name` provides the fallback binary identifier.
    pub fn sign_data(&self, name: &str, data: Vec<u8>) -> Result<MachOFile, MachoCodesignError> {
        let signer = MachOSigner::new(data)?;

        let mut settings = self.settings.clone();
        settings.import_settings_from_macho(signer.macho())?;

        if settings.binary_identifier(SettingsScope::Main).is_none()
            && (0..signer.macho().arches().len()).any(|i| {
                settings
                    .binary_identifier(SettingsScope::MultiArchIndex(i))
                    .is_none()
            })
        {
            warn!("setting binary identifier to {}", name);
            settings.set_binary_identifier(SettingsScope::Main, name);
        }

        signer.sign(&settings)
    }

    /// Signs `input_path` and writes the signed output to `output_path`.
    ///
    /// The output is replaced atomically. If signing fails nothing is written.
    pub fn sign_path(
        &self,
        input_path: impl AsRef<Path>,
        output_path: impl AsRef<Path>,
    ) -> Result<(), MachoCodesignError> {
        let input_path = input_path.as_ref();
        let output_path = output_path.as_ref();

        let name = input_path
            .file_name()
            .ok_or_else(|| {
                MachoCodesignError::CliGeneralError("unable to resolve file name of binary".into())
            })?
            .to_string_lossy()
            .to_string();

        info!("signing {} as a Mach-O binary", input_path.display());
        let data = std::fs::read(input_path).map_err(|e| MachoCodesignError::io(input_path, e))?;
        let permissions = std::fs::metadata(input_path)
            .map_err(|e| MachoCodesignError::io(input_path, e))?
            .permissions();

        let signed = self.sign_data(&name, data)?;

        info!("writing {}", output_path.display());
        write_file_atomic(output_path, signed.as_bytes(), Some(permissions))
    }

    /// Sign a filesystem path in place.
    ///
    /// This is just a convenience wrapper for [Self::sign_path()] with the same path passed
    /// to both the input and output path.
    pub fn sign_path_in_place(&self, path: impl AsRef<Path>) -> Result<(), MachoCodesignError> {
        let path = path.as_ref();

        self.sign_path(path, path)
    }
}
