// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Code signing settings.

use {
    crate::{
        code_directory::{CodeSignatureFlags, ExecutableSegmentFlags},
        cryptography::SigningIdentity,
        embedded_signature::{Blob, DigestType, RequirementBlob},
        entitlements::parse_entitlements_xml,
        error::MachoCodesignError,
        macho::{parse_version_nibbles, MachOFile},
    },
    goblin::mach::cputype::{CpuType, CPU_TYPE_ARM, CPU_TYPE_ARM64, CPU_TYPE_ARM64_32, CPU_TYPE_X86_64},
    log::info,
    std::{collections::BTreeMap, fmt::Formatter},
};

/// Default Code Directory page size.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Denotes the scope for a setting.
///
/// Scopes can be converted from a string representation:
///
/// * `@main` - Maps to [SettingsScope::Main]
/// * `@<int>` - e.g. `@0`. Maps to [SettingsScope::MultiArchIndex].
/// * `@[cpu_type=<int>]` - e.g. `@[cpu_type=7]`. Maps to [SettingsScope::MultiArchCpuType].
/// * `@[cpu_type=<string>]` - e.g. `@[cpu_type=x86_64]`. Recognized names are
///   `arm`, `arm64`, `arm64_32` and `x86_64`.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum SettingsScope {
    // Variant order matters: scoped views iterate keys in sorted order and last
    // write wins. So go from widest to most granular.
    /// The Mach-O file being signed, every slice included.
    Main,

    /// A single slice of a fat binary, by 0-based index.
    MultiArchIndex(usize),

    /// A single slice of a fat binary, by CPU type.
    MultiArchCpuType(CpuType),
}

impl std::fmt::Display for SettingsScope {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Main => f.write_str("main signing target"),
            Self::MultiArchIndex(index) => f.write_fmt(format_args!(
                "fat/universal Mach-O binaries at index {}",
                index
            )),
            Self::MultiArchCpuType(cpu_type) => f.write_fmt(format_args!(
                "fat/universal Mach-O binaries for CPU {}",
                cpu_type
            )),
        }
    }
}

impl AsRef<SettingsScope> for SettingsScope {
    fn as_ref(&self) -> &SettingsScope {
        self
    }
}

impl TryFrom<&str> for SettingsScope {
    type Error = MachoCodesignError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        let bad = |msg: String| MachoCodesignError::CliGeneralError(msg);

        let at_expr = s
            .strip_prefix('@')
            .ok_or_else(|| bad(format!("settings scope '{}' must begin with @", s)))?;

        if at_expr == "main" {
            return Ok(Self::Main);
        }

        if let Ok(index) = at_expr.parse::<usize>() {
            return Ok(Self::MultiArchIndex(index));
        }

        let inner = at_expr
            .strip_prefix('[')
            .and_then(|v| v.strip_suffix(']'))
            .ok_or_else(|| bad(format!("in '{}', @ expression not recognized", s)))?;

        let (key, value) = inner
            .split_once('=')
            .ok_or_else(|| bad(format!("'{}' sub-expression isn't of form <key>=<value>", inner)))?;

        if key != "cpu_type" {
            return Err(bad(format!(
                "in '{}', {} not recognized; must be cpu_type",
                s, key
            )));
        }

        let cpu_type = match value {
            "arm" => CPU_TYPE_ARM,
            "arm64" => CPU_TYPE_ARM64,
            "arm64_32" => CPU_TYPE_ARM64_32,
            "x86_64" => CPU_TYPE_X86_64,
            _ => value
                .parse::<u32>()
                .map_err(|_| bad(format!("in '{}', cpu_type value {} not recognized", s, value)))?,
        };

        Ok(Self::MultiArchCpuType(cpu_type))
    }
}

/// Describes how to derive designated requirements during signing.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DesignatedRequirementMode {
    /// Derive an expression from the signing certificate and binary identifier.
    Auto,

    /// A compiled requirement blob, as `csreq -b` would produce.
    Explicit(Vec<u8>),
}

/// Represents code signing settings.
///
/// The signing identity, digest and page size are global. Everything else
/// can be applied on a scoped basis via [SettingsScope]. When signing
/// descends into the slices of a fat binary, a view is derived with
/// [SigningSettings::as_nested_macho_settings] that promotes the settings
/// for that slice to [SettingsScope::Main].
#[derive(Clone, Debug)]
pub struct SigningSettings {
    // Global settings.
    identity: SigningIdentity,
    digest_type: DigestType,
    page_size: usize,
    team_id: Option<String>,

    // Scope-specific settings.
    // These are BTreeMap so when we filter the keys, keys with higher precedence come
    // last and last write wins.
    identifiers: BTreeMap<SettingsScope, String>,
    entitlements: BTreeMap<SettingsScope, String>,
    designated_requirement: BTreeMap<SettingsScope, DesignatedRequirementMode>,
    code_signature_flags: BTreeMap<SettingsScope, CodeSignatureFlags>,
    executable_segment_flags: BTreeMap<SettingsScope, ExecutableSegmentFlags>,
    runtime_version: BTreeMap<SettingsScope, semver::Version>,
    info_plist_data: BTreeMap<SettingsScope, Vec<u8>>,
}

impl Default for SigningSettings {
    fn default() -> Self {
        Self {
            identity: SigningIdentity::AdHoc,
            digest_type: DigestType::Sha256,
            page_size: DEFAULT_PAGE_SIZE,
            team_id: None,
            identifiers: BTreeMap::new(),
            entitlements: BTreeMap::new(),
            designated_requirement: BTreeMap::new(),
            code_signature_flags: BTreeMap::new(),
            executable_segment_flags: BTreeMap::new(),
            runtime_version: BTreeMap::new(),
            info_plist_data: BTreeMap::new(),
        }
    }
}

impl SigningSettings {
    pub fn identity(&self) -> &SigningIdentity {
        &self.identity
    }

    /// Set who vouches for the signature. Defaults to ad-hoc.
    pub fn set_identity(&mut self, identity: SigningIdentity) {
        self.identity = identity;
    }

    /// Obtain the digest type to use.
    pub fn digest_type(&self) -> DigestType {
        self.digest_type
    }

    /// Set the content digest to use.
    ///
    /// The default is SHA-256. SHA-1 is accepted for legacy targets.
    pub fn set_digest_type(&mut self, digest_type: DigestType) -> Result<(), MachoCodesignError> {
        match digest_type {
            DigestType::Sha1 | DigestType::Sha256 | DigestType::Sha384 => {
                self.digest_type = digest_type;
                Ok(())
            }
            other => Err(MachoCodesignError::DigestUnsupportedAlgorithm(other)),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Set the Code Directory page size. Must be a power of two.
    pub fn set_page_size(&mut self, page_size: usize) -> Result<(), MachoCodesignError> {
        crate::code_hash::validate_page_size(page_size)?;
        self.page_size = page_size;

        Ok(())
    }

    /// Obtain the team identifier for signed binaries.
    pub fn team_id(&self) -> Option<&str> {
        self.team_id.as_deref()
    }

    /// Set the team identifier for signed binaries.
    pub fn set_team_id(&mut self, value: impl ToString) {
        self.team_id = Some(value.to_string());
    }

    /// Set the team ID from the signing certificate, if it carries one.
    ///
    /// Returns the team ID that was set.
    pub fn set_team_id_from_signing_certificate(&mut self) -> Option<&str> {
        let team_id = self
            .identity
            .credentials()
            .and_then(|creds| crate::policy::certificate_team_id(creds.leaf()))?;

        self.team_id = Some(team_id);
        self.team_id.as_deref()
    }

    /// Obtain the binary identifier string for a given scope.
    pub fn binary_identifier(&self, scope: impl AsRef<SettingsScope>) -> Option<&str> {
        self.identifiers.get(scope.as_ref()).map(|s| s.as_str())
    }

    /// Set the binary identifier string.
    ///
    /// The binary identifier should be a DNS-like name and should uniquely identify the
    /// binary. e.g. `com.example.my_program`
    pub fn set_binary_identifier(&mut self, scope: SettingsScope, value: impl ToString) {
        self.identifiers.insert(scope, value.to_string());
    }

    /// Obtain the entitlements XML for a given scope.
    pub fn entitlements_xml(&self, scope: impl AsRef<SettingsScope>) -> Option<&str> {
        self.entitlements.get(scope.as_ref()).map(|s| s.as_str())
    }

    /// Obtain the entitlements as a parsed plist.
    pub fn entitlements_plist(
        &self,
        scope: impl AsRef<SettingsScope>,
    ) -> Result<Option<plist::Value>, MachoCodesignError> {
        self.entitlements_xml(scope)
            .map(|xml| parse_entitlements_xml(xml.as_bytes()))
            .transpose()
    }

    /// Set the entitlements to sign via an XML string.
    ///
    /// The XML must parse as a plist dictionary. It is embedded verbatim.
    pub fn set_entitlements_xml(
        &mut self,
        scope: SettingsScope,
        value: impl ToString,
    ) -> Result<(), MachoCodesignError> {
        let value = value.to_string();
        parse_entitlements_xml(value.as_bytes())?;

        self.entitlements.insert(scope, value);

        Ok(())
    }

    /// Obtain the designated requirements for a given scope.
    pub fn designated_requirement(
        &self,
        scope: impl AsRef<SettingsScope>,
    ) -> &DesignatedRequirementMode {
        self.designated_requirement
            .get(scope.as_ref())
            .unwrap_or(&DesignatedRequirementMode::Auto)
    }

    /// Set the designated requirement from a compiled requirement blob.
    ///
    /// The bytes are what `csreq -b` produces: a requirement blob with header.
    pub fn set_designated_requirement_bytes(
        &mut self,
        scope: SettingsScope,
        data: impl AsRef<[u8]>,
    ) -> Result<(), MachoCodesignError> {
        let blob = RequirementBlob::from_blob_bytes(data.as_ref())?;
        // Reject anything we couldn't faithfully re-emit.
        blob.parse_requirement()?;

        self.designated_requirement.insert(
            scope,
            DesignatedRequirementMode::Explicit(blob.to_blob_bytes()?),
        );

        Ok(())
    }

    /// Derive requirements automatically from the signing certificate.
    pub fn set_auto_designated_requirement(&mut self, scope: SettingsScope) {
        self.designated_requirement
            .insert(scope, DesignatedRequirementMode::Auto);
    }

    /// Obtain the code signature flags for a given scope.
    pub fn code_signature_flags(
        &self,
        scope: impl AsRef<SettingsScope>,
    ) -> Option<CodeSignatureFlags> {
        self.code_signature_flags.get(scope.as_ref()).copied()
    }

    /// Set code signature flags, replacing any already defined.
    pub fn set_code_signature_flags(&mut self, scope: SettingsScope, flags: CodeSignatureFlags) {
        self.code_signature_flags.insert(scope, flags);
    }

    /// Add code signature flags.
    ///
    /// The incoming flags will be ORd with any existing flags for the scope.
    /// The new flags will be returned.
    pub fn add_code_signature_flags(
        &mut self,
        scope: SettingsScope,
        flags: CodeSignatureFlags,
    ) -> CodeSignatureFlags {
        let new = self
            .code_signature_flags
            .get(&scope)
            .copied()
            .unwrap_or_else(CodeSignatureFlags::empty)
            | flags;

        self.code_signature_flags.insert(scope, new);

        new
    }

    /// Obtain the executable segment flags for a given scope.
    pub fn executable_segment_flags(
        &self,
        scope: impl AsRef<SettingsScope>,
    ) -> Option<ExecutableSegmentFlags> {
        self.executable_segment_flags.get(scope.as_ref()).copied()
    }

    /// Set executable segment flags, replacing any already defined.
    pub fn set_executable_segment_flags(
        &mut self,
        scope: SettingsScope,
        flags: ExecutableSegmentFlags,
    ) {
        self.executable_segment_flags.insert(scope, flags);
    }

    /// Obtain the runtime version for a given scope.
    ///
    /// The runtime version represents an OS version.
    pub fn runtime_version(&self, scope: impl AsRef<SettingsScope>) -> Option<&semver::Version> {
        self.runtime_version.get(scope.as_ref())
    }

    /// Set the hardened runtime version, overriding the one derived from the SDK.
    pub fn set_runtime_version(&mut self, scope: SettingsScope, version: semver::Version) {
        self.runtime_version.insert(scope, version);
    }

    /// Obtain the `Info.plist` data registered to a given scope.
    pub fn info_plist_data(&self, scope: impl AsRef<SettingsScope>) -> Option<&[u8]> {
        self.info_plist_data
            .get(scope.as_ref())
            .map(|x| x.as_slice())
    }

    /// Define the `Info.plist` content whose digest the Code Directory records.
    pub fn set_info_plist_data(&mut self, scope: SettingsScope, data: Vec<u8>) {
        self.info_plist_data.insert(scope, data);
    }

    /// Import existing state from a Mach-O file's signatures.
    ///
    /// Explicitly defined settings are honored. Otherwise the identifier,
    /// entitlements, code signature flags and runtime version of existing
    /// signatures are carried over, scoped to the slice they came from.
    pub fn import_settings_from_macho(&mut self, macho: &MachOFile) -> Result<(), MachoCodesignError> {
        info!("inferring default signing settings from Mach-O binary");

        for (index, arch) in macho.arches().iter().enumerate() {
            let signature = match macho.code_signature(index)? {
                Some(signature) => signature,
                None => continue,
            };

            let scope_main = SettingsScope::Main;
            let scope_index = SettingsScope::MultiArchIndex(index);
            let scope_arch = SettingsScope::MultiArchCpuType(arch.header.cputype);

            let scoped = |map_has: &dyn Fn(&SettingsScope) -> bool| {
                map_has(&scope_main) || map_has(&scope_index) || map_has(&scope_arch)
            };

            if let Some(cd) = signature.code_directory()? {
                if !scoped(&|s| self.identifiers.contains_key(s)) {
                    info!("using binary identifier from slice {}: {}", index, cd.ident);
                    self.set_binary_identifier(scope_index.clone(), cd.ident.to_string());
                }

                if !scoped(&|s| self.code_signature_flags.contains_key(s)) {
                    let flags = cd.flags
                        - (CodeSignatureFlags::ADHOC | CodeSignatureFlags::LINKER_SIGNED);

                    if !flags.is_empty() {
                        info!("using code signature flags from slice {}: {:?}", index, flags);
                        self.set_code_signature_flags(scope_index.clone(), flags);
                    }
                }

                if let Some(version) = cd.runtime {
                    if !scoped(&|s| self.runtime_version.contains_key(s)) {
                        let version = parse_version_nibbles(version);
                        info!("using hardened runtime version from slice {}: {}", index, version);
                        self.set_runtime_version(scope_index.clone(), version);
                    }
                }
            }

            if let Some(entitlements) = signature.entitlements()? {
                if !scoped(&|s| self.entitlements.contains_key(s)) {
                    info!("using entitlements from slice {}", index);
                    self.set_entitlements_xml(scope_index, entitlements.as_str())?;
                }
            }
        }

        Ok(())
    }

    /// Convert this instance to settings appropriate for a nested Mach-O binary.
    ///
    /// Any scoped settings for the slice index and CPU type are promoted to
    /// the main scope. CPU type settings take precedence over index scoped settings.
    #[must_use]
    pub fn as_nested_macho_settings(&self, index: usize, cpu_type: CpuType) -> Self {
        self.clone_with_filter_map(|key| {
            if key == SettingsScope::Main
                || key == SettingsScope::MultiArchCpuType(cpu_type)
                || key == SettingsScope::MultiArchIndex(index)
            {
                Some(SettingsScope::Main)
            } else {
                None
            }
        })
    }

    fn clone_with_filter_map(
        &self,
        key_map: impl Fn(SettingsScope) -> Option<SettingsScope>,
    ) -> Self {
        fn remap<V: Clone>(
            map: &BTreeMap<SettingsScope, V>,
            key_map: &impl Fn(SettingsScope) -> Option<SettingsScope>,
        ) -> BTreeMap<SettingsScope, V> {
            map.iter()
                .filter_map(|(key, value)| key_map(key.clone()).map(|key| (key, value.clone())))
                .collect()
        }

        Self {
            identity: self.identity.clone(),
            digest_type: self.digest_type,
            page_size: self.page_size,
            team_id: self.team_id.clone(),
            identifiers: remap(&self.identifiers, &key_map),
            entitlements: remap(&self.entitlements, &key_map),
            designated_requirement: remap(&self.designated_requirement, &key_map),
            code_signature_flags: remap(&self.code_signature_flags, &key_map),
            executable_segment_flags: remap(&self.executable_segment_flags, &key_map),
            runtime_version: remap(&self.runtime_version, &key_map),
            info_plist_data: remap(&self.info_plist_data, &key_map),
        }
    }
}

#[cfg(test)]
mod tests {
    use {super::*, indoc::indoc};

    const ENTITLEMENTS_XML: &str = indoc! {r#"
        <?xml version="1.0" encoding="UTF-8"?>
        <!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
        <plist version="1.0">
        <dict>
            <key>application-identifier</key>
            <string>appid</string>
            <key>com.apple.developer.team-identifier</key>
            <string>ABCDEF</string>
        </dict>
        </plist>
    "#};

    #[test]
    fn parse_settings_scope() {
        assert_eq!(
            SettingsScope::try_from("@main").unwrap(),
            SettingsScope::Main
        );
        assert_eq!(
            SettingsScope::try_from("@0").unwrap(),
            SettingsScope::MultiArchIndex(0)
        );
        assert_eq!(
            SettingsScope::try_from("@42").unwrap(),
            SettingsScope::MultiArchIndex(42)
        );
        assert_eq!(
            SettingsScope::try_from("@[cpu_type=7]").unwrap(),
            SettingsScope::MultiArchCpuType(7)
        );
        assert_eq!(
            SettingsScope::try_from("@[cpu_type=arm64]").unwrap(),
            SettingsScope::MultiArchCpuType(CPU_TYPE_ARM64)
        );
        assert_eq!(
            SettingsScope::try_from("@[cpu_type=x86_64]").unwrap(),
            SettingsScope::MultiArchCpuType(CPU_TYPE_X86_64)
        );

        assert!(SettingsScope::try_from("main").is_err());
        assert!(SettingsScope::try_from("@[arch=7]").is_err());
        assert!(SettingsScope::try_from("@[cpu_type=sparc]").is_err());
        assert!(SettingsScope::try_from("@[cpu_type]").is_err());
    }

    #[test]
    fn as_nested_macho_settings() {
        let mut main_settings = SigningSettings::default();
        main_settings.set_binary_identifier(SettingsScope::Main, "ident");
        main_settings
            .set_code_signature_flags(SettingsScope::Main, CodeSignatureFlags::FORCE_EXPIRATION);

        main_settings.set_code_signature_flags(
            SettingsScope::MultiArchIndex(0),
            CodeSignatureFlags::FORCE_HARD,
        );
        main_settings.set_code_signature_flags(
            SettingsScope::MultiArchCpuType(CPU_TYPE_X86_64),
            CodeSignatureFlags::RESTRICT,
        );
        main_settings.set_info_plist_data(SettingsScope::MultiArchIndex(0), b"index_0".to_vec());
        main_settings.set_info_plist_data(
            SettingsScope::MultiArchCpuType(CPU_TYPE_X86_64),
            b"cpu_x86_64".to_vec(),
        );

        let macho_settings = main_settings.as_nested_macho_settings(0, CPU_TYPE_ARM64);
        assert_eq!(
            macho_settings.binary_identifier(SettingsScope::Main),
            Some("ident")
        );
        assert_eq!(
            macho_settings.code_signature_flags(SettingsScope::Main),
            Some(CodeSignatureFlags::FORCE_HARD)
        );
        assert_eq!(
            macho_settings.info_plist_data(SettingsScope::Main),
            Some(b"index_0".as_ref())
        );

        let macho_settings = main_settings.as_nested_macho_settings(0, CPU_TYPE_X86_64);
        assert_eq!(
            macho_settings.code_signature_flags(SettingsScope::Main),
            Some(CodeSignatureFlags::RESTRICT)
        );
        assert_eq!(
            macho_settings.info_plist_data(SettingsScope::Main),
            Some(b"cpu_x86_64".as_ref())
        );

        let macho_settings = main_settings.as_nested_macho_settings(1, CPU_TYPE_ARM64);
        assert_eq!(
            macho_settings.code_signature_flags(SettingsScope::Main),
            Some(CodeSignatureFlags::FORCE_EXPIRATION)
        );
        assert_eq!(macho_settings.info_plist_data(SettingsScope::Main), None);
    }

    #[test]
    fn entitlements_handling() -> Result<(), MachoCodesignError> {
        let mut settings = SigningSettings::default();
        settings.set_entitlements_xml(SettingsScope::Main, ENTITLEMENTS_XML)?;

        // Embedded verbatim.
        assert_eq!(settings.entitlements_xml(SettingsScope::Main), Some(ENTITLEMENTS_XML));

        let value = settings
            .entitlements_plist(SettingsScope::Main)?
            .expect("entitlements present");
        assert_eq!(
            value
                .as_dictionary()
                .and_then(|d| d.get("application-identifier"))
                .and_then(|v| v.as_string()),
            Some("appid")
        );

        assert!(settings
            .set_entitlements_xml(SettingsScope::Main, "<not a plist")
            .is_err());

        Ok(())
    }

    #[test]
    fn digest_and_page_size_validation() {
        let mut settings = SigningSettings::default();
        assert_eq!(settings.digest_type(), DigestType::Sha256);
        assert_eq!(settings.page_size(), DEFAULT_PAGE_SIZE);

        assert!(settings.set_digest_type(DigestType::Sha1).is_ok());
        assert!(settings.set_digest_type(DigestType::None).is_err());
        assert_eq!(settings.digest_type(), DigestType::Sha1);

        assert!(settings.set_page_size(16384).is_ok());
        assert!(settings.set_page_size(1000).is_err());
        assert_eq!(settings.page_size(), 16384);
    }

    #[test]
    fn explicit_requirement_roundtrips() -> Result<(), MachoCodesignError> {
        use crate::code_requirement::{CodeRequirement, CodeRequirementExpression};

        let blob = CodeRequirement(CodeRequirementExpression::Identifier("com.example".into()))
            .to_blob_data()?;

        let mut settings = SigningSettings::default();
        assert_eq!(
            settings.designated_requirement(SettingsScope::Main),
            &DesignatedRequirementMode::Auto
        );

        settings.set_designated_requirement_bytes(SettingsScope::Main, &blob)?;
        assert_eq!(
            settings.designated_requirement(SettingsScope::Main),
            &DesignatedRequirementMode::Explicit(blob)
        );

        assert!(settings
            .set_designated_requirement_bytes(SettingsScope::Main, b"garbage")
            .is_err());

        Ok(())
    }
}
