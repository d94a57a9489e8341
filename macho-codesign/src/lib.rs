// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Mach-O code signing and notarization.
//!
//! This crate produces Apple compatible code signatures for Mach-O
//! executables and drives Apple's notarization service, without a dependency
//! on an Apple hardware device or operating system: you should be able to
//! sign, notarize and staple macOS binaries from Linux, Windows, or other
//! non-Apple environments.
//!
//! It is highly recommended to validate output against what Apple's official
//! tools produce.
//!
//! # Features and Capabilities
//!
//! This crate can:
//!
//! * Parse thin and fat/universal Mach-O binaries and locate their embedded
//!   code signature data. (See [MachOFile].)
//! * Deeply parse code signature data into Rust structs. (See
//!   [EmbeddedSignature], [BlobData], and e.g. [CodeDirectoryBlob].)
//! * Generate new embedded signature data, either ad-hoc or cryptographically
//!   signed with an X.509 certificate chain and private key you provide.
//!   (See [MachOSigner] and [SigningSettings].)
//! * Write a new Mach-O file containing new signature data, atomically
//!   replacing the destination. (See [UnifiedSigner].)
//! * Submit notarization requests to Apple via the App Store Connect Notary
//!   API and wait on their verdict. (See [Notarizer].)
//! * Retrieve notarization tickets from Apple and staple them to binaries.
//!   (See [stapling].)
//!
//! Only embedded signatures are supported. Code requirements are handled in
//! their compiled binary form; the requirements language isn't parsed.
//!
//! # Getting Started
//!
//! The [MachOSigner] type is your gateway to how code signing is performed.
//! [SigningSettings] controls what ends up in the signature.
//!
//! The [EmbeddedSignature] type describes existing code signatures on Mach-O
//! binaries.

pub mod app_store_connect;
mod code_directory;
pub use code_directory::*;
mod code_hash;
pub use code_hash::*;
pub mod code_requirement;
pub use code_requirement::*;
mod cryptography;
pub use cryptography::*;
pub mod embedded_signature;
pub use embedded_signature::*;
mod embedded_signature_builder;
pub use embedded_signature_builder::*;
pub mod entitlements;
mod error;
pub use error::*;
pub mod eventloop;
mod macho;
pub use macho::*;
mod macho_signing;
pub use macho_signing::*;
pub mod notarization;
pub use notarization::*;
mod policy;
pub use policy::*;
mod signing;
pub use signing::*;
mod signing_settings;
pub use signing_settings::*;
pub mod stapling;
pub mod ticket_lookup;
pub mod ui;
pub mod universal;
pub mod version;

#[cfg(test)]
mod testutil;
