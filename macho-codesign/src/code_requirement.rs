// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Code requirement language primitives.

Code signatures contain a binary encoded expression tree denoting requirements.
There is a human friendly DSL that `csreq` compiles into these binary
expressions. This module does not parse the DSL: compiled requirement blobs
are accepted verbatim, and expressions can be built in Rust and serialized.

# Binary Encoding

Requirement expressions consist of opcodes. An opcode is a u32 where the high
byte contains flags and the lower 3 bytes denote the opcode value.

Variable length data is a u32 length followed by the bytes, NULL padded so the
next opcode is always aligned on a 4 byte boundary.
*/

use {
    crate::{
        embedded_signature::{
            read_and_validate_blob_header, Blob, CodeSigningMagic, RequirementBlob,
            RequirementSetBlob,
        },
        MachoCodesignError,
    },
    scroll::{IOwrite, Pread},
    std::{
        borrow::Cow,
        fmt::Display,
        io::Write,
    },
};

const OPCODE_VALUE_MASK: u32 = 0x00ffffff;

/// Requirement kind for an expression tree. The only kind in use.
const REQUIREMENT_KIND_EXPRESSION: u32 = 1;

fn read_data(data: &[u8]) -> Result<(&[u8], &[u8]), MachoCodesignError> {
    let length = data.pread_with::<u32>(0, scroll::BE)? as usize;
    let value = data
        .get(4..4 + length)
        .ok_or(MachoCodesignError::RequirementMalformed("data length"))?;

    // Next element is aligned on next 4 byte boundary.
    let offset = (4 + length + 3) & !3;

    Ok((value, data.get(offset..).unwrap_or(&[])))
}

fn write_data(dest: &mut impl Write, data: &[u8]) -> Result<(), MachoCodesignError> {
    dest.iowrite_with(data.len() as u32, scroll::BE)?;
    dest.write_all(data)?;

    match data.len() % 4 {
        0 => {}
        pad => {
            for _ in 0..4 - pad {
                dest.iowrite(0u8)?;
            }
        }
    }

    Ok(())
}

fn read_str<'a>(data: &'a [u8], what: &'static str) -> Result<(&'a str, &'a [u8]), MachoCodesignError> {
    let (value, rest) = read_data(data)?;
    let s = std::str::from_utf8(value).map_err(|_| MachoCodesignError::RequirementMalformed(what))?;

    Ok((s, rest))
}

/// Format a certificate slot's value to human form.
fn format_certificate_slot(slot: i32) -> String {
    match slot {
        -1 => "root".to_string(),
        0 => "leaf".to_string(),
        _ => format!("{}", slot),
    }
}

/// The type of a requirement within a requirement set.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum RequirementType {
    Host,
    Guest,
    Designated,
    Library,
    Plugin,
    Unknown(u32),
}

impl From<u32> for RequirementType {
    fn from(v: u32) -> Self {
        match v {
            1 => Self::Host,
            2 => Self::Guest,
            3 => Self::Designated,
            4 => Self::Library,
            5 => Self::Plugin,
            _ => Self::Unknown(v),
        }
    }
}

impl From<RequirementType> for u32 {
    fn from(t: RequirementType) -> Self {
        match t {
            RequirementType::Host => 1,
            RequirementType::Guest => 2,
            RequirementType::Designated => 3,
            RequirementType::Library => 4,
            RequirementType::Plugin => 5,
            RequirementType::Unknown(v) => v,
        }
    }
}

impl Display for RequirementType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Host => f.write_str("host"),
            Self::Guest => f.write_str("guest"),
            Self::Designated => f.write_str("designated"),
            Self::Library => f.write_str("library"),
            Self::Plugin => f.write_str("plugin"),
            Self::Unknown(v) => f.write_fmt(format_args!("unknown ({})", v)),
        }
    }
}

/// A value in a code requirement expression.
#[derive(Clone, Debug, PartialEq)]
pub enum CodeRequirementValue<'a> {
    String(Cow<'a, str>),
    Bytes(Cow<'a, [u8]>),
}

impl<'a> From<&'a [u8]> for CodeRequirementValue<'a> {
    fn from(value: &'a [u8]) -> Self {
        let is_ascii_printable = |c: &u8| -> bool {
            c.is_ascii_alphanumeric() || c.is_ascii_whitespace() || c.is_ascii_punctuation()
        };

        match std::str::from_utf8(value) {
            Ok(s) if value.iter().all(is_ascii_printable) => Self::String(s.into()),
            _ => Self::Bytes(value.into()),
        }
    }
}

impl<'a> From<&'a str> for CodeRequirementValue<'a> {
    fn from(s: &'a str) -> Self {
        Self::String(s.into())
    }
}

impl From<String> for CodeRequirementValue<'static> {
    fn from(v: String) -> Self {
        Self::String(Cow::Owned(v))
    }
}

impl<'a> Display for CodeRequirementValue<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String(s) => f.write_fmt(format_args!("\"{}\"", s)),
            Self::Bytes(data) => f.write_fmt(format_args!("H\"{}\"", hex::encode(data))),
        }
    }
}

impl<'a> CodeRequirementValue<'a> {
    fn write_encoded(&self, dest: &mut impl Write) -> Result<(), MachoCodesignError> {
        match self {
            Self::Bytes(data) => write_data(dest, data),
            Self::String(s) => write_data(dest, s.as_bytes()),
        }
    }

    fn to_owned(&self) -> CodeRequirementValue<'static> {
        match self {
            Self::String(s) => CodeRequirementValue::String(Cow::Owned(s.to_string())),
            Self::Bytes(b) => CodeRequirementValue::Bytes(Cow::Owned(b.to_vec())),
        }
    }
}

/// An opcode representing a code requirement expression.
#[derive(Clone, Copy, Debug, PartialEq)]
#[repr(u32)]
enum RequirementOpCode {
    False = 0,
    True = 1,
    Identifier = 2,
    AnchorApple = 3,
    AnchorCertificateHash = 4,
    And = 6,
    Or = 7,
    CodeDirectoryHash = 8,
    Not = 9,
    CertificateField = 11,
    CertificateGeneric = 14,
    AnchorAppleGeneric = 15,
    Notarized = 21,
}

impl TryFrom<u32> for RequirementOpCode {
    type Error = MachoCodesignError;

    fn try_from(v: u32) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::False),
            1 => Ok(Self::True),
            2 => Ok(Self::Identifier),
            3 => Ok(Self::AnchorApple),
            4 => Ok(Self::AnchorCertificateHash),
            6 => Ok(Self::And),
            7 => Ok(Self::Or),
            8 => Ok(Self::CodeDirectoryHash),
            9 => Ok(Self::Not),
            11 => Ok(Self::CertificateField),
            14 => Ok(Self::CertificateGeneric),
            15 => Ok(Self::AnchorAppleGeneric),
            21 => Ok(Self::Notarized),
            _ => Err(MachoCodesignError::RequirementUnknownOpcode(v)),
        }
    }
}

/// A code requirement expression.
#[derive(Clone, Debug, PartialEq)]
pub enum CodeRequirementExpression<'a> {
    /// `false`
    False,

    /// `true`
    True,

    /// `identifier <string>`
    Identifier(Cow<'a, str>),

    /// `anchor apple`
    AnchorApple,

    /// `certificate <slot> = H"<digest>"`
    ///
    /// Matches the SHA-1 digest of the DER of the certificate in the slot.
    AnchorCertificateHash(i32, Cow<'a, [u8]>),

    /// `<expr> and <expr>`
    And(
        Box<CodeRequirementExpression<'a>>,
        Box<CodeRequirementExpression<'a>>,
    ),

    /// `<expr> or <expr>`
    Or(
        Box<CodeRequirementExpression<'a>>,
        Box<CodeRequirementExpression<'a>>,
    ),

    /// `cdhash H"<digest>"`
    CodeDirectoryHash(Cow<'a, [u8]>),

    /// `! <expr>`
    Not(Box<CodeRequirementExpression<'a>>),

    /// `certificate <slot> [<field>] <match>`
    CertificateField(i32, Cow<'a, str>, CodeRequirementMatchExpression<'a>),

    /// `certificate <slot> [field.<oid>] <match>`
    ///
    /// The OID is carried in its DER content encoding.
    CertificateGeneric(i32, Cow<'a, [u8]>, CodeRequirementMatchExpression<'a>),

    /// `anchor apple generic`
    AnchorAppleGeneric,

    /// `notarized`
    Notarized,
}

impl<'a> Display for CodeRequirementExpression<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::False => f.write_str("never"),
            Self::True => f.write_str("always"),
            Self::Identifier(value) => f.write_fmt(format_args!("identifier \"{}\"", value)),
            Self::AnchorApple => f.write_str("anchor apple"),
            Self::AnchorCertificateHash(slot, digest) => f.write_fmt(format_args!(
                "certificate {} = H\"{}\"",
                format_certificate_slot(*slot),
                hex::encode(digest)
            )),
            Self::And(a, b) => f.write_fmt(format_args!("({}) and ({})", a, b)),
            Self::Or(a, b) => f.write_fmt(format_args!("({}) or ({})", a, b)),
            Self::CodeDirectoryHash(digest) => {
                f.write_fmt(format_args!("cdhash H\"{}\"", hex::encode(digest)))
            }
            Self::Not(expr) => f.write_fmt(format_args!("!({})", expr)),
            Self::CertificateField(slot, field, expr) => f.write_fmt(format_args!(
                "certificate {}[{}] {}",
                format_certificate_slot(*slot),
                field,
                expr
            )),
            Self::CertificateGeneric(slot, oid, expr) => f.write_fmt(format_args!(
                "certificate {}[field.{}] {}",
                format_certificate_slot(*slot),
                bcder::Oid(bytes::Bytes::copy_from_slice(oid)),
                expr
            )),
            Self::AnchorAppleGeneric => f.write_str("anchor apple generic"),
            Self::Notarized => f.write_str("notarized"),
        }
    }
}

impl<'a> CodeRequirementExpression<'a> {
    /// Parse a single expression from bytes.
    ///
    /// Returns the expression and the data remaining after it.
    pub fn from_bytes(data: &'a [u8]) -> Result<(Self, &'a [u8]), MachoCodesignError> {
        let opcode_raw = data.pread_with::<u32>(0, scroll::BE)?;
        let opcode = RequirementOpCode::try_from(opcode_raw & OPCODE_VALUE_MASK)?;
        let data = &data[4..];

        match opcode {
            RequirementOpCode::False => Ok((Self::False, data)),
            RequirementOpCode::True => Ok((Self::True, data)),
            RequirementOpCode::Identifier => {
                let (s, data) = read_str(data, "identifier value not a UTF-8 string")?;

                Ok((Self::Identifier(s.into()), data))
            }
            RequirementOpCode::AnchorApple => Ok((Self::AnchorApple, data)),
            RequirementOpCode::AnchorCertificateHash => {
                let slot = data.pread_with::<i32>(0, scroll::BE)?;
                let (digest, data) = read_data(&data[4..])?;

                Ok((Self::AnchorCertificateHash(slot, digest.into()), data))
            }
            RequirementOpCode::And => {
                let (a, data) = Self::from_bytes(data)?;
                let (b, data) = Self::from_bytes(data)?;

                Ok((Self::And(Box::new(a), Box::new(b)), data))
            }
            RequirementOpCode::Or => {
                let (a, data) = Self::from_bytes(data)?;
                let (b, data) = Self::from_bytes(data)?;

                Ok((Self::Or(Box::new(a), Box::new(b)), data))
            }
            RequirementOpCode::CodeDirectoryHash => {
                let (value, data) = read_data(data)?;

                Ok((Self::CodeDirectoryHash(value.into()), data))
            }
            RequirementOpCode::Not => {
                let (expr, data) = Self::from_bytes(data)?;

                Ok((Self::Not(Box::new(expr)), data))
            }
            RequirementOpCode::CertificateField => {
                let slot = data.pread_with::<i32>(0, scroll::BE)?;
                let (field, data) = read_str(&data[4..], "certificate field is not valid UTF-8")?;
                let (expr, data) = CodeRequirementMatchExpression::from_bytes(data)?;

                Ok((Self::CertificateField(slot, field.into(), expr), data))
            }
            RequirementOpCode::CertificateGeneric => {
                let slot = data.pread_with::<i32>(0, scroll::BE)?;
                let (oid, data) = read_data(&data[4..])?;
                let (expr, data) = CodeRequirementMatchExpression::from_bytes(data)?;

                Ok((Self::CertificateGeneric(slot, oid.into(), expr), data))
            }
            RequirementOpCode::AnchorAppleGeneric => Ok((Self::AnchorAppleGeneric, data)),
            RequirementOpCode::Notarized => Ok((Self::Notarized, data)),
        }
    }

    fn opcode(&self) -> RequirementOpCode {
        match self {
            Self::False => RequirementOpCode::False,
            Self::True => RequirementOpCode::True,
            Self::Identifier(_) => RequirementOpCode::Identifier,
            Self::AnchorApple => RequirementOpCode::AnchorApple,
            Self::AnchorCertificateHash(_, _) => RequirementOpCode::AnchorCertificateHash,
            Self::And(_, _) => RequirementOpCode::And,
            Self::Or(_, _) => RequirementOpCode::Or,
            Self::CodeDirectoryHash(_) => RequirementOpCode::CodeDirectoryHash,
            Self::Not(_) => RequirementOpCode::Not,
            Self::CertificateField(_, _, _) => RequirementOpCode::CertificateField,
            Self::CertificateGeneric(_, _, _) => RequirementOpCode::CertificateGeneric,
            Self::AnchorAppleGeneric => RequirementOpCode::AnchorAppleGeneric,
            Self::Notarized => RequirementOpCode::Notarized,
        }
    }

    /// Write binary representation of this expression to a destination.
    pub fn write_to(&self, dest: &mut impl Write) -> Result<(), MachoCodesignError> {
        dest.iowrite_with(self.opcode() as u32, scroll::BE)?;

        match self {
            Self::False
            | Self::True
            | Self::AnchorApple
            | Self::AnchorAppleGeneric
            | Self::Notarized => {}
            Self::Identifier(s) => write_data(dest, s.as_bytes())?,
            Self::AnchorCertificateHash(slot, digest) => {
                dest.iowrite_with(*slot, scroll::BE)?;
                write_data(dest, digest)?;
            }
            Self::And(a, b) | Self::Or(a, b) => {
                a.write_to(dest)?;
                b.write_to(dest)?;
            }
            Self::CodeDirectoryHash(digest) => write_data(dest, digest)?,
            Self::Not(expr) => expr.write_to(dest)?,
            Self::CertificateField(slot, field, expr) => {
                dest.iowrite_with(*slot, scroll::BE)?;
                write_data(dest, field.as_bytes())?;
                expr.write_to(dest)?;
            }
            Self::CertificateGeneric(slot, oid, expr) => {
                dest.iowrite_with(*slot, scroll::BE)?;
                write_data(dest, oid)?;
                expr.write_to(dest)?;
            }
        }

        Ok(())
    }

    /// Produce a copy that owns all of its data.
    pub fn to_owned(&self) -> CodeRequirementExpression<'static> {
        match self {
            Self::False => CodeRequirementExpression::False,
            Self::True => CodeRequirementExpression::True,
            Self::Identifier(s) => CodeRequirementExpression::Identifier(Cow::Owned(s.to_string())),
            Self::AnchorApple => CodeRequirementExpression::AnchorApple,
            Self::AnchorCertificateHash(slot, digest) => {
                CodeRequirementExpression::AnchorCertificateHash(*slot, Cow::Owned(digest.to_vec()))
            }
            Self::And(a, b) => {
                CodeRequirementExpression::And(Box::new((**a).to_owned()), Box::new((**b).to_owned()))
            }
            Self::Or(a, b) => {
                CodeRequirementExpression::Or(Box::new((**a).to_owned()), Box::new((**b).to_owned()))
            }
            Self::CodeDirectoryHash(digest) => {
                CodeRequirementExpression::CodeDirectoryHash(Cow::Owned(digest.to_vec()))
            }
            Self::Not(expr) => CodeRequirementExpression::Not(Box::new((**expr).to_owned())),
            Self::CertificateField(slot, field, expr) => CodeRequirementExpression::CertificateField(
                *slot,
                Cow::Owned(field.to_string()),
                expr.to_owned(),
            ),
            Self::CertificateGeneric(slot, oid, expr) => {
                CodeRequirementExpression::CertificateGeneric(
                    *slot,
                    Cow::Owned(oid.to_vec()),
                    expr.to_owned(),
                )
            }
            Self::AnchorAppleGeneric => CodeRequirementExpression::AnchorAppleGeneric,
            Self::Notarized => CodeRequirementExpression::Notarized,
        }
    }
}

/// A match expression applied to a certificate field or similar value.
#[derive(Clone, Debug, PartialEq)]
pub enum CodeRequirementMatchExpression<'a> {
    Exists,
    Equal(CodeRequirementValue<'a>),
    Contains(CodeRequirementValue<'a>),
    BeginsWith(CodeRequirementValue<'a>),
    EndsWith(CodeRequirementValue<'a>),
    Absent,
}

impl<'a> Display for CodeRequirementMatchExpression<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exists => f.write_str("/* exists */"),
            Self::Equal(v) => f.write_fmt(format_args!("= {}", v)),
            Self::Contains(v) => f.write_fmt(format_args!("~ {}", v)),
            Self::BeginsWith(v) => f.write_fmt(format_args!("= {}*", v)),
            Self::EndsWith(v) => f.write_fmt(format_args!("= *{}", v)),
            Self::Absent => f.write_str("absent"),
        }
    }
}

impl<'a> CodeRequirementMatchExpression<'a> {
    fn match_type(&self) -> u32 {
        match self {
            Self::Exists => 0,
            Self::Equal(_) => 1,
            Self::Contains(_) => 2,
            Self::BeginsWith(_) => 3,
            Self::EndsWith(_) => 4,
            Self::Absent => 14,
        }
    }

    /// Parse a match expression from bytes.
    ///
    /// The slice should begin with the match type u32.
    pub fn from_bytes(data: &'a [u8]) -> Result<(Self, &'a [u8]), MachoCodesignError> {
        let typ = data.pread_with::<u32>(0, scroll::BE)?;
        let data = &data[4..];

        let value = |data: &'a [u8]| -> Result<(CodeRequirementValue<'a>, &'a [u8]), MachoCodesignError> {
            let (value, data) = read_data(data)?;
            Ok((value.into(), data))
        };

        match typ {
            0 => Ok((Self::Exists, data)),
            1 => value(data).map(|(v, d)| (Self::Equal(v), d)),
            2 => value(data).map(|(v, d)| (Self::Contains(v), d)),
            3 => value(data).map(|(v, d)| (Self::BeginsWith(v), d)),
            4 => value(data).map(|(v, d)| (Self::EndsWith(v), d)),
            14 => Ok((Self::Absent, data)),
            _ => Err(MachoCodesignError::RequirementUnknownMatchExpression(typ)),
        }
    }

    /// Write binary representation of this match expression to a destination.
    pub fn write_to(&self, dest: &mut impl Write) -> Result<(), MachoCodesignError> {
        dest.iowrite_with(self.match_type(), scroll::BE)?;

        match self {
            Self::Exists | Self::Absent => {}
            Self::Equal(value)
            | Self::Contains(value)
            | Self::BeginsWith(value)
            | Self::EndsWith(value) => value.write_encoded(dest)?,
        }

        Ok(())
    }

    pub fn to_owned(&self) -> CodeRequirementMatchExpression<'static> {
        match self {
            Self::Exists => CodeRequirementMatchExpression::Exists,
            Self::Equal(v) => CodeRequirementMatchExpression::Equal(v.to_owned()),
            Self::Contains(v) => CodeRequirementMatchExpression::Contains(v.to_owned()),
            Self::BeginsWith(v) => CodeRequirementMatchExpression::BeginsWith(v.to_owned()),
            Self::EndsWith(v) => CodeRequirementMatchExpression::EndsWith(v.to_owned()),
            Self::Absent => CodeRequirementMatchExpression::Absent,
        }
    }
}

/// A single requirement: an expression tree of kind "expression".
#[derive(Clone, Debug, PartialEq)]
pub struct CodeRequirement<'a>(pub CodeRequirementExpression<'a>);

impl<'a> Display for CodeRequirement<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl<'a> CodeRequirement<'a> {
    /// Parse the payload of a requirement blob (the data after the blob header).
    pub fn parse_binary(data: &'a [u8]) -> Result<(Self, &'a [u8]), MachoCodesignError> {
        let kind = data.pread_with::<u32>(0, scroll::BE)?;

        if kind != REQUIREMENT_KIND_EXPRESSION {
            return Err(MachoCodesignError::RequirementMalformed(
                "unsupported requirement kind",
            ));
        }

        let (expr, data) = CodeRequirementExpression::from_bytes(&data[4..])?;

        Ok((Self(expr), data))
    }

    /// Parse a requirement blob, header magic included.
    ///
    /// This can be used to parse the output generated by `csreq -b`.
    pub fn parse_blob(data: &'a [u8]) -> Result<(Self, &'a [u8]), MachoCodesignError> {
        let data = read_and_validate_blob_header(
            data,
            u32::from(CodeSigningMagic::Requirement),
            "code requirement blob",
        )
        .map_err(|_| MachoCodesignError::RequirementMalformed("blob header"))?;

        Self::parse_binary(data)
    }

    /// Write binary representation of this requirement without blob header.
    pub fn write_to(&self, dest: &mut impl Write) -> Result<(), MachoCodesignError> {
        dest.iowrite_with(REQUIREMENT_KIND_EXPRESSION, scroll::BE)?;
        self.0.write_to(dest)
    }

    /// Obtain the blob representation, the way `csreq -b` would produce it.
    pub fn to_blob_data(&self) -> Result<Vec<u8>, MachoCodesignError> {
        RequirementBlob::try_from(self)?.to_blob_bytes()
    }

    /// Have this instance occupy a slot in a [RequirementSetBlob] instance.
    pub fn add_to_requirement_set(
        &self,
        requirements_set: &mut RequirementSetBlob,
        slot: RequirementType,
    ) -> Result<(), MachoCodesignError> {
        let blob = RequirementBlob::try_from(self)?;

        requirements_set.set_requirements(slot, blob);

        Ok(())
    }
}

impl<'a> TryFrom<&CodeRequirement<'a>> for RequirementBlob<'static> {
    type Error = MachoCodesignError;

    fn try_from(requirement: &CodeRequirement<'a>) -> Result<Self, Self::Error> {
        let mut data = Vec::<u8>::new();
        requirement.write_to(&mut data)?;

        Ok(Self {
            data: Cow::Owned(data),
        })
    }
}

impl<'a> RequirementBlob<'a> {
    /// Parse the binary data in this blob into a requirement expression.
    pub fn parse_requirement(&self) -> Result<CodeRequirement<'_>, MachoCodesignError> {
        Ok(CodeRequirement::parse_binary(&self.data)?.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn verify_roundtrip(req: &CodeRequirement, source: &[u8]) {
        let mut dest = Vec::<u8>::new();
        req.write_to(&mut dest).unwrap();
        assert_eq!(dest.as_slice(), source);
    }

    #[test]
    fn parse_identifier() {
        // kind=1, opcode=2, len=4 "abcd"
        let source = hex::decode("00000001000000020000000461626364").unwrap();

        let (req, data) = CodeRequirement::parse_binary(&source).unwrap();
        assert_eq!(
            req,
            CodeRequirement(CodeRequirementExpression::Identifier("abcd".into()))
        );
        assert!(data.is_empty());
        verify_roundtrip(&req, &source);
    }

    #[test]
    fn identifier_is_padded() {
        let req = CodeRequirement(CodeRequirementExpression::Identifier("abc".into()));
        let mut dest = Vec::new();
        req.write_to(&mut dest).unwrap();

        assert_eq!(hex::encode(&dest), "00000001000000020000000361626300");
    }

    #[test]
    fn certificate_hash_and_identifier() {
        let digest = [0x42u8; 20];
        let req = CodeRequirement(CodeRequirementExpression::And(
            Box::new(CodeRequirementExpression::Identifier("com.example.tool".into())),
            Box::new(CodeRequirementExpression::AnchorCertificateHash(
                0,
                digest.to_vec().into(),
            )),
        ));

        let blob = req.to_blob_data().unwrap();
        assert_eq!(&blob[0..4], &[0xfa, 0xde, 0x0c, 0x00]);
        assert_eq!(
            blob.pread_with::<u32>(4, scroll::BE).unwrap() as usize,
            blob.len()
        );

        let (parsed, rest) = CodeRequirement::parse_blob(&blob).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed, req);
        assert_eq!(
            parsed.to_string(),
            format!(
                "(identifier \"com.example.tool\") and (certificate leaf = H\"{}\")",
                hex::encode(digest)
            )
        );
    }

    #[test]
    fn requirement_set_with_designated() {
        let req = CodeRequirement(CodeRequirementExpression::Identifier("x".into()));
        let mut set = RequirementSetBlob::default();
        req.add_to_requirement_set(&mut set, RequirementType::Designated)
            .unwrap();

        let data = set.to_blob_bytes().unwrap();
        // count
        assert_eq!(data.pread_with::<u32>(8, scroll::BE).unwrap(), 1);
        // type
        assert_eq!(data.pread_with::<u32>(12, scroll::BE).unwrap(), 3);
        // offset, relative to blob start
        assert_eq!(data.pread_with::<u32>(16, scroll::BE).unwrap(), 20);

        let parsed = RequirementSetBlob::from_blob_bytes(&data).unwrap();
        let designated = parsed
            .requirements
            .get(&RequirementType::Designated)
            .unwrap();
        assert_eq!(designated.parse_requirement().unwrap(), req);
    }

    #[test]
    fn truncated_data_is_error() {
        let source = hex::decode("0000000100000002000000ff6162").unwrap();
        assert!(CodeRequirement::parse_binary(&source).is_err());
    }

    #[test]
    fn owned_copy_outlives_source() {
        let owned = {
            let blob = CodeRequirement(CodeRequirementExpression::Or(
                Box::new(CodeRequirementExpression::Not(Box::new(
                    CodeRequirementExpression::Identifier("com.example.a".into()),
                ))),
                Box::new(CodeRequirementExpression::And(
                    Box::new(CodeRequirementExpression::AnchorApple),
                    Box::new(CodeRequirementExpression::Identifier("com.example.b".into())),
                )),
            ))
            .to_blob_data()
            .unwrap();

            let (parsed, _) = CodeRequirement::parse_blob(&blob).unwrap();
            parsed.0.to_owned()
        };

        assert_eq!(
            owned.to_string(),
            "(!(identifier \"com.example.a\")) or ((anchor apple) and (identifier \"com.example.b\"))"
        );
    }
}
