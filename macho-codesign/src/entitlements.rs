// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Code entitlements handling.

Entitlements are embedded verbatim: the XML bytes supplied by the caller
become the payload of the entitlements blob and are digested as is. The
plist is only parsed to discover entitlements that imply executable
segment flags.
*/

use {
    crate::{code_directory::ExecutableSegmentFlags, error::MachoCodesignError},
    plist::Value,
};

/// Parse entitlements XML into a plist [Value].
///
/// The root must be a dictionary.
pub fn parse_entitlements_xml(data: &[u8]) -> Result<Value, MachoCodesignError> {
    let value = Value::from_reader_xml(std::io::Cursor::new(data))?;

    if value.as_dictionary().is_none() {
        return Err(MachoCodesignError::CliGeneralError(
            "entitlements plist root is not a dictionary".into(),
        ));
    }

    Ok(value)
}

/// Convert an entitlements plist to [ExecutableSegmentFlags].
///
/// Some entitlements plist values imply features in executable segment flags.
/// This function resolves those implied features.
pub fn plist_to_executable_segment_flags(value: &Value) -> ExecutableSegmentFlags {
    const IMPLIED: &[(&str, ExecutableSegmentFlags)] = &[
        ("get-task-allow", ExecutableSegmentFlags::ALLOW_UNSIGNED),
        ("run-unsigned-code", ExecutableSegmentFlags::ALLOW_UNSIGNED),
        (
            "com.apple.private.cs.debugger",
            ExecutableSegmentFlags::DEBUGGER,
        ),
        ("dynamic-codesigning", ExecutableSegmentFlags::JIT),
        (
            "com.apple.private.skip-library-validation",
            ExecutableSegmentFlags::SKIP_LIBRARY_VALIDATION,
        ),
        (
            "com.apple.private.amfi.can-load-cdhash",
            ExecutableSegmentFlags::CAN_LOAD_CD_HASH,
        ),
        (
            "com.apple.private.amfi.can-execute-cdhash",
            ExecutableSegmentFlags::CAN_EXEC_CD_HASH,
        ),
    ];

    let mut flags = ExecutableSegmentFlags::empty();

    if let Value::Dictionary(d) = value {
        for (key, flag) in IMPLIED {
            if matches!(d.get(key), Some(Value::Boolean(true))) {
                flags |= *flag;
            }
        }
    }

    flags
}

#[cfg(test)]
mod test {
    use {super::*, indoc::indoc};

    const ENTITLEMENTS: &str = indoc! {r#"
        <?xml version="1.0" encoding="UTF-8"?>
        <!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
        <plist version="1.0">
        <dict>
            <key>com.apple.security.cs.allow-jit</key>
            <true/>
            <key>get-task-allow</key>
            <true/>
            <key>dynamic-codesigning</key>
            <true/>
            <key>com.apple.private.cs.debugger</key>
            <false/>
        </dict>
        </plist>
    "#};

    #[test]
    fn implied_flags() -> Result<(), MachoCodesignError> {
        let value = parse_entitlements_xml(ENTITLEMENTS.as_bytes())?;

        assert_eq!(
            plist_to_executable_segment_flags(&value),
            ExecutableSegmentFlags::ALLOW_UNSIGNED | ExecutableSegmentFlags::JIT
        );

        Ok(())
    }

    #[test]
    fn non_dictionary_rejected() {
        let xml = indoc! {r#"
            <?xml version="1.0" encoding="UTF-8"?>
            <plist version="1.0">
            <array><true/></array>
            </plist>
        "#};

        assert!(parse_entitlements_xml(xml.as_bytes()).is_err());
        assert!(parse_entitlements_xml(b"not xml").is_err());
    }

    #[test]
    fn empty_dictionary_has_no_flags() {
        assert!(plist_to_executable_segment_flags(&Value::Dictionary(Default::default())).is_empty());
        assert!(plist_to_executable_segment_flags(&Value::Boolean(true)).is_empty());
    }
}
