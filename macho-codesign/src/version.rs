// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Build information.

use {
    crate::error::MachoCodesignError,
    serde::Serialize,
    std::fmt::Write,
};

pub const APPLICATION_NAME: &str = "machosign";

const NOT_PROVIDED: &str = "[not provided]";

/// Describes the running build.
///
/// Build date, commit and tree state are taken from the `MACHOSIGN_BUILD_DATE`,
/// `MACHOSIGN_GIT_COMMIT` and `MACHOSIGN_GIT_TREE_STATE` environment variables
/// at compile time when present.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    pub application: String,
    pub version: String,
    pub build_date: String,
    pub git_commit: String,
    pub git_tree_state: String,
    pub platform: String,
    pub compiler: String,
}

impl VersionInfo {
    pub fn from_build() -> Self {
        Self {
            application: APPLICATION_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            build_date: option_env!("MACHOSIGN_BUILD_DATE")
                .unwrap_or(NOT_PROVIDED)
                .to_string(),
            git_commit: option_env!("MACHOSIGN_GIT_COMMIT")
                .unwrap_or(NOT_PROVIDED)
                .to_string(),
            git_tree_state: option_env!("MACHOSIGN_GIT_TREE_STATE")
                .unwrap_or(NOT_PROVIDED)
                .to_string(),
            platform: format!("{}/{}", std::env::consts::OS, std::env::consts::ARCH),
            compiler: "rustc".to_string(),
        }
    }

    /// Render in the requested output format (`text` or `json`).
    pub fn render(&self, format: &str) -> Result<String, MachoCodesignError> {
        match format {
            "text" => {
                let mut s = String::new();
                for (label, value) in [
                    ("Application:", &self.application),
                    ("Version:", &self.version),
                    ("BuildDate:", &self.build_date),
                    ("GitCommit:", &self.git_commit),
                    ("GitTreeState:", &self.git_tree_state),
                    ("Platform:", &self.platform),
                    ("Compiler:", &self.compiler),
                ] {
                    writeln!(s, "{:<15}{}", label, value)
                        .map_err(|e| MachoCodesignError::CliGeneralError(e.to_string()))?;
                }

                Ok(s)
            }
            "json" => {
                let mut buf = vec![];
                let formatter = serde_json::ser::PrettyFormatter::with_indent(b" ");
                let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
                self.serialize(&mut ser)?;
                buf.push(b'\n');

                Ok(String::from_utf8_lossy(&buf).to_string())
            }
            other => Err(MachoCodesignError::UnsupportedOutputFormat(other.to_string())),
        }
    }
}

#[cfg(test)]
mod test {
    use {super::*, indoc::indoc};

    fn fixed() -> VersionInfo {
        VersionInfo {
            application: APPLICATION_NAME.into(),
            version: "0.1.0".into(),
            build_date: NOT_PROVIDED.into(),
            git_commit: "abc123".into(),
            git_tree_state: "clean".into(),
            platform: "linux/x86_64".into(),
            compiler: "rustc".into(),
        }
    }

    #[test]
    fn text_output() -> Result<(), MachoCodesignError> {
        assert_eq!(
            fixed().render("text")?,
            indoc! {"
                Application:   machosign
                Version:       0.1.0
                BuildDate:     [not provided]
                GitCommit:     abc123
                GitTreeState:  clean
                Platform:      linux/x86_64
                Compiler:      rustc
            "}
        );

        Ok(())
    }

    #[test]
    fn json_output() -> Result<(), MachoCodesignError> {
        assert_eq!(
            fixed().render("json")?,
            indoc! {r#"
                {
                 "application": "machosign",
                 "version": "0.1.0",
                 "buildDate": "[not provided]",
                 "gitCommit": "abc123",
                 "gitTreeState": "clean",
                 "platform": "linux/x86_64",
                 "compiler": "rustc"
                }
            "#}
        );

        Ok(())
    }

    #[test]
    fn unknown_format_rejected() {
        let err = fixed().render("yaml").unwrap_err();
        assert_eq!(err.to_string(), "unsupported output format: yaml");
    }

    #[test]
    fn build_info_defaults() {
        let info = VersionInfo::from_build();
        assert_eq!(info.version, env!("CARGO_PKG_VERSION"));
        assert_eq!(info.compiler, "rustc");
        assert!(info.platform.contains('/'));
    }
}
