// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    clap::{Arg, ArgMatches, Command},
    log::{warn, LevelFilter},
    macho_codesign::{
        app_store_connect::{api_token::ConnectTokenEncoder, UnifiedApiKey},
        eventloop::{interrupt_token, run_event_loop},
        stapling::Stapler,
        ticket_lookup::ticket_record_name,
        ui::{LoggingUx, TerminalUx, Ux},
        version::VersionInfo,
        AppStoreNotaryService, CodeSignatureFlags, CodeSigningSlot, DigestType, EmbeddedSignature,
        EventSink, MachOFile, MachoCodesignError, NotarizeError, Notarizer, NotarizerConfig,
        SettingsScope, SigningCredentials, SigningIdentity, SigningSettings, UnifiedSigner,
    },
    std::{
        path::{Path, PathBuf},
        str::FromStr,
        sync::Arc,
        time::Duration,
    },
    tokio::sync::mpsc,
};

const SIGN_ABOUT: &str = "\
Adds a code signature to a Mach-O binary.

The signature is ad-hoc unless a certificate and private key are given
with --pem-source. PEM files may hold any mix of CERTIFICATE and PRIVATE KEY
sections. The first certificate is the signing certificate; any others form
its issuing chain.

Settings that take a value can be scoped to a specific slice of a fat
binary by prefixing the value with a scope:

  @main                 all slices (the default)
  @0, @1, ...           the slice at that index
  @[cpu_type=arm64]     slices of that CPU type

e.g. `--binary-identifier @1:com.example.tool-x86`.

An existing signature is replaced. Its identifier, flags, runtime version and
entitlements are carried over unless overridden.

If no output path is given, the input is signed in place. Files are always
replaced atomically.
";

const NOTARIZE_ABOUT: &str = "\
Submits a signed Mach-O binary to Apple for notarization.

The binary is archived, uploaded to Apple, and the notary service is polled
until it reaches a verdict. On acceptance the notarization ticket is stapled
to the binary.

Authentication uses an App Store Connect API key. Either pass the JSON file
produced by `encode-api-key` with --api-key-path, or pass --api-issuer and
--api-key to locate an AuthKey_<id>.p8 file in one of the directories Apple
tools search.

If waiting is interrupted or exceeds --max-wait-seconds, the submission keeps
processing remotely. Use --resume <submission id> to continue waiting on it.
";

const ENCODE_API_KEY_ABOUT: &str = "\
Encode App Store Connect API Key metadata to a single JSON file.

App Store Connect API keys consist of an issuer ID, a key ID and a private
key. Storing all three in one file makes the key easier to pass around.

The file contains the private key and should be guarded accordingly. When
written with --output-path it is only readable by its owner.
";

fn required<'a>(args: &'a ArgMatches, name: &str) -> Result<&'a str, MachoCodesignError> {
    args.value_of(name)
        .ok_or_else(|| MachoCodesignError::CliGeneralError(format!("missing argument: {}", name)))
}

fn parse_scoped_value(s: &str) -> Result<(SettingsScope, &str), MachoCodesignError> {
    match s.split_once(':') {
        Some((scope, value)) if scope.starts_with('@') => {
            Ok((SettingsScope::try_from(scope)?, value))
        }
        _ => Ok((SettingsScope::Main, s)),
    }
}

fn read_path(path: &str) -> Result<Vec<u8>, MachoCodesignError> {
    std::fs::read(path).map_err(|e| MachoCodesignError::io(path, e))
}

fn command_encode_api_key(args: &ArgMatches) -> Result<(), MachoCodesignError> {
    let issuer_id = required(args, "issuer_id")?;
    let key_id = required(args, "key_id")?;
    let private_key_path = required(args, "private_key_path")?;

    let unified = UnifiedApiKey::from_ecdsa_pem_path(issuer_id, key_id, private_key_path)?;

    if let Some(output_path) = args.value_of("output_path") {
        let output_path = Path::new(output_path);

        eprintln!("writing unified key JSON to {}", output_path.display());
        unified.write_json_file(output_path)?;
    } else {
        println!("{}", unified.to_json_string()?);
    }

    Ok(())
}

fn print_signature(index: usize, arch_name: &str, signature: &EmbeddedSignature) -> Result<(), MachoCodesignError> {
    println!("slice {} ({}):", index, arch_name);

    if let Some(cd) = signature.code_directory()? {
        println!("  identifier: {}", cd.ident);
        if let Some(team) = &cd.team_name {
            println!("  team id: {}", team);
        }
        println!("  code directory version: {:#x}", cd.version);
        println!("  flags: {:?}", cd.flags);
        println!("  digest: {}", cd.hash_type);
        println!("  page size: {}", cd.page_size);
        println!("  code limit: {}", cd.code_limit);
        if let Some(runtime) = cd.runtime {
            println!("  runtime: {:#x}", runtime);
        }
        if let Some(flags) = cd.exec_seg_flags {
            println!("  executable segment flags: {:?}", flags);
        }
        println!("  cdhash: {}", hex::encode(cd.cdhash()?));
        println!("  ticket record: {}", ticket_record_name(&cd)?);
        for (slot, digest) in &cd.special_hashes {
            println!("  special slot {:?}: {}", slot, hex::encode(&digest.data));
        }
        println!("  code slots: {}", cd.code_hashes.len());
    } else {
        println!("  no code directory");
    }

    if let Some(reqs) = signature.code_requirements()? {
        for (typ, blob) in &reqs.requirements {
            println!("  {} requirement: {}", typ, blob.parse_requirement()?);
        }
    }

    if let Some(entitlements) = signature.entitlements()? {
        println!("  entitlements:");
        for line in entitlements.as_str().lines() {
            println!("    {}", line);
        }
    }

    match signature.signed_data()? {
        Some(signed_data) => println!("  cms signers: {}", signed_data.signers().count()),
        None => println!("  cms signature: none (ad-hoc)"),
    }

    if let Some(entry) = signature.find_slot(CodeSigningSlot::Ticket) {
        println!("  stapled ticket: {} bytes", entry.length);
    }

    Ok(())
}

fn command_print_signature(args: &ArgMatches) -> Result<(), MachoCodesignError> {
    let path = required(args, "path")?;
    let macho = MachOFile::parse(read_path(path)?)?;

    for (index, arch) in macho.arches().iter().enumerate() {
        match macho.code_signature(index)? {
            Some(signature) => print_signature(index, &arch.arch_name(), &signature)?,
            None => println!("slice {} ({}): unsigned", index, arch.arch_name()),
        }
    }

    Ok(())
}

fn command_sign(args: &ArgMatches) -> Result<(), MachoCodesignError> {
    let mut settings = SigningSettings::default();

    if let Some(values) = args.values_of("pem_source") {
        let credentials = SigningCredentials::from_pem_files(values)?;

        warn!("registering signing key");
        settings.set_identity(SigningIdentity::Certificate(Arc::new(credentials)));

        if let Some(team_id) = settings.set_team_id_from_signing_certificate() {
            warn!(
                "automatically setting team ID from signing certificate: {}",
                team_id
            );
        }
    } else {
        warn!("no signing key given; creating an ad-hoc signature");
    }

    if let Some(team_name) = args.value_of("team_name") {
        settings.set_team_id(team_name);
    }

    if let Some(value) = args.value_of("digest") {
        settings.set_digest_type(DigestType::try_from(value)?)?;
    }

    if let Some(value) = args.value_of("page_size") {
        let page_size = usize::from_str(value).map_err(|_| {
            MachoCodesignError::CliGeneralError(format!("invalid page size: {}", value))
        })?;
        settings.set_page_size(page_size)?;
    }

    if let Some(values) = args.values_of("binary_identifier") {
        for value in values {
            let (scope, identifier) = parse_scoped_value(value)?;
            settings.set_binary_identifier(scope, identifier);
        }
    }

    if let Some(values) = args.values_of("code_requirements_path") {
        for value in values {
            let (scope, path) = parse_scoped_value(value)?;

            warn!("setting designated requirement for {} from {}", scope, path);
            settings.set_designated_requirement_bytes(scope, read_path(path)?)?;
        }
    }

    if let Some(values) = args.values_of("code_signature_flags_set") {
        for value in values {
            let (scope, value) = parse_scoped_value(value)?;

            let flags = CodeSignatureFlags::from_str(value)?;
            settings.add_code_signature_flags(scope, flags);
        }
    }

    if let Some(values) = args.values_of("entitlements_xml_path") {
        for value in values {
            let (scope, path) = parse_scoped_value(value)?;

            warn!("setting entitlements XML for {} from path {}", scope, path);
            let entitlements_data = std::fs::read_to_string(path)
                .map_err(|e| MachoCodesignError::io(path, e))?;
            settings.set_entitlements_xml(scope, entitlements_data)?;
        }
    }

    if let Some(values) = args.values_of("runtime_version") {
        for value in values {
            let (scope, value) = parse_scoped_value(value)?;

            let version = semver::Version::parse(value)?;
            settings.set_runtime_version(scope, version);
        }
    }

    if let Some(values) = args.values_of("info_plist_path") {
        for value in values {
            let (scope, path) = parse_scoped_value(value)?;

            settings.set_info_plist_data(scope, read_path(path)?);
        }
    }

    let input_path = PathBuf::from(required(args, "input_path")?);
    let output_path = args.value_of("output_path");

    let signer = UnifiedSigner::new(settings);

    if let Some(output_path) = output_path {
        warn!("signing {} to {}", input_path.display(), output_path);
        signer.sign_path(input_path, output_path)?;
    } else {
        warn!("signing {} in place", input_path.display());
        signer.sign_path_in_place(input_path)?;
    }

    Ok(())
}

fn token_encoder_from_args(args: &ArgMatches) -> Result<ConnectTokenEncoder, MachoCodesignError> {
    if let Some(path) = args.value_of("api_key_path") {
        ConnectTokenEncoder::try_from(UnifiedApiKey::from_json_path(path)?)
    } else if let (Some(issuer), Some(key)) = (args.value_of("api_issuer"), args.value_of("api_key")) {
        ConnectTokenEncoder::from_api_key_id(key.to_string(), issuer.to_string())
    } else {
        Err(MachoCodesignError::CliGeneralError(
            "App Store Connect API key required; see --api-key-path or --api-issuer/--api-key"
                .into(),
        ))
    }
}

fn command_notarize(args: &ArgMatches) -> Result<(), MachoCodesignError> {
    let path = PathBuf::from(required(args, "path")?);
    let staple = !args.is_present("no_staple");
    let resume = args.value_of("resume").map(|s| s.to_string());
    let max_wait_seconds = required(args, "max_wait_seconds")?;
    let max_wait_seconds = u64::from_str(max_wait_seconds).map_err(|_| {
        MachoCodesignError::CliGeneralError(format!("invalid wait limit: {}", max_wait_seconds))
    })?;

    let config = NotarizerConfig {
        deadline: Duration::from_secs(max_wait_seconds),
        submission_name: args.value_of("submission_name").map(|s| s.to_string()),
        ..Default::default()
    };

    let service = AppStoreNotaryService::new(token_encoder_from_args(args)?, config.call_timeout)?;

    let runtime = tokio::runtime::Runtime::new()?;

    runtime.block_on(async move {
        let cancel = interrupt_token();
        let (events, events_rx) = EventSink::channel();
        let (errors, errors_rx) = mpsc::unbounded_channel();

        let mut notarizer = Notarizer::new(service, config);
        notarizer.set_event_sink(events);
        notarizer.set_cancel_token(cancel.clone());

        let worker_path = path.clone();
        let worker = tokio::spawn(async move {
            let res = match resume {
                Some(id) if staple => notarizer
                    .resume_path(&worker_path, &id)
                    .await
                    .map(|outcome| outcome.staple_warning),
                Some(id) => notarizer.resume(&id).await.map(|_| None),
                None if staple => notarizer
                    .notarize_path(&worker_path)
                    .await
                    .map(|outcome| outcome.staple_warning),
                None => {
                    let data = std::fs::read(&worker_path)
                        .map_err(|e| MachoCodesignError::io(&worker_path, e))?;
                    let name = worker_path
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_else(|| "binary".to_string());

                    notarizer.notarize_data(&name, &data).await.map(|_| None)
                }
            };

            let resumable = match &res {
                Err(MachoCodesignError::Notarize(e)) if e.is_retryable() => {
                    Some(e.submission_id().to_string())
                }
                _ => None,
            };

            match res {
                Ok(Some(staple_warning)) => {
                    let _ = errors.send(staple_warning.into());
                }
                Ok(None) => {}
                Err(e) => {
                    let _ = errors.send(e);
                }
            }

            Ok::<_, MachoCodesignError>(resumable)
        });

        let uxs: Vec<Box<dyn Ux>> = vec![Box::new(TerminalUx::default()), Box::new(LoggingUx::default())];
        let res = run_event_loop(cancel, errors_rx, events_rx, None, uxs).await;

        // An interrupted upload still runs to completion.
        match worker.await {
            Ok(Ok(Some(id))) => eprintln!(
                "submission {} is still processing; resume with `--resume {}`",
                id, id
            ),
            Ok(Ok(None)) => {}
            Ok(Err(e)) => return Err(e),
            Err(e) => return Err(MachoCodesignError::CliGeneralError(e.to_string())),
        }

        match res {
            Err(e) if e.is_warning() => {
                warn!("{}", e);
                Ok(())
            }
            Err(MachoCodesignError::Notarize(NotarizeError::Cancelled { .. })) | Ok(()) => Ok(()),
            Err(e) => Err(e),
        }
    })
}

fn command_staple(args: &ArgMatches) -> Result<(), MachoCodesignError> {
    let path = required(args, "path")?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let stapler = Stapler::new(Duration::from_secs(60))?;
        stapler.staple_path(path).await
    })
}

fn command_version(args: &ArgMatches) -> Result<(), MachoCodesignError> {
    let format = required(args, "output")?;

    print!("{}", VersionInfo::from_build().render(format)?);

    Ok(())
}

fn main_impl() -> Result<(), MachoCodesignError> {
    let app = Command::new("machosign")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Sign and notarize Mach-O binaries")
        .arg_required_else_help(true)
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .global(true)
                .multiple_occurrences(true)
                .help("Increase logging verbosity. Can be specified multiple times."),
        );

    let app = app.subcommand(
        Command::new("encode-api-key")
            .about("Encode App Store Connect API Key metadata to a single file")
            .long_about(ENCODE_API_KEY_ABOUT)
            .arg(
                Arg::new("output_path")
                    .short('o')
                    .long("output-path")
                    .takes_value(true)
                    .help("Path to a JSON file to create the output to"),
            )
            .arg(
                Arg::new("issuer_id")
                    .required(true)
                    .help("The issuer of the API Token. Likely a UUID"),
            )
            .arg(
                Arg::new("key_id")
                    .required(true)
                    .help("The Key ID. A short alphanumeric string like DEADBEEF42"),
            )
            .arg(
                Arg::new("private_key_path")
                    .required(true)
                    .help("Path to a file containing the private key downloaded from Apple"),
            ),
    );

    let app = app.subcommand(
        Command::new("notarize")
            .about("Upload a binary to Apple for notarization and staple the result")
            .long_about(NOTARIZE_ABOUT)
            .arg(
                Arg::new("api_key_path")
                    .long("api-key-path")
                    .takes_value(true)
                    .conflicts_with_all(&["api_issuer", "api_key"])
                    .help("Path to a JSON file produced by `encode-api-key`"),
            )
            .arg(
                Arg::new("api_issuer")
                    .long("api-issuer")
                    .takes_value(true)
                    .requires("api_key")
                    .help("App Store Connect Issuer ID (likely a UUID)"),
            )
            .arg(
                Arg::new("api_key")
                    .long("api-key")
                    .takes_value(true)
                    .requires("api_issuer")
                    .help("App Store Connect API Key ID"),
            )
            .arg(
                Arg::new("max_wait_seconds")
                    .long("max-wait-seconds")
                    .takes_value(true)
                    .default_value("600")
                    .help("Maximum time in seconds to wait for the notarization verdict"),
            )
            .arg(
                Arg::new("submission_name")
                    .long("submission-name")
                    .takes_value(true)
                    .help("Name to give the submission (defaults to the archive name)"),
            )
            .arg(
                Arg::new("resume")
                    .long("resume")
                    .takes_value(true)
                    .help("Wait on an existing submission instead of creating a new one"),
            )
            .arg(
                Arg::new("no_staple")
                    .long("no-staple")
                    .help("Do not staple the notarization ticket after acceptance"),
            )
            .arg(
                Arg::new("path")
                    .takes_value(true)
                    .required(true)
                    .help("Path to the signed Mach-O binary"),
            ),
    );

    let app = app.subcommand(
        Command::new("print-signature")
            .about("Print the code signature of a Mach-O binary")
            .arg(
                Arg::new("path")
                    .required(true)
                    .help("Path of Mach-O binary to examine"),
            ),
    );

    let app = app.subcommand(
        Command::new("sign")
            .about("Sign a Mach-O binary")
            .long_about(SIGN_ABOUT)
            .arg(
                Arg::new("pem_source")
                    .long("pem-source")
                    .takes_value(true)
                    .multiple_occurrences(true)
                    .number_of_values(1)
                    .help("Path to a PEM file holding the signing certificate, chain or private key"),
            )
            .arg(
                Arg::new("binary_identifier")
                    .long("binary-identifier")
                    .takes_value(true)
                    .multiple_occurrences(true)
                    .number_of_values(1)
                    .help("Identifier string for binary. The value normally used by CFBundleIdentifier"),
            )
            .arg(
                Arg::new("code_requirements_path")
                    .long("code-requirements-path")
                    .takes_value(true)
                    .multiple_occurrences(true)
                    .number_of_values(1)
                    .help("Path to a file containing a compiled designated requirement"),
            )
            .arg(
                Arg::new("code_signature_flags_set")
                    .long("code-signature-flags")
                    .takes_value(true)
                    .multiple_occurrences(true)
                    .number_of_values(1)
                    .help("Code signature flags to set (host, hard, kill, expires, library, runtime)"),
            )
            .arg(
                Arg::new("digest")
                    .long("digest")
                    .possible_values(&["sha1", "sha256", "sha384"])
                    .takes_value(true)
                    .default_value("sha256")
                    .help("Digest algorithm to use"),
            )
            .arg(
                Arg::new("page_size")
                    .long("page-size")
                    .takes_value(true)
                    .help("Size of code pages to digest (a power of two; defaults to 4096)"),
            )
            .arg(
                Arg::new("entitlements_xml_path")
                    .long("entitlements-xml-path")
                    .short('e')
                    .takes_value(true)
                    .multiple_occurrences(true)
                    .number_of_values(1)
                    .help("Path to a plist file containing entitlements"),
            )
            .arg(
                Arg::new("runtime_version")
                    .long("runtime-version")
                    .takes_value(true)
                    .multiple_occurrences(true)
                    .number_of_values(1)
                    .help("Hardened runtime version to use (defaults to SDK version used to build binary)"),
            )
            .arg(
                Arg::new("info_plist_path")
                    .long("info-plist-path")
                    .takes_value(true)
                    .multiple_occurrences(true)
                    .number_of_values(1)
                    .help("Path to an Info.plist file whose digest to include in Mach-O signature"),
            )
            .arg(
                Arg::new("team_name")
                    .long("team-name")
                    .takes_value(true)
                    .help("Team name/identifier to include in code signature"),
            )
            .arg(
                Arg::new("input_path")
                    .required(true)
                    .help("Path to Mach-O binary to sign"),
            )
            .arg(
                Arg::new("output_path")
                    .help("Path to signed Mach-O binary to write"),
            ),
    );

    let app = app.subcommand(
        Command::new("staple")
            .about("Staples a notarization ticket to a signed Mach-O binary")
            .arg(
                Arg::new("path")
                    .required(true)
                    .help("Path to binary to attempt to staple"),
            ),
    );

    let app = app.subcommand(
        Command::new("version")
            .about("Show the version")
            .arg(
                Arg::new("output")
                    .short('o')
                    .long("output")
                    .takes_value(true)
                    .default_value("text")
                    .help("Format to show version information (available=[text, json])"),
            ),
    );

    let matches = app.get_matches();

    let log_level = match matches.occurrences_of("verbose") {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(log_level.as_str()),
    );

    // Disable log context except at higher log levels.
    if log_level <= LevelFilter::Info {
        builder
            .format_timestamp(None)
            .format_level(false)
            .format_target(false);
    }

    // These spew unwanted output. Nerf them unless tracing.
    if log_level < LevelFilter::Trace {
        for module in [
            "rustls",
            "hyper",
            "aws_config",
            "aws_http",
            "aws_sdk_s3",
            "aws_smithy_client",
            "aws_smithy_http",
        ] {
            builder.filter_module(module, LevelFilter::Warn);
        }
    }

    builder.init();

    match matches.subcommand() {
        Some(("encode-api-key", args)) => command_encode_api_key(args),
        Some(("notarize", args)) => command_notarize(args),
        Some(("print-signature", args)) => command_print_signature(args),
        Some(("sign", args)) => command_sign(args),
        Some(("staple", args)) => command_staple(args),
        Some(("version", args)) => command_version(args),
        _ => Err(MachoCodesignError::CliGeneralError("unknown command".into())),
    }
}

fn main() {
    let exit_code = match main_impl() {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("Error: {}", err);
            1
        }
    };

    std::process::exit(exit_code)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn scoped_values() -> Result<(), MachoCodesignError> {
        assert_eq!(
            parse_scoped_value("com.example.tool")?,
            (SettingsScope::Main, "com.example.tool")
        );
        assert_eq!(
            parse_scoped_value("@1:com.example.x86")?,
            (SettingsScope::MultiArchIndex(1), "com.example.x86")
        );
        // Colons in values without a scope are kept.
        assert_eq!(
            parse_scoped_value("C:/entitlements.plist")?,
            (SettingsScope::Main, "C:/entitlements.plist")
        );

        Ok(())
    }
}
