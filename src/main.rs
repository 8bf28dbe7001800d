use clap::{Parser, Subcommand};
use log::LevelFilter;
use resigner::{
    installation_url, manifest_file_name, BackendKind, ManifestBuilder, ManifestRequest, Pipeline,
    PipelineConfig, ProvisioningProfile, ResignError, Result, SignatureRecord, SigningRequest,
};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "resigner")]
#[command(
    about = "iOS app re-signer - swaps the signing identity of an .ipa and emits an OTA install manifest"
)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Increase logging verbosity (repeatable)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Re-sign an .ipa with a new certificate and provisioning profile
    Sign {
        /// The .ipa to re-sign
        #[arg(short, long)]
        input: PathBuf,

        /// PKCS#12 container holding the signing certificate and key
        #[arg(short = 'c', long)]
        certificate: PathBuf,

        /// Password for the certificate container
        #[arg(long, env = "RESIGNER_P12_PASSWORD", hide_env_values = true)]
        password: String,

        /// Provisioning profile to embed
        #[arg(short, long)]
        profile: PathBuf,

        /// Device identifier to add to the embedded profile (repeatable)
        #[arg(short = 'u', long = "udid")]
        udids: Vec<String>,

        /// Output path (if unspecified, signed_<uuid>.ipa next to the input)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Base URL the signed app will be served from; enables the manifest
        #[arg(long)]
        base_url: Option<String>,

        /// Title shown in the install prompt
        #[arg(long, default_value = "Signed App")]
        title: String,

        #[arg(long)]
        icon_url: Option<String>,

        #[arg(long)]
        full_size_icon_url: Option<String>,

        /// Version reported in the manifest (defaults to the app's version)
        #[arg(long)]
        bundle_version: Option<String>,

        /// JSON pipeline configuration
        #[arg(long)]
        config: Option<PathBuf>,

        /// Signature backend: native or openssl
        #[arg(long)]
        backend: Option<BackendKind>,

        /// Timeout for each external tool invocation, in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Compression level (0-9)
        #[arg(long = "compress", value_parser = clap::value_parser!(u32).range(0..=9))]
        compress: Option<u32>,
    },
    /// Build an OTA installation manifest
    Manifest {
        #[arg(long, required = true)]
        bundle_id: String,

        /// URL the .ipa is downloadable from
        #[arg(long, required = true)]
        package_url: String,

        #[arg(long, required = true)]
        title: String,

        #[arg(long)]
        icon_url: Option<String>,

        #[arg(long)]
        full_size_icon_url: Option<String>,

        #[arg(long)]
        bundle_version: Option<String>,

        /// Output path (if unspecified, prints to stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Inspect a provisioning profile, optionally adding devices to it
    Profile {
        path: PathBuf,

        /// Device identifier to add (repeatable)
        #[arg(short = 'u', long = "udid")]
        udids: Vec<String>,

        /// Where to write the augmented profile
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(cli.command) {
        eprintln!("[!] {}", e);
        std::process::exit(1);
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level.as_str()));
    if level <= LevelFilter::Info {
        builder
            .format_timestamp(None)
            .format_target(false);
    }
    builder.init();
}

fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Sign {
            input,
            certificate,
            password,
            profile,
            udids,
            output,
            base_url,
            title,
            icon_url,
            full_size_icon_url,
            bundle_version,
            config,
            backend,
            timeout,
            compress,
        } => {
            let mut config = match config {
                Some(path) => PipelineConfig::load(path)?,
                None => PipelineConfig::default(),
            };
            if let Some(backend) = backend {
                config.backend = backend;
            }
            if let Some(timeout) = timeout {
                config.tool_timeout_secs = timeout;
            }
            if let Some(level) = compress {
                config.compression_level = level;
            }

            let mut request = SigningRequest::new(&input, &certificate, &password, &profile)?
                .with_devices(&udids)?;
            if let Some(output) = output {
                request = request.with_output(output);
            }
            if let Some(base_url) = base_url {
                let mut manifest = ManifestRequest::new(base_url, title);
                manifest.icon_url = icon_url;
                manifest.full_size_icon_url = full_size_icon_url;
                manifest.bundle_version = bundle_version;
                request = request.with_manifest(manifest)?;
            }

            run_sign(config, &request)
        }
        Commands::Manifest {
            bundle_id,
            package_url,
            title,
            icon_url,
            full_size_icon_url,
            bundle_version,
            output,
        } => {
            let manifest = ManifestBuilder::new()
                .icon_url(icon_url.as_deref())
                .full_size_icon_url(full_size_icon_url.as_deref())
                .version(bundle_version.as_deref())
                .build(&bundle_id, &package_url, &title)?;

            match output {
                Some(path) => {
                    fs::write(&path, manifest)?;
                    println!("[*] wrote {}", path.display());
                }
                None => print!("{}", String::from_utf8_lossy(&manifest)),
            }
            Ok(())
        }
        Commands::Profile { path, udids, output } => run_profile(&path, &udids, output),
    }
}

fn run_sign(config: PipelineConfig, request: &SigningRequest) -> Result<()> {
    println!("[*] signing {}", request.archive().display());
    let pipeline = Pipeline::new(config)?;
    let artifact = pipeline.run(request)?;

    for record in &artifact.report.records {
        if let SignatureRecord::Failed { path, reason } = record {
            println!("[?] could not sign {}: {}", path.display(), reason);
        }
    }
    println!(
        "[*] signed {} file(s) for {}",
        artifact.report.signed(),
        artifact.bundle_id
    );
    println!("[*] generated {}", artifact.archive_path.display());

    if let (Some(manifest), Some(info)) = (&artifact.manifest, request.manifest()) {
        let archive_name = artifact
            .archive_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let manifest_path = artifact
            .archive_path
            .parent()
            .unwrap_or(Path::new("."))
            .join(manifest_file_name(&artifact.archive_path));
        fs::write(&manifest_path, manifest)?;
        println!("[*] wrote {}", manifest_path.display());
        println!("[*] install: {}", installation_url(&info.manifest_url(&archive_name)));
    }

    Ok(())
}

fn run_profile(path: &Path, udids: &[String], output: Option<PathBuf>) -> Result<()> {
    for udid in udids {
        resigner::validate_udid(udid)?;
    }

    let mut profile = ProvisioningProfile::parse(path)?;
    if !udids.is_empty() {
        profile = profile.with_devices(udids);
    }

    println!("[*] name: {}", profile.name().unwrap_or("-"));
    println!("[*] uuid: {}", profile.uuid().unwrap_or("-"));
    println!("[*] application identifier: {}", profile.application_identifier());
    println!("[*] bundle id: {}", profile.bundle_id());
    println!("[*] team: {}", profile.team_id());
    if let Some(expires) = profile.expiration_date() {
        println!("[*] expires: {}", expires.to_xml_format());
    }
    match profile.devices() {
        Some(devices) => println!("[*] devices: {}", devices.len()),
        None => println!("[*] devices: any (no device list)"),
    }
    if profile.is_wildcard() {
        println!("[?] wildcard profile");
    }

    match output {
        Some(out) => {
            profile.write(&out)?;
            println!("[*] wrote {}", out.display());
        }
        None if !udids.is_empty() => {
            return Err(ResignError::InputValidation(
                "devices were given but no output path (-o) to write the profile to".to_string(),
            ));
        }
        None => {}
    }
    Ok(())
}
