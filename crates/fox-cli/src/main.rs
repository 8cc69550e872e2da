//! Command-line interface for fox.
//!
//! Builds and re-signs iOS application archives and manages the provisioning
//! profiles and keychains they are signed with.

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use fox::config::expand_tilde;
use fox::{
    BuildParams, BuildPipeline, ConfigFile, Keychains, Packaging, Preset, ProfileStore,
    ResignParams, Resigner, Settings,
};
use log::{error, info, LevelFilter};
use secrecy::SecretString;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "fox", version)]
#[command(about = "Build, package and re-sign iOS application archives")]
struct Cli {
    /// Path to fox config, defaults to '~/.fox'
    #[arg(short = 'C', value_name = "PATH", global = true)]
    config_path: Option<PathBuf>,

    /// Increase logging verbosity. Can be specified multiple times
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a signed ipa file
    Ipa(IpaArgs),
    /// Resign an ipa file
    Resign(ResignArgs),
    /// Install a provisioning profile
    InstallProfile { profile_path: PathBuf },
    /// List installed provisioning profiles
    ListProfiles,
    /// Get the path(s) of provisioning profiles by name
    FindProfiles {
        /// Treat the name as a glob pattern
        #[arg(short, long)]
        pattern: bool,
        name: String,
    },
    /// Display the UUID of a provisioning profile by path
    ProfileUuid { path: PathBuf },
    /// Install a keychain file
    InstallKeychain { keychain_path: PathBuf },
    /// Unlock a keychain
    UnlockKeychain {
        /// Keychain name or path
        keychain: String,
        /// Keychain password
        #[arg(default_value = "")]
        password: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum PackagingArg {
    PackageApplication,
    Resign,
}

impl From<PackagingArg> for Packaging {
    fn from(arg: PackagingArg) -> Self {
        match arg {
            PackagingArg::PackageApplication => Packaging::PackageApplication,
            PackagingArg::Resign => Packaging::Resign,
        }
    }
}

#[derive(Args)]
struct IpaArgs {
    /// Preset from the config file supplying defaults
    #[arg(long)]
    preset: Option<String>,
    #[arg(long)]
    project: Option<PathBuf>,
    #[arg(long)]
    target: Option<String>,
    #[arg(long)]
    workspace: Option<PathBuf>,
    #[arg(long)]
    scheme: Option<String>,
    /// Build configuration
    #[arg(long)]
    config: Option<String>,
    /// Signing identity
    #[arg(long)]
    identity: Option<String>,
    /// Provisioning profile path, name or pattern
    #[arg(long)]
    profile: Option<String>,
    /// Keychain name or path
    #[arg(long)]
    keychain: Option<String>,
    /// Unlock the keychain with this password for the build
    #[arg(long)]
    keychain_password: Option<String>,
    /// Output file or directory; may contain ${app_name} style tokens
    #[arg(long)]
    output: Option<String>,
    #[arg(long)]
    clean: bool,
    #[arg(long)]
    overwrite: bool,
    /// Also archive the dSYM next to the ipa
    #[arg(long)]
    dsym: bool,
    #[arg(long, alias = "build_dir")]
    build_dir: Option<PathBuf>,
    #[arg(long)]
    sdk: Option<String>,
    #[arg(long, value_enum)]
    packaging: Option<PackagingArg>,
}

impl IpaArgs {
    fn params(self) -> BuildParams {
        BuildParams {
            workspace: self.workspace,
            scheme: self.scheme,
            project: self.project,
            target: self.target,
            config: self.config,
            profile: self.profile,
            identity: self.identity,
            keychain: self.keychain,
            keychain_password: self.keychain_password.map(SecretString::new),
            output: self.output,
            overwrite: self.overwrite.then_some(true),
            build_dir: self.build_dir,
            dsym: self.dsym.then_some(true),
            clean: self.clean.then_some(true),
            sdk: self.sdk,
            packaging: self.packaging.map(Packaging::from),
        }
    }
}

#[derive(Args)]
struct ResignArgs {
    /// Preset from the config file supplying defaults
    #[arg(long)]
    preset: Option<String>,
    #[arg(long)]
    ipa: Option<PathBuf>,
    #[arg(long)]
    identity: Option<String>,
    /// Provisioning profile path, name or pattern
    #[arg(long)]
    profile: Option<String>,
    #[arg(long)]
    keychain: Option<String>,
    #[arg(long)]
    bundle_id: Option<String>,
    /// Entitlements plist used instead of the profile's
    #[arg(long)]
    entitlements: Option<PathBuf>,
    #[arg(long)]
    resource_rules: Option<PathBuf>,
    /// Output file or directory
    #[arg(long)]
    output: Option<String>,
    #[arg(long)]
    overwrite: bool,
    /// Keep the profile's keychain-access-groups as they are
    #[arg(long)]
    keep_keychain_groups: bool,
    /// Do not fail when the bundle has no existing signature
    #[arg(long)]
    allow_unsigned: bool,
    /// Match the profile by exact name only
    #[arg(long)]
    exact: bool,
    /// Configuration name used in output file names
    #[arg(long)]
    config: Option<String>,
}

impl ResignArgs {
    fn params(self) -> ResignParams {
        ResignParams {
            ipa: self.ipa,
            profile: self.profile,
            identity: self.identity,
            keychain: self.keychain,
            bundle_id: self.bundle_id,
            entitlements: self.entitlements,
            resource_rules: self.resource_rules,
            output: self.output,
            overwrite: self.overwrite.then_some(true),
            narrow_keychain_groups: self.keep_keychain_groups.then_some(false),
            allow_unsigned: self.allow_unsigned.then_some(true),
            pattern_match: self.exact.then_some(false),
            config: self.config,
        }
    }
}

/// Everything a command needs from the environment.
struct Context {
    settings: Settings,
    config: ConfigFile,
}

impl Context {
    fn load(config_path: Option<PathBuf>) -> fox::Result<Self> {
        let mut settings = Settings::from_home();
        if let Some(path) = config_path {
            settings.config_path = expand_tilde(path);
        }

        let config = ConfigFile::load_or_default(&settings.config_path)?;
        settings.apply(&config.settings()?);

        Ok(Self { settings, config })
    }

    fn preset(&self, name: Option<&str>) -> fox::Result<Option<Preset>> {
        let Some(name) = name else {
            return Ok(None);
        };
        if !self.settings.config_path.exists() {
            return Err(fox::Error::Config(format!(
                "preset '{}' requested but {} does not exist",
                name,
                self.settings.config_path.display()
            )));
        }
        match self.config.preset(name)? {
            Some(preset) => {
                info!("using preset '{}'", name);
                Ok(Some(preset))
            }
            None => Err(fox::Error::Config(format!(
                "no preset '{}' in {} (have: {})",
                name,
                self.settings.config_path.display(),
                self.config.preset_names().join(", ")
            ))),
        }
    }
}

fn command_ipa(ctx: &Context, args: IpaArgs) -> fox::Result<()> {
    let preset = ctx.preset(args.preset.as_deref())?;
    let mut params = args.params();
    if let Some(ref preset) = preset {
        params = params.with_preset(preset);
    }

    let output = BuildPipeline::new(&ctx.settings).run(&params)?;
    println!("{}", output.ipa.display());
    if let Some(dsym) = output.dsym {
        println!("{}", dsym.display());
    }
    Ok(())
}

fn command_resign(ctx: &Context, args: ResignArgs) -> fox::Result<()> {
    let preset = ctx.preset(args.preset.as_deref())?;
    let mut params = args.params();
    if let Some(ref preset) = preset {
        params = params.with_preset(preset);
    }

    let output = Resigner::new(&ctx.settings).run(&params)?;
    println!("{}", output.display());
    Ok(())
}

fn command_list_profiles(ctx: &Context) -> fox::Result<()> {
    let store = ProfileStore::new(&ctx.settings);
    println!("{}:", store.dir().display());

    let listing = match store.list() {
        Ok(listing) => listing,
        Err(e) if e.is_not_found() => {
            error!("Path '{}' does not exist.", store.dir().display());
            return Ok(());
        }
        Err(e) => return Err(e),
    };
    for line in listing {
        println!("{}", line?);
    }
    Ok(())
}

fn command_find_profiles(ctx: &Context, name: &str, pattern: bool) -> fox::Result<()> {
    let paths = ProfileStore::new(&ctx.settings).find_all(name, pattern)?;
    if paths.is_empty() {
        error!("No matching profiles found.");
    }
    for path in paths {
        println!("{}", path.display());
    }
    Ok(())
}

fn main_impl() -> fox::Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
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

    builder.init();

    let ctx = Context::load(cli.config_path)?;

    match cli.command {
        Command::Ipa(args) => command_ipa(&ctx, args),
        Command::Resign(args) => command_resign(&ctx, args),
        Command::InstallProfile { profile_path } => {
            let dest = ProfileStore::new(&ctx.settings).install(profile_path)?;
            println!("{}", dest.display());
            Ok(())
        }
        Command::ListProfiles => command_list_profiles(&ctx),
        Command::FindProfiles { pattern, name } => command_find_profiles(&ctx, &name, pattern),
        Command::ProfileUuid { path } => {
            println!("{}", ProfileStore::new(&ctx.settings).uuid(path)?);
            Ok(())
        }
        Command::InstallKeychain { keychain_path } => {
            let dest = Keychains::new(&ctx.settings).install(keychain_path, true)?;
            println!("{}", dest.display());
            Ok(())
        }
        Command::UnlockKeychain { keychain, password } => {
            let keychains = Keychains::new(&ctx.settings);
            let path = keychains.resolve(&keychain)?;
            keychains.unlock(&path, &SecretString::new(password))
        }
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
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_resign_flags_only_set_when_given() {
        let cli = Cli::parse_from(["fox", "resign", "--ipa", "App.ipa", "--exact"]);
        let Command::Resign(args) = cli.command else {
            panic!("expected resign");
        };
        let params = args.params();

        assert_eq!(params.ipa, Some(PathBuf::from("App.ipa")));
        assert_eq!(params.pattern_match, Some(false));
        assert_eq!(params.overwrite, None);
        assert_eq!(params.narrow_keychain_groups, None);
    }

    #[test]
    fn test_ipa_packaging_and_password() {
        let cli = Cli::parse_from([
            "fox",
            "-C",
            "/tmp/fox.toml",
            "-vv",
            "ipa",
            "--workspace",
            "App.xcworkspace",
            "--scheme",
            "App",
            "--packaging",
            "resign",
            "--keychain-password",
            "hunter2",
        ]);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.config_path, Some(PathBuf::from("/tmp/fox.toml")));

        let Command::Ipa(args) = cli.command else {
            panic!("expected ipa");
        };
        let params = args.params();
        assert_eq!(params.packaging, Some(Packaging::Resign));
        assert!(params.keychain_password.is_some());
        assert_eq!(params.dsym, None);
    }
}
