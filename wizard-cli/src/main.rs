#![forbid(unsafe_code)]

use clap::{command, value_parser, Arg, ArgAction};
use color_eyre::eyre::{Result, WrapErr};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::util::SubscriberInitExt;

use libwizard::config::WizardConfig;
use libwizard::log::*;
use libwizard::session::LMN_PLAYBOOK;
use libwizard::WizardSession;
use url::Url;

use crate::commands::Command;

mod commands;

#[tokio::main]
async fn main() -> Result<()> {
    install_color_eyre()?;

    // Command configuration
    let matches = command!()
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Turn debugging information on. Overrides -q. Can specify up to -vvvv.")
                .action(ArgAction::Count)
                .global(true),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .help("Silence all output. Overridden by -v.")
                .action(ArgAction::SetTrue)
                .global(true),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .help("Path to the wizard config file. Defaults apply without one.")
                .global(true),
        )
        .arg(
            Arg::new("base-url")
                .long("base-url")
                .help("Installer backend origin. Overrides the config file.")
                .value_parser(value_parser!(Url))
                .global(true),
        )
        .subcommand(command!("check").about("Run the installer health checks."))
        .subcommand(
            command!("token")
                .about("Verify a setup token.")
                .arg(Arg::new("token").help("The token to check.").required(true)),
        )
        .subcommand(
            command!("bootstrap")
                .about("Bootstrap a fresh linuxmuster.net server over SSH.")
                .arg(
                    Arg::new("host")
                        .help("Address of the server. Prompted for if missing.")
                        .long("host"),
                )
                .arg(
                    Arg::new("port")
                        .help("SSH port.")
                        .short('p')
                        .long("port")
                        .value_parser(value_parser!(u16))
                        .default_value("22"),
                )
                .arg(
                    Arg::new("user")
                        .help("SSH user.")
                        .short('u')
                        .long("user")
                        .default_value("root"),
                )
                .arg(
                    Arg::new("password-file")
                        .help("File holding the SSH password. Prompted for if missing.")
                        .long("password-file"),
                ),
        )
        .subcommand(
            command!("requirements")
                .about("Show the server requirement checks for a playbook.")
                .arg(
                    Arg::new("playbook")
                        .help("Playbook to evaluate.")
                        .long("playbook")
                        .default_value(LMN_PLAYBOOK),
                ),
        )
        .subcommand(
            command!("install")
                .about("Run the linuxmuster.net install playbook and follow its output.")
                .arg(
                    Arg::new("vars")
                        .help("Path to the server settings file (YAML).")
                        .long("vars")
                        .required(true),
                )
                .arg(
                    Arg::new("playbook")
                        .help("Playbook to run.")
                        .long("playbook")
                        .default_value(LMN_PLAYBOOK),
                )
                .arg(
                    Arg::new("skip-requirements")
                        .help("Start even if the requirement checks did not pass.")
                        .long("skip-requirements")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(
            command!("configure")
                .about("Submit the edulution configuration.")
                .arg(
                    Arg::new("answers")
                        .help("Path to the configuration answers file (YAML).")
                        .long("answers")
                        .required(true),
                )
                .arg(
                    Arg::new("admin-group")
                        .help("Group whose members become edulution admins.")
                        .long("admin-group"),
                ),
        )
        .subcommand(
            command!("finish")
                .about("Commit the setup, restart and wait for the application."),
        )
        .subcommand_required(true)
        .get_matches();

    // Set up logging
    let logging_config = tracing_subscriber::fmt::SubscriberBuilder::default()
        .with_timer(tracing_subscriber::fmt::time::UtcTime::new(
            time::macros::format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"),
        ))
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::NONE)
        .with_writer(std::io::stderr)
        .compact();

    let quiet = matches.get_flag("quiet");
    let verbose = matches.get_count("verbose") as usize;
    let logging_config = if quiet && verbose == 0 {
        logging_config.with_max_level(LevelFilter::ERROR)
    } else if verbose > 0 {
        let level = match verbose {
            1 => LevelFilter::WARN,
            2 => LevelFilter::INFO,
            3 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        };
        logging_config.with_max_level(level)
    } else {
        logging_config.with_max_level(LevelFilter::ERROR)
    };

    let subscriber = logging_config.finish();
    subscriber.init();

    // Build the session
    let config = match matches.get_one::<String>("config") {
        Some(path) => WizardConfig::load(path)
            .await
            .wrap_err_with(|| format!("Failed loading config from {path}"))?,
        None => WizardConfig::default(),
    };
    let config = match matches.get_one::<Url>("base-url") {
        Some(base_url) => config.with_base_url(base_url.clone()),
        None => config,
    };
    debug!("using backend at {}", config.base_url());
    let session = WizardSession::new(config).wrap_err("Failed setting up the wizard session")?;

    // Run the commands
    if let Some((subcommand, matches)) = matches.subcommand() {
        let ctx = commands::CliContext::new(session, matches);
        debug!(
            "matched subcommand {} with matches: {:?}",
            &subcommand,
            &matches.ids().map(|id| id.as_str()).collect::<Vec<_>>()
        );
        match subcommand {
            "check" => commands::check::CheckCommand::new().run(&ctx).await?,
            "token" => commands::check::TokenCommand::new().run(&ctx).await?,
            "bootstrap" => commands::lmn::BootstrapCommand::new().run(&ctx).await?,
            "requirements" => commands::lmn::RequirementsCommand::new().run(&ctx).await?,
            "install" => commands::lmn::InstallCommand::new().run(&ctx).await?,
            "configure" => commands::setup::ConfigureCommand::new().run(&ctx).await?,
            "finish" => commands::setup::FinishCommand::new().run(&ctx).await?,
            _ => Err(commands::CommandErrors::InvalidSubcommand(subcommand.into()))?,
        }
    }
    Ok(())
}
